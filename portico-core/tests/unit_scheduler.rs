//! Unit tests for leadership-gated scheduling
//!
//! Tests that ticks only run while leading and stop on standby.

use async_trait::async_trait;
use portico_core::coordination::MemoryEnsemble;
use portico_core::coordinator::{LeaderElector, WorkerScheduler};
use portico_core::error::{PorticoError, Result};
use portico_core::runtime::ShutdownSignal;
use portico_core::worker::Worker;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct CountingWorker {
    name: &'static str,
    interval: Duration,
    ticks: AtomicU32,
    fail_with_lost: bool,
}

impl CountingWorker {
    fn new(name: &'static str, interval_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            interval: Duration::from_millis(interval_ms),
            ticks: AtomicU32::new(0),
            fail_with_lost: false,
        })
    }

    fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for CountingWorker {
    fn name(&self) -> &'static str {
        self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) -> Result<()> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        if self.fail_with_lost {
            return Err(PorticoError::LeadershipLost {
                operation: "test".into(),
            });
        }
        Ok(())
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_ticks_follow_leadership() {
    let ensemble = MemoryEnsemble::new();
    let elector = LeaderElector::new(Arc::new(ensemble.connect()), "host");
    let shutdown = ShutdownSignal::new();

    let fast = CountingWorker::new("fast", 100);
    let slow = CountingWorker::new("slow", 1_000);
    let mut scheduler = WorkerScheduler::new(&elector, Duration::ZERO);
    scheduler.add_worker(fast.clone());
    scheduler.add_worker(slow.clone());
    let handles = scheduler.start(&shutdown);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fast.ticks(), 0, "standby must not tick");
    assert!(scheduler.status().iter().all(|s| s.last_started.is_none()));

    assert!(elector.try_acquire().await.unwrap());
    settle().await;
    tokio::time::sleep(Duration::from_millis(1_050)).await;

    let fast_ticks = fast.ticks();
    assert!((10..=12).contains(&fast_ticks), "fast ticked {} times", fast_ticks);
    assert_eq!(slow.ticks(), 2);
    assert!(scheduler.is_active());
    assert!(scheduler.status().iter().all(|s| s.last_started.is_some()));

    elector.release().await.unwrap();
    settle().await;
    let after_release = fast.ticks();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fast.ticks(), after_release);
    assert!(!scheduler.is_active());

    assert!(elector.try_acquire().await.unwrap());
    settle().await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(fast.ticks() > after_release, "ticks resume on reacquire");

    shutdown.shutdown();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_initial_delay_and_lost_leadership_errors() {
    let ensemble = MemoryEnsemble::new();
    let elector = LeaderElector::new(Arc::new(ensemble.connect()), "host");
    assert!(elector.try_acquire().await.unwrap());
    settle().await;

    let worker = Arc::new(CountingWorker {
        name: "lossy",
        interval: Duration::from_millis(100),
        ticks: AtomicU32::new(0),
        fail_with_lost: true,
    });
    let shutdown = ShutdownSignal::new();
    let mut scheduler = WorkerScheduler::new(&elector, Duration::from_millis(500));
    scheduler.add_worker(worker.clone());
    let handles = scheduler.start(&shutdown);

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(worker.ticks(), 0, "initial delay not honoured");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(worker.ticks() >= 2, "a LeadershipLost tick must not stop the loop");

    shutdown.shutdown();
    for handle in handles {
        handle.await.unwrap();
    }
}
