//! Leadership-gated worker scheduling
//!
//! One task per worker. Ticks run on the worker's interval while this process
//! leads and stop as soon as it stands by; a tick already running finishes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use super::leader::{LeaderElector, LeadershipState};
use crate::error::PorticoError;
use crate::runtime::{ShutdownListener, ShutdownSignal};
use crate::worker::Worker;

/// Last tick start of one worker
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub name: &'static str,
    pub last_started: Option<DateTime<Utc>>,
}

struct ScheduledWorker {
    worker: Arc<dyn Worker>,
    last_started: Arc<Mutex<Option<DateTime<Utc>>>>,
}

/// Runs workers only while the elector holds the lock
pub struct WorkerScheduler {
    workers: Vec<ScheduledWorker>,
    active: Arc<watch::Sender<bool>>,
    initial_delay: Duration,
}

impl WorkerScheduler {
    /// Create a scheduler and subscribe it to `elector`'s transitions
    pub fn new(elector: &LeaderElector, initial_delay: Duration) -> Self {
        let (active, _) = watch::channel(elector.is_leader());
        let active = Arc::new(active);

        let sender = active.clone();
        elector.on_leadership_change(Arc::new(move |state: LeadershipState| {
            sender.send_replace(state.active);
        }));

        Self {
            workers: Vec::new(),
            active,
            initial_delay,
        }
    }

    pub fn add_worker(&mut self, worker: Arc<dyn Worker>) {
        info!("Scheduling {} worker every {:?}", worker.name(), worker.interval());
        self.workers.push(ScheduledWorker {
            worker,
            last_started: Arc::new(Mutex::new(None)),
        });
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Last tick start per worker, in registration order
    pub fn status(&self) -> Vec<WorkerStatus> {
        self.workers
            .iter()
            .map(|w| WorkerStatus {
                name: w.worker.name(),
                last_started: *w.last_started.lock(),
            })
            .collect()
    }

    /// Spawn one control loop per worker
    pub fn start(&self, shutdown: &ShutdownSignal) -> Vec<JoinHandle<()>> {
        self.workers
            .iter()
            .map(|w| {
                tokio::spawn(worker_loop(
                    w.worker.clone(),
                    w.last_started.clone(),
                    self.active.subscribe(),
                    shutdown.subscribe(),
                    self.initial_delay,
                ))
            })
            .collect()
    }
}

/// Wait until `active` reads `want`; false if the loop should exit
async fn wait_for(
    active: &mut watch::Receiver<bool>,
    shutdown: &mut ShutdownListener,
    want: bool,
) -> bool {
    loop {
        if *active.borrow_and_update() == want {
            return true;
        }
        tokio::select! {
            changed = active.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = shutdown.recv() => return false,
        }
    }
}

async fn worker_loop(
    worker: Arc<dyn Worker>,
    last_started: Arc<Mutex<Option<DateTime<Utc>>>>,
    mut active: watch::Receiver<bool>,
    mut shutdown: ShutdownListener,
    initial_delay: Duration,
) {
    let name = worker.name();

    loop {
        if !wait_for(&mut active, &mut shutdown, true).await {
            debug!("{} worker loop exiting", name);
            return;
        }
        info!("Starting {} worker", name);

        if !initial_delay.is_zero() {
            tokio::select! {
                _ = sleep(initial_delay) => {}
                _ = shutdown.recv() => return,
                _ = wait_for_standby(&mut active) => {
                    info!("Pausing {} worker", name);
                    continue;
                }
            }
        }

        let mut ticker = interval(worker.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = wait_for_standby(&mut active) => {
                    info!("Pausing {} worker", name);
                    break;
                }
                _ = ticker.tick() => {
                    if !*active.borrow() {
                        break;
                    }
                    *last_started.lock() = Some(Utc::now());
                    match worker.tick().await {
                        Ok(()) => {}
                        Err(e @ PorticoError::LeadershipLost { .. }) => {
                            info!("{} tick stopped: {}", name, e);
                        }
                        Err(e) => error!("{} tick failed: {}", name, e),
                    }
                }
            }
        }
    }
}

/// Resolves once the flag turns false; pends forever if the sender is gone
async fn wait_for_standby(active: &mut watch::Receiver<bool>) {
    loop {
        if !*active.borrow_and_update() {
            return;
        }
        if active.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
