//! Unit tests for leader election
//!
//! Tests mutual exclusion, session expiry, and listener delivery.

use parking_lot::Mutex;
use portico_core::coordination::{MemoryCoordination, MemoryEnsemble};
use portico_core::coordinator::{LeaderElector, LeadershipState};
use portico_core::runtime::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;

fn elector(ensemble: &Arc<MemoryEnsemble>, host: &str) -> (Arc<MemoryCoordination>, Arc<LeaderElector>) {
    let client = Arc::new(ensemble.connect());
    let elector = LeaderElector::with_poll_interval(client.clone(), host, Duration::from_millis(20));
    (client, elector)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_single_leader_through_repeated_expiry() {
    let ensemble = MemoryEnsemble::new();
    let nodes: Vec<_> = (0..3).map(|i| elector(&ensemble, &format!("host-{}", i))).collect();

    for round in 0..10 {
        for (_, elector) in &nodes {
            elector.try_acquire().await.unwrap();
        }

        let leaders: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, (_, e))| e.is_leader())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(leaders.len(), 1, "round {}: leaders {:?}", round, leaders);

        let (client, _) = &nodes[leaders[0]];
        client.expire_session();
        assert!(nodes.iter().all(|(_, e)| !e.is_leader()));
        client.reconnect();
    }
}

#[tokio::test]
async fn test_listeners_fire_in_order_once_per_transition() {
    let ensemble = MemoryEnsemble::new();
    let (_, elector) = elector(&ensemble, "host-a");

    let seen: Arc<Mutex<Vec<(&'static str, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let seen = seen.clone();
        elector.on_leadership_change(Arc::new(move |state: LeadershipState| {
            seen.lock().push((name, state.active));
        }));
    }

    assert!(elector.try_acquire().await.unwrap());
    assert!(elector.try_acquire().await.unwrap());
    elector.release().await.unwrap();
    elector.release().await.unwrap();

    wait_until(|| seen.lock().len() >= 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 4);
    for name in ["first", "second"] {
        let order: Vec<bool> = seen.iter().filter(|(n, _)| *n == name).map(|(_, a)| *a).collect();
        assert_eq!(order, vec![true, false], "listener {}", name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_listener_does_not_delay_others() {
    let ensemble = MemoryEnsemble::new();
    let (_, elector) = elector(&ensemble, "host-a");

    let slow_seen = Arc::new(Mutex::new(Vec::new()));
    let fast_seen = Arc::new(Mutex::new(Vec::new()));
    {
        let slow_seen = slow_seen.clone();
        elector.on_leadership_change(Arc::new(move |state: LeadershipState| {
            std::thread::sleep(Duration::from_millis(500));
            slow_seen.lock().push(state.active);
        }));
    }
    {
        let fast_seen = fast_seen.clone();
        elector.on_leadership_change(Arc::new(move |state: LeadershipState| {
            fast_seen.lock().push(state.active);
        }));
    }

    assert!(elector.try_acquire().await.unwrap());
    elector.release().await.unwrap();

    tokio::time::timeout(Duration::from_millis(300), async {
        while fast_seen.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("fast listener was held up by the slow one");
    assert_eq!(*fast_seen.lock(), vec![true, false]);

    wait_until(|| slow_seen.lock().len() >= 2).await;
    assert_eq!(*slow_seen.lock(), vec![true, false]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_transitions_arrive_in_recorded_order() {
    let ensemble = MemoryEnsemble::new();
    let (_, elector) = elector(&ensemble, "host-a");

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        elector.on_leadership_change(Arc::new(move |state: LeadershipState| {
            seen.lock().push(state.active);
        }));
    }

    let rounds = 50;
    let tasks: Vec<_> = (0..rounds)
        .map(|_| {
            let elector = elector.clone();
            tokio::spawn(async move {
                elector.try_acquire().await.unwrap();
                elector.release().await.unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    assert!(!elector.is_leader());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = seen.lock();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|pair| pair[0] != pair[1]), "{:?}", *seen);
    assert_eq!(seen.last(), Some(&false));
}

#[tokio::test]
async fn test_run_follows_connection_state() {
    let ensemble = MemoryEnsemble::new();
    let (client_a, a) = elector(&ensemble, "host-a");
    let (_client_b, b) = elector(&ensemble, "host-b");
    let shutdown = ShutdownSignal::new();

    let handle_a = tokio::spawn(a.clone().run(shutdown.clone()));
    wait_until(|| a.is_leader()).await;
    let handle_b = tokio::spawn(b.clone().run(shutdown.clone()));

    client_a.suspend();
    wait_until(|| !a.is_leader()).await;
    assert!(!b.is_leader(), "lock is still held by the suspended session");

    client_a.reconnect();
    wait_until(|| a.is_leader()).await;

    client_a.expire_session();
    wait_until(|| b.is_leader()).await;
    assert!(!a.is_leader());

    client_a.reconnect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.is_leader());
    assert!(!a.is_leader());

    let info = b.leader_info().await.unwrap().unwrap();
    assert_eq!(info.hostname, "host-b");

    shutdown.shutdown();
    handle_a.await.unwrap();
    handle_b.await.unwrap();
    assert!(!b.is_leader());
    assert_eq!(ensemble.node_owner("/leader"), None);
}
