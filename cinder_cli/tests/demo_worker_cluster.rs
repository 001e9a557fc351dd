//! Drives the orchestrator against real `demo_worker` processes.

use cinder_core::storage::MemoryStorage;
use cinder_core::{Cluster, ClusterOptions, ProcessSpawner, Stat};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(30);

fn demo_spawner() -> ProcessSpawner {
    ProcessSpawner::new(
        vec![env!("CARGO_BIN_EXE_demo_worker").to_string()],
        Vec::new(),
        None,
    )
}

#[test]
fn demo_workers_get_ready_and_report_coverage() {
    let options = ClusterOptions {
        workers: 2,
        timeout: Duration::from_secs(5),
        kill_grace: Duration::from_millis(500),
        ready_timeout: Duration::from_secs(20),
        respawn_backoff: Duration::from_millis(100),
        seed: 3,
    };
    let storage = Arc::new(MemoryStorage::new());
    let (stats_tx, stats) = mpsc::channel();
    let cluster = Cluster::new(options, Box::new(demo_spawner()), storage.clone(), stats_tx);
    let shutdown = cluster.shutdown_handle();
    let handle = thread::spawn(move || cluster.run());

    let started = Instant::now();
    let mut ready = false;
    let mut updates = 0;
    while updates < 3 {
        assert!(started.elapsed() < DEADLINE, "no coverage within {DEADLINE:?}");
        match stats.recv_timeout(DEADLINE).expect("cluster went quiet") {
            Stat::WorkersReady => ready = true,
            Stat::CoverageUpdate { hash, branches, .. } => {
                assert!(ready, "coverage reported before the workers were ready");
                assert_eq!(hash.len(), 32);
                assert!(branches > 0);
                updates += 1;
            }
            Stat::FatalError { error } => panic!("cluster failed: {error}"),
            _ => {}
        }
    }

    shutdown.request("test finished");
    let rest: Vec<Stat> = stats.iter().collect();
    assert!(handle.join().unwrap().is_ok());
    assert_eq!(rest.last(), Some(&Stat::ShutdownComplete));
    let stored = storage.stored_corpus().expect("corpus stored on shutdown");
    assert!(!stored.is_empty());
}
