//! Stats collection cycles: refresh, self-healing disable, isolation.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use opshub_conn::manager::MachineConns;
use opshub_conn::stats::{ConnSource, StatsCache, StatsCollector};
use opshub_core::{Error, MachineStatus, ResourceId, Result};
use opshub_test_utils::{machine_meta, CountingDialer, MemoryMachineStore, StubConn};

const PROC_STAT: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 100 0 100 700 100 0 0 0 0 0\n";
const MEMINFO: &str = "MemTotal:       16384000 kB\nMemFree:         2048000 kB\nMemAvailable:    8192000 kB\n";
const DF: &str = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
/dev/vda1 104857600 52428800 52428800 50% /\n";

fn scripted_dialer() -> Arc<CountingDialer> {
    let dialer = Arc::new(CountingDialer::new());
    for id in 1..=8 {
        dialer.script_exec(id, "cat /proc/stat", PROC_STAT);
        dialer.script_exec(id, "cat /proc/meminfo", MEMINFO);
        dialer.script_exec(id, "df -kP", DF);
    }
    dialer
}

fn collector_with(
    dialer: &Arc<CountingDialer>,
    machines: &[(u64, Option<u64>)],
) -> (
    Arc<MemoryMachineStore>,
    Arc<StatsCache>,
    StatsCollector<MemoryMachineStore, MachineConns<Arc<CountingDialer>, MemoryMachineStore>>,
) {
    let store = Arc::new(MemoryMachineStore::new());
    for (id, parent) in machines {
        store.insert(machine_meta(*id, *parent));
    }
    let conns = Arc::new(MachineConns::new(Arc::clone(dialer), Arc::clone(&store)));
    let cache = Arc::new(StatsCache::new(Duration::from_secs(300)));
    let collector = StatsCollector::new(
        Arc::clone(&store),
        conns,
        Arc::clone(&cache),
        Duration::from_secs(120),
    );
    (store, cache, collector)
}

#[tokio::test]
async fn cycle_refreshes_snapshots_for_reachable_machines() {
    let dialer = scripted_dialer();
    let (_store, cache, collector) = collector_with(&dialer, &[(1, None), (2, None)]);

    collector.run_cycle().await;

    let snap = cache.get(1).expect("snapshot for machine 1");
    assert!((snap.cpu_idle_pct - 80.0).abs() < 0.01);
    assert_eq!(snap.mem_total_kb, 16_384_000);
    assert_eq!(snap.mem_available_kb, 8_192_000);
    assert_eq!(snap.filesystems.len(), 1);
    assert_eq!(snap.filesystems[0].mount_point, "/");

    assert!(cache.get(2).is_some());
}

#[tokio::test]
async fn unreachable_machine_is_disabled_and_skipped_afterwards() {
    let dialer = scripted_dialer();
    dialer.fail(2, "no route to host");
    let (store, cache, collector) = collector_with(&dialer, &[(1, None), (2, None)]);

    collector.run_cycle().await;

    // The healthy machine got its snapshot; the dead one was disabled.
    assert!(cache.get(1).is_some());
    assert!(cache.get(2).is_none());
    assert_eq!(store.status_of(2), Some(MachineStatus::Disabled));
    assert_eq!(dialer.total_dials(2), 1);

    // The next cycle no longer touches the disabled machine.
    collector.run_cycle().await;
    assert_eq!(dialer.total_dials(2), 1);
}

#[tokio::test]
async fn failed_command_does_not_disable_the_machine() {
    // Machine 1 connects fine but answers no commands.
    let dialer = Arc::new(CountingDialer::new());
    let (store, cache, collector) = collector_with(&dialer, &[(1, None)]);

    collector.run_cycle().await;

    assert!(cache.get(1).is_none());
    assert_eq!(store.status_of(1), Some(MachineStatus::Enabled));
}

/// Source that panics for selected ids and answers for the rest.
struct PanickySource {
    conns: DashMap<ResourceId, StubConn>,
    panic_on: ResourceId,
}

impl ConnSource for PanickySource {
    type Conn = StubConn;

    async fn get(&self, id: ResourceId) -> Result<StubConn> {
        if id == self.panic_on {
            panic!("scripted panic for machine {}", id);
        }
        self.conns
            .get(&id)
            .map(|c| c.clone())
            .ok_or(Error::NotFound(id))
    }
}

#[tokio::test]
async fn a_panicking_unit_does_not_poison_the_cycle() {
    let store = Arc::new(MemoryMachineStore::new());
    store.insert(machine_meta(1, None));
    store.insert(machine_meta(2, None));

    let healthy = StubConn::new(1);
    healthy.script_exec("cat /proc/stat", PROC_STAT);
    healthy.script_exec("cat /proc/meminfo", MEMINFO);
    healthy.script_exec("df -kP", DF);

    let conns = DashMap::new();
    conns.insert(1, healthy);
    let source = Arc::new(PanickySource { conns, panic_on: 2 });

    let cache = Arc::new(StatsCache::new(Duration::from_secs(300)));
    let collector = StatsCollector::new(
        Arc::clone(&store),
        source,
        Arc::clone(&cache),
        Duration::from_secs(120),
    );

    collector.run_cycle().await;

    // The panic was contained to machine 2's unit.
    assert!(cache.get(1).is_some());
    assert!(cache.get(2).is_none());
}

#[tokio::test]
async fn snapshots_expire_after_their_ttl() {
    let cache = StatsCache::new(Duration::from_millis(20));
    let snapshot =
        opshub_core::stats::build_snapshot(PROC_STAT, MEMINFO, DF).unwrap();
    cache.put(5, snapshot);

    assert!(cache.get(5).is_some());
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(cache.get(5).is_none());
}
