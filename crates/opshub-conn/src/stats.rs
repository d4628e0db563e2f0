//! Periodic host stats collection.
//!
//! Every interval the collector lists enabled machines and spawns one
//! task per machine that runs three fixed introspection commands and
//! parses them into a [`StatsSnapshot`]. Snapshots land in a TTL cache
//! that the HTTP layer reads. A machine whose connection cannot be
//! established is flipped to disabled so a dead host does not burn a
//! dial timeout every cycle; re-enabling is an operator action.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use opshub_core::constants::COMMAND_TIMEOUT;
use opshub_core::stats::build_snapshot;
use opshub_core::{Error, MachineStatus, ResourceId, Result, StatsSnapshot};

use crate::ssh::RemoteExec;
use crate::store::MachineStore;

/// The three commands a snapshot is built from.
const CMD_PROC_STAT: &str = "cat /proc/stat";
const CMD_MEMINFO: &str = "cat /proc/meminfo";
const CMD_DF: &str = "df -kP";

/// Hands the collector a connection for a machine id. Implemented by
/// [`MachineConns`](crate::manager::MachineConns) in production.
pub trait ConnSource: Send + Sync + 'static {
    type Conn: RemoteExec + Send + Sync;

    fn get(&self, id: ResourceId) -> impl Future<Output = Result<Self::Conn>> + Send;
}

/// TTL cache of the latest snapshot per machine.
pub struct StatsCache {
    snapshots: DashMap<ResourceId, (Instant, StatsSnapshot)>,
    ttl: Duration,
}

impl StatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshots: DashMap::new(),
            ttl,
        }
    }

    pub fn put(&self, id: ResourceId, snapshot: StatsSnapshot) {
        self.snapshots.insert(id, (Instant::now(), snapshot));
    }

    /// Latest snapshot for `id`, or `None` when absent or expired.
    pub fn get(&self, id: ResourceId) -> Option<StatsSnapshot> {
        let entry = self.snapshots.get(&id)?;
        let (stored_at, snapshot) = entry.value();
        if stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(snapshot.clone())
    }

    pub fn remove(&self, id: ResourceId) {
        self.snapshots.remove(&id);
    }
}

/// Drives collection cycles on a fixed interval.
pub struct StatsCollector<S, C> {
    store: Arc<S>,
    conns: Arc<C>,
    cache: Arc<StatsCache>,
    interval: Duration,
}

impl<S, C> StatsCollector<S, C>
where
    S: MachineStore,
    C: ConnSource,
{
    pub fn new(store: Arc<S>, conns: Arc<C>, cache: Arc<StatsCache>, interval: Duration) -> Self {
        Self {
            store,
            conns,
            cache,
            interval,
        }
    }

    pub fn cache(&self) -> Arc<StatsCache> {
        Arc::clone(&self.cache)
    }

    /// Run cycles forever. The returned task is aborted on shutdown.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.interval, "Stats collector started");
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }

    /// One collection pass over every enabled machine.
    ///
    /// Machines run concurrently in their own tasks; a panic or timeout
    /// in one never touches the others or the cycle itself.
    pub async fn run_cycle(&self) {
        let ids = match self.store.list_enabled().await {
            Ok(ids) => ids,
            Err(error) => {
                warn!(%error, "Listing enabled machines failed, skipping cycle");
                return;
            }
        };

        debug!(machines = ids.len(), "Stats cycle starting");
        let mut units = Vec::with_capacity(ids.len());
        for id in ids {
            let store = Arc::clone(&self.store);
            let conns = Arc::clone(&self.conns);
            let cache = Arc::clone(&self.cache);
            units.push((
                id,
                tokio::spawn(async move { collect_one(&*store, &*conns, &cache, id).await }),
            ));
        }

        for (id, unit) in units {
            match unit.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    debug!(resource_id = id, %error, "Stats collection failed");
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(resource_id = id, %join_error, "Stats unit panicked");
                }
                Err(_) => {}
            }
        }
    }
}

async fn collect_one<S, C>(
    store: &S,
    conns: &C,
    cache: &StatsCache,
    id: ResourceId,
) -> Result<()>
where
    S: MachineStore,
    C: ConnSource,
{
    let conn = match conns.get(id).await {
        Ok(conn) => conn,
        Err(error) => {
            warn!(resource_id = id, %error, "Machine unreachable, disabling");
            if let Err(error) = store.set_status(id, MachineStatus::Disabled).await {
                warn!(resource_id = id, %error, "Disabling machine failed");
            }
            return Err(error);
        }
    };

    let proc_stat = run_bounded(&conn, CMD_PROC_STAT).await?;
    let meminfo = run_bounded(&conn, CMD_MEMINFO).await?;
    let df = run_bounded(&conn, CMD_DF).await?;

    let snapshot = build_snapshot(&proc_stat, &meminfo, &df)?;
    cache.put(id, snapshot);
    debug!(resource_id = id, "Snapshot refreshed");
    Ok(())
}

/// Run one introspection command with a per-command timeout so a hung
/// remote cannot pin its unit past the cycle.
async fn run_bounded<C: RemoteExec>(conn: &C, command: &str) -> Result<String> {
    let output = timeout(COMMAND_TIMEOUT, conn.exec(command))
        .await
        .map_err(|_| Error::protocol(format!("{} timed out", command)))??;
    if !output.success() {
        return Err(Error::protocol(format!(
            "{} exited with {}: {}",
            command,
            output.exit_status,
            output.stderr.trim()
        )));
    }
    Ok(output.stdout)
}
