//! Facade wiring the caches, resolver, terminal bridge and stats
//! collector together for the HTTP layer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use opshub_core::constants::{SNAPSHOT_TTL, STATS_INTERVAL};
use opshub_core::{Error, ResourceId, Result, StatsSnapshot};

use crate::cache::ConnCache;
use crate::mongo::MongoHandle;
use crate::record::SessionRecorder;
use crate::ssh::{RemoteExec, SshDialer};
use crate::stats::{ConnSource, StatsCache, StatsCollector};
use crate::store::{
    build_endpoint, build_endpoint_for, AccessControl, MachineMeta, MachineStore, MongoMeta,
    MongoStore,
};
use crate::terminal::{
    clamp_size, new_session_token, InteractiveConn, SessionHandle, TermInput, TermOutput,
    TerminalSession,
};
use crate::tunnel::{LinkDialer, TunnelResolver};

/// Knobs the embedding service sets at startup.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Base directory for session recordings. `None` disables recording
    /// globally regardless of per-machine flags.
    pub recording_dir: Option<PathBuf>,
    pub stats_interval: Duration,
    pub snapshot_ttl: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            recording_dir: None,
            stats_interval: STATS_INTERVAL,
            snapshot_ttl: SNAPSHOT_TTL,
        }
    }
}

/// Machine connection pool: metadata resolution plus tunnel-aware,
/// cached establishment.
pub struct MachineConns<D: LinkDialer, S: MachineStore> {
    cache: ConnCache<D::Conn>,
    resolver: TunnelResolver<D>,
    store: Arc<S>,
}

impl<D: LinkDialer, S: MachineStore> MachineConns<D, S> {
    pub fn new(dialer: D, store: Arc<S>) -> Self {
        Self {
            cache: ConnCache::new(),
            resolver: TunnelResolver::new(dialer),
            store,
        }
    }

    /// Connection to `id`, establishing the tunnel chain as needed.
    pub async fn get(&self, id: ResourceId) -> Result<D::Conn> {
        let endpoint = build_endpoint(&*self.store, id).await?;
        self.resolver.resolve(&self.cache, &endpoint).await
    }

    /// Drop the cached connection for `id`, closing it. The next `get`
    /// dials fresh. Cached ancestor hops stay warm.
    pub async fn invalidate(&self, id: ResourceId) {
        self.cache.evict(id).await;
    }

    /// Dial an unsaved record once, without caching the final hop.
    pub async fn probe(&self, meta: &MachineMeta) -> Result<D::Conn> {
        let endpoint = build_endpoint_for(&*self.store, meta).await?;
        self.resolver.probe(&self.cache, &endpoint).await
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Number of live cached connections.
    pub fn live_connections(&self) -> usize {
        self.cache.len()
    }

    pub async fn drain(&self) {
        self.cache.drain().await;
    }
}

impl<D, S> ConnSource for MachineConns<D, S>
where
    D: LinkDialer,
    D::Conn: RemoteExec,
    S: MachineStore,
{
    type Conn = D::Conn;

    async fn get(&self, id: ResourceId) -> Result<D::Conn> {
        MachineConns::get(self, id).await
    }
}

/// Everything a terminal open needs from the HTTP layer.
#[derive(Debug)]
pub struct TerminalRequest {
    pub machine_id: ResourceId,
    pub account_id: u64,
    /// Display name of the operator, used in the recording path.
    pub operator: String,
    pub cols: u16,
    pub rows: u16,
}

/// Top-level entry point for connection lifecycle operations.
pub struct ConnectionManager<D, S, M, A>
where
    D: LinkDialer,
    S: MachineStore,
    M: MongoStore,
    A: AccessControl,
{
    machines: Arc<MachineConns<D, S>>,
    mongos: ConnCache<MongoHandle>,
    mongo_store: Arc<M>,
    access: Arc<A>,
    stats_cache: Arc<StatsCache>,
    config: ManagerConfig,
}

/// The production wiring: SSH transport for machines.
pub type SshConnectionManager<S, M, A> = ConnectionManager<SshDialer, S, M, A>;

impl<D, S, M, A> ConnectionManager<D, S, M, A>
where
    D: LinkDialer,
    D::Conn: InteractiveConn + RemoteExec,
    S: MachineStore,
    M: MongoStore,
    A: AccessControl,
{
    pub fn new(
        dialer: D,
        machine_store: Arc<S>,
        mongo_store: Arc<M>,
        access: Arc<A>,
        config: ManagerConfig,
    ) -> Self {
        let stats_cache = Arc::new(StatsCache::new(config.snapshot_ttl));
        Self {
            machines: Arc::new(MachineConns::new(dialer, machine_store)),
            mongos: ConnCache::new(),
            mongo_store,
            access,
            stats_cache,
            config,
        }
    }

    /// Shared view of the machine pool, e.g. for the stats collector.
    pub fn machines(&self) -> Arc<MachineConns<D, S>> {
        Arc::clone(&self.machines)
    }

    /// Cached (or freshly established) connection to a machine.
    pub async fn get_machine(&self, id: ResourceId) -> Result<D::Conn> {
        self.machines.get(id).await
    }

    /// Close and forget the cached connection for a machine. Called
    /// after credential or address edits.
    pub async fn invalidate_machine(&self, id: ResourceId) {
        info!(resource_id = id, "Invalidating machine connection");
        self.machines.invalidate(id).await;
        self.stats_cache.remove(id);
    }

    /// Dial a machine record once and drop the connection, reporting
    /// only success or failure. The record may be unsaved.
    pub async fn test_machine(&self, meta: &MachineMeta) -> Result<()> {
        let conn = self.machines.probe(meta).await?;
        crate::cache::ManagedConn::close(&conn).await;
        Ok(())
    }

    /// Cached (or freshly established) MongoDB client.
    pub async fn get_mongo(&self, id: ResourceId) -> Result<MongoHandle> {
        let store = Arc::clone(&self.mongo_store);
        self.mongos
            .get_with(id, || {
                let store = Arc::clone(&store);
                async move {
                    let meta = store.resolve_mongo(id).await?;
                    if !meta.status.is_enabled() {
                        return Err(Error::Disabled(id));
                    }
                    MongoHandle::connect(&meta).await
                }
            })
            .await
    }

    pub async fn invalidate_mongo(&self, id: ResourceId) {
        info!(resource_id = id, "Invalidating mongo connection");
        self.mongos.evict(id).await;
    }

    /// Connect-and-ping a MongoDB record once, then drop the client.
    pub async fn test_mongo(&self, meta: &MongoMeta) -> Result<()> {
        let handle = MongoHandle::connect(meta).await?;
        crate::cache::ManagedConn::close(&handle).await;
        Ok(())
    }

    /// Open an interactive terminal session.
    ///
    /// Checks authorization, gets (or establishes) the machine
    /// connection, allocates a pty and spawns the bridge task. Output
    /// recording is active when both the global recording directory and
    /// the machine's flag are set.
    pub async fn open_terminal(
        &self,
        request: TerminalRequest,
        input_rx: mpsc::Receiver<TermInput>,
        output_tx: mpsc::Sender<TermOutput>,
    ) -> Result<SessionHandle> {
        let meta = self.machines.store().resolve_machine(request.machine_id).await?;
        self.access
            .can_access(request.account_id, &meta.tag_path)
            .await?;

        let conn = self.machines.get(request.machine_id).await?;
        let (cols, rows) = clamp_size(request.cols, request.rows);
        let pty = conn.open_pty(cols, rows).await?;

        let recorder = match (&self.config.recording_dir, meta.recording_enabled) {
            (Some(base), true) => Some(SessionRecorder::create(
                base,
                request.machine_id,
                &request.operator,
                Local::now(),
            )?),
            _ => None,
        };

        let attachment = conn.attach_session();
        let token = new_session_token();
        info!(
            resource_id = request.machine_id,
            account_id = request.account_id,
            %token,
            recording = recorder.is_some(),
            "Terminal session opened"
        );
        Ok(TerminalSession::spawn(
            token,
            pty,
            input_rx,
            output_tx,
            recorder,
            Some(attachment),
        ))
    }

    /// Latest stats snapshot for a machine, if one is fresh enough.
    pub fn latest_stats(&self, id: ResourceId) -> Option<StatsSnapshot> {
        self.stats_cache.get(id)
    }

    /// Start the periodic stats collector. The handle is aborted on
    /// shutdown.
    pub fn spawn_stats_collector(&self) -> JoinHandle<()> {
        let collector = Arc::new(StatsCollector::new(
            Arc::clone(self.machines.store()),
            Arc::clone(&self.machines),
            Arc::clone(&self.stats_cache),
            self.config.stats_interval,
        ));
        collector.spawn()
    }

    /// Close every cached connection.
    pub async fn shutdown(&self) {
        info!("Closing all cached connections");
        self.machines.drain().await;
        self.mongos.drain().await;
    }
}
