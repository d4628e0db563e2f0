//! Connection lifecycle core for the ops console.
//!
//! This crate owns every long-lived handle to a managed resource:
//!
//! - [`cache::ConnCache`] keeps one healthy handle per resource id and
//!   collapses concurrent establishment into a single attempt.
//! - [`tunnel::TunnelResolver`] walks a machine's parent chain and dials
//!   each hop through the previous one, caching every intermediate hop.
//! - [`ssh::SshClient`] and [`mongo::MongoHandle`] are the two concrete
//!   handle types, both usable through [`cache::ManagedConn`].
//! - [`terminal::TerminalSession`] bridges a remote pty to a pair of
//!   browser-facing frame channels, optionally recording output.
//! - [`stats::StatsCollector`] refreshes host metrics on a fixed interval
//!   and disables machines that stop answering.
//!
//! The [`manager::ConnectionManager`] facade wires all of the above
//! together for the HTTP layer.

pub mod cache;
pub mod manager;
pub mod mongo;
pub mod record;
pub mod ssh;
pub mod stats;
pub mod store;
pub mod terminal;
pub mod tunnel;

pub use cache::{ConnCache, ManagedConn};
pub use manager::{
    ConnectionManager, MachineConns, ManagerConfig, SshConnectionManager, TerminalRequest,
};
pub use mongo::MongoHandle;
pub use record::{RecordingEntry, ReplayStore, SessionRecorder};
pub use ssh::{CommandOutput, RemoteExec, SessionGuard, SshClient, SshDialer};
pub use stats::{ConnSource, StatsCache, StatsCollector};
pub use store::{
    build_endpoint, build_endpoint_for, AccessControl, MachineMeta, MachineStore, MongoMeta,
    MongoStore,
};
pub use terminal::{
    new_session_token, InteractiveConn, PtyChannel, PtyCommand, SessionHandle, TermInput,
    TermOutput, TerminalSession,
};
pub use tunnel::{LinkDialer, TunnelResolver};
