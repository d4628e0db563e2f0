//! Test infrastructure for the connection lifecycle core.
//!
//! Provides:
//! - StubConn: scriptable connection handle, no network
//! - CountingDialer: dialer that counts and optionally fails dials
//! - MemoryMachineStore / MemoryMongoStore: in-memory metadata stores
//! - AllowAll / DenyAll: trivial access control policies
//! - pty_pair: a pty channel whose remote end is driven by the test

mod counting_dialer;
mod fake_pty;
mod memory_store;
mod stub_conn;

pub use counting_dialer::CountingDialer;
pub use fake_pty::{pty_pair, FakeRemote};
pub use memory_store::{machine_meta, AllowAll, DenyAll, MemoryMachineStore, MemoryMongoStore};
pub use stub_conn::StubConn;
