//! Dialer double that counts dials and fails on demand.

use std::time::Duration;

use dashmap::DashMap;

use opshub_core::{Endpoint, Error, ResourceId, Result};

use opshub_conn::tunnel::LinkDialer;

use crate::stub_conn::StubConn;

/// Produces [`StubConn`] handles, counting every dial per resource id.
///
/// Ids in the failure table refuse to dial. An optional artificial
/// delay keeps establishment slow enough for concurrency tests to
/// overlap reliably.
#[derive(Default)]
pub struct CountingDialer {
    direct: DashMap<ResourceId, usize>,
    via: DashMap<ResourceId, usize>,
    failing: DashMap<ResourceId, String>,
    scripts: DashMap<ResourceId, Vec<(String, String)>>,
    delay: Option<Duration>,
}

impl CountingDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make dials to `id` fail with a transport error.
    pub fn fail(&self, id: ResourceId, reason: &str) {
        self.failing.insert(id, reason.to_string());
    }

    /// Let dials to `id` succeed again.
    pub fn heal(&self, id: ResourceId) {
        self.failing.remove(&id);
    }

    /// Script an exec answer applied to every handle dialed for `id`.
    pub fn script_exec(&self, id: ResourceId, command: &str, stdout: &str) {
        self.scripts
            .entry(id)
            .or_default()
            .push((command.to_string(), stdout.to_string()));
    }

    pub fn direct_dials(&self, id: ResourceId) -> usize {
        self.direct.get(&id).map(|c| *c).unwrap_or(0)
    }

    pub fn via_dials(&self, id: ResourceId) -> usize {
        self.via.get(&id).map(|c| *c).unwrap_or(0)
    }

    pub fn total_dials(&self, id: ResourceId) -> usize {
        self.direct_dials(id) + self.via_dials(id)
    }

    async fn dial(&self, counter: &DashMap<ResourceId, usize>, endpoint: &Endpoint) -> Result<StubConn> {
        *counter.entry(endpoint.id).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.failing.get(&endpoint.id) {
            return Err(Error::transport(endpoint.id, reason.clone()));
        }
        let conn = StubConn::new(endpoint.id);
        if let Some(scripts) = self.scripts.get(&endpoint.id) {
            for (command, stdout) in scripts.iter() {
                conn.script_exec(command, stdout);
            }
        }
        Ok(conn)
    }
}

impl LinkDialer for CountingDialer {
    type Conn = StubConn;

    async fn dial_direct(&self, endpoint: &Endpoint) -> Result<StubConn> {
        self.dial(&self.direct, endpoint).await
    }

    async fn dial_via(&self, _parent: &StubConn, endpoint: &Endpoint) -> Result<StubConn> {
        self.dial(&self.via, endpoint).await
    }
}
