//! MongoDB connection handles.
//!
//! A [`MongoHandle`] wraps a driver client plus the resource id it was
//! established for, so it can live in the same [`ConnCache`] shape as
//! SSH connections. The driver connects lazily, so establishment pings
//! the server to surface bad addresses and credentials immediately
//! instead of on first use.
//!
//! [`ConnCache`]: crate::cache::ConnCache

use std::sync::Arc;
use std::time::{Duration, Instant};

use mongodb::bson::doc;
use mongodb::Client;
use tokio::time::timeout;
use tracing::{debug, info};

use opshub_core::constants::CONNECT_TIMEOUT;
use opshub_core::{Error, ResourceId, Result};

use crate::cache::ManagedConn;
use crate::store::MongoMeta;

/// Liveness probes must answer fast; a handle that cannot ping within
/// this window is treated as dead.
const PING_TIMEOUT: Duration = Duration::from_secs(3);

struct MongoInner {
    id: ResourceId,
    name: String,
    client: Client,
    created_at: Instant,
}

/// An established, ping-verified MongoDB client.
#[derive(Clone)]
pub struct MongoHandle {
    inner: Arc<MongoInner>,
}

impl MongoHandle {
    /// Parse the connection string, build a client and verify it with a
    /// ping. The timeout covers the whole round trip.
    pub async fn connect(meta: &MongoMeta) -> Result<Self> {
        let client = Client::with_uri_str(&meta.uri)
            .await
            .map_err(|e| Error::config(format!("mongo {}: bad connection string: {}", meta.id, e)))?;

        let admin = client.database("admin");
        let ping = admin.run_command(doc! { "ping": 1 });
        timeout(CONNECT_TIMEOUT, ping)
            .await
            .map_err(|_| Error::transport(meta.id, "mongo ping timed out".to_string()))?
            .map_err(|e| Error::transport(meta.id, format!("mongo ping failed: {}", e)))?;

        info!(resource_id = meta.id, name = %meta.name, "Mongo connection established");
        Ok(Self {
            inner: Arc::new(MongoInner {
                id: meta.id,
                name: meta.name.clone(),
                client,
                created_at: Instant::now(),
            }),
        })
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn age(&self) -> std::time::Duration {
        self.inner.created_at.elapsed()
    }

    /// The underlying driver client, for query execution upstream.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }
}

impl ManagedConn for MongoHandle {
    async fn is_alive(&self) -> bool {
        let admin = self.inner.client.database("admin");
        let ping = admin.run_command(doc! { "ping": 1 });
        matches!(timeout(PING_TIMEOUT, ping).await, Ok(Ok(_)))
    }

    async fn close(&self) {
        debug!(resource_id = self.inner.id, "Closing mongo connection");
        self.inner.client.clone().shutdown().await;
    }
}
