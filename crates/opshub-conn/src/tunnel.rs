//! Tunnel chain resolution.
//!
//! A machine may only be reachable through a chain of jump hosts. The
//! resolver dials the chain from the root down, caching every hop under
//! its own resource id so that machines sharing a jump host share its
//! connection, and so that a later request for the jump host itself is
//! already warm.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use opshub_core::{Endpoint, Result};

use crate::cache::{ConnCache, ManagedConn};

/// Dials a single hop, either directly or through an already-established
/// parent connection. The network lives behind this trait; resolution
/// logic above it is transport-agnostic.
pub trait LinkDialer: Send + Sync + 'static {
    type Conn: ManagedConn;

    fn dial_direct(&self, endpoint: &Endpoint) -> impl Future<Output = Result<Self::Conn>> + Send;

    fn dial_via(
        &self,
        parent: &Self::Conn,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<Self::Conn>> + Send;
}

impl<D: LinkDialer> LinkDialer for Arc<D> {
    type Conn = D::Conn;

    async fn dial_direct(&self, endpoint: &Endpoint) -> Result<Self::Conn> {
        (**self).dial_direct(endpoint).await
    }

    async fn dial_via(&self, parent: &Self::Conn, endpoint: &Endpoint) -> Result<Self::Conn> {
        (**self).dial_via(parent, endpoint).await
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Walks an endpoint chain, reusing cached hops and dialing the missing
/// ones through their parents.
pub struct TunnelResolver<D: LinkDialer> {
    dialer: Arc<D>,
}

impl<D: LinkDialer> Clone for TunnelResolver<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: Arc::clone(&self.dialer),
        }
    }
}

impl<D: LinkDialer> TunnelResolver<D> {
    pub fn new(dialer: D) -> Self {
        Self {
            dialer: Arc::new(dialer),
        }
    }

    /// Return a connection to the chain's target, establishing any hop
    /// that is not already cached.
    ///
    /// Each hop goes through the cache's single-flight path, so two
    /// concurrent resolutions sharing a jump host dial it once. A dial
    /// failure anywhere on the chain propagates to the caller carrying
    /// the failing hop's resource id, and caches nothing below it.
    pub async fn resolve(&self, cache: &ConnCache<D::Conn>, endpoint: &Endpoint) -> Result<D::Conn> {
        endpoint.validate_chain()?;
        self.resolve_hop(cache, endpoint).await
    }

    fn resolve_hop<'a>(
        &'a self,
        cache: &'a ConnCache<D::Conn>,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<D::Conn>> {
        Box::pin(async move {
            cache
                .get_with(endpoint.id, || async {
                    match &endpoint.parent {
                        None => {
                            debug!(resource_id = endpoint.id, addr = %endpoint.addr(), "Dialing directly");
                            self.dialer.dial_direct(endpoint).await
                        }
                        Some(parent) => {
                            let parent_conn = self.resolve_hop(cache, parent).await?;
                            debug!(
                                resource_id = endpoint.id,
                                via = parent.id,
                                addr = %endpoint.addr(),
                                "Dialing through jump host"
                            );
                            self.dialer.dial_via(&parent_conn, endpoint).await
                        }
                    }
                })
                .await
        })
    }

    /// Dial the chain's target without caching the final hop. Parents
    /// still go through the cache. Used for connectivity tests against
    /// unsaved records.
    pub async fn probe(&self, cache: &ConnCache<D::Conn>, endpoint: &Endpoint) -> Result<D::Conn> {
        endpoint.validate_chain()?;
        match &endpoint.parent {
            None => self.dialer.dial_direct(endpoint).await,
            Some(parent) => {
                let parent_conn = self.resolve_hop(cache, parent).await?;
                self.dialer.dial_via(&parent_conn, endpoint).await
            }
        }
    }
}
