//! Resource metadata lookup and endpoint chain construction.
//!
//! The HTTP layer persists machine and database records elsewhere; this
//! crate only needs to resolve an id into dialing parameters. The two
//! store traits are that seam. [`build_endpoint`] walks a machine's
//! parent references into a linked [`Endpoint`] chain, rejecting cycles
//! before any dialing happens.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use opshub_core::{AuthMethod, Endpoint, Error, MachineStatus, ResourceId, Result};

/// Dialing parameters for one managed machine.
#[derive(Debug, Clone)]
pub struct MachineMeta {
    pub id: ResourceId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    /// Jump host this machine is reached through, if any.
    pub parent_id: Option<ResourceId>,
    pub status: MachineStatus,
    /// Whether terminal sessions on this machine are recorded.
    pub recording_enabled: bool,
    /// Resource tree path used for access checks.
    pub tag_path: String,
}

/// Dialing parameters for one managed MongoDB instance.
#[derive(Debug, Clone)]
pub struct MongoMeta {
    pub id: ResourceId,
    pub name: String,
    /// Full connection string, credentials included.
    pub uri: String,
    pub status: MachineStatus,
}

/// Read access to machine records.
pub trait MachineStore: Send + Sync + 'static {
    fn resolve_machine(&self, id: ResourceId)
        -> impl Future<Output = Result<MachineMeta>> + Send;

    /// Persist a status flip, used by the stats collector to disable
    /// machines that stop answering.
    fn set_status(
        &self,
        id: ResourceId,
        status: MachineStatus,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Ids of every machine currently enabled for monitoring.
    fn list_enabled(&self) -> impl Future<Output = Result<Vec<ResourceId>>> + Send;
}

/// Read access to MongoDB records.
pub trait MongoStore: Send + Sync + 'static {
    fn resolve_mongo(&self, id: ResourceId) -> impl Future<Output = Result<MongoMeta>> + Send;
}

/// Per-account authorization over the resource tree.
pub trait AccessControl: Send + Sync + 'static {
    /// Err means the account may not touch the resource; the message is
    /// shown to the operator.
    fn can_access(
        &self,
        account_id: u64,
        tag_path: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Resolve `id` and every ancestor into an [`Endpoint`] chain.
///
/// Fails with a config error on a parent cycle, with `Disabled` when any
/// machine on the chain is administratively disabled, and with whatever
/// the store reports for missing records. No network activity happens
/// here.
pub async fn build_endpoint<S: MachineStore>(store: &S, id: ResourceId) -> Result<Endpoint> {
    let mut visited = HashSet::new();
    let endpoint = resolve_chain(store, id, &mut visited).await?;
    endpoint.validate_chain()?;
    Ok(endpoint)
}

fn resolve_chain<'a, S: MachineStore>(
    store: &'a S,
    id: ResourceId,
    visited: &'a mut HashSet<ResourceId>,
) -> BoxFuture<'a, Result<Endpoint>> {
    Box::pin(async move {
        if !visited.insert(id) {
            return Err(Error::config(format!(
                "machine {} appears twice in its own tunnel chain",
                id
            )));
        }

        let meta = store.resolve_machine(id).await?;
        if !meta.status.is_enabled() {
            return Err(Error::Disabled(id));
        }

        let parent = match meta.parent_id {
            Some(parent_id) => Some(Box::new(resolve_chain(store, parent_id, visited).await?)),
            None => None,
        };

        Ok(Endpoint {
            id: meta.id,
            host: meta.host,
            port: meta.port,
            username: meta.username,
            auth: meta.auth,
            parent,
        })
    })
}

/// Build an endpoint from an unsaved record, resolving only the parent
/// chain from the store. Used by connectivity tests on records the
/// operator has not persisted yet.
pub async fn build_endpoint_for(
    store: &impl MachineStore,
    meta: &MachineMeta,
) -> Result<Endpoint> {
    let parent = match meta.parent_id {
        Some(parent_id) => Some(Box::new(build_endpoint(store, parent_id).await?)),
        None => None,
    };
    let endpoint = Endpoint {
        id: meta.id,
        host: meta.host.clone(),
        port: meta.port,
        username: meta.username.clone(),
        auth: meta.auth.clone(),
        parent,
    };
    endpoint.validate_chain()?;
    Ok(endpoint)
}
