//! In-memory metadata stores and access policies.

use dashmap::DashMap;

use opshub_core::{AuthMethod, Error, MachineStatus, ResourceId, Result};

use opshub_conn::store::{AccessControl, MachineMeta, MachineStore, MongoMeta, MongoStore};

/// A minimal enabled machine record for tests.
pub fn machine_meta(id: ResourceId, parent_id: Option<ResourceId>) -> MachineMeta {
    MachineMeta {
        id,
        name: format!("machine-{}", id),
        host: format!("10.0.0.{}", id),
        port: 22,
        username: "ops".to_string(),
        auth: AuthMethod::Password {
            password: "secret".to_string(),
        },
        parent_id,
        status: MachineStatus::Enabled,
        recording_enabled: false,
        tag_path: "/default/".to_string(),
    }
}

#[derive(Default)]
pub struct MemoryMachineStore {
    machines: DashMap<ResourceId, MachineMeta>,
}

impl MemoryMachineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: MachineMeta) {
        self.machines.insert(meta.id, meta);
    }

    pub fn status_of(&self, id: ResourceId) -> Option<MachineStatus> {
        self.machines.get(&id).map(|m| m.status)
    }
}

impl MachineStore for MemoryMachineStore {
    async fn resolve_machine(&self, id: ResourceId) -> Result<MachineMeta> {
        self.machines
            .get(&id)
            .map(|m| m.clone())
            .ok_or(Error::NotFound(id))
    }

    async fn set_status(&self, id: ResourceId, status: MachineStatus) -> Result<()> {
        let mut meta = self.machines.get_mut(&id).ok_or(Error::NotFound(id))?;
        meta.status = status;
        Ok(())
    }

    async fn list_enabled(&self) -> Result<Vec<ResourceId>> {
        let mut ids: Vec<ResourceId> = self
            .machines
            .iter()
            .filter(|m| m.status.is_enabled())
            .map(|m| m.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[derive(Default)]
pub struct MemoryMongoStore {
    instances: DashMap<ResourceId, MongoMeta>,
}

impl MemoryMongoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: MongoMeta) {
        self.instances.insert(meta.id, meta);
    }
}

impl MongoStore for MemoryMongoStore {
    async fn resolve_mongo(&self, id: ResourceId) -> Result<MongoMeta> {
        self.instances
            .get(&id)
            .map(|m| m.clone())
            .ok_or(Error::NotFound(id))
    }
}

/// Access policy that lets every account through.
#[derive(Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    async fn can_access(&self, _account_id: u64, _tag_path: &str) -> Result<()> {
        Ok(())
    }
}

/// Access policy that refuses every account.
#[derive(Default)]
pub struct DenyAll;

impl AccessControl for DenyAll {
    async fn can_access(&self, account_id: u64, tag_path: &str) -> Result<()> {
        Err(Error::AccessDenied {
            message: format!("account {} may not access {}", account_id, tag_path),
        })
    }
}
