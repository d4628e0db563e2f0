//! Remote endpoint descriptors.
//!
//! An [`Endpoint`] captures everything needed to reach one remote resource
//! for a single connection attempt: address, credentials, auth method, and
//! an optional parent endpoint acting as an SSH jump host. Parents form an
//! owned, singly-linked chain of finite depth; a resource id appearing
//! twice in one chain is a configuration error (tunnel cycle).

use std::fmt;

use crate::constants::MAX_TUNNEL_DEPTH;
use crate::error::{Error, Result};

/// Stable integer identifier for a manageable machine or database instance.
pub type ResourceId = u64;

/// Persisted machine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    Enabled,
    Disabled,
}

impl MachineStatus {
    pub fn is_enabled(self) -> bool {
        matches!(self, MachineStatus::Enabled)
    }
}

/// How to authenticate against a remote SSH endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Password authentication.
    Password { password: String },
    /// Public-key authentication with an optionally passphrase-protected
    /// private key (PEM/OpenSSH text, as stored by the credential layer).
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for AuthMethod {
    // Secret material must never reach logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("AuthMethod::Password(***)"),
            AuthMethod::PrivateKey { passphrase, .. } => write!(
                f,
                "AuthMethod::PrivateKey(***, passphrase: {})",
                passphrase.is_some()
            ),
        }
    }
}

/// Immutable descriptor of one remote endpoint, possibly chained to a
/// parent jump host.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Resource id of the machine this endpoint reaches.
    pub id: ResourceId,
    /// Network host (name or address).
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Credential material.
    pub auth: AuthMethod,
    /// Parent endpoint the connection is tunneled through, if any.
    pub parent: Option<Box<Endpoint>>,
}

impl Endpoint {
    /// Address string in `host:port` form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Number of endpoints in the chain, including this one.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut cur = self.parent.as_deref();
        while let Some(p) = cur {
            depth += 1;
            cur = p.parent.as_deref();
        }
        depth
    }

    /// Resource ids along the chain, target first.
    pub fn chain_ids(&self) -> Vec<ResourceId> {
        let mut ids = vec![self.id];
        let mut cur = self.parent.as_deref();
        while let Some(p) = cur {
            ids.push(p.id);
            cur = p.parent.as_deref();
        }
        ids
    }

    /// Validate the tunnel chain before dialing.
    ///
    /// Rejects chains deeper than [`MAX_TUNNEL_DEPTH`] and chains in which
    /// any resource id appears twice (a parent transitively pointing back
    /// at a child), so resolution can never loop.
    pub fn validate_chain(&self) -> Result<()> {
        let ids = self.chain_ids();
        if ids.len() > MAX_TUNNEL_DEPTH {
            return Err(Error::config(format!(
                "tunnel chain for resource {} exceeds max depth {}",
                self.id, MAX_TUNNEL_DEPTH
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for id in &ids {
            if !seen.insert(*id) {
                return Err(Error::config(format!(
                    "tunnel cycle detected: resource {} appears twice in chain {:?}",
                    id, ids
                )));
            }
        }
        Ok(())
    }
}
