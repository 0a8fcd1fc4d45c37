//! Round-robin backend pools
//!
//! A pool is built once per routing table generation and never changes
//! afterwards; only its cursor moves. Backends reported `Unhealthy` at compile
//! time are skipped.

use crate::registry::{Backend, BackendHealth};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// A backend as a pool sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolMember {
    pub id: String,
    pub address: SocketAddr,
    pub health: BackendHealth,
}

impl From<&Backend> for PoolMember {
    fn from(backend: &Backend) -> Self {
        Self {
            id: backend.id.clone(),
            address: backend.address,
            health: backend.health,
        }
    }
}

/// Backends behind one route
#[derive(Debug, Default)]
pub struct BackendPool {
    members: Vec<PoolMember>,
    cursor: AtomicUsize,
}

impl BackendPool {
    pub fn new(members: Vec<PoolMember>) -> Self {
        Self {
            members,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pick the next routable member
    pub fn next(&self) -> Option<&PoolMember> {
        let routable = self.healthy_count();
        if routable == 0 {
            return None;
        }

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % routable;
        let selected = self
            .members
            .iter()
            .filter(|m| m.health.is_routable())
            .nth(idx);

        if let Some(member) = selected {
            debug!(backend = %member.id, address = %member.address, "Selected backend");
        }
        selected
    }

    pub fn members(&self) -> &[PoolMember] {
        &self.members
    }

    pub fn healthy_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.health.is_routable())
            .count()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|m| m.id == id)
    }
}
