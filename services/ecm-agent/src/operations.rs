//! In-flight operation tracking.
//!
//! An operation is in flight between the moment its command is forwarded to
//! an ECU and the moment its acknowledgment arrives. Two tables correlate
//! acknowledgments back to what was requested:
//!
//! - pending installs: `OperationId -> PluginRecord` awaiting install-ack
//! - pending uninstalls: `OperationId -> plugin name` awaiting uninstall-ack
//!
//! Identifiers are unique across both tables. The table is owned by the
//! coordinator actor, so every allocate-and-insert and lookup-and-remove runs
//! inside a single message handler.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use ecm_messages::OperationId;
use thiserror::Error;

use crate::state::PluginRecord;

/// Errors from the operation table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OperationError {
    /// Every identifier is held by an unacknowledged operation.
    #[error("all {} operation identifiers are in flight", OperationId::CAPACITY)]
    CapacityExhausted,

    /// No in-flight operation has this identifier.
    #[error("no in-flight operation with id {0}")]
    Unknown(OperationId),
}

/// Issues wrapping operation identifiers in `[1, 255]`.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: OperationId,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: OperationId::MIN,
        }
    }

    /// Return the current identifier and advance, wrapping 255 to 1.
    pub fn next(&mut self) -> OperationId {
        let id = self.next;
        self.next = id.successor();
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// An install waiting for its acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingInstall {
    pub record: PluginRecord,
    pub staged_at: Instant,
}

/// An uninstall waiting for its acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingUninstall {
    pub plugin_name: String,
    pub staged_at: Instant,
}

/// An operation dropped by [`OperationTable::expire`].
#[derive(Debug, Clone)]
pub enum ExpiredOperation {
    Install(OperationId, PendingInstall),
    Uninstall(OperationId, PendingUninstall),
}

/// Point-in-time view of the table, for leak inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub pending_installs: usize,
    pub pending_uninstalls: usize,
    pub expired_total: u64,
}

/// Pending installs, pending uninstalls and the allocator that keys them.
#[derive(Debug, Default)]
pub struct OperationTable {
    allocator: IdAllocator,
    installs: HashMap<OperationId, PendingInstall>,
    uninstalls: HashMap<OperationId, PendingUninstall>,
    expired_total: u64,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_flight(&self, id: OperationId) -> bool {
        self.installs.contains_key(&id) || self.uninstalls.contains_key(&id)
    }

    /// Allocate an identifier not held by any in-flight operation.
    pub fn allocate(&mut self) -> Result<OperationId, OperationError> {
        for _ in 0..OperationId::CAPACITY {
            let id = self.allocator.next();
            if !self.in_flight(id) {
                return Ok(id);
            }
        }
        Err(OperationError::CapacityExhausted)
    }

    /// Allocate an identifier and park an install record under it.
    pub fn stage_install(
        &mut self,
        record: PluginRecord,
        now: Instant,
    ) -> Result<OperationId, OperationError> {
        let id = self.allocate()?;
        self.installs.insert(
            id,
            PendingInstall {
                record,
                staged_at: now,
            },
        );
        Ok(id)
    }

    /// Allocate an identifier and remember which plugin it uninstalls.
    pub fn stage_uninstall(
        &mut self,
        plugin_name: String,
        now: Instant,
    ) -> Result<OperationId, OperationError> {
        let id = self.allocate()?;
        self.uninstalls.insert(
            id,
            PendingUninstall {
                plugin_name,
                staged_at: now,
            },
        );
        Ok(id)
    }

    /// Remove and return the pending install for `id`.
    pub fn take_install(&mut self, id: OperationId) -> Result<PendingInstall, OperationError> {
        self.installs
            .remove(&id)
            .ok_or(OperationError::Unknown(id))
    }

    /// Put back an install taken by [`take_install`](Self::take_install).
    pub fn reinstate_install(&mut self, id: OperationId, pending: PendingInstall) {
        self.installs.insert(id, pending);
    }

    /// Remove and return the pending uninstall for `id`.
    pub fn take_uninstall(&mut self, id: OperationId) -> Result<PendingUninstall, OperationError> {
        self.uninstalls
            .remove(&id)
            .ok_or(OperationError::Unknown(id))
    }

    /// Remove the oldest pending uninstall of `plugin_name`, if any.
    pub fn take_uninstall_by_name(
        &mut self,
        plugin_name: &str,
    ) -> Option<(OperationId, PendingUninstall)> {
        let id = self
            .uninstalls
            .iter()
            .filter(|(_, pending)| pending.plugin_name == plugin_name)
            .min_by_key(|(_, pending)| pending.staged_at)
            .map(|(id, _)| *id)?;
        self.uninstalls.remove(&id).map(|pending| (id, pending))
    }

    /// Whether an install is parked under `id`.
    pub fn has_install(&self, id: OperationId) -> bool {
        self.installs.contains_key(&id)
    }

    /// Whether any pending install will commit a record at `location`.
    pub fn install_pending_at(&self, location: &Path) -> bool {
        self.installs
            .values()
            .any(|pending| pending.record.location.as_path() == location)
    }

    /// Whether an uninstall is parked under `id`.
    pub fn has_uninstall(&self, id: OperationId) -> bool {
        self.uninstalls.contains_key(&id)
    }

    /// Drop every operation staged more than `timeout` before `now`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ExpiredOperation> {
        let is_stale = |staged_at: Instant| now.saturating_duration_since(staged_at) >= timeout;

        let stale_installs: Vec<_> = self
            .installs
            .iter()
            .filter(|(_, p)| is_stale(p.staged_at))
            .map(|(id, _)| *id)
            .collect();
        let stale_uninstalls: Vec<_> = self
            .uninstalls
            .iter()
            .filter(|(_, p)| is_stale(p.staged_at))
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::with_capacity(stale_installs.len() + stale_uninstalls.len());
        for id in stale_installs {
            if let Some(pending) = self.installs.remove(&id) {
                expired.push(ExpiredOperation::Install(id, pending));
            }
        }
        for id in stale_uninstalls {
            if let Some(pending) = self.uninstalls.remove(&id) {
                expired.push(ExpiredOperation::Uninstall(id, pending));
            }
        }

        self.expired_total += expired.len() as u64;
        expired
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            pending_installs: self.installs.len(),
            pending_uninstalls: self.uninstalls.len(),
            expired_total: self.expired_total,
        }
    }
}
