//! Reference-counted service lifecycle.
//!
//! A [`Service`] stays alive exactly as long as at least one holder references
//! it. The first [`Service::add_ref`] triggers [`Service::on_start`], the last
//! [`Service::remove_ref`] triggers [`Service::on_stop`], and everything in
//! between is a cheap set insertion. Holders are identified by [`HolderId`] so
//! a double `add_ref` from the same holder is idempotent and a `remove_ref`
//! from a holder that never registered is a no-op.
//!
//! [`ServiceRef`] is the RAII form: it registers on construction and
//! deregisters on drop, holding only a [`Weak`] to the service so a guard can
//! never keep a torn-down service alive.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

static NEXT_HOLDER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a party holding a service reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId(u64);

impl HolderId {
    /// Allocates a process-unique holder identity.
    pub fn next() -> Self {
        HolderId(NEXT_HOLDER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Holder bookkeeping shared by every [`Service`] implementation.
///
/// The mutex serializes add/remove so start and stop transitions are observed
/// in a consistent order even under concurrent holders.
#[derive(Debug, Default)]
pub struct RefRegistry {
    holders: Mutex<HashSet<HolderId>>,
}

impl RefRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently registered holders.
    pub fn holder_count(&self) -> usize {
        self.holders.lock().len()
    }
}

/// A start/stop resource gated by reference counting.
///
/// Implementors provide storage ([`registry`](Service::registry)) and the two
/// transitions; the counting logic itself lives in the provided methods.
pub trait Service: Send + Sync {
    /// Service name used in logs.
    fn name(&self) -> &str;

    fn registry(&self) -> &RefRegistry;

    /// Called when the holder count goes 0 → 1. An error here leaves the
    /// service stopped and the holder unregistered.
    fn on_start(&self) -> Result<()>;

    /// Called when the holder count goes 1 → 0.
    fn on_stop(&self);

    /// Registers `holder`. Starts the service if it was the first.
    fn add_ref(&self, holder: HolderId) -> Result<()> {
        let mut holders = self.registry().holders.lock();
        if holders.contains(&holder) {
            return Ok(());
        }
        if holders.is_empty() {
            debug!(service = self.name(), "starting (first holder)");
            self.on_start()?;
        }
        holders.insert(holder);
        Ok(())
    }

    /// Deregisters `holder`. Stops the service if it was the last.
    fn remove_ref(&self, holder: HolderId) {
        let mut holders = self.registry().holders.lock();
        if !holders.remove(&holder) {
            return;
        }
        if holders.is_empty() {
            debug!(service = self.name(), "stopping (last holder)");
            self.on_stop();
        }
    }

    /// Drops every holder and stops the service if it was running. For
    /// process teardown, where individual holders may never unwind.
    fn shutdown(&self) {
        let mut holders = self.registry().holders.lock();
        if !holders.is_empty() {
            holders.clear();
            debug!(service = self.name(), "shutdown requested");
            self.on_stop();
        }
    }
}

/// RAII service reference: registered while alive, released on drop.
///
/// Holds a [`Weak`] so the guard expresses *use*, not ownership; if the
/// service itself is dropped first the guard's release quietly does nothing.
pub struct ServiceRef {
    service: Weak<dyn Service>,
    holder: HolderId,
}

impl ServiceRef {
    /// Registers a fresh holder on `service`, starting it if necessary.
    pub fn acquire(service: &Arc<dyn Service>) -> Result<Self> {
        let holder = HolderId::next();
        service.add_ref(holder)?;
        Ok(Self {
            service: Arc::downgrade(service),
            holder,
        })
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }
}

impl Drop for ServiceRef {
    fn drop(&mut self) {
        match self.service.upgrade() {
            Some(service) => service.remove_ref(self.holder),
            None => warn!("service dropped before its reference was released"),
        }
    }
}

impl std::fmt::Debug for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRef")
            .field("holder", &self.holder)
            .finish()
    }
}
