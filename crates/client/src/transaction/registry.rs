//! Id keyed lookup of live transactions.
//!
//! Backends and timers never hold a transaction directly. They hold its id, and every
//! asynchronous resumption first hops to the transaction's home thread and only then
//! resolves the id here. A transaction that was dropped in the meantime is simply not
//! found and the resumption is discarded.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use micro_runloop::HopSender;
use once_cell::sync::Lazy;
use tracing::{debug, trace};

use super::Core;
use crate::utils::lock;

/// Identifies one transaction within its [`Registry`]. Never reused.
pub type TransactionId = u64;

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::new()));

struct Entry {
    core: Weak<Core>,
    home: Option<HopSender>,
}

struct Slots {
    next_id: TransactionId,
    entries: HashMap<TransactionId, Entry>,
}

/// The table of live transactions.
///
/// Transactions created with [`Transaction::new`](crate::Transaction::new) share the
/// process wide [`Registry::global`]; tests and embedders may inject their own.
pub struct Registry {
    slots: Mutex<Slots>,
}

impl Registry {
    pub fn new() -> Self {
        Self { slots: Mutex::new(Slots { next_id: 1, entries: HashMap::new() }) }
    }

    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Number of transactions currently alive.
    pub fn len(&self) -> usize {
        lock(&self.slots).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        lock(&self.slots).entries.contains_key(&id)
    }

    pub(super) fn insert(&self, core: Weak<Core>) -> TransactionId {
        let mut slots = lock(&self.slots);
        let id = slots.next_id;
        slots.next_id += 1;
        slots.entries.insert(id, Entry { core, home: None });
        id
    }

    pub(super) fn bind_home(&self, id: TransactionId, home: HopSender) {
        if let Some(entry) = lock(&self.slots).entries.get_mut(&id) {
            entry.home = Some(home);
        }
    }

    pub(super) fn lookup(&self, id: TransactionId) -> Option<Arc<Core>> {
        lock(&self.slots).entries.get(&id).and_then(|entry| entry.core.upgrade())
    }

    pub(super) fn remove(&self, id: TransactionId) {
        if lock(&self.slots).entries.remove(&id).is_some() {
            trace!(id, "transaction unregistered");
        }
    }

    /// Hops to `id`'s home thread and resumes it there, if it still exists.
    pub(super) fn resume_on_home(self: &Arc<Self>, id: TransactionId, resume: fn(&Arc<Core>)) {
        let home = lock(&self.slots).entries.get(&id).and_then(|entry| entry.home.clone());
        let Some(home) = home else {
            debug!(id, "notification for an unknown transaction dropped");
            return;
        };

        let registry = Arc::clone(self);
        let delivered = home.invoke_on_thread(move || match registry.lookup(id) {
            Some(core) => resume(&core),
            None => trace!(id, "transaction went away before its notification arrived"),
        });
        if !delivered {
            debug!(id, "home thread is gone, notification dropped");
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("live", &self.len()).finish()
    }
}

/// Wakes a transaction whose native step went pending.
///
/// `Send + Sync` and cheap to clone. [`notify`](Self::notify) may be called from any
/// thread, any number of times; extra notifications only cause a harmless re-poll.
#[derive(Clone)]
pub struct Notifier {
    registry: Arc<Registry>,
    id: TransactionId,
}

impl Notifier {
    pub(super) fn new(registry: Arc<Registry>, id: TransactionId) -> Self {
        Self { registry, id }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.id
    }

    pub fn notify(&self) {
        trace!(id = self.id, "transaction notified");
        self.registry.resume_on_home(self.id, Core::process);
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").field("id", &self.id).finish()
    }
}
