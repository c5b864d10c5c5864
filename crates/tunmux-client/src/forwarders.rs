//! Registry of running forwarders
//!
//! Tracks port-forward and SOCKS5 bridges by ID so the command layer can list
//! and remove them. Bridges are closed outside the registry lock.

use crate::forward::{Bridge, ForwarderInfo, ForwarderType};
use crate::ids::IdAllocator;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};
use tunmux_proto::ForwarderId;

struct ForwarderEntry {
    info: ForwarderInfo,
    bridge: Box<dyn Bridge>,
}

struct Inner {
    ids: IdAllocator,
    forwarders: RwLock<BTreeMap<ForwarderId, ForwarderEntry>>,
}

/// Registry of active forwarders, shareable across tasks
#[derive(Clone)]
pub struct ForwarderRegistry {
    inner: Arc<Inner>,
}

impl ForwarderRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                ids: IdAllocator::new(),
                forwarders: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Register a running bridge and return its new ID
    pub fn add(&self, bridge: impl Bridge + 'static) -> ForwarderId {
        let id = self.inner.ids.next_id();
        let info = ForwarderInfo {
            id,
            session_id: bridge.session_id().to_string(),
            bind_addr: bridge.local_addr(),
            kind: bridge.kind(),
        };

        info!(
            forwarder_id = id,
            session_id = %info.session_id,
            bind_addr = %info.bind_addr,
            kind = ?info.kind,
            "Registered forwarder"
        );

        self.inner
            .forwarders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ForwarderEntry {
                    info,
                    bridge: Box::new(bridge),
                },
            );

        id
    }

    /// Close and remove a forwarder; `false` if the ID is unknown
    ///
    /// With `close_active` its bridged connections are closed too; otherwise
    /// they drain.
    pub fn remove(&self, id: ForwarderId, close_active: bool) -> bool {
        let entry = self
            .inner
            .forwarders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        match entry {
            Some(entry) => {
                entry.bridge.close(close_active);
                info!(
                    forwarder_id = id,
                    close_active = close_active,
                    "Removed forwarder"
                );
                true
            }
            None => {
                debug!(forwarder_id = id, "Forwarder not found");
                false
            }
        }
    }

    /// Snapshot of all forwarders, ordered by ID
    pub fn list(&self) -> Vec<ForwarderInfo> {
        self.list_filtered(None, None)
    }

    /// Snapshot of the forwarders belonging to `session_id`, ordered by ID
    pub fn list_for_session(&self, session_id: &str) -> Vec<ForwarderInfo> {
        self.list_filtered(Some(session_id), None)
    }

    /// Snapshot filtered by session and forwarder type, ordered by ID
    ///
    /// A `None` filter matches everything.
    pub fn list_filtered(
        &self,
        session_id: Option<&str>,
        forwarder_type: Option<ForwarderType>,
    ) -> Vec<ForwarderInfo> {
        self.inner
            .forwarders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.info.matches(session_id, forwarder_type))
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn get(&self, id: ForwarderId) -> Option<ForwarderInfo> {
        self.inner
            .forwarders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|entry| entry.info.clone())
    }

    pub fn len(&self) -> usize {
        self.inner
            .forwarders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and remove every forwarder belonging to `session_id`
    pub fn close_for_session(&self, session_id: &str, close_active: bool) -> usize {
        self.close_filtered(Some(session_id), None, close_active)
    }

    /// Close and remove every forwarder matching both filters
    ///
    /// A `None` filter matches everything.
    pub fn close_filtered(
        &self,
        session_id: Option<&str>,
        forwarder_type: Option<ForwarderType>,
        close_active: bool,
    ) -> usize {
        let removed = self.drain_where(
            |entry| entry.info.matches(session_id, forwarder_type),
            close_active,
        );
        if removed > 0 {
            info!(
                session_id = ?session_id,
                forwarder_type = ?forwarder_type,
                count = removed,
                "Closed forwarders"
            );
        }
        removed
    }

    /// Close and remove every forwarder
    pub fn close_all(&self, close_active: bool) -> usize {
        self.drain_where(|_| true, close_active)
    }

    fn drain_where(
        &self,
        predicate: impl Fn(&ForwarderEntry) -> bool,
        close_active: bool,
    ) -> usize {
        let drained: Vec<ForwarderEntry> = {
            let mut forwarders = self
                .inner
                .forwarders
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<ForwarderId> = forwarders
                .iter()
                .filter(|(_, entry)| predicate(entry))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| forwarders.remove(id)).collect()
        };

        for entry in &drained {
            entry.bridge.close(close_active);
        }
        drained.len()
    }
}

impl ForwarderInfo {
    fn matches(&self, session_id: Option<&str>, forwarder_type: Option<ForwarderType>) -> bool {
        session_id.map_or(true, |session_id| self.session_id == session_id)
            && forwarder_type.map_or(true, |kind| self.kind.forwarder_type() == kind)
    }
}

impl Default for ForwarderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
