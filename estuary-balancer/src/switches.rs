use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use estuary_core::{Ipv4Prefix, Target};

use crate::dispatcher::DispatchResult;
use crate::transition::Transition;

pub(crate) mod memory;

pub(crate) type SwitchId = u64;

/// One final-state forwarding rule: traffic from `prefix` goes to `target`.
///
/// This is the control-plane representation handed to the forwarding
/// integration; the wire-level encoding is the integration's business.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct SwitchRule {
    pub(crate) prefix: Ipv4Prefix,
    pub(crate) target: Target,
}

/// A temporary migration rule: new connections from the region go to the
/// new targets while established connections keep draining to the old
/// ones. Expires on its own after roughly one reassignment interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct TransitionRule {
    pub(crate) transition: Transition,
    pub(crate) expiry_secs: u64,
}

/// The per-device operations the control plane needs from the forwarding
/// integration. Implementations talk whatever protocol their device
/// speaks; the control plane only sees these calls.
#[async_trait]
pub(crate) trait SwitchClient: Send + Sync {
    async fn install_rules(&self, rules: &[SwitchRule]) -> DispatchResult<()>;

    async fn remove_rules(&self, prefixes: &[Ipv4Prefix]) -> DispatchResult<()>;

    async fn install_transitions(&self, rules: &[TransitionRule]) -> DispatchResult<()>;

    async fn read_byte_counters(&self) -> DispatchResult<Vec<(Ipv4Prefix, u64)>>;
}

/// Registry of currently connected switches, keyed by the opaque IDs the
/// topology layer hands out.
#[derive(Clone, Default)]
pub(crate) struct Switches {
    inner: Arc<DashMap<SwitchId, Arc<dyn SwitchClient>>>,
}

impl Switches {
    pub(crate) fn new() -> Self {
        Switches::default()
    }

    pub(crate) fn connect(&self, switch_id: SwitchId, client: Arc<dyn SwitchClient>) {
        self.inner.insert(switch_id, client);
    }

    /// Used by the topology integration when a device drops off.
    #[allow(dead_code)]
    pub(crate) fn disconnect(&self, switch_id: SwitchId) {
        self.inner.remove(&switch_id);
    }

    pub(crate) fn get(&self, switch_id: SwitchId) -> Option<Arc<dyn SwitchClient>> {
        self.inner.get(&switch_id).map(|entry| entry.value().clone())
    }

    /// Snapshot of the connected switch IDs, in ascending order so batch
    /// logs stay readable.
    pub(crate) fn ids(&self) -> Vec<SwitchId> {
        let mut ids: Vec<SwitchId> = self.inner.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}
