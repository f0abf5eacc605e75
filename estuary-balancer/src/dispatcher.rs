use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::switches::{SwitchClient, SwitchId, Switches};

#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    /// Constructed by forwarding integrations when the device drops
    /// mid-operation.
    #[allow(dead_code)]
    #[error("Switch {0} is not connected")]
    Unreachable(SwitchId),

    #[error("Unit of work timed out after {0:?}")]
    Timeout(Duration),

    #[error("Switch client error: {0}")]
    Client(String),
}

pub(crate) type DispatchResult<T> = Result<T, DispatchError>;

/// Fans one unit of work out to every requested switch concurrently and
/// joins all of them before returning.
///
/// Units are independent by construction: their target devices are
/// disjoint, no unit sees another's result, and a failing unit never
/// cancels its siblings. Each unit runs under a timeout so a wedged device
/// cannot stall a rollout indefinitely.
pub(crate) struct Dispatcher {
    switches: Switches,
    unit_timeout: Duration,
}

impl Dispatcher {
    pub(crate) fn new(switches: Switches, unit_timeout: Duration) -> Self {
        Dispatcher {
            switches,
            unit_timeout,
        }
    }

    /// Runs `unit` once per (deduplicated) switch ID, all started
    /// together, and collects every unit's own result into the returned
    /// map. A switch absent from the map was not connected when the batch
    /// started. An empty ID list returns immediately without spawning.
    pub(crate) async fn run_on_each<T, F, Fut>(
        &self,
        switch_ids: &[SwitchId],
        unit: F,
    ) -> HashMap<SwitchId, DispatchResult<T>>
    where
        F: Fn(SwitchId, Arc<dyn SwitchClient>) -> Fut,
        Fut: Future<Output = DispatchResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut results = HashMap::new();
        if switch_ids.is_empty() {
            return results;
        }

        let mut started = HashSet::new();
        let mut units = JoinSet::new();
        for &switch_id in switch_ids {
            if !started.insert(switch_id) {
                continue;
            }
            let client = match self.switches.get(switch_id) {
                Some(client) => client,
                None => {
                    warn!(switch_id, "switch not connected, no unit dispatched");
                    continue;
                }
            };
            let work = unit(switch_id, client);
            let timeout = self.unit_timeout;
            units.spawn(async move {
                match tokio::time::timeout(timeout, work).await {
                    Ok(result) => (switch_id, result),
                    Err(_) => (switch_id, Err(DispatchError::Timeout(timeout))),
                }
            });
        }

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((switch_id, result)) => {
                    if let Err(e) = &result {
                        warn!(switch_id, error = %e, "dispatch unit failed");
                    }
                    results.insert(switch_id, result);
                }
                Err(e) => error!(error = %e, "dispatch unit aborted"),
            }
        }
        results
    }
}
