use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use estuary_core::Ipv4Prefix;

use crate::dispatcher::{DispatchError, DispatchResult};
use crate::switches::{SwitchClient, SwitchRule, TransitionRule};

/// In-memory switch client that records every operation it receives and
/// serves byte counters seeded by the caller.
/// SHOULD BE USED ONLY FOR TESTS AND STANDALONE DRY RUNS
#[derive(Debug, Default)]
pub(crate) struct MemorySwitch {
    log: Mutex<Vec<RecordedOp>>,
    counters: Mutex<Vec<(Ipv4Prefix, u64)>>,
    fail_installs: AtomicBool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RecordedOp {
    InstallRules(Vec<SwitchRule>),
    RemoveRules(Vec<Ipv4Prefix>),
    InstallTransitions(Vec<TransitionRule>),
}

#[allow(dead_code)]
impl MemorySwitch {
    pub(crate) fn new() -> Self {
        MemorySwitch::default()
    }

    /// Everything installed or removed so far, in call order.
    pub(crate) async fn recorded(&self) -> Vec<RecordedOp> {
        self.log.lock().await.clone()
    }

    /// Seeds the counters the next `read_byte_counters` call returns.
    pub(crate) async fn set_byte_counters(&self, counters: Vec<(Ipv4Prefix, u64)>) {
        *self.counters.lock().await = counters;
    }

    /// Makes every subsequent install call fail, for failure-isolation
    /// tests.
    pub(crate) fn fail_installs(&self, fail: bool) {
        self.fail_installs.store(fail, Ordering::SeqCst);
    }

    fn check_install(&self) -> DispatchResult<()> {
        if self.fail_installs.load(Ordering::SeqCst) {
            return Err(DispatchError::Client("injected install failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SwitchClient for MemorySwitch {
    async fn install_rules(&self, rules: &[SwitchRule]) -> DispatchResult<()> {
        self.check_install()?;
        self.log
            .lock()
            .await
            .push(RecordedOp::InstallRules(rules.to_vec()));
        Ok(())
    }

    async fn remove_rules(&self, prefixes: &[Ipv4Prefix]) -> DispatchResult<()> {
        self.log
            .lock()
            .await
            .push(RecordedOp::RemoveRules(prefixes.to_vec()));
        Ok(())
    }

    async fn install_transitions(&self, rules: &[TransitionRule]) -> DispatchResult<()> {
        self.check_install()?;
        self.log
            .lock()
            .await
            .push(RecordedOp::InstallTransitions(rules.to_vec()));
        Ok(())
    }

    async fn read_byte_counters(&self) -> DispatchResult<Vec<(Ipv4Prefix, u64)>> {
        Ok(self.counters.lock().await.clone())
    }
}
