//! Explicit dependency context.
//!
//! Holds the shared store and bus handles and hands out components wired to
//! them. Every component receives its collaborators at construction; nothing
//! is reached through process-global state.

use std::sync::Arc;

use payflow_events::{Consumer, EventBus};

use crate::accounts::AccountDirectory;
use crate::config::PayflowConfig;
use crate::dead_letter::DeadLetterSink;
use crate::engine::BalanceMutationEngine;
use crate::initiator::TransferInitiator;
use crate::settlement::{SettlementWorker, Settler};
use crate::store::LedgerStore;

#[derive(Debug)]
pub struct LedgerContext<S, B> {
    store: S,
    bus: Arc<B>,
    config: PayflowConfig,
}

impl<S: Clone, B> Clone for LedgerContext<S, B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, B> LedgerContext<S, B>
where
    S: LedgerStore + Clone,
{
    pub fn new(store: S, bus: Arc<B>, config: PayflowConfig) -> Self {
        Self { store, bus, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub fn config(&self) -> &PayflowConfig {
        &self.config
    }

    pub fn accounts(&self) -> AccountDirectory<S> {
        AccountDirectory::new(self.store.clone())
    }

    pub fn engine(&self) -> BalanceMutationEngine<S> {
        BalanceMutationEngine::new(self.store.clone(), self.config.mutation.retry.clone())
    }

    pub fn settler(&self) -> Settler<S> {
        Settler::new(self.store.clone())
    }

    pub fn initiator(&self) -> TransferInitiator<S, Arc<B>>
    where
        B: EventBus<Vec<u8>>,
    {
        TransferInitiator::new(
            self.store.clone(),
            self.bus.clone(),
            self.config.mutation.publish_retry.clone(),
        )
    }

    /// Settlement worker consuming from this context's bus.
    pub fn settlement_worker<D>(&self, dead_letters: D) -> SettlementWorker<S, Arc<B>, D>
    where
        S: 'static,
        B: Consumer<Vec<u8>> + 'static,
        D: DeadLetterSink + 'static,
    {
        SettlementWorker::new(
            self.settler(),
            self.bus.clone(),
            dead_letters,
            &self.config.settlement,
        )
    }
}
