use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nutype::nutype;
use payrecon_types::{
    DateRange, ExternalRef, LedgerError, LedgerStore, LedgerTransaction, MessageId,
    NewLedgerTransaction, NewOutboxMessage, Operation, OutboxError, OutboxMessage, OutboxStore,
    TransactionId, WorkerId,
};
use rand::{random, rngs::StdRng, Rng, SeedableRng};

/// Probability value for chaos engineering injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// # Examples
///
/// ```ignore
/// use payrecon_testing::chaos::Probability;
///
/// let never = Probability::try_new(0.0).unwrap();
/// let always = Probability::try_new(1.0).unwrap();
///
/// // Values outside [0.0, 1.0] are rejected
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    default = 0.0,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into, Default)
)]
pub struct Probability(f64);

fn clamped(probability: f64) -> Probability {
    Probability::try_new(probability.clamp(0.0, 1.0)).unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    claim_lost_probability: Probability,
}

impl ChaosConfig {
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Probability that any operation fails with a store failure.
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f64) -> Self {
        self.failure_probability = clamped(probability);
        self
    }

    /// Probability that an outbox outcome update reports a lost claim, as if
    /// the lease had moved to another dispatcher.
    #[must_use]
    pub fn with_claim_lost_probability(mut self, probability: f64) -> Self {
        self.claim_lost_probability = clamped(probability);
        self
    }
}

pub trait ChaosStoreExt: Sized {
    fn with_chaos(self, config: ChaosConfig) -> ChaosStore<Self>;
}

/// Wraps an outbox or ledger store and injects failures before delegating.
///
/// Injected failures happen before the inner store is called, so nothing is
/// written when one fires.
pub struct ChaosStore<S> {
    store: S,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl<S> ChaosStore<S> {
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            store,
            config,
            rng: Mutex::new(rng),
        }
    }

    pub const fn inner(&self) -> &S {
        &self.store
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f64 = probability.into();

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        self.rng
            .lock()
            .map(|mut rng| rng.random_bool(probability))
            .unwrap_or(false)
    }

    fn outbox_fault(&self, operation: Operation) -> Option<OutboxError> {
        self.should_inject(self.config.failure_probability)
            .then_some(OutboxError::StoreFailure { operation })
    }

    fn outcome_fault(&self, id: MessageId, worker: &WorkerId) -> Option<OutboxError> {
        if self.should_inject(self.config.claim_lost_probability) {
            return Some(OutboxError::ClaimLost {
                id,
                worker: worker.clone(),
            });
        }
        self.outbox_fault(Operation::MarkOutcome)
    }

    fn ledger_fault(&self, operation: Operation) -> Option<LedgerError> {
        self.should_inject(self.config.failure_probability)
            .then_some(LedgerError::StoreFailure { operation })
    }
}

impl<S> OutboxStore for ChaosStore<S>
where
    S: OutboxStore,
{
    fn enqueue(
        &self,
        message: NewOutboxMessage,
    ) -> impl Future<Output = Result<MessageId, OutboxError>> + Send {
        let fault = self.outbox_fault(Operation::Enqueue);
        let store = &self.store;

        async move {
            if let Some(error) = fault {
                return Err(error);
            }
            store.enqueue(message).await
        }
    }

    fn claim_batch(
        &self,
        max: usize,
        worker: &WorkerId,
        lease: Duration,
    ) -> impl Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send {
        let fault = self.outbox_fault(Operation::ClaimBatch);
        let store = &self.store;

        async move {
            if let Some(error) = fault {
                return Err(error);
            }
            store.claim_batch(max, worker, lease).await
        }
    }

    fn mark_delivered(
        &self,
        id: MessageId,
        worker: &WorkerId,
    ) -> impl Future<Output = Result<(), OutboxError>> + Send {
        let fault = self.outcome_fault(id, worker);
        let store = &self.store;

        async move {
            if let Some(error) = fault {
                return Err(error);
            }
            store.mark_delivered(id, worker).await
        }
    }

    fn mark_failed(
        &self,
        id: MessageId,
        worker: &WorkerId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), OutboxError>> + Send {
        let fault = self.outcome_fault(id, worker);
        let store = &self.store;

        async move {
            if let Some(injected) = fault {
                return Err(injected);
            }
            store.mark_failed(id, worker, error, next_attempt_at).await
        }
    }

    fn mark_exhausted(
        &self,
        id: MessageId,
        worker: &WorkerId,
        error: &str,
    ) -> impl Future<Output = Result<(), OutboxError>> + Send {
        let fault = self.outcome_fault(id, worker);
        let store = &self.store;

        async move {
            if let Some(injected) = fault {
                return Err(injected);
            }
            store.mark_exhausted(id, worker, error).await
        }
    }

    fn get(
        &self,
        id: MessageId,
    ) -> impl Future<Output = Result<Option<OutboxMessage>, OutboxError>> + Send {
        let fault = self.outbox_fault(Operation::ReadOutbox);
        let store = &self.store;

        async move {
            if let Some(error) = fault {
                return Err(error);
            }
            store.get(id).await
        }
    }

    fn list_failed(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send {
        let fault = self.outbox_fault(Operation::ReadOutbox);
        let store = &self.store;

        async move {
            if let Some(error) = fault {
                return Err(error);
            }
            store.list_failed(limit).await
        }
    }

    fn requeue(&self, id: MessageId) -> impl Future<Output = Result<(), OutboxError>> + Send {
        let fault = self.outbox_fault(Operation::MaintainOutbox);
        let store = &self.store;

        async move {
            if let Some(error) = fault {
                return Err(error);
            }
            store.requeue(id).await
        }
    }

    fn archive_delivered(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, OutboxError>> + Send {
        let fault = self.outbox_fault(Operation::MaintainOutbox);
        let store = &self.store;

        async move {
            if let Some(error) = fault {
                return Err(error);
            }
            store.archive_delivered(older_than).await
        }
    }
}

impl<S> LedgerStore for ChaosStore<S>
where
    S: LedgerStore,
{
    fn record_transaction(
        &self,
        transaction: NewLedgerTransaction,
    ) -> impl Future<Output = Result<TransactionId, LedgerError>> + Send {
        let fault = self.ledger_fault(Operation::RecordTransaction);
        let store = &self.store;

        async move {
            if let Some(error) = fault {
                return Err(error);
            }
            store.record_transaction(transaction).await
        }
    }

    fn record_batch(
        &self,
        transactions: Vec<NewLedgerTransaction>,
    ) -> impl Future<Output = Result<Vec<TransactionId>, LedgerError>> + Send {
        let fault = self.ledger_fault(Operation::RecordTransaction);
        let store = &self.store;

        async move {
            if let Some(error) = fault {
                return Err(error);
            }
            store.record_batch(transactions).await
        }
    }

    fn transactions_in_range(
        &self,
        range: DateRange,
    ) -> impl Future<Output = Result<Vec<LedgerTransaction>, LedgerError>> + Send {
        let fault = self.ledger_fault(Operation::ReadLedger);
        let store = &self.store;

        async move {
            if let Some(error) = fault {
                return Err(error);
            }
            store.transactions_in_range(range).await
        }
    }

    fn find_by_external_ref(
        &self,
        external_ref: &ExternalRef,
    ) -> impl Future<Output = Result<Vec<LedgerTransaction>, LedgerError>> + Send {
        let fault = self.ledger_fault(Operation::ReadLedger);
        let store = &self.store;

        async move {
            if let Some(error) = fault {
                return Err(error);
            }
            store.find_by_external_ref(external_ref).await
        }
    }
}

impl<S> ChaosStoreExt for S {
    fn with_chaos(self, config: ChaosConfig) -> ChaosStore<Self> {
        ChaosStore::new(self, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_config_sets_seed() {
        let default_is_none = ChaosConfig::default().deterministic_seed.is_none();
        let deterministic_is_some = ChaosConfig::deterministic().deterministic_seed.is_some();

        assert!(default_is_none && deterministic_is_some);
    }

    #[test]
    fn out_of_range_probabilities_are_clamped() {
        let config = ChaosConfig::default()
            .with_failure_probability(3.0)
            .with_claim_lost_probability(-1.0);

        assert_eq!(f64::from(config.failure_probability), 1.0);
        assert_eq!(f64::from(config.claim_lost_probability), 0.0);
    }

    #[test]
    fn zero_probability_never_injects() {
        let chaos = ChaosStore::new((), ChaosConfig::deterministic());

        assert!((0..100).all(|_| !chaos.should_inject(Probability::default())));
    }
}
