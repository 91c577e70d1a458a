use chrono::Utc;
use payrecon_types::{
    DateRange, ExternalRef, LedgerError, LedgerStore, LedgerTransaction, NewLedgerTransaction,
    Operation, TransactionId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct LedgerState {
    transactions: Vec<LedgerTransaction>,
    by_id: HashMap<TransactionId, usize>,
    reversed: HashSet<TransactionId>,
}

/// Thread-safe, append-only in-memory ledger.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedgerStore {
    /// Create a new empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transaction ever recorded, in insertion order.
    pub fn all_transactions(&self) -> Vec<LedgerTransaction> {
        self.state
            .lock()
            .map_or_else(|_| Vec::new(), |state| state.transactions.clone())
    }

    fn lock(&self, operation: Operation) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::StoreFailure { operation })
    }
}

/// Validate a batch against the current state and materialize it. Nothing is
/// written unless every transaction passes.
fn prepare(
    state: &LedgerState,
    batch: Vec<NewLedgerTransaction>,
) -> Result<Vec<LedgerTransaction>, LedgerError> {
    let recorded_at = Utc::now();
    let mut prepared: Vec<LedgerTransaction> = Vec::with_capacity(batch.len());
    let mut reversed_in_batch: HashSet<TransactionId> = HashSet::new();

    for transaction in batch {
        transaction.validate()?;

        if let Some(target_id) = transaction.reverses {
            let target = state
                .by_id
                .get(&target_id)
                .map(|index| &state.transactions[*index])
                .or_else(|| prepared.iter().find(|tx| tx.id == target_id))
                .ok_or(LedgerError::ReversalTargetNotFound { id: target_id })?;
            if target.external_ref != transaction.external_ref {
                return Err(LedgerError::ReversalReferenceMismatch {
                    id: target_id,
                    expected: target.external_ref.clone(),
                });
            }
            if state.reversed.contains(&target_id) || !reversed_in_batch.insert(target_id) {
                return Err(LedgerError::AlreadyReversed { id: target_id });
            }
        }

        prepared.push(LedgerTransaction::from_new(
            TransactionId::generate(),
            recorded_at,
            transaction,
        ));
    }
    Ok(prepared)
}

fn sorted(mut transactions: Vec<LedgerTransaction>) -> Vec<LedgerTransaction> {
    transactions.sort_by_key(LedgerTransaction::chronology);
    transactions
}

impl LedgerStore for InMemoryLedgerStore {
    async fn record_transaction(
        &self,
        transaction: NewLedgerTransaction,
    ) -> Result<TransactionId, LedgerError> {
        let ids = self.record_batch(vec![transaction]).await?;
        ids.into_iter().next().ok_or(LedgerError::StoreFailure {
            operation: Operation::RecordTransaction,
        })
    }

    async fn record_batch(
        &self,
        transactions: Vec<NewLedgerTransaction>,
    ) -> Result<Vec<TransactionId>, LedgerError> {
        let mut state = self.lock(Operation::RecordTransaction)?;
        let prepared = prepare(&state, transactions)?;

        let mut ids = Vec::with_capacity(prepared.len());
        for transaction in prepared {
            if let Some(target) = transaction.reverses {
                let _ = state.reversed.insert(target);
            }
            ids.push(transaction.id);
            let index = state.transactions.len();
            let _ = state.by_id.insert(transaction.id, index);
            state.transactions.push(transaction);
        }
        Ok(ids)
    }

    async fn transactions_in_range(
        &self,
        range: DateRange,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let state = self.lock(Operation::ReadLedger)?;
        Ok(sorted(
            state
                .transactions
                .iter()
                .filter(|tx| range.contains(tx.occurred_at))
                .cloned()
                .collect(),
        ))
    }

    async fn find_by_external_ref(
        &self,
        external_ref: &ExternalRef,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let state = self.lock(Operation::ReadLedger)?;
        Ok(sorted(
            state
                .transactions
                .iter()
                .filter(|tx| &tx.external_ref == external_ref)
                .cloned()
                .collect(),
        ))
    }
}
