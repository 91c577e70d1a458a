//! Built-in outbox handlers for the messages the reconciliation engine emits.

use crate::messages::{CreateMissingLedgerEntry, ReconciliationAlert};
use async_trait::async_trait;
use payrecon_types::{
    AccountCode, EntryKind, ErrorClass, HandlerError, LedgerError, LedgerPosting, LedgerStore,
    NewLedgerTransaction, OutboxHandler, OutboxMessage, SettlementStatus,
};
use std::sync::Arc;
use tracing::{info, warn};

fn ledger_failure(error: &LedgerError) -> HandlerError {
    if error.class() == ErrorClass::TransientInfrastructure {
        HandlerError::retryable(error.to_string())
    } else {
        HandlerError::fatal(error.to_string())
    }
}

/// Records the ledger entry for a payment the processor settled but the
/// platform never booked.
///
/// The entry debits the clearing account with the reported net amount and
/// credits the suspense account, where an operator later moves it to the
/// right revenue and payable accounts. Redelivery is harmless: once the
/// reference has any ledger transaction the message is acknowledged without
/// writing.
pub struct CreateMissingLedgerEntryHandler<L> {
    ledger: Arc<L>,
    clearing_account: AccountCode,
    suspense_account: AccountCode,
}

impl<L> CreateMissingLedgerEntryHandler<L> {
    pub const fn new(
        ledger: Arc<L>,
        clearing_account: AccountCode,
        suspense_account: AccountCode,
    ) -> Self {
        Self {
            ledger,
            clearing_account,
            suspense_account,
        }
    }
}

#[async_trait]
impl<L> OutboxHandler for CreateMissingLedgerEntryHandler<L>
where
    L: LedgerStore + 'static,
{
    async fn handle(&self, message: &OutboxMessage) -> Result<(), HandlerError> {
        let request: CreateMissingLedgerEntry = message
            .payload_as()
            .map_err(|error| HandlerError::fatal(format!("malformed payload: {error}")))?;
        if request.status == SettlementStatus::Failed {
            return Err(HandlerError::fatal(format!(
                "refusing to book failed payment {}",
                request.external_ref
            )));
        }

        let existing = self
            .ledger
            .find_by_external_ref(&request.external_ref)
            .await
            .map_err(|error| ledger_failure(&error))?;
        if !existing.is_empty() {
            info!(
                external_ref = %request.external_ref,
                "[ledger.create_missing] reference already booked, nothing to do"
            );
            return Ok(());
        }
        if request.amount.is_zero() {
            return Ok(());
        }

        let transaction = NewLedgerTransaction::new(
            request.external_ref.clone(),
            EntryKind::Adjustment,
            request.status,
            request.settled_at,
        )
        .with_posting(LedgerPosting::new(
            self.clearing_account.clone(),
            request.amount,
            request.currency.clone(),
        ))
        .with_posting(LedgerPosting::new(
            self.suspense_account.clone(),
            -request.amount,
            request.currency.clone(),
        ))
        .for_discrepancy(request.discrepancy_id);

        let id = self
            .ledger
            .record_transaction(transaction)
            .await
            .map_err(|error| ledger_failure(&error))?;
        info!(
            external_ref = %request.external_ref,
            transaction_id = %id,
            amount = %request.amount,
            currency = %request.currency,
            "[ledger.create_missing] booked against suspense"
        );
        Ok(())
    }
}

/// Surfaces reconciliation alerts in the structured log.
///
/// Deployments that page operators register a different handler for the
/// same message type.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertLogHandler;

#[async_trait]
impl OutboxHandler for AlertLogHandler {
    async fn handle(&self, message: &OutboxMessage) -> Result<(), HandlerError> {
        let alert: ReconciliationAlert = message
            .payload_as()
            .map_err(|error| HandlerError::fatal(format!("malformed payload: {error}")))?;

        warn!(
            run_id = %alert.run_id,
            discrepancy_id = %alert.discrepancy_id,
            external_ref = %alert.external_ref,
            kind = alert.kind.as_str(),
            currency = %alert.currency,
            expected_amount = ?alert.expected_amount,
            reported_amount = ?alert.reported_amount,
            note = alert.note.as_deref().unwrap_or_default(),
            "[reconciliation.alert] discrepancy needs review"
        );
        Ok(())
    }
}
