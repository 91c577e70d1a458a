//! Reconciliation engine.
//!
//! Compares a processor settlement report with the ledger as a full outer join
//! keyed by external reference. [`diff`] is the pure part: it depends only on
//! the two input sets, never on their order, and returns entries sorted by
//! reference. [`ReconciliationEngine`] applies the resulting actions through
//! the stores: it records discrepancies, posts automatic corrections and
//! enqueues follow-up outbox messages.
//!
//! Amount semantics:
//! - ledger side: net of the reference's postings on the clearing account;
//! - processor side: sales minus refunds.
//!
//! Status semantics: the status of the latest record on each side. On the
//! ledger side reversals and reversed transactions are skipped, so that a
//! corrected copy supersedes the entry it replaced.

use crate::config::ReconciliationPolicy;
use crate::messages::{
    create_missing_ledger_entry_type, reconciliation_alert_type, CreateMissingLedgerEntry,
    ReconciliationAlert,
};
use chrono::{DateTime, Utc};
use payrecon_types::{
    time, AccountCode, Currency, DateRange, Discrepancy, DiscrepancyId, DiscrepancyKind,
    EntryKind, ErrorClass, ExternalRef, GatewayTransactionRecord, LedgerError,
    LedgerPosting, LedgerStore, LedgerTransaction, MessageId, MessageTypeError,
    NewLedgerTransaction, NewOutboxMessage, OutboxError, OutboxStore, PartitionKey, Resolution,
    RunCounts, RunError, RunId, RunStore, SettlementStatus, TransactionId,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Follow-up the engine takes for one diff entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    None,
    /// Reverse `target` and post a corrected copy shifted by `delta`.
    AutoCorrect {
        target: LedgerTransaction,
        delta: Decimal,
        status: SettlementStatus,
    },
    /// Ask the outbox to create the ledger entry the platform never recorded.
    CreateMissingEntry {
        amount: Decimal,
        status: SettlementStatus,
        settled_at: DateTime<Utc>,
    },
}

/// One classified disagreement, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub external_ref: ExternalRef,
    pub kind: DiscrepancyKind,
    /// Proposed resolution. An `AutoCorrected` proposal becomes
    /// `PendingReview` if the correction is rejected by the ledger.
    pub resolution: Resolution,
    pub currency: Currency,
    pub expected_amount: Option<Decimal>,
    pub reported_amount: Option<Decimal>,
    pub expected_status: Option<SettlementStatus>,
    pub reported_status: Option<SettlementStatus>,
    pub note: Option<String>,
    pub action: Action,
}

/// Result of [`diff`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffReport {
    /// Discrepancies ordered by external reference.
    pub entries: Vec<DiffEntry>,
    /// References on both sides with equal amount and status.
    pub matched: u64,
    /// Ledger-only references still inside the grace period.
    pub deferred: u64,
}

struct LedgerSide<'a> {
    amounts: BTreeMap<Currency, Decimal>,
    /// Currency of the latest transaction, for references without clearing
    /// activity.
    posted_currency: Currency,
    status: SettlementStatus,
    last_occurred_at: DateTime<Utc>,
    /// Latest transaction that is neither a reversal nor reversed.
    current: Option<&'a LedgerTransaction>,
}

struct GatewaySide {
    amounts: BTreeMap<Currency, Decimal>,
    status: SettlementStatus,
    last_settled_at: DateTime<Utc>,
}

fn summarize_ledger<'a>(
    transactions: &'a [LedgerTransaction],
    clearing: &AccountCode,
) -> BTreeMap<ExternalRef, LedgerSide<'a>> {
    let mut unique: BTreeMap<TransactionId, &'a LedgerTransaction> = BTreeMap::new();
    for transaction in transactions {
        let _ = unique.entry(transaction.id).or_insert(transaction);
    }
    let reversed: BTreeSet<TransactionId> =
        unique.values().filter_map(|tx| tx.reverses).collect();

    let mut grouped: BTreeMap<ExternalRef, Vec<&'a LedgerTransaction>> = BTreeMap::new();
    for transaction in unique.into_values() {
        grouped
            .entry(transaction.external_ref.clone())
            .or_default()
            .push(transaction);
    }

    grouped
        .into_iter()
        .filter_map(|(external_ref, transactions)| {
            let mut amounts: BTreeMap<Currency, Decimal> = BTreeMap::new();
            for transaction in &transactions {
                for (currency, amount) in transaction.net_on(clearing) {
                    *amounts.entry(currency).or_default() += amount;
                }
            }
            let latest = transactions.iter().max_by_key(|tx| tx.chronology())?;
            let current = transactions
                .iter()
                .filter(|tx| tx.kind != EntryKind::Reversal && !reversed.contains(&tx.id))
                .max_by_key(|tx| tx.chronology())
                .copied();
            let last_occurred_at = transactions.iter().map(|tx| tx.occurred_at).max()?;
            let posted_currency = latest.postings.first()?.currency.clone();
            let side = LedgerSide {
                amounts,
                posted_currency,
                status: current.map_or(latest.status, |tx| tx.status),
                last_occurred_at,
                current,
            };
            Some((external_ref, side))
        })
        .collect()
}

fn summarize_gateway(records: &[GatewayTransactionRecord]) -> BTreeMap<ExternalRef, GatewaySide> {
    let mut grouped: BTreeMap<ExternalRef, Vec<&GatewayTransactionRecord>> = BTreeMap::new();
    for record in records {
        grouped
            .entry(record.external_ref.clone())
            .or_default()
            .push(record);
    }

    grouped
        .into_iter()
        .filter_map(|(external_ref, records)| {
            let mut amounts: BTreeMap<Currency, Decimal> = BTreeMap::new();
            for record in &records {
                *amounts.entry(record.currency.clone()).or_default() += record.signed_amount();
            }
            let latest = records
                .iter()
                .max_by_key(|r| (r.settled_at, r.kind, r.amount, r.status))?;
            let side = GatewaySide {
                amounts,
                status: latest.status,
                last_settled_at: latest.settled_at,
            };
            Some((external_ref, side))
        })
        .collect()
}

fn describe(amounts: &BTreeMap<Currency, Decimal>) -> String {
    amounts
        .iter()
        .map(|(currency, amount)| format!("{amount} {currency}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn first_nonzero(amounts: &BTreeMap<Currency, Decimal>) -> Option<(&Currency, Decimal)> {
    amounts
        .iter()
        .find(|(_, amount)| !amount.is_zero())
        .map(|(currency, amount)| (currency, *amount))
}

fn has_clearing_line(
    transaction: &LedgerTransaction,
    clearing: &AccountCode,
    currency: &Currency,
) -> bool {
    transaction
        .postings
        .iter()
        .any(|p| &p.account == clearing && &p.currency == currency)
}

/// Classify every reference present on either side.
///
/// `ledger` must contain every ledger transaction of every reference that
/// appears in `records`, plus the ledger transactions of the reconciled range.
/// The result does not depend on the order of either input.
pub fn diff(
    ledger: &[LedgerTransaction],
    records: &[GatewayTransactionRecord],
    policy: &ReconciliationPolicy,
    now: DateTime<Utc>,
) -> DiffReport {
    let ledger_sides = summarize_ledger(ledger, &policy.clearing_account);
    let gateway_sides = summarize_gateway(records);
    let references: BTreeSet<&ExternalRef> =
        ledger_sides.keys().chain(gateway_sides.keys()).collect();

    let mut report = DiffReport::default();
    for external_ref in references {
        let entry = match (ledger_sides.get(external_ref), gateway_sides.get(external_ref)) {
            (Some(ledger_side), Some(gateway_side)) => {
                compare(external_ref, ledger_side, gateway_side, policy)
            }
            (Some(ledger_side), None) => {
                let entry = missing_in_gateway(external_ref, ledger_side, policy, now);
                if entry.is_none() {
                    report.deferred += 1;
                }
                entry
            }
            (None, Some(gateway_side)) => missing_in_ledger(external_ref, gateway_side),
            (None, None) => None,
        };
        match entry {
            Some(entry) => report.entries.push(entry),
            None if gateway_sides.contains_key(external_ref) => report.matched += 1,
            None => {}
        }
    }
    report
}

fn compare(
    external_ref: &ExternalRef,
    ledger: &LedgerSide<'_>,
    gateway: &GatewaySide,
    policy: &ReconciliationPolicy,
) -> Option<DiffEntry> {
    let currencies: BTreeSet<&Currency> =
        ledger.amounts.keys().chain(gateway.amounts.keys()).collect();
    let gateway_currency = gateway.amounts.keys().next()?;

    let base = DiffEntry {
        external_ref: external_ref.clone(),
        kind: DiscrepancyKind::AmountMismatch,
        resolution: Resolution::PendingReview,
        currency: gateway_currency.clone(),
        expected_amount: None,
        reported_amount: None,
        expected_status: Some(ledger.status),
        reported_status: Some(gateway.status),
        note: None,
        action: Action::None,
    };

    if currencies.len() > 1 {
        let agree = currencies.iter().all(|currency| {
            ledger.amounts.get(*currency).copied().unwrap_or_default()
                == gateway.amounts.get(*currency).copied().unwrap_or_default()
        });
        if agree && ledger.status == gateway.status {
            return None;
        }
        let ledger_amount = ledger.amounts.values().next().copied().unwrap_or_default();
        return Some(DiffEntry {
            expected_amount: Some(ledger_amount),
            reported_amount: gateway.amounts.get(gateway_currency).copied(),
            note: Some(format!(
                "currency mismatch: ledger {}, gateway {}",
                describe(&ledger.amounts),
                describe(&gateway.amounts)
            )),
            kind: if agree {
                DiscrepancyKind::StatusMismatch
            } else {
                DiscrepancyKind::AmountMismatch
            },
            ..base
        });
    }

    let expected = ledger
        .amounts
        .get(gateway_currency)
        .copied()
        .unwrap_or_default();
    let reported = gateway
        .amounts
        .get(gateway_currency)
        .copied()
        .unwrap_or_default();

    if expected != reported {
        let delta = reported - expected;
        let correctable = !policy.auto_correct_threshold.is_zero()
            && delta.abs() <= policy.auto_correct_threshold
            && gateway.status != SettlementStatus::Failed;
        let target = ledger
            .current
            .filter(|tx| has_clearing_line(tx, &policy.clearing_account, gateway_currency));

        let (resolution, action) = match target {
            Some(target) if correctable => (
                Resolution::AutoCorrected,
                Action::AutoCorrect {
                    target: target.clone(),
                    delta,
                    status: gateway.status,
                },
            ),
            _ => (Resolution::PendingReview, Action::None),
        };
        return Some(DiffEntry {
            resolution,
            expected_amount: Some(expected),
            reported_amount: Some(reported),
            action,
            ..base
        });
    }

    if ledger.status != gateway.status {
        return Some(DiffEntry {
            kind: DiscrepancyKind::StatusMismatch,
            expected_amount: Some(expected),
            reported_amount: Some(reported),
            ..base
        });
    }

    None
}

fn missing_in_gateway(
    external_ref: &ExternalRef,
    ledger: &LedgerSide<'_>,
    policy: &ReconciliationPolicy,
    now: DateTime<Utc>,
) -> Option<DiffEntry> {
    let Some((currency, amount)) = first_nonzero(&ledger.amounts) else {
        let currency = ledger
            .amounts
            .keys()
            .next()
            .unwrap_or(&ledger.posted_currency);
        return Some(DiffEntry {
            external_ref: external_ref.clone(),
            kind: DiscrepancyKind::MissingInGateway,
            resolution: Resolution::Ignored,
            currency: currency.clone(),
            expected_amount: Some(Decimal::ZERO),
            reported_amount: None,
            expected_status: Some(ledger.status),
            reported_status: None,
            note: Some("ledger entries net to zero on the clearing account".to_owned()),
            action: Action::None,
        });
    };

    if time::add_duration(ledger.last_occurred_at, policy.grace_period) > now {
        return None;
    }

    let note = (ledger.amounts.len() > 1)
        .then(|| format!("multi-currency ledger entry: {}", describe(&ledger.amounts)));
    Some(DiffEntry {
        external_ref: external_ref.clone(),
        kind: DiscrepancyKind::MissingInGateway,
        resolution: Resolution::PendingReview,
        currency: currency.clone(),
        expected_amount: Some(amount),
        reported_amount: None,
        expected_status: Some(ledger.status),
        reported_status: None,
        note,
        action: Action::None,
    })
}

fn missing_in_ledger(external_ref: &ExternalRef, gateway: &GatewaySide) -> Option<DiffEntry> {
    let (currency, amount) = first_nonzero(&gateway.amounts)
        .or_else(|| gateway.amounts.keys().next().map(|c| (c, Decimal::ZERO)))?;

    let (resolution, action, note) = if amount.is_zero() {
        (
            Resolution::Ignored,
            Action::None,
            Some("reported sales and refunds net to zero".to_owned()),
        )
    } else if gateway.status == SettlementStatus::Failed {
        (
            Resolution::PendingReview,
            Action::None,
            Some("processor reports the payment as failed".to_owned()),
        )
    } else if gateway.amounts.len() == 1 {
        (
            Resolution::PendingReview,
            Action::CreateMissingEntry {
                amount,
                status: gateway.status,
                settled_at: gateway.last_settled_at,
            },
            None,
        )
    } else {
        (
            Resolution::PendingReview,
            Action::None,
            Some(format!(
                "multi-currency gateway report: {}",
                describe(&gateway.amounts)
            )),
        )
    };

    Some(DiffEntry {
        external_ref: external_ref.clone(),
        kind: DiscrepancyKind::MissingInLedger,
        resolution,
        currency: currency.clone(),
        expected_amount: None,
        reported_amount: Some(amount),
        expected_status: None,
        reported_status: Some(gateway.status),
        note,
        action,
    })
}

/// Error type returned by [`ReconciliationEngine::reconcile`].
#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("invalid message type: {0}")]
    MessageType(#[from] MessageTypeError),
}

impl ReconcileError {
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Ledger(error) => error.class(),
            Self::Outbox(error) => error.class(),
            Self::Run(error) => error.class(),
            Self::MessageType(_) => ErrorClass::Fatal,
        }
    }
}

/// Everything one reconciliation pass produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationOutcome {
    /// Persisted discrepancies ordered by external reference.
    pub discrepancies: Vec<Discrepancy>,
    pub counts: RunCounts,
    /// Outbox messages enqueued as follow-ups.
    pub enqueued: Vec<MessageId>,
}

impl ReconciliationOutcome {
    /// Whether the run found anything besides ignorable discrepancies.
    /// Auto-corrections count, since they changed the ledger.
    pub fn needs_review(&self) -> bool {
        self.discrepancies
            .iter()
            .any(|d| d.resolution != Resolution::Ignored)
    }
}

/// Applies [`diff`] results through the ledger, outbox and run stores.
pub struct ReconciliationEngine<L, O, R> {
    ledger: Arc<L>,
    outbox: Arc<O>,
    runs: Arc<R>,
    policy: ReconciliationPolicy,
}

impl<L, O, R> ReconciliationEngine<L, O, R>
where
    L: LedgerStore,
    O: OutboxStore,
    R: RunStore,
{
    pub const fn new(
        ledger: Arc<L>,
        outbox: Arc<O>,
        runs: Arc<R>,
        policy: ReconciliationPolicy,
    ) -> Self {
        Self {
            ledger,
            outbox,
            runs,
            policy,
        }
    }

    pub const fn policy(&self) -> &ReconciliationPolicy {
        &self.policy
    }

    /// Reconcile `records` against the ledger for `range` within run `run_id`.
    ///
    /// Each discrepancy is persisted as soon as it is handled, so an error
    /// part-way leaves the earlier ones in place for diagnosis.
    #[instrument(
        name = "reconciliation.reconcile",
        skip_all,
        fields(run_id = %run_id, range = %range, records = records.len())
    )]
    pub async fn reconcile(
        &self,
        run_id: RunId,
        range: DateRange,
        now: DateTime<Utc>,
        records: &[GatewayTransactionRecord],
    ) -> Result<ReconciliationOutcome, ReconcileError> {
        let mut transactions = self.ledger.transactions_in_range(range).await?;

        let in_range: BTreeSet<ExternalRef> = transactions
            .iter()
            .map(|tx| tx.external_ref.clone())
            .collect();
        let gateway_only: BTreeSet<&ExternalRef> = records
            .iter()
            .map(|record| &record.external_ref)
            .filter(|external_ref| !in_range.contains(*external_ref))
            .collect();
        for external_ref in gateway_only {
            let history = self.ledger.find_by_external_ref(external_ref).await?;
            if !history.is_empty() {
                debug!(
                    external_ref = %external_ref,
                    transactions = history.len(),
                    "[reconciliation.lookup] ledger entry found outside range"
                );
            }
            transactions.extend(history);
        }

        let report = diff(&transactions, records, &self.policy, now);
        let mut outcome = ReconciliationOutcome {
            counts: RunCounts {
                matched: report.matched,
                ..RunCounts::default()
            },
            ..ReconciliationOutcome::default()
        };

        for entry in report.entries {
            let discrepancy = self.apply(run_id, entry, now, &mut outcome.enqueued).await?;
            match discrepancy.resolution {
                Resolution::AutoCorrected => outcome.counts.adjusted += 1,
                Resolution::PendingReview => outcome.counts.unmatched += 1,
                Resolution::Ignored => outcome.counts.ignored += 1,
            }
            outcome.discrepancies.push(discrepancy);
        }

        info!(
            matched = outcome.counts.matched,
            unmatched = outcome.counts.unmatched,
            adjusted = outcome.counts.adjusted,
            ignored = outcome.counts.ignored,
            deferred = report.deferred,
            "[reconciliation.diff] reconciled"
        );
        Ok(outcome)
    }

    async fn apply(
        &self,
        run_id: RunId,
        entry: DiffEntry,
        now: DateTime<Utc>,
        enqueued: &mut Vec<MessageId>,
    ) -> Result<Discrepancy, ReconcileError> {
        let id = DiscrepancyId::generate();
        let mut resolution = entry.resolution;
        let mut note = entry.note;

        if let Action::AutoCorrect {
            target,
            delta,
            status,
        } = &entry.action
        {
            match self
                .auto_correct(id, target, *delta, *status, &entry.currency)
                .await
            {
                Ok(()) => info!(
                    external_ref = %entry.external_ref,
                    delta = %delta,
                    "[reconciliation.auto_correct] correction posted"
                ),
                Err(error) if error.class() == ErrorClass::TransientInfrastructure => {
                    return Err(error.into());
                }
                Err(error) => {
                    warn!(
                        external_ref = %entry.external_ref,
                        error = %error,
                        "[reconciliation.auto_correct] correction rejected, leaving for review"
                    );
                    resolution = Resolution::PendingReview;
                    note = Some(format!("auto-correction rejected: {error}"));
                }
            }
        }

        let discrepancy = Discrepancy {
            id,
            run_id,
            external_ref: entry.external_ref,
            kind: entry.kind,
            resolution,
            currency: entry.currency,
            expected_amount: entry.expected_amount,
            reported_amount: entry.reported_amount,
            expected_status: entry.expected_status,
            reported_status: entry.reported_status,
            note,
            created_at: now,
        };
        self.runs.record_discrepancy(&discrepancy).await?;

        if resolution == Resolution::PendingReview {
            warn!(
                external_ref = %discrepancy.external_ref,
                kind = discrepancy.kind.as_str(),
                "[reconciliation.discrepancy] needs review"
            );
            let alert = ReconciliationAlert {
                run_id,
                discrepancy_id: id,
                external_ref: discrepancy.external_ref.clone(),
                kind: discrepancy.kind,
                currency: discrepancy.currency.clone(),
                expected_amount: discrepancy.expected_amount,
                reported_amount: discrepancy.reported_amount,
                note: discrepancy.note.clone(),
            };
            enqueued.push(
                self.enqueue(
                    NewOutboxMessage::json(reconciliation_alert_type()?, &alert)?,
                    &discrepancy.external_ref,
                )
                .await?,
            );

            if let Action::CreateMissingEntry {
                amount,
                status,
                settled_at,
            } = entry.action
            {
                let create = CreateMissingLedgerEntry {
                    run_id,
                    discrepancy_id: id,
                    external_ref: discrepancy.external_ref.clone(),
                    amount,
                    currency: discrepancy.currency.clone(),
                    status,
                    settled_at,
                };
                enqueued.push(
                    self.enqueue(
                        NewOutboxMessage::json(create_missing_ledger_entry_type()?, &create)?,
                        &discrepancy.external_ref,
                    )
                    .await?,
                );
            }
        } else {
            debug!(
                external_ref = %discrepancy.external_ref,
                kind = discrepancy.kind.as_str(),
                resolution = discrepancy.resolution.as_str(),
                "[reconciliation.discrepancy] recorded"
            );
        }

        Ok(discrepancy)
    }

    async fn enqueue(
        &self,
        message: NewOutboxMessage,
        external_ref: &ExternalRef,
    ) -> Result<MessageId, ReconcileError> {
        let message = match PartitionKey::try_new(external_ref.as_ref()) {
            Ok(key) => message.with_partition_key(key),
            Err(_) => message,
        };
        Ok(self.outbox.enqueue(message).await?)
    }

    /// Post a reversal of `target` and a corrected copy, atomically.
    async fn auto_correct(
        &self,
        discrepancy: DiscrepancyId,
        target: &LedgerTransaction,
        delta: Decimal,
        status: SettlementStatus,
        currency: &Currency,
    ) -> Result<(), LedgerError> {
        let reversal = NewLedgerTransaction::reversal_of(target).for_discrepancy(discrepancy);
        let corrected = corrected_copy(target, delta, status, currency, &self.policy)
            .for_discrepancy(discrepancy);

        let _ = self.ledger.record_batch(vec![reversal, corrected]).await?;
        Ok(())
    }
}

/// `target` with its clearing line in `currency` shifted by `delta`, balanced
/// against the adjustment account.
fn corrected_copy(
    target: &LedgerTransaction,
    delta: Decimal,
    status: SettlementStatus,
    currency: &Currency,
    policy: &ReconciliationPolicy,
) -> NewLedgerTransaction {
    let mut postings = target.postings.clone();
    if let Some(index) = postings
        .iter()
        .position(|p| p.account == policy.clearing_account && &p.currency == currency)
    {
        postings[index].amount += delta;
        if postings[index].amount.is_zero() {
            let _ = postings.remove(index);
        }
    }
    postings.push(LedgerPosting::new(
        policy.adjustment_account.clone(),
        -delta,
        currency.clone(),
    ));

    NewLedgerTransaction {
        external_ref: target.external_ref.clone(),
        kind: EntryKind::Adjustment,
        status,
        occurred_at: target.occurred_at,
        postings,
        reverses: None,
        discrepancy: None,
    }
}
