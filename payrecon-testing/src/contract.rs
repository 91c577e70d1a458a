//! Behavioral contracts every store implementation must satisfy.
//!
//! Each `test_*` function exercises one scenario against a fresh store built
//! by `make_store` and reports a [`ContractTestFailure`] instead of panicking,
//! so that backends can share one suite. Invoke the suites through the
//! `*_contract_tests!` macros.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use payrecon_types::{
    AccountCode, Currency, DateRange, Discrepancy, DiscrepancyId, DiscrepancyKind, EntryKind,
    ExternalRef, LedgerError, LedgerPosting, LedgerStore, MessageId, MessageType,
    NewLedgerTransaction, NewOutboxMessage, OutboxError, OutboxMessage, OutboxStatus, OutboxStore,
    PartitionKey, Resolution, RunCounts, RunError, RunId, RunStatus, RunStore, RunTrigger,
    SettlementStatus, WorkerId,
};
use rust_decimal::Decimal;
use uuid::Uuid;

#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(
        scenario: &'static str,
        operation: &'static str,
        error: impl fmt::Display,
    ) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

pub type ContractTestResult = Result<(), ContractTestFailure>;

fn ensure(scenario: &'static str, condition: bool, detail: impl Into<String>) -> ContractTestResult {
    if condition {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(scenario, detail))
    }
}

/// Unique label for parallel test execution against a shared database.
fn unique(scenario: &'static str, label: &str) -> String {
    format!("contract::{scenario}::{label}::{}", Uuid::now_v7())
}

fn validated<T, E: fmt::Display>(
    scenario: &'static str,
    what: &str,
    result: Result<T, E>,
) -> Result<T, ContractTestFailure> {
    result.map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to construct {what}: {error}"))
    })
}

fn worker(scenario: &'static str, label: &str) -> Result<WorkerId, ContractTestFailure> {
    validated(scenario, "worker id", WorkerId::try_new(format!("{label}-{}", Uuid::now_v7())))
}

fn contract_message(
    scenario: &'static str,
    key: Option<&PartitionKey>,
) -> Result<NewOutboxMessage, ContractTestFailure> {
    let message_type = validated(
        scenario,
        "message type",
        MessageType::try_new("ContractTestMessage"),
    )?;
    let message = NewOutboxMessage::new(
        message_type,
        serde_json::json!({ "scenario": scenario }),
    );
    Ok(match key {
        Some(key) => message.with_partition_key(key.clone()),
        None => message,
    })
}

async fn enqueue_one<S: OutboxStore>(
    scenario: &'static str,
    store: &S,
    message: NewOutboxMessage,
) -> Result<MessageId, ContractTestFailure> {
    store
        .enqueue(message)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "enqueue", error))
}

async fn claim<S: OutboxStore>(
    scenario: &'static str,
    store: &S,
    worker: &WorkerId,
    lease: Duration,
) -> Result<Vec<OutboxMessage>, ContractTestFailure> {
    store
        .claim_batch(100, worker, lease)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "claim_batch", error))
}

async fn fetch<S: OutboxStore>(
    scenario: &'static str,
    store: &S,
    id: MessageId,
) -> Result<OutboxMessage, ContractTestFailure> {
    store
        .get(id)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "get", error))?
        .ok_or_else(|| ContractTestFailure::assertion(scenario, format!("message {id} vanished")))
}

fn claimed_ids(batch: &[OutboxMessage]) -> HashSet<MessageId> {
    batch.iter().map(|message| message.id).collect()
}

const LEASE: Duration = Duration::from_secs(60);

pub async fn test_enqueue_starts_pending<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OutboxStore + 'static,
{
    const SCENARIO: &str = "enqueue_starts_pending";

    let store = make_store();
    let first = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, None)?).await?;
    let second = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, None)?).await?;

    ensure(
        SCENARIO,
        first < second,
        format!("expected increasing ids, observed {first} then {second}"),
    )?;

    let stored = fetch(SCENARIO, &store, first).await?;
    ensure(
        SCENARIO,
        stored.status == OutboxStatus::Pending && stored.retry_count == 0,
        format!(
            "expected a fresh pending message, observed status={} retry_count={}",
            stored.status, stored.retry_count
        ),
    )?;
    ensure(
        SCENARIO,
        stored.claimed_by.is_none() && stored.last_error.is_none(),
        "fresh message must not carry a lease holder or an error",
    )
}

pub async fn test_claim_leases_to_worker<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OutboxStore + 'static,
{
    const SCENARIO: &str = "claim_leases_to_worker";

    let store = make_store();
    let id = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, None)?).await?;
    let holder = worker(SCENARIO, "holder")?;
    let before = Utc::now();

    let batch = claim(SCENARIO, &store, &holder, LEASE).await?;
    let Some(claimed) = batch.iter().find(|message| message.id == id) else {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "due pending message was not claimed",
        ));
    };

    ensure(
        SCENARIO,
        claimed.status == OutboxStatus::Processing && claimed.claimed_by.as_ref() == Some(&holder),
        format!(
            "expected processing under {holder}, observed {} under {:?}",
            claimed.status, claimed.claimed_by
        ),
    )?;
    ensure(
        SCENARIO,
        claimed.next_attempt_at > before + TimeDelta::seconds(30),
        "claim must push next_attempt_at out by the lease",
    )?;

    let other = worker(SCENARIO, "other")?;
    let second = claim(SCENARIO, &store, &other, LEASE).await?;
    ensure(
        SCENARIO,
        !claimed_ids(&second).contains(&id),
        "a message under an active lease must not be claimed again",
    )
}

pub async fn test_concurrent_claims_are_disjoint<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OutboxStore + 'static,
{
    const SCENARIO: &str = "concurrent_claims_are_disjoint";

    let store = Arc::new(make_store());
    let mut ours = HashSet::new();
    for _ in 0..20 {
        let id = enqueue_one(SCENARIO, store.as_ref(), contract_message(SCENARIO, None)?).await?;
        let _ = ours.insert(id);
    }

    let mut tasks = Vec::new();
    for index in 0..4 {
        let store = Arc::clone(&store);
        let holder = worker(SCENARIO, &format!("w{index}"))?;
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match store.claim_batch(3, &holder, LEASE).await {
                    Ok(batch) if batch.is_empty() => return Ok(claimed),
                    Ok(batch) => claimed.extend(batch.into_iter().map(|message| message.id)),
                    Err(error) => return Err(error),
                }
            }
        }));
    }

    let mut seen: Vec<MessageId> = Vec::new();
    for task in tasks {
        let claimed = task
            .await
            .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "claim_batch", error))?;
        seen.extend(claimed.into_iter().filter(|id| ours.contains(id)));
    }

    let distinct: HashSet<MessageId> = seen.iter().copied().collect();
    ensure(
        SCENARIO,
        distinct.len() == seen.len(),
        format!(
            "a message was claimed by two workers: {} claims for {} messages",
            seen.len(),
            distinct.len()
        ),
    )?;
    ensure(
        SCENARIO,
        distinct == ours,
        format!("expected all {} messages claimed, observed {}", ours.len(), distinct.len()),
    )
}

pub async fn test_outcome_requires_lease_holder<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OutboxStore + 'static,
{
    const SCENARIO: &str = "outcome_requires_lease_holder";

    let store = make_store();
    let id = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, None)?).await?;
    let holder = worker(SCENARIO, "holder")?;
    let intruder = worker(SCENARIO, "intruder")?;
    let _ = claim(SCENARIO, &store, &holder, LEASE).await?;

    let stolen = store.mark_delivered(id, &intruder).await;
    ensure(
        SCENARIO,
        matches!(stolen, Err(OutboxError::ClaimLost { .. })),
        format!("expected ClaimLost for a non-holder, observed {stolen:?}"),
    )?;

    store
        .mark_delivered(id, &holder)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "mark_delivered", error))?;

    let again = store.mark_failed(id, &holder, "late", Utc::now()).await;
    ensure(
        SCENARIO,
        matches!(again, Err(OutboxError::ClaimLost { .. })),
        format!("delivered message must never change again, observed {again:?}"),
    )?;

    let stored = fetch(SCENARIO, &store, id).await?;
    ensure(
        SCENARIO,
        stored.status == OutboxStatus::Delivered && stored.processed_at.is_some(),
        format!("expected delivered with processed_at, observed {}", stored.status),
    )
}

pub async fn test_expired_lease_is_reclaimed<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OutboxStore + 'static,
{
    const SCENARIO: &str = "expired_lease_is_reclaimed";

    let store = make_store();
    let id = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, None)?).await?;
    let crashed = worker(SCENARIO, "crashed")?;
    let survivor = worker(SCENARIO, "survivor")?;

    let _ = claim(SCENARIO, &store, &crashed, Duration::from_millis(1)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let batch = claim(SCENARIO, &store, &survivor, LEASE).await?;
    ensure(
        SCENARIO,
        claimed_ids(&batch).contains(&id),
        "message with an expired lease must be claimable by another worker",
    )?;

    let late = store.mark_delivered(id, &crashed).await;
    ensure(
        SCENARIO,
        matches!(late, Err(OutboxError::ClaimLost { .. })),
        format!("previous holder must lose the claim, observed {late:?}"),
    )?;

    store
        .mark_delivered(id, &survivor)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "mark_delivered", error))
}

pub async fn test_failure_schedules_retry<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OutboxStore + 'static,
{
    const SCENARIO: &str = "failure_schedules_retry";

    let store = make_store();
    let id = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, None)?).await?;
    let holder = worker(SCENARIO, "holder")?;
    let _ = claim(SCENARIO, &store, &holder, LEASE).await?;

    store
        .mark_failed(id, &holder, "gateway timeout", Utc::now() + TimeDelta::hours(1))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "mark_failed", error))?;

    let stored = fetch(SCENARIO, &store, id).await?;
    ensure(
        SCENARIO,
        stored.status == OutboxStatus::Pending
            && stored.retry_count == 1
            && stored.last_error.as_deref() == Some("gateway timeout"),
        format!(
            "expected pending retry 1 with error, observed {} retry {} error {:?}",
            stored.status, stored.retry_count, stored.last_error
        ),
    )?;

    let batch = claim(SCENARIO, &store, &holder, LEASE).await?;
    ensure(
        SCENARIO,
        !claimed_ids(&batch).contains(&id),
        "message must not be claimed before its next attempt is due",
    )
}

pub async fn test_exhausted_message_can_be_requeued<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OutboxStore + 'static,
{
    const SCENARIO: &str = "exhausted_message_can_be_requeued";

    let store = make_store();
    let id = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, None)?).await?;
    let holder = worker(SCENARIO, "holder")?;
    let _ = claim(SCENARIO, &store, &holder, LEASE).await?;

    store
        .mark_exhausted(id, &holder, "malformed payload")
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "mark_exhausted", error))?;

    let failed = store
        .list_failed(1_000)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "list_failed", error))?;
    ensure(
        SCENARIO,
        failed
            .iter()
            .any(|message| message.id == id && message.retry_count == 1),
        "exhausted message must be listed as failed with its attempt counted",
    )?;

    store
        .requeue(id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "requeue", error))?;
    let stored = fetch(SCENARIO, &store, id).await?;
    ensure(
        SCENARIO,
        stored.status == OutboxStatus::Pending
            && stored.retry_count == 0
            && stored.last_error.as_deref() == Some("malformed payload"),
        format!(
            "requeue must reset retries and keep the error, observed {} retry {} error {:?}",
            stored.status, stored.retry_count, stored.last_error
        ),
    )?;

    let twice = store.requeue(id).await;
    ensure(
        SCENARIO,
        matches!(twice, Err(OutboxError::InvalidTransition { .. })),
        format!("only failed messages can be requeued, observed {twice:?}"),
    )
}

pub async fn test_partition_key_orders_delivery<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OutboxStore + 'static,
{
    const SCENARIO: &str = "partition_key_orders_delivery";

    let store = make_store();
    let order = validated(SCENARIO, "partition key", PartitionKey::try_new(unique(SCENARIO, "order")))?;
    let other = validated(SCENARIO, "partition key", PartitionKey::try_new(unique(SCENARIO, "other")))?;

    let first = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, Some(&order))?).await?;
    let second = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, Some(&order))?).await?;
    let unrelated = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, Some(&other))?).await?;
    let holder = worker(SCENARIO, "holder")?;

    let batch = claimed_ids(&claim(SCENARIO, &store, &holder, LEASE).await?);
    ensure(
        SCENARIO,
        batch.contains(&first) && batch.contains(&unrelated) && !batch.contains(&second),
        "only the oldest message of each key may be claimed",
    )?;

    let blocked = claimed_ids(&claim(SCENARIO, &store, &holder, LEASE).await?);
    ensure(
        SCENARIO,
        !blocked.contains(&second),
        "a younger message must wait while an older one with its key is in flight",
    )?;

    store
        .mark_delivered(first, &holder)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "mark_delivered", error))?;
    let next = claimed_ids(&claim(SCENARIO, &store, &holder, LEASE).await?);
    ensure(
        SCENARIO,
        next.contains(&second),
        "the next message of a key becomes eligible once its predecessor is delivered",
    )
}

pub async fn test_exhausted_predecessor_unblocks_key<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OutboxStore + 'static,
{
    const SCENARIO: &str = "exhausted_predecessor_unblocks_key";

    let store = make_store();
    let key = validated(SCENARIO, "partition key", PartitionKey::try_new(unique(SCENARIO, "key")))?;
    let first = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, Some(&key))?).await?;
    let second = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, Some(&key))?).await?;
    let holder = worker(SCENARIO, "holder")?;

    let _ = claim(SCENARIO, &store, &holder, LEASE).await?;
    store
        .mark_exhausted(first, &holder, "poison")
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "mark_exhausted", error))?;

    let next = claimed_ids(&claim(SCENARIO, &store, &holder, LEASE).await?);
    ensure(
        SCENARIO,
        next.contains(&second),
        "a quarantined message must not block its key forever",
    )
}

pub async fn test_delayed_message_waits<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OutboxStore + 'static,
{
    const SCENARIO: &str = "delayed_message_waits";

    let store = make_store();
    let message = contract_message(SCENARIO, None)?.available_at(Utc::now() + TimeDelta::hours(1));
    let id = enqueue_one(SCENARIO, &store, message).await?;
    let holder = worker(SCENARIO, "holder")?;

    let batch = claim(SCENARIO, &store, &holder, LEASE).await?;
    ensure(
        SCENARIO,
        !claimed_ids(&batch).contains(&id),
        "message must not be claimed before available_at",
    )
}

pub async fn test_archive_keeps_delivered_messages<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: OutboxStore + 'static,
{
    const SCENARIO: &str = "archive_keeps_delivered_messages";

    let store = make_store();
    let delivered = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, None)?).await?;
    let holder = worker(SCENARIO, "holder")?;
    let _ = claim(SCENARIO, &store, &holder, LEASE).await?;
    store
        .mark_delivered(delivered, &holder)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "mark_delivered", error))?;
    let waiting = enqueue_one(SCENARIO, &store, contract_message(SCENARIO, None)?).await?;

    let archived = store
        .archive_delivered(Utc::now() + TimeDelta::seconds(5))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "archive_delivered", error))?;
    ensure(
        SCENARIO,
        archived >= 1,
        format!("expected the delivered message archived, observed count {archived}"),
    )?;

    let kept = fetch(SCENARIO, &store, delivered).await?;
    ensure(
        SCENARIO,
        kept.status == OutboxStatus::Delivered,
        "archived messages are retained, never deleted",
    )?;
    let pending = fetch(SCENARIO, &store, waiting).await?;
    ensure(
        SCENARIO,
        pending.status == OutboxStatus::Pending,
        "archiving must leave undelivered messages alone",
    )
}

fn account(scenario: &'static str, code: &str) -> Result<AccountCode, ContractTestFailure> {
    validated(scenario, "account code", AccountCode::try_new(code))
}

fn lira(scenario: &'static str) -> Result<Currency, ContractTestFailure> {
    validated(scenario, "currency", Currency::try_new("TRY"))
}

fn capture(
    scenario: &'static str,
    external_ref: &ExternalRef,
    amount: Decimal,
    occurred_at: chrono::DateTime<Utc>,
) -> Result<NewLedgerTransaction, ContractTestFailure> {
    Ok(NewLedgerTransaction::new(
        external_ref.clone(),
        EntryKind::Capture,
        SettlementStatus::Settled,
        occurred_at,
    )
    .with_posting(LedgerPosting::debit(
        account(scenario, "paytr:clearing")?,
        amount,
        lira(scenario)?,
    ))
    .with_posting(LedgerPosting::credit(
        account(scenario, "platform:revenue")?,
        amount,
        lira(scenario)?,
    )))
}

fn reference(scenario: &'static str, label: &str) -> Result<ExternalRef, ContractTestFailure> {
    validated(scenario, "external reference", ExternalRef::try_new(unique(scenario, label)))
}

pub async fn test_ledger_round_trip<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: LedgerStore + 'static,
{
    const SCENARIO: &str = "ledger_round_trip";

    let store = make_store();
    let external_ref = reference(SCENARIO, "capture")?;
    let transaction = capture(SCENARIO, &external_ref, Decimal::new(10_000, 2), Utc::now())?;

    let id = store
        .record_transaction(transaction.clone())
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "record_transaction", error))?;

    let found = store
        .find_by_external_ref(&external_ref)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "find_by_external_ref", error))?;
    ensure(
        SCENARIO,
        found.len() == 1 && found[0].id == id,
        format!("expected exactly the recorded transaction, observed {}", found.len()),
    )?;
    ensure(
        SCENARIO,
        found[0].postings == transaction.postings && found[0].kind == EntryKind::Capture,
        "stored postings must match what was recorded",
    )?;

    let unknown = reference(SCENARIO, "unknown")?;
    let missing = store
        .find_by_external_ref(&unknown)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "find_by_external_ref", error))?;
    ensure(SCENARIO, missing.is_empty(), "unknown reference must yield no transactions")
}

pub async fn test_imbalanced_batch_writes_nothing<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: LedgerStore + 'static,
{
    const SCENARIO: &str = "imbalanced_batch_writes_nothing";

    let store = make_store();
    let external_ref = reference(SCENARIO, "batch")?;
    let valid = capture(SCENARIO, &external_ref, Decimal::new(500, 2), Utc::now())?;
    let mut invalid = capture(SCENARIO, &external_ref, Decimal::new(500, 2), Utc::now())?;
    invalid.postings[0].amount = Decimal::new(501, 2);

    let result = store.record_batch(vec![valid, invalid]).await;
    ensure(
        SCENARIO,
        matches!(result, Err(LedgerError::Imbalanced { .. })),
        format!("expected Imbalanced, observed {result:?}"),
    )?;

    let empty = NewLedgerTransaction::new(
        external_ref.clone(),
        EntryKind::Adjustment,
        SettlementStatus::Settled,
        Utc::now(),
    );
    let result = store.record_transaction(empty).await;
    ensure(
        SCENARIO,
        matches!(result, Err(LedgerError::Imbalanced { .. })),
        format!("empty posting set must be rejected, observed {result:?}"),
    )?;

    let found = store
        .find_by_external_ref(&external_ref)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "find_by_external_ref", error))?;
    ensure(
        SCENARIO,
        found.is_empty(),
        format!("rejected batch must write nothing, observed {} rows", found.len()),
    )
}

pub async fn test_reversal_rules<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: LedgerStore + 'static,
{
    const SCENARIO: &str = "reversal_rules";

    let store = make_store();
    let external_ref = reference(SCENARIO, "reversed")?;
    let _ = store
        .record_transaction(capture(SCENARIO, &external_ref, Decimal::new(2_000, 2), Utc::now())?)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "record_transaction", error))?;
    let original = store
        .find_by_external_ref(&external_ref)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "find_by_external_ref", error))?
        .into_iter()
        .next()
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "recorded transaction vanished"))?;

    let mut mismatched = NewLedgerTransaction::reversal_of(&original);
    mismatched.external_ref = reference(SCENARIO, "elsewhere")?;
    let result = store.record_transaction(mismatched).await;
    ensure(
        SCENARIO,
        matches!(result, Err(LedgerError::ReversalReferenceMismatch { .. })),
        format!("reversal under another reference must be rejected, observed {result:?}"),
    )?;

    let mut dangling = NewLedgerTransaction::reversal_of(&original);
    dangling.reverses = Some(payrecon_types::TransactionId::generate());
    let result = store.record_transaction(dangling).await;
    ensure(
        SCENARIO,
        matches!(result, Err(LedgerError::ReversalTargetNotFound { .. })),
        format!("reversal of an unknown transaction must be rejected, observed {result:?}"),
    )?;

    let _ = store
        .record_transaction(NewLedgerTransaction::reversal_of(&original))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "record_transaction", error))?;
    let result = store
        .record_transaction(NewLedgerTransaction::reversal_of(&original))
        .await;
    ensure(
        SCENARIO,
        matches!(result, Err(LedgerError::AlreadyReversed { .. })),
        format!("second reversal must be rejected, observed {result:?}"),
    )?;

    let history = store
        .find_by_external_ref(&external_ref)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "find_by_external_ref", error))?;
    let net: Decimal = history
        .iter()
        .flat_map(|tx| tx.postings.iter())
        .filter(|posting| posting.account.as_ref() == "paytr:clearing")
        .map(|posting| posting.amount)
        .sum();
    ensure(
        SCENARIO,
        history.len() == 2 && net.is_zero(),
        format!("capture plus reversal must net to zero, observed {net} over {} rows", history.len()),
    )
}

pub async fn test_range_is_half_open<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: LedgerStore + 'static,
{
    const SCENARIO: &str = "range_is_half_open";

    let store = make_store();
    // A far-past window keeps other scenarios sharing the database out of it.
    let offset = i64::from(rand::random::<u16>());
    let start = chrono::DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(365 + offset);
    let end = start + TimeDelta::days(1);
    let range = validated(SCENARIO, "date range", DateRange::new(start, end))?;

    let at_start = reference(SCENARIO, "at-start")?;
    let at_end = reference(SCENARIO, "at-end")?;
    let _ = store
        .record_batch(vec![
            capture(SCENARIO, &at_start, Decimal::ONE, start)?,
            capture(SCENARIO, &at_end, Decimal::ONE, end)?,
        ])
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "record_batch", error))?;

    let found = store
        .transactions_in_range(range)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "transactions_in_range", error))?;
    ensure(
        SCENARIO,
        found.iter().any(|tx| tx.external_ref == at_start),
        "transaction at the range start must be included",
    )?;
    ensure(
        SCENARIO,
        !found.iter().any(|tx| tx.external_ref == at_end),
        "transaction at the range end must be excluded",
    )
}

fn any_range(scenario: &'static str) -> Result<DateRange, ContractTestFailure> {
    let end = Utc::now();
    validated(scenario, "date range", DateRange::new(end - TimeDelta::days(1), end))
}

async fn begin<S: RunStore>(
    scenario: &'static str,
    store: &S,
    stale_after: Duration,
) -> Result<payrecon_types::ReconciliationRun, ContractTestFailure> {
    store
        .try_begin(any_range(scenario)?, RunTrigger::Manual, stale_after)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "try_begin", error))
}

fn discrepancy(
    scenario: &'static str,
    run_id: RunId,
    external_ref: &str,
) -> Result<Discrepancy, ContractTestFailure> {
    Ok(Discrepancy {
        id: DiscrepancyId::generate(),
        run_id,
        external_ref: validated(scenario, "external reference", ExternalRef::try_new(external_ref))?,
        kind: DiscrepancyKind::AmountMismatch,
        resolution: Resolution::PendingReview,
        currency: lira(scenario)?,
        expected_amount: Some(Decimal::new(10_000, 2)),
        reported_amount: Some(Decimal::new(9_500, 2)),
        expected_status: Some(SettlementStatus::Settled),
        reported_status: Some(SettlementStatus::Settled),
        note: None,
        created_at: Utc::now(),
    })
}

const STALE_AFTER: Duration = Duration::from_secs(60 * 60);

pub async fn test_single_running_run<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: RunStore + 'static,
{
    const SCENARIO: &str = "single_running_run";

    let store = make_store();
    let first = begin(SCENARIO, &store, STALE_AFTER).await?;
    ensure(
        SCENARIO,
        first.status == RunStatus::Running && first.finished_at.is_none(),
        format!("expected a running run, observed {}", first.status),
    )?;

    let second = store
        .try_begin(any_range(SCENARIO)?, RunTrigger::Scheduled, STALE_AFTER)
        .await;
    ensure(
        SCENARIO,
        matches!(second, Err(RunError::LockContention { active }) if active == first.id),
        format!("expected LockContention naming the active run, observed {second:?}"),
    )?;

    let _ = store
        .complete(first.id, RunCounts::default(), 1, RunStatus::Completed)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "complete", error))?;
    let third = begin(SCENARIO, &store, STALE_AFTER).await?;
    ensure(
        SCENARIO,
        third.id != first.id,
        "a new run may start once the previous one finished",
    )
}

pub async fn test_stale_run_is_abandoned<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: RunStore + 'static,
{
    const SCENARIO: &str = "stale_run_is_abandoned";

    let store = make_store();
    let crashed = begin(SCENARIO, &store, STALE_AFTER).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fresh = begin(SCENARIO, &store, Duration::from_millis(1)).await?;
    let abandoned = store
        .get(crashed.id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "get", error))?
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "abandoned run vanished"))?;

    ensure(
        SCENARIO,
        abandoned.status == RunStatus::Failed && abandoned.error.is_some(),
        format!("stale run must be failed with a reason, observed {}", abandoned.status),
    )?;
    ensure(
        SCENARIO,
        fresh.status == RunStatus::Running,
        "new run must start after the stale one is abandoned",
    )
}

pub async fn test_finished_run_is_immutable<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: RunStore + 'static,
{
    const SCENARIO: &str = "finished_run_is_immutable";

    let store = make_store();
    let run = begin(SCENARIO, &store, STALE_AFTER).await?;
    let counts = RunCounts {
        matched: 3,
        unmatched: 1,
        adjusted: 0,
        ignored: 0,
    };
    let finished = store
        .complete(run.id, counts, 2, RunStatus::CompletedWithDiscrepancies)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "complete", error))?;
    ensure(
        SCENARIO,
        finished.counts == counts && finished.attempts == 2 && finished.finished_at.is_some(),
        "completion must persist counts, attempts and finish time",
    )?;

    let failed = store.fail(run.id, counts, 2, "too late").await;
    ensure(
        SCENARIO,
        matches!(failed, Err(RunError::NotRunning { .. })),
        format!("finished run must not fail afterwards, observed {failed:?}"),
    )?;

    let late = store
        .record_discrepancy(&discrepancy(SCENARIO, run.id, "TX-late")?)
        .await;
    ensure(
        SCENARIO,
        matches!(late, Err(RunError::NotRunning { .. })),
        format!("finished run must not gain discrepancies, observed {late:?}"),
    )?;

    let unknown = store
        .complete(RunId::generate(), counts, 1, RunStatus::Completed)
        .await;
    ensure(
        SCENARIO,
        matches!(unknown, Err(RunError::NotFound { .. })),
        format!("unknown run must be reported, observed {unknown:?}"),
    )
}

pub async fn test_discrepancies_survive_failure<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: RunStore + 'static,
{
    const SCENARIO: &str = "discrepancies_survive_failure";

    let store = make_store();
    let run = begin(SCENARIO, &store, STALE_AFTER).await?;
    for external_ref in ["TX300", "TX100", "TX200"] {
        store
            .record_discrepancy(&discrepancy(SCENARIO, run.id, external_ref)?)
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "record_discrepancy", error))?;
    }

    let failed = store
        .fail(run.id, RunCounts::default(), 1, "ledger unavailable")
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "fail", error))?;
    ensure(
        SCENARIO,
        failed.status == RunStatus::Failed && failed.error.as_deref() == Some("ledger unavailable"),
        "failure must record the reason",
    )?;

    let recorded = store
        .discrepancies(run.id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "discrepancies", error))?;
    let references: Vec<&str> = recorded
        .iter()
        .map(|discrepancy| discrepancy.external_ref.as_ref())
        .collect();
    ensure(
        SCENARIO,
        references == ["TX100", "TX200", "TX300"],
        format!("expected discrepancies ordered by reference, observed {references:?}"),
    )?;

    let latest = store
        .latest()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "latest", error))?;
    ensure(
        SCENARIO,
        latest.is_some_and(|latest| latest.id == run.id),
        "latest must return the most recently started run",
    )
}

#[macro_export]
macro_rules! outbox_store_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_archive_keeps_delivered_messages, test_claim_leases_to_worker,
                test_concurrent_claims_are_disjoint, test_delayed_message_waits,
                test_enqueue_starts_pending, test_exhausted_message_can_be_requeued,
                test_exhausted_predecessor_unblocks_key, test_expired_lease_is_reclaimed,
                test_failure_schedules_retry, test_outcome_requires_lease_holder,
                test_partition_key_orders_delivery,
            };

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn enqueue_starts_pending_contract() {
                test_enqueue_starts_pending($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn claim_leases_to_worker_contract() {
                test_claim_leases_to_worker($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_claims_are_disjoint_contract() {
                test_concurrent_claims_are_disjoint($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn outcome_requires_lease_holder_contract() {
                test_outcome_requires_lease_holder($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn expired_lease_is_reclaimed_contract() {
                test_expired_lease_is_reclaimed($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn failure_schedules_retry_contract() {
                test_failure_schedules_retry($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn exhausted_message_can_be_requeued_contract() {
                test_exhausted_message_can_be_requeued($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn partition_key_orders_delivery_contract() {
                test_partition_key_orders_delivery($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn exhausted_predecessor_unblocks_key_contract() {
                test_exhausted_predecessor_unblocks_key($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn delayed_message_waits_contract() {
                test_delayed_message_waits($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn archive_keeps_delivered_messages_contract() {
                test_archive_keeps_delivered_messages($make_store)
                    .await
                    .expect("outbox store contract failed");
            }
        }
    };
}

pub use outbox_store_contract_tests;

#[macro_export]
macro_rules! ledger_store_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_imbalanced_batch_writes_nothing, test_ledger_round_trip,
                test_range_is_half_open, test_reversal_rules,
            };

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn ledger_round_trip_contract() {
                test_ledger_round_trip($make_store)
                    .await
                    .expect("ledger store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn imbalanced_batch_writes_nothing_contract() {
                test_imbalanced_batch_writes_nothing($make_store)
                    .await
                    .expect("ledger store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn reversal_rules_contract() {
                test_reversal_rules($make_store)
                    .await
                    .expect("ledger store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn range_is_half_open_contract() {
                test_range_is_half_open($make_store)
                    .await
                    .expect("ledger store contract failed");
            }
        }
    };
}

pub use ledger_store_contract_tests;

#[macro_export]
macro_rules! run_store_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_discrepancies_survive_failure, test_finished_run_is_immutable,
                test_single_running_run, test_stale_run_is_abandoned,
            };

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn single_running_run_contract() {
                test_single_running_run($make_store)
                    .await
                    .expect("run store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn stale_run_is_abandoned_contract() {
                test_stale_run_is_abandoned($make_store)
                    .await
                    .expect("run store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn finished_run_is_immutable_contract() {
                test_finished_run_is_immutable($make_store)
                    .await
                    .expect("run store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn discrepancies_survive_failure_contract() {
                test_discrepancies_survive_failure($make_store)
                    .await
                    .expect("run store contract failed");
            }
        }
    };
}

pub use run_store_contract_tests;
