//! Property tests for the pure reconciliation diff.

use chrono::TimeDelta;
use payrecon::{
    diff, GatewayTransactionRecord, LedgerTransaction, ReconciliationPolicy, TransactionId,
};
use payrecon_testing::fixtures::{
    account, at, gateway_sale, ledger_capture, ADJUSTMENTS, CLEARING, SUSPENSE,
};
use proptest::prelude::*;
use rust_decimal::Decimal;

fn policy() -> ReconciliationPolicy {
    ReconciliationPolicy::new(account(CLEARING), account(ADJUSTMENTS), account(SUSPENSE))
        .with_auto_correct_threshold(Decimal::new(500, 2))
}

/// `(reference index, amount in kuruş)` pairs plus a permutation of them.
fn entries_and_order() -> impl Strategy<Value = (Vec<(usize, i64)>, Vec<usize>)> {
    proptest::collection::vec((0usize..6, 1i64..20_000), 0..12).prop_flat_map(|entries| {
        let order: Vec<usize> = (0..entries.len()).collect();
        (Just(entries), Just(order).prop_shuffle())
    })
}

fn ledger(entries: &[(usize, i64)]) -> Vec<LedgerTransaction> {
    entries
        .iter()
        .enumerate()
        .map(|(position, (reference, cents))| {
            let occurred_at = at(2026, 1, 5, 0) + TimeDelta::minutes(i64::try_from(position).unwrap());
            LedgerTransaction::from_new(
                TransactionId::generate(),
                occurred_at,
                ledger_capture(&format!("TX{reference}"), Decimal::new(*cents, 2), occurred_at),
            )
        })
        .collect()
}

fn report(entries: &[(usize, i64)]) -> Vec<GatewayTransactionRecord> {
    entries
        .iter()
        .enumerate()
        .map(|(position, (reference, cents))| {
            gateway_sale(
                &format!("TX{reference}"),
                Decimal::new(*cents, 2),
                at(2026, 1, 5, 1) + TimeDelta::minutes(i64::try_from(position).unwrap()),
            )
        })
        .collect()
}

fn permuted<T: Clone>(items: &[T], order: &[usize]) -> Vec<T> {
    order.iter().map(|index| items[*index].clone()).collect()
}

proptest! {
    #[test]
    fn diff_does_not_depend_on_input_order(
        (ledger_entries, ledger_order) in entries_and_order(),
        (report_entries, report_order) in entries_and_order(),
    ) {
        let policy = policy();
        let now = at(2026, 2, 1, 0);
        let transactions = ledger(&ledger_entries);
        let records = report(&report_entries);

        let original = diff(&transactions, &records, &policy, now);
        let shuffled = diff(
            &permuted(&transactions, &ledger_order),
            &permuted(&records, &report_order),
            &policy,
            now,
        );

        prop_assert_eq!(original, shuffled);
    }

    #[test]
    fn every_reference_is_classified_once(
        (ledger_entries, _) in entries_and_order(),
        (report_entries, _) in entries_and_order(),
    ) {
        let transactions = ledger(&ledger_entries);
        let records = report(&report_entries);

        let result = diff(&transactions, &records, &policy(), at(2026, 2, 1, 0));

        let mut references: Vec<String> = transactions
            .iter()
            .map(|tx| tx.external_ref.to_string())
            .chain(records.iter().map(|record| record.external_ref.to_string()))
            .collect();
        references.sort();
        references.dedup();
        let classified = u64::try_from(result.entries.len()).unwrap() + result.matched + result.deferred;
        prop_assert_eq!(classified, u64::try_from(references.len()).unwrap());

        let ordered: Vec<String> = result
            .entries
            .iter()
            .map(|entry| entry.external_ref.to_string())
            .collect();
        let mut sorted = ordered.clone();
        sorted.sort();
        prop_assert_eq!(ordered, sorted);
    }
}
