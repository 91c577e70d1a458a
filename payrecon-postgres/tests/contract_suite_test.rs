//! Runs the shared store contract suites against PostgreSQL.
//!
//! Needs a Docker daemon: `cargo test -p payrecon-postgres -- --ignored`.

mod common;

use payrecon_testing::contract::{
    ledger_store_contract_tests, outbox_store_contract_tests, run_store_contract_tests,
};

outbox_store_contract_tests! {
    #[ignore = "requires Docker"]
    suite = postgres_outbox,
    make_store = crate::common::outbox_store,
}

ledger_store_contract_tests! {
    #[ignore = "requires Docker"]
    suite = postgres_ledger,
    make_store = crate::common::ledger_store,
}

run_store_contract_tests! {
    #[ignore = "requires Docker"]
    suite = postgres_runs,
    make_store = crate::common::run_store,
}
