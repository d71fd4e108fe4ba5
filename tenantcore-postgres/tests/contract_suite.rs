//! Shared repository and transaction contracts against a real Postgres.

mod common;

use common::postgres_backend;
use tenantcore_testing::{repository_contract_tests, transaction_contract_tests};

repository_contract_tests! {
    #[ignore = "requires docker"]
    suite = postgres_repository,
    make_backend = postgres_backend,
}

transaction_contract_tests! {
    #[ignore = "requires docker"]
    suite = postgres_transactions,
    make_backend = postgres_backend,
}
