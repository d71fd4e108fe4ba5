//! Shared repository and transaction contracts against a real MongoDB
//! replica set.

use std::sync::OnceLock;
use std::time::Duration;

use tenantcore_mongo::{MongoBackend, MongoConfig};
use tenantcore_testing::{
    repository_contract_tests, transaction_contract_tests, Label, LogRecord,
};
use testcontainers::runners::SyncRunner;
use testcontainers::{Container, ImageExt, ReuseDirective};
use testcontainers_modules::mongo::Mongo;

// Transactions need a replica set, even a single-node one.
const CONTAINER_NAME: &str = "tenantcore-test-mongo-rs";

static SHARED: OnceLock<(String, Container<Mongo>)> = OnceLock::new();

fn shared_url() -> String {
    SHARED
        .get_or_init(|| {
            std::thread::spawn(|| {
                let container = Mongo::repl_set()
                    .with_container_name(CONTAINER_NAME)
                    .with_reuse(ReuseDirective::Always)
                    .start()
                    .expect("should start mongo container");
                let port = container
                    .get_host_port_ipv4(27017)
                    .expect("should get mongo port");
                (
                    format!("mongodb://127.0.0.1:{port}/?directConnection=true"),
                    container,
                )
            })
            .join()
            .expect("container setup thread should complete")
        })
        .0
        .clone()
}

async fn mongo_backend() -> MongoBackend {
    let url = tokio::task::spawn_blocking(shared_url)
        .await
        .expect("container lookup should not panic");
    let config = MongoConfig {
        url,
        database: "tenantcore_contract".to_string(),
    };

    for attempt in 0..30 {
        match MongoBackend::connect(&config).await {
            Ok(backend) => {
                backend.ensure_indexes::<Label>().await.expect("label index");
                backend
                    .ensure_indexes::<LogRecord>()
                    .await
                    .expect("log_record index");
                return backend;
            }
            Err(_) if attempt < 29 => {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(error) => panic!("should connect to mongo container: {error}"),
        }
    }
    unreachable!("the last attempt either returns or panics")
}

repository_contract_tests! {
    #[ignore = "requires docker"]
    suite = mongo_repository,
    make_backend = mongo_backend,
}

transaction_contract_tests! {
    #[ignore = "requires docker"]
    suite = mongo_transactions,
    make_backend = mongo_backend,
}
