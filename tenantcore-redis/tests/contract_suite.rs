//! Shared lock contracts against a real Redis.

use std::sync::OnceLock;
use std::time::Duration;

use tenantcore_redis::{RedisConfig, RedisLockStore};
use tenantcore_testing::lock_contract_tests;
use testcontainers::runners::SyncRunner;
use testcontainers::{Container, ImageExt, ReuseDirective};
use testcontainers_modules::redis::Redis;

const CONTAINER_NAME: &str = "tenantcore-test-redis";

static SHARED: OnceLock<(String, Container<Redis>)> = OnceLock::new();

fn shared_url() -> String {
    SHARED
        .get_or_init(|| {
            std::thread::spawn(|| {
                let container = Redis::default()
                    .with_container_name(CONTAINER_NAME)
                    .with_reuse(ReuseDirective::Always)
                    .start()
                    .expect("should start redis container");
                let port = container
                    .get_host_port_ipv4(6379)
                    .expect("should get redis port");
                (format!("redis://127.0.0.1:{port}"), container)
            })
            .join()
            .expect("container setup thread should complete")
        })
        .0
        .clone()
}

async fn redis_store() -> RedisLockStore {
    let url = tokio::task::spawn_blocking(shared_url)
        .await
        .expect("container lookup should not panic");
    let config = RedisConfig {
        url,
        password: None,
        db: 0,
    };

    let mut attempts = 0;
    loop {
        match RedisLockStore::connect(&config).await {
            Ok(store) => return store,
            Err(error) => {
                attempts += 1;
                assert!(attempts < 30, "should connect to redis container: {error}");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

lock_contract_tests! {
    #[ignore = "requires docker"]
    suite = redis_locks,
    make_store = redis_store,
}
