//! PostgreSQL read-model store tests.
//!
//! Need a Docker daemon; run with:
//!
//! ```bash
//! cargo test -p read-model --test postgres_integration -- --ignored
//! ```

use std::sync::Arc;

use read_model::{
    Condition, Filter, FindQuery, ModelUpdate, Operator, PostgresReadModelStore, ReadModelError,
    ReadModelId, ReadModelStore, SortKey, Version,
};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/002_create_read_models_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresReadModelStore {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE read_models")
        .execute(&pool)
        .await
        .unwrap();

    PostgresReadModelStore::new(pool)
}

fn update(data: serde_json::Value) -> ModelUpdate {
    ModelUpdate::new("customer", data.as_object().cloned().unwrap())
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn create_update_and_conflict() {
    let store = get_test_store().await;
    let id = ReadModelId::from("X");

    let created = store
        .upsert(&id, Version::initial(), update(json!({"name": "foo"})))
        .await
        .unwrap();
    assert_eq!(created.version, Version::first());

    let updated = store
        .upsert(&id, Version::first(), update(json!({"name": "bar"})))
        .await
        .unwrap();
    assert_eq!(updated.version, Version::new(2));
    assert_eq!(updated.data["name"], json!("bar"));

    let stale = store
        .upsert(&id, Version::first(), update(json!({"name": "baz"})))
        .await;
    assert!(matches!(
        stale,
        Err(ReadModelError::ConcurrencyConflict { actual: Some(v), .. }) if v == Version::new(2)
    ));
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn concurrent_upserts_exactly_one_wins() {
    let store = get_test_store().await;
    let id = ReadModelId::from("X");
    store
        .upsert(&id, Version::initial(), update(json!({})))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        store.upsert(&id, Version::first(), update(json!({"w": "a"}))),
        store.upsert(&id, Version::first(), update(json!({"w": "b"}))),
    );

    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.version, Version::new(2));
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn delete_with_expected_version() {
    let store = get_test_store().await;
    let id = ReadModelId::from("X");
    store
        .upsert(&id, Version::initial(), update(json!({})))
        .await
        .unwrap();

    assert!(store.delete(&id, Some(Version::new(9))).await.is_err());
    store.delete(&id, Some(Version::first())).await.unwrap();
    assert!(store.get(&id).await.unwrap().is_none());
    store.delete(&id, None).await.unwrap();
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn find_matches_in_memory_semantics() {
    let store = get_test_store().await;
    for (key, age, tags) in [
        ("a", 40, json!(["vip"])),
        ("b", 20, json!([])),
        ("c", 30, json!(["vip", "new"])),
        ("d", 10, json!([])),
    ] {
        store
            .upsert(
                &ReadModelId::from(key),
                Version::initial(),
                update(json!({"age": age, "tags": tags, "profile": {"name": key}})),
            )
            .await
            .unwrap();
    }

    let query = FindQuery::new(
        Filter::new()
            .model_type("customer")
            .condition(Condition::new("age", Operator::Gte, 20)),
    )
    .sort(SortKey::desc("age"))
    .limit(2)
    .offset(1)
    .with_total();
    let page = store.find(&query).await.unwrap();
    let ids: Vec<_> = page.items.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["c", "b"]);
    assert_eq!(page.total, Some(3));

    let vip = FindQuery::new(
        Filter::new().condition(Condition::new("tags", Operator::Contains, "vip")),
    )
    .sort(SortKey::asc("id"));
    let page = store.find(&vip).await.unwrap();
    let ids: Vec<_> = page.items.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);

    let nested = FindQuery::new(Filter::new().condition(Condition::new(
        "profile.name",
        Operator::In,
        json!(["b", "d"]),
    )))
    .sort(SortKey::asc("id"));
    let page = store.find(&nested).await.unwrap();
    let ids: Vec<_> = page.items.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "d"]);
}
