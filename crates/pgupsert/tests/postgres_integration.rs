//! Integration tests against real PostgreSQL.
//!
//! These tests verify that:
//! 1. Compiled upserts insert new rows and update existing ones
//! 2. A failed batch leaves no rows behind and the transaction stays usable
//! 3. Projections over relations and computed fields resolve in the database
//! 4. A cancelled upsert is rolled back before the transaction commits
//!
//! Run with: cargo nextest run -p pgupsert --features test-postgres --test postgres_integration
//!
//! Note: Requires Docker to be running.

#![cfg(feature = "test-postgres")]

use pgupsert::{
    ColumnDescriptor, ComputedField, Error, InputRow, PgType, Projection, QualifiedName, Relation,
    RelationKind, Schema, TableDescriptor, UpsertRequest, Upserter, Value,
};
use std::time::Duration;

use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::{Client, NoTls};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a PostgreSQL container and return its connection string.
async fn start_postgres() -> (ContainerAsync<Postgres>, String) {
    init_tracing();
    let container = Postgres::default()
        .start()
        .await
        .expect("failed to start postgres container");
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("postgres port not available");
    let conn_str =
        format!("host={host} port={port} user=postgres password=postgres dbname=postgres");
    (container, conn_str)
}

/// Set up a PostgreSQL container and return a connected client with the test
/// tables created.
async fn setup_postgres() -> (ContainerAsync<Postgres>, Client) {
    let (container, conn_str) = start_postgres().await;
    let (client, connection) = tokio_postgres::connect(&conn_str, NoTls)
        .await
        .expect("failed to connect to postgres");

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {}", e);
        }
    });

    create_test_tables(&client).await;
    (container, client)
}

async fn create_test_tables(client: &Client) {
    client
        .batch_execute(
            r#"
            CREATE SCHEMA app;

            CREATE TABLE app.items (
                id BIGINT PRIMARY KEY,
                name TEXT,
                qty INTEGER
            );

            CREATE TABLE app.author (
                id BIGINT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE app.post (
                id BIGINT PRIMARY KEY,
                author_id BIGINT NOT NULL REFERENCES app.author(id),
                title TEXT NOT NULL
            );

            CREATE TABLE app.tag (
                name TEXT PRIMARY KEY
            );

            CREATE FUNCTION app.author_shout(a app.author) RETURNS text
                LANGUAGE sql STABLE AS $$ SELECT upper(a.name) $$;
            "#,
        )
        .await
        .expect("failed to create tables");
}

fn test_schema() -> Schema {
    Schema::new()
        .with_table(
            TableDescriptor::new(QualifiedName::new("app", "items"))
                .column(ColumnDescriptor::new("id", PgType::BigInt).primary_key())
                .column(ColumnDescriptor::new("name", PgType::Text))
                .column(ColumnDescriptor::new("qty", PgType::Integer)),
        )
        .with_table(
            TableDescriptor::new(QualifiedName::new("app", "author"))
                .column(ColumnDescriptor::new("id", PgType::BigInt).primary_key())
                .column(ColumnDescriptor::new("name", PgType::Text))
                .computed(ComputedField {
                    name: "shout".into(),
                    function: QualifiedName::new("app", "author_shout"),
                    pg_type: PgType::Text,
                })
                .relation(Relation {
                    name: "posts".into(),
                    kind: RelationKind::ToMany,
                    target: QualifiedName::new("app", "post"),
                    column_pairs: vec![("id".into(), "author_id".into())],
                }),
        )
        .with_table(
            TableDescriptor::new(QualifiedName::new("app", "post"))
                .column(ColumnDescriptor::new("id", PgType::BigInt).primary_key())
                .column(ColumnDescriptor::new("author_id", PgType::BigInt))
                .column(ColumnDescriptor::new("title", PgType::Text))
                .relation(Relation {
                    name: "author".into(),
                    kind: RelationKind::ToOne,
                    target: QualifiedName::new("app", "author"),
                    column_pairs: vec![("author_id".into(), "id".into())],
                }),
        )
        .with_table(
            TableDescriptor::new(QualifiedName::new("app", "tag"))
                .column(ColumnDescriptor::new("name", PgType::Text).primary_key()),
        )
}

fn item(id: i64, name: &str, qty: i64) -> InputRow {
    let mut row = InputRow::new();
    row.insert("id".into(), Value::I64(id));
    row.insert("name".into(), Value::String(name.into()));
    row.insert("qty".into(), Value::I64(qty));
    row
}

fn items(rows: impl IntoIterator<Item = InputRow>, projection: Projection) -> UpsertRequest {
    UpsertRequest::new(QualifiedName::new("app", "items"))
        .rows(rows)
        .projection(projection)
}

async fn count(client: &impl tokio_postgres::GenericClient, table: &str) -> i64 {
    client
        .query_one(&format!("SELECT count(*) FROM {table}"), &[])
        .await
        .expect("count query failed")
        .get(0)
}

#[tokio::test]
async fn test_insert_then_update() {
    let (_container, mut client) = setup_postgres().await;
    let schema = test_schema();
    let tx = client.transaction().await.unwrap();
    let mut upserter = Upserter::new(&tx);

    let all = Projection::new().field("id").field("name").field("qty");
    let payload = upserter
        .upsert(
            &schema,
            items([item(1, "a", 5)], all.clone()).client_mutation_id("first"),
        )
        .await
        .unwrap();
    assert_eq!(payload.client_mutation_id.as_deref(), Some("first"));
    assert_eq!(payload.len(), 1);
    let row = payload.row().unwrap();
    assert_eq!(row["id"], Value::I64(1));
    assert_eq!(row["name"], Value::String("a".into()));
    assert_eq!(row["qty"], Value::I32(5));

    let payload = upserter
        .upsert(&schema, items([item(1, "b", 9)], all))
        .await
        .unwrap();
    let row = payload.row().unwrap();
    assert_eq!(row["name"], Value::String("b".into()));
    assert_eq!(row["qty"], Value::I32(9));

    let payload = upserter
        .upsert(
            &schema,
            items([item(1, "b", 9)], Projection::new().field("name")),
        )
        .await
        .unwrap();
    assert_eq!(payload.len(), 1);
    let row = payload.row().unwrap();
    assert_eq!(row.len(), 1);
    assert_eq!(row["name"], Value::String("b".into()));

    drop(upserter);
    assert_eq!(count(&tx, "app.items").await, 1);
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_batch_preserves_input_order() {
    let (_container, mut client) = setup_postgres().await;
    let schema = test_schema();
    let tx = client.transaction().await.unwrap();
    let mut upserter = Upserter::new(&tx);

    upserter
        .upsert(
            &schema,
            items([item(2, "two", 1)], Projection::new().field("id")),
        )
        .await
        .unwrap();

    let payload = upserter
        .upsert(
            &schema,
            items(
                [item(3, "three", 1), item(1, "one", 1), item(2, "deux", 2)],
                Projection::new().field("id").field("name"),
            ),
        )
        .await
        .unwrap();
    let ids: Vec<&Value> = payload.rows.iter().map(|r| &r["id"]).collect();
    assert_eq!(ids, vec![&Value::I64(3), &Value::I64(1), &Value::I64(2)]);
    assert_eq!(payload.rows[2]["name"], Value::String("deux".into()));

    drop(upserter);
    assert_eq!(count(&tx, "app.items").await, 3);
}

#[tokio::test]
async fn test_duplicate_keys_reject_the_batch() {
    let (_container, mut client) = setup_postgres().await;
    let schema = test_schema();
    let tx = client.transaction().await.unwrap();
    let mut upserter = Upserter::new(&tx);

    let err = upserter
        .upsert(
            &schema,
            items(
                [item(1, "a", 1), item(1, "b", 2)],
                Projection::new().field("id"),
            ),
        )
        .await
        .unwrap_err();
    match err {
        Error::Execution(e) => assert!(e.is_duplicate_conflict_key(), "{e}"),
        other => panic!("unexpected error: {other:?}"),
    }

    // The enclosing transaction is still usable.
    drop(upserter);
    assert_eq!(count(&tx, "app.items").await, 0);
    let mut upserter = Upserter::new(&tx);
    upserter
        .upsert(&schema, items([item(1, "a", 1)], Projection::new().field("id")))
        .await
        .unwrap();
    drop(upserter);
    assert_eq!(count(&tx, "app.items").await, 1);
}

#[tokio::test]
async fn test_failed_row_leaves_nothing_behind() {
    let (_container, mut client) = setup_postgres().await;
    let schema = test_schema();
    let tx = client.transaction().await.unwrap();
    let mut upserter = Upserter::new(&tx);

    let mut good = InputRow::new();
    good.insert("id".into(), Value::I64(1));
    good.insert("name".into(), Value::String("ann".into()));
    let mut bad = InputRow::new();
    bad.insert("id".into(), Value::I64(2));
    bad.insert("name".into(), Value::Null);

    let err = upserter
        .upsert(
            &schema,
            UpsertRequest::new(QualifiedName::new("app", "author"))
                .rows([good, bad])
                .projection(Projection::new().field("id")),
        )
        .await
        .unwrap_err();
    match err {
        // not_null_violation
        Error::Execution(e) => assert_eq!(e.sqlstate(), Some("23502")),
        other => panic!("unexpected error: {other:?}"),
    }

    let session = upserter.into_inner().await.unwrap();
    assert_eq!(count(session, "app.author").await, 0);
}

#[tokio::test]
async fn test_relations_and_computed_fields() {
    let (_container, mut client) = setup_postgres().await;
    let schema = test_schema();
    let tx = client.transaction().await.unwrap();
    tx.batch_execute(
        r#"
        INSERT INTO app.author (id, name) VALUES (1, 'old');
        INSERT INTO app.post (id, author_id, title) VALUES (11, 1, 'second'), (10, 1, 'first');
        "#,
    )
    .await
    .unwrap();

    let mut upserter = Upserter::new(&tx);
    let mut ann = InputRow::new();
    ann.insert("id".into(), Value::I64(1));
    ann.insert("name".into(), Value::String("ann".into()));
    let mut bob = InputRow::new();
    bob.insert("id".into(), Value::I64(2));
    bob.insert("name".into(), Value::String("bob".into()));

    let payload = upserter
        .upsert(
            &schema,
            UpsertRequest::new(QualifiedName::new("app", "author"))
                .rows([ann, bob])
                .projection(
                    Projection::new()
                        .aliased("shout", "loud")
                        .relation("posts", Projection::new().field("title")),
                ),
        )
        .await
        .unwrap();

    assert_eq!(payload.len(), 2);
    assert_eq!(payload.rows[0]["loud"], Value::String("ANN".into()));
    assert_eq!(
        payload.rows[0]["posts"],
        Value::Json(r#"[{"title": "first"}, {"title": "second"}]"#.into())
    );
    assert_eq!(payload.rows[1]["loud"], Value::String("BOB".into()));
    assert_eq!(payload.rows[1]["posts"], Value::Json("[]".into()));

    let mut post = InputRow::new();
    post.insert("id".into(), Value::I64(12));
    post.insert("author_id".into(), Value::I64(2));
    post.insert("title".into(), Value::String("hello".into()));
    let payload = upserter
        .upsert_one(
            &schema,
            QualifiedName::new("app", "post"),
            post,
            Projection::new().field("title").relation(
                "author",
                Projection::new().field("name").field("shout"),
            ),
            Some("post-1".into()),
        )
        .await
        .unwrap();
    let row = payload.row().unwrap();
    assert_eq!(row["title"], Value::String("hello".into()));
    assert_eq!(
        row["author"],
        Value::Json(r#"{"name": "bob", "shout": "BOB"}"#.into())
    );
}

fn tag(name: &str) -> InputRow {
    let mut row = InputRow::new();
    row.insert("name".into(), Value::String(name.into()));
    row
}

#[tokio::test]
async fn test_key_only_table_returns_existing_rows() {
    let (_container, mut client) = setup_postgres().await;
    let schema = test_schema();
    let tx = client.transaction().await.unwrap();
    let mut upserter = Upserter::new(&tx);

    let first = upserter
        .upsert_one(
            &schema,
            QualifiedName::new("app", "tag"),
            tag("rust"),
            Projection::new().field("name"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(first.row().unwrap()["name"], Value::String("rust".into()));

    let again = upserter
        .upsert_one(
            &schema,
            QualifiedName::new("app", "tag"),
            tag("rust"),
            Projection::new().field("name"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(again.row().unwrap()["name"], Value::String("rust".into()));

    let payload = upserter
        .upsert(
            &schema,
            UpsertRequest::new(QualifiedName::new("app", "tag"))
                .rows([tag("rust"), tag("go")])
                .projection(Projection::new().field("name")),
        )
        .await
        .unwrap();
    let mut names: Vec<&Value> = payload.rows.iter().map(|r| &r["name"]).collect();
    names.sort_by_key(|v| format!("{v:?}"));
    assert_eq!(
        names,
        vec![&Value::String("go".into()), &Value::String("rust".into())]
    );

    drop(upserter);
    assert_eq!(count(&tx, "app.tag").await, 2);
}

#[tokio::test]
async fn test_empty_projection_still_writes() {
    let (_container, mut client) = setup_postgres().await;
    let schema = test_schema();
    let tx = client.transaction().await.unwrap();
    let mut upserter = Upserter::new(&tx);

    let payload = upserter
        .upsert(
            &schema,
            items([item(1, "a", 1), item(2, "b", 2)], Projection::new())
                .client_mutation_id("only-the-token"),
        )
        .await
        .unwrap();
    assert_eq!(payload.client_mutation_id.as_deref(), Some("only-the-token"));
    assert_eq!(payload.len(), 2);
    assert!(payload.rows.iter().all(|row| row.is_empty()));

    drop(upserter);
    assert_eq!(count(&tx, "app.items").await, 2);
}

#[tokio::test]
async fn test_cancelled_upsert_is_not_committed() {
    let (_container, mut client) = setup_postgres().await;
    client
        .batch_execute(
            r#"
            CREATE FUNCTION app.slow_insert() RETURNS trigger
                LANGUAGE plpgsql AS $$ BEGIN PERFORM pg_sleep(0.5); RETURN NEW; END $$;
            CREATE TRIGGER slow_insert BEFORE INSERT ON app.items
                FOR EACH ROW EXECUTE FUNCTION app.slow_insert();
            "#,
        )
        .await
        .unwrap();

    let schema = test_schema();
    let tx = client.transaction().await.unwrap();
    let mut upserter = Upserter::new(&tx);

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        upserter.upsert(&schema, items([item(1, "a", 1)], Projection::new().field("id"))),
    )
    .await;
    assert!(result.is_err(), "upsert should still be running");

    drop(upserter);
    tx.commit().await.unwrap();
    assert_eq!(count(&client, "app.items").await, 0);
}

#[tokio::test]
async fn test_pooled_session() {
    let (_container, conn_str) = start_postgres().await;
    let pg_config: tokio_postgres::Config = conn_str.parse().unwrap();
    let manager = deadpool_postgres::Manager::new(pg_config, NoTls);
    let pool = deadpool_postgres::Pool::builder(manager)
        .max_size(2)
        .build()
        .unwrap();

    let object = pool.get().await.unwrap();
    create_test_tables(&object).await;
    object.batch_execute("BEGIN").await.unwrap();

    let schema = test_schema();
    let mut upserter = Upserter::new(object);
    let payload = upserter
        .upsert(
            &schema,
            items(
                [item(1, "a", 1), item(2, "b", 2)],
                Projection::new().field("qty"),
            ),
        )
        .await
        .unwrap();
    assert_eq!(payload.len(), 2);
    assert_eq!(payload.rows[1]["qty"], Value::I32(2));

    let object = upserter.into_inner().await.unwrap();
    object.batch_execute("COMMIT").await.unwrap();
    assert_eq!(count(&**object, "app.items").await, 2);
}
