//! Runs against a live PostgreSQL only when `PFIN_TEST_DATABASE_URL` is set.

use pfin_core::{ColumnDef, ColumnType, NaturalKey, Record, TableSchema, Value};
use pfin_storage::{PgStore, StorageError};

async fn store_with_schema() -> Option<(PgStore, String)> {
    let url = std::env::var("PFIN_TEST_DATABASE_URL").ok()?;
    let store = PgStore::connect(&url, 1).await.expect("connect");
    let schema = format!("pfin_test_{}", uuid::Uuid::new_v4().simple());
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(store.pool())
        .await
        .expect("create schema");
    sqlx::query(&format!(
        "CREATE TABLE {schema}.cpi (
            id bigserial PRIMARY KEY,
            year integer NOT NULL,
            month integer NOT NULL,
            series_value numeric CHECK (series_value >= 0),
            series_name text,
            UNIQUE (year, month)
        )"
    ))
    .execute(store.pool())
    .await
    .expect("create table");
    Some((store, schema))
}

async fn drop_schema(store: &PgStore, schema: &str) {
    sqlx::query(&format!("DROP SCHEMA {schema} CASCADE"))
        .execute(store.pool())
        .await
        .expect("drop schema");
    store.close().await;
}

fn cpi_schema(schema: &str) -> TableSchema {
    TableSchema {
        schema: schema.to_string(),
        name: "cpi".into(),
        columns: vec![
            ColumnDef { name: "id".into(), column_type: ColumnType::BigInt },
            ColumnDef { name: "year".into(), column_type: ColumnType::Int },
            ColumnDef { name: "month".into(), column_type: ColumnType::Int },
            ColumnDef { name: "series_value".into(), column_type: ColumnType::Numeric },
            ColumnDef { name: "series_name".into(), column_type: ColumnType::Text },
        ],
        identity: vec!["id".into()],
    }
}

fn cpi_row(year: i64, month: i64, value: f64) -> Record {
    Record::from_pairs([
        ("year", Value::Int(year)),
        ("month", Value::Int(month)),
        ("series_value", Value::Float(value)),
        ("series_name", Value::from("cpi-u")),
    ])
}

async fn staging_table_exists(store: &PgStore) -> bool {
    sqlx::query_scalar::<_, Option<String>>("SELECT to_regclass('pg_temp.table_staging')::text")
        .fetch_one(store.pool())
        .await
        .expect("regclass")
        .is_some()
}

async fn values(store: &PgStore, schema: &TableSchema) -> Vec<(i64, i64, Option<f64>)> {
    let mut rows: Vec<_> = store
        .read_snapshot(schema)
        .await
        .expect("snapshot")
        .into_iter()
        .map(|r| {
            (
                r.value("year").as_i64().unwrap(),
                r.value("month").as_i64().unwrap(),
                r.value("series_value").as_f64(),
            )
        })
        .collect();
    rows.sort_by_key(|(y, m, _)| (*y, *m));
    rows
}

#[tokio::test]
async fn staged_update_rewrites_matching_rows_and_cleans_up() {
    let Some((store, schema_name)) = store_with_schema().await else {
        return;
    };
    let schema = cpi_schema(&schema_name);
    store
        .insert_records(&schema, &[cpi_row(2024, 1, 308.4), cpi_row(2024, 2, 310.3)])
        .await
        .expect("seed");

    let mut snapshot = store.read_snapshot(&schema).await.expect("snapshot");
    snapshot.sort_by_key(|r| r.value("month").as_i64());
    let mut candidates = Vec::new();
    for (row, value) in snapshot.iter().zip([309.0, 311.0]) {
        let mut candidate = cpi_row(2024, row.value("month").as_i64().unwrap(), value);
        candidate.set("id", row.value("id").clone());
        candidates.push(candidate);
    }

    let id_key = NaturalKey::new(["id"]);
    let updated = store
        .apply_updates(&schema, &id_key, &candidates)
        .await
        .expect("apply");
    assert_eq!(updated, 2);
    assert_eq!(
        values(&store, &schema).await,
        vec![(2024, 1, Some(309.0)), (2024, 2, Some(311.0))]
    );
    assert!(!staging_table_exists(&store).await);

    // rerunning the same candidates rewrites identical values
    store
        .apply_updates(&schema, &id_key, &candidates)
        .await
        .expect("rerun");
    assert_eq!(
        values(&store, &schema).await,
        vec![(2024, 1, Some(309.0)), (2024, 2, Some(311.0))]
    );

    assert_eq!(store.apply_updates(&schema, &id_key, &[]).await.expect("noop"), 0);
    drop_schema(&store, &schema_name).await;
}

#[tokio::test]
async fn failed_update_leaves_target_untouched() {
    let Some((store, schema_name)) = store_with_schema().await else {
        return;
    };
    let schema = cpi_schema(&schema_name);
    store
        .insert_records(&schema, &[cpi_row(2024, 1, 308.4), cpi_row(2024, 2, 310.3)])
        .await
        .expect("seed");

    // the staging copy has no CHECK constraint, so the failure happens in the UPDATE itself
    let candidates = vec![cpi_row(2024, 1, 1.0), cpi_row(2024, 2, -5.0)];
    let err = store
        .apply_updates(&schema, &NaturalKey::new(["year", "month"]), &candidates)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Database { .. }));

    assert_eq!(
        values(&store, &schema).await,
        vec![(2024, 1, Some(308.4)), (2024, 2, Some(310.3))]
    );
    assert!(!staging_table_exists(&store).await);
    drop_schema(&store, &schema_name).await;
}
