//! Set-oriented update of existing rows through a session-scoped staging table.
//!
//! Instead of one `UPDATE` per row, update candidates are bulk-loaded into a
//! temporary copy of the target's structure and applied with a single
//! `UPDATE ... FROM` joined on the update key:
//!
//! ```text
//! DISCARD TEMP
//! BEGIN
//! CREATE TEMP TABLE table_staging AS SELECT * FROM pfin.earning WITH NO DATA
//! INSERT INTO table_staging (...) VALUES (...), (...)      -- batched
//! UPDATE pfin.earning AS T SET c = S.c, ... FROM table_staging AS S WHERE T.k=S.k
//! DROP TABLE table_staging
//! COMMIT
//! ```
//!
//! Every statement after `BEGIN` runs in one transaction, so a failure leaves
//! neither a partial update nor the staging table behind.

use pfin_core::{ColumnType, NaturalKey, Record, TableSchema};
use sqlx::{Connection, Postgres, QueryBuilder};
use tracing::{debug, info, info_span, Instrument};

use crate::pg::{carried_columns, db_err, insert_builder, qualified, quote_ident, rows_per_statement};
use crate::{PgStore, StorageError};

pub const STAGING_TABLE: &str = "table_staging";

/// The SQL of one staging upsert, derived from the target schema, the update
/// key, and the columns the candidates actually carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPlan {
    target: String,
    table: String,
    columns: Vec<(String, ColumnType)>,
    key: Vec<String>,
}

impl StagingPlan {
    pub fn new(
        schema: &TableSchema,
        update_key: &NaturalKey,
        candidates: &[Record],
    ) -> Result<Self, StorageError> {
        let table = schema.qualified_name();
        if update_key.is_empty() {
            return Err(StorageError::EmptyUpdateKey { table });
        }
        let columns = carried_columns(schema, candidates);
        for key in update_key.columns() {
            if !columns.iter().any(|(name, _)| name == key) {
                return Err(StorageError::MissingKeyColumn {
                    table,
                    column: key.clone(),
                });
            }
        }
        Ok(Self {
            target: qualified(schema),
            table,
            columns,
            key: update_key.columns().to_vec(),
        })
    }

    /// Non-key columns rewritten by the update; columns the candidates do not
    /// carry are left untouched.
    pub fn set_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| !self.key.iter().any(|k| k == name))
            .collect()
    }

    pub fn discard_sql(&self) -> &'static str {
        "DISCARD TEMP"
    }

    pub fn create_sql(&self) -> String {
        format!(
            "CREATE TEMP TABLE {STAGING_TABLE} AS SELECT * FROM {} WITH NO DATA",
            self.target
        )
    }

    pub fn insert_builder(&self, rows: &[Record]) -> QueryBuilder<'static, Postgres> {
        insert_builder(STAGING_TABLE, &self.columns, rows)
    }

    pub fn rows_per_insert(&self) -> usize {
        rows_per_statement(self.columns.len())
    }

    pub fn update_sql(&self) -> String {
        let set_list = self
            .set_columns()
            .into_iter()
            .map(|c| {
                let c = quote_ident(c);
                format!("{c} = S.{c}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        let join_cond = self
            .key
            .iter()
            .map(|k| {
                let k = quote_ident(k);
                format!("T.{k}=S.{k}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(
            "UPDATE {} AS T SET {set_list} FROM {STAGING_TABLE} AS S WHERE {join_cond}",
            self.target
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE {STAGING_TABLE}")
    }
}

impl PgStore {
    /// Applies `candidates` to the target table in one transaction.
    ///
    /// Empty input is a no-op: no connection is taken and no staging table is
    /// created. Returns the number of target rows the `UPDATE` touched.
    pub async fn apply_updates(
        &self,
        schema: &TableSchema,
        update_key: &NaturalKey,
        candidates: &[Record],
    ) -> Result<u64, StorageError> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let plan = StagingPlan::new(schema, update_key, candidates)?;
        if plan.set_columns().is_empty() {
            debug!(table = %plan.table, "update candidates carry only key columns");
            return Ok(0);
        }

        let span = info_span!("staging_upsert", table = %plan.table, candidates = candidates.len());
        async {
            let mut conn = self
                .pool()
                .acquire()
                .await
                .map_err(db_err(format!("acquiring connection for {}", plan.table)))?;

            // clears a staging table left over from an aborted session
            sqlx::query(plan.discard_sql())
                .execute(&mut *conn)
                .await
                .map_err(db_err("discarding temporary tables"))?;

            let mut tx = conn
                .begin()
                .await
                .map_err(db_err(format!("opening update transaction for {}", plan.table)))?;

            let create = plan.create_sql();
            sqlx::query(&create)
                .execute(&mut *tx)
                .await
                .map_err(db_err(format!("creating {STAGING_TABLE}")))?;

            for chunk in candidates.chunks(plan.rows_per_insert()) {
                let mut qb = plan.insert_builder(chunk);
                qb.build()
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err(format!("loading {STAGING_TABLE}")))?;
            }

            let update = plan.update_sql();
            let updated = sqlx::query(&update)
                .execute(&mut *tx)
                .await
                .map_err(db_err(format!("updating {} from {STAGING_TABLE}", plan.table)))?
                .rows_affected();

            let drop = plan.drop_sql();
            sqlx::query(&drop)
                .execute(&mut *tx)
                .await
                .map_err(db_err(format!("dropping {STAGING_TABLE}")))?;

            tx.commit()
                .await
                .map_err(db_err(format!("committing update of {}", plan.table)))?;
            info!(updated, "applied staged updates");
            Ok(updated)
        }
        .instrument(span)
        .await
    }
}
