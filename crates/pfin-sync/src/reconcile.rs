//! Schema reconciliation and snapshot diffing.
//!
//! A batch is first projected onto the declared columns it actually carries,
//! then partitioned against the stored snapshot by natural key:
//!
//! - keys absent from the snapshot become inserts, in batch order;
//! - keys present become update candidates carrying the batch values plus
//!   the stored row's identity columns (e.g. `id`).

use std::collections::{HashMap, HashSet};

use pfin_core::{KeyTuple, NaturalKey, Record, TableSchema};
use serde::Serialize;
use thiserror::Error;

/// A snapshot and a batch restricted to the same ordered column list.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub common_columns: Vec<String>,
    pub old_projected: Vec<Record>,
    pub new_projected: Vec<Record>,
}

/// Projects `stored` and `incoming` onto the declared columns present in the
/// batch, in declaration order. Incoming values are coerced to the declared
/// column types so keys compare by typed value.
pub fn reconcile(schema: &TableSchema, stored: &[Record], incoming: Vec<Record>) -> Reconciled {
    let typed: Vec<_> = schema
        .columns
        .iter()
        .filter(|c| incoming.iter().any(|r| r.contains(&c.name)))
        .map(|c| (c.name.clone(), c.column_type))
        .collect();
    let common_columns: Vec<String> = typed.iter().map(|(name, _)| name.clone()).collect();

    let old_projected = stored.iter().map(|r| r.project(&common_columns)).collect();
    let new_projected = incoming
        .into_iter()
        .map(|record| {
            let mut projected = Record::new();
            for (name, column_type) in &typed {
                projected.set(name.clone(), record.value(name).clone().coerce(*column_type));
            }
            projected
        })
        .collect();

    Reconciled {
        common_columns,
        old_projected,
        new_projected,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
    pub to_insert: Vec<Record>,
    pub to_update: Vec<Record>,
    /// Batch records dropped because an earlier record had the same key.
    pub duplicate_keys: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiffError {
    #[error("natural key column `{column}` is not carried by the batch")]
    KeyNotCarried { column: String },
}

#[derive(Debug, Clone)]
pub struct SnapshotDiffer {
    natural_key: NaturalKey,
    identity: Vec<String>,
}

impl SnapshotDiffer {
    pub fn new(natural_key: NaturalKey, identity: Vec<String>) -> Self {
        Self {
            natural_key,
            identity,
        }
    }

    pub fn natural_key(&self) -> &NaturalKey {
        &self.natural_key
    }

    /// `stored` is the full snapshot the reconciled `old_projected` was built
    /// from (same order); it supplies the identity columns of matched rows.
    pub fn diff(&self, stored: &[Record], reconciled: &Reconciled) -> Result<DiffResult, DiffError> {
        if reconciled.new_projected.is_empty() {
            return Ok(DiffResult::default());
        }
        if let Some(column) = self
            .natural_key
            .columns()
            .iter()
            .find(|c| !reconciled.common_columns.contains(c))
        {
            return Err(DiffError::KeyNotCarried {
                column: column.clone(),
            });
        }

        let mut seen: HashSet<KeyTuple> = HashSet::with_capacity(reconciled.new_projected.len());
        let mut unique = Vec::with_capacity(reconciled.new_projected.len());
        let mut duplicate_keys = 0usize;
        for record in &reconciled.new_projected {
            if seen.insert(record.key(&self.natural_key)) {
                unique.push(record);
            } else {
                duplicate_keys += 1;
            }
        }

        if reconciled.old_projected.is_empty() {
            return Ok(DiffResult {
                to_insert: unique.into_iter().cloned().collect(),
                to_update: Vec::new(),
                duplicate_keys,
            });
        }

        let mut index: HashMap<KeyTuple, usize> = HashMap::with_capacity(reconciled.old_projected.len());
        for (idx, record) in reconciled.old_projected.iter().enumerate() {
            index.entry(record.key(&self.natural_key)).or_insert(idx);
        }

        let mut result = DiffResult {
            duplicate_keys,
            ..DiffResult::default()
        };
        for record in unique {
            match index.get(&record.key(&self.natural_key)) {
                None => result.to_insert.push(record.clone()),
                Some(&idx) => {
                    let mut candidate = record.clone();
                    for column in &self.identity {
                        if self.natural_key.contains(column) {
                            continue;
                        }
                        if let Some(value) = stored.get(idx).and_then(|row| row.get(column)) {
                            candidate.set(column.clone(), value.clone());
                        }
                    }
                    result.to_update.push(candidate);
                }
            }
        }
        Ok(result)
    }
}
