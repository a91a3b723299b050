//! Persistence layer for extracted crawl records.
//!
//! A [`DataCell`] is one record produced by a parse rule. Cells are handed to
//! a [`Storage`] implementation; the batching SQL sink lives in [`sink`] and
//! the statement plumbing in [`sql`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod sink;
pub mod sql;

pub use sink::SqlStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("table {0} has no columns")]
    EmptyColumns(String),

    #[error("no field list registered for task {task} rule {rule}")]
    UnknownRule { task: String, rule: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One extracted record, destined for the table named after its task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataCell {
    /// Owning task name. Doubles as the destination table name.
    pub task: String,
    /// Rule that produced this record, used to resolve the column list.
    pub rule: String,
    /// Page the record was extracted from.
    pub url: String,
    /// Extraction timestamp, stored as text alongside the record.
    pub time: String,
    /// Rule-specific fields.
    pub data: HashMap<String, serde_json::Value>,
}

impl DataCell {
    pub fn table_name(&self) -> &str {
        &self.task
    }
}

/// Destination for parsed records. The crawl engine's result drainer calls
/// `save` once per produced cell; implementations may buffer.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, cells: Vec<DataCell>) -> Result<()>;
}

/// Resolves the ordered column list a rule declared for its records.
///
/// Implemented by the task registry so the sink never holds a reference
/// back into the task model.
pub trait FieldResolver: Send + Sync {
    fn fields(&self, task: &str, rule: &str) -> Option<Vec<String>>;
}

/// A `Storage` that logs each cell and drops it. Used in tests and as the
/// default before a SQL backend is configured.
#[derive(Debug, Default)]
pub struct PrintStorage;

#[async_trait]
impl Storage for PrintStorage {
    async fn save(&self, cells: Vec<DataCell>) -> Result<()> {
        for cell in cells {
            tracing::info!(table = %cell.table_name(), url = %cell.url, "record: {:?}", cell.data);
        }
        Ok(())
    }
}
