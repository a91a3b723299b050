//! Batched, schema-on-first-write SQL sink.
//!
//! The first cell seen for a table drives `CREATE TABLE IF NOT EXISTS` from
//! its rule's field list. Cells buffer in memory and are written as one
//! multi-row insert. The cell that trips the batch threshold is appended
//! after the flush it triggers, so it starts the next batch alone; callers
//! must not rely on it being in the flushed rows.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::sql::{Column, DbClient, SqlDb, TableSpec};
use crate::{DataCell, FieldResolver, Result, Storage, StorageError};

const DEFAULT_BATCH_SIZE: usize = 64;

pub struct SqlStoreBuilder {
    sql_url: Option<String>,
    db: Option<Arc<dyn DbClient>>,
    resolver: Option<Arc<dyn FieldResolver>>,
    batch_size: usize,
    engine: String,
    charset: String,
}

impl Default for SqlStoreBuilder {
    fn default() -> Self {
        Self {
            sql_url: None,
            db: None,
            resolver: None,
            batch_size: DEFAULT_BATCH_SIZE,
            engine: "MyISAM".to_string(),
            charset: "utf8".to_string(),
        }
    }
}

impl SqlStoreBuilder {
    pub fn sql_url(mut self, url: impl Into<String>) -> Self {
        self.sql_url = Some(url.into());
        self
    }

    /// Use a pre-built database client instead of dialing `sql_url`.
    pub fn db(mut self, db: Arc<dyn DbClient>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn FieldResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub async fn build(self) -> Result<SqlStore> {
        let resolver = self
            .resolver
            .expect("SqlStoreBuilder requires a field resolver");
        let db: Arc<dyn DbClient> = match self.db {
            Some(db) => db,
            None => {
                let url = self.sql_url.expect("SqlStoreBuilder requires a sql url");
                Arc::new(SqlDb::connect(&url).await?)
            }
        };

        Ok(SqlStore {
            db,
            resolver,
            buffer: Mutex::new(Vec::new()),
            created: Mutex::new(HashSet::new()),
            batch_size: self.batch_size,
            engine: self.engine,
            charset: self.charset,
        })
    }
}

pub struct SqlStore {
    db: Arc<dyn DbClient>,
    resolver: Arc<dyn FieldResolver>,
    buffer: Mutex<Vec<DataCell>>,
    created: Mutex<HashSet<String>>,
    batch_size: usize,
    engine: String,
    charset: String,
}

impl SqlStore {
    pub fn builder() -> SqlStoreBuilder {
        SqlStoreBuilder::default()
    }

    /// Column list for a cell: the rule's declared fields as MEDIUMTEXT,
    /// then the fixed Url/Time trailers.
    fn columns_for(&self, cell: &DataCell) -> Result<Vec<Column>> {
        let fields =
            self.resolver
                .fields(&cell.task, &cell.rule)
                .ok_or_else(|| StorageError::UnknownRule {
                    task: cell.task.clone(),
                    rule: cell.rule.clone(),
                })?;

        let mut columns: Vec<Column> = fields
            .into_iter()
            .map(|f| Column::new(f, "MEDIUMTEXT"))
            .collect();
        columns.push(Column::new("Url", "VARCHAR(255)"));
        columns.push(Column::new("Time", "VARCHAR(255)"));
        Ok(columns)
    }

    async fn ensure_table(&self, cell: &DataCell) -> Result<()> {
        let mut created = self.created.lock().await;
        if created.contains(cell.table_name()) {
            return Ok(());
        }

        let spec = TableSpec {
            table: cell.table_name().to_string(),
            columns: self.columns_for(cell)?,
            auto_key: true,
            engine: self.engine.clone(),
            charset: self.charset.clone(),
        };
        if let Err(error) = self.db.create_table(&spec).await {
            tracing::error!(table = %spec.table, %error, "create table failed");
        }
        created.insert(cell.table_name().to_string());
        Ok(())
    }

    /// Write out everything buffered as one multi-row insert keyed on the
    /// first cell's table and column list.
    pub async fn flush(&self) -> Result<()> {
        let cells = {
            let mut buffer = self.buffer.lock().await;
            std::mem::take(&mut *buffer)
        };
        if cells.is_empty() {
            return Ok(());
        }

        let columns = self.columns_for(&cells[0])?;
        let field_count = columns.len() - 2;
        let mut rows = Vec::with_capacity(cells.len());
        for cell in &cells {
            let mut row = Vec::with_capacity(columns.len());
            for column in columns.iter().take(field_count) {
                row.push(coerce(cell.data.get(&column.name)));
            }
            row.push(cell.url.clone());
            row.push(cell.time.clone());
            rows.push(row);
        }

        self.db
            .insert(cells[0].table_name(), &columns, rows)
            .await?;
        Ok(())
    }
}

/// Stringify a field value: absent/null becomes "", strings pass through,
/// anything else is JSON-serialized (best effort).
fn coerce(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[async_trait]
impl Storage for SqlStore {
    async fn save(&self, cells: Vec<DataCell>) -> Result<()> {
        for cell in cells {
            self.ensure_table(&cell).await?;

            let should_flush = {
                let buffer = self.buffer.lock().await;
                buffer.len() >= self.batch_size
            };
            if should_flush {
                if let Err(error) = self.flush().await {
                    tracing::error!(%error, "flush failed, batch dropped");
                }
            }

            self.buffer.lock().await.push(cell);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use super::*;

    struct FakeDb {
        creates: StdMutex<Vec<String>>,
        inserts: StdMutex<Vec<(String, Vec<Vec<String>>)>>,
    }

    impl FakeDb {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                creates: StdMutex::new(Vec::new()),
                inserts: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DbClient for FakeDb {
        async fn create_table(&self, spec: &TableSpec) -> Result<()> {
            self.creates.lock().unwrap().push(spec.table.clone());
            Ok(())
        }

        async fn insert(
            &self,
            table: &str,
            _columns: &[Column],
            rows: Vec<Vec<String>>,
        ) -> Result<()> {
            self.inserts
                .lock()
                .unwrap()
                .push((table.to_string(), rows));
            Ok(())
        }
    }

    struct FixedResolver;

    impl FieldResolver for FixedResolver {
        fn fields(&self, _task: &str, _rule: &str) -> Option<Vec<String>> {
            Some(vec!["title".to_string(), "score".to_string()])
        }
    }

    fn cell(n: u32) -> DataCell {
        let mut data = HashMap::new();
        data.insert(
            "title".to_string(),
            serde_json::Value::String(format!("book-{n}")),
        );
        data.insert("score".to_string(), serde_json::json!(n));
        DataCell {
            task: "book_list".to_string(),
            rule: "detail".to_string(),
            url: format!("https://books.example/{n}"),
            time: "2026-01-01T00:00:00Z".to_string(),
            data,
        }
    }

    async fn store_with(db: Arc<FakeDb>, batch_size: usize) -> SqlStore {
        SqlStore::builder()
            .db(db)
            .resolver(Arc::new(FixedResolver))
            .batch_size(batch_size)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn creates_table_once_per_name() {
        let db = FakeDb::new();
        let store = store_with(db.clone(), 10).await;

        store.save(vec![cell(1), cell(2), cell(3)]).await.unwrap();

        assert_eq!(*db.creates.lock().unwrap(), vec!["book_list".to_string()]);
    }

    #[tokio::test]
    async fn threshold_cell_starts_the_next_batch() {
        let db = FakeDb::new();
        let store = store_with(db.clone(), 2).await;

        for n in 0..3 {
            store.save(vec![cell(n)]).await.unwrap();
        }

        // The third cell trips the flush of the first two and then buffers
        // alone.
        let inserts = db.inserts.lock().unwrap();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].1.len(), 2);
        drop(inserts);

        store.flush().await.unwrap();
        let inserts = db.inserts.lock().unwrap();
        assert_eq!(inserts.len(), 2);
        assert_eq!(inserts[1].1.len(), 1);
    }

    #[tokio::test]
    async fn coerces_values_and_appends_url_time() {
        let db = FakeDb::new();
        let store = store_with(db.clone(), 10).await;

        let mut odd = cell(7);
        odd.data.remove("title");
        store.save(vec![odd]).await.unwrap();
        store.flush().await.unwrap();

        let inserts = db.inserts.lock().unwrap();
        let row = &inserts[0].1[0];
        assert_eq!(
            row,
            &vec![
                String::new(),
                "7".to_string(),
                "https://books.example/7".to_string(),
                "2026-01-01T00:00:00Z".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_a_noop() {
        let db = FakeDb::new();
        let store = store_with(db.clone(), 10).await;
        store.flush().await.unwrap();
        assert!(db.inserts.lock().unwrap().is_empty());
    }
}
