//! Low-level statement building and execution against MySQL.
//!
//! Tables are created on the fly from rule field lists, so statements are
//! assembled as strings rather than compile-time checked queries. Values are
//! always bound, never interpolated.

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};

use crate::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: String,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }
}

/// Everything needed to create a destination table.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub table: String,
    pub columns: Vec<Column>,
    /// Add an auto-increment integer primary key.
    pub auto_key: bool,
    pub engine: String,
    pub charset: String,
}

pub fn create_table_sql(spec: &TableSpec) -> Result<String> {
    if spec.columns.is_empty() {
        return Err(StorageError::EmptyColumns(spec.table.clone()));
    }

    let mut sql = format!("CREATE TABLE IF NOT EXISTS `{}` (", spec.table);
    if spec.auto_key {
        sql.push_str("id INT NOT NULL PRIMARY KEY AUTO_INCREMENT,");
    }
    for column in &spec.columns {
        sql.push_str(&format!("`{}` {},", column.name, column.ty));
    }
    sql.pop();
    sql.push_str(&format!(
        ") ENGINE={} DEFAULT CHARSET={};",
        spec.engine, spec.charset
    ));
    Ok(sql)
}

pub fn insert_sql(table: &str, columns: &[Column], row_count: usize) -> Result<String> {
    if columns.is_empty() {
        return Err(StorageError::EmptyColumns(table.to_string()));
    }

    let column_list = columns
        .iter()
        .map(|c| format!("`{}`", c.name))
        .collect::<Vec<_>>()
        .join(",");
    let placeholders = format!("({})", vec!["?"; columns.len()].join(","));
    let rows = vec![placeholders; row_count].join(",");
    Ok(format!(
        "INSERT INTO `{table}`({column_list}) VALUES {rows};"
    ))
}

/// Narrow database interface so the sink can be tested without a server.
#[async_trait]
pub trait DbClient: Send + Sync {
    async fn create_table(&self, spec: &TableSpec) -> Result<()>;
    async fn insert(&self, table: &str, columns: &[Column], rows: Vec<Vec<String>>) -> Result<()>;
}

/// MySQL-backed [`DbClient`] over an sqlx connection pool.
pub struct SqlDb {
    pool: MySqlPool,
}

impl SqlDb {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(32)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DbClient for SqlDb {
    async fn create_table(&self, spec: &TableSpec) -> Result<()> {
        let sql = create_table_sql(spec)?;
        tracing::debug!(sql = %sql, "create table");
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, table: &str, columns: &[Column], rows: Vec<Vec<String>>) -> Result<()> {
        let sql = insert_sql(table, columns, rows.len())?;
        tracing::debug!(sql = %sql, rows = rows.len(), "insert");
        let mut query = sqlx::query(&sql);
        for row in &rows {
            for value in row {
                query = query.bind(value.as_str());
            }
        }
        query.execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("title", "MEDIUMTEXT"),
            Column::new("Url", "VARCHAR(255)"),
            Column::new("Time", "VARCHAR(255)"),
        ]
    }

    #[test]
    fn create_table_statement() {
        let spec = TableSpec {
            table: "book_list".to_string(),
            columns: columns(),
            auto_key: true,
            engine: "MyISAM".to_string(),
            charset: "utf8".to_string(),
        };
        assert_eq!(
            create_table_sql(&spec).unwrap(),
            "CREATE TABLE IF NOT EXISTS `book_list` (\
             id INT NOT NULL PRIMARY KEY AUTO_INCREMENT,\
             `title` MEDIUMTEXT,`Url` VARCHAR(255),`Time` VARCHAR(255)\
             ) ENGINE=MyISAM DEFAULT CHARSET=utf8;"
        );
    }

    #[test]
    fn create_table_rejects_empty_columns() {
        let spec = TableSpec {
            table: "empty".to_string(),
            columns: vec![],
            auto_key: false,
            engine: "InnoDB".to_string(),
            charset: "utf8mb4".to_string(),
        };
        assert!(matches!(
            create_table_sql(&spec),
            Err(StorageError::EmptyColumns(_))
        ));
    }

    #[test]
    fn insert_statement_repeats_row_groups() {
        let sql = insert_sql("book_list", &columns(), 2).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `book_list`(`title`,`Url`,`Time`) VALUES (?,?,?),(?,?,?);"
        );
    }
}
