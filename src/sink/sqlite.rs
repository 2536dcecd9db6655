//! SQLite destination.
//!
//! Connections are pooled behind a semaphore and every statement runs on the
//! blocking pool, so a slow disk never stalls the async runtime. A batch is one
//! `BEGIN IMMEDIATE` transaction; rows are upserted one statement at a time so
//! a constraint failure can always be traced back to the row that caused it.

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, ToSql};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{ChunkOutcome, DataSink, SinkError, SinkTransaction};
use crate::pipeline::schema::{FieldKind, TableSchema};
use crate::types::{CleanRow, CleanValue};

const BOOTSTRAP_SQL: &str = include_str!("schema.sql");
const IN_MEMORY: &str = ":memory:";

impl ToSql for CleanValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            CleanValue::Null => ToSqlOutput::Owned(Value::Null),
            CleanValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            CleanValue::Float(x) => ToSqlOutput::Owned(Value::Real(*x)),
            CleanValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            // ISO text keeps date comparisons in CHECK constraints meaningful.
            CleanValue::Date(_) | CleanValue::Timestamp(_) => {
                ToSqlOutput::Owned(Value::Text(self.to_string()))
            }
        })
    }
}

pub struct SqliteSink {
    label: String,
    pool: Arc<ConnectionPool>,
}

impl SqliteSink {
    /// Open (creating if needed) the database file at `path`. The first
    /// connection is opened eagerly so a bad path fails here, not mid-run.
    pub fn open(
        path: impl AsRef<Path>,
        pool_size: usize,
        busy_timeout: Duration,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let in_memory = path.as_os_str() == IN_MEMORY;

        if !in_memory {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SinkError::Fatal(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }

        // Every in-memory connection is its own database, so keep exactly one.
        let size = if in_memory { 1 } else { pool_size.max(1) };
        let pool = Arc::new(ConnectionPool {
            path: path.clone(),
            busy_timeout,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
        });
        let first = pool.open()?;
        pool.release(first);

        info!(path = %path.display(), pool_size = size, "sqlite sink ready");
        Ok(Self {
            label: format!("sqlite:{}", path.display()),
            pool,
        })
    }

    pub fn in_memory() -> Result<Self, SinkError> {
        Self::open(IN_MEMORY, 1, Duration::from_millis(0))
    }

    /// Create every table of the fish-farm store if it does not exist yet.
    pub async fn bootstrap(&self) -> Result<(), SinkError> {
        let mut conn = self.pool.acquire().await?;
        conn.run(|c| c.execute_batch(BOOTSTRAP_SQL).map_err(|e| classify(e, None)))
            .await?;
        info!(sink = %self.label, "schema bootstrapped");
        Ok(())
    }
}

#[async_trait]
impl DataSink for SqliteSink {
    fn name(&self) -> &str {
        &self.label
    }

    async fn begin(&self) -> Result<Box<dyn SinkTransaction>, SinkError> {
        let mut conn = self.pool.acquire().await?;
        conn.run(|c| {
            c.execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| classify(e, None))
        })
        .await?;
        Ok(Box::new(SqliteTransaction { conn }))
    }
}

struct SqliteTransaction {
    conn: PooledConnection,
}

#[async_trait]
impl SinkTransaction for SqliteTransaction {
    async fn upsert_chunk(
        &mut self,
        schema: &TableSchema,
        rows: &[CleanRow],
    ) -> Result<ChunkOutcome, SinkError> {
        let schema = schema.clone();
        let rows = rows.to_vec();
        self.conn
            .run(move |c| upsert_rows(c, &schema, &rows))
            .await
    }

    async fn commit(mut self: Box<Self>) -> Result<(), SinkError> {
        self.conn
            .run(|c| c.execute_batch("COMMIT").map_err(|e| classify(e, None)))
            .await
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), SinkError> {
        self.conn
            .run(|c| c.execute_batch("ROLLBACK").map_err(|e| classify(e, None)))
            .await
    }
}

struct ConnectionPool {
    path: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

impl ConnectionPool {
    async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, SinkError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SinkError::Fatal("connection pool closed".to_string()))?;

        let idle = self
            .idle
            .lock()
            .map_err(|_| SinkError::Fatal("connection pool poisoned".to_string()))?
            .pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.open()?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    fn open(&self) -> Result<Connection, SinkError> {
        let conn = Connection::open(&self.path).map_err(|e| classify(e, None))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| classify(e, None))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;
            "#,
        )
        .map_err(|e| classify(e, None))?;
        debug!(path = %self.path.display(), "opened sqlite connection");
        Ok(conn)
    }

    /// Return a connection to the idle list. A connection still inside a
    /// transaction (the caller bailed out early) is rolled back first.
    fn release(&self, conn: Connection) {
        if !conn.is_autocommit() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "dropping connection that could not roll back");
                return;
            }
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }
}

struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    async fn run<T, F>(&mut self, work: F) -> Result<T, SinkError>
    where
        F: FnOnce(&Connection) -> Result<T, SinkError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| SinkError::Fatal("connection lost by an earlier failure".to_string()))?;

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = work(&conn);
            (conn, result)
        })
        .await
        .map_err(|e| SinkError::Fatal(format!("database task failed: {e}")))?;

        self.conn = Some(conn);
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// SQL for one table, built once per chunk from the schema descriptor.
/// Identifiers were checked by `TableSchema::validate`.
struct UpsertStatements {
    lookup: String,
    update: Option<String>,
    insert: String,
    key_fields: Vec<String>,
    other_fields: Vec<String>,
}

impl UpsertStatements {
    fn build(schema: &TableSchema) -> Self {
        let key_fields: Vec<String> = schema.key_fields().map(|f| f.name.clone()).collect();
        let other_fields: Vec<String> = schema.non_key_fields().map(|f| f.name.clone()).collect();
        let column = |name: &String| {
            schema
                .field(name)
                .map(|f| f.column_name().to_string())
                .unwrap_or_else(|| name.clone())
        };

        // `IS` instead of `=` so an absent optional key part matches NULL.
        let predicate = key_fields
            .iter()
            .enumerate()
            .map(|(i, f)| format!("{} IS ?{}", column(f), i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let lookup = format!(
            "SELECT rowid FROM {} WHERE {} LIMIT 1",
            schema.table, predicate
        );

        let update = (!other_fields.is_empty()).then(|| {
            let assignments = other_fields
                .iter()
                .enumerate()
                .map(|(i, f)| format!("{} = ?{}", column(f), i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "UPDATE {} SET {} WHERE rowid = ?{}",
                schema.table,
                assignments,
                other_fields.len() + 1
            )
        });

        let all: Vec<String> = key_fields.iter().chain(&other_fields).map(column).collect();
        let placeholders = (1..=all.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            schema.table,
            all.join(", "),
            placeholders
        );

        Self {
            lookup,
            update,
            insert,
            key_fields,
            other_fields,
        }
    }
}

fn upsert_rows(
    conn: &Connection,
    schema: &TableSchema,
    rows: &[CleanRow],
) -> Result<ChunkOutcome, SinkError> {
    let sql = UpsertStatements::build(schema);
    let mut outcome = ChunkOutcome::default();

    for row in rows {
        let row = resolve_references(conn, schema, row)?;
        let at = Some(row.source_index);

        let key: Vec<&CleanValue> = sql.key_fields.iter().map(|f| row.get(f)).collect();
        let existing: Option<i64> = conn
            .prepare_cached(&sql.lookup)
            .and_then(|mut stmt| {
                stmt.query_row(params_from_iter(key.iter()), |r| r.get(0))
                    .optional()
            })
            .map_err(|e| classify(e, at))?;

        match existing {
            Some(rowid) => {
                if let Some(update) = &sql.update {
                    let mut values: Vec<CleanValue> =
                        sql.other_fields.iter().map(|f| row.get(f).clone()).collect();
                    values.push(CleanValue::Integer(rowid));
                    conn.prepare_cached(update)
                        .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())))
                        .map_err(|e| classify(e, at))?;
                }
                outcome.updated += 1;
            }
            None => {
                let values: Vec<&CleanValue> = sql
                    .key_fields
                    .iter()
                    .chain(&sql.other_fields)
                    .map(|f| row.get(f))
                    .collect();
                conn.prepare_cached(&sql.insert)
                    .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())))
                    .map_err(|e| classify(e, at))?;
                outcome.inserted += 1;
            }
        }
    }

    debug!(
        table = %schema.table,
        inserted = outcome.inserted,
        updated = outcome.updated,
        "chunk applied"
    );
    Ok(outcome)
}

/// Swap every reference business key (e.g. a pond name) for the referenced
/// row's id. A key with no matching row is reported as a constraint failure
/// naming the reference.
fn resolve_references(
    conn: &Connection,
    schema: &TableSchema,
    row: &CleanRow,
) -> Result<CleanRow, SinkError> {
    let mut resolved = row.clone();

    for field in &schema.fields {
        let FieldKind::Reference { table, column } = &field.kind else {
            continue;
        };
        let CleanValue::Text(business_key) = row.get(&field.name) else {
            continue;
        };

        let lookup = format!("SELECT rowid FROM {table} WHERE {column} = ?1 COLLATE NOCASE LIMIT 1");
        let id: Option<i64> = conn
            .prepare_cached(&lookup)
            .and_then(|mut stmt| stmt.query_row(params![business_key], |r| r.get(0)).optional())
            .map_err(|e| classify(e, Some(row.source_index)))?;

        match id {
            Some(id) => {
                resolved
                    .values
                    .insert(field.name.clone(), CleanValue::Integer(id));
            }
            None => {
                return Err(SinkError::Constraint {
                    row_index: Some(row.source_index),
                    constraint: format!(
                        "{}.{} -> {}.{}",
                        schema.table,
                        field.column_name(),
                        table,
                        column
                    ),
                    message: format!(
                        "row {} references {} '{}' which does not exist",
                        row.source_index, table, business_key
                    ),
                });
            }
        }
    }

    Ok(resolved)
}

fn classify(err: rusqlite::Error, row_index: Option<usize>) -> SinkError {
    match &err {
        rusqlite::Error::SqliteFailure(code, detail) => match code.code {
            ErrorCode::ConstraintViolation => SinkError::Constraint {
                row_index,
                constraint: detail.clone().unwrap_or_else(|| code.to_string()),
                message: match row_index {
                    Some(i) => format!("row {i}: {err}"),
                    None => err.to_string(),
                },
            },
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen => {
                SinkError::Transient(err.to_string())
            }
            _ => SinkError::Fatal(err.to_string()),
        },
        _ => SinkError::Fatal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::schema::FieldSchema;
    use chrono::NaiveDate;

    fn pond_schema() -> TableSchema {
        TableSchema::new(
            "pond",
            vec![
                FieldSchema::text("name").required(),
                FieldSchema::integer("capacity", Some(1), None),
                FieldSchema::enumeration("status", &["occupied", "emptied"]),
            ],
            &["name"],
        )
    }

    fn pond(index: usize, name: &str, capacity: i64) -> CleanRow {
        CleanRow::new(index)
            .with("name", CleanValue::Text(name.into()))
            .with("capacity", CleanValue::Integer(capacity))
            .with("status", CleanValue::Text("occupied".into()))
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let sink = SqliteSink::in_memory().unwrap();
        sink.bootstrap().await.unwrap();

        let rows = vec![pond(0, "Pond A", 500), pond(1, "Pond B", 800)];
        let mut tx = sink.begin().await.unwrap();
        let first = tx.upsert_chunk(&pond_schema(), &rows).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(first, ChunkOutcome { inserted: 2, updated: 0 });

        let mut tx = sink.begin().await.unwrap();
        let second = tx.upsert_chunk(&pond_schema(), &rows).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(second, ChunkOutcome { inserted: 0, updated: 2 });
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let sink = SqliteSink::in_memory().unwrap();
        sink.bootstrap().await.unwrap();

        let mut tx = sink.begin().await.unwrap();
        tx.upsert_chunk(&pond_schema(), &[pond(0, "Pond A", 500)])
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let mut tx = sink.begin().await.unwrap();
        let again = tx
            .upsert_chunk(&pond_schema(), &[pond(0, "Pond A", 500)])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(again.inserted, 1);
    }

    #[tokio::test]
    async fn test_check_constraint_names_the_row() {
        let sink = SqliteSink::in_memory().unwrap();
        sink.bootstrap().await.unwrap();

        let mut tx = sink.begin().await.unwrap();
        let err = tx
            .upsert_chunk(&pond_schema(), &[pond(0, "Pond A", 10), pond(7, "Pond Z", 0)])
            .await
            .unwrap_err();
        tx.rollback().await.unwrap();

        match err {
            SinkError::Constraint {
                row_index,
                constraint,
                ..
            } => {
                assert_eq!(row_index, Some(7));
                assert!(constraint.contains("CHECK"), "{constraint}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_reference_is_a_constraint_failure() {
        let sink = SqliteSink::in_memory().unwrap();
        sink.bootstrap().await.unwrap();

        let schema = TableSchema::new(
            "water_record",
            vec![
                FieldSchema::reference("pond", "pond", "name").required(),
                FieldSchema::timestamp("record_timestamp").required(),
                FieldSchema::decimal("ph", Some(5.0), Some(10.0)),
            ],
            &["pond", "record_timestamp"],
        );
        let row = CleanRow::new(3)
            .with("pond", CleanValue::Text("Nowhere".into()))
            .with(
                "record_timestamp",
                CleanValue::Timestamp(
                    NaiveDate::from_ymd_opt(2024, 1, 1)
                        .unwrap()
                        .and_hms_opt(8, 0, 0)
                        .unwrap(),
                ),
            )
            .with("ph", CleanValue::Float(7.2));

        let mut tx = sink.begin().await.unwrap();
        let err = tx.upsert_chunk(&schema, &[row]).await.unwrap_err();
        tx.rollback().await.unwrap();

        assert_eq!(
            err,
            SinkError::Constraint {
                row_index: Some(3),
                constraint: "water_record.pond_id -> pond.name".into(),
                message: "row 3 references pond 'Nowhere' which does not exist".into(),
            }
        );
    }

    #[test]
    fn test_statements_use_null_safe_key_match() {
        let schema = TableSchema::new(
            "daily_record",
            vec![
                FieldSchema::reference("pond", "pond", "name").required(),
                FieldSchema::reference("batch", "batch", "name"),
                FieldSchema::date("record_date").required(),
                FieldSchema::integer("mortality", Some(0), None),
            ],
            &["pond", "batch", "record_date"],
        );
        let sql = UpsertStatements::build(&schema);
        assert_eq!(
            sql.lookup,
            "SELECT rowid FROM daily_record WHERE pond_id IS ?1 AND batch_id IS ?2 AND record_date IS ?3 LIMIT 1"
        );
        assert_eq!(
            sql.update.as_deref(),
            Some("UPDATE daily_record SET mortality = ?1 WHERE rowid = ?2")
        );
        assert_eq!(
            sql.insert,
            "INSERT INTO daily_record (pond_id, batch_id, record_date, mortality) VALUES (?1, ?2, ?3, ?4)"
        );
    }
}
