use crate::error::StoreError;
use crate::schema::{ColumnKind, Filter, Row, Table, Value};
use crate::store::{Store, check_full_key, require_key};
use rusqlite::types::{ToSql, ToSqlOutput};
use rusqlite::{Connection, ErrorCode, params_from_iter};
use std::path::Path;
use std::sync::Mutex as StdMutex;

/// SQLite-backed store. Tables are created from the static maps on open.
pub struct SqliteStore {
    conn: StdMutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "opened sqlite store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // Readers must not block the heartbeat writer
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        for table in crate::TABLES {
            conn.execute(&table.create_sql(), [])?;
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.name), [], |row| {
                    row.get(0)
                })?;
            if count > 0 {
                tracing::info!(table = table.name, count, "loaded table from disk");
            }
        }

        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Int(i) => ToSqlOutput::from(*i),
            Value::Bool(b) => ToSqlOutput::from(*b),
        })
    }
}

/// `a = ?1 AND b = ?2`, numbering from `first`.
fn where_clause(filters: &[Filter], first: usize) -> String {
    filters
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{} = ?{}", f.column, first + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Column names are only ever taken from the static maps, never from input.
fn check_columns(table: &'static Table, filters: &[Filter]) -> Result<(), StoreError> {
    match filters.iter().find(|f| table.column(f.column).is_none()) {
        Some(f) => Err(StoreError::BadColumn {
            table: table.name,
            column: f.column,
        }),
        None => Ok(()),
    }
}

fn read_row(table: &'static Table, row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    let mut out = Row::new();
    for (i, col) in table.columns.iter().enumerate() {
        let value = match col.kind {
            ColumnKind::Text => row.get::<_, Option<String>>(i)?.map(Value::Text),
            ColumnKind::Int => row.get::<_, Option<i64>>(i)?.map(Value::Int),
            ColumnKind::Bool => row.get::<_, Option<bool>>(i)?.map(Value::Bool),
        };
        if let Some(value) = value {
            out.insert(col.name, value);
        }
    }
    Ok(out)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

impl Store for SqliteStore {
    fn search(&self, table: &'static Table, filters: &[Filter]) -> Result<Vec<Row>, StoreError> {
        check_columns(table, filters)?;
        let columns: Vec<&str> = table.columns.iter().map(|c| c.name).collect();
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), table.name);
        if !filters.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause(filters, 1));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(filters.iter().map(|f| &f.value)), |row| {
                read_row(table, row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert(&self, table: &'static Table, row: &Row) -> Result<(), StoreError> {
        require_key(table, row)?;
        let (names, values): (Vec<&str>, Vec<&Value>) = table
            .columns
            .iter()
            .filter_map(|c| row.get(c.name).map(|v| (c.name, v)))
            .unzip();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.name,
            names.join(", "),
            placeholders.join(", ")
        );

        let conn = self.lock()?;
        match conn.execute(&sql, params_from_iter(values)) {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::AlreadyExists { table: table.name })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, table: &'static Table, row: &Row) -> Result<u64, StoreError> {
        let key = require_key(table, row)?;
        let (names, mut values): (Vec<&str>, Vec<&Value>) = table
            .columns
            .iter()
            .filter(|c| !table.is_key(c.name))
            .filter_map(|c| row.get(c.name).map(|v| (c.name, v)))
            .unzip();
        if names.is_empty() {
            return Ok(0);
        }
        let set: Vec<String> = names
            .iter()
            .enumerate()
            .map(|(i, n)| format!("{n} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            table.name,
            set.join(", "),
            where_clause(&key, names.len() + 1)
        );
        values.extend(key.iter().map(|f| &f.value));

        let conn = self.lock()?;
        let n = conn.execute(&sql, params_from_iter(values))?;
        Ok(n as u64)
    }

    fn delete(&self, table: &'static Table, key: &[Filter]) -> Result<u64, StoreError> {
        check_full_key(table, key)?;
        check_columns(table, key)?;
        let sql = format!("DELETE FROM {} WHERE {}", table.name, where_clause(key, 1));

        let conn = self.lock()?;
        let n = conn.execute(&sql, params_from_iter(key.iter().map(|f| &f.value)))?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeviceInfo, PingerInfo, Record, get_record, insert_record};

    fn device(id: &str) -> DeviceInfo {
        DeviceInfo {
            client_id: "C1".to_string(),
            client_context: "ctx1".to_string(),
            device_id: id.to_string(),
            platform: "ios".to_string(),
            push_token: "tok".to_string(),
            push_service: "APNS".to_string(),
            pinger: "host-a".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        insert_record(&store, &device("D1")).unwrap();
        let err = insert_record(&store, &device("D1")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { table: "device_info" }));
        insert_record(&store, &device("D2")).unwrap();
        assert_eq!(store.search(DeviceInfo::TABLE, &[]).unwrap().len(), 2);
    }

    #[test]
    fn update_and_delete_report_rows_affected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut di = device("D1");
        assert_eq!(store.update(DeviceInfo::TABLE, &di.to_row()).unwrap(), 0);

        insert_record(&store, &di).unwrap();
        di.endpoint_arn = "arn:1".to_string();
        di.enabled = true;
        assert_eq!(store.update(DeviceInfo::TABLE, &di.to_row()).unwrap(), 1);

        let back: DeviceInfo = get_record(&store, &di.key()).unwrap().unwrap();
        assert_eq!(back, di);

        assert_eq!(store.delete(DeviceInfo::TABLE, &di.key()).unwrap(), 1);
        assert_eq!(store.delete(DeviceInfo::TABLE, &di.key()).unwrap(), 0);
    }

    #[test]
    fn delete_requires_full_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .delete(DeviceInfo::TABLE, &[Filter::eq("client_id", "C1")])
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingKey { .. }));
    }

    #[test]
    fn unknown_filter_column_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .search(PingerInfo::TABLE, &[Filter::eq("nope", "x")])
            .unwrap_err();
        assert!(matches!(err, StoreError::BadColumn { column: "nope", .. }));
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinger.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let hb = PingerInfo {
                pinger: "host-a".to_string(),
                created: 1,
                updated: 2,
            };
            insert_record(&store, &hb).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let hb: PingerInfo = get_record(&store, &[Filter::eq("pinger", "host-a")])
            .unwrap()
            .unwrap();
        assert_eq!(hb.updated, 2);
    }
}
