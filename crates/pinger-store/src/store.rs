use crate::error::StoreError;
use crate::schema::{Filter, Row, Table};

/// Untyped persistence capability. Typed access goes through
/// [`crate::record`] helpers.
///
/// Implementations are synchronous; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait Store: Send + Sync {
    /// Rows matching every filter. An empty filter list returns all rows.
    fn search(&self, table: &'static Table, filters: &[Filter]) -> Result<Vec<Row>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] when the logical key is taken.
    fn insert(&self, table: &'static Table, row: &Row) -> Result<(), StoreError>;

    /// Overwrite the non-key columns of the row with the same logical key.
    /// Returns the number of rows affected.
    fn update(&self, table: &'static Table, row: &Row) -> Result<u64, StoreError>;

    fn delete(&self, table: &'static Table, key: &[Filter]) -> Result<u64, StoreError>;

    /// The single row matching `key`, if any.
    fn get(&self, table: &'static Table, key: &[Filter]) -> Result<Option<Row>, StoreError> {
        let mut rows = self.search(table, key)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            count => Err(StoreError::Ambiguous {
                table: table.name,
                count,
            }),
        }
    }
}

/// Key filters of `row`, or the first missing key column.
pub(crate) fn require_key(table: &'static Table, row: &Row) -> Result<Vec<Filter>, StoreError> {
    table.key_filters(row).ok_or_else(|| StoreError::MissingKey {
        table: table.name,
        column: table
            .key
            .iter()
            .copied()
            .find(|k| !row.contains_key(k))
            .unwrap_or_default(),
    })
}

/// Fails unless `key` constrains every key column of `table`.
pub(crate) fn check_full_key(table: &'static Table, key: &[Filter]) -> Result<(), StoreError> {
    match table
        .key
        .iter()
        .find(|k| !key.iter().any(|f| f.column == **k))
    {
        Some(missing) => Err(StoreError::MissingKey {
            table: table.name,
            column: *missing,
        }),
        None => Ok(()),
    }
}
