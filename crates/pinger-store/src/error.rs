/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{table} record already exists")]
    AlreadyExists { table: &'static str },

    #[error("more than one {table} record matched ({count})")]
    Ambiguous { table: &'static str, count: usize },

    #[error("{table} row is missing key column {column}")]
    MissingKey {
        table: &'static str,
        column: &'static str,
    },

    #[error("{table}.{column}: missing or mistyped value")]
    BadColumn {
        table: &'static str,
        column: &'static str,
    },

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store task failed: {0}")]
    Task(String),
}
