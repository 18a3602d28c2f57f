use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Storage kind of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Int,
    Bool,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Text => "TEXT",
            ColumnKind::Int | ColumnKind::Bool => "INTEGER",
        }
    }
}

/// One field-to-column mapping.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    /// Rust field name on the record type.
    pub field: &'static str,
    /// Column name in storage.
    pub name: &'static str,
    pub kind: ColumnKind,
    pub not_null: bool,
}

impl Column {
    pub const fn text(field: &'static str, name: &'static str) -> Self {
        Self {
            field,
            name,
            kind: ColumnKind::Text,
            not_null: true,
        }
    }

    pub const fn int(field: &'static str, name: &'static str) -> Self {
        Self {
            field,
            name,
            kind: ColumnKind::Int,
            not_null: true,
        }
    }

    pub const fn bool(field: &'static str, name: &'static str) -> Self {
        Self {
            field,
            name,
            kind: ColumnKind::Bool,
            not_null: true,
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.not_null = false;
        self
    }
}

/// Static description of a persisted record type.
#[derive(Debug)]
pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    /// Column names forming the logical key. Unique per row.
    pub key: &'static [&'static str],
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("table {table} has no columns")]
    NoColumns { table: &'static str },
    #[error("table {table} has no key")]
    NoKey { table: &'static str },
    #[error("table {table}: key column {column} does not exist")]
    UnknownKeyColumn {
        table: &'static str,
        column: &'static str,
    },
    #[error("table {table}: duplicate column or field {name}")]
    Duplicate {
        table: &'static str,
        name: &'static str,
    },
    #[error("table {table}: record does not write column {column}")]
    Unmapped {
        table: &'static str,
        column: &'static str,
    },
    #[error("table {table}: record writes unknown column {column}")]
    Unknown { table: &'static str, column: String },
}

impl Table {
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns { table: self.name });
        }
        if self.key.is_empty() {
            return Err(SchemaError::NoKey { table: self.name });
        }

        let mut names = HashSet::new();
        let mut fields = HashSet::new();
        for col in self.columns {
            if !names.insert(col.name) {
                return Err(SchemaError::Duplicate {
                    table: self.name,
                    name: col.name,
                });
            }
            if !fields.insert(col.field) {
                return Err(SchemaError::Duplicate {
                    table: self.name,
                    name: col.field,
                });
            }
        }
        for key in self.key {
            if !names.contains(key) {
                return Err(SchemaError::UnknownKeyColumn {
                    table: self.name,
                    column: *key,
                });
            }
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column mapped to a record field.
    pub fn column_for_field(&self, field: &str) -> Option<&'static Column> {
        self.columns.iter().find(|c| c.field == field)
    }

    pub fn is_key(&self, column: &str) -> bool {
        self.key.iter().any(|k| *k == column)
    }

    /// Equality filters selecting the row's logical key.
    pub fn key_filters(&self, row: &Row) -> Option<Vec<Filter>> {
        self.key
            .iter()
            .map(|k| row.get(k).map(|v| Filter::eq(*k, v.clone())))
            .collect()
    }

    pub fn create_sql(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let null = if c.not_null { " NOT NULL" } else { "" };
                format!("{} {}{}", c.name, c.kind.sql_type(), null)
            })
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, UNIQUE ({}))",
            self.name,
            cols.join(", "),
            self.key.join(", ")
        )
    }
}

/// A stored value. Timestamps are `Int` milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Untyped row keyed by column name.
pub type Row = BTreeMap<&'static str, Value>;

/// Equality predicate on one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: &'static str,
    pub value: Value,
}

impl Filter {
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        row.get(self.column) == Some(&self.value)
    }
}
