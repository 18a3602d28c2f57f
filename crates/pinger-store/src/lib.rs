//! Persistence for device registrations, contact bookkeeping and the host
//! heartbeat.
//!
//! Records are mapped to storage through static [`schema::Table`]
//! descriptions and reach a backend only through the [`store::Store`]
//! capability, which has a SQLite and an in-memory implementation.

pub mod devices;
pub mod error;
pub mod memory;
pub mod record;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use devices::{DeviceRegistry, PushTarget, Registration, run_blocking};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use record::{DeviceChange, DeviceContact, DeviceInfo, PingerInfo, Record};
pub use schema::SchemaError;
pub use sqlite::SqliteStore;
pub use store::Store;

/// Every table this crate persists.
pub const TABLES: [&schema::Table; 3] = [
    DeviceInfo::TABLE,
    DeviceContact::TABLE,
    PingerInfo::TABLE,
];

/// Check the static table maps against the record types. Call once at
/// startup; a failure means the build itself is inconsistent.
pub fn validate_schema() -> Result<(), SchemaError> {
    record::validate_record::<DeviceInfo>()?;
    record::validate_record::<DeviceContact>()?;
    record::validate_record::<PingerInfo>()?;
    Ok(())
}
