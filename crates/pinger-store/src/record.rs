use crate::error::StoreError;
use crate::schema::{Column, Filter, Row, SchemaError, Table, Value};
use crate::store::Store;
use pinger::mail_info::{MailPingInformation, SessionKey};
use pinger_crypto::time::now_ms;

/// A typed record with a static table map.
pub trait Record: Sized {
    const TABLE: &'static Table;

    fn to_row(&self) -> Row;

    fn from_row(row: &Row) -> Result<Self, StoreError>;

    /// Filters selecting this record by its logical key.
    fn key(&self) -> Vec<Filter> {
        Self::TABLE.key_filters(&self.to_row()).unwrap_or_default()
    }
}

/// Check a record's table map and that `to_row` writes exactly its columns.
pub fn validate_record<R: Record + Default>() -> Result<(), SchemaError> {
    let table = R::TABLE;
    table.validate()?;
    let row = R::default().to_row();
    for col in table.columns {
        if !row.contains_key(col.name) {
            return Err(SchemaError::Unmapped {
                table: table.name,
                column: col.name,
            });
        }
    }
    if let Some(extra) = row.keys().find(|k| table.column(k).is_none()) {
        return Err(SchemaError::Unknown {
            table: table.name,
            column: extra.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Typed helpers over `Store`
// ---------------------------------------------------------------------------

pub fn get_record<R: Record>(store: &dyn Store, key: &[Filter]) -> Result<Option<R>, StoreError> {
    store
        .get(R::TABLE, key)?
        .map(|row| R::from_row(&row))
        .transpose()
}

pub fn insert_record<R: Record>(store: &dyn Store, record: &R) -> Result<(), StoreError> {
    store.insert(R::TABLE, &record.to_row())
}

pub fn update_record<R: Record>(store: &dyn Store, record: &R) -> Result<u64, StoreError> {
    store.update(R::TABLE, &record.to_row())
}

pub fn delete_record<R: Record>(store: &dyn Store, record: &R) -> Result<u64, StoreError> {
    store.delete(R::TABLE, &record.key())
}

pub fn search_records<R: Record>(
    store: &dyn Store,
    filters: &[Filter],
) -> Result<Vec<R>, StoreError> {
    store
        .search(R::TABLE, filters)?
        .iter()
        .map(R::from_row)
        .collect()
}

/// Key filters for the (client, context, device) tables.
pub fn device_key(key: &SessionKey) -> Vec<Filter> {
    vec![
        Filter::eq("client_id", key.client_id.as_str()),
        Filter::eq("client_context", key.client_context.as_str()),
        Filter::eq("device_id", key.device_id.as_str()),
    ]
}

// ---------------------------------------------------------------------------
// Field-to-column plumbing
// ---------------------------------------------------------------------------

struct RowWriter {
    table: &'static Table,
    row: Row,
}

impl RowWriter {
    fn new(table: &'static Table) -> Self {
        Self {
            table,
            row: Row::new(),
        }
    }

    fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        if let Some(col) = self.table.column_for_field(field) {
            self.row.insert(col.name, value.into());
        }
        self
    }

    fn text(self, field: &str, value: &str) -> Self {
        self.set(field, value)
    }

    fn time(self, field: &str, ms: u64) -> Self {
        self.set(field, ms as i64)
    }

    fn finish(self) -> Row {
        self.row
    }
}

struct RowReader<'a> {
    table: &'static Table,
    row: &'a Row,
}

impl<'a> RowReader<'a> {
    fn new(table: &'static Table, row: &'a Row) -> Self {
        Self { table, row }
    }

    fn value(&self, field: &'static str) -> Result<Option<&'a Value>, StoreError> {
        let col = self
            .table
            .column_for_field(field)
            .ok_or(StoreError::BadColumn {
                table: self.table.name,
                column: field,
            })?;
        match self.row.get(col.name) {
            Some(v) => Ok(Some(v)),
            None if col.not_null => Err(StoreError::BadColumn {
                table: self.table.name,
                column: col.name,
            }),
            None => Ok(None),
        }
    }

    fn bad(&self, field: &'static str) -> StoreError {
        StoreError::BadColumn {
            table: self.table.name,
            column: field,
        }
    }

    fn text(&self, field: &'static str) -> Result<String, StoreError> {
        match self.value(field)? {
            None => Ok(String::new()),
            Some(v) => v
                .as_text()
                .map(str::to_string)
                .ok_or_else(|| self.bad(field)),
        }
    }

    fn time(&self, field: &'static str) -> Result<u64, StoreError> {
        match self.value(field)? {
            None => Ok(0),
            Some(v) => v
                .as_int()
                .map(|i| i.max(0) as u64)
                .ok_or_else(|| self.bad(field)),
        }
    }

    fn bool(&self, field: &'static str) -> Result<bool, StoreError> {
        match self.value(field)? {
            None => Ok(false),
            Some(v) => v.as_bool().ok_or_else(|| self.bad(field)),
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceInfo
// ---------------------------------------------------------------------------

const PLATFORMS: [&str; 2] = ["ios", "android"];

static DEVICE_INFO_COLUMNS: [Column; 16] = [
    Column::int("created", "created"),
    Column::int("updated", "updated"),
    Column::int("last_contact", "last_contact"),
    Column::int("last_contact_request", "last_contact_request"),
    Column::text("client_id", "client_id"),
    Column::text("client_context", "client_context"),
    Column::text("device_id", "device_id"),
    Column::text("platform", "device_platform"),
    Column::text("push_token", "push_token"),
    Column::text("push_service", "push_service"),
    Column::text("os_version", "os_version").nullable(),
    Column::text("app_build_version", "build_version").nullable(),
    Column::text("app_build_number", "build_number").nullable(),
    Column::text("endpoint_arn", "aws_endpoint_arn").nullable(),
    Column::bool("enabled", "enabled"),
    Column::text("pinger", "pinger"),
];

static DEVICE_INFO_TABLE: Table = Table {
    name: "device_info",
    columns: &DEVICE_INFO_COLUMNS,
    key: &["client_id", "client_context", "device_id"],
};

/// Durable identity of a registered (client, context, device).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub created: u64,
    pub updated: u64,
    pub last_contact: u64,
    pub last_contact_request: u64,
    pub client_id: String,
    pub client_context: String,
    pub device_id: String,
    pub platform: String,
    pub push_token: String,
    pub push_service: String,
    pub os_version: String,
    pub app_build_version: String,
    pub app_build_number: String,
    /// Gateway-side endpoint, empty until registered.
    pub endpoint_arn: String,
    pub enabled: bool,
    /// Host id of the owning backend.
    pub pinger: String,
}

/// What `DeviceInfo::update_from` changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceChange {
    pub changed: bool,
    /// Push service or token changed; the endpoint must be re-registered.
    pub push_changed: bool,
}

impl DeviceInfo {
    pub fn new(info: &MailPingInformation, pinger: &str) -> Result<Self, StoreError> {
        let now = now_ms();
        let di = Self {
            created: now,
            updated: now,
            client_id: info.client_id.clone(),
            client_context: info.client_context.clone(),
            device_id: info.device_id.clone(),
            platform: info.platform.to_ascii_lowercase(),
            push_token: info.push_token.clone(),
            push_service: info.push_service.clone(),
            os_version: info.os_version.clone(),
            app_build_version: info.app_build_version.clone(),
            app_build_number: info.app_build_number.clone(),
            pinger: pinger.to_string(),
            ..Default::default()
        };
        di.validate()?;
        Ok(di)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        let required = [
            ("client_id", &self.client_id),
            ("client_context", &self.client_context),
            ("device_id", &self.device_id),
            ("platform", &self.platform),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| v.is_empty()) {
            return Err(StoreError::Invalid(format!("{name} can not be empty")));
        }
        if !PLATFORMS.contains(&self.platform.as_str()) {
            return Err(StoreError::Invalid(format!(
                "platform must be one of ios or android, got {}",
                self.platform
            )));
        }
        Ok(())
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.client_id, &self.client_context, &self.device_id)
    }

    /// Re-apply registration fields. A new push service invalidates the
    /// token and endpoint; a new token invalidates the endpoint.
    pub fn update_from(&mut self, info: &MailPingInformation) -> DeviceChange {
        let mut change = DeviceChange::default();

        if self.push_service != info.push_service {
            self.push_service = info.push_service.clone();
            self.push_token.clear();
            self.endpoint_arn.clear();
            change.push_changed = true;
        }
        if self.push_token != info.push_token {
            self.push_token = info.push_token.clone();
            self.endpoint_arn.clear();
            change.push_changed = true;
        }
        if change.push_changed {
            self.enabled = false;
        }

        let platform = info.platform.to_ascii_lowercase();
        let mut changed = change.push_changed;
        for (current, new) in [
            (&mut self.platform, &platform),
            (&mut self.os_version, &info.os_version),
            (&mut self.app_build_version, &info.app_build_version),
            (&mut self.app_build_number, &info.app_build_number),
        ] {
            if current != new {
                current.clone_from(new);
                changed = true;
            }
        }
        change.changed = changed;
        change
    }
}

impl Record for DeviceInfo {
    const TABLE: &'static Table = &DEVICE_INFO_TABLE;

    fn to_row(&self) -> Row {
        RowWriter::new(Self::TABLE)
            .time("created", self.created)
            .time("updated", self.updated)
            .time("last_contact", self.last_contact)
            .time("last_contact_request", self.last_contact_request)
            .text("client_id", &self.client_id)
            .text("client_context", &self.client_context)
            .text("device_id", &self.device_id)
            .text("platform", &self.platform)
            .text("push_token", &self.push_token)
            .text("push_service", &self.push_service)
            .text("os_version", &self.os_version)
            .text("app_build_version", &self.app_build_version)
            .text("app_build_number", &self.app_build_number)
            .text("endpoint_arn", &self.endpoint_arn)
            .set("enabled", self.enabled)
            .text("pinger", &self.pinger)
            .finish()
    }

    fn from_row(row: &Row) -> Result<Self, StoreError> {
        let r = RowReader::new(Self::TABLE, row);
        Ok(Self {
            created: r.time("created")?,
            updated: r.time("updated")?,
            last_contact: r.time("last_contact")?,
            last_contact_request: r.time("last_contact_request")?,
            client_id: r.text("client_id")?,
            client_context: r.text("client_context")?,
            device_id: r.text("device_id")?,
            platform: r.text("platform")?,
            push_token: r.text("push_token")?,
            push_service: r.text("push_service")?,
            os_version: r.text("os_version")?,
            app_build_version: r.text("app_build_version")?,
            app_build_number: r.text("app_build_number")?,
            endpoint_arn: r.text("endpoint_arn")?,
            enabled: r.bool("enabled")?,
            pinger: r.text("pinger")?,
        })
    }
}

// ---------------------------------------------------------------------------
// DeviceContact
// ---------------------------------------------------------------------------

static DEVICE_CONTACT_COLUMNS: [Column; 10] = [
    Column::int("created", "created"),
    Column::int("updated", "updated"),
    Column::int("last_contact", "last_contact"),
    Column::int("last_contact_request", "last_contact_request"),
    Column::text("client_id", "client_id"),
    Column::text("client_context", "client_context"),
    Column::text("device_id", "device_id"),
    Column::text("push_token", "push_token"),
    Column::text("push_service", "push_service"),
    Column::text("pinger", "pinger"),
];

static DEVICE_CONTACT_TABLE: Table = Table {
    name: "device_contact",
    columns: &DEVICE_CONTACT_COLUMNS,
    key: &["client_id", "client_context", "device_id"],
};

/// When a device last reached us and when we last tried to reach it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceContact {
    pub created: u64,
    pub updated: u64,
    pub last_contact: u64,
    pub last_contact_request: u64,
    pub client_id: String,
    pub client_context: String,
    pub device_id: String,
    pub push_token: String,
    pub push_service: String,
    pub pinger: String,
}

impl DeviceContact {
    pub fn for_device(di: &DeviceInfo) -> Self {
        let now = now_ms();
        Self {
            created: now,
            updated: now,
            last_contact: now,
            last_contact_request: 0,
            client_id: di.client_id.clone(),
            client_context: di.client_context.clone(),
            device_id: di.device_id.clone(),
            push_token: di.push_token.clone(),
            push_service: di.push_service.clone(),
            pinger: di.pinger.clone(),
        }
    }
}

impl Record for DeviceContact {
    const TABLE: &'static Table = &DEVICE_CONTACT_TABLE;

    fn to_row(&self) -> Row {
        RowWriter::new(Self::TABLE)
            .time("created", self.created)
            .time("updated", self.updated)
            .time("last_contact", self.last_contact)
            .time("last_contact_request", self.last_contact_request)
            .text("client_id", &self.client_id)
            .text("client_context", &self.client_context)
            .text("device_id", &self.device_id)
            .text("push_token", &self.push_token)
            .text("push_service", &self.push_service)
            .text("pinger", &self.pinger)
            .finish()
    }

    fn from_row(row: &Row) -> Result<Self, StoreError> {
        let r = RowReader::new(Self::TABLE, row);
        Ok(Self {
            created: r.time("created")?,
            updated: r.time("updated")?,
            last_contact: r.time("last_contact")?,
            last_contact_request: r.time("last_contact_request")?,
            client_id: r.text("client_id")?,
            client_context: r.text("client_context")?,
            device_id: r.text("device_id")?,
            push_token: r.text("push_token")?,
            push_service: r.text("push_service")?,
            pinger: r.text("pinger")?,
        })
    }
}

// ---------------------------------------------------------------------------
// PingerInfo
// ---------------------------------------------------------------------------

static PINGER_INFO_COLUMNS: [Column; 3] = [
    Column::text("pinger", "pinger"),
    Column::int("created", "created"),
    Column::int("updated", "updated"),
];

static PINGER_INFO_TABLE: Table = Table {
    name: "pinger_info",
    columns: &PINGER_INFO_COLUMNS,
    key: &["pinger"],
};

/// Host heartbeat row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingerInfo {
    pub pinger: String,
    pub created: u64,
    pub updated: u64,
}

impl Record for PingerInfo {
    const TABLE: &'static Table = &PINGER_INFO_TABLE;

    fn to_row(&self) -> Row {
        RowWriter::new(Self::TABLE)
            .text("pinger", &self.pinger)
            .time("created", self.created)
            .time("updated", self.updated)
            .finish()
    }

    fn from_row(row: &Row) -> Result<Self, StoreError> {
        let r = RowReader::new(Self::TABLE, row);
        Ok(Self {
            pinger: r.text("pinger")?,
            created: r.time("created")?,
            updated: r.time("updated")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> MailPingInformation {
        MailPingInformation {
            client_id: "C1".to_string(),
            client_context: "ctx1".to_string(),
            device_id: "D1".to_string(),
            platform: "ios".to_string(),
            push_token: "tok-1".to_string(),
            push_service: "APNS".to_string(),
            os_version: "17.2".to_string(),
            app_build_version: "1.0".to_string(),
            app_build_number: "42".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn device_info_row_round_trip() {
        let mut di = DeviceInfo::new(&registration(), "host-a").unwrap();
        di.endpoint_arn = "arn:1".to_string();
        di.enabled = true;
        let row = di.to_row();
        assert_eq!(row.get("device_platform"), Some(&Value::from("ios")));
        assert_eq!(row.get("aws_endpoint_arn"), Some(&Value::from("arn:1")));
        assert_eq!(DeviceInfo::from_row(&row).unwrap(), di);
    }

    #[test]
    fn nullable_columns_default_when_absent() {
        let di = DeviceInfo::new(&registration(), "host-a").unwrap();
        let mut row = di.to_row();
        row.remove("build_number");
        let back = DeviceInfo::from_row(&row).unwrap();
        assert_eq!(back.app_build_number, "");

        row.remove("device_id");
        assert!(matches!(
            DeviceInfo::from_row(&row),
            Err(StoreError::BadColumn { column: "device_id", .. })
        ));
    }

    #[test]
    fn device_info_rejects_bad_platform() {
        let mut info = registration();
        info.platform = "windows".to_string();
        assert!(matches!(
            DeviceInfo::new(&info, "host-a"),
            Err(StoreError::Invalid(_))
        ));
        info.platform = "Android".to_string();
        assert_eq!(DeviceInfo::new(&info, "host-a").unwrap().platform, "android");
    }

    #[test]
    fn update_from_reports_push_changes() {
        let mut di = DeviceInfo::new(&registration(), "host-a").unwrap();
        di.endpoint_arn = "arn:1".to_string();
        di.enabled = true;

        let same = di.update_from(&registration());
        assert_eq!(same, DeviceChange::default());
        assert_eq!(di.endpoint_arn, "arn:1");

        let mut info = registration();
        info.os_version = "18.0".to_string();
        let change = di.update_from(&info);
        assert!(change.changed);
        assert!(!change.push_changed);
        assert_eq!(di.endpoint_arn, "arn:1");

        info.push_token = "tok-2".to_string();
        let change = di.update_from(&info);
        assert!(change.changed && change.push_changed);
        assert_eq!(di.push_token, "tok-2");
        assert!(di.endpoint_arn.is_empty());
        assert!(!di.enabled);

        info.push_service = "GCM".to_string();
        let change = di.update_from(&info);
        assert!(change.push_changed);
        assert_eq!(di.push_service, "GCM");
        assert_eq!(di.push_token, "tok-2");
    }

    #[test]
    fn key_uses_logical_columns() {
        let di = DeviceInfo::new(&registration(), "host-a").unwrap();
        assert_eq!(di.key(), device_key(&di.session_key()));
    }
}
