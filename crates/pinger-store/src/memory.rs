use crate::error::StoreError;
use crate::schema::{Filter, Row, Table};
use crate::store::{Store, check_full_key, require_key};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;

/// Key-value store kept in process memory. One map per table, keyed by the
/// encoded logical key.
pub struct MemoryStore {
    tables: HashMap<&'static str, DashMap<String, Row>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let tables = crate::TABLES
            .iter()
            .map(|t| (t.name, DashMap::new()))
            .collect();
        Self { tables }
    }

    fn table(&self, table: &'static Table) -> Result<&DashMap<String, Row>, StoreError> {
        self.tables
            .get(table.name)
            .ok_or_else(|| StoreError::Invalid(format!("unknown table {}", table.name)))
    }
}

/// Key values in key-column order, separated by the ASCII unit separator.
fn encode_key(table: &'static Table, key: &[Filter]) -> String {
    table
        .key
        .iter()
        .filter_map(|k| key.iter().find(|f| f.column == *k))
        .map(|f| f.value.to_string())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

impl Store for MemoryStore {
    fn search(&self, table: &'static Table, filters: &[Filter]) -> Result<Vec<Row>, StoreError> {
        let map = self.table(table)?;
        let mut rows: Vec<(String, Row)> = map
            .iter()
            .filter(|entry| filters.iter().all(|f| f.matches(entry.value())))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    fn insert(&self, table: &'static Table, row: &Row) -> Result<(), StoreError> {
        let key = require_key(table, row)?;
        match self.table(table)?.entry(encode_key(table, &key)) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists { table: table.name }),
            Entry::Vacant(slot) => {
                slot.insert(row.clone());
                Ok(())
            }
        }
    }

    fn update(&self, table: &'static Table, row: &Row) -> Result<u64, StoreError> {
        let key = require_key(table, row)?;
        match self.table(table)?.get_mut(&encode_key(table, &key)) {
            Some(mut existing) => {
                for (column, value) in row {
                    if !table.is_key(column) {
                        existing.insert(*column, value.clone());
                    }
                }
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete(&self, table: &'static Table, key: &[Filter]) -> Result<u64, StoreError> {
        check_full_key(table, key)?;
        let map = self.table(table)?;
        let encoded = encode_key(table, key);
        // Extra filters beyond the key must also match.
        let removed = map.remove_if(&encoded, |_, row| key.iter().all(|f| f.matches(row)));
        Ok(u64::from(removed.is_some()))
    }

    fn get(&self, table: &'static Table, key: &[Filter]) -> Result<Option<Row>, StoreError> {
        if check_full_key(table, key).is_err() {
            return self
                .search(table, key)
                .and_then(|mut rows| match rows.len() {
                    0 => Ok(None),
                    1 => Ok(rows.pop()),
                    count => Err(StoreError::Ambiguous {
                        table: table.name,
                        count,
                    }),
                });
        }
        let map = self.table(table)?;
        Ok(map
            .get(&encode_key(table, key))
            .map(|row| row.value().clone())
            .filter(|row| key.iter().all(|f| f.matches(row))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{
        DeviceContact, PingerInfo, Record, get_record, insert_record, search_records,
    };

    fn contact(device: &str, token: &str) -> DeviceContact {
        DeviceContact {
            client_id: "C1".to_string(),
            client_context: "ctx1".to_string(),
            device_id: device.to_string(),
            push_token: token.to_string(),
            push_service: "APNS".to_string(),
            pinger: "host-a".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn insert_is_unique_per_key() {
        let store = MemoryStore::new();
        insert_record(&store, &contact("D1", "t1")).unwrap();
        assert!(matches!(
            insert_record(&store, &contact("D1", "t2")),
            Err(StoreError::AlreadyExists { .. })
        ));
        insert_record(&store, &contact("D2", "t1")).unwrap();

        let found: Vec<DeviceContact> =
            search_records(&store, &[Filter::eq("push_token", "t1")]).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].device_id, "D1");
    }

    #[test]
    fn update_keeps_key_and_counts_rows() {
        let store = MemoryStore::new();
        let mut c = contact("D1", "t1");
        assert_eq!(store.update(DeviceContact::TABLE, &c.to_row()).unwrap(), 0);
        insert_record(&store, &c).unwrap();

        c.last_contact = 99;
        assert_eq!(store.update(DeviceContact::TABLE, &c.to_row()).unwrap(), 1);
        let back: DeviceContact = get_record(&store, &c.key()).unwrap().unwrap();
        assert_eq!(back.last_contact, 99);
    }

    #[test]
    fn delete_and_partial_get() {
        let store = MemoryStore::new();
        let hb = PingerInfo {
            pinger: "host-a".to_string(),
            created: 1,
            updated: 1,
        };
        insert_record(&store, &hb).unwrap();
        insert_record(&store, &contact("D1", "t1")).unwrap();
        insert_record(&store, &contact("D2", "t1")).unwrap();

        assert!(matches!(
            store.get(DeviceContact::TABLE, &[Filter::eq("client_id", "C1")]),
            Err(StoreError::Ambiguous { count: 2, .. })
        ));
        assert!(
            store
                .delete(DeviceContact::TABLE, &[Filter::eq("client_id", "C1")])
                .is_err()
        );
        assert_eq!(store.delete(PingerInfo::TABLE, &hb.key()).unwrap(), 1);
        assert!(store.get(PingerInfo::TABLE, &hb.key()).unwrap().is_none());
    }
}
