//! In-memory record store.
//!
//! Collections are vectors in insertion order behind one mutex, which
//! keeps filter results deterministic. Mutation hooks fire after the
//! lock is released so a hook may query or mutate the store again
//! without deadlocking (the script bridge does exactly that).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::filter::{Filter, RelationResolver};
use super::{FieldMap, Hook, Params, Record, RecordStore, StoreError, Value};

type Collections = HashMap<String, Vec<Record>>;

impl RelationResolver for Collections {
    fn resolve(&self, collection: &str, id: &str) -> Option<Record> {
        self.get(collection)?.iter().find(|r| r.id == id).cloned()
    }
}

#[derive(Default)]
struct HookMap {
    create: HashMap<String, Vec<Hook>>,
    update: HashMap<String, Vec<Hook>>,
}

/// Process-local [`RecordStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<Collections>,
    hooks: Mutex<HookMap>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON fixture: an object keyed by collection name, each
    /// holding an array of field maps. An `id` member becomes the record
    /// id. Creation hooks do not fire for seeded records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Seed`] on a malformed fixture.
    pub fn load_seed(&self, json: &str) -> Result<(), StoreError> {
        let root: serde_json::Value =
            serde_json::from_str(json).map_err(|err| StoreError::Seed(err.to_string()))?;
        let Some(object) = root.as_object() else {
            return Err(StoreError::Seed("fixture root must be an object".to_owned()));
        };

        let mut collections = lock(&self.collections);
        for (collection, rows) in object {
            let Some(rows) = rows.as_array() else {
                return Err(StoreError::Seed(format!(
                    "collection {collection} must be an array"
                )));
            };
            for row in rows {
                let Some(entries) = row.as_object() else {
                    return Err(StoreError::Seed(format!(
                        "record in {collection} must be an object"
                    )));
                };
                let mut fields = FieldMap::new();
                for (name, value) in entries {
                    fields.insert(name.clone(), json_to_value(value)?);
                }
                let record = self.build_record(collection, fields);
                collections.entry(collection.clone()).or_default().push(record);
            }
        }

        Ok(())
    }

    /// Number of records in a collection. Test and diagnostics helper.
    #[must_use]
    pub fn count(&self, collection: &str) -> usize {
        lock(&self.collections)
            .get(collection)
            .map_or(0, Vec::len)
    }

    fn build_record(&self, collection: &str, mut fields: FieldMap) -> Record {
        let id = match fields.remove("id") {
            Some(Value::Str(explicit)) => explicit,
            _ => self.generate_id(),
        };

        Record {
            id,
            collection: collection.to_owned(),
            fields,
        }
    }

    fn generate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("rec{n:012x}")
    }

    fn fire(&self, hooks: Vec<Hook>, record: &Record) {
        for hook in hooks {
            hook(record);
        }
    }

    fn create_hooks(&self, collection: &str) -> Vec<Hook> {
        lock(&self.hooks)
            .create
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn update_hooks(&self, collection: &str) -> Vec<Hook> {
        lock(&self.hooks)
            .update
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

impl RecordStore for MemoryStore {
    fn find_record_by_id(&self, collection: &str, id: &str) -> Result<Record, StoreError> {
        lock(&self.collections)
            .resolve(collection, id)
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_owned(),
                id: id.to_owned(),
            })
    }

    fn find_first_record_by_filter(
        &self,
        collection: &str,
        filter: &str,
        params: &Params,
    ) -> Result<Option<Record>, StoreError> {
        let filter = Filter::parse(filter)?;
        let collections = lock(&self.collections);

        let Some(rows) = collections.get(collection) else {
            return Ok(None);
        };
        for row in rows {
            if filter.matches(row, params, &*collections)? {
                return Ok(Some(row.clone()));
            }
        }
        Ok(None)
    }

    fn find_records_by_filter(
        &self,
        collection: &str,
        filter: &str,
        params: &Params,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let filter = Filter::parse(filter)?;
        let collections = lock(&self.collections);

        let Some(rows) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matched = Vec::new();
        let mut skipped = 0;
        for row in rows {
            if !filter.matches(row, params, &*collections)? {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            matched.push(row.clone());
            if limit != 0 && matched.len() == limit {
                break;
            }
        }
        Ok(matched)
    }

    fn create(&self, collection: &str, fields: FieldMap) -> Result<Record, StoreError> {
        let record = {
            let mut collections = lock(&self.collections);
            let record = self.build_record(collection, fields);
            collections
                .entry(collection.to_owned())
                .or_default()
                .push(record.clone());
            record
        };

        self.fire(self.create_hooks(collection), &record);
        Ok(record)
    }

    fn save(&self, record: &Record) -> Result<(), StoreError> {
        let updated = {
            let mut collections = lock(&self.collections);
            let rows = collections.entry(record.collection.clone()).or_default();
            match rows.iter_mut().find(|row| row.id == record.id) {
                Some(existing) => {
                    *existing = record.clone();
                    true
                }
                None => {
                    rows.push(record.clone());
                    false
                }
            }
        };

        let hooks = if updated {
            self.update_hooks(&record.collection)
        } else {
            self.create_hooks(&record.collection)
        };
        self.fire(hooks, record);
        Ok(())
    }

    fn on_after_create(&self, collection: &str, hook: Hook) {
        lock(&self.hooks)
            .create
            .entry(collection.to_owned())
            .or_default()
            .push(hook);
    }

    fn on_after_update(&self, collection: &str, hook: Hook) {
        lock(&self.hooks)
            .update
            .entry(collection.to_owned())
            .or_default()
            .push(hook);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn json_to_value(value: &serde_json::Value) -> Result<Value, StoreError> {
    match value {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::I64(i))
            } else {
                Ok(Value::F64(n.as_f64().unwrap_or_default()))
            }
        }
        serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
        serde_json::Value::Array(items) => {
            if items.iter().all(serde_json::Value::is_string) {
                Ok(Value::StrList(
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect(),
                ))
            } else if items.iter().all(serde_json::Value::is_u64) {
                Ok(Value::U64List(
                    items.iter().filter_map(serde_json::Value::as_u64).collect(),
                ))
            } else {
                Err(StoreError::Seed(
                    "arrays must be all-string or all-integer".to_owned(),
                ))
            }
        }
        serde_json::Value::Object(_) => {
            Err(StoreError::Seed("nested objects are not supported".to_owned()))
        }
    }
}
