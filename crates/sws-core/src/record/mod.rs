//! Abstract record store surface.
//!
//! The server treats its persistence layer as a document store with a
//! handful of collections (`keys`, `projects`, `analytics`,
//! `fingerprints`, `sessions`, `joins`, `subscriptions`, `scripts`),
//! filter queries in a small boolean DSL, and after-create /
//! after-update callbacks. Everything in this module is written against
//! that surface; [`MemoryStore`] is the in-process implementation used
//! by the daemon and the test suite.
//!
//! Rows come back loosely typed. Code that cares about shape narrows
//! them through the proxies in [`crate::model`].

mod filter;
mod memory;

pub use filter::{Filter, FilterError};
pub use memory::MemoryStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

/// A single scalar or list field on a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Unset field.
    Null,
    /// Boolean field.
    Bool(bool),
    /// Integer field.
    I64(i64),
    /// Floating point field.
    F64(f64),
    /// Text field. Relation fields store the target record id here.
    Str(String),
    /// List of strings.
    StrList(Vec<String>),
    /// List of unsigned integers.
    U64List(Vec<u64>),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::I64(v as i64)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Self::I64(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Self::StrList(v)
    }
}

impl From<Vec<u64>> for Value {
    fn from(v: Vec<u64>) -> Self {
        Self::U64List(v)
    }
}

/// Field map used when creating records and carried by [`Record`].
pub type FieldMap = BTreeMap<String, Value>;

/// One row of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Store-assigned record id.
    pub id: String,
    /// Collection the row belongs to.
    pub collection: String,
    /// Field values.
    pub fields: FieldMap,
}

impl Record {
    /// Raw field access.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String field, empty when unset or not a string.
    #[must_use]
    pub fn get_str(&self, field: &str) -> &str {
        match self.fields.get(field) {
            Some(Value::Str(s)) => s,
            _ => "",
        }
    }

    /// Boolean field, false when unset.
    #[must_use]
    pub fn get_bool(&self, field: &str) -> bool {
        matches!(self.fields.get(field), Some(Value::Bool(true)))
    }

    /// Integer field, zero when unset. Floating point values truncate.
    #[must_use]
    pub fn get_i64(&self, field: &str) -> i64 {
        match self.fields.get(field) {
            Some(Value::I64(v)) => *v,
            Some(Value::F64(v)) => *v as i64,
            _ => 0,
        }
    }

    /// Floating point field, zero when unset.
    #[must_use]
    pub fn get_f64(&self, field: &str) -> f64 {
        match self.fields.get(field) {
            Some(Value::F64(v)) => *v,
            Some(Value::I64(v)) => *v as f64,
            _ => 0.0,
        }
    }

    /// String list field, empty when unset.
    #[must_use]
    pub fn get_str_list(&self, field: &str) -> &[String] {
        match self.fields.get(field) {
            Some(Value::StrList(v)) => v,
            _ => &[],
        }
    }

    /// Set a field value.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_owned(), value.into());
    }
}

/// Named parameters for filter placeholders.
#[derive(Debug, Clone, Default)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    /// Empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.0.insert(name.to_owned(), value.into());
        self
    }

    /// Look up a parameter by placeholder name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
}

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `find_record_by_id` found nothing.
    #[error("no record {id} in {collection}")]
    NotFound {
        /// Collection queried.
        collection: String,
        /// Record id queried.
        id: String,
    },

    /// A filter expression failed to parse or evaluate.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// A seed fixture was malformed.
    #[error("seed fixture error: {0}")]
    Seed(String),
}

/// Record mutation callback. Runs synchronously after the mutation has
/// been applied and the store lock released, so callbacks are free to
/// query or mutate the store again.
pub type Hook = Arc<dyn Fn(&Record) + Send + Sync>;

/// The store surface the server is written against.
pub trait RecordStore: Send + Sync {
    /// Fetch one record by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the id does not exist.
    fn find_record_by_id(&self, collection: &str, id: &str) -> Result<Record, StoreError>;

    /// First record matching a filter expression, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Filter`] on a malformed expression.
    fn find_first_record_by_filter(
        &self,
        collection: &str,
        filter: &str,
        params: &Params,
    ) -> Result<Option<Record>, StoreError>;

    /// All records matching a filter expression. `limit` of zero means
    /// unlimited.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Filter`] on a malformed expression.
    fn find_records_by_filter(
        &self,
        collection: &str,
        filter: &str,
        params: &Params,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>, StoreError>;

    /// Insert a new record. A supplied `id` field becomes the record id;
    /// otherwise one is generated.
    ///
    /// # Errors
    ///
    /// Propagates store failures from the backing implementation.
    fn create(&self, collection: &str, fields: FieldMap) -> Result<Record, StoreError>;

    /// Persist a record, upserting by id.
    ///
    /// # Errors
    ///
    /// Propagates store failures from the backing implementation.
    fn save(&self, record: &Record) -> Result<(), StoreError>;

    /// Register a callback fired after records are created in a
    /// collection.
    fn on_after_create(&self, collection: &str, hook: Hook);

    /// Register a callback fired after records are updated in a
    /// collection.
    fn on_after_update(&self, collection: &str, hook: Hook);
}

/// Get-or-create a row linked to a key.
///
/// Finds the first row with `key = :id`; when present it is returned
/// unchanged and the supplied fields are ignored. The discriminating
/// fields only matter on first creation, which is what makes the
/// per-key mismatch checks meaningful later.
///
/// # Errors
///
/// Propagates query and create failures.
pub fn expect_keyed_record(
    store: &dyn RecordStore,
    collection: &str,
    key_id: &str,
    fields: FieldMap,
) -> Result<Record, StoreError> {
    if let Some(existing) =
        store.find_first_record_by_filter(collection, "key = {:id}", &Params::new().set("id", key_id))?
    {
        return Ok(existing);
    }

    store.create(collection, fields)
}
