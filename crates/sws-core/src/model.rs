//! Typed proxies over raw store records.
//!
//! The store hands back loosely-typed rows; everything the server
//! actually reads goes through these wrappers so field access stays
//! typed and the narrowing happens in one place.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

use crate::record::{Record, RecordStore, StoreError};

/// Model narrowing failures.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A key record has no usable discord binding.
    #[error("invalid discord id")]
    InvalidDiscordId,

    /// A key record has no project relation, or the project is missing.
    #[error("no project for key")]
    MissingProject,

    /// A project's base point or salt failed to decode.
    #[error("invalid project material: {0}")]
    InvalidMaterial(String),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A row of the `keys` collection.
#[derive(Debug, Clone)]
pub struct Key {
    record: Record,
}

impl Key {
    /// Wrap a raw record.
    #[must_use]
    pub fn new(record: Record) -> Self {
        Self { record }
    }

    /// Fetch a key by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the id does not exist.
    pub fn find(store: &dyn RecordStore, id: &str) -> Result<Self, StoreError> {
        Ok(Self::new(store.find_record_by_id("keys", id)?))
    }

    /// Record id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// The discord binding, required for every live key.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidDiscordId`] when unset or empty.
    pub fn discord_id(&self) -> Result<&str, ModelError> {
        let id = self.record.get_str("discordId");
        if id.is_empty() {
            return Err(ModelError::InvalidDiscordId);
        }
        Ok(id)
    }

    /// Blacklist reason, when the key is blacklisted.
    #[must_use]
    pub fn blacklist(&self) -> Option<&str> {
        let reason = self.record.get_str("blacklist");
        (!reason.is_empty()).then_some(reason)
    }

    /// Role string.
    #[must_use]
    pub fn role(&self) -> &str {
        self.record.get_str("role")
    }

    /// Whether the key is flagged for BOLO alerting.
    #[must_use]
    pub fn bolo(&self) -> bool {
        self.record.get_bool("bolo")
    }

    /// Whether the key expired strictly before the given unix time.
    ///
    /// An expiry exactly equal to the timestamp is not expired. Unset
    /// and unparseable expiries never expire.
    #[must_use]
    pub fn expired(&self, at: u64) -> bool {
        match self.record.get("expiry") {
            Some(crate::record::Value::I64(seconds)) => {
                u64::try_from(*seconds).map_or(true, |expiry| expiry < at)
            }
            Some(crate::record::Value::Str(text)) if !text.is_empty() => {
                match chrono::DateTime::parse_from_rfc3339(text) {
                    Ok(parsed) => {
                        let expiry = parsed.timestamp();
                        u64::try_from(expiry).map_or(true, |expiry| expiry < at)
                    }
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }

    /// Resolve the project the key belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MissingProject`] when the relation is unset
    /// or dangling.
    pub fn project(&self, store: &dyn RecordStore) -> Result<Project, ModelError> {
        let project_id = self.record.get_str("project");
        if project_id.is_empty() {
            return Err(ModelError::MissingProject);
        }
        match store.find_record_by_id("projects", project_id) {
            Ok(record) => Ok(Project::new(record)),
            Err(StoreError::NotFound { .. }) => Err(ModelError::MissingProject),
            Err(err) => Err(err.into()),
        }
    }

    /// Borrow the underlying record.
    #[must_use]
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Mutable access for enforcement writes.
    pub fn record_mut(&mut self) -> &mut Record {
        &mut self.record
    }
}

/// A row of the `projects` collection.
#[derive(Debug, Clone)]
pub struct Project {
    record: Record,
}

impl Project {
    /// Wrap a raw record.
    #[must_use]
    pub fn new(record: Record) -> Self {
        Self { record }
    }

    /// Record id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// The X25519 base point both sides key their exchange on.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidMaterial`] on bad base64 or a wrong
    /// length.
    pub fn point(&self) -> Result<[u8; 32], ModelError> {
        let decoded = BASE64
            .decode(self.record.get_str("point"))
            .map_err(|err| ModelError::InvalidMaterial(err.to_string()))?;
        decoded
            .try_into()
            .map_err(|_| ModelError::InvalidMaterial("point must be 32 bytes".to_owned()))
    }

    /// The HKDF salt.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidMaterial`] on bad base64.
    pub fn salt(&self) -> Result<Vec<u8>, ModelError> {
        BASE64
            .decode(self.record.get_str("salt"))
            .map_err(|err| ModelError::InvalidMaterial(err.to_string()))
    }

    /// Webhook URL alerts for this project are posted to.
    #[must_use]
    pub fn alert_webhook(&self) -> &str {
        self.record.get_str("alertWebhook")
    }
}
