//! Record event bridges.
//!
//! Two store hooks connect external record mutations to the live
//! server:
//!
//! - the **key bridge** reacts to `keys` updates by dropping a
//!   subscription whose key was blacklisted, or pushing a sealed
//!   `KeyUpdate` to one that is already loaded
//! - the **script bridge** reacts to `scripts` writes by running the
//!   external preprocessor and saving the protected blob back
//!
//! Hooks run synchronously on whatever thread performed the store
//! mutation; everything they do (queue pushes, token cancellation,
//! store writes) is non-blocking.

use std::sync::Arc;

use tracing::{info, warn};

use sws_core::model::Key;
use sws_core::protocol::{KeyUpdatePacket, Opcode};
use sws_core::record::{Record, RecordStore};

use crate::registry::Registry;
use crate::subscription::state;

/// The external script preprocessor.
///
/// A pure function from loader source and project material to a
/// protected blob. The real implementation is a native routine loaded
/// out of process scope; [`PassthroughProtector`] stands in where no
/// protection is wanted.
pub trait ScriptProtector: Send + Sync {
    /// Produce the protected blob, or nothing when protection failed.
    fn protect(&self, source: &str, salt: &str, point: &str, script_id: &str) -> Option<String>;
}

/// Protector that returns the source unchanged.
pub struct PassthroughProtector;

impl ScriptProtector for PassthroughProtector {
    fn protect(&self, source: &str, _salt: &str, _point: &str, _script_id: &str) -> Option<String> {
        Some(source.to_owned())
    }
}

/// Marker file name for already-protected scripts.
const PROTECTED_FILE: &str = "protected.lua";

/// Wire the key bridge into the store.
pub fn register_key_bridge(store: &Arc<dyn RecordStore>, registry: Arc<Registry>) {
    store.on_after_update(
        "keys",
        Arc::new(move |record: &Record| {
            let key = Key::new(record.clone());

            let Some(sub) = registry.find_by_key_id(key.id()) else {
                return;
            };

            if let Some(reason) = key.blacklist() {
                // The enforcement path closes its own subscription
                // before writing; only externally blacklisted keys get
                // the generic reason.
                if !sub.is_closing() {
                    warn!(key_id = %key.id(), reason, "dropping subscription for blacklisted key");
                    sub.close("key got blacklisted");
                }
                return;
            }

            if !sub.has_state(state::LOADED) {
                return;
            }

            info!(key_id = %key.id(), role = %key.role(), "pushing key update");
            if let Err(err) = sub.send_sealed(
                Opcode::KeyUpdate,
                &KeyUpdatePacket {
                    role: key.role().to_owned(),
                },
            ) {
                warn!(key_id = %key.id(), error = %err, "failed to push key update");
            }
        }),
    );
}

/// Wire the script bridge into the store for both creates and updates.
pub fn register_script_bridge(store: &Arc<dyn RecordStore>, protector: Arc<dyn ScriptProtector>) {
    let hook = {
        let store = Arc::downgrade(store);
        Arc::new(move |record: &Record| {
            let Some(store) = store.upgrade() else {
                return;
            };

            // Saving the protected blob re-fires this hook; the marker
            // file name stops the recursion.
            if record.get_str("file").contains("protected") {
                return;
            }

            let project = match store.find_record_by_id("projects", record.get_str("project")) {
                Ok(project) => project,
                Err(err) => {
                    warn!(script_id = %record.id, error = %err, "no project for script");
                    return;
                }
            };

            let Some(blob) = protector.protect(
                record.get_str("source"),
                project.get_str("salt"),
                project.get_str("point"),
                &record.id,
            ) else {
                warn!(script_id = %record.id, "failed to protect script");
                return;
            };

            info!(script_id = %record.id, len = blob.len(), "protected script");

            let mut protected = record.clone();
            protected.set("source", blob);
            protected.set("file", PROTECTED_FILE);
            if let Err(err) = store.save(&protected) {
                warn!(script_id = %record.id, error = %err, "failed to save protected script");
            }
        })
    };

    store.on_after_create("scripts", hook.clone());
    store.on_after_update("scripts", hook);
}

#[cfg(test)]
mod tests {
    use sws_core::record::{FieldMap, MemoryStore, Value};

    use super::*;

    #[test]
    fn script_bridge_protects_new_scripts_once() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn RecordStore> = memory.clone();

        register_script_bridge(&store, Arc::new(PassthroughProtector));

        store
            .create(
                "projects",
                FieldMap::from([
                    ("id".to_owned(), Value::from("P1")),
                    ("salt".to_owned(), Value::from("c2FsdA==")),
                    ("point".to_owned(), Value::from("cG9pbnQ=")),
                ]),
            )
            .unwrap();

        let script = store
            .create(
                "scripts",
                FieldMap::from([
                    ("project".to_owned(), Value::from("P1")),
                    ("game".to_owned(), Value::from(42u64)),
                    ("file".to_owned(), Value::from("raw.lua")),
                    ("source".to_owned(), Value::from("print('hi')")),
                ]),
            )
            .unwrap();

        let saved = store.find_record_by_id("scripts", &script.id).unwrap();
        assert_eq!(saved.get_str("file"), PROTECTED_FILE);
        assert_eq!(saved.get_str("source"), "print('hi')");
        assert_eq!(memory.count("scripts"), 1);
    }
}
