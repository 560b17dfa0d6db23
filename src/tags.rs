//! Tags and the current-value store contract.
//!
//! The value store owns the authoritative value and timestamp of every tag.
//! Machines never poll it for changes: they register a [`TagObserver`] and the
//! store calls [`TagObserver::notify`] after every update.
//!
//! [`InMemoryValueStore`] is a complete, thread-safe implementation used by the
//! CLI and the test-suite. Production deployments plug their own store in
//! through the [`ValueStore`] trait.

use crate::error::{AppResult, AutomationError};
use crate::units::{Reading, Unit};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Location of a tag on a remote instrument server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteAddress {
    /// Server address (e.g., "opc.tcp://plc-01:4840")
    pub address: String,
    /// Node namespace on that server (e.g., "ns=2;i=1001")
    pub namespace: String,
}

/// A named, typed process value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    /// Unique tag name
    pub name: String,
    /// Unit values are stored in
    pub unit: Unit,
    /// Unit values are shown in
    pub display_unit: Unit,
    /// Remote node feeding this tag, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteAddress>,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

impl Tag {
    /// Create a local tag displayed in its own unit.
    pub fn new(name: impl Into<String>, unit: Unit) -> Self {
        Self {
            name: name.into(),
            unit,
            display_unit: unit,
            remote: None,
            description: String::new(),
        }
    }

    /// Show values in a different unit of the same quantity.
    pub fn with_display_unit(mut self, unit: Unit) -> Self {
        self.display_unit = unit;
        self
    }

    /// Bind the tag to a remote node.
    pub fn with_remote(mut self, address: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.remote = Some(RemoteAddress {
            address: address.into(),
            namespace: namespace.into(),
        });
        self
    }

    /// Set the free-form description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Receiver of tag value updates.
pub trait TagObserver: Send + Sync {
    /// Stable identity used to detach this observer.
    fn observer_id(&self) -> Uuid;

    /// Called by the value store after `tag` changed.
    fn notify(&self, tag: &str, reading: Reading, timestamp: DateTime<Utc>);
}

/// Current-value table consumed by the machines.
pub trait ValueStore: Send + Sync {
    /// Current reading (in the tag's base unit) and its timestamp.
    fn get_current_value(&self, tag: &str) -> AppResult<(Reading, DateTime<Utc>)>;

    /// Store a new value (in the tag's base unit) and notify observers.
    fn set_value(&self, tag: &str, value: f64, timestamp: DateTime<Utc>) -> AppResult<()>;

    /// Deliver every later change of `tag` to `observer`.
    fn attach_observer(&self, tag: &str, observer: Arc<dyn TagObserver>) -> AppResult<()>;

    /// Stop delivering changes of `tag` to `observer_id`. Unknown observers are ignored.
    fn detach_observer(&self, tag: &str, observer_id: Uuid) -> AppResult<()>;
}

struct TagRecord {
    tag: Tag,
    value: f64,
    timestamp: DateTime<Utc>,
    observers: Vec<Arc<dyn TagObserver>>,
}

/// Thread-safe in-process value store.
#[derive(Default)]
pub struct InMemoryValueStore {
    records: RwLock<HashMap<String, TagRecord>>,
}

impl std::fmt::Debug for InMemoryValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryValueStore")
            .field("tags", &self.records.read().len())
            .finish()
    }
}

impl InMemoryValueStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tag with an initial value of zero.
    ///
    /// # Errors
    /// Returns `InvalidAttribute` if the tag already exists or its display unit
    /// measures a different quantity than its base unit.
    pub fn create_tag(&self, tag: Tag) -> AppResult<()> {
        if tag.unit.quantity() != tag.display_unit.quantity() {
            return Err(AutomationError::UnitMismatch {
                from: tag.unit.symbol().to_string(),
                to: tag.display_unit.symbol().to_string(),
            });
        }

        let mut records = self.records.write();
        if records.contains_key(&tag.name) {
            return Err(AutomationError::InvalidAttribute(format!(
                "Tag '{}' already exists",
                tag.name
            )));
        }

        debug!(tag = %tag.name, unit = %tag.unit, "Tag created");
        records.insert(
            tag.name.clone(),
            TagRecord {
                tag,
                value: 0.0,
                timestamp: Utc::now(),
                observers: Vec::new(),
            },
        );
        Ok(())
    }

    /// Remove a tag and every observer attached to it.
    pub fn delete_tag(&self, name: &str) -> bool {
        self.records.write().remove(name).is_some()
    }

    /// Tag definition by name.
    pub fn get_tag(&self, name: &str) -> Option<Tag> {
        self.records.read().get(name).map(|r| r.tag.clone())
    }

    /// All tag definitions, sorted by name.
    pub fn tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self.records.read().values().map(|r| r.tag.clone()).collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        tags
    }

    /// Number of observers attached to `tag`.
    pub fn observer_count(&self, tag: &str) -> usize {
        self.records
            .read()
            .get(tag)
            .map(|r| r.observers.len())
            .unwrap_or(0)
    }
}

impl ValueStore for InMemoryValueStore {
    fn get_current_value(&self, tag: &str) -> AppResult<(Reading, DateTime<Utc>)> {
        let records = self.records.read();
        let record = records
            .get(tag)
            .ok_or_else(|| AutomationError::TagNotFound(tag.to_string()))?;
        Ok((Reading::new(record.value, record.tag.unit), record.timestamp))
    }

    fn set_value(&self, tag: &str, value: f64, timestamp: DateTime<Utc>) -> AppResult<()> {
        // Observers may call back into the store, so they run after the lock is released.
        let (observers, unit) = {
            let mut records = self.records.write();
            let record = records
                .get_mut(tag)
                .ok_or_else(|| AutomationError::TagNotFound(tag.to_string()))?;
            record.value = value;
            record.timestamp = timestamp;
            (record.observers.clone(), record.tag.unit)
        };

        let reading = Reading::new(value, unit);
        for observer in observers {
            observer.notify(tag, reading, timestamp);
        }
        Ok(())
    }

    fn attach_observer(&self, tag: &str, observer: Arc<dyn TagObserver>) -> AppResult<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(tag)
            .ok_or_else(|| AutomationError::TagNotFound(tag.to_string()))?;

        let id = observer.observer_id();
        if record.observers.iter().any(|o| o.observer_id() == id) {
            warn!(tag = %tag, observer = %id, "Observer already attached");
            return Ok(());
        }
        record.observers.push(observer);
        Ok(())
    }

    fn detach_observer(&self, tag: &str, observer_id: Uuid) -> AppResult<()> {
        let mut records = self.records.write();
        if let Some(record) = records.get_mut(tag) {
            record.observers.retain(|o| o.observer_id() != observer_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingObserver {
        id: Uuid,
        seen: Mutex<Vec<(String, Reading)>>,
    }

    impl TagObserver for RecordingObserver {
        fn observer_id(&self) -> Uuid {
            self.id
        }

        fn notify(&self, tag: &str, reading: Reading, _timestamp: DateTime<Utc>) {
            self.seen.lock().push((tag.to_string(), reading));
        }
    }

    fn observer() -> Arc<RecordingObserver> {
        Arc::new(RecordingObserver {
            id: Uuid::new_v4(),
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn set_value_notifies_attached_observers() {
        let store = InMemoryValueStore::new();
        store.create_tag(Tag::new("PT-100", Unit::Bar)).unwrap();

        let obs = observer();
        store.attach_observer("PT-100", obs.clone()).unwrap();
        store.set_value("PT-100", 2.5, Utc::now()).unwrap();

        let seen = obs.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "PT-100");
        assert_eq!(seen[0].1, Reading::new(2.5, Unit::Bar));
    }

    #[test]
    fn detached_observers_stop_receiving() {
        let store = InMemoryValueStore::new();
        store.create_tag(Tag::new("TT-1", Unit::Celsius)).unwrap();

        let obs = observer();
        store.attach_observer("TT-1", obs.clone()).unwrap();
        store.detach_observer("TT-1", obs.id).unwrap();
        store.set_value("TT-1", 20.0, Utc::now()).unwrap();

        assert!(obs.seen.lock().is_empty());
        assert_eq!(store.observer_count("TT-1"), 0);
    }

    #[test]
    fn attaching_twice_keeps_one_registration() {
        let store = InMemoryValueStore::new();
        store.create_tag(Tag::new("FT-7", Unit::LiterPerMinute)).unwrap();

        let obs = observer();
        store.attach_observer("FT-7", obs.clone()).unwrap();
        store.attach_observer("FT-7", obs).unwrap();
        assert_eq!(store.observer_count("FT-7"), 1);
    }

    #[test]
    fn unknown_tags_are_reported() {
        let store = InMemoryValueStore::new();
        assert!(matches!(
            store.get_current_value("missing"),
            Err(AutomationError::TagNotFound(_))
        ));
        assert!(store.set_value("missing", 1.0, Utc::now()).is_err());
    }

    #[test]
    fn create_tag_rejects_incompatible_display_unit() {
        let store = InMemoryValueStore::new();
        let tag = Tag::new("bad", Unit::Meter).with_display_unit(Unit::Watt);
        assert!(store.create_tag(tag).is_err());
    }
}
