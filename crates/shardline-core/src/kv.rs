//! Key-value store abstraction with conditional writes.
//!
//! Items live in a namespace (the hash key) under a resource name (the range
//! key) and carry a flat map of JSON attributes. The contract mirrors what a
//! strongly-consistent document store offers:
//! - Conditional put and update expressions evaluated atomically per item
//! - Consistent reads on request
//! - Per-item expiry through the [`TTL_ATTRIBUTE`] attribute (epoch seconds)
//! - Namespace queries sorted by resource
//!
//! A failed condition is a normal [`WriteResult`], never an error.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::clock::SharedClock;
use crate::error::{Error, Result};

/// Attribute holding the expiry of an item as epoch seconds.
pub const TTL_ATTRIBUTE: &str = "ttl";

/// Attribute map of an item.
pub type Attributes = Map<String, Value>;

/// Primary key of an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    /// Hash key grouping related items.
    pub namespace: String,
    /// Range key, unique within the namespace.
    pub resource: String,
}

impl ItemKey {
    /// Creates a key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource: resource.into(),
        }
    }
}

/// A stored item.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Primary key.
    pub key: ItemKey,
    /// Non-key attributes.
    pub attributes: Attributes,
}

impl Item {
    /// Builds an item from a serializable record. The record must serialize to a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the record is not a JSON object.
    pub fn from_record<R: Serialize>(key: ItemKey, record: &R) -> Result<Self> {
        match serde_json::to_value(record)? {
            Value::Object(attributes) => Ok(Self { key, attributes }),
            other => Err(Error::Serialization {
                message: format!("record must serialize to an object, got {other}"),
            }),
        }
    }

    /// Decodes the attributes into a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the attributes do not match the record.
    pub fn to_record<R: DeserializeOwned>(&self) -> Result<R> {
        Ok(serde_json::from_value(Value::Object(self.attributes.clone()))?)
    }

    /// Returns an attribute value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// Condition expression guarding a write.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The attribute is present (and the item exists).
    AttributeExists(String),
    /// The attribute is absent, or the item does not exist.
    AttributeNotExists(String),
    /// The attribute equals the value.
    Eq(String, Value),
    /// The attribute is less than or equal to the value.
    Lte(String, Value),
    /// Either condition holds.
    Or(Box<Condition>, Box<Condition>),
    /// Both conditions hold.
    And(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Builds an equality condition.
    #[must_use]
    pub fn equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(name.into(), value.into())
    }

    /// Builds a less-or-equal condition.
    #[must_use]
    pub fn lte(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte(name.into(), value.into())
    }

    /// Builds an attribute-not-exists condition.
    #[must_use]
    pub fn not_exists(name: impl Into<String>) -> Self {
        Self::AttributeNotExists(name.into())
    }

    /// Combines two conditions with OR.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Combines two conditions with AND.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// Evaluates the condition against the current attributes of an item.
    #[must_use]
    pub fn evaluate(&self, current: Option<&Attributes>) -> bool {
        let attribute = |name: &str| current.and_then(|attrs| attrs.get(name));
        match self {
            Self::AttributeExists(name) => attribute(name).is_some(),
            Self::AttributeNotExists(name) => attribute(name).is_none(),
            Self::Eq(name, expected) => attribute(name).is_some_and(|v| v == expected),
            Self::Lte(name, bound) => attribute(name)
                .and_then(|v| compare(v, bound))
                .is_some_and(|ord| ord != Ordering::Greater),
            Self::Or(a, b) => a.evaluate(current) || b.evaluate(current),
            Self::And(a, b) => a.evaluate(current) && b.evaluate(current),
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// One change applied by [`KvStore::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    /// Sets an attribute.
    Set(String, Value),
    /// Removes an attribute.
    Remove(String),
}

impl UpdateAction {
    /// Builds a set action.
    #[must_use]
    pub fn set(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Set(name.into(), value.into())
    }

    /// Builds a remove action.
    #[must_use]
    pub fn remove(name: impl Into<String>) -> Self {
        Self::Remove(name.into())
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The write was applied.
    Success,
    /// The condition did not hold; nothing was written.
    ConditionFailed,
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the condition did not hold.
    #[must_use]
    pub const fn is_condition_failed(self) -> bool {
        matches!(self, Self::ConditionFailed)
    }
}

/// Key-value store with conditional writes.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Reads an item. Expired items read as absent.
    async fn get(&self, key: &ItemKey, consistent: bool) -> Result<Option<Item>>;

    /// Writes a whole item, replacing any previous version, if `condition` holds.
    async fn put(&self, item: Item, condition: Option<Condition>) -> Result<WriteResult>;

    /// Applies `actions` to an item, creating it when missing, if `condition` holds.
    async fn update(
        &self,
        key: &ItemKey,
        actions: Vec<UpdateAction>,
        condition: Option<Condition>,
    ) -> Result<WriteResult>;

    /// Deletes an item. Succeeds if the item does not exist.
    async fn delete(&self, key: &ItemKey) -> Result<()>;

    /// Lists every live item of a namespace, sorted by resource.
    async fn query(&self, namespace: &str, consistent: bool) -> Result<Vec<Item>>;
}

/// In-memory key-value store.
///
/// Thread-safe via `RwLock`. Expiry is evaluated lazily against the injected
/// clock, so a fake clock can drive TTL behavior in tests.
#[derive(Debug)]
pub struct MemoryKvStore {
    clock: SharedClock,
    items: RwLock<BTreeMap<ItemKey, Attributes>>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            items: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the number of stored items, including expired ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock was poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// Returns true if the store holds no items.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock was poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<ItemKey, Attributes>>> {
        self.items
            .read()
            .map_err(|_| Error::internal("lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<ItemKey, Attributes>>> {
        self.items
            .write()
            .map_err(|_| Error::internal("lock poisoned"))
    }

    fn is_live(&self, attributes: &Attributes) -> bool {
        let now = self.clock.now().timestamp();
        attributes
            .get(TTL_ATTRIBUTE)
            .and_then(Value::as_i64)
            .is_none_or(|ttl| ttl > now)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &ItemKey, _consistent: bool) -> Result<Option<Item>> {
        let items = self.read()?;
        Ok(items
            .get(key)
            .filter(|attributes| self.is_live(attributes))
            .map(|attributes| Item {
                key: key.clone(),
                attributes: attributes.clone(),
            }))
    }

    async fn put(&self, item: Item, condition: Option<Condition>) -> Result<WriteResult> {
        let mut items = self.write()?;
        let current = items.get(&item.key).filter(|attrs| self.is_live(attrs));

        if let Some(condition) = condition {
            if !condition.evaluate(current) {
                return Ok(WriteResult::ConditionFailed);
            }
        }

        items.insert(item.key, item.attributes);
        Ok(WriteResult::Success)
    }

    async fn update(
        &self,
        key: &ItemKey,
        actions: Vec<UpdateAction>,
        condition: Option<Condition>,
    ) -> Result<WriteResult> {
        let mut items = self.write()?;
        let current = items.get(key).filter(|attrs| self.is_live(attrs));

        if let Some(condition) = condition {
            if !condition.evaluate(current) {
                return Ok(WriteResult::ConditionFailed);
            }
        }

        let mut attributes = current.cloned().unwrap_or_default();
        for action in actions {
            match action {
                UpdateAction::Set(name, value) => {
                    attributes.insert(name, value);
                }
                UpdateAction::Remove(name) => {
                    attributes.remove(&name);
                }
            }
        }

        items.insert(key.clone(), attributes);
        Ok(WriteResult::Success)
    }

    async fn delete(&self, key: &ItemKey) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }

    async fn query(&self, namespace: &str, _consistent: bool) -> Result<Vec<Item>> {
        let items = self.read()?;
        Ok(items
            .iter()
            .filter(|(key, attrs)| key.namespace == namespace && self.is_live(attrs))
            .map(|(key, attributes)| Item {
                key: key.clone(),
                attributes: attributes.clone(),
            })
            .collect())
    }
}
