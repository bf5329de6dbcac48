//! Tagged key/value containers.
//!
//! Information maps back three different surfaces with one shape: option
//! bags passed to constructors, information payloads delivered with events
//! and catalog rows, and fixed-length lists of information maps. The kind
//! tag is set at creation and checked by consumers before use.

use std::any::Any;
use std::sync::Arc;

use crate::data::TensorsData;
use crate::error::{Result, ServiceError};

/// Discriminant of an information map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    /// Constructor parameters.
    Option,
    /// Read-only facts about a handle or an event.
    Information,
    /// Fixed-length sequence of information maps.
    InformationList,
}

/// An owned value slot. Dropping the map (or overwriting a key) releases
/// the value exactly once.
#[derive(Clone)]
pub enum InfoValue {
    Text(String),
    Bytes(Vec<u8>),
    Tensors(TensorsData),
    /// Opaque payload handed through to the consumer untouched.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for InfoValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InfoValue::Text(s) => f.debug_tuple("Text").field(s).finish(),
            InfoValue::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            InfoValue::Tensors(t) => f.debug_tuple("Tensors").field(&t.count()).finish(),
            InfoValue::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

impl InfoValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            InfoValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tensors(&self) -> Option<&TensorsData> {
        match self {
            InfoValue::Tensors(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            InfoValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for InfoValue {
    fn from(s: &str) -> Self {
        InfoValue::Text(s.to_string())
    }
}

impl From<String> for InfoValue {
    fn from(s: String) -> Self {
        InfoValue::Text(s)
    }
}

impl From<TensorsData> for InfoValue {
    fn from(t: TensorsData) -> Self {
        InfoValue::Tensors(t)
    }
}

/// Ordered map with unique keys and a kind tag.
#[derive(Debug, Clone)]
pub struct InformationMap {
    kind: InfoKind,
    entries: Vec<(String, InfoValue)>,
}

impl InformationMap {
    pub fn options() -> Self {
        Self {
            kind: InfoKind::Option,
            entries: Vec::new(),
        }
    }

    pub fn information() -> Self {
        Self {
            kind: InfoKind::Information,
            entries: Vec::new(),
        }
    }

    pub fn kind(&self) -> InfoKind {
        self.kind
    }

    /// Reject a map of the wrong variant before using it.
    pub fn expect_kind(&self, kind: InfoKind) -> Result<()> {
        if self.kind != kind {
            return Err(ServiceError::invalid(format!(
                "expected {kind:?} map, got {:?}",
                self.kind
            )));
        }
        Ok(())
    }

    /// Insert or replace. Replacing drops the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<InfoValue>) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(ServiceError::invalid("information key must not be empty"));
        }
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&InfoValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(InfoValue::as_text)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &InfoValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Fixed-length ordered sequence of information maps.
#[derive(Debug, Clone)]
pub struct InformationList {
    items: Vec<InformationMap>,
}

impl InformationList {
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(ServiceError::invalid(
                "information list length must be positive",
            ));
        }
        Ok(Self {
            items: (0..len).map(|_| InformationMap::information()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&InformationMap> {
        self.items.get(index).ok_or_else(|| {
            ServiceError::invalid(format!(
                "list index {index} is out of range (length: {})",
                self.items.len()
            ))
        })
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut InformationMap> {
        let len = self.items.len();
        self.items
            .get_mut(index)
            .ok_or_else(|| ServiceError::invalid(format!("list index {index} is out of range (length: {len})")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins_and_releases_prior_value() {
        let marker: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        let observer = Arc::downgrade(&marker);

        let mut map = InformationMap::information();
        map.set("k", InfoValue::Opaque(marker)).unwrap();
        assert_eq!(observer.strong_count(), 1);

        map.set("k", "second").unwrap();
        assert_eq!(observer.strong_count(), 0);
        assert_eq!(map.get_text("k"), Some("second"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn kind_check() {
        let map = InformationMap::options();
        assert!(map.expect_kind(InfoKind::Option).is_ok());
        assert!(map.expect_kind(InfoKind::Information).is_err());
    }

    #[test]
    fn list_has_fixed_positive_length() {
        assert!(InformationList::new(0).is_err());
        let list = InformationList::new(3).unwrap();
        assert_eq!(list.len(), 3);
        assert!(list.get(3).is_err());
        assert_eq!(list.get(1).unwrap().kind(), InfoKind::Information);
    }

    #[test]
    fn empty_key_is_rejected() {
        let mut map = InformationMap::options();
        assert!(map.set("", "v").is_err());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut map = InformationMap::information();
        map.set("b", "1").unwrap();
        map.set("a", "2").unwrap();
        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["b", "a"]);
    }
}
