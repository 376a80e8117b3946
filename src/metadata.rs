//! Call metadata
//!
//! An ordered list of string key/value pairs attached to a call. Keys may
//! repeat; access is by position.

use crate::error::IndexOutOfRange;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};

/// Ordered, immutable multi-map of string keys to string values
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    entries: SmallVec<[(String, String); 4]>,
}

impl Metadata {
    /// Empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of (key, value) pairs, counting repeated keys
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key of the i-th pair
    pub fn key(&self, index: usize) -> Result<&str, IndexOutOfRange> {
        self.entry(index).map(|(k, _)| k.as_str())
    }

    /// Value of the i-th pair
    pub fn value(&self, index: usize) -> Result<&str, IndexOutOfRange> {
        self.entry(index).map(|(_, v)| v.as_str())
    }

    /// First value stored under `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn entry(&self, index: usize) -> Result<&(String, String), IndexOutOfRange> {
        self.entries.get(index).ok_or(IndexOutOfRange {
            index,
            count: self.entries.len(),
        })
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl<K, V> From<HashMap<K, V>> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(map: HashMap<K, V>) -> Self {
        map.into_iter().collect()
    }
}

impl<K, V> From<BTreeMap<K, V>> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(map: BTreeMap<K, V>) -> Self {
        map.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_mapping() {
        let mapping: HashMap<&str, &str> =
            [("x", "xylophone"), ("y", "yu"), ("z", "zither")].into();
        let metadata = Metadata::from(mapping.clone());

        assert_eq!(metadata.count(), mapping.len());
        for i in 0..metadata.count() {
            let key = metadata.key(i).unwrap();
            assert_eq!(metadata.value(i).unwrap(), mapping[key]);
        }
    }

    #[test]
    fn test_order_and_duplicates() {
        let metadata: Metadata = vec![("b", "1"), ("a", "2"), ("b", "3")].into_iter().collect();

        assert_eq!(metadata.count(), 3);
        assert_eq!(metadata.key(0).unwrap(), "b");
        assert_eq!(metadata.key(1).unwrap(), "a");
        assert_eq!(metadata.value(2).unwrap(), "3");
        assert_eq!(metadata.get("b"), Some("1"));
        assert_eq!(metadata.get("c"), None);
    }

    #[test]
    fn test_index_out_of_range() {
        let metadata = Metadata::from([("k", "v")]);

        assert_eq!(
            metadata.key(1),
            Err(IndexOutOfRange { index: 1, count: 1 })
        );
        assert!(metadata.value(5).is_err());
        assert!(Metadata::new().key(0).is_err());
    }

    #[test]
    fn test_btree_order_is_sorted() {
        let map: BTreeMap<String, String> = [("2", "two"), ("0", "zero"), ("1", "one")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let metadata = Metadata::from(map);

        let keys: Vec<&str> = metadata.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["0", "1", "2"]);
    }
}
