//! Request metadata.

use std::collections::HashMap;
use std::collections::hash_map;

/// Case-insensitive string map carried with every request.
///
/// Keys are stored in canonical header form (`x-trace-id` becomes
/// `X-Trace-Id`) so that lookups ignore case and the wire form is stable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata(HashMap<String, String>);

fn canonical(key: &str) -> String {
    key.split('-')
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
            })
        })
        .collect::<Vec<_>>()
        .join("-")
}

impl Metadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, returning the previous one.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> Option<String> {
        self.0.insert(canonical(key), value.into())
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&canonical(key)).map(String::as_str)
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&canonical(key))
    }

    /// Copy every entry of `other` into `self`, overwriting on conflict.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Iterate over canonical keys and values.
    pub fn iter(&self) -> hash_map::Iter<'_, String, String> {
        self.0.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = (&'a String, &'a String);
    type IntoIter = hash_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Self::new();
        for (key, value) in iter {
            metadata.insert(key.as_ref(), value);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut metadata = Metadata::new();
        metadata.insert("x-trace-id", "abc");

        assert_eq!(metadata.get("X-TRACE-ID"), Some("abc"));
        assert_eq!(metadata.iter().next().unwrap().0, "X-Trace-Id");

        metadata.insert("X-Trace-Id", "def");
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.remove("x-TRACE-id").as_deref(), Some("def"));
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base: Metadata = [("user", "ada"), ("zone", "eu")].into_iter().collect();
        let other: Metadata = [("zone", "us")].into_iter().collect();

        base.merge(&other);
        assert_eq!(base.get("zone"), Some("us"));
        assert_eq!(base.get("user"), Some("ada"));
    }
}
