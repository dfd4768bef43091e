//! Ordered multi-value header map.

use std::fmt;

/// Sorted `(key, values)` pairs.
///
/// Keys compare byte-wise and case-sensitively; protocol codecs canonicalise
/// keys before inserting. Iteration follows key order so encoded headers
/// are deterministic.
///
/// ```
/// use kgnet::packet::HeaderMap;
///
/// let mut h = HeaderMap::new();
/// h.add("b", "2");
/// h.add("a", "1");
/// h.add("b", "3");
/// assert_eq!(h.get("b"), Some("2"));
/// assert_eq!(h.get_all("b"), ["2", "3"]);
/// assert_eq!(h.keys().collect::<Vec<_>>(), ["a", "b"]);
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn find(&self, key: &str) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_str().cmp(key))
    }

    /// Append `value` to the values of `key`.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        match self.find(&key) {
            Ok(idx) => self.entries[idx].1.push(value.into()),
            Err(idx) => self.entries.insert(idx, (key, vec![value.into()])),
        }
    }

    /// Replace every value of `key` with `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set_all(key, vec![value.into()]);
    }

    /// Replace every value of `key` with `values`. An empty list removes it.
    pub fn set_all(&mut self, key: impl Into<String>, values: Vec<String>) {
        let key = key.into();
        match (self.find(&key), values.is_empty()) {
            (Ok(idx), true) => {
                self.entries.remove(idx);
            }
            (Ok(idx), false) => self.entries[idx].1 = values,
            (Err(_), true) => {}
            (Err(idx), false) => self.entries.insert(idx, (key, values)),
        }
    }

    /// Remove `key`, returning its values.
    pub fn del(&mut self, key: &str) -> Option<Vec<String>> {
        let idx = self.find(key).ok()?;
        Some(self.entries.remove(idx).1)
    }

    /// First value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// Every value of `key`, empty if absent.
    #[must_use]
    pub fn get_all(&self, key: &str) -> &[String] {
        match self.find(key) {
            Ok(idx) => &self.entries[idx].1,
            Err(_) => &[],
        }
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool { self.find(key).is_ok() }

    /// Copy every key of `other` into `self`, replacing existing values.
    pub fn merge(&mut self, other: &Self) {
        for (key, values) in &other.entries {
            self.set_all(key.clone(), values.clone());
        }
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> { self.entries.iter().map(|(k, _)| k.as_str()) }

    /// `(key, values)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether the map has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Remove every key.
    pub fn clear(&mut self) { self.entries.clear(); }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.add(k, v);
        }
        map
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for HeaderMap {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.add(k, v);
        }
    }
}

impl fmt::Debug for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
