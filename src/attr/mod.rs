//! Interned keys and per-connection attribute storage.
//!
//! [`UniqueKey::new`] returns the same interned key for the same
//! `(group, name)`, with ids assigned per group in registration order. Ids
//! are indices for this process only.
//!
//! [`AttributeMap`] keeps `(key, value)` pairs sorted by key id behind a
//! reader-writer lock; [`AttrKey`] adds the value type.

use std::{
    any::Any,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::{Arc, LazyLock, PoisonError, RwLock},
};

use dashmap::DashMap;

struct KeyData {
    id: u32,
    name: String,
    group: String,
}

/// An interned `(id, name, group)` triple.
///
/// Equality is identity of the interned instance.
#[derive(Clone)]
pub struct UniqueKey(Arc<KeyData>);

#[derive(Default)]
struct Registry {
    keys: DashMap<(String, String), UniqueKey>,
    next_ids: DashMap<String, u32>,
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::default);

impl UniqueKey {
    /// Intern `(group, name)`.
    #[must_use]
    pub fn new(group: &str, name: &str) -> Self {
        if let Some(key) = REGISTRY.keys.get(&(group.to_owned(), name.to_owned())) {
            return key.clone();
        }
        REGISTRY
            .keys
            .entry((group.to_owned(), name.to_owned()))
            .or_insert_with(|| {
                let mut next = REGISTRY.next_ids.entry(group.to_owned()).or_insert(0);
                let id = *next;
                *next += 1;
                Self(Arc::new(KeyData {
                    id,
                    name: name.to_owned(),
                    group: group.to_owned(),
                }))
            })
            .clone()
    }

    /// Per-group id.
    #[must_use]
    pub fn id(&self) -> u32 { self.0.id }

    /// Key name.
    #[must_use]
    pub fn name(&self) -> &str { &self.0.name }

    /// Key group.
    #[must_use]
    pub fn group(&self) -> &str { &self.0.group }

    fn order(&self) -> (u32, &str) { (self.0.id, &self.0.group) }

    /// Forget every interned key so ids restart at zero.
    ///
    /// Keys already handed out keep their ids; only use between tests.
    #[doc(hidden)]
    pub fn reset_registry() {
        REGISTRY.keys.clear();
        REGISTRY.next_ids.clear();
    }
}

impl PartialEq for UniqueKey {
    fn eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }
}

impl Eq for UniqueKey {}

impl Hash for UniqueKey {
    fn hash<H: Hasher>(&self, state: &mut H) { self.order().hash(state); }
}

impl fmt::Debug for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.0.group, self.0.name, self.0.id)
    }
}

/// A [`UniqueKey`] tagged with the type of value it stores.
pub struct AttrKey<T> {
    key: UniqueKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttrKey<T> {
    /// Intern `(group, name)` for values of type `T`.
    #[must_use]
    pub fn new(group: &str, name: &str) -> Self {
        Self {
            key: UniqueKey::new(group, name),
            _marker: PhantomData,
        }
    }

    /// The untyped key.
    #[must_use]
    pub fn key(&self) -> &UniqueKey { &self.key }
}

impl<T> Clone for AttrKey<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AttrKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.key.fmt(f) }
}

type Value = Arc<dyn Any + Send + Sync>;

/// Sorted vector of attributes guarded by a reader-writer lock.
#[derive(Default)]
pub struct AttributeMap {
    entries: RwLock<Vec<(UniqueKey, Value)>>,
}

fn search(entries: &[(UniqueKey, Value)], key: &UniqueKey) -> Result<usize, usize> {
    entries.binary_search_by(|(k, _)| k.order().cmp(&key.order()))
}

impl AttributeMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Value stored under `key`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &AttrKey<T>) -> Option<Arc<T>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let idx = search(&entries, &key.key).ok()?;
        Arc::clone(&entries[idx].1).downcast::<T>().ok()
    }

    /// Store `value`, returning the previous value if any.
    pub fn set<T: Any + Send + Sync>(&self, key: &AttrKey<T>, value: T) -> Option<Arc<T>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let value: Value = Arc::new(value);
        match search(&entries, &key.key) {
            Ok(idx) => {
                let old = std::mem::replace(&mut entries[idx].1, value);
                old.downcast::<T>().ok()
            }
            Err(idx) => {
                entries.insert(idx, (key.key.clone(), value));
                None
            }
        }
    }

    /// Remove and return the value under `key`.
    pub fn remove<T: Any + Send + Sync>(&self, key: &AttrKey<T>) -> Option<Arc<T>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let idx = search(&entries, &key.key).ok()?;
        entries.remove(idx).1.downcast::<T>().ok()
    }

    /// Value under `key`, creating it with `create` if absent.
    ///
    /// Looks up under the read lock first; `create` runs under the write lock
    /// after a second lookup, so concurrent callers see exactly one creation.
    pub fn get_or_create<T: Any + Send + Sync>(
        &self,
        key: &AttrKey<T>,
        create: impl FnOnce() -> T,
    ) -> Arc<T> {
        if let Some(value) = self.get(key) {
            return value;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match search(&entries, &key.key) {
            Ok(idx) => {
                if let Ok(value) = Arc::clone(&entries[idx].1).downcast::<T>() {
                    return value;
                }
                let value = Arc::new(create());
                entries[idx].1 = Arc::clone(&value) as Value;
                value
            }
            Err(idx) => {
                let value = Arc::new(create());
                entries.insert(idx, (key.key.clone(), Arc::clone(&value) as Value));
                value
            }
        }
    }

    /// Number of stored attributes.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.read().unwrap_or_else(PoisonError::into_inner).len() }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Remove every attribute.
    pub fn clear(&self) { self.entries.write().unwrap_or_else(PoisonError::into_inner).clear(); }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_list().entries(entries.iter().map(|(k, _)| k)).finish()
    }
}

#[cfg(test)]
mod tests;
