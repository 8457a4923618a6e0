//! Two-tier key/value cache (pipeline-wide and per-host)
//!
//! A single `parking_lot::Mutex` guards each instance. Clones share the same
//! underlying map, so a cache can be handed to concurrent per-host workers.
//!
//! Values are stored type-erased; `get_must_*` accessors return `None` on a
//! type mismatch instead of panicking. [`CacheKey`] gives well-known keys a
//! static type while loosely-typed keys stay available through [`Cache::set`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{PipeError, Result};

/// Type-erased cache value
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// Thread-safe key/value store
#[derive(Clone, Default)]
pub struct Cache {
    inner: Arc<Mutex<HashMap<String, CacheValue>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous value for `key`
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.lock().insert(key.into(), Arc::new(value));
    }

    /// Get the raw value for `key`
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        self.inner.lock().get(key).cloned()
    }

    /// Get a clone of the value if it is stored as `T`
    pub fn get_as<T: Any + Clone>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        value.downcast_ref::<T>().cloned()
    }

    /// Get a string value (`String` or `&'static str`)
    pub fn get_must_string(&self, key: &str) -> Option<String> {
        let value = self.get(key)?;
        if let Some(s) = value.downcast_ref::<String>() {
            return Some(s.clone());
        }
        value.downcast_ref::<&'static str>().map(|s| s.to_string())
    }

    pub fn get_must_bool(&self, key: &str) -> Option<bool> {
        self.get_as::<bool>(key)
    }

    /// Get an integer value stored as any primitive integer that fits in i64
    pub fn get_must_int(&self, key: &str) -> Option<i64> {
        let value = self.get(key)?;
        let v = value.as_ref();
        if let Some(n) = v.downcast_ref::<i64>() {
            return Some(*n);
        }
        if let Some(n) = v.downcast_ref::<i32>() {
            return Some(i64::from(*n));
        }
        if let Some(n) = v.downcast_ref::<u32>() {
            return Some(i64::from(*n));
        }
        if let Some(n) = v.downcast_ref::<isize>() {
            return i64::try_from(*n).ok();
        }
        if let Some(n) = v.downcast_ref::<usize>() {
            return i64::try_from(*n).ok();
        }
        v.downcast_ref::<u64>().and_then(|n| i64::try_from(*n).ok())
    }

    /// Like `get_must_string`, but reports why the lookup failed
    pub fn require_string(&self, key: &str) -> Result<String> {
        if !self.contains_key(key) {
            return Err(PipeError::CacheMissing {
                key: key.to_string(),
            });
        }
        self.get_must_string(key)
            .ok_or_else(|| PipeError::CacheTypeMismatch {
                key: key.to_string(),
            })
    }

    /// Return the existing value, or insert `default` and return it
    ///
    /// The boolean is `true` when the key already existed. The check and the
    /// insert happen under one lock acquisition.
    pub fn get_or_set<T: Any + Send + Sync>(
        &self,
        key: impl Into<String>,
        default: T,
    ) -> (CacheValue, bool) {
        let mut map = self.inner.lock();
        let key = key.into();
        if let Some(existing) = map.get(&key) {
            return (Arc::clone(existing), true);
        }
        let value: CacheValue = Arc::new(default);
        map.insert(key, Arc::clone(&value));
        (value, false)
    }

    /// Remove `key`, returning the previous value
    pub fn delete(&self, key: &str) -> Option<CacheValue> {
        self.inner.lock().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Snapshot of the current keys (unordered)
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ═══════════════════════════════════════════
    // TYPED KEYS
    // ═══════════════════════════════════════════

    pub fn set_typed<T: Any + Send + Sync>(&self, key: &CacheKey<T>, value: T) {
        self.set(key.name, value);
    }

    pub fn get_typed<T: Any + Clone>(&self, key: &CacheKey<T>) -> Option<T> {
        self.get_as::<T>(key.name)
    }

    /// Typed lookup that distinguishes a missing key from a mistyped one
    pub fn require<T: Any + Clone>(&self, key: &CacheKey<T>) -> Result<T> {
        let value = self.get(key.name).ok_or_else(|| PipeError::CacheMissing {
            key: key.name.to_string(),
        })?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| PipeError::CacheTypeMismatch {
                key: key.name.to_string(),
            })
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache").field("len", &self.len()).finish()
    }
}

/// A cache key bound to a value type at compile time
///
/// ```rust,ignore
/// const KUBE_VERSION: CacheKey<String> = CacheKey::new("kube_version");
/// cache.set_typed(&KUBE_VERSION, "v1.29.0".to_string());
/// ```
pub struct CacheKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> CacheKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for CacheKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CacheKey<T> {}

impl<T> fmt::Debug for CacheKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.name)
    }
}
