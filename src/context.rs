//! Immutable key/value context exposed to producers.
//!
//! A subscriber may carry a [`Context`]; processors surface the context of
//! their first subscriber through [`Sink::current_context`](crate::Sink::current_context).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Context {
    entries: Arc<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

impl Context {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a new context with `key` bound to `value`. `self` is unchanged.
    pub fn put<V>(&self, key: &'static str, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        let mut entries = HashMap::clone(&self.entries);
        entries.insert(key, Arc::new(value));
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.entries.get(key)?.downcast_ref::<V>()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_does_not_mutate_original() {
        let base = Context::empty();
        let with_id = base.put("request_id", 42u32);

        assert!(base.is_empty());
        assert_eq!(with_id.len(), 1);
        assert_eq!(with_id.get::<u32>("request_id"), Some(&42));
    }

    #[test]
    fn test_get_with_wrong_type_is_none() {
        let ctx = Context::empty().put("tenant", "acme".to_string());
        assert!(ctx.contains_key("tenant"));
        assert!(ctx.get::<u32>("tenant").is_none());
        assert_eq!(ctx.get::<String>("tenant").map(String::as_str), Some("acme"));
    }
}
