// src/proxy/registry.rs
use super::backend::Backend;
use crate::error::ProxyError;
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, PoisonError};

/// Registered backends in registration order.
///
/// Readers load an immutable snapshot and never wait; writers copy the
/// list, modify it and swap it in while holding `write_lock`.
pub struct BackendRegistry {
    backends: ArcSwap<Vec<Arc<Backend>>>,
    write_lock: Mutex<()>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn add_backend(&self, backend: Backend) -> Result<Arc<Backend>, ProxyError> {
        backend.validate()?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.backends.load();
        if current.iter().any(|b| b.id == backend.id) {
            return Err(ProxyError::Duplicate(backend.id));
        }

        let backend = Arc::new(backend);
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(backend.clone());
        self.backends.store(Arc::new(next));

        tracing::info!(backend = %backend.id, url = %backend.url, "Added backend");
        Ok(backend)
    }

    pub fn remove_backend(&self, id: &str) -> Result<Arc<Backend>, ProxyError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.backends.load();
        let position = current
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| ProxyError::NotFound(id.to_string()))?;

        let mut next: Vec<Arc<Backend>> = current.iter().cloned().collect();
        let removed = next.remove(position);
        self.backends.store(Arc::new(next));

        tracing::info!(backend = %id, "Removed backend");
        Ok(removed)
    }

    pub fn get_backend(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.load().iter().find(|b| b.id == id).cloned()
    }

    /// Snapshot in registration order.
    pub fn list_backends(&self) -> Vec<Arc<Backend>> {
        (**self.backends.load()).clone()
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<(), ProxyError> {
        let backend = self
            .get_backend(id)
            .ok_or_else(|| ProxyError::NotFound(id.to_string()))?;
        backend.set_active(active);
        tracing::info!(backend = %id, active, "Backend activity changed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn backend(id: &str) -> Backend {
        Backend::new(id, Url::parse("http://127.0.0.1:9000").unwrap())
    }

    #[test]
    fn test_add_list_preserves_registration_order() {
        let registry = BackendRegistry::new();
        for id in ["c", "a", "b"] {
            registry.add_backend(backend(id)).unwrap();
        }
        let ids: Vec<_> = registry.list_backends().iter().map(|b| b.id.clone()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_add_rejects_invalid_and_duplicate() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.add_backend(backend("")),
            Err(ProxyError::Configuration(_))
        ));

        registry.add_backend(backend("a")).unwrap();
        assert!(matches!(
            registry.add_backend(backend("a")),
            Err(ProxyError::Duplicate(id)) if id == "a"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.remove_backend("ghost"),
            Err(ProxyError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_and_get() {
        let registry = BackendRegistry::new();
        registry.add_backend(backend("a")).unwrap();
        registry.add_backend(backend("b")).unwrap();

        let removed = registry.remove_backend("a").unwrap();
        assert_eq!(removed.id, "a");
        assert!(registry.get_backend("a").is_none());
        assert!(registry.get_backend("b").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_writes() {
        let registry = BackendRegistry::new();
        registry.add_backend(backend("a")).unwrap();
        let snapshot = registry.list_backends();
        registry.add_backend(backend("b")).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.list_backends().len(), 2);
    }

    #[test]
    fn test_set_active() {
        let registry = BackendRegistry::new();
        registry.add_backend(backend("a")).unwrap();
        registry.set_active("a", false).unwrap();
        assert!(!registry.get_backend("a").unwrap().is_active());
        assert!(registry.set_active("zzz", true).is_err());
    }
}
