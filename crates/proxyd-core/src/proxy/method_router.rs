use super::errors::ProxyError;
use crate::backend::BackendGroup;
use ahash::AHashMap;
use std::sync::Arc;

/// Maps whitelisted JSON-RPC methods to the backend group serving them.
///
/// A method absent from the map is not whitelisted.
#[derive(Debug, Default, Clone)]
pub struct MethodRouter {
    routes: AHashMap<String, Arc<BackendGroup>>,
}

impl MethodRouter {
    #[must_use]
    pub fn new(routes: AHashMap<String, Arc<BackendGroup>>) -> Self {
        Self { routes }
    }

    /// # Errors
    ///
    /// Returns [`ProxyError::MethodNotWhitelisted`] for unmapped methods.
    pub fn group_for(&self, method: &str) -> Result<&Arc<BackendGroup>, ProxyError> {
        self.routes.get(method).ok_or(ProxyError::MethodNotWhitelisted)
    }
}
