//! Path-token authentication shared by the HTTP and WebSocket listeners.
//!
//! Clients authenticate with a token in the URL path (`POST /{authorization}`). The token
//! resolves to a client key through the `[authentication]` table. With an empty table
//! authentication is disabled and any path token is treated as an unknown route.

use ahash::AHashMap;
use axum::http::StatusCode;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Token to client key lookup.
#[derive(Debug, Default, Clone)]
pub struct AuthTable {
    keys: AHashMap<String, Arc<str>>,
}

impl AuthTable {
    #[must_use]
    pub fn new(tokens: &BTreeMap<String, String>) -> Self {
        let keys = tokens.iter().map(|(token, key)| (token.clone(), Arc::from(key.as_str()))).collect();
        Self { keys }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Resolves the path token of a request to the client key to attach to its context.
    ///
    /// # Errors
    ///
    /// Returns [`StatusCode::NOT_FOUND`] when a token is given but authentication is disabled,
    /// and [`StatusCode::UNAUTHORIZED`] when authentication is enabled and the token is
    /// missing or unknown.
    pub fn authorize(&self, token: Option<&str>) -> Result<Option<Arc<str>>, StatusCode> {
        let token = token.filter(|t| !t.is_empty());

        if !self.is_enabled() {
            return match token {
                Some(_) => Err(StatusCode::NOT_FOUND),
                None => Ok(None),
            };
        }

        let Some(token) = token else {
            debug!("missing authorization token");
            return Err(StatusCode::UNAUTHORIZED);
        };

        match self.keys.get(token) {
            Some(key) => Ok(Some(Arc::clone(key))),
            None => {
                debug!("unknown authorization token");
                Err(StatusCode::UNAUTHORIZED)
            }
        }
    }
}

/// Extracts the token from a `/` or `/{authorization}` path.
///
/// Returns `None` for paths with more than one segment.
#[must_use]
pub fn path_token(path: &str) -> Option<Option<&str>> {
    let rest = path.strip_prefix('/')?;
    if rest.is_empty() {
        return Some(None);
    }
    if rest.contains('/') {
        return None;
    }
    Some(Some(rest))
}
