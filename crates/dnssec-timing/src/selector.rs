use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::ConfigError;

/// Hands out resolvers in strict rotation: the k-th call gets
/// resolver `k mod n`.
#[derive(Debug)]
pub struct ResolverSelector {
    resolvers: Vec<SocketAddr>,
    next: AtomicUsize,
}

impl ResolverSelector {
    /// # Errors
    ///
    /// If there are no resolvers to choose from.
    pub fn new(resolvers: Vec<SocketAddr>) -> Result<Self, ConfigError> {
        if resolvers.is_empty() {
            return Err(ConfigError::NoResolvers);
        }

        Ok(Self {
            resolvers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn next(&self) -> SocketAddr {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.resolvers.len();
        self.resolvers[index]
    }
}
