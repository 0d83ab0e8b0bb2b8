//! Top-level application container.
//!
//! One `App` is constructed in `main` per invocation and passed by
//! reference into command handlers. It owns the subsystems that would
//! otherwise be process globals: the HTTP client, the cache manager, and
//! the masked-secrets set.

use std::sync::Arc;

use crate::cache::{CacheConfig, CacheManager};
use crate::client::HttpClient;
use crate::core::error::HcResult;
use crate::vars::mask::SecretMask;
use crate::vars::VariableResolver;

pub struct App {
    pub client: HttpClient,
    pub cache: Arc<CacheManager>,
    pub mask: Arc<SecretMask>,
}

impl App {
    pub fn new() -> HcResult<Self> {
        Self::with_cache_config(CacheConfig::default())
    }

    pub fn with_cache_config(cache_config: CacheConfig) -> HcResult<Self> {
        Ok(Self {
            client: HttpClient::new()?,
            cache: Arc::new(CacheManager::new(cache_config)),
            mask: Arc::new(SecretMask::new()),
        })
    }

    /// A fresh resolver sharing this invocation's mask set.
    pub fn resolver(&self) -> VariableResolver {
        VariableResolver::new(self.mask.clone())
    }

    /// Stop background work for clean shutdown.
    pub fn shutdown(&self) {
        self.cache.stop();
    }
}
