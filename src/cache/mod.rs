//! Namespaced persistent cache.
//!
//! Each namespace persists to `<base_dir>/<namespace>.json` as a JSON object
//! `{key: {value, createdAt, ttlMs}}`. Writes go through a temp file and a
//! rename so readers never observe a torn file. Expired entries disappear
//! lazily on access and in a periodic background sweep. Cache failures are
//! never fatal: a corrupt or unreadable file degrades to an empty namespace.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub base_dir: PathBuf,
    pub default_ttl_ms: u64,
    pub max_entries_per_namespace: usize,
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let base_dir = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("httpcraft")
            .join("cache");
        Self {
            base_dir,
            default_ttl_ms: 60 * 60 * 1000,
            max_entries_per_namespace: 1000,
            cleanup_interval_ms: 10 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    value: JsonValue,
    created_at: u64,
    ttl_ms: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: u64) -> bool {
        now >= self.created_at.saturating_add(self.ttl_ms)
    }
}

#[derive(Default)]
struct Namespace {
    entries: HashMap<String, CacheEntry>,
    loaded: bool,
}

/// Per-namespace entry counts for `cache stats`.
#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub namespaces: Vec<NamespaceStats>,
}

#[derive(Debug, Serialize)]
pub struct NamespaceStats {
    pub name: String,
    pub entries: usize,
}

/// Disk-backed key-value store shared across the invocation.
///
/// All namespace operations go through one async mutex, which serializes
/// them as required and keeps load/mutate/persist sequences atomic with
/// respect to each other.
pub struct CacheManager {
    config: CacheConfig,
    namespaces: Mutex<HashMap<String, Namespace>>,
    cleanup_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn sanitize_namespace(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            namespaces: Mutex::new(HashMap::new()),
            cleanup_task: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn file_path(&self, namespace: &str) -> PathBuf {
        self.config
            .base_dir
            .join(format!("{}.json", sanitize_namespace(namespace)))
    }

    async fn load_namespace(&self, namespace: &str) -> Namespace {
        let path = self.file_path(namespace);
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, CacheEntry>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!(
                        "cache namespace '{namespace}' is corrupt ({e}); starting empty"
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Namespace {
            entries,
            loaded: true,
        }
    }

    async fn persist_namespace(&self, namespace: &str, entries: &HashMap<String, CacheEntry>) {
        if let Err(e) = tokio::fs::create_dir_all(&self.config.base_dir).await {
            log::warn!("unable to create cache directory: {e}");
            return;
        }
        let path = self.file_path(namespace);
        let tmp = path.with_extension("json.tmp");
        let payload = match serde_json::to_vec(entries) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("unable to serialize cache namespace '{namespace}': {e}");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&tmp, payload).await {
            log::warn!("unable to write cache namespace '{namespace}': {e}");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            log::warn!("unable to persist cache namespace '{namespace}': {e}");
        }
    }

    async fn ensure_loaded<'a>(
        &self,
        map: &'a mut HashMap<String, Namespace>,
        namespace: &str,
    ) -> &'a mut Namespace {
        if !map.get(namespace).map(|ns| ns.loaded).unwrap_or(false) {
            let loaded = self.load_namespace(namespace).await;
            map.insert(namespace.to_string(), loaded);
        }
        map.get_mut(namespace).unwrap()
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Option<JsonValue> {
        let namespace = &sanitize_namespace(namespace);
        let mut map = self.namespaces.lock().await;
        let ns = self.ensure_loaded(&mut map, namespace).await;
        let now = now_ms();
        match ns.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }

        // Expired: remove lazily and persist the shrunken namespace.
        ns.entries.remove(key);
        let entries = ns.entries.clone();
        drop(map);
        self.persist_namespace(namespace, &entries).await;
        None
    }

    pub async fn set(&self, namespace: &str, key: &str, value: JsonValue, ttl_ms: Option<u64>) {
        let namespace = &sanitize_namespace(namespace);
        let mut map = self.namespaces.lock().await;
        let ns = self.ensure_loaded(&mut map, namespace).await;
        let now = now_ms();

        // A new key past the cap evicts the single oldest entry; updating an
        // existing key never evicts.
        if !ns.entries.contains_key(key)
            && ns.entries.len() >= self.config.max_entries_per_namespace
        {
            if let Some(oldest) = ns
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(k, _)| k.clone())
            {
                log::debug!("cache namespace '{namespace}' full; evicting '{oldest}'");
                ns.entries.remove(&oldest);
            }
        }

        ns.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                ttl_ms: ttl_ms.unwrap_or(self.config.default_ttl_ms),
            },
        );
        let entries = ns.entries.clone();
        drop(map);
        self.persist_namespace(namespace, &entries).await;
    }

    pub async fn has(&self, namespace: &str, key: &str) -> bool {
        self.get(namespace, key).await.is_some()
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> bool {
        let namespace = &sanitize_namespace(namespace);
        let mut map = self.namespaces.lock().await;
        let ns = self.ensure_loaded(&mut map, namespace).await;
        let removed = ns.entries.remove(key).is_some();
        if removed {
            let entries = ns.entries.clone();
            drop(map);
            self.persist_namespace(namespace, &entries).await;
        }
        removed
    }

    pub async fn clear(&self, namespace: &str) {
        let namespace = &sanitize_namespace(namespace);
        let mut map = self.namespaces.lock().await;
        let ns = self.ensure_loaded(&mut map, namespace).await;
        ns.entries.clear();
        drop(map);
        self.persist_namespace(namespace, &HashMap::new()).await;
    }

    pub async fn clear_all(&self) {
        let mut map = self.namespaces.lock().await;
        map.clear();
        drop(map);
        if let Ok(mut dir) = tokio::fs::read_dir(&self.config.base_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
    }

    pub async fn keys(&self, namespace: &str) -> Vec<String> {
        let namespace = &sanitize_namespace(namespace);
        let mut map = self.namespaces.lock().await;
        let ns = self.ensure_loaded(&mut map, namespace).await;
        let now = now_ms();
        ns.entries.retain(|_, entry| !entry.is_expired(now));
        let mut keys: Vec<String> = ns.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn size(&self, namespace: &str) -> usize {
        self.keys(namespace).await.len()
    }

    /// Known namespaces: everything loaded in memory plus every `.json`
    /// file in the cache directory.
    pub async fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = {
            let map = self.namespaces.lock().await;
            map.keys().cloned().collect()
        };
        if let Ok(mut dir) = tokio::fs::read_dir(&self.config.base_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        if !names.iter().any(|n| n == stem) {
                            names.push(stem.to_string());
                        }
                    }
                }
            }
        }
        names.sort();
        names
    }

    pub async fn stats(&self) -> CacheStats {
        let mut namespaces = Vec::new();
        let mut total = 0;
        for name in self.namespaces().await {
            let entries = self.size(&name).await;
            total += entries;
            namespaces.push(NamespaceStats { name, entries });
        }
        CacheStats {
            total_entries: total,
            namespaces,
        }
    }

    /// Remove every expired entry from every known namespace.
    pub async fn cleanup(&self) {
        for name in self.namespaces().await {
            let mut map = self.namespaces.lock().await;
            let ns = self.ensure_loaded(&mut map, &name).await;
            let now = now_ms();
            let before = ns.entries.len();
            ns.entries.retain(|_, entry| !entry.is_expired(now));
            let changed = ns.entries.len() != before;
            let entries = ns.entries.clone();
            drop(map);
            if changed {
                self.persist_namespace(&name, &entries).await;
            }
        }
    }

    /// Start the periodic cleanup sweep. Holds only a weak reference so a
    /// dropped manager stops its own task.
    pub fn spawn_cleanup(manager: &Arc<CacheManager>) {
        let weak = Arc::downgrade(manager);
        let interval = Duration::from_millis(manager.config.cleanup_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.cleanup().await;
            }
        });
        *manager.cleanup_task.lock().unwrap() = Some(handle);
    }

    /// Stop the cleanup timer for clean shutdown.
    pub fn stop(&self) {
        if let Some(handle) = self.cleanup_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Namespace-bound facade handed to plugins.
    pub fn plugin_cache(manager: &Arc<CacheManager>, plugin_name: &str) -> PluginCache {
        PluginCache {
            manager: manager.clone(),
            namespace: format!("plugin:{plugin_name}"),
        }
    }
}

/// A cache view bound to one plugin's namespace.
#[derive(Clone)]
pub struct PluginCache {
    manager: Arc<CacheManager>,
    namespace: String,
}

impl PluginCache {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn get(&self, key: &str) -> Option<JsonValue> {
        self.manager.get(&self.namespace, key).await
    }

    pub async fn set(&self, key: &str, value: JsonValue, ttl_ms: Option<u64>) {
        self.manager.set(&self.namespace, key, value, ttl_ms).await
    }

    pub async fn has(&self, key: &str) -> bool {
        self.manager.has(&self.namespace, key).await
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.manager.delete(&self.namespace, key).await
    }

    pub async fn clear(&self) {
        self.manager.clear(&self.namespace).await
    }

    pub async fn keys(&self) -> Vec<String> {
        self.manager.keys(&self.namespace).await
    }

    pub async fn size(&self) -> usize {
        self.manager.size(&self.namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager_in(dir: &std::path::Path, max_entries: usize, default_ttl_ms: u64) -> CacheManager {
        CacheManager::new(CacheConfig {
            base_dir: dir.to_path_buf(),
            default_ttl_ms,
            max_entries_per_namespace: max_entries,
            cleanup_interval_ms: 60_000,
        })
    }

    #[tokio::test]
    async fn set_get_roundtrip_and_ttl_expiry() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = manager_in(tmp.path(), 100, 1000);

        cache.set("ns", "short", json!("v"), Some(50)).await;
        cache.set("ns", "long", json!({"n": 1}), None).await;
        assert_eq!(cache.get("ns", "short").await, Some(json!("v")));
        assert!(cache.has("ns", "long").await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("ns", "short").await, None);
        assert!(cache.has("ns", "long").await);
        assert_eq!(cache.keys("ns").await, vec!["long".to_string()]);
    }

    #[tokio::test]
    async fn eviction_drops_earliest_inserted_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = manager_in(tmp.path(), 5, 60_000);

        for i in 0..6 {
            cache.set("ns", &format!("k{i}"), json!(i), None).await;
            // Distinct createdAt values keep eviction order deterministic.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(cache.size("ns").await, 5);
        assert!(!cache.has("ns", "k0").await);
        assert!(cache.has("ns", "k5").await);
    }

    #[tokio::test]
    async fn updating_an_existing_key_never_evicts() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = manager_in(tmp.path(), 3, 60_000);

        for i in 0..3 {
            cache.set("ns", &format!("k{i}"), json!(i), None).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        cache.set("ns", "k1", json!("updated"), None).await;

        assert_eq!(cache.size("ns").await, 3);
        assert!(cache.has("ns", "k0").await);
        assert_eq!(cache.get("ns", "k1").await, Some(json!("updated")));
    }

    #[tokio::test]
    async fn persists_across_manager_instances() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let cache = manager_in(tmp.path(), 100, 60_000);
            cache.set("tokens", "a", json!("persisted"), None).await;
        }
        let cache = manager_in(tmp.path(), 100, 60_000);
        assert_eq!(cache.get("tokens", "a").await, Some(json!("persisted")));
    }

    #[tokio::test]
    async fn corrupt_namespace_file_degrades_to_empty() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("bad.json"), b"{not json").unwrap();
        let cache = manager_in(tmp.path(), 100, 60_000);
        assert_eq!(cache.get("bad", "k").await, None);
        assert_eq!(cache.size("bad").await, 0);
    }

    #[tokio::test]
    async fn delete_clear_and_stats() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(manager_in(tmp.path(), 100, 60_000));

        cache.set("a", "k1", json!(1), None).await;
        cache.set("a", "k2", json!(2), None).await;
        cache.set("b", "k1", json!(3), None).await;

        assert!(cache.delete("a", "k1").await);
        assert!(!cache.delete("a", "k1").await);

        let stats = cache.stats().await;
        assert_eq!(stats.total_entries, 2);

        cache.clear("a").await;
        assert_eq!(cache.size("a").await, 0);
        assert_eq!(cache.size("b").await, 1);

        cache.clear_all().await;
        assert_eq!(cache.stats().await.total_entries, 0);
    }

    #[tokio::test]
    async fn plugin_cache_binds_its_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(manager_in(tmp.path(), 100, 60_000));
        let plugin_cache = CacheManager::plugin_cache(&cache, "oauth2");

        plugin_cache.set("token", json!("t"), None).await;
        assert_eq!(plugin_cache.get("token").await, Some(json!("t")));
        assert_eq!(cache.get("plugin:oauth2", "token").await, Some(json!("t")));
        assert_eq!(cache.get("plugin:other", "token").await, None);
    }

    #[tokio::test]
    async fn cleanup_sweeps_expired_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = manager_in(tmp.path(), 100, 60_000);
        cache.set("ns", "gone", json!(1), Some(10)).await;
        cache.set("ns", "kept", json!(2), Some(60_000)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.cleanup().await;

        let map = cache.namespaces.lock().await;
        let ns = map.get("ns").unwrap();
        assert!(!ns.entries.contains_key("gone"));
        assert!(ns.entries.contains_key("kept"));
    }
}
