/// The live set of providers the gateway can route to. Providers are read from a JSON config
/// file, which can be watched for changes, and can also be added or patched over the management
/// API. Breaker and health state are keyed by provider name elsewhere, so a reload that keeps a
/// name keeps that history.
use crate::auth::KeySet;
use crate::circuit_breaker::BreakerConfig;
use crate::errors::GatewayError;
use crate::health::HealthConfig;
use crate::pool::PoolConfig;
use crate::provider::ProviderDescriptor;
use crate::routing::RoutingConfig;
use crate::supervisor::Supervisor;
use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    /// Bearer keys accepted on the completion routes. Empty means no auth.
    #[serde(default)]
    pub global_keys: KeySet,
    /// Bearer keys accepted on the management routes; `global_keys` are used when empty.
    #[serde(default)]
    pub admin_keys: KeySet,
}

/// The config file: providers in preference order plus tuning for every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl ConfigFile {
    pub async fn load(config_path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            anyhow!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            )
        })?;
        let config: ConfigFile = serde_json::from_str(&contents).map_err(|e| {
            anyhow!(
                "Failed to parse config file {}: {}",
                config_path.display(),
                e
            )
        })?;
        config
            .validate()
            .map_err(|e| anyhow!("Invalid config file {}: {}", config_path.display(), e))?;

        info!(
            "Loaded {} providers from {}",
            config.providers.len(),
            config_path.display()
        );
        Ok(config)
    }

    /// Check every provider and every tuning section.
    pub fn validate(&self) -> Result<(), GatewayError> {
        validate_all(&self.providers)?;
        self.routing.validate()?;
        self.pool.validate()?;
        self.breaker.validate()?;
        self.health.validate()
    }
}

fn validate_all(providers: &[ProviderDescriptor]) -> Result<(), GatewayError> {
    let mut seen = HashSet::new();
    for provider in providers {
        provider.validate()?;
        if !seen.insert(provider.name.as_str()) {
            return Err(GatewayError::InvalidConfig(format!(
                "provider `{}` is defined twice",
                provider.name
            )));
        }
    }
    Ok(())
}

struct Limiter {
    per_minute: NonZeroU32,
    limiter: DefaultDirectRateLimiter,
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("per_minute", &self.per_minute)
            .finish_non_exhaustive()
    }
}

/// Providers in configuration order, plus their per-minute limiters.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: RwLock<Vec<Arc<ProviderDescriptor>>>,
    limiters: DashMap<String, Arc<Limiter>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderDescriptor>) -> Result<Self, GatewayError> {
        let registry = Self::default();
        registry.replace_all(providers)?;
        Ok(registry)
    }

    /// A snapshot of every provider, in configuration order.
    pub fn list(&self) -> Vec<Arc<ProviderDescriptor>> {
        self.providers.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderDescriptor>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a provider at the end of the preference order.
    pub fn insert(
        &self,
        descriptor: ProviderDescriptor,
    ) -> Result<Arc<ProviderDescriptor>, GatewayError> {
        descriptor.validate()?;
        let mut providers = self.providers.write();
        if providers.iter().any(|p| p.name == descriptor.name) {
            return Err(GatewayError::ProviderExists(descriptor.name));
        }
        let descriptor = Arc::new(descriptor);
        self.sync_limiter(&descriptor);
        providers.push(Arc::clone(&descriptor));
        info!(provider = %descriptor.name, kind = %descriptor.kind, "Provider added");
        Ok(descriptor)
    }

    /// Merge the top-level fields of `patch` into the named provider. A full descriptor works as
    /// a replacement; the name always comes from `name`.
    pub fn update(&self, name: &str, patch: &Value) -> Result<Arc<ProviderDescriptor>, GatewayError> {
        let Value::Object(changes) = patch else {
            return Err(GatewayError::InvalidConfig(
                "provider update must be a JSON object".into(),
            ));
        };

        let mut providers = self.providers.write();
        let index = providers
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| GatewayError::UnknownProvider(name.to_string()))?;

        let mut merged = serde_json::to_value(providers[index].as_ref())
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
        if let Value::Object(fields) = &mut merged {
            for (field, value) in changes {
                fields.insert(field.clone(), value.clone());
            }
            fields.insert("name".into(), Value::String(name.to_string()));
        }
        let updated: ProviderDescriptor = serde_json::from_value(merged)
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
        updated.validate()?;

        let updated = Arc::new(updated);
        self.sync_limiter(&updated);
        providers[index] = Arc::clone(&updated);
        info!(provider = %name, fields = changes.len(), "Provider updated");
        Ok(updated)
    }

    /// Swap in a whole new provider list, returning the names that disappeared. Nothing changes
    /// if any descriptor is invalid.
    pub fn replace_all(
        &self,
        descriptors: Vec<ProviderDescriptor>,
    ) -> Result<Vec<String>, GatewayError> {
        validate_all(&descriptors)?;
        let incoming: Vec<Arc<ProviderDescriptor>> = descriptors.into_iter().map(Arc::new).collect();

        let mut providers = self.providers.write();
        let removed: Vec<String> = providers
            .iter()
            .filter(|old| !incoming.iter().any(|new| new.name == old.name))
            .map(|old| old.name.clone())
            .collect();
        for name in &removed {
            self.limiters.remove(name);
        }
        for descriptor in &incoming {
            self.sync_limiter(descriptor);
        }
        *providers = incoming;
        debug!(
            providers = providers.len(),
            removed = removed.len(),
            "Provider list replaced"
        );
        Ok(removed)
    }

    /// Take one permit from the provider's per-minute budget. Providers without a limit always
    /// have permits.
    pub fn try_acquire(&self, name: &str) -> bool {
        match self.limiters.get(name) {
            Some(limiter) => limiter.limiter.check().is_ok(),
            None => true,
        }
    }

    /// Keep an existing limiter when the limit is unchanged so its budget carries over.
    fn sync_limiter(&self, descriptor: &ProviderDescriptor) {
        let Some(per_minute) = descriptor.rate_limit_per_minute.and_then(NonZeroU32::new) else {
            self.limiters.remove(&descriptor.name);
            return;
        };
        if self
            .limiters
            .get(&descriptor.name)
            .is_some_and(|l| l.per_minute == per_minute)
        {
            return;
        }
        self.limiters.insert(
            descriptor.name.clone(),
            Arc::new(Limiter {
                per_minute,
                limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            }),
        );
    }
}

#[async_trait]
pub trait ConfigStream {
    /// Start producing config updates. Background work is spawned on `supervisor`.
    async fn receive(
        &self,
        supervisor: &Supervisor,
    ) -> Result<mpsc::Receiver<Result<ConfigFile, anyhow::Error>>, anyhow::Error>;
}

pub struct WatchedFile(pub PathBuf);

#[async_trait]
impl ConfigStream for WatchedFile {
    /// Watches the file and re-reads it whenever it is written or recreated.
    async fn receive(
        &self,
        supervisor: &Supervisor,
    ) -> Result<mpsc::Receiver<Result<ConfigFile, anyhow::Error>>, anyhow::Error> {
        let (config_tx, config_rx) = mpsc::channel(16);
        let (file_tx, mut file_rx) = mpsc::channel(16);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = file_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(&self.0, RecursiveMode::NonRecursive)?;

        let config_path = self.0.clone();
        supervisor.spawn("config-watcher", move |token| async move {
            // Dropping the watcher stops notifications.
            let _watcher = watcher;
            loop {
                let res = tokio::select! {
                    _ = token.cancelled() => break,
                    res = file_rx.recv() => match res {
                        Some(res) => res,
                        None => break,
                    },
                };
                let update = match res {
                    Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                        info!("Config file changed, reloading providers...");
                        ConfigFile::load(&config_path).await
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Watch error: {}", e);
                        Err(anyhow!("Watch error: {}", e))
                    }
                };
                if config_tx.send(update).await.is_err() {
                    break; // Receiver dropped
                }
            }
        });

        Ok(config_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ConstantTimeString;
    use crate::provider::{Capability, ProviderKind};
    use rstest::rstest;
    use serde_json::json;

    fn provider(name: &str, priority: u32) -> ProviderDescriptor {
        ProviderDescriptor::builder()
            .name(name)
            .endpoint(format!("https://{name}.test/v1").parse().unwrap())
            .priority(priority)
            .build()
    }

    fn names(registry: &ProviderRegistry) -> Vec<String> {
        registry.list().iter().map(|p| p.name.clone()).collect()
    }

    #[test]
    fn test_insert_rejects_duplicate_names() {
        let registry = ProviderRegistry::new(vec![provider("primary", 1)]).unwrap();
        let err = registry.insert(provider("primary", 5)).unwrap_err();
        assert!(matches!(err, GatewayError::ProviderExists(name) if name == "primary"));

        registry.insert(provider("secondary", 2)).unwrap();
        assert_eq!(names(&registry), ["primary", "secondary"]);
    }

    #[test]
    fn test_update_patches_fields_in_place() {
        let registry =
            ProviderRegistry::new(vec![provider("primary", 1), provider("secondary", 2)]).unwrap();

        let updated = registry
            .update(
                "primary",
                &json!({"priority": 50, "enabled": false, "capabilities": ["vision"]}),
            )
            .unwrap();
        assert_eq!(updated.priority, 50);
        assert!(!updated.enabled);
        assert_eq!(updated.capabilities, vec![Capability::Vision]);
        assert_eq!(
            updated.endpoint.as_ref().map(|u| u.as_str()),
            Some("https://primary.test/v1")
        );
        assert_eq!(names(&registry), ["primary", "secondary"]);
    }

    #[test]
    fn test_update_rejects_unknown_and_invalid() {
        let registry = ProviderRegistry::new(vec![provider("primary", 1)]).unwrap();
        assert!(matches!(
            registry.update("missing", &json!({"priority": 1})),
            Err(GatewayError::UnknownProvider(_))
        ));
        assert!(matches!(
            registry.update("primary", &json!({"timeout_ms": 0})),
            Err(GatewayError::InvalidConfig(_))
        ));
        assert!(matches!(
            registry.update("primary", &json!(["not", "an", "object"])),
            Err(GatewayError::InvalidConfig(_))
        ));
        assert_eq!(registry.get("primary").unwrap().timeout_ms, 60_000);
    }

    #[test]
    fn test_update_cannot_rename() {
        let registry = ProviderRegistry::new(vec![provider("primary", 1)]).unwrap();
        let updated = registry
            .update("primary", &json!({"name": "renamed"}))
            .unwrap();
        assert_eq!(updated.name, "primary");
        assert!(!registry.contains("renamed"));
    }

    #[test]
    fn test_replace_all_reports_removed_and_keeps_new_order() {
        let registry =
            ProviderRegistry::new(vec![provider("a", 1), provider("b", 1), provider("c", 1)])
                .unwrap();
        let removed = registry
            .replace_all(vec![provider("c", 1), provider("d", 1), provider("a", 1)])
            .unwrap();
        assert_eq!(removed, ["b"]);
        assert_eq!(names(&registry), ["c", "d", "a"]);
    }

    #[test]
    fn test_replace_all_is_atomic_on_invalid_input() {
        let registry = ProviderRegistry::new(vec![provider("a", 1)]).unwrap();
        let broken = ProviderDescriptor::builder()
            .name("mm")
            .kind(ProviderKind::Minimax)
            .build();
        assert!(registry.replace_all(vec![provider("b", 1), broken]).is_err());
        assert!(registry.replace_all(vec![provider("b", 1), provider("b", 2)]).is_err());
        assert_eq!(names(&registry), ["a"]);
    }

    #[test]
    fn test_per_minute_limit() {
        let mut limited = provider("limited", 1);
        limited.rate_limit_per_minute = Some(2);
        let registry = ProviderRegistry::new(vec![limited, provider("free", 1)]).unwrap();

        assert!(registry.try_acquire("limited"));
        assert!(registry.try_acquire("limited"));
        assert!(!registry.try_acquire("limited"));
        assert!((0..100).all(|_| registry.try_acquire("free")));

        // An unrelated patch keeps the exhausted budget; lifting the limit clears it.
        registry.update("limited", &json!({"priority": 3})).unwrap();
        assert!(!registry.try_acquire("limited"));
        registry
            .update("limited", &json!({"rate_limit_per_minute": null}))
            .unwrap();
        assert!(registry.try_acquire("limited"));
    }

    #[test]
    fn test_config_file_defaults() {
        let config: ConfigFile = serde_json::from_value(json!({
            "providers": [{"name": "openai", "api_key": "sk"}],
            "auth": {"global_keys": ["client-key"]},
            "breaker": {"failure_threshold": 3}
        }))
        .unwrap();
        assert_eq!(config.providers.len(), 1);
        assert!(
            config
                .auth
                .global_keys
                .contains(&ConstantTimeString::from("client-key".to_string()))
        );
        assert!(config.auth.admin_keys.is_empty());
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.recovery_timeout_ms, 60_000);
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.routing, RoutingConfig::default());
    }

    #[rstest]
    #[case::sweep_interval(json!({"pool": {"sweep_interval_ms": 0}}), "sweep_interval_ms")]
    #[case::probe_interval(json!({"pool": {"probe_interval_ms": 0}}), "probe_interval_ms")]
    #[case::no_connections(json!({"pool": {"max_connections": 0}}), "max_connections")]
    #[case::failure_ratio(json!({"pool": {"unhealthy_failure_ratio": 1.5}}), "unhealthy_failure_ratio")]
    #[case::failure_threshold(json!({"breaker": {"failure_threshold": 0}}), "failure_threshold")]
    #[case::success_threshold(json!({"breaker": {"success_threshold": 0}}), "success_threshold")]
    #[case::half_open(json!({"breaker": {"half_open_max_requests": 0}}), "half_open_max_requests")]
    #[case::failure_budget(json!({"routing": {"max_failures": 0}}), "max_failures")]
    #[case::backoff(json!({"routing": {"base_delay_ms": 9_000, "max_delay_ms": 1_000}}), "base_delay_ms")]
    #[case::window(json!({"health": {"window_ms": 0}}), "window_ms")]
    #[case::rates(json!({"health": {"healthy_success_rate": 0.4, "unhealthy_success_rate": 0.6}}), "success rates")]
    fn test_degenerate_tuning_is_rejected(#[case] file: serde_json::Value, #[case] mentions: &str) {
        let config: ConfigFile = serde_json::from_value(file).unwrap();
        match config.validate() {
            Err(GatewayError::InvalidConfig(reason)) => {
                assert!(reason.contains(mentions), "{reason}")
            }
            other => panic!("expected an invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_default_tuning_is_valid() {
        assert!(ConfigFile::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_reports_invalid_files() {
        let dir = std::env::temp_dir().join(format!("switchyard-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let valid = dir.join("valid.json");
        tokio::fs::write(
            &valid,
            r#"{"providers": [{"name": "local", "kind": "synthetic"}]}"#,
        )
        .await
        .unwrap();
        let config = ConfigFile::load(&valid).await.unwrap();
        assert_eq!(config.providers[0].kind, ProviderKind::Synthetic);

        let duplicate = dir.join("duplicate.json");
        tokio::fs::write(
            &duplicate,
            r#"{"providers": [{"name": "x", "kind": "synthetic"}, {"name": "x", "kind": "synthetic"}]}"#,
        )
        .await
        .unwrap();
        let err = ConfigFile::load(&duplicate).await.unwrap_err();
        assert!(err.to_string().contains("defined twice"));

        let stalled = dir.join("stalled.json");
        tokio::fs::write(&stalled, r#"{"pool": {"sweep_interval_ms": 0}}"#)
            .await
            .unwrap();
        let err = ConfigFile::load(&stalled).await.unwrap_err();
        assert!(err.to_string().contains("sweep_interval_ms"));

        assert!(ConfigFile::load(&dir.join("missing.json")).await.is_err());
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
