use crate::context::RequestContext;
use crate::database::provider_config_repository::ProviderConfig;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::MobileMoneyProvider;
use crate::payments::providers::{airtel, mtn, zamtel, AirtelProvider, MtnProvider, ZamtelProvider};
use crate::payments::token_cache::TokenCache;
use crate::payments::types::Connectivity;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Builds an adapter from its configuration row.
pub type ProviderFactory = Arc<
    dyn Fn(Arc<ProviderConfig>, Arc<TokenCache>) -> PaymentResult<Arc<dyn MobileMoneyProvider>>
        + Send
        + Sync,
>;

/// Wraps an adapter constructor as a [`ProviderFactory`].
pub fn adapter_factory<P, F>(build: F) -> ProviderFactory
where
    P: MobileMoneyProvider + 'static,
    F: Fn(Arc<ProviderConfig>, Arc<TokenCache>) -> PaymentResult<P> + Send + Sync + 'static,
{
    Arc::new(
        move |config: Arc<ProviderConfig>,
              tokens: Arc<TokenCache>|
              -> PaymentResult<Arc<dyn MobileMoneyProvider>> {
            Ok(Arc::new(build(config, tokens)?))
        },
    )
}

/// Provider code → factory table plus the configuration rows it is applied to.
///
/// Built once at start-up and passed explicitly. Adapter instances are
/// constructed lazily and memoized until their configuration changes.
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, ProviderFactory>>,
    configs: RwLock<BTreeMap<String, Arc<ProviderConfig>>>,
    instances: RwLock<HashMap<String, Arc<dyn MobileMoneyProvider>>>,
    tokens: Arc<TokenCache>,
}

impl ProviderRegistry {
    pub fn new(tokens: Arc<TokenCache>) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            configs: RwLock::new(BTreeMap::new()),
            instances: RwLock::new(HashMap::new()),
            tokens,
        }
    }

    /// Registry with the MTN, Airtel and Zamtel factories installed.
    pub fn with_default_adapters(tokens: Arc<TokenCache>) -> Self {
        let registry = Self::new(tokens);
        registry.register(mtn::CODE, adapter_factory(MtnProvider::new));
        registry.register(airtel::CODE, adapter_factory(AirtelProvider::new));
        registry.register(zamtel::CODE, adapter_factory(ZamtelProvider::new));
        registry
    }

    /// Installs or replaces the factory for `code`.
    pub fn register(&self, code: &str, factory: ProviderFactory) {
        let code = code.to_lowercase();
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(code.clone(), factory);
        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&code);
        info!(provider = %code, "provider factory registered");
    }

    /// Registers an already-built adapter under `code`.
    pub fn register_instance(&self, code: &str, adapter: Arc<dyn MobileMoneyProvider>) {
        self.register(
            code,
            Arc::new(
                move |_: Arc<ProviderConfig>,
                      _: Arc<TokenCache>|
                      -> PaymentResult<Arc<dyn MobileMoneyProvider>> { Ok(adapter.clone()) },
            ),
        );
    }

    /// Loads or replaces a configuration row.
    pub fn upsert_provider(&self, config: ProviderConfig) {
        let code = config.code.to_lowercase();
        self.configs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(code.clone(), Arc::new(config));
        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&code);
    }

    /// Active configuration for `code`.
    pub fn provider_config(&self, code: &str) -> PaymentResult<Arc<ProviderConfig>> {
        let code = code.to_lowercase();
        self.configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&code)
            .filter(|c| c.is_active)
            .cloned()
            .ok_or_else(|| PaymentError::not_found(format!("unknown or inactive provider: {}", code)))
    }

    /// Active configurations ordered by code.
    pub fn active_providers(&self) -> Vec<Arc<ProviderConfig>> {
        self.configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect()
    }

    /// Adapter for an active provider. Unknown codes, inactive rows and codes
    /// without a registered factory are `NotFound`.
    pub fn resolve(&self, code: &str) -> PaymentResult<Arc<dyn MobileMoneyProvider>> {
        let config = self.provider_config(code)?;
        let code = config.code.to_lowercase();

        if let Some(instance) = self
            .instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&code)
        {
            return Ok(instance.clone());
        }

        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&code)
            .cloned()
            .ok_or_else(|| PaymentError::not_found(format!("no adapter registered for provider: {}", code)))?;
        let instance = factory(config, self.tokens.clone())?;
        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(code, instance.clone());
        Ok(instance)
    }

    /// First active provider, in code order, whose adapter accepts the number.
    pub fn resolve_by_phone_number(
        &self,
        phone_number: &str,
    ) -> Option<Arc<dyn MobileMoneyProvider>> {
        self.active_providers().into_iter().find_map(|config| {
            match self.resolve(&config.code) {
                Ok(adapter) if adapter.validate_phone_number(phone_number) => Some(adapter),
                Ok(_) => None,
                Err(e) => {
                    warn!(provider = %config.code, error = %e, "skipping provider during phone lookup");
                    None
                }
            }
        })
    }

    /// Never fails: every error becomes `available: false`.
    pub async fn test_connectivity(&self, ctx: &RequestContext, code: &str) -> Connectivity {
        let adapter = match self.resolve(code) {
            Ok(adapter) => adapter,
            Err(e) => {
                return Connectivity {
                    available: false,
                    message: e.to_string(),
                }
            }
        };
        match adapter.health_check(ctx).await {
            Ok(connectivity) => connectivity,
            Err(e) => Connectivity {
                available: false,
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::provider_config_repository::parse_configs;

    fn config(code: &str, active: bool) -> ProviderConfig {
        let row = serde_json::json!([{
            "code": code,
            "name": code,
            "currency": "ZMW",
            "sandbox_url": "http://127.0.0.1:9",
            "production_url": "http://127.0.0.1:9",
            "min_amount": 1,
            "max_amount": 1000,
            "is_active": active,
            "timeout_secs": 1,
            "max_retries": 0
        }]);
        parse_configs(&row.to_string()).unwrap().remove(0)
    }

    fn registry() -> ProviderRegistry {
        let registry = ProviderRegistry::with_default_adapters(Arc::new(TokenCache::new(60)));
        registry.upsert_provider(config("mtn", true));
        registry.upsert_provider(config("airtel", true));
        registry.upsert_provider(config("zamtel", false));
        registry
    }

    #[test]
    fn resolve_returns_matching_adapter() {
        let registry = registry();
        assert_eq!(registry.resolve("MTN").unwrap().code(), "mtn");
        assert_eq!(registry.resolve("airtel").unwrap().code(), "airtel");
    }

    #[test]
    fn unknown_and_inactive_providers_are_not_found() {
        let registry = registry();
        assert!(matches!(
            registry.resolve("vodafone"),
            Err(PaymentError::NotFound { .. })
        ));
        assert!(matches!(
            registry.resolve("zamtel"),
            Err(PaymentError::NotFound { .. })
        ));
    }

    #[test]
    fn resolve_by_phone_uses_prefix_rules() {
        let registry = registry();
        assert_eq!(
            registry.resolve_by_phone_number("0961234567").unwrap().code(),
            "mtn"
        );
        assert_eq!(
            registry.resolve_by_phone_number("260771234567").unwrap().code(),
            "airtel"
        );
        // Zamtel is inactive.
        assert!(registry.resolve_by_phone_number("0951234567").is_none());
        assert!(registry.resolve_by_phone_number("12345").is_none());
    }

    #[test]
    fn instances_are_memoized_until_config_changes() {
        let registry = registry();
        let first = registry.resolve("mtn").unwrap();
        let second = registry.resolve("mtn").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.upsert_provider(config("mtn", true));
        let third = registry.resolve("mtn").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn connectivity_never_fails() {
        let registry = registry();
        let ctx = RequestContext::system();
        let unknown = registry.test_connectivity(&ctx, "vodafone").await;
        assert!(!unknown.available);

        // Credentials are missing, so the probe fails before any I/O.
        let mtn = registry.test_connectivity(&ctx, "mtn").await;
        assert!(!mtn.available);
        assert!(mtn.message.contains("not configured"));
    }
}
