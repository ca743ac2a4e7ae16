//! Chains known to the process, the factory of each one's adapter, and which
//! of them are enabled.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::info;

use crate::adapters::{factory_for, AdapterFactory, ChainAdapter};
use crate::config::{load_chains, validate_chain};
use crate::errors::ChainsyncError;
use crate::{Chain, ChainId, ChainKind};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    pub chain_id: ChainId,
    pub kind: ChainKind,
    pub enabled: bool,
}

#[derive(Debug)]
struct Plugin {
    chain: Chain,
    factory: Arc<dyn AdapterFactory>,
    /// Built on enable, dropped on disable.
    adapter: Option<Arc<dyn ChainAdapter>>,
}

impl Plugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            chain_id: self.chain.id.clone(),
            kind: self.chain.kind,
            enabled: self.adapter.is_some(),
        }
    }
}

/// Set of enabled chain ids, sent on every change.
pub type EnabledChains = BTreeSet<ChainId>;

#[derive(Clone, Debug)]
pub struct PluginRegistry {
    plugins: Arc<RwLock<BTreeMap<ChainId, Plugin>>>,
    chains_source: Option<PathBuf>,
    changes: Arc<watch::Sender<EnabledChains>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: Arc::new(RwLock::new(BTreeMap::new())),
            chains_source: None,
            changes: Arc::new(watch::channel(EnabledChains::new()).0),
        }
    }

    /// Re-reads chain entries from this TOML file on every enable and disable.
    pub fn with_chains_source(mut self, path: impl AsRef<Path>) -> Self {
        self.chains_source = Some(path.as_ref().to_path_buf());

        self
    }

    /// Registers a chain with the factory of its adapter, replacing an earlier
    /// registration. The new configuration applies from the next enable.
    pub async fn register(
        &self,
        chain: Chain,
        factory: Arc<dyn AdapterFactory>,
    ) -> Result<(), ChainsyncError> {
        if factory.kind() != chain.kind {
            return Err(ChainsyncError::FatalConfig {
                chain_id: chain.id.clone(),
                reason: format!("{} factory cannot build {} adapters", factory.kind(), chain.kind),
            });
        }

        let mut plugins = self.plugins.write().await;
        match plugins.get_mut(&chain.id) {
            Some(plugin) => {
                plugin.chain = chain;
                plugin.factory = factory;
            }
            None => {
                plugins.insert(
                    chain.id.clone(),
                    Plugin {
                        chain,
                        factory,
                        adapter: None,
                    },
                );
            }
        }

        Ok(())
    }

    /// Registers a chain with the compiled-in factory of its kind.
    pub async fn register_chain(&self, chain: Chain) -> Result<(), ChainsyncError> {
        let factory = factory_for(chain.kind);

        self.register(chain, factory).await
    }

    /// Builds the chain's adapter and marks it enabled. Enabling an enabled chain
    /// returns its existing adapter.
    pub async fn enable(&self, chain_id: &ChainId) -> Result<Arc<dyn ChainAdapter>, ChainsyncError> {
        self.reload().await?;

        let mut plugins = self.plugins.write().await;
        let plugin =
            plugins.get_mut(chain_id).ok_or_else(|| ChainsyncError::UnknownChain(chain_id.clone()))?;

        if let Some(adapter) = &plugin.adapter {
            return Ok(adapter.clone());
        }

        let fatal_config = |reason: String| ChainsyncError::FatalConfig {
            chain_id: chain_id.clone(),
            reason,
        };
        validate_chain(&plugin.chain).map_err(|e| fatal_config(e.to_string()))?;
        let adapter = plugin.factory.build(&plugin.chain).map_err(|e| fatal_config(e.to_string()))?;

        plugin.adapter = Some(adapter.clone());
        info!(%chain_id, kind = %plugin.chain.kind, "enabled chain");

        self.notify(&plugins);

        Ok(adapter)
    }

    /// Marks the chain disabled. Returns false when it already was.
    pub async fn disable(&self, chain_id: &ChainId) -> Result<bool, ChainsyncError> {
        self.reload().await?;

        let mut plugins = self.plugins.write().await;
        let plugin =
            plugins.get_mut(chain_id).ok_or_else(|| ChainsyncError::UnknownChain(chain_id.clone()))?;

        if plugin.adapter.take().is_none() {
            return Ok(false);
        }
        info!(%chain_id, "disabled chain");

        self.notify(&plugins);

        Ok(true)
    }

    pub async fn list(&self) -> Vec<PluginDescriptor> {
        self.plugins.read().await.values().map(Plugin::descriptor).collect()
    }

    pub async fn is_enabled(&self, chain_id: &ChainId) -> bool {
        self.plugins.read().await.get(chain_id).is_some_and(|plugin| plugin.adapter.is_some())
    }

    pub async fn adapter(&self, chain_id: &ChainId) -> Option<Arc<dyn ChainAdapter>> {
        self.plugins.read().await.get(chain_id).and_then(|plugin| plugin.adapter.clone())
    }

    pub async fn chain(&self, chain_id: &ChainId) -> Option<Chain> {
        self.plugins.read().await.get(chain_id).map(|plugin| plugin.chain.clone())
    }

    pub async fn chains(&self) -> Vec<Chain> {
        self.plugins.read().await.values().map(|plugin| plugin.chain.clone()).collect()
    }

    /// Receives the set of enabled chains whenever it changes.
    pub fn subscribe(&self) -> watch::Receiver<EnabledChains> {
        self.changes.subscribe()
    }

    /// Registers every chain of the chains source, if any.
    pub async fn reload(&self) -> Result<(), ChainsyncError> {
        let Some(chains_source) = &self.chains_source else {
            return Ok(());
        };

        for chain in load_chains(chains_source)? {
            let factory = match self.plugins.read().await.get(&chain.id) {
                Some(plugin) if plugin.factory.kind() == chain.kind => plugin.factory.clone(),
                _ => factory_for(chain.kind),
            };

            self.register(chain, factory).await?;
        }

        Ok(())
    }

    fn notify(&self, plugins: &BTreeMap<ChainId, Plugin>) {
        let enabled_chains = plugins
            .values()
            .filter(|plugin| plugin.adapter.is_some())
            .map(|plugin| plugin.chain.id.clone())
            .collect();

        self.changes.send_replace(enabled_chains);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::adapters::UtxoAdapterFactory;

    fn ethereum() -> Chain {
        Chain::new("ethereum", ChainKind::Evm, "http://localhost:8545")
    }

    #[tokio::test]
    async fn enables_idempotently() {
        let registry = PluginRegistry::new();
        registry.register_chain(ethereum()).await.unwrap();
        let mut changes = registry.subscribe();

        let first = registry.enable(&ethereum().id).await.unwrap();
        let second = registry.enable(&ethereum().id).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.is_enabled(&ethereum().id).await);
        assert!(changes.has_changed().unwrap());
        assert!(changes.borrow_and_update().contains(&ethereum().id));
    }

    #[tokio::test]
    async fn surfaces_invalid_configuration_on_enable() {
        let registry = PluginRegistry::new();
        registry
            .register_chain(Chain::new("polygon", ChainKind::Evm, "not a url"))
            .await
            .unwrap();

        let result = registry.enable(&ChainId::new("polygon")).await;

        assert!(matches!(result, Err(ChainsyncError::FatalConfig { .. })));
        assert!(!registry.is_enabled(&ChainId::new("polygon")).await);
    }

    #[tokio::test]
    async fn rejects_factories_of_another_kind() {
        let registry = PluginRegistry::new();

        let result = registry.register(ethereum(), Arc::new(UtxoAdapterFactory)).await;

        assert!(matches!(result, Err(ChainsyncError::FatalConfig { .. })));
    }

    #[tokio::test]
    async fn fails_for_unknown_chains() {
        let registry = PluginRegistry::new();

        let result = registry.enable(&ChainId::new("solana")).await;

        assert!(matches!(result, Err(ChainsyncError::UnknownChain(_))));
    }

    #[tokio::test]
    async fn lists_and_disables_chains() {
        let registry = PluginRegistry::new();
        registry.register_chain(ethereum()).await.unwrap();
        registry
            .register_chain(Chain::new("bitcoin", ChainKind::Utxo, "http://localhost:8332"))
            .await
            .unwrap();
        registry.enable(&ethereum().id).await.unwrap();

        assert!(registry.disable(&ethereum().id).await.unwrap());
        assert!(!registry.disable(&ethereum().id).await.unwrap());

        let descriptors = registry.list().await;
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].chain_id, ChainId::new("bitcoin"));
        assert!(descriptors.iter().all(|d| !d.enabled));
        assert!(registry.adapter(&ethereum().id).await.is_none());
    }

    #[tokio::test]
    async fn picks_up_chains_added_to_the_source_file() {
        let path = std::env::temp_dir().join(format!("chainsync-chains-{}.toml", uuid::Uuid::new_v4()));
        let registry = PluginRegistry::new().with_chains_source(&path);

        std::fs::File::create(&path)
            .unwrap()
            .write_all(
                br#"
                [[chains]]
                id = "base"
                kind = "evm"
                json_rpc_url = "https://base.example.com"
                "#,
            )
            .unwrap();

        registry.enable(&ChainId::new("base")).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(registry.is_enabled(&ChainId::new("base")).await);
    }
}
