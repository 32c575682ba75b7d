use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::CompiledContract;
use crate::contract::{ContractError, ServiceContract};

/// Versioned store of compiled contracts
///
/// Compiled contracts are immutable. Publishing a version compiles it outside the
/// lock and then swaps the `Arc` for the service under a short write lock, so a
/// request that already cloned the previous generation keeps using it untouched.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// service id -> highest published version
    current: HashMap<String, Arc<CompiledContract>>,
    /// (service id, version) -> compiled contract
    versions: HashMap<(String, u32), Arc<CompiledContract>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and publish a contract version
    ///
    /// A malformed contract leaves the registry as it was. Versions are immutable:
    ///  publishing an existing (service, version) pair again fails.
    pub fn publish(
        &self,
        contract: &ServiceContract,
    ) -> Result<Arc<CompiledContract>, ContractError> {
        let compiled = Arc::new(CompiledContract::compile(contract)?);
        let key = (contract.service_id.clone(), contract.version);

        let mut inner = self.inner.write();
        if inner.versions.contains_key(&key) {
            return Err(ContractError::VersionExists {
                service_id: contract.service_id.clone(),
                version: contract.version,
            });
        }
        inner.versions.insert(key, compiled.clone());

        let newer = inner
            .current
            .get(&contract.service_id)
            .map_or(true, |current| current.version() < contract.version);
        if newer {
            inner
                .current
                .insert(contract.service_id.clone(), compiled.clone());
            tracing::info!(
                "published contract {} version {}",
                contract.service_id,
                contract.version
            );
        } else {
            tracing::info!(
                "stored contract {} version {} (not newer than current)",
                contract.service_id,
                contract.version
            );
        }
        Ok(compiled)
    }

    /// The newest compiled contract of a service
    pub fn current(&self, service_id: &str) -> Option<Arc<CompiledContract>> {
        self.inner.read().current.get(service_id).cloned()
    }

    /// The newest compiled contract of every published service
    pub fn all_current(&self) -> Vec<Arc<CompiledContract>> {
        self.inner.read().current.values().cloned().collect()
    }

    /// A specific compiled contract version
    pub fn version(&self, service_id: &str, version: u32) -> Option<Arc<CompiledContract>> {
        self.inner
            .read()
            .versions
            .get(&(service_id.to_string(), version))
            .cloned()
    }

    pub fn versions(&self, service_id: &str) -> Vec<u32> {
        let mut versions: Vec<u32> = self
            .inner
            .read()
            .versions
            .keys()
            .filter(|(id, _)| id == service_id)
            .map(|(_, v)| *v)
            .collect();
        versions.sort_unstable();
        versions
    }
}
