//! Provider dispatch
//!
//! The registry is built once at process start and passed to whoever needs
//! to talk to a cloud. Each provider registers a [`ConnectorFactory`]; the
//! registry resolves a cluster's credential, hands it to the factory, and
//! wraps the connector in the retry decorator.

use std::collections::BTreeMap;
use std::sync::Arc;

use stratus_common::resources::{required_keys, Cluster, Credential, ProviderType};
use stratus_common::retry::RetryConfig;
use stratus_common::store::ResourceStore;
use stratus_common::wait::PollConfig;
use stratus_common::{Error, Result};
use tracing::debug;

use crate::actuator::MachineActuator;
use crate::bootstrap::{BootstrapTokenService, KubeadmTokenService, ScriptRenderer};
use crate::connector::CloudConnector;
use crate::probe::{ControlPlaneProbe, KubeControlPlaneProbe};
use crate::retrying::RetryingConnector;

/// Builds connectors for one provider
pub trait ConnectorFactory: Send + Sync {
    /// Connect with a validated credential
    fn connect(&self, cluster: &Cluster, credential: &Credential)
        -> Result<Arc<dyn CloudConnector>>;
}

/// Reaches the control plane of provisioned clusters
pub trait ControlPlaneAccess: Send + Sync {
    /// Join token issuer for clusters in `store`
    fn tokens(&self, store: Arc<dyn ResourceStore>) -> Arc<dyn BootstrapTokenService>;

    /// Readiness probe for clusters in `store`
    fn probe(&self, store: Arc<dyn ResourceStore>) -> Arc<dyn ControlPlaneProbe>;
}

/// Access through the admin kubeconfig kept in the store
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeAccess;

impl ControlPlaneAccess for KubeAccess {
    fn tokens(&self, store: Arc<dyn ResourceStore>) -> Arc<dyn BootstrapTokenService> {
        Arc::new(KubeadmTokenService::new(store))
    }

    fn probe(&self, store: Arc<dyn ResourceStore>) -> Arc<dyn ControlPlaneProbe> {
        Arc::new(KubeControlPlaneProbe::new(store))
    }
}

/// Everything needed to drive one cluster's provider
#[derive(Clone)]
pub struct ProviderHandles {
    /// Connector, already wrapped with retries
    pub connector: Arc<dyn CloudConnector>,
    /// Join token issuer
    pub tokens: Arc<dyn BootstrapTokenService>,
    /// Control plane readiness
    pub probe: Arc<dyn ControlPlaneProbe>,
}

impl ProviderHandles {
    /// Machine actuator over these handles
    pub fn actuator(
        &self,
        store: Arc<dyn ResourceStore>,
        renderer: Arc<ScriptRenderer>,
        poll: PollConfig,
    ) -> MachineActuator {
        MachineActuator::new(
            self.connector.clone(),
            self.tokens.clone(),
            store,
            renderer,
            poll,
        )
    }
}

/// Provider type to connector factory
pub struct ProviderRegistry {
    factories: BTreeMap<ProviderType, Arc<dyn ConnectorFactory>>,
    access: Arc<dyn ControlPlaneAccess>,
    retry: RetryConfig,
}

impl ProviderRegistry {
    /// Empty registry reaching clusters through `access`
    pub fn new(access: Arc<dyn ControlPlaneAccess>) -> Self {
        Self {
            factories: BTreeMap::new(),
            access,
            retry: RetryConfig::default(),
        }
    }

    /// Use `retry` for every connector handed out
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Register the factory for `provider`, replacing any earlier one
    pub fn register(mut self, provider: ProviderType, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.factories.insert(provider, factory);
        self
    }

    /// Providers with a registered factory
    pub fn providers(&self) -> Vec<ProviderType> {
        self.factories.keys().copied().collect()
    }

    /// Resolve the handles for a cluster
    ///
    /// A missing factory, a missing credential, or a credential lacking
    /// required keys are all validation errors.
    pub async fn resolve(
        &self,
        cluster: &Cluster,
        store: Arc<dyn ResourceStore>,
    ) -> Result<ProviderHandles> {
        let provider = cluster.spec.provider;
        let factory = self.factories.get(&provider).ok_or_else(|| {
            Error::validation_for(
                cluster.name(),
                format!("no connector registered for provider {provider}"),
            )
        })?;

        let credential = credential_for(cluster, store.as_ref()).await?;
        let connector = factory.connect(cluster, &credential)?;
        debug!(cluster = %cluster.name(), provider = %provider, "Resolved cloud connector");

        Ok(ProviderHandles {
            connector: Arc::new(RetryingConnector::new(connector, self.retry.clone())),
            tokens: self.access.tokens(store.clone()),
            probe: self.access.probe(store),
        })
    }
}

async fn credential_for(cluster: &Cluster, store: &dyn ResourceStore) -> Result<Credential> {
    let name = &cluster.spec.credential_name;
    if name.is_empty() {
        return Err(Error::validation_for_field(
            cluster.name(),
            "spec.credentialName",
            "credential name must be provided",
        ));
    }

    let credential = match store.get_credential(name).await {
        Ok(credential) => credential,
        Err(e) if e.is_not_found() => {
            return Err(Error::validation_for_field(
                cluster.name(),
                "spec.credentialName",
                format!("credential {name} not found"),
            ))
        }
        Err(e) => return Err(e),
    };

    // Managed and unmanaged flavours of a vendor share credentials
    if required_keys(credential.provider) != required_keys(cluster.spec.provider) {
        return Err(Error::validation_for(
            cluster.name(),
            format!(
                "credential {name} is for {}, cluster uses {}",
                credential.provider, cluster.spec.provider
            ),
        ));
    }
    credential.validate()?;
    Ok(credential)
}
