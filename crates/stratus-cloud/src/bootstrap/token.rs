//! Worker join tokens
//!
//! Tokens use the kubeadm bootstrap token format `[a-z0-9]{6}.[a-z0-9]{16}`
//! and are installed in the workload cluster as
//! `bootstrap.kubernetes.io/token` Secrets, which is what `kubeadm token
//! create` does.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, PostParams};
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use stratus_common::resources::Cluster;
use stratus_common::store::ResourceStore;
use stratus_common::Result;
use tracing::{debug, instrument};

use crate::kube_access::admin_client;

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;

/// Group kubeadm grants to joining nodes
pub const NODE_BOOTSTRAP_GROUP: &str = "system:bootstrappers:kubeadm:default-node-token";

/// A kubeadm bootstrap token
#[derive(Clone, PartialEq, Eq)]
pub struct JoinToken {
    id: String,
    secret: String,
}

impl JoinToken {
    /// Generate a new random token
    pub fn generate() -> Self {
        Self {
            id: random_string(TOKEN_ID_LEN),
            secret: random_string(TOKEN_SECRET_LEN),
        }
    }

    /// Public half of the token
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the Secret that holds this token
    pub fn secret_name(&self) -> String {
        format!("bootstrap-token-{}", self.id)
    }

    /// Secret object installing the token in kube-system
    pub fn to_secret(&self, ttl: Duration) -> Secret {
        let expiration = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(30));

        let mut data = BTreeMap::new();
        data.insert("token-id".to_string(), self.id.clone());
        data.insert("token-secret".to_string(), self.secret.clone());
        data.insert(
            "expiration".to_string(),
            expiration.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        data.insert("usage-bootstrap-authentication".to_string(), "true".to_string());
        data.insert("usage-bootstrap-signing".to_string(), "true".to_string());
        data.insert("auth-extra-groups".to_string(), NODE_BOOTSTRAP_GROUP.to_string());
        data.insert(
            "description".to_string(),
            "join token created by stratus".to_string(),
        );

        Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            type_: Some("bootstrap.kubernetes.io/token".to_string()),
            string_data: Some(data),
            ..Default::default()
        }
    }
}

fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

impl std::fmt::Display for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.id, self.secret)
    }
}

impl std::fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only the public ID
        f.debug_struct("JoinToken").field("id", &self.id).finish()
    }
}

/// Issues join tokens against a live control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootstrapTokenService: Send + Sync {
    /// Create a join token valid for `ttl`
    async fn create_join_token(&self, cluster: &Cluster, ttl: Duration) -> Result<JoinToken>;
}

/// Token service that installs tokens through the cluster's API server
pub struct KubeadmTokenService {
    store: Arc<dyn ResourceStore>,
}

impl KubeadmTokenService {
    /// Reach clusters through admin kubeconfigs in `store`
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BootstrapTokenService for KubeadmTokenService {
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name()))]
    async fn create_join_token(&self, cluster: &Cluster, ttl: Duration) -> Result<JoinToken> {
        let client = admin_client(self.store.as_ref(), cluster.name()).await?;
        let secrets: Api<Secret> = Api::namespaced(client, "kube-system");

        let token = JoinToken::generate();
        secrets
            .create(&PostParams::default(), &token.to_secret(ttl))
            .await?;

        debug!(token_id = %token.id(), ttl_secs = ttl.as_secs(), "Created join token");
        Ok(token)
    }
}
