//! Cloud provider credentials
//!
//! Key names follow each vendor's own environment variable conventions so a
//! credential can be built from a shell environment as well as a record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ObjectMeta, ProviderType};
use crate::{Error, Result};

/// A named set of provider secrets
#[derive(Clone, Deserialize, Serialize, PartialEq)]
pub struct Credential {
    /// Identity
    pub metadata: ObjectMeta,
    /// Provider these secrets authenticate against
    pub provider: ProviderType,
    /// Secret values keyed by vendor variable name
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Credential {
    /// A new credential record
    pub fn new(name: impl Into<String>, provider: ProviderType) -> Self {
        Self {
            metadata: ObjectMeta::new(name),
            provider,
            data: BTreeMap::new(),
        }
    }

    /// Add a secret value
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Look up a required key
    pub fn require(&self, key: &str) -> Result<&str> {
        self.data
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::validation_for_field(
                    self.metadata.name.clone(),
                    format!("data.{key}"),
                    format!("credential {} is missing {key}", self.metadata.name),
                )
            })
    }

    /// Check that every key the provider needs is present and non-empty
    pub fn validate(&self) -> Result<()> {
        for key in required_keys(self.provider) {
            self.require(key)?;
        }
        Ok(())
    }
}

/// Keys a provider's connector needs
pub fn required_keys(provider: ProviderType) -> &'static [&'static str] {
    match provider {
        ProviderType::Aws | ProviderType::Eks | ProviderType::Lightsail => {
            &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"]
        }
        ProviderType::Azure | ProviderType::Aks => &[
            "AZURE_TENANT_ID",
            "AZURE_SUBSCRIPTION_ID",
            "AZURE_CLIENT_ID",
            "AZURE_CLIENT_SECRET",
        ],
        ProviderType::Gce | ProviderType::Gke => &["GOOGLE_PROJECT_ID", "GOOGLE_SERVICE_ACCOUNT"],
        ProviderType::DigitalOcean | ProviderType::Dokube => &["DIGITALOCEAN_TOKEN"],
        ProviderType::Linode => &["LINODE_TOKEN"],
        ProviderType::Vultr => &["VULTR_API_KEY"],
        ProviderType::Hetzner => &["HCLOUD_TOKEN"],
        ProviderType::Ovh => &["OS_USERNAME", "OS_PASSWORD", "OS_TENANT_ID"],
        ProviderType::Packet => &["PACKET_API_KEY", "PACKET_PROJECT_ID"],
        ProviderType::Scaleway => &["SCW_ACCESS_KEY", "SCW_SECRET_KEY", "SCW_PROJECT_ID"],
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&String> = self.data.keys().collect();
        f.debug_struct("Credential")
            .field("name", &self.metadata.name)
            .field("provider", &self.provider)
            .field("keys", &keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_complete_credential() {
        let cred = Credential::new("do", ProviderType::DigitalOcean).with("DIGITALOCEAN_TOKEN", "t");
        assert!(cred.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_key() {
        let cred = Credential::new("aws", ProviderType::Aws).with("AWS_ACCESS_KEY_ID", "AKID");
        let err = cred.validate().unwrap_err();
        assert!(err.to_string().contains("AWS_SECRET_ACCESS_KEY"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validate_rejects_empty_value() {
        let cred = Credential::new("l", ProviderType::Linode).with("LINODE_TOKEN", "");
        assert!(cred.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_values() {
        let cred = Credential::new("l", ProviderType::Linode).with("LINODE_TOKEN", "super-secret");
        let debug = format!("{:?}", cred);
        assert!(debug.contains("LINODE_TOKEN"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_every_provider_has_required_keys() {
        for provider in ProviderType::ALL {
            assert!(!required_keys(provider).is_empty());
        }
    }
}
