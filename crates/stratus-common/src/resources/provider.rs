//! Provider-tagged opaque payloads
//!
//! Machine specs and statuses carry vendor-specific fields the generic core
//! never looks at. They are stored as a provider tag plus a JSON payload and
//! decoded only by that provider's connector.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ProviderType;
use crate::{Error, Result};

/// A provider-specific value stored alongside generic fields
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProviderBlob {
    /// Provider that wrote the payload
    pub provider: ProviderType,
    /// Payload, opaque to everything but that provider
    #[serde(default)]
    pub value: serde_json::Value,
}

impl ProviderBlob {
    /// Encode a provider-specific struct
    pub fn encode<T: Serialize>(provider: ProviderType, value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::serialization_for_kind(provider.as_str(), e.to_string()))?;
        Ok(Self { provider, value })
    }

    /// Decode the payload, rejecting blobs written by another provider
    pub fn decode<T: DeserializeOwned>(&self, expected: ProviderType) -> Result<T> {
        if self.provider != expected {
            return Err(Error::validation(format!(
                "provider blob tagged {} cannot be decoded by {}",
                self.provider, expected
            )));
        }
        serde_json::from_value(self.value.clone())
            .map_err(|e| Error::serialization_for_kind(expected.as_str(), e.to_string()))
    }
}
