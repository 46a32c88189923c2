//! Configuration
//!
//! YAML configuration with environment variable expansion and validation.
//! A config names the authorization endpoint plus the storage residencies
//! the service may sign for, with their credentials.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::signer::openstack_swift::LargeObjectMode;
use crate::signer::{
    AmazonS3, GoogleCloudStorage, MicrosoftAzure, OpenStackSwift, SignError, SignerRegistry,
};

mod loader;

pub use loader::ConfigLoader;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Residency rejected its credentials: {0}")]
    Credential(#[from] SignError),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Authorization service base URL, e.g. `https://app.example.com/uploads`
    pub endpoint: String,
    /// Storage residencies in priority order; the first one is the default
    pub residencies: Vec<ResidencyConfig>,
    #[serde(default)]
    pub upload: UploadConfig,
}

/// One storage residency and its credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ResidencyConfig {
    AmazonS3 {
        access_id: String,
        secret_key: String,
        #[serde(default)]
        location: Option<String>,
    },
    GoogleCloudStorage {
        access_id: String,
        secret_key: String,
        #[serde(default)]
        location: Option<String>,
    },
    MicrosoftAzure {
        account_name: String,
        access_key: String,
        #[serde(default)]
        blob_host: Option<String>,
    },
    // snake_case would split this as `open_stack_swift`
    #[serde(rename = "openstack_swift")]
    OpenStackSwift {
        host: String,
        storage_url: String,
        temp_url_key: String,
        #[serde(default)]
        large_object: LargeObjectConfig,
    },
    RackspaceCloudFiles {
        location: String,
        storage_url: String,
        temp_url_key: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LargeObjectConfig {
    #[default]
    Dynamic,
    Static,
}

impl From<LargeObjectConfig> for LargeObjectMode {
    fn from(value: LargeObjectConfig) -> Self {
        match value {
            LargeObjectConfig::Dynamic => LargeObjectMode::Dynamic,
            LargeObjectConfig::Static => LargeObjectMode::Static,
        }
    }
}

/// Client-side upload tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Validity window for signed URLs, in seconds
    #[serde(default = "default_signature_ttl_secs")]
    pub signature_ttl_secs: u64,
}

fn default_signature_ttl_secs() -> u64 {
    crate::signer::DEFAULT_TTL_SECS as u64
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            signature_ttl_secs: default_signature_ttl_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::ValidationError(
                "Authorization endpoint must be set".into(),
            ));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "Authorization endpoint must be an HTTP(S) URL, got '{}'",
                self.endpoint
            )));
        }
        if self.residencies.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one residency must be configured".into(),
            ));
        }
        if self.upload.signature_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Signature TTL must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Build the signing registry from the configured residencies, in the
    /// order they appear.
    pub fn build_registry(&self) -> Result<SignerRegistry, ConfigError> {
        let mut registry = SignerRegistry::new();
        for residency in &self.residencies {
            match residency {
                ResidencyConfig::AmazonS3 {
                    access_id,
                    secret_key,
                    location,
                } => registry.register(Arc::new(AmazonS3::new(
                    access_id,
                    secret_key,
                    location.as_deref(),
                )?)),
                ResidencyConfig::GoogleCloudStorage {
                    access_id,
                    secret_key,
                    location,
                } => registry.register(Arc::new(GoogleCloudStorage::new(
                    access_id,
                    secret_key,
                    location.as_deref(),
                )?)),
                ResidencyConfig::MicrosoftAzure {
                    account_name,
                    access_key,
                    blob_host,
                } => registry.register(Arc::new(MicrosoftAzure::new(
                    account_name,
                    access_key,
                    blob_host.as_deref(),
                )?)),
                ResidencyConfig::OpenStackSwift {
                    host,
                    storage_url,
                    temp_url_key,
                    large_object,
                } => registry.register(Arc::new(OpenStackSwift::new(
                    host,
                    storage_url,
                    temp_url_key,
                    (*large_object).into(),
                )?)),
                ResidencyConfig::RackspaceCloudFiles {
                    location,
                    storage_url,
                    temp_url_key,
                } => registry.register(Arc::new(OpenStackSwift::rackspace(
                    location,
                    storage_url,
                    temp_url_key,
                )?)),
            }
        }
        Ok(registry)
    }
}
