//! Runtime settings for the CA and PDF engines.
//!
//! Resolution order, lowest priority first:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. `PDF_NOTARY_*` environment variables

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse config file: {0}")]
    Parse(String),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Complete configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub pdf: PdfSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub tsa: TsaSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Limits applied to PDF payloads before any signing work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfSettings {
    pub max_bytes: usize,
    pub batch_max_count: usize,
}

impl Default for PdfSettings {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024, // 50 MiB
            batch_max_count: 10,
        }
    }
}

/// Encrypted key-material store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// 32-byte AES-256-GCM master key, hex encoded.
    pub master_key: Option<String>,
    pub private_key_max_bytes: usize,
    pub seal_image_max_bytes: usize,
    pub seal_image_content_types: Vec<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            master_key: None,
            private_key_max_bytes: 8192,
            seal_image_max_bytes: 1024 * 1024, // 1 MiB
            seal_image_content_types: vec![
                "image/png".to_string(),
                "image/jpeg".to_string(),
                "image/svg+xml".to_string(),
            ],
        }
    }
}

/// RFC 3161 timestamp authority endpoint. Only the presence of `url` is
/// consulted by the engines; the HTTP client lives outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TsaSettings {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl TsaSettings {
    pub fn is_configured(&self) -> bool {
        self.url.as_deref().is_some_and(|url| !url.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "pdf_notary=info".to_string(),
            json: false,
        }
    }
}

impl Settings {
    /// Loads settings from an optional TOML file, then applies environment
    /// overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };

        settings.apply_env_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Overrides individual settings from the environment. The lookup is
    /// injected so tests don't have to mutate the process environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(n) = lookup("PDF_NOTARY_PDF_MAX_BYTES").and_then(|v| v.parse().ok()) {
            self.pdf.max_bytes = n;
        }
        if let Some(n) = lookup("PDF_NOTARY_PDF_BATCH_MAX_COUNT").and_then(|v| v.parse().ok()) {
            self.pdf.batch_max_count = n;
        }
        if let Some(key) = lookup("PDF_NOTARY_STORAGE_MASTER_KEY") {
            self.storage.master_key = Some(key);
        }
        if let Some(n) = lookup("PDF_NOTARY_PRIVATE_KEY_MAX_BYTES").and_then(|v| v.parse().ok()) {
            self.storage.private_key_max_bytes = n;
        }
        if let Some(url) = lookup("PDF_NOTARY_TSA_URL") {
            self.tsa.url = Some(url);
        }
        if let Some(user) = lookup("PDF_NOTARY_TSA_USERNAME") {
            self.tsa.username = Some(user);
        }
        if let Some(password) = lookup("PDF_NOTARY_TSA_PASSWORD") {
            self.tsa.password = Some(password);
        }
        if let Some(filter) = lookup("PDF_NOTARY_LOG_FILTER") {
            self.logging.filter = filter;
        }
        if let Some(json) = lookup("PDF_NOTARY_LOG_JSON").and_then(|v| v.parse().ok()) {
            self.logging.json = json;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("pdf.max_bytes", self.pdf.max_bytes),
            ("pdf.batch_max_count", self.pdf.batch_max_count),
            ("storage.private_key_max_bytes", self.storage.private_key_max_bytes),
            ("storage.seal_image_max_bytes", self.storage.seal_image_max_bytes),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.storage.seal_image_content_types.is_empty() {
            return Err(ConfigError::Invalid {
                key: "storage.seal_image_content_types",
                reason: "at least one content type must be allowed".to_string(),
            });
        }

        if self.storage.master_key.is_some() {
            self.master_key_bytes()?;
        }

        Ok(())
    }

    /// Decodes the configured master key. Fails if it is absent or is not
    /// exactly 32 bytes of hex.
    pub fn master_key_bytes(&self) -> Result<[u8; 32], ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            key: "storage.master_key",
            reason: reason.to_string(),
        };

        let hex = self
            .storage
            .master_key
            .as_deref()
            .map(str::trim)
            .ok_or_else(|| invalid("not configured"))?;
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid("expected 64 hexadecimal characters"));
        }

        let mut key = [0u8; 32];
        for (byte, pair) in key.iter_mut().zip(hex.as_bytes().chunks(2)) {
            let pair = std::str::from_utf8(pair).map_err(|_| invalid("not ASCII"))?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| invalid("not hexadecimal"))?;
        }
        Ok(key)
    }
}
