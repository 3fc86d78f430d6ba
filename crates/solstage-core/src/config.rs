// Configuration loading and parsing (solstage.toml, credentials.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub indexer: IndexerConfig,
    pub pointer: PointerConfig,
    pub storage: StorageConfig,
    pub swap: SwapConfig,
    pub wallet: WalletConfig,
    pub credentials: CredentialsConfig,
    pub db_path: String,
}

impl Config {
    /// Helius endpoint with the API key substituted. `None` when the URL
    /// needs a key and none is configured.
    pub fn helius_url(&self) -> Option<String> {
        let url = &self.indexer.helius_rpc_url;
        if !url.contains(API_KEY_PLACEHOLDER) {
            return Some(url.clone());
        }
        match &self.credentials.helius_api_key {
            Some(key) if !key.is_empty() => Some(url.replace(API_KEY_PLACEHOLDER, key)),
            _ => None,
        }
    }
}

const API_KEY_PLACEHOLDER: &str = "{api_key}";

// ---------------------------------------------------------------------------
// solstage.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire solstage.toml file.
#[derive(Debug, Clone, Deserialize)]
struct SolstageFile {
    cluster: ClusterConfig,
    indexer: IndexerConfig,
    pointer: PointerConfig,
    storage: StorageConfig,
    swap: SwapConfig,
    #[serde(default)]
    wallet: WalletConfig,
    database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseSection {
    path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub rpc_url: String,
    #[serde(default = "default_commitment")]
    pub commitment: String,
    /// Seconds to wait for a sent transaction to reach `commitment`.
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,
}

fn default_commitment() -> String {
    "confirmed".into()
}

fn default_confirm_timeout() -> u64 {
    60
}

/// Which indexer lists a wallet's NFTs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexerSource {
    Helius,
    Solflare,
    /// Token accounts plus Metaplex metadata, read straight from the cluster.
    Metaplex,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    pub source: IndexerSource,
    /// DAS endpoint; may contain `{api_key}`.
    pub helius_rpc_url: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub max_attempts: u32,
    pub page_delay_ms: u64,
    /// Base backoff between attempts at one page; multiplied by the attempt number.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    pub solflare_url: String,
    pub cache_ttl_secs: u64,
}

fn default_retry_delay() -> u64 {
    1000
}

/// Where the filter pointer is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerSource {
    Memo,
    Program,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointerConfig {
    pub source: PointerSource,
    pub program_id: String,
    /// How many recent signatures to scan for a memo pointer.
    pub scan_limit: usize,
    /// Reject memo payloads whose blockSlot is older than this many slots
    /// before the transaction. 0 disables the check.
    #[serde(default)]
    pub max_slot_age: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub public_base_url: String,
    /// Pin a storage account. When unset, the owner's account named
    /// `identifier` is looked up and created on first write.
    #[serde(default)]
    pub storage_account: Option<String>,
    pub file_name: String,
    #[serde(default = "default_storage_identifier")]
    pub identifier: String,
    /// Size reserved when creating the account, e.g. "100KB" or "1MB".
    #[serde(default = "default_initial_size")]
    pub initial_size: String,
    #[serde(default = "default_storage_program")]
    pub program_id: String,
    /// Co-signer the storage endpoint uses for account creation.
    #[serde(default = "default_storage_uploader")]
    pub uploader: String,
}

fn default_storage_identifier() -> String {
    "solstage".into()
}

fn default_initial_size() -> String {
    "100KB".into()
}

fn default_storage_program() -> String {
    crate::keys::SHADOW_DRIVE_PROGRAM_ID.into()
}

fn default_storage_uploader() -> String {
    crate::keys::SHADOW_DRIVE_UPLOADER.into()
}

/// Parse a storage size such as "100KB", "10MB" or "1GB" into bytes.
/// Units are powers of 1024; a bare number is bytes.
pub fn parse_storage_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        _ => return None,
    };
    value.checked_mul(multiplier).filter(|bytes| *bytes > 0)
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwapConfig {
    pub quote_url: String,
    pub swap_url: String,
    pub slippage_bps: u32,
    pub priority_micro_lamports: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    /// Solana CLI keypair file. When unset, `~/.config/solana/id.json`.
    #[serde(default)]
    pub keypair_path: Option<String>,
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub helius_api_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/solstage.toml` and
/// (optionally) `config/credentials.toml`, relative to `base_dir`.
///
/// This does not copy defaults; `load_config()` does.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- solstage.toml (required) ---
    let main_path = config_dir.join("solstage.toml");
    let main_text = read_file(&main_path)?;
    let file: SolstageFile = toml::from_str(&main_text).map_err(|e| ConfigError::ParseError {
        path: main_path.clone(),
        source: e,
    })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        cluster: file.cluster,
        indexer: file.indexer,
        pointer: file.pointer,
        storage: file.storage,
        swap: file.swap,
        wallet: file.wallet,
        credentials,
        db_path: file.database.path,
    };

    validate(&config)?;

    Ok(config)
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Returns the list of files that were copied. Skips `.example` files.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}; \
                     pass --base-dir or run from the project root",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let mut copied = Vec::new();

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();

        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        if file_name.to_str().is_some_and(|n| n.ends_with(".example")) {
            continue;
        }
        let target = config_dir.join(file_name);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                copied.push(target);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Copy missing defaults into `base_dir/config`, then load.
pub fn load_config(base_dir: &Path) -> Result<Config, ConfigError> {
    ensure_config_files(base_dir)?;
    load_config_from(base_dir)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let urls: &[(&str, &str)] = &[
        ("cluster.rpc_url", &config.cluster.rpc_url),
        ("indexer.helius_rpc_url", &config.indexer.helius_rpc_url),
        ("indexer.solflare_url", &config.indexer.solflare_url),
        ("storage.endpoint", &config.storage.endpoint),
        ("storage.public_base_url", &config.storage.public_base_url),
        ("swap.quote_url", &config.swap.quote_url),
        ("swap.swap_url", &config.swap.swap_url),
    ];
    for (name, val) in urls {
        if !(val.starts_with("http://") || val.starts_with("https://")) {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: format!("must be an http(s) URL, got `{val}`"),
            });
        }
    }

    let counts: &[(&str, u64)] = &[
        ("indexer.page_size", config.indexer.page_size as u64),
        ("indexer.max_pages", config.indexer.max_pages as u64),
        ("indexer.max_attempts", config.indexer.max_attempts as u64),
        ("pointer.scan_limit", config.pointer.scan_limit as u64),
        ("cluster.confirm_timeout_secs", config.cluster.confirm_timeout_secs),
        ("indexer.retry_delay_ms", config.indexer.retry_delay_ms),
    ];
    for (name, val) in counts {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    if !matches!(config.cluster.commitment.as_str(), "confirmed" | "finalized") {
        return Err(ConfigError::ValidationError {
            field: "cluster.commitment".into(),
            message: format!(
                "must be `confirmed` or `finalized`, got `{}`",
                config.cluster.commitment
            ),
        });
    }

    // getSignaturesForAddress caps `limit` at 1000.
    if config.pointer.scan_limit > 1000 {
        return Err(ConfigError::ValidationError {
            field: "pointer.scan_limit".into(),
            message: format!("must be at most 1000, got {}", config.pointer.scan_limit),
        });
    }

    if config.swap.slippage_bps > 10_000 {
        return Err(ConfigError::ValidationError {
            field: "swap.slippage_bps".into(),
            message: format!("must be at most 10000, got {}", config.swap.slippage_bps),
        });
    }

    if config.storage.file_name.is_empty() || config.storage.file_name.contains('/') {
        return Err(ConfigError::ValidationError {
            field: "storage.file_name".into(),
            message: "must be a bare file name".into(),
        });
    }

    let keys: &[(&str, &str)] = &[
        ("pointer.program_id", &config.pointer.program_id),
        ("storage.program_id", &config.storage.program_id),
        ("storage.uploader", &config.storage.uploader),
    ];
    for (name, val) in keys {
        if val.parse::<crate::keys::Pubkey>().is_err() {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: format!("`{val}` is not a base58 public key"),
            });
        }
    }
    if let Some(account) = &config.storage.storage_account {
        if account.parse::<crate::keys::Pubkey>().is_err() {
            return Err(ConfigError::ValidationError {
                field: "storage.storage_account".into(),
                message: format!("`{account}` is not a base58 public key"),
            });
        }
    }

    if config.storage.identifier.is_empty() {
        return Err(ConfigError::ValidationError {
            field: "storage.identifier".into(),
            message: "must not be empty".into(),
        });
    }
    if parse_storage_size(&config.storage.initial_size).is_none() {
        return Err(ConfigError::ValidationError {
            field: "storage.initial_size".into(),
            message: format!(
                "`{}` is not a size like 100KB, 10MB or 1GB",
                config.storage.initial_size
            ),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
