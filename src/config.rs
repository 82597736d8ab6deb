//! Configuration for the apix-cloud server.
//!
//! Every setting is a CLI flag with an environment variable fallback. [`Config::load`] parses and then applies the cross-field rules, including the
//! stricter ones for production.

use clap::Parser;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::chain::rpc::RpcSettings;
use crate::verification::VerificationSettings;

pub const PRODUCTION: &str = "production";
/// Value of `--store-path` that selects the in-memory store.
pub const MEMORY_STORE: &str = "memory";
const DEFAULT_STORE_FILE: &str = "apix-verification-store.json";

/// CLI arguments and environment variables.
#[derive(Parser, Debug, Clone)]
#[command(name = "apix-cloud")]
#[command(about = "Payment-verified credential and quota session server")]
pub struct Config {
    /// Deployment environment; `production` enables strict checks
    #[arg(long, env = "APIX_ENV", default_value = "development")]
    env: String,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// HMAC secret for issued credentials
    #[arg(long, env = "APIX_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    #[arg(long, env = "APIX_JWT_ISSUER", default_value = "apix-cloud")]
    jwt_issuer: String,

    #[arg(long, env = "APIX_JWT_KID", default_value = "v1")]
    jwt_kid: String,

    /// Credential lifetime in seconds
    #[arg(long, env = "APIX_JWT_TTL_SECONDS", default_value_t = 60)]
    jwt_ttl_seconds: u64,

    /// JSON-RPC endpoint of the chain node
    #[arg(long, env = "APIX_RPC_URL")]
    rpc_url: Option<Url>,

    #[arg(long, env = "APIX_RPC_TIMEOUT_MS", default_value_t = 8000)]
    rpc_timeout_ms: u64,

    #[arg(long, env = "APIX_RPC_MAX_RETRIES", default_value_t = 2)]
    rpc_max_retries: u32,

    /// Backoff unit between RPC attempts
    #[arg(long, env = "APIX_RPC_RETRY_DELAY_MS", default_value_t = 150)]
    rpc_retry_delay_ms: u64,

    /// Accept any transaction without on-chain checks (development only)
    #[arg(
        long,
        env = "APIX_ENABLE_MOCK_VERIFY",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    enable_mock_verify: bool,

    #[arg(long, env = "APIX_MIN_CONFIRMATIONS", default_value_t = 1)]
    min_confirmations: u64,

    /// Snapshot file shared by all instances, or `memory`
    #[arg(long, env = "APIX_VERIFICATION_STORE_PATH")]
    store_path: Option<String>,

    /// Comma-separated CORS origins, or `*`
    #[arg(
        long,
        env = "APIX_ALLOWED_ORIGINS",
        default_value = "http://localhost:5173,http://127.0.0.1:5173"
    )]
    allowed_origins: String,

    /// Requests allotted to each credential
    #[arg(long, env = "APIX_SESSION_QUOTA", default_value_t = 100)]
    session_quota: u32,

    #[arg(long, env = "APIX_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("APIX_JWT_SECRET must not be empty")]
    MissingJwtSecret,
    #[error("APIX_RPC_URL is required unless mock verification is enabled")]
    MissingRpcUrl,
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("APIX_ENABLE_MOCK_VERIFY must be false in production")]
    MockVerifyInProduction,
    #[error("APIX_ALLOWED_ORIGINS cannot be '*' in production")]
    AnyOriginInProduction,
    #[error("APIX_VERIFICATION_STORE_PATH must be set explicitly in production")]
    ImplicitStoreInProduction,
    #[error("APIX_ALLOWED_ORIGINS must not be empty")]
    NoOrigins,
    #[error("{0}")]
    Cli(String),
}

/// Where verification state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(BTreeSet<String>),
}

impl Config {
    /// Parses the command line and environment, and validates the result.
    ///
    /// Call after `.env` has been loaded so its values count as environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::parse().validated()
    }

    /// Parses and validates an explicit argument list.
    pub fn try_load_from<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(args)
            .map_err(|e| ConfigError::Cli(e.to_string()))?
            .validated()
    }

    fn validated(mut self) -> Result<Self, ConfigError> {
        self.env = self.env.trim().to_lowercase();
        if self.jwt_secret.trim().is_empty() {
            return Err(ConfigError::MissingJwtSecret);
        }
        for (name, value) in [
            ("APIX_JWT_TTL_SECONDS", self.jwt_ttl_seconds),
            ("APIX_RPC_TIMEOUT_MS", self.rpc_timeout_ms),
            ("APIX_MIN_CONFIRMATIONS", self.min_confirmations),
            ("APIX_SWEEP_INTERVAL_SECS", self.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive(name));
            }
        }
        if !self.enable_mock_verify && self.rpc_url.is_none() {
            return Err(ConfigError::MissingRpcUrl);
        }
        let origins = self.allowed_origins();
        if matches!(&origins, AllowedOrigins::List(list) if list.is_empty()) {
            return Err(ConfigError::NoOrigins);
        }
        if self.is_production() {
            if self.enable_mock_verify {
                return Err(ConfigError::MockVerifyInProduction);
            }
            if origins == AllowedOrigins::Any {
                return Err(ConfigError::AnyOriginInProduction);
            }
            if self
                .store_path
                .as_deref()
                .is_none_or(|path| path.trim().is_empty())
            {
                return Err(ConfigError::ImplicitStoreInProduction);
            }
        }
        Ok(self)
    }

    pub fn environment(&self) -> &str {
        &self.env
    }

    pub fn is_production(&self) -> bool {
        self.env == PRODUCTION
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn jwt_secret(&self) -> &str {
        &self.jwt_secret
    }

    pub fn jwt_issuer(&self) -> &str {
        &self.jwt_issuer
    }

    pub fn jwt_kid(&self) -> &str {
        &self.jwt_kid
    }

    pub fn jwt_ttl(&self) -> Duration {
        Duration::from_secs(self.jwt_ttl_seconds)
    }

    pub fn rpc_url(&self) -> Option<&Url> {
        self.rpc_url.as_ref()
    }

    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings {
            timeout: Duration::from_millis(self.rpc_timeout_ms),
            max_retries: self.rpc_max_retries,
            retry_delay: Duration::from_millis(self.rpc_retry_delay_ms),
        }
    }

    pub fn verification_settings(&self) -> VerificationSettings {
        VerificationSettings {
            mock_verify: self.enable_mock_verify,
            default_min_confirmations: self.min_confirmations,
            session_quota: self.session_quota,
        }
    }

    /// The configured store, defaulting to a file in the system temp directory.
    pub fn store_location(&self) -> StoreLocation {
        match self.store_path.as_deref().map(str::trim) {
            Some(path) if path.eq_ignore_ascii_case(MEMORY_STORE) => StoreLocation::Memory,
            Some(path) if !path.is_empty() => StoreLocation::File(PathBuf::from(path)),
            _ => StoreLocation::File(std::env::temp_dir().join(DEFAULT_STORE_FILE)),
        }
    }

    pub fn allowed_origins(&self) -> AllowedOrigins {
        let origins: BTreeSet<String> = self
            .allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();
        if origins.contains("*") {
            AllowedOrigins::Any
        } else {
            AllowedOrigins::List(origins)
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
