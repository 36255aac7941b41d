// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the slipstream engine.

use std::net::SocketAddr;
use std::time::Duration;

use crate::auth::oidc::OidcConfig;
use crate::reconciler::ReconcilerConfig;
use crate::scheduler::SchedulerConfig;

/// Authentication settings.
#[derive(Debug, Clone)]
pub enum AuthSettings {
    /// No authentication.
    None,
    /// Static bearer token.
    Token {
        /// The shared secret.
        secret: String,
    },
    /// OIDC bearer tokens.
    Oidc(OidcConfig),
}

impl AuthSettings {
    /// Wire form of the mode.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Token { .. } => "token",
            Self::Oidc(_) => "oidc",
        }
    }
}

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// gRPC bind address.
    pub grpc_addr: SocketAddr,
    /// Database URL. Absent means persistence is disabled.
    pub database_url: Option<String>,
    /// Database connection pool size.
    pub db_pool_size: u32,
    /// Authentication settings.
    pub auth: AuthSettings,
    /// Require user principals to carry an organization claim.
    pub require_org_scope: bool,
    /// Scheduler knobs.
    pub scheduler: SchedulerConfig,
    /// Reconciler knobs.
    pub reconciler: ReconcilerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("SLIPSTREAM_GRPC_PORT")
            .unwrap_or_else(|_| "7700".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;
        let grpc_addr = SocketAddr::from(([0, 0, 0, 0], port));

        // Persistence is optional; without a database the engine keeps runs
        // only in memory and the scheduler/reconciler stay off.
        let database_url = std::env::var("SLIPSTREAM_DATABASE_URL").ok();

        let db_pool_size = env_parse("SLIPSTREAM_DB_POOL_SIZE", 10)?;

        let auth = match std::env::var("SLIPSTREAM_AUTH_MODE")
            .unwrap_or_else(|_| "none".to_string())
            .as_str()
        {
            "none" => AuthSettings::None,
            "token" => AuthSettings::Token {
                secret: std::env::var("SLIPSTREAM_AUTH_TOKEN")
                    .map_err(|_| ConfigError::MissingEnvVar("SLIPSTREAM_AUTH_TOKEN"))?,
            },
            "oidc" => AuthSettings::Oidc(oidc_from_env()?),
            other => return Err(ConfigError::InvalidAuthMode(other.to_string())),
        };

        let require_org_scope = env_bool("SLIPSTREAM_REQUIRE_ORG_SCOPE", false);

        let scheduler = SchedulerConfig {
            poll_interval: env_duration_secs("SLIPSTREAM_SCHEDULER_POLL_INTERVAL_SECS", 10)?,
            batch_size: env_parse("SLIPSTREAM_SCHEDULER_BATCH_SIZE", 100)?,
            stale_grace: env_duration_secs("SLIPSTREAM_SCHEDULER_STALE_GRACE_SECS", 600)?,
        };

        let reconciler = ReconcilerConfig {
            poll_interval: env_duration_secs("SLIPSTREAM_RECONCILER_INTERVAL_SECS", 60)?,
            tick_timeout: Duration::from_secs(120),
            running_grace: env_duration_secs("SLIPSTREAM_RECONCILER_RUNNING_GRACE_SECS", 180)?,
            stale_run_threshold: env_duration_secs(
                "SLIPSTREAM_RECONCILER_STALE_RUN_THRESHOLD_SECS",
                7200,
            )?,
            batch_size: env_parse("SLIPSTREAM_RECONCILER_BATCH_SIZE", 500)?,
        };

        Ok(Self {
            grpc_addr,
            database_url,
            db_pool_size,
            auth,
            require_org_scope,
            scheduler,
            reconciler,
        })
    }
}

fn oidc_from_env() -> Result<OidcConfig, ConfigError> {
    let issuer = std::env::var("SLIPSTREAM_OIDC_ISSUER")
        .map_err(|_| ConfigError::MissingEnvVar("SLIPSTREAM_OIDC_ISSUER"))?;
    let audience = std::env::var("SLIPSTREAM_OIDC_AUDIENCE")
        .map_err(|_| ConfigError::MissingEnvVar("SLIPSTREAM_OIDC_AUDIENCE"))?;
    let jwks_url = std::env::var("SLIPSTREAM_OIDC_JWKS_URL")
        .map_err(|_| ConfigError::MissingEnvVar("SLIPSTREAM_OIDC_JWKS_URL"))?;

    let client_id = std::env::var("SLIPSTREAM_OIDC_CLIENT_ID").unwrap_or_default();
    let device_authorization_endpoint =
        std::env::var("SLIPSTREAM_OIDC_DEVICE_AUTH_ENDPOINT").unwrap_or_default();
    let token_endpoint = std::env::var("SLIPSTREAM_OIDC_TOKEN_ENDPOINT").unwrap_or_default();

    let scopes = std::env::var("SLIPSTREAM_OIDC_SCOPES")
        .map(|raw| {
            raw.split([' ', ','])
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_else(|_| {
            vec![
                "openid".to_string(),
                "profile".to_string(),
                "email".to_string(),
            ]
        });

    let allowed_algorithms = std::env::var("SLIPSTREAM_OIDC_ALLOWED_ALGS")
        .map(|raw| OidcConfig::parse_algorithms(&raw))
        .unwrap_or_else(|_| OidcConfig::default_algorithms());

    Ok(OidcConfig {
        issuer,
        audience,
        client_id,
        jwks_url,
        device_authorization_endpoint,
        token_endpoint,
        scopes,
        allowed_algorithms,
    })
}

fn env_bool(var: &'static str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(var)),
        Err(_) => Ok(default),
    }
}

fn env_duration_secs(var: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(var, default_secs)?))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// An environment variable carries an unparsable value.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
    /// The auth mode is not one of none/token/oidc.
    #[error("Invalid auth mode: {0}")]
    InvalidAuthMode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn clear_all(guard: &mut EnvGuard) {
        for var in [
            "SLIPSTREAM_GRPC_PORT",
            "SLIPSTREAM_DATABASE_URL",
            "SLIPSTREAM_DB_POOL_SIZE",
            "SLIPSTREAM_AUTH_MODE",
            "SLIPSTREAM_AUTH_TOKEN",
            "SLIPSTREAM_OIDC_ISSUER",
            "SLIPSTREAM_OIDC_AUDIENCE",
            "SLIPSTREAM_OIDC_JWKS_URL",
            "SLIPSTREAM_OIDC_CLIENT_ID",
            "SLIPSTREAM_OIDC_SCOPES",
            "SLIPSTREAM_OIDC_ALLOWED_ALGS",
            "SLIPSTREAM_REQUIRE_ORG_SCOPE",
            "SLIPSTREAM_SCHEDULER_POLL_INTERVAL_SECS",
            "SLIPSTREAM_SCHEDULER_BATCH_SIZE",
            "SLIPSTREAM_RECONCILER_INTERVAL_SECS",
            "SLIPSTREAM_RECONCILER_RUNNING_GRACE_SECS",
            "SLIPSTREAM_RECONCILER_STALE_RUN_THRESHOLD_SECS",
        ] {
            guard.remove(var);
        }
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        let config = Config::from_env().unwrap();

        assert_eq!(config.grpc_addr.port(), 7700);
        assert!(config.database_url.is_none());
        assert_eq!(config.db_pool_size, 10);
        assert!(matches!(config.auth, AuthSettings::None));
        assert!(!config.require_org_scope);
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(10));
        assert_eq!(config.scheduler.batch_size, 100);
        assert_eq!(config.reconciler.poll_interval, Duration::from_secs(60));
        assert_eq!(config.reconciler.running_grace, Duration::from_secs(180));
        assert_eq!(
            config.reconciler.stale_run_threshold,
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn test_config_custom_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SLIPSTREAM_GRPC_PORT", "9100");

        let config = Config::from_env().unwrap();
        assert_eq!(config.grpc_addr.port(), 9100);
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SLIPSTREAM_GRPC_PORT", "not_a_number");

        assert!(matches!(Config::from_env(), Err(ConfigError::InvalidPort)));
    }

    #[test]
    fn test_token_mode_requires_secret() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SLIPSTREAM_AUTH_MODE", "token");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingEnvVar("SLIPSTREAM_AUTH_TOKEN")
        ));

        guard.set("SLIPSTREAM_AUTH_TOKEN", "s3cr3t");
        let config = Config::from_env().unwrap();
        assert!(matches!(config.auth, AuthSettings::Token { .. }));
        assert_eq!(config.auth.mode(), "token");
    }

    #[test]
    fn test_oidc_mode_requires_issuer_audience_jwks() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SLIPSTREAM_AUTH_MODE", "oidc");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::MissingEnvVar("SLIPSTREAM_OIDC_ISSUER"))
        ));

        guard.set("SLIPSTREAM_OIDC_ISSUER", "https://issuer.example.test");
        guard.set("SLIPSTREAM_OIDC_AUDIENCE", "slipstream");
        guard.set(
            "SLIPSTREAM_OIDC_JWKS_URL",
            "https://issuer.example.test/jwks",
        );

        let config = Config::from_env().unwrap();
        let AuthSettings::Oidc(oidc) = &config.auth else {
            panic!("expected oidc settings");
        };
        assert_eq!(oidc.issuer, "https://issuer.example.test");
        assert_eq!(oidc.scopes, vec!["openid", "profile", "email"]);
        assert_eq!(
            oidc.allowed_algorithms,
            OidcConfig::default_algorithms()
        );
    }

    #[test]
    fn test_oidc_custom_scopes_and_algs() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SLIPSTREAM_AUTH_MODE", "oidc");
        guard.set("SLIPSTREAM_OIDC_ISSUER", "https://issuer.example.test");
        guard.set("SLIPSTREAM_OIDC_AUDIENCE", "slipstream");
        guard.set(
            "SLIPSTREAM_OIDC_JWKS_URL",
            "https://issuer.example.test/jwks",
        );
        guard.set("SLIPSTREAM_OIDC_SCOPES", "openid offline_access");
        guard.set("SLIPSTREAM_OIDC_ALLOWED_ALGS", "RS256,ES256");

        let config = Config::from_env().unwrap();
        let AuthSettings::Oidc(oidc) = &config.auth else {
            panic!("expected oidc settings");
        };
        assert_eq!(oidc.scopes, vec!["openid", "offline_access"]);
        assert_eq!(oidc.allowed_algorithms.len(), 2);
    }

    #[test]
    fn test_invalid_auth_mode() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SLIPSTREAM_AUTH_MODE", "basic");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidAuthMode(mode)) if mode == "basic"
        ));
    }

    #[test]
    fn test_scheduler_and_reconciler_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SLIPSTREAM_SCHEDULER_POLL_INTERVAL_SECS", "3");
        guard.set("SLIPSTREAM_SCHEDULER_BATCH_SIZE", "25");
        guard.set("SLIPSTREAM_RECONCILER_INTERVAL_SECS", "30");
        guard.set("SLIPSTREAM_RECONCILER_STALE_RUN_THRESHOLD_SECS", "3600");

        let config = Config::from_env().unwrap();
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(3));
        assert_eq!(config.scheduler.batch_size, 25);
        assert_eq!(config.reconciler.poll_interval, Duration::from_secs(30));
        assert_eq!(
            config.reconciler.stale_run_threshold,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_require_org_scope_flag() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SLIPSTREAM_REQUIRE_ORG_SCOPE", "1");

        let config = Config::from_env().unwrap();
        assert!(config.require_org_scope);
    }
}
