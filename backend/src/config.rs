use anyhow::{anyhow, bail};
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::services::activity::ActivityConfig;
use crate::services::csrf::CsrfConfig;
use crate::services::rate_limit::{RateLimitConfig, RateLimitPolicy};
use crate::services::session_store::SessionConfig;
use crate::utils::cookies::{CookieOptions, SameSite};
use crate::utils::jwt::TokenConfig;

const DEVELOPMENT_ENV: &str = "development";
const DEVELOPMENT_JWT_SECRET: &str = "development-only-secret-change-me-0123456789";
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub app_env: String,

    pub redis_url: Option<String>,
    pub redis_pool_size: u32,
    pub redis_connect_timeout: u64,
    pub store_op_timeout_ms: u64,

    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub session_token_minutes: i64,
    pub access_token_minutes: i64,
    pub session_expiration_days: i64,

    pub csrf_grace_seconds: u64,
    pub csrf_max_ttl_days: u64,
    pub csrf_lock_ttl_seconds: u64,

    pub activity_active_minutes: i64,
    pub activity_online_minutes: i64,
    pub activity_sweep_interval_minutes: u64,

    pub rate_limit_window_seconds: u64,
    pub rate_limit_max_attempts: u32,
    pub rate_limit_block_seconds: u64,
    pub rate_limit_csrf_window_seconds: u64,
    pub rate_limit_csrf_max_attempts: u32,
    pub rate_limit_csrf_block_seconds: u64,
    pub rate_limit_fail_closed: bool,

    pub trust_forwarded_for: bool,
    pub cookie_secure: bool,
    pub cookie_same_site: SameSite,
    pub cors_allow_origins: Vec<String>,
    pub admin_api_key: Option<String>,
    pub dev_login_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            app_env: DEVELOPMENT_ENV.to_string(),
            redis_url: None,
            redis_pool_size: 10,
            redis_connect_timeout: 5,
            store_op_timeout_ms: 500,
            jwt_secret: DEVELOPMENT_JWT_SECRET.to_string(),
            jwt_issuer: "riftgate".to_string(),
            jwt_audience: "riftgate".to_string(),
            session_token_minutes: 4320,
            access_token_minutes: 60,
            session_expiration_days: 3,
            csrf_grace_seconds: 30,
            csrf_max_ttl_days: 7,
            csrf_lock_ttl_seconds: 5,
            activity_active_minutes: 5,
            activity_online_minutes: 15,
            activity_sweep_interval_minutes: 5,
            rate_limit_window_seconds: 60,
            rate_limit_max_attempts: 120,
            rate_limit_block_seconds: 300,
            rate_limit_csrf_window_seconds: 60,
            rate_limit_csrf_max_attempts: 3,
            rate_limit_csrf_block_seconds: 300,
            rate_limit_fail_closed: true,
            trust_forwarded_for: false,
            cookie_secure: true,
            cookie_same_site: SameSite::Strict,
            cors_allow_origins: vec!["http://localhost:3000".to_string()],
            admin_api_key: None,
            dev_login_enabled: false,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a configuration from any variable source, starting from the
    /// development defaults. Unparseable values are errors, never silently
    /// replaced by the default.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Config::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let app_env = var("APP_ENV").unwrap_or(d.app_env);
        let jwt_secret = match var("JWT_SECRET") {
            Some(secret) => secret,
            None if app_env == DEVELOPMENT_ENV => d.jwt_secret,
            None => bail!("JWT_SECRET must be set when APP_ENV is '{}'", app_env),
        };

        let cors_allow_origins = var("CORS_ALLOW_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|o| o.trim().trim_end_matches('/').to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or(d.cors_allow_origins);

        let config = Config {
            bind_addr: parse_var(&var, "BIND_ADDR", d.bind_addr)?,
            app_env,
            redis_url: var("REDIS_URL"),
            redis_pool_size: parse_var(&var, "REDIS_POOL_SIZE", d.redis_pool_size)?,
            redis_connect_timeout: parse_var(&var, "REDIS_CONNECT_TIMEOUT", d.redis_connect_timeout)?,
            store_op_timeout_ms: parse_var(&var, "STORE_OP_TIMEOUT_MS", d.store_op_timeout_ms)?,
            jwt_secret,
            jwt_issuer: var("JWT_ISSUER").unwrap_or(d.jwt_issuer),
            jwt_audience: var("JWT_AUDIENCE").unwrap_or(d.jwt_audience),
            session_token_minutes: parse_var(&var, "SESSION_TOKEN_MINUTES", d.session_token_minutes)?,
            access_token_minutes: parse_var(&var, "ACCESS_TOKEN_MINUTES", d.access_token_minutes)?,
            session_expiration_days: parse_var(
                &var,
                "SESSION_EXPIRATION_DAYS",
                d.session_expiration_days,
            )?,
            csrf_grace_seconds: parse_var(&var, "CSRF_GRACE_SECONDS", d.csrf_grace_seconds)?,
            csrf_max_ttl_days: parse_var(&var, "CSRF_MAX_TTL_DAYS", d.csrf_max_ttl_days)?,
            csrf_lock_ttl_seconds: parse_var(&var, "CSRF_LOCK_TTL_SECONDS", d.csrf_lock_ttl_seconds)?,
            activity_active_minutes: parse_var(
                &var,
                "ACTIVITY_ACTIVE_MINUTES",
                d.activity_active_minutes,
            )?,
            activity_online_minutes: parse_var(
                &var,
                "ACTIVITY_ONLINE_MINUTES",
                d.activity_online_minutes,
            )?,
            activity_sweep_interval_minutes: parse_var(
                &var,
                "ACTIVITY_SWEEP_INTERVAL_MINUTES",
                d.activity_sweep_interval_minutes,
            )?,
            rate_limit_window_seconds: parse_var(
                &var,
                "RATE_LIMIT_WINDOW_SECONDS",
                d.rate_limit_window_seconds,
            )?,
            rate_limit_max_attempts: parse_var(
                &var,
                "RATE_LIMIT_MAX_ATTEMPTS",
                d.rate_limit_max_attempts,
            )?,
            rate_limit_block_seconds: parse_var(
                &var,
                "RATE_LIMIT_BLOCK_SECONDS",
                d.rate_limit_block_seconds,
            )?,
            rate_limit_csrf_window_seconds: parse_var(
                &var,
                "RATE_LIMIT_CSRF_WINDOW_SECONDS",
                d.rate_limit_csrf_window_seconds,
            )?,
            rate_limit_csrf_max_attempts: parse_var(
                &var,
                "RATE_LIMIT_CSRF_MAX_ATTEMPTS",
                d.rate_limit_csrf_max_attempts,
            )?,
            rate_limit_csrf_block_seconds: parse_var(
                &var,
                "RATE_LIMIT_CSRF_BLOCK_SECONDS",
                d.rate_limit_csrf_block_seconds,
            )?,
            rate_limit_fail_closed: parse_var(
                &var,
                "RATE_LIMIT_FAIL_CLOSED",
                d.rate_limit_fail_closed,
            )?,
            trust_forwarded_for: parse_var(&var, "TRUST_FORWARDED_FOR", d.trust_forwarded_for)?,
            cookie_secure: parse_var(&var, "COOKIE_SECURE", d.cookie_secure)?,
            cookie_same_site: var("COOKIE_SAME_SITE")
                .map(|raw| raw.parse::<SameSite>().map_err(|e| anyhow!("COOKIE_SAME_SITE: {e}")))
                .transpose()?
                .unwrap_or(d.cookie_same_site),
            cors_allow_origins,
            admin_api_key: var("ADMIN_API_KEY"),
            dev_login_enabled: parse_var(&var, "DEV_LOGIN_ENABLED", d.dev_login_enabled)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jwt_secret.len() < MIN_SECRET_LEN {
            bail!("JWT_SECRET must be at least {} bytes", MIN_SECRET_LEN);
        }
        if self.activity_active_minutes <= 0
            || self.activity_active_minutes >= self.activity_online_minutes
        {
            bail!(
                "ACTIVITY_ACTIVE_MINUTES ({}) must be positive and below ACTIVITY_ONLINE_MINUTES ({})",
                self.activity_active_minutes,
                self.activity_online_minutes
            );
        }
        if self.rate_limit_max_attempts == 0 || self.rate_limit_csrf_max_attempts == 0 {
            bail!("rate limit max attempts must be at least 1");
        }
        let positive = [
            ("REDIS_POOL_SIZE", self.redis_pool_size as i64),
            ("STORE_OP_TIMEOUT_MS", self.store_op_timeout_ms as i64),
            ("SESSION_TOKEN_MINUTES", self.session_token_minutes),
            ("ACCESS_TOKEN_MINUTES", self.access_token_minutes),
            ("SESSION_EXPIRATION_DAYS", self.session_expiration_days),
            ("CSRF_GRACE_SECONDS", self.csrf_grace_seconds as i64),
            ("CSRF_MAX_TTL_DAYS", self.csrf_max_ttl_days as i64),
            ("CSRF_LOCK_TTL_SECONDS", self.csrf_lock_ttl_seconds as i64),
            (
                "ACTIVITY_SWEEP_INTERVAL_MINUTES",
                self.activity_sweep_interval_minutes as i64,
            ),
            ("RATE_LIMIT_WINDOW_SECONDS", self.rate_limit_window_seconds as i64),
            ("RATE_LIMIT_BLOCK_SECONDS", self.rate_limit_block_seconds as i64),
            (
                "RATE_LIMIT_CSRF_WINDOW_SECONDS",
                self.rate_limit_csrf_window_seconds as i64,
            ),
            (
                "RATE_LIMIT_CSRF_BLOCK_SECONDS",
                self.rate_limit_csrf_block_seconds as i64,
            ),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value <= 0) {
            bail!("{} must be greater than zero", name);
        }
        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.app_env == DEVELOPMENT_ENV
    }

    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            secret: self.jwt_secret.clone(),
            issuer: self.jwt_issuer.clone(),
            audience: self.jwt_audience.clone(),
            session_token_ttl: chrono::Duration::minutes(self.session_token_minutes),
            access_token_ttl: chrono::Duration::minutes(self.access_token_minutes),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            expiration: chrono::Duration::days(self.session_expiration_days),
        }
    }

    pub fn csrf_config(&self) -> CsrfConfig {
        CsrfConfig {
            grace_period: Duration::from_secs(self.csrf_grace_seconds),
            max_ttl: Duration::from_secs(self.csrf_max_ttl_days * 24 * 60 * 60),
            lock_ttl: Duration::from_secs(self.csrf_lock_ttl_seconds),
        }
    }

    pub fn activity_config(&self) -> ActivityConfig {
        ActivityConfig {
            active_threshold: chrono::Duration::minutes(self.activity_active_minutes),
            online_threshold: chrono::Duration::minutes(self.activity_online_minutes),
            sweep_interval: Duration::from_secs(self.activity_sweep_interval_minutes * 60),
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            environment: self.app_env.clone(),
            ordinary: RateLimitPolicy {
                window: Duration::from_secs(self.rate_limit_window_seconds),
                max_attempts: self.rate_limit_max_attempts,
                block_duration: Duration::from_secs(self.rate_limit_block_seconds),
            },
            csrf: RateLimitPolicy {
                window: Duration::from_secs(self.rate_limit_csrf_window_seconds),
                max_attempts: self.rate_limit_csrf_max_attempts,
                block_duration: Duration::from_secs(self.rate_limit_csrf_block_seconds),
            },
            fail_closed: self.rate_limit_fail_closed,
        }
    }

    pub fn cookie_options(&self) -> CookieOptions {
        CookieOptions {
            secure: self.cookie_secure,
            same_site: self.cookie_same_site,
        }
    }
}

fn parse_var<T, F>(var: &F, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {} value '{}': {}", name, raw, e)),
        None => Ok(default),
    }
}
