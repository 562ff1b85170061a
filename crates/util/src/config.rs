use std::{env, fmt, net::SocketAddr};

use url::Url;

use super::server_bind_address;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Token-bucket sizing for the three ingress limiters.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Sustained events per second accepted on the webhook path.
    pub webhook_per_sec: u32,
    /// Requests per minute accepted from a single caller on API routes.
    pub caller_per_min: u32,
    /// Aggregate requests per second across all callers.
    pub global_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            webhook_per_sec: 100,
            caller_per_min: 50,
            global_per_sec: 1000,
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub eventsub_secret: String,
    pub twitch_client_id: String,
    pub twitch_client_secret: String,
    pub twitch_helix_url: Url,
    pub twitch_oauth_url: Url,
    pub discord_bot_token: String,
    pub discord_api_url: Url,
    pub rate_limits: RateLimitConfig,
    /// Per-recipient outbound delivery budget in seconds.
    pub delivery_timeout_secs: u64,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://golive.db".to_string());
        let eventsub_secret = required_var("EVENTSUB_SECRET")?;
        let twitch_client_id = required_var("TWITCH_CLIENT_ID")?;
        let twitch_client_secret = required_var("TWITCH_CLIENT_SECRET")?;
        let discord_bot_token = required_var("DISCORD_BOT_TOKEN")?;

        let twitch_helix_url = url_var("TWITCH_HELIX_URL", "https://api.twitch.tv/helix/")?;
        let twitch_oauth_url = url_var("TWITCH_OAUTH_URL", "https://id.twitch.tv/oauth2/")?;
        let discord_api_url = url_var("DISCORD_API_URL", "https://discord.com/api/v10/")?;

        let rate_limits = RateLimitConfig {
            webhook_per_sec: numeric_var("RATE_WEBHOOK_PER_SEC", 100)?,
            caller_per_min: numeric_var("RATE_CALLER_PER_MIN", 50)?,
            global_per_sec: numeric_var("RATE_GLOBAL_PER_SEC", 1000)?,
        };
        let delivery_timeout_secs = numeric_var("DELIVERY_TIMEOUT_SECS", 10)? as u64;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            eventsub_secret,
            twitch_client_id,
            twitch_client_secret,
            twitch_helix_url,
            twitch_oauth_url,
            discord_bot_token,
            discord_api_url,
            rate_limits,
            delivery_timeout_secs,
        })
    }
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVariable(name))
}

fn url_var(name: &'static str, default: &str) -> Result<Url, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    Url::parse(&raw).map_err(|err| ConfigError::InvalidUrl(name, err))
}

fn numeric_var(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidNumber(name, raw)),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVariable(&'static str),
    InvalidUrl(&'static str, url::ParseError),
    InvalidNumber(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVariable(name) => write!(f, "required variable {name} is not set"),
            Self::InvalidUrl(name, err) => write!(f, "{name} is not a valid url: {err}"),
            Self::InvalidNumber(name, raw) => {
                write!(f, "{name} must be a positive integer (got {raw})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_BIND_ADDR;
    use std::sync::{LazyLock, Mutex};

    static ENV_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn set_required_vars() {
        env::set_var("EVENTSUB_SECRET", "secret");
        env::set_var("TWITCH_CLIENT_ID", "client");
        env::set_var("TWITCH_CLIENT_SECRET", "client-secret");
        env::set_var("DISCORD_BOT_TOKEN", "bot-token");
    }

    fn clear_vars() {
        for name in [
            "APP_ENV",
            "APP_BIND_ADDR",
            "DATABASE_URL",
            "EVENTSUB_SECRET",
            "TWITCH_CLIENT_ID",
            "TWITCH_CLIENT_SECRET",
            "DISCORD_BOT_TOKEN",
            "RATE_WEBHOOK_PER_SEC",
            "DELIVERY_TIMEOUT_SECS",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();
        set_required_vars();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.rate_limits.webhook_per_sec, 100);
        assert_eq!(config.delivery_timeout_secs, 10);
        assert_eq!(
            config.discord_api_url.as_str(),
            "https://discord.com/api/v10/"
        );
        clear_vars();
    }

    #[test]
    fn errors_when_secret_missing() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();
        env::set_var("TWITCH_CLIENT_ID", "client");
        env::set_var("TWITCH_CLIENT_SECRET", "client-secret");
        env::set_var("DISCORD_BOT_TOKEN", "bot-token");

        let err = AppConfig::from_env().expect_err("missing secret should error");
        assert!(matches!(
            err,
            ConfigError::MissingVariable("EVENTSUB_SECRET")
        ));
        clear_vars();
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();
        set_required_vars();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));
        clear_vars();
    }

    #[test]
    fn parses_limiter_overrides() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();
        set_required_vars();
        env::set_var("RATE_WEBHOOK_PER_SEC", "25");
        env::set_var("DELIVERY_TIMEOUT_SECS", "5");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.rate_limits.webhook_per_sec, 25);
        assert_eq!(config.delivery_timeout_secs, 5);
        clear_vars();
    }
}
