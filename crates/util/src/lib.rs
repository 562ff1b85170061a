pub mod config;

use std::{env, net::SocketAddr};

pub use config::{AppConfig, ConfigError, Environment, RateLimitConfig};

/// Bind address used when `APP_BIND_ADDR` is not set.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Loads a `.env` file into the process environment when one exists.
///
/// A missing file is not an error; deployed environments configure the
/// process directly.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}

/// Resolves the HTTP listen address from `APP_BIND_ADDR`, falling back to
/// [`DEFAULT_BIND_ADDR`].
pub fn server_bind_address() -> Result<SocketAddr, std::net::AddrParseError> {
    env::var("APP_BIND_ADDR")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
        .parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn falls_back_to_default_bind_address() {
        let _lock = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var("APP_BIND_ADDR");
        assert_eq!(
            server_bind_address().expect("default parses").to_string(),
            DEFAULT_BIND_ADDR
        );
    }

    #[test]
    fn honours_bind_address_override() {
        let _lock = ENV_GUARD.lock().expect("env guard poisoned");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        assert_eq!(
            server_bind_address().expect("override parses").to_string(),
            "0.0.0.0:9000"
        );
        env::remove_var("APP_BIND_ADDR");
    }
}
