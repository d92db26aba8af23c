// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own sizing variables.

use std::{net::SocketAddr, time::Duration};

const DEV_JWT_SECRET: &str = "tandem_local_development_jwt_secret_must_be_32_chars";

/// Which cross-process bus carries stream event signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// PostgreSQL LISTEN/NOTIFY; required when more than one server process runs.
    Postgres,
    /// In-process broadcast channel for single-process deployments.
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub jwt_secret: String,
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    pub log_filter: String,
    pub log_format: LogFormat,
    pub lock_ttl: Duration,
    /// Heartbeat window after which a presence entry is no longer listed.
    pub presence_ttl: Duration,
    /// Storage reclaim interval; `None` disables the sweep.
    pub sweep_interval: Option<Duration>,
    pub sse_keepalive: Duration,
    /// Per-connection buffer of pending pushes before live events are dropped.
    pub sse_buffer: usize,
    pub bus: BusKind,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_HOST` | `0.0.0.0` |
    /// | `TANDEM_PORT` | `8080` |
    /// | `TANDEM_JWT_SECRET` | dev-only placeholder |
    /// | `TANDEM_DATABASE_URL` | *(none)* |
    /// | `TANDEM_CORS_ORIGINS` | *(none; cors.rs uses dev defaults)* |
    /// | `TANDEM_LOG_FILTER` | `info` |
    /// | `TANDEM_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `TANDEM_LOCK_TTL_SECS` | `300` |
    /// | `TANDEM_PRESENCE_TTL_SECS` | `60` |
    /// | `TANDEM_SWEEP_INTERVAL_SECS` | `60` (`0` disables) |
    /// | `TANDEM_SSE_KEEPALIVE_SECS` | `15` |
    /// | `TANDEM_SSE_BUFFER` | `256` |
    /// | `TANDEM_BUS` | `postgres` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("TANDEM_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "TANDEM_PORT", 8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("TANDEM_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("TANDEM_DATABASE_URL").ok();
        let cors_origins = env("TANDEM_CORS_ORIGINS").ok();
        let log_filter = env("TANDEM_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("TANDEM_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let lock_ttl = Duration::from_secs(parse_or(&env, "TANDEM_LOCK_TTL_SECS", 300u64).max(1));
        let presence_ttl =
            Duration::from_secs(parse_or(&env, "TANDEM_PRESENCE_TTL_SECS", 60u64).max(1));
        let sweep_interval = match parse_or(&env, "TANDEM_SWEEP_INTERVAL_SECS", 60u64) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let sse_keepalive =
            Duration::from_secs(parse_or(&env, "TANDEM_SSE_KEEPALIVE_SECS", 15u64).max(1));
        let sse_buffer = parse_or(&env, "TANDEM_SSE_BUFFER", 256usize).max(1);
        let bus = match env("TANDEM_BUS").as_deref() {
            Ok("memory") => BusKind::Memory,
            _ => BusKind::Postgres,
        };

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            cors_origins,
            log_filter,
            log_format,
            lock_ttl,
            presence_ttl,
            sweep_interval,
            sse_keepalive,
            sse_buffer,
            bus,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert!(cfg.cors_origins.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.lock_ttl, Duration::from_secs(300));
        assert_eq!(cfg.presence_ttl, Duration::from_secs(60));
        assert_eq!(cfg.sweep_interval, Some(Duration::from_secs(60)));
        assert_eq!(cfg.sse_keepalive, Duration::from_secs(15));
        assert_eq!(cfg.sse_buffer, 256);
        assert_eq!(cfg.bus, BusKind::Postgres);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("TANDEM_HOST", "127.0.0.1");
        m.insert("TANDEM_PORT", "3000");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("TANDEM_PORT", "not_a_number");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("TANDEM_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn lock_and_presence_windows_override() {
        let mut m = HashMap::new();
        m.insert("TANDEM_LOCK_TTL_SECS", "30");
        m.insert("TANDEM_PRESENCE_TTL_SECS", "0");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.lock_ttl, Duration::from_secs(30));
        assert_eq!(cfg.presence_ttl, Duration::from_secs(1));
    }

    #[test]
    fn zero_sweep_interval_disables_sweeping() {
        let mut m = HashMap::new();
        m.insert("TANDEM_SWEEP_INTERVAL_SECS", "0");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert!(cfg.sweep_interval.is_none());
    }

    #[test]
    fn memory_bus_and_json_logs_are_opt_in() {
        let mut m = HashMap::new();
        m.insert("TANDEM_BUS", "memory");
        m.insert("TANDEM_LOG_FORMAT", "json");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.bus, BusKind::Memory);
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn database_url_from_env() {
        let mut m = HashMap::new();
        m.insert("TANDEM_DATABASE_URL", "postgres://u:p@host/db");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://u:p@host/db"));
    }
}
