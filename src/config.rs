use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub jwt: JwtConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database = DatabaseConfig {
            url: database_url_from_env(),
            max_connections: env_parse("DB_MAX_CONNECTIONS", 25),
            acquire_timeout_secs: env_parse("DB_ACQUIRE_TIMEOUT_SECS", 5),
        };
        let server = ServerConfig {
            host: env_or("APP_HOST", "0.0.0.0"),
            port: env_parse("APP_PORT", 8000),
            shutdown_timeout_secs: env_parse("SERVER_SHUTDOWN_TIMEOUT_SECS", 5),
            request_timeout_secs: env_parse("SERVER_REQUEST_TIMEOUT_SECS", 10),
        };
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?,
            issuer: env_or("JWT_ISSUER", "user-service"),
            audience: env_or("JWT_AUDIENCE", "user-service-clients"),
            ttl_minutes: env_parse("JWT_TTL_MINUTES", 60),
            refresh_ttl_minutes: env_parse("JWT_REFRESH_TTL_MINUTES", 60 * 24 * 14),
        };
        Ok(Self {
            database,
            server,
            jwt,
        })
    }
}

/// `DATABASE_URL` wins; otherwise the URL is assembled from the `DB_*` parts.
fn database_url_from_env() -> String {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.is_empty() {
            return url;
        }
    }
    format!(
        "postgres://{}:{}@{}:{}/{}?sslmode={}",
        env_or("DB_USER", "postgres"),
        env_or("DB_PASSWORD", "postgres"),
        env_or("DB_HOST", "localhost"),
        env_or("DB_PORT", "5432"),
        env_or("DB_NAME", "app_db"),
        env_or("DB_SSL_MODE", "disable"),
    )
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.into())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
