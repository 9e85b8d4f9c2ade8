use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::time::Duration;

#[derive(Deserialize, Clone)]
pub(crate) struct Args {
    pub(crate) database_host: String,
    pub(crate) database_port: u16,
    pub(crate) database_name: String,
    pub(crate) database_user: String,
    pub(crate) database_password: String,
    #[serde(default = "default_log_level")]
    pub(crate) log_level: String,
    #[serde(default = "default_port")]
    pub(crate) port: u16,
    pub(crate) secret: String,
    #[serde(default = "default_token_ttl_minutes")]
    pub(crate) token_ttl_minutes: i64,
    #[serde(default = "default_pool_max_connections")]
    pub(crate) pool_max_connections: u32,
    #[serde(default = "default_pool_acquire_timeout_secs")]
    pub(crate) pool_acquire_timeout_secs: u64,
    #[serde(default = "default_statement_timeout_secs")]
    pub(crate) statement_timeout_secs: u64,
    #[serde(default = "default_bcrypt_cost")]
    pub(crate) bcrypt_cost: u32,
    pub(crate) admin_username: Option<String>,
    pub(crate) admin_password: Option<String>,
    #[serde(default = "default_rate_limit_per_second")]
    pub(crate) rate_limit_per_second: u64,
}

impl std::fmt::Debug for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Args")
            .field("database_host", &self.database_host)
            .field("database_port", &self.database_port)
            .field("database_name", &self.database_name)
            .field("database_user", &self.database_user)
            .field("log_level", &self.log_level)
            .field("port", &self.port)
            .field("token_ttl_minutes", &self.token_ttl_minutes)
            .field("pool_max_connections", &self.pool_max_connections)
            .field("admin_username", &self.admin_username)
            .finish_non_exhaustive()
    }
}

impl Args {
    pub(crate) fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            options: PgConnectOptions::new()
                .host(&self.database_host)
                .port(self.database_port)
                .database(&self.database_name)
                .username(&self.database_user)
                .password(&self.database_password),
            max_connections: self.pool_max_connections,
            acquire_timeout: Duration::from_secs(self.pool_acquire_timeout_secs),
            statement_timeout: Duration::from_secs(self.statement_timeout_secs),
        }
    }

    /// Token lifetime. Must be positive and small enough that an expiry
    /// computed from the current time is representable.
    pub(crate) fn token_ttl(&self) -> Result<chrono::Duration, config::ConfigError> {
        chrono::Duration::try_minutes(self.token_ttl_minutes)
            .filter(|ttl| *ttl > chrono::Duration::zero())
            .filter(|ttl| chrono::Utc::now().checked_add_signed(*ttl).is_some())
            .ok_or_else(|| {
                config::ConfigError::Message(format!(
                    "token_ttl_minutes = {} is out of range",
                    self.token_ttl_minutes
                ))
            })
    }

    /// The bootstrap credential, present only when both halves are configured.
    pub(crate) fn initial_admin(&self) -> Option<(&str, &str)> {
        match (&self.admin_username, &self.admin_password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some((username, password))
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PoolSettings {
    pub(crate) options: PgConnectOptions,
    pub(crate) max_connections: u32,
    pub(crate) acquire_timeout: Duration,
    pub(crate) statement_timeout: Duration,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_port() -> u16 {
    8000
}

fn default_token_ttl_minutes() -> i64 {
    30
}

fn default_pool_max_connections() -> u32 {
    5
}

fn default_pool_acquire_timeout_secs() -> u64 {
    5
}

fn default_statement_timeout_secs() -> u64 {
    30
}

fn default_bcrypt_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

fn default_rate_limit_per_second() -> u64 {
    10
}
