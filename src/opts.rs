//! Connection and pool options.

use std::time::Duration;

use url::Url;

use crate::error::Error;

/// SSL connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Don't use SSL
    Disable,
    /// Try SSL, fall back to unencrypted if not supported
    #[default]
    Prefer,
    /// Require SSL connection
    Require,
}

/// SCRAM channel binding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelBinding {
    /// Never bind the SCRAM exchange to the TLS channel.
    Disable,
    /// Bind when both TLS and SCRAM-SHA-256-PLUS are available.
    #[default]
    Prefer,
    /// Fail authentication unless channel binding is used.
    Require,
}

/// Connection options for PostgreSQL.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Hostname or IP address.
    ///
    /// Default: `"localhost"`
    pub host: String,

    /// Port number for the PostgreSQL server.
    ///
    /// Default: `5432`
    pub port: u16,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Database name to use.
    ///
    /// Default: `None`
    pub database: Option<String>,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Application name to report to the server.
    ///
    /// Default: `None`
    pub application_name: Option<String>,

    /// SSL connection mode.
    ///
    /// Default: `SslMode::Prefer`
    pub ssl_mode: SslMode,

    /// SCRAM channel binding policy.
    ///
    /// Default: `ChannelBinding::Prefer`
    pub channel_binding: ChannelBinding,

    /// Additional startup parameters.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,

    /// Upper bound for the TCP connect, and separately for the startup
    /// handshake that follows it.
    ///
    /// Default: `Some(10s)`
    pub connect_timeout: Option<Duration>,

    /// Upper bound for a single operation on a connection. On expiry the
    /// connection is discarded.
    ///
    /// Default: `None`
    pub statement_timeout: Option<Duration>,

    /// How long an idle, listening connection waits on the socket before it
    /// checks its job queue again.
    ///
    /// Default: `25ms`
    pub notification_poll_interval: Duration,

    /// Number of connections a [`Pool`](crate::tokio::Pool) built from these
    /// options may open.
    ///
    /// Default: `10`
    pub pool_size: usize,

    /// Pool settings given in the connection string, applied on top of
    /// [`PoolConfig::default`].
    ///
    /// Default: `PoolConfig::default()`
    pub pool: PoolConfig,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: String::new(),
            database: None,
            password: None,
            application_name: None,
            ssl_mode: SslMode::Prefer,
            channel_binding: ChannelBinding::Prefer,
            params: Vec::new(),
            connect_timeout: Some(Duration::from_secs(10)),
            statement_timeout: None,
            notification_poll_interval: Duration::from_millis(25),
            pool_size: 10,
            pool: PoolConfig::default(),
        }
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, Error> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| Error::InvalidUsage(format!("Invalid {}: {}", key, value)))
}

fn parse_count(key: &str, value: &str) -> Result<usize, Error> {
    value
        .parse::<usize>()
        .map_err(|_| Error::InvalidUsage(format!("Invalid {}: {}", key, value)))
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse a PostgreSQL connection URL.
    ///
    /// Format: `postgres://[user[:password]@]host[:port][/database][?param1=value1&..]`
    ///
    /// Supported query parameters:
    /// - `sslmode`: disable, prefer, require (verify-ca/verify-full are treated as require)
    /// - `channel_binding`: disable, prefer, require
    /// - `application_name`: application name
    /// - `connect_timeout`: seconds
    /// - `connect_timeout_ms`, `statement_timeout_ms`: milliseconds
    /// - `pool_size`: maximum pooled connections
    /// - `pool_min`, `pool_max`, `idle_timeout_ms`, `connection_timeout_ms`: pool settings
    ///
    /// Anything else is sent to the server as a startup parameter.
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        if !["postgres", "postgresql", "pg"].contains(&url.scheme()) {
            return Err(Error::InvalidUsage(format!(
                "Invalid scheme: expected 'postgres://', 'postgresql://' or 'pg://', got '{}://'",
                url.scheme()
            )));
        }

        let decode = |s: &str| {
            url::form_urlencoded::parse(format!("v={}", s).as_bytes())
                .next()
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        };

        let mut opts = Opts {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(5432),
            user: decode(url.username()),
            password: url.password().map(decode),
            database: url.path().strip_prefix('/').and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(decode(s))
                }
            }),
            ..Opts::default()
        };
        let mut pool_max = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sslmode" => {
                    opts.ssl_mode = match value.as_ref() {
                        "disable" => SslMode::Disable,
                        "allow" | "prefer" => SslMode::Prefer,
                        "require" | "verify-ca" | "verify-full" => SslMode::Require,
                        _ => {
                            return Err(Error::InvalidUsage(format!(
                                "Invalid sslmode: expected one of ['disable', 'prefer', 'require'], got {}",
                                value
                            )));
                        }
                    };
                }
                "channel_binding" => {
                    opts.channel_binding = match value.as_ref() {
                        "disable" => ChannelBinding::Disable,
                        "prefer" => ChannelBinding::Prefer,
                        "require" => ChannelBinding::Require,
                        _ => {
                            return Err(Error::InvalidUsage(format!(
                                "Invalid channel_binding: {}",
                                value
                            )));
                        }
                    };
                }
                "application_name" => {
                    opts.application_name = Some(value.to_string());
                }
                "connect_timeout" => {
                    let secs = value.parse::<u64>().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid connect_timeout: {}", value))
                    })?;
                    opts.connect_timeout = (secs > 0).then(|| Duration::from_secs(secs));
                }
                "connect_timeout_ms" => {
                    opts.connect_timeout = Some(parse_millis(&key, &value)?);
                }
                "statement_timeout_ms" => {
                    opts.statement_timeout = Some(parse_millis(&key, &value)?);
                }
                "pool_size" => {
                    opts.pool_size = parse_count(&key, &value)?;
                }
                "pool_min" => {
                    opts.pool.min = parse_count(&key, &value)?;
                }
                "pool_max" => {
                    pool_max = Some(parse_count(&key, &value)?);
                }
                "idle_timeout_ms" => {
                    opts.pool.idle_timeout = parse_millis(&key, &value)?;
                }
                "connection_timeout_ms" => {
                    opts.pool.connection_timeout = parse_millis(&key, &value)?;
                }
                _ => {
                    opts.params.push((key.to_string(), value.to_string()));
                }
            }
        }

        opts.pool.max = pool_max.unwrap_or(opts.pool_size);
        opts.pool_size = opts.pool.max;

        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(s).map_err(|e| Error::InvalidUsage(format!("Invalid URL: {}", e)))?;
        Self::try_from(&url)
    }
}

impl TryFrom<String> for Opts {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::try_from(s.as_str())
    }
}

impl TryFrom<&Opts> for Opts {
    type Error = Error;

    fn try_from(opts: &Opts) -> Result<Self, Self::Error> {
        Ok(opts.clone())
    }
}

/// Pool sizing and timeout settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle connections kept open by the reaper.
    ///
    /// Default: `0`
    pub min: usize,

    /// Upper bound on live connections, idle and checked out together.
    ///
    /// Default: `10`
    pub max: usize,

    /// Idle connections older than this are closed while more than `min` remain.
    ///
    /// Default: `30s`
    pub idle_timeout: Duration,

    /// How long `acquire` may wait in the queue.
    ///
    /// Default: `30s`
    pub connection_timeout: Duration,

    /// How often the reaper sweeps idle connections.
    ///
    /// Default: `None` (half of `idle_timeout`, at least 1s)
    pub reap_interval: Option<Duration>,

    /// Run `SELECT 1` on an idle connection before handing it out.
    ///
    /// Default: `false`
    pub test_before_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 10,
            idle_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(30),
            reap_interval: None,
            test_before_acquire: false,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of idle connections.
    pub fn min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    /// Set the maximum number of live connections.
    pub fn max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set how long `acquire` may wait for a connection.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the reaper interval.
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = Some(interval);
        self
    }

    /// Enable or disable the health check on acquire.
    pub fn test_before_acquire(mut self, enabled: bool) -> Self {
        self.test_before_acquire = enabled;
        self
    }

    /// Reaper interval after defaults are applied.
    pub fn effective_reap_interval(&self) -> Duration {
        self.reap_interval
            .unwrap_or_else(|| (self.idle_timeout / 2).max(Duration::from_secs(1)))
    }

    /// Check the configuration for contradictions.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max == 0 {
            return Err(Error::InvalidUsage("pool max must be at least 1".into()));
        }
        if self.min > self.max {
            return Err(Error::InvalidUsage(format!(
                "pool min ({}) exceeds max ({})",
                self.min, self.max
            )));
        }
        if self.reap_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::InvalidUsage("pool reap_interval must be positive".into()));
        }
        Ok(())
    }
}
