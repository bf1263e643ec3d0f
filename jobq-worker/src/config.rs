use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "WORKER_ID")]
    pub worker_id: Option<String>,

    #[envconfig(from = "WORKER_CONCURRENCY", default = "2")]
    pub concurrency: Concurrency,

    #[envconfig(from = "POLL_MS", default = "1000")]
    pub poll_interval: PollInterval,

    #[envconfig(from = "LEASE_SECONDS", default = "120")]
    pub lease_seconds: LeaseSeconds,

    #[envconfig(from = "MAX_PG_CONNECTIONS", default = "10")]
    pub max_pg_connections: u32,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The identifier this worker writes into `locked_by`, defaulting to
    /// `<hostname>-<pid>` so parallel workers on one host stay apart.
    pub fn worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(default_worker_id)
    }
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned());

    format!("{}-{}", host, std::process::id())
}

/// Number of parallel claim tasks per batch, bounded to [1, 32].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concurrency(pub usize);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseConcurrencyError;

impl FromStr for Concurrency {
    type Err = ParseConcurrencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let concurrency = s.parse::<usize>().map_err(|_| ParseConcurrencyError)?;

        if (1..=32).contains(&concurrency) {
            Ok(Concurrency(concurrency))
        } else {
            Err(ParseConcurrencyError)
        }
    }
}

/// Idle sleep between empty poll batches, in milliseconds, bounded to
/// [100, 60000].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterval(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePollIntervalError;

impl FromStr for PollInterval {
    type Err = ParsePollIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParsePollIntervalError)?;

        if (100..=60_000).contains(&ms) {
            Ok(PollInterval(time::Duration::from_millis(ms)))
        } else {
            Err(ParsePollIntervalError)
        }
    }
}

/// Seconds a claim may go unreported before it is eligible for reclaim,
/// bounded to [10, 3600].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSeconds(pub u32);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLeaseSecondsError;

impl FromStr for LeaseSeconds {
    type Err = ParseLeaseSecondsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let seconds = s.parse::<u32>().map_err(|_| ParseLeaseSecondsError)?;

        if (10..=3600).contains(&seconds) {
            Ok(LeaseSeconds(seconds))
        } else {
            Err(ParseLeaseSecondsError)
        }
    }
}
