//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use callback::RetryPolicy;
use cluster::ElectionConfig;
use saga::SagaConfig;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:8090`, port 0 is ephemeral)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `DATABASE_URL`: PostgreSQL connection; unset keeps everything in memory
/// - `ALPHA_SERVICE_NAME`, `ALPHA_INSTANCE_ID`: lease key and holder id
/// - `ALPHA_CLUSTER_ENABLED`: run leader election (default `false`)
/// - `ALPHA_LEASE_DURATION_MS`, `ALPHA_LEASE_RENEW_INTERVAL_MS`
/// - `ALPHA_DISPATCH_MAX_ATTEMPTS`, `ALPHA_DISPATCH_BACKOFF_MS`,
///   `ALPHA_DISPATCH_MAX_BACKOFF_MS`, `ALPHA_ACK_TIMEOUT_MS`
/// - `ALPHA_COMPENSATION_TIMEOUT_MS`
/// - `ALPHA_DISCOVERY_ADDRESS`: address published on listener start
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub service_name: String,
    pub instance_id: String,
    pub cluster_enabled: bool,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub dispatch_max_attempts: u32,
    pub dispatch_backoff: Duration,
    pub dispatch_max_backoff: Duration,
    pub ack_timeout: Duration,
    pub compensation_timeout: Duration,
    pub discovery_address: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key/value source.
    ///
    /// Unparseable values fall back to the default for that key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let vars = Vars(lookup);

        Self {
            host: vars.get("HOST").unwrap_or(defaults.host),
            port: vars.parse("PORT").unwrap_or(defaults.port),
            log_level: vars.get("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: vars.get("DATABASE_URL"),
            service_name: vars.get("ALPHA_SERVICE_NAME").unwrap_or(defaults.service_name),
            instance_id: vars
                .get("ALPHA_INSTANCE_ID")
                .unwrap_or_else(|| generated_instance_id(vars.get("HOSTNAME"))),
            cluster_enabled: parse_flag(vars.get("ALPHA_CLUSTER_ENABLED"), defaults.cluster_enabled),
            lease_duration: vars.millis("ALPHA_LEASE_DURATION_MS", defaults.lease_duration),
            renew_interval: vars.millis("ALPHA_LEASE_RENEW_INTERVAL_MS", defaults.renew_interval),
            dispatch_max_attempts: vars
                .parse("ALPHA_DISPATCH_MAX_ATTEMPTS")
                .unwrap_or(defaults.dispatch_max_attempts),
            dispatch_backoff: vars.millis("ALPHA_DISPATCH_BACKOFF_MS", defaults.dispatch_backoff),
            dispatch_max_backoff: vars
                .millis("ALPHA_DISPATCH_MAX_BACKOFF_MS", defaults.dispatch_max_backoff),
            ack_timeout: vars.millis("ALPHA_ACK_TIMEOUT_MS", defaults.ack_timeout),
            compensation_timeout: vars
                .millis("ALPHA_COMPENSATION_TIMEOUT_MS", defaults.compensation_timeout),
            discovery_address: vars.get("ALPHA_DISCOVERY_ADDRESS"),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig::new(&self.service_name, &self.instance_id)
            .with_lease(self.lease_duration, self.renew_interval)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.dispatch_max_attempts,
            initial_backoff: self.dispatch_backoff,
            max_backoff: self.dispatch_max_backoff,
        }
    }

    pub fn saga_config(&self) -> SagaConfig {
        SagaConfig {
            compensation_timeout: self.compensation_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let election = ElectionConfig::default();
        let retry = RetryPolicy::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            log_level: "info".to_string(),
            database_url: None,
            service_name: election.service_name,
            instance_id: generated_instance_id(None),
            cluster_enabled: false,
            lease_duration: election.lease_duration,
            renew_interval: election.renew_interval,
            dispatch_max_attempts: retry.max_attempts,
            dispatch_backoff: retry.initial_backoff,
            dispatch_max_backoff: retry.max_backoff,
            ack_timeout: Duration::from_secs(10),
            compensation_timeout: SagaConfig::default().compensation_timeout,
            discovery_address: None,
        }
    }
}

fn generated_instance_id(hostname: Option<String>) -> String {
    let host = hostname.unwrap_or_else(|| "alpha".to_string());
    format!("{host}-{}", uuid::Uuid::new_v4())
}

fn parse_flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("true" | "1" | "yes" | "on") => true,
        Some("false" | "0" | "no" | "off") => false,
        _ => default,
    }
}

/// Variable source; empty values count as unset.
struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }
}
