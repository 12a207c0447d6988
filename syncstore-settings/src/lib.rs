//! Application settings: the one knob-surface that isn't derivable from spec.md, loaded from an
//! optional config file then environment variables.

use std::env;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

static PREFIX: &str = "syncstore";

static KILOBYTE: u32 = 1024;
static MEGABYTE: u32 = KILOBYTE * KILOBYTE;
static GIGABYTE: u32 = MEGABYTE * 1_000;
static DEFAULT_MAX_POST_BYTES: u32 = 2 * MEGABYTE;
static DEFAULT_MAX_POST_RECORDS: u32 = 100;
static DEFAULT_MAX_RECORD_PAYLOAD_BYTES: u32 = 2 * MEGABYTE;
static DEFAULT_MAX_REQUEST_BYTES: u32 = DEFAULT_MAX_POST_BYTES + 4 * KILOBYTE;
static DEFAULT_MAX_TOTAL_BYTES: u32 = 100 * DEFAULT_MAX_POST_BYTES;
pub static DEFAULT_MAX_TOTAL_RECORDS: u32 = 100 * DEFAULT_MAX_POST_RECORDS;
static DEFAULT_MAX_QUOTA_LIMIT: u32 = 2 * GIGABYTE;

/// Per-user payload quota, as loaded from settings (§4.5).
#[derive(Clone, Debug, Default, Copy)]
pub struct Quota {
    pub size: usize,
    pub enabled: bool,
    pub enforced: bool,
}

/// Configures how the `/__lbheartbeat__` health check fails for special conditions: the db pool
/// maxing out connections, or (optionally) this instance having run past a jittered TTL, signaling
/// it should be evicted and replaced.
#[derive(Copy, Clone, Default, Debug)]
pub struct Deadman {
    pub max_size: u32,
    pub previous_count: usize,
    pub clock_start: Option<time::Instant>,
    pub expiry: Option<time::Instant>,
}

impl From<&Settings> for Deadman {
    fn from(settings: &Settings) -> Self {
        let expiry = settings.lbheartbeat_ttl.map(|lbheartbeat_ttl| {
            // jitter's a range of percentage of ttl added to ttl. E.g. a 60s ttl w/ a 10% jitter
            // results in a random final ttl between 60-66s
            let ttl = lbheartbeat_ttl as f32;
            let max_jitter = ttl * (settings.lbheartbeat_ttl_jitter as f32 * 0.01);
            let ttl = rand::Rng::gen_range(&mut rand::thread_rng(), ttl..ttl + max_jitter);
            time::Instant::now() + time::Duration::seconds(ttl as i64)
        });
        Deadman {
            max_size: settings.database_pool_max_size,
            expiry,
            ..Default::default()
        }
    }
}

/// Server-enforced limits for request payloads (§4.5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerLimits {
    /// Maximum combined size of BSO payloads for a single request, in bytes.
    pub max_post_bytes: u32,
    /// Maximum BSO count for a single request.
    pub max_post_records: u32,
    /// Maximum size of an individual BSO payload, in bytes.
    pub max_record_payload_bytes: u32,
    /// Maximum `Content-Length` for all incoming requests, in bytes. Enforced externally to this
    /// crate, at the reverse-proxy level; kept here so it can be reported via `info/configuration`.
    pub max_request_bytes: u32,
    /// Maximum combined size of BSO payloads across a batch upload, in bytes.
    pub max_total_bytes: u32,
    /// Maximum BSO count across a batch upload.
    pub max_total_records: u32,
    pub max_quota_limit: u32,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_post_bytes: DEFAULT_MAX_POST_BYTES,
            max_post_records: DEFAULT_MAX_POST_RECORDS,
            max_record_payload_bytes: DEFAULT_MAX_RECORD_PAYLOAD_BYTES,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            max_total_records: DEFAULT_MAX_TOTAL_RECORDS,
            max_quota_limit: DEFAULT_MAX_QUOTA_LIMIT,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: u16,
    pub host: String,
    pub actix_keep_alive: Option<u32>,

    pub human_logs: bool,

    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    pub statsd_label: String,

    /// Cors settings
    pub cors_allowed_origin: Option<String>,
    pub cors_max_age: Option<usize>,
    pub cors_allowed_methods: Option<Vec<String>>,
    pub cors_allowed_headers: Option<Vec<String>>,

    pub database_url: String,
    pub database_pool_max_size: u32,
    pub database_pool_min_idle: Option<u32>,
    /// Pool timeout when waiting for a slot to become available, in seconds.
    pub database_pool_connection_timeout: Option<u32>,
    /// Max age a given connection should live, in seconds.
    pub database_pool_connection_lifespan: Option<u32>,
    /// Max time a connection should sit idle before being dropped, in seconds.
    pub database_pool_connection_max_idle: Option<u32>,
    #[cfg(debug_assertions)]
    pub database_use_test_transactions: bool,

    pub limits: ServerLimits,

    pub enable_quota: bool,
    pub enforce_quota: bool,

    /// Fail the `/__lbheartbeat__` healthcheck after running for this duration of time (in
    /// seconds) + jitter.
    pub lbheartbeat_ttl: Option<u32>,
    /// Percentage of `lbheartbeat_ttl` time to "jitter" (adds additional, randomized time).
    pub lbheartbeat_ttl_jitter: u32,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            port: 8000,
            host: "127.0.0.1".to_string(),
            actix_keep_alive: None,
            human_logs: false,
            statsd_host: Some("localhost".to_owned()),
            statsd_port: 8125,
            statsd_label: "syncstore".to_string(),
            cors_allowed_origin: None,
            cors_allowed_methods: Some(
                ["DELETE", "GET", "POST", "PUT"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            cors_allowed_headers: Some(
                [
                    "Content-Type",
                    "X-Sync-Userid",
                    syncstore_common::X_LAST_MODIFIED,
                    syncstore_common::X_WEAVE_TIMESTAMP,
                    syncstore_common::X_WEAVE_NEXT_OFFSET,
                    syncstore_common::X_WEAVE_RECORDS,
                    syncstore_common::X_WEAVE_BYTES,
                    syncstore_common::X_WEAVE_TOTAL_RECORDS,
                    syncstore_common::X_WEAVE_TOTAL_BYTES,
                ]
                .into_iter()
                .map(String::from)
                .collect(),
            ),
            cors_max_age: None,
            database_url: "mysql://root@127.0.0.1/syncstore".to_string(),
            database_pool_max_size: 10,
            database_pool_min_idle: None,
            database_pool_connection_lifespan: None,
            database_pool_connection_max_idle: None,
            database_pool_connection_timeout: Some(30),
            #[cfg(debug_assertions)]
            database_use_test_transactions: false,
            limits: ServerLimits::default(),
            enable_quota: false,
            enforce_quota: false,
            lbheartbeat_ttl: None,
            lbheartbeat_ttl_jitter: 25,
        }
    }
}

impl Settings {
    /// Load settings from the config file if supplied, then the environment.
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut s = Config::default();

        if let Some(config_filename) = filename {
            s.merge(File::with_name(config_filename))?;
        }

        // `SYNCSTORE_FOO__BAR_VALUE="gorp"` maps to `foo.bar_value = "gorp"`.
        s.merge(Environment::with_prefix(&PREFIX.to_uppercase()).separator("__"))?;

        match s.try_into::<Self>() {
            Ok(s) => Ok(s),
            Err(ConfigError::Message(v)) => {
                println!("Bad configuration: {:?}", &v);
                println!("Please set in config file or use environment variable.");
                println!(
                    "For example to set `database_url` use env var `{}_DATABASE_URL`\n",
                    PREFIX.to_uppercase()
                );
                Err(ConfigError::NotFound(v))
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(debug_assertions)]
    pub fn test_settings() -> Self {
        Self::with_env_and_config_file(None).expect("Could not get Settings in debug mode")
    }

    /// Zero out quota enforcement when the enabled limits couldn't possibly apply (no storage
    /// configured at all).
    pub fn normalize(&mut self) {
        if self.limits.max_quota_limit == 0 {
            self.enable_quota = false;
            self.enforce_quota = false;
        }
    }

    pub fn banner(&self) -> String {
        let quota = if self.enable_quota {
            format!("quota: {}kB", self.limits.max_quota_limit / 1024)
        } else {
            "quota: disabled".to_owned()
        };
        format!("http://{}:{} {}", self.host, self.port, quota)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_environment_variable_prefix() {
        env::set_var("SYNCSTORE_PORT", "9999");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert_eq!(settings.port, 9999);
        env::remove_var("SYNCSTORE_PORT");

        // Double-underscore leading prefix does not match.
        env::set_var("SYNCSTORE__PORT", "9999");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert_eq!(settings.port, 8000);
        env::remove_var("SYNCSTORE__PORT");
    }

    #[test]
    #[serial]
    fn test_nested_environment_variable() {
        env::set_var("SYNCSTORE_LIMITS__MAX_POST_RECORDS", "10");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert_eq!(settings.limits.max_post_records, 10);
        env::remove_var("SYNCSTORE_LIMITS__MAX_POST_RECORDS");
    }
}
