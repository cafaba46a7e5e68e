//! `health_check` - wait for a TCP endpoint to accept connections
//!
//! Nothing is created; the resource exists to hold its dependents back until
//! a service started upstream is reachable.

use converge::{Provider, ProviderContext, ProviderError, ProviderLogger, Resource};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_INTERVAL_MS: u64 = 500;

/// Longest accepted `timeout_secs` (one day)
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Upper bound on a single connection attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HealthCheckConfig {
    /// `host:port`
    address: String,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
    #[serde(default = "default_interval")]
    interval_ms: u64,
}

const fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

const fn default_interval() -> u64 {
    DEFAULT_INTERVAL_MS
}

#[derive(Default)]
pub struct HealthCheckProvider {
    address: String,
    timeout: Duration,
    interval: Duration,
    log: Option<ProviderLogger>,
}

impl HealthCheckProvider {
    pub fn boxed() -> Box<dyn Provider> {
        Box::new(Self::default())
    }

    fn try_connect(&self, remaining: Duration) -> bool {
        let addrs: Vec<SocketAddr> = match self.address.to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                log::trace!("Could not resolve {}: {e}", self.address);
                return false;
            }
        };
        let timeout = remaining.min(CONNECT_TIMEOUT).max(Duration::from_millis(1));
        addrs
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, timeout).is_ok())
    }
}

impl Provider for HealthCheckProvider {
    fn init(&mut self, resource: &Resource, log: ProviderLogger) -> Result<(), ProviderError> {
        let config: HealthCheckConfig = serde_json::from_value(resource.config.clone())?;
        if config.address.is_empty() {
            return Err(ProviderError::Config("address must not be empty".into()));
        }
        if config.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ProviderError::Config(format!(
                "timeout_secs must be at most {MAX_TIMEOUT_SECS}"
            )));
        }
        if config.interval_ms == 0 {
            return Err(ProviderError::Config("interval_ms must be positive".into()));
        }
        self.address = config.address;
        self.timeout = Duration::from_secs(config.timeout_secs);
        self.interval = Duration::from_millis(config.interval_ms);
        self.log = Some(log);
        Ok(())
    }

    fn create(&mut self, ctx: &ProviderContext) -> Result<(), ProviderError> {
        let now = Instant::now();
        let deadline = now
            .checked_add(self.timeout)
            .or_else(|| now.checked_add(Duration::from_secs(MAX_TIMEOUT_SECS)))
            .unwrap_or(now);
        let mut attempts = 0u32;

        loop {
            ctx.check_cancelled()?;
            attempts += 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.try_connect(remaining) {
                if let Some(log) = &self.log {
                    log.info(format_args!("{} is up after {attempts} attempt(s)", self.address));
                }
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(ProviderError::HealthCheckTimeout {
                    target: self.address.clone(),
                    timeout: self.timeout,
                });
            }
            if let Some(log) = &self.log {
                log.debug(format_args!("{} not reachable yet", self.address));
            }
            ctx.sleep(self.interval.min(deadline.saturating_duration_since(Instant::now())))?;
        }
    }

    fn destroy(&mut self, _ctx: &ProviderContext) -> Result<(), ProviderError> {
        Ok(())
    }

    fn refresh(&mut self, _ctx: &ProviderContext) -> Result<(), ProviderError> {
        Ok(())
    }

    fn changed(&self, _ctx: &ProviderContext) -> Result<bool, ProviderError> {
        Ok(false)
    }

    fn lookup(&self, _ctx: &ProviderContext) -> Result<Vec<String>, ProviderError> {
        Ok(vec![self.address.clone()])
    }

    fn outputs(&self) -> Value {
        json!({ "address": self.address })
    }
}
