//! New-connection rate limiting.
//!
//! Accepted connections draw one token from a bucket before the pipeline
//! starts. Sources inside an overridden subnet share that subnet's bucket;
//! everyone else shares the general bucket. Buckets refill continuously at
//! their configured rate and hold at most one second of tokens.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{AdmissionError, ConfigError, ConfigResult};

/// Rate override for every source inside a subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetOverride {
    network: IpAddr,
    prefix_len: u8,
    rate_per_sec: u64,
}

impl SubnetOverride {
    /// Parse `a.b.c.d/len` (or an IPv6 equivalent). A bare address is a
    /// single-host subnet.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSubnet`] if the address or prefix
    /// length is malformed.
    pub fn parse(subnet: &str, rate_per_sec: u64) -> ConfigResult<Self> {
        let invalid = || ConfigError::InvalidSubnet(subnet.to_string());

        let (addr, len) = match subnet.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (subnet, None),
        };
        let network: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let max_len = if network.is_ipv4() { 32 } else { 128 };
        let prefix_len = match len {
            Some(len) => len.trim().parse::<u8>().map_err(|_| invalid())?,
            None => max_len,
        };
        if prefix_len > max_len {
            return Err(invalid());
        }

        Ok(Self {
            network,
            prefix_len,
            rate_per_sec,
        })
    }

    #[must_use]
    pub fn rate_per_sec(&self) -> u64 {
        self.rate_per_sec
    }

    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether `ip` falls inside this subnet.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask(self.prefix_len, 32) as u32;
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask(self.prefix_len, 128);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask(prefix_len: u8, bits: u32) -> u128 {
    if prefix_len == 0 {
        return 0;
    }
    let all = if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 };
    all & !((1u128 << (bits - u32::from(prefix_len))) - 1)
}

#[derive(Debug)]
struct TokenBucket {
    rate_per_sec: u64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u64) -> Self {
        Self {
            rate_per_sec,
            tokens: rate_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = self.rate_per_sec as f64;
        self.tokens = (self.tokens + elapsed * capacity).min(capacity);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Option<Duration>> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if self.rate_per_sec == 0 {
            return Err(None);
        }
        let missing = 1.0 - self.tokens;
        Err(Some(Duration::from_secs_f64(missing / self.rate_per_sec as f64)))
    }

    fn set_rate(&mut self, rate_per_sec: u64) {
        self.refill(Instant::now());
        self.rate_per_sec = rate_per_sec;
        self.tokens = self.tokens.min(rate_per_sec as f64);
    }
}

type SharedBucket = Arc<Mutex<TokenBucket>>;

/// Connection acceptance rate limiter with per-subnet overrides.
pub struct ConnectionRateLimiter {
    general: SharedBucket,
    /// Sorted by descending prefix length so the first match is the longest.
    overrides: RwLock<Vec<(SubnetOverride, SharedBucket)>>,
    wait_timeout: Duration,
    stopped: CancellationToken,
}

impl ConnectionRateLimiter {
    #[must_use]
    pub fn new(rate_per_sec: u64, overrides: Vec<SubnetOverride>, wait_timeout: Duration) -> Self {
        Self {
            general: Arc::new(Mutex::new(TokenBucket::new(rate_per_sec))),
            overrides: RwLock::new(build_overrides(overrides)),
            wait_timeout,
            stopped: CancellationToken::new(),
        }
    }

    fn bucket_for(&self, ip: IpAddr) -> SharedBucket {
        let overrides = self.overrides.read().unwrap_or_else(|e| e.into_inner());
        overrides
            .iter()
            .find(|(subnet, _)| subnet.contains(ip))
            .map_or_else(|| Arc::clone(&self.general), |(_, b)| Arc::clone(b))
    }

    /// Rate that applies to `ip` after override resolution.
    #[must_use]
    pub fn rate_for(&self, ip: IpAddr) -> u64 {
        let bucket = self.bucket_for(ip);
        let rate = bucket.lock().unwrap_or_else(|e| e.into_inner()).rate_per_sec;
        rate
    }

    /// Wait for an acceptance token for `ip`.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::RateLimitTimeout`] if no token became
    /// available within the wait timeout, or the limiter was stopped.
    pub async fn maybe_wait(&self, ip: IpAddr) -> Result<(), AdmissionError> {
        let bucket = self.bucket_for(ip);
        let deadline = Instant::now() + self.wait_timeout;

        loop {
            let now = Instant::now();
            let wait = {
                let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
                match guard.try_take(now) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() || wait.is_some_and(|w| w > remaining) {
                trace!(%ip, "no connection token before timeout");
                return Err(AdmissionError::RateLimitTimeout);
            }
            let sleep_for = wait.unwrap_or(remaining);

            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                () = self.stopped.cancelled() => return Err(AdmissionError::RateLimitTimeout),
            }
        }
    }

    /// Change the general rate. Overridden subnets keep their own rate.
    pub fn update_general_rate(&self, rate_per_sec: u64) {
        debug!(rate_per_sec, "updating general connection rate");
        self.general
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_rate(rate_per_sec);
    }

    /// Replace the subnet overrides. Subnets present before and after keep
    /// their accumulated tokens.
    pub fn update_overrides(&self, overrides: Vec<SubnetOverride>) {
        debug!(count = overrides.len(), "updating connection rate overrides");
        let mut current = self.overrides.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Vec::with_capacity(overrides.len());
        for subnet in overrides {
            let existing = current.iter().find(|(s, _)| {
                s.network == subnet.network && s.prefix_len == subnet.prefix_len
            });
            let bucket = match existing {
                Some((_, bucket)) => {
                    bucket
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .set_rate(subnet.rate_per_sec);
                    Arc::clone(bucket)
                }
                None => Arc::new(Mutex::new(TokenBucket::new(subnet.rate_per_sec))),
            };
            next.push((subnet, bucket));
        }
        next.sort_by(|a, b| b.0.prefix_len.cmp(&a.0.prefix_len));
        *current = next;
    }

    /// Fail every pending and future wait.
    pub fn stop(&self) {
        self.stopped.cancel();
    }
}

fn build_overrides(overrides: Vec<SubnetOverride>) -> Vec<(SubnetOverride, SharedBucket)> {
    let mut built: Vec<_> = overrides
        .into_iter()
        .map(|s| {
            let bucket = Arc::new(Mutex::new(TokenBucket::new(s.rate_per_sec)));
            (s, bucket)
        })
        .collect();
    built.sort_by(|a, b| b.0.prefix_len.cmp(&a.0.prefix_len));
    built
}
