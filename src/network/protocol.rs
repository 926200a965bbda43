//! Service names and the admission rate limiter

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Common TCP service names by port
pub struct ServiceDatabase {
    tcp_services: HashMap<u16, &'static str>,
}

static SERVICES: Lazy<ServiceDatabase> = Lazy::new(ServiceDatabase::new);

impl ServiceDatabase {
    pub fn new() -> Self {
        let tcp_services = [
            (21, "ftp"),
            (22, "ssh"),
            (23, "telnet"),
            (25, "smtp"),
            (53, "domain"),
            (80, "http"),
            (110, "pop3"),
            (111, "rpcbind"),
            (135, "msrpc"),
            (139, "netbios-ssn"),
            (143, "imap"),
            (389, "ldap"),
            (443, "https"),
            (445, "microsoft-ds"),
            (993, "imaps"),
            (995, "pop3s"),
            (1433, "mssql"),
            (1521, "oracle"),
            (2049, "nfs"),
            (3306, "mysql"),
            (3389, "rdp"),
            (5432, "postgresql"),
            (5900, "vnc"),
            (5984, "couchdb"),
            (6379, "redis"),
            (8080, "http-proxy"),
            (8443, "https-alt"),
            (9200, "elasticsearch"),
            (11211, "memcached"),
            (27017, "mongodb"),
        ]
        .into_iter()
        .collect();

        Self { tcp_services }
    }

    /// Shared instance
    pub fn global() -> &'static ServiceDatabase {
        &SERVICES
    }

    pub fn get_tcp_service(&self, port: u16) -> Option<&'static str> {
        self.tcp_services.get(&port).copied()
    }
}

impl Default for ServiceDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Token bucket limiting how many operations are admitted per second.
///
/// A rate of zero disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u64,
    last_refill: Instant,
    tokens: f64,
    max_tokens: f64,
}

impl RateLimiter {
    pub fn new(per_second: u64) -> Self {
        // The bucket starts with one token so the first admission is immediate
        // and a burst never exceeds one second's worth.
        Self {
            rate: per_second,
            last_refill: Instant::now(),
            tokens: 1.0,
            max_tokens: (per_second as f64).max(1.0),
        }
    }

    /// Take a token if one is available
    pub fn can_send(&mut self) -> bool {
        if self.rate == 0 {
            return true;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let tokens_to_add = elapsed * self.rate as f64;
        if tokens_to_add.is_finite() && tokens_to_add >= 0.0 {
            self.tokens = (self.tokens + tokens_to_add).min(self.max_tokens);
        }
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until the next token is available
    pub fn delay_until_next(&self) -> Duration {
        if self.rate == 0 || self.tokens >= 1.0 {
            return Duration::ZERO;
        }

        let delay_secs = (1.0 - self.tokens) / self.rate as f64;
        if delay_secs.is_finite() && (0.0..=60.0).contains(&delay_secs) {
            Duration::from_secs_f64(delay_secs)
        } else {
            Duration::from_secs(1)
        }
    }
}
