//! Sliding-window limiter for login attempts, keyed by client IP.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct LoginThrottle {
    /// Attempts allowed within the window; 0 disables the limit.
    max_attempts: u32,
    window: Duration,
    attempts: HashMap<IpAddr, Vec<Instant>>,
}

impl LoginThrottle {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: HashMap::new(),
        }
    }

    /// Record an attempt from `ip` if it is allowed.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&mut self, ip: IpAddr) -> bool {
        self.check_and_record_at(ip, Instant::now())
    }

    fn check_and_record_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        if self.max_attempts == 0 {
            return true;
        }
        let window = self.window;
        let attempts = self.attempts.entry(ip).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Drop entries whose attempts have all aged out.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.attempts.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    /// Number of IPs currently tracked.
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }
}
