//! Token-bucket rate limiting for the HTTP surface, keyed by client IP.
//! Refill is a continuous approximation: tokens accrue proportionally to
//! elapsed time and cap at the burst size.

use http::HeaderMap;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Idle buckets are dropped after this long without a request.
const BUCKET_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn full(burst: u32, now: Instant) -> Self {
        TokenBucket {
            tokens: f64::from(burst),
            last_refill: now,
        }
    }

    /// Refill for the elapsed interval, then try to take one token.
    pub fn try_acquire(&mut self, rate_per_sec: f64, burst: u32, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate_per_sec).min(f64::from(burst));
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct IpBucket {
    bucket: TokenBucket,
    last_used: Instant,
}

pub struct RateLimiter {
    rate_per_sec: f64,
    burst: u32,
    buckets: Mutex<HashMap<IpAddr, IpBucket>>,
}

impl RateLimiter {
    pub fn new(rate_per_minute: u32, burst: u32) -> Self {
        RateLimiter {
            rate_per_sec: f64::from(rate_per_minute) / 60.0,
            burst,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter lock");
        let entry = buckets.entry(ip).or_insert_with(|| IpBucket {
            bucket: TokenBucket::full(self.burst, now),
            last_used: now,
        });
        entry.last_used = now;
        entry.bucket.try_acquire(self.rate_per_sec, self.burst, now)
    }

    /// Drop buckets idle past the TTL. Driven by the shared background
    /// cleanup task.
    pub fn evict_idle(&self) {
        self.evict_idle_at(Instant::now());
    }

    fn evict_idle_at(&self, now: Instant) {
        self.buckets
            .lock()
            .expect("rate limiter lock")
            .retain(|_, entry| now.duration_since(entry.last_used) <= BUCKET_TTL);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

/// Client identity for limiting: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(ip) = forwarded.split(',').find_map(|hop| parse_ip(hop.trim()))
    {
        return ip;
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok())
        && let Some(ip) = parse_ip(real.trim())
    {
        return ip;
    }
    peer.ip()
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    if value.is_empty() {
        return None;
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    value.parse::<SocketAddr>().ok().map(|addr| addr.ip())
}
