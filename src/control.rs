//! Connection control for the ingestion surface: per-IP and global
//! admission caps, token-bucket throttling, violation tracking and
//! temporary bans. Admission must check and mutate several maps together,
//! so the whole state sits behind one mutex.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControlConfig;
use crate::ratelimit::TokenBucket;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const VIOLATION_MAP_LIMIT: usize = 1000;
const THROTTLE_BUCKET_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Banned,
    MaxTotal,
    MaxPerIp,
    GlobalThrottle,
    PerIpThrottle,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Banned => "banned",
            RejectReason::MaxTotal => "max_total",
            RejectReason::MaxPerIp => "max_per_ip",
            RejectReason::GlobalThrottle => "global",
            RejectReason::PerIpThrottle => "per_ip",
        }
    }
}

#[derive(Debug)]
struct ThrottleBucket {
    bucket: TokenBucket,
    last_used: Instant,
}

#[derive(Debug)]
struct ControlState {
    per_ip: HashMap<IpAddr, usize>,
    total_active: usize,
    violations: HashMap<IpAddr, u32>,
    bans: HashMap<IpAddr, Instant>,
    global_bucket: TokenBucket,
    ip_buckets: HashMap<IpAddr, ThrottleBucket>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ControlStats {
    pub active_connections: usize,
    pub tracked_ips: usize,
    pub banned_ips: usize,
    pub pending_violations: usize,
}

#[derive(Debug)]
pub struct ConnectionControl {
    config: ControlConfig,
    state: Mutex<ControlState>,
}

/// RAII handle for an admitted request; dropping it releases the slot.
#[derive(Debug)]
pub struct ConnectionGuard {
    control: Arc<ConnectionControl>,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.control.release(self.ip);
    }
}

impl ConnectionControl {
    pub fn new(config: ControlConfig) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(ConnectionControl {
            state: Mutex::new(ControlState {
                per_ip: HashMap::new(),
                total_active: 0,
                violations: HashMap::new(),
                bans: HashMap::new(),
                global_bucket: TokenBucket::full(config.global_burst, now),
                ip_buckets: HashMap::new(),
            }),
            config,
        })
    }

    /// Admit one connection/request from `ip`. A ban is checked before any
    /// counter is touched; cap rejections record a violation and may
    /// promote the IP to a ban.
    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionGuard, RejectReason> {
        self.try_acquire_at(ip, Instant::now())
    }

    fn try_acquire_at(
        self: &Arc<Self>,
        ip: IpAddr,
        now: Instant,
    ) -> Result<ConnectionGuard, RejectReason> {
        let mut state = self.state.lock().expect("connection control lock");

        if let Some(expiry) = state.bans.get(&ip) {
            if *expiry > now {
                return Err(RejectReason::Banned);
            }
            state.bans.remove(&ip);
        }

        if state.total_active >= self.config.max_total {
            self.record_violation(&mut state, ip, now);
            return Err(RejectReason::MaxTotal);
        }
        if state.per_ip.get(&ip).copied().unwrap_or(0) >= self.config.max_per_ip {
            self.record_violation(&mut state, ip, now);
            return Err(RejectReason::MaxPerIp);
        }

        *state.per_ip.entry(ip).or_insert(0) += 1;
        state.total_active += 1;

        Ok(ConnectionGuard {
            control: Arc::clone(self),
            ip,
        })
    }

    fn release(&self, ip: IpAddr) {
        let mut state = self.state.lock().expect("connection control lock");
        if let Some(count) = state.per_ip.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                state.per_ip.remove(&ip);
            }
            state.total_active = state.total_active.saturating_sub(1);
        }
    }

    fn record_violation(&self, state: &mut ControlState, ip: IpAddr, now: Instant) {
        let violations = state.violations.entry(ip).or_insert(0);
        *violations += 1;
        debug!(ip = %ip, violations = *violations, "admission violation");

        if *violations >= self.config.ban_threshold {
            state.violations.remove(&ip);
            state
                .bans
                .insert(ip, now + Duration::from_secs(self.config.ban_duration_secs));
            warn!(
                ip = %ip,
                duration_secs = self.config.ban_duration_secs,
                "temporarily banned after repeated violations"
            );
        }
    }

    /// Throttle check: one token from the global bucket, then one from the
    /// per-IP bucket (created lazily).
    pub fn allow(&self, ip: IpAddr) -> Result<(), RejectReason> {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: IpAddr, now: Instant) -> Result<(), RejectReason> {
        let mut state = self.state.lock().expect("connection control lock");

        if !state
            .global_bucket
            .try_acquire(self.config.global_rate, self.config.global_burst, now)
        {
            return Err(RejectReason::GlobalThrottle);
        }

        let burst = self.config.per_ip_burst;
        let entry = state.ip_buckets.entry(ip).or_insert_with(|| ThrottleBucket {
            bucket: TokenBucket::full(burst, now),
            last_used: now,
        });
        entry.last_used = now;
        if !entry
            .bucket
            .try_acquire(self.config.per_ip_rate, burst, now)
        {
            return Err(RejectReason::PerIpThrottle);
        }
        Ok(())
    }

    pub fn stats(&self) -> ControlStats {
        let state = self.state.lock().expect("connection control lock");
        ControlStats {
            active_connections: state.total_active,
            tracked_ips: state.per_ip.len(),
            banned_ips: state.bans.len(),
            pending_violations: state.violations.len(),
        }
    }

    /// Periodic housekeeping: expired bans go away, an oversized violation
    /// map is reset wholesale, idle throttle buckets are evicted.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    fn cleanup_at(&self, now: Instant) {
        let mut state = self.state.lock().expect("connection control lock");
        state.bans.retain(|_, expiry| *expiry > now);
        if state.violations.len() > VIOLATION_MAP_LIMIT {
            state.violations.clear();
        }
        state
            .ip_buckets
            .retain(|_, bucket| now.duration_since(bucket.last_used) <= THROTTLE_BUCKET_TTL);
    }

    pub fn spawn_cleanup(self: Arc<Self>, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("stopping connection-control cleanup");
                        return;
                    }
                    _ = interval.tick() => self.cleanup(),
                }
            }
        });
    }
}
