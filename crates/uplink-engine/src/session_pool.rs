//! Idle-session pool
//!
//! Keeps authenticated sessions between jobs so that consecutive uploads to
//! the same destination skip the handshake.
//!
//! # Design
//! - Keyed by (protocol, endpoint, account, login settings) so a session is
//!   never handed to a job with different credentials or a different login
//! - Only idle sessions live here; a checked-out session belongs to exactly
//!   one worker until it is checked back in
//! - Most recently used session is handed out first, the oldest one is
//!   evicted when a key exceeds its idle cap
//! - Closing needs the transport, so the pool never closes anything itself:
//!   stale and evicted sessions are returned to the caller
//!
//! The lock is only held for queue manipulation, never across network I/O.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use uplink_core::{Protocol, SchedulerConfig, TransferJob};

use crate::protocol::Session;

/// Identity of a reusable session
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SessionKey {
    pub protocol: Protocol,
    /// Normalized endpoint from [`uplink_core::ConnectionParams::endpoint_key`]
    pub endpoint: String,
    pub account_id: String,
    /// From [`uplink_core::ConnectionParams::session_fingerprint`]
    pub settings: String,
}

impl SessionKey {
    pub fn new(protocol: Protocol, endpoint: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            protocol,
            endpoint: endpoint.into(),
            account_id: account_id.into(),
            settings: String::new(),
        }
    }

    pub fn with_settings(mut self, settings: impl Into<String>) -> Self {
        self.settings = settings.into();
        self
    }

    /// Key for the destination a job uploads to
    pub fn for_job(job: &TransferJob) -> Self {
        Self::new(
            job.protocol,
            job.connection_params.endpoint_key(job.protocol),
            job.account_id.clone(),
        )
        .with_settings(job.connection_params.session_fingerprint())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}@{}", self.protocol, self.account_id, self.endpoint)
    }
}

/// Session pool configuration
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    /// Idle sessions unused for longer than this are closed
    pub idle_ttl: Duration,
    /// Idle sessions kept per key
    pub max_idle_per_key: usize,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SessionPoolConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            idle_ttl: config.idle_session_ttl(),
            max_idle_per_key: config.max_idle_sessions_per_endpoint,
        }
    }
}

/// Statistics for session pool monitoring
#[derive(Debug, Default)]
struct SessionPoolStats {
    /// Checkouts answered with an idle session
    hits: AtomicU64,
    /// Checkouts with nothing reusable
    misses: AtomicU64,
    /// Sessions returned to the pool
    checkins: AtomicU64,
    /// Sessions dropped because a key was over its idle cap
    evictions: AtomicU64,
    /// Sessions dropped for exceeding the TTL, token expiry, or being closed
    expired: AtomicU64,
}

/// Result of a checkout
pub struct Checkout<H> {
    /// A reusable idle session, if one was available
    pub session: Option<Session<H>>,
    /// Stale sessions found along the way; the caller must close them
    pub stale: Vec<Session<H>>,
}

/// Pool of idle, authenticated sessions
pub struct SessionPool<H> {
    idle: Mutex<HashMap<SessionKey, VecDeque<Session<H>>>>,
    config: SessionPoolConfig,
    stats: SessionPoolStats,
}

impl<H> SessionPool<H> {
    pub fn new() -> Self {
        Self::with_config(SessionPoolConfig::default())
    }

    pub fn with_config(config: SessionPoolConfig) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            config,
            stats: SessionPoolStats::default(),
        }
    }

    fn is_stale(&self, session: &Session<H>, now: Instant) -> bool {
        !session.is_open()
            || session.is_expired()
            || now.saturating_duration_since(session.last_used) >= self.config.idle_ttl
    }

    /// Take the most recently used idle session for `key`
    pub fn checkout(&self, key: &SessionKey) -> Checkout<H> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let mut session = None;
        {
            let mut idle = self.idle.lock();
            if let Some(queue) = idle.get_mut(key) {
                while let Some(candidate) = queue.pop_back() {
                    if self.is_stale(&candidate, now) {
                        stale.push(candidate);
                    } else {
                        session = Some(candidate);
                        break;
                    }
                }
                if queue.is_empty() {
                    idle.remove(key);
                }
            }
        }

        self.stats
            .expired
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        if session.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Reusing idle session for {}", key);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        Checkout { session, stale }
    }

    /// Return a session after a successful upload.
    ///
    /// Returns the session that has to be closed instead of pooled: the
    /// session itself when it is no longer usable, or the oldest idle one
    /// when the key is over its cap.
    pub fn checkin(&self, key: SessionKey, mut session: Session<H>) -> Option<Session<H>> {
        let now = Instant::now();
        if !session.is_open() || session.is_expired() || self.config.max_idle_per_key == 0 {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            return Some(session);
        }
        session.touch();
        self.stats.checkins.fetch_add(1, Ordering::Relaxed);

        let mut idle = self.idle.lock();
        let queue = idle.entry(key).or_default();
        queue.push_back(session);
        if queue.len() > self.config.max_idle_per_key {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            return queue.pop_front();
        }
        // Opportunistic: drop anything at the front that went stale
        match queue.front() {
            Some(oldest) if self.is_stale(oldest, now) => {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                queue.pop_front()
            }
            _ => None,
        }
    }

    /// Remove every stale idle session
    pub fn reap_idle(&self) -> Vec<Session<H>> {
        let now = Instant::now();
        let mut reaped = Vec::new();
        {
            let mut idle = self.idle.lock();
            for queue in idle.values_mut() {
                let (keep, stale): (VecDeque<_>, VecDeque<_>) =
                    queue.drain(..).partition(|s| !self.is_stale(s, now));
                *queue = keep;
                reaped.extend(stale);
            }
            idle.retain(|_, queue| !queue.is_empty());
        }
        if !reaped.is_empty() {
            self.stats
                .expired
                .fetch_add(reaped.len() as u64, Ordering::Relaxed);
            debug!("Reaped {} idle session(s)", reaped.len());
        }
        reaped
    }

    /// Remove every idle session, e.g. at shutdown
    pub fn drain(&self) -> Vec<Session<H>> {
        let mut idle = self.idle.lock();
        idle.drain().flat_map(|(_, queue)| queue).collect()
    }

    /// Idle sessions across all keys
    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(VecDeque::len).sum()
    }

    /// Idle sessions for one key
    pub fn idle_count_for(&self, key: &SessionKey) -> usize {
        self.idle.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> SessionPoolStatsSnapshot {
        SessionPoolStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            checkins: self.stats.checkins.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            idle_sessions: self.idle_count(),
        }
    }
}

impl<H> Default for SessionPool<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of session pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPoolStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub checkins: u64,
    pub evictions: u64,
    pub expired: u64,
    pub idle_sessions: usize,
}

impl SessionPoolStatsSnapshot {
    /// Fraction of checkouts that skipped a handshake
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
