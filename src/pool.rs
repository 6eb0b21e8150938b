//! Shared backend connection pool.
//!
//! One slot per configured backend (slot 0 is the master, the rest are
//! replicas). Each slot keeps a small stack of idle authenticated
//! connections plus a health record. Leased connections are owned by
//! exactly one session until released; pool locks guard bookkeeping only
//! and are never held across the forwarding path.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{PoolOptions, RedisEndpoint};
use crate::error::{ProxyError, Result};
use crate::resp::{RespConn, encode_command, encode_command_str, is_error_frame};
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    Replica,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Replica => f.write_str("replica"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Suspect,
    Down,
}

/// Per-slot liveness bookkeeping. One failure demotes Healthy to Suspect;
/// `suspect_threshold` consecutive failures demote to Down; any successful
/// connect + PING restores Healthy.
#[derive(Debug)]
pub(crate) struct HealthRecord {
    state: Health,
    consecutive_failures: u32,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            state: Health::Healthy,
            consecutive_failures: 0,
        }
    }

    /// Returns true when this failure newly transitioned the slot to Down.
    fn record_failure(&mut self, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let next = if self.consecutive_failures >= threshold {
            Health::Down
        } else {
            Health::Suspect
        };
        let newly_down = next == Health::Down && self.state != Health::Down;
        self.state = next;
        newly_down
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = Health::Healthy;
    }

    pub(crate) fn state(&self) -> Health {
        self.state
    }
}

/// One authenticated link to a specific backend, leased out of the pool.
/// Dropping it closes the physical connection.
#[derive(Debug)]
pub struct BackendConn {
    role: Role,
    slot: usize,
    io: RespConn<TcpStream>,
}

impl BackendConn {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn io(&mut self) -> &mut RespConn<TcpStream> {
        &mut self.io
    }
}

struct Slot {
    endpoint: RedisEndpoint,
    role: Role,
    idle: Mutex<Vec<RespConn<TcpStream>>>,
    health: Mutex<HealthRecord>,
    reconnecting: AtomicBool,
}

impl Slot {
    fn new(endpoint: RedisEndpoint, role: Role) -> Self {
        Self {
            endpoint,
            role,
            idle: Mutex::new(Vec::new()),
            health: Mutex::new(HealthRecord::new()),
            reconnecting: AtomicBool::new(false),
        }
    }

    fn health_state(&self) -> Health {
        self.health.lock().unwrap().state()
    }
}

struct PoolInner {
    slots: Vec<Slot>,
    replica_cursor: AtomicUsize,
    opts: PoolOptions,
    stats: Arc<Stats>,
}

#[derive(Clone)]
pub struct BackendPool {
    inner: Arc<PoolInner>,
}

impl BackendPool {
    pub fn new(
        master: RedisEndpoint,
        replicas: Vec<RedisEndpoint>,
        opts: PoolOptions,
        stats: Arc<Stats>,
    ) -> Self {
        let mut slots = Vec::with_capacity(1 + replicas.len());
        slots.push(Slot::new(master, Role::Master));
        for ep in replicas {
            slots.push(Slot::new(ep, Role::Replica));
        }
        Self {
            inner: Arc::new(PoolInner {
                slots,
                replica_cursor: AtomicUsize::new(0),
                opts,
                stats,
            }),
        }
    }

    pub fn replica_count(&self) -> usize {
        self.inner.slots.len() - 1
    }

    /// Lease a healthy connection for `role`. Bounded: fails with
    /// `BackendUnavailable` after the configured acquire timeout instead of
    /// blocking forever.
    pub async fn acquire(&self, role: Role) -> Result<BackendConn> {
        match timeout(self.inner.opts.acquire_timeout, self.acquire_inner(role)).await {
            Ok(res) => res,
            Err(_) => Err(ProxyError::BackendUnavailable(role)),
        }
    }

    async fn acquire_inner(&self, role: Role) -> Result<BackendConn> {
        match role {
            Role::Master => self.lease(0).await,
            Role::Replica => {
                let n = self.replica_count();
                if n == 0 {
                    return Err(ProxyError::BackendUnavailable(Role::Replica));
                }
                // Round-robin over replicas, skipping Down slots.
                let start = self.inner.replica_cursor.fetch_add(1, Ordering::Relaxed);
                for i in 0..n {
                    let idx = 1 + (start + i) % n;
                    if self.inner.slots[idx].health_state() == Health::Down {
                        continue;
                    }
                    if let Ok(conn) = self.lease(idx).await {
                        return Ok(conn);
                    }
                }
                Err(ProxyError::BackendUnavailable(Role::Replica))
            }
        }
    }

    async fn lease(&self, idx: usize) -> Result<BackendConn> {
        let slot = &self.inner.slots[idx];

        let reused = slot.idle.lock().unwrap().pop();
        if let Some(io) = reused {
            return Ok(BackendConn {
                role: slot.role,
                slot: idx,
                io,
            });
        }

        if slot.health_state() == Health::Down {
            return Err(ProxyError::BackendUnavailable(slot.role));
        }

        match connect_and_handshake(&slot.endpoint, self.inner.opts.connect_timeout).await {
            Ok(io) => {
                slot.health.lock().unwrap().record_success();
                Ok(BackendConn {
                    role: slot.role,
                    slot: idx,
                    io,
                })
            }
            Err(e) => {
                tracing::warn!(
                    backend = %slot.endpoint.host, port = slot.endpoint.port, error = %e,
                    "backend dial failed"
                );
                self.mark_failure(idx);
                Err(ProxyError::BackendUnavailable(slot.role))
            }
        }
    }

    /// Return a connection in a clean protocol state to its slot.
    pub fn release(&self, conn: BackendConn) {
        let slot = &self.inner.slots[conn.slot];
        let mut idle = slot.idle.lock().unwrap();
        if idle.len() < self.inner.opts.size {
            idle.push(conn.io);
        }
        // Over the idle cap the connection just drops closed.
    }

    /// Drop a connection that failed (or whose protocol state cannot be
    /// trusted) and kick off recovery for its slot.
    pub fn invalidate(&self, conn: BackendConn) {
        let idx = conn.slot;
        drop(conn);
        self.mark_failure(idx);
    }

    fn mark_failure(&self, idx: usize) {
        let slot = &self.inner.slots[idx];
        let newly_down = slot
            .health
            .lock()
            .unwrap()
            .record_failure(self.inner.opts.suspect_threshold);
        if newly_down {
            self.inner.stats.record_failover();
            tracing::warn!(
                backend = %slot.endpoint.host, port = slot.endpoint.port, role = %slot.role,
                "backend marked down"
            );
        }
        self.spawn_reconnect(idx);
    }

    /// Asynchronous reconnect with capped exponential backoff, so one slow
    /// backend never stalls acquisition for other roles. At most one
    /// reconnect task per slot.
    fn spawn_reconnect(&self, idx: usize) {
        let slot = &self.inner.slots[idx];
        if slot.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool = self.clone();
        tokio::spawn(async move {
            let opts = pool.inner.opts.clone();
            let slot = &pool.inner.slots[idx];
            let mut attempt: u32 = 0;

            loop {
                tokio::time::sleep(backoff_delay(opts.backoff_base, opts.backoff_cap, attempt))
                    .await;
                attempt = attempt.saturating_add(1);

                match connect_and_handshake(&slot.endpoint, opts.connect_timeout).await {
                    Ok(io) => {
                        slot.health.lock().unwrap().record_success();
                        slot.idle.lock().unwrap().push(io);
                        slot.reconnecting.store(false, Ordering::SeqCst);
                        tracing::info!(
                            backend = %slot.endpoint.host, port = slot.endpoint.port,
                            role = %slot.role, attempts = attempt,
                            "backend recovered"
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(
                            backend = %slot.endpoint.host, port = slot.endpoint.port,
                            attempt, error = %e,
                            "reconnect attempt failed"
                        );
                    }
                }
            }
        });
    }

    /// Periodically ping one idle connection per slot.
    pub fn spawn_health_checks(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(pool.inner.opts.health_check_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                for idx in 0..pool.inner.slots.len() {
                    pool.check_slot(idx).await;
                }
            }
        });
    }

    async fn check_slot(&self, idx: usize) {
        let slot = &self.inner.slots[idx];

        if slot.health_state() == Health::Down {
            // Recovery belongs to the reconnect task; make sure one runs.
            self.spawn_reconnect(idx);
            return;
        }

        let Some(mut io) = slot.idle.lock().unwrap().pop() else {
            // Nothing idle to probe; leased connections prove themselves.
            return;
        };

        if ping(&mut io, self.inner.opts.connect_timeout).await {
            slot.health.lock().unwrap().record_success();
            slot.idle.lock().unwrap().push(io);
        } else {
            tracing::warn!(
                backend = %slot.endpoint.host, port = slot.endpoint.port, role = %slot.role,
                "health-check ping failed"
            );
            drop(io);
            self.mark_failure(idx);
        }
    }
}

async fn ping(io: &mut RespConn<TcpStream>, reply_timeout: Duration) -> bool {
    if io.write_all(&encode_command_str(&["PING"])).await.is_err() {
        return false;
    }
    match timeout(reply_timeout, io.read_frame()).await {
        Ok(Ok(Some((frame, _)))) => !is_error_frame(&frame),
        _ => false,
    }
}

fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Dial a backend and bring the connection into service: AUTH with the
/// endpoint's own credentials (never client credentials), SELECT the
/// configured db, then verify liveness with PING.
pub(crate) async fn connect_and_handshake(
    endpoint: &RedisEndpoint,
    connect_timeout: Duration,
) -> Result<RespConn<TcpStream>> {
    let addr = (endpoint.host.as_str(), endpoint.port);
    let sock = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "backend connect timeout",
            ))
        })??;
    sock.set_nodelay(true)?;

    let mut io = RespConn::new(sock);

    if let Some(pass) = &endpoint.password {
        let cmd = match &endpoint.username {
            Some(user) => encode_command(&[
                Bytes::from_static(b"AUTH"),
                Bytes::copy_from_slice(user.as_bytes()),
                Bytes::copy_from_slice(pass.as_bytes()),
            ]),
            // Password-only AUTH implies the default user.
            None => encode_command(&[
                Bytes::from_static(b"AUTH"),
                Bytes::copy_from_slice(pass.as_bytes()),
            ]),
        };
        io.write_all(&cmd).await?;
        expect_ok(&mut io, connect_timeout, "AUTH").await?;
    }

    if let Some(db) = endpoint.db {
        io.write_all(&encode_command_str(&["SELECT", &db.to_string()]))
            .await?;
        expect_ok(&mut io, connect_timeout, "SELECT").await?;
    }

    io.write_all(&encode_command_str(&["PING"])).await?;
    expect_ok(&mut io, connect_timeout, "PING").await?;

    Ok(io)
}

async fn expect_ok(
    io: &mut RespConn<TcpStream>,
    reply_timeout: Duration,
    what: &str,
) -> Result<()> {
    let reply = timeout(reply_timeout, io.read_frame()).await.map_err(|_| {
        ProxyError::BackendProtocol(format!("backend timed out replying to {what}"))
    })??;
    let Some((frame, raw)) = reply else {
        return Err(ProxyError::BackendProtocol(format!(
            "backend closed during {what}"
        )));
    };
    if is_error_frame(&frame) {
        let msg = String::from_utf8_lossy(&raw).trim_end().to_string();
        if what == "AUTH" {
            return Err(ProxyError::Auth(msg));
        }
        return Err(ProxyError::BackendProtocol(format!("{what} failed: {msg}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_demotion_and_recovery() {
        let mut rec = HealthRecord::new();
        assert_eq!(rec.state(), Health::Healthy);

        assert!(!rec.record_failure(3));
        assert_eq!(rec.state(), Health::Suspect);
        assert!(!rec.record_failure(3));
        assert_eq!(rec.state(), Health::Suspect);

        // Third consecutive failure crosses the threshold exactly once.
        assert!(rec.record_failure(3));
        assert_eq!(rec.state(), Health::Down);
        assert!(!rec.record_failure(3));

        rec.record_success();
        assert_eq!(rec.state(), Health::Healthy);
        assert!(!rec.record_failure(3));
        assert_eq!(rec.state(), Health::Suspect);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(1500);
        assert_eq!(backoff_delay(base, cap, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, cap, 4), cap);
        assert_eq!(backoff_delay(base, cap, 40), cap);
    }

    #[tokio::test]
    async fn acquire_replica_fails_fast_with_no_replicas() {
        let master = RedisEndpoint::from_redis_url("redis://127.0.0.1:1").unwrap();
        let pool = BackendPool::new(
            master,
            Vec::new(),
            PoolOptions::default(),
            Arc::new(Stats::new()),
        );
        let err = pool.acquire(Role::Replica).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::BackendUnavailable(Role::Replica)
        ));
    }
}
