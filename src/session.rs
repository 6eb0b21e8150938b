//! Per-connection session routing engine.
//!
//! One `Session` per accepted client, owned by its task and never shared.
//! Each command is parsed, classified, and forwarded to a pooled backend
//! connection; transactions, pub/sub, and blocking commands pin the session
//! to one physical connection for as long as the protocol feature requires.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::classify::{Category, classify};
use crate::command::{HelloRequest, ParsedCommand, Request, parse_request};
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::pool::{BackendConn, BackendPool, Role};
use crate::resp::{Frame, RespConn, encode_command_str};
use crate::stats::Stats;

/// Pipelined requests arriving while a blocking command is in flight are
/// stashed and served afterwards, up to this many before backpressure.
const MAX_PIPELINED_STASH: usize = 64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub async fn handle_client(
    socket: TcpStream,
    cfg: Arc<Config>,
    pool: BackendPool,
    stats: Arc<Stats>,
) {
    if let Err(e) = run_session(socket, cfg, pool, stats).await {
        tracing::debug!(error = %e, "session terminated");
    }
}

async fn run_session(
    socket: TcpStream,
    cfg: Arc<Config>,
    pool: BackendPool,
    stats: Arc<Stats>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let authenticated = !cfg.proxy_auth.enabled;
    let mut session = Session {
        id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
        client: RespConn::new(socket),
        cfg,
        pool,
        stats,
        authenticated,
        mode: Mode::Normal,
        pending: VecDeque::new(),
    };
    let result = session.serve().await;
    session.teardown().await;
    result
}

/// Session mode as a tagged union: the pinned connection exists exactly
/// when a protocol feature demands stickiness.
enum Mode {
    Normal,
    InTransaction {
        conn: BackendConn,
        in_multi: bool,
        watching: bool,
    },
    Subscribed {
        conn: BackendConn,
        subs: SubTracker,
    },
}

/// Bookkeeping for a subscribed pinned connection: which subscriptions the
/// client holds and how many backend replies forwarded commands still owe.
/// The connection may return to the pool only once both are empty; a
/// confirmation still in flight would otherwise surface as the next
/// lessee's reply.
#[derive(Debug, Default)]
struct SubTracker {
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
    shard_channels: HashSet<Bytes>,
    owed: usize,
}

impl SubTracker {
    fn new() -> Self {
        Self::default()
    }

    fn owed(&self) -> usize {
        self.owed
    }

    /// Every subscription dropped and every forwarded command answered.
    fn settled(&self) -> bool {
        self.owed == 0
            && self.channels.is_empty()
            && self.patterns.is_empty()
            && self.shard_channels.is_empty()
    }

    /// Account for a command written to the pinned connection. Subscribes
    /// confirm once per channel argument; a bare unsubscribe confirms once
    /// per currently-held entry of its kind, or once when there are none.
    fn on_forward(&mut self, verb: &str, args: &[Bytes]) {
        match verb {
            "SUBSCRIBE" => Self::subscribe(&mut self.channels, args, &mut self.owed),
            "PSUBSCRIBE" => Self::subscribe(&mut self.patterns, args, &mut self.owed),
            "SSUBSCRIBE" => Self::subscribe(&mut self.shard_channels, args, &mut self.owed),
            "UNSUBSCRIBE" => Self::unsubscribe(&mut self.channels, args, &mut self.owed),
            "PUNSUBSCRIBE" => Self::unsubscribe(&mut self.patterns, args, &mut self.owed),
            "SUNSUBSCRIBE" => Self::unsubscribe(&mut self.shard_channels, args, &mut self.owed),
            // PING and anything else forwarded draws exactly one reply.
            _ => self.owed += 1,
        }
    }

    fn subscribe(set: &mut HashSet<Bytes>, args: &[Bytes], owed: &mut usize) {
        for chan in args {
            set.insert(chan.clone());
        }
        // Zero arguments still draw a single error reply.
        *owed += args.len().max(1);
    }

    fn unsubscribe(set: &mut HashSet<Bytes>, args: &[Bytes], owed: &mut usize) {
        if args.is_empty() {
            *owed += set.len().max(1);
            set.clear();
        } else {
            for chan in args {
                set.remove(chan);
            }
            *owed += args.len();
        }
    }

    /// Message pushes are spontaneous; every other frame answers a
    /// forwarded command.
    fn on_backend_frame(&mut self, frame: &Frame) {
        if !is_push_message(frame) {
            self.owed = self.owed.saturating_sub(1);
        }
    }
}

struct Session {
    id: u64,
    client: RespConn<TcpStream>,
    cfg: Arc<Config>,
    pool: BackendPool,
    stats: Arc<Stats>,
    authenticated: bool,
    mode: Mode,
    pending: VecDeque<(Frame, Bytes)>,
}

enum Event {
    Backend(Result<Option<(Frame, Bytes)>>),
    Client(Result<Option<(Frame, Bytes)>>),
}

/// Backend vs client failure during a forward; they propagate differently.
enum RelayError {
    Backend(ProxyError),
    Client(ProxyError),
}

impl Session {
    async fn serve(&mut self) -> Result<()> {
        loop {
            if matches!(self.mode, Mode::Subscribed { .. }) {
                if !self.serve_subscribed().await? {
                    return Ok(());
                }
                continue;
            }

            let next = match self.pending.pop_front() {
                Some(item) => Some(item),
                None => match self.client.read_request().await {
                    Ok(next) => next,
                    Err(e) => {
                        self.report_protocol_error(&e).await;
                        return Err(e);
                    }
                },
            };
            let Some((frame, raw)) = next else {
                return Ok(());
            };

            let req = match parse_request(&frame) {
                Ok(r) => r,
                Err(e) => {
                    // Fatal: a desynchronized RESP stream cannot recover.
                    self.report_protocol_error(&e).await;
                    return Err(e);
                }
            };

            if !self.dispatch(req, raw).await? {
                return Ok(());
            }
        }
    }

    /// Returns `Ok(false)` when the session should close.
    async fn dispatch(&mut self, req: Request, raw: Bytes) -> Result<bool> {
        let cmd = match req {
            Request::Hello(hello) => {
                self.handle_hello(hello).await?;
                return Ok(true);
            }
            Request::Command(cmd) => cmd,
        };

        if !self.authenticated && !is_auth_exempt(&cmd.verb) {
            self.client
                .write_error("NOAUTH Authentication required.")
                .await?;
            return Ok(true);
        }

        // Commands answered by the proxy itself: connection-scoped state
        // cannot live on shared pooled backends.
        match cmd.verb.as_str() {
            "AUTH" => {
                self.handle_auth(&cmd).await?;
                return Ok(true);
            }
            "QUIT" => {
                self.client.write_simple("OK").await?;
                return Ok(false);
            }
            "RESET" => {
                self.reset_session().await;
                self.client.write_all(b"+RESET\r\n").await?;
                return Ok(true);
            }
            "SELECT" => {
                self.handle_select(&cmd).await?;
                return Ok(true);
            }
            _ => {}
        }

        self.route_command(&cmd, raw).await
    }

    async fn route_command(&mut self, cmd: &ParsedCommand, raw: Bytes) -> Result<bool> {
        // A pinned transaction takes every command wholesale; the backend
        // queues or rejects them itself.
        if matches!(self.mode, Mode::InTransaction { .. }) {
            return self.forward_pinned(cmd, raw).await;
        }

        let classified = classify(&cmd.verb);
        if !classified.known {
            self.stats.record_unknown_verb(&cmd.verb);
        }

        match classified.category {
            Category::TxControl => match cmd.verb.as_str() {
                "MULTI" | "WATCH" => self.enter_transaction(cmd, raw).await,
                // EXEC/DISCARD/UNWATCH outside a transaction; the master
                // produces the proper error reply.
                _ => self.relay_via_master(&cmd.verb, raw).await,
            },
            Category::PubSub if is_subscribe_verb(&cmd.verb) => {
                self.enter_subscribed(cmd, raw).await
            }
            Category::Read => self.forward_read(cmd, raw).await,
            Category::Blocking => self.forward_blocking(cmd, raw).await,
            // Write, Admin, Scripting, and non-subscribing PubSub
            // (PUBLISH and friends) all target the master.
            _ => self.relay_via_master(&cmd.verb, raw).await,
        }
    }

    /// One-shot forward to the master: acquire, relay, release.
    async fn relay_via_master(&mut self, verb: &str, raw: Bytes) -> Result<bool> {
        let mut conn = match self.pool.acquire(Role::Master).await {
            Ok(c) => c,
            Err(e) => {
                self.report_unavailable(&e).await?;
                return Ok(true);
            }
        };
        self.stats.record(Role::Master, verb);

        match relay_one(&mut self.client, &mut conn, &raw).await {
            Ok(()) => {
                self.pool.release(conn);
                Ok(true)
            }
            Err(RelayError::Client(e)) => {
                // Reply fully consumed from the backend; the connection is
                // clean even though the client went away.
                self.pool.release(conn);
                Err(e)
            }
            Err(RelayError::Backend(e)) => {
                tracing::warn!(session = self.id, error = %e, "master command failed");
                self.pool.invalidate(conn);
                self.client
                    .write_error("ERR backend unavailable (master)")
                    .await?;
                Ok(true)
            }
        }
    }

    /// Reads prefer a replica and fall back to the master, both when no
    /// replica is available and when the replica dies mid-command (reads
    /// are idempotent, so one retry on a fresh connection is safe).
    async fn forward_read(&mut self, cmd: &ParsedCommand, raw: Bytes) -> Result<bool> {
        let replica = match self.pool.acquire(Role::Replica).await {
            Ok(c) => Some(c),
            Err(_) => None,
        };
        let Some(mut conn) = replica else {
            return self.relay_via_master(&cmd.verb, raw).await;
        };
        self.stats.record(Role::Replica, &cmd.verb);

        match relay_one(&mut self.client, &mut conn, &raw).await {
            Ok(()) => {
                self.pool.release(conn);
                Ok(true)
            }
            Err(RelayError::Client(e)) => {
                self.pool.release(conn);
                Err(e)
            }
            Err(RelayError::Backend(e)) => {
                tracing::warn!(session = self.id, error = %e, "replica read failed; retrying on master");
                self.pool.invalidate(conn);
                self.stats.record_read_fallback(&cmd.verb);
                self.relay_via_master(&cmd.verb, raw).await
            }
        }
    }

    /// Blocking commands hold a master connection for their full duration.
    /// No proxy-side reply timeout: the command's own timeout argument
    /// governs. The client stream stays under watch so pipelined requests
    /// are stashed and a disconnect abandons the wait.
    async fn forward_blocking(&mut self, cmd: &ParsedCommand, raw: Bytes) -> Result<bool> {
        let mut conn = match self.pool.acquire(Role::Master).await {
            Ok(c) => c,
            Err(e) => {
                self.report_unavailable(&e).await?;
                return Ok(true);
            }
        };
        self.stats.record(Role::Master, &cmd.verb);

        if let Err(e) = conn.io().write_all(&raw).await {
            tracing::warn!(session = self.id, error = %e, "blocking command write failed");
            self.pool.invalidate(conn);
            self.client
                .write_error("ERR backend unavailable (master)")
                .await?;
            return Ok(true);
        }

        loop {
            let event = tokio::select! {
                reply = conn.io().read_frame() => Event::Backend(reply),
                req = self.client.read_request(),
                    if self.pending.len() < MAX_PIPELINED_STASH => Event::Client(req),
            };

            match event {
                Event::Backend(Ok(Some((_frame, reply_raw)))) => {
                    self.client.write_all(&reply_raw).await?;
                    self.pool.release(conn);
                    return Ok(true);
                }
                Event::Backend(Ok(None)) | Event::Backend(Err(_)) => {
                    self.pool.invalidate(conn);
                    self.client
                        .write_error("ERR backend unavailable (master)")
                        .await?;
                    return Ok(true);
                }
                Event::Client(Ok(Some(item))) => {
                    self.pending.push_back(item);
                }
                // The blocked reply can never be consumed now; closing the
                // connection beats trying to resynchronize it.
                Event::Client(Ok(None)) => {
                    drop(conn);
                    return Ok(false);
                }
                Event::Client(Err(e)) => {
                    drop(conn);
                    self.report_protocol_error(&e).await;
                    return Err(e);
                }
            }
        }
    }

    /// MULTI or WATCH: pin a master connection until the transaction ends.
    async fn enter_transaction(&mut self, cmd: &ParsedCommand, raw: Bytes) -> Result<bool> {
        let mut conn = match self.pool.acquire(Role::Master).await {
            Ok(c) => c,
            Err(e) => {
                self.report_unavailable(&e).await?;
                return Ok(true);
            }
        };
        self.stats.record(Role::Master, &cmd.verb);

        match relay_one(&mut self.client, &mut conn, &raw).await {
            Ok(()) => {
                self.mode = Mode::InTransaction {
                    conn,
                    in_multi: cmd.verb == "MULTI",
                    watching: cmd.verb == "WATCH",
                };
                Ok(true)
            }
            Err(RelayError::Client(e)) => {
                // The connection may already carry MULTI/WATCH state.
                drop(conn);
                Err(e)
            }
            Err(RelayError::Backend(e)) => {
                tracing::warn!(session = self.id, error = %e, "transaction pin failed");
                self.pool.invalidate(conn);
                self.client
                    .write_error("ERR backend unavailable (master)")
                    .await?;
                Ok(true)
            }
        }
    }

    /// Forward a command on the pinned transaction connection, tracking
    /// when the pin can be dropped.
    async fn forward_pinned(&mut self, cmd: &ParsedCommand, raw: Bytes) -> Result<bool> {
        let Mode::InTransaction {
            mut conn,
            mut in_multi,
            mut watching,
        } = std::mem::replace(&mut self.mode, Mode::Normal)
        else {
            unreachable!("forward_pinned outside transaction mode");
        };
        self.stats.record(Role::Master, &cmd.verb);

        match relay_one(&mut self.client, &mut conn, &raw).await {
            Ok(()) => {}
            Err(RelayError::Client(e)) => {
                drop(conn);
                return Err(e);
            }
            Err(RelayError::Backend(e)) => {
                // The transaction cannot migrate to another backend; the
                // client must re-issue MULTI/WATCH.
                tracing::warn!(session = self.id, error = %e, "pinned backend failed; transaction aborted");
                self.pool.invalidate(conn);
                self.client
                    .write_error("ERR backend unavailable (transaction aborted)")
                    .await?;
                return Ok(true);
            }
        }

        match cmd.verb.as_str() {
            "MULTI" => in_multi = true,
            "WATCH" => watching = true,
            "EXEC" | "DISCARD" => {
                // Transaction complete; the connection is clean again.
                self.pool.release(conn);
                return Ok(true);
            }
            "UNWATCH" => {
                watching = false;
                if !in_multi {
                    self.pool.release(conn);
                    return Ok(true);
                }
            }
            _ => {}
        }

        self.mode = Mode::InTransaction {
            conn,
            in_multi,
            watching,
        };
        Ok(true)
    }

    /// First subscribe: pin a master connection for the pub/sub lifetime.
    async fn enter_subscribed(&mut self, cmd: &ParsedCommand, raw: Bytes) -> Result<bool> {
        let mut conn = match self.pool.acquire(Role::Master).await {
            Ok(c) => c,
            Err(e) => {
                self.report_unavailable(&e).await?;
                return Ok(true);
            }
        };
        self.stats.record(Role::Master, &cmd.verb);

        if let Err(e) = conn.io().write_all(&raw).await {
            tracing::warn!(session = self.id, error = %e, "subscribe write failed");
            self.pool.invalidate(conn);
            self.client
                .write_error("ERR backend unavailable (master)")
                .await?;
            return Ok(true);
        }

        // Confirmations arrive as pushed frames and are relayed by the
        // subscribed-mode loop.
        let mut subs = SubTracker::new();
        subs.on_forward(&cmd.verb, &cmd.args);
        self.mode = Mode::Subscribed { conn, subs };
        Ok(true)
    }

    /// Subscribed mode: relay backend pushes as they arrive while accepting
    /// the narrow command set Redis allows on a subscribed connection.
    /// Returns `Ok(false)` when the session should close.
    async fn serve_subscribed(&mut self) -> Result<bool> {
        let Mode::Subscribed { mut conn, mut subs } =
            std::mem::replace(&mut self.mode, Mode::Normal)
        else {
            unreachable!("serve_subscribed outside subscribed mode");
        };

        loop {
            // Requests stashed during an earlier blocking command come
            // before anything new on the socket, but only once every
            // forwarded command has been answered, so replies keep request
            // order.
            let stashed = if subs.owed() == 0 {
                self.pending.pop_front()
            } else {
                None
            };
            let event = match stashed {
                Some(item) => Event::Client(Ok(Some(item))),
                None => tokio::select! {
                    push = conn.io().read_frame() => Event::Backend(push),
                    req = self.client.read_request(),
                        if self.pending.len() < MAX_PIPELINED_STASH => Event::Client(req),
                },
            };

            match event {
                Event::Backend(Ok(Some((frame, raw)))) => {
                    self.client.write_all(&raw).await?;
                    subs.on_backend_frame(&frame);
                    if subs.settled() {
                        // Fully unsubscribed with nothing in flight: the
                        // connection is an ordinary pooled connection again.
                        self.pool.release(conn);
                        return Ok(true);
                    }
                }
                Event::Backend(Ok(None)) | Event::Backend(Err(_)) => {
                    // Subscriptions cannot migrate across backends.
                    self.pool.invalidate(conn);
                    self.client
                        .write_error("ERR backend unavailable (subscription lost)")
                        .await?;
                    return Ok(true);
                }
                Event::Client(Ok(Some((frame, raw)))) => {
                    let req = match parse_request(&frame) {
                        Ok(r) => r,
                        Err(e) => {
                            drop(conn);
                            self.report_protocol_error(&e).await;
                            return Err(e);
                        }
                    };
                    match req {
                        Request::Hello(hello) => self.handle_hello(hello).await?,
                        Request::Command(cmd) => match cmd.verb.as_str() {
                            "QUIT" => {
                                self.client.write_simple("OK").await?;
                                drop(conn);
                                return Ok(false);
                            }
                            "RESET" => {
                                drop(conn);
                                self.client.write_all(b"+RESET\r\n").await?;
                                return Ok(true);
                            }
                            verb if is_allowed_while_subscribed(verb) => {
                                self.stats.record(Role::Master, verb);
                                subs.on_forward(verb, &cmd.args);
                                if let Err(e) = conn.io().write_all(&raw).await {
                                    tracing::warn!(session = self.id, error = %e, "pinned pubsub write failed");
                                    self.pool.invalidate(conn);
                                    self.client
                                        .write_error("ERR backend unavailable (subscription lost)")
                                        .await?;
                                    return Ok(true);
                                }
                            }
                            verb => {
                                self.client
                                    .write_error(&format!(
                                        "ERR Can't execute '{}': only (P|S)SUBSCRIBE / (P|S)UNSUBSCRIBE / PING / QUIT / RESET are allowed in this context",
                                        verb.to_ascii_lowercase()
                                    ))
                                    .await?;
                            }
                        },
                    }
                }
                Event::Client(Ok(None)) => {
                    // Client gone; backend may still push, so close rather
                    // than pool a connection with in-flight traffic.
                    drop(conn);
                    return Ok(false);
                }
                Event::Client(Err(e)) => {
                    drop(conn);
                    self.report_protocol_error(&e).await;
                    return Err(e);
                }
            }
        }
    }

    async fn handle_auth(&mut self, cmd: &ParsedCommand) -> Result<()> {
        if !self.cfg.proxy_auth.enabled {
            return self
                .client
                .write_error(
                    "ERR Client sent AUTH, but no password is set. \
                     Did you mean AUTH <username> <password>?",
                )
                .await;
        }

        let (user, pass) = match cmd.args.len() {
            1 => (
                "default".to_string(),
                String::from_utf8_lossy(&cmd.args[0]).into_owned(),
            ),
            2 => (
                String::from_utf8_lossy(&cmd.args[0]).into_owned(),
                String::from_utf8_lossy(&cmd.args[1]).into_owned(),
            ),
            _ => {
                return self
                    .client
                    .write_error("ERR wrong number of arguments for 'auth' command")
                    .await;
            }
        };

        if self.cfg.proxy_auth.verify(&user, &pass) {
            self.authenticated = true;
            self.client.write_simple("OK").await
        } else {
            self.client
                .write_error("WRONGPASS invalid username-password pair")
                .await
        }
    }

    /// HELLO is answered locally: protocol negotiation and client
    /// credentials are proxy concerns, never forwarded to shared backends.
    async fn handle_hello(&mut self, hello: HelloRequest) -> Result<()> {
        if let Some(v) = hello.protover {
            if v != 2 {
                return self
                    .client
                    .write_error("NOPROTO unsupported protocol version")
                    .await;
            }
        }

        if self.cfg.proxy_auth.enabled {
            if let Some((user, pass)) = &hello.auth {
                if self.cfg.proxy_auth.verify(user, pass) {
                    self.authenticated = true;
                } else {
                    return self
                        .client
                        .write_error("WRONGPASS invalid username-password pair")
                        .await;
                }
            }
            if !self.authenticated {
                return self
                    .client
                    .write_error("NOAUTH Authentication required.")
                    .await;
            }
        }

        // SETNAME is accepted for transparency; there is no per-client
        // backend connection to apply it to.
        if let Some(name) = &hello.setname {
            tracing::debug!(session = self.id, name = %name, "client set connection name");
        }
        let reply = hello_reply(self.id);
        self.client.write_all(&reply).await
    }

    /// All pooled backends sit on the db their URL configures, so SELECT
    /// only succeeds for that index.
    async fn handle_select(&mut self, cmd: &ParsedCommand) -> Result<()> {
        let Some(arg) = cmd.arg(0) else {
            return self
                .client
                .write_error("ERR wrong number of arguments for 'select' command")
                .await;
        };
        let requested = std::str::from_utf8(arg).unwrap_or("").parse::<u32>();
        match requested {
            Ok(idx) if idx == self.cfg.master.db_index() => self.client.write_simple("OK").await,
            Ok(_) => {
                self.client
                    .write_error("ERR SELECT is limited to the proxy's configured db")
                    .await
            }
            Err(_) => {
                self.client
                    .write_error("ERR value is not an integer or out of range")
                    .await
            }
        }
    }

    async fn report_unavailable(&mut self, e: &ProxyError) -> Result<()> {
        self.client.write_error(&format!("ERR {e}")).await
    }

    /// A desynchronized client stream is fatal; tell the client why before
    /// the connection closes.
    async fn report_protocol_error(&mut self, e: &ProxyError) {
        if let ProxyError::Protocol(msg) = e {
            let _ = self
                .client
                .write_error(&format!("ERR Protocol error: {msg}"))
                .await;
        }
    }

    async fn reset_session(&mut self) {
        match std::mem::replace(&mut self.mode, Mode::Normal) {
            Mode::Normal => {}
            Mode::InTransaction { conn, in_multi, .. } => {
                self.discard_pinned(conn, in_multi).await
            }
            Mode::Subscribed { conn, .. } => drop(conn),
        }
        self.authenticated = !self.cfg.proxy_auth.enabled;
        self.pending.clear();
    }

    /// Clear MULTI/WATCH state from a pinned connection so it can be
    /// pooled again; close it if the backend does not answer promptly.
    /// DISCARD errors outside MULTI and leaves watched keys armed, so a
    /// WATCH-only pin is cleared with UNWATCH instead.
    async fn discard_pinned(&mut self, mut conn: BackendConn, in_multi: bool) {
        let cleanup = if in_multi { "DISCARD" } else { "UNWATCH" };
        let wrote = conn
            .io()
            .write_all(&encode_command_str(&[cleanup]))
            .await
            .is_ok();
        let drained = wrote
            && matches!(
                timeout(Duration::from_secs(1), conn.io().read_frame()).await,
                Ok(Ok(Some(_)))
            );
        if drained {
            self.pool.release(conn);
        } else {
            drop(conn);
        }
    }

    async fn teardown(&mut self) {
        match std::mem::replace(&mut self.mode, Mode::Normal) {
            Mode::Normal => {}
            Mode::InTransaction { conn, in_multi, .. } => {
                self.discard_pinned(conn, in_multi).await
            }
            // May still carry pushed messages; never pool it.
            Mode::Subscribed { conn, .. } => drop(conn),
        }
        let _ = self.client.shutdown().await;
    }
}

/// Forward one command and relay its single reply, classifying failures by
/// which side broke.
async fn relay_one(
    client: &mut RespConn<TcpStream>,
    conn: &mut BackendConn,
    raw: &Bytes,
) -> std::result::Result<(), RelayError> {
    conn.io().write_all(raw).await.map_err(RelayError::Backend)?;
    let reply = conn.io().read_frame().await.map_err(RelayError::Backend)?;
    let Some((_frame, reply_raw)) = reply else {
        return Err(RelayError::Backend(ProxyError::BackendProtocol(
            "backend closed mid-command".into(),
        )));
    };
    client.write_all(&reply_raw).await.map_err(RelayError::Client)
}

fn is_auth_exempt(verb: &str) -> bool {
    matches!(verb, "AUTH" | "HELLO" | "QUIT" | "RESET")
}

fn is_subscribe_verb(verb: &str) -> bool {
    matches!(verb, "SUBSCRIBE" | "PSUBSCRIBE" | "SSUBSCRIBE")
}

fn is_allowed_while_subscribed(verb: &str) -> bool {
    matches!(
        verb,
        "SUBSCRIBE"
            | "UNSUBSCRIBE"
            | "PSUBSCRIBE"
            | "PUNSUBSCRIBE"
            | "SSUBSCRIBE"
            | "SUNSUBSCRIBE"
            | "PING"
    )
}

/// A spontaneous pub/sub delivery, as opposed to a reply or confirmation
/// for a forwarded command.
fn is_push_message(frame: &Frame) -> bool {
    let Frame::Array(items) = frame else {
        return false;
    };
    let Some(Frame::BulkString(kind)) = items.first() else {
        return false;
    };
    kind.as_ref().eq_ignore_ascii_case(b"message")
        || kind.as_ref().eq_ignore_ascii_case(b"pmessage")
        || kind.as_ref().eq_ignore_ascii_case(b"smessage")
}

fn hello_reply(id: u64) -> Vec<u8> {
    fn push_bulk(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(format!("${}\r\n{s}\r\n", s.len()).as_bytes());
    }

    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(b"*14\r\n");
    push_bulk(&mut out, "server");
    push_bulk(&mut out, "redis");
    push_bulk(&mut out, "version");
    push_bulk(&mut out, env!("CARGO_PKG_VERSION"));
    push_bulk(&mut out, "proto");
    out.extend_from_slice(b":2\r\n");
    push_bulk(&mut out, "id");
    out.extend_from_slice(format!(":{id}\r\n").as_bytes());
    push_bulk(&mut out, "mode");
    push_bulk(&mut out, "standalone");
    push_bulk(&mut out, "role");
    push_bulk(&mut out, "master");
    push_bulk(&mut out, "modules");
    out.extend_from_slice(b"*0\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmation(kind: &str, chan: &str, remaining: i64) -> Frame {
        Frame::Array(vec![
            Frame::BulkString(Bytes::copy_from_slice(kind.as_bytes())),
            Frame::BulkString(Bytes::copy_from_slice(chan.as_bytes())),
            Frame::Integer(remaining),
        ])
    }

    fn chan(name: &str) -> Bytes {
        Bytes::copy_from_slice(name.as_bytes())
    }

    #[test]
    fn transient_zero_count_does_not_settle_tracker() {
        let mut subs = SubTracker::new();
        subs.on_forward("SUBSCRIBE", &[chan("a")]);
        subs.on_forward("UNSUBSCRIBE", &[chan("a")]);
        subs.on_forward("SUBSCRIBE", &[chan("b")]);

        subs.on_backend_frame(&confirmation("subscribe", "a", 1));
        // The zero count is transient: a subscribe is still in flight.
        subs.on_backend_frame(&confirmation("unsubscribe", "a", 0));
        assert!(!subs.settled());
        subs.on_backend_frame(&confirmation("subscribe", "b", 1));
        assert!(!subs.settled());

        subs.on_forward("UNSUBSCRIBE", &[chan("b")]);
        subs.on_backend_frame(&confirmation("unsubscribe", "b", 0));
        assert!(subs.settled());
    }

    #[test]
    fn bare_unsubscribe_confirms_per_held_channel() {
        let mut subs = SubTracker::new();
        subs.on_forward("SUBSCRIBE", &[chan("a"), chan("b")]);
        subs.on_forward("UNSUBSCRIBE", &[]);
        assert_eq!(subs.owed(), 4);

        subs.on_backend_frame(&confirmation("subscribe", "a", 1));
        subs.on_backend_frame(&confirmation("subscribe", "b", 2));
        subs.on_backend_frame(&confirmation("unsubscribe", "a", 1));
        assert!(!subs.settled());
        subs.on_backend_frame(&confirmation("unsubscribe", "b", 0));
        assert!(subs.settled());
    }

    #[test]
    fn message_pushes_are_not_replies() {
        let mut subs = SubTracker::new();
        subs.on_forward("PING", &[]);

        let push = Frame::Array(vec![
            Frame::BulkString(Bytes::from_static(b"message")),
            Frame::BulkString(Bytes::from_static(b"chan")),
            Frame::BulkString(Bytes::from_static(b"payload")),
        ]);
        assert!(is_push_message(&push));
        subs.on_backend_frame(&push);
        assert_eq!(subs.owed(), 1);

        subs.on_backend_frame(&Frame::SimpleString(Bytes::from_static(b"PONG")));
        assert_eq!(subs.owed(), 0);
    }

    #[test]
    fn subscribed_command_whitelist() {
        assert!(is_allowed_while_subscribed("UNSUBSCRIBE"));
        assert!(is_allowed_while_subscribed("PING"));
        assert!(!is_allowed_while_subscribed("GET"));
        assert!(!is_allowed_while_subscribed("PUBLISH"));
    }

    #[test]
    fn hello_reply_is_wellformed_resp2() {
        let reply = hello_reply(7);
        assert!(reply.starts_with(b"*14\r\n$6\r\nserver\r\n$5\r\nredis\r\n"));
        assert!(reply.ends_with(b"$7\r\nmodules\r\n*0\r\n"));
    }
}
