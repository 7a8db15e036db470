//! The per-connection sender: one reader task, one keepalive task, and a
//! waiter map that rendezvouses RPC callers with their replies.
//!
//! The reader owns the receive half of the transport and is the only task
//! that decrypts. Every decoded object runs through [`SenderInner::process_message`],
//! whose switch is the authoritative list of service messages this layer
//! absorbs; anything unknown is offered to the registered server-request
//! handlers and otherwise dropped.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use courier_crypto::AuthKey;
use courier_mtproto::authentication;
use courier_mtproto::{EncryptedSession, PlainMessage, PlainSession};
use courier_tl::mtproto::{
    BadMsgNotification, BadServerSalt, DhGenAnswer, GzipPacked, MsgContainer, MsgDetailedInfo,
    MsgNewDetailedInfo, MsgsAck, NewSessionCreated, Ping, Pong, ResPq, RpcError as TlRpcError,
    RpcResult, ServerDhParams,
};
use courier_tl::{Deserializable, Identifiable, RemoteCall, Serializable};
use tokio::io::ReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};

use crate::errors::{InvocationError, RpcError};
use crate::session::{Session, SessionStore};
use crate::socks5::Socks5Config;
use crate::transport::{FrameReader, FrameWriter, Mode, Transport, TransportError};

/// Acks are coalesced once this many server messages await one.
const ACKS_THRESHOLD: usize = 10;
/// Keepalive ping period.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Reads and writes idle longer than this trigger a reconnect.
const NET_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for dialing and for the whole key exchange.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// External clock disagreements below this are ignored.
const CLOCK_SKEW_THRESHOLD: i64 = 60;

const ID_MSG_CONTAINER: u32 = MsgContainer::CONSTRUCTOR_ID;
const ID_BAD_SERVER_SALT: u32 = BadServerSalt::CONSTRUCTOR_ID;
const ID_NEW_SESSION: u32 = NewSessionCreated::CONSTRUCTOR_ID;
const ID_PONG: u32 = Pong::CONSTRUCTOR_ID;
const ID_MSGS_ACK: u32 = MsgsAck::CONSTRUCTOR_ID;
const ID_MSG_DETAILED_INFO: u32 = MsgDetailedInfo::CONSTRUCTOR_ID;
const ID_MSG_NEW_DETAILED_INFO: u32 = MsgNewDetailedInfo::CONSTRUCTOR_ID;
const ID_BAD_MSG_NOTIFICATION: u32 = BadMsgNotification::CONSTRUCTOR_ID;
const ID_RPC_RESULT: u32 = RpcResult::CONSTRUCTOR_ID;
const ID_RPC_ERROR: u32 = TlRpcError::CONSTRUCTOR_ID;
const ID_GZIP_PACKED: u32 = GzipPacked::CONSTRUCTOR_ID;

/// A callback offered every inbound object the sender itself does not
/// absorb. Returning `true` claims the object.
pub type ServerRequestHandler = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Invoked on `FLOOD_WAIT_*` errors. Returning `true` means "handled, send
/// the request again"; `false` surfaces the error to the caller.
pub type FloodHandler = Arc<dyn Fn(&RpcError) -> bool + Send + Sync>;

/// An external time reference for clock-skew detection.
///
/// Implementations may block briefly (the sender calls this off its async
/// paths); failures are reported as `None` and are never fatal.
pub trait ClockSource: Send + Sync {
    /// Current Unix time according to the external reference.
    fn unix_now(&self) -> Option<i64>;
}

/// The default source: no external reference at all. Message-id clocks are
/// then corrected only when the server complains (codes 16/17).
pub struct NoExternalClock;

impl ClockSource for NoExternalClock {
    fn unix_now(&self) -> Option<i64> {
        None
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ─── Replies ─────────────────────────────────────────────────────────────────

/// What a waiter receives for its message id.
#[derive(Debug)]
pub(crate) enum Reply {
    /// The `rpc_result` body, gzip already unwrapped.
    Ok(Vec<u8>),
    /// The server answered with `rpc_error`.
    Rpc(RpcError),
    /// `bad_msg_notification` named this message.
    BadMsg { code: i32 },
    /// The session was reset (salt rotation); the request must be re-sent.
    ConfigsChanged,
    /// The sender is shutting down.
    Dropped,
}

// ─── -404 watchdog ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct KeyWatchdog {
    count: u32,
    last_unix: i64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum WatchdogVerdict {
    /// Noted; keep reading.
    Continue,
    /// The burst reached the reconnect threshold.
    Reconnect,
    /// The key is gone for good.
    Fatal,
}

impl KeyWatchdog {
    /// Record one `-404`. Repeats within 30 s of the previous one grow the
    /// burst; a longer gap starts a new burst.
    fn record(&mut self, now: i64) -> WatchdogVerdict {
        if self.count == 0 || now - self.last_unix >= 30 {
            self.count = 1;
        } else {
            self.count += 1;
        }
        self.last_unix = now;
        if self.count > 8 {
            WatchdogVerdict::Fatal
        } else if self.count == 4 {
            WatchdogVerdict::Reconnect
        } else {
            WatchdogVerdict::Continue
        }
    }
}

// ─── Sender ──────────────────────────────────────────────────────────────────

/// Construction parameters for [`Sender::connect`].
pub(crate) struct SenderConfig {
    pub addr: String,
    pub app_id: i32,
    pub mode: Mode,
    /// A stored `(auth_key, salt)`; `None` runs the key exchange.
    pub auth: Option<([u8; 256], i64)>,
    pub socks5: Option<Socks5Config>,
    pub handlers: Arc<Vec<ServerRequestHandler>>,
    pub flood_handler: Option<FloodHandler>,
    pub clock: Arc<dyn ClockSource>,
    pub store: Arc<dyn SessionStore>,
}

/// One authenticated connection to one data center. Cheap to clone.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

pub(crate) struct SenderInner {
    addr: String,
    app_id: i32,
    mode: Mode,
    socks5: Option<Socks5Config>,

    auth_key: AuthKey,
    session_id: i64,
    session: Mutex<EncryptedSession>,

    writer: AsyncMutex<Option<FrameWriter<tokio::io::WriteHalf<TcpStream>>>>,
    waiters: Mutex<HashMap<i64, oneshot::Sender<Reply>>>,
    pending_acks: Mutex<HashSet<i64>>,

    handlers: Arc<Vec<ServerRequestHandler>>,
    flood_handler: Option<FloodHandler>,
    clock: Arc<dyn ClockSource>,
    store: Arc<dyn SessionStore>,

    watchdog: Mutex<KeyWatchdog>,
    needs_time_sync: AtomicBool,

    /// Bumped on every reconnect; readers from older connections stand down.
    epoch: AtomicU64,
    reconnect_lock: AsyncMutex<()>,
    stopped: AtomicBool,
    fatal: AtomicBool,
    shutdown: Notify,
}

impl Sender {
    /// Dial, announce the framing mode, run the key exchange when no key is
    /// stored, and start the reader and keepalive tasks.
    pub(crate) async fn connect(config: SenderConfig) -> Result<Self, InvocationError> {
        log::info!("[courier] connecting to [{}] ...", config.addr);
        let stream = open_stream(&config.addr, config.socks5.as_ref()).await?;
        let mut transport = Transport::start(config.mode, stream).await?;

        let (key_bytes, salt, time_offset, fresh_key) = match config.auth {
            Some((key, salt)) => (key, salt, 0, false),
            None => {
                log::debug!("[courier] no auth key stored, generating one");
                let done = tokio::time::timeout(CONNECT_TIMEOUT, handshake(&mut transport))
                    .await
                    .map_err(|_| {
                        InvocationError::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "key exchange timed out",
                        ))
                    })??;
                log::debug!("[courier] auth key generated");
                (done.auth_key, done.first_salt, done.time_offset, true)
            }
        };

        let session = EncryptedSession::new(key_bytes, salt, time_offset);
        let inner = Arc::new(SenderInner {
            addr: config.addr,
            app_id: config.app_id,
            mode: config.mode,
            socks5: config.socks5,
            auth_key: AuthKey::from_bytes(key_bytes),
            session_id: session.session_id(),
            session: Mutex::new(session),
            writer: AsyncMutex::new(None),
            waiters: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashSet::new()),
            handlers: config.handlers,
            flood_handler: config.flood_handler,
            clock: config.clock,
            store: config.store,
            watchdog: Mutex::new(KeyWatchdog::default()),
            needs_time_sync: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            reconnect_lock: AsyncMutex::new(()),
            stopped: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        let (reader, writer) = transport.into_split();
        *inner.writer.lock().await = Some(writer);
        spawn_reader(Arc::clone(&inner), reader, 0);
        tokio::spawn(run_pinger(Arc::clone(&inner)));

        if fresh_key {
            inner.persist_session();
        }
        inner.sync_time_offset().await;

        log::info!("[courier] connection to [{}] established", inner.addr);
        Ok(Self { inner })
    }

    /// Send a typed request and decode its reply.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<R::Return, InvocationError> {
        let body = self.invoke_raw(&request.to_bytes()).await?;
        R::Return::from_bytes(&body).map_err(Into::into)
    }

    /// Send pre-serialized request bytes and return the raw reply body.
    ///
    /// Transient failures are absorbed per class: one automatic resend for a
    /// broken transport, one for a clock complaint (codes 16/17), as many as
    /// the flood handler asks for, and a resend on every session reset.
    /// Resends allocate fresh message ids; idempotence is the caller's
    /// concern.
    pub(crate) async fn invoke_raw(&self, body: &[u8]) -> Result<Vec<u8>, InvocationError> {
        let inner = &self.inner;
        let mut transport_retried = false;
        let mut bad_msg_retried = false;

        loop {
            if inner.fatal.load(Ordering::Acquire) {
                return Err(InvocationError::AuthKeyInvalid);
            }

            let (msg_id, rx) = match inner.send_with_waiter(body, true).await {
                Ok(pair) => pair,
                Err(e) if is_transport_failure(&e) && !transport_retried => {
                    transport_retried = true;
                    log::info!("[courier] send failed ({e}), reconnecting to [{}]", inner.addr);
                    reconnect(inner).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Removes the waiter slot when this call is cancelled, so a
            // late reply finds nobody and is discarded.
            let _slot = WaiterGuard {
                inner: Arc::clone(inner),
                msg_id,
            };

            match rx.await {
                Err(_) => return Err(inner.terminal_error()),
                Ok(Reply::Ok(bytes)) => return Ok(bytes),
                Ok(Reply::Rpc(err)) => {
                    if err.is_flood_wait() {
                        if let Some(handler) = &inner.flood_handler {
                            if handler(&err) {
                                log::debug!("[courier] flood handled, resending request");
                                continue;
                            }
                        }
                    }
                    return Err(InvocationError::Rpc(err));
                }
                Ok(Reply::BadMsg { code }) => {
                    if (code == 16 || code == 17) && !bad_msg_retried {
                        bad_msg_retried = true;
                        inner.sync_time_offset().await;
                        continue;
                    }
                    return Err(InvocationError::BadMessage { code });
                }
                Ok(Reply::ConfigsChanged) => {
                    log::debug!("[courier] session configs changed, resending request");
                    continue;
                }
                Ok(Reply::Dropped) => return Err(inner.terminal_error()),
            }
        }
    }

    /// Measure round-trip time with a tracked ping.
    pub async fn ping(&self) -> Result<Duration, InvocationError> {
        let start = Instant::now();
        let body = Ping { ping_id: unix_now() }.to_bytes();
        let (msg_id, rx) = self.inner.send_with_waiter(&body, false).await?;
        let _slot = WaiterGuard {
            inner: Arc::clone(&self.inner),
            msg_id,
        };
        match rx.await {
            Ok(Reply::Ok(_)) => Ok(start.elapsed()),
            Ok(_) | Err(_) => Err(self.inner.terminal_error()),
        }
    }

    /// Stop the background tasks, flush any pending acks, close the stream,
    /// and fail every waiter.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.notify_waiters();
        if let Some(msg_ids) = inner.take_all_acks() {
            let ack = MsgsAck { msg_ids }.to_bytes();
            let _ = inner.send_service(&ack).await;
        }
        if let Some(mut writer) = inner.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        inner.fail_all_waiters();
        log::debug!("[courier] disconnected from [{}]", inner.addr);
    }

    /// The address this sender is bound to.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Snapshot the persistable session state.
    pub fn session_snapshot(&self) -> Session {
        let (key, salt) = {
            let session = self.inner.session.lock().unwrap();
            (session.auth_key_bytes(), session.salt())
        };
        Session::new(key, salt, self.inner.addr.clone(), self.inner.app_id)
    }

    /// True once [`Sender::disconnect`] ran or the watchdog gave up.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn detached(
        store: Arc<dyn SessionStore>,
        handlers: Arc<Vec<ServerRequestHandler>>,
        flood_handler: Option<FloodHandler>,
    ) -> Self {
        let mut key = [0u8; 256];
        key.iter_mut().enumerate().for_each(|(i, x)| *x = i as u8);
        let session = EncryptedSession::with_session_id(key, 111, 0, 4242);
        Self {
            inner: Arc::new(SenderInner {
                addr: "203.0.113.1:443".into(),
                app_id: 7,
                mode: Mode::Abridged,
                socks5: None,
                auth_key: AuthKey::from_bytes(key),
                session_id: session.session_id(),
                session: Mutex::new(session),
                writer: AsyncMutex::new(None),
                waiters: Mutex::new(HashMap::new()),
                pending_acks: Mutex::new(HashSet::new()),
                handlers,
                flood_handler,
                clock: Arc::new(NoExternalClock),
                store,
                watchdog: Mutex::new(KeyWatchdog::default()),
                needs_time_sync: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                reconnect_lock: AsyncMutex::new(()),
                stopped: AtomicBool::new(false),
                fatal: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }
}

// ─── Waiter guard ────────────────────────────────────────────────────────────

struct WaiterGuard {
    inner: Arc<SenderInner>,
    msg_id: i64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.inner.waiters.lock().unwrap().remove(&self.msg_id);
    }
}

// ─── SenderInner ─────────────────────────────────────────────────────────────

impl SenderInner {
    /// Allocate a header under the session lock, register the waiter, then
    /// seal and write outside of it.
    async fn send_with_waiter(
        &self,
        body: &[u8],
        content_related: bool,
    ) -> Result<(i64, oneshot::Receiver<Reply>), InvocationError> {
        let header = self.session.lock().unwrap().next_header(content_related);
        let frame = EncryptedSession::seal(&self.auth_key, &header, body);

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(header.msg_id, tx);

        if let Err(e) = self.write_frame(&frame).await {
            self.waiters.lock().unwrap().remove(&header.msg_id);
            return Err(e);
        }
        Ok((header.msg_id, rx))
    }

    /// Send a service message (ack, keepalive) that expects no tracked reply.
    async fn send_service(&self, body: &[u8]) -> Result<(), InvocationError> {
        let header = self.session.lock().unwrap().next_header(false);
        let frame = EncryptedSession::seal(&self.auth_key, &header, body);
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), InvocationError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            InvocationError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport is closed",
            ))
        })?;
        match tokio::time::timeout(NET_TIMEOUT, writer.write_msg(frame)).await {
            Err(_) => Err(InvocationError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "write timed out",
            ))),
            Ok(result) => result.map_err(Into::into),
        }
    }

    fn terminal_error(&self) -> InvocationError {
        if self.fatal.load(Ordering::Acquire) {
            InvocationError::AuthKeyInvalid
        } else {
            InvocationError::Dropped
        }
    }

    fn persist_session(&self) {
        let (key, salt) = {
            let session = self.session.lock().unwrap();
            (session.auth_key_bytes(), session.salt())
        };
        let session = Session::new(key, salt, self.addr.clone(), self.app_id);
        if let Err(e) = self.store.save(&session) {
            log::warn!("[courier] saving session failed: {e}");
        }
    }

    /// Query the external clock; record the offset only past the threshold.
    async fn sync_time_offset(&self) {
        let clock = Arc::clone(&self.clock);
        let external = tokio::task::spawn_blocking(move || clock.unix_now())
            .await
            .ok()
            .flatten();
        let Some(external) = external else { return };
        let delta = external - unix_now();
        if delta.abs() > CLOCK_SKEW_THRESHOLD {
            log::info!("[courier] system clock off by {delta}s, correcting message ids");
            self.session.lock().unwrap().set_time_offset(delta as i32);
        }
    }

    fn fail_all_waiters(&self) {
        let snapshot = std::mem::take(&mut *self.waiters.lock().unwrap());
        for (_, tx) in snapshot {
            let _ = tx.send(Reply::Dropped);
        }
    }

    fn declare_auth_key_invalid(&self) {
        log::error!("[courier] auth key declared invalid after repeated -404");
        self.fatal.store(true, Ordering::Release);
        self.stopped.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
        self.fail_all_waiters();
    }

    fn note_auth_key_404(&self) -> WatchdogVerdict {
        self.watchdog.lock().unwrap().record(unix_now())
    }

    fn deliver(&self, msg_id: i64, reply: Reply) {
        match self.waiters.lock().unwrap().remove(&msg_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => log::debug!("[courier] no waiter for msg {msg_id}, reply discarded"),
        }
    }

    /// Drain the pending-ack set once it reaches the threshold.
    fn take_due_acks(&self) -> Option<Vec<i64>> {
        let mut acks = self.pending_acks.lock().unwrap();
        if acks.len() >= ACKS_THRESHOLD {
            Some(acks.drain().collect())
        } else {
            None
        }
    }

    /// Drain whatever is pending, regardless of the threshold. Used when the
    /// connection is going away.
    fn take_all_acks(&self) -> Option<Vec<i64>> {
        let mut acks = self.pending_acks.lock().unwrap();
        if acks.is_empty() {
            None
        } else {
            Some(acks.drain().collect())
        }
    }

    /// Dispatch one decrypted message. Containers recurse; everything else
    /// lands in exactly one arm of the switch.
    fn process_message(
        &self,
        msg_id: i64,
        seq_no: i32,
        body: &[u8],
    ) -> Result<(), InvocationError> {
        // Content-bearing messages want an ack; a repeat means the server
        // never saw ours, so skip reprocessing but keep it pending.
        if seq_no & 1 == 1 {
            let mut acks = self.pending_acks.lock().unwrap();
            if !acks.insert(msg_id) {
                return Ok(());
            }
        }

        // Unwrap any number of gzip layers before switching.
        let mut owned;
        let mut body = body;
        loop {
            if body.len() < 4 {
                return Err(InvocationError::Deserialize("object shorter than 4 bytes".into()));
            }
            let cid = u32::from_le_bytes(body[..4].try_into().unwrap());
            if cid != ID_GZIP_PACKED {
                break;
            }
            let packed = GzipPacked::from_bytes(body)?;
            owned = gz_inflate(&packed.packed_data)?;
            body = &owned;
        }

        let cid = u32::from_le_bytes(body[..4].try_into().unwrap());
        match cid {
            ID_MSG_CONTAINER => {
                let container = MsgContainer::from_bytes(body)?;
                for item in container.messages {
                    self.process_message(item.msg_id, item.seq_no, &item.body)?;
                }
            }

            ID_BAD_SERVER_SALT => {
                let bad_salt = BadServerSalt::from_bytes(body)?;
                log::debug!(
                    "[courier] bad_server_salt for msg {}, rotating salt",
                    bad_salt.bad_msg_id
                );
                self.session
                    .lock()
                    .unwrap()
                    .set_salt(bad_salt.new_server_salt);
                self.persist_session();

                // Every in-flight request resends itself against the new
                // salt; swap the map so late registrations are unaffected.
                let snapshot = std::mem::take(&mut *self.waiters.lock().unwrap());
                for (_, tx) in snapshot {
                    let _ = tx.send(Reply::ConfigsChanged);
                }
            }

            ID_NEW_SESSION => {
                let created = NewSessionCreated::from_bytes(body)?;
                self.session.lock().unwrap().set_salt(created.server_salt);
                self.persist_session();
            }

            ID_PONG => {
                let pong = Pong::from_bytes(body)?;
                self.deliver(pong.msg_id, Reply::Ok(body.to_vec()));
            }

            ID_MSGS_ACK => {
                // Nothing to do; we do not track outbound acks.
            }

            ID_MSG_DETAILED_INFO => {
                let info = MsgDetailedInfo::from_bytes(body)?;
                self.pending_acks.lock().unwrap().insert(info.answer_msg_id);
            }

            ID_MSG_NEW_DETAILED_INFO => {
                let info = MsgNewDetailedInfo::from_bytes(body)?;
                self.pending_acks.lock().unwrap().insert(info.answer_msg_id);
            }

            ID_BAD_MSG_NOTIFICATION => {
                let bad_msg = BadMsgNotification::from_bytes(body)?;
                log::debug!(
                    "[courier] bad_msg_notification code {} for msg {}",
                    bad_msg.error_code,
                    bad_msg.bad_msg_id
                );
                if bad_msg.error_code == 16 || bad_msg.error_code == 17 {
                    self.needs_time_sync.store(true, Ordering::Release);
                }
                self.deliver(
                    bad_msg.bad_msg_id,
                    Reply::BadMsg {
                        code: bad_msg.error_code,
                    },
                );
            }

            ID_RPC_RESULT => {
                let result = RpcResult::from_bytes(body)?;
                let reply = unwrap_rpc_result(result.result)?;
                self.deliver(result.req_msg_id, reply);
            }

            _ => {
                let mut claimed = false;
                for handler in self.handlers.iter() {
                    if handler(body) {
                        claimed = true;
                        break;
                    }
                }
                if !claimed {
                    log::debug!("[courier] unhandled server object {cid:#010x}, dropped");
                }
            }
        }
        Ok(())
    }
}

/// Unwrap an `rpc_result` payload: peel gzip, surface `rpc_error`.
fn unwrap_rpc_result(mut result: Vec<u8>) -> Result<Reply, InvocationError> {
    loop {
        if result.len() < 4 {
            return Err(InvocationError::Deserialize("rpc_result body too short".into()));
        }
        match u32::from_le_bytes(result[..4].try_into().unwrap()) {
            ID_GZIP_PACKED => {
                let packed = GzipPacked::from_bytes(&result)?;
                result = gz_inflate(&packed.packed_data)?;
            }
            ID_RPC_ERROR => {
                let err = TlRpcError::from_bytes(&result)?;
                return Ok(Reply::Rpc(RpcError::from_wire(
                    err.error_code,
                    &err.error_message,
                )));
            }
            _ => return Ok(Reply::Ok(result)),
        }
    }
}

fn gz_inflate(data: &[u8]) -> Result<Vec<u8>, InvocationError> {
    use std::io::Read;
    let mut out = Vec::new();
    if flate2::read::GzDecoder::new(data).read_to_end(&mut out).is_ok() && !out.is_empty() {
        return Ok(out);
    }
    out.clear();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|_| InvocationError::Deserialize("gzip_packed inflate failed".into()))?;
    Ok(out)
}

fn is_transport_failure(err: &InvocationError) -> bool {
    match err {
        InvocationError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected
                | io::ErrorKind::TimedOut
        ),
        InvocationError::Transport(e) => e.is_reconnect_trigger(),
        _ => false,
    }
}

// ─── Connection plumbing ─────────────────────────────────────────────────────

async fn open_stream(
    addr: &str,
    socks5: Option<&Socks5Config>,
) -> Result<TcpStream, InvocationError> {
    let dial = async {
        match socks5 {
            Some(proxy) => proxy.connect(addr).await,
            None => Ok(TcpStream::connect(addr).await?),
        }
    };
    tokio::time::timeout(CONNECT_TIMEOUT, dial)
        .await
        .map_err(|_| {
            InvocationError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connecting to {addr} timed out"),
            ))
        })?
}

/// Run the key exchange over a dedicated service channel: the reader task
/// does not exist yet, so handshake replies can only arrive here and never
/// reach the multiplexer.
async fn handshake(
    transport: &mut Transport<TcpStream>,
) -> Result<authentication::Finished, InvocationError> {
    let mut plain = PlainSession::new();

    let (req1, s1) = authentication::step1()?;
    transport.write_msg(&plain.pack(&req1).to_bytes()).await?;
    let res_pq: ResPq = read_service_reply(transport).await?;

    let (req2, s2) = authentication::step2(s1, res_pq)?;
    transport.write_msg(&plain.pack(&req2).to_bytes()).await?;
    let dh_params: ServerDhParams = read_service_reply(transport).await?;

    let (req3, s3) = authentication::step3(s2, dh_params)?;
    transport.write_msg(&plain.pack(&req3).to_bytes()).await?;
    let answer: DhGenAnswer = read_service_reply(transport).await?;

    Ok(authentication::finish(s3, answer)?)
}

async fn read_service_reply<T: Deserializable>(
    transport: &mut Transport<TcpStream>,
) -> Result<T, InvocationError> {
    let frame = transport.read_msg().await?;
    let plain =
        PlainMessage::from_bytes(&frame).map_err(|e| InvocationError::Deserialize(e.to_string()))?;
    T::from_bytes(&plain.body).map_err(Into::into)
}

fn spawn_reader(
    inner: Arc<SenderInner>,
    reader: FrameReader<ReadHalf<TcpStream>>,
    epoch: u64,
) {
    tokio::spawn(run_reader(inner, reader, epoch));
}

async fn run_reader(
    inner: Arc<SenderInner>,
    mut reader: FrameReader<ReadHalf<TcpStream>>,
    epoch: u64,
) {
    loop {
        if inner.stopped.load(Ordering::Acquire) {
            return;
        }

        let frame = match tokio::time::timeout(NET_TIMEOUT, reader.read_msg()).await {
            Err(_idle) => {
                log::debug!("[courier] connection idle past {NET_TIMEOUT:?}, reconnecting");
                reconnect_if_current(&inner, epoch).await;
                return;
            }
            Ok(Err(TransportError::Code(code))) => {
                if code == -404 {
                    match inner.note_auth_key_404() {
                        WatchdogVerdict::Continue => continue,
                        WatchdogVerdict::Reconnect => {
                            log::debug!("[courier] -404 burst, refreshing connection");
                            reconnect_if_current(&inner, epoch).await;
                            return;
                        }
                        WatchdogVerdict::Fatal => {
                            inner.declare_auth_key_invalid();
                            return;
                        }
                    }
                }
                log::warn!("[courier] transport error code {code}");
                reconnect_if_current(&inner, epoch).await;
                return;
            }
            Ok(Err(e)) => {
                if inner.stopped.load(Ordering::Acquire) {
                    return;
                }
                log::debug!("[courier] read failed ({e}), reconnecting");
                reconnect_if_current(&inner, epoch).await;
                return;
            }
            Ok(Ok(frame)) => frame,
        };

        let mut frame = frame;
        let message = match EncryptedSession::open(&inner.auth_key, inner.session_id, &mut frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[courier] failed to open inbound frame ({e}), reconnecting");
                reconnect_if_current(&inner, epoch).await;
                return;
            }
        };

        if let Err(e) = inner.process_message(message.msg_id, message.seq_no, &message.body) {
            log::debug!("[courier] dispatch failed: {e}");
        }

        if inner.needs_time_sync.swap(false, Ordering::AcqRel) {
            inner.sync_time_offset().await;
        }

        if let Some(msg_ids) = inner.take_due_acks() {
            log::debug!("[courier] flushing {} acks", msg_ids.len());
            let ack = MsgsAck { msg_ids }.to_bytes();
            if let Err(e) = inner.send_service(&ack).await {
                log::debug!("[courier] sending acks failed: {e}");
            }
        }
    }
}

/// Re-establish the stream and start a fresh reader. Single-flight; the
/// epoch bump makes readers of older connections stand down silently.
async fn reconnect(inner: &Arc<SenderInner>) -> Result<(), InvocationError> {
    let _flight = inner.reconnect_lock.lock().await;
    if inner.stopped.load(Ordering::Acquire) {
        return Err(inner.terminal_error());
    }
    let epoch = inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;

    log::info!("[courier] reconnecting to [{}] ...", inner.addr);
    let stream = open_stream(&inner.addr, inner.socks5.as_ref()).await?;
    let transport = Transport::start(inner.mode, stream).await?;
    let (reader, writer) = transport.into_split();
    *inner.writer.lock().await = Some(writer);
    spawn_reader(Arc::clone(inner), reader, epoch);
    log::info!("[courier] reconnected to [{}]", inner.addr);
    Ok(())
}

/// Reconnect only if this reader still belongs to the live connection.
async fn reconnect_if_current(inner: &Arc<SenderInner>, epoch: u64) {
    if inner.epoch.load(Ordering::Acquire) != epoch {
        return;
    }
    if let Err(e) = reconnect(inner).await {
        log::error!("[courier] reconnect failed: {e}");
    }
}

async fn run_pinger(inner: Arc<SenderInner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => return,
            _ = tokio::time::sleep(PING_INTERVAL) => {}
        }
        if inner.stopped.load(Ordering::Acquire) {
            return;
        }
        let ping = Ping { ping_id: unix_now() }.to_bytes();
        if let Err(e) = inner.send_service(&ping).await {
            log::debug!("[courier] keepalive ping failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn detached_sender() -> Sender {
        Sender::detached(Arc::new(MemoryStore::new()), Arc::new(Vec::new()), None)
    }

    fn register_waiter(sender: &Sender, msg_id: i64) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        sender.inner.waiters.lock().unwrap().insert(msg_id, tx);
        rx
    }

    fn unknown_object() -> Vec<u8> {
        0x7b1c_2d3eu32.to_le_bytes().to_vec()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn gzip_packed(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzipPacked::CONSTRUCTOR_ID.serialize(&mut out);
        gzip(data).serialize(&mut out);
        out
    }

    fn rpc_result(req_msg_id: i64, result: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        RpcResult::CONSTRUCTOR_ID.serialize(&mut out);
        req_msg_id.serialize(&mut out);
        out.extend_from_slice(result);
        out
    }

    fn rpc_error(code: i32, message: &str) -> Vec<u8> {
        let mut out = Vec::new();
        TlRpcError::CONSTRUCTOR_ID.serialize(&mut out);
        code.serialize(&mut out);
        message.to_string().serialize(&mut out);
        out
    }

    fn pong(msg_id: i64, ping_id: i64) -> Vec<u8> {
        let mut out = Vec::new();
        Pong::CONSTRUCTOR_ID.serialize(&mut out);
        msg_id.serialize(&mut out);
        ping_id.serialize(&mut out);
        out
    }

    fn bad_server_salt(bad_msg_id: i64, new_salt: i64) -> Vec<u8> {
        let mut out = Vec::new();
        BadServerSalt::CONSTRUCTOR_ID.serialize(&mut out);
        bad_msg_id.serialize(&mut out);
        2i32.serialize(&mut out);
        48i32.serialize(&mut out);
        new_salt.serialize(&mut out);
        out
    }

    fn container(items: &[(i64, i32, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        MsgContainer::CONSTRUCTOR_ID.serialize(&mut out);
        (items.len() as i32).serialize(&mut out);
        for (msg_id, seq_no, body) in items {
            msg_id.serialize(&mut out);
            seq_no.serialize(&mut out);
            (body.len() as i32).serialize(&mut out);
            out.extend_from_slice(body);
        }
        out
    }

    #[test]
    fn acks_flush_exactly_at_threshold() {
        let sender = detached_sender();
        let inner = &sender.inner;

        for i in 0..9 {
            inner
                .process_message(1000 + i, 1, &unknown_object())
                .unwrap();
            assert!(inner.take_due_acks().is_none(), "no flush before the 10th");
        }

        inner.process_message(1009, 1, &unknown_object()).unwrap();
        let mut flushed = inner.take_due_acks().expect("10th message flushes");
        flushed.sort_unstable();
        assert_eq!(flushed, (1000..1010).collect::<Vec<i64>>());
        assert!(inner.pending_acks.lock().unwrap().is_empty());
        assert!(inner.take_due_acks().is_none());
    }

    #[tokio::test]
    async fn disconnect_drains_pending_acks() {
        let sender = detached_sender();
        for i in 0..3 {
            sender
                .inner
                .process_message(2000 + i, 1, &unknown_object())
                .unwrap();
        }
        assert!(sender.inner.take_due_acks().is_none(), "below threshold");
        sender.disconnect().await;
        assert!(
            sender.inner.pending_acks.lock().unwrap().is_empty(),
            "close must not leave acks pending"
        );
        assert!(sender.is_stopped());
    }

    #[test]
    fn even_seq_messages_are_not_acked() {
        let sender = detached_sender();
        sender.inner.process_message(50, 2, &pong(1, 2)).unwrap();
        assert!(sender.inner.pending_acks.lock().unwrap().is_empty());
    }

    #[test]
    fn duplicate_content_message_is_not_reprocessed() {
        let sender = detached_sender();
        let rx = register_waiter(&sender, 70);
        let body = rpc_result(70, &unknown_object());

        sender.inner.process_message(600, 1, &body).unwrap();
        drop(rx);
        // Same server msg id again: still pending an ack, must not dispatch.
        let rx2 = register_waiter(&sender, 70);
        sender.inner.process_message(600, 1, &body).unwrap();
        assert!(
            sender.inner.waiters.lock().unwrap().contains_key(&70),
            "duplicate delivery would have consumed the waiter"
        );
        drop(rx2);
        assert_eq!(sender.inner.pending_acks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn salt_rotation_updates_state_and_fans_out() {
        let store = Arc::new(MemoryStore::new());
        let sender = Sender::detached(store.clone(), Arc::new(Vec::new()), None);
        let inner = &sender.inner;

        let rx_a = register_waiter(&sender, 11);
        let rx_b = register_waiter(&sender, 12);

        inner
            .process_message(900, 3, &bad_server_salt(11, 0xDEADBEEF))
            .unwrap();

        assert_eq!(inner.session.lock().unwrap().salt(), 0xDEADBEEF);
        assert_eq!(store.load().unwrap().unwrap().salt, 0xDEADBEEF);
        assert!(matches!(rx_a.await.unwrap(), Reply::ConfigsChanged));
        assert!(matches!(rx_b.await.unwrap(), Reply::ConfigsChanged));
        assert!(inner.waiters.lock().unwrap().is_empty());

        // Subsequent sends stamp the rotated salt into the inner header.
        let header = inner.session.lock().unwrap().next_header(true);
        assert_eq!(header.salt, 0xDEADBEEF);
    }

    #[test]
    fn bad_server_salt_with_no_waiters_is_harmless() {
        let sender = detached_sender();
        sender
            .inner
            .process_message(901, 3, &bad_server_salt(99, 42))
            .unwrap();
        assert_eq!(sender.inner.session.lock().unwrap().salt(), 42);
    }

    #[tokio::test]
    async fn new_session_created_adopts_salt() {
        let store = Arc::new(MemoryStore::new());
        let sender = Sender::detached(store.clone(), Arc::new(Vec::new()), None);

        let mut body = Vec::new();
        NewSessionCreated::CONSTRUCTOR_ID.serialize(&mut body);
        5i64.serialize(&mut body);
        6i64.serialize(&mut body);
        777i64.serialize(&mut body);

        sender.inner.process_message(902, 1, &body).unwrap();
        assert_eq!(sender.inner.session.lock().unwrap().salt(), 777);
        assert_eq!(store.load().unwrap().unwrap().salt, 777);
    }

    #[tokio::test]
    async fn pong_routes_to_its_waiter() {
        let sender = detached_sender();
        let rx = register_waiter(&sender, 333);
        sender.inner.process_message(20, 0, &pong(333, 8)).unwrap();
        match rx.await.unwrap() {
            Reply::Ok(body) => {
                let decoded = Pong::from_bytes(&body).unwrap();
                assert_eq!(decoded.ping_id, 8);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn rpc_result_delivers_payload() {
        let sender = detached_sender();
        let rx = register_waiter(&sender, 555);
        let payload = unknown_object();
        sender
            .inner
            .process_message(30, 1, &rpc_result(555, &payload))
            .unwrap();
        match rx.await.unwrap() {
            Reply::Ok(body) => assert_eq!(body, payload),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn rpc_error_surfaces_parsed() {
        let sender = detached_sender();
        let rx = register_waiter(&sender, 556);
        sender
            .inner
            .process_message(31, 1, &rpc_result(556, &rpc_error(420, "FLOOD_WAIT_23")))
            .unwrap();
        match rx.await.unwrap() {
            Reply::Rpc(err) => {
                assert_eq!(err.code, 420);
                assert_eq!(err.name, "FLOOD_WAIT");
                assert_eq!(err.value, Some(23));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn gzip_of_gzip_unwraps_to_the_object() {
        let sender = detached_sender();
        let rx = register_waiter(&sender, 444);
        let twice_packed = gzip_packed(&gzip_packed(&pong(444, 9)));
        sender.inner.process_message(40, 0, &twice_packed).unwrap();
        match rx.await.unwrap() {
            Reply::Ok(body) => assert_eq!(Pong::from_bytes(&body).unwrap().ping_id, 9),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn gzipped_rpc_result_payload_is_unwrapped() {
        let sender = detached_sender();
        let rx = register_waiter(&sender, 557);
        let payload = unknown_object();
        sender
            .inner
            .process_message(41, 1, &rpc_result(557, &gzip_packed(&payload)))
            .unwrap();
        match rx.await.unwrap() {
            Reply::Ok(body) => assert_eq!(body, payload),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn container_elements_process_inline() {
        let sender = detached_sender();
        let rx_a = register_waiter(&sender, 601);
        let rx_b = register_waiter(&sender, 602);

        let body = container(&[
            (700, 1, rpc_result(601, &unknown_object())),
            (701, 1, rpc_result(602, &unknown_object())),
        ]);
        sender.inner.process_message(699, 0, &body).unwrap();

        assert!(matches!(rx_a.await.unwrap(), Reply::Ok(_)));
        assert!(matches!(rx_b.await.unwrap(), Reply::Ok(_)));
        // Both content elements are now pending acknowledgement.
        assert_eq!(sender.inner.pending_acks.lock().unwrap().len(), 2);
    }

    #[test]
    fn detailed_info_pends_the_answer() {
        let sender = detached_sender();

        let mut body = Vec::new();
        MsgNewDetailedInfo::CONSTRUCTOR_ID.serialize(&mut body);
        987i64.serialize(&mut body);
        64i32.serialize(&mut body);
        0i32.serialize(&mut body);
        sender.inner.process_message(50, 0, &body).unwrap();
        assert!(sender.inner.pending_acks.lock().unwrap().contains(&987));

        let mut body = Vec::new();
        MsgDetailedInfo::CONSTRUCTOR_ID.serialize(&mut body);
        11i64.serialize(&mut body);
        988i64.serialize(&mut body);
        64i32.serialize(&mut body);
        0i32.serialize(&mut body);
        sender.inner.process_message(51, 0, &body).unwrap();
        assert!(sender.inner.pending_acks.lock().unwrap().contains(&988));
    }

    #[tokio::test]
    async fn bad_msg_notification_flags_time_sync() {
        let sender = detached_sender();
        let rx = register_waiter(&sender, 808);

        let mut body = Vec::new();
        BadMsgNotification::CONSTRUCTOR_ID.serialize(&mut body);
        808i64.serialize(&mut body);
        1i32.serialize(&mut body);
        16i32.serialize(&mut body);
        sender.inner.process_message(60, 0, &body).unwrap();

        assert!(sender.inner.needs_time_sync.load(Ordering::Acquire));
        assert!(matches!(rx.await.unwrap(), Reply::BadMsg { code: 16 }));
    }

    #[test]
    fn unclaimed_objects_go_to_handlers_in_order() {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let calls = Arc::clone(&first_calls);
            Arc::new(move |_: &[u8]| {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            }) as ServerRequestHandler
        };
        let second = {
            let calls = Arc::clone(&second_calls);
            Arc::new(move |_: &[u8]| {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            }) as ServerRequestHandler
        };

        let sender = Sender::detached(
            Arc::new(MemoryStore::new()),
            Arc::new(vec![first, second]),
            None,
        );
        sender.inner.process_message(80, 0, &unknown_object()).unwrap();

        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0, "first claim wins");
    }

    #[test]
    fn watchdog_window_and_thresholds() {
        let mut watchdog = KeyWatchdog::default();
        assert_eq!(watchdog.record(1000), WatchdogVerdict::Continue);
        assert_eq!(watchdog.record(1005), WatchdogVerdict::Continue);
        assert_eq!(watchdog.record(1010), WatchdogVerdict::Continue);
        assert_eq!(watchdog.record(1015), WatchdogVerdict::Reconnect);

        // A quiet gap resets the burst.
        assert_eq!(watchdog.record(2000), WatchdogVerdict::Continue);
        assert_eq!(watchdog.count, 1);

        for i in 0..7 {
            let verdict = watchdog.record(2001 + i);
            assert_ne!(verdict, WatchdogVerdict::Fatal, "count {}", watchdog.count);
        }
        assert_eq!(watchdog.record(2010), WatchdogVerdict::Fatal);
    }

    #[tokio::test]
    async fn cancelled_waiter_discards_late_reply() {
        let sender = detached_sender();
        let rx = register_waiter(&sender, 909);
        {
            let _guard = WaiterGuard {
                inner: Arc::clone(&sender.inner),
                msg_id: 909,
            };
        } // cancelled before the reply arrives

        sender
            .inner
            .process_message(61, 1, &rpc_result(909, &unknown_object()))
            .unwrap();
        drop(rx);
        assert!(sender.inner.waiters.lock().unwrap().is_empty());
    }
}
