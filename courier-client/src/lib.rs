//! # courier-client
//!
//! Connection management on top of the MTProto codec: the framed transport,
//! session persistence, the per-connection RPC multiplexer, reconnect and
//! keepalive supervision, and the multi-DC pool of exported senders.
//!
//! ```rust,no_run
//! use courier_client::{Client, Config};
//!
//! # async fn run() -> Result<(), courier_client::InvocationError> {
//! let client = Client::connect(Config {
//!     app_id: 12345,
//!     ..Default::default()
//! })
//! .await?;
//!
//! let rtt = client.ping().await?;
//! println!("server answered in {rtt:?}");
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

pub mod dc;
mod errors;
mod pool;
mod sender;
mod session;
mod socks5;
mod string_session;
mod transport;

pub use errors::{InvocationError, RpcError};
pub use pool::{partition, DISCONNECT_EXPORTED_AFTER};
pub use sender::{ClockSource, FloodHandler, NoExternalClock, Sender, ServerRequestHandler};
pub use session::{FileStore, MemoryStore, Session, SessionStore};
pub use socks5::Socks5Config;
pub use string_session::StringSession;
pub use transport::{FrameReader, FrameWriter, Mode, Transport, TransportError};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use courier_tl::api::{auth, GetConfig, InitConnection, InvokeWithLayer};
use courier_tl::LAYER;
use sender::SenderConfig;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

/// Client construction options.
#[derive(Clone)]
pub struct Config {
    /// Application id sent in `initConnection` and bound to the session.
    pub app_id: i32,
    /// Initial DC when no session exists; defaults by mode when `None`.
    pub data_center: Option<i32>,
    /// Framing mode for every connection.
    pub transport_mode: Mode,
    /// Keep the session only in memory, never on disk.
    pub memory_session: bool,
    /// Import the session from its string form instead of the store.
    pub string_session: Option<String>,
    /// Session file used when `memory_session` is off.
    pub session_file: PathBuf,
    /// Route every connection through this SOCKS5 proxy.
    pub proxy: Option<Socks5Config>,
    /// Prefer IPv6 DC addresses.
    pub force_ipv6: bool,
    /// Connect to the test cluster instead of production.
    pub test_mode: bool,
    /// Skip registering the update forwarder.
    pub no_updates: bool,
    /// Called on `FLOOD_WAIT_*`; returning `true` resends the request.
    pub flood_handler: Option<FloodHandler>,
    /// External time reference for clock-skew detection.
    pub clock: Arc<dyn ClockSource>,
    /// Server-request handlers, offered inbound objects in order.
    pub handlers: Vec<ServerRequestHandler>,
    /// Device descriptor for `initConnection`.
    pub device_model: String,
    /// System descriptor for `initConnection`.
    pub system_version: String,
    /// Application version for `initConnection`.
    pub app_version: String,
    /// Language code for `initConnection`.
    pub lang_code: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: 0,
            data_center: None,
            transport_mode: Mode::Abridged,
            memory_session: false,
            string_session: None,
            session_file: PathBuf::from("courier.session"),
            proxy: None,
            force_ipv6: false,
            test_mode: false,
            no_updates: false,
            flood_handler: None,
            clock: Arc::new(NoExternalClock),
            handlers: Vec::new(),
            device_model: "Linux".to_string(),
            system_version: "1.0".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            lang_code: "en".to_string(),
        }
    }
}

/// Raw server objects the multiplexer did not absorb and no handler claimed
/// first. Decoding them belongs to the API layer above this crate.
pub struct UpdateStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl UpdateStream {
    /// The next raw object, or `None` once the client disconnects.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

struct ClientInner {
    sender: AsyncMutex<Sender>,
    dc_id: Mutex<i32>,
    app_id: i32,
    mode: Mode,
    socks5: Option<Socks5Config>,
    force_ipv6: bool,
    test_mode: bool,
    device_model: String,
    system_version: String,
    app_version: String,
    lang_code: String,
    handlers: Arc<Vec<ServerRequestHandler>>,
    flood_handler: Option<FloodHandler>,
    clock: Arc<dyn ClockSource>,
    store: Arc<dyn SessionStore>,
    pool: pool::SenderPool,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    stopped: AtomicBool,
    shutdown: Notify,
}

/// A connected client: one supervised home connection plus the exported
/// sender pool. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect following the stored session, or run a fresh key exchange
    /// when none exists, then announce ourselves with
    /// `invokeWithLayer(initConnection(help.getConfig))` and refresh the DC
    /// address table from the reply.
    pub async fn connect(config: Config) -> Result<Self, InvocationError> {
        let store: Arc<dyn SessionStore> = if config.memory_session {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(FileStore::new(config.session_file.clone()))
        };

        // A string session wins over whatever the store holds.
        let loaded = match &config.string_session {
            Some(encoded) => {
                let imported = StringSession::decode(encoded)
                    .map_err(InvocationError::Io)?
                    .into_session();
                log::debug!("[courier] imported session from string");
                store.save(&imported)?;
                Some(imported)
            }
            None => store.load()?,
        };

        let (addr, auth_state, dc_id) = match &loaded {
            Some(session) => {
                let dc_id = dc::dc_for_addr(&session.host, config.test_mode)
                    .unwrap_or_else(|| config.data_center.unwrap_or(dc::DEFAULT_DC));
                (
                    session.host.clone(),
                    Some((session.auth_key, session.salt)),
                    dc_id,
                )
            }
            None => {
                let dc_id = config.data_center.unwrap_or(if config.test_mode {
                    dc::DEFAULT_TEST_DC
                } else {
                    dc::DEFAULT_DC
                });
                let addr = dc::addr_for(dc_id, config.test_mode, config.force_ipv6)
                    .ok_or_else(|| {
                        InvocationError::Deserialize(format!("no address known for DC{dc_id}"))
                    })?;
                (addr, None, dc_id)
            }
        };

        // Handler list is fixed for the client's lifetime; exported senders
        // share it as the same immutable snapshot.
        let mut handlers = config.handlers.clone();
        let updates_rx = if config.no_updates {
            None
        } else {
            let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
            handlers.push(Arc::new(move |body: &[u8]| tx.send(body.to_vec()).is_ok()));
            Some(rx)
        };
        let handlers = Arc::new(handlers);

        let sender = Sender::connect(SenderConfig {
            addr,
            app_id: config.app_id,
            mode: config.transport_mode,
            auth: auth_state,
            socks5: config.proxy.clone(),
            handlers: Arc::clone(&handlers),
            flood_handler: config.flood_handler.clone(),
            clock: Arc::clone(&config.clock),
            store: Arc::clone(&store),
        })
        .await?;

        let inner = Arc::new(ClientInner {
            sender: AsyncMutex::new(sender),
            dc_id: Mutex::new(dc_id),
            app_id: config.app_id,
            mode: config.transport_mode,
            socks5: config.proxy,
            force_ipv6: config.force_ipv6,
            test_mode: config.test_mode,
            device_model: config.device_model,
            system_version: config.system_version,
            app_version: config.app_version,
            lang_code: config.lang_code,
            handlers,
            flood_handler: config.flood_handler,
            clock: config.clock,
            store,
            pool: pool::SenderPool::new(),
            updates_rx: Mutex::new(updates_rx),
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        let client = Self { inner };
        client.init_connection(&client.home_sender().await).await?;
        tokio::spawn(run_cleaner(Arc::clone(&client.inner)));
        Ok(client)
    }

    /// Send a typed request on the home connection. `*_MIGRATE_X` errors
    /// move the client to the named DC and retry once.
    pub async fn invoke<R: courier_tl::RemoteCall>(
        &self,
        request: &R,
    ) -> Result<R::Return, InvocationError> {
        let sender = self.home_sender().await;
        match sender.invoke(request).await {
            Err(InvocationError::Rpc(err)) => {
                if let Some(target) = err.migrate_dc() {
                    log::info!("[courier] {} - migrating to DC{target}", err.name);
                    self.migrate_to(target).await?;
                    let sender = self.home_sender().await;
                    sender.invoke(request).await
                } else {
                    Err(InvocationError::Rpc(err))
                }
            }
            other => other,
        }
    }

    /// Round-trip time of a tracked ping on the home connection.
    pub async fn ping(&self) -> Result<Duration, InvocationError> {
        self.home_sender().await.ping().await
    }

    /// The DC the home connection is bound to.
    pub fn dc_id(&self) -> i32 {
        *self.inner.dc_id.lock().unwrap()
    }

    /// Raw unclaimed server objects. `None` when `no_updates` was set;
    /// subsequent calls also return `None` (the stream can be taken once).
    pub fn updates(&self) -> Option<UpdateStream> {
        self.inner
            .updates_rx
            .lock()
            .unwrap()
            .take()
            .map(|rx| UpdateStream { rx })
    }

    /// Persist the current session state through the configured store.
    pub async fn save_session(&self) -> Result<(), InvocationError> {
        let snapshot = self.home_sender().await.session_snapshot();
        self.inner.store.save(&snapshot)?;
        Ok(())
    }

    /// The current session state plus the DC it belongs to.
    pub async fn export_auth(&self) -> (Session, i32) {
        let snapshot = self.home_sender().await.session_snapshot();
        (snapshot, self.dc_id())
    }

    /// The current session in its portable string form.
    pub async fn export_string_session(&self) -> String {
        let (session, dc_id) = self.export_auth().await;
        StringSession::from_session(&session, dc_id).encode()
    }

    // ── Exported senders ───────────────────────────────────────────────────

    /// Borrow up to `count` senders bound to `dc_id`: cached ones first, the
    /// rest freshly exported. Callers issue their own RPCs over them.
    pub async fn borrow_senders(
        &self,
        dc_id: i32,
        count: usize,
    ) -> Result<Vec<Sender>, InvocationError> {
        let mut senders = self.inner.pool.cached_for(dc_id).await;
        senders.truncate(count);
        while senders.len() < count {
            let sender = self.export_new_sender(dc_id).await?;
            self.inner.pool.insert(dc_id, sender.clone()).await;
            senders.push(sender);
        }
        Ok(senders)
    }

    /// Build a fresh authenticated connection to `dc_id`. For a foreign DC
    /// the parent's authorization is exported and imported as the new
    /// sender's first request.
    pub async fn export_new_sender(&self, dc_id: i32) -> Result<Sender, InvocationError> {
        let addr = dc::addr_for(dc_id, self.inner.test_mode, self.inner.force_ipv6)
            .ok_or_else(|| {
                InvocationError::Deserialize(format!("no address known for DC{dc_id}"))
            })?;
        log::debug!("[courier] creating exported sender for DC{dc_id}");

        let sender = Sender::connect(SenderConfig {
            addr,
            app_id: self.inner.app_id,
            mode: self.inner.mode,
            auth: None,
            socks5: self.inner.socks5.clone(),
            handlers: Arc::clone(&self.inner.handlers),
            flood_handler: self.inner.flood_handler.clone(),
            clock: Arc::clone(&self.inner.clock),
            // Exported senders never persist; their keys die with them.
            store: Arc::new(MemoryStore::new()),
        })
        .await?;

        if dc_id != self.dc_id() {
            log::info!("[courier] exporting authorization for DC{dc_id}");
            let exported = self
                .invoke(&auth::ExportAuthorization { dc_id })
                .await?;
            let request = InvokeWithLayer {
                layer: LAYER,
                query: self.init_connection_wrapper(auth::ImportAuthorization {
                    id: exported.id,
                    bytes: exported.bytes,
                }),
            };
            sender.invoke(&request).await?;
        } else {
            self.init_connection(&sender).await?;
        }

        Ok(sender)
    }

    /// Stop the cleaner, terminate every exported sender, then the home
    /// connection. Shutdown flows parent to children.
    pub async fn disconnect(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.notify_waiters();
        for sender in self.inner.pool.drain().await {
            sender.disconnect().await;
        }
        self.home_sender().await.disconnect().await;
        log::info!("[courier] client disconnected");
    }

    // ── Internals ──────────────────────────────────────────────────────────

    async fn home_sender(&self) -> Sender {
        self.inner.sender.lock().await.clone()
    }

    fn init_connection_wrapper<Q>(&self, query: Q) -> InitConnection<Q> {
        InitConnection {
            api_id: self.inner.app_id,
            device_model: self.inner.device_model.clone(),
            system_version: self.inner.system_version.clone(),
            app_version: self.inner.app_version.clone(),
            system_lang_code: self.inner.lang_code.clone(),
            lang_pack: String::new(),
            lang_code: self.inner.lang_code.clone(),
            query,
        }
    }

    async fn init_connection(&self, sender: &Sender) -> Result<(), InvocationError> {
        let request = InvokeWithLayer {
            layer: LAYER,
            query: self.init_connection_wrapper(GetConfig {}),
        };
        let config = sender.invoke(&request).await?;
        dc::update_from_config(&config.dc_options, self.inner.test_mode);
        log::info!(
            "[courier] initConnection done ({} DC options, this_dc={})",
            config.dc_options.len(),
            config.this_dc
        );
        Ok(())
    }

    /// Move the home connection to `target_dc`: the old session is deleted,
    /// a new sender (and key) is built against the target, and the session
    /// is persisted there.
    async fn migrate_to(&self, target_dc: i32) -> Result<(), InvocationError> {
        let addr = dc::addr_for(target_dc, self.inner.test_mode, self.inner.force_ipv6)
            .ok_or_else(|| {
                InvocationError::Deserialize(format!("no address known for DC{target_dc}"))
            })?;

        if let Err(e) = self.inner.store.delete() {
            log::warn!("[courier] deleting old session failed: {e}");
        }

        let sender = Sender::connect(SenderConfig {
            addr,
            app_id: self.inner.app_id,
            mode: self.inner.mode,
            auth: None,
            socks5: self.inner.socks5.clone(),
            handlers: Arc::clone(&self.inner.handlers),
            flood_handler: self.inner.flood_handler.clone(),
            clock: Arc::clone(&self.inner.clock),
            store: Arc::clone(&self.inner.store),
        })
        .await?;
        self.init_connection(&sender).await?;

        let previous = {
            let mut guard = self.inner.sender.lock().await;
            std::mem::replace(&mut *guard, sender)
        };
        *self.inner.dc_id.lock().unwrap() = target_dc;
        previous.disconnect().await;

        log::info!("[courier] now on DC{target_dc}");
        Ok(())
    }
}

/// Walks the exported-sender cache on the TTL period and terminates entries
/// that outlived it.
async fn run_cleaner(inner: Arc<ClientInner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => return,
            _ = tokio::time::sleep(DISCONNECT_EXPORTED_AFTER) => {}
        }
        if inner.stopped.load(Ordering::Acquire) {
            return;
        }
        let expired = inner.pool.sweep(Instant::now()).await;
        if !expired.is_empty() {
            log::debug!("[courier] terminating {} expired exported senders", expired.len());
        }
        for sender in expired {
            sender.disconnect().await;
        }
    }
}
