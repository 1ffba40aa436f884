//! # Request Server
//!
//! The listener half of a peer: accepts TCP connections, queues them on a
//! bounded channel, and hands them to a fixed pool of workers. Each worker
//! runs the per-connection envelope loop (read one envelope, decrypt,
//! authenticate the caller, dispatch to the handler registered for the
//! method, seal the response back) until the peer hangs up or an
//! undecryptable envelope arrives.
//!
//! ## Backpressure and Shutdown
//!
//! The connection queue has capacity `Q`; when it fills, the acceptor
//! suspends on `send`; that is the sole admission-control mechanism. Accepts run
//! under a ~2 second deadline so the quit signal is observed without
//! busy-waiting. On quit the listener closes, every worker drains its
//! current connection and exits, and a single done signal fires once all
//! workers have reported back. Connections still queued at that point are
//! dropped with the channel.
//!
//! ## Authentication
//!
//! Node callers are verified against the trust registry's copy of their
//! public key; user callers against the key stored in the ring at
//! registration time. The key material carried inside the envelope header is
//! never used as a verification root, only for encrypting the response back
//! to the caller.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rsa::RsaPrivateKey;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::chord::LocalNode;
use crate::clock;
use crate::crypto::{self, WirePublicKey};
use crate::envelope::{self, Sender};
use crate::identity::Node;
use crate::messages::{self, CallerType, Envelope, Method, Request, Response};
use crate::store::{self, BlobStore};
use crate::trust::TrustRegistry;

/// Accept deadline; bounds how long a pending quit signal can go unnoticed.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default connection-queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default worker count.
pub const DEFAULT_WORKERS: usize = 8;

/// Everything a handler may need: the peer's own state plus the
/// per-request authentication result and Lamport timestamp.
pub struct HandlerContext {
    pub data_path: PathBuf,
    pub local: Arc<LocalNode>,
    pub store: Arc<BlobStore>,
    pub trust: Arc<TrustRegistry>,
    pub self_key: Arc<RsaPrivateKey>,
    /// The authenticated user's public key, for user callers.
    pub user_key: Option<WirePublicKey>,
    /// Resource name from the request header.
    pub resource_name: String,
    /// Lamport timestamp assigned to this request.
    pub timestamp: u64,
}

/// A request handler. All failures are expressed as an error response;
/// handlers never tear down the connection.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, request: &Request) -> Response;
}

/// Method-code → handler map. Writes happen only during peer assembly;
/// workers take the read side per request.
pub struct HandlerRegistry {
    handlers: RwLock<std::collections::HashMap<u64, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn register(&self, method: Method, handler: Arc<dyn Handler>) {
        let mut handlers = self.handlers.write().expect("handler registry lock poisoned");
        handlers.insert(method.code(), handler);
    }

    pub fn get(&self, method: Method) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.read().expect("handler registry lock poisoned");
        handlers.get(&method.code()).cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Server construction parameters.
#[derive(Clone)]
pub struct ServerConfig {
    /// Advertised listen address; also the basis of the peer's identifier.
    pub addr: String,
    /// Directory holding blobs and key files.
    pub data_path: PathBuf,
    /// Capacity `Q` of the bounded connection queue.
    pub queue_capacity: usize,
    /// Number `W` of parallel workers.
    pub workers: usize,
}

/// The request server.
pub struct Server {
    config: ServerConfig,
    self_key: Arc<RsaPrivateKey>,
    local: Arc<LocalNode>,
    store: Arc<BlobStore>,
    trust: Arc<TrustRegistry>,
    handlers: HandlerRegistry,
}

impl Server {
    /// Assemble a server around an existing local node. The trust registry
    /// starts out holding the peer itself and, when given, its bootstrap
    /// peer.
    pub fn new(
        config: ServerConfig,
        self_key: Arc<RsaPrivateKey>,
        local: Arc<LocalNode>,
        bootstrap: Option<Node>,
    ) -> Arc<Self> {
        let store = Arc::new(BlobStore::new(config.data_path.clone()));
        let trust = Arc::new(TrustRegistry::new(local.node(), bootstrap));
        Arc::new(Self {
            config,
            self_key,
            local,
            store,
            trust,
            handlers: HandlerRegistry::new(),
        })
    }

    pub fn store(&self) -> Arc<BlobStore> {
        self.store.clone()
    }

    pub fn trust(&self) -> Arc<TrustRegistry> {
        self.trust.clone()
    }

    pub fn local(&self) -> Arc<LocalNode> {
        self.local.clone()
    }

    pub fn register(&self, method: Method, handler: Arc<dyn Handler>) {
        self.handlers.register(method, handler);
    }

    /// Serve `listener` until the quit signal fires, then drain workers and
    /// fire `done`. An accept failure that is not a deadline is fatal.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        quit: broadcast::Sender<()>,
        done: oneshot::Sender<()>,
    ) -> Result<()> {
        let (conn_tx, conn_rx) = mpsc::channel::<TcpStream>(self.config.queue_capacity);
        let conn_rx = Arc::new(Mutex::new(conn_rx));

        let mut workers = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let server = self.clone();
            let rx = conn_rx.clone();
            let quit_rx = quit.subscribe();
            workers.push(tokio::spawn(server.worker_loop(worker_id, rx, quit_rx)));
        }
        info!(
            addr = %self.config.addr,
            workers = self.config.workers,
            queue = self.config.queue_capacity,
            "server listening"
        );

        let mut quit_rx = quit.subscribe();
        let result = loop {
            tokio::select! {
                _ = quit_rx.recv() => {
                    info!("quit signal received, draining workers");
                    break Ok(());
                }
                accepted = tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept()) => {
                    match accepted {
                        // deadline reached; loop around to observe quit
                        Err(_) => continue,
                        Ok(Ok((stream, peer))) => {
                            debug!(peer = %peer, "connection accepted");
                            // a full queue suspends the acceptor here
                            if conn_tx.send(stream).await.is_err() {
                                break Ok(());
                            }
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "listener failed");
                            break Err(anyhow::Error::from(e).context("listener failed"));
                        }
                    }
                }
            }
        };

        // close the listener and the queue; workers drain their current
        // connection and observe either the quit signal or the closed queue
        drop(listener);
        drop(conn_tx);
        for worker in workers {
            let _ = worker.await;
        }
        info!("all workers done");
        let _ = done.send(());
        result
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        conn_rx: Arc<Mutex<mpsc::Receiver<TcpStream>>>,
        mut quit: broadcast::Receiver<()>,
    ) {
        debug!(worker = worker_id, "worker started");
        loop {
            let stream = tokio::select! {
                _ = quit.recv() => break,
                stream = async { conn_rx.lock().await.recv().await } => {
                    match stream {
                        Some(stream) => stream,
                        None => break,
                    }
                }
            };
            self.handle_connection(stream).await;
        }
        debug!(worker = worker_id, "worker done");
    }

    /// The per-connection envelope loop. Responses are strictly ordered with
    /// requests on a connection; the loop ends when the peer closes, a frame
    /// fails to parse, or an envelope cannot be decrypted.
    async fn handle_connection(&self, mut stream: TcpStream) {
        loop {
            let frame = match messages::read_frame(&mut stream).await {
                Ok(frame) => frame,
                // peer hung up (or sent garbage framing)
                Err(_) => return,
            };
            let received: Envelope = match messages::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(error = %e, "closing connection on malformed envelope");
                    return;
                }
            };
            let payload = match envelope::open(&received, &self.self_key) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(error = %e, "closing connection on undecryptable envelope");
                    return;
                }
            };
            let request: Request = match messages::decode(&payload) {
                Ok(request) => request,
                Err(e) => {
                    debug!(error = %e, "malformed request inside envelope");
                    if self.respond(&mut stream, &received, Response::error()).await.is_err() {
                        return;
                    }
                    continue;
                }
            };

            let user_key = match self.authenticate(&received, &payload, &request).await {
                Ok(user_key) => user_key,
                Err(e) => {
                    warn!(
                        method = %request.method,
                        from = received.header.from.short(),
                        error = %e,
                        "authentication failed"
                    );
                    if self.respond(&mut stream, &received, Response::error()).await.is_err() {
                        return;
                    }
                    continue;
                }
            };

            let Some(handler) = self.handlers.get(request.method) else {
                warn!(method = %request.method, "no handler registered");
                if self.respond(&mut stream, &received, Response::error()).await.is_err() {
                    return;
                }
                continue;
            };

            let timestamp = clock::bump(request.header.clock);
            let ctx = HandlerContext {
                data_path: self.config.data_path.clone(),
                local: self.local.clone(),
                store: self.store.clone(),
                trust: self.trust.clone(),
                self_key: self.self_key.clone(),
                user_key,
                resource_name: request.header.resource_name.clone(),
                timestamp,
            };
            debug!(
                method = %request.method,
                from = request.header.from.short(),
                clock = timestamp,
                "dispatching request"
            );
            let mut response = handler.handle(&ctx, &request).await;
            response.header.clock = timestamp;

            if self.respond(&mut stream, &received, response).await.is_err() {
                return;
            }
        }
    }

    /// Verify the envelope against a key we already trust, per caller type.
    /// Registration methods are exempt: they exist to introduce the key.
    async fn authenticate(
        &self,
        received: &Envelope,
        payload: &[u8],
        request: &Request,
    ) -> Result<Option<WirePublicKey>> {
        match received.header.caller {
            CallerType::Node => {
                if request.method == Method::NodeRegistration {
                    return Ok(None);
                }
                let entry = self.trust.get(&received.header.from)?;
                let key = entry
                    .public_key
                    .to_rsa()
                    .context("trusted node has an unusable key")?;
                envelope::verify_sender(received, payload, &key)?;
                Ok(None)
            }
            CallerType::User => {
                if request.method == Method::UserRegistration {
                    return Ok(Some(received.header.public_key.clone()));
                }
                let pem = store::fetch_public_key(&self.local, &self.store, received.header.from)
                    .await
                    .context("user key unavailable")?;
                let pem = String::from_utf8(pem).context("stored user key is not PEM text")?;
                let key = crypto::public_key_from_pem(&pem)?;
                envelope::verify_sender(received, payload, &key)?;
                Ok(Some(WirePublicKey::from(&key)))
            }
        }
    }

    /// Seal a response to the caller's envelope key and write it as one
    /// frame. An unusable caller key or a dead socket ends the connection.
    async fn respond(
        &self,
        stream: &mut TcpStream,
        received: &Envelope,
        response: Response,
    ) -> Result<()> {
        let Ok(caller_key) = received.header.public_key.to_rsa() else {
            bail!("cannot encrypt response: caller key unusable");
        };
        let payload = messages::encode(&response)?;
        let sender = Sender {
            caller: CallerType::Node,
            from: self.local.id(),
            from_addr: self.config.addr.clone(),
        };
        let sealed = envelope::seal(&payload, &sender, &caller_key, &self.self_key)?;
        let frame = messages::encode(&sealed)?;
        messages::write_frame(stream, &frame).await?;
        Ok(())
    }
}
