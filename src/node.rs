//! # High-Level Peer API
//!
//! This module provides the main entry point for running a peer. A [`Peer`]
//! combines the underlying components (key material, blob store, request
//! server, and the local Chord node) into a single unified interface.
//!
//! ## Quick Start
//!
//! ```ignore
//! // First peer of a new ring
//! let peer = Peer::start(PeerConfig::new("127.0.0.1:3000", "./data-a")).await?;
//!
//! // Second peer joins through the first
//! let mut config = PeerConfig::new("127.0.0.1:3001", "./data-b");
//! config.bootstrap = Some(peer.node());
//! let second = Peer::start(config).await?;
//!
//! // ...
//! peer.shutdown().await;
//! ```
//!
//! ## Startup Sequence
//!
//! 1. Load or generate the PEM keypair in the data directory.
//! 2. Bind the listener; the bound address becomes the peer's identity.
//! 3. Register every method handler and start serving.
//! 4. When a bootstrap peer is known: register with it (NodeRegistration),
//!    introduce ourselves to the peers it vouched for (NodeTrust), and join
//!    the ring.
//! 5. Start the stabilize task, and optionally a periodic self-lookup probe.
//!
//! Shutdown broadcasts one quit signal; the server drains its workers, the
//! stabilize task finishes its round, and a single done signal reports full
//! teardown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::chord::{
    FingerTableHandler, GetPredecessorHandler, LocalNode, SetPredecessorHandler,
    SuccessorHandler, STABILIZE_INTERVAL,
};
use crate::crypto;
use crate::identity::{Identifier, Node};
use crate::messages::{self, CallerType, Header, Method, RegistrationGrant, Request};
use crate::server::{Server, ServerConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};
use crate::store::{
    DeleteFileHandler, GetFileHandler, GetPublicKeyHandler, PostFileHandler,
    PostPublicKeyHandler,
};
use crate::transport::Transport;
use crate::trust::{NodeRegistrationHandler, NodeTrustHandler, UserRegistrationHandler};

/// Period of the optional self-lookup probe.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Peer construction parameters.
#[derive(Clone)]
pub struct PeerConfig {
    /// Address to bind and advertise. A port of 0 binds an ephemeral port;
    /// the identity is derived from the resolved address.
    pub addr: String,
    /// Data directory: key PEMs and one file per blob.
    pub data_path: PathBuf,
    /// Known peer to register with and join through.
    pub bootstrap: Option<Node>,
    /// Connection-queue capacity.
    pub queue_capacity: usize,
    /// Worker count.
    pub workers: usize,
    /// Stabilization period.
    pub stabilize_interval: Duration,
    /// Run the periodic self-lookup probe.
    pub probe: bool,
}

impl PeerConfig {
    pub fn new(addr: impl Into<String>, data_path: impl Into<PathBuf>) -> Self {
        Self {
            addr: addr.into(),
            data_path: data_path.into(),
            bootstrap: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            stabilize_interval: STABILIZE_INTERVAL,
            probe: false,
        }
    }
}

/// A running peer.
pub struct Peer {
    local: Arc<LocalNode>,
    server: Arc<Server>,
    quit: broadcast::Sender<()>,
    done: oneshot::Receiver<()>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    server_task: tokio::task::JoinHandle<Result<()>>,
}

impl Peer {
    /// Bring a peer up: keys, listener, handlers, registration, join, and
    /// the background tasks.
    pub async fn start(config: PeerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_path)
            .await
            .with_context(|| format!("failed to create {}", config.data_path.display()))?;
        let self_key = Arc::new(crypto::load_or_generate_keypair(&config.data_path).await?);

        // bind before deriving the identity so an ephemeral port resolves
        let listener = TcpListener::bind(&config.addr)
            .await
            .with_context(|| format!("failed to bind {}", config.addr))?;
        let addr = listener
            .local_addr()
            .context("listener has no local address")?
            .to_string();

        let local = Arc::new(LocalNode::new(&addr, self_key.clone()));
        let server = Server::new(
            ServerConfig {
                addr: addr.clone(),
                data_path: config.data_path.clone(),
                queue_capacity: config.queue_capacity,
                workers: config.workers,
            },
            self_key.clone(),
            local.clone(),
            config.bootstrap.clone(),
        );
        register_handlers(&server);

        let (quit, _) = broadcast::channel(1);
        let (done_tx, done_rx) = oneshot::channel();
        let server_task = tokio::spawn(server.clone().serve(listener, quit.clone(), done_tx));

        if let Some(bootstrap) = config.bootstrap.clone() {
            if let Err(e) = register_with_bootstrap(&local, &server, &bootstrap).await {
                warn!(error = %e, peer = %bootstrap, "bootstrap registration failed");
            }
            if let Err(e) = local.join(&bootstrap).await {
                // recoverable: stabilization keeps trying to close the ring
                warn!(error = %e, peer = %bootstrap, "initial join failed");
            }
        }

        let mut tasks = vec![local.spawn_stabilize(config.stabilize_interval, quit.subscribe())];
        if config.probe {
            tasks.push(spawn_probe(local.clone(), quit.subscribe()));
        }

        info!(node = %local.node(), "peer started");
        Ok(Self {
            local,
            server,
            quit,
            done: done_rx,
            tasks,
            server_task,
        })
    }

    /// This peer as a value object, for bootstrapping others.
    pub fn node(&self) -> Node {
        self.local.node()
    }

    pub fn id(&self) -> Identifier {
        self.local.id()
    }

    /// The resolved listen address.
    pub fn addr(&self) -> String {
        self.local.node().addr
    }

    pub fn local(&self) -> Arc<LocalNode> {
        self.local.clone()
    }

    pub fn server(&self) -> Arc<Server> {
        self.server.clone()
    }

    /// Signal quit and wait for the server's done plus every background
    /// task.
    pub async fn shutdown(self) {
        let _ = self.quit.send(());
        let _ = self.done.await;
        for task in self.tasks {
            let _ = task.await;
        }
        match self.server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "server exited with error"),
            Err(e) => warn!(error = %e, "server task panicked"),
        }
        info!("peer shut down");
    }
}

/// Wire every method to its handler.
fn register_handlers(server: &Arc<Server>) {
    server.register(Method::GetFile, Arc::new(GetFileHandler));
    server.register(Method::PostFile, Arc::new(PostFileHandler));
    server.register(Method::DeleteFile, Arc::new(DeleteFileHandler));
    server.register(Method::GetSuccessor, Arc::new(SuccessorHandler));
    server.register(Method::SetPredecessor, Arc::new(SetPredecessorHandler));
    server.register(Method::GetPredecessor, Arc::new(GetPredecessorHandler));
    server.register(Method::GetFingerTable, Arc::new(FingerTableHandler));
    server.register(Method::UserRegistration, Arc::new(UserRegistrationHandler));
    server.register(Method::NodeRegistration, Arc::new(NodeRegistrationHandler));
    server.register(Method::NodeTrust, Arc::new(NodeTrustHandler));
    server.register(Method::GetPublicKey, Arc::new(GetPublicKeyHandler));
    server.register(Method::PostPublicKey, Arc::new(PostPublicKeyHandler));
}

/// Register with the bootstrap peer and propagate the granted trust: every
/// node the bootstrap vouched for learns about us through NodeTrust, and we
/// record each of them locally.
async fn register_with_bootstrap(
    local: &Arc<LocalNode>,
    server: &Arc<Server>,
    bootstrap: &Node,
) -> Result<()> {
    let node = local.node();
    let request = Request {
        header: Header {
            from: node.id,
            from_addr: node.addr.clone(),
            caller: CallerType::Node,
            public_key: node.public_key.clone(),
            clock: crate::clock::get(),
            ..Header::default()
        },
        method: Method::NodeRegistration,
        data: Vec::new(),
    };
    let response = node_round_trip(local, bootstrap, &request).await?;
    if !response.is_success() {
        anyhow::bail!("bootstrap peer declined registration");
    }
    let grant: RegistrationGrant =
        messages::decode(&response.data).context("failed to decode registration grant")?;
    info!(
        peer = %bootstrap,
        vouched = grant.nodes.len(),
        "registered with bootstrap peer"
    );

    let trust = server.trust();
    for peer in &grant.nodes {
        if peer.id == node.id {
            continue;
        }
        trust.add(peer.clone());
        if peer.id == bootstrap.id {
            continue;
        }
        // introduce ourselves with the bootstrap peer's voucher
        let introduction = Request {
            header: Header {
                from: node.id,
                from_addr: node.addr.clone(),
                caller: CallerType::Node,
                public_key: node.public_key.clone(),
                signed_by: grant.signed_by,
                signature: grant.signature.clone(),
                clock: crate::clock::get(),
                ..Header::default()
            },
            method: Method::NodeTrust,
            data: Vec::new(),
        };
        match node_round_trip(local, peer, &introduction).await {
            Ok(response) if response.is_success() => {
                debug!(peer = %peer, "trust introduction accepted");
            }
            Ok(_) => warn!(peer = %peer, "trust introduction declined"),
            Err(e) => warn!(peer = %peer, error = %e, "trust introduction failed"),
        }
    }
    Ok(())
}

async fn node_round_trip(
    local: &Arc<LocalNode>,
    target: &Node,
    request: &Request,
) -> Result<crate::messages::Response> {
    let peer_key = target
        .public_key
        .to_rsa()
        .context("target peer has an unusable public key")?;
    let transport = Transport::dial(
        &target.addr,
        CallerType::Node,
        local.id(),
        local.node().addr,
        peer_key,
        local.self_key(),
    )
    .await?;
    transport.round_trip(request).await
}

/// Periodic self-test: look up a fixed key and log which node owns it.
fn spawn_probe(
    local: Arc<LocalNode>,
    mut quit: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let key = Identifier::hash(b"hello");
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = quit.recv() => return,
                _ = ticker.tick() => {
                    match local.find_successor(key).await {
                        Ok(owner) => info!(key = key.short(), owner = %owner, "probe lookup"),
                        Err(e) => warn!(error = %e, "probe lookup failed"),
                    }
                }
            }
        }
    })
}
