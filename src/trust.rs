//! # Trust Registry
//!
//! The set of peer identities this node accepts signed traffic from. A peer
//! always trusts itself and its bootstrap peer; everything else arrives
//! through the two introduction flows:
//!
//! - **NodeRegistration**: a new peer presents its public key; the registrar
//!   signs that key, adds the peer, and returns the signature together with
//!   a snapshot of every peer it already trusts.
//! - **NodeTrust**: a peer presents a key plus a signature produced by some
//!   *already trusted* signer. The signature is verified against the
//!   signer's registry entry (never against key material the caller
//!   carried itself) and on success the introduced peer is added.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::crypto;
use crate::identity::{Identifier, Node};
use crate::messages::{self, RegistrationGrant, Request, Response};
use crate::server::{Handler, HandlerContext};

/// Error type for registry lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustError {
    /// The identifier has no registry entry.
    NotTrusted(Identifier),
}

impl std::fmt::Display for TrustError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustError::NotTrusted(id) => write!(f, "node {} is not trusted", id.short()),
        }
    }
}

impl std::error::Error for TrustError {}

/// Identifier → node map behind a read/write lock. Reads dominate: every
/// authenticated node request performs one lookup.
pub struct TrustRegistry {
    nodes: RwLock<HashMap<Identifier, Node>>,
}

impl TrustRegistry {
    /// A registry seeded with ourselves and, when known, the bootstrap
    /// peer.
    pub fn new(own: Node, bootstrap: Option<Node>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(own.id, own);
        if let Some(peer) = bootstrap {
            nodes.insert(peer.id, peer);
        }
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Insert `node`; inserting an already-present identifier is a no-op.
    pub fn add(&self, node: Node) {
        let mut nodes = self.nodes.write().expect("trust registry lock poisoned");
        nodes.entry(node.id).or_insert(node);
    }

    /// Whether `id` has an entry.
    pub fn contains(&self, id: &Identifier) -> bool {
        let nodes = self.nodes.read().expect("trust registry lock poisoned");
        nodes.contains_key(id)
    }

    /// Look up the node registered under `id`.
    pub fn get(&self, id: &Identifier) -> Result<Node, TrustError> {
        let nodes = self.nodes.read().expect("trust registry lock poisoned");
        nodes.get(id).cloned().ok_or(TrustError::NotTrusted(*id))
    }

    /// Snapshot copy of every trusted node.
    pub fn all(&self) -> Vec<Node> {
        let nodes = self.nodes.read().expect("trust registry lock poisoned");
        nodes.values().cloned().collect()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Handles NodeRegistration: first contact from a new peer.
pub struct NodeRegistrationHandler;

#[async_trait]
impl Handler for NodeRegistrationHandler {
    async fn handle(&self, ctx: &HandlerContext, request: &Request) -> Response {
        // a second registration for a known identity is rejected rather
        // than silently overwriting the stored key
        if ctx.trust.contains(&request.header.from) {
            warn!(
                from = request.header.from.short(),
                "rejecting re-registration of known node"
            );
            return Response::error();
        }

        let node = Node {
            id: request.header.from,
            addr: request.header.from_addr.clone(),
            public_key: request.header.public_key.clone(),
        };
        info!(node = %node, "registering node");
        ctx.trust.add(node);

        let signature = crypto::sign(&ctx.self_key, &request.header.public_key.canonical_bytes());
        let grant = RegistrationGrant {
            signature,
            signed_by: ctx.local.id(),
            nodes: ctx.trust.all(),
        };
        match messages::encode(&grant) {
            Ok(body) => Response::success(body),
            Err(e) => {
                warn!(error = %e, "failed to encode registration grant");
                Response::error()
            }
        }
    }
}

/// Handles NodeTrust: a peer introduces itself with a voucher from a signer
/// we already trust.
pub struct NodeTrustHandler;

#[async_trait]
impl Handler for NodeTrustHandler {
    async fn handle(&self, ctx: &HandlerContext, request: &Request) -> Response {
        let signer = match ctx.trust.get(&request.header.signed_by) {
            Ok(signer) => signer,
            Err(e) => {
                warn!(error = %e, "trust introduction from unknown signer");
                return Response::error();
            }
        };
        let signer_key = match signer.public_key.to_rsa() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, signer = %signer, "signer key unusable");
                return Response::error();
            }
        };
        if let Err(e) = crypto::verify(
            &signer_key,
            &request.header.signature,
            &request.header.public_key.canonical_bytes(),
        ) {
            warn!(error = %e, signer = %signer, "trust introduction signature invalid");
            return Response::error();
        }

        let node = Node {
            id: request.header.from,
            addr: request.header.from_addr.clone(),
            public_key: request.header.public_key.clone(),
        };
        info!(node = %node, signer = %signer, "trusting introduced node");
        ctx.trust.add(node);

        let signature = crypto::sign(&ctx.self_key, &request.header.public_key.canonical_bytes());
        let grant = RegistrationGrant {
            signature,
            signed_by: ctx.local.id(),
            nodes: ctx.trust.all(),
        };
        match messages::encode(&grant) {
            Ok(body) => Response::success(body),
            Err(e) => {
                warn!(error = %e, "failed to encode trust grant");
                Response::error()
            }
        }
    }
}

/// Handles UserRegistration: store the user's PEM public key on the peer
/// owning `SHA1(canonical_encoding(key))` so any node can later fetch it to
/// authenticate the user's requests.
pub struct UserRegistrationHandler;

#[async_trait]
impl Handler for UserRegistrationHandler {
    async fn handle(&self, ctx: &HandlerContext, request: &Request) -> Response {
        let user_key = &request.header.public_key;
        let rsa_key = match user_key.to_rsa() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "user registration carries unusable key");
                return Response::error();
            }
        };
        let user_id = user_key.identifier();
        if user_id != request.header.from {
            warn!(
                from = request.header.from.short(),
                derived = user_id.short(),
                "user id does not match registered key"
            );
            return Response::error();
        }
        let pem = match crypto::public_key_to_pem(&rsa_key) {
            Ok(pem) => pem,
            Err(e) => {
                warn!(error = %e, "failed to encode user key as PEM");
                return Response::error();
            }
        };

        debug!(user = user_id.short(), "placing user key in the ring");
        match crate::store::publish_public_key(ctx, user_id, pem.into_bytes()).await {
            Ok(()) => Response::success(Vec::new()),
            Err(e) => {
                warn!(error = %e, user = user_id.short(), "failed to store user key");
                Response::error()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::WirePublicKey;

    fn node(addr: &str) -> Node {
        Node::from_addr(addr, WirePublicKey::default())
    }

    #[test]
    fn seeds_self_and_bootstrap() {
        let own = node("127.0.0.1:3000");
        let boot = node("127.0.0.1:3001");
        let registry = TrustRegistry::new(own.clone(), Some(boot.clone()));
        assert!(registry.contains(&own.id));
        assert!(registry.contains(&boot.id));
        assert_eq!(registry.all().len(), 2);

        let lonely = TrustRegistry::new(own.clone(), None);
        assert_eq!(lonely.all().len(), 1);
    }

    #[test]
    fn get_unknown_is_not_trusted() {
        let registry = TrustRegistry::new(node("127.0.0.1:3000"), None);
        let stranger = node("127.0.0.1:9999");
        assert_eq!(
            registry.get(&stranger.id),
            Err(TrustError::NotTrusted(stranger.id))
        );
    }

    #[test]
    fn add_is_idempotent() {
        let registry = TrustRegistry::new(node("127.0.0.1:3000"), None);
        let mut peer = node("127.0.0.1:3002");
        registry.add(peer.clone());
        assert_eq!(registry.all().len(), 2);

        // re-adding the same identity keeps the original record
        peer.addr = "10.1.1.1:1".to_string();
        registry.add(peer.clone());
        assert_eq!(registry.all().len(), 2);
        assert_eq!(registry.get(&peer.id).unwrap().addr, "127.0.0.1:3002");
    }

    #[test]
    fn snapshot_is_detached() {
        let registry = TrustRegistry::new(node("127.0.0.1:3000"), None);
        let snapshot = registry.all();
        registry.add(node("127.0.0.1:3005"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.all().len(), 2);
    }
}
