//! # Remote Chord Node Proxy
//!
//! [`RemoteNode`] is the wire-side implementation of
//! [`ChordPeer`](crate::protocols::ChordPeer): a thin, stateless proxy that
//! turns each method into one encrypted round trip. Every call constructs
//! its own [`Transport`], since connections are single-use by contract, and no
//! state is cached between calls.
//!
//! The proxy always speaks as a node caller: requests carry the local
//! peer's identity and address, and are signed with the local private key
//! so the remote side can authenticate them against its trust registry.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rsa::RsaPrivateKey;
use tracing::trace;

use crate::finger::Finger;
use crate::identity::{Identifier, Node};
use crate::messages::{
    self, CallerType, FingerTableSnapshot, Header, Method, PredecessorUpdate, Request,
    SuccessorQuery,
};
use crate::protocols::ChordPeer;
use crate::transport::Transport;

/// A proxy for one remote peer.
pub struct RemoteNode {
    target: Node,
    self_node: Node,
    self_key: Arc<RsaPrivateKey>,
}

impl RemoteNode {
    /// Point a proxy at `target`, authenticating as `self_node`.
    pub fn new(target: Node, self_node: Node, self_key: Arc<RsaPrivateKey>) -> Self {
        Self {
            target,
            self_node,
            self_key,
        }
    }

    async fn dial(&self) -> Result<Transport> {
        let peer_key = self
            .target
            .public_key
            .to_rsa()
            .context("remote node has an unusable public key")?;
        Transport::dial(
            &self.target.addr,
            CallerType::Node,
            self.self_node.id,
            self.self_node.addr.clone(),
            peer_key,
            self.self_key.clone(),
        )
        .await
    }

    fn request(&self, method: Method, key: Identifier, data: Vec<u8>) -> Request {
        Request {
            header: Header {
                key,
                from: self.self_node.id,
                from_addr: self.self_node.addr.clone(),
                caller: CallerType::Node,
                public_key: self.self_node.public_key.clone(),
                clock: crate::clock::get(),
                ..Header::default()
            },
            method,
            data,
        }
    }
}

#[async_trait]
impl ChordPeer for RemoteNode {
    async fn successor(&self, id: Identifier) -> Result<Node> {
        let body = messages::encode(&SuccessorQuery { id })?;
        let request = self.request(Method::GetSuccessor, id, body);
        let response = self.dial().await?.round_trip(&request).await?;
        if !response.is_success() {
            bail!("successor lookup rejected by {}", self.target);
        }
        let node: Node =
            messages::decode(&response.data).context("failed to decode successor node")?;
        trace!(target = %self.target, successor = %node, "remote successor");
        Ok(node)
    }

    async fn get_predecessor(&self) -> Result<Option<Node>> {
        let request = self.request(Method::GetPredecessor, Identifier::default(), Vec::new());
        let response = self.dial().await?.round_trip(&request).await?;
        if !response.is_success() {
            bail!("predecessor query rejected by {}", self.target);
        }
        let update: PredecessorUpdate =
            messages::decode(&response.data).context("failed to decode predecessor")?;
        Ok(update.node)
    }

    async fn set_predecessor(&self, node: Node) -> Result<()> {
        let body = messages::encode(&PredecessorUpdate { node: Some(node) })?;
        let request = self.request(Method::SetPredecessor, Identifier::default(), body);
        let response = self.dial().await?.round_trip(&request).await?;
        if !response.is_success() {
            // the peer already has a closer predecessor; not an error for
            // the caller, stabilization will converge on its own
            trace!(target = %self.target, "predecessor proposal declined");
        }
        Ok(())
    }

    async fn get_finger_table(&self) -> Result<Vec<Finger>> {
        let request = self.request(Method::GetFingerTable, Identifier::default(), Vec::new());
        let response = self.dial().await?.round_trip(&request).await?;
        if !response.is_success() {
            bail!("finger table query rejected by {}", self.target);
        }
        let snapshot: FingerTableSnapshot =
            messages::decode(&response.data).context("failed to decode finger table")?;
        Ok(snapshot.fingers)
    }
}
