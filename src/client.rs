//! # User-Side Store Operations
//!
//! A [`StoreClient`] speaks to the ring as a *user*: it registers its public
//! key, locates the peer owning a resource key, and performs the file
//! operations against that peer. It also drives one synchronization pass of
//! a local directory against the user's transaction log, the reconciliation
//! the filesystem-watching front-end would trigger.
//!
//! Every operation is one or two one-shot encrypted round trips: a
//! GetSuccessor against the bootstrap peer to find the owner, then the file
//! method against the owner itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::{debug, info, warn};

use crate::clock;
use crate::crypto::WirePublicKey;
use crate::identity::{Identifier, Node};
use crate::messages::{
    self, CallerType, Header, Method, Request, Response, SuccessorQuery,
};
use crate::transport::Transport;
use crate::txlog::{self, MergeAction, TransactionLog};

/// A user's handle on the ring, anchored at one known peer.
pub struct StoreClient {
    id: Identifier,
    public_key: WirePublicKey,
    self_key: Arc<RsaPrivateKey>,
    peer: Node,
}

impl StoreClient {
    /// A client for the user holding `self_key`, bootstrapped through the
    /// peer at `peer_addr` whose public key is `peer_key`.
    pub fn new(self_key: Arc<RsaPrivateKey>, peer_addr: &str, peer_key: &RsaPublicKey) -> Self {
        let public_key = WirePublicKey::from(&self_key.to_public_key());
        let id = public_key.identifier();
        let peer = Node::from_addr(peer_addr, WirePublicKey::from(peer_key));
        Self {
            id,
            public_key,
            self_key,
            peer,
        }
    }

    /// The user's ring identifier: `SHA1(canonical_encoding(public_key))`.
    pub fn id(&self) -> Identifier {
        self.id
    }

    fn request(&self, method: Method, key: Identifier, data: Vec<u8>) -> Request {
        Request {
            header: Header {
                key,
                from: self.id,
                caller: CallerType::User,
                public_key: self.public_key.clone(),
                data_length: data.len() as u64,
                clock: clock::get(),
                ..Header::default()
            },
            method,
            data,
        }
    }

    async fn round_trip(&self, target: &Node, request: &Request) -> Result<Response> {
        let peer_key = target
            .public_key
            .to_rsa()
            .context("target peer has an unusable public key")?;
        let transport = Transport::dial(
            &target.addr,
            CallerType::User,
            self.id,
            String::new(),
            peer_key,
            self.self_key.clone(),
        )
        .await?;
        transport.round_trip(request).await
    }

    /// Register the user's public key with the network. Must precede any
    /// other operation: authentication of later requests fetches this key
    /// from the ring.
    pub async fn register(&self) -> Result<()> {
        let request = self.request(Method::UserRegistration, self.id, Vec::new());
        let response = self.round_trip(&self.peer, &request).await?;
        if !response.is_success() {
            bail!("user registration rejected");
        }
        info!(user = self.id.short(), "user registered");
        Ok(())
    }

    /// The peer currently responsible for `key`.
    pub async fn locate(&self, key: Identifier) -> Result<Node> {
        let body = messages::encode(&SuccessorQuery { id: key })?;
        let request = self.request(Method::GetSuccessor, key, body);
        let response = self.round_trip(&self.peer, &request).await?;
        if !response.is_success() {
            bail!("successor lookup rejected for {}", key.short());
        }
        messages::decode(&response.data).context("failed to decode owning peer")
    }

    /// Store `data` under `name`, logging the update in the user's
    /// transaction log.
    pub async fn post_file(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let key = Identifier::hash(name.as_bytes());
        let owner = self.locate(key).await?;
        let mut request = self.request(Method::PostFile, key, data);
        request.header.resource_name = name.to_string();
        request.header.log = true;
        let response = self.round_trip(&owner, &request).await?;
        if !response.is_success() {
            bail!("post of {name} rejected by {owner}");
        }
        debug!(name, owner = %owner, "file posted");
        Ok(())
    }

    /// Fetch the resource stored under `name`.
    pub async fn get_file(&self, name: &str) -> Result<Vec<u8>> {
        let key = Identifier::hash(name.as_bytes());
        let owner = self.locate(key).await?;
        let request = self.request(Method::GetFile, key, Vec::new());
        let response = self.round_trip(&owner, &request).await?;
        if !response.is_success() {
            bail!("get of {name} rejected by {owner}");
        }
        Ok(response.data)
    }

    /// Remove the resource stored under `name`, logging the deletion.
    pub async fn delete_file(&self, name: &str) -> Result<()> {
        let key = Identifier::hash(name.as_bytes());
        let owner = self.locate(key).await?;
        let mut request = self.request(Method::DeleteFile, key, Vec::new());
        request.header.resource_name = name.to_string();
        request.header.log = true;
        let response = self.round_trip(&owner, &request).await?;
        if !response.is_success() {
            bail!("delete of {name} rejected by {owner}");
        }
        Ok(())
    }

    /// Fetch the user's transaction log. A user with no logged operations
    /// yet gets an empty log.
    pub async fn fetch_log(&self) -> Result<TransactionLog> {
        let key = txlog::log_key(&self.public_key);
        let owner = self.locate(key).await?;
        let request = self.request(Method::GetFile, key, Vec::new());
        let response = self.round_trip(&owner, &request).await?;
        if !response.is_success() {
            // the log blob does not exist until the first logged operation
            debug!(user = self.id.short(), "no transaction log yet");
            return Ok(TransactionLog::default());
        }
        Ok(txlog::decode_log(&response.data)?)
    }

    /// One synchronization pass of `dir` against the remote transaction
    /// log.
    ///
    /// Local files the log has never seen are pushed; for every logged
    /// resource the merge rule decides between fetching, pushing, or
    /// deleting on either side, comparing against `last`, the log snapshot
    /// this directory was last reconciled with. Returns the fetched log for
    /// use as the next pass's `last`.
    pub async fn synchronize(
        &self,
        dir: &Path,
        last: &TransactionLog,
    ) -> Result<TransactionLog> {
        let fetched = self.fetch_log().await?;

        // push local files the remote log has never seen
        for path in walk_files(dir).await? {
            let name = resource_name(dir, &path)?;
            if fetched.contains_key(&name) {
                continue;
            }
            debug!(name, "pushing file unknown to the log");
            let data = tokio::fs::read(&path).await?;
            self.post_file(&name, data).await?;
        }

        // reconcile every logged resource
        for (name, entity) in &fetched {
            let action = txlog::plan(last.get(name), entity);
            let local_path = local_path(dir, name);
            match action {
                MergeAction::Noop => {}
                MergeAction::FetchRemote => {
                    debug!(name, "fetching updated resource");
                    match self.get_file(name).await {
                        Ok(data) => {
                            if let Some(parent) = local_path.parent() {
                                tokio::fs::create_dir_all(parent).await?;
                            }
                            tokio::fs::write(&local_path, data).await?;
                        }
                        Err(e) => warn!(name, error = %e, "fetch during sync failed"),
                    }
                }
                MergeAction::DeleteLocal => {
                    debug!(name, "remote delete wins, removing local file");
                    match tokio::fs::remove_file(&local_path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                MergeAction::PushLocal => {
                    debug!(name, "local update wins, pushing");
                    match tokio::fs::read(&local_path).await {
                        Ok(data) => self.post_file(name, data).await?,
                        Err(e) => warn!(name, error = %e, "local file unreadable during sync"),
                    }
                }
                MergeAction::DeleteRemote => {
                    debug!(name, "local delete wins, deleting remotely");
                    if let Err(e) = self.delete_file(name).await {
                        warn!(name, error = %e, "remote delete during sync failed");
                    }
                }
            }
        }

        Ok(fetched)
    }
}

/// All regular files under `root`, depth-first.
async fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut stack = vec![root.to_path_buf()];
    let mut files = Vec::new();
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to read {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

/// The log-visible name of a file: its path relative to the sync root with
/// a leading slash.
fn resource_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .context("walked file escaped the sync root")?;
    Ok(format!("/{}", relative.to_string_lossy()))
}

/// Where a logged resource lives inside the sync root.
fn local_path(root: &Path, name: &str) -> PathBuf {
    root.join(name.trim_start_matches('/'))
}
