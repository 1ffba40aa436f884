//! # One-Shot Encrypted Transport
//!
//! A [`Transport`] owns exactly one TCP connection for exactly one
//! round trip: it seals the request into an envelope, writes one frame,
//! reads one frame back, opens and verifies the response envelope, and
//! closes the connection. Concurrent reuse is ruled out at the type level:
//! `round_trip` consumes the transport, so every round trip constructs its
//! own.
//!
//! ## Failure Kinds
//!
//! Dialing, framing, and codec failures surface through `anyhow` with
//! context; envelope failures (`SessionKeyInvalid`, `CiphertextInvalid`,
//! `PaddingInvalid`, `SignatureInvalid`, `InvalidEnvelope`) propagate as
//! their typed kinds so callers and tests can distinguish them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::net::TcpStream;
use tracing::trace;

use crate::clock;
use crate::envelope::{self, Sender};
use crate::identity::Identifier;
use crate::messages::{self, CallerType, Envelope, Request, Response};

/// Deadline for establishing the TCP connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A single-use encrypted channel to one peer address.
pub struct Transport {
    stream: TcpStream,
    sender: Sender,
    peer_key: RsaPublicKey,
    self_key: Arc<RsaPrivateKey>,
}

impl Transport {
    /// Dial `addr` and prepare a one-shot channel. `peer_key` is the key the
    /// response envelope will be wrapped to us under and verified against.
    pub async fn dial(
        addr: &str,
        caller: CallerType,
        from: Identifier,
        from_addr: String,
        peer_key: RsaPublicKey,
        self_key: Arc<RsaPrivateKey>,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial timed out: {addr}"))?
            .with_context(|| format!("dial failed: {addr}"))?;
        Ok(Self {
            stream,
            sender: Sender {
                caller,
                from,
                from_addr,
            },
            peer_key,
            self_key,
        })
    }

    /// Send one request, receive one response, close the connection.
    ///
    /// The response envelope is opened with our private key and its
    /// signature verified against the peer key this transport was dialed
    /// with; the response clock is absorbed into the local Lamport counter.
    pub async fn round_trip(mut self, request: &Request) -> Result<Response> {
        let payload = messages::encode(request).context("failed to encode request")?;
        let sealed = envelope::seal(&payload, &self.sender, &self.peer_key, &self.self_key)?;
        let frame = messages::encode(&sealed).context("failed to encode envelope")?;
        messages::write_frame(&mut self.stream, &frame)
            .await
            .context("failed to write request frame")?;
        trace!(
            method = %request.method,
            bytes = frame.len(),
            "request frame sent"
        );

        let frame = messages::read_frame(&mut self.stream)
            .await
            .context("failed to read response frame")?;
        let received: Envelope =
            messages::decode(&frame).context("failed to decode response envelope")?;
        let payload = envelope::open(&received, &self.self_key)?;
        envelope::verify_sender(&received, &payload, &self.peer_key)?;

        let response: Response =
            messages::decode(&payload).context("failed to decode response")?;
        clock::bump(response.header.clock);
        Ok(response)
        // the stream drops here, closing the connection
    }
}
