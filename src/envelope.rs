//! Hybrid-encrypted envelopes.
//!
//! Every message on a connection is one [`Envelope`]: the serialized request
//! or response is AES-CBC-encrypted under a fresh 32-byte session key, the
//! session key is RSA-wrapped to the recipient, and the envelope header
//! carries the sender's signature over the *plaintext* payload bytes.
//! Methods never get their own envelope shapes; they differ only in payload
//! bytes.
//!
//! Opening an envelope reverses the steps and validates structure first:
//! a non-empty wrapped key, a 16-byte IV, and block-aligned non-empty
//! ciphertext. Signature verification is a separate step because the key to
//! verify against depends on who the caller claims to be: the trust
//! registry entry for peers, the DHT-stored key for users.

use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::crypto::{self, CryptoError, WirePublicKey, BLOCK_SIZE};
use crate::messages::{CallerType, Envelope, Header};

/// Error type for envelope construction and opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Structural validation failed: missing session key, bad IV length, or
    /// unaligned ciphertext.
    InvalidEnvelope,
    /// The session key could not be wrapped or unwrapped.
    SessionKeyInvalid,
    /// The ciphertext could not be decrypted.
    CiphertextInvalid,
    /// The decrypted payload carried malformed PKCS#7 padding.
    PaddingInvalid,
    /// The header signature does not verify over the plaintext payload.
    SignatureInvalid,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::InvalidEnvelope => write!(f, "invalid envelope"),
            EnvelopeError::SessionKeyInvalid => write!(f, "invalid session key"),
            EnvelopeError::CiphertextInvalid => write!(f, "invalid ciphertext"),
            EnvelopeError::PaddingInvalid => write!(f, "invalid padding"),
            EnvelopeError::SignatureInvalid => write!(f, "invalid envelope signature"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl From<CryptoError> for EnvelopeError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::SessionKeyInvalid | CryptoError::KeyRejected => {
                EnvelopeError::SessionKeyInvalid
            }
            CryptoError::CiphertextInvalid => EnvelopeError::CiphertextInvalid,
            CryptoError::PaddingInvalid => EnvelopeError::PaddingInvalid,
            CryptoError::SignatureInvalid => EnvelopeError::SignatureInvalid,
        }
    }
}

/// Identity fields stamped onto outgoing envelope headers.
#[derive(Clone)]
pub struct Sender {
    pub caller: CallerType,
    pub from: crate::identity::Identifier,
    pub from_addr: String,
}

/// Seal `payload` for the peer holding `peer_key`.
///
/// Generates a fresh session key and IV, encrypts, and signs the plaintext
/// with `self_key`. The envelope header records the sender identity, the
/// sender's public key, the signature, and the plaintext length.
pub fn seal(
    payload: &[u8],
    sender: &Sender,
    peer_key: &RsaPublicKey,
    self_key: &RsaPrivateKey,
) -> Result<Envelope, EnvelopeError> {
    let (session_key, wrapped) = crypto::generate_session_key(peer_key)?;
    let (ciphertext, iv) = crypto::encrypt_aes(&session_key, payload)?;
    let signature = crypto::sign(self_key, payload);

    Ok(Envelope {
        header: Header {
            from: sender.from,
            from_addr: sender.from_addr.clone(),
            caller: sender.caller,
            public_key: WirePublicKey::from(&self_key.to_public_key()),
            signature,
            data_length: payload.len() as u64,
            ..Header::default()
        },
        session_key: wrapped,
        iv,
        ciphertext,
    })
}

/// Structural validation of a received envelope, before any key operations.
pub fn validate(envelope: &Envelope) -> Result<(), EnvelopeError> {
    if envelope.session_key.is_empty() {
        return Err(EnvelopeError::InvalidEnvelope);
    }
    if envelope.iv.len() != BLOCK_SIZE {
        return Err(EnvelopeError::InvalidEnvelope);
    }
    if envelope.ciphertext.is_empty() || envelope.ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(EnvelopeError::InvalidEnvelope);
    }
    Ok(())
}

/// Open an envelope addressed to `self_key`, returning the plaintext
/// payload. Does not verify the sender signature; see [`verify_sender`].
pub fn open(envelope: &Envelope, self_key: &RsaPrivateKey) -> Result<Vec<u8>, EnvelopeError> {
    validate(envelope)?;
    let session_key = crypto::decrypt_rsa(self_key, &envelope.session_key)
        .map_err(|_| EnvelopeError::SessionKeyInvalid)?;
    if session_key.len() != crypto::SESSION_KEY_SIZE {
        return Err(EnvelopeError::SessionKeyInvalid);
    }
    let payload = crypto::decrypt_aes(&session_key, &envelope.ciphertext, &envelope.iv)?;
    Ok(payload)
}

/// Verify the envelope header's signature over the plaintext payload against
/// a key the caller is trusted to hold.
pub fn verify_sender(
    envelope: &Envelope,
    payload: &[u8],
    key: &RsaPublicKey,
) -> Result<(), EnvelopeError> {
    crypto::verify(key, &envelope.header.signature, payload)
        .map_err(|_| EnvelopeError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identifier;
    use rand::rngs::OsRng;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let public = key.to_public_key();
        (key, public)
    }

    fn sender() -> Sender {
        Sender {
            caller: CallerType::Node,
            from: Identifier::hash(b"127.0.0.1:3000"),
            from_addr: "127.0.0.1:3000".to_string(),
        }
    }

    #[test]
    fn seal_open_round_trip() {
        let (self_key, self_public) = keypair();
        let (peer_key, peer_public) = keypair();

        let payload = b"request bytes destined for the peer".to_vec();
        let envelope = seal(&payload, &sender(), &peer_public, &self_key).unwrap();

        assert_eq!(envelope.header.data_length, payload.len() as u64);
        assert_eq!(envelope.iv.len(), BLOCK_SIZE);
        assert_ne!(envelope.ciphertext, payload);

        let opened = open(&envelope, &peer_key).unwrap();
        assert_eq!(opened, payload);
        assert!(verify_sender(&envelope, &opened, &self_public).is_ok());
    }

    #[test]
    fn fresh_session_key_per_envelope() {
        let (self_key, _) = keypair();
        let (_, peer_public) = keypair();
        let a = seal(b"same payload", &sender(), &peer_public, &self_key).unwrap();
        let b = seal(b"same payload", &sender(), &peer_public, &self_key).unwrap();
        assert_ne!(a.session_key, b.session_key);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn structural_validation() {
        let (self_key, _) = keypair();
        let (peer_key, peer_public) = keypair();
        let envelope = seal(b"payload", &sender(), &peer_public, &self_key).unwrap();

        let mut no_key = envelope.clone();
        no_key.session_key.clear();
        assert_eq!(open(&no_key, &peer_key), Err(EnvelopeError::InvalidEnvelope));

        let mut short_iv = envelope.clone();
        short_iv.iv.truncate(8);
        assert_eq!(open(&short_iv, &peer_key), Err(EnvelopeError::InvalidEnvelope));

        let mut ragged = envelope.clone();
        ragged.ciphertext.push(0);
        assert_eq!(open(&ragged, &peer_key), Err(EnvelopeError::InvalidEnvelope));

        let mut empty = envelope;
        empty.ciphertext.clear();
        assert_eq!(open(&empty, &peer_key), Err(EnvelopeError::InvalidEnvelope));
    }

    #[test]
    fn tampering_never_yields_success() {
        let (self_key, self_public) = keypair();
        let (peer_key, peer_public) = keypair();
        let payload = b"bytes that must not be forgeable".to_vec();
        let envelope = seal(&payload, &sender(), &peer_public, &self_key).unwrap();

        // flip one bit in the wrapped session key
        let mut bad_key = envelope.clone();
        bad_key.session_key[0] ^= 0x01;
        assert_eq!(open(&bad_key, &peer_key), Err(EnvelopeError::SessionKeyInvalid));

        // flip one bit of ciphertext: decryption survives but either the
        // padding breaks or the signature no longer verifies
        for index in [0, 7, 16] {
            let mut bad_ct = envelope.clone();
            bad_ct.ciphertext[index] ^= 0x80;
            match open(&bad_ct, &peer_key) {
                Err(EnvelopeError::PaddingInvalid)
                | Err(EnvelopeError::CiphertextInvalid) => {}
                Ok(opened) => {
                    assert_eq!(
                        verify_sender(&bad_ct, &opened, &self_public),
                        Err(EnvelopeError::SignatureInvalid)
                    );
                }
                Err(other) => panic!("unexpected failure kind {other}"),
            }
        }

        // flip one bit of the IV: plaintext corrupts, signature catches it
        let mut bad_iv = envelope.clone();
        bad_iv.iv[3] ^= 0x01;
        match open(&bad_iv, &peer_key) {
            Err(EnvelopeError::PaddingInvalid) | Err(EnvelopeError::CiphertextInvalid) => {}
            Ok(opened) => {
                assert_eq!(
                    verify_sender(&bad_iv, &opened, &self_public),
                    Err(EnvelopeError::SignatureInvalid)
                );
            }
            Err(other) => panic!("unexpected failure kind {other}"),
        }

        // flip one bit of the signature
        let mut bad_sig = envelope.clone();
        bad_sig.header.signature[10] ^= 0x01;
        let opened = open(&bad_sig, &peer_key).unwrap();
        assert_eq!(
            verify_sender(&bad_sig, &opened, &self_public),
            Err(EnvelopeError::SignatureInvalid)
        );
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let (self_key, _) = keypair();
        let (_, peer_public) = keypair();
        let (eavesdropper, _) = keypair();
        let envelope = seal(b"secret", &sender(), &peer_public, &self_key).unwrap();
        assert_eq!(
            open(&envelope, &eavesdropper),
            Err(EnvelopeError::SessionKeyInvalid)
        );
    }
}
