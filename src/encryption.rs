use std::sync::Mutex;

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::channel::EndpointChannel;
use crate::error::ChannelError;

const PUBLIC_KEY_LEN: usize = 32;
const RAW_TOKEN_LEN: usize = 16;
const TOKEN_DISPLAY_BYTES: usize = 4;
const NONCE_LEN: usize = 12;

/// Errors raised while running the channel key exchange.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake I/O failed")]
    Channel(#[from] ChannelError),
    #[error("peer sent a {actual}-byte key share, expected {PUBLIC_KEY_LEN}")]
    MalformedKeyShare { actual: usize },
}

/// Which side of the key exchange this peer drives.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakeRole {
    /// The dialing side; writes its key share first.
    Client,
    /// The accepting side; answers the client's key share.
    Server,
}

/// Established symmetric state for one encrypted channel.
///
/// Each direction owns an independent key and a monotonically increasing
/// nonce counter, so the same context can be shared by the reader and writer
/// without coordination beyond the per-direction lock.
pub struct CipherContext {
    tx: Mutex<DirectionState>,
    rx: Mutex<DirectionState>,
}

struct DirectionState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl DirectionState {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        Nonce::from(nonce)
    }
}

impl CipherContext {
    fn new(tx_key: &[u8; 32], rx_key: &[u8; 32]) -> Self {
        Self {
            tx: Mutex::new(DirectionState::new(tx_key)),
            rx: Mutex::new(DirectionState::new(rx_key)),
        }
    }

    /// Seals one outgoing message.
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut state = self.tx.lock().expect("tx cipher state poisoned");
        let nonce = state.next_nonce();
        state
            .cipher
            .encrypt(&nonce, plaintext)
            .expect("chacha20poly1305 sealing is infallible for in-memory buffers")
    }

    /// Opens one incoming message.
    ///
    /// # Errors
    ///
    /// Returns an error when authentication fails; the receive counter is not
    /// advanced in that case, so a later retry of the same message can
    /// succeed.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut state = self.rx.lock().expect("rx cipher state poisoned");
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&state.counter.to_le_bytes());
        let opened = state
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_tag| ChannelError::Decrypt)?;
        state.counter += 1;
        Ok(opened)
    }
}

impl std::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherContext").finish_non_exhaustive()
    }
}

/// Result of a completed key exchange.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub context: CipherContext,
    pub authentication_token: String,
    pub raw_authentication_token: Vec<u8>,
}

/// Drives the symmetric key exchange on a fresh, unencrypted channel.
pub struct EncryptionRunner;

impl EncryptionRunner {
    /// Runs the two-message X25519 exchange for `role`.
    ///
    /// On success the caller installs the returned context on the channel;
    /// on failure the channel should be closed.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel fails or the peer's key share is
    /// malformed.
    #[instrument(skip(channel), level = "debug", fields(channel = channel.name(), ?role))]
    pub async fn run(
        channel: &EndpointChannel,
        role: HandshakeRole,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let our_public = PublicKey::from(&secret);

        let their_public = match role {
            HandshakeRole::Client => {
                channel.write_message(our_public.as_bytes()).await?;
                read_key_share(channel).await?
            }
            HandshakeRole::Server => {
                let share = read_key_share(channel).await?;
                channel.write_message(our_public.as_bytes()).await?;
                share
            }
        };

        let shared = secret.diffie_hellman(&their_public);
        let (client_public, server_public) = match role {
            HandshakeRole::Client => (our_public, their_public),
            HandshakeRole::Server => (their_public, our_public),
        };

        let client_to_server = derive_key(
            b"nearlink c2s",
            shared.as_bytes(),
            &client_public,
            &server_public,
        );
        let server_to_client = derive_key(
            b"nearlink s2c",
            shared.as_bytes(),
            &client_public,
            &server_public,
        );
        let raw_token = derive_key(
            b"nearlink auth",
            shared.as_bytes(),
            &client_public,
            &server_public,
        )[..RAW_TOKEN_LEN]
            .to_vec();
        let authentication_token = hex::encode(&raw_token[..TOKEN_DISPLAY_BYTES]);

        let context = match role {
            HandshakeRole::Client => CipherContext::new(&client_to_server, &server_to_client),
            HandshakeRole::Server => CipherContext::new(&server_to_client, &client_to_server),
        };
        debug!(token = %authentication_token, "key exchange complete");

        Ok(HandshakeOutcome {
            context,
            authentication_token,
            raw_authentication_token: raw_token,
        })
    }
}

async fn read_key_share(channel: &EndpointChannel) -> Result<PublicKey, HandshakeError> {
    let share = channel.read().await?;
    let bytes: [u8; PUBLIC_KEY_LEN] =
        share
            .as_slice()
            .try_into()
            .map_err(|_len| HandshakeError::MalformedKeyShare {
                actual: share.len(),
            })?;
    Ok(PublicKey::from(bytes))
}

fn derive_key(
    label: &[u8],
    shared: &[u8],
    client_public: &PublicKey,
    server_public: &PublicKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(shared);
    hasher.update(client_public.as_bytes());
    hasher.update(server_public.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::CipherContext;

    /// Builds a cipher context from fixed direction keys.
    pub(crate) fn context(tx_key: &[u8; 32], rx_key: &[u8; 32]) -> CipherContext {
        CipherContext::new(tx_key, rx_key)
    }
}
