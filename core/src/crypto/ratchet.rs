// Forward-secure ratchet session: X25519 handshake + HKDF root + HMAC chain steps
//
// Handshake:
// 1. Each side generates an ephemeral X25519 key pair and sends
//    `PFS_HELLO:<base64 public key>` on the control plane.
// 2. Once both public keys are known: shared = DH(local, remote)
// 3. root = HKDF-SHA256(shared, info = ROOT_INFO), 32 bytes
// 4. chains = HKDF-SHA256(root, info = CHAIN_INFO), 64 bytes
//    initiator: send = chains[..32], recv = chains[32..]; responder swaps.
//
// Per message (either direction):
//   message_key = HMAC-SHA256(chain, "message")
//   next_chain  = HMAC-SHA256(chain, "chain")
//   wire        = nonce(12) || ChaCha20-Poly1305(message_key, nonce, plaintext)

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

/// Control-plane prefix carrying an ephemeral public key
pub const HELLO_PREFIX: &str = "PFS_HELLO:";
/// Control-plane prefix carrying an encrypted text message
pub const MSG_PREFIX: &str = "PFS_MSG:";

/// Domain separation labels. Changing these breaks interop with every peer.
const ROOT_INFO: &[u8] = b"ananta-pfs-root";
const CHAIN_INFO: &[u8] = b"ananta-pfs-chain";
const MESSAGE_LABEL: &[u8] = b"message";
const CHAIN_LABEL: &[u8] = b"chain";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;
type ChainKey = Zeroizing<[u8; KEY_LEN]>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RatchetError {
    #[error("Handshake not complete")]
    NotReady,
    #[error("Malformed ciphertext")]
    Malformed,
    #[error("Decryption failed")]
    Decryption,
    #[error("Encryption failed")]
    Encryption,
    #[error("Key derivation failed")]
    KeyDerivation,
}

/// One forward-secure session per logical sub-channel.
pub struct RatchetSession {
    is_initiator: bool,
    local_secret: Option<EphemeralSecret>,
    local_public: Option<PublicKey>,
    remote_public: Option<PublicKey>,
    /// (send, recv), populated together at handshake completion
    chains: Option<(ChainKey, ChainKey)>,
}

impl RatchetSession {
    pub fn new(is_initiator: bool) -> Self {
        Self {
            is_initiator,
            local_secret: None,
            local_public: None,
            remote_public: None,
            chains: None,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn is_ready(&self) -> bool {
        self.chains.is_some()
    }

    /// Send our hello if we have not generated a key pair yet.
    pub fn ensure_handshake(
        &mut self,
        mut send_control: impl FnMut(String),
    ) -> Result<(), RatchetError> {
        if self.local_public.is_none() {
            let hello = self.generate_local_key();
            send_control(hello);
        }
        self.try_complete()
    }

    /// Consume a control frame if it belongs to the handshake.
    ///
    /// Returns `false` for frames this layer does not interpret.
    pub fn handle_control_frame(
        &mut self,
        frame: &str,
        mut send_control: impl FnMut(String),
    ) -> bool {
        let Some(encoded) = frame.strip_prefix(HELLO_PREFIX) else {
            return false;
        };

        let remote = match decode_public_key(encoded) {
            Some(key) => key,
            None => {
                debug!("Dropping malformed hello frame");
                return true;
            }
        };

        if self.remote_public.is_some() {
            debug!("Ignoring repeated hello");
            return true;
        }
        self.remote_public = Some(remote);

        if self.local_public.is_none() {
            let hello = self.generate_local_key();
            send_control(hello);
        }

        if let Err(e) = self.try_complete() {
            debug!("Handshake completion failed: {}", e);
        }
        true
    }

    pub fn encrypt_binary(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let (send, _) = self.chains.as_mut().ok_or(RatchetError::NotReady)?;
        let (message_key, next_chain) = step(send)?;
        *send = next_chain;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&message_key[..]));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| RatchetError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt one message. The receive chain only advances on success.
    pub fn decrypt_binary(&mut self, data: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let (_, recv) = self.chains.as_mut().ok_or(RatchetError::NotReady)?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(RatchetError::Malformed);
        }

        let (message_key, next_chain) = step(recv)?;
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&message_key[..]));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| RatchetError::Decryption)?;

        *recv = next_chain;
        Ok(plaintext)
    }

    /// Encrypt text into the base64 body of a `PFS_MSG:` frame
    pub fn encrypt_text(&mut self, text: &str) -> Result<String, RatchetError> {
        Ok(BASE64.encode(self.encrypt_binary(text.as_bytes())?))
    }

    pub fn decrypt_text(&mut self, encoded: &str) -> Result<String, RatchetError> {
        let data = BASE64.decode(encoded).map_err(|_| RatchetError::Malformed)?;
        let plaintext = self.decrypt_binary(&data)?;
        String::from_utf8(plaintext).map_err(|_| RatchetError::Malformed)
    }

    fn generate_local_key(&mut self) -> String {
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        self.local_secret = Some(secret);
        self.local_public = Some(public);
        format!("{}{}", HELLO_PREFIX, BASE64.encode(public.as_bytes()))
    }

    fn try_complete(&mut self) -> Result<(), RatchetError> {
        if self.chains.is_some() {
            return Ok(());
        }
        let Some(remote) = self.remote_public else {
            return Ok(());
        };
        let Some(secret) = self.local_secret.take() else {
            return Ok(());
        };

        let shared = secret.diffie_hellman(&remote);

        let mut root: ChainKey = Zeroizing::new([0u8; KEY_LEN]);
        Hkdf::<Sha256>::new(None, shared.as_bytes())
            .expand(ROOT_INFO, &mut root[..])
            .map_err(|_| RatchetError::KeyDerivation)?;

        let mut okm = Zeroizing::new([0u8; KEY_LEN * 2]);
        Hkdf::<Sha256>::new(None, &root[..])
            .expand(CHAIN_INFO, &mut okm[..])
            .map_err(|_| RatchetError::KeyDerivation)?;

        let mut first: ChainKey = Zeroizing::new([0u8; KEY_LEN]);
        let mut second: ChainKey = Zeroizing::new([0u8; KEY_LEN]);
        first.copy_from_slice(&okm[..KEY_LEN]);
        second.copy_from_slice(&okm[KEY_LEN..]);

        self.chains = Some(if self.is_initiator {
            (first, second)
        } else {
            (second, first)
        });
        debug!(initiator = self.is_initiator, "Ratchet handshake complete");
        Ok(())
    }
}

/// Derive (message key, next chain key) from the current chain key
fn step(chain: &[u8; KEY_LEN]) -> Result<(ChainKey, ChainKey), RatchetError> {
    Ok((keyed_hash(chain, MESSAGE_LABEL)?, keyed_hash(chain, CHAIN_LABEL)?))
}

fn keyed_hash(key: &[u8; KEY_LEN], label: &[u8]) -> Result<ChainKey, RatchetError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| RatchetError::KeyDerivation)?;
    mac.update(label);
    let mut out: ChainKey = Zeroizing::new([0u8; KEY_LEN]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn decode_public_key(encoded: &str) -> Option<PublicKey> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    let array: [u8; 32] = bytes.try_into().ok()?;
    Some(PublicKey::from(array))
}
