//! Signing for private channel commands
//!
//! The signing algorithm is opaque to the rest of the crate: anything that can
//! expose a public key and turn a payload into a signature string implements
//! [`Signer`]. [`HmacSigner`] is the stock HMAC-SHA256 implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::types::{ChannelCommand, PrivateChannelCommand};

type HmacSha256 = Hmac<Sha256>;

/// Capability that signs private channel payloads
pub trait Signer: Send + Sync {
    /// Public key sent alongside every signed command
    fn public_key(&self) -> &str;

    /// Sign `payload`, returning the signature string
    fn sign(&self, payload: &str) -> Result<String>;
}

impl<S: Signer + ?Sized> Signer for Arc<S> {
    fn public_key(&self) -> &str {
        (**self).public_key()
    }

    fn sign(&self, payload: &str) -> Result<String> {
        (**self).sign(payload)
    }
}

/// HMAC-SHA256 signer producing lower-case hex signatures
#[derive(Clone)]
pub struct HmacSigner {
    public_key: String,
    secret: Vec<u8>,
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl HmacSigner {
    /// Create a signer from an API key pair
    pub fn new(public_key: impl Into<String>, secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(Error::Auth("Secret key must not be empty".to_string()));
        }

        Ok(Self {
            public_key: public_key.into(),
            secret: secret.to_vec(),
        })
    }
}

impl Signer for HmacSigner {
    fn public_key(&self) -> &str {
        &self.public_key
    }

    fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Auth(format!("Invalid secret key: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Millisecond nonce source that never repeats or goes backwards
#[derive(Debug, Default)]
pub struct NonceGenerator {
    last: AtomicU64,
}

impl NonceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next nonce: the current timestamp in milliseconds, bumped past the
    /// previous value when the clock has not advanced
    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Builds signed private channel commands
pub struct Authenticator {
    signer: Arc<dyn Signer>,
    nonces: NonceGenerator,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("public_key", &self.signer.public_key())
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(signer: impl Signer + 'static) -> Self {
        Self {
            signer: Arc::new(signer),
            nonces: NonceGenerator::new(),
        }
    }

    /// Public key of the underlying signer
    pub fn public_key(&self) -> &str {
        self.signer.public_key()
    }

    /// Stamp `command` with a fresh nonce and sign it
    pub fn sign_command(&self, command: ChannelCommand) -> Result<PrivateChannelCommand> {
        self.sign_command_with_nonce(command, self.nonces.next())
    }

    /// Sign `command` using a caller-supplied nonce
    pub fn sign_command_with_nonce(
        &self,
        command: ChannelCommand,
        nonce: u64,
    ) -> Result<PrivateChannelCommand> {
        let payload = format!("nonce={nonce}");
        let signature = self.signer.sign(&payload)?;

        Ok(PrivateChannelCommand {
            command,
            public_key: self.signer.public_key().to_string(),
            payload,
            signature,
        })
    }
}
