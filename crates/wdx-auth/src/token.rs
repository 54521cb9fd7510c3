//! Sealed short-lived token container with a rotating key.
//!
//! Tokens are `base64url(key_id ‖ nonce ‖ ciphertext)` where the ciphertext
//! is the AES-256-GCM sealing of `issued_at ‖ payload`. Keys rotate on a
//! schedule; the current and the previous key stay live so outstanding
//! tokens survive one rotation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use thiserror::Error;
use tracing::debug;
use wdx_core::Clock;

const NONCE_LEN: usize = 12;
const ISSUED_AT_LEN: usize = 8;

/// Token unpacking failures.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token does not have the expected container shape.
    #[error("malformed token container")]
    Malformed,
    /// The key that sealed this token has been retired.
    #[error("token sealed with an unknown key")]
    UnknownKey,
    /// Authentication of the sealed payload failed.
    #[error("token failed authentication")]
    Tampered,
    /// The token outlived the key retention window.
    #[error("token issued too long ago")]
    Expired,
    /// No randomness or cipher failure while sealing.
    #[error("failed to seal token payload")]
    Sealing,
}

struct SealingKey {
    id: u8,
    cipher: Aes256Gcm,
    created_at: u64,
}

impl SealingKey {
    fn generate(id: u8, created_at: u64) -> Result<Self, TokenError> {
        let mut material = [0_u8; 32];
        getrandom::fill(&mut material).map_err(|_| TokenError::Sealing)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&material));
        Ok(Self {
            id,
            cipher,
            created_at,
        })
    }
}

struct KeyRing {
    current: SealingKey,
    previous: Option<SealingKey>,
}

/// Mints and unpacks sealed opaque tokens.
pub struct TokenHandler {
    key_lifetime: u64,
    clock: Arc<dyn Clock>,
    keys: Mutex<Option<KeyRing>>,
}

impl TokenHandler {
    /// Creates a handler whose keys rotate every `key_lifetime_s` seconds.
    pub fn new(key_lifetime_s: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            key_lifetime: u64::from(key_lifetime_s),
            clock,
            keys: Mutex::new(None),
        }
    }

    /// Seals `payload` into an opaque token string.
    pub fn build_token(&self, payload: &str) -> Result<String, TokenError> {
        let now = self.clock.monotonic_secs();
        let mut keys = self.lock_keys();
        let ring = Self::rotated(&mut keys, self.key_lifetime, now)?;

        let mut nonce = [0_u8; NONCE_LEN];
        getrandom::fill(&mut nonce).map_err(|_| TokenError::Sealing)?;

        let mut plaintext = Vec::with_capacity(ISSUED_AT_LEN + payload.len());
        plaintext.extend_from_slice(&now.to_be_bytes());
        plaintext.extend_from_slice(payload.as_bytes());
        let ciphertext = ring
            .current
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| TokenError::Sealing)?;

        let mut container = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        container.push(ring.current.id);
        container.extend_from_slice(&nonce);
        container.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(container))
    }

    /// Unpacks a token minted by [`TokenHandler::build_token`].
    ///
    /// Fails on an unknown key id, a tampered container, or an issue time
    /// outside the key retention window.
    pub fn get_token_payload(&self, token: &str) -> Result<String, TokenError> {
        let now = self.clock.monotonic_secs();
        let container = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| TokenError::Malformed)?;
        if container.len() < 1 + NONCE_LEN + ISSUED_AT_LEN {
            return Err(TokenError::Malformed);
        }
        let (key_id, rest) = (container[0], &container[1..]);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let mut keys = self.lock_keys();
        let ring = Self::rotated(&mut keys, self.key_lifetime, now)?;
        let key = if ring.current.id == key_id {
            &ring.current
        } else {
            ring.previous
                .as_ref()
                .filter(|previous| previous.id == key_id)
                .ok_or(TokenError::UnknownKey)?
        };

        let plaintext = key
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TokenError::Tampered)?;
        if plaintext.len() < ISSUED_AT_LEN {
            return Err(TokenError::Malformed);
        }
        let (issued_at_raw, payload) = plaintext.split_at(ISSUED_AT_LEN);
        let mut issued_at_bytes = [0_u8; ISSUED_AT_LEN];
        issued_at_bytes.copy_from_slice(issued_at_raw);
        let issued_at = u64::from_be_bytes(issued_at_bytes);
        if now.saturating_sub(issued_at) > 2 * self.key_lifetime {
            return Err(TokenError::Expired);
        }

        String::from_utf8(payload.to_vec()).map_err(|_| TokenError::Malformed)
    }

    fn rotated<'a>(
        keys: &'a mut MutexGuard<'_, Option<KeyRing>>,
        key_lifetime: u64,
        now: u64,
    ) -> Result<&'a mut KeyRing, TokenError> {
        if keys.is_none() {
            debug!("generating initial token sealing key");
            **keys = Some(KeyRing {
                current: SealingKey::generate(0, now)?,
                previous: None,
            });
        }
        let ring = keys.as_mut().ok_or(TokenError::Sealing)?;
        if now.saturating_sub(ring.current.created_at) >= key_lifetime {
            debug!("rotating token sealing key");
            let next_id = ring.current.id.wrapping_add(1);
            let fresh = SealingKey::generate(next_id, now)?;
            let retired = std::mem::replace(&mut ring.current, fresh);
            ring.previous = Some(retired);
        }
        Ok(ring)
    }

    fn lock_keys(&self) -> MutexGuard<'_, Option<KeyRing>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct ManualClock {
        now: AtomicU64,
    }

    impl ManualClock {
        fn advance(&self, seconds: u64) {
            self.now.fetch_add(seconds, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn monotonic(&self) -> Duration {
            Duration::from_secs(self.now.load(Ordering::SeqCst))
        }

        fn sleep(&self, duration: Duration) {
            self.advance(duration.as_secs());
        }
    }

    fn handler_with_clock(lifetime: u32) -> (Arc<ManualClock>, TokenHandler) {
        let clock = Arc::new(ManualClock::default());
        let handler = TokenHandler::new(lifetime, Arc::clone(&clock) as _);
        (clock, handler)
    }

    #[test]
    fn payload_round_trips_while_the_key_is_live() {
        let (_clock, handler) = handler_with_clock(300);
        let payload = "1234?access?refresh?alice?";
        let token = handler.build_token(payload).unwrap();
        assert_eq!(handler.get_token_payload(&token).unwrap(), payload);
    }

    #[test]
    fn tokens_differ_between_mints() {
        let (_clock, handler) = handler_with_clock(300);
        let first = handler.build_token("same payload").unwrap();
        let second = handler.build_token("same payload").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn token_survives_one_rotation() {
        let (clock, handler) = handler_with_clock(300);
        let token = handler.build_token("payload").unwrap();
        clock.advance(301);
        // a mint after rotation retires the old key into the previous slot
        handler.build_token("fresh").unwrap();
        assert_eq!(handler.get_token_payload(&token).unwrap(), "payload");
    }

    #[test]
    fn token_dies_after_two_rotations() {
        let (clock, handler) = handler_with_clock(300);
        let token = handler.build_token("payload").unwrap();
        clock.advance(301);
        handler.build_token("second key").unwrap();
        clock.advance(301);
        handler.build_token("third key").unwrap();
        assert!(handler.get_token_payload(&token).is_err());
    }

    #[test]
    fn tampered_container_is_rejected() {
        let (_clock, handler) = handler_with_clock(300);
        let token = handler.build_token("payload").unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(bytes);
        assert!(matches!(
            handler.get_token_payload(&tampered),
            Err(TokenError::Tampered)
        ));
    }

    #[test]
    fn unknown_key_id_is_rejected() {
        let (_clock, handler) = handler_with_clock(300);
        let token = handler.build_token("payload").unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(&token).unwrap();
        bytes[0] = bytes[0].wrapping_add(7);
        let reheaded = URL_SAFE_NO_PAD.encode(bytes);
        assert!(matches!(
            handler.get_token_payload(&reheaded),
            Err(TokenError::UnknownKey)
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let (_clock, handler) = handler_with_clock(300);
        assert!(matches!(
            handler.get_token_payload("not-base64!@#"),
            Err(TokenError::Malformed)
        ));
        assert!(matches!(
            handler.get_token_payload(&URL_SAFE_NO_PAD.encode(b"tiny")),
            Err(TokenError::Malformed)
        ));
    }
}
