//! X25519 key agreement.

use std::fmt;

use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    context::Entropy, derivation::derive_session_keys, error::CryptoError, session::SessionKeys,
};

/// An X25519 key pair used for one key exchange.
#[derive(Clone)]
pub struct X25519KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyPair {
    /// Derive a key pair from caller-supplied entropy.
    pub fn from_entropy(entropy: &Entropy) -> Self {
        let secret = StaticSecret::from(*entropy);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Secret key bytes.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Agree on session keys with `peer_public`.
    ///
    /// `context` is mixed into the derivation; both sides must pass the same
    /// bytes (typically requester public key followed by responder public
    /// key).
    ///
    /// # Errors
    ///
    /// - `InvalidPublicKey` if the peer key is not 32 bytes or the shared
    ///   secret is non-contributory (low-order peer key)
    pub fn agree(
        &self,
        peer_public: &[u8],
        label: &[u8],
        context: &[u8],
    ) -> Result<SessionKeys, CryptoError> {
        let peer: [u8; 32] = peer_public.try_into().map_err(|_| CryptoError::InvalidPublicKey {
            reason: format!("expected 32 bytes, got {}", peer_public.len()),
        })?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey {
                reason: "non-contributory shared secret".to_string(),
            });
        }

        Ok(derive_session_keys(shared.as_bytes(), label, context))
    }
}

impl fmt::Debug for X25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X25519KeyPair").field("public", &self.public.as_bytes()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let alice = X25519KeyPair::from_entropy(&[0x01; 32]);
        let bob = X25519KeyPair::from_entropy(&[0x02; 32]);

        let mut context = alice.public_key().to_vec();
        context.extend_from_slice(&bob.public_key());

        let a = alice.agree(&bob.public_key(), b"dh", &context).unwrap();
        let b = bob.agree(&alice.public_key(), b"dh", &context).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn low_order_peer_rejected() {
        let alice = X25519KeyPair::from_entropy(&[0x01; 32]);
        let result = alice.agree(&[0u8; 32], b"dh", b"");

        assert!(matches!(result, Err(CryptoError::InvalidPublicKey { .. })));
    }

    #[test]
    fn wrong_length_rejected() {
        let alice = X25519KeyPair::from_entropy(&[0x01; 32]);
        assert!(alice.agree(&[9u8; 31], b"dh", b"").is_err());
    }
}
