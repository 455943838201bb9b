//! Session key material derived from a completed pairing.

use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{Error, MIC_LENGTH, NONCE_LENGTH, SYMMETRIC_KEY_LENGTH, sha256};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const SESSION_KEYS_INFO: &[u8] = b"SessionKeys";

/// Which side of the pairing handshake this node played.
///
/// The initiator encrypts with the initiator→responder keys and decrypts with
/// the responder→initiator keys; the responder does the opposite.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// The node that started the pairing.
    Initiator,
    /// The node that answered the pairing.
    Responder,
}

#[derive(Clone)]
struct DirectionKeys {
    cipher: [u8; SYMMETRIC_KEY_LENGTH],
    mac:    [u8; SYMMETRIC_KEY_LENGTH],
}

#[derive(Clone)]
struct SessionKeys {
    send:        DirectionKeys,
    recv:        DirectionKeys,
    attestation: [u8; SYMMETRIC_KEY_LENGTH],
}

/// Symmetric state for one secure session.
///
/// A fresh context holds no keys and rejects every operation with
/// [`Error::NotInitialized`] until [`CryptoContext::init_from_secret`]
/// succeeds.
#[derive(Clone, Default)]
pub struct CryptoContext {
    keys: Option<SessionKeys>,
}

impl CryptoContext {
    /// Create an empty context.
    pub fn new() -> Self { Self { keys: None } }

    /// True once keys have been derived.
    pub fn is_initialized(&self) -> bool { self.keys.is_some() }

    /// Derive the session keys from a shared secret.
    ///
    /// Output keying material layout (80 bytes):
    /// ```text
    /// i2r_cipher:16 | r2i_cipher:16 | i2r_mac:16 | r2i_mac:16 | attestation:16
    /// ```
    pub fn init_from_secret(&mut self, secret: &[u8], salt: &[u8], role: SessionRole) -> Result<(), Error> {
        let hk = Hkdf::<Sha256>::new(Some(salt), secret);
        let mut okm = [0u8; SYMMETRIC_KEY_LENGTH * 5];
        hk.expand(SESSION_KEYS_INFO, &mut okm).map_err(|_| Error::KeyDerivation)?;

        let take = |i: usize| {
            let mut k = [0u8; SYMMETRIC_KEY_LENGTH];
            k.copy_from_slice(&okm[i * SYMMETRIC_KEY_LENGTH..(i + 1) * SYMMETRIC_KEY_LENGTH]);
            k
        };
        let i2r = DirectionKeys { cipher: take(0), mac: take(2) };
        let r2i = DirectionKeys { cipher: take(1), mac: take(3) };
        let (send, recv) = match role {
            SessionRole::Initiator => (i2r, r2i),
            SessionRole::Responder => (r2i, i2r),
        };
        self.keys = Some(SessionKeys { send, recv, attestation: take(4) });
        Ok(())
    }

    /// The attestation challenge shared by both ends of the session.
    pub fn attestation_challenge(&self) -> Option<[u8; SYMMETRIC_KEY_LENGTH]> {
        self.keys.as_ref().map(|k| k.attestation)
    }

    /// Encrypt `data` in place and return the MIC over `nonce || aad || ciphertext`.
    pub fn encrypt(&self, data: &mut [u8], aad: &[u8], nonce: &[u8; NONCE_LENGTH]) -> Result<[u8; MIC_LENGTH], Error> {
        let keys = self.keys.as_ref().ok_or(Error::NotInitialized)?;
        let mut cipher = Aes128Ctr::new(&keys.send.cipher.into(), &(*nonce).into());
        cipher.apply_keystream(data);

        let full = mac_for(&keys.send.mac, nonce, aad, data)?.finalize().into_bytes();
        let mut tag = [0u8; MIC_LENGTH];
        tag.copy_from_slice(&full[..MIC_LENGTH]);
        Ok(tag)
    }

    /// Authenticate and decrypt `data` in place.
    ///
    /// The MIC is checked before any byte is decrypted; on mismatch `data`
    /// is left untouched.
    pub fn decrypt(&self, data: &mut [u8], aad: &[u8], nonce: &[u8; NONCE_LENGTH], tag: &[u8]) -> Result<(), Error> {
        let keys = self.keys.as_ref().ok_or(Error::NotInitialized)?;
        if tag.len() != MIC_LENGTH {
            return Err(Error::TagMismatch);
        }
        mac_for(&keys.recv.mac, nonce, aad, data)?
            .verify_truncated_left(tag)
            .map_err(|_| Error::TagMismatch)?;

        let mut cipher = Aes128Ctr::new(&keys.recv.cipher.into(), &(*nonce).into());
        cipher.apply_keystream(data);
        Ok(())
    }
}

fn mac_for(key: &[u8], nonce: &[u8], aad: &[u8], data: &[u8]) -> Result<HmacSha256, Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| Error::InvalidKeyLength)?;
    mac.update(nonce);
    mac.update(aad);
    mac.update(data);
    Ok(mac)
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.keys {
            Some(k) => {
                let id = sha256!(&k.send.cipher, &k.recv.cipher);
                write!(f, "CryptoContext(id={:02x}{:02x}{:02x}{:02x})", id[0], id[1], id[2], id[3])
            }
            None => write!(f, "CryptoContext(uninitialized)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (CryptoContext, CryptoContext) {
        let mut a = CryptoContext::new();
        let mut b = CryptoContext::new();
        a.init_from_secret(b"shared secret", b"salt", SessionRole::Initiator).unwrap();
        b.init_from_secret(b"shared secret", b"salt", SessionRole::Responder).unwrap();
        (a, b)
    }

    #[test]
    fn roles_use_opposite_directions() {
        let (a, b) = pair();
        let ka = a.keys.as_ref().unwrap();
        let kb = b.keys.as_ref().unwrap();
        assert_eq!(ka.send.cipher, kb.recv.cipher);
        assert_eq!(ka.recv.mac, kb.send.mac);
        assert_ne!(ka.send.cipher, ka.recv.cipher);
        assert_eq!(a.attestation_challenge(), b.attestation_challenge());
    }

    #[test]
    fn debug_does_not_leak_keys() {
        let (a, _) = pair();
        let s = format!("{a:?}");
        assert!(s.starts_with("CryptoContext(id="));
        assert_eq!(format!("{:?}", CryptoContext::new()), "CryptoContext(uninitialized)");
    }
}
