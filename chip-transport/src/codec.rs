//! Secure message encoding: payload header + payload → ciphertext + MIC.

use chip_crypto::{CryptoContext, MIC_LENGTH, NONCE_LENGTH};

use crate::buffer::PacketBuffer;
use crate::counter::MessageCounter;
use crate::error::Error;
use crate::header::{PacketHeader, PayloadHeader};

/// Encrypts outbound and decrypts inbound secure-session messages.
pub trait SecureMessageCodec {
    /// Encrypt `payload_header || buf` in place with the session keys.
    ///
    /// Stamps `counter`'s value into `packet_header`, marks it encrypted and
    /// advances `counter` exactly once on success. The caller prepends the
    /// packet header afterwards.
    fn encode(
        &self,
        crypto:         &CryptoContext,
        payload_header: &PayloadHeader,
        packet_header:  &mut PacketHeader,
        buf:            &mut PacketBuffer,
        counter:        &mut MessageCounter,
    ) -> Result<(), Error>;

    /// Authenticate and decrypt `buf` (packet header already consumed),
    /// consume the payload header and return it.
    fn decode(
        &self,
        crypto:        &CryptoContext,
        packet_header: &PacketHeader,
        buf:           &mut PacketBuffer,
    ) -> Result<PayloadHeader, Error>;
}

/// The default codec: AES-128-CTR with a 16-byte HMAC-SHA256 MIC.
///
/// ```text
/// nonce = security_flags:u8 | counter:u32 | source_node_id:u64 | 0:u24
/// aad   = encoded packet header
/// wire  = packet_header || E(payload_header || payload) || mic
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct AeadMessageCodec;

impl AeadMessageCodec {
    fn nonce(header: &PacketHeader) -> [u8; NONCE_LENGTH] {
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce[0] = header.security_flags;
        nonce[1..5].copy_from_slice(&header.counter.to_le_bytes());
        nonce[5..13].copy_from_slice(&header.source_node_id.unwrap_or(0).to_le_bytes());
        nonce
    }
}

impl SecureMessageCodec for AeadMessageCodec {
    fn encode(
        &self,
        crypto:         &CryptoContext,
        payload_header: &PayloadHeader,
        packet_header:  &mut PacketHeader,
        buf:            &mut PacketBuffer,
        counter:        &mut MessageCounter,
    ) -> Result<(), Error> {
        if !crypto.is_initialized() {
            return Err(Error::Crypto(chip_crypto::Error::NotInitialized));
        }
        packet_header.counter = counter.value();
        packet_header.set_encrypted(true);

        payload_header.encode_before_data(buf);
        let aad = packet_header.to_bytes();
        let tag = crypto.encrypt(buf.as_mut(), &aad, &Self::nonce(packet_header))?;
        buf.extend(tag.iter());

        counter.advance()
    }

    fn decode(
        &self,
        crypto:        &CryptoContext,
        packet_header: &PacketHeader,
        buf:           &mut PacketBuffer,
    ) -> Result<PayloadHeader, Error> {
        let tag = buf.split_off_back(MIC_LENGTH).ok_or(Error::InvalidMessageLength)?;
        let aad = packet_header.to_bytes();
        crypto.decrypt(buf.as_mut(), &aad, &Self::nonce(packet_header), &tag)?;
        PayloadHeader::decode_and_consume(buf)
    }
}
