//! SSH packet protection.
//!
//! This module implements the per-direction packet protection installed after
//! each key exchange:
//! - AES-128-GCM, AES-256-GCM (`aesNNN-gcm@openssh.com`, RFC 5647)
//! - HMAC-SHA256, HMAC-SHA512 with the `none` cipher
//! - Cleartext framing before the first NEWKEYS
//!
//! [`PacketSealer`] turns payloads into wire packets and [`PacketOpener`]
//! extracts payloads from a receive buffer. Each direction owns one of each
//! and switches independently.

use bytes::{Buf, BytesMut};
use hmac::{Hmac, Mac};
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_128_GCM,
    AES_256_GCM,
};
use sha2::{Sha256, Sha512};
use strand_platform::{StrandError, StrandResult};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::packet::{check_packet_length, Packet, DEFAULT_BLOCK_SIZE};

/// GCM nonce (RFC 5647 Section 7.1).
///
/// A fixed 4-byte field followed by a 64-bit invocation counter, both taken
/// from the derived IV. The counter increments once per packet.
struct GcmNonce {
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmNonce {
    fn from_iv(iv: &[u8]) -> StrandResult<Self> {
        if iv.len() < 12 {
            return Err(StrandError::Security(format!(
                "Insufficient IV material: expected 12, got {}",
                iv.len()
            )));
        }
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..12]);
        Ok(Self {
            fixed,
            invocation: u64::from_be_bytes(counter),
        })
    }
}

impl NonceSequence for GcmNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..4].copy_from_slice(&self.fixed);
        nonce_bytes[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::try_assume_unique_for_key(&nonce_bytes)
    }
}

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// No encryption
    None,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes256Gcm => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
        }
    }

    /// Returns the cipher block size used for padding.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => DEFAULT_BLOCK_SIZE,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 16,
        }
    }

    /// Returns the authentication tag size in bytes (for AEAD ciphers).
    pub fn tag_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 16,
        }
    }

    /// Returns true if this is an AEAD cipher.
    ///
    /// AEAD ciphers authenticate the packet themselves, so the negotiated MAC
    /// is not used.
    pub fn is_aead(&self) -> bool {
        matches!(self, CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm)
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CipherAlgorithm::None),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            _ => None,
        }
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

/// MAC key for computing message authentication codes.
///
/// The sequence number is supplied by the caller because the transport keeps
/// a single counter per direction that survives key changes.
#[derive(ZeroizeOnDrop)]
pub struct MacKey {
    #[zeroize(skip)]
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> StrandResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(StrandError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes the MAC of `seq || packet_data`.
    pub fn compute(&self, sequence: u32, packet_data: &[u8]) -> StrandResult<Vec<u8>> {
        let key_error = |_| StrandError::Security("Invalid HMAC key".to_string());
        let mac = match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).map_err(key_error)?;
                mac.update(&sequence.to_be_bytes());
                mac.update(packet_data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&self.key).map_err(key_error)?;
                mac.update(&sequence.to_be_bytes());
                mac.update(packet_data);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(mac)
    }

    /// Verifies the MAC of `seq || packet_data` in constant time.
    pub fn verify(&self, sequence: u32, packet_data: &[u8], received_mac: &[u8]) -> StrandResult<()> {
        let computed_mac = self.compute(sequence, packet_data)?;

        if computed_mac.len() != received_mac.len() {
            return Err(StrandError::Security("MAC length mismatch".to_string()));
        }

        if computed_mac.ct_eq(received_mac).into() {
            Ok(())
        } else {
            Err(StrandError::Security("MAC verification failed".to_string()))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

/// Key material for one direction, derived from the key exchange.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    /// Negotiated cipher name.
    #[zeroize(skip)]
    pub cipher: String,
    /// Negotiated MAC name.
    #[zeroize(skip)]
    pub mac: String,
    /// Initial IV.
    pub iv: Vec<u8>,
    /// Encryption key.
    pub key: Vec<u8>,
    /// Integrity key.
    pub mac_key: Vec<u8>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher)
            .field("mac", &self.mac)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl DirectionKeys {
    fn cipher(&self) -> StrandResult<CipherAlgorithm> {
        CipherAlgorithm::from_name(&self.cipher)
            .ok_or_else(|| StrandError::Protocol(format!("Unsupported cipher: {}", self.cipher)))
    }

    fn mac_key(&self, cipher: CipherAlgorithm) -> StrandResult<Option<MacKey>> {
        if cipher.is_aead() || self.mac == "none" {
            return Ok(None);
        }
        let algorithm = MacAlgorithm::from_name(&self.mac)
            .ok_or_else(|| StrandError::Protocol(format!("Unsupported MAC: {}", self.mac)))?;
        MacKey::new(algorithm, &self.mac_key).map(Some)
    }

    fn unbound_key(&self, cipher: CipherAlgorithm) -> StrandResult<UnboundKey> {
        if self.key.len() < cipher.key_size() {
            return Err(StrandError::Security(format!(
                "Insufficient key material: expected {}, got {}",
                cipher.key_size(),
                self.key.len()
            )));
        }
        let algorithm = match cipher {
            CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
            CipherAlgorithm::Aes256Gcm => &AES_256_GCM,
            CipherAlgorithm::None => {
                return Err(StrandError::Protocol("Cipher 'none' has no key".to_string()))
            }
        };
        UnboundKey::new(algorithm, &self.key[..cipher.key_size()]).map_err(|_| {
            StrandError::Security(format!("Failed to create {} key", cipher.name()))
        })
    }
}

enum SealMode {
    Clear,
    Mac(MacKey),
    Aead(SealingKey<GcmNonce>),
}

/// Outbound packet protection for one direction.
pub struct PacketSealer {
    cipher: CipherAlgorithm,
    mode: SealMode,
}

impl std::fmt::Debug for PacketSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSealer")
            .field("cipher", &self.cipher)
            .finish()
    }
}

impl PacketSealer {
    /// Cleartext framing used until the first NEWKEYS.
    pub fn clear() -> Self {
        Self {
            cipher: CipherAlgorithm::None,
            mode: SealMode::Clear,
        }
    }

    /// Builds the sealer for freshly derived keys.
    pub fn new(keys: &DirectionKeys) -> StrandResult<Self> {
        let cipher = keys.cipher()?;
        let mode = if cipher.is_aead() {
            let nonce = GcmNonce::from_iv(&keys.iv)?;
            SealMode::Aead(SealingKey::new(keys.unbound_key(cipher)?, nonce))
        } else {
            match keys.mac_key(cipher)? {
                Some(mac) => SealMode::Mac(mac),
                None => SealMode::Clear,
            }
        };
        Ok(Self { cipher, mode })
    }

    /// Active cipher.
    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher
    }

    /// Frames and protects one payload sent with sequence number `sequence`.
    pub fn seal(&mut self, sequence: u32, payload: Vec<u8>) -> StrandResult<Vec<u8>> {
        let aead = self.cipher.is_aead();
        let packet = Packet::with_alignment(payload, self.cipher.block_size(), aead)?;
        let mut bytes = packet.to_bytes();

        match &mut self.mode {
            SealMode::Clear => {}
            SealMode::Mac(key) => {
                let mac = key.compute(sequence, &bytes)?;
                bytes.extend_from_slice(&mac);
            }
            SealMode::Aead(key) => {
                let mut body = bytes.split_off(4);
                let mut length = [0u8; 4];
                length.copy_from_slice(&bytes);
                key.seal_in_place_append_tag(Aad::from(length), &mut body)
                    .map_err(|_| StrandError::Security("Encryption failed".to_string()))?;
                bytes.extend_from_slice(&body);
            }
        }
        Ok(bytes)
    }
}

enum OpenMode {
    Clear,
    Mac(MacKey),
    Aead(OpeningKey<GcmNonce>),
}

/// Inbound packet protection for one direction.
pub struct PacketOpener {
    cipher: CipherAlgorithm,
    mode: OpenMode,
}

impl std::fmt::Debug for PacketOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketOpener")
            .field("cipher", &self.cipher)
            .finish()
    }
}

impl PacketOpener {
    /// Cleartext framing used until the first NEWKEYS.
    pub fn clear() -> Self {
        Self {
            cipher: CipherAlgorithm::None,
            mode: OpenMode::Clear,
        }
    }

    /// Builds the opener for freshly derived keys.
    pub fn new(keys: &DirectionKeys) -> StrandResult<Self> {
        let cipher = keys.cipher()?;
        let mode = if cipher.is_aead() {
            let nonce = GcmNonce::from_iv(&keys.iv)?;
            OpenMode::Aead(OpeningKey::new(keys.unbound_key(cipher)?, nonce))
        } else {
            match keys.mac_key(cipher)? {
                Some(mac) => OpenMode::Mac(mac),
                None => OpenMode::Clear,
            }
        };
        Ok(Self { cipher, mode })
    }

    /// Active cipher.
    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher
    }

    fn trailer_len(&self) -> usize {
        match &self.mode {
            OpenMode::Clear => 0,
            OpenMode::Mac(key) => key.algorithm().mac_size(),
            OpenMode::Aead(_) => self.cipher.tag_size(),
        }
    }

    /// Removes one complete packet from `buf` and returns its payload.
    ///
    /// Returns `Ok(None)` while the packet is incomplete. Authentication
    /// failures are [`StrandError::Security`]; framing failures are
    /// [`StrandError::Protocol`].
    pub fn open(
        &mut self,
        sequence: u32,
        buf: &mut BytesMut,
        max_packet_length: usize,
    ) -> StrandResult<Option<Vec<u8>>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let packet_length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        check_packet_length(packet_length, max_packet_length)?;

        let aligned = if self.cipher.is_aead() {
            packet_length
        } else {
            4 + packet_length
        };
        if aligned % self.cipher.block_size() != 0 {
            return Err(StrandError::Protocol(format!(
                "Packet length {} not aligned to block size {}",
                packet_length,
                self.cipher.block_size()
            )));
        }

        let total = 4 + packet_length + self.trailer_len();
        if buf.len() < total {
            return Ok(None);
        }
        let mut frame = buf.split_to(total);

        let payload = match &mut self.mode {
            OpenMode::Clear => Packet::parse_body(&frame[4..])?,
            OpenMode::Mac(key) => {
                let (data, mac) = frame.split_at(4 + packet_length);
                key.verify(sequence, data, mac)?;
                Packet::parse_body(&data[4..])?
            }
            OpenMode::Aead(key) => {
                let mut length = [0u8; 4];
                length.copy_from_slice(&frame[..4]);
                frame.advance(4);
                let plaintext = key
                    .open_in_place(Aad::from(length), &mut frame[..])
                    .map_err(|_| {
                        StrandError::Security(
                            "Decryption failed or authentication tag mismatch".to_string(),
                        )
                    })?;
                Packet::parse_body(plaintext)?
            }
        };
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::packet::MAX_PACKET_LENGTH;

    fn keys(cipher: &str, mac: &str) -> DirectionKeys {
        DirectionKeys {
            cipher: cipher.to_string(),
            mac: mac.to_string(),
            iv: (0u8..12).collect(),
            key: vec![0x42; 32],
            mac_key: vec![0x24; 64],
        }
    }

    #[test]
    fn test_cipher_algorithm_properties() {
        let aes = CipherAlgorithm::Aes256Gcm;
        assert_eq!(aes.name(), "aes256-gcm@openssh.com");
        assert_eq!(aes.key_size(), 32);
        assert_eq!(aes.iv_size(), 12);
        assert_eq!(aes.tag_size(), 16);
        assert!(aes.is_aead());
        assert!(!CipherAlgorithm::None.is_aead());
        assert_eq!(CipherAlgorithm::None.block_size(), 8);
    }

    #[test]
    fn test_cipher_from_name() {
        assert_eq!(
            CipherAlgorithm::from_name("aes128-gcm@openssh.com"),
            Some(CipherAlgorithm::Aes128Gcm)
        );
        assert_eq!(CipherAlgorithm::from_name("none"), Some(CipherAlgorithm::None));
        assert_eq!(CipherAlgorithm::from_name("3des-cbc"), None);
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let key = MacKey::new(MacAlgorithm::HmacSha256, &[0x11; 32]).unwrap();
        let mac = key.compute(3, b"packet").unwrap();
        assert_eq!(mac.len(), 32);
        assert!(key.verify(3, b"packet", &mac).is_ok());
        assert!(key.verify(4, b"packet", &mac).is_err());
        assert!(key.verify(3, b"packet", &mac[..16]).is_err());
    }

    #[test]
    fn test_mac_insufficient_key() {
        assert!(MacKey::new(MacAlgorithm::HmacSha512, &[0; 32]).is_err());
    }

    #[test]
    fn test_clear_roundtrip() {
        let mut sealer = PacketSealer::clear();
        let mut opener = PacketOpener::clear();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&sealer.seal(0, b"hello".to_vec()).unwrap());
        buf.extend_from_slice(&sealer.seal(1, b"world".to_vec()).unwrap());

        assert_eq!(opener.open(0, &mut buf, MAX_PACKET_LENGTH).unwrap().unwrap(), b"hello");
        assert_eq!(opener.open(1, &mut buf, MAX_PACKET_LENGTH).unwrap().unwrap(), b"world");
        assert!(opener.open(2, &mut buf, MAX_PACKET_LENGTH).unwrap().is_none());
    }

    #[test]
    fn test_partial_packet_waits() {
        let mut sealer = PacketSealer::clear();
        let mut opener = PacketOpener::clear();
        let bytes = sealer.seal(0, b"partial".to_vec()).unwrap();

        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(opener.open(0, &mut buf, MAX_PACKET_LENGTH).unwrap().is_none());
        buf.extend_from_slice(&bytes[bytes.len() - 1..]);
        assert_eq!(opener.open(0, &mut buf, MAX_PACKET_LENGTH).unwrap().unwrap(), b"partial");
    }

    #[test]
    fn test_gcm_roundtrip() {
        for cipher in ["aes128-gcm@openssh.com", "aes256-gcm@openssh.com"] {
            let k = keys(cipher, "hmac-sha2-256");
            let mut sealer = PacketSealer::new(&k).unwrap();
            let mut opener = PacketOpener::new(&k).unwrap();

            let mut buf = BytesMut::new();
            for i in 0..3u32 {
                let sealed = sealer.seal(i, vec![i as u8; 100]).unwrap();
                assert_eq!((sealed.len() - 4 - 16) % 16, 0);
                buf.extend_from_slice(&sealed);
            }
            for i in 0..3u32 {
                let payload = opener.open(i, &mut buf, MAX_PACKET_LENGTH).unwrap().unwrap();
                assert_eq!(payload, vec![i as u8; 100]);
            }
        }
    }

    #[test]
    fn test_gcm_tamper_detected() {
        let k = keys("aes256-gcm@openssh.com", "none");
        let mut sealer = PacketSealer::new(&k).unwrap();
        let mut opener = PacketOpener::new(&k).unwrap();

        let mut sealed = sealer.seal(0, b"secret".to_vec()).unwrap();
        sealed[10] ^= 0x01;
        let mut buf = BytesMut::from(&sealed[..]);
        assert!(matches!(
            opener.open(0, &mut buf, MAX_PACKET_LENGTH),
            Err(StrandError::Security(_))
        ));
    }

    #[test]
    fn test_mac_mode_roundtrip_and_tamper() {
        let k = keys("none", "hmac-sha2-512");
        let mut sealer = PacketSealer::new(&k).unwrap();
        let mut opener = PacketOpener::new(&k).unwrap();

        let sealed = sealer.seal(7, b"integrity".to_vec()).unwrap();
        let mut buf = BytesMut::from(&sealed[..]);
        assert_eq!(opener.open(7, &mut buf, MAX_PACKET_LENGTH).unwrap().unwrap(), b"integrity");

        let mut buf = BytesMut::from(&sealed[..]);
        assert!(matches!(
            opener.open(8, &mut buf, MAX_PACKET_LENGTH),
            Err(StrandError::Security(_))
        ));
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut opener = PacketOpener::clear();
        let mut buf = BytesMut::from(&[0x00, 0x10, 0x00, 0x00, 4][..]);
        assert!(matches!(
            opener.open(0, &mut buf, 1024),
            Err(StrandError::Protocol(_))
        ));
    }

    #[test]
    fn test_misaligned_packet_rejected() {
        let mut opener = PacketOpener::clear();
        let mut buf = BytesMut::from(&[0, 0, 0, 9, 4, 1, 2, 3, 4, 5, 6, 7, 8][..]);
        assert!(opener.open(0, &mut buf, MAX_PACKET_LENGTH).is_err());
    }
}
