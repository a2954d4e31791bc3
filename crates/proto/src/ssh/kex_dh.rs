//! Ephemeral Diffie-Hellman key exchange (RFC 4253 Section 8, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - diffie-hellman-group14-sha256 (RFC 8268)
//! - curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731)
//!
//! Both methods share one message flow, driven by [`EphemeralKex`]:
//!
//! ```text
//! client                                  server
//!   SSH_MSG_KEX_ECDH_INIT  (Q_C / e)  ->
//!                                    <-   SSH_MSG_KEX_ECDH_REPLY (K_S, Q_S / f, sig)
//! ```
//!
//! # Security
//!
//! - DH Group14: 2048-bit MODP group, peer values checked to lie in (1, p-1)
//! - Curve25519: constant-time operations via `ring`
//! - Private values and the shared secret are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::kex_dh::DhGroup14Exchange;
//!
//! let client = DhGroup14Exchange::new().unwrap();
//! let server = DhGroup14Exchange::new().unwrap();
//!
//! let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
//! let server_secret = server.compute_shared_secret(client.public_key()).unwrap();
//! assert_eq!(client_secret, server_secret);
//! ```

use bytes::{BufMut, BytesMut};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use strand_platform::{StrandError, StrandResult};
use zeroize::{Zeroize, Zeroizing};

use super::kex::{KexContext, KeyExchange};
use super::message::MessageType;
use super::wire::{encode_mpint, write_bytes, WireReader};

/// 2048-bit MODP group prime (RFC 3526 Section 3).
const GROUP14_PRIME_HEX: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
83655D23DCA3AD961C62F356208552BB9ED529077096966D\
670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
15728E5A8AACAA68FFFFFFFFFFFFFFFF";

static GROUP14_PRIME: Lazy<Option<BigUint>> =
    Lazy::new(|| BigUint::parse_bytes(GROUP14_PRIME_HEX, 16));

fn group14_prime() -> StrandResult<&'static BigUint> {
    GROUP14_PRIME
        .as_ref()
        .ok_or_else(|| StrandError::Other("Invalid group14 prime constant".into()))
}

/// One side of an ephemeral key agreement.
///
/// Implementations differ only in how public values travel on the wire:
/// Curve25519 uses `string`, finite-field DH uses `mpint`.
pub trait Agreement: Send + Sized {
    /// Generates a fresh ephemeral key pair.
    fn generate() -> StrandResult<Self>;

    /// Local public value as it is carried on the wire (without length).
    fn public_value(&self) -> Vec<u8>;

    /// Writes a public value in this method's wire encoding.
    fn write_public(buf: &mut BytesMut, value: &[u8]);

    /// Reads a peer public value in this method's wire encoding.
    fn read_public<'a>(reader: &mut WireReader<'a>) -> StrandResult<&'a [u8]>;

    /// Consumes the private key and computes the shared secret magnitude.
    fn agree(self, peer_public: &[u8]) -> StrandResult<Vec<u8>>;
}

/// Diffie-Hellman Group 14 key pair.
pub struct DhGroup14Exchange {
    /// Private exponent x
    private_key: Vec<u8>,
    /// Public value g^x mod p
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a new key pair with 1 < x < p-1.
    pub fn new() -> StrandResult<Self> {
        let p = group14_prime()?;
        let mut rng = rand::thread_rng();

        let p_minus_one = p - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = BigUint::from(2u32).modpow(&x, p);

        Ok(Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        })
    }

    /// Returns the public value as a big-endian magnitude.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes K = y^x mod p.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Protocol`] if the peer value is outside (1, p-1).
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> StrandResult<Vec<u8>> {
        let p = group14_prime()?;
        let y_peer = BigUint::from_bytes_be(peer_public);

        if y_peer <= BigUint::from(1u32) || y_peer >= p - 1u32 {
            return Err(StrandError::Protocol(
                "Invalid peer public key: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(y_peer.modpow(&x, p).to_bytes_be())
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl Agreement for DhGroup14Exchange {
    fn generate() -> StrandResult<Self> {
        Self::new()
    }

    fn public_value(&self) -> Vec<u8> {
        self.public_key.clone()
    }

    fn write_public(buf: &mut BytesMut, value: &[u8]) {
        buf.put_slice(&encode_mpint(value));
    }

    fn read_public<'a>(reader: &mut WireReader<'a>) -> StrandResult<&'a [u8]> {
        reader.read_mpint()
    }

    fn agree(self, peer_public: &[u8]) -> StrandResult<Vec<u8>> {
        self.compute_shared_secret(peer_public)
    }
}

/// Curve25519 key pair.
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a new key pair.
    pub fn new() -> StrandResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| {
            StrandError::Security("Failed to generate Curve25519 private key".to_string())
        })?;

        let public = private_key.compute_public_key().map_err(|_| {
            StrandError::Security("Failed to compute Curve25519 public key".to_string())
        })?;
        let public_key: [u8; 32] = public.as_ref().try_into().map_err(|_| {
            StrandError::Security("Curve25519 public key has wrong length".to_string())
        })?;

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Returns the 32-byte public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the 32-byte shared secret, consuming the private key.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> StrandResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(StrandError::Protocol(format!(
                "Invalid Curve25519 public key length: {} (expected 32)",
                peer_public.len()
            )));
        }
        let peer = UnparsedPublicKey::new(&X25519, peer_public);
        agree_ephemeral(self.private_key, &peer, |secret| secret.to_vec()).map_err(|_| {
            StrandError::Protocol("Curve25519 key agreement failed".to_string())
        })
    }
}

impl Agreement for Curve25519Exchange {
    fn generate() -> StrandResult<Self> {
        Self::new()
    }

    fn public_value(&self) -> Vec<u8> {
        self.public_key.to_vec()
    }

    fn write_public(buf: &mut BytesMut, value: &[u8]) {
        write_bytes(buf, value);
    }

    fn read_public<'a>(reader: &mut WireReader<'a>) -> StrandResult<&'a [u8]> {
        reader.read_bytes()
    }

    fn agree(self, peer_public: &[u8]) -> StrandResult<Vec<u8>> {
        self.compute_shared_secret(peer_public)
    }
}

/// Key exchange state machine shared by every ephemeral DH method.
pub struct EphemeralKex<A: Agreement> {
    name: String,
    ctx: Option<KexContext>,
    agreement: Option<A>,
    host_key: Option<Vec<u8>>,
    signature: Option<Vec<u8>>,
    exchange_hash: Option<Vec<u8>>,
    shared_secret: Option<Zeroizing<Vec<u8>>>,
}

/// curve25519-sha256 and its libssh.org alias.
pub type Curve25519Kex = EphemeralKex<Curve25519Exchange>;

/// diffie-hellman-group14-sha256.
pub type DhGroup14Kex = EphemeralKex<DhGroup14Exchange>;

impl EphemeralKex<Curve25519Exchange> {
    /// Creates a Curve25519 exchange registered under `name`.
    pub fn new(name: &str) -> Self {
        Self::named(name)
    }
}

impl EphemeralKex<DhGroup14Exchange> {
    /// Creates a group14 exchange.
    pub fn new() -> Self {
        Self::named("diffie-hellman-group14-sha256")
    }
}

impl Default for EphemeralKex<DhGroup14Exchange> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Agreement> EphemeralKex<A> {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ctx: None,
            agreement: None,
            host_key: None,
            signature: None,
            exchange_hash: None,
            shared_secret: None,
        }
    }

    fn context(&self) -> StrandResult<&KexContext> {
        self.ctx.as_ref().ok_or_else(|| {
            StrandError::IllegalState(format!("{} used before init", self.name))
        })
    }

    /// H = HASH(V_C || V_S || I_C || I_S || K_S || Q_C || Q_S || K)
    fn compute_hash(
        ctx: &KexContext,
        host_key: &[u8],
        q_c: &[u8],
        q_s: &[u8],
        shared_secret: &[u8],
    ) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_bytes(&mut buf, &ctx.client_ident);
        write_bytes(&mut buf, &ctx.server_ident);
        write_bytes(&mut buf, &ctx.client_kexinit);
        write_bytes(&mut buf, &ctx.server_kexinit);
        write_bytes(&mut buf, host_key);
        A::write_public(&mut buf, q_c);
        A::write_public(&mut buf, q_s);
        buf.put_slice(&encode_mpint(shared_secret));

        Sha256::digest(&buf).to_vec()
    }

    fn handle_init(&mut self, message: &[u8], out: &mut Vec<Vec<u8>>) -> StrandResult<()> {
        let ctx = self.ctx.as_ref().ok_or_else(|| {
            StrandError::IllegalState(format!("{} used before init", self.name))
        })?;
        let host_key = ctx.host_key.clone().ok_or_else(|| {
            StrandError::Config(format!(
                "No host key available for {}",
                ctx.negotiated.host_key
            ))
        })?;

        let mut r = WireReader::for_message(message, MessageType::KexdhInit as u8, "SSH_MSG_KEXDH_INIT")?;
        let q_c = A::read_public(&mut r)?.to_vec();

        let agreement = self.agreement.take().ok_or_else(|| {
            StrandError::IllegalState("Duplicate SSH_MSG_KEXDH_INIT".to_string())
        })?;
        let q_s = agreement.public_value();
        let secret = Zeroizing::new(agreement.agree(&q_c)?);

        let k_s = host_key.public_key_bytes();
        let hash = Self::compute_hash(ctx, &k_s, &q_c, &q_s, &secret);
        let signature = host_key.sign(&hash)?;

        let mut reply = BytesMut::new();
        reply.put_u8(MessageType::KexdhReply as u8);
        write_bytes(&mut reply, &k_s);
        A::write_public(&mut reply, &q_s);
        write_bytes(&mut reply, &signature);
        out.push(reply.to_vec());

        self.host_key = Some(k_s);
        self.signature = Some(signature);
        self.exchange_hash = Some(hash);
        self.shared_secret = Some(secret);
        Ok(())
    }

    fn handle_reply(&mut self, message: &[u8]) -> StrandResult<()> {
        let ctx = self.ctx.as_ref().ok_or_else(|| {
            StrandError::IllegalState(format!("{} used before init", self.name))
        })?;
        let mut r = WireReader::for_message(message, MessageType::KexdhReply as u8, "SSH_MSG_KEXDH_REPLY")?;
        let k_s = r.read_bytes()?.to_vec();
        let q_s = A::read_public(&mut r)?.to_vec();
        let signature = r.read_bytes()?.to_vec();

        let agreement = self.agreement.take().ok_or_else(|| {
            StrandError::IllegalState("Duplicate SSH_MSG_KEXDH_REPLY".to_string())
        })?;
        let q_c = agreement.public_value();
        let secret = Zeroizing::new(agreement.agree(&q_s)?);
        let hash = Self::compute_hash(ctx, &k_s, &q_c, &q_s, &secret);

        self.host_key = Some(k_s);
        self.signature = Some(signature);
        self.exchange_hash = Some(hash);
        self.shared_secret = Some(secret);
        Ok(())
    }
}

impl<A: Agreement> KeyExchange for EphemeralKex<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, ctx: KexContext, out: &mut Vec<Vec<u8>>) -> StrandResult<()> {
        let agreement = A::generate()?;

        if ctx.is_client {
            let mut init = BytesMut::new();
            init.put_u8(MessageType::KexdhInit as u8);
            A::write_public(&mut init, &agreement.public_value());
            out.push(init.to_vec());
        }

        self.agreement = Some(agreement);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn process(&mut self, message: &[u8], out: &mut Vec<Vec<u8>>) -> StrandResult<bool> {
        let is_client = self.context()?.is_client;
        match (message.first().copied(), is_client) {
            (Some(id), false) if id == MessageType::KexdhInit as u8 => {
                self.handle_init(message, out)?;
                Ok(true)
            }
            (Some(id), true) if id == MessageType::KexdhReply as u8 => {
                self.handle_reply(message)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn is_complete(&self) -> bool {
        self.exchange_hash.is_some() && self.shared_secret.is_some()
    }

    fn host_key(&self) -> Option<&[u8]> {
        self.host_key.as_deref()
    }

    fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    fn exchange_hash(&self) -> Option<&[u8]> {
        self.exchange_hash.as_deref()
    }

    fn shared_secret(&self) -> Option<&[u8]> {
        self.shared_secret.as_ref().map(|s| s.as_slice())
    }
}

/// Derives key material (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// ```
///
/// `letter` is one of `b'A'..=b'F'`; K is encoded as an mpint.
///
/// # Example
///
/// ```rust
/// use strand_proto::ssh::kex_dh::derive_key;
///
/// let key = derive_key(&[0x42; 32], &[0x01; 32], &[0x02; 32], b'C', 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Vec<u8> {
    let k_mpint = Zeroizing::new(encode_mpint(shared_secret));
    let mut key = Vec::with_capacity(key_length + 32);

    let mut hasher = Sha256::new();
    hasher.update(&*k_mpint);
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);
    key.extend_from_slice(&hasher.finalize_reset());

    while key.len() < key_length {
        hasher.update(&*k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key);
        key.extend_from_slice(&hasher.finalize_reset());
    }

    key.truncate(key_length);
    key
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ssh::hostkey::{verify_signature, EcdsaP256HostKey, Ed25519HostKey, HostKey};
    use crate::ssh::kex::{KexInit, NegotiatedAlgorithms};

    fn contexts(host_key: Arc<dyn HostKey>) -> (KexContext, KexContext) {
        let client_kexinit = KexInit::new_default();
        let server_kexinit = KexInit::new_default();
        let mut negotiated =
            NegotiatedAlgorithms::negotiate(&client_kexinit, &server_kexinit, true).unwrap();
        negotiated.host_key = host_key.algorithm_name().to_string();

        let client = KexContext {
            is_client: true,
            client_ident: b"SSH-2.0-client".to_vec(),
            server_ident: b"SSH-2.0-server".to_vec(),
            client_kexinit: client_kexinit.to_bytes(),
            server_kexinit: server_kexinit.to_bytes(),
            negotiated,
            host_key: None,
        };
        let server = KexContext {
            is_client: false,
            host_key: Some(host_key),
            ..client.clone()
        };
        (client, server)
    }

    fn run<K: KeyExchange>(mut client: K, mut server: K, host_key: Arc<dyn HostKey>) -> (K, K) {
        let (client_ctx, server_ctx) = contexts(host_key);
        let mut to_server = Vec::new();
        let mut to_client = Vec::new();

        client.init(client_ctx, &mut to_server).unwrap();
        server.init(server_ctx, &mut to_client).unwrap();
        assert_eq!(to_server.len(), 1);
        assert!(to_client.is_empty());

        assert!(server.process(&to_server[0], &mut to_client).unwrap());
        assert!(client.process(&to_client[0], &mut Vec::new()).unwrap());
        (client, server)
    }

    #[test]
    fn test_dh_group14_key_exchange() {
        let client = DhGroup14Exchange::new().unwrap();
        let server = DhGroup14Exchange::new().unwrap();

        let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
        let server_secret = server.compute_shared_secret(client.public_key()).unwrap();
        assert_eq!(client_secret, server_secret);
    }

    #[test]
    fn test_dh_group14_invalid_peer_key() {
        let exchange = DhGroup14Exchange::new().unwrap();
        assert!(exchange.compute_shared_secret(&[1u8]).is_err());
        assert!(exchange.compute_shared_secret(&[]).is_err());
    }

    #[test]
    fn test_curve25519_key_exchange() {
        let client = Curve25519Exchange::new().unwrap();
        let server = Curve25519Exchange::new().unwrap();
        let client_public = *client.public_key();
        let server_public = *server.public_key();

        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();
        assert_eq!(client_secret, server_secret);
        assert_eq!(client_secret.len(), 32);
    }

    #[test]
    fn test_curve25519_bad_length() {
        let exchange = Curve25519Exchange::new().unwrap();
        assert!(exchange.compute_shared_secret(&[9u8; 31]).is_err());
    }

    #[test]
    fn test_curve25519_method_agrees() {
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let (client, server) = run(
            Curve25519Kex::new("curve25519-sha256"),
            Curve25519Kex::new("curve25519-sha256"),
            host_key.clone(),
        );

        assert!(client.is_complete() && server.is_complete());
        assert_eq!(client.exchange_hash(), server.exchange_hash());
        assert_eq!(client.shared_secret(), server.shared_secret());
        assert_eq!(client.host_key(), Some(&host_key.public_key_bytes()[..]));
        assert_eq!(
            client.derive_key(b"sid", b'C', 32).unwrap(),
            server.derive_key(b"sid", b'C', 32).unwrap()
        );
    }

    #[test]
    fn test_group14_method_with_ecdsa_host_key() {
        let host_key: Arc<dyn HostKey> = Arc::new(EcdsaP256HostKey::generate().unwrap());
        let (client, server) = run(DhGroup14Kex::new(), DhGroup14Kex::new(), host_key);
        assert_eq!(client.exchange_hash(), server.exchange_hash());
        assert_eq!(client.exchange_hash().map(|h| h.len()), Some(32));
    }

    #[test]
    fn test_signature_covers_exchange_hash() {
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let (client, _) = run(
            Curve25519Kex::new("curve25519-sha256"),
            Curve25519Kex::new("curve25519-sha256"),
            host_key,
        );

        let key = client.host_key().unwrap();
        let signature = client.signature().unwrap();
        let mut hash = client.exchange_hash().unwrap().to_vec();
        assert!(verify_signature(key, &hash, signature).unwrap());

        hash[0] ^= 0x01;
        assert!(!verify_signature(key, &hash, signature).unwrap());
    }

    #[test]
    fn test_server_without_host_key_fails() {
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let (client_ctx, mut server_ctx) = contexts(host_key);
        server_ctx.host_key = None;

        let mut client = Curve25519Kex::new("curve25519-sha256");
        let mut server = Curve25519Kex::new("curve25519-sha256");
        let mut to_server = Vec::new();
        client.init(client_ctx, &mut to_server).unwrap();
        server.init(server_ctx, &mut Vec::new()).unwrap();
        assert!(server.process(&to_server[0], &mut Vec::new()).is_err());
    }

    #[test]
    fn test_unrelated_message_not_consumed() {
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let (client_ctx, _) = contexts(host_key);
        let mut client = Curve25519Kex::new("curve25519-sha256");
        client.init(client_ctx, &mut Vec::new()).unwrap();
        assert!(!client.process(&[40, 0], &mut Vec::new()).unwrap());
    }

    #[test]
    fn test_derive_key_continuation() {
        let k = [0x42u8; 32];
        let h = [0x01u8; 32];
        let sid = [0x02u8; 32];

        let short = derive_key(&k, &h, &sid, b'A', 16);
        let long = derive_key(&k, &h, &sid, b'A', 80);
        assert_eq!(&long[..16], &short[..]);

        let mut hasher = Sha256::new();
        hasher.update(encode_mpint(&k));
        hasher.update(h);
        hasher.update(&long[..32]);
        assert_eq!(&long[32..64], &hasher.finalize()[..]);

        assert_ne!(derive_key(&k, &h, &sid, b'B', 16), short);
    }
}
