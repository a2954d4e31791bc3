//! SSH key exchange negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS
//! - Role-aware algorithm negotiation
//! - The [`KeyExchange`] contract every key exchange method implements
//! - [`KexRegistry`], which resolves negotiated names to implementations
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server supports)
//! 3. The negotiated [`KeyExchange`] runs its method-specific messages
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches to the new keys independently
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::kex::{select_component, KexInit};
//!
//! let kexinit = KexInit::new_default();
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! // The responder inverts the lists so both sides pick the same entry
//! let client = vec!["a".to_string(), "b".to_string(), "c".to_string()];
//! let server = vec!["c".to_string(), "b".to_string()];
//! assert_eq!(select_component(&client, &server, true).unwrap(), "c");
//! assert_eq!(select_component(&server, &client, false).unwrap(), "c");
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use strand_platform::{StrandError, StrandResult};

use super::crypto::CipherAlgorithm;
use super::hostkey::HostKey;
use super::kex_dh::{derive_key, Curve25519Kex, DhGroup14Kex};
use super::message::MessageType;
use super::wire::{write_name_list, WireReader};

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Ordered algorithm preferences advertised in KEXINIT.
///
/// Each list is ordered by preference, most preferred first. The same lists
/// are offered for both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange methods.
    pub kex: Vec<String>,
    /// Host key algorithms.
    pub host_key: Vec<String>,
    /// Ciphers.
    pub cipher: Vec<String>,
    /// MAC algorithms, used with non-AEAD ciphers.
    pub mac: Vec<String>,
    /// Compression methods.
    pub compression: Vec<String>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: names(&[
                "curve25519-sha256",
                "curve25519-sha256@libssh.org",
                "diffie-hellman-group14-sha256",
            ]),
            host_key: names(&["ssh-ed25519", "ecdsa-sha2-nistp256"]),
            cipher: names(&["aes256-gcm@openssh.com", "aes128-gcm@openssh.com"]),
            mac: names(&["hmac-sha2-256", "hmac-sha2-512"]),
            compression: names(&["none"]),
        }
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with a fresh random cookie from preferences.
    pub fn from_preferences(prefs: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_key.clone(),
            encryption_algorithms_client_to_server: prefs.cipher.clone(),
            encryption_algorithms_server_to_client: prefs.cipher.clone(),
            mac_algorithms_client_to_server: prefs.mac.clone(),
            mac_algorithms_server_to_client: prefs.mac.clone(),
            compression_algorithms_client_to_server: prefs.compression.clone(),
            compression_algorithms_server_to_client: prefs.compression.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Creates a KEXINIT with the default preferences.
    pub fn new_default() -> Self {
        Self::from_preferences(&AlgorithmPreferences::default())
    }

    /// Builds the single-choice KEXINIT a server sends when it decides the
    /// outcome itself: every list holds only the negotiated algorithm.
    pub fn restricted_to(negotiated: &NegotiatedAlgorithms) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        let one = |s: &str| vec![s.to_string()];

        Self {
            cookie,
            kex_algorithms: one(&negotiated.kex),
            server_host_key_algorithms: one(&negotiated.host_key),
            encryption_algorithms_client_to_server: one(&negotiated.cipher_c2s),
            encryption_algorithms_server_to_client: one(&negotiated.cipher_s2c),
            mac_algorithms_client_to_server: one(&negotiated.mac_c2s),
            mac_algorithms_server_to_client: one(&negotiated.mac_s2c),
            compression_algorithms_client_to_server: one(&negotiated.compression_c2s),
            compression_algorithms_server_to_client: one(&negotiated.compression_s2c),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Replaces the host key algorithm list.
    pub fn set_server_host_key_algorithms(&mut self, algorithms: Vec<String>) {
        self.server_host_key_algorithms = algorithms;
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms client to server.
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms server to client.
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms client to server.
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms server to client.
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the compression algorithms client to server.
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the compression algorithms server to client.
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns whether a guessed kex packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Sets the first_kex_packet_follows flag.
    pub fn set_first_kex_packet_follows(&mut self, follows: bool) {
        self.first_kex_packet_follows = follows;
    }

    /// Serializes the KEXINIT message (without packet framing).
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        write_name_list(&mut buf, &self.kex_algorithms);
        write_name_list(&mut buf, &self.server_host_key_algorithms);
        write_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        write_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        write_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        write_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        write_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        write_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        write_name_list(&mut buf, &self.languages_client_to_server);
        write_name_list(&mut buf, &self.languages_server_to_client);

        buf.put_u8(u8::from(self.first_kex_packet_follows));
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Protocol`] if the message is truncated, has the
    /// wrong type, or a name-list is malformed.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = WireReader::for_message(data, 20, "SSH_MSG_KEXINIT")?;

        if r.remaining() < 16 {
            return Err(StrandError::Protocol(format!(
                "KEXINIT message too short: {} bytes (minimum 17)",
                data.len()
            )));
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_raw(16)?);

        let kex_algorithms = r.read_name_list()?;
        let server_host_key_algorithms = r.read_name_list()?;
        let encryption_algorithms_client_to_server = r.read_name_list()?;
        let encryption_algorithms_server_to_client = r.read_name_list()?;
        let mac_algorithms_client_to_server = r.read_name_list()?;
        let mac_algorithms_server_to_client = r.read_name_list()?;
        let compression_algorithms_client_to_server = r.read_name_list()?;
        let compression_algorithms_server_to_client = r.read_name_list()?;
        let languages_client_to_server = r.read_name_list()?;
        let languages_server_to_client = r.read_name_list()?;
        let first_kex_packet_follows = r.read_bool()?;
        let _reserved = r.read_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        WireReader::for_message(data, 21, "SSH_MSG_NEWKEYS").map(|_| Self)
    }
}

/// Negotiates one algorithm category.
///
/// Returns the first entry of the client's list that also appears in the
/// server's list (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns [`StrandError::Protocol`] if no common algorithm is found.
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> StrandResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| {
            StrandError::Protocol(format!(
                "No common algorithm: client={:?}, server={:?}",
                client_list, server_list
            ))
        })
}

/// Role-aware negotiation: the responder passes its own list as `local` and
/// the lists are inverted so both peers converge on the same entry.
pub fn select_component(local: &[String], remote: &[String], is_client: bool) -> StrandResult<String> {
    if is_client {
        negotiate_algorithm(local, remote)
    } else {
        negotiate_algorithm(remote, local)
    }
}

/// Result of algorithm negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method.
    pub kex: String,
    /// Server host key algorithm.
    pub host_key: String,
    /// Cipher client to server.
    pub cipher_c2s: String,
    /// Cipher server to client.
    pub cipher_s2c: String,
    /// MAC client to server (`none` with AEAD ciphers).
    pub mac_c2s: String,
    /// MAC server to client (`none` with AEAD ciphers).
    pub mac_s2c: String,
    /// Compression client to server.
    pub compression_c2s: String,
    /// Compression server to client.
    pub compression_s2c: String,
}

impl NegotiatedAlgorithms {
    /// Negotiates every category from the local and remote KEXINIT.
    pub fn negotiate(local: &KexInit, remote: &KexInit, is_client: bool) -> StrandResult<Self> {
        let pick = |l: &[String], r: &[String], what: &str| {
            select_component(l, r, is_client).map_err(|_| {
                StrandError::Protocol(format!("No common {} algorithm: local={:?}, remote={:?}", what, l, r))
            })
        };

        let cipher_c2s = pick(
            &local.encryption_algorithms_client_to_server,
            &remote.encryption_algorithms_client_to_server,
            "cipher (client to server)",
        )?;
        let cipher_s2c = pick(
            &local.encryption_algorithms_server_to_client,
            &remote.encryption_algorithms_server_to_client,
            "cipher (server to client)",
        )?;

        let mac_for = |cipher: &str, l: &[String], r: &[String], what: &str| {
            if CipherAlgorithm::from_name(cipher).map_or(false, |c| c.is_aead()) {
                Ok("none".to_string())
            } else {
                pick(l, r, what)
            }
        };

        Ok(Self {
            kex: pick(&local.kex_algorithms, &remote.kex_algorithms, "kex")?,
            host_key: pick(
                &local.server_host_key_algorithms,
                &remote.server_host_key_algorithms,
                "host key",
            )?,
            mac_c2s: mac_for(
                &cipher_c2s,
                &local.mac_algorithms_client_to_server,
                &remote.mac_algorithms_client_to_server,
                "MAC (client to server)",
            )?,
            mac_s2c: mac_for(
                &cipher_s2c,
                &local.mac_algorithms_server_to_client,
                &remote.mac_algorithms_server_to_client,
                "MAC (server to client)",
            )?,
            compression_c2s: pick(
                &local.compression_algorithms_client_to_server,
                &remote.compression_algorithms_client_to_server,
                "compression (client to server)",
            )?,
            compression_s2c: pick(
                &local.compression_algorithms_server_to_client,
                &remote.compression_algorithms_server_to_client,
                "compression (server to client)",
            )?,
            cipher_c2s,
            cipher_s2c,
        })
    }

    /// True if the peer's guessed kex packet used the wrong method and must be
    /// ignored (RFC 4253 Section 7.1).
    pub fn guess_was_wrong(&self, remote: &KexInit) -> bool {
        remote.first_kex_packet_follows
            && (remote.kex_algorithms.first() != Some(&self.kex)
                || remote.server_host_key_algorithms.first() != Some(&self.host_key))
    }
}

/// Inputs a key exchange method needs from the transport.
#[derive(Clone)]
pub struct KexContext {
    /// True on the initiating (client) side.
    pub is_client: bool,
    /// Client identification without CR LF (V_C).
    pub client_ident: Vec<u8>,
    /// Server identification without CR LF (V_S).
    pub server_ident: Vec<u8>,
    /// Client KEXINIT payload (I_C).
    pub client_kexinit: Vec<u8>,
    /// Server KEXINIT payload (I_S).
    pub server_kexinit: Vec<u8>,
    /// Negotiated algorithms.
    pub negotiated: NegotiatedAlgorithms,
    /// Host key matching the negotiated algorithm (server side only).
    pub host_key: Option<Arc<dyn HostKey>>,
}

impl std::fmt::Debug for KexContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexContext")
            .field("is_client", &self.is_client)
            .field("negotiated", &self.negotiated)
            .field("has_host_key", &self.host_key.is_some())
            .finish_non_exhaustive()
    }
}

/// A key exchange method.
///
/// The transport calls [`init`](KeyExchange::init) once both KEXINIT messages
/// are known, then hands every key-exchange-method message (30-49) to
/// [`process`](KeyExchange::process) until [`is_complete`](KeyExchange::is_complete).
/// Messages to send are pushed onto `out` as complete payloads.
pub trait KeyExchange: Send {
    /// Method name as negotiated.
    fn name(&self) -> &str;

    /// Starts the exchange.
    fn init(&mut self, ctx: KexContext, out: &mut Vec<Vec<u8>>) -> StrandResult<()>;

    /// Processes one method message. Returns false if the message is not
    /// part of this method.
    fn process(&mut self, message: &[u8], out: &mut Vec<Vec<u8>>) -> StrandResult<bool>;

    /// True once the exchange hash and shared secret are known.
    fn is_complete(&self) -> bool;

    /// Server host key blob (K_S).
    fn host_key(&self) -> Option<&[u8]>;

    /// Signature blob over the exchange hash.
    fn signature(&self) -> Option<&[u8]>;

    /// Exchange hash (H).
    fn exchange_hash(&self) -> Option<&[u8]>;

    /// Shared secret (K) as an unsigned big-endian magnitude.
    fn shared_secret(&self) -> Option<&[u8]>;

    /// Derives key material for `letter` (RFC 4253 Section 7.2).
    ///
    /// The default uses SHA-256; methods with another hash override it.
    fn derive_key(&self, session_id: &[u8], letter: u8, len: usize) -> StrandResult<Vec<u8>> {
        match (self.shared_secret(), self.exchange_hash()) {
            (Some(k), Some(h)) => Ok(derive_key(k, h, session_id, letter, len)),
            _ => Err(StrandError::Protocol(
                "Key derivation before key exchange completed".to_string(),
            )),
        }
    }
}

type KexConstructor = Arc<dyn Fn() -> Box<dyn KeyExchange> + Send + Sync>;

/// Maps key exchange method names to constructors.
#[derive(Clone)]
pub struct KexRegistry {
    entries: HashMap<String, KexConstructor>,
}

impl KexRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers a constructor under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn KeyExchange> + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(constructor));
    }

    /// True if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn supported_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiates the method registered under `name`.
    pub fn create(&self, name: &str) -> StrandResult<Box<dyn KeyExchange>> {
        self.entries
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| {
                StrandError::Protocol(format!("Unsupported key exchange method: {}", name))
            })
    }
}

impl Default for KexRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("curve25519-sha256", || {
            Box::new(Curve25519Kex::new("curve25519-sha256"))
        });
        registry.register("curve25519-sha256@libssh.org", || {
            Box::new(Curve25519Kex::new("curve25519-sha256@libssh.org"))
        });
        registry.register("diffie-hellman-group14-sha256", || Box::new(DhGroup14Kex::new()));
        registry
    }
}

impl std::fmt::Debug for KexRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexRegistry")
            .field("methods", &self.supported_names())
            .finish()
    }
}
