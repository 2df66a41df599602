//! Cryptographic primitives for coweave.
//!
//! Everything above this module talks to cryptography through the
//! [`CryptoProvider`] trait, so nodes can be built against a different
//! backend. [`SoftwareCrypto`] is the default implementation:
//!
//! - Ed25519 signatures (`ed25519-dalek`)
//! - X25519 sealing with an ephemeral sender key (`x25519-dalek`)
//! - ChaCha20-Poly1305 symmetric encryption (`chacha20poly1305`)
//! - Blake3 for ids, chain hashes, nonce and key derivation

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{CoreError, Result};

/// Visitor accepting either a CBOR byte string or a sequence of `u8`
/// (which is what JSON produces) of exactly `N` bytes.
pub(crate) struct FixedBytesVisitor<const N: usize>;

impl<'de, const N: usize> Visitor<'de> for FixedBytesVisitor<N> {
    type Value = [u8; N];

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", N)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
        v.try_into()
            .map_err(|_| E::invalid_length(v.len(), &self))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
        let mut out = [0u8; N];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        if seq.next_element::<u8>()?.is_some() {
            return Err(de::Error::invalid_length(N + 1, &self));
        }
        Ok(out)
    }
}

macro_rules! impl_byte_serde {
    ($name:ident, $len:expr) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
                d.deserialize_bytes(FixedBytesVisitor::<$len>).map(Self)
            }
        }
    };
}

macro_rules! byte_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Convert to hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from hex string.
            pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                let arr: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(arr))
            }

            pub const ZERO: Self = Self([0u8; $len]);
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), &self.to_hex()[..16])
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl_byte_serde!($name, $len);
    };
}

macro_rules! secret_newtype {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(pub(crate) [u8; 32]);

        impl $name {
            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes (secret key material).
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!($label, "(..)"))
            }
        }

        impl_byte_serde!($name, 32);
    };
}

byte_newtype!(
    /// A 32-byte Blake3 hash. Used for CoValue ids and session chain hashes.
    Hash,
    32,
    "Hash"
);
byte_newtype!(
    /// An Ed25519 verifying key.
    SignerID,
    32,
    "SignerID"
);
byte_newtype!(
    /// An X25519 public key.
    SealerID,
    32,
    "SealerID"
);
byte_newtype!(
    /// A 64-byte Ed25519 signature.
    Signature,
    64,
    "Signature"
);
byte_newtype!(
    /// Identifies a symmetric read key. Random, not derived from the key.
    KeyID,
    16,
    "KeyID"
);

secret_newtype!(
    /// Ed25519 signing key seed.
    SignerSecret,
    "SignerSecret"
);
secret_newtype!(
    /// X25519 static secret.
    SealerSecret,
    "SealerSecret"
);
secret_newtype!(
    /// ChaCha20-Poly1305 key.
    KeySecret,
    "KeySecret"
);

/// Public identity of an agent: a signing key and a sealing key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentID {
    pub signer: SignerID,
    pub sealer: SealerID,
}

impl AgentID {
    pub const PREFIX: &'static str = "agent_";
}

impl fmt::Display for AgentID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", Self::PREFIX, self.signer.to_hex(), self.sealer.to_hex())
    }
}

impl fmt::Debug for AgentID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentID({})", &self.signer.to_hex()[..16])
    }
}

impl FromStr for AgentID {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::MalformedId(s.to_string()))?;
        if body.len() != 128 || !body.is_ascii() {
            return Err(CoreError::MalformedId(s.to_string()));
        }
        let (signer, sealer) = body.split_at(64);
        Ok(Self {
            signer: SignerID::from_hex(signer).map_err(|_| CoreError::MalformedId(s.to_string()))?,
            sealer: SealerID::from_hex(sealer).map_err(|_| CoreError::MalformedId(s.to_string()))?,
        })
    }
}

/// Secret half of an agent.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AgentSecret {
    pub signer: SignerSecret,
    pub sealer: SealerSecret,
}

/// A symmetric read key together with its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadKey {
    pub id: KeyID,
    pub secret: KeySecret,
}

/// Serializes a displayable id as its string form and parses it back.
pub(crate) struct StrVisitor<T>(pub(crate) PhantomData<T>);

impl<'de, T: FromStr> Visitor<'de> for StrVisitor<T>
where
    T::Err: fmt::Display,
{
    type Value = T;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an id string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<T, E> {
        v.parse().map_err(E::custom)
    }
}

macro_rules! impl_string_serde {
    ($name:ty) => {
        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                d: D,
            ) -> std::result::Result<Self, D::Error> {
                d.deserialize_str($crate::crypto::StrVisitor(std::marker::PhantomData))
            }
        }
    };
}
pub(crate) use impl_string_serde;

impl_string_serde!(AgentID);

/// Cryptographic backend used by every coweave component.
///
/// Nonce material is any byte string that uniquely identifies the thing being
/// encrypted; the provider derives the actual nonce from it.
pub trait CryptoProvider: Send + Sync + fmt::Debug {
    /// Fill a fresh buffer with random bytes.
    fn random_bytes(&self, len: usize) -> Vec<u8>;

    /// Derive an agent secret deterministically from a 32-byte seed.
    fn agent_secret_from_seed(&self, seed: &[u8; 32]) -> AgentSecret;

    /// Public identity of an agent secret.
    fn agent_id(&self, secret: &AgentSecret) -> AgentID;

    fn sign(&self, secret: &SignerSecret, message: &[u8]) -> Signature;

    fn verify(&self, signer: &SignerID, message: &[u8], signature: &Signature) -> Result<()>;

    /// Encrypt `message` so only the holder of `to`'s secret can read it.
    fn seal(&self, to: &SealerID, message: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>>;

    fn unseal(&self, secret: &SealerSecret, sealed: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>>;

    fn new_read_key(&self) -> ReadKey;

    fn encrypt(&self, key: &KeySecret, plaintext: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, key: &KeySecret, ciphertext: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>>;

    fn secure_hash(&self, data: &[u8]) -> Hash;

    /// One step of a session's hash chain: H(prev || data).
    fn chain_hash(&self, prev: &Hash, data: &[u8]) -> Hash;

    /// A fresh 32-byte seed.
    fn new_seed(&self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&self.random_bytes(32));
        seed
    }

    fn new_agent_secret(&self) -> AgentSecret {
        self.agent_secret_from_seed(&self.new_seed())
    }

    /// Random suffix distinguishing sessions of the same agent.
    fn session_suffix(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.random_bytes(8));
        u64::from_le_bytes(buf)
    }
}

/// Software implementation of [`CryptoProvider`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareCrypto;

impl SoftwareCrypto {
    pub fn new() -> Self {
        Self
    }
}

fn nonce_for(material: &[u8]) -> [u8; 12] {
    let derived = blake3::derive_key("coweave nonce v0", material);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&derived[..12]);
    nonce
}

fn seal_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key("coweave seal v0");
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    *hasher.finalize().as_bytes()
}

fn aead_encrypt(key: &[u8; 32], plaintext: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CoreError::CryptoFailure(e.to_string()))?;
    let nonce = nonce_for(nonce_material);
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CoreError::CryptoFailure(e.to_string()))
}

fn aead_decrypt(key: &[u8; 32], ciphertext: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CoreError::CryptoFailure(e.to_string()))?;
    let nonce = nonce_for(nonce_material);
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|e| CoreError::CryptoFailure(e.to_string()))
}

impl CryptoProvider for SoftwareCrypto {
    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    fn agent_secret_from_seed(&self, seed: &[u8; 32]) -> AgentSecret {
        AgentSecret {
            signer: SignerSecret(blake3::derive_key("coweave agent signer v0", seed)),
            sealer: SealerSecret(blake3::derive_key("coweave agent sealer v0", seed)),
        }
    }

    fn agent_id(&self, secret: &AgentSecret) -> AgentID {
        let signer = SigningKey::from_bytes(&secret.signer.0).verifying_key();
        let sealer = PublicKey::from(&StaticSecret::from(secret.sealer.0));
        AgentID {
            signer: SignerID(signer.to_bytes()),
            sealer: SealerID(sealer.to_bytes()),
        }
    }

    fn sign(&self, secret: &SignerSecret, message: &[u8]) -> Signature {
        let key = SigningKey::from_bytes(&secret.0);
        Signature(key.sign(message).to_bytes())
    }

    fn verify(&self, signer: &SignerID, message: &[u8], signature: &Signature) -> Result<()> {
        let key = VerifyingKey::from_bytes(&signer.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }

    fn seal(&self, to: &SealerID, message: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>> {
        let mut eph = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut eph);
        let eph_secret = StaticSecret::from(eph);
        let eph_public = PublicKey::from(&eph_secret);

        let shared = eph_secret.diffie_hellman(&PublicKey::from(to.0));
        let wrap_key = seal_key(shared.as_bytes(), eph_public.as_bytes(), &to.0);
        let ciphertext = aead_encrypt(&wrap_key, message, nonce_material)?;

        let mut out = Vec::with_capacity(32 + ciphertext.len());
        out.extend_from_slice(eph_public.as_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unseal(&self, secret: &SealerSecret, sealed: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < 32 {
            return Err(CoreError::CryptoFailure("sealed value too short".into()));
        }
        let (eph, ciphertext) = sealed.split_at(32);
        let mut eph_public = [0u8; 32];
        eph_public.copy_from_slice(eph);

        let own_secret = StaticSecret::from(secret.0);
        let own_public = PublicKey::from(&own_secret);
        let shared = own_secret.diffie_hellman(&PublicKey::from(eph_public));
        let wrap_key = seal_key(shared.as_bytes(), &eph_public, own_public.as_bytes());
        aead_decrypt(&wrap_key, ciphertext, nonce_material)
    }

    fn new_read_key(&self) -> ReadKey {
        let mut id = [0u8; 16];
        let mut secret = [0u8; 32];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut id);
        rng.fill_bytes(&mut secret);
        ReadKey {
            id: KeyID(id),
            secret: KeySecret(secret),
        }
    }

    fn encrypt(&self, key: &KeySecret, plaintext: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>> {
        aead_encrypt(&key.0, plaintext, nonce_material)
    }

    fn decrypt(&self, key: &KeySecret, ciphertext: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>> {
        aead_decrypt(&key.0, ciphertext, nonce_material)
    }

    fn secure_hash(&self, data: &[u8]) -> Hash {
        Hash(*blake3::hash(data).as_bytes())
    }

    fn chain_hash(&self, prev: &Hash, data: &[u8]) -> Hash {
        let mut hasher = blake3::Hasher::new_derive_key("coweave chain v0");
        hasher.update(&prev.0);
        hasher.update(data);
        Hash(*hasher.finalize().as_bytes())
    }
}
