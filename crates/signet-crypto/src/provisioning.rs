//! Device-linking envelope cipher.
//!
//! The new device publishes an ephemeral public key. The primary device
//! encrypts the account identity to it with a fresh ephemeral pair of its
//! own: ECDH, then HKDF-SHA256 into an AES-256-CBC key and an HMAC-SHA256
//! key. The body is `version(1) || iv(16) || ciphertext || mac(32)`, and
//! the MAC is checked before anything is decrypted. Envelope and plaintext
//! are protobuf messages, wire compatible with Signal's `Provisioning.proto`.

use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use libsignal_protocol::{IdentityKey, IdentityKeyPair, KeyPair, PrivateKey, PublicKey};
use prost::Message;
use rand::rngs::OsRng;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use tracing::info;
use zeroize::{Zeroize, Zeroizing};

use crate::error::ProvisioningError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const PROVISIONING_VERSION: u8 = 1;
const PROVISIONING_INFO: &[u8] = b"TextSecure Provisioning Message";
const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;
const KEY_LEN: usize = 32;

/// What travels over the linking relay.
#[derive(Clone, PartialEq, Message)]
pub struct ProvisionEnvelope {
    /// Sender's ephemeral public key, serialized with its type byte.
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
}

impl ProvisionEnvelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProvisioningError> {
        Ok(Self::decode(bytes)?)
    }
}

/// Plaintext of an envelope: the account identity plus linking metadata.
#[derive(Clone, PartialEq, Message)]
#[prost(skip_debug)]
pub struct ProvisionMessage {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub identity_key_public: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub identity_key_private: Option<Vec<u8>>,
    #[prost(string, optional, tag = "3")]
    pub number: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub provisioning_code: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub user_agent: Option<String>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub profile_key: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "7")]
    pub read_receipts: Option<bool>,
    #[prost(string, optional, tag = "8")]
    pub uuid: Option<String>,
}

impl ProvisionMessage {
    /// A message carrying `identity`. Metadata starts empty.
    pub fn for_identity(identity: &IdentityKeyPair) -> Self {
        let mut message = Self::default();
        message.identity_key_public = Some(identity.public_key().serialize().to_vec());
        message.identity_key_private = Some(identity.private_key().serialize().to_vec());
        message
    }
}

impl fmt::Debug for ProvisionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionMessage")
            .field("number", &self.number)
            .field("uuid", &self.uuid)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl Drop for ProvisionMessage {
    fn drop(&mut self) {
        if let Some(private) = self.identity_key_private.as_mut() {
            private.zeroize();
        }
        if let Some(profile_key) = self.profile_key.as_mut() {
            profile_key.zeroize();
        }
    }
}

/// A decrypted envelope with the identity rebuilt.
pub struct ProvisionDecryptResult {
    pub identity_key_pair: IdentityKeyPair,
    pub number: Option<String>,
    pub uuid: Option<String>,
    pub provisioning_code: Option<String>,
    pub user_agent: Option<String>,
    pub read_receipts: bool,
    pub profile_key: Option<Vec<u8>>,
}

/// Cipher keys for one envelope.
struct EnvelopeKeys {
    cipher_key: Zeroizing<[u8; KEY_LEN]>,
    mac_key: Zeroizing<[u8; KEY_LEN]>,
}

impl EnvelopeKeys {
    fn derive(own: &KeyPair, their_public: &PublicKey) -> Result<Self, ProvisioningError> {
        let shared = Zeroizing::new(own.calculate_agreement(their_public)?.into_vec());
        let hkdf = Hkdf::<Sha256>::new(None, &shared);
        let mut okm = Zeroizing::new([0u8; 2 * KEY_LEN]);
        hkdf.expand(PROVISIONING_INFO, &mut *okm)
            .map_err(|_| ProvisioningError::KeyDerivation)?;

        let mut cipher_key = Zeroizing::new([0u8; KEY_LEN]);
        let mut mac_key = Zeroizing::new([0u8; KEY_LEN]);
        cipher_key.copy_from_slice(&okm[..KEY_LEN]);
        mac_key.copy_from_slice(&okm[KEY_LEN..]);
        Ok(Self {
            cipher_key,
            mac_key,
        })
    }

    fn mac(&self) -> Result<HmacSha256, ProvisioningError> {
        <HmacSha256 as Mac>::new_from_slice(&*self.mac_key)
            .map_err(|_| ProvisioningError::KeyDerivation)
    }
}

/// One side of a linking attempt. Holds a single ephemeral key pair,
/// generated on first use.
#[derive(Default)]
pub struct ProvisioningCipher {
    key_pair: Option<KeyPair>,
}

impl ProvisioningCipher {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_pair(&mut self) -> &KeyPair {
        self.key_pair
            .get_or_insert_with(|| KeyPair::generate(&mut OsRng))
    }

    pub fn public_key(&mut self) -> PublicKey {
        self.key_pair().public_key
    }

    pub fn private_key(&mut self) -> PrivateKey {
        self.key_pair().private_key
    }

    /// Open an envelope addressed to this cipher's public key.
    pub fn decrypt(
        &self,
        envelope: &ProvisionEnvelope,
    ) -> Result<ProvisionDecryptResult, ProvisioningError> {
        let body = envelope.body.as_slice();
        let Some(&version) = body.first() else {
            return Err(ProvisioningError::Truncated(0));
        };
        if version != PROVISIONING_VERSION {
            return Err(ProvisioningError::BadVersion(version));
        }
        if body.len() < 1 + IV_LEN + MAC_LEN {
            return Err(ProvisioningError::Truncated(body.len()));
        }
        let key_pair = self.key_pair.as_ref().ok_or(ProvisioningError::MissingKeyPair)?;

        let (signed, their_mac) = body.split_at(body.len() - MAC_LEN);
        let iv = &signed[1..1 + IV_LEN];
        let ciphertext = &signed[1 + IV_LEN..];

        let their_public = PublicKey::deserialize(&envelope.public_key)?;
        let keys = EnvelopeKeys::derive(key_pair, &their_public)?;

        let mut mac = keys.mac()?;
        mac.update(signed);
        mac.verify_slice(their_mac)
            .map_err(|_| ProvisioningError::MacMismatch)?;

        let plaintext = Zeroizing::new(
            Aes256CbcDec::new_from_slices(&*keys.cipher_key, iv)
                .map_err(|_| ProvisioningError::KeyDerivation)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| ProvisioningError::Decrypt)?,
        );
        let message = ProvisionMessage::decode(plaintext.as_slice())?;

        // The public half is always derived, whatever the sender included.
        let private = message
            .identity_key_private
            .as_deref()
            .ok_or(ProvisioningError::MissingIdentity)?;
        let private = PrivateKey::deserialize(private)?;
        let public = private.public_key()?;
        info!(
            has_number = message.number.is_some(),
            has_uuid = message.uuid.is_some(),
            "provisioning envelope decrypted"
        );
        Ok(ProvisionDecryptResult {
            identity_key_pair: IdentityKeyPair::new(IdentityKey::new(public), private),
            number: message.number.clone(),
            uuid: message.uuid.clone(),
            provisioning_code: message.provisioning_code.clone(),
            user_agent: message.user_agent.clone(),
            read_receipts: message.read_receipts.unwrap_or(false),
            profile_key: message.profile_key.clone(),
        })
    }

    /// Seal `message` for the device that published `their_public`.
    pub fn encrypt(
        &mut self,
        message: &ProvisionMessage,
        their_public: &PublicKey,
    ) -> Result<ProvisionEnvelope, ProvisioningError> {
        let plaintext = Zeroizing::new(message.encode_to_vec());
        self.seal(&plaintext, their_public)
    }

    fn seal(
        &mut self,
        plaintext: &[u8],
        their_public: &PublicKey,
    ) -> Result<ProvisionEnvelope, ProvisioningError> {
        let key_pair = *self.key_pair();
        let keys = EnvelopeKeys::derive(&key_pair, their_public)?;

        let mut iv = [0u8; IV_LEN];
        SystemRandom::new()
            .fill(&mut iv)
            .map_err(|_| ProvisioningError::Rng)?;

        let ciphertext = Aes256CbcEnc::new_from_slices(&*keys.cipher_key, &iv)
            .map_err(|_| ProvisioningError::KeyDerivation)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut body = Vec::with_capacity(1 + IV_LEN + ciphertext.len() + MAC_LEN);
        body.push(PROVISIONING_VERSION);
        body.extend_from_slice(&iv);
        body.extend_from_slice(&ciphertext);

        let mut mac = keys.mac()?;
        mac.update(&body);
        body.extend_from_slice(&mac.finalize().into_bytes());

        Ok(ProvisionEnvelope {
            public_key: key_pair.public_key.serialize().to_vec(),
            body,
        })
    }
}
