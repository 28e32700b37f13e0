//! Cryptographic primitives of the Miniserver handshake.
//!
//! The Miniserver hands out a per-user salt and HMAC key; credentials never
//! travel in the clear. A per-connection AES session key is generated locally
//! and shipped RSA-encrypted during key exchange. The encrypted command
//! channel itself is not implemented, so the session key is write-only here.

use crate::error::{LoxoneError, Result};
use crate::message::PubKeyInfo;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::sha2::Sha256 as OaepSha256;
use rsa::{BigUint, Oaep, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Digest algorithm announced by `getkey2` / `getvisusalt`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlg {
    #[default]
    Sha1,
    Sha256,
}

impl HashAlg {
    /// Older firmware omits the algorithm and means SHA1.
    pub fn parse(name: Option<&str>) -> Result<Self> {
        match name {
            None | Some("SHA1") => Ok(HashAlg::Sha1),
            Some("SHA256") => Ok(HashAlg::Sha256),
            Some(other) => Err(LoxoneError::crypto(format!(
                "Unsupported hash algorithm: {other}"
            ))),
        }
    }
}

/// Upper-case hex digest of `password:salt`.
pub fn password_hash(password: &str, salt: &str, alg: HashAlg) -> String {
    let input = format!("{password}:{salt}");
    let digest = match alg {
        HashAlg::Sha1 => hex::encode(Sha1::digest(input.as_bytes())),
        HashAlg::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
    };
    digest.to_uppercase()
}

fn keyed_hash(key_hex: &str, message: &str, alg: HashAlg) -> Result<String> {
    let key = hex::decode(key_hex)
        .map_err(|e| LoxoneError::crypto(format!("Invalid HMAC key: {e}")))?;
    let mac = match alg {
        HashAlg::Sha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(&key)
                .map_err(|e| LoxoneError::crypto(format!("Invalid HMAC key length: {e}")))?;
            mac.update(message.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        HashAlg::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(&key)
                .map_err(|e| LoxoneError::crypto(format!("Invalid HMAC key length: {e}")))?;
            mac.update(message.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
    };
    Ok(hex::encode(mac))
}

/// Credential hash sent with `gettoken` and `authwithvisuhash`:
/// HMAC over `user:passwordHash` with the server-issued key.
pub fn credentials_hash(
    key_hex: &str,
    user: &str,
    password_hash: &str,
    alg: HashAlg,
) -> Result<String> {
    keyed_hash(key_hex, &format!("{user}:{password_hash}"), alg)
}

/// Token hash sent with `authwithtoken`: HMAC over the bare token.
pub fn token_hash(key_hex: &str, token: &str, alg: HashAlg) -> Result<String> {
    keyed_hash(key_hex, token, alg)
}

/// Per-connection AES session key and IV, generated fresh on every key exchange.
pub struct SessionKey {
    key: [u8; 32],
    iv: [u8; 16],
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// `base64(RSA(keyhex:ivhex))` payload of the key-exchange command.
    pub fn exchange_payload(&self, public_key: &RsaPublicKey) -> Result<String> {
        let plain = format!("{}:{}", hex::encode(self.key), hex::encode(self.iv));
        let padding = Oaep::new::<OaepSha256>();
        let encrypted = public_key
            .encrypt(&mut OsRng, padding, plain.as_bytes())
            .map_err(|e| LoxoneError::crypto(format!("RSA encryption failed: {e}")))?;
        Ok(general_purpose::STANDARD.encode(encrypted))
    }
}

/// Rebuild the server's RSA public key from its base64 modulus and exponent.
pub fn public_key_from_parts(info: &PubKeyInfo) -> Result<RsaPublicKey> {
    let n = general_purpose::STANDARD
        .decode(&info.n)
        .map_err(|e| LoxoneError::crypto(format!("Invalid key modulus: {e}")))?;
    let e = general_purpose::STANDARD
        .decode(&info.e)
        .map_err(|e| LoxoneError::crypto(format!("Invalid key exponent: {e}")))?;

    RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
        .map_err(|e| LoxoneError::crypto(format!("Invalid RSA key: {e}")))
}
