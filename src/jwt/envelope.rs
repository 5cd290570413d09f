//! Public-key encryption of small payloads, in compact JWE form.
//!
//! `header.encrypted_key.iv.ciphertext.tag`, all base64url without padding.
//! EC keys use ECDH-ES on P-521 (empty encrypted key), RSA keys wrap a random
//! content key with RSA-OAEP-256. Content is always AES-256-GCM with the
//! encoded header as additional data.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hkdf::Hkdf;
use p521::elliptic_curve::sec1::ToEncodedPoint;
use rand::{RngCore, rngs::OsRng};
use rsa::Oaep;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{AppError, Result};

use super::encoder::b64_json;
use super::keypair::ClientKeyPair;

const ALG_ECDH_ES: &str = "ECDH-ES";
const ALG_RSA_OAEP_256: &str = "RSA-OAEP-256";
const ENC_A256GCM: &str = "A256GCM";
const CURVE: &str = "P-521";
const IV_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeHeader {
    alg: String,
    enc: String,
    kid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    epk: Option<EphemeralKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EphemeralKey {
    kty: String,
    crv: String,
    x: String,
    y: String,
}

impl EphemeralKey {
    fn from_public(key: &p521::PublicKey) -> Result<Self> {
        let point = key.to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(AppError::Encryption("ephemeral key is the identity".into()));
        };
        Ok(Self {
            kty: "EC".into(),
            crv: CURVE.into(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
        })
    }

    fn to_public(&self) -> Result<p521::PublicKey> {
        if self.kty != "EC" || self.crv != CURVE {
            return Err(AppError::Encryption(format!(
                "unsupported ephemeral key {}/{}",
                self.kty, self.crv
            )));
        }
        let mut sec1 = vec![0x04];
        sec1.extend(decode_segment("epk.x", &self.x)?);
        sec1.extend(decode_segment("epk.y", &self.y)?);
        p521::PublicKey::from_sec1_bytes(&sec1)
            .map_err(|_| AppError::Encryption("ephemeral key is not on P-521".into()))
    }
}

fn decode_segment(name: &str, value: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| AppError::Encryption(format!("{} is not base64url", name)))
}

fn derive_content_key(shared_secret: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let mut key = [0u8; KEY_SIZE];
    Hkdf::<Sha256>::new(None, shared_secret)
        .expand(ENC_A256GCM.as_bytes(), &mut key)
        .map_err(|e| AppError::Encryption(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

/// Encrypt `plaintext` to the public half of `keypair`.
pub fn seal(keypair: &ClientKeyPair, key_id: &str, plaintext: &[u8]) -> Result<String> {
    let (header, encrypted_key, content_key) = match keypair {
        ClientKeyPair::Ec(ec) => {
            let ephemeral = p521::ecdh::EphemeralSecret::random(&mut OsRng);
            let shared = ephemeral.diffie_hellman(&ec.secret.public_key());
            let header = EnvelopeHeader {
                alg: ALG_ECDH_ES.into(),
                enc: ENC_A256GCM.into(),
                kid: key_id.into(),
                epk: Some(EphemeralKey::from_public(&ephemeral.public_key())?),
            };
            let content_key = derive_content_key(shared.raw_secret_bytes().as_slice())?;
            (header, Vec::new(), content_key)
        }
        ClientKeyPair::Rsa(rsa) => {
            let mut content_key = [0u8; KEY_SIZE];
            OsRng.fill_bytes(&mut content_key);
            let wrapped = rsa
                .public
                .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &content_key)
                .map_err(|e| AppError::Encryption(format!("key wrap failed: {}", e)))?;
            let header = EnvelopeHeader {
                alg: ALG_RSA_OAEP_256.into(),
                enc: ENC_A256GCM.into(),
                kid: key_id.into(),
                epk: None,
            };
            (header, wrapped, content_key)
        }
    };

    let header_b64 = b64_json(&header)?;
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new_from_slice(&content_key)
        .map_err(|e| AppError::Encryption(e.to_string()))?;
    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: header_b64.as_bytes(),
            },
        )
        .map_err(|e| AppError::Encryption(e.to_string()))?;
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok([
        header_b64,
        URL_SAFE_NO_PAD.encode(encrypted_key),
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(sealed),
        URL_SAFE_NO_PAD.encode(tag),
    ]
    .join("."))
}

/// Decrypt an envelope produced by [`seal`] for the same key.
pub fn open(keypair: &ClientKeyPair, key_id: &str, envelope: &str) -> Result<Vec<u8>> {
    let parts: Vec<&str> = envelope.split('.').collect();
    let [header_b64, encrypted_key, iv, ciphertext, tag] = parts.as_slice() else {
        return Err(AppError::Encryption(format!(
            "expected 5 segments, got {}",
            parts.len()
        )));
    };

    let header: EnvelopeHeader = serde_json::from_slice(&decode_segment("header", header_b64)?)
        .map_err(|_| AppError::Encryption("header is not a JSON object".into()))?;
    if header.kid != key_id {
        return Err(AppError::Encryption(format!(
            "envelope is for key {}, not {}",
            header.kid, key_id
        )));
    }
    if header.enc != ENC_A256GCM {
        return Err(AppError::Encryption(format!(
            "unsupported content encryption {}",
            header.enc
        )));
    }

    let content_key = match (keypair, header.alg.as_str()) {
        (ClientKeyPair::Ec(ec), ALG_ECDH_ES) => {
            let epk = header
                .epk
                .as_ref()
                .ok_or_else(|| AppError::Encryption("missing ephemeral key".into()))?
                .to_public()?;
            let shared =
                p521::ecdh::diffie_hellman(ec.secret.to_nonzero_scalar(), epk.as_affine());
            derive_content_key(shared.raw_secret_bytes().as_slice())?
        }
        (ClientKeyPair::Rsa(rsa), ALG_RSA_OAEP_256) => {
            let unwrapped = rsa
                .private
                .decrypt(Oaep::new::<Sha256>(), &decode_segment("encrypted key", encrypted_key)?)
                .map_err(|_| AppError::Encryption("key unwrap failed".into()))?;
            unwrapped
                .try_into()
                .map_err(|_| AppError::Encryption("content key has the wrong length".into()))?
        }
        (_, alg) => {
            return Err(AppError::Encryption(format!(
                "key cannot decrypt {} envelopes",
                alg
            )));
        }
    };

    let iv = decode_segment("iv", iv)?;
    if iv.len() != IV_SIZE {
        return Err(AppError::Encryption("iv has the wrong length".into()));
    }
    let mut sealed = decode_segment("ciphertext", ciphertext)?;
    sealed.extend(decode_segment("tag", tag)?);

    Aes256Gcm::new_from_slice(&content_key)
        .map_err(|e| AppError::Encryption(e.to_string()))?
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &sealed,
                aad: header_b64.as_bytes(),
            },
        )
        .map_err(|_| AppError::Encryption("decryption failed".into()))
}
