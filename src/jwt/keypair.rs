//! Client private keys and the signature schemes derived from them.
//!
//! Only two key types are accepted: EC keys on P-521 (signing with ES512)
//! and RSA keys of at least 2048 bits (signing with PS256). Everything else,
//! including raw symmetric secrets, is rejected up front.

use base64::{Engine, engine::general_purpose::STANDARD};
use p521::ecdsa::{
    Signature as EcSignature, SigningKey as EcSigningKey, VerifyingKey as EcVerifyingKey,
};
use pkcs8::{DecodePrivateKey, ObjectIdentifier, PrivateKeyInfo, SecretDocument};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pss::{BlindedSigningKey, Signature as PssSignature, VerifyingKey as PssVerifyingKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{AppError, Result};
use crate::models::SigningAlgorithm;

const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_SECP521R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.35");

pub const MIN_RSA_BITS: usize = 2048;

pub struct EcKeyPair {
    pub(crate) secret: p521::SecretKey,
    signing: EcSigningKey,
    verifying: EcVerifyingKey,
}

pub struct RsaKeyPair {
    pub(crate) private: RsaPrivateKey,
    pub(crate) public: RsaPublicKey,
}

pub enum ClientKeyPair {
    Ec(EcKeyPair),
    Rsa(RsaKeyPair),
}

impl std::fmt::Debug for ClientKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientKeyPair({})", self.algorithm())
    }
}

impl ClientKeyPair {
    /// Parse a PEM private key and work out which algorithm it signs with.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(pem)
            .map_err(|_| AppError::UnsupportedKeyType("key material is not PEM text".into()))?;
        let (label, document) = SecretDocument::from_pem(text.trim()).map_err(|_| {
            AppError::UnsupportedKeyType(
                "key material is not a PEM private key (symmetric secrets are not accepted)"
                    .into(),
            )
        })?;

        match label {
            "PRIVATE KEY" => Self::from_pkcs8_der(document.as_bytes()),
            "EC PRIVATE KEY" => {
                let secret = p521::SecretKey::from_sec1_der(document.as_bytes()).map_err(|_| {
                    AppError::UnsupportedKeyType("EC key is not on curve P-521".into())
                })?;
                Self::ec(secret)
            }
            "RSA PRIVATE KEY" => {
                let key = RsaPrivateKey::from_pkcs1_der(document.as_bytes())
                    .map_err(|e| AppError::InvalidKey(format!("malformed RSA key: {}", e)))?;
                Self::rsa(key)
            }
            other => Err(AppError::UnsupportedKeyType(format!(
                "unsupported PEM block: {}",
                other
            ))),
        }
    }

    /// Same as [`ClientKeyPair::from_pem`] for PEM text that was base64-encoded once more.
    pub fn from_base64_pem(encoded: &str) -> Result<Self> {
        let pem = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AppError::InvalidKey(format!("key is not valid base64: {}", e)))?;
        Self::from_pem(&pem)
    }

    fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let info = PrivateKeyInfo::try_from(der)
            .map_err(|e| AppError::InvalidKey(format!("malformed PKCS#8 key: {}", e)))?;

        if info.algorithm.oid == OID_RSA_ENCRYPTION {
            let key = RsaPrivateKey::from_pkcs8_der(der)
                .map_err(|e| AppError::InvalidKey(format!("malformed RSA key: {}", e)))?;
            return Self::rsa(key);
        }

        if info.algorithm.oid == OID_EC_PUBLIC_KEY {
            let curve = info.algorithm.parameters_oid().ok();
            if curve != Some(OID_SECP521R1) {
                return Err(AppError::UnsupportedKeyType(
                    "EC key is not on curve P-521".into(),
                ));
            }
            let secret = p521::SecretKey::from_pkcs8_der(der)
                .map_err(|e| AppError::InvalidKey(format!("malformed EC key: {}", e)))?;
            return Self::ec(secret);
        }

        Err(AppError::UnsupportedKeyType(format!(
            "key algorithm {} is not EC or RSA",
            info.algorithm.oid
        )))
    }

    fn ec(secret: p521::SecretKey) -> Result<Self> {
        let signing = EcSigningKey::from_bytes(&secret.to_bytes())
            .map_err(|e| AppError::InvalidKey(format!("unusable EC key: {}", e)))?;
        let verifying = EcVerifyingKey::from(&signing);
        Ok(ClientKeyPair::Ec(EcKeyPair {
            secret,
            signing,
            verifying,
        }))
    }

    fn rsa(private: RsaPrivateKey) -> Result<Self> {
        let bits = private.size() * 8;
        if bits < MIN_RSA_BITS {
            return Err(AppError::UnsupportedKeyType(format!(
                "RSA key is {} bits, at least {} required",
                bits, MIN_RSA_BITS
            )));
        }
        let public = private.to_public_key();
        Ok(ClientKeyPair::Rsa(RsaKeyPair { private, public }))
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        match self {
            ClientKeyPair::Ec(_) => SigningAlgorithm::Es512,
            ClientKeyPair::Rsa(_) => SigningAlgorithm::Ps256,
        }
    }

    /// Sign `message`. ES512 signatures are the fixed-width `r || s` form.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match self {
            ClientKeyPair::Ec(ec) => {
                use p521::ecdsa::signature::Signer;
                let signature: EcSignature = ec
                    .signing
                    .try_sign(message)
                    .map_err(|e| AppError::Signing(e.to_string()))?;
                Ok(signature.to_bytes().to_vec())
            }
            ClientKeyPair::Rsa(rsa) => {
                use rsa::signature::{RandomizedSigner, SignatureEncoding};
                let signer = BlindedSigningKey::<Sha256>::new(rsa.private.clone());
                let signature = signer
                    .try_sign_with_rng(&mut rand::rngs::OsRng, message)
                    .map_err(|e| AppError::Signing(e.to_string()))?;
                Ok(signature.to_vec())
            }
        }
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            ClientKeyPair::Ec(ec) => {
                use p521::ecdsa::signature::Verifier;
                let signature = EcSignature::from_slice(signature)
                    .map_err(|_| AppError::Signature("malformed ES512 signature".into()))?;
                ec.verifying
                    .verify(message, &signature)
                    .map_err(|_| AppError::Signature("signature does not match".into()))
            }
            ClientKeyPair::Rsa(rsa) => {
                use rsa::signature::Verifier;
                let signature = PssSignature::try_from(signature)
                    .map_err(|_| AppError::Signature("malformed PS256 signature".into()))?;
                PssVerifyingKey::<Sha256>::new(rsa.public.clone())
                    .verify(message, &signature)
                    .map_err(|_| AppError::Signature("signature does not match".into()))
            }
        }
    }
}
