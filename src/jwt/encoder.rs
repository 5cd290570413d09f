//! Compact JWS encoding where the signature comes from a key management service.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::kms::KeyManagementService;
use crate::models::SigningAlgorithm;

pub const TOKEN_TYPE: &str = "JWT";

/// JOSE header. Field order is the serialized order: `kid`, `alg`, `typ`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    #[serde(default)]
    pub kid: String,
    #[serde(default)]
    pub alg: String,
    #[serde(default)]
    pub typ: String,
}

impl TokenHeader {
    pub fn new(kid: impl Into<String>, alg: SigningAlgorithm) -> Self {
        Self {
            kid: kid.into(),
            alg: alg.to_string(),
            typ: TOKEN_TYPE.to_string(),
        }
    }

    fn validate(&self) -> Result<SigningAlgorithm> {
        if self.kid.is_empty() {
            return Err(AppError::IncompleteToken("kid"));
        }
        if self.alg.is_empty() {
            return Err(AppError::IncompleteToken("alg"));
        }
        if self.typ.is_empty() {
            return Err(AppError::IncompleteToken("typ"));
        }
        self.alg
            .parse()
            .map_err(|_| AppError::Signing(format!("unsupported algorithm {}", self.alg)))
    }
}

pub(crate) fn b64_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?))
}

/// Encode `header` and `claims` and have `kms` sign them under `header.kid`.
///
/// Claims are serialized in insertion order with no time claims added, and
/// must already carry a numeric `exp`.
pub async fn encode_token(
    header: &TokenHeader,
    claims: &Map<String, Value>,
    kms: &dyn KeyManagementService,
) -> Result<String> {
    let algorithm = header.validate()?;
    if !claims.get("exp").is_some_and(Value::is_number) {
        return Err(AppError::IncompleteToken("exp"));
    }

    let signing_input = format!("{}.{}", b64_json(header)?, b64_json(claims)?);
    let signature = kms
        .sign(&header.kid, signing_input.as_bytes(), algorithm)
        .await?;

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// Add `exp` and `iat` to `claims` and encode them.
pub async fn issue_token(
    kms: &dyn KeyManagementService,
    key_id: &str,
    algorithm: SigningAlgorithm,
    mut claims: Map<String, Value>,
    expiration: DateTime<Utc>,
    issued_at: DateTime<Utc>,
) -> Result<String> {
    claims.insert("exp".into(), Value::from(expiration.timestamp()));
    claims.insert("iat".into(), Value::from(issued_at.timestamp()));
    encode_token(&TokenHeader::new(key_id, algorithm), &claims, kms).await
}

/// Split a compact token into its decoded parts.
pub(crate) struct DecodedToken<'a> {
    pub header: TokenHeader,
    pub claims: Map<String, Value>,
    pub signing_input: &'a str,
    pub signature: Vec<u8>,
}

pub(crate) fn decode(token: &str) -> Result<DecodedToken<'_>> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header_b64, claims_b64, signature_b64] = parts.as_slice() else {
        return Err(AppError::Signature(format!(
            "expected 3 segments, got {}",
            parts.len()
        )));
    };

    let segment = |name: &str, value: &str| {
        URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|_| AppError::Signature(format!("{} segment is not base64url", name)))
    };

    let header: TokenHeader = serde_json::from_slice(&segment("header", header_b64)?)
        .map_err(|_| AppError::Signature("header is not a JSON object".into()))?;
    let claims: Map<String, Value> = serde_json::from_slice(&segment("claims", claims_b64)?)
        .map_err(|_| AppError::Signature("claims are not a JSON object".into()))?;
    let signature = segment("signature", signature_b64)?;

    Ok(DecodedToken {
        header,
        claims,
        signing_input: &token[..header_b64.len() + 1 + claims_b64.len()],
        signature,
    })
}
