use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Token signing algorithm, derived from the client key type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
pub enum SigningAlgorithm {
    /// ECDSA over P-521 with SHA-512
    #[serde(rename = "ES512")]
    #[strum(serialize = "ES512")]
    Es512,
    /// RSASSA-PSS with SHA-256
    #[serde(rename = "PS256")]
    #[strum(serialize = "PS256")]
    Ps256,
}

/// The tenant's identity credential toward the License Manager.
///
/// `private_key` holds the decrypted PEM; it is only ever populated in memory.
#[derive(Clone)]
pub struct ClientKey {
    pub key_id: String,
    pub algorithm: SigningAlgorithm,
    pub private_key: Vec<u8>,
    pub created_at: i64,
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("private_key", &"[redacted]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Input for registering a client key.
#[derive(Debug, Deserialize)]
pub struct CreateClientKey {
    pub key_id: String,
    pub algorithm: SigningAlgorithm,
    /// PEM text, or base64-encoded PEM when `b64_encoded` is set
    pub private_key: String,
    #[serde(default)]
    pub b64_encoded: bool,
}

/// Describe view of a client key (never includes the private key).
#[derive(Debug, Clone, Serialize)]
pub struct ClientKeyInfo {
    pub key_id: String,
    pub algorithm: SigningAlgorithm,
    pub created_at: i64,
}

