mod client;
mod encoder;
pub mod envelope;
mod issuer;
mod keypair;

pub use client::TrustTokenClient;
pub use encoder::{TOKEN_TYPE, TokenHeader, encode_token, issue_token};
pub use issuer::{RegisteredClientKey, TokenIssuer};
pub use keypair::{ClientKeyPair, MIN_RSA_BITS};
