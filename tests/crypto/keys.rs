use base64::{Engine, engine::general_purpose::STANDARD};

use scanguard::jwt::ClientKeyPair;

use crate::common::*;

fn algorithm_of(name: &str) -> SigningAlgorithm {
    ClientKeyPair::from_pem(fixture(name).as_bytes())
        .unwrap()
        .algorithm()
}

#[test]
fn test_algorithm_follows_key_type() {
    assert_eq!(algorithm_of("ec_p521.pem"), SigningAlgorithm::Es512);
    assert_eq!(algorithm_of("ec_p521_sec1.pem"), SigningAlgorithm::Es512);
    assert_eq!(algorithm_of("rsa_2048.pem"), SigningAlgorithm::Ps256);
}

#[test]
fn test_other_key_types_are_unsupported() {
    for name in ["ec_p256.pem", "ed25519.pem", "rsa_1024.pem"] {
        let result = ClientKeyPair::from_pem(fixture(name).as_bytes());
        assert!(
            matches!(result, Err(AppError::UnsupportedKeyType(_))),
            "{name} should be rejected"
        );
    }
}

#[test]
fn test_symmetric_secret_is_unsupported() {
    for secret in [&b"correct horse battery staple"[..], &[0u8, 159, 146, 150][..]] {
        assert!(matches!(
            ClientKeyPair::from_pem(secret),
            Err(AppError::UnsupportedKeyType(_))
        ));
    }
}

#[test]
fn test_base64_wrapped_pem_loads() {
    let encoded = STANDARD.encode(fixture("rsa_2048.pem"));
    let client = TrustTokenClient::load_from_base64_pem(KEY_ID, &encoded).unwrap();
    assert_eq!(client.algorithm(), SigningAlgorithm::Ps256);
    assert_eq!(client.key_id(), KEY_ID);

    assert!(matches!(
        TrustTokenClient::load_from_base64_pem(KEY_ID, "%%% not base64 %%%"),
        Err(AppError::InvalidKey(_))
    ));
}

#[test]
fn test_stored_key_must_match_recorded_algorithm() {
    let key = ClientKey {
        key_id: KEY_ID.to_string(),
        algorithm: SigningAlgorithm::Ps256,
        private_key: fixture("ec_p521.pem").into_bytes(),
        created_at: 0,
    };
    assert!(matches!(
        TrustTokenClient::from_client_key(&key),
        Err(AppError::InvalidKey(_))
    ));

    let key = ClientKey {
        algorithm: SigningAlgorithm::Es512,
        ..key
    };
    assert_eq!(
        TrustTokenClient::from_client_key(&key).unwrap().algorithm(),
        SigningAlgorithm::Es512
    );
}

#[test]
fn test_keypair_debug_hides_material() {
    let keypair = ClientKeyPair::from_pem(fixture("ec_p521.pem").as_bytes()).unwrap();
    assert_eq!(format!("{keypair:?}"), "ClientKeyPair(ES512)");
}
