use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Duration;
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use scanguard::jwt::ClientKeyPair;
use scanguard::kms::{KeyManagementService, RemoteKms};

use crate::common::*;

/// Mount a signer that holds the EC fixture key under `KEY_ID`.
async fn signing_server() -> MockServer {
    let server = MockServer::start().await;
    let keypair = Arc::new(ClientKeyPair::from_pem(fixture("ec_p521.pem").as_bytes()).unwrap());

    Mock::given(method("POST"))
        .and(path(format!("/keys/{KEY_ID}/sign")))
        .and(body_partial_json(json!({ "algorithm": "ES512" })))
        .respond_with(move |request: &Request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            let message = STANDARD.decode(body["message"].as_str().unwrap()).unwrap();
            let signature = keypair.sign(&message).unwrap();
            ResponseTemplate::new(200).set_body_json(json!({
                "signature": STANDARD.encode(signature),
            }))
        })
        .mount(&server)
        .await;

    server
}

#[tokio::test]
async fn test_remote_signature_verifies_locally() {
    let server = signing_server().await;
    let issuer = TokenIssuer::Remote {
        kms: Arc::new(RemoteKms::new(&server.uri(), StdDuration::from_secs(5)).unwrap()),
        key_id: KEY_ID.to_string(),
        algorithm: SigningAlgorithm::Es512,
    };
    assert!(issuer.local_client().unwrap().is_none());

    let now = start_time();
    let token = issuer
        .bearer_token(TENANT_ID, Duration::minutes(5), now)
        .await
        .unwrap();

    let claims = ec_client().verify_at(&token, now).unwrap();
    assert_eq!(claims["tenant_id"], json!(TENANT_ID));
}

#[tokio::test]
async fn test_unknown_remote_key_is_key_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/keys/missing/sign"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let kms = RemoteKms::new(&server.uri(), StdDuration::from_secs(5)).unwrap();
    let err = kms
        .sign("missing", b"message", SigningAlgorithm::Es512)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::KeyNotFound(id) if id == "missing"));
}

#[tokio::test]
async fn test_remote_failure_is_signing_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("hsm offline"))
        .mount(&server)
        .await;

    let kms = RemoteKms::new(&server.uri(), StdDuration::from_secs(5)).unwrap();
    let err = kms
        .sign(KEY_ID, b"message", SigningAlgorithm::Ps256)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Signing(msg) if msg.contains("hsm offline")));
}

#[tokio::test]
async fn test_garbled_remote_signature_is_signing_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "signature": "***" })))
        .mount(&server)
        .await;

    let kms = RemoteKms::new(&server.uri(), StdDuration::from_secs(5)).unwrap();
    assert!(matches!(
        kms.sign(KEY_ID, b"message", SigningAlgorithm::Es512).await,
        Err(AppError::Signing(_))
    ));
}
