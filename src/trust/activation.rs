//! One-time direct activation: exchanges the shared secret for a
//! certified RSA key pair and switches the trust store over to
//! assertion-based credentials.

use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, instrument};

use crate::connection::{ConnectionError, ConnectionManager, DIRECT_PATH, POLICY_PATH};
use crate::types::EndpointId;
use crate::util::crypto::{base64_encode, hmac_sha256, sha256_digest};
use crate::util::http::{Headers, StatusCode};

const PUBLIC_KEY_FORMAT: &str = "X.509";
const SECRET_HASH_ALGORITHM: &str = "HmacSHA256";
const SIGNATURE_ALGORITHM: &str = "SHA256withRSA";

#[derive(Debug, Error)]
pub enum ActivationError {
    /// The service answered the policy fetch with 401: this endpoint has
    /// already been activated and the shared secret is no longer valid.
    #[error("endpoint is already activated")]
    AlreadyActivated,

    #[error("activation request was not authorized")]
    NotAuthorized,

    #[error("activation endpoint returned {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("activation response could not be parsed: {0}")]
    Malformed(String),

    #[error("policy advertises unsupported key type '{0}'")]
    UnsupportedKeyType(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("failed to sign certification request: {0}")]
    Signing(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Key parameters advertised by the activation policy endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ActivationPolicy {
    #[serde(rename = "keyType")]
    pub key_type: String,
    #[serde(rename = "keySize")]
    pub key_size: usize,
    #[serde(rename = "hashAlgorithm")]
    pub hash_algorithm: String,
}

/// Outcome of a successful direct activation. The private key is handed
/// back to the caller; persisting it is the caller's responsibility.
#[derive(Debug, Clone)]
pub struct ActivationResult {
    pub endpoint_id: EndpointId,
    pub endpoint_state: String,
    pub certificate: String,
    pub private_key_pkcs8: Vec<u8>,
}

/// Runs the full activation exchange against the service.
///
/// On success the trust store behind `connection` holds the new private
/// key, so subsequent token renewals use the assertion flow.
#[instrument(skip_all, fields(client_id = %connection.trust().client_id()))]
pub async fn activate(
    connection: &ConnectionManager,
    shared_secret: &str,
) -> Result<ActivationResult, ActivationError> {
    let trust = connection.trust();
    let client_id = trust.client_id().clone();
    trust.set_shared_secret(shared_secret).await;

    let policy = fetch_policy(connection, &client_id).await?;
    info!(
        key_type = %policy.key_type,
        key_size = policy.key_size,
        "received activation policy"
    );
    if !policy.key_type.eq_ignore_ascii_case("RSA") {
        return Err(ActivationError::UnsupportedKeyType(policy.key_type));
    }

    let key = RsaPrivateKey::new(&mut rand::thread_rng(), policy.key_size)
        .map_err(|e| ActivationError::KeyGeneration(e.to_string()))?;
    let public_key_der = key
        .to_public_key()
        .to_public_key_der()
        .map_err(|e| ActivationError::KeyGeneration(e.to_string()))?
        .to_vec();

    let secret_hash = secret_hash(&client_id, shared_secret, &policy.hash_algorithm);
    let request = certification_request(
        &client_id,
        &policy,
        &key,
        &public_key_der,
        &secret_hash,
    )?;

    let result = submit(connection, &client_id, request).await?;

    let private_key_pkcs8 = key
        .to_pkcs8_der()
        .map_err(|e| ActivationError::KeyGeneration(e.to_string()))?
        .as_bytes()
        .to_vec();
    trust.set_private_key(key).await;

    info!(
        endpoint_id = %result.endpoint_id,
        endpoint_state = %result.endpoint_state,
        "endpoint activated"
    );
    Ok(ActivationResult {
        endpoint_id: result.endpoint_id,
        endpoint_state: result.endpoint_state,
        certificate: result.certificate,
        private_key_pkcs8,
    })
}

async fn fetch_policy(
    connection: &ConnectionManager,
    client_id: &EndpointId,
) -> Result<ActivationPolicy, ActivationError> {
    let mut headers = Headers::new();
    headers.insert("X-ActivationId".to_string(), client_id.to_string());

    let response = connection.post(POLICY_PATH, Vec::new(), &headers).await?;
    match response.status {
        StatusCode::OK => serde_json::from_slice(&response.body)
            .map_err(|e| ActivationError::Malformed(e.to_string())),
        StatusCode::UNAUTHORIZED => Err(ActivationError::AlreadyActivated),
        status => Err(ActivationError::Rejected {
            status,
            body: response.text(),
        }),
    }
}

struct DirectResult {
    endpoint_id: EndpointId,
    endpoint_state: String,
    certificate: String,
}

async fn submit(
    connection: &ConnectionManager,
    client_id: &EndpointId,
    request: serde_json::Value,
) -> Result<DirectResult, ActivationError> {
    let mut headers = Headers::new();
    headers.insert("X-ActivationId".to_string(), client_id.to_string());
    headers.insert("Content-Type".to_string(), "application/json".to_string());

    let response = connection
        .post(DIRECT_PATH, request.to_string().into_bytes(), &headers)
        .await?;

    match response.status {
        StatusCode::OK => {
            #[derive(Deserialize)]
            struct Body {
                #[serde(rename = "endpointId")]
                endpoint_id: String,
                #[serde(rename = "endpointState")]
                endpoint_state: String,
                certificate: Option<String>,
            }
            let body: Body = serde_json::from_slice(&response.body)
                .map_err(|e| ActivationError::Malformed(e.to_string()))?;
            Ok(DirectResult {
                endpoint_id: body.endpoint_id.into(),
                endpoint_state: body.endpoint_state,
                certificate: body.certificate.unwrap_or_default(),
            })
        }
        StatusCode::UNAUTHORIZED => Err(ActivationError::NotAuthorized),
        status => Err(ActivationError::Rejected {
            status,
            body: response.text(),
        }),
    }
}

/// Secret hash carried in the certification request. HMAC-family
/// algorithms key the digest with the secret itself; anything else is a
/// plain digest of the secret.
fn secret_hash(client_id: &EndpointId, shared_secret: &str, algorithm: &str) -> Vec<u8> {
    if algorithm.starts_with("Hmac") {
        hmac_sha256(
            shared_secret.as_bytes(),
            format!("{client_id}\n{shared_secret}").as_bytes(),
        )
    } else {
        sha256_digest(shared_secret.as_bytes())
    }
}

fn certification_request(
    client_id: &EndpointId,
    policy: &ActivationPolicy,
    key: &RsaPrivateKey,
    public_key_der: &[u8],
    secret_hash: &[u8],
) -> Result<serde_json::Value, ActivationError> {
    let attributes = BTreeMap::new();
    let payload = signature_payload(
        client_id,
        &policy.key_type,
        PUBLIC_KEY_FORMAT,
        SECRET_HASH_ALGORITHM,
        &attributes,
        secret_hash,
        public_key_der,
    );

    let signature = key
        .sign(Pkcs1v15Sign::new::<sha2::Sha256>(), &sha256_digest(&payload))
        .map_err(|e| ActivationError::Signing(e.to_string()))?;

    Ok(json!({
        "certificationRequestInfo": {
            "subject": client_id.as_str(),
            "subjectPublicKeyInfo": {
                "algorithm": policy.key_type,
                "publicKey": base64_encode(public_key_der),
                "format": PUBLIC_KEY_FORMAT,
                "secretHashAlgorithm": SECRET_HASH_ALGORITHM,
            },
            "attributes": attributes,
        },
        "signatureAlgorithm": SIGNATURE_ALGORITHM,
        "signature": base64_encode(&signature),
    }))
}

/// Byte layout signed by the certification request, in fixed order:
/// the subject line block, each attribute as `key='value'` (or
/// `key=null`), the secret hash, then the raw public key bytes.
fn signature_payload(
    subject: &str,
    algorithm: &str,
    format: &str,
    secret_hash_algorithm: &str,
    attributes: &BTreeMap<String, Option<String>>,
    secret_hash: &[u8],
    public_key: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(
        format!("{subject}\n{algorithm}\n{format}\n{secret_hash_algorithm}\n").as_bytes(),
    );
    for (key, value) in attributes {
        match value {
            Some(value) => payload.extend_from_slice(format!("{key}='{value}'\n").as_bytes()),
            None => payload.extend_from_slice(format!("{key}=null\n").as_bytes()),
        }
    }
    payload.extend_from_slice(secret_hash);
    payload.extend_from_slice(public_key);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TOKEN_PATH;
    use crate::trust::TrustStore;
    use crate::util::http::{HttpTransport, Transport};
    use mockito::Server;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn signature_payload_layout_is_exact() {
        let hash = [0xAA, 0xBB];
        let key = [0x01, 0x02, 0x03];
        let payload = signature_payload(
            "device-1",
            "RSA",
            "X.509",
            "HmacSHA256",
            &BTreeMap::new(),
            &hash,
            &key,
        );

        let mut expected = b"device-1\nRSA\nX.509\nHmacSHA256\n".to_vec();
        expected.extend_from_slice(&hash);
        expected.extend_from_slice(&key);
        assert_eq!(payload, expected);
    }

    #[test]
    fn signature_payload_includes_attributes_in_order() {
        let mut attributes = BTreeMap::new();
        attributes.insert("b".to_string(), None);
        attributes.insert("a".to_string(), Some("1".to_string()));

        let payload = signature_payload(
            "s",
            "RSA",
            "X.509",
            "HmacSHA256",
            &attributes,
            &[],
            &[],
        );
        assert_eq!(payload, b"s\nRSA\nX.509\nHmacSHA256\na='1'\nb=null\n".to_vec());
    }

    #[test]
    fn hmac_algorithms_key_the_secret_hash() {
        let id: EndpointId = "device-1".into();
        assert_eq!(
            secret_hash(&id, "hunter2", "HmacSHA256"),
            hmac_sha256(b"hunter2", b"device-1\nhunter2")
        );
        assert_eq!(
            secret_hash(&id, "hunter2", "SHA-256"),
            sha256_digest(b"hunter2")
        );
    }

    fn connection_for(server: &Server) -> ConnectionManager {
        let trust = Arc::new(TrustStore::new(
            "AAAA-BBBB".into(),
            server.url().parse().unwrap(),
            Arc::new(HttpTransport::default()) as Arc<dyn Transport>,
        ));
        ConnectionManager::new(trust)
    }

    #[tokio::test]
    async fn full_activation_flow() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(r#"{"access_token":"tok","token_type":"Bearer","expires_in":3600000}"#)
            .create_async()
            .await;
        let policy = server
            .mock("POST", POLICY_PATH)
            .match_header("x-activationid", "AAAA-BBBB")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            // small key keeps generation fast under test
            .with_body(r#"{"keyType":"RSA","keySize":512,"hashAlgorithm":"HmacSHA256"}"#)
            .create_async()
            .await;
        let direct = server
            .mock("POST", DIRECT_PATH)
            .match_header("x-activationid", "AAAA-BBBB")
            .with_status(200)
            .with_body(
                r#"{"endpointId":"device-1","endpointState":"ACTIVATED","certificate":""}"#,
            )
            .create_async()
            .await;

        let connection = connection_for(&server);
        let result = activate(&connection, "hunter2").await.unwrap();

        assert_eq!(result.endpoint_id, EndpointId::from("device-1"));
        assert_eq!(result.endpoint_state, "ACTIVATED");
        assert!(!result.private_key_pkcs8.is_empty());
        assert!(connection.trust().has_credentials().await);

        policy.assert_async().await;
        direct.assert_async().await;
    }

    #[tokio::test]
    async fn policy_401_means_already_activated() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(r#"{"access_token":"tok","token_type":"Bearer","expires_in":3600000}"#)
            // the 401 triggers one renew-and-retry round trip
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", POLICY_PATH)
            .with_status(401)
            .expect(2)
            .create_async()
            .await;

        let connection = connection_for(&server);
        let error = activate(&connection, "hunter2").await.unwrap_err();
        assert!(matches!(error, ActivationError::AlreadyActivated));
    }
}
