//! Endpoint credentials and token acquisition. A [`TrustStore`] holds
//! either the pre-activation shared secret or the post-activation
//! private key, and exchanges them for short-lived access tokens.

pub mod activation;

use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::connection::TOKEN_PATH;
use crate::types::EndpointId;
use crate::util::crypto::{base64url_encode, base64url_encode_nopad, hmac_sha256, sha256_digest};
use crate::util::http::{
    Headers, InvalidUriError, Method, StatusCode, Transport, TransportError, Uri,
};

const ACTIVATION_SCOPE: &str = "oracle/iot/activation";
const ASSERTION_AUDIENCE: &str = "oracle/iot/oauth2/token";
const ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 900;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no credentials available for this endpoint")]
    NoCredentials,

    #[error("private key is not valid PKCS#8 DER: {0}")]
    InvalidKey(String),

    #[error("token endpoint returned {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("token response could not be parsed: {0}")]
    Malformed(String),

    #[error("failed to encode token request: {0}")]
    Encoding(String),

    #[error("failed to sign client assertion: {0}")]
    Signing(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Uri(#[from] InvalidUriError),
}

/// A bearer token returned by the token endpoint. Expiry is tracked from
/// the moment the token was received.
#[derive(Debug, Clone)]
pub struct AccessToken {
    token_type: String,
    token: String,
    expires_in: Duration,
    acquired_at: Instant,
}

impl AccessToken {
    pub fn has_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.expires_in
    }

    /// Value for the `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.token)
    }
}

/// What the store can present to the token endpoint.
enum Credentials {
    /// Pre-activation shared secret, requesting activation scope.
    SharedSecret { secret: String },
    /// Post-activation RSA key, presented as a signed client assertion.
    Assertion { key: RsaPrivateKey },
}

struct TrustState {
    credentials: Option<Credentials>,
    token: Option<AccessToken>,
}

/// Credential store for one endpoint. Token renewal is serialized: when
/// several callers hit an expired token at once, one renewal request goes
/// out and everyone shares its result.
pub struct TrustStore {
    client_id: EndpointId,
    base_uri: Uri,
    transport: Arc<dyn Transport>,
    inner: Mutex<TrustState>,
}

impl TrustStore {
    /// `client_id` is the activation id before activation and the
    /// assigned endpoint id after.
    pub fn new(client_id: EndpointId, base_uri: Uri, transport: Arc<dyn Transport>) -> Self {
        Self {
            client_id,
            base_uri,
            transport,
            inner: Mutex::new(TrustState {
                credentials: None,
                token: None,
            }),
        }
    }

    pub fn client_id(&self) -> &EndpointId {
        &self.client_id
    }

    pub(crate) fn base_uri(&self) -> &Uri {
        &self.base_uri
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Installs the pre-activation shared secret. Any cached token is
    /// dropped.
    pub async fn set_shared_secret(&self, secret: impl Into<String>) {
        let mut state = self.inner.lock().await;
        state.credentials = Some(Credentials::SharedSecret {
            secret: secret.into(),
        });
        state.token = None;
    }

    /// Installs the post-activation private key from PKCS#8 DER. Any
    /// cached token is dropped.
    pub async fn set_private_key_pkcs8(&self, der: &[u8]) -> Result<(), TokenError> {
        let key =
            RsaPrivateKey::from_pkcs8_der(der).map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        let mut state = self.inner.lock().await;
        state.credentials = Some(Credentials::Assertion { key });
        state.token = None;
        Ok(())
    }

    pub(crate) async fn set_private_key(&self, key: RsaPrivateKey) {
        let mut state = self.inner.lock().await;
        state.credentials = Some(Credentials::Assertion { key });
        state.token = None;
    }

    pub async fn has_credentials(&self) -> bool {
        self.inner.lock().await.credentials.is_some()
    }

    /// Drops the cached token so the next call to [`Self::access_token`]
    /// renews. Used after the service rejects a request with 401.
    pub async fn invalidate_token(&self) {
        self.inner.lock().await.token = None;
    }

    /// Returns a valid token, renewing against the token endpoint if the
    /// cached one is missing or expired.
    pub async fn access_token(&self) -> Result<AccessToken, TokenError> {
        let mut state = self.inner.lock().await;
        if let Some(token) = &state.token {
            if !token.has_expired() {
                return Ok(token.clone());
            }
            debug!(client_id = %self.client_id, "access token expired");
        }
        let token = self.renew(&mut state).await?;
        Ok(token)
    }

    async fn renew(&self, state: &mut TrustState) -> Result<AccessToken, TokenError> {
        let credentials = state.credentials.as_ref().ok_or(TokenError::NoCredentials)?;
        let body = self.grant_request_body(credentials)?;
        let uri = Uri::from_parts(self.base_uri.clone(), TOKEN_PATH, None)?;

        let mut headers = Headers::new();
        headers.insert(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        headers.insert("Accept".to_string(), "application/json".to_string());

        let response = self
            .transport
            .invoke(Method::POST, &uri, &headers, Some(body.into_bytes()))
            .await?;

        if response.status != StatusCode::OK {
            return Err(TokenError::Rejected {
                status: response.status,
                body: response.text(),
            });
        }
        if response.body.is_empty() {
            return Err(TokenError::Malformed("empty response body".to_string()));
        }

        #[derive(Deserialize)]
        struct GrantResponse {
            access_token: String,
            token_type: String,
            /// Remaining lifetime in milliseconds.
            expires_in: u64,
        }

        let grant: GrantResponse = serde_json::from_slice(&response.body)
            .map_err(|e| TokenError::Malformed(e.to_string()))?;

        let token = AccessToken {
            token_type: grant.token_type,
            token: grant.access_token,
            expires_in: Duration::from_millis(grant.expires_in),
            acquired_at: Instant::now(),
        };
        info!(
            client_id = %self.client_id,
            expires_in_ms = token.expires_in.as_millis() as u64,
            "access token renewed"
        );
        state.token = Some(token.clone());
        Ok(token)
    }

    fn grant_request_body(&self, credentials: &Credentials) -> Result<String, TokenError> {
        let fields: Vec<(&str, String)> = match credentials {
            Credentials::SharedSecret { secret } => vec![
                ("grant_type", "client_credentials".to_string()),
                ("client_id", self.client_id.to_string()),
                (
                    "client_secret",
                    symmetric_client_secret(&self.client_id, secret),
                ),
                ("scope", ACTIVATION_SCOPE.to_string()),
            ],
            Credentials::Assertion { key } => vec![
                ("grant_type", "client_credentials".to_string()),
                ("client_assertion_type", ASSERTION_TYPE.to_string()),
                ("client_assertion", client_assertion(&self.client_id, key)?),
                ("scope", String::new()),
            ],
        };
        serde_urlencoded::to_string(fields).map_err(|e| TokenError::Encoding(e.to_string()))
    }
}

/// Derives the shared-secret grant's `client_secret`: an HMAC-SHA256 of
/// `"{client_id}\n{secret}"` keyed with the secret itself, tagged with
/// the algorithm name.
pub(crate) fn symmetric_client_secret(client_id: &EndpointId, secret: &str) -> String {
    let signed = hmac_sha256(secret.as_bytes(), format!("{client_id}\n{secret}").as_bytes());
    format!("HmacSHA256:{}", base64url_encode(signed))
}

/// Builds a compact RS256 JWT asserting this endpoint's identity.
fn client_assertion(client_id: &EndpointId, key: &RsaPrivateKey) -> Result<String, TokenError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let header = json!({"typ": "JWT", "alg": "RS256"});
    let claims = json!({
        "iss": client_id.as_str(),
        "sub": client_id.as_str(),
        "aud": ASSERTION_AUDIENCE,
        "exp": now + ASSERTION_LIFETIME_SECS,
    });

    let signing_input = format!(
        "{}.{}",
        base64url_encode_nopad(header.to_string()),
        base64url_encode_nopad(claims.to_string()),
    );
    let signature = key
        .sign(
            Pkcs1v15Sign::new::<sha2::Sha256>(),
            &sha256_digest(signing_input.as_bytes()),
        )
        .map_err(|e| TokenError::Signing(e.to_string()))?;

    Ok(format!(
        "{signing_input}.{}",
        base64url_encode_nopad(signature)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::crypto::base64_decode;
    use crate::util::http::HttpTransport;
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;

    fn store_for(server: &Server) -> TrustStore {
        TrustStore::new(
            "device-1".into(),
            server.url().parse().unwrap(),
            Arc::new(HttpTransport::default()),
        )
    }

    #[test]
    fn symmetric_secret_carries_the_algorithm_tag() {
        let id: EndpointId = "device-1".into();
        let secret = symmetric_client_secret(&id, "hunter2");
        let encoded = secret.strip_prefix("HmacSHA256:").unwrap();
        let raw = base64_decode(&encoded.replace('-', "+").replace('_', "/")).unwrap();
        assert_eq!(raw.len(), 32);
        assert_eq!(
            raw,
            hmac_sha256(b"hunter2", b"device-1\nhunter2")
        );
    }

    #[tokio::test]
    async fn token_requires_credentials() {
        let server = Server::new_async().await;
        let store = store_for(&server);
        assert!(matches!(
            store.access_token().await,
            Err(TokenError::NoCredentials)
        ));
    }

    #[tokio::test]
    async fn token_is_cached_until_expiry() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", TOKEN_PATH)
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".to_string(), "client_credentials".to_string()),
                Matcher::UrlEncoded("client_id".to_string(), "device-1".to_string()),
                Matcher::UrlEncoded("scope".to_string(), ACTIVATION_SCOPE.to_string()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"tok-1","token_type":"Bearer","expires_in":3600000}"#)
            .expect(1)
            .create_async()
            .await;

        let store = store_for(&server);
        store.set_shared_secret("hunter2").await;

        let first = store.access_token().await.unwrap();
        let second = store.access_token().await.unwrap();
        assert_eq!(first.header_value(), "Bearer tok-1");
        assert_eq!(second.header_value(), "Bearer tok-1");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn expired_token_is_renewed() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            // expires immediately
            .with_body(r#"{"access_token":"tok","token_type":"Bearer","expires_in":0}"#)
            .expect(2)
            .create_async()
            .await;

        let store = store_for(&server);
        store.set_shared_secret("hunter2").await;

        store.access_token().await.unwrap();
        store.access_token().await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn invalidation_forces_renewal() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(r#"{"access_token":"tok","token_type":"Bearer","expires_in":3600000}"#)
            .expect(2)
            .create_async()
            .await;

        let store = store_for(&server);
        store.set_shared_secret("hunter2").await;

        store.access_token().await.unwrap();
        store.invalidate_token().await;
        store.access_token().await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejection_surfaces_status_and_body() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", TOKEN_PATH)
            .with_status(403)
            .with_body("denied")
            .create_async()
            .await;

        let store = store_for(&server);
        store.set_shared_secret("hunter2").await;

        match store.access_token().await {
            Err(TokenError::Rejected { status, body }) => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "denied");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
