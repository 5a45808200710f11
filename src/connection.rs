//! Authenticated exchanges with the service. The connection manager owns
//! nothing but a trust store reference; it attaches the bearer token to
//! every request and absorbs one token-expiry round trip per call.

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::trust::{TokenError, TrustStore};
use crate::util::http::{
    Headers, InvalidUriError, Method, StatusCode, Transport, TransportError, TransportResponse,
    Uri,
};

pub const TOKEN_PATH: &str = "/iot/api/v1/oauth2/token";
pub const POLICY_PATH: &str = "/iot/api/v1/activation/policy";
pub const DIRECT_PATH: &str = "/iot/api/v1/activation/direct";
pub const MESSAGES_PATH: &str = "/iot/api/v1/messages";

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Uri(#[from] InvalidUriError),
}

/// Sends authenticated requests on behalf of one endpoint.
pub struct ConnectionManager {
    trust: Arc<TrustStore>,
}

impl ConnectionManager {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust }
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// POSTs `body` to `path` with the current access token attached.
    ///
    /// A 401 response invalidates the cached token and the exchange is
    /// repeated exactly once with a fresh one; the second response is
    /// returned as-is. Every other status is returned to the caller
    /// without interpretation.
    pub async fn post(
        &self,
        path: &str,
        body: Vec<u8>,
        extra_headers: &Headers,
    ) -> Result<TransportResponse, ConnectionError> {
        let uri = Uri::from_parts(self.trust.base_uri().clone(), path, None)?;

        let response = self.exchange(&uri, extra_headers, body.clone()).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(%uri, "server rejected token, renewing and retrying once");
        self.trust.invalidate_token().await;
        Ok(self.exchange(&uri, extra_headers, body).await?)
    }

    async fn exchange(
        &self,
        uri: &Uri,
        extra_headers: &Headers,
        body: Vec<u8>,
    ) -> Result<TransportResponse, ConnectionError> {
        let token = self.trust.access_token().await?;

        let mut headers = extra_headers.clone();
        headers.insert("Authorization".to_string(), token.header_value());
        headers
            .entry("Accept".to_string())
            .or_insert_with(|| "application/json".to_string());

        Ok(self
            .trust
            .transport()
            .invoke(Method::POST, uri, &headers, Some(body))
            .await?)
    }
}
