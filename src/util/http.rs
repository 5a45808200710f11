pub use client::{
    Headers, HttpTransport, Method, StatusCode, Transport, TransportError, TransportResponse,
};
pub use uri::{InvalidUriError, Uri};

mod uri {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub struct InvalidUriError(String);

    impl InvalidUriError {
        pub fn reason(&self) -> &str {
            self.0.as_str()
        }
    }

    impl Display for InvalidUriError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl From<http::uri::InvalidUri> for InvalidUriError {
        fn from(value: http::uri::InvalidUri) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    impl From<http::uri::InvalidUriParts> for InvalidUriError {
        fn from(value: http::uri::InvalidUriParts) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Uri(http::Uri);

    impl Uri {
        pub fn new(uri: http::Uri) -> Self {
            Self(uri)
        }

        pub fn from_static(src: &'static str) -> Self {
            Self(http::Uri::from_static(src))
        }

        pub fn from_string(src: String) -> Result<Self, InvalidUriError> {
            Ok(Self(http::Uri::from_maybe_shared(src)?))
        }

        /// Replaces the path (and optional query) of `base_uri`, keeping
        /// scheme and authority.
        pub fn from_parts(
            base_uri: Uri,
            path: &str,
            query: Option<&str>,
        ) -> Result<Self, InvalidUriError> {
            let path_and_query = if let Some(qs) = query {
                http::uri::PathAndQuery::from_maybe_shared(format!("{path}?{qs}"))?
            } else {
                http::uri::PathAndQuery::from_str(path)?
            };
            let mut parts = base_uri.0.into_parts();
            parts.path_and_query = Some(path_and_query);

            Ok(http::Uri::from_parts(parts).map(Self::new)?)
        }

        pub fn path(&self) -> &str {
            self.0.path()
        }
    }

    impl Display for Uri {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl FromStr for Uri {
        type Err = InvalidUriError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Ok(http::Uri::from_str(s).map(Self::new)?)
        }
    }

    impl TryFrom<String> for Uri {
        type Error = InvalidUriError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Ok(Self(http::Uri::from_maybe_shared(value)?))
        }
    }

    impl From<http::Uri> for Uri {
        fn from(value: http::Uri) -> Self {
            Self(value)
        }
    }

    impl From<Uri> for http::Uri {
        fn from(value: Uri) -> Self {
            value.0
        }
    }

    impl Serialize for Uri {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            serializer.serialize_str(&self.to_string())
        }
    }

    impl<'de> Deserialize<'de> for Uri {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        }
    }
}

mod client {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::uri::Uri;

    pub type Method = http::Method;
    pub type StatusCode = http::StatusCode;
    pub type Headers = HashMap<String, String>;

    #[derive(Debug, thiserror::Error)]
    pub enum TransportError {
        #[error("failed to build request: {0}")]
        Request(String),

        #[error("exchange failed: {0}")]
        Io(String),
    }

    impl From<reqwest::Error> for TransportError {
        fn from(value: reqwest::Error) -> Self {
            TransportError::Io(value.to_string())
        }
    }

    /// One completed HTTP exchange. Bodies are raw bytes; gzip/deflate
    /// content encodings are decompressed by the transport.
    #[derive(Debug, Clone)]
    pub struct TransportResponse {
        pub status: StatusCode,
        pub headers: Headers,
        pub body: Vec<u8>,
    }

    impl TransportResponse {
        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.body).into_owned()
        }
    }

    /// The single capability the client core requires from the network
    /// layer: perform one request/response exchange.
    #[async_trait]
    pub trait Transport: Send + Sync {
        async fn invoke(
            &self,
            method: Method,
            uri: &Uri,
            headers: &Headers,
            body: Option<Vec<u8>>,
        ) -> Result<TransportResponse, TransportError>;
    }

    /// Production transport backed by [reqwest::Client].
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        client: reqwest::Client,
        timeout: Duration,
    }

    impl HttpTransport {
        pub fn new(timeout: Duration) -> Self {
            Self {
                client: reqwest::Client::new(),
                timeout,
            }
        }
    }

    impl Default for HttpTransport {
        /// Default transport with a timeout of 15 seconds.
        fn default() -> Self {
            Self::new(Duration::from_secs(15))
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn invoke(
            &self,
            method: Method,
            uri: &Uri,
            headers: &Headers,
            body: Option<Vec<u8>>,
        ) -> Result<TransportResponse, TransportError> {
            let header_map: reqwest::header::HeaderMap = headers
                .try_into()
                .map_err(|err: http::Error| TransportError::Request(err.to_string()))?;

            let mut request = self
                .client
                .request(method, uri.to_string())
                .timeout(self.timeout)
                .headers(header_map);

            if let Some(body) = body {
                request = request.body(body);
            }

            let response = request.send().await?;

            let status = response.status();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = response.bytes().await?.to_vec();

            Ok(TransportResponse {
                status,
                headers,
                body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[tokio::test]
    async fn transport_performs_a_post_exchange() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/echo")
            .match_header("x-test", "yes")
            .with_status(202)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let transport = HttpTransport::default();
        let base: Uri = server.url().parse().unwrap();
        let uri = Uri::from_parts(base, "/echo", None).unwrap();

        let mut headers = Headers::new();
        headers.insert("x-test".to_string(), "yes".to_string());

        let response = transport
            .invoke(Method::POST, &uri, &headers, Some(b"[]".to_vec()))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::ACCEPTED);
        assert_eq!(response.text(), r#"{"ok":true}"#);
        assert_eq!(
            response.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );

        mock.assert_async().await;
    }

    #[test]
    fn uri_from_parts_replaces_the_path() {
        let base = Uri::from_static("https://iot.example.com:8443/old/path");
        let uri = Uri::from_parts(base, "/iot/api/v1/messages", None).unwrap();
        assert_eq!(uri.to_string(), "https://iot.example.com:8443/iot/api/v1/messages");

        let base = Uri::from_static("https://iot.example.com");
        let uri = Uri::from_parts(base, "/a", Some("b=c")).unwrap();
        assert_eq!(uri.to_string(), "https://iot.example.com/a?b=c");
    }
}
