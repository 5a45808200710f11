use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;

use crate::util::http::{InvalidUriError, Uri};

/// Identifier assigned to a device or gateway endpoint by the service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId(String);

impl Deref for EndpointId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<EndpointId> for String {
    fn from(value: EndpointId) -> Self {
        value.0
    }
}

/// One registered device identity. Every trust store, connection manager
/// and dispatcher instance is scoped to exactly one identity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub server: String,
    pub port: u16,
    pub endpoint_id: EndpointId,
}

impl Identity {
    pub fn new(server: impl Into<String>, port: u16, endpoint_id: impl Into<EndpointId>) -> Self {
        Self {
            server: server.into(),
            port,
            endpoint_id: endpoint_id.into(),
        }
    }

    /// Base URI for the service this identity is registered with.
    pub fn base_uri(&self) -> Result<Uri, InvalidUriError> {
        Uri::from_string(format!("https://{}:{}", self.server, self.port))
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.server, self.port, self.endpoint_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_equality_covers_all_three_fields() {
        let a = Identity::new("iot.example.com", 443, "device-1");
        let b = Identity::new("iot.example.com", 443, "device-1");
        let c = Identity::new("iot.example.com", 443, "device-2");
        let d = Identity::new("iot.example.com", 8443, "device-1");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn identity_builds_an_https_base_uri() {
        let identity = Identity::new("iot.example.com", 8443, "device-1");
        assert_eq!(
            identity.base_uri().unwrap().to_string(),
            "https://iot.example.com:8443/"
        );
    }
}
