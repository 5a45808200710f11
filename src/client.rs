//! Top-level client: one trust store, connection manager and dispatcher
//! per device identity, plus the registry that keeps a single client
//! instance per identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::dispatch::MessageDispatcher;
use crate::trust::activation::{self, ActivationError, ActivationResult};
use crate::trust::{TokenError, TrustStore};
use crate::types::Identity;
use crate::util::http::{HttpTransport, InvalidUriError, Transport, Uri};

/// A connected device endpoint. Must be created inside a tokio runtime;
/// the dispatch workers start immediately.
pub struct DeviceClient {
    identity: Identity,
    connection: Arc<ConnectionManager>,
    dispatcher: MessageDispatcher,
}

impl DeviceClient {
    /// Client talking to `https://{server}:{port}` over the default
    /// transport, with the configured response timeout.
    pub fn new(identity: Identity, config: ClientConfig) -> Result<Self, InvalidUriError> {
        let base_uri = identity.base_uri()?;
        let transport = Arc::new(HttpTransport::new(config.response_timeout));
        Ok(Self::with_base_uri(identity, config, base_uri, transport))
    }

    /// Client against an explicit base URI and transport. This is the
    /// constructor to use when the service lives behind a non-standard
    /// scheme or the transport is substituted.
    pub fn with_base_uri(
        identity: Identity,
        config: ClientConfig,
        base_uri: Uri,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let trust = Arc::new(TrustStore::new(
            identity.endpoint_id.clone(),
            base_uri,
            transport,
        ));
        let connection = Arc::new(ConnectionManager::new(trust));
        let dispatcher = MessageDispatcher::new(
            identity.endpoint_id.clone(),
            config,
            Arc::clone(&connection),
        );
        Self {
            identity,
            connection,
            dispatcher,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        self.connection.trust()
    }

    /// Message queueing, receipts and handler registration.
    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    /// Runs the one-time direct activation exchange. On success the
    /// client authenticates with the returned key from then on; the
    /// caller is responsible for persisting it.
    pub async fn activate(&self, shared_secret: &str) -> Result<ActivationResult, ActivationError> {
        activation::activate(&self.connection, shared_secret).await
    }

    /// Authenticates with a previously persisted activation key.
    pub async fn set_private_key_pkcs8(&self, der: &[u8]) -> Result<(), TokenError> {
        self.trust().set_private_key_pkcs8(der).await
    }

    /// Stops the dispatch workers. Queued outbound messages fail, queued
    /// inbound requests are dropped.
    pub async fn close(&self) {
        self.dispatcher.close().await;
    }
}

/// Owns one [`DeviceClient`] per identity. Replaces process-wide
/// singletons: the application root holds the registry and hands it to
/// whatever needs clients.
pub struct ClientRegistry {
    config: ClientConfig,
    clients: Mutex<HashMap<Identity, Arc<DeviceClient>>>,
}

impl ClientRegistry {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The client for `identity`, creating it on first use.
    pub fn get_or_create(&self, identity: &Identity) -> Result<Arc<DeviceClient>, InvalidUriError> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(identity) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(DeviceClient::new(identity.clone(), self.config.clone())?);
        clients.insert(identity.clone(), Arc::clone(&client));
        Ok(client)
    }

    /// Drops the registry's reference. The caller should close the
    /// client once the remaining handles are done with it.
    pub fn remove(&self, identity: &Identity) -> Option<Arc<DeviceClient>> {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_keeps_one_client_per_identity() {
        let registry = ClientRegistry::new(ClientConfig::default());
        let identity = Identity::new("iot.example.com", 443, "device-1");
        let other = Identity::new("iot.example.com", 443, "device-2");

        let a = registry.get_or_create(&identity).unwrap();
        let b = registry.get_or_create(&identity).unwrap();
        let c = registry.get_or_create(&other).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        assert!(registry.remove(&identity).is_some());
        assert!(registry.remove(&identity).is_none());

        a.close().await;
        c.close().await;
    }

    #[tokio::test]
    async fn client_derives_an_https_base_uri() {
        let identity = Identity::new("iot.example.com", 8443, "device-1");
        let client = DeviceClient::new(identity.clone(), ClientConfig::default()).unwrap();
        assert_eq!(client.identity(), &identity);
        assert_eq!(client.trust().client_id(), &identity.endpoint_id);
        client.close().await;
    }
}
