//! Request routing: resources published by the device, the ordered
//! handler registry, and the reconciliation mark that lets the service
//! detect drift between its view and ours.

use serde_json::{json, Value};
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

use crate::message::{Message, Payload};
use crate::util::crypto::md5_hex_digest;

/// Path answered by the built-in reconciliation handler. Its registration
/// is implicit and can never be removed or shadowed.
pub const RECONCILIATION_PATH: &str = "/device/resources/reconciliation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            "PATCH" => Some(HttpMethod::Patch),
            "HEAD" => Some(HttpMethod::Head),
            _ => None,
        }
    }
}

impl Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    Added,
    Removed,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Added => "ADDED",
            ResourceStatus::Removed => "REMOVED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "ADDED" => Some(ResourceStatus::Added),
            "REMOVED" => Some(ResourceStatus::Removed),
            _ => None,
        }
    }
}

/// Kind of a resources report sent to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportType {
    Update,
    Delete,
    Reconciliation,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Update => "UPDATE",
            ReportType::Delete => "DELETE",
            ReportType::Reconciliation => "RECONCILIATION",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "UPDATE" => Some(ReportType::Update),
            "DELETE" => Some(ReportType::Delete),
            "RECONCILIATION" => Some(ReportType::Reconciliation),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a handler is already registered for path '{0}'")]
    DuplicatePath(String),

    #[error("path '{0}' is reserved for the reconciliation endpoint")]
    ReservedPath(String),

    #[error("an ADDED resource requires at least one method")]
    MissingMethods,
}

/// An addressable capability of the endpoint, published to the service.
/// Paths are unique per endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub(crate) endpoint_name: Option<String>,
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) status: ResourceStatus,
    pub(crate) methods: Vec<HttpMethod>,
}

impl Resource {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        methods: Vec<HttpMethod>,
    ) -> Result<Self, RegistryError> {
        if methods.is_empty() {
            return Err(RegistryError::MissingMethods);
        }
        Ok(Self {
            endpoint_name: None,
            name: name.into(),
            path: path.into(),
            status: ResourceStatus::Added,
            methods,
        })
    }

    /// A removal marker; methods are not required for REMOVED resources.
    pub fn removed(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            endpoint_name: None,
            name: name.into(),
            path: path.into(),
            status: ResourceStatus::Removed,
            methods: Vec::new(),
        }
    }

    pub fn with_endpoint_name(mut self, endpoint_name: impl Into<String>) -> Self {
        self.endpoint_name = Some(endpoint_name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn status(&self) -> ResourceStatus {
        self.status
    }

    pub fn methods(&self) -> &[HttpMethod] {
        &self.methods
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut object = json!({
            "name": self.name,
            "path": self.path,
            "status": self.status.as_str(),
            "methods": self.methods.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
        });
        if let Some(endpoint_name) = &self.endpoint_name {
            object["endpointName"] = Value::from(endpoint_name.as_str());
        }
        object
    }
}

#[derive(Debug, Error)]
#[error("request handler failed: {0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        HandlerError(value.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        HandlerError(value)
    }
}

/// Application callback for inbound server requests. Invoked on the
/// inbound worker, one request at a time, in arrival order.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &Message) -> Result<Message, HandlerError>;
}

impl<F> RequestHandler for F
where
    F: Fn(&Message) -> Result<Message, HandlerError> + Send + Sync,
{
    fn handle(&self, request: &Message) -> Result<Message, HandlerError> {
        self(request)
    }
}

/// Result of a registry lookup. Lookup never fails: anything unmatched
/// falls through to the default handler.
pub enum Resolved {
    /// The built-in reconciliation endpoint.
    Reconciliation,
    Handler(Arc<dyn RequestHandler>),
    Default(Arc<dyn RequestHandler>),
}

struct Registration {
    resource: Resource,
    handler: Arc<dyn RequestHandler>,
}

/// Ordered set of (path, methods) -> handler bindings with
/// longest-prefix matching.
pub struct ResourceRegistry {
    endpoint_name: String,
    entries: Vec<Registration>,
    default_handler: Arc<dyn RequestHandler>,
}

/// Canonical digest of a resource path set. The service computes the
/// same digest on its side; equal marks mean device and service agree.
///
/// Paths are deduplicated and sorted by Unicode code point before
/// hashing. For ASCII resource paths this matches the service's
/// collation order; a service sorting non-ASCII paths with a
/// locale-aware collator can order them differently and will then never
/// agree on the mark. Keep resource paths ASCII.
pub fn hash_of_paths<S: AsRef<str>>(paths: &[S]) -> String {
    let mut paths: Vec<&str> = paths.iter().map(|p| p.as_ref()).collect();
    paths.sort_unstable();
    paths.dedup();

    let mut bytes = Vec::new();
    for path in paths {
        bytes.extend_from_slice(path.as_bytes());
    }
    md5_hex_digest(bytes)
}

impl ResourceRegistry {
    pub fn new(endpoint_name: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            entries: Vec::new(),
            default_handler: Arc::new(NotFoundHandler),
        }
    }

    /// Binds a handler to a resource. Returns `Ok(())` on success; the
    /// caller is expected to notify the service with an UPDATE report.
    /// Duplicate paths are rejected.
    pub fn register(
        &mut self,
        resource: Resource,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), RegistryError> {
        if resource.path == RECONCILIATION_PATH {
            return Err(RegistryError::ReservedPath(resource.path));
        }
        if self.entries.iter().any(|e| e.resource.path == resource.path) {
            return Err(RegistryError::DuplicatePath(resource.path));
        }

        self.entries.push(Registration { resource, handler });
        // Longest path first; among equal lengths, reverse lexicographic.
        // The catch-all default is held separately and therefore always
        // matches last.
        self.entries.sort_by(|a, b| {
            b.resource
                .path
                .len()
                .cmp(&a.resource.path.len())
                .then_with(|| b.resource.path.cmp(&a.resource.path))
        });
        Ok(())
    }

    /// Replaces the catch-all default handler. Never triggers a server
    /// notification.
    pub fn register_default(&mut self, handler: Arc<dyn RequestHandler>) {
        self.default_handler = handler;
    }

    /// Removes the registration for `resource`'s path. Returns whether an
    /// entry was removed (and the service should be notified).
    pub fn unregister(&mut self, resource: &Resource) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.resource.path != resource.path);
        self.entries.len() != before
    }

    /// Removes every registration bound to `handler`. Returns the removed
    /// resources; a non-empty list warrants a server notification.
    pub fn unregister_handler(&mut self, handler: &Arc<dyn RequestHandler>) -> Vec<Resource> {
        let mut removed = Vec::new();
        self.entries.retain(|e| {
            if Arc::ptr_eq(&e.handler, handler) {
                removed.push(e.resource.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Resolves a handler for the request path and method. The first
    /// entry whose path is a prefix of the request path and whose method
    /// set covers the requested method wins.
    pub fn resolve(&self, path: &str, method: &str) -> Resolved {
        let method = HttpMethod::from_str(method);

        if path == RECONCILIATION_PATH && method == Some(HttpMethod::Post) {
            return Resolved::Reconciliation;
        }

        if let Some(method) = method {
            for entry in &self.entries {
                if path.starts_with(&entry.resource.path) && entry.resource.methods.contains(&method)
                {
                    return Resolved::Handler(Arc::clone(&entry.handler));
                }
            }
        }

        Resolved::Default(Arc::clone(&self.default_handler))
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.entries.iter().map(|e| e.resource.clone()).collect()
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    /// Current reconciliation mark over all registered resource paths.
    pub fn reconciliation_mark(&self) -> String {
        let paths: Vec<&str> = self.entries.iter().map(|e| e.resource.path.as_str()).collect();
        hash_of_paths(&paths)
    }

    /// Body of the built-in reconciliation response: the full resource
    /// list plus the current mark.
    pub fn reconciliation_body(&self) -> Value {
        json!({
            "reportType": ReportType::Reconciliation.as_str(),
            "reconciliationMark": self.reconciliation_mark(),
            "endpointName": self.endpoint_name,
            "resources": self.entries.iter().map(|e| e.resource.to_value()).collect::<Vec<_>>(),
        })
    }
}

/// Default catch-all: answers anything unmatched with 404.
struct NotFoundHandler;

impl RequestHandler for NotFoundHandler {
    fn handle(&self, request: &Message) -> Result<Message, HandlerError> {
        let (url, request_id) = match request.payload() {
            Payload::Request { url, .. } => (url.clone(), request.id().unwrap_or_default().to_string()),
            _ => (String::new(), String::new()),
        };
        Message::response()
            .source(request.destination())
            .destination(request.source())
            .status_code(404)
            .url(url)
            .request_id(request_id)
            .build()
            .map_err(|e| HandlerError(e.to_string()))
    }
}
