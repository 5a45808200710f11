//! The message envelope model: immutable, validated message types and
//! their builders. The JSON wire form lives in [`codec`].

mod data;

pub mod codec;

pub use data::{DataItem, DataValue, MAX_KEY_BYTES, MAX_STRING_VALUE_BYTES};

use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::resource::{ReportType, Resource};

/// Queueing priority. Order of declaration is the order of precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Lowest,
    Low,
    Medium,
    High,
    Highest,
}

impl Priority {
    pub const COUNT: usize = 5;

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Lowest => "LOWEST",
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Highest => "HIGHEST",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "LOWEST" => Some(Priority::Lowest),
            "LOW" => Some(Priority::Low),
            "MEDIUM" => Some(Priority::Medium),
            "HIGH" => Some(Priority::High),
            "HIGHEST" => Some(Priority::Highest),
            _ => None,
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }

    pub(crate) fn all_descending() -> [Priority; Priority::COUNT] {
        [
            Priority::Highest,
            Priority::High,
            Priority::Medium,
            Priority::Low,
            Priority::Lowest,
        ]
    }
}

/// Per-message retry-budget class. Not transport-level QoS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reliability {
    NoGuarantee,
    BestEffort,
    GuaranteedDelivery,
}

impl Reliability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reliability::NoGuarantee => "NO_GUARANTEE",
            Reliability::BestEffort => "BEST_EFFORT",
            Reliability::GuaranteedDelivery => "GUARANTEED_DELIVERY",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "NO_GUARANTEE" => Some(Reliability::NoGuarantee),
            "BEST_EFFORT" => Some(Reliability::BestEffort),
            "GUARANTEED_DELIVERY" => Some(Reliability::GuaranteedDelivery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    FromDevice,
    ToDevice,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::FromDevice => "FROM_DEVICE",
            Direction::ToDevice => "TO_DEVICE",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "FROM_DEVICE" => Some(Direction::FromDevice),
            "TO_DEVICE" => Some(Direction::ToDevice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Critical,
    Significant,
    Normal,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::Significant => "SIGNIFICANT",
            Severity::Normal => "NORMAL",
            Severity::Low => "LOW",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "CRITICAL" => Some(Severity::Critical),
            "SIGNIFICANT" => Some(Severity::Significant),
            "NORMAL" => Some(Severity::Normal),
            "LOW" => Some(Severity::Low),
            _ => None,
        }
    }
}

/// Builder-time validation failures. These fire at `build()`, before a
/// message can ever reach a queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message source must not be empty")]
    MissingSource,

    #[error("message format must not be empty")]
    MissingFormat,

    #[error("data message requires at least one data item")]
    EmptyData,

    #[error("alert description must not be empty")]
    MissingDescription,

    #[error("request url must not be empty")]
    MissingUrl,

    #[error("data item key must not be empty")]
    EmptyKey,

    #[error("data item key exceeds {max} UTF-8 bytes (got {bytes})", max = MAX_KEY_BYTES)]
    KeyTooLong { bytes: usize },

    #[error("data item string value exceeds {max} UTF-8 bytes (got {bytes})", max = MAX_STRING_VALUE_BYTES)]
    ValueTooLong { bytes: usize },
}

/// Type-specific message content. Closed set: decode dispatches on the
/// wire `type` tag, one case per concrete message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Data {
        format: String,
        data: Vec<DataItem>,
    },
    Alert {
        format: String,
        description: String,
        severity: Severity,
        data: Vec<DataItem>,
    },
    Request {
        method: String,
        url: String,
        headers: HashMap<String, String>,
        params: HashMap<String, String>,
        body: Vec<u8>,
    },
    Response {
        status_code: u16,
        url: String,
        request_id: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    },
    ResourcesReport {
        report_type: ReportType,
        resources: Vec<Resource>,
        reconciliation_mark: String,
        endpoint_name: String,
    },
}

impl Payload {
    /// Wire `type` tag for this payload kind.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Payload::Data { .. } => "DATA",
            Payload::Alert { .. } => "ALERT",
            Payload::Request { .. } => "REQUEST",
            Payload::Response { .. } => "RESPONSE",
            Payload::ResourcesReport { .. } => "RESOURCES_REPORT",
        }
    }
}

/// One unit of the wire protocol. Immutable once built; construction goes
/// through the per-kind builders which validate required fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) id: Option<String>,
    pub(crate) client_id: String,
    pub(crate) source: String,
    pub(crate) destination: String,
    pub(crate) sender: String,
    pub(crate) priority: Priority,
    pub(crate) reliability: Reliability,
    pub(crate) event_time: i64,
    pub(crate) properties: HashMap<String, String>,
    pub(crate) diagnostics: Option<Value>,
    pub(crate) direction: Option<Direction>,
    pub(crate) received_time: Option<i64>,
    pub(crate) sent_time: Option<i64>,
    pub(crate) payload: Payload,
}

impl Message {
    pub fn data() -> DataMessageBuilder {
        DataMessageBuilder::default()
    }

    pub fn alert() -> AlertMessageBuilder {
        AlertMessageBuilder::default()
    }

    pub fn request() -> RequestMessageBuilder {
        RequestMessageBuilder::default()
    }

    pub fn response() -> ResponseMessageBuilder {
        ResponseMessageBuilder::default()
    }

    pub fn resources_report() -> ResourcesReportBuilder {
        ResourcesReportBuilder::default()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    pub fn event_time(&self) -> i64 {
        self.event_time
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn diagnostics(&self) -> Option<&Value> {
        self.diagnostics.as_ref()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Common envelope fields accumulated by every concrete builder.
#[derive(Debug, Default)]
struct EnvelopeBuilder {
    id: Option<String>,
    client_id: Option<String>,
    source: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    priority: Option<Priority>,
    reliability: Option<Reliability>,
    event_time: Option<i64>,
    properties: HashMap<String, String>,
    diagnostics: Option<Value>,
    direction: Option<Direction>,
}

impl EnvelopeBuilder {
    /// Applies defaults and the envelope-level validation, then seals the
    /// message. Validation happens here, once, never lazily.
    fn finish(self, payload: Payload) -> Result<Message, ValidationError> {
        let source = self
            .source
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingSource)?;

        Ok(Message {
            id: self.id,
            client_id: self
                .client_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            source,
            destination: self.destination.unwrap_or_default(),
            sender: self.sender.unwrap_or_default(),
            priority: self.priority.unwrap_or(Priority::Low),
            reliability: self.reliability.unwrap_or(Reliability::BestEffort),
            event_time: self.event_time.unwrap_or_else(now_millis),
            properties: self.properties,
            diagnostics: self.diagnostics,
            direction: self.direction,
            received_time: None,
            sent_time: None,
            payload,
        })
    }
}

macro_rules! envelope_setters {
    () => {
        pub fn id(mut self, id: impl Into<String>) -> Self {
            self.base.id = Some(id.into());
            self
        }

        pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
            self.base.client_id = Some(client_id.into());
            self
        }

        pub fn source(mut self, source: impl Into<String>) -> Self {
            self.base.source = Some(source.into());
            self
        }

        pub fn destination(mut self, destination: impl Into<String>) -> Self {
            self.base.destination = Some(destination.into());
            self
        }

        pub fn sender(mut self, sender: impl Into<String>) -> Self {
            self.base.sender = Some(sender.into());
            self
        }

        pub fn reliability(mut self, reliability: Reliability) -> Self {
            self.base.reliability = Some(reliability);
            self
        }

        pub fn event_time(mut self, event_time: i64) -> Self {
            self.base.event_time = Some(event_time);
            self
        }

        pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.base.properties.insert(key.into(), value.into());
            self
        }

        pub fn diagnostics(mut self, diagnostics: Value) -> Self {
            self.base.diagnostics = Some(diagnostics);
            self
        }

        pub fn direction(mut self, direction: Direction) -> Self {
            self.base.direction = Some(direction);
            self
        }
    };
}

#[derive(Debug, Default)]
pub struct DataMessageBuilder {
    base: EnvelopeBuilder,
    format: Option<String>,
    data: Vec<DataItem>,
}

impl DataMessageBuilder {
    envelope_setters!();

    pub fn priority(mut self, priority: Priority) -> Self {
        self.base.priority = Some(priority);
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn data_item(mut self, item: DataItem) -> Self {
        self.data.push(item);
        self
    }

    pub fn build(self) -> Result<Message, ValidationError> {
        let format = self
            .format
            .filter(|f| !f.is_empty())
            .ok_or(ValidationError::MissingFormat)?;
        if self.data.is_empty() {
            return Err(ValidationError::EmptyData);
        }
        self.base.finish(Payload::Data {
            format,
            data: self.data,
        })
    }
}

#[derive(Debug)]
pub struct AlertMessageBuilder {
    base: EnvelopeBuilder,
    format: Option<String>,
    description: Option<String>,
    severity: Severity,
    data: Vec<DataItem>,
}

impl Default for AlertMessageBuilder {
    fn default() -> Self {
        Self {
            base: EnvelopeBuilder::default(),
            format: None,
            description: None,
            severity: Severity::Significant,
            data: Vec::new(),
        }
    }
}

impl AlertMessageBuilder {
    // Alerts always go out at HIGHEST priority, so there is no priority
    // setter on this builder.
    envelope_setters!();

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn data_item(mut self, item: DataItem) -> Self {
        self.data.push(item);
        self
    }

    pub fn build(mut self) -> Result<Message, ValidationError> {
        let format = self
            .format
            .filter(|f| !f.is_empty())
            .ok_or(ValidationError::MissingFormat)?;
        let description = self
            .description
            .filter(|d| !d.is_empty())
            .ok_or(ValidationError::MissingDescription)?;

        self.base.priority = Some(Priority::Highest);
        self.base.finish(Payload::Alert {
            format,
            description,
            severity: self.severity,
            data: self.data,
        })
    }
}

#[derive(Debug, Default)]
pub struct RequestMessageBuilder {
    base: EnvelopeBuilder,
    method: Option<String>,
    url: Option<String>,
    headers: HashMap<String, String>,
    params: HashMap<String, String>,
    body: Vec<u8>,
}

impl RequestMessageBuilder {
    envelope_setters!();

    pub fn priority(mut self, priority: Priority) -> Self {
        self.base.priority = Some(priority);
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<Message, ValidationError> {
        let url = self
            .url
            .filter(|u| !u.is_empty())
            .ok_or(ValidationError::MissingUrl)?;
        self.base.finish(Payload::Request {
            method: self.method.unwrap_or_else(|| "GET".to_string()),
            url,
            headers: self.headers,
            params: self.params,
            body: self.body,
        })
    }
}

#[derive(Debug, Default)]
pub struct ResponseMessageBuilder {
    base: EnvelopeBuilder,
    status_code: u16,
    url: String,
    request_id: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl ResponseMessageBuilder {
    envelope_setters!();

    pub fn priority(mut self, priority: Priority) -> Self {
        self.base.priority = Some(priority);
        self
    }

    pub fn status_code(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<Message, ValidationError> {
        self.base.finish(Payload::Response {
            status_code: self.status_code,
            url: self.url,
            request_id: self.request_id,
            headers: self.headers,
            body: self.body,
        })
    }
}

#[derive(Debug, Default)]
pub struct ResourcesReportBuilder {
    base: EnvelopeBuilder,
    report_type: Option<ReportType>,
    resources: Vec<Resource>,
    reconciliation_mark: String,
    endpoint_name: String,
}

impl ResourcesReportBuilder {
    envelope_setters!();

    pub fn priority(mut self, priority: Priority) -> Self {
        self.base.priority = Some(priority);
        self
    }

    pub fn report_type(mut self, report_type: ReportType) -> Self {
        self.report_type = Some(report_type);
        self
    }

    pub fn resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn reconciliation_mark(mut self, mark: impl Into<String>) -> Self {
        self.reconciliation_mark = mark.into();
        self
    }

    pub fn endpoint_name(mut self, endpoint_name: impl Into<String>) -> Self {
        self.endpoint_name = endpoint_name.into();
        self
    }

    pub fn build(self) -> Result<Message, ValidationError> {
        self.base.finish(Payload::ResourcesReport {
            report_type: self.report_type.unwrap_or(ReportType::Update),
            resources: self.resources,
            reconciliation_mark: self.reconciliation_mark,
            endpoint_name: self.endpoint_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_message_applies_envelope_defaults() {
        let message = Message::data()
            .source("device-1")
            .format("urn:test:telemetry")
            .data_item(DataItem::new("temperature", 20.0).unwrap())
            .build()
            .unwrap();

        assert!(!message.client_id().is_empty());
        assert_eq!(message.priority(), Priority::Low);
        assert_eq!(message.reliability(), Reliability::BestEffort);
        assert_eq!(message.destination(), "");
        assert_eq!(message.sender(), "");
        assert!(message.event_time() > 0);
    }

    #[test]
    fn data_message_requires_source_format_and_data() {
        let missing_source = Message::data()
            .format("urn:test")
            .data_item(DataItem::new("k", 1.0).unwrap())
            .build();
        assert_eq!(missing_source.unwrap_err(), ValidationError::MissingSource);

        let missing_format = Message::data()
            .source("device-1")
            .data_item(DataItem::new("k", 1.0).unwrap())
            .build();
        assert_eq!(missing_format.unwrap_err(), ValidationError::MissingFormat);

        let empty_data = Message::data()
            .source("device-1")
            .format("urn:test")
            .build();
        assert_eq!(empty_data.unwrap_err(), ValidationError::EmptyData);
    }

    #[test]
    fn alert_is_forced_to_highest_priority() {
        let message = Message::alert()
            .source("device-1")
            .format("urn:test:alert")
            .description("over temperature")
            .build()
            .unwrap();

        assert_eq!(message.priority(), Priority::Highest);
    }

    #[test]
    fn alert_requires_description() {
        let missing = Message::alert()
            .source("device-1")
            .format("urn:test:alert")
            .build();
        assert_eq!(missing.unwrap_err(), ValidationError::MissingDescription);
    }

    #[test]
    fn request_requires_url() {
        let missing = Message::request().source("server").method("POST").build();
        assert_eq!(missing.unwrap_err(), ValidationError::MissingUrl);
    }

    #[test]
    fn explicit_envelope_fields_are_kept() {
        let message = Message::data()
            .id("srv-1")
            .client_id("client-1")
            .source("device-1")
            .destination("server")
            .sender("gateway")
            .priority(Priority::High)
            .reliability(Reliability::NoGuarantee)
            .event_time(1234)
            .property("x", "y")
            .format("urn:test")
            .data_item(DataItem::new("k", true).unwrap())
            .build()
            .unwrap();

        assert_eq!(message.id(), Some("srv-1"));
        assert_eq!(message.client_id(), "client-1");
        assert_eq!(message.priority(), Priority::High);
        assert_eq!(message.reliability(), Reliability::NoGuarantee);
        assert_eq!(message.event_time(), 1234);
        assert_eq!(message.properties().get("x").unwrap(), "y");
    }
}
