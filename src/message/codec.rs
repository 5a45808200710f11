//! Canonical JSON wire form for [`Message`]. Field names here are part
//! of the external interface; parsing is strict and every violated field
//! surfaces as its own error, never a silent default.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::resource::{HttpMethod, ReportType, Resource, ResourceStatus};
use crate::util::crypto::{base64_decode, base64_encode};

use super::{
    now_millis, DataItem, DataValue, Direction, Message, Payload, Priority, Reliability, Severity,
    ValidationError,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is not a {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("unknown priority '{0}'")]
    UnknownPriority(String),

    #[error("unknown reliability '{0}'")]
    UnknownReliability(String),

    #[error("unknown direction '{0}'")]
    UnknownDirection(String),

    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),

    #[error("unknown report type '{0}'")]
    UnknownReportType(String),

    #[error("unknown resource status '{0}'")]
    UnknownResourceStatus(String),

    #[error("unknown method '{0}' in resource methods")]
    UnknownMethod(String),

    #[error("field '{0}' is not valid base64")]
    InvalidBase64(&'static str),

    #[error("rejected data item: {0}")]
    InvalidDataItem(#[from] ValidationError),
}

/// Encodes one message into its wire object.
pub fn to_json(message: &Message) -> Value {
    let mut object = Map::new();

    if let Some(id) = &message.id {
        object.insert("id".to_string(), Value::from(id.as_str()));
    }
    object.insert("clientId".to_string(), Value::from(message.client_id.as_str()));
    object.insert("source".to_string(), Value::from(message.source.as_str()));
    object.insert(
        "destination".to_string(),
        Value::from(message.destination.as_str()),
    );
    object.insert("priority".to_string(), Value::from(message.priority.as_str()));
    object.insert(
        "reliability".to_string(),
        Value::from(message.reliability.as_str()),
    );
    object.insert("eventTime".to_string(), Value::from(message.event_time));
    object.insert("sender".to_string(), Value::from(message.sender.as_str()));
    object.insert(
        "type".to_string(),
        Value::from(message.payload.type_tag()),
    );
    object.insert(
        "properties".to_string(),
        Value::Object(
            message
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                .collect(),
        ),
    );
    if let Some(direction) = message.direction {
        object.insert("direction".to_string(), Value::from(direction.as_str()));
    }
    if let Some(received_time) = message.received_time {
        object.insert("receivedTime".to_string(), Value::from(received_time));
    }
    if let Some(sent_time) = message.sent_time {
        object.insert("sentTime".to_string(), Value::from(sent_time));
    }
    if let Some(diagnostics) = &message.diagnostics {
        object.insert("diagnostics".to_string(), diagnostics.clone());
    }
    object.insert("payload".to_string(), payload_to_json(&message.payload));

    Value::Object(object)
}

/// Encodes a batch as the JSON array the messages endpoint expects.
pub fn batch_to_json(messages: &[Message]) -> Value {
    Value::Array(messages.iter().map(to_json).collect())
}

fn payload_to_json(payload: &Payload) -> Value {
    match payload {
        Payload::Data { format, data } => json!({
            "format": format,
            "data": data_to_json(data),
        }),
        Payload::Alert {
            format,
            description,
            severity,
            data,
        } => json!({
            "format": format,
            "description": description,
            "severity": severity.as_str(),
            "data": data_to_json(data),
        }),
        Payload::Request {
            method,
            url,
            headers,
            params,
            body,
        } => json!({
            "method": method,
            "url": url,
            "headers": headers,
            "params": params,
            "body": base64_encode(body),
        }),
        Payload::Response {
            status_code,
            url,
            request_id,
            headers,
            body,
        } => json!({
            "statusCode": status_code,
            "url": url,
            "requestId": request_id,
            "headers": headers,
            "body": base64_encode(body),
        }),
        Payload::ResourcesReport {
            report_type,
            resources,
            reconciliation_mark,
            endpoint_name,
        } => json!({
            "reportType": report_type.as_str(),
            "reconciliationMark": reconciliation_mark,
            "endpointName": endpoint_name,
            "resources": resources.iter().map(|r| r.to_value()).collect::<Vec<_>>(),
        }),
    }
}

fn data_to_json(data: &[DataItem]) -> Value {
    Value::Object(
        data.iter()
            .map(|item| (item.key().to_string(), Value::from(item.value())))
            .collect(),
    )
}

/// Decodes one wire object into a message, dispatching on the `type`
/// tag. Any missing or ill-typed required field fails the whole message.
pub fn from_json(value: &Value) -> Result<Message, ParseError> {
    let object = value.as_object().ok_or(ParseError::NotAnObject)?;

    let type_tag = req_str(object, "type")?;

    let source = req_str(object, "source")?;
    if source.is_empty() {
        return Err(ParseError::InvalidField {
            field: "source",
            expected: "non-empty string",
        });
    }

    let priority = match opt_str(object, "priority")? {
        Some(value) => {
            Priority::from_str(value).ok_or_else(|| ParseError::UnknownPriority(value.to_string()))?
        }
        None => Priority::Low,
    };
    let reliability = match opt_str(object, "reliability")? {
        Some(value) => Reliability::from_str(value)
            .ok_or_else(|| ParseError::UnknownReliability(value.to_string()))?,
        None => Reliability::BestEffort,
    };
    let direction = match opt_str(object, "direction")? {
        Some(value) => Some(
            Direction::from_str(value)
                .ok_or_else(|| ParseError::UnknownDirection(value.to_string()))?,
        ),
        None => None,
    };

    let payload_value = object.get("payload").ok_or(ParseError::MissingField("payload"))?;
    let payload_object = payload_value.as_object().ok_or(ParseError::InvalidField {
        field: "payload",
        expected: "object",
    })?;

    let payload = match type_tag {
        "DATA" => decode_data(payload_object)?,
        "ALERT" => decode_alert(payload_object)?,
        "REQUEST" => decode_request(payload_object)?,
        "RESPONSE" => decode_response(payload_object)?,
        "RESOURCES_REPORT" => decode_resources_report(payload_object)?,
        other => return Err(ParseError::UnknownType(other.to_string())),
    };

    Ok(Message {
        id: opt_str(object, "id")?.map(str::to_string),
        client_id: opt_str(object, "clientId")?
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        source: source.to_string(),
        destination: opt_str(object, "destination")?.unwrap_or_default().to_string(),
        sender: opt_str(object, "sender")?.unwrap_or_default().to_string(),
        priority,
        reliability,
        event_time: opt_i64(object, "eventTime")?.unwrap_or_else(now_millis),
        properties: opt_string_map(object, "properties")?,
        diagnostics: object.get("diagnostics").cloned(),
        direction,
        received_time: opt_i64(object, "receivedTime")?,
        sent_time: opt_i64(object, "sentTime")?,
        payload,
    })
}

/// Decodes the JSON array returned by the messages endpoint.
pub fn from_json_array(value: &Value) -> Result<Vec<Message>, ParseError> {
    let array = value.as_array().ok_or(ParseError::InvalidField {
        field: "(response)",
        expected: "array",
    })?;
    array.iter().map(from_json).collect()
}

fn decode_data(payload: &Map<String, Value>) -> Result<Payload, ParseError> {
    let format = req_nonempty_str(payload, "format")?;
    if payload.get("data").is_none() {
        return Err(ParseError::MissingField("data"));
    }
    // same invariant the builder enforces
    let data = decode_data_items(payload)?;
    if data.is_empty() {
        return Err(ParseError::InvalidField {
            field: "data",
            expected: "object with at least one item",
        });
    }
    Ok(Payload::Data {
        format: format.to_string(),
        data,
    })
}

fn decode_alert(payload: &Map<String, Value>) -> Result<Payload, ParseError> {
    let format = req_nonempty_str(payload, "format")?;
    let description = req_nonempty_str(payload, "description")?;
    let severity = match opt_str(payload, "severity")? {
        Some(value) => {
            Severity::from_str(value).ok_or_else(|| ParseError::UnknownSeverity(value.to_string()))?
        }
        None => Severity::Significant,
    };
    Ok(Payload::Alert {
        format: format.to_string(),
        description: description.to_string(),
        severity,
        data: decode_data_items(payload)?,
    })
}

fn decode_data_items(payload: &Map<String, Value>) -> Result<Vec<DataItem>, ParseError> {
    let Some(value) = payload.get("data") else {
        return Ok(Vec::new());
    };
    let object = value.as_object().ok_or(ParseError::InvalidField {
        field: "data",
        expected: "object",
    })?;

    let mut items = Vec::with_capacity(object.len());
    for (key, value) in object {
        let value = match value {
            Value::Number(n) => {
                DataValue::Number(n.as_f64().ok_or(ParseError::InvalidField {
                    field: "data",
                    expected: "finite number",
                })?)
            }
            Value::Bool(b) => DataValue::Boolean(*b),
            Value::String(s) => DataValue::Text(s.clone()),
            _ => {
                return Err(ParseError::InvalidField {
                    field: "data",
                    expected: "number, boolean or string value",
                })
            }
        };
        items.push(DataItem::new(key.clone(), value)?);
    }
    Ok(items)
}

fn decode_request(payload: &Map<String, Value>) -> Result<Payload, ParseError> {
    Ok(Payload::Request {
        method: opt_str(payload, "method")?.unwrap_or("GET").to_string(),
        url: req_nonempty_str(payload, "url")?.to_string(),
        headers: opt_string_map(payload, "headers")?,
        params: opt_string_map(payload, "params")?,
        body: decode_body(payload)?,
    })
}

fn decode_response(payload: &Map<String, Value>) -> Result<Payload, ParseError> {
    let status_code = payload
        .get("statusCode")
        .ok_or(ParseError::MissingField("statusCode"))?
        .as_u64()
        .and_then(|code| u16::try_from(code).ok())
        .ok_or(ParseError::InvalidField {
            field: "statusCode",
            expected: "HTTP status number",
        })?;
    let request_id = req_str(payload, "requestId")?;

    Ok(Payload::Response {
        status_code,
        url: opt_str(payload, "url")?.unwrap_or_default().to_string(),
        request_id: request_id.to_string(),
        headers: opt_string_map(payload, "headers")?,
        body: decode_body(payload)?,
    })
}

fn decode_resources_report(payload: &Map<String, Value>) -> Result<Payload, ParseError> {
    let report_type_str = req_str(payload, "reportType")?;
    let report_type = ReportType::from_str(report_type_str)
        .ok_or_else(|| ParseError::UnknownReportType(report_type_str.to_string()))?;

    let mut resources = Vec::new();
    if let Some(value) = payload.get("resources") {
        let array = value.as_array().ok_or(ParseError::InvalidField {
            field: "resources",
            expected: "array",
        })?;
        for entry in array {
            resources.push(decode_resource(entry)?);
        }
    }

    Ok(Payload::ResourcesReport {
        report_type,
        resources,
        reconciliation_mark: opt_str(payload, "reconciliationMark")?
            .unwrap_or_default()
            .to_string(),
        endpoint_name: opt_str(payload, "endpointName")?.unwrap_or_default().to_string(),
    })
}

fn decode_resource(value: &Value) -> Result<Resource, ParseError> {
    let object = value.as_object().ok_or(ParseError::InvalidField {
        field: "resources",
        expected: "array of objects",
    })?;

    let status_str = req_str(object, "status")?;
    let status = ResourceStatus::from_str(status_str)
        .ok_or_else(|| ParseError::UnknownResourceStatus(status_str.to_string()))?;

    let mut methods = Vec::new();
    if let Some(value) = object.get("methods") {
        let array = value.as_array().ok_or(ParseError::InvalidField {
            field: "methods",
            expected: "array",
        })?;
        for entry in array {
            let name = entry.as_str().ok_or(ParseError::InvalidField {
                field: "methods",
                expected: "array of strings",
            })?;
            methods.push(
                HttpMethod::from_str(name)
                    .ok_or_else(|| ParseError::UnknownMethod(name.to_string()))?,
            );
        }
    }
    // methods are required for everything except removal markers
    if methods.is_empty() && status != ResourceStatus::Removed {
        return Err(ParseError::MissingField("methods"));
    }

    Ok(Resource {
        endpoint_name: opt_str(object, "endpointName")?.map(str::to_string),
        name: req_str(object, "name")?.to_string(),
        path: req_str(object, "path")?.to_string(),
        status,
        methods,
    })
}

fn decode_body(payload: &Map<String, Value>) -> Result<Vec<u8>, ParseError> {
    match payload.get("body") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => base64_decode(s).map_err(|_| ParseError::InvalidBase64("body")),
        Some(_) => Err(ParseError::InvalidField {
            field: "body",
            expected: "base64 string",
        }),
    }
}

fn req_str<'a>(object: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, ParseError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(ParseError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ParseError::InvalidField {
            field,
            expected: "string",
        }),
    }
}

fn req_nonempty_str<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ParseError> {
    let value = req_str(object, field)?;
    if value.is_empty() {
        return Err(ParseError::InvalidField {
            field,
            expected: "non-empty string",
        });
    }
    Ok(value)
}

fn opt_str<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, ParseError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ParseError::InvalidField {
            field,
            expected: "string",
        }),
    }
}

fn opt_i64(object: &Map<String, Value>, field: &'static str) -> Result<Option<i64>, ParseError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or(ParseError::InvalidField {
                field,
                expected: "integer",
            }),
    }
}

fn opt_string_map(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<HashMap<String, String>, ParseError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(HashMap::new()),
        Some(Value::Object(map)) => {
            let mut out = HashMap::with_capacity(map.len());
            for (key, value) in map {
                let value = value.as_str().ok_or(ParseError::InvalidField {
                    field,
                    expected: "object of strings",
                })?;
                out.insert(key.clone(), value.to_string());
            }
            Ok(out)
        }
        Some(_) => Err(ParseError::InvalidField {
            field,
            expected: "object",
        }),
    }
}
