use serde_json::Value;

use super::ValidationError;

/// Maximum UTF-8 length of a data item key.
pub const MAX_KEY_BYTES: usize = 2048;

/// Maximum UTF-8 length of a string data item value.
pub const MAX_STRING_VALUE_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Number(f64),
    Boolean(bool),
    Text(String),
}

impl DataValue {
    /// Name of the carried type, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::Number(_) => "NUMBER",
            DataValue::Boolean(_) => "BOOLEAN",
            DataValue::Text(_) => "STRING",
        }
    }
}

impl From<f64> for DataValue {
    fn from(value: f64) -> Self {
        DataValue::Number(value)
    }
}

impl From<bool> for DataValue {
    fn from(value: bool) -> Self {
        DataValue::Boolean(value)
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        DataValue::Text(value.to_string())
    }
}

impl From<String> for DataValue {
    fn from(value: String) -> Self {
        DataValue::Text(value)
    }
}

impl From<&DataValue> for Value {
    fn from(value: &DataValue) -> Self {
        match value {
            DataValue::Number(n) => Value::from(*n),
            DataValue::Boolean(b) => Value::from(*b),
            DataValue::Text(s) => Value::from(s.as_str()),
        }
    }
}

/// One key/value telemetry sample. Keys and string values are
/// length-checked at construction, before the item can ever reach a
/// message builder.
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    key: String,
    value: DataValue,
}

impl DataItem {
    pub fn new(key: impl Into<String>, value: impl Into<DataValue>) -> Result<Self, ValidationError> {
        let key = key.into();
        let value = value.into();

        if key.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        if key.len() > MAX_KEY_BYTES {
            return Err(ValidationError::KeyTooLong { bytes: key.len() });
        }
        if let DataValue::Text(text) = &value {
            if text.len() > MAX_STRING_VALUE_BYTES {
                return Err(ValidationError::ValueTooLong { bytes: text.len() });
            }
        }

        Ok(Self { key, value })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &DataValue {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_each_value_kind() {
        let number = DataItem::new("temperature", 21.5).unwrap();
        assert_eq!(number.value(), &DataValue::Number(21.5));
        assert_eq!(number.value().type_name(), "NUMBER");

        let boolean = DataItem::new("active", true).unwrap();
        assert_eq!(boolean.value(), &DataValue::Boolean(true));

        let text = DataItem::new("unit", "celsius").unwrap();
        assert_eq!(text.value(), &DataValue::Text("celsius".to_string()));
    }

    #[test]
    fn rejects_empty_and_oversized_keys() {
        assert!(matches!(
            DataItem::new("", 1.0),
            Err(ValidationError::EmptyKey)
        ));
        let long_key = "k".repeat(MAX_KEY_BYTES + 1);
        assert!(matches!(
            DataItem::new(long_key, 1.0),
            Err(ValidationError::KeyTooLong { .. })
        ));
        // at the limit is fine
        assert!(DataItem::new("k".repeat(MAX_KEY_BYTES), 1.0).is_ok());
    }

    #[test]
    fn rejects_oversized_string_values() {
        let long_value = "v".repeat(MAX_STRING_VALUE_BYTES + 1);
        assert!(matches!(
            DataItem::new("key", long_value),
            Err(ValidationError::ValueTooLong { .. })
        ));
        assert!(DataItem::new("key", "v".repeat(MAX_STRING_VALUE_BYTES)).is_ok());
    }
}
