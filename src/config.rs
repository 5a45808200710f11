use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::json::{deserialize_duration_from_ms, serialize_duration_to_ms};

/// Client behavior knobs. All fields are overridable; durations cross the
/// wire as integer milliseconds.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum number of messages batched into one HTTP exchange.
    pub max_messages_per_connection: usize,

    /// Maximum number of outbound messages held in the dispatch queue.
    pub max_messages_to_queue: usize,

    /// Base retry budget. NO_GUARANTEE messages get this many attempts,
    /// BEST_EFFORT twice as many.
    pub max_retries: u32,

    pub max_handler_threads: usize,

    /// How long the outbound worker sleeps before making a liveness
    /// exchange when no messages are queued.
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub polling_interval: Duration,

    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub response_timeout: Duration,

    /// Bound on inbound server requests waiting for a handler.
    pub server_message_history_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_messages_per_connection: 100,
            max_messages_to_queue: 1000,
            max_retries: 5,
            max_handler_threads: 10,
            polling_interval: Duration::from_millis(5_000),
            response_timeout: Duration::from_millis(15_000),
            server_message_history_capacity: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = ClientConfig::default();
        assert_eq!(config.max_messages_per_connection, 100);
        assert_eq!(config.max_messages_to_queue, 1000);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_handler_threads, 10);
        assert_eq!(config.polling_interval, Duration::from_millis(5_000));
        assert_eq!(config.response_timeout, Duration::from_millis(15_000));
        assert_eq!(config.server_message_history_capacity, 100);
    }

    #[test]
    fn durations_round_trip_as_milliseconds() {
        let config: ClientConfig = serde_json::from_value(json!({
            "polling_interval": 250,
            "max_retries": 2,
        }))
        .unwrap();
        assert_eq!(config.polling_interval, Duration::from_millis(250));
        assert_eq!(config.max_retries, 2);
        // unset fields take defaults
        assert_eq!(config.max_messages_to_queue, 1000);

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["polling_interval"], json!(250));
        assert_eq!(value["response_timeout"], json!(15000));
    }
}
