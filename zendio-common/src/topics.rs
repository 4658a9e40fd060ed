//! Topic builders and parsers for the zendio namespace.
//!
//! All bridge traffic lives under a configurable prefix (default
//! `zendio/modbus`):
//!
//! ```text
//! <prefix>/input/<name>/state     retained "ON"/"OFF", published by the bridge
//! <prefix>/relay/<name>/set       "ON"/"OFF" commands, consumed by the bridge
//! <prefix>/relay/<name>/state     retained write confirmations
//! <prefix>/@/status               bridge status (JSON)
//! ```

/// Default topic prefix for all zendio traffic.
pub const DEFAULT_TOPIC_PREFIX: &str = "zendio/modbus";

/// Topic carrying the retained state of a digital input.
pub fn input_state_topic(prefix: &str, name: &str) -> String {
    format!("{}/input/{}/state", prefix, name)
}

/// Topic on which a relay accepts switch commands.
pub fn relay_command_topic(prefix: &str, name: &str) -> String {
    format!("{}/relay/{}/set", prefix, name)
}

/// Topic carrying the retained confirmed state of a relay.
pub fn relay_state_topic(prefix: &str, name: &str) -> String {
    format!("{}/relay/{}/state", prefix, name)
}

/// Wildcard key expression matching the command topics of every relay.
pub fn relay_command_wildcard(prefix: &str) -> String {
    format!("{}/relay/*/set", prefix)
}

/// Key expression for bridge status. The `@` segment marks an
/// administrative channel, not device telemetry.
pub fn status_topic(prefix: &str) -> String {
    format!("{}/@/status", prefix)
}

/// Extract the relay name from a command topic.
///
/// Returns `None` unless the topic is exactly `<prefix>/relay/<name>/set`
/// with a single non-empty name segment.
pub fn parse_relay_command<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/relay/")?;
    let name = rest.strip_suffix("/set")?;

    if name.is_empty() || name.contains('/') {
        return None;
    }

    Some(name)
}

/// Map a command payload to a switch state.
///
/// `"ON"`, `"1"` and `"true"` switch on; anything else (including an empty
/// payload) switches off. There is no third state and no parse error.
pub fn parse_switch_payload(payload: &str) -> bool {
    matches!(payload, "ON" | "1" | "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builders() {
        assert_eq!(
            input_state_topic("zendio/modbus", "door_sensor"),
            "zendio/modbus/input/door_sensor/state"
        );
        assert_eq!(
            relay_command_topic("zendio/modbus", "pump"),
            "zendio/modbus/relay/pump/set"
        );
        assert_eq!(
            relay_state_topic("zendio/modbus", "pump"),
            "zendio/modbus/relay/pump/state"
        );
        assert_eq!(
            relay_command_wildcard("zendio/modbus"),
            "zendio/modbus/relay/*/set"
        );
        assert_eq!(status_topic("zendio/modbus"), "zendio/modbus/@/status");
    }

    #[test]
    fn test_parse_relay_command() {
        let prefix = DEFAULT_TOPIC_PREFIX;

        assert_eq!(
            parse_relay_command(prefix, "zendio/modbus/relay/pump/set"),
            Some("pump")
        );

        // Command and state topics must not be confused.
        assert_eq!(
            parse_relay_command(prefix, "zendio/modbus/relay/pump/state"),
            None
        );
        // Foreign prefix.
        assert_eq!(parse_relay_command(prefix, "other/relay/pump/set"), None);
        // Empty or nested name segments.
        assert_eq!(parse_relay_command(prefix, "zendio/modbus/relay//set"), None);
        assert_eq!(
            parse_relay_command(prefix, "zendio/modbus/relay/a/b/set"),
            None
        );
        // Input topics never parse as commands.
        assert_eq!(
            parse_relay_command(prefix, "zendio/modbus/input/pump/state"),
            None
        );
    }

    #[test]
    fn test_parse_switch_payload() {
        assert!(parse_switch_payload("ON"));
        assert!(parse_switch_payload("1"));
        assert!(parse_switch_payload("true"));

        assert!(!parse_switch_payload("OFF"));
        assert!(!parse_switch_payload("0"));
        assert!(!parse_switch_payload(""));
        assert!(!parse_switch_payload("xyz"));
        // Matching is case-sensitive, as on the wire.
        assert!(!parse_switch_payload("on"));
        assert!(!parse_switch_payload("True"));
    }
}
