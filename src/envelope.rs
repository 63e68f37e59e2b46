//! Wire format shared by producers and workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serialized form of a command: a registry tag plus the command's own data.
///
/// The envelope carries exactly two keys, `type` and `data`; anything else is
/// rejected when parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub command_type: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(command_type: impl Into<String>, data: Value) -> Self {
        Self {
            command_type: command_type.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    fn serializes_with_type_and_data_keys() {
        let envelope = Envelope::new("mail.send", json!({"to": "ops@example.org"}));
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(
            value,
            json!({"type": "mail.send", "data": {"to": "ops@example.org"}})
        );
    }

    #[rstest]
    #[case::missing_data(r#"{"type": "x"}"#)]
    #[case::missing_type(r#"{"data": {}}"#)]
    #[case::extra_key(r#"{"type": "x", "data": {}, "priority": 1}"#)]
    #[case::not_an_object(r#"["x", {}]"#)]
    #[case::garbage("{ not json")]
    fn rejects_malformed_envelopes(#[case] input: &str) {
        assert!(serde_json::from_str::<Envelope>(input).is_err());
    }

    #[rstest]
    fn accepts_null_data() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type": "noop", "data": null}"#).expect("parse");
        assert_eq!(envelope.command_type, "noop");
        assert_eq!(envelope.data, Value::Null);
    }
}
