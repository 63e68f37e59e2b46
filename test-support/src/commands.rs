//! A command whose result is chosen by its payload.

use anyhow::bail;
use qman_lib::{Command, CommandError, CommandSerializer, Envelope};
use serde_json::{Value, json};

/// What a [`ScriptedCommand`] does when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail,
    Error,
    Panic,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Succeed => "succeed",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Panic => "panic",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "succeed" => Some(Self::Succeed),
            "fail" => Some(Self::Fail),
            "error" => Some(Self::Error),
            "panic" => Some(Self::Panic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCommand {
    outcome: Outcome,
}

impl ScriptedCommand {
    pub const TYPE: &'static str = "test.scripted";

    pub fn new(outcome: Outcome) -> Self {
        Self { outcome }
    }

    /// # Errors
    ///
    /// Returns [`CommandError::InvalidData`] unless `data` is
    /// `{"outcome": <name>}` with a known outcome.
    pub fn from_data(data: Value) -> Result<Self, CommandError> {
        let name = data.get("outcome").and_then(Value::as_str).unwrap_or_default();
        Outcome::parse(name).map(Self::new).ok_or_else(|| {
            let source = <serde_json::Error as serde::de::Error>::custom(format!(
                "unknown outcome '{name}'"
            ));
            CommandError::InvalidData {
                command_type: Self::TYPE.to_owned(),
                source,
            }
        })
    }
}

impl Command for ScriptedCommand {
    fn command_type(&self) -> &str {
        Self::TYPE
    }

    fn data(&self) -> Value {
        json!({"outcome": self.outcome.as_str()})
    }

    fn execute(&mut self) -> anyhow::Result<bool> {
        match self.outcome {
            Outcome::Succeed => Ok(true),
            Outcome::Fail => Ok(false),
            Outcome::Error => bail!("scripted error"),
            Outcome::Panic => panic!("scripted panic"),
        }
    }
}

/// A serializer with [`ScriptedCommand`] registered.
///
/// # Panics
///
/// Never in practice; registration into an empty registry cannot conflict.
pub fn scripted_serializer() -> CommandSerializer {
    let mut serializer = CommandSerializer::new();
    if let Err(e) =
        serializer.register_command_type(ScriptedCommand::TYPE, ScriptedCommand::from_data, false)
    {
        panic!("registering the scripted command failed: {e}");
    }
    serializer
}

/// Envelope bytes for a scripted command with `outcome`.
pub fn scripted_payload(outcome: Outcome) -> Vec<u8> {
    let envelope = Envelope::new(ScriptedCommand::TYPE, json!({"outcome": outcome.as_str()}));
    serde_json::to_vec(&envelope).unwrap_or_default()
}
