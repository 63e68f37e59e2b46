//! Commands built into the daemon.

use std::process;

use anyhow::Context;
use qman_lib::{Command, CommandError, CommandSerializer, SerializerError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Runs a program; succeeds when it exits with status 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecCommand {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

impl ExecCommand {
    pub const TYPE: &'static str = "qman.exec";

    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// # Errors
    ///
    /// Returns [`CommandError::InvalidData`] unless `data` is
    /// `{"program": ..., "args": [...]}`.
    pub fn from_data(data: Value) -> Result<Self, CommandError> {
        serde_json::from_value(data).map_err(|source| CommandError::InvalidData {
            command_type: Self::TYPE.to_owned(),
            source,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Command for ExecCommand {
    fn command_type(&self) -> &str {
        Self::TYPE
    }

    fn data(&self) -> Value {
        serde_json::json!({"program": self.program, "args": self.args})
    }

    fn execute(&mut self) -> anyhow::Result<bool> {
        let status = process::Command::new(&self.program)
            .args(&self.args)
            .stdin(process::Stdio::null())
            .status()
            .with_context(|| format!("failed to spawn {}", self.program))?;
        debug!(program = %self.program, status = %status, "Program exited");
        Ok(status.success())
    }
}

/// Register the daemon's built-in commands with `serializer`.
///
/// # Errors
///
/// Returns a [`SerializerError`] if a built-in tag is already bound.
pub fn register_builtin_commands(serializer: &mut CommandSerializer) -> Result<(), SerializerError> {
    serializer.register_command_type(ExecCommand::TYPE, ExecCommand::from_data, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("true", true)]
    #[case("false", false)]
    fn exit_status_decides_success(#[case] program: &str, #[case] expected: bool) {
        let mut command = ExecCommand::new(program, Vec::new());
        assert_eq!(command.execute().expect("spawn"), expected);
    }

    #[rstest]
    fn arguments_are_passed() {
        let mut command = ExecCommand::new("sh", vec!["-c".to_owned(), "exit 3".to_owned()]);
        assert!(!command.execute().expect("spawn"));
    }

    #[rstest]
    fn missing_program_is_an_error() {
        let mut command = ExecCommand::new("/nonexistent/qman-test-binary", Vec::new());
        let err = command.execute().expect_err("spawn fails");
        assert!(err.to_string().contains("/nonexistent/qman-test-binary"));
    }

    #[rstest]
    fn builtins_round_trip_through_the_serializer() {
        let mut serializer = CommandSerializer::new();
        register_builtin_commands(&mut serializer).expect("register");
        let command = ExecCommand::new("echo", vec!["hi".to_owned()]);
        let bytes = serializer.serialize(&command).expect("serialize");
        let decoded = serializer.unserialize(&bytes).expect("unserialize");
        assert_eq!(decoded.command_type(), ExecCommand::TYPE);
        assert_eq!(decoded.data(), json!({"program": "echo", "args": ["hi"]}));
    }

    #[rstest]
    fn registering_twice_conflicts() {
        let mut serializer = CommandSerializer::new();
        register_builtin_commands(&mut serializer).expect("register");
        assert!(matches!(
            register_builtin_commands(&mut serializer),
            Err(SerializerError::RegistrationConflict { .. })
        ));
    }

    #[rstest]
    #[case(json!({"args": []}))]
    #[case(json!({"program": "true", "env": {}}))]
    #[case(json!("true"))]
    fn rejects_malformed_data(#[case] data: Value) {
        assert!(ExecCommand::from_data(data).is_err());
    }
}
