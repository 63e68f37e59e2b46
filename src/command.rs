//! Units of work carried by queued jobs.
//!
//! A [`Command`] reports a stable type tag, exposes its data as JSON and can
//! be executed. The tag and data are all that travels over the wire; the
//! [`crate::CommandSerializer`] rebuilds the command on the worker side.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A unit of work that can be queued, serialized and executed.
pub trait Command {
    /// Registry tag under which this command is serialized.
    fn command_type(&self) -> &str;

    /// JSON data sufficient to reconstruct the command.
    fn data(&self) -> Value;

    /// Run the command.
    ///
    /// `Ok(true)` means success. `Ok(false)` and `Err` both count as a
    /// failure and hand the job to the failure strategy.
    ///
    /// # Errors
    ///
    /// Returns whatever error the command's work raised.
    fn execute(&mut self) -> anyhow::Result<bool>;
}

impl fmt::Debug for dyn Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("type", &self.command_type())
            .field("data", &self.data())
            .finish()
    }
}

/// Errors raised while constructing a command from its data.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The data did not match the command's expected shape.
    #[error("invalid data for command type '{command_type}': {source}")]
    InvalidData {
        command_type: String,
        #[source]
        source: serde_json::Error,
    },
    /// A call command named a function that is not in its call table.
    #[error("function '{0}' is not registered in the call table")]
    UnknownFunction(String),
}

/// A function that can be invoked by a [`CallCommand`].
pub type CallFn = Rc<dyn Fn(&[Value]) -> anyhow::Result<bool>>;

/// Named functions available to deferred calls.
///
/// Producers and workers must register the same names; only the name and the
/// arguments are serialized.
#[derive(Clone, Default)]
pub struct CallTable {
    functions: HashMap<String, CallFn>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&[Value]) -> anyhow::Result<bool> + 'static,
    {
        self.functions.insert(name.into(), Rc::new(function));
        self
    }

    pub fn get(&self, name: &str) -> Option<CallFn> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl fmt::Debug for CallTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("CallTable").field("functions", &names).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CallPayload {
    function: String,
    #[serde(default)]
    args: Vec<Value>,
}

/// Deferred invocation of a named function from a [`CallTable`].
///
/// Serialized as `{"function": <name>, "args": [...]}` under the
/// [`CallCommand::TYPE`] tag.
pub struct CallCommand {
    payload: CallPayload,
    function: CallFn,
}

impl CallCommand {
    pub const TYPE: &'static str = "qman.call";

    /// Build a call to `function` with `args`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnknownFunction`] when `function` is not in
    /// `table`.
    pub fn new(table: &CallTable, function: &str, args: Vec<Value>) -> Result<Self, CommandError> {
        let resolved = table
            .get(function)
            .ok_or_else(|| CommandError::UnknownFunction(function.to_owned()))?;
        Ok(Self {
            payload: CallPayload {
                function: function.to_owned(),
                args,
            },
            function: resolved,
        })
    }

    /// Rebuild a call from its serialized data.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidData`] for malformed data and
    /// [`CommandError::UnknownFunction`] when the function is not in `table`.
    pub fn from_data(table: &CallTable, data: Value) -> Result<Self, CommandError> {
        let payload: CallPayload =
            serde_json::from_value(data).map_err(|source| CommandError::InvalidData {
                command_type: Self::TYPE.to_owned(),
                source,
            })?;
        Self::new(table, &payload.function, payload.args)
    }

    pub fn function_name(&self) -> &str {
        &self.payload.function
    }

    pub fn args(&self) -> &[Value] {
        &self.payload.args
    }
}

impl Command for CallCommand {
    fn command_type(&self) -> &str {
        Self::TYPE
    }

    fn data(&self) -> Value {
        serde_json::json!({
            "function": self.payload.function,
            "args": self.payload.args,
        })
    }

    fn execute(&mut self) -> anyhow::Result<bool> {
        (self.function)(&self.payload.args)
    }
}
