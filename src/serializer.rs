//! Registry mapping command type tags to command constructors.
//!
//! Each registration binds a tag to one concrete command type. Both sides of
//! the mapping are unique: a tag names exactly one command type, and a command
//! type is registered under exactly one tag, unless the caller forces an
//! overwrite.

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::command::{CallCommand, CallTable, Command, CommandError};
use crate::envelope::Envelope;

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictKind {
    /// The tag is already bound to another command type.
    #[error("type already mapped to command {existing}")]
    TypeAlreadyMapped { existing: &'static str },
    /// The command type is already registered under a tag.
    #[error("command class {command} already mapped as type '{existing_type}'")]
    ClassAlreadyMapped {
        command: &'static str,
        existing_type: String,
    },
}

/// Errors raised by [`CommandSerializer`].
#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("failed to register command type '{command_type}': {kind}")]
    RegistrationConflict {
        command_type: String,
        kind: ConflictKind,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A factory produced a command that reports a different tag than the
    /// one it was registered under.
    #[error("command registered as '{expected}' reports type '{actual}'")]
    InvalidCommandType { expected: String, actual: String },
    #[error("no command registered for type '{0}'")]
    UnknownType(String),
    #[error("malformed command envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type Result<T> = std::result::Result<T, SerializerError>;

type Factory = Box<dyn Fn(Value) -> std::result::Result<Box<dyn Command>, CommandError>>;

struct Registration {
    class: TypeId,
    class_name: &'static str,
    factory: Factory,
}

/// Converts commands to and from their JSON envelope.
#[derive(Default)]
pub struct CommandSerializer {
    registry: HashMap<String, Registration>,
}

impl CommandSerializer {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with [`CallCommand`] registered against `calls`.
    pub fn with_calls(calls: CallTable) -> Self {
        let mut serializer = Self::new();
        serializer.insert::<CallCommand, _>(CallCommand::TYPE, move |data| {
            CallCommand::from_data(&calls, data)
        });
        serializer
    }

    /// Bind `command_type` to the command built by `factory`.
    ///
    /// Unless `force` is set, the tag must be non-blank and free of
    /// whitespace, must not already be bound, and the command type `C` must
    /// not already be registered under another tag. `force` skips every check
    /// and overwrites an existing binding.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::InvalidArgument`] for a bad tag and
    /// [`SerializerError::RegistrationConflict`] when either side of the
    /// mapping is taken.
    pub fn register_command_type<C, F>(
        &mut self,
        command_type: &str,
        factory: F,
        force: bool,
    ) -> Result<()>
    where
        C: Command + 'static,
        F: Fn(Value) -> std::result::Result<C, CommandError> + 'static,
    {
        if !force {
            self.check_registration::<C>(command_type)?;
        }
        self.insert(command_type, factory);
        tracing::debug!(
            command_type,
            command = type_name::<C>(),
            force,
            "Registered command type"
        );
        Ok(())
    }

    fn check_registration<C: 'static>(&self, command_type: &str) -> Result<()> {
        if command_type.trim().is_empty() {
            return Err(SerializerError::InvalidArgument(
                "command type must not be empty".to_owned(),
            ));
        }
        if command_type.chars().any(char::is_whitespace) {
            return Err(SerializerError::InvalidArgument(format!(
                "command type '{command_type}' must not contain whitespace"
            )));
        }
        let class = TypeId::of::<C>();
        if let Some((existing_type, _)) = self.registry.iter().find(|(_, reg)| reg.class == class)
        {
            return Err(SerializerError::RegistrationConflict {
                command_type: command_type.to_owned(),
                kind: ConflictKind::ClassAlreadyMapped {
                    command: type_name::<C>(),
                    existing_type: existing_type.clone(),
                },
            });
        }
        if let Some(existing) = self.registry.get(command_type) {
            return Err(SerializerError::RegistrationConflict {
                command_type: command_type.to_owned(),
                kind: ConflictKind::TypeAlreadyMapped {
                    existing: existing.class_name,
                },
            });
        }
        Ok(())
    }

    fn insert<C, F>(&mut self, command_type: &str, factory: F)
    where
        C: Command + 'static,
        F: Fn(Value) -> std::result::Result<C, CommandError> + 'static,
    {
        // Forcing a tag onto a command type moves the type; drop its old tag.
        let class = TypeId::of::<C>();
        self.registry.retain(|_, reg| reg.class != class);
        self.registry.insert(
            command_type.to_owned(),
            Registration {
                class,
                class_name: type_name::<C>(),
                factory: Box::new(move |data| {
                    factory(data).map(|command| Box::new(command) as Box<dyn Command>)
                }),
            },
        );
    }

    /// Whether `command_type` is bound.
    pub fn is_registered(&self, command_type: &str) -> bool {
        self.registry.contains_key(command_type)
    }

    /// Registered tags in lexical order.
    pub fn command_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.registry.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Wrap `command` in its envelope.
    pub fn envelope(&self, command: &dyn Command) -> Envelope {
        Envelope::new(command.command_type(), command.data())
    }

    /// Serialize `command` to envelope JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Envelope`] if JSON encoding fails.
    pub fn serialize(&self, command: &dyn Command) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.envelope(command))?)
    }

    /// Parse envelope JSON bytes and rebuild the command.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Envelope`] for malformed JSON and any error
    /// from [`CommandSerializer::create_command`].
    pub fn unserialize(&self, payload: &[u8]) -> Result<Box<dyn Command>> {
        let envelope: Envelope = serde_json::from_slice(payload)?;
        self.create_command(&envelope.command_type, envelope.data)
    }

    /// Build the command bound to `command_type` from `data`.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::UnknownType`] for an unbound tag,
    /// [`SerializerError::Command`] if the factory rejects the data and
    /// [`SerializerError::InvalidCommandType`] when the built command reports
    /// a different tag.
    pub fn create_command(&self, command_type: &str, data: Value) -> Result<Box<dyn Command>> {
        let registration = self
            .registry
            .get(command_type)
            .ok_or_else(|| SerializerError::UnknownType(command_type.to_owned()))?;
        let command = (registration.factory)(data)?;
        if command.command_type() != command_type {
            return Err(SerializerError::InvalidCommandType {
                expected: command_type.to_owned(),
                actual: command.command_type().to_owned(),
            });
        }
        Ok(command)
    }
}

impl fmt::Debug for CommandSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSerializer")
            .field("command_types", &self.command_types())
            .finish()
    }
}
