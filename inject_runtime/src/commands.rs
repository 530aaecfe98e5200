use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A single server command queued for injection.
///
/// Commands are shared as `Arc<Command>` and compared by pointer where
/// identity matters: two commands with the same text are still two separate
/// executions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: Option<String>,
    text: String,
    conditional: bool,
    track_output: bool,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            name: None,
            text: text.into(),
            conditional: false,
            track_output: false,
        }
    }

    /// Name reported as the invoker when the command's output is logged.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Only runs when the block behind it in the chain succeeded.
    pub fn conditional(mut self) -> Self {
        self.conditional = true;
        self
    }

    pub fn tracked(mut self) -> Self {
        self.track_output = true;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_conditional(&self) -> bool {
        self.conditional
    }

    pub fn tracks_output(&self) -> bool {
        self.track_output
    }

    pub fn into_shared(self) -> Arc<Command> {
        Arc::new(self)
    }
}

/// Physical encoding a command receives inside a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionType {
    /// Free-floating minecart that runs once and is removed with its packet.
    Minecart,
    /// Chain headed by an impulse block; runs once when loaded.
    Impulse,
    /// Chain headed by a repeating block; runs every tick until replaced.
    Repeat,
}

impl InjectionType {
    pub const ALL: [InjectionType; 3] = [
        InjectionType::Minecart,
        InjectionType::Impulse,
        InjectionType::Repeat,
    ];

    pub fn index(self) -> usize {
        match self {
            InjectionType::Minecart => 0,
            InjectionType::Impulse => 1,
            InjectionType::Repeat => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InjectionType::Minecart => "minecart",
            InjectionType::Impulse => "impulse",
            InjectionType::Repeat => "repeat",
        }
    }
}

impl fmt::Display for InjectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InjectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minecart" | "cart" => Ok(InjectionType::Minecart),
            "impulse" | "once" => Ok(InjectionType::Impulse),
            "repeat" | "repeating" => Ok(InjectionType::Repeat),
            other => Err(format!("unknown injection type '{other}'")),
        }
    }
}
