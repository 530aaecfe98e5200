//! Runtime vocabulary shared by the injection core and its operator tooling.
//!
//! Holds the command value type, the server log line parsers and the text
//! protocol the injector binary accepts over TCP. Nothing here touches the
//! filesystem or spawns threads.

mod command_text;
mod commands;
mod events;

pub use command_text::{parse_control_line, CommandParseError, ControlLine};
pub use commands::{Command, InjectionType};
pub use events::{ChatEvent, LogEvent, SuccessEvent};
pub use inject_schema::*;
