use std::num::ParseIntError;

use thiserror::Error;

use crate::{Command, InjectionType};

/// One line of the injector's operator protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Inject {
        kind: InjectionType,
        fetch: bool,
        command: Command,
    },
    Pause,
    Resume,
    Interval {
        millis: u64,
    },
}

#[derive(Debug, Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("invalid integer '{value}' for {context}: {source}")]
    InvalidInteger {
        value: String,
        context: &'static str,
        source: ParseIntError,
    },
    #[error("interval must be positive")]
    ZeroInterval,
}

/// Parse `impulse|repeat|minecart [fetch] [cond] <command>`, `pause`,
/// `resume` or `interval <ms>`.
///
/// The command text is everything after the recognised flags, with its
/// internal spacing preserved.
pub fn parse_control_line(input: &str) -> Result<ControlLine, CommandParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CommandParseError::Empty);
    }

    let (verb, mut rest) = split_word(trimmed);
    let verb = verb.to_ascii_lowercase();

    match verb.as_str() {
        "pause" => Ok(ControlLine::Pause),
        "resume" => Ok(ControlLine::Resume),
        "interval" => {
            let (millis_str, _) = split_word(rest);
            if millis_str.is_empty() {
                return Err(CommandParseError::MissingArgument("interval millis"));
            }
            let millis = parse_u64(millis_str, "interval millis")?;
            if millis == 0 {
                return Err(CommandParseError::ZeroInterval);
            }
            Ok(ControlLine::Interval { millis })
        }
        "impulse" | "repeat" | "minecart" => {
            let kind = verb
                .parse::<InjectionType>()
                .map_err(|_| CommandParseError::UnknownCommand(verb.clone()))?;
            let mut fetch = false;
            let mut conditional = false;
            loop {
                let (word, tail) = split_word(rest);
                match word {
                    "fetch" if !fetch => fetch = true,
                    "cond" if !conditional => conditional = true,
                    _ => break,
                }
                rest = tail;
            }
            if rest.is_empty() {
                return Err(CommandParseError::MissingArgument("command"));
            }
            let mut command = Command::new(rest);
            if conditional {
                command = command.conditional();
            }
            if fetch {
                command = command.tracked();
            }
            Ok(ControlLine::Inject {
                kind,
                fetch,
                command,
            })
        }
        other => Err(CommandParseError::UnknownCommand(other.to_string())),
    }
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(end) => (&input[..end], input[end..].trim_start()),
        None => (input, ""),
    }
}

fn parse_u64(value: &str, context: &'static str) -> Result<u64, CommandParseError> {
    value
        .parse::<u64>()
        .map_err(|source| CommandParseError::InvalidInteger {
            value: value.to_string(),
            context,
            source,
        })
}
