//! Typed views of server log lines.
//!
//! Each parser is a pure function from one line to at most one event.

use once_cell::sync::Lazy;
use regex::Regex;

static GENERIC_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[([^\]]*)\] \[([^\]/]+)/([A-Z]+)\]: (.*)$").expect("generic log pattern")
});

static CHAT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[([^\]]*)\] \[Server thread/INFO\]: <([^>]+)> (.*)$").expect("chat log pattern")
});

static SUCCESS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(\d{2}:\d{2}:\d{2})\] \[Server thread/INFO\]: \[([^:\]]+): (.*)\]$")
        .expect("success log pattern")
});

/// Any log line. Lines outside the `[time] [thread/LEVEL]: message` shape
/// keep only their raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub line: String,
    pub time: Option<String>,
    pub thread: Option<String>,
    pub level: Option<String>,
    pub message: String,
}

impl LogEvent {
    pub fn parse(line: &str) -> Option<LogEvent> {
        if line.trim().is_empty() {
            return None;
        }
        let event = match GENERIC_LINE.captures(line) {
            Some(captures) => LogEvent {
                line: line.to_string(),
                time: Some(captures[1].to_string()),
                thread: Some(captures[2].to_string()),
                level: Some(captures[3].to_string()),
                message: captures[4].to_string(),
            },
            None => LogEvent {
                line: line.to_string(),
                time: None,
                thread: None,
                level: None,
                message: line.to_string(),
            },
        };
        Some(event)
    }
}

/// A player chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub time: String,
    pub user: String,
    pub message: String,
}

impl ChatEvent {
    pub fn parse(line: &str) -> Option<ChatEvent> {
        let captures = CHAT_LINE.captures(line)?;
        Some(ChatEvent {
            time: captures[1].to_string(),
            user: captures[2].to_string(),
            message: captures[3].to_string(),
        })
    }
}

/// Command output echoed to the log under the invoking block's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessEvent {
    pub time: String,
    pub invoker: String,
    pub message: String,
}

impl SuccessEvent {
    pub fn parse(line: &str) -> Option<SuccessEvent> {
        let captures = SUCCESS_LINE.captures(line)?;
        Some(SuccessEvent {
            time: captures[1].to_string(),
            invoker: captures[2].to_string(),
            message: captures[3].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_line() {
        let event = SuccessEvent::parse("[12:00:00] [Server thread/INFO]: [probe7: ok]").unwrap();
        assert_eq!(event.time, "12:00:00");
        assert_eq!(event.invoker, "probe7");
        assert_eq!(event.message, "ok");
    }

    #[test]
    fn success_message_may_contain_colons_and_brackets() {
        let line = "[08:15:42] [Server thread/INFO]: [default-3: Set the time to 1000: [done]]";
        let event = SuccessEvent::parse(line).unwrap();
        assert_eq!(event.invoker, "default-3");
        assert_eq!(event.message, "Set the time to 1000: [done]");
    }

    #[test]
    fn success_requires_clock_time_and_server_thread() {
        assert!(SuccessEvent::parse("[12:00] [Server thread/INFO]: [probe7: ok]").is_none());
        assert!(SuccessEvent::parse("[12:00:00] [User Authenticator #1/INFO]: [probe7: ok]").is_none());
        assert!(SuccessEvent::parse("[12:00:00] [Server thread/INFO]: <probe7> ok").is_none());
    }

    #[test]
    fn parses_chat_line() {
        let event = ChatEvent::parse("[09:01:02] [Server thread/INFO]: <Alex> hello > world").unwrap();
        assert_eq!(event.user, "Alex");
        assert_eq!(event.message, "hello > world");
        assert!(ChatEvent::parse("[09:01:02] [Server thread/INFO]: Alex joined the game").is_none());
        assert!(ChatEvent::parse("[09:01:02] [Server thread/WARN]: <Alex> hello").is_none());
    }

    #[test]
    fn generic_line_keeps_unstructured_text() {
        let event =
            LogEvent::parse("[09:01:02] [Server thread/WARN]: Can't keep up!").unwrap();
        assert_eq!(event.thread.as_deref(), Some("Server thread"));
        assert_eq!(event.level.as_deref(), Some("WARN"));
        assert_eq!(event.message, "Can't keep up!");

        let raw = LogEvent::parse("\tat java.lang.Thread.run(Thread.java:748)").unwrap();
        assert_eq!(raw.time, None);
        assert_eq!(raw.message, raw.line);
        assert!(LogEvent::parse("   ").is_none());
    }
}
