//! Per-component trace loggers.
//!
//! Control via DEBUG environment variable:
//! - `DEBUG=*` - Enable all loggers
//! - `DEBUG=state` - Enable only the state cache logger
//! - `DEBUG=state,autostep` - Enable multiple
//!
//! Verbosity via DEBUG_VERBOSITY (0-3, default 1). Level 1 emits `log!`
//! records at debug level, level 2 adds `log_detail!` records at trace
//! level. Records go to the `log` facade with the logger name as target.

use std::collections::HashSet;
use std::env;
use std::sync::OnceLock;

/// Which loggers `DEBUG` turns on
#[derive(Debug, Clone, PartialEq, Eq)]
enum Selection {
    Everything,
    Nothing,
    Named(HashSet<String>),
}

impl Selection {
    fn parse(value: Option<&str>) -> Self {
        let value = match value.map(str::trim) {
            None | Some("") => return Selection::Nothing,
            Some("*" | "1" | "true") => return Selection::Everything,
            Some(v) => v,
        };
        let names: HashSet<String> = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            Selection::Nothing
        } else {
            Selection::Named(names)
        }
    }

    fn includes(&self, name: &str) -> bool {
        match self {
            Selection::Everything => true,
            Selection::Nothing => false,
            Selection::Named(names) => names.contains(name),
        }
    }
}

struct Settings {
    selection: Selection,
    verbosity: u8,
}

fn parse_verbosity(value: Option<&str>) -> u8 {
    value.and_then(|v| v.trim().parse::<u8>().ok()).map_or(1, |v| v.min(3))
}

fn settings() -> &'static Settings {
    static SETTINGS: OnceLock<Settings> = OnceLock::new();
    SETTINGS.get_or_init(|| Settings {
        selection: Selection::parse(env::var("DEBUG").ok().as_deref()),
        verbosity: parse_verbosity(env::var("DEBUG_VERBOSITY").ok().as_deref()),
    })
}

/// A named trace channel. Disabled loggers cost one branch per call site.
#[derive(Debug)]
pub struct Logger {
    name: &'static str,
    enabled: bool,
}

impl Logger {
    pub const fn disabled() -> Self {
        Self { name: "", enabled: false }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn emit(&self, level: log::Level, min_verbosity: u8, msg: &str) {
        if self.enabled && settings().verbosity >= min_verbosity {
            log::log!(target: self.name, level, "{}", msg);
        }
    }

    #[inline]
    pub fn log(&self, msg: &str) {
        self.emit(log::Level::Debug, 1, msg);
    }

    #[inline]
    pub fn detail(&self, msg: &str) {
        self.emit(log::Level::Trace, 2, msg);
    }
}

/// Create a logger, enabled when `DEBUG` selects `name`.
pub fn create_logger(name: &'static str) -> Logger {
    Logger { name, enabled: settings().selection.includes(name) }
}

/// Format and emit a record; the arguments are not formatted when the
/// logger is disabled.
#[macro_export]
macro_rules! log {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.log(&format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_detail {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.detail(&format!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_empty() {
        assert_eq!(Selection::parse(None), Selection::Nothing);
        assert_eq!(Selection::parse(Some("")), Selection::Nothing);
        assert_eq!(Selection::parse(Some(" , ")), Selection::Nothing);
    }

    #[test]
    fn test_selection_everything() {
        for v in ["*", "1", "true", " * "] {
            assert_eq!(Selection::parse(Some(v)), Selection::Everything);
        }
    }

    #[test]
    fn test_selection_named() {
        let sel = Selection::parse(Some("state, autostep"));
        assert!(sel.includes("state"));
        assert!(sel.includes("autostep"));
        assert!(!sel.includes("kernel"));
    }

    #[test]
    fn test_verbosity() {
        assert_eq!(parse_verbosity(None), 1);
        assert_eq!(parse_verbosity(Some("2")), 2);
        assert_eq!(parse_verbosity(Some("9")), 3);
        assert_eq!(parse_verbosity(Some("loud")), 1);
    }

    #[test]
    fn test_disabled_logger() {
        let logger = Logger::disabled();
        assert!(!logger.enabled());
        assert_eq!(logger.name(), "");
        logger.log("dropped");
    }
}
