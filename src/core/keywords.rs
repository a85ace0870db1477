//! Shared Actor Status: the append-per-key, case-insensitive keyword
//! dictionary that deduplicates outbound keyword traffic (spec.md 3, 4.7).
//!
//! This is the sole source of outgoing keyword writes. Every device and the
//! collimation loop route status-like fields through `KeywordSink::update`
//! rather than writing to the operator connection directly.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::operator_command::OperatorCommandHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Debug,
    Ping,
}

impl Severity {
    pub fn code(self) -> &'static str {
        match self {
            Severity::Info => "i",
            Severity::Warn => "w",
            Severity::Debug => "d",
            Severity::Ping => ":",
        }
    }
}

/// Narrow seam standing in for "write to user" (spec.md 1, out of core
/// scope): anything that can accept a severity-tagged line. The default
/// implementation logs via `tracing`; the actor's TCP connection handler
/// supplies one that also writes to the operator socket.
pub trait UserSink: Send + Sync {
    fn write_to_users(&self, severity: Severity, line: &str);
}

pub struct TracingSink;

impl UserSink for TracingSink {
    fn write_to_users(&self, severity: Severity, line: &str) {
        match severity {
            Severity::Warn => tracing::warn!(target: "keywords", "{line}"),
            Severity::Info => tracing::info!(target: "keywords", "{line}"),
            _ => tracing::debug!(target: "keywords", "{line}"),
        }
    }
}

pub struct KeywordDict {
    values: Mutex<HashMap<String, String>>,
    sink: Box<dyn UserSink>,
}

impl KeywordDict {
    pub fn new(sink: Box<dyn UserSink>) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// `updateKW` (spec.md 4.7): emission rule --
    /// - a user-initiated operator command is always emitted at `i` unless
    ///   the caller forces a different level;
    /// - else if the value changed since last emission, emit at `d`;
    /// - else if the caller forced `w`, emit anyway;
    /// - else suppress.
    pub fn update(
        &self,
        name: &str,
        value: impl Into<String>,
        operator_cmd: Option<&OperatorCommandHandle>,
        forced_level: Option<Severity>,
    ) {
        let value = value.into();
        let key = name.to_lowercase();
        let changed = {
            let mut values = self.values.lock().unwrap();
            let changed = values.get(&key) != Some(&value);
            values.insert(key, value.clone());
            changed
        };

        let user_commanded = operator_cmd.is_some_and(|c| c.is_user_commanded());

        let level = if user_commanded {
            Some(forced_level.unwrap_or(Severity::Info))
        } else if changed {
            Some(forced_level.unwrap_or(Severity::Debug))
        } else if forced_level == Some(Severity::Warn) {
            Some(Severity::Warn)
        } else {
            None
        };

        if let Some(level) = level {
            self.sink.write_to_users(level, &format!("{name}={value}"));
        }
    }

    pub fn update_all(
        &self,
        entries: impl IntoIterator<Item = (&'static str, String)>,
        operator_cmd: Option<&OperatorCommandHandle>,
    ) {
        for (name, value) in entries {
            self.update(name, value, operator_cmd, None);
        }
    }

    pub fn current(&self, name: &str) -> Option<String> {
        self.values.lock().unwrap().get(&name.to_lowercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operator_command::OperatorCommand;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink(StdMutex<Vec<(Severity, String)>>);

    impl UserSink for RecordingSink {
        fn write_to_users(&self, severity: Severity, line: &str) {
            self.0.lock().unwrap().push((severity, line.to_string()));
        }
    }

    #[test]
    fn user_initiated_always_emits_info() {
        let recorded: std::sync::Arc<RecordingSink> =
            std::sync::Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        struct ArcSink(std::sync::Arc<RecordingSink>);
        impl UserSink for ArcSink {
            fn write_to_users(&self, s: Severity, l: &str) {
                self.0.write_to_users(s, l);
            }
        }
        let dict = KeywordDict::new(Box::new(ArcSink(recorded.clone())));
        let op = OperatorCommand::new_user_initiated("ping", "ping");
        dict.update("ScaleFac", "1.0", Some(&op), None);
        dict.update("ScaleFac", "1.0", Some(&op), None); // unchanged, still user-commanded => still emits
        let log = recorded.0.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|(sev, _)| *sev == Severity::Info));
    }

    #[test]
    fn unchanged_value_without_user_cmd_is_suppressed() {
        let recorded = std::sync::Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        struct ArcSink(std::sync::Arc<RecordingSink>);
        impl UserSink for ArcSink {
            fn write_to_users(&self, s: Severity, l: &str) {
                self.0.write_to_users(s, l);
            }
        }
        let dict = KeywordDict::new(Box::new(ArcSink(recorded.clone())));
        dict.update("ThreadRingState", "Done", None, None);
        dict.update("ThreadRingState", "Done", None, None);
        let log = recorded.0.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, Severity::Debug);
    }

    #[test]
    fn forced_warn_always_emits() {
        let recorded = std::sync::Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        struct ArcSink(std::sync::Arc<RecordingSink>);
        impl UserSink for ArcSink {
            fn write_to_users(&self, s: Severity, l: &str) {
                self.0.write_to_users(s, l);
            }
        }
        let dict = KeywordDict::new(Box::new(ArcSink(recorded.clone())));
        dict.update("ScaleRingFaults", "none", None, None);
        dict.update("ScaleRingFaults", "none", None, Some(Severity::Warn));
        let log = recorded.0.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].0, Severity::Warn);
    }
}
