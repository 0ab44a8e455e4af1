use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::control::domain::command::Command;
use crate::recognition::domain::match_result::Subject;

/// Which command each kind of subject should trigger.
///
/// Any entry may be absent, meaning "do nothing" for that subject.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandMapping {
    /// Command for recognized identities without an override.
    pub known: Option<Command>,
    pub unknown: Option<Command>,
    /// Per-identity overrides, keyed by identity name.
    pub per_identity: HashMap<String, Command>,
}

impl CommandMapping {
    pub fn command_for(&self, subject: &Subject) -> Option<Command> {
        match subject {
            Subject::Known(name) => self.per_identity.get(name).copied().or(self.known),
            Subject::Unknown => self.unknown,
        }
    }
}

/// Turns recognition outcomes into vehicle commands.
///
/// A (subject, command) pair already issued less than `debounce_window` ago
/// is suppressed; a different command for the same subject goes out
/// immediately.
pub struct DecisionPolicy {
    mapping: CommandMapping,
    debounce_window: Duration,
    last_issued: HashMap<Subject, (Command, Instant)>,
}

impl DecisionPolicy {
    pub fn new(mapping: CommandMapping, debounce_window: Duration) -> Self {
        Self {
            mapping,
            debounce_window,
            last_issued: HashMap::new(),
        }
    }

    /// Decides the command for `subject` observed at `now`, if any.
    pub fn decide(&mut self, subject: &Subject, now: Instant) -> Option<Command> {
        let command = self.mapping.command_for(subject)?;
        if let Some((previous, issued_at)) = self.last_issued.get(subject) {
            let fresh = now.saturating_duration_since(*issued_at) < self.debounce_window;
            if *previous == command && fresh {
                return None;
            }
        }
        self.last_issued.insert(subject.clone(), (command, now));
        Some(command)
    }
}
