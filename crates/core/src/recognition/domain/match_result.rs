use std::fmt;
use std::time::Instant;

use crate::shared::constants::UNKNOWN_SUBJECT;
use crate::shared::face_box::FaceBox;

/// Who a face was classified as.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Subject {
    Known(String),
    Unknown,
}

impl Subject {
    pub fn name(&self) -> Option<&str> {
        match self {
            Subject::Known(name) => Some(name),
            Subject::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Subject::Known(_))
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Known(name) => f.write_str(name),
            Subject::Unknown => f.write_str(UNKNOWN_SUBJECT),
        }
    }
}

/// Outcome of recognizing one face, consumed once by the decision stage.
#[derive(Debug)]
pub struct MatchResult {
    pub subject: Subject,
    /// Best similarity found; 0.0 when no embedding could be computed.
    pub similarity: f64,
    pub face: FaceBox,
    pub completed_at: Instant,
}
