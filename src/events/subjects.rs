// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing keys of every event kind known to the system.
///
/// Append only: a key is never reused for a different event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subject {
    /// A user has been created
    #[serde(rename = "user:created")]
    UserCreated,
}

impl Subject {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Subject::UserCreated => "user:created",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_string_matches_serde() {
        let json = serde_json::to_string(&Subject::UserCreated).unwrap();
        assert_eq!(json, format!("\"{}\"", Subject::UserCreated));

        let back: Subject = serde_json::from_str("\"user:created\"").unwrap();
        assert_eq!(back, Subject::UserCreated);
    }
}
