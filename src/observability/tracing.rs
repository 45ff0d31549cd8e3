//! Correlation identifiers.
//!
//! # Responsibilities
//! - Mint a correlation ID at the origin of a call
//! - Carry a caller-supplied ID through retries unchanged
//!
//! # Design Decisions
//! - UUID v4, rendered in hyphenated form for log search
//! - Logged as a field (`correlation_id = %id`) on every attempt event

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier attached to a call at its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an ID propagated from upstream.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let id = CorrelationId::new();
        assert_eq!(CorrelationId::parse(&id.to_string()), Some(id));
        assert_eq!(CorrelationId::parse("not-a-uuid"), None);
    }
}
