//! Topic pattern parsing and matching
//!
//! A subscription pattern is a dot-delimited topic template. `*` matches
//! exactly one segment and `**` matches zero or more trailing segments.
//! `**` is only valid as the final segment (or as the entire pattern, which
//! makes it the global wildcard). Wildcards embedded inside a literal
//! segment (`us*r`) are rejected.
//!
//! Patterns are parsed once at subscribe time; matching is a plain
//! segment-by-segment walk with no allocation.

use crate::utils::error::BusError;

/// One parsed pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// `*`: exactly one topic segment.
    Single,
    /// `**`: the remaining zero or more segments. Final position only.
    Multi,
}

/// A validated, parsed subscription pattern.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse and validate `pattern`. Invalid wildcard placement or empty
    /// segments are rejected here so a bad pattern can never enter the
    /// subscription table.
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        let invalid = |reason: &str| BusError::PatternInvalid {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let parts: Vec<&str> = pattern.split('.').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => return Err(invalid("empty segment")),
                "*" => Segment::Single,
                "**" => {
                    if i != last {
                        return Err(invalid("`**` is only valid as the final segment"));
                    }
                    Segment::Multi
                }
                literal => {
                    if literal.contains('*') {
                        return Err(invalid("`*` cannot appear inside a segment"));
                    }
                    Segment::Literal(literal.to_string())
                }
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The pattern as originally written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True for the bare `**` pattern, which matches every topic.
    pub fn is_global(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == Segment::Multi
    }

    /// If the pattern contains no wildcards it addresses exactly one topic;
    /// returns that topic. Used to resolve retained messages by direct
    /// lookup instead of a store scan.
    pub fn exact_topic(&self) -> Option<&str> {
        let all_literal = self
            .segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)));
        all_literal.then_some(self.raw.as_str())
    }

    /// Segment-by-segment match of `topic` against this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_segs = topic.split('.');

        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                Segment::Multi => {
                    // Consumes the rest, including nothing at all.
                    debug_assert_eq!(i, self.segments.len() - 1);
                    return true;
                }
                Segment::Single => {
                    if topic_segs.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(lit) => match topic_segs.next() {
                    Some(t) if t == lit => {}
                    _ => return false,
                },
            }
        }

        // Pattern exhausted; topic must be too.
        topic_segs.next().is_none()
    }
}
