//! Firmware version comparison

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// How candidate and running version strings are ordered.
///
/// `Lexicographic` is a plain byte-wise comparison, so `"9" > "10"`. It is
/// kept as the default because deployed descriptors rely on it.
/// `Numeric` compares dot-separated components as integers where both sides
/// parse, so `"1.0.10" > "1.0.9"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionOrdering {
    #[default]
    Lexicographic,
    Numeric,
}

impl VersionOrdering {
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match self {
            VersionOrdering::Lexicographic => a.as_bytes().cmp(b.as_bytes()),
            VersionOrdering::Numeric => compare_numeric(a, b),
        }
    }

    /// True iff `candidate` orders strictly after `current`
    pub fn is_newer(&self, candidate: &str, current: &str) -> bool {
        self.compare(candidate, current) == Ordering::Greater
    }
}

/// Lexicographic `is_newer`
pub fn is_newer(candidate: &str, current: &str) -> bool {
    VersionOrdering::Lexicographic.is_newer(candidate, current)
}

fn compare_numeric(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.as_bytes().cmp(r.as_bytes()),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
