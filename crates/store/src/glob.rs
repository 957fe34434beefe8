//! Path globs for watches and walks.
//!
//! Matching is segment-wise:
//! - `*` matches any run of characters inside one segment, so a segment
//!   that is exactly `*` matches exactly one path segment;
//! - `?` matches one character inside a segment;
//! - a segment that is exactly `**` matches zero or more whole segments.

use crate::StoreError;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    /// `**`
    Any,
    /// A single-segment pattern, possibly containing `*` / `?`.
    Seg(String),
}

/// A compiled path glob.
#[derive(Clone, PartialEq, Eq)]
pub struct Glob {
    source: String,
    parts: Vec<Part>,
}

impl Glob {
    /// Compile a glob. Patterns follow the path rules (leading `/`,
    /// no empty segments) but may contain wildcards.
    pub fn new(pattern: &str) -> Result<Self, StoreError> {
        let rest = pattern.strip_prefix('/').ok_or_else(|| {
            StoreError::Malformed(format!("glob must start with '/': {pattern:?}"))
        })?;
        let mut parts = Vec::new();
        if !rest.is_empty() {
            for seg in rest.split('/') {
                match seg {
                    "" => {
                        return Err(StoreError::Malformed(format!(
                            "empty segment in glob {pattern:?}"
                        )))
                    }
                    "**" if parts.last() == Some(&Part::Any) => {}
                    "**" => parts.push(Part::Any),
                    s => parts.push(Part::Seg(s.to_string())),
                }
            }
        }
        Ok(Self {
            source: pattern.to_string(),
            parts,
        })
    }

    /// The pattern text this glob was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `path` matches. Invalid paths never match.
    pub fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix('/') else {
            return false;
        };
        let segs: Vec<&str> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split('/').collect()
        };
        match_parts(&self.parts, &segs)
    }
}

impl fmt::Debug for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Glob({})", self.source)
    }
}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Bottom-up over `(part, segment)` positions: cost is parts times
/// segments, however many `**` parts the glob has.
fn match_parts(parts: &[Part], segs: &[&str]) -> bool {
    // `next[j]`: the parts after the current one match `segs[j..]`.
    let mut next = vec![false; segs.len() + 1];
    next[segs.len()] = true;
    for part in parts.iter().rev() {
        let mut cur = vec![false; segs.len() + 1];
        for j in (0..=segs.len()).rev() {
            cur[j] = match part {
                Part::Any => next[j] || (j < segs.len() && cur[j + 1]),
                Part::Seg(pat) => {
                    j < segs.len()
                        && next[j + 1]
                        && match_segment(pat.as_bytes(), segs[j].as_bytes())
                }
            };
        }
        next = cur;
    }
    next[0]
}

/// Wildcard match within one segment (`*` any run, `?` one byte).
fn match_segment(pat: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pat.len() && (pat[p] == b'?' || pat[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pat[p..].iter().all(|&c| c == b'*')
}
