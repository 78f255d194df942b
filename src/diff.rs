//! Line-oriented text diff and fuzzy patch application.
//!
//! [`TextPatch::compute`] runs `similar`'s Myers diff over the lines of two
//! texts and groups the edits into hunks carrying up to [`CONTEXT_LINES`]
//! lines of surrounding context. [`TextPatch::apply_with`] locates each hunk
//! in the base text by its context, searching outward from the position the
//! hunk was recorded at, and retries with the outermost context lines dropped
//! (up to [`MAX_FUZZ`]) before giving up on that hunk.
//!
//! Lines keep their terminators, so a missing trailing newline is an edit
//! like any other.

use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffOp, DiffTag};

use crate::error::{PatchupError, Result};

/// Lines of unchanged context kept around each change.
pub const CONTEXT_LINES: usize = 3;

/// Maximum number of context lines dropped from each end of a hunk when it
/// cannot be located exactly.
pub const MAX_FUZZ: usize = 2;

/// One line of a hunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HunkLine {
    /// Line present in both texts.
    Context(String),
    /// Line only present in the old text.
    Delete(String),
    /// Line only present in the new text.
    Insert(String),
}

impl HunkLine {
    /// The line text including its terminator.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Context(s) | Self::Delete(s) | Self::Insert(s) => s,
        }
    }

    /// Whether the line is part of the old text.
    #[must_use]
    pub const fn in_old(&self) -> bool {
        matches!(self, Self::Context(_) | Self::Delete(_))
    }

    /// Whether the line is part of the new text.
    #[must_use]
    pub const fn in_new(&self) -> bool {
        matches!(self, Self::Context(_) | Self::Insert(_))
    }

    /// Check if this is a context line.
    #[must_use]
    pub const fn is_context(&self) -> bool {
        matches!(self, Self::Context(_))
    }
}

/// A contiguous group of changes with surrounding context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    /// Zero-based line in the old text where the hunk starts.
    pub old_start: usize,
    /// Zero-based line in the new text where the hunk starts.
    pub new_start: usize,
    /// Context, deleted and inserted lines in order.
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    fn leading_context(&self) -> usize {
        self.lines.iter().take_while(|l| l.is_context()).count()
    }

    fn trailing_context(&self) -> usize {
        self.lines.iter().rev().take_while(|l| l.is_context()).count()
    }
}

/// How to treat hunks that cannot be located in the base text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyMode {
    /// Apply what can be applied and report the failed hunks.
    #[default]
    Lenient,
    /// Refuse the whole patch if any hunk fails.
    Strict,
}

/// Result of applying a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// The patched text.
    pub text: String,
    /// Indices of hunks that could not be located and were skipped.
    pub failed_hunks: Vec<usize>,
}

impl Applied {
    /// True when every hunk applied.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_hunks.is_empty()
    }
}

/// Statistics about a patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    /// Number of hunks.
    pub hunks: usize,
    /// Lines inserted.
    pub inserted: usize,
    /// Lines deleted.
    pub deleted: usize,
}

/// Difference between two texts.
///
/// # Example
///
/// ```rust
/// use patchup::TextPatch;
///
/// let old = "alpha\nbeta\ngamma\n";
/// let new = "alpha\nBETA\ngamma\ndelta\n";
///
/// let patch = TextPatch::compute(old, new);
/// assert_eq!(patch.apply(old).text, new);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPatch {
    /// Hunks in old-text order.
    pub hunks: Vec<Hunk>,
}

impl TextPatch {
    /// Compute the patch turning `old` into `new`.
    #[must_use]
    pub fn compute(old: &str, new: &str) -> Self {
        let old_lines = split_lines(old);
        let new_lines = split_lines(new);
        let ops = similar::capture_diff_slices(Algorithm::Myers, &old_lines, &new_lines);
        let groups = similar::group_diff_ops(ops, CONTEXT_LINES);
        Self {
            hunks: build_hunks(groups, &old_lines, &new_lines),
        }
    }

    /// Check if the patch has no hunks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Count hunks and changed lines.
    #[must_use]
    pub fn stats(&self) -> PatchStats {
        let mut stats = PatchStats {
            hunks: self.hunks.len(),
            ..PatchStats::default()
        };
        for line in self.hunks.iter().flat_map(|h| &h.lines) {
            match line {
                HunkLine::Insert(_) => stats.inserted += 1,
                HunkLine::Delete(_) => stats.deleted += 1,
                HunkLine::Context(_) => {}
            }
        }
        stats
    }

    /// Apply leniently, skipping hunks that cannot be located.
    #[must_use]
    pub fn apply(&self, base: &str) -> Applied {
        apply_hunks(&self.hunks, base)
    }

    /// Apply with an explicit policy for unlocated hunks.
    ///
    /// # Errors
    ///
    /// Returns `PatchRejected` in [`ApplyMode::Strict`] when any hunk fails.
    pub fn apply_with(&self, base: &str, mode: ApplyMode) -> Result<Applied> {
        let applied = apply_hunks(&self.hunks, base);
        if mode == ApplyMode::Strict && !applied.is_complete() {
            return Err(PatchupError::PatchRejected {
                failed: applied.failed_hunks,
            });
        }
        Ok(applied)
    }

    /// Serialize for the codec.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| PatchupError::Serialization(format!("patch: {e}")))
    }

    /// Deserialize bytes produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns `Codec` if the bytes are not a patch.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| PatchupError::Codec(format!("malformed patch: {e}")))
    }
}

/// Split text into lines, each keeping its `\n`.
#[must_use]
pub fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

// =============================================================================
// HUNKS
// =============================================================================

/// Turn grouped diff operations into hunks of owned lines.
fn build_hunks(groups: Vec<Vec<DiffOp>>, old: &[&str], new: &[&str]) -> Vec<Hunk> {
    groups
        .into_iter()
        .filter_map(|ops| {
            let first = ops.first()?;
            let (old_start, new_start) = (first.old_range().start, first.new_range().start);
            let mut lines = Vec::new();
            for op in &ops {
                let (tag, old_range, new_range) = op.as_tag_tuple();
                match tag {
                    DiffTag::Equal => push_lines(&mut lines, &old[old_range], HunkLine::Context),
                    DiffTag::Delete => push_lines(&mut lines, &old[old_range], HunkLine::Delete),
                    DiffTag::Insert => push_lines(&mut lines, &new[new_range], HunkLine::Insert),
                    DiffTag::Replace => {
                        push_lines(&mut lines, &old[old_range], HunkLine::Delete);
                        push_lines(&mut lines, &new[new_range], HunkLine::Insert);
                    }
                }
            }
            Some(Hunk {
                old_start,
                new_start,
                lines,
            })
        })
        .collect()
}

fn push_lines(out: &mut Vec<HunkLine>, lines: &[&str], kind: fn(String) -> HunkLine) {
    out.extend(lines.iter().map(|line| kind((*line).to_string())));
}

// =============================================================================
// APPLY
// =============================================================================

fn apply_hunks(hunks: &[Hunk], base: &str) -> Applied {
    let base_lines = split_lines(base);
    let mut text = String::with_capacity(base.len());
    let mut cursor = 0usize;
    let mut drift: isize = 0;
    let mut failed_hunks = Vec::new();

    for (index, hunk) in hunks.iter().enumerate() {
        let expected = hunk.old_start.saturating_add_signed(drift).max(cursor);
        let Some(found) = locate(hunk, &base_lines, expected, cursor) else {
            tracing::debug!(hunk = index, old_start = hunk.old_start, "hunk could not be located");
            failed_hunks.push(index);
            continue;
        };

        for line in &base_lines[cursor..found.position] {
            text.push_str(line);
        }
        for line in &hunk.lines[found.lead..hunk.lines.len() - found.trail] {
            if line.in_new() {
                text.push_str(line.text());
            }
        }
        cursor = found.position + found.matched;
        drift = signed_offset(found.position, hunk.old_start + found.lead);
    }

    for line in &base_lines[cursor..] {
        text.push_str(line);
    }
    Applied { text, failed_hunks }
}

/// `to - from` as a signed line count, saturating at the `isize` bounds.
fn signed_offset(to: usize, from: usize) -> isize {
    if to >= from {
        isize::try_from(to - from).unwrap_or(isize::MAX)
    } else {
        isize::try_from(from - to).map_or(isize::MIN, |d| -d)
    }
}

struct Location {
    position: usize,
    matched: usize,
    lead: usize,
    trail: usize,
}

fn locate(hunk: &Hunk, base: &[&str], expected: usize, cursor: usize) -> Option<Location> {
    let leading = hunk.leading_context();
    let trailing = hunk.trailing_context();
    let has_old_lines = hunk.lines.iter().any(HunkLine::in_old);

    let mut tried = Vec::with_capacity(MAX_FUZZ + 1);
    for fuzz in 0..=MAX_FUZZ {
        let lead = fuzz.min(leading);
        let trail = fuzz.min(trailing).min(hunk.lines.len() - lead);
        if tried.contains(&(lead, trail)) {
            continue;
        }
        tried.push((lead, trail));

        let wanted: Vec<&str> = hunk.lines[lead..hunk.lines.len() - trail]
            .iter()
            .filter(|l| l.in_old())
            .map(HunkLine::text)
            .collect();

        if wanted.is_empty() {
            if has_old_lines {
                continue;
            }
            return Some(Location {
                position: (expected + lead).clamp(cursor, base.len()),
                matched: 0,
                lead,
                trail,
            });
        }

        if let Some(position) = search(base, &wanted, expected + lead, cursor) {
            return Some(Location {
                position,
                matched: wanted.len(),
                lead,
                trail,
            });
        }
    }
    None
}

/// Find `wanted` in `base[cursor..]`, preferring positions closest to `expected`.
fn search(base: &[&str], wanted: &[&str], expected: usize, cursor: usize) -> Option<usize> {
    if wanted.len() > base.len().saturating_sub(cursor) {
        return None;
    }
    let last = base.len() - wanted.len();
    let expected = expected.clamp(cursor, last);
    let matches_at = |p: usize| base[p..p + wanted.len()] == *wanted;

    let span = (expected - cursor).max(last - expected);
    for distance in 0..=span {
        if let Some(p) = expected.checked_add(distance).filter(|&p| p <= last) {
            if matches_at(p) {
                return Some(p);
            }
        }
        if distance > 0 {
            if let Some(p) = expected.checked_sub(distance).filter(|&p| p >= cursor) {
                if matches_at(p) {
                    return Some(p);
                }
            }
        }
    }
    None
}
