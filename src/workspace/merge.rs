//! Line-based three-way merge.
//!
//! Both sides are diffed against the base with an LCS over lines. Edits are
//! grouped when they overlap or touch in base coordinates; a group holding
//! edits from both sides is a conflict unless both sides produce the same
//! text for it.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStatus {
    Clean,
    Conflict,
}

/// How the target file ended up after a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Target was missing; incoming written as-is.
    Created,
    /// Target still matched the base; replaced by incoming.
    TookIncoming,
    /// Target already equals incoming; nothing written.
    AlreadyApplied,
    /// Non-overlapping edits combined.
    Merged,
    /// Conflict overridden by `force`; incoming written.
    Forced,
    /// Conflict left in place.
    Untouched,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Created => "created",
            Resolution::TookIncoming => "took-incoming",
            Resolution::AlreadyApplied => "already-applied",
            Resolution::Merged => "merged",
            Resolution::Forced => "forced",
            Resolution::Untouched => "untouched",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub status: MergeStatus,
    pub resolution: Resolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    pub conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    pub force: bool,
    pub backup: bool,
    pub backup_suffix: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            force: false,
            backup: false,
            backup_suffix: ".bak".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineMerge {
    Clean(String),
    Conflict { regions: usize },
}

/// A base range `[start, end)` replaced by `lines`.
#[derive(Debug)]
struct Edit<'a> {
    start: usize,
    end: usize,
    lines: Vec<&'a str>,
}

pub fn merge_lines(base: &str, current: &str, incoming: &str) -> LineMerge {
    if current == incoming || incoming == base {
        return LineMerge::Clean(current.to_string());
    }
    if current == base {
        return LineMerge::Clean(incoming.to_string());
    }

    let base_lines = split_lines(base);
    let ours = edits(&base_lines, &split_lines(current));
    let theirs = edits(&base_lines, &split_lines(incoming));

    let mut merged = String::with_capacity(current.len().max(incoming.len()));
    let mut conflicts = 0;
    let mut cursor = 0;
    let (mut i, mut j) = (0, 0);

    while i < ours.len() || j < theirs.len() {
        let take_ours = match (ours.get(i), theirs.get(j)) {
            (Some(a), Some(b)) => a.start <= b.start,
            (Some(_), None) => true,
            _ => false,
        };
        let first = if take_ours { &ours[i] } else { &theirs[j] };
        let (group_start, mut group_end) = (first.start, first.end);
        let (ours_from, theirs_from) = (i, j);
        if take_ours {
            i += 1;
        } else {
            j += 1;
        }

        loop {
            let mut extended = false;
            while let Some(edit) = ours.get(i)
                && touches(edit, group_start, group_end)
            {
                group_end = group_end.max(edit.end);
                i += 1;
                extended = true;
            }
            while let Some(edit) = theirs.get(j)
                && touches(edit, group_start, group_end)
            {
                group_end = group_end.max(edit.end);
                j += 1;
                extended = true;
            }
            if !extended {
                break;
            }
        }

        merged.extend(base_lines[cursor..group_start].iter().copied());
        let ours_group = &ours[ours_from..i];
        let theirs_group = &theirs[theirs_from..j];
        if theirs_group.is_empty() {
            merged.push_str(&side_text(&base_lines, ours_group, group_start, group_end));
        } else if ours_group.is_empty() {
            merged.push_str(&side_text(&base_lines, theirs_group, group_start, group_end));
        } else {
            let left = side_text(&base_lines, ours_group, group_start, group_end);
            let right = side_text(&base_lines, theirs_group, group_start, group_end);
            if left == right {
                merged.push_str(&left);
            } else {
                conflicts += 1;
            }
        }
        cursor = group_end;
    }
    merged.extend(base_lines[cursor..].iter().copied());

    if conflicts > 0 {
        LineMerge::Conflict { regions: conflicts }
    } else {
        LineMerge::Clean(merged)
    }
}

fn touches(edit: &Edit<'_>, start: usize, end: usize) -> bool {
    edit.start <= end && start <= edit.end
}

/// One side's text for the base range `[start, end)`.
fn side_text(base: &[&str], group: &[Edit<'_>], start: usize, end: usize) -> String {
    let mut text = String::new();
    let mut pos = start;
    for edit in group {
        text.extend(base[pos..edit.start].iter().copied());
        text.extend(edit.lines.iter().copied());
        pos = edit.end;
    }
    text.extend(base[pos..end].iter().copied());
    text
}

fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

fn edits<'a>(base: &[&str], other: &[&'a str]) -> Vec<Edit<'a>> {
    let mut edits = Vec::new();
    let (mut base_pos, mut other_pos) = (0, 0);
    let anchors = matching_lines(base, other)
        .into_iter()
        .chain(std::iter::once((base.len(), other.len())));
    for (b, o) in anchors {
        if b > base_pos || o > other_pos {
            edits.push(Edit {
                start: base_pos,
                end: b,
                lines: other[other_pos..o].to_vec(),
            });
        }
        base_pos = b + 1;
        other_pos = o + 1;
    }
    edits
}

/// Largest LCS table built for the region between the common prefix and
/// suffix. Above it the whole region is treated as one replaced block.
const MAX_LCS_CELLS: usize = 4_000_000;

/// Index pairs of a longest common subsequence of lines, ascending.
fn matching_lines(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];

    let mut pairs: Vec<(usize, usize)> = (0..prefix).map(|idx| (idx, idx)).collect();

    let (n, m) = (a_mid.len(), b_mid.len());
    if n.saturating_mul(m) > MAX_LCS_CELLS {
        pairs.extend((0..suffix).map(|k| (a.len() - suffix + k, b.len() - suffix + k)));
        return pairs;
    }
    let width = m + 1;
    let mut table = vec![0u32; (n + 1) * width];
    for x in (0..n).rev() {
        for y in (0..m).rev() {
            table[x * width + y] = if a_mid[x] == b_mid[y] {
                table[(x + 1) * width + y + 1] + 1
            } else {
                table[(x + 1) * width + y].max(table[x * width + y + 1])
            };
        }
    }
    let (mut x, mut y) = (0, 0);
    while x < n && y < m {
        if a_mid[x] == b_mid[y] {
            pairs.push((prefix + x, prefix + y));
            x += 1;
            y += 1;
        } else if table[(x + 1) * width + y] >= table[x * width + y + 1] {
            x += 1;
        } else {
            y += 1;
        }
    }

    pairs.extend((0..suffix).map(|k| (a.len() - suffix + k, b.len() - suffix + k)));
    pairs
}
