//! Line Differ
//!
//! Computes an edit script between two line sequences by longest common
//! subsequence alignment over whole lines.
//!
//! ## Algorithm
//!
//! 1. The common prefix is matched directly.
//! 2. Every remaining line is interned to a small integer. Lines that occur
//!    on only one side can never be matched, so they are dropped before
//!    alignment. For small edits to large files this shrinks the table to
//!    the handful of lines that actually moved.
//! 3. The survivors' common suffix is set aside and the rest aligned with an
//!    O(n·m) suffix-LCS table, walked forward. When several minimal scripts
//!    exist, the earliest unmatched `before` line is matched to the earliest
//!    compatible `after` line.
//! 4. The suffix is matched greedily after the table walk, which gives the
//!    same pairs as walking one table over everything.
//!
//! Within each change hunk, removals are emitted before additions.
//!
//! ## Example
//!
//! ```
//! use adoptrack_core::diff::{diff_text, DiffTag};
//!
//! let diff = diff_text("a\nb\nc\n", "a\nc\nd\n", 5000).unwrap();
//! let tags: Vec<_> = diff.ops.iter().map(|op| op.tag).collect();
//! assert_eq!(
//!     tags,
//!     vec![DiffTag::Equal, DiffTag::Removed, DiffTag::Equal, DiffTag::Added]
//! );
//! assert_eq!(diff.added_count(), 1);
//! ```

use crate::error::{Error, Result};
use crate::types::{GeneratedLine, LineKind};
use serde::Serialize;
use std::collections::HashMap;

/// Classification of one line in the edit script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffTag {
    Equal,
    Added,
    Removed,
}

/// One line of the edit script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffOp<'a> {
    pub tag: DiffTag,
    pub text: &'a str,
    /// 0-based index into `before` (Equal and Removed)
    pub old_index: Option<usize>,
    /// 0-based index into `after` (Equal and Added)
    pub new_index: Option<usize>,
}

/// An ordered edit script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineDiff<'a> {
    pub ops: Vec<DiffOp<'a>>,
}

/// Split file content into lines.
///
/// A trailing newline does not produce an extra empty line, and `\r\n`
/// endings are treated like `\n`.
pub fn split_lines(content: &str) -> Vec<&str> {
    content.lines().collect()
}

/// Diff two file contents line by line.
pub fn diff_text<'a>(before: &'a str, after: &'a str, max_lines: usize) -> Result<LineDiff<'a>> {
    let old = split_lines(before);
    let new = split_lines(after);
    diff_lines(&old, &new, max_lines)
}

/// Diff two line sequences.
///
/// Fails with [`Error::DiffTooLarge`] when either side has more than
/// `max_lines` lines.
pub fn diff_lines<'a>(old: &[&'a str], new: &[&'a str], max_lines: usize) -> Result<LineDiff<'a>> {
    check_limit(old.len(), new.len(), max_lines)?;
    let matches = align(old, new);
    Ok(LineDiff {
        ops: emit(old, new, &matches),
    })
}

/// Length of the longest common subsequence of two line sequences.
pub fn common_line_count(a: &[&str], b: &[&str], max_lines: usize) -> Result<usize> {
    check_limit(a.len(), b.len(), max_lines)?;
    Ok(align(a, b).len())
}

fn check_limit(old_len: usize, new_len: usize, max_lines: usize) -> Result<()> {
    let largest = old_len.max(new_len);
    if largest > max_lines {
        return Err(Error::DiffTooLarge {
            lines: largest,
            limit: max_lines,
        });
    }
    Ok(())
}

/// Matched (old, new) index pairs, strictly increasing in both components.
fn align(old: &[&str], new: &[&str]) -> Vec<(usize, usize)> {
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut matches: Vec<(usize, usize)> = (0..prefix).map(|i| (i, i)).collect();

    let old_rest = &old[prefix..];
    let new_rest = &new[prefix..];
    if old_rest.is_empty() || new_rest.is_empty() {
        return matches;
    }

    let mut ids: HashMap<&str, usize> = HashMap::new();
    let old_ids = intern(&mut ids, old_rest);
    let new_ids = intern(&mut ids, new_rest);
    let distinct = ids.len();

    let mut in_old = vec![false; distinct];
    let mut in_new = vec![false; distinct];
    for &id in &old_ids {
        in_old[id] = true;
    }
    for &id in &new_ids {
        in_new[id] = true;
    }

    let old_keep: Vec<usize> = (0..old_ids.len())
        .filter(|&i| in_new[old_ids[i]])
        .collect();
    let new_keep: Vec<usize> = (0..new_ids.len())
        .filter(|&j| in_old[new_ids[j]])
        .collect();
    let a: Vec<usize> = old_keep.iter().map(|&i| old_ids[i]).collect();
    let b: Vec<usize> = new_keep.iter().map(|&j| new_ids[j]).collect();

    for (i, j) in anchored_pairs(&a, &b) {
        matches.push((prefix + old_keep[i], prefix + new_keep[j]));
    }
    matches
}

/// Map each line to a dense id shared across both sides.
fn intern<'s>(ids: &mut HashMap<&'s str, usize>, lines: &[&'s str]) -> Vec<usize> {
    lines
        .iter()
        .map(|&line| {
            let next = ids.len();
            *ids.entry(line).or_insert(next)
        })
        .collect()
}

/// [`lcs_pairs`] with the common suffix of `a` and `b` kept out of the table.
///
/// `LCS(x + s, y + s) = LCS(x, y) + |s|`, so the table walk over `x` and `y`
/// makes the same choices it would over the full sequences. The suffix is then
/// matched greedily, each line taking the earliest equal line left on the
/// other side.
fn anchored_pairs(a: &[usize], b: &[usize]) -> Vec<(usize, usize)> {
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let (na, mb) = (a.len() - suffix, b.len() - suffix);

    let mut pairs = lcs_pairs(&a[..na], &b[..mb]);
    let (mut i, mut j) = pairs.last().map_or((0, 0), |&(i, j)| (i + 1, j + 1));
    if i < na {
        // Unmatched lines remain in `a`; each suffix line of `b` scans forward in `a`.
        for t in mb..b.len() {
            while i < a.len() && a[i] != b[t] {
                i += 1;
            }
            if i == a.len() {
                break;
            }
            pairs.push((i, t));
            i += 1;
        }
    } else {
        for s in na..a.len() {
            while j < b.len() && b[j] != a[s] {
                j += 1;
            }
            if j == b.len() {
                break;
            }
            pairs.push((s, j));
            j += 1;
        }
    }
    pairs
}

/// LCS alignment of two id sequences with earliest-`a` tie-breaking.
fn lcs_pairs(a: &[usize], b: &[usize]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    if n == 0 || m == 0 {
        return Vec::new();
    }

    // table[i * width + j] = LCS length of a[i..] and b[j..]
    let width = m + 1;
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if a[i] == b[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let mut pairs = Vec::with_capacity(table[0] as usize);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if table[i * width + j + 1] >= table[(i + 1) * width + j] {
            // Skipping b[j] loses nothing; keep a[i] available for a later match.
            j += 1;
        } else {
            i += 1;
        }
    }
    pairs
}

fn emit<'a>(old: &[&'a str], new: &[&'a str], matches: &[(usize, usize)]) -> Vec<DiffOp<'a>> {
    let mut ops = Vec::with_capacity(old.len() + new.len() - matches.len());
    let (mut i, mut j) = (0, 0);
    let sentinel = (old.len(), new.len());

    for &(mi, mj) in matches.iter().chain(std::iter::once(&sentinel)) {
        while i < mi {
            ops.push(DiffOp {
                tag: DiffTag::Removed,
                text: old[i],
                old_index: Some(i),
                new_index: None,
            });
            i += 1;
        }
        while j < mj {
            ops.push(DiffOp {
                tag: DiffTag::Added,
                text: new[j],
                old_index: None,
                new_index: Some(j),
            });
            j += 1;
        }
        if mi < old.len() {
            ops.push(DiffOp {
                tag: DiffTag::Equal,
                text: old[mi],
                old_index: Some(mi),
                new_index: Some(mj),
            });
            i += 1;
            j += 1;
        }
    }
    ops
}

impl<'a> LineDiff<'a> {
    fn count(&self, tag: DiffTag) -> usize {
        self.ops.iter().filter(|op| op.tag == tag).count()
    }

    pub fn added_count(&self) -> usize {
        self.count(DiffTag::Added)
    }

    pub fn removed_count(&self) -> usize {
        self.count(DiffTag::Removed)
    }

    pub fn equal_count(&self) -> usize {
        self.count(DiffTag::Equal)
    }

    /// True when the two sides were identical.
    pub fn is_unchanged(&self) -> bool {
        self.ops.iter().all(|op| op.tag == DiffTag::Equal)
    }

    /// Reconstruct `before` by dropping added lines.
    pub fn old_lines(&self) -> Vec<&'a str> {
        self.ops
            .iter()
            .filter(|op| op.tag != DiffTag::Added)
            .map(|op| op.text)
            .collect()
    }

    /// Reconstruct `after` by dropping removed lines.
    pub fn new_lines(&self) -> Vec<&'a str> {
        self.ops
            .iter()
            .filter(|op| op.tag != DiffTag::Removed)
            .map(|op| op.text)
            .collect()
    }

    /// Lines present on both sides, in order.
    pub fn equal_lines(&self) -> Vec<&'a str> {
        self.ops
            .iter()
            .filter(|op| op.tag == DiffTag::Equal)
            .map(|op| op.text)
            .collect()
    }

    /// Added lines with their after-side line numbers.
    ///
    /// An added line is [`LineKind::Modified`] when its hunk also removed
    /// lines, otherwise [`LineKind::Added`].
    pub fn generated(&self) -> Vec<GeneratedLine> {
        let mut generated = Vec::new();
        let mut start = 0;
        while start < self.ops.len() {
            if self.ops[start].tag == DiffTag::Equal {
                start += 1;
                continue;
            }
            let end = self.ops[start..]
                .iter()
                .position(|op| op.tag == DiffTag::Equal)
                .map_or(self.ops.len(), |offset| start + offset);
            let hunk = &self.ops[start..end];
            let kind = if hunk.iter().any(|op| op.tag == DiffTag::Removed) {
                LineKind::Modified
            } else {
                LineKind::Added
            };
            for op in hunk.iter().filter(|op| op.tag == DiffTag::Added) {
                generated.push(GeneratedLine {
                    line_number: op.new_index.map_or(0, |j| j as i64 + 1),
                    kind,
                    content: op.text.to_string(),
                });
            }
            start = end;
        }
        generated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LIMIT: usize = 5000;

    fn tags(diff: &LineDiff) -> Vec<DiffTag> {
        diff.ops.iter().map(|op| op.tag).collect()
    }

    /// Reference LCS length by plain dynamic programming.
    fn naive_lcs(a: &[&str], b: &[&str]) -> usize {
        let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];
        for i in 1..=a.len() {
            for j in 1..=b.len() {
                dp[i][j] = if a[i - 1] == b[j - 1] {
                    dp[i - 1][j - 1] + 1
                } else {
                    dp[i - 1][j].max(dp[i][j - 1])
                };
            }
        }
        dp[a.len()][b.len()]
    }

    #[test]
    fn test_replace_middle_line() {
        let diff = diff_text("a\nb\nc\n", "a\nc\nd\n", LIMIT).unwrap();
        assert_eq!(
            tags(&diff),
            vec![DiffTag::Equal, DiffTag::Removed, DiffTag::Equal, DiffTag::Added]
        );
        assert_eq!(diff.added_count(), 1);
        assert_eq!(diff.removed_count(), 1);
        assert_eq!(diff.equal_lines(), vec!["a", "c"]);
        assert_eq!(diff.ops[1].text, "b");
        assert_eq!(diff.ops[3].text, "d");
    }

    #[test]
    fn test_empty_before_is_all_added() {
        let diff = diff_text("", "a\nb\n", LIMIT).unwrap();
        assert_eq!(tags(&diff), vec![DiffTag::Added, DiffTag::Added]);
        let generated = diff.generated();
        assert_eq!(generated.len(), 2);
        assert!(generated.iter().all(|g| g.kind == LineKind::Added));
        assert_eq!(generated[1].line_number, 2);
    }

    #[test]
    fn test_empty_after_is_all_removed() {
        let diff = diff_text("x\ny\nz", "", LIMIT).unwrap();
        assert_eq!(diff.removed_count(), 3);
        assert_eq!(diff.added_count(), 0);
        assert!(diff.generated().is_empty());
    }

    #[test]
    fn test_identical_inputs_are_all_equal() {
        let text = "fn main() {\n    println!(\"hi\");\n}\n";
        let diff = diff_text(text, text, LIMIT).unwrap();
        assert!(diff.is_unchanged());
        assert_eq!(diff.equal_count(), 3);
        assert!(diff.generated().is_empty());
    }

    #[test]
    fn test_both_empty() {
        let diff = diff_text("", "", LIMIT).unwrap();
        assert!(diff.ops.is_empty());
        assert!(diff.is_unchanged());
    }

    #[test]
    fn test_crlf_matches_lf() {
        let diff = diff_text("a\r\nb\r\n", "a\nb\n", LIMIT).unwrap();
        assert!(diff.is_unchanged());
    }

    #[test]
    fn test_tie_break_prefers_earliest_before_line() {
        // Either "a" in before could pair with the single "a" in after.
        let diff = diff_text("a\nx\na\n", "y\na\n", LIMIT).unwrap();
        let equal = diff
            .ops
            .iter()
            .find(|op| op.tag == DiffTag::Equal)
            .unwrap();
        assert_eq!(equal.old_index, Some(0));
        assert_eq!(equal.new_index, Some(1));
    }

    #[test]
    fn test_duplicate_lines_align() {
        let diff = diff_text("}\n}\n}\n", "}\nx\n}\n", LIMIT).unwrap();
        assert_eq!(diff.equal_count(), 2);
        assert_eq!(diff.added_count(), 1);
        assert_eq!(diff.removed_count(), 1);
    }

    #[test]
    fn test_removals_precede_additions_in_hunk() {
        let diff = diff_text("keep\nold1\nold2\nkeep2\n", "keep\nnew1\nkeep2\n", LIMIT).unwrap();
        assert_eq!(
            tags(&diff),
            vec![
                DiffTag::Equal,
                DiffTag::Removed,
                DiffTag::Removed,
                DiffTag::Added,
                DiffTag::Equal
            ]
        );
    }

    #[test]
    fn test_generated_kinds() {
        let before = "a\nb\nc\n";
        let after = "a\nB\nc\nd\n";
        let generated = diff_text(before, after, LIMIT).unwrap().generated();
        assert_eq!(
            generated,
            vec![
                GeneratedLine {
                    line_number: 2,
                    kind: LineKind::Modified,
                    content: "B".to_string()
                },
                GeneratedLine {
                    line_number: 4,
                    kind: LineKind::Added,
                    content: "d".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_too_large() {
        let before = "a\n".repeat(11);
        let err = diff_text(&before, "a\n", 10).unwrap_err();
        match err {
            Error::DiffTooLarge { lines, limit } => {
                assert_eq!(lines, 11);
                assert_eq!(limit, 10);
            }
            other => panic!("expected DiffTooLarge, got {other:?}"),
        }
        // Exactly at the limit is fine
        assert!(diff_text(&"a\n".repeat(10), "", 10).is_ok());
    }

    #[test]
    fn test_common_line_count() {
        let a = ["x", "y", "z"];
        let b = ["y", "q", "z", "x"];
        assert_eq!(common_line_count(&a, &b, LIMIT).unwrap(), 2);
        assert_eq!(common_line_count(&a, &[], LIMIT).unwrap(), 0);
    }

    #[test]
    fn test_header_insert_in_large_file() {
        let body: Vec<String> = (0..4000).map(|i| format!("line {i}")).collect();
        let old: Vec<&str> = body.iter().map(String::as_str).collect();
        let mut new = vec!["// header"];
        new.extend(old.iter().copied());

        let diff = diff_lines(&old, &new, LIMIT).unwrap();
        assert_eq!(diff.added_count(), 1);
        assert_eq!(diff.removed_count(), 0);
        assert_eq!(diff.ops[0].text, "// header");
        assert_eq!(diff.ops[1].old_index, Some(0));
        assert_eq!(diff.ops[1].new_index, Some(1));
    }

    #[test]
    fn test_shared_suffix_keeps_earliest_match() {
        // The trailing "}" is common to both sides, yet the earlier "}" in
        // before is the one kept
        let diff = diff_text("}\nx\n}\n", "y\n}\n", LIMIT).unwrap();
        let equal: Vec<_> = diff
            .ops
            .iter()
            .filter(|op| op.tag == DiffTag::Equal)
            .map(|op| (op.old_index, op.new_index))
            .collect();
        assert_eq!(equal, vec![(Some(0), Some(1))]);
    }

    fn lines() -> impl Strategy<Value = Vec<&'static str>> {
        // Small alphabet makes repeated lines and ties common.
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "d", "}", ""]), 0..14)
    }

    fn ids() -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(0usize..4, 0..16)
    }

    proptest! {
        #[test]
        fn prop_script_reconstructs_both_sides(old in lines(), new in lines()) {
            let diff = diff_lines(&old, &new, LIMIT).unwrap();
            prop_assert_eq!(diff.old_lines(), old.clone());
            prop_assert_eq!(diff.new_lines(), new.clone());
        }

        #[test]
        fn prop_script_is_minimal(old in lines(), new in lines()) {
            let diff = diff_lines(&old, &new, LIMIT).unwrap();
            prop_assert_eq!(diff.equal_count(), naive_lcs(&old, &new));
        }

        #[test]
        fn prop_script_is_deterministic(old in lines(), new in lines()) {
            prop_assert_eq!(
                diff_lines(&old, &new, LIMIT).unwrap(),
                diff_lines(&old, &new, LIMIT).unwrap()
            );
        }

        #[test]
        fn prop_suffix_anchoring_matches_full_table(a in ids(), b in ids()) {
            prop_assert_eq!(anchored_pairs(&a, &b), lcs_pairs(&a, &b));
        }
    }
}
