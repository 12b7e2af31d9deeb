// FILE: src/filter.rs
//! The Output Filter (§4.5): reduces verbose interpreter output under the
//! `compact` policy and enforces a maximum-token budget, spilling overflow
//! to disk and returning a reference. Pure string/regex logic, grounded on
//! the teacher's `regex`-based blocked-command matching (reused here for
//! loop-header/boundary/echo stripping) and on `AuditLogger`'s
//! append-open file-handling style for the spill writer.

use crate::config::DisplayMode;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// A reference to output that did not fit within `max_output_tokens`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillRef {
    pub path: PathBuf,
    pub original_tokens: usize,
}

struct NoisePatterns {
    loop_header: Regex,
    block_close: Regex,
    continuation_numbering: Regex,
    program_block: Regex,
    real_changes: Regex,
    missing_generated: Regex,
}

/// §4.5's enumeration is authoritative: loop headers/block boundaries,
/// repeated continuation-line numbering, program/inline-computation
/// blocks, and the two announcement forms. Anything not matching one of
/// these patterns is left untouched, and a line containing "error"
/// (case-insensitive) is never removed regardless of pattern match.
fn patterns() -> &'static NoisePatterns {
    static PATTERNS: OnceLock<NoisePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| NoisePatterns {
        loop_header: Regex::new(r"(?i)^\s*(forvalues|foreach|while)\b.*\{\s*$").unwrap(),
        block_close: Regex::new(r"^\s*\}\s*$").unwrap(),
        continuation_numbering: Regex::new(r"^\s*>\s*\d+[.):]\s*").unwrap(),
        program_block: Regex::new(r"(?i)^\s*(program\s+(define\s+)?\S+|end)\s*$").unwrap(),
        real_changes: Regex::new(r"^\s*\(\d+ real changes? made\)\s*$").unwrap(),
        missing_generated: Regex::new(r"^\s*\(\d+ missing values? generated\)\s*$").unwrap(),
    })
}

fn is_noise_line(line: &str) -> bool {
    let p = patterns();
    p.loop_header.is_match(line)
        || p.block_close.is_match(line)
        || p.continuation_numbering.is_match(line)
        || p.program_block.is_match(line)
        || p.real_changes.is_match(line)
        || p.missing_generated.is_match(line)
}

fn normalize_line_endings(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

/// Applies the display policy to raw engine output. `full` only
/// normalises; `compact` additionally drops noise lines, but a line
/// containing "error" (case-insensitive) always survives regardless of
/// which pattern it would otherwise match (§4.5, §8 round-trip property).
pub fn apply_policy(raw: &str, policy: DisplayMode) -> String {
    let normalized = normalize_line_endings(raw);
    let lines: Vec<&str> = normalized.lines().collect();

    let kept: Vec<&str> = match policy {
        DisplayMode::Full => lines,
        DisplayMode::Compact => lines
            .into_iter()
            .filter(|line| line.to_lowercase().contains("error") || !is_noise_line(line))
            .collect(),
    };

    kept.iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Rough token estimate: whitespace-separated words. Adequate for a
/// soft budget; we are not matching any particular tokenizer.
fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Result of running text through the full filter pipeline: the text to
/// return to the caller, and a spill reference if the text overflowed
/// `max_output_tokens`.
pub struct FilterOutcome {
    pub text: String,
    pub spill: Option<SpillRef>,
    /// Set when spilling failed; the caller still receives `text`
    /// unspilled along with a warning line appended, per §7's
    /// "SpillFailed — non-fatal" rule.
    pub warning: Option<String>,
}

/// Runs `filter(raw_output, policy) -> (text, overflow_ref?)` (§4.5).
/// `max_output_tokens == 0` disables bounding entirely.
pub async fn filter(
    raw: &str,
    policy: DisplayMode,
    max_output_tokens: usize,
    spill_dir: &std::path::Path,
    command_id: &str,
) -> FilterOutcome {
    let filtered = apply_policy(raw, policy);

    if max_output_tokens == 0 {
        return FilterOutcome {
            text: filtered,
            spill: None,
            warning: None,
        };
    }

    let tokens = estimate_tokens(&filtered);
    if tokens <= max_output_tokens {
        return FilterOutcome {
            text: filtered,
            spill: None,
            warning: None,
        };
    }

    match spill_to_disk(&filtered, spill_dir, command_id).await {
        Ok(path) => FilterOutcome {
            text: format!(
                "output exceeded {} tokens ({} tokens); full text spilled to {}",
                max_output_tokens,
                tokens,
                path.display()
            ),
            spill: Some(SpillRef {
                path,
                original_tokens: tokens,
            }),
            warning: None,
        },
        Err(e) => {
            warn!(error = %e, command_id, "spill failed, returning unspilled text");
            FilterOutcome {
                text: filtered,
                spill: None,
                warning: Some(format!(
                    "output exceeded {} tokens but could not be spilled to disk: {}",
                    max_output_tokens, e
                )),
            }
        }
    }
}

async fn spill_to_disk(
    text: &str,
    spill_dir: &std::path::Path,
    command_id: &str,
) -> Result<PathBuf, crate::error::AppError> {
    tokio::fs::create_dir_all(spill_dir)
        .await
        .map_err(|e| crate::error::AppError::SpillFailed(e.to_string()))?;
    let path = spill_dir.join(format!("{}.txt", command_id));
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .await
        .map_err(|e| crate::error::AppError::SpillFailed(e.to_string()))?;
    file.write_all(text.as_bytes())
        .await
        .map_err(|e| crate::error::AppError::SpillFailed(e.to_string()))?;
    Ok(path)
}

/// Best-effort cleanup of stale spill files on startup (§6 "Spill files
/// live under a temp directory and are best-effort cleaned on startup").
pub async fn clear_spill_dir(spill_dir: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(spill_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, "failed to clear stale spill directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_policy_only_normalises_line_endings() {
        let raw = "line one\r\nline two\r\n";
        assert_eq!(apply_policy(raw, DisplayMode::Full), "line one\nline two");
    }

    #[test]
    fn compact_policy_strips_loop_headers_and_boundaries_but_keeps_display_output() {
        let raw = "forvalues i = 1/3 {\n> display `i'\n1\n2\n3\n}\n";
        let out = apply_policy(raw, DisplayMode::Compact);
        assert!(!out.contains("forvalues"));
        assert!(!out.contains('}'));
        assert!(out.contains('1') && out.contains('2') && out.contains('3'));
    }

    #[test]
    fn compact_policy_never_drops_error_lines() {
        let raw = "forvalues i = 1/3 {\n(1 real changes made)\nr(198) error: invalid syntax\n}\n";
        let out = apply_policy(raw, DisplayMode::Compact);
        assert!(out.to_lowercase().contains("error"));
    }

    #[test]
    fn filter_round_trip_is_idempotent_under_full() {
        let raw = "alpha\r\nbeta\r\n";
        let once = apply_policy(raw, DisplayMode::Full);
        let twice = apply_policy(&once, DisplayMode::Full);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn zero_budget_disables_bounding() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = filter("a b c d e", DisplayMode::Full, 0, dir.path(), "cmd-1").await;
        assert_eq!(outcome.text, "a b c d e");
        assert!(outcome.spill.is_none());
    }

    #[tokio::test]
    async fn oversized_output_spills_full_filtered_text_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let raw = (0..50).map(|n| n.to_string()).collect::<Vec<_>>().join(" ");
        let outcome = filter(&raw, DisplayMode::Full, 10, dir.path(), "cmd-2").await;
        let spill = outcome.spill.expect("expected a spill reference");
        let on_disk = tokio::fs::read_to_string(&spill.path).await.unwrap();
        assert_eq!(on_disk, raw);
    }
}
