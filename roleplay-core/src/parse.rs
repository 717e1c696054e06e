//! Structured extraction from free-text judge output.
//!
//! Every parser returns `Option`: `None` means the text did not follow the
//! requested format. Callers decide the fallback; all of them fail closed.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref VERDICT_YES: Regex = Regex::new(r"(?i)^\W*yes\b").unwrap();
    static ref VERDICT_NO: Regex = Regex::new(r"(?i)^\W*no\b").unwrap();
    static ref LABELED_ENTRY: Regex =
        Regex::new(r"(?im)^[ \t*\-#]*entry[ \t]*(\d+)[ \t]*[:：][ \t]*(.+?)[ \t]*$").unwrap();
    static ref INDEX_SEPARATOR: Regex = Regex::new(r"[,、，\s]+").unwrap();
}

/// Tokens a judge may use to say that nothing matched.
const NONE_TOKENS: &[&str] = &["none", "無", "なし", "ない", "nothing", "n/a"];

/// A yes/no decision with the judge's explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    /// Full trimmed judge text, kept as the evaluation record.
    pub justification: String,
}

/// Parse a 1-based index selection such as `"1, 3"` or `"none"`.
///
/// Returns 0-based positions below `len`, deduplicated and in order of first
/// appearance. `Some(vec![])` means the judge selected nothing; `None` means
/// the reply was not a selection at all.
pub fn parse_index_selection(text: &str, len: usize) -> Option<Vec<usize>> {
    let trimmed = text
        .trim()
        .trim_matches(|c: char| c == '.' || c == '。' || c == '`' || c == '"');

    if trimmed.is_empty() {
        return None;
    }
    if NONE_TOKENS.iter().any(|t| trimmed.eq_ignore_ascii_case(t)) {
        return Some(Vec::new());
    }

    let mut positions = Vec::new();
    for token in INDEX_SEPARATOR.split(trimmed).filter(|t| !t.is_empty()) {
        let index: usize = token.trim_matches(|c: char| c == '[' || c == ']').parse().ok()?;
        if index == 0 || index > len {
            continue;
        }
        if !positions.contains(&(index - 1)) {
            positions.push(index - 1);
        }
    }
    Some(positions)
}

/// Parse a judge reply that must open with YES or NO.
///
/// Hedged or otherwise unanchored replies yield `None`.
pub fn parse_verdict(text: &str) -> Option<Verdict> {
    let trimmed = text.trim();
    let passed = if VERDICT_YES.is_match(trimmed) {
        true
    } else if VERDICT_NO.is_match(trimmed) {
        false
    } else {
        return None;
    };

    Some(Verdict {
        passed,
        justification: trimmed.to_string(),
    })
}

/// Extract `entry k: <text>` segments for `k` in `1..=target`, in order.
///
/// Missing or empty segments are skipped, so the result may be shorter than
/// `target`. A label repeated later in the text does not replace the first.
pub fn parse_labeled_entries(text: &str, target: usize) -> Vec<String> {
    let mut slots: Vec<Option<String>> = vec![None; target];

    for caps in LABELED_ENTRY.captures_iter(text) {
        let Ok(k) = caps[1].parse::<usize>() else {
            continue;
        };
        let body = caps[2].trim();
        if k == 0 || k > target || body.is_empty() {
            continue;
        }
        if slots[k - 1].is_none() {
            slots[k - 1] = Some(body.to_string());
        }
    }

    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_selection() {
        assert_eq!(parse_index_selection("1, 3", 3), Some(vec![0, 2]));
        assert_eq!(parse_index_selection("2,2,1", 3), Some(vec![1, 0]));
        assert_eq!(parse_index_selection("1、2", 2), Some(vec![0, 1]));
        assert_eq!(parse_index_selection("[2]", 2), Some(vec![1]));
    }

    #[test]
    fn test_index_selection_out_of_range_is_dropped() {
        assert_eq!(parse_index_selection("0, 4, 2", 3), Some(vec![1]));
    }

    #[test]
    fn test_index_selection_none_variants() {
        for reply in ["none", "None", "NONE.", "無", "なし"] {
            assert_eq!(parse_index_selection(reply, 3), Some(vec![]), "{reply}");
        }
    }

    #[test]
    fn test_index_selection_rejects_prose() {
        assert_eq!(parse_index_selection("Memory 2 seems relevant", 3), None);
        assert_eq!(parse_index_selection("", 3), None);
    }

    #[test]
    fn test_verdict() {
        let yes = parse_verdict("YES - the learner apologised and offered a refund").unwrap();
        assert!(yes.passed);
        assert!(yes.justification.contains("refund"));

        let no = parse_verdict("no. The learner never asked a question.").unwrap();
        assert!(!no.passed);

        assert!(parse_verdict("**Yes**, mostly.").unwrap().passed);
    }

    #[test]
    fn test_verdict_is_anchored() {
        assert_eq!(parse_verdict("Probably yes"), None);
        assert_eq!(parse_verdict("Yesterday the learner..."), None);
        assert_eq!(parse_verdict("Nobody would say so"), None);
    }

    #[test]
    fn test_labeled_entries() {
        let text = "entry 1: Customer wants a refund\nEntry 2 : Kettle arrived broken\n- entry 3: Prefers email";
        assert_eq!(
            parse_labeled_entries(text, 3),
            vec!["Customer wants a refund", "Kettle arrived broken", "Prefers email"]
        );
    }

    #[test]
    fn test_labeled_entries_degrade() {
        let text = "entry 1: kept\nentry 2:\nentry 5: beyond target\nentry 1: duplicate";
        assert_eq!(parse_labeled_entries(text, 3), vec!["kept"]);
        assert!(parse_labeled_entries("I cannot summarise this.", 3).is_empty());
    }
}
