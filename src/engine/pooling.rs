//! Rendering evidence into the text handed to the oracle.
//!
//! Interpreter summaries are preferred over raw output. External evidence is
//! never re-inlined: its `output` already holds the bounded summary and the
//! payload stays in the store.

use crate::cache::{truncate_chars, Evidence};

const MAX_EVALUATION_FINDINGS: usize = 10;
const MAX_BRIEF_FINDINGS: usize = 5;
const MAX_BRIEF_OUTPUT: usize = 5000;
/// Most recent items included in pivot, gather and planning prompts.
pub const MAX_BRIEF_ITEMS: usize = 10;

/// Evidence of every earlier test followed by the current attempt's batch.
pub fn pool<'a>(
    earlier: impl IntoIterator<Item = &'a Evidence>,
    current: &'a [Evidence],
) -> Vec<&'a Evidence> {
    earlier.into_iter().chain(current.iter()).collect()
}

fn render_for_evaluation(evidence: &Evidence, max_single: usize) -> String {
    if let Some(summary) = evidence.summary.as_deref().filter(|s| !s.is_empty()) {
        let mut text = format!("[Analyzed]\nSummary: {}", summary);
        if !evidence.findings.is_empty() {
            text.push_str("\nKey Findings:");
            for finding in evidence.findings.iter().take(MAX_EVALUATION_FINDINGS) {
                text.push_str("\n  - ");
                text.push_str(finding);
            }
        }
        return text;
    }

    if evidence.is_external() {
        return truncate_chars(&evidence.output, max_single).to_string();
    }

    let output = &evidence.output;
    let chars = output.chars().count();
    if chars <= max_single {
        output.clone()
    } else {
        format!(
            "{}\n\n[... truncated {} chars ...]",
            truncate_chars(output, max_single),
            chars - max_single
        )
    }
}

/// Evidence text for the evaluation call.
///
/// Each item is capped at `max_single` chars; once `max_total` would be
/// exceeded the remaining items are replaced by an omission note.
pub fn prepare_evidence_text(evidence: &[&Evidence], max_single: usize, max_total: usize) -> String {
    let mut parts = Vec::with_capacity(evidence.len());
    let mut total = 0;

    for (index, item) in evidence.iter().enumerate() {
        let status = if item.failed { " (FAILED)" } else { "" };
        let entry = format!(
            "Command: {}{}\nOutput:\n{}",
            item.command,
            status,
            render_for_evaluation(item, max_single)
        );
        let size = entry.chars().count();
        if total + size > max_total {
            parts.push(format!(
                "[{} more evidence items omitted to stay within limits]",
                evidence.len() - index
            ));
            break;
        }
        total += size;
        parts.push(entry);
    }

    if parts.is_empty() {
        return "(no evidence collected)".to_string();
    }
    parts.join("\n\n")
}

/// Compact rendering of the most recent evidence for planning prompts.
pub fn brief_evidence(evidence: &[Evidence]) -> String {
    let start = evidence.len().saturating_sub(MAX_BRIEF_ITEMS);
    let mut parts = Vec::new();
    if start > 0 {
        parts.push(format!("[Last {} of {} items]", MAX_BRIEF_ITEMS, evidence.len()));
    }

    for item in &evidence[start..] {
        let body = match item.summary.as_deref().filter(|s| !s.is_empty()) {
            Some(summary) => {
                let mut body = format!("[Summary]\n{}", summary);
                if !item.findings.is_empty() {
                    body.push_str("\nKey Findings:");
                    for finding in item.findings.iter().take(MAX_BRIEF_FINDINGS) {
                        body.push_str("\n- ");
                        body.push_str(finding);
                    }
                }
                body
            }
            None => truncate_chars(&item.output, MAX_BRIEF_OUTPUT).to_string(),
        };
        let marker = if item.failed { " (FAILED)" } else { "" };
        parts.push(format!("{}{}:\n{}", item.command, marker, body));
    }

    if parts.is_empty() {
        "(none)".to_string()
    } else {
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EvidenceType;

    #[test]
    fn test_summary_preferred_over_output() {
        let mut evidence = Evidence::inline("!syncblk", "raw syncblk table");
        evidence.summary = Some("Lock contention: 1 of 4 sync blocks".to_string());
        evidence.findings = (0..15).map(|i| format!("finding {}", i)).collect();

        let text = prepare_evidence_text(&[&evidence], 1000, 10_000);
        assert!(text.contains("Summary: Lock contention"));
        assert!(!text.contains("raw syncblk table"));
        assert!(text.contains("finding 9"));
        assert!(!text.contains("finding 10"));
    }

    #[test]
    fn test_inline_output_truncated_per_item() {
        let evidence = Evidence::inline("!dumpheap", "x".repeat(50));
        let text = prepare_evidence_text(&[&evidence], 20, 10_000);
        assert!(text.contains(&"x".repeat(20)));
        assert!(!text.contains(&"x".repeat(21)));
        assert!(text.contains("[... truncated 30 chars ...]"));
    }

    #[test]
    fn test_total_budget_adds_omission_note() {
        let a = Evidence::inline("cmd-a", "a".repeat(40));
        let b = Evidence::inline("cmd-b", "b".repeat(40));
        let c = Evidence::inline("cmd-c", "c".repeat(40));
        let text = prepare_evidence_text(&[&a, &b, &c], 1000, 120);
        assert!(text.contains("cmd-a"));
        assert!(!text.contains("cmd-c"));
        assert!(text.contains("more evidence items omitted"));
    }

    #[test]
    fn test_external_evidence_uses_stored_summary_text() {
        let mut evidence = Evidence::inline("!dumpheap -stat", "bounded summary");
        evidence.evidence_type = EvidenceType::External;
        evidence.evidence_id = Some("ev_dumpheap_1".to_string());
        let text = prepare_evidence_text(&[&evidence], 1000, 10_000);
        assert!(text.contains("bounded summary"));
    }

    #[test]
    fn test_failed_commands_marked() {
        let evidence = Evidence {
            failed: true,
            ..Evidence::inline("!bogus", "Error: No export bogus found")
        };
        assert!(prepare_evidence_text(&[&evidence], 1000, 10_000).contains("!bogus (FAILED)"));
        assert!(brief_evidence(&[evidence]).contains("!bogus (FAILED)"));
    }

    #[test]
    fn test_brief_keeps_most_recent_items() {
        let evidence: Vec<Evidence> = (0..12)
            .map(|i| Evidence::inline(format!("cmd-{}", i), "out"))
            .collect();
        let text = brief_evidence(&evidence);
        assert!(text.starts_with("[Last 10 of 12 items]"));
        assert!(!text.contains("cmd-1:"));
        assert!(text.contains("cmd-11:"));
        assert_eq!(brief_evidence(&[]), "(none)");
    }

    #[test]
    fn test_pool_keeps_order() {
        let earlier = [Evidence::inline("first", ""), Evidence::inline("second", "")];
        let current = [Evidence::inline("third", "")];
        let pooled = pool(earlier.iter(), &current);
        let commands: Vec<&str> = pooled.iter().map(|e| e.command.as_str()).collect();
        assert_eq!(commands, vec!["first", "second", "third"]);
    }
}
