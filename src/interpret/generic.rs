use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Interpretation, Interpreter};
use crate::oracle::{consult, ChunkAnalysis, Oracle, OracleCall, OracleRequest};
use crate::prompts::system_prompt;

/// Summaries of this many preceding segments are passed along as context.
const CONTEXT_SEGMENTS: usize = 2;
const MAX_FINDINGS: usize = 20;

/// Split `text` at line boundaries into pieces of at most `max_size` bytes.
///
/// A single line longer than `max_size` becomes a piece on its own.
pub fn chunk_lines(text: &str, max_size: usize) -> Vec<&str> {
    if text.len() <= max_size {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut end = 0;
    for line in text.split_inclusive('\n') {
        if end > start && end + line.len() - start > max_size {
            chunks.push(text[start..end].trim_end_matches('\n'));
            start = end;
        }
        end += line.len();
    }
    if end > start {
        chunks.push(text[start..end].trim_end_matches('\n'));
    }
    chunks
}

/// Segment-and-summarize interpretation through the oracle.
///
/// Each segment is analyzed with the summaries of the previous segments as
/// context; more than one segment triggers a synthesis call. Oracle failures
/// degrade to empty analyses rather than errors.
pub struct ChunkInterpreter {
    oracle: Arc<dyn Oracle>,
    chunk_size: usize,
}

impl ChunkInterpreter {
    pub fn new(oracle: Arc<dyn Oracle>, chunk_size: usize) -> Self {
        Self {
            oracle,
            chunk_size: chunk_size.max(1),
        }
    }

    async fn analyze_chunk(
        &self,
        command: &str,
        index: usize,
        total: usize,
        chunk: &str,
        earlier: &[ChunkAnalysis],
    ) -> ChunkAnalysis {
        let context = earlier
            .iter()
            .rev()
            .take(CONTEXT_SEGMENTS)
            .rev()
            .map(|a| format!("- {}", a.summary))
            .collect::<Vec<_>>()
            .join("\n");

        let user = format!(
            "COMMAND: {}\nSEGMENT: {} of {}\n\nEARLIER SEGMENTS:\n{}\n\nOUTPUT:\n{}",
            command,
            index + 1,
            total,
            if context.is_empty() { "(none)" } else { context.as_str() },
            chunk
        );
        let request = OracleRequest::new(
            OracleCall::AnalyzeChunk,
            system_prompt(OracleCall::AnalyzeChunk),
            user,
        );

        match consult::<ChunkAnalysis>(self.oracle.as_ref(), request).await {
            Ok(reply) => reply.or_else(|_| ChunkAnalysis::default()),
            Err(e) => {
                warn!(command = %command, segment = index + 1, error = %e, "Segment analysis failed");
                ChunkAnalysis::default()
            }
        }
    }

    async fn synthesize(&self, command: &str, analyses: &[ChunkAnalysis]) -> ChunkAnalysis {
        let body = analyses
            .iter()
            .enumerate()
            .map(|(i, a)| {
                format!(
                    "SEGMENT {}: {}\n{}",
                    i + 1,
                    a.summary,
                    a.findings
                        .iter()
                        .map(|f| format!("  - {}", f))
                        .collect::<Vec<_>>()
                        .join("\n")
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let request = OracleRequest::new(
            OracleCall::Synthesize,
            system_prompt(OracleCall::Synthesize),
            format!("COMMAND: {}\n\n{}", command, body),
        );

        let merged = || merge_analyses(analyses);
        match consult::<ChunkAnalysis>(self.oracle.as_ref(), request).await {
            Ok(reply) => match reply.parsed() {
                Some(synthesis) if !synthesis.summary.is_empty() => synthesis,
                _ => merged(),
            },
            Err(e) => {
                warn!(command = %command, error = %e, "Synthesis failed, merging segment analyses");
                merged()
            }
        }
    }
}

/// Local fallback when synthesis is unavailable.
fn merge_analyses(analyses: &[ChunkAnalysis]) -> ChunkAnalysis {
    let summary = analyses
        .iter()
        .map(|a| a.summary.as_str())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let mut findings: Vec<String> = Vec::new();
    for finding in analyses.iter().flat_map(|a| a.findings.iter()) {
        if !findings.contains(finding) {
            findings.push(finding.clone());
        }
    }
    findings.truncate(MAX_FINDINGS);

    ChunkAnalysis {
        summary,
        findings,
        blocking_operations: analyses
            .iter()
            .flat_map(|a| a.blocking_operations.iter().cloned())
            .collect(),
        thread_states: analyses
            .iter()
            .flat_map(|a| a.thread_states.iter().cloned())
            .collect(),
        exceptions: analyses
            .iter()
            .flat_map(|a| a.exceptions.iter().cloned())
            .collect(),
        root_cause: None,
    }
}

#[async_trait]
impl Interpreter for ChunkInterpreter {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn specificity(&self, _command: &str) -> Option<u8> {
        Some(0)
    }

    async fn interpret(&self, command: &str, output: &str) -> Interpretation {
        let chunks = chunk_lines(output, self.chunk_size);
        info!(command = %command, bytes = output.len(), segments = chunks.len(), "Generic interpretation");

        let mut analyses = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let analysis = self
                .analyze_chunk(command, index, chunks.len(), chunk, &analyses)
                .await;
            debug!(segment = index + 1, findings = analysis.findings.len(), "Segment analyzed");
            analyses.push(analysis);
        }

        let combined = match analyses.len() {
            0 => ChunkAnalysis::default(),
            1 => analyses.remove(0),
            _ => self.synthesize(command, &analyses).await,
        };

        let success = !combined.summary.trim().is_empty();
        let summary = if success {
            combined.summary
        } else {
            format!(
                "{} produced {} bytes of output; automated analysis unavailable",
                command,
                output.len()
            )
        };

        Interpretation {
            summary,
            findings: combined.findings,
            structured_data: json!({
                "segments": chunks.len(),
                "blocking_operations": combined.blocking_operations,
                "thread_states": combined.thread_states,
                "exceptions": combined.exceptions,
                "root_cause": combined.root_cause,
            }),
            success,
            interpreter: self.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use crate::oracle::MockOracle;
    use mockall::Sequence;

    #[test]
    fn test_chunk_lines_respects_boundaries() {
        let text = "aaaa\nbbbb\ncccc\ndddd";
        let chunks = chunk_lines(text, 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb", "cccc\ndddd"]);

        assert_eq!(chunk_lines("short", 100), vec!["short"]);
    }

    #[test]
    fn test_chunk_lines_oversized_line_alone() {
        let text = "ab\nthis line is far too long\ncd";
        let chunks = chunk_lines(text, 8);
        assert_eq!(chunks, vec!["ab", "this line is far too long", "cd"]);
    }

    #[tokio::test]
    async fn test_single_segment_skips_synthesis() {
        let mut oracle = MockOracle::new();
        oracle
            .expect_invoke()
            .withf(|r| r.call == OracleCall::AnalyzeChunk)
            .times(1)
            .returning(|_| Ok(r#"{"summary": "GC heap is 2GB", "findings": ["large LOH"]}"#.to_string()));

        let interpreter = ChunkInterpreter::new(Arc::new(oracle), 8000);
        let result = interpreter.interpret("!eeheap -gc", "heap output").await;
        assert!(result.success);
        assert_eq!(result.summary, "GC heap is 2GB");
        assert_eq!(result.findings, vec!["large LOH"]);
    }

    #[tokio::test]
    async fn test_segments_then_synthesis_with_context() {
        let mut oracle = MockOracle::new();
        let mut seq = Sequence::new();
        oracle
            .expect_invoke()
            .withf(|r| r.call == OracleCall::AnalyzeChunk && r.user.contains("(none)"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(r#"{"summary": "first"}"#.to_string()));
        oracle
            .expect_invoke()
            .withf(|r| r.call == OracleCall::AnalyzeChunk && r.user.contains("- first"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(r#"{"summary": "second"}"#.to_string()));
        oracle
            .expect_invoke()
            .withf(|r| r.call == OracleCall::Synthesize)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(r#"{"summary": "overall", "root_cause": "lock"}"#.to_string()));

        let interpreter = ChunkInterpreter::new(Arc::new(oracle), 10);
        let result = interpreter.interpret("!dumpheap", "aaaa\nbbbb\ncccc\ndddd").await;
        assert_eq!(result.summary, "overall");
        assert_eq!(result.structured_data["segments"], 2);
        assert_eq!(result.structured_data["root_cause"], "lock");
    }

    #[tokio::test]
    async fn test_oracle_failure_gives_safe_default() {
        let mut oracle = MockOracle::new();
        oracle.expect_invoke().returning(|_| {
            Err(OracleError::Unavailable {
                message: "offline".to_string(),
            })
        });

        let interpreter = ChunkInterpreter::new(Arc::new(oracle), 8000);
        let result = interpreter.interpret("!gcroot 0x1", "root chain").await;
        assert!(!result.success);
        assert!(result.summary.contains("automated analysis unavailable"));
        assert!(result.findings.is_empty());
    }
}
