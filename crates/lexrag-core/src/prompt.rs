//! Grounded prompt construction and citation post-processing.
//!
//! Retrieved passages are numbered `[Q1]`, `[Q2]`, … in rank order. The
//! model must cite with those markers, tag uncited claims [`UNSUPPORTED_TAG`]
//! and answer [`NO_BASIS_SENTINEL`] when the passages do not answer the
//! question.
//!
//! # Citation closure
//!
//! [`extract_citations`] only accepts markers that name a passage actually
//! provided. Anything else (`[Q7]` with three passages, `[Q0]`) is rewritten
//! to [`UNSUPPORTED_TAG`] and never reaches `cited_chunk_ids`.

use std::sync::LazyLock;

use chrono::Utc;
use regex::{Captures, Regex};

use crate::error::{RagError, Result};
use crate::generation::{GenerationRequest, SourcePassage};
use crate::models::{Answer, AnswerStatus, Citation, RetrievalResult};

/// Tag for claims not backed by a provided passage.
pub const UNSUPPORTED_TAG: &str = "[unbelegt]";

/// Reply the model gives when the passages do not answer the question.
pub const NO_BASIS_SENTINEL: &str = "KEINE_GRUNDLAGE";

/// Answer text returned when no usable context exists.
pub const INSUFFICIENT_CONTEXT_ANSWER: &str =
    "Zu dieser Frage wurden in den vorliegenden Berliner Rechtsvorschriften keine \
     ausreichend relevanten Textstellen gefunden. Bitte formulieren Sie die Frage \
     genauer oder ziehen Sie eine fachkundige Beratung hinzu.";

pub const SYSTEM_PROMPT: &str = "Du bist ein Assistent für Berliner Landesrecht. \
Beantworte die Frage ausschließlich anhand der nummerierten Textstellen im Kontext. \
Belege jede Aussage mit der Markierung der Textstelle, auf der sie beruht, z. B. [Q1] \
oder [Q1, Q3]. Verwende nur Markierungen, die im Kontext vorkommen. \
Kennzeichne Aussagen, die sich nicht aus dem Kontext belegen lassen, mit [unbelegt]. \
Wenn der Kontext die Frage nicht beantwortet, antworte ausschließlich mit KEINE_GRUNDLAGE. \
Antworte auf Deutsch, sachlich und knapp. Dies ist keine Rechtsberatung.";

/// Marker for the 1-based passage number `n`.
pub fn citation_marker(n: usize) -> String {
    format!("[Q{}]", n)
}

/// Render the request for a question over ranked results.
pub fn build_request(
    query_text: &str,
    results: &[RetrievalResult],
    temperature: f32,
    max_tokens: u32,
) -> GenerationRequest {
    let sources: Vec<SourcePassage> = results
        .iter()
        .enumerate()
        .map(|(i, r)| SourcePassage {
            marker: citation_marker(i + 1),
            title: r.title.clone(),
            source_url: r.source_url.clone(),
            text: r.text.clone(),
        })
        .collect();

    let mut prompt = format!("Frage: {}\n\nKontext:\n", query_text.trim());
    for s in &sources {
        prompt.push('\n');
        prompt.push_str(&s.marker);
        if let Some(title) = &s.title {
            prompt.push(' ');
            prompt.push_str(title);
        }
        prompt.push_str(&format!(" ({})\n", s.source_url));
        prompt.push_str(s.text.trim());
        prompt.push('\n');
    }
    prompt.push_str("\nAntwort mit Quellenmarkierungen:");

    GenerationRequest {
        system: SYSTEM_PROMPT.to_string(),
        prompt,
        sources,
        temperature,
        max_tokens,
    }
}

/// Citations found in a model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCitations {
    /// The reply with invalid markers replaced by [`UNSUPPORTED_TAG`].
    pub text: String,
    /// Zero-based passage indices in order of first use, deduplicated.
    pub sources: Vec<usize>,
}

// `[Q2]`, `[q2]`, `[Q1, Q3]`, `[Q1, 3]`
static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*[Qq]\d{1,4}(?:\s*,\s*[Qq]?\d{1,4})*\s*\]").expect("marker pattern")
});
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{1,4}").expect("number pattern"));

/// Extract `[Qn]` and `[Qn, Qm]` markers from `text`, keeping only those
/// that name one of `source_count` passages.
pub fn extract_citations(text: &str, source_count: usize) -> ExtractedCitations {
    let mut sources: Vec<usize> = Vec::new();

    let rewritten = MARKER_RE.replace_all(text, |caps: &Captures| {
        let mut valid: Vec<usize> = Vec::new();
        let mut invalid = false;
        for m in NUMBER_RE.find_iter(&caps[0]) {
            let n: usize = m.as_str().parse().unwrap_or(0);
            if n >= 1 && n <= source_count {
                if !valid.contains(&n) {
                    valid.push(n);
                }
                if !sources.contains(&(n - 1)) {
                    sources.push(n - 1);
                }
            } else {
                invalid = true;
            }
        }
        rewrite_group(&valid, invalid)
    });

    ExtractedCitations {
        text: rewritten.into_owned(),
        sources,
    }
}

/// Canonical form of a marker group; unknown passages become [`UNSUPPORTED_TAG`].
fn rewrite_group(valid: &[usize], invalid: bool) -> String {
    let mut out = String::new();
    if !valid.is_empty() {
        let group: Vec<String> = valid.iter().map(|n| format!("Q{}", n)).collect();
        out.push_str(&format!("[{}]", group.join(", ")));
        if invalid {
            out.push(' ');
        }
    }
    if invalid {
        out.push_str(UNSUPPORTED_TAG);
    }
    out
}

/// Answer for a question without usable context.
pub fn insufficient_context_answer(query_text: &str) -> Answer {
    Answer {
        query_text: query_text.to_string(),
        answer_text: INSUFFICIENT_CONTEXT_ANSWER.to_string(),
        cited_chunk_ids: Vec::new(),
        citations: Vec::new(),
        status: AnswerStatus::InsufficientContext,
        generation_timestamp: Utc::now(),
    }
}

/// Turn a raw model reply into an [`Answer`].
///
/// Fails with [`RagError::Generation`] when the reply is empty.
pub fn finalize_answer(query_text: &str, reply: &str, results: &[RetrievalResult]) -> Result<Answer> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Err(RagError::Generation("model returned an empty answer".into()));
    }
    if results.is_empty() || reply.starts_with(NO_BASIS_SENTINEL) {
        return Ok(insufficient_context_answer(query_text));
    }

    let cleaned = reply.replace(NO_BASIS_SENTINEL, "");
    let extracted = extract_citations(cleaned.trim(), results.len());

    let citations: Vec<Citation> = extracted
        .sources
        .iter()
        .map(|&i| {
            let r = &results[i];
            Citation {
                marker: citation_marker(i + 1),
                chunk_id: r.chunk_id.clone(),
                document_id: r.document_id.clone(),
                title: r.title.clone(),
                source_url: r.source_url.clone(),
            }
        })
        .collect();

    let status = if citations.is_empty() {
        AnswerStatus::Ungrounded
    } else {
        AnswerStatus::Grounded
    };

    Ok(Answer {
        query_text: query_text.to_string(),
        answer_text: extracted.text,
        cited_chunk_ids: citations.iter().map(|c| c.chunk_id.clone()).collect(),
        citations,
        status,
        generation_timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(n: usize) -> RetrievalResult {
        RetrievalResult {
            chunk_id: format!("chunk-{}", n),
            score: 1.0 - n as f32 * 0.1,
            rank: n,
            document_id: "doc".into(),
            sequence_index: n as i64,
            text: format!("Text {}", n),
            title: Some("Bauordnung für Berlin".into()),
            source_url: "https://gesetze.berlin.de/bsbe".into(),
        }
    }

    #[test]
    fn test_markers() {
        assert_eq!(citation_marker(1), "[Q1]");
        assert_eq!(citation_marker(12), "[Q12]");
    }

    #[test]
    fn test_build_request_numbers_in_rank_order() {
        let req = build_request("Wie hoch?", &[result(1), result(2)], 0.1, 512);
        assert_eq!(req.sources.len(), 2);
        assert_eq!(req.sources[1].marker, "[Q2]");
        assert!(req.prompt.starts_with("Frage: Wie hoch?"));
        let q1 = req.prompt.find("[Q1] Bauordnung").unwrap();
        let q2 = req.prompt.find("[Q2] Bauordnung").unwrap();
        assert!(q1 < q2);
        assert!(req.prompt.contains("Text 2"));
        assert!(req.system.contains(NO_BASIS_SENTINEL));
        assert!(req.system.contains(UNSUPPORTED_TAG));
    }

    #[test]
    fn test_extract_first_use_order_dedup() {
        let e = extract_citations("A [Q2]. B [Q1]. C [Q2].", 3);
        assert_eq!(e.sources, vec![1, 0]);
        assert_eq!(e.text, "A [Q2]. B [Q1]. C [Q2].");
    }

    #[test]
    fn test_extract_grouped() {
        let e = extract_citations("Beides gilt [Q1, Q3].", 3);
        assert_eq!(e.sources, vec![0, 2]);
        assert_eq!(e.text, "Beides gilt [Q1, Q3].");
    }

    #[test]
    fn test_invalid_markers_rewritten() {
        let e = extract_citations("X [Q7]. Y [Q0]. Z [Q1, Q9].", 2);
        assert_eq!(e.sources, vec![0]);
        assert_eq!(e.text, "X [unbelegt]. Y [unbelegt]. Z [Q1] [unbelegt].");
    }

    #[test]
    fn test_non_marker_brackets_untouched() {
        let e = extract_citations("Siehe [Anlage 2] und [1] sowie [unbelegt] [", 2);
        assert!(e.sources.is_empty());
        assert_eq!(e.text, "Siehe [Anlage 2] und [1] sowie [unbelegt] [");
    }

    #[test]
    fn test_marker_variants_normalized() {
        let e = extract_citations("A [ q2 ]. B [Q1,3]. C [Q12345].", 3);
        assert_eq!(e.sources, vec![1, 0, 2]);
        assert_eq!(e.text, "A [Q2]. B [Q1, Q3]. C [Q12345].");
    }

    #[test]
    fn test_finalize_grounded() {
        let results = vec![result(1), result(2), result(3)];
        let a = finalize_answer("q", "Erst [Q3], dann [Q1]. Erfunden [Q5].", &results).unwrap();
        assert_eq!(a.status, AnswerStatus::Grounded);
        assert_eq!(a.cited_chunk_ids, vec!["chunk-3", "chunk-1"]);
        assert_eq!(a.citations[0].marker, "[Q3]");
        assert!(a.answer_text.contains("Erfunden [unbelegt]."));
    }

    #[test]
    fn test_finalize_ungrounded_and_sentinel() {
        let results = vec![result(1)];
        let a = finalize_answer("q", "Ohne Beleg.", &results).unwrap();
        assert_eq!(a.status, AnswerStatus::Ungrounded);
        assert!(a.cited_chunk_ids.is_empty());

        let a = finalize_answer("q", "KEINE_GRUNDLAGE", &results).unwrap();
        assert_eq!(a.status, AnswerStatus::InsufficientContext);
        assert!(a.citations.is_empty());
    }

    #[test]
    fn test_finalize_empty_reply_is_error() {
        assert!(matches!(
            finalize_answer("q", "  \n", &[result(1)]),
            Err(RagError::Generation(_))
        ));
    }

    #[test]
    fn test_insufficient_context_answer() {
        let a = insufficient_context_answer("Frage");
        assert_eq!(a.query_text, "Frage");
        assert_eq!(a.status, AnswerStatus::InsufficientContext);
        assert!(a.cited_chunk_ids.is_empty());
    }
}
