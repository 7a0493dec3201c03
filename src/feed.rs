//! Scraper feed reader.
//!
//! Reads [`RawDocument`] records from:
//!
//! - a JSON Lines file (one record per line, blank lines ignored),
//! - a JSON file holding an array of records (or a single record),
//! - a directory, walked recursively for `*.json` and `*.jsonl` files.
//!   Files matching any of the exclude globs (relative to the directory)
//!   are skipped. Files are read in path order.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use lexrag_core::models::RawDocument;

pub fn read_feed(path: &Path, exclude_globs: &[String]) -> Result<Vec<RawDocument>> {
    if !path.exists() {
        bail!("Feed path does not exist: {}", path.display());
    }
    if path.is_file() {
        return read_file(path);
    }

    let include_set = build_globset(&["**/*.json".to_string(), "**/*.jsonl".to_string()])?;
    let exclude_set = build_globset(exclude_globs)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
        let rel_str = relative.to_string_lossy().to_string();
        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push(entry.into_path());
    }

    let mut documents = Vec::new();
    for file in files {
        documents.extend(read_file(&file)?);
    }
    Ok(documents)
}

fn read_file(path: &Path) -> Result<Vec<RawDocument>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read feed file: {}", path.display()))?;
    parse_feed(&content).with_context(|| format!("Invalid feed file: {}", path.display()))
}

/// Parse a feed body, detecting array, single-object or JSON Lines form.
pub fn parse_feed(content: &str) -> Result<Vec<RawDocument>> {
    let trimmed = content.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    if let Ok(single) = serde_json::from_str::<RawDocument>(trimmed) {
        return Ok(vec![single]);
    }

    let mut documents = Vec::new();
    for (i, line) in trimmed.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let doc: RawDocument =
            serde_json::from_str(line).with_context(|| format!("line {}", i + 1))?;
        documents.push(doc);
    }
    Ok(documents)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RECORD: &str = r#"{"url": "https://gesetze.berlin.de/a", "title": "A", "content": "Text A", "scraped_at": "2024-03-01T10:00:00"}"#;

    #[test]
    fn test_parse_jsonl_and_array() {
        let jsonl = format!("{}\n\n{}\n", RECORD, RECORD.replace("/a", "/b"));
        let docs = parse_feed(&jsonl).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].source_url, "https://gesetze.berlin.de/b");

        let array = format!("[{}]", RECORD);
        assert_eq!(parse_feed(&array).unwrap().len(), 1);
        assert_eq!(parse_feed(RECORD).unwrap().len(), 1);
        assert!(parse_feed("  ").unwrap().is_empty());
    }

    #[test]
    fn test_bad_line_reports_line_number() {
        let err = parse_feed(&format!("{}\n{{not json\n", RECORD)).unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[test]
    fn test_directory_walk_with_excludes() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("raw/old")).unwrap();
        std::fs::write(tmp.path().join("raw/a.jsonl"), RECORD).unwrap();
        std::fs::write(tmp.path().join("raw/b.json"), format!("[{}]", RECORD)).unwrap();
        std::fs::write(tmp.path().join("raw/old/c.json"), RECORD).unwrap();
        std::fs::write(tmp.path().join("raw/notes.txt"), "ignored").unwrap();

        let docs = read_feed(tmp.path(), &["raw/old/**".to_string()]).unwrap();
        assert_eq!(docs.len(), 2);
        let all = read_feed(tmp.path(), &[]).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_missing_path() {
        assert!(read_feed(Path::new("/nonexistent/feed.jsonl"), &[]).is_err());
    }
}
