//! Document normalizer.
//!
//! Turns a scraped [`RawDocument`] into the canonical text that chunk
//! offsets refer to. The scraper converts HTML to markdown-ish text, so the
//! input still carries entities, invisible characters, portal navigation
//! and ragged whitespace.
//!
//! # Steps
//!
//! 1. Normalize line endings to `\n`.
//! 2. Decode the HTML entities html-to-text conversion leaves behind.
//! 3. Drop BOM, zero-width characters, soft hyphens and control
//!    characters; map no-break spaces to plain spaces.
//! 4. Collapse horizontal whitespace and trim every line.
//! 5. Remove boilerplate lines and image/link-only lines.
//! 6. Collapse blank-line runs into one paragraph break (`\n\n`).

use std::sync::LazyLock;

use chrono::Utc;
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Document, RawDocument};

/// Navigation and footer lines emitted by the Berlin law portal.
pub const DEFAULT_BOILERPLATE: &[&str] = &[
    "Nach oben",
    "Zum Seitenanfang",
    "Drucken",
    "Seite drucken",
    "Seite teilen",
    "Impressum",
    "Datenschutz",
    "Datenschutzerklärung",
    "Barrierefreiheit",
    "Erklärung zur Barrierefreiheit",
    "Kontakt",
    "Leichte Sprache",
    "Gebärdensprache",
    "Diese Website verwendet Cookies",
    "Cookie-Einstellungen",
    "Zur Navigation springen",
    "Zum Inhalt springen",
];

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[xX][0-9A-Fa-f]{1,6}|#[0-9]{1,7}|[A-Za-z][A-Za-z0-9]{1,7});")
        .expect("entity pattern")
});

// `![alt](src)` or `[label](href)`; labels naming a section are content.
static IMAGE_ONLY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^!\[[^\]]*\]\([^)]*\)$").expect("image pattern"));
static LINK_ONLY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[^\]§]*\]\(\S*\)$").expect("link pattern"));

/// Line-level boilerplate filter.
///
/// A line is boilerplate if it equals one of the patterns, or starts with
/// one followed by punctuation or whitespace (case-insensitive).
#[derive(Debug, Clone)]
pub struct Boilerplate {
    patterns: Vec<String>,
}

impl Boilerplate {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    fn matches(&self, line: &str) -> bool {
        let lower = line.to_lowercase();
        self.patterns.iter().any(|p| {
            lower == *p
                || lower
                    .strip_prefix(p.as_str())
                    .and_then(|rest| rest.chars().next())
                    .is_some_and(|c| c.is_whitespace() || c.is_ascii_punctuation())
        })
    }
}

impl Default for Boilerplate {
    fn default() -> Self {
        Self::new(DEFAULT_BOILERPLATE.iter())
    }
}

/// Normalize a scraped record into a new document version.
///
/// The returned document has a fresh id and `version = 1`; the pipeline
/// renumbers it when an earlier version of the same URL exists.
pub fn normalize_document(raw: &RawDocument, boilerplate: &Boilerplate) -> Document {
    let normalized_text = normalize_text(&raw.raw_text, boilerplate);
    let content_hash = hash_text(&normalized_text);
    let title = raw
        .title
        .as_deref()
        .map(|t| collapse_spaces(&clean_chars(&decode_entities(t))))
        .filter(|t| !t.is_empty());

    Document {
        id: Uuid::new_v4().to_string(),
        source_url: raw.source_url.trim().to_string(),
        title,
        raw_text: raw.raw_text.clone(),
        normalized_text,
        scrape_timestamp: raw.scrape_timestamp,
        content_hash,
        version: 1,
        ingested_at: Utc::now(),
    }
}

/// Normalize raw scraped text. Empty input yields an empty string.
pub fn normalize_text(raw: &str, boilerplate: &Boilerplate) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let decoded = decode_entities(&unified);
    let cleaned = clean_chars(&decoded);

    let mut out = String::with_capacity(cleaned.len());
    let mut pending_break = false;

    for line in cleaned.split('\n') {
        let line = collapse_spaces(line);
        if line.is_empty() {
            pending_break = !out.is_empty();
            continue;
        }
        if boilerplate.matches(&line) || is_link_or_image_only(&line) {
            continue;
        }
        if !out.is_empty() {
            out.push_str(if pending_break { "\n\n" } else { "\n" });
        }
        out.push_str(&line);
        pending_break = false;
    }

    out
}

/// SHA-256 hex digest of a text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn clean_chars(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            '\u{00A0}' | '\u{202F}' | '\u{2007}' | '\t' => Some(' '),
            '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{00AD}' => None,
            '\n' => Some('\n'),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect()
}

fn collapse_spaces(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Markdown lines consisting solely of an image or a bare link, as left
/// behind by html2text for navigation elements.
fn is_link_or_image_only(line: &str) -> bool {
    IMAGE_ONLY_RE.is_match(line) || LINK_ONLY_RE.is_match(line)
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    ENTITY_RE
        .replace_all(text, |caps: &Captures| match decode_entity(&caps[1]) {
            Some(c) => c.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn decode_entity(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        return char::from_u32(code);
    }
    let c = match name {
        "nbsp" => '\u{00A0}',
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "sect" => '§',
        "para" => '¶',
        "auml" => 'ä',
        "ouml" => 'ö',
        "uuml" => 'ü',
        "Auml" => 'Ä',
        "Ouml" => 'Ö',
        "Uuml" => 'Ü',
        "szlig" => 'ß',
        "ndash" => '–',
        "mdash" => '—',
        "bdquo" => '„',
        "ldquo" => '“',
        "rdquo" => '”',
        "shy" => '\u{00AD}',
        _ => return None,
    };
    Some(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(text: &str) -> String {
        normalize_text(text, &Boilerplate::default())
    }

    #[test]
    fn test_empty_text() {
        assert_eq!(norm(""), "");
        assert_eq!(norm("  \n\n \r\n "), "");
    }

    #[test]
    fn test_whitespace_and_paragraphs() {
        let raw = "  § 1   Anwendungsbereich \r\n\r\n\r\n(1)\tDieses Gesetz gilt \nfür alle Vorhaben.  ";
        assert_eq!(
            norm(raw),
            "§ 1 Anwendungsbereich\n\n(1) Dieses Gesetz gilt\nfür alle Vorhaben."
        );
    }

    #[test]
    fn test_entities_decoded() {
        assert_eq!(
            norm("&sect;&nbsp;3 Abs.&#160;2 &amp; Stra&szlig;e &#x41;"),
            "§ 3 Abs. 2 & Straße A"
        );
        assert_eq!(norm("AT&T; a & b"), "AT&T; a & b");
        assert_eq!(norm("&unknown; &&amp; &#xZZ;"), "&unknown; && &#xZZ;");
    }

    #[test]
    fn test_invisible_characters_removed() {
        assert_eq!(norm("\u{FEFF}Bau\u{00AD}ord\u{200B}nung"), "Bauordnung");
    }

    #[test]
    fn test_boilerplate_removed() {
        let raw = "Nach oben\n§ 2 Begriffe\nDrucken\nImpressum | Datenschutz\nKontaktstelle ist das Bezirksamt.";
        assert_eq!(norm(raw), "§ 2 Begriffe\nKontaktstelle ist das Bezirksamt.");
    }

    #[test]
    fn test_custom_boilerplate() {
        let bp = Boilerplate::new(["Gesamtes Gesetz"]);
        assert_eq!(
            normalize_text("Gesamtes Gesetz\n§ 1 Ziel", &bp),
            "§ 1 Ziel"
        );
    }

    #[test]
    fn test_link_only_lines_removed() {
        let raw = "![Logo](/img/logo.png)\n[Startseite](/bsbe)\n[§ 3 Allgemeine Anforderungen](/doc#p3)\nText";
        assert_eq!(norm(raw), "[§ 3 Allgemeine Anforderungen](/doc#p3)\nText");
    }

    #[test]
    fn test_normalize_document_hash_and_title() {
        let raw = RawDocument {
            source_url: " https://gesetze.berlin.de/doc ".into(),
            title: Some("Bauordnung&nbsp;für   Berlin".into()),
            raw_text: "Text".into(),
            scrape_timestamp: Utc::now(),
        };
        let doc = normalize_document(&raw, &Boilerplate::default());
        assert_eq!(doc.source_url, "https://gesetze.berlin.de/doc");
        assert_eq!(doc.title.as_deref(), Some("Bauordnung für Berlin"));
        assert_eq!(doc.content_hash, hash_text("Text"));
        assert_eq!(doc.version, 1);
    }

    #[test]
    fn test_idempotent() {
        let once = norm("A  b\n\n\nC &amp; D\nNach oben");
        assert_eq!(norm(&once), once);
    }
}
