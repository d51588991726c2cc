//! Document source abstraction.
//!
//! A document enters the engine as a file on disk, a URL to crawl, or pasted
//! text. Each variant shares one contract: `normalize()` produces plain text
//! plus metadata (source kind, origin, checksum) that the rest of the
//! pipeline consumes without caring where the content came from.

use crate::error::{KildeError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// The kind of source a document was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Url,
    Text,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Url => "url",
            SourceKind::Text => "text",
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(SourceKind::File),
            "url" => Ok(SourceKind::Url),
            "text" => Ok(SourceKind::Text),
            _ => Err(format!("Unknown source kind: {}", s)),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A document source, tagged by variant.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    File { path: PathBuf },
    Url { url: String },
    Text { body: String },
}

/// The normalized output every source variant produces.
#[derive(Debug, Clone)]
pub struct NormalizedDocument {
    /// Plain text content.
    pub text: String,
    /// Which variant produced it.
    pub source_kind: SourceKind,
    /// Where it came from (path, URL, or a text marker).
    pub origin: String,
    /// Hex SHA-256 of the normalized text.
    pub checksum: String,
}

impl DocumentSource {
    /// Reconstruct a source from its persisted (kind, origin) pair.
    /// For text documents the origin column holds the raw body itself.
    pub fn from_parts(kind: SourceKind, origin: &str) -> Self {
        match kind {
            SourceKind::File => DocumentSource::File {
                path: PathBuf::from(origin),
            },
            SourceKind::Url => DocumentSource::Url {
                url: origin.to_string(),
            },
            SourceKind::Text => DocumentSource::Text {
                body: origin.to_string(),
            },
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            DocumentSource::File { .. } => SourceKind::File,
            DocumentSource::Url { .. } => SourceKind::Url,
            DocumentSource::Text { .. } => SourceKind::Text,
        }
    }

    /// The origin string persisted on the document row.
    pub fn origin(&self) -> String {
        match self {
            DocumentSource::File { path } => path.display().to_string(),
            DocumentSource::Url { url } => url.clone(),
            DocumentSource::Text { body } => body.clone(),
        }
    }

    /// Convert the source into a single plain-text document plus metadata.
    #[instrument(skip(self), fields(kind = %self.kind()))]
    pub async fn normalize(&self) -> Result<NormalizedDocument> {
        let (text, origin) = match self {
            DocumentSource::File { path } => (read_file(path)?, path.display().to_string()),
            DocumentSource::Url { url } => (fetch_url(url).await?, url.clone()),
            DocumentSource::Text { body } => (body.clone(), "inline text".to_string()),
        };

        let text = normalize_whitespace(&text);
        let checksum = checksum_hex(&text);
        debug!("Normalized {} characters (checksum {})", text.len(), &checksum[..8]);

        Ok(NormalizedDocument {
            text,
            source_kind: self.kind(),
            origin,
            checksum,
        })
    }
}

/// Guess the source variant for a raw CLI input string: an existing path is
/// a file, an http(s) string is a URL, anything else is treated as text.
pub fn detect_source(input: &str) -> DocumentSource {
    if input.starts_with("http://") || input.starts_with("https://") {
        return DocumentSource::Url {
            url: input.to_string(),
        };
    }
    let path = Path::new(input);
    if path.exists() {
        return DocumentSource::File {
            path: path.to_path_buf(),
        };
    }
    DocumentSource::Text {
        body: input.to_string(),
    }
}

fn read_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(KildeError::Source(format!(
            "File not found: {}",
            path.display()
        )));
    }
    Ok(std::fs::read_to_string(path)?)
}

async fn fetch_url(url: &str) -> Result<String> {
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        return Err(KildeError::Source(format!(
            "Fetching {} returned status {}",
            url,
            response.status()
        )));
    }
    let body = response.text().await?;
    Ok(strip_html(&body))
}

/// Drop script/style blocks and tags, decode the handful of entities that
/// matter for prose.
fn strip_html(html: &str) -> String {
    let script = Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("valid regex");
    let tags = Regex::new(r"(?s)<[^>]+>").expect("valid regex");

    let text = script.replace_all(html, " ");
    let text = tags.replace_all(&text, " ");
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

/// Collapse runs of spaces and limit blank lines, preserving paragraph
/// structure that the chunker uses for boundaries.
fn normalize_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(line);
    }
    lines.join("\n").trim().to_string()
}

/// Hex SHA-256 of document text, used for dedup and version snapshots.
pub fn checksum_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_source_normalizes() {
        let source = DocumentSource::Text {
            body: "Hello   world\n\n\n\nSecond  paragraph".to_string(),
        };
        let doc = source.normalize().await.unwrap();
        assert_eq!(doc.text, "Hello world\n\nSecond paragraph");
        assert_eq!(doc.source_kind, SourceKind::Text);
        assert_eq!(doc.checksum.len(), 64);
    }

    #[tokio::test]
    async fn test_checksum_is_stable() {
        let source = DocumentSource::Text {
            body: "same content".to_string(),
        };
        let a = source.normalize().await.unwrap();
        let b = source.normalize().await.unwrap();
        assert_eq!(a.checksum, b.checksum);
    }

    #[tokio::test]
    async fn test_file_source_reads_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "file content here").unwrap();

        let source = DocumentSource::File { path: path.clone() };
        let doc = source.normalize().await.unwrap();
        assert_eq!(doc.text, "file content here");
        assert_eq!(doc.source_kind, SourceKind::File);
        assert_eq!(doc.origin, path.display().to_string());
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let source = DocumentSource::File {
            path: PathBuf::from("/definitely/not/here.txt"),
        };
        assert!(source.normalize().await.is_err());
    }

    #[test]
    fn test_strip_html() {
        let html = "<html><head><style>p{color:red}</style></head>\
                    <body><h1>Title</h1><p>Some &amp; text</p>\
                    <script>alert(1)</script></body></html>";
        let text = normalize_whitespace(&strip_html(html));
        assert!(text.contains("Title"));
        assert!(text.contains("Some & text"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("color:red"));
    }

    #[test]
    fn test_detect_source() {
        assert!(matches!(
            detect_source("https://example.com/faq"),
            DocumentSource::Url { .. }
        ));
        assert!(matches!(
            detect_source("just some pasted words"),
            DocumentSource::Text { .. }
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "x").unwrap();
        assert!(matches!(
            detect_source(path.to_str().unwrap()),
            DocumentSource::File { .. }
        ));
    }

    #[test]
    fn test_source_roundtrip_from_parts() {
        let source = DocumentSource::Text {
            body: "raw body".to_string(),
        };
        let rebuilt = DocumentSource::from_parts(source.kind(), &source.origin());
        match rebuilt {
            DocumentSource::Text { body } => assert_eq!(body, "raw body"),
            _ => panic!("wrong variant"),
        }
    }
}
