//! Browser bookmark export parsing: Netscape bookmark HTML (the format every
//! major browser exports) and flat JSON lists.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)<h3\b[^>]*>(?P<folder>.*?)</h3\s*>|<a\s+(?P<attrs>[^>]*)>(?P<title>.*?)</a\s*>|<dd>(?P<desc>[^<]*)|(?P<close></dl\s*>)|(?P<open><dl\b[^>]*>)"#,
    )
    .expect("token regex")
});

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)([a-z_\-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("attribute regex")
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unrecognized bookmark export format")]
    UnknownFormat,
    #[error("invalid JSON bookmark export: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    NetscapeHtml,
    Json,
    Unknown,
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportFormat::NetscapeHtml => write!(f, "netscape_html"),
            ExportFormat::Json => write!(f, "json"),
            ExportFormat::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBookmark {
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub folder_path: Vec<String>,
    pub add_date: Option<DateTime<Utc>>,
    pub icon: Option<String>,
}

#[derive(Debug)]
pub struct ParsedExport {
    pub format: ExportFormat,
    pub bookmarks: Vec<ParsedBookmark>,
}

pub fn detect_format(content: &str) -> ExportFormat {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return ExportFormat::Json;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.contains("<!doctype netscape-bookmark-file") || (lower.contains("<dl") && lower.contains("<a "))
    {
        return ExportFormat::NetscapeHtml;
    }
    ExportFormat::Unknown
}

pub fn parse(content: &str) -> Result<ParsedExport, ParseError> {
    let format = detect_format(content);
    let bookmarks = match format {
        ExportFormat::NetscapeHtml => parse_netscape(content),
        ExportFormat::Json => parse_json(content)?,
        ExportFormat::Unknown => return Err(ParseError::UnknownFormat),
    };
    Ok(ParsedExport { format, bookmarks })
}

/// Walks `<DL>` nesting to attach each `<A>` to the chain of `<H3>` folders
/// that contain it. `<DD>` text directly after a link becomes its description.
pub fn parse_netscape(content: &str) -> Vec<ParsedBookmark> {
    let mut bookmarks: Vec<ParsedBookmark> = Vec::new();
    // One entry per open <DL>; `Some` when the list belongs to a folder.
    let mut folders: Vec<Option<String>> = Vec::new();
    let mut pending_folder: Option<String> = None;
    let mut last_bookmark: Option<usize> = None;

    for caps in TOKEN_RE.captures_iter(content) {
        if let Some(folder) = caps.name("folder") {
            pending_folder = Some(clean_text(folder.as_str()));
            last_bookmark = None;
        } else if let Some(attrs) = caps.name("attrs") {
            let title = caps.name("title").map(|m| m.as_str()).unwrap_or_default();
            if let Some(bookmark) = bookmark_from_anchor(attrs.as_str(), title, &folders) {
                bookmarks.push(bookmark);
                last_bookmark = Some(bookmarks.len() - 1);
            } else {
                last_bookmark = None;
            }
        } else if let Some(desc) = caps.name("desc") {
            if let Some(index) = last_bookmark.take() {
                let text = clean_text(desc.as_str());
                if !text.is_empty() {
                    bookmarks[index].description = Some(text);
                }
            }
        } else if caps.name("open").is_some() {
            folders.push(pending_folder.take());
            last_bookmark = None;
        } else if caps.name("close").is_some() {
            folders.pop();
            last_bookmark = None;
        }
    }

    bookmarks
}

fn bookmark_from_anchor(
    attrs: &str,
    title: &str,
    folders: &[Option<String>],
) -> Option<ParsedBookmark> {
    let mut href = None;
    let mut add_date = None;
    let mut icon = None;
    let mut tags = Vec::new();

    for attr in ATTR_RE.captures_iter(attrs) {
        let name = attr[1].to_ascii_lowercase();
        let value = attr
            .get(2)
            .or_else(|| attr.get(3))
            .map(|m| decode_entities(m.as_str()))
            .unwrap_or_default();
        match name.as_str() {
            "href" => href = Some(value.trim().to_string()),
            "add_date" => add_date = parse_timestamp(&value),
            "icon" => icon = Some(value),
            "tags" => tags = split_tags(&value),
            _ => {}
        }
    }

    let url = href.filter(|h| !h.is_empty())?;
    Some(ParsedBookmark {
        url,
        title: clean_text(title),
        description: None,
        tags,
        folder_path: folders.iter().flatten().cloned().collect(),
        add_date,
        icon,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonExport {
    List(Vec<JsonBookmark>),
    Wrapped { bookmarks: Vec<JsonBookmark> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonTags {
    List(Vec<String>),
    Csv(String),
}

#[derive(Deserialize)]
struct JsonBookmark {
    #[serde(alias = "href", alias = "uri")]
    url: String,
    #[serde(default, alias = "name")]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Option<JsonTags>,
    #[serde(default, alias = "folder", alias = "path")]
    folder_path: Option<JsonTags>,
    #[serde(default)]
    add_date: Option<i64>,
}

pub fn parse_json(content: &str) -> Result<Vec<ParsedBookmark>, ParseError> {
    let export: JsonExport = serde_json::from_str(content)?;
    let entries = match export {
        JsonExport::List(entries) | JsonExport::Wrapped { bookmarks: entries } => entries,
    };

    Ok(entries
        .into_iter()
        .map(|entry| ParsedBookmark {
            url: entry.url.trim().to_string(),
            title: entry.title.map(|t| clean_text(&t)).unwrap_or_default(),
            description: entry.description.filter(|d| !d.trim().is_empty()),
            tags: match entry.tags {
                Some(JsonTags::List(list)) => list,
                Some(JsonTags::Csv(csv)) => split_tags(&csv),
                None => Vec::new(),
            },
            folder_path: match entry.folder_path {
                Some(JsonTags::List(list)) => list,
                Some(JsonTags::Csv(path)) => path
                    .split('/')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
                None => Vec::new(),
            },
            add_date: entry.add_date.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            icon: None,
        })
        .collect())
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
}

fn split_tags(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

fn clean_text(raw: &str) -> String {
    let stripped = TAG_RE.replace_all(raw, "");
    decode_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
