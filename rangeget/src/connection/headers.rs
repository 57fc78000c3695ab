//! Interpretation of response headers.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use reqwest::header::{
    HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE,
};
use reqwest::Url;

use crate::codec::ContentEncoding;

/// What a response reveals about the remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    /// Size of the body as announced by the server, `None` if unknown.
    pub file_size: Option<u64>,
    /// Best guess for the file name.
    pub file_name: Option<String>,
    /// Whether the server honours byte ranges.
    pub supports_resume: bool,
    pub content_encoding: ContentEncoding,
}

impl ResponseInfo {
    pub fn from_response(headers: &HeaderMap, visited: &[Url]) -> Self {
        Self {
            file_size: file_size(headers),
            file_name: file_name(headers, visited),
            supports_resume: supports_resume(headers),
            content_encoding: ContentEncoding::from_header(header_str(headers, CONTENT_ENCODING)),
        }
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Size from `Content-Length`, falling back to the total of `Content-Range`.
pub fn file_size(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, CONTENT_LENGTH)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .or_else(|| header_str(headers, CONTENT_RANGE).and_then(content_range_total))
}

/// Total length from a `Content-Range: bytes <a>-<b>/<total>` value.
pub fn content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?;
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

/// A server supports resuming if it advertises byte ranges or answered
/// with a partial response.
pub fn supports_resume(headers: &HeaderMap) -> bool {
    let accepts_bytes = header_str(headers, ACCEPT_RANGES)
        .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
        .unwrap_or(false);
    accepts_bytes || headers.contains_key(CONTENT_RANGE)
}

fn filename_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"filename=("([^";]+)"|([^; ]+))"#).expect("filename regex is valid")
    })
}

/// File name from `Content-Disposition`, falling back to the last visited
/// URL whose final path segment has an extension.
pub fn file_name(headers: &HeaderMap, visited: &[Url]) -> Option<String> {
    let from_header = header_str(headers, CONTENT_DISPOSITION)
        .and_then(|value| filename_regex().captures(value))
        .and_then(|captures| captures.get(2).or_else(|| captures.get(3)))
        .and_then(|m| sanitize_file_name(m.as_str()));
    if from_header.is_some() {
        return from_header;
    }

    visited.iter().rev().find_map(|url| {
        let segment = url.path_segments()?.next_back()?;
        let has_extension = Path::new(segment).extension().is_some();
        if has_extension {
            sanitize_file_name(segment)
        } else {
            None
        }
    })
}

/// Reduce a server-provided name to a bare file name.
fn sanitize_file_name(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}
