use crate::pipeline::{RenderOutcome, RenderRequest};
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

pub const GENERATED_HEADER: &str = "x-pdf-generated";
pub const PDF_CONTENT_TYPE: &str = "application/pdf";
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

static UNSAFE_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid filename pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Attachment,
    Inline,
}

impl Disposition {
    fn as_str(self) -> &'static str {
        match self {
            Disposition::Attachment => "attachment",
            Disposition::Inline => "inline",
        }
    }
}

/// Transport-neutral response; the HTTP surface and the CLI both consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub disposition: Option<(Disposition, String)>,
    /// Value of the diagnostic header, when one applies.
    pub generated: Option<String>,
    pub body: Vec<u8>,
}

impl RenderResponse {
    /// Shape the orchestrator's result. Consumes the document bytes; the
    /// passthrough body is the request's source, byte for byte.
    pub fn build(req: &RenderRequest, outcome: RenderOutcome) -> Self {
        let stem = file_stem(&req.name);
        match outcome {
            RenderOutcome::Converted(doc) => Self {
                status: StatusCode::OK,
                content_type: PDF_CONTENT_TYPE,
                disposition: Some((Disposition::Attachment, format!("{stem}.pdf"))),
                generated: Some(format!("yes ({})", doc.producer)),
                body: doc.bytes,
            },
            RenderOutcome::Passthrough => Self {
                status: StatusCode::OK,
                content_type: HTML_CONTENT_TYPE,
                disposition: Some((Disposition::Inline, format!("{stem}.html"))),
                generated: Some("no".to_string()),
                body: req.source.clone().into_bytes(),
            },
        }
    }

    /// A pre-generated document served as-is.
    pub fn static_file(bytes: Vec<u8>, download_name: &str) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: PDF_CONTENT_TYPE,
            disposition: Some((Disposition::Attachment, sanitize_filename(download_name))),
            generated: None,
            body: bytes,
        }
    }

    pub fn not_found(hint: &str) -> Self {
        Self::plain(StatusCode::NOT_FOUND, hint)
    }

    pub fn plain(status: StatusCode, text: &str) -> Self {
        Self {
            status,
            content_type: TEXT_CONTENT_TYPE,
            disposition: None,
            generated: None,
            body: text.as_bytes().to_vec(),
        }
    }

    pub fn content_disposition(&self) -> Option<String> {
        self.disposition
            .as_ref()
            .map(|(kind, name)| format!("{}; filename=\"{}\"", kind.as_str(), name))
    }

    /// Filename from the disposition, if any.
    pub fn filename(&self) -> Option<&str> {
        self.disposition.as_ref().map(|(_, name)| name.as_str())
    }
}

impl IntoResponse for RenderResponse {
    fn into_response(self) -> Response {
        let disposition = self.content_disposition();
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(self.content_type),
        );
        if let Some(value) = disposition.and_then(|d| HeaderValue::from_str(&d).ok()) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        if let Some(value) = self.generated.and_then(|g| HeaderValue::from_str(&g).ok()) {
            headers.insert(HeaderName::from_static(GENERATED_HEADER), value);
        }
        response
    }
}

/// Reduce a logical name to a header-safe ASCII filename.
pub fn sanitize_filename(name: &str) -> String {
    let ascii: String = name.nfkd().filter(char::is_ascii).collect();
    let cleaned = UNSAFE_FILENAME_CHARS.replace_all(ascii.trim(), "_");
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c == '_');
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned.to_string()
    }
}

fn file_stem(name: &str) -> String {
    let clean = sanitize_filename(name);
    let lower = clean.to_ascii_lowercase();
    for ext in [".pdf", ".html", ".htm"] {
        if lower.ends_with(ext) && clean.len() > ext.len() {
            return clean[..clean.len() - ext.len()].to_string();
        }
    }
    clean
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_accents_and_quotes() {
        assert_eq!(sanitize_filename("Résumé \"Q3\".pdf"), "Resume_Q3_.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("報告"), "document");
    }

    #[test]
    fn stem_drops_known_extensions() {
        assert_eq!(file_stem("Report.PDF"), "Report");
        assert_eq!(file_stem("report.html"), "report");
        assert_eq!(file_stem("Report"), "Report");
    }
}
