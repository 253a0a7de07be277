//! Caller input contract: mime allow-list, size cap, normalization.
//!
//! Violations here fail the run immediately with `InputInvalid` before any
//! phase starts; nothing in this module is retryable.

use crate::error::PipelineError;

/// Hard cap on uploaded design assets.
pub const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Image mime types the pipeline accepts.
pub const ALLOWED_IMAGE_MIMES: [&str; 4] =
    ["image/png", "image/jpeg", "image/gif", "image/webp"];

/// Mime type of the raw-HTML input path.
pub const HTML_MIME: &str = "text/html";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    /// Uploaded image; geometry extraction is a collaborator concern, the
    /// splitter falls back to the canonical scaffold.
    Image { mime: String },
    /// Raw HTML fragment submitted as text.
    Html,
}

/// A validated, normalized design input.
#[derive(Debug, Clone)]
pub struct DesignInput {
    pub kind: InputKind,
    pub filename: String,
    pub byte_len: usize,
    /// Decoded fragment for the HTML path; `None` for images.
    pub html: Option<String>,
}

impl DesignInput {
    /// Validate an upload against the caller-facing contract.
    pub fn from_upload(
        bytes: &[u8],
        filename: &str,
        mime_type: &str,
    ) -> Result<Self, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::InputInvalid(
                "design input is empty".to_string(),
            ));
        }
        if bytes.len() > MAX_INPUT_BYTES {
            return Err(PipelineError::InputInvalid(format!(
                "design input is {} bytes, limit is {} bytes",
                bytes.len(),
                MAX_INPUT_BYTES
            )));
        }

        let mime = mime_type.trim().to_ascii_lowercase();
        // Parameters like "; charset=utf-8" are irrelevant to the allow-list.
        let bare_mime = mime.split(';').next().unwrap_or("").trim().to_string();

        if bare_mime == HTML_MIME {
            let html = String::from_utf8(bytes.to_vec()).map_err(|_| {
                PipelineError::InputInvalid("HTML input is not valid UTF-8".to_string())
            })?;
            return Ok(Self {
                kind: InputKind::Html,
                filename: filename.to_string(),
                byte_len: bytes.len(),
                html: Some(html),
            });
        }

        if ALLOWED_IMAGE_MIMES.contains(&bare_mime.as_str()) {
            return Ok(Self {
                kind: InputKind::Image { mime: bare_mime },
                filename: filename.to_string(),
                byte_len: bytes.len(),
                html: None,
            });
        }

        Err(PipelineError::InputInvalid(format!(
            "unsupported mime type '{mime_type}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_allowed_image_mimes() {
        for mime in ALLOWED_IMAGE_MIMES {
            let input = DesignInput::from_upload(&[0u8; 16], "design.png", mime).unwrap();
            assert!(matches!(input.kind, InputKind::Image { .. }));
            assert!(input.html.is_none());
        }
    }

    #[test]
    fn accepts_html_with_charset_parameter() {
        let input =
            DesignInput::from_upload(b"<header>hi</header>", "page.html", "text/html; charset=utf-8")
                .unwrap();
        assert_eq!(input.kind, InputKind::Html);
        assert_eq!(input.html.as_deref(), Some("<header>hi</header>"));
    }

    #[test]
    fn rejects_empty_input() {
        let err = DesignInput::from_upload(&[], "x.png", "image/png").unwrap_err();
        assert!(matches!(err, PipelineError::InputInvalid(_)));
    }

    #[test]
    fn rejects_oversized_input() {
        let bytes = vec![0u8; MAX_INPUT_BYTES + 1];
        let err = DesignInput::from_upload(&bytes, "big.png", "image/png").unwrap_err();
        assert!(matches!(err, PipelineError::InputInvalid(_)));
    }

    #[test]
    fn rejects_unknown_mime() {
        let err = DesignInput::from_upload(&[1, 2, 3], "x.pdf", "application/pdf").unwrap_err();
        assert!(matches!(err, PipelineError::InputInvalid(_)));
    }

    #[test]
    fn rejects_non_utf8_html() {
        let err = DesignInput::from_upload(&[0xff, 0xfe, 0x00], "x.html", "text/html").unwrap_err();
        assert!(matches!(err, PipelineError::InputInvalid(_)));
    }
}
