//! Webhook ingestion: classify ripper notifications, extract a safe media
//! title, and decide whether a job gets enqueued.

use crate::error::{ForgeError, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::LazyLock;

pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024;
pub const MAX_TITLE_LENGTH: usize = 500;
pub const MAX_BODY_LENGTH: usize = 2000;
pub const MAX_PATH_LENGTH: usize = 1000;
pub const MAX_JOB_ID_LENGTH: usize = 50;

/// Notification formats the ripper emits, most specific first. The first
/// match wins and its capture becomes the candidate title.
static TITLE_PATTERNS: LazyLock<Vec<regex::Regex>> = LazyLock::new(|| {
    [
        r"(?i)^(.+?)\s+rip complete",
        r"(?i)^(.+?)\s+processing complete",
        r"(?i)Rip of (.+?) complete",
    ]
    .iter()
    .map(|p| regex::Regex::new(p).unwrap())
    .collect()
});

static JOB_ID_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Inbound notification. The ripper's two delivery paths disagree on the
/// field name for the notification text (`body` vs `message`).
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WebhookPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub message: Option<String>,
    pub path: Option<String>,
    pub job_id: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl WebhookPayload {
    /// First non-empty of `body` and `message`.
    pub fn effective_body(&self) -> Option<&str> {
        [self.body.as_deref(), self.message.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestDecision {
    Queued {
        /// The media title; also the single directory name joined under
        /// the raw root to form the job's source path.
        title: String,
        arm_job_id: Option<String>,
    },
    /// Not a completion event; acknowledged but not enqueued.
    Ignored,
}

fn strip_control(value: &str, keep_whitespace: bool) -> String {
    value
        .chars()
        .filter(|c| *c >= ' ' || (keep_whitespace && (*c == '\n' || *c == '\t')))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Validate the payload and decide whether to enqueue. Validation failures
/// are `ForgeError::Validation` and must not create a Catalog row.
pub fn evaluate(payload: &WebhookPayload) -> Result<IngestDecision> {
    let notification_title = payload
        .title
        .as_deref()
        .map(|t| strip_control(t, false))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ForgeError::Validation("Title cannot be empty".into()))?;
    if notification_title.len() > MAX_TITLE_LENGTH {
        return Err(ForgeError::Validation("Title too long".into()));
    }

    let body = payload.effective_body().map(|b| strip_control(b, true));
    if let Some(ref body) = body {
        if body.len() > MAX_BODY_LENGTH {
            return Err(ForgeError::Validation("Body too long".into()));
        }
    }

    let path = payload
        .path
        .as_deref()
        .map(|p| strip_control(p, false))
        .filter(|p| !p.is_empty());
    if let Some(ref path) = path {
        if path.len() > MAX_PATH_LENGTH {
            return Err(ForgeError::Validation("Path too long".into()));
        }
    }

    let arm_job_id = match payload.job_id.as_deref() {
        None => None,
        Some(id) => {
            if id.len() > MAX_JOB_ID_LENGTH || !JOB_ID_RE.is_match(id) {
                return Err(ForgeError::Validation(
                    "Job ID contains invalid characters".into(),
                ));
            }
            Some(id.to_string())
        }
    };

    let is_complete = notification_title.to_lowercase().contains("complete")
        || body
            .as_deref()
            .map(|b| b.to_lowercase().contains("complete"))
            .unwrap_or(false)
        || payload.status.as_deref() == Some("success");
    if !is_complete {
        return Ok(IngestDecision::Ignored);
    }

    // Prefer the explicit path field; otherwise pull the media title out
    // of the notification text. Only the final component is ever used.
    let title = match path {
        Some(path) => Some(path),
        None => body.as_deref().and_then(extract_title_from_body),
    };

    let title = title
        .ok_or_else(|| ForgeError::Validation("could not determine source path".into()))?;

    crate::paths::validate_webhook_component(&title)?;

    Ok(IngestDecision::Queued { title, arm_job_id })
}

/// Match the ordered notification patterns and reduce the capture to its
/// final path component.
fn extract_title_from_body(body: &str) -> Option<String> {
    for pattern in TITLE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(body) {
            let candidate = caps.get(1)?.as_str().trim();
            let name = Path::new(candidate)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("");
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn rip_complete_body_is_queued() {
        let decision = evaluate(&payload(serde_json::json!({
            "title": "ARM notification",
            "body": "Movie Title (2024) rip complete. Starting transcode."
        })))
        .unwrap();
        assert_eq!(
            decision,
            IngestDecision::Queued {
                title: "Movie Title (2024)".into(),
                arm_job_id: None,
            }
        );
    }

    #[test]
    fn message_field_is_accepted_as_body() {
        let decision = evaluate(&payload(serde_json::json!({
            "title": "ARM notification",
            "message": "Movie Title processing complete."
        })))
        .unwrap();
        assert!(matches!(
            decision,
            IngestDecision::Queued { title, .. } if title == "Movie Title"
        ));
    }

    #[test]
    fn legacy_rip_of_format() {
        let decision = evaluate(&payload(serde_json::json!({
            "title": "notification",
            "body": "Rip of Old Movie complete"
        })))
        .unwrap();
        assert!(matches!(
            decision,
            IngestDecision::Queued { title, .. } if title == "Old Movie"
        ));
    }

    #[test]
    fn first_pattern_wins() {
        // "X rip complete" also contains "complete" for the legacy rule;
        // the ordered list must pick the rip-complete capture.
        let decision = evaluate(&payload(serde_json::json!({
            "title": "t",
            "body": "Alpha rip complete. Rip of Beta complete"
        })))
        .unwrap();
        assert!(matches!(
            decision,
            IngestDecision::Queued { title, .. } if title == "Alpha"
        ));
    }

    #[test]
    fn non_completion_is_ignored() {
        let decision = evaluate(&payload(serde_json::json!({
            "title": "ARM notification",
            "body": "Rip of Movie started"
        })))
        .unwrap();
        assert_eq!(decision, IngestDecision::Ignored);
    }

    #[test]
    fn status_success_counts_as_completion() {
        let decision = evaluate(&payload(serde_json::json!({
            "title": "Movie",
            "path": "Movie Title (2024)",
            "status": "success"
        })))
        .unwrap();
        assert!(matches!(decision, IngestDecision::Queued { .. }));
    }

    #[test]
    fn traversal_in_path_field_is_rejected() {
        let err = evaluate(&payload(serde_json::json!({
            "title": "Rip complete",
            "path": "../../../etc/passwd",
            "status": "success"
        })))
        .unwrap_err();
        assert!(matches!(err, ForgeError::Validation(ref m) if m == "invalid path"));
    }

    #[test]
    fn separators_in_path_field_are_rejected() {
        for bad in ["a/b", "a\\b", ".."] {
            let err = evaluate(&payload(serde_json::json!({
                "title": "Rip complete",
                "path": bad,
            })))
            .unwrap_err();
            assert!(matches!(err, ForgeError::Validation(_)), "path {bad:?}");
        }
    }

    #[test]
    fn body_extraction_drops_directory_components() {
        let decision = evaluate(&payload(serde_json::json!({
            "title": "t",
            "body": "/home/arm/media/raw/Movie rip complete"
        })))
        .unwrap();
        assert!(matches!(
            decision,
            IngestDecision::Queued { title, .. } if title == "Movie"
        ));
    }

    #[test]
    fn completion_without_any_path_is_an_error() {
        let err = evaluate(&payload(serde_json::json!({
            "title": "Rip complete",
            "body": "nothing useful"
        })))
        .unwrap_err();
        assert!(
            matches!(err, ForgeError::Validation(ref m) if m == "could not determine source path")
        );
    }

    #[test]
    fn job_id_shape_is_enforced() {
        let ok = evaluate(&payload(serde_json::json!({
            "title": "Rip complete",
            "path": "Movie",
            "job_id": "abc-123_X"
        })))
        .unwrap();
        assert!(matches!(ok, IngestDecision::Queued { arm_job_id: Some(ref id), .. } if id == "abc-123_X"));

        let err = evaluate(&payload(serde_json::json!({
            "title": "Rip complete",
            "path": "Movie",
            "job_id": "abc;rm"
        })))
        .unwrap_err();
        assert!(matches!(err, ForgeError::Validation(_)));
    }

    #[test]
    fn length_bounds_validate_at_max_and_reject_above() {
        let title_max = "t".repeat(MAX_TITLE_LENGTH);
        assert!(evaluate(&payload(serde_json::json!({
            "title": title_max, "path": "Movie", "status": "success"
        })))
        .is_ok());
        let title_over = "t".repeat(MAX_TITLE_LENGTH + 1);
        assert!(evaluate(&payload(serde_json::json!({
            "title": title_over, "path": "Movie", "status": "success"
        })))
        .is_err());

        let job_id_max = "j".repeat(MAX_JOB_ID_LENGTH);
        assert!(evaluate(&payload(serde_json::json!({
            "title": "Rip complete", "path": "Movie", "job_id": job_id_max
        })))
        .is_ok());
        let job_id_over = "j".repeat(MAX_JOB_ID_LENGTH + 1);
        assert!(evaluate(&payload(serde_json::json!({
            "title": "Rip complete", "path": "Movie", "job_id": job_id_over
        })))
        .is_err());
    }

    #[test]
    fn control_bytes_are_stripped_not_parsed() {
        let decision = evaluate(&payload(serde_json::json!({
            "title": "Rip\u{0007} complete",
            "path": "Movie\u{0000}Title",
        })))
        .unwrap();
        assert!(matches!(
            decision,
            IngestDecision::Queued { title, .. } if title == "MovieTitle"
        ));
    }

    #[test]
    fn empty_title_is_invalid() {
        assert!(evaluate(&payload(serde_json::json!({"title": "  "}))).is_err());
        assert!(evaluate(&payload(serde_json::json!({"body": "x"}))).is_err());
    }

    #[test]
    fn effective_body_prefers_first_non_empty() {
        let p = payload(serde_json::json!({"title": "t", "body": "", "message": "hello"}));
        assert_eq!(p.effective_body(), Some("hello"));
        let p = payload(serde_json::json!({"title": "t", "body": "b", "message": "m"}));
        assert_eq!(p.effective_body(), Some("b"));
        let p = payload(serde_json::json!({"title": "t"}));
        assert_eq!(p.effective_body(), None);
    }
}
