//! Core domain model and progress primitives for gamefeed.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gamefeed-core";

/// A raw post handed over by a content source. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub title: String,
    pub source_url: Option<String>,
    pub body: String,
}

impl ContentItem {
    pub fn new(title: impl Into<String>, source_url: Option<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            source_url,
            body: body.into(),
        }
    }

    /// Free-text context handed to the classification collaborator.
    pub fn context_text(&self) -> String {
        let mut text = self.title.clone();
        if let Some(url) = &self.source_url {
            text.push_str("\n\n");
            text.push_str(url);
        }
        text.push_str("\n\n");
        text.push_str(&self.body);
        text
    }
}

/// Outcome of classifying one content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub has_candidate: bool,
    pub url: Option<String>,
}

impl DetectionResult {
    pub fn none() -> Self {
        Self {
            has_candidate: false,
            url: None,
        }
    }

    /// Normalizing constructor: a candidate only survives with an explicit http(s) URL.
    pub fn new(has_candidate: bool, url: Option<String>) -> Self {
        match url.map(|u| u.trim().to_string()) {
            Some(url) if has_candidate && has_http_scheme(&url) => Self {
                has_candidate: true,
                url: Some(url),
            },
            _ => Self::none(),
        }
    }

    pub fn candidate_url(&self) -> Option<&str> {
        if self.has_candidate {
            self.url.as_deref()
        } else {
            None
        }
    }
}

pub fn has_http_scheme(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// What a reasoning session hands back through its terminal create tool.
/// Carries no URL: the target is fixed by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "tags")]
    pub tag_ids: Vec<i64>,
}

/// Structured, not-yet-persisted record proposed by the synthesis stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub name: String,
    pub description: String,
    pub url: String,
    pub tag_ids: Vec<i64>,
}

impl CandidateRecord {
    pub fn from_draft(draft: SynthesisDraft, url: impl Into<String>) -> Self {
        Self {
            name: draft.name.trim().to_string(),
            description: draft.description.trim().to_string(),
            url: url.into(),
            tag_ids: draft.tag_ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub url: String,
    pub tag_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

/// Downloaded image payload; lives only between download and attachment.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    pub bytes: Vec<u8>,
}

impl Image {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn sha256_hex(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }

    /// File extension guessed from magic bytes.
    pub fn extension(&self) -> &'static str {
        let b = self.bytes.as_slice();
        if b.starts_with(&[0x89, b'P', b'N', b'G']) {
            "png"
        } else if b.starts_with(&[0xFF, 0xD8, 0xFF]) {
            "jpg"
        } else if b.starts_with(b"GIF8") {
            "gif"
        } else if b.len() >= 12 && &b[0..4] == b"RIFF" && &b[8..12] == b"WEBP" {
            "webp"
        } else {
            "bin"
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image").field("byte_len", &self.bytes.len()).finish()
    }
}

/// Thread-safe monotonic counter with reset.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: Mutex<u64>,
}

impl AtomicCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, amount: u64) -> u64 {
        let mut value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        *value = value.saturating_add(amount);
        *value
    }

    pub fn incr(&self) -> u64 {
        self.increment(1)
    }

    pub fn get(&self) -> u64 {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reset(&self) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Idle,
    Running,
}

/// Point-in-time copy of the controller's progress counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobStats {
    pub phase: JobPhase,
    pub items_found: u64,
    pub items_processed: u64,
    pub candidates_found: u64,
    pub records_created: u64,
    pub items_failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detection,
    Dedup,
    Synthesis,
}

/// Per-item result threaded through the batch loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    NoCandidate,
    Duplicate { url: String },
    Declined { url: String },
    Created { record_id: i64, url: String },
    Failed { stage: Stage, reason: String },
}

impl ItemOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ItemOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OutcomeCounts {
    pub no_candidate: u64,
    pub duplicate: u64,
    pub declined: u64,
    pub created: u64,
    pub failed: u64,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::NoCandidate => self.no_candidate += 1,
            ItemOutcome::Duplicate { .. } => self.duplicate += 1,
            ItemOutcome::Declined { .. } => self.declined += 1,
            ItemOutcome::Created { .. } => self.created += 1,
            ItemOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.no_candidate + self.duplicate + self.declined + self.created + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    FetchFailed { reason: String },
}

/// Summary of one finished ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: RunStatus,
    pub items_found: u64,
    pub outcomes: OutcomeCounts,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn detection_keeps_only_http_urls() {
        let ok = DetectionResult::new(true, Some(" https://example.com/game ".into()));
        assert_eq!(ok.candidate_url(), Some("https://example.com/game"));

        for bad in ["ftp://example.com", "example.com", "javascript:alert(1)", ""] {
            let r = DetectionResult::new(true, Some(bad.to_string()));
            assert!(!r.has_candidate, "{bad} should be rejected");
            assert!(r.url.is_none());
        }

        assert_eq!(DetectionResult::new(true, None), DetectionResult::none());
        assert_eq!(
            DetectionResult::new(false, Some("https://example.com".into())),
            DetectionResult::none()
        );
    }

    #[test]
    fn context_text_includes_optional_url() {
        let with_url = ContentItem::new("Title", Some("https://x.io".into()), "Body");
        assert_eq!(with_url.context_text(), "Title\n\nhttps://x.io\n\nBody");
        let without = ContentItem::new("Title", None, "Body");
        assert_eq!(without.context_text(), "Title\n\nBody");
    }

    #[test]
    fn counter_is_consistent_across_threads() {
        let counter = Arc::new(AtomicCounter::new());
        let handles = (0..8)
            .map(|_| {
                let c = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        c.incr();
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
        assert_eq!(counter.increment(5), 8005);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn image_extension_sniffing() {
        assert_eq!(Image::new(vec![0x89, b'P', b'N', b'G', 0, 0]).extension(), "png");
        assert_eq!(Image::new(vec![0xFF, 0xD8, 0xFF, 0xE0]).extension(), "jpg");
        assert_eq!(Image::new(b"RIFF\0\0\0\0WEBPVP8 ".to_vec()).extension(), "webp");
        assert_eq!(Image::new(b"hello".to_vec()).extension(), "bin");
        assert_eq!(Image::new(vec![0; 1024]).byte_len(), 1024);
    }

    #[test]
    fn draft_accepts_tags_alias() {
        let draft: SynthesisDraft =
            serde_json::from_str(r#"{"name":"Foo","description":"Bar","tags":[1,2]}"#).unwrap();
        assert_eq!(draft.tag_ids, vec![1, 2]);
        let record = CandidateRecord::from_draft(draft, "https://foo.dev");
        assert_eq!(record.url, "https://foo.dev");
    }

    #[test]
    fn stats_serialize_snake_case() {
        let stats = JobStats {
            phase: JobPhase::Running,
            items_found: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["phase"], "running");
        assert_eq!(json["items_found"], 3);
    }
}
