//! Data models for storage operations.

use serde::{Deserialize, Serialize};

/// Get current Unix timestamp.
pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// One imported library item and its scalar metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Database primary key. Assigned on insert, never reused.
    pub id: Option<i64>,

    /// Path the item was imported from. Unique across the library.
    pub source_path: String,

    /// Display title.
    pub title: String,

    /// User-written caption, if any.
    pub caption: Option<String>,

    /// OCR/text-extraction output, if any.
    pub extracted_text: Option<String>,

    /// MIME type of the stored media.
    pub mime_type: String,

    /// Pixel width, when known.
    pub width: Option<i64>,

    /// Pixel height, when known.
    pub height: Option<i64>,

    /// Size of the media file in bytes.
    pub byte_size: i64,

    /// Unix timestamp of import.
    pub imported_at: i64,

    /// Favorite flag.
    pub favorite: bool,

    /// Number of times the item has been viewed.
    pub view_count: i64,

    /// Unix timestamp of the last view, if any.
    pub last_viewed_at: Option<i64>,
}

impl ItemRecord {
    /// Create a new item record ready for insertion.
    #[must_use]
    pub fn new(
        source_path: impl Into<String>,
        title: impl Into<String>,
        mime_type: impl Into<String>,
        byte_size: i64,
    ) -> Self {
        Self {
            id: None,
            source_path: source_path.into(),
            title: title.into(),
            caption: None,
            extracted_text: None,
            mime_type: mime_type.into(),
            width: None,
            height: None,
            byte_size,
            imported_at: now_unix(),
            favorite: false,
            view_count: 0,
            last_viewed_at: None,
        }
    }

    /// Set the caption.
    #[must_use]
    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    /// Set the extracted text.
    #[must_use]
    pub fn with_extracted_text(mut self, text: impl Into<String>) -> Self {
        self.extracted_text = Some(text.into());
        self
    }

    /// Set pixel dimensions.
    #[must_use]
    pub const fn with_dimensions(mut self, width: i64, height: i64) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// The text an embedding of this item is generated from.
    ///
    /// Title, caption, and extracted text joined by newlines, skipping
    /// absent parts. Staleness hashes cover exactly this string.
    #[must_use]
    pub fn embedding_source_text(&self) -> String {
        let mut parts = vec![self.title.as_str()];
        if let Some(caption) = self.caption.as_deref() {
            parts.push(caption);
        }
        if let Some(text) = self.extracted_text.as_deref() {
            parts.push(text);
        }
        parts.join("\n")
    }
}

/// What an embedding is derived from and used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingPurpose {
    /// Vector over the item's visual content.
    Visual,
    /// Vector over the item's text content.
    Textual,
}

impl EmbeddingPurpose {
    /// Stable string form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Visual => "visual",
            Self::Textual => "textual",
        }
    }

    /// Parse the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "visual" => Some(Self::Visual),
            "textual" => Some(Self::Textual),
            _ => None,
        }
    }
}

impl std::fmt::Display for EmbeddingPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted embedding with its staleness and retry metadata.
///
/// At most one row exists per (item, purpose). Deleted only by cascade
/// when the owning item is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRow {
    /// Database primary key.
    pub id: i64,

    /// Owning item.
    pub item_id: i64,

    /// What this vector represents.
    pub purpose: EmbeddingPurpose,

    /// The vector, decoded from its little-endian payload.
    #[serde(skip)]
    pub vector: Vec<f32>,

    /// Declared dimension; always equals `vector.len()`.
    pub dimension: usize,

    /// Model version that produced the vector.
    pub model_version: String,

    /// Hash of the source text the vector was generated from.
    pub source_hash: Option<String>,

    /// Unix timestamp of generation.
    pub generated_at: i64,

    /// The stored vector is out of date relative to current content or
    /// model version.
    pub needs_regeneration: bool,

    /// Number of generation attempts since the last success.
    pub indexing_attempts: i64,

    /// Unix timestamp of the last generation attempt, if any.
    pub last_attempt_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_record_builder() {
        let item = ItemRecord::new("/import/a.png", "sunset", "image/png", 1024)
            .with_caption("evening")
            .with_extracted_text("golden hour")
            .with_dimensions(800, 600);

        assert_eq!(item.source_path, "/import/a.png");
        assert_eq!(item.caption.as_deref(), Some("evening"));
        assert_eq!(item.width, Some(800));
        assert!(!item.favorite);
        assert_eq!(item.view_count, 0);
    }

    #[test]
    fn test_embedding_source_text_skips_absent_parts() {
        let bare = ItemRecord::new("/a", "title only", "image/png", 1);
        assert_eq!(bare.embedding_source_text(), "title only");

        let full = ItemRecord::new("/b", "t", "image/png", 1)
            .with_caption("c")
            .with_extracted_text("x");
        assert_eq!(full.embedding_source_text(), "t\nc\nx");
    }

    #[test]
    fn test_purpose_roundtrip() {
        for purpose in [EmbeddingPurpose::Visual, EmbeddingPurpose::Textual] {
            assert_eq!(EmbeddingPurpose::parse(purpose.as_str()), Some(purpose));
        }
        assert_eq!(EmbeddingPurpose::parse("bogus"), None);
    }
}
