//! Decides whether a blob is indexed as text and how it is decoded

/// WHATWG content-type sniffing
pub mod sniff;

use crate::error::ConfigError;
use encoding_rs::Encoding;

/// Encoding reported when no configured encoding decodes the bytes cleanly
pub const FALLBACK_ENCODING: &str = "utf-8";

/// Why a blob is not indexed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    TooLarge { size: u64, limit: u64 },
    UnsupportedType(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::TooLarge { size, limit } => {
                write!(f, "size {} exceeds limit {}", size, limit)
            }
            RejectReason::UnsupportedType(mime) => write!(f, "unsupported content type {}", mime),
        }
    }
}

/// Outcome of classifying a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Accept { text: String, encoding: String },
    Reject(RejectReason),
}

/// Size, content-type and encoding policy for indexed blobs
#[derive(Debug, Clone)]
pub struct ContentClassifier {
    encodings: Vec<&'static Encoding>,
}

impl Default for ContentClassifier {
    fn default() -> Self {
        Self {
            encodings: vec![encoding_rs::SHIFT_JIS, encoding_rs::UTF_8],
        }
    }
}

impl ContentClassifier {
    /// Build a classifier trying `labels` in order
    pub fn new<S: AsRef<str>>(labels: &[S]) -> Result<Self, ConfigError> {
        let encodings = labels
            .iter()
            .map(|label| {
                Encoding::for_label(label.as_ref().as_bytes()).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        key: "indexing.encodings".to_string(),
                        reason: format!("unknown encoding '{}'", label.as_ref()),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { encodings })
    }

    /// Whether a blob of `size` bytes is over `size_limit` (0 disables the limit)
    pub fn exceeds_limit(size: u64, size_limit: u64) -> bool {
        size_limit > 0 && size > size_limit
    }

    /// Whether a sniffed content type is indexable
    pub fn is_indexable_type(mime: &str) -> bool {
        mime.starts_with("text/") || mime == "application/octet-stream"
    }

    /// Classify a blob; never fails
    pub fn classify(&self, mime: &str, bytes: &[u8], size: u64, size_limit: u64) -> Classification {
        if Self::exceeds_limit(size, size_limit) {
            return Classification::Reject(RejectReason::TooLarge {
                size,
                limit: size_limit,
            });
        }

        if !Self::is_indexable_type(mime) {
            return Classification::Reject(RejectReason::UnsupportedType(mime.to_string()));
        }

        let (text, encoding) = self.decode(bytes);
        Classification::Accept { text, encoding }
    }

    /// Decode with the first configured encoding that has no malformed sequences
    pub fn decode(&self, bytes: &[u8]) -> (String, String) {
        for encoding in &self.encodings {
            if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
                return (text.into_owned(), encoding.name().to_ascii_lowercase());
            }
        }

        (
            String::from_utf8_lossy(bytes).into_owned(),
            FALLBACK_ENCODING.to_string(),
        )
    }
}
