//! Upload validation for prediction payloads.

use crate::config::LimitsConfig;
use bytes::Bytes;

/// One uploaded image part, as received
#[derive(Debug, Clone)]
pub struct UploadedImage {
    /// Raw part bytes
    pub data: Bytes,
    /// Declared content type of the part
    pub content_type: Option<String>,
    /// Declared filename of the part
    pub filename: Option<String>,
    /// Declared length from the part headers, when sent
    pub declared_length: Option<u64>,
}

impl UploadedImage {
    /// Size of the buffered part
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Checks uploaded parts against type and size limits
#[derive(Debug, Clone)]
pub struct FileValidator {
    max_items: usize,
    max_item_bytes: u64,
    accepted_types: Vec<String>,
}

impl FileValidator {
    pub fn new(max_items: usize, max_item_bytes: u64, accepted_types: Vec<String>) -> Self {
        Self {
            max_items,
            max_item_bytes,
            accepted_types,
        }
    }

    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self::new(
            limits.max_items,
            limits.max_item_bytes,
            limits.accepted_types.clone(),
        )
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// True when the part's declared type is accepted and its size is within
    /// the ceiling. The size used is the measured length, then the declared
    /// length, then the buffer length.
    pub fn is_valid(&self, file: Option<&UploadedImage>, measured_len: Option<u64>) -> bool {
        let Some(file) = file else {
            return false;
        };
        self.is_valid_type(file) && self.is_valid_size(file, measured_len)
    }

    /// True when a payload carrying `count` items is within the item limit
    pub fn is_valid_count(&self, count: usize) -> bool {
        count <= self.max_items
    }

    fn is_valid_type(&self, file: &UploadedImage) -> bool {
        let Some(ref content_type) = file.content_type else {
            return false;
        };
        let content_type = content_type.to_ascii_lowercase();
        self.accepted_types
            .iter()
            .any(|token| content_type.contains(&token.to_ascii_lowercase()))
    }

    fn is_valid_size(&self, file: &UploadedImage, measured_len: Option<u64>) -> bool {
        let length = measured_len
            .or(file.declared_length)
            .unwrap_or_else(|| file.len());
        length <= self.max_item_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> FileValidator {
        FileValidator::new(2, 1024, vec!["image".to_string()])
    }

    fn upload(content_type: Option<&str>, size: usize) -> UploadedImage {
        UploadedImage {
            data: Bytes::from(vec![0u8; size]),
            content_type: content_type.map(String::from),
            filename: Some("dog.jpg".to_string()),
            declared_length: None,
        }
    }

    #[test]
    fn test_absent_file_is_invalid() {
        assert!(!validator().is_valid(None, Some(10)));
    }

    #[test]
    fn test_content_type_token() {
        let v = validator();
        assert!(v.is_valid(Some(&upload(Some("image/jpeg"), 10)), None));
        assert!(v.is_valid(Some(&upload(Some("IMAGE/PNG"), 10)), None));
        assert!(!v.is_valid(Some(&upload(Some("application/pdf"), 10)), None));
        assert!(!v.is_valid(Some(&upload(None, 10)), None));
    }

    #[test]
    fn test_size_ceiling_is_inclusive() {
        let v = validator();
        assert!(v.is_valid(Some(&upload(Some("image/jpeg"), 1024)), None));
        assert!(!v.is_valid(Some(&upload(Some("image/jpeg"), 1025)), None));
    }

    #[test]
    fn test_size_fallback_order() {
        let v = validator();
        let mut file = upload(Some("image/jpeg"), 10);

        // Measured length wins over everything
        assert!(!v.is_valid(Some(&file), Some(2048)));

        // Declared length is used when nothing was measured
        file.declared_length = Some(4096);
        assert!(!v.is_valid(Some(&file), None));
        assert!(v.is_valid(Some(&file), Some(10)));
    }

    #[test]
    fn test_item_count() {
        let v = validator();
        assert!(v.is_valid_count(0));
        assert!(v.is_valid_count(2));
        assert!(!v.is_valid_count(3));
    }
}
