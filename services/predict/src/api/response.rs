use crate::detection::Detection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome for one uploaded image.
///
/// `id`, `prefix` and `downloadlink` are either all set or all null; they are
/// null exactly when nothing was detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub index: usize,
    pub id: Option<String>,
    pub prefix: Option<String>,
    pub result: Vec<Detection>,
    pub filename: String,
    pub downloadlink: Option<String>,
    pub filelength: u64,
}

impl ResultRecord {
    /// Record for an image with no detections
    pub fn empty(index: usize, filename: String, filelength: u64) -> Self {
        Self {
            index,
            id: None,
            prefix: None,
            result: Vec::new(),
            filename,
            downloadlink: None,
            filelength,
        }
    }

    /// Record for an image whose annotated result was stored
    pub fn stored(
        index: usize,
        id: String,
        prefix: String,
        result: Vec<Detection>,
        filename: String,
        downloadlink: String,
        filelength: u64,
    ) -> Self {
        Self {
            index,
            id: Some(id),
            prefix: Some(prefix),
            result,
            filename,
            downloadlink: Some(downloadlink),
            filelength,
        }
    }
}

/// Successful prediction response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    pub results: Vec<ResultRecord>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

impl PredictResponse {
    pub fn new(results: Vec<ResultRecord>) -> Self {
        Self {
            results,
            created_at: format_timestamp(Utc::now()),
        }
    }
}

/// `YYYY-MM-DD HH:MM:SS.ffffff` in UTC
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap()
            + chrono::Duration::microseconds(42);
        assert_eq!(format_timestamp(at), "2024-03-05 07:08:09.000042");
    }

    #[test]
    fn test_empty_record_serializes_nulls() {
        let record = ResultRecord::empty(1, "cat.jpg".to_string(), 512);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["index"], 1);
        assert!(json["id"].is_null());
        assert!(json["prefix"].is_null());
        assert!(json["downloadlink"].is_null());
        assert_eq!(json["result"], serde_json::json!([]));
        assert_eq!(json["filelength"], 512);
    }

    #[test]
    fn test_response_field_names() {
        let record = ResultRecord::stored(
            0,
            "abc_1".to_string(),
            "results".to_string(),
            Vec::new(),
            "dog.jpg".to_string(),
            "https://bucket/results/abc_1/dog.jpg".to_string(),
            10,
        );
        assert_eq!(record.prefix.as_deref(), Some("results"));

        let json = serde_json::to_value(PredictResponse::new(vec![record])).unwrap();
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["results"][0]["id"], "abc_1");
    }
}
