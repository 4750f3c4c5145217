//! Predict Service
//!
//! HTTP object-detection service. Clients upload one or more images, each image
//! is run through a pretrained YOLO model, and the annotated result is stored in
//! an S3-compatible bucket. The response carries the detections plus a download
//! link for every image where something was found.
//!
//! ## Features
//!
//! - **Upload Validation**: item count, content type and size limits checked
//!   before any image is decoded
//! - **ONNX Inference**: YOLOv5 and YOLOv8 exports, letterboxed input,
//!   per-class NMS
//! - **Collision-free Storage Keys**: time-ordered identifiers reserved locally
//!   and checked against the bucket
//! - **Resilient Uploads**: in-memory upload with a fallback to the saved file,
//!   public or presigned download links
//!
//! ## Architecture
//!
//! ```text
//!  POST /predict (multipart)
//!         │
//!         ▼
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ File         │───▶│ Detector     │───▶│ Identifier   │
//! │ Validator    │    │ (ONNX YOLO)  │    │ Generator    │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌──────────────┐    ┌──────────────┐
//!                     │ Local result │───▶│ Object       │
//!                     │ directory    │    │ Store (S3)   │
//!                     └──────────────┘    └──────────────┘
//!                                                │
//!                                                ▼
//!                                     {results, createdAt}
//! ```

pub mod alerting;
pub mod api;
pub mod config;
pub mod detection;
pub mod identifier;
pub mod storage;
pub mod validator;

pub use alerting::Alerter;
pub use api::{create_router, AppState, PredictResponse, PredictSettings, ResultRecord};
pub use config::Config;
pub use detection::{Detection, DetectionError, DetectionResult, Detector, YoloDetector};
pub use identifier::{IdGenerator, IdentifierError, Namespace};
pub use storage::{MemoryStore, ObjectStore, S3Store, StorageError};
pub use validator::{FileValidator, UploadedImage};
