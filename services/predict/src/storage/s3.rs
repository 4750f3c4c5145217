use super::{ObjectStore, StorageError, StorageResult};
use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
    ObjectCannedAcl,
};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const DELETE_CONCURRENCY: usize = 8;

/// S3-compatible result store
pub struct S3Store {
    client: S3Client,
    bucket: String,
    config: StorageConfig,
    project_id: Option<String>,
}

impl S3Store {
    /// Create a new S3 store
    pub async fn new(config: &StorageConfig, project_id: Option<String>) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 store initialized"
        );

        Ok(Self::from_client(client, config, project_id))
    }

    /// Wrap an already configured client
    pub fn from_client(client: S3Client, config: &StorageConfig, project_id: Option<String>) -> Self {
        Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
            project_id,
        }
    }

    /// Make sure the bucket exists, creating it when allowed
    pub async fn ensure_bucket(&self) -> StorageResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "Bucket exists");
                Ok(())
            }
            Err(e) if self.config.create_bucket_if_missing => {
                warn!(
                    bucket = %self.bucket,
                    error = %DisplayErrorContext(&e),
                    "Bucket lookup failed, attempting to create it"
                );

                let mut request = self.client.create_bucket().bucket(&self.bucket);
                // us-east-1 rejects an explicit location constraint
                if self.config.region != "us-east-1" {
                    request = request.create_bucket_configuration(
                        CreateBucketConfiguration::builder()
                            .location_constraint(BucketLocationConstraint::from(
                                self.config.region.as_str(),
                            ))
                            .build(),
                    );
                }
                request
                    .send()
                    .await
                    .map_err(|e| backend_error("Failed to create bucket", e))?;

                info!(bucket = %self.bucket, "Bucket created");
                Ok(())
            }
            Err(e) => Err(backend_error("Failed to look up bucket", e)),
        }
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(&self, key: &str, body: ByteStream, content_type: &str) -> StorageResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type);

        if let Some(ref project) = self.project_id {
            request = request.metadata("project", project);
        }

        request
            .send()
            .await
            .map_err(|e| backend_error("Failed to upload object", e))?;

        Ok(())
    }

    /// Multipart upload for large objects
    async fn multipart_upload(&self, key: &str, data: &Bytes, content_type: &str) -> StorageResult<()> {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type);

        if let Some(ref project) = self.project_id {
            create = create.metadata("project", project);
        }

        let create_response = create
            .send()
            .await
            .map_err(|e| backend_error("Failed to create multipart upload", e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::Backend("No upload ID in response".to_string()))?;

        if let Err(e) = self.upload_parts(key, upload_id, data).await {
            // Parts of an incomplete upload stay in the bucket until aborted
            match self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
            {
                Ok(_) => debug!(key = %key, upload_id = %upload_id, "Multipart upload aborted"),
                Err(abort) => warn!(
                    key = %key,
                    upload_id = %upload_id,
                    error = %DisplayErrorContext(&abort),
                    "Failed to abort multipart upload"
                ),
            }
            return Err(e);
        }

        Ok(())
    }

    /// Upload every part and complete the multipart upload
    async fn upload_parts(&self, key: &str, upload_id: &str, data: &Bytes) -> StorageResult<()> {
        let mut completed_parts = Vec::new();
        let part_size = self.config.part_size_bytes.max(1);
        let mut part_number = 1;

        for chunk in data.chunks(part_size) {
            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| backend_error("Failed to upload part", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| backend_error("Failed to complete multipart upload", e))?;

        Ok(())
    }

    async fn publish_if(&self, key: &str, public: bool) -> StorageResult<Option<String>> {
        if public {
            self.make_public(key).await.map(Some)
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, path), fields(key = %key))]
    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        public: bool,
    ) -> StorageResult<Option<String>> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to open {}: {}", path.display(), e)))?;

        self.simple_upload(key, body, content_type).await?;

        info!(path = %path.display(), key = %key, "File uploaded to bucket");

        self.publish_if(key, public).await
    }

    #[instrument(skip(self, data), fields(key = %key, size_bytes = data.len()))]
    async fn upload_bytes(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        public: bool,
    ) -> StorageResult<Option<String>> {
        if data.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, &data, content_type).await?;
        } else {
            self.simple_upload(key, ByteStream::from(data.clone()), content_type)
                .await?;
        }

        info!(key = %key, size_bytes = data.len(), "Stream uploaded to bucket");

        self.publish_if(key, public).await
    }

    #[instrument(skip(self, path), fields(key = %key))]
    async fn download_to_path(&self, key: &str, path: &Path) -> StorageResult<u64> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    StorageError::NotFound(key.to_string())
                } else {
                    backend_error("Failed to download object", e)
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to read object body: {}", e)))?
            .into_bytes();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &data).await?;

        info!(key = %key, path = %path.display(), "Object downloaded");
        Ok(data.len() as u64)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(backend_error("Failed to check object existence", e))
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| backend_error("Failed to list objects", e))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn make_public(&self, key: &str) -> StorageResult<String> {
        self.client
            .put_object_acl()
            .bucket(&self.bucket)
            .key(key)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| backend_error("Failed to make object public", e))?;

        let url = self.public_url(key);
        info!(key = %key, url = %url, "Object is publicly accessible");
        Ok(url)
    }

    fn public_url(&self, key: &str) -> String {
        public_url(&self.config, key)
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::Presign(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| StorageError::Presign(DisplayErrorContext(&e).to_string()))?;

        debug!(key = %key, "Generated presigned GET URL");
        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend_error("Failed to delete object", e))?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn batch_delete(&self, prefix: &str) -> StorageResult<usize> {
        use futures::stream::{self, StreamExt, TryStreamExt};

        let keys = self.list(prefix).await?;
        let deleted = keys.len();

        let deletions: Vec<_> = keys.iter().map(|key| self.delete(key)).collect();
        stream::iter(deletions)
            .buffer_unordered(DELETE_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;

        info!(prefix = %prefix, deleted, "Batch deleted objects");
        Ok(deleted)
    }

    fn backend(&self) -> &'static str {
        "s3"
    }
}

/// Public URL for a key: configured base URL, then custom endpoint, then AWS
fn public_url(config: &StorageConfig, key: &str) -> String {
    if let Some(ref base) = config.public_base_url {
        let base = base.trim_end_matches('/');
        return format!("{}/{}", base, key);
    }

    if let Some(ref endpoint) = config.endpoint_url {
        return format!("{}/{}/{}", endpoint.trim_end_matches('/'), config.bucket, key);
    }

    if config.region == "us-east-1" {
        format!("https://{}.s3.amazonaws.com/{}", config.bucket, key)
    } else {
        format!("https://{}.s3.{}.amazonaws.com/{}", config.bucket, config.region, key)
    }
}

fn backend_error<E>(context: &str, e: E) -> StorageError
where
    E: std::error::Error,
{
    StorageError::Backend(format!("{}: {}", context, DisplayErrorContext(&e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{Credentials, Region};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal S3 endpoint: multipart creation succeeds, every part upload
    /// is denied, aborts succeed. Records `METHOD target` per request.
    async fn spawn_failing_part_server() -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = requests.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_connection(socket, log.clone()));
            }
        });

        (format!("http://{}", addr), requests)
    }

    async fn serve_connection(mut socket: TcpStream, log: Arc<Mutex<Vec<String>>>) {
        let mut buf = Vec::new();
        loop {
            let header_end = loop {
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
                let mut chunk = [0u8; 4096];
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            };

            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let content_length = head
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < header_end + content_length {
                let mut chunk = [0u8; 4096];
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            buf.drain(..header_end + content_length);

            let request_line = head.lines().next().unwrap_or_default().to_string();
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let target = parts.next().unwrap_or_default().to_string();
            log.lock().unwrap().push(format!("{} {}", method, target));

            let (status, body) = match method.as_str() {
                "POST" if target.contains("uploads") => (
                    "200 OK",
                    "<InitiateMultipartUploadResult><Bucket>test-bucket</Bucket>\
                     <Key>big.bin</Key><UploadId>upload-1</UploadId>\
                     </InitiateMultipartUploadResult>",
                ),
                "PUT" => (
                    "403 Forbidden",
                    "<Error><Code>AccessDenied</Code><Message>denied</Message></Error>",
                ),
                "DELETE" => ("204 No Content", ""),
                _ => (
                    "400 Bad Request",
                    "<Error><Code>InvalidRequest</Code><Message>unexpected</Message></Error>",
                ),
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/xml\r\nContent-Length: {}\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            if socket.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    fn local_store(endpoint: &str) -> S3Store {
        let client_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("test", "test", None, None, "test"))
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();

        let config = StorageConfig {
            bucket: "test-bucket".to_string(),
            endpoint_url: Some(endpoint.to_string()),
            force_path_style: true,
            multipart_threshold_bytes: 4,
            part_size_bytes: 4,
            ..StorageConfig::default()
        };
        S3Store::from_client(S3Client::from_conf(client_config), &config, None)
    }

    #[tokio::test]
    async fn test_failed_part_aborts_multipart_upload() {
        let (endpoint, requests) = spawn_failing_part_server().await;
        let store = local_store(&endpoint);

        let result = store
            .upload_bytes("big.bin", Bytes::from_static(b"0123456789"), "image/jpeg", false)
            .await;
        assert!(matches!(result, Err(StorageError::Backend(_))));

        let requests = requests.lock().unwrap().clone();
        assert!(requests[0].starts_with("POST /test-bucket/big.bin?uploads"));
        assert!(requests.iter().any(|r| r.starts_with("PUT ")));
        assert!(requests.iter().any(|r| r.starts_with("DELETE ") && r.contains("uploadId=upload-1")));
        assert!(!requests.iter().any(|r| r.starts_with("POST ") && r.contains("uploadId")));
    }

    fn create_test_config() -> StorageConfig {
        StorageConfig {
            bucket: "test-bucket".to_string(),
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_public_url_default_region() {
        let config = create_test_config();
        assert_eq!(
            public_url(&config, "results/a_1/dog.jpg"),
            "https://test-bucket.s3.amazonaws.com/results/a_1/dog.jpg"
        );
    }

    #[test]
    fn test_public_url_other_region() {
        let mut config = create_test_config();
        config.region = "eu-west-1".to_string();
        assert_eq!(
            public_url(&config, "k.jpg"),
            "https://test-bucket.s3.eu-west-1.amazonaws.com/k.jpg"
        );
    }

    #[test]
    fn test_public_url_overrides() {
        let mut config = create_test_config();
        config.endpoint_url = Some("http://localhost:9000/".to_string());
        assert_eq!(
            public_url(&config, "k.jpg"),
            "http://localhost:9000/test-bucket/k.jpg"
        );

        config.public_base_url = Some("https://cdn.example.com/".to_string());
        assert_eq!(public_url(&config, "k.jpg"), "https://cdn.example.com/k.jpg");
    }
}
