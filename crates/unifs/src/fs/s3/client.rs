//! S3 client over the AWS SDK.
//!
//! Wraps one `aws_sdk_s3::Client` bound to a bucket and exposes the object
//! requests the adapter needs, each returning a taxonomy [`Error`]. The SDK
//! never retries on its own: retries and the per-attempt deadline belong to
//! the adapter's operation runner, so one attempt is one HTTP request.
//!
//! # Timeouts
//!
//! The HTTP client carries a connect timeout and a per-read timeout. Whole
//! operations are additionally bounded by the operation runner.

use aws_sdk_s3::Client;
use aws_sdk_s3::config::interceptors::{
    BeforeDeserializationInterceptorContextRef, BeforeTransmitInterceptorContextRef,
};
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{
    BehaviorVersion, ConfigBag, Credentials, Intercept, Region, RequestChecksumCalculation,
    ResponseChecksumValidation, RuntimeComponents,
};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_smithy_http_client::{Builder as HttpClientBuilder, tls};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

use crate::config::ResolvedS3;
use crate::error::{BoxError, Error, ErrorContext, ErrorKind, NativeError, Result, map_error};
use crate::logging_impl::{OperationLog, redact_header, redact_url};

/// Longest time to wait for a TCP/TLS connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keys per DeleteObjects request (S3 limit).
const DELETE_BATCH: usize = 1000;

/// Metadata from a HEAD request.
pub(crate) struct ObjectMeta {
    pub size: u64,
    pub modified: SystemTime,
}

/// One page of a ListObjectsV2 listing.
#[derive(Debug, Default)]
pub(crate) struct ListPage {
    pub keys: Vec<String>,
    pub prefixes: Vec<String>,
    /// Set only when the listing is truncated.
    pub next_token: Option<String>,
}

pub(crate) struct S3Client {
    sdk: Client,
    bucket: String,
    /// Set once the bucket is known to exist.
    bucket_checked: AtomicBool,
    log: OperationLog,
}

/// Explicit credentials, else the standard AWS environment variables.
fn resolve_credentials(config: &ResolvedS3) -> Option<Credentials> {
    let from_env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    let (id, secret, token) = match (&config.access_key_id, &config.secret_access_key) {
        (Some(id), Some(secret)) => (id.clone(), secret.clone(), config.session_token.clone()),
        _ => (
            from_env("AWS_ACCESS_KEY_ID")?,
            from_env("AWS_SECRET_ACCESS_KEY")?,
            from_env("AWS_SESSION_TOKEN"),
        ),
    };
    Some(Credentials::new(id, secret, token, None, "unifs"))
}

/// Percent-encode a key for `x-amz-copy-source`, keeping `/`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Request the SDK refused to build, e.g. a missing required field.
fn invalid_request(
    err: impl std::error::Error + Send + Sync + 'static,
    context: &ErrorContext,
) -> Error {
    map_error(NativeError::with_code("EINVAL", err.to_string()).caused_by(err), context)
}

/// Body that broke off mid-transfer.
fn body_error(err: impl std::error::Error + Send + Sync + 'static, context: &ErrorContext) -> Error {
    map_error(NativeError::with_code("ECONNRESET", err.to_string()).caused_by(err), context)
}

impl S3Client {
    pub(crate) fn new(config: &ResolvedS3, log: OperationLog) -> Result<Self> {
        let http_client = HttpClientBuilder::new()
            .tls_provider(tls::Provider::Rustls(tls::rustls_provider::CryptoMode::Ring))
            .build_https();
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(config.timeout))
            .read_timeout(config.timeout)
            .build();

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .force_path_style(config.force_path_style)
            .retry_config(RetryConfig::disabled())
            .timeout_config(timeouts)
            // Plain Content-Length bodies; no aws-chunked trailers.
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
            .http_client(http_client)
            .interceptor(RequestLog { log: log.clone() });
        match resolve_credentials(config) {
            Some(credentials) => builder = builder.credentials_provider(credentials),
            None => log.debug("no credentials configured, sending unsigned requests"),
        }
        if let Some(endpoint) = &config.endpoint {
            Url::parse(endpoint).map_err(|e| {
                Error::validation(format!("invalid S3 endpoint {}: {}", endpoint, e))
            })?;
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            sdk: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            bucket_checked: AtomicBool::new(false),
            log,
        })
    }

    pub(crate) fn bucket(&self) -> &str {
        &self.bucket
    }

    pub(crate) fn sdk(&self) -> &Client {
        &self.sdk
    }

    pub(crate) fn log(&self) -> &OperationLog {
        &self.log
    }

    /// Fail with a storage error when the bucket is missing.
    ///
    /// A HEAD on a key in a missing bucket answers a bare 404, which reads
    /// like a missing key. Only a 404 here is fatal; other failures (say, no
    /// `s3:ListBucket` permission) leave the key lookup's answer standing
    /// and are asked again next time.
    pub(crate) async fn check_bucket(&self, context: &ErrorContext) -> Result<()> {
        if self.bucket_checked.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.sdk.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                self.bucket_checked.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) if e.raw_response().is_some_and(|r| r.status().as_u16() == 404) => {
                let native = NativeError::with_code(
                    "NoSuchBucket",
                    format!("bucket {} does not exist", self.bucket),
                )
                .status(404)
                .caused_by(e);
                Err(map_error(native, context))
            }
            Err(e) => {
                self.log
                    .debug(&format!("bucket check inconclusive: {}", map_error(e, context)));
                Ok(())
            }
        }
    }

    /// HEAD an object. `None` when the key does not exist.
    pub(crate) async fn head(&self, key: &str, context: &ErrorContext) -> Result<Option<ObjectMeta>> {
        match self.sdk.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(out) => Ok(Some(ObjectMeta {
                size: out
                    .content_length()
                    .and_then(|n| u64::try_from(n).ok())
                    .unwrap_or(0),
                modified: out
                    .last_modified()
                    .and_then(|t| SystemTime::try_from(*t).ok())
                    .unwrap_or(UNIX_EPOCH),
            })),
            Err(e) => {
                let err = map_error(e, context);
                if err.kind() != ErrorKind::NotFound {
                    return Err(err);
                }
                self.check_bucket(context).await?;
                Ok(None)
            }
        }
    }

    /// GET an object, optionally a byte range, as a live body.
    pub(crate) async fn open(
        &self,
        key: &str,
        range: Option<String>,
        context: &ErrorContext,
    ) -> Result<ByteStream> {
        let out = self
            .sdk
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range)
            .send()
            .await
            .map_err(|e| map_error(e, context))?;
        Ok(out.body)
    }

    /// GET a whole object into memory.
    pub(crate) async fn get(&self, key: &str, context: &ErrorContext) -> Result<Vec<u8>> {
        let body = self.open(key, None, context).await?;
        let data = body
            .collect()
            .await
            .map_err(|e| body_error(e, context))?;
        Ok(data.into_bytes().to_vec())
    }

    pub(crate) async fn put_object(&self, key: &str, body: Vec<u8>, context: &ErrorContext) -> Result<()> {
        self.sdk
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, context))
    }

    /// Server-side copy within the bucket.
    pub(crate) async fn copy_object(&self, from: &str, to: &str, context: &ErrorContext) -> Result<()> {
        self.sdk
            .copy_object()
            .bucket(&self.bucket)
            .key(to)
            .copy_source(format!("{}/{}", self.bucket, encode_key(from)))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, context))
    }

    pub(crate) async fn delete_object(&self, key: &str, context: &ErrorContext) -> Result<()> {
        self.sdk
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, context))
    }

    pub(crate) async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
        max_keys: Option<i32>,
        context: &ErrorContext,
    ) -> Result<ListPage> {
        let out = self
            .sdk
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_delimiter(delimiter.map(str::to_string))
            .set_continuation_token(token.map(str::to_string))
            .set_max_keys(max_keys)
            .send()
            .await
            .map_err(|e| map_error(e, context))?;

        let next_token = if out.is_truncated().unwrap_or(false) {
            out.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListPage {
            keys: out
                .contents()
                .iter()
                .filter_map(|o| o.key().map(str::to_string))
                .collect(),
            prefixes: out
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(str::to_string))
                .collect(),
            next_token,
        })
    }

    /// DeleteObjects in batches, failing on the first per-key error.
    pub(crate) async fn delete_many(&self, keys: &[String], context: &ErrorContext) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| invalid_request(e, context))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| invalid_request(e, context))?;
            let out = self
                .sdk
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| map_error(e, context))?;
            if let Some(failed) = out.errors().first() {
                return Err(Error::storage(
                    format!(
                        "failed to delete {}: {}",
                        failed.key().unwrap_or_default(),
                        failed.message().unwrap_or_default()
                    ),
                    failed.code().unwrap_or("DeleteFailed"),
                ));
            }
        }
        Ok(())
    }
}

/// Trace-level log of every HTTP exchange, with credentials redacted.
struct RequestLog {
    log: OperationLog,
}

impl fmt::Debug for RequestLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestLog")
    }
}

impl Intercept for RequestLog {
    fn name(&self) -> &'static str {
        "RequestLog"
    }

    fn read_before_transmit(
        &self,
        context: &BeforeTransmitInterceptorContextRef<'_>,
        _runtime_components: &RuntimeComponents,
        _cfg: &mut ConfigBag,
    ) -> std::result::Result<(), BoxError> {
        let request = context.request();
        self.log
            .trace(&format!("{} {}", request.method(), redact_url(request.uri())));
        for (name, value) in request.headers().iter() {
            self.log
                .trace(&format!("  {}: {}", name, redact_header(name, value)));
        }
        Ok(())
    }

    fn read_before_deserialization(
        &self,
        context: &BeforeDeserializationInterceptorContextRef<'_>,
        _runtime_components: &RuntimeComponents,
        _cfg: &mut ConfigBag,
    ) -> std::result::Result<(), BoxError> {
        self.log
            .trace(&format!("-> {}", context.response().status().as_u16()));
        Ok(())
    }
}
