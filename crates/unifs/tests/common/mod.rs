//! In-process S3-compatible server for integration tests.
//!
//! Speaks just enough HTTP/1.1 and S3 REST for the operations the S3 adapter
//! issues: object GET/HEAD/PUT/DELETE, server-side copy, ListObjectsV2,
//! DeleteObjects, bucket HEAD and multipart uploads. Every response closes
//! the connection, which keeps the parser to one request per socket.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use unifs::{CommonConfig, Config, S3Config};

pub const BUCKET: &str = "test-bucket";

const LAST_MODIFIED: &str = "Wed, 12 Oct 2009 17:50:00 GMT";
const LAST_MODIFIED_ISO: &str = "2009-10-12T17:50:00.000Z";

#[derive(Default)]
struct Upload {
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
pub struct State {
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
    uploads: Mutex<HashMap<String, Upload>>,
    /// Statuses to answer the next requests with, in order.
    failures: Mutex<VecDeque<u16>>,
    /// ListObjectsV2 page size.
    page_size: AtomicUsize,
    next_upload: AtomicUsize,
    /// Answer every request as if the bucket were gone.
    bucket_missing: AtomicBool,
    /// Hold the response to the next object PUT, after storing it.
    put_delay: Mutex<Option<Duration>>,
    pub requests: AtomicUsize,
    pub completed_uploads: AtomicUsize,
    pub aborted_uploads: AtomicUsize,
    pub log: Mutex<Vec<String>>,
}

pub struct FakeS3 {
    pub endpoint: String,
    pub state: Arc<State>,
}

impl FakeS3 {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());
        state.page_size.store(1000, Ordering::SeqCst);

        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = serve(socket, state).await;
                });
            }
        });

        Self {
            endpoint: format!("http://{}", addr),
            state,
        }
    }

    /// Configuration for a filesystem over this server.
    pub fn config(&self, prefix: &str, max_retries: u32) -> Config {
        self.config_with_timeout(prefix, max_retries, 5_000)
    }

    pub fn config_with_timeout(&self, prefix: &str, max_retries: u32, timeout_ms: u64) -> Config {
        Config::S3 {
            s3: S3Config::new(BUCKET, "us-east-1")
                .credentials("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY")
                .endpoint(self.endpoint.clone())
                .force_path_style(true)
                .prefix(prefix),
            common: CommonConfig::default()
                .timeout_ms(timeout_ms)
                .max_retries(max_retries),
        }
    }

    pub fn put(&self, key: &str, body: &[u8]) {
        self.state
            .objects
            .lock()
            .unwrap()
            .insert(key.to_string(), body.to_vec());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn fail_next(&self, statuses: &[u16]) {
        self.state
            .failures
            .lock()
            .unwrap()
            .extend(statuses.iter().copied());
    }

    pub fn set_bucket_missing(&self, missing: bool) {
        self.state.bucket_missing.store(missing, Ordering::SeqCst);
    }

    /// Store the next object PUT at once but answer it only after `delay`.
    pub fn delay_next_put(&self, delay: Duration) {
        *self.state.put_delay.lock().unwrap() = Some(delay);
    }

    /// Number of plain object PUTs seen.
    pub fn object_puts(&self) -> usize {
        self.request_log()
            .iter()
            .filter(|line| line.starts_with("PUT ") && !line.contains("partNumber="))
            .count()
    }

    pub fn set_page_size(&self, size: usize) {
        self.state.page_size.store(size, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn completed_uploads(&self) -> usize {
        self.state.completed_uploads.load(Ordering::SeqCst)
    }

    pub fn open_uploads(&self) -> usize {
        self.state.uploads.lock().unwrap().len()
    }

    /// `METHOD path?query` lines of every request seen.
    pub fn request_log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }
}

struct Request {
    method: String,
    key: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn xml(status: u16, body: String) -> Self {
        let mut response = Self::new(status);
        response
            .headers
            .push(("Content-Type".to_string(), "application/xml".to_string()));
        response.body = body.into_bytes();
        response
    }

    fn error(status: u16, code: &str, message: &str) -> Self {
        Self::xml(
            status,
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{}</Code><Message>{}</Message></Error>",
                code, message
            ),
        )
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }
}

async fn serve(mut socket: TcpStream, state: Arc<State>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 64 * 1024];
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    if headers
        .get("expect")
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    {
        socket.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
    }

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let body_start = head_end + 4;
    while buf.len() < body_start + length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = buf[body_start..(body_start + length).min(buf.len())].to_vec();

    let (path, raw_query) = target.split_once('?').unwrap_or((target.as_str(), ""));
    let path = percent_decode(path);
    let key = path
        .strip_prefix(&format!("/{}", BUCKET))
        .map(|rest| rest.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let query: HashMap<String, String> = raw_query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect();

    state.requests.fetch_add(1, Ordering::SeqCst);
    state
        .log
        .lock()
        .unwrap()
        .push(format!("{} {}", method, target));

    let is_head = method == "HEAD";
    let is_object_put = method == "PUT" && !query.contains_key("partNumber");
    let request = Request {
        method,
        key,
        query,
        headers,
        body,
    };
    let response = handle(&state, request);
    if is_object_put && response.status == 200 {
        let delay = state.put_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    let mut out = format!("HTTP/1.1 {} {}\r\n", response.status, reason(response.status));
    for (name, value) in &response.headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !response
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-length"))
    {
        out.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    out.push_str("Connection: close\r\n\r\n");
    socket.write_all(out.as_bytes()).await?;
    if !is_head {
        socket.write_all(&response.body).await?;
    }
    socket.flush().await?;
    socket.shutdown().await
}

fn handle(state: &State, request: Request) -> Response {
    if let Some(status) = state.failures.lock().unwrap().pop_front() {
        let code = if status == 503 { "SlowDown" } else { "InternalError" };
        return Response::error(status, code, "injected failure");
    }
    if state.bucket_missing.load(Ordering::SeqCst) {
        return if request.method == "HEAD" {
            Response::new(404)
        } else {
            Response::error(404, "NoSuchBucket", "The specified bucket does not exist")
        };
    }

    let q = &request.query;
    match request.method.as_str() {
        "GET" if q.contains_key("list-type") => list(state, q),
        "HEAD" if request.key.is_empty() => Response::new(200),
        "GET" | "HEAD" => get_object(state, &request),
        "PUT" if q.contains_key("partNumber") => upload_part(state, &request),
        "PUT" if request.headers.contains_key("x-amz-copy-source") => copy_object(state, &request),
        "PUT" => {
            state
                .objects
                .lock()
                .unwrap()
                .insert(request.key, request.body);
            Response::new(200).header("ETag", "\"etag\"")
        }
        "POST" if q.contains_key("delete") => delete_objects(state, &request),
        "POST" if q.contains_key("uploads") => {
            let id = format!("upload-{}", state.next_upload.fetch_add(1, Ordering::SeqCst));
            state.uploads.lock().unwrap().insert(
                id.clone(),
                Upload {
                    key: request.key.clone(),
                    parts: BTreeMap::new(),
                },
            );
            Response::xml(
                200,
                format!(
                    "<InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                    BUCKET,
                    escape(&request.key),
                    id
                ),
            )
        }
        "POST" if q.contains_key("uploadId") => complete_upload(state, &request),
        "DELETE" if q.contains_key("uploadId") => {
            state.uploads.lock().unwrap().remove(&q["uploadId"]);
            state.aborted_uploads.fetch_add(1, Ordering::SeqCst);
            Response::new(204)
        }
        "DELETE" => {
            state.objects.lock().unwrap().remove(&request.key);
            Response::new(204)
        }
        _ => Response::error(405, "MethodNotAllowed", "unsupported request"),
    }
}

fn get_object(state: &State, request: &Request) -> Response {
    let objects = state.objects.lock().unwrap();
    let Some(data) = objects.get(&request.key) else {
        return if request.method == "HEAD" {
            Response::new(404)
        } else {
            Response::error(404, "NoSuchKey", "The specified key does not exist.")
        };
    };

    let mut status = 200;
    let mut body = data.clone();
    if let Some(range) = request
        .headers
        .get("range")
        .and_then(|r| r.strip_prefix("bytes="))
    {
        let (start, end) = range.split_once('-').unwrap_or((range, ""));
        let start: usize = start.parse().unwrap_or(0);
        if start >= data.len() {
            return Response::error(416, "InvalidRange", "The requested range is not satisfiable");
        }
        let end = end
            .parse::<usize>()
            .map(|e| e.min(data.len() - 1))
            .unwrap_or(data.len() - 1);
        body = data[start..=end].to_vec();
        status = 206;
    }

    let mut response = Response::new(status)
        .header("Last-Modified", LAST_MODIFIED)
        .header("ETag", "\"etag\"");
    if request.method == "HEAD" {
        response = response.header("Content-Length", data.len().to_string());
    } else {
        response.body = body;
    }
    response
}

fn copy_object(state: &State, request: &Request) -> Response {
    let source = percent_decode(&request.headers["x-amz-copy-source"]);
    let source_key = source
        .trim_start_matches('/')
        .strip_prefix(&format!("{}/", BUCKET))
        .unwrap_or_default()
        .to_string();
    let mut objects = state.objects.lock().unwrap();
    let Some(data) = objects.get(&source_key).cloned() else {
        return Response::error(404, "NoSuchKey", "The specified key does not exist.");
    };
    objects.insert(request.key.clone(), data);
    Response::xml(
        200,
        format!(
            "<CopyObjectResult><LastModified>{}</LastModified><ETag>\"etag\"</ETag></CopyObjectResult>",
            LAST_MODIFIED_ISO
        ),
    )
}

fn list(state: &State, query: &HashMap<String, String>) -> Response {
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let delimiter = query.get("delimiter").filter(|d| !d.is_empty());
    let after = query.get("continuation-token");
    let limit = query
        .get("max-keys")
        .and_then(|m| m.parse().ok())
        .unwrap_or(usize::MAX)
        .min(state.page_size.load(Ordering::SeqCst));

    let objects = state.objects.lock().unwrap();
    let mut contents = Vec::new();
    let mut prefixes = BTreeSet::new();
    let mut last = None;
    let mut truncated = false;
    for (key, data) in objects.range(prefix.clone()..) {
        if !key.starts_with(&prefix) {
            break;
        }
        if after.is_some_and(|a| key <= a) {
            continue;
        }
        if contents.len() + prefixes.len() >= limit {
            truncated = true;
            break;
        }
        let rest = &key[prefix.len()..];
        match delimiter.and_then(|d| rest.find(d.as_str()).map(|i| i + d.len())) {
            Some(end) => {
                prefixes.insert(format!("{}{}", prefix, &rest[..end]));
            }
            None => contents.push((key.clone(), data.len())),
        }
        last = Some(key.clone());
    }

    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><ListBucketResult><Name>{}</Name><Prefix>{}</Prefix><KeyCount>{}</KeyCount><IsTruncated>{}</IsTruncated>",
        BUCKET,
        escape(&prefix),
        contents.len() + prefixes.len(),
        truncated
    );
    if truncated {
        if let Some(last) = last {
            xml.push_str(&format!(
                "<NextContinuationToken>{}</NextContinuationToken>",
                escape(&last)
            ));
        }
    }
    for (key, size) in contents {
        xml.push_str(&format!(
            "<Contents><Key>{}</Key><LastModified>{}</LastModified><Size>{}</Size></Contents>",
            escape(&key),
            LAST_MODIFIED_ISO,
            size
        ));
    }
    for prefix in prefixes {
        xml.push_str(&format!(
            "<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>",
            escape(&prefix)
        ));
    }
    xml.push_str("</ListBucketResult>");
    Response::xml(200, xml)
}

fn delete_objects(state: &State, request: &Request) -> Response {
    let has_checksum = request
        .headers
        .keys()
        .any(|name| name == "content-md5" || name.starts_with("x-amz-checksum-"));
    if !has_checksum {
        return Response::error(400, "InvalidRequest", "a content checksum is required");
    }
    let body = String::from_utf8_lossy(&request.body);
    let mut objects = state.objects.lock().unwrap();
    for key in tag_values(&body, "Key") {
        objects.remove(&key);
    }
    Response::xml(200, "<DeleteResult></DeleteResult>".to_string())
}

fn upload_part(state: &State, request: &Request) -> Response {
    let mut uploads = state.uploads.lock().unwrap();
    let Some(upload) = uploads.get_mut(&request.query["uploadId"]) else {
        return Response::error(404, "NoSuchUpload", "The specified upload does not exist.");
    };
    let number: u32 = request.query["partNumber"].parse().unwrap_or(0);
    upload.parts.insert(number, request.body.clone());
    Response::new(200).header("ETag", format!("\"part-{}\"", number))
}

fn complete_upload(state: &State, request: &Request) -> Response {
    let Some(upload) = state
        .uploads
        .lock()
        .unwrap()
        .remove(&request.query["uploadId"])
    else {
        return Response::error(404, "NoSuchUpload", "The specified upload does not exist.");
    };
    let body = String::from_utf8_lossy(&request.body);
    let mut data = Vec::new();
    for number in tag_values(&body, "PartNumber") {
        let number: u32 = number.parse().unwrap_or(0);
        match upload.parts.get(&number) {
            Some(part) => data.extend_from_slice(part),
            None => return Response::error(400, "InvalidPart", "missing part"),
        }
    }
    state.objects.lock().unwrap().insert(upload.key.clone(), data);
    state.completed_uploads.fetch_add(1, Ordering::SeqCst);
    Response::xml(
        200,
        format!(
            "<CompleteMultipartUploadResult><Key>{}</Key><ETag>\"etag\"</ETag></CompleteMultipartUploadResult>",
            escape(&upload.key)
        ),
    )
}

fn tag_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        values.push(unescape(&after[..end]));
        rest = &after[end + close.len()..];
    }
    values
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
