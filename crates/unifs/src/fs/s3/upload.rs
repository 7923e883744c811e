//! Multipart uploads and the S3 write stream.
//!
//! Bytes written to an [`S3WriteStream`] travel over a bounded channel to an
//! upload task, which holds at most one part in memory. Streams of up to one
//! part finish with a single PUT; anything larger becomes a multipart
//! upload. Dropping a stream before `shutdown()` completes closes the channel,
//! and the task aborts any upload it started.

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;

use super::client::S3Client;
use crate::error::{Error, ErrorContext, Result, map_error};

/// Part size for multipart uploads, also the single-PUT threshold: 8 MiB.
pub(crate) const PART_SIZE: usize = 8 * 1024 * 1024;

/// Writes queued between a stream and its upload task.
const CHANNEL_DEPTH: usize = 4;

impl S3Client {
    pub(crate) async fn create_multipart(&self, key: &str, context: &ErrorContext) -> Result<String> {
        let out = self
            .sdk()
            .create_multipart_upload()
            .bucket(self.bucket())
            .key(key)
            .send()
            .await
            .map_err(|e| map_error(e, context))?;
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::storage("CreateMultipartUpload returned no UploadId", "InvalidResponse"))
    }

    pub(crate) async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        body: Vec<u8>,
        context: &ErrorContext,
    ) -> Result<CompletedPart> {
        let out = self
            .sdk()
            .upload_part()
            .bucket(self.bucket())
            .key(key)
            .upload_id(upload_id)
            .part_number(number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_error(e, context))?;
        let etag = out
            .e_tag()
            .ok_or_else(|| Error::storage("UploadPart returned no ETag", "InvalidResponse"))?;
        Ok(CompletedPart::builder()
            .e_tag(etag)
            .part_number(number)
            .build())
    }

    pub(crate) async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        context: &ErrorContext,
    ) -> Result<()> {
        self.sdk()
            .complete_multipart_upload()
            .bucket(self.bucket())
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, context))
    }

    pub(crate) async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let context = ErrorContext::new("abortMultipartUpload", key);
        self.sdk()
            .abort_multipart_upload()
            .bucket(self.bucket())
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, &context))
    }

    /// Upload `data` in one request, or as a multipart upload when it is
    /// larger than one part. A failed multipart upload is aborted.
    pub(crate) async fn upload(&self, key: &str, data: &[u8], context: &ErrorContext) -> Result<()> {
        if data.len() <= PART_SIZE {
            return self.put_object(key, data.to_vec(), context).await;
        }
        let upload_id = self.create_multipart(key, context).await?;
        let result = async {
            let mut parts = Vec::new();
            for (i, chunk) in data.chunks(PART_SIZE).enumerate() {
                let number = i32::try_from(i + 1)
                    .map_err(|_| Error::validation("too many parts for one upload"))?;
                parts.push(
                    self.upload_part(key, &upload_id, number, chunk.to_vec(), context)
                        .await?,
                );
            }
            self.complete_multipart(key, &upload_id, parts, context).await
        }
        .await;
        if let Err(e) = &result {
            self.abort_logged(key, &upload_id, e).await;
        }
        result
    }

    async fn abort_logged(&self, key: &str, upload_id: &str, reason: &Error) {
        match self.abort_multipart(key, upload_id).await {
            Ok(()) => self
                .log()
                .warn(&format!("aborted incomplete upload of {}: {}", key, reason)),
            Err(e) => self
                .log()
                .warn(&format!("failed to abort upload {} for {}: {}", upload_id, key, e)),
        }
    }
}

enum Message {
    Data(Vec<u8>),
    Finish,
}

/// Upload task state: the unsent tail and, once started, the multipart upload.
struct Uploader {
    client: Arc<S3Client>,
    key: String,
    context: ErrorContext,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
}

impl Uploader {
    async fn run(mut self, mut messages: mpsc::Receiver<Message>) -> Result<()> {
        let result = self.receive(&mut messages).await;
        if let (Err(e), Some(upload_id)) = (&result, &self.upload_id) {
            self.client.abort_logged(&self.key, upload_id, e).await;
        }
        result
    }

    async fn receive(&mut self, messages: &mut mpsc::Receiver<Message>) -> Result<()> {
        while let Some(message) = messages.recv().await {
            match message {
                Message::Data(chunk) => {
                    self.buffer.extend_from_slice(&chunk);
                    while self.buffer.len() > PART_SIZE {
                        self.send_part().await?;
                    }
                }
                Message::Finish => return self.finish().await,
            }
        }
        Err(Error::storage(
            format!("write stream for {} dropped before shutdown", self.key),
            "EPIPE",
        ))
    }

    /// Upload up to one part from the front of the buffer.
    async fn send_part(&mut self) -> Result<()> {
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let id = self.client.create_multipart(&self.key, &self.context).await?;
                self.upload_id = Some(id.clone());
                id
            }
        };
        let take = self.buffer.len().min(PART_SIZE);
        let body: Vec<u8> = self.buffer.drain(..take).collect();
        let number = i32::try_from(self.parts.len() + 1)
            .map_err(|_| Error::validation("too many parts for one upload"))?;
        let part = self
            .client
            .upload_part(&self.key, &upload_id, number, body, &self.context)
            .await?;
        self.parts.push(part);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let Some(upload_id) = self.upload_id.clone() else {
            let body = std::mem::take(&mut self.buffer);
            return self.client.put_object(&self.key, body, &self.context).await;
        };
        if !self.buffer.is_empty() {
            self.send_part().await?;
        }
        let parts = std::mem::take(&mut self.parts);
        self.client
            .complete_multipart(&self.key, &upload_id, parts, &self.context)
            .await
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "write stream is closed")
}

/// `AsyncWrite` into one S3 object.
pub(crate) struct S3WriteStream {
    sender: PollSender<Message>,
    /// `None` once the task's outcome has been collected.
    task: Option<JoinHandle<Result<()>>>,
    finishing: bool,
    failed: bool,
}

impl S3WriteStream {
    /// Start the upload task. Must be called inside a tokio runtime.
    pub(crate) fn spawn(client: Arc<S3Client>, key: String, path: &str) -> Self {
        let (sender, messages) = mpsc::channel(CHANNEL_DEPTH);
        let uploader = Uploader {
            client,
            key,
            context: ErrorContext::new("createWriteStream", path),
            buffer: Vec::new(),
            upload_id: None,
            parts: Vec::new(),
        };
        Self {
            sender: PollSender::new(sender),
            task: Some(tokio::spawn(uploader.run(messages))),
            finishing: false,
            failed: false,
        }
    }

    /// Wait for the upload task to stop and report how it ended.
    fn poll_task(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(task) = self.task.as_mut() else {
            return Poll::Ready(if self.failed { Err(closed()) } else { Ok(()) });
        };
        let result = match ready!(Pin::new(task).poll(cx)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into_io()),
            Err(join) => Err(io::Error::other(join)),
        };
        self.task = None;
        self.failed = result.is_err();
        Poll::Ready(result)
    }
}

impl AsyncWrite for S3WriteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.finishing || this.task.is_none() {
            return Poll::Ready(Err(closed()));
        }
        match ready!(this.sender.poll_reserve(cx)) {
            Ok(()) => {
                this.sender
                    .send_item(Message::Data(buf.to_vec()))
                    .map_err(|_| closed())?;
                Poll::Ready(Ok(buf.len()))
            }
            // The task stopped early; its result says why.
            Err(_) => match ready!(this.poll_task(cx)) {
                Ok(()) => Poll::Ready(Err(closed())),
                Err(e) => Poll::Ready(Err(e)),
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.finishing && this.task.is_some() {
            if ready!(this.sender.poll_reserve(cx)).is_ok() {
                let _ = this.sender.send_item(Message::Finish);
            }
            this.finishing = true;
        }
        this.poll_task(cx)
    }
}
