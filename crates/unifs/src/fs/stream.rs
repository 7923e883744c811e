//! Lazy stream adapters.
//!
//! `create_read_stream`/`create_write_stream` are synchronous, so opening
//! happens on first poll. Failures, including the open itself, are reported
//! through the stream as `std::io::Error` wrapping the taxonomy [`Error`].

use futures_util::future::BoxFuture;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::traits::{ReadStream, WriteStream};
use crate::error::{Error, Result};

enum ReadState {
    Opening(BoxFuture<'static, Result<ReadStream>>),
    Reading(ReadStream),
    Done,
}

/// Reader that opens its source on first read.
pub(crate) struct LazyReader {
    state: ReadState,
}

impl LazyReader {
    pub(crate) fn new(open: impl Future<Output = Result<ReadStream>> + Send + 'static) -> Self {
        Self {
            state: ReadState::Opening(Box::pin(open)),
        }
    }
}

impl AsyncRead for LazyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ReadState::Opening(open) => match open.as_mut().poll(cx) {
                    Poll::Ready(Ok(reader)) => this.state = ReadState::Reading(reader),
                    Poll::Ready(Err(e)) => {
                        this.state = ReadState::Done;
                        return Poll::Ready(Err(e.into_io()));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                ReadState::Reading(reader) => return reader.as_mut().poll_read(cx, buf),
                ReadState::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

enum WriteState {
    Opening(BoxFuture<'static, Result<WriteStream>>),
    Writing(WriteStream),
    Failed,
}

/// Writer that opens its destination on first use.
pub(crate) struct LazyWriter {
    state: WriteState,
}

impl LazyWriter {
    pub(crate) fn new(open: impl Future<Output = Result<WriteStream>> + Send + 'static) -> Self {
        Self {
            state: WriteState::Opening(Box::pin(open)),
        }
    }

    /// Writer that fails with `err` on first use.
    pub(crate) fn failed(err: Error) -> Self {
        Self::new(async move { Err(err) })
    }

    fn poll_open(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<&mut WriteStream>> {
        if let WriteState::Opening(open) = &mut self.state {
            match open.as_mut().poll(cx) {
                Poll::Ready(Ok(writer)) => self.state = WriteState::Writing(writer),
                Poll::Ready(Err(e)) => {
                    self.state = WriteState::Failed;
                    return Poll::Ready(Err(e.into_io()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        match &mut self.state {
            WriteState::Writing(writer) => Poll::Ready(Ok(writer)),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write stream failed to open",
            ))),
        }
    }
}

impl AsyncWrite for LazyWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().poll_open(cx) {
            Poll::Ready(Ok(writer)) => writer.as_mut().poll_write(cx, buf),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().poll_open(cx) {
            Poll::Ready(Ok(writer)) => writer.as_mut().poll_flush(cx),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().poll_open(cx) {
            Poll::Ready(Ok(writer)) => writer.as_mut().poll_shutdown(cx),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}
