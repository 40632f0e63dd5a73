// src/recording/tee.rs
//! Response body tee
//!
//! [`TeeBody`] wraps the body the proxy forwards to the client and copies
//! every data frame into an unbounded channel read by the record encoder.
//! The copy is a refcount bump on [`Bytes`] and a non-blocking send, so the
//! client path never waits on the archive side. A closed or lagging
//! receiver never affects the frames the client sees.

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Message sent from the tee to the archive side
#[derive(Debug)]
pub enum TeeMessage {
    Data(Bytes),

    /// The source body reached its end
    Finished,
}

/// Why an archived body is shorter than what the client received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    /// Exceeded the configured body limit
    Length,

    /// No data arrived within the idle timeout
    Time,

    /// The tee went away before the body ended
    Disconnect,
}

impl Truncation {
    /// Value of the `WARC-Truncated` header
    pub fn as_str(&self) -> &'static str {
        match self {
            Truncation::Length => "length",
            Truncation::Time => "time",
            Truncation::Disconnect => "disconnect",
        }
    }
}

/// Split `body` into a pass-through wrapper and the archive-side receiver
pub fn tee<B: Body>(body: B) -> (TeeBody<B>, BodyReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut teed = TeeBody {
        inner: body,
        sink: Some(tx),
    };

    // An already finished body may never be polled.
    if teed.inner.is_end_stream() {
        teed.finish();
    }

    (teed, BodyReceiver { rx })
}

/// Body wrapper duplicating data frames into a side channel
#[derive(Debug)]
pub struct TeeBody<B> {
    inner: B,
    sink: Option<mpsc::UnboundedSender<TeeMessage>>,
}

impl<B: Body> TeeBody<B> {
    fn forward(&mut self, chunk: &Bytes) {
        if let Some(sink) = &self.sink {
            if sink.send(TeeMessage::Data(chunk.clone())).is_err() {
                // Archive side gave up; keep serving the client.
                self.sink = None;
            }
        }
        if self.inner.is_end_stream() {
            self.finish();
        }
    }

    fn finish(&mut self) {
        if let Some(sink) = self.sink.take() {
            let _ = sink.send(TeeMessage::Finished);
        }
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(chunk) = frame.data_ref() {
                    this.forward(chunk);
                }
            }
            Poll::Ready(None) => this.finish(),
            Poll::Ready(Some(Err(_))) => {
                // Dropping the sender marks the archived copy as cut short.
                this.sink = None;
            }
            Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for TeeBody<B> {
    fn drop(&mut self) {
        if self.sink.is_some() {
            debug!("Body tee dropped before end of stream");
        }
    }
}

/// Archived copy of a body
#[derive(Debug, Default)]
pub struct DrainedBody {
    pub bytes: Vec<u8>,
    pub truncated: Option<Truncation>,
}

/// Archive-side end of a [`TeeBody`]
#[derive(Debug)]
pub struct BodyReceiver {
    rx: mpsc::UnboundedReceiver<TeeMessage>,
}

impl BodyReceiver {
    /// Collect the teed body.
    ///
    /// Stops at end of stream, when the tee is dropped, after `idle` without
    /// a new chunk, or once `limit` bytes are held. The receiver is released
    /// on return, so later tee sends are discarded.
    pub async fn drain(mut self, idle: Duration, limit: usize) -> DrainedBody {
        let mut drained = DrainedBody::default();

        loop {
            match tokio::time::timeout(idle, self.rx.recv()).await {
                Ok(Some(TeeMessage::Data(chunk))) => {
                    let room = limit.saturating_sub(drained.bytes.len());
                    if chunk.len() > room {
                        drained.bytes.extend_from_slice(&chunk[..room]);
                        drained.truncated = Some(Truncation::Length);
                        return drained;
                    }
                    drained.bytes.extend_from_slice(&chunk);
                }
                Ok(Some(TeeMessage::Finished)) => return drained,
                Ok(None) => {
                    drained.truncated = Some(Truncation::Disconnect);
                    return drained;
                }
                Err(_) => {
                    drained.truncated = Some(Truncation::Time);
                    return drained;
                }
            }
        }
    }
}
