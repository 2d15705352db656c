//! Stream fan-out.
//!
//! [`clone_reader`] turns one [`ByteStream`] into `n` independent streams that together consume
//! the source exactly once. A pump task reads the source and pushes each chunk to per-consumer
//! queues, so every consumer observes the complete, identical byte sequence at its own pace.
//!
//! Contract details:
//! - Dropping any subset of the outputs does not starve the rest; the pump only stops early
//!   once every consumer is gone.
//! - A mid-stream source error is delivered to each live consumer at the corresponding
//!   position (after all bytes read so far).
//! - Buffering is per-consumer and unbounded: a slow consumer never stalls a fast one. Callers
//!   that need a hard memory bound should drain promptly or spill downstream.
//!
//! Must be called from within a tokio runtime (the pump is a spawned task).

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::trace;

use crate::model::ByteStream;

const PUMP_CHUNK_BYTES: usize = 64 * 1024;

/// Produce `n` independent streams over `source`.
pub fn clone_reader(source: ByteStream, n: usize) -> Vec<ByteStream> {
    if n == 0 {
        // no consumers: the source is dropped unread
        return Vec::new();
    }
    if n == 1 {
        return vec![source];
    }

    let mut senders = Vec::with_capacity(n);
    let mut outputs: Vec<ByteStream> = Vec::with_capacity(n);
    for _ in 0..n {
        let (tx, rx) = mpsc::unbounded_channel();
        senders.push(tx);
        outputs.push(Box::new(FanoutReader { rx, current: None }));
    }

    tokio::spawn(pump(source, senders));
    outputs
}

async fn pump(mut source: ByteStream, mut senders: Vec<mpsc::UnboundedSender<io::Result<Bytes>>>) {
    let mut buf = vec![0u8; PUMP_CHUNK_BYTES];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => {
                let chunk = Bytes::copy_from_slice(&buf[..read]);
                senders.retain(|tx| tx.send(Ok(chunk.clone())).is_ok());
                if senders.is_empty() {
                    trace!("all fan-out consumers closed; stopping pump");
                    break;
                }
            }
            Err(err) => {
                for tx in &senders {
                    let _ = tx.send(Err(io::Error::new(err.kind(), err.to_string())));
                }
                break;
            }
        }
    }
    // dropping the senders signals end-of-stream to the consumers
}

struct FanoutReader {
    rx: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    current: Option<Bytes>,
}

impl AsyncRead for FanoutReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if let Some(chunk) = self.current.as_mut() {
                if !chunk.is_empty() {
                    let take = chunk.len().min(out.remaining());
                    out.put_slice(&chunk.split_to(take));
                    return Poll::Ready(Ok(()));
                }
                self.current = None;
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.current = Some(chunk),
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
