//! Buffered byte streams decoupling an application from per-datagram I/O

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;

/// A piece of a byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Payload, possibly empty
    pub data: Bytes,
    /// Whether this is the end of the stream
    pub fin: bool,
}

/// Create a FIFO queue of chunks
///
/// The writer never blocks; the reader suspends while the queue is empty.
pub fn chunk_queue() -> (ChunkWriter, ChunkReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChunkWriter {
            tx: Some(tx),
        },
        ChunkReader {
            rx,
            pending: None,
            finished: false,
        },
    )
}

/// The write half of a [`chunk_queue`]
#[derive(Debug)]
pub struct ChunkWriter {
    tx: Option<mpsc::UnboundedSender<Chunk>>,
}

impl ChunkWriter {
    /// Append `data` to the stream
    pub fn write(&mut self, data: impl Into<Bytes>) -> Result<(), QueueClosed> {
        self.write_chunk(Chunk {
            data: data.into(),
            fin: false,
        })
    }

    /// End the stream
    pub fn finish(&mut self) -> Result<(), QueueClosed> {
        self.write_chunk(Chunk {
            data: Bytes::new(),
            fin: true,
        })
    }

    /// Append a chunk, ending the stream if it carries `fin`
    ///
    /// Fails once the stream has ended or the reader is gone.
    pub fn write_chunk(&mut self, chunk: Chunk) -> Result<(), QueueClosed> {
        let tx = self.tx.as_ref().ok_or(QueueClosed)?;
        let fin = chunk.fin;
        tx.send(chunk).map_err(|_| QueueClosed)?;
        if fin {
            self.tx = None;
        }
        Ok(())
    }

    /// Whether the stream has been ended by this writer
    pub fn is_finished(&self) -> bool {
        self.tx.is_none()
    }
}

/// The read half of a [`chunk_queue`]
///
/// Dropping the writer without finishing also ends the stream.
#[derive(Debug)]
pub struct ChunkReader {
    rx: mpsc::UnboundedReceiver<Chunk>,
    /// Remainder of a chunk partially consumed by `read_up_to`
    pending: Option<Chunk>,
    finished: bool,
}

impl ChunkReader {
    /// Wait for the next chunk
    ///
    /// Returns `None` once the stream has ended.
    pub async fn read(&mut self) -> Option<Chunk> {
        if let Some(chunk) = self.pending.take() {
            return Some(chunk);
        }
        if self.finished {
            return None;
        }
        let chunk = self.rx.recv().await;
        self.observe(chunk)
    }

    /// Take the next chunk if one is queued, without waiting
    pub fn try_read(&mut self) -> Option<Chunk> {
        if let Some(chunk) = self.pending.take() {
            return Some(chunk);
        }
        if self.finished {
            return None;
        }
        match self.rx.try_recv() {
            Ok(chunk) => self.observe(Some(chunk)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.observe(None),
        }
    }

    /// Wait for at most `max` bytes of the stream
    pub async fn read_up_to(&mut self, max: usize) -> Option<Chunk> {
        let mut chunk = self.read().await?;
        if chunk.data.len() > max {
            let rest = chunk.data.split_off(max);
            self.pending = Some(Chunk {
                data: rest,
                fin: chunk.fin,
            });
            chunk.fin = false;
        }
        Some(chunk)
    }

    /// Put back a chunk so the next read returns it first
    ///
    /// Only one chunk can be held back at a time; it replaces any previous one.
    pub fn unread(&mut self, chunk: Chunk) {
        self.pending = Some(chunk);
    }

    /// Collect the rest of the stream
    pub async fn read_to_end(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.read().await {
            buf.extend_from_slice(&chunk.data);
            if chunk.fin {
                break;
            }
        }
        buf.freeze()
    }

    fn observe(&mut self, chunk: Option<Chunk>) -> Option<Chunk> {
        match chunk {
            Some(chunk) => {
                self.finished = chunk.fin;
                Some(chunk)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

/// The stream has ended, or its other half is gone
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("chunk queue closed")]
pub struct QueueClosed;
