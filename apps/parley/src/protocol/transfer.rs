//! Chunked transfer engine: splitting, bounded-retry sending, reassembly.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use super::Envelope;

/// Raw payload bytes per chunk. A protocol constant, not negotiated: both
/// peers must be built with the same value or `chunkCount` will disagree.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Payloads at or below this bound are sent as a single inline envelope.
pub const INLINE_LIMIT: usize = 1024 * 1024;

/// Bounded retry for local send failures (e.g. channel momentarily not
/// open). Injected rather than hard-coded so tests can use a zero backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
#[error("channel send failed: {0}")]
pub struct SinkError(pub String);

/// Where outbound envelopes go. The PeerLink implements this over its data
/// channel; tests substitute in-memory fakes.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<(), SinkError>;
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer failed: chunk {index} exhausted {attempts} send attempts: {reason}")]
    RetriesExhausted {
        index: u32,
        attempts: u32,
        reason: String,
    },
    #[error("transfer incomplete: {received} of {expected} chunks received")]
    MissingChunks { received: u32, expected: u32 },
    #[error("chunk {index} is not valid base64")]
    BadChunkData { index: u32 },
}

pub fn chunk_count(payload_len: usize) -> u32 {
    payload_len.div_ceil(CHUNK_SIZE) as u32
}

/// Sends one payload as a `transfer-start`, its chunks in index order, and a
/// closing `transfer-end`. Sending is sequential: chunk i+1 is not attempted
/// until chunk i succeeded or exhausted its retry budget, in which case the
/// whole transfer aborts (no resume; the caller starts over with a fresh id).
///
/// `progress` is invoked with (sent, total) after each successful chunk.
pub async fn send_chunked(
    sink: &dyn EnvelopeSink,
    transfer_id: &str,
    name: &str,
    mime: &str,
    payload: &[u8],
    policy: RetryPolicy,
    mut progress: impl FnMut(u32, u32) + Send,
) -> Result<u32, TransferError> {
    let total = chunk_count(payload.len());

    let start = Envelope::TransferStart {
        transfer_id: transfer_id.to_string(),
        name: name.to_string(),
        mime: mime.to_string(),
        total_size: payload.len() as u64,
        chunk_count: total,
    };
    send_with_retry(sink, &start, 0, policy).await?;

    let mut sent = 0u32;
    for (index, chunk) in payload.chunks(CHUNK_SIZE).enumerate() {
        let index = index as u32;
        let envelope = Envelope::TransferChunk {
            transfer_id: transfer_id.to_string(),
            index,
            data: BASE64.encode(chunk),
        };
        send_with_retry(sink, &envelope, index, policy).await?;
        sent += 1;
        progress(sent, total);
    }

    let end = Envelope::TransferEnd {
        transfer_id: transfer_id.to_string(),
    };
    send_with_retry(sink, &end, total, policy).await?;

    Ok(total)
}

async fn send_with_retry(
    sink: &dyn EnvelopeSink,
    envelope: &Envelope,
    index: u32,
    policy: RetryPolicy,
) -> Result<(), TransferError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match sink.send(envelope).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < policy.max_attempts => {
                warn!(index, attempt, error = %err, "chunk send failed, retrying");
                tokio::time::sleep(policy.backoff).await;
            }
            Err(err) => {
                return Err(TransferError::RetriesExhausted {
                    index,
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Reassembly state for one in-flight transfer.
///
/// Chunks may arrive in any order and interleaved with other transfers; slots
/// are filled by `index`, duplicates are ignored. Nothing survives the
/// PeerLink: when the link closes, pending buffers are dropped wholesale.
#[derive(Debug)]
pub struct TransferBuffer {
    pub name: String,
    pub mime: String,
    pub total_size: u64,
    chunks: Vec<Option<String>>,
    received: u32,
}

impl TransferBuffer {
    pub fn new(name: String, mime: String, total_size: u64, chunk_count: u32) -> Self {
        Self {
            name,
            mime,
            total_size,
            chunks: vec![None; chunk_count as usize],
            received: 0,
        }
    }

    /// Returns false for out-of-range indices and duplicates.
    pub fn insert(&mut self, index: u32, data: String) -> bool {
        match self.chunks.get_mut(index as usize) {
            Some(slot @ None) => {
                *slot = Some(data);
                self.received += 1;
                true
            }
            _ => false,
        }
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// The completion marker alone is not proof: every slot must be filled
    /// before a payload is surfaced.
    pub fn is_complete(&self) -> bool {
        self.received == self.chunk_count()
    }

    pub fn assemble(self) -> Result<Vec<u8>, TransferError> {
        if !self.is_complete() {
            return Err(TransferError::MissingChunks {
                received: self.received,
                expected: self.chunk_count(),
            });
        }
        let mut payload = Vec::with_capacity(self.total_size as usize);
        for (index, chunk) in self.chunks.into_iter().enumerate() {
            let data = chunk.expect("complete buffer has no empty slots");
            let bytes = BASE64.decode(data).map_err(|_| TransferError::BadChunkData {
                index: index as u32,
            })?;
            payload.extend_from_slice(&bytes);
        }
        Ok(payload)
    }
}
