// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! GELF over UDP.
//!
//! A datagram holds either a whole message (plain JSON, gzip or zlib) or one
//! chunk of a larger message. Chunks start with `1e 0f`, followed by an 8-byte
//! message id, the chunk sequence number and the chunk count.

use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::{GzDecoder, ZlibDecoder};
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::ReceiveError;
use crate::record::GelfMessage;
use crate::source::MessageSource;

pub const MAX_DATAGRAM_SIZE: usize = 65_535;
pub const MAX_CHUNKS: usize = 128;
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(5);

const CHUNK_MAGIC: [u8; 2] = [0x1e, 0x0f];
const CHUNK_HEADER_LEN: usize = 12;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZLIB_MAGIC: u8 = 0x78;
// decompression bomb guard
const MAX_MESSAGE_SIZE: u64 = 8 * 1024 * 1024;

pub fn is_chunk(datagram: &[u8]) -> bool {
    datagram.starts_with(&CHUNK_MAGIC)
}

fn inflate(reader: impl Read) -> Result<Vec<u8>, ReceiveError> {
    let mut out = Vec::new();
    reader
        .take(MAX_MESSAGE_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| ReceiveError::Decode(format!("unable to decompress payload: {e}")))?;
    if out.len() as u64 > MAX_MESSAGE_SIZE {
        return Err(ReceiveError::Decode(
            "decompressed payload too large".into(),
        ));
    }
    Ok(out)
}

/// Decodes a complete GELF payload, decompressing it when needed.
pub fn decode_payload(payload: &[u8]) -> Result<GelfMessage, ReceiveError> {
    let json = if payload.starts_with(&GZIP_MAGIC) {
        inflate(GzDecoder::new(payload))?
    } else if payload.first() == Some(&ZLIB_MAGIC) {
        inflate(ZlibDecoder::new(payload))?
    } else {
        payload.to_vec()
    };

    match serde_json::from_slice::<Value>(&json) {
        Ok(Value::Object(object)) => {
            GelfMessage::from_json_object(object).map_err(ReceiveError::Decode)
        }
        Ok(_) => Err(ReceiveError::Decode("payload is not a JSON object".into())),
        Err(e) => Err(ReceiveError::Decode(format!("invalid JSON: {e}"))),
    }
}

struct PartialMessage {
    started: Instant,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Reassembles chunked messages keyed by their message id.
#[derive(Default)]
pub struct ChunkAssembler {
    pending: HashMap<[u8; 8], PartialMessage>,
}

impl ChunkAssembler {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops messages whose first chunk is older than [`CHUNK_TIMEOUT`].
    pub fn expire(&mut self, now: Instant) {
        let before = self.pending.len();
        self.pending
            .retain(|_, msg| now.saturating_duration_since(msg.started) <= CHUNK_TIMEOUT);
        let expired = before - self.pending.len();
        if expired > 0 {
            debug!(expired, "Discarded incomplete chunked messages");
        }
    }

    /// Stores one chunk. Returns the full payload once every chunk arrived.
    pub fn push(&mut self, datagram: &[u8], now: Instant) -> Result<Option<Vec<u8>>, ReceiveError> {
        if datagram.len() < CHUNK_HEADER_LEN || !is_chunk(datagram) {
            return Err(ReceiveError::Decode("truncated chunk header".into()));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&datagram[2..10]);
        let sequence = usize::from(datagram[10]);
        let count = usize::from(datagram[11]);
        if count == 0 || count > MAX_CHUNKS {
            return Err(ReceiveError::Decode(format!("invalid chunk count {count}")));
        }
        if sequence >= count {
            return Err(ReceiveError::Decode(format!(
                "chunk sequence {sequence} out of range for {count} chunks"
            )));
        }

        let msg = self.pending.entry(id).or_insert_with(|| PartialMessage {
            started: now,
            chunks: vec![None; count],
            received: 0,
        });
        if msg.chunks.len() != count {
            self.pending.remove(&id);
            return Err(ReceiveError::Decode(
                "chunk count changed mid-message".into(),
            ));
        }

        let slot = &mut msg.chunks[sequence];
        if slot.is_none() {
            *slot = Some(datagram[CHUNK_HEADER_LEN..].to_vec());
            msg.received += 1;
        }
        if msg.received < count {
            return Ok(None);
        }

        let payload = self
            .pending
            .remove(&id)
            .map(|msg| msg.chunks.into_iter().flatten().flatten().collect())
            .unwrap_or_default();
        Ok(Some(payload))
    }
}

/// GELF message source reading datagrams from a UDP socket.
pub struct GelfUdpSource {
    socket: UdpSocket,
    chunks: ChunkAssembler,
    buf: Vec<u8>,
}

impl GelfUdpSource {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(GelfUdpSource {
            socket,
            chunks: ChunkAssembler::default(),
            buf: vec![0; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl MessageSource for GelfUdpSource {
    async fn receive(&mut self, deadline: Instant) -> Result<GelfMessage, ReceiveError> {
        loop {
            self.chunks.expire(Instant::now());

            let received = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut self.buf));
            let (len, _src) = match received.await {
                Ok(received) => received?,
                Err(_) => return Err(ReceiveError::Timeout),
            };

            let datagram = &self.buf[..len];
            if !is_chunk(datagram) {
                return decode_payload(datagram);
            }
            if let Some(payload) = self.chunks.push(datagram, Instant::now())? {
                return decode_payload(&payload);
            }
        }
    }
}
