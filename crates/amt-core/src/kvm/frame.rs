//! Binary framing for file transfer over the control channel.
//!
//! A transfer chunk is a 4-byte big-endian header followed by the payload,
//! sent base64 encoded as a text frame. JSON frames always start with `{`,
//! anything else is chunk data.

use crate::error::TunnelError;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};

/// Largest payload carried by one chunk.
pub const CHUNK_SIZE: usize = 4092;
pub const HEADER_LEN: usize = 4;

const HEADER_MORE: u32 = 0x0100_0000;
const HEADER_FINAL: u32 = 0x0100_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHeader {
    More,
    Final,
}

impl ChunkHeader {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            HEADER_MORE => Some(ChunkHeader::More),
            HEADER_FINAL => Some(ChunkHeader::Final),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            ChunkHeader::More => HEADER_MORE,
            ChunkHeader::Final => HEADER_FINAL,
        }
    }

    pub fn is_final(self) -> bool {
        self == ChunkHeader::Final
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub payload: Vec<u8>,
}

impl Chunk {
    /// A full read continues the transfer; a short one ends it.
    pub fn from_read(payload: Vec<u8>) -> Self {
        let header = if payload.len() == CHUNK_SIZE {
            ChunkHeader::More
        } else {
            ChunkHeader::Final
        };
        Self { header, payload }
    }

    pub fn encode(&self) -> String {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.as_u32().to_be_bytes());
        buf.extend_from_slice(&self.payload);
        B64.encode(buf)
    }

    /// Decodes a base64 chunk frame. Frames with an unknown header or too
    /// short to carry one decode to `None`.
    pub fn decode(frame: &str) -> Result<Option<Self>, TunnelError> {
        let bytes = B64.decode(frame.trim().as_bytes())?;
        if bytes.len() < HEADER_LEN {
            return Ok(None);
        }
        let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(ChunkHeader::from_u32(raw).map(|header| Chunk {
            header,
            payload: bytes[HEADER_LEN..].to_vec(),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame<'a> {
    Json(&'a str),
    Chunk(&'a str),
}

pub fn classify(frame: &str) -> ControlFrame<'_> {
    match frame.as_bytes().first() {
        Some(&b) if b != b'{' => ControlFrame::Chunk(frame),
        _ => ControlFrame::Json(frame),
    }
}
