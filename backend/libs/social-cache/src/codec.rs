//! Payload encoding: JSON, zlib-compressed above a size threshold.
//!
//! Layout: one header byte followed by the body.
//! `0x00` = raw JSON, `0x01` = zlib-compressed JSON.

use crate::{CacheError, CacheResult};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{Read, Write};

const RAW: u8 = 0x00;
const ZLIB: u8 = 0x01;

/// Default compression threshold in bytes.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    compression_threshold: usize,
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl PayloadCodec {
    pub fn new(compression_threshold: usize) -> Self {
        Self {
            compression_threshold,
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> CacheResult<Vec<u8>> {
        let json = serde_json::to_vec(value)?;
        if json.len() < self.compression_threshold {
            let mut out = Vec::with_capacity(json.len() + 1);
            out.push(RAW);
            out.extend_from_slice(&json);
            return Ok(out);
        }

        let compression_error =
            |e: std::io::Error| CacheError::Serialization(format!("zlib compression failed: {}", e));
        let mut encoder = ZlibEncoder::new(vec![ZLIB], Compression::default());
        encoder.write_all(&json).map_err(compression_error)?;
        encoder.finish().map_err(compression_error)
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        match bytes.split_first() {
            Some((&RAW, body)) => Ok(serde_json::from_slice(body)?),
            Some((&ZLIB, body)) => {
                let mut json = Vec::new();
                ZlibDecoder::new(body)
                    .read_to_end(&mut json)
                    .map_err(|e| {
                        CacheError::Serialization(format!("zlib decompression failed: {}", e))
                    })?;
                Ok(serde_json::from_slice(&json)?)
            }
            Some((header, _)) => Err(CacheError::Serialization(format!(
                "unknown payload header 0x{:02x}",
                header
            ))),
            None => Err(CacheError::Serialization("empty payload".to_string())),
        }
    }
}
