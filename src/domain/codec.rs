//! Byte encoding of cache-resident entities.
//!
//! Entities are stored as MessagePack maps keyed by field name. Older writers
//! wrapped that payload in a zlib stream; readers detect the zlib header and
//! inflate before unpacking, so both encodings may coexist in one keyspace.

use std::io::{Read, Write};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Header emitted by zlib at the default compression level.
pub const ZLIB_MAGIC: [u8; 2] = [0x78, 0x9c];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to pack entity: {0}")]
    Pack(#[from] rmp_serde::encode::Error),
    #[error("failed to unpack entity: {0}")]
    Unpack(#[from] rmp_serde::decode::Error),
    #[error("failed to inflate compressed entity: {0}")]
    Inflate(#[source] std::io::Error),
    #[error("failed to deflate entity: {0}")]
    Deflate(#[source] std::io::Error),
    #[error("entity payload is empty")]
    Empty,
}

/// Pack `entity` in the plain form written by the refresh pipeline.
pub fn encode<T: Serialize>(entity: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(entity)?)
}

/// Pack `entity` and wrap it in a zlib stream.
pub fn encode_compressed<T: Serialize>(entity: &T) -> Result<Vec<u8>, CodecError> {
    let packed = encode(entity)?;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(packed.len()), Compression::default());
    encoder.write_all(&packed).map_err(CodecError::Deflate)?;
    encoder.finish().map_err(CodecError::Deflate)
}

/// Decode either encoding into `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }

    if is_compressed(bytes) {
        let mut inflated = Vec::new();
        ZlibDecoder::new(bytes)
            .read_to_end(&mut inflated)
            .map_err(CodecError::Inflate)?;
        return Ok(rmp_serde::from_slice(&inflated)?);
    }

    Ok(rmp_serde::from_slice(bytes)?)
}

pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.starts_with(&ZLIB_MAGIC)
}
