use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use model::TileCoord;

const PAYLOAD_RAW: u8 = 0;
const PAYLOAD_DEFLATE: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("compressed tile payload is empty")]
    EmptyPayload,
    #[error("unknown payload flag {0}")]
    UnknownPayloadFlag(u8),
    #[error("decompressed tile has {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("deflate stream is corrupt: {0}")]
    Inflate(#[source] io::Error),
}

/// Tile payload encodings, keyed by the version number written next to
/// every stored tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileCompressor {
    /// Raw pixel bytes.
    Legacy = 1,
    /// A flag byte followed by a deflate stream, or by the raw bytes when
    /// deflate does not shrink the tile.
    Deflate = 2,
}

impl TileCompressor {
    pub const CURRENT: TileCompressor = TileCompressor::Deflate;

    pub fn for_version(version: i32) -> Self {
        match version {
            1 => TileCompressor::Legacy,
            2 => TileCompressor::Deflate,
            other => panic!("unknown tile compressor version {other}"),
        }
    }

    pub fn version(self) -> i32 {
        self as i32
    }

    pub fn compress(self, data: &[u8]) -> Vec<u8> {
        match self {
            TileCompressor::Legacy => data.to_vec(),
            TileCompressor::Deflate => {
                match deflate(data).filter(|deflated| deflated.len() <= data.len()) {
                    Some(deflated) => deflated,
                    None => {
                        let mut raw = Vec::with_capacity(data.len() + 1);
                        raw.push(PAYLOAD_RAW);
                        raw.extend_from_slice(data);
                        raw
                    }
                }
            }
        }
    }

    pub fn decompress(self, payload: &[u8], expected_len: usize) -> Result<Vec<u8>, CompressError> {
        let data = match self {
            TileCompressor::Legacy => payload.to_vec(),
            TileCompressor::Deflate => {
                let (&flag, body) = payload.split_first().ok_or(CompressError::EmptyPayload)?;
                match flag {
                    PAYLOAD_RAW => body.to_vec(),
                    PAYLOAD_DEFLATE => {
                        let mut data = Vec::with_capacity(expected_len);
                        DeflateDecoder::new(body)
                            .read_to_end(&mut data)
                            .map_err(CompressError::Inflate)?;
                        data
                    }
                    other => return Err(CompressError::UnknownPayloadFlag(other)),
                }
            }
        };
        if data.len() != expected_len {
            return Err(CompressError::LengthMismatch {
                expected: expected_len,
                actual: data.len(),
            });
        }
        Ok(data)
    }
}

fn deflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(vec![PAYLOAD_DEFLATE], Compression::fast());
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}

/// One stored tile: `{col, row, version, payload_len}` as little-endian
/// `i32`s followed by the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRecord {
    pub coord: TileCoord,
    pub version: i32,
    pub payload: Vec<u8>,
}

pub const TILE_RECORD_HEADER_BYTES: usize = 16;

impl TileRecord {
    pub fn encode(coord: TileCoord, compressor: TileCompressor, data: &[u8]) -> Self {
        Self {
            coord,
            version: compressor.version(),
            payload: compressor.compress(data),
        }
    }

    pub fn decode(&self, expected_len: usize) -> Result<Vec<u8>, CompressError> {
        TileCompressor::for_version(self.version).decompress(&self.payload, expected_len)
    }

    pub fn encoded_len(&self) -> usize {
        TILE_RECORD_HEADER_BYTES + self.payload.len()
    }
}

pub fn write_tile_record<W: Write>(writer: &mut W, record: &TileRecord) -> io::Result<()> {
    let payload_len = i32::try_from(record.payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "tile payload too large"))?;
    writer.write_all(&record.coord.col.to_le_bytes())?;
    writer.write_all(&record.coord.row.to_le_bytes())?;
    writer.write_all(&record.version.to_le_bytes())?;
    writer.write_all(&payload_len.to_le_bytes())?;
    writer.write_all(&record.payload)
}

pub fn read_tile_record<R: Read>(reader: &mut R) -> io::Result<TileRecord> {
    let col = read_i32(reader)?;
    let row = read_i32(reader)?;
    let version = read_i32(reader)?;
    let payload_len = read_i32(reader)?;
    let payload_len = usize::try_from(payload_len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("negative tile payload length {payload_len}"),
        )
    })?;
    let mut payload = vec![0; payload_len];
    reader.read_exact(&mut payload)?;
    Ok(TileRecord {
        coord: TileCoord::new(col, row),
        version,
        payload,
    })
}

fn read_i32<R: Read>(reader: &mut R) -> io::Result<i32> {
    let mut bytes = [0; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index % 251) as u8).collect()
    }

    #[test]
    fn deflate_shrinks_uniform_tiles() {
        let data = vec![7u8; 64 * 64 * 4];
        let payload = TileCompressor::Deflate.compress(&data);
        assert_eq!(payload[0], PAYLOAD_DEFLATE);
        assert!(payload.len() < data.len() / 10);
        let restored = TileCompressor::Deflate
            .decompress(&payload, data.len())
            .expect("inflate uniform tile");
        assert_eq!(restored, data);
    }

    #[test]
    fn deflate_falls_back_to_raw_for_incompressible_data() {
        let mut state = 0x2545_f491_u32;
        let data = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect::<Vec<_>>();
        let payload = TileCompressor::Deflate.compress(&data);
        assert!(payload.len() <= data.len() + 1);
        let restored = TileCompressor::Deflate
            .decompress(&payload, data.len())
            .expect("decode payload");
        assert_eq!(restored, data);
    }

    #[test]
    fn decompress_rejects_wrong_length() {
        let data = gradient(128);
        let payload = TileCompressor::Legacy.compress(&data);
        let error = TileCompressor::Legacy
            .decompress(&payload, 64)
            .expect_err("length mismatch must fail");
        assert!(matches!(
            error,
            CompressError::LengthMismatch {
                expected: 64,
                actual: 128
            }
        ));
    }

    #[test]
    fn record_carries_its_own_version() {
        let data = gradient(256);
        let record = TileRecord::encode(TileCoord::new(-3, 9), TileCompressor::Legacy, &data);
        let mut bytes = Vec::new();
        write_tile_record(&mut bytes, &record).expect("write record");
        assert_eq!(bytes.len(), record.encoded_len());

        let parsed = read_tile_record(&mut bytes.as_slice()).expect("read record");
        assert_eq!(parsed.coord, TileCoord::new(-3, 9));
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.decode(data.len()).expect("decode record"), data);
    }

    #[test]
    #[should_panic(expected = "unknown tile compressor version 7")]
    fn unknown_version_aborts() {
        let _ = TileCompressor::for_version(7);
    }
}
