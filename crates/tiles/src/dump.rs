use std::io::{self, BufRead, Write};

use model::TILE_SIZE;

use crate::compressor::{
    CompressError, TileCompressor, TileRecord, read_tile_record, write_tile_record,
};
use crate::data_manager::{TileMap, TiledDataManager};
use crate::tile::tile_byte_len;

pub const DUMP_VERSION: i64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("dump i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed dump header line {line:?}, expected {expected}")]
    MalformedHeader { line: String, expected: &'static str },
    #[error("unsupported dump version {0}")]
    UnsupportedVersion(i64),
    #[error("dump tiles are {width}x{height} pixels")]
    TileSizeMismatch { width: i64, height: i64 },
    #[error("dump pixel size {found} does not match device pixel size {expected}")]
    PixelSizeMismatch { expected: usize, found: i64 },
    #[error("tile ({col}, {row}) in dump lies outside the addressable range")]
    TileOutOfRange { col: i32, row: i32 },
    #[error("tile ({col}, {row}) in dump is corrupt: {source}")]
    CorruptTile {
        col: i32,
        row: i32,
        #[source]
        source: CompressError,
    },
}

impl TiledDataManager {
    /// Writes the header and every tile, in row-major order, to `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), DumpError> {
        let snapshot = self.snapshot();
        let coords = snapshot.map.sorted_coords();
        write!(
            writer,
            "VERSION {DUMP_VERSION}\nTILEWIDTH {TILE_SIZE}\nTILEHEIGHT {TILE_SIZE}\nPIXELSIZE {}\nDATA {}\n",
            self.pixel_size(),
            coords.len()
        )?;
        for coord in coords {
            let Some(tile) = snapshot.map.get(coord) else {
                panic!("snapshot lost tile ({}, {})", coord.col, coord.row);
            };
            let record = {
                let pixels = tile.read();
                TileRecord::encode(coord, TileCompressor::CURRENT, &pixels)
            };
            write_tile_record(writer, &record)?;
        }
        Ok(())
    }

    /// Replaces the device content with a dump written by
    /// [`TiledDataManager::write_to`] or by the legacy writer, whose header
    /// is a bare tile count.
    pub fn read_from<R: BufRead>(&self, reader: &mut R) -> Result<(), DumpError> {
        let first_line = read_header_line(reader)?;
        let tile_count = match first_line.strip_prefix("VERSION ") {
            Some(version) => {
                let version = parse_number(version, &first_line, "a dump version")?;
                if version != DUMP_VERSION {
                    return Err(DumpError::UnsupportedVersion(version));
                }
                self.read_versioned_header(reader)?
            }
            None => parse_number(&first_line, &first_line, "a tile count")?,
        };
        let tile_count = usize::try_from(tile_count).map_err(|_| DumpError::MalformedHeader {
            line: tile_count.to_string(),
            expected: "a non-negative tile count",
        })?;

        let byte_len = tile_byte_len(self.pixel_size());
        let mut map = TileMap::new(self.default_pixel());
        for _ in 0..tile_count {
            let record = read_tile_record(reader)?;
            if !record.coord.is_addressable() {
                return Err(DumpError::TileOutOfRange {
                    col: record.coord.col,
                    row: record.coord.row,
                });
            }
            let bytes = record
                .decode(byte_len)
                .map_err(|source| DumpError::CorruptTile {
                    col: record.coord.col,
                    row: record.coord.row,
                    source,
                })?;
            let tile = self.new_tile_from_bytes(&map, record.coord, &bytes);
            map.insert(record.coord, tile);
        }
        tracing::debug!(tiles = map.len(), "read tiled data dump");
        let replaced = self.replace_map(map);
        drop(replaced);
        Ok(())
    }

    fn read_versioned_header<R: BufRead>(&self, reader: &mut R) -> Result<i64, DumpError> {
        let width = read_field(reader, "TILEWIDTH")?;
        let height = read_field(reader, "TILEHEIGHT")?;
        if width != i64::from(TILE_SIZE) || height != i64::from(TILE_SIZE) {
            return Err(DumpError::TileSizeMismatch { width, height });
        }
        let pixel_size = read_field(reader, "PIXELSIZE")?;
        if usize::try_from(pixel_size).ok() != Some(self.pixel_size()) {
            return Err(DumpError::PixelSizeMismatch {
                expected: self.pixel_size(),
                found: pixel_size,
            });
        }
        read_field(reader, "DATA")
    }
}

fn read_header_line<R: BufRead>(reader: &mut R) -> Result<String, DumpError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(line.trim_end().to_owned())
}

fn read_field<R: BufRead>(reader: &mut R, name: &'static str) -> Result<i64, DumpError> {
    let line = read_header_line(reader)?;
    let value = line
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or_else(|| DumpError::MalformedHeader {
            line: line.clone(),
            expected: name,
        })?;
    parse_number(value, &line, name)
}

fn parse_number(value: &str, line: &str, expected: &'static str) -> Result<i64, DumpError> {
    value
        .trim()
        .parse()
        .map_err(|_| DumpError::MalformedHeader {
            line: line.to_owned(),
            expected,
        })
}
