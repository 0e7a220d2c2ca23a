//! [FlatGeobuf](https://flatgeobuf.org/) is a performant binary encoding
//! for geographic data based on [flatbuffers](http://google.github.io/flatbuffers/) that
//! can hold a collection of [Simple Features](https://en.wikipedia.org/wiki/Simple_Features)
//! including circular interpolations as defined by SQL-MM Part 3.
//!
//! This crate implements the packed Hilbert R-Tree index together with the feature codec
//! and readers/writers for seekable files, forward-only streams and ranged byte stores.
//!
//! ## Writing a dataset
//!
//! ```rust
//! use flatgeobuf_core::*;
//! use flatgeobuf_core::geometry::{Coord, Geometry};
//!
//! # fn write() -> flatgeobuf_core::Result<Vec<u8>> {
//! let mut fgb = FgbWriter::create("places", GeometryType::Point)?;
//! fgb.add_column("name", ColumnType::String, |_, _| {});
//! fgb.add_feature(
//!     Some(&Geometry::Point(Coord::xy(8.55, 47.37))),
//!     &[("name", Some(ColumnValue::String("Zürich".to_string())))],
//! )?;
//! let mut out = Vec::new();
//! fgb.write(&mut out)?;
//! # Ok(out)
//! # }
//! ```
//!
//! ## Reading a dataset
//!
//! ```rust
//! use flatgeobuf_core::*;
//! # use std::fs::File;
//! # use std::io::BufReader;
//!
//! # fn read_fgb() -> flatgeobuf_core::Result<()> {
//! let mut filein = BufReader::new(File::open("countries.fgb")?);
//! let mut fgb = FgbReader::open(&mut filein)?.select_bbox(8.8, 47.2, 9.5, 55.3)?;
//! while let Some(feature) = fgb.next()? {
//!     println!("{:?}", feature.property("name")?);
//!     println!("{:?}", feature.geometry()?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Reading over HTTP
//!
//! With the `http` feature, [HttpFgbReader] reads through [HttpRangeSource], issuing
//! range requests for the index levels and features in the selected bbox only.

#![allow(clippy::manual_range_contains)]
#![allow(clippy::too_many_arguments)]

#[macro_use]
extern crate log;

mod async_reader;
mod error;
#[allow(dead_code, unused_imports, non_snake_case, non_camel_case_types)]
mod feature_generated;
mod feature_writer;
mod file_reader;
mod file_sequential_reader;
mod file_writer;
pub mod geometry;
mod geometry_reader;
mod geozero_api;
#[allow(dead_code, unused_imports, non_snake_case, non_camel_case_types)]
mod header_generated;
#[cfg(feature = "http")]
mod http_reader;
pub mod packed_r_tree;
mod properties_reader;

pub use async_reader::*;
pub use error::{Error, ErrorKind, Result};
pub use feature_generated::*;
pub use feature_writer::{encode_properties, FeatureWriter};
pub use file_reader::*;
pub use file_sequential_reader::*;
pub use file_writer::*;
pub use geometry_reader::{is_collection, read_flat_geometry, read_geometry};
pub use geozero_api::GeometryCollector;
pub use header_generated::*;
#[cfg(feature = "http")]
pub use http_reader::*;
pub use packed_r_tree::{NodeItem, PackedRTree, RangeRead, SearchOptions, StreamSearchItem};
pub use properties_reader::{decode_properties, ColumnValue, FgbFeature};

// Re-export used traits
pub use fallible_streaming_iterator::FallibleStreamingIterator;
pub use geozero;

pub const VERSION: u8 = 3;
pub const MAGIC_BYTES: [u8; 8] = [b'f', b'g', b'b', VERSION, b'f', b'g', b'b', 0];
pub const HEADER_MAX_BUFFER_SIZE: usize = 1048576 * 10;

/// Check magic bytes, accepting all versions up to the current one
pub fn check_magic_bytes(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC_BYTES.len()
        && bytes[0..3] == MAGIC_BYTES[0..3]
        && bytes[3] <= VERSION
        && bytes[4..8] == MAGIC_BYTES[4..8]
}

/// Validated header size from the little-endian size prefix
pub(crate) fn header_size(size_buf: [u8; 4]) -> Result<usize> {
    let header_size = u32::from_le_bytes(size_buf) as usize;
    if header_size > HEADER_MAX_BUFFER_SIZE || header_size < 8 {
        // minimum size check avoids panic in FlatBuffers header decoding
        return Err(Error::IllegalHeaderSize(header_size));
    }
    Ok(header_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes() {
        assert!(check_magic_bytes(&MAGIC_BYTES));
        assert!(check_magic_bytes(b"fgb\x00fgb\x00"));
        assert!(check_magic_bytes(b"fgb\x03fgb\x00trailing"));
        assert!(!check_magic_bytes(b"fgb\x04fgb\x00"));
        assert!(!check_magic_bytes(b"fgx\x03fgb\x00"));
        assert!(!check_magic_bytes(b"fgb\x03fgb"));
    }

    #[test]
    fn header_size_bounds() {
        assert!(matches!(
            header_size(4u32.to_le_bytes()),
            Err(Error::IllegalHeaderSize(4))
        ));
        assert!(header_size(8u32.to_le_bytes()).is_ok());
        assert!(header_size((HEADER_MAX_BUFFER_SIZE as u32).to_le_bytes()).is_ok());
        assert!(header_size((HEADER_MAX_BUFFER_SIZE as u32 + 1).to_le_bytes()).is_err());
    }

    #[test]
    /// Verify size of feature/geometry with point
    fn point() {
        let mut fbb1 = flatbuffers::FlatBufferBuilder::new();
        let g1 = Geometry::create(&mut fbb1, &GeometryArgs::default());
        fbb1.finish(g1, None);
        let buf = fbb1.finished_data();
        assert_eq!(buf.len(), 12);
    }
}
