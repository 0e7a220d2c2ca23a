use crate::error::{Error, Result};
use crate::feature_generated::*;
use crate::file_reader::reader_state::*;
use crate::header_generated::*;
use crate::packed_r_tree::PackedRTree;
use crate::properties_reader::FgbFeature;
use crate::{check_magic_bytes, header_size};
use fallible_streaming_iterator::FallibleStreamingIterator;
use geozero::{FeatureAccess, FeatureProcessor, GeozeroDatasource};
use std::io::{Read, Seek, SeekFrom};
use std::marker::PhantomData;

/// FlatGeobuf dataset reader
pub struct FgbReader<'a, R: Read + Seek, State = Initial> {
    reader: &'a mut R,
    /// FlatBuffers verification
    verify: bool,
    // feature reading requires header access, therefore
    // header_buf is included in the FgbFeature struct.
    fbs: FgbFeature,
    /// File offset of feature section base
    feature_base: u64,
    selection: Selection,
    /// Number of selected features
    count: usize,
    /// Features read so far
    read: usize,
    /// Set by advancing past the last feature
    exhausted: bool,
    state: PhantomData<State>,
}

/// Features to visit
enum Selection {
    /// Every record in file order
    Sequential,
    /// Record offsets of index hits, relative to the feature section
    Offsets(Vec<u64>),
}

// Reader states for ensuring correct read API usage at compile-time
pub(crate) mod reader_state {
    pub struct Initial;
    pub struct Open;
    pub struct FeaturesSelected;
}

/// Read magic bytes and the size-prefixed header
pub(crate) fn read_header_buf(reader: &mut impl Read, verify: bool) -> Result<Vec<u8>> {
    let mut magic_buf: [u8; 8] = [0; 8];
    reader.read_exact(&mut magic_buf)?;
    if !check_magic_bytes(&magic_buf) {
        return Err(Error::MissingMagicBytes);
    }

    let mut size_buf: [u8; 4] = [0; 4];
    reader.read_exact(&mut size_buf)?;
    let header_size = header_size(size_buf)?;
    let mut header_buf = Vec::with_capacity(header_size + 4);
    header_buf.extend_from_slice(&size_buf);
    header_buf.resize(header_buf.capacity(), 0);
    reader.read_exact(&mut header_buf[4..])?;

    if verify {
        let _header = size_prefixed_root_as_header(&header_buf)?;
    }
    Ok(header_buf)
}

/// Read a size-prefixed feature record into `buf`
pub(crate) fn read_feature_buf(
    reader: &mut impl Read,
    buf: &mut Vec<u8>,
    verify: bool,
) -> Result<()> {
    buf.resize(4, 0);
    reader.read_exact(buf)?;
    let feature_size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    buf.resize(feature_size + 4, 0);
    reader.read_exact(&mut buf[4..])?;
    if verify {
        let _feature = size_prefixed_root_as_feature(buf)?;
    }
    Ok(())
}

impl<'a, R: Read + Seek> FgbReader<'a, R, Initial> {
    /// Open dataset by reading the header information
    pub fn open(reader: &'a mut R) -> Result<FgbReader<'a, R, Open>> {
        Self::read_header(reader, true)
    }
    /// Open dataset by reading the header information without FlatBuffers verification
    ///
    /// # Safety
    /// Reading features of a corrupt dataset is undefined behaviour.
    pub unsafe fn open_unchecked(reader: &'a mut R) -> Result<FgbReader<'a, R, Open>> {
        Self::read_header(reader, false)
    }
    fn read_header(reader: &'a mut R, verify: bool) -> Result<FgbReader<'a, R, Open>> {
        let header_buf = read_header_buf(reader, verify)?;
        Ok(FgbReader {
            reader,
            verify,
            fbs: FgbFeature {
                header_buf,
                feature_buf: Vec::new(),
            },
            feature_base: 0,
            selection: Selection::Sequential,
            count: 0,
            read: 0,
            exhausted: false,
            state: PhantomData,
        })
    }
}

impl<'a, R: Read + Seek> FgbReader<'a, R, Open> {
    /// Header information
    pub fn header(&self) -> Header {
        self.fbs.header()
    }

    fn into_selected(
        self,
        feature_base: u64,
        selection: Selection,
        count: usize,
    ) -> FgbReader<'a, R, FeaturesSelected> {
        FgbReader {
            reader: self.reader,
            verify: self.verify,
            fbs: self.fbs,
            feature_base,
            selection,
            count,
            read: 0,
            exhausted: false,
            state: PhantomData,
        }
    }

    /// Select all features in file order.
    pub fn select_all(self) -> Result<FgbReader<'a, R, FeaturesSelected>> {
        let header = self.fbs.header();
        let count = header.features_count() as usize;
        let index_size = match header.index_node_size() {
            0 => 0,
            _ if count == 0 => 0,
            node_size => PackedRTree::index_size(count, node_size)?,
        };
        let feature_base = self.reader.seek(SeekFrom::Current(index_size as i64))?;
        Ok(self.into_selected(feature_base, Selection::Sequential, count))
    }

    /// Select features within a bounding box, in index search order.
    pub fn select_bbox(
        self,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    ) -> Result<FgbReader<'a, R, FeaturesSelected>> {
        let header = self.fbs.header();
        let index_node_size = header.index_node_size();
        let features_count = header.features_count() as usize;
        if index_node_size == 0 {
            return Err(Error::NoIndex);
        }
        if features_count == 0 {
            // no index is stored for an empty dataset
            let feature_base = self.reader.stream_position()?;
            return Ok(self.into_selected(feature_base, Selection::Offsets(Vec::new()), 0));
        }
        let hits = PackedRTree::stream_search(
            self.reader,
            features_count,
            index_node_size,
            min_x,
            min_y,
            max_x,
            max_y,
        )?;
        let feature_base = self.reader.stream_position()?;
        debug!("{} of {features_count} features in bbox", hits.len());
        let offsets: Vec<u64> = hits.iter().map(|hit| hit.offset as u64).collect();
        let count = offsets.len();
        Ok(self.into_selected(feature_base, Selection::Offsets(offsets), count))
    }
}

impl<R: Read + Seek> FgbReader<'_, R, FeaturesSelected> {
    /// Header information
    pub fn header(&self) -> Header {
        self.fbs.header()
    }
    /// Number of selected features
    pub fn features_count(&self) -> usize {
        self.count
    }
    /// Return current feature
    pub fn cur_feature(&self) -> &FgbFeature {
        &self.fbs
    }
    /// Read and process all selected features
    pub fn process_features<W: FeatureProcessor>(&mut self, out: &mut W) -> Result<()> {
        out.dataset_begin(self.fbs.header().name())?;
        let mut idx = 0;
        while let Some(feature) = self.next()? {
            feature.process(out, idx)?;
            idx += 1;
        }
        out.dataset_end()?;
        Ok(())
    }
}

/// `FallibleStreamingIterator` differs from the standard library's `Iterator`
/// in two ways:
/// * each call to `next` can fail.
/// * returned `FgbFeature` is valid until `next` is called again or `FgbReader` is
///   reset or finalized.
///
/// While these iterators cannot be used with Rust `for` loops, `while let`
/// loops offer a similar level of ergonomics:
/// ```rust
/// use flatgeobuf_core::*;
/// # use std::fs::File;
/// # use std::io::BufReader;
///
/// # fn read_fbg() -> flatgeobuf_core::Result<()> {
/// # let mut filein = BufReader::new(File::open("countries.fgb")?);
/// # let mut fgb = FgbReader::open(&mut filein)?.select_all()?;
/// while let Some(feature) = fgb.next()? {
///     let name = feature.property("name")?;
///     println!("{name:?}");
/// }
/// # Ok(())
/// # }
/// ```
impl<R: Read + Seek> FallibleStreamingIterator for FgbReader<'_, R, FeaturesSelected> {
    type Error = Error;
    type Item = FgbFeature;

    fn advance(&mut self) -> Result<()> {
        if self.read == self.count {
            self.exhausted = true;
            return Ok(());
        }
        if let Selection::Offsets(offsets) = &self.selection {
            let pos = self.feature_base + offsets[self.read];
            self.reader.seek(SeekFrom::Start(pos))?;
        }
        self.read += 1;
        read_feature_buf(self.reader, &mut self.fbs.feature_buf, self.verify)
    }

    fn get(&self) -> Option<&FgbFeature> {
        (self.read > 0 && !self.exhausted).then_some(&self.fbs)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.read;
        (remaining, Some(remaining))
    }
}

impl<T: Read + Seek> GeozeroDatasource for FgbReader<'_, T, FeaturesSelected> {
    /// Consume and process all selected features.
    fn process<P: FeatureProcessor>(&mut self, processor: &mut P) -> geozero::error::Result<()> {
        self.process_features(processor).map_err(Into::into)
    }
}
