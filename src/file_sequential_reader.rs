use crate::error::{Error, Result};
use crate::feature_generated::*;
use crate::file_reader::reader_state::*;
use crate::file_reader::read_header_buf;
use crate::header_generated::*;
use crate::packed_r_tree::PackedRTree;
use crate::properties_reader::FgbFeature;
use fallible_streaming_iterator::FallibleStreamingIterator;
use geozero::{FeatureAccess, FeatureProcessor, GeozeroDatasource};
use std::io::{ErrorKind, Read};
use std::marker::PhantomData;

/// FlatGeobuf sequential dataset reader
pub struct FgbSequentialReader<'a, R: Read, State = Initial> {
    reader: &'a mut R,
    /// FlatBuffers verification
    verify: bool,
    // feature reading requires header access, therefore
    // header_buf is included in the FgbFeature struct.
    fbs: FgbFeature,
    /// Number of selected features (None for undefined feature count)
    count: Option<usize>,
    /// Ascending offsets of selected features or None if no bbox filter
    offsets: Option<Vec<usize>>,
    /// Number of features read
    feat_no: usize,
    /// File offset within feature section
    cur_pos: usize,
    /// All features read or end of file reached
    finished: bool,
    /// Reader state
    state: PhantomData<State>,
}

impl<'a, R: Read> FgbSequentialReader<'a, R, Initial> {
    /// Open dataset by reading the header information
    pub fn open(reader: &'a mut R) -> Result<FgbSequentialReader<'a, R, Open>> {
        Self::read_header(reader, true)
    }
    /// Open dataset by reading the header information without FlatBuffers verification
    ///
    /// # Safety
    /// Reading features of a corrupt dataset is undefined behaviour.
    pub unsafe fn open_unchecked(reader: &'a mut R) -> Result<FgbSequentialReader<'a, R, Open>> {
        Self::read_header(reader, false)
    }
    fn read_header(reader: &'a mut R, verify: bool) -> Result<FgbSequentialReader<'a, R, Open>> {
        let header_buf = read_header_buf(reader, verify)?;
        Ok(FgbSequentialReader {
            reader,
            verify,
            fbs: FgbFeature {
                header_buf,
                feature_buf: Vec::new(),
            },
            count: None,
            offsets: None,
            feat_no: 0,
            cur_pos: 0,
            finished: false,
            state: PhantomData::<Open>,
        })
    }
}

impl<'a, R: Read> FgbSequentialReader<'a, R, Open> {
    /// Header information
    pub fn header(&self) -> Header {
        self.fbs.header()
    }

    fn index_size(&self) -> Result<usize> {
        let header = self.fbs.header();
        let feat_count = header.features_count() as usize;
        if header.index_node_size() > 0 && feat_count > 0 {
            PackedRTree::index_size(feat_count, header.index_node_size())
        } else {
            Ok(0)
        }
    }

    fn into_selected(
        self,
        count: Option<usize>,
        offsets: Option<Vec<usize>>,
    ) -> FgbSequentialReader<'a, R, FeaturesSelected> {
        FgbSequentialReader {
            reader: self.reader,
            verify: self.verify,
            fbs: self.fbs,
            finished: count == Some(0),
            count,
            offsets,
            feat_no: 0,
            cur_pos: 0,
            state: PhantomData::<FeaturesSelected>,
        }
    }

    /// Select all features.
    pub fn select_all(self) -> Result<FgbSequentialReader<'a, R, FeaturesSelected>> {
        let index_size = self.index_size()?;
        std::io::copy(
            &mut self.reader.by_ref().take(index_size as u64),
            &mut std::io::sink(),
        )?;
        // A feature count of 0 is written by streaming writers not knowing the count
        let count = match self.fbs.header().features_count() as usize {
            0 => None,
            n => Some(n),
        };
        Ok(self.into_selected(count, None))
    }

    /// Select features within a bounding box.
    ///
    /// The index is read into memory, features outside of the box are skipped while reading.
    pub fn select_bbox(
        self,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    ) -> Result<FgbSequentialReader<'a, R, FeaturesSelected>> {
        let header = self.fbs.header();
        let index_node_size = header.index_node_size();
        let features_count = header.features_count() as usize;
        if index_node_size == 0 {
            return Err(Error::NoIndex);
        }
        if features_count == 0 {
            return self.select_all();
        }
        let tree = PackedRTree::from_buf(&mut *self.reader, features_count, index_node_size)?;
        let mut offsets: Vec<usize> = tree
            .search(min_x, min_y, max_x, max_y)?
            .into_iter()
            .map(|item| item.offset)
            .collect();
        offsets.sort_unstable();
        debug!("{} of {features_count} features in bbox", offsets.len());
        Ok(self.into_selected(Some(offsets.len()), Some(offsets)))
    }
}

impl<R: Read> FgbSequentialReader<'_, R, FeaturesSelected> {
    /// Header information
    pub fn header(&self) -> Header {
        self.fbs.header()
    }
    /// Number of selected features (might be unknown)
    pub fn features_count(&self) -> Option<usize> {
        self.count
    }
    /// Return current feature
    pub fn cur_feature(&self) -> &FgbFeature {
        &self.fbs
    }
    /// Read and process all selected features
    pub fn process_features<W: FeatureProcessor>(&mut self, out: &mut W) -> Result<()> {
        out.dataset_begin(self.fbs.header().name())?;
        let mut cnt = 0;
        while let Some(feature) = self.next()? {
            feature.process(out, cnt)?;
            cnt += 1;
        }
        out.dataset_end()?;
        Ok(())
    }

    /// Read the size prefix of the next record, `None` at end of file
    fn read_size(&mut self) -> Result<Option<usize>> {
        self.fbs.feature_buf.resize(4, 0);
        match self.reader.read_exact(&mut self.fbs.feature_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let sbuf = &self.fbs.feature_buf;
        Ok(Some(
            u32::from_le_bytes([sbuf[0], sbuf[1], sbuf[2], sbuf[3]]) as usize,
        ))
    }

    /// Offset of the next selected record, `None` without filter
    fn next_selected(&self) -> Option<usize> {
        self.offsets
            .as_ref()
            .and_then(|offsets| offsets.get(self.feat_no).copied())
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
/// # let mut fgb = FgbSequentialReader::open(&mut filein)?.select_all()?;
/// while let Some(feature) = fgb.next()? {
///     let props = feature.properties()?;
///     println!("{props:?}");
/// }
/// # Ok(())
/// # }
/// ```
impl<R: Read> FallibleStreamingIterator for FgbSequentialReader<'_, R, FeaturesSelected> {
    type Error = Error;
    type Item = FgbFeature;

    fn advance(&mut self) -> Result<()> {
        loop {
            if self.finished {
                return Ok(());
            }
            if self.count.is_some_and(|count| self.feat_no >= count) {
                self.finished = true;
                return Ok(());
            }
            let Some(feature_size) = self.read_size()? else {
                self.finished = true;
                return Ok(());
            };
            let record_pos = self.cur_pos;
            self.cur_pos += feature_size + 4;
            match self.next_selected() {
                Some(wanted) if wanted > record_pos => {
                    // skip record outside of bbox
                    std::io::copy(
                        &mut self.reader.by_ref().take(feature_size as u64),
                        &mut std::io::sink(),
                    )?;
                    continue;
                }
                Some(wanted) if wanted < record_pos => {
                    return Err(Error::CorruptData(format!(
                        "index offset {wanted} is not at a feature boundary"
                    )));
                }
                _ => {}
            }
            self.fbs.feature_buf.resize(feature_size + 4, 0);
            self.reader.read_exact(&mut self.fbs.feature_buf[4..])?;
            if self.verify {
                let _feature = size_prefixed_root_as_feature(&self.fbs.feature_buf)?;
            }
            self.feat_no += 1;
            return Ok(());
        }
    }

    fn get(&self) -> Option<&FgbFeature> {
        if self.finished {
            None
        } else {
            Some(&self.fbs)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.count {
            Some(count) => {
                let remaining = count.saturating_sub(self.feat_no);
                (remaining, Some(remaining))
            }
            None => (0, None),
        }
    }
}

impl<T: Read> GeozeroDatasource for FgbSequentialReader<'_, T, FeaturesSelected> {
    /// Consume and process all selected features.
    fn process<P: FeatureProcessor>(&mut self, processor: &mut P) -> geozero::error::Result<()> {
        self.process_features(processor).map_err(Into::into)
    }
}
