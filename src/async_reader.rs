use crate::error::{Error, Result};
use crate::feature_generated::*;
use crate::header_generated::*;
use crate::packed_r_tree::{IndexSearch, PackedRTree, RangeRead, SearchOptions};
use crate::properties_reader::FgbFeature;
use crate::{check_magic_bytes, header_size};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use geozero::{FeatureAccess, FeatureProcessor};

/// Bytes fetched together with the size prefix of a feature.
/// Larger features take a second request.
pub const FEATURE_PREFETCH_SIZE: usize = 512;

/// FlatGeobuf dataset reader over a [RangeRead] byte store
pub struct AsyncFgbReader<'r, R: RangeRead + ?Sized> {
    source: &'r mut R,
    /// FlatBuffers verification
    verify: bool,
    // feature reading requires header access, therefore
    // header_buf is included in the FgbFeature struct.
    fbs: FgbFeature,
}

/// Features selected by [AsyncFgbReader::select_all] or [AsyncFgbReader::select_bbox]
pub struct AsyncFeatureIter<'r, R: RangeRead + ?Sized> {
    /// FlatBuffers verification
    verify: bool,
    fbs: FgbFeature,
    selection: FeatureSelection<'r, R>,
    /// Number of selected features, unknown for bbox selections
    count: Option<usize>,
}

enum FeatureSelection<'r, R: RangeRead + ?Sized> {
    All {
        source: &'r mut R,
        /// Byte position of next feature
        pos: usize,
        features_left: usize,
    },
    Bbox {
        search: IndexSearch<'r, R>,
        feature_base: usize,
    },
}

/// Read `length` bytes, failing on short reads
async fn read_exact<R: RangeRead + ?Sized>(
    source: &mut R,
    begin: usize,
    length: usize,
) -> Result<Bytes> {
    let bytes = source.read_range(begin, length).await?;
    if bytes.len() < length {
        return Err(Error::CorruptData(format!(
            "expected {length} bytes at {begin}, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Fetch the size-prefixed record at `begin`.
///
/// `max_len` is the distance to the next known record, an upper bound of the record size.
async fn read_feature<R: RangeRead + ?Sized>(
    source: &mut R,
    begin: usize,
    max_len: Option<usize>,
) -> Result<Bytes> {
    let first_len = max_len
        .map_or(FEATURE_PREFETCH_SIZE, |len| len.min(FEATURE_PREFETCH_SIZE))
        .max(4);
    let first = source.read_range(begin, first_len).await?;
    if first.len() < 4 {
        return Err(Error::CorruptData(format!(
            "truncated feature size at {begin}"
        )));
    }
    let feature_len = LittleEndian::read_u32(&first) as usize + 4;
    if first.len() >= feature_len {
        return Ok(first.slice(..feature_len));
    }
    trace!(
        "feature at {begin} has {feature_len} bytes, fetched {} bytes",
        first.len()
    );
    let missing = feature_len - first.len();
    let rest = read_exact(source, begin + first.len(), missing).await?;
    let mut buf = BytesMut::with_capacity(feature_len);
    buf.put(first);
    buf.put(rest.slice(..missing));
    Ok(buf.freeze())
}

impl<'r, R: RangeRead + ?Sized> AsyncFgbReader<'r, R> {
    /// Open dataset by reading the header information
    pub async fn open(source: &'r mut R) -> Result<AsyncFgbReader<'r, R>> {
        Self::read_header(source, true).await
    }

    /// Open dataset by reading the header information without FlatBuffers verification
    ///
    /// # Safety
    /// Reading features of a corrupt dataset is undefined behaviour.
    pub async unsafe fn open_unchecked(source: &'r mut R) -> Result<AsyncFgbReader<'r, R>> {
        Self::read_header(source, false).await
    }

    async fn read_header(source: &'r mut R, verify: bool) -> Result<AsyncFgbReader<'r, R>> {
        trace!("starting: opening async reader, reading header");
        let bytes = source.read_range(0, 12).await?;
        if !check_magic_bytes(&bytes) {
            return Err(Error::MissingMagicBytes);
        }
        if bytes.len() < 12 {
            return Err(Error::CorruptData("truncated header size".to_string()));
        }
        let header_size = header_size([bytes[8], bytes[9], bytes[10], bytes[11]])?;
        let mut header_buf = Vec::with_capacity(header_size + 4);
        header_buf.extend_from_slice(&bytes[8..12]);
        header_buf.extend_from_slice(&read_exact(source, 12, header_size).await?);
        if verify {
            let _header = size_prefixed_root_as_header(&header_buf)?;
        }
        trace!("completed: opening async reader");
        Ok(AsyncFgbReader {
            source,
            verify,
            fbs: FgbFeature {
                header_buf,
                feature_buf: Vec::new(),
            },
        })
    }

    /// Header information
    pub fn header(&self) -> Header {
        self.fbs.header()
    }

    fn header_len(&self) -> usize {
        8 + self.fbs.header_buf.len()
    }

    /// Select all features.
    pub async fn select_all(self) -> Result<AsyncFeatureIter<'r, R>> {
        let header = self.fbs.header();
        let count = header.features_count() as usize;
        let index_size = if header.index_node_size() > 0 && count > 0 {
            PackedRTree::index_size(count, header.index_node_size())?
        } else {
            0
        };
        // Skip index
        let pos = self.header_len() + index_size;
        Ok(AsyncFeatureIter {
            verify: self.verify,
            fbs: self.fbs,
            selection: FeatureSelection::All {
                source: self.source,
                pos,
                features_left: count,
            },
            count: Some(count),
        })
    }

    /// Select features within a bounding box.
    ///
    /// Index nodes are fetched while iterating, features are returned as soon as their
    /// leaf is found.
    pub async fn select_bbox(
        self,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
        options: SearchOptions,
    ) -> Result<AsyncFeatureIter<'r, R>> {
        let header = self.fbs.header();
        let index_node_size = header.index_node_size();
        let count = header.features_count() as usize;
        if index_node_size == 0 {
            return Err(Error::NoIndex);
        }
        let index_begin = self.header_len();
        let feature_base = if count > 0 {
            index_begin + PackedRTree::index_size(count, index_node_size)?
        } else {
            index_begin
        };
        let search = PackedRTree::stream_search_async(
            self.source,
            index_begin,
            count,
            index_node_size,
            min_x,
            min_y,
            max_x,
            max_y,
            options,
        )?;
        Ok(AsyncFeatureIter {
            verify: self.verify,
            fbs: self.fbs,
            selection: FeatureSelection::Bbox {
                search,
                feature_base,
            },
            count: None,
        })
    }
}

impl<R: RangeRead + ?Sized> FeatureSelection<'_, R> {
    async fn next_feature_buffer(&mut self) -> Result<Option<Bytes>> {
        match self {
            FeatureSelection::All {
                source,
                pos,
                features_left,
            } => {
                if *features_left == 0 {
                    return Ok(None);
                }
                let buf = read_feature(&mut **source, *pos, None).await?;
                *features_left -= 1;
                *pos += buf.len();
                Ok(Some(buf))
            }
            FeatureSelection::Bbox {
                search,
                feature_base,
            } => {
                let Some(item) = search.next().await? else {
                    return Ok(None);
                };
                let begin = *feature_base + item.offset;
                let buf = read_feature(search.source_mut(), begin, item.length).await?;
                Ok(Some(buf))
            }
        }
    }
}

impl<R: RangeRead + ?Sized> AsyncFeatureIter<'_, R> {
    pub fn header(&self) -> Header {
        self.fbs.header()
    }
    /// Number of selected features (unknown for bbox selections)
    pub fn features_count(&self) -> Option<usize> {
        self.count
    }
    /// Read next feature
    pub async fn next(&mut self) -> Result<Option<&FgbFeature>> {
        let Some(buffer) = self.selection.next_feature_buffer().await? else {
            return Ok(None);
        };
        // Not zero-copy
        self.fbs.feature_buf = buffer.to_vec();
        if self.verify {
            let _feature = size_prefixed_root_as_feature(&self.fbs.feature_buf)?;
        }
        Ok(Some(&self.fbs))
    }
    /// Return current feature
    pub fn cur_feature(&self) -> &FgbFeature {
        &self.fbs
    }
    /// Read and process all selected features
    pub async fn process_features<W: FeatureProcessor>(&mut self, out: &mut W) -> Result<()> {
        out.dataset_begin(self.fbs.header().name())?;
        let mut cnt = 0;
        while let Some(feature) = self.next().await? {
            feature.process(out, cnt)?;
            cnt += 1;
        }
        out.dataset_end()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::geometry::{Coord, Geometry};
    use crate::{ColumnValue, FgbWriter, FgbWriterOptions};
    use async_trait::async_trait;

    fn grid_dataset(n: usize, write_index: bool) -> Result<Bytes> {
        let mut fgb = FgbWriter::create_with_options(
            "grid",
            GeometryType::Point,
            FgbWriterOptions {
                write_index,
                ..Default::default()
            },
        )?;
        fgb.add_column("id", ColumnType::ULong, |_, _| {});
        for i in 0..n * n {
            let point = Geometry::Point(Coord::xy((i % n) as f64, (i / n) as f64));
            fgb.add_feature(Some(&point), &[("id", Some(ColumnValue::ULong(i as u64)))])?;
        }
        let mut out = Vec::new();
        fgb.write(&mut out)?;
        Ok(Bytes::from(out))
    }

    fn id(feature: &FgbFeature) -> Result<u64> {
        match feature.property("id")? {
            Some(ColumnValue::ULong(id)) => Ok(id),
            other => Err(Error::CorruptData(format!("unexpected id {other:?}"))),
        }
    }

    #[tokio::test]
    async fn select_all() -> Result<()> {
        let mut data = grid_dataset(5, true)?;
        let mut fgb = AsyncFgbReader::open(&mut data).await?.select_all().await?;
        assert_eq!(fgb.features_count(), Some(25));
        let mut ids = Vec::new();
        while let Some(feature) = fgb.next().await? {
            ids.push(id(feature)?);
        }
        assert_eq!(ids, (0..25).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn select_bbox() -> Result<()> {
        let mut data = grid_dataset(10, true)?;
        let mut fgb = AsyncFgbReader::open(&mut data)
            .await?
            .select_bbox(2.5, 2.5, 4.5, 5.5, SearchOptions::default())
            .await?;
        let mut ids = Vec::new();
        while let Some(feature) = fgb.next().await? {
            let Some(Geometry::Point(coord)) = feature.geometry()? else {
                panic!("point expected");
            };
            assert!((2.5..=4.5).contains(&coord.x) && (2.5..=5.5).contains(&coord.y));
            ids.push(id(feature)?);
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![33, 34, 43, 44, 53, 54]);
        Ok(())
    }

    /// Records requested ranges
    struct CountingSource {
        data: Bytes,
        requests: Vec<(usize, usize)>,
    }

    #[async_trait]
    impl RangeRead for CountingSource {
        async fn read_range(&mut self, begin: usize, length: usize) -> Result<Bytes> {
            self.requests.push((begin, length));
            self.data.read_range(begin, length).await
        }
    }

    #[tokio::test]
    async fn bbox_fetches_selected_records_only() -> Result<()> {
        let mut source = CountingSource {
            data: grid_dataset(100, true)?,
            requests: Vec::new(),
        };
        let fgb = AsyncFgbReader::open(&mut source).await?;
        let feature_base =
            fgb.header_len() + PackedRTree::index_size(10_000, fgb.header().index_node_size())?;
        let mut fgb = fgb
            .select_bbox(49.5, 49.5, 52.5, 52.5, SearchOptions::default())
            .await?;
        let mut hits = 0;
        while let Some(feature) = fgb.next().await? {
            assert!(feature.feature_buf.len() < FEATURE_PREFETCH_SIZE);
            hits += 1;
        }
        assert_eq!(hits, 9);

        let feature_requests: Vec<usize> = source
            .requests
            .iter()
            .filter(|(begin, _)| *begin >= feature_base)
            .map(|(_, length)| *length)
            .collect();
        assert_eq!(feature_requests.len(), hits);
        assert!(
            feature_requests.iter().all(|len| *len <= FEATURE_PREFETCH_SIZE),
            "{feature_requests:?}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn large_feature_takes_second_request() -> Result<()> {
        let mut fgb = FgbWriter::create("lines", GeometryType::LineString)?;
        let coords: Vec<Coord> = (0..100).map(|i| Coord::xy(i as f64, 0.)).collect();
        fgb.add_feature(Some(&Geometry::LineString(coords.clone())), &[])?;
        let mut out = Vec::new();
        fgb.write(&mut out)?;
        let mut source = CountingSource {
            data: Bytes::from(out),
            requests: Vec::new(),
        };
        let mut fgb = AsyncFgbReader::open(&mut source).await?.select_all().await?;
        let feature = fgb.next().await?.expect("feature");
        assert_eq!(feature.geometry()?, Some(Geometry::LineString(coords)));
        assert!(fgb.next().await?.is_none());
        // header size, header, record prefix, record rest
        assert_eq!(source.requests.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn bbox_needs_index() -> Result<()> {
        let mut data = grid_dataset(2, false)?;
        let fgb = AsyncFgbReader::open(&mut data).await?;
        let err = fgb
            .select_bbox(0., 0., 1., 1., SearchOptions::default())
            .await
            .err()
            .expect("error");
        assert!(matches!(err, Error::NoIndex));
        Ok(())
    }

    /// Serves at most `max_len` bytes per request
    struct ShortReads {
        data: Bytes,
        max_len: usize,
    }

    #[async_trait]
    impl RangeRead for ShortReads {
        async fn read_range(&mut self, begin: usize, length: usize) -> Result<Bytes> {
            self.data
                .read_range(begin, length.min(self.max_len))
                .await
        }
    }

    #[tokio::test]
    async fn short_reads() -> Result<()> {
        let mut source = ShortReads {
            data: grid_dataset(3, true)?,
            max_len: 64,
        };
        let err = AsyncFgbReader::open(&mut source).await.err().expect("error");
        assert_eq!(err.kind(), ErrorKind::CorruptData);

        let mut data = Bytes::from_static(b"fgb\x03fgb\0\x10\0\0\0");
        let err = AsyncFgbReader::open(&mut data).await.err().expect("error");
        assert_eq!(err.kind(), ErrorKind::CorruptData);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_magic() {
        let mut data = Bytes::from_static(b"xyz\x03fgb\0\x10\0\0\0");
        let err = AsyncFgbReader::open(&mut data).await.err().expect("error");
        assert!(matches!(err, Error::MissingMagicBytes));
    }
}
