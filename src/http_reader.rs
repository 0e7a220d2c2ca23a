use crate::async_reader::AsyncFgbReader;
use crate::error::Result;
use crate::packed_r_tree::{NodeItem, PackedRTree, RangeRead};
use async_trait::async_trait;
use bytes::Bytes;
use http_range_client::{
    AsyncBufferedHttpRangeClient, AsyncHttpRangeClient, BufferedHttpRangeClient,
};
use std::mem::size_of;

#[cfg(test)]
mod mock_http_range_client;

/// FlatGeobuf dataset reader over HTTP range requests
///
/// ```no_run
/// use flatgeobuf_core::*;
/// # async fn read() -> flatgeobuf_core::Result<()> {
/// let mut source = HttpRangeSource::new("https://flatgeobuf.org/test/data/countries.fgb");
/// let mut fgb = HttpFgbReader::open(&mut source)
///     .await?
///     .select_bbox(8.8, 47.2, 9.5, 55.3, SearchOptions::default())
///     .await?;
/// while let Some(feature) = fgb.next().await? {
///     println!("{:?}", feature.property("name")?);
/// }
/// # Ok(())
/// # }
/// ```
pub type HttpFgbReader<'r, T = reqwest::Client> = AsyncFgbReader<'r, HttpRangeSource<T>>;

/// [RangeRead] adapter for a buffered HTTP range client
pub struct HttpRangeSource<T: AsyncHttpRangeClient = reqwest::Client> {
    client: AsyncBufferedHttpRangeClient<T>,
}

impl HttpRangeSource<reqwest::Client> {
    pub fn new(url: &str) -> Self {
        HttpRangeSource::with_client(BufferedHttpRangeClient::new(url))
    }
}

impl<T: AsyncHttpRangeClient> HttpRangeSource<T> {
    pub fn with_client(mut client: AsyncBufferedHttpRangeClient<T>) -> Self {
        // Anything fetched beyond the header is buffered, so the first request
        // also covers the top levels of the index.
        let prefetched_layers: u32 = 3;
        let prefetch_index_bytes: usize = (0..prefetched_layers)
            .map(|i| (PackedRTree::DEFAULT_NODE_SIZE as usize).pow(i) * size_of::<NodeItem>())
            .sum();
        let assumed_header_size = 2024;
        let min_req_size = assumed_header_size + prefetch_index_bytes;
        debug!("min_req_size: {min_req_size} (assumed_header_size: {assumed_header_size}, prefetch_index_bytes: {prefetch_index_bytes})");
        client.set_min_req_size(min_req_size);
        HttpRangeSource { client }
    }
}

#[async_trait]
impl<T: AsyncHttpRangeClient + Send + Sync> RangeRead for HttpRangeSource<T> {
    async fn read_range(&mut self, begin: usize, length: usize) -> Result<Bytes> {
        let bytes = self.client.get_range(begin, length).await?;
        Ok(Bytes::copy_from_slice(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::mock_http_range_client::MockHttpRangeClient;
    use super::*;
    use crate::geometry::{Coord, Geometry};
    use crate::header_generated::GeometryType;
    use crate::packed_r_tree::SearchOptions;
    use crate::FgbWriter;

    fn dataset() -> Result<Vec<u8>> {
        let mut fgb = FgbWriter::create("points", GeometryType::Point)?;
        for i in 0..1000 {
            let point = Geometry::Point(Coord::xy((i % 40) as f64, (i / 40) as f64));
            fgb.add_feature(Some(&point), &[])?;
        }
        let mut out = Vec::new();
        fgb.write(&mut out)?;
        Ok(out)
    }

    #[tokio::test]
    async fn http_select_bbox() -> Result<()> {
        let data = Bytes::from(dataset()?);
        let (client, stats) = MockHttpRangeClient::new("mock.fgb", data);
        let mut source = HttpRangeSource::with_client(AsyncBufferedHttpRangeClient::with(
            client, "mock.fgb",
        ));
        let fgb = HttpFgbReader::open(&mut source).await?;
        assert_eq!(fgb.header().features_count(), 1000);
        let mut fgb = fgb
            .select_bbox(10.0, 10.0, 12.0, 11.0, SearchOptions::default())
            .await?;
        let mut count = 0;
        while let Some(feature) = fgb.next().await? {
            assert!(feature.geometry()?.is_some());
            count += 1;
        }
        assert_eq!(count, 6);
        let requests = stats.read().expect("stats").request_count;
        assert!(requests < 20, "{requests} requests");
        Ok(())
    }
}
