use bytes::Bytes;
use http_range_client::AsyncHttpRangeClient;
use std::ops::Range;
use std::sync::{Arc, RwLock};

/// Serves range requests from memory.
/// NOTE: For debugging expediency, this test class often prefers panics over returning a result.
pub(crate) struct MockHttpRangeClient {
    url: String,
    data: Bytes,
    stats: Arc<RwLock<RequestStats>>,
}

pub(crate) struct RequestStats {
    pub request_count: u64,
}

impl MockHttpRangeClient {
    pub(crate) fn new(url: &str, data: Bytes) -> (Self, Arc<RwLock<RequestStats>>) {
        let stats = Arc::new(RwLock::new(RequestStats {
            request_count: 0,
        }));
        let client = MockHttpRangeClient {
            url: url.to_string(),
            data,
            stats: stats.clone(),
        };
        (client, stats)
    }
}

/// Range headers are *inclusive*
fn parse_range_header(range: &str) -> Range<usize> {
    let bytes = range.strip_prefix("bytes=").expect("bytes range");
    let (start, end) = bytes.split_once('-').expect("start-end");
    let start: usize = start.parse().expect("should have valid start range");
    let end: usize = end.parse().expect("should have valid end range");
    start..(end + 1)
}

#[async_trait::async_trait]
impl AsyncHttpRangeClient for MockHttpRangeClient {
    async fn get_range(&self, url: &str, range: &str) -> http_range_client::Result<Bytes> {
        assert_eq!(url, self.url);
        let range = parse_range_header(range);
        let mut stats = self
            .stats
            .write()
            .expect("test code does not handle actual concurrency");
        stats.request_count += 1;

        let start = range.start.min(self.data.len());
        let end = range.end.min(self.data.len());
        Ok(self.data.slice(start..end))
    }

    async fn head_response_header(
        &self,
        _url: &str,
        _header: &str,
    ) -> http_range_client::Result<Option<String>> {
        Ok(None)
    }
}
