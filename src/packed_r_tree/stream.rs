//! Incremental index search against a byte store addressed by ranges.
//!
//! Nodes are fetched level by level. Pending fetches at the same level are merged
//! when the bytes in between stay below [SearchOptions::combine_request_threshold],
//! and leaf hits of a fetched range are handed out before the next fetch.

use super::{check_child, checked_offset, generate_level_bounds, nodes_from_bytes};
use super::{NodeItem, PackedRTree, NODE_ITEM_LEN};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::cmp::min;
use std::collections::VecDeque;
use std::ops::Range;

/// Random access to a byte store, e.g. a file served over HTTP range requests.
#[async_trait]
pub trait RangeRead: Send {
    /// Read `length` bytes starting at `begin`.
    ///
    /// Reading past the end of the store returns the available bytes only.
    async fn read_range(&mut self, begin: usize, length: usize) -> Result<Bytes>;
}

#[async_trait]
impl RangeRead for Bytes {
    async fn read_range(&mut self, begin: usize, length: usize) -> Result<Bytes> {
        let start = min(begin, self.len());
        let end = min(begin.saturating_add(length), self.len());
        Ok(self.slice(start..end))
    }
}

#[async_trait]
impl<R: RangeRead + ?Sized> RangeRead for Box<R> {
    async fn read_range(&mut self, begin: usize, length: usize) -> Result<Bytes> {
        (**self).read_range(begin, length).await
    }
}

pub const DEFAULT_COMBINE_REQUEST_THRESHOLD: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum number of unneeded bytes fetched to merge two node requests
    pub combine_request_threshold: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            combine_request_threshold: DEFAULT_COMBINE_REQUEST_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSearchItem {
    /// Byte offset in feature data section
    pub offset: usize,
    /// Position of the leaf in Hilbert order
    pub index: usize,
    /// Distance to the offset of the following leaf, if known and positive.
    /// An upper bound of the record size, records are stored in insertion order.
    pub length: Option<usize>,
}

#[derive(Debug, PartialEq, Eq)]
struct NodeRange {
    level: usize,
    nodes: Range<usize>,
}

/// Resumable bbox search over an index stored in a [RangeRead].
///
/// Dropping the search cancels it.
pub struct IndexSearch<'r, R: RangeRead + ?Sized> {
    source: &'r mut R,
    index_begin: usize,
    node_size: usize,
    bounds: NodeItem,
    level_bounds: Vec<Range<usize>>,
    options: SearchOptions,
    queue: VecDeque<NodeRange>,
    ready: VecDeque<StreamSearchItem>,
    requests: usize,
}

impl PackedRTree {
    /// Start a search over the index at `index_begin` of `source`.
    /// Nothing is fetched before the first call to [IndexSearch::next].
    #[allow(clippy::too_many_arguments)]
    pub fn stream_search_async<'r, R: RangeRead + ?Sized>(
        source: &'r mut R,
        index_begin: usize,
        num_items: usize,
        node_size: u16,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
        options: SearchOptions,
    ) -> Result<IndexSearch<'r, R>> {
        let bounds = NodeItem::bounds(min_x, min_y, max_x, max_y);
        let mut queue = VecDeque::new();
        let level_bounds = if num_items == 0 {
            Vec::new()
        } else {
            let level_bounds = generate_level_bounds(num_items, node_size)?;
            queue.push_back(NodeRange {
                level: level_bounds.len() - 1,
                nodes: 0..1,
            });
            level_bounds
        };
        debug!("stream_search_async - index_begin: {index_begin}, num_items: {num_items}, node_size: {node_size}, level_bounds: {level_bounds:?}, bounds: [({min_x}, {min_y}), ({max_x}, {max_y})]");
        Ok(IndexSearch {
            source,
            index_begin,
            node_size: node_size as usize,
            bounds,
            level_bounds,
            options,
            queue,
            ready: VecDeque::new(),
            requests: 0,
        })
    }
}

impl<R: RangeRead + ?Sized> IndexSearch<'_, R> {
    /// Next leaf hit, or `None` when the search is exhausted.
    pub async fn next(&mut self) -> Result<Option<StreamSearchItem>> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Ok(Some(item));
            }
            let Some(node_range) = self.queue.pop_front() else {
                return Ok(None);
            };
            if let Err(e) = self.visit(node_range).await {
                // a failed search stays failed
                self.queue.clear();
                return Err(e);
            }
        }
    }

    /// Drain all remaining hits.
    pub async fn collect_all(mut self) -> Result<Vec<StreamSearchItem>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Number of range reads issued so far
    pub fn requests(&self) -> usize {
        self.requests
    }

    /// The searched byte store, e.g. for fetching features between hits
    pub fn source_mut(&mut self) -> &mut R {
        self.source
    }

    async fn visit(&mut self, node_range: NodeRange) -> Result<()> {
        let level = node_range.level;
        let nodes = node_range.nodes;
        debug!(
            "fetching level {level} nodes {nodes:?}. {} ranges left in queue",
            self.queue.len()
        );
        // One extra leaf is read to infer the length of the last feature in range
        let fetch_end = if level == 0 {
            min(nodes.end + 1, self.level_bounds[0].end)
        } else {
            nodes.end
        };
        let count = fetch_end - nodes.start;
        let begin = self.index_begin + nodes.start * NODE_ITEM_LEN;
        let bytes = self.source.read_range(begin, count * NODE_ITEM_LEN).await?;
        self.requests += 1;
        let node_items = nodes_from_bytes(&bytes, count)?;

        for (i, node_item) in node_items.iter().enumerate().take(nodes.len()) {
            if !self.bounds.intersects(node_item) {
                continue;
            }
            let offset = checked_offset(node_item.offset)? as usize;
            if level == 0 {
                let length = match node_items.get(i + 1) {
                    Some(next) => {
                        let next_offset = checked_offset(next.offset)? as usize;
                        next_offset.checked_sub(offset).filter(|len| *len > 0)
                    }
                    None => None,
                };
                let index = nodes.start + i - self.level_bounds[0].start;
                trace!("leaf hit index: {index}, offset: {offset}, length: {length:?}");
                self.ready.push_back(StreamSearchItem {
                    offset,
                    index,
                    length,
                });
            } else {
                let child_level = level - 1;
                check_child(&self.level_bounds, child_level, offset)?;
                let end = min(offset + self.node_size, self.level_bounds[child_level].end);
                self.enqueue(NodeRange {
                    level: child_level,
                    nodes: offset..end,
                });
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, children: NodeRange) {
        let threshold = self.options.combine_request_threshold;
        if let Some(tail) = self.queue.back_mut() {
            if tail.level == children.level && children.nodes.start >= tail.nodes.end {
                let wasted_bytes = (children.nodes.start - tail.nodes.end) * NODE_ITEM_LEN;
                if wasted_bytes <= threshold {
                    debug!(
                        "extending request {tail:?} with nearby children {:?} (wastes {wasted_bytes} bytes)",
                        children.nodes
                    );
                    tail.nodes.end = children.nodes.end;
                    return;
                }
                debug!("new request for {children:?} rather than merging with distant {tail:?} (would waste {wasted_bytes} bytes)");
            }
        }
        self.queue.push_back(children);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use std::collections::HashSet;

    struct CountingSource {
        data: Bytes,
        requests: Vec<(usize, usize)>,
        truncate: Option<usize>,
    }

    impl CountingSource {
        fn new(data: Vec<u8>) -> Self {
            CountingSource {
                data: Bytes::from(data),
                requests: Vec::new(),
                truncate: None,
            }
        }
    }

    #[async_trait]
    impl RangeRead for CountingSource {
        async fn read_range(&mut self, begin: usize, length: usize) -> Result<Bytes> {
            self.requests.push((begin, length));
            let length = self.truncate.map_or(length, |max| min(max, length));
            self.data.read_range(begin, length).await
        }
    }

    fn grid(n: usize) -> Vec<NodeItem> {
        let mut rects = Vec::new();
        for i in 0..n {
            for j in 0..n {
                let (x, y) = (i as f64, j as f64);
                rects.push(NodeItem::bounds(x, y, x + 0.5, y + 0.5));
            }
        }
        rects
    }

    #[tokio::test]
    async fn stream_search_matches_search() -> Result<()> {
        let rects = grid(30);
        for node_size in [2u16, 4, 16] {
            let tree = PackedRTree::build_from_rects(&rects, node_size)?;
            let mut source = CountingSource::new(tree.to_bytes());
            for (min_x, min_y, max_x, max_y) in
                [(3.2, 4.1, 9.7, 12.0), (0.0, 0.0, 0.1, 0.1), (-5.0, -5.0, -1.0, -1.0)]
            {
                let expected: HashSet<usize> = tree
                    .search(min_x, min_y, max_x, max_y)?
                    .iter()
                    .map(|item| item.offset)
                    .collect();
                let search = PackedRTree::stream_search_async(
                    &mut source,
                    0,
                    rects.len(),
                    node_size,
                    min_x,
                    min_y,
                    max_x,
                    max_y,
                    SearchOptions::default(),
                )?;
                let found: HashSet<usize> = search
                    .collect_all()
                    .await?
                    .iter()
                    .map(|item| item.offset)
                    .collect();
                assert_eq!(found, expected, "node_size {node_size}");
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn merges_nearby_requests() -> Result<()> {
        let rects = grid(20);
        let tree = PackedRTree::build_from_rects(&rects, 4)?;
        let data = tree.to_bytes();

        let mut merged = CountingSource::new(data.clone());
        let search = PackedRTree::stream_search_async(
            &mut merged,
            0,
            rects.len(),
            4,
            0.0,
            0.0,
            20.0,
            20.0,
            SearchOptions::default(),
        )?;
        let all = search.collect_all().await?;
        assert_eq!(all.len(), rects.len());
        // one request per level when everything matches
        let num_levels = generate_level_bounds(rects.len(), 4)?.len();
        assert_eq!(merged.requests.len(), num_levels);

        let mut unmerged = CountingSource::new(data);
        let search = PackedRTree::stream_search_async(
            &mut unmerged,
            0,
            rects.len(),
            4,
            0.0,
            0.0,
            20.0,
            20.0,
            SearchOptions {
                combine_request_threshold: 0,
            },
        )?;
        assert_eq!(search.collect_all().await?.len(), rects.len());
        assert!(unmerged.requests.len() >= merged.requests.len());
        Ok(())
    }

    #[tokio::test]
    async fn infers_feature_length_from_next_leaf() -> Result<()> {
        let rects: Vec<NodeItem> = (0..10)
            .map(|i| NodeItem::bounds(i as f64, 0.0, i as f64, 0.0))
            .collect();
        let mut nodes: Vec<NodeItem> = rects
            .iter()
            .enumerate()
            .map(|(i, r)| NodeItem {
                offset: (i * 100) as u64,
                ..r.clone()
            })
            .collect();
        // leaves in ascending offset order
        let extent = super::super::calc_extent(&nodes);
        nodes.sort_by_key(|n| n.offset);
        let tree = PackedRTree::build(&nodes, &extent, 4)?;
        let mut source = Bytes::from(tree.to_bytes());
        let search = PackedRTree::stream_search_async(
            &mut source,
            0,
            nodes.len(),
            4,
            -1.0,
            -1.0,
            100.0,
            1.0,
            SearchOptions::default(),
        )?;
        let items = search.collect_all().await?;
        assert_eq!(items.len(), 10);
        for item in &items[..9] {
            assert_eq!(item.length, Some(100));
        }
        assert_eq!(items[9].length, None);
        Ok(())
    }

    #[tokio::test]
    async fn stops_early() -> Result<()> {
        let rects = grid(10);
        let tree = PackedRTree::build_from_rects(&rects, 2)?;
        let mut source = CountingSource::new(tree.to_bytes());
        let mut search = PackedRTree::stream_search_async(
            &mut source,
            0,
            rects.len(),
            2,
            0.0,
            0.0,
            10.0,
            10.0,
            SearchOptions {
                combine_request_threshold: 0,
            },
        )?;
        assert!(search.next().await?.is_some());
        let requests = search.requests();
        drop(search);
        assert_eq!(source.requests.len(), requests);
        assert!(requests < generate_level_bounds(rects.len(), 2)?[0].end);
        Ok(())
    }

    #[tokio::test]
    async fn short_read_is_corrupt_data() -> Result<()> {
        let rects = grid(5);
        let tree = PackedRTree::build_from_rects(&rects, 4)?;
        let mut source = CountingSource::new(tree.to_bytes());
        source.truncate = Some(NODE_ITEM_LEN - 1);
        let mut search = PackedRTree::stream_search_async(
            &mut source,
            0,
            rects.len(),
            4,
            0.0,
            0.0,
            5.0,
            5.0,
            SearchOptions::default(),
        )?;
        let err = search.next().await.unwrap_err();
        assert!(matches!(err, Error::CorruptData(_)));
        assert_eq!(err.kind(), ErrorKind::CorruptData);
        assert!(search.next().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn empty_index() -> Result<()> {
        let mut source = Bytes::new();
        let search = PackedRTree::stream_search_async(
            &mut source,
            0,
            0,
            16,
            0.0,
            0.0,
            1.0,
            1.0,
            SearchOptions::default(),
        )?;
        assert!(search.collect_all().await?.is_empty());
        Ok(())
    }
}
