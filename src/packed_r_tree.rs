//! Create and read a [packed Hilbert R-Tree](https://en.wikipedia.org/wiki/Hilbert_R-tree#Packed_Hilbert_R-trees)
//! to enable fast bounding box spatial filtering.

use crate::error::{Error, Result};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::{max, min, Reverse};
use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::ops::Range;

pub mod stream;

pub use stream::{IndexSearch, RangeRead, SearchOptions, StreamSearchItem};

#[derive(Clone, PartialEq, Debug)]
#[repr(C)]
/// R-Tree node
pub struct NodeItem {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    /// Byte offset in feature data section (leaf) or node index of the first child (branch)
    pub offset: u64,
}

/// Size of a serialized node in bytes
pub const NODE_ITEM_LEN: usize = size_of::<NodeItem>();

/// Offsets are limited to 52 bits, the integer range exactly representable as f64.
const MAX_OFFSET: u64 = (1 << 52) - 1;

impl NodeItem {
    pub fn bounds(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> NodeItem {
        NodeItem {
            min_x,
            min_y,
            max_x,
            max_y,
            offset: 0,
        }
    }

    /// Empty node which expands to the bounds of everything added to it
    pub fn create(offset: u64) -> NodeItem {
        NodeItem {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
            offset,
        }
    }

    pub fn from_reader(mut rdr: impl Read) -> Result<Self> {
        Ok(NodeItem {
            min_x: rdr.read_f64::<LittleEndian>()?,
            min_y: rdr.read_f64::<LittleEndian>()?,
            max_x: rdr.read_f64::<LittleEndian>()?,
            max_y: rdr.read_f64::<LittleEndian>()?,
            offset: rdr.read_u64::<LittleEndian>()?,
        })
    }

    /// Decode one node from a 40 byte record
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < NODE_ITEM_LEN {
            return Err(Error::CorruptData(format!(
                "node record of {} bytes, expected {NODE_ITEM_LEN}",
                raw.len()
            )));
        }
        Ok(NodeItem {
            min_x: LittleEndian::read_f64(&raw[0..8]),
            min_y: LittleEndian::read_f64(&raw[8..16]),
            max_x: LittleEndian::read_f64(&raw[16..24]),
            max_y: LittleEndian::read_f64(&raw[24..32]),
            offset: LittleEndian::read_u64(&raw[32..40]),
        })
    }

    pub fn write<W: Write>(&self, wtr: &mut W) -> std::io::Result<()> {
        wtr.write_f64::<LittleEndian>(self.min_x)?;
        wtr.write_f64::<LittleEndian>(self.min_y)?;
        wtr.write_f64::<LittleEndian>(self.max_x)?;
        wtr.write_f64::<LittleEndian>(self.max_y)?;
        wtr.write_u64::<LittleEndian>(self.offset)?;
        Ok(())
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn expand(&mut self, r: &NodeItem) {
        if r.min_x < self.min_x {
            self.min_x = r.min_x;
        }
        if r.min_y < self.min_y {
            self.min_y = r.min_y;
        }
        if r.max_x > self.max_x {
            self.max_x = r.max_x;
        }
        if r.max_y > self.max_y {
            self.max_y = r.max_y;
        }
    }

    pub fn expand_xy(&mut self, x: f64, y: f64) {
        if x < self.min_x {
            self.min_x = x;
        }
        if y < self.min_y {
            self.min_y = y;
        }
        if x > self.max_x {
            self.max_x = x;
        }
        if y > self.max_y {
            self.max_y = y;
        }
    }

    /// True unless the rectangles are separated along one axis. Touching edges intersect.
    pub fn intersects(&self, r: &NodeItem) -> bool {
        if self.max_x < r.min_x {
            return false;
        }
        if self.max_y < r.min_y {
            return false;
        }
        if self.min_x > r.max_x {
            return false;
        }
        if self.min_y > r.max_y {
            return false;
        }
        true
    }

    /// True if nothing has been added to a node created with [NodeItem::create]
    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }
}

/// Rejects offsets with any of the upper 12 bits set
pub(crate) fn checked_offset(offset: u64) -> Result<u64> {
    if offset > MAX_OFFSET {
        Err(Error::CorruptData(format!(
            "node offset {offset} exceeds 52 bit range"
        )))
    } else {
        Ok(offset)
    }
}

/// Decode `count` nodes from a contiguous buffer
pub(crate) fn nodes_from_bytes(bytes: &[u8], count: usize) -> Result<Vec<NodeItem>> {
    let expected = count * NODE_ITEM_LEN;
    if bytes.len() < expected {
        return Err(Error::CorruptData(format!(
            "short read of index nodes: got {} bytes, expected {expected}",
            bytes.len()
        )));
    }
    bytes[..expected]
        .chunks_exact(NODE_ITEM_LEN)
        .map(NodeItem::from_bytes)
        .collect()
}

/// Read full capacity of vec from data stream
fn read_node_vec(node_items: &mut Vec<NodeItem>, mut data: impl Read) -> Result<()> {
    node_items.clear();
    for _ in 0..node_items.capacity() {
        node_items.push(NodeItem::from_reader(&mut data)?);
    }
    Ok(())
}

/// Read partial item vec from data stream
fn read_node_items<R: Read + Seek>(
    data: &mut R,
    base: u64,
    node_index: usize,
    length: usize,
) -> Result<Vec<NodeItem>> {
    let mut node_items = Vec::with_capacity(length);
    data.seek(SeekFrom::Start(base + (node_index * NODE_ITEM_LEN) as u64))?;
    read_node_vec(&mut node_items, data)?;
    Ok(node_items)
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Bbox filter search result
pub struct SearchResultItem {
    /// Byte offset in feature data section
    pub offset: usize,
    /// Position of the leaf in Hilbert order
    pub index: usize,
}

const HILBERT_MAX: u32 = (1 << 16) - 1;

// Based on public domain code at https://github.com/rawrunprotected/hilbert_curves
fn hilbert(x: u32, y: u32) -> u32 {
    let mut a = x ^ y;
    let mut b = 0xFFFF ^ a;
    let mut c = 0xFFFF ^ (x | y);
    let mut d = x & (y ^ 0xFFFF);

    let mut aa = a | (b >> 1);
    let mut bb = (a >> 1) ^ a;
    let mut cc = ((c >> 1) ^ (b & (d >> 1))) ^ c;
    let mut dd = ((a & (c >> 1)) ^ (d >> 1)) ^ d;

    a = aa;
    b = bb;
    c = cc;
    d = dd;
    aa = (a & (a >> 2)) ^ (b & (b >> 2));
    bb = (a & (b >> 2)) ^ (b & ((a ^ b) >> 2));
    cc ^= (a & (c >> 2)) ^ (b & (d >> 2));
    dd ^= (b & (c >> 2)) ^ ((a ^ b) & (d >> 2));

    a = aa;
    b = bb;
    c = cc;
    d = dd;
    aa = (a & (a >> 4)) ^ (b & (b >> 4));
    bb = (a & (b >> 4)) ^ (b & ((a ^ b) >> 4));
    cc ^= (a & (c >> 4)) ^ (b & (d >> 4));
    dd ^= (b & (c >> 4)) ^ ((a ^ b) & (d >> 4));

    a = aa;
    b = bb;
    c = cc;
    d = dd;
    cc ^= (a & (c >> 8)) ^ (b & (d >> 8));
    dd ^= (b & (c >> 8)) ^ ((a ^ b) & (d >> 8));

    a = cc ^ (cc >> 1);
    b = dd ^ (dd >> 1);

    let mut i0 = x ^ y;
    let mut i1 = b | (0xFFFF ^ (i0 | a));

    i0 = (i0 | (i0 << 8)) & 0x00FF00FF;
    i0 = (i0 | (i0 << 4)) & 0x0F0F0F0F;
    i0 = (i0 | (i0 << 2)) & 0x33333333;
    i0 = (i0 | (i0 << 1)) & 0x55555555;

    i1 = (i1 | (i1 << 8)) & 0x00FF00FF;
    i1 = (i1 | (i1 << 4)) & 0x0F0F0F0F;
    i1 = (i1 | (i1 << 2)) & 0x33333333;
    i1 = (i1 | (i1 << 1)) & 0x55555555;

    (i1 << 1) | i0
}

/// Scale a center ordinate into `0..=hilbert_max`. Degenerate extents map to 0.
fn hilbert_ordinate(center: f64, min: f64, size: f64, hilbert_max: u32) -> u32 {
    if !(size > 0.0) {
        return 0;
    }
    let scaled = (hilbert_max as f64 * (center - min) / size).floor();
    if scaled.is_nan() || scaled < 0.0 {
        0
    } else {
        scaled.min(hilbert_max as f64) as u32
    }
}

fn hilbert_bbox(r: &NodeItem, hilbert_max: u32, extent: &NodeItem) -> u32 {
    let x = hilbert_ordinate(
        (r.min_x + r.max_x) / 2.0,
        extent.min_x,
        extent.width(),
        hilbert_max,
    );
    let y = hilbert_ordinate(
        (r.min_y + r.max_y) / 2.0,
        extent.min_y,
        extent.height(),
        hilbert_max,
    );
    hilbert(x, y)
}

/// Sort items by descending Hilbert value of their centers. Ties keep their input order.
pub fn hilbert_sort(items: &mut [NodeItem], extent: &NodeItem) {
    items.sort_by_cached_key(|item| Reverse(hilbert_bbox(item, HILBERT_MAX, extent)));
}

pub fn calc_extent(nodes: &[NodeItem]) -> NodeItem {
    nodes.iter().fold(NodeItem::create(0), |mut a, b| {
        a.expand(b);
        a
    })
}

fn clamp_node_size(node_size: u16) -> Result<u16> {
    if node_size < 2 {
        return Err(Error::InvalidArgument(format!(
            "node size must be at least 2, got {node_size}"
        )));
    }
    Ok(min(max(node_size, 2u16), 65535u16))
}

/// Node ranges per level, leaves first. Ranges index into the root-first storage order.
pub(crate) fn generate_level_bounds(num_items: usize, node_size: u16) -> Result<Vec<Range<usize>>> {
    let node_size = clamp_node_size(node_size)? as usize;
    if num_items == 0 {
        return Err(Error::InvalidArgument(
            "cannot create an index over zero items".to_string(),
        ));
    }
    if num_items > usize::MAX - ((num_items / node_size) * 2) {
        return Err(Error::InvalidArgument(format!(
            "number of items too large: {num_items}"
        )));
    }

    // number of nodes per level in bottom-up order
    let mut level_num_nodes: Vec<usize> = Vec::new();
    let mut n = num_items;
    let mut num_nodes = n;
    level_num_nodes.push(n);
    loop {
        n = (n + node_size - 1) / node_size;
        num_nodes += n;
        level_num_nodes.push(n);
        if n == 1 {
            break;
        }
    }
    // bounds per level in reversed storage order (top-down)
    let mut level_bounds = Vec::with_capacity(level_num_nodes.len());
    n = num_nodes;
    for size in &level_num_nodes {
        let start = n - size;
        level_bounds.push(start..start + size);
        n -= size;
    }
    Ok(level_bounds)
}

/// Packed Hilbert R-Tree
#[derive(Debug, Clone)]
pub struct PackedRTree {
    extent: NodeItem,
    node_items: Vec<NodeItem>,
    num_leaf_nodes: usize,
    branching_factor: u16,
    level_bounds: Vec<Range<usize>>,
}

impl PackedRTree {
    pub const DEFAULT_NODE_SIZE: u16 = 16;

    fn init(extent: NodeItem, num_items: usize, node_size: u16) -> Result<PackedRTree> {
        let branching_factor = clamp_node_size(node_size)?;
        let level_bounds = generate_level_bounds(num_items, branching_factor)?;
        let num_nodes = level_bounds[0].end;
        Ok(PackedRTree {
            extent,
            node_items: Vec::with_capacity(num_nodes),
            num_leaf_nodes: num_items,
            branching_factor,
            level_bounds,
        })
    }

    fn generate_nodes(&mut self) {
        for level in 0..self.level_bounds.len() - 1 {
            let children_level = &self.level_bounds[level];
            let parent_level = &self.level_bounds[level + 1];

            let mut parent_idx = parent_level.start;
            let mut child_idx = children_level.start;
            while child_idx < children_level.end {
                let mut parent_node = NodeItem::create(child_idx as u64);
                for _ in 0..self.branching_factor {
                    if child_idx >= children_level.end {
                        break;
                    }
                    parent_node.expand(&self.node_items[child_idx]);
                    child_idx += 1;
                }
                self.node_items[parent_idx] = parent_node;
                parent_idx += 1;
            }
        }
    }

    fn num_nodes(&self) -> usize {
        self.node_items.len()
    }

    /// Build a tree over Hilbert sorted leaf `nodes`. The leaf offsets are stored as given.
    pub fn build(nodes: &[NodeItem], extent: &NodeItem, node_size: u16) -> Result<PackedRTree> {
        let mut tree = PackedRTree::init(extent.clone(), nodes.len(), node_size)?;
        let num_nodes = tree.level_bounds[0].end;
        let leaf_start = num_nodes - tree.num_leaf_nodes;
        tree.node_items.resize(leaf_start, NodeItem::create(0));
        for node in nodes {
            checked_offset(node.offset)?;
            tree.node_items.push(node.clone());
        }
        tree.generate_nodes();
        Ok(tree)
    }

    /// Compute extent, Hilbert sort and build in one step.
    /// Leaf offsets are set to the position of each rectangle in `rects`.
    pub fn build_from_rects(rects: &[NodeItem], node_size: u16) -> Result<PackedRTree> {
        let mut nodes: Vec<NodeItem> = rects
            .iter()
            .enumerate()
            .map(|(i, r)| NodeItem {
                offset: i as u64,
                ..r.clone()
            })
            .collect();
        let extent = calc_extent(&nodes);
        hilbert_sort(&mut nodes, &extent);
        PackedRTree::build(&nodes, &extent, node_size)
    }

    /// Load a packed index of `num_items` leaves
    pub fn from_buf(data: impl Read, num_items: usize, node_size: u16) -> Result<PackedRTree> {
        let mut tree = PackedRTree::init(NodeItem::create(0), num_items, node_size)?;
        let num_nodes = tree.level_bounds[0].end;
        tree.node_items = Vec::with_capacity(num_nodes);
        read_node_vec(&mut tree.node_items, data)?;
        if let Some(root) = tree.node_items.first() {
            tree.extent.expand(root);
        }
        Ok(tree)
    }

    pub fn search(
        &self,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    ) -> Result<Vec<SearchResultItem>> {
        let leaf_nodes_offset = self.level_bounds[0].start;
        let bounds = NodeItem::bounds(min_x, min_y, max_x, max_y);
        let mut results = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back((0, self.level_bounds.len() - 1));
        while let Some((node_index, level)) = queue.pop_front() {
            let is_leaf_node = node_index >= self.num_nodes() - self.num_leaf_nodes;
            // find the end index of the node
            let end = min(
                node_index + self.branching_factor as usize,
                self.level_bounds[level].end,
            );
            // search through child nodes
            for pos in node_index..end {
                let node_item = &self.node_items[pos];
                if !bounds.intersects(node_item) {
                    continue;
                }
                let offset = checked_offset(node_item.offset)? as usize;
                if is_leaf_node {
                    results.push(SearchResultItem {
                        offset,
                        index: pos - leaf_nodes_offset,
                    });
                } else {
                    let child_level = level - 1;
                    check_child(&self.level_bounds, child_level, offset)?;
                    queue.push_back((offset, child_level));
                }
            }
        }
        Ok(results)
    }

    /// Search an index read lazily from `data`, which must be positioned at the start of the
    /// index. On return `data` is positioned at the end of the index.
    pub fn stream_search<R: Read + Seek>(
        data: &mut R,
        num_items: usize,
        node_size: u16,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    ) -> Result<Vec<SearchResultItem>> {
        let bounds = NodeItem::bounds(min_x, min_y, max_x, max_y);
        let node_size = clamp_node_size(node_size)?;
        let level_bounds = generate_level_bounds(num_items, node_size)?;
        let Range {
            start: leaf_nodes_offset,
            end: num_nodes,
        } = level_bounds[0];

        let index_base = data.stream_position()?;

        // use ordered search queue to make index traversal in sequential order
        let mut queue = VecDeque::new();
        queue.push_back((0, level_bounds.len() - 1));
        let mut results = Vec::new();

        while let Some((node_index, level)) = queue.pop_front() {
            trace!("popped next node_index: {node_index}, level: {level}");
            let is_leaf_node = node_index >= num_nodes - num_items;
            // find the end index of the node
            let end = min(node_index + node_size as usize, level_bounds[level].end);
            let length = end - node_index;
            let node_items = read_node_items(data, index_base, node_index, length)?;
            // search through child nodes
            for (node_item, pos) in node_items.iter().zip(node_index..end) {
                if !bounds.intersects(node_item) {
                    continue;
                }
                let offset = checked_offset(node_item.offset)? as usize;
                if is_leaf_node {
                    let index = pos - leaf_nodes_offset;
                    trace!("pushing leaf node. index: {index}, offset: {offset}");
                    results.push(SearchResultItem { offset, index });
                } else {
                    let child_level = level - 1;
                    check_child(&level_bounds, child_level, offset)?;
                    trace!("pushing branch node. child_level: {child_level}, offset: {offset}");
                    queue.push_back((offset, child_level));
                }
            }
        }
        // Skip rest of index
        data.seek(SeekFrom::Start(
            index_base + (num_nodes * NODE_ITEM_LEN) as u64,
        ))?;
        Ok(results)
    }

    /// Size of the serialized tree in bytes
    pub fn size(&self) -> usize {
        self.num_nodes() * NODE_ITEM_LEN
    }

    /// Exact byte size of an index over `num_items` leaves with fan-out `node_size`
    pub fn index_size(num_items: usize, node_size: u16) -> Result<usize> {
        let node_size = clamp_node_size(node_size)? as usize;
        if num_items == 0 {
            return Err(Error::InvalidArgument(
                "cannot create an index over zero items".to_string(),
            ));
        }
        let mut n = num_items;
        let mut num_nodes = n;
        loop {
            n = (n + node_size - 1) / node_size;
            num_nodes += n;
            if n == 1 {
                break;
            }
        }
        Ok(num_nodes * NODE_ITEM_LEN)
    }

    /// Write all index nodes
    pub fn stream_write<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        for item in &self.node_items {
            item.write(out)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        for item in &self.node_items {
            // Writing into a Vec can't fail
            let _ = item.write(&mut buf);
        }
        buf
    }

    pub fn extent(&self) -> NodeItem {
        self.extent.clone()
    }

    pub fn num_items(&self) -> usize {
        self.num_leaf_nodes
    }

    pub fn node_size(&self) -> u16 {
        self.branching_factor
    }

    /// Leaf nodes in Hilbert order
    pub fn leaves(&self) -> &[NodeItem] {
        &self.node_items[self.num_nodes() - self.num_leaf_nodes..]
    }
}

/// A branch offset must point into the level below it
pub(crate) fn check_child(
    level_bounds: &[Range<usize>],
    child_level: usize,
    offset: usize,
) -> Result<()> {
    if level_bounds[child_level].contains(&offset) {
        Ok(())
    } else {
        Err(Error::CorruptData(format!(
            "child node {offset} outside of level {child_level} ({:?})",
            level_bounds[child_level]
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

    #[test]
    fn tree_2items() -> Result<()> {
        let mut nodes = vec![
            NodeItem::bounds(0.0, 0.0, 1.0, 1.0),
            NodeItem::bounds(2.0, 2.0, 3.0, 3.0),
        ];
        let extent = calc_extent(&nodes);
        assert_eq!(extent, NodeItem::bounds(0.0, 0.0, 3.0, 3.0));
        assert!(nodes[0].intersects(&NodeItem::bounds(0.0, 0.0, 1.0, 1.0)));
        assert!(nodes[1].intersects(&NodeItem::bounds(2.0, 2.0, 3.0, 3.0)));
        hilbert_sort(&mut nodes, &extent);
        let mut offset = 0;
        for node in &mut nodes {
            node.offset = offset;
            offset += NODE_ITEM_LEN as u64;
        }
        assert!(nodes[1].intersects(&NodeItem::bounds(0.0, 0.0, 1.0, 1.0)));
        assert!(nodes[0].intersects(&NodeItem::bounds(2.0, 2.0, 3.0, 3.0)));
        let tree = PackedRTree::build(&nodes, &extent, PackedRTree::DEFAULT_NODE_SIZE)?;
        let list = tree.search(0.0, 0.0, 1.0, 1.0)?;
        assert_eq!(list.len(), 1);
        assert!(nodes[list[0].index].intersects(&NodeItem::bounds(0.0, 0.0, 1.0, 1.0)));
        Ok(())
    }

    #[test]
    fn tree_19items_roundtrip_stream_search() -> Result<()> {
        let mut nodes = vec![
            NodeItem::bounds(0.0, 0.0, 1.0, 1.0),
            NodeItem::bounds(2.0, 2.0, 3.0, 3.0),
            NodeItem::bounds(100.0, 100.0, 110.0, 110.0),
            NodeItem::bounds(101.0, 101.0, 111.0, 111.0),
            NodeItem::bounds(102.0, 102.0, 112.0, 112.0),
            NodeItem::bounds(103.0, 103.0, 113.0, 113.0),
            NodeItem::bounds(104.0, 104.0, 114.0, 114.0),
        ];
        nodes.extend(vec![NodeItem::bounds(10010.0, 10010.0, 10110.0, 10110.0); 12]);

        let extent = calc_extent(&nodes);
        hilbert_sort(&mut nodes, &extent);
        let mut offset = 0;
        for node in &mut nodes {
            node.offset = offset;
            offset += NODE_ITEM_LEN as u64;
        }
        let tree = PackedRTree::build(&nodes, &extent, PackedRTree::DEFAULT_NODE_SIZE)?;
        let list = tree.search(102.0, 102.0, 103.0, 103.0)?;
        let indexes: Vec<usize> = list.iter().map(|item| item.index).collect();
        assert_eq!(indexes, vec![13, 14, 15, 16]);

        let mut tree_data: Vec<u8> = Vec::new();
        tree.stream_write(&mut tree_data)?;
        assert_eq!(tree_data.len(), (nodes.len() + 3) * NODE_ITEM_LEN);
        assert_eq!(tree_data, tree.to_bytes());
        assert_eq!(NODE_ITEM_LEN, 40);

        let tree2 = PackedRTree::from_buf(
            &mut &tree_data[..],
            nodes.len(),
            PackedRTree::DEFAULT_NODE_SIZE,
        )?;
        let list = tree2.search(102.0, 102.0, 103.0, 103.0)?;
        let indexes: Vec<usize> = list.iter().map(|item| item.index).collect();
        assert_eq!(indexes, vec![13, 14, 15, 16]);

        let mut reader = Cursor::new(&tree_data);
        let list = PackedRTree::stream_search(
            &mut reader,
            nodes.len(),
            PackedRTree::DEFAULT_NODE_SIZE,
            102.0,
            102.0,
            103.0,
            103.0,
        )?;
        let indexes: Vec<usize> = list.iter().map(|item| item.index).collect();
        assert_eq!(indexes, vec![13, 14, 15, 16]);
        assert_eq!(reader.position() as usize, tree_data.len());

        Ok(())
    }

    #[test]
    fn tree_100_000_items_in_denmark() -> Result<()> {
        use rand::distributions::{Distribution, Uniform};

        let unifx = Uniform::from(466379..708929);
        let unify = Uniform::from(6096801..6322352);
        let mut rng = rand::thread_rng();

        let mut nodes = Vec::new();
        for _ in 0..100000 {
            let x = unifx.sample(&mut rng) as f64;
            let y = unify.sample(&mut rng) as f64;
            nodes.push(NodeItem::bounds(x, y, x, y));
        }

        let query = NodeItem::bounds(690407.0, 6063692.0, 811682.0, 6176467.0);
        let tree = PackedRTree::build_from_rects(&nodes, PackedRTree::DEFAULT_NODE_SIZE)?;
        let list = tree.search(query.min_x, query.min_y, query.max_x, query.max_y)?;
        for item in &list {
            assert!(nodes[item.offset].intersects(&query));
        }
        let expected = nodes.iter().filter(|n| n.intersects(&query)).count();
        assert_eq!(list.len(), expected);

        let tree_data = tree.to_bytes();
        let mut reader = Cursor::new(&tree_data);
        let list2 = PackedRTree::stream_search(
            &mut reader,
            nodes.len(),
            PackedRTree::DEFAULT_NODE_SIZE,
            query.min_x,
            query.min_y,
            query.max_x,
            query.max_y,
        )?;
        assert_eq!(list2, list);
        Ok(())
    }

    #[test]
    fn index_size_matches_serialized_tree() -> Result<()> {
        for (num_items, node_size) in [(1, 2), (2, 2), (3, 2), (16, 16), (17, 16), (256, 16), (1000, 7)] {
            let rects: Vec<NodeItem> = (0..num_items)
                .map(|i| NodeItem::bounds(i as f64, 0.0, i as f64 + 1.0, 1.0))
                .collect();
            let tree = PackedRTree::build_from_rects(&rects, node_size)?;
            assert_eq!(
                PackedRTree::index_size(num_items, node_size)?,
                tree.to_bytes().len(),
                "num_items: {num_items}, node_size: {node_size}"
            );
        }
        Ok(())
    }

    #[test]
    fn level_bounds() -> Result<()> {
        // 16 leaves fill exactly one parent
        assert_eq!(generate_level_bounds(16, 16)?, vec![1..17, 0..1]);
        // 17 leaves need two parents
        assert_eq!(generate_level_bounds(17, 16)?, vec![3..20, 1..3, 0..1]);
        // a single item still gets a root
        assert_eq!(generate_level_bounds(1, 16)?, vec![1..2, 0..1]);
        assert_eq!(PackedRTree::index_size(1, 16)?, 2 * NODE_ITEM_LEN);
        assert_eq!(
            generate_level_bounds(5, 2)?,
            vec![6..11, 3..6, 1..3, 0..1]
        );
        Ok(())
    }

    #[test]
    fn invalid_arguments() {
        use crate::error::ErrorKind;
        let err = PackedRTree::index_size(10, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = PackedRTree::index_size(0, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = PackedRTree::build(&[], &NodeItem::create(0), 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn degenerate_extent() -> Result<()> {
        let rects = vec![NodeItem::bounds(5.0, 5.0, 5.0, 5.0); 3];
        let tree = PackedRTree::build_from_rects(&rects, 2)?;
        let list = tree.search(4.0, 4.0, 6.0, 6.0)?;
        assert_eq!(list.len(), 3);
        assert!(tree.search(6.5, 6.5, 7.0, 7.0)?.is_empty());
        Ok(())
    }

    #[test]
    fn reject_offset_above_52_bits() -> Result<()> {
        let rects = vec![
            NodeItem::bounds(0.0, 0.0, 1.0, 1.0),
            NodeItem::bounds(2.0, 2.0, 3.0, 3.0),
        ];
        let tree = PackedRTree::build_from_rects(&rects, 2)?;
        let mut data = tree.to_bytes();
        // patch the offset of the last leaf
        let pos = data.len() - 8;
        data[pos..].copy_from_slice(&(1u64 << 60).to_le_bytes());
        let tree = PackedRTree::from_buf(&data[..], 2, 2)?;
        let err = tree.search(-10.0, -10.0, 10.0, 10.0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptData);

        let mut node = rects[0].clone();
        node.offset = 1 << 53;
        assert!(PackedRTree::build(&[node], &rects[0], 16).is_err());
        Ok(())
    }
}
