use flatgeobuf_core::geometry::{Coord, Geometry};
use flatgeobuf_core::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn random_boxes(count: usize, seed: u64) -> Vec<NodeItem> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let x = rng.gen_range(-180.0..170.0);
            let y = rng.gen_range(-90.0..80.0);
            let w = rng.gen_range(0.0..10.0);
            let h = rng.gen_range(0.0..10.0);
            NodeItem::bounds(x, y, x + w, y + h)
        })
        .collect()
}

fn box_polygon(b: &NodeItem) -> Geometry {
    Geometry::Polygon(vec![vec![
        Coord::xy(b.min_x, b.min_y),
        Coord::xy(b.max_x, b.min_y),
        Coord::xy(b.max_x, b.max_y),
        Coord::xy(b.min_x, b.max_y),
        Coord::xy(b.min_x, b.min_y),
    ]])
}

fn write_boxes(boxes: &[NodeItem], options: FgbWriterOptions) -> Result<Vec<u8>> {
    let mut fgb = FgbWriter::create_with_options("boxes", GeometryType::Polygon, options)?;
    fgb.add_column("id", ColumnType::ULong, |_, col| {
        col.nullable = false;
    });
    for (id, b) in boxes.iter().enumerate() {
        fgb.add_feature(
            Some(&box_polygon(b)),
            &[("id", Some(ColumnValue::ULong(id as u64)))],
        )?;
    }
    let mut out = Vec::new();
    fgb.write(&mut out)?;
    Ok(out)
}

fn feature_id(feature: &FgbFeature) -> Result<u64> {
    match feature.property("id")? {
        Some(ColumnValue::ULong(id)) => Ok(id),
        other => Err(Error::CorruptData(format!("unexpected id {other:?}"))),
    }
}

fn brute_force(boxes: &[NodeItem], query: &NodeItem) -> BTreeSet<u64> {
    boxes
        .iter()
        .enumerate()
        .filter(|(_, b)| b.intersects(query))
        .map(|(id, _)| id as u64)
        .collect()
}

fn queries() -> Vec<NodeItem> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..20)
        .map(|_| {
            let x = rng.gen_range(-180.0..150.0);
            let y = rng.gen_range(-90.0..60.0);
            NodeItem::bounds(x, y, x + 30.0, y + 20.0)
        })
        .collect()
}

#[test]
fn read_file_low_level() -> Result<()> {
    let boxes = random_boxes(3, 1);
    let data = write_boxes(&boxes, FgbWriterOptions::default())?;
    let mut reader = Cursor::new(data);

    let mut magic_buf: [u8; 8] = [0; 8];
    reader.read_exact(&mut magic_buf)?;
    assert_eq!(magic_buf, [b'f', b'g', b'b', VERSION, b'f', b'g', b'b', 0]);

    let mut size_buf: [u8; 4] = [0; 4];
    reader.read_exact(&mut size_buf)?;
    let header_size = u32::from_le_bytes(size_buf) as usize;
    let mut header_buf = Vec::with_capacity(header_size + 4);
    header_buf.extend_from_slice(&size_buf);
    header_buf.resize(header_buf.capacity(), 0);
    reader.read_exact(&mut header_buf[4..])?;

    let header = size_prefixed_root_as_header(&header_buf)?;
    assert_eq!(header.name(), Some("boxes"));
    assert_eq!(header.geometry_type(), GeometryType::Polygon);
    assert!(!header.has_z());
    assert!(!header.has_m());
    assert_eq!(header.features_count(), 3);
    assert_eq!(header.index_node_size(), 16);
    let columns = header.columns().expect("columns");
    assert_eq!(columns.len(), 1);
    assert_eq!(columns.get(0).name(), "id");
    assert_eq!(columns.get(0).type_(), ColumnType::ULong);
    let mut extent = NodeItem::create(0);
    for b in &boxes {
        extent.expand(b);
    }
    let envelope: Vec<f64> = header.envelope().expect("envelope").iter().collect();
    assert_eq!(
        envelope,
        vec![extent.min_x, extent.min_y, extent.max_x, extent.max_y]
    );

    // Skip index
    let index_size = PackedRTree::index_size(3, header.index_node_size())?;
    assert_eq!(index_size, 4 * 40);
    reader.seek(SeekFrom::Current(index_size as i64))?;

    // First record is the first feature added
    reader.read_exact(&mut size_buf)?;
    let feature_size = u32::from_le_bytes(size_buf) as usize;
    let mut feature_buf = Vec::with_capacity(feature_size + 4);
    feature_buf.extend_from_slice(&size_buf);
    feature_buf.resize(feature_buf.capacity(), 0);
    reader.read_exact(&mut feature_buf[4..])?;

    let feature = size_prefixed_root_as_feature(&feature_buf)?;
    let geometry = feature.geometry().expect("geometry");
    assert_eq!(geometry.xy().expect("xy").len(), 10);
    assert!(geometry.ends().is_none());
    assert!(feature.properties().is_some());
    assert!(feature.columns().is_none());
    let props = decode_properties(
        feature.properties().expect("properties").bytes(),
        &[("id", ColumnType::ULong)],
    )?;
    assert_eq!(props, vec![("id".to_string(), ColumnValue::ULong(0))]);
    Ok(())
}

#[test]
fn read_all_in_insertion_order() -> Result<()> {
    let boxes = random_boxes(100, 2);
    let data = write_boxes(&boxes, FgbWriterOptions::default())?;
    let mut cursor = Cursor::new(data);
    let mut fgb = FgbReader::open(&mut cursor)?.select_all()?;
    assert_eq!(fgb.features_count(), 100);
    let mut ids = Vec::new();
    while let Some(feature) = fgb.next()? {
        ids.push(feature_id(feature)?);
    }
    assert_eq!(ids, (0..100).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn iteration_stops_after_last_hit() -> Result<()> {
    let boxes = random_boxes(50, 5);
    let data = write_boxes(&boxes, FgbWriterOptions::default())?;
    let query = queries().remove(0);
    let expected = brute_force(&boxes, &query).len();
    let mut cursor = Cursor::new(&data);
    let mut fgb = FgbReader::open(&mut cursor)?.select_bbox(
        query.min_x,
        query.min_y,
        query.max_x,
        query.max_y,
    )?;
    assert_eq!(fgb.features_count(), expected);
    assert_eq!(fgb.size_hint(), (expected, Some(expected)));
    let mut seen = 0;
    while fgb.next()?.is_some() {
        seen += 1;
        assert_eq!(fgb.size_hint().0, expected - seen);
    }
    assert_eq!(seen, expected);
    assert!(fgb.next()?.is_none());
    assert!(fgb.get().is_none());
    Ok(())
}

#[test]
fn bbox_matches_brute_force() -> Result<()> {
    init_logger();
    let boxes = random_boxes(1000, 3);
    for node_size in [2, 4, 16] {
        let options = FgbWriterOptions {
            index_node_size: node_size,
            ..Default::default()
        };
        let data = write_boxes(&boxes, options)?;
        for query in queries() {
            let mut cursor = Cursor::new(&data);
            let mut fgb = FgbReader::open(&mut cursor)?.select_bbox(
                query.min_x,
                query.min_y,
                query.max_x,
                query.max_y,
            )?;
            let mut found = BTreeSet::new();
            while let Some(feature) = fgb.next()? {
                assert!(found.insert(feature_id(feature)?), "duplicate hit");
            }
            assert_eq!(found, brute_force(&boxes, &query), "node size {node_size}");
        }
    }
    Ok(())
}

#[test]
fn sequential_bbox_in_file_order() -> Result<()> {
    let boxes = random_boxes(500, 4);
    let data = write_boxes(&boxes, FgbWriterOptions::default())?;
    for query in queries() {
        let mut reader = data.as_slice();
        let mut fgb = FgbSequentialReader::open(&mut reader)?.select_bbox(
            query.min_x,
            query.min_y,
            query.max_x,
            query.max_y,
        )?;
        let mut ids = Vec::new();
        while let Some(feature) = fgb.next()? {
            ids.push(feature_id(feature)?);
        }
        let expected: Vec<u64> = brute_force(&boxes, &query).into_iter().collect();
        assert_eq!(ids, expected);
    }
    Ok(())
}

#[test]
fn sequential_read_all() -> Result<()> {
    let boxes = random_boxes(50, 5);
    let data = write_boxes(&boxes, FgbWriterOptions::default())?;
    let mut reader = data.as_slice();
    let mut fgb = FgbSequentialReader::open(&mut reader)?.select_all()?;
    assert_eq!(fgb.features_count(), Some(50));
    let mut count = 0;
    while let Some(feature) = fgb.next()? {
        assert_eq!(feature_id(feature)?, count);
        assert_eq!(
            feature.geometry()?,
            Some(box_polygon(&boxes[count as usize]))
        );
        count += 1;
    }
    assert_eq!(count, 50);
    Ok(())
}

#[test]
fn bbox_without_index() -> Result<()> {
    let boxes = random_boxes(10, 6);
    let options = FgbWriterOptions {
        write_index: false,
        ..Default::default()
    };
    let data = write_boxes(&boxes, options)?;

    let mut cursor = Cursor::new(&data);
    let fgb = FgbReader::open(&mut cursor)?;
    assert_eq!(fgb.header().index_node_size(), 0);
    assert!(matches!(
        fgb.select_bbox(-180.0, -90.0, 180.0, 90.0),
        Err(Error::NoIndex)
    ));

    let mut reader = data.as_slice();
    let fgb = FgbSequentialReader::open(&mut reader)?;
    assert!(matches!(
        fgb.select_bbox(-180.0, -90.0, 180.0, 90.0),
        Err(Error::NoIndex)
    ));

    // Features directly follow the header
    let mut cursor = Cursor::new(&data);
    let mut fgb = FgbReader::open(&mut cursor)?.select_all()?;
    let mut count = 0;
    while fgb.next()?.is_some() {
        count += 1;
    }
    assert_eq!(count, 10);
    Ok(())
}

#[test]
fn empty_dataset() -> Result<()> {
    let data = write_boxes(&[], FgbWriterOptions::default())?;
    let mut cursor = Cursor::new(&data);
    let mut fgb = FgbReader::open(&mut cursor)?.select_bbox(0.0, 0.0, 1.0, 1.0)?;
    assert!(fgb.next()?.is_none());

    let mut reader = data.as_slice();
    let mut fgb = FgbSequentialReader::open(&mut reader)?.select_all()?;
    assert!(fgb.next()?.is_none());
    Ok(())
}

#[test]
fn corrupt_magic() {
    let mut data = write_boxes(&random_boxes(2, 8), FgbWriterOptions::default()).unwrap();
    data[3] = VERSION + 1;
    let mut cursor = Cursor::new(&data);
    assert!(matches!(
        FgbReader::open(&mut cursor),
        Err(Error::MissingMagicBytes)
    ));

    let mut reader: &[u8] = b"not a flatgeobuf file";
    let err = FgbSequentialReader::open(&mut reader).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidFormat);
}

#[test]
fn illegal_header_size() {
    let mut data = MAGIC_BYTES.to_vec();
    data.extend_from_slice(&4u32.to_le_bytes());
    data.extend_from_slice(&[0; 16]);
    let mut cursor = Cursor::new(&data);
    assert!(matches!(
        FgbReader::open(&mut cursor),
        Err(Error::IllegalHeaderSize(4))
    ));
}

#[test]
fn truncated_feature() -> Result<()> {
    let mut data = write_boxes(&random_boxes(5, 9), FgbWriterOptions::default())?;
    data.truncate(data.len() - 10);
    let mut cursor = Cursor::new(&data);
    let mut fgb = FgbReader::open(&mut cursor)?.select_all()?;
    let mut result = Ok(());
    loop {
        match fgb.next() {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn async_matches_sync() -> Result<()> {
    init_logger();
    let boxes = random_boxes(1000, 10);
    let data = write_boxes(&boxes, FgbWriterOptions::default())?;
    for query in queries() {
        let mut source = bytes::Bytes::from(data.clone());
        let mut fgb = AsyncFgbReader::open(&mut source)
            .await?
            .select_bbox(
                query.min_x,
                query.min_y,
                query.max_x,
                query.max_y,
                SearchOptions::default(),
            )
            .await?;
        let mut found = BTreeSet::new();
        while let Some(feature) = fgb.next().await? {
            found.insert(feature_id(feature)?);
        }
        assert_eq!(found, brute_force(&boxes, &query));
    }
    Ok(())
}

#[tokio::test]
async fn async_select_all() -> Result<()> {
    let boxes = random_boxes(30, 11);
    let mut source = bytes::Bytes::from(write_boxes(&boxes, FgbWriterOptions::default())?);
    let mut fgb = AsyncFgbReader::open(&mut source).await?.select_all().await?;
    assert_eq!(fgb.features_count(), Some(30));
    let mut ids = Vec::new();
    while let Some(feature) = fgb.next().await? {
        ids.push(feature_id(feature)?);
    }
    assert_eq!(ids, (0..30).collect::<Vec<_>>());
    Ok(())
}

#[test]
#[ignore = "needs test/data/UScounties.fgb"]
fn county_bbox() -> Result<()> {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/test/data/UScounties.fgb");
    let mut filein = BufReader::new(File::open(path)?);
    let mut fgb = FgbReader::open(&mut filein)?.select_bbox(-106.88, 36.75, -101.11, 41.24)?;
    let mut names = Vec::new();
    while let Some(feature) = fgb.next()? {
        let name = feature.property("NAME")?;
        let state = feature.property("STATE")?;
        if let (Some(ColumnValue::String(name)), Some(ColumnValue::String(state))) = (name, state)
        {
            names.push(format!("{name}, {state}"));
        }
    }
    assert_eq!(names.len(), 86);
    assert_eq!(
        names[..4],
        ["Texas, OK", "Cimarron, OK", "Taos, NM", "Colfax, NM"]
    );
    Ok(())
}
