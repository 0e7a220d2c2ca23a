use crate::error::{Error, Result};
use crate::feature_writer::{encode_properties, FeatureWriter};
use crate::geometry::{Dimensions, Geometry};
use crate::geozero_api::GeometryCollector;
use crate::header_generated::*;
use crate::packed_r_tree::{calc_extent, hilbert_sort, NodeItem, PackedRTree};
use crate::properties_reader::ColumnValue;
use crate::MAGIC_BYTES;
use flatbuffers::FlatBufferBuilder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};

/// FlatGeobuf dataset writer
///
/// # Usage example:
///
/// ```
/// use flatgeobuf_core::*;
/// use flatgeobuf_core::geometry::{Coord, Geometry};
/// # fn write() -> flatgeobuf_core::Result<()> {
/// let mut fgb = FgbWriter::create("cities", GeometryType::Point)?;
/// fgb.add_column("name", ColumnType::String, |_, _| {});
/// fgb.add_feature(
///     Some(&Geometry::Point(Coord::xy(8.55, 47.37))),
///     &[("name", Some(ColumnValue::String("Zürich".to_string())))],
/// )?;
/// let mut out = Vec::new();
/// fgb.write(&mut out)?;
/// # Ok(())
/// # }
/// ```
pub struct FgbWriter<'a> {
    tmpout: BufWriter<File>,
    fbb: FlatBufferBuilder<'a>,
    header_args: HeaderArgs<'a>,
    columns: Vec<flatbuffers::WIPOffset<Column<'a>>>,
    pub(crate) column_defs: Vec<(String, ColumnType)>,
    pub(crate) feat_writer: FeatureWriter,
    pub(crate) collector: GeometryCollector,
    feat_offsets: Vec<FeatureOffset>,
    feat_nodes: Vec<NodeItem>,
}

/// Options for FlatGeobuf writer
#[derive(Debug)]
pub struct FgbWriterOptions<'a> {
    /// Write index over the features.
    pub write_index: bool,
    /// Branching factor of the index, at least 2.
    pub index_node_size: u16,
    /// Detect geometry type when `geometry_type` is Unknown.
    pub detect_type: bool,
    /// Convert single to multi geometries, if `geometry_type` is a multi type
    pub promote_to_multi: bool,
    /// CRS definition
    pub crs: FgbCrs<'a>,
    /// Does geometry have Z dimension?
    /// With neither `has_z` nor `has_m` set, dimensions are taken from the first geometry.
    pub has_z: bool,
    /// Does geometry have M dimension?
    pub has_m: bool,
    /// Dataset title
    pub title: Option<&'a str>,
    /// Dataset description (intended for free form long text)
    pub description: Option<&'a str>,
    /// Dataset metadata (intended to be application specific)
    pub metadata: Option<&'a str>,
}

impl Default for FgbWriterOptions<'_> {
    fn default() -> Self {
        FgbWriterOptions {
            write_index: true,
            index_node_size: PackedRTree::DEFAULT_NODE_SIZE,
            detect_type: true,
            promote_to_multi: true,
            crs: Default::default(),
            has_z: false,
            has_m: false,
            title: None,
            description: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct FgbCrs<'a> {
    /// Case-insensitive name of the defining organization e.g. EPSG or epsg (NULL = EPSG)
    pub org: Option<&'a str>,
    /// Numeric ID of the Spatial Reference System assigned by the organization (0 = unknown)
    pub code: i32,
    /// Human readable name of this SRS
    pub name: Option<&'a str>,
    /// Human readable description of this SRS
    pub description: Option<&'a str>,
    /// Well-known Text Representation of the Spatial Reference System
    pub wkt: Option<&'a str>,
    /// Text ID of the Spatial Reference System assigned by the organization in the (rare) case when it is not an integer and thus cannot be set into code
    pub code_string: Option<&'a str>,
}

impl FgbCrs<'_> {
    fn is_empty(&self) -> bool {
        self.org.is_none()
            && self.code == 0
            && self.name.is_none()
            && self.description.is_none()
            && self.wkt.is_none()
            && self.code_string.is_none()
    }
}

#[derive(Debug)]
// Offsets in temporary file
struct FeatureOffset {
    offset: usize,
    size: usize,
}

impl<'a> FgbWriter<'a> {
    /// Configure FlatGeobuf headers for creating a new file with default options
    ///
    /// # Usage example:
    ///
    /// ```
    /// # use flatgeobuf_core::*;
    /// let mut fgb = FgbWriter::create("countries", GeometryType::MultiPolygon).unwrap();
    /// ```
    pub fn create(name: &str, geometry_type: GeometryType) -> Result<Self> {
        FgbWriter::create_with_options(name, geometry_type, FgbWriterOptions::default())
    }

    /// Configure FlatGeobuf headers for creating a new file
    ///
    /// # Usage example:
    ///
    /// ```
    /// # use flatgeobuf_core::*;
    /// let mut fgb = FgbWriter::create_with_options(
    ///     "countries",
    ///     GeometryType::MultiPolygon,
    ///     FgbWriterOptions {
    ///         description: Some("Country polygons"),
    ///         write_index: false,
    ///         crs: FgbCrs {
    ///             code: 4326,
    ///             ..Default::default()
    ///         },
    ///         ..Default::default()
    ///     },
    /// )
    /// .unwrap();
    /// ```
    pub fn create_with_options(
        name: &str,
        geometry_type: GeometryType,
        options: FgbWriterOptions,
    ) -> Result<Self> {
        if geometry_type.0 > GeometryType::GeometryCollection.0 {
            return Err(Error::UnsupportedGeometry(geometry_type.0));
        }
        let index_node_size = if options.write_index {
            if options.index_node_size < 2 {
                return Err(Error::InvalidArgument(format!(
                    "index node size must be at least 2, got {}",
                    options.index_node_size
                )));
            }
            options.index_node_size
        } else {
            0
        };

        let mut fbb = FlatBufferBuilder::new();
        let crs = if options.crs.is_empty() {
            None
        } else {
            let crs_args = CrsArgs {
                org: options.crs.org.map(|v| fbb.create_string(v)),
                code: options.crs.code,
                name: options.crs.name.map(|v| fbb.create_string(v)),
                description: options.crs.description.map(|v| fbb.create_string(v)),
                wkt: options.crs.wkt.map(|v| fbb.create_string(v)),
                code_string: options.crs.code_string.map(|v| fbb.create_string(v)),
            };
            Some(Crs::create(&mut fbb, &crs_args))
        };
        let header_args = HeaderArgs {
            name: Some(fbb.create_string(name)),
            geometry_type,
            index_node_size,
            crs,
            title: options.title.map(|v| fbb.create_string(v)),
            description: options.description.map(|v| fbb.create_string(v)),
            metadata: options.metadata.map(|v| fbb.create_string(v)),
            ..Default::default()
        };

        let dims = (options.has_z || options.has_m).then_some(Dimensions {
            z: options.has_z,
            m: options.has_m,
        });
        let feat_writer = FeatureWriter::new(
            geometry_type,
            options.detect_type,
            options.promote_to_multi,
            dims,
        );

        let tmpout = BufWriter::new(tempfile::tempfile()?);

        Ok(FgbWriter {
            tmpout,
            fbb,
            header_args,
            columns: Vec::new(),
            column_defs: Vec::new(),
            collector: GeometryCollector::new(feat_writer.requested_dims()),
            feat_writer,
            feat_offsets: Vec::new(),
            feat_nodes: Vec::new(),
        })
    }

    /// Add a new column.
    ///
    /// # Usage example:
    ///
    /// ```
    /// # use flatgeobuf_core::*;
    /// # let mut fgb = FgbWriter::create("", GeometryType::Point).unwrap();
    /// fgb.add_column("fid", ColumnType::ULong, |_fbb, col| {
    ///     col.nullable = false;
    /// });
    /// ```
    pub fn add_column<F>(&mut self, name: &str, col_type: ColumnType, cfgfn: F)
    where
        F: FnOnce(&mut FlatBufferBuilder<'a>, &mut ColumnArgs),
    {
        let mut col = ColumnArgs {
            name: Some(self.fbb.create_string(name)),
            type_: col_type,
            ..Default::default()
        };
        cfgfn(&mut self.fbb, &mut col);
        self.columns.push(Column::create(&mut self.fbb, &col));
        self.column_defs.push((name.to_string(), col_type));
    }

    /// Declared columns
    pub fn columns(&self) -> impl Iterator<Item = (&str, ColumnType)> {
        self.column_defs.iter().map(|(name, t)| (name.as_str(), *t))
    }

    /// Add a new feature.
    ///
    /// Properties are matched to the declared columns by name, `None` values are omitted.
    pub fn add_feature(
        &mut self,
        geometry: Option<&Geometry>,
        properties: &[(&str, Option<ColumnValue>)],
    ) -> Result<()> {
        let columns: Vec<(&str, ColumnType)> = self.columns().collect();
        let properties = encode_properties(&columns, properties)?;
        self.feat_writer.set_geometry(geometry)?;
        self.feat_writer.set_properties(properties);
        self.write_feature()
    }

    /// Number of features added so far
    pub fn features_count(&self) -> u64 {
        self.header_args.features_count
    }

    pub(crate) fn write_feature(&mut self) -> Result<()> {
        let mut node = self.feat_writer.bbox.clone();
        let feat_buf = self.feat_writer.finish_to_feature();
        let tmpoffset = self
            .feat_offsets
            .last()
            .map(|it| it.offset + it.size)
            .unwrap_or(0);
        // Records keep insertion order, the leaf points to the record start
        node.offset = tmpoffset as u64;
        self.feat_nodes.push(node);
        self.feat_offsets.push(FeatureOffset {
            offset: tmpoffset,
            size: feat_buf.len(),
        });
        self.tmpout.write_all(&feat_buf)?;
        self.header_args.features_count += 1;
        Ok(())
    }

    /// Write the FlatGeobuf dataset
    pub fn write(mut self, mut out: impl Write) -> Result<()> {
        out.write_all(&MAGIC_BYTES)?;

        let extent = calc_extent(&self.feat_nodes);

        // Write header
        self.header_args.columns = Some(self.fbb.create_vector(&self.columns));
        if !extent.is_empty() {
            self.header_args.envelope = Some(self.fbb.create_vector(&[
                extent.min_x,
                extent.min_y,
                extent.max_x,
                extent.max_y,
            ]));
        }
        self.header_args.geometry_type = self.feat_writer.dataset_type;
        let dims = self.feat_writer.dims();
        self.header_args.has_z = dims.z;
        self.header_args.has_m = dims.m;
        let header = Header::create(&mut self.fbb, &self.header_args);
        finish_size_prefixed_header_buffer(&mut self.fbb, header);
        let buf = self.fbb.finished_data();
        out.write_all(buf)?;

        if self.header_args.index_node_size > 0 && !self.feat_nodes.is_empty() {
            info!("Hilbert sorting {} features", self.feat_nodes.len());
            hilbert_sort(&mut self.feat_nodes, &extent);
            let tree =
                PackedRTree::build(&self.feat_nodes, &extent, self.header_args.index_node_size)?;
            debug!("Writing index of {} bytes", tree.size());
            tree.stream_write(&mut out)?;
        }

        // Copy features from temp file in insertion order
        self.tmpout.rewind()?;
        let unsorted_feature_output = self.tmpout.into_inner().map_err(|e| e.into_error())?;
        let mut unsorted_feature_reader = BufReader::new(unsorted_feature_output);
        let copied = std::io::copy(&mut unsorted_feature_reader, &mut out)?;
        debug!(
            "Wrote {} features with {copied} bytes",
            self.feat_offsets.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::geometry::Coord;
    use crate::{check_magic_bytes, size_prefixed_root_as_header};

    #[test]
    fn header_fields() -> Result<()> {
        let mut fgb = FgbWriter::create_with_options(
            "roads",
            GeometryType::Unknown,
            FgbWriterOptions {
                index_node_size: 4,
                crs: FgbCrs {
                    code: 4326,
                    ..Default::default()
                },
                title: Some("Roads"),
                ..Default::default()
            },
        )?;
        fgb.add_column("lanes", ColumnType::UByte, |_, _| {});
        for i in 0..5 {
            let line = Geometry::LineString(vec![
                Coord::xy(i as f64, 0.),
                Coord::xy(i as f64 + 1., 2.),
            ]);
            fgb.add_feature(Some(&line), &[("lanes", Some(ColumnValue::UByte(2)))])?;
        }
        assert_eq!(fgb.features_count(), 5);
        let mut out = Vec::new();
        fgb.write(&mut out)?;

        assert!(check_magic_bytes(&out));
        let header = size_prefixed_root_as_header(&out[8..])?;
        assert_eq!(header.name(), Some("roads"));
        assert_eq!(header.title(), Some("Roads"));
        assert_eq!(header.geometry_type(), GeometryType::LineString);
        assert_eq!(header.features_count(), 5);
        assert_eq!(header.index_node_size(), 4);
        assert_eq!(header.crs().map(|crs| crs.code()), Some(4326));
        let envelope: Vec<f64> = header.envelope().expect("envelope").iter().collect();
        assert_eq!(envelope, vec![0., 0., 5., 2.]);
        Ok(())
    }

    #[test]
    fn dims_from_first_feature() -> Result<()> {
        let mut fgb = FgbWriter::create("p", GeometryType::Point)?;
        fgb.add_feature(Some(&Geometry::Point(Coord::xyzm(1.2, -2.1, 7., 0.5))), &[])?;
        fgb.add_feature(Some(&Geometry::Point(Coord::xyz(0., 0., 1.))), &[])?;
        fgb.add_feature(Some(&Geometry::Point(Coord::xy(0., 0.))), &[])?;
        let mut out = Vec::new();
        fgb.write(&mut out)?;
        let header = size_prefixed_root_as_header(&out[8..])?;
        assert!(header.has_z());
        assert!(header.has_m());
        Ok(())
    }

    #[test]
    fn invalid_options() {
        let err = FgbWriter::create_with_options(
            "",
            GeometryType::Point,
            FgbWriterOptions {
                index_node_size: 1,
                ..Default::default()
            },
        )
        .err()
        .expect("error");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = FgbWriter::create("", GeometryType::TIN).err().expect("error");
        assert_eq!(err.kind(), ErrorKind::UnsupportedGeometry);
    }

    #[test]
    fn empty_dataset() -> Result<()> {
        let fgb = FgbWriter::create("empty", GeometryType::Point)?;
        let mut out = Vec::new();
        fgb.write(&mut out)?;
        let header = size_prefixed_root_as_header(&out[8..])?;
        assert_eq!(header.features_count(), 0);
        assert!(header.envelope().is_none());
        let header_len = u32::from_le_bytes([out[8], out[9], out[10], out[11]]) as usize;
        assert_eq!(out.len(), 8 + 4 + header_len);
        Ok(())
    }
}
