//! [geozero] integration: features and geometries as geozero sources, the writer as
//! geozero sink.

use crate::error::Error;
use crate::geometry::{Coord, Dimensions, Geometry};
use crate::header_generated::{ColumnType, GeometryType};
use crate::properties_reader::{scan_properties, ColumnValue, FgbFeature};
use crate::FgbWriter;
use geozero::error::{GeozeroError, Result};
use geozero::{
    CoordDimensions, FeatureProcessor, GeomProcessor, GeozeroDatasource, GeozeroGeometry,
    PropertyProcessor,
};

/// Open geometry while collecting geozero events
#[derive(Debug)]
enum Frame {
    Point(Option<Coord>),
    MultiPoint(Vec<Coord>),
    LineString { tagged: bool, coords: Vec<Coord> },
    MultiLineString(Vec<Vec<Coord>>),
    Polygon { tagged: bool, rings: Vec<Vec<Coord>> },
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
    Collection(Vec<Geometry>),
}

/// Builds a [Geometry] from geozero geometry events.
///
/// ```
/// use flatgeobuf_core::GeometryCollector;
/// use flatgeobuf_core::geometry::{Coord, Geometry};
/// use geozero::geojson::GeoJson;
/// use geozero::GeozeroGeometry;
/// # fn collect() -> flatgeobuf_core::Result<()> {
/// let mut collector = GeometryCollector::default();
/// GeoJson(r#"{"type": "Point", "coordinates": [1, 2]}"#).process_geom(&mut collector)?;
/// assert_eq!(collector.take()?, Some(Geometry::Point(Coord::xy(1.0, 2.0))));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct GeometryCollector {
    dims: Dimensions,
    stack: Vec<Frame>,
    geometry: Option<Geometry>,
}

fn unexpected(event: &str) -> GeozeroError {
    GeozeroError::Geometry(format!("unexpected {event}"))
}

impl GeometryCollector {
    /// Collector requesting z and m as given by `dims`
    pub fn new(dims: Dimensions) -> Self {
        GeometryCollector {
            dims,
            ..Default::default()
        }
    }

    /// Completed geometry, `None` if no geometry or an empty one was processed.
    /// Resets the collector.
    pub fn take(&mut self) -> crate::Result<Option<Geometry>> {
        let open = self.stack.len();
        self.stack.clear();
        let geometry = self.geometry.take();
        if open > 0 {
            return Err(Error::InvalidArgument(format!("{open} geometries not closed")));
        }
        Ok(geometry)
    }

    fn push_coord(&mut self, coord: Coord) -> Result<()> {
        match self.stack.last_mut() {
            Some(Frame::Point(point)) => *point = Some(coord),
            Some(Frame::MultiPoint(coords)) | Some(Frame::LineString { coords, .. }) => {
                coords.push(coord)
            }
            _ => return Err(unexpected("coordinate")),
        }
        Ok(())
    }

    fn pop(&mut self, event: &str) -> Result<Frame> {
        self.stack.pop().ok_or_else(|| unexpected(event))
    }

    /// Hand a complete geometry to the enclosing collection or make it the result
    fn finish(&mut self, geometry: Geometry) -> Result<()> {
        match self.stack.last_mut() {
            Some(Frame::Collection(parts)) => parts.push(geometry),
            Some(_) => return Err(unexpected("geometry inside a non-collection")),
            None if self.geometry.is_some() => {
                return Err(GeozeroError::Geometry(
                    "more than one geometry per feature".to_string(),
                ))
            }
            None => self.geometry = Some(geometry),
        }
        Ok(())
    }
}

impl GeomProcessor for GeometryCollector {
    fn dimensions(&self) -> CoordDimensions {
        CoordDimensions {
            z: self.dims.z,
            m: self.dims.m,
            t: false,
            tm: false,
        }
    }
    fn xy(&mut self, x: f64, y: f64, _idx: usize) -> Result<()> {
        self.push_coord(Coord::xy(x, y))
    }
    fn coordinate(
        &mut self,
        x: f64,
        y: f64,
        z: Option<f64>,
        m: Option<f64>,
        _t: Option<f64>,
        _tm: Option<u64>,
        _idx: usize,
    ) -> Result<()> {
        self.push_coord(Coord { x, y, z, m })
    }
    fn empty_point(&mut self, _idx: usize) -> Result<()> {
        match self.stack.last() {
            None | Some(Frame::Collection(_)) | Some(Frame::MultiPoint(_)) => Ok(()),
            Some(_) => Err(unexpected("empty point")),
        }
    }
    fn point_begin(&mut self, _idx: usize) -> Result<()> {
        self.stack.push(Frame::Point(None));
        Ok(())
    }
    fn point_end(&mut self, _idx: usize) -> Result<()> {
        match self.pop("point end")? {
            Frame::Point(Some(coord)) => self.finish(Geometry::Point(coord)),
            Frame::Point(None) => Ok(()),
            _ => Err(unexpected("point end")),
        }
    }
    fn multipoint_begin(&mut self, size: usize, _idx: usize) -> Result<()> {
        self.stack.push(Frame::MultiPoint(Vec::with_capacity(size)));
        Ok(())
    }
    fn multipoint_end(&mut self, _idx: usize) -> Result<()> {
        match self.pop("multipoint end")? {
            Frame::MultiPoint(coords) => self.finish(Geometry::MultiPoint(coords)),
            _ => Err(unexpected("multipoint end")),
        }
    }
    fn linestring_begin(&mut self, tagged: bool, size: usize, _idx: usize) -> Result<()> {
        self.stack.push(Frame::LineString {
            tagged,
            coords: Vec::with_capacity(size),
        });
        Ok(())
    }
    fn linestring_end(&mut self, _tagged: bool, _idx: usize) -> Result<()> {
        let Frame::LineString { tagged, coords } = self.pop("linestring end")? else {
            return Err(unexpected("linestring end"));
        };
        if tagged {
            return self.finish(Geometry::LineString(coords));
        }
        match self.stack.last_mut() {
            Some(Frame::MultiLineString(lines)) | Some(Frame::Polygon { rings: lines, .. }) => {
                lines.push(coords);
                Ok(())
            }
            _ => Err(unexpected("untagged linestring")),
        }
    }
    fn multilinestring_begin(&mut self, size: usize, _idx: usize) -> Result<()> {
        self.stack.push(Frame::MultiLineString(Vec::with_capacity(size)));
        Ok(())
    }
    fn multilinestring_end(&mut self, _idx: usize) -> Result<()> {
        match self.pop("multilinestring end")? {
            Frame::MultiLineString(lines) => self.finish(Geometry::MultiLineString(lines)),
            _ => Err(unexpected("multilinestring end")),
        }
    }
    fn polygon_begin(&mut self, tagged: bool, size: usize, _idx: usize) -> Result<()> {
        self.stack.push(Frame::Polygon {
            tagged,
            rings: Vec::with_capacity(size),
        });
        Ok(())
    }
    fn polygon_end(&mut self, _tagged: bool, _idx: usize) -> Result<()> {
        let Frame::Polygon { tagged, rings } = self.pop("polygon end")? else {
            return Err(unexpected("polygon end"));
        };
        if tagged {
            return self.finish(Geometry::Polygon(rings));
        }
        match self.stack.last_mut() {
            Some(Frame::MultiPolygon(polygons)) => {
                polygons.push(rings);
                Ok(())
            }
            _ => Err(unexpected("untagged polygon")),
        }
    }
    fn multipolygon_begin(&mut self, size: usize, _idx: usize) -> Result<()> {
        self.stack.push(Frame::MultiPolygon(Vec::with_capacity(size)));
        Ok(())
    }
    fn multipolygon_end(&mut self, _idx: usize) -> Result<()> {
        match self.pop("multipolygon end")? {
            Frame::MultiPolygon(polygons) => self.finish(Geometry::MultiPolygon(polygons)),
            _ => Err(unexpected("multipolygon end")),
        }
    }
    fn geometrycollection_begin(&mut self, size: usize, _idx: usize) -> Result<()> {
        self.stack.push(Frame::Collection(Vec::with_capacity(size)));
        Ok(())
    }
    fn geometrycollection_end(&mut self, _idx: usize) -> Result<()> {
        match self.pop("geometrycollection end")? {
            Frame::Collection(parts) => self.finish(Geometry::GeometryCollection(parts)),
            _ => Err(unexpected("geometrycollection end")),
        }
    }
    fn circularstring_begin(&mut self, _size: usize, _idx: usize) -> Result<()> {
        Err(Error::UnsupportedGeometry(GeometryType::CircularString.0).into())
    }
    fn compoundcurve_begin(&mut self, _size: usize, _idx: usize) -> Result<()> {
        Err(Error::UnsupportedGeometry(GeometryType::CompoundCurve.0).into())
    }
    fn curvepolygon_begin(&mut self, _size: usize, _idx: usize) -> Result<()> {
        Err(Error::UnsupportedGeometry(GeometryType::CurvePolygon.0).into())
    }
    fn multicurve_begin(&mut self, _size: usize, _idx: usize) -> Result<()> {
        Err(Error::UnsupportedGeometry(GeometryType::MultiCurve.0).into())
    }
    fn multisurface_begin(&mut self, _size: usize, _idx: usize) -> Result<()> {
        Err(Error::UnsupportedGeometry(GeometryType::MultiSurface.0).into())
    }
    fn triangle_begin(&mut self, _tagged: bool, _size: usize, _idx: usize) -> Result<()> {
        Err(Error::UnsupportedGeometry(GeometryType::Triangle.0).into())
    }
    fn polyhedralsurface_begin(&mut self, _size: usize, _idx: usize) -> Result<()> {
        Err(Error::UnsupportedGeometry(GeometryType::PolyhedralSurface.0).into())
    }
    fn tin_begin(&mut self, _size: usize, _idx: usize) -> Result<()> {
        Err(Error::UnsupportedGeometry(GeometryType::TIN.0).into())
    }
}

fn process_coord<P: GeomProcessor>(coord: &Coord, idx: usize, processor: &mut P) -> Result<()> {
    if processor.multi_dim() {
        let dims = processor.dimensions();
        processor.coordinate(
            coord.x,
            coord.y,
            coord.z.filter(|_| dims.z),
            coord.m.filter(|_| dims.m),
            None,
            None,
            idx,
        )
    } else {
        processor.xy(coord.x, coord.y, idx)
    }
}

fn process_line<P: GeomProcessor>(
    coords: &[Coord],
    tagged: bool,
    idx: usize,
    processor: &mut P,
) -> Result<()> {
    processor.linestring_begin(tagged, coords.len(), idx)?;
    for (i, coord) in coords.iter().enumerate() {
        process_coord(coord, i, processor)?;
    }
    processor.linestring_end(tagged, idx)
}

fn process_polygon<P: GeomProcessor>(
    rings: &[Vec<Coord>],
    tagged: bool,
    idx: usize,
    processor: &mut P,
) -> Result<()> {
    processor.polygon_begin(tagged, rings.len(), idx)?;
    for (i, ring) in rings.iter().enumerate() {
        process_line(ring, false, i, processor)?;
    }
    processor.polygon_end(tagged, idx)
}

/// Emit `geometry` as geozero events. Collection members are tagged, parts of
/// multi geometries and polygon rings are not.
pub(crate) fn process_geometry<P: GeomProcessor>(
    geometry: &Geometry,
    idx: usize,
    processor: &mut P,
) -> Result<()> {
    match geometry {
        Geometry::Point(coord) => {
            processor.point_begin(idx)?;
            process_coord(coord, 0, processor)?;
            processor.point_end(idx)
        }
        Geometry::MultiPoint(coords) => {
            processor.multipoint_begin(coords.len(), idx)?;
            for (i, coord) in coords.iter().enumerate() {
                process_coord(coord, i, processor)?;
            }
            processor.multipoint_end(idx)
        }
        Geometry::LineString(coords) => process_line(coords, true, idx, processor),
        Geometry::MultiLineString(lines) => {
            processor.multilinestring_begin(lines.len(), idx)?;
            for (i, line) in lines.iter().enumerate() {
                process_line(line, false, i, processor)?;
            }
            processor.multilinestring_end(idx)
        }
        Geometry::Polygon(rings) => process_polygon(rings, true, idx, processor),
        Geometry::MultiPolygon(polygons) => {
            processor.multipolygon_begin(polygons.len(), idx)?;
            for (i, rings) in polygons.iter().enumerate() {
                process_polygon(rings, false, i, processor)?;
            }
            processor.multipolygon_end(idx)
        }
        Geometry::GeometryCollection(parts) => {
            processor.geometrycollection_begin(parts.len(), idx)?;
            for (i, part) in parts.iter().enumerate() {
                process_geometry(part, i, processor)?;
            }
            processor.geometrycollection_end(idx)
        }
    }
}

impl GeozeroGeometry for Geometry {
    fn process_geom<P: GeomProcessor>(&self, processor: &mut P) -> Result<()> {
        process_geometry(self, 0, processor)
    }
}

impl geozero::FeatureAccess for FgbFeature {}

impl GeozeroGeometry for FgbFeature {
    /// Process the decoded geometry, nothing for features without geometry.
    fn process_geom<P: GeomProcessor>(&self, processor: &mut P) -> Result<()> {
        match self.geometry()? {
            Some(geometry) => process_geometry(&geometry, 0, processor),
            None => Ok(()),
        }
    }
    fn dims(&self) -> CoordDimensions {
        let header = self.header();
        CoordDimensions {
            z: header.has_z(),
            m: header.has_m(),
            t: false,
            tm: false,
        }
    }
}

impl geozero::FeatureProperties for FgbFeature {
    /// Process feature properties in stored order.
    fn process_properties<P: PropertyProcessor>(&self, processor: &mut P) -> Result<bool> {
        let Some(blob) = self.fbs_feature().properties() else {
            return Ok(false);
        };
        let columns = self.columns();
        let column_types: Vec<ColumnType> = columns.iter().map(|(_, t)| *t).collect();
        let finish = scan_properties(blob.bytes(), &column_types, |i, value| {
            Ok(processor.property(i, columns[i].0, &value)?)
        })?;
        Ok(finish)
    }
}

impl FgbWriter<'_> {
    /// Add a new feature from a `GeozeroGeometry`.
    ///
    /// # Usage example:
    ///
    /// ```
    /// # use flatgeobuf_core::*;
    /// use geozero::geojson::GeoJson;
    /// # fn add() -> flatgeobuf_core::Result<()> {
    /// let mut fgb = FgbWriter::create("", GeometryType::Point)?;
    /// fgb.add_column("fid", ColumnType::ULong, |_, _| {});
    /// let geom = GeoJson(r#"{"type": "Point", "coordinates": [1, 1]}"#);
    /// fgb.add_feature_geom(geom, &[("fid", Some(ColumnValue::ULong(43)))])?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn add_feature_geom(
        &mut self,
        geom: impl GeozeroGeometry,
        properties: &[(&str, Option<ColumnValue>)],
    ) -> crate::Result<()> {
        self.collector = GeometryCollector::new(self.feat_writer.requested_dims());
        geom.process_geom(&mut self.collector)?;
        let geometry = self.collector.take()?;
        self.add_feature(geometry.as_ref(), properties)
    }

    /// Add all features of a geozero datasource.
    ///
    /// Properties not declared with [FgbWriter::add_column] are declared on first use,
    /// typed after their first value.
    pub fn add_datasource(&mut self, mut datasource: impl GeozeroDatasource) -> crate::Result<()> {
        datasource.process(self)?;
        Ok(())
    }
}

impl FeatureProcessor for FgbWriter<'_> {
    fn feature_begin(&mut self, _idx: u64) -> Result<()> {
        self.feat_writer.reset();
        self.collector = GeometryCollector::new(self.feat_writer.requested_dims());
        Ok(())
    }
    fn feature_end(&mut self, _idx: u64) -> Result<()> {
        let geometry = self.collector.take()?;
        self.feat_writer.set_geometry(geometry.as_ref())?;
        self.write_feature()?;
        Ok(())
    }
}

impl PropertyProcessor for FgbWriter<'_> {
    fn property(
        &mut self,
        _i: usize,
        colname: &str,
        colval: &geozero::ColumnValue,
    ) -> Result<bool> {
        let value = ColumnValue::from(colval);
        let index = match self.column_defs.iter().position(|(name, _)| name == colname) {
            Some(index) => index,
            None => {
                info!("Undefined property `{colname}` - adding column declaration");
                self.add_column(colname, value.column_type(), |_, _| {});
                self.column_defs.len() - 1
            }
        };
        let column_type = self.column_defs[index].1;
        self.feat_writer.push_property(index, column_type, &value)?;
        Ok(false)
    }
}

// Delegate GeomProcessor to self.collector
impl GeomProcessor for FgbWriter<'_> {
    fn dimensions(&self) -> CoordDimensions {
        self.collector.dimensions()
    }
    fn xy(&mut self, x: f64, y: f64, idx: usize) -> Result<()> {
        self.collector.xy(x, y, idx)
    }
    fn coordinate(
        &mut self,
        x: f64,
        y: f64,
        z: Option<f64>,
        m: Option<f64>,
        t: Option<f64>,
        tm: Option<u64>,
        idx: usize,
    ) -> Result<()> {
        self.collector.coordinate(x, y, z, m, t, tm, idx)
    }
    fn empty_point(&mut self, idx: usize) -> Result<()> {
        self.collector.empty_point(idx)
    }
    fn point_begin(&mut self, idx: usize) -> Result<()> {
        self.collector.point_begin(idx)
    }
    fn point_end(&mut self, idx: usize) -> Result<()> {
        self.collector.point_end(idx)
    }
    fn multipoint_begin(&mut self, size: usize, idx: usize) -> Result<()> {
        self.collector.multipoint_begin(size, idx)
    }
    fn multipoint_end(&mut self, idx: usize) -> Result<()> {
        self.collector.multipoint_end(idx)
    }
    fn linestring_begin(&mut self, tagged: bool, size: usize, idx: usize) -> Result<()> {
        self.collector.linestring_begin(tagged, size, idx)
    }
    fn linestring_end(&mut self, tagged: bool, idx: usize) -> Result<()> {
        self.collector.linestring_end(tagged, idx)
    }
    fn multilinestring_begin(&mut self, size: usize, idx: usize) -> Result<()> {
        self.collector.multilinestring_begin(size, idx)
    }
    fn multilinestring_end(&mut self, idx: usize) -> Result<()> {
        self.collector.multilinestring_end(idx)
    }
    fn polygon_begin(&mut self, tagged: bool, size: usize, idx: usize) -> Result<()> {
        self.collector.polygon_begin(tagged, size, idx)
    }
    fn polygon_end(&mut self, tagged: bool, idx: usize) -> Result<()> {
        self.collector.polygon_end(tagged, idx)
    }
    fn multipolygon_begin(&mut self, size: usize, idx: usize) -> Result<()> {
        self.collector.multipolygon_begin(size, idx)
    }
    fn multipolygon_end(&mut self, idx: usize) -> Result<()> {
        self.collector.multipolygon_end(idx)
    }
    fn geometrycollection_begin(&mut self, size: usize, idx: usize) -> Result<()> {
        self.collector.geometrycollection_begin(size, idx)
    }
    fn geometrycollection_end(&mut self, idx: usize) -> Result<()> {
        self.collector.geometrycollection_end(idx)
    }
    fn circularstring_begin(&mut self, size: usize, idx: usize) -> Result<()> {
        self.collector.circularstring_begin(size, idx)
    }
    fn compoundcurve_begin(&mut self, size: usize, idx: usize) -> Result<()> {
        self.collector.compoundcurve_begin(size, idx)
    }
    fn curvepolygon_begin(&mut self, size: usize, idx: usize) -> Result<()> {
        self.collector.curvepolygon_begin(size, idx)
    }
    fn multicurve_begin(&mut self, size: usize, idx: usize) -> Result<()> {
        self.collector.multicurve_begin(size, idx)
    }
    fn multisurface_begin(&mut self, size: usize, idx: usize) -> Result<()> {
        self.collector.multisurface_begin(size, idx)
    }
    fn triangle_begin(&mut self, tagged: bool, size: usize, idx: usize) -> Result<()> {
        self.collector.triangle_begin(tagged, size, idx)
    }
    fn polyhedralsurface_begin(&mut self, size: usize, idx: usize) -> Result<()> {
        self.collector.polyhedralsurface_begin(size, idx)
    }
    fn tin_begin(&mut self, size: usize, idx: usize) -> Result<()> {
        self.collector.tin_begin(size, idx)
    }
}
