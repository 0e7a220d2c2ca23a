//! Geometry model and its flat array encoding.
//!
//! [Geometry] is a closed tree of coordinates. [FlatGeometry] is the same shape as
//! stored in a feature record: interleaved `xy` ordinates, optional `z`/`m` arrays,
//! cumulative coordinate counts in `ends` for multi ring/part shapes and nested
//! `parts` for multi polygons and collections.

use crate::error::{Error, Result};
use crate::header_generated::GeometryType;
use crate::packed_r_tree::NodeItem;

/// A position with optional height and measure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub m: Option<f64>,
}

impl Coord {
    pub fn xy(x: f64, y: f64) -> Self {
        Coord {
            x,
            y,
            z: None,
            m: None,
        }
    }

    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Coord {
            x,
            y,
            z: Some(z),
            m: None,
        }
    }

    pub fn xym(x: f64, y: f64, m: f64) -> Self {
        Coord {
            x,
            y,
            z: None,
            m: Some(m),
        }
    }

    pub fn xyzm(x: f64, y: f64, z: f64, m: f64) -> Self {
        Coord {
            x,
            y,
            z: Some(z),
            m: Some(m),
        }
    }
}

/// Ordinates stored in addition to x and y. Fixed for all features of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dimensions {
    /// height
    pub z: bool,
    /// measurement
    pub m: bool,
}

impl Dimensions {
    pub const XY: Dimensions = Dimensions { z: false, m: false };
    pub const XYZ: Dimensions = Dimensions { z: true, m: false };
    pub const XYM: Dimensions = Dimensions { z: false, m: true };
    pub const XYZM: Dimensions = Dimensions { z: true, m: true };
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coord),
    MultiPoint(Vec<Coord>),
    LineString(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    /// Rings, the first one is the shell, the others are holes
    Polygon(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
    GeometryCollection(Vec<Geometry>),
}

impl Geometry {
    pub fn geometry_type(&self) -> GeometryType {
        match self {
            Geometry::Point(_) => GeometryType::Point,
            Geometry::MultiPoint(_) => GeometryType::MultiPoint,
            Geometry::LineString(_) => GeometryType::LineString,
            Geometry::MultiLineString(_) => GeometryType::MultiLineString,
            Geometry::Polygon(_) => GeometryType::Polygon,
            Geometry::MultiPolygon(_) => GeometryType::MultiPolygon,
            Geometry::GeometryCollection(_) => GeometryType::GeometryCollection,
        }
    }

    /// Wrap single geometries into their multi counterpart
    pub fn into_multi(self) -> Geometry {
        match self {
            Geometry::Point(coord) => Geometry::MultiPoint(vec![coord]),
            Geometry::LineString(line) => Geometry::MultiLineString(vec![line]),
            Geometry::Polygon(rings) => Geometry::MultiPolygon(vec![rings]),
            other => other,
        }
    }

    /// Bounding box of all coordinates, `None` for empty geometries
    pub fn bbox(&self) -> Option<NodeItem> {
        let mut bbox = NodeItem::create(0);
        self.visit_coords(&mut |c| bbox.expand_xy(c.x, c.y));
        (!bbox.is_empty()).then_some(bbox)
    }

    /// Ordinates present in any coordinate
    pub fn dims(&self) -> Dimensions {
        let mut dims = Dimensions::XY;
        self.visit_coords(&mut |c| {
            dims.z |= c.z.is_some();
            dims.m |= c.m.is_some();
        });
        dims
    }

    fn visit_coords(&self, f: &mut impl FnMut(&Coord)) {
        match self {
            Geometry::Point(c) => f(c),
            Geometry::MultiPoint(coords) | Geometry::LineString(coords) => {
                coords.iter().for_each(f)
            }
            Geometry::MultiLineString(lines) | Geometry::Polygon(lines) => {
                lines.iter().flatten().for_each(f)
            }
            Geometry::MultiPolygon(polygons) => polygons.iter().flatten().flatten().for_each(f),
            Geometry::GeometryCollection(parts) => {
                for part in parts {
                    part.visit_coords(f);
                }
            }
        }
    }
}

/// Geometry as flat arrays, one node of the stored geometry table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlatGeometry {
    pub geometry_type: GeometryType,
    /// Interleaved x,y ordinates
    pub xy: Vec<f64>,
    pub z: Option<Vec<f64>>,
    pub m: Option<Vec<f64>>,
    /// Cumulative coordinate count at the end of each ring or line, only with more than one
    pub ends: Option<Vec<u32>>,
    pub parts: Vec<FlatGeometry>,
}

impl FlatGeometry {
    /// Flatten `geometry`, writing the ordinates requested by `dims`.
    /// Missing z or m values are stored as NaN.
    pub fn from_geometry(geometry: &Geometry, dims: Dimensions) -> Result<FlatGeometry> {
        let mut flat = FlatGeometry {
            geometry_type: geometry.geometry_type(),
            z: dims.z.then(Vec::new),
            m: dims.m.then(Vec::new),
            ..Default::default()
        };
        match geometry {
            Geometry::Point(coord) => flat.push_coords(std::slice::from_ref(coord))?,
            Geometry::MultiPoint(coords) | Geometry::LineString(coords) => {
                flat.push_coords(coords)?
            }
            Geometry::MultiLineString(lines) | Geometry::Polygon(lines) => {
                flat.push_lines(lines)?
            }
            Geometry::MultiPolygon(polygons) => {
                flat.z = None;
                flat.m = None;
                for rings in polygons {
                    let mut part = FlatGeometry {
                        geometry_type: GeometryType::Polygon,
                        z: dims.z.then(Vec::new),
                        m: dims.m.then(Vec::new),
                        ..Default::default()
                    };
                    part.push_lines(rings)?;
                    flat.parts.push(part);
                }
            }
            Geometry::GeometryCollection(parts) => {
                flat.z = None;
                flat.m = None;
                for part in parts {
                    flat.parts.push(FlatGeometry::from_geometry(part, dims)?);
                }
            }
        }
        Ok(flat)
    }

    fn push_coords(&mut self, coords: &[Coord]) -> Result<()> {
        for c in coords {
            self.xy.push(c.x);
            self.xy.push(c.y);
            if let Some(z) = &mut self.z {
                z.push(c.z.unwrap_or(f64::NAN));
            }
            if let Some(m) = &mut self.m {
                m.push(c.m.unwrap_or(f64::NAN));
            }
        }
        if self.xy.len() / 2 > u32::MAX as usize {
            return Err(Error::InvalidArgument(
                "too many coordinates in one geometry".to_string(),
            ));
        }
        Ok(())
    }

    fn push_lines(&mut self, lines: &[Vec<Coord>]) -> Result<()> {
        let mut ends = Vec::with_capacity(lines.len());
        for line in lines {
            self.push_coords(line)?;
            ends.push((self.xy.len() / 2) as u32);
        }
        if ends.len() > 1 {
            self.ends = Some(ends);
        }
        Ok(())
    }

    /// Number of coordinates in `xy`
    pub fn num_coords(&self) -> usize {
        self.xy.len() / 2
    }

    /// Ordinate count per ring or line, scaled by the two xy ordinates per coordinate
    pub fn ring_lengths(&self) -> Vec<usize> {
        match &self.ends {
            Some(ends) => {
                let mut start = 0;
                ends.iter()
                    .map(|end| {
                        let len = (*end as usize).saturating_sub(start) * 2;
                        start = *end as usize;
                        len
                    })
                    .collect()
            }
            None if self.xy.is_empty() => Vec::new(),
            None => vec![self.xy.len()],
        }
    }

    /// True if neither coordinates nor parts are stored
    pub fn is_empty(&self) -> bool {
        self.xy.is_empty() && self.parts.is_empty()
    }

    /// Bounding box of all coordinates including parts
    pub fn bbox(&self) -> NodeItem {
        let mut bbox = NodeItem::create(0);
        for xy in self.xy.chunks_exact(2) {
            bbox.expand_xy(xy[0], xy[1]);
        }
        for part in &self.parts {
            bbox.expand(&part.bbox());
        }
        bbox
    }

    /// Rebuild the geometry tree.
    ///
    /// `geometry_type` is the dataset type; with `Unknown` the stored type of the
    /// geometry is used. Empty geometries decode to `None`.
    pub fn to_geometry(&self, geometry_type: GeometryType) -> Result<Option<Geometry>> {
        let geometry_type = if geometry_type == GeometryType::Unknown {
            self.geometry_type
        } else {
            geometry_type
        };
        if self.is_empty() {
            return Ok(None);
        }
        let geometry = match geometry_type {
            GeometryType::Point => {
                let mut coords = self.coords()?;
                if coords.is_empty() {
                    return Ok(None);
                }
                Geometry::Point(coords.swap_remove(0))
            }
            GeometryType::MultiPoint => Geometry::MultiPoint(self.coords()?),
            GeometryType::LineString => Geometry::LineString(self.coords()?),
            GeometryType::MultiLineString => Geometry::MultiLineString(self.lines()?),
            GeometryType::Polygon => Geometry::Polygon(self.lines()?),
            GeometryType::MultiPolygon => {
                if self.parts.is_empty() {
                    // single polygon stored without parts
                    Geometry::MultiPolygon(vec![self.lines()?])
                } else {
                    let polygons = self
                        .parts
                        .iter()
                        .map(|part| part.lines())
                        .collect::<Result<Vec<_>>>()?;
                    Geometry::MultiPolygon(polygons)
                }
            }
            GeometryType::GeometryCollection => {
                let mut parts = Vec::with_capacity(self.parts.len());
                for part in &self.parts {
                    if part.geometry_type == GeometryType::Unknown {
                        return Err(Error::UnsupportedGeometry(GeometryType::Unknown.0));
                    }
                    if let Some(geometry) = part.to_geometry(part.geometry_type)? {
                        parts.push(geometry);
                    }
                }
                Geometry::GeometryCollection(parts)
            }
            other => return Err(Error::UnsupportedGeometry(other.0)),
        };
        Ok(Some(geometry))
    }

    fn check_arrays(&self) -> Result<usize> {
        if self.xy.len() % 2 != 0 {
            return Err(Error::CorruptData(format!(
                "odd number of xy ordinates: {}",
                self.xy.len()
            )));
        }
        let num_coords = self.num_coords();
        for (name, values) in [("z", &self.z), ("m", &self.m)] {
            if let Some(values) = values {
                if values.len() < num_coords {
                    return Err(Error::CorruptData(format!(
                        "{name} has {} values for {num_coords} coordinates",
                        values.len()
                    )));
                }
            }
        }
        Ok(num_coords)
    }

    fn coord(&self, i: usize) -> Coord {
        let ordinate = |values: &Option<Vec<f64>>| {
            values
                .as_ref()
                .map(|v| v[i])
                .filter(|value| !value.is_nan())
        };
        Coord {
            x: self.xy[i * 2],
            y: self.xy[i * 2 + 1],
            z: ordinate(&self.z),
            m: ordinate(&self.m),
        }
    }

    fn coords_range(&self, start: usize, end: usize) -> Vec<Coord> {
        (start..end).map(|i| self.coord(i)).collect()
    }

    fn coords(&self) -> Result<Vec<Coord>> {
        let num_coords = self.check_arrays()?;
        Ok(self.coords_range(0, num_coords))
    }

    /// Slice coordinates by `ends`, a single line without them
    fn lines(&self) -> Result<Vec<Vec<Coord>>> {
        let num_coords = self.check_arrays()?;
        let Some(ends) = &self.ends else {
            return Ok(vec![self.coords_range(0, num_coords)]);
        };
        let mut lines = Vec::with_capacity(ends.len());
        let mut start = 0;
        for end in ends {
            let end = *end as usize;
            if end < start || end > num_coords {
                return Err(Error::CorruptData(format!(
                    "invalid ends {ends:?} for {num_coords} coordinates"
                )));
            }
            lines.push(self.coords_range(start, end));
            start = end;
        }
        Ok(lines)
    }
}
