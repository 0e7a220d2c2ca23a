use crate::error::{Error, Result};
use crate::feature_generated::Geometry;
use crate::geometry::{self, FlatGeometry};
use crate::header_generated::GeometryType;

/// True for types stored as nested `parts` instead of flat arrays
pub fn is_collection(geometry_type: GeometryType) -> Result<bool> {
    match geometry_type {
        GeometryType::Unknown
        | GeometryType::Point
        | GeometryType::MultiPoint
        | GeometryType::LineString
        | GeometryType::MultiLineString
        | GeometryType::Polygon => Ok(false),
        GeometryType::MultiPolygon | GeometryType::GeometryCollection => Ok(true),
        other => Err(Error::UnsupportedGeometry(other.0)),
    }
}

fn to_vec(values: Option<flatbuffers::Vector<'_, f64>>) -> Option<Vec<f64>> {
    values.map(|v| v.iter().collect())
}

/// Copy a stored geometry table into flat arrays, including all parts.
///
/// `geometry_type` is the dataset type from the header. Records of typed datasets
/// don't store their type, so an untagged geometry takes the dataset type.
pub fn read_flat_geometry(
    geometry: &Geometry,
    geometry_type: GeometryType,
) -> Result<FlatGeometry> {
    let geometry_type = match geometry.type_() {
        GeometryType::Unknown => geometry_type,
        stored => stored,
    };
    if geometry_type.0 > GeometryType::ENUM_MAX {
        return Err(Error::UnsupportedGeometry(geometry_type.0));
    }
    // untagged parts of a multi polygon are polygons
    let part_type = if geometry_type == GeometryType::MultiPolygon {
        GeometryType::Polygon
    } else {
        GeometryType::Unknown
    };
    let mut parts = Vec::new();
    if let Some(fbs_parts) = geometry.parts() {
        parts.reserve(fbs_parts.len());
        for part in fbs_parts.iter() {
            parts.push(read_flat_geometry(&part, part_type)?);
        }
    }
    Ok(FlatGeometry {
        geometry_type,
        xy: geometry.xy().map(|v| v.iter().collect()).unwrap_or_default(),
        z: to_vec(geometry.z()),
        m: to_vec(geometry.m()),
        ends: geometry.ends().map(|v| v.iter().collect()),
        parts,
    })
}

/// Decode a stored geometry. `geometry_type` is the dataset type from the header.
pub fn read_geometry(
    geometry: &Geometry,
    geometry_type: GeometryType,
) -> Result<Option<geometry::Geometry>> {
    let flat = read_flat_geometry(geometry, geometry_type)?;
    flat.to_geometry(flat.geometry_type)
}

impl Geometry<'_> {
    /// Decode into a [geometry::Geometry]
    pub fn decode(&self, geometry_type: GeometryType) -> Result<Option<geometry::Geometry>> {
        read_geometry(self, geometry_type)
    }

    /// Ordinate count per ring or line
    pub fn ring_lengths(&self) -> Vec<usize> {
        let mut start = 0;
        match self.ends() {
            Some(ends) => ends
                .iter()
                .map(|end| {
                    let len = (end as usize).saturating_sub(start) * 2;
                    start = end as usize;
                    len
                })
                .collect(),
            None => self
                .xy()
                .filter(|xy| !xy.is_empty())
                .map(|xy| vec![xy.len()])
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_generated::{GeometryArgs, GeometryBuilder};

    #[test]
    fn collection_types() -> Result<()> {
        assert!(!is_collection(GeometryType::Polygon)?);
        assert!(is_collection(GeometryType::MultiPolygon)?);
        assert!(is_collection(GeometryType::GeometryCollection)?);
        assert!(matches!(
            is_collection(GeometryType::TIN),
            Err(Error::UnsupportedGeometry(16))
        ));
        Ok(())
    }

    #[test]
    fn read_wire_polygon() -> Result<()> {
        let mut fbb = flatbuffers::FlatBufferBuilder::new();
        let xy = fbb.create_vector(&[
            35., 10., 45., 45., 15., 40., 10., 20., 35., 10., 20., 30., 35., 35., 30., 20., 20.,
            30.,
        ]);
        let ends = fbb.create_vector(&[5u32, 9]);
        let geometry = Geometry::create(
            &mut fbb,
            &GeometryArgs {
                xy: Some(xy),
                ends: Some(ends),
                ..Default::default()
            },
        );
        fbb.finish(geometry, None);
        let geometry = flatbuffers::root::<Geometry>(fbb.finished_data())?;
        assert_eq!(geometry.ring_lengths(), vec![10, 8]);
        let Some(geometry::Geometry::Polygon(rings)) = geometry.decode(GeometryType::Polygon)?
        else {
            panic!("polygon expected");
        };
        assert_eq!(rings.len(), 2);
        assert_eq!(rings[1].len(), 4);
        Ok(())
    }

    #[test]
    fn empty_table_is_no_geometry() -> Result<()> {
        let mut fbb = flatbuffers::FlatBufferBuilder::new();
        let geometry = GeometryBuilder::new(&mut fbb).finish();
        fbb.finish(geometry, None);
        let geometry = flatbuffers::root::<Geometry>(fbb.finished_data())?;
        assert_eq!(geometry.decode(GeometryType::Point)?, None);
        Ok(())
    }

    #[test]
    fn untagged_record_takes_dataset_type() -> Result<()> {
        let mut fbb = flatbuffers::FlatBufferBuilder::new();
        let xy = fbb.create_vector(&[0., 0., 1., 0., 0., 1., 0., 0.]);
        let part = Geometry::create(
            &mut fbb,
            &GeometryArgs {
                xy: Some(xy),
                ..Default::default()
            },
        );
        let parts = fbb.create_vector(&[part]);
        let geometry = Geometry::create(
            &mut fbb,
            &GeometryArgs {
                parts: Some(parts),
                ..Default::default()
            },
        );
        fbb.finish(geometry, None);
        let geometry = flatbuffers::root::<Geometry>(fbb.finished_data())?;
        let flat = read_flat_geometry(&geometry, GeometryType::MultiPolygon)?;
        assert_eq!(flat.geometry_type, GeometryType::MultiPolygon);
        assert_eq!(flat.parts[0].geometry_type, GeometryType::Polygon);
        assert!(matches!(
            flat.to_geometry(flat.geometry_type)?,
            Some(geometry::Geometry::MultiPolygon(polygons)) if polygons[0][0].len() == 4
        ));
        Ok(())
    }
}
