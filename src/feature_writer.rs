use crate::error::{Error, Result};
use crate::feature_generated::*;
use crate::geometry::{self, Dimensions, FlatGeometry};
use crate::header_generated::{ColumnType, GeometryType};
use crate::packed_r_tree::NodeItem;
use crate::properties_reader::ColumnValue;
use byteorder::{LittleEndian, WriteBytesExt};
use flatbuffers::{FlatBufferBuilder, WIPOffset};
use std::io::Write;

/// Largest integer a f64 holds exactly
const MAX_SAFE_INTEGER: i128 = 1 << 53;

/// Encode properties in schema order.
///
/// `properties` are matched to `columns` by name. Missing and `None` values are not written.
pub fn encode_properties(
    columns: &[(&str, ColumnType)],
    properties: &[(&str, Option<ColumnValue>)],
) -> Result<Vec<u8>> {
    if let Some((name, _)) = properties
        .iter()
        .find(|(name, _)| !columns.iter().any(|(col, _)| col == name))
    {
        return Err(Error::InvalidArgument(format!("unknown column `{name}`")));
    }
    let mut out = Vec::new();
    for (i, (name, column_type)) in columns.iter().enumerate() {
        let value = properties
            .iter()
            .find(|(prop, _)| prop == name)
            .and_then(|(_, value)| value.as_ref());
        if let Some(value) = value {
            write_property(&mut out, i, *column_type, value)?;
        }
    }
    Ok(out)
}

/// Append column index and value to a property blob
pub(crate) fn write_property(
    out: &mut Vec<u8>,
    i: usize,
    column_type: ColumnType,
    value: &ColumnValue,
) -> Result<()> {
    let i = u16::try_from(i)
        .map_err(|_| Error::InvalidArgument(format!("column index {i} exceeds u16")))?;
    let start = out.len();
    out.write_u16::<LittleEndian>(i)?;
    if let Err(e) = write_value(out, column_type, value) {
        out.truncate(start);
        return Err(e);
    }
    Ok(())
}

fn int_value(value: &ColumnValue) -> Option<i128> {
    match *value {
        ColumnValue::Byte(v) => Some(v.into()),
        ColumnValue::UByte(v) => Some(v.into()),
        ColumnValue::Short(v) => Some(v.into()),
        ColumnValue::UShort(v) => Some(v.into()),
        ColumnValue::Int(v) => Some(v.into()),
        ColumnValue::UInt(v) => Some(v.into()),
        ColumnValue::Long(v) => Some(v.into()),
        ColumnValue::ULong(v) => Some(v.into()),
        _ => None,
    }
}

fn text_value(value: &ColumnValue) -> Option<&str> {
    match value {
        ColumnValue::String(v) | ColumnValue::Json(v) | ColumnValue::DateTime(v) => Some(v),
        _ => None,
    }
}

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        Error::InvalidArgument(format!("property value of {} bytes too large", bytes.len()))
    })?;
    out.write_u32::<LittleEndian>(len)?;
    out.write_all(bytes)?;
    Ok(())
}

/// Write `value` as `column_type`, widening when no information is lost
fn write_value(out: &mut Vec<u8>, column_type: ColumnType, value: &ColumnValue) -> Result<()> {
    let unsupported = || {
        Error::UnsupportedType(format!(
            "{:?} value for {:?} column",
            value.column_type(),
            column_type
        ))
    };
    let int = |min: i128, max: i128| {
        int_value(value)
            .filter(|v| (min..=max).contains(v))
            .ok_or_else(unsupported)
    };
    match column_type {
        ColumnType::Byte => out.write_i8(int(i8::MIN.into(), i8::MAX.into())? as i8)?,
        ColumnType::UByte => out.write_u8(int(0, u8::MAX.into())? as u8)?,
        ColumnType::Bool => match value {
            ColumnValue::Bool(v) => out.write_u8(*v as u8)?,
            _ => return Err(unsupported()),
        },
        ColumnType::Short => {
            out.write_i16::<LittleEndian>(int(i16::MIN.into(), i16::MAX.into())? as i16)?
        }
        ColumnType::UShort => out.write_u16::<LittleEndian>(int(0, u16::MAX.into())? as u16)?,
        ColumnType::Int => {
            out.write_i32::<LittleEndian>(int(i32::MIN.into(), i32::MAX.into())? as i32)?
        }
        ColumnType::UInt => out.write_u32::<LittleEndian>(int(0, u32::MAX.into())? as u32)?,
        ColumnType::Long => {
            out.write_i64::<LittleEndian>(int(i64::MIN.into(), i64::MAX.into())? as i64)?
        }
        ColumnType::ULong => out.write_u64::<LittleEndian>(int(0, u64::MAX.into())? as u64)?,
        ColumnType::Float => {
            let v = match *value {
                ColumnValue::Float(v) => v,
                ColumnValue::Double(v) if v.is_nan() => f32::NAN,
                ColumnValue::Double(v) if (v as f32) as f64 == v => v as f32,
                _ => return Err(unsupported()),
            };
            out.write_f32::<LittleEndian>(v)?
        }
        ColumnType::Double => {
            let v = match *value {
                ColumnValue::Double(v) => v,
                ColumnValue::Float(v) => v.into(),
                _ => int(-MAX_SAFE_INTEGER, MAX_SAFE_INTEGER)? as f64,
            };
            out.write_f64::<LittleEndian>(v)?
        }
        ColumnType::String | ColumnType::Json | ColumnType::DateTime => {
            write_len_prefixed(out, text_value(value).ok_or_else(unsupported)?.as_bytes())?
        }
        ColumnType::Binary => match value {
            ColumnValue::Binary(v) => write_len_prefixed(out, v)?,
            _ => return Err(unsupported()),
        },
        _ => return Err(unsupported()),
    }
    Ok(())
}

/// Serialize a flat geometry and its parts into `fbb`.
///
/// `write_type` stores the geometry type, required when the dataset type is `Unknown`.
/// Parts always carry their type.
pub(crate) fn create_geometry<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    geometry: &FlatGeometry,
    write_type: bool,
) -> WIPOffset<Geometry<'a>> {
    let parts = if geometry.parts.is_empty() {
        None
    } else {
        let parts = geometry
            .parts
            .iter()
            .map(|part| create_geometry(fbb, part, true))
            .collect::<Vec<_>>();
        Some(fbb.create_vector(&parts))
    };
    let xy = (!geometry.xy.is_empty()).then(|| fbb.create_vector(&geometry.xy));
    let z = geometry
        .z
        .as_ref()
        .filter(|z| !z.is_empty())
        .map(|z| fbb.create_vector(z));
    let m = geometry
        .m
        .as_ref()
        .filter(|m| !m.is_empty())
        .map(|m| fbb.create_vector(m));
    let ends = geometry.ends.as_ref().map(|ends| fbb.create_vector(ends));
    let type_ = if write_type {
        geometry.geometry_type
    } else {
        GeometryType::Unknown
    };
    Geometry::create(
        fbb,
        &GeometryArgs {
            ends,
            xy,
            z,
            m,
            type_,
            parts,
            ..Default::default()
        },
    )
}

/// Builds feature records of one dataset.
///
/// Tracks the geometry type of the written features, so a dataset declared as
/// `Unknown` can be typed when all features share one type.
#[derive(Debug)]
pub struct FeatureWriter {
    /// Type from the dataset declaration
    header_type: GeometryType,
    /// Type to write into the header
    pub(crate) dataset_type: GeometryType,
    detect_type: bool,
    promote_to_multi: bool,
    mixed_types: bool,
    /// Stored ordinates, taken from the first geometry when not declared
    dims: Option<Dimensions>,
    declared_dims: bool,
    /// Bounding box of the current feature
    pub(crate) bbox: NodeItem,
    geometry: Option<FlatGeometry>,
    properties: Vec<u8>,
}

fn is_multi(geometry_type: GeometryType) -> bool {
    matches!(
        geometry_type,
        GeometryType::MultiPoint | GeometryType::MultiLineString | GeometryType::MultiPolygon
    )
}

impl FeatureWriter {
    /// `dims` of `None` takes the dimensions of the first written geometry
    pub fn new(
        geometry_type: GeometryType,
        detect_type: bool,
        promote_to_multi: bool,
        dims: Option<Dimensions>,
    ) -> Self {
        FeatureWriter {
            header_type: geometry_type,
            dataset_type: geometry_type,
            detect_type,
            promote_to_multi: promote_to_multi && is_multi(geometry_type),
            mixed_types: false,
            dims,
            declared_dims: dims.is_some(),
            bbox: NodeItem::create(0),
            geometry: None,
            properties: Vec::new(),
        }
    }

    /// Dataset dimensions, XY until known
    pub fn dims(&self) -> Dimensions {
        self.dims.unwrap_or(Dimensions::XY)
    }

    /// Ordinates to request from geometry sources. All of them while the dataset
    /// dimensions are detected, so a mismatch is reported instead of dropped.
    pub(crate) fn requested_dims(&self) -> Dimensions {
        if self.declared_dims {
            self.dims()
        } else {
            Dimensions::XYZM
        }
    }

    /// Set the geometry of the current feature
    pub fn set_geometry(&mut self, geometry: Option<&geometry::Geometry>) -> Result<()> {
        let Some(geometry) = geometry else {
            self.geometry = None;
            self.bbox = NodeItem::create(0);
            return Ok(());
        };
        let promoted;
        let geometry = if self.promote_to_multi && !is_multi(geometry.geometry_type()) {
            promoted = geometry.clone().into_multi();
            &promoted
        } else {
            geometry
        };
        let geometry_type = geometry.geometry_type();
        if self.header_type != GeometryType::Unknown && geometry_type != self.header_type {
            return Err(Error::InvalidArgument(format!(
                "{:?} geometry in {:?} dataset",
                geometry_type, self.header_type
            )));
        }
        let geometry_dims = geometry.dims();
        let has_coords = geometry.bbox().is_some();
        let dims = match self.dims {
            Some(dims) => dims,
            None if has_coords => geometry_dims,
            None => Dimensions::XY,
        };
        if (geometry_dims.z && !dims.z) || (geometry_dims.m && !dims.m) {
            return Err(Error::InvalidArgument(format!(
                "{geometry_dims:?} geometry in {dims:?} dataset"
            )));
        }
        if self.dims.is_none() && has_coords {
            debug!("Dataset dimensions {dims:?} from first geometry");
            self.dims = Some(dims);
        }
        if self.header_type == GeometryType::Unknown && self.detect_type && !self.mixed_types {
            if self.dataset_type == GeometryType::Unknown {
                self.dataset_type = geometry_type;
            } else if self.dataset_type != geometry_type {
                debug!(
                    "Mixed geometry types {:?} and {:?}, dataset type stays Unknown",
                    self.dataset_type, geometry_type
                );
                self.dataset_type = GeometryType::Unknown;
                self.mixed_types = true;
            }
        }
        self.bbox = geometry.bbox().unwrap_or_else(|| NodeItem::create(0));
        self.geometry = Some(FlatGeometry::from_geometry(geometry, dims)?);
        Ok(())
    }

    /// Set the encoded properties of the current feature
    pub fn set_properties(&mut self, properties: Vec<u8>) {
        self.properties = properties;
    }

    /// Drop geometry and properties of an unfinished feature
    pub(crate) fn reset(&mut self) {
        self.geometry = None;
        self.bbox = NodeItem::create(0);
        self.properties.clear();
    }

    /// Append a single property to the current feature
    pub(crate) fn push_property(
        &mut self,
        i: usize,
        column_type: ColumnType,
        value: &ColumnValue,
    ) -> Result<()> {
        write_property(&mut self.properties, i, column_type, value)
    }

    /// Size-prefixed record of the current feature. Resets geometry and properties.
    pub fn finish_to_feature(&mut self) -> Vec<u8> {
        let mut fbb = FlatBufferBuilder::new();
        let geometry = self.geometry.take().map(|geometry| {
            create_geometry(
                &mut fbb,
                &geometry,
                self.header_type == GeometryType::Unknown,
            )
        });
        let properties = (!self.properties.is_empty()).then(|| fbb.create_vector(&self.properties));
        self.properties.clear();
        let feature = Feature::create(
            &mut fbb,
            &FeatureArgs {
                geometry,
                properties,
                columns: None,
            },
        );
        finish_size_prefixed_feature_buffer(&mut fbb, feature);
        fbb.finished_data().to_vec()
    }
}
