use crate::error::{Error, Result};
use crate::feature_generated::*;
use crate::geometry;
use crate::geometry_reader::read_geometry;
use crate::header_generated::*;
use byteorder::{ByteOrder, LittleEndian};
use std::mem::size_of;
use std::str;

/// Owned property value
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Byte(i8),
    UByte(u8),
    Bool(bool),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    String(String),
    Json(String),
    DateTime(String),
    Binary(Vec<u8>),
}

impl ColumnValue {
    /// Column type storing this value without conversion
    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnValue::Byte(_) => ColumnType::Byte,
            ColumnValue::UByte(_) => ColumnType::UByte,
            ColumnValue::Bool(_) => ColumnType::Bool,
            ColumnValue::Short(_) => ColumnType::Short,
            ColumnValue::UShort(_) => ColumnType::UShort,
            ColumnValue::Int(_) => ColumnType::Int,
            ColumnValue::UInt(_) => ColumnType::UInt,
            ColumnValue::Long(_) => ColumnType::Long,
            ColumnValue::ULong(_) => ColumnType::ULong,
            ColumnValue::Float(_) => ColumnType::Float,
            ColumnValue::Double(_) => ColumnType::Double,
            ColumnValue::String(_) => ColumnType::String,
            ColumnValue::Json(_) => ColumnType::Json,
            ColumnValue::DateTime(_) => ColumnType::DateTime,
            ColumnValue::Binary(_) => ColumnType::Binary,
        }
    }

    /// Borrowed geozero representation
    pub fn as_geozero(&self) -> geozero::ColumnValue<'_> {
        match self {
            ColumnValue::Byte(v) => geozero::ColumnValue::Byte(*v),
            ColumnValue::UByte(v) => geozero::ColumnValue::UByte(*v),
            ColumnValue::Bool(v) => geozero::ColumnValue::Bool(*v),
            ColumnValue::Short(v) => geozero::ColumnValue::Short(*v),
            ColumnValue::UShort(v) => geozero::ColumnValue::UShort(*v),
            ColumnValue::Int(v) => geozero::ColumnValue::Int(*v),
            ColumnValue::UInt(v) => geozero::ColumnValue::UInt(*v),
            ColumnValue::Long(v) => geozero::ColumnValue::Long(*v),
            ColumnValue::ULong(v) => geozero::ColumnValue::ULong(*v),
            ColumnValue::Float(v) => geozero::ColumnValue::Float(*v),
            ColumnValue::Double(v) => geozero::ColumnValue::Double(*v),
            ColumnValue::String(v) => geozero::ColumnValue::String(v),
            ColumnValue::Json(v) => geozero::ColumnValue::Json(v),
            ColumnValue::DateTime(v) => geozero::ColumnValue::DateTime(v),
            ColumnValue::Binary(v) => geozero::ColumnValue::Binary(v),
        }
    }
}

impl From<&geozero::ColumnValue<'_>> for ColumnValue {
    fn from(value: &geozero::ColumnValue<'_>) -> Self {
        match value {
            geozero::ColumnValue::Byte(v) => ColumnValue::Byte(*v),
            geozero::ColumnValue::UByte(v) => ColumnValue::UByte(*v),
            geozero::ColumnValue::Bool(v) => ColumnValue::Bool(*v),
            geozero::ColumnValue::Short(v) => ColumnValue::Short(*v),
            geozero::ColumnValue::UShort(v) => ColumnValue::UShort(*v),
            geozero::ColumnValue::Int(v) => ColumnValue::Int(*v),
            geozero::ColumnValue::UInt(v) => ColumnValue::UInt(*v),
            geozero::ColumnValue::Long(v) => ColumnValue::Long(*v),
            geozero::ColumnValue::ULong(v) => ColumnValue::ULong(*v),
            geozero::ColumnValue::Float(v) => ColumnValue::Float(*v),
            geozero::ColumnValue::Double(v) => ColumnValue::Double(*v),
            geozero::ColumnValue::String(v) => ColumnValue::String(v.to_string()),
            geozero::ColumnValue::Json(v) => ColumnValue::Json(v.to_string()),
            geozero::ColumnValue::DateTime(v) => ColumnValue::DateTime(v.to_string()),
            geozero::ColumnValue::Binary(v) => ColumnValue::Binary(v.to_vec()),
        }
    }
}

/// Forward cursor over a property blob
struct BlobCursor<'b> {
    blob: &'b [u8],
    offset: usize,
}

impl<'b> BlobCursor<'b> {
    fn take(&mut self, len: usize) -> Result<&'b [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.blob.len())
            .ok_or_else(|| {
                Error::CorruptData(format!(
                    "property value of {len} bytes at offset {} exceeds blob of {} bytes",
                    self.offset,
                    self.blob.len()
                ))
            })?;
        let bytes = &self.blob[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn take_len_prefixed(&mut self) -> Result<&'b [u8]> {
        let len = LittleEndian::read_u32(self.take(size_of::<u32>())?) as usize;
        self.take(len)
    }

    fn take_str(&mut self) -> Result<&'b str> {
        str::from_utf8(self.take_len_prefixed()?)
            .map_err(|_| Error::CorruptData("Invalid UTF-8 encoding".to_string()))
    }
}

/// Decode the value of a `column_type` column at the cursor
fn read_value<'b>(
    cursor: &mut BlobCursor<'b>,
    column_type: ColumnType,
) -> Result<geozero::ColumnValue<'b>> {
    use geozero::ColumnValue as V;
    let value = match column_type {
        ColumnType::Byte => V::Byte(cursor.take(1)?[0] as i8),
        ColumnType::UByte => V::UByte(cursor.take(1)?[0]),
        ColumnType::Bool => V::Bool(cursor.take(1)?[0] != 0),
        ColumnType::Short => V::Short(LittleEndian::read_i16(cursor.take(2)?)),
        ColumnType::UShort => V::UShort(LittleEndian::read_u16(cursor.take(2)?)),
        ColumnType::Int => V::Int(LittleEndian::read_i32(cursor.take(4)?)),
        ColumnType::UInt => V::UInt(LittleEndian::read_u32(cursor.take(4)?)),
        ColumnType::Long => V::Long(LittleEndian::read_i64(cursor.take(8)?)),
        ColumnType::ULong => V::ULong(LittleEndian::read_u64(cursor.take(8)?)),
        ColumnType::Float => V::Float(LittleEndian::read_f32(cursor.take(4)?)),
        ColumnType::Double => V::Double(LittleEndian::read_f64(cursor.take(8)?)),
        ColumnType::String => V::String(cursor.take_str()?),
        // JSON may be represented using UTF-8, UTF-16, or UTF-32. Only UTF-8 is supported.
        ColumnType::Json => V::Json(cursor.take_str()?),
        ColumnType::DateTime => V::DateTime(cursor.take_str()?),
        ColumnType::Binary => V::Binary(cursor.take_len_prefixed()?),
        other => return Err(Error::UnsupportedType(format!("column type {:?}", other))),
    };
    Ok(value)
}

/// Walk a property blob, calling `visit` with column index and value until it returns `true`.
///
/// Returns `true` if `visit` finished early.
pub(crate) fn scan_properties<'b>(
    blob: &'b [u8],
    column_types: &[ColumnType],
    mut visit: impl FnMut(usize, geozero::ColumnValue<'b>) -> Result<bool>,
) -> Result<bool> {
    let mut cursor = BlobCursor { blob, offset: 0 };
    // Existing data may carry one trailing byte after the last Binary value
    while cursor.offset + 1 < blob.len() {
        let i = LittleEndian::read_u16(cursor.take(size_of::<u16>())?) as usize;
        let Some(column_type) = column_types.get(i) else {
            return Err(Error::CorruptData(format!(
                "column index {i} out of range of {} columns",
                column_types.len()
            )));
        };
        let value = read_value(&mut cursor, *column_type)?;
        if visit(i, value)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Decode a property blob into `(column name, value)` pairs in stored order.
pub fn decode_properties(
    blob: &[u8],
    columns: &[(&str, ColumnType)],
) -> Result<Vec<(String, ColumnValue)>> {
    let column_types: Vec<ColumnType> = columns.iter().map(|(_, t)| *t).collect();
    let mut properties = Vec::new();
    scan_properties(blob, &column_types, |i, value| {
        properties.push((columns[i].0.to_string(), ColumnValue::from(&value)));
        Ok(false)
    })?;
    Ok(properties)
}

/// Access to current feature
#[derive(Debug, Clone)]
pub struct FgbFeature {
    pub(crate) header_buf: Vec<u8>, // Using type Header<'a> instead of Vec would require adding a lifetime to FgbFeature
    pub(crate) feature_buf: Vec<u8>,
}

impl FgbFeature {
    /// Header of the dataset the feature belongs to
    pub fn header(&self) -> Header {
        // SAFETY: verification is done before creating instance
        unsafe { size_prefixed_root_as_header_unchecked(&self.header_buf) }
    }
    /// Flatbuffers feature access
    pub fn fbs_feature(&self) -> Feature {
        // SAFETY: verification is done before creating instance
        unsafe { size_prefixed_root_as_feature_unchecked(&self.feature_buf) }
    }
    /// Flatbuffers geometry access
    pub fn fbs_geometry(&self) -> Option<Geometry> {
        self.fbs_feature().geometry()
    }
    /// Size-prefixed feature record
    pub fn feature_buf(&self) -> &[u8] {
        &self.feature_buf
    }
    /// Decoded geometry. `None` for features without geometry.
    pub fn geometry(&self) -> Result<Option<geometry::Geometry>> {
        match self.fbs_geometry() {
            Some(geometry) => read_geometry(&geometry, self.header().geometry_type()),
            None => Ok(None),
        }
    }
    /// Column schema of this feature, the per-feature override if present
    pub fn columns(&self) -> Vec<(&str, ColumnType)> {
        self.fbs_feature()
            .columns()
            .or_else(|| self.header().columns())
            .map(|columns| columns.iter().map(|c| (c.name(), c.type_())).collect())
            .unwrap_or_default()
    }
    /// Decoded properties in stored order
    pub fn properties(&self) -> Result<Vec<(String, ColumnValue)>> {
        match self.fbs_feature().properties() {
            Some(blob) => decode_properties(blob.bytes(), &self.columns()),
            None => Ok(Vec::new()),
        }
    }
    /// Value of property `name`, `None` if missing or null
    pub fn property(&self, name: &str) -> Result<Option<ColumnValue>> {
        let columns = self.columns();
        let Some(blob) = self.fbs_feature().properties() else {
            return Ok(None);
        };
        let Some(wanted) = columns.iter().position(|(n, _)| *n == name) else {
            return Ok(None);
        };
        let column_types: Vec<ColumnType> = columns.iter().map(|(_, t)| *t).collect();
        let mut found = None;
        scan_properties(blob.bytes(), &column_types, |i, value| {
            if i == wanted {
                found = Some(ColumnValue::from(&value));
                return Ok(true);
            }
            Ok(false)
        })?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::feature_writer::encode_properties;

    fn columns() -> Vec<(&'static str, ColumnType)> {
        vec![
            ("flag", ColumnType::Bool),
            ("count", ColumnType::Int),
            ("big", ColumnType::Long),
            ("ratio", ColumnType::Double),
            ("name", ColumnType::String),
            ("blob", ColumnType::Binary),
            ("doc", ColumnType::Json),
        ]
    }

    #[test]
    fn properties_roundtrip() -> Result<()> {
        let props = [
            ("flag", Some(ColumnValue::Bool(true))),
            ("count", Some(ColumnValue::Int(-42))),
            ("big", Some(ColumnValue::Long(1 << 40))),
            ("ratio", Some(ColumnValue::Double(0.25))),
            ("name", Some(ColumnValue::String("Zürich".to_string()))),
            ("blob", Some(ColumnValue::Binary(vec![0, 1, 2, 255]))),
            ("doc", Some(ColumnValue::Json(r#"{"a":[1,2]}"#.to_string()))),
        ];
        let blob = encode_properties(&columns(), &props)?;
        let decoded = decode_properties(&blob, &columns())?;
        assert_eq!(decoded.len(), props.len());
        for ((name, value), (expected_name, expected)) in decoded.iter().zip(props.iter()) {
            assert_eq!(name, expected_name);
            assert_eq!(Some(value), expected.as_ref());
        }
        Ok(())
    }

    #[test]
    fn missing_and_null_are_omitted() -> Result<()> {
        let props = [
            ("name", Some(ColumnValue::String("x".to_string()))),
            ("count", None),
        ];
        let blob = encode_properties(&columns(), &props)?;
        // u16 index + u32 length + 1 byte
        assert_eq!(blob.len(), 7);
        let decoded = decode_properties(&blob, &columns())?;
        assert_eq!(
            decoded,
            vec![("name".to_string(), ColumnValue::String("x".to_string()))]
        );
        Ok(())
    }

    #[test]
    fn corrupt_blobs() {
        // column index 9 of 7
        let err = decode_properties(&[9, 0, 1], &columns()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptData);
        // string claims 100 bytes
        let err = decode_properties(&[4, 0, 100, 0, 0, 0, b'a'], &columns()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptData);
        // truncated i64
        let err = decode_properties(&[2, 0, 1, 2, 3], &columns()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptData);
        // invalid UTF-8
        let err = decode_properties(&[4, 0, 2, 0, 0, 0, 0xc3, 0x28], &columns()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptData);
    }
}
