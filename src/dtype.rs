//! Element type descriptors.
//!
//! A [`Dtype`] describes one logical row (an *atom*) of an array: a scalar
//! kind, the byte size of one scalar, and any trailing shape dimensions folded
//! into the atom. Only the leading dimension of an array grows; everything
//! else is part of the atom.

use std::fmt;

use itertools::Itertools;
use serde_json::Value;

use crate::blosc::MAX_TYPESIZE;
use crate::error::CarrayError;

/// Atoms at or above this size cannot enter the compression pipeline.
pub(crate) const MAX_ATOM_SIZE: u64 = 1 << 31;

/// The scalar kinds an array can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DtypeKind {
    /// Booleans, one byte per value.
    Bool,
    /// Signed integers of 1, 2, 4, or 8 bytes.
    Int,
    /// Unsigned integers of 1, 2, 4, or 8 bytes.
    UInt,
    /// IEEE-754 floats of 4 or 8 bytes.
    Float,
    /// Fixed-length byte strings, NUL padded.
    Bytes,
    /// Fixed-length UCS-4 strings, four bytes per code unit.
    Ucs4,
    /// Fixed-size opaque records.
    Opaque,
    /// Variable-length opaque values, stored one element per chunk as a byte
    /// string serialized by the host.
    Object,
}

/// A fixed-size element type descriptor.
///
/// `itemsize` is the byte size of one scalar; `shape` holds the trailing atom
/// dimensions (empty for scalar atoms). The canonical string form round-trips
/// through [`Dtype::parse`] and [`fmt::Display`] and is what the persistent
/// metadata records: `"bool"`, `"i4"`, `"u8"`, `"f8"`, `"S5"`, `"U3"`,
/// `"V16"`, `"O"`, optionally prefixed with a parenthesised shape such as
/// `"(3,4)f8"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dtype {
    kind: DtypeKind,
    itemsize: usize,
    shape: Vec<usize>,
}

impl Dtype {
    /// Create a scalar-atom descriptor.
    ///
    /// # Errors
    /// Returns [`CarrayError::InvalidArgument`] if `itemsize` is not valid for
    /// `kind` (e.g. a 3-byte integer).
    pub fn new(kind: DtypeKind, itemsize: usize) -> Result<Self, CarrayError> {
        let valid = match kind {
            DtypeKind::Bool => itemsize == 1,
            DtypeKind::Int | DtypeKind::UInt => matches!(itemsize, 1 | 2 | 4 | 8),
            DtypeKind::Float => matches!(itemsize, 4 | 8),
            DtypeKind::Bytes | DtypeKind::Opaque => itemsize > 0,
            DtypeKind::Ucs4 => itemsize > 0 && itemsize % 4 == 0,
            DtypeKind::Object => itemsize == 0,
        };
        if !valid {
            return Err(CarrayError::InvalidArgument(format!(
                "item size {itemsize} is not valid for {kind:?}"
            )));
        }
        Ok(Self {
            kind,
            itemsize,
            shape: Vec::new(),
        })
    }

    /// The variable-length opaque descriptor.
    #[must_use]
    pub fn object() -> Self {
        Self {
            kind: DtypeKind::Object,
            itemsize: 0,
            shape: Vec::new(),
        }
    }

    /// Fold trailing dimensions into the atom.
    ///
    /// # Errors
    /// Returns [`CarrayError::InvalidArgument`] for a zero dimension, and
    /// [`CarrayError::NotSupported`] for a non-scalar object atom.
    pub fn with_shape(mut self, shape: &[usize]) -> Result<Self, CarrayError> {
        if self.kind == DtypeKind::Object && !shape.is_empty() {
            return Err(CarrayError::NotSupported(
                "object arrays must have scalar atoms".to_string(),
            ));
        }
        if shape.contains(&0) {
            return Err(CarrayError::InvalidArgument(
                "atom shape dimensions must be non-zero".to_string(),
            ));
        }
        self.shape = shape.to_vec();
        Ok(self)
    }

    /// The scalar kind.
    #[must_use]
    pub fn kind(&self) -> DtypeKind {
        self.kind
    }

    /// The byte size of one scalar.
    #[must_use]
    pub fn itemsize(&self) -> usize {
        self.itemsize
    }

    /// The trailing atom dimensions (empty for scalar atoms).
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Scalars per atom.
    #[must_use]
    pub fn items_per_atom(&self) -> usize {
        self.shape.iter().product()
    }

    /// The byte size of one logical row.
    #[must_use]
    pub fn atomsize(&self) -> usize {
        self.itemsize * self.items_per_atom()
    }

    /// The atom size, checked against the compression pipeline's limit.
    ///
    /// # Errors
    /// Returns [`CarrayError::TypeTooLarge`] for atoms of 2³¹ bytes or more.
    pub fn checked_atomsize(&self) -> Result<usize, CarrayError> {
        let atomsize = self.atomsize();
        if atomsize as u64 >= MAX_ATOM_SIZE {
            return Err(CarrayError::TypeTooLarge(atomsize as u64));
        }
        Ok(atomsize)
    }

    /// Whether this is the variable-length opaque kind.
    #[must_use]
    pub fn is_object(&self) -> bool {
        self.kind == DtypeKind::Object
    }

    /// The type size handed to the codec's shuffle filter.
    ///
    /// Byte strings shuffle per byte, UCS-4 strings per code unit; opaque
    /// records beyond the codec's maximum type size fall back to one.
    pub(crate) fn codec_typesize(&self) -> usize {
        match self.kind {
            DtypeKind::Bytes | DtypeKind::Object => 1,
            DtypeKind::Ucs4 => 4,
            DtypeKind::Opaque => {
                if self.itemsize > MAX_TYPESIZE {
                    log::debug!(
                        "opaque item size {} exceeds the codec maximum; shuffling per byte",
                        self.itemsize
                    );
                    1
                } else {
                    self.itemsize.max(1)
                }
            }
            _ => self.itemsize,
        }
    }

    /// Parse the canonical string form.
    ///
    /// # Errors
    /// Returns [`CarrayError::InvalidArgument`] for an unrecognised
    /// descriptor.
    pub fn parse(descr: &str) -> Result<Self, CarrayError> {
        let bad = || CarrayError::InvalidArgument(format!("unrecognised dtype `{descr}`"));
        let mut rest = descr.trim();

        let mut shape = Vec::new();
        if let Some(stripped) = rest.strip_prefix('(') {
            let close = stripped.find(')').ok_or_else(bad)?;
            for dim in stripped[..close].split(',') {
                let dim = dim.trim();
                if dim.is_empty() {
                    continue;
                }
                shape.push(dim.parse::<usize>().map_err(|_| bad())?);
            }
            rest = &stripped[close + 1..];
        }

        let dtype = match rest {
            "O" => Self::object(),
            "bool" | "b1" => Self::new(DtypeKind::Bool, 1)?,
            _ => {
                if rest.len() < 2 || !rest.is_ascii() {
                    return Err(bad());
                }
                let (code, size) = rest.split_at(1);
                let size: usize = size.parse().map_err(|_| bad())?;
                match code {
                    "i" => Self::new(DtypeKind::Int, size).map_err(|_| bad())?,
                    "u" => Self::new(DtypeKind::UInt, size).map_err(|_| bad())?,
                    "f" => Self::new(DtypeKind::Float, size).map_err(|_| bad())?,
                    "S" => Self::new(DtypeKind::Bytes, size)?,
                    "U" => Self::new(DtypeKind::Ucs4, size * 4)?,
                    "V" => Self::new(DtypeKind::Opaque, size)?,
                    _ => return Err(bad()),
                }
            }
        };
        dtype.with_shape(&shape)
    }

    /// Encode one atom as the JSON value persisted for default values.
    ///
    /// Numeric kinds map to JSON numbers, booleans to booleans, UCS-4 strings
    /// to strings, byte strings and opaque records to arrays of byte values;
    /// multidimensional atoms map to lists.
    #[must_use]
    pub(crate) fn atom_to_json(&self, atom: &[u8]) -> Value {
        if self.is_object() {
            return Value::Null;
        }
        if !self.shape.is_empty() {
            return Value::Array(
                atom.chunks_exact(self.itemsize)
                    .map(|item| self.item_to_json(item))
                    .collect(),
            );
        }
        self.item_to_json(atom)
    }

    fn item_to_json(&self, item: &[u8]) -> Value {
        match self.kind {
            DtypeKind::Bool => Value::Bool(item[0] != 0),
            DtypeKind::Int => Value::from(read_int(item)),
            DtypeKind::UInt => Value::from(read_uint(item)),
            DtypeKind::Float => {
                let v = read_float(item);
                serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
            }
            DtypeKind::Bytes | DtypeKind::Opaque => {
                Value::Array(item.iter().map(|&b| Value::from(b)).collect())
            }
            DtypeKind::Ucs4 => {
                let s: String = item
                    .chunks_exact(4)
                    .map(|u| {
                        char::from_u32(u32::from_le_bytes([u[0], u[1], u[2], u[3]]))
                            .unwrap_or('\u{fffd}')
                    })
                    .collect();
                Value::String(s)
            }
            DtypeKind::Object => Value::Null,
        }
    }

    /// Decode a persisted default value back into atom bytes.
    ///
    /// # Errors
    /// Returns [`CarrayError::InvalidArgument`] if the JSON shape does not
    /// match the atom.
    pub(crate) fn atom_from_json(&self, value: &Value) -> Result<Vec<u8>, CarrayError> {
        if self.is_object() {
            return Ok(Vec::new());
        }
        let mut atom = vec![0u8; self.atomsize()];
        if self.shape.is_empty() {
            self.item_from_json(value, &mut atom)?;
        } else {
            let Value::Array(items) = value else {
                return Err(CarrayError::InvalidArgument(
                    "default value does not match the atom shape".to_string(),
                ));
            };
            if items.len() != self.items_per_atom() {
                return Err(CarrayError::InvalidArgument(
                    "default value does not match the atom shape".to_string(),
                ));
            }
            for (item, dst) in items.iter().zip(atom.chunks_exact_mut(self.itemsize)) {
                self.item_from_json(item, dst)?;
            }
        }
        Ok(atom)
    }

    fn item_from_json(&self, value: &Value, dst: &mut [u8]) -> Result<(), CarrayError> {
        let bad = || {
            CarrayError::InvalidArgument(format!(
                "default value {value} does not match dtype `{self}`"
            ))
        };
        match self.kind {
            DtypeKind::Bool => {
                dst[0] = u8::from(value.as_bool().ok_or_else(bad)?);
            }
            DtypeKind::Int => write_int(value.as_i64().ok_or_else(bad)?, dst),
            DtypeKind::UInt => write_uint(value.as_u64().ok_or_else(bad)?, dst),
            DtypeKind::Float => {
                // A null stands in for the non-finite floats JSON cannot hold.
                let v = if value.is_null() {
                    f64::NAN
                } else {
                    value.as_f64().ok_or_else(bad)?
                };
                write_float(v, dst);
            }
            DtypeKind::Bytes | DtypeKind::Opaque => {
                let Value::Array(bytes) = value else {
                    return Err(bad());
                };
                if bytes.len() != dst.len() {
                    return Err(bad());
                }
                for (b, d) in bytes.iter().zip(dst.iter_mut()) {
                    *d = u8::try_from(b.as_u64().ok_or_else(bad)?).map_err(|_| bad())?;
                }
            }
            DtypeKind::Ucs4 => {
                let s = value.as_str().ok_or_else(bad)?;
                if s.chars().count() != dst.len() / 4 {
                    return Err(bad());
                }
                for (c, d) in s.chars().zip(dst.chunks_exact_mut(4)) {
                    d.copy_from_slice(&(c as u32).to_le_bytes());
                }
            }
            DtypeKind::Object => {}
        }
        Ok(())
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.shape.is_empty() {
            write!(f, "({})", self.shape.iter().join(","))?;
        }
        match self.kind {
            DtypeKind::Bool => write!(f, "bool"),
            DtypeKind::Int => write!(f, "i{}", self.itemsize),
            DtypeKind::UInt => write!(f, "u{}", self.itemsize),
            DtypeKind::Float => write!(f, "f{}", self.itemsize),
            DtypeKind::Bytes => write!(f, "S{}", self.itemsize),
            DtypeKind::Ucs4 => write!(f, "U{}", self.itemsize / 4),
            DtypeKind::Opaque => write!(f, "V{}", self.itemsize),
            DtypeKind::Object => write!(f, "O"),
        }
    }
}

fn read_int(item: &[u8]) -> i64 {
    match item.len() {
        1 => i64::from(item[0] as i8),
        2 => i64::from(i16::from_ne_bytes([item[0], item[1]])),
        4 => i64::from(i32::from_ne_bytes([item[0], item[1], item[2], item[3]])),
        _ => i64::from_ne_bytes(item.try_into().unwrap_or_default()),
    }
}

fn read_uint(item: &[u8]) -> u64 {
    match item.len() {
        1 => u64::from(item[0]),
        2 => u64::from(u16::from_ne_bytes([item[0], item[1]])),
        4 => u64::from(u32::from_ne_bytes([item[0], item[1], item[2], item[3]])),
        _ => u64::from_ne_bytes(item.try_into().unwrap_or_default()),
    }
}

fn read_float(item: &[u8]) -> f64 {
    match item.len() {
        4 => f64::from(f32::from_ne_bytes([item[0], item[1], item[2], item[3]])),
        _ => f64::from_ne_bytes(item.try_into().unwrap_or_default()),
    }
}

fn write_int(v: i64, dst: &mut [u8]) {
    match dst.len() {
        1 => dst[0] = v as i8 as u8,
        2 => dst.copy_from_slice(&(v as i16).to_ne_bytes()),
        4 => dst.copy_from_slice(&(v as i32).to_ne_bytes()),
        _ => dst.copy_from_slice(&v.to_ne_bytes()),
    }
}

fn write_uint(v: u64, dst: &mut [u8]) {
    match dst.len() {
        1 => dst[0] = v as u8,
        2 => dst.copy_from_slice(&(v as u16).to_ne_bytes()),
        4 => dst.copy_from_slice(&(v as u32).to_ne_bytes()),
        _ => dst.copy_from_slice(&v.to_ne_bytes()),
    }
}

fn write_float(v: f64, dst: &mut [u8]) {
    match dst.len() {
        4 => dst.copy_from_slice(&(v as f32).to_ne_bytes()),
        _ => dst.copy_from_slice(&v.to_ne_bytes()),
    }
}

/// Transmute from `&[T]` to `&[u8]`.
#[must_use]
pub fn transmute_to_bytes<T: bytemuck::NoUninit>(from: &[T]) -> &[u8] {
    bytemuck::must_cast_slice(from)
}

/// Convert from `&[u8]` to `Vec<T>`, tolerating unaligned input.
#[must_use]
pub fn convert_from_bytes_slice<T: bytemuck::Pod>(from: &[u8]) -> Vec<T> {
    bytemuck::allocation::pod_collect_to_vec(from)
}

/// A scalar value, as produced by reductions and default-value accessors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    /// A boolean.
    Bool(bool),
    /// A signed integer (booleans and signed kinds promote here).
    Int(i64),
    /// An unsigned integer.
    UInt(u64),
    /// A single-precision float.
    F32(f32),
    /// A double-precision float.
    F64(f64),
}

impl Scalar {
    /// The value as an `f64`, whatever its kind.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Bool(v) => f64::from(u8::from(v)),
            Self::Int(v) => v as f64,
            Self::UInt(v) => v as f64,
            Self::F32(v) => f64::from(v),
            Self::F64(v) => v,
        }
    }
}

/// A plain-old-data Rust scalar that maps onto a [`Dtype`].
///
/// Implemented for `bool`, the fixed-width integers, `f32`, and `f64`. Byte
/// strings, UCS-4 strings, and opaque records enter through the byte-level
/// entry points instead.
pub trait Element: Copy + PartialEq + Send + Sync + 'static {
    /// The canonical descriptor for this type.
    fn dtype() -> Dtype;

    /// View a slice of elements as raw bytes.
    fn to_bytes(elements: &[Self]) -> &[u8];

    /// Copy raw bytes into a vector of elements.
    fn from_bytes(bytes: &[u8]) -> Vec<Self>;

    /// Read one element from raw bytes.
    fn from_atom(bytes: &[u8]) -> Self;
}

macro_rules! impl_element_pod {
    ($raw_type:ty, $kind:expr) => {
        impl Element for $raw_type {
            fn dtype() -> Dtype {
                Dtype {
                    kind: $kind,
                    itemsize: std::mem::size_of::<$raw_type>(),
                    shape: Vec::new(),
                }
            }

            fn to_bytes(elements: &[Self]) -> &[u8] {
                transmute_to_bytes(elements)
            }

            fn from_bytes(bytes: &[u8]) -> Vec<Self> {
                convert_from_bytes_slice(bytes)
            }

            fn from_atom(bytes: &[u8]) -> Self {
                bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<$raw_type>()])
            }
        }
    };
}

impl_element_pod!(i8, DtypeKind::Int);
impl_element_pod!(i16, DtypeKind::Int);
impl_element_pod!(i32, DtypeKind::Int);
impl_element_pod!(i64, DtypeKind::Int);
impl_element_pod!(u8, DtypeKind::UInt);
impl_element_pod!(u16, DtypeKind::UInt);
impl_element_pod!(u32, DtypeKind::UInt);
impl_element_pod!(u64, DtypeKind::UInt);
impl_element_pod!(f32, DtypeKind::Float);
impl_element_pod!(f64, DtypeKind::Float);

// bool has a validity constraint, so it cannot go through bytemuck.
impl Element for bool {
    fn dtype() -> Dtype {
        Dtype {
            kind: DtypeKind::Bool,
            itemsize: 1,
            shape: Vec::new(),
        }
    }

    fn to_bytes(elements: &[Self]) -> &[u8] {
        // SAFETY: bool is a single byte with values 0 or 1.
        unsafe { std::slice::from_raw_parts(elements.as_ptr().cast::<u8>(), elements.len()) }
    }

    fn from_bytes(bytes: &[u8]) -> Vec<Self> {
        bytes.iter().map(|&b| b != 0).collect()
    }

    fn from_atom(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_display_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        for descr in ["bool", "i1", "i4", "u2", "u8", "f4", "f8", "S5", "U3", "V16", "O"] {
            assert_eq!(Dtype::parse(descr)?.to_string(), descr);
        }
        let dt = Dtype::parse("(3,4)f8")?;
        assert_eq!(dt.kind(), DtypeKind::Float);
        assert_eq!(dt.shape(), &[3, 4]);
        assert_eq!(dt.atomsize(), 96);
        assert_eq!(dt.to_string(), "(3,4)f8");
        Ok(())
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Dtype::parse("i3").is_err());
        assert!(Dtype::parse("x4").is_err());
        assert!(Dtype::parse("(2").is_err());
        assert!(Dtype::parse("").is_err());
    }

    #[test]
    fn codec_typesizes() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(Dtype::parse("i4")?.codec_typesize(), 4);
        assert_eq!(Dtype::parse("S5")?.codec_typesize(), 1);
        assert_eq!(Dtype::parse("U3")?.codec_typesize(), 4);
        assert_eq!(Dtype::parse("V16")?.codec_typesize(), 16);
        assert_eq!(Dtype::parse("V1000")?.codec_typesize(), 1);
        Ok(())
    }

    #[test]
    fn atom_json_bridge() -> Result<(), Box<dyn std::error::Error>> {
        let dt = Dtype::parse("i4")?;
        let atom = (-7i32).to_ne_bytes();
        let json = dt.atom_to_json(&atom);
        assert_eq!(json, serde_json::json!(-7));
        assert_eq!(dt.atom_from_json(&json)?, atom);

        let dt = Dtype::parse("(2)u2")?;
        let atom = transmute_to_bytes(&[3u16, 9]).to_vec();
        let json = dt.atom_to_json(&atom);
        assert_eq!(json, serde_json::json!([3, 9]));
        assert_eq!(dt.atom_from_json(&json)?, atom);

        let dt = Dtype::parse("S3")?;
        let json = dt.atom_to_json(b"ab\0");
        assert_eq!(dt.atom_from_json(&json)?, b"ab\0");
        Ok(())
    }

    #[test]
    fn element_conversions() {
        assert_eq!(i32::dtype().to_string(), "i4");
        assert_eq!(bool::dtype().to_string(), "bool");
        let bytes = <i32 as Element>::to_bytes(&[1, 2, 3]);
        assert_eq!(bytes.len(), 12);
        assert_eq!(<i32 as Element>::from_bytes(bytes), vec![1, 2, 3]);
        assert_eq!(<bool as Element>::from_bytes(&[0, 1, 2]), vec![false, true, true]);
    }
}
