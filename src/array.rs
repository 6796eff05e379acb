//! Array payload data model.
//!
//! An [`ArrayPayload`] is one detector frame: a dense, row-major block of
//! typed elements together with its identity, timestamps and a set of named
//! [`Attribute`]s. Element bytes are stored little-endian.

use chrono::Utc;
use serde::Deserialize;

/// Maximum number of dimensions an array may declare.
pub const MAX_DIMS: usize = 10;

/// Seconds between the UNIX epoch and the EPICS epoch (1990-01-01T00:00:00Z).
pub const EPICS_EPOCH_OFFSET_SECS: i64 = 631_152_000;

/// Errors raised when constructing an array whose shape and data disagree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArrayError {
    #[error("Array must have between 1 and {max} dimensions, got {got}", max = MAX_DIMS)]
    DimensionCount { got: usize },

    #[error("Element count overflows for dimensions {0:?}")]
    ShapeOverflow(Vec<usize>),

    #[error("Data length mismatch: expected {expected} bytes, got {actual}")]
    DataLengthMismatch { expected: usize, actual: usize },
}

// ============================================================================
// Types
// ============================================================================

/// Numeric element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl ElementType {
    pub const ALL: [ElementType; 8] = [
        ElementType::Int8,
        ElementType::UInt8,
        ElementType::Int16,
        ElementType::UInt16,
        ElementType::Int32,
        ElementType::UInt32,
        ElementType::Float32,
        ElementType::Float64,
    ];

    /// Width of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            ElementType::Int8 | ElementType::UInt8 => 1,
            ElementType::Int16 | ElementType::UInt16 => 2,
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float32 => 4,
            ElementType::Float64 => 8,
        }
    }
}

/// Value type of an attribute: every element type plus a NUL-terminated string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
    String,
}

impl AttributeType {
    pub const ALL: [AttributeType; 9] = [
        AttributeType::Int8,
        AttributeType::UInt8,
        AttributeType::Int16,
        AttributeType::UInt16,
        AttributeType::Int32,
        AttributeType::UInt32,
        AttributeType::Float32,
        AttributeType::Float64,
        AttributeType::String,
    ];

    /// Width of the value in bytes, `None` for strings.
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            AttributeType::Int8 | AttributeType::UInt8 => Some(1),
            AttributeType::Int16 | AttributeType::UInt16 => Some(2),
            AttributeType::Int32 | AttributeType::UInt32 | AttributeType::Float32 => Some(4),
            AttributeType::Float64 => Some(8),
            AttributeType::String => None,
        }
    }
}

impl From<ElementType> for AttributeType {
    fn from(value: ElementType) -> Self {
        match value {
            ElementType::Int8 => AttributeType::Int8,
            ElementType::UInt8 => AttributeType::UInt8,
            ElementType::Int16 => AttributeType::Int16,
            ElementType::UInt16 => AttributeType::UInt16,
            ElementType::Int32 => AttributeType::Int32,
            ElementType::UInt32 => AttributeType::UInt32,
            ElementType::Float32 => AttributeType::Float32,
            ElementType::Float64 => AttributeType::Float64,
        }
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float32(f32),
    Float64(f64),
    String(String),
}

impl AttributeValue {
    pub fn data_type(&self) -> AttributeType {
        match self {
            AttributeValue::Int8(_) => AttributeType::Int8,
            AttributeValue::UInt8(_) => AttributeType::UInt8,
            AttributeValue::Int16(_) => AttributeType::Int16,
            AttributeValue::UInt16(_) => AttributeType::UInt16,
            AttributeValue::Int32(_) => AttributeType::Int32,
            AttributeValue::UInt32(_) => AttributeType::UInt32,
            AttributeValue::Float32(_) => AttributeType::Float32,
            AttributeValue::Float64(_) => AttributeType::Float64,
            AttributeValue::String(_) => AttributeType::String,
        }
    }

    /// Byte-exact value buffer. Strings carry a trailing NUL.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            AttributeValue::Int8(v) => v.to_le_bytes().to_vec(),
            AttributeValue::UInt8(v) => v.to_le_bytes().to_vec(),
            AttributeValue::Int16(v) => v.to_le_bytes().to_vec(),
            AttributeValue::UInt16(v) => v.to_le_bytes().to_vec(),
            AttributeValue::Int32(v) => v.to_le_bytes().to_vec(),
            AttributeValue::UInt32(v) => v.to_le_bytes().to_vec(),
            AttributeValue::Float32(v) => v.to_le_bytes().to_vec(),
            AttributeValue::Float64(v) => v.to_le_bytes().to_vec(),
            AttributeValue::String(s) => {
                let mut bytes = Vec::with_capacity(s.len() + 1);
                bytes.extend_from_slice(s.as_bytes());
                bytes.push(0);
                bytes
            }
        }
    }

    /// Rebuild a value from its byte buffer.
    ///
    /// Returns `None` if the width does not match the type, or if a string
    /// value is not NUL-terminated UTF-8 without interior NULs.
    pub fn from_bytes(data_type: AttributeType, bytes: &[u8]) -> Option<Self> {
        if let Some(width) = data_type.fixed_size() {
            if bytes.len() != width {
                return None;
            }
        }
        let value = match data_type {
            AttributeType::Int8 => AttributeValue::Int8(i8::from_le_bytes(le_array(bytes)?)),
            AttributeType::UInt8 => AttributeValue::UInt8(u8::from_le_bytes(le_array(bytes)?)),
            AttributeType::Int16 => AttributeValue::Int16(i16::from_le_bytes(le_array(bytes)?)),
            AttributeType::UInt16 => AttributeValue::UInt16(u16::from_le_bytes(le_array(bytes)?)),
            AttributeType::Int32 => AttributeValue::Int32(i32::from_le_bytes(le_array(bytes)?)),
            AttributeType::UInt32 => AttributeValue::UInt32(u32::from_le_bytes(le_array(bytes)?)),
            AttributeType::Float32 => {
                AttributeValue::Float32(f32::from_le_bytes(le_array(bytes)?))
            }
            AttributeType::Float64 => {
                AttributeValue::Float64(f64::from_le_bytes(le_array(bytes)?))
            }
            AttributeType::String => {
                let (terminator, text) = bytes.split_last()?;
                if *terminator != 0 || text.contains(&0) {
                    return None;
                }
                AttributeValue::String(std::str::from_utf8(text).ok()?.to_string())
            }
        };
        Some(value)
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.try_into().ok()
}

/// Named, typed metadata value attached to an array.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub description: String,
    pub source: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        source: impl Into<String>,
        value: AttributeValue,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            source: source.into(),
            value,
        }
    }

    pub fn data_type(&self) -> AttributeType {
        self.value.data_type()
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Epoch timestamp as a seconds/nanoseconds pair, counted from the EPICS epoch.
///
/// Both halves are `int` on the wire, matching the frame schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EpochTime {
    pub sec: i32,
    pub nsec: i32,
}

impl EpochTime {
    pub fn new(sec: i32, nsec: i32) -> Self {
        Self { sec, nsec }
    }

    /// Current wall-clock time, clamped to `0..=i32::MAX` seconds past the EPICS epoch.
    pub fn now() -> Self {
        let now = Utc::now();
        let sec = now.timestamp() - EPICS_EPOCH_OFFSET_SECS;
        Self {
            sec: i32::try_from(sec.max(0)).unwrap_or(i32::MAX),
            nsec: i32::try_from(now.timestamp_subsec_nanos()).unwrap_or(i32::MAX),
        }
    }

    /// Seconds as a float, the convenience form stored in `ArrayPayload::timestamp`.
    pub fn as_secs_f64(&self) -> f64 {
        f64::from(self.sec) + f64::from(self.nsec) / 1e9
    }
}

// ============================================================================
// Elements
// ============================================================================

mod sealed {
    pub trait Sealed {}
}

/// Rust scalar types that can back an array.
pub trait Element: Copy + sealed::Sealed {
    const TYPE: ElementType;

    fn append_le(self, out: &mut Vec<u8>);

    /// `bytes` is exactly `Self::TYPE.size()` long.
    fn read_le(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident) => {
        impl sealed::Sealed for $t {}

        impl Element for $t {
            const TYPE: ElementType = ElementType::$variant;

            fn append_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Option<Self> {
                Some(<$t>::from_le_bytes(le_array(bytes)?))
            }
        }
    };
}

impl_element!(i8, Int8);
impl_element!(u8, UInt8);
impl_element!(i16, Int16);
impl_element!(u16, UInt16);
impl_element!(i32, Int32);
impl_element!(u32, UInt32);
impl_element!(f32, Float32);
impl_element!(f64, Float64);

// ============================================================================
// ArrayPayload
// ============================================================================

/// One detector frame plus metadata.
///
/// Shape and data are validated on construction: `data.len()` always equals
/// `product(dims) * element_type.size()`. Attribute names are expected to be
/// unique; [`ArrayPayload::set_attribute`] replaces by name, and the codec
/// rejects duplicates pushed directly onto `attributes`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayPayload {
    pub unique_id: i32,
    /// Convenience timestamp in seconds.
    pub timestamp: f64,
    pub epoch: EpochTime,
    pub attributes: Vec<Attribute>,
    element_type: ElementType,
    dims: Vec<usize>,
    data: Vec<u8>,
}

impl ArrayPayload {
    /// Create an array from raw little-endian element bytes.
    pub fn new(
        element_type: ElementType,
        dims: Vec<usize>,
        data: Vec<u8>,
    ) -> Result<Self, ArrayError> {
        let expected = expected_data_len(element_type, &dims)?;
        if data.len() != expected {
            return Err(ArrayError::DataLengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            unique_id: 0,
            timestamp: 0.0,
            epoch: EpochTime::default(),
            attributes: Vec::new(),
            element_type,
            dims,
            data,
        })
    }

    /// Create a zero-filled array.
    pub fn zeroed(element_type: ElementType, dims: Vec<usize>) -> Result<Self, ArrayError> {
        let len = expected_data_len(element_type, &dims)?;
        Self::new(element_type, dims, vec![0; len])
    }

    /// Create an array from typed elements.
    pub fn from_elements<T: Element>(dims: Vec<usize>, values: &[T]) -> Result<Self, ArrayError> {
        let mut data = Vec::with_capacity(values.len() * T::TYPE.size());
        for value in values {
            value.append_le(&mut data);
        }
        Self::new(T::TYPE, dims, data)
    }

    pub fn with_id(mut self, unique_id: i32) -> Self {
        self.unique_id = unique_id;
        self
    }

    /// Stamp both timestamps from one epoch time.
    pub fn with_epoch(mut self, epoch: EpochTime) -> Self {
        self.epoch = epoch;
        self.timestamp = epoch.as_secs_f64();
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.set_attribute(attribute);
        self
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Typed view of the elements, `None` if `T` is not the array's element type.
    pub fn elements<T: Element>(&self) -> Option<Vec<T>> {
        if T::TYPE != self.element_type {
            return None;
        }
        self.data
            .chunks_exact(T::TYPE.size())
            .map(T::read_le)
            .collect()
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Insert an attribute, replacing any existing attribute with the same name.
    pub fn set_attribute(&mut self, attribute: Attribute) {
        match self.attributes.iter_mut().find(|a| a.name == attribute.name) {
            Some(existing) => *existing = attribute,
            None => self.attributes.push(attribute),
        }
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        let index = self.attributes.iter().position(|a| a.name == name)?;
        Some(self.attributes.remove(index))
    }
}

/// Byte length implied by an element type and a shape.
pub fn expected_data_len(element_type: ElementType, dims: &[usize]) -> Result<usize, ArrayError> {
    if dims.is_empty() || dims.len() > MAX_DIMS {
        return Err(ArrayError::DimensionCount { got: dims.len() });
    }
    dims.iter()
        .try_fold(element_type.size(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| ArrayError::ShapeOverflow(dims.to_vec()))
}
