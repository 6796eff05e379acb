//! Wire constants and `DType` tag tables.
//!
//! Element and attribute types share one tag space. Tags 6 and 7 are the
//! schema's 64-bit integers and are never emitted.

use crate::array::{AttributeType, ElementType};

/// FlatBuffers file identifier carried at bytes 4..8 of every frame.
pub const FILE_IDENTIFIER: &str = "NDAr";

pub const TAG_INT8: i8 = 0;
pub const TAG_UINT8: i8 = 1;
pub const TAG_INT16: i8 = 2;
pub const TAG_UINT16: i8 = 3;
pub const TAG_INT32: i8 = 4;
pub const TAG_UINT32: i8 = 5;
pub const TAG_FLOAT32: i8 = 8;
pub const TAG_FLOAT64: i8 = 9;
pub const TAG_C_STRING: i8 = 10;

pub fn element_tag(element_type: ElementType) -> i8 {
    match element_type {
        ElementType::Int8 => TAG_INT8,
        ElementType::UInt8 => TAG_UINT8,
        ElementType::Int16 => TAG_INT16,
        ElementType::UInt16 => TAG_UINT16,
        ElementType::Int32 => TAG_INT32,
        ElementType::UInt32 => TAG_UINT32,
        ElementType::Float32 => TAG_FLOAT32,
        ElementType::Float64 => TAG_FLOAT64,
    }
}

pub fn element_type_from_tag(tag: i8) -> Option<ElementType> {
    match tag {
        TAG_INT8 => Some(ElementType::Int8),
        TAG_UINT8 => Some(ElementType::UInt8),
        TAG_INT16 => Some(ElementType::Int16),
        TAG_UINT16 => Some(ElementType::UInt16),
        TAG_INT32 => Some(ElementType::Int32),
        TAG_UINT32 => Some(ElementType::UInt32),
        TAG_FLOAT32 => Some(ElementType::Float32),
        TAG_FLOAT64 => Some(ElementType::Float64),
        _ => None,
    }
}

pub fn attribute_tag(attribute_type: AttributeType) -> i8 {
    match attribute_type {
        AttributeType::Int8 => TAG_INT8,
        AttributeType::UInt8 => TAG_UINT8,
        AttributeType::Int16 => TAG_INT16,
        AttributeType::UInt16 => TAG_UINT16,
        AttributeType::Int32 => TAG_INT32,
        AttributeType::UInt32 => TAG_UINT32,
        AttributeType::Float32 => TAG_FLOAT32,
        AttributeType::Float64 => TAG_FLOAT64,
        AttributeType::String => TAG_C_STRING,
    }
}

pub fn attribute_type_from_tag(tag: i8) -> Option<AttributeType> {
    match tag {
        TAG_INT8 => Some(AttributeType::Int8),
        TAG_UINT8 => Some(AttributeType::UInt8),
        TAG_INT16 => Some(AttributeType::Int16),
        TAG_UINT16 => Some(AttributeType::UInt16),
        TAG_INT32 => Some(AttributeType::Int32),
        TAG_UINT32 => Some(AttributeType::UInt32),
        TAG_FLOAT32 => Some(AttributeType::Float32),
        TAG_FLOAT64 => Some(AttributeType::Float64),
        TAG_C_STRING => Some(AttributeType::String),
        _ => None,
    }
}
