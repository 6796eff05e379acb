//! Binary codec for array frames.
//!
//! Frames are FlatBuffers built against `schemas/ndarray.fbs` and tagged
//! with the `NDAr` file identifier. Decoding runs the FlatBuffers verifier
//! over the whole buffer, then checks shape, type tags and attribute records
//! before anything is copied out; see [`verify`].

pub mod schema;
pub mod wire;

use std::collections::HashSet;

use flatbuffers::{FlatBufferBuilder, VerifierOptions};
use tracing::trace;

use crate::array::{
    expected_data_len, ArrayError, ArrayPayload, Attribute, AttributeValue, EpochTime, MAX_DIMS,
};
use schema::{EpicsTimeStamp, NdArray, NdArrayArgs, NdAttribute, NdAttributeArgs};

pub use wire::FILE_IDENTIFIER;

/// Initial capacity of the reusable builder (1 MiB).
pub const DEFAULT_ENCODE_CAPACITY: usize = 1_048_576;

/// Largest frame a FlatBuffer can address.
pub const MAX_FRAME_LEN: usize = (1 << 31) - 1;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed buffer: {0}")]
    MalformedBuffer(String),

    #[error("Duplicate attribute name '{0}'")]
    DuplicateAttribute(String),

    #[error("Attribute names must not be empty")]
    EmptyAttributeName,

    #[error("String attribute '{0}' contains an interior NUL")]
    InteriorNul(String),

    #[error("Field '{field}' is too large to encode ({len} bytes)")]
    FieldTooLarge { field: &'static str, len: usize },

    #[error(transparent)]
    Array(#[from] ArrayError),
}

/// Encoder/decoder holding one reusable FlatBuffers builder.
///
/// The slice returned by [`ArrayCodec::encode`] borrows the codec and is
/// invalidated by the next `encode` call; copy it if it must outlive that.
/// One instance per thread.
pub struct ArrayCodec {
    builder: FlatBufferBuilder<'static>,
}

impl std::fmt::Debug for ArrayCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayCodec").finish_non_exhaustive()
    }
}

impl Default for ArrayCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ArrayCodec {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ENCODE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            builder: FlatBufferBuilder::with_capacity(capacity),
        }
    }

    /// Serialize `array` into the codec's builder and return the finished frame.
    pub fn encode(&mut self, array: &ArrayPayload) -> Result<&[u8]> {
        check_attributes(array)?;
        let len = encoded_len_hint(array);
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FieldTooLarge { field: "frame", len });
        }

        let fbb = &mut self.builder;
        fbb.reset();

        // Dims go first: their 8-byte elements leave no padding at the end of
        // the buffer, so every truncated frame fails verification.
        let dims: Vec<u64> = array.dims().iter().map(|&extent| extent as u64).collect();
        let dims = fbb.create_vector(&dims[..]);
        let data = fbb.create_vector(array.data());

        let mut attributes = Vec::with_capacity(array.attributes.len());
        for attribute in &array.attributes {
            let name = fbb.create_string(&attribute.name);
            let description = fbb.create_string(&attribute.description);
            let source = fbb.create_string(&attribute.source);
            let value = attribute.value.to_bytes();
            let value = fbb.create_vector(&value[..]);
            attributes.push(NdAttribute::create(
                fbb,
                &NdAttributeArgs {
                    name: Some(name),
                    description: Some(description),
                    source: Some(source),
                    data_type: wire::attribute_tag(attribute.data_type()),
                    value: Some(value),
                },
            ));
        }
        let attributes = fbb.create_vector(&attributes[..]);

        let root = NdArray::create(
            fbb,
            &NdArrayArgs {
                id: array.unique_id,
                timestamp: array.timestamp,
                epics_ts: Some(EpicsTimeStamp::new(array.epoch.sec, array.epoch.nsec)),
                dims: Some(dims),
                data_type: wire::element_tag(array.element_type()),
                data: Some(data),
                attributes: Some(attributes),
            },
        );
        fbb.finish(root, Some(FILE_IDENTIFIER));

        let frame = self.builder.finished_data();
        trace!(
            unique_id = array.unique_id,
            bytes = frame.len(),
            attributes = array.attributes.len(),
            "Encoded array"
        );
        Ok(frame)
    }

    /// Verify and decode a frame into a freshly allocated array.
    pub fn decode(&self, buf: &[u8]) -> Result<ArrayPayload> {
        decode(buf)
    }
}

/// Run the FlatBuffers verifier and return the root table.
///
/// Only framing is checked here; [`decode`] additionally validates shape,
/// type tags and attribute records.
pub fn verify(buf: &[u8]) -> Result<NdArray<'_>> {
    if buf.len() < 8 || !flatbuffers::buffer_has_identifier(buf, FILE_IDENTIFIER, false) {
        return Err(malformed(format!(
            "missing '{}' file identifier",
            FILE_IDENTIFIER
        )));
    }
    let options = VerifierOptions::default();
    flatbuffers::root_with_opts::<NdArray>(&options, buf).map_err(|e| malformed(e.to_string()))
}

/// Verify and decode a frame.
pub fn decode(buf: &[u8]) -> Result<ArrayPayload> {
    let frame = verify(buf)?;

    let dims = frame.dims().ok_or_else(|| malformed("missing dims"))?;
    if !(1..=MAX_DIMS).contains(&dims.len()) {
        return Err(malformed(format!("invalid dimension count {}", dims.len())));
    }
    let dims = dims
        .iter()
        .map(|extent| {
            usize::try_from(extent)
                .map_err(|_| malformed(format!("dimension {} exceeds address space", extent)))
        })
        .collect::<Result<Vec<_>>>()?;

    let tag = frame.data_type();
    let element_type = wire::element_type_from_tag(tag)
        .ok_or_else(|| malformed(format!("unknown element tag {}", tag)))?;
    let expected = expected_data_len(element_type, &dims)
        .map_err(|e| malformed(format!("invalid shape: {}", e)))?;
    let data = frame.data().map(|v| v.bytes()).unwrap_or(&[]);
    if data.len() != expected {
        return Err(malformed(format!(
            "data length {} does not match shape ({} bytes)",
            data.len(),
            expected
        )));
    }

    let mut array = ArrayPayload::new(element_type, dims, data.to_vec())
        .map_err(|e| malformed(e.to_string()))?;
    array.unique_id = frame.id();
    array.timestamp = frame.timestamp();
    array.epoch = frame
        .epics_ts()
        .map(|ts| EpochTime::new(ts.sec_past_epoch(), ts.nsec()))
        .unwrap_or_default();

    if let Some(records) = frame.attributes() {
        let mut names = HashSet::with_capacity(records.len());
        let mut attributes = Vec::with_capacity(records.len());
        for record in records.iter() {
            let attribute = read_attribute(record)?;
            if !names.insert(attribute.name.clone()) {
                return Err(malformed(format!(
                    "duplicate attribute name '{}'",
                    attribute.name
                )));
            }
            attributes.push(attribute);
        }
        array.attributes = attributes;
    }
    Ok(array)
}

fn read_attribute(record: NdAttribute<'_>) -> Result<Attribute> {
    let name = record.name().unwrap_or_default();
    if name.is_empty() {
        return Err(malformed("empty attribute name"));
    }
    let tag = record.data_type();
    let data_type = wire::attribute_type_from_tag(tag)
        .ok_or_else(|| malformed(format!("attribute '{}' has unknown tag {}", name, tag)))?;
    let bytes = record.value().map(|v| v.bytes()).unwrap_or(&[]);
    let value = AttributeValue::from_bytes(data_type, bytes).ok_or_else(|| {
        malformed(format!(
            "attribute '{}' value does not match {:?}",
            name, data_type
        ))
    })?;
    Ok(Attribute::new(
        name,
        record.description().unwrap_or_default(),
        record.source().unwrap_or_default(),
        value,
    ))
}

/// Reject attribute sets the decoder would refuse.
fn check_attributes(array: &ArrayPayload) -> Result<()> {
    let mut seen = HashSet::with_capacity(array.attributes.len());
    for attribute in &array.attributes {
        if attribute.name.is_empty() {
            return Err(CodecError::EmptyAttributeName);
        }
        if !seen.insert(attribute.name.as_str()) {
            return Err(CodecError::DuplicateAttribute(attribute.name.clone()));
        }
        if let AttributeValue::String(text) = &attribute.value {
            if text.contains('\0') {
                return Err(CodecError::InteriorNul(attribute.name.clone()));
            }
        }
    }
    Ok(())
}

/// Upper bound on the finished frame size, vtables and padding included.
fn encoded_len_hint(array: &ArrayPayload) -> usize {
    let fixed = 64 + 8 * array.dims().len() + 8;
    let attributes: usize = array
        .attributes
        .iter()
        .map(|a| {
            let value = match &a.value {
                AttributeValue::String(text) => text.len() + 1,
                other => other.data_type().fixed_size().unwrap_or(0),
            };
            48 + 3 * 8 + a.name.len() + a.description.len() + a.source.len() + value + 8
        })
        .sum();
    fixed
        .saturating_add(array.data().len())
        .saturating_add(attributes)
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::MalformedBuffer(reason.into())
}

#[cfg(test)]
mod tests;
