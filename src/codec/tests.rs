use super::*;
use crate::array::{Attribute, AttributeValue, ElementType, EpochTime};

fn sample_array() -> ArrayPayload {
    let values: Vec<u16> = (0..12).collect();
    ArrayPayload::from_elements(vec![4, 3], &values)
        .unwrap()
        .with_id(42)
        .with_epoch(EpochTime::new(1_000, 250))
        .with_attribute(Attribute::new(
            "exposure",
            "Exposure time",
            "driver",
            AttributeValue::Float64(0.125),
        ))
        .with_attribute(Attribute::new(
            "camera",
            "Camera model",
            "ioc",
            AttributeValue::String("ccd-7".to_string()),
        ))
}

fn encoded(array: &ArrayPayload) -> Vec<u8> {
    ArrayCodec::new().encode(array).unwrap().to_vec()
}

/// Frame built straight from the schema, for contents `encode` never emits.
fn raw_frame(data_type: i8, dims: &[u64], data: &[u8], attributes: &[(&str, i8, &[u8])]) -> Vec<u8> {
    let mut fbb = FlatBufferBuilder::new();
    let dims = fbb.create_vector(dims);
    let data = fbb.create_vector(data);
    let mut records = Vec::new();
    for &(name, tag, value) in attributes {
        let name = fbb.create_string(name);
        let value = fbb.create_vector(value);
        records.push(NdAttribute::create(
            &mut fbb,
            &NdAttributeArgs {
                name: Some(name),
                data_type: tag,
                value: Some(value),
                ..Default::default()
            },
        ));
    }
    let records = fbb.create_vector(&records[..]);
    let root = NdArray::create(
        &mut fbb,
        &NdArrayArgs {
            dims: Some(dims),
            data_type,
            data: Some(data),
            attributes: Some(records),
            ..Default::default()
        },
    );
    fbb.finish(root, Some(FILE_IDENTIFIER));
    fbb.finished_data().to_vec()
}

fn is_malformed(buf: &[u8]) -> bool {
    matches!(decode(buf), Err(CodecError::MalformedBuffer(_)))
}

// ============================================================================
// Encode
// ============================================================================

#[test]
fn test_encode_decode_preserves_all_fields() {
    let array = sample_array();
    let mut codec = ArrayCodec::new();
    let bytes = codec.encode(&array).unwrap().to_vec();

    let decoded = codec.decode(&bytes).unwrap();

    assert_eq!(decoded, array);
    assert_eq!(decoded.unique_id, 42);
    assert_eq!(decoded.epoch, EpochTime::new(1_000, 250));
    assert_eq!(decoded.dims(), &[4, 3]);
    assert_eq!(decoded.elements::<u16>().unwrap()[11], 11);
}

#[test]
fn test_encoded_frame_carries_file_identifier() {
    let bytes = encoded(&sample_array());
    assert_eq!(&bytes[4..8], b"NDAr");
    assert!(flatbuffers::buffer_has_identifier(
        &bytes,
        FILE_IDENTIFIER,
        false
    ));
}

#[test]
fn test_encode_reuses_builder() {
    let mut codec = ArrayCodec::with_capacity(64);
    let big = ArrayPayload::zeroed(ElementType::Float64, vec![64, 64]).unwrap();
    let small = ArrayPayload::from_elements(vec![3], &[1u8, 2, 3]).unwrap();

    assert!(codec.encode(&big).unwrap().len() > 64 * 64 * 8);
    let reused = codec.encode(&small).unwrap().to_vec();

    assert_eq!(reused, encoded(&small));
    assert_eq!(decode(&reused).unwrap(), small);
}

#[test]
fn test_negative_epoch_roundtrips() {
    let array = ArrayPayload::zeroed(ElementType::Int8, vec![1])
        .unwrap()
        .with_epoch(EpochTime::new(-86_400, 1));
    assert_eq!(decode(&encoded(&array)).unwrap().epoch.sec, -86_400);
}

#[test]
fn test_encode_rejects_duplicate_attribute_names() {
    let mut array = sample_array();
    array.attributes.push(Attribute::new(
        "exposure",
        "",
        "",
        AttributeValue::Int32(1),
    ));

    let result = ArrayCodec::new().encode(&array).map(|b| b.len());
    assert_eq!(
        result,
        Err(CodecError::DuplicateAttribute("exposure".to_string()))
    );
}

#[test]
fn test_attribute_names_are_case_sensitive() {
    let array = sample_array().with_attribute(Attribute::new(
        "Exposure",
        "",
        "",
        AttributeValue::Int8(-1),
    ));
    let decoded = decode(&encoded(&array)).unwrap();
    assert_eq!(decoded.attributes.len(), 3);
}

#[test]
fn test_encode_rejects_empty_attribute_name() {
    let mut array = sample_array();
    array
        .attributes
        .push(Attribute::new("", "", "", AttributeValue::UInt8(0)));
    let result = ArrayCodec::new().encode(&array).map(|b| b.len());
    assert_eq!(result, Err(CodecError::EmptyAttributeName));
}

#[test]
fn test_encode_rejects_string_with_interior_nul() {
    let array = sample_array().with_attribute(Attribute::new(
        "label",
        "",
        "",
        AttributeValue::String("a\0b".to_string()),
    ));

    let result = ArrayCodec::new().encode(&array).map(|b| b.len());
    assert_eq!(result, Err(CodecError::InteriorNul("label".to_string())));
}

#[test]
fn test_nul_in_description_still_roundtrips() {
    // Only string values are NUL-terminated on the wire
    let array = sample_array().with_attribute(Attribute::new(
        "label",
        "two\0parts",
        "",
        AttributeValue::String("ab".to_string()),
    ));
    assert_eq!(decode(&encoded(&array)).unwrap(), array);
}

// ============================================================================
// Verify and decode
// ============================================================================

#[test]
fn test_decode_empty_buffer_is_malformed() {
    assert!(is_malformed(&[]));
}

#[test]
fn test_decode_every_truncation_is_malformed() {
    let bytes = encoded(&sample_array());
    for len in 0..bytes.len() {
        assert!(is_malformed(&bytes[..len]), "prefix of {} bytes was accepted", len);
    }
}

#[test]
fn test_decode_rejects_wrong_file_identifier() {
    let mut bytes = encoded(&sample_array());
    bytes[4] = b'X';
    assert!(is_malformed(&bytes));
}

#[test]
fn test_decode_rejects_out_of_range_root() {
    let mut bytes = vec![0xff; 32];
    bytes[4..8].copy_from_slice(b"NDAr");
    assert!(is_malformed(&bytes));
}

#[test]
fn test_raw_frame_decodes() {
    let data: Vec<u8> = [1i32, 2].iter().flat_map(|v| v.to_le_bytes()).collect();
    let gain = 7i32.to_le_bytes();
    let bytes = raw_frame(wire::TAG_INT32, &[2], &data, &[("gain", wire::TAG_INT32, &gain[..])]);

    let array = decode(&bytes).unwrap();
    assert_eq!(array.elements::<i32>().unwrap(), vec![1, 2]);
    assert_eq!(
        array.attribute("gain").map(|a| &a.value),
        Some(&AttributeValue::Int32(7))
    );
    assert_eq!(array.attribute("gain").map(|a| a.description.as_str()), Some(""));
}

#[test]
fn test_decode_rejects_unknown_element_tag() {
    // int64 exists in the schema but not as an array type
    assert!(is_malformed(&raw_frame(6, &[2], &[0; 16], &[])));
    assert!(is_malformed(&raw_frame(wire::TAG_C_STRING, &[2], &[0; 2], &[])));
    assert!(is_malformed(&raw_frame(-1, &[2], &[0; 2], &[])));
}

#[test]
fn test_decode_rejects_data_length_not_matching_shape() {
    assert!(is_malformed(&raw_frame(wire::TAG_INT16, &[2], &[0; 8], &[])));
    assert!(!is_malformed(&raw_frame(wire::TAG_INT16, &[2], &[0; 4], &[])));
}

#[test]
fn test_decode_rejects_bad_dimension_count() {
    assert!(is_malformed(&raw_frame(wire::TAG_UINT8, &[], &[], &[])));
    assert!(is_malformed(&raw_frame(wire::TAG_UINT8, &[1; 11], &[0], &[])));
}

#[test]
fn test_decode_rejects_duplicate_attribute_names_in_buffer() {
    let one = [1u8];
    let bytes = raw_frame(
        wire::TAG_UINT8,
        &[1],
        &[7],
        &[("aa", wire::TAG_UINT8, &one[..]), ("aa", wire::TAG_UINT8, &one[..])],
    );

    let result = decode(&bytes);
    assert!(
        matches!(result, Err(CodecError::MalformedBuffer(ref reason)) if reason.contains("duplicate"))
    );
}

#[test]
fn test_decode_rejects_bad_attribute_records() {
    fn frame(name: &str, tag: i8, value: &[u8]) -> Vec<u8> {
        raw_frame(wire::TAG_UINT8, &[1], &[7], &[(name, tag, value)])
    }

    assert!(!is_malformed(&frame("s", wire::TAG_C_STRING, b"xy\0")));
    assert!(is_malformed(&frame("s", wire::TAG_C_STRING, b"xy")));
    assert!(is_malformed(&frame("s", wire::TAG_C_STRING, b"x\0y\0")));
    assert!(is_malformed(&frame("", wire::TAG_UINT8, &[1])));
    assert!(is_malformed(&frame("n", wire::TAG_INT32, &[1, 2])));
    assert!(is_malformed(&frame("n", 7, &[0; 8])));
}

#[test]
fn test_verify_exposes_zero_copy_view() {
    let array = sample_array();
    let bytes = encoded(&array);

    let frame = verify(&bytes).unwrap();

    assert_eq!(frame.id(), 42);
    assert_eq!(frame.data_type(), wire::TAG_UINT16);
    assert_eq!(frame.data().map(|v| v.bytes()), Some(array.data()));
    assert_eq!(frame.epics_ts().map(|ts| ts.nsec()), Some(250));

    let attributes = frame.attributes().unwrap();
    assert_eq!(attributes.len(), 2);
    assert_eq!(attributes.get(1).name(), Some("camera"));
    assert_eq!(attributes.get(1).value().map(|v| v.bytes()), Some(&b"ccd-7\0"[..]));
}
