//! Codec round-trip matrix.
//!
//! Every element type, dimension counts 1-4 and attribute counts 0, 1 and
//! many, with random contents from a fixed seed.
//!
//! Run with: cargo test --test codec_roundtrip

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ndstream::array::{ArrayPayload, Attribute, AttributeValue, ElementType, EpochTime};
use ndstream::codec::{self, ArrayCodec, CodecError};

const ATTRIBUTE_COUNTS: [usize; 3] = [0, 1, 12];

fn random_dims(rng: &mut StdRng, count: usize) -> Vec<usize> {
    (0..count).map(|_| rng.random_range(1..=6)).collect()
}

fn random_value(rng: &mut StdRng, index: usize) -> AttributeValue {
    match index % 9 {
        0 => AttributeValue::Int8(rng.random()),
        1 => AttributeValue::UInt8(rng.random()),
        2 => AttributeValue::Int16(rng.random()),
        3 => AttributeValue::UInt16(rng.random()),
        4 => AttributeValue::Int32(rng.random()),
        5 => AttributeValue::UInt32(rng.random()),
        6 => AttributeValue::Float32(rng.random_range(-1.0e6..1.0e6)),
        7 => AttributeValue::Float64(rng.random_range(-1.0e12..1.0e12)),
        _ => AttributeValue::String(format!("value-{}", rng.random::<u32>())),
    }
}

fn random_array(
    rng: &mut StdRng,
    element_type: ElementType,
    dims: usize,
    attributes: usize,
) -> ArrayPayload {
    let dims = random_dims(rng, dims);
    let mut array = ArrayPayload::zeroed(element_type, dims)
        .unwrap()
        .with_id(rng.random())
        .with_epoch(EpochTime::new(rng.random(), rng.random_range(0..1_000_000_000)));
    rng.fill(array.data_mut());

    for i in 0..attributes {
        array.set_attribute(Attribute::new(
            format!("attr{}", i),
            format!("description of attribute {}", i),
            if i % 2 == 0 { "driver" } else { "" },
            random_value(rng, i),
        ));
    }
    array
}

fn sorted_attributes(array: &ArrayPayload) -> Vec<Attribute> {
    let mut attributes = array.attributes.clone();
    attributes.sort_by(|a, b| a.name.cmp(&b.name));
    attributes
}

#[test]
fn test_roundtrip_matrix() {
    let mut rng = StdRng::seed_from_u64(0x6e64_7374);
    let mut codec = ArrayCodec::new();

    for element_type in ElementType::ALL {
        for dims in 1..=4 {
            for attributes in ATTRIBUTE_COUNTS {
                let array = random_array(&mut rng, element_type, dims, attributes);
                let encoded = codec.encode(&array).unwrap().to_vec();
                let decoded = codec::decode(&encoded).unwrap();

                let case = format!("{:?} dims={} attributes={}", element_type, dims, attributes);
                assert_eq!(decoded.unique_id, array.unique_id, "{}", case);
                assert_eq!(decoded.timestamp.to_bits(), array.timestamp.to_bits(), "{}", case);
                assert_eq!(decoded.epoch, array.epoch, "{}", case);
                assert_eq!(decoded.element_type(), element_type, "{}", case);
                assert_eq!(decoded.dims(), array.dims(), "{}", case);
                assert_eq!(decoded.data(), array.data(), "{}", case);
                assert_eq!(sorted_attributes(&decoded), sorted_attributes(&array), "{}", case);
            }
        }
    }
}

#[test]
fn test_decode_does_not_alias_codec_buffer() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut codec = ArrayCodec::new();
    let first = random_array(&mut rng, ElementType::Float64, 2, 1);
    let second = random_array(&mut rng, ElementType::Int8, 3, 0);

    let encoded_first = codec.encode(&first).unwrap().to_vec();
    let decoded_first = codec.decode(&encoded_first).unwrap();
    let encoded_second = codec.encode(&second).unwrap().to_vec();

    assert_eq!(decoded_first, first);
    assert_eq!(codec::decode(&encoded_second).unwrap(), second);
}

#[test]
fn test_truncated_frames_never_decode() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut codec = ArrayCodec::new();
    let array = random_array(&mut rng, ElementType::UInt16, 2, 3);
    let encoded = codec.encode(&array).unwrap().to_vec();

    for len in 0..encoded.len() {
        assert!(
            matches!(codec::decode(&encoded[..len]), Err(CodecError::MalformedBuffer(_))),
            "prefix of {} bytes decoded",
            len
        );
    }
}
