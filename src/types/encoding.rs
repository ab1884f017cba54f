//! Byte serialization of pulse fields.
//!
//! This is hash and signature input, so it must be bit-exact:
//! - variable-length values (strings, byte values, timestamps) are an 8-byte
//!   big-endian length followed by the raw bytes
//! - `u32`/`u64` are raw big-endian, never length-prefixed
//! - durations are a `u32` of milliseconds
//! - the anchor list is its anchors' encodings back to back

use chrono::{DateTime, Utc};

use super::{format_timestamp, ByteHash, Pulse};

pub fn encode_u32(out: &mut Vec<u8>, n: u32) {
    out.extend_from_slice(&n.to_be_bytes());
}

pub fn encode_u64(out: &mut Vec<u8>, n: u64) {
    out.extend_from_slice(&n.to_be_bytes());
}

pub fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    encode_u64(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub fn encode_str(out: &mut Vec<u8>, s: &str) {
    encode_bytes(out, s.as_bytes());
}

pub fn encode_timestamp(out: &mut Vec<u8>, ts: &DateTime<Utc>) {
    encode_str(out, &format_timestamp(ts));
}

pub fn encode_duration_ms(out: &mut Vec<u8>, millis: u32) {
    encode_u32(out, millis);
}

pub fn encode_anchors(out: &mut Vec<u8>, anchors: &[ByteHash]) {
    for anchor in anchors {
        encode_bytes(out, anchor.as_bytes());
    }
}

/// Standalone encoding of one byte value, as fed to the hash for
/// precommitments and certificate ids.
pub fn serialize_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + bytes.len());
    encode_bytes(&mut out, bytes);
    out
}

impl Pulse {
    /// Concatenated encoding of every field preceding `signatureValue`.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);
        encode_str(&mut out, &self.uri);
        encode_str(&mut out, &self.version);
        encode_u32(&mut out, self.cypher_suite);
        encode_duration_ms(&mut out, self.period);
        encode_bytes(&mut out, self.certificate_id.as_bytes());
        encode_u64(&mut out, self.chain_index);
        encode_u64(&mut out, self.pulse_index);
        encode_timestamp(&mut out, &self.time_stamp);
        encode_bytes(&mut out, self.local_random_value.as_bytes());
        encode_u32(&mut out, self.skip_list_layer_size);
        encode_u32(&mut out, self.skip_list_num_layers);
        encode_anchors(&mut out, &self.skip_list_anchors);
        encode_bytes(&mut out, self.precommitment_value.as_bytes());
        encode_u32(&mut out, self.status_code.bits());
        out
    }

    /// Concatenated encoding of every field preceding `outputValue`,
    /// i.e. the signing input followed by the signature.
    pub fn output_bytes(&self) -> Vec<u8> {
        let mut out = self.signing_bytes();
        encode_bytes(&mut out, self.signature_value.as_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{parse_timestamp, StatusCode};

    #[test]
    fn test_fixed_width_integers() {
        let mut out = Vec::new();
        encode_duration_ms(&mut out, 2000);
        assert_eq!(out, vec![0x00, 0x00, 0x07, 0xd0]);

        let mut out = Vec::new();
        encode_u64(&mut out, 1);
        assert_eq!(out, vec![0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_length_prefixed_values() {
        let mut out = Vec::new();
        encode_str(&mut out, "test");
        assert_eq!(out, b"\x00\x00\x00\x00\x00\x00\x00\x04test".to_vec());

        let hash = vec![0xab; 64];
        let encoded = serialize_bytes(&hash);
        assert_eq!(&encoded[..8], &64u64.to_be_bytes());
        assert_eq!(&encoded[8..], hash.as_slice());
    }

    #[test]
    fn test_timestamp_encoding() {
        let ts = parse_timestamp("2019-04-03T13:34:23.234Z").unwrap();
        let mut out = Vec::new();
        encode_timestamp(&mut out, &ts);
        assert_eq!(&out[..8], &24u64.to_be_bytes());
        assert_eq!(&out[8..], b"2019-04-03T13:34:23.234Z");
    }

    #[test]
    fn test_output_bytes_extend_signing_bytes() {
        let pulse = Pulse {
            uri: "u".into(),
            version: "2.0".into(),
            cypher_suite: 1,
            period: 60_000,
            certificate_id: ByteHash::new(vec![1; 64]),
            chain_index: 0,
            pulse_index: 3,
            time_stamp: parse_timestamp("2024-01-01T00:00:00Z").unwrap(),
            local_random_value: ByteHash::new(vec![2; 64]),
            skip_list_layer_size: 27,
            skip_list_num_layers: 2,
            skip_list_anchors: vec![ByteHash::new(vec![3; 64]), ByteHash::new(vec![4; 64])],
            precommitment_value: ByteHash::new(vec![5; 64]),
            status_code: StatusCode::OK,
            signature_value: ByteHash::new(vec![6; 70]),
            output_value: ByteHash::new(vec![7; 64]),
        };

        let signing = pulse.signing_bytes();
        let output = pulse.output_bytes();
        assert_eq!(&output[..signing.len()], signing.as_slice());
        assert_eq!(output.len(), signing.len() + 8 + 70);
        // the status code closes the signing input
        assert_eq!(&signing[signing.len() - 4..], &[0, 0, 0, 0]);
    }
}
