//! Utility functions for Distinguished Encoding Rules.


use std::fmt::Write;

use rasn::types::Oid;


/// Encode an ASN.1 DER length.
pub fn encode_primitive_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        // short form
        output.push(length as u8);
        return;
    }

    // long form: 0b1nnn_nnnn followed by n big-endian bytes
    let length_bytes = length.to_be_bytes();
    let first_significant = length_bytes.iter()
        .position(|b| *b != 0x00)
        .unwrap_or(length_bytes.len() - 1);
    let significant = &length_bytes[first_significant..];
    output.push(0b1000_0000 | (significant.len() as u8));
    output.extend(significant);
}


/// Decode an ASN.1 DER length.
///
/// The length must be at the beginning of the input slice.
///
/// Returns a tuple `(length, rest)` where `rest` is the rest of the input slice once the length has
/// been removed.
pub fn try_decode_primitive_length(input: &[u8]) -> Option<(usize, &[u8])> {
    let (&start_byte, rest) = input.split_first()?;
    if start_byte & 0b1000_0000 == 0 {
        return Some((start_byte.into(), rest));
    }

    let length_byte_count = usize::from(start_byte & 0b0111_1111);
    if length_byte_count == 0 || length_byte_count > rest.len() {
        // indefinite length is not DER; the rest would not fit
        return None;
    }
    let mut length: usize = 0;
    for &length_byte in &rest[..length_byte_count] {
        length = length.checked_mul(256)?
            .checked_add(usize::from(length_byte))?;
    }
    Some((length, &rest[length_byte_count..]))
}


/// Appends a complete tag-length-value structure. `tag` may span multiple bytes.
pub fn encode_tlv(output: &mut Vec<u8>, tag: &[u8], value: &[u8]) {
    output.extend(tag);
    encode_primitive_length(output, value.len());
    output.extend(value);
}


/// Encode an object identifier value into bytes using DER encoding rules.
///
/// No tag or length is encoded, only the actual value. Panics if the first two arcs do not form a
/// valid object identifier.
pub fn oid_to_der_bytes(oid: &Oid) -> Vec<u8> {
    assert!(oid.len() >= 2);
    assert!(oid[0] <= 2);
    if oid[0] < 2 {
        assert!(oid[1] <= 39);
    }

    fn encode_arc(ret: &mut Vec<u8>, arc: u32) {
        // base-128, most significant group first, continuation bit on all but the last byte
        let mut groups = [0u8; 5];
        let mut count = 0;
        let mut remaining = arc;
        loop {
            groups[count] = (remaining & 0b0111_1111) as u8;
            count += 1;
            remaining >>= 7;
            if remaining == 0 {
                break;
            }
        }
        for i in (0..count).rev() {
            let continuation = if i > 0 { 0b1000_0000 } else { 0 };
            ret.push(groups[i] | continuation);
        }
    }

    let mut ret = Vec::new();
    encode_arc(&mut ret, 40*oid[0] + oid[1]);
    for arc in oid.iter().skip(2) {
        encode_arc(&mut ret, *arc);
    }
    ret
}


/// Whether two object identifiers consist of the same arcs.
pub fn oid_matches(oid: &Oid, expected: &Oid) -> bool {
    oid[..] == expected[..]
}


/// Formats an object identifier in dotted-decimal notation.
pub fn format_oid(oid: &Oid) -> String {
    let mut ret = String::new();
    for (i, arc) in oid.iter().enumerate() {
        if i > 0 {
            ret.push('.');
        }
        let _ = write!(ret, "{}", arc);
    }
    ret
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use rasn::types::ObjectIdentifier;

    #[test]
    fn lengths() {
        let mut buf = Vec::new();
        encode_primitive_length(&mut buf, 0x7F);
        encode_primitive_length(&mut buf, 0x80);
        encode_primitive_length(&mut buf, 0x0125);
        assert_eq!(buf, hex!("7F 8180 820125"));

        assert_eq!(try_decode_primitive_length(&hex!("820125 AA")), Some((0x0125, &[0xAA][..])));
        assert_eq!(try_decode_primitive_length(&hex!("80")), None);
        assert_eq!(try_decode_primitive_length(&hex!("82 01")), None);
    }

    #[test]
    fn pace_oid_round_trip() {
        const PACE_ECDH_GM_AES_128: &Oid = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 2, 2]);
        let bytes = oid_to_der_bytes(PACE_ECDH_GM_AES_128);
        assert_eq!(bytes, hex!("04007F00070202040202"));

        let mut tlv = Vec::new();
        encode_tlv(&mut tlv, &[0x06], &bytes);
        let decoded: ObjectIdentifier = rasn::der::decode(&tlv).unwrap();
        assert!(oid_matches(&decoded, PACE_ECDH_GM_AES_128));
        assert_eq!(format_oid(&decoded), "0.4.0.127.0.7.2.2.4.2.2");
    }

    #[test]
    fn multi_byte_arcs() {
        // 1.2.840.113549.1.1.11 (sha256WithRSAEncryption)
        let bytes = hex!("2A864886F70D01010B");
        let decoded: ObjectIdentifier = rasn::der::decode(&hex!("06 09 2A864886F70D01010B")).unwrap();
        assert_eq!(format_oid(&decoded), "1.2.840.113549.1.1.11");
        assert_eq!(oid_to_der_bytes(&decoded), bytes);
    }

    #[test]
    fn formats_large_arcs() {
        let oid = Oid::const_new(&[2, 999, 4294967295]);
        assert_eq!(format_oid(oid), "2.999.4294967295");
    }
}
