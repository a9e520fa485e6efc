//! Reading, authenticating and canonicalizing electronic passports (ICAO Doc 9303).
//!
//! The pipeline runs in this order:
//! 1. [`session::ChipSession`] negotiates a secure channel using [`bac`] or [`pace`].
//! 2. [`chip_auth`] optionally re-keys it using the chip's DG14 key.
//! 3. [`reader::DocumentReader`] reads the data groups and the security object.
//! 4. [`passive_auth::PassiveAuthenticator`] verifies them against a
//!    [`trust_store::TrustedCertificateSet`].
//! 5. [`encoder`] produces the fixed-shape prover inputs.
//!
//! [`scan`] strings all of these together.


pub mod asn1;
pub mod bac;
pub mod chip_auth;
pub mod crypt;
pub mod der_util;
pub mod encoder;
pub mod error;
pub mod iso7816;
pub mod kdf;
pub mod lds;
pub mod mrz;
pub mod pace;
pub mod passive_auth;
pub mod reader;
pub mod scan;
pub mod secure_messaging;
pub mod security_info;
pub mod session;
pub mod signature;
pub mod trust_store;
pub mod x509;


use std::fmt::Write;


/// Renders a classic offset/hex/ASCII dump of the buffer, one line per 16 bytes.
pub fn hexdump(buf: &[u8]) -> String {
    let mut ret = String::new();
    let mut offset = 0;
    while offset < buf.len() {
        let _ = write!(ret, "{:08X}  ", offset);

        for i in 0..16 {
            if offset + i < buf.len() {
                let _ = write!(ret, " {:02X}", buf[offset + i]);
            } else {
                ret.push_str("   ");
            }
        }

        ret.push_str(" |");
        for &b in buf[offset..].iter().take(16) {
            if b >= b' ' && b <= b'~' {
                ret.push(char::from(b));
            } else {
                ret.push('.');
            }
        }
        ret.push_str("|\n");

        offset += 16;
    }
    ret
}


#[cfg(test)]
mod tests {
    use super::hexdump;

    #[test]
    fn hexdump_pads_short_lines() {
        let dump = hexdump(b"P<UTO");
        assert_eq!(
            dump,
            "00000000   50 3C 55 54 4F                                  |P<UTO|\n",
        );
    }

    #[test]
    fn hexdump_spans_lines() {
        let data: Vec<u8> = (0x41..0x41+17).collect();
        let dump = hexdump(&data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("|ABCDEFGHIJKLMNOP|"));
        assert!(lines[1].starts_with("00000010   51 "));
        assert_eq!(hexdump(&[]), "");
    }
}
