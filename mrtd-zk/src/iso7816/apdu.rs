//! Command and response application protocol data units (APDUs).


use std::fmt;
use std::io::{self, Write};


#[derive(Debug)]
pub enum WriteError {
    Io(io::Error),
    EmptyData,
    DataTooLong { maximum: usize, obtained: usize },
}
impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::EmptyData => write!(f, "request data is empty"),
            Self::DataTooLong { maximum, obtained } => write!(f, "too much request data: obtained {} bytes, expected maximum {} bytes", obtained, maximum),
        }
    }
}
impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::EmptyData => None,
            Self::DataTooLong { .. } => None,
        }
    }
}
impl From<io::Error> for WriteError {
    fn from(value: io::Error) -> Self { Self::Io(value) }
}


#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CommandHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}
impl CommandHeader {
    pub const fn to_bytes(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    /// The header as one big-endian word, which makes matching on whole commands easy.
    pub const fn to_be_u32(&self) -> u32 {
        u32::from_be_bytes(self.to_bytes())
    }
}
impl fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandHeader {{ cla: 0x{:02X}, ins: 0x{:02X}, p1: 0x{:02X}, p2: 0x{:02X} }}",
            self.cla, self.ins, self.p1, self.p2,
        )
    }
}


#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResponseTrailer {
    pub sw1: u8,
    pub sw2: u8,
}
impl ResponseTrailer {
    pub const SUCCESS: Self = Self::new(0x90, 0x00);

    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self {
            sw1,
            sw2,
        }
    }

    pub const fn from_word(word: u16) -> Self {
        let bytes = word.to_be_bytes();
        Self::new(bytes[0], bytes[1])
    }

    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    pub const fn to_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }
}
impl fmt::Debug for ResponseTrailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseTrailer {{ sw1: 0x{:02X}, sw2: 0x{:02X} }}", self.sw1, self.sw2)
    }
}


/// The body of a command APDU.
///
/// An expected length (Le) of zero means the maximum: 256 bytes in the short variants, 65536 in
/// the extended ones.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Data {
    NoData,
    RequestDataShort {
        request_data: Vec<u8>,
    },
    RequestDataExtended {
        request_data: Vec<u8>,
    },
    ResponseDataShort {
        response_data_length: u8,
    },
    ResponseDataExtended {
        response_data_length: u16,
    },
    BothDataShort {
        request_data: Vec<u8>,
        response_data_length: u8,
    },
    BothDataExtended {
        request_data: Vec<u8>,
        response_data_length: u16,
    },
}
impl Data {
    /// The maximum number of response bytes the command asks for.
    pub fn response_data_length(&self) -> Option<usize> {
        fn short(le: u8) -> usize {
            if le == 0 { 256 } else { le.into() }
        }
        fn extended(le: u16) -> usize {
            if le == 0 { 65536 } else { le.into() }
        }

        match self {
            Self::NoData => None,
            Self::RequestDataShort { .. } => None,
            Self::RequestDataExtended { .. } => None,
            Self::ResponseDataShort { response_data_length } => Some(short(*response_data_length)),
            Self::ResponseDataExtended { response_data_length } => Some(extended(*response_data_length)),
            Self::BothDataShort { response_data_length, .. } => Some(short(*response_data_length)),
            Self::BothDataExtended { response_data_length, .. } => Some(extended(*response_data_length)),
        }
    }

    /// The raw Le field as sent on the wire: one byte for short, two bytes for extended.
    pub fn le_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::ResponseDataShort { response_data_length }|Self::BothDataShort { response_data_length, .. }
                => Some(vec![*response_data_length]),
            Self::ResponseDataExtended { response_data_length }|Self::BothDataExtended { response_data_length, .. }
                => Some(response_data_length.to_be_bytes().to_vec()),
            _ => None,
        }
    }

    pub fn request_data(&self) -> Option<&[u8]> {
        match self {
            Self::NoData => None,
            Self::RequestDataShort { request_data } => Some(request_data.as_slice()),
            Self::RequestDataExtended { request_data } => Some(request_data.as_slice()),
            Self::ResponseDataShort { .. } => None,
            Self::ResponseDataExtended { .. } => None,
            Self::BothDataShort { request_data, .. } => Some(request_data.as_slice()),
            Self::BothDataExtended { request_data, .. } => Some(request_data.as_slice()),
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(
            self,
            Self::RequestDataExtended { .. } | Self::ResponseDataExtended { .. } | Self::BothDataExtended { .. }
        )
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        fn check_length(request_data: &[u8], maximum: usize) -> Result<(), WriteError> {
            if request_data.is_empty() {
                Err(WriteError::EmptyData)
            } else if request_data.len() > maximum {
                Err(WriteError::DataTooLong { maximum, obtained: request_data.len() })
            } else {
                Ok(())
            }
        }
        fn write_short_lc<W: Write>(writer: &mut W, request_data: &[u8]) -> Result<(), WriteError> {
            check_length(request_data, 256)?;
            // 256 wraps around to 0x00
            writer.write_all(&[request_data.len() as u8])?;
            writer.write_all(request_data)?;
            Ok(())
        }
        fn write_extended_lc<W: Write>(writer: &mut W, request_data: &[u8]) -> Result<(), WriteError> {
            check_length(request_data, 65536)?;
            // 65536 wraps around to 0x0000
            let length_bytes = (request_data.len() as u16).to_be_bytes();
            writer.write_all(&[0x00, length_bytes[0], length_bytes[1]])?;
            writer.write_all(request_data)?;
            Ok(())
        }

        // cases as in ISO/IEC 7816-3:2006 § 12.1.3
        match self {
            Self::NoData => {
                // case 1
            },
            Self::RequestDataShort { request_data } => {
                // case 3S: [Lc] [Data]
                write_short_lc(writer, request_data)?;
            },
            Self::RequestDataExtended { request_data } => {
                // case 3E: [0x00] [LcMSB] [LcLSB] [Data]
                write_extended_lc(writer, request_data)?;
            },
            Self::ResponseDataShort { response_data_length } => {
                // case 2S: [Le]
                writer.write_all(&[*response_data_length])?;
            },
            Self::ResponseDataExtended { response_data_length } => {
                // case 2E: [0x00] [LeMSB] [LeLSB]
                writer.write_all(&[0x00])?;
                writer.write_all(&response_data_length.to_be_bytes())?;
            },
            Self::BothDataShort { request_data, response_data_length } => {
                // case 4S: [Lc] [Data] [Le]
                write_short_lc(writer, request_data)?;
                writer.write_all(&[*response_data_length])?;
            },
            Self::BothDataExtended { request_data, response_data_length } => {
                // case 4E: [0x00] [LcMSB] [LcLSB] [Data] [LeMSB] [LeLSB]
                write_extended_lc(writer, request_data)?;
                writer.write_all(&response_data_length.to_be_bytes())?;
            },
        }
        Ok(())
    }
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Apdu {
    pub header: CommandHeader,
    pub data: Data,
}
impl Apdu {
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Data) -> Self {
        Self {
            header: CommandHeader { cla, ins, p1, p2 },
            data,
        }
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        writer.write_all(&self.header.to_bytes())?;
        self.data.write_bytes(writer)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut ret = Vec::new();
        self.write_bytes(&mut ret)?;
        Ok(ret)
    }
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Response {
    pub data: Vec<u8>,
    pub trailer: ResponseTrailer,
}
impl Response {
    pub fn new(data: Vec<u8>, trailer: ResponseTrailer) -> Self {
        Self { data, trailer }
    }

    pub fn from_status(word: u16) -> Self {
        Self::new(Vec::new(), ResponseTrailer::from_word(word))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let split = bytes.len().checked_sub(2)?;
        let (data, trailer) = bytes.split_at(split);
        Some(Self {
            data: data.to_vec(),
            trailer: ResponseTrailer::new(trailer[0], trailer[1]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(self.data.len() + 2);
        ret.extend(&self.data);
        ret.extend(self.trailer.to_bytes());
        ret
    }

    pub fn is_success(&self) -> bool {
        self.trailer == ResponseTrailer::SUCCESS
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn encode_cases() {
        let case1 = Apdu::new(0x00, 0xA4, 0x04, 0x0C, Data::NoData);
        assert_eq!(case1.to_bytes().unwrap(), hex!("00A4040C"));

        let case2 = Apdu::new(0x00, 0x84, 0x00, 0x00, Data::ResponseDataShort { response_data_length: 8 });
        assert_eq!(case2.to_bytes().unwrap(), hex!("0084000008"));

        let case3 = Apdu::new(0x00, 0xA4, 0x02, 0x0C, Data::RequestDataShort { request_data: vec![0x01, 0x1E] });
        assert_eq!(case3.to_bytes().unwrap(), hex!("00A4020C02011E"));

        let case4e = Apdu::new(
            0x0C, 0xB0, 0x00, 0x00,
            Data::BothDataExtended { request_data: vec![0xAA], response_data_length: 0 },
        );
        assert_eq!(case4e.to_bytes().unwrap(), hex!("0CB00000 000001 AA 0000"));
    }

    #[test]
    fn le_zero_means_maximum() {
        assert_eq!(Data::ResponseDataShort { response_data_length: 0 }.response_data_length(), Some(256));
        assert_eq!(Data::ResponseDataExtended { response_data_length: 0 }.response_data_length(), Some(65536));
        assert_eq!(Data::BothDataShort { request_data: vec![1], response_data_length: 0x20 }.response_data_length(), Some(0x20));
        assert_eq!(Data::NoData.response_data_length(), None);
    }

    #[test]
    fn request_data_limits() {
        let empty = Apdu::new(0x00, 0x22, 0xC1, 0xA4, Data::RequestDataShort { request_data: Vec::new() });
        assert!(matches!(empty.to_bytes(), Err(WriteError::EmptyData)));

        let long = Apdu::new(0x00, 0x22, 0xC1, 0xA4, Data::RequestDataShort { request_data: vec![0; 257] });
        assert!(matches!(long.to_bytes(), Err(WriteError::DataTooLong { maximum: 256, obtained: 257 })));

        let full = Apdu::new(0x00, 0x22, 0xC1, 0xA4, Data::RequestDataShort { request_data: vec![0; 256] });
        assert_eq!(full.to_bytes().unwrap()[4], 0x00);
    }

    #[test]
    fn response_parsing() {
        let response = Response::from_slice(&hex!("0102 9000")).unwrap();
        assert_eq!(response.data, hex!("0102"));
        assert!(response.is_success());
        assert_eq!(response.to_bytes(), hex!("0102 9000"));

        assert_eq!(Response::from_slice(&hex!("6A82")).unwrap().trailer.to_word(), 0x6A82);
        assert!(Response::from_slice(&hex!("90")).is_none());
    }
}
