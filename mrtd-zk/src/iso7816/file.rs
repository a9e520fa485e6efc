//! Reading transparent elementary files.


use std::fmt;

use tracing::{debug, instrument};

use crate::der_util::{encode_tlv, try_decode_primitive_length};
use crate::iso7816::apdu::{self, Apdu, Data};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::lds::FileId;


/// The default number of bytes requested per READ BINARY.
///
/// Leaves room for secure messaging overhead within a short response.
pub const DEFAULT_CHUNK_SIZE: u8 = 0xDF;

/// The highest offset that fits into P1/P2 of READ BINARY with even INS.
const MAX_EVEN_OFFSET: usize = 0x7FFF;


#[derive(Debug)]
pub enum ReadError {
    SelectCommunication(CommunicationError),
    FileNotFound,
    SelectFailed(apdu::Response),
    UnknownLength,
    ReadCommunication(CommunicationError),
    ReadFailed(apdu::Response),
    UnexpectedEnd { offset: usize, expected: usize },
    MalformedOddResponse,
}
impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::SelectCommunication(e)
                => write!(f, "SELECT communication failed: {}", e),
            Self::FileNotFound
                => write!(f, "file not found"),
            Self::SelectFailed(response)
                => write!(f, "SELECT operation failed with status code 0x{:04X}", response.trailer.to_word()),
            Self::UnknownLength
                => write!(f, "file does not start with a decodable TLV header"),
            Self::ReadCommunication(e)
                => write!(f, "READ BINARY communication failed: {}", e),
            Self::ReadFailed(response)
                => write!(f, "READ BINARY operation failed with status code 0x{:04X}", response.trailer.to_word()),
            Self::UnexpectedEnd { offset, expected }
                => write!(f, "file ended at offset {} but should be {} bytes long", offset, expected),
            Self::MalformedOddResponse
                => write!(f, "READ BINARY with odd INS returned malformed data"),
        }
    }
}
impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SelectCommunication(e) => Some(e),
            Self::FileNotFound => None,
            Self::SelectFailed(_response) => None,
            Self::UnknownLength => None,
            Self::ReadCommunication(e) => Some(e),
            Self::ReadFailed(_response) => None,
            Self::UnexpectedEnd { .. } => None,
            Self::MalformedOddResponse => None,
        }
    }
}
impl ReadError {
    /// The underlying communication error, if any.
    pub fn communication_error(&self) -> Option<&CommunicationError> {
        match self {
            Self::SelectCommunication(e)|Self::ReadCommunication(e) => Some(e),
            _ => None,
        }
    }
}


/// Selects an elementary file below the current dedicated file.
pub fn select_file<SC: SmartCard>(card: &mut SC, file: FileId) -> Result<(), ReadError> {
    let select = Apdu::new(
        0x00,
        0xA4, // SELECT
        0x02, // select EF under current DF
        0x0C, // no response data
        Data::RequestDataShort { request_data: file.fid().to_be_bytes().to_vec() },
    );
    let response = card.communicate(&select)
        .map_err(ReadError::SelectCommunication)?;
    match response.trailer.to_word() {
        0x9000 => Ok(()),
        0x6A82 => Err(ReadError::FileNotFound),
        _ => Err(ReadError::SelectFailed(response)),
    }
}


/// Selects and reads a complete file whose content is a single BER-TLV object.
///
/// The first four bytes are read to learn the length of the object; the remainder is read in
/// chunks of `chunk_size` bytes.
#[instrument(skip(card))]
pub fn read_file<SC: SmartCard>(card: &mut SC, file: FileId, chunk_size: u8) -> Result<Vec<u8>, ReadError> {
    select_file(card, file)?;

    let mut contents = read_binary(card, 0, 4)?;
    let total_length = tlv_total_length(&contents)
        .ok_or(ReadError::UnknownLength)?;
    debug!("{} is {} bytes long", file, total_length);
    contents.truncate(total_length);

    let chunk_size = usize::from(chunk_size.max(1));
    while contents.len() < total_length {
        let offset = contents.len();
        let remaining = total_length - offset;
        let want = remaining.min(chunk_size);
        let chunk = read_binary(card, offset, want)?;
        if chunk.is_empty() {
            return Err(ReadError::UnexpectedEnd { offset, expected: total_length });
        }
        let take = chunk.len().min(remaining);
        contents.extend(&chunk[..take]);
    }
    Ok(contents)
}


fn read_binary<SC: SmartCard>(card: &mut SC, offset: usize, length: usize) -> Result<Vec<u8>, ReadError> {
    // length is at most 0xFF here; 0x00 would ask for 256
    let response_data_length = length as u8;

    let odd = offset > MAX_EVEN_OFFSET;
    let request = if odd {
        let offset_bytes = (offset as u32).to_be_bytes();
        let first_significant = offset_bytes.iter()
            .position(|b| *b != 0x00)
            .unwrap_or(3);
        let mut request_data = Vec::with_capacity(6);
        encode_tlv(&mut request_data, &[0x54], &offset_bytes[first_significant..]);
        Apdu::new(
            0x00,
            0xB1, // READ BINARY, offset in data object
            0x00, 0x00, // current EF
            Data::BothDataShort { request_data, response_data_length },
        )
    } else {
        Apdu::new(
            0x00,
            0xB0, // READ BINARY
            (offset >> 8) as u8, // top bit clear: offset, not short EF identifier
            (offset & 0xFF) as u8,
            Data::ResponseDataShort { response_data_length },
        )
    };

    let response = card.communicate(&request)
        .map_err(ReadError::ReadCommunication)?;
    match response.trailer.to_word() {
        // 0x6282: end of file reached before Le bytes
        0x9000|0x6282 => {},
        _ => return Err(ReadError::ReadFailed(response)),
    }

    if odd {
        // response is wrapped in a discretionary data object (tag 0x53)
        let (&tag, rest) = response.data.split_first()
            .ok_or(ReadError::MalformedOddResponse)?;
        if tag != 0x53 {
            return Err(ReadError::MalformedOddResponse);
        }
        let (inner_length, inner) = try_decode_primitive_length(rest)
            .ok_or(ReadError::MalformedOddResponse)?;
        if inner_length > inner.len() {
            return Err(ReadError::MalformedOddResponse);
        }
        Ok(inner[..inner_length].to_vec())
    } else {
        Ok(response.data)
    }
}


/// Returns the total length (header and value) of the TLV object starting the buffer.
fn tlv_total_length(header: &[u8]) -> Option<usize> {
    let (&first, mut rest) = header.split_first()?;
    if first & 0b0001_1111 == 0b0001_1111 {
        // multi-byte tag
        loop {
            let (&b, next) = rest.split_first()?;
            rest = next;
            if b & 0b1000_0000 == 0 {
                break;
            }
        }
    }
    let (length, after_length) = try_decode_primitive_length(rest)?;
    let header_length = header.len() - after_length.len();
    header_length.checked_add(length)
}
