//! A BER-TLV reader for the data objects of LDS files and card responses (DG1, DG2, EF.COM, the
//! PACE dynamic authentication data). Typed ASN.1 structures go through `rasn` instead.
//!
//! Tags are kept as their raw big-endian bytes packed into a `u32`, so that multi-byte tags from
//! ICAO Doc 9303 Part 10 compare directly (e.g. `0x5F1F` for the MRZ or `0x7F61` for the biometric
//! information group template).


use std::fmt;


const MAX_NESTING: usize = 32;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DecodeError {
    Truncated,
    TagTooLong,
    LengthTooLong,
    IndefinitePrimitive,
    NestingTooDeep,
    TrailingData { count: usize },
    UnexpectedTag { expected: u32, obtained: u32 },
    MissingElement { index: usize },
}
impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated
                => write!(f, "data ends within an element"),
            Self::TagTooLong
                => write!(f, "tag is longer than 4 bytes"),
            Self::LengthTooLong
                => write!(f, "length does not fit in memory"),
            Self::IndefinitePrimitive
                => write!(f, "primitive element has indefinite length"),
            Self::NestingTooDeep
                => write!(f, "elements are nested too deeply"),
            Self::TrailingData { count }
                => write!(f, "{} bytes of trailing data", count),
            Self::UnexpectedTag { expected, obtained }
                => write!(f, "expected tag 0x{:02X}, obtained 0x{:02X}", expected, obtained),
            Self::MissingElement { index }
                => write!(f, "element {} is missing", index),
        }
    }
}
impl std::error::Error for DecodeError {
}


/// A single decoded element.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Element<'a> {
    /// The tag bytes packed big-endian.
    pub tag: u32,

    /// The complete encoding including tag and length.
    pub raw: &'a [u8],

    /// The value bytes. For indefinite-length elements, excludes the end-of-contents marker.
    pub content: &'a [u8],
}
impl<'a> Element<'a> {
    /// Decodes one element from the beginning of `input`, returning it and the remaining bytes.
    pub fn parse(input: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        Self::parse_nested(input, 0)
    }

    /// Decodes exactly one element, failing if any bytes follow it.
    pub fn parse_exact(input: &'a [u8]) -> Result<Self, DecodeError> {
        let (element, rest) = Self::parse(input)?;
        if !rest.is_empty() {
            return Err(DecodeError::TrailingData { count: rest.len() });
        }
        Ok(element)
    }

    fn parse_nested(input: &'a [u8], depth: usize) -> Result<(Self, &'a [u8]), DecodeError> {
        if depth > MAX_NESTING {
            return Err(DecodeError::NestingTooDeep);
        }

        let (tag, tag_length) = decode_tag(input)?;
        let after_tag = &input[tag_length..];
        let (&length_start, _) = after_tag.split_first()
            .ok_or(DecodeError::Truncated)?;

        if length_start == 0x80 {
            // indefinite length: children until end-of-contents
            if !is_constructed(tag) {
                return Err(DecodeError::IndefinitePrimitive);
            }
            let content_start = tag_length + 1;
            let mut rest = &input[content_start..];
            loop {
                if rest.len() < 2 {
                    return Err(DecodeError::Truncated);
                }
                if rest[0] == 0x00 && rest[1] == 0x00 {
                    let content_end = input.len() - rest.len();
                    let element = Self {
                        tag,
                        raw: &input[..content_end + 2],
                        content: &input[content_start..content_end],
                    };
                    return Ok((element, &rest[2..]));
                }
                let (_child, child_rest) = Self::parse_nested(rest, depth + 1)?;
                rest = child_rest;
            }
        }

        let (length, after_length) = decode_length(after_tag)?;
        if after_length.len() < length {
            return Err(DecodeError::Truncated);
        }
        let header_length = input.len() - after_length.len();
        let element = Self {
            tag,
            raw: &input[..header_length + length],
            content: &after_length[..length],
        };
        Ok((element, &after_length[length..]))
    }

    /// Fails unless the element carries the given tag.
    pub fn expect_tag(self, expected: u32) -> Result<Self, DecodeError> {
        if self.tag == expected {
            Ok(self)
        } else {
            Err(DecodeError::UnexpectedTag { expected, obtained: self.tag })
        }
    }

    /// Decodes the content as a series of elements.
    pub fn children(&self) -> Result<Vec<Element<'a>>, DecodeError> {
        parse_all(self.content)
    }

    /// Decodes the content as a series of elements and returns the one at `index`.
    pub fn child(&self, index: usize) -> Result<Element<'a>, DecodeError> {
        self.children()?
            .into_iter()
            .nth(index)
            .ok_or(DecodeError::MissingElement { index })
    }

    /// Returns the first child with the given tag, if any.
    pub fn find_child(&self, tag: u32) -> Result<Option<Element<'a>>, DecodeError> {
        Ok(self.children()?.into_iter().find(|c| c.tag == tag))
    }
}


/// Decodes a series of elements that fills `input` completely.
fn parse_all(input: &[u8]) -> Result<Vec<Element<'_>>, DecodeError> {
    let mut ret = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let (element, next) = Element::parse(rest)?;
        ret.push(element);
        rest = next;
    }
    Ok(ret)
}


fn is_constructed(tag: u32) -> bool {
    let first_byte = tag.to_be_bytes()
        .into_iter()
        .find(|b| *b != 0x00)
        .unwrap_or(0x00);
    first_byte & 0b0010_0000 != 0
}


fn decode_tag(input: &[u8]) -> Result<(u32, usize), DecodeError> {
    let (&first, rest) = input.split_first()
        .ok_or(DecodeError::Truncated)?;
    let mut tag = u32::from(first);
    if first & 0b0001_1111 != 0b0001_1111 {
        return Ok((tag, 1));
    }

    // high tag number form
    let mut length = 1;
    for &b in rest {
        if length == 4 {
            return Err(DecodeError::TagTooLong);
        }
        tag = (tag << 8) | u32::from(b);
        length += 1;
        if b & 0b1000_0000 == 0 {
            return Ok((tag, length));
        }
    }
    Err(DecodeError::Truncated)
}


fn decode_length(input: &[u8]) -> Result<(usize, &[u8]), DecodeError> {
    let (&first, rest) = input.split_first()
        .ok_or(DecodeError::Truncated)?;
    if first & 0b1000_0000 == 0 {
        return Ok((first.into(), rest));
    }
    let count = usize::from(first & 0b0111_1111);
    if count > std::mem::size_of::<usize>() {
        return Err(DecodeError::LengthTooLong);
    }
    if rest.len() < count {
        return Err(DecodeError::Truncated);
    }
    let length = rest[..count].iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
    Ok((length, &rest[count..]))
}
