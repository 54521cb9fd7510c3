//! FastCGI v1 record codec for the responder role.
//!
//! A record is an 8-byte header (version, type, request id, content length,
//! padding length) followed by content and padding. Parameter streams carry
//! name-value pairs with 1- or 4-byte length prefixes.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use crate::error::FcgiError;

/// The only protocol version in existence.
pub const FCGI_VERSION_1: u8 = 1;
/// Responder role in the begin-request body.
pub const ROLE_RESPONDER: u16 = 1;
/// Protocol status: request processed to completion.
pub const STATUS_REQUEST_COMPLETE: u8 = 0;
/// Protocol status: the requested role is not implemented.
pub const STATUS_UNKNOWN_ROLE: u8 = 3;
/// Keep-connection flag in the begin-request body.
pub const FLAG_KEEP_CONN: u8 = 1;
/// Largest content slice written into one record; leaves room for padding.
pub const MAX_RECORD_CONTENT: usize = 0xFFF8;

const HEADER_LEN: usize = 8;

/// FastCGI record types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::BeginRequest),
            2 => Some(Self::AbortRequest),
            3 => Some(Self::EndRequest),
            4 => Some(Self::Params),
            5 => Some(Self::Stdin),
            6 => Some(Self::Stdout),
            7 => Some(Self::Stderr),
            8 => Some(Self::Data),
            9 => Some(Self::GetValues),
            10 => Some(Self::GetValuesResult),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::BeginRequest => 1,
            Self::AbortRequest => 2,
            Self::EndRequest => 3,
            Self::Params => 4,
            Self::Stdin => 5,
            Self::Stdout => 6,
            Self::Stderr => 7,
            Self::Data => 8,
            Self::GetValues => 9,
            Self::GetValuesResult => 10,
        }
    }

    /// Record type name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BeginRequest => "begin-request",
            Self::AbortRequest => "abort-request",
            Self::EndRequest => "end-request",
            Self::Params => "params",
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Data => "data",
            Self::GetValues => "get-values",
            Self::GetValuesResult => "get-values-result",
        }
    }
}

/// Deserialized record header.
#[derive(Clone, Copy, Debug)]
pub struct RecordHeader {
    /// Record type.
    pub record_type: RecordType,
    /// Request the record belongs to (0 for management records).
    pub request_id: u16,
    /// Content bytes following the header.
    pub content_length: u16,
    /// Padding bytes following the content.
    pub padding_length: u8,
}

/// Reads one record; `None` on a clean end of stream.
pub fn read_record(reader: &mut impl Read) -> Result<Option<(RecordHeader, Vec<u8>)>, FcgiError> {
    let mut raw = [0_u8; HEADER_LEN];
    match reader.read_exact(&mut raw) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }
    if raw[0] != FCGI_VERSION_1 {
        return Err(FcgiError::UnsupportedVersion(raw[0]));
    }
    let record_type = RecordType::from_u8(raw[1]).ok_or(FcgiError::UnknownRecordType(raw[1]))?;
    let header = RecordHeader {
        record_type,
        request_id: u16::from_be_bytes([raw[2], raw[3]]),
        content_length: u16::from_be_bytes([raw[4], raw[5]]),
        padding_length: raw[6],
    };

    let mut content = vec![0_u8; usize::from(header.content_length)];
    reader
        .read_exact(&mut content)
        .map_err(|_| FcgiError::UnexpectedEof)?;
    if header.padding_length > 0 {
        let mut padding = vec![0_u8; usize::from(header.padding_length)];
        reader
            .read_exact(&mut padding)
            .map_err(|_| FcgiError::UnexpectedEof)?;
    }
    Ok(Some((header, content)))
}

/// Writes one record without padding. `content` must fit a single record.
pub fn write_record(
    writer: &mut impl Write,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> io::Result<()> {
    debug_assert!(content.len() <= usize::from(u16::MAX));
    let id = request_id.to_be_bytes();
    let length = (content.len() as u16).to_be_bytes();
    let header = [
        FCGI_VERSION_1,
        record_type.as_u8(),
        id[0],
        id[1],
        length[0],
        length[1],
        0, // padding
        0, // reserved
    ];
    writer.write_all(&header)?;
    writer.write_all(content)
}

/// Parsed begin-request body.
#[derive(Clone, Copy, Debug)]
pub struct BeginRequestBody {
    /// Requested role; only [`ROLE_RESPONDER`] is implemented.
    pub role: u16,
    /// Connection handling flags.
    pub flags: u8,
}

impl BeginRequestBody {
    /// Parses the 8-byte begin-request content.
    pub fn parse(content: &[u8]) -> Result<Self, FcgiError> {
        if content.len() < 3 {
            return Err(FcgiError::UnexpectedEof);
        }
        Ok(Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }
}

/// Serializes an end-request body.
#[must_use]
pub fn end_request_body(app_status: u32, protocol_status: u8) -> [u8; 8] {
    let status = app_status.to_be_bytes();
    [
        status[0],
        status[1],
        status[2],
        status[3],
        protocol_status,
        0,
        0,
        0,
    ]
}

fn read_pair_length(content: &[u8], position: &mut usize) -> Result<usize, FcgiError> {
    let first = *content.get(*position).ok_or(FcgiError::TruncatedPairs)?;
    if first < 0x80 {
        *position += 1;
        return Ok(usize::from(first));
    }
    let raw = content
        .get(*position..*position + 4)
        .ok_or(FcgiError::TruncatedPairs)?;
    *position += 4;
    Ok(u32::from_be_bytes([raw[0] & 0x7F, raw[1], raw[2], raw[3]]) as usize)
}

/// Decodes a concatenated name-value pair stream into `params`.
pub fn parse_name_value_pairs(
    content: &[u8],
    params: &mut HashMap<String, String>,
) -> Result<(), FcgiError> {
    let mut position = 0;
    while position < content.len() {
        let name_length = read_pair_length(content, &mut position)?;
        let value_length = read_pair_length(content, &mut position)?;
        let name = content
            .get(position..position + name_length)
            .ok_or(FcgiError::TruncatedPairs)?;
        position += name_length;
        let value = content
            .get(position..position + value_length)
            .ok_or(FcgiError::TruncatedPairs)?;
        position += value_length;
        params.insert(
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }
    Ok(())
}
