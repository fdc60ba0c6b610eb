// Copyright 2026 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The framed request/response protocol spoken with the local cache client.
//!
//! Requests are length-prefixed binary records; multi-byte integers use host
//! byte order since the peer is always on the same machine.

use bytes::BytesMut;
use thiserror::Error;

use std::borrow::Borrow;
use std::fmt::Write;

pub const PROTOCOL_VERSION: u8 = 0x01;
pub const CAP_GET_PUT_REMOVE_STOP: u8 = 0x00;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_NOOP: u8 = 0x01;
pub const STATUS_ERR: u8 = 0x02;

const REQ_GET: u8 = 0x00;
const REQ_PUT: u8 = 0x01;
const REQ_REMOVE: u8 = 0x02;
const REQ_STOP: u8 = 0x03;

const PUT_FLAG_OVERWRITE: u8 = 0x01;
const MAX_MSG_LEN: usize = 255;

#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    Get {
        key: Vec<u8>,
    },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        overwrite: bool,
    },
    Remove {
        key: Vec<u8>,
    },
    Stop,
}

#[derive(Error, PartialEq, Eq, Debug)]
pub enum ParseError {
    #[error("incomplete request")]
    Incomplete,
    #[error("unknown request type: {0}")]
    UnknownRequestType(u8),
}

/// Parse a single request off the front of the buffer. Complete requests are
/// consumed with `split_to`; an incomplete suffix is left untouched so more
/// bytes can be appended by the next read.
pub fn parse(buffer: &mut BytesMut) -> Result<Request, ParseError> {
    let request_type;
    {
        let buf: &[u8] = (*buffer).borrow();
        if buf.is_empty() {
            return Err(ParseError::Incomplete);
        }
        request_type = buf[0];
    }

    match request_type {
        REQ_STOP => {
            let _ = buffer.split_to(1);
            Ok(Request::Stop)
        }
        REQ_GET | REQ_REMOVE => {
            let key = parse_key(buffer)?;
            if request_type == REQ_GET {
                Ok(Request::Get { key })
            } else {
                Ok(Request::Remove { key })
            }
        }
        REQ_PUT => parse_put(buffer),
        other => Err(ParseError::UnknownRequestType(other)),
    }
}

// type byte + key length byte + key bytes
fn parse_key(buffer: &mut BytesMut) -> Result<Vec<u8>, ParseError> {
    let key;
    let consumed;
    {
        let buf: &[u8] = (*buffer).borrow();
        if buf.len() < 2 {
            return Err(ParseError::Incomplete);
        }
        let key_len = buf[1] as usize;
        consumed = 2 + key_len;
        if buf.len() < consumed {
            return Err(ParseError::Incomplete);
        }
        key = buf[2..consumed].to_vec();
    }
    let _ = buffer.split_to(consumed);
    Ok(key)
}

// type byte + key length byte + key bytes + flags byte + 8-byte value length
// in host byte order + value bytes
fn parse_put(buffer: &mut BytesMut) -> Result<Request, ParseError> {
    let key;
    let value;
    let overwrite;
    let consumed;
    {
        let buf: &[u8] = (*buffer).borrow();
        if buf.len() < 2 {
            return Err(ParseError::Incomplete);
        }
        let key_len = buf[1] as usize;
        let mut offset = 2 + key_len;
        if buf.len() < offset + 1 + 8 {
            return Err(ParseError::Incomplete);
        }
        key = buf[2..offset].to_vec();
        let flags = buf[offset];
        offset += 1;
        let value_len =
            u64::from_ne_bytes(buf[offset..offset + 8].try_into().unwrap()) as usize;
        offset += 8;
        if buf.len() < offset + value_len {
            return Err(ParseError::Incomplete);
        }
        value = buf[offset..offset + value_len].to_vec();
        consumed = offset + value_len;
        overwrite = flags & PUT_FLAG_OVERWRITE != 0;
    }
    let _ = buffer.split_to(consumed);
    Ok(Request::Put {
        key,
        value,
        overwrite,
    })
}

/// Sent once per accepted connection: protocol version, capability count, and
/// the single capability identifier.
pub fn greeting() -> Vec<u8> {
    vec![PROTOCOL_VERSION, 1, CAP_GET_PUT_REMOVE_STOP]
}

pub fn ok_response() -> Vec<u8> {
    vec![STATUS_OK]
}

pub fn noop_response() -> Vec<u8> {
    vec![STATUS_NOOP]
}

/// Error status followed by a length-prefixed message, clamped to 255 bytes.
pub fn error_response(message: &str) -> Vec<u8> {
    let msg = message.as_bytes();
    let msg_len = std::cmp::min(msg.len(), MAX_MSG_LEN);
    let mut response = Vec::with_capacity(2 + msg_len);
    response.push(STATUS_ERR);
    response.push(msg_len as u8);
    response.extend_from_slice(&msg[..msg_len]);
    response
}

/// The header blob of a successful GET response. The value bytes follow as a
/// separate blob and must never be written ahead of this one.
pub fn value_header(len: u64) -> Vec<u8> {
    let mut header = Vec::with_capacity(9);
    header.push(STATUS_OK);
    header.extend_from_slice(&len.to_ne_bytes());
    header
}

/// Render key bytes as lower-case hexadecimal for URL construction.
pub fn format_hex(key: &[u8]) -> String {
    let mut hex = String::with_capacity(key.len() * 2);
    for byte in key {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}
