//! Binary protocol codec: 24-byte big-endian framed headers, request magic
//! 0x80, response magic 0x81.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{DecodeProgress, Request, StoreVerb};
use crate::operation::{OpKind, Operation};
use crate::parser::{ErrorKind, Status, Value};

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

const OP_SET: u8 = 0x01;
const OP_ADD: u8 = 0x02;
const OP_REPLACE: u8 = 0x03;
const OP_DELETE: u8 = 0x04;
const OP_INCREMENT: u8 = 0x05;
const OP_DECREMENT: u8 = 0x06;
const OP_FLUSH: u8 = 0x08;
const OP_NOOP: u8 = 0x0a;
const OP_VERSION: u8 = 0x0b;
const OP_GETKQ: u8 = 0x0d;
const OP_APPEND: u8 = 0x0e;
const OP_PREPEND: u8 = 0x0f;
const OP_STAT: u8 = 0x10;
const OP_TOUCH: u8 = 0x1c;

const STATUS_KEY_NOT_FOUND: u16 = 0x0001;
const STATUS_KEY_EXISTS: u16 = 0x0002;
const STATUS_ITEM_NOT_STORED: u16 = 0x0005;

// Mutations must not auto-create: a miss has to surface as NOT_FOUND so the
// client-level default handling behaves the same as over ASCII.
const MUTATE_VIRGIN_EXPIRATION: u32 = 0xffff_ffff;

fn put_request_header(
    buf: &mut BytesMut,
    opcode: u8,
    key_len: usize,
    extras_len: usize,
    value_len: usize,
    cas: u64,
) {
    buf.put_u8(MAGIC_REQUEST);
    buf.put_u8(opcode);
    buf.put_u16(key_len as u16);
    buf.put_u8(extras_len as u8);
    buf.put_u8(0); // data type
    buf.put_u16(0); // vbucket
    buf.put_u32((extras_len + key_len + value_len) as u32);
    buf.put_u32(0); // opaque; responses arrive in request order per connection
    buf.put_u64(cas);
}

pub(crate) fn encode(request: &Request<'_>) -> Bytes {
    let mut buf = BytesMut::new();

    match request {
        // Quiet gets pipelined per key, flushed by a trailing noop that also
        // marks the end of the response stream. Misses produce no packet at
        // all, and the CAS id always rides in the response header, so `gets`
        // needs no separate form.
        Request::Get { keys, .. } => {
            for key in *keys {
                put_request_header(&mut buf, OP_GETKQ, key.len(), 0, 0, 0);
                buf.put_slice(key);
            }
            put_request_header(&mut buf, OP_NOOP, 0, 0, 0, 0);
        }
        Request::Store {
            verb,
            key,
            flags,
            exptime,
            data,
            cas,
        } => match verb {
            StoreVerb::Append | StoreVerb::Prepend => {
                let opcode = if *verb == StoreVerb::Prepend {
                    OP_PREPEND
                } else {
                    OP_APPEND
                };
                put_request_header(&mut buf, opcode, key.len(), 0, data.len(), cas.unwrap_or(0));
                buf.put_slice(key);
                buf.put_slice(data);
            }
            _ => {
                let opcode = match verb {
                    StoreVerb::Set => OP_SET,
                    StoreVerb::Add => OP_ADD,
                    StoreVerb::Replace => OP_REPLACE,
                    StoreVerb::Append | StoreVerb::Prepend => unreachable!(),
                };
                put_request_header(&mut buf, opcode, key.len(), 8, data.len(), cas.unwrap_or(0));
                buf.put_u32(*flags);
                buf.put_u32(*exptime);
                buf.put_slice(key);
                buf.put_slice(data);
            }
        },
        Request::Delete { key } => {
            put_request_header(&mut buf, OP_DELETE, key.len(), 0, 0, 0);
            buf.put_slice(key);
        }
        Request::Mutate { key, delta, decr } => {
            let opcode = if *decr { OP_DECREMENT } else { OP_INCREMENT };
            put_request_header(&mut buf, opcode, key.len(), 20, 0, 0);
            buf.put_u64(*delta);
            buf.put_u64(0); // initial value, unused with the virgin expiration
            buf.put_u32(MUTATE_VIRGIN_EXPIRATION);
            buf.put_slice(key);
        }
        Request::Touch { key, exptime } => {
            put_request_header(&mut buf, OP_TOUCH, key.len(), 4, 0, 0);
            buf.put_u32(*exptime);
            buf.put_slice(key);
        }
        Request::Flush { delay } => match delay {
            Some(delay) => {
                put_request_header(&mut buf, OP_FLUSH, 0, 4, 0, 0);
                buf.put_u32(*delay);
            }
            None => put_request_header(&mut buf, OP_FLUSH, 0, 0, 0, 0),
        },
        Request::Version => put_request_header(&mut buf, OP_VERSION, 0, 0, 0, 0),
        Request::Stats { arg } => {
            let key = arg.map(str::as_bytes).unwrap_or(b"");
            put_request_header(&mut buf, OP_STAT, key.len(), 0, 0, 0);
            buf.put_slice(key);
        }
        Request::Noop => put_request_header(&mut buf, OP_NOOP, 0, 0, 0, 0),
    }

    buf.freeze()
}

struct ResponseHeader {
    opcode: u8,
    key_len: usize,
    extras_len: usize,
    status: u16,
    body_len: usize,
    cas: u64,
}

fn parse_response_header(bytes: &[u8]) -> Result<ResponseHeader, ErrorKind> {
    if bytes[0] != MAGIC_RESPONSE {
        return Err(ErrorKind::Protocol(Some(format!(
            "bad response magic {:#04x}",
            bytes[0]
        ))));
    }
    let header = ResponseHeader {
        opcode: bytes[1],
        key_len: u16::from_be_bytes([bytes[2], bytes[3]]) as usize,
        extras_len: bytes[4] as usize,
        status: u16::from_be_bytes([bytes[6], bytes[7]]),
        body_len: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
        cas: u64::from_be_bytes([
            bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22], bytes[23],
        ]),
    };
    if header.extras_len + header.key_len > header.body_len {
        return Err(ErrorKind::Protocol(Some(
            "body length smaller than extras and key".to_string(),
        )));
    }
    Ok(header)
}

fn map_status(status: u16, message: &[u8]) -> Status {
    match status {
        STATUS_KEY_NOT_FOUND => Status::NotFound,
        STATUS_KEY_EXISTS => Status::Exists,
        STATUS_ITEM_NOT_STORED => Status::NotStored,
        _ => {
            let text = if message.is_empty() {
                format!("status {:#06x}", status)
            } else {
                String::from_utf8_lossy(message).into_owned()
            };
            Status::Error(ErrorKind::Server(text))
        }
    }
}

fn success_status(kind: OpKind) -> Status {
    match kind {
        OpKind::Store => Status::Stored,
        OpKind::Delete => Status::Deleted,
        OpKind::Touch => Status::Touched,
        _ => Status::Ok,
    }
}

/// Restartable decoder for binary responses. Frames are bounded by the
/// server's item size limit, so a whole body is buffered before dispatch.
pub(crate) struct BinaryDecoder {
    pending: Option<ResponseHeader>,
}

impl BinaryDecoder {
    pub(crate) fn new() -> BinaryDecoder {
        BinaryDecoder { pending: None }
    }

    pub(crate) fn reset(&mut self) {
        self.pending = None;
    }

    pub(crate) fn decode(
        &mut self,
        buf: &mut BytesMut,
        op: &mut Operation,
    ) -> Result<DecodeProgress, ErrorKind> {
        loop {
            let header = match self.pending.take() {
                Some(header) => header,
                None => {
                    if buf.len() < 24 {
                        return Ok(DecodeProgress::NeedMore);
                    }
                    let header = parse_response_header(&buf[..24])?;
                    buf.advance(24);
                    header
                }
            };

            if buf.len() < header.body_len {
                self.pending = Some(header);
                return Ok(DecodeProgress::NeedMore);
            }
            let body = buf.split_to(header.body_len);
            let extras = &body[..header.extras_len];
            let key = &body[header.extras_len..header.extras_len + header.key_len];
            let value = &body[header.extras_len + header.key_len..];

            match op.kind {
                OpKind::Retrieval => {
                    if header.opcode == OP_NOOP {
                        return Ok(DecodeProgress::Complete);
                    }
                    if header.status == 0 {
                        let flags = if extras.len() >= 4 {
                            u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
                        } else {
                            0
                        };
                        op.values.push(Value {
                            key: key.to_vec(),
                            cas: Some(header.cas),
                            flags,
                            data: value.to_vec(),
                        });
                    } else if header.status != STATUS_KEY_NOT_FOUND {
                        op.status = Some(map_status(header.status, value));
                    }
                }
                OpKind::Stats => {
                    if header.status != 0 {
                        op.status = Some(map_status(header.status, value));
                        return Ok(DecodeProgress::Complete);
                    }
                    if key.is_empty() {
                        return Ok(DecodeProgress::Complete);
                    }
                    op.stats.push((
                        String::from_utf8_lossy(key).into_owned(),
                        String::from_utf8_lossy(value).into_owned(),
                    ));
                }
                OpKind::Mutate => {
                    if header.status == 0 && value.len() == 8 {
                        op.counter = Some(u64::from_be_bytes([
                            value[0], value[1], value[2], value[3], value[4], value[5], value[6],
                            value[7],
                        ]));
                    } else {
                        op.status = Some(map_status(header.status, &[]));
                    }
                    return Ok(DecodeProgress::Complete);
                }
                OpKind::Version | OpKind::Noop => {
                    if header.status == 0 {
                        op.version = Some(String::from_utf8_lossy(value).into_owned());
                    } else {
                        op.status = Some(map_status(header.status, value));
                    }
                    return Ok(DecodeProgress::Complete);
                }
                OpKind::Store | OpKind::Delete | OpKind::Touch | OpKind::Flush => {
                    op.status = Some(if header.status == 0 {
                        success_status(op.kind)
                    } else {
                        map_status(header.status, value)
                    });
                    return Ok(DecodeProgress::Complete);
                }
            }
        }
    }
}
