//! ASCII protocol codec.

use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{DecodeProgress, Request, StoreVerb};
use crate::operation::{OpKind, Operation};
use crate::parser::{
    parse_mutate_frame, parse_retrieval_frame, parse_stats_frame, parse_status_frame,
    parse_version_frame, ErrorKind, Frame, Value,
};

fn verb_token(verb: StoreVerb, cas: bool) -> &'static [u8] {
    if cas {
        return b"cas";
    }
    match verb {
        StoreVerb::Set => b"set",
        StoreVerb::Add => b"add",
        StoreVerb::Replace => b"replace",
        StoreVerb::Append => b"append",
        StoreVerb::Prepend => b"prepend",
    }
}

pub(crate) fn encode(request: &Request<'_>) -> Bytes {
    let mut buf = BytesMut::new();
    let mut itoa = itoa::Buffer::new();

    match request {
        Request::Get { keys, with_cas } => {
            let verb: &[u8] = if *with_cas { b"gets" } else { b"get" };
            buf.put_slice(verb);
            for key in *keys {
                buf.put_u8(b' ');
                buf.put_slice(key);
            }
            buf.put_slice(b"\r\n");
        }
        Request::Store {
            verb,
            key,
            flags,
            exptime,
            data,
            cas,
        } => {
            buf.put_slice(verb_token(*verb, cas.is_some()));
            buf.put_u8(b' ');
            buf.put_slice(key);
            buf.put_u8(b' ');
            buf.put_slice(itoa.format(*flags).as_bytes());
            buf.put_u8(b' ');
            buf.put_slice(itoa.format(*exptime).as_bytes());
            buf.put_u8(b' ');
            buf.put_slice(itoa.format(data.len()).as_bytes());
            if let Some(cas) = cas {
                buf.put_u8(b' ');
                buf.put_slice(itoa.format(*cas).as_bytes());
            }
            buf.put_slice(b"\r\n");
            buf.put_slice(data);
            buf.put_slice(b"\r\n");
        }
        Request::Delete { key } => {
            buf.put_slice(b"delete ");
            buf.put_slice(key);
            buf.put_slice(b"\r\n");
        }
        Request::Mutate { key, delta, decr } => {
            buf.put_slice(if *decr { b"decr " } else { b"incr " });
            buf.put_slice(key);
            buf.put_u8(b' ');
            buf.put_slice(itoa.format(*delta).as_bytes());
            buf.put_slice(b"\r\n");
        }
        Request::Touch { key, exptime } => {
            buf.put_slice(b"touch ");
            buf.put_slice(key);
            buf.put_u8(b' ');
            buf.put_slice(itoa.format(*exptime).as_bytes());
            buf.put_slice(b"\r\n");
        }
        Request::Flush { delay } => {
            buf.put_slice(b"flush_all");
            if let Some(delay) = delay {
                buf.put_u8(b' ');
                buf.put_slice(itoa.format(*delay).as_bytes());
            }
            buf.put_slice(b"\r\n");
        }
        // ASCII has no no-op command; `version` is the cheapest round trip
        // and the reply is discarded.
        Request::Version | Request::Noop => buf.put_slice(b"version\r\n"),
        Request::Stats { arg } => {
            buf.put_slice(b"stats");
            if let Some(arg) = arg {
                buf.put_u8(b' ');
                buf.put_slice(arg.as_bytes());
            }
            buf.put_slice(b"\r\n");
        }
    }

    buf.freeze()
}

enum State {
    /// Waiting for the next response line.
    Line,
    /// Streaming a value body into the operation's accumulator. `remaining`
    /// counts data bytes still owed by the server.
    Body { value: Value, remaining: usize },
    /// Consuming the CRLF after a value body; `need` is 2 or 1.
    Trailer { value: Value, need: usize },
}

/// Restartable decoder for ASCII responses.
///
/// Value bodies are accumulated incrementally, so a value larger than the
/// read buffer makes progress on every read instead of forcing the whole
/// frame to be buffered first.
pub(crate) struct AsciiDecoder {
    state: State,
}

impl AsciiDecoder {
    pub(crate) fn new() -> AsciiDecoder {
        AsciiDecoder { state: State::Line }
    }

    pub(crate) fn reset(&mut self) {
        self.state = State::Line;
    }

    pub(crate) fn decode(
        &mut self,
        buf: &mut BytesMut,
        op: &mut Operation,
    ) -> Result<DecodeProgress, ErrorKind> {
        loop {
            match mem::replace(&mut self.state, State::Line) {
                State::Line => {
                    let parser = match op.kind {
                        OpKind::Retrieval => parse_retrieval_frame,
                        OpKind::Store | OpKind::Delete | OpKind::Touch | OpKind::Flush => {
                            parse_status_frame
                        }
                        OpKind::Mutate => parse_mutate_frame,
                        OpKind::Stats => parse_stats_frame,
                        OpKind::Version | OpKind::Noop => parse_version_frame,
                    };

                    let (consumed, frame) = match parser(&buf[..]) {
                        Ok((rest, frame)) => (buf.len() - rest.len(), frame),
                        Err(nom::Err::Incomplete(_)) => return Ok(DecodeProgress::NeedMore),
                        Err(_) => return Err(ErrorKind::Protocol(None)),
                    };
                    buf.advance(consumed);

                    match frame {
                        Frame::Status(status) => {
                            op.status = Some(status);
                            return Ok(DecodeProgress::Complete);
                        }
                        Frame::Number(value) => {
                            op.counter = Some(value);
                            return Ok(DecodeProgress::Complete);
                        }
                        Frame::End => return Ok(DecodeProgress::Complete),
                        Frame::Stat { name, value } => {
                            op.stats.push((name, value));
                        }
                        Frame::Version(version) => {
                            op.version = Some(version);
                            return Ok(DecodeProgress::Complete);
                        }
                        Frame::ValueHeader {
                            key,
                            flags,
                            cas,
                            len,
                        } => {
                            let value = Value {
                                key,
                                cas,
                                flags,
                                data: Vec::with_capacity(len),
                            };
                            self.state = State::Body {
                                value,
                                remaining: len,
                            };
                        }
                    }
                }
                State::Body {
                    mut value,
                    remaining,
                } => {
                    if buf.is_empty() {
                        self.state = State::Body { value, remaining };
                        return Ok(DecodeProgress::NeedMore);
                    }
                    let take = remaining.min(buf.len());
                    value.data.extend_from_slice(&buf[..take]);
                    buf.advance(take);
                    let remaining = remaining - take;
                    self.state = if remaining == 0 {
                        State::Trailer { value, need: 2 }
                    } else {
                        State::Body { value, remaining }
                    };
                }
                State::Trailer { value, mut need } => {
                    while need > 0 && !buf.is_empty() {
                        let expected = if need == 2 { b'\r' } else { b'\n' };
                        if buf[0] != expected {
                            return Err(ErrorKind::Protocol(Some(
                                "malformed value terminator".to_string(),
                            )));
                        }
                        buf.advance(1);
                        need -= 1;
                    }
                    if need > 0 {
                        self.state = State::Trailer { value, need };
                        return Ok(DecodeProgress::NeedMore);
                    }
                    op.values.push(value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Completion, OpHandle, Operation};

    fn op(kind: OpKind) -> Operation {
        let (handle, _rx) = OpHandle::new();
        Operation::new(kind, Bytes::new(), None, Completion::Single(handle))
    }

    fn decode_all(kind: OpKind, input: &[u8]) -> (Operation, DecodeProgress) {
        let mut decoder = AsciiDecoder::new();
        let mut buf = BytesMut::from(input);
        let mut op = op(kind);
        let progress = decoder.decode(&mut buf, &mut op).unwrap();
        (op, progress)
    }

    #[test]
    fn test_encode_storage_commands() {
        let cmd = encode(&Request::Store {
            verb: StoreVerb::Set,
            key: b"foo",
            flags: 0,
            exptime: 0,
            data: b"bar",
            cas: None,
        });
        assert_eq!(&cmd[..], b"set foo 0 0 3\r\nbar\r\n");

        let cmd = encode(&Request::Store {
            verb: StoreVerb::Add,
            key: b"counter",
            flags: 0,
            exptime: 60,
            data: b"10",
            cas: None,
        });
        assert_eq!(&cmd[..], b"add counter 0 60 2\r\n10\r\n");

        let cmd = encode(&Request::Store {
            verb: StoreVerb::Set,
            key: b"x",
            flags: 7,
            exptime: 0,
            data: b"v3",
            cas: Some(41),
        });
        assert_eq!(&cmd[..], b"cas x 7 0 2 41\r\nv3\r\n");

        let cmd = encode(&Request::Store {
            verb: StoreVerb::Append,
            key: b"k",
            flags: 0,
            exptime: 0,
            data: b"!",
            cas: None,
        });
        assert_eq!(&cmd[..], b"append k 0 0 1\r\n!\r\n");
    }

    #[test]
    fn test_encode_simple_commands() {
        let keys = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        assert_eq!(
            &encode(&Request::Get {
                keys: &keys,
                with_cas: false
            })[..],
            b"get a b c\r\n"
        );
        assert_eq!(
            &encode(&Request::Get {
                keys: &keys[..1],
                with_cas: true
            })[..],
            b"gets a\r\n"
        );
        assert_eq!(&encode(&Request::Delete { key: b"foo" })[..], b"delete foo\r\n");
        assert_eq!(
            &encode(&Request::Mutate {
                key: b"counter",
                delta: 1,
                decr: false
            })[..],
            b"incr counter 1\r\n"
        );
        assert_eq!(
            &encode(&Request::Mutate {
                key: b"counter",
                delta: 2,
                decr: true
            })[..],
            b"decr counter 2\r\n"
        );
        assert_eq!(
            &encode(&Request::Touch {
                key: b"foo",
                exptime: 30
            })[..],
            b"touch foo 30\r\n"
        );
        assert_eq!(&encode(&Request::Flush { delay: None })[..], b"flush_all\r\n");
        assert_eq!(
            &encode(&Request::Flush { delay: Some(10) })[..],
            b"flush_all 10\r\n"
        );
        assert_eq!(&encode(&Request::Version)[..], b"version\r\n");
        assert_eq!(&encode(&Request::Stats { arg: None })[..], b"stats\r\n");
        assert_eq!(
            &encode(&Request::Stats { arg: Some("items") })[..],
            b"stats items\r\n"
        );
    }

    #[test]
    fn test_decode_retrieval() {
        let (op, progress) =
            decode_all(OpKind::Retrieval, b"VALUE foo 0 3\r\nbar\r\nEND\r\n");
        assert_eq!(progress, DecodeProgress::Complete);
        assert_eq!(op.values.len(), 1);
        assert_eq!(op.values[0].key, b"foo");
        assert_eq!(op.values[0].data, b"bar");
        assert_eq!(op.values[0].cas, None);

        let (op, progress) = decode_all(OpKind::Retrieval, b"END\r\n");
        assert_eq!(progress, DecodeProgress::Complete);
        assert!(op.values.is_empty());
    }

    #[test]
    fn test_decode_is_restartable_at_every_split() {
        let input: &[u8] = b"VALUE foo 42 11\r\nhello world\r\nVALUE bar 43 11 15\r\nhello world\r\nEND\r\n";
        for split in 0..input.len() {
            let mut decoder = AsciiDecoder::new();
            let mut op = op(OpKind::Retrieval);

            let mut buf = BytesMut::from(&input[..split]);
            match decoder.decode(&mut buf, &mut op).unwrap() {
                DecodeProgress::NeedMore => {}
                DecodeProgress::Complete => panic!("completed early at split {}", split),
            }
            buf.extend_from_slice(&input[split..]);
            assert_eq!(
                decoder.decode(&mut buf, &mut op).unwrap(),
                DecodeProgress::Complete,
                "failed to complete after split {}",
                split
            );
            assert_eq!(op.values.len(), 2);
            assert_eq!(op.values[0].data, b"hello world");
            assert_eq!(op.values[1].cas, Some(15));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_decode_body_larger_than_single_read() {
        // Body arrives one byte at a time; the accumulator grows with each
        // decode call instead of waiting for the full frame.
        let input: &[u8] = b"VALUE big 0 5\r\nabcde\r\nEND\r\n";
        let mut decoder = AsciiDecoder::new();
        let mut op = op(OpKind::Retrieval);
        let mut buf = BytesMut::new();
        for (i, byte) in input.iter().enumerate() {
            buf.put_u8(*byte);
            let progress = decoder.decode(&mut buf, &mut op).unwrap();
            if i < input.len() - 1 {
                assert_eq!(progress, DecodeProgress::NeedMore);
            } else {
                assert_eq!(progress, DecodeProgress::Complete);
            }
        }
        assert_eq!(op.values[0].data, b"abcde");
    }

    #[test]
    fn test_decode_statuses_and_numbers() {
        let (op, _) = decode_all(OpKind::Store, b"STORED\r\n");
        assert_eq!(op.status, Some(crate::parser::Status::Stored));

        let (op, _) = decode_all(OpKind::Mutate, b"11\r\n");
        assert_eq!(op.counter, Some(11));

        let (op, _) = decode_all(OpKind::Mutate, b"NOT_FOUND\r\n");
        assert_eq!(op.status, Some(crate::parser::Status::NotFound));
    }

    #[test]
    fn test_decode_stats() {
        let (op, progress) = decode_all(
            OpKind::Stats,
            b"STAT pid 1\r\nSTAT uptime 100\r\nEND\r\n",
        );
        assert_eq!(progress, DecodeProgress::Complete);
        assert_eq!(
            op.stats,
            vec![
                ("pid".to_string(), "1".to_string()),
                ("uptime".to_string(), "100".to_string()),
            ]
        );
    }

    #[test]
    fn test_decode_version() {
        let (op, _) = decode_all(OpKind::Version, b"VERSION 1.6.21\r\n");
        assert_eq!(op.version.as_deref(), Some("1.6.21"));
    }

    #[test]
    fn test_corrupt_value_terminator() {
        let mut decoder = AsciiDecoder::new();
        let mut buf = BytesMut::from(&b"VALUE foo 0 3\r\nbarXXEND\r\n"[..]);
        let mut op = op(OpKind::Retrieval);
        assert!(decoder.decode(&mut buf, &mut op).is_err());
    }
}
