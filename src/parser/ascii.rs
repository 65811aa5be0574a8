use nom::{
    branch::alt,
    bytes::streaming::{tag, take_until, take_while1},
    character::streaming::crlf,
    combinator::{map, map_res, opt, value},
    sequence::{delimited, preceded, terminated, tuple},
    IResult,
};

use super::{is_key_char, parse_u32, parse_u64, ErrorKind, Status};

/// One parsed unit of an ASCII response stream.
///
/// A full response is one or more frames: a single status line for most
/// operations, `VALUE` headers (with bodies consumed separately by the
/// connection decoder) terminated by `END` for retrievals, `STAT` lines
/// terminated by `END` for stats.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Frame {
    Status(Status),
    Number(u64),
    ValueHeader {
        key: Vec<u8>,
        flags: u32,
        cas: Option<u64>,
        len: usize,
    },
    Stat {
        name: String,
        value: String,
    },
    Version(String),
    End,
}

fn parse_error(buf: &[u8]) -> IResult<&[u8], Status> {
    map(
        alt((
            value(ErrorKind::NonexistentCommand, tag(b"ERROR")),
            map_res(preceded(tag(b"CLIENT_ERROR "), take_until("\r\n")), |s| {
                std::str::from_utf8(s).map(|s| ErrorKind::Client(s.to_string()))
            }),
            map_res(preceded(tag(b"SERVER_ERROR "), take_until("\r\n")), |s| {
                std::str::from_utf8(s).map(|s| ErrorKind::Server(s.to_string()))
            }),
        )),
        Status::Error,
    )(buf)
}

fn parse_status(buf: &[u8]) -> IResult<&[u8], Status> {
    terminated(
        alt((
            value(Status::Stored, tag(b"STORED")),
            value(Status::NotStored, tag(b"NOT_STORED")),
            value(Status::Deleted, tag(b"DELETED")),
            value(Status::Touched, tag(b"TOUCHED")),
            value(Status::Exists, tag(b"EXISTS")),
            value(Status::NotFound, tag(b"NOT_FOUND")),
            value(Status::Ok, tag(b"OK")),
            parse_error,
        )),
        crlf,
    )(buf)
}

// VALUE <key> <flags> <len> [<cas>]\r\n
//
// The data block is not consumed here: the connection decoder streams it into
// the in-flight operation so a value larger than the read buffer never has to
// be fully buffered before parsing can make progress.
fn parse_value_header(buf: &[u8]) -> IResult<&[u8], Frame> {
    let kf = take_while1(is_key_char);
    let (buf, (_, key, _, flags, _, len, cas, _)) = tuple((
        tag("VALUE "),
        kf,
        tag(" "),
        parse_u32,
        tag(" "),
        parse_u64,
        opt(preceded(tag(" "), parse_u64)),
        crlf,
    ))(buf)?;

    Ok((
        buf,
        Frame::ValueHeader {
            key: key.to_vec(),
            flags,
            cas,
            len: len as usize,
        },
    ))
}

fn parse_stat_line(buf: &[u8]) -> IResult<&[u8], Frame> {
    let (buf, (_, name, _, val, _)) = tuple((
        tag("STAT "),
        map_res(take_while1(is_key_char), std::str::from_utf8),
        tag(" "),
        map_res(take_until("\r\n"), std::str::from_utf8),
        crlf,
    ))(buf)?;

    Ok((
        buf,
        Frame::Stat {
            name: name.to_string(),
            value: val.to_string(),
        },
    ))
}

pub(crate) fn parse_status_frame(buf: &[u8]) -> IResult<&[u8], Frame> {
    map(parse_status, Frame::Status)(buf)
}

pub(crate) fn parse_retrieval_frame(buf: &[u8]) -> IResult<&[u8], Frame> {
    alt((
        value(Frame::End, tag("END\r\n")),
        parse_value_header,
        map(parse_status, Frame::Status),
    ))(buf)
}

pub(crate) fn parse_mutate_frame(buf: &[u8]) -> IResult<&[u8], Frame> {
    alt((
        map(terminated(parse_u64, crlf), Frame::Number),
        map(parse_status, Frame::Status),
    ))(buf)
}

pub(crate) fn parse_stats_frame(buf: &[u8]) -> IResult<&[u8], Frame> {
    alt((
        value(Frame::End, tag("END\r\n")),
        parse_stat_line,
        map(parse_status, Frame::Status),
    ))(buf)
}

pub(crate) fn parse_version_frame(buf: &[u8]) -> IResult<&[u8], Frame> {
    alt((
        map(
            delimited(
                tag("VERSION "),
                map_res(take_until("\r\n"), std::str::from_utf8),
                crlf,
            ),
            |s: &str| Frame::Version(s.to_string()),
        ),
        map(parse_status, Frame::Status),
    ))(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        // (buffer to parse, expected number of bytes read, expected frame)
        static ref STATUS_CASES: Vec<(&'static [u8], usize, Frame)> = {
            vec![
                (b"STORED\r\n", 8, Frame::Status(Status::Stored)),
                (b"NOT_STORED\r\n", 12, Frame::Status(Status::NotStored)),
                (b"DELETED\r\n", 9, Frame::Status(Status::Deleted)),
                (b"TOUCHED\r\n", 9, Frame::Status(Status::Touched)),
                (b"EXISTS\r\n", 8, Frame::Status(Status::Exists)),
                (b"NOT_FOUND\r\n", 11, Frame::Status(Status::NotFound)),
                (b"OK\r\n", 4, Frame::Status(Status::Ok)),
                (b"ERROR\r\n", 7, Frame::Status(Status::Error(ErrorKind::NonexistentCommand))),
                (b"CLIENT_ERROR foo\r\n", 18,
                    Frame::Status(Status::Error(ErrorKind::Client("foo".to_string())))),
                (b"SERVER_ERROR out of memory\r\n", 28,
                    Frame::Status(Status::Error(ErrorKind::Server("out of memory".to_string())))),
            ]
        };
        static ref RETRIEVAL_CASES: Vec<(&'static [u8], usize, Frame)> = {
            vec![
                (b"END\r\n", 5, Frame::End),
                (b"VALUE foo 42 11\r\n", 17, Frame::ValueHeader {
                    key: b"foo".to_vec(), flags: 42, cas: None, len: 11,
                }),
                (b"VALUE bar 43 11 15\r\n", 20, Frame::ValueHeader {
                    key: b"bar".to_vec(), flags: 43, cas: Some(15), len: 11,
                }),
                (b"SERVER_ERROR bar\r\n", 18,
                    Frame::Status(Status::Error(ErrorKind::Server("bar".to_string())))),
            ]
        };
        static ref MUTATE_CASES: Vec<(&'static [u8], usize, Frame)> = {
            vec![
                (b"42\r\n", 4, Frame::Number(42)),
                (b"0\r\n", 3, Frame::Number(0)),
                (b"18446744073709551615\r\n", 22, Frame::Number(u64::MAX)),
                (b"NOT_FOUND\r\n", 11, Frame::Status(Status::NotFound)),
            ]
        };
        static ref STATS_CASES: Vec<(&'static [u8], usize, Frame)> = {
            vec![
                (b"STAT pid 1234\r\n", 15, Frame::Stat {
                    name: "pid".to_string(), value: "1234".to_string(),
                }),
                (b"STAT version 1.6.7\r\n", 20, Frame::Stat {
                    name: "version".to_string(), value: "1.6.7".to_string(),
                }),
                (b"END\r\n", 5, Frame::End),
            ]
        };
    }

    fn check_complete(
        parser: impl Fn(&[u8]) -> IResult<&[u8], Frame>,
        cases: &[(&'static [u8], usize, Frame)],
    ) {
        for (data, data_read, expected) in cases {
            let (remaining, frame) = parser(data).unwrap();
            assert_eq!(&frame, expected);
            assert_eq!(data.len() - remaining.len(), *data_read);
        }
    }

    // For each case, slice down the input data and assert that until we feed
    // the whole frame, we don't get a parsed result.
    fn check_incomplete(
        parser: impl Fn(&[u8]) -> IResult<&[u8], Frame>,
        cases: &[(&'static [u8], usize, Frame)],
    ) {
        for (data, data_read, _) in cases {
            for i in 0..*data_read {
                assert!(parser(&data[..i]).is_err());
            }
        }
    }

    #[test]
    fn test_status_frames() {
        check_complete(parse_status_frame, &STATUS_CASES);
        check_incomplete(parse_status_frame, &STATUS_CASES);
    }

    #[test]
    fn test_retrieval_frames() {
        check_complete(parse_retrieval_frame, &RETRIEVAL_CASES);
        check_incomplete(parse_retrieval_frame, &RETRIEVAL_CASES);
    }

    #[test]
    fn test_mutate_frames() {
        check_complete(parse_mutate_frame, &MUTATE_CASES);
    }

    #[test]
    fn test_stats_frames() {
        check_complete(parse_stats_frame, &STATS_CASES);
        check_incomplete(parse_stats_frame, &STATS_CASES);
    }

    #[test]
    fn test_version_frame() {
        let (remaining, frame) = parse_version_frame(b"VERSION 1.6.21\r\n").unwrap();
        assert_eq!(frame, Frame::Version("1.6.21".to_string()));
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            parse_status_frame(b"WAT\r\n"),
            Err(nom::Err::Error(_))
        ));
        assert!(matches!(
            parse_retrieval_frame(b"12 NOT A VALUE\r\n"),
            Err(nom::Err::Error(_))
        ));
    }
}
