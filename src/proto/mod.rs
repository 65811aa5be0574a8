//! Wire codecs: command encoding and restartable response decoding.
//!
//! Commands are encoded once, up front, into the operation's command bytes;
//! replay after a reconnect rewrites them verbatim. Decoding is driven by the
//! node as bytes arrive: a decoder consumes as much of the read buffer as it
//! can for the operation at the head of the read queue and reports whether
//! that operation's response is complete.

mod ascii;
mod binary;

use bytes::{Bytes, BytesMut};

use crate::config::Protocol;
use crate::operation::{OpKind, Operation};
use crate::parser::ErrorKind;

pub(crate) use ascii::AsciiDecoder;
pub(crate) use binary::BinaryDecoder;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// A command to encode. Borrows the caller's buffers; the encoder produces
/// the owned bytes that live on the operation.
pub(crate) enum Request<'a> {
    Get {
        keys: &'a [Vec<u8>],
        with_cas: bool,
    },
    Store {
        verb: StoreVerb,
        key: &'a [u8],
        flags: u32,
        exptime: u32,
        data: &'a [u8],
        cas: Option<u64>,
    },
    Delete {
        key: &'a [u8],
    },
    Mutate {
        key: &'a [u8],
        delta: u64,
        decr: bool,
    },
    Touch {
        key: &'a [u8],
        exptime: u32,
    },
    Flush {
        delay: Option<u32>,
    },
    Version,
    Stats {
        arg: Option<&'a str>,
    },
    Noop,
}

impl Request<'_> {
    pub(crate) fn kind(&self) -> OpKind {
        match self {
            Request::Get { .. } => OpKind::Retrieval,
            Request::Store { .. } => OpKind::Store,
            Request::Delete { .. } => OpKind::Delete,
            Request::Mutate { .. } => OpKind::Mutate,
            Request::Touch { .. } => OpKind::Touch,
            Request::Flush { .. } => OpKind::Flush,
            Request::Version => OpKind::Version,
            Request::Stats { .. } => OpKind::Stats,
            Request::Noop => OpKind::Noop,
        }
    }
}

pub(crate) fn encode(protocol: Protocol, request: &Request<'_>) -> Bytes {
    match protocol {
        Protocol::Ascii => ascii::encode(request),
        Protocol::Binary => binary::encode(request),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DecodeProgress {
    /// The buffer holds no complete frame; read more.
    NeedMore,
    /// The head operation's response is fully decoded.
    Complete,
}

/// Per-connection decode state. Reset whenever the connection is replaced.
pub(crate) enum Decoder {
    Ascii(AsciiDecoder),
    Binary(BinaryDecoder),
}

impl Decoder {
    pub(crate) fn new(protocol: Protocol) -> Decoder {
        match protocol {
            Protocol::Ascii => Decoder::Ascii(AsciiDecoder::new()),
            Protocol::Binary => Decoder::Binary(BinaryDecoder::new()),
        }
    }

    pub(crate) fn reset(&mut self) {
        match self {
            Decoder::Ascii(d) => d.reset(),
            Decoder::Binary(d) => d.reset(),
        }
    }

    pub(crate) fn decode(
        &mut self,
        buf: &mut BytesMut,
        op: &mut Operation,
    ) -> Result<DecodeProgress, ErrorKind> {
        match self {
            Decoder::Ascii(d) => d.decode(buf, op),
            Decoder::Binary(d) => d.decode(buf, op),
        }
    }
}
