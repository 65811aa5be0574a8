//! Conversion between application values and stored `{flags, bytes}` pairs.
//!
//! The client core treats values as opaque bytes; a [`Transcoder`] is the
//! seam where typed values enter and leave. Implementations own the meaning
//! of the flags word.

use crate::error::Error;

/// Converts a typed value to and from the `{flags, bytes}` pair stored on
/// the server.
pub trait Transcoder {
    /// The application-side type.
    type Value;

    /// Encode a value into its client flags and byte representation.
    fn encode(&self, value: &Self::Value) -> Result<(u32, Vec<u8>), Error>;

    /// Decode a stored value. `flags` is whatever was stored with it.
    fn decode(&self, flags: u32, data: &[u8]) -> Result<Self::Value, Error>;
}

/// Passes bytes through untouched, with flags 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawTranscoder;

impl Transcoder for RawTranscoder {
    type Value = Vec<u8>;

    fn encode(&self, value: &Vec<u8>) -> Result<(u32, Vec<u8>), Error> {
        Ok((0, value.clone()))
    }

    fn decode(&self, _flags: u32, data: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(data.to_vec())
    }
}

/// Stores `String`s as UTF-8 bytes, with flags 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct Utf8Transcoder;

impl Transcoder for Utf8Transcoder {
    type Value = String;

    fn encode(&self, value: &String) -> Result<(u32, Vec<u8>), Error> {
        Ok((0, value.clone().into_bytes()))
    }

    fn decode(&self, _flags: u32, data: &[u8]) -> Result<String, Error> {
        String::from_utf8(data.to_vec()).map_err(|e| Error::Transcode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_round_trip() {
        let tc = Utf8Transcoder;
        let (flags, bytes) = tc.encode(&"hello".to_string()).unwrap();
        assert_eq!(flags, 0);
        assert_eq!(tc.decode(flags, &bytes).unwrap(), "hello");
    }

    #[test]
    fn test_utf8_rejects_invalid_bytes() {
        let tc = Utf8Transcoder;
        assert!(matches!(
            tc.decode(0, &[0xff, 0xfe]),
            Err(Error::Transcode(_))
        ));
    }
}
