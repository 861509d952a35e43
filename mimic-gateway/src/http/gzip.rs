//! Gzip re-compression/decompression for response bodies carrying
//! `Content-Encoding: gzip` (§4.5).

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::EngineError;

pub fn decompress(body: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| EngineError::ProtocolViolation("malformed gzip body"))?;
    Ok(out)
}

pub fn compress(body: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing to an in-memory buffer cannot fail.
    encoder.write_all(body).expect("write to in-memory buffer");
    encoder.finish().expect("finish in-memory gzip stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_gzip() {
        let original = b"hello world, this is a response body";
        let compressed = compress(original);
        let decompressed = decompress(&compressed).expect("valid gzip");
        assert_eq!(decompressed, original);
    }
}
