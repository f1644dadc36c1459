//! Block-compressor seam. Capture files are written uncompressed for speed
//! and re-encoded once on close; replay sniffs the leading magic to decide
//! whether to decode.

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Leading bytes of an encoded stream.
pub const COMPRESSION_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Encode everything `reader` yields into `writer`, returning the inner
/// writer once the trailing checksum has been emitted.
pub fn encode<R: Read, W: Write>(reader: &mut R, writer: W, level: u32) -> io::Result<W> {
    let mut encoder = GzEncoder::new(writer, Compression::new(level));
    io::copy(reader, &mut encoder)?;
    encoder.finish()
}

/// Wrap `reader` in a decoder for streams produced by [`encode`]. The caller
/// is expected to have already consumed nothing from `reader`.
pub fn decode_stream<R: Read + Send + 'static>(reader: R) -> Box<dyn Read + Send> {
    Box::new(GzDecoder::new(reader))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_restores_the_payload() {
        let payload: Vec<u8> = (0..4096u32).flat_map(|v| v.to_le_bytes()).collect();
        let encoded = encode(&mut payload.as_slice(), Vec::new(), 6).expect("encode");
        assert_eq!(encoded[..2], COMPRESSION_MAGIC);

        let mut decoded = Vec::new();
        decode_stream(std::io::Cursor::new(encoded))
            .read_to_end(&mut decoded)
            .expect("decode");
        assert_eq!(decoded, payload);
    }
}
