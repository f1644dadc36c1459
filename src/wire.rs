//! Low-level codecs for the capture stream: LEB128 varints, zigzag signed
//! varints and length-prefixed byte strings.
//!
//! Encoders write into a `Vec<u8>` scratch buffer owned by the writer so a
//! record is serialized with a single sink call. Decoders pull from any
//! `Read`, failing with `TruncatedRecord` on a short read so the reader can
//! report the stream position.

use std::io::Read;

use recorder_errors::{target, ErrorCode, RecorderResult};

/// Append an unsigned LEB128 varint.
pub fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Append a zigzag-encoded signed varint.
pub fn put_svarint(out: &mut Vec<u8>, value: i64) {
    put_varint(out, ((value << 1) ^ (value >> 63)) as u64);
}

/// Append a length-prefixed byte string.
pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Append a length-prefixed UTF-8 string.
pub fn put_str(out: &mut Vec<u8>, value: &str) {
    put_bytes(out, value.as_bytes());
}

fn read_byte(reader: &mut impl Read) -> RecorderResult<u8> {
    let mut byte = [0u8; 1];
    match reader.read(&mut byte) {
        Ok(1) => Ok(byte[0]),
        Ok(_) => Err(target!(
            ErrorCode::TruncatedRecord,
            "stream ended inside a varint"
        )),
        Err(err) => Err(err.into()),
    }
}

/// Read an unsigned LEB128 varint. Rejects encodings longer than ten bytes.
pub fn get_varint(reader: &mut impl Read) -> RecorderResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = read_byte(reader)?;
        if shift >= 64 || (shift == 63 && byte & 0x7f > 1) {
            return Err(target!(
                ErrorCode::TruncatedRecord,
                "varint exceeds 64 bits"
            ));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Read a zigzag-encoded signed varint.
pub fn get_svarint(reader: &mut impl Read) -> RecorderResult<i64> {
    let raw = get_varint(reader)?;
    Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
}

/// Read a length-prefixed byte string, bounded to keep a corrupt length from
/// allocating the address space.
pub fn get_bytes(reader: &mut impl Read, max_len: usize) -> RecorderResult<Vec<u8>> {
    let len = get_varint(reader)? as usize;
    if len > max_len {
        return Err(target!(
            ErrorCode::TruncatedRecord,
            "byte string length {} exceeds limit {}",
            len,
            max_len
        ));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).map_err(|err| {
        target!(
            ErrorCode::TruncatedRecord,
            "stream ended inside a byte string: {}",
            err
        )
    })?;
    Ok(bytes)
}

/// Read a length-prefixed UTF-8 string.
pub fn get_str(reader: &mut impl Read, max_len: usize) -> RecorderResult<String> {
    let bytes = get_bytes(reader, max_len)?;
    String::from_utf8(bytes).map_err(|_| {
        target!(ErrorCode::TruncatedRecord, "byte string is not valid UTF-8")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip_u64(value: u64) -> u64 {
        let mut buf = Vec::new();
        put_varint(&mut buf, value);
        get_varint(&mut Cursor::new(buf)).expect("decode")
    }

    fn round_trip_i64(value: i64) -> i64 {
        let mut buf = Vec::new();
        put_svarint(&mut buf, value);
        get_svarint(&mut Cursor::new(buf)).expect("decode")
    }

    #[test]
    fn varint_round_trips_across_widths() {
        for value in [0, 1, 127, 128, 300, 16383, 16384, u32::MAX as u64, u64::MAX] {
            assert_eq!(round_trip_u64(value), value);
        }
    }

    #[test]
    fn small_values_stay_single_byte() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 127);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn svarint_round_trips_negative_deltas() {
        for value in [0, -1, 1, -64, 64, i64::MIN, i64::MAX] {
            assert_eq!(round_trip_i64(value), value);
        }
    }

    #[test]
    fn truncated_varint_is_reported() {
        let err = get_varint(&mut Cursor::new(vec![0x80u8])).unwrap_err();
        assert_eq!(err.code, recorder_errors::ErrorCode::TruncatedRecord);
    }

    #[test]
    fn oversized_byte_string_is_rejected() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 1 << 40);
        let err = get_bytes(&mut Cursor::new(buf), 1 << 20).unwrap_err();
        assert_eq!(err.code, recorder_errors::ErrorCode::TruncatedRecord);
    }

    #[test]
    fn strings_round_trip() {
        let mut buf = Vec::new();
        put_str(&mut buf, "allocate");
        let decoded = get_str(&mut Cursor::new(buf), 1024).expect("decode");
        assert_eq!(decoded, "allocate");
    }
}
