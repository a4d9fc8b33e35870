pub mod loose;

pub use loose::LooseStore;

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::types::ObjectType;

/// longest `"<type> <len>\0"` header we accept ("commit " + 20 digits + NUL)
pub(crate) const MAX_HEADER_LEN: usize = 32;

/// zlib-compress the concatenation of `parts`
pub(crate) fn compress(level: Compression, parts: &[&[u8]]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), level);
    for part in parts {
        encoder.write_all(part)?;
    }
    encoder.finish()
}

/// inflate a complete zlib stream
pub(crate) fn inflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// parse `"<type> <len>\0"`, returning (type, declared length, header length)
pub(crate) fn parse_header(data: &[u8]) -> Option<(ObjectType, usize, usize)> {
    let nul = data.iter().take(MAX_HEADER_LEN).position(|&b| b == 0)?;
    let header = &data[..nul];
    let space = header.iter().position(|&b| b == b' ')?;

    let kind = ObjectType::from_bytes(&header[..space]).ok()?;
    let digits = &header[space + 1..];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    // leading zeros are not canonical
    if digits.len() > 1 && digits[0] == b'0' {
        return None;
    }
    let len = std::str::from_utf8(digits).ok()?.parse().ok()?;
    Some((kind, len, nul + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_inflate() {
        let packed = compress(Compression::default(), &[b"blob 5\0", b"hello"]).unwrap();
        assert_eq!(inflate(&packed).unwrap(), b"blob 5\0hello");
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header(b"blob 5\0hello"),
            Some((ObjectType::Blob, 5, 7))
        );
        assert_eq!(parse_header(b"tree 0\0"), Some((ObjectType::Tree, 0, 7)));
        assert_eq!(parse_header(b"blob 05\0hello"), None);
        assert_eq!(parse_header(b"blob x\0"), None);
        assert_eq!(parse_header(b"blub 1\0x"), None);
        assert_eq!(parse_header(b"blob 1"), None);
    }

    #[test]
    fn test_inflate_garbage() {
        assert!(inflate(b"definitely not zlib").is_err());
    }
}
