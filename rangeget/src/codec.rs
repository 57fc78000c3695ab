//! Incremental decoding of `Content-Encoding` bodies.

use std::io::{self, Write};

use flate2::write::{GzDecoder, ZlibDecoder};
use tracing::warn;

/// Body encoding announced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
    Deflate,
}

impl ContentEncoding {
    /// Parse a `Content-Encoding` header value.
    ///
    /// Unsupported codings are treated as identity; the bytes are then
    /// stored exactly as received.
    pub fn from_header(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::Identity;
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Self::Identity,
            "gzip" | "x-gzip" => Self::Gzip,
            "deflate" => Self::Deflate,
            other => {
                warn!(encoding = other, "Unsupported content encoding, storing raw bytes");
                Self::Identity
            }
        }
    }

    pub fn is_identity(self) -> bool {
        self == Self::Identity
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

/// Streaming decoder fed with raw body chunks.
pub enum Decoder {
    Identity,
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

impl Decoder {
    pub fn new(encoding: ContentEncoding) -> Self {
        match encoding {
            ContentEncoding::Identity => Self::Identity,
            ContentEncoding::Gzip => Self::Gzip(GzDecoder::new(Vec::new())),
            ContentEncoding::Deflate => Self::Deflate(ZlibDecoder::new(Vec::new())),
        }
    }

    /// Feed one raw chunk and return whatever decoded bytes are ready.
    pub fn decode(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Identity => Ok(chunk.to_vec()),
            Self::Gzip(decoder) => {
                decoder.write_all(chunk)?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Self::Deflate(decoder) => {
                decoder.write_all(chunk)?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }

    /// Flush the decoder at the end of the body.
    pub fn finish(&mut self) -> io::Result<Vec<u8>> {
        match self {
            Self::Identity => Ok(Vec::new()),
            Self::Gzip(decoder) => {
                decoder.try_finish()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Self::Deflate(decoder) => {
                decoder.try_finish()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Identity => "Identity",
            Self::Gzip(_) => "Gzip",
            Self::Deflate(_) => "Deflate",
        };
        f.debug_tuple("Decoder").field(&name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    fn sample() -> Vec<u8> {
        (0..200_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect()
    }

    fn decode_in_chunks(mut decoder: Decoder, encoded: &[u8], chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for piece in encoded.chunks(chunk) {
            out.extend(decoder.decode(piece).unwrap());
        }
        out.extend(decoder.finish().unwrap());
        out
    }

    #[test]
    fn test_parse_content_encoding() {
        assert_eq!(ContentEncoding::from_header(None), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::from_header(Some("GZIP")), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::from_header(Some(" deflate ")), ContentEncoding::Deflate);
        assert_eq!(ContentEncoding::from_header(Some("br")), ContentEncoding::Identity);
    }

    #[test]
    fn test_gzip_decodes_across_chunk_boundaries() {
        let data = sample();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data).unwrap();
        let encoded = encoder.finish().unwrap();

        let decoded = decode_in_chunks(Decoder::new(ContentEncoding::Gzip), &encoded, 1000);
        assert_eq!(decoded.len(), data.len());
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_deflate_decodes_zlib_stream() {
        let data = sample();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&data).unwrap();
        let encoded = encoder.finish().unwrap();

        let decoded = decode_in_chunks(Decoder::new(ContentEncoding::Deflate), &encoded, 333);
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_corrupt_gzip_is_an_error() {
        let mut decoder = Decoder::new(ContentEncoding::Gzip);
        let result = decoder
            .decode(b"definitely not gzip data at all")
            .and_then(|_| decoder.finish());
        assert!(result.is_err());
    }
}
