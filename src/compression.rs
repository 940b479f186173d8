use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as Flate2Compression;

pub trait Compression {
    fn compress(&self, in_buffer: &[u8]) -> Result<Vec<u8>, std::io::Error>;
    fn decompress(&self, in_buffer: &[u8]) -> Result<Vec<u8>, std::io::Error>;
}

pub struct NoCompression;

impl Compression for NoCompression {
    fn compress(&self, in_buffer: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        Ok(in_buffer.to_vec())
    }

    fn decompress(&self, in_buffer: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        Ok(in_buffer.to_vec())
    }
}

pub struct GZipCompression;

impl Compression for GZipCompression {
    fn compress(&self, in_buffer: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut res = Vec::new();
        let mut encoder = GzEncoder::new(&mut res, Flate2Compression::default());
        encoder.write_all(in_buffer)?;
        encoder.finish()?;
        Ok(res)
    }

    fn decompress(&self, in_buffer: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut res = Vec::new();
        let mut decoder = GzDecoder::new(in_buffer);
        decoder.read_to_end(&mut res)?;
        Ok(res)
    }
}

#[cfg(test)]
mod compression_tests {
    use super::*;

    #[test]
    fn gzip_round_trip() -> Result<(), std::io::Error> {
        let data = b"some highly compressible data data data data data data".to_vec();

        let compressed = GZipCompression.compress(&data)?;
        assert_ne!(compressed, data);

        let decompressed = GZipCompression.decompress(&compressed)?;
        assert_eq!(decompressed, data);

        Ok(())
    }

    #[test]
    fn gzip_rejects_garbage() {
        assert!(GZipCompression.decompress(b"definitely not gzip").is_err());
    }

    #[test]
    fn no_compression_is_identity() -> Result<(), std::io::Error> {
        let data = b"plain".to_vec();
        assert_eq!(NoCompression.compress(&data)?, data);
        assert_eq!(NoCompression.decompress(&data)?, data);
        Ok(())
    }
}
