use anyhow::{Result, bail};
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::io::Read;

/// Compression level picked by payload size: below the threshold the data
/// is unlikely to shrink, so spend nothing on it.
pub const COMPRESSION_THRESHOLD: usize = 66;

pub fn deflate_gzip(src: &[u8]) -> Result<Vec<u8>> {
    let level = if src.len() <= COMPRESSION_THRESHOLD {
        Compression::none()
    } else {
        Compression::default()
    };
    let mut out = Vec::with_capacity(src.len() / 2 + 32);
    GzEncoder::new(src, level).read_to_end(&mut out)?;
    Ok(out)
}

/// Inflate with a hard output cap. Wire inputs are attacker-controlled, so
/// the decompressed size is bounded before any allocation grows past
/// `max_out`.
pub fn inflate_gzip(src: &[u8], max_out: usize) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(src);
    let mut out = Vec::new();
    let mut limited = (&mut decoder).take(max_out as u64 + 1);
    limited.read_to_end(&mut out)?;
    if out.len() > max_out {
        bail!("inflated size exceeds cap of {max_out} bytes");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_and_large() {
        for payload in [
            b"tiny".to_vec(),
            vec![0x5A; COMPRESSION_THRESHOLD + 1],
            (0..4000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>(),
        ] {
            let packed = deflate_gzip(&payload).unwrap();
            let unpacked = inflate_gzip(&packed, 4096).unwrap();
            assert_eq!(unpacked, payload);
        }
    }

    #[test]
    fn rejects_oversized_output() {
        let payload = vec![0u8; 8192];
        let packed = deflate_gzip(&payload).unwrap();
        assert!(inflate_gzip(&packed, 4096).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(inflate_gzip(&[0xDE, 0xAD, 0xBE, 0xEF], 64).is_err());
    }
}
