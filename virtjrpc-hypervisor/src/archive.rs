//! LZ4 archives of disk images.
//!
//! Archives live beside the source file, named
//! `<path>_YYYYMMDDHHMMSS_backup.lz4`, in LZ4 frame format with block
//! checksums off, a content checksum on and 4 MiB blocks.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use lz4_flex::frame::{BlockSize, FrameEncoder, FrameInfo};
use tracing::{error, info};

use crate::error::{Error, Result};

/// Archive path for `input` at timestamp `at`.
pub fn archive_path(input: &Path, at: DateTime<Local>) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}_backup.lz4",
        input.display(),
        at.format("%Y%m%d%H%M%S")
    ))
}

/// Compress `input` into `output`, returning the number of bytes read.
pub fn compress_file(input: &Path, output: &Path) -> Result<u64> {
    let src = File::open(input)
        .map_err(|e| Error::Io(io::Error::new(e.kind(), format!("{}: {}", input.display(), e))))?;
    let dst = File::create(output)
        .map_err(|e| Error::Io(io::Error::new(e.kind(), format!("{}: {}", output.display(), e))))?;

    let info = FrameInfo::new()
        .block_size(BlockSize::Max4MB)
        .block_checksums(false)
        .content_checksum(true);

    let mut reader = BufReader::new(src);
    let mut encoder = FrameEncoder::with_frame_info(info, BufWriter::new(dst));
    let written = io::copy(&mut reader, &mut encoder)?;
    encoder
        .finish()
        .map_err(|e| Error::Internal(format!("failed to close LZ4 stream: {}", e)))?;
    Ok(written)
}

/// Produce the timestamped archive for one disk image. The archive is
/// informational; the caller decides whether a failure aborts the larger
/// operation.
pub fn create_backup(input: &str) -> Result<PathBuf> {
    let input_path = Path::new(input);
    let output = archive_path(input_path, Local::now());

    info!(input = %input, output = %output.display(), "started image backup");
    match compress_file(input_path, &output) {
        Ok(bytes) => {
            info!(input = %input, bytes, "finished image backup");
            Ok(output)
        }
        Err(e) => {
            error!(input = %input, error = %e, "failed to create image backup");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Read;

    #[test]
    fn archive_name_is_timestamped() {
        let at = Local.with_ymd_and_hms(2023, 7, 14, 9, 30, 5).unwrap();
        let p = archive_path(Path::new("/var/lib/libvirt/images/vm01.qcow2"), at);
        assert_eq!(
            p,
            PathBuf::from("/var/lib/libvirt/images/vm01.qcow2_20230714093005_backup.lz4")
        );
    }

    #[test]
    fn compresses_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("disk.qcow2");
        let payload = vec![0x42u8; 256 * 1024];
        std::fs::write(&src, &payload).unwrap();

        let dst = dir.path().join("disk.lz4");
        let read = compress_file(&src, &dst).unwrap();
        assert_eq!(read, payload.len() as u64);

        let mut decoder =
            lz4_flex::frame::FrameDecoder::new(File::open(&dst).unwrap());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = compress_file(
            &dir.path().join("nope.qcow2"),
            &dir.path().join("nope.lz4"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("nope.qcow2"));
    }
}
