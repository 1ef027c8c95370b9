use std::fs;
use std::path::Path;

use flate2::read::GzDecoder;
use log::info;
use tar::Archive;

use crate::error::{OrlFacesError, Result};

/// Hex MD5 digest of a byte buffer.
pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Unpacks a gzip-compressed tar archive into `dest`.
///
/// When `expected_md5` is provided the archive content is verified first, and nothing is
/// extracted on mismatch.
pub fn extract_archive(archive: &Path, dest: &Path, expected_md5: Option<&str>) -> Result<()> {
    let bytes = fs::read(archive)?;

    if let Some(expected) = expected_md5 {
        let actual = md5_hex(&bytes);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(OrlFacesError::ChecksumMismatch {
                path: archive.to_path_buf(),
                expected: expected.to_string(),
                actual,
            });
        }
    }

    info!(
        "Extracting `{}` to `{}`",
        archive.display(),
        dest.display()
    );
    fs::create_dir_all(dest)?;

    // Decode gzip content and unpack archive
    let gz_buffer = GzDecoder::new(&bytes[..]);
    Archive::new(gz_buffer).unpack(dest)?;

    Ok(())
}
