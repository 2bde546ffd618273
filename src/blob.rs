//! Content-addressed tensor blob storage.
//!
//! A blob file is named by the hex BLAKE2b digest of its *decompressed*
//! contents: `<digest>.bin` (raw) or `<digest>.bin.gz` (gzip). The digest
//! check is unconditional and always precedes deserialization.

use crate::dtype::Device;
use crate::tensor::TensorBuffer;
use blake2::{Blake2b512, Digest};
use std::io::Read;
use std::path::{Path, PathBuf};

pub const BLOB_SUFFIX: &str = ".bin";
pub const COMPRESSED_BLOB_SUFFIX: &str = ".bin.gz";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tensor blob not found: {path:?}")]
    NotFound { path: PathBuf },
    #[error("could not read tensor blob {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decompress gzip blob {path:?}")]
    Decompress {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("blob filename {path:?} does not follow the <digest>.bin[.gz] convention")]
    BadName { path: PathBuf },
    #[error("hash verification failed for {path:?}: expected {expected:?} but computed {computed:?}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        computed: String,
    },
    #[error("failed to load tensor from {path:?}")]
    Load {
        path: PathBuf,
        source: rmp_serde::decode::Error,
    },
    #[error("blob {path:?} holds {have} data bytes but dtype and shape require {want}")]
    SizeMismatch {
        path: PathBuf,
        have: usize,
        want: usize,
    },
    #[error("could not write tensor blob {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not encode tensor buffer")]
    Encode {
        #[from]
        source: rmp_serde::encode::Error,
    },
}

/// Load a tensor buffer from a content-addressed blob file, verifying its
/// integrity against the digest encoded in the filename.
///
/// When `device` is given the returned buffer is re-tagged onto that device;
/// otherwise the recorded placement is preserved.
pub fn load(path: impl AsRef<Path>, device: Option<&Device>) -> Result<TensorBuffer, Error> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::NotFound {
            path: path.to_path_buf(),
        });
    }

    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .ok_or_else(|| Error::BadName {
            path: path.to_path_buf(),
        })?;
    let is_compressed = file_name.ends_with(COMPRESSED_BLOB_SUFFIX);

    let mut contents = std::fs::read(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;

    if is_compressed {
        let mut decompressed = Vec::new();
        flate2::read::GzDecoder::new(&contents[..])
            .read_to_end(&mut decompressed)
            .map_err(|source| Error::Decompress {
                path: path.to_path_buf(),
                source,
            })?;
        contents = decompressed;
    }

    // the expected digest is the filename stem
    let expected = if is_compressed {
        file_name.trim_end_matches(COMPRESSED_BLOB_SUFFIX)
    } else {
        file_name.trim_end_matches(BLOB_SUFFIX)
    };
    if expected.is_empty() || expected == file_name {
        return Err(Error::BadName {
            path: path.to_path_buf(),
        });
    }

    // always computed over decompressed bytes
    let computed = hex::encode(Blake2b512::digest(&contents));
    if computed != expected {
        return Err(Error::HashMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            computed,
        });
    }

    let buffer: TensorBuffer =
        rmp_serde::from_slice(&contents).map_err(|source| Error::Load {
            path: path.to_path_buf(),
            source,
        })?;
    if buffer.data.len() != buffer.size_bytes() {
        return Err(Error::SizeMismatch {
            path: path.to_path_buf(),
            have: buffer.data.len(),
            want: buffer.size_bytes(),
        });
    }

    log::debug!(
        "loaded {} {:?} blob from {}",
        buffer.dtype,
        buffer.shape,
        path.display()
    );
    Ok(match device {
        Some(device) => buffer.to_device(device),
        None => buffer,
    })
}

/// Write a buffer as a content-addressed blob into `dir` and return its path.
///
/// The filename is derived from the digest of the encoded (uncompressed)
/// bytes, so [`load`] will accept it unchanged.
pub fn store(
    buffer: &TensorBuffer,
    dir: impl AsRef<Path>,
    compress: bool,
) -> Result<PathBuf, Error> {
    use std::io::Write;

    let dir = dir.as_ref();
    let encoded = rmp_serde::to_vec(buffer)?;
    let digest = hex::encode(Blake2b512::digest(&encoded));

    let suffix = if compress {
        COMPRESSED_BLOB_SUFFIX
    } else {
        BLOB_SUFFIX
    };
    let path = dir.join(format!("{digest}{suffix}"));

    let write_err = |source| Error::Write {
        path: path.clone(),
        source,
    };
    if compress {
        let file = std::fs::File::create(&path).map_err(&write_err)?;
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(&encoded).map_err(&write_err)?;
        encoder.finish().map_err(&write_err)?;
    } else {
        std::fs::write(&path, &encoded).map_err(&write_err)?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::{load, store, Error};
    use crate::dtype::{Device, Dtype};
    use crate::tensor::TensorBuffer;
    use rand::SeedableRng;
    use similar_asserts as diff;

    fn sample_buffer() -> TensorBuffer {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        TensorBuffer::random(Dtype::Float32, vec![4, 4], Device::from("cuda:0"), &mut rng)
            .unwrap()
    }

    #[test]
    fn compressed_and_uncompressed_load_identically() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = sample_buffer();

        let raw_path = store(&buffer, dir.path(), false).unwrap();
        let gz_path = store(&buffer, dir.path(), true).unwrap();

        let raw = load(&raw_path, None).unwrap();
        let gz = load(&gz_path, None).unwrap();
        diff::assert_eq!(have: &raw, want: &buffer);
        diff::assert_eq!(have: gz, want: raw);
    }

    #[test]
    fn digest_mismatch_is_a_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = store(&sample_buffer(), dir.path(), false).unwrap();

        // corrupt one byte
        let mut contents = std::fs::read(&path).unwrap();
        contents[0] ^= 0xff;
        std::fs::write(&path, &contents).unwrap();

        let err = load(&path, None).unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }), "{err}");
    }

    #[test]
    fn missing_blob_is_not_found() {
        let err = load("/nonexistent/deadbeef.bin", None).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn malformed_gzip_is_a_decompression_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deadbeef.bin.gz");
        std::fs::write(&path, b"this is not gzip").unwrap();

        let err = load(&path, None).unwrap_err();
        assert!(matches!(err, Error::Decompress { .. }), "{err}");
    }

    #[test]
    fn device_override_retags_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = sample_buffer();
        let path = store(&buffer, dir.path(), false).unwrap();

        let moved = load(&path, Some(&Device::from("cpu"))).unwrap();
        diff::assert_eq!(have: moved.device, want: Device::from("cpu"));
        diff::assert_eq!(have: moved.data, want: buffer.data);

        let kept = load(&path, None).unwrap();
        diff::assert_eq!(have: kept.device, want: Device::from("cuda:0"));
    }
}
