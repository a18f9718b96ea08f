//! Layered content fingerprints and the configurable file comparator.
//!
//! All functions here do blocking I/O; async callers go through
//! `tokio::task::spawn_blocking`.

use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use base64::Engine;
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};

use domain::model::vo::config::CompareMethod;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Bytes covered by the rapid-upload pre-hash probe.
const PRE_HASH_LEN: u64 = 1024;

/// Window sizes of the fast-hash tiers: whole file below 1 MiB, 64 KiB
/// windows below 1 GiB, 256 KiB windows from there up. `level` multiplies
/// the number of interior windows; head and tail are always covered.
fn fast_hash_window(size: u64) -> Option<u64> {
    if size < MIB {
        None
    } else if size < GIB {
        Some(64 * KIB)
    } else {
        Some(256 * KIB)
    }
}

/// Size-tiered digest over selected byte windows. Stable across unchanged
/// files: it reads fixed offsets derived only from the length.
pub fn fast_hash(path: &Path, level: u32) -> io::Result<String> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();

    let mut hasher = Sha1::new();
    hasher.update(size.to_le_bytes());

    match fast_hash_window(size) {
        None => {
            io::copy(&mut file, &mut hasher)?;
        }
        Some(window) => {
            let mut offsets = vec![0, size - window];
            let interior = level.max(1) as u64;
            for i in 1..=interior {
                // Evenly spaced between head and tail.
                offsets.push((size - window) * i / (interior + 1));
            }
            offsets.sort_unstable();
            let mut buf = vec![0u8; window as usize];
            for offset in offsets {
                file.seek(SeekFrom::Start(offset))?;
                read_up_to(&mut file, &mut buf)?;
                hasher.update(&buf);
            }
        }
    }

    Ok(hex_upper(&hasher.finalize()))
}

/// Full SHA-1 over the file content, streamed in 64 KiB reads.
pub fn sha1_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        match file.read(&mut buf) {
            Ok(0) => return Ok(hex_upper(&hasher.finalize())),
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }
}

pub fn sha1_bytes(bytes: &[u8]) -> String {
    hex_upper(&Sha1::digest(bytes))
}

/// SHA-1 of the first 1024 bytes, the rapid-upload candidacy probe.
pub fn pre_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; PRE_HASH_LEN as usize];
    let n = read_up_to(&mut file, &mut buf)?;
    Ok(sha1_bytes(&buf[..n]))
}

/// Rapid-upload possession proof: eight bytes of the file at an offset
/// derived from the access token, base64-encoded.
pub fn proof_code(path: &Path, access_token: &str, size: u64) -> io::Result<String> {
    if size == 0 {
        return Ok(String::new());
    }

    let digest = md5::compute(access_token.as_bytes());
    let offset = u64::from_be_bytes(digest.0[..8].try_into().unwrap()) % size;
    let end = (offset + 8).min(size);

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; (end - offset) as usize];
    file.read_exact(&mut buf)?;

    Ok(base64::engine::general_purpose::STANDARD.encode(buf))
}

/// Compare two local files with the job's configured method.
pub fn files_equal(
    a: &Path,
    b: &Path,
    method: CompareMethod,
    drift_secs: u64,
    sampling_rate: f64,
) -> io::Result<bool> {
    let meta_a = std::fs::metadata(a)?;
    let meta_b = std::fs::metadata(b)?;

    let same_size = meta_a.len() == meta_b.len();
    let same_time = || -> io::Result<bool> {
        let (ta, tb) = (meta_a.modified()?, meta_b.modified()?);
        let drift = match ta.duration_since(tb) {
            Ok(d) => d,
            Err(e) => e.duration(),
        };
        Ok(drift.as_secs() <= drift_secs)
    };

    match method {
        CompareMethod::Size => Ok(same_size),
        CompareMethod::DateTime => same_time(),
        CompareMethod::DateTimeAndSize => Ok(same_size && same_time()?),
        CompareMethod::Content => {
            if !same_size {
                return Ok(false);
            }
            streams_equal(&mut File::open(a)?, &mut File::open(b)?)
        }
        CompareMethod::Hash => {
            if !same_size {
                return Ok(false);
            }
            sampled_equal(a, b, meta_a.len(), sampling_rate)
        }
    }
}

/// Byte-content comparison in 4 KiB blocks.
fn streams_equal(a: &mut File, b: &mut File) -> io::Result<bool> {
    let mut buf_a = [0u8; 4096];
    let mut buf_b = [0u8; 4096];
    loop {
        let n_a = read_up_to(a, &mut buf_a)?;
        let n_b = read_up_to(b, &mut buf_b)?;
        if n_a != n_b || buf_a[..n_a] != buf_b[..n_b] {
            return Ok(false);
        }
        if n_a == 0 {
            return Ok(true);
        }
    }
}

/// Header and footer blocks always, then a sampling-rate share of the
/// interior blocks at random offsets.
fn sampled_equal(a: &Path, b: &Path, size: u64, sampling_rate: f64) -> io::Result<bool> {
    const BLOCK: u64 = 64 * KIB;

    let blocks = size.div_ceil(BLOCK);
    if blocks <= 2 {
        return streams_equal(&mut File::open(a)?, &mut File::open(b)?);
    }

    let mut picked = vec![0, blocks - 1];
    let interior: Vec<u64> = (1..blocks - 1).collect();
    let n = ((interior.len() as f64) * sampling_rate).ceil() as usize;
    picked.extend(interior.choose_multiple(&mut rand::thread_rng(), n));

    let mut file_a = File::open(a)?;
    let mut file_b = File::open(b)?;
    let mut buf_a = vec![0u8; BLOCK as usize];
    let mut buf_b = vec![0u8; BLOCK as usize];
    for block in picked {
        let offset = block * BLOCK;
        file_a.seek(SeekFrom::Start(offset))?;
        file_b.seek(SeekFrom::Start(offset))?;
        let n_a = read_up_to(&mut file_a, &mut buf_a)?;
        let n_b = read_up_to(&mut file_b, &mut buf_b)?;
        if n_a != n_b || buf_a[..n_a] != buf_b[..n_b] {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Fill as much of `buf` as the file yields; EOF is not an error.
fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn hex_upper(digest: &[u8]) -> String {
    hex::encode_upper(digest)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn file_with(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn sha1_matches_known_vector() {
        let f = file_with(b"abc");
        assert_eq!(sha1_file(f.path()).unwrap(), "A9993E364706816ABA3E25717850C26C9CD0D89D");
    }

    #[test]
    fn pre_hash_covers_first_kilobyte_only() {
        let mut content = vec![7u8; 2048];
        let f = file_with(&content);
        let probe = pre_hash(f.path()).unwrap();
        content[1500] = 9;
        let g = file_with(&content);
        assert_eq!(probe, pre_hash(g.path()).unwrap());

        content[100] = 9;
        let h = file_with(&content);
        assert_ne!(probe, pre_hash(h.path()).unwrap());
    }

    #[test]
    fn fast_hash_is_stable_and_content_sensitive() {
        let content = vec![1u8; 4096];
        let a = file_with(&content);
        let b = file_with(&content);
        assert_eq!(fast_hash(a.path(), 1).unwrap(), fast_hash(b.path(), 1).unwrap());

        let mut changed = content.clone();
        changed[0] = 2;
        let c = file_with(&changed);
        assert_ne!(fast_hash(a.path(), 1).unwrap(), fast_hash(c.path(), 1).unwrap());
    }

    #[test]
    fn proof_code_points_into_the_file() {
        let content: Vec<u8> = (0..=255).cycle().take(100_000).map(|b: u16| b as u8).collect();
        let f = file_with(&content);
        let token = "an-access-token";

        let code = proof_code(f.path(), token, content.len() as u64).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD.decode(code).unwrap();

        let digest = md5::compute(token.as_bytes());
        let offset =
            (u64::from_be_bytes(digest.0[..8].try_into().unwrap()) % content.len() as u64) as usize;
        assert_eq!(bytes, &content[offset..(offset + 8).min(content.len())]);
    }

    #[test]
    fn proof_code_of_empty_file_is_empty() {
        let f = file_with(b"");
        assert_eq!(proof_code(f.path(), "t", 0).unwrap(), "");
    }

    #[test]
    fn content_comparison_streams_blocks() {
        let a = file_with(&vec![5u8; 10_000]);
        let b = file_with(&vec![5u8; 10_000]);
        assert!(files_equal(a.path(), b.path(), CompareMethod::Content, 1, 1.0).unwrap());

        let mut other = vec![5u8; 10_000];
        other[9_999] = 6;
        let c = file_with(&other);
        assert!(!files_equal(a.path(), c.path(), CompareMethod::Content, 1, 1.0).unwrap());
    }

    #[test]
    fn sampled_comparison_always_reads_head_and_tail() {
        let base = vec![3u8; 300 * 1024];
        let a = file_with(&base);
        let mut tail_changed = base.clone();
        *tail_changed.last_mut().unwrap() = 4;
        let b = file_with(&tail_changed);
        // Tail block is always sampled, so even rate ~0 catches this.
        assert!(!files_equal(a.path(), b.path(), CompareMethod::Hash, 1, 0.01).unwrap());
    }

    #[test]
    fn size_comparison_only_checks_length() {
        let a = file_with(b"aaaa");
        let b = file_with(b"bbbb");
        assert!(files_equal(a.path(), b.path(), CompareMethod::Size, 1, 1.0).unwrap());
    }
}
