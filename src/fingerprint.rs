use crate::config::FingerprintMode;
use haplocall_protocol::Fingerprint;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

pub const SAMPLED_ALGORITHM: &str = "sha1-sampled";
pub const FULL_ALGORITHM: &str = "sha1-full";

const READ_CHUNK: usize = 64 * 1024;

/// Fingerprints an alignment file. Sampled mode reads at most two windows,
/// so it stays cheap on whole-genome BAM/CRAM files.
pub fn fingerprint_file(path: &Path, mode: FingerprintMode) -> io::Result<Fingerprint> {
    let mut file = File::open(path)?;
    let size_bytes = file.metadata()?.len();
    let mut hasher = Sha1::new();
    hasher.update(size_bytes.to_le_bytes());

    let algorithm = match mode {
        FingerprintMode::Full => {
            hash_reader(&mut hasher, BufReader::new(&mut file))?;
            FULL_ALGORITHM.to_string()
        }
        FingerprintMode::Sampled { window_bytes } => {
            hash_reader(&mut hasher, file.by_ref().take(window_bytes))?;
            if size_bytes > window_bytes {
                // tail window never re-reads bytes already hashed from the head
                let tail_start = size_bytes.saturating_sub(window_bytes).max(window_bytes);
                file.seek(SeekFrom::Start(tail_start))?;
                hash_reader(&mut hasher, file.by_ref().take(window_bytes))?;
            }
            format!("{SAMPLED_ALGORITHM}-{window_bytes}")
        }
    };

    Ok(Fingerprint {
        algorithm,
        size_bytes,
        digest: to_hex(&hasher.finalize()),
    })
}

fn hash_reader<R: Read>(hasher: &mut Sha1, mut reader: R) -> io::Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_fingerprint_is_stable_for_unchanged_file() {
        let td = tempdir().unwrap();
        let path = td.path().join("a.bam");
        fs::write(&path, b"BAM\x01 some reads").unwrap();
        let first = fingerprint_file(&path, FingerprintMode::default()).unwrap();
        let second = fingerprint_file(&path, FingerprintMode::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size_bytes, 15);
        assert_eq!(first.digest.len(), 40);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let td = tempdir().unwrap();
        let path = td.path().join("a.bam");
        fs::write(&path, b"first version").unwrap();
        let before = fingerprint_file(&path, FingerprintMode::Full).unwrap();
        fs::write(&path, b"other version").unwrap();
        let after = fingerprint_file(&path, FingerprintMode::Full).unwrap();
        assert_eq!(before.size_bytes, after.size_bytes);
        assert_ne!(before, after);
    }

    #[test]
    fn test_sampled_mode_sees_head_and_tail_changes() {
        let td = tempdir().unwrap();
        let path = td.path().join("big.bam");
        let mode = FingerprintMode::Sampled { window_bytes: 8 };
        let mut data = vec![b'a'; 64];
        fs::write(&path, &data).unwrap();
        let base = fingerprint_file(&path, mode).unwrap();

        data[63] = b'z';
        fs::write(&path, &data).unwrap();
        let tail_changed = fingerprint_file(&path, mode).unwrap();
        assert_ne!(base, tail_changed);

        data[63] = b'a';
        data[30] = b'z';
        fs::write(&path, &data).unwrap();
        let middle_changed = fingerprint_file(&path, mode).unwrap();
        assert_eq!(base, middle_changed);
    }

    #[test]
    fn test_mode_is_part_of_identity() {
        let td = tempdir().unwrap();
        let path = td.path().join("a.bam");
        fs::write(&path, b"reads").unwrap();
        let sampled = fingerprint_file(&path, FingerprintMode::default()).unwrap();
        let full = fingerprint_file(&path, FingerprintMode::Full).unwrap();
        assert_ne!(sampled, full);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let td = tempdir().unwrap();
        assert!(fingerprint_file(&td.path().join("nope.bam"), FingerprintMode::Full).is_err());
    }
}
