use crate::error::CoreResult;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// SHA-256 of the bitmap bytes, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Longest hash accepted from a rendering service.
const MAX_HASH_LEN: usize = 128;

/// Whether a hash reported by a rendering service is safe to keep and to
/// embed in a file name: lowercase hex, bounded length.
pub fn is_valid_hash(hash: &str) -> bool {
    !hash.is_empty()
        && hash.len() <= MAX_HASH_LEN
        && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// The reported hash when it is well formed, otherwise our own.
pub fn accept_hash(reported: Option<&str>, bytes: &[u8]) -> String {
    match reported.map(str::trim) {
        Some(hash) if is_valid_hash(hash) => hash.to_string(),
        Some(hash) if !hash.is_empty() => {
            tracing::warn!("Ignoring malformed content hash from the rendering service");
            content_hash(bytes)
        }
        _ => content_hash(bytes),
    }
}

/// Extension sniffed from the bitmap header; unknown formats keep `.bin`.
pub fn sniff_extension(bytes: &[u8]) -> &'static str {
    infer::get(bytes).map(|kind| kind.extension()).unwrap_or("bin")
}

/// Rendered bitmaps on local disk. Rows in `rendered_content` hold the
/// file name relative to `root`.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// File names embed the hash, so a new bitmap never overwrites the one
    /// a device may still be downloading.
    pub fn file_name(instance_id: i32, device_id: Option<i32>, hash: &str, bytes: &[u8]) -> String {
        let target = device_id
            .map(|d| d.to_string())
            .unwrap_or_else(|| "any".to_string());
        let short: String = hash
            .chars()
            .filter(char::is_ascii_hexdigit)
            .take(16)
            .collect();
        format!("{}_{}_{}.{}", instance_id, target, short, sniff_extension(bytes))
    }

    pub fn write(
        &self,
        instance_id: i32,
        device_id: Option<i32>,
        hash: &str,
        bytes: &[u8],
    ) -> CoreResult<String> {
        self.ensure_root()?;
        let name = Self::file_name(instance_id, device_id, hash, bytes);
        let final_path = self.root.join(&name);
        let temp_path = self.root.join(format!(".{}.tmp", name));
        std::fs::write(&temp_path, bytes)?;
        std::fs::rename(&temp_path, &final_path)?;
        Ok(name)
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn read(&self, name: &str) -> CoreResult<Vec<u8>> {
        Ok(std::fs::read(self.path_for(name))?)
    }

    /// Remove a stored bitmap. Missing files are not an error.
    pub fn delete(&self, name: &str) -> CoreResult<bool> {
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete files in the store that are not in `referenced` and were
    /// last modified at least `min_age` ago. Temp files from interrupted
    /// writes are removed as well.
    pub fn remove_unreferenced(
        &self,
        referenced: &HashSet<String>,
        min_age: Duration,
    ) -> CoreResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut removed = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if referenced.contains(&name) {
                continue;
            }
            let age = entry
                .metadata()?
                .modified()?
                .elapsed()
                .unwrap_or(Duration::ZERO);
            if age < min_age {
                continue;
            }
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!("Failed to delete orphaned bitmap {}: {}", name, e);
                continue;
            }
            removed.push(name);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    #[test]
    fn test_extension_is_sniffed() {
        assert_eq!(sniff_extension(PNG_HEADER), "png");
        assert_eq!(sniff_extension(b"BM\x00\x00"), "bmp");
        assert_eq!(sniff_extension(b"raw bits"), "bin");
    }

    #[test]
    fn test_write_and_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path().join("rendered"));

        let hash = content_hash(PNG_HEADER);
        assert_eq!(hash.len(), 64);
        let kept = store.write(3, Some(1), &hash, PNG_HEADER).unwrap();
        assert!(kept.starts_with("3_1_") && kept.ends_with(".png"));
        let orphan = store.write(4, None, &content_hash(b"x"), b"x").unwrap();
        assert!(orphan.starts_with("4_any_"));

        let referenced: HashSet<String> = [kept.clone()].into_iter().collect();
        assert!(store.remove_unreferenced(&referenced, Duration::from_secs(3600)).unwrap().is_empty());
        assert_eq!(
            store.remove_unreferenced(&referenced, Duration::ZERO).unwrap(),
            vec![orphan.clone()]
        );
        assert_eq!(store.read(&kept).unwrap(), PNG_HEADER);
        assert!(!store.delete(&orphan).unwrap());
    }

    #[test]
    fn test_untrusted_hashes_are_replaced() {
        let bytes = b"BM bits";
        let own = content_hash(bytes);
        assert_eq!(accept_hash(Some("abc123"), bytes), "abc123");
        assert_eq!(accept_hash(Some(" abc123 "), bytes), "abc123");
        assert_eq!(accept_hash(None, bytes), own);
        assert_eq!(accept_hash(Some(""), bytes), own);
        assert_eq!(accept_hash(Some("ab/cd"), bytes), own);
        assert_eq!(accept_hash(Some("aéééééééééééé"), bytes), own);
        assert_eq!(accept_hash(Some("ABCDEF"), bytes), own);
        assert_eq!(accept_hash(Some("a".repeat(200).as_str()), bytes), own);

        let name = ImageStore::file_name(1, None, "aé/../bé", bytes);
        assert_eq!(name, "1_any_ab.bmp");
    }
}
