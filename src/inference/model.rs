//! Model file resolution
//!
//! Finds the GGUF weights for a model id and checks their header before the
//! llama backend hands them to the runtime.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

/// Errors that can occur while locating or validating model files
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,

    #[error("GGUF weights not found for {model_id} under {}", .searched.display())]
    NotFound { model_id: String, searched: PathBuf },
}

/// Fields of a GGUF file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, ModelError> {
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        let magic = u32_at(0);
        if magic != GGUF_MAGIC {
            return Err(ModelError::InvalidMagic(magic));
        }

        // GGUF v2 and v3 are supported
        let version = u32_at(4);
        if !(2..=3).contains(&version) {
            return Err(ModelError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            tensor_count: u64_at(8),
            metadata_kv_count: u64_at(16),
        })
    }
}

/// Reads and checks the header of a GGUF file.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() < HEADER_LEN as u64 {
        return Err(ModelError::FileTooSmall);
    }
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)?;
    GgufHeader::parse(&header)
}

fn has_gguf_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

/// Locates the weights for `model_id`.
///
/// `model_id` may be a direct path to a `.gguf` file. Otherwise the hub cache
/// layout under `cache_dir` is searched (`models--org--name/snapshots/*/`,
/// then a flat `org--name/` folder). The first valid file in name order wins.
pub fn resolve_model_file(model_id: &str, cache_dir: &Path) -> Result<PathBuf, ModelError> {
    let direct = Path::new(model_id);
    if has_gguf_extension(direct) && direct.is_file() {
        validate_gguf(direct)?;
        return Ok(direct.to_path_buf());
    }

    let flat = model_id.replace('/', "--");
    let repo_dir = cache_dir.join(format!("models--{}", flat));
    let mut search_dirs: Vec<PathBuf> = Vec::new();
    if let Ok(entries) = fs::read_dir(repo_dir.join("snapshots")) {
        let mut snapshots: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        snapshots.sort();
        search_dirs.extend(snapshots);
    }
    search_dirs.push(cache_dir.join(&flat));

    for dir in &search_dirs {
        for candidate in gguf_files_in(dir) {
            match validate_gguf(&candidate) {
                Ok(header) => {
                    tracing::info!(
                        "Resolved {} to {} (GGUF v{}, {} tensors)",
                        model_id,
                        candidate.display(),
                        header.version,
                        header.tensor_count
                    );
                    return Ok(candidate);
                }
                Err(e) => tracing::warn!("Skipping {}: {}", candidate.display(), e),
            }
        }
    }

    Err(ModelError::NotFound {
        model_id: model_id.to_string(),
        searched: cache_dir.to_path_buf(),
    })
}

fn gguf_files_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && has_gguf_extension(p))
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_header(path: &Path, magic: u32, version: u32) {
        let mut file = File::create(path).unwrap();
        file.write_all(&magic.to_le_bytes()).unwrap();
        file.write_all(&version.to_le_bytes()).unwrap();
        file.write_all(&10u64.to_le_bytes()).unwrap();
        file.write_all(&5u64.to_le_bytes()).unwrap();
        file.flush().unwrap();
    }

    #[test]
    fn test_validate_gguf_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.gguf");
        write_header(&path, GGUF_MAGIC, 3);

        let header = validate_gguf(&path).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 10);
        assert_eq!(header.metadata_kv_count, 5);
    }

    #[test]
    fn test_validate_gguf_rejects_bad_headers() {
        let dir = TempDir::new().unwrap();

        let bad_magic = dir.path().join("bad.gguf");
        write_header(&bad_magic, 0xDEADBEEF, 3);
        assert!(matches!(validate_gguf(&bad_magic), Err(ModelError::InvalidMagic(0xDEADBEEF))));

        let old = dir.path().join("old.gguf");
        write_header(&old, GGUF_MAGIC, 1);
        assert!(matches!(validate_gguf(&old), Err(ModelError::UnsupportedVersion(1))));

        let short = dir.path().join("short.gguf");
        fs::write(&short, GGUF_MAGIC.to_le_bytes()).unwrap();
        assert!(matches!(validate_gguf(&short), Err(ModelError::FileTooSmall)));
    }

    #[test]
    fn test_resolve_direct_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.gguf");
        write_header(&path, GGUF_MAGIC, 3);

        let resolved = resolve_model_file(path.to_str().unwrap(), Path::new("/nonexistent")).unwrap();
        assert_eq!(resolved, path);
    }

    #[test]
    fn test_resolve_from_hub_cache_skips_invalid() {
        let dir = TempDir::new().unwrap();
        let snapshot = dir.path().join("models--Org--fin-8b/snapshots/abc123");
        fs::create_dir_all(&snapshot).unwrap();
        write_header(&snapshot.join("a-broken.gguf"), 0x0, 3);
        write_header(&snapshot.join("b-q4.gguf"), GGUF_MAGIC, 3);
        fs::write(snapshot.join("config.json"), "{}").unwrap();

        let resolved = resolve_model_file("Org/fin-8b", dir.path()).unwrap();
        assert_eq!(resolved, snapshot.join("b-q4.gguf"));
    }

    #[test]
    fn test_resolve_missing_model() {
        let dir = TempDir::new().unwrap();
        let err = resolve_model_file("Org/absent", dir.path()).unwrap_err();
        assert!(matches!(err, ModelError::NotFound { .. }));
        // Classified as a download failure by the lifecycle
        assert!(err.to_string().contains("not found"));
    }
}
