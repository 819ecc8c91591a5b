//! iPXE binary set and per-serve patching.
//!
//! Binaries are read from a directory once at startup and are immutable
//! afterwards. Each iPXE build reserves a fixed-length region filled
//! with a known marker string; patching overlays the configured script
//! fragment onto that region, zero-padded to its full length, so the
//! patched binary always has the same size as the original.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, warn};

/// Marker the upstream iPXE build embeds at the patch region. The
/// region is located by searching for this sequence, never by offset.
pub const PATCH_MAGIC: &[u8] =
    b"464vn90e7rbj08xbwdjejmdf4it17c5zfzjyfhthbh19eij201hjgit021bmpdb9ctrc87x2ymc8e7icu4ffi15x1hah9iyaiz38ckyap8hwx2vt5rm44ixv4hprdtj1eufcd7cwpjpqr23a8bkb3c0i3w78fjt1scpfpbhmilhvv5gcut31x99vza1xk96apgypsj3r95qgcvmjdlxz9dhczr1a2es2uhc7l5e8l21xwzxhzzqri5dwxq1rpjnbj";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PatchError {
    #[error("patch region marker not found in binary")]
    MarkerNotFound,

    #[error("patch is {len} bytes, the patch region holds {max}")]
    PatchTooLong { len: usize, max: usize },
}

/// Overlay `patch` onto the marker region of `content`.
///
/// The output has exactly the length of the input. An empty patch
/// returns the input unchanged.
pub fn patch_binary(content: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError> {
    if patch.is_empty() {
        return Ok(content.to_vec());
    }

    if patch.len() > PATCH_MAGIC.len() {
        return Err(PatchError::PatchTooLong {
            len: patch.len(),
            max: PATCH_MAGIC.len(),
        });
    }

    let offset = find_marker(content).ok_or(PatchError::MarkerNotFound)?;

    let mut patched = content.to_vec();
    let region = &mut patched[offset..offset + PATCH_MAGIC.len()];
    region.fill(0);
    region[..patch.len()].copy_from_slice(patch);

    Ok(patched)
}

fn find_marker(content: &[u8]) -> Option<usize> {
    if content.len() < PATCH_MAGIC.len() {
        return None;
    }
    content
        .windows(PATCH_MAGIC.len())
        .position(|window| window == PATCH_MAGIC)
}

/// The in-memory binary set, shared by the TFTP and HTTP servers.
pub struct IpxeBinaries {
    files: HashMap<String, Arc<Vec<u8>>>,
    patch: Vec<u8>,
    /// Patched copies, filled in at first serve of each file.
    patched: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl IpxeBinaries {
    /// Load every regular file in `dir` as a servable binary.
    pub fn load_dir(dir: impl AsRef<Path>, patch: impl Into<Vec<u8>>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files = HashMap::new();

        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read iPXE directory {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let content = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            files.insert(name.to_string(), Arc::new(content));
        }

        info!(
            "loaded {} iPXE binaries from {}",
            files.len(),
            dir.display()
        );

        Ok(Self {
            files,
            patch: patch.into(),
            patched: RwLock::new(HashMap::new()),
        })
    }

    /// Build from in-memory content.
    pub fn from_map(files: HashMap<String, Vec<u8>>, patch: impl Into<Vec<u8>>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(name, content)| (name, Arc::new(content)))
                .collect(),
            patch: patch.into(),
            patched: RwLock::new(HashMap::new()),
        }
    }

    /// The original, unpatched bytes.
    pub fn get_unpatched(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        self.files.get(name).cloned()
    }

    /// The servable bytes: patched when a patch is configured, cached
    /// after the first serve. A binary without the marker region is
    /// served unpatched.
    pub fn get(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        let original = self.files.get(name)?;

        if self.patch.is_empty() {
            return Some(Arc::clone(original));
        }

        if let Some(cached) = self.patched.read().expect("patch cache lock").get(name) {
            return Some(Arc::clone(cached));
        }

        let served = match patch_binary(original, &self.patch) {
            Ok(patched) => Arc::new(patched),
            Err(e) => {
                warn!("not patching {}: {}", name, e);
                Arc::clone(original)
            }
        };

        self.patched
            .write()
            .expect("patch cache lock")
            .insert(name.to_string(), Arc::clone(&served));

        Some(served)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }
}
