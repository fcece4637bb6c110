//! Producer-side chunk store.
//!
//! Shared files are split into fixed-size chunks, each stored by its BLAKE3
//! hash in a two-level directory:
//!   {root}/objects/{hash[0..2]}/{full_hash}
//!
//! A JSON manifest per file lists the chunk hashes in order:
//!   {root}/manifests/{sha256 of the file}.json
//!
//! Objects are immutable. If the hash exists, the content is correct.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use orca_core::crypto;
use serde::{Deserialize, Serialize};

use crate::transfer::TransferError;

/// Everything a producer needs to serve one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    /// SHA-256 hex of the whole file. This is the market key suffix.
    pub file_hash: String,
    pub file_name: String,
    pub size: u64,
    /// BLAKE3 hex per chunk, in file order.
    pub chunk_hashes: Vec<String>,
}

impl FileManifest {
    pub fn chunk_count(&self) -> u64 {
        self.chunk_hashes.len() as u64
    }
}

#[derive(Clone)]
pub struct ChunkStore {
    root: PathBuf,
    chunk_size: usize,
    manifests: Arc<DashMap<String, FileManifest>>,
}

impl ChunkStore {
    /// Open (or create) a store at `root`, loading any manifests already there.
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))
            .with_context(|| format!("failed to create chunk store: {}", root.display()))?;
        fs::create_dir_all(root.join("manifests"))
            .with_context(|| format!("failed to create chunk store: {}", root.display()))?;

        let store = Self {
            root,
            chunk_size: chunk_size.max(1),
            manifests: Arc::new(DashMap::new()),
        };
        store.load_manifests()?;
        Ok(store)
    }

    fn load_manifests(&self) -> Result<()> {
        let dir = self.root.join("manifests");
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .flatten()
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read manifest {}", path.display()))?;
            match serde_json::from_str::<FileManifest>(&text) {
                Ok(m) => {
                    self.manifests.insert(m.file_hash.clone(), m);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable manifest");
                }
            }
        }
        Ok(())
    }

    /// Split `path` into chunks and record its manifest. Re-importing is a no-op.
    ///
    /// An empty file becomes a single empty chunk so it can still be served.
    pub fn import(&self, path: &Path) -> Result<FileManifest> {
        let file_hash = crypto::file_hash(path)
            .with_context(|| format!("failed to hash {}", path.display()))?;
        if let Some(existing) = self.manifests.get(&file_hash) {
            return Ok(existing.value().clone());
        }

        let mut file =
            fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut chunk_hashes = Vec::new();
        let mut size = 0u64;
        loop {
            let mut buf = Vec::with_capacity(self.chunk_size);
            (&mut file)
                .take(self.chunk_size as u64)
                .read_to_end(&mut buf)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if buf.is_empty() && !chunk_hashes.is_empty() {
                break;
            }
            let hash = crypto::chunk_hash(&buf);
            self.put(&hash, &buf)?;
            chunk_hashes.push(hex::encode(hash));
            size += buf.len() as u64;
            if buf.len() < self.chunk_size {
                break;
            }
        }

        let manifest = FileManifest {
            file_hash: file_hash.clone(),
            file_name: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string(),
            size,
            chunk_hashes,
        };
        self.write_manifest(&manifest)?;
        self.manifests.insert(file_hash, manifest.clone());

        tracing::info!(
            file = %manifest.file_name,
            file_hash = %manifest.file_hash,
            chunks = manifest.chunk_count(),
            "file imported"
        );
        Ok(manifest)
    }

    /// Import every regular file directly inside `dir`. Unreadable files are skipped.
    pub fn import_dir(&self, dir: &Path) -> Result<Vec<FileManifest>> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let mut imported = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .flatten()
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match self.import(&path) {
                Ok(m) => imported.push(m),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "import failed"),
            }
        }
        Ok(imported)
    }

    pub fn manifest(&self, file_hash: &str) -> Option<FileManifest> {
        self.manifests.get(file_hash).map(|m| m.value().clone())
    }

    /// All shared files, sorted by name.
    pub fn manifests(&self) -> Vec<FileManifest> {
        let mut all: Vec<_> = self.manifests.iter().map(|m| m.value().clone()).collect();
        all.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        all
    }

    /// Chunk `index` of a file plus the file's chunk count.
    pub fn chunk(&self, file_hash: &str, index: u64) -> Result<(Bytes, u64), TransferError> {
        let manifest = self
            .manifests
            .get(file_hash)
            .map(|m| m.value().clone())
            .ok_or_else(|| TransferError::UnknownFile(file_hash.to_string()))?;
        let max = manifest.chunk_count();
        let hex_hash = usize::try_from(index)
            .ok()
            .and_then(|i| manifest.chunk_hashes.get(i))
            .ok_or(TransferError::ChunkIndexOutOfRange { index, max })?;

        let mut hash = [0u8; 32];
        hex::decode_to_slice(hex_hash, &mut hash).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad chunk hash in manifest")
        })?;
        let data = self.get(&hash)?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("chunk {hex_hash} missing from store"),
            )
        })?;
        if crypto::chunk_hash(&data) != hash {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("chunk {hex_hash} failed hash check"),
            )
            .into());
        }
        Ok((data, max))
    }

    /// [`chunk`](Self::chunk) on the blocking pool, for callers on the runtime.
    pub async fn load_chunk(
        &self,
        file_hash: &str,
        index: u64,
    ) -> Result<(Bytes, u64), TransferError> {
        let store = self.clone();
        let file_hash = file_hash.to_string();
        tokio::task::spawn_blocking(move || store.chunk(&file_hash, index))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
    }

    // ── Objects ───────────────────────────────────────────────────────────────

    pub fn has(&self, hash: &[u8; 32]) -> bool {
        self.object_path(hash).exists()
    }

    fn get(&self, hash: &[u8; 32]) -> std::io::Result<Option<Bytes>> {
        match fs::read(self.object_path(hash)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Store one object. Atomic: write a temp file, then rename.
    fn put(&self, hash: &[u8; 32], data: &[u8]) -> Result<()> {
        let path = self.object_path(hash);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store dir: {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(data).context("failed to write chunk data")?;
            file.sync_all().context("failed to sync chunk to disk")?;
        }
        fs::rename(&tmp_path, &path).with_context(|| {
            format!("failed to rename {} to {}", tmp_path.display(), path.display())
        })?;
        tracing::trace!(hash = hex::encode(hash), "chunk stored");
        Ok(())
    }

    fn write_manifest(&self, manifest: &FileManifest) -> Result<()> {
        let path = self
            .root
            .join("manifests")
            .join(format!("{}.json", manifest.file_hash));
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(manifest)?)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename manifest into {}", path.display()))?;
        Ok(())
    }

    fn object_path(&self, hash: &[u8; 32]) -> PathBuf {
        let hex = hex::encode(hash);
        self.root.join("objects").join(&hex[0..2]).join(&hex)
    }
}
