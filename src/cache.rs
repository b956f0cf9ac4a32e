use crate::client::{encode_chunk, parse_chunk};
use crate::models::ChunkResult;
use crate::partition::Chunk;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub fn chunk_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("rev")
}

/// On-disk cache of fetched chunks, one JSON file per chunk index.
///
/// Files are written once through a temp file and a rename, so a reader never
/// sees a half-written chunk. Each file records the ID range it was fetched
/// for. An empty or unparsable file, or one written for a different range
/// (the total grew, or the batch size changed), counts as absent.
#[derive(Debug)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = chunk_dir(data_dir);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create chunk directory: {:?}", dir))?;
        Ok(Self { dir })
    }

    pub fn path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("rev_{}.json", index))
    }

    pub fn has(&self, chunk: &Chunk) -> bool {
        self.read(chunk).is_some()
    }

    /// Returns `None` if the chunk is missing, empty, unreadable, or was
    /// stored for a different ID range than `chunk.ids`.
    pub fn read(&self, chunk: &Chunk) -> Option<ChunkResult> {
        let index = chunk.index;
        let path = self.path(index);
        let body = match fs::read_to_string(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(chunk = index, error = %e, "Chunk file is unreadable, will refetch");
                return None;
            }
        };

        if body.trim().is_empty() {
            warn!(chunk = index, "Chunk file is empty, will refetch");
            return None;
        }

        match parse_chunk(&body) {
            Ok((Some(stored), result)) if stored == chunk.ids => Some(result),
            Ok((stored, _)) => {
                info!(
                    chunk = index,
                    stored = ?stored,
                    current = %chunk.ids,
                    "Chunk range changed, will refetch"
                );
                None
            }
            Err(e) => {
                warn!(chunk = index, error = %e, "Chunk file is corrupt, will refetch");
                None
            }
        }
    }

    pub fn write(&self, chunk: &Chunk, result: &ChunkResult) -> io::Result<()> {
        let path = self.path(chunk.index);
        let tmp_path = path.with_extension("json.tmp");

        let bytes = encode_chunk(chunk.ids, result)?;
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(&bytes)?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        debug!(chunk = chunk.index, ids = %chunk.ids, revisions = result.revision_count(), "Chunk saved");
        Ok(())
    }
}
