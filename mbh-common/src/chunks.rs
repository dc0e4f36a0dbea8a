//! Chunk planning from baseline coordinates.
//!
//! Baseline CSV columns: `biome_id,x,z,surface_y,is_block_coord`. Each
//! coordinate maps to the chunk containing it (`block >> 4`); a buffer of
//! `b` adds the surrounding `(2b+1)²` neighbourhood. The result is written
//! as sorted `cx,cz` lines for the server's batch forceload command.

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{HarnessError, HarnessResult};

/// Largest buffer radius accepted.
pub const MAX_BUFFER_SIZE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk containing block coordinates `(x, z)`.
    pub fn containing_block(x: i32, z: i32) -> Self {
        Self::new(x >> 4, z >> 4)
    }
}

/// One row of a baseline file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineCoordinate {
    pub biome_id: String,
    pub x: i32,
    pub z: i32,
    pub surface_y: i32,
    /// When false, `x`/`z` are already chunk coordinates.
    pub is_block_coord: bool,
}

impl BaselineCoordinate {
    pub fn chunk(&self) -> ChunkPos {
        if self.is_block_coord {
            ChunkPos::containing_block(self.x, self.z)
        } else {
            ChunkPos::new(self.x, self.z)
        }
    }
}

#[derive(Debug, Deserialize)]
struct BaselineRow {
    biome_id: String,
    x: i32,
    z: i32,
    surface_y: i32,
    #[serde(default)]
    is_block_coord: Option<String>,
}

impl From<BaselineRow> for BaselineCoordinate {
    fn from(row: BaselineRow) -> Self {
        let is_block_coord = row
            .is_block_coord
            .map(|v| !v.trim().eq_ignore_ascii_case("false"))
            .unwrap_or(true);
        Self {
            biome_id: row.biome_id.trim().to_string(),
            x: row.x,
            z: row.z,
            surface_y: row.surface_y,
            is_block_coord,
        }
    }
}

/// Chunks covering `coords`, each expanded by `buffer` chunks on every side.
pub fn chunks_for(coords: &[BaselineCoordinate], buffer: u32) -> BTreeSet<ChunkPos> {
    let radius = buffer.min(MAX_BUFFER_SIZE) as i32;
    let mut chunks = BTreeSet::new();
    for coord in coords {
        let center = coord.chunk();
        for dx in -radius..=radius {
            for dz in -radius..=radius {
                chunks.insert(ChunkPos::new(center.x + dx, center.z + dz));
            }
        }
    }
    chunks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub min_x: i32,
    pub min_z: i32,
    pub max_x: i32,
    pub max_z: i32,
}

/// Summary recorded in accuracy results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkStats {
    pub coordinates: usize,
    pub chunks: usize,
    pub buffer_size: u32,
    pub bounding_box: Option<BoundingBox>,
    pub unique_biomes: usize,
}

/// Loads a baseline, computes its chunk set and writes the chunk list.
#[derive(Debug, Default)]
pub struct ChunkPlanner {
    coordinates: Vec<BaselineCoordinate>,
    chunks: BTreeSet<ChunkPos>,
    buffer_size: u32,
}

impl ChunkPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a planner from coordinates already in memory.
    pub fn from_coordinates(coordinates: Vec<BaselineCoordinate>) -> Self {
        Self {
            coordinates,
            ..Self::default()
        }
    }

    /// Read a baseline CSV. Malformed rows are skipped with a warning.
    pub fn load_baseline(&mut self, csv_path: &Path) -> HarnessResult<usize> {
        info!(path = %csv_path.display(), "Loading baseline");
        if !csv_path.is_file() {
            return Err(HarnessError::Baseline(format!(
                "Baseline file not found: {}",
                csv_path.display()
            )));
        }

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(csv_path)
            .map_err(|e| HarnessError::Baseline(format!("Failed to read baseline file: {e}")))?;

        self.coordinates.clear();
        for (index, row) in reader.deserialize::<BaselineRow>().enumerate() {
            match row {
                Ok(row) => self.coordinates.push(row.into()),
                // +2: header line and 1-based numbering
                Err(e) => warn!(row = index + 2, error = %e, "Skipping invalid baseline row"),
            }
        }
        info!(count = self.coordinates.len(), "Loaded baseline coordinates");
        Ok(self.coordinates.len())
    }

    /// Compute the deduplicated chunk set for `buffer_size` (0, 1 or 2).
    pub fn calculate_chunks(&mut self, buffer_size: u32) -> HarnessResult<usize> {
        if self.coordinates.is_empty() {
            return Err(HarnessError::ChunkCalculation(
                "No coordinates loaded".to_string(),
            ));
        }
        if buffer_size > MAX_BUFFER_SIZE {
            return Err(HarnessError::ChunkCalculation(format!(
                "buffer size must be at most {MAX_BUFFER_SIZE}, got {buffer_size}"
            )));
        }
        self.buffer_size = buffer_size;
        self.chunks = chunks_for(&self.coordinates, buffer_size);
        info!(
            chunks = self.chunks.len(),
            buffer = buffer_size,
            coords = self.coordinates.len(),
            "Calculated unique chunks"
        );
        Ok(self.chunks.len())
    }

    /// Write sorted `cx,cz` lines to `output_path`.
    pub fn write_chunk_file(&self, output_path: &Path) -> HarnessResult<PathBuf> {
        if self.chunks.is_empty() {
            return Err(HarnessError::ChunkCalculation(
                "No chunks calculated".to_string(),
            ));
        }
        write_chunk_list(output_path, self.chunks.iter().copied())?;
        info!(count = self.chunks.len(), path = %output_path.display(), "Wrote chunk file");
        Ok(output_path.to_path_buf())
    }

    pub fn coordinates(&self) -> &[BaselineCoordinate] {
        &self.coordinates
    }

    pub fn chunks(&self) -> &BTreeSet<ChunkPos> {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let first = self.coordinates.first()?;
        let init = BoundingBox {
            min_x: first.x,
            min_z: first.z,
            max_x: first.x,
            max_z: first.z,
        };
        Some(self.coordinates.iter().fold(init, |b, c| BoundingBox {
            min_x: b.min_x.min(c.x),
            min_z: b.min_z.min(c.z),
            max_x: b.max_x.max(c.x),
            max_z: b.max_z.max(c.z),
        }))
    }

    pub fn stats(&self) -> ChunkStats {
        let biomes: HashSet<&str> = self.coordinates.iter().map(|c| c.biome_id.as_str()).collect();
        ChunkStats {
            coordinates: self.coordinates.len(),
            chunks: self.chunks.len(),
            buffer_size: self.buffer_size,
            bounding_box: self.bounding_box(),
            unique_biomes: biomes.len(),
        }
    }
}

/// Write chunks as headerless `cx,cz` lines.
pub fn write_chunk_list(path: &Path, chunks: impl IntoIterator<Item = ChunkPos>) -> HarnessResult<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| HarnessError::file(dir, e))?;
    }
    let file = File::create(path).map_err(|e| HarnessError::file(path, e))?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    for chunk in chunks {
        writer
            .write_record([chunk.x.to_string(), chunk.z.to_string()])
            .map_err(|e| HarnessError::ChunkCalculation(format!("Failed to write chunk file: {e}")))?;
    }
    writer.flush().map_err(|e| HarnessError::file(path, e))?;
    Ok(())
}

/// Roughly square grid of `count` chunks centred on the origin, row by row.
pub fn spawn_grid(count: usize) -> Vec<ChunkPos> {
    let side = (count as f64).sqrt() as i32 + 1;
    let half = side / 2;
    (-half..=half)
        .flat_map(|x| (-half..=half).map(move |z| ChunkPos::new(x, z)))
        .take(count)
        .collect()
}
