use crate::error::{Result, StoreError};
use crate::ingest::SourceBatch;
use crate::predictions::{PredictionBatch, PredictionOutcome};
use crate::types::{SourceFile, TileRecord, TileRef};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Version 2 added the id high-water marks; version 1 snapshots still load.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 2;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    schema_version: u32,
    #[serde(default)]
    next_source_id: u64,
    #[serde(default)]
    next_tile_id: u64,
    source_files: Vec<SourceFile>,
    tiles: Vec<TileRecord>,
}

/// Immutable snapshot of every ingested tile. Shared behind an `Arc`; all
/// reads are lock-free.
#[derive(Debug)]
pub struct TileStore {
    sources: Vec<SourceFile>,
    tiles: Vec<TileRecord>,
    source_index: HashMap<u64, usize>,
    filename_index: HashMap<String, u64>,
    tiles_by_source: HashMap<u64, Vec<usize>>,
    coords: HashMap<(u64, u32, u32), usize>,
    // Ids are never reused, even after the newest source file is removed.
    next_source_id: u64,
    next_tile_id: u64,
}

impl TileStore {
    pub fn empty() -> Self {
        Self {
            sources: Vec::new(),
            tiles: Vec::new(),
            source_index: HashMap::new(),
            filename_index: HashMap::new(),
            tiles_by_source: HashMap::new(),
            coords: HashMap::new(),
            next_source_id: 1,
            next_tile_id: 1,
        }
    }

    /// Build the indexes over a set of records, rejecting anything that
    /// would break identity invariants.
    pub fn from_parts(mut sources: Vec<SourceFile>, mut tiles: Vec<TileRecord>) -> Result<Self> {
        sources.sort_by_key(|s| s.id);
        tiles.sort_by_key(|t| t.id);

        let mut source_index = HashMap::with_capacity(sources.len());
        let mut filename_index = HashMap::with_capacity(sources.len());
        for (idx, source) in sources.iter().enumerate() {
            if source_index.insert(source.id, idx).is_some() {
                return Err(StoreError::InconsistentSnapshot(format!(
                    "duplicate source file id {}",
                    source.id
                )));
            }
            if filename_index
                .insert(source.json_filename.clone(), source.id)
                .is_some()
            {
                return Err(StoreError::InconsistentSnapshot(format!(
                    "duplicate source filename {}",
                    source.json_filename
                )));
            }
        }

        let mut tiles_by_source: HashMap<u64, Vec<usize>> = HashMap::new();
        let mut coords = HashMap::with_capacity(tiles.len());
        let mut seen_ids = HashSet::with_capacity(tiles.len());
        for (idx, tile) in tiles.iter().enumerate() {
            if !seen_ids.insert(tile.id) {
                return Err(StoreError::InconsistentSnapshot(format!(
                    "duplicate tile id {}",
                    tile.id
                )));
            }
            let Some(&source_idx) = source_index.get(&tile.source_file_id) else {
                return Err(StoreError::InconsistentSnapshot(format!(
                    "tile {} references missing source file {}",
                    tile.id, tile.source_file_id
                )));
            };
            if coords
                .insert((tile.source_file_id, tile.col, tile.row), idx)
                .is_some()
            {
                return Err(StoreError::DuplicateTile {
                    json_filename: sources[source_idx].json_filename.clone(),
                    col: tile.col,
                    row: tile.row,
                });
            }
            tiles_by_source
                .entry(tile.source_file_id)
                .or_default()
                .push(idx);
        }

        for source in &mut sources {
            source.tile_count = tiles_by_source.get(&source.id).map_or(0, Vec::len);
        }

        let next_source_id = sources.iter().map(|s| s.id).max().map_or(1, |id| id + 1);
        let next_tile_id = tiles.iter().map(|t| t.id).max().map_or(1, |id| id + 1);
        Ok(Self {
            sources,
            tiles,
            source_index,
            filename_index,
            tiles_by_source,
            coords,
            next_source_id,
            next_tile_id,
        })
    }

    /// Raise the next ids to at least the given marks.
    fn with_watermarks(mut self, next_source_id: u64, next_tile_id: u64) -> Self {
        self.next_source_id = self.next_source_id.max(next_source_id);
        self.next_tile_id = self.next_tile_id.max(next_tile_id);
        self
    }

    /// Number of tiles.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Source files ordered by id.
    pub fn source_files(&self) -> &[SourceFile] {
        &self.sources
    }

    /// Source files ordered by filename, the order every report uses.
    pub fn source_files_by_name(&self) -> Vec<&SourceFile> {
        let mut files: Vec<&SourceFile> = self.sources.iter().collect();
        files.sort_by(|a, b| a.json_filename.cmp(&b.json_filename));
        files
    }

    pub fn source_file(&self, id: u64) -> Option<&SourceFile> {
        self.source_index.get(&id).map(|&idx| &self.sources[idx])
    }

    pub fn source_by_filename(&self, json_filename: &str) -> Option<&SourceFile> {
        self.filename_index
            .get(json_filename)
            .and_then(|id| self.source_file(*id))
    }

    /// All tiles in ascending id order.
    pub fn tiles(&self) -> impl ExactSizeIterator<Item = TileRef<'_>> + '_ {
        self.tiles.iter().map(move |record| self.join(record))
    }

    pub fn tile(&self, idx: usize) -> Option<TileRef<'_>> {
        self.tiles.get(idx).map(|record| self.join(record))
    }

    /// Tiles of one source file in ascending id order. Empty for unknown ids.
    pub fn source_tiles(&self, source_file_id: u64) -> impl Iterator<Item = TileRef<'_>> + '_ {
        self.tiles_by_source
            .get(&source_file_id)
            .into_iter()
            .flatten()
            .map(move |&idx| self.join(&self.tiles[idx]))
    }

    pub fn tile_at(&self, source_file_id: u64, col: u32, row: u32) -> Option<TileRef<'_>> {
        self.coords
            .get(&(source_file_id, col, row))
            .map(|&idx| self.join(&self.tiles[idx]))
    }

    fn join<'a>(&'a self, record: &'a TileRecord) -> TileRef<'a> {
        // from_parts guarantees every tile's source exists.
        let source = &self.sources[self.source_index[&record.source_file_id]];
        TileRef::new(record, source)
    }

    /// Save store to disk
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        log::info!("Saving TileStore to {:?}", path);
        let snapshot = Snapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            next_source_id: self.next_source_id,
            next_tile_id: self.next_tile_id,
            source_files: self.sources.clone(),
            tiles: self.tiles.clone(),
        };
        let data = serde_json::to_vec(&snapshot)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        log::info!(
            "TileStore saved: {} source files, {} tiles",
            self.sources.len(),
            self.tiles.len()
        );
        Ok(())
    }

    /// Load store from disk
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        log::info!("Loading TileStore from {:?}", path.as_ref());
        let data = tokio::fs::read(&path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&data)?;
        if !(1..=SNAPSHOT_SCHEMA_VERSION).contains(&snapshot.schema_version) {
            return Err(StoreError::UnsupportedSchema {
                found: snapshot.schema_version,
                expected: SNAPSHOT_SCHEMA_VERSION,
            });
        }
        let store = Self::from_parts(snapshot.source_files, snapshot.tiles)?
            .with_watermarks(snapshot.next_source_id, snapshot.next_tile_id);
        log::info!("Loaded {} tiles", store.len());
        Ok(store)
    }

    /// Load the snapshot at `path`, or an empty store when it does not exist yet.
    pub async fn load_or_empty(path: impl AsRef<Path>) -> Result<Self> {
        if tokio::fs::try_exists(path.as_ref()).await? {
            return Self::load(path).await;
        }
        log::info!("No TileStore at {:?}; starting empty", path.as_ref());
        Ok(Self::empty())
    }

    pub fn into_builder(self) -> StoreBuilder {
        StoreBuilder {
            sources: self.sources,
            tiles: self.tiles,
            next_source_id: self.next_source_id,
            next_tile_id: self.next_tile_id,
        }
    }
}

impl Default for TileStore {
    fn default() -> Self {
        Self::empty()
    }
}

/// Mutable staging area for ingestion and source-file removal. The only way
/// records change; `build` freezes the result into a `TileStore`.
#[derive(Debug)]
pub struct StoreBuilder {
    sources: Vec<SourceFile>,
    tiles: Vec<TileRecord>,
    next_source_id: u64,
    next_tile_id: u64,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            tiles: Vec::new(),
            next_source_id: 1,
            next_tile_id: 1,
        }
    }

    pub fn contains_source(&self, json_filename: &str) -> bool {
        self.sources.iter().any(|s| s.json_filename == json_filename)
    }

    /// Add one producer batch. Returns the new source file id, or `None`
    /// when a file with the same name was ingested before.
    pub fn add_source(&mut self, batch: SourceBatch) -> Result<Option<u64>> {
        if self.contains_source(&batch.json_filename) {
            log::info!("Skipping '{}', already ingested", batch.json_filename);
            return Ok(None);
        }

        let mut seen = HashSet::with_capacity(batch.tiles.len());
        for tile in &batch.tiles {
            if !seen.insert((tile.col, tile.row)) {
                return Err(StoreError::DuplicateTile {
                    json_filename: batch.json_filename.clone(),
                    col: tile.col,
                    row: tile.row,
                });
            }
        }

        let source_id = self.next_source_id;
        self.next_source_id += 1;
        let tile_count = batch.tiles.len();
        for draft in batch.tiles {
            let id = self.next_tile_id;
            self.next_tile_id += 1;
            self.tiles.push(draft.into_record(id, source_id));
        }
        self.sources.push(SourceFile {
            id: source_id,
            json_filename: batch.json_filename.clone(),
            image_directory: batch.image_directory,
            ingested_at: Utc::now(),
            tile_count,
            prediction_model: None,
        });

        log::info!(
            "Ingested '{}' with {} tiles ({} skipped)",
            batch.json_filename,
            tile_count,
            batch.skipped
        );
        Ok(Some(source_id))
    }

    /// Remove a source file and all of its tiles. Returns the number of
    /// tiles removed.
    pub fn remove_source(&mut self, json_filename: &str) -> Result<usize> {
        let Some(pos) = self
            .sources
            .iter()
            .position(|s| s.json_filename == json_filename)
        else {
            return Err(StoreError::SourceFileNotFound(json_filename.to_string()));
        };
        let source = self.sources.remove(pos);
        let before = self.tiles.len();
        self.tiles.retain(|t| t.source_file_id != source.id);
        let removed = before - self.tiles.len();
        log::info!("Removed '{}' ({} tiles)", json_filename, removed);
        Ok(removed)
    }

    /// Replace the model predictions of one source file, found by
    /// `json_filename` or `image_directory`. Tiles without a row in the
    /// batch lose any earlier prediction.
    pub fn attach_predictions(
        &mut self,
        source: &str,
        batch: &PredictionBatch,
    ) -> Result<PredictionOutcome> {
        let pos = self
            .sources
            .iter()
            .position(|s| s.json_filename == source)
            .or_else(|| {
                self.sources
                    .iter()
                    .position(|s| !s.image_directory.is_empty() && s.image_directory == source)
            })
            .ok_or_else(|| StoreError::SourceFileNotFound(source.to_string()))?;
        let source_file = &mut self.sources[pos];
        source_file.prediction_model = Some(batch.model_name.clone());
        let (source_file_id, json_filename) = (source_file.id, source_file.json_filename.clone());

        let by_image = batch.by_image();
        let mut hits = HashSet::with_capacity(by_image.len());
        let mut matched = 0usize;
        for tile in self.tiles.iter_mut().filter(|t| t.source_file_id == source_file_id) {
            match by_image.get_key_value(tile.image_filename.as_str()) {
                Some((name, prediction)) => {
                    tile.model_score = prediction.score;
                    tile.model_classification = prediction.classification.clone();
                    hits.insert(*name);
                    matched += 1;
                }
                None => {
                    tile.model_score = None;
                    tile.model_classification = None;
                }
            }
        }
        let unmatched = by_image.len() - hits.len();

        if matched == 0 && !by_image.is_empty() {
            log::warn!(
                "No prediction from '{}' matched a tile of '{json_filename}'",
                batch.model_name
            );
        }
        log::info!(
            "Attached {matched} '{}' predictions to '{json_filename}' ({unmatched} unmatched)",
            batch.model_name
        );
        Ok(PredictionOutcome {
            source_file_id,
            matched,
            unmatched,
        })
    }

    pub fn build(self) -> Result<TileStore> {
        Ok(TileStore::from_parts(self.sources, self.tiles)?
            .with_watermarks(self.next_source_id, self.next_tile_id))
    }
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
