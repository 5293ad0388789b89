use tilescope_store::{SourceBatch, StoreBuilder, TileDraft, TileStore};

pub(crate) fn tile(col: u32, row: u32) -> TileDraft {
    TileDraft::new(format!("{col}_{row}.webp"), col, row)
}

/// Ingest each `(json_filename, tiles)` pair in order. Tile ids follow
/// input order starting at 1.
pub(crate) fn store_with(files: Vec<(&str, Vec<TileDraft>)>) -> TileStore {
    let mut builder = StoreBuilder::new();
    for (name, tiles) in files {
        builder
            .add_source(SourceBatch {
                json_filename: name.to_string(),
                image_directory: String::new(),
                tiles,
                skipped: 0,
            })
            .unwrap();
    }
    builder.build().unwrap()
}
