//! Cursor command implementation.

use super::print_json;
use std::path::Path;
use txtrack_engine::{FileStateStore, StateStore};

/// Runs the cursor command.
pub fn run(state_dir: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStateStore::open(state_dir)?;
    let cursor = store.load()?;

    if format == "json" {
        print_json(&cursor)?;
        return Ok(());
    }
    match cursor {
        Some(cursor) => println!(
            "Cursor: tx {} @ {} ms",
            cursor.tx_id, cursor.commit_time_ms
        ),
        None => println!("No cursor saved in {:?}", state_dir),
    }
    Ok(())
}
