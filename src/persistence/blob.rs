//! Versioned save format
//!
//! ```json
//! {
//!   "version": "1.0.0",
//!   "timestamp": 1700000000000,
//!   "gameState": { ...store tree... },
//!   "subsystems": { "timeline": { ... } },
//!   "metadata": { "saveCount": 3, "totalPlayTime": 120.5, "lastScale": "local", "difficulty": "normal" }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::PersistenceError;
use crate::state::REQUIRED_SECTIONS;

/// Summary shown in load menus without parsing the whole tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SaveMetadata {
    pub save_count: u64,
    pub total_play_time: f64,
    pub last_scale: String,
    pub difficulty: String,
}

impl Default for SaveMetadata {
    fn default() -> Self {
        Self {
            save_count: 0,
            total_play_time: 0.0,
            last_scale: "local".to_string(),
            difficulty: "normal".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveBlob {
    pub version: String,
    /// Milliseconds since the epoch
    pub timestamp: f64,
    pub game_state: Json,
    /// Opaque subsystem snapshots by subsystem name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subsystems: BTreeMap<String, Json>,
    #[serde(default)]
    pub metadata: SaveMetadata,
}

/// Reject anything that is not recognisably a save before it can touch
/// the store.
pub fn validate_structure(raw: &Json) -> Result<(), PersistenceError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| PersistenceError::Structural("save is not an object".into()))?;

    match obj.get("version") {
        Some(Json::String(v)) if !v.is_empty() => {}
        Some(_) => return Err(PersistenceError::Structural("version is not a string".into())),
        None => return Err(PersistenceError::Structural("missing version".into())),
    }
    if !obj.get("timestamp").is_some_and(Json::is_number) {
        return Err(PersistenceError::Structural(
            "missing or non-numeric timestamp".into(),
        ));
    }

    let state = obj
        .get("gameState")
        .ok_or_else(|| PersistenceError::Structural("missing gameState".into()))?
        .as_object()
        .ok_or_else(|| PersistenceError::Structural("gameState is not an object".into()))?;

    if let Some(missing) = REQUIRED_SECTIONS.iter().find(|s| !state.contains_key(**s)) {
        return Err(PersistenceError::Structural(format!(
            "gameState is missing `{missing}`"
        )));
    }
    Ok(())
}
