//! Reversible key-renaming compression
//!
//! Every object key found in [`KEY_TABLE`] is replaced by its short code.
//! Keys that already look like a short code (or start with the escape
//! character) are escaped with `~` so that decompression is exact for
//! any input. Values are never touched.

use serde_json::{Map, Value as Json};

use crate::error::PersistenceError;

/// Bumped whenever [`KEY_TABLE`] changes
pub const KEY_TABLE_VERSION: u32 = 1;

const ESCAPE: char = '~';

/// Long key -> short code
pub const KEY_TABLE: &[(&str, &str)] = &[
    ("version", "v"),
    ("timestamp", "ts"),
    ("gameState", "gs"),
    ("subsystems", "ss"),
    ("metadata", "md"),
    ("saveCount", "sc"),
    ("totalPlayTime", "tp"),
    ("lastScale", "ls"),
    ("difficulty", "df"),
    ("resources", "r"),
    ("energy", "e"),
    ("data", "d"),
    ("consciousness", "c"),
    ("influence", "i"),
    ("heat", "h"),
    ("current", "cu"),
    ("max", "mx"),
    ("decayRate", "dr"),
    ("detected", "dt"),
    ("expansion", "x"),
    ("scale", "s"),
    ("progress", "p"),
    ("rate", "ra"),
    ("unlocked", "u"),
    ("ethics", "et"),
    ("level", "l"),
    ("absorbed", "ab"),
    ("absorbedAt", "aa"),
    ("power", "pw"),
    ("timeline", "t"),
    ("timelineId", "ti"),
    ("paradoxRisk", "pr"),
    ("peakRisk", "pk"),
    ("maxEnergy", "me"),
    ("collapses", "co"),
    ("collapseCount", "cc"),
    ("events", "ev"),
    ("alterations", "al"),
    ("archived", "ar"),
    ("stats", "st"),
    ("choicesMade", "cm"),
    ("settings", "se"),
];

/// Wrapper key marking a compressed save
const COMPRESSED_FLAG: &str = "_compressed";

fn shorten(key: &str) -> String {
    if let Some((_, short)) = KEY_TABLE.iter().find(|(long, _)| *long == key) {
        return (*short).to_string();
    }
    if key.starts_with(ESCAPE) || KEY_TABLE.iter().any(|(_, short)| *short == key) {
        return format!("{ESCAPE}{key}");
    }
    key.to_string()
}

fn expand(key: &str) -> String {
    if let Some(escaped) = key.strip_prefix(ESCAPE) {
        return escaped.to_string();
    }
    if let Some((long, _)) = KEY_TABLE.iter().find(|(_, short)| *short == key) {
        return (*long).to_string();
    }
    key.to_string()
}

fn rename_keys(json: &Json, rename: fn(&str) -> String) -> Json {
    match json {
        Json::Object(obj) => Json::Object(
            obj.iter()
                .map(|(k, v)| (rename(k), rename_keys(v, rename)))
                .collect::<Map<_, _>>(),
        ),
        Json::Array(items) => Json::Array(items.iter().map(|v| rename_keys(v, rename)).collect()),
        other => other.clone(),
    }
}

/// Rename keys recursively
pub fn compress(json: &Json) -> Json {
    rename_keys(json, shorten)
}

/// Inverse of [`compress`]
pub fn decompress(json: &Json) -> Json {
    rename_keys(json, expand)
}

pub fn is_compressed(json: &Json) -> bool {
    json.get(COMPRESSED_FLAG).and_then(Json::as_bool) == Some(true)
}

/// Compress and wrap with the header needed to undo it
pub fn wrap(json: &Json, original_size: usize) -> Json {
    serde_json::json!({
        COMPRESSED_FLAG: true,
        "_originalSize": original_size,
        "_table": KEY_TABLE_VERSION,
        "data": compress(json),
    })
}

/// Undo [`wrap`]
pub fn unwrap(json: &Json) -> Result<Json, PersistenceError> {
    let table = json.get("_table").and_then(Json::as_u64).unwrap_or(1);
    if table != u64::from(KEY_TABLE_VERSION) {
        return Err(PersistenceError::Structural(format!(
            "unknown compression table {table}"
        )));
    }
    let data = json
        .get("data")
        .ok_or_else(|| PersistenceError::Structural("compressed save has no data".into()))?;
    Ok(decompress(data))
}
