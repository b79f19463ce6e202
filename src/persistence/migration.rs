//! Save format migrations
//!
//! Edges are registered per `(from, to)` version pair. Loading an old save
//! follows the shortest chain of edges to the current version; when no
//! chain exists the save is loaded as-is and the default-merge fills in
//! whatever it lacks.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value as Json;

use crate::error::PersistenceError;

/// Transform one version's raw save into the next
pub type MigrationFn = Box<dyn Fn(Json) -> Result<Json, String>>;

/// What happened to a blob on its way in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Already at the target version
    Current,
    /// Transformed along `path` (first entry is the original version)
    Migrated { path: Vec<String> },
    /// No chain to the target; left untouched
    Skipped { from: String },
}

impl MigrationOutcome {
    pub fn migrated(&self) -> bool {
        matches!(self, MigrationOutcome::Migrated { .. })
    }
}

#[derive(Default)]
pub struct MigrationRegistry {
    /// Outgoing edges per version, in registration order
    edges: HashMap<String, Vec<(String, MigrationFn)>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the edge `from -> to`
    pub fn register<F>(&mut self, from: impl Into<String>, to: impl Into<String>, transform: F)
    where
        F: Fn(Json) -> Result<Json, String> + 'static,
    {
        let to = to.into();
        let out = self.edges.entry(from.into()).or_default();
        out.retain(|(target, _)| *target != to);
        out.push((to, Box::new(transform)));
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges
            .get(from)
            .is_some_and(|out| out.iter().any(|(target, _)| target == to))
    }

    /// Shortest version chain `from -> ... -> to`, both ends included
    pub fn resolve(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if from == to {
            return Some(vec![from.to_string()]);
        }
        let mut came_from: HashMap<&str, &str> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(version) = queue.pop_front() {
            for (next, _) in self.edges.get(version).into_iter().flatten() {
                if !seen.insert(next.as_str()) {
                    continue;
                }
                came_from.insert(next.as_str(), version);
                if next == to {
                    let mut path = vec![to.to_string()];
                    let mut cursor = to;
                    while let Some(prev) = came_from.get(cursor) {
                        path.push((*prev).to_string());
                        cursor = *prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next.as_str());
            }
        }
        None
    }

    /// Bring `blob` to `target`. The `version` field is restamped after
    /// every edge.
    pub fn migrate(&self, blob: Json, target: &str) -> Result<(Json, MigrationOutcome), PersistenceError> {
        let from = blob
            .get("version")
            .and_then(Json::as_str)
            .ok_or_else(|| PersistenceError::Structural("missing version".into()))?
            .to_string();
        if from == target {
            return Ok((blob, MigrationOutcome::Current));
        }

        let Some(path) = self.resolve(&from, target) else {
            log::warn!("No migration path from {from} to {target}; loading as-is");
            return Ok((blob, MigrationOutcome::Skipped { from }));
        };

        let mut blob = blob;
        for pair in path.windows(2) {
            let (step_from, step_to) = (&pair[0], &pair[1]);
            let transform = self
                .edges
                .get(step_from)
                .and_then(|out| out.iter().find(|(t, _)| t == step_to))
                .map(|(_, f)| f)
                .ok_or_else(|| PersistenceError::Migration {
                    from: step_from.clone(),
                    to: step_to.clone(),
                    message: "edge disappeared".into(),
                })?;

            blob = transform(blob).map_err(|message| PersistenceError::Migration {
                from: step_from.clone(),
                to: step_to.clone(),
                message,
            })?;
            if let Some(obj) = blob.as_object_mut() {
                obj.insert("version".into(), Json::from(step_to.as_str()));
            }
            log::info!("Migrated save {step_from} -> {step_to}");
        }
        Ok((blob, MigrationOutcome::Migrated { path }))
    }
}
