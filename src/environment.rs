//! Field tag layout: which tag ids exist and where they sit in field space.
//!
//! The layout loads once from a JSON file at startup and can be replaced as
//! a whole at runtime from the bus. A refresh swaps the entire map
//! atomically; readers holding an old snapshot keep a consistent view.

use anyhow::{anyhow, Result};
use nalgebra::{Isometry3, Translation3};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use crate::geom;

#[derive(Debug, Clone)]
pub struct TagEnvironment {
    /// Physical tag edge length, meters.
    pub tag_size: f64,
    tags: BTreeMap<u8, Isometry3<f64>>,
}

impl TagEnvironment {
    pub fn new(tag_size: f64) -> Self {
        Self {
            tag_size,
            tags: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, id: u8, pose: Isometry3<f64>) {
        self.tags.insert(id, pose);
    }

    pub fn tag_pose(&self, id: u8) -> Option<&Isometry3<f64>> {
        self.tags.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u8, &Isometry3<f64>)> {
        self.tags.iter()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read environment file {}: {}", path.display(), e))?;
        let file: EnvironmentFile = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid environment file {}: {}", path.display(), e))?;
        let mut env = Self::new(file.tag_size);
        for entry in file.tags {
            let id = u8::try_from(entry.id)
                .map_err(|_| anyhow!("tag id {} does not fit the wire format", entry.id))?;
            let t = entry.pose.translation;
            let q = entry.pose.rotation.quaternion;
            env.insert(
                id,
                Isometry3::from_parts(
                    Translation3::new(t.x, t.y, t.z),
                    geom::quaternion_from_wxyz(q.w, q.x, q.y, q.z),
                ),
            );
        }
        Ok(env)
    }

    /// Flat f64 encoding used on the bus:
    /// `[tag_size, id_0, x, y, z, qw, qx, qy, qz, id_1, ...]`.
    pub fn to_flat_array(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(1 + self.tags.len() * 8);
        values.push(self.tag_size);
        for (id, pose) in &self.tags {
            let t = pose.translation.vector;
            let [qw, qx, qy, qz] = geom::quaternion_wxyz(pose);
            values.extend_from_slice(&[f64::from(*id), t.x, t.y, t.z, qw, qx, qy, qz]);
        }
        values
    }

    pub fn from_flat_array(values: &[f64]) -> Result<Self> {
        if values.is_empty() || (values.len() - 1) % 8 != 0 {
            return Err(anyhow!(
                "environment array must hold a tag size plus 8 values per tag, got {}",
                values.len()
            ));
        }
        let mut env = Self::new(values[0]);
        for chunk in values[1..].chunks_exact(8) {
            let id = u8::try_from(chunk[0] as i64)
                .map_err(|_| anyhow!("tag id {} does not fit the wire format", chunk[0]))?;
            env.insert(
                id,
                Isometry3::from_parts(
                    Translation3::new(chunk[1], chunk[2], chunk[3]),
                    geom::quaternion_from_wxyz(chunk[4], chunk[5], chunk[6], chunk[7]),
                ),
            );
        }
        Ok(env)
    }
}

#[derive(Debug, Deserialize)]
struct EnvironmentFile {
    tag_size: f64,
    tags: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    #[serde(rename = "ID")]
    id: u32,
    pose: PoseEntry,
}

#[derive(Debug, Deserialize)]
struct PoseEntry {
    translation: TranslationEntry,
    rotation: RotationEntry,
}

#[derive(Debug, Deserialize)]
struct TranslationEntry {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Debug, Deserialize)]
struct RotationEntry {
    quaternion: QuaternionEntry,
}

#[derive(Debug, Deserialize)]
struct QuaternionEntry {
    #[serde(rename = "W")]
    w: f64,
    #[serde(rename = "X")]
    x: f64,
    #[serde(rename = "Y")]
    y: f64,
    #[serde(rename = "Z")]
    z: f64,
}

// ----------------------------------------------------------------------------
// Shared handle
// ----------------------------------------------------------------------------

/// Handle the workers and the bus share. `replace` swaps the whole layout;
/// `snapshot` is what a worker pins for the duration of one frame.
#[derive(Clone)]
pub struct SharedEnvironment {
    inner: Arc<RwLock<Arc<TagEnvironment>>>,
}

impl SharedEnvironment {
    pub fn new(env: TagEnvironment) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(env))),
        }
    }

    pub fn snapshot(&self) -> Arc<TagEnvironment> {
        Arc::clone(
            &self
                .inner
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn replace(&self, env: TagEnvironment) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(env);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn loads_layout_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
              "tag_size": 0.152,
              "tags": [
                {{"ID": 1, "pose": {{"translation": {{"x": 1.0, "y": 2.0, "z": 3.0}},
                  "rotation": {{"quaternion": {{"W": 1.0, "X": 0.0, "Y": 0.0, "Z": 0.0}}}}}}}},
                {{"ID": 7, "pose": {{"translation": {{"x": -0.5, "y": 0.0, "z": 1.5}},
                  "rotation": {{"quaternion": {{"W": 0.0, "X": 0.0, "Y": 0.0, "Z": 1.0}}}}}}}}
              ]
            }}"#
        )
        .unwrap();
        let env = TagEnvironment::load(file.path()).unwrap();
        assert!(close(env.tag_size, 0.152));
        assert_eq!(env.len(), 2);
        let pose = env.tag_pose(1).unwrap();
        assert!(close(pose.translation.vector.x, 1.0));
        assert!(close(pose.translation.vector.z, 3.0));
        assert!(env.tag_pose(2).is_none());
    }

    #[test]
    fn flat_array_round_trips() {
        let mut env = TagEnvironment::new(0.2);
        env.insert(
            3,
            Isometry3::from_parts(
                Translation3::new(1.0, -2.0, 0.5),
                geom::quaternion_from_wxyz(1.0, 0.0, 0.0, 0.0),
            ),
        );
        env.insert(
            9,
            Isometry3::from_parts(
                Translation3::new(0.0, 4.0, -1.0),
                geom::quaternion_from_wxyz(0.0, 1.0, 0.0, 0.0),
            ),
        );
        let values = env.to_flat_array();
        assert_eq!(values.len(), 1 + 2 * 8);
        let decoded = TagEnvironment::from_flat_array(&values).unwrap();
        assert!(close(decoded.tag_size, 0.2));
        assert_eq!(decoded.len(), 2);
        let p3 = decoded.tag_pose(3).unwrap();
        assert!(close(p3.translation.vector.y, -2.0));
        assert!(decoded.tag_pose(9).is_some());
    }

    #[test]
    fn rejects_malformed_arrays() {
        assert!(TagEnvironment::from_flat_array(&[]).is_err());
        assert!(TagEnvironment::from_flat_array(&[0.1, 1.0, 2.0]).is_err());
        let mut oversized = vec![0.1];
        oversized.extend_from_slice(&[300.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        assert!(TagEnvironment::from_flat_array(&oversized).is_err());
    }

    #[test]
    fn shared_handle_swaps_atomically() {
        let shared = SharedEnvironment::new(TagEnvironment::new(0.1));
        let before = shared.snapshot();
        shared.replace(TagEnvironment::new(0.9));
        let after = shared.snapshot();
        assert!(close(before.tag_size, 0.1));
        assert!(close(after.tag_size, 0.9));
    }
}
