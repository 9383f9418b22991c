//! A thread-safe settings document addressed by dotted paths.
//!
//! Paths are dot-separated keys, e.g. `auth.password`. Integer segments index
//! into sequences (`params.0.key`). Every conversion step works on a clone of
//! the document, so a failed step never leaves a half-mutated source behind.

use std::{
    fmt::{self, Display},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Settings of a single module, as stored in `spec.settings`.
pub type SettingsValues = Map<String, Value>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid settings path {path:?}"))]
    InvalidPath { path: String },

    #[snafu(display("settings document is corrupt"))]
    CorruptDocument { source: serde_json::Error },

    #[snafu(display("failed to parse raw JSON for path {path:?}"))]
    ParseJson {
        source: serde_json::Error,
        path: String,
    },
}

#[derive(Debug, Default)]
pub struct Settings {
    document: RwLock<SettingsValues>,
}

impl Settings {
    pub fn new(values: SettingsValues) -> Self {
        Self {
            document: RwLock::new(values),
        }
    }

    /// Parses a JSON object. Anything but an object is a corrupt document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let values = serde_json::from_slice(bytes).context(CorruptDocumentSnafu)?;
        Ok(Self::new(values))
    }

    /// Returns a copy of the node at `path`, [`None`] when nothing is there.
    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        let segments = split_path(path)?;
        let document = self.read();

        let mut node = match document.get(segments[0]) {
            Some(node) => node,
            None => return Ok(None),
        };
        for segment in &segments[1..] {
            node = match child(node, segment) {
                Some(node) => node,
                None => return Ok(None),
            };
        }

        Ok(Some(node.clone()))
    }

    /// Sets the node at `path`, creating intermediate mappings when missing.
    ///
    /// An integer segment on an existing sequence addresses an element; the
    /// index equal to the sequence length appends.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let segments = split_path(path)?;
        let mut document = self.write();

        let (leaf, parents) = segments
            .split_last()
            .context(InvalidPathSnafu { path })?;

        let mut node = match parents.first() {
            Some(first) => document
                .entry((*first).to_owned())
                .or_insert_with(|| Value::Object(Map::new())),
            None => {
                document.insert((*leaf).to_owned(), value.into());
                return Ok(());
            }
        };

        for segment in &parents[1..] {
            node = child_or_insert(node, segment, path)?;
        }

        match node {
            Value::Object(map) => {
                map.insert((*leaf).to_owned(), value.into());
            }
            Value::Array(items) => {
                let index = parse_index(leaf, items.len(), path)?;
                if index == items.len() {
                    items.push(value.into());
                } else {
                    items[index] = value.into();
                }
            }
            _ => return InvalidPathSnafu { path }.fail(),
        }

        Ok(())
    }

    /// Like [`Settings::set`], with the value given as a JSON literal.
    pub fn set_raw(&self, path: &str, raw: &str) -> Result<()> {
        let value: Value = serde_json::from_str(raw).context(ParseJsonSnafu { path })?;
        self.set(path, value)
    }

    /// Removes the node at `path`. Returns whether something was removed.
    pub fn delete(&self, path: &str) -> Result<bool> {
        let segments = split_path(path)?;
        let mut document = self.write();

        let (leaf, parents) = segments
            .split_last()
            .context(InvalidPathSnafu { path })?;

        let Some(first) = parents.first() else {
            return Ok(document.remove(*leaf).is_some());
        };

        let Some(mut node) = document.get_mut(*first) else {
            return Ok(false);
        };
        for segment in &parents[1..] {
            node = match child_mut(node, segment) {
                Some(node) => node,
                None => return Ok(false),
            };
        }

        let removed = match node {
            Value::Object(map) => map.remove(*leaf).is_some(),
            Value::Array(items) => match leaf.parse::<usize>() {
                Ok(index) if index < items.len() => {
                    items.remove(index);
                    true
                }
                _ => false,
            },
            _ => false,
        };

        Ok(removed)
    }

    /// Removes the node at `path` and then every parent left empty by the
    /// removal. Stops at the first non-empty parent or at a top-level key.
    pub fn delete_and_clean(&self, path: &str) -> Result<()> {
        self.delete(path)?;

        let mut path = path;
        while let Some((parent, _)) = path.rsplit_once('.') {
            if !self.is_empty_node(parent)? {
                break;
            }
            self.delete(parent)?;
            path = parent;
        }

        Ok(())
    }

    /// Returns true when the parent of `path` is an empty mapping or an empty
    /// sequence. A top-level path has the document itself as parent.
    pub fn is_empty_parent(&self, path: &str) -> Result<bool> {
        split_path(path)?;
        match path.rsplit_once('.') {
            Some((parent, _)) => self.is_empty_node(parent),
            None => Ok(self.read().is_empty()),
        }
    }

    fn is_empty_node(&self, path: &str) -> Result<bool> {
        Ok(match self.get(path)? {
            Some(Value::Object(map)) => map.is_empty(),
            Some(Value::Array(items)) => items.is_empty(),
            _ => false,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Returns a deep copy of the whole document.
    pub fn map(&self) -> SettingsValues {
        self.read().clone()
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&*self.read()).context(CorruptDocumentSnafu)
    }

    fn read(&self) -> RwLockReadGuard<'_, SettingsValues> {
        self.document.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SettingsValues> {
        self.document.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clone for Settings {
    fn clone(&self) -> Self {
        Self::new(self.map())
    }
}

impl PartialEq for Settings {
    fn eq(&self, other: &Self) -> bool {
        *self.read() == *other.read()
    }
}

impl Eq for Settings {}

impl From<SettingsValues> for Settings {
    fn from(values: SettingsValues) -> Self {
        Self::new(values)
    }
}

impl Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let document = self.read();
        let json = serde_json::to_string(&*document).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').collect();
    ensure!(
        segments.iter().all(|segment| !segment.is_empty()),
        InvalidPathSnafu { path }
    );
    Ok(segments)
}

fn parse_index(segment: &str, len: usize, path: &str) -> Result<usize> {
    match segment.parse::<usize>() {
        Ok(index) if index <= len => Ok(index),
        _ => InvalidPathSnafu { path }.fail(),
    }
}

fn child<'a>(node: &'a Value, segment: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
        _ => None,
    }
}

fn child_mut<'a>(node: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?),
        _ => None,
    }
}

fn child_or_insert<'a>(node: &'a mut Value, segment: &str, path: &str) -> Result<&'a mut Value> {
    match node {
        Value::Object(map) => Ok(map
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(Map::new()))),
        Value::Array(items) => {
            let index = parse_index(segment, items.len(), path)?;
            if index == items.len() {
                items.push(Value::Object(Map::new()));
            }
            Ok(&mut items[index])
        }
        _ => InvalidPathSnafu { path }.fail(),
    }
}
