//! Manifest patch operations
//!
//! Operations use the BOSH ops-file path language:
//!
//! - `/key` selects a map key
//! - `/0`, `/-1` select a list element by index (negative counts from the end)
//! - `/-` appends to a list
//! - `/name=value` selects the list element whose `name` field equals `value`
//! - a trailing `?` makes the segment, and every segment after it, optional:
//!   missing keys and unmatched elements are created instead of failing
//! - `~1` and `~0` escape `/` and `~` inside a segment
//!
//! Paths are parsed once into [`PatchPath`] and applied to a
//! `serde_yaml::Value` tree. A list of operations is applied to a copy of the
//! tree, so a failure leaves the original document untouched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::{ManifestError, Result};

/// One step of a patch path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Map key lookup
    Key { name: String, optional: bool },
    /// List element by position
    Index { index: i64, optional: bool },
    /// Position after the last list element
    Append,
    /// List element whose `field` equals `value`
    Match {
        field: String,
        value: String,
        optional: bool,
    },
}

impl PathSegment {
    fn is_optional(&self) -> bool {
        match self {
            PathSegment::Key { optional, .. }
            | PathSegment::Index { optional, .. }
            | PathSegment::Match { optional, .. } => *optional,
            PathSegment::Append => true,
        }
    }

    /// Container a missing parent must be created as so this segment can resolve
    fn empty_container(&self) -> Value {
        match self {
            PathSegment::Key { .. } => Value::Mapping(Mapping::new()),
            _ => Value::Sequence(Vec::new()),
        }
    }
}

fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (body, optional) = match self {
            PathSegment::Key { name, optional } => (escape(name), *optional),
            PathSegment::Index { index, optional } => (index.to_string(), *optional),
            PathSegment::Append => return write!(f, "-"),
            PathSegment::Match {
                field,
                value,
                optional,
            } => (format!("{}={}", escape(field), escape(value)), *optional),
        };
        write!(f, "{}{}", body, if optional { "?" } else { "" })
    }
}

/// A parsed patch path
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchPath {
    segments: Vec<PathSegment>,
}

impl PatchPath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Path pointing at the whole document
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for PatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for PatchPath {
    type Err = ManifestError;

    fn from_str(path: &str) -> Result<Self> {
        if path.is_empty() || path == "/" {
            return Ok(Self::default());
        }
        let rest = path.strip_prefix('/').ok_or_else(|| ManifestError::InvalidPath {
            path: path.to_string(),
            reason: "must start with '/'".to_string(),
        })?;

        let mut segments = Vec::new();
        // Once a segment is optional, everything below it is too
        let mut optional_from_here = false;

        for raw in rest.split('/') {
            if raw.is_empty() {
                return Err(ManifestError::InvalidPath {
                    path: path.to_string(),
                    reason: "empty segment".to_string(),
                });
            }
            if raw == "-" {
                segments.push(PathSegment::Append);
                continue;
            }

            let (body, marked) = match raw.strip_suffix('?') {
                Some(body) => (body, true),
                None => (raw, false),
            };
            optional_from_here |= marked;
            let optional = optional_from_here;

            let segment = if let Some((field, value)) = body.split_once('=') {
                PathSegment::Match {
                    field: unescape(field),
                    value: unescape(value),
                    optional,
                }
            } else if let Ok(index) = body.parse::<i64>() {
                PathSegment::Index { index, optional }
            } else {
                PathSegment::Key {
                    name: unescape(body),
                    optional,
                }
            };
            segments.push(segment);
        }

        Ok(Self { segments })
    }
}

impl TryFrom<String> for PatchPath {
    type Error = ManifestError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PatchPath> for String {
    fn from(path: PatchPath) -> Self {
        path.to_string()
    }
}

/// Kind of patch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Replace,
    Remove,
}

/// A single `{type, path, value}` patch operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpDefinition {
    #[serde(rename = "type")]
    pub kind: OpKind,
    #[serde(with = "path_serde")]
    pub path: PatchPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

mod path_serde {
    use super::PatchPath;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(path: &PatchPath, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(path)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PatchPath, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl OpDefinition {
    /// Replace (or create) the node at `path` with `value`
    pub fn replace(path: &str, value: impl Into<Value>) -> Result<Self> {
        Ok(Self {
            kind: OpKind::Replace,
            path: path.parse()?,
            value: Some(value.into()),
        })
    }

    /// Remove the node at `path`
    pub fn remove(path: &str) -> Result<Self> {
        Ok(Self {
            kind: OpKind::Remove,
            path: path.parse()?,
            value: None,
        })
    }

    /// Apply this operation in place
    pub fn apply(&self, doc: &mut Value) -> Result<()> {
        match self.kind {
            OpKind::Replace => {
                let value = self.value.clone().unwrap_or(Value::Null);
                replace(doc, &self.path, value)
            }
            OpKind::Remove => remove(doc, &self.path),
        }
    }
}

/// Apply `ops` in order; the document is only modified if all of them succeed
pub fn apply_ops(doc: &mut Value, ops: &[OpDefinition]) -> Result<()> {
    let mut patched = doc.clone();
    for op in ops {
        op.apply(&mut patched)?;
        tracing::trace!(path = %op.path, kind = ?op.kind, "Applied manifest patch");
    }
    *doc = patched;
    Ok(())
}

/// Parse an ops-file document (a YAML list of operations)
pub fn parse_ops(yaml: &str) -> Result<Vec<OpDefinition>> {
    Ok(serde_yaml::from_str(yaml)?)
}

fn not_found(path: &PatchPath, what: String) -> ManifestError {
    ManifestError::PathNotFound {
        path: path.to_string(),
        reason: what,
    }
}

fn field_matches(item: &Value, field: &str, expected: &str) -> bool {
    match item.get(field) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Number(n)) => n.to_string() == expected,
        Some(Value::Bool(b)) => b.to_string() == expected,
        _ => false,
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index >= 0 {
        let i = usize::try_from(index).ok()?;
        (i < len).then_some(i)
    } else {
        let back = usize::try_from(index.unsigned_abs()).ok()?;
        len.checked_sub(back)
    }
}

/// Find (or create, when optional) the child `segment` of `node`.
///
/// `next` is the segment that will be resolved against the child, used to
/// decide what kind of container to create.
fn descend<'a>(
    node: &'a mut Value,
    segment: &PathSegment,
    next: &PathSegment,
    path: &PatchPath,
) -> Result<&'a mut Value> {
    match segment {
        PathSegment::Key { name, optional } => {
            if node.is_null() && *optional {
                *node = Value::Mapping(Mapping::new());
            }
            let map = node
                .as_mapping_mut()
                .ok_or_else(|| not_found(path, format!("a map at key '{}'", name)))?;
            let key = Value::String(name.clone());
            if !map.contains_key(&key) {
                if !*optional {
                    return Err(not_found(path, format!("a map key '{}'", name)));
                }
                map.insert(key.clone(), next.empty_container());
            }
            let child = map
                .get_mut(&key)
                .ok_or_else(|| not_found(path, format!("a map key '{}'", name)))?;
            if child.is_null() && next.is_optional() {
                *child = next.empty_container();
            }
            Ok(child)
        }
        PathSegment::Index { index, .. } => {
            let list = node
                .as_sequence_mut()
                .ok_or_else(|| not_found(path, format!("a list at index {}", index)))?;
            let len = list.len();
            let i = resolve_index(*index, len)
                .ok_or_else(|| not_found(path, format!("list index {} (length {})", index, len)))?;
            list.get_mut(i)
                .ok_or_else(|| not_found(path, format!("list index {}", index)))
        }
        PathSegment::Append => {
            if node.is_null() {
                *node = Value::Sequence(Vec::new());
            }
            let list = node
                .as_sequence_mut()
                .ok_or_else(|| not_found(path, "a list to append to".to_string()))?;
            list.push(next.empty_container());
            list.last_mut()
                .ok_or_else(|| not_found(path, "a list to append to".to_string()))
        }
        PathSegment::Match {
            field,
            value,
            optional,
        } => {
            if node.is_null() && *optional {
                *node = Value::Sequence(Vec::new());
            }
            let list = node
                .as_sequence_mut()
                .ok_or_else(|| not_found(path, format!("a list for '{}={}'", field, value)))?;
            let matches: Vec<usize> = list
                .iter()
                .enumerate()
                .filter(|(_, item)| field_matches(item, field, value))
                .map(|(i, _)| i)
                .collect();
            let i = match matches.as_slice() {
                [i] => *i,
                [] if *optional => {
                    let mut item = Mapping::new();
                    item.insert(
                        Value::String(field.clone()),
                        Value::String(value.clone()),
                    );
                    list.push(Value::Mapping(item));
                    list.len() - 1
                }
                [] => {
                    return Err(not_found(
                        path,
                        format!("exactly one list item with '{}={}'", field, value),
                    ));
                }
                _ => {
                    return Err(not_found(
                        path,
                        format!(
                            "exactly one list item with '{}={}', found {}",
                            field,
                            value,
                            matches.len()
                        ),
                    ));
                }
            };
            list.get_mut(i)
                .ok_or_else(|| not_found(path, format!("list item '{}={}'", field, value)))
        }
    }
}

/// Walk to the parent of the last segment
fn walk_to_parent<'a, 'p>(
    doc: &'a mut Value,
    path: &'p PatchPath,
) -> Result<(&'a mut Value, &'p PathSegment)> {
    let segments = path.segments();
    let (last, init) = segments
        .split_last()
        .ok_or_else(|| not_found(path, "a non-root path".to_string()))?;

    let mut node = doc;
    for (i, segment) in init.iter().enumerate() {
        let next = segments.get(i + 1).unwrap_or(last);
        node = descend(node, segment, next, path)?;
    }
    Ok((node, last))
}

fn replace(doc: &mut Value, path: &PatchPath, value: Value) -> Result<()> {
    if path.is_root() {
        *doc = value;
        return Ok(());
    }
    let (node, last) = walk_to_parent(doc, path)?;

    match last {
        PathSegment::Key { name, optional } => {
            if node.is_null() && *optional {
                *node = Value::Mapping(Mapping::new());
            }
            let map = node
                .as_mapping_mut()
                .ok_or_else(|| not_found(path, format!("a map at key '{}'", name)))?;
            let key = Value::String(name.clone());
            if !map.contains_key(&key) && !*optional {
                return Err(not_found(path, format!("a map key '{}'", name)));
            }
            map.insert(key, value);
        }
        PathSegment::Index { index, .. } => {
            let list = node
                .as_sequence_mut()
                .ok_or_else(|| not_found(path, format!("a list at index {}", index)))?;
            let len = list.len();
            let slot = resolve_index(*index, len)
                .and_then(|i| list.get_mut(i))
                .ok_or_else(|| not_found(path, format!("list index {} (length {})", index, len)))?;
            *slot = value;
        }
        PathSegment::Append => {
            if node.is_null() {
                *node = Value::Sequence(Vec::new());
            }
            node.as_sequence_mut()
                .ok_or_else(|| not_found(path, "a list to append to".to_string()))?
                .push(value);
        }
        PathSegment::Match {
            field,
            value: expected,
            optional,
        } => {
            if node.is_null() && *optional {
                *node = Value::Sequence(Vec::new());
            }
            let list = node
                .as_sequence_mut()
                .ok_or_else(|| not_found(path, format!("a list for '{}={}'", field, expected)))?;
            let matches: Vec<usize> = list
                .iter()
                .enumerate()
                .filter(|(_, item)| field_matches(item, field, expected))
                .map(|(i, _)| i)
                .collect();
            match matches.as_slice() {
                [i] => {
                    if let Some(slot) = list.get_mut(*i) {
                        *slot = value;
                    }
                }
                [] if *optional => list.push(value),
                _ => {
                    return Err(not_found(
                        path,
                        format!(
                            "exactly one list item with '{}={}', found {}",
                            field,
                            expected,
                            matches.len()
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn remove(doc: &mut Value, path: &PatchPath) -> Result<()> {
    if path.is_root() {
        return Err(not_found(path, "a non-root path to remove".to_string()));
    }
    let (node, last) = walk_to_parent(doc, path)?;

    match last {
        PathSegment::Key { name, optional } => {
            let key = Value::String(name.clone());
            let removed = node
                .as_mapping_mut()
                .and_then(|map| map.remove(&key))
                .is_some();
            if !removed && !*optional {
                return Err(not_found(path, format!("a map key '{}'", name)));
            }
        }
        PathSegment::Index { index, optional } => {
            let list = node
                .as_sequence_mut()
                .ok_or_else(|| not_found(path, format!("a list at index {}", index)))?;
            match resolve_index(*index, list.len()) {
                Some(i) => {
                    list.remove(i);
                }
                None if *optional => {}
                None => return Err(not_found(path, format!("list index {}", index))),
            }
        }
        PathSegment::Append => {
            return Err(ManifestError::InvalidPath {
                path: path.to_string(),
                reason: "cannot remove the position after the last element".to_string(),
            });
        }
        PathSegment::Match {
            field,
            value,
            optional,
        } => {
            let list = node
                .as_sequence_mut()
                .ok_or_else(|| not_found(path, format!("a list for '{}={}'", field, value)))?;
            let before = list.len();
            list.retain(|item| !field_matches(item, field, value));
            let removed = before - list.len();
            if removed == 0 && !*optional {
                return Err(not_found(
                    path,
                    format!("exactly one list item with '{}={}'", field, value),
                ));
            }
            if removed > 1 {
                return Err(not_found(
                    path,
                    format!(
                        "exactly one list item with '{}={}', found {}",
                        field, value, removed
                    ),
                ));
            }
        }
    }
    Ok(())
}
