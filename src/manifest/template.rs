//! `((placeholder))` interpolation
//!
//! A string that is exactly one placeholder is replaced by the variable's
//! value, keeping its structure (a certificate map stays a map). Placeholders
//! embedded in a longer string are replaced by the value rendered as text.
//! `((name.field))` selects a field of a structured value, and a leading `!`
//! (`((!name))`) is accepted and ignored.

use std::collections::BTreeSet;

use serde_yaml::{Mapping, Value};

use super::{ManifestError, Result};

/// Upper bound on re-interpolation rounds for values that expand to placeholders
const MAX_ROUNDS: usize = 8;

/// Options for a template evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluateOptions {
    /// Fail if any placeholder is left unresolved
    pub expect_all_keys: bool,
}

/// Source of variable values during interpolation
pub trait VariableLookup {
    /// Value of the variable `name`, if known
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl VariableLookup for Mapping {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl VariableLookup for std::collections::BTreeMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Chain of lookups consulted in order
pub struct Layered<'a> {
    layers: Vec<&'a dyn VariableLookup>,
}

impl<'a> Layered<'a> {
    pub fn new(layers: Vec<&'a dyn VariableLookup>) -> Self {
        Self { layers }
    }
}

impl VariableLookup for Layered<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.layers.iter().find_map(|layer| layer.lookup(name))
    }
}

/// A placeholder reference found in a string
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder {
    /// Byte range of `((...))` in the source string
    start: usize,
    end: usize,
    /// Variable name, without `!` and field path
    name: String,
    /// Field path after the first `.`
    fields: Vec<String>,
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '!')
}

fn find_placeholders(s: &str) -> Vec<Placeholder> {
    let mut found = Vec::new();
    let mut offset = 0;

    while let Some(open) = s.get(offset..).and_then(|rest| rest.find("((")) {
        let start = offset + open;
        let body_start = start + 2;
        let Some(close) = s.get(body_start..).and_then(|rest| rest.find("))")) else {
            break;
        };
        let body = s.get(body_start..body_start + close).unwrap_or_default();

        if !body.is_empty() && body.chars().all(is_name_char) {
            let reference = body.trim_start_matches('!');
            let mut parts = reference.split('.');
            let name = parts.next().unwrap_or_default().to_string();
            found.push(Placeholder {
                start,
                end: body_start + close + 2,
                name,
                fields: parts.map(str::to_string).collect(),
            });
            offset = body_start + close + 2;
        } else {
            offset = body_start;
        }
    }
    found
}

/// Names of all variables referenced anywhere in `value`
pub fn referenced_variables(value: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    walk_strings(value, &mut |s| {
        for placeholder in find_placeholders(s) {
            names.insert(placeholder.name);
        }
    });
    names
}

/// Whether `value` contains any placeholder
pub fn contains_placeholders(value: &Value) -> bool {
    !referenced_variables(value).is_empty()
}

fn walk_strings(value: &Value, f: &mut dyn FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Sequence(items) => items.iter().for_each(|item| walk_strings(item, f)),
        Value::Mapping(map) => {
            for (k, v) in map {
                walk_strings(k, f);
                walk_strings(v, f);
            }
        }
        Value::Tagged(tagged) => walk_strings(&tagged.value, f),
        _ => {}
    }
}

fn select_fields(value: Value, fields: &[String]) -> Option<Value> {
    fields
        .iter()
        .try_fold(value, |current, field| current.get(field.as_str()).cloned())
}

/// Render a value as it appears inside a larger string
fn render_inline(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

struct Interpolator<'a> {
    vars: &'a dyn VariableLookup,
    missing: BTreeSet<String>,
    changed: bool,
}

impl Interpolator<'_> {
    fn resolve(&mut self, placeholder: &Placeholder) -> Option<Value> {
        let resolved = self
            .vars
            .lookup(&placeholder.name)
            .and_then(|value| select_fields(value, &placeholder.fields));
        if resolved.is_none() {
            let reference = std::iter::once(placeholder.name.as_str())
                .chain(placeholder.fields.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(".");
            self.missing.insert(reference);
        }
        resolved
    }

    fn string(&mut self, s: &str) -> Value {
        let placeholders = find_placeholders(s);
        if placeholders.is_empty() {
            return Value::String(s.to_string());
        }

        // Whole-value placeholder keeps the variable's structure
        if let [only] = placeholders.as_slice()
            && only.start == 0
            && only.end == s.len()
        {
            return match self.resolve(only) {
                Some(value) => {
                    self.changed = true;
                    value
                }
                None => Value::String(s.to_string()),
            };
        }

        let mut out = String::with_capacity(s.len());
        let mut cursor = 0;
        for placeholder in &placeholders {
            out.push_str(s.get(cursor..placeholder.start).unwrap_or_default());
            match self.resolve(placeholder) {
                Some(value) => {
                    self.changed = true;
                    out.push_str(&render_inline(&value));
                }
                None => out.push_str(s.get(placeholder.start..placeholder.end).unwrap_or_default()),
            }
            cursor = placeholder.end;
        }
        out.push_str(s.get(cursor..).unwrap_or_default());
        Value::String(out)
    }

    fn value(&mut self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.string(s),
            Value::Sequence(items) => Value::Sequence(items.iter().map(|v| self.value(v)).collect()),
            Value::Mapping(map) => {
                let mut out = Mapping::with_capacity(map.len());
                for (k, v) in map {
                    let key = match k {
                        Value::String(s) => match self.string(s) {
                            Value::String(rendered) => Value::String(rendered),
                            other => Value::String(render_inline(&other)),
                        },
                        other => other.clone(),
                    };
                    out.insert(key, self.value(v));
                }
                Value::Mapping(out)
            }
            other => other.clone(),
        }
    }
}

/// Interpolate `vars` into `template`
///
/// Substitution repeats while values expand into further placeholders. With
/// `expect_all_keys`, any placeholder left over is an error listing every
/// missing name.
pub fn interpolate(
    template: &Value,
    vars: &dyn VariableLookup,
    options: EvaluateOptions,
) -> Result<Value> {
    let mut current = template.clone();

    for _ in 0..MAX_ROUNDS {
        let mut interpolator = Interpolator {
            vars,
            missing: BTreeSet::new(),
            changed: false,
        };
        let next = interpolator.value(&current);
        let done = !interpolator.changed;
        current = next;

        if done {
            if options.expect_all_keys && !interpolator.missing.is_empty() {
                return Err(ManifestError::MissingVariables(
                    interpolator.missing.into_iter().collect(),
                ));
            }
            return Ok(current);
        }
    }

    Err(ManifestError::InvalidVariable(
        "variables expand recursively without converging".to_string(),
    ))
}
