//! A hierarchical data dictionary addressed by dotted paths.
//!
//! `Dict` is the container a protocol automaton fills as it parses: keys
//! are paths like `a.b.c`, list elements are addressed `l[3]`, and index
//! expressions may reference other values in the same dictionary
//! (`l[a.b+c-1].d`). Setting a path auto-creates intermediate
//! dictionaries, and assigning a plain mapping converts it recursively.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod path;
mod value;

pub use path::{Path, Step};
pub use value::Value;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("invalid path {path:?}: {reason}")]
    Parse { path: String, reason: String },

    #[error("key {path:?} not found")]
    NotFound { path: String },

    #[error("cannot traverse {step:?} in {path:?}: not a dictionary")]
    NotADict { path: String, step: String },

    #[error("value at {path:?} is not subscriptable")]
    NotSubscriptable { path: String },

    #[error("list index {index} out of range")]
    IndexOutOfRange { index: i64 },

    #[error("index term {path:?} is not an integer")]
    IndexNotInteger { path: String },

    #[error("cannot remove {path:?} (partial key)")]
    PartialKey { path: String },

    #[error("expected {expected} at {path:?}")]
    WrongType { path: String, expected: &'static str },
}

/// An ordered mapping from key to [`Value`]. Iteration over keys (and
/// hence over [`Dict::leaves`]) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dict(BTreeMap<String, Value>);

impl Dict {
    pub fn new() -> Dict {
        Dict(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Direct (single-key, unparsed) entry iteration.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Fetch the value at `path`. A nested dictionary is itself a value.
    pub fn get(&self, path: &str) -> Result<&Value, Error> {
        let steps = Path::parse(path)?.canonical();
        if steps.is_empty() {
            // Path was all back-references; the root itself is not a value.
            return Err(Error::NotFound {
                path: path.to_string(),
            });
        }
        let indexes = Path::resolve_indexes(&steps, self)?;

        let mut dict = self;
        let last = steps.len() - 1;
        for (i, (step, idxs)) in steps.iter().zip(&indexes).enumerate() {
            let Step::Key { name, .. } = step else { continue };
            let mut at = dict.0.get(name).ok_or_else(|| Error::NotFound {
                path: path.to_string(),
            })?;
            for &ix in idxs {
                let list = at.as_list().ok_or_else(|| Error::NotSubscriptable {
                    path: path.to_string(),
                })?;
                at = list.get(ix).ok_or(Error::IndexOutOfRange { index: ix as i64 })?;
            }
            if i == last {
                return Ok(at);
            }
            dict = at.as_dict().ok_or_else(|| Error::NotADict {
                path: path.to_string(),
                step: match &steps[i + 1] {
                    Step::Key { name, .. } => name.clone(),
                    Step::Parent => String::new(),
                },
            })?;
        }
        unreachable!("loop returns at the last step")
    }

    /// `get`, with lookup failures flattened to `None`.
    pub fn get_opt(&self, path: &str) -> Option<&Value> {
        self.get(path).ok()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    pub fn get_mut(&mut self, path: &str) -> Result<&mut Value, Error> {
        let steps = Path::parse(path)?.canonical();
        if steps.is_empty() {
            return Err(Error::NotFound {
                path: path.to_string(),
            });
        }
        let indexes = Path::resolve_indexes(&steps, self)?;

        let mut dict = self;
        let last = steps.len() - 1;
        for (i, (step, idxs)) in steps.iter().zip(&indexes).enumerate() {
            let Step::Key { name, .. } = step else { continue };
            let mut at = dict.0.get_mut(name).ok_or_else(|| Error::NotFound {
                path: path.to_string(),
            })?;
            for &ix in idxs {
                let list = at.as_list_mut().ok_or_else(|| Error::NotSubscriptable {
                    path: path.to_string(),
                })?;
                at = list.get_mut(ix).ok_or(Error::IndexOutOfRange { index: ix as i64 })?;
            }
            if i == last {
                return Ok(at);
            }
            dict = at.as_dict_mut().ok_or_else(|| Error::NotADict {
                path: path.to_string(),
                step: match &steps[i + 1] {
                    Step::Key { name, .. } => name.clone(),
                    Step::Parent => String::new(),
                },
            })?;
        }
        unreachable!("loop returns at the last step")
    }

    /// Store `value` at `path`, creating intermediate dictionaries as
    /// needed. Index steps must resolve to existing list elements; lists
    /// are never extended by assignment. Mappings (nested `Dict` values,
    /// possibly with dotted keys of their own) are converted recursively.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<(), Error> {
        let steps = Path::parse(path)?.canonical();
        if steps.is_empty() {
            return Err(Error::Parse {
                path: path.to_string(),
                reason: "empty path".to_string(),
            });
        }
        let indexes = Path::resolve_indexes(&steps, self)?;
        let value = convert(value.into());

        let (last, walk) = steps.split_last().expect("steps is non-empty");
        let (last_idxs, walk_idxs) = indexes.split_last().expect("indexes matches steps");

        let mut dict: &mut Dict = self;
        for (step, idxs) in walk.iter().zip(walk_idxs) {
            let Step::Key { name, .. } = step else { continue };
            if idxs.is_empty() {
                let entry = dict
                    .0
                    .entry(name.clone())
                    .or_insert_with(|| Value::Dict(Dict::new()));
                dict = entry.as_dict_mut().ok_or_else(|| Error::NotADict {
                    path: path.to_string(),
                    step: name.clone(),
                })?;
            } else {
                // Indexed traversal descends only through existing values.
                let mut v = dict.0.get_mut(name).ok_or_else(|| Error::NotFound {
                    path: path.to_string(),
                })?;
                for &ix in idxs {
                    let list = v.as_list_mut().ok_or_else(|| Error::NotSubscriptable {
                        path: path.to_string(),
                    })?;
                    v = list.get_mut(ix).ok_or(Error::IndexOutOfRange { index: ix as i64 })?;
                }
                dict = v.as_dict_mut().ok_or_else(|| Error::NotADict {
                    path: path.to_string(),
                    step: name.clone(),
                })?;
            }
        }

        let Step::Key { name, .. } = last else {
            return Err(Error::Parse {
                path: path.to_string(),
                reason: "path ends in a back-reference".to_string(),
            });
        };
        if last_idxs.is_empty() {
            dict.0.insert(name.clone(), value);
        } else {
            let mut v = dict.0.get_mut(name).ok_or_else(|| Error::NotFound {
                path: path.to_string(),
            })?;
            let (final_ix, descend) = last_idxs.split_last().expect("last_idxs is non-empty");
            for &ix in descend {
                let list = v.as_list_mut().ok_or_else(|| Error::NotSubscriptable {
                    path: path.to_string(),
                })?;
                v = list.get_mut(ix).ok_or(Error::IndexOutOfRange { index: ix as i64 })?;
            }
            let list = v.as_list_mut().ok_or_else(|| Error::NotSubscriptable {
                path: path.to_string(),
            })?;
            let slot = list
                .get_mut(*final_ix)
                .ok_or(Error::IndexOutOfRange { index: *final_ix as i64 })?;
            *slot = value;
        }
        Ok(())
    }

    /// Insert `default` at `path` unless something is already there;
    /// in either case, no value is returned (use `get` to read back).
    pub fn set_default(&mut self, path: &str, default: impl Into<Value>) -> Result<(), Error> {
        if !self.contains(path) {
            self.set(path, default)?;
        }
        Ok(())
    }

    /// Delete the entry at `path`. An intermediate node may only be
    /// removed once its subtree is empty; use [`Dict::pop`] to remove a
    /// subtree wholesale.
    pub fn remove(&mut self, path: &str) -> Result<(), Error> {
        let parent = self.parent_of(path)?;
        let (dict, name) = parent;
        match dict.0.get(&name) {
            None => {
                return Err(Error::NotFound {
                    path: path.to_string(),
                })
            }
            Some(Value::Dict(d)) if !d.is_empty() => {
                return Err(Error::PartialKey {
                    path: path.to_string(),
                })
            }
            Some(_) => {}
        }
        dict.0.remove(&name);
        Ok(())
    }

    /// Remove and return the value at `path`, subtree or not.
    pub fn pop(&mut self, path: &str) -> Result<Value, Error> {
        let (dict, name) = self.parent_of(path)?;
        dict.0.remove(&name).ok_or_else(|| Error::NotFound {
            path: path.to_string(),
        })
    }

    fn parent_of(&mut self, path: &str) -> Result<(&mut Dict, String), Error> {
        let steps = Path::parse(path)?.canonical();
        let Some((last, walk)) = steps.split_last() else {
            return Err(Error::Parse {
                path: path.to_string(),
                reason: "empty path".to_string(),
            });
        };
        let Step::Key { name, indexes } = last else {
            return Err(Error::Parse {
                path: path.to_string(),
                reason: "path ends in a back-reference".to_string(),
            });
        };
        if !indexes.is_empty() {
            return Err(Error::Parse {
                path: path.to_string(),
                reason: "cannot remove a list element".to_string(),
            });
        }
        let mut dict: &mut Dict = self;
        for step in walk {
            let Step::Key { name, .. } = step else { continue };
            dict = dict
                .0
                .get_mut(name)
                .and_then(Value::as_dict_mut)
                .ok_or_else(|| Error::NotFound {
                    path: path.to_string(),
                })?;
        }
        Ok((dict, name.clone()))
    }

    /// Fully-qualified paths of every leaf, in deterministic (sorted)
    /// order. Empty nested dictionaries count as leaves; lists do not
    /// recurse.
    pub fn leaves(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.leaves_into("", &mut out);
        out
    }

    fn leaves_into(&self, prefix: &str, out: &mut Vec<String>) {
        for (k, v) in &self.0 {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            match v {
                Value::Dict(d) if !d.is_empty() => d.leaves_into(&path, out),
                _ => out.push(path),
            }
        }
    }

    // Typed accessors: protocol layers read fields they've parsed, and an
    // absent or mistyped field is a protocol error, not a panic.

    pub fn get_int(&self, path: &str) -> Result<i64, Error> {
        self.get(path)?.as_int().ok_or(Error::WrongType {
            path: path.to_string(),
            expected: "integer",
        })
    }

    pub fn get_real(&self, path: &str) -> Result<f64, Error> {
        self.get(path)?.as_real().ok_or(Error::WrongType {
            path: path.to_string(),
            expected: "real",
        })
    }

    pub fn get_str(&self, path: &str) -> Result<&str, Error> {
        self.get(path)?.as_str().ok_or(Error::WrongType {
            path: path.to_string(),
            expected: "string",
        })
    }

    pub fn get_bytes(&self, path: &str) -> Result<&[u8], Error> {
        self.get(path)?.as_bytes().ok_or(Error::WrongType {
            path: path.to_string(),
            expected: "bytes",
        })
    }

    pub fn get_list(&self, path: &str) -> Result<&Vec<Value>, Error> {
        self.get(path)?.as_list().ok_or(Error::WrongType {
            path: path.to_string(),
            expected: "list",
        })
    }

    pub fn get_dict(&self, path: &str) -> Result<&Dict, Error> {
        self.get(path)?.as_dict().ok_or(Error::WrongType {
            path: path.to_string(),
            expected: "dictionary",
        })
    }
}

/// Recursively convert nested dictionaries whose keys may themselves be
/// dotted paths, and the elements of lists.
fn convert(value: Value) -> Value {
    match value {
        Value::Dict(d) => {
            let mut out = Dict::new();
            for (k, v) in d.0 {
                let _ = out.set(&k, convert(v));
            }
            Value::Dict(out)
        }
        Value::List(l) => Value::List(l.into_iter().map(convert).collect()),
        v => v,
    }
}

impl From<serde_json::Value> for Dict {
    fn from(v: serde_json::Value) -> Self {
        match Value::from(v) {
            Value::Dict(d) => d,
            _ => Dict::new(),
        }
    }
}

impl fmt::Display for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let j = serde_json::Value::Object(
            self.entries()
                .map(|(k, v)| (k.to_string(), serde_json::Value::from(v)))
                .collect(),
        );
        write!(f, "{j}")
    }
}
