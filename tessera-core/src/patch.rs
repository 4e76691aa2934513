//! Key-path attribute patches.
//!
//! An updater is a pure `NodeAttributes -> Result<NodeAttributes, DomainError>`.
//! Its effect is captured as the JSON difference between input and output:
//!
//! ```text
//! before {name: "A", fields: {x: 1}}      after {name: "B", fields: {x: 1, y: 2}}
//!                         │
//!                         ▼
//!   Replace /name = "B"      Insert /fields/y = 2
//! ```
//!
//! Rebasing re-applies those operations on the newest attributes. Two
//! edits on disjoint paths therefore both survive, and an edit whose target
//! disappeared upstream fails with `DomainError::FieldNotFound` instead of
//! silently resurrecting or dropping data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DomainError;
use crate::model::NodeAttributes;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Add a key that was absent in the base.
    Insert { path: Vec<String>, value: Value },
    /// Overwrite a key that existed in the base.
    Replace { path: Vec<String>, value: Value },
    /// Drop a key that existed in the base.
    Remove { path: Vec<String> },
}

impl PatchOp {
    pub fn path(&self) -> &[String] {
        match self {
            PatchOp::Insert { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => {
                path
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributePatch {
    pub ops: Vec<PatchOp>,
}

impl AttributePatch {
    /// Compute the operations turning `before` into `after`.
    pub fn diff(before: &Value, after: &Value) -> Self {
        let mut ops = Vec::new();
        diff_into(&mut Vec::new(), before, after, &mut ops);
        Self { ops }
    }

    /// Patch describing what `updater` did to `attributes`.
    pub fn from_updater<F>(attributes: &NodeAttributes, updater: F) -> Result<(NodeAttributes, Self), DomainError>
    where
        F: FnOnce(NodeAttributes) -> Result<NodeAttributes, DomainError>,
    {
        let before = attributes.to_value()?;
        let updated = updater(attributes.clone())?;
        if updated.node_type() != attributes.node_type() {
            return Err(DomainError::TypeChanged {
                from: attributes.node_type().to_string(),
                to: updated.node_type().to_string(),
            });
        }
        let after = updated.to_value()?;
        Ok((updated, Self::diff(&before, &after)))
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply on top of a JSON value.
    pub fn apply(&self, target: &Value) -> Result<Value, DomainError> {
        let mut result = target.clone();
        for op in &self.ops {
            apply_op(&mut result, op)?;
        }
        Ok(result)
    }

    /// Apply on top of typed attributes, re-checking the type tag.
    pub fn apply_to(&self, attributes: &NodeAttributes) -> Result<NodeAttributes, DomainError> {
        let patched = self.apply(&attributes.to_value()?)?;
        let updated = NodeAttributes::from_value(patched)?;
        if updated.node_type() != attributes.node_type() {
            return Err(DomainError::TypeChanged {
                from: attributes.node_type().to_string(),
                to: updated.node_type().to_string(),
            });
        }
        Ok(updated)
    }

    /// Concatenate another patch after this one.
    pub fn then(mut self, other: AttributePatch) -> Self {
        self.ops.extend(other.ops);
        self
    }
}

fn diff_into(path: &mut Vec<String>, before: &Value, after: &Value, ops: &mut Vec<PatchOp>) {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            for (key, after_value) in a {
                path.push(key.clone());
                match b.get(key) {
                    None => ops.push(PatchOp::Insert {
                        path: path.clone(),
                        value: after_value.clone(),
                    }),
                    Some(before_value) if before_value != after_value => {
                        diff_into(path, before_value, after_value, ops)
                    }
                    Some(_) => {}
                }
                path.pop();
            }
            for key in b.keys().filter(|k| !a.contains_key(*k)) {
                let mut removed = path.clone();
                removed.push(key.clone());
                ops.push(PatchOp::Remove { path: removed });
            }
        }
        _ if before != after => ops.push(PatchOp::Replace {
            path: path.clone(),
            value: after.clone(),
        }),
        _ => {}
    }
}

fn apply_op(root: &mut Value, op: &PatchOp) -> Result<(), DomainError> {
    let path = op.path();
    let Some((leaf, parents)) = path.split_last() else {
        // Whole-document replacement.
        if let PatchOp::Replace { value, .. } | PatchOp::Insert { value, .. } = op {
            *root = value.clone();
        }
        return Ok(());
    };

    let parent = walk_mut(root, parents)?;
    match op {
        PatchOp::Insert { value, .. } => {
            parent.insert(leaf.clone(), value.clone());
        }
        PatchOp::Replace { value, .. } => {
            let slot = parent
                .get_mut(leaf)
                .ok_or_else(|| DomainError::FieldNotFound(path.join(".")))?;
            *slot = value.clone();
        }
        PatchOp::Remove { .. } => {
            // Already gone upstream: same end state.
            parent.remove(leaf);
        }
    }
    Ok(())
}

fn walk_mut<'a>(root: &'a mut Value, parents: &[String]) -> Result<&'a mut Map<String, Value>, DomainError> {
    let mut current = root;
    for (depth, segment) in parents.iter().enumerate() {
        current = current
            .as_object_mut()
            .and_then(|obj| obj.get_mut(segment))
            .ok_or_else(|| DomainError::FieldNotFound(parents[..=depth].join(".")))?;
    }
    current
        .as_object_mut()
        .ok_or_else(|| DomainError::FieldNotFound(parents.join(".")))
}
