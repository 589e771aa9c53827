use serde::{Deserialize, Serialize};

use crate::{EditPath, XmlTree};

/// A scalar leaf value changed, or a structural (container/list-entry)
/// change that carries a whole replacement subtree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum ChangeValue {
    Scalar { value: String },
    Structural,
}

#[derive(Debug, Clone)]
pub struct EditAdd {
    pub path: EditPath,
    pub subtree: XmlTree,
}

#[derive(Debug, Clone)]
pub struct EditChange {
    pub path: EditPath,
    pub value: ChangeValue,
    /// Present when `value` is `Structural`: the replacement subtree.
    pub subtree: Option<XmlTree>,
}

/// The triple `(dels, adds, changes)` from spec.md §3/§4.5, in document
/// order of the target tree.
#[derive(Debug, Clone, Default)]
pub struct EditScript {
    pub dels: Vec<EditPath>,
    pub adds: Vec<EditAdd>,
    pub changes: Vec<EditChange>,
}

impl EditScript {
    pub fn is_empty(&self) -> bool {
        self.dels.is_empty() && self.adds.is_empty() && self.changes.is_empty()
    }
}

pub fn path_to_string(path: &EditPath) -> String {
    let mut out = String::new();
    for step in path {
        out.push('/');
        out.push_str(&step.name);
        if let Some(key) = &step.key {
            out.push('[');
            for (i, (k, v)) in key.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(k);
                out.push('=');
                out.push_str(v);
            }
            out.push(']');
        }
    }
    out
}
