//! Record prototype tree
//!
//! A compressed vector stores records that all share one schema, the
//! prototype: a tree of structure nodes whose leaves are scalar elements.
//! Each leaf owns one bytestream in the section's data packets; the stream
//! index is simply the leaf's in-order position, so the tree is flattened
//! once at construction and every later lookup is a table scan over full
//! path names.

use crate::binding::BufferBinding;
use crate::{Error, Result};

/// Scalar element variants a prototype leaf can declare.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementType {
    /// Integer with inclusive bounds; stored bit-packed at the width of `max - min`.
    Integer { min: i64, max: i64 },
    /// Integer with bounds plus a linear mapping to its semantic value.
    ScaledInteger {
        min: i64,
        max: i64,
        scale: f64,
        offset: f64,
    },
    /// IEEE 754 single precision, stored verbatim.
    Float,
    /// IEEE 754 double precision, stored verbatim.
    Double,
    /// Length-prefixed UTF-8.
    String,
}

/// One node of the prototype tree.
#[derive(Debug, Clone)]
pub enum PrototypeNode {
    /// Scalar leaf owning a bytestream.
    Element { name: String, element: ElementType },
    /// Named container of child nodes.
    Structure {
        name: String,
        children: Vec<PrototypeNode>,
    },
}

impl PrototypeNode {
    /// Convenience constructor for a scalar leaf.
    pub fn element(name: &str, element: ElementType) -> Self {
        Self::Element {
            name: name.to_string(),
            element,
        }
    }

    /// Convenience constructor for a container node.
    pub fn structure(name: &str, children: Vec<PrototypeNode>) -> Self {
        Self::Structure {
            name: name.to_string(),
            children,
        }
    }
}

/// Flattened prototype: terminal elements in bytestream order.
#[derive(Debug, Clone)]
pub struct Prototype {
    terminals: Vec<(String, ElementType)>,
}

impl Prototype {
    /// Build a prototype from the root's children, flattening leaves in order.
    pub fn new(children: Vec<PrototypeNode>) -> Self {
        let mut terminals = Vec::new();
        for child in &children {
            flatten(child, "", &mut terminals);
        }
        Self { terminals }
    }

    /// Number of terminal elements, which equals the bytestream count.
    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }

    /// Element type of the terminal at `index`.
    pub fn terminal(&self, index: usize) -> &ElementType {
        &self.terminals[index].1
    }

    /// Resolve a path name ("cartesianX" or "/pose/x") to its bytestream
    /// index and element type.
    pub fn find_terminal(&self, path_name: &str) -> Option<(usize, &ElementType)> {
        let wanted = path_name.strip_prefix('/').unwrap_or(path_name);
        self.terminals
            .iter()
            .enumerate()
            .find(|(_, (path, _))| path == wanted)
            .map(|(index, (_, element))| (index, element))
    }

    /// Check a binding set against the prototype: every path must resolve to
    /// exactly one terminal, and no terminal may be bound twice. With
    /// `allow_missing` false every terminal must be covered.
    pub(crate) fn check_bindings(
        &self,
        bindings: &[BufferBinding],
        allow_missing: bool,
    ) -> Result<()> {
        let mut bound = vec![false; self.terminals.len()];
        for binding in bindings {
            let path = binding.path_name();
            let Some((index, _)) = self.find_terminal(&path) else {
                return Err(Error::BadApiArgument {
                    context: format!("pathName {path} does not name a prototype element"),
                });
            };
            if bound[index] {
                return Err(Error::BadApiArgument {
                    context: format!("pathName {path} bound more than once"),
                });
            }
            bound[index] = true;
        }

        if !allow_missing {
            if let Some(index) = bound.iter().position(|covered| !covered) {
                return Err(Error::BadApiArgument {
                    context: format!("prototype element {} has no buffer", self.terminals[index].0),
                });
            }
        }
        Ok(())
    }
}

fn flatten(node: &PrototypeNode, prefix: &str, terminals: &mut Vec<(String, ElementType)>) {
    match node {
        PrototypeNode::Element { name, element } => {
            terminals.push((join(prefix, name), element.clone()));
        }
        PrototypeNode::Structure { name, children } => {
            let prefix = join(prefix, name);
            for child in children {
                flatten(child, &prefix, terminals);
            }
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}
