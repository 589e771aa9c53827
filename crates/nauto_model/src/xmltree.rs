use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::ModelError;

pub type NodeId = usize;

/// A single node in an [`XmlTree`] arena. Children/siblings are linked by
/// index rather than by pointer so the tree can be mutated freely without
/// fighting the borrow checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub namespace: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    /// Attribute names that make up this node's list key, if it is a
    /// keyed list entry. Populated by callers that know the schema shape
    /// (the real schema parser is out of scope here).
    pub list_key: Vec<String>,
    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    next_sibling: Option<NodeId>,
}

impl XmlNode {
    pub fn new(name: impl Into<String>) -> Self {
        XmlNode {
            name: name.into(),
            namespace: None,
            attributes: Vec::new(),
            text: None,
            list_key: Vec::new(),
            parent: None,
            first_child: None,
            next_sibling: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    fn leaf(name: impl Into<String>) -> Self {
        Self::new(name)
    }

    pub fn key_tuple(&self) -> Vec<(&str, &str)> {
        self.list_key
            .iter()
            .filter_map(|key| {
                self.attributes
                    .iter()
                    .find(|(name, _)| name == key)
                    .map(|(name, value)| (name.as_str(), value.as_str()))
            })
            .collect()
    }
}

/// An arena of [`XmlNode`]s rooted at index 0. Node 0 always exists and
/// represents the document root (it is never itself part of an edit path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlTree {
    nodes: Vec<XmlNode>,
}

impl Default for XmlTree {
    fn default() -> Self {
        Self::empty()
    }
}

impl XmlTree {
    pub fn empty() -> Self {
        XmlTree {
            nodes: vec![XmlNode::leaf("")],
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> &XmlNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut XmlNode {
        &mut self.nodes[id]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.nodes[id].first_child;
        while let Some(child) = cursor {
            out.push(child);
            cursor = self.nodes[child].next_sibling;
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[0].first_child.is_none()
    }

    /// Finds a direct child of `parent` by name, and (for keyed list
    /// entries) by matching key tuple.
    pub fn find_child(
        &self,
        parent: NodeId,
        name: &str,
        key: Option<&[(String, String)]>,
    ) -> Option<NodeId> {
        self.children(parent).into_iter().find(|&id| {
            let node = &self.nodes[id];
            if node.name != name {
                return false;
            }
            match key {
                None => true,
                Some(wanted) => {
                    let actual: Vec<(&str, &str)> = node.key_tuple();
                    wanted
                        .iter()
                        .all(|(k, v)| actual.iter().any(|(ak, av)| ak == k && av == v))
                }
            }
        })
    }

    /// Resolves a leaf-qualified [`EditPath`] to a node id, walking from
    /// the root one step at a time.
    pub fn resolve_path(&self, path: &[PathStep]) -> Option<NodeId> {
        let mut cursor = self.root();
        for step in path {
            let key = step
                .key
                .as_ref()
                .map(|pairs| pairs.clone())
                .unwrap_or_default();
            let key_ref = if key.is_empty() { None } else { Some(key.as_slice()) };
            cursor = self.find_child(cursor, &step.name, key_ref)?;
        }
        Some(cursor)
    }

    /// Detaches `id` from its parent's child list. The node itself stays
    /// in the arena (unreachable from the root) rather than compacting
    /// indices, which would invalidate every other stored `NodeId`.
    pub fn remove_subtree(&mut self, id: NodeId) {
        let Some(parent) = self.nodes[id].parent else {
            return;
        };
        let mut cursor = self.nodes[parent].first_child;
        let mut prev: Option<NodeId> = None;
        while let Some(current) = cursor {
            let next = self.nodes[current].next_sibling;
            if current == id {
                match prev {
                    None => self.nodes[parent].first_child = next,
                    Some(p) => self.nodes[p].next_sibling = next,
                }
                self.nodes[id].parent = None;
                self.nodes[id].next_sibling = None;
                return;
            }
            prev = Some(current);
            cursor = next;
        }
    }

    pub fn set_text(&mut self, id: NodeId, text: Option<String>) {
        self.nodes[id].text = text;
    }

    /// Appends `node` as the last child of `parent`, returning its id.
    pub fn add_child(&mut self, parent: NodeId, mut node: XmlNode) -> NodeId {
        node.parent = Some(parent);
        let id = self.nodes.len();
        self.nodes.push(node);

        match self.nodes[parent].first_child {
            None => self.nodes[parent].first_child = Some(id),
            Some(first) => {
                let mut cursor = first;
                while let Some(next) = self.nodes[cursor].next_sibling {
                    cursor = next;
                }
                self.nodes[cursor].next_sibling = Some(id);
            }
        }
        id
    }

    /// Grafts `other` (with its own root's children) under `parent`,
    /// returning the id of the new subtree's top node in `self`.
    pub fn graft(&mut self, parent: NodeId, other: &XmlTree, other_node: NodeId) -> NodeId {
        let node = other.node(other_node).clone();
        let mut node = XmlNode {
            first_child: None,
            next_sibling: None,
            parent: None,
            ..node
        };
        node.list_key = other.node(other_node).list_key.clone();
        let new_id = self.add_child(parent, std::mem::replace(&mut node, XmlNode::leaf("")));
        for child in other.children(other_node) {
            self.graft(new_id, other, child);
        }
        new_id
    }

    pub fn path_to(&self, id: NodeId) -> Vec<PathStep> {
        let mut steps = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == 0 {
                break;
            }
            let node = &self.nodes[current];
            steps.push(PathStep {
                name: node.name.clone(),
                key: if node.list_key.is_empty() {
                    None
                } else {
                    Some(
                        node.key_tuple()
                            .into_iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    )
                },
            });
            cursor = node.parent;
        }
        steps.reverse();
        steps
    }

    pub fn parse(xml: &str) -> Result<XmlTree, ModelError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut tree = XmlTree::empty();
        let mut stack = vec![tree.root()];
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf).map_err(|e| ModelError::Xml(e.to_string()))? {
                Event::Start(ref e) => {
                    let node = start_to_node(e)?;
                    let parent = *stack.last().expect("root always on stack");
                    let id = tree.add_child(parent, node);
                    stack.push(id);
                }
                Event::Empty(ref e) => {
                    let node = start_to_node(e)?;
                    let parent = *stack.last().expect("root always on stack");
                    tree.add_child(parent, node);
                }
                Event::Text(ref t) => {
                    let text = t
                        .unescape()
                        .map_err(|e| ModelError::Xml(e.to_string()))?
                        .trim()
                        .to_string();
                    if !text.is_empty() {
                        if let Some(&top) = stack.last() {
                            tree.node_mut(top).text = Some(text);
                        }
                    }
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(tree)
    }

    pub fn to_xml_string(&self) -> String {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        for child in self.children(self.root()) {
            write_node(&mut writer, self, child);
        }
        String::from_utf8(writer.into_inner().into_inner()).expect("writer emits utf8")
    }
}

fn start_to_node(e: &BytesStart) -> Result<XmlNode, ModelError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
    let mut node = XmlNode::leaf(name);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| ModelError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| ModelError::Xml(e.to_string()))?
            .to_string();
        if key == "xmlns" {
            node.namespace = Some(value);
        } else {
            node.attributes.push((key, value));
        }
    }
    Ok(node)
}

fn write_node(writer: &mut Writer<Cursor<Vec<u8>>>, tree: &XmlTree, id: NodeId) {
    let node = tree.node(id);
    let mut start = BytesStart::new(node.name.clone());
    if let Some(ns) = &node.namespace {
        start.push_attribute(("xmlns", ns.as_str()));
    }
    for (key, value) in &node.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    let children = tree.children(id);
    if children.is_empty() && node.text.is_none() {
        writer.write_event(Event::Empty(start)).expect("in-memory writer");
        return;
    }

    writer.write_event(Event::Start(start)).expect("in-memory writer");
    if let Some(text) = &node.text {
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .expect("in-memory writer");
    }
    for child in children {
        write_node(writer, tree, child);
    }
    writer
        .write_event(Event::End(BytesEnd::new(node.name.clone())))
        .expect("in-memory writer");
}

/// One step of a leaf-qualified path into an [`XmlTree`], as produced by
/// the differential edit engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub name: String,
    pub key: Option<Vec<(String, String)>>,
}

pub type EditPath = Vec<PathStep>;
