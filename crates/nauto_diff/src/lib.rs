//! The differential edit engine (spec.md §4.5): walks two configuration
//! trees in tandem in document order and produces a minimal ordered edit
//! script, then assembles that script into a single edit-config payload.

use nauto_model::{ChangeValue, EditAdd, EditChange, EditScript, NodeId, PathStep, XmlNode, XmlTree};
use nauto_schema::SchemaSetHandle;

/// Computes `(dels, adds, changes)` between `prev` and `next`. `schema` is
/// accepted for interface symmetry with spec.md §4.5 ("given two trees
/// ... plus their schema") but this core does not have a real schema
/// parser to consult (out of scope, spec.md §1) — list-entry matching
/// instead uses each node's own `list_key`, populated by whatever wrote
/// the tree.
pub fn diff(prev: &XmlTree, next: &XmlTree, _schema: &SchemaSetHandle) -> EditScript {
    let mut script = EditScript::default();
    if prev == next {
        return script;
    }
    walk(prev, next, prev.root(), next.root(), &mut Vec::new(), &mut script);
    script
}

fn step_for(tree: &XmlTree, id: NodeId) -> PathStep {
    let node = tree.node(id);
    let key = if node.list_key.is_empty() {
        None
    } else {
        Some(
            node.key_tuple()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    };
    PathStep {
        name: node.name.clone(),
        key,
    }
}

fn extract_subtree(tree: &XmlTree, id: NodeId) -> XmlTree {
    let mut fragment = XmlTree::empty();
    fragment.graft(fragment.root(), tree, id);
    fragment
}

fn walk(
    prev: &XmlTree,
    next: &XmlTree,
    prev_id: NodeId,
    next_id: NodeId,
    path: &mut Vec<PathStep>,
    script: &mut EditScript,
) {
    let prev_children = prev.children(prev_id);
    let next_children = next.children(next_id);

    let mut names: Vec<String> = Vec::new();
    for &id in &prev_children {
        let name = &prev.node(id).name;
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    for &id in &next_children {
        let name = &next.node(id).name;
        if !names.contains(name) {
            names.push(name.clone());
        }
    }

    for name in names {
        let p_group: Vec<NodeId> = prev_children
            .iter()
            .copied()
            .filter(|&id| prev.node(id).name == name)
            .collect();
        let n_group: Vec<NodeId> = next_children
            .iter()
            .copied()
            .filter(|&id| next.node(id).name == name)
            .collect();

        let is_keyed_list = p_group
            .iter()
            .any(|&id| !prev.node(id).list_key.is_empty())
            || n_group.iter().any(|&id| !next.node(id).list_key.is_empty());

        if is_keyed_list {
            diff_keyed_group(prev, next, &p_group, &n_group, path, script);
        } else {
            // Singleton container/leaf position (or an unkeyed repeated
            // element, matched positionally as a fallback).
            let max_len = p_group.len().max(n_group.len());
            for i in 0..max_len {
                match (p_group.get(i), n_group.get(i)) {
                    (Some(&p), Some(&n)) => diff_matched(prev, next, p, n, path, script),
                    (Some(&p), None) => {
                        path.push(step_for(prev, p));
                        script.dels.push(path.clone());
                        path.pop();
                    }
                    (None, Some(&n)) => {
                        path.push(step_for(next, n));
                        script.adds.push(EditAdd {
                            path: path.clone(),
                            subtree: extract_subtree(next, n),
                        });
                        path.pop();
                    }
                    (None, None) => unreachable!(),
                }
            }
        }
    }
}

fn diff_keyed_group(
    prev: &XmlTree,
    next: &XmlTree,
    p_group: &[NodeId],
    n_group: &[NodeId],
    path: &mut Vec<PathStep>,
    script: &mut EditScript,
) {
    for &p in p_group {
        let p_key = prev.node(p).key_tuple();
        let matched = n_group
            .iter()
            .find(|&&n| next.node(n).key_tuple() == p_key);
        match matched {
            Some(&n) => diff_matched(prev, next, p, n, path, script),
            None => {
                path.push(step_for(prev, p));
                script.dels.push(path.clone());
                path.pop();
            }
        }
    }
    for &n in n_group {
        let n_key = next.node(n).key_tuple();
        let existed = p_group.iter().any(|&p| prev.node(p).key_tuple() == n_key);
        if !existed {
            path.push(step_for(next, n));
            script.adds.push(EditAdd {
                path: path.clone(),
                subtree: extract_subtree(next, n),
            });
            path.pop();
        }
    }
}

fn diff_matched(
    prev: &XmlTree,
    next: &XmlTree,
    p_id: NodeId,
    n_id: NodeId,
    path: &mut Vec<PathStep>,
    script: &mut EditScript,
) {
    path.push(step_for(next, n_id));

    let prev_has_children = !prev.children(p_id).is_empty();
    let next_has_children = !next.children(n_id).is_empty();

    if prev_has_children && next_has_children {
        walk(prev, next, p_id, n_id, path, script);
    } else if !prev_has_children && !next_has_children {
        let prev_text = prev.node(p_id).text.as_deref().unwrap_or("");
        let next_text = next.node(n_id).text.as_deref().unwrap_or("");
        if prev_text != next_text {
            script.changes.push(EditChange {
                path: path.clone(),
                value: ChangeValue::Scalar {
                    value: next_text.to_string(),
                },
                subtree: None,
            });
        }
    } else {
        script.changes.push(EditChange {
            path: path.clone(),
            value: ChangeValue::Structural,
            subtree: Some(extract_subtree(next, n_id)),
        });
    }

    path.pop();
}

/// Assembles a single edit-config payload: deletes first
/// (`operation=delete`), then adds (`operation=create`), then changes
/// (`operation=merge` for scalar leaf changes, `operation=replace` for
/// structural changes). Any `prefix:name` identity-ref value found in the
/// payload gets a `xmlns:prefix` declaration on the edit's top node, so it
/// resolves against a declaration on the nearest ancestor.
pub fn render_edit_config(script: &EditScript) -> XmlTree {
    let mut tree = XmlTree::empty();
    let config = tree.add_child(tree.root(), XmlNode::new("config"));

    for path in &script.dels {
        let node = path_to_operation_node(path, "delete", None);
        splice_path(&mut tree, config, &node);
    }
    for add in &script.adds {
        let node = path_to_operation_node(&add.path, "create", Some(&add.subtree));
        splice_path(&mut tree, config, &node);
    }
    for change in &script.changes {
        let operation = match change.value {
            ChangeValue::Scalar { .. } => "merge",
            ChangeValue::Structural => "replace",
        };
        let subtree = change.subtree.as_ref();
        let text = match &change.value {
            ChangeValue::Scalar { value } => Some(value.clone()),
            ChangeValue::Structural => None,
        };
        let node = path_to_operation_node_with_text(&change.path, operation, subtree, text);
        splice_path(&mut tree, config, &node);
    }

    declare_identity_ref_prefixes(&mut tree, config);
    tree
}

struct PendingSplice {
    steps: Vec<PathStep>,
    operation: &'static str,
    subtree: Option<XmlTree>,
    text: Option<String>,
}

fn path_to_operation_node(path: &[PathStep], operation: &'static str, subtree: Option<&XmlTree>) -> PendingSplice {
    PendingSplice {
        steps: path.to_vec(),
        operation,
        subtree: subtree.cloned(),
        text: None,
    }
}

fn path_to_operation_node_with_text(
    path: &[PathStep],
    operation: &'static str,
    subtree: Option<&XmlTree>,
    text: Option<String>,
) -> PendingSplice {
    PendingSplice {
        steps: path.to_vec(),
        operation,
        subtree: subtree.cloned(),
        text,
    }
}

/// Walks `config` down the path described by `pending.steps`, creating
/// container nodes as needed, then marks the final node with the
/// `operation` attribute and (for adds/structural changes) grafts the
/// replacement subtree's children onto it.
fn splice_path(tree: &mut XmlTree, config: NodeId, pending: &PendingSplice) {
    let mut cursor = config;
    for (i, step) in pending.steps.iter().enumerate() {
        let key_attrs: Vec<(String, String)> = step.key.clone().unwrap_or_default();
        let existing = tree.find_child(
            cursor,
            &step.name,
            if key_attrs.is_empty() {
                None
            } else {
                Some(&key_attrs)
            },
        );
        let is_last = i == pending.steps.len() - 1;
        cursor = match existing {
            Some(id) => id,
            None => {
                let mut node = XmlNode::new(step.name.clone());
                node.list_key = key_attrs.iter().map(|(k, _)| k.clone()).collect();
                for (k, v) in &key_attrs {
                    node = node.with_attr(k.clone(), v.clone());
                }
                if is_last {
                    node = node.with_attr("operation", pending.operation);
                }
                tree.add_child(cursor, node)
            }
        };
    }

    if let Some(subtree) = &pending.subtree {
        for child in subtree.children(subtree.root()) {
            tree.graft(cursor, subtree, child);
        }
    }
    if let Some(text) = &pending.text {
        tree.set_text(cursor, Some(text.clone()));
    }
}

fn declare_identity_ref_prefixes(tree: &mut XmlTree, config: NodeId) {
    let mut prefixes = Vec::new();
    collect_identity_ref_prefixes(tree, config, &mut prefixes);
    prefixes.sort();
    prefixes.dedup();
    for prefix in prefixes {
        let ns = format!("urn:identity-ref:{prefix}");
        tree.node_mut(config)
            .attributes
            .push((format!("xmlns:{prefix}"), ns));
    }
}

fn collect_identity_ref_prefixes(tree: &XmlTree, id: NodeId, out: &mut Vec<String>) {
    if let Some(text) = &tree.node(id).text {
        if let Some((prefix, rest)) = text.split_once(':') {
            if !prefix.is_empty() && !rest.is_empty() && prefix.chars().all(|c| c.is_alphanumeric()) {
                out.push(prefix.to_string());
            }
        }
    }
    for child in tree.children(id) {
        collect_identity_ref_prefixes(tree, child, out);
    }
}

/// Applies `script` to `base`, returning the resulting tree. Used by
/// round-trip tests (spec.md §8 property 5) and by callers that need to
/// materialize a controller-side candidate from a script without
/// re-deriving the whole target tree.
pub fn apply_edit_script(base: &XmlTree, script: &EditScript) -> XmlTree {
    let mut result = base.clone();
    for path in &script.dels {
        if let Some(id) = result.resolve_path(path) {
            result.remove_subtree(id);
        }
    }
    for add in &script.adds {
        apply_add(&mut result, add);
    }
    for change in &script.changes {
        apply_change(&mut result, change);
    }
    result
}

fn apply_add(tree: &mut XmlTree, add: &EditAdd) {
    let Some((parent_path, last)) = add.path.split_last_parent() else {
        return;
    };
    let Some(parent_id) = tree.resolve_path(parent_path) else {
        return;
    };
    let _ = last;
    for child in add.subtree.children(add.subtree.root()) {
        tree.graft(parent_id, &add.subtree, child);
    }
}

fn apply_change(tree: &mut XmlTree, change: &EditChange) {
    let Some(id) = tree.resolve_path(&change.path) else {
        return;
    };
    match &change.value {
        ChangeValue::Scalar { value } => tree.set_text(id, Some(value.clone())),
        ChangeValue::Structural => {
            if let Some(subtree) = &change.subtree {
                let parent = tree.parent(id).expect("matched node has a parent");
                tree.remove_subtree(id);
                for child in subtree.children(subtree.root()) {
                    tree.graft(parent, subtree, child);
                }
            }
        }
    }
}

trait SplitLastParent {
    fn split_last_parent(&self) -> Option<(&[PathStep], &PathStep)>;
}

impl SplitLastParent for Vec<PathStep> {
    fn split_last_parent(&self) -> Option<(&[PathStep], &PathStep)> {
        self.split_last().map(|(last, rest)| (rest, last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nauto_model::XmlNode;
    use nauto_schema::SchemaService;

    async fn schema() -> SchemaSetHandle {
        let svc = nauto_schema::InMemorySchemaService::new();
        svc.parse(&[], std::path::Path::new("/tmp")).await.unwrap()
    }

    fn leaf_tree(mtu: &str) -> XmlTree {
        let mut tree = XmlTree::empty();
        let if_node = tree.add_child(tree.root(), XmlNode::new("if").with_attr("name", "eth0"));
        tree.node_mut(if_node).list_key = vec!["name".into()];
        let name = tree.add_child(if_node, XmlNode::new("name"));
        tree.set_text(name, Some("eth0".into()));
        let mtu_id = tree.add_child(if_node, XmlNode::new("mtu"));
        tree.set_text(mtu_id, Some(mtu.into()));
        tree
    }

    #[tokio::test]
    async fn diff_is_idempotent() {
        let tree = leaf_tree("1500");
        let script = diff(&tree, &tree, &schema().await);
        assert!(script.is_empty());
    }

    #[tokio::test]
    async fn diff_detects_scalar_leaf_change() {
        let prev = leaf_tree("1500");
        let next = leaf_tree("1400");
        let script = diff(&prev, &next, &schema().await);
        assert_eq!(script.changes.len(), 1);
        assert!(script.dels.is_empty());
        assert!(script.adds.is_empty());
        match &script.changes[0].value {
            ChangeValue::Scalar { value } => assert_eq!(value, "1400"),
            ChangeValue::Structural => panic!("expected scalar change"),
        }
    }

    #[tokio::test]
    async fn apply_diff_round_trips() {
        let prev = leaf_tree("1500");
        let next = leaf_tree("1400");
        let script = diff(&prev, &next, &schema().await);
        let applied = apply_edit_script(&prev, &script);
        assert_eq!(applied.to_xml_string(), next.to_xml_string());
    }

    #[tokio::test]
    async fn keyed_list_add_and_delete() {
        let mut prev = XmlTree::empty();
        let eth0 = prev.add_child(prev.root(), XmlNode::new("if").with_attr("name", "eth0"));
        prev.node_mut(eth0).list_key = vec!["name".into()];

        let mut next = XmlTree::empty();
        let eth1 = next.add_child(next.root(), XmlNode::new("if").with_attr("name", "eth1"));
        next.node_mut(eth1).list_key = vec!["name".into()];

        let script = diff(&prev, &next, &schema().await);
        assert_eq!(script.dels.len(), 1);
        assert_eq!(script.adds.len(), 1);
    }

    #[tokio::test]
    async fn render_edit_config_orders_dels_before_adds_before_changes() {
        let prev = leaf_tree("1500");
        let next = leaf_tree("1400");
        let script = diff(&prev, &next, &schema().await);
        let payload = render_edit_config(&script);
        let config = payload.children(payload.root())[0];
        let names: Vec<_> = payload
            .children(config)
            .into_iter()
            .map(|id| payload.node(id).name.clone())
            .collect();
        assert_eq!(names, vec!["if".to_string()]);
    }
}
