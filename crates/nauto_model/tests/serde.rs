use nauto_model::*;
use std::collections::BTreeSet;

#[test]
fn device_round_trip() {
    let device = Device {
        name: "edge-j1".into(),
        transport: TransportParams {
            address: "10.0.0.2".into(),
            username: Some("admin".into()),
            connection_type: ConnectionType::NetconfSsh,
            port: Some(830),
        },
        enabled: true,
        credential: CredentialRef {
            name: "lab-default".into(),
        },
    };

    let yaml = serde_yaml::to_string(&device).expect("serialize device");
    let loaded: Device = serde_yaml::from_str(&yaml).expect("deserialize device");
    assert_eq!(loaded.name, "edge-j1");
    assert_eq!(loaded.transport.port, Some(830));
}

#[test]
fn capability_set_recognizes_base_and_monitoring() {
    let mut caps = BTreeSet::new();
    caps.insert("urn:ietf:params:netconf:base:1.1".to_string());
    caps.insert("urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring".to_string());
    let set = CapabilitySet(caps);

    assert!(set.supports_base_netconf());
    assert!(set.supports_base_1_1());
    assert!(set.supports_monitoring());
}

#[test]
fn transaction_notification_round_trip() {
    let notification = TransactionNotification {
        tid: TransactionId(7),
        result: TransactionState::Failed,
        reason: Some("missing mandatory leaf".into()),
    };
    let json = serde_json::to_string(&notification).expect("serialize");
    let restored: TransactionNotification = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(restored.tid, TransactionId(7));
    assert_eq!(restored.result, TransactionState::Failed);
}

#[test]
fn xml_tree_parses_and_renders() {
    let xml = "<if><name>eth0</name><mtu>1500</mtu></if>";
    let tree = XmlTree::parse(xml).expect("parse");
    let root_children = tree.children(tree.root());
    assert_eq!(root_children.len(), 1);
    let if_node = tree.node(root_children[0]);
    assert_eq!(if_node.name, "if");
    let rendered = tree.to_xml_string();
    assert!(rendered.contains("<mtu>1500</mtu>"));
}
