mod common;

use common::REGISTRY_XML;
use xmlgraph::errors::XmlGraphError;
use xmlgraph::index::build_index;

#[test]
fn test_entity_count_matches_coded_elements() {
    let index = build_index(REGISTRY_XML.as_bytes(), "registry.xml", "rev").unwrap();
    assert_eq!(index.stats.total_entities, 5);
    assert_eq!(index.len(), 5);
    assert_eq!(index.stats.type_counts.get("ministry"), Some(&2));
    assert_eq!(index.stats.type_counts.get("organization"), Some(&3));
}

#[test]
fn test_elements_without_code_are_not_entities() {
    let xml = br#"<root><section><ministry code="01"/></section><ministry/></root>"#;
    let index = build_index(xml, "t.xml", "rev").unwrap();
    assert_eq!(index.len(), 1);
    assert!(index.get("ministry:01").unwrap().is_root());
}

#[test]
fn test_namespace_prefix_is_transparent() {
    let plain = build_index(
        br#"<root><organization code="1" name="A"/></root>"#,
        "a.xml",
        "rev",
    )
    .unwrap();
    let prefixed = build_index(
        br#"<ns:root xmlns:ns="urn:x"><ns:organization code="1" ns:name="A"/></ns:root>"#,
        "b.xml",
        "rev",
    )
    .unwrap();

    let a = plain.get("organization:1").unwrap();
    let b = prefixed.get("organization:1").unwrap();
    assert_eq!(b.entity_type, "organization");
    assert_eq!(a.name, b.name);
    assert_eq!(a.attributes, b.attributes);
}

#[test]
fn test_name_precedence() {
    let xml = br#"<r>
        <org code="1" name="X"><n>Y</n></org>
        <org code="2"><n>Y</n></org>
        <org code="3"><name>Z</name></org>
        <org code="4"/>
    </r>"#;
    let index = build_index(xml, "t.xml", "rev").unwrap();
    assert_eq!(index.get("org:1").unwrap().name, "X");
    assert_eq!(index.get("org:2").unwrap().name, "Y");
    assert_eq!(index.get("org:3").unwrap().name, "Z");
    assert_eq!(index.get("org:4").unwrap().name, "");
}

#[test]
fn test_repeated_children_fold_into_one_attribute() {
    let index = build_index(REGISTRY_XML.as_bytes(), "registry.xml", "rev").unwrap();
    let tax = index.get("organization:200").unwrap();
    assert_eq!(tax.attribute("departmentRef"), Some("LN, IPD, DTD"));
    assert_eq!(tax.attribute("docPrefix"), Some("TX"));
}

#[test]
fn test_parent_links_and_children() {
    let index = build_index(REGISTRY_XML.as_bytes(), "registry.xml", "rev").unwrap();
    let finance = index.get("ministry:02").unwrap();
    assert_eq!(finance.name, "Ministry of Finance");
    assert_eq!(finance.children, vec!["organization:200", "organization:201"]);
    assert_eq!(
        index.get("organization:201").unwrap().parent_id,
        "ministry:02"
    );

    let children: Vec<&str> = index
        .children_of("ministry:02")
        .iter()
        .map(|e| e.id.as_str())
        .collect();
    assert_eq!(children, vec!["organization:200", "organization:201"]);
    assert_eq!(index.top_level_types(), vec!["ministry"]);
}

#[test]
fn test_indexing_is_deterministic() {
    let a = build_index(REGISTRY_XML.as_bytes(), "registry.xml", "rev").unwrap();
    let b = build_index(REGISTRY_XML.as_bytes(), "registry.xml", "rev").unwrap();
    assert_eq!(a.stats, b.stats);
    assert_eq!(a.by_type, b.by_type);

    let mut ids_a: Vec<_> = a.entities.keys().collect();
    let mut ids_b: Vec<_> = b.entities.keys().collect();
    ids_a.sort();
    ids_b.sort();
    assert_eq!(ids_a, ids_b);
}

#[test]
fn test_empty_document_yields_empty_index() {
    let index = build_index(b"", "empty.xml", "rev").unwrap();
    assert!(index.is_empty());
    assert_eq!(index.stats.total_entities, 0);
}

#[test]
fn test_malformed_document_reports_path() {
    let err = build_index(b"<root><a code=\"1\"></root>", "bad.xml", "rev").unwrap_err();
    match err {
        XmlGraphError::Xml { path, .. } => assert_eq!(path, "bad.xml"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_search_finds_attribute_values() {
    let index = build_index(REGISTRY_XML.as_bytes(), "registry.xml", "rev").unwrap();
    let hits = index.search_entities("TRAFFIC", 10);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "organization:100");
}

#[test]
fn test_search_matches_name_and_id() {
    let index = build_index(REGISTRY_XML.as_bytes(), "registry.xml", "rev").unwrap();
    let by_name: Vec<&str> = index
        .search_entities("ministry of", 10)
        .iter()
        .map(|e| e.id.as_str())
        .collect();
    assert_eq!(by_name, vec!["ministry:01", "ministry:02"]);

    assert_eq!(index.search_entities("organization:2", 1).len(), 1);
}

#[test]
fn test_search_without_matches_is_empty() {
    let index = build_index(REGISTRY_XML.as_bytes(), "registry.xml", "rev").unwrap();
    assert!(index.search_entities("no such thing", 10).is_empty());
}
