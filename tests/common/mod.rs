//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use xmlgraph::config::load_mcp_config;
use xmlgraph::index::build_index;
use xmlgraph::mcp::ToolContext;
use xmlgraph::store::Snapshot;

pub const REGISTRY_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<registry xmlns="urn:example:registry">
  <ministry code="01" name="Ministry of Interior" nmr="M-01">
    <organization code="100" name="Police" nmr="O-100" description="Public order and traffic safety"/>
  </ministry>
  <ministry code="02" nmr="M-02">
    <n>Ministry of Finance</n>
    <organization code="200" name="Tax Office" nmr="O-200">
      <docPrefix>TX</docPrefix>
      <departmentRef>LN</departmentRef>
      <departmentRef>IPD</departmentRef>
      <departmentRef>DTD</departmentRef>
    </organization>
    <organization code="201" name="Customs" nmr="O-201"/>
  </ministry>
</registry>
"#;

pub const MCP_YAML: &str = r#"version: "1.0"
server:
  name: registry-mcp
  description: Government organization registry
  instructions: Use search first, then get_entity.
sources:
  - path: data/registry.xml
    type: xml
    schema: schema/registry.xsd
    description: Ministries and their organizations
  - path: README.md
    type: markdown
"#;

pub const REGISTRY_PATH: &str = "data/registry.xml";

/// Builds a context over `xml` as the only XML source.
pub fn context_for(xml: &str) -> ToolContext {
    let config = load_mcp_config(MCP_YAML.as_bytes(), "acme/registry").unwrap();
    let files = HashMap::from([
        (REGISTRY_PATH.to_string(), xml.as_bytes().to_vec()),
        ("README.md".to_string(), b"# Registry".to_vec()),
    ]);
    let snapshot = Snapshot::from_parts("acme/registry", MCP_YAML.as_bytes(), config, files);
    let index = build_index(xml.as_bytes(), REGISTRY_PATH, &snapshot.revision).unwrap();
    ToolContext::new(Arc::new(snapshot), Arc::new(index))
}

pub fn registry_context() -> ToolContext {
    context_for(REGISTRY_XML)
}

/// Lays out `<root>/acme/registry/` with the fixture repository.
pub fn write_repo(root: &Path) {
    let repo = root.join("acme").join("registry");
    fs::create_dir_all(repo.join("data")).unwrap();
    fs::write(repo.join("mcp.yaml"), MCP_YAML).unwrap();
    fs::write(repo.join(REGISTRY_PATH), REGISTRY_XML).unwrap();
    fs::write(repo.join("README.md"), "# Registry").unwrap();
}
