//! Config hash stability: canonicalization must make the hash independent of
//! key order and merge-layer identity, while remaining sensitive to content.

use relay_config::load_layered_yaml_from_strings;

const BASE_YAML: &str = r#"
scheduler:
  lease_resource: "scheduler:run"
  claim_batch_size: 100
stores:
  - identifier: "control-plane"
    connection_string_env: "RELAY_CONTROL_PLANE_DB_URL"
    schema_name: "infra"
"#;

/// Same content as BASE_YAML but with keys in different order.
const BASE_YAML_REORDERED: &str = r#"
stores:
  - schema_name: "infra"
    connection_string_env: "RELAY_CONTROL_PLANE_DB_URL"
    identifier: "control-plane"
scheduler:
  claim_batch_size: 100
  lease_resource: "scheduler:run"
"#;

const OVERLAY_YAML: &str = r#"
scheduler:
  claim_batch_size: 250
"#;

#[test]
fn same_input_produces_identical_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    assert_eq!(a.config_hash, b.config_hash, "same YAML input must produce identical hash");
    assert_eq!(a.canonical_json, b.canonical_json, "canonical JSON must be identical for same input");
}

#[test]
fn reordered_keys_produce_same_hash() {
    let original = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let reordered = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();

    assert_eq!(
        original.config_hash, reordered.config_hash,
        "reordering keys in YAML must not change the hash (canonicalization)"
    );
    assert_eq!(
        original.canonical_json, reordered.canonical_json,
        "canonical JSON must be identical regardless of key ordering in source"
    );
}

#[test]
fn different_values_produce_different_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    let modified = r#"
scheduler:
  lease_resource: "scheduler:run"
  claim_batch_size: 500
stores:
  - identifier: "control-plane"
    connection_string_env: "RELAY_CONTROL_PLANE_DB_URL"
    schema_name: "infra"
"#;
    let b = load_layered_yaml_from_strings(&[modified]).unwrap();

    assert_ne!(a.config_hash, b.config_hash, "different config values must produce different hashes");
}

#[test]
fn merged_layers_produce_stable_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();

    assert_eq!(a.config_hash, b.config_hash, "same merge layers must produce identical hash");

    let batch_size = a
        .config_json
        .pointer("/scheduler/claim_batch_size")
        .and_then(|v| v.as_i64())
        .unwrap();
    assert_eq!(batch_size, 250, "overlay should override base claim_batch_size");
}

#[test]
fn hash_is_64_hex_chars() {
    let loaded = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    assert_eq!(loaded.config_hash.len(), 64, "SHA-256 hash should be 64 hex chars");
    assert!(loaded.config_hash.chars().all(|c| c.is_ascii_hexdigit()), "hash should contain only hex digits");
}

#[test]
fn empty_config_produces_stable_hash() {
    let a = load_layered_yaml_from_strings(&["{}"]).unwrap();
    let b = load_layered_yaml_from_strings(&["{}"]).unwrap();

    assert_eq!(a.config_hash, b.config_hash, "empty configs must produce identical hash");
}
