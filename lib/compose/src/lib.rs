//! Compose-document merge and per-environment override generation,
//! per spec §4.D.
//!
//! `periphery` lets `docker compose` itself merge multiple `-f`
//! files; cilo needs the merged document in hand ahead
//! of time so it can rewrite `container_name`, network attachment,
//! and `depends_on` before anything is written to disk, so the merge
//! here is performed directly over `serde_yaml_ng::Value` rather than
//! shelled out.

use std::collections::HashSet;

use serde_yaml_ng::{Mapping, Value};

/// Merge compose documents left-to-right, rightmost wins at the key
/// level. Nested mappings are merged recursively (so `services.web`
/// in a later file only overrides the keys it sets, not the whole
/// service block); any other value type — scalars, sequences — is
/// replaced outright by the later file, matching compose's own
/// override semantics for non-mapping fields.
pub fn merge_documents(docs: &[Value]) -> Value {
  docs.iter().cloned().fold(Value::Mapping(Mapping::new()), |acc, doc| {
    merge_two(acc, doc)
  })
}

fn merge_two(base: Value, overlay: Value) -> Value {
  match (base, overlay) {
    (Value::Mapping(mut base), Value::Mapping(overlay)) => {
      for (key, overlay_value) in overlay {
        let merged = match base.remove(&key) {
          Some(base_value) => merge_two(base_value, overlay_value),
          None => overlay_value,
        };
        base.insert(key, merged);
      }
      Value::Mapping(base)
    }
    (_, overlay) => overlay,
  }
}

/// Inputs needed to derive the per-environment override document.
pub struct OverrideInput<'a> {
  pub environment_name: &'a str,
  pub network_name: &'a str,
  pub subnet: &'a str,
  /// Compose service names designated shared for this environment;
  /// shared services are omitted from the override entirely (§4.H
  /// materializes them separately) and stripped from other services'
  /// `depends_on` lists.
  pub shared_services: &'a HashSet<String>,
}

/// Build the override document described in spec §4.D: per-service
/// `container_name`/network attachment/`depends_on` rewrites, plus a
/// top-level network block naming the environment's network and
/// subnet. `merged` is the already-merged user document; fields this
/// function doesn't recognize (build context, volumes, env vars, ...)
/// pass through untouched because the override only ever *adds* keys
/// to a service block — it never reconstructs one from scratch.
pub fn build_override(merged: &Value, input: &OverrideInput) -> Value {
  let mut root = Mapping::new();

  if let Some(services) = merged.get("services").and_then(Value::as_mapping)
  {
    let mut override_services = Mapping::new();
    for (name, service) in services {
      let Some(name_str) = name.as_str() else { continue };
      if input.shared_services.contains(name_str) {
        continue;
      }
      override_services.insert(
        name.clone(),
        build_service_override(
          name_str,
          service,
          input.environment_name,
          input.network_name,
          input.shared_services,
        ),
      );
    }
    root.insert(
      Value::String("services".into()),
      Value::Mapping(override_services),
    );
  }

  let mut networks = Mapping::new();
  let mut network_def = Mapping::new();
  network_def
    .insert(Value::String("external".into()), Value::Bool(false));
  let mut ipam = Mapping::new();
  let mut ipam_config = Mapping::new();
  ipam_config
    .insert(Value::String("subnet".into()), Value::String(input.subnet.into()));
  ipam.insert(
    Value::String("config".into()),
    Value::Sequence(vec![Value::Mapping(ipam_config)]),
  );
  network_def.insert(Value::String("ipam".into()), Value::Mapping(ipam));
  network_def.insert(
    Value::String("name".into()),
    Value::String(input.network_name.into()),
  );
  networks.insert(
    Value::String(input.network_name.into()),
    Value::Mapping(network_def),
  );
  root.insert(Value::String("networks".into()), Value::Mapping(networks));

  Value::Mapping(root)
}

fn build_service_override(
  service_name: &str,
  service: &Value,
  environment_name: &str,
  network_name: &str,
  shared_services: &HashSet<String>,
) -> Value {
  let mut overlay = Mapping::new();
  overlay.insert(
    Value::String("container_name".into()),
    Value::String(format!("cilo_{environment_name}_{service_name}")),
  );
  overlay.insert(
    Value::String("networks".into()),
    Value::Sequence(vec![Value::String(network_name.into())]),
  );

  if let Some(depends_on) =
    service.get("depends_on").and_then(depends_on_names)
  {
    let filtered: Vec<Value> = depends_on
      .into_iter()
      .filter(|dep| !shared_services.contains(dep))
      .map(Value::String)
      .collect();
    overlay
      .insert(Value::String("depends_on".into()), Value::Sequence(filtered));
  }

  Value::Mapping(overlay)
}

/// Services the merged document itself marks shared via a `cilo.share`
/// label, per spec §9's "shared set = labelled ∪ --share − --isolate".
/// Labels may be the list form (`- cilo.share=true`, bare `cilo.share`)
/// or the mapping form (`cilo.share: "true"`).
pub fn labelled_shared_services(merged: &Value) -> HashSet<String> {
  let mut result = HashSet::new();
  let Some(services) = merged.get("services").and_then(Value::as_mapping) else {
    return result;
  };
  for (name, service) in services {
    if let Some(name_str) = name.as_str()
      && is_labelled_shared(service)
    {
      result.insert(name_str.to_string());
    }
  }
  result
}

fn is_labelled_shared(service: &Value) -> bool {
  let Some(labels) = service.get("labels") else { return false };
  match labels {
    Value::Mapping(map) => map.iter().any(|(key, value)| {
      key.as_str() == Some("cilo.share") && label_value_is_truthy(value)
    }),
    Value::Sequence(seq) => seq.iter().any(|entry| {
      let Some(text) = entry.as_str() else { return false };
      match text.split_once('=') {
        Some(("cilo.share", value)) => {
          label_value_is_truthy(&Value::String(value.to_string()))
        }
        None => text == "cilo.share",
        _ => false,
      }
    }),
    _ => false,
  }
}

fn label_value_is_truthy(value: &Value) -> bool {
  match value {
    Value::Bool(truthy) => *truthy,
    Value::String(text) => {
      !matches!(text.to_lowercase().as_str(), "false" | "0" | "no" | "")
    }
    Value::Null => true,
    _ => true,
  }
}

/// `depends_on` is either a list of service names or a mapping of
/// name to condition; normalize both forms to a name list.
fn depends_on_names(value: &Value) -> Option<Vec<String>> {
  match value {
    Value::Sequence(seq) => {
      Some(seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
    }
    Value::Mapping(map) => Some(
      map
        .keys()
        .filter_map(|k| k.as_str().map(str::to_string))
        .collect(),
    ),
    _ => None,
  }
}

#[cfg(test)]
mod test {
  use serde_yaml_ng::from_str;

  use super::*;

  #[test]
  fn rightmost_document_overrides_leftmost_keys() {
    let base: Value = from_str(
      "services:\n  web:\n    image: app:1\n    ports:\n      - '8080:80'\n",
    )
    .unwrap();
    let overlay: Value =
      from_str("services:\n  web:\n    image: app:2\n").unwrap();
    let merged = merge_documents(&[base, overlay]);
    let web = merged.get("services").unwrap().get("web").unwrap();
    assert_eq!(web.get("image").unwrap().as_str(), Some("app:2"));
    assert!(web.get("ports").is_some());
  }

  #[test]
  fn shared_services_are_omitted_from_override() {
    let merged: Value = from_str(
      "services:\n  web:\n    image: app\n    depends_on:\n      - redis\n  redis:\n    image: redis\n",
    )
    .unwrap();
    let shared: HashSet<String> = ["redis".to_string()].into_iter().collect();
    let input = OverrideInput {
      environment_name: "dev",
      network_name: "cilo_p_dev",
      subnet: "10.224.3.0/24",
      shared_services: &shared,
    };
    let override_doc = build_override(&merged, &input);
    let services = override_doc.get("services").unwrap().as_mapping().unwrap();
    assert!(services.contains_key("web"));
    assert!(!services.contains_key("redis"));

    let web = services.get("web").unwrap();
    assert_eq!(
      web.get("container_name").unwrap().as_str(),
      Some("cilo_dev_web")
    );
    let depends_on = web.get("depends_on").unwrap().as_sequence().unwrap();
    assert!(depends_on.is_empty());
  }

  #[test]
  fn detects_cilo_share_label_in_both_forms() {
    let merged: Value = from_str(
      "services:\n  redis:\n    image: redis\n    labels:\n      - cilo.share\n  elasticsearch:\n    image: es\n    labels:\n      cilo.share: \"true\"\n  web:\n    image: app\n",
    )
    .unwrap();
    let shared = labelled_shared_services(&merged);
    assert!(shared.contains("redis"));
    assert!(shared.contains("elasticsearch"));
    assert!(!shared.contains("web"));
  }

  #[test]
  fn cilo_share_false_is_not_shared() {
    let merged: Value = from_str(
      "services:\n  redis:\n    image: redis\n    labels:\n      cilo.share: \"false\"\n",
    )
    .unwrap();
    assert!(labelled_shared_services(&merged).is_empty());
  }

  #[test]
  fn network_block_names_environment_network_and_subnet() {
    let merged: Value = from_str("services:\n  web:\n    image: app\n").unwrap();
    let shared = HashSet::new();
    let input = OverrideInput {
      environment_name: "dev",
      network_name: "cilo_p_dev",
      subnet: "10.224.3.0/24",
      shared_services: &shared,
    };
    let override_doc = build_override(&merged, &input);
    let network =
      override_doc.get("networks").unwrap().get("cilo_p_dev").unwrap();
    assert_eq!(
      network.get("name").unwrap().as_str(),
      Some("cilo_p_dev")
    );
  }
}
