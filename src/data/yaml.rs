//! YAML processing utilities

use anyhow::{Context, Result};
use serde::Serialize;
use yaml_rust_davvid::YamlEmitter;

/// Serialize data structure to YAML string with proper multi-line formatting
pub fn to_yaml<T: Serialize>(data: &T) -> Result<String> {
    // First convert to serde_yaml::Value, then to yaml-rust format
    let serde_value = serde_yaml::to_value(data).context("Failed to serialize to serde value")?;
    let yaml_rust_value = convert_serde_to_yaml_rust(&serde_value)?;

    let mut output = String::new();
    let mut emitter = YamlEmitter::new(&mut output);
    emitter.multiline_strings(true);
    emitter
        .dump(&yaml_rust_value)
        .context("Failed to emit YAML")?;

    Ok(output)
}

/// Convert serde_yaml::Value to yaml_rust_davvid::Yaml
fn convert_serde_to_yaml_rust(value: &serde_yaml::Value) -> Result<yaml_rust_davvid::Yaml> {
    use yaml_rust_davvid::Yaml;

    match value {
        serde_yaml::Value::Null => Ok(Yaml::Null),
        serde_yaml::Value::Bool(b) => Ok(Yaml::Boolean(*b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Yaml::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Yaml::Real(f.to_string()))
            } else {
                Ok(Yaml::String(n.to_string()))
            }
        }
        serde_yaml::Value::String(s) => Ok(Yaml::String(s.clone())),
        serde_yaml::Value::Sequence(seq) => {
            let yaml_seq: Result<Vec<_>> = seq.iter().map(convert_serde_to_yaml_rust).collect();
            Ok(Yaml::Array(yaml_seq?))
        }
        serde_yaml::Value::Mapping(map) => {
            let mut yaml_map = yaml_rust_davvid::yaml::Hash::new();
            for (k, v) in map {
                let yaml_key = convert_serde_to_yaml_rust(k)?;
                let yaml_value = convert_serde_to_yaml_rust(v)?;
                yaml_map.insert(yaml_key, yaml_value);
            }
            Ok(Yaml::Hash(yaml_map))
        }
        serde_yaml::Value::Tagged(tagged) => convert_serde_to_yaml_rust(&tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{StatusReport, UpstreamInfo};
    use crate::git::{AheadBehind, StatusEntry, StatusFlags, StatusList};

    #[test]
    fn status_report_yaml() {
        let report = StatusReport {
            head: Some("main".to_string()),
            clean: false,
            changes: StatusList::from_iter([StatusEntry {
                path: "b.txt".to_string(),
                flags: StatusFlags {
                    wt_new: true,
                    ..StatusFlags::default()
                },
            }]),
        };
        insta::assert_snapshot!(to_yaml(&report).unwrap(), @r"
        ---
        head: main
        clean: false
        changes:
          - path: b.txt
            index_new: false
            index_modified: false
            index_deleted: false
            wt_new: true
            wt_modified: false
            wt_deleted: false
        ");
    }

    #[test]
    fn round_trips_through_serde_yaml() {
        let upstream = UpstreamInfo {
            name: "origin/main".to_string(),
            counts: AheadBehind { ahead: 3, behind: 1 },
        };
        let yaml = to_yaml(&upstream).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(value["name"].as_str(), Some("origin/main"));
        assert_eq!(value["ahead"].as_u64(), Some(3));
        assert_eq!(value["behind"].as_u64(), Some(1));
    }
}
