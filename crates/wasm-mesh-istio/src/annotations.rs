//! Sidecar annotation merging
//!
//! Istio sidecars mount the shared cache directory through the
//! `sidecar.istio.io/userVolume*` annotations. Workloads may already carry
//! their own volumes there, so the required entries are merged in and the
//! original value is kept under a backup key until the filter is removed.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use serde_json::{Map, Value};
use tracing::{debug, info};
use wasm_mesh_common::{Error, Result};

use crate::filter::CACHE_DIR;

/// Prefix of the annotation holding a pre-merge value
pub const BACKUP_ANNOTATION_PREFIX: &str = "wasm-mesh-backup.";

/// Attribute identifying an entry in a volume annotation array
const DEDUP_IDENTITY: &str = "name";

const USER_VOLUME: &str = "sidecar.istio.io/userVolume";
const USER_VOLUME_MOUNT: &str = "sidecar.istio.io/userVolumeMount";

/// Annotations every target pod template must carry
pub fn required_sidecar_annotations() -> BTreeMap<String, String> {
    let mut required = BTreeMap::new();
    required.insert(
        USER_VOLUME.to_string(),
        format!(
            r#"[{{"name":"cache-dir","hostPath":{{"path":"{}"}}}}]"#,
            CACHE_DIR
        ),
    );
    required.insert(
        USER_VOLUME_MOUNT.to_string(),
        format!(r#"[{{"mountPath":"{}","name":"cache-dir"}}]"#, CACHE_DIR),
    );
    required
}

/// Merges and reverses the required sidecar annotations
#[derive(Clone, Debug)]
pub struct AnnotationMerger {
    required: BTreeMap<String, String>,
}

impl Default for AnnotationMerger {
    fn default() -> Self {
        Self::new(required_sidecar_annotations())
    }
}

impl AnnotationMerger {
    /// Merger for an arbitrary set of JSON-array valued annotations
    pub fn new(required: BTreeMap<String, String>) -> Self {
        Self { required }
    }

    /// The annotations this merger adds
    pub fn required(&self) -> &BTreeMap<String, String> {
        &self.required
    }

    /// Merge the required annotations into `template`
    ///
    /// A key with no prior value is set directly, and a key already holding
    /// exactly the required value is left alone. Any other prior value gets
    /// the union of both arrays, deduplicated by `name`, and is saved under
    /// the backup prefix unless a backup already exists. Calling this again
    /// on a merged template changes nothing.
    pub fn apply(&self, template: &mut PodTemplateSpec) -> Result<()> {
        let annotations = template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new);

        for (key, required) in &self.required {
            let current = match annotations.get(key) {
                Some(current) if current == required => continue,
                Some(current) if !current.is_empty() => current.clone(),
                _ => {
                    annotations.insert(key.clone(), required.clone());
                    continue;
                }
            };

            let merged = merge_arrays(key, &current, required)?;
            let backup_key = format!("{}{}", BACKUP_ANNOTATION_PREFIX, key);
            if !annotations.contains_key(&backup_key) {
                annotations.insert(backup_key, current.clone());
            }
            if merged != current {
                info!(annotation = %key, before = %current, after = %merged, "merged sidecar annotation");
                annotations.insert(key.clone(), merged);
            }
        }
        Ok(())
    }

    /// Remove the required annotations and restore any backups
    pub fn remove(&self, template: &mut PodTemplateSpec) {
        let Some(annotations) = template
            .metadata
            .as_mut()
            .and_then(|m| m.annotations.as_mut())
        else {
            return;
        };

        for key in self.required.keys() {
            annotations.remove(key);
        }

        let backups: Vec<String> = annotations
            .keys()
            .filter(|k| k.starts_with(BACKUP_ANNOTATION_PREFIX))
            .cloned()
            .collect();
        for backup_key in backups {
            if let Some(value) = annotations.remove(&backup_key) {
                let key = &backup_key[BACKUP_ANNOTATION_PREFIX.len()..];
                debug!(annotation = %key, "restoring backed up annotation");
                annotations.insert(key.to_string(), value);
            }
        }

        if annotations.is_empty() {
            if let Some(meta) = template.metadata.as_mut() {
                meta.annotations = None;
            }
        }
    }
}

/// Union of two JSON arrays of objects; `required` entries whose `name` is
/// already present in `current` are skipped
fn merge_arrays(key: &str, current: &str, required: &str) -> Result<String> {
    let parse = |raw: &str| -> Result<Vec<Map<String, Value>>> {
        serde_json::from_str(raw).map_err(|e| {
            Error::validation_for_field(
                key,
                format!("annotation {} is not a JSON array of objects: {}", key, e),
            )
        })
    };

    let mut merged = parse(current)?;
    let required = parse(required)?;
    let originals = merged.len();
    for entry in required {
        let identity = entry.get(DEDUP_IDENTITY);
        let exists = merged[..originals]
            .iter()
            .any(|existing| existing.get(DEDUP_IDENTITY) == identity);
        if !exists {
            merged.push(entry);
        }
    }
    if merged.len() == originals {
        return Ok(current.to_string());
    }
    serde_json::to_string(&merged)
        .map_err(|e| Error::serialization_for_kind("annotation", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use wasm_mesh_common::ErrorCategory;

    fn template(annotations: &[(&str, &str)]) -> PodTemplateSpec {
        let annotations: BTreeMap<String, String> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                annotations: if annotations.is_empty() {
                    None
                } else {
                    Some(annotations)
                },
                ..Default::default()
            }),
            spec: None,
        }
    }

    fn annotations(t: &PodTemplateSpec) -> BTreeMap<String, String> {
        t.metadata
            .as_ref()
            .and_then(|m| m.annotations.clone())
            .unwrap_or_default()
    }

    #[test]
    fn sets_missing_annotations_without_backup() {
        let mut t = template(&[("team", "bookinfo")]);
        AnnotationMerger::default().apply(&mut t).unwrap();

        let a = annotations(&t);
        assert_eq!(a.len(), 3);
        assert_eq!(a[USER_VOLUME], required_sidecar_annotations()[USER_VOLUME]);
        assert!(!a.keys().any(|k| k.starts_with(BACKUP_ANNOTATION_PREFIX)));
    }

    #[test]
    fn required_values_point_at_cache_dir() {
        let required = required_sidecar_annotations();
        assert_eq!(
            required[USER_VOLUME],
            r#"[{"name":"cache-dir","hostPath":{"path":"/var/local/lib/wasm-cache"}}]"#
        );
        assert_eq!(
            required[USER_VOLUME_MOUNT],
            r#"[{"mountPath":"/var/local/lib/wasm-cache","name":"cache-dir"}]"#
        );
    }

    #[test]
    fn merges_existing_value_and_keeps_backup() {
        let existing = r#"[{"name":"certs","secret":{"secretName":"tls"}}]"#;
        let mut t = template(&[(USER_VOLUME, existing)]);
        AnnotationMerger::default().apply(&mut t).unwrap();

        let a = annotations(&t);
        assert_eq!(a[&format!("{}{}", BACKUP_ANNOTATION_PREFIX, USER_VOLUME)], existing);
        let merged: Vec<Value> = serde_json::from_str(&a[USER_VOLUME]).unwrap();
        let names: Vec<&str> = merged.iter().filter_map(|v| v["name"].as_str()).collect();
        assert_eq!(names, vec!["certs", "cache-dir"]);
    }

    #[test]
    fn apply_is_idempotent() {
        let existing = r#"[{"name":"certs","secret":{"secretName":"tls"}}]"#;
        let mut t = template(&[(USER_VOLUME, existing)]);
        let merger = AnnotationMerger::default();
        merger.apply(&mut t).unwrap();
        let once = annotations(&t);
        merger.apply(&mut t).unwrap();
        assert_eq!(annotations(&t), once);
    }

    #[test]
    fn existing_entry_with_same_name_is_not_duplicated() {
        let existing = r#"[{"name":"cache-dir","hostPath":{"path":"/elsewhere"}}]"#;
        let mut t = template(&[(USER_VOLUME, existing)]);
        AnnotationMerger::default().apply(&mut t).unwrap();
        assert_eq!(annotations(&t)[USER_VOLUME], existing);
    }

    #[test]
    fn reapply_on_fresh_template_adds_no_backup() {
        let mut t = template(&[]);
        let merger = AnnotationMerger::default();
        merger.apply(&mut t).unwrap();
        merger.apply(&mut t).unwrap();
        assert_eq!(annotations(&t), required_sidecar_annotations());
    }

    #[test]
    fn remove_restores_pre_apply_state() {
        let original = [
            ("team", "bookinfo"),
            (USER_VOLUME, r#"[{"name":"certs","secret":{"secretName":"tls"}}]"#),
        ];
        let mut t = template(&original);
        let before = annotations(&t);

        let merger = AnnotationMerger::default();
        merger.apply(&mut t).unwrap();
        assert_ne!(annotations(&t), before);
        merger.remove(&mut t);
        assert_eq!(annotations(&t), before);
    }

    #[test]
    fn value_equal_to_required_is_not_backed_up_and_is_removed() {
        let required = required_sidecar_annotations();
        let mut t = template(&[("team", "bookinfo"), (USER_VOLUME, &required[USER_VOLUME])]);

        let merger = AnnotationMerger::default();
        merger.apply(&mut t).unwrap();
        assert!(!annotations(&t).keys().any(|k| k.starts_with(BACKUP_ANNOTATION_PREFIX)));

        merger.remove(&mut t);
        let a = annotations(&t);
        assert!(!a.contains_key(USER_VOLUME));
        assert_eq!(a.len(), 1);
        assert_eq!(a["team"], "bookinfo");
    }

    #[test]
    fn remove_on_unannotated_template_clears_map() {
        let mut t = template(&[]);
        let merger = AnnotationMerger::default();
        merger.apply(&mut t).unwrap();
        merger.remove(&mut t);
        assert!(t.metadata.unwrap().annotations.is_none());

        let mut bare = PodTemplateSpec::default();
        merger.remove(&mut bare);
        assert!(bare.metadata.is_none());
    }

    #[test]
    fn malformed_existing_value_is_validation_error() {
        let mut t = template(&[(USER_VOLUME_MOUNT, "not json")]);
        let err = AnnotationMerger::default().apply(&mut t).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(err.to_string().contains(USER_VOLUME_MOUNT));
    }

    #[test]
    fn empty_existing_value_is_replaced() {
        let mut t = template(&[(USER_VOLUME, "")]);
        AnnotationMerger::default().apply(&mut t).unwrap();
        let a = annotations(&t);
        assert_eq!(a[USER_VOLUME], required_sidecar_annotations()[USER_VOLUME]);
        assert!(!a.contains_key(&format!("{}{}", BACKUP_ANNOTATION_PREFIX, USER_VOLUME)));
    }
}
