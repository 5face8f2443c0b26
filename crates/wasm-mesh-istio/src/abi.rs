//! ABI compatibility between filter binaries and Istio releases

use std::collections::BTreeMap;

use wasm_mesh_common::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Decides whether a filter built against some ABI versions can run on a
/// control-plane version
#[cfg_attr(test, automock)]
pub trait AbiRegistry: Send + Sync {
    /// Ok if any of `abi_versions` is supported by `istio_version`
    fn validate(&self, abi_versions: &[String], istio_version: &str) -> Result<()>;
}

/// Known ABI versions per Istio `major.minor` line
#[derive(Clone, Debug)]
pub struct DefaultAbiRegistry {
    supported: BTreeMap<String, Vec<String>>,
}

impl Default for DefaultAbiRegistry {
    fn default() -> Self {
        let v0_2_1 = vec!["v0.2.1".to_string()];
        let mut supported = BTreeMap::new();
        supported.insert(
            "1.5".to_string(),
            vec!["v0-541b2c1155fffb15ccde92b8324f3e38f7339ba6".to_string()],
        );
        supported.insert(
            "1.6".to_string(),
            vec![
                "v0-097b7f2e4cc1fb490cc1943d0d633655ac3c522f".to_string(),
                "v0-4689a30309abf31aee9ae36e73d34b1bb182685f".to_string(),
            ],
        );
        supported.insert("1.7".to_string(), v0_2_1.clone());
        supported.insert("1.8".to_string(), v0_2_1.clone());
        supported.insert("1.9".to_string(), v0_2_1);
        Self { supported }
    }
}

impl DefaultAbiRegistry {
    /// Add or replace the ABI versions supported by a release line
    pub fn with_line(mut self, line: impl Into<String>, abi_versions: Vec<String>) -> Self {
        self.supported.insert(line.into(), abi_versions);
        self
    }
}

/// `major.minor` of a dotted version, tolerating a leading `v`
fn release_line(version: &str) -> Option<String> {
    let mut parts = version.trim().trim_start_matches('v').split('.');
    let major = parts.next().filter(|p| !p.is_empty())?;
    let minor = parts.next().filter(|p| !p.is_empty())?;
    Some(format!("{}.{}", major, minor))
}

impl AbiRegistry for DefaultAbiRegistry {
    fn validate(&self, abi_versions: &[String], istio_version: &str) -> Result<()> {
        let line = release_line(istio_version).ok_or_else(|| {
            Error::validation_for_field(
                "istioVersion",
                format!("cannot parse istio version {:?}", istio_version),
            )
        })?;
        let supported = self.supported.get(&line).ok_or_else(|| {
            Error::validation(format!("istio {} is not a supported release line", line))
        })?;
        if abi_versions.iter().any(|abi| supported.contains(abi)) {
            return Ok(());
        }
        Err(Error::validation(format!(
            "abi versions [{}] not in supported set [{}] for istio {}",
            abi_versions.join(", "),
            supported.join(", "),
            line
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abis(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn matches_on_release_line() {
        let registry = DefaultAbiRegistry::default();
        assert!(registry.validate(&abis(&["v0.2.1"]), "1.8.3").is_ok());
        assert!(registry.validate(&abis(&["v0.2.1"]), "v1.9.0").is_ok());
        assert!(registry
            .validate(
                &abis(&["other", "v0-4689a30309abf31aee9ae36e73d34b1bb182685f"]),
                "1.6.8"
            )
            .is_ok());
    }

    #[test]
    fn rejects_mismatched_abi() {
        let registry = DefaultAbiRegistry::default();
        let err = registry.validate(&abis(&["v0.2.1"]), "1.5.1").unwrap_err();
        assert!(err.to_string().contains("v0-541b2c1155fffb15ccde92b8324f3e38f7339ba6"));
    }

    #[test]
    fn unknown_line_is_incompatible() {
        let registry = DefaultAbiRegistry::default();
        assert!(registry.validate(&abis(&["v0.2.1"]), "1.20.0").is_err());
        assert!(registry.validate(&abis(&["v0.2.1"]), "garbage").is_err());
    }

    #[test]
    fn custom_lines_extend_the_registry() {
        let registry = DefaultAbiRegistry::default().with_line("1.10", abis(&["v0.2.1"]));
        assert!(registry.validate(&abis(&["v0.2.1"]), "1.10.2").is_ok());
    }
}
