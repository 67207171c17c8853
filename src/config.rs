//! Configuration for the access layer

use crate::error::{Result, SafeCareError};
use crate::model::STABLE_ID_MIN_LEN;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Store namespaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Root of per-account data (`{root}/{account}/patients/{patient}`)
    #[serde(default = "default_accounts_root")]
    pub accounts_root: String,

    /// Root of canonical patient records (`{root}/{patient}`)
    #[serde(default = "default_canonical_root")]
    pub canonical_root: String,

    /// Root of access entries (`{root}/{account}/{patient} = true`)
    #[serde(default = "default_access_root")]
    pub access_root: String,

    /// Root of government ID claims (`{root}/{normalized id} = patient`)
    #[serde(default = "default_government_id_root")]
    pub government_id_root: String,
}

fn default_accounts_root() -> String {
    "accounts".to_string()
}

fn default_canonical_root() -> String {
    "patientsGlobal".to_string()
}

fn default_access_root() -> String {
    "accessIndex".to_string()
}

fn default_government_id_root() -> String {
    "governmentIds".to_string()
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            accounts_root: default_accounts_root(),
            canonical_root: default_canonical_root(),
            access_root: default_access_root(),
            government_id_root: default_government_id_root(),
        }
    }
}

/// Display-name and legacy-identifier settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Identifiers strictly longer than this (without `@` or space) are stable account ids
    #[serde(default = "default_stable_id_min_len")]
    pub stable_id_min_len: usize,

    /// Characters of an unresolvable account id kept in its masked placeholder
    #[serde(default = "default_masked_prefix_len")]
    pub masked_prefix_len: usize,
}

fn default_stable_id_min_len() -> usize {
    STABLE_ID_MIN_LEN
}

fn default_masked_prefix_len() -> usize {
    8
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            stable_id_min_len: default_stable_id_min_len(),
            masked_prefix_len: default_masked_prefix_len(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Run one repair pass before reporting a partial (mirror) failure
    #[serde(default)]
    pub repair_on_partial_failure: bool,
}

/// Configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SafeCareError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| SafeCareError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| SafeCareError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| SafeCareError::Config(format!("{}: {}", path.as_ref().display(), e)))
    }

    /// Namespaces must be single, distinct path segments
    pub fn validate(&self) -> Result<()> {
        let roots = [
            ("paths.accounts_root", &self.paths.accounts_root),
            ("paths.canonical_root", &self.paths.canonical_root),
            ("paths.access_root", &self.paths.access_root),
            ("paths.government_id_root", &self.paths.government_id_root),
        ];
        for (key, root) in roots {
            if !crate::model::is_valid_segment(root) {
                return Err(SafeCareError::Config(format!(
                    "{key} must be a single path segment, got {root:?}"
                )));
            }
        }
        for (i, (key, root)) in roots.iter().enumerate() {
            if let Some((other, _)) = roots[i + 1..].iter().find(|(_, r)| r == root) {
                return Err(SafeCareError::Config(format!(
                    "store namespaces must be distinct: {key} and {other} are both {root:?}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.paths.canonical_root, "patientsGlobal");
        assert_eq!(config.identity.stable_id_min_len, 20);
        assert!(!config.sync.repair_on_partial_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
[paths]
canonical_root = "patients"

[identity]
masked_prefix_len = 4
"#,
        )
        .unwrap();
        assert_eq!(config.paths.canonical_root, "patients");
        assert_eq!(config.paths.access_root, "accessIndex");
        assert_eq!(config.identity.masked_prefix_len, 4);
        assert_eq!(config.identity.stable_id_min_len, 20);
    }

    #[test]
    fn test_rejects_nested_or_clashing_roots() {
        assert!(Config::from_toml("[paths]\naccess_root = \"a/b\"\n").is_err());
        assert!(Config::from_toml("[paths]\naccess_root = \"accounts\"\n").is_err());
        let clash = "[paths]\ngovernment_id_root = \"patientsGlobal\"\n";
        let err = Config::from_toml(clash).unwrap_err();
        assert!(err.to_string().contains("government_id_root"));
    }
}
