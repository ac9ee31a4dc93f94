//! Run configuration loaded via OrthoConfig.
//!
//! Values are layered from defaults, an optional config file, `ENGAGEMENT_*`
//! environment variables and command-line flags.

use std::path::{Path, PathBuf};

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::catalogue::{WorkflowId, parse_workflow_list};
use crate::error::ConfigError;
use crate::identity::DEFAULT_PSEUDONYM_DIGITS;

const DEFAULT_EXPORTS_DIR: &str = "exports";
const DEFAULT_CATALOGUE_FILE: &str = "catalogue.json";
const DEFAULT_DICTIONARY_PATH: &str = "secrets/identities.json";
const DEFAULT_OUTPUT_DIR: &str = "output";
const DEFAULT_SECRETS_DIR: &str = "secrets";
const DEFAULT_SHARING_DIR: &str = "sharing";

/// Settings for one pseudonymisation run.
#[derive(Debug, Clone, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "ENGAGEMENT")]
pub struct Settings {
    /// Directory holding the workflow exports and subject indexes.
    pub exports_dir: Option<PathBuf>,
    /// Catalogue JSON; defaults to `catalogue.json` in the exports directory.
    pub catalogue_path: Option<PathBuf>,
    /// Identity dictionary JSON.
    pub dictionary_path: Option<PathBuf>,
    /// Directory receiving the unified analysis table.
    pub output_dir: Option<PathBuf>,
    /// Directory receiving the pseudonymised per-workflow copies.
    pub secrets_dir: Option<PathBuf>,
    /// Directory receiving the per-project sharing exports.
    pub sharing_dir: Option<PathBuf>,
    /// Comma-separated workflow ids to process; all when unset.
    pub workflows: Option<String>,
    /// Digits per newly assigned pseudonym.
    #[ortho_config(default = DEFAULT_PSEUDONYM_DIGITS)]
    pub pseudonym_digits: usize,
    /// Seed for new pseudonyms; random when unset.
    pub pseudonym_seed: Option<u64>,
    /// Skip the per-project sharing exports.
    #[ortho_config(default = false)]
    pub skip_sharing: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            exports_dir: None,
            catalogue_path: None,
            dictionary_path: None,
            output_dir: None,
            secrets_dir: None,
            sharing_dir: None,
            workflows: None,
            pseudonym_digits: DEFAULT_PSEUDONYM_DIGITS,
            pseudonym_seed: None,
            skip_sharing: false,
        }
    }
}

impl Settings {
    /// Settings rooted at `base`: exports, outputs and secrets all live in
    /// subdirectories of it.
    #[must_use]
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            exports_dir: Some(base.join(DEFAULT_EXPORTS_DIR)),
            dictionary_path: Some(base.join(DEFAULT_DICTIONARY_PATH)),
            output_dir: Some(base.join(DEFAULT_OUTPUT_DIR)),
            secrets_dir: Some(base.join(DEFAULT_SECRETS_DIR)),
            sharing_dir: Some(base.join(DEFAULT_SHARING_DIR)),
            ..Self::default()
        }
    }

    /// Return the exports directory, falling back to `exports`.
    #[must_use]
    pub fn exports_dir(&self) -> PathBuf {
        self.exports_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORTS_DIR))
    }

    /// Return the catalogue path, falling back to the exports directory.
    #[must_use]
    pub fn catalogue_path(&self) -> PathBuf {
        self.catalogue_path
            .clone()
            .unwrap_or_else(|| self.exports_dir().join(DEFAULT_CATALOGUE_FILE))
    }

    /// Return the identity dictionary path.
    #[must_use]
    pub fn dictionary_path(&self) -> PathBuf {
        self.dictionary_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DICTIONARY_PATH))
    }

    /// Return the analysis output directory.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
    }

    /// Return the directory for pseudonymised per-workflow copies.
    #[must_use]
    pub fn secrets_dir(&self) -> PathBuf {
        self.secrets_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SECRETS_DIR))
    }

    /// Return the sharing output directory.
    #[must_use]
    pub fn sharing_dir(&self) -> PathBuf {
        self.sharing_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SHARING_DIR))
    }

    /// Parses the workflow selection; `None` means every workflow.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSelection`] if an entry is not a
    /// workflow id.
    pub fn selection(&self) -> Result<Option<Vec<WorkflowId>>, ConfigError> {
        self.workflows
            .as_deref()
            .map(parse_workflow_list)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for run settings.

    use super::*;
    use std::ffi::OsString;

    use env_lock::lock_env;
    use rstest::rstest;

    const VARIABLES: [&str; 10] = [
        "ENGAGEMENT_EXPORTS_DIR",
        "ENGAGEMENT_CATALOGUE_PATH",
        "ENGAGEMENT_DICTIONARY_PATH",
        "ENGAGEMENT_OUTPUT_DIR",
        "ENGAGEMENT_SECRETS_DIR",
        "ENGAGEMENT_SHARING_DIR",
        "ENGAGEMENT_WORKFLOWS",
        "ENGAGEMENT_PSEUDONYM_DIGITS",
        "ENGAGEMENT_PSEUDONYM_SEED",
        "ENGAGEMENT_SKIP_SHARING",
    ];

    fn load_from_empty_args() -> Settings {
        Settings::load_from_iter([OsString::from("pseudonymise")]).expect("config should load")
    }

    #[rstest]
    fn default_values_are_used_when_missing() {
        let _guard = lock_env(VARIABLES.map(|name| (name, None::<String>)));

        let settings = load_from_empty_args();
        assert_eq!(settings.pseudonym_digits, DEFAULT_PSEUDONYM_DIGITS);
        assert!(!settings.skip_sharing);
        assert!(settings.pseudonym_seed.is_none());
        assert_eq!(
            settings.catalogue_path(),
            PathBuf::from("exports").join("catalogue.json")
        );
        assert_eq!(
            settings.dictionary_path(),
            PathBuf::from("secrets/identities.json")
        );
        assert_eq!(settings.selection().expect("no selection"), None);
    }

    #[rstest]
    fn environment_overrides_are_respected() {
        let _guard = lock_env([
            ("ENGAGEMENT_EXPORTS_DIR", Some("/data/exports".to_owned())),
            ("ENGAGEMENT_WORKFLOWS", Some("18504, 19279".to_owned())),
            ("ENGAGEMENT_PSEUDONYM_DIGITS", Some("6".to_owned())),
            ("ENGAGEMENT_PSEUDONYM_SEED", Some("42".to_owned())),
            ("ENGAGEMENT_SKIP_SHARING", Some("true".to_owned())),
        ]);

        let settings = load_from_empty_args();
        assert_eq!(
            settings.catalogue_path(),
            PathBuf::from("/data/exports/catalogue.json")
        );
        assert_eq!(settings.pseudonym_digits, 6);
        assert_eq!(settings.pseudonym_seed, Some(42));
        assert!(settings.skip_sharing);
        assert_eq!(
            settings.selection().expect("valid selection"),
            Some(vec![WorkflowId::new(18504), WorkflowId::new(19279)])
        );
    }

    #[test]
    fn malformed_selection_is_rejected() {
        let settings = Settings {
            workflows: Some("18504,meetings".to_owned()),
            ..Settings::default()
        };
        assert!(matches!(
            settings.selection(),
            Err(ConfigError::InvalidSelection { .. })
        ));
    }

    #[test]
    fn rooted_settings_share_a_base() {
        let settings = Settings::rooted_at(Path::new("/run"));
        assert_eq!(settings.sharing_dir(), PathBuf::from("/run/sharing"));
        assert_eq!(
            settings.catalogue_path(),
            PathBuf::from("/run/exports/catalogue.json")
        );
    }
}
