//! Configuration loading and validation for a [`Shell`](crate::Shell)
//!
//! Options can come from a TOML document, from the environment, or be built
//! in code. Every source goes through [`ShellOptions::validate`].

use crate::{Result, TetherError};
use schema::{ENV_CHILD_OUTPUT_DIR, ENV_PROPAGATE_CHILD_OUTPUT};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Options shared by every handle created from one shell
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ShellOptions {
    /// Copy every child's stdout/stderr to the parent's own streams
    pub propagate_child_output: bool,
    /// Record every child's stdout/stderr into files under this directory
    pub child_output_dir: Option<PathBuf>,
    /// After an error is reported, refuse further operations until
    /// [`Shell::take_errors`](crate::Shell::take_errors) is called
    pub halt_on_error: bool,
}

impl ShellOptions {
    /// Defaults overridden by `TETHER_CHILD_OUTPUT_DIR` and `TETHER_PROPAGATE_CHILD_OUTPUT`
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Ok(dir) = std::env::var(ENV_CHILD_OUTPUT_DIR) {
            if !dir.is_empty() {
                options.child_output_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(flag) = std::env::var(ENV_PROPAGATE_CHILD_OUTPUT) {
            options.propagate_child_output = parse_flag(ENV_PROPAGATE_CHILD_OUTPUT, &flag)?;
        }
        options.validate()?;
        Ok(options)
    }

    /// Validate the options and return `Result<()>` with field-path errors
    pub fn validate(&self) -> Result<()> {
        if let Some(dir) = &self.child_output_dir {
            if dir.as_os_str().is_empty() {
                return Err(TetherError::Validation(
                    "childOutputDir: cannot be empty".to_string(),
                ));
            }
            if dir.exists() && !dir.is_dir() {
                return Err(TetherError::Validation(format!(
                    "childOutputDir: {} is not a directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" => Ok(false),
        "1" | "true" | "yes" => Ok(true),
        other => Err(TetherError::Configuration(format!(
            "{}: expected a boolean, got '{}'",
            name, other
        ))),
    }
}

/// Load shell options from a TOML file path
pub fn load_options_from_toml_path(path: impl AsRef<Path>) -> Result<ShellOptions> {
    let data = fs::read_to_string(&path).map_err(|e| {
        TetherError::Configuration(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_options_from_toml_str(&data)
}

/// Load shell options from a TOML string
pub fn load_options_from_toml_str(input: &str) -> Result<ShellOptions> {
    let options: ShellOptions = toml::from_str(input)
        .map_err(|e| TetherError::Configuration(format!("TOML parse error: {}", e)))?;
    options.validate()?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let options = load_options_from_toml_str("").unwrap();
        assert_eq!(options, ShellOptions::default());
        assert!(!options.propagate_child_output);
        assert!(options.child_output_dir.is_none());
    }

    #[test]
    fn test_camel_case_fields() {
        let options = load_options_from_toml_str(
            r#"
            propagateChildOutput = true
            childOutputDir = "/tmp"
            haltOnError = true
            "#,
        )
        .unwrap();
        assert!(options.propagate_child_output);
        assert_eq!(options.child_output_dir, Some(PathBuf::from("/tmp")));
        assert!(options.halt_on_error);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = load_options_from_toml_str("propagate = true").unwrap_err();
        assert!(matches!(err, TetherError::Configuration(_)));
    }

    #[test]
    fn test_output_dir_must_be_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let options = ShellOptions {
            child_output_dir: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(TetherError::Validation(_))));

        let options = ShellOptions {
            child_output_dir: Some(PathBuf::new()),
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(TetherError::Validation(_))));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(&path, "propagateChildOutput = true\n").unwrap();
        assert!(load_options_from_toml_path(&path).unwrap().propagate_child_output);

        let missing = load_options_from_toml_path(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, TetherError::Configuration(_)));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("X", "TRUE").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(parse_flag("X", "maybe").is_err());
    }
}
