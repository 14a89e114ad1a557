//! The `.bsp` connection-descriptor file format.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Directory under the workspace root that holds descriptor files.
pub const CONNECTION_DIR: &str = ".bsp";

/// One `.bsp/*.json` document: how to launch a build server and what it
/// serves. Field names follow the protocol, so these files are shareable
/// with any other BSP client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub name: String,
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bsp_version: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    /// Extra environment for the launched server, layered over the real
    /// environment of this process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("descriptor is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("descriptor `{name}` has an empty argv")]
    EmptyArgv { name: String },
}

impl ConnectionDetails {
    /// Parses and validates one descriptor document.
    pub fn parse(raw: &str) -> Result<Self, DescriptorError> {
        let details: Self = serde_json::from_str(raw)?;
        details.validate()?;
        Ok(details)
    }

    /// Rejects descriptors that cannot possibly launch a server.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.argv.is_empty() {
            return Err(DescriptorError::EmptyArgv {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// The executable, i.e. `argv[0]`.
    #[must_use]
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Arguments after the executable.
    #[must_use]
    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionDetails, DescriptorError};
    use serde_json::json;

    #[test]
    fn test_parse_standard_descriptor() {
        let details = ConnectionDetails::parse(
            r#"{
                "name": "cargo-bsp",
                "argv": ["cargo-bsp"],
                "version": "0.1.0",
                "bspVersion": "2.1.0",
                "languages": ["rust"]
            }"#,
        )
        .unwrap();
        assert_eq!(details.name, "cargo-bsp");
        assert_eq!(details.program(), Some("cargo-bsp"));
        assert!(details.args().is_empty());
        assert_eq!(details.version.as_deref(), Some("0.1.0"));
        assert_eq!(details.languages, vec!["rust"]);
        assert!(details.env.is_empty());
    }

    #[test]
    fn test_version_fields_are_optional() {
        let details =
            ConnectionDetails::parse(r#"{"name": "bare", "argv": ["bare-bsp"]}"#).unwrap();
        assert!(details.version.is_none());
        assert!(details.bsp_version.is_none());

        let value = serde_json::to_value(&details).unwrap();
        assert!(value.get("version").is_none());
        assert!(value.get("bspVersion").is_none());
    }

    #[test]
    fn test_parse_env_overrides() {
        let details = ConnectionDetails::parse(
            r#"{
                "name": "sbt",
                "argv": ["sbt", "-bsp"],
                "version": "1.9.8",
                "bspVersion": "2.1.0-M1",
                "languages": ["scala"],
                "env": {"JAVA_OPTS": "-Xmx4G"}
            }"#,
        )
        .unwrap();
        assert_eq!(details.args(), ["-bsp"]);
        assert_eq!(details.env.get("JAVA_OPTS").map(String::as_str), Some("-Xmx4G"));
    }

    #[test]
    fn test_empty_argv_rejected() {
        let err = ConnectionDetails::parse(
            r#"{"name": "broken", "argv": [], "version": "1", "bspVersion": "2.0.0"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DescriptorError::EmptyArgv { name } if name == "broken"));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(
            ConnectionDetails::parse("not json").unwrap_err(),
            DescriptorError::Parse(_)
        ));
    }

    #[test]
    fn test_serialize_skips_empty_env() {
        let details = ConnectionDetails::parse(
            r#"{"name": "x", "argv": ["x"], "version": "1", "bspVersion": "2.0.0"}"#,
        )
        .unwrap();
        let value = serde_json::to_value(&details).unwrap();
        assert!(value.get("env").is_none());
        assert_eq!(value["bspVersion"], json!("2.0.0"));
    }
}
