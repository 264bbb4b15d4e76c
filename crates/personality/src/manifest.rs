//! Personality pack manifest — parsed from `manifest.(yaml|json|toml)`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use turnloom_core::PersonalityError;

/// A tool declared by a pack. The name must match a tool registered in the
/// process-level tool library; the description is what planning prompts
/// show the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolBinding {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Planning-phase overrides for a personality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanningOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Extra instructions appended to the planning prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// The manifest file at the root of a pack directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackManifest {
    /// Unique identifier; must match the pack directory name.
    pub id: String,
    /// User-facing display name.
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Relative path to the system prompt file (e.g. "prompts/system.md").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_file: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub traits: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning: Option<PlanningOverrides>,
}

/// Filenames probed inside each pack directory, in order.
pub const MANIFEST_CANDIDATES: &[&str] = &[
    "manifest.yaml",
    "manifest.yml",
    "manifest.json",
    "manifest.toml",
];

impl PackManifest {
    /// Parse a manifest file, dispatching on extension.
    pub fn from_file(path: &Path) -> Result<Self, PersonalityError> {
        let invalid = |reason: String| PersonalityError::InvalidManifest {
            path: path.display().to_string(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let manifest: Self = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))?,
            "json" => serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?,
            "toml" => toml::from_str(&content).map_err(|e| invalid(e.to_string()))?,
            other => return Err(invalid(format!("unsupported manifest extension: {other}"))),
        };

        manifest.validate().map_err(invalid)?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("manifest id must not be empty".into());
        }
        const INVALID: &[char] = &[' ', '/', '\\', ':', '*', '?', '"', '<', '>', '|'];
        if self.id.contains(INVALID) {
            return Err(format!("manifest id '{}' contains invalid characters", self.id));
        }
        if self.name.is_empty() {
            return Err("manifest name must not be empty".into());
        }
        if self.version.is_empty() {
            return Err("manifest version must not be empty".into());
        }
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(format!("duplicate tool declaration: {}", tool.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, filename: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(filename);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_yaml_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            "manifest.yaml",
            r#"
id: helpful_assistant
name: Helpful Assistant
version: "1.0"
description: General purpose assistant
system_prompt_file: prompts/system.md
traits:
  tone: friendly
tools:
  - name: get_weather
    description: Look up current weather for a city
default_provider: anthropic
default_model: claude-sonnet-4-20250514
planning:
  instructions: Prefer single-step plans for simple questions.
"#,
        );

        let manifest = PackManifest::from_file(&path).unwrap();
        assert_eq!(manifest.id, "helpful_assistant");
        assert_eq!(manifest.version, "1.0");
        assert_eq!(manifest.tools[0].name, "get_weather");
        assert_eq!(manifest.traits["tone"], "friendly");
        assert_eq!(
            manifest.planning.unwrap().instructions.unwrap(),
            "Prefer single-step plans for simple questions."
        );
    }

    #[test]
    fn parses_toml_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            "manifest.toml",
            r#"
id = "researcher"
name = "Researcher"
version = "0.2"

[[tools]]
name = "calculator"
description = "Evaluate arithmetic"
"#,
        );

        let manifest = PackManifest::from_file(&path).unwrap();
        assert_eq!(manifest.id, "researcher");
        assert_eq!(manifest.tools.len(), 1);
    }

    #[test]
    fn parses_json_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            "manifest.json",
            r#"{"id": "minimal", "name": "Minimal", "version": "1"}"#,
        );

        let manifest = PackManifest::from_file(&path).unwrap();
        assert_eq!(manifest.id, "minimal");
        assert!(manifest.tools.is_empty());
    }

    #[test]
    fn rejects_missing_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "manifest.yaml", "id: x\nname: X\n");
        assert!(matches!(
            PackManifest::from_file(&path),
            Err(PersonalityError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn rejects_invalid_id_characters() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            "manifest.yaml",
            "id: \"bad/id\"\nname: Bad\nversion: \"1\"\n",
        );
        assert!(PackManifest::from_file(&path).is_err());
    }

    #[test]
    fn rejects_duplicate_tools() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            "manifest.yaml",
            r#"
id: dup
name: Dup
version: "1"
tools:
  - name: get_weather
  - name: get_weather
"#,
        );
        assert!(PackManifest::from_file(&path).is_err());
    }
}
