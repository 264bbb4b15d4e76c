//! Pack discovery, snapshots, and hot reload.
//!
//! The registry is copy-on-write: a reload scans the pack directory into a
//! fresh map and swaps a single `Arc`. Snapshots handed to running turns
//! are immutable `Arc<PersonalityInstance>`s, so a reload never mutates
//! state an in-flight turn observes. Concurrent reloads serialize on a
//! mutex; `get` stays lock-free against reloads apart from one Arc clone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::manifest::{PackManifest, PlanningOverrides, MANIFEST_CANDIDATES};
use turnloom_core::{PersonalityError, StepMetrics, Tool, ToolError, ToolLibrary};

/// An immutable snapshot of one loaded personality.
pub struct PersonalityInstance {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub system_prompt: Option<String>,
    pub traits: HashMap<String, serde_json::Value>,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    pub planning: Option<PlanningOverrides>,
    tools: HashMap<String, BoundTool>,
}

struct BoundTool {
    description: String,
    tool: Arc<dyn Tool>,
}

impl PersonalityInstance {
    /// Tool names available to this personality, sorted for stable prompts.
    pub fn available_tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// (name, description) pairs for the planning prompt catalog.
    pub fn tool_catalog(&self) -> Vec<(&str, &str)> {
        let mut catalog: Vec<(&str, &str)> = self
            .tools
            .iter()
            .map(|(name, bound)| (name.as_str(), bound.description.as_str()))
            .collect();
        catalog.sort_unstable_by_key(|(name, _)| *name);
        catalog
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|b| Arc::clone(&b.tool))
    }

    /// Execute a tool bound to this snapshot, timing the call. In-flight
    /// turns call this on their captured instance so a registry reload
    /// cannot swap tools out from under them.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(serde_json::Value, StepMetrics), ToolError> {
        let tool = self
            .tool(tool_name)
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;

        let started = Instant::now();
        let result = tool.execute(arguments).await;
        let metrics = StepMetrics::with_latency(started.elapsed().as_millis() as u64);

        match result {
            Ok(value) => Ok((value, metrics)),
            Err(e) => {
                warn!(personality = %self.id, tool = tool_name, error = %e, "Tool execution failed");
                Err(e)
            }
        }
    }
}

/// Outcome of a registry (re)load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    pub loaded_count: usize,
    /// (pack directory name, reason) for every excluded pack.
    pub failed: Vec<(String, String)>,
}

type Registry = HashMap<String, Arc<PersonalityInstance>>;

/// Discovers pack directories and serves personality snapshots.
pub struct PersonalityPackManager {
    directory: PathBuf,
    default_personality_id: Option<String>,
    library: Arc<ToolLibrary>,
    registry: RwLock<Arc<Registry>>,
    reload_gate: tokio::sync::Mutex<()>,
}

impl PersonalityPackManager {
    pub fn new(
        config: &turnloom_config::PersonalitiesConfig,
        library: Arc<ToolLibrary>,
    ) -> Self {
        Self {
            directory: PathBuf::from(&config.directory),
            default_personality_id: config.default_personality_id.clone(),
            library,
            registry: RwLock::new(Arc::new(HashMap::new())),
            reload_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Scan the pack directory and atomically replace the registry.
    /// A pack that fails validation is excluded and reported; other packs
    /// load normally. Existing snapshots are unaffected.
    pub async fn reload(&self) -> Result<ReloadReport, PersonalityError> {
        let _gate = self.reload_gate.lock().await;

        let entries = std::fs::read_dir(&self.directory).map_err(|e| {
            PersonalityError::DirectoryUnreadable(format!(
                "{}: {e}",
                self.directory.display()
            ))
        })?;

        let mut fresh: Registry = HashMap::new();
        let mut failed = Vec::new();

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();

            match self.load_pack(&path, &dir_name) {
                Ok(instance) => {
                    debug!(personality = %instance.id, version = %instance.version, "Loaded personality pack");
                    fresh.insert(instance.id.clone(), Arc::new(instance));
                }
                Err(PersonalityError::NotFound(_)) => {
                    // Directory without a manifest is not a pack candidate
                    continue;
                }
                Err(e) => {
                    warn!(pack = %dir_name, error = %e, "Excluding invalid personality pack");
                    failed.push((dir_name, e.to_string()));
                }
            }
        }

        let loaded_count = fresh.len();
        {
            let mut guard = self.registry.write().expect("registry lock poisoned");
            *guard = Arc::new(fresh);
        }
        info!(loaded = loaded_count, failed = failed.len(), "Personality registry reloaded");

        Ok(ReloadReport {
            loaded_count,
            failed,
        })
    }

    fn load_pack(
        &self,
        pack_dir: &Path,
        dir_name: &str,
    ) -> Result<PersonalityInstance, PersonalityError> {
        let manifest_path = MANIFEST_CANDIDATES
            .iter()
            .map(|candidate| pack_dir.join(candidate))
            .find(|p| p.is_file())
            .ok_or_else(|| PersonalityError::NotFound(dir_name.to_string()))?;

        let manifest = PackManifest::from_file(&manifest_path)?;
        if manifest.id != dir_name {
            return Err(PersonalityError::InvalidManifest {
                path: manifest_path.display().to_string(),
                reason: format!(
                    "manifest id '{}' does not match pack directory '{}'",
                    manifest.id, dir_name
                ),
            });
        }

        let system_prompt = match &manifest.system_prompt_file {
            Some(rel) => {
                let prompt_path = pack_dir.join(rel);
                let text = std::fs::read_to_string(&prompt_path).map_err(|_| {
                    PersonalityError::PromptFileMissing(prompt_path.display().to_string())
                })?;
                Some(text)
            }
            None => None,
        };

        let mut tools = HashMap::new();
        for binding in &manifest.tools {
            let tool = self.library.get(&binding.name).ok_or_else(|| {
                PersonalityError::UnboundTool {
                    pack: manifest.id.clone(),
                    tool: binding.name.clone(),
                }
            })?;
            let description = if binding.description.is_empty() {
                tool.description().to_string()
            } else {
                binding.description.clone()
            };
            tools.insert(binding.name.clone(), BoundTool { description, tool });
        }

        Ok(PersonalityInstance {
            id: manifest.id,
            name: manifest.name,
            version: manifest.version,
            description: manifest.description,
            system_prompt,
            traits: manifest.traits,
            default_provider: manifest.default_provider,
            default_model: manifest.default_model,
            planning: manifest.planning,
            tools,
        })
    }

    fn snapshot(&self) -> Arc<Registry> {
        Arc::clone(&self.registry.read().expect("registry lock poisoned"))
    }

    /// Exact lookup, no default fallback. Input validation uses this.
    pub fn get_exact(&self, id: &str) -> Option<Arc<PersonalityInstance>> {
        self.snapshot().get(id).cloned()
    }

    /// Lookup with fallback to the configured default personality.
    pub fn get(&self, id: &str) -> Option<Arc<PersonalityInstance>> {
        let registry = self.snapshot();
        if let Some(instance) = registry.get(id) {
            return Some(Arc::clone(instance));
        }
        let default_id = self.default_personality_id.as_deref()?;
        if default_id != id {
            debug!(requested = id, default = default_id, "Falling back to default personality");
        }
        registry.get(default_id).cloned()
    }

    /// The default personality, if configured and loaded.
    pub fn default_personality(&self) -> Option<Arc<PersonalityInstance>> {
        let default_id = self.default_personality_id.as_deref()?;
        self.get_exact(default_id)
    }

    pub fn list(&self) -> Vec<Arc<PersonalityInstance>> {
        let mut all: Vec<_> = self.snapshot().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Execute a tool bound to a personality, timing the call. Resolves
    /// against the current registry; turn execution paths prefer
    /// [`PersonalityInstance::execute_tool`] on their captured snapshot.
    pub async fn execute_tool(
        &self,
        personality_id: &str,
        tool_name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(serde_json::Value, StepMetrics), ToolError> {
        let Some(personality) = self.get(personality_id) else {
            return Err(ToolError::ExecutionFailed {
                tool_name: tool_name.to_string(),
                reason: format!("personality '{personality_id}' not found"),
            });
        };
        personality.execute_tool(tool_name, arguments).await
    }
}
