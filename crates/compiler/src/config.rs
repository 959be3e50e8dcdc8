//! Build configuration
//!
//! The deterministic configuration record every pipeline stage is a
//! pure function of: optimization level, target, capability manifest,
//! hash seed, determinism mode, and the optional Type Facts Artifact.
//! Loadable from TOML, overridable from the recognized environment
//! variables, and extendable through the builder methods.

use std::path::PathBuf;

use molt_core::CapabilitySet;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationLevel {
    O0,
    O1,
    O2,
    O3,
}

impl OptimizationLevel {
    pub fn clang_flag(self) -> &'static str {
        match self {
            OptimizationLevel::O0 => "-O0",
            OptimizationLevel::O1 => "-O1",
            OptimizationLevel::O2 => "-O2",
            OptimizationLevel::O3 => "-O3",
        }
    }
}

/// Backend target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Native executable via LLVM IR + clang, linked against the
    /// runtime static library.
    Native,
    /// Portable sandbox module plus sidecar manifest.
    Sandbox,
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub opt_level: OptimizationLevel,
    pub target: Target,
    /// Capability manifest baked into the artifact.
    pub caps: CapabilitySet,
    pub hash_seed: u64,
    pub deterministic: bool,
    /// Type Facts Artifact path, and whether facts are assertions.
    pub facts_path: Option<PathBuf>,
    pub strict_facts: bool,
    pub module_name: String,
    pub module_version: String,
    /// Runtime static library for native linking; defaults to the
    /// MOLT_RUNTIME_LIB environment variable.
    pub runtime_lib: Option<PathBuf>,
    /// Module search roots, in deterministic order (MOLT_MODULE_ROOTS).
    pub module_roots: Vec<PathBuf>,
    /// Keep the intermediate .ll next to the output.
    pub keep_ir: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            opt_level: OptimizationLevel::O2,
            target: Target::Native,
            caps: CapabilitySet::empty(),
            hash_seed: 0,
            deterministic: false,
            facts_path: None,
            strict_facts: false,
            module_name: "main".to_string(),
            module_version: "0.0.0".to_string(),
            runtime_lib: None,
            module_roots: Vec::new(),
            keep_ir: false,
        }
    }
}

/// TOML manifest shape:
///
/// ```toml
/// [build]
/// opt-level = 2
/// deterministic = true
/// capabilities = ["fs.read", "time.wall"]
///
/// [module]
/// name = "billing"
/// version = "1.4.0"
/// ```
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    build: RawBuild,
    #[serde(default)]
    module: RawModule,
}

#[derive(Debug, Default, Deserialize)]
struct RawBuild {
    #[serde(rename = "opt-level")]
    opt_level: Option<u8>,
    deterministic: Option<bool>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(rename = "hash-seed")]
    hash_seed: Option<u64>,
    #[serde(rename = "type-facts")]
    type_facts: Option<PathBuf>,
    #[serde(rename = "strict-facts")]
    strict_facts: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawModule {
    name: Option<String>,
    version: Option<String>,
}

impl BuildConfig {
    pub fn new() -> Self {
        BuildConfig::default()
    }

    /// Load from a TOML manifest.
    pub fn from_toml(text: &str) -> Result<Self, String> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| format!("build manifest: {}", e))?;
        let mut config = BuildConfig::default();
        if let Some(level) = raw.build.opt_level {
            config.opt_level = match level {
                0 => OptimizationLevel::O0,
                1 => OptimizationLevel::O1,
                2 => OptimizationLevel::O2,
                3 => OptimizationLevel::O3,
                other => return Err(format!("invalid opt-level {}", other)),
            };
        }
        if let Some(d) = raw.build.deterministic {
            config.deterministic = d;
        }
        if let Some(seed) = raw.build.hash_seed {
            config.hash_seed = seed;
        }
        config.caps =
            CapabilitySet::from_names(raw.build.capabilities.iter().map(|s| s.as_str()))?;
        config.facts_path = raw.build.type_facts;
        config.strict_facts = raw.build.strict_facts.unwrap_or(false);
        if let Some(name) = raw.module.name {
            config.module_name = name;
        }
        if let Some(version) = raw.module.version {
            config.module_version = version;
        }
        Ok(config)
    }

    /// Apply the recognized environment variables. Deterministic mode
    /// forces seed 0.
    pub fn apply_env(mut self) -> Self {
        let truthy = |name: &str| {
            matches!(
                std::env::var(name).ok().as_deref(),
                Some("1") | Some("true") | Some("yes")
            )
        };
        if truthy("MOLT_DETERMINISTIC") {
            self.deterministic = true;
        }
        if let Ok(seed) = std::env::var("MOLT_HASH_SEED") {
            if let Ok(seed) = seed.parse() {
                self.hash_seed = seed;
            }
        }
        if self.deterministic {
            self.hash_seed = 0;
        }
        if self.runtime_lib.is_none() {
            self.runtime_lib = std::env::var("MOLT_RUNTIME_LIB").ok().map(PathBuf::from);
        }
        if self.module_roots.is_empty() {
            if let Ok(roots) = std::env::var("MOLT_MODULE_ROOTS") {
                self.module_roots = roots.split(':').map(PathBuf::from).collect();
            }
        }
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_caps(mut self, caps: CapabilitySet) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_module(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.module_name = name.into();
        self.module_version = version.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_core::Capability;

    #[test]
    fn test_toml_roundtrip() {
        let config = BuildConfig::from_toml(
            r#"
[build]
opt-level = 3
deterministic = true
capabilities = ["fs.read", "net.out"]

[module]
name = "billing"
version = "1.4.0"
"#,
        )
        .unwrap();
        assert_eq!(config.opt_level, OptimizationLevel::O3);
        assert!(config.deterministic);
        assert!(config.caps.contains(Capability::FsRead));
        assert!(config.caps.contains(Capability::NetOut));
        assert_eq!(config.module_name, "billing");
        assert_eq!(config.module_version, "1.4.0");
    }

    #[test]
    fn test_unknown_capability_rejected() {
        let err = BuildConfig::from_toml(
            "[build]\ncapabilities = [\"fs.everything\"]\n",
        )
        .unwrap_err();
        assert!(err.contains("fs.everything"));
    }

    #[test]
    fn test_invalid_opt_level_rejected() {
        let err = BuildConfig::from_toml("[build]\nopt-level = 9\n").unwrap_err();
        assert!(err.contains("opt-level"));
    }
}
