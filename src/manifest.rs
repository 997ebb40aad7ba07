//! Manifest Store
//!
//! Loads and merges domain/operation policy documents with inheritance
//! (`extends`) and environment overrides, the way `manifests/loader.py`
//! does in the original platform.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{KernelError, Result};

/// Per-domain policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DomainConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub thresholds: HashMap<String, JsonValue>,
    #[serde(default)]
    pub forbidden_patterns: HashMap<String, JsonValue>,
    #[serde(default)]
    pub required_checks: Vec<String>,
    #[serde(default)]
    pub debate_required: bool,
    #[serde(default)]
    pub human_approval_required: bool,
}

fn default_true() -> bool {
    true
}

impl DomainConfig {
    /// `{enabled=true, risk threshold 0.5, audit+rbac required}`.
    pub fn safe_defaults() -> Self {
        let mut thresholds = HashMap::new();
        thresholds.insert("max_risk_level".to_string(), JsonValue::from(0.5));
        thresholds.insert("require_audit".to_string(), JsonValue::from(true));
        thresholds.insert("require_rbac".to_string(), JsonValue::from(true));
        Self {
            enabled: true,
            priority: 50,
            thresholds,
            forbidden_patterns: HashMap::new(),
            required_checks: vec!["rbac".to_string(), "audit".to_string()],
            debate_required: false,
            human_approval_required: false,
        }
    }
}

/// Per-operation policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OperationConfig {
    pub risk_level: Option<f64>,
    pub fallback_contract: Option<bool>,
    pub required_permission: Option<String>,
    #[serde(default)]
    pub pre_conditions: Vec<String>,
    #[serde(default)]
    pub post_conditions: Vec<String>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub fast_path_available: bool,
}

/// The manifest document itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Manifest {
    pub version: JsonValue,
    #[serde(default)]
    pub extends: Vec<String>,
    #[serde(default)]
    pub domains: HashMap<String, DomainConfig>,
    #[serde(default)]
    pub operations: HashMap<String, OperationConfig>,
    pub default_constraints: Option<DomainConfig>,
}

impl Manifest {
    /// Deep-merge rule: when merging `{K:V1}` and `{K:V2}` with both
    /// values objects, recurse; otherwise `V2` wins. Operates on the raw
    /// JSON representation so arbitrary top-level keys survive the merge,
    /// matching `_deep_merge` in the original loader.
    pub fn deep_merge_json(base: &JsonValue, overlay: &JsonValue) -> JsonValue {
        match (base, overlay) {
            (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
                let mut result = base_map.clone();
                for (key, overlay_value) in overlay_map {
                    match result.get(key) {
                        Some(base_value) if base_value.is_object() && overlay_value.is_object() => {
                            result.insert(
                                key.clone(),
                                Self::deep_merge_json(base_value, overlay_value),
                            );
                        }
                        _ => {
                            result.insert(key.clone(), overlay_value.clone());
                        }
                    }
                }
                JsonValue::Object(result)
            }
            (_, overlay) => overlay.clone(),
        }
    }
}

/// Loader errors, kept distinct from `KernelError` for the same reason the
/// original keeps `ManifestLoadError` distinct from other exceptions.
#[derive(Debug, thiserror::Error)]
#[error("failed to load manifest '{path}': {reason}")]
pub struct ManifestLoadError {
    pub path: String,
    pub reason: String,
}

impl From<ManifestLoadError> for KernelError {
    fn from(e: ManifestLoadError) -> Self {
        KernelError::ManifestLoad {
            name: e.path,
            reason: e.reason,
        }
    }
}

struct Paths {
    base: PathBuf,
    project: PathBuf,
    archon: PathBuf,
}

/// Loads manifests from multiple sources with priority-based merging:
/// base < project < archon, then `extends` inheritance, then the active
/// environment overlay applied exactly once at the top of the merge tree.
pub struct ManifestStore {
    environment: String,
    paths: Paths,
    cache: RwLock<HashMap<String, JsonValue>>,
}

impl ManifestStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        project_path: impl Into<PathBuf>,
        archon_path: impl Into<PathBuf>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            paths: Paths {
                base: base_path.into(),
                project: project_path.into(),
                archon: archon_path.into(),
            },
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_manifest_dir(manifest_dir: impl AsRef<Path>, environment: impl Into<String>) -> Self {
        let dir = manifest_dir.as_ref();
        Self::new(dir.join("base"), dir.join("project"), dir.to_path_buf(), environment)
    }

    pub fn load(&self, name: &str) -> Result<Manifest> {
        let raw = self.load_raw(name, true)?;
        serde_json::from_value(raw).map_err(|e| {
            KernelError::ManifestLoad {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn load_raw(&self, name: &str, use_cache: bool) -> Result<JsonValue> {
        let cache_key = format!("{}:{}", self.environment, name);
        if use_cache {
            if let Some(cached) = self.cache.read().get(&cache_key) {
                return Ok(cached.clone());
            }
        }

        let mut manifest = self.load_from_sources(name)?;
        if manifest.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            return Err(KernelError::ManifestLoad {
                name: name.to_string(),
                reason: "manifest not found in any source".to_string(),
            });
        }

        if manifest.get("extends").is_some() {
            manifest = self.resolve_extends(manifest)?;
        }

        if let Some(overlay) = self.load_env_override()? {
            manifest = Manifest::deep_merge_json(&manifest, &overlay);
        }

        self.validate_raw(&manifest, name)?;

        self.cache.write().insert(cache_key, manifest.clone());
        Ok(manifest)
    }

    /// Load a base manifest for `extends` resolution without applying the
    /// environment overlay — parents must not be polluted with
    /// environment-specific settings.
    fn load_base_for_extends(&self, name: &str) -> Result<JsonValue> {
        let base_cache_key = format!("_base:{}", name);
        if let Some(cached) = self.cache.read().get(&base_cache_key) {
            return Ok(cached.clone());
        }

        let mut manifest = self.load_from_sources(name)?;
        if manifest.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            return Err(KernelError::ManifestLoad {
                name: name.to_string(),
                reason: "base manifest not found in any source".to_string(),
            });
        }

        if manifest.get("extends").is_some() {
            manifest = self.resolve_extends(manifest)?;
        }
        self.validate_raw(&manifest, name)?;

        self.cache.write().insert(base_cache_key, manifest.clone());
        Ok(manifest)
    }

    fn load_from_sources(&self, name: &str) -> Result<JsonValue> {
        let mut result = serde_json::Map::new();
        for dir in [&self.paths.base, &self.paths.project, &self.paths.archon] {
            let file = dir.join(format!("{}.json", name));
            if file.exists() {
                let text = std::fs::read_to_string(&file).map_err(|e| KernelError::ManifestLoad {
                    name: file.display().to_string(),
                    reason: e.to_string(),
                })?;
                let data: JsonValue = serde_json::from_str(&text).map_err(|e| KernelError::ManifestLoad {
                    name: file.display().to_string(),
                    reason: format!("invalid JSON: {e}"),
                })?;
                if let JsonValue::Object(map) = data {
                    for (k, v) in map {
                        result.insert(k, v);
                    }
                }
            }
        }
        Ok(JsonValue::Object(result))
    }

    fn resolve_extends(&self, manifest: JsonValue) -> Result<JsonValue> {
        let extends = match manifest.get("extends") {
            Some(JsonValue::Array(list)) => list.clone(),
            _ => return Ok(manifest),
        };

        let mut result = JsonValue::Object(serde_json::Map::new());
        for base_name in &extends {
            if let JsonValue::String(base_name) = base_name {
                let base_manifest = self.load_base_for_extends(base_name)?;
                result = Manifest::deep_merge_json(&result, &base_manifest);
            }
        }
        result = Manifest::deep_merge_json(&result, &manifest);
        if let JsonValue::Object(ref mut map) = result {
            map.remove("extends");
        }
        Ok(result)
    }

    fn load_env_override(&self) -> Result<Option<JsonValue>> {
        let env_file = self
            .paths
            .archon
            .join("environments")
            .join(format!("{}.json", self.environment));
        if !env_file.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&env_file).map_err(|e| KernelError::ManifestLoad {
            name: env_file.display().to_string(),
            reason: e.to_string(),
        })?;
        let data: JsonValue = serde_json::from_str(&text).map_err(|e| KernelError::ManifestLoad {
            name: env_file.display().to_string(),
            reason: format!("invalid JSON: {e}"),
        })?;
        Ok(Some(data))
    }

    fn validate_raw(&self, manifest: &JsonValue, name: &str) -> Result<()> {
        if manifest.get("version").is_none() {
            return Err(KernelError::ManifestMissingVersion(name.to_string()));
        }
        if let Some(JsonValue::Object(operations)) = manifest.get("operations") {
            for (op_name, op_config) in operations {
                if op_name.starts_with('*') || op_name.starts_with('_') {
                    continue;
                }
                let has_risk = op_config.get("risk_level").is_some();
                let has_fallback = op_config.get("fallback_contract").is_some();
                if !has_risk && !has_fallback {
                    return Err(KernelError::ManifestMissingRiskLevel {
                        manifest: name.to_string(),
                        op: op_name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns exact match, else `default_constraints`, else safe defaults.
    pub fn get_domain_contract(&self, domain: &str) -> DomainConfig {
        let manifest = match self.load("operations") {
            Ok(m) => m,
            Err(_) => return DomainConfig::safe_defaults(),
        };
        if let Some(cfg) = manifest.domains.get(domain) {
            return cfg.clone();
        }
        if let Some(cfg) = manifest.default_constraints {
            return cfg;
        }
        DomainConfig::safe_defaults()
    }

    pub fn is_domain_enabled(&self, domain: &str) -> bool {
        self.get_domain_contract(domain).enabled
    }

    /// Returns the per-operation entry, or a wildcard `*` fallback if
    /// defined and carrying `fallback_contract`.
    pub fn get_operation_contract(&self, operation: &str) -> Option<OperationConfig> {
        let manifest = self.load("operations").ok()?;
        if let Some(cfg) = manifest.operations.get(operation) {
            return Some(cfg.clone());
        }
        if let Some(wildcard) = manifest.operations.get("*") {
            if wildcard.fallback_contract.unwrap_or(false) {
                return Some(wildcard.clone());
            }
        }
        None
    }

    pub fn get_risk_level(&self, operation: &str, default: f64) -> f64 {
        self.get_operation_contract(operation)
            .and_then(|c| c.risk_level)
            .unwrap_or(default)
    }

    pub fn is_fast_path_available(&self, operation: &str) -> bool {
        match self.get_operation_contract(operation) {
            Some(cfg) => cfg.fast_path_available,
            None => self.get_risk_level(operation, 0.5) <= 0.1,
        }
    }

    pub fn get_domains(&self) -> HashMap<String, DomainConfig> {
        self.load("operations").map(|m| m.domains).unwrap_or_default()
    }

    pub fn clear_cache(&self, name: Option<&str>) {
        let mut cache = self.cache.write();
        match name {
            Some(name) => {
                cache.remove(&format!("{}:{}", self.environment, name));
            }
            None => {
                let prefix = format!("{}:", self.environment);
                cache.retain(|k, _| !k.starts_with(&prefix));
            }
        }
    }

    pub fn reload(&self, name: &str) -> Result<Manifest> {
        self.clear_cache(Some(name));
        let raw = self.load_raw(name, false)?;
        serde_json::from_value(raw).map_err(|e| KernelError::ManifestLoad {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overrides_scalars() {
        let base = serde_json::json!({"a": 1, "b": {"c": 2}});
        let overlay = serde_json::json!({"b": {"c": 3, "d": 4}});
        let merged = Manifest::deep_merge_json(&base, &overlay);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"]["c"], 3);
        assert_eq!(merged["b"]["d"], 4);
    }

    #[test]
    fn deep_merge_idempotence() {
        let a = serde_json::json!({"version": 1, "domains": {"trading": {"enabled": true}}});
        let once = Manifest::deep_merge_json(&a, &a);
        assert_eq!(once, a);
    }

    #[test]
    fn domain_config_deserializes_the_documented_thresholds_field() {
        let raw = serde_json::json!({
            "enabled": true,
            "thresholds": {"max_risk_level": 0.4}
        });
        let domain: DomainConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(domain.thresholds["max_risk_level"], JsonValue::from(0.4));
    }

    #[test]
    fn safe_defaults_are_secure() {
        let defaults = DomainConfig::safe_defaults();
        assert!(defaults.enabled);
        assert!(defaults.required_checks.contains(&"rbac".to_string()));
        assert!(defaults.required_checks.contains(&"audit".to_string()));
    }

    #[test]
    fn environment_isolation_dev_and_prod_yield_independent_results() {
        let dir = std::env::temp_dir().join(format!(
            "execution-kernel-env-isolation-{}-{}",
            std::process::id(),
            "test"
        ));
        let base = dir.join("base");
        let envs = dir.join("environments");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&envs).unwrap();

        std::fs::write(
            base.join("operations.json"),
            serde_json::json!({
                "version": 1,
                "operations": {"read_file": {"risk_level": 0.1}}
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            envs.join("dev.json"),
            serde_json::json!({"operations": {"read_file": {"risk_level": 0.9}}}).to_string(),
        )
        .unwrap();
        std::fs::write(
            envs.join("prod.json"),
            serde_json::json!({"operations": {"read_file": {"risk_level": 0.2}}}).to_string(),
        )
        .unwrap();

        let dev_store = ManifestStore::new(&base, PathBuf::new(), &dir, "dev");
        let prod_store = ManifestStore::new(&base, PathBuf::new(), &dir, "prod");

        let dev_manifest = dev_store.load("operations").unwrap();
        let prod_manifest = prod_store.load("operations").unwrap();

        assert_eq!(dev_manifest.operations["read_file"].risk_level, Some(0.9));
        assert_eq!(prod_manifest.operations["read_file"].risk_level, Some(0.2));

        std::fs::remove_dir_all(&dir).ok();
    }
}
