//! Layered configuration system
//!
//! Config is loaded with three layers of precedence (highest wins):
//! 1. Environment variables: `KILN_*`
//! 2. Project-local: `.kiln/config.toml`
//! 3. Global: `~/.kiln/config.toml`

use kiln_cache::CacheSettings;
use kiln_core::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Backends known to the registry, in default priority order
pub const KNOWN_BACKENDS: [&str; 3] = ["meshy", "sf3d", "mock"];

/// Provider-specific configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub priority: Option<i32>,
}

/// Generation and scheduling knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Backend invocations allowed to run at once
    pub max_parallel: usize,
    /// Explicit fallback order; position `i` gets priority `100 - i`
    pub backend_priority: Vec<String>,
    /// Budget for a single backend attempt
    pub attempt_timeout_secs: u64,
    /// Interval between remote job status polls
    pub poll_interval_secs: u64,
    /// How long finished jobs stay queryable
    pub job_retention_hours: u64,
    pub max_vertex_count: usize,
    /// Stop admitting batch items after this long
    pub batch_timeout_secs: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            backend_priority: Vec::new(),
            attempt_timeout_secs: 600,
            poll_interval_secs: 3,
            job_retention_hours: 24,
            max_vertex_count: 10_000,
            batch_timeout_secs: None,
        }
    }
}

/// `[cache]` as written in one config layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_days: Option<u32>,
    pub max_size_mb: Option<u64>,
}

/// `[generation]` as written in one config layer. Unset fields defer to
/// lower layers, then to the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub max_parallel: Option<usize>,
    pub backend_priority: Option<Vec<String>>,
    pub attempt_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub job_retention_hours: Option<u64>,
    pub max_vertex_count: Option<usize>,
    pub batch_timeout_secs: Option<u64>,
}

/// Top-level config file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfigFile {
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

/// Resolved configuration with environment variable overrides applied
#[derive(Debug, Clone, PartialEq)]
pub struct KilnConfig {
    pub workspace_root: PathBuf,
    pub cache: CacheSettings,
    pub generation: GenerationConfig,
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self::from_file(KilnConfigFile::default())
    }
}

impl KilnConfig {
    /// Load config for the current directory: global < project < env vars
    pub fn load() -> Result<Self> {
        Self::load_from_dir(Path::new("."))
    }

    /// Load config with `project_dir/.kiln/config.toml` as the project layer
    pub fn load_from_dir(project_dir: &Path) -> Result<Self> {
        let mut config = KilnConfigFile::default();

        // Layer 1: Global config (~/.kiln/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                let global = Self::load_file(&global_path)?;
                Self::merge_into(&mut config, global);
            }
        }

        // Layer 2: Project-local config (.kiln/config.toml)
        let local_path = project_dir.join(".kiln").join("config.toml");
        if local_path.exists() {
            let local = Self::load_file(&local_path)?;
            Self::merge_into(&mut config, local);
        }

        // Layer 3: Environment variable overrides
        Self::apply_env_overrides(&mut config, |k| std::env::var(k).ok());

        let resolved = Self::from_file(config);
        resolved.validate()?;
        Ok(resolved)
    }

    /// Load config from a specific file path only (for testing)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let mut config = Self::load_file(path)?;
        Self::apply_env_overrides(&mut config, |k| std::env::var(k).ok());
        let resolved = Self::from_file(config);
        resolved.validate()?;
        Ok(resolved)
    }

    /// Parse a TOML document without touching the filesystem or environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: KilnConfigFile = toml::from_str(content)?;
        let resolved = Self::from_file(file);
        resolved.validate()?;
        Ok(resolved)
    }

    fn from_file(file: KilnConfigFile) -> Self {
        let cache_defaults = CacheSettings::default();
        let gen_defaults = GenerationConfig::default();
        let gen = file.generation;
        Self {
            workspace_root: file
                .workspace_root
                .unwrap_or_else(|| PathBuf::from("workspace")),
            cache: CacheSettings {
                ttl_days: file.cache.ttl_days.unwrap_or(cache_defaults.ttl_days),
                max_size_mb: file.cache.max_size_mb.unwrap_or(cache_defaults.max_size_mb),
            },
            generation: GenerationConfig {
                max_parallel: gen.max_parallel.unwrap_or(gen_defaults.max_parallel),
                backend_priority: gen.backend_priority.unwrap_or(gen_defaults.backend_priority),
                attempt_timeout_secs: gen
                    .attempt_timeout_secs
                    .unwrap_or(gen_defaults.attempt_timeout_secs),
                poll_interval_secs: gen
                    .poll_interval_secs
                    .unwrap_or(gen_defaults.poll_interval_secs),
                job_retention_hours: gen
                    .job_retention_hours
                    .unwrap_or(gen_defaults.job_retention_hours),
                max_vertex_count: gen.max_vertex_count.unwrap_or(gen_defaults.max_vertex_count),
                batch_timeout_secs: gen.batch_timeout_secs.or(gen_defaults.batch_timeout_secs),
            },
            providers: file.providers,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.generation.max_parallel == 0 {
            return Err(KilnError::Config(
                "generation.max_parallel must be at least 1".into(),
            ));
        }
        if self.generation.poll_interval_secs == 0 {
            return Err(KilnError::Config(
                "generation.poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.generation.attempt_timeout_secs == 0 {
            return Err(KilnError::Config(
                "generation.attempt_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Get API key for a provider
    pub fn api_key(&self, provider_name: &str) -> Option<&str> {
        self.providers
            .get(provider_name)
            .and_then(|p| p.api_key.as_deref())
    }

    /// Get API URL for a provider (or its default)
    pub fn api_url(&self, provider_name: &str) -> Option<&str> {
        self.providers
            .get(provider_name)
            .and_then(|p| p.api_url.as_deref())
    }

    /// Check if a provider is enabled. The mock backend is opt-in.
    pub fn is_enabled(&self, provider_name: &str) -> bool {
        self.providers
            .get(provider_name)
            .and_then(|p| p.enabled)
            .unwrap_or(provider_name != "mock")
    }

    /// Effective priority: explicit order list, then per-provider value,
    /// then the built-in default.
    pub fn priority(&self, provider_name: &str) -> i32 {
        if let Some(pos) = self
            .generation
            .backend_priority
            .iter()
            .position(|n| n == provider_name)
        {
            return 100 - pos as i32;
        }
        self.providers
            .get(provider_name)
            .and_then(|p| p.priority)
            .unwrap_or_else(|| default_priority(provider_name))
    }

    /// Every backend name this config mentions, plus the built-in ones
    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = KNOWN_BACKENDS.iter().map(|s| s.to_string()).collect();
        let mut extra: Vec<&String> = self
            .providers
            .keys()
            .chain(self.generation.backend_priority.iter())
            .filter(|n| !KNOWN_BACKENDS.contains(&n.as_str()))
            .collect();
        extra.sort();
        extra.dedup();
        names.extend(extra.into_iter().cloned());
        names
    }

    pub fn temp_root(&self) -> PathBuf {
        self.workspace_root.join("temp")
    }

    fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".kiln").join("config.toml"))
    }

    fn load_file(path: &Path) -> Result<KilnConfigFile> {
        let content = std::fs::read_to_string(path)?;
        let config: KilnConfigFile = toml::from_str(&content).map_err(|e| {
            KilnError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Overlay every field the higher layer sets explicitly
    fn merge_into(base: &mut KilnConfigFile, overlay: KilnConfigFile) {
        set_if_some(&mut base.workspace_root, overlay.workspace_root);

        set_if_some(&mut base.cache.ttl_days, overlay.cache.ttl_days);
        set_if_some(&mut base.cache.max_size_mb, overlay.cache.max_size_mb);

        let gen = overlay.generation;
        let target = &mut base.generation;
        set_if_some(&mut target.max_parallel, gen.max_parallel);
        set_if_some(&mut target.backend_priority, gen.backend_priority);
        set_if_some(&mut target.attempt_timeout_secs, gen.attempt_timeout_secs);
        set_if_some(&mut target.poll_interval_secs, gen.poll_interval_secs);
        set_if_some(&mut target.job_retention_hours, gen.job_retention_hours);
        set_if_some(&mut target.max_vertex_count, gen.max_vertex_count);
        set_if_some(&mut target.batch_timeout_secs, gen.batch_timeout_secs);

        for (name, provider) in overlay.providers {
            let entry = base.providers.entry(name).or_default();
            set_if_some(&mut entry.api_key, provider.api_key);
            set_if_some(&mut entry.api_url, provider.api_url);
            set_if_some(&mut entry.enabled, provider.enabled);
            set_if_some(&mut entry.priority, provider.priority);
        }
    }

    fn apply_env_overrides<F>(config: &mut KilnConfigFile, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = var("KILN_WORKSPACE_ROOT") {
            config.workspace_root = Some(PathBuf::from(root));
        }
        set_if_some(
            &mut config.cache.ttl_days,
            parse_env(&var, "KILN_GLOBAL_CACHE_TTL_DAYS"),
        );
        set_if_some(
            &mut config.cache.max_size_mb,
            parse_env(&var, "KILN_MAX_CACHE_SIZE_MB"),
        );
        set_if_some(
            &mut config.generation.max_parallel,
            parse_env(&var, "KILN_MAX_PARALLEL"),
        );
        if let Some(list) = var("KILN_BACKEND_PRIORITY") {
            config.generation.backend_priority = Some(
                list.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }

        let mut names: Vec<String> = KNOWN_BACKENDS.iter().map(|s| s.to_string()).collect();
        names.extend(config.providers.keys().cloned());
        names.sort();
        names.dedup();

        for name in names {
            let upper = name.to_uppercase();
            if let Some(key) = var(&format!("KILN_{}_API_KEY", upper)) {
                config.providers.entry(name.clone()).or_default().api_key = Some(key);
            }
            if let Some(url) = var(&format!("KILN_{}_URL", upper)) {
                config.providers.entry(name.clone()).or_default().api_url = Some(url);
            }
            if let Some(flag) = var(&format!("KILN_DISABLE_{}", upper)) {
                if matches!(flag.trim().to_lowercase().as_str(), "true" | "1" | "yes") {
                    config.providers.entry(name.clone()).or_default().enabled = Some(false);
                }
            }
        }
    }
}

fn default_priority(provider_name: &str) -> i32 {
    match provider_name {
        "meshy" => 100,
        "sf3d" => 50,
        _ => 0,
    }
}

fn set_if_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn parse_env<T, F>(var: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_config(content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kiln_config_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_load_config_from_file() {
        let config_str = r#"
workspace_root = "/srv/kiln"

[cache]
ttl_days = 7

[generation]
max_parallel = 2
backend_priority = ["sf3d", "meshy"]

[providers.meshy]
api_key = "msy_test"
enabled = false

[providers.sf3d]
api_url = "http://127.0.0.1:8189"
"#;
        let path = temp_config(config_str);
        let config = KilnConfig::load_from_file(&path).unwrap();

        assert_eq!(config.workspace_root, PathBuf::from("/srv/kiln"));
        assert_eq!(config.cache.ttl_days, 7);
        assert_eq!(config.cache.max_size_mb, 10_240);
        assert_eq!(config.generation.max_parallel, 2);
        assert_eq!(config.generation.attempt_timeout_secs, 600);
        assert!(!config.is_enabled("meshy"));
        assert!(config.is_enabled("sf3d"));
        assert_eq!(config.api_url("sf3d"), Some("http://127.0.0.1:8189"));
        assert_eq!(config.temp_root(), PathBuf::from("/srv/kiln/temp"));

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_priority_resolution() {
        let config = KilnConfig::default();
        assert_eq!(config.priority("meshy"), 100);
        assert_eq!(config.priority("sf3d"), 50);
        assert_eq!(config.priority("mock"), 0);

        let config = KilnConfig::from_toml_str(
            r#"
[generation]
backend_priority = ["sf3d", "meshy"]

[providers.mock]
priority = 75
"#,
        )
        .unwrap();
        assert_eq!(config.priority("sf3d"), 100);
        assert_eq!(config.priority("meshy"), 99);
        assert_eq!(config.priority("mock"), 75);
    }

    #[test]
    fn test_mock_is_opt_in() {
        let config = KilnConfig::default();
        assert!(!config.is_enabled("mock"));
        assert!(config.is_enabled("meshy"));
        assert!(config.is_enabled("nonexistent"));

        let config = KilnConfig::from_toml_str("[providers.mock]\nenabled = true\n").unwrap();
        assert!(config.is_enabled("mock"));
    }

    #[test]
    fn test_env_overrides() {
        let mut file = KilnConfigFile::default();
        file.cache.ttl_days = Some(14);
        file.providers.insert(
            "meshy".into(),
            ProviderConfig {
                api_key: Some("file-key".into()),
                ..Default::default()
            },
        );

        KilnConfig::apply_env_overrides(
            &mut file,
            env(&[
                ("KILN_MESHY_API_KEY", "env-key"),
                ("KILN_SF3D_URL", "http://gpu-box:8189"),
                ("KILN_DISABLE_MOCK", "yes"),
                ("KILN_MAX_PARALLEL", "6"),
                ("KILN_GLOBAL_CACHE_TTL_DAYS", "not-a-number"),
                ("KILN_BACKEND_PRIORITY", "SF3D, meshy"),
                ("KILN_WORKSPACE_ROOT", "/data/ws"),
            ]),
        );
        let config = KilnConfig::from_file(file);

        assert_eq!(config.api_key("meshy"), Some("env-key"));
        assert_eq!(config.api_url("sf3d"), Some("http://gpu-box:8189"));
        assert!(!config.is_enabled("mock"));
        assert_eq!(config.providers["mock"].enabled, Some(false));
        assert_eq!(config.generation.max_parallel, 6);
        // unparseable override leaves the file value in place
        assert_eq!(config.cache.ttl_days, 14);
        assert_eq!(config.generation.backend_priority, vec!["sf3d", "meshy"]);
        assert_eq!(config.workspace_root, PathBuf::from("/data/ws"));
    }

    #[test]
    fn test_merge_layers() {
        let mut base: KilnConfigFile = toml::from_str(
            r#"
[generation]
max_parallel = 8

[providers.meshy]
api_key = "global-key"
api_url = "https://global"
"#,
        )
        .unwrap();
        let overlay: KilnConfigFile = toml::from_str(
            r#"
[cache]
max_size_mb = 512

[providers.meshy]
api_key = "project-key"
enabled = false
"#,
        )
        .unwrap();

        KilnConfig::merge_into(&mut base, overlay);
        let config = KilnConfig::from_file(base);

        assert_eq!(config.generation.max_parallel, 8);
        assert_eq!(config.cache.max_size_mb, 512);
        assert_eq!(config.api_key("meshy"), Some("project-key"));
        assert_eq!(config.api_url("meshy"), Some("https://global"));
        assert!(!config.is_enabled("meshy"));
    }

    #[test]
    fn test_project_layer_can_restate_defaults() {
        let mut global: KilnConfigFile = toml::from_str(
            r#"
[cache]
ttl_days = 7

[generation]
max_parallel = 8
"#,
        )
        .unwrap();
        let project: KilnConfigFile = toml::from_str(
            r#"
[cache]
ttl_days = 30

[generation]
max_parallel = 4
"#,
        )
        .unwrap();

        KilnConfig::merge_into(&mut global, project);
        let config = KilnConfig::from_file(global);

        assert_eq!(config.cache.ttl_days, 30);
        assert_eq!(config.generation.max_parallel, 4);
        assert_eq!(config.cache.max_size_mb, 10_240);
    }

    #[test]
    fn test_project_dir_layer() {
        let dir = std::env::temp_dir().join(format!("kiln_config_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join(".kiln")).unwrap();
        std::fs::write(
            dir.join(".kiln").join("config.toml"),
            "[generation]\njob_retention_hours = 2\n",
        )
        .unwrap();

        let config = KilnConfig::load_from_dir(&dir).unwrap();
        assert_eq!(config.generation.job_retention_hours, 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = KilnConfig::from_toml_str("[generation]\nmax_parallel = 0\n").unwrap_err();
        assert!(matches!(err, KilnError::Config(_)));

        let err = KilnConfig::from_toml_str("generation = 5").unwrap_err();
        assert!(matches!(err, KilnError::TomlParse(_)));
    }

    #[test]
    fn test_backend_names_include_configured() {
        let config = KilnConfig::from_toml_str("[providers.tripo]\napi_key = \"k\"\n").unwrap();
        assert_eq!(config.backend_names(), vec!["meshy", "sf3d", "mock", "tripo"]);
    }
}
