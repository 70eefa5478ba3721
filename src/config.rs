use crate::error::ConfigError;
use haplocall_protocol::StageId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_ARTIFACT_ROOT: &str = "data/artifacts";
pub const DEFAULT_REFERENCE_BUILD: &str = "GRCh38";
pub const DEFAULT_REFERENCE_CACHE_DIR: &str = "data/references";
pub const DEFAULT_FINGERPRINT_WINDOW_BYTES: u64 = 1024 * 1024;

pub const ENV_ARTIFACT_ROOT: &str = "HAPLOCALL_ARTIFACT_ROOT";
pub const ENV_REFERENCE_BUILD: &str = "HAPLOCALL_REFERENCE_BUILD";
pub const ENV_REFERENCE_CATALOG: &str = "HAPLOCALL_REFERENCE_CATALOG";
pub const ENV_REFERENCE_CACHE_DIR: &str = "HAPLOCALL_REFERENCE_CACHE_DIR";
pub const ENV_REFERENCE_FASTA: &str = "HAPLOCALL_REFERENCE_FASTA";

/// How much of the alignment file goes into its fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum FingerprintMode {
    /// File length plus the first and last `window_bytes`.
    Sampled { window_bytes: u64 },
    Full,
}

impl Default for FingerprintMode {
    fn default() -> Self {
        Self::Sampled {
            window_bytes: DEFAULT_FINGERPRINT_WINDOW_BYTES,
        }
    }
}

/// Relative share of the overall progress range per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressWeights {
    pub reference: f64,
    pub read_metrics: f64,
    pub coverage: f64,
    pub callable_loci: f64,
    pub sex_inference: f64,
    pub variant_calling: f64,
    pub mt_lineage: f64,
    pub paternal_lineage: f64,
    pub ancestry: f64,
}

impl Default for ProgressWeights {
    fn default() -> Self {
        Self {
            reference: 0.05,
            read_metrics: 0.10,
            coverage: 0.20,
            callable_loci: 0.15,
            sex_inference: 0.05,
            variant_calling: 0.25,
            mt_lineage: 0.08,
            paternal_lineage: 0.08,
            ancestry: 0.04,
        }
    }
}

impl ProgressWeights {
    pub fn stage(&self, stage: StageId) -> f64 {
        match stage {
            StageId::ReadMetrics => self.read_metrics,
            StageId::Coverage => self.coverage,
            StageId::CallableLoci => self.callable_loci,
            StageId::SexInference => self.sex_inference,
            StageId::VariantCalling => self.variant_calling,
            StageId::MtLineage => self.mt_lineage,
            StageId::PaternalLineage => self.paternal_lineage,
            StageId::Ancestry => self.ancestry,
        }
    }

    pub fn total(&self) -> f64 {
        self.reference + StageId::ALL.iter().map(|s| self.stage(*s)).sum::<f64>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub artifact_root: PathBuf,
    pub reference_build: String,
    /// An indexed FASTA used as-is for `reference_build`; takes precedence
    /// over the catalog.
    pub reference_fasta: Option<PathBuf>,
    pub reference_catalog: Option<PathBuf>,
    pub reference_cache_dir: PathBuf,
    pub fingerprint: FingerprintMode,
    pub progress_weights: ProgressWeights,
    /// Diverging labels within this many branches of their common ancestor
    /// count as a minor divergence.
    pub minor_divergence_max_branches: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from(DEFAULT_ARTIFACT_ROOT),
            reference_build: DEFAULT_REFERENCE_BUILD.to_string(),
            reference_fasta: None,
            reference_catalog: None,
            reference_cache_dir: PathBuf::from(DEFAULT_REFERENCE_CACHE_DIR),
            fingerprint: FingerprintMode::default(),
            progress_weights: ProgressWeights::default(),
            minor_divergence_max_branches: 2,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = root.into();
        self
    }

    /// Applies `HAPLOCALL_*` environment variables on top of the file values.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |var: &str| non_empty(lookup(var));
        if let Some(root) = value(ENV_ARTIFACT_ROOT) {
            self.artifact_root = PathBuf::from(root);
        }
        if let Some(build) = value(ENV_REFERENCE_BUILD) {
            self.reference_build = build;
        }
        if let Some(fasta) = value(ENV_REFERENCE_FASTA) {
            self.reference_fasta = Some(PathBuf::from(fasta));
        }
        if let Some(catalog) = value(ENV_REFERENCE_CATALOG) {
            self.reference_catalog = Some(PathBuf::from(catalog));
        }
        if let Some(cache_dir) = value(ENV_REFERENCE_CACHE_DIR) {
            self.reference_cache_dir = PathBuf::from(cache_dir);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reference_build.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "reference_build must not be empty".to_string(),
            ));
        }
        let weights = &self.progress_weights;
        let all = std::iter::once(weights.reference)
            .chain(StageId::ALL.iter().map(|s| weights.stage(*s)));
        for weight in all {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "progress weight {weight} must be finite and non-negative"
                )));
            }
        }
        if weights.total() <= 0.0 {
            return Err(ConfigError::Invalid(
                "progress weights must sum to a positive value".to_string(),
            ));
        }
        if let FingerprintMode::Sampled { window_bytes: 0 } = self.fingerprint {
            return Err(ConfigError::Invalid(
                "fingerprint window_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_partial_config_file_keeps_defaults() {
        let td = tempdir().unwrap();
        let path = td.path().join("haplocall.json");
        fs::write(
            &path,
            r#"{
  "artifact_root": "/scratch/artifacts",
  "fingerprint": { "mode": "full" },
  "progress_weights": { "variant_calling": 0.5 }
}"#,
        )
        .unwrap();
        let config = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.artifact_root, PathBuf::from("/scratch/artifacts"));
        assert_eq!(config.reference_build, DEFAULT_REFERENCE_BUILD);
        assert_eq!(config.fingerprint, FingerprintMode::Full);
        assert_eq!(config.progress_weights.variant_calling, 0.5);
        assert_eq!(config.progress_weights.coverage, 0.20);
        assert_eq!(config.minor_divergence_max_branches, 2);
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let vars = HashMap::from([
            (ENV_ARTIFACT_ROOT, "/fast/artifacts"),
            (ENV_REFERENCE_BUILD, " T2T-CHM13 "),
            (ENV_REFERENCE_CATALOG, "/etc/haplocall/references.json"),
            (ENV_REFERENCE_CACHE_DIR, ""),
        ]);
        let config = PipelineConfig::default()
            .with_overrides_from(|var| vars.get(var).map(|v| v.to_string()));
        assert_eq!(config.artifact_root, PathBuf::from("/fast/artifacts"));
        assert_eq!(config.reference_build, "T2T-CHM13");
        assert_eq!(
            config.reference_catalog,
            Some(PathBuf::from("/etc/haplocall/references.json"))
        );
        // blank values are ignored
        assert_eq!(
            config.reference_cache_dir,
            PathBuf::from(DEFAULT_REFERENCE_CACHE_DIR)
        );
        assert_eq!(config.reference_fasta, None);
    }

    #[test]
    fn test_rejects_zero_weights() {
        let mut config = PipelineConfig::default();
        config.progress_weights = ProgressWeights {
            reference: 0.0,
            read_metrics: 0.0,
            coverage: 0.0,
            callable_loci: 0.0,
            sex_inference: 0.0,
            variant_calling: 0.0,
            mt_lineage: 0.0,
            paternal_lineage: 0.0,
            ancestry: 0.0,
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_empty_sampling_window() {
        let mut config = PipelineConfig::default();
        config.fingerprint = FingerprintMode::Sampled { window_bytes: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparseable_config_reports_path() {
        let td = tempdir().unwrap();
        let path = td.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        let err = PipelineConfig::from_json_file(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
