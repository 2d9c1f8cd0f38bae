use crate::core::model::FitParams;
use crate::error::ConfigError;
use crate::guide::blend::ProbMode;
use crate::guide::handover::HandoverThresholds;
use crate::guide::lifecycle::MechanismFlags;
use crate::guide::mechanism::MechanismParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSection {
    #[serde(default = "ManagerSection::default_position_dim")]
    pub position_dim: usize,
    /// `hard`, `potential` or `soft`; anything else means `potential`.
    #[serde(default = "ManagerSection::default_prob_mode")]
    pub prob_mode: String,
    #[serde(default = "ManagerSection::default_models_dir")]
    pub models_dir: PathBuf,
    #[serde(default = "ManagerSection::default_scale_threshold_offset")]
    pub scale_threshold_offset: f64,
}

impl ManagerSection {
    fn default_position_dim() -> usize {
        2
    }
    fn default_prob_mode() -> String {
        "potential".to_string()
    }
    fn default_models_dir() -> PathBuf {
        PathBuf::from("models")
    }
    fn default_scale_threshold_offset() -> f64 {
        0.2
    }

    pub fn prob_mode(&self) -> ProbMode {
        ProbMode::from_name(&self.prob_mode)
    }
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            position_dim: Self::default_position_dim(),
            prob_mode: Self::default_prob_mode(),
            models_dir: Self::default_models_dir(),
            scale_threshold_offset: Self::default_scale_threshold_offset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub use_weighted_dist: bool,
    #[serde(default = "ModelEntry::default_use_active_guide")]
    pub use_active_guide: bool,
}

impl ModelEntry {
    fn default_use_active_guide() -> bool {
        true
    }

    pub fn flags(&self) -> MechanismFlags {
        MechanismFlags {
            use_weighted_dist: self.use_weighted_dist,
            use_active_guide: self.use_active_guide,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FitSection {
    #[serde(default = "FitSection::default_knots")]
    pub knots: usize,
    #[serde(default = "FitSection::default_min_variance")]
    pub min_variance: f64,
    #[serde(default = "FitSection::default_crop_dt")]
    pub crop_dt: f64,
    #[serde(default = "FitSection::default_crop_dist_min")]
    pub crop_dist_min: f64,
}

impl FitSection {
    fn default_knots() -> usize {
        FitParams::default().knots
    }
    fn default_min_variance() -> f64 {
        FitParams::default().min_variance
    }
    fn default_crop_dt() -> f64 {
        FitParams::default().crop_dt
    }
    fn default_crop_dist_min() -> f64 {
        FitParams::default().crop_dist_min
    }

    pub fn params(&self) -> FitParams {
        FitParams {
            knots: self.knots,
            min_variance: self.min_variance,
            crop_dt: self.crop_dt,
            crop_dist_min: self.crop_dist_min,
        }
    }
}

impl Default for FitSection {
    fn default() -> Self {
        Self {
            knots: Self::default_knots(),
            min_variance: Self::default_min_variance(),
            crop_dt: Self::default_crop_dt(),
            crop_dist_min: Self::default_crop_dist_min(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControlSection {
    #[serde(default = "ControlSection::default_rate_hz")]
    pub rate_hz: f64,
    #[serde(default = "ControlSection::default_duration_sec")]
    pub duration_sec: f64,
    /// Log a telemetry line every N cycles; 0 disables it.
    #[serde(default = "ControlSection::default_telemetry_every")]
    pub telemetry_every: u64,
}

impl ControlSection {
    fn default_rate_hz() -> f64 {
        500.0
    }
    fn default_duration_sec() -> f64 {
        10.0
    }
    fn default_telemetry_every() -> u64 {
        500
    }

    pub fn dt(&self) -> f64 {
        1.0 / self.rate_hz
    }
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            rate_hz: Self::default_rate_hz(),
            duration_sec: Self::default_duration_sec(),
            telemetry_every: Self::default_telemetry_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub mechanism: MechanismParams,
    #[serde(default)]
    pub fit: FitSection,
    #[serde(default)]
    pub handover: HandoverThresholds,
    #[serde(default)]
    pub control: ControlSection,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            manager: ManagerSection::default(),
            mechanism: MechanismParams::default(),
            fit: FitSection::default(),
            handover: HandoverThresholds::default(),
            control: ControlSection::default(),
            models: vec![ModelEntry {
                name: "guide_1.txt".to_string(),
                use_weighted_dist: false,
                use_active_guide: true,
            }],
        }
    }
}

impl AppConfig {
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and validate a config file. A missing or malformed file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=3).contains(&self.manager.position_dim) {
            return Err(ConfigError::InvalidDimension(self.manager.position_dim));
        }
        self.handover.validate()?;
        if self.models.is_empty() {
            return Err(ConfigError::NoMechanisms);
        }
        if let Some(entry) = self.models.iter().find(|m| m.name.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "models.name",
                reason: format!("empty model name in {entry:?}"),
            });
        }
        let m = &self.mechanism;
        let checks: [(&'static str, f64, bool); 5] = [
            ("mechanism.stiffness", m.stiffness, m.stiffness >= 0.0),
            ("mechanism.damping", m.damping, m.damping >= 0.0),
            ("mechanism.phase_dot_ref", m.phase_dot_ref, m.phase_dot_ref >= 0.0),
            ("mechanism.phase_gain", m.phase_gain, m.phase_gain >= 0.0),
            ("mechanism.max_phase_dot", m.max_phase_dot, m.max_phase_dot > 0.0),
        ];
        for (field, value, ok) in checks {
            if !(ok && value.is_finite()) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} out of range"),
                });
            }
        }
        if self.fit.knots < 2 {
            return Err(ConfigError::Invalid {
                field: "fit.knots",
                reason: format!("need at least 2 knots, got {}", self.fit.knots),
            });
        }
        if !(self.fit.min_variance > 0.0) {
            return Err(ConfigError::Invalid {
                field: "fit.min_variance",
                reason: format!("{} must be positive", self.fit.min_variance),
            });
        }
        if !(self.control.rate_hz.is_finite() && self.control.rate_hz > 0.0) {
            return Err(ConfigError::Invalid {
                field: "control.rate_hz",
                reason: format!("{} must be positive", self.control.rate_hz),
            });
        }
        if !self.manager.scale_threshold_offset.is_finite() {
            return Err(ConfigError::Invalid {
                field: "manager.scale_threshold_offset",
                reason: "not finite".to_string(),
            });
        }
        Ok(())
    }

    /// Write the defaults as a commented template, keeping section headers and model entries live.
    pub fn write_default(path: &Path) -> Result<Self, ConfigError> {
        let default_cfg = Self::default();
        let text = toml::to_string_pretty(&default_cfg).map_err(|err| ConfigError::Invalid {
            field: "config",
            reason: err.to_string(),
        })?;
        let mut commented = String::new();
        for line in text.lines() {
            let trimmed = line.trim();
            let live = trimmed.is_empty()
                || (trimmed.starts_with('[') && trimmed.ends_with(']'))
                // model entries stay live so the template is loadable as written
                || trimmed.starts_with("name =")
                || trimmed.starts_with("use_");
            if !live {
                commented.push_str("# ");
            }
            commented.push_str(line);
            commented.push('\n');
        }
        fs::write(path, commented).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(default_cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_default_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vmblend.toml");
        let written = AppConfig::write_default(&path).expect("write");
        assert_eq!(written.models.len(), 1);

        let contents = fs::read_to_string(&path).expect("read written config");
        assert!(contents.contains("[manager]"), "{contents}");
        assert!(
            contents.contains("# stiffness = 300.0"),
            "should write commented stiffness: {contents}"
        );
        assert!(contents.contains("# phase_dot_preauto_th = 0.2"));
        assert!(contents.contains("name = \"guide_1.txt\""));

        let cfg = AppConfig::load(&path).expect("load template");
        assert_eq!(cfg.manager.position_dim, 2);
        assert_eq!(cfg.manager.prob_mode(), ProbMode::Potential);
        assert_eq!(cfg.models[0].name, "guide_1.txt");
        assert!(cfg.models[0].use_active_guide);
    }

    #[test]
    fn template_keeps_small_values_exact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vmblend.toml");
        AppConfig::write_default(&path).expect("write");
        let text = fs::read_to_string(&path).expect("read");
        let min_variance = FitSection::default().min_variance;
        let line = text
            .lines()
            .find(|l| l.starts_with("# min_variance ="))
            .expect("min_variance line");
        let value: f64 = line
            .trim_start_matches("# min_variance =")
            .trim()
            .parse()
            .expect("numeric");
        assert_eq!(value, min_variance);

        let mut cfg = AppConfig::default();
        cfg.fit.min_variance = 1e-7;
        let dumped = toml::to_string_pretty(&cfg).expect("serialize");
        let back: AppConfig = toml::from_str(&dumped).expect("parse");
        assert_eq!(back.fit.min_variance, 1e-7);
    }

    #[test]
    fn reads_custom_values() {
        let text = r#"
            [manager]
            position_dim = 3
            prob_mode = "soft"

            [handover]
            phase_dot_th = 0.1
            phase_dot_preauto_th = 0.4

            [[models]]
            name = "a.txt"
            use_weighted_dist = true

            [[models]]
            name = "b.txt"
            use_active_guide = false
        "#;
        let cfg = AppConfig::from_toml(text, Path::new("mem.toml")).expect("parse");
        assert_eq!(cfg.manager.position_dim, 3);
        assert_eq!(cfg.manager.prob_mode(), ProbMode::Soft);
        assert_eq!(cfg.handover.phase_dot_preauto_th, 0.4);
        assert_eq!(cfg.models.len(), 2);
        assert_eq!(
            cfg.models[0].flags(),
            MechanismFlags {
                use_weighted_dist: true,
                use_active_guide: true
            }
        );
        assert!(!cfg.models[1].use_active_guide);
        assert_eq!(cfg.mechanism.stiffness, 300.0);
    }

    #[test]
    fn unknown_prob_mode_means_potential() {
        let text = "[manager]\nprob_mode = \"fuzzy\"\n[[models]]\nname = \"a.txt\"\n";
        let cfg = AppConfig::from_toml(text, Path::new("mem.toml")).expect("parse");
        assert_eq!(cfg.manager.prob_mode(), ProbMode::Potential);
    }

    #[test]
    fn rejects_bad_dimension_and_thresholds() {
        let bad_dim = "[manager]\nposition_dim = 4\n[[models]]\nname = \"a.txt\"\n";
        assert!(matches!(
            AppConfig::from_toml(bad_dim, Path::new("mem.toml")),
            Err(ConfigError::InvalidDimension(4))
        ));
        let bad_th = "[handover]\nphase_dot_th = 0.3\nphase_dot_preauto_th = 0.3\n[[models]]\nname = \"a.txt\"\n";
        assert!(matches!(
            AppConfig::from_toml(bad_th, Path::new("mem.toml")),
            Err(ConfigError::Thresholds { .. })
        ));
        assert!(matches!(
            AppConfig::from_toml("", Path::new("mem.toml")),
            Err(ConfigError::NoMechanisms)
        ));
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            AppConfig::load(&dir.path().join("absent.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
