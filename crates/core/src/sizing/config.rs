use serde::{Deserialize, Serialize};

use crate::ingest::Action;

/// Sizing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Tier used when the input size is zero or unknown.
    #[serde(default = "default_machine_type")]
    pub default_machine_type: String,

    /// Largest tier any job may request.
    #[serde(default = "default_max_machine_type")]
    pub max_machine_type: String,

    /// Scales file size (GB) into required memory (GB).
    #[serde(default = "default_multiplier")]
    pub memory_multiplier: f64,

    /// Required memory never drops below this many GB.
    #[serde(default = "default_floor")]
    pub minimum_floor_gb: f64,

    #[serde(default)]
    pub gb_per_core: GbPerCore,
}

/// Memory headroom per core, by action family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbPerCore {
    #[serde(default = "default_expression_gb")]
    pub expression: f64,
    #[serde(default = "default_anndata_gb")]
    pub anndata: f64,
    #[serde(default = "default_other_gb")]
    pub default: f64,
}

impl Default for GbPerCore {
    fn default() -> Self {
        Self {
            expression: default_expression_gb(),
            anndata: default_anndata_gb(),
            default: default_other_gb(),
        }
    }
}

fn default_machine_type() -> String {
    "n2d-highmem-4".to_string()
}

fn default_max_machine_type() -> String {
    "n2d-highmem-64".to_string()
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_floor() -> f64 {
    4.0
}

fn default_expression_gb() -> f64 {
    3.5
}

fn default_anndata_gb() -> f64 {
    2.0
}

fn default_other_gb() -> f64 {
    4.0
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            default_machine_type: default_machine_type(),
            max_machine_type: default_max_machine_type(),
            memory_multiplier: default_multiplier(),
            minimum_floor_gb: default_floor(),
            gb_per_core: GbPerCore::default(),
        }
    }
}

impl SizingConfig {
    /// Coefficient for an action's memory profile.
    pub fn gb_per_core_for(&self, action: Action) -> f64 {
        match action {
            Action::IngestExpression => self.gb_per_core.expression,
            Action::IngestAnnData => self.gb_per_core.anndata,
            _ => self.gb_per_core.default,
        }
    }

    /// Named coefficients that must be strictly positive.
    pub fn coefficients(&self) -> [(&'static str, f64); 5] {
        [
            ("memory_multiplier", self.memory_multiplier),
            ("minimum_floor_gb", self.minimum_floor_gb),
            ("gb_per_core.expression", self.gb_per_core.expression),
            ("gb_per_core.anndata", self.gb_per_core.anndata),
            ("gb_per_core.default", self.gb_per_core.default),
        ]
    }
}
