use thiserror::Error;

use super::{MachineCatalog, MachineSpec, SizingConfig};
use crate::ingest::Action;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SizingError {
    #[error("{required_gb:.1} GB required exceeds largest allowed tier {largest}")]
    ExceedsAllowList { required_gb: f64, largest: String },

    #[error("gb_per_core must be a positive number, got {0}")]
    InvalidCoefficient(f64),

    #[error("unknown machine type: {0}")]
    UnknownMachineType(String),
}

/// Picks machine tiers from an allow-list.
#[derive(Debug, Clone)]
pub struct ResourceSizer {
    catalog: MachineCatalog,
    config: SizingConfig,
}

impl ResourceSizer {
    pub fn new(config: SizingConfig) -> Result<Self, SizingError> {
        let catalog = MachineCatalog::up_to(&config.max_machine_type)?;
        if !catalog.contains(&config.default_machine_type) {
            return Err(SizingError::UnknownMachineType(
                config.default_machine_type.clone(),
            ));
        }
        Ok(Self { catalog, config })
    }

    pub fn catalog(&self) -> &MachineCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Smallest tier with `core_count * gb_per_core >= required memory`.
    ///
    /// A zero size means the file has not been measured yet and yields the
    /// default tier, which can be larger than the tier for a one-byte file.
    /// The result is monotonic in `file_size_bytes` only for sizes of at
    /// least one byte.
    pub fn size(&self, file_size_bytes: u64, gb_per_core: f64) -> Result<MachineSpec, SizingError> {
        if !gb_per_core.is_finite() || gb_per_core <= 0.0 {
            return Err(SizingError::InvalidCoefficient(gb_per_core));
        }

        if file_size_bytes == 0 {
            return self
                .catalog
                .get(&self.config.default_machine_type)
                .cloned()
                .ok_or_else(|| {
                    SizingError::UnknownMachineType(self.config.default_machine_type.clone())
                });
        }

        let required_gb = self.required_memory_gb(file_size_bytes);

        self.catalog
            .tiers()
            .iter()
            .find(|tier| f64::from(tier.core_count) * gb_per_core >= required_gb)
            .cloned()
            .ok_or_else(|| SizingError::ExceedsAllowList {
                required_gb,
                largest: self.catalog.largest().machine_type.clone(),
            })
    }

    /// Sizes using the coefficient configured for `action`.
    pub fn size_for(&self, action: Action, file_size_bytes: u64) -> Result<MachineSpec, SizingError> {
        self.size(file_size_bytes, self.config.gb_per_core_for(action))
    }

    fn required_memory_gb(&self, file_size_bytes: u64) -> f64 {
        let scaled = file_size_bytes as f64 / 1e9 * self.config.memory_multiplier;
        scaled.max(self.config.minimum_floor_gb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> ResourceSizer {
        ResourceSizer::new(SizingConfig::default()).unwrap()
    }

    #[test]
    fn test_zero_size_uses_default_tier() {
        let spec = sizer().size(0, 3.5).unwrap();
        assert_eq!(spec.machine_type, "n2d-highmem-4");
    }

    #[test]
    fn test_small_file_hits_floor() {
        // 4 GB floor at 4 GB/core fits on two cores
        let spec = sizer().size(1_000, 4.0).unwrap();
        assert_eq!(spec.machine_type, "n2d-highmem-2");
    }

    #[test]
    fn test_fifty_gigabyte_expression_matrix() {
        let spec = sizer().size(50_000_000_000, 3.5).unwrap();
        assert!(f64::from(spec.core_count) * 3.5 >= 50.0);
        assert_eq!(spec.core_count, 16);
        assert_eq!(spec.memory_gib, 128);
    }

    #[test]
    fn test_exact_boundary_stays_on_tier() {
        // 64 GB at 4 GB/core needs exactly 16 cores
        let spec = sizer().size(64_000_000_000, 4.0).unwrap();
        assert_eq!(spec.core_count, 16);
    }

    #[test]
    fn test_exceeds_allow_list() {
        let result = sizer().size(1_000_000_000_000, 2.0);
        match result {
            Err(SizingError::ExceedsAllowList { largest, .. }) => {
                assert_eq!(largest, "n2d-highmem-64");
            }
            other => panic!("expected ExceedsAllowList, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_coefficient() {
        assert!(matches!(
            sizer().size(10, 0.0),
            Err(SizingError::InvalidCoefficient(_))
        ));
        assert!(matches!(
            sizer().size(10, f64::NAN),
            Err(SizingError::InvalidCoefficient(_))
        ));
    }

    #[test]
    fn test_unmeasured_file_can_outsize_tiny_file() {
        let sizer = sizer();
        let unmeasured = sizer.size(0, 4.0).unwrap();
        let tiny = sizer.size(1, 4.0).unwrap();
        assert_eq!(unmeasured.machine_type, "n2d-highmem-4");
        assert_eq!(tiny.machine_type, "n2d-highmem-2");
    }

    #[test]
    fn test_monotonic_over_measured_sizes() {
        // zero is excluded: it means unmeasured and maps to the default tier
        let sizer = sizer();
        let mut previous: Option<MachineSpec> = None;
        let sizes = [1u64, 1_000, 1_000_000]
            .into_iter()
            .chain((1..=256u64).map(|gb| gb * 1_000_000_000));
        for bytes in sizes {
            let spec = sizer.size(bytes, 4.0).unwrap();
            if let Some(prev) = &previous {
                assert!(spec.core_count >= prev.core_count);
                assert!(spec.memory_gib >= prev.memory_gib);
            }
            previous = Some(spec);
        }
    }

    #[test]
    fn test_size_for_uses_action_coefficient() {
        let sizer = sizer();
        let expression = sizer.size_for(Action::IngestExpression, 30_000_000_000).unwrap();
        let anndata = sizer.size_for(Action::IngestAnnData, 30_000_000_000).unwrap();
        // 30/3.5 -> 16 cores, 30/2.0 -> 16 cores, 30/4.0 -> 8 cores
        assert_eq!(expression.core_count, 16);
        assert_eq!(anndata.core_count, 16);
        let cluster = sizer.size_for(Action::IngestCluster, 30_000_000_000).unwrap();
        assert_eq!(cluster.core_count, 8);
    }

    #[test]
    fn test_new_rejects_default_outside_allow_list() {
        let config = SizingConfig {
            default_machine_type: "n2d-highmem-32".to_string(),
            max_machine_type: "n2d-highmem-16".to_string(),
            ..SizingConfig::default()
        };
        assert!(matches!(
            ResourceSizer::new(config),
            Err(SizingError::UnknownMachineType(_))
        ));
    }
}
