use serde::{Deserialize, Serialize};

use super::SizingError;

/// Machine family used for every ingest job.
pub const MACHINE_FAMILY: &str = "n2d-highmem";

/// Memory per vCPU for the highmem family.
pub const GIB_PER_CORE: u32 = 8;

const CORE_COUNTS: [u32; 9] = [2, 4, 8, 16, 32, 48, 64, 80, 96];

/// One machine tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub machine_type: String,
    pub core_count: u32,
    pub memory_gib: u32,
}

impl MachineSpec {
    fn for_cores(core_count: u32) -> Self {
        Self {
            machine_type: format!("{}-{}", MACHINE_FAMILY, core_count),
            core_count,
            memory_gib: core_count * GIB_PER_CORE,
        }
    }
}

/// Ordered allow-list of machine tiers, smallest first.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineCatalog {
    tiers: Vec<MachineSpec>,
}

impl MachineCatalog {
    /// Every tier in the family.
    pub fn full() -> Self {
        Self {
            tiers: CORE_COUNTS.iter().map(|&c| MachineSpec::for_cores(c)).collect(),
        }
    }

    /// Tiers up to and including `max_machine_type`.
    pub fn up_to(max_machine_type: &str) -> Result<Self, SizingError> {
        let full = Self::full();
        let position = full
            .tiers
            .iter()
            .position(|t| t.machine_type == max_machine_type)
            .ok_or_else(|| SizingError::UnknownMachineType(max_machine_type.to_string()))?;

        Ok(Self {
            tiers: full.tiers[..=position].to_vec(),
        })
    }

    pub fn tiers(&self) -> &[MachineSpec] {
        &self.tiers
    }

    pub fn get(&self, machine_type: &str) -> Option<&MachineSpec> {
        self.tiers.iter().find(|t| t.machine_type == machine_type)
    }

    pub fn contains(&self, machine_type: &str) -> bool {
        self.get(machine_type).is_some()
    }

    /// The next larger allow-listed tier, if any.
    pub fn next_after(&self, machine_type: &str) -> Option<&MachineSpec> {
        let position = self.tiers.iter().position(|t| t.machine_type == machine_type)?;
        self.tiers.get(position + 1)
    }

    pub fn largest(&self) -> &MachineSpec {
        // up_to and full never produce an empty list
        &self.tiers[self.tiers.len() - 1]
    }
}

impl Default for MachineCatalog {
    fn default() -> Self {
        Self::full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_catalog_is_ordered() {
        let catalog = MachineCatalog::full();
        assert_eq!(catalog.tiers().len(), 9);
        assert!(catalog
            .tiers()
            .windows(2)
            .all(|w| w[0].core_count < w[1].core_count));
        assert_eq!(catalog.tiers()[0].machine_type, "n2d-highmem-2");
        assert_eq!(catalog.tiers()[0].memory_gib, 16);
    }

    #[test]
    fn test_up_to_truncates() {
        let catalog = MachineCatalog::up_to("n2d-highmem-16").unwrap();
        assert_eq!(catalog.largest().machine_type, "n2d-highmem-16");
        assert!(!catalog.contains("n2d-highmem-32"));
    }

    #[test]
    fn test_up_to_unknown() {
        assert!(matches!(
            MachineCatalog::up_to("e2-standard-4"),
            Err(SizingError::UnknownMachineType(_))
        ));
    }

    #[test]
    fn test_next_after() {
        let catalog = MachineCatalog::up_to("n2d-highmem-8").unwrap();
        assert_eq!(
            catalog.next_after("n2d-highmem-4").unwrap().machine_type,
            "n2d-highmem-8"
        );
        assert!(catalog.next_after("n2d-highmem-8").is_none());
        assert!(catalog.next_after("n2d-highmem-48").is_none());
    }
}
