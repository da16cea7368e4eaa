use log::warn;
use serde::{Deserialize, Serialize};

/// Architectural description of one storage level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageLevelSpec {
    pub name: String,
    /// Total capacity in elements. `None` is treated as unbounded.
    pub size: Option<u64>,
    /// Elements fetched per access. `None` falls back to the larger bandwidth.
    pub block_size: Option<u64>,
    pub read_bandwidth: Option<f64>,
    pub write_bandwidth: Option<f64>,
    pub num_read_ports: u32,
    pub num_write_ports: u32,
}

/// Per-storage-level specs, innermost level first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchSpecs {
    levels: Vec<StorageLevelSpec>,
}

impl StorageLevelSpec {
    pub fn new(name: impl Into<String>) -> StorageLevelSpec {
        StorageLevelSpec {
            name: name.into(),
            size: None,
            block_size: None,
            read_bandwidth: None,
            write_bandwidth: None,
            num_read_ports: 1,
            num_write_ports: 1,
        }
    }

    pub fn with_size(mut self, size: u64) -> StorageLevelSpec {
        self.size = Some(size);
        self
    }

    pub fn with_block_size(mut self, block_size: u64) -> StorageLevelSpec {
        self.block_size = Some(block_size);
        self
    }

    pub fn with_bandwidths(mut self, read: f64, write: f64) -> StorageLevelSpec {
        self.read_bandwidth = Some(read);
        self.write_bandwidth = Some(write);
        self
    }
}

impl ArchSpecs {
    pub fn new(levels: Vec<StorageLevelSpec>) -> ArchSpecs {
        ArchSpecs { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[StorageLevelSpec] {
        &self.levels
    }

    /// Elements the level can hold in total. Unspecified sizes are unbounded.
    pub fn total_capacity(&self, level: usize) -> u64 {
        let spec = &self.levels[level];
        match spec.size {
            Some(size) => size,
            None => {
                warn!(
                    "storage level {} ({}) has unspecified size, treating as infinite",
                    level, spec.name
                );
                u64::MAX
            }
        }
    }

    /// Elements one memory line of the level delivers per access.
    pub fn line_capacity(&self, level: usize) -> u64 {
        let spec = &self.levels[level];
        match spec.block_size {
            Some(block_size) => block_size,
            None => {
                let read = spec.read_bandwidth.unwrap_or(0.0);
                let write = spec.write_bandwidth.unwrap_or(0.0);
                read.max(write) as u64
            }
        }
    }
}
