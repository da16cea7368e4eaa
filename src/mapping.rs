use serde::{Deserialize, Serialize};

use crate::common::{DimIdx, DimSize};

/// Where a loop's iterations land: across a spatial fanout axis or in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Spacetime {
    SpatialX,
    SpatialY,
    Temporal,
}

/// One loop of a mapping's nest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loop {
    pub dim: DimIdx,
    pub end: DimSize,
    pub spacetime: Spacetime,
}

/// A mapping's flat loop nest, innermost loop first, with the loop indices at
/// which each storage level's tile ends. `storage_tiling_boundaries[l]` is the
/// index of the outermost loop belonging to level `l` (levels innermost
/// first).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopNest {
    pub loops: Vec<Loop>,
    pub storage_tiling_boundaries: Vec<usize>,
}

/// Which storage levels retain one dataspace. Bit `l` set means the dataspace
/// is resident at level `l`; clear means it is bypassed there.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassNest(u64);

/// A tiled, permuted, spatial/temporal loop nest distributed across storage
/// levels, plus per-dataspace residency masks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub loop_nest: LoopNest,
    pub bypass: Vec<BypassNest>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MappingError {
    #[error("storage tiling boundaries must be non-decreasing ({previous} is followed by {value})")]
    UnsortedBoundaries { previous: usize, value: usize },
    #[error("boundary {value} exceeds the last loop index {last}")]
    BoundaryOutOfRange { value: usize, last: usize },
    #[error("the outermost boundary must be the last loop index {last}, got {value}")]
    UncoveredOuterLoops { value: usize, last: usize },
    #[error("a non-empty loop nest needs at least one storage tiling boundary")]
    NoBoundaries,
}

impl Spacetime {
    pub fn is_spatial(self) -> bool {
        !matches!(self, Spacetime::Temporal)
    }
}

impl BypassNest {
    /// A dataspace kept at every one of the first `num_levels` levels.
    pub fn all_kept(num_levels: usize) -> BypassNest {
        debug_assert!(num_levels <= u64::BITS as usize);
        if num_levels == u64::BITS as usize {
            BypassNest(u64::MAX)
        } else {
            BypassNest((1u64 << num_levels) - 1)
        }
    }

    pub fn with(mut self, level: usize, kept: bool) -> BypassNest {
        if kept {
            self.0 |= 1 << level;
        } else {
            self.0 &= !(1 << level);
        }
        self
    }

    /// True when the dataspace is retained at `level`.
    pub fn test(self, level: usize) -> bool {
        (self.0 >> level) & 1 == 1
    }
}

impl Mapping {
    pub fn new(loop_nest: LoopNest, bypass: Vec<BypassNest>) -> Result<Mapping, MappingError> {
        let boundaries = &loop_nest.storage_tiling_boundaries;
        if !loop_nest.loops.is_empty() {
            let last = loop_nest.loops.len() - 1;
            let Some(&outermost) = boundaries.last() else {
                return Err(MappingError::NoBoundaries);
            };
            if let Some(&value) = boundaries.iter().find(|&&b| b > last) {
                return Err(MappingError::BoundaryOutOfRange { value, last });
            }
            if outermost != last {
                return Err(MappingError::UncoveredOuterLoops {
                    value: outermost,
                    last,
                });
            }
        }
        for pair in boundaries.windows(2) {
            if pair[0] > pair[1] {
                return Err(MappingError::UnsortedBoundaries {
                    previous: pair[0],
                    value: pair[1],
                });
            }
        }
        Ok(Mapping { loop_nest, bypass })
    }

    pub fn num_storage_levels(&self) -> usize {
        self.loop_nest.storage_tiling_boundaries.len()
    }

    /// True when dataspace `ds_idx` is retained at `level`.
    pub fn kept(&self, ds_idx: usize, level: usize) -> bool {
        self.bypass[ds_idx].test(level)
    }
}
