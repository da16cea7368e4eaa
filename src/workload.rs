use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;

use crate::common::{DimIdx, DimSize, RankId};

/// Shape information for one rank: the factorized dimensions it compounds,
/// the address-stride coefficient of each, and optional boundary zero padding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankInfo {
    pub dims: SmallVec<[DimIdx; 2]>,
    pub coefficients: SmallVec<[u32; 2]>,
    pub zero_padding: u32,
}

/// One tensor of the workload and its addressing decomposition into ranks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSpace {
    pub name: String,
    pub ranks: Vec<RankId>,
}

/// Immutable description of the tensor problem, shared by reference across
/// every storage level of a layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    dim_names: Vec<char>,
    dim_bounds: Vec<DimSize>,
    ranks: HashMap<RankId, RankInfo>,
    dataspaces: Vec<DataSpace>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("no ranks were provided for dataspace {0}")]
    EmptyRankList(String),
    #[error("rank {0} has no shape information")]
    UnknownRank(RankId),
    #[error("rank {rank} names {dims} dimensions but {coefficients} coefficients")]
    CoefficientArity {
        rank: RankId,
        dims: usize,
        coefficients: usize,
    },
    #[error("rank {0} has a zero coefficient")]
    ZeroCoefficient(RankId),
    #[error("rank {rank} references dimension {dim}, but only {count} dimensions are declared")]
    DimOutOfRange { rank: RankId, dim: DimIdx, count: usize },
}

impl RankInfo {
    /// A rank over a single dimension with unit coefficient and no padding.
    pub fn simple(dim: DimIdx) -> RankInfo {
        RankInfo {
            dims: SmallVec::from_slice(&[dim]),
            coefficients: SmallVec::from_slice(&[1]),
            zero_padding: 0,
        }
    }

    pub fn with_padding(mut self, zero_padding: u32) -> RankInfo {
        self.zero_padding = zero_padding;
        self
    }
}

impl Workload {
    pub fn new(
        dim_names: Vec<char>,
        dim_bounds: Vec<DimSize>,
        ranks: HashMap<RankId, RankInfo>,
        dataspaces: Vec<DataSpace>,
    ) -> Result<Workload, WorkloadError> {
        assert_eq!(dim_names.len(), dim_bounds.len());
        for (&name, info) in &ranks {
            if info.dims.len() != info.coefficients.len() {
                return Err(WorkloadError::CoefficientArity {
                    rank: name,
                    dims: info.dims.len(),
                    coefficients: info.coefficients.len(),
                });
            }
            if info.coefficients.iter().any(|&c| c == 0) {
                return Err(WorkloadError::ZeroCoefficient(name));
            }
            if let Some(&dim) = info.dims.iter().find(|&&d| usize::from(d) >= dim_names.len()) {
                return Err(WorkloadError::DimOutOfRange {
                    rank: name,
                    dim,
                    count: dim_names.len(),
                });
            }
        }
        for ds in &dataspaces {
            if ds.ranks.is_empty() {
                return Err(WorkloadError::EmptyRankList(ds.name.clone()));
            }
            if let Some(&rank) = ds.ranks.iter().find(|r| !ranks.contains_key(r)) {
                return Err(WorkloadError::UnknownRank(rank));
            }
        }
        Ok(Workload {
            dim_names,
            dim_bounds,
            ranks,
            dataspaces,
        })
    }

    pub fn num_dims(&self) -> usize {
        self.dim_names.len()
    }

    pub fn dim_names(&self) -> &[char] {
        &self.dim_names
    }

    /// Bound of each factorized dimension, indexed by [DimIdx].
    pub fn dim_bounds(&self) -> &[DimSize] {
        &self.dim_bounds
    }

    pub fn num_dataspaces(&self) -> usize {
        self.dataspaces.len()
    }

    pub fn dataspaces(&self) -> &[DataSpace] {
        &self.dataspaces
    }

    pub fn rank(&self, rank: RankId) -> &RankInfo {
        &self.ranks[&rank]
    }
}
