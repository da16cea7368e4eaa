use divrem::DivCeil;
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::arch::ArchSpecs;
use crate::common::{DimSize, RankId};
use crate::concordant;
use crate::layout::{LayoutNest, Layouts};
use crate::mapping::Mapping;
use crate::utils::{bounded_subsets, factors};
use crate::workload::Workload;

/// Packing options whose total factor falls at or below this fraction of the
/// densest total seen so far are discarded.
const PACKING_PRUNING_RATIO: f64 = 0.9;

/// Tunables for the design-space build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegalOptions {
    /// Largest number of ranks a single splitting option may combine.
    pub max_ranks_per_option: usize,
}

/// Moves a factor from intraline to interline for each named rank of one
/// (storage level, dataspace) slot, shrinking the slot's line occupancy by
/// `total_reduction`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplittingOption {
    pub ranks: Vec<RankId>,
    pub original_intraline: HashMap<RankId, DimSize>,
    pub factors: HashMap<RankId, DimSize>,
    pub total_reduction: u64,
}

/// Moves a factor from interline to intraline for each named rank of one
/// (storage level, dataspace) slot, growing the slot's line occupancy by
/// `total_packing`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackingOption {
    pub ranks: Vec<RankId>,
    pub original_interline: HashMap<RankId, DimSize>,
    pub factors: HashMap<RankId, DimSize>,
    pub total_packing: u64,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LegalError {
    #[error("mapping names {mapping} storage levels but the layout has {layout}")]
    LevelCountMismatch { mapping: usize, layout: usize },
    #[error("mapping names {mapping} storage levels but the architecture has {arch}")]
    ArchLevelCountMismatch { mapping: usize, arch: usize },
    #[error("mapping carries bypass masks for {mapping} dataspaces but the workload has {workload}")]
    DataSpaceCountMismatch { mapping: usize, workload: usize },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConstructError {
    #[error("layout_splitting_id {id} exceeds SplittingSpace size {size}")]
    SplittingIdOutOfRange { id: u64, size: u64 },
    #[error("layout_packing_id {id} exceeds PackingSpace size {size}")]
    PackingIdOutOfRange { id: u64, size: u64 },
    #[error("rank {rank} not found in intraline or interline nest for level {level}, dataspace {dataspace}")]
    RankNotFound {
        rank: RankId,
        level: usize,
        dataspace: usize,
    },
    #[error("splitting factor {factor} does not divide intraline factor {current} for rank {rank} at level {level}, dataspace {dataspace}")]
    NonDividingSplit {
        factor: u32,
        current: u32,
        rank: RankId,
        level: usize,
        dataspace: usize,
    },
    #[error("packing factor {factor} does not divide interline factor {current} for rank {rank} at level {level}, dataspace {dataspace}")]
    NonDividingPack {
        factor: u32,
        current: u32,
        rank: RankId,
        level: usize,
        dataspace: usize,
    },
}

/// The legal layout space for one mapping: the concordant layout plus, per
/// (storage level, dataspace), a catalog of splitting options (when the slot
/// overflows its line) or packing options (when the line has slack).
///
/// The working layout is rewritten in place on every [Legal::construct] call;
/// catalogs are built once and immutable afterwards. A `Legal` instance is
/// not safe for concurrent mutation; replicate instances across workers
/// instead.
pub struct Legal<'a> {
    workload: &'a Workload,
    mapping: &'a Mapping,
    layout: Layouts,
    num_storage_levels: usize,
    num_data_spaces: usize,
    keep: Vec<Vec<bool>>,
    total_capacity: Vec<u64>,
    line_capacity: Vec<u64>,
    splitting: Vec<Vec<Vec<SplittingOption>>>,
    packing: Vec<Vec<Vec<PackingOption>>>,
    splitting_candidates: u64,
    packing_candidates: u64,
    options: LegalOptions,
}

impl Default for LegalOptions {
    fn default() -> LegalOptions {
        LegalOptions {
            max_ranks_per_option: 3,
        }
    }
}

impl<'a> Legal<'a> {
    pub fn new(
        arch: &ArchSpecs,
        mapping: &'a Mapping,
        workload: &'a Workload,
        layout: Layouts,
    ) -> Result<Legal<'a>, LegalError> {
        Legal::with_options(arch, mapping, workload, layout, LegalOptions::default())
    }

    pub fn with_options(
        arch: &ArchSpecs,
        mapping: &'a Mapping,
        workload: &'a Workload,
        mut layout: Layouts,
        options: LegalOptions,
    ) -> Result<Legal<'a>, LegalError> {
        let num_storage_levels = mapping.num_storage_levels();
        let num_data_spaces = workload.num_dataspaces();
        if layout.num_levels() != num_storage_levels {
            return Err(LegalError::LevelCountMismatch {
                mapping: num_storage_levels,
                layout: layout.num_levels(),
            });
        }
        if arch.num_levels() != num_storage_levels {
            return Err(LegalError::ArchLevelCountMismatch {
                mapping: num_storage_levels,
                arch: arch.num_levels(),
            });
        }
        if mapping.bypass.len() != num_data_spaces {
            return Err(LegalError::DataSpaceCountMismatch {
                mapping: mapping.bypass.len(),
                workload: num_data_spaces,
            });
        }

        let keep = (0..num_storage_levels)
            .map(|lvl| (0..num_data_spaces).map(|ds| mapping.kept(ds, lvl)).collect())
            .collect();
        let total_capacity = (0..num_storage_levels)
            .map(|lvl| arch.total_capacity(lvl))
            .collect();
        let line_capacity = (0..num_storage_levels)
            .map(|lvl| arch.line_capacity(lvl))
            .collect();

        concordant::rebuild(&mut layout, workload, mapping);

        let mut legal = Legal {
            workload,
            mapping,
            layout,
            num_storage_levels,
            num_data_spaces,
            keep,
            total_capacity,
            line_capacity,
            splitting: vec![vec![Vec::new(); num_data_spaces]; num_storage_levels],
            packing: vec![vec![Vec::new(); num_data_spaces]; num_storage_levels],
            splitting_candidates: 1,
            packing_candidates: 1,
            options,
        };
        legal.build_conversion_spaces();
        Ok(legal)
    }

    /// The working layout: concordant right after construction, and the last
    /// constructed point afterwards.
    pub fn layout(&self) -> &Layouts {
        &self.layout
    }

    pub fn num_storage_levels(&self) -> usize {
        self.num_storage_levels
    }

    pub fn num_data_spaces(&self) -> usize {
        self.num_data_spaces
    }

    pub fn splitting_candidates(&self) -> u64 {
        self.splitting_candidates
    }

    pub fn packing_candidates(&self) -> u64 {
        self.packing_candidates
    }

    pub fn splitting_options(&self, level: usize, ds_idx: usize) -> &[SplittingOption] {
        &self.splitting[level][ds_idx]
    }

    pub fn packing_options(&self, level: usize, ds_idx: usize) -> &[PackingOption] {
        &self.packing[level][ds_idx]
    }

    pub fn total_capacity(&self, level: usize) -> u64 {
        self.total_capacity[level]
    }

    pub fn line_capacity(&self, level: usize) -> u64 {
        self.line_capacity[level]
    }

    /// Classifies every kept (level, dataspace) slot against its line
    /// capacity and fills the splitting or packing catalog accordingly.
    fn build_conversion_spaces(&mut self) {
        let mut max_packing_seen = 0u64;

        let mut intraline_size = vec![vec![0u64; self.num_data_spaces]; self.num_storage_levels];
        for lvl in 0..self.num_storage_levels {
            for ds_idx in 0..self.num_data_spaces {
                if self.keep[lvl][ds_idx] {
                    intraline_size[lvl][ds_idx] =
                        self.layout.level(lvl).intraline[ds_idx].factor_product();
                }
            }
        }

        for lvl in 0..self.num_storage_levels {
            for ds_idx in 0..self.num_data_spaces {
                if !self.keep[lvl][ds_idx] {
                    continue;
                }
                let size = intraline_size[lvl][ds_idx];
                let cap = self.line_capacity[lvl];
                if size > cap {
                    debug!(
                        "storage level {lvl}: dataspace {ds_idx} intraline size {size} exceeds \
                         line capacity {cap}; enumerating splitting options"
                    );
                    self.splitting[lvl][ds_idx] = enumerate_splitting(
                        &self.layout.level(lvl).intraline[ds_idx],
                        size,
                        cap,
                        self.options.max_ranks_per_option,
                    );
                } else if size < cap {
                    debug!(
                        "storage level {lvl}: dataspace {ds_idx} intraline size {size} leaves \
                         line capacity {cap} slack; enumerating packing options"
                    );
                    self.packing[lvl][ds_idx] = enumerate_packing(
                        &self.layout.level(lvl).interline[ds_idx],
                        size,
                        cap,
                        &mut max_packing_seen,
                    );
                }
            }
        }

        self.splitting_candidates = self
            .splitting
            .iter()
            .flatten()
            .filter(|catalog| !catalog.is_empty())
            .map(|catalog| catalog.len() as u64)
            .product();
        self.packing_candidates = self
            .packing
            .iter()
            .flatten()
            .filter(|catalog| !catalog.is_empty())
            .map(|catalog| catalog.len() as u64)
            .product();
    }

    /// Materializes the layout identified by `(splitting_id, packing_id)`.
    ///
    /// The working layout is first reset to the concordant layout, then each
    /// decoded option is applied, splitting before packing. Distinct IDs in
    /// range select distinct option vectors.
    pub fn construct(
        &mut self,
        splitting_id: u64,
        packing_id: u64,
    ) -> Result<&Layouts, ConstructError> {
        concordant::rebuild(&mut self.layout, self.workload, self.mapping);

        if splitting_id > self.splitting_candidates {
            return Err(ConstructError::SplittingIdOutOfRange {
                id: splitting_id,
                size: self.splitting_candidates,
            });
        }
        if packing_id > self.packing_candidates {
            return Err(ConstructError::PackingIdOutOfRange {
                id: packing_id,
                size: self.packing_candidates,
            });
        }

        let splitting_sizes: Vec<Vec<usize>> = self
            .splitting
            .iter()
            .map(|per_ds| per_ds.iter().map(|catalog| catalog.len()).collect())
            .collect();
        let packing_sizes: Vec<Vec<usize>> = self
            .packing
            .iter()
            .map(|per_ds| per_ds.iter().map(|catalog| catalog.len()).collect())
            .collect();
        let splitting_choice = decode_choices(splitting_id, &splitting_sizes, &self.keep);
        let packing_choice = decode_choices(packing_id, &packing_sizes, &self.keep);

        for lvl in 0..self.num_storage_levels {
            for ds_idx in 0..self.num_data_spaces {
                let choice = splitting_choice[lvl][ds_idx] as usize;
                let Some(option) = self.splitting[lvl][ds_idx].get(choice) else {
                    continue;
                };
                let level = self.layout.level_mut(lvl);
                for &rank in &option.ranks {
                    let split = option.factors[&rank];
                    if !level.intraline[ds_idx].factors.contains_key(&rank)
                        || !level.interline[ds_idx].factors.contains_key(&rank)
                    {
                        return Err(ConstructError::RankNotFound {
                            rank,
                            level: lvl,
                            dataspace: ds_idx,
                        });
                    }
                    let current_intraline = level.intraline[ds_idx].factor(rank);
                    let current_interline = level.interline[ds_idx].factor(rank);
                    if current_intraline.get() % split.get() != 0 {
                        return Err(ConstructError::NonDividingSplit {
                            factor: split.get(),
                            current: current_intraline.get(),
                            rank,
                            level: lvl,
                            dataspace: ds_idx,
                        });
                    }
                    level.intraline[ds_idx].set_factor(
                        rank,
                        DimSize::new(current_intraline.get() / split.get()).unwrap(),
                    );
                    level.interline[ds_idx].set_factor(
                        rank,
                        DimSize::new(current_interline.get() * split.get()).unwrap(),
                    );
                }
            }
        }

        for lvl in 0..self.num_storage_levels {
            for ds_idx in 0..self.num_data_spaces {
                let choice = packing_choice[lvl][ds_idx] as usize;
                let Some(option) = self.packing[lvl][ds_idx].get(choice) else {
                    continue;
                };
                let level = self.layout.level_mut(lvl);
                for &rank in &option.ranks {
                    let pack = option.factors[&rank];
                    if !level.intraline[ds_idx].factors.contains_key(&rank)
                        || !level.interline[ds_idx].factors.contains_key(&rank)
                    {
                        return Err(ConstructError::RankNotFound {
                            rank,
                            level: lvl,
                            dataspace: ds_idx,
                        });
                    }
                    let current_intraline = level.intraline[ds_idx].factor(rank);
                    let current_interline = level.interline[ds_idx].factor(rank);
                    if current_interline.get() % pack.get() != 0 {
                        return Err(ConstructError::NonDividingPack {
                            factor: pack.get(),
                            current: current_interline.get(),
                            rank,
                            level: lvl,
                            dataspace: ds_idx,
                        });
                    }
                    level.intraline[ds_idx].set_factor(
                        rank,
                        DimSize::new(current_intraline.get() * pack.get()).unwrap(),
                    );
                    level.interline[ds_idx].set_factor(
                        rank,
                        DimSize::new(current_interline.get() / pack.get()).unwrap(),
                    );
                }
            }
        }

        for lvl in 0..self.num_storage_levels {
            for ds_idx in 0..self.num_data_spaces {
                if !self.keep[lvl][ds_idx] {
                    continue;
                }
                let intraline_size = self.layout.level(lvl).intraline[ds_idx].factor_product();
                if intraline_size > self.line_capacity[lvl] {
                    panic!(
                        "dataspace {ds_idx} intraline size {intraline_size} exceeds line \
                         capacity {cap} at level {lvl}; layout:\n{layout}",
                        cap = self.line_capacity[lvl],
                        layout = self.layout,
                    );
                }
            }
        }

        Ok(&self.layout)
    }

    /// Greedily legalizes `layout` without consulting the catalogs: at every
    /// overflowing slot, whole intraline factors are moved to interline in
    /// rank order until the line fits.
    pub fn sequential_factorize(&self, layout: &mut Layouts) {
        for lvl in 0..self.num_storage_levels {
            for ds_idx in 0..self.num_data_spaces {
                if !self.keep[lvl][ds_idx] {
                    continue;
                }
                let intraline_size = layout.level(lvl).intraline[ds_idx].factor_product();
                if intraline_size <= self.line_capacity[lvl] {
                    continue;
                }
                let mut ratio = intraline_size as f64 / self.line_capacity[lvl] as f64;
                let ranks = layout.level(lvl).intraline[ds_idx].ranks.clone();
                for rank in ranks {
                    let level = layout.level_mut(lvl);
                    let factor = level.intraline[ds_idx].factor(rank);
                    if factor.get() > 1 {
                        let interline = level.interline[ds_idx].factor(rank);
                        level.interline[ds_idx].set_factor(
                            rank,
                            DimSize::new(interline.get() * factor.get()).unwrap(),
                        );
                        level.intraline[ds_idx].set_factor(rank, DimSize::new(1).unwrap());
                        ratio /= f64::from(factor.get());
                    }
                    if ratio < 1.0 {
                        break;
                    }
                }
            }
        }
    }
}

/// Peels mixed-radix digits off `id`: levels outermost to innermost, and
/// within a level dataspaces last to first. Slots with an empty catalog or a
/// bypassed dataspace divide by 1 and always choose 0.
fn decode_choices(mut id: u64, catalog_sizes: &[Vec<usize>], keep: &[Vec<bool>]) -> Vec<Vec<u64>> {
    let mut choices: Vec<Vec<u64>> = catalog_sizes
        .iter()
        .map(|per_ds| vec![0; per_ds.len()])
        .collect();
    for lvl in (0..catalog_sizes.len()).rev() {
        for ds_idx in (0..catalog_sizes[lvl].len()).rev() {
            let divisor = if catalog_sizes[lvl][ds_idx] > 0 && keep[lvl][ds_idx] {
                catalog_sizes[lvl][ds_idx] as u64
            } else {
                1
            };
            choices[lvl][ds_idx] = id % divisor;
            id /= divisor;
        }
    }
    choices
}

/// Enumerates splitting options for one overflowing slot: for every rank
/// subset up to `max_ranks`, the first factor tuple (ranks in nest order,
/// factors ascending) that brings the slot's intraline size within capacity.
fn enumerate_splitting(
    nest: &LayoutNest,
    intraline_size: u64,
    line_capacity: u64,
    max_ranks: usize,
) -> Vec<SplittingOption> {
    let mut candidate_factors: HashMap<RankId, Vec<u32>> = HashMap::new();
    for &rank in &nest.ranks {
        let current = nest.factor(rank).get();
        if current > 1 {
            candidate_factors.insert(
                rank,
                factors(current).into_iter().filter(|&d| d > 1).collect(),
            );
        }
    }

    let mut options = Vec::new();
    for combination in bounded_subsets(&nest.ranks, max_ranks) {
        if !combination
            .iter()
            .all(|rank| candidate_factors.contains_key(rank))
        {
            continue;
        }
        let first_fit = combination
            .iter()
            .map(|rank| candidate_factors[rank].iter().copied())
            .multi_cartesian_product()
            .find_map(|tuple| {
                let reduction: u64 = tuple.iter().map(|&f| u64::from(f)).product();
                (intraline_size / reduction <= line_capacity).then(|| SplittingOption {
                    ranks: combination.clone(),
                    original_intraline: combination.iter().map(|&r| (r, nest.factor(r))).collect(),
                    factors: combination
                        .iter()
                        .zip(&tuple)
                        .map(|(&r, &f)| (r, DimSize::new(f).unwrap()))
                        .collect(),
                    total_reduction: reduction,
                })
            });
        options.extend(first_fit);
    }
    options
}

/// Enumerates packing options for one slot with line slack: every factor
/// tuple over all packable ranks (factors descending, densest first), kept
/// only while within [PACKING_PRUNING_RATIO] of the densest total seen.
fn enumerate_packing(
    nest: &LayoutNest,
    intraline_size: u64,
    line_capacity: u64,
    max_packing_seen: &mut u64,
) -> Vec<PackingOption> {
    if line_capacity / intraline_size <= 1 {
        return Vec::new();
    }

    let mut candidate_factors: Vec<(RankId, Vec<u32>)> = nest
        .ranks
        .iter()
        .filter(|&&rank| nest.factor(rank).get() > 1)
        .map(|&rank| (rank, factors(nest.factor(rank).get())))
        .collect();
    candidate_factors.sort_by_key(|&(rank, _)| rank);
    if candidate_factors.len() < 2 {
        return Vec::new();
    }

    let ranks: Vec<RankId> = candidate_factors.iter().map(|&(rank, _)| rank).collect();
    let max_useful = DivCeil::div_ceil(line_capacity, intraline_size);
    let mut options = Vec::new();
    for tuple in candidate_factors
        .iter()
        .map(|(_, divisors)| divisors.iter().rev().copied())
        .multi_cartesian_product()
    {
        let total_packing: u64 = tuple.iter().map(|&f| u64::from(f)).product();
        if intraline_size * total_packing > line_capacity {
            continue;
        }
        if (total_packing as f64) <= PACKING_PRUNING_RATIO * (*max_packing_seen as f64) {
            continue;
        }
        options.push(PackingOption {
            ranks: ranks.clone(),
            original_interline: ranks.iter().map(|&r| (r, nest.factor(r))).collect(),
            factors: ranks
                .iter()
                .zip(&tuple)
                .map(|(&r, &f)| (r, DimSize::new(f).unwrap()))
                .collect(),
            total_packing,
        });
        if total_packing > *max_packing_seen {
            *max_packing_seen = total_packing.min(max_useful);
        }
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::StorageLevelSpec;
    use crate::common::DimIdx;
    use crate::mapping::{BypassNest, Loop, LoopNest, Spacetime};
    use crate::workload::{DataSpace, RankInfo};
    use nonzero::nonzero as nz;
    use proptest::prelude::*;

    fn looping(dim: DimIdx, end: u32, spacetime: Spacetime) -> Loop {
        Loop {
            dim,
            end: DimSize::new(end).unwrap(),
            spacetime,
        }
    }

    /// Dimensions m and n with single-dimension ranks M and N.
    fn mn_workload(dataspaces: &[(&str, &[RankId])]) -> Workload {
        Workload::new(
            vec!['m', 'n'],
            vec![nz!(32u32), nz!(32u32)],
            HashMap::from([('M', RankInfo::simple(0)), ('N', RankInfo::simple(1))]),
            dataspaces
                .iter()
                .map(|&(name, ranks)| DataSpace {
                    name: name.into(),
                    ranks: ranks.to_vec(),
                })
                .collect(),
        )
        .unwrap()
    }

    fn arch(block_sizes: &[u64]) -> ArchSpecs {
        ArchSpecs::new(
            block_sizes
                .iter()
                .enumerate()
                .map(|(i, &b)| StorageLevelSpec::new(format!("L{i}")).with_block_size(b))
                .collect(),
        )
    }

    fn mapping_of(loops: Vec<Loop>, boundaries: Vec<usize>, bypass: Vec<BypassNest>) -> Mapping {
        Mapping::new(
            LoopNest {
                loops,
                storage_tiling_boundaries: boundaries,
            },
            bypass,
        )
        .unwrap()
    }

    fn factor_map(pairs: &[(RankId, u32)]) -> HashMap<RankId, DimSize> {
        pairs
            .iter()
            .map(|&(r, f)| (r, DimSize::new(f).unwrap()))
            .collect()
    }

    #[test]
    fn test_packing_when_line_has_slack() {
        let workload = mn_workload(&[("A", &['M', 'N'])]);
        let mapping = mapping_of(
            vec![
                looping(0, 4, Spacetime::Temporal),
                looping(1, 4, Spacetime::Temporal),
            ],
            vec![1],
            vec![BypassNest::all_kept(1)],
        );
        let specs = arch(&[16]);
        let layout = Layouts::dummy(&workload, &specs);
        let mut legal = Legal::new(&specs, &mapping, &workload, layout).unwrap();

        assert!(legal.splitting_options(0, 0).is_empty());
        assert_eq!(legal.splitting_candidates(), 1);
        assert_eq!(
            legal.packing_options(0, 0),
            &[PackingOption {
                ranks: vec!['M', 'N'],
                original_interline: factor_map(&[('M', 4), ('N', 4)]),
                factors: factor_map(&[('M', 4), ('N', 4)]),
                total_packing: 16,
            }]
        );
        assert_eq!(legal.packing_candidates(), 1);

        // The concordant layout keeps everything interline.
        let concordant = legal.layout();
        assert_eq!(concordant.level(0).intraline[0].factor('M'), nz!(1u32));
        assert_eq!(concordant.level(0).interline[0].factor('M'), nz!(4u32));

        let constructed = legal.construct(0, 0).unwrap();
        assert_eq!(constructed.level(0).intraline[0].factor('M'), nz!(4u32));
        assert_eq!(constructed.level(0).intraline[0].factor('N'), nz!(4u32));
        assert_eq!(constructed.level(0).interline[0].factor('M'), nz!(1u32));
        assert_eq!(constructed.level(0).intraline[0].factor_product(), 16);
    }

    /// Two dataspaces at one level whose spatial loops overflow a line of 8.
    fn overflow_fixture() -> (Workload, Mapping, ArchSpecs) {
        let workload = mn_workload(&[("A", &['M', 'N']), ("B", &['N'])]);
        let mapping = mapping_of(
            vec![
                looping(0, 8, Spacetime::SpatialX),
                looping(1, 4, Spacetime::SpatialY),
            ],
            vec![1],
            vec![BypassNest::all_kept(1), BypassNest::all_kept(1)],
        );
        (workload, mapping, arch(&[8]))
    }

    #[test]
    fn test_splitting_catalog_on_overflow() {
        let (workload, mapping, specs) = overflow_fixture();
        let layout = Layouts::dummy(&workload, &specs);
        let legal = Legal::new(&specs, &mapping, &workload, layout).unwrap();

        // One option per rank subset, first-fitting factors, subsets by size.
        assert_eq!(
            legal.splitting_options(0, 0),
            &[
                SplittingOption {
                    ranks: vec!['M'],
                    original_intraline: factor_map(&[('M', 8)]),
                    factors: factor_map(&[('M', 4)]),
                    total_reduction: 4,
                },
                SplittingOption {
                    ranks: vec!['N'],
                    original_intraline: factor_map(&[('N', 4)]),
                    factors: factor_map(&[('N', 4)]),
                    total_reduction: 4,
                },
                SplittingOption {
                    ranks: vec!['M', 'N'],
                    original_intraline: factor_map(&[('M', 8), ('N', 4)]),
                    factors: factor_map(&[('M', 2), ('N', 2)]),
                    total_reduction: 4,
                },
            ]
        );
        assert_eq!(legal.splitting_candidates(), 3);
        // B has a single rank, too few to pack.
        assert!(legal.packing_options(0, 1).is_empty());
        assert_eq!(legal.packing_candidates(), 1);
    }

    #[test]
    fn test_construct_applies_decoded_splitting() {
        let (workload, mapping, specs) = overflow_fixture();
        let layout = Layouts::dummy(&workload, &specs);
        let mut legal = Legal::new(&specs, &mapping, &workload, layout).unwrap();

        let constructed = legal.construct(0, 0).unwrap();
        assert_eq!(constructed.level(0).intraline[0].factor('M'), nz!(2u32));
        assert_eq!(constructed.level(0).interline[0].factor('M'), nz!(4u32));
        assert_eq!(constructed.level(0).intraline[0].factor_product(), 8);
        // Dataspace B is untouched by A's splitting.
        assert_eq!(constructed.level(0).intraline[1].factor('N'), nz!(4u32));
        assert_eq!(constructed.level(0).interline[1].factor('N'), nz!(1u32));

        let constructed = legal.construct(2, 0).unwrap();
        assert_eq!(constructed.level(0).intraline[0].factor('M'), nz!(4u32));
        assert_eq!(constructed.level(0).intraline[0].factor('N'), nz!(2u32));
        assert_eq!(constructed.level(0).intraline[0].factor_product(), 8);
    }

    #[test]
    fn test_id_range_check_accepts_boundary_and_rejects_beyond() {
        let (workload, mapping, specs) = overflow_fixture();
        let layout = Layouts::dummy(&workload, &specs);
        let mut legal = Legal::new(&specs, &mapping, &workload, layout).unwrap();
        assert_eq!(legal.splitting_candidates(), 3);

        // The boundary id wraps onto choice 0.
        let at_boundary = legal.construct(3, 0).unwrap().clone();
        let at_zero = legal.construct(0, 0).unwrap().clone();
        assert_eq!(at_boundary, at_zero);

        let err = legal.construct(4, 0).unwrap_err();
        assert_eq!(
            err,
            ConstructError::SplittingIdOutOfRange { id: 4, size: 3 }
        );
        assert!(err.to_string().contains("exceeds SplittingSpace"));

        let err = legal.construct(0, 2).unwrap_err();
        assert!(err.to_string().contains("exceeds PackingSpace"));
    }

    /// Two levels; dataspace W is kept at level 0 but bypassed at level 1.
    fn bypass_fixture() -> (Workload, Mapping, ArchSpecs) {
        let workload = mn_workload(&[("A", &['M', 'N']), ("W", &['N'])]);
        let mapping = mapping_of(
            vec![
                looping(0, 8, Spacetime::SpatialX),
                looping(1, 4, Spacetime::Temporal),
                looping(0, 2, Spacetime::Temporal),
            ],
            vec![1, 2],
            vec![
                BypassNest::all_kept(2),
                BypassNest::all_kept(2).with(1, false),
            ],
        );
        (workload, mapping, arch(&[4, 4]))
    }

    #[test]
    fn test_invariants_hold_for_every_id() {
        let (workload, mapping, specs) = bypass_fixture();
        let layout = Layouts::dummy(&workload, &specs);
        let mut legal = Legal::new(&specs, &mapping, &workload, layout).unwrap();

        assert_eq!(legal.splitting_candidates(), 1);
        assert_eq!(legal.packing_candidates(), 3);
        let concordant = legal.layout().clone();

        for splitting_id in 0..=legal.splitting_candidates() {
            for packing_id in 0..=legal.packing_candidates() {
                let constructed = legal.construct(splitting_id, packing_id).unwrap();
                for lvl in 0..2 {
                    for ds_idx in 0..2 {
                        let intraline = &constructed.level(lvl).intraline[ds_idx];
                        let interline = &constructed.level(lvl).interline[ds_idx];
                        // Tile conservation against the concordant layout.
                        for &rank in &intraline.ranks {
                            let product =
                                intraline.factor(rank).get() * interline.factor(rank).get();
                            let expected = concordant.level(lvl).intraline[ds_idx]
                                .factor(rank)
                                .get()
                                * concordant.level(lvl).interline[ds_idx].factor(rank).get();
                            assert_eq!(product, expected);
                        }
                        if mapping.kept(ds_idx, lvl) {
                            assert!(intraline.factor_product() <= 4);
                        }
                    }
                }
                // Bypassed slots span the full extent with unit intraline.
                let w_intraline = &constructed.level(1).intraline[1];
                let w_interline = &constructed.level(1).interline[1];
                assert_eq!(w_intraline.factor('N'), nz!(1u32));
                assert_eq!(w_interline.factor('N'), nz!(4u32));
            }
        }
    }

    #[test]
    fn test_candidate_counts_multiply_nonempty_catalogs() {
        let (workload, mapping, specs) = bypass_fixture();
        let layout = Layouts::dummy(&workload, &specs);
        let legal = Legal::new(&specs, &mapping, &workload, layout).unwrap();

        let mut expected_splitting = 1u64;
        let mut expected_packing = 1u64;
        for lvl in 0..legal.num_storage_levels() {
            for ds_idx in 0..legal.num_data_spaces() {
                expected_splitting *= legal.splitting_options(lvl, ds_idx).len().max(1) as u64;
                expected_packing *= legal.packing_options(lvl, ds_idx).len().max(1) as u64;
            }
        }
        assert_eq!(legal.splitting_candidates(), expected_splitting);
        assert_eq!(legal.packing_candidates(), expected_packing);
        // Capacity snapshots from the arch specs: block size 4, no total size.
        assert_eq!(legal.line_capacity(0), 4);
        assert_eq!(legal.total_capacity(0), u64::MAX);
    }

    #[test]
    fn test_catalogs_are_deterministic() {
        let (workload, mapping, specs) = bypass_fixture();
        let first = Legal::new(
            &specs,
            &mapping,
            &workload,
            Layouts::dummy(&workload, &specs),
        )
        .unwrap();
        let second = Legal::new(
            &specs,
            &mapping,
            &workload,
            Layouts::dummy(&workload, &specs),
        )
        .unwrap();

        for lvl in 0..first.num_storage_levels() {
            for ds_idx in 0..first.num_data_spaces() {
                assert_eq!(
                    first.splitting_options(lvl, ds_idx),
                    second.splitting_options(lvl, ds_idx)
                );
                assert_eq!(
                    first.packing_options(lvl, ds_idx),
                    second.packing_options(lvl, ds_idx)
                );
            }
        }
        assert_eq!(first.splitting_candidates(), second.splitting_candidates());
        assert_eq!(first.packing_candidates(), second.packing_candidates());
        assert_eq!(first.layout(), second.layout());
    }

    #[test]
    fn test_packing_prunes_low_density_options() {
        let workload = mn_workload(&[("A", &['M', 'N'])]);
        let mapping = mapping_of(
            vec![
                looping(0, 2, Spacetime::SpatialX),
                looping(1, 2, Spacetime::SpatialY),
                looping(0, 16, Spacetime::Temporal),
                looping(1, 16, Spacetime::Temporal),
            ],
            vec![3],
            vec![BypassNest::all_kept(1)],
        );
        let specs = arch(&[1024]);
        let layout = Layouts::dummy(&workload, &specs);
        let legal = Legal::new(&specs, &mapping, &workload, layout).unwrap();

        // Intraline size 4 against capacity 1024: only the densest packing
        // (total 256) survives the pruning ratio.
        assert_eq!(
            legal.packing_options(0, 0),
            &[PackingOption {
                ranks: vec!['M', 'N'],
                original_interline: factor_map(&[('M', 16), ('N', 16)]),
                factors: factor_map(&[('M', 16), ('N', 16)]),
                total_packing: 256,
            }]
        );
    }

    #[test]
    fn test_decode_choices_digit_order() {
        let sizes = vec![vec![2usize, 3], vec![1, 1]];
        let keep = vec![vec![true, true], vec![true, true]];
        assert_eq!(decode_choices(5, &sizes, &keep), vec![vec![1, 2], vec![0, 0]]);
        assert_eq!(decode_choices(0, &sizes, &keep), vec![vec![0, 0], vec![0, 0]]);
    }

    #[test]
    fn test_decode_choices_bijective_in_range() {
        let splitting_sizes = vec![vec![2usize, 3], vec![1, 1]];
        let packing_sizes = vec![vec![1usize, 1], vec![2, 2]];
        let keep = vec![vec![true, true], vec![true, true]];

        let mut seen = std::collections::HashSet::new();
        for splitting_id in 0..6 {
            for packing_id in 0..4 {
                seen.insert((
                    decode_choices(splitting_id, &splitting_sizes, &keep),
                    decode_choices(packing_id, &packing_sizes, &keep),
                ));
            }
        }
        assert_eq!(seen.len(), 24);
    }

    #[test]
    fn test_decode_choices_skips_bypassed_slots() {
        let sizes = vec![vec![4usize, 3]];
        let keep = vec![vec![false, true]];
        // The bypassed first slot divides by 1 regardless of its catalog.
        assert_eq!(decode_choices(2, &sizes, &keep), vec![vec![0, 2]]);
    }

    #[test]
    fn test_sequential_factorize_moves_whole_factors() {
        let (workload, mapping, specs) = overflow_fixture();
        let layout = Layouts::dummy(&workload, &specs);
        let legal = Legal::new(&specs, &mapping, &workload, layout).unwrap();

        let mut layout = legal.layout().clone();
        legal.sequential_factorize(&mut layout);

        // A overflowed (32 > 8): M's whole factor moves, then the walk stops.
        assert_eq!(layout.level(0).intraline[0].factor('M'), nz!(1u32));
        assert_eq!(layout.level(0).interline[0].factor('M'), nz!(8u32));
        assert_eq!(layout.level(0).intraline[0].factor('N'), nz!(4u32));
        assert_eq!(layout.level(0).intraline[0].factor_product(), 4);
        // B already fit and is untouched.
        assert_eq!(layout.level(0).intraline[1].factor('N'), nz!(4u32));
        assert_eq!(layout.level(0).interline[1].factor('N'), nz!(1u32));
    }

    proptest! {
        #[test]
        fn test_every_id_satisfies_line_capacity_and_conserves_tiles(
            spatial_m in 1u32..=6,
            spatial_n in 1u32..=6,
            temporal_m in 1u32..=6,
            temporal_n in 1u32..=6,
            cap in 1u64..=40,
        ) {
            let workload = mn_workload(&[("A", &['M', 'N'])]);
            let mapping = mapping_of(
                vec![
                    looping(0, spatial_m, Spacetime::SpatialX),
                    looping(1, spatial_n, Spacetime::SpatialY),
                    looping(0, temporal_m, Spacetime::Temporal),
                    looping(1, temporal_n, Spacetime::Temporal),
                ],
                vec![3],
                vec![BypassNest::all_kept(1)],
            );
            let specs = arch(&[cap]);
            let layout = Layouts::dummy(&workload, &specs);
            let mut legal = Legal::new(&specs, &mapping, &workload, layout).unwrap();
            let concordant = legal.layout().clone();

            for splitting_id in 0..=legal.splitting_candidates() {
                for packing_id in 0..=legal.packing_candidates() {
                    let constructed = legal.construct(splitting_id, packing_id).unwrap();
                    let intraline = &constructed.level(0).intraline[0];
                    let interline = &constructed.level(0).interline[0];
                    prop_assert!(intraline.factor_product() <= cap);
                    for &rank in &intraline.ranks {
                        let product = u64::from(intraline.factor(rank).get())
                            * u64::from(interline.factor(rank).get());
                        let expected = u64::from(
                            concordant.level(0).intraline[0].factor(rank).get()
                        ) * u64::from(concordant.level(0).interline[0].factor(rank).get());
                        prop_assert_eq!(product, expected);
                    }
                }
            }
        }
    }
}
