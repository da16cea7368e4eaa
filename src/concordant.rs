use divrem::DivCeil;
use nonzero::nonzero as nz;

use crate::common::{DimIdx, DimSize};
use crate::layout::Layouts;
use crate::mapping::Mapping;
use crate::workload::Workload;

/// Per-level, per-dimension loop extents collapsed out of a mapping's nest.
///
/// `cumulative_intraline` propagates a level's spatial extents outward only
/// while the visited level itself has a spatial extent greater than one;
/// `cumulative_overall` accumulates the full tile extent unconditionally.
#[derive(Debug, Clone)]
struct DimProfile {
    cumulative_intraline: Vec<Vec<u32>>,
    cumulative_overall: Vec<Vec<u32>>,
}

impl DimProfile {
    fn from_mapping(mapping: &Mapping, num_dims: usize) -> DimProfile {
        let num_levels = mapping.num_storage_levels();
        let boundaries = &mapping.loop_nest.storage_tiling_boundaries;

        let mut intraline = vec![vec![1u32; num_dims]; num_levels];
        let mut interline = vec![vec![1u32; num_dims]; num_levels];
        let mut level = num_levels;
        for (idx, lp) in mapping.loop_nest.loops.iter().enumerate().rev() {
            if level > 0 && boundaries[level - 1] == idx {
                level -= 1;
            }
            let row = if lp.spacetime.is_spatial() {
                &mut intraline[level]
            } else {
                &mut interline[level]
            };
            row[usize::from(lp.dim)] = lp.end.get();
        }

        let overall: Vec<Vec<u32>> = (0..num_levels)
            .map(|l| (0..num_dims).map(|d| intraline[l][d] * interline[l][d]).collect())
            .collect();

        let mut cumulative_intraline = intraline.clone();
        for l in 1..num_levels {
            let spatial_here = intraline[l].iter().any(|&v| v > 1);
            for d in 0..num_dims {
                cumulative_intraline[l][d] = if spatial_here {
                    intraline[l][d] * cumulative_intraline[l - 1][d]
                } else {
                    intraline[l][d]
                };
            }
        }

        let mut cumulative_overall = overall.clone();
        for l in 1..num_levels {
            for d in 0..num_dims {
                cumulative_overall[l][d] = overall[l][d] * cumulative_overall[l - 1][d];
            }
        }

        DimProfile {
            cumulative_intraline,
            cumulative_overall,
        }
    }
}

/// Composes a rank's extent from its factorized dimensions' values.
///
/// A compound rank spanning several dimensions covers a sliding-window range:
/// each non-final dimension contributes `value * coefficient`, the final one
/// `value * coefficient - 1`, and a dimension at extent 1 contributes only
/// itself (or nothing, in the final position).
fn compose_rank_extent(dims: &[DimIdx], coefficients: &[u32], values: &[u32]) -> u32 {
    if dims.len() == 1 {
        return values[usize::from(dims[0])];
    }
    let mut total = 0u32;
    for (idx, &d) in dims.iter().enumerate() {
        let value = values[usize::from(d)];
        let last = idx == dims.len() - 1;
        if value == 1 {
            if !last {
                total += value;
            }
        } else if last {
            total += value * coefficients[idx] - 1;
        } else {
            total += value * coefficients[idx];
        }
    }
    total
}

/// Rewrites `layout` to the layout concordant with `mapping`: per rank, the
/// intraline factor is the spatial extent visible at the level and the
/// interline factor covers the rest of the tile. Bypassed dataspaces get unit
/// intraline factors and interline factors spanning the level's whole extent.
pub fn rebuild(layout: &mut Layouts, workload: &Workload, mapping: &Mapping) {
    let profile = DimProfile::from_mapping(mapping, workload.num_dims());
    let num_levels = mapping.num_storage_levels();

    for lvl in 0..num_levels {
        let outermost = lvl + 1 == num_levels;
        for ds_idx in 0..workload.num_dataspaces() {
            let kept = mapping.kept(ds_idx, lvl);
            let ranks = layout.level(lvl).intraline[ds_idx].ranks.clone();
            for rank in ranks {
                let info = workload.rank(rank);
                let zero_padding = if outermost { info.zero_padding } else { 0 };

                let intraline_extent = compose_rank_extent(
                    &info.dims,
                    &info.coefficients,
                    &profile.cumulative_intraline[lvl],
                );
                let total_extent = compose_rank_extent(
                    &info.dims,
                    &info.coefficients,
                    &profile.cumulative_overall[lvl],
                );
                let padded_extent = total_extent.saturating_sub(2 * zero_padding).max(1);
                let interline_extent = DivCeil::div_ceil(padded_extent, intraline_extent);

                let level = layout.level_mut(lvl);
                if kept {
                    level.intraline[ds_idx]
                        .set_factor(rank, DimSize::new(intraline_extent).unwrap());
                    level.interline[ds_idx]
                        .set_factor(rank, DimSize::new(interline_extent).unwrap());
                } else {
                    level.intraline[ds_idx].set_factor(rank, nz!(1u32));
                    level.interline[ds_idx].set_factor(rank, DimSize::new(total_extent).unwrap());
                }
            }
        }
    }
}
