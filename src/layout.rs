use nonzero::nonzero as nz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};

use crate::arch::ArchSpecs;
use crate::common::{DimSize, RankId};
use crate::utils::join_into_string;
use crate::workload::Workload;

/// Whether a nest describes placement within one memory line or across lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NestKind {
    Interline,
    Intraline,
}

/// The factor each rank of one dataspace contributes at one storage level,
/// together with the permutation order over those ranks.
///
/// Absent ranks read as factor 1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutNest {
    pub data_space: String,
    pub kind: NestKind,
    pub ranks: Vec<RankId>,
    pub factors: HashMap<RankId, DimSize>,
}

/// Layout of one storage level: an interline and an intraline nest per
/// dataspace, plus the level's static port counts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelLayout {
    pub target: String,
    pub num_read_ports: u32,
    pub num_write_ports: u32,
    pub interline: Vec<LayoutNest>,
    pub intraline: Vec<LayoutNest>,
}

/// Per-storage-level layouts, innermost level first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layouts(Vec<LevelLayout>);

/// One external configuration entry: the factors and permutation of one nest
/// kind at one storage level. `factors` holds space-separated `RANK=INT`
/// pairs; `permutation` names one rank per character, outermost first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConfigEntry {
    pub target: String,
    #[serde(rename = "type")]
    pub kind: NestKind,
    pub factors: String,
    pub permutation: String,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LayoutConfigError {
    #[error("no permutation key found in any layout entry")]
    MissingPermutation,
    #[error("malformed factors token {0:?} (expected RANK=INT)")]
    MalformedFactor(String),
    #[error("factor for rank {0} must be a positive integer")]
    NonPositiveFactor(RankId),
}

impl Display for NestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NestKind::Interline => write!(f, "interline"),
            NestKind::Intraline => write!(f, "intraline"),
        }
    }
}

impl LayoutNest {
    /// The factor of `rank`, defaulting to 1 when unset.
    pub fn factor(&self, rank: RankId) -> DimSize {
        self.factors.get(&rank).copied().unwrap_or(nz!(1u32))
    }

    pub fn set_factor(&mut self, rank: RankId, value: DimSize) {
        self.factors.insert(rank, value);
    }

    /// Product of the factors over this nest's ranks.
    pub fn factor_product(&self) -> u64 {
        self.ranks
            .iter()
            .map(|&r| u64::from(self.factor(r).get()))
            .product()
    }
}

fn parse_factors(factors: &str) -> Result<HashMap<RankId, DimSize>, LayoutConfigError> {
    let mut parsed = HashMap::new();
    for token in factors.split_whitespace() {
        let (name, value) = token
            .split_once('=')
            .ok_or_else(|| LayoutConfigError::MalformedFactor(token.to_string()))?;
        let mut name_chars = name.chars();
        let (Some(rank), None) = (name_chars.next(), name_chars.next()) else {
            return Err(LayoutConfigError::MalformedFactor(token.to_string()));
        };
        let value: u32 = value
            .parse()
            .map_err(|_| LayoutConfigError::MalformedFactor(token.to_string()))?;
        let value = DimSize::new(value).ok_or(LayoutConfigError::NonPositiveFactor(rank))?;
        parsed.insert(rank, value);
    }
    Ok(parsed)
}

/// The permutation's ranks restricted to `ranks`, innermost first.
fn nest_order(permutation: &str, ranks: &[RankId]) -> Vec<RankId> {
    let mut order: Vec<RankId> = permutation.chars().filter(|c| ranks.contains(c)).collect();
    order.reverse();
    order
}

impl Layouts {
    /// Build per-level layouts from external configuration entries.
    ///
    /// Entries missing for a (target, type) pair fall back to the dataspace's
    /// own rank order with unit factors.
    pub fn from_config(
        entries: &[LayoutConfigEntry],
        workload: &Workload,
        arch: &ArchSpecs,
    ) -> Result<Layouts, LayoutConfigError> {
        if !entries.iter().any(|e| !e.permutation.is_empty()) {
            return Err(LayoutConfigError::MissingPermutation);
        }

        let mut config: HashMap<(&str, NestKind), (&str, HashMap<RankId, DimSize>)> =
            HashMap::new();
        for entry in entries {
            let factors = parse_factors(&entry.factors)?;
            config.insert(
                (entry.target.as_str(), entry.kind),
                (entry.permutation.as_str(), factors),
            );
        }

        let mut levels = Vec::with_capacity(arch.num_levels());
        for level_spec in arch.levels() {
            let mut level = LevelLayout {
                target: level_spec.name.clone(),
                num_read_ports: level_spec.num_read_ports,
                num_write_ports: level_spec.num_write_ports,
                interline: Vec::new(),
                intraline: Vec::new(),
            };
            for ds in workload.dataspaces() {
                for kind in [NestKind::Interline, NestKind::Intraline] {
                    let nest = match config.get(&(level_spec.name.as_str(), kind)) {
                        Some((permutation, factors)) => LayoutNest {
                            data_space: ds.name.clone(),
                            kind,
                            ranks: nest_order(permutation, &ds.ranks),
                            factors: factors
                                .iter()
                                .filter(|(r, _)| ds.ranks.contains(*r))
                                .map(|(&r, &f)| (r, f))
                                .collect(),
                        },
                        None => LayoutNest {
                            data_space: ds.name.clone(),
                            kind,
                            ranks: ds.ranks.clone(),
                            factors: ds.ranks.iter().map(|&r| (r, nz!(1u32))).collect(),
                        },
                    };
                    match kind {
                        NestKind::Interline => level.interline.push(nest),
                        NestKind::Intraline => level.intraline.push(nest),
                    }
                }
            }
            levels.push(level);
        }
        Ok(Layouts(levels))
    }

    /// An all-ones skeleton layout for every level and dataspace.
    pub fn dummy(workload: &Workload, arch: &ArchSpecs) -> Layouts {
        let levels = arch
            .levels()
            .iter()
            .map(|level_spec| LevelLayout {
                target: level_spec.name.clone(),
                num_read_ports: level_spec.num_read_ports,
                num_write_ports: level_spec.num_write_ports,
                interline: workload
                    .dataspaces()
                    .iter()
                    .map(|ds| LayoutNest {
                        data_space: ds.name.clone(),
                        kind: NestKind::Interline,
                        ranks: ds.ranks.clone(),
                        factors: ds.ranks.iter().map(|&r| (r, nz!(1u32))).collect(),
                    })
                    .collect(),
                intraline: workload
                    .dataspaces()
                    .iter()
                    .map(|ds| LayoutNest {
                        data_space: ds.name.clone(),
                        kind: NestKind::Intraline,
                        ranks: ds.ranks.clone(),
                        factors: ds.ranks.iter().map(|&r| (r, nz!(1u32))).collect(),
                    })
                    .collect(),
            })
            .collect();
        Layouts(levels)
    }

    pub fn num_levels(&self) -> usize {
        self.0.len()
    }

    pub fn levels(&self) -> &[LevelLayout] {
        &self.0
    }

    pub fn level(&self, level: usize) -> &LevelLayout {
        &self.0[level]
    }

    pub fn level_mut(&mut self, level: usize) -> &mut LevelLayout {
        &mut self.0[level]
    }

    /// Combined configuration entries, outermost level first. When dataspaces
    /// disagree on a rank's factor, the maximum is taken.
    pub fn dump_entries(&self) -> Vec<LayoutConfigEntry> {
        let mut entries = Vec::new();
        for level in self.0.iter().rev() {
            for (kind, nests) in [
                (NestKind::Interline, &level.interline),
                (NestKind::Intraline, &level.intraline),
            ] {
                if nests.is_empty() {
                    continue;
                }
                let mut combined_ranks: Vec<RankId> = Vec::new();
                let mut combined_factors: HashMap<RankId, DimSize> = HashMap::new();
                for nest in nests {
                    for &rank in &nest.ranks {
                        if !combined_ranks.contains(&rank) {
                            combined_ranks.push(rank);
                        }
                        let factor = nest.factor(rank);
                        combined_factors
                            .entry(rank)
                            .and_modify(|f| *f = (*f).max(factor))
                            .or_insert(factor);
                    }
                }
                entries.push(LayoutConfigEntry {
                    target: level.target.clone(),
                    kind,
                    factors: join_into_string(
                        combined_ranks
                            .iter()
                            .map(|&r| format!("{}={}", r, combined_factors[&r])),
                        " ",
                    ),
                    permutation: combined_ranks.iter().collect(),
                });
            }
        }
        entries
    }
}

impl Display for Layouts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for level in &self.0 {
            writeln!(
                f,
                "Target: {} (read ports {}, write ports {})",
                level.target, level.num_read_ports, level.num_write_ports
            )?;
            for (interline, intraline) in level.interline.iter().zip(&level.intraline) {
                writeln!(f, "  Data space: {}", interline.data_space)?;
                for nest in [interline, intraline] {
                    writeln!(
                        f,
                        "    {}: {}",
                        nest.kind,
                        join_into_string(
                            nest.ranks.iter().map(|&r| format!("{}={}", r, nest.factor(r))),
                            ", "
                        )
                    )?;
                }
            }
        }
        Ok(())
    }
}
