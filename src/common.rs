use std::num::NonZeroU32;

/// A loop extent, tile extent, or layout factor. Factors are always positive.
pub type DimSize = NonZeroU32;

/// Index of a factorized (primitive) problem dimension.
pub type DimIdx = u8;

/// Short name of a rank: one named index of a dataspace. A rank may compound
/// several factorized dimensions via integer coefficients.
pub type RankId = char;
