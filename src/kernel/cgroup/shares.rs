//! CPU share normalization against node capacity.

/// Kernel ceiling for cpu.shares.
pub const MAX_CPU_SHARES: u64 = 262_144;
/// Kernel floor for cpu.shares.
pub const MIN_CPU_SHARES: u64 = 2;

const MAX_CPU_WEIGHT: u64 = 10_000;

/// Scales requested shares (MHz) into the range cpu.shares can express.
///
/// When the node's total compute fits under the ceiling the request passes
/// through. Otherwise it is scaled by `MAX / total` and floored, so the
/// relative weighting between tasks survives. The result is always clamped
/// to `[MIN_CPU_SHARES, MAX_CPU_SHARES]`, which keeps the mapping monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuShareNormalizer {
    total_compute: u64,
}

impl CpuShareNormalizer {
    pub fn new(total_compute: u64) -> Self {
        Self { total_compute }
    }

    pub fn total_compute(&self) -> u64 {
        self.total_compute
    }

    pub fn clamp(&self, requested: u64) -> u64 {
        let scaled = if self.total_compute == 0 || self.total_compute <= MAX_CPU_SHARES {
            requested
        } else {
            let value =
                (requested as u128 * MAX_CPU_SHARES as u128) / self.total_compute as u128;
            value.min(u64::MAX as u128) as u64
        };
        scaled.clamp(MIN_CPU_SHARES, MAX_CPU_SHARES)
    }
}

/// Map cpu.shares onto the unified hierarchy's cpu.weight range.
pub fn shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(MIN_CPU_SHARES, MAX_CPU_SHARES);
    1 + ((shares - MIN_CPU_SHARES) * (MAX_CPU_WEIGHT - 1)) / (MAX_CPU_SHARES - MIN_CPU_SHARES)
}
