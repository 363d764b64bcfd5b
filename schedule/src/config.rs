//! Pass and auto-scheduler configuration.
//!
//! Every configuration type has a `bon` builder, a `Default`, and a
//! `from_env()` constructor that falls back to the default for unset or
//! unparsable variables.

use bon::bon;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

// ============================================================================
// MACHINE PARAMETERS
// ============================================================================

/// Target machine description used by the auto-scheduler's cost model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineParams {
    /// Number of threads the schedule should keep busy.
    pub parallelism: i64,
    /// SIMD width in elements.
    pub vec_len: i64,
    /// Register file bytes available per thread.
    pub register_file_size: i64,
    /// Last-level cache size in bytes.
    pub last_level_cache_size: i64,
    /// Cost of a cache miss relative to an arithmetic operation.
    pub balance: i64,
}

impl Default for MachineParams {
    fn default() -> Self {
        Self {
            parallelism: 16,
            vec_len: 8,
            register_file_size: 1024,
            last_level_cache_size: 16 * 1024 * 1024,
            balance: 40,
        }
    }
}

#[bon]
impl MachineParams {
    #[builder]
    pub fn builder(
        #[builder(default = 16)] parallelism: i64,
        #[builder(default = 8)] vec_len: i64,
        #[builder(default = 1024)] register_file_size: i64,
        #[builder(default = 16 * 1024 * 1024)] last_level_cache_size: i64,
        #[builder(default = 40)] balance: i64,
    ) -> Self {
        Self { parallelism, vec_len, register_file_size, last_level_cache_size, balance }
    }

    /// Create parameters from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `KILN_PARALLELISM` - Thread count (default: 16)
    /// * `KILN_VEC_LEN` - SIMD width (default: 8)
    /// * `KILN_REGISTER_FILE_SIZE` - Register file bytes (default: 1024)
    /// * `KILN_LAST_LEVEL_CACHE_SIZE` - Cache bytes (default: 16 MiB)
    /// * `KILN_BALANCE` - Relative miss cost (default: 40)
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            parallelism: env_or("KILN_PARALLELISM", d.parallelism),
            vec_len: env_or("KILN_VEC_LEN", d.vec_len),
            register_file_size: env_or("KILN_REGISTER_FILE_SIZE", d.register_file_size),
            last_level_cache_size: env_or("KILN_LAST_LEVEL_CACHE_SIZE", d.last_level_cache_size),
            balance: env_or("KILN_BALANCE", d.balance),
        }
    }
}

// ============================================================================
// AUTO-SCHEDULER OPTIONS
// ============================================================================

/// Knobs of the grouping search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoScheduleOptions {
    /// Reorder loop dimensions of each group for spatial locality.
    pub reorder: bool,
    /// Reject fusions whose parallelism falls below `MachineParams::parallelism`.
    pub ensure_parallelism: bool,
    /// Smallest innermost tile extent tried; keeps a vector's worth of work.
    pub min_inner_dim: i64,
}

impl Default for AutoScheduleOptions {
    fn default() -> Self {
        Self { reorder: true, ensure_parallelism: true, min_inner_dim: 8 }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name).as_deref() {
        Ok("0") | Ok("false") | Ok("off") => false,
        Ok(_) => true,
        Err(_) => default,
    }
}

#[bon]
impl AutoScheduleOptions {
    #[builder]
    pub fn builder(
        #[builder(default = true)] reorder: bool,
        #[builder(default = true)] ensure_parallelism: bool,
        #[builder(default = 8)] min_inner_dim: i64,
    ) -> Self {
        Self { reorder, ensure_parallelism, min_inner_dim }
    }

    /// # Environment Variables
    ///
    /// * `KILN_AUTOSCHED_REORDER` - `0` disables locality reordering
    /// * `KILN_AUTOSCHED_ENSURE_PARALLELISM` - `0` disables the parallelism floor
    /// * `KILN_AUTOSCHED_MIN_INNER_DIM` - Vectorization floor (default: 8)
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            reorder: env_flag("KILN_AUTOSCHED_REORDER", d.reorder),
            ensure_parallelism: env_flag("KILN_AUTOSCHED_ENSURE_PARALLELISM", d.ensure_parallelism),
            min_inner_dim: env_or("KILN_AUTOSCHED_MIN_INNER_DIM", d.min_inner_dim),
        }
    }
}

// ============================================================================
// LOWERING OPTIONS
// ============================================================================

/// Target details for warp shuffle lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarpShuffleOptions {
    /// CUDA compute capability times ten (e.g. 75). Capabilities from 70 up
    /// use the `_sync` shuffle intrinsics.
    pub cuda_capability: u32,
}

impl Default for WarpShuffleOptions {
    fn default() -> Self {
        Self { cuda_capability: 61 }
    }
}

#[bon]
impl WarpShuffleOptions {
    #[builder]
    pub fn builder(#[builder(default = 61)] cuda_capability: u32) -> Self {
        Self { cuda_capability }
    }

    /// * `KILN_CUDA_CAPABILITY` - Compute capability times ten (default: 61)
    pub fn from_env() -> Self {
        Self { cuda_capability: env_or("KILN_CUDA_CAPABILITY", Self::default().cuda_capability) }
    }

    pub fn use_sync_intrinsics(&self) -> bool {
        self.cuda_capability >= 70
    }
}

/// Register promotion of values carried between loop iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopCarryOptions {
    /// Most values kept live across iterations of one loop. Below 2 nothing
    /// is carried.
    pub max_carried_values: usize,
}

impl Default for LoopCarryOptions {
    fn default() -> Self {
        Self { max_carried_values: 8 }
    }
}

#[bon]
impl LoopCarryOptions {
    #[builder]
    pub fn builder(#[builder(default = 8)] max_carried_values: usize) -> Self {
        Self { max_carried_values }
    }

    /// * `KILN_MAX_CARRIED_VALUES` - Carried values per loop (default: 8)
    pub fn from_env() -> Self {
        Self { max_carried_values: env_or("KILN_MAX_CARRIED_VALUES", Self::default().max_carried_values) }
    }
}

/// Loop partitioning switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOptions {
    pub enabled: bool,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[bon]
impl PartitionOptions {
    #[builder]
    pub fn builder(#[builder(default = true)] enabled: bool) -> Self {
        Self { enabled }
    }

    /// * `KILN_NO_PARTITION` - Disable loop partitioning if set
    pub fn from_env() -> Self {
        Self { enabled: std::env::var("KILN_NO_PARTITION").is_err() }
    }
}
