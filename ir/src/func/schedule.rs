//! Per-function and per-stage scheduling metadata.

use std::sync::Arc;

use crate::expr::{Expr, ReductionVariable};
use crate::types::{DeviceApi, ForType, MemoryType};

/// How a loop dimension of a stage relates to the function's arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DimKind {
    /// Pure argument of the function.
    PureVar,
    /// Reduction variable whose iterations never race.
    PureRVar,
    /// Reduction variable whose iterations must run in order.
    ImpureRVar,
}

/// One loop of a stage's loop nest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dim {
    pub var: String,
    pub for_type: ForType,
    pub device_api: DeviceApi,
    pub kind: DimKind,
}

impl Dim {
    pub fn pure(var: impl Into<String>) -> Self {
        Self { var: var.into(), for_type: ForType::Serial, device_api: DeviceApi::None, kind: DimKind::PureVar }
    }

    pub fn rvar(var: impl Into<String>, kind: DimKind) -> Self {
        Self { var: var.into(), for_type: ForType::Serial, device_api: DeviceApi::None, kind }
    }

    pub fn is_pure(&self) -> bool {
        matches!(self.kind, DimKind::PureVar | DimKind::PureRVar)
    }

    pub fn is_rvar(&self) -> bool {
        matches!(self.kind, DimKind::PureRVar | DimKind::ImpureRVar)
    }
}

/// What happens to the last partial tile when a dimension is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display)]
pub enum TailStrategy {
    #[default]
    Auto,
    GuardWithIf,
    ShiftInwards,
    RoundUp,
}

/// `old_var` split into `outer * factor + inner`.
#[derive(Debug, Clone)]
pub struct Split {
    pub old_var: String,
    pub outer: String,
    pub inner: String,
    pub factor: Arc<Expr>,
    pub tail: TailStrategy,
}

/// Loop at which a function is computed or stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoopLevel {
    #[default]
    Inlined,
    Root,
    At { func: String, var: String },
}

/// User estimate of the range of one pure argument.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub var: String,
    pub min: Arc<Expr>,
    pub extent: Arc<Expr>,
}

impl Estimate {
    pub fn new(var: impl Into<String>, min: i64, extent: i64) -> Self {
        Self { var: var.into(), min: Expr::int(min), extent: Expr::int(extent) }
    }
}

/// Loop nest of one stage. `dims` is ordered innermost first.
#[derive(Debug, Clone, Default)]
pub struct StageSchedule {
    pub dims: Vec<Dim>,
    pub rvars: Vec<ReductionVariable>,
    pub splits: Vec<Split>,
    /// Set once a user directive changes this stage.
    pub touched: bool,
}

impl StageSchedule {
    pub fn for_pure_args(args: &[String]) -> Self {
        Self { dims: args.iter().map(Dim::pure).collect(), ..Self::default() }
    }

    pub fn dim(&self, var: &str) -> Option<&Dim> {
        self.dims.iter().find(|d| d.var == var)
    }

    pub fn dim_mut(&mut self, var: &str) -> Option<&mut Dim> {
        self.dims.iter_mut().find(|d| d.var == var)
    }
}

/// Storage and compute placement of a function, shared by all its stages.
#[derive(Debug, Clone, Default)]
pub struct FuncSchedule {
    pub compute_level: LoopLevel,
    pub store_level: LoopLevel,
    pub estimates: Vec<Estimate>,
    pub is_async: bool,
    pub memory_type: MemoryType,
}

impl FuncSchedule {
    pub fn estimate(&self, var: &str) -> Option<&Estimate> {
        self.estimates.iter().find(|e| e.var == var)
    }

    /// Add or replace the estimate for `var`.
    pub fn set_estimate(&mut self, estimate: Estimate) {
        match self.estimates.iter_mut().find(|e| e.var == estimate.var) {
            Some(slot) => *slot = estimate,
            None => self.estimates.push(estimate),
        }
    }

    /// Placement differs from the default inlined schedule.
    pub fn is_touched(&self) -> bool {
        self.compute_level != LoopLevel::Inlined || self.store_level != LoopLevel::Inlined
    }
}
