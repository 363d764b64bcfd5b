//! Preconditions of auto-scheduling.

use kiln_ir::func::{DimKind, LoopLevel};
use kiln_ir::{Env, ForType, Function};

use crate::error::*;

fn partial(f: &Function, detail: impl Into<String>) -> Error {
    Error::PartialSchedule { func: f.name().to_string(), detail: detail.into() }
}

/// Reject functions carrying any user schedule.
///
/// A function is unscheduled when it is inlined (outputs excepted), no stage
/// has splits or non-serial loops, and every stage's loop nest is in its
/// default order: reduction variables innermost in domain order, then the
/// pure variables in argument order. Extern functions are not checked.
pub fn validate_no_partial_schedules(f: &Function, is_output: bool) -> Result<()> {
    if f.has_extern_definition() {
        return Ok(());
    }
    let sched = f.schedule();
    if !is_output && sched.compute_level != LoopLevel::Inlined {
        return Err(partial(f, "it is computed at root or at a loop level"));
    }
    if !is_output && sched.store_level != LoopLevel::Inlined {
        return Err(partial(f, "it has a storage level"));
    }

    for (stage, def) in f.stages().enumerate() {
        let schedule = &def.schedule;
        if !schedule.splits.is_empty() {
            return Err(partial(f, format!("stage {stage} has splits")));
        }
        if let Some(d) = schedule.dims.iter().find(|d| d.for_type != ForType::Serial) {
            return Err(partial(f, format!("dimension {} of stage {stage} is {}", d.var, d.for_type)));
        }

        if stage == 0 {
            let in_order = schedule.dims.len() == f.dimensions()
                && schedule.dims.iter().zip(f.args()).all(|(d, a)| d.var == *a);
            if !in_order {
                return Err(partial(f, "the pure definition's dimensions were reordered"));
            }
            continue;
        }

        let rvars = &schedule.rvars;
        if schedule.dims.len() < rvars.len() {
            return Err(partial(f, format!("stage {stage} lost reduction dimensions")));
        }
        let (inner, outer) = schedule.dims.split_at(rvars.len());
        let rvars_in_order = inner.iter().zip(rvars).all(|(d, rv)| d.var == rv.var && d.is_rvar());
        if !rvars_in_order {
            return Err(partial(f, format!("reduction dimensions of stage {stage} were reordered")));
        }
        let mut last = None;
        for d in outer {
            let position = f.args().iter().position(|a| *a == d.var);
            match position {
                Some(p) if d.kind == DimKind::PureVar && last.is_none_or(|l| p > l) => last = Some(p),
                _ => return Err(partial(f, format!("pure dimensions of stage {stage} were reordered"))),
            }
        }
    }
    Ok(())
}

/// First output dimension without a constant `(min, extent)` estimate.
///
/// Returns `(function, variable)` of the offending dimension.
pub fn check_estimates_on_outputs<S: AsRef<str>>(outputs: &[S], env: &Env) -> Option<(String, String)> {
    for out in outputs {
        let Some(f) = env.lookup(out.as_ref()) else { continue };
        for arg in f.args() {
            let estimate = f.schedule().estimates.iter().rev().find(|e| e.var == *arg);
            let constant = estimate.is_some_and(|e| e.min.as_int().is_some() && e.extent.as_int().is_some());
            if !constant {
                return Some((f.name().to_string(), arg.clone()));
            }
        }
    }
    None
}
