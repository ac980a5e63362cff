//! Kernel lowering: one `__global__` function per stage.
//!
//! ```text
//! pidx  = blockIdx.x * blockDim.x + threadIdx.x      one element per thread
//! kidx  = blockIdx.y * blockDim.y + threadIdx.y      Parallel only
//! [klo, khi)  per loop order, guarded by kIter >= upper
//! ```

use crate::diagnostic::Diagnostic;
use crate::ir::{Interval, Level, LoopOrder, MultiStage, Stage, StencilInstantiation};

use super::body::BodyLowering;
use super::params::stage_signature;
use super::writer::SourceWriter;

/// All do-methods of a stage must sit on the same lower and upper levels.
/// Returns the interval of the first one, which drives the vertical loop.
pub fn check_intervals(inst: &StencilInstantiation, stage: &Stage) -> Result<Interval, Diagnostic> {
    let first = match stage.do_methods.first() {
        Some(dm) => dm.interval,
        None => {
            return Err(Diagnostic::error(format!(
                "stage {} of '{}' has no do-methods",
                stage.id, inst.name
            )))
        }
    };
    for dm in &stage.do_methods[1..] {
        if !first.same_levels(&dm.interval) {
            return Err(Diagnostic::error(format!(
                "intervals in a stage must have same levels (stage {} of '{}')",
                stage.id, inst.name
            ))
            .with_note(format!(
                "first do-method spans {}..{}, another spans {}..{}",
                describe_level(first.lower.level),
                describe_level(first.upper.level),
                describe_level(dm.interval.lower.level),
                describe_level(dm.interval.upper.level)
            )));
        }
    }
    Ok(first)
}

fn describe_level(level: Level) -> String {
    match level {
        Level::Absolute(l) => l.to_string(),
        Level::End => "end".to_string(),
    }
}

// ─── Vertical loop ────────────────────────────────────────────────

/// `int klo = ...; int khi = ...;` (plus `kidx` for Parallel).
pub fn vertical_bounds(order: LoopOrder, interval: &Interval) -> Vec<String> {
    let lower = interval.lower.render("kSize");
    let upper = interval.upper.render("kSize");
    match order {
        LoopOrder::Parallel => {
            let lo = if interval.lower.is_end() {
                format!("({})", lower)
            } else {
                lower
            };
            vec![
                "unsigned int kidx = blockIdx.y * blockDim.y + threadIdx.y;".to_string(),
                format!("int klo = kidx * LEVELS_PER_THREAD + {};", lo),
                "int khi = klo + LEVELS_PER_THREAD;".to_string(),
            ]
        }
        LoopOrder::Forward => vec![
            format!("int klo = {};", lower),
            format!("int khi = {};", upper),
        ],
        LoopOrder::Backward => vec![
            format!("int klo = {} - 1;", upper),
            format!("int khi = {} - 1;", lower),
        ],
    }
}

/// `for(int kIter = klo; kIter < khi; kIter++)` or the descending form.
pub fn vertical_loop_head(order: LoopOrder) -> &'static str {
    match order {
        LoopOrder::Backward => "for(int kIter = klo; kIter > khi; kIter--)",
        LoopOrder::Parallel | LoopOrder::Forward => "for(int kIter = klo; kIter < khi; kIter++)",
    }
}

/// The levels one thread walks, resolved for a concrete vertical size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelLoop {
    pub klo: i64,
    pub khi: i64,
    pub descending: bool,
    /// `kIter >= guard` ends the thread.
    pub guard: i64,
}

impl LevelLoop {
    pub fn new(
        order: LoopOrder,
        interval: &Interval,
        k_size: i64,
        kidx: i64,
        levels_per_thread: i64,
    ) -> Self {
        let lower = interval.lower.eval(k_size);
        let upper = interval.upper.eval(k_size);
        let (klo, khi, descending) = match order {
            LoopOrder::Parallel => {
                let klo = kidx * levels_per_thread + lower;
                (klo, klo + levels_per_thread, false)
            }
            LoopOrder::Forward => (lower, upper, false),
            LoopOrder::Backward => (upper - 1, lower - 1, true),
        };
        Self {
            klo,
            khi,
            descending,
            guard: upper,
        }
    }

    /// Levels the thread actually executes, in order.
    pub fn levels(&self) -> Vec<i64> {
        let mut out = Vec::new();
        let mut k = self.klo;
        loop {
            let running = if self.descending {
                k > self.khi
            } else {
                k < self.khi
            };
            if !running || k >= self.guard {
                break;
            }
            out.push(k);
            k += if self.descending { -1 } else { 1 };
        }
        out
    }
}

// ─── Kernel emission ──────────────────────────────────────────────

pub fn emit_kernel(
    w: &mut SourceWriter,
    inst: &StencilInstantiation,
    ms: &MultiStage,
    stage: &Stage,
) -> Result<(), Diagnostic> {
    let interval = check_intervals(inst, stage)?;
    let sig = stage_signature(inst, ms, stage);

    if let Some(template) = sig.template_decl() {
        w.line(template);
    }
    w.open(format!(
        "__global__ void {}({})",
        sig.kernel_name,
        sig.param_list()
    ));
    w.line("unsigned int pidx = blockIdx.x * blockDim.x + threadIdx.x;");
    for line in vertical_bounds(ms.loop_order, &interval) {
        w.line(line);
    }
    w.open("if (pidx >= hSize)");
    w.line("return;");
    w.close();
    if stage.is_restricted() {
        w.line("pidx += hOffset;");
    }

    w.open(vertical_loop_head(ms.loop_order));
    w.open(format!("if (kIter >= {})", interval.upper.render("kSize")));
    w.line("return;");
    w.close();
    let mut lowering = BodyLowering::new(inst, stage);
    for dm in &stage.do_methods {
        lowering.lower_stmts(w, &dm.body)?;
    }
    w.close();
    w.close();
    Ok(())
}

/// Every stage kernel of the instantiation, in program order.
pub fn emit_kernels(w: &mut SourceWriter, inst: &StencilInstantiation) -> Result<(), Diagnostic> {
    for stencil in &inst.stencils {
        for (ms, stage) in stencil.stages() {
            emit_kernel(w, inst, ms, stage)?;
            w.line("");
        }
    }
    Ok(())
}
