//! Emulated kernel execution.
//!
//! A launch walks the grid in block order and runs every thread the way the
//! generated kernel does: `pidx` from the block/thread index, the early
//! return past `hSize`, the `hOffset` shift, then the vertical loop of
//! [`LevelLoop`] with the body of every do-method. Field indices come from
//! the same [`ResolvedAccess`] the code generator renders.

use std::collections::BTreeMap;

use crate::codegen::body::{check_call, check_global, check_weights, ChainState, Scope};
use crate::codegen::kernel::{check_intervals, LevelLoop};
use crate::codegen::params::{stage_signature, ParamKind, StageSignature};
use crate::diagnostic::Diagnostic;
use crate::ir::{
    AssignOp, BinaryOp, Expr, FieldAccess, FieldId, IterationSpace, LValue, LoopOrder, MathFn,
    MultiStage, Reduction, ReductionOp, Stage, Stmt, StencilInstantiation, UnaryOp,
};
use crate::mesh::table::DEVICE_MISSING_VALUE;
use crate::mesh::GpuTriMesh;

use super::GlobalValue;

/// Device buffers by field, in device layout.
pub type Buffers<'b> = BTreeMap<FieldId, &'b mut [f64]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

/// Launch geometry: one thread per element along X and, for Parallel
/// multistages, one chunk of `levels_per_thread` levels per block along Y.
pub fn grid(
    k_extent: i64,
    el_size: usize,
    kparallel: bool,
    block_size: u32,
    levels_per_thread: u32,
) -> Dim3 {
    let x = el_size.div_ceil(block_size as usize) as u32;
    let y = if kparallel {
        (k_extent.max(0) as u64).div_ceil(u64::from(levels_per_thread)) as u32
    } else {
        1
    };
    Dim3::new(x, y, 1)
}

/// What one emulated kernel launch did.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelLaunch {
    pub kernel: String,
    pub grid: Dim3,
    pub block: Dim3,
    pub h_offset: usize,
    pub h_size: usize,
    /// Kernel parameters, in signature order.
    pub params: Vec<String>,
    /// Lowest and highest level any thread executed.
    pub visited_levels: Option<(i64, i64)>,
}

// ─── Values ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl Value {
    fn as_f64(self) -> f64 {
        match self {
            Value::Float(v) => v,
            Value::Int(v) => v as f64,
            Value::Bool(b) => f64::from(u8::from(b)),
        }
    }

    fn as_int(self) -> Option<i64> {
        match self {
            Value::Float(_) => None,
            Value::Int(v) => Some(v),
            Value::Bool(b) => Some(i64::from(b)),
        }
    }

    fn truthy(self) -> bool {
        match self {
            Value::Float(v) => v != 0.0,
            Value::Int(v) => v != 0,
            Value::Bool(b) => b,
        }
    }
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> Result<Value, Diagnostic> {
    if let (Some(a), Some(b)) = (l.as_int(), r.as_int()) {
        return Ok(Value::Int(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            _ => {
                if b == 0 {
                    return Err(Diagnostic::error("integer division by zero".to_string()));
                }
                a.wrapping_div(b)
            }
        }));
    }
    let (a, b) = (l.as_f64(), r.as_f64());
    Ok(Value::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        _ => a / b,
    }))
}

fn compare(op: BinaryOp, l: Value, r: Value) -> bool {
    let ord = match (l.as_int(), r.as_int()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => l.as_f64().partial_cmp(&r.as_f64()),
    };
    let Some(ord) = ord else {
        // NaN compares unequal to everything
        return op == BinaryOp::Ne;
    };
    match op {
        BinaryOp::Lt => ord.is_lt(),
        BinaryOp::Le => ord.is_le(),
        BinaryOp::Gt => ord.is_gt(),
        BinaryOp::Ge => ord.is_ge(),
        BinaryOp::Eq => ord.is_eq(),
        _ => ord.is_ne(),
    }
}

fn math(func: MathFn, args: &[f64]) -> f64 {
    match func {
        MathFn::Sqrt => args[0].sqrt(),
        MathFn::Abs => args[0].abs(),
        MathFn::Exp => args[0].exp(),
        MathFn::Log => args[0].ln(),
        MathFn::Pow => args[0].powf(args[1]),
        MathFn::Min => args[0].min(args[1]),
        MathFn::Max => args[0].max(args[1]),
        MathFn::Sin => args[0].sin(),
        MathFn::Cos => args[0].cos(),
    }
}

fn assign(op: AssignOp, current: f64, value: f64) -> f64 {
    match op {
        AssignOp::Assign => value,
        AssignOp::Add => current + value,
        AssignOp::Sub => current - value,
        AssignOp::Mul => current * value,
        AssignOp::Div => current / value,
    }
}

// ─── Threads ──────────────────────────────────────────────────────

/// Per-thread, per-level state.
struct Thread {
    scope: Scope,
    pidx: usize,
    k_iter: i64,
    nbh_idx: Vec<usize>,
    nbh_iter: Vec<usize>,
    locals: Vec<(String, Value)>,
}

impl Thread {
    fn local(&self, name: &str) -> Result<Value, Diagnostic> {
        self.locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| Diagnostic::error(format!("use of undeclared variable '{}'", name)))
    }

    fn local_mut(&mut self, name: &str) -> Result<&mut Value, Diagnostic> {
        self.locals
            .iter_mut()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| {
                Diagnostic::error(format!("assignment to undeclared variable '{}'", name))
            })
    }
}

// ─── Device ───────────────────────────────────────────────────────

/// Everything a launch reads besides the field buffers.
pub struct Device<'d> {
    pub inst: &'d StencilInstantiation,
    pub mesh: &'d GpuTriMesh,
    pub globals: &'d BTreeMap<String, GlobalValue>,
    pub k_size: usize,
    pub block_size: u32,
    pub levels_per_thread: u32,
}

impl Device<'_> {
    /// Element range `[h_offset, h_offset + h_size)` of a stage.
    pub fn horizontal_range(&self, stage: &Stage) -> Result<(usize, usize), Diagnostic> {
        let Some(range) = &stage.domain else {
            return Ok((0, self.mesh.num_elements(stage.location)));
        };
        let lower = self.mesh.horizontal_index(
            stage.location,
            range.lower.subdomain,
            range.lower.offset,
        )?;
        let upper = self.mesh.horizontal_index(
            stage.location,
            range.upper.subdomain,
            range.upper.offset,
        )?;
        if upper < lower {
            return Err(Diagnostic::error(format!(
                "horizontal range of stage {} ends at {} before it starts at {}",
                stage.id, upper, lower
            )));
        }
        let count = self.mesh.num_elements(stage.location);
        if upper > count {
            return Err(Diagnostic::error(format!(
                "horizontal range of stage {} ends at {}, past the {} {}",
                stage.id,
                upper,
                count,
                stage.location.plural().to_lowercase()
            ))
            .with_help("check the splitter indices of the mesh descriptor".to_string()));
        }
        Ok((lower, upper - lower))
    }

    /// Check that every kernel parameter has something to bind to.
    fn bind(&self, sig: &StageSignature, buffers: &Buffers<'_>) -> Result<(), Diagnostic> {
        for param in &sig.params {
            match &param.kind {
                ParamKind::Table(space) => {
                    if self.mesh.table(space).is_none() {
                        return Err(Diagnostic::error(format!(
                            "kernel '{}' needs table '{}' the mesh does not hold",
                            sig.kernel_name,
                            space.table_name()
                        )));
                    }
                }
                ParamKind::Field(f) => {
                    if !buffers.contains_key(&f.field) {
                        return Err(Diagnostic::error(format!(
                            "field '{}' has no device buffer",
                            self.inst.field_name(f.field)
                        ))
                        .with_help("call copy_memory or copy_pointers before run".to_string()));
                    }
                }
                ParamKind::Globals
                | ParamKind::Size(_)
                | ParamKind::KSize
                | ParamKind::HorizontalOffset
                | ParamKind::HorizontalSize => {}
            }
        }
        Ok(())
    }

    /// Run one stage kernel. `None` when the stage covers no elements.
    pub fn launch(
        &self,
        ms: &MultiStage,
        stage: &Stage,
        buffers: &mut Buffers<'_>,
    ) -> Result<Option<KernelLaunch>, Diagnostic> {
        let interval = check_intervals(self.inst, stage)?;
        let (h_offset, h_size) = self.horizontal_range(stage)?;
        if h_size == 0 {
            return Ok(None);
        }
        let sig = stage_signature(self.inst, ms, stage);
        self.bind(&sig, buffers)?;

        let k_size = self.k_size as i64;
        let parallel = ms.loop_order == LoopOrder::Parallel;
        let grid = grid(
            interval.extent_for(k_size),
            h_size,
            parallel,
            self.block_size,
            self.levels_per_thread,
        );
        let block = Dim3::new(self.block_size, 1, 1);
        let mut visited: Option<(i64, i64)> = None;

        for block_y in 0..grid.y {
            for block_x in 0..grid.x {
                for thread_x in 0..block.x {
                    let pidx = (block_x * block.x + thread_x) as usize;
                    if pidx >= h_size {
                        continue;
                    }
                    let pidx = pidx + h_offset;
                    let levels = LevelLoop::new(
                        ms.loop_order,
                        &interval,
                        k_size,
                        i64::from(block_y),
                        i64::from(self.levels_per_thread),
                    );
                    for k_iter in levels.levels() {
                        visited = Some(match visited {
                            None => (k_iter, k_iter),
                            Some((lo, hi)) => (lo.min(k_iter), hi.max(k_iter)),
                        });
                        let mut thread = Thread {
                            scope: Scope::new(stage.location),
                            pidx,
                            k_iter,
                            nbh_idx: Vec::new(),
                            nbh_iter: Vec::new(),
                            locals: Vec::new(),
                        };
                        for dm in &stage.do_methods {
                            self.exec_stmts(&mut thread, &dm.body, buffers)?;
                        }
                    }
                }
            }
        }

        Ok(Some(KernelLaunch {
            kernel: sig.kernel_name.clone(),
            grid,
            block,
            h_offset,
            h_size,
            params: sig.param_names().iter().map(|p| p.to_string()).collect(),
            visited_levels: visited,
        }))
    }

    // ─── Statements ───────────────────────────────────────────────

    fn exec_stmts(
        &self,
        t: &mut Thread,
        stmts: &[Stmt],
        buffers: &mut Buffers<'_>,
    ) -> Result<(), Diagnostic> {
        for stmt in stmts {
            self.exec_stmt(t, stmt, buffers)?;
        }
        Ok(())
    }

    fn exec_scoped(
        &self,
        t: &mut Thread,
        stmts: &[Stmt],
        buffers: &mut Buffers<'_>,
    ) -> Result<(), Diagnostic> {
        let mark = t.locals.len();
        self.exec_stmts(t, stmts, buffers)?;
        t.locals.truncate(mark);
        Ok(())
    }

    fn exec_stmt(
        &self,
        t: &mut Thread,
        stmt: &Stmt,
        buffers: &mut Buffers<'_>,
    ) -> Result<(), Diagnostic> {
        match stmt {
            Stmt::VarDecl { name, init } => {
                let value = match init {
                    Some(init) => self.eval(t, init, buffers)?.as_f64(),
                    None => 0.0,
                };
                t.locals.push((name.clone(), Value::Float(value)));
            }
            Stmt::Assign { target, op, value } => {
                let value = self.eval(t, value, buffers)?.as_f64();
                match target {
                    LValue::Var(name) => {
                        let slot = t.local_mut(name)?;
                        *slot = Value::Float(assign(*op, slot.as_f64(), value));
                    }
                    LValue::Field(access) => {
                        let (field, idx) = self.locate(t, access, buffers)?;
                        if let Some(buf) = buffers.get_mut(&field) {
                            buf[idx] = assign(*op, buf[idx], value);
                        }
                    }
                }
            }
            Stmt::If { cond, then, els } => {
                if self.eval(t, cond, buffers)?.truthy() {
                    self.exec_scoped(t, then, buffers)?;
                } else {
                    self.exec_scoped(t, els, buffers)?;
                }
            }
            Stmt::Block(body) => self.exec_scoped(t, body, buffers)?,
            Stmt::NeighborLoop { space, body } => {
                self.for_each_neighbor(t, space, |t, _| self.exec_scoped(t, body, buffers))?;
            }
        }
        Ok(())
    }

    /// Visit every non-sentinel slot of the chain's table for the current
    /// origin element, with the chain pushed onto the thread's scope.
    fn for_each_neighbor(
        &self,
        t: &mut Thread,
        space: &IterationSpace,
        mut visit: impl FnMut(&mut Thread, usize) -> Result<(), Diagnostic>,
    ) -> Result<(), Diagnostic> {
        let depth = t.scope.enter(space)?;
        let table = self.mesh.table(space).ok_or_else(|| {
            Diagnostic::error(format!(
                "neighbor table for '{}' is missing from the mesh",
                space
            ))
        })?;
        let origin = if depth == 0 {
            t.pidx
        } else {
            t.nbh_idx[depth - 1]
        };
        for slot in 0..space.table_size() {
            let neighbor = table.get(slot, origin).ok_or_else(|| {
                Diagnostic::error(format!(
                    "element {} is outside table '{}' of {} rows",
                    origin,
                    space.table_name(),
                    table.num_elements()
                ))
            })?;
            if neighbor == DEVICE_MISSING_VALUE {
                continue;
            }
            t.nbh_idx.push(neighbor as usize);
            t.nbh_iter.push(slot);
            visit(t, slot)?;
            t.nbh_idx.pop();
            t.nbh_iter.pop();
        }
        t.scope.leave();
        Ok(())
    }

    // ─── Expressions ──────────────────────────────────────────────

    /// Resolve a field access to `(field, device index)`, bounds-checked.
    fn locate(
        &self,
        t: &Thread,
        access: &FieldAccess,
        buffers: &Buffers<'_>,
    ) -> Result<(FieldId, usize), Diagnostic> {
        let resolved = t.scope.resolve(self.inst, access)?;
        let chains = ChainState {
            pidx: t.pidx,
            nbh_idx: &t.nbh_idx,
            nbh_iter: &t.nbh_iter,
        };
        let idx = resolved.index(t.k_iter, &chains, |loc| self.mesh.stride(loc));
        let len = buffers.get(&access.field).map_or(0, |b| b.len());
        if idx < 0 || idx as usize >= len {
            return Err(Diagnostic::error(format!(
                "access to '{}' at index {} is outside its buffer of {} values",
                self.inst.field_name(access.field),
                idx,
                len
            ))
            .with_note(format!("level {}, element {}", t.k_iter, t.pidx)));
        }
        Ok((access.field, idx as usize))
    }

    fn eval(
        &self,
        t: &mut Thread,
        expr: &Expr,
        buffers: &mut Buffers<'_>,
    ) -> Result<Value, Diagnostic> {
        Ok(match expr {
            Expr::Literal(v) => Value::Float(*v),
            Expr::Int(v) => Value::Int(*v),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Var(name) => t.local(name)?,
            Expr::Global(name) => {
                check_global(self.inst, name)?;
                match self.globals.get(name) {
                    Some(GlobalValue::Boolean(b)) => Value::Bool(*b),
                    Some(GlobalValue::Integer(i)) => Value::Int(*i),
                    Some(GlobalValue::Float(f)) => Value::Float(f64::from(*f)),
                    Some(GlobalValue::Double(d)) => Value::Float(*d),
                    Some(GlobalValue::String(_)) => {
                        return Err(Diagnostic::error(format!(
                            "string global '{}' used in an expression",
                            name
                        )))
                    }
                    None => {
                        return Err(Diagnostic::error(format!(
                            "global '{}' was never set",
                            name
                        ))
                        .with_help(format!("call set_global(\"{}\", ..) before run", name)))
                    }
                }
            }
            Expr::Field(access) => {
                let (field, idx) = self.locate(t, access, buffers)?;
                Value::Float(buffers.get(&field).map_or(0.0, |b| b[idx]))
            }
            Expr::Unary { op, operand } => {
                let v = self.eval(t, operand, buffers)?;
                match op {
                    UnaryOp::Not => Value::Bool(!v.truthy()),
                    UnaryOp::Neg => match v {
                        Value::Float(f) => Value::Float(-f),
                        other => Value::Int(-other.as_int().unwrap_or(0)),
                    },
                }
            }
            Expr::Binary { op, lhs, rhs } => match op {
                BinaryOp::And => Value::Bool(
                    self.eval(t, lhs, buffers)?.truthy() && self.eval(t, rhs, buffers)?.truthy(),
                ),
                BinaryOp::Or => Value::Bool(
                    self.eval(t, lhs, buffers)?.truthy() || self.eval(t, rhs, buffers)?.truthy(),
                ),
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                    let l = self.eval(t, lhs, buffers)?;
                    let r = self.eval(t, rhs, buffers)?;
                    arithmetic(*op, l, r)?
                }
                _ => {
                    let l = self.eval(t, lhs, buffers)?;
                    let r = self.eval(t, rhs, buffers)?;
                    Value::Bool(compare(*op, l, r))
                }
            },
            Expr::Ternary { cond, then, els } => {
                if self.eval(t, cond, buffers)?.truthy() {
                    self.eval(t, then, buffers)?
                } else {
                    self.eval(t, els, buffers)?
                }
            }
            Expr::Call { func, args } => {
                check_call(*func, args)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(t, arg, buffers)?.as_f64());
                }
                Value::Float(math(*func, &values))
            }
            Expr::Reduce(red) => Value::Float(self.reduce(t, red, buffers)?),
        })
    }

    fn reduce(
        &self,
        t: &mut Thread,
        red: &Reduction,
        buffers: &mut Buffers<'_>,
    ) -> Result<f64, Diagnostic> {
        check_weights(red)?;
        let mut acc = self.eval(t, &red.init, buffers)?.as_f64();
        let weights = match &red.weights {
            Some(ws) => {
                let mut values = Vec::with_capacity(ws.len());
                for w in ws {
                    values.push(self.eval(t, w, buffers)?.as_f64());
                }
                Some(values)
            }
            None => None,
        };
        self.for_each_neighbor(t, &red.space, |t, slot| {
            let mut v = self.eval(t, &red.rhs, buffers)?.as_f64();
            if let Some(w) = &weights {
                v *= w[slot];
            }
            acc = match red.op {
                ReductionOp::Sum => acc + v,
                ReductionOp::Product => acc * v,
                ReductionOp::Min => acc.min(v),
                ReductionOp::Max => acc.max(v),
            };
            Ok(())
        })?;
        Ok(acc)
    }
}
