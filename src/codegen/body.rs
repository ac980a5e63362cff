//! Statement and expression lowering for kernel bodies.
//!
//! Field accesses are first resolved against a [`Scope`] (the stage's
//! element kind plus the stack of neighbor chains currently iterated) into
//! a [`ResolvedAccess`]. Code emission renders that as an index expression;
//! the emulated runtime evaluates the very same value numerically.
//!
//! Device index layout:
//!
//! ```text
//! vertical-only   f[k]
//! dense           f[k * NumX + h]          2D: f[h]
//! sparse          f[(k * S + slot) * NumO + origin]   2D: f[slot * NumO + origin]
//! ```

use crate::diagnostic::Diagnostic;
use crate::ir::{
    Expr, FieldAccess, FieldId, Horizontal, HorizontalAccess, IterationSpace, LValue,
    LocationType, MathFn, Reduction, ReductionOp, Stage, Stmt, StencilInstantiation,
};

use super::params::FLOAT_TYPE;
use super::writer::SourceWriter;

// ─── Access resolution ────────────────────────────────────────────

/// Horizontal part of a resolved access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessLayout {
    /// One value per level; the horizontal position is irrelevant.
    Vertical,
    /// The thread's own element.
    Center { loc: LocationType },
    /// The neighbor visited by the chain at `depth`.
    Neighbor { loc: LocationType, depth: usize },
    /// The slot visited by the chain at `depth`, over its origin element.
    Slot {
        origin: LocationType,
        size: usize,
        depth: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedAccess {
    pub field: FieldId,
    pub k_offset: i32,
    /// The field has a vertical dimension.
    pub vertical: bool,
    pub layout: AccessLayout,
}

/// Loop-variable values of the chains enclosing an access.
pub struct ChainState<'s> {
    pub pidx: usize,
    pub nbh_idx: &'s [usize],
    pub nbh_iter: &'s [usize],
}

impl ChainState<'_> {
    fn origin(&self, depth: usize) -> usize {
        if depth == 0 {
            self.pidx
        } else {
            self.nbh_idx[depth - 1]
        }
    }
}

impl ResolvedAccess {
    /// Vertical index expression (`kIter` or `(kIter + 1)`).
    fn render_k(&self) -> String {
        if self.k_offset == 0 {
            "kIter".to_string()
        } else {
            format!("(kIter + {})", self.k_offset)
        }
    }

    /// Device-side index expression.
    pub fn render(&self) -> String {
        let k = self.render_k();
        match &self.layout {
            AccessLayout::Vertical => k,
            AccessLayout::Center { loc } => self.render_dense(&k, *loc, "pidx"),
            AccessLayout::Neighbor { loc, depth } => {
                self.render_dense(&k, *loc, &format!("nbhIdx{}", depth))
            }
            AccessLayout::Slot {
                origin,
                size,
                depth,
            } => {
                let slot = format!("nbhIter{}", depth);
                let o = origin_var(*depth);
                if self.vertical {
                    format!(
                        "({} * {} + {}) * {} + {}",
                        k,
                        size,
                        slot,
                        origin.count_name(),
                        o
                    )
                } else {
                    format!("{} * {} + {}", slot, origin.count_name(), o)
                }
            }
        }
    }

    fn render_dense(&self, k: &str, loc: LocationType, h: &str) -> String {
        if self.vertical {
            format!("{} * {} + {}", k, loc.count_name(), h)
        } else {
            h.to_string()
        }
    }

    /// Device-side index for concrete loop variables. `stride` yields the
    /// value bound to the `NumX` size parameter of a kind.
    pub fn index(
        &self,
        k_iter: i64,
        chains: &ChainState<'_>,
        stride: impl Fn(LocationType) -> usize,
    ) -> i64 {
        let k = if self.vertical {
            k_iter + i64::from(self.k_offset)
        } else {
            0
        };
        match &self.layout {
            AccessLayout::Vertical => k_iter + i64::from(self.k_offset),
            AccessLayout::Center { loc } => k * stride(*loc) as i64 + chains.pidx as i64,
            AccessLayout::Neighbor { loc, depth } => {
                k * stride(*loc) as i64 + chains.nbh_idx[*depth] as i64
            }
            AccessLayout::Slot {
                origin,
                size,
                depth,
            } => {
                let slot = chains.nbh_iter[*depth] as i64;
                (k * *size as i64 + slot) * stride(*origin) as i64 + chains.origin(*depth) as i64
            }
        }
    }
}

/// Name of the element index a chain at `depth` starts from.
pub fn origin_var(depth: usize) -> String {
    if depth == 0 {
        "pidx".to_string()
    } else {
        format!("nbhIdx{}", depth - 1)
    }
}

/// Stage kind plus the stack of chains being iterated.
#[derive(Clone, Debug)]
pub struct Scope {
    location: LocationType,
    chains: Vec<IterationSpace>,
}

impl Scope {
    pub fn new(location: LocationType) -> Self {
        Self {
            location,
            chains: Vec::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.chains.len()
    }

    /// Open a chain; returns its depth. The chain must start where the
    /// enclosing one ends (or at the stage kind).
    pub fn enter(&mut self, space: &IterationSpace) -> Result<usize, Diagnostic> {
        if space.chain.len() < 2 {
            return Err(Diagnostic::error(format!(
                "neighbor chain '{}' needs at least two locations",
                space
            )));
        }
        let expected = match self.chains.last() {
            Some(outer) => outer.target().unwrap_or(self.location),
            None => self.location,
        };
        if space.origin() != Some(expected) {
            return Err(Diagnostic::error(format!(
                "neighbor chain '{}' must start at {}",
                space, expected
            )));
        }
        self.chains.push(space.clone());
        Ok(self.chains.len() - 1)
    }

    pub fn leave(&mut self) {
        self.chains.pop();
    }

    pub fn resolve(
        &self,
        inst: &StencilInstantiation,
        access: &FieldAccess,
    ) -> Result<ResolvedAccess, Diagnostic> {
        let field = inst.field(access.field);
        let layout = match (&field.dims.horizontal, access.horizontal) {
            (None, _) => AccessLayout::Vertical,
            (Some(Horizontal::Dense(loc)), HorizontalAccess::Center) => {
                if *loc != self.location {
                    return Err(Diagnostic::error(format!(
                        "field '{}' on {} is read at the center of a {} stage",
                        field.name, loc, self.location
                    )));
                }
                AccessLayout::Center { loc: *loc }
            }
            (Some(Horizontal::Dense(loc)), HorizontalAccess::Neighbor) => {
                let (depth, space) = self.innermost(&field.name)?;
                if space.target() != Some(*loc) {
                    return Err(Diagnostic::error(format!(
                        "field '{}' on {} is read as a neighbor of '{}'",
                        field.name, loc, space
                    )));
                }
                AccessLayout::Neighbor { loc: *loc, depth }
            }
            (Some(Horizontal::Dense(_)), HorizontalAccess::Sparse) => {
                return Err(Diagnostic::error(format!(
                    "dense field '{}' has no sparse dimension",
                    field.name
                )))
            }
            (Some(Horizontal::Sparse(own)), HorizontalAccess::Sparse) => {
                let (depth, space) = self.innermost(&field.name)?;
                if own != space {
                    return Err(Diagnostic::error(format!(
                        "sparse field '{}' over '{}' is read inside '{}'",
                        field.name, own, space
                    )));
                }
                AccessLayout::Slot {
                    origin: own.origin().unwrap_or(self.location),
                    size: own.table_size(),
                    depth,
                }
            }
            (Some(Horizontal::Sparse(_)), _) => {
                return Err(Diagnostic::error(format!(
                    "sparse field '{}' must be read per neighbor slot",
                    field.name
                )))
            }
        };
        Ok(ResolvedAccess {
            field: access.field,
            k_offset: access.vertical_offset,
            vertical: field.dims.vertical,
            layout,
        })
    }

    fn innermost(&self, field: &str) -> Result<(usize, &IterationSpace), Diagnostic> {
        match self.chains.last() {
            Some(space) => Ok((self.chains.len() - 1, space)),
            None => Err(Diagnostic::error(format!(
                "field '{}' is read per neighbor outside of a neighbor iteration",
                field
            ))),
        }
    }
}

/// C++ spelling of a double literal. Non-finite values use the CUDA math
/// macros.
pub fn float_literal(v: f64) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "INFINITY" } else { "(-INFINITY)" }.to_string()
    } else {
        format!("{:?}", v)
    }
}

pub fn check_call(func: MathFn, args: &[Expr]) -> Result<(), Diagnostic> {
    if args.len() != func.arity() {
        return Err(Diagnostic::error(format!(
            "'{}' takes {} argument(s), got {}",
            func.cuda_name(),
            func.arity(),
            args.len()
        )));
    }
    Ok(())
}

pub fn check_global(inst: &StencilInstantiation, name: &str) -> Result<(), Diagnostic> {
    if !inst.globals.contains_key(name) {
        return Err(Diagnostic::error(format!(
            "unknown global '{}' in '{}'",
            name, inst.name
        )));
    }
    Ok(())
}

pub fn check_weights(red: &Reduction) -> Result<(), Diagnostic> {
    if let Some(weights) = &red.weights {
        if weights.len() != red.space.table_size() {
            return Err(Diagnostic::error(format!(
                "reduction over '{}' has {} weights, table has {} slots",
                red.space,
                weights.len(),
                red.space.table_size()
            )));
        }
    }
    Ok(())
}

// ─── Lowering ─────────────────────────────────────────────────────

/// Lowers one stage's statements into kernel source.
pub struct BodyLowering<'a> {
    inst: &'a StencilInstantiation,
    scope: Scope,
    next_reduction: usize,
}

impl<'a> BodyLowering<'a> {
    pub fn new(inst: &'a StencilInstantiation, stage: &Stage) -> Self {
        Self {
            inst,
            scope: Scope::new(stage.location),
            next_reduction: 0,
        }
    }

    pub fn lower_stmts(&mut self, w: &mut SourceWriter, stmts: &[Stmt]) -> Result<(), Diagnostic> {
        for stmt in stmts {
            self.lower_stmt(w, stmt)?;
        }
        Ok(())
    }

    pub fn lower_stmt(&mut self, w: &mut SourceWriter, stmt: &Stmt) -> Result<(), Diagnostic> {
        match stmt {
            Stmt::VarDecl { name, init } => match init {
                Some(init) => {
                    let value = self.lower_expr(w, init)?;
                    w.line(format!("{} {} = {};", FLOAT_TYPE, name, value));
                }
                None => w.line(format!("{} {};", FLOAT_TYPE, name)),
            },
            Stmt::Assign { target, op, value } => {
                let value = self.lower_expr(w, value)?;
                let target = match target {
                    LValue::Var(name) => name.clone(),
                    LValue::Field(access) => self.render_access(access)?,
                };
                w.line(format!("{} {} {};", target, op.symbol(), value));
            }
            Stmt::If { cond, then, els } => {
                let cond = self.lower_expr(w, cond)?;
                w.open(format!("if ({})", cond));
                self.lower_stmts(w, then)?;
                if els.is_empty() {
                    w.close();
                } else {
                    w.close_with("} else {");
                    w.indent();
                    self.lower_stmts(w, els)?;
                    w.close();
                }
            }
            Stmt::Block(body) => {
                w.open("");
                self.lower_stmts(w, body)?;
                w.close();
            }
            Stmt::NeighborLoop { space, body } => {
                self.open_chain(w, space)?;
                self.lower_stmts(w, body)?;
                self.close_chain(w);
            }
        }
        Ok(())
    }

    /// Lower an expression. Reductions are hoisted into statements written
    /// to `w` ahead of the expression that uses them.
    pub fn lower_expr(&mut self, w: &mut SourceWriter, expr: &Expr) -> Result<String, Diagnostic> {
        Ok(match expr {
            Expr::Literal(v) => float_literal(*v),
            Expr::Int(v) => v.to_string(),
            Expr::Bool(b) => b.to_string(),
            Expr::Var(name) => name.clone(),
            Expr::Global(name) => {
                check_global(self.inst, name)?;
                format!("globals.{}", name)
            }
            Expr::Field(access) => self.render_access(access)?,
            Expr::Unary { op, operand } => {
                format!("({}{})", op.symbol(), self.lower_expr(w, operand)?)
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.lower_expr(w, lhs)?;
                let r = self.lower_expr(w, rhs)?;
                format!("({} {} {})", l, op.symbol(), r)
            }
            Expr::Ternary { cond, then, els } => {
                let c = self.lower_expr(w, cond)?;
                let t = self.lower_expr(w, then)?;
                let e = self.lower_expr(w, els)?;
                format!("({} ? {} : {})", c, t, e)
            }
            Expr::Call { func, args } => {
                check_call(*func, args)?;
                let mut lowered = Vec::with_capacity(args.len());
                for arg in args {
                    lowered.push(self.lower_expr(w, arg)?);
                }
                format!("{}({})", func.cuda_name(), lowered.join(", "))
            }
            Expr::Reduce(red) => self.lower_reduction(w, red)?,
        })
    }

    fn render_access(&self, access: &FieldAccess) -> Result<String, Diagnostic> {
        let resolved = self.scope.resolve(self.inst, access)?;
        Ok(format!(
            "{}[{}]",
            self.inst.field_name(access.field),
            resolved.render()
        ))
    }

    fn lower_reduction(
        &mut self,
        w: &mut SourceWriter,
        red: &Reduction,
    ) -> Result<String, Diagnostic> {
        check_weights(red)?;
        let lhs = format!("lhs_{}", self.next_reduction);
        self.next_reduction += 1;

        let init = self.lower_expr(w, &red.init)?;
        w.line(format!("{} {} = {};", FLOAT_TYPE, lhs, init));
        if let Some(weights) = &red.weights {
            let mut lowered = Vec::with_capacity(weights.len());
            for weight in weights {
                lowered.push(self.lower_expr(w, weight)?);
            }
            w.line(format!(
                "{} {}_weights[{}] = {{{}}};",
                FLOAT_TYPE,
                lhs,
                red.space.size_name(),
                lowered.join(", ")
            ));
        }

        let depth = self.open_chain(w, &red.space)?;
        let rhs = self.lower_expr(w, &red.rhs)?;
        let rhs = match red.weights {
            Some(_) => format!("{}_weights[nbhIter{}] * {}", lhs, depth, rhs),
            None => rhs,
        };
        match red.op {
            ReductionOp::Sum => w.line(format!("{} += {};", lhs, rhs)),
            ReductionOp::Product => w.line(format!("{} *= {};", lhs, rhs)),
            ReductionOp::Min => w.line(format!("{} = fmin({}, {});", lhs, lhs, rhs)),
            ReductionOp::Max => w.line(format!("{} = fmax({}, {});", lhs, lhs, rhs)),
        }
        self.close_chain(w);
        Ok(lhs)
    }

    fn open_chain(
        &mut self,
        w: &mut SourceWriter,
        space: &IterationSpace,
    ) -> Result<usize, Diagnostic> {
        let depth = self.scope.enter(space)?;
        let origin = space.origin().unwrap_or(LocationType::Cells);
        w.open(format!(
            "for (int nbhIter{d} = 0; nbhIter{d} < {size}; nbhIter{d}++)",
            d = depth,
            size = space.size_name()
        ));
        w.line(format!(
            "int nbhIdx{d} = {table}[{o} + {num} * nbhIter{d}];",
            d = depth,
            table = space.table_name(),
            o = origin_var(depth),
            num = origin.count_name()
        ));
        w.line(format!(
            "if (nbhIdx{} == DEVICE_MISSING_VALUE) {{ continue; }}",
            depth
        ));
        Ok(depth)
    }

    fn close_chain(&mut self, w: &mut SourceWriter) {
        self.scope.leave();
        w.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::*;
    use crate::ir::{
        AssignOp, FieldDims, GlobalType, Interval, LoopOrder, StencilInstantiation,
    };
    use LocationType::*;

    fn ce() -> IterationSpace {
        IterationSpace::new(vec![Cells, Edges], false)
    }

    fn lower(inst: &StencilInstantiation) -> Result<String, Diagnostic> {
        let stage = &inst.stencils[0].multistages[0].stages[0];
        let mut w = SourceWriter::new();
        let mut lowering = BodyLowering::new(inst, stage);
        for dm in &stage.do_methods {
            lowering.lower_stmts(&mut w, &dm.body)?;
        }
        Ok(w.finish())
    }

    fn single(
        name: &str,
        setup: impl FnOnce(&mut InstantiationBuilder) -> Vec<Stmt>,
    ) -> StencilInstantiation {
        let mut b = InstantiationBuilder::new(name);
        let body = setup(&mut b);
        b.multistage(
            LoopOrder::Parallel,
            vec![StageBuilder::new(Cells).do_method(Interval::full(), body)],
        );
        b.build()
    }

    #[test]
    fn test_dense_center_copy() {
        let inst = single("copy", |b| {
            let i = b.api_field("in", FieldDims::dense(Cells));
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(o, at(i))]
        });
        assert_eq!(
            lower(&inst).unwrap(),
            "out[kIter * NumCells + pidx] = in[kIter * NumCells + pidx];\n"
        );
    }

    #[test]
    fn test_float_literals_are_valid_cxx() {
        assert_eq!(float_literal(0.5), "0.5");
        assert_eq!(float_literal(2.0), "2.0");
        assert_eq!(float_literal(-1e300), "-1e300");
        assert_eq!(float_literal(f64::NAN), "NAN");
        assert_eq!(float_literal(f64::INFINITY), "INFINITY");
        assert_eq!(float_literal(f64::NEG_INFINITY), "(-INFINITY)");

        let inst = single("limits", |b| {
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(o, add(lit(f64::NEG_INFINITY), lit(f64::NAN)))]
        });
        assert_eq!(
            lower(&inst).unwrap(),
            "out[kIter * NumCells + pidx] = ((-INFINITY) + NAN);\n"
        );
    }

    #[test]
    fn test_vertical_offset_and_field_kinds() {
        let inst = single("kinds", |b| {
            let i = b.api_field("in", FieldDims::dense(Cells));
            let w = b.api_field("w", FieldDims::vertical_only());
            let flat = b.api_field("flat", FieldDims::dense(Cells).horizontal_only());
            vec![store(
                flat,
                mul(Expr::Field(FieldAccess::center(i).at_k(1)), at(w)),
            )]
        });
        assert_eq!(
            lower(&inst).unwrap(),
            "flat[pidx] = (in[(kIter + 1) * NumCells + pidx] * w[kIter]);\n"
        );
    }

    #[test]
    fn test_sum_reduction_over_neighbors() {
        let inst = single("red", |b| {
            let e = b.api_field("e", FieldDims::dense(Edges));
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(o, sum_over(ce(), nbh(e)))]
        });
        let code = lower(&inst).unwrap();
        insta::assert_snapshot!(code.trim_end(), @r###"
        ::dawn::float_type lhs_0 = 0.0;
        for (int nbhIter0 = 0; nbhIter0 < CE_SIZE; nbhIter0++) {
          int nbhIdx0 = ceTable[pidx + NumCells * nbhIter0];
          if (nbhIdx0 == DEVICE_MISSING_VALUE) { continue; }
          lhs_0 += e[kIter * NumEdges + nbhIdx0];
        }
        out[kIter * NumCells + pidx] = lhs_0;
        "###);
    }

    #[test]
    fn test_weighted_max_and_sparse_access() {
        let inst = single("wmax", |b| {
            let geo = b.api_field("geo", FieldDims::sparse(ce()));
            let o = b.api_field("out", FieldDims::dense(Cells));
            let red = Reduction {
                op: ReductionOp::Max,
                init: lit(-1.0),
                rhs: sparse(geo),
                weights: Some(vec![lit(1.0), lit(2.0), lit(0.5)]),
                space: ce(),
            };
            vec![store(o, Expr::reduce(red))]
        });
        let code = lower(&inst).unwrap();
        assert!(code.contains("lhs_0_weights[CE_SIZE] = {1.0, 2.0, 0.5};"));
        assert!(code.contains(
            "lhs_0 = fmax(lhs_0, lhs_0_weights[nbhIter0] * geo[(kIter * 3 + nbhIter0) * NumCells + pidx]);"
        ));
    }

    #[test]
    fn test_nested_chain_uses_outer_index_as_origin() {
        let ev = IterationSpace::new(vec![Edges, Vertices], false);
        let inst = single("nested", |b| {
            let v = b.api_field("v", FieldDims::dense(Vertices));
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(o, sum_over(ce(), sum_over(ev.clone(), nbh(v))))]
        });
        let code = lower(&inst).unwrap();
        assert!(code.contains("int nbhIdx1 = evTable[nbhIdx0 + NumEdges * nbhIter1];"));
        assert!(code.contains("lhs_1 += v[kIter * NumVertices + nbhIdx1];"));
        assert!(code.contains("lhs_0 += lhs_1;"));
    }

    #[test]
    fn test_neighbor_loop_and_control_flow() {
        let inst = single("loop", |b| {
            let e = b.api_field("e", FieldDims::dense(Edges));
            let o = b.api_field("out", FieldDims::dense(Cells));
            b.global("scale", GlobalType::Double);
            vec![
                Stmt::VarDecl {
                    name: "acc".to_string(),
                    init: Some(lit(0.0)),
                },
                Stmt::NeighborLoop {
                    space: ce(),
                    body: vec![Stmt::Assign {
                        target: LValue::Var("acc".to_string()),
                        op: AssignOp::Add,
                        value: nbh(e),
                    }],
                },
                Stmt::If {
                    cond: Expr::binary(crate::ir::BinaryOp::Gt, var("acc"), lit(0.0)),
                    then: vec![store(o, mul(var("acc"), global("scale")))],
                    els: vec![store(o, lit(0.0))],
                },
            ]
        });
        let code = lower(&inst).unwrap();
        insta::assert_snapshot!(code.trim_end(), @r###"
        ::dawn::float_type acc = 0.0;
        for (int nbhIter0 = 0; nbhIter0 < CE_SIZE; nbhIter0++) {
          int nbhIdx0 = ceTable[pidx + NumCells * nbhIter0];
          if (nbhIdx0 == DEVICE_MISSING_VALUE) { continue; }
          acc += e[kIter * NumEdges + nbhIdx0];
        }
        if ((acc > 0.0)) {
          out[kIter * NumCells + pidx] = (acc * globals.scale);
        } else {
          out[kIter * NumCells + pidx] = 0.0;
        }
        "###);
    }

    #[test]
    fn test_access_errors() {
        let inst = single("bad", |b| {
            let e = b.api_field("e", FieldDims::dense(Edges));
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(o, nbh(e))]
        });
        let err = lower(&inst).unwrap_err();
        assert!(err.message.contains("outside of a neighbor iteration"));

        let inst = single("bad", |b| {
            let e = b.api_field("e", FieldDims::dense(Edges));
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(o, at(e))]
        });
        assert!(lower(&inst).unwrap_err().message.contains("read at the center"));

        let inst = single("bad", |b| {
            let e = b.api_field("e", FieldDims::dense(Edges));
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(o, sum_over(ce(), sparse(e)))]
        });
        assert!(lower(&inst).unwrap_err().message.contains("no sparse dimension"));

        let inst = single("bad", |b| {
            let s = b.api_field("s", FieldDims::sparse(ce()));
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(o, at(s))]
        });
        assert!(lower(&inst).unwrap_err().message.contains("per neighbor slot"));
    }

    #[test]
    fn test_chain_origin_mismatch() {
        let inst = single("bad", |b| {
            let o = b.api_field("out", FieldDims::dense(Cells));
            let ev = IterationSpace::new(vec![Edges, Vertices], false);
            vec![store(o, sum_over(ev, lit(1.0)))]
        });
        let err = lower(&inst).unwrap_err();
        assert_eq!(
            err.message,
            "neighbor chain 'Edges -> Vertices' must start at Cells"
        );
    }

    #[test]
    fn test_call_arity_weights_and_globals() {
        let inst = single("bad", |b| {
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(
                o,
                Expr::Call {
                    func: MathFn::Pow,
                    args: vec![lit(2.0)],
                },
            )]
        });
        assert!(lower(&inst).unwrap_err().message.contains("takes 2 argument(s)"));

        let inst = single("bad", |b| {
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(o, global("nope"))]
        });
        assert!(lower(&inst).unwrap_err().message.contains("unknown global 'nope'"));

        let inst = single("bad", |b| {
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(
                o,
                Expr::reduce(Reduction {
                    op: ReductionOp::Sum,
                    init: lit(0.0),
                    rhs: lit(1.0),
                    weights: Some(vec![lit(1.0)]),
                    space: ce(),
                }),
            )]
        });
        assert!(lower(&inst).unwrap_err().message.contains("has 1 weights"));
    }

    #[test]
    fn test_numeric_index_matches_rendered_layout() {
        let inst = single("idx", |b| {
            let s = b.api_field("s", FieldDims::sparse(ce()));
            let o = b.api_field("out", FieldDims::dense(Cells));
            vec![store(o, sum_over(ce(), sparse(s)))]
        });
        let mut scope = Scope::new(Cells);
        scope.enter(&ce()).unwrap();
        let r = scope
            .resolve(&inst, &FieldAccess::sparse(FieldId(0)))
            .unwrap();
        assert_eq!(r.render(), "(kIter * 3 + nbhIter0) * NumCells + pidx");
        let state = ChainState {
            pidx: 4,
            nbh_idx: &[9],
            nbh_iter: &[2],
        };
        // (k * 3 + slot) * stride + origin
        assert_eq!(r.index(5, &state, |_| 10), (5 * 3 + 2) * 10 + 4);
    }
}
