//! Iteration-space collection.
//!
//! Walks statement trees and gathers every distinct neighbor chain used by
//! a reduction or a neighbor loop, nested ones included. The result is an
//! ordered set, so the order tables, template parameters and kernel
//! arguments are emitted in never depends on traversal order.

use std::collections::BTreeSet;

use crate::ir::{Expr, Stage, Stmt, StencilInstantiation};
use crate::ir::IterationSpace;

#[derive(Default)]
pub struct SpaceCollector {
    spaces: BTreeSet<IterationSpace>,
}

impl SpaceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visit_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.visit_stmt(stmt);
        }
    }

    pub fn visit_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::VarDecl { init, .. } => {
                if let Some(init) = init {
                    self.visit_expr(init);
                }
            }
            Stmt::Assign { value, .. } => self.visit_expr(value),
            Stmt::If { cond, then, els } => {
                self.visit_expr(cond);
                self.visit_stmts(then);
                self.visit_stmts(els);
            }
            Stmt::Block(body) => self.visit_stmts(body),
            Stmt::NeighborLoop { space, body } => {
                self.spaces.insert(space.clone());
                self.visit_stmts(body);
            }
        }
    }

    pub fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Literal(_)
            | Expr::Int(_)
            | Expr::Bool(_)
            | Expr::Var(_)
            | Expr::Global(_)
            | Expr::Field(_) => {}
            Expr::Unary { operand, .. } => self.visit_expr(operand),
            Expr::Binary { lhs, rhs, .. } => {
                self.visit_expr(lhs);
                self.visit_expr(rhs);
            }
            Expr::Ternary { cond, then, els } => {
                self.visit_expr(cond);
                self.visit_expr(then);
                self.visit_expr(els);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    self.visit_expr(arg);
                }
            }
            Expr::Reduce(red) => {
                self.spaces.insert(red.space.clone());
                self.visit_expr(&red.init);
                self.visit_expr(&red.rhs);
                for w in red.weights.iter().flatten() {
                    self.visit_expr(w);
                }
            }
        }
    }

    pub fn into_spaces(self) -> BTreeSet<IterationSpace> {
        self.spaces
    }
}

/// Spaces referenced by one statement subtree.
pub fn collect(stmts: &[Stmt]) -> BTreeSet<IterationSpace> {
    let mut c = SpaceCollector::new();
    c.visit_stmts(stmts);
    c.into_spaces()
}

/// Spaces a stage's kernel needs tables and size parameters for.
pub fn stage_spaces(stage: &Stage) -> BTreeSet<IterationSpace> {
    let mut c = SpaceCollector::new();
    for dm in &stage.do_methods {
        c.visit_stmts(&dm.body);
    }
    c.into_spaces()
}

/// Spaces the mesh descriptor of an instantiation must hold.
pub fn instantiation_spaces(inst: &StencilInstantiation) -> BTreeSet<IterationSpace> {
    let mut c = SpaceCollector::new();
    for dm in inst.do_methods() {
        c.visit_stmts(&dm.body);
    }
    c.into_spaces()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::*;
    use crate::ir::{FieldDims, Interval, LocationType, LoopOrder};

    fn space(chain: &[LocationType], center: bool) -> IterationSpace {
        IterationSpace::new(chain.to_vec(), center)
    }

    #[test]
    fn test_collect_from_reductions_and_loops() {
        use LocationType::*;
        let ce = space(&[Cells, Edges], false);
        let ec = space(&[Edges, Cells], false);
        let cv = space(&[Cells, Vertices], true);
        let stmts = vec![
            store(
                crate::ir::FieldId(0),
                add(sum_over(ce.clone(), lit(1.0)), sum_over(ce.clone(), lit(2.0))),
            ),
            Stmt::If {
                cond: Expr::Bool(true),
                then: vec![Stmt::NeighborLoop {
                    space: cv.clone(),
                    body: vec![store(crate::ir::FieldId(1), sum_over(ec.clone(), lit(0.5)))],
                }],
                els: vec![],
            },
        ];
        let spaces = collect(&stmts);
        assert_eq!(spaces.len(), 3);
        let ordered: Vec<IterationSpace> = spaces.into_iter().collect();
        assert_eq!(ordered, vec![ce, cv, ec]);
    }

    #[test]
    fn test_nested_reduction_is_found() {
        use LocationType::*;
        let outer = space(&[Cells, Edges], false);
        let inner = space(&[Edges, Vertices], false);
        let expr = sum_over(outer.clone(), sum_over(inner.clone(), lit(1.0)));
        let spaces = collect(&[store(crate::ir::FieldId(0), expr)]);
        assert!(spaces.contains(&outer));
        assert!(spaces.contains(&inner));
    }

    #[test]
    fn test_center_flag_distinguishes_spaces() {
        use LocationType::*;
        let a = space(&[Vertices, Edges], false);
        let b = space(&[Vertices, Edges], true);
        let spaces = collect(&[
            store(crate::ir::FieldId(0), sum_over(a.clone(), lit(1.0))),
            store(crate::ir::FieldId(0), sum_over(b.clone(), lit(1.0))),
            store(crate::ir::FieldId(0), sum_over(a, lit(1.0))),
        ]);
        assert_eq!(spaces.len(), 2);
    }

    #[test]
    fn test_stage_and_instantiation_scopes() {
        use LocationType::*;
        let ce = space(&[Cells, Edges], false);
        let ev = space(&[Edges, Vertices], false);
        let mut b = InstantiationBuilder::new("scopes");
        let c = b.api_field("c", FieldDims::dense(Cells));
        let e = b.api_field("e", FieldDims::dense(Edges));
        b.multistage(
            LoopOrder::Parallel,
            vec![
                StageBuilder::new(Cells)
                    .do_method(Interval::full(), vec![store(c, sum_over(ce.clone(), nbh(e)))]),
                StageBuilder::new(Edges)
                    .do_method(Interval::full(), vec![store(e, sum_over(ev.clone(), lit(1.0)))]),
            ],
        );
        let inst = b.build();
        let first = &inst.stencils[0].multistages[0].stages[0];
        assert_eq!(stage_spaces(first).into_iter().collect::<Vec<_>>(), vec![ce.clone()]);
        assert_eq!(
            instantiation_spaces(&inst).into_iter().collect::<Vec<_>>(),
            vec![ce, ev]
        );
    }

    #[test]
    fn test_plain_body_has_no_spaces() {
        assert!(collect(&[store(crate::ir::FieldId(0), lit(1.0))]).is_empty());
    }
}
