//! InstantiationBuilder: assembles a finalized instantiation in code.
//!
//! Stage field lists and field intents are derived from the statement
//! bodies (read-only → Input, write-only → Output, both → InputOutput), so
//! callers only describe fields, globals and the stage tree.

use std::collections::BTreeMap;

use super::ast::*;
use super::*;

// ─── Expression shorthands ────────────────────────────────────────

pub fn lit(value: f64) -> Expr {
    Expr::Literal(value)
}

pub fn var(name: &str) -> Expr {
    Expr::Var(name.to_string())
}

pub fn global(name: &str) -> Expr {
    Expr::Global(name.to_string())
}

/// Read a field at the thread's own element.
pub fn at(field: FieldId) -> Expr {
    Expr::Field(FieldAccess::center(field))
}

/// Read a dense field at the current neighbor.
pub fn nbh(field: FieldId) -> Expr {
    Expr::Field(FieldAccess::neighbor(field))
}

/// Read a sparse field at the current slot.
pub fn sparse(field: FieldId) -> Expr {
    Expr::Field(FieldAccess::sparse(field))
}

pub fn add(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinaryOp::Add, lhs, rhs)
}

pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinaryOp::Sub, lhs, rhs)
}

pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinaryOp::Mul, lhs, rhs)
}

pub fn div(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinaryOp::Div, lhs, rhs)
}

/// `sum` reduction starting at 0.
pub fn sum_over(space: IterationSpace, rhs: Expr) -> Expr {
    Expr::reduce(Reduction {
        op: ReductionOp::Sum,
        init: lit(0.0),
        rhs,
        weights: None,
        space,
    })
}

/// `field[center] = value`
pub fn store(field: FieldId, value: Expr) -> Stmt {
    Stmt::assign_field(FieldAccess::center(field), value)
}

// ─── Stage builder ────────────────────────────────────────────────

pub struct StageBuilder {
    location: LocationType,
    domain: Option<HorizontalRange>,
    do_methods: Vec<DoMethod>,
}

impl StageBuilder {
    pub fn new(location: LocationType) -> Self {
        Self {
            location,
            domain: None,
            do_methods: Vec::new(),
        }
    }

    /// Restrict the stage to `[lower, upper)` of the horizontal domain.
    pub fn restrict(mut self, lower: DomainBound, upper: DomainBound) -> Self {
        self.domain = Some(HorizontalRange { lower, upper });
        self
    }

    pub fn do_method(mut self, interval: Interval, body: Vec<Stmt>) -> Self {
        self.do_methods.push(DoMethod { interval, body });
        self
    }

    fn finish(self, id: usize) -> Stage {
        let mut usage: BTreeMap<FieldId, Usage> = BTreeMap::new();
        for dm in &self.do_methods {
            collect_stmts(&dm.body, &mut usage);
        }
        let fields = usage
            .into_iter()
            .map(|(field, u)| StageField {
                field,
                intent: u.intent(),
            })
            .collect();
        Stage {
            id,
            location: self.location,
            domain: self.domain,
            do_methods: self.do_methods,
            fields,
        }
    }
}

// ─── Instantiation builder ────────────────────────────────────────

pub struct InstantiationBuilder {
    name: String,
    fields: Vec<Field>,
    api_fields: Vec<FieldId>,
    globals: BTreeMap<String, GlobalType>,
    stencils: Vec<Stencil>,
    next_multistage: usize,
    next_stage: usize,
}

impl InstantiationBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            api_fields: Vec::new(),
            globals: BTreeMap::new(),
            stencils: vec![Stencil {
                id: 0,
                multistages: Vec::new(),
            }],
            next_multistage: 0,
            next_stage: 0,
        }
    }

    /// A caller-supplied field, appended to the API field list.
    pub fn api_field(&mut self, name: &str, dims: FieldDims) -> FieldId {
        let id = self.push_field(name, dims, false);
        self.api_fields.push(id);
        id
    }

    /// A field owned by the generated code between setup and free.
    pub fn temporary(&mut self, name: &str, dims: FieldDims) -> FieldId {
        self.push_field(name, dims, true)
    }

    pub fn global(&mut self, name: &str, ty: GlobalType) -> &mut Self {
        self.globals.insert(name.to_string(), ty);
        self
    }

    /// Append a multistage to the current stencil.
    pub fn multistage(&mut self, loop_order: LoopOrder, stages: Vec<StageBuilder>) -> &mut Self {
        let id = self.next_multistage;
        self.next_multistage += 1;
        let mut built = Vec::with_capacity(stages.len());
        for stage in stages {
            built.push(stage.finish(self.next_stage));
            self.next_stage += 1;
        }
        if let Some(stencil) = self.stencils.last_mut() {
            stencil.multistages.push(MultiStage {
                id,
                loop_order,
                stages: built,
            });
        }
        self
    }

    /// Start a further stencil; subsequent multistages go there.
    pub fn new_stencil(&mut self) -> &mut Self {
        let id = self.stencils.len();
        self.stencils.push(Stencil {
            id,
            multistages: Vec::new(),
        });
        self
    }

    pub fn build(mut self) -> StencilInstantiation {
        let mut merged: BTreeMap<FieldId, Intent> = BTreeMap::new();
        for stencil in &self.stencils {
            for (id, intent) in stencil.referenced_fields() {
                let intent = match merged.get(&id) {
                    Some(prev) if *prev != intent => Intent::InputOutput,
                    _ => intent,
                };
                merged.insert(id, intent);
            }
        }
        for (id, intent) in merged {
            self.fields[id.0].intent = intent;
        }
        StencilInstantiation {
            name: self.name,
            fields: self.fields,
            api_fields: self.api_fields,
            globals: self.globals,
            stencils: self.stencils,
        }
    }

    fn push_field(&mut self, name: &str, dims: FieldDims, temporary: bool) -> FieldId {
        let id = FieldId(self.fields.len());
        self.fields.push(Field {
            name: name.to_string(),
            intent: Intent::Input,
            dims,
            temporary,
        });
        id
    }
}

// ─── Access collection ────────────────────────────────────────────

#[derive(Default, Clone, Copy)]
struct Usage {
    read: bool,
    written: bool,
}

impl Usage {
    fn intent(self) -> Intent {
        match (self.read, self.written) {
            (true, true) => Intent::InputOutput,
            (false, true) => Intent::Output,
            _ => Intent::Input,
        }
    }
}

fn collect_stmts(stmts: &[Stmt], usage: &mut BTreeMap<FieldId, Usage>) {
    for stmt in stmts {
        match stmt {
            Stmt::VarDecl { init, .. } => {
                if let Some(init) = init {
                    collect_expr(init, usage);
                }
            }
            Stmt::Assign { target, op, value } => {
                collect_expr(value, usage);
                if let LValue::Field(access) = target {
                    let u = usage.entry(access.field).or_default();
                    u.written = true;
                    if *op != AssignOp::Assign {
                        u.read = true;
                    }
                }
            }
            Stmt::If { cond, then, els } => {
                collect_expr(cond, usage);
                collect_stmts(then, usage);
                collect_stmts(els, usage);
            }
            Stmt::Block(body) | Stmt::NeighborLoop { body, .. } => collect_stmts(body, usage),
        }
    }
}

fn collect_expr(expr: &Expr, usage: &mut BTreeMap<FieldId, Usage>) {
    match expr {
        Expr::Literal(_) | Expr::Int(_) | Expr::Bool(_) | Expr::Var(_) | Expr::Global(_) => {}
        Expr::Field(access) => usage.entry(access.field).or_default().read = true,
        Expr::Unary { operand, .. } => collect_expr(operand, usage),
        Expr::Binary { lhs, rhs, .. } => {
            collect_expr(lhs, usage);
            collect_expr(rhs, usage);
        }
        Expr::Ternary { cond, then, els } => {
            collect_expr(cond, usage);
            collect_expr(then, usage);
            collect_expr(els, usage);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_expr(arg, usage);
            }
        }
        Expr::Reduce(red) => {
            collect_expr(&red.init, usage);
            collect_expr(&red.rhs, usage);
            for w in red.weights.iter().flatten() {
                collect_expr(w, usage);
            }
        }
    }
}
