//! Statement and expression trees of do-method bodies.
//!
//! Closed enums, lowered by exhaustive `match`. Neighbor-chain metadata
//! lives directly on the `Reduce` and `NeighborLoop` variants.

use serde::{Deserialize, Serialize};

use super::{FieldId, IterationSpace};

// ─── Expressions ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Math builtins available inside kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MathFn {
    Sqrt,
    Abs,
    Exp,
    Log,
    Pow,
    Min,
    Max,
    Sin,
    Cos,
}

impl MathFn {
    /// Device-side function name.
    pub fn cuda_name(self) -> &'static str {
        match self {
            MathFn::Sqrt => "sqrt",
            MathFn::Abs => "fabs",
            MathFn::Exp => "exp",
            MathFn::Log => "log",
            MathFn::Pow => "pow",
            MathFn::Min => "fmin",
            MathFn::Max => "fmax",
            MathFn::Sin => "sin",
            MathFn::Cos => "cos",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            MathFn::Pow | MathFn::Min | MathFn::Max => 2,
            _ => 1,
        }
    }
}

/// How a field access is resolved horizontally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HorizontalAccess {
    /// The element the current thread owns.
    Center,
    /// The neighbor the innermost enclosing chain iteration currently visits.
    Neighbor,
    /// The sparse slot the innermost enclosing chain iteration currently visits.
    Sparse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldAccess {
    pub field: FieldId,
    #[serde(default)]
    pub vertical_offset: i32,
    pub horizontal: HorizontalAccess,
}

impl FieldAccess {
    pub fn center(field: FieldId) -> Self {
        Self {
            field,
            vertical_offset: 0,
            horizontal: HorizontalAccess::Center,
        }
    }

    pub fn neighbor(field: FieldId) -> Self {
        Self {
            field,
            vertical_offset: 0,
            horizontal: HorizontalAccess::Neighbor,
        }
    }

    pub fn sparse(field: FieldId) -> Self {
        Self {
            field,
            vertical_offset: 0,
            horizontal: HorizontalAccess::Sparse,
        }
    }

    pub fn at_k(mut self, offset: i32) -> Self {
        self.vertical_offset = offset;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionOp {
    Sum,
    Product,
    Min,
    Max,
}

/// Reduction over the neighbors of a chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reduction {
    pub op: ReductionOp,
    pub init: Expr,
    pub rhs: Expr,
    /// One weight per table slot, if present.
    #[serde(default)]
    pub weights: Option<Vec<Expr>>,
    pub space: IterationSpace,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(f64),
    Int(i64),
    Bool(bool),
    Var(String),
    Global(String),
    Field(FieldAccess),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    Call {
        func: MathFn,
        args: Vec<Expr>,
    },
    Reduce(Box<Reduction>),
}

impl Expr {
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn field(access: FieldAccess) -> Self {
        Expr::Field(access)
    }

    pub fn reduce(reduction: Reduction) -> Self {
        Expr::Reduce(Box::new(reduction))
    }
}

// ─── Statements ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    pub fn symbol(self) -> &'static str {
        match self {
            AssignOp::Assign => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LValue {
    Var(String),
    Field(FieldAccess),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    VarDecl {
        name: String,
        init: Option<Expr>,
    },
    Assign {
        target: LValue,
        op: AssignOp,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        #[serde(default)]
        els: Vec<Stmt>,
    },
    Block(Vec<Stmt>),
    /// Run `body` once per neighbor of the chain.
    NeighborLoop {
        space: IterationSpace,
        body: Vec<Stmt>,
    },
}

impl Stmt {
    pub fn assign_field(access: FieldAccess, value: Expr) -> Self {
        Stmt::Assign {
            target: LValue::Field(access),
            op: AssignOp::Assign,
            value,
        }
    }
}
