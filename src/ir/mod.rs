//! IR: the finalized, already scheduled stencil program this backend lowers.
//!
//! An instantiation is a tree of stencils → multistages → stages → do-methods,
//! where statement bodies live in [`ast`]. Cross references (stage → field,
//! instantiation → API field) are plain integer IDs into the instantiation's
//! flat field table, so the tree has a single owner and no back-pointers.
//!
//! ```text
//! StencilInstantiation
//!  ├─ fields: [Field]            (FieldId = index)
//!  ├─ api_fields: [FieldId]      (caller-supplied, in call order)
//!  ├─ globals: {name → type}
//!  └─ stencils: [Stencil]
//!      └─ multistages: [MultiStage { loop_order }]
//!          └─ stages: [Stage { location, domain, fields }]
//!              └─ do_methods: [DoMethod { interval, body }]
//! ```

pub mod ast;
pub mod builder;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::diagnostic::Diagnostic;

pub use ast::{
    AssignOp, BinaryOp, Expr, FieldAccess, HorizontalAccess, LValue, MathFn, Reduction,
    ReductionOp, Stmt, UnaryOp,
};

// ─── Mesh element kinds ───────────────────────────────────────────

/// Mesh element kind. Ordering (Cells < Edges < Vertices) is the
/// deterministic order used wherever sets of kinds are emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LocationType {
    Cells,
    Edges,
    Vertices,
}

impl LocationType {
    pub const ALL: [LocationType; 3] = [
        LocationType::Cells,
        LocationType::Edges,
        LocationType::Vertices,
    ];

    /// Plural name, as used by the driver runtime (`::dawn::LocationType::Cells`).
    pub fn plural(self) -> &'static str {
        match self {
            LocationType::Cells => "Cells",
            LocationType::Edges => "Edges",
            LocationType::Vertices => "Vertices",
        }
    }

    /// Element count member of the mesh (`NumCells`). Also the name of the
    /// dense-size kernel parameter for this kind.
    pub fn count_name(self) -> &'static str {
        match self {
            LocationType::Cells => "NumCells",
            LocationType::Edges => "NumEdges",
            LocationType::Vertices => "NumVertices",
        }
    }

    /// Stride member of the mesh (`CellStride`).
    pub fn stride_name(self) -> &'static str {
        match self {
            LocationType::Cells => "CellStride",
            LocationType::Edges => "EdgeStride",
            LocationType::Vertices => "VertexStride",
        }
    }

    /// One-letter tag used in table and size names.
    pub fn letter(self) -> char {
        match self {
            LocationType::Cells => 'c',
            LocationType::Edges => 'e',
            LocationType::Vertices => 'v',
        }
    }

    /// Upper bound on neighbors of kind `to` adjacent to one element of
    /// this kind on an icosahedral (triangular) mesh.
    pub fn max_degree(self, to: LocationType) -> usize {
        use LocationType::*;
        match (self, to) {
            (Cells, Edges) | (Cells, Vertices) | (Cells, Cells) => 3,
            (Edges, Cells) | (Edges, Vertices) => 2,
            (Edges, Edges) => 4,
            (Vertices, Edges) | (Vertices, Cells) | (Vertices, Vertices) => 6,
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

// ─── Iteration spaces ─────────────────────────────────────────────

/// A bounded neighbor set: an ordered chain of element-kind hops plus
/// whether the origin element itself is part of the set.
///
/// Equality, hashing and ordering are by `(chain, include_center)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IterationSpace {
    pub chain: Vec<LocationType>,
    #[serde(default)]
    pub include_center: bool,
}

impl IterationSpace {
    pub fn new(chain: Vec<LocationType>, include_center: bool) -> Self {
        Self {
            chain,
            include_center,
        }
    }

    /// Kind of the element the chain starts from.
    pub fn origin(&self) -> Option<LocationType> {
        self.chain.first().copied()
    }

    /// Kind of the elements the chain reaches.
    pub fn target(&self) -> Option<LocationType> {
        self.chain.last().copied()
    }

    /// Combinatorial upper bound on reachable neighbors: the product of the
    /// per-hop degrees. Zero for chains without a hop.
    pub fn chain_capacity(&self) -> usize {
        if self.chain.len() < 2 {
            return 0;
        }
        self.chain
            .windows(2)
            .map(|hop| hop[0].max_degree(hop[1]))
            .product()
    }

    /// Slots per element in the neighbor table (capacity, +1 for the center).
    pub fn table_size(&self) -> usize {
        self.chain_capacity() + usize::from(self.include_center)
    }

    fn tag(&self) -> String {
        self.chain.iter().map(|l| l.letter()).collect()
    }

    /// Name of the mesh member / kernel parameter holding this table (`cecTable`).
    pub fn table_name(&self) -> String {
        if self.include_center {
            format!("{}WithCenterTable", self.tag())
        } else {
            format!("{}Table", self.tag())
        }
    }

    /// Name of the compile-time size constant (`CEC_SIZE`).
    pub fn size_name(&self) -> String {
        let tag = self.tag().to_uppercase();
        if self.include_center {
            format!("{}_WITH_CENTER_SIZE", tag)
        } else {
            format!("{}_SIZE", tag)
        }
    }
}

impl fmt::Display for IterationSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<&str> = self.chain.iter().map(|l| l.plural()).collect();
        write!(f, "{}", hops.join(" -> "))?;
        if self.include_center {
            write!(f, " (+center)")?;
        }
        Ok(())
    }
}

// ─── Vertical intervals ───────────────────────────────────────────

/// The level a vertical bound is anchored at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    /// An absolute level index.
    Absolute(i32),
    /// The end of the column (the runtime vertical size).
    End,
}

/// One bound of an interval: a level plus an integer offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bound {
    pub level: Level,
    #[serde(default)]
    pub offset: i32,
}

impl Bound {
    pub fn start(offset: i32) -> Self {
        Self {
            level: Level::Absolute(0),
            offset,
        }
    }

    pub fn absolute(level: i32, offset: i32) -> Self {
        Self {
            level: Level::Absolute(level),
            offset,
        }
    }

    pub fn end(offset: i32) -> Self {
        Self {
            level: Level::End,
            offset,
        }
    }

    pub fn is_end(&self) -> bool {
        self.level == Level::End
    }

    /// Resolve to source text: a literal, or `<ksize> + offset`.
    pub fn render(&self, k_size: &str) -> String {
        match self.level {
            Level::Absolute(level) => (level + self.offset).to_string(),
            Level::End => format!("{} + {}", k_size, self.offset),
        }
    }

    /// Resolve against a concrete vertical size.
    pub fn eval(&self, k_size: i64) -> i64 {
        match self.level {
            Level::Absolute(level) => i64::from(level) + i64::from(self.offset),
            Level::End => k_size + i64::from(self.offset),
        }
    }
}

/// A vertical range `[lower, upper)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub lower: Bound,
    pub upper: Bound,
}

impl Interval {
    pub fn new(lower: Bound, upper: Bound) -> Self {
        Self { lower, upper }
    }

    /// The whole column, `[0, kSize)`.
    pub fn full() -> Self {
        Self::new(Bound::start(0), Bound::end(0))
    }

    /// Two intervals are consistent when both bounds sit on the same levels.
    pub fn same_levels(&self, other: &Interval) -> bool {
        self.lower.level == other.lower.level && self.upper.level == other.upper.level
    }

    /// Number of levels, as source text over `k_size`.
    pub fn extent(&self, k_size: &str) -> String {
        let lo = self.lower.eval(0);
        match (self.lower.is_end(), self.upper.is_end()) {
            (true, true) => (self.upper.offset - self.lower.offset).to_string(),
            (false, true) => format!("{} + {} - {}", k_size, self.upper.offset, lo),
            (true, false) => format!("{} - ({} + {})", self.upper.eval(0), k_size, self.lower.offset),
            (false, false) => (self.upper.eval(0) - lo).to_string(),
        }
    }

    /// Number of levels for a concrete vertical size (never negative).
    pub fn extent_for(&self, k_size: i64) -> i64 {
        (self.upper.eval(k_size) - self.lower.eval(k_size)).max(0)
    }
}

// ─── Loop order ───────────────────────────────────────────────────

/// Vertical traversal discipline of a multistage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopOrder {
    Parallel,
    Forward,
    Backward,
}

// ─── Fields ───────────────────────────────────────────────────────

/// Index into `StencilInstantiation::fields`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FieldId(pub usize);

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    Input,
    Output,
    InputOutput,
}

impl Intent {
    /// Output or InputOutput.
    pub fn is_written(self) -> bool {
        matches!(self, Intent::Output | Intent::InputOutput)
    }
}

/// Horizontal part of a field's dimensionality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Horizontal {
    /// One value per element of a kind.
    Dense(LocationType),
    /// One value per (element, neighbor slot); elements are the chain origin.
    Sparse(IterationSpace),
}

impl Horizontal {
    /// The element kind the field is dense in.
    pub fn dense_location(&self) -> Option<LocationType> {
        match self {
            Horizontal::Dense(loc) => Some(*loc),
            Horizontal::Sparse(space) => space.origin(),
        }
    }

    /// Neighbor slots per element (1 for dense fields).
    pub fn sparse_size(&self) -> usize {
        match self {
            Horizontal::Dense(_) => 1,
            Horizontal::Sparse(space) => space.table_size(),
        }
    }
}

/// Field dimensionality. `horizontal == None` means vertical-only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDims {
    pub horizontal: Option<Horizontal>,
    pub vertical: bool,
}

impl FieldDims {
    pub fn vertical_only() -> Self {
        Self {
            horizontal: None,
            vertical: true,
        }
    }

    pub fn dense(loc: LocationType) -> Self {
        Self {
            horizontal: Some(Horizontal::Dense(loc)),
            vertical: true,
        }
    }

    pub fn sparse(space: IterationSpace) -> Self {
        Self {
            horizontal: Some(Horizontal::Sparse(space)),
            vertical: true,
        }
    }

    /// Drop the vertical dimension (a 2D field).
    pub fn horizontal_only(mut self) -> Self {
        self.vertical = false;
        self
    }

    pub fn is_vertical_only(&self) -> bool {
        self.horizontal.is_none()
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.horizontal, Some(Horizontal::Sparse(_)))
    }

    /// Number of array dimensions the host sees.
    pub fn rank(&self) -> usize {
        match &self.horizontal {
            None => 1,
            Some(Horizontal::Dense(_)) => 1 + usize::from(self.vertical),
            Some(Horizontal::Sparse(_)) => 2 + usize::from(self.vertical),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub intent: Intent,
    pub dims: FieldDims,
    /// Temporaries live between setup and free; everything else is a
    /// caller-supplied pointer refreshed on every call.
    #[serde(default)]
    pub temporary: bool,
}

// ─── Globals ──────────────────────────────────────────────────────

/// Type of a global scalar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GlobalType {
    Boolean,
    Integer,
    Float,
    Double,
    String,
}

impl GlobalType {
    /// C++ spelling.
    pub fn cxx(self) -> &'static str {
        match self {
            GlobalType::Boolean => "bool",
            GlobalType::Integer => "int",
            GlobalType::Float => "float",
            GlobalType::Double => "double",
            GlobalType::String => "std::string",
        }
    }
}

// ─── Stages ───────────────────────────────────────────────────────

/// A do-method: a statement list over one vertical interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DoMethod {
    pub interval: Interval,
    pub body: Vec<Stmt>,
}

/// One bound of a horizontal sub-domain: a subdomain code plus offset.
///
/// The code is kept raw; it is validated when the stage is lowered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainBound {
    pub subdomain: i32,
    #[serde(default)]
    pub offset: i32,
}

/// Horizontal restriction of a stage: `[lower, upper)` in element indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HorizontalRange {
    pub lower: DomainBound,
    pub upper: DomainBound,
}

/// A field referenced by a stage, with the stage-local intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageField {
    pub field: FieldId,
    pub intent: Intent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: usize,
    pub location: LocationType,
    #[serde(default)]
    pub domain: Option<HorizontalRange>,
    pub do_methods: Vec<DoMethod>,
    pub fields: Vec<StageField>,
}

impl Stage {
    /// Fields in the fixed per-stage order (ascending field ID).
    pub fn ordered_fields(&self) -> Vec<StageField> {
        let mut by_id: BTreeMap<FieldId, StageField> = BTreeMap::new();
        for f in &self.fields {
            by_id.insert(f.field, *f);
        }
        by_id.into_values().collect()
    }

    pub fn is_restricted(&self) -> bool {
        self.domain.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiStage {
    pub id: usize,
    pub loop_order: LoopOrder,
    pub stages: Vec<Stage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stencil {
    pub id: usize,
    pub multistages: Vec<MultiStage>,
}

impl Stencil {
    /// All stages in program order, with their multistage.
    pub fn stages(&self) -> impl Iterator<Item = (&MultiStage, &Stage)> {
        self.multistages
            .iter()
            .flat_map(|ms| ms.stages.iter().map(move |stage| (ms, stage)))
    }

    pub fn do_methods(&self) -> impl Iterator<Item = &DoMethod> {
        self.stages().flat_map(|(_, stage)| stage.do_methods.iter())
    }

    /// Every field referenced by any stage, with the merged intent.
    pub fn referenced_fields(&self) -> BTreeMap<FieldId, Intent> {
        let mut merged: BTreeMap<FieldId, Intent> = BTreeMap::new();
        for (_, stage) in self.stages() {
            for f in &stage.fields {
                let intent = match merged.get(&f.field) {
                    None => f.intent,
                    Some(prev) if *prev == f.intent => f.intent,
                    Some(_) => Intent::InputOutput,
                };
                merged.insert(f.field, intent);
            }
        }
        merged
    }
}

// ─── Instantiation ────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StencilInstantiation {
    pub name: String,
    pub fields: Vec<Field>,
    pub api_fields: Vec<FieldId>,
    #[serde(default)]
    pub globals: BTreeMap<String, GlobalType>,
    pub stencils: Vec<Stencil>,
}

impl StencilInstantiation {
    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id.0]
    }

    pub fn field_name(&self, id: FieldId) -> &str {
        &self.fields[id.0].name
    }

    pub fn temporaries(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.temporary)
            .map(|(i, _)| FieldId(i))
    }

    pub fn do_methods(&self) -> impl Iterator<Item = &DoMethod> {
        self.stencils.iter().flat_map(|s| s.do_methods())
    }
}

// ─── Loading ──────────────────────────────────────────────────────

/// An IR file holds one instantiation or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum IrFile {
    One(StencilInstantiation),
    Many(Vec<StencilInstantiation>),
}

/// Parse instantiations from IR JSON. `origin` names the source in
/// diagnostics.
pub fn from_json(text: &str, origin: &str) -> Result<Vec<StencilInstantiation>, Diagnostic> {
    let parsed: IrFile = serde_json::from_str(text).map_err(|e| {
        Diagnostic::error(format!("cannot parse '{}': {}", origin, e))
            .with_note(format!("at line {}, column {}", e.line(), e.column()))
    })?;
    let insts = match parsed {
        IrFile::One(inst) => vec![inst],
        IrFile::Many(insts) => insts,
    };
    for inst in &insts {
        check_field_ids(inst)?;
    }
    Ok(insts)
}

/// Read and parse an IR file.
pub fn load(path: &Path) -> Result<Vec<StencilInstantiation>, Diagnostic> {
    let text = std::fs::read_to_string(path).map_err(|e| Diagnostic::read_failed(path, &e))?;
    from_json(&text, &path.display().to_string())
}

// ─── Checks ───────────────────────────────────────────────────────

/// Collect findings over a whole IR file instead of stopping at the first:
/// duplicate instantiation names are errors, empty inputs and unused API
/// fields or globals are warnings.
pub fn lint(insts: &[StencilInstantiation]) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    if insts.is_empty() {
        diags.push(Diagnostic::warning("no instantiations to generate".to_string()));
    }
    let mut names = BTreeSet::new();
    for inst in insts {
        if !names.insert(inst.name.as_str()) {
            diags.push(
                Diagnostic::error(format!("instantiation '{}' is defined twice", inst.name))
                    .with_note("its class and entry points would clash".to_string()),
            );
        }
        if let Err(diag) = check_field_ids(inst) {
            diags.push(diag);
            continue;
        }
        if inst.stencils.iter().all(|s| s.stages().next().is_none()) {
            diags.push(Diagnostic::warning(format!("'{}' has no stages", inst.name)));
        }

        let refs = collect_refs(inst);
        for id in &inst.api_fields {
            if !refs.fields.contains(id) {
                diags.push(Diagnostic::warning(format!(
                    "API field '{}' of '{}' is never accessed",
                    inst.field_name(*id),
                    inst.name
                )));
            }
        }
        for name in inst.globals.keys() {
            if !refs.globals.contains(name) {
                diags.push(
                    Diagnostic::warning(format!(
                        "global '{}' of '{}' is never read",
                        name, inst.name
                    ))
                    .with_help(format!("set_{} still gets generated", name)),
                );
            }
        }
    }
    diags
}

/// Fields and globals named anywhere in the statement bodies.
#[derive(Default)]
struct Refs {
    fields: BTreeSet<FieldId>,
    globals: BTreeSet<String>,
}

fn collect_refs(inst: &StencilInstantiation) -> Refs {
    let mut refs = Refs::default();
    for dm in inst.do_methods() {
        stmt_refs(&dm.body, &mut refs);
    }
    refs
}

/// Every field ID must index the instantiation's field table.
fn check_field_ids(inst: &StencilInstantiation) -> Result<(), Diagnostic> {
    let n = inst.fields.len();
    let mut ids: BTreeSet<FieldId> = inst.api_fields.iter().copied().collect();
    for stencil in &inst.stencils {
        for (_, stage) in stencil.stages() {
            ids.extend(stage.fields.iter().map(|f| f.field));
        }
    }
    ids.extend(collect_refs(inst).fields);
    for id in ids {
        if id.0 >= n {
            return Err(Diagnostic::error(format!(
                "'{}' refers to field {} but has only {} field(s)",
                inst.name, id.0, n
            )));
        }
    }
    Ok(())
}

fn stmt_refs(stmts: &[Stmt], refs: &mut Refs) {
    for stmt in stmts {
        match stmt {
            Stmt::VarDecl { init, .. } => {
                if let Some(init) = init {
                    expr_refs(init, refs);
                }
            }
            Stmt::Assign { target, value, .. } => {
                if let LValue::Field(access) = target {
                    refs.fields.insert(access.field);
                }
                expr_refs(value, refs);
            }
            Stmt::If { cond, then, els } => {
                expr_refs(cond, refs);
                stmt_refs(then, refs);
                stmt_refs(els, refs);
            }
            Stmt::Block(body) | Stmt::NeighborLoop { body, .. } => stmt_refs(body, refs),
        }
    }
}

fn expr_refs(expr: &Expr, refs: &mut Refs) {
    match expr {
        Expr::Field(access) => {
            refs.fields.insert(access.field);
        }
        Expr::Global(name) => {
            refs.globals.insert(name.clone());
        }
        Expr::Unary { operand, .. } => expr_refs(operand, refs),
        Expr::Binary { lhs, rhs, .. } => {
            expr_refs(lhs, refs);
            expr_refs(rhs, refs);
        }
        Expr::Ternary { cond, then, els } => {
            for e in [cond, then, els] {
                expr_refs(e, refs);
            }
        }
        Expr::Call { args, .. } => args.iter().for_each(|a| expr_refs(a, refs)),
        Expr::Reduce(red) => {
            expr_refs(&red.init, refs);
            expr_refs(&red.rhs, refs);
            for w in red.weights.iter().flatten() {
                expr_refs(w, refs);
            }
        }
        Expr::Literal(_) | Expr::Int(_) | Expr::Bool(_) | Expr::Var(_) => {}
    }
}

#[cfg(test)]
mod tests;
