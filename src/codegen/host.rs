//! Host orchestration: the wrapper class around an instantiation's kernels.
//!
//! Emits the per-instantiation `GpuTriMesh`, the stencil struct with its
//! setup/free/run/copy functions, and the out-of-class definitions of the
//! static members.

use std::collections::{BTreeMap, BTreeSet};

use crate::diagnostic::Diagnostic;
use crate::ir::{
    Field, FieldId, GlobalType, Horizontal, Intent, IterationSpace, LocationType, LoopOrder,
    MultiStage, Stage, Stencil,
    StencilInstantiation,
};
use crate::iterspace;
use crate::mesh::Subdomain;

use super::kernel::check_intervals;
use super::params::{stage_signature, FLOAT_TYPE};
use super::writer::SourceWriter;

pub const NAMESPACE: &str = "dawn_generated::cuda_ico";

// ─── Stencil selection and API fields ─────────────────────────────

/// API generation handles exactly one stencil per instantiation.
pub fn single_stencil(inst: &StencilInstantiation) -> Result<&Stencil, Diagnostic> {
    match inst.stencils.as_slice() {
        [stencil] => Ok(stencil),
        [] => Err(Diagnostic::error(format!(
            "'{}' has no stencil to generate code for",
            inst.name
        ))),
        many => Err(Diagnostic::error(format!(
            "code generation only for at most one stencil, '{}' has {}",
            inst.name,
            many.len()
        ))
        .with_help("split the program into one instantiation per stencil".to_string())),
    }
}

pub fn stencil_struct_name(stencil: &Stencil) -> String {
    format!("stencil_{}", stencil.id)
}

/// `dawn_generated::cuda_ico::N::stencil_0`
pub fn full_stencil_name(inst: &StencilInstantiation, stencil: &Stencil) -> String {
    format!("{}::{}::{}", NAMESPACE, inst.name, stencil_struct_name(stencil))
}

/// API fields a stencil references, in API order, with merged intents.
#[derive(Clone, Debug)]
pub struct ApiFields<'a> {
    inst: &'a StencilInstantiation,
    used: Vec<(FieldId, Intent)>,
}

impl<'a> ApiFields<'a> {
    pub fn new(inst: &'a StencilInstantiation, stencil: &Stencil) -> Self {
        let referenced = stencil.referenced_fields();
        let used = inst
            .api_fields
            .iter()
            .filter_map(|id| referenced.get(id).map(|intent| (*id, *intent)))
            .collect();
        Self { inst, used }
    }

    pub fn used(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.used.iter().map(|(id, _)| *id)
    }

    /// Output and InputOutput fields.
    pub fn outputs(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.used
            .iter()
            .filter(|(_, intent)| intent.is_written())
            .map(|(id, _)| *id)
    }

    pub fn is_output(&self, id: FieldId) -> bool {
        self.used
            .iter()
            .any(|(f, intent)| *f == id && intent.is_written())
    }

    pub fn used_names(&self) -> Vec<&'a str> {
        let inst = self.inst;
        self.used.iter().map(|(id, _)| inst.field_name(*id)).collect()
    }

    pub fn output_names(&self) -> Vec<&'a str> {
        let inst = self.inst;
        self.used
            .iter()
            .filter(|(_, intent)| intent.is_written())
            .map(|(id, _)| inst.field_name(*id))
            .collect()
    }
}

/// Temporaries a stencil references, by ascending field ID.
pub fn stencil_temporaries(inst: &StencilInstantiation, stencil: &Stencil) -> Vec<FieldId> {
    let referenced = stencil.referenced_fields();
    inst.temporaries()
        .filter(|id| referenced.contains_key(id))
        .collect()
}

// ─── Sizes ────────────────────────────────────────────────────────

/// Vertical extent in generated code: `"1"` for 2D fields.
fn k_size_str(field: &Field) -> &'static str {
    if field.dims.vertical {
        "kSize_"
    } else {
        "1"
    }
}

/// Raw element count of a field buffer, over `mesh` (`mesh_` or `mesh`).
fn num_elements_str(field: &Field, mesh: &str, k_size: &str) -> String {
    let mut s = match &field.dims.horizontal {
        None => return k_size.to_string(),
        Some(Horizontal::Dense(loc)) => format!("({}.{})", mesh, loc.stride_name()),
        Some(Horizontal::Sparse(space)) => format!(
            "({}.{})*{}",
            mesh,
            space.origin().unwrap_or(LocationType::Cells).stride_name(),
            space.size_name()
        ),
    };
    if field.dims.vertical {
        s.push_str(&format!(" * {}", k_size));
    }
    s
}

fn horizontal_stride(field: &Field) -> Option<LocationType> {
    field
        .dims
        .horizontal
        .as_ref()
        .and_then(Horizontal::dense_location)
}

// ─── Globals ──────────────────────────────────────────────────────

/// `struct globals` shared by every instantiation of the translation unit.
pub fn emit_globals_struct(
    w: &mut SourceWriter,
    globals: &BTreeMap<String, GlobalType>,
) {
    if globals.is_empty() {
        return;
    }
    w.open("struct globals");
    for (name, ty) in globals {
        w.line(format!("{} {};", ty.cxx(), name));
    }
    w.close_with("};");
}

// ─── Horizontal domain ────────────────────────────────────────────

fn domain_lookup(loc: LocationType, code: i32, offset: i32) -> Result<String, Diagnostic> {
    let subdomain = Subdomain::from_code(code)?;
    Ok(format!(
        "mesh_.HorizontalDomain({{::dawn::LocationType::{},{},{}}})",
        loc.plural(),
        subdomain.cxx(),
        offset
    ))
}

/// `(hoffset, hsize)` initializers of a stage.
pub fn horizontal_range(stage: &Stage) -> Result<(String, String), Diagnostic> {
    match &stage.domain {
        None => Ok((
            "0".to_string(),
            format!("mesh_.{}", stage.location.count_name()),
        )),
        Some(range) => {
            let lower = domain_lookup(stage.location, range.lower.subdomain, range.lower.offset)?;
            let upper = domain_lookup(stage.location, range.upper.subdomain, range.upper.offset)?;
            Ok((lower.clone(), format!("{} - {}", upper, lower)))
        }
    }
}

// ─── Wrapper class ────────────────────────────────────────────────

pub fn emit_wrapper_class(
    w: &mut SourceWriter,
    inst: &StencilInstantiation,
) -> Result<(), Diagnostic> {
    let stencil = single_stencil(inst)?;
    let spaces = iterspace::instantiation_spaces(inst);

    w.open(format!("class {}", inst.name));
    w.close_with("public:");
    w.indent();
    for space in &spaces {
        let mut size = space.chain_capacity().to_string();
        if space.include_center {
            size.push_str(" + 1");
        }
        w.line(format!("static const int {} = {};", space.size_name(), size));
    }
    emit_gpu_mesh(w, &spaces);
    emit_stencil_struct(w, inst, stencil)?;
    w.close_with("};");
    Ok(())
}

fn chain_vector(space: &IterationSpace) -> String {
    let locs: Vec<String> = space
        .chain
        .iter()
        .map(|l| format!("dawn::LocationType::{}", l.plural()))
        .collect();
    format!("{{{}}}", locs.join(", "))
}

fn emit_gpu_mesh(w: &mut SourceWriter, spaces: &BTreeSet<IterationSpace>) {
    w.open("struct GpuTriMesh");
    for member in [
        "NumVertices",
        "NumEdges",
        "NumCells",
        "VertexStride",
        "EdgeStride",
        "CellStride",
    ] {
        w.line(format!("int {};", member));
    }
    w.line("dawn::unstructured_domain HorizontalDomain;");
    for space in spaces {
        w.line(format!("int* {};", space.table_name()));
    }
    w.line("GpuTriMesh() {}");
    w.open("GpuTriMesh(const dawn::GlobalGpuTriMesh *mesh)");
    for member in [
        "NumVertices",
        "NumCells",
        "NumEdges",
        "VertexStride",
        "CellStride",
        "EdgeStride",
        "HorizontalDomain",
    ] {
        w.line(format!("{m} = mesh->{m};", m = member));
    }
    for space in spaces {
        w.line(format!(
            "{} = mesh->NeighborTables.at(std::tuple<std::vector<dawn::LocationType>, bool>{{{}, {}}});",
            space.table_name(),
            chain_vector(space),
            u8::from(space.include_center)
        ));
    }
    w.close();
    w.close_with("};");
}

fn emit_stencil_struct(
    w: &mut SourceWriter,
    inst: &StencilInstantiation,
    stencil: &Stencil,
) -> Result<(), Diagnostic> {
    let api = ApiFields::new(inst, stencil);
    let temporaries = stencil_temporaries(inst, stencil);
    let outputs = api.output_names();

    w.open(format!("struct {}", stencil_struct_name(stencil)));
    for (name, ty) in &inst.globals {
        w.line(format!(
            "void set_{n}(const {t}& {n}) {{ m_globals.{n} = {n}; }}",
            n = name,
            t = ty.cxx()
        ));
    }

    w.close_with("private:");
    w.indent();
    for id in stencil.referenced_fields().keys() {
        let name = inst.field_name(*id);
        if inst.field(*id).temporary {
            w.line(format!("static {}* {}_;", FLOAT_TYPE, name));
        } else {
            w.line(format!("{}* {}_;", FLOAT_TYPE, name));
        }
    }
    w.line("static int kSize_;");
    w.line("static GpuTriMesh mesh_;");
    w.line("static bool is_setup_;");
    w.line("static cudaStream_t stream_;");
    for name in &outputs {
        w.line(format!("static int {}_kSize_;", name));
    }

    w.close_with("public:");
    w.indent();
    w.line("static const GpuTriMesh & getMesh() { return mesh_; }");
    w.line("static cudaStream_t getStream() { return stream_; }");
    w.line("static int getKSize() { return kSize_; }");
    for name in &outputs {
        w.line(format!(
            "static int get_{n}_KSize() {{ return {n}_kSize_; }}",
            n = name
        ));
    }
    if !inst.globals.is_empty() {
        w.line("globals m_globals;");
    }

    w.open("static void free()");
    for id in &temporaries {
        w.line(format!("gpuErrchk(cudaFree({}_));", inst.field_name(*id)));
    }
    w.close();

    emit_setup(w, inst, &temporaries, &outputs);
    emit_grid(w);
    w.line(format!("{}() {{}}", stencil_struct_name(stencil)));
    emit_run(w, inst, stencil)?;
    emit_copy_back(w, inst, &api, true);
    emit_copy_back(w, inst, &api, false);
    emit_copy_memory(w, inst, &api);
    emit_copy_pointers(w, inst, &api);
    w.close_with("};");
    Ok(())
}

fn emit_setup(
    w: &mut SourceWriter,
    inst: &StencilInstantiation,
    temporaries: &[FieldId],
    outputs: &[&str],
) {
    let mut args = vec![
        "const dawn::GlobalGpuTriMesh *mesh".to_string(),
        "int kSize".to_string(),
        "cudaStream_t stream".to_string(),
    ];
    args.extend(outputs.iter().map(|n| format!("const int {}_kSize", n)));
    w.open(format!("static void setup({})", args.join(", ")));
    w.line("mesh_ = GpuTriMesh(mesh);");
    w.line("kSize_ = kSize;");
    w.line("is_setup_ = true;");
    w.line("stream_ = stream;");
    for name in outputs {
        w.line(format!("{n}_kSize_ = {n}_kSize;", n = name));
    }
    for id in temporaries {
        let field = inst.field(*id);
        let name = &field.name;
        let line = match &field.dims.horizontal {
            None => format!("::dawn::allocField(&{}_, kSize_);", name),
            Some(Horizontal::Dense(loc)) => format!(
                "::dawn::allocField(&{}_, mesh_.{}, {});",
                name,
                loc.stride_name(),
                k_size_str(field)
            ),
            Some(Horizontal::Sparse(space)) => format!(
                "::dawn::allocField(&{}_, mesh_.{}, {}, {});",
                name,
                space.origin().unwrap_or(LocationType::Cells).stride_name(),
                space.size_name(),
                k_size_str(field)
            ),
        };
        w.line(line);
    }
    w.close();
}

fn emit_grid(w: &mut SourceWriter) {
    w.open("dim3 grid(int kSize, int elSize, bool kparallel)");
    w.open("if (kparallel)");
    w.line("int dK = (kSize + LEVELS_PER_THREAD - 1) / LEVELS_PER_THREAD;");
    w.line("return dim3((elSize + BLOCK_SIZE - 1) / BLOCK_SIZE, dK, 1);");
    w.close_with("} else {");
    w.indent();
    w.line("return dim3((elSize + BLOCK_SIZE - 1) / BLOCK_SIZE, 1, 1);");
    w.close();
    w.close();
}

/// `kernel<SIZES><<<dG0,dB,0, stream_>>>(args);`
pub fn launch_statement(
    inst: &StencilInstantiation,
    ms: &MultiStage,
    stage: &Stage,
) -> String {
    let sig = stage_signature(inst, ms, stage);
    format!(
        "{}{}<<<dG{},dB,0, stream_>>>({});",
        sig.kernel_name,
        sig.template_args(),
        stage.id,
        sig.arg_list()
    )
}

fn emit_run(
    w: &mut SourceWriter,
    inst: &StencilInstantiation,
    stencil: &Stencil,
) -> Result<(), Diagnostic> {
    w.open("void run()");
    w.open("if (!is_setup_)");
    w.line(format!(
        "printf(\"{} has not been set up! make sure setup() is called before run!\\n\");",
        inst.name
    ));
    w.line("return;");
    w.close();
    w.line("dim3 dB(BLOCK_SIZE, 1, 1);");
    for (ms, stage) in stencil.stages() {
        let interval = check_intervals(inst, stage)?;
        let (hoffset, hsize) = horizontal_range(stage)?;
        let id = stage.id;
        w.line(format!("int hoffset{} = {};", id, hoffset));
        w.line(format!("int hsize{} = {};", id, hsize));
        w.open(format!("if (hsize{} != 0)", id));
        w.line(format!(
            "dim3 dG{id} = grid({}, hsize{id}, {});",
            interval.extent("kSize_"),
            ms.loop_order == LoopOrder::Parallel,
            id = id
        ));
        w.line(launch_statement(inst, ms, stage));
        w.close();
        w.raw("#ifndef NDEBUG");
        w.line("gpuErrchk(cudaPeekAtLastError());");
        w.line("gpuErrchk(cudaDeviceSynchronize());");
        w.raw("#endif");
    }
    w.close();
    Ok(())
}

/// Typed host container of a field for the templated copy-back.
fn typed_container(field: &Field) -> String {
    let kind = match &field.dims.horizontal {
        None => return format!("dawn::vertical_field_t<LibTag, {}>&", FLOAT_TYPE),
        Some(Horizontal::Dense(loc)) => dense_type_prefix(*loc).to_string(),
        Some(Horizontal::Sparse(space)) => format!(
            "sparse_{}",
            dense_type_prefix(space.origin().unwrap_or(LocationType::Cells))
        ),
    };
    format!("dawn::{}_field_t<LibTag, {}>&", kind, FLOAT_TYPE)
}

fn dense_type_prefix(loc: LocationType) -> &'static str {
    match loc {
        LocationType::Cells => "cell",
        LocationType::Edges => "edge",
        LocationType::Vertices => "vertex",
    }
}

fn emit_copy_back(w: &mut SourceWriter, inst: &StencilInstantiation, api: &ApiFields, raw: bool) {
    let outputs: Vec<&Field> = api.outputs().map(|id| inst.field(id)).collect();
    if !raw && outputs.is_empty() {
        return;
    }
    let mut args: Vec<String> = outputs
        .iter()
        .map(|f| {
            if raw {
                format!("{}* {}", FLOAT_TYPE, f.name)
            } else {
                format!("{} {}", typed_container(f), f.name)
            }
        })
        .collect();
    args.push("bool do_reshape".to_string());
    if !raw {
        w.line("template<typename LibTag>");
    }
    w.open(format!("void CopyResultToHost({})", args.join(", ")));
    for field in outputs {
        let name = &field.name;
        let count = if raw {
            num_elements_str(field, "mesh_", "kSize_")
        } else {
            format!("{}.numElements()", name)
        };
        let dst = if raw {
            name.clone()
        } else {
            format!("{}.data()", name)
        };
        let direct = format!(
            "gpuErrchk(cudaMemcpy({}, {}_, {}*sizeof({}), cudaMemcpyDeviceToHost));",
            dst, name, count, FLOAT_TYPE
        );
        let Some(loc) = horizontal_stride(field) else {
            // vertical-only fields have the same layout on both sides
            w.line(direct);
            continue;
        };
        w.open("if (do_reshape)");
        w.line(format!(
            "{t}* host_buf = new {t}[{c}];",
            t = FLOAT_TYPE,
            c = count
        ));
        w.line(format!(
            "gpuErrchk(cudaMemcpy(({t}*) host_buf, {n}_, {c}*sizeof({t}), cudaMemcpyDeviceToHost));",
            t = FLOAT_TYPE,
            n = name,
            c = count
        ));
        let sparse = match &field.dims.horizontal {
            Some(Horizontal::Sparse(space)) => format!(", {}", space.size_name()),
            _ => String::new(),
        };
        w.line(format!(
            "dawn::reshape_back(host_buf, {}, {}, mesh_.{}{});",
            dst,
            k_size_str(field),
            loc.stride_name(),
            sparse
        ));
        w.line("delete[] host_buf;");
        w.close_with("} else {");
        w.indent();
        w.line(direct);
        w.close();
    }
    w.close();
}

fn emit_copy_memory(w: &mut SourceWriter, inst: &StencilInstantiation, api: &ApiFields) {
    let mut args: Vec<String> = api
        .used_names()
        .iter()
        .map(|n| format!("{}* {}", FLOAT_TYPE, n))
        .collect();
    args.push("bool do_reshape".to_string());
    w.open(format!("void copy_memory({})", args.join(", ")));
    for id in api.used() {
        let field = inst.field(id);
        let name = &field.name;
        let line = match &field.dims.horizontal {
            None => format!("dawn::initField({n}, &{n}_, kSize_);", n = name),
            Some(Horizontal::Dense(loc)) => format!(
                "dawn::initField({n}, &{n}_, mesh_.{}, {}, do_reshape);",
                loc.stride_name(),
                k_size_str(field),
                n = name
            ),
            Some(Horizontal::Sparse(space)) => format!(
                "dawn::initSparseField({n}, &{n}_, mesh_.{}, {}, {}, do_reshape);",
                space.origin().unwrap_or(LocationType::Cells).stride_name(),
                space.size_name(),
                k_size_str(field),
                n = name
            ),
        };
        w.line(line);
    }
    w.close();
}

fn emit_copy_pointers(w: &mut SourceWriter, inst: &StencilInstantiation, api: &ApiFields) {
    let args: Vec<String> = api
        .used_names()
        .iter()
        .map(|n| format!("{}* {}", FLOAT_TYPE, n))
        .collect();
    w.open(format!("void copy_pointers({})", args.join(", ")));
    for id in api.used() {
        w.line(format!("{n}_ = {n};", n = inst.field_name(id)));
    }
    w.close();
}

// ─── Static trailer ───────────────────────────────────────────────

pub fn emit_static_trailer(
    w: &mut SourceWriter,
    inst: &StencilInstantiation,
) -> Result<(), Diagnostic> {
    let stencil = single_stencil(inst)?;
    let full = full_stencil_name(inst, stencil);
    for id in stencil_temporaries(inst, stencil) {
        w.line(format!("{} *{}::{}_;", FLOAT_TYPE, full, inst.field_name(id)));
    }
    w.line(format!("int {}::kSize_;", full));
    w.line(format!("cudaStream_t {}::stream_;", full));
    for name in ApiFields::new(inst, stencil).output_names() {
        w.line(format!("int {}::{}_kSize_;", full, name));
    }
    w.line(format!("bool {}::is_setup_ = false;", full));
    w.line(format!(
        "{}::{}::GpuTriMesh {}::mesh_;",
        NAMESPACE, inst.name, full
    ));
    Ok(())
}
