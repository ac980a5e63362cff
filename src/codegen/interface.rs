//! Entry points callable from C and Fortran.
//!
//! Every instantiation gets an `extern "C"` block (definitions in the
//! translation unit, declarations in the optional C header) and, on request,
//! a Fortran module with `bind(c)` interfaces plus convenience wrappers.

use crate::diagnostic::Diagnostic;
use crate::ir::{Field, FieldId, GlobalType, Horizontal, LocationType, StencilInstantiation};

use super::host::{full_stencil_name, single_stencil, ApiFields, NAMESPACE};
use super::params::FLOAT_TYPE;
use super::writer::SourceWriter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiMode {
    /// Function bodies, for the translation unit.
    Definition,
    /// Prototypes only, for the C header.
    Declaration,
}

// ─── C API ────────────────────────────────────────────────────────

struct CApi<'a> {
    inst: &'a StencilInstantiation,
    api: ApiFields<'a>,
    full: String,
}

impl<'a> CApi<'a> {
    fn new(inst: &'a StencilInstantiation) -> Result<Self, Diagnostic> {
        let stencil = single_stencil(inst)?;
        Ok(Self {
            inst,
            api: ApiFields::new(inst, stencil),
            full: full_stencil_name(inst, stencil),
        })
    }

    fn name(&self) -> &str {
        &self.inst.name
    }

    fn global_params(&self) -> Vec<String> {
        self.inst
            .globals
            .iter()
            .map(|(name, ty)| format!("{} {}", ty.cxx(), name))
            .collect()
    }

    fn field_params(&self) -> Vec<String> {
        self.inst
            .api_fields
            .iter()
            .map(|id| format!("{} *{}", FLOAT_TYPE, self.inst.field_name(*id)))
            .collect()
    }

    fn output_fields(&self) -> Vec<&'a Field> {
        let inst = self.inst;
        self.api.outputs().map(|id| inst.field(id)).collect()
    }

    fn run_from_host_signature(&self, lang: &str) -> String {
        let mut params = vec![
            "dawn::GlobalGpuTriMesh *mesh".to_string(),
            "int k_size".to_string(),
        ];
        params.extend(self.global_params());
        params.extend(self.field_params());
        format!(
            "void run_{}_from_{}_host({})",
            self.name(),
            lang,
            params.join(", ")
        )
    }

    fn run_signature(&self) -> String {
        let mut params = self.global_params();
        params.extend(self.field_params());
        format!("void run_{}({})", self.name(), params.join(", "))
    }

    fn verify_signature(&self) -> String {
        let mut params = Vec::new();
        for f in self.output_fields() {
            params.push(format!("const {} *{}_dsl", FLOAT_TYPE, f.name));
            params.push(format!("const {} *{}", FLOAT_TYPE, f.name));
        }
        for f in self.output_fields() {
            params.push(format!("const double {}_rel_tol", f.name));
            params.push(format!("const double {}_abs_tol", f.name));
        }
        params.push("const int iteration".to_string());
        format!("bool verify_{}({})", self.name(), params.join(", "))
    }

    fn run_and_verify_signature(&self) -> String {
        let mut params = self.global_params();
        params.extend(self.field_params());
        for f in self.output_fields() {
            params.push(format!("{} *{}_before", FLOAT_TYPE, f.name));
        }
        for f in self.output_fields() {
            params.push(format!("const double {}_rel_tol", f.name));
            params.push(format!("const double {}_abs_tol", f.name));
        }
        format!("void run_and_verify_{}({})", self.name(), params.join(", "))
    }

    fn setup_signature(&self) -> String {
        let mut params = vec![
            "dawn::GlobalGpuTriMesh *mesh".to_string(),
            "int k_size".to_string(),
            "cudaStream_t stream".to_string(),
        ];
        for f in self.output_fields() {
            params.push(format!("const int {}_k_size", f.name));
        }
        format!("void setup_{}({})", self.name(), params.join(", "))
    }

    fn free_signature(&self) -> String {
        format!("void free_{}()", self.name())
    }

    fn set_globals(&self, w: &mut SourceWriter) {
        for name in self.inst.globals.keys() {
            w.line(format!("s.set_{n}({n});", n = name));
        }
    }

    fn emit_run_from_host(&self, w: &mut SourceWriter, lang: &str) {
        // C callers hand over the natural layout, Fortran arrays already
        // match the device layout.
        let reshape = lang == "c";
        w.open(self.run_from_host_signature(lang));
        w.line(format!("{} s;", self.full));
        let mut setup = vec!["mesh", "k_size", "0"];
        setup.extend(self.output_fields().iter().map(|_| "k_size"));
        w.line(format!("{}::setup({});", self.full, setup.join(", ")));

        let mut used: Vec<&str> = self.api.used_names();
        used.push(if reshape { "true" } else { "false" });
        w.line(format!("s.copy_memory({});", used.join(", ")));
        self.set_globals(w);
        w.line("s.run();");
        let mut outs = self.api.output_names();
        outs.push(if reshape { "true" } else { "false" });
        w.line(format!("s.CopyResultToHost({});", outs.join(", ")));
        w.line(format!("{}::free();", self.full));
        w.line("return;");
        w.close();
    }

    fn emit_run(&self, w: &mut SourceWriter) {
        w.open(self.run_signature());
        w.line(format!("{} s;", self.full));
        w.line(format!("s.copy_pointers({});", self.api.used_names().join(", ")));
        self.set_globals(w);
        w.line("s.run();");
        w.line("return;");
        w.close();
    }

    fn emit_verify(&self, w: &mut SourceWriter) {
        let name = self.name();
        w.open(self.verify_signature());
        w.line("using namespace std::chrono;");
        w.line(format!("const auto &mesh = {}::getMesh();", self.full));
        w.line(format!("cudaStream_t stream = {}::getStream();", self.full));
        w.line(format!("int kSize = {}::getKSize();", self.full));
        w.line("high_resolution_clock::time_point t_start = high_resolution_clock::now();");
        w.line("bool isValid = true;");
        for f in self.output_fields() {
            let n = &f.name;
            w.line(format!(
                "int {n}_kSize = {}::get_{n}_KSize();",
                self.full,
                n = n
            ));
            w.line(format!(
                "bool {n}_valid = ::dawn::verify_field(stream, {}, {n}_dsl,{n}, \"{n}\",{n}_rel_tol,{n}_abs_tol);",
                verify_count(self.inst, f),
                n = n
            ));
            w.open(format!("if (!{}_valid)", n));
            w.line("isValid = false;");
            w.raw("#ifdef __SERIALIZE_ON_ERROR");
            match &f.dims.horizontal {
                Some(Horizontal::Dense(loc)) => {
                    let kind = match loc {
                        LocationType::Cells => "cells",
                        LocationType::Edges => "edges",
                        LocationType::Vertices => "verts",
                    };
                    for buf in [n.clone(), format!("{}_dsl", n)] {
                        w.line(format!(
                            "serialize_dense_{}(0, (mesh.{} - 1), {}_kSize, (mesh.{}), {}, \"{}\", \"{}\", iteration);",
                            kind,
                            loc.count_name(),
                            n,
                            loc.stride_name(),
                            buf,
                            name,
                            buf
                        ));
                    }
                    w.line(format!(
                        "std::cout << \"[DSL] serializing {} as error is high.\\n\" << std::flush;",
                        n
                    ));
                }
                Some(Horizontal::Sparse(_)) => w.line(format!(
                    "std::cout << \"[DSL] can not serialize sparse field {}, error is high.\\n\" << std::flush;",
                    n
                )),
                None => w.line(format!(
                    "std::cout << \"[DSL] can not serialize vertical field {}, error is high.\\n\" << std::flush;",
                    n
                )),
            }
            w.raw("#endif");
            w.close();
        }
        w.raw("#ifdef __SERIALIZE_ON_ERROR");
        w.line(format!("serialize_flush_iter(\"{}\", iteration);", name));
        w.raw("#endif");
        w.line("high_resolution_clock::time_point t_end = high_resolution_clock::now();");
        w.line("duration<double> timing = duration_cast<duration<double>>(t_end - t_start);");
        w.line("std::cout << \"[DSL] Verification took \" << timing.count() << \" seconds.\\n\" << std::flush;");
        w.line("return isValid;");
        w.close();
    }

    fn emit_run_and_verify(&self, w: &mut SourceWriter) {
        let name = self.name();
        w.open(self.run_and_verify_signature());
        w.line("static int iteration = 0;");
        w.line(format!(
            "std::cout << \"[DSL] Running stencil {} (\" << iteration << \") ...\\n\" << std::flush;",
            name
        ));
        let mut run_args: Vec<String> = self.inst.globals.keys().cloned().collect();
        for id in &self.inst.api_fields {
            let n = self.inst.field_name(*id);
            if self.api.is_output(*id) {
                run_args.push(format!("{}_before", n));
            } else {
                run_args.push(n.to_string());
            }
        }
        w.line("auto t_run_start = std::chrono::high_resolution_clock::now();");
        w.line(format!("run_{}({});", name, run_args.join(", ")));
        w.line("auto t_run_end = std::chrono::high_resolution_clock::now();");
        w.line("double time = std::chrono::duration<double>(t_run_end - t_run_start).count();");
        w.line(format!(
            "std::cout << \"[DSL] {} run time: \" << time << \"s\\n\" << std::flush;",
            name
        ));
        w.line(format!(
            "std::cout << \"[DSL] Verifying stencil {}...\\n\" << std::flush;",
            name
        ));
        let mut verify_args = Vec::new();
        for f in self.output_fields() {
            verify_args.push(format!("{}_before", f.name));
            verify_args.push(f.name.clone());
        }
        for f in self.output_fields() {
            verify_args.push(format!("{}_rel_tol", f.name));
            verify_args.push(format!("{}_abs_tol", f.name));
        }
        verify_args.push("iteration".to_string());
        w.line(format!("verify_{}({});", name, verify_args.join(", ")));
        w.line("iteration++;");
        w.close();
    }

    fn emit_setup(&self, w: &mut SourceWriter) {
        w.open(self.setup_signature());
        let mut args = vec!["mesh".to_string(), "k_size".to_string(), "stream".to_string()];
        args.extend(self.output_fields().iter().map(|f| format!("{}_k_size", f.name)));
        w.line(format!("{}::setup({});", self.full, args.join(", ")));
        w.close();
    }

    fn emit_free(&self, w: &mut SourceWriter) {
        w.open(self.free_signature());
        w.line(format!("{}::free();", self.full));
        w.close();
    }
}

/// Element count passed to `verify_field`, over the field's own vertical size.
fn verify_count(inst: &StencilInstantiation, field: &Field) -> String {
    let k = format!("{}_kSize", field.name);
    match &field.dims.horizontal {
        None => k,
        Some(Horizontal::Dense(loc)) => format!("(mesh.{}) * {}", loc.stride_name(), k),
        Some(Horizontal::Sparse(space)) => format!(
            "(mesh.{}) * {} * {}::{}::{}",
            space.origin().unwrap_or(LocationType::Cells).stride_name(),
            k,
            NAMESPACE,
            inst.name,
            space.size_name()
        ),
    }
}

/// The `extern "C"` block of one instantiation.
pub fn emit_c_api(
    w: &mut SourceWriter,
    inst: &StencilInstantiation,
    mode: ApiMode,
) -> Result<(), Diagnostic> {
    let api = CApi::new(inst)?;
    w.line("extern \"C\" {");
    match mode {
        ApiMode::Declaration => {
            for sig in [
                api.run_from_host_signature("c"),
                api.run_from_host_signature("fort"),
                api.run_signature(),
                api.verify_signature(),
                api.run_and_verify_signature(),
                api.setup_signature(),
                api.free_signature(),
            ] {
                w.line(format!("{};", sig));
            }
        }
        ApiMode::Definition => {
            api.emit_run_from_host(w, "c");
            api.emit_run_from_host(w, "fort");
            api.emit_run(w);
            api.emit_verify(w);
            api.emit_run_and_verify(w);
            api.emit_setup(w);
            api.emit_free(w);
        }
    }
    w.line("}");
    Ok(())
}

/// The C header declaring every instantiation's entry points.
pub fn c_header(insts: &[StencilInstantiation]) -> Result<String, Diagnostic> {
    let mut w = SourceWriter::new();
    w.raw("#pragma once");
    w.raw("#include \"driver-includes/defs.hpp\"");
    w.raw("#include \"driver-includes/cuda_utils.hpp\"");
    for inst in insts {
        emit_c_api(&mut w, inst, ApiMode::Declaration)?;
    }
    Ok(w.finish())
}

// ─── Fortran ──────────────────────────────────────────────────────

fn fortran_scalar(ty: GlobalType, name: &str) -> Result<&'static str, Diagnostic> {
    match ty {
        GlobalType::Boolean => Ok("logical(c_bool), value, target"),
        GlobalType::Integer => Ok("integer(c_int), value, target"),
        GlobalType::Float => Ok("real(c_float), value, target"),
        GlobalType::Double => Ok("real(c_double), value, target"),
        GlobalType::String => Err(Diagnostic::error(format!(
            "string globals not supported in the Fortran interface (global '{}')",
            name
        ))
        .with_help("drop the Fortran interface or make the global numeric".to_string())),
    }
}

fn assumed_shape(rank: usize) -> String {
    let dims = vec![":"; rank.max(1)];
    format!("real(c_double), dimension({}), target", dims.join(","))
}

const FIELD_ARG: &str = "real(c_double), dimension(*), target";
const OBJ: &str = "type(c_ptr), value, target";
const INTEGER: &str = "integer(c_int), value, target";
const STREAM: &str = "integer(kind=c_intptr_t), value, target";
const TOLERANCE: &str = "real(c_double), value, target";
const OPT_TOLERANCE: &str = "real(c_double), intent(in), optional";
const OPT_INTEGER: &str = "integer(c_int), intent(in), optional";

/// `(name, type spec)` pairs of a subroutine's dummy arguments.
type FortranArgs = Vec<(String, String)>;

fn fortran_call_args(w: &mut SourceWriter, names: &[String]) {
    for (i, n) in names.iter().enumerate() {
        let sep = if i + 1 == names.len() { "" } else { "," };
        w.line(format!("{}{} &", n, sep));
    }
}

fn open_subroutine(w: &mut SourceWriter, name: &str, args: &FortranArgs, bind: bool) {
    let suffix = if bind { " bind(c)" } else { "" };
    if args.is_empty() {
        w.line(format!("subroutine {}(){}", name, suffix));
    } else {
        w.line(format!("subroutine {}( &", name));
        w.indent();
        let names: Vec<String> = args.iter().map(|(n, _)| n.clone()).collect();
        fortran_call_args(w, &names);
        w.dedent();
        w.line(format!("){}", suffix));
    }
    w.indent();
    w.line("use, intrinsic :: iso_c_binding");
    for (n, ty) in args {
        w.line(format!("{} :: {}", ty, n));
    }
}

fn close_subroutine(w: &mut SourceWriter) {
    w.dedent();
    w.line("end subroutine");
}

fn call(w: &mut SourceWriter, name: &str, args: &[String]) {
    w.line(format!("call {} &", name));
    w.line("( &");
    w.indent();
    fortran_call_args(w, args);
    w.dedent();
    w.line(")");
}

struct FortranApi<'a> {
    c: CApi<'a>,
    globals: FortranArgs,
}

impl<'a> FortranApi<'a> {
    fn new(inst: &'a StencilInstantiation) -> Result<Self, Diagnostic> {
        let c = CApi::new(inst)?;
        let globals = inst
            .globals
            .iter()
            .map(|(n, ty)| Ok((n.clone(), fortran_scalar(*ty, n)?.to_string())))
            .collect::<Result<_, Diagnostic>>()?;
        Ok(Self { c, globals })
    }

    fn api_fields(&self) -> impl Iterator<Item = (FieldId, &'a Field)> + '_ {
        let inst = self.c.inst;
        inst.api_fields.iter().map(move |id| (*id, inst.field(*id)))
    }

    fn fields(&self, ty: impl Fn(&Field) -> String) -> FortranArgs {
        self.api_fields()
            .map(|(_, f)| (f.name.clone(), ty(f)))
            .collect()
    }

    fn before(&self, ty: impl Fn(&Field) -> String) -> FortranArgs {
        self.c
            .output_fields()
            .into_iter()
            .map(|f| (format!("{}_before", f.name), ty(f)))
            .collect()
    }

    fn tolerances(&self, ty: &str) -> FortranArgs {
        let mut args = Vec::new();
        for f in self.c.output_fields() {
            args.push((format!("{}_rel_tol", f.name), ty.to_string()));
            args.push((format!("{}_abs_tol", f.name), ty.to_string()));
        }
        args
    }

    fn emit_interfaces(&self, w: &mut SourceWriter) {
        let name = self.c.name();
        let flat = |_: &Field| FIELD_ARG.to_string();

        let mut run = self.globals.clone();
        run.extend(self.fields(flat));
        open_subroutine(w, &format!("run_{}", name), &run, true);
        close_subroutine(w);

        let mut from_host = vec![
            ("mesh".to_string(), OBJ.to_string()),
            ("k_size".to_string(), INTEGER.to_string()),
        ];
        from_host.extend(run.iter().cloned());
        open_subroutine(w, &format!("run_{}_from_fort_host", name), &from_host, true);
        close_subroutine(w);

        let mut verify = run.clone();
        verify.extend(self.before(flat));
        verify.extend(self.tolerances(TOLERANCE));
        open_subroutine(w, &format!("run_and_verify_{}", name), &verify, true);
        close_subroutine(w);

        let mut setup = vec![
            ("mesh".to_string(), OBJ.to_string()),
            ("k_size".to_string(), INTEGER.to_string()),
            ("stream".to_string(), STREAM.to_string()),
        ];
        for f in self.c.output_fields() {
            setup.push((format!("{}_kmax", f.name), INTEGER.to_string()));
        }
        open_subroutine(w, &format!("setup_{}", name), &setup, true);
        close_subroutine(w);

        open_subroutine(w, &format!("free_{}", name), &Vec::new(), true);
        close_subroutine(w);
    }

    fn emit_wrap_run(&self, w: &mut SourceWriter) {
        let name = self.c.name();
        let shaped = |f: &Field| assumed_shape(f.dims.rank());
        let outputs = self.c.output_fields();

        let mut args = self.globals.clone();
        args.extend(self.fields(shaped));
        args.extend(self.before(shaped));
        args.extend(self.tolerances(OPT_TOLERANCE));
        open_subroutine(w, &format!("wrap_run_{}", name), &args, false);

        for f in &outputs {
            w.line(format!("real(c_double) :: {}_rel_err_tol", f.name));
            w.line(format!("real(c_double) :: {}_abs_err_tol", f.name));
        }
        for f in &outputs {
            for (kind, default) in [
                ("rel", "DEFAULT_RELATIVE_ERROR_THRESHOLD"),
                ("abs", "DEFAULT_ABSOLUTE_ERROR_THRESHOLD"),
            ] {
                w.line(format!("if (present({}_{}_tol)) then", f.name, kind));
                w.indent();
                w.line(format!("{n}_{k}_err_tol = {n}_{k}_tol", n = f.name, k = kind));
                w.dedent();
                w.line("else");
                w.indent();
                w.line(format!("{}_{}_err_tol = {}", f.name, kind, default));
                w.dedent();
                w.line("endif");
            }
        }

        let device: Vec<String> = self
            .fields(shaped)
            .into_iter()
            .chain(self.before(shaped))
            .map(|(n, _)| n)
            .collect();
        if !device.is_empty() {
            w.line("!$ACC host_data use_device( &");
            for (i, n) in device.iter().enumerate() {
                let sep = if i + 1 == device.len() { "" } else { "," };
                w.line(format!("!$ACC    {}{} &", n, sep));
            }
            w.line("!$ACC )");
        }

        let plain: Vec<String> = self
            .globals
            .iter()
            .map(|(n, _)| n.clone())
            .chain(self.api_fields().map(|(_, f)| f.name.clone()))
            .collect();
        let mut verified = plain.clone();
        verified.extend(outputs.iter().map(|f| format!("{}_before", f.name)));
        for f in &outputs {
            verified.push(format!("{}_rel_err_tol", f.name));
            verified.push(format!("{}_abs_err_tol", f.name));
        }
        w.raw("#ifdef __DSL_VERIFY");
        call(w, &format!("run_and_verify_{}", name), &verified);
        w.raw("#else");
        call(w, &format!("run_{}", name), &plain);
        w.raw("#endif");
        if !device.is_empty() {
            w.line("!$ACC end host_data");
        }
        close_subroutine(w);
    }

    fn emit_wrap_setup(&self, w: &mut SourceWriter) {
        let name = self.c.name();
        let outputs = self.c.output_fields();
        let mut args = vec![
            ("mesh".to_string(), OBJ.to_string()),
            ("k_size".to_string(), INTEGER.to_string()),
            ("stream".to_string(), STREAM.to_string()),
        ];
        for f in &outputs {
            args.push((format!("{}_kmax", f.name), OPT_INTEGER.to_string()));
        }
        open_subroutine(w, &format!("wrap_setup_{}", name), &args, false);
        for f in &outputs {
            w.line(format!("integer(c_int) :: {}_kvert_max", f.name));
        }
        for f in &outputs {
            w.line(format!("if (present({}_kmax)) then", f.name));
            w.indent();
            w.line(format!("{n}_kvert_max = {n}_kmax", n = f.name));
            w.dedent();
            w.line("else");
            w.indent();
            w.line(format!("{}_kvert_max = k_size", f.name));
            w.dedent();
            w.line("endif");
        }
        let mut call_args = vec!["mesh".to_string(), "k_size".to_string(), "stream".to_string()];
        call_args.extend(outputs.iter().map(|f| format!("{}_kvert_max", f.name)));
        call(w, &format!("setup_{}", name), &call_args);
        close_subroutine(w);
    }
}

/// The Fortran interface module, named after the output file stem.
pub fn fortran_module(
    insts: &[StencilInstantiation],
    module: &str,
) -> Result<String, Diagnostic> {
    let apis = insts
        .iter()
        .map(FortranApi::new)
        .collect::<Result<Vec<_>, Diagnostic>>()?;

    let mut w = SourceWriter::with_unit("   ");
    w.raw("#define DEFAULT_RELATIVE_ERROR_THRESHOLD 1.0d-12");
    w.raw("#define DEFAULT_ABSOLUTE_ERROR_THRESHOLD 0.0d1");
    w.line(format!("module {}", module));
    w.line("use, intrinsic :: iso_c_binding");
    w.line("implicit none");
    w.indent();
    w.line("interface");
    w.indent();
    for api in &apis {
        api.emit_interfaces(&mut w);
    }
    w.dedent();
    w.line("end interface");
    w.dedent();
    w.line("contains");
    w.indent();
    for api in &apis {
        api.emit_wrap_run(&mut w);
        api.emit_wrap_setup(&mut w);
    }
    w.dedent();
    w.line(format!("end module {}", module));
    Ok(w.finish())
}
