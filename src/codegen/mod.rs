//! CUDA backend for unstructured-mesh stencil instantiations.
//!
//! One translation unit holds, per instantiation: the stage kernels, the
//! wrapper class with its host orchestration, the `extern "C"` entry points
//! and the static member definitions. A C header and a Fortran interface
//! module are produced on request.

pub mod body;
pub mod host;
pub mod interface;
pub mod kernel;
pub mod options;
pub mod params;
pub mod writer;

pub use options::CodegenOptions;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::diagnostic::Diagnostic;
use crate::ir::{GlobalType, StencilInstantiation};

use interface::ApiMode;
use writer::SourceWriter;

const DRIVER_INCLUDES: [&str; 6] = [
    "unstructured_interface.hpp",
    "unstructured_domain.hpp",
    "defs.hpp",
    "cuda_utils.hpp",
    "cuda_verify.hpp",
    "to_vtk.h",
];

/// Generated sources, not yet written anywhere.
#[derive(Clone, Debug, PartialEq)]
pub struct Artifacts {
    pub translation_unit: String,
    pub c_header: Option<String>,
    pub fortran_interface: Option<String>,
}

/// Generate every artifact `options` asks for.
pub fn generate(
    insts: &[StencilInstantiation],
    options: &CodegenOptions,
) -> Result<Artifacts, Diagnostic> {
    options.validate()?;
    let translation_unit = translation_unit(insts, options)?;
    let c_header = match options.output_c_header {
        Some(_) => Some(interface::c_header(insts)?),
        None => None,
    };
    let fortran_interface = match &options.output_fortran_interface {
        Some(path) => Some(interface::fortran_module(insts, &module_name(path))?),
        None => None,
    };
    Ok(Artifacts {
        translation_unit,
        c_header,
        fortran_interface,
    })
}

/// Fortran module name: the output file stem.
pub fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "icogen_interface".to_string())
}

pub fn translation_unit(
    insts: &[StencilInstantiation],
    options: &CodegenOptions,
) -> Result<String, Diagnostic> {
    let globals = merged_globals(insts)?;
    let mut w = SourceWriter::new();
    for header in DRIVER_INCLUDES {
        w.raw(format!("#include \"driver-includes/{}\"", header));
    }
    w.raw("#define GRIDTOOLS_DAWN_NO_INCLUDE");
    w.raw("#include \"driver-includes/math.hpp\"");
    w.raw("#include <chrono>");
    w.raw("#include <iostream>");
    w.raw(format!("#define BLOCK_SIZE {}", options.block_size));
    w.raw(format!("#define LEVELS_PER_THREAD {}", options.levels_per_thread));
    w.line("using namespace gridtools::dawn;");

    if !globals.is_empty() {
        w.line("");
        open_namespaces(&mut w);
        host::emit_globals_struct(&mut w, &globals);
        close_namespaces(&mut w);
    }

    for inst in insts {
        w.line("");
        open_namespaces(&mut w);
        kernel::emit_kernels(&mut w, inst)?;
        host::emit_wrapper_class(&mut w, inst)?;
        close_namespaces(&mut w);
        interface::emit_c_api(&mut w, inst, ApiMode::Definition)?;
        host::emit_static_trailer(&mut w, inst)?;
    }
    Ok(w.finish())
}

fn open_namespaces(w: &mut SourceWriter) {
    w.line("namespace dawn_generated {");
    w.line("namespace cuda_ico {");
}

fn close_namespaces(w: &mut SourceWriter) {
    w.line("} // namespace cuda_ico");
    w.line("} // namespace dawn_generated");
}

/// All instantiations of a unit share one `struct globals`.
fn merged_globals(
    insts: &[StencilInstantiation],
) -> Result<BTreeMap<String, GlobalType>, Diagnostic> {
    let mut merged: BTreeMap<String, GlobalType> = BTreeMap::new();
    for inst in insts {
        for (name, ty) in &inst.globals {
            match merged.get(name) {
                Some(prev) if prev != ty => {
                    return Err(Diagnostic::error(format!(
                        "global '{}' is {} in '{}' but {} elsewhere",
                        name,
                        ty.cxx(),
                        inst.name,
                        prev.cxx()
                    )))
                }
                _ => {
                    merged.insert(name.clone(), *ty);
                }
            }
        }
    }
    Ok(merged)
}

// ─── Writing ──────────────────────────────────────────────────────

/// Write `content` unless the file already holds the same bytes (compared
/// by BLAKE3 digest). Returns whether the file was written.
pub fn write_if_changed(path: &Path, content: &str) -> Result<bool, Diagnostic> {
    if let Ok(existing) = std::fs::read(path) {
        if blake3::hash(&existing) == blake3::hash(content.as_bytes()) {
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Diagnostic::write_failed(parent, &e))?;
    }
    std::fs::write(path, content).map_err(|e| Diagnostic::write_failed(path, &e))?;
    Ok(true)
}

/// Write the translation unit to `unit_path` and the optional artifacts to
/// the paths in `options`. Returns `(path, written)` per artifact.
pub fn write_artifacts(
    artifacts: &Artifacts,
    unit_path: &Path,
    options: &CodegenOptions,
) -> Result<Vec<(PathBuf, bool)>, Diagnostic> {
    let mut outputs = vec![(
        unit_path.to_path_buf(),
        write_if_changed(unit_path, &artifacts.translation_unit)?,
    )];
    let extra = [
        (&options.output_c_header, &artifacts.c_header),
        (
            &options.output_fortran_interface,
            &artifacts.fortran_interface,
        ),
    ];
    for (path, content) in extra {
        if let (Some(path), Some(content)) = (path, content) {
            outputs.push((path.clone(), write_if_changed(path, content)?));
        }
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::*;
    use crate::ir::{FieldDims, Interval, LocationType, LoopOrder};

    fn scale(name: &str, ty: GlobalType) -> StencilInstantiation {
        let mut b = InstantiationBuilder::new(name);
        let input = b.api_field("in", FieldDims::dense(LocationType::Edges));
        let out = b.api_field("out", FieldDims::dense(LocationType::Edges));
        b.global("alpha", ty);
        b.multistage(
            LoopOrder::Parallel,
            vec![StageBuilder::new(LocationType::Edges).do_method(
                Interval::full(),
                vec![store(out, mul(global("alpha"), at(input)))],
            )],
        );
        b.build()
    }

    #[test]
    fn test_translation_unit_layout() {
        let opts = CodegenOptions {
            block_size: 64,
            levels_per_thread: 4,
            ..CodegenOptions::default()
        };
        let tu = translation_unit(&[scale("scale", GlobalType::Double)], &opts).unwrap();
        assert!(tu.starts_with("#include \"driver-includes/unstructured_interface.hpp\"\n"));
        assert!(tu.contains("#define BLOCK_SIZE 64\n#define LEVELS_PER_THREAD 4\n"));
        assert_eq!(tu.matches("struct globals {").count(), 1);

        let kernel = tu.find("__global__ void scale_ms0_s0_kernel").unwrap();
        let class = tu.find("class scale {").unwrap();
        let api = tu.find("extern \"C\" {").unwrap();
        let trailer = tu
            .find("bool dawn_generated::cuda_ico::scale::stencil_0::is_setup_ = false;")
            .unwrap();
        assert!(kernel < class && class < api && api < trailer);
    }

    #[test]
    fn test_two_instantiations_share_globals() {
        let insts = [
            scale("first", GlobalType::Double),
            scale("second", GlobalType::Double),
        ];
        let tu = translation_unit(&insts, &CodegenOptions::default()).unwrap();
        assert_eq!(tu.matches("struct globals {").count(), 1);
        assert!(tu.contains("class first {"));
        assert!(tu.contains("class second {"));

        let clash = [
            scale("first", GlobalType::Double),
            scale("second", GlobalType::Integer),
        ];
        let err = translation_unit(&clash, &CodegenOptions::default()).unwrap_err();
        assert!(err.message.contains("global 'alpha'"));
    }

    #[test]
    fn test_generate_optional_artifacts() {
        let inst = scale("scale", GlobalType::Double);
        let plain = generate(std::slice::from_ref(&inst), &CodegenOptions::default()).unwrap();
        assert!(plain.c_header.is_none());
        assert!(plain.fortran_interface.is_none());

        let opts = CodegenOptions {
            output_c_header: Some(PathBuf::from("out/scale.h")),
            output_fortran_interface: Some(PathBuf::from("out/scale_iface.f90")),
            ..CodegenOptions::default()
        };
        let full = generate(&[inst], &opts).unwrap();
        assert!(full.c_header.unwrap().contains("void setup_scale("));
        assert!(full
            .fortran_interface
            .unwrap()
            .contains("module scale_iface\n"));
    }

    #[test]
    fn test_write_if_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.cu");
        assert!(write_if_changed(&path, "a").unwrap());
        assert!(!write_if_changed(&path, "a").unwrap());
        assert!(write_if_changed(&path, "b").unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "b");
    }

    #[test]
    fn test_write_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let opts = CodegenOptions {
            output_c_header: Some(dir.path().join("scale.h")),
            ..CodegenOptions::default()
        };
        let artifacts = generate(&[scale("scale", GlobalType::Double)], &opts).unwrap();
        let unit = dir.path().join("scale.cu");
        let written = write_artifacts(&artifacts, &unit, &opts).unwrap();
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|(_, w)| *w));
        let again = write_artifacts(&artifacts, &unit, &opts).unwrap();
        assert!(again.iter().all(|(_, w)| !*w));
    }

    #[test]
    fn test_write_failure_is_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let err = write_if_changed(&blocker.join("out.cu"), "a").unwrap_err();
        assert!(err.message.starts_with("cannot write '"));
    }
}
