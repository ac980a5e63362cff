//! Kernel parameter assembly.
//!
//! [`stage_signature`] is the only place that decides which parameters a
//! stage kernel takes and in what order. The kernel definition renders
//! `ty name` pairs from it, the launch in `run()` renders the matching
//! host-side arguments from the same list, and the emulated runtime binds
//! its buffers by walking it as well.

use std::collections::BTreeSet;

use crate::ir::{
    Horizontal, Intent, IterationSpace, LocationType, MultiStage, Stage, StageField,
    StencilInstantiation,
};
use crate::iterspace;

/// Scalar type of every field element on the device.
pub const FLOAT_TYPE: &str = "::dawn::float_type";

#[derive(Clone, Debug, PartialEq)]
pub enum ParamKind {
    /// The `globals` struct, present when the instantiation has globals.
    Globals,
    /// Element stride of one kind; the first one is the stage's own kind.
    Size(LocationType),
    KSize,
    /// Only for sub-domain restricted stages.
    HorizontalOffset,
    HorizontalSize,
    Table(IterationSpace),
    Field(StageField),
}

#[derive(Clone, Debug, PartialEq)]
pub struct KernelParam {
    pub kind: ParamKind,
    pub ty: String,
    pub name: String,
    /// Host-side expression passed at the launch site.
    pub arg: String,
}

impl KernelParam {
    pub fn decl(&self) -> String {
        if self.ty.ends_with('*') {
            format!("{}{}", self.ty, self.name)
        } else {
            format!("{} {}", self.ty, self.name)
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageSignature {
    pub kernel_name: String,
    /// One compile-time size per distinct iteration space.
    pub spaces: Vec<IterationSpace>,
    pub params: Vec<KernelParam>,
}

impl StageSignature {
    /// `template<int CE_SIZE, int CEC_SIZE>`, if the stage iterates neighbors.
    pub fn template_decl(&self) -> Option<String> {
        if self.spaces.is_empty() {
            return None;
        }
        let ints: Vec<String> = self
            .spaces
            .iter()
            .map(|s| format!("int {}", s.size_name()))
            .collect();
        Some(format!("template<{}>", ints.join(", ")))
    }

    /// `<CE_SIZE, CEC_SIZE>` or empty.
    pub fn template_args(&self) -> String {
        if self.spaces.is_empty() {
            return String::new();
        }
        let names: Vec<String> = self.spaces.iter().map(|s| s.size_name()).collect();
        format!("<{}>", names.join(", "))
    }

    pub fn param_list(&self) -> String {
        let decls: Vec<String> = self.params.iter().map(|p| p.decl()).collect();
        decls.join(", ")
    }

    pub fn arg_list(&self) -> String {
        let args: Vec<&str> = self.params.iter().map(|p| p.arg.as_str()).collect();
        args.join(", ")
    }

    pub fn param_names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }
}

pub fn kernel_name(inst: &StencilInstantiation, ms: &MultiStage, stage: &Stage) -> String {
    format!("{}_ms{}_s{}_kernel", inst.name, ms.id, stage.id)
}

/// Element kinds, other than the stage's own, whose strides the kernel
/// needs: dense kinds of its fields plus origin kinds of its chains.
pub fn extra_size_locations(
    inst: &StencilInstantiation,
    stage: &Stage,
    spaces: &BTreeSet<IterationSpace>,
) -> BTreeSet<LocationType> {
    let mut locs = BTreeSet::new();
    for f in &stage.fields {
        if let Some(loc) = inst
            .field(f.field)
            .dims
            .horizontal
            .as_ref()
            .and_then(Horizontal::dense_location)
        {
            locs.insert(loc);
        }
    }
    for space in spaces {
        if let Some(origin) = space.origin() {
            locs.insert(origin);
        }
    }
    locs.remove(&stage.location);
    locs
}

pub fn stage_signature(
    inst: &StencilInstantiation,
    ms: &MultiStage,
    stage: &Stage,
) -> StageSignature {
    let spaces = iterspace::stage_spaces(stage);
    let mut params = Vec::new();

    if !inst.globals.is_empty() {
        params.push(KernelParam {
            kind: ParamKind::Globals,
            ty: "globals".to_string(),
            name: "globals".to_string(),
            arg: "m_globals".to_string(),
        });
    }

    let mut sizes = vec![stage.location];
    sizes.extend(extra_size_locations(inst, stage, &spaces));
    for loc in sizes {
        params.push(KernelParam {
            kind: ParamKind::Size(loc),
            ty: "int".to_string(),
            name: loc.count_name().to_string(),
            arg: format!("mesh_.{}", loc.stride_name()),
        });
    }

    params.push(KernelParam {
        kind: ParamKind::KSize,
        ty: "int".to_string(),
        name: "kSize".to_string(),
        arg: "kSize_".to_string(),
    });
    if stage.is_restricted() {
        params.push(KernelParam {
            kind: ParamKind::HorizontalOffset,
            ty: "int".to_string(),
            name: "hOffset".to_string(),
            arg: format!("hoffset{}", stage.id),
        });
    }
    params.push(KernelParam {
        kind: ParamKind::HorizontalSize,
        ty: "int".to_string(),
        name: "hSize".to_string(),
        arg: format!("hsize{}", stage.id),
    });

    for space in &spaces {
        params.push(KernelParam {
            kind: ParamKind::Table(space.clone()),
            ty: "const int *".to_string(),
            name: space.table_name(),
            arg: format!("mesh_.{}", space.table_name()),
        });
    }

    for f in stage.ordered_fields() {
        let name = inst.field_name(f.field).to_string();
        let ty = if f.intent == Intent::Input {
            format!("const {} * __restrict__", FLOAT_TYPE)
        } else {
            format!("{} * __restrict__", FLOAT_TYPE)
        };
        params.push(KernelParam {
            kind: ParamKind::Field(f),
            ty,
            arg: format!("{}_", name),
            name,
        });
    }

    StageSignature {
        kernel_name: kernel_name(inst, ms, stage),
        spaces: spaces.into_iter().collect(),
        params,
    }
}
