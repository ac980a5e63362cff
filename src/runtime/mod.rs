//! Host-side emulation of a generated instantiation.
//!
//! [`StencilContext`] is the explicit counterpart of the generated stencil
//! class: it owns the mesh view, vertical size, stream handle and temporary
//! buffers between [`setup`](StencilContext::setup) and
//! [`free`](StencilContext::free), and runs every stage through the kernel
//! emulator in [`exec`]. Field buffers are in device layout; API fields are
//! supplied on every call, either copied ([`StencilContext::copy_memory`])
//! or aliased ([`StencilContext::copy_pointers`]).

pub mod exec;
pub mod verify;

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::codegen::host::{single_stencil, stencil_temporaries, ApiFields};
use crate::codegen::CodegenOptions;
use crate::diagnostic::Diagnostic;
use crate::ir::{
    FieldId, GlobalType, Horizontal, IterationSpace, LocationType, Stencil, StencilInstantiation,
};
use crate::iterspace;
use crate::layout::{self, FieldShape};
use crate::mesh::{GlobalMeshDescriptor, GpuTriMesh};

pub use exec::{Dim3, KernelLaunch};
pub use verify::{FieldReport, Tolerance, VerifyReport};

// ─── Values ───────────────────────────────────────────────────────

/// Value of a global scalar.
#[derive(Clone, Debug, PartialEq)]
pub enum GlobalValue {
    Boolean(bool),
    Integer(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl GlobalValue {
    pub fn ty(&self) -> GlobalType {
        match self {
            GlobalValue::Boolean(_) => GlobalType::Boolean,
            GlobalValue::Integer(_) => GlobalType::Integer,
            GlobalValue::Float(_) => GlobalType::Float,
            GlobalValue::Double(_) => GlobalType::Double,
            GlobalValue::String(_) => GlobalType::String,
        }
    }
}

/// A device buffer: owned after a copy, borrowed after pointer aliasing.
#[derive(Debug)]
pub enum FieldStorage<'a> {
    Owned(Vec<f64>),
    Aliased(&'a mut [f64]),
}

impl FieldStorage<'_> {
    pub fn as_slice(&self) -> &[f64] {
        match self {
            FieldStorage::Owned(v) => v,
            FieldStorage::Aliased(s) => s,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        match self {
            FieldStorage::Owned(v) => v,
            FieldStorage::Aliased(s) => s,
        }
    }
}

impl Deref for FieldStorage<'_> {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        self.as_slice()
    }
}

impl DerefMut for FieldStorage<'_> {
    fn deref_mut(&mut self) -> &mut [f64] {
        self.as_mut_slice()
    }
}

/// Device buffers of the API fields for one call.
#[derive(Debug, Default)]
pub struct DeviceFields<'a> {
    buffers: BTreeMap<FieldId, FieldStorage<'a>>,
}

impl<'a> DeviceFields<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: FieldId, storage: FieldStorage<'a>) {
        self.buffers.insert(id, storage);
    }

    pub fn get(&self, id: FieldId) -> Option<&[f64]> {
        self.buffers.get(&id).map(FieldStorage::as_slice)
    }

    pub fn get_mut(&mut self, id: FieldId) -> Option<&mut [f64]> {
        self.buffers.get_mut(&id).map(FieldStorage::as_mut_slice)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// A host container that knows its own element count, for the typed
/// [`StencilContext::copy_result_to_host_typed`].
pub trait HostField {
    fn num_elements(&self) -> usize;
    fn data_mut(&mut self) -> &mut [f64];
}

impl HostField for Vec<f64> {
    fn num_elements(&self) -> usize {
        self.len()
    }

    fn data_mut(&mut self) -> &mut [f64] {
        self.as_mut_slice()
    }
}

// ─── Context ──────────────────────────────────────────────────────

/// Everything that exists between setup and free.
#[derive(Debug)]
struct DeviceState {
    mesh: GpuTriMesh,
    k_size: usize,
    stream: u64,
    output_k_sizes: BTreeMap<FieldId, usize>,
    temporaries: BTreeMap<FieldId, Vec<f64>>,
}

/// Explicit per-instantiation state, driven like the generated class.
pub struct StencilContext<'ir> {
    inst: &'ir StencilInstantiation,
    stencil: &'ir Stencil,
    block_size: u32,
    levels_per_thread: u32,
    spaces: BTreeSet<IterationSpace>,
    state: Option<DeviceState>,
    globals: BTreeMap<String, GlobalValue>,
    serialize_dir: Option<PathBuf>,
    iteration: u32,
}

impl<'ir> StencilContext<'ir> {
    pub fn new(
        inst: &'ir StencilInstantiation,
        options: &CodegenOptions,
    ) -> Result<Self, Diagnostic> {
        options.validate()?;
        let stencil = single_stencil(inst)?;
        Ok(Self {
            inst,
            stencil,
            block_size: options.block_size,
            levels_per_thread: options.levels_per_thread,
            spaces: iterspace::instantiation_spaces(inst),
            state: None,
            globals: BTreeMap::new(),
            serialize_dir: None,
            iteration: 0,
        })
    }

    /// Dump failing dense fields into `dir` during verification.
    pub fn with_serialize_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.serialize_dir = Some(dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.inst.name
    }

    fn api(&self) -> ApiFields<'ir> {
        ApiFields::new(self.inst, self.stencil)
    }

    // ─── Lifecycle ────────────────────────────────────────────────

    /// Build the mesh view, store the sizes and allocate the temporaries.
    /// `output_k_sizes` holds one vertical size per output field, in API
    /// order. Calling setup again replaces the previous state.
    pub fn setup(
        &mut self,
        desc: &GlobalMeshDescriptor,
        k_size: usize,
        stream: u64,
        output_k_sizes: &[usize],
    ) -> Result<(), Diagnostic> {
        let outputs: Vec<FieldId> = self.api().outputs().collect();
        if outputs.len() != output_k_sizes.len() {
            return Err(Diagnostic::error(format!(
                "setup of '{}' needs {} output vertical size(s), got {}",
                self.inst.name,
                outputs.len(),
                output_k_sizes.len()
            ))
            .with_note(format!("outputs: {}", self.api().output_names().join(", "))));
        }
        let mesh = GpuTriMesh::from_global(desc, &self.spaces)?;
        let mut temporaries = BTreeMap::new();
        for id in stencil_temporaries(self.inst, self.stencil) {
            let shape = shape_of(self.inst, &mesh, id, k_size);
            temporaries.insert(id, vec![0.0; shape.len()]);
        }
        self.state = Some(DeviceState {
            mesh,
            k_size,
            stream,
            output_k_sizes: outputs.into_iter().zip(output_k_sizes.iter().copied()).collect(),
            temporaries,
        });
        Ok(())
    }

    /// Release the temporaries and the mesh view.
    pub fn free(&mut self) {
        self.state = None;
    }

    pub fn is_setup(&self) -> bool {
        self.state.is_some()
    }

    pub fn k_size(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.k_size)
    }

    pub fn mesh(&self) -> Option<&GpuTriMesh> {
        self.state.as_ref().map(|s| &s.mesh)
    }

    pub fn stream(&self) -> Option<u64> {
        self.state.as_ref().map(|s| s.stream)
    }

    /// Vertical size given at setup for an output field.
    pub fn output_k_size(&self, name: &str) -> Option<usize> {
        let state = self.state.as_ref()?;
        state
            .output_k_sizes
            .iter()
            .find(|(id, _)| self.inst.field_name(**id) == name)
            .map(|(_, k)| *k)
    }

    pub fn temporary(&self, name: &str) -> Option<&[f64]> {
        let state = self.state.as_ref()?;
        state
            .temporaries
            .iter()
            .find(|(id, _)| self.inst.field_name(**id) == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn set_global(&mut self, name: &str, value: GlobalValue) -> Result<(), Diagnostic> {
        let Some(declared) = self.inst.globals.get(name) else {
            return Err(Diagnostic::error(format!(
                "unknown global '{}' in '{}'",
                name, self.inst.name
            )));
        };
        if *declared != value.ty() {
            return Err(Diagnostic::error(format!(
                "global '{}' is {}, got a {} value",
                name,
                declared.cxx(),
                value.ty().cxx()
            )));
        }
        self.globals.insert(name.to_string(), value);
        Ok(())
    }

    /// Warning for a run without a prior setup.
    pub fn not_set_up(&self) -> Diagnostic {
        Diagnostic::warning(format!(
            "{} has not been set up! make sure setup() is called before run!",
            self.inst.name
        ))
        .with_help("call setup() first".to_string())
    }

    fn state(&self) -> Result<&DeviceState, Diagnostic> {
        self.state.as_ref().ok_or_else(|| {
            Diagnostic::error(format!("'{}' has not been set up", self.inst.name))
                .with_help("call setup() first".to_string())
        })
    }

    // ─── Transfers ────────────────────────────────────────────────

    /// Device shape of an API field at the setup vertical size.
    pub fn field_shape(&self, id: FieldId) -> Result<FieldShape, Diagnostic> {
        let state = self.state()?;
        Ok(shape_of(self.inst, &state.mesh, id, state.k_size))
    }

    /// Copy host buffers of every used API field (API order) to fresh device
    /// buffers, transposing to device layout when `reshape` is set.
    pub fn copy_memory(
        &self,
        host: &[&[f64]],
        reshape: bool,
    ) -> Result<DeviceFields<'static>, Diagnostic> {
        let used: Vec<FieldId> = self.api().used().collect();
        self.check_count("copy_memory", used.len(), host.len())?;
        let mut fields = DeviceFields::new();
        for (id, values) in used.into_iter().zip(host) {
            let shape = self.field_shape(id)?;
            let device = if reshape && !self.inst.field(id).dims.is_vertical_only() {
                layout::reshape(values, shape)?
            } else {
                self.check_len(id, shape, values.len())?;
                values.to_vec()
            };
            fields.insert(id, FieldStorage::Owned(device));
        }
        Ok(fields)
    }

    /// Alias device-resident buffers of every used API field (API order).
    pub fn copy_pointers<'a>(
        &self,
        device: Vec<&'a mut [f64]>,
    ) -> Result<DeviceFields<'a>, Diagnostic> {
        let used: Vec<FieldId> = self.api().used().collect();
        self.check_count("copy_pointers", used.len(), device.len())?;
        let mut fields = DeviceFields::new();
        for (id, buf) in used.into_iter().zip(device) {
            self.check_len(id, self.field_shape(id)?, buf.len())?;
            fields.insert(id, FieldStorage::Aliased(buf));
        }
        Ok(fields)
    }

    /// Copy every output field (API order) back to host buffers.
    pub fn copy_result_to_host(
        &self,
        fields: &DeviceFields<'_>,
        host: &mut [&mut [f64]],
        reshape: bool,
    ) -> Result<(), Diagnostic> {
        let outputs: Vec<FieldId> = self.api().outputs().collect();
        self.check_count("CopyResultToHost", outputs.len(), host.len())?;
        for (id, dst) in outputs.into_iter().zip(host.iter_mut()) {
            let shape = self.field_shape(id)?;
            let src = self.device_buffer(fields, id)?;
            if reshape && !self.inst.field(id).dims.is_vertical_only() {
                layout::reshape_back_into(src, dst, shape)?;
            } else {
                self.check_len(id, shape, src.len())?;
                self.check_len(id, shape, dst.len())?;
                dst.copy_from_slice(src);
            }
        }
        Ok(())
    }

    /// Like [`copy_result_to_host`](Self::copy_result_to_host), sized by
    /// each destination container instead of the mesh.
    pub fn copy_result_to_host_typed<H: HostField>(
        &self,
        fields: &DeviceFields<'_>,
        host: &mut [H],
        reshape: bool,
    ) -> Result<(), Diagnostic> {
        let outputs: Vec<FieldId> = self.api().outputs().collect();
        self.check_count("CopyResultToHost", outputs.len(), host.len())?;
        for (id, dst) in outputs.into_iter().zip(host.iter_mut()) {
            let count = dst.num_elements();
            let src = self.device_buffer(fields, id)?;
            if src.len() < count {
                return Err(Diagnostic::error(format!(
                    "host container for '{}' holds {} values, device buffer only {}",
                    self.inst.field_name(id),
                    count,
                    src.len()
                )));
            }
            if reshape && !self.inst.field(id).dims.is_vertical_only() {
                layout::reshape_back_into(&src[..count], dst.data_mut(), self.field_shape(id)?)?;
            } else {
                dst.data_mut()[..count].copy_from_slice(&src[..count]);
            }
        }
        Ok(())
    }

    fn device_buffer<'f>(
        &self,
        fields: &'f DeviceFields<'_>,
        id: FieldId,
    ) -> Result<&'f [f64], Diagnostic> {
        fields.get(id).ok_or_else(|| {
            Diagnostic::error(format!(
                "field '{}' has no device buffer",
                self.inst.field_name(id)
            ))
        })
    }

    fn check_count(&self, what: &str, expected: usize, got: usize) -> Result<(), Diagnostic> {
        if expected != got {
            return Err(Diagnostic::error(format!(
                "{} of '{}' takes {} field(s), got {}",
                what, self.inst.name, expected, got
            )));
        }
        Ok(())
    }

    fn check_len(&self, id: FieldId, shape: FieldShape, len: usize) -> Result<(), Diagnostic> {
        if len != shape.len() {
            return Err(Diagnostic::error(format!(
                "buffer of '{}' has {} values, expected {}",
                self.inst.field_name(id),
                len,
                shape.len()
            )));
        }
        Ok(())
    }

    // ─── Execution ────────────────────────────────────────────────

    /// Launch every stage in program order. Before setup this renders
    /// [`not_set_up`](Self::not_set_up) and does nothing.
    pub fn run(&mut self, fields: &mut DeviceFields<'_>) -> Result<Vec<KernelLaunch>, Diagnostic> {
        let Some(state) = self.state.as_mut() else {
            self.not_set_up().render(&self.inst.name, "");
            return Ok(Vec::new());
        };
        let DeviceState {
            mesh,
            k_size,
            temporaries,
            ..
        } = state;

        let mut buffers: exec::Buffers<'_> = BTreeMap::new();
        for (id, storage) in fields.buffers.iter_mut() {
            buffers.insert(*id, storage.as_mut_slice());
        }
        for (id, tmp) in temporaries.iter_mut() {
            buffers.insert(*id, tmp.as_mut_slice());
        }

        let device = exec::Device {
            inst: self.inst,
            mesh,
            globals: &self.globals,
            k_size: *k_size,
            block_size: self.block_size,
            levels_per_thread: self.levels_per_thread,
        };
        let mut launches = Vec::new();
        for (ms, stage) in self.stencil.stages() {
            if let Some(launch) = device.launch(ms, stage, &mut buffers)? {
                launches.push(launch);
            }
        }
        Ok(launches)
    }

    // ─── Verification ─────────────────────────────────────────────

    /// Compare every output field (API order) of `dsl` against `reference`.
    /// `tolerances` holds one entry per output; empty means the defaults.
    pub fn verify(
        &self,
        dsl: &[&[f64]],
        reference: &[&[f64]],
        tolerances: &[Tolerance],
        iteration: u32,
    ) -> Result<VerifyReport, Diagnostic> {
        let start = Instant::now();
        let state = self.state()?;
        let outputs: Vec<FieldId> = self.api().outputs().collect();
        self.check_count("verify", outputs.len(), dsl.len())?;
        self.check_count("verify", outputs.len(), reference.len())?;
        if !tolerances.is_empty() {
            self.check_count("verify", outputs.len(), tolerances.len())?;
        }

        let mut reports = Vec::with_capacity(outputs.len());
        for (i, id) in outputs.iter().enumerate() {
            let field = self.inst.field(*id);
            let k = state.output_k_sizes.get(id).copied().unwrap_or(state.k_size);
            let count = shape_of(self.inst, &state.mesh, *id, k).len();
            let (actual, expected) = (dsl[i], reference[i]);
            if actual.len() < count || expected.len() < count {
                return Err(Diagnostic::error(format!(
                    "verification of '{}' needs {} values, got {} and {}",
                    field.name,
                    count,
                    actual.len(),
                    expected.len()
                )));
            }
            let tol = tolerances.get(i).copied().unwrap_or_default();
            let report =
                FieldReport::compare(&field.name, &actual[..count], &expected[..count], tol);
            if !report.passed() {
                eprintln!("[DSL] {}", report.summary());
                if let Some(dir) = &self.serialize_dir {
                    self.serialize_failure(dir, state, *id, k, actual, expected, iteration)?;
                }
            }
            reports.push(report);
        }
        let elapsed = start.elapsed();
        eprintln!("[DSL] Verification took {} seconds.", elapsed.as_secs_f64());
        Ok(VerifyReport {
            fields: reports,
            elapsed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn serialize_failure(
        &self,
        dir: &Path,
        state: &DeviceState,
        id: FieldId,
        k_size: usize,
        dsl: &[f64],
        reference: &[f64],
        iteration: u32,
    ) -> Result<(), Diagnostic> {
        let field = self.inst.field(id);
        match &field.dims.horizontal {
            Some(Horizontal::Dense(loc)) => {
                let levels = if field.dims.vertical { k_size } else { 1 };
                let stride = state.mesh.stride(*loc);
                let header = verify::DumpHeader {
                    magic: verify::DUMP_MAGIC,
                    iteration,
                    k_size: levels as u32,
                    num_elements: state.mesh.num_elements(*loc) as u32,
                    stride: stride as u32,
                };
                let count = levels * stride;
                let name = &self.inst.name;
                verify::serialize_dense(dir, name, &field.name, header, &reference[..count])?;
                let tag = format!("{}_dsl", field.name);
                verify::serialize_dense(dir, name, &tag, header, &dsl[..count])?;
                eprintln!("[DSL] serializing {} as error is high.", field.name);
            }
            Some(Horizontal::Sparse(_)) => eprintln!(
                "[DSL] can not serialize sparse field {}, error is high.",
                field.name
            ),
            None => eprintln!(
                "[DSL] can not serialize vertical field {}, error is high.",
                field.name
            ),
        }
        Ok(())
    }

    /// Run into the `before` snapshots of the output fields and verify them
    /// against the reference outputs held in `fields`. Inputs are read from
    /// `fields`. The iteration counter persists across calls.
    pub fn run_and_verify(
        &mut self,
        fields: &DeviceFields<'_>,
        before: Vec<&mut [f64]>,
        tolerances: &[Tolerance],
    ) -> Result<VerifyReport, Diagnostic> {
        let outputs: Vec<FieldId> = self.api().outputs().collect();
        self.check_count("run_and_verify", outputs.len(), before.len())?;
        eprintln!(
            "[DSL] Running stencil {} ({}) ...",
            self.inst.name, self.iteration
        );

        let mut run_set = DeviceFields::new();
        for id in self.api().used() {
            if !outputs.contains(&id) {
                let input = self.device_buffer(fields, id)?;
                run_set.insert(id, FieldStorage::Owned(input.to_vec()));
            }
        }
        for (id, buf) in outputs.iter().zip(before) {
            run_set.insert(*id, FieldStorage::Aliased(buf));
        }

        let start = Instant::now();
        self.run(&mut run_set)?;
        eprintln!(
            "[DSL] {} run time: {}s",
            self.inst.name,
            start.elapsed().as_secs_f64()
        );

        eprintln!("[DSL] Verifying stencil {}...", self.inst.name);
        let mut dsl = Vec::with_capacity(outputs.len());
        let mut reference = Vec::with_capacity(outputs.len());
        for id in &outputs {
            dsl.push(self.device_buffer(&run_set, *id)?);
            reference.push(self.device_buffer(fields, *id)?);
        }
        let report = self.verify(&dsl, &reference, tolerances, self.iteration)?;
        self.iteration += 1;
        Ok(report)
    }
}

/// Device shape of a field over `mesh` at vertical size `k_size`.
fn shape_of(
    inst: &StencilInstantiation,
    mesh: &GpuTriMesh,
    id: FieldId,
    k_size: usize,
) -> FieldShape {
    let dims = &inst.field(id).dims;
    let loc = dims
        .horizontal
        .as_ref()
        .and_then(Horizontal::dense_location)
        .unwrap_or(LocationType::Cells);
    FieldShape::of(dims, mesh.stride(loc), k_size)
}
