//! icogen: CUDA backend for stencil programs on unstructured
//! (icosahedral) meshes, plus a host-side emulator of the generated code.
//!
//! ```text
//! ir ──► iterspace ──► codegen ──► .cu / .h / .f90
//!  │                      │
//!  └──► mesh ──► layout ──┴──► runtime (emulated device)
//! ```

pub mod codegen;
pub mod diagnostic;
pub mod ir;
pub mod iterspace;
pub mod layout;
pub mod mesh;
pub mod runtime;

pub use codegen::{generate, CodegenOptions};
pub use diagnostic::Diagnostic;
pub use ir::StencilInstantiation;
pub use runtime::StencilContext;
