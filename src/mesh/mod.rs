//! Mesh layout model.
//!
//! [`GlobalMeshDescriptor`] is what a host program hands to `setup`: element
//! counts, strides, horizontal sub-domain boundaries and every neighbor table
//! it has uploaded. [`GpuTriMesh`] is the per-instantiation view copied out
//! of it, holding exactly the tables the instantiation's kernels reference.

pub mod table;
pub mod trimesh;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::diagnostic::Diagnostic;
use crate::ir::{IterationSpace, LocationType};

pub use table::{chain_neighbors, MeshTopology, NeighborTable, DEVICE_MISSING_VALUE};
pub use trimesh::TriMesh;

// ─── Horizontal sub-domains ───────────────────────────────────────

/// Named slice of one element kind's index range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subdomain {
    LateralBoundary,
    Nudging,
    Interior,
    Halo,
    End,
}

impl Subdomain {
    pub const ALL: [Subdomain; 5] = [
        Subdomain::LateralBoundary,
        Subdomain::Nudging,
        Subdomain::Interior,
        Subdomain::Halo,
        Subdomain::End,
    ];

    /// Fixed numeric code stored in the IR.
    pub fn code(self) -> i32 {
        match self {
            Subdomain::LateralBoundary => 0,
            Subdomain::Nudging => 1000,
            Subdomain::Interior => 2000,
            Subdomain::Halo => 3000,
            Subdomain::End => 4000,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, Diagnostic> {
        Subdomain::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .ok_or_else(|| {
                Diagnostic::error(format!("unknown horizontal subdomain code {}", code))
                    .with_help("valid codes are 0, 1000, 2000, 3000 and 4000".to_string())
            })
    }

    /// C++ enumerator name.
    pub fn cxx(self) -> &'static str {
        match self {
            Subdomain::LateralBoundary => "dawn::UnstructuredSubdomain::LateralBoundary",
            Subdomain::Nudging => "dawn::UnstructuredSubdomain::Nudging",
            Subdomain::Interior => "dawn::UnstructuredSubdomain::Interior",
            Subdomain::Halo => "dawn::UnstructuredSubdomain::Halo",
            Subdomain::End => "dawn::UnstructuredSubdomain::End",
        }
    }
}

impl fmt::Display for Subdomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subdomain::LateralBoundary => "LateralBoundary",
            Subdomain::Nudging => "Nudging",
            Subdomain::Interior => "Interior",
            Subdomain::Halo => "Halo",
            Subdomain::End => "End",
        };
        f.write_str(name)
    }
}

/// Boundary lookup: `(kind, subdomain, offset)` → absolute element index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HorizontalDomain {
    splitters: HashMap<(LocationType, Subdomain, i32), usize>,
}

impl HorizontalDomain {
    pub fn set_splitter_index(
        &mut self,
        loc: LocationType,
        subdomain: Subdomain,
        offset: i32,
        index: usize,
    ) {
        self.splitters.insert((loc, subdomain, offset), index);
    }

    pub fn index(
        &self,
        loc: LocationType,
        subdomain: Subdomain,
        offset: i32,
    ) -> Result<usize, Diagnostic> {
        self.splitters
            .get(&(loc, subdomain, offset))
            .copied()
            .ok_or_else(|| {
                Diagnostic::error(format!(
                    "no splitter index for ({}, {}, {})",
                    loc, subdomain, offset
                ))
            })
    }
}

// ─── Per-kind storage helper ──────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PerLocation<T> {
    cells: T,
    edges: T,
    vertices: T,
}

impl<T: Copy> PerLocation<T> {
    fn get(&self, loc: LocationType) -> T {
        match loc {
            LocationType::Cells => self.cells,
            LocationType::Edges => self.edges,
            LocationType::Vertices => self.vertices,
        }
    }

    fn set(&mut self, loc: LocationType, value: T) {
        match loc {
            LocationType::Cells => self.cells = value,
            LocationType::Edges => self.edges = value,
            LocationType::Vertices => self.vertices = value,
        }
    }
}

// ─── Global descriptor ────────────────────────────────────────────

/// Mesh description owned by the host program.
#[derive(Clone, Debug, Default)]
pub struct GlobalMeshDescriptor {
    counts: PerLocation<usize>,
    strides: PerLocation<usize>,
    pub horizontal_domain: HorizontalDomain,
    neighbor_tables: HashMap<IterationSpace, Arc<NeighborTable>>,
}

impl GlobalMeshDescriptor {
    /// Counts from the topology, strides equal to counts, and the trivial
    /// splitters `LateralBoundary+0 = 0` and `End+0 = count` per kind.
    pub fn from_topology(topo: &dyn MeshTopology) -> Self {
        let mut desc = Self::default();
        for loc in LocationType::ALL {
            let n = topo.count(loc);
            desc.counts.set(loc, n);
            desc.strides.set(loc, n);
            desc.horizontal_domain
                .set_splitter_index(loc, Subdomain::LateralBoundary, 0, 0);
            desc.horizontal_domain
                .set_splitter_index(loc, Subdomain::End, 0, n);
        }
        desc
    }

    pub fn num_elements(&self, loc: LocationType) -> usize {
        self.counts.get(loc)
    }

    pub fn stride(&self, loc: LocationType) -> usize {
        self.strides.get(loc)
    }

    /// Pad a kind's stride (allocation rows) beyond its element count.
    pub fn set_stride(&mut self, loc: LocationType, stride: usize) -> Result<(), Diagnostic> {
        if stride < self.counts.get(loc) {
            return Err(Diagnostic::error(format!(
                "stride {} of {} is smaller than the element count {}",
                stride,
                loc,
                self.counts.get(loc)
            )));
        }
        self.strides.set(loc, stride);
        Ok(())
    }

    pub fn set_splitter_index(
        &mut self,
        loc: LocationType,
        subdomain: Subdomain,
        offset: i32,
        index: usize,
    ) {
        self.horizontal_domain
            .set_splitter_index(loc, subdomain, offset, index);
    }

    pub fn insert_table(&mut self, table: NeighborTable) {
        self.neighbor_tables
            .insert(table.space().clone(), Arc::new(table));
    }

    /// Build and insert one table per space, each padded to the stride of
    /// the chain's origin kind.
    pub fn build_tables<'s>(
        &mut self,
        topo: &dyn MeshTopology,
        spaces: impl IntoIterator<Item = &'s IterationSpace>,
    ) -> Result<(), Diagnostic> {
        for space in spaces {
            let rows = match space.origin() {
                Some(origin) => self.stride(origin),
                None => 0,
            };
            let table = NeighborTable::build_padded(topo, space, rows)?;
            self.insert_table(table);
        }
        Ok(())
    }

    pub fn table(&self, space: &IterationSpace) -> Option<&Arc<NeighborTable>> {
        self.neighbor_tables.get(space)
    }
}

// ─── Per-instantiation mesh ───────────────────────────────────────

/// The mesh as seen by one instantiation's kernels.
#[derive(Clone, Debug, Default)]
pub struct GpuTriMesh {
    counts: PerLocation<usize>,
    strides: PerLocation<usize>,
    horizontal_domain: HorizontalDomain,
    tables: BTreeMap<IterationSpace, Arc<NeighborTable>>,
}

impl GpuTriMesh {
    /// Copy counts, strides and the domain, and look up every required table
    /// by its `(chain, include_center)` key.
    pub fn from_global(
        desc: &GlobalMeshDescriptor,
        spaces: &BTreeSet<IterationSpace>,
    ) -> Result<Self, Diagnostic> {
        let mut tables = BTreeMap::new();
        for space in spaces {
            let table = desc.table(space).ok_or_else(|| {
                Diagnostic::error(format!(
                    "neighbor table for '{}' is missing from the mesh descriptor",
                    space
                ))
                .with_help(format!("upload a '{}' table before setup", space.table_name()))
            })?;
            let origin = space.origin().unwrap_or(LocationType::Cells);
            if table.num_elements() != desc.stride(origin) || table.slots() != space.table_size()
            {
                return Err(Diagnostic::error(format!(
                    "neighbor table for '{}' has shape [{}][{}], expected [{}][{}]",
                    space,
                    table.slots(),
                    table.num_elements(),
                    space.table_size(),
                    desc.stride(origin)
                )));
            }
            tables.insert(space.clone(), Arc::clone(table));
        }
        Ok(Self {
            counts: desc.counts,
            strides: desc.strides,
            horizontal_domain: desc.horizontal_domain.clone(),
            tables,
        })
    }

    pub fn num_elements(&self, loc: LocationType) -> usize {
        self.counts.get(loc)
    }

    pub fn stride(&self, loc: LocationType) -> usize {
        self.strides.get(loc)
    }

    pub fn table(&self, space: &IterationSpace) -> Option<&NeighborTable> {
        self.tables.get(space).map(|t| t.as_ref())
    }

    pub fn spaces(&self) -> impl Iterator<Item = &IterationSpace> {
        self.tables.keys()
    }

    /// Resolve a raw subdomain code plus offset to an element index.
    pub fn horizontal_index(
        &self,
        loc: LocationType,
        code: i32,
        offset: i32,
    ) -> Result<usize, Diagnostic> {
        let subdomain = Subdomain::from_code(code)?;
        self.horizontal_domain.index(loc, subdomain, offset)
    }
}

#[cfg(test)]
mod tests;
