//! Periodic structured triangle mesh.
//!
//! An `nx × ny` grid of vertices on a torus. Each grid quad is split into a
//! lower triangle T0 and an upper triangle T1, and each vertex owns three
//! edges (horizontal, vertical, diagonal):
//!
//! ```text
//!   v(i,j+1) ── h(i,j+1) ── v(i+1,j+1)
//!      │  ╲         T1          │
//!   e(i,j)   d(i,j)        e(i+1,j)
//!      │    T0       ╲          │
//!   v(i,j) ──── h(i,j) ──── v(i+1,j)
//! ```
//!
//! Interior vertices have six edges and six cells, matching an icosahedral
//! grid away from its pentagon points.

use crate::diagnostic::Diagnostic;
use crate::ir::LocationType;

use super::table::MeshTopology;

#[derive(Clone, Debug)]
pub struct TriMesh {
    nx: usize,
    ny: usize,
    cell_vertices: Vec<[usize; 3]>,
    cell_edges: Vec<[usize; 3]>,
    edge_vertices: Vec<[usize; 2]>,
    edge_cells: Vec<[usize; 2]>,
    vertex_edges: Vec<[usize; 6]>,
    vertex_cells: Vec<[usize; 6]>,
}

impl TriMesh {
    /// Both extents must be at least 2 so that no element is adjacent to
    /// itself across the periodic seam.
    pub fn new(nx: usize, ny: usize) -> Result<Self, Diagnostic> {
        if nx < 2 || ny < 2 {
            return Err(Diagnostic::error(format!(
                "triangle mesh needs at least 2x2 vertices, got {}x{}",
                nx, ny
            )));
        }
        let mut mesh = Self {
            nx,
            ny,
            cell_vertices: Vec::with_capacity(2 * nx * ny),
            cell_edges: Vec::with_capacity(2 * nx * ny),
            edge_vertices: Vec::with_capacity(3 * nx * ny),
            edge_cells: Vec::with_capacity(3 * nx * ny),
            vertex_edges: Vec::with_capacity(nx * ny),
            vertex_cells: Vec::with_capacity(nx * ny),
        };
        mesh.connect();
        Ok(mesh)
    }

    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn ny(&self) -> usize {
        self.ny
    }

    fn wrap(&self, i: isize, j: isize) -> (usize, usize) {
        let nx = self.nx as isize;
        let ny = self.ny as isize;
        (i.rem_euclid(nx) as usize, j.rem_euclid(ny) as usize)
    }

    fn v(&self, i: isize, j: isize) -> usize {
        let (i, j) = self.wrap(i, j);
        j * self.nx + i
    }

    fn t0(&self, i: isize, j: isize) -> usize {
        2 * self.v(i, j)
    }

    fn t1(&self, i: isize, j: isize) -> usize {
        2 * self.v(i, j) + 1
    }

    fn h(&self, i: isize, j: isize) -> usize {
        3 * self.v(i, j)
    }

    fn e(&self, i: isize, j: isize) -> usize {
        3 * self.v(i, j) + 1
    }

    fn d(&self, i: isize, j: isize) -> usize {
        3 * self.v(i, j) + 2
    }

    fn connect(&mut self) {
        for j in 0..self.ny as isize {
            for i in 0..self.nx as isize {
                // cells T0(i,j), T1(i,j)
                self.cell_vertices
                    .push([self.v(i, j), self.v(i + 1, j), self.v(i, j + 1)]);
                self.cell_edges
                    .push([self.h(i, j), self.d(i, j), self.e(i, j)]);
                self.cell_vertices
                    .push([self.v(i + 1, j), self.v(i + 1, j + 1), self.v(i, j + 1)]);
                self.cell_edges
                    .push([self.e(i + 1, j), self.h(i, j + 1), self.d(i, j)]);

                // edges h(i,j), e(i,j), d(i,j)
                self.edge_vertices.push([self.v(i, j), self.v(i + 1, j)]);
                self.edge_cells.push([self.t0(i, j), self.t1(i, j - 1)]);
                self.edge_vertices.push([self.v(i, j), self.v(i, j + 1)]);
                self.edge_cells.push([self.t0(i, j), self.t1(i - 1, j)]);
                self.edge_vertices.push([self.v(i + 1, j), self.v(i, j + 1)]);
                self.edge_cells.push([self.t0(i, j), self.t1(i, j)]);

                // vertex v(i,j), counter-clockwise from east
                self.vertex_edges.push([
                    self.h(i, j),
                    self.d(i, j - 1),
                    self.e(i, j),
                    self.h(i - 1, j),
                    self.d(i - 1, j),
                    self.e(i, j - 1),
                ]);
                self.vertex_cells.push([
                    self.t0(i, j),
                    self.t1(i - 1, j),
                    self.t0(i - 1, j),
                    self.t1(i - 1, j - 1),
                    self.t0(i, j - 1),
                    self.t1(i, j - 1),
                ]);
            }
        }
    }

    fn direct(&self, from: LocationType, elem: usize, to: LocationType) -> Vec<usize> {
        use LocationType::*;
        match (from, to) {
            (Cells, Vertices) => self.cell_vertices[elem].to_vec(),
            (Cells, Edges) => self.cell_edges[elem].to_vec(),
            (Edges, Vertices) => self.edge_vertices[elem].to_vec(),
            (Edges, Cells) => self.edge_cells[elem].to_vec(),
            (Vertices, Edges) => self.vertex_edges[elem].to_vec(),
            (Vertices, Cells) => self.vertex_cells[elem].to_vec(),
            _ => Vec::new(),
        }
    }
}

impl MeshTopology for TriMesh {
    fn count(&self, loc: LocationType) -> usize {
        match loc {
            LocationType::Cells => 2 * self.nx * self.ny,
            LocationType::Edges => 3 * self.nx * self.ny,
            LocationType::Vertices => self.nx * self.ny,
        }
    }

    fn neighbors(&self, from: LocationType, elem: usize, to: LocationType) -> Vec<usize> {
        use LocationType::*;
        if from != to {
            return self.direct(from, elem, to);
        }
        // same kind: across the shared lower-dimensional element
        let via = match from {
            Cells => Edges,
            Edges => Cells,
            Vertices => Edges,
        };
        let mut out = Vec::new();
        for mid in self.direct(from, elem, via) {
            for n in self.direct(via, mid, to) {
                if n != elem && !out.contains(&n) {
                    out.push(n);
                }
            }
        }
        out
    }
}
