//! Neighbor tables: fixed-width, padded, slot-major adjacency.
//!
//! For every element of the chain's origin kind the reachable neighbor list
//! is written element-major and padded with [`DEVICE_MISSING_VALUE`] up to
//! the table size, then transposed so that slot `j` of all elements is one
//! contiguous row: `table[j * rows + i] = element_major[i * slots + j]`.

use rayon::prelude::*;

use crate::diagnostic::Diagnostic;
use crate::ir::{IterationSpace, LocationType};

/// Sentinel for an unused neighbor slot.
pub const DEVICE_MISSING_VALUE: i32 = -1;

/// Single-hop adjacency of a mesh.
pub trait MeshTopology {
    /// Number of elements of a kind.
    fn count(&self, loc: LocationType) -> usize;

    /// Elements of kind `to` adjacent to element `elem` of kind `from`.
    /// For `from == to` the element itself is not part of the result.
    fn neighbors(&self, from: LocationType, elem: usize, to: LocationType) -> Vec<usize>;
}

/// Neighbors of `elem` reachable through the whole chain.
///
/// Every hop is deduplicated in first-seen order. If the chain ends on its
/// origin kind the origin element is removed; with `include_center` it is
/// then prepended as slot 0.
pub fn chain_neighbors(
    topo: &dyn MeshTopology,
    space: &IterationSpace,
    elem: usize,
) -> Result<Vec<usize>, Diagnostic> {
    let (origin, target) = match (space.origin(), space.target()) {
        (Some(o), Some(t)) if space.chain.len() >= 2 => (o, t),
        _ => {
            return Err(Diagnostic::error(format!(
                "neighbor chain '{}' needs at least two locations",
                space
            )))
        }
    };

    let mut frontier = vec![elem];
    for hop in space.chain.windows(2) {
        let mut next: Vec<usize> = Vec::new();
        for &e in &frontier {
            for n in topo.neighbors(hop[0], e, hop[1]) {
                if !next.contains(&n) {
                    next.push(n);
                }
            }
        }
        frontier = next;
    }

    if target == origin {
        frontier.retain(|&n| n != elem);
    }
    if space.include_center {
        frontier.insert(0, elem);
    }
    Ok(frontier)
}

/// Slot-major neighbor table for one iteration space.
#[derive(Clone, Debug, PartialEq)]
pub struct NeighborTable {
    space: IterationSpace,
    rows: usize,
    slots: usize,
    data: Vec<i32>,
}

impl NeighborTable {
    /// One row per element of the origin kind.
    pub fn build(topo: &dyn MeshTopology, space: &IterationSpace) -> Result<Self, Diagnostic> {
        let origin = space.origin().unwrap_or(LocationType::Cells);
        Self::build_padded(topo, space, topo.count(origin))
    }

    /// Like [`NeighborTable::build`], with `rows >= count` element rows;
    /// rows past the element count hold only sentinels. Used when the mesh
    /// stride of the origin kind exceeds its element count.
    pub fn build_padded(
        topo: &dyn MeshTopology,
        space: &IterationSpace,
        rows: usize,
    ) -> Result<Self, Diagnostic> {
        let origin = match space.origin() {
            Some(o) => o,
            None => {
                return Err(Diagnostic::error(
                    "neighbor chain needs at least two locations".to_string(),
                ))
            }
        };
        let count = topo.count(origin);
        if rows < count {
            return Err(Diagnostic::error(format!(
                "table for '{}' has {} rows but the mesh has {} {}",
                space,
                rows,
                count,
                origin.plural().to_lowercase()
            )));
        }

        let slots = space.table_size();
        let mut element_major = vec![DEVICE_MISSING_VALUE; rows * slots];
        for elem in 0..count {
            let neighbors = chain_neighbors(topo, space, elem)?;
            if neighbors.len() > slots {
                return Err(Diagnostic::error(format!(
                    "element {} has {} neighbors over '{}', table holds {}",
                    elem,
                    neighbors.len(),
                    space,
                    slots
                ))
                .with_note("chain capacity is the product of per-hop degrees".to_string()));
            }
            for (slot, n) in neighbors.into_iter().enumerate() {
                element_major[elem * slots + slot] = n as i32;
            }
        }
        Ok(Self::from_element_major(space.clone(), rows, slots, &element_major))
    }

    /// Transpose an element-major `[rows][slots]` buffer into a table.
    pub fn from_element_major(
        space: IterationSpace,
        rows: usize,
        slots: usize,
        element_major: &[i32],
    ) -> Self {
        let mut data = vec![DEVICE_MISSING_VALUE; rows * slots];
        if rows > 0 {
            data.par_chunks_mut(rows)
                .enumerate()
                .for_each(|(slot, row)| {
                    for (elem, value) in row.iter_mut().enumerate() {
                        *value = element_major[elem * slots + slot];
                    }
                });
        }
        Self {
            space,
            rows,
            slots,
            data,
        }
    }

    pub fn space(&self) -> &IterationSpace {
        &self.space
    }

    /// Number of element rows (the origin kind's count or stride).
    pub fn num_elements(&self) -> usize {
        self.rows
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Entry for `slot` of element `elem`, `None` outside the table.
    pub fn get(&self, slot: usize, elem: usize) -> Option<i32> {
        if slot >= self.slots || elem >= self.rows {
            return None;
        }
        self.data.get(slot * self.rows + elem).copied()
    }

    /// The raw slot-major buffer, as uploaded to the device.
    pub fn as_slice(&self) -> &[i32] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::trimesh::TriMesh;
    use LocationType::*;

    #[test]
    fn test_transpose_is_slot_major() {
        let space = IterationSpace::new(vec![Cells, Edges], false);
        // 2 elements, 3 slots
        let em = [10, 11, 12, 20, 21, -1];
        let t = NeighborTable::from_element_major(space, 2, 3, &em);
        assert_eq!(t.as_slice(), &[10, 20, 11, 21, 12, -1]);
        assert_eq!(t.get(1, 1), Some(21));
        assert_eq!(t.get(2, 1), Some(DEVICE_MISSING_VALUE));
        assert_eq!(t.get(3, 0), None);
        assert_eq!(t.get(0, 2), None);
    }

    #[test]
    fn test_cell_edge_cell_with_center_shape() {
        let mesh = TriMesh::new(5, 10).unwrap();
        assert_eq!(mesh.count(Cells), 100);
        let space = IterationSpace::new(vec![Cells, Edges, Cells], true);
        let t = NeighborTable::build(&mesh, &space).unwrap();
        assert_eq!(t.slots(), 7);
        assert_eq!(t.num_elements(), 100);
        assert_eq!(t.len(), 700);
        assert!(t.as_slice().iter().all(|&v| (-1..=99).contains(&v)));
        for elem in 0..100 {
            assert_eq!(t.get(0, elem), Some(elem as i32));
        }
    }

    #[test]
    fn test_padding_uses_sentinel() {
        let mesh = TriMesh::new(4, 4).unwrap();
        let space = IterationSpace::new(vec![Cells, Edges, Cells], false);
        let t = NeighborTable::build(&mesh, &space).unwrap();
        // three neighbor cells across the three edges, three padded slots
        for elem in 0..mesh.count(Cells) {
            for slot in 0..3 {
                assert!(t.get(slot, elem).unwrap() >= 0);
            }
            for slot in 3..6 {
                assert_eq!(t.get(slot, elem), Some(DEVICE_MISSING_VALUE));
            }
        }
    }

    #[test]
    fn test_padded_rows_hold_only_sentinels() {
        let mesh = TriMesh::new(3, 3).unwrap();
        let space = IterationSpace::new(vec![Edges, Cells], false);
        let count = mesh.count(Edges);
        let t = NeighborTable::build_padded(&mesh, &space, count + 4).unwrap();
        assert_eq!(t.len(), (count + 4) * 2);
        for elem in count..count + 4 {
            assert_eq!(t.get(0, elem), Some(DEVICE_MISSING_VALUE));
            assert_eq!(t.get(1, elem), Some(DEVICE_MISSING_VALUE));
        }
    }

    #[test]
    fn test_too_few_rows_is_error() {
        let mesh = TriMesh::new(3, 3).unwrap();
        let space = IterationSpace::new(vec![Vertices, Edges], false);
        assert!(NeighborTable::build_padded(&mesh, &space, 2).is_err());
    }

    #[test]
    fn test_chain_needs_two_locations() {
        let mesh = TriMesh::new(3, 3).unwrap();
        let space = IterationSpace::new(vec![Cells], true);
        let err = chain_neighbors(&mesh, &space, 0).unwrap_err();
        assert!(err.message.contains("at least two locations"));
    }

    #[test]
    fn test_chain_excludes_origin_and_prepends_center() {
        let mesh = TriMesh::new(4, 4).unwrap();
        let vv = IterationSpace::new(vec![Vertices, Edges, Vertices], false);
        let n = chain_neighbors(&mesh, &vv, 5).unwrap();
        assert_eq!(n.len(), 6);
        assert!(!n.contains(&5));

        let vv_c = IterationSpace::new(vec![Vertices, Edges, Vertices], true);
        let n = chain_neighbors(&mesh, &vv_c, 5).unwrap();
        assert_eq!(n[0], 5);
        assert_eq!(n.len(), 7);
    }

    /// Adjacency that violates the capacity bound of its chain.
    struct Overfull;

    impl MeshTopology for Overfull {
        fn count(&self, _loc: LocationType) -> usize {
            1
        }

        fn neighbors(&self, _from: LocationType, _elem: usize, _to: LocationType) -> Vec<usize> {
            vec![0, 1, 2, 3]
        }
    }

    #[test]
    fn test_overfull_neighbor_list_is_error() {
        let space = IterationSpace::new(vec![Cells, Edges], false);
        let err = NeighborTable::build(&Overfull, &space).unwrap_err();
        assert!(err.message.contains("table holds 3"));
    }
}
