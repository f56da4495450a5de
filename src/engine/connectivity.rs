use crate::arrays::Array2D;
use crate::error::{BridgeError, Result};
use crate::label_map::Labels;
use assume::assume;

/// Union-find over pixel indices. A root is always the smallest index of its set, so the
/// root of a component is its first pixel in raster order (the leader).
pub struct DisjointSet {
    parents: Vec<u32>,
}

impl DisjointSet {
    pub fn new(size: u32) -> Self {
        assert!(size > 0, "Size must be larger than zero.");
        assert!(size < u32::MAX, "Size must be smaller than {}", u32::MAX);
        DisjointSet {
            parents: (0..size).collect(),
        }
    }

    #[inline]
    pub fn find(&mut self, node: u32) -> u32 {
        let mut node = node as usize;
        loop {
            assume!(unsafe: node < self.parents.len(), "node: {node} > {}", self.parents.len());
            let parent = self.parents[node] as usize;
            if parent == node {
                return node as u32;
            }
            // path halving
            let grandparent = self.parents[parent];
            self.parents[node] = grandparent;
            node = grandparent as usize;
        }
    }

    #[inline]
    pub fn merge(&mut self, node_i: u32, node_j: u32) {
        let root_i = self.find(node_i);
        let root_j = self.find(node_j);
        if root_i < root_j {
            self.parents[root_j as usize] = root_i;
        } else if root_j < root_i {
            self.parents[root_i as usize] = root_j;
        }
    }
}

/// 4-connected components of equal assignment, numbered in raster order of their leaders.
pub struct ComponentSet {
    pub component_assignment: Vec<u32>,
    pub component_sizes: Vec<u32>,
    pub component_leaders: Vec<u32>,
}

/// Pixel indices are `u32`, with `u32::MAX` reserved as a sentinel.
pub fn pixel_count(width: usize, height: usize) -> Result<u32> {
    width
        .checked_mul(height)
        .and_then(|pixels| u32::try_from(pixels).ok())
        .filter(|pixels| *pixels > 0 && *pixels < u32::MAX)
        .ok_or_else(|| {
            BridgeError::InvalidShape(format!("{width}x{height} pixels cannot be indexed by u32"))
        })
}

pub fn find_components(assignments: &Array2D<u32>) -> Result<ComponentSet> {
    let width = assignments.width;
    let height = assignments.height;
    let mut set = DisjointSet::new(pixel_count(width, height)?);
    for y in 0..height {
        let row = assignments.get_row(y);
        for x in 0..width {
            let index = (y * width + x) as u32;
            if x > 0 && row[x - 1] == row[x] {
                set.merge(index - 1, index);
            }
            if y > 0 && assignments.get_row(y - 1)[x] == row[x] {
                set.merge(index - width as u32, index);
            }
        }
    }

    let mut components = ComponentSet {
        component_assignment: vec![u32::MAX; width * height],
        component_sizes: Vec::new(),
        component_leaders: Vec::new(),
    };
    let mut root_component = vec![u32::MAX; width * height];
    for index in 0..width * height {
        let root = set.find(index as u32) as usize;
        if root == index {
            root_component[index] = components.component_leaders.len() as u32;
            components.component_leaders.push(index as u32);
            components.component_sizes.push(0);
        }
        // roots precede their members in raster order
        let component = root_component[root];
        debug_assert_ne!(component, u32::MAX);
        components.component_assignment[index] = component;
        components.component_sizes[component as usize] += 1;
    }
    Ok(components)
}

/// This function implements the CCA step.
///
/// Components of at least `min_size` pixels become superpixels (at most `max_labels` of
/// them, the largest win). Every other component takes the label of the component left of
/// its leader, or above it when the leader starts a row. Labels are numbered `0..count` in
/// raster order of the surviving components.
pub fn enforce_connectivity(
    assignments: &Array2D<u32>,
    max_labels: usize,
    min_size: usize,
) -> Result<(Labels, u32)> {
    let width = assignments.width;
    let components = find_components(assignments)?;
    let num_components = components.component_leaders.len();

    let mut large: Vec<usize> = (0..num_components)
        .filter(|c| components.component_sizes[*c] as usize >= min_size)
        .collect();
    if large.len() > max_labels {
        // stable sort keeps raster order among equal sizes
        large.sort_by(|a, b| {
            components.component_sizes[*b].cmp(&components.component_sizes[*a])
        });
        large.truncate(max_labels);
        large.sort_unstable();
    }

    let mut substitute = vec![u32::MAX; num_components];
    for (label, component) in large.iter().enumerate() {
        substitute[*component] = label as u32;
    }
    if substitute[0] == u32::MAX {
        substitute[0] = 0;
    }
    for component in 1..num_components {
        if substitute[component] != u32::MAX {
            continue;
        }
        let leader = components.component_leaders[component] as usize;
        let neighbour = if leader % width > 0 {
            leader - 1
        } else {
            leader - width
        };
        let label = substitute[components.component_assignment[neighbour] as usize];
        debug_assert!(label != u32::MAX, "leader {leader}");
        substitute[component] = label;
    }

    let count = large.len().max(1) as u32;
    let mut labels = Labels::new(width, assignments.height, 0);
    for (label, component) in labels
        .data
        .as_mut_slice()
        .iter_mut()
        .zip(&components.component_assignment)
    {
        *label = substitute[*component as usize] as i32;
    }
    Ok((labels, count))
}

#[cfg(test)]
mod tests {
    use super::{enforce_connectivity, find_components, pixel_count, DisjointSet};
    use crate::arrays::Array2D;
    use crate::error::BridgeError;

    #[test]
    fn disjoint_set_roots_are_smallest() {
        let mut set = DisjointSet::new(6);
        set.merge(4, 5);
        set.merge(5, 2);
        set.merge(0, 1);
        assert_eq!(set.find(4), 2);
        assert_eq!(set.find(5), 2);
        assert_eq!(set.find(1), 0);
        assert_eq!(set.find(3), 3);
    }

    #[test]
    fn split_cluster_becomes_two_components() {
        #[rustfmt::skip]
        let assignments = Array2D::from_slice(&[
            0, 1, 0,
            0, 1, 0,
            0, 1, 0,
        ], 3, 3).unwrap();
        let components = find_components(&assignments).unwrap();
        assert_eq!(components.component_leaders, vec![0, 1, 2]);
        assert_eq!(components.component_sizes, vec![3, 3, 3]);
        let (labels, count) = enforce_connectivity(&assignments, 10, 1).unwrap();
        assert_eq!(count, 3);
        assert_eq!(labels.as_slice(), &[0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn small_components_merge_into_preceding_neighbour() {
        #[rustfmt::skip]
        let assignments = Array2D::from_slice(&[
            0, 0, 0, 0,
            0, 7, 0, 0,
            0, 0, 0, 0,
            1, 1, 1, 1,
        ], 4, 4).unwrap();
        let (labels, count) = enforce_connectivity(&assignments, 10, 2).unwrap();
        assert_eq!(count, 2);
        #[rustfmt::skip]
        assert_eq!(labels.as_slice(), &[
            0, 0, 0, 0,
            0, 0, 0, 0,
            0, 0, 0, 0,
            1, 1, 1, 1,
        ]);
    }

    #[test]
    fn label_count_is_capped() {
        #[rustfmt::skip]
        let assignments = Array2D::from_slice(&[
            0, 0, 1, 2, 2, 2,
        ], 6, 1).unwrap();
        let (labels, count) = enforce_connectivity(&assignments, 2, 1).unwrap();
        assert_eq!(count, 2);
        assert_eq!(labels.as_slice(), &[0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn all_small_collapses_to_one_label() {
        let assignments = Array2D::from_slice(&[0, 1, 2, 3], 2, 2).unwrap();
        let (labels, count) = enforce_connectivity(&assignments, 10, 100).unwrap();
        assert_eq!(count, 1);
        assert!(labels.as_slice().iter().all(|l| *l == 0));
    }

    #[test]
    fn pixel_count_fits_u32_indices() {
        assert_eq!(pixel_count(1920, 1080).unwrap(), 1920 * 1080);
        assert_eq!(pixel_count(65535, 65535).unwrap(), 65535 * 65535);
        for (width, height) in [(65536, 65536), (1 << 32, 1), (usize::MAX, 2), (0, 4)] {
            assert!(matches!(
                pixel_count(width, height),
                Err(BridgeError::InvalidShape(_))
            ));
        }
    }
}
