//! Spatial indexing abstractions for neighborhood queries over arena positions.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by neighborhood indices.
///
/// Positions are plain Euclidean coordinates; the index does not wrap
/// distances across arena edges, matching how the simulation measures range.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from entity positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Visit neighbors of the entity at `entity_idx` within the provided squared radius.
    fn neighbors_within(
        &self,
        entity_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );

    /// Visit entities within the squared radius of an arbitrary probe point.
    fn neighbors_near(
        &self,
        x: f32,
        y: f32,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform grid index bucketing entities by cell for range queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing entities.
    pub cell_size: f32,
    width: f32,
    height: f32,
    #[serde(skip)]
    cols: usize,
    #[serde(skip)]
    rows: usize,
    #[serde(skip)]
    buckets: Vec<Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
}

impl UniformGridIndex {
    /// Create a new uniform grid covering a `width` by `height` arena.
    #[must_use]
    pub fn new(cell_size: f32, width: f32, height: f32) -> Self {
        Self {
            cell_size,
            width,
            height,
            cols: 0,
            rows: 0,
            buckets: Vec::new(),
            positions: Vec::new(),
        }
    }

    /// Number of indexed entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when no entities are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[inline]
    fn cell_of(&self, x: f32, y: f32) -> (usize, usize) {
        let cx = ((x / self.cell_size) as isize).clamp(0, self.cols as isize - 1) as usize;
        let cy = ((y / self.cell_size) as isize).clamp(0, self.rows as isize - 1) as usize;
        (cx, cy)
    }

    fn visit_range(
        &self,
        x: f32,
        y: f32,
        radius_sq: f32,
        skip: Option<usize>,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if self.cols == 0 || self.rows == 0 || radius_sq < 0.0 {
            return;
        }
        let radius = radius_sq.sqrt();
        let min_cx = (((x - radius) / self.cell_size) as isize).clamp(0, self.cols as isize - 1);
        let max_cx = (((x + radius) / self.cell_size) as isize).clamp(0, self.cols as isize - 1);
        let min_cy = (((y - radius) / self.cell_size) as isize).clamp(0, self.rows as isize - 1);
        let max_cy = (((y + radius) / self.cell_size) as isize).clamp(0, self.rows as isize - 1);
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                let bucket = &self.buckets[cy as usize * self.cols + cx as usize];
                for &idx in bucket {
                    if Some(idx) == skip {
                        continue;
                    }
                    let (px, py) = self.positions[idx];
                    let dx = px - x;
                    let dy = py - y;
                    let dist_sq = dx * dx + dy * dy;
                    if dist_sq <= radius_sq {
                        visitor(idx, OrderedFloat(dist_sq));
                    }
                }
            }
        }
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(50.0, 1000.0, 1000.0)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(IndexError::InvalidConfig(
                "arena dimensions must be positive",
            ));
        }
        self.cols = ((self.width / self.cell_size).ceil() as usize).max(1);
        self.rows = ((self.height / self.cell_size).ceil() as usize).max(1);
        self.buckets.iter_mut().for_each(Vec::clear);
        self.buckets.resize(self.cols * self.rows, Vec::new());
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, &(x, y)) in positions.iter().enumerate() {
            let (cx, cy) = self.cell_of(x, y);
            self.buckets[cy * self.cols + cx].push(idx);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        entity_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let Some(&(x, y)) = self.positions.get(entity_idx) else {
            return;
        };
        self.visit_range(x, y, radius_sq, Some(entity_idx), visitor);
    }

    fn neighbors_near(
        &self,
        x: f32,
        y: f32,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        self.visit_range(x, y, radius_sq, None, visitor);
    }
}
