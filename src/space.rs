//! Element selections and chunk-grid geometry.
//!
//! The cache never needs a general dataspace algebra. Requests arrive as
//! rectangular [`Hyperslab`]s in dataset coordinates and are split into one
//! [`ChunkPiece`] per chunk they touch. Inside a chunk, a [`Selection`] is a
//! sorted set of chunk-local linear element indices (row-major, last dimension
//! fastest), which is all the defined-value bookkeeping needs.

use crate::{CacheError, Result};

/// Sorted, de-duplicated set of chunk-local element indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    points: Vec<u64>,
}

impl Selection {
    pub fn none() -> Self {
        Self::default()
    }

    /// Every element of a chunk holding `nelem` elements.
    pub fn all(nelem: u64) -> Self {
        Self {
            points: (0..nelem).collect(),
        }
    }

    pub fn from_points<I: IntoIterator<Item = u64>>(points: I) -> Self {
        let mut points: Vec<u64> = points.into_iter().collect();
        points.sort_unstable();
        points.dedup();
        Self { points }
    }

    pub(crate) fn from_sorted(points: Vec<u64>) -> Self {
        debug_assert!(points.windows(2).all(|w| w[0] < w[1]));
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// True if this selection covers a whole chunk of `nelem` elements.
    pub fn is_all(&self, nelem: u64) -> bool {
        self.points.len() as u64 == nelem
    }

    pub fn contains(&self, index: u64) -> bool {
        self.points.binary_search(&index).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.points.iter().copied()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.points
    }

    pub fn intersect(&self, other: &Selection) -> Selection {
        let mut out = Vec::with_capacity(self.len().min(other.len()));
        let (mut i, mut j) = (0, 0);
        while i < self.points.len() && j < other.points.len() {
            match self.points[i].cmp(&other.points[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    out.push(self.points[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        Selection::from_sorted(out)
    }

    pub fn union(&self, other: &Selection) -> Selection {
        let mut out = Vec::with_capacity(self.len() + other.len());
        let (mut i, mut j) = (0, 0);
        while i < self.points.len() && j < other.points.len() {
            match self.points[i].cmp(&other.points[j]) {
                std::cmp::Ordering::Less => {
                    out.push(self.points[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(other.points[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.push(self.points[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&self.points[i..]);
        out.extend_from_slice(&other.points[j..]);
        Selection::from_sorted(out)
    }

    pub fn difference(&self, other: &Selection) -> Selection {
        let points = self
            .points
            .iter()
            .copied()
            .filter(|p| !other.contains(*p))
            .collect();
        Selection::from_sorted(points)
    }
}

/// Rectangular selection in dataset coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hyperslab {
    pub start: Vec<u64>,
    pub count: Vec<u64>,
}

impl Hyperslab {
    pub fn new(start: Vec<u64>, count: Vec<u64>) -> Self {
        Self { start, count }
    }

    /// The whole of a dataset with extent `dims`.
    pub fn whole(dims: &[u64]) -> Self {
        Self {
            start: vec![0; dims.len()],
            count: dims.to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        self.start.len()
    }

    pub fn nelem(&self) -> u64 {
        self.count.iter().product()
    }

    pub(crate) fn validate(&self, dims: &[u64]) -> Result<()> {
        if self.start.len() != self.count.len() || self.start.len() != dims.len() {
            return Err(CacheError::InvalidRequest(format!(
                "selection rank {} does not match dataset rank {}",
                self.start.len(),
                dims.len()
            )));
        }
        for (d, ((&start, &count), &dim)) in
            self.start.iter().zip(&self.count).zip(dims).enumerate()
        {
            if start.checked_add(count).is_none_or(|end| end > dim) {
                return Err(CacheError::InvalidRequest(format!(
                    "selection [{start}, {start}+{count}) exceeds extent {dim} in dimension {d}"
                )));
            }
        }
        Ok(())
    }
}

/// The part of a request that falls inside one chunk.
///
/// `selection` and `mem_index` are parallel: the `k`-th selected chunk
/// element maps to element `mem_index[k]` of the request's memory buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub scaled: Vec<u64>,
    pub selection: Selection,
    pub mem_index: Vec<usize>,
}

/// Row-major strides for an array of shape `dims`.
fn strides(dims: &[u64]) -> Vec<u64> {
    let mut strides = vec![1; dims.len()];
    for d in (0..dims.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * dims[d + 1];
    }
    strides
}

/// Advance `coord` through the box `[lo, hi)` in row-major order.
fn advance(coord: &mut [u64], lo: &[u64], hi: &[u64]) -> bool {
    for d in (0..coord.len()).rev() {
        coord[d] += 1;
        if coord[d] < hi[d] {
            return true;
        }
        coord[d] = lo[d];
    }
    false
}

pub(crate) fn chunk_nelem(chunk_dims: &[u64]) -> u64 {
    chunk_dims.iter().product()
}

/// Split a hyperslab into per-chunk pieces, in chunk-grid row-major order.
pub(crate) fn decompose(slab: &Hyperslab, chunk_dims: &[u64]) -> Vec<ChunkPiece> {
    if slab.nelem() == 0 {
        return Vec::new();
    }
    let rank = chunk_dims.len();
    let end: Vec<u64> = slab.start.iter().zip(&slab.count).map(|(s, c)| s + c).collect();
    let first: Vec<u64> = slab.start.iter().zip(chunk_dims).map(|(s, c)| s / c).collect();
    let last: Vec<u64> = end.iter().zip(chunk_dims).map(|(e, c)| (e - 1) / c + 1).collect();
    let chunk_strides = strides(chunk_dims);
    let mem_strides = strides(&slab.count);

    let mut pieces = Vec::new();
    let mut scaled = first.clone();
    loop {
        let origin: Vec<u64> = scaled.iter().zip(chunk_dims).map(|(s, c)| s * c).collect();
        let lo: Vec<u64> = (0..rank).map(|d| slab.start[d].max(origin[d])).collect();
        let hi: Vec<u64> = (0..rank)
            .map(|d| end[d].min(origin[d] + chunk_dims[d]))
            .collect();

        let mut points = Vec::new();
        let mut mem_index = Vec::new();
        let mut coord = lo.clone();
        loop {
            let mut local = 0;
            let mut mem = 0;
            for d in 0..rank {
                local += (coord[d] - origin[d]) * chunk_strides[d];
                mem += (coord[d] - slab.start[d]) * mem_strides[d];
            }
            points.push(local);
            mem_index.push(mem as usize);
            if !advance(&mut coord, &lo, &hi) {
                break;
            }
        }

        pieces.push(ChunkPiece {
            scaled: scaled.clone(),
            selection: Selection::from_sorted(points),
            mem_index,
        });

        if !advance(&mut scaled, &first, &last) {
            break;
        }
    }
    pieces
}

/// Where a chunk sits relative to a dataset extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Inside,
    Straddling,
    Outside,
}

pub(crate) fn placement(scaled: &[u64], chunk_dims: &[u64], dims: &[u64]) -> Placement {
    let mut inside = true;
    for d in 0..chunk_dims.len() {
        let origin = scaled[d] * chunk_dims[d];
        if origin >= dims[d] {
            return Placement::Outside;
        }
        if origin + chunk_dims[d] > dims[d] {
            inside = false;
        }
    }
    if inside {
        Placement::Inside
    } else {
        Placement::Straddling
    }
}

/// Chunk-local indices of the elements lying beyond `dims`.
pub(crate) fn outside_extent(scaled: &[u64], chunk_dims: &[u64], dims: &[u64]) -> Selection {
    let rank = chunk_dims.len();
    let zero = vec![0; rank];
    let mut coord = zero.clone();
    let mut points = Vec::new();
    let mut local = 0;
    loop {
        let beyond = (0..rank).any(|d| scaled[d] * chunk_dims[d] + coord[d] >= dims[d]);
        if beyond {
            points.push(local);
        }
        local += 1;
        if !advance(&mut coord, &zero, chunk_dims) {
            break;
        }
    }
    Selection::from_sorted(points)
}
