use std::sync::Arc;

use derive_more::{Deref, Display};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A contiguous, row-major tensor layout.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Layout(Arc<[usize]>);

pub trait IntoLayout {
    fn into_layout(self) -> Layout;
}

impl IntoLayout for Layout {
    #[inline]
    fn into_layout(self) -> Layout {
        self
    }
}

impl IntoLayout for &Layout {
    #[inline]
    fn into_layout(self) -> Layout {
        self.clone()
    }
}

impl IntoLayout for Vec<usize> {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout(self.into())
    }
}

impl IntoLayout for &[usize] {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout(self.into())
    }
}

impl<const N: usize> IntoLayout for [usize; N] {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout(self.into())
    }
}

impl Layout {
    #[inline]
    pub fn from_shape(shape: impl IntoLayout) -> Self {
        shape.into_layout()
    }

    /// A rank-0 layout holding exactly one element.
    #[inline]
    pub fn scalar() -> Self {
        Self(Arc::new([]))
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.0
    }

    /// Number of axes.
    #[inline]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    #[inline]
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.0.get(axis).copied()
    }

    /// Product of the dimensions before `axis`.
    #[inline]
    pub fn outer_size(&self, axis: usize) -> usize {
        self.0[..axis.min(self.rank())].iter().product()
    }

    /// Product of the dimensions after `axis`.
    #[inline]
    pub fn inner_size(&self, axis: usize) -> usize {
        self.0.get(axis + 1..).map_or(1, |dims| dims.iter().product())
    }

    /// Returns a copy of the layout with the dimension at `axis` replaced.
    ///
    /// # Panics
    /// Panics if `axis` is out of range.
    #[inline]
    pub fn with_dim(&self, axis: usize, dim: usize) -> Self {
        let mut shape = self.0.to_vec();
        shape[axis] = dim;
        Self(shape.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Dim {
    #[display("{_0}")]
    Known(usize),
    #[display("?")]
    Unknown,
}

impl From<usize> for Dim {
    #[inline]
    fn from(value: usize) -> Self {
        Self::Known(value)
    }
}

impl Dim {
    #[inline]
    pub fn known(self) -> Option<usize> {
        match self {
            Dim::Known(dim) => Some(dim),
            Dim::Unknown => None,
        }
    }

    #[inline]
    pub fn is_compatible(self, dim: usize) -> bool {
        self.known().is_none_or(|x| x == dim)
    }

    /// The least specific dimension covering both.
    #[inline]
    pub fn relax(self, other: Dim) -> Dim {
        match (self, other) {
            (Dim::Known(x), Dim::Known(y)) if x == y => Dim::Known(x),
            _ => Dim::Unknown,
        }
    }
}

/// A shape known only partially ahead of execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PartialShape {
    #[display("[{}]", _0.iter().format(", "))]
    Ranked(Arc<[Dim]>),
    #[display("[...]")]
    Dynamic,
}

impl From<Layout> for PartialShape {
    #[inline]
    fn from(value: Layout) -> Self {
        Self::Ranked(value.iter().map(|&dim| Dim::Known(dim)).collect())
    }
}

impl From<Vec<Dim>> for PartialShape {
    #[inline]
    fn from(value: Vec<Dim>) -> Self {
        Self::Ranked(value.into())
    }
}

impl<const N: usize> From<[Dim; N]> for PartialShape {
    #[inline]
    fn from(value: [Dim; N]) -> Self {
        Self::Ranked(value.into())
    }
}

impl PartialShape {
    /// A fully static shape.
    #[inline]
    pub fn from_shape(shape: impl IntoLayout) -> Self {
        shape.into_layout().into()
    }

    #[inline]
    pub fn rank(&self) -> Option<usize> {
        match self {
            PartialShape::Ranked(dims) => Some(dims.len()),
            PartialShape::Dynamic => None,
        }
    }

    #[inline]
    pub fn dims(&self) -> Option<&[Dim]> {
        match self {
            PartialShape::Ranked(dims) => Some(dims),
            PartialShape::Dynamic => None,
        }
    }

    /// Returns `true` if `layout` is one of the shapes this describes.
    pub fn is_compatible(&self, layout: &Layout) -> bool {
        match self {
            PartialShape::Ranked(dims) => {
                dims.len() == layout.rank()
                    && dims.iter().zip_eq(layout.iter()).all(|(x, &y)| x.is_compatible(y))
            }
            PartialShape::Dynamic => true,
        }
    }

    /// Converts into a layout if every dimension is known.
    pub fn to_layout(&self) -> Option<Layout> {
        let dims = self.dims()?;
        let shape: Option<Vec<_>> = dims.iter().map(|dim| dim.known()).collect();
        shape.map(Layout::from_shape)
    }

    /// Converts into a layout, substituting `0` for unknown dimensions.
    /// Dynamic-rank shapes become a rank-1 empty layout.
    pub fn to_empty_layout(&self) -> Layout {
        match self {
            PartialShape::Ranked(dims) => dims
                .iter()
                .map(|dim| dim.known().unwrap_or(0))
                .collect_vec()
                .into_layout(),
            PartialShape::Dynamic => Layout::from_shape([0]),
        }
    }

    /// Returns a copy with the dimension at `axis` replaced; dynamic shapes stay dynamic.
    pub fn with_dim(&self, axis: usize, dim: Dim) -> Self {
        match self {
            PartialShape::Ranked(dims) => {
                let mut dims = dims.to_vec();
                if let Some(x) = dims.get_mut(axis) {
                    *x = dim;
                }
                dims.into()
            }
            PartialShape::Dynamic => PartialShape::Dynamic,
        }
    }

    /// The least specific shape covering both.
    pub fn relax(&self, other: &PartialShape) -> Self {
        match (self, other) {
            (PartialShape::Ranked(x), PartialShape::Ranked(y)) if x.len() == y.len() => x
                .iter()
                .zip_eq(y.iter())
                .map(|(&x, &y)| x.relax(y))
                .collect_vec()
                .into(),
            _ => PartialShape::Dynamic,
        }
    }
}
