use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use crate::CompositionError;

/// Element type of every tensor in a chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DType {
    #[default]
    F32,
    F16,
    I8,
    I32,
    I64,
    U8,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I8 => 1,
            DType::I32 => 4,
            DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    /// Stable tag used by serialized engines.
    pub fn tag(self) -> u8 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::I8 => 2,
            DType::I32 => 3,
            DType::I64 => 4,
            DType::U8 => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => DType::F32,
            1 => DType::F16,
            2 => DType::I8,
            3 => DType::I32,
            4 => DType::I64,
            5 => DType::U8,
            _ => return None,
        })
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::I8 => "i8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
        };
        f.write_str(name)
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float" => Ok(DType::F32),
            "f16" | "half" => Ok(DType::F16),
            "i8" | "int8" => Ok(DType::I8),
            "i32" => Ok(DType::I32),
            "i64" => Ok(DType::I64),
            "u8" => Ok(DType::U8),
            other => Err(format!("unknown element type: {other}")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    pub fn last(&self) -> Option<usize> {
        self.0.last().copied()
    }

    /// `[batch] ++ self`, the layout of a network input.
    pub fn prepend(&self, batch: usize) -> Shape {
        let mut dims = SmallVec::with_capacity(self.rank() + 1);
        dims.push(batch);
        dims.extend_from_slice(&self.0);
        Shape(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

/// Dimension sizes plus element type, compared structurally.
///
/// The batch axis is never part of a `ShapeSpec`; modules carry their batch
/// size separately and networks prepend it to the input.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShapeSpec {
    dims: Shape,
    dtype: DType,
}

impl ShapeSpec {
    pub fn new(dims: &[usize], dtype: DType) -> Result<Self, CompositionError> {
        if dims.is_empty() {
            return Err(CompositionError::EmptyShape);
        }
        Ok(Self {
            dims: Shape::from_slice(dims),
            dtype,
        })
    }

    pub fn f32(dims: &[usize]) -> Result<Self, CompositionError> {
        Self::new(dims, DType::F32)
    }

    pub fn dims(&self) -> &Shape {
        &self.dims
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rank(&self) -> usize {
        self.dims.rank()
    }

    pub fn volume(&self) -> usize {
        self.dims.numel()
    }
}

impl fmt::Display for ShapeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.dims)
    }
}
