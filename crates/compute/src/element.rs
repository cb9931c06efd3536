//! Fixed-width numeric element types a [`MemoryRegion`](crate::MemoryRegion) can hold.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    I32,
    U32,
}

impl ElementType {
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::F32 | Self::I32 | Self::U32 => 4,
        }
    }

    /// Scalar type name used when generating WGSL.
    #[must_use]
    pub const fn wgsl_name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::I32 => "i32",
            Self::U32 => "u32",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wgsl_name())
    }
}

impl std::str::FromStr for ElementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f32" => Ok(Self::F32),
            "i32" => Ok(Self::I32),
            "u32" => Ok(Self::U32),
            other => Err(format!("unknown element type `{other}` (expected f32, i32 or u32)")),
        }
    }
}

/// Host-side view of an [`ElementType`].
///
/// `add` is the reference semantics of the element-wise kernel: IEEE addition
/// for floats, wrapping addition for integers (what WGSL does on overflow).
pub trait Element: bytemuck::Pod + PartialEq + fmt::Debug + Send + Sync + 'static {
    const TYPE: ElementType;

    #[must_use]
    fn add(self, other: Self) -> Self;
}

impl Element for f32 {
    const TYPE: ElementType = ElementType::F32;

    fn add(self, other: Self) -> Self {
        self + other
    }
}

impl Element for i32 {
    const TYPE: ElementType = ElementType::I32;

    fn add(self, other: Self) -> Self {
        self.wrapping_add(other)
    }
}

impl Element for u32 {
    const TYPE: ElementType = ElementType::U32;

    fn add(self, other: Self) -> Self {
        self.wrapping_add(other)
    }
}
