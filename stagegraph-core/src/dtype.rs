//! Element-type tags for traced values.

use std::fmt;

/// Runtime element type of an array.
///
/// The engine never inspects array contents beyond what the primitive catalog
/// does for it, but abstract types carry a dtype tag so that staged programs
/// agree with their eventual concrete execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DType {
    /// Boolean (stored as 0.0 / 1.0 in the host buffer)
    Bool,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 16-bit floating point
    #[cfg(feature = "half")]
    F16,
    /// 16-bit brain floating point
    #[cfg(feature = "bfloat")]
    BF16,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
}

impl DType {
    /// Byte width of one element of this dtype.
    pub const fn byte_width(self) -> usize {
        match self {
            DType::Bool => 1,
            #[cfg(feature = "half")]
            DType::F16 => 2,
            #[cfg(feature = "bfloat")]
            DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Whether this is a floating-point dtype.
    pub const fn is_float(self) -> bool {
        #[cfg(feature = "half")]
        if matches!(self, DType::F16) {
            return true;
        }
        #[cfg(feature = "bfloat")]
        if matches!(self, DType::BF16) {
            return true;
        }
        matches!(self, DType::F32 | DType::F64)
    }

    /// Whether this is an integer dtype.
    pub const fn is_int(self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }

    // Promotion order. The two 16-bit float formats share a rank and promote
    // to f32 when mixed.
    const fn rank(self) -> u8 {
        match self {
            DType::Bool => 0,
            DType::I32 => 1,
            DType::I64 => 2,
            #[cfg(feature = "half")]
            DType::F16 => 3,
            #[cfg(feature = "bfloat")]
            DType::BF16 => 3,
            DType::F32 => 4,
            DType::F64 => 5,
        }
    }

    /// Least upper bound of two dtypes under the promotion order
    /// `bool < i32 < i64 < f16/bf16 < f32 < f64`.
    pub fn join(self, other: DType) -> DType {
        if self == other {
            return self;
        }
        match self.rank().cmp(&other.rank()) {
            std::cmp::Ordering::Less => other,
            std::cmp::Ordering::Greater => self,
            // f16 vs bf16: neither fits in the other.
            std::cmp::Ordering::Equal => DType::F32,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::Bool => "bool",
            DType::I32 => "i32",
            DType::I64 => "i64",
            #[cfg(feature = "half")]
            DType::F16 => "f16",
            #[cfg(feature = "bfloat")]
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{s}")
    }
}

#[cfg(feature = "half")]
impl From<half::f16> for crate::value::ArrayValue {
    fn from(x: half::f16) -> Self {
        crate::value::ArrayValue::scalar(x.to_f64(), DType::F16)
    }
}

#[cfg(feature = "bfloat")]
impl From<half::bf16> for crate::value::ArrayValue {
    fn from(x: half::bf16) -> Self {
        crate::value::ArrayValue::scalar(x.to_f64(), DType::BF16)
    }
}
