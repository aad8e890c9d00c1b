//! Element types for shared arrays.

/// Element type of a shared array.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum DType {
    /// Unsigned 8-bit integer.
    U8 = 0,
    /// Unsigned 16-bit integer (raw detector counts).
    U16 = 1,
    /// Unsigned 32-bit integer.
    U32 = 2,
    /// 32-bit float, the usual processing type.
    F32 = 3,
    /// 64-bit float.
    F64 = 4,
}

impl DType {
    /// Size of one element in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /// Whether unsigned integer samples `bits` wide fit without saturating.
    pub const fn holds_bits(&self, bits: u32) -> bool {
        match self {
            Self::U8 => bits <= 8,
            Self::U16 => bits <= 16,
            Self::U32 | Self::F32 | Self::F64 => true,
        }
    }

    /// Short lowercase name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A plain numeric type that can live in a shared array.
///
/// # Safety
///
/// Implementors must be plain-old-data: every bit pattern is a valid value
/// and the type has no padding, so a zeroed mapping is a valid slice.
pub unsafe trait Element: Copy + Send + Sync + 'static {
    /// Matching runtime element type.
    const DTYPE: DType;

    /// Widen to f64.
    fn to_f64(self) -> f64;

    /// Narrow from f64, saturating for integer types.
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            unsafe impl Element for $ty {
                const DTYPE: DType = DType::$dtype;

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(value: f64) -> Self {
                    value as $ty
                }
            }
        )*
    };
}

impl_element!(u8 => U8, u16 => U16, u32 => U32, f32 => F32, f64 => F64);

/// Run `$body` with `$t` bound to the concrete element type for `$dtype`.
macro_rules! with_element {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::memory::DType::U8 => {
                type $t = u8;
                $body
            }
            $crate::memory::DType::U16 => {
                type $t = u16;
                $body
            }
            $crate::memory::DType::U32 => {
                type $t = u32;
                $body
            }
            $crate::memory::DType::F32 => {
                type $t = f32;
                $body
            }
            $crate::memory::DType::F64 => {
                type $t = f64;
                $body
            }
        }
    };
}

pub(crate) use with_element;
