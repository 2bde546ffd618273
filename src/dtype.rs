use serde::{Deserialize, Serialize};

/// Numeric element category of a tensor buffer.
///
/// String forms follow the torch spelling (`float32`, `bfloat16`, ...);
/// [`Dtype::parse`] additionally accepts the `torch.`-prefixed form found in
/// trace descriptors.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Dtype {
    Float16,
    BFloat16,
    Float32,
    Float64,
    #[serde(rename = "float8_e4m3fn")]
    #[strum(to_string = "float8_e4m3fn", serialize = "float8_e4m3")]
    Float8E4M3,
    #[serde(rename = "float8_e5m2")]
    #[strum(to_string = "float8_e5m2")]
    Float8E5M2,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Bool,
    Complex64,
    Complex128,
}

#[derive(thiserror::Error, Debug)]
#[error("unknown dtype {value:?}")]
pub struct ParseDtypeError {
    pub value: String,
}

impl Dtype {
    /// Parse a dtype name, accepting both `float32` and `torch.float32`.
    pub fn parse(value: &str) -> Result<Self, ParseDtypeError> {
        let name = value.rsplit('.').next().unwrap_or(value);
        name.parse().map_err(|_| ParseDtypeError {
            value: value.to_string(),
        })
    }

    /// Size of one element in bytes.
    #[must_use]
    pub fn size_of(&self) -> usize {
        match self {
            Self::Float8E4M3 | Self::Float8E5M2 | Self::Int8 | Self::UInt8 | Self::Bool => 1,
            Self::Float16 | Self::BFloat16 | Self::Int16 | Self::UInt16 => 2,
            Self::Float32 | Self::Int32 | Self::UInt32 => 4,
            Self::Float64 | Self::Int64 | Self::UInt64 | Self::Complex64 => 8,
            Self::Complex128 => 16,
        }
    }

    #[must_use]
    pub fn is_floating_point(&self) -> bool {
        matches!(
            self,
            Self::Float16
                | Self::BFloat16
                | Self::Float32
                | Self::Float64
                | Self::Float8E4M3
                | Self::Float8E5M2
        )
    }

    #[must_use]
    pub fn is_complex(&self) -> bool {
        matches!(self, Self::Complex64 | Self::Complex128)
    }

    #[must_use]
    pub fn is_signed_int(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    #[must_use]
    pub fn is_unsigned_int(&self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64)
    }
}

/// Logical placement tag for a buffer (`cpu`, `cuda:0`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Device(pub String);

impl Default for Device {
    fn default() -> Self {
        Self("cpu".to_string())
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Device {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
