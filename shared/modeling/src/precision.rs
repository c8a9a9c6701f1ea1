use std::{fmt::Display, str::FromStr};
use tch::Kind;
use thiserror::Error;

/// Weight precision requested on the command line, named after the torch dtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Float32,
    Float16,
    BFloat16,
    Int8,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown precision \"{0}\", expected one of float32, float16, bfloat16, int8")]
pub struct UnknownPrecision(String);

impl Precision {
    pub fn kind(&self) -> Kind {
        match self {
            Precision::Float32 => Kind::Float,
            Precision::Float16 => Kind::Half,
            Precision::BFloat16 => Kind::BFloat16,
            Precision::Int8 => Kind::Int8,
        }
    }
}

impl FromStr for Precision {
    type Err = UnknownPrecision;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float32" => Ok(Precision::Float32),
            "float16" => Ok(Precision::Float16),
            "bfloat16" => Ok(Precision::BFloat16),
            "int8" => Ok(Precision::Int8),
            other => Err(UnknownPrecision(other.to_owned())),
        }
    }
}

impl Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Precision::Float32 => "float32",
            Precision::Float16 => "float16",
            Precision::BFloat16 => "bfloat16",
            Precision::Int8 => "int8",
        })
    }
}
