//! Kernel argument reconstruction.
//!
//! Launch events describe each kernel argument with a tagged JSON descriptor:
//! scalars carry their literal value, tensors carry dtype/shape/device and
//! optionally a reference to a persisted content-addressed blob. The
//! [`Synthesizer`] turns descriptors back into concrete values, loading blobs
//! where available and synthesizing type-correct random buffers otherwise.

use crate::blob;
use crate::dtype::{Device, Dtype};
use crate::tensor::{StridedTensor, TensorBuffer, UnsupportedDtype};
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    UnsupportedDtype(#[from] UnsupportedDtype),
    #[error(transparent)]
    Blob(#[from] blob::Error),
    #[error("strided-storage support is unavailable: cannot materialize a {tag:?} descriptor")]
    MissingCapability { tag: &'static str },
    #[error("{tag:?} descriptor must wrap a tensor storage")]
    BadComposite { tag: &'static str },
    #[error("could not read launch spec {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed launch spec {path:?}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("expected a single-element list at the top level of the launch spec, got {len} elements")]
    WrongArity { len: usize },
    #[error("expected an object or single-element list at the top level of the launch spec")]
    WrongShape,
}

/// Tensor-shaped argument metadata.
///
/// `dtype` keeps the recorded string form (`torch.float32`); an unknown or
/// absent dtype falls back to float32 with a warning, matching the recorded
/// traces' leniency for informational fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(default)]
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_path: Option<PathBuf>,
}

/// Explicit layout of a strided tensor view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LayoutDescriptor {
    #[serde(default)]
    pub shape: Vec<usize>,
    #[serde(default)]
    pub strides: Vec<i64>,
}

/// One kernel argument as recorded in a launch event, tagged by `type`.
///
/// All recognized tags are handled exhaustively; an unrecognized tag is kept
/// verbatim in [`ArgumentDescriptor::Unknown`] and materializes leniently to
/// a null value, since such fields may be informational-only.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentDescriptor {
    Int {
        value: i64,
    },
    Bool {
        value: bool,
    },
    Tensor(TensorDescriptor),
    TensorStorage {
        storage: Box<ArgumentDescriptor>,
        layout: Option<LayoutDescriptor>,
    },
    Unknown(serde_json::Value),
}

impl ArgumentDescriptor {
    /// The raw `type` tag, if present.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Int { .. } => Some("int"),
            Self::Bool { .. } => Some("bool"),
            Self::Tensor(_) => Some("tensor"),
            Self::TensorStorage { .. } => Some("tensor_storage"),
            Self::Unknown(value) => value.get("type").and_then(serde_json::Value::as_str),
        }
    }
}

impl<'de> Deserialize<'de> for ArgumentDescriptor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;

        #[derive(Deserialize)]
        struct Storage {
            storage: ArgumentDescriptor,
            #[serde(default)]
            layout: Option<LayoutDescriptor>,
        }

        let value = serde_json::Value::deserialize(deserializer)?;
        let tag = value.get("type").and_then(serde_json::Value::as_str);
        match tag {
            Some("int") => {
                let value = value
                    .get("value")
                    .and_then(serde_json::Value::as_i64)
                    .ok_or_else(|| D::Error::custom("int descriptor missing integer value"))?;
                Ok(Self::Int { value })
            }
            Some("bool") => {
                let value = value
                    .get("value")
                    .and_then(serde_json::Value::as_bool)
                    .ok_or_else(|| D::Error::custom("bool descriptor missing boolean value"))?;
                Ok(Self::Bool { value })
            }
            Some("tensor") => serde_json::from_value::<TensorDescriptor>(value)
                .map(Self::Tensor)
                .map_err(D::Error::custom),
            Some("tensor_storage") => serde_json::from_value::<Storage>(value)
                .map(|s| Self::TensorStorage {
                    storage: Box::new(s.storage),
                    layout: s.layout,
                })
                .map_err(D::Error::custom),
            // lenient: unrecognized tags are preserved as-is
            _ => Ok(Self::Unknown(value)),
        }
    }
}

impl Serialize for ArgumentDescriptor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        #[serde(tag = "type", rename_all = "snake_case")]
        enum Tagged<'a> {
            Int {
                value: i64,
            },
            Bool {
                value: bool,
            },
            Tensor(&'a TensorDescriptor),
            TensorStorage {
                storage: &'a ArgumentDescriptor,
                #[serde(skip_serializing_if = "Option::is_none")]
                layout: &'a Option<LayoutDescriptor>,
            },
        }

        match self {
            Self::Int { value } => Tagged::Int { value: *value }.serialize(serializer),
            Self::Bool { value } => Tagged::Bool { value: *value }.serialize(serializer),
            Self::Tensor(descriptor) => Tagged::Tensor(descriptor).serialize(serializer),
            Self::TensorStorage { storage, layout } => Tagged::TensorStorage {
                storage: &**storage,
                layout,
            }
            .serialize(serializer),
            Self::Unknown(value) => value.serialize(serializer),
        }
    }
}

/// A fully materialized kernel argument.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    Int(i64),
    Bool(bool),
    Tensor(TensorBuffer),
    Strided(StridedTensor),
    None,
}

/// Optional collaborator availability, resolved once at process start and
/// passed explicitly into the synthesizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub strided_storage: bool,
}

impl Capabilities {
    #[must_use]
    pub fn detect() -> Self {
        Self {
            strided_storage: cfg!(feature = "strided-storage"),
        }
    }
}

/// Rehydrates argument descriptors into concrete values.
pub struct Synthesizer {
    capabilities: Capabilities,
    rng: StdRng,
}

impl Synthesizer {
    #[must_use]
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic variant for reproducible synthesis.
    #[must_use]
    pub fn with_seed(capabilities: Capabilities, seed: u64) -> Self {
        Self {
            capabilities,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Materialize one descriptor, recursively for composite variants.
    pub fn materialize(&mut self, descriptor: &ArgumentDescriptor) -> Result<ArgValue, Error> {
        match descriptor {
            ArgumentDescriptor::Int { value } => Ok(ArgValue::Int(*value)),
            ArgumentDescriptor::Bool { value } => Ok(ArgValue::Bool(*value)),
            ArgumentDescriptor::Tensor(descriptor) => self.materialize_tensor(descriptor),
            ArgumentDescriptor::TensorStorage { storage, layout } => {
                if !self.capabilities.strided_storage {
                    return Err(Error::MissingCapability {
                        tag: "tensor_storage",
                    });
                }
                let ArgValue::Tensor(buffer) = self.materialize(storage)? else {
                    return Err(Error::BadComposite {
                        tag: "tensor_storage",
                    });
                };
                let layout = layout.clone().unwrap_or_else(|| LayoutDescriptor {
                    shape: buffer.shape.clone(),
                    strides: contiguous_strides(&buffer.shape),
                });
                Ok(ArgValue::Strided(StridedTensor {
                    storage: buffer,
                    shape: layout.shape,
                    strides: layout.strides,
                }))
            }
            ArgumentDescriptor::Unknown(value) => {
                let tag = value
                    .get("type")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("<missing>");
                log::warn!("unhandled argument type {tag:?}, returning null");
                Ok(ArgValue::None)
            }
        }
    }

    /// Materialize every argument of a launch, preserving recorded order.
    pub fn materialize_all(
        &mut self,
        args: &IndexMap<String, ArgumentDescriptor>,
    ) -> Result<IndexMap<String, ArgValue>, Error> {
        let mut out = IndexMap::with_capacity(args.len());
        for (name, descriptor) in args {
            let value = self.materialize(descriptor)?;
            out.insert(name.clone(), value);
        }
        Ok(out)
    }

    fn materialize_tensor(&mut self, descriptor: &TensorDescriptor) -> Result<ArgValue, Error> {
        // a persisted blob bypasses synthesis entirely
        if let Some(blob_path) = &descriptor.blob_path {
            let buffer = blob::load(blob_path, descriptor.device.as_ref())?;
            return Ok(ArgValue::Tensor(buffer));
        }
        let dtype = match descriptor.dtype.as_deref() {
            Some(name) => match Dtype::parse(name) {
                Ok(dtype) => dtype,
                Err(err) => {
                    log::warn!("{err}, defaulting to float32");
                    Dtype::Float32
                }
            },
            None => Dtype::Float32,
        };
        let device = descriptor.device.clone().unwrap_or_default();
        let buffer = TensorBuffer::random(dtype, descriptor.shape.clone(), device, &mut self.rng)?;
        Ok(ArgValue::Tensor(buffer))
    }
}

fn contiguous_strides(shape: &[usize]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1] as i64;
    }
    strides
}

/// Grid and argument descriptors for one launch, as persisted in the
/// reproducer context JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchSpec {
    #[serde(default)]
    pub grid: Vec<u64>,
    #[serde(default)]
    pub extracted_args: IndexMap<String, ArgumentDescriptor>,
}

/// Load a launch spec from JSON.
///
/// The top level must be a single object or a single-element array wrapping
/// one; anything else is a fatal input-format error.
pub fn load_launch_spec(path: impl AsRef<Path>) -> Result<LaunchSpec, Error> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })?;
    let value = match value {
        serde_json::Value::Array(mut items) => {
            if items.len() != 1 {
                return Err(Error::WrongArity { len: items.len() });
            }
            items.remove(0)
        }
        value @ serde_json::Value::Object(_) => value,
        _ => return Err(Error::WrongShape),
    };
    serde_json::from_value(value).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })
}
