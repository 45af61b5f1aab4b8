use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    F32,
    F64,
    I32,
    I64,
    U32,
}

impl DataType {
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U32 => "u32",
        }
    }

    /// Element type used by generated device kernels, `None` when the device
    /// path has no native storage for it and a host fallback is required.
    pub fn to_wgsl_type(&self) -> Option<&'static str> {
        match self {
            DataType::F32 => Some("f32"),
            DataType::I32 => Some("i32"),
            DataType::U32 => Some("u32"),
            DataType::F64 | DataType::I64 => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Reads element `index` from little-endian storage.
    pub fn read(&self, bytes: &[u8], index: usize) -> f64 {
        let at = index * self.size();
        match self {
            DataType::F32 => f32::from_le_bytes(word(bytes, at)) as f64,
            DataType::F64 => f64::from_le_bytes(word(bytes, at)),
            DataType::I32 => i32::from_le_bytes(word(bytes, at)) as f64,
            DataType::I64 => i64::from_le_bytes(word(bytes, at)) as f64,
            DataType::U32 => u32::from_le_bytes(word(bytes, at)) as f64,
        }
    }

    pub fn write(&self, bytes: &mut [u8], index: usize, value: f64) {
        let at = index * self.size();
        match self {
            DataType::F32 => bytes[at..at + 4].copy_from_slice(&(value as f32).to_le_bytes()),
            DataType::F64 => bytes[at..at + 8].copy_from_slice(&value.to_le_bytes()),
            DataType::I32 => bytes[at..at + 4].copy_from_slice(&(value as i32).to_le_bytes()),
            DataType::I64 => bytes[at..at + 8].copy_from_slice(&(value as i64).to_le_bytes()),
            DataType::U32 => bytes[at..at + 4].copy_from_slice(&(value as u32).to_le_bytes()),
        }
    }

    pub fn encode(&self, values: &[f64]) -> Vec<u8> {
        let mut bytes = vec![0u8; values.len() * self.size()];
        for (i, v) in values.iter().enumerate() {
            self.write(&mut bytes, i, *v);
        }
        bytes
    }

    pub fn decode(&self, bytes: &[u8]) -> Vec<f64> {
        (0..bytes.len() / self.size()).map(|i| self.read(bytes, i)).collect()
    }
}

fn word<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum Dim {
    Static(usize),
    Variable(String),
}

impl Dim {
    pub fn as_static(&self) -> Option<usize> {
        match self {
            Dim::Static(v) => Some(*v),
            Dim::Variable(_) => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(v) => write!(f, "{}", v),
            Dim::Variable(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    pub dims: Vec<Dim>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self { dims: dims.iter().map(|d| Dim::Static(*d)).collect() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_dynamic(&self) -> bool {
        self.dims.iter().any(|d| matches!(d, Dim::Variable(_)))
    }

    /// Element count, `None` while any dimension is symbolic.
    pub fn count(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, d| d.as_static().map(|v| acc * v))
    }

    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(|d| d.as_static()).collect()
    }

    /// A concrete shape is compatible with a pattern when ranks agree and
    /// every static dimension of the pattern matches.
    pub fn is_compatible_with(&self, pattern: &Shape) -> bool {
        self.rank() == pattern.rank()
            && self.dims.iter().zip(&pattern.dims).all(|(d, p)| match p {
                Dim::Static(_) => d == p,
                Dim::Variable(_) => true,
            })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", dims.join(","))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Bfyx,
    Byxf,
    Any,
}

impl Format {
    pub fn is_plain(&self) -> bool {
        matches!(self, Format::Bfyx)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct Layout {
    pub dtype: DataType,
    #[serde(default)]
    pub format: Format,
    #[serde(alias = "dims", with = "shape_as_dims")]
    pub shape: Shape,
}

impl Layout {
    pub fn new(dtype: DataType, dims: &[usize]) -> Self {
        Self { dtype, format: Format::Bfyx, shape: Shape::new(dims) }
    }

    pub fn with_shape(&self, shape: Shape) -> Self {
        Self { shape, ..self.clone() }
    }

    pub fn with_dtype(&self, dtype: DataType) -> Self {
        Self { dtype, ..self.clone() }
    }

    pub fn is_dynamic(&self) -> bool {
        self.shape.is_dynamic()
    }

    pub fn count(&self) -> Option<usize> {
        self.shape.count()
    }

    pub fn byte_size(&self) -> Option<usize> {
        self.count().map(|c| c * self.dtype.size())
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}:{}", self.dtype.name(), self.format, self.shape)
    }
}

// Layouts are written as `{"dtype": "F32", "shape": [1, "batch"]}` in topologies.
mod shape_as_dims {
    use super::{Dim, Shape};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(shape: &Shape, s: S) -> Result<S::Ok, S::Error> {
        shape.dims.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Shape, D::Error> {
        Ok(Shape { dims: Vec::<Dim>::deserialize(d)? })
    }
}
