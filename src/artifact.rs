//! Model Artifact - immutable handle to a model representation

use crate::hash::Fingerprint;
use crate::value::OptionValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Model representation tag.
///
/// Passes declare which formats they accept and which they produce; the
/// flow validator uses these tags to check chain compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelFormat {
    /// PyTorch module or checkpoint
    #[serde(rename = "pytorch")]
    PyTorch,
    /// Hugging Face model directory
    #[serde(rename = "huggingface")]
    HuggingFace,
    /// ONNX graph
    #[serde(rename = "onnx")]
    Onnx,
    /// OpenVINO IR
    #[serde(rename = "openvino")]
    OpenVino,
    /// Any other format, tagged by name
    #[serde(untagged)]
    Other(String),
}

impl ModelFormat {
    /// Parse an input model `type` string (e.g. `"PyTorchModel"`, `"onnx"`).
    #[must_use]
    pub fn from_model_type(model_type: &str) -> Self {
        let lower = model_type.to_ascii_lowercase();
        let trimmed = lower.strip_suffix("model").unwrap_or(&lower);
        match trimmed {
            "pytorch" => Self::PyTorch,
            "hf" | "huggingface" => Self::HuggingFace,
            "onnx" => Self::Onnx,
            "openvino" => Self::OpenVino,
            _ => Self::Other(model_type.to_string()),
        }
    }

    /// Format name as string
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PyTorch => "pytorch",
            Self::HuggingFace => "huggingface",
            Self::Onnx => "onnx",
            Self::OpenVino => "openvino",
            Self::Other(name) => name,
        }
    }
}

impl std::fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable handle to a model representation.
///
/// Artifacts are never mutated in place: every pass produces a new one.
/// The `id` is a content fingerprint; for the input model it is derived
/// from the model config, for pass outputs it is the cache key of the
/// producing pass invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelArtifact {
    id: Fingerprint,
    path: PathBuf,
    format: ModelFormat,
    #[serde(default)]
    metadata: BTreeMap<String, OptionValue>,
}

impl ModelArtifact {
    /// Create an artifact handle.
    ///
    /// # Arguments
    ///
    /// * `id` - Content fingerprint identifying the artifact
    /// * `path` - On-disk location of the model (file or directory)
    /// * `format` - Representation tag
    #[must_use]
    pub fn new(id: Fingerprint, path: impl Into<PathBuf>, format: ModelFormat) -> Self {
        Self {
            id,
            path: path.into(),
            format,
            metadata: BTreeMap::new(),
        }
    }

    /// Create the handle for an unmodified input model.
    ///
    /// The id is derived from the path, format and metadata so repeated
    /// runs over the same input share cache entries.
    #[must_use]
    pub fn input(
        path: impl Into<PathBuf>,
        format: ModelFormat,
        metadata: BTreeMap<String, OptionValue>,
    ) -> Self {
        let path = path.into();
        let meta = OptionValue::Map(metadata.clone());
        let id = Fingerprint::of_parts(&[
            "input-model",
            &path.to_string_lossy(),
            format.as_str(),
            &meta.canonical(),
        ]);
        Self {
            id,
            path,
            format,
            metadata,
        }
    }

    /// Return a copy with one metadata entry added.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Return a copy relocated to `path` (used when persisting outputs).
    #[must_use]
    pub fn relocated(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }

    /// Return a copy carrying a different id.
    #[must_use]
    pub fn with_id(&self, id: Fingerprint) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }

    /// Get the content fingerprint.
    #[must_use]
    pub const fn id(&self) -> Fingerprint {
        self.id
    }

    /// Get the model path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the format tag.
    #[must_use]
    pub const fn format(&self) -> &ModelFormat {
        &self.format
    }

    /// Get the metadata map.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, OptionValue> {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_format_from_type() {
        assert_eq!(ModelFormat::from_model_type("PyTorchModel"), ModelFormat::PyTorch);
        assert_eq!(ModelFormat::from_model_type("ONNXModel"), ModelFormat::Onnx);
        assert_eq!(ModelFormat::from_model_type("HfModel"), ModelFormat::HuggingFace);
        assert_eq!(
            ModelFormat::from_model_type("TensorFlowModel"),
            ModelFormat::Other("TensorFlowModel".to_string())
        );
    }

    #[test]
    fn test_input_id_is_deterministic() {
        let a = ModelArtifact::input("model.pt", ModelFormat::PyTorch, BTreeMap::new());
        let b = ModelArtifact::input("model.pt", ModelFormat::PyTorch, BTreeMap::new());
        let c = ModelArtifact::input("other.pt", ModelFormat::PyTorch, BTreeMap::new());
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_relocated_keeps_identity() {
        let a = ModelArtifact::input("model.onnx", ModelFormat::Onnx, BTreeMap::new())
            .with_metadata("opset", 17_i64);
        let moved = a.relocated("out/model.onnx");
        assert_eq!(moved.id(), a.id());
        assert_eq!(moved.path(), Path::new("out/model.onnx"));
        assert_eq!(moved.metadata().get("opset"), Some(&OptionValue::Int(17)));
    }

    #[test]
    fn test_artifact_serialization() {
        let a = ModelArtifact::input("model.onnx", ModelFormat::Onnx, BTreeMap::new());
        let json = serde_json::to_string(&a).expect("serialization failed");
        let back: ModelArtifact = serde_json::from_str(&json).expect("deserialization failed");
        assert_eq!(a, back);
    }
}
