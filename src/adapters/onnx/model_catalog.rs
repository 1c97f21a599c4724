use std::path::Path;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::model::ModelId;

/// Cheap checks before handing a model file to ONNX Runtime.
pub struct OnnxModelCatalog;

impl OnnxModelCatalog {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_model(&self, model: &ModelId) -> DomainResult<()> {
        if model.onnx_path.trim().is_empty() {
            return Err(DomainError::ModelLoad("model path is empty".into()));
        }
        let path = Path::new(&model.onnx_path);
        if path.extension().and_then(|e| e.to_str()) != Some("onnx") {
            return Err(DomainError::ModelLoad(format!("not an .onnx file: {}", model.onnx_path)));
        }
        let meta = std::fs::metadata(path)
            .map_err(|_| DomainError::ModelLoad(format!("model file not found: {}", model.onnx_path)))?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(DomainError::ModelLoad(format!("model file is empty: {}", model.onnx_path)));
        }
        Ok(())
    }
}

impl Default for OnnxModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(path: &str) -> ModelId {
        ModelId { name: "fall_detection".into(), onnx_path: path.into() }
    }

    #[test]
    fn rejects_empty_missing_and_foreign_paths() {
        let catalog = OnnxModelCatalog::new();
        assert!(matches!(catalog.validate_model(&model("  ")), Err(DomainError::ModelLoad(_))));
        assert!(matches!(catalog.validate_model(&model("/nonexistent/fall.onnx")), Err(DomainError::ModelLoad(_))));
        assert!(matches!(catalog.validate_model(&model("weights.pt")), Err(DomainError::ModelLoad(_))));
    }

    #[test]
    fn rejects_zero_byte_model() {
        let path = std::env::temp_dir().join(format!("fallwatch-empty-{}.onnx", std::process::id()));
        std::fs::write(&path, b"").expect("write temp model");
        let result = OnnxModelCatalog::new().validate_model(&model(&path.to_string_lossy()));
        let _ = std::fs::remove_file(&path);
        assert!(matches!(result, Err(DomainError::ModelLoad(_))));
    }
}
