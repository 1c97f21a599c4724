use std::fs;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use image::{imageops::FilterType, RgbImage};
use ndarray::{s, Array4, ArrayViewD, Axis, IxDyn};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use ort::value::Value;

use crate::application::lock_unpoisoned;
use crate::application::ports::ObjectDetector;
use crate::domain::{
    detection::Detection,
    errors::{DomainError, DomainResult},
    model::InferenceConfig,
};

/// YOLOv8-style detector on ONNX Runtime. Output layout `[1, 4 + classes, candidates]`.
pub struct OnnxYoloEngine {
    // `run` needs exclusive access; sessions share one engine.
    session: Mutex<Session>,
    config: InferenceConfig,
}

impl OnnxYoloEngine {
    pub fn load(config: InferenceConfig) -> DomainResult<Self> {
        let session = Self::build_session(&config.model.onnx_path)
            .map_err(|e| DomainError::ModelLoad(format!("{}: {e}", config.model.onnx_path)))?;
        tracing::info!(
            model = %config.model.name,
            path = %config.model.onnx_path,
            classes = config.class_labels.len(),
            "detector loaded"
        );
        Ok(Self {
            session: Mutex::new(session),
            config,
        })
    }

    fn build_session(path: &str) -> Result<Session> {
        let mut builder = Session::builder()?.with_intra_threads(4)?;

        // CUDA when available, CPU otherwise.
        let cuda = CUDAExecutionProvider::default().build();
        if let Ok(builder_with_cuda) = builder.clone().with_execution_providers([cuda]) {
            builder = builder_with_cuda;
        }

        let model_bytes = fs::read(path)?;
        Ok(builder.commit_from_memory(&model_bytes)?)
    }

    fn infer(&self, rgb: &RgbImage) -> Result<Vec<Detection>> {
        let params = &self.config.params;
        let imgsz = params.input_size as usize;
        let resized = image::imageops::resize(rgb, imgsz as u32, imgsz as u32, FilterType::Nearest);

        let mut input = Array4::<f32>::zeros((1, 3, imgsz, imgsz));
        for (x, y, pixel) in resized.enumerate_pixels() {
            input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
            input[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
            input[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
        }

        let input_shape = vec![1, 3, imgsz as i64, imgsz as i64];
        let input_tensor = Value::from_array((input_shape, input.into_raw_vec()))?;

        let mut session = lock_unpoisoned(&self.session);
        let outputs = session.run(ort::inputs![input_tensor])?;
        let (shape_out, data_out) = outputs[0].try_extract_tensor::<f32>()?;

        let dims: Vec<usize> = shape_out.iter().map(|&x| x as usize).collect();
        if dims.len() != 3 || dims[1] < 5 {
            return Err(anyhow!("unexpected output shape {dims:?}"));
        }
        let array_view = ArrayViewD::from_shape(IxDyn(&dims), data_out)?;
        let view = array_view.index_axis(Axis(0), 0);

        let sx = rgb.width() as f32 / imgsz as f32;
        let sy = rgb.height() as f32 / imgsz as f32;
        Ok(decode_candidates(view, sx, sy, params.conf_threshold, params.max_detections, |id| {
            self.config.label_for(id)
        }))
    }
}

impl ObjectDetector for OnnxYoloEngine {
    fn detect(&self, image: &RgbImage) -> DomainResult<Vec<Detection>> {
        self.infer(image).map_err(|e| DomainError::Detector(e.to_string()))
    }
}

/// Rows 0..4 are cx, cy, w, h in input pixels; the rest are class scores.
fn decode_candidates(
    view: ArrayViewD<'_, f32>,
    sx: f32,
    sy: f32,
    conf_threshold: f32,
    max_detections: usize,
    label_for: impl Fn(usize) -> String,
) -> Vec<Detection> {
    let num_candidates = view.shape()[1];
    let mut detections = Vec::new();

    for i in 0..num_candidates {
        let scores = view.slice(s![4.., i]);
        let Some((class_id, &max_score)) = scores
            .indexed_iter()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
        else {
            continue;
        };

        if max_score > conf_threshold {
            let cx = view[[0, i]];
            let cy = view[[1, i]];
            let w = view[[2, i]];
            let h = view[[3, i]];

            detections.push(Detection {
                x1: (cx - w / 2.0) * sx,
                y1: (cy - h / 2.0) * sy,
                x2: (cx + w / 2.0) * sx,
                y2: (cy + h / 2.0) * sy,
                score: max_score,
                class_id,
                label: label_for(class_id),
            });
        }
    }

    detections.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
    detections.truncate(max_detections);
    detections
}
