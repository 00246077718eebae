//! TorchScript YOLO backend.
//!
//! Expects an exported YOLOv8-style module taking `[1, 3, S, S]` float input
//! and returning `[1, 4 + classes, anchors]` with centre-format boxes.

use std::{
    convert::TryFrom,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result, anyhow, bail};
use image::{RgbImage, imageops::FilterType};
use tch::{Kind, Tensor};
use tracing::{debug, info};
use video_io::Frame;

use crate::{
    annotation::annotate,
    detection::Detection,
    detector::{Detector, Inference},
    nms::non_max_suppression,
    runtime::load_torch_cuda_runtime,
    settings::{DetectionSettings, Device},
};

const MAX_DETECTIONS: usize = 300;

struct LoadedModule {
    module: tch::CModule,
    device: Device,
}

pub struct TorchDetector {
    model_path: PathBuf,
    input_size: u32,
    class_names: Vec<String>,
    loaded: Mutex<LoadedModule>,
}

impl TorchDetector {
    /// Load a TorchScript module onto the device named in `settings`.
    pub fn load(
        model_path: impl AsRef<Path>,
        input_size: u32,
        class_names: Vec<String>,
        settings: &DetectionSettings,
    ) -> Result<Self> {
        let model_path = model_path.as_ref().to_path_buf();
        let module = load_module(&model_path, settings.device)?;
        info!(
            model = %model_path.display(),
            device = %settings.device,
            classes = class_names.len(),
            "detector loaded"
        );
        Ok(Self {
            model_path,
            input_size,
            class_names,
            loaded: Mutex::new(LoadedModule {
                module,
                device: settings.device,
            }),
        })
    }

    /// Read one class name per line, skipping blanks.
    pub fn read_class_names(path: impl AsRef<Path>) -> Result<Vec<String>> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read class names from {}", path.display()))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{class_id}"))
    }

    fn frame_to_tensor(&self, frame: &Frame, device: tch::Device, half: bool) -> Result<Tensor> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
        let size = self.input_size;
        let resized = image::imageops::resize(&image, size, size, FilterType::Triangle);
        let kind = if half { Kind::Half } else { Kind::Float };
        let tensor = Tensor::from_slice(resized.as_raw())
            .to_device(device)
            .view([1, size as i64, size as i64, 3])
            .permute([0, 3, 1, 2])
            .to_kind(Kind::Float)
            / 255.0;
        Ok(tensor.to_kind(kind))
    }

    fn decode_output(
        &self,
        output: &Tensor,
        frame: &Frame,
        settings: &DetectionSettings,
    ) -> Result<Vec<Detection>> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[1] < 5 {
            bail!(
                "detector output requires at least 5 channels (cx,cy,w,h,score), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(tch::Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let scale_x = frame.width as f32 / self.input_size as f32;
        let scale_y = frame.height as f32 / self.input_size as f32;
        let mut candidates = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < settings.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            candidates.push(Detection {
                label: self.class_name(class_id),
                confidence: score,
                bbox: [
                    ((cx - w / 2.0) * scale_x).max(0.0),
                    ((cy - h / 2.0) * scale_y).max(0.0),
                    ((cx + w / 2.0) * scale_x).min(frame.width as f32),
                    ((cy + h / 2.0) * scale_y).min(frame.height as f32),
                ],
            });
        }

        Ok(non_max_suppression(
            candidates,
            settings.iou_threshold,
            MAX_DETECTIONS,
        ))
    }
}

impl Detector for TorchDetector {
    fn configure(&self, settings: &DetectionSettings) -> Result<()> {
        let mut loaded = self
            .loaded
            .lock()
            .map_err(|_| anyhow!("detector state poisoned"))?;
        if loaded.device != settings.device {
            debug!(from = %loaded.device, to = %settings.device, "moving detector");
            loaded.module = load_module(&self.model_path, settings.device)?;
            loaded.device = settings.device;
        }
        Ok(())
    }

    fn infer(&self, frame: &Frame, settings: &DetectionSettings) -> Result<Inference> {
        let loaded = self
            .loaded
            .lock()
            .map_err(|_| anyhow!("detector state poisoned"))?;
        let device = torch_device(loaded.device);
        let half = settings.half && loaded.device != Device::Cpu;
        let input = self.frame_to_tensor(frame, device, half)?;
        let output = tch::no_grad(|| loaded.module.forward_ts(&[input]))
            .context("detector forward pass failed")?;
        drop(loaded);

        let detections = self.decode_output(&output, frame, settings)?;
        Ok(Inference {
            annotated: annotate(frame, &detections),
            detections,
        })
    }
}

fn torch_device(device: Device) -> tch::Device {
    match device {
        Device::Cpu => tch::Device::Cpu,
        Device::Cuda(index) => tch::Device::Cuda(index),
    }
}

fn load_module(path: &Path, device: Device) -> Result<tch::CModule> {
    if let Device::Cuda(_) = device {
        load_torch_cuda_runtime();
        if !tch::Cuda::is_available() {
            bail!("device {device} requested but CUDA is not available");
        }
    }
    tch::CModule::load_on_device(path, torch_device(device))
        .with_context(|| format!("failed to load TorchScript model {}", path.display()))
}
