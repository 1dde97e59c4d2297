// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/model/detector.rs - YOLO 目标检测器
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::{debug, warn};
use url::Url;

use super::yolo::{self, DEFAULT_CONFIDENCE, DEFAULT_INPUT_SIZE, DEFAULT_IOU, OnnxSession};
use super::{FailurePolicy, Model, ModelError, labels::COCO_CLASSES};
use crate::{FromUrl, FromUrlWithScheme, types::BoundingBox};

/// YOLOv8 风格的 ONNX 检测器
pub struct YoloDetector {
  session: OnnxSession,
  confidence: f32,
  iou: f32,
  num_classes: usize,
  policy: FailurePolicy,
}

#[derive(Debug, Clone)]
pub struct YoloDetectorBuilder {
  model_path: PathBuf,
  confidence: f32,
  iou: f32,
  size: u32,
  num_classes: usize,
  policy: FailurePolicy,
}

impl FromUrlWithScheme for YoloDetectorBuilder {
  const SCHEME: &'static str = "yolo";
}

impl FromUrl for YoloDetectorBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelLoad(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut builder = YoloDetectorBuilder::new(crate::url_to_path(url));
    if let Some(confidence) = crate::query_param(url, "confidence") {
      builder = builder.confidence(confidence);
    }
    if let Some(iou) = crate::query_param(url, "iou") {
      builder = builder.iou(iou);
    }
    if let Some(size) = crate::query_param(url, "size") {
      builder = builder.size(size);
    }
    if let Some(classes) = crate::query_param(url, "classes") {
      builder = builder.num_classes(classes);
    }
    Ok(builder)
  }
}

impl YoloDetectorBuilder {
  pub fn new(model_path: impl AsRef<Path>) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      confidence: DEFAULT_CONFIDENCE,
      iou: DEFAULT_IOU,
      size: DEFAULT_INPUT_SIZE,
      num_classes: COCO_CLASSES.len(),
      policy: FailurePolicy::Propagate,
    }
  }

  /// 从模型描述构造：`yolo:///path.onnx?...` 或普通文件路径
  pub fn from_descriptor(descriptor: &str) -> Result<Self, ModelError> {
    match Url::parse(descriptor) {
      Ok(url) if url.scheme() == Self::SCHEME => Self::from_url(&url),
      _ => Ok(Self::new(descriptor)),
    }
  }

  pub fn confidence(mut self, confidence: f32) -> Self {
    self.confidence = confidence.clamp(0.0, 1.0);
    self
  }

  pub fn iou(mut self, iou: f32) -> Self {
    self.iou = iou.clamp(0.0, 1.0);
    self
  }

  pub fn size(mut self, size: u32) -> Self {
    self.size = size.max(32);
    self
  }

  pub fn num_classes(mut self, num_classes: usize) -> Self {
    self.num_classes = num_classes.max(1);
    self
  }

  pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn build(self) -> Result<YoloDetector, ModelError> {
    let session = OnnxSession::load(&self.model_path, self.size)?;
    debug!(
      "检测器参数: confidence={}, iou={}, classes={}",
      self.confidence, self.iou, self.num_classes
    );
    Ok(YoloDetector {
      session,
      confidence: self.confidence,
      iou: self.iou,
      num_classes: self.num_classes,
      policy: self.policy,
    })
  }
}

impl YoloDetector {
  fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, ModelError> {
    let outputs = self.session.run(image)?;
    let first = outputs
      .first()
      .ok_or_else(|| ModelError::Inference("模型没有输出".to_string()))?;
    let view = yolo::output_view(first)?;

    let candidates = yolo::decode_candidates(&view, self.num_classes, self.confidence);
    let kept = yolo::nms_candidates(candidates, self.iou);

    let (width, height) = image.dimensions();
    let boxes: Vec<BoundingBox> = kept
      .into_iter()
      .map(|c| {
        let [x1, y1, x2, y2] = yolo::scale_to_image(c.bbox, self.session.size(), width, height);
        BoundingBox::new(
          x1.round() as i32,
          y1.round() as i32,
          x2.round() as i32,
          y2.round() as i32,
          c.score,
          c.class_id,
        )
      })
      .collect();

    debug!("检测到 {} 个物体", boxes.len());
    Ok(boxes)
  }
}

impl Model for YoloDetector {
  type Input = RgbImage;
  type Output = Vec<BoundingBox>;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    match self.detect(input) {
      Ok(boxes) => Ok(boxes),
      Err(e) if self.policy == FailurePolicy::Fallback => {
        warn!("检测失败，返回空结果: {}", e);
        Ok(Vec::new())
      }
      Err(e) => Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn url_carries_thresholds() {
    let url = Url::parse("yolo:///models/yolov8n.onnx?confidence=0.5&iou=0.6&size=320").unwrap();
    let builder = YoloDetectorBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, PathBuf::from("/models/yolov8n.onnx"));
    assert_eq!(builder.confidence, 0.5);
    assert_eq!(builder.iou, 0.6);
    assert_eq!(builder.size, 320);
  }

  #[test]
  fn plain_path_descriptor_uses_defaults() {
    let builder = YoloDetectorBuilder::from_descriptor("weights/yolov8n.onnx").unwrap();
    assert_eq!(builder.model_path, PathBuf::from("weights/yolov8n.onnx"));
    assert_eq!(builder.confidence, DEFAULT_CONFIDENCE);
    assert_eq!(builder.size, DEFAULT_INPUT_SIZE);
  }

  #[test]
  fn missing_weights_fail_to_load() {
    let err = YoloDetectorBuilder::new("/no/such/model.onnx").build().err().unwrap();
    assert!(matches!(err, ModelError::ModelLoad(_)));
  }
}
