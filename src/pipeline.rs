// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/pipeline.rs - 单帧处理流水线
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

use image::RgbImage;
use thiserror::Error;
use tracing::debug;

use crate::{
  aggregate::{FrameResult, aggregate},
  eval::EvalError,
  frame::Frame,
  input::InputError,
  model::{CodeDetections, Model, ModelError},
  output::OutputError,
  types::{BoundingBox, Marker, SegmentationMask},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
  #[error("模型错误: {0}")]
  Model(#[from] ModelError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("没有输入帧")]
  NoFrames,
  #[error("评估错误: {0}")]
  Eval(#[from] EvalError),
}

type Adapter<O> = Box<dyn Model<Input = RgbImage, Output = O, Error = ModelError>>;

/// 按顺序执行已配置的模型，并汇总为单帧结果
#[derive(Default)]
pub struct Pipeline {
  detector: Option<Adapter<Vec<BoundingBox>>>,
  segmenter: Option<Adapter<Vec<SegmentationMask>>>,
  marker_reader: Option<Adapter<Vec<Marker>>>,
  code_reader: Option<Adapter<CodeDetections>>,
}

impl Pipeline {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_detector(
    mut self,
    detector: impl Model<Input = RgbImage, Output = Vec<BoundingBox>, Error = ModelError> + 'static,
  ) -> Self {
    self.detector = Some(Box::new(detector));
    self
  }

  pub fn with_segmenter(
    mut self,
    segmenter: impl Model<Input = RgbImage, Output = Vec<SegmentationMask>, Error = ModelError>
    + 'static,
  ) -> Self {
    self.segmenter = Some(Box::new(segmenter));
    self
  }

  pub fn with_marker_reader(
    mut self,
    reader: impl Model<Input = RgbImage, Output = Vec<Marker>, Error = ModelError> + 'static,
  ) -> Self {
    self.marker_reader = Some(Box::new(reader));
    self
  }

  pub fn with_code_reader(
    mut self,
    reader: impl Model<Input = RgbImage, Output = CodeDetections, Error = ModelError> + 'static,
  ) -> Self {
    self.code_reader = Some(Box::new(reader));
    self
  }

  pub fn is_empty(&self) -> bool {
    self.detector.is_none()
      && self.segmenter.is_none()
      && self.marker_reader.is_none()
      && self.code_reader.is_none()
  }

  /// 处理一帧；任一模型返回错误时立即返回
  pub fn process(&self, frame: &Frame) -> Result<FrameResult, ModelError> {
    let image = &frame.image;

    let boxes = self.detector.as_ref().map(|m| m.infer(image)).transpose()?;
    let masks = self.segmenter.as_ref().map(|m| m.infer(image)).transpose()?;
    let markers = self
      .marker_reader
      .as_ref()
      .map(|m| m.infer(image))
      .transpose()?;
    let codes = self
      .code_reader
      .as_ref()
      .map(|m| m.infer(image))
      .transpose()?;

    let result = aggregate(frame.index, boxes, masks, markers, codes);
    debug!("第 {} 帧: {:?}", frame.index, result.summary());
    Ok(result)
  }
}

impl Model for Pipeline {
  type Input = Frame;
  type Output = FrameResult;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.process(input)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{FailurePolicy, MarkerReader, Segmenter};

  struct FixedDetector(Vec<BoundingBox>);

  impl Model for FixedDetector {
    type Input = RgbImage;
    type Output = Vec<BoundingBox>;
    type Error = ModelError;

    fn infer(&self, _input: &RgbImage) -> Result<Vec<BoundingBox>, ModelError> {
      Ok(self.0.clone())
    }
  }

  struct BrokenDetector;

  impl Model for BrokenDetector {
    type Input = RgbImage;
    type Output = Vec<BoundingBox>;
    type Error = ModelError;

    fn infer(&self, _input: &RgbImage) -> Result<Vec<BoundingBox>, ModelError> {
      Err(ModelError::Inference("模型崩溃".to_string()))
    }
  }

  #[test]
  fn empty_pipeline_gives_empty_result() {
    let pipeline = Pipeline::new();
    assert!(pipeline.is_empty());
    let result = pipeline
      .process(&Frame::new(RgbImage::new(8, 8), 4, 0))
      .unwrap();
    assert_eq!(result.frame, 4);
    assert!(result.is_empty());
  }

  #[test]
  fn runs_configured_adapters() {
    let pipeline = Pipeline::new()
      .with_detector(FixedDetector(vec![BoundingBox::new(9, 9, 1, 1, 0.9, 2)]))
      .with_segmenter(Segmenter::fallback())
      .with_marker_reader(MarkerReader::new());
    let result = pipeline
      .infer(&Frame::new(RgbImage::new(64, 64), 0, 0))
      .unwrap();
    assert_eq!(result.boxes.len(), 1);
    assert_eq!(result.boxes[0].x1, 1);
    assert_eq!(result.masks.len(), 1);
    assert!(result.markers.is_empty());
  }

  #[test]
  fn adapter_errors_abort_the_frame() {
    let pipeline = Pipeline::new()
      .with_detector(BrokenDetector)
      .with_segmenter(Segmenter::fallback().failure_policy(FailurePolicy::Fallback));
    assert!(matches!(
      pipeline.process(&Frame::new(RgbImage::new(8, 8), 0, 0)),
      Err(ModelError::Inference(_))
    ));
  }
}
