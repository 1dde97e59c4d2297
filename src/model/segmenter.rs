// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/model/segmenter.rs - 实例分割
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

//! 实例分割
//!
//! 分割后端只负责产出二值掩码，多边形转换统一在 [`Segmenter`] 中完成。
//! 没有可用后端时分割器工作在降级模式，输出居中的矩形占位掩码。

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbImage};
use tracing::{debug, info, warn};
use url::Url;

use super::contour::mask_to_polygon;
use super::yolo::{self, DEFAULT_CONFIDENCE, DEFAULT_INPUT_SIZE, DEFAULT_IOU, OnnxSession};
use super::{FailurePolicy, Model, ModelError};
use crate::{
  FromUrl, FromUrlWithScheme,
  types::{Point, SegmentationMask},
};

/// 后端输出的单个二值掩码，尺寸与输入图像一致
#[derive(Debug, Clone)]
pub struct RawMask {
  /// 非零像素为前景
  pub mask: GrayImage,
  pub confidence: f32,
  pub class_id: u32,
}

/// 分割后端
pub trait MaskBackend {
  fn masks(&self, image: &RgbImage) -> Result<Vec<RawMask>, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterMode {
  /// 使用模型推理
  Model,
  /// 无模型，输出占位掩码
  Fallback,
}

pub struct Segmenter {
  backend: Option<Box<dyn MaskBackend>>,
  policy: FailurePolicy,
}

impl Segmenter {
  /// 降级模式的分割器
  pub fn fallback() -> Self {
    Self {
      backend: None,
      policy: FailurePolicy::Fallback,
    }
  }

  pub fn with_backend(backend: impl MaskBackend + 'static) -> Self {
    Self {
      backend: Some(Box::new(backend)),
      policy: FailurePolicy::Fallback,
    }
  }

  /// 根据模型描述构造；未给出模型时进入降级模式
  pub fn from_descriptor(descriptor: Option<&str>) -> Result<Self, ModelError> {
    match descriptor {
      Some(d) => {
        let backend = YoloSegBackendBuilder::from_descriptor(d)?.build()?;
        Ok(Self::with_backend(backend))
      }
      None => {
        warn!("未指定分割模型，使用降级模式");
        Ok(Self::fallback())
      }
    }
  }

  pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn mode(&self) -> SegmenterMode {
    if self.backend.is_some() {
      SegmenterMode::Model
    } else {
      SegmenterMode::Fallback
    }
  }

  /// 居中矩形占位掩码 `(w/4, h/4)–(3w/4, 3h/4)`
  pub fn placeholder(width: u32, height: u32) -> SegmentationMask {
    let (x1, y1) = ((width / 4) as i32, (height / 4) as i32);
    let (x2, y2) = ((3 * width / 4) as i32, (3 * height / 4) as i32);
    SegmentationMask {
      segmentation: vec![
        Point::new(x1, y1),
        Point::new(x2, y1),
        Point::new(x2, y2),
        Point::new(x1, y2),
      ],
      confidence: 1.0,
      class_id: 0,
    }
  }
}

impl Model for Segmenter {
  type Input = RgbImage;
  type Output = Vec<SegmentationMask>;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let (width, height) = input.dimensions();
    let Some(backend) = &self.backend else {
      return Ok(vec![Self::placeholder(width, height)]);
    };

    match backend.masks(input) {
      Ok(raws) => {
        let masks: Vec<SegmentationMask> = raws
          .into_iter()
          .map(|raw| SegmentationMask {
            segmentation: mask_to_polygon(&raw.mask),
            confidence: raw.confidence,
            class_id: raw.class_id,
          })
          .collect();
        debug!("分割得到 {} 个掩码", masks.len());
        Ok(masks)
      }
      Err(e) if self.policy == FailurePolicy::Fallback => {
        warn!("分割失败，使用占位掩码: {}", e);
        Ok(vec![Self::placeholder(width, height)])
      }
      Err(e) => Err(e),
    }
  }
}

/// 原型掩码通道数
const NUM_PROTOS: usize = 32;
const MASK_THRESHOLD: f32 = 0.5;

/// YOLOv8-seg ONNX 后端
pub struct YoloSegBackend {
  session: OnnxSession,
  confidence: f32,
  iou: f32,
}

#[derive(Debug, Clone)]
pub struct YoloSegBackendBuilder {
  model_path: PathBuf,
  confidence: f32,
  iou: f32,
  size: u32,
}

impl FromUrlWithScheme for YoloSegBackendBuilder {
  const SCHEME: &'static str = "yoloseg";
}

impl FromUrl for YoloSegBackendBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelLoad(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut builder = Self::new(crate::url_to_path(url));
    if let Some(confidence) = crate::query_param::<f32>(url, "confidence") {
      builder.confidence = confidence.clamp(0.0, 1.0);
    }
    if let Some(iou) = crate::query_param::<f32>(url, "iou") {
      builder.iou = iou.clamp(0.0, 1.0);
    }
    if let Some(size) = crate::query_param::<u32>(url, "size") {
      builder.size = size.max(32);
    }
    Ok(builder)
  }
}

impl YoloSegBackendBuilder {
  pub fn new(model_path: impl AsRef<Path>) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      confidence: DEFAULT_CONFIDENCE,
      iou: DEFAULT_IOU,
      size: DEFAULT_INPUT_SIZE,
    }
  }

  pub fn from_descriptor(descriptor: &str) -> Result<Self, ModelError> {
    match Url::parse(descriptor) {
      Ok(url) if url.scheme() == Self::SCHEME => Self::from_url(&url),
      _ => Ok(Self::new(descriptor)),
    }
  }

  pub fn build(self) -> Result<YoloSegBackend, ModelError> {
    let session = OnnxSession::load(&self.model_path, self.size)?;
    info!("分割模型已就绪");
    Ok(YoloSegBackend {
      session,
      confidence: self.confidence,
      iou: self.iou,
    })
  }
}

impl MaskBackend for YoloSegBackend {
  fn masks(&self, image: &RgbImage) -> Result<Vec<RawMask>, ModelError> {
    let outputs = self.session.run(image)?;
    if outputs.len() < 2 {
      return Err(ModelError::Inference(format!(
        "分割模型应有 2 个输出，实际 {}",
        outputs.len()
      )));
    }

    let preds = yolo::output_view(&outputs[0])?;
    let protos = outputs[1]
      .to_array_view::<f32>()
      .map_err(|e| ModelError::Inference(e.to_string()))?
      .into_dimensionality::<tract_onnx::prelude::tract_ndarray::Ix4>()
      .map_err(|e| ModelError::Inference(format!("原型输出形状错误: {}", e)))?;

    let (_, features, _) = preds.dim();
    if features <= 4 + NUM_PROTOS {
      return Err(ModelError::Inference(format!(
        "分割输出特征数过少: {}",
        features
      )));
    }
    let num_classes = features - 4 - NUM_PROTOS;
    let (_, proto_count, mh, mw) = protos.dim();
    if proto_count != NUM_PROTOS {
      return Err(ModelError::Inference(format!(
        "原型通道数应为 {}，实际 {}",
        NUM_PROTOS, proto_count
      )));
    }

    let candidates = yolo::decode_candidates(&preds, num_classes, self.confidence);
    let kept = yolo::nms_candidates(candidates, self.iou);

    let size = self.session.size() as f32;
    let (width, height) = image.dimensions();
    let mut masks = Vec::with_capacity(kept.len());

    for candidate in kept {
      // 框在原型坐标系中的范围
      let sx = mw as f32 / size;
      let sy = mh as f32 / size;
      let bx1 = (candidate.bbox[0] * sx).floor().clamp(0.0, mw as f32) as usize;
      let by1 = (candidate.bbox[1] * sy).floor().clamp(0.0, mh as f32) as usize;
      let bx2 = (candidate.bbox[2] * sx).ceil().clamp(0.0, mw as f32) as usize;
      let by2 = (candidate.bbox[3] * sy).ceil().clamp(0.0, mh as f32) as usize;

      let coeffs: Vec<f32> = (0..NUM_PROTOS)
        .map(|k| preds[(0, 4 + num_classes + k, candidate.anchor)])
        .collect();

      let mut small = GrayImage::new(mw as u32, mh as u32);
      for y in by1..by2 {
        for x in bx1..bx2 {
          let logit: f32 = coeffs
            .iter()
            .enumerate()
            .map(|(k, c)| c * protos[(0, k, y, x)])
            .sum();
          if yolo::sigmoid(logit) > MASK_THRESHOLD {
            small.put_pixel(x as u32, y as u32, Luma([255]));
          }
        }
      }

      let mask = image::imageops::resize(&small, width, height, FilterType::Nearest);
      masks.push(RawMask {
        mask,
        confidence: candidate.score,
        class_id: candidate.class_id,
      });
    }

    Ok(masks)
  }
}
