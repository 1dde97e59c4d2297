// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/model/yolo.rs - YOLO ONNX 推理公共部分
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

use std::path::Path;

use image::RgbImage;
use image::imageops::FilterType;
use tracing::{debug, info};
use tract_onnx::prelude::*;

use super::ModelError;
use crate::types::BoundingBox;

pub(crate) const DEFAULT_INPUT_SIZE: u32 = 640;
pub(crate) const DEFAULT_CONFIDENCE: f32 = 0.25;
pub(crate) const DEFAULT_IOU: f32 = 0.45;

type OnnxPlan = RunnableModel<TypedFact, Box<dyn TypedOp>, TypedModel>;

/// 已加载并优化的 ONNX 模型，输入为 `[1, 3, S, S]`
pub(crate) struct OnnxSession {
  plan: OnnxPlan,
  size: u32,
}

impl OnnxSession {
  pub(crate) fn load(path: &Path, size: u32) -> Result<Self, ModelError> {
    if !path.is_file() {
      return Err(ModelError::ModelLoad(format!(
        "模型文件不存在: {}",
        path.display()
      )));
    }
    info!("加载模型文件: {}", path.display());

    let s = size as usize;
    let plan = tract_onnx::onnx()
      .model_for_path(path)
      .and_then(|m| {
        m.with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, s, s)))
      })
      .and_then(|m| m.into_optimized())
      .and_then(|m| m.into_runnable())
      .map_err(|e| ModelError::ModelLoad(format!("{}: {}", path.display(), e)))?;

    info!("模型加载完成，输入尺寸 {}x{}", size, size);
    Ok(Self { plan, size })
  }

  pub(crate) fn size(&self) -> u32 {
    self.size
  }

  /// 执行推理，返回全部输出张量
  pub(crate) fn run(&self, image: &RgbImage) -> Result<TVec<TValue>, ModelError> {
    let inputs: TVec<TValue> = tvec![preprocess(image, self.size).into()];
    debug!("执行模型推理");
    self
      .plan
      .run(inputs)
      .map_err(|e| ModelError::Inference(e.to_string()))
  }
}

/// 缩放到 S×S 并转换为 NCHW、归一化到 [0, 1] 的张量
pub(crate) fn preprocess(image: &RgbImage, size: u32) -> Tensor {
  let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
  let s = size as usize;
  tract_ndarray::Array4::from_shape_fn((1, 3, s, s), |(_, c, y, x)| {
    resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
  })
  .into_tensor()
}

/// 将 `[1, F, N]` 输出视为三维数组
pub(crate) fn output_view(
  value: &TValue,
) -> Result<tract_ndarray::ArrayView3<'_, f32>, ModelError> {
  value
    .to_array_view::<f32>()
    .map_err(|e| ModelError::Inference(e.to_string()))?
    .into_dimensionality::<tract_ndarray::Ix3>()
    .map_err(|e| ModelError::Inference(format!("输出形状错误: {}", e)))
}

/// 解码前的候选框（模型输入坐标系）
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
  pub(crate) bbox: [f32; 4],
  pub(crate) score: f32,
  pub(crate) class_id: u32,
  /// 候选在模型输出中的列号
  pub(crate) anchor: usize,
}

/// 解析 `[1, 4 + C (+ extra), N]` 形式的输出
pub(crate) fn decode_candidates(
  view: &tract_ndarray::ArrayView3<'_, f32>,
  num_classes: usize,
  confidence: f32,
) -> Vec<Candidate> {
  let (_, features, anchors) = view.dim();
  let num_classes = num_classes.min(features.saturating_sub(4));
  let mut candidates = Vec::new();

  for i in 0..anchors {
    let mut best = f32::MIN;
    let mut class_id = 0usize;
    for c in 0..num_classes {
      let score = view[(0, 4 + c, i)];
      if score > best {
        best = score;
        class_id = c;
      }
    }
    if best < confidence {
      continue;
    }

    let cx = view[(0, 0, i)];
    let cy = view[(0, 1, i)];
    let w = view[(0, 2, i)];
    let h = view[(0, 3, i)];
    candidates.push(Candidate {
      bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
      score: best,
      class_id: class_id as u32,
      anchor: i,
    });
  }

  debug!("置信度过滤后剩余 {} 个候选", candidates.len());
  candidates
}

fn candidate_iou(a: &Candidate, b: &Candidate) -> f32 {
  box_iou(a.bbox, b.bbox)
}

fn box_iou(a: [f32; 4], b: [f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 按类别的非极大值抑制
pub(crate) fn nms_candidates(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut result: Vec<Candidate> = Vec::new();
  for candidate in candidates {
    let suppressed = result
      .iter()
      .any(|kept| kept.class_id == candidate.class_id && candidate_iou(kept, &candidate) >= threshold);
    if !suppressed {
      result.push(candidate);
    }
  }
  result
}

/// 计算两个检测框的 IoU
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
  box_iou(
    [a.x1 as f32, a.y1 as f32, a.x2 as f32, a.y2 as f32],
    [b.x1 as f32, b.y1 as f32, b.x2 as f32, b.y2 as f32],
  )
}

/// 对检测框按类别做非极大值抑制，保留高置信度者
pub fn nms(boxes: Vec<BoundingBox>, threshold: f32) -> Vec<BoundingBox> {
  let candidates = boxes
    .into_iter()
    .enumerate()
    .map(|(anchor, b)| Candidate {
      bbox: [b.x1 as f32, b.y1 as f32, b.x2 as f32, b.y2 as f32],
      score: b.confidence,
      class_id: b.class_id,
      anchor,
    })
    .collect();
  nms_candidates(candidates, threshold)
    .into_iter()
    .map(|c| {
      BoundingBox::new(
        c.bbox[0] as i32,
        c.bbox[1] as i32,
        c.bbox[2] as i32,
        c.bbox[3] as i32,
        c.score,
        c.class_id,
      )
    })
    .collect()
}

/// 模型坐标到原图坐标的缩放
pub(crate) fn scale_to_image(bbox: [f32; 4], size: u32, width: u32, height: u32) -> [f32; 4] {
  let sx = width as f32 / size as f32;
  let sy = height as f32 / size as f32;
  [
    (bbox[0] * sx).clamp(0.0, width as f32),
    (bbox[1] * sy).clamp(0.0, height as f32),
    (bbox[2] * sx).clamp(0.0, width as f32),
    (bbox[3] * sy).clamp(0.0, height as f32),
  ]
}

pub(crate) fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn overlapping_same_class_is_suppressed() {
    let boxes = vec![
      BoundingBox::new(0, 0, 100, 100, 0.6, 1),
      BoundingBox::new(5, 5, 105, 105, 0.9, 1),
      BoundingBox::new(5, 5, 105, 105, 0.8, 2),
      BoundingBox::new(300, 300, 350, 350, 0.5, 1),
    ];
    let kept = nms(boxes, 0.45);
    assert_eq!(kept.len(), 3);
    assert_eq!(kept[0].confidence, 0.9);
    assert_eq!(kept[1].class_id, 2);
    assert_eq!((kept[2].x1, kept[2].y1), (300, 300));
  }

  #[test]
  fn iou_of_identical_and_disjoint() {
    let a = BoundingBox::new(0, 0, 10, 10, 1.0, 0);
    let b = BoundingBox::new(20, 20, 30, 30, 1.0, 0);
    assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    assert_eq!(iou(&a, &b), 0.0);
  }

  #[test]
  fn decodes_columns_above_threshold() {
    // 2 个类别，3 个候选
    let data = vec![
      // cx
      10.0, 50.0, 90.0, //
      // cy
      10.0, 50.0, 90.0, //
      // w
      4.0, 8.0, 2.0, //
      // h
      4.0, 8.0, 2.0, //
      // class 0
      0.9, 0.1, 0.2, //
      // class 1
      0.05, 0.7, 0.1,
    ];
    let array = tract_ndarray::Array3::from_shape_vec((1, 6, 3), data).unwrap();
    let candidates = decode_candidates(&array.view(), 2, 0.25);
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].class_id, 0);
    assert_eq!(candidates[0].bbox, [8.0, 8.0, 12.0, 12.0]);
    assert_eq!(candidates[1].class_id, 1);
    assert_eq!(candidates[1].anchor, 1);
  }

  #[test]
  fn preprocess_is_nchw_unit_range() {
    let image = RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 51]));
    let tensor = preprocess(&image, 2);
    assert_eq!(tensor.shape(), &[1, 3, 2, 2]);
    let view = tensor
      .to_array_view::<f32>()
      .unwrap()
      .into_dimensionality::<tract_ndarray::Ix4>()
      .unwrap();
    assert!((view[(0, 0, 0, 0)] - 1.0).abs() < 1e-6);
    assert!(view[(0, 1, 1, 1)].abs() < 1e-6);
    assert!((view[(0, 2, 1, 0)] - 0.2).abs() < 1e-6);
  }
}
