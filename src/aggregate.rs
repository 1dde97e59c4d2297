// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/aggregate.rs - 单帧结果汇总
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

use std::ops::AddAssign;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::model::CodeDetections;
use crate::types::{BoundingBox, Code, Marker, SegmentationMask};

/// 单帧的全部识别结果，创建后不再修改
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameResult {
  pub frame: u64,
  pub boxes: Vec<BoundingBox>,
  pub masks: Vec<SegmentationMask>,
  pub markers: Vec<Marker>,
  pub qr_codes: Vec<Code>,
  pub barcodes: Vec<Code>,
}

impl FrameResult {
  pub fn summary(&self) -> Summary {
    Summary {
      boxes: self.boxes.len(),
      masks: self.masks.len(),
      markers: self.markers.len(),
      qr_codes: self.qr_codes.len(),
      barcodes: self.barcodes.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.summary().total() == 0
  }
}

/// 各类别数量，零值也会输出
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
  pub boxes: usize,
  pub masks: usize,
  pub markers: usize,
  pub qr_codes: usize,
  pub barcodes: usize,
}

impl Summary {
  pub fn total(&self) -> usize {
    self.boxes + self.masks + self.markers + self.qr_codes + self.barcodes
  }
}

impl AddAssign for Summary {
  fn add_assign(&mut self, rhs: Self) {
    self.boxes += rhs.boxes;
    self.masks += rhs.masks;
    self.markers += rhs.markers;
    self.qr_codes += rhs.qr_codes;
    self.barcodes += rhs.barcodes;
  }
}

/// 一次运行的完整报告
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
  /// 输入源描述
  pub source: String,
  /// RFC 3339 生成时间
  pub generated_at: String,
  pub frames: Vec<FrameResult>,
}

impl Report {
  pub fn new(source: impl Into<String>) -> Self {
    Self {
      source: source.into(),
      generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
      frames: Vec::new(),
    }
  }

  pub fn push(&mut self, frame: FrameResult) {
    self.frames.push(frame);
  }

  pub fn summary(&self) -> Summary {
    let mut total = Summary::default();
    for frame in &self.frames {
      total += frame.summary();
    }
    total
  }
}

/// 合并各模型的输出，缺失的类别视为空
///
/// 检测框在此处规范化（坐标有序、置信度限制在 [0, 1]），其余类别原样保留顺序。
pub fn aggregate(
  frame: u64,
  boxes: Option<Vec<BoundingBox>>,
  masks: Option<Vec<SegmentationMask>>,
  markers: Option<Vec<Marker>>,
  codes: Option<CodeDetections>,
) -> FrameResult {
  let codes = codes.unwrap_or_default();
  FrameResult {
    frame,
    boxes: boxes
      .unwrap_or_default()
      .into_iter()
      .map(BoundingBox::normalized)
      .collect(),
    masks: masks.unwrap_or_default(),
    markers: markers.unwrap_or_default(),
    qr_codes: codes.qr_codes,
    barcodes: codes.barcodes,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{CodeKind, Point};

  #[test]
  fn absent_inputs_become_empty() {
    let result = aggregate(3, None, None, None, None);
    assert_eq!(result.frame, 3);
    assert!(result.is_empty());
    assert_eq!(result.summary(), Summary::default());
  }

  #[test]
  fn boxes_are_normalized_in_order() {
    let result = aggregate(
      0,
      Some(vec![
        BoundingBox::new(30, 30, 10, 10, 0.5, 1),
        BoundingBox::new(0, 0, 5, 5, 0.9, 2),
      ]),
      None,
      None,
      None,
    );
    assert_eq!(result.boxes[0].x1, 10);
    assert_eq!(result.boxes[0].x2, 30);
    assert_eq!(result.boxes[1].class_id, 2);
  }

  #[test]
  fn report_summary_adds_frames() {
    let code = Code {
      kind: CodeKind::Qr,
      data: "hi".to_string(),
      corners: vec![Point::new(0, 0)],
      symbology: "QR_CODE".to_string(),
    };
    let mut report = Report::new("image:a.png");
    report.push(aggregate(
      0,
      Some(vec![BoundingBox::new(0, 0, 1, 1, 1.0, 0)]),
      None,
      None,
      Some(CodeDetections {
        qr_codes: vec![code],
        barcodes: vec![],
      }),
    ));
    report.push(aggregate(1, None, None, None, None));
    let summary = report.summary();
    assert_eq!(summary.boxes, 1);
    assert_eq!(summary.qr_codes, 1);
    assert_eq!(summary.total(), 2);
  }
}
