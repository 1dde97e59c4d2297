// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/types.rs - 检测结果数据类型
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

use serde::{Deserialize, Serialize};

/// 像素坐标点，序列化为 `[x, y]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct Point {
  pub x: i32,
  pub y: i32,
}

impl Point {
  pub const fn new(x: i32, y: i32) -> Self {
    Self { x, y }
  }
}

impl From<[i32; 2]> for Point {
  fn from([x, y]: [i32; 2]) -> Self {
    Self { x, y }
  }
}

impl From<Point> for [i32; 2] {
  fn from(p: Point) -> Self {
    [p.x, p.y]
  }
}

/// 多边形质心（顶点平均），空多边形返回 None
pub fn centroid(points: &[Point]) -> Option<Point> {
  if points.is_empty() {
    return None;
  }
  let n = points.len() as i64;
  let (sx, sy) = points
    .iter()
    .fold((0i64, 0i64), |(sx, sy), p| (sx + p.x as i64, sy + p.y as i64));
  Some(Point::new((sx / n) as i32, (sy / n) as i32))
}

/// 目标检测框
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub x1: i32,
  pub y1: i32,
  pub x2: i32,
  pub y2: i32,
  pub confidence: f32,
  pub class_id: u32,
}

impl BoundingBox {
  pub fn new(x1: i32, y1: i32, x2: i32, y2: i32, confidence: f32, class_id: u32) -> Self {
    Self {
      x1,
      y1,
      x2,
      y2,
      confidence,
      class_id,
    }
  }

  /// 保证 `x1 <= x2`、`y1 <= y2`，置信度限制在 [0, 1]
  pub fn normalized(self) -> Self {
    let confidence = if self.confidence.is_nan() {
      0.0
    } else {
      self.confidence.clamp(0.0, 1.0)
    };
    Self {
      x1: self.x1.min(self.x2),
      y1: self.y1.min(self.y2),
      x2: self.x1.max(self.x2),
      y2: self.y1.max(self.y2),
      confidence,
      class_id: self.class_id,
    }
  }

  pub fn width(&self) -> i32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> i32 {
    self.y2 - self.y1
  }
}

/// 分割掩码（轮廓多边形）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationMask {
  pub segmentation: Vec<Point>,
  pub confidence: f32,
  pub class_id: u32,
}

/// 定位标记（ArUco）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
  pub id: u32,
  /// 顺时针，从标记左上角开始
  pub corners: [Point; 4],
}

/// 条码类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
  Qr,
  Barcode,
}

/// 二维码或一维条码
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
  #[serde(rename = "type")]
  pub kind: CodeKind,
  pub data: String,
  pub corners: Vec<Point>,
  /// 解码器给出的码制名称，如 `QR_CODE`、`EAN_13`
  pub symbology: String,
}
