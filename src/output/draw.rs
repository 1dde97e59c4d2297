// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/output/draw.rs - 识别结果可视化
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

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
  draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_polygon_mut,
  draw_text_mut, text_size,
};
use imageproc::point::Point as IPoint;
use imageproc::rect::Rect;

use crate::aggregate::FrameResult;
use crate::model::labels::class_name;
use crate::types::{BoundingBox, Code, CodeKind, Marker, Point, SegmentationMask, centroid};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_PADDING: i32 = 2;
const MASK_ALPHA: f32 = 0.4;
const MAX_PAYLOAD_CHARS: usize = 20;

const QR_KEY_OFFSET: u64 = 1 << 40;
const BARCODE_KEY_OFFSET: u64 = 1 << 41;

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
  let mut hasher = DefaultHasher::new();
  value.hash(&mut hasher);
  hasher.finish()
}

/// 实体标识到颜色的映射，只增不改，可整体重置
#[derive(Debug, Default, Clone)]
pub struct ColorAssigner {
  colors: HashMap<u64, Rgb<u8>>,
}

impl ColorAssigner {
  pub fn new() -> Self {
    Self::default()
  }

  /// 获取标识对应的颜色，首次出现时生成
  pub fn color_for(&mut self, key: u64) -> Rgb<u8> {
    *self.colors.entry(key).or_insert_with(|| {
      let hue = (hash_of(&key) % 360) as f32;
      hsv_to_rgb(hue, 0.8, 0.9)
    })
  }

  pub fn reset(&mut self) {
    self.colors.clear();
  }

  pub fn len(&self) -> usize {
    self.colors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.colors.is_empty()
  }
}

/// 检测框标识：坐标哈希，坐标相同的框颜色相同
pub fn box_key(b: &BoundingBox) -> u64 {
  hash_of(&(b.x1, b.y1, b.x2, b.y2))
}

/// 掩码标识：多边形哈希
pub fn mask_key(m: &SegmentationMask) -> u64 {
  hash_of(&m.segmentation)
}

pub fn marker_key(m: &Marker) -> u64 {
  m.id as u64
}

pub fn code_key(kind: CodeKind, index: usize) -> u64 {
  match kind {
    CodeKind::Qr => QR_KEY_OFFSET + index as u64,
    CodeKind::Barcode => BARCODE_KEY_OFFSET + index as u64,
  }
}

/// 结果标注器，持有字体与颜色缓存
pub struct Annotator {
  font: FontArc,
  scale: PxScale,
  colors: ColorAssigner,
}

/// 内嵌的 DejaVu Sans 字体
pub(crate) fn embedded_font() -> FontArc {
  let font_data = include_bytes!("../../assets/DejaVuSans.ttf");
  FontArc::try_from_slice(font_data).expect("无法加载嵌入的字体文件")
}

impl Default for Annotator {
  fn default() -> Self {
    Self {
      font: embedded_font(),
      scale: PxScale::from(LABEL_FONT_SIZE),
      colors: ColorAssigner::new(),
    }
  }
}

impl Annotator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn colors(&self) -> &ColorAssigner {
    &self.colors
  }

  pub fn reset_colors(&mut self) {
    self.colors.reset();
  }

  /// 在帧的副本上绘制全部结果，输入图像不变，输出尺寸相同
  pub fn annotate(&mut self, frame: &RgbImage, result: &FrameResult) -> RgbImage {
    let mut image = frame.clone();

    for mask in &result.masks {
      self.draw_mask(&mut image, mask);
    }
    for bbox in &result.boxes {
      self.draw_box(&mut image, bbox);
    }
    for marker in &result.markers {
      self.draw_marker(&mut image, marker);
    }
    for (index, code) in result.qr_codes.iter().enumerate() {
      self.draw_code(&mut image, code, index);
    }
    for (index, code) in result.barcodes.iter().enumerate() {
      self.draw_code(&mut image, code, index);
    }

    image
  }

  fn draw_box(&mut self, image: &mut RgbImage, bbox: &BoundingBox) {
    let color = self.colors.color_for(box_key(bbox));
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = bbox.x1.clamp(0, w - 1);
    let y_min = bbox.y1.clamp(0, h - 1);
    let x_max = bbox.x2.clamp(0, w - 1);
    let y_max = bbox.y2.clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 边框加粗为 2 像素
    for thickness in 0..2 {
      let width = (x_max - x_min + 1 - 2 * thickness).max(1) as u32;
      let height = (y_max - y_min + 1 - 2 * thickness).max(1) as u32;
      let rect = Rect::at(x_min + thickness, y_min + thickness).of_size(width, height);
      draw_hollow_rect_mut(image, rect, color);
    }

    let label = format!("{} {:.2}", class_name(bbox.class_id), bbox.confidence);
    let (_, text_h) = text_size(self.scale, &self.font, &label);
    let label_y = y_min - text_h as i32 - 2 * LABEL_PADDING;
    self.draw_label(image, x_min, label_y.max(0), &label, color);
  }

  fn draw_mask(&mut self, image: &mut RgbImage, mask: &SegmentationMask) {
    let Some(first) = mask.segmentation.first().copied() else {
      return;
    };
    let color = self.colors.color_for(mask_key(mask));

    let mut polygon: Vec<IPoint<i32>> = mask
      .segmentation
      .iter()
      .map(|p| IPoint::new(p.x, p.y))
      .collect();
    polygon.dedup();
    if polygon.len() > 1 && polygon.first() == polygon.last() {
      polygon.pop();
    }

    if polygon.len() >= 3 {
      let mut overlay = image.clone();
      draw_polygon_mut(&mut overlay, &polygon, color);
      blend(image, &overlay, MASK_ALPHA);
    }

    draw_outline(image, &mask.segmentation, color);
    self.draw_label(
      image,
      first.x,
      first.y,
      &format!("{:.2}", mask.confidence),
      color,
    );
  }

  fn draw_marker(&mut self, image: &mut RgbImage, marker: &Marker) {
    let color = self.colors.color_for(marker_key(marker));
    draw_outline(image, &marker.corners, color);
    if let Some(center) = centroid(&marker.corners) {
      self.draw_label(image, center.x, center.y, &format!("id={}", marker.id), color);
    }
  }

  fn draw_code(&mut self, image: &mut RgbImage, code: &Code, index: usize) {
    let color = self.colors.color_for(code_key(code.kind, index));
    draw_outline(image, &code.corners, color);

    let prefix = match code.kind {
      CodeKind::Qr => "QR",
      CodeKind::Barcode => "BC",
    };
    let label = format!("{}:{}", prefix, truncate_payload(&code.data));
    if let Some(center) = centroid(&code.corners) {
      self.draw_label(image, center.x, center.y, &label, color);
    }
  }

  /// 带底色的白字标签
  fn draw_label(&self, image: &mut RgbImage, x: i32, y: i32, text: &str, background: Rgb<u8>) {
    let (text_w, text_h) = text_size(self.scale, &self.font, text);
    let width = text_w + 2 * LABEL_PADDING as u32;
    let height = text_h + 2 * LABEL_PADDING as u32;
    if width == 0 || height == 0 {
      return;
    }

    draw_filled_rect_mut(image, Rect::at(x, y).of_size(width, height), background);
    draw_text_mut(
      image,
      Rgb([255u8, 255u8, 255u8]),
      x + LABEL_PADDING,
      y + LABEL_PADDING,
      self.scale,
      &self.font,
      text,
    );
  }
}

/// 闭合折线轮廓
fn draw_outline(image: &mut RgbImage, points: &[Point], color: Rgb<u8>) {
  if points.len() < 2 {
    return;
  }
  for (a, b) in points.iter().zip(points.iter().cycle().skip(1)) {
    draw_line_segment_mut(
      image,
      (a.x as f32, a.y as f32),
      (b.x as f32, b.y as f32),
      color,
    );
  }
}

/// `base = (1 - alpha) * base + alpha * overlay`
fn blend(base: &mut RgbImage, overlay: &RgbImage, alpha: f32) {
  for (dst, src) in base.pixels_mut().zip(overlay.pixels()) {
    for c in 0..3 {
      let mixed = (1.0 - alpha) * dst[c] as f32 + alpha * src[c] as f32;
      dst[c] = mixed.round().clamp(0.0, 255.0) as u8;
    }
  }
}

fn truncate_payload(data: &str) -> String {
  if data.chars().count() > MAX_PAYLOAD_CHARS {
    let head: String = data.chars().take(MAX_PAYLOAD_CHARS).collect();
    format!("{}…", head)
  } else {
    data.to_string()
  }
}
