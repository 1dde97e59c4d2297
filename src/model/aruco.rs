// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/model/aruco.rs - ArUco 定位标记识别
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

//! ArUco 定位标记识别
//!
//! 使用原始 ArUco 5×5 字典（1024 个 id）。标记共 7×7 格，最外一圈为黑色边框，
//! 内部每行 5 格是四个码字之一，码字第 1、3 位携带 2 位数据，
//! 五行拼接得到 10 位 id（第 0 行为最高位）。白色格为 1。
//!
//! 流程：灰度化 → 自适应阈值 → 外轮廓 → 四边形拟合 → 透视采样 7×7 网格 →
//! 边框校验 → 四个方向尝试解码。

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{BorderType, find_contours};
use imageproc::filter::box_filter;
use imageproc::geometry::arc_length;
use imageproc::point::Point as IPoint;
use tracing::{debug, warn};

use super::contour::simplify_closed;
use super::{FailurePolicy, Model, ModelError};
use crate::types::{Marker, Point};

/// 标记总格数（含边框）
pub const MARKER_CELLS: usize = 7;
const DATA_CELLS: usize = 5;
/// 字典大小
pub const DICTIONARY_SIZE: u32 = 1 << (2 * DATA_CELLS);

const WORDS: [[u8; DATA_CELLS]; 4] = [
  [1, 0, 0, 0, 0],
  [1, 0, 1, 1, 1],
  [0, 1, 0, 0, 1],
  [0, 1, 1, 1, 0],
];

type Grid = [[u8; MARKER_CELLS]; MARKER_CELLS];

pub struct MarkerReader {
  /// 自适应阈值窗口半径
  block_radius: u32,
  /// 比局部均值暗多少才算前景
  offset: i16,
  /// 最短边长（像素）
  min_side: f64,
  /// 网格采样的最小明暗差
  min_contrast: f32,
  policy: FailurePolicy,
}

impl Default for MarkerReader {
  fn default() -> Self {
    Self {
      block_radius: 15,
      offset: 7,
      min_side: 10.0,
      min_contrast: 30.0,
      policy: FailurePolicy::Propagate,
    }
  }
}

impl MarkerReader {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn min_side(mut self, min_side: f64) -> Self {
    self.min_side = min_side.max(4.0);
    self
  }

  fn detect(&self, image: &RgbImage) -> Result<Vec<Marker>, ModelError> {
    if image.width() == 0 || image.height() == 0 {
      return Err(ModelError::Inference("空图像".to_string()));
    }

    let gray = image::imageops::grayscale(image);
    let binary = self.threshold(&gray);

    let mut markers: Vec<Marker> = Vec::new();
    let min_perimeter = (4.0 * self.min_side) as usize;

    for contour in find_contours::<i32>(&binary) {
      if contour.border_type != BorderType::Outer || contour.points.len() < min_perimeter {
        continue;
      }
      let Some(quad) = self.fit_quad(&contour.points) else {
        continue;
      };
      let Some(grid) = self.sample_grid(&gray, &quad) else {
        continue;
      };
      let Some((id, rotation)) = decode_grid(&grid) else {
        continue;
      };

      let corners = rotate_corners(quad, rotation);
      let marker = Marker {
        id,
        corners: corners.map(|(x, y)| Point::new(x.round() as i32, y.round() as i32)),
      };

      if markers.iter().any(|m| is_duplicate(m, &marker, self.min_side)) {
        continue;
      }
      debug!("识别到标记 id={}", id);
      markers.push(marker);
    }

    Ok(markers)
  }

  /// 自适应阈值：比局部均值暗 `offset` 以上的像素为前景
  fn threshold(&self, gray: &GrayImage) -> GrayImage {
    let mean = box_filter(gray, self.block_radius, self.block_radius);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
      let g = gray.get_pixel(x, y)[0] as i16;
      let m = mean.get_pixel(x, y)[0] as i16;
      if g + self.offset < m {
        Luma([255])
      } else {
        Luma([0])
      }
    })
  }

  /// 拟合凸四边形，角点按图像坐标顺时针排列
  fn fit_quad(&self, points: &[IPoint<i32>]) -> Option<[(f64, f64); 4]> {
    let epsilon = 0.05 * arc_length(points, true);
    let polygon = simplify_closed(points, epsilon);
    if polygon.len() != 4 {
      return None;
    }

    let mut quad = [(0.0, 0.0); 4];
    for (slot, p) in quad.iter_mut().zip(&polygon) {
      *slot = (p.x as f64, p.y as f64);
    }

    if !is_convex(&quad) {
      return None;
    }
    for i in 0..4 {
      let (ax, ay) = quad[i];
      let (bx, by) = quad[(i + 1) % 4];
      if ((bx - ax).powi(2) + (by - ay).powi(2)).sqrt() < self.min_side {
        return None;
      }
    }

    if cross(quad[0], quad[1], quad[2]) < 0.0 {
      quad.swap(1, 3);
    }
    Some(quad)
  }

  /// 透视采样 7×7 网格，每格取中心附近 3×3 点的均值
  fn sample_grid(&self, gray: &GrayImage, quad: &[(f64, f64); 4]) -> Option<Grid> {
    let homography = Homography::square_to_quad(quad)?;
    let n = MARKER_CELLS as f64;
    let mut means = [[0f32; MARKER_CELLS]; MARKER_CELLS];

    for (r, row) in means.iter_mut().enumerate() {
      for (c, cell) in row.iter_mut().enumerate() {
        let mut sum = 0f32;
        for dv in [-0.25, 0.0, 0.25] {
          for du in [-0.25, 0.0, 0.25] {
            let u = (c as f64 + 0.5 + du) / n;
            let v = (r as f64 + 0.5 + dv) / n;
            let (x, y) = homography.map(u, v);
            let px = (x.round().max(0.0) as u32).min(gray.width() - 1);
            let py = (y.round().max(0.0) as u32).min(gray.height() - 1);
            sum += gray.get_pixel(px, py)[0] as f32;
          }
        }
        *cell = sum / 9.0;
      }
    }

    let (lo, hi) = means
      .iter()
      .flatten()
      .fold((f32::MAX, f32::MIN), |(lo, hi), &m| (lo.min(m), hi.max(m)));
    if hi - lo < self.min_contrast {
      return None;
    }
    let split = (lo + hi) / 2.0;

    let mut grid = [[0u8; MARKER_CELLS]; MARKER_CELLS];
    for (r, row) in grid.iter_mut().enumerate() {
      for (c, bit) in row.iter_mut().enumerate() {
        *bit = u8::from(means[r][c] > split);
      }
    }

    let last = MARKER_CELLS - 1;
    for i in 0..MARKER_CELLS {
      if grid[0][i] != 0 || grid[last][i] != 0 || grid[i][0] != 0 || grid[i][last] != 0 {
        return None;
      }
    }
    Some(grid)
  }
}

impl Model for MarkerReader {
  type Input = RgbImage;
  type Output = Vec<Marker>;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    match self.detect(input) {
      Ok(markers) => Ok(markers),
      Err(e) if self.policy == FailurePolicy::Fallback => {
        warn!("标记识别失败，返回空结果: {}", e);
        Ok(Vec::new())
      }
      Err(e) => Err(e),
    }
  }
}

/// 单位正方形到四边形的透视变换
struct Homography {
  a: f64,
  b: f64,
  c: f64,
  d: f64,
  e: f64,
  f: f64,
  g: f64,
  h: f64,
}

impl Homography {
  /// (0,0)、(1,0)、(1,1)、(0,1) 依次映射到四个角点
  fn square_to_quad(q: &[(f64, f64); 4]) -> Option<Self> {
    let [(x0, y0), (x1, y1), (x2, y2), (x3, y3)] = *q;
    let (dx1, dy1) = (x1 - x2, y1 - y2);
    let (dx2, dy2) = (x3 - x2, y3 - y2);
    let (dx3, dy3) = (x0 - x1 + x2 - x3, y0 - y1 + y2 - y3);

    let den = dx1 * dy2 - dx2 * dy1;
    if den.abs() < 1e-9 {
      return None;
    }
    let g = (dx3 * dy2 - dx2 * dy3) / den;
    let h = (dx1 * dy3 - dx3 * dy1) / den;

    Some(Self {
      a: x1 - x0 + g * x1,
      b: x3 - x0 + h * x3,
      c: x0,
      d: y1 - y0 + g * y1,
      e: y3 - y0 + h * y3,
      f: y0,
      g,
      h,
    })
  }

  fn map(&self, u: f64, v: f64) -> (f64, f64) {
    let w = self.g * u + self.h * v + 1.0;
    (
      (self.a * u + self.b * v + self.c) / w,
      (self.d * u + self.e * v + self.f) / w,
    )
  }
}

fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
  (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

fn is_convex(quad: &[(f64, f64); 4]) -> bool {
  let signs: Vec<f64> = (0..4)
    .map(|i| cross(quad[i], quad[(i + 1) % 4], quad[(i + 2) % 4]))
    .collect();
  signs.iter().all(|&s| s > 0.0) || signs.iter().all(|&s| s < 0.0)
}

/// 顺时针旋转 90°
fn rotate_cw(grid: &Grid) -> Grid {
  let n = MARKER_CELLS;
  let mut out = [[0u8; MARKER_CELLS]; MARKER_CELLS];
  for (r, row) in out.iter_mut().enumerate() {
    for (c, cell) in row.iter_mut().enumerate() {
      *cell = grid[n - 1 - c][r];
    }
  }
  out
}

/// 解码内部 5×5 数据区，返回 id 与所需的顺时针旋转次数
fn decode_grid(grid: &Grid) -> Option<(u32, usize)> {
  let mut current = *grid;
  for rotation in 0..4 {
    if let Some(id) = decode_data(&current) {
      return Some((id, rotation));
    }
    current = rotate_cw(&current);
  }
  None
}

fn decode_data(grid: &Grid) -> Option<u32> {
  let mut id = 0u32;
  for row in grid.iter().skip(1).take(DATA_CELLS) {
    let bits = &row[1..=DATA_CELLS];
    if !WORDS.iter().any(|w| w[..] == *bits) {
      return None;
    }
    id = (id << 2) | (u32::from(bits[1]) << 1) | u32::from(bits[3]);
  }
  Some(id)
}

/// 旋转 k 次后，新的第 i 个角点是原来的第 (i + 4 - k) % 4 个
fn rotate_corners(quad: [(f64, f64); 4], rotation: usize) -> [(f64, f64); 4] {
  std::array::from_fn(|i| quad[(i + 4 - rotation % 4) % 4])
}

fn marker_center(m: &Marker) -> (f64, f64) {
  let (sx, sy) = m
    .corners
    .iter()
    .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
  (sx / 4.0, sy / 4.0)
}

fn is_duplicate(a: &Marker, b: &Marker, tolerance: f64) -> bool {
  let (ax, ay) = marker_center(a);
  let (bx, by) = marker_center(b);
  a.id == b.id && ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt() < tolerance
}

/// 生成标记图像（含黑色边框），每格 `cell` 像素；id 超出字典时返回 None
pub fn generate_marker(id: u32, cell: u32) -> Option<GrayImage> {
  if id >= DICTIONARY_SIZE || cell == 0 {
    return None;
  }

  let mut grid = [[0u8; MARKER_CELLS]; MARKER_CELLS];
  for r in 0..DATA_CELLS {
    let word = WORDS[((id >> (2 * (DATA_CELLS - 1 - r))) & 3) as usize];
    grid[r + 1][1..=DATA_CELLS].copy_from_slice(&word);
  }

  let size = cell * MARKER_CELLS as u32;
  Some(GrayImage::from_fn(size, size, |x, y| {
    let bit = grid[(y / cell) as usize][(x / cell) as usize];
    Luma([if bit == 1 { 255 } else { 0 }])
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn canvas_with_marker(id: u32) -> RgbImage {
    let marker = generate_marker(id, 20).unwrap();
    let mut canvas = RgbImage::from_pixel(256, 256, Rgb([255, 255, 255]));
    for (x, y, p) in marker.enumerate_pixels() {
      canvas.put_pixel(x + 58, y + 58, Rgb([p[0], p[0], p[0]]));
    }
    canvas
  }

  fn near(p: Point, x: i32, y: i32) -> bool {
    (p.x - x).abs() <= 3 && (p.y - y).abs() <= 3
  }

  #[test]
  fn generated_grid_round_trips() {
    for id in [0, 1, 7, 512, 1023] {
      let marker = generate_marker(id, 1).unwrap();
      let mut grid = [[0u8; MARKER_CELLS]; MARKER_CELLS];
      for (x, y, p) in marker.enumerate_pixels() {
        grid[y as usize][x as usize] = u8::from(p[0] > 0);
      }
      assert_eq!(decode_grid(&grid), Some((id, 0)));
    }
    assert!(generate_marker(DICTIONARY_SIZE, 4).is_none());
  }

  #[test]
  fn reads_marker_seven() {
    let markers = MarkerReader::new().infer(&canvas_with_marker(7)).unwrap();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].id, 7);
    let c = markers[0].corners;
    assert!(near(c[0], 58, 58), "{:?}", c);
    assert!(near(c[1], 197, 58), "{:?}", c);
    assert!(near(c[2], 197, 197), "{:?}", c);
    assert!(near(c[3], 58, 197), "{:?}", c);
  }

  #[test]
  fn rotated_marker_keeps_its_top_left() {
    let rotated = image::imageops::rotate90(&canvas_with_marker(7));
    let markers = MarkerReader::new().infer(&rotated).unwrap();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].id, 7);
    assert!(near(markers[0].corners[0], 197, 58), "{:?}", markers[0].corners);
  }

  #[test]
  fn blank_images_have_no_markers() {
    let reader = MarkerReader::new();
    assert!(reader.infer(&RgbImage::new(256, 256)).unwrap().is_empty());
    let white = RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]));
    assert!(reader.infer(&white).unwrap().is_empty());
  }

  #[test]
  fn empty_image_follows_policy() {
    let empty = RgbImage::new(0, 0);
    assert!(MarkerReader::new().infer(&empty).is_err());
    let lenient = MarkerReader::new().failure_policy(FailurePolicy::Fallback);
    assert!(lenient.infer(&empty).unwrap().is_empty());
  }

  #[test]
  fn homography_hits_corners() {
    let quad = [(10.0, 10.0), (110.0, 20.0), (100.0, 120.0), (5.0, 100.0)];
    let h = Homography::square_to_quad(&quad).unwrap();
    for ((u, v), (x, y)) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
      .into_iter()
      .zip(quad)
    {
      let (mx, my) = h.map(u, v);
      assert!((mx - x).abs() < 1e-6 && (my - y).abs() < 1e-6);
    }
  }
}
