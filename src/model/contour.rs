// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/model/contour.rs - 掩码轮廓提取
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

use image::GrayImage;
use imageproc::contours::{BorderType, find_contours};
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::point::Point as IPoint;

use crate::types::Point;

/// 简化容差，占轮廓周长的比例
const SIMPLIFY_RATIO: f64 = 0.01;

/// 多边形面积（鞋带公式），取绝对值
pub fn polygon_area(points: &[IPoint<i32>]) -> f64 {
  if points.len() < 3 {
    return 0.0;
  }
  let twice: i64 = points
    .iter()
    .zip(points.iter().cycle().skip(1))
    .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
    .sum();
  (twice as f64 / 2.0).abs()
}

/// 二值掩码（非零为前景）转为轮廓多边形
///
/// 取面积最大的外轮廓，并以周长的 1% 为容差做 Douglas–Peucker 简化。
/// 提取不到轮廓时退化为前景像素坐标。
pub fn mask_to_polygon(mask: &GrayImage) -> Vec<Point> {
  let contours = find_contours::<i32>(mask);
  let largest = contours
    .iter()
    .filter(|c| c.border_type == BorderType::Outer && !c.points.is_empty())
    .max_by(|a, b| polygon_area(&a.points).total_cmp(&polygon_area(&b.points)));

  match largest {
    Some(contour) if contour.points.len() >= 3 => {
      let epsilon = SIMPLIFY_RATIO * arc_length(&contour.points, true);
      let simplified = simplify_closed(&contour.points, epsilon);
      let simplified = if simplified.len() >= 3 {
        simplified
      } else {
        contour.points.clone()
      };
      simplified.iter().map(|p| Point::new(p.x, p.y)).collect()
    }
    Some(contour) => contour.points.iter().map(|p| Point::new(p.x, p.y)).collect(),
    None => foreground_pixels(mask),
  }
}

/// 闭合曲线简化：在距起点最远处切成两段，分别做开曲线简化
pub(crate) fn simplify_closed(points: &[IPoint<i32>], epsilon: f64) -> Vec<IPoint<i32>> {
  let Some(&first) = points.first() else {
    return Vec::new();
  };
  if epsilon <= 0.0 {
    return points.to_vec();
  }

  let dist2 = |p: &IPoint<i32>| {
    let dx = (p.x - first.x) as i64;
    let dy = (p.y - first.y) as i64;
    dx * dx + dy * dy
  };
  let far = points
    .iter()
    .enumerate()
    .max_by_key(|&(i, p)| (dist2(p), std::cmp::Reverse(i)))
    .map(|(i, _)| i)
    .unwrap_or(0);
  if far == 0 {
    return vec![first];
  }

  let mut head = approximate_polygon_dp(&points[..=far], epsilon, false);
  let mut tail_curve = points[far..].to_vec();
  tail_curve.push(first);
  let tail = approximate_polygon_dp(&tail_curve, epsilon, false);

  head.pop();
  head.extend(tail);
  head.pop();
  head
}

fn foreground_pixels(mask: &GrayImage) -> Vec<Point> {
  mask
    .enumerate_pixels()
    .filter(|(_, _, p)| p[0] > 0)
    .map(|(x, y, _)| Point::new(x as i32, y as i32))
    .collect()
}
