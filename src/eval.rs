// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/eval.rs - COCO 格式检测评估
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

//! 简化的 COCO 检测评估
//!
//! 每张图片、每个类别内，预测按分数从高到低贪心匹配尚未匹配的非 crowd 标注，
//! 精确率与召回率在 IoU 阈值 0.50:0.05:0.95 上取平均。
//! 与 crowd 标注匹配的预测不计入统计。
//!
//! 输出 `report.html`（汇总与各阈值的表格）和 `pr_curve.png`
//! （IoU 0.50 与 0.75 下按分数累积的精确率-召回率曲线）。

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use ab_glyph::PxScale;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregate::Report;
use crate::model::labels::coco_category_id;
use crate::output::draw::embedded_font;

const PLOT_WIDTH: u32 = 640;
const PLOT_HEIGHT: u32 = 480;
const PLOT_LEFT: f32 = 70.0;
const PLOT_TOP: f32 = 50.0;
const PLOT_RIGHT: f32 = 610.0;
const PLOT_BOTTOM: f32 = 420.0;
/// 曲线对应的 IoU 阈值与颜色
const CURVES: [(f64, [u8; 3]); 2] = [(0.50, [31, 119, 180]), (0.75, [255, 127, 14])];

#[derive(Error, Debug)]
pub enum EvalError {
  #[error("预测文件格式错误: {0}")]
  InvalidPredictions(String),
  #[error("标注文件格式错误: {0}")]
  InvalidAnnotations(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  Json(#[from] serde_json::Error),
}

/// COCO 结果格式的一条预测，`bbox` 为 `[x, y, w, h]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoPrediction {
  pub image_id: u64,
  pub category_id: u32,
  pub bbox: [f64; 4],
  pub score: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct CocoAnnotation {
  image_id: u64,
  category_id: u32,
  bbox: [f64; 4],
  #[serde(default)]
  iscrowd: u8,
}

#[derive(Debug, Deserialize)]
struct CocoDataset {
  annotations: Vec<CocoAnnotation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalSummary {
  /// IoU 0.50:0.95 平均精确率
  pub precision: f64,
  /// IoU 0.50:0.95 平均召回率
  pub recall: f64,
}

#[derive(Debug, Clone, Copy)]
struct ThresholdScore {
  threshold: f64,
  precision: f64,
  recall: f64,
}

/// 将报告中的检测框导出为 COCO 预测，图片编号取帧序号
pub fn coco_predictions(report: &Report) -> Vec<CocoPrediction> {
  report
    .frames
    .iter()
    .flat_map(|frame| {
      frame.boxes.iter().map(move |b| CocoPrediction {
        image_id: frame.frame,
        category_id: coco_category_id(b.class_id),
        bbox: [
          b.x1 as f64,
          b.y1 as f64,
          b.width() as f64,
          b.height() as f64,
        ],
        score: b.confidence as f64,
      })
    })
    .collect()
}

pub fn write_predictions(
  predictions: &[CocoPrediction],
  path: impl AsRef<Path>,
) -> Result<(), EvalError> {
  let path = path.as_ref();
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    fs::create_dir_all(parent)?;
  }
  fs::write(path, serde_json::to_string_pretty(predictions)?)?;
  info!("预测已写入 {} ({} 条)", path.display(), predictions.len());
  Ok(())
}

fn read_predictions(path: &Path) -> Result<Vec<CocoPrediction>, EvalError> {
  let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
  if !value.is_array() {
    return Err(EvalError::InvalidPredictions(
      "预测必须是 COCO 格式的列表".to_string(),
    ));
  }
  serde_json::from_value(value).map_err(|e| EvalError::InvalidPredictions(e.to_string()))
}

fn read_annotations(path: &Path) -> Result<Vec<CocoAnnotation>, EvalError> {
  let dataset: CocoDataset = serde_json::from_str(&fs::read_to_string(path)?)
    .map_err(|e| EvalError::InvalidAnnotations(e.to_string()))?;
  Ok(dataset.annotations)
}

fn xywh_iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
  let ix = (a[0] + a[2]).min(b[0] + b[2]) - a[0].max(b[0]);
  let iy = (a[1] + a[3]).min(b[1] + b[3]) - a[1].max(b[1]);
  if ix <= 0.0 || iy <= 0.0 {
    return 0.0;
  }
  let inter = ix * iy;
  let union = a[2] * a[3] + b[2] * b[3] - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

fn iou_thresholds() -> impl Iterator<Item = f64> {
  (0..10).map(|i| 0.5 + 0.05 * i as f64)
}

/// 一个阈值下的匹配结果
struct Matching {
  /// 计入统计的预测：(分数, 是否命中)
  outcomes: Vec<(f64, bool)>,
  ground_truths: usize,
}

fn match_at(
  predictions: &[CocoPrediction],
  annotations: &[CocoAnnotation],
  threshold: f64,
) -> Matching {
  let mut groups: HashMap<(u64, u32), (Vec<&CocoPrediction>, Vec<&CocoAnnotation>)> =
    HashMap::new();
  for p in predictions {
    groups
      .entry((p.image_id, p.category_id))
      .or_default()
      .0
      .push(p);
  }
  for a in annotations {
    groups
      .entry((a.image_id, a.category_id))
      .or_default()
      .1
      .push(a);
  }

  let mut outcomes = Vec::new();
  let mut ground_truths = 0usize;

  for (preds, gts) in groups.values_mut() {
    preds.sort_by(|a, b| b.score.total_cmp(&a.score));
    ground_truths += gts.iter().filter(|g| g.iscrowd == 0).count();
    let mut matched = vec![false; gts.len()];

    for pred in preds.iter() {
      let best = gts
        .iter()
        .enumerate()
        .filter(|(i, g)| g.iscrowd == 0 && !matched[*i])
        .map(|(i, g)| (i, xywh_iou(&pred.bbox, &g.bbox)))
        .filter(|&(_, iou)| iou >= threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1));

      if let Some((i, _)) = best {
        matched[i] = true;
        outcomes.push((pred.score, true));
        continue;
      }

      let on_crowd = gts
        .iter()
        .any(|g| g.iscrowd != 0 && xywh_iou(&pred.bbox, &g.bbox) >= threshold);
      if !on_crowd {
        outcomes.push((pred.score, false));
      }
    }
  }

  Matching {
    outcomes,
    ground_truths,
  }
}

fn ratio(num: usize, den: usize) -> f64 {
  if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

fn score_at(
  predictions: &[CocoPrediction],
  annotations: &[CocoAnnotation],
  threshold: f64,
) -> ThresholdScore {
  let matching = match_at(predictions, annotations, threshold);
  let true_positives = matching.outcomes.iter().filter(|(_, tp)| *tp).count();
  ThresholdScore {
    threshold,
    precision: ratio(true_positives, matching.outcomes.len()),
    recall: ratio(true_positives, matching.ground_truths),
  }
}

/// 按分数从高到低累积的 (召回率, 精确率) 序列
fn pr_curve(matching: &Matching) -> Vec<(f64, f64)> {
  let mut outcomes = matching.outcomes.clone();
  outcomes.sort_by(|a, b| b.0.total_cmp(&a.0));

  let mut true_positives = 0usize;
  outcomes
    .iter()
    .enumerate()
    .map(|(i, &(_, tp))| {
      if tp {
        true_positives += 1;
      }
      (
        ratio(true_positives, matching.ground_truths),
        ratio(true_positives, i + 1),
      )
    })
    .collect()
}

fn plot_point(recall: f64, precision: f64) -> (f32, f32) {
  (
    PLOT_LEFT + recall as f32 * (PLOT_RIGHT - PLOT_LEFT),
    PLOT_BOTTOM - precision as f32 * (PLOT_BOTTOM - PLOT_TOP),
  )
}

/// 绘制精确率-召回率曲线图
fn render_pr_curve(curves: &[(f64, [u8; 3], Vec<(f64, f64)>)]) -> RgbImage {
  let font = embedded_font();
  let black = Rgb([0u8, 0, 0]);
  let grid = Rgb([220u8, 220, 220]);
  let mut image = RgbImage::from_pixel(PLOT_WIDTH, PLOT_HEIGHT, Rgb([255, 255, 255]));

  for step in 0..=5 {
    let value = step as f64 / 5.0;
    let (x, _) = plot_point(value, 0.0);
    let (_, y) = plot_point(0.0, value);
    draw_line_segment_mut(&mut image, (x, PLOT_TOP), (x, PLOT_BOTTOM), grid);
    draw_line_segment_mut(&mut image, (PLOT_LEFT, y), (PLOT_RIGHT, y), grid);
    let tick = format!("{:.1}", value);
    let scale = PxScale::from(14.0);
    draw_text_mut(&mut image, black, x as i32 - 9, PLOT_BOTTOM as i32 + 6, scale, &font, &tick);
    draw_text_mut(&mut image, black, PLOT_LEFT as i32 - 30, y as i32 - 7, scale, &font, &tick);
  }
  draw_hollow_rect_mut(
    &mut image,
    Rect::at(PLOT_LEFT as i32, PLOT_TOP as i32).of_size(
      (PLOT_RIGHT - PLOT_LEFT) as u32 + 1,
      (PLOT_BOTTOM - PLOT_TOP) as u32 + 1,
    ),
    black,
  );

  let title = PxScale::from(20.0);
  let label = PxScale::from(16.0);
  draw_text_mut(&mut image, black, 210, 14, title, &font, "Precision-Recall Curve");
  draw_text_mut(&mut image, black, 310, 448, label, &font, "Recall");
  draw_text_mut(&mut image, black, 4, 24, label, &font, "Precision");

  for (row, (threshold, color, points)) in curves.iter().enumerate() {
    let color = Rgb(*color);
    let Some(&(_, first_precision)) = points.first() else {
      continue;
    };

    // 从召回率 0 开始，两像素宽
    let mut previous = plot_point(0.0, first_precision);
    for &(recall, precision) in points {
      let next = plot_point(recall, precision);
      for offset in [0.0, 1.0] {
        draw_line_segment_mut(
          &mut image,
          (previous.0, previous.1 + offset),
          (next.0, next.1 + offset),
          color,
        );
      }
      previous = next;
    }

    let legend_y = PLOT_TOP as i32 + 10 + row as i32 * 22;
    let legend_x = PLOT_RIGHT as i32 - 130;
    draw_line_segment_mut(
      &mut image,
      (legend_x as f32, legend_y as f32 + 8.0),
      (legend_x as f32 + 24.0, legend_y as f32 + 8.0),
      color,
    );
    let text = format!("IoU={:.2}", threshold);
    draw_text_mut(&mut image, black, legend_x + 30, legend_y, label, &font, &text);
  }

  image
}

fn render_html(summary: &EvalSummary, scores: &[ThresholdScore], images: usize) -> String {
  let mut html = String::new();
  html.push_str("<html><head><meta charset=\"utf-8\"><title>COCO Eval Report</title></head><body>");
  html.push_str("<h1>COCO Evaluation Report</h1>");
  html.push_str("<ul>");
  let _ = write!(
    html,
    "<li>Precision (IoU 0.50:0.95): {:.3}</li>",
    summary.precision
  );
  let _ = write!(html, "<li>Recall (IoU 0.50:0.95): {:.3}</li>", summary.recall);
  let _ = write!(html, "<li>Images: {}</li>", images);
  html.push_str("</ul>");
  html.push_str("<table border=\"1\"><tr><th>IoU</th><th>Precision</th><th>Recall</th></tr>");
  for s in scores {
    let _ = write!(
      html,
      "<tr><td>{:.2}</td><td>{:.3}</td><td>{:.3}</td></tr>",
      s.threshold, s.precision, s.recall
    );
  }
  html.push_str("</table></body></html>");
  html
}

/// 评估预测文件，并在 `out_dir` 下写出 `report.html` 与 `pr_curve.png`
pub fn coco_eval(
  pred_file: impl AsRef<Path>,
  ann_file: impl AsRef<Path>,
  out_dir: impl AsRef<Path>,
) -> Result<EvalSummary, EvalError> {
  let out_dir = out_dir.as_ref();
  fs::create_dir_all(out_dir)?;

  let annotations = read_annotations(ann_file.as_ref())?;
  let predictions = read_predictions(pred_file.as_ref())?;
  if predictions.is_empty() {
    warn!("预测列表为空");
  }

  let scores: Vec<ThresholdScore> = iou_thresholds()
    .map(|t| score_at(&predictions, &annotations, t))
    .collect();
  let n = scores.len() as f64;
  let summary = EvalSummary {
    precision: scores.iter().map(|s| s.precision).sum::<f64>() / n,
    recall: scores.iter().map(|s| s.recall).sum::<f64>() / n,
  };

  let images: BTreeSet<u64> = annotations.iter().map(|a| a.image_id).collect();
  let report_path = out_dir.join("report.html");
  fs::write(&report_path, render_html(&summary, &scores, images.len()))?;

  let curves: Vec<(f64, [u8; 3], Vec<(f64, f64)>)> = CURVES
    .iter()
    .map(|&(threshold, color)| {
      let matching = match_at(&predictions, &annotations, threshold);
      (threshold, color, pr_curve(&matching))
    })
    .collect();
  let curve_path = out_dir.join("pr_curve.png");
  if let Err(e) = render_pr_curve(&curves).save(&curve_path) {
    warn!("无法保存 PR 曲线 {}: {}", curve_path.display(), e);
  }

  info!(
    "评估完成: precision={:.3}, recall={:.3}, 报告: {}",
    summary.precision,
    summary.recall,
    report_path.display()
  );
  Ok(summary)
}
