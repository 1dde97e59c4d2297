// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/output/report.rs - JSON 报告读写
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

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{OutputError, ensure_parent_dir};
use crate::aggregate::{FrameResult, Report, Summary};
use crate::types::{BoundingBox, Code, Marker, SegmentationMask};

const BOX_TAG: &str = "box";
const MASK_TAG: &str = "mask";
const MARKER_TAG: &str = "aruco";

/// 带 `type` 字段的实体；二维码与条码自身已带该字段
#[derive(Serialize, Deserialize)]
struct Tagged<T> {
  #[serde(rename = "type")]
  kind: String,
  #[serde(flatten)]
  entity: T,
}

impl<T> Tagged<T> {
  fn new(kind: &str, entity: T) -> Self {
    Self {
      kind: kind.to_string(),
      entity,
    }
  }
}

#[derive(Serialize, Deserialize)]
struct FrameRecord {
  frame: u64,
  summary: Summary,
  boxes: Vec<Tagged<BoundingBox>>,
  masks: Vec<Tagged<SegmentationMask>>,
  markers: Vec<Tagged<Marker>>,
  qr_codes: Vec<Code>,
  barcodes: Vec<Code>,
}

#[derive(Serialize, Deserialize)]
struct ReportRecord {
  source: String,
  generated_at: String,
  summary: Summary,
  frames: Vec<FrameRecord>,
}

impl From<&FrameResult> for FrameRecord {
  fn from(result: &FrameResult) -> Self {
    Self {
      frame: result.frame,
      summary: result.summary(),
      boxes: result
        .boxes
        .iter()
        .cloned()
        .map(|b| Tagged::new(BOX_TAG, b))
        .collect(),
      masks: result
        .masks
        .iter()
        .cloned()
        .map(|m| Tagged::new(MASK_TAG, m))
        .collect(),
      markers: result
        .markers
        .iter()
        .cloned()
        .map(|m| Tagged::new(MARKER_TAG, m))
        .collect(),
      qr_codes: result.qr_codes.clone(),
      barcodes: result.barcodes.clone(),
    }
  }
}

impl From<FrameRecord> for FrameResult {
  fn from(record: FrameRecord) -> Self {
    Self {
      frame: record.frame,
      boxes: record.boxes.into_iter().map(|t| t.entity).collect(),
      masks: record.masks.into_iter().map(|t| t.entity).collect(),
      markers: record.markers.into_iter().map(|t| t.entity).collect(),
      qr_codes: record.qr_codes,
      barcodes: record.barcodes,
    }
  }
}

pub fn report_to_string(report: &Report) -> Result<String, OutputError> {
  Ok(serde_json::to_string_pretty(&to_record(report))?)
}

fn to_record(report: &Report) -> ReportRecord {
  ReportRecord {
    source: report.source.clone(),
    generated_at: report.generated_at.clone(),
    summary: report.summary(),
    frames: report.frames.iter().map(FrameRecord::from).collect(),
  }
}

/// 以缩进格式写出报告
pub fn write_report(report: &Report, path: impl AsRef<Path>) -> Result<(), OutputError> {
  let path = path.as_ref();
  ensure_parent_dir(path)?;

  let mut writer = BufWriter::new(File::create(path)?);
  serde_json::to_writer_pretty(&mut writer, &to_record(report))?;
  writer.write_all(b"\n")?;
  writer.flush()?;

  info!(
    "报告已写入 {} ({} 帧)",
    path.display(),
    report.frames.len()
  );
  Ok(())
}

/// 读取 `write_report` 写出的报告，摘要字段会重新计算
pub fn read_report(path: impl AsRef<Path>) -> Result<Report, OutputError> {
  let reader = BufReader::new(File::open(path.as_ref())?);
  let record: ReportRecord = serde_json::from_reader(reader)?;

  Ok(Report {
    source: record.source,
    generated_at: record.generated_at,
    frames: record.frames.into_iter().map(FrameResult::from).collect(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{CodeKind, Point};

  fn sample_report() -> Report {
    let mut report = Report::new("image:sample.png");
    report.push(FrameResult {
      frame: 0,
      boxes: vec![BoundingBox::new(1, 2, 30, 40, 0.75, 16)],
      masks: vec![SegmentationMask {
        segmentation: vec![Point::new(0, 0), Point::new(4, 0), Point::new(4, 4)],
        confidence: 0.5,
        class_id: 0,
      }],
      markers: vec![Marker {
        id: 7,
        corners: [
          Point::new(0, 0),
          Point::new(10, 0),
          Point::new(10, 10),
          Point::new(0, 10),
        ],
      }],
      qr_codes: vec![Code {
        kind: CodeKind::Qr,
        data: "hello".to_string(),
        corners: vec![Point::new(1, 1)],
        symbology: "QR_CODE".to_string(),
      }],
      barcodes: vec![Code {
        kind: CodeKind::Barcode,
        data: "4006381333931".to_string(),
        corners: vec![Point::new(2, 2), Point::new(8, 2)],
        symbology: "EAN_13".to_string(),
      }],
    });
    report
  }

  #[test]
  fn entities_carry_type_tags() {
    let json: serde_json::Value =
      serde_json::from_str(&report_to_string(&sample_report()).unwrap()).unwrap();
    let frame = &json["frames"][0];
    assert_eq!(frame["boxes"][0]["type"], "box");
    assert_eq!(frame["boxes"][0]["x2"], 30);
    assert_eq!(frame["masks"][0]["type"], "mask");
    assert_eq!(frame["markers"][0]["type"], "aruco");
    assert_eq!(frame["markers"][0]["corners"][1], serde_json::json!([10, 0]));
    assert_eq!(frame["qr_codes"][0]["type"], "qr");
    assert_eq!(frame["barcodes"][0]["type"], "barcode");
    assert_eq!(json["summary"]["markers"], 1);
    assert_eq!(frame["summary"]["barcodes"], 1);
  }

  #[test]
  fn file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("report.json");
    let report = sample_report();
    write_report(&report, &path).unwrap();
    let back = read_report(&path).unwrap();
    assert_eq!(back, report);
  }

  #[test]
  fn empty_categories_are_written_with_zero_counts() {
    let mut report = Report::new("image:black.png");
    report.push(FrameResult::default());
    let json: serde_json::Value =
      serde_json::from_str(&report_to_string(&report).unwrap()).unwrap();
    assert_eq!(json["summary"]["boxes"], 0);
    assert_eq!(json["frames"][0]["boxes"], serde_json::json!([]));
    assert_eq!(json["frames"][0]["summary"]["qr_codes"], 0);
  }
}
