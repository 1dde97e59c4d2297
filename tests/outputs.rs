// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// tests/outputs.rs - 输出与评估
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

use std::fs;

use image::RgbImage;

use rvm::{
  FrameResult, Report,
  api,
  eval::{CocoPrediction, coco_predictions, write_predictions},
  output::{
    Annotator, OutputError, SaveVideoFileOutput,
    draw::{box_key, marker_key},
    read_report, write_report,
  },
  types::{BoundingBox, Code, CodeKind, Marker, Point, SegmentationMask},
};

fn busy_frame() -> FrameResult {
  FrameResult {
    frame: 0,
    boxes: vec![
      BoundingBox::new(4, 4, 40, 40, 0.9, 0),
      BoundingBox::new(50, 10, 90, 60, 0.4, 2),
    ],
    masks: vec![SegmentationMask {
      segmentation: vec![Point::new(10, 60), Point::new(30, 60), Point::new(20, 80)],
      confidence: 0.7,
      class_id: 0,
    }],
    markers: vec![Marker {
      id: 11,
      corners: [
        Point::new(60, 60),
        Point::new(90, 60),
        Point::new(90, 90),
        Point::new(60, 90),
      ],
    }],
    qr_codes: vec![],
    barcodes: vec![Code {
      kind: CodeKind::Barcode,
      data: "4006381333931".to_string(),
      corners: vec![Point::new(5, 92), Point::new(45, 92)],
      symbology: "EAN_13".to_string(),
    }],
  }
}

#[test]
fn annotation_preserves_size_and_colors() {
  let frame = RgbImage::new(100, 96);
  let result = busy_frame();
  let mut annotator = Annotator::new();

  let first = annotator.annotate(&frame, &result);
  assert_eq!(first.dimensions(), (100, 96));
  let cached = annotator.colors().len();

  let second = annotator.annotate(&frame, &result);
  assert_eq!(first, second);
  assert_eq!(annotator.colors().len(), cached);

  let mut fresh = Annotator::new();
  assert_eq!(fresh.annotate(&frame, &result), first);
  assert_ne!(box_key(&result.boxes[0]), box_key(&result.boxes[1]));
  assert_eq!(marker_key(&result.markers[0]), 11);
}

#[test]
fn report_round_trip_keeps_every_category() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("a").join("b").join("report.json");

  let mut report = Report::new("video:clip.mp4");
  report.push(busy_frame());
  report.push(FrameResult {
    frame: 1,
    ..FrameResult::default()
  });
  write_report(&report, &path).unwrap();
  write_report(&report, &path).unwrap();

  let back = read_report(&path).unwrap();
  assert_eq!(back, report);

  let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
  assert_eq!(json["frames"][1]["summary"]["boxes"], 0);
  assert_eq!(json["frames"][1]["masks"], serde_json::json!([]));
  assert_eq!(json["summary"]["boxes"], 2);
  assert_eq!(json["frames"][0]["barcodes"][0]["type"], "barcode");
}

#[test]
fn video_sink_rejects_other_sizes() {
  let mut sink = SaveVideoFileOutput::with_writer(Box::new(std::io::sink()), 32, 32, 30.0).unwrap();
  sink.write_video_frame(&RgbImage::new(32, 32)).unwrap();
  assert!(matches!(
    sink.write_video_frame(&RgbImage::new(64, 32)),
    Err(OutputError::Encoding(_))
  ));
  sink.finish().unwrap();
  assert_eq!(sink.frames_written(), 1);
}

#[test]
fn video_sink_keeps_input_frame_rate() {
  let dir = tempfile::tempdir().unwrap();
  let slow_motion = SaveVideoFileOutput::create(dir.path().join("o.mp4"), 64, 48, 240.0).unwrap();
  assert_eq!(slow_motion.fps(), 240.0);
  let timelapse = SaveVideoFileOutput::create(dir.path().join("t.mp4"), 64, 48, 0.5).unwrap();
  assert_eq!(timelapse.fps(), 0.5);
  assert!(matches!(
    SaveVideoFileOutput::create(dir.path().join("z.mp4"), 64, 48, 0.0),
    Err(OutputError::Encoding(_))
  ));
}

#[test]
fn perfect_predictions_score_one() {
  let dir = tempfile::tempdir().unwrap();
  let ann = dir.path().join("annotations.json");
  let pred = dir.path().join("preds.json");
  let out = dir.path().join("reports");

  fs::write(
    &ann,
    serde_json::json!({
      "images": [{"id": 1, "width": 640, "height": 480, "file_name": "test.jpg"}],
      "annotations": [{
        "id": 1, "image_id": 1, "category_id": 1,
        "bbox": [10, 20, 30, 40], "area": 1200, "iscrowd": 0
      }],
      "categories": [{"id": 1, "name": "test"}]
    })
    .to_string(),
  )
  .unwrap();
  write_predictions(
    &[CocoPrediction {
      image_id: 1,
      category_id: 1,
      bbox: [10.0, 20.0, 30.0, 40.0],
      score: 0.9,
    }],
    &pred,
  )
  .unwrap();

  let summary = api::coco_eval(&pred, &ann, &out).unwrap();
  assert!((summary.precision - 1.0).abs() < 1e-9);
  assert!((summary.recall - 1.0).abs() < 1e-9);
  let html = fs::read_to_string(out.join("report.html")).unwrap();
  assert!(html.contains("COCO Evaluation Report"));
  assert!(out.join("pr_curve.png").exists());
}

#[test]
fn exported_predictions_evaluate_against_themselves() {
  let dir = tempfile::tempdir().unwrap();
  let mut report = Report::new("image:a.png");
  report.push(FrameResult {
    frame: 3,
    boxes: vec![BoundingBox::new(10, 10, 50, 70, 0.6, 0)],
    ..FrameResult::default()
  });
  let preds = coco_predictions(&report);
  let pred = dir.path().join("preds.json");
  write_predictions(&preds, &pred).unwrap();

  let ann = dir.path().join("ann.json");
  fs::write(
    &ann,
    serde_json::json!({
      "images": [{"id": 3}],
      "annotations": [{"id": 1, "image_id": 3, "category_id": 1, "bbox": [10, 10, 40, 60]}],
      "categories": [{"id": 1, "name": "person"}]
    })
    .to_string(),
  )
  .unwrap();

  let summary = api::coco_eval(&pred, &ann, dir.path()).unwrap();
  assert!((summary.recall - 1.0).abs() < 1e-9);
}
