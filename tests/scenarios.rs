// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// tests/scenarios.rs - 端到端场景
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

use image::{Rgb, RgbImage};

use rvm::{
  Pipeline, PipelineError,
  api::{self, MarkerOptions, SegmentOptions, StreamOptions},
  frame::Frame,
  input::{self, InputError, SourceKind},
  model::{CodeReader, MarkerReader, Model, ModelError, Segmenter, SegmenterMode, aruco},
  output::{SaveImageFileOutput, read_report},
  task::{ContinuousTask, Task},
  types::BoundingBox,
};

/// 左上角像素非黑时报告一个检测框
struct BrightCornerDetector;

impl Model for BrightCornerDetector {
  type Input = RgbImage;
  type Output = Vec<BoundingBox>;
  type Error = ModelError;

  fn infer(&self, input: &RgbImage) -> Result<Vec<BoundingBox>, ModelError> {
    if input.get_pixel(0, 0).0 == [0, 0, 0] {
      Ok(Vec::new())
    } else {
      Ok(vec![BoundingBox::new(2, 2, 12, 12, 0.8, 0)])
    }
  }
}

fn save_black_image(dir: &std::path::Path) -> std::path::PathBuf {
  let path = dir.join("black.png");
  RgbImage::new(256, 256).save(&path).unwrap();
  path
}

#[test]
fn black_image_has_only_placeholder_mask() {
  let dir = tempfile::tempdir().unwrap();
  let image = save_black_image(dir.path());
  let out = dir.path().join("results");

  let segmenter = Segmenter::fallback();
  assert_eq!(segmenter.mode(), SegmenterMode::Fallback);
  let pipeline = Pipeline::new()
    .with_detector(BrightCornerDetector)
    .with_segmenter(segmenter)
    .with_marker_reader(MarkerReader::new())
    .with_code_reader(CodeReader::default());

  let report = api::run_pipeline(
    &SourceKind::Image(image),
    pipeline,
    &out,
    "scene",
    &StreamOptions::default(),
  )
  .unwrap();

  assert_eq!(report.frames.len(), 1);
  let frame = &report.frames[0];
  assert!(frame.boxes.is_empty());
  assert!(frame.markers.is_empty());
  assert!(frame.qr_codes.is_empty() && frame.barcodes.is_empty());
  assert_eq!(frame.masks, vec![Segmenter::placeholder(256, 256)]);

  assert!(out.join("scene_result.jpg").exists());
  let persisted = read_report(out.join("scene_result.json")).unwrap();
  assert_eq!(persisted.summary().boxes, 0);
  assert_eq!(persisted.summary().masks, 1);
}

#[test]
fn segment_image_writes_fixed_names() {
  let dir = tempfile::tempdir().unwrap();
  let image = save_black_image(dir.path());
  let options = SegmentOptions {
    out_dir: dir.path().join("out"),
    ..SegmentOptions::default()
  };

  let report = api::segment_image(image.to_str().unwrap(), &options).unwrap();
  assert_eq!(report.summary().masks, 1);
  assert!(options.out_dir.join("segment_result.jpg").exists());
  assert!(options.out_dir.join("segment_result.json").exists());
}

#[test]
fn marker_seven_is_found() {
  let dir = tempfile::tempdir().unwrap();
  let marker = aruco::generate_marker(7, 20).unwrap();
  let mut canvas = RgbImage::from_pixel(256, 256, Rgb([255, 255, 255]));
  for (x, y, p) in marker.enumerate_pixels() {
    canvas.put_pixel(x + 58, y + 58, Rgb([p[0], p[0], p[0]]));
  }
  let path = dir.path().join("marker.png");
  canvas.save(&path).unwrap();

  let options = MarkerOptions {
    out_dir: dir.path().join("out"),
    codes: true,
  };
  let report = api::detect_markers(path.to_str().unwrap(), &options).unwrap();

  let markers = &report.frames[0].markers;
  assert_eq!(markers.len(), 1);
  assert_eq!(markers[0].id, 7);
  assert_eq!(markers[0].corners.len(), 4);

  let persisted = read_report(options.out_dir.join("markers_result.json")).unwrap();
  assert_eq!(persisted.frames[0].markers, *markers);
  assert!(options.out_dir.join("markers_result.jpg").exists());
}

#[test]
fn stream_keeps_frame_order() {
  let frames = (0..3u64).map(|i| {
    let pixel = if i == 1 { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) };
    Ok::<_, InputError>(Frame::new(RgbImage::from_pixel(16, 16, pixel), i, i * 40))
  });

  let report = ContinuousTask::new("video:synthetic.mp4")
    .run_task(
      frames,
      Pipeline::new().with_detector(BrightCornerDetector),
      None::<SaveImageFileOutput>,
    )
    .unwrap();

  let indices: Vec<u64> = report.frames.iter().map(|f| f.frame).collect();
  assert_eq!(indices, vec![0, 1, 2]);
  assert!(report.frames[0].is_empty());
  assert_eq!(report.frames[1].boxes.len(), 1);
  assert!(report.frames[2].is_empty());
}

#[test]
fn missing_video_is_unavailable() {
  let dir = tempfile::tempdir().unwrap();
  let kind = SourceKind::Video(dir.path().join("nope.mp4"));
  assert!(matches!(
    input::open(&kind),
    Err(InputError::SourceUnavailable(_))
  ));

  let err = api::run_pipeline(
    &kind,
    Pipeline::new(),
    &dir.path().join("out"),
    "detect",
    &StreamOptions::default(),
  )
  .unwrap_err();
  assert!(matches!(
    err,
    PipelineError::Input(InputError::SourceUnavailable(_))
  ));
  assert!(!dir.path().join("out").exists());
}
