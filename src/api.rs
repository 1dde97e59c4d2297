// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/api.rs - 高层接口
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

//! 高层接口：检测、分割、标记识别与评估
//!
//! 输出文件名固定：
//!
//! | 入口 | 图片 | 视频 | 摄像头 |
//! |------|------|------|--------|
//! | [`detect`] | `detect_result.{jpg,json}` | `detect_result.{mp4,json}` | `detect_webcam.json` |
//! | [`segment_image`] | `segment_result.{jpg,json}` | - | - |
//! | [`detect_markers`] | `markers_result.{jpg,json}` | - | - |
//!
//! [`detect`] 还会在报告旁写出 COCO 格式的 `preds.json`。

use std::path::{Path, PathBuf};

use tracing::info;

use crate::{
  aggregate::Report,
  eval::{self, EvalSummary},
  input::{self, InputError, SourceKind},
  model::{CodeReader, FailurePolicy, MarkerReader, Segmenter, YoloDetectorBuilder},
  output::{DEFAULT_VIDEO_FPS, SaveImageFileOutput, SaveVideoFileOutput, write_report},
  pipeline::{Pipeline, PipelineError},
  task::{ContinuousTask, OneShotTask, Task},
};

pub const DEFAULT_OUT_DIR: &str = "results";
pub const DEFAULT_DETECT_MODEL: &str = "yolov8n.onnx";

/// 视频与摄像头的流控制参数
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
  /// 最多处理的帧数
  pub max_frames: Option<u64>,
  /// 输出视频帧率，缺省时沿用输入
  pub fps: Option<f64>,
  pub realtime: bool,
}

#[derive(Debug, Clone)]
pub struct DetectOptions {
  /// 模型路径或 `yolo://` 描述
  pub model: String,
  pub out_dir: PathBuf,
  pub confidence: Option<f32>,
  pub iou: Option<f32>,
  pub stream: StreamOptions,
}

impl Default for DetectOptions {
  fn default() -> Self {
    Self {
      model: DEFAULT_DETECT_MODEL.to_string(),
      out_dir: PathBuf::from(DEFAULT_OUT_DIR),
      confidence: None,
      iou: None,
      stream: StreamOptions::default(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct SegmentOptions {
  /// 未指定时分割器运行在降级模式
  pub model: Option<String>,
  pub out_dir: PathBuf,
  pub policy: FailurePolicy,
}

impl Default for SegmentOptions {
  fn default() -> Self {
    Self {
      model: None,
      out_dir: PathBuf::from(DEFAULT_OUT_DIR),
      policy: FailurePolicy::Fallback,
    }
  }
}

#[derive(Debug, Clone)]
pub struct MarkerOptions {
  pub out_dir: PathBuf,
  /// 同时识别二维码与条码
  pub codes: bool,
}

impl Default for MarkerOptions {
  fn default() -> Self {
    Self {
      out_dir: PathBuf::from(DEFAULT_OUT_DIR),
      codes: true,
    }
  }
}

/// 对任意输入源运行流水线，写出标注结果与 `<stem>_result.json`
///
/// 摄像头不保存画面，报告写到 `<stem>_webcam.json`。
pub fn run_pipeline(
  kind: &SourceKind,
  pipeline: Pipeline,
  out_dir: &Path,
  stem: &str,
  stream: &StreamOptions,
) -> Result<Report, PipelineError> {
  let source = input::open(kind)?;
  let descriptor = kind.to_string();
  info!("输入源: {}", descriptor);

  let (report, report_path) = match kind {
    SourceKind::Image(_) => {
      let output = SaveImageFileOutput::new(out_dir.join(format!("{}_result.jpg", stem)));
      let report = OneShotTask::new(descriptor).run_task(source, pipeline, output)?;
      (report, out_dir.join(format!("{}_result.json", stem)))
    }
    SourceKind::Video(_) => {
      let properties = source.properties();
      let fps = stream
        .fps
        .unwrap_or_else(|| properties.frame_rate_or(DEFAULT_VIDEO_FPS));
      let output = SaveVideoFileOutput::create(
        out_dir.join(format!("{}_result.mp4", stem)),
        properties.width,
        properties.height,
        fps,
      )?;
      let report = ContinuousTask::new(descriptor)
        .with_frame_number(stream.max_frames)
        .with_realtime(stream.realtime)
        .run_task(source, pipeline, output)?;
      (report, out_dir.join(format!("{}_result.json", stem)))
    }
    SourceKind::Webcam(_) => {
      let report = ContinuousTask::new(descriptor)
        .with_frame_number(stream.max_frames)
        .with_realtime(stream.realtime)
        .run_task(source, pipeline, None::<SaveImageFileOutput>)?;
      (report, out_dir.join(format!("{}_webcam.json", stem)))
    }
  };

  write_report(&report, &report_path)?;
  Ok(report)
}

/// 目标检测，支持图片、视频与摄像头
pub fn detect(source: &str, options: &DetectOptions) -> Result<Report, PipelineError> {
  let kind: SourceKind = source.parse()?;

  let mut builder = YoloDetectorBuilder::from_descriptor(&options.model)?;
  if let Some(confidence) = options.confidence {
    builder = builder.confidence(confidence);
  }
  if let Some(iou) = options.iou {
    builder = builder.iou(iou);
  }
  let pipeline = Pipeline::new().with_detector(builder.build()?);

  let report = run_pipeline(&kind, pipeline, &options.out_dir, "detect", &options.stream)?;
  eval::write_predictions(
    &eval::coco_predictions(&report),
    options.out_dir.join("preds.json"),
  )?;

  info!("检测完成: {:?}", report.summary());
  Ok(report)
}

fn image_source(source: &str) -> Result<SourceKind, PipelineError> {
  match source.parse::<SourceKind>()? {
    kind @ SourceKind::Image(_) => Ok(kind),
    other => Err(
      InputError::UnsupportedSourceType(format!("仅支持图片输入: {}", other)).into(),
    ),
  }
}

/// 图片分割
pub fn segment_image(source: &str, options: &SegmentOptions) -> Result<Report, PipelineError> {
  let kind = image_source(source)?;
  let segmenter =
    Segmenter::from_descriptor(options.model.as_deref())?.failure_policy(options.policy);
  info!("分割器模式: {:?}", segmenter.mode());

  let pipeline = Pipeline::new().with_segmenter(segmenter);
  let report = run_pipeline(
    &kind,
    pipeline,
    &options.out_dir,
    "segment",
    &StreamOptions::default(),
  )?;
  info!("分割完成: {:?}", report.summary());
  Ok(report)
}

/// 图片中的标记与（可选）二维码、条码识别
pub fn detect_markers(source: &str, options: &MarkerOptions) -> Result<Report, PipelineError> {
  let kind = image_source(source)?;

  let mut pipeline = Pipeline::new().with_marker_reader(MarkerReader::new());
  if options.codes {
    pipeline = pipeline.with_code_reader(CodeReader::default());
  }

  let report = run_pipeline(
    &kind,
    pipeline,
    &options.out_dir,
    "markers",
    &StreamOptions::default(),
  )?;
  info!("标记识别完成: {:?}", report.summary());
  Ok(report)
}

/// COCO 评估，报告写到 `out_dir/report.html`
pub fn coco_eval(
  pred_file: impl AsRef<Path>,
  ann_file: impl AsRef<Path>,
  out_dir: impl AsRef<Path>,
) -> Result<EvalSummary, PipelineError> {
  Ok(eval::coco_eval(pred_file, ann_file, out_dir)?)
}
