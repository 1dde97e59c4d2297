// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/cli.rs - 命令行参数
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

use std::path::PathBuf;

use clap::{ArgGroup, Parser};

use crate::{
  api::{
    DEFAULT_DETECT_MODEL, DEFAULT_OUT_DIR, DetectOptions, MarkerOptions, SegmentOptions,
    StreamOptions,
  },
  input::SourceKind,
  model::FailurePolicy,
};

/// 解析命令行参数；参数错误时退出码为 1，`--help`/`--version` 退出码为 0
pub fn parse_args<T: Parser>() -> T {
  match T::try_parse() {
    Ok(args) => args,
    Err(e) => {
      let code = if e.use_stderr() { 1 } else { 0 };
      let _ = e.print();
      std::process::exit(code);
    }
  }
}

/// 最大帧数，0 表示不限制
fn frame_limit(max_frames: u64) -> Option<u64> {
  (max_frames > 0).then_some(max_frames)
}

#[derive(Parser, Debug)]
#[command(name = "rvm-detect", author, version, about = "目标检测", long_about = None)]
pub struct DetectArgs {
  /// 输入来源
  /// 支持格式:
  /// - 图片: *.jpg, *.jpeg, *.png, *.bmp, *.webp
  /// - 视频: *.mp4, *.mov, *.avi, *.mkv, *.webm
  /// - 摄像头: 设备编号（如 0）或 webcam://0
  #[arg(long, value_name = "SOURCE", default_value = "0")]
  pub source: String,

  /// ONNX 模型文件路径或 yolo:///path.onnx?confidence=.. 描述
  #[arg(long, value_name = "MODEL", default_value = DEFAULT_DETECT_MODEL)]
  pub model: String,

  /// 输出目录
  #[arg(long, value_name = "DIR", default_value = DEFAULT_OUT_DIR)]
  pub out: PathBuf,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub confidence: Option<f32>,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub iou: Option<f32>,

  /// 最大处理帧数（仅对视频/摄像头有效，0 表示无限制）
  #[arg(long, default_value_t = 0, value_name = "COUNT")]
  pub max_frames: u64,

  /// 输出视频帧率，缺省时沿用输入
  #[arg(long, value_name = "FPS")]
  pub fps: Option<f64>,

  /// 按输入帧率处理并逐帧输出统计（摄像头自动开启）
  #[arg(long)]
  pub realtime: bool,
}

impl DetectArgs {
  pub fn options(&self) -> DetectOptions {
    let webcam = matches!(self.source.parse::<SourceKind>(), Ok(SourceKind::Webcam(_)));
    DetectOptions {
      model: self.model.clone(),
      out_dir: self.out.clone(),
      confidence: self.confidence,
      iou: self.iou,
      stream: StreamOptions {
        max_frames: frame_limit(self.max_frames),
        fps: self.fps,
        realtime: self.realtime || webcam,
      },
    }
  }
}

#[derive(Parser, Debug)]
#[command(name = "rvm-segment", author, version, about = "图像分割", long_about = None)]
pub struct SegmentArgs {
  /// 输入图片路径
  #[arg(long, value_name = "SOURCE")]
  pub source: String,

  /// 分割模型（yoloseg:///path.onnx 或文件路径），缺省时使用降级模式
  #[arg(long, value_name = "MODEL")]
  pub model: Option<String>,

  /// 输出目录
  #[arg(long, value_name = "DIR", default_value = DEFAULT_OUT_DIR)]
  pub out: PathBuf,

  /// 推理失败时的处理方式: fallback 或 propagate
  #[arg(long, value_name = "POLICY", default_value = "fallback")]
  pub on_error: FailurePolicy,
}

impl SegmentArgs {
  pub fn options(&self) -> SegmentOptions {
    SegmentOptions {
      model: self.model.clone(),
      out_dir: self.out.clone(),
      policy: self.on_error,
    }
  }
}

#[derive(Parser, Debug)]
#[command(name = "rvm-markers", author, version, about = "标记与二维码识别", long_about = None)]
pub struct MarkerArgs {
  /// 输入图片路径
  #[arg(long, value_name = "SOURCE")]
  pub source: String,

  /// 输出目录
  #[arg(long, value_name = "DIR", default_value = DEFAULT_OUT_DIR)]
  pub out: PathBuf,

  /// 不识别二维码与条码
  #[arg(long)]
  pub no_codes: bool,
}

impl MarkerArgs {
  pub fn options(&self) -> MarkerOptions {
    MarkerOptions {
      out_dir: self.out.clone(),
      codes: !self.no_codes,
    }
  }
}

#[derive(Parser, Debug)]
#[command(name = "rvm-eval", author, version, about = "COCO 检测评估", long_about = None)]
#[command(group(ArgGroup::new("predictions").required(true).args(["images", "pred"])))]
pub struct EvalArgs {
  /// 图片目录（其中包含 preds.json）
  #[arg(long, value_name = "DIR")]
  pub images: Option<PathBuf>,

  /// 预测文件路径
  #[arg(long, value_name = "FILE")]
  pub pred: Option<PathBuf>,

  /// COCO 标注文件路径
  #[arg(long, value_name = "FILE")]
  pub ann: PathBuf,

  /// 报告输出目录
  #[arg(long, value_name = "DIR", default_value = "reports")]
  pub out: PathBuf,
}

impl EvalArgs {
  pub fn prediction_file(&self) -> PathBuf {
    match (&self.pred, &self.images) {
      (Some(pred), _) => pred.clone(),
      (None, Some(images)) => images.join("preds.json"),
      (None, None) => PathBuf::from("preds.json"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn detect_defaults() {
    let args = DetectArgs::try_parse_from(["rvm-detect", "--source", "street.jpg"]).unwrap();
    let options = args.options();
    assert_eq!(options.model, DEFAULT_DETECT_MODEL);
    assert_eq!(options.out_dir, PathBuf::from("results"));
    assert_eq!(options.stream.max_frames, None);
    assert!(!options.stream.realtime);
  }

  #[test]
  fn webcam_source_turns_on_realtime() {
    let args =
      DetectArgs::try_parse_from(["rvm-detect", "--source", "0", "--max-frames", "10"]).unwrap();
    let options = args.options();
    assert!(options.stream.realtime);
    assert_eq!(options.stream.max_frames, Some(10));
  }

  #[test]
  fn segment_policy_parses() {
    let args = SegmentArgs::try_parse_from([
      "rvm-segment",
      "--source",
      "a.png",
      "--on-error",
      "propagate",
    ])
    .unwrap();
    assert_eq!(args.options().policy, FailurePolicy::Propagate);
    let bad = SegmentArgs::try_parse_from([
      "rvm-segment",
      "--source",
      "a.png",
      "--on-error",
      "maybe",
    ]);
    assert!(bad.is_err());
  }

  #[test]
  fn markers_can_skip_codes() {
    let args =
      MarkerArgs::try_parse_from(["rvm-markers", "--source", "a.png", "--no-codes"]).unwrap();
    assert!(!args.options().codes);
  }

  #[test]
  fn eval_needs_predictions() {
    assert!(EvalArgs::try_parse_from(["rvm-eval", "--ann", "ann.json"]).is_err());
    let args =
      EvalArgs::try_parse_from(["rvm-eval", "--images", "imgs", "--ann", "ann.json"]).unwrap();
    assert_eq!(args.prediction_file(), PathBuf::from("imgs/preds.json"));
    let args =
      EvalArgs::try_parse_from(["rvm-eval", "--pred", "p.json", "--ann", "ann.json"]).unwrap();
    assert_eq!(args.prediction_file(), PathBuf::from("p.json"));
  }
}
