// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/model.rs - 模型
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

use std::str::FromStr;

use thiserror::Error;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型加载错误: {0}")]
  ModelLoad(String),
  #[error("推理错误: {0}")]
  Inference(String),
}

/// 单帧推理失败时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
  /// 将错误返回给调用者，中止整个流
  Propagate,
  /// 记录警告并使用降级结果
  Fallback,
}

impl FromStr for FailurePolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "propagate" | "fail" | "abort" => Ok(FailurePolicy::Propagate),
      "fallback" | "placeholder" => Ok(FailurePolicy::Fallback),
      other => Err(format!("未知的失败策略: {}", other)),
    }
  }
}

pub mod aruco;
pub mod codes;
pub mod contour;
pub mod detector;
pub mod labels;
pub mod segmenter;
mod yolo;

pub use self::aruco::MarkerReader;
pub use self::codes::{CodeDetections, CodeReader, DecodedSymbol, RxingDecoder, SymbolDecoder};
pub use self::detector::{YoloDetector, YoloDetectorBuilder};
pub use self::segmenter::{
  MaskBackend, RawMask, Segmenter, SegmenterMode, YoloSegBackend, YoloSegBackendBuilder,
};
pub use self::yolo::{iou, nms};
