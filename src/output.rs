// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/output.rs - 输出定义
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

use std::path::Path;

use thiserror::Error;

pub trait Render<Frame, Output> {
  type Error;

  fn render_result(&mut self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;

  /// 流结束时调用，默认无操作
  fn finish(&mut self) -> Result<(), Self::Error> {
    Ok(())
  }
}

/// 可选输出，`None` 时丢弃结果
impl<F, D, R: Render<F, D>> Render<F, D> for Option<R> {
  type Error = R::Error;

  fn render_result(&mut self, frame: &F, result: &D) -> Result<(), Self::Error> {
    match self {
      Some(output) => output.render_result(frame, result),
      None => Ok(()),
    }
  }

  fn finish(&mut self) -> Result<(), Self::Error> {
    match self {
      Some(output) => output.finish(),
      None => Ok(()),
    }
  }
}

pub mod draw;
pub mod report;
mod save_image_file;
mod save_video_file;

pub use self::draw::{Annotator, ColorAssigner};
pub use self::report::{read_report, report_to_string, write_report};
pub use self::save_image_file::{SaveImageFileOutput, write_image};
pub use self::save_video_file::{DEFAULT_FPS as DEFAULT_VIDEO_FPS, SaveVideoFileOutput};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("视频编码错误: {0}")]
  Encoding(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  Image(#[from] image::ImageError),
  #[error("JSON 错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 创建文件所在目录（可重复调用）
pub(crate) fn ensure_parent_dir(path: &Path) -> Result<(), OutputError> {
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)?;
  }
  Ok(())
}
