// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/input/video_source.rs - 视频输入源
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

//! 视频文件输入
//!
//! 管道为 `filesrc ! decodebin ! videoconvert ! video/x-raw,format=RGB ! appsink`。
//! 打开时先预卷，从第一个样本读取尺寸与帧率，之后再开始播放。

use std::path::Path;

use tracing::info;

use super::gstreamer_input::{AppSinkReader, Clock, quote_property};
use super::{InputError, InputSourceType, MediaSource};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, StreamProperties},
};

/// 帧率未知时用于推算时间戳
const FALLBACK_FPS: f64 = 30.0;

fn file_pipeline(path: &Path) -> String {
  format!(
    "filesrc location={} ! decodebin ! videoconvert ! video/x-raw,format=RGB ! appsink name=sink sync=false max-buffers=4",
    quote_property(&path.to_string_lossy())
  )
}

/// 视频文件输入源
pub struct VideoSource {
  reader: AppSinkReader,
  properties: StreamProperties,
}

impl FromUrlWithScheme for VideoSource {
  const SCHEME: &'static str = "video";
}

impl FromUrl for VideoSource {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InputError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }
    Self::open(crate::url_to_path(url))
  }
}

impl VideoSource {
  /// 打开视频文件；路径不存在时在创建管道之前失败
  pub fn open(path: impl AsRef<Path>) -> Result<Self, InputError> {
    let path = path.as_ref();
    if !path.is_file() {
      return Err(InputError::SourceUnavailable(format!(
        "视频文件不存在: {}",
        path.display()
      )));
    }

    let mut reader = AppSinkReader::launch(&file_pipeline(path), Clock::FrameRate(FALLBACK_FPS))?;
    let properties = reader.preroll()?;
    reader.set_clock(Clock::FrameRate(properties.frame_rate_or(FALLBACK_FPS)));
    reader.play()?;

    info!(
      "视频已打开: {} ({}x{} @ {:?} fps)",
      path.display(),
      properties.width,
      properties.height,
      properties.frame_rate
    );
    Ok(Self { reader, properties })
  }
}

impl Iterator for VideoSource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.reader.read_frame()
  }
}

impl MediaSource for VideoSource {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Video
  }

  fn properties(&self) -> StreamProperties {
    self.properties
  }
}
