// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl,
  frame::{Frame, StreamProperties},
};

pub(crate) mod gstreamer_input;
mod image_source;
mod video_source;
mod webcam_source;

#[cfg(feature = "v4l2_input")]
mod v4l2_source;

pub use self::image_source::ImageSource;
pub use self::video_source::VideoSource;
pub use self::webcam_source::WebcamSource;

#[cfg(feature = "v4l2_input")]
pub use self::v4l2_source::V4l2Source;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];

#[derive(Error, Debug)]
pub enum InputError {
  #[error("输入源不可用: {0}")]
  SourceUnavailable(String),
  #[error("不支持的输入源类型: {0}")]
  UnsupportedSourceType(String),
  #[error("解码错误: {0}")]
  Decode(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 输入源类型，在边界处确定一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
  /// 图片文件
  Image(PathBuf),
  /// 视频文件
  Video(PathBuf),
  /// 摄像头设备编号
  Webcam(u32),
}

impl SourceKind {
  /// 根据扩展名判断文件类型
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, InputError> {
    let path = path.as_ref();
    let ext = path
      .extension()
      .and_then(|e| e.to_str())
      .map(|e| e.to_ascii_lowercase())
      .unwrap_or_default();

    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
      Ok(SourceKind::Image(path.to_path_buf()))
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
      Ok(SourceKind::Video(path.to_path_buf()))
    } else {
      Err(InputError::UnsupportedSourceType(path.display().to_string()))
    }
  }

  pub fn is_live(&self) -> bool {
    matches!(self, SourceKind::Webcam(_))
  }
}

impl FromStr for SourceKind {
  type Err = InputError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
      return s
        .parse::<u32>()
        .map(SourceKind::Webcam)
        .map_err(|_| InputError::UnsupportedSourceType(s.to_string()));
    }

    if s.contains("://")
      && let Ok(url) = Url::parse(s)
    {
      return SourceKind::from_url(&url);
    }

    SourceKind::from_path(s)
  }
}

impl FromUrl for SourceKind {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    match url.scheme() {
      ImageSource::SCHEME => Ok(SourceKind::Image(crate::url_to_path(url))),
      VideoSource::SCHEME => Ok(SourceKind::Video(crate::url_to_path(url))),
      WebcamSource::SCHEME => {
        let index = url
          .host_str()
          .filter(|h| !h.is_empty())
          .unwrap_or_else(|| url.path().trim_start_matches('/'));
        index
          .parse::<u32>()
          .map(SourceKind::Webcam)
          .map_err(|_| InputError::UnsupportedSourceType(url.to_string()))
      }
      "file" => SourceKind::from_path(crate::url_to_path(url)),
      other => Err(InputError::SchemeMismatch(format!(
        "未知输入方案 '{}'",
        other
      ))),
    }
  }
}

impl fmt::Display for SourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SourceKind::Image(p) => write!(f, "image:{}", p.display()),
      SourceKind::Video(p) => write!(f, "video:{}", p.display()),
      SourceKind::Webcam(i) => write!(f, "webcam:{}", i),
    }
  }
}

/// 输入源类型标记
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSourceType {
  /// 图片文件
  Image,
  /// 视频文件
  Video,
  /// 摄像头
  Webcam,
}

/// 输入源 trait
pub trait MediaSource: Iterator<Item = Result<Frame, InputError>> {
  /// 获取输入源类型
  fn source_type(&self) -> InputSourceType;

  /// 获取流属性
  fn properties(&self) -> StreamProperties;
}

/// 打开输入源
pub fn open(kind: &SourceKind) -> Result<Box<dyn MediaSource>, InputError> {
  info!("打开输入源: {}", kind);
  match kind {
    SourceKind::Image(path) => Ok(Box::new(ImageSource::open(path)?)),
    SourceKind::Video(path) => Ok(Box::new(VideoSource::open(path)?)),
    #[cfg(feature = "v4l2_input")]
    SourceKind::Webcam(index) => Ok(Box::new(V4l2Source::open(*index)?)),
    #[cfg(not(feature = "v4l2_input"))]
    SourceKind::Webcam(index) => Ok(Box::new(WebcamSource::open(*index)?)),
  }
}
