// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/input/image_source.rs - 图片输入源
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

use image::{ImageReader, RgbImage};
use tracing::debug;

use super::{InputError, InputSourceType, MediaSource};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, StreamProperties},
};

/// 图片输入源，只产出一帧
pub struct ImageSource {
  image: Option<RgbImage>,
  width: u32,
  height: u32,
}

impl FromUrlWithScheme for ImageSource {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageSource {
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

impl ImageSource {
  /// 打开并解码图片文件
  pub fn open(path: impl AsRef<Path>) -> Result<Self, InputError> {
    let path = path.as_ref();
    let image = ImageReader::open(path)
      .map_err(|e| InputError::SourceUnavailable(format!("无法打开图片文件 {}: {}", path.display(), e)))?
      .with_guessed_format()
      .map_err(|e| InputError::SourceUnavailable(format!("无法识别图片格式 {}: {}", path.display(), e)))?
      .decode()
      .map_err(|e| InputError::SourceUnavailable(format!("无法解码图片文件 {}: {}", path.display(), e)))?
      .to_rgb8();

    debug!(
      "图片已加载: {} ({}x{})",
      path.display(),
      image.width(),
      image.height()
    );
    Ok(Self::from_image(image))
  }

  /// 直接使用内存中的图像
  pub fn from_image(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      image: Some(image),
      width,
      height,
    }
  }
}

impl Iterator for ImageSource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take().map(|image| Ok(Frame::new(image, 0, 0)))
  }
}

impl MediaSource for ImageSource {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Image
  }

  fn properties(&self) -> StreamProperties {
    StreamProperties {
      width: self.width,
      height: self.height,
      frame_rate: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yields_exactly_one_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gray.png");
    RgbImage::from_pixel(8, 6, image::Rgb([9, 9, 9]))
      .save(&path)
      .unwrap();

    let mut source = ImageSource::open(&path).unwrap();
    assert_eq!(source.properties().width, 8);
    assert_eq!(source.properties().height, 6);
    let frame = source.next().unwrap().unwrap();
    assert_eq!(frame.index, 0);
    assert_eq!(frame.image.get_pixel(0, 0), &image::Rgb([9, 9, 9]));
    assert!(source.next().is_none());
  }

  #[test]
  fn missing_file_is_unavailable() {
    let err = ImageSource::open("/no/such/image.png").err().unwrap();
    assert!(matches!(err, InputError::SourceUnavailable(_)));
  }
}
