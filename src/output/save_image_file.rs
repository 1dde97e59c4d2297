// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/output/save_image_file.rs - 保存标注图像
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

use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use tracing::info;
use url::Url;

use super::{Annotator, OutputError, Render, ensure_parent_dir};
use crate::{FromUrl, FromUrlWithScheme, aggregate::FrameResult, frame::Frame};

/// 写出图像，格式由扩展名决定，无法识别时使用 JPEG
pub fn write_image(image: &RgbImage, path: impl AsRef<Path>) -> Result<(), OutputError> {
  let path = path.as_ref();
  ensure_parent_dir(path)?;

  let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Jpeg);
  image.save_with_format(path, format)?;

  info!("保存图像到文件: {}", path.display());
  Ok(())
}

/// 将每帧的标注结果写到同一个文件（后写覆盖先写）
pub struct SaveImageFileOutput {
  path: PathBuf,
  annotator: Annotator,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = OutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(Self::new(crate::url_to_path(uri)))
  }
}

impl SaveImageFileOutput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      annotator: Annotator::default(),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Render<Frame, FrameResult> for SaveImageFileOutput {
  type Error = OutputError;

  fn render_result(&mut self, frame: &Frame, result: &FrameResult) -> Result<(), Self::Error> {
    let image = self.annotator.annotate(&frame.image, result);
    write_image(&image, &self.path)
  }
}
