// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/input/webcam_source.rs - 摄像头输入源
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
use std::time::Instant;

use tracing::info;

use super::gstreamer_input::{AppSinkReader, Clock, quote_property};
use super::{InputError, InputSourceType, MediaSource};
use crate::{
  FromUrlWithScheme,
  frame::{Frame, StreamProperties},
};

pub(super) const WEBCAM_WIDTH: u32 = 640;
pub(super) const WEBCAM_HEIGHT: u32 = 480;
pub(super) const WEBCAM_FPS: u32 = 30;

/// 摄像头设备路径
pub(super) fn device_path(index: u32) -> PathBuf {
  PathBuf::from(format!("/dev/video{}", index))
}

fn camera_pipeline(device: &Path) -> String {
  format!(
    "v4l2src device={} ! videoconvert ! videoscale ! video/x-raw,format=RGB,width={},height={} ! appsink name=sink max-buffers=2 drop=true sync=false",
    quote_property(&device.to_string_lossy()),
    WEBCAM_WIDTH,
    WEBCAM_HEIGHT
  )
}

/// 通过 GStreamer v4l2src 采集的摄像头输入源
pub struct WebcamSource {
  reader: AppSinkReader,
}

impl FromUrlWithScheme for WebcamSource {
  const SCHEME: &'static str = "webcam";
}

impl crate::FromUrl for WebcamSource {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    match super::SourceKind::from_url(url)? {
      super::SourceKind::Webcam(index) => Self::open(index),
      other => Err(InputError::SchemeMismatch(format!("不是摄像头: {}", other))),
    }
  }
}

impl WebcamSource {
  pub fn open(index: u32) -> Result<Self, InputError> {
    let device = device_path(index);
    if !device.exists() {
      return Err(InputError::SourceUnavailable(format!(
        "找不到摄像头设备: {}",
        device.display()
      )));
    }

    // 实时源不预卷，直接进入 PLAYING
    let reader = AppSinkReader::launch(
      &camera_pipeline(&device),
      Clock::WallTime(Instant::now()),
    )?;
    reader.play()?;
    info!("摄像头已打开: {}", device.display());
    Ok(Self { reader })
  }
}

impl Iterator for WebcamSource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.reader.read_frame()
  }
}

impl MediaSource for WebcamSource {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Webcam
  }

  fn properties(&self) -> StreamProperties {
    StreamProperties {
      width: WEBCAM_WIDTH,
      height: WEBCAM_HEIGHT,
      frame_rate: Some(WEBCAM_FPS as f64),
    }
  }
}
