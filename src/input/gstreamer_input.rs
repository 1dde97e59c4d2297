// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer appsink 读帧
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

//! # GStreamer 输入管道
//!
//! 视频文件与摄像头共用的读帧逻辑：管道以 `appsink name=sink` 结尾，
//! 输出 `video/x-raw,format=RGB`，逐个样本转换为 [`Frame`]。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev \
//!   gstreamer1.0-plugins-good gstreamer1.0-plugins-ugly
//! ```

use std::fmt::Display;
use std::time::Instant;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{debug, error, info, warn};

use super::InputError;
use crate::frame::{Frame, StreamProperties};

const PREROLL_TIMEOUT_SECS: u64 = 10;

/// 管道描述中的属性值，加引号并转义
pub(crate) fn quote_property(value: &str) -> String {
  format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// 帧率分数转换为浮点数，0/1 等无效值返回 None
pub(super) fn fraction_rate(numer: i32, denom: i32) -> Option<f64> {
  (numer > 0 && denom > 0).then(|| numer as f64 / denom as f64)
}

/// 取出管道总线上等待的错误消息
pub(crate) fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
  let bus = pipeline.bus()?;
  let message = bus.timed_pop_filtered(gst::ClockTime::ZERO, &[gst::MessageType::Error])?;
  match message.view() {
    gst::MessageView::Error(err) => Some(match err.debug() {
      Some(detail) => format!("{} ({})", err.error(), detail),
      None => err.error().to_string(),
    }),
    _ => None,
  }
}

/// 时间戳来源
#[derive(Debug, Clone, Copy)]
pub(super) enum Clock {
  /// 优先使用缓冲区 PTS，缺失时按帧率推算（视频文件）
  FrameRate(f64),
  /// 按实际经过时间（摄像头）
  WallTime(Instant),
}

/// appsink 读帧器，Drop 时将管道置为 NULL
pub(super) struct AppSinkReader {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  frame_index: u64,
  clock: Clock,
  ended: bool,
}

impl AppSinkReader {
  /// 解析管道描述并取出名为 `sink` 的 appsink，管道尚未启动
  pub(super) fn launch(description: &str, clock: Clock) -> Result<Self, InputError> {
    gst::init()
      .map_err(|e| InputError::SourceUnavailable(format!("GStreamer 初始化失败: {}", e)))?;

    info!("GStreamer 管道: {}", description);
    let pipeline = gst::parse::launch(description)
      .map_err(|e| InputError::SourceUnavailable(format!("无法创建管道: {}", e)))?
      .downcast::<gst::Pipeline>()
      .map_err(|_| InputError::SourceUnavailable("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or_else(|| InputError::SourceUnavailable("找不到 appsink 元素".to_string()))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| InputError::SourceUnavailable("无法转换 appsink 元素".to_string()))?;

    Ok(Self {
      pipeline,
      appsink,
      frame_index: 0,
      clock,
      ended: false,
    })
  }

  fn unavailable(&self, reason: impl Display) -> InputError {
    let detail = bus_error(&self.pipeline).unwrap_or_else(|| reason.to_string());
    InputError::SourceUnavailable(format!("无法启动管道: {}", detail))
  }

  /// 预卷到 PAUSED，从第一个样本的 caps 读取流属性
  pub(super) fn preroll(&self) -> Result<StreamProperties, InputError> {
    self
      .pipeline
      .set_state(gst::State::Paused)
      .map_err(|e| self.unavailable(e))?;

    let timeout = gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS);
    match self.pipeline.state(timeout).0 {
      Ok(gst::StateChangeSuccess::Async) => return Err(self.unavailable("预卷超时")),
      Ok(_) => {}
      Err(e) => return Err(self.unavailable(e)),
    }

    let sample = self.appsink.pull_preroll().map_err(|e| self.unavailable(e))?;
    let caps = sample
      .caps()
      .ok_or_else(|| self.unavailable("预卷样本中没有 caps"))?;
    let video_info = gst_video::VideoInfo::from_caps(caps)
      .map_err(|_| self.unavailable("无法从 caps 获取视频信息"))?;

    let fps = video_info.fps();
    Ok(StreamProperties {
      width: video_info.width(),
      height: video_info.height(),
      frame_rate: fraction_rate(fps.numer(), fps.denom()),
    })
  }

  pub(super) fn set_clock(&mut self, clock: Clock) {
    self.clock = clock;
  }

  pub(super) fn play(&self) -> Result<(), InputError> {
    self
      .pipeline
      .set_state(gst::State::Playing)
      .map_err(|e| self.unavailable(e))?;
    Ok(())
  }

  fn timestamp_ms(&self, sample: &gst::Sample) -> u64 {
    match self.clock {
      Clock::FrameRate(fps) => sample
        .buffer()
        .and_then(|buffer| buffer.pts())
        .map(|pts| pts.mseconds())
        .unwrap_or_else(|| (self.frame_index as f64 * 1000.0 / fps) as u64),
      Clock::WallTime(start) => start.elapsed().as_millis() as u64,
    }
  }

  /// 读取下一帧；流结束时返回 None
  pub(super) fn read_frame(&mut self) -> Option<Result<Frame, InputError>> {
    if self.ended {
      return None;
    }

    let sample = match self.appsink.pull_sample() {
      Ok(sample) => sample,
      Err(_) => {
        self.ended = true;
        return self.finish_stream();
      }
    };

    let timestamp = self.timestamp_ms(&sample);
    match sample_to_image(&sample) {
      Ok(image) => {
        let frame = Frame::new(image, self.frame_index, timestamp);
        self.frame_index += 1;
        Some(Ok(frame))
      }
      Err(e) => {
        self.ended = true;
        Some(Err(e))
      }
    }
  }

  fn finish_stream(&mut self) -> Option<Result<Frame, InputError>> {
    if self.appsink.is_eos() {
      info!("输入流结束，共 {} 帧", self.frame_index);
      return None;
    }
    match bus_error(&self.pipeline) {
      Some(message) => {
        error!("GStreamer 解码错误: {}", message);
        Some(Err(InputError::Decode(message)))
      }
      None => {
        warn!("appsink 停止输出，共 {} 帧", self.frame_index);
        None
      }
    }
  }
}

impl Drop for AppSinkReader {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

/// 将 RGB 样本复制为紧凑排列的图像，行跨度由 caps 给出
fn sample_to_image(sample: &gst::Sample) -> Result<RgbImage, InputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| InputError::Decode("样本中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| InputError::Decode("样本中没有 caps".to_string()))?;
  let video_info = gst_video::VideoInfo::from_caps(caps)
    .map_err(|_| InputError::Decode("无法从 caps 获取视频信息".to_string()))?;

  if video_info.format() != gst_video::VideoFormat::Rgb {
    return Err(InputError::Decode(format!(
      "不支持的视频格式: {:?}",
      video_info.format()
    )));
  }

  let map = buffer
    .map_readable()
    .map_err(|e| InputError::Decode(format!("无法映射缓冲区: {}", e)))?;
  let stride = video_info.stride()[0] as usize;
  pack_rows(map.as_slice(), video_info.width(), video_info.height(), stride)
}

/// 去掉每行末尾的对齐填充
fn pack_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Result<RgbImage, InputError> {
  let row = width as usize * 3;
  if width == 0 || height == 0 || stride < row {
    return Err(InputError::Decode(format!(
      "无效的帧布局: {}x{}, 行跨度 {}",
      width, height, stride
    )));
  }

  let expected = stride * (height as usize - 1) + row;
  if data.len() < expected {
    return Err(InputError::Decode(format!(
      "缓冲区大小不符: 期望 {} 字节, 实际 {} 字节",
      expected,
      data.len()
    )));
  }

  let mut pixels = Vec::with_capacity(row * height as usize);
  for y in 0..height as usize {
    let start = y * stride;
    pixels.extend_from_slice(&data[start..start + row]);
  }
  debug!("读取帧 {}x{}", width, height);
  RgbImage::from_raw(width, height, pixels)
    .ok_or_else(|| InputError::Decode("无法创建 RGB 图像".to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_rates_from_fractions() {
    assert_eq!(fraction_rate(30, 1), Some(30.0));
    assert!((fraction_rate(30000, 1001).unwrap() - 29.97).abs() < 0.01);
    assert_eq!(fraction_rate(1, 2), Some(0.5));
    assert_eq!(fraction_rate(0, 1), None);
    assert_eq!(fraction_rate(25, 0), None);
  }

  #[test]
  fn padded_rows_are_packed() {
    // 宽 3 像素，每行 9 字节，按 4 字节对齐为 12
    let mut data = Vec::new();
    for y in 0..2u8 {
      data.extend((0..9).map(|i| y * 10 + i));
      data.extend([0xee; 3]);
    }
    let image = pack_rows(&data, 3, 2, 12).unwrap();
    assert_eq!(image.dimensions(), (3, 2));
    assert_eq!(image.get_pixel(0, 1).0, [10, 11, 12]);
    assert!(!image.as_raw().contains(&0xee));
  }

  #[test]
  fn short_buffers_are_decode_errors() {
    assert!(matches!(
      pack_rows(&[0; 10], 4, 4, 12),
      Err(InputError::Decode(_))
    ));
    assert!(matches!(
      pack_rows(&[0; 64], 4, 1, 6),
      Err(InputError::Decode(_))
    ));
  }

  #[test]
  fn property_values_are_quoted() {
    assert_eq!(quote_property("/tmp/a b.mp4"), "\"/tmp/a b.mp4\"");
    assert_eq!(quote_property("x\"y"), "\"x\\\"y\"");
  }
}
