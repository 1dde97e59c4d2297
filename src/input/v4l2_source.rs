// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/input/v4l2_source.rs - V4L2 摄像头输入源
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

use image::RgbImage;
use std::pin::Pin;
use std::time::Instant;
use tracing::info;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use super::webcam_source::{WEBCAM_FPS, WEBCAM_HEIGHT, WEBCAM_WIDTH, device_path};
use super::{InputError, InputSourceType, MediaSource};
use crate::frame::{Frame, StreamProperties};

/// V4L2 摄像头输入源
///
/// v4l 的 Stream 持有 Device 的引用，Device 放在 Pin<Box> 中保证地址稳定。
pub struct V4l2Source {
  device: Pin<Box<Device>>,
  stream: Option<Stream<'static>>,
  frame_index: u64,
  width: u32,
  height: u32,
  start_time: Instant,
}

impl V4l2Source {
  pub fn open(index: u32) -> Result<Self, InputError> {
    let path = device_path(index);
    if !path.exists() {
      return Err(InputError::SourceUnavailable(format!(
        "找不到摄像头设备: {}",
        path.display()
      )));
    }

    let device = Box::pin(Device::with_path(&path).map_err(|e| {
      InputError::SourceUnavailable(format!("无法打开设备 {}: {}", path.display(), e))
    })?);

    let mut format = device
      .format()
      .map_err(|e| InputError::SourceUnavailable(format!("无法读取设备格式: {}", e)))?;
    format.width = WEBCAM_WIDTH;
    format.height = WEBCAM_HEIGHT;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device
      .set_format(&format)
      .map_err(|e| InputError::SourceUnavailable(format!("无法设置设备格式: {}", e)))?;

    let mut source = Self {
      device,
      stream: None,
      frame_index: 0,
      width: format.width,
      height: format.height,
      start_time: Instant::now(),
    };

    let device_ref: &Device = &source.device;
    // SAFETY: device 固定在堆上且与 stream 同属一个结构体，Drop 时先释放 stream
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, 4)
        .map_err(|e| InputError::SourceUnavailable(format!("无法创建捕获流: {}", e)))?
    };
    source.stream = Some(stream);

    info!(
      "V4L2 摄像头已打开: {} ({}x{})",
      path.display(),
      source.width,
      source.height
    );
    Ok(source)
  }
}

/// 将 YUYV 格式转换为 RGB
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);

  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;
    for y in [chunk[0] as f32, chunk[2] as f32] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

impl Drop for V4l2Source {
  fn drop(&mut self) {
    // stream 必须先于 device 释放
    self.stream.take();
  }
}

impl Iterator for V4l2Source {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let stream = self.stream.as_mut()?;

    match stream.next() {
      Ok((buffer, _meta)) => {
        let rgb_data = yuyv_to_rgb(buffer, self.width, self.height);
        let image = match RgbImage::from_raw(self.width, self.height, rgb_data) {
          Some(img) => img,
          None => return Some(Err(InputError::Decode("无法创建 RGB 图像".to_string()))),
        };

        let timestamp_ms = self.start_time.elapsed().as_millis() as u64;
        let frame = Frame::new(image, self.frame_index, timestamp_ms);
        self.frame_index += 1;
        Some(Ok(frame))
      }
      Err(e) => Some(Err(InputError::Decode(format!("无法捕获帧: {}", e)))),
    }
  }
}

impl MediaSource for V4l2Source {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Webcam
  }

  fn properties(&self) -> StreamProperties {
    StreamProperties {
      width: self.width,
      height: self.height,
      frame_rate: Some(WEBCAM_FPS as f64),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yuyv_gray_maps_to_gray() {
    let rgb = yuyv_to_rgb(&[100, 128, 200, 128], 2, 1);
    assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
  }
}
