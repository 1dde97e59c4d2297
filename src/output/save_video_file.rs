// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/output/save_video_file.rs - 保存视频文件
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

//! 视频文件输出
//!
//! 标注后的帧经 GStreamer `appsrc` 推入
//! `videoconvert ! x264enc ! h264parse ! mp4mux ! filesink`，编码为 H.264 MP4。
//! 编码管道在第一帧到达时才启动，没有帧时不会生成文件。
//!
//! # URL 格式
//!
//! - `video:///path/to/output.mp4?width=640&height=480` - 默认 25 fps
//! - `video:///path/to/output.mp4?width=640&height=480&fps=30`
//!
//! 帧率可以是任意正数，如慢动作素材的 240 或延时摄影的 0.5。
//! 奇数尺寸在编码前补齐为偶数。

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use image::RgbImage;
use tracing::{error, info, warn};
use url::Url;

use super::{Annotator, OutputError, Render, ensure_parent_dir};
use crate::{
  FromUrl, FromUrlWithScheme,
  aggregate::FrameResult,
  frame::Frame,
  input::gstreamer_input::{bus_error, quote_property},
};

pub const DEFAULT_FPS: f64 = 25.0;
/// x264 恒定质量量化参数
const QUANTIZER: u32 = 23;
const EOS_TIMEOUT_SECS: u64 = 30;

enum Target {
  File(PathBuf),
  Writer(Option<Box<dyn Write>>),
}

/// 正在进行的编码
enum Encoder {
  /// 原始 rgb24 数据写入任意写入端
  Raw(Option<Box<dyn Write>>),
  Gst {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
  },
}

pub struct SaveVideoFileOutput {
  target: Target,
  width: u32,
  height: u32,
  fps: f64,
  annotator: Annotator,
  encoder: Option<Encoder>,
  frames: u64,
  finished: bool,
}

impl FromUrlWithScheme for SaveVideoFileOutput {
  const SCHEME: &'static str = "video";
}

impl FromUrl for SaveVideoFileOutput {
  type Error = OutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let fps = crate::query_param::<f64>(uri, "fps").unwrap_or(DEFAULT_FPS);
    let (Some(width), Some(height)) = (
      crate::query_param::<u32>(uri, "width"),
      crate::query_param::<u32>(uri, "height"),
    ) else {
      return Err(OutputError::Encoding(
        "视频输出需要 width 与 height 参数".to_string(),
      ));
    };

    Self::create(crate::url_to_path(uri), width, height, fps)
  }
}

fn validate(width: u32, height: u32, fps: f64) -> Result<(), OutputError> {
  if width == 0 || height == 0 {
    return Err(OutputError::Encoding(format!(
      "无效的视频尺寸 {}x{}",
      width, height
    )));
  }
  if !(fps.is_finite() && fps > 0.0) {
    return Err(OutputError::Encoding(format!("无效的帧率: {}", fps)));
  }
  Ok(())
}

/// 帧率转换为约分后的分数，精确到千分之一
fn fps_fraction(fps: f64) -> (i32, i32) {
  fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 { a } else { gcd(b, a % b) }
  }
  let numer = ((fps * 1000.0).round() as i64).max(1);
  let divisor = gcd(numer, 1000);
  ((numer / divisor) as i32, (1000 / divisor) as i32)
}

/// yuv420p 要求偶数尺寸
fn encoded_size(width: u32, height: u32) -> (u32, u32) {
  (width.next_multiple_of(2), height.next_multiple_of(2))
}

/// 按 GStreamer RGB 默认布局（行跨度 4 字节对齐）排列，补齐的区域为黑色
fn aligned_rgb(image: &RgbImage, width: u32, height: u32) -> Vec<u8> {
  let stride = (width as usize * 3).next_multiple_of(4);
  let row = image.width() as usize * 3;
  let mut data = vec![0u8; stride * height as usize];
  for (y, pixels) in image.as_raw().chunks_exact(row).enumerate() {
    data[y * stride..y * stride + row].copy_from_slice(pixels);
  }
  data
}

fn encoder_pipeline(path: &Path) -> String {
  format!(
    "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast pass=qual quantizer={} ! h264parse ! mp4mux ! filesink location={}",
    QUANTIZER,
    quote_property(&path.to_string_lossy())
  )
}

fn gst_error(
  context: &str,
  pipeline: Option<&gst::Pipeline>,
  e: impl std::fmt::Display,
) -> OutputError {
  let detail = pipeline.and_then(bus_error).unwrap_or_else(|| e.to_string());
  error!("{}: {}", context, detail);
  OutputError::Encoding(format!("{}: {}", context, detail))
}

impl Encoder {
  fn start_gst(path: &Path, width: u32, height: u32, fps: f64) -> Result<Self, OutputError> {
    ensure_parent_dir(path)?;
    gst::init().map_err(|e| gst_error("GStreamer 初始化失败", None, e))?;

    let description = encoder_pipeline(path);
    info!("创建视频输出管道: {}", description);

    let pipeline = gst::parse::launch(&description)
      .map_err(|e| gst_error("无法创建管道", None, e))?
      .downcast::<gst::Pipeline>()
      .map_err(|_| OutputError::Encoding("无法创建管道".to_string()))?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or_else(|| OutputError::Encoding("找不到 appsrc 元素".to_string()))?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| OutputError::Encoding("无法转换 appsrc 元素".to_string()))?;

    let (encoded_width, encoded_height) = encoded_size(width, height);
    let (numer, denom) = fps_fraction(fps);
    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", encoded_width as i32)
      .field("height", encoded_height as i32)
      .field("framerate", gst::Fraction::new(numer, denom))
      .build();
    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);
    appsrc.set_block(true);

    // 先构造再启动，启动失败时由 Drop 把管道置回 NULL
    let encoder = Encoder::Gst { pipeline, appsrc };
    if let Encoder::Gst { pipeline, .. } = &encoder {
      pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| gst_error("无法启动编码管道", Some(&*pipeline), e))?;
    }

    info!(
      "开始编码视频: {}x{} @ {} fps -> {}",
      width,
      height,
      fps,
      path.display()
    );
    Ok(encoder)
  }

  fn push(&mut self, image: &RgbImage, index: u64, fps: f64) -> Result<(), OutputError> {
    match self {
      Encoder::Raw(sink) => {
        let sink = sink
          .as_mut()
          .ok_or_else(|| OutputError::Encoding("编码器输入已关闭".to_string()))?;
        sink.write_all(image.as_raw()).map_err(|e| match e.kind() {
          io::ErrorKind::BrokenPipe => OutputError::Encoding("写入端已关闭".to_string()),
          _ => OutputError::Io(e),
        })
      }
      Encoder::Gst { pipeline, appsrc } => {
        let (width, height) = encoded_size(image.width(), image.height());
        let mut buffer = gst::Buffer::from_mut_slice(aligned_rgb(image, width, height));
        {
          let buffer = buffer.make_mut();
          let frame_ns = 1_000_000_000.0 / fps;
          buffer.set_pts(gst::ClockTime::from_nseconds((index as f64 * frame_ns) as u64));
          buffer.set_duration(gst::ClockTime::from_nseconds(frame_ns as u64));
        }
        appsrc
          .push_buffer(buffer)
          .map_err(|e| gst_error("推送帧失败", Some(&*pipeline), format!("{:?}", e)))?;
        Ok(())
      }
    }
  }

  /// 结束输入并等待文件写完
  fn close(&mut self) -> Result<(), OutputError> {
    match self {
      Encoder::Raw(sink) => {
        if let Some(mut sink) = sink.take() {
          sink.flush()?;
        }
        Ok(())
      }
      Encoder::Gst { pipeline, appsrc } => {
        appsrc
          .end_of_stream()
          .map_err(|e| gst_error("发送 EOS 失败", Some(&*pipeline), format!("{:?}", e)))?;

        let bus = pipeline
          .bus()
          .ok_or_else(|| OutputError::Encoding("编码管道没有消息总线".to_string()))?;
        let message = bus.timed_pop_filtered(
          gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS),
          &[gst::MessageType::Eos, gst::MessageType::Error],
        );
        match message.as_ref().map(|m| m.view()) {
          Some(gst::MessageView::Eos(_)) => Ok(()),
          Some(gst::MessageView::Error(err)) => Err(gst_error("编码失败", None, err.error())),
          _ => Err(OutputError::Encoding("等待编码结束超时".to_string())),
        }
      }
    }
  }
}

impl Drop for Encoder {
  fn drop(&mut self) {
    if let Encoder::Gst { pipeline, .. } = self
      && let Err(e) = pipeline.set_state(gst::State::Null)
    {
      warn!("停止视频输出管道失败: {}", e);
    }
  }
}

impl SaveVideoFileOutput {
  /// 创建 MP4 输出，尺寸与帧率在此固定
  pub fn create(
    path: impl Into<PathBuf>,
    width: u32,
    height: u32,
    fps: f64,
  ) -> Result<Self, OutputError> {
    validate(width, height, fps)?;
    Ok(Self::with_target(Target::File(path.into()), width, height, fps))
  }

  /// 将原始 rgb24 帧写入任意写入端，不启动编码管道
  pub fn with_writer(
    writer: Box<dyn Write>,
    width: u32,
    height: u32,
    fps: f64,
  ) -> Result<Self, OutputError> {
    validate(width, height, fps)?;
    Ok(Self::with_target(
      Target::Writer(Some(writer)),
      width,
      height,
      fps,
    ))
  }

  fn with_target(target: Target, width: u32, height: u32, fps: f64) -> Self {
    Self {
      target,
      width,
      height,
      fps,
      annotator: Annotator::default(),
      encoder: None,
      frames: 0,
      finished: false,
    }
  }

  pub fn frames_written(&self) -> u64 {
    self.frames
  }

  pub fn fps(&self) -> f64 {
    self.fps
  }

  fn start_encoder(&mut self) -> Result<Encoder, OutputError> {
    match &mut self.target {
      Target::Writer(writer) => Ok(Encoder::Raw(writer.take())),
      Target::File(path) => Encoder::start_gst(path, self.width, self.height, self.fps),
    }
  }

  /// 写入一帧，尺寸必须与创建时一致
  pub fn write_video_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    if self.finished {
      return Err(OutputError::Encoding("视频已结束编码".to_string()));
    }
    if image.dimensions() != (self.width, self.height) {
      return Err(OutputError::Encoding(format!(
        "帧尺寸 {}x{} 与视频尺寸 {}x{} 不一致",
        image.width(),
        image.height(),
        self.width,
        self.height
      )));
    }

    if self.encoder.is_none() {
      let encoder = self.start_encoder()?;
      self.encoder = Some(encoder);
    }

    let (frames, fps) = (self.frames, self.fps);
    self
      .encoder
      .as_mut()
      .ok_or_else(|| OutputError::Encoding("编码器未启动".to_string()))?
      .push(image, frames, fps)?;

    self.frames += 1;
    Ok(())
  }

  /// 结束输入并等待编码完成，可重复调用
  pub fn finish(&mut self) -> Result<(), OutputError> {
    if self.finished {
      return Ok(());
    }
    self.finished = true;

    let Some(mut encoder) = self.encoder.take() else {
      info!("没有帧可以编码为视频，跳过编码过程");
      return Ok(());
    };
    encoder.close()?;

    info!("视频编码完成: {} 帧 @ {} fps", self.frames, self.fps);
    Ok(())
  }
}

impl Render<Frame, FrameResult> for SaveVideoFileOutput {
  type Error = OutputError;

  fn render_result(&mut self, frame: &Frame, result: &FrameResult) -> Result<(), Self::Error> {
    let image = self.annotator.annotate(&frame.image, result);
    self.write_video_frame(&image)
  }

  fn finish(&mut self) -> Result<(), Self::Error> {
    SaveVideoFileOutput::finish(self)
  }
}

impl Drop for SaveVideoFileOutput {
  fn drop(&mut self) {
    if !self.finished {
      warn!("视频输出未显式结束，正在完成编码");
      if let Err(e) = self.finish() {
        error!("视频编码失败: {}", e);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::cell::RefCell;
  use std::rc::Rc;

  use super::*;

  #[derive(Clone, Default)]
  struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

  impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.borrow_mut().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  #[test]
  fn writes_raw_frames() {
    let buffer = SharedBuffer::default();
    let mut output = SaveVideoFileOutput::with_writer(Box::new(buffer.clone()), 4, 2, 25.0).unwrap();

    let frame = Frame::new(RgbImage::new(4, 2), 0, 0);
    output.render_result(&frame, &FrameResult::default()).unwrap();
    output.render_result(&frame, &FrameResult::default()).unwrap();
    output.finish().unwrap();

    assert_eq!(output.frames_written(), 2);
    assert_eq!(buffer.0.borrow().len(), 4 * 2 * 3 * 2);
  }

  #[test]
  fn size_mismatch_is_an_encoding_error() {
    let mut output =
      SaveVideoFileOutput::with_writer(Box::new(SharedBuffer::default()), 8, 8, 25.0).unwrap();
    let err = output.write_video_frame(&RgbImage::new(4, 4)).unwrap_err();
    assert!(matches!(err, OutputError::Encoding(_)));
    assert_eq!(output.frames_written(), 0);
  }

  #[test]
  fn no_frames_means_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.mp4");
    let mut output = SaveVideoFileOutput::create(&path, 16, 16, 25.0).unwrap();
    output.finish().unwrap();
    assert!(!path.exists());
  }

  #[test]
  fn rejects_bad_parameters() {
    assert!(SaveVideoFileOutput::create("/tmp/a.mp4", 0, 16, 25.0).is_err());
    assert!(SaveVideoFileOutput::create("/tmp/a.mp4", 16, 16, 0.0).is_err());
    assert!(SaveVideoFileOutput::create("/tmp/a.mp4", 16, 16, -5.0).is_err());
    assert!(SaveVideoFileOutput::create("/tmp/a.mp4", 16, 16, f64::NAN).is_err());
    assert!(SaveVideoFileOutput::create("/tmp/a.mp4", 16, 16, f64::INFINITY).is_err());

    let url = Url::parse("video:///tmp/a.mp4?fps=30").unwrap();
    assert!(SaveVideoFileOutput::from_url(&url).is_err());
    let url = Url::parse("video:///tmp/a.mp4?fps=30&width=64&height=48").unwrap();
    let output = SaveVideoFileOutput::from_url(&url).unwrap();
    assert_eq!(output.fps(), 30.0);
  }

  #[test]
  fn keeps_slow_motion_and_timelapse_rates() {
    for fps in [240.0, 0.5, 29.97] {
      let output = SaveVideoFileOutput::create("/tmp/rvm-rate.mp4", 64, 48, fps).unwrap();
      assert_eq!(output.fps(), fps);
    }
  }

  #[test]
  fn frame_rates_become_fractions() {
    assert_eq!(fps_fraction(25.0), (25, 1));
    assert_eq!(fps_fraction(240.0), (240, 1));
    assert_eq!(fps_fraction(0.5), (1, 2));
    assert_eq!(fps_fraction(29.97), (2997, 100));
  }

  #[test]
  fn odd_frames_are_padded_to_aligned_rows() {
    assert_eq!(encoded_size(5, 3), (6, 4));
    assert_eq!(encoded_size(64, 48), (64, 48));

    let image = RgbImage::from_pixel(5, 3, image::Rgb([200, 100, 50]));
    let data = aligned_rgb(&image, 6, 4);
    // 6 * 3 = 18 字节，对齐到 20
    assert_eq!(data.len(), 20 * 4);
    assert_eq!(&data[20..23], &[200, 100, 50]);
    assert_eq!(&data[15..20], &[0; 5]);
    assert!(data[60..].iter().all(|&b| b == 0));
  }

  #[test]
  fn encoder_pipeline_writes_mp4() {
    let description = encoder_pipeline(Path::new("/out/detect_result.mp4"));
    assert!(description.starts_with("appsrc name=src"));
    assert!(description.contains("x264enc"));
    assert!(description.contains("quantizer=23"));
    assert!(description.ends_with("mp4mux ! filesink location=\"/out/detect_result.mp4\""));
  }

  #[test]
  fn writing_after_finish_fails() {
    let mut output =
      SaveVideoFileOutput::with_writer(Box::new(SharedBuffer::default()), 2, 2, 25.0).unwrap();
    output.finish().unwrap();
    assert!(output.write_video_frame(&RgbImage::new(2, 2)).is_err());
  }
}
