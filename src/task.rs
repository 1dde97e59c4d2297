// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/task.rs - 任务驱动
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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use std::thread;

use tracing::{info, warn};

use crate::{
  aggregate::{FrameResult, Report},
  frame::Frame,
  input::InputError,
  model::{Model, ModelError},
  output::{OutputError, Render},
  pipeline::PipelineError,
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Report, Self::Error>;
}

static INTERRUPTED: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// 进程级中断标志，首次调用时注册 Ctrl-C 处理器
fn interrupt_flag() -> Arc<AtomicBool> {
  INTERRUPTED
    .get_or_init(|| {
      let flag = Arc::new(AtomicBool::new(false));
      let handler_flag = flag.clone();
      let registered = ctrlc::set_handler(move || {
        info!("收到中断信号，准备退出...");
        handler_flag.store(true, Ordering::SeqCst);
        thread::spawn(|| {
          thread::sleep(Duration::from_secs(30));
          warn!("强制退出程序");
          std::process::exit(1);
        });
      });
      if let Err(e) = registered {
        warn!("无法注册 Ctrl-C 处理器: {}", e);
      }
      flag
    })
    .clone()
}

/// 只处理第一帧，用于静态图片
pub struct OneShotTask {
  source: String,
}

impl OneShotTask {
  pub fn new(source: impl Into<String>) -> Self {
    Self {
      source: source.into(),
    }
  }
}

impl<I, M, O> Task<I, M, O> for OneShotTask
where
  I: Iterator<Item = Result<Frame, InputError>>,
  M: Model<Input = Frame, Output = FrameResult, Error = ModelError>,
  O: Render<Frame, FrameResult, Error = OutputError>,
{
  type Error = PipelineError;

  fn run_task(self, mut input: I, model: M, mut output: O) -> Result<Report, Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or(PipelineError::NoFrames)??;
    info!("输入帧获取成功，开始推理...");

    let now = Instant::now();
    let result = model.infer(&frame)?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());

    output.render_result(&frame, &result)?;
    output.finish()?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    let mut report = Report::new(self.source);
    report.push(result);
    Ok(report)
  }
}

/// 逐帧处理直到流结束、达到帧数上限或收到中断信号
#[derive(Debug)]
pub struct ContinuousTask {
  source: String,
  frame_number: Option<u64>,
  realtime: bool,
}

impl ContinuousTask {
  pub fn new(source: impl Into<String>) -> Self {
    Self {
      source: source.into(),
      frame_number: None,
      realtime: false,
    }
  }

  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 按帧时间戳节流，并逐帧输出统计
  pub fn with_realtime(mut self, realtime: bool) -> Self {
    self.realtime = realtime;
    self
  }
}

impl<I, M, O> Task<I, M, O> for ContinuousTask
where
  I: Iterator<Item = Result<Frame, InputError>>,
  M: Model<Input = Frame, Output = FrameResult, Error = ModelError>,
  O: Render<Frame, FrameResult, Error = OutputError>,
{
  type Error = PipelineError;

  fn run_task(self, input: I, model: M, mut output: O) -> Result<Report, Self::Error> {
    info!("开始任务...");
    let interrupted = interrupt_flag();
    interrupted.store(false, Ordering::SeqCst);

    let mut report = Report::new(self.source);
    let started = Instant::now();
    let mut now = Instant::now();

    for frame in input {
      let frame = frame?;
      if self.realtime {
        let due = Duration::from_millis(frame.timestamp_ms);
        if let Some(wait) = due.checked_sub(started.elapsed()) {
          thread::sleep(wait);
        }
      }

      let result = model.infer(&frame)?;
      let elapsed_a = now.elapsed();
      output.render_result(&frame, &result)?;
      let elapsed_b = now.elapsed();
      now = Instant::now();

      if self.realtime {
        info!("第 {} 帧: {:?}", frame.index, result.summary());
      }
      info!(
        "处理第 {} 帧，耗时: {:.2?} / {:.2?}",
        frame.index, elapsed_a, elapsed_b
      );
      report.push(result);

      let processed = report.frames.len() as u64;
      if self.frame_number.is_some_and(|n| processed >= n) {
        info!("达到指定帧数 {}, 退出任务循环", processed);
        break;
      }
      if interrupted.load(Ordering::SeqCst) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    output.finish()?;

    if report.frames.is_empty() {
      return Err(PipelineError::NoFrames);
    }
    info!("任务完成，共 {} 帧", report.frames.len());
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use image::RgbImage;

  use super::*;
  use crate::aggregate::aggregate;

  struct CountingModel;

  impl Model for CountingModel {
    type Input = Frame;
    type Output = FrameResult;
    type Error = ModelError;

    fn infer(&self, input: &Frame) -> Result<FrameResult, ModelError> {
      Ok(aggregate(input.index, None, None, None, None))
    }
  }

  #[derive(Default)]
  struct Recorder {
    frames: Vec<u64>,
    finished: bool,
  }

  impl Render<Frame, FrameResult> for &mut Recorder {
    type Error = OutputError;

    fn render_result(&mut self, frame: &Frame, _result: &FrameResult) -> Result<(), OutputError> {
      self.frames.push(frame.index);
      Ok(())
    }

    fn finish(&mut self) -> Result<(), OutputError> {
      self.finished = true;
      Ok(())
    }
  }

  fn frames(n: u64) -> impl Iterator<Item = Result<Frame, InputError>> {
    (0..n).map(|i| Ok(Frame::new(RgbImage::new(4, 4), i, i * 40)))
  }

  #[test]
  fn one_shot_uses_first_frame_only() {
    let mut recorder = Recorder::default();
    let report = OneShotTask::new("image:a.png")
      .run_task(frames(3), CountingModel, &mut recorder)
      .unwrap();
    assert_eq!(report.frames.len(), 1);
    assert_eq!(recorder.frames, vec![0]);
    assert!(recorder.finished);
  }

  #[test]
  fn one_shot_without_frames_fails() {
    let err = OneShotTask::new("image:a.png")
      .run_task(frames(0), CountingModel, None::<&mut Recorder>)
      .unwrap_err();
    assert!(matches!(err, PipelineError::NoFrames));
  }

  #[test]
  fn continuous_respects_frame_limit() {
    let mut recorder = Recorder::default();
    let report = ContinuousTask::new("video:a.mp4")
      .with_frame_number(Some(2))
      .run_task(frames(5), CountingModel, &mut recorder)
      .unwrap();
    assert_eq!(report.frames.len(), 2);
    assert_eq!(recorder.frames, vec![0, 1]);
    assert!(recorder.finished);
  }

  #[test]
  fn continuous_stops_on_input_error() {
    let input = frames(1).chain(std::iter::once(Err(InputError::Decode("坏帧".to_string()))));
    let err = ContinuousTask::new("video:a.mp4")
      .run_task(input, CountingModel, None::<&mut Recorder>)
      .unwrap_err();
    assert!(matches!(err, PipelineError::Input(_)));
  }
}
