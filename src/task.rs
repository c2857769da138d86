// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 采集、推理、发布流水线
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

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use tracing::{debug, info, trace, warn};

use crate::{
  model::{DetectResult, Model},
  output::Render,
};

/// 收到中断信号后等待流水线自行退出的最长时间
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

pub trait Task<I, M, O>: Sized {
  type Error;
  type Report;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Report, Self::Error>;
}

/// 协作式停止信号，可在线程间克隆共享
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
  pub fn new() -> Self {
    Self::default()
  }

  /// 安装 Ctrl-C 处理器：首次中断时置位，若流水线 30 秒内未退出则强制结束进程
  pub fn ctrlc() -> Result<Self, ctrlc::Error> {
    let signal = Self::new();
    let handler = signal.clone();
    ctrlc::set_handler(move || {
      if handler.0.swap(true, Ordering::SeqCst) {
        return;
      }
      info!("收到中断信号，准备退出...");
      thread::spawn(|| {
        thread::sleep(FORCE_EXIT_AFTER);
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;
    Ok(signal)
  }

  pub fn raise(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_raised(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// 流水线所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Acquiring,
  Detecting,
  Publishing,
  Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  /// 输入结束
  EndOfStream,
  /// 收到停止信号
  Signal,
  /// 达到指定帧数
  FrameLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
  /// 采集到的帧数
  pub frames: usize,
  /// 成功交给输出的帧数
  pub published: usize,
  /// 因推理或解码失败跳过的帧数
  pub skipped: usize,
  /// 发布帧中的检测框总数
  pub detections: usize,
  pub stop_reason: StopReason,
}

enum Stage<F> {
  Acquiring,
  Detecting(F),
  Publishing(F, DetectResult),
  Stopped(StopReason),
}

impl<F> Stage<F> {
  fn state(&self) -> PipelineState {
    match self {
      Stage::Acquiring => PipelineState::Acquiring,
      Stage::Detecting(_) => PipelineState::Detecting,
      Stage::Publishing(..) => PipelineState::Publishing,
      Stage::Stopped(_) => PipelineState::Stopped,
    }
  }
}

/// 逐帧循环：采集 → 推理 → 发布，直到输入结束、停止信号或达到帧数上限
///
/// 单帧推理失败（包括输出张量形状错误）只跳过该帧；输出失败视为致命错误。
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  stop: StopSignal,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
    self.stop = stop;
    self
  }

  /// 一帧处理完毕后的下一阶段
  fn after_frame<F>(&self, frames: usize) -> Stage<F> {
    if self.frame_number.is_some_and(|n| frames >= n) {
      info!("达到指定帧数 {}, 退出任务循环", frames);
      Stage::Stopped(StopReason::FrameLimit)
    } else {
      Stage::Acquiring
    }
  }
}

impl<
  F,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = DetectResult, Error = ME>,
  O: Render<F, DetectResult, Error = RE>,
> Task<I, M, O> for ContinuousTask
{
  type Error = anyhow::Error;
  type Report = TaskReport;

  fn run_task(self, mut input: I, model: M, mut output: O) -> Result<Self::Report, Self::Error> {
    info!("开始任务...");
    let (mut frames, mut published, mut skipped, mut detections) = (0, 0, 0, 0);
    let mut stage = Stage::Acquiring;
    let mut now = Instant::now();

    let stop_reason = loop {
      let next = match stage {
        Stage::Acquiring => {
          if self.stop.is_raised() {
            warn!("中断信号接收，退出任务循环");
            Stage::Stopped(StopReason::Signal)
          } else {
            match input.next() {
              Some(frame) => {
                frames += 1;
                now = Instant::now();
                debug!("处理第 {} 帧图像", frames);
                Stage::Detecting(frame)
              }
              None => {
                info!("输入结束，退出任务循环");
                Stage::Stopped(StopReason::EndOfStream)
              }
            }
          }
        }
        Stage::Detecting(frame) => match model.infer(&frame) {
          Ok(result) => Stage::Publishing(frame, result),
          Err(e) => {
            skipped += 1;
            warn!("第 {} 帧推理失败，跳过: {}", frames, e);
            self.after_frame(frames)
          }
        },
        Stage::Publishing(frame, result) => {
          let elapsed_a = now.elapsed();
          output.render_result(&frame, &result)?;
          published += 1;
          detections += result.len();
          debug!(
            "第 {} 帧: {} 个目标，推理 {:.2?} / 总计 {:.2?}",
            frames,
            result.len(),
            elapsed_a,
            now.elapsed()
          );
          self.after_frame(frames)
        }
        Stage::Stopped(reason) => break reason,
      };

      trace!("流水线阶段: {:?}", next.state());
      stage = next;
    };

    let report = TaskReport {
      frames,
      published,
      skipped,
      detections,
      stop_reason,
    };
    info!(
      "任务完成: 采集 {} 帧, 发布 {} 帧, 跳过 {} 帧, 检测 {} 个目标 ({:?})",
      report.frames, report.published, report.skipped, report.detections, report.stop_reason
    );
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{BoundingBox, ClassLabel, DetectItem};
  use thiserror::Error;

  #[derive(Error, Debug)]
  #[error("bad frame {0}")]
  struct BadFrame(u32);

  /// 帧为编号，编号为 3 的倍数时推理失败，否则返回编号个检测框
  struct CountingModel;

  impl Model for CountingModel {
    type Input = u32;
    type Output = DetectResult;
    type Error = BadFrame;

    fn infer(&self, input: &u32) -> Result<DetectResult, BadFrame> {
      if input % 3 == 0 {
        return Err(BadFrame(*input));
      }
      let item = DetectItem {
        kind: ClassLabel {
          id: 0,
          name: "person".into(),
        },
        score: 0.5,
        bbox: BoundingBox::default(),
      };
      Ok(DetectResult {
        items: vec![item; *input as usize].into_boxed_slice(),
      })
    }
  }

  #[derive(Error, Debug)]
  #[error("sink broken")]
  struct SinkBroken;

  #[derive(Default)]
  struct Sink {
    seen: Vec<u32>,
    fail_at: Option<u32>,
    stop_at: Option<(u32, StopSignal)>,
  }

  impl Render<u32, DetectResult> for &mut Sink {
    type Error = SinkBroken;

    fn render_result(&mut self, frame: &u32, _: &DetectResult) -> Result<(), SinkBroken> {
      if self.fail_at == Some(*frame) {
        return Err(SinkBroken);
      }
      self.seen.push(*frame);
      if let Some((at, signal)) = &self.stop_at
        && at == frame
      {
        signal.raise();
      }
      Ok(())
    }
  }

  #[test]
  fn runs_until_end_of_stream_and_skips_failed_frames() {
    let mut sink = Sink::default();
    let report = ContinuousTask::default()
      .run_task(1..=5u32, CountingModel, &mut sink)
      .unwrap();

    assert_eq!(sink.seen, vec![1, 2, 4, 5]);
    assert_eq!(
      report,
      TaskReport {
        frames: 5,
        published: 4,
        skipped: 1,
        detections: 12,
        stop_reason: StopReason::EndOfStream,
      }
    );
  }

  #[test]
  fn stops_at_frame_limit() {
    let mut sink = Sink::default();
    let report = ContinuousTask::default()
      .with_frame_number(Some(3))
      .run_task(1u32.., CountingModel, &mut sink)
      .unwrap();

    assert_eq!(report.frames, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.stop_reason, StopReason::FrameLimit);
  }

  #[test]
  fn stops_on_signal_after_current_frame() {
    let signal = StopSignal::new();
    let mut sink = Sink {
      stop_at: Some((4, signal.clone())),
      ..Sink::default()
    };
    let report = ContinuousTask::default()
      .with_stop_signal(signal.clone())
      .run_task(1u32.., CountingModel, &mut sink)
      .unwrap();

    assert!(signal.is_raised());
    assert_eq!(sink.seen, vec![1, 2, 4]);
    assert_eq!(report.frames, 4);
    assert_eq!(report.stop_reason, StopReason::Signal);
  }

  #[test]
  fn raised_signal_prevents_any_work() {
    let signal = StopSignal::new();
    signal.raise();
    let mut sink = Sink::default();
    let report = ContinuousTask::default()
      .with_stop_signal(signal)
      .run_task(1u32.., CountingModel, &mut sink)
      .unwrap();
    assert_eq!(report.frames, 0);
    assert!(sink.seen.is_empty());
  }

  #[test]
  fn render_errors_are_fatal() {
    let mut sink = Sink {
      fail_at: Some(2),
      ..Sink::default()
    };
    let err = ContinuousTask::default()
      .run_task(1..=5u32, CountingModel, &mut sink)
      .unwrap_err();
    assert!(err.downcast_ref::<SinkBroken>().is_some());
    assert_eq!(sink.seen, vec![1]);
  }
}
