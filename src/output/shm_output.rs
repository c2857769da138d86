// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/shm_output.rs - 共享内存帧输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! 将标注后的帧缩放到 `W×H` RGB8，经 [`FrameChannel`] 发布给进程外的消费者。
//!
//! `shm://YoloIPC_SharedMemory?annotate=true&reset=true&timeout_ms=500&remove=true&font=/path.ttf`
//!
//! - `annotate`：是否在发布前绘制检测框，默认开启
//! - `reset`：打开后将标志清零，默认开启
//! - `timeout_ms`：等待消费者的上限，超时则丢弃本帧；缺省时一直等待
//! - `remove`：关闭时删除由本进程创建的共享内存文件，默认开启
//!
//! 也可用 `shm:///dev/shm/custom` 直接给出映射文件路径。

use std::time::Duration;

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  channel::{ChannelError, FrameChannel, path_from_url},
  frame::RgbFrame,
  model::DetectResult,
  output::{
    Render,
    draw::{Draw, FontError},
  },
  query_flag, query_value,
};

#[derive(Error, Debug)]
pub enum ShmOutputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("共享内存名称为空")]
  MissingName,
  #[error("共享内存通道错误: {0}")]
  ChannelError(#[from] ChannelError),
  #[error("字体错误: {0}")]
  FontError(#[from] FontError),
}

pub struct ShmOutput<const W: u32, const H: u32> {
  channel: Option<FrameChannel>,
  draw: Draw,
  annotate: bool,
  timeout: Option<Duration>,
  published: u64,
  dropped: u64,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for ShmOutput<W, H> {
  const SCHEME: &'static str = "shm";
}

impl<const W: u32, const H: u32> FromUrl for ShmOutput<W, H> {
  type Error = ShmOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ShmOutputError::SchemeMismatch(url.scheme().to_string()));
    }

    let path = path_from_url(url).ok_or(ShmOutputError::MissingName)?;

    let channel = FrameChannel::open(&path, Self::CAPACITY)?;
    let remove = channel.created() && query_flag(url, "remove").unwrap_or(true);
    let channel = channel.with_remove_on_close(remove);
    if query_flag(url, "reset").unwrap_or(true) {
      channel.reset();
    }

    let mut draw = Draw::default();
    if let Some((_, font)) = url.query_pairs().find(|(k, _)| k == "font") {
      draw = draw.with_font_file(font.as_ref())?;
    }

    let mut output = Self::new(channel, draw);
    output.annotate = query_flag(url, "annotate").unwrap_or(true);
    output.timeout = query_value::<u64>(url, "timeout_ms").map(Duration::from_millis);
    Ok(output)
  }
}

impl<const W: u32, const H: u32> ShmOutput<W, H> {
  /// 共享内存总字节数：1 字节标志 + 帧像素
  pub const CAPACITY: usize = 1 + RgbFrame::<W, H>::BYTE_LEN;

  pub fn new(channel: FrameChannel, draw: Draw) -> Self {
    info!(
      "共享内存输出就绪: {} ({}x{}, {} 字节)",
      channel.path().display(),
      W,
      H,
      channel.capacity()
    );
    Self {
      channel: Some(channel),
      draw,
      annotate: true,
      timeout: None,
      published: 0,
      dropped: 0,
    }
  }

  pub fn with_annotate(mut self, annotate: bool) -> Self {
    self.annotate = annotate;
    self
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn channel(&self) -> Option<&FrameChannel> {
    self.channel.as_ref()
  }

  /// 已发布帧数
  pub fn published(&self) -> u64 {
    self.published
  }

  /// 因消费者超时而丢弃的帧数
  pub fn dropped(&self) -> u64 {
    self.dropped
  }

  /// 发布一帧已经是 `W×H` 的数据
  pub fn publish(&mut self, frame: &RgbFrame<W, H>) -> Result<bool, ShmOutputError> {
    let Some(channel) = self.channel.as_mut() else {
      return Err(ShmOutputError::ChannelError(ChannelError::IoError(
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed"),
      )));
    };

    let sent = match self.timeout {
      None => channel.publish(frame.as_bytes()).map(|_| true),
      Some(timeout) => match channel.publish_timeout(frame.as_bytes(), timeout) {
        Ok(()) => Ok(true),
        Err(ChannelError::Timeout(waited)) => {
          warn!("消费者 {:?} 内未读取上一帧，丢弃本帧", waited);
          Ok(false)
        }
        Err(e) => Err(e),
      },
    }?;

    if sent {
      self.published += 1;
    } else {
      self.dropped += 1;
    }
    Ok(sent)
  }

  /// 关闭通道，按配置删除映射文件
  pub fn close(mut self) -> Result<(), ShmOutputError> {
    self.close_channel()
  }

  fn close_channel(&mut self) -> Result<(), ShmOutputError> {
    if let Some(channel) = self.channel.take() {
      info!(
        "关闭共享内存输出: 发布 {} 帧, 丢弃 {} 帧",
        self.published, self.dropped
      );
      channel.close()?;
    }
    Ok(())
  }
}

impl<const W: u32, const H: u32> Drop for ShmOutput<W, H> {
  fn drop(&mut self) {
    if let Err(e) = self.close_channel() {
      warn!("关闭共享内存失败: {}", e);
    }
  }
}

impl<const W: u32, const H: u32> Render<RgbImage, DetectResult> for ShmOutput<W, H> {
  type Error = ShmOutputError;

  fn render_result(&mut self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    // 先在原始分辨率上标注，再缩放
    let buffer = if self.annotate && !result.is_empty() {
      let mut annotated = frame.clone();
      self.draw.draw_detections(&mut annotated, result);
      RgbFrame::<W, H>::resize_from(&annotated)
    } else {
      RgbFrame::<W, H>::resize_from(frame)
    };

    let now = std::time::Instant::now();
    if self.publish(&buffer)? {
      debug!("发布帧 #{} 耗时: {:.2?}", self.published, now.elapsed());
    }
    Ok(())
  }
}
