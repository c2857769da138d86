// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频输入
//!
//! - `gst://camera/dev/video0?width=1280&height=720&fps=30&format=YUY2&rotate=90`
//! - `gst://file/path/to/video.mp4?rotate=180`
//!
//! 管道末端统一转换为 RGB 并输出到 appsink，帧保持采集分辨率，
//! 缩放由检测器和共享内存输出各自完成。文件播放到结尾（EOS）时迭代结束。
//!
//! 使用前需要安装 GStreamer 开发库：
//!
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("Unknown source kind: {0:?}")]
  UnknownSource(Option<String>),
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  #[error("Unsupported video format: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("Capture failed: {0}")]
  CaptureFailed(String),
  #[error("Too many consecutive bad samples: {0}")]
  TooManyBadSamples(usize),
}

/// 连续转换失败超过该次数即视为采集失败
const MAX_CONSECUTIVE_BAD_SAMPLES: usize = 30;

/// 管道描述片段
enum PipelineItem {
  FileSource(String),
  CameraSource {
    device: String,
    io_mode: Option<u32>,
    format: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  VideoFlip {
    method: u32,
  },
  TargetFormat,
}

impl PipelineItem {
  fn describe(&self) -> String {
    match self {
      PipelineItem::FileSource(path) => format!("filesrc location={} ! decodebin", path),
      PipelineItem::CameraSource {
        device,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! video/x-raw,format={},width={},height={},framerate={}/1",
          device, io_mode, format, width, height, fps
        )
      }
      PipelineItem::VideoFlip { method } => format!("videoflip method={}", method),
      PipelineItem::TargetFormat => "videoconvert ! video/x-raw,format=RGB".to_string(),
    }
  }

  fn video_flip(rotate: Option<&String>) -> Option<Self> {
    let method = match rotate?.as_str() {
      "90" => 1,
      "180" => 2,
      "270" => 3,
      _ => return None,
    };
    Some(PipelineItem::VideoFlip { method })
  }
}

fn pipeline_from_url(url: &Url) -> Result<String, GStreamerInputError> {
  let query: HashMap<String, String> = url
    .query_pairs()
    .map(|(k, v)| (String::from(k), String::from(v)))
    .collect();
  let parse = |key: &str, default: u32| {
    query
      .get(key)
      .and_then(|v| v.parse::<u32>().ok())
      .unwrap_or(default)
  };

  let source = match url.host_str() {
    Some("camera") => PipelineItem::CameraSource {
      device: url.path().to_string(),
      io_mode: query.get("io-mode").and_then(|v| v.parse::<u32>().ok()),
      format: query.get("format").cloned().unwrap_or_else(|| "YUY2".to_string()),
      width: parse("width", 640),
      height: parse("height", 480),
      fps: parse("fps", 30),
    },
    Some("file") => PipelineItem::FileSource(url.path().to_string()),
    other => return Err(GStreamerInputError::UnknownSource(other.map(String::from))),
  };

  let items = std::iter::once(source)
    .chain(PipelineItem::video_flip(query.get("rotate")))
    .chain(std::iter::once(PipelineItem::TargetFormat))
    .map(|item| item.describe())
    .collect::<Vec<_>>();

  Ok(format!(
    "{} ! appsink max-buffers=2 drop=true name=sink",
    items.join(" ! ")
  ))
}

pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  error: Option<GStreamerInputError>,
  skipped: usize,
}

impl FromUrlWithScheme for GStreamerInput {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInput {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }
    Self::launch(&pipeline_from_url(url)?)
  }
}

impl GStreamerInput {
  pub fn launch(description: &str) -> Result<Self, GStreamerInputError> {
    gst::init()?;
    info!("GStreamer pipeline description: {}", description);

    let pipeline = gst::parse::launch(description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;
    Ok(Self {
      pipeline,
      appsink,
      error: None,
      skipped: 0,
    })
  }

  /// 迭代因采集失败（而非 EOS）结束时返回失败原因
  pub fn take_error(&mut self) -> Option<GStreamerInputError> {
    self.error.take()
  }

  /// 因无法转换而跳过的帧数
  pub fn skipped(&self) -> usize {
    self.skipped
  }

  /// 从总线取出管道报告的错误
  fn bus_error(&self) -> Option<String> {
    let bus = self.pipeline.bus()?;
    let message = bus.pop_filtered(&[gst::MessageType::Error])?;
    match message.view() {
      gst::MessageView::Error(err) => Some(format!("{} ({:?})", err.error(), err.debug())),
      _ => None,
    }
  }

  fn fail(&mut self, error: GStreamerInputError) -> Option<RgbImage> {
    error!("GStreamer 输入失败: {}", error);
    self.error = Some(error);
    None
  }
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl Iterator for GStreamerInput {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    if self.error.is_some() {
      return None;
    }

    let mut bad_samples = 0;
    loop {
      // pull_sample 在 EOS 时返回错误，视为流结束
      let sample = match self.appsink.pull_sample() {
        Ok(sample) => sample,
        Err(_) if self.appsink.is_eos() => {
          info!("GStreamer 输入到达流末尾");
          return None;
        }
        Err(e) => {
          let reason = self.bus_error().unwrap_or_else(|| e.to_string());
          return self.fail(GStreamerInputError::CaptureFailed(reason));
        }
      };

      match sample_to_image(&sample) {
        Ok(image) => return Some(image),
        Err(e) => {
          self.skipped += 1;
          bad_samples += 1;
          warn!("跳过无法转换的帧: {}", e);
          if bad_samples >= MAX_CONSECUTIVE_BAD_SAMPLES {
            return self.fail(GStreamerInputError::TooManyBadSamples(bad_samples));
          }
        }
      }
    }
  }
}

fn sample_to_image(sample: &gst::Sample) -> Result<RgbImage, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;
  let info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let bgr = match info.format() {
    gst_video::VideoFormat::Rgb => false,
    gst_video::VideoFormat::Bgr => true,
    other => return Err(GStreamerInputError::UnsupportedFormat(other)),
  };

  let (width, height) = (info.width(), info.height());
  let row_bytes = width as usize * 3;
  let stride = info.stride()[0] as usize;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  let expected = stride * (height as usize).saturating_sub(1) + row_bytes;
  if data.len() < expected {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  // 去掉行对齐填充
  let mut pixels = Vec::with_capacity(row_bytes * height as usize);
  for row in data.chunks(stride).take(height as usize) {
    let row = &row[..row_bytes];
    if bgr {
      pixels.extend(row.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]));
    } else {
      pixels.extend_from_slice(row);
    }
  }

  RgbImage::from_raw(width, height, pixels)
    .ok_or_else(|| GStreamerInputError::PipelineError("Invalid frame buffer".to_string()))
}
