// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/decode.rs - 检测张量解码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;
use tracing::debug;

use crate::model::{BoundingBox, Detection};

/// 每行固定字段：cx, cy, w, h, objectness
pub const ROW_HEADER_LEN: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("张量形状不匹配: {rows} 行 × {stride} 列需要 {expected} 个元素, 实际 {actual} 个")]
  ShapeMismatch {
    rows: usize,
    stride: usize,
    expected: usize,
    actual: usize,
  },
  #[error("张量行宽不匹配: 期望 {expected} (5 + 类别数), 实际 {actual}")]
  StrideMismatch { expected: usize, actual: usize },
  #[error("类别数必须大于 0")]
  NoClasses,
}

/// 推理输出的原始检测张量，逻辑形状为 `rows × stride`
///
/// 每行为 `[cx, cy, w, h, objectness, score_0 .. score_{n-1}]`，坐标相对模型输入分辨率。
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor {
  data: Box<[f32]>,
  rows: usize,
  stride: usize,
}

impl RawTensor {
  pub fn new(data: Vec<f32>, rows: usize, stride: usize) -> Result<Self, DecodeError> {
    let expected = rows.checked_mul(stride).unwrap_or(usize::MAX);
    if stride == 0 || data.len() != expected {
      return Err(DecodeError::ShapeMismatch {
        rows,
        stride,
        expected,
        actual: data.len(),
      });
    }
    Ok(Self {
      data: data.into_boxed_slice(),
      rows,
      stride,
    })
  }

  /// 根据行宽推断行数，元素数必须整除行宽
  pub fn with_stride(data: Vec<f32>, stride: usize) -> Result<Self, DecodeError> {
    let rows = if stride == 0 { 0 } else { data.len() / stride };
    Self::new(data, rows, stride)
  }

  pub fn rows(&self) -> usize {
    self.rows
  }

  pub fn stride(&self) -> usize {
    self.stride
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn row_iter(&self) -> std::slice::ChunksExact<'_, f32> {
    self.data.chunks_exact(self.stride)
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeConfig {
  pub num_classes: usize,
  /// objectness 阈值，低于该值的行直接丢弃
  pub objectness_threshold: f32,
  /// 最大类别分数阈值
  pub class_score_threshold: f32,
}

impl Default for DecodeConfig {
  fn default() -> Self {
    Self {
      num_classes: 80,
      objectness_threshold: 0.45,
      class_score_threshold: 0.45,
    }
  }
}

impl DecodeConfig {
  pub fn stride(&self) -> usize {
    ROW_HEADER_LEN + self.num_classes
  }

  pub fn validate(&self, tensor: &RawTensor) -> Result<(), DecodeError> {
    if self.num_classes == 0 {
      return Err(DecodeError::NoClasses);
    }
    if tensor.stride() != self.stride() {
      return Err(DecodeError::StrideMismatch {
        expected: self.stride(),
        actual: tensor.stride(),
      });
    }
    Ok(())
  }
}

/// 模型输入分辨率到目标帧分辨率的缩放系数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactors {
  pub x: f32,
  pub y: f32,
}

impl ScaleFactors {
  pub fn new(x: f32, y: f32) -> Self {
    Self { x, y }
  }

  /// `目标尺寸 / 模型输入尺寸`
  pub fn between(input: (u32, u32), target: (u32, u32)) -> Self {
    Self {
      x: target.0 as f32 / input.0 as f32,
      y: target.1 as f32 / input.1 as f32,
    }
  }
}

impl Default for ScaleFactors {
  fn default() -> Self {
    Self { x: 1.0, y: 1.0 }
  }
}

/// 解码原始张量为候选框，输出顺序与行顺序一致，未去重
pub fn decode(
  tensor: &RawTensor,
  config: &DecodeConfig,
  scale: ScaleFactors,
) -> Result<Vec<Detection>, DecodeError> {
  config.validate(tensor)?;

  let mut candidates = Vec::new();
  for row in tensor.row_iter() {
    if let Some(detection) = decode_row(row, config, scale) {
      candidates.push(detection);
    }
  }

  debug!("{} 行中解码出 {} 个候选框", tensor.rows(), candidates.len());
  Ok(candidates)
}

fn decode_row(row: &[f32], config: &DecodeConfig, scale: ScaleFactors) -> Option<Detection> {
  let objectness = row[4];
  // NaN 也视为未达阈值
  if !(objectness >= config.objectness_threshold) {
    return None;
  }

  let scores = &row[ROW_HEADER_LEN..ROW_HEADER_LEN + config.num_classes];
  let (class_id, max_score) = argmax(scores);
  if !(max_score >= config.class_score_threshold) {
    return None;
  }

  let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
  // 向零截断
  let bbox = BoundingBox {
    left: ((cx - 0.5 * w) * scale.x) as i32,
    top: ((cy - 0.5 * h) * scale.y) as i32,
    width: (w * scale.x) as i32,
    height: (h * scale.y) as i32,
  };

  Some(Detection {
    class_id: class_id as u32,
    confidence: objectness * max_score,
    bbox,
  })
}

/// 最大值及其下标，相等时取最先出现者；NaN 不参与比较
fn argmax(scores: &[f32]) -> (usize, f32) {
  let mut best = (0usize, f32::NAN);
  for (idx, &score) in scores.iter().enumerate() {
    if !score.is_nan() && (best.1.is_nan() || score > best.1) {
      best = (idx, score);
    }
  }
  best
}
