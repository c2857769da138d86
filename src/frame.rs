// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 固定尺寸 RGB8 帧定义
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

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
#[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
pub struct FrameSizeError {
  pub expected: usize,
  pub actual: usize,
}

/// `W×H×3` 的 RGB8 帧，行优先、无填充（NHWC 排布）
///
/// 既用作模型输入，也是写入共享内存的像素区。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame<const W: u32, const H: u32> {
  data: Box<[u8]>,
}

impl<const W: u32, const H: u32> RgbFrame<W, H> {
  pub const BYTE_LEN: usize = RGB_CHANNELS * W as usize * H as usize;

  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// 将任意尺寸的图像直接缩放到 `W×H`（不做 letterbox，宽高比会被拉伸）
  pub fn resize_from(image: &RgbImage) -> Self {
    if image.dimensions() == (W, H) {
      return Self {
        data: image.as_raw().clone().into_boxed_slice(),
      };
    }

    let resized = image::imageops::resize(image, W, H, FilterType::Triangle);
    Self {
      data: resized.into_raw().into_boxed_slice(),
    }
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    // 长度在构造时已校验
    RgbImage::from_raw(W, H, self.data.to_vec()).unwrap_or_else(|| RgbImage::new(W, H))
  }
}

impl<const W: u32, const H: u32> Default for RgbFrame<W, H> {
  fn default() -> Self {
    Self {
      data: vec![0u8; Self::BYTE_LEN].into_boxed_slice(),
    }
  }
}

impl<const W: u32, const H: u32> TryFrom<Vec<u8>> for RgbFrame<W, H> {
  type Error = FrameSizeError;

  fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
    if data.len() != Self::BYTE_LEN {
      return Err(FrameSizeError {
        expected: Self::BYTE_LEN,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
    })
  }
}

impl<const W: u32, const H: u32> AsRef<[u8]> for RgbFrame<W, H> {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

impl<const W: u32, const H: u32> AsMut<[u8]> for RgbFrame<W, H> {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}
