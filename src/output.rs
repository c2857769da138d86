// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, model::DetectResult};

/// 检测结果的消费端
///
/// 输出通常持有状态（共享内存句柄、文件路径），因此以 `&mut self` 渲染。
pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&mut self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

pub mod draw;

mod save_image_file;
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

mod shm_output;
pub use self::shm_output::{ShmOutput, ShmOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[error("共享内存输出错误: {0}")]
  ShmOutputError(#[from] ShmOutputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper<const W: u32, const H: u32> {
  SaveImageFileOutput(SaveImageFileOutput),
  ShmOutput(ShmOutput<W, H>),
}

impl<const W: u32, const H: u32> FromUrl for OutputWrapper<W, H> {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      ShmOutput::<W, H>::SCHEME => {
        let output = ShmOutput::from_url(url)?;
        Ok(OutputWrapper::ShmOutput(output))
      }
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl<const W: u32, const H: u32> Render<RgbImage, DetectResult> for OutputWrapper<W, H> {
  type Error = OutputError;

  fn render_result(&mut self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      OutputWrapper::ShmOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

/// 扇出到多个输出，遇到第一个错误即停止
impl<Frame, Output, O: Render<Frame, Output>> Render<Frame, Output> for Vec<O> {
  type Error = O::Error;

  fn render_result(&mut self, frame: &Frame, result: &Output) -> Result<(), Self::Error> {
    for output in self.iter_mut() {
      output.render_result(frame, result)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Counter(usize);

  impl Render<RgbImage, DetectResult> for Counter {
    type Error = std::convert::Infallible;

    fn render_result(&mut self, _: &RgbImage, _: &DetectResult) -> Result<(), Self::Error> {
      self.0 += 1;
      Ok(())
    }
  }

  #[test]
  fn vec_fans_out_to_every_output() {
    let mut outputs = vec![Counter(0), Counter(0), Counter(0)];
    outputs
      .render_result(&RgbImage::new(2, 2), &DetectResult::default())
      .unwrap();
    assert!(outputs.iter().all(|c| c.0 == 1));
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://localhost/live").unwrap();
    assert!(matches!(
      OutputWrapper::<4, 4>::from_url(&url),
      Err(OutputError::SchemeMismatch(s)) if s == "rtsp"
    ));
  }
}
