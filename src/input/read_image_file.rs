// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::time::Duration;

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, query_flag, query_value};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 单张图片输入
///
/// `image:///path/to/frame.jpg` 只产出一帧；
/// `image:///path/to/frame.jpg?repeat&interval_ms=33` 以固定间隔反复产出同一帧。
pub struct ImageFileInput {
  image: Option<RgbImage>,
  repeat: bool,
  interval: Duration,
  emitted: bool,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let path = url.path();
    let image = ImageReader::open(path)?.decode()?.to_rgb8();
    info!("读取图像 {}: {}x{}", path, image.width(), image.height());

    let repeat = query_flag(url, "repeat").unwrap_or(false);
    let interval = Duration::from_millis(query_value(url, "interval_ms").unwrap_or(33));
    Ok(Self::new(image, repeat, interval))
  }
}

impl ImageFileInput {
  pub fn new(image: RgbImage, repeat: bool, interval: Duration) -> Self {
    Self {
      image: Some(image),
      repeat,
      interval,
      emitted: false,
    }
  }
}

impl Iterator for ImageFileInput {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    if !self.repeat {
      return self.image.take();
    }

    // 首帧立即产出，之后按间隔节流
    if self.emitted && !self.interval.is_zero() {
      std::thread::sleep(self.interval);
    }
    self.emitted = true;
    self.image.clone()
  }
}
