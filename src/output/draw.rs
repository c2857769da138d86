// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use ab_glyph::{FontVec, InvalidFont, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;

use crate::model::{DetectItem, DetectResult};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
/// 文字底边与框顶之间的间距
const LABEL_OFFSET: i32 = 5;
const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const LABEL_COLOR: [u8; 3] = [0, 0, 0]; // 黑色
const BOX_THICKNESS: i32 = 2;

#[derive(Error, Debug)]
pub enum FontError {
  #[error("读取字体文件失败: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(#[from] InvalidFont),
}

/// 在帧上绘制检测框与 `"{类别} {置信度}"` 标签
///
/// 未配置字体时只画框。
pub struct Draw {
  font: Option<FontVec>,
  font_size: f32,
  color: Rgb<u8>,
  text_color: Rgb<u8>,
  thickness: i32,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font: None,
      font_size: LABEL_FONT_SIZE,
      color: Rgb(BOX_COLOR),
      text_color: Rgb(LABEL_COLOR),
      thickness: BOX_THICKNESS,
    }
  }
}

impl Draw {
  pub fn with_font(mut self, font: FontVec) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_font_file(self, path: impl AsRef<Path>) -> Result<Self, FontError> {
    let path = path.as_ref();
    let font = FontVec::try_from_vec(std::fs::read(path)?)?;
    info!("加载标签字体: {}", path.display());
    Ok(self.with_font(font))
  }

  pub fn with_text_color(mut self, color: Rgb<u8>) -> Self {
    self.text_color = color;
    self
  }

  pub fn text_color(&self) -> Rgb<u8> {
    self.text_color
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn draw_detections(&self, image: &mut RgbImage, result: &DetectResult) {
    for item in result.items.iter() {
      self.draw_item(image, item);
    }
  }

  fn draw_item(&self, image: &mut RgbImage, item: &DetectItem) {
    let bbox = &item.bbox;
    if bbox.width <= 0 || bbox.height <= 0 {
      return;
    }

    // 向内加粗，框外沿与检测框一致；imageproc 会裁掉画布外的部分
    for t in 0..self.thickness {
      let (w, h) = (bbox.width - 2 * t, bbox.height - 2 * t);
      if w <= 0 || h <= 0 {
        break;
      }
      let rect = Rect::at(bbox.left + t, bbox.top + t).of_size(w as u32, h as u32);
      draw_hollow_rect_mut(image, rect, self.color);
    }

    if let Some(font) = &self.font {
      let label = format!("{} {:.2}", item.kind.name, item.score);
      let y = (bbox.top - LABEL_OFFSET - self.font_size as i32).max(0);
      draw_text_mut(
        image,
        self.text_color,
        bbox.left.max(0),
        y,
        PxScale::from(self.font_size),
        font,
        &label,
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{BoundingBox, ClassLabel};

  fn result(bbox: BoundingBox) -> DetectResult {
    DetectResult {
      items: vec![DetectItem {
        kind: ClassLabel {
          id: 0,
          name: "person".into(),
        },
        score: 0.9,
        bbox,
      }]
      .into_boxed_slice(),
    }
  }

  #[test]
  fn draws_two_pixel_green_border() {
    let mut image = RgbImage::new(32, 32);
    let bbox = BoundingBox {
      left: 4,
      top: 4,
      width: 20,
      height: 10,
    };
    Draw::default().draw_detections(&mut image, &result(bbox));

    let green = Rgb(BOX_COLOR);
    assert_eq!(*image.get_pixel(4, 4), green);
    assert_eq!(*image.get_pixel(5, 5), green);
    assert_eq!(*image.get_pixel(23, 13), green);
    assert_eq!(*image.get_pixel(6, 6), Rgb([0, 0, 0]));
    assert_eq!(*image.get_pixel(14, 9), Rgb([0, 0, 0]));
  }

  #[test]
  fn boxes_outside_the_frame_are_clipped() {
    let mut image = RgbImage::new(16, 16);
    let bbox = BoundingBox {
      left: -10,
      top: -10,
      width: 100,
      height: 100,
    };
    Draw::default().draw_detections(&mut image, &result(bbox));

    let empty = BoundingBox {
      width: 0,
      ..bbox
    };
    Draw::default().draw_detections(&mut image, &result(empty));
  }

  #[test]
  fn labels_use_their_own_color() {
    let draw = Draw::default();
    assert_eq!(draw.text_color(), Rgb([0, 0, 0]));
    assert_ne!(draw.text_color(), Rgb(BOX_COLOR));

    let draw = draw.with_text_color(Rgb([255, 255, 255]));
    assert_eq!(draw.text_color(), Rgb([255, 255, 255]));
  }

  #[test]
  fn missing_font_file_is_an_error() {
    assert!(matches!(
      Draw::default().with_font_file("/no/such/font.ttf"),
      Err(FontError::IoError(_))
    ));
  }
}
