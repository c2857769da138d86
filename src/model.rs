// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Arc;

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::{FromUrl, frame::RgbFrame, labels::LabelTable};

pub mod decode;
pub mod nms;
mod replay;
#[cfg(feature = "model_yolov5_rknn")]
mod yolov5;

pub use self::decode::{DecodeConfig, DecodeError, RawTensor, ScaleFactors};
pub use self::nms::{NmsConfig, SuppressionPolicy};
pub use self::replay::{ReplayEngine, ReplayEngineError};
#[cfg(feature = "model_yolov5_rknn")]
pub use self::yolov5::{Yolov5Rknn, Yolov5RknnError};

/// 模型输入分辨率
pub const MODEL_INPUT_W: u32 = 640;
pub const MODEL_INPUT_H: u32 = 640;

/// 模型输入帧：640×640 RGB8，直接缩放，不做 letterbox
pub type ModelInput = RgbFrame<MODEL_INPUT_W, MODEL_INPUT_H>;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 推理引擎：给定预处理后的输入，返回原始检测张量
pub trait Inference {
  type Input;
  type Error;

  fn forward(&self, input: &Self::Input) -> Result<RawTensor, Self::Error>;
}

/// 目标帧像素坐标下的轴对齐框
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundingBox {
  pub left: i32,
  pub top: i32,
  pub width: i32,
  pub height: i32,
}

/// 解码得到的候选框，一旦生成不再修改
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
  pub class_id: u32,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabel {
  pub id: u32,
  pub name: Arc<str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub kind: ClassLabel,
  pub score: f32,
  pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

#[derive(Error, Debug)]
pub enum DetectError<E: std::error::Error + 'static> {
  #[error("推理失败: {0}")]
  Inference(#[source] E),
  #[error("张量解码失败: {0}")]
  Decode(#[from] DecodeError),
}

/// 检测器：缩放 → 推理 → 解码 → NMS → 标注类别
pub struct Detector<E> {
  engine: E,
  decode: DecodeConfig,
  nms: NmsConfig,
  labels: LabelTable,
}

impl<E> Detector<E> {
  pub fn new(engine: E, labels: LabelTable) -> Self {
    let decode = DecodeConfig {
      num_classes: labels.len(),
      ..DecodeConfig::default()
    };
    Self {
      engine,
      decode,
      nms: NmsConfig::default(),
      labels,
    }
  }

  pub fn with_decode_config(mut self, decode: DecodeConfig) -> Self {
    if decode.num_classes != self.labels.len() {
      warn!(
        "类别数 {} 与类别表长度 {} 不一致，未知类别将以 ID 显示",
        decode.num_classes,
        self.labels.len()
      );
    }
    self.decode = decode;
    self
  }

  pub fn with_nms_config(mut self, nms: NmsConfig) -> Self {
    self.nms = nms;
    self
  }

  pub fn engine(&self) -> &E {
    &self.engine
  }

  pub fn labels(&self) -> &LabelTable {
    &self.labels
  }

  /// 对已有张量执行解码与 NMS
  pub fn postprocess(
    &self,
    tensor: &RawTensor,
    scale: ScaleFactors,
  ) -> Result<DetectResult, DecodeError> {
    let candidates = decode::decode(tensor, &self.decode, scale)?;
    let keep = nms::suppress(&candidates, &self.nms);

    let items = keep
      .into_iter()
      .map(|idx| {
        let Detection {
          class_id,
          confidence,
          bbox,
        } = candidates[idx];
        DetectItem {
          kind: ClassLabel {
            id: class_id,
            name: self.labels.name(class_id),
          },
          score: confidence,
          bbox,
        }
      })
      .collect();

    Ok(DetectResult { items })
  }
}

impl<E> Model for Detector<E>
where
  E: Inference<Input = ModelInput>,
  E::Error: std::error::Error + 'static,
{
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = DetectError<E::Error>;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let now = std::time::Instant::now();
    let model_input = ModelInput::resize_from(input);
    let tensor = self
      .engine
      .forward(&model_input)
      .map_err(DetectError::Inference)?;
    debug!("前向推理耗时: {:.2?}", now.elapsed());

    let scale = ScaleFactors::between((MODEL_INPUT_W, MODEL_INPUT_H), input.dimensions());
    let result = self.postprocess(&tensor, scale)?;
    debug!("检测到 {} 个物体", result.len());
    Ok(result)
  }
}

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("回放引擎错误: {0}")]
  ReplayEngineError(#[from] ReplayEngineError),
  #[cfg(feature = "model_yolov5_rknn")]
  #[error("RKNN YOLOv5 错误: {0}")]
  Yolov5RknnError(#[from] Yolov5RknnError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum EngineWrapper {
  Replay(ReplayEngine),
  #[cfg(feature = "model_yolov5_rknn")]
  Yolov5Rknn(Yolov5Rknn),
}

impl FromUrl for EngineWrapper {
  type Error = EngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    match url.scheme() {
      ReplayEngine::SCHEME => Ok(EngineWrapper::Replay(ReplayEngine::from_url(url)?)),
      #[cfg(feature = "model_yolov5_rknn")]
      Yolov5Rknn::SCHEME => Ok(EngineWrapper::Yolov5Rknn(Yolov5Rknn::from_url(url)?)),
      other => Err(EngineError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Inference for EngineWrapper {
  type Input = ModelInput;
  type Error = EngineError;

  fn forward(&self, input: &Self::Input) -> Result<RawTensor, Self::Error> {
    match self {
      EngineWrapper::Replay(engine) => engine.forward(input).map_err(EngineError::from),
      #[cfg(feature = "model_yolov5_rknn")]
      EngineWrapper::Yolov5Rknn(engine) => engine.forward(input).map_err(EngineError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;
  use std::cell::Cell;

  /// 返回固定张量并记录收到的输入尺寸
  struct FixedEngine {
    tensor: RawTensor,
    calls: Cell<usize>,
  }

  #[derive(Error, Debug)]
  #[error("never")]
  struct Never;

  impl Inference for FixedEngine {
    type Input = ModelInput;
    type Error = Never;

    fn forward(&self, input: &Self::Input) -> Result<RawTensor, Self::Error> {
      assert_eq!(input.as_bytes().len(), ModelInput::BYTE_LEN);
      self.calls.set(self.calls.get() + 1);
      Ok(self.tensor.clone())
    }
  }

  fn labels() -> LabelTable {
    LabelTable::from_names(["person", "car", "dog"]).unwrap()
  }

  fn row(cx: f32, cy: f32, w: f32, h: f32, obj: f32, scores: [f32; 3]) -> Vec<f32> {
    let mut row = vec![cx, cy, w, h, obj];
    row.extend_from_slice(&scores);
    row
  }

  #[test]
  fn detector_scales_boxes_to_frame_and_labels_them() {
    let rows = [
      row(320.0, 320.0, 64.0, 64.0, 0.9, [0.1, 0.9, 0.0]),
      row(322.0, 320.0, 64.0, 64.0, 0.8, [0.9, 0.1, 0.0]), // 与第一个重叠，被抑制
      row(100.0, 100.0, 20.0, 20.0, 0.1, [0.9, 0.0, 0.0]),
    ];
    let engine = FixedEngine {
      tensor: RawTensor::new(rows.concat(), 3, 8).unwrap(),
      calls: Cell::new(0),
    };
    let detector = Detector::new(engine, labels());

    let frame = RgbImage::from_pixel(1280, 320, Rgb([0, 0, 0]));
    let result = detector.infer(&frame).unwrap();

    assert_eq!(detector.engine().calls.get(), 1);
    assert_eq!(result.len(), 1);
    let item = &result.items[0];
    assert_eq!(item.kind.id, 1);
    assert_eq!(item.kind.name.as_ref(), "car");
    assert_eq!(
      item.bbox,
      BoundingBox {
        left: 576,
        top: 144,
        width: 128,
        height: 32
      }
    );
  }

  #[test]
  fn detector_reports_shape_errors() {
    let engine = FixedEngine {
      tensor: RawTensor::new(vec![0.0; 12], 2, 6).unwrap(),
      calls: Cell::new(0),
    };
    let detector = Detector::new(engine, labels());
    let frame = RgbImage::new(64, 64);
    assert!(matches!(
      detector.infer(&frame),
      Err(DetectError::Decode(DecodeError::StrideMismatch {
        expected: 8,
        actual: 6
      }))
    ));
  }

  #[test]
  fn unknown_engine_scheme_is_rejected() {
    let url = Url::parse("onnx:///model.onnx").unwrap();
    assert!(matches!(
      EngineWrapper::from_url(&url),
      Err(EngineError::SchemeMismatch(_))
    ));
  }
}
