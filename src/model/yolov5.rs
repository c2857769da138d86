// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolov5.rs - RKNN YOLOv5 推理引擎
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, query_value,
  model::{Inference, ModelInput, RawTensor, decode::DecodeError},
};

const YOLOV5_NUM_INPUTS: u32 = 1;
const YOLOV5_NUM_OUTPUTS: u32 = 1;
/// 640×640 输入时三个检测头共 (80² + 40² + 20²) × 3 个锚框
const YOLOV5_EXPECTED_ROWS: usize = 25200;
const YOLOV5_DEFAULT_STRIDE: usize = 85;

#[derive(Error, Debug)]
pub enum Yolov5RknnError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
  #[error("读取输出失败: {0}")]
  OutputError(String),
  #[error("输出张量形状错误: {0}")]
  ShapeError(#[from] DecodeError),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

impl From<rknpu::Error> for Yolov5RknnError {
  fn from(err: rknpu::Error) -> Self {
    Yolov5RknnError::RknnError(err)
  }
}

impl Yolov5RknnError {
  fn invalid(msg: &str, e: rknpu::Error) -> Self {
    Yolov5RknnError::ModelInvalid(msg.to_string(), e)
  }
}

/// YOLOv5 单输出模型，输出 `[1, rows, 5 + 类别数]`
///
/// 归一化（`/255`）与通道顺序在 RKNN 模型转换时配置，这里直接喂入 NHWC `u8`。
pub struct Yolov5Rknn {
  context: Context,
  stride: usize,
}

impl FromUrlWithScheme for Yolov5Rknn {
  const SCHEME: &'static str = "rknn";
}

impl FromUrl for Yolov5Rknn {
  type Error = Yolov5RknnError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(Yolov5RknnError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let stride = query_value(url, "stride").unwrap_or(YOLOV5_DEFAULT_STRIDE);
    Self::load(url.path(), stride)
  }
}

impl Yolov5Rknn {
  pub fn load(model_path: &str, stride: usize) -> Result<Self, Yolov5RknnError> {
    info!("加载模型文件: {}", model_path);
    let model_data = std::fs::read(model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, InitFlags::default())?;

    let num_inputs = context
      .num_inputs()
      .map_err(|e| Yolov5RknnError::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| Yolov5RknnError::invalid("无法获取输出数量", e))?;

    if num_inputs != YOLOV5_NUM_INPUTS || num_outputs != YOLOV5_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLOV5_NUM_INPUTS, YOLOV5_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(Yolov5RknnError::invalid(&msg, rknpu::Error::InvalidModel));
    }

    info!("模型加载完成");
    Ok(Self { context, stride })
  }
}

impl Inference for Yolov5Rknn {
  type Input = ModelInput;
  type Error = Yolov5RknnError;

  fn forward(&self, input: &Self::Input) -> Result<RawTensor, Self::Error> {
    debug!("设置模型输入");
    self
      .context
      .set_input(0, input.as_bytes(), TensorFormat::NHWC, TensorType::UInt8)?;

    debug!("执行模型推理");
    self.context.run()?;

    let output = self.context.get_outputs()?;
    let data = output
      .get_f32(0)
      .map_err(|e| Yolov5RknnError::OutputError(e.to_string()))?;

    let tensor = RawTensor::with_stride(data.to_vec(), self.stride)?;
    if tensor.rows() != YOLOV5_EXPECTED_ROWS {
      debug!(
        "输出行数 {} 与 640×640 输入的典型值 {} 不同，按实际形状解码",
        tensor.rows(),
        YOLOV5_EXPECTED_ROWS
      );
    }
    Ok(tensor)
  }
}
