// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/replay.rs - 原始张量回放引擎
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! 回放事先导出的检测张量（小端 `f32` 原始文件），
//! 用于在没有推理硬件的机器上驱动完整流水线。
//!
//! - `replay:///data/tensor.bin?stride=85`：每帧返回同一个张量
//! - `replay:///data/tensors/?stride=85`：按文件名顺序循环目录内所有 `*.bin`

use std::{
  cell::Cell,
  path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, query_value,
  model::{Inference, ModelInput, RawTensor, decode::DecodeError},
};

/// YOLOv5 COCO 输出行宽
const DEFAULT_STRIDE: usize = 85;
const F32_BYTES: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug)]
pub enum ReplayEngineError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("张量文件 {} 长度 {len} 字节不是 f32 的整数倍", .path.display())]
  Truncated { path: PathBuf, len: usize },
  #[error("张量文件 {} 形状错误: {source}", .path.display())]
  Shape {
    path: PathBuf,
    #[source]
    source: DecodeError,
  },
  #[error("目录中没有张量文件: {}", .0.display())]
  Empty(PathBuf),
}

pub struct ReplayEngine {
  tensors: Vec<RawTensor>,
  cursor: Cell<usize>,
}

impl FromUrlWithScheme for ReplayEngine {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayEngine {
  type Error = ReplayEngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ReplayEngineError::SchemeMismatch);
    }

    let stride = query_value(url, "stride").unwrap_or(DEFAULT_STRIDE);
    Self::load(url.path(), stride)
  }
}

impl ReplayEngine {
  pub fn new(tensors: Vec<RawTensor>) -> Self {
    Self {
      tensors,
      cursor: Cell::new(0),
    }
  }

  pub fn load(path: impl AsRef<Path>, stride: usize) -> Result<Self, ReplayEngineError> {
    let path = path.as_ref();
    let files = if path.is_dir() {
      let mut files = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "bin"))
        .collect::<Vec<_>>();
      files.sort();
      files
    } else {
      vec![path.to_path_buf()]
    };

    if files.is_empty() {
      return Err(ReplayEngineError::Empty(path.to_path_buf()));
    }

    let tensors = files
      .iter()
      .map(|file| read_tensor(file, stride))
      .collect::<Result<Vec<_>, _>>()?;

    info!(
      "加载 {} 个回放张量，行宽 {}，首个张量 {} 行",
      tensors.len(),
      stride,
      tensors[0].rows()
    );
    Ok(Self::new(tensors))
  }

  pub fn len(&self) -> usize {
    self.tensors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tensors.is_empty()
  }
}

fn read_tensor(path: &Path, stride: usize) -> Result<RawTensor, ReplayEngineError> {
  let bytes = std::fs::read(path)?;
  if bytes.len() % F32_BYTES != 0 {
    return Err(ReplayEngineError::Truncated {
      path: path.to_path_buf(),
      len: bytes.len(),
    });
  }

  let data = bytes
    .chunks_exact(F32_BYTES)
    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    .collect::<Vec<_>>();

  RawTensor::with_stride(data, stride).map_err(|source| ReplayEngineError::Shape {
    path: path.to_path_buf(),
    source,
  })
}

impl Inference for ReplayEngine {
  type Input = ModelInput;
  type Error = ReplayEngineError;

  fn forward(&self, _input: &Self::Input) -> Result<RawTensor, Self::Error> {
    if self.tensors.is_empty() {
      return Err(ReplayEngineError::Empty(PathBuf::new()));
    }
    let idx = self.cursor.get();
    self.cursor.set((idx + 1) % self.tensors.len());
    Ok(self.tensors[idx].clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_tensor(path: &Path, values: &[f32]) {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(path, bytes).unwrap();
  }

  #[test]
  fn replays_single_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.bin");
    write_tensor(&path, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    let url = Url::parse(&format!("replay://{}?stride=6", path.display())).unwrap();
    let engine = ReplayEngine::from_url(&url).unwrap();
    let input = ModelInput::default();
    let tensor = engine.forward(&input).unwrap();
    assert_eq!(tensor.rows(), 1);
    assert_eq!(tensor.as_slice(), &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(engine.forward(&input).unwrap(), tensor);
  }

  #[test]
  fn cycles_directory_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    write_tensor(&dir.path().join("b.bin"), &[2.0, 2.0]);
    write_tensor(&dir.path().join("a.bin"), &[1.0, 1.0]);
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let engine = ReplayEngine::load(dir.path(), 2).unwrap();
    assert_eq!(engine.len(), 2);
    let input = ModelInput::default();
    let firsts: Vec<f32> = (0..3)
      .map(|_| engine.forward(&input).unwrap().as_slice()[0])
      .collect();
    assert_eq!(firsts, vec![1.0, 2.0, 1.0]);
  }

  #[test]
  fn rejects_malformed_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.bin");
    std::fs::write(&path, [0u8; 5]).unwrap();
    assert!(matches!(
      ReplayEngine::load(&path, 1),
      Err(ReplayEngineError::Truncated { len: 5, .. })
    ));

    write_tensor(&path, &[0.0; 7]);
    assert!(matches!(
      ReplayEngine::load(&path, 85),
      Err(ReplayEngineError::Shape { .. })
    ));

    let empty = tempfile::tempdir().unwrap();
    assert!(matches!(
      ReplayEngine::load(empty.path(), 85),
      Err(ReplayEngineError::Empty(_))
    ));
  }
}
