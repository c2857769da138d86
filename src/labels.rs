// 该文件是 Shanan （山南西风） 项目的一部分。
// src/labels.rs - 类别名称表
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

use std::{path::Path, sync::Arc};

use thiserror::Error;
use tracing::debug;

const COCO_LABELS: &str = include_str!("../labels/coco.json");

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("类别表格式错误: {0}")]
  FormatError(#[from] serde_json::Error),
  #[error("类别表为空")]
  Empty,
}

/// 类别 ID 到名称的只读映射
///
/// 启动时注入，检测器与绘制逻辑只持有其共享引用，更换模型时不需要改动解码代码。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
  names: Arc<[Arc<str>]>,
}

impl LabelTable {
  /// 从 JSON 字符串数组构造，例如 `["person", "bicycle"]`
  pub fn from_json(text: &str) -> Result<Self, LabelError> {
    let names: Vec<String> = serde_json::from_str(text)?;
    Self::from_names(names)
  }

  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let table = Self::from_json(&text)?;
    debug!(
      "从 {} 加载 {} 个类别",
      path.as_ref().display(),
      table.len()
    );
    Ok(table)
  }

  pub fn from_names<I, S>(names: I) -> Result<Self, LabelError>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let names: Arc<[Arc<str>]> = names.into_iter().map(|s| Arc::from(s.as_ref())).collect();
    if names.is_empty() {
      return Err(LabelError::Empty);
    }
    Ok(Self { names })
  }

  /// COCO 80 类
  pub fn coco() -> Result<Self, LabelError> {
    Self::from_json(COCO_LABELS)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn get(&self, class_id: u32) -> Option<&Arc<str>> {
    self.names.get(class_id as usize)
  }

  /// 查找类别名称，未知 ID 返回 `class<ID>`
  pub fn name(&self, class_id: u32) -> Arc<str> {
    self
      .get(class_id)
      .cloned()
      .unwrap_or_else(|| Arc::from(format!("class{}", class_id)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn coco_table_has_80_classes() {
    let table = LabelTable::coco().unwrap();
    assert_eq!(table.len(), 80);
    assert_eq!(table.name(0).as_ref(), "person");
    assert_eq!(table.name(79).as_ref(), "toothbrush");
  }

  #[test]
  fn unknown_class_falls_back_to_id() {
    let table = LabelTable::from_names(["a", "b"]).unwrap();
    assert_eq!(table.name(1).as_ref(), "b");
    assert_eq!(table.name(7).as_ref(), "class7");
  }

  #[test]
  fn rejects_empty_and_malformed_tables() {
    assert!(matches!(LabelTable::from_json("[]"), Err(LabelError::Empty)));
    assert!(matches!(
      LabelTable::from_json("{\"a\": 1}"),
      Err(LabelError::FormatError(_))
    ));
  }

  #[test]
  fn loads_table_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.json");
    std::fs::write(&path, "[\"cat\", \"dog\"]").unwrap();
    let table = LabelTable::from_path(&path).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.name(1).as_ref(), "dog");
  }
}
