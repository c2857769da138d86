// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use tracing::debug;

use crate::model::{BoundingBox, Detection};

/// 抑制范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuppressionPolicy {
  /// 不区分类别，任何重叠的高分框都会抑制低分框
  #[default]
  ClassAgnostic,
  /// 只在同类别之间抑制
  PerClass,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmsConfig {
  /// IoU 大于等于该值即视为重复
  pub iou_threshold: f32,
  /// 抑制前只保留置信度严格高于该值的候选框
  pub score_threshold: f32,
  /// 最多保留的框数
  pub max_detections: Option<usize>,
  pub policy: SuppressionPolicy,
}

impl Default for NmsConfig {
  fn default() -> Self {
    Self {
      iou_threshold: 0.5,
      score_threshold: 0.0,
      max_detections: None,
      policy: SuppressionPolicy::ClassAgnostic,
    }
  }
}

impl BoundingBox {
  pub fn area(&self) -> i64 {
    if self.width <= 0 || self.height <= 0 {
      0
    } else {
      self.width as i64 * self.height as i64
    }
  }

  pub fn intersection_area(&self, other: &BoundingBox) -> i64 {
    let l = self.left.max(other.left) as i64;
    let t = self.top.max(other.top) as i64;
    let r = (self.left as i64 + self.width as i64).min(other.left as i64 + other.width as i64);
    let b = (self.top as i64 + self.height as i64).min(other.top as i64 + other.height as i64);
    (r - l).max(0) * (b - t).max(0)
  }

  /// 交并比，任一框面积为 0 时返回 0
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let (area_a, area_b) = (self.area(), other.area());
    if area_a == 0 || area_b == 0 {
      return 0.0;
    }
    let inter = self.intersection_area(other);
    let union = area_a + area_b - inter;
    if union <= 0 {
      return 0.0;
    }
    (inter as f64 / union as f64) as f32
  }
}

/// 贪心非极大值抑制，返回保留下来的候选框下标
///
/// 按置信度降序遍历，置信度相同按下标先后；
/// 若与任一已保留框的 IoU ≥ 阈值则丢弃。返回顺序为保留顺序，调用方不应依赖。
pub fn suppress(candidates: &[Detection], config: &NmsConfig) -> Vec<usize> {
  let mut order: Vec<usize> = (0..candidates.len())
    .filter(|&i| candidates[i].confidence > config.score_threshold)
    .collect();
  // 稳定排序，同分保持发射顺序
  order.sort_by(|&a, &b| {
    candidates[b]
      .confidence
      .total_cmp(&candidates[a].confidence)
  });

  let limit = config.max_detections.unwrap_or(usize::MAX);
  let mut keep: Vec<usize> = Vec::with_capacity(order.len().min(limit));

  for idx in order {
    if keep.len() >= limit {
      break;
    }
    let candidate = &candidates[idx];
    let duplicated = keep.iter().any(|&k| {
      let kept = &candidates[k];
      let comparable = match config.policy {
        SuppressionPolicy::ClassAgnostic => true,
        SuppressionPolicy::PerClass => kept.class_id == candidate.class_id,
      };
      comparable && kept.bbox.iou(&candidate.bbox) >= config.iou_threshold
    });
    if !duplicated {
      keep.push(idx);
    }
  }

  debug!("NMS: {} 个候选框保留 {} 个", candidates.len(), keep.len());
  keep
}
