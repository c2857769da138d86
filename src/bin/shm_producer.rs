// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/shm_producer.rs - 检测并通过共享内存发布标注帧
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use shanan_shm::{
  FRAME_HEIGHT, FRAME_WIDTH, FromUrl,
  input::InputWrapper,
  labels::LabelTable,
  model::{DecodeConfig, Detector, EngineWrapper, NmsConfig, SuppressionPolicy},
  output::OutputWrapper,
  task::{ContinuousTask, StopSignal, Task},
};

/// 共享内存生产者参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 推理引擎，例如 rknn:///models/yolov5s.rknn 或 replay:///data/tensors/
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，例如 image:///data/bus.jpg?repeat 或 gst://camera/dev/video0
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，可重复；默认发布到 shm://YoloIPC_SharedMemory
  #[arg(long, value_name = "OUTPUT", default_value = "shm://YoloIPC_SharedMemory")]
  pub output: Vec<Url>,

  /// 类别名称 JSON 数组文件，缺省为内置 COCO 类别
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
  /// 模型输出的类别数
  #[arg(long, value_name = "N")]
  pub num_classes: Option<usize>,
  /// 目标置信度阈值
  #[arg(long, default_value_t = 0.45, value_name = "THRESHOLD")]
  pub objectness: f32,
  /// 类别分数阈值
  #[arg(long, default_value_t = 0.45, value_name = "THRESHOLD")]
  pub class_score: f32,
  /// NMS IoU 阈值
  #[arg(long, default_value_t = 0.50, value_name = "THRESHOLD")]
  pub nms_iou: f32,
  /// NMS 前按最终置信度过滤
  #[arg(long, default_value_t = 0.45, value_name = "THRESHOLD")]
  pub score_threshold: f32,
  /// 每帧最多保留的检测框数
  #[arg(long, value_name = "N")]
  pub max_detections: Option<usize>,
  /// 只在同类别之间做 NMS
  #[arg(long)]
  pub per_class_nms: bool,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  for output in args.output.iter() {
    info!("输出: {}", output);
  }

  let labels = match &args.labels {
    Some(path) => LabelTable::from_path(path)?,
    None => LabelTable::coco()?,
  };
  let decode = DecodeConfig {
    num_classes: args.num_classes.unwrap_or(labels.len()),
    objectness_threshold: args.objectness,
    class_score_threshold: args.class_score,
  };
  anyhow::ensure!(decode.num_classes > 0, "类别数必须大于 0");
  let nms = NmsConfig {
    iou_threshold: args.nms_iou,
    score_threshold: args.score_threshold,
    max_detections: args.max_detections,
    policy: if args.per_class_nms {
      SuppressionPolicy::PerClass
    } else {
      SuppressionPolicy::ClassAgnostic
    },
  };

  let engine = EngineWrapper::from_url(&args.model)?;
  let model = Detector::new(engine, labels)
    .with_decode_config(decode)
    .with_nms_config(nms);
  let mut input = InputWrapper::from_url(&args.input)?;
  let outputs = args
    .output
    .iter()
    .map(OutputWrapper::<FRAME_WIDTH, FRAME_HEIGHT>::from_url)
    .collect::<Result<Vec<_>, _>>()?;

  let stop = StopSignal::ctrlc()?;
  let report = ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .with_stop_signal(stop)
    .run_task(&mut input, model, outputs)?;

  info!(
    "生产者退出: 采集 {} 帧, 发布 {} 帧, 跳过 {} 帧",
    report.frames, report.published, report.skipped
  );

  // 采集失败同样会结束迭代
  if let Some(e) = input.take_error() {
    return Err(anyhow::Error::new(e).context("采集失败，生产者异常退出"));
  }
  Ok(())
}
