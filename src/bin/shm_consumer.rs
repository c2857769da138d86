// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/shm_consumer.rs - 共享内存帧参考消费者
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  path::PathBuf,
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use url::Url;

use shanan_shm::{
  FRAME_HEIGHT, FRAME_WIDTH,
  channel::{ChannelError, FrameChannel, path_from_url},
  frame::RgbFrame,
  task::StopSignal,
};

type SharedFrame = RgbFrame<FRAME_WIDTH, FRAME_HEIGHT>;

/// 生产者尚未启动时重新连接的间隔
const ATTACH_RETRY: Duration = Duration::from_millis(500);
/// 单次等待帧的上限，超时后检查停止信号再继续等待
const RECEIVE_SLICE: Duration = Duration::from_millis(200);

/// 共享内存消费者参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 共享内存，例如 shm://YoloIPC_SharedMemory
  #[arg(long, value_name = "CHANNEL", default_value = "shm://YoloIPC_SharedMemory")]
  pub channel: Url,
  /// 保存帧的目录
  #[arg(long, value_name = "DIR")]
  pub save: Option<PathBuf>,
  /// 每 N 帧保存一次
  #[arg(long, default_value_t = 1, value_name = "N")]
  pub every: usize,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  anyhow::ensure!(args.every > 0, "--every 必须大于 0");
  let path = path_from_url(&args.channel)
    .with_context(|| format!("无法从 {} 解析共享内存路径", args.channel))?;

  if let Some(dir) = &args.save {
    std::fs::create_dir_all(dir)?;
    info!("帧将保存到: {}", dir.display());
  }

  let stop = StopSignal::ctrlc()?;
  let capacity = 1 + SharedFrame::BYTE_LEN;
  let Some(mut channel) =
    FrameChannel::attach_with_retry(&path, capacity, ATTACH_RETRY, || stop.is_raised())?
  else {
    warn!("未连接到共享内存即退出");
    return Ok(());
  };
  info!("已连接共享内存: {}", path.display());

  let mut frame = SharedFrame::default();
  let mut received = 0usize;
  let mut last = Instant::now();

  while !stop.is_raised() {
    match channel.receive_timeout(frame.as_mut(), RECEIVE_SLICE) {
      Ok(()) => {}
      Err(ChannelError::Timeout(_)) => continue,
      Err(e) => return Err(e.into()),
    }
    received += 1;
    debug!("收到第 {} 帧, 间隔 {:.2?}", received, last.elapsed());
    last = Instant::now();

    if let Some(dir) = &args.save
      && received % args.every == 0
    {
      let file = dir.join(format!("frame_{:06}.png", received));
      frame.to_rgb_image().save(&file)?;
      debug!("保存帧: {}", file.display());
    }

    if args.frame_number.is_some_and(|n| received >= n) {
      info!("达到指定帧数 {}, 退出", received);
      break;
    }
  }

  info!("消费者退出: 共收到 {} 帧", received);
  channel.close()?;
  Ok(())
}
