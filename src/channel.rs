// 该文件是 Shanan （山南西风） 项目的一部分。
// src/channel.rs - 单槽共享内存帧通道
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

//! # 单槽共享内存帧通道
//!
//! 生产者与（进程外的）消费者共享一块 `1 + 帧字节数` 的内存：
//!
//! ```text
//! 偏移 0      : 标志位 u8，0 = 空（消费者已读），1 = 满（消费者必须读取）
//! 偏移 1..end : 当前帧的原始像素
//! ```
//!
//! 生产者只在标志为 0 时写像素区，写完后才把标志置 1；
//! 消费者只在标志为 1 时读像素区，读完后才把标志置 0。
//! 通道不是队列：慢消费者会让生产者阻塞等待，协议本身不会丢帧。
//!
//! 标志位通过映射内存上的 `AtomicU8` 以 acquire/release 访问，
//! 保证标志翻转前的像素写入对另一进程可见。
//!
//! ```no_run
//! use shanan_shm::channel::FrameChannel;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut channel = FrameChannel::open("/dev/shm/YoloIPC_SharedMemory", 1 + 640 * 640 * 3)?;
//! channel.publish(&vec![0u8; 640 * 640 * 3])?;
//! channel.close()?;
//! # Ok(())
//! # }
//! ```

use std::{
  fs::OpenOptions,
  io::ErrorKind,
  path::{Path, PathBuf},
  sync::atomic::{AtomicU8, Ordering},
  thread,
  time::{Duration, Instant},
};

use memmap2::MmapMut;
use thiserror::Error;
use tracing::{debug, info, warn};

const FLAG_OFFSET: usize = 0;
const DATA_OFFSET: usize = 1;
const FLAG_EMPTY: u8 = 0;
const FLAG_FULL: u8 = 1;

/// 默认轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum ChannelError {
  #[error("无法创建共享内存 {}: {source}", .path.display())]
  Create {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("共享内存尚未就绪: {}", .0.display())]
  NotReady(PathBuf),
  #[error("共享内存容量无效: {0}，至少需要 2 字节")]
  InvalidCapacity(usize),
  #[error("共享内存容量不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  CapacityMismatch { expected: usize, actual: usize },
  #[error("帧大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("等待对端超时: {0:?}")]
  Timeout(Duration),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

impl ChannelError {
  /// 生产者尚未创建完共享内存，稍后重试即可
  pub fn is_not_ready(&self) -> bool {
    match self {
      ChannelError::NotReady(_) => true,
      ChannelError::Create { source, .. } => source.kind() == ErrorKind::NotFound,
      _ => false,
    }
  }
}

/// 标志位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFlag {
  /// 0：消费者已读，生产者可写
  Empty,
  /// 1：帧待读，生产者必须等待
  Full,
}

/// 将共享内存名称解析为映射文件路径
///
/// Linux 上位于 `/dev/shm`，其他平台位于系统临时目录。
pub fn shm_path(name: &str) -> PathBuf {
  let shm_dir = Path::new("/dev/shm");
  if cfg!(target_os = "linux") && shm_dir.is_dir() {
    shm_dir.join(name)
  } else {
    std::env::temp_dir().join(name)
  }
}

/// 从 `shm://名称` 或 `shm:///绝对路径` 解析映射文件路径
pub fn path_from_url(url: &url::Url) -> Option<PathBuf> {
  match url.host_str() {
    Some(name) if !name.is_empty() => Some(shm_path(name)),
    _ if url.path().len() > 1 => Some(PathBuf::from(url.path())),
    _ => None,
  }
}

pub struct FrameChannel {
  map: MmapMut,
  path: PathBuf,
  capacity: usize,
  created: bool,
  remove_on_close: bool,
  poll_interval: Duration,
}

impl std::fmt::Debug for FrameChannel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FrameChannel")
      .field("path", &self.path)
      .field("capacity", &self.capacity)
      .field("created", &self.created)
      .field("flag", &self.flag())
      .finish()
  }
}

impl FrameChannel {
  /// 创建或连接共享内存
  ///
  /// 首次创建时文件被扩展到 `capacity` 字节，内容全零，因此标志为 0。
  pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, ChannelError> {
    let path = path.as_ref().to_path_buf();
    check_capacity(capacity)?;

    let create_error = |source| ChannelError::Create {
      path: path.clone(),
      source,
    };

    let (file, created) = match OpenOptions::new()
      .read(true)
      .write(true)
      .create_new(true)
      .open(&path)
    {
      Ok(file) => {
        file.set_len(capacity as u64).map_err(create_error)?;
        (file, true)
      }
      Err(e) if e.kind() == ErrorKind::AlreadyExists => {
        let file = OpenOptions::new()
          .read(true)
          .write(true)
          .open(&path)
          .map_err(create_error)?;
        (file, false)
      }
      Err(e) => return Err(create_error(e)),
    };

    Self::map_file(&file, path, capacity, created)
  }

  /// 仅连接已存在的共享内存（消费者侧），从不创建文件
  ///
  /// 文件不存在时返回 `Create`（`NotFound`）；文件存在但创建者尚未设置长度时返回
  /// `NotReady`。两者都可用 [`ChannelError::is_not_ready`] 判断后重试。
  pub fn attach(path: impl AsRef<Path>, capacity: usize) -> Result<Self, ChannelError> {
    let path = path.as_ref().to_path_buf();
    check_capacity(capacity)?;

    let file = match OpenOptions::new().read(true).write(true).open(&path) {
      Ok(file) => file,
      Err(source) => return Err(ChannelError::Create { path, source }),
    };
    // create_new 与 set_len 之间文件长度为 0
    if file.metadata()?.len() == 0 {
      return Err(ChannelError::NotReady(path));
    }

    let mut channel = Self::map_file(&file, path, capacity, false)?;
    channel.remove_on_close = false;
    Ok(channel)
  }

  /// 反复 [`attach`](Self::attach) 直到共享内存就绪；`should_stop` 返回 true 时放弃并返回 `None`
  pub fn attach_with_retry(
    path: impl AsRef<Path>,
    capacity: usize,
    retry: Duration,
    should_stop: impl Fn() -> bool,
  ) -> Result<Option<Self>, ChannelError> {
    let path = path.as_ref();
    let mut waiting = false;
    while !should_stop() {
      match Self::attach(path, capacity) {
        Ok(channel) => return Ok(Some(channel)),
        Err(e) if e.is_not_ready() => {
          if !waiting {
            info!("等待生产者创建共享内存: {}", path.display());
            waiting = true;
          }
          thread::sleep(retry);
        }
        Err(e) => return Err(e),
      }
    }
    Ok(None)
  }

  fn map_file(
    file: &std::fs::File,
    path: PathBuf,
    capacity: usize,
    created: bool,
  ) -> Result<Self, ChannelError> {
    let actual = file.metadata()?.len() as usize;
    if actual != capacity {
      return Err(ChannelError::CapacityMismatch {
        expected: capacity,
        actual,
      });
    }

    // SAFETY: 映射期间文件只由通道协议访问，长度已校验
    let map = unsafe { MmapMut::map_mut(file) }.map_err(|source| ChannelError::Create {
      path: path.clone(),
      source,
    })?;

    if created {
      info!("创建共享内存: {} ({} 字节)", path.display(), capacity);
    } else {
      info!("连接已有共享内存: {} ({} 字节)", path.display(), capacity);
    }

    Ok(Self {
      map,
      path,
      capacity,
      created,
      remove_on_close: created,
      poll_interval: DEFAULT_POLL_INTERVAL,
    })
  }

  pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
    self.poll_interval = poll_interval;
    self
  }

  /// 关闭时是否删除映射文件，默认仅由创建者删除
  pub fn with_remove_on_close(mut self, remove_on_close: bool) -> Self {
    self.remove_on_close = remove_on_close;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// 像素区字节数，即 `capacity - 1`
  pub fn frame_len(&self) -> usize {
    self.capacity - DATA_OFFSET
  }

  pub fn created(&self) -> bool {
    self.created
  }

  pub fn flag(&self) -> ChannelFlag {
    match self.flag_cell().load(Ordering::Acquire) {
      FLAG_EMPTY => ChannelFlag::Empty,
      _ => ChannelFlag::Full,
    }
  }

  /// 强制将标志清零，丢弃未读帧
  pub fn reset(&self) {
    let previous = self.flag_cell().swap(FLAG_EMPTY, Ordering::AcqRel);
    if previous != FLAG_EMPTY {
      warn!("共享内存标志被重置，未读帧已丢弃: {}", self.path.display());
    }
  }

  /// 发布一帧：等待标志为 0，写入像素区，再将标志置 1
  pub fn publish(&mut self, buffer: &[u8]) -> Result<(), ChannelError> {
    self.publish_with_deadline(buffer, None)
  }

  /// 同 [`publish`](Self::publish)，超过 `timeout` 仍未轮到则返回 `Timeout`，像素区保持不变
  pub fn publish_timeout(&mut self, buffer: &[u8], timeout: Duration) -> Result<(), ChannelError> {
    self.publish_with_deadline(buffer, Some(timeout))
  }

  /// 非阻塞发布，标志为 1 时返回 `Ok(false)`
  pub fn try_publish(&mut self, buffer: &[u8]) -> Result<bool, ChannelError> {
    self.check_frame_len(buffer.len())?;
    if self.flag_cell().load(Ordering::Acquire) != FLAG_EMPTY {
      return Ok(false);
    }
    self.write_frame(buffer);
    Ok(true)
  }

  /// 接收一帧：等待标志为 1，读出像素区，再将标志置 0
  pub fn receive(&mut self, dst: &mut [u8]) -> Result<(), ChannelError> {
    self.receive_with_deadline(dst, None)
  }

  pub fn receive_timeout(&mut self, dst: &mut [u8], timeout: Duration) -> Result<(), ChannelError> {
    self.receive_with_deadline(dst, Some(timeout))
  }

  /// 非阻塞接收，没有待读帧时返回 `Ok(false)`
  pub fn try_receive(&mut self, dst: &mut [u8]) -> Result<bool, ChannelError> {
    self.check_frame_len(dst.len())?;
    if self.flag_cell().load(Ordering::Acquire) != FLAG_FULL {
      return Ok(false);
    }
    self.read_frame(dst);
    Ok(true)
  }

  /// 刷新并释放映射；若为创建者且设置了删除，则移除映射文件
  pub fn close(self) -> Result<(), ChannelError> {
    self.map.flush()?;
    let path = self.path.clone();
    let remove = self.remove_on_close;
    drop(self);
    if remove {
      match std::fs::remove_file(&path) {
        Ok(()) => info!("已删除共享内存: {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
      }
    }
    Ok(())
  }

  fn publish_with_deadline(
    &mut self,
    buffer: &[u8],
    timeout: Option<Duration>,
  ) -> Result<(), ChannelError> {
    self.check_frame_len(buffer.len())?;
    let waited = self.wait_for(FLAG_EMPTY, timeout)?;
    if let Some(waited) = waited {
      debug!("等待消费者读取耗时: {:.2?}", waited);
    }
    self.write_frame(buffer);
    Ok(())
  }

  fn receive_with_deadline(
    &mut self,
    dst: &mut [u8],
    timeout: Option<Duration>,
  ) -> Result<(), ChannelError> {
    self.check_frame_len(dst.len())?;
    self.wait_for(FLAG_FULL, timeout)?;
    self.read_frame(dst);
    Ok(())
  }

  /// 轮询直到标志等于 `expected`，返回实际等待时长（未等待时为 `None`）
  fn wait_for(
    &self,
    expected: u8,
    timeout: Option<Duration>,
  ) -> Result<Option<Duration>, ChannelError> {
    let flag = self.flag_cell();
    if flag.load(Ordering::Acquire) == expected {
      return Ok(None);
    }

    let start = Instant::now();
    loop {
      thread::sleep(self.poll_interval);
      if flag.load(Ordering::Acquire) == expected {
        return Ok(Some(start.elapsed()));
      }
      if let Some(timeout) = timeout
        && start.elapsed() >= timeout
      {
        return Err(ChannelError::Timeout(timeout));
      }
    }
  }

  fn check_frame_len(&self, len: usize) -> Result<(), ChannelError> {
    if len != self.frame_len() {
      return Err(ChannelError::SizeMismatch {
        expected: self.frame_len(),
        actual: len,
      });
    }
    Ok(())
  }

  /// 调用前标志必须为 0
  fn write_frame(&mut self, buffer: &[u8]) {
    // SAFETY: 长度已校验为 capacity - 1，目标区从偏移 1 开始，不与标志字节重叠
    unsafe {
      std::ptr::copy_nonoverlapping(
        buffer.as_ptr(),
        self.map.as_mut_ptr().add(DATA_OFFSET),
        buffer.len(),
      );
    }
    self.flag_cell().store(FLAG_FULL, Ordering::Release);
  }

  /// 调用前标志必须为 1
  fn read_frame(&mut self, dst: &mut [u8]) {
    // SAFETY: 同 write_frame
    unsafe {
      std::ptr::copy_nonoverlapping(
        self.map.as_ptr().add(DATA_OFFSET),
        dst.as_mut_ptr(),
        dst.len(),
      );
    }
    self.flag_cell().store(FLAG_EMPTY, Ordering::Release);
  }

  fn flag_cell(&self) -> &AtomicU8 {
    // SAFETY: 映射可写且至少 2 字节，生命周期与 self 绑定；
    // 标志字节只通过原子操作访问
    unsafe { AtomicU8::from_ptr(self.map.as_ptr().add(FLAG_OFFSET).cast_mut()) }
  }
}

fn check_capacity(capacity: usize) -> Result<(), ChannelError> {
  if capacity <= DATA_OFFSET {
    return Err(ChannelError::InvalidCapacity(capacity));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  };

  const FRAME: usize = 4 * 4 * 3;

  fn pattern(seed: u8) -> Vec<u8> {
    (0..FRAME).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
  }

  #[test]
  fn open_creates_empty_region() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chan");
    let channel = FrameChannel::open(&path, FRAME + 1).unwrap();
    assert!(channel.created());
    assert_eq!(channel.flag(), ChannelFlag::Empty);
    assert_eq!(channel.frame_len(), FRAME);
    assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, FRAME + 1);
  }

  #[test]
  fn publish_sets_flag_and_writes_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chan");
    let mut producer = FrameChannel::open(&path, FRAME + 1).unwrap();
    let frame = pattern(3);
    producer.publish(&frame).unwrap();

    assert_eq!(producer.flag(), ChannelFlag::Full);
    let raw = std::fs::read(&path).unwrap();
    assert_eq!(raw[0], 1);
    assert_eq!(&raw[1..], frame.as_slice());
  }

  #[test]
  fn round_trip_through_mock_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chan");
    let mut producer = FrameChannel::open(&path, FRAME + 1).unwrap();
    let mut consumer = FrameChannel::attach(&path, FRAME + 1).unwrap();

    for seed in 0..3u8 {
      let frame = pattern(seed);
      producer.publish(&frame).unwrap();
      let mut received = vec![0u8; FRAME];
      consumer.receive(&mut received).unwrap();
      assert_eq!(received, frame);
      assert_eq!(consumer.flag(), ChannelFlag::Empty);
    }
  }

  #[test]
  fn publish_blocks_while_flag_is_full() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chan");
    let mut producer = FrameChannel::open(&path, FRAME + 1).unwrap();
    let mut consumer = FrameChannel::attach(&path, FRAME + 1).unwrap();

    let first = pattern(1);
    producer.publish(&first).unwrap();

    let second = pattern(2);
    let done = Arc::new(AtomicBool::new(false));
    let worker = {
      let done = done.clone();
      let second = second.clone();
      thread::spawn(move || {
        producer.publish(&second).unwrap();
        done.store(true, Ordering::SeqCst);
        producer
      })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst));
    // 阻塞期间像素区不能被改写
    let raw = std::fs::read(&path).unwrap();
    assert_eq!(raw[0], 1);
    assert_eq!(&raw[1..], first.as_slice());

    let mut received = vec![0u8; FRAME];
    consumer.receive(&mut received).unwrap();
    assert_eq!(received, first);

    let producer = worker.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(producer.flag(), ChannelFlag::Full);
    consumer.receive(&mut received).unwrap();
    assert_eq!(received, second);
  }

  #[test]
  fn publish_timeout_leaves_region_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chan");
    let mut producer = FrameChannel::open(&path, FRAME + 1).unwrap();
    let first = pattern(5);
    producer.publish(&first).unwrap();

    let err = producer
      .publish_timeout(&pattern(6), Duration::from_millis(20))
      .unwrap_err();
    assert!(matches!(err, ChannelError::Timeout(_)));
    assert!(!producer.try_publish(&pattern(6)).unwrap());
    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[1..], first.as_slice());
  }

  #[test]
  fn rejects_wrong_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chan");
    let mut producer = FrameChannel::open(&path, FRAME + 1).unwrap();
    assert!(matches!(
      producer.publish(&[0u8; 5]),
      Err(ChannelError::SizeMismatch {
        expected: FRAME,
        actual: 5
      })
    ));
    assert_eq!(producer.flag(), ChannelFlag::Empty);

    assert!(matches!(
      FrameChannel::open(&path, FRAME + 2),
      Err(ChannelError::CapacityMismatch { .. })
    ));
    assert!(matches!(
      FrameChannel::open(dir.path().join("tiny"), 1),
      Err(ChannelError::InvalidCapacity(1))
    ));
  }

  #[test]
  fn attach_requires_existing_region() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing");
    let err = FrameChannel::attach(&path, FRAME + 1).unwrap_err();
    assert!(matches!(err, ChannelError::Create { .. }));
    assert!(err.is_not_ready());
    // 消费者从不创建文件
    assert!(!path.exists());
  }

  #[test]
  fn zero_length_region_is_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shm");
    std::fs::File::create(&path).unwrap();

    let err = FrameChannel::attach(&path, FRAME + 1).unwrap_err();
    assert!(matches!(err, ChannelError::NotReady(_)));
    assert!(err.is_not_ready());

    std::fs::write(&path, [0u8; 5]).unwrap();
    let err = FrameChannel::attach(&path, FRAME + 1).unwrap_err();
    assert!(matches!(err, ChannelError::CapacityMismatch { actual: 5, .. }));
    assert!(!err.is_not_ready());
  }

  #[test]
  fn attach_retries_until_region_is_sized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shm");
    let file = std::fs::File::create(&path).unwrap();

    let sizer = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(50));
      file.set_len((FRAME + 1) as u64).unwrap();
    });

    let channel =
      FrameChannel::attach_with_retry(&path, FRAME + 1, Duration::from_millis(5), || false)
        .unwrap()
        .expect("共享内存应当就绪");
    sizer.join().unwrap();
    assert_eq!(channel.flag(), ChannelFlag::Empty);
    assert!(!channel.created());
  }

  #[test]
  fn attach_retry_gives_up_when_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let stopped = AtomicBool::new(false);
    let result = FrameChannel::attach_with_retry(
      dir.path().join("missing"),
      FRAME + 1,
      Duration::from_millis(1),
      || stopped.swap(true, Ordering::SeqCst),
    )
    .unwrap();
    assert!(result.is_none());
  }

  #[test]
  fn try_receive_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chan");
    let mut producer = FrameChannel::open(&path, FRAME + 1).unwrap();
    let mut consumer = FrameChannel::attach(&path, FRAME + 1).unwrap();
    let mut received = vec![0u8; FRAME];

    assert!(!consumer.try_receive(&mut received).unwrap());
    producer.publish(&pattern(9)).unwrap();
    producer.reset();
    assert_eq!(consumer.flag(), ChannelFlag::Empty);
    assert!(!consumer.try_receive(&mut received).unwrap());
  }

  #[test]
  fn close_removes_file_only_for_creator() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chan");
    let producer = FrameChannel::open(&path, FRAME + 1).unwrap();
    let consumer = FrameChannel::attach(&path, FRAME + 1).unwrap();

    consumer.close().unwrap();
    assert!(path.exists());
    producer.close().unwrap();
    assert!(!path.exists());
  }

  #[test]
  fn resolves_names_and_paths_from_urls() {
    let named = url::Url::parse("shm://YoloIPC_SharedMemory?reset").unwrap();
    assert_eq!(
      path_from_url(&named),
      Some(shm_path("YoloIPC_SharedMemory"))
    );
    let absolute = url::Url::parse("shm:///tmp/frames").unwrap();
    assert_eq!(path_from_url(&absolute), Some(PathBuf::from("/tmp/frames")));
    let empty = url::Url::parse("shm:///").unwrap();
    assert_eq!(path_from_url(&empty), None);
  }
}
