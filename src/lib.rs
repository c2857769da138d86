// 该文件是 Shanan （山南西风） 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod channel;
pub mod frame;
pub mod input;
pub mod labels;
pub mod model;
pub mod output;
pub mod task;

/// 共享内存帧宽度
pub const FRAME_WIDTH: u32 = 640;
/// 共享内存帧高度
pub const FRAME_HEIGHT: u32 = 640;
/// 默认共享内存名称
pub const DEFAULT_CHANNEL_NAME: &str = "YoloIPC_SharedMemory";

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 查询参数中的布尔开关：`?flag`、`?flag=true`、`?flag=1` 为真，`?flag=false`、`?flag=0` 为假
pub(crate) fn query_flag(url: &url::Url, key: &str) -> Option<bool> {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .map(|(_, v)| !matches!(v.as_ref(), "false" | "0" | "no" | "off"))
}

pub(crate) fn query_value<T: std::str::FromStr>(url: &url::Url, key: &str) -> Option<T> {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .and_then(|(_, v)| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  #[test]
  fn query_helpers_parse_flags_and_values() {
    let url = Url::parse("shm://name?annotate=false&reset&timeout_ms=250&bad=x").unwrap();
    assert_eq!(query_flag(&url, "annotate"), Some(false));
    assert_eq!(query_flag(&url, "reset"), Some(true));
    assert_eq!(query_flag(&url, "missing"), None);
    assert_eq!(query_value::<u64>(&url, "timeout_ms"), Some(250));
    assert_eq!(query_value::<u64>(&url, "bad"), None);
  }
}
