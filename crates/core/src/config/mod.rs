//! 配置管理
//!
//! 配置按以下顺序合并，后者覆盖前者：
//!
//! 1. 内置默认值
//! 2. TOML 配置文件
//! 3. 环境变量（前缀 `TESTFLEET_`，层级分隔符 `__`，例如 `TESTFLEET_SERVER__BIND_ADDRESS`）

pub mod models;

pub use models::*;
