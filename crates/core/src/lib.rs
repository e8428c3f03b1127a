//! testfleet 核心库
//!
//! 提供整个工作区共享的错误类型、配置模型、数据模型以及组件之间的接口定义。

pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::*;
pub use errors::*;
pub use models::*;
pub use traits::*;
