//! Go 测试影响分析
//!
//! 使用 tree-sitter 解析单个包目录，把修改的字节范围映射到所在的顶层声明，
//! 再沿引用关系向外查找，直到遇到测试函数。

pub mod analyzer;
pub mod decl;
pub mod source;

pub use analyzer::{Impact, ImpactAnalyzer};
pub use decl::{DeclKind, Declaration, TestRole};
pub use source::{Occurrence, Package, SiteKind, SourceFile};
