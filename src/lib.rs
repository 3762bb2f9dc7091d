//! # hevcbs
//!
//! 纯 Rust 实现的 HEVC (H.265) 码流语法解析引擎.
//!
//! 从 Annex B 字节流中取出访问单元, 解析参数集, SEI 与条带段头, 构造参考列表,
//! 并把条带数据熵解码为 CTU / CU / PU / TU 语法树. 不做像素重建.
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use hevcbs::parser::{ParseMode, Parser, ParserConfig};
//! use hevcbs::report::AuReport;
//!
//! let config = ParserConfig {
//!     mode: ParseMode::SLICE_PARALLEL,
//!     ..Default::default()
//! };
//! let mut parser = Parser::open("input.265", config).unwrap();
//! while let Some(mut au) = parser.parse_next_au().unwrap() {
//!     parser.sync(&mut au);
//!     println!("{}", AuReport::from_access_unit(&au));
//! }
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `hevcbs-core` | 错误与状态码, 位读取, 竞技场, 任务调度 |
//! | `hevcbs-parser` | NAL, CABAC, 参数集, 参考管理, 四叉树解码与并行编排 |

/// 基础设施: 错误, 位读取, 内存竞技场, 任务调度
pub use hevcbs_core as core;

/// HEVC 语法解析引擎
pub use hevcbs_parser as parser;

pub mod logging;
pub mod report;

/// 获取 hevcbs 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
