//! # hevcbs-parser
//!
//! HEVC (H.265) 码流语法解析引擎.
//!
//! 从 Annex B 字节流中解析 VPS/SPS/PPS, SEI 与条带段头, 完成 POC 推导与参考列表
//! 构造, 并用 CABAC 把条带数据解码为 CTU / CU / PU / TU 语法树. 不做像素重建.
//!
//! 条带数据可在调用线程上顺序解码, 也可按访问单元, 条带或分块并行解码,
//! 各模式的输出一致.
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use hevcbs_parser::{Parser, ParserConfig};
//!
//! let mut parser = Parser::open("input.265", ParserConfig::default()).unwrap();
//! while let Some(mut au) = parser.parse_next_au().unwrap() {
//!     parser.sync(&mut au);
//!     println!("AU {} POC {:?}: {} 个 CTU", au.index, au.poc, au.stats.ctu_count);
//! }
//! ```

pub mod h265;

#[cfg(any(test, feature = "synth"))]
pub mod synth;

// 重导出常用类型
pub use h265::{
    AccessUnit, AuStats, NalPayload, NalUnit, NalUnitType, ParseMode, Parser, ParserConfig,
    Slice, TraceLevel,
};
pub use hevcbs_core::{BsError, BsResult, Status};
