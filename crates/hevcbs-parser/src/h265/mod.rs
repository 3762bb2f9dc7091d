//! H.265/HEVC 语法解析.
//!
//! 自底向上: [`cabac`] 算术解码, [`params`] 参数集, [`slice_header`] 条带段头,
//! [`refs`] 参考管理, [`quadtree`] 条带数据, 最后由 [`orchestrator`] 组装访问单元.

pub mod au;
pub mod cabac;
pub mod control;
pub mod layout;
pub mod motion;
pub mod nal;
pub mod orchestrator;
pub mod params;
pub mod quadtree;
pub mod refs;
pub mod sei;
pub mod slice_header;

#[cfg(test)]
mod tests;

pub use au::{AccessUnit, AuStats, NalPayload, NalUnit, Slice};
pub use control::{ParseMode, ParserConfig, TraceLevel};
pub use nal::{NalHeader, NalUnitType};
pub use orchestrator::Parser;
