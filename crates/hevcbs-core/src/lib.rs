//! # hevcbs-core
//!
//! HEVC 码流解析引擎的底层基础设施, 与具体语法无关:
//! - **cursor**: 位游标 (防竞争字节透明剔除, Exp-Golomb) 与 Annex B 字节流窗口
//! - **bitwriter**: 位写入器, 用于构造合成码流
//! - **arena**: 带依赖跟踪与锁计数的内存竞技场
//! - **scheduler**: 基于依赖图的工作线程池

pub mod arena;
pub mod bitwriter;
pub mod cursor;
pub mod error;
pub mod scheduler;

// 重导出常用类型
pub use arena::{BlockId, Handle, MemoryArena, PinGuard};
pub use cursor::{BitCursor, BufferUpdater, ByteStream};
pub use error::{BsError, BsResult, Status};
pub use scheduler::{SyncPoint, TaskScheduler, TaskState};
