//! 控制面: 解析模式, 跟踪级别与解析器配置.

use bitflags::bitflags;
use hevcbs_core::{BsError, BsResult};
use serde::{Deserialize, Serialize};

bitflags! {
    /// 跟踪掩码. 每个解析阶段只在对应位置位时输出 `trace!` 记录.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TraceLevel: u32 {
        const NALU = 1 << 0;
        const SPS = 1 << 1;
        const PPS = 1 << 2;
        const SEI = 1 << 3;
        const SLICE_HEADER = 1 << 4;
        const REF_LIST = 1 << 5;
        const CTU = 1 << 6;
        const SAO = 1 << 7;
        const CU = 1 << 8;
        const PU = 1 << 9;
        const TU = 1 << 10;
        const RESIDUAL = 1 << 11;
        const PALETTE = 1 << 12;
        const COEF = 1 << 13;

        /// 头部级别的默认掩码
        const DEFAULT = Self::NALU.bits()
            | Self::SPS.bits()
            | Self::PPS.bits()
            | Self::SEI.bits()
            | Self::SLICE_HEADER.bits();
    }
}

impl Default for TraceLevel {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// 解析模式, 可按位组合
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ParseMode: u32 {
        /// 全部在调用线程上顺序解码
        const SEQUENTIAL = 0;
        /// 多个访问单元并行, 按码流顺序完成
        const AU_PARALLEL = 1 << 0;
        /// 条带并行
        const SLICE_PARALLEL = 1 << 1;
        /// 分块 / 波前子码流并行
        const TILE_PARALLEL = 1 << 2;
    }
}

impl Default for ParseMode {
    fn default() -> Self {
        Self::SEQUENTIAL
    }
}

impl ParseMode {
    /// 是否需要工作线程池
    pub fn uses_scheduler(self) -> bool {
        !self.is_empty()
    }
}

/// 解析器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub mode: ParseMode,
    /// 工作线程数, 0 表示硬件并发数
    pub threads: usize,
    /// AU 并行时同时在途的访问单元上限
    pub async_depth: usize,
    /// 调度器任务表容量
    pub queue_capacity: usize,
    pub trace: TraceLevel,
    /// 竞技场字节上限, 0 表示不限
    pub arena_limit: usize,
    /// 文件输入每次回填的字节数
    pub window_size: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            mode: ParseMode::SEQUENTIAL,
            threads: 0,
            async_depth: 5,
            queue_capacity: 1024,
            trace: TraceLevel::empty(),
            arena_limit: 0,
            window_size: 1 << 20,
        }
    }
}

impl ParserConfig {
    /// 检查配置取值
    pub fn validate(&self) -> BsResult<()> {
        if self.async_depth == 0 {
            return Err(BsError::InvalidArgument("async_depth 不能为 0".into()));
        }
        if self.mode.uses_scheduler() && self.queue_capacity < 2 {
            return Err(BsError::InvalidArgument(format!(
                "queue_capacity={} 过小",
                self.queue_capacity
            )));
        }
        if self.window_size < 4096 {
            return Err(BsError::InvalidArgument(format!(
                "window_size={} 小于 4096",
                self.window_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_default_covers_headers_only() {
        let t = TraceLevel::DEFAULT;
        assert!(t.contains(TraceLevel::SPS | TraceLevel::SLICE_HEADER));
        assert!(!t.intersects(TraceLevel::CTU | TraceLevel::COEF));
        assert!(TraceLevel::default().is_empty());
    }

    #[test]
    fn test_mode_combination() {
        let m = ParseMode::AU_PARALLEL | ParseMode::TILE_PARALLEL;
        assert!(m.uses_scheduler());
        assert!(m.contains(ParseMode::TILE_PARALLEL));
        assert!(!m.contains(ParseMode::SLICE_PARALLEL));
        assert!(!ParseMode::SEQUENTIAL.uses_scheduler());
    }

    #[test]
    fn test_config_validate() {
        let mut cfg = ParserConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.async_depth = 0;
        assert!(matches!(cfg.validate(), Err(BsError::InvalidArgument(_))));
    }
}
