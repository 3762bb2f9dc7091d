//! 访问单元输出结构.
//!
//! 一个访问单元按码流顺序保存全部 NAL 单元及其解析结果. 条带数据在并行模式下
//! 由工作线程异步填充, 调用 [`Parser::sync`](super::orchestrator::Parser::sync)
//! 之后才可读取.

use std::sync::{Arc, Mutex};

use hevcbs_core::{BlockId, MemoryArena, SyncPoint, TaskScheduler};
use log::{debug, warn};

use super::nal::NalHeader;
use super::params::{Pps, Sps, Vps};
use super::quadtree::SliceData;
use super::refs::RefLists;
use super::sei::SeiMessage;
use super::slice_header::SliceHeader;

/// NAL 负载
#[derive(Debug, Clone)]
pub enum NalPayload {
    Vps(Arc<Vps>),
    Sps(Arc<Sps>),
    Pps(Arc<Pps>),
    Sei(Vec<SeiMessage>),
    /// 条带段, 值为 [`AccessUnit::slices`] 中的下标
    Slice(usize),
    /// AUD, EOS, 填充数据, 保留类型等不解析的单元
    Skipped,
    /// 解析失败, 保存错误描述
    Corrupt(String),
}

/// 访问单元中的一个 NAL 单元
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub header: NalHeader,
    /// 起始码在码流中的偏移
    pub stream_offset: u64,
    /// 含 NAL 头的字节数
    pub size: usize,
    pub payload: NalPayload,
}

/// 一个条带段及其解码结果
#[derive(Debug, Clone, Default)]
pub struct Slice {
    /// 所在 NAL 在 [`AccessUnit::nals`] 中的下标
    pub nal_index: usize,
    pub header: SliceHeader,
    pub lists: RefLists,
    pub data: SliceData,
    /// 条带数据解码失败
    pub corrupted: bool,
    /// 只解码了一部分 (同一条带的前序段失败, 或同位图像缺失)
    pub partial: bool,
}

/// 访问单元统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuStats {
    pub nal_count: usize,
    pub slice_count: usize,
    pub ctu_count: usize,
    pub bins: u64,
    /// 条带数据字节数
    pub slice_bytes: usize,
}

/// 条带级解码结果, 由完成任务写入
#[derive(Debug, Default)]
pub(crate) struct SliceOutcome {
    pub data: SliceData,
    pub corrupted: bool,
    pub partial: bool,
}

/// 异步解码结果槽
pub(crate) type OutcomeSlot = Arc<Mutex<Option<Vec<SliceOutcome>>>>;

/// 尚未同步的异步工作
pub(crate) struct PendingWork {
    pub scheduler: Arc<TaskScheduler>,
    pub completion: SyncPoint,
    pub slot: OutcomeSlot,
}

/// 访问单元
pub struct AccessUnit {
    /// 码流中的序号, 从 0 开始
    pub index: u64,
    /// PicOrderCntVal, 不含 VCL 时为 None
    pub poc: Option<i32>,
    pub nals: Vec<NalUnit>,
    pub slices: Vec<Slice>,
    /// 存在语法错误或缺失参数集的单元
    pub incomplete: bool,
    pub stats: AuStats,
    pub(crate) pending: Option<PendingWork>,
    pub(crate) arena: Arc<MemoryArena>,
    pub(crate) block: Option<BlockId>,
}

impl std::fmt::Debug for AccessUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessUnit")
            .field("index", &self.index)
            .field("poc", &self.poc)
            .field("nals", &self.nals.len())
            .field("slices", &self.slices.len())
            .field("incomplete", &self.incomplete)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl AccessUnit {
    pub(crate) fn new(index: u64, arena: Arc<MemoryArena>) -> Self {
        Self {
            index,
            poc: None,
            nals: Vec::new(),
            slices: Vec::new(),
            incomplete: false,
            stats: AuStats::default(),
            pending: None,
            arena,
            block: None,
        }
    }

    /// 条带数据是否已可读取
    pub fn is_ready(&self) -> bool {
        self.pending.is_none()
    }

    /// 是否含 VCL 单元
    pub fn has_vcl(&self) -> bool {
        !self.slices.is_empty()
    }

    /// 访问单元在竞技场中的块
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    /// 第一个条带段的头
    pub fn first_slice(&self) -> Option<&Slice> {
        self.slices.first()
    }

    /// 把完成任务产生的结果合入条带
    pub(crate) fn apply_outcomes(&mut self, outcomes: Vec<SliceOutcome>) {
        if outcomes.len() != self.slices.len() {
            warn!(
                "AU {}: 结果数 {} 与条带数 {} 不符",
                self.index,
                outcomes.len(),
                self.slices.len()
            );
            self.incomplete = true;
        }
        for (slice, out) in self.slices.iter_mut().zip(outcomes) {
            slice.data = out.data;
            slice.corrupted |= out.corrupted;
            slice.partial |= out.partial;
        }
        self.refresh_stats();
    }

    /// 结果丢失时把全部条带标记为损坏
    pub(crate) fn mark_lost(&mut self) {
        for slice in &mut self.slices {
            slice.corrupted = true;
        }
        self.incomplete = true;
        self.refresh_stats();
    }

    pub(crate) fn refresh_stats(&mut self) {
        self.stats = AuStats {
            nal_count: self.nals.len(),
            slice_count: self.slices.len(),
            ctu_count: self.slices.iter().map(|s| s.data.ctus.len()).sum(),
            bins: self.slices.iter().map(|s| s.data.bins).sum(),
            slice_bytes: self.slices.iter().map(|s| s.data.bytes).sum(),
        };
        if self.slices.iter().any(|s| s.corrupted) {
            self.incomplete = true;
        }
    }
}

impl Drop for AccessUnit {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            if let Err(err) = pending.scheduler.detach(pending.completion) {
                // 记录已被回收, 任务必已结束
                debug!("AU {}: 分离完成任务: {}", self.index, err);
            }
        }
        if let Some(block) = self.block.take() {
            if let Err(err) = self.arena.free(block) {
                warn!("AU {}: 释放块 {} 失败: {}", self.index, block, err);
            }
        }
    }
}
