//! 解析调度器.
//!
//! 从 Annex B 字节流中切出 NAL 单元并组装访问单元. 参数集, SEI 与条带段头
//! 在调用线程上按码流顺序解析; 条带数据按 [`ParseMode`] 切分为工作单元,
//! 在调用线程上直接解码或提交到 [`TaskScheduler`].
//!
//! 工作单元的划分:
//! - 顺序 / AU 并行: 一幅图像一个单元
//! - 条带并行: 每个独立条带段开启新单元, 依赖条带段跟随其独立条带段
//! - 分块并行: 按入口点把条带段切到分块边界, 每个分块开启新单元
//!
//! 波前行始终在所属单元内顺序解码. 每幅图像的完成任务依赖它的全部单元以及
//! 上一幅图像的完成任务, 因此结果总按码流顺序落定.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use hevcbs_core::cursor::RawNal;
use hevcbs_core::{
    BitCursor, BsError, BsResult, BufferUpdater, ByteStream, Handle, MemoryArena, PinGuard,
    Status, SyncPoint, TaskScheduler, TaskState,
};
use log::{debug, trace, warn};

use super::au::{AccessUnit, NalPayload, NalUnit, OutcomeSlot, PendingWork, Slice, SliceOutcome};
use super::control::{ParseMode, ParserConfig, TraceLevel};
use super::layout::{LayoutCache, PictureLayout};
use super::motion::ColMotion;
use super::nal::{NalHeader, NalUnitType, starts_new_access_unit};
use super::params::{ParamRef, ParamSetCache, Pps, Sps, Vps};
use super::quadtree::{PictureContext, SegmentInput, SliceData, UnitDecoder};
use super::refs::{PictureRps, PictureStart, RefLists, RefManager};
use super::sei::parse_sei_rbsp;
use super::slice_header::{HeaderContext, SliceHeader};

/// 同位运动场, 由所属图像的完成任务写入一次
type ColSlot = OnceLock<ColMotion>;

#[derive(Clone)]
struct ColEntry {
    handle: Handle<ColSlot>,
    slot: Arc<ColSlot>,
}

/// 访问单元在竞技场中的标记块
#[derive(Debug)]
struct AuBlock;

// ============================================================
// 工作单元
// ============================================================

/// 条带段的解码输入
struct SegmentJob {
    nal: Bytes,
    header: SliceHeader,
    lists: RefLists,
    slice_addr_rs: u32,
    first_ts: u32,
    end_ts: u32,
    col_missing: bool,
}

/// 工作单元中的一段连续 CTB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Piece {
    seg: usize,
    first_ts: u32,
    start_offset: usize,
    end_ts: u32,
}

/// 图像级解码输入, 在工作线程间共享
struct PictureJob {
    sps: Arc<Sps>,
    pps: Arc<Pps>,
    layout: Arc<PictureLayout>,
    poc: i32,
    trace: TraceLevel,
    col: Option<Arc<ColSlot>>,
    motion_out: Option<Arc<ColSlot>>,
    segments: Vec<SegmentJob>,
}

/// 一个片段的解码结果
struct Fragment {
    seg: usize,
    first_ts: u32,
    data: SliceData,
    error: Option<BsError>,
}

type FragmentSlot = Arc<Mutex<Option<Vec<Fragment>>>>;

fn take_slot<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn fill_slot<T>(slot: &Mutex<Option<T>>, value: T) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
}

/// 按入口点把条带段切成片段. `split_tiles` 为假时整段作为一个片段.
fn segment_pieces(
    layout: &PictureLayout,
    wpp: bool,
    seg: usize,
    job: &SegmentJob,
    split_tiles: bool,
) -> Vec<Piece> {
    let whole = vec![Piece {
        seg,
        first_ts: job.first_ts,
        start_offset: job.header.data_offset,
        end_ts: job.end_ts,
    }];
    if !split_tiles {
        return whole;
    }
    let starts: Vec<u32> = (job.first_ts + 1..job.end_ts)
        .filter(|&ts| layout.is_substream_start(ts, wpp))
        .collect();
    if starts.len() != job.header.num_entry_points() {
        warn!(
            "条带段 {}: 入口点数 {} 与子码流数 {} 不符, 不切分",
            job.header.slice_segment_address,
            job.header.num_entry_points(),
            starts.len()
        );
        return whole;
    }

    let mut offset = job.header.data_offset;
    let mut cuts = vec![(job.first_ts, offset)];
    for (&ts, &minus1) in starts.iter().zip(&job.header.entry_point_offset_minus1) {
        offset += minus1 as usize + 1;
        if offset >= job.nal.len() {
            warn!("条带段 {}: 入口点越过 NAL 末尾", job.header.slice_segment_address);
            return whole;
        }
        if layout.is_tile_start(ts) {
            cuts.push((ts, offset));
        }
    }
    cuts.iter()
        .enumerate()
        .map(|(i, &(first_ts, start_offset))| Piece {
            seg,
            first_ts,
            start_offset,
            end_ts: cuts.get(i + 1).map_or(job.end_ts, |c| c.0),
        })
        .collect()
}

/// 按模式把片段分组为工作单元
fn plan_units(job: &PictureJob, mode: ParseMode) -> Vec<Vec<Piece>> {
    let split_tiles = mode.contains(ParseMode::TILE_PARALLEL);
    let wpp = job.pps.entropy_coding_sync_enabled_flag;
    let mut units: Vec<Vec<Piece>> = Vec::new();
    for (i, seg) in job.segments.iter().enumerate() {
        for piece in segment_pieces(&job.layout, wpp, i, seg, split_tiles) {
            let starts_slice = mode.contains(ParseMode::SLICE_PARALLEL)
                && piece.first_ts == seg.first_ts
                && seg.header.is_independent();
            let starts_tile = split_tiles && job.layout.is_tile_start(piece.first_ts);
            match units.last_mut() {
                Some(unit) if !starts_slice && !starts_tile => unit.push(piece),
                _ => units.push(vec![piece]),
            }
        }
    }
    units
}

/// 解码一个工作单元的全部片段
fn decode_unit(job: &PictureJob, pieces: &[Piece]) -> Vec<Fragment> {
    let ctx = PictureContext {
        sps: &job.sps,
        pps: &job.pps,
        layout: Arc::clone(&job.layout),
        poc: job.poc,
        col: job.col.as_deref().and_then(OnceLock::get),
        trace: job.trace,
    };
    let mut dec = UnitDecoder::new(ctx);
    pieces
        .iter()
        .map(|p| {
            let seg = &job.segments[p.seg];
            let input = SegmentInput {
                nal: &seg.nal,
                header: &seg.header,
                lists: &seg.lists,
                slice_addr_rs: seg.slice_addr_rs,
                start_offset: p.start_offset,
                first_ts: p.first_ts,
            };
            let out = dec.decode_segment(&input, p.end_ts);
            let mut error = out.error;
            if error.is_none() && !out.ended && p.end_ts == seg.end_ts {
                error = Some(BsError::syntax(format!(
                    "条带段 {} 越过下一条带段起点 {}",
                    seg.header.slice_segment_address, seg.end_ts
                )));
            }
            if error.is_none() && out.ended && out.next_ts < p.end_ts {
                error = Some(BsError::syntax(format!(
                    "条带段 {} 在 ts={} 提前结束, 预期 {}",
                    seg.header.slice_segment_address, out.next_ts, p.end_ts
                )));
            }
            Fragment {
                seg: p.seg,
                first_ts: p.first_ts,
                data: out.data,
                error,
            }
        })
        .collect()
}

/// 合并片段, 推导条带标志并写出本图像的运动场
fn complete_picture(job: &PictureJob, units: Vec<Vec<Fragment>>) -> Vec<SliceOutcome> {
    let mut fragments: Vec<Fragment> = units.into_iter().flatten().collect();
    fragments.sort_by_key(|f| (f.seg, f.first_ts));

    let mut outcomes: Vec<SliceOutcome> = job.segments.iter().map(|_| SliceOutcome::default()).collect();
    let mut seen = vec![false; job.segments.len()];
    for f in fragments {
        seen[f.seg] = true;
        let out = &mut outcomes[f.seg];
        if let Some(err) = f.error {
            warn!(
                "POC {} 条带段 {} (ts={}) 解码失败: {}",
                job.poc, job.segments[f.seg].header.slice_segment_address, f.first_ts, err
            );
            out.corrupted = true;
        }
        out.data.append(f.data);
    }

    let mut slice_broken = false;
    for ((seg, out), seen) in job.segments.iter().zip(&mut outcomes).zip(seen) {
        if !seen {
            out.corrupted = true;
        }
        if seg.header.is_independent() {
            slice_broken = false;
        } else if slice_broken {
            out.partial = true;
        }
        if seg.col_missing {
            out.partial = true;
        }
        slice_broken |= out.corrupted;
    }

    if let Some(slot) = &job.motion_out {
        let mut col = ColMotion::new(job.poc, job.layout.pic_width, job.layout.pic_height);
        for (seg, out) in job.segments.iter().zip(&outcomes) {
            out.data.store_motion(&mut col, &seg.lists);
        }
        if slot.set(col).is_err() {
            warn!("POC {} 的运动场重复写入", job.poc);
        }
    }
    outcomes
}

// ============================================================
// 图像状态
// ============================================================

/// 条带段元数据 (头部解析阶段)
struct SegmentMeta {
    slice: usize,
    nal: Bytes,
    slice_addr_rs: u32,
    first_ts: u32,
    col_missing: bool,
}

/// 正在组装的图像
struct PictureState {
    poc: i32,
    rps: PictureRps,
    sps: ParamRef<Sps>,
    pps: ParamRef<Pps>,
    layout: Arc<PictureLayout>,
    col: Option<(i32, ColEntry)>,
    motion_out: Option<ColEntry>,
    segments: Vec<SegmentMeta>,
}

// ============================================================
// 解析器
// ============================================================

/// HEVC 码流解析器
pub struct Parser {
    config: ParserConfig,
    stream: ByteStream,
    arena: Arc<MemoryArena>,
    scheduler: Option<Arc<TaskScheduler>>,
    params: ParamSetCache,
    refs: RefManager,
    layouts: LayoutCache,
    lookahead: Option<RawNal>,
    /// POC -> 同位运动场
    col_store: HashMap<i32, ColEntry>,
    last_completion: Option<SyncPoint>,
    in_flight: VecDeque<SyncPoint>,
    next_index: u64,
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser")
            .field("mode", &self.config.mode)
            .field("next_index", &self.next_index)
            .field("col_store", &self.col_store.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl Parser {
    /// 解析内存中的完整码流
    pub fn from_bytes(data: impl Into<Vec<u8>>, config: ParserConfig) -> BsResult<Self> {
        Self::with_stream(ByteStream::from_bytes(data), config)
    }

    /// 解析文件, 按 `config.window_size` 分块读取
    pub fn open(path: impl AsRef<Path>, config: ParserConfig) -> BsResult<Self> {
        let stream = ByteStream::open(path, config.window_size)?;
        Self::with_stream(stream, config)
    }

    /// 由回调按需提供数据
    pub fn with_updater(updater: Box<dyn BufferUpdater>, config: ParserConfig) -> BsResult<Self> {
        Self::with_stream(ByteStream::with_updater(updater), config)
    }

    fn with_stream(stream: ByteStream, config: ParserConfig) -> BsResult<Self> {
        config.validate()?;
        let arena = Arc::new(MemoryArena::new(config.arena_limit));
        let scheduler = if config.mode.uses_scheduler() {
            let sched = TaskScheduler::new(config.threads, config.queue_capacity)?;
            debug!("解析模式 {:?}, {} 个工作线程", config.mode, sched.threads());
            Some(Arc::new(sched))
        } else {
            None
        };
        Ok(Self {
            params: ParamSetCache::new(Arc::clone(&arena)),
            config,
            stream,
            arena,
            scheduler,
            refs: RefManager::new(),
            layouts: LayoutCache::default(),
            lookahead: None,
            col_store: HashMap::new(),
            last_completion: None,
            in_flight: VecDeque::new(),
            next_index: 0,
        })
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn arena(&self) -> &Arc<MemoryArena> {
        &self.arena
    }

    /// 参数集缓存 (只读)
    pub fn params(&self) -> &ParamSetCache {
        &self.params
    }

    /// 设置跟踪掩码, 对之后解析的访问单元生效
    pub fn set_trace_level(&mut self, mask: TraceLevel) {
        self.config.trace = mask;
    }

    /// 访问单元加锁, 阻止其竞技场块被回收
    pub fn lock(&self, au: &AccessUnit) -> Status {
        match au.block {
            Some(block) => Status::from(&self.arena.lock(block)),
            None => Status::BadHandle,
        }
    }

    pub fn unlock(&self, au: &AccessUnit) -> Status {
        match au.block {
            Some(block) => Status::from(&self.arena.unlock(block)),
            None => Status::BadHandle,
        }
    }

    /// 等待访问单元的异步解码完成并取回条带数据
    pub fn sync(&self, au: &mut AccessUnit) -> Status {
        let Some(pending) = au.pending.take() else {
            return Status::None;
        };
        let state = match pending.scheduler.sync(pending.completion, None, false) {
            Ok(state) => state,
            // 记录已被回收: 任务必已结束
            Err(BsError::BadHandle) => TaskState::Done,
            Err(err) => {
                au.mark_lost();
                return Status::from(&err);
            }
        };
        match (state, take_slot(&pending.slot)) {
            (TaskState::Done, Some(outcomes)) => {
                au.apply_outcomes(outcomes);
                Status::None
            }
            (state, _) => {
                warn!("AU {}: 完成任务状态 {:?}, 条带数据丢失", au.index, state);
                au.mark_lost();
                Status::IncompleteData
            }
        }
    }

    /// 控制接口形式的 [`parse_next_au`](Self::parse_next_au): 结果写入 `out`,
    /// 码流结束时 `out` 为 None 且返回 [`Status::None`]
    pub fn next_au(&mut self, out: &mut Option<AccessUnit>) -> Status {
        match self.parse_next_au() {
            Ok(au) => {
                *out = au;
                Status::None
            }
            Err(err) => {
                *out = None;
                Status::from(&err)
            }
        }
    }

    /// 解析下一个访问单元. 码流结束返回 `Ok(None)`.
    ///
    /// AU 并行模式下返回的访问单元可能尚未完成, 读取条带数据前需调用
    /// [`sync`](Self::sync).
    pub fn parse_next_au(&mut self) -> BsResult<Option<AccessUnit>> {
        let mut au = AccessUnit::new(self.next_index, Arc::clone(&self.arena));
        let mut pic: Option<PictureState> = None;
        let mut has_vcl = false;

        loop {
            let raw = match self.lookahead.take() {
                Some(raw) => raw,
                None => match self.stream.read_nal_unit()? {
                    Some(raw) => raw,
                    None => break,
                },
            };
            let header = match NalHeader::parse(&raw.data) {
                Ok(h) => h,
                Err(err) => {
                    warn!("偏移 {} 处的 NAL 头无效: {}", raw.stream_offset, err);
                    au.incomplete = true;
                    continue;
                }
            };
            let nal_type = header.nal_type;
            let first_slice = raw.data.get(2).is_some_and(|b| b & 0x80 != 0);
            if has_vcl && starts_new_access_unit(nal_type, first_slice) {
                self.lookahead = Some(raw);
                break;
            }
            has_vcl |= nal_type.is_vcl();

            if self.config.trace.contains(TraceLevel::NALU) {
                trace!(
                    "NAL {} 偏移 {} 大小 {} layer={} tid={}",
                    nal_type.name(),
                    raw.stream_offset,
                    raw.data.len(),
                    header.layer_id,
                    header.temporal_id()
                );
            }

            let nal_index = au.nals.len();
            let payload = self.handle_nal(&mut au, &mut pic, nal_index, &header, &raw)?;
            if matches!(payload, NalPayload::Corrupt(_)) {
                au.incomplete = true;
            }
            au.nals.push(NalUnit {
                header,
                stream_offset: raw.stream_offset,
                size: raw.data.len(),
                payload,
            });
            if nal_type == NalUnitType::Eos {
                self.refs.end_of_sequence();
            }
        }

        if au.nals.is_empty() {
            return Ok(None);
        }
        self.next_index += 1;
        self.reparse_postponed(&mut au);

        let bases: Vec<_> = pic
            .as_ref()
            .map(|p| vec![p.sps.block, p.pps.block])
            .unwrap_or_default();
        let au_handle = self.arena.alloc(AuBlock, &bases)?;
        au.block = Some(au_handle.id());

        match pic {
            Some(pic) => self.dispatch(&mut au, au_handle, pic)?,
            None => au.refresh_stats(),
        }
        debug!(
            "AU {}: POC {:?}, {} 个 NAL, {} 个条带段{}",
            au.index,
            au.poc,
            au.nals.len(),
            au.slices.len(),
            if au.incomplete { ", 不完整" } else { "" }
        );
        Ok(Some(au))
    }

    /// 解析单个 NAL. 只有资源类错误向上传播, 语法错误记为损坏负载.
    fn handle_nal(
        &mut self,
        au: &mut AccessUnit,
        pic: &mut Option<PictureState>,
        nal_index: usize,
        header: &NalHeader,
        raw: &RawNal,
    ) -> BsResult<NalPayload> {
        if header.layer_id != 0 {
            return Ok(NalPayload::Skipped);
        }
        let trace_mask = self.config.trace;
        let mut bc = BitCursor::new(&raw.data);
        let result = bc.skip_bits(16).and_then(|_| match header.nal_type {
            NalUnitType::Vps => {
                let vps = Vps::parse(&mut bc)?;
                let id = vps.vps_id;
                if trace_mask.contains(TraceLevel::SPS) {
                    trace!("VPS {}: {} 层 {} 子层", id, vps.max_layers_minus1 + 1, vps.max_sub_layers_minus1 + 1);
                }
                self.params.insert_vps(vps)?;
                self.reparse_postponed(au);
                Ok(self.params.vps(id).map_or(NalPayload::Skipped, |r| NalPayload::Vps(r.value)))
            }
            NalUnitType::Sps => {
                let sps = Sps::parse(&mut bc)?;
                let id = sps.sps_id;
                if trace_mask.contains(TraceLevel::SPS) {
                    trace!(
                        "SPS {}: {}x{} CTB {} chroma={}",
                        id,
                        sps.pic_width_in_luma_samples,
                        sps.pic_height_in_luma_samples,
                        1u32 << sps.ctb_log2,
                        sps.chroma_format_idc
                    );
                }
                self.params.insert_sps(sps)?;
                self.reparse_postponed(au);
                Ok(self.params.sps(id).map_or(NalPayload::Skipped, |r| NalPayload::Sps(r.value)))
            }
            NalUnitType::Pps => {
                let pps = Pps::parse(&mut bc)?;
                let id = pps.pps_id;
                if trace_mask.contains(TraceLevel::PPS) {
                    trace!(
                        "PPS {} -> SPS {}: tiles={} wpp={}",
                        id,
                        pps.sps_id,
                        pps.tiles_enabled_flag,
                        pps.entropy_coding_sync_enabled_flag
                    );
                }
                self.params.insert_pps(pps)?;
                Ok(self.params.pps(id).map_or(NalPayload::Skipped, |r| NalPayload::Pps(r.value)))
            }
            NalUnitType::PrefixSei | NalUnitType::SuffixSei => {
                let messages = parse_sei_rbsp(&mut bc, &self.params)?;
                if trace_mask.contains(TraceLevel::SEI) {
                    for m in &messages {
                        trace!("SEI 类型 {} 大小 {}", m.payload_type, m.payload_size);
                    }
                }
                Ok(NalPayload::Sei(messages))
            }
            t if t.is_slice() => self.handle_slice(au, pic, nal_index, header, raw, &mut bc),
            _ => Ok(NalPayload::Skipped),
        });

        match result {
            Ok(payload) => Ok(payload),
            Err(err @ BsError::AllocFailure(_)) => Err(err),
            Err(err) => {
                warn!(
                    "{} 单元 (偏移 {}) 解析失败: {}",
                    header.nal_type.name(),
                    raw.stream_offset,
                    err
                );
                Ok(NalPayload::Corrupt(err.to_string()))
            }
        }
    }

    /// 新参数集出现后重新解析等待中的 SEI
    fn reparse_postponed(&self, au: &mut AccessUnit) {
        for nal in &mut au.nals {
            if let NalPayload::Sei(messages) = &mut nal.payload {
                for m in messages.iter_mut().filter(|m| m.is_postponed()) {
                    m.reparse(&self.params);
                }
            }
        }
    }

    fn handle_slice(
        &mut self,
        au: &mut AccessUnit,
        pic: &mut Option<PictureState>,
        nal_index: usize,
        header: &NalHeader,
        raw: &RawNal,
        bc: &mut BitCursor<'_>,
    ) -> BsResult<NalPayload> {
        let nal_type = header.nal_type;
        let temporal_id = header.temporal_id();
        let pps_id = SliceHeader::peek_pps_id(bc, nal_type)?;
        let (sps, pps) = self.params.resolve(pps_id)?;
        if let Some(p) = pic.as_ref() {
            if p.pps.value.pps_id != pps.value.pps_id {
                return Err(BsError::WrongUnitOrder(format!(
                    "同一图像的条带段引用了不同的 PPS ({} / {})",
                    p.pps.value.pps_id, pps.value.pps_id
                )));
            }
        }
        self.params.activate_sps(sps.value.sps_id)?;

        // 头部解析过程中可能需要提前开始图像 (构造参考列表)
        let existing_rps = pic.as_ref().map(|p| p.rps.clone());
        let mut started: Option<PictureStart> = None;
        let parsed = {
            let prev_independent = au
                .slices
                .iter()
                .rev()
                .find(|s| s.header.is_independent())
                .map(|s| &s.header);
            let ctx = HeaderContext {
                nal_type,
                sps: &sps.value,
                pps: &pps.value,
                prev_independent,
            };
            let refs = &mut self.refs;
            let mut resolve = |sh: &SliceHeader| -> BsResult<RefLists> {
                let rps = match &existing_rps {
                    Some(rps) => rps.clone(),
                    None => started
                        .get_or_insert_with(|| refs.begin_picture(nal_type, temporal_id, sh, &sps.value))
                        .rps
                        .clone(),
                };
                RefManager::build_lists(sh, &pps.value, &rps)
            };
            SliceHeader::parse(bc, &ctx, &mut resolve)
        };
        let sh = match parsed {
            Ok(sh) => sh,
            Err(err) => {
                // 图像已在参考管理器中开始, 保持状态一致
                if let Some(start) = started.filter(|_| pic.is_none()) {
                    warn!("POC {} 的首个条带段头解析失败", start.rps.poc);
                    *pic = Some(self.open_picture(au, start, &sps, &pps)?);
                }
                return Err(err);
            }
        };

        if pic.is_none() {
            let start = match started {
                Some(start) => start,
                None => self.refs.begin_picture(nal_type, temporal_id, &sh, &sps.value),
            };
            *pic = Some(self.open_picture(au, start, &sps, &pps)?);
        }
        let Some(p) = pic.as_mut() else {
            return Err(BsError::Internal("图像状态缺失".into()));
        };

        let first_ts = p.layout.rs_to_ts(sh.slice_segment_address);
        if let Some(prev) = p.segments.last() {
            if first_ts <= prev.first_ts {
                return Err(BsError::WrongUnitOrder(format!(
                    "条带段地址 {} 不在前一条带段之后",
                    sh.slice_segment_address
                )));
            }
        }
        let slice_addr_rs = if sh.is_independent() {
            sh.slice_segment_address
        } else {
            p.segments
                .last()
                .map(|s| s.slice_addr_rs)
                .ok_or_else(|| BsError::syntax("依赖条带段之前没有条带段"))?
        };

        let mut corrupted = false;
        let lists = match sh.early_ref_lists.clone() {
            Some(lists) => lists,
            None => match RefManager::build_lists(&sh, &p.pps.value, &p.rps) {
                Ok(lists) => lists,
                Err(err) => {
                    warn!("POC {} 条带段 {}: 参考列表构造失败: {}", p.poc, sh.slice_segment_address, err);
                    corrupted = true;
                    RefLists::default()
                }
            },
        };
        if self.config.trace.contains(TraceLevel::SLICE_HEADER) {
            trace!(
                "条带段 POC {} 地址 {} 类型 {} 依赖={} QP={} 入口点 {}",
                p.poc,
                sh.slice_segment_address,
                sh.slice_type.name(),
                sh.dependent_slice_segment_flag,
                sh.slice_qp,
                sh.num_entry_points()
            );
        }
        if self.config.trace.contains(TraceLevel::REF_LIST) {
            let pocs = |l: &[super::refs::RefPic]| l.iter().map(|r| r.poc).collect::<Vec<_>>();
            trace!("  L0={:?} L1={:?}", pocs(&lists.l0), pocs(&lists.l1));
        }

        let col_missing = self.select_col(p, &sh, &lists);

        let slice = au.slices.len();
        p.segments.push(SegmentMeta {
            slice,
            nal: raw.data.clone(),
            slice_addr_rs,
            first_ts,
            col_missing,
        });
        au.slices.push(Slice {
            nal_index,
            header: sh,
            lists,
            corrupted,
            ..Default::default()
        });
        Ok(NalPayload::Slice(slice))
    }

    /// 开始新图像: 移出 DPB 之外的同位运动场, 为本图像分配运动场
    fn open_picture(
        &mut self,
        au: &mut AccessUnit,
        start: PictureStart,
        sps: &ParamRef<Sps>,
        pps: &ParamRef<Pps>,
    ) -> BsResult<PictureState> {
        let poc = start.rps.poc;
        for evicted in &start.evicted {
            self.drop_col(*evicted);
        }
        let layout = self.layouts.get(&sps.value, &pps.value)?;

        let motion_out = if sps.value.temporal_mvp_enabled_flag {
            self.drop_col(poc);
            let handle = self.arena.alloc(ColSlot::new(), &[])?;
            let slot = self.arena.get(handle)?;
            let entry = ColEntry { handle, slot };
            self.col_store.insert(poc, entry.clone());
            Some(entry)
        } else {
            None
        };

        au.poc = Some(poc);
        Ok(PictureState {
            poc,
            rps: start.rps,
            sps: sps.clone(),
            pps: pps.clone(),
            layout,
            col: None,
            motion_out,
            segments: Vec::new(),
        })
    }

    fn drop_col(&mut self, poc: i32) {
        if let Some(entry) = self.col_store.remove(&poc) {
            if let Err(err) = self.arena.free(entry.handle.id()) {
                warn!("释放 POC {} 的运动场失败: {}", poc, err);
            }
        }
    }

    /// 确定条带的同位图像, 返回是否缺失
    fn select_col(&self, p: &mut PictureState, sh: &SliceHeader, lists: &RefLists) -> bool {
        if !p.sps.value.temporal_mvp_enabled_flag
            || !sh.temporal_mvp_enabled_flag
            || sh.slice_type.is_intra()
        {
            return false;
        }
        let list = if sh.slice_type.is_b() && !sh.collocated_from_l0_flag {
            &lists.l1
        } else {
            &lists.l0
        };
        let Some(col_ref) = list.get(sh.collocated_ref_idx as usize) else {
            return true;
        };
        if let Some((poc, _)) = &p.col {
            if *poc != col_ref.poc {
                warn!("POC {}: 条带间同位图像不一致 ({} / {})", p.poc, poc, col_ref.poc);
                return true;
            }
            return false;
        }
        match self.col_store.get(&col_ref.poc) {
            Some(entry) if !col_ref.lost => {
                p.col = Some((col_ref.poc, entry.clone()));
                false
            }
            _ => {
                debug!("POC {}: 同位图像 {} 的运动场不可用", p.poc, col_ref.poc);
                true
            }
        }
    }

    /// 构造图像任务并按模式解码
    fn dispatch(
        &mut self,
        au: &mut AccessUnit,
        au_handle: Handle<AuBlock>,
        pic: PictureState,
    ) -> BsResult<()> {
        let num_ctbs = pic.layout.num_ctbs();
        let segments: Vec<SegmentJob> = pic
            .segments
            .iter()
            .enumerate()
            .map(|(i, meta)| {
                let slice = &au.slices[meta.slice];
                SegmentJob {
                    nal: meta.nal.clone(),
                    header: slice.header.clone(),
                    lists: slice.lists.clone(),
                    slice_addr_rs: meta.slice_addr_rs,
                    first_ts: meta.first_ts,
                    end_ts: pic.segments.get(i + 1).map_or(num_ctbs, |n| n.first_ts),
                    col_missing: meta.col_missing,
                }
            })
            .collect();
        if segments.len() != au.slices.len() {
            return Err(BsError::Internal("条带段元数据与条带数不符".into()));
        }

        let job = PictureJob {
            sps: Arc::clone(&pic.sps.value),
            pps: Arc::clone(&pic.pps.value),
            layout: Arc::clone(&pic.layout),
            poc: pic.poc,
            trace: self.config.trace,
            col: pic.col.as_ref().map(|(_, e)| Arc::clone(&e.slot)),
            motion_out: pic.motion_out.as_ref().map(|e| Arc::clone(&e.slot)),
            segments,
        };
        let units = plan_units(&job, self.config.mode);
        debug!("POC {}: {} 个条带段, {} 个工作单元", job.poc, job.segments.len(), units.len());

        let Some(scheduler) = self.scheduler.clone() else {
            let fragments = units.iter().map(|u| decode_unit(&job, u)).collect();
            let outcomes = complete_picture(&job, fragments);
            au.apply_outcomes(outcomes);
            return Ok(());
        };

        let col_handle = pic.col.as_ref().map(|(_, e)| e.handle);
        let priority = i32::try_from(au.index).map_or(i32::MIN, |i| -i);
        let au_parallel = self.config.mode.contains(ParseMode::AU_PARALLEL);
        let job = Arc::new(job);

        let mut unit_points = Vec::with_capacity(units.len());
        let mut unit_slots: Vec<FragmentSlot> = Vec::with_capacity(units.len());
        for unit in units {
            let slot: FragmentSlot = Arc::new(Mutex::new(None));
            let mut guards: Vec<PinGuard> = vec![self.arena.pin(au_handle)?];
            if let Some(h) = col_handle {
                guards.push(self.arena.pin(h)?);
            }
            // 同位运动场由之前的完成任务写入
            let deps: Vec<SyncPoint> = if au_parallel && col_handle.is_some() {
                self.last_completion.into_iter().collect()
            } else {
                Vec::new()
            };
            let routine_job = Arc::clone(&job);
            let routine_slot = Arc::clone(&slot);
            let point = scheduler.submit(
                Box::new(move || {
                    let _guards = guards;
                    fill_slot(&routine_slot, decode_unit(&routine_job, &unit));
                    Ok(())
                }),
                priority,
                &deps,
            )?;
            unit_points.push(point);
            unit_slots.push(slot);
        }

        let out_slot: OutcomeSlot = Arc::new(Mutex::new(None));
        let mut deps = unit_points.clone();
        deps.extend(self.last_completion);
        let guard = self.arena.pin(au_handle)?;
        let routine_slot = Arc::clone(&out_slot);
        let completion = scheduler.submit(
            Box::new(move || {
                let _guard = guard;
                let units = unit_slots.iter().map(|s| take_slot(s).unwrap_or_default()).collect();
                fill_slot(&routine_slot, complete_picture(&job, units));
                Ok(())
            }),
            priority,
            &deps,
        )?;
        for point in unit_points {
            if let Err(err) = scheduler.detach(point) {
                trace!("分离单元任务 {}: {}", point.id(), err);
            }
        }
        self.last_completion = Some(completion);
        au.pending = Some(PendingWork {
            scheduler: Arc::clone(&scheduler),
            completion,
            slot: out_slot,
        });

        if au_parallel {
            self.in_flight.push_back(completion);
            while self.in_flight.len() > self.config.async_depth {
                if let Some(oldest) = self.in_flight.pop_front() {
                    match scheduler.sync(oldest, None, true) {
                        Ok(_) | Err(BsError::BadHandle) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        } else {
            let status = self.sync(au);
            if !status.is_ok() {
                debug!("AU {}: 同步状态 {}", au.index, status);
            }
        }
        Ok(())
    }
}

impl Drop for Parser {
    fn drop(&mut self) {
        let pocs: Vec<i32> = self.col_store.keys().copied().collect();
        for poc in pocs {
            self.drop_col(poc);
        }
    }
}
