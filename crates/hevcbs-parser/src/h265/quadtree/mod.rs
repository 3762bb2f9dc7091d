//! 编码四叉树解码: SAO, CU/PU/TU 语法, 帧内模式, 合并/AMVP, 残差, 调色板.
//!
//! 树以索引区间组织: 每个 CTU 记录它的 CU 区间, 每个 CU 记录 PU/TU 区间,
//! 每个 TU 记录残差块区间. 只支持自顶向下遍历.
//!
//! 一个工作单元 ([`UnitDecoder`]) 按分块扫描序连续解码若干条带段,
//! 单元内保存 WPP 与非独立条带段的上下文快照.

mod coding;
pub mod grid;
mod inter;
mod palette;
mod residual;
mod sao;
pub mod scan;
mod transform;

use std::ops::Range;
use std::sync::Arc;

use hevcbs_core::{BitCursor, BsError, BsResult};
use log::{debug, trace, warn};
use serde::Serialize;

use super::cabac::{self, CabacDecoder, ContextTable};
use super::control::TraceLevel;
use super::layout::PictureLayout;
use super::motion::{ColMotion, Mv, MotionInfo};
use super::params::{Pps, Sps};
use super::refs::RefLists;
use super::slice_header::SliceHeader;
use grid::PictureGrid;

// ============================================================
// 语法树
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PredMode {
    #[default]
    Intra,
    Inter,
    Skip,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PartMode {
    #[default]
    Part2Nx2N,
    Part2NxN,
    PartNx2N,
    PartNxN,
    Part2NxnU,
    Part2NxnD,
    PartnLx2N,
    PartnRx2N,
}

impl PartMode {
    /// 各预测块 (x, y, w, h), 相对 CU 左上角
    pub fn partitions(self, n: u32) -> Vec<(u32, u32, u32, u32)> {
        let h = n / 2;
        let q = n / 4;
        match self {
            Self::Part2Nx2N => vec![(0, 0, n, n)],
            Self::Part2NxN => vec![(0, 0, n, h), (0, h, n, h)],
            Self::PartNx2N => vec![(0, 0, h, n), (h, 0, h, n)],
            Self::PartNxN => vec![(0, 0, h, h), (h, 0, h, h), (0, h, h, h), (h, h, h, h)],
            Self::Part2NxnU => vec![(0, 0, n, q), (0, q, n, n - q)],
            Self::Part2NxnD => vec![(0, 0, n, n - q), (0, n - q, n, q)],
            Self::PartnLx2N => vec![(0, 0, q, n), (q, 0, n - q, n)],
            Self::PartnRx2N => vec![(0, 0, n - q, n), (n - q, 0, q, n)],
        }
    }

    pub fn is_vertical_split(self) -> bool {
        matches!(self, Self::PartNx2N | Self::PartnLx2N | Self::PartnRx2N)
    }

    pub fn is_horizontal_split(self) -> bool {
        matches!(self, Self::Part2NxN | Self::Part2NxnU | Self::Part2NxnD)
    }
}

/// 单个分量的 SAO 参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaoComponent {
    /// 0 关闭, 1 带偏移, 2 边缘偏移
    pub type_idx: u8,
    /// SaoOffsetVal (已按 log2_sao_offset_scale 缩放)
    pub offsets: [i16; 4],
    pub band_position: u8,
    pub eo_class: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaoParams {
    pub merge_left: bool,
    pub merge_up: bool,
    pub comps: [SaoComponent; 3],
}

#[derive(Debug, Clone)]
pub struct Ctu {
    pub addr_rs: u32,
    pub addr_ts: u32,
    pub sao: Option<SaoParams>,
    pub cus: Range<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct CodingUnit {
    pub x: u32,
    pub y: u32,
    pub log2_size: u8,
    pub ct_depth: u8,
    pub pred_mode: PredMode,
    pub part_mode: PartMode,
    pub transquant_bypass: bool,
    pub pcm: bool,
    /// 调色板数据下标
    pub palette: Option<u32>,
    /// 每个分区的亮度 / 色度帧内模式
    pub intra_luma: [u8; 4],
    pub intra_chroma: [u8; 4],
    /// intra_chroma_pred_mode 语法值
    pub intra_chroma_syntax: [u8; 4],
    pub qp_y: i32,
    pub pus: Range<u32>,
    pub tus: Range<u32>,
    /// PCM 样本区间
    pub pcm_samples: Range<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct PredictionUnit {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub merge_flag: bool,
    pub merge_idx: u8,
    pub mvp_flag: [u8; 2],
    pub mvd: [Mv; 2],
    pub motion: MotionInfo,
}

#[derive(Debug, Clone, Default)]
pub struct TransformUnit {
    pub x: u32,
    pub y: u32,
    pub log2_size: u8,
    pub depth: u8,
    pub cbf_luma: bool,
    /// 4:2:2 时每个色度分量有上下两个块
    pub cbf_cb: [bool; 2],
    pub cbf_cr: [bool; 2],
    pub qp_y: i32,
    pub qp_cb: i32,
    pub qp_cr: i32,
    pub residual_act: bool,
    /// log2_res_scale_abs_plus1 与符号折算后的 ResScaleVal (Cb, Cr)
    pub res_scale: [i8; 2],
    pub residuals: Range<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ResidualBlock {
    pub c_idx: u8,
    pub x: u32,
    pub y: u32,
    pub log2_size: u8,
    pub scan_idx: u8,
    pub transform_skip: bool,
    /// 显式 RDPCM 方向 (0 水平, 1 垂直)
    pub explicit_rdpcm: Option<u8>,
    pub coeffs: Range<u32>,
}

/// 非零系数: 块内光栅位置与电平
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coeff {
    pub pos: u16,
    pub level: i32,
}

/// 调色板编码 CU 的数据
#[derive(Debug, Clone, Default)]
pub struct PaletteBlock {
    /// 当前调色板 (每项三个分量)
    pub entries: Vec<[u16; 3]>,
    pub num_predicted: u32,
    pub escape_present: bool,
    pub transpose: bool,
    /// 光栅序索引图
    pub indices: Vec<u8>,
    /// 逸出值, 按分量与扫描序排列
    pub escapes: Vec<u16>,
}

/// 条带 (或条带片段) 的解码结果
#[derive(Debug, Clone, Default)]
pub struct SliceData {
    pub ctus: Vec<Ctu>,
    pub cus: Vec<CodingUnit>,
    pub pus: Vec<PredictionUnit>,
    pub tus: Vec<TransformUnit>,
    pub residuals: Vec<ResidualBlock>,
    pub coeffs: Vec<Coeff>,
    pub palettes: Vec<PaletteBlock>,
    pub pcm_samples: Vec<u16>,
    /// 消耗的条带数据字节数
    pub bytes: usize,
    /// 解码的 bin 数
    pub bins: u64,
}

fn shift(r: &Range<u32>, by: u32) -> Range<u32> {
    r.start + by..r.end + by
}

impl SliceData {
    pub fn is_empty(&self) -> bool {
        self.ctus.is_empty()
    }

    /// 追加另一个片段, 调整其中全部区间
    pub fn append(&mut self, other: SliceData) {
        let cu_base = self.cus.len() as u32;
        let pu_base = self.pus.len() as u32;
        let tu_base = self.tus.len() as u32;
        let res_base = self.residuals.len() as u32;
        let coeff_base = self.coeffs.len() as u32;
        let pal_base = self.palettes.len() as u32;
        let pcm_base = self.pcm_samples.len() as u32;

        self.ctus.extend(other.ctus.into_iter().map(|mut c| {
            c.cus = shift(&c.cus, cu_base);
            c
        }));
        self.cus.extend(other.cus.into_iter().map(|mut c| {
            c.pus = shift(&c.pus, pu_base);
            c.tus = shift(&c.tus, tu_base);
            c.pcm_samples = shift(&c.pcm_samples, pcm_base);
            c.palette = c.palette.map(|p| p + pal_base);
            c
        }));
        self.pus.extend(other.pus);
        self.tus.extend(other.tus.into_iter().map(|mut t| {
            t.residuals = shift(&t.residuals, res_base);
            t
        }));
        self.residuals.extend(other.residuals.into_iter().map(|mut r| {
            r.coeffs = shift(&r.coeffs, coeff_base);
            r
        }));
        self.coeffs.extend(other.coeffs);
        self.palettes.extend(other.palettes);
        self.pcm_samples.extend(other.pcm_samples);
        self.bytes += other.bytes;
        self.bins += other.bins;
    }

    /// 一个 CTU 的全部 CU
    pub fn cus_of(&self, ctu: &Ctu) -> &[CodingUnit] {
        &self.cus[ctu.cus.start as usize..ctu.cus.end as usize]
    }

    pub fn pus_of(&self, cu: &CodingUnit) -> &[PredictionUnit] {
        &self.pus[cu.pus.start as usize..cu.pus.end as usize]
    }

    pub fn tus_of(&self, cu: &CodingUnit) -> &[TransformUnit] {
        &self.tus[cu.tus.start as usize..cu.tus.end as usize]
    }

    pub fn residuals_of(&self, tu: &TransformUnit) -> &[ResidualBlock] {
        &self.residuals[tu.residuals.start as usize..tu.residuals.end as usize]
    }

    pub fn coeffs_of(&self, r: &ResidualBlock) -> &[Coeff] {
        &self.coeffs[r.coeffs.start as usize..r.coeffs.end as usize]
    }

    /// 把全部帧间 PU 的运动写入同位运动场
    pub fn store_motion(&self, col: &mut ColMotion, lists: &RefLists) {
        for cu in &self.cus {
            if cu.pred_mode == PredMode::Intra {
                continue;
            }
            for pu in self.pus_of(cu) {
                col.store(pu.x, pu.y, pu.w, pu.h, &pu.motion, lists);
            }
        }
    }
}

// ============================================================
// 单元解码器
// ============================================================

/// 上下文快照: CABAC 状态, Rice 统计量, 调色板预测器
#[derive(Debug, Clone, Default)]
struct SyncState {
    contexts: ContextTable,
    stat_coeff: [u8; 4],
    palette_pred: Vec<[u16; 3]>,
}

/// 解码一个条带段所需的输入
pub struct SegmentInput<'a> {
    /// 含 NAL 头与防竞争字节的完整 NAL 数据
    pub nal: &'a [u8],
    pub header: &'a SliceHeader,
    pub lists: &'a RefLists,
    /// 所属条带第一个 CTB 的光栅地址 (SliceAddrRs)
    pub slice_addr_rs: u32,
    /// 起始字节偏移 (原始字节)
    pub start_offset: usize,
    /// 起始 CTB 的分块扫描地址
    pub first_ts: u32,
}

/// 一次条带段解码的结果
#[derive(Debug)]
pub struct SegmentOutcome {
    pub data: SliceData,
    /// 下一个待解码 CTB 的分块扫描地址
    pub next_ts: u32,
    /// 是否读到 end_of_slice_segment_flag
    pub ended: bool,
    pub error: Option<BsError>,
}

/// 图像级只读上下文
#[derive(Clone)]
pub struct PictureContext<'a> {
    pub sps: &'a Sps,
    pub pps: &'a Pps,
    pub layout: Arc<PictureLayout>,
    pub poc: i32,
    pub col: Option<&'a ColMotion>,
    pub trace: TraceLevel,
}

/// 工作单元解码器
pub struct UnitDecoder<'a> {
    pic: PictureContext<'a>,
    grid: PictureGrid,
    wpp_store: Option<SyncState>,
    ds_store: Option<SyncState>,
    last_qp_y: Option<i32>,
}

impl<'a> UnitDecoder<'a> {
    pub fn new(pic: PictureContext<'a>) -> Self {
        let grid = PictureGrid::new(Arc::clone(&pic.layout));
        Self {
            pic,
            grid,
            wpp_store: None,
            ds_store: None,
            last_qp_y: None,
        }
    }

    /// 从 `seg.first_ts` 起解码, 直到条带段结束或到达 `end_ts`
    pub fn decode_segment(&mut self, seg: &SegmentInput<'_>, end_ts: u32) -> SegmentOutcome {
        let mut cursor = BitCursor::new(seg.nal);
        if let Err(err) = cursor.seek_raw(seg.start_offset) {
            return SegmentOutcome {
                data: SliceData::default(),
                next_ts: seg.first_ts,
                ended: false,
                error: Some(err),
            };
        }
        let pic = self.pic.clone();
        let mut dec = CtuDecoder::new(&pic, seg, cursor, &mut self.grid);
        let result = dec.run(
            end_ts,
            &mut self.wpp_store,
            &mut self.ds_store,
            &mut self.last_qp_y,
        );
        let next_ts = dec.ctb_ts;
        let mut data = std::mem::take(&mut dec.out);
        data.bins = dec.cabac.bins();
        data.bytes = dec
            .cabac
            .cursor()
            .raw_byte_position()
            .saturating_sub(seg.start_offset);
        match result {
            Ok(ended) => SegmentOutcome {
                data,
                next_ts,
                ended,
                error: None,
            },
            Err(err) => {
                warn!(
                    "条带段 (地址 {}) 在 CTB {} 处解码失败: {}",
                    seg.header.slice_segment_address, next_ts, err
                );
                SegmentOutcome {
                    data,
                    next_ts,
                    ended: false,
                    error: Some(err),
                }
            }
        }
    }
}

/// 量化参数状态
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct QpState {
    slice_qp: i32,
    /// 当前 CU 的 QpY
    qp_y: i32,
    /// 上一个 CU 的 QpY
    prev_qp_y: i32,
    /// 当前量化组的预测值
    pred: i32,
    /// 下一个量化组使用 SliceQpY 作为 qPY_PREV
    first_qg: bool,
    delta_coded: bool,
    delta: i32,
    chroma_offset_coded: bool,
    cu_offset_cb: i32,
    cu_offset_cr: i32,
}

/// 单个条带段的 CTU 解码器
pub(crate) struct CtuDecoder<'a> {
    cabac: CabacDecoder<'a>,
    sps: &'a Sps,
    pps: &'a Pps,
    sh: &'a SliceHeader,
    lists: &'a RefLists,
    layout: &'a PictureLayout,
    col: Option<&'a ColMotion>,
    poc: i32,
    trace: TraceLevel,
    grid: &'a mut PictureGrid,
    out: SliceData,
    slice_addr_rs: u32,
    ctb_ts: u32,
    ctb_rs: u32,
    qp: QpState,
    stat_coeff: [u8; 4],
    palette_pred: Vec<[u16; 3]>,
    /// NoBackwardPredFlag
    no_backward_pred: bool,
    wpp: bool,
}

impl<'a> CtuDecoder<'a> {
    fn new(
        pic: &'a PictureContext<'a>,
        seg: &SegmentInput<'a>,
        cursor: BitCursor<'a>,
        grid: &'a mut PictureGrid,
    ) -> Self {
        let no_backward_pred = seg
            .lists
            .l0
            .iter()
            .chain(&seg.lists.l1)
            .all(|r| r.poc <= pic.poc);
        Self {
            cabac: CabacDecoder::new(cursor),
            sps: pic.sps,
            pps: pic.pps,
            sh: seg.header,
            lists: seg.lists,
            layout: &pic.layout,
            col: pic.col,
            poc: pic.poc,
            trace: pic.trace,
            grid,
            out: SliceData::default(),
            slice_addr_rs: seg.slice_addr_rs,
            ctb_ts: seg.first_ts,
            ctb_rs: pic.layout.ts_to_rs(seg.first_ts),
            qp: QpState {
                slice_qp: seg.header.slice_qp,
                qp_y: seg.header.slice_qp,
                prev_qp_y: seg.header.slice_qp,
                pred: seg.header.slice_qp,
                first_qg: true,
                ..Default::default()
            },
            stat_coeff: [0; 4],
            palette_pred: Vec::new(),
            no_backward_pred,
            wpp: pic.pps.entropy_coding_sync_enabled_flag,
        }
    }

    fn snapshot(&self) -> SyncState {
        SyncState {
            contexts: self.cabac.contexts.clone(),
            stat_coeff: self.stat_coeff,
            palette_pred: self.palette_pred.clone(),
        }
    }

    fn restore(&mut self, s: &SyncState) {
        self.cabac.contexts = s.contexts.clone();
        self.stat_coeff = s.stat_coeff;
        self.palette_pred = s.palette_pred.clone();
    }

    /// 全新初始化上下文 (9.3.2.2)
    fn init_fresh(&mut self) {
        let it = cabac::init_type(
            self.sh.slice_type.is_intra(),
            !self.sh.slice_type.is_intra() && !self.sh.slice_type.is_b(),
            self.sh.cabac_init_flag,
        );
        self.cabac.init_contexts(it, self.sh.slice_qp);
        self.stat_coeff = [0; 4];
        self.palette_pred = self.initial_palette();
    }

    /// 调色板预测器初值: PPS 初始化器优先, 其次 SPS
    fn initial_palette(&self) -> Vec<[u16; 3]> {
        let init = self
            .pps
            .scc_ext
            .palette_predictor_initializers
            .as_ref()
            .unwrap_or(&self.sps.scc_ext.palette_predictor_initializers);
        let n = init.first().map_or(0, Vec::len);
        (0..n)
            .map(|i| {
                let mut e = [0u16; 3];
                for (c, comp) in init.iter().enumerate().take(3) {
                    e[c] = comp.get(i).copied().unwrap_or(0);
                }
                e
            })
            .collect()
    }

    /// 在 ctb_ts 处按同步规则初始化上下文 (9.3.1)
    fn init_contexts_at(
        &mut self,
        wpp_store: &Option<SyncState>,
        ds_store: &Option<SyncState>,
        last_qp_y: Option<i32>,
    ) {
        let layout = self.layout;
        let ts = self.ctb_ts;
        let rs = self.ctb_rs;
        self.qp.first_qg = true;
        if layout.is_tile_start(ts) {
            self.init_fresh();
        } else if self.wpp && layout.is_tile_row_start(rs) {
            let size = 1i32 << layout.ctb_log2;
            let x = ((rs % layout.width_ctbs) << layout.ctb_log2) as i32;
            let y = ((rs / layout.width_ctbs) << layout.ctb_log2) as i32;
            let top_right = self
                .grid
                .available(x as u32, y as u32, x + size, y - size);
            match wpp_store {
                Some(s) if top_right => self.restore(s),
                _ => self.init_fresh(),
            }
        } else if self.sh.dependent_slice_segment_flag
            && rs == self.sh.slice_segment_address
        {
            match ds_store {
                Some(s) => {
                    self.restore(s);
                    if let Some(qp) = last_qp_y {
                        self.qp.first_qg = false;
                        self.qp.qp_y = qp;
                    }
                }
                None => {
                    warn!("非独立条带段 {} 缺少前一条带段的上下文", rs);
                    self.init_fresh();
                }
            }
        } else {
            self.init_fresh();
        }
    }

    /// CTU 循环 (7.3.8.1), 返回是否读到条带段结束标志
    fn run(
        &mut self,
        end_ts: u32,
        wpp_store: &mut Option<SyncState>,
        ds_store: &mut Option<SyncState>,
        last_qp_y: &mut Option<i32>,
    ) -> BsResult<bool> {
        let layout = self.layout;
        let num_ctbs = layout.num_ctbs();
        if self.ctb_ts >= num_ctbs {
            return Err(BsError::syntax(format!(
                "条带段起始 CTB {} 超出图像",
                self.ctb_ts
            )));
        }
        self.grid.begin_ctb(self.ctb_rs, self.slice_addr_rs);
        self.cabac.init_engine()?;
        self.init_contexts_at(wpp_store, ds_store, *last_qp_y);

        loop {
            self.decode_ctu()?;
            let end_of_segment = self.cabac.decode_terminate()? == 1;

            // 行内第二个 CTB 结束时保存 WPP 快照
            if self.wpp {
                let (x0, ..) = layout.tile_rect(layout.tile_id(self.ctb_ts));
                if self.ctb_rs % layout.width_ctbs == x0 + 1 {
                    *wpp_store = Some(self.snapshot());
                }
            }
            *last_qp_y = Some(self.qp.qp_y);

            self.ctb_ts += 1;
            if end_of_segment {
                if self.pps.dependent_slice_segments_enabled_flag {
                    *ds_store = Some(self.snapshot());
                }
                self.cabac.finish()?;
                if self.ctb_ts < num_ctbs {
                    self.ctb_rs = layout.ts_to_rs(self.ctb_ts);
                }
                return Ok(true);
            }
            if self.ctb_ts >= num_ctbs {
                return Err(BsError::syntax("条带数据越过图像末尾"));
            }
            self.ctb_rs = layout.ts_to_rs(self.ctb_ts);

            if layout.is_substream_start(self.ctb_ts, self.wpp) {
                if self.cabac.decode_terminate()? != 1 {
                    return Err(BsError::syntax("end_of_subset_one_bit 不为 1"));
                }
                self.cabac.finish()?;
                if self.ctb_ts >= end_ts {
                    return Ok(false);
                }
                self.grid.begin_ctb(self.ctb_rs, self.slice_addr_rs);
                self.cabac.init_engine()?;
                self.init_contexts_at(wpp_store, ds_store, *last_qp_y);
                if self.trace.contains(TraceLevel::CTU) {
                    trace!("子码流切换: CTB ts={} rs={}", self.ctb_ts, self.ctb_rs);
                }
            } else if self.ctb_ts >= end_ts {
                debug!("工作单元在非子码流边界 {} 处结束", self.ctb_ts);
                return Ok(false);
            } else {
                self.grid.begin_ctb(self.ctb_rs, self.slice_addr_rs);
            }
        }
    }

    /// coding_tree_unit()
    fn decode_ctu(&mut self) -> BsResult<()> {
        let layout = self.layout;
        let x = (self.ctb_rs % layout.width_ctbs) << layout.ctb_log2;
        let y = (self.ctb_rs / layout.width_ctbs) << layout.ctb_log2;
        let cu_start = self.out.cus.len() as u32;

        let sao = if self.sh.sao_luma_flag || self.sh.sao_chroma_flag {
            let s = self.decode_sao(x >> layout.ctb_log2, y >> layout.ctb_log2)?;
            self.grid.set_sao(self.ctb_rs, s);
            Some(s)
        } else {
            None
        };

        self.coding_quadtree(x, y, layout.ctb_log2, 0)?;

        if self.trace.contains(TraceLevel::CTU) {
            trace!(
                "CTU rs={} ts={} ({}, {}) CU 数 {}",
                self.ctb_rs,
                self.ctb_ts,
                x,
                y,
                self.out.cus.len() as u32 - cu_start
            );
        }
        self.out.ctus.push(Ctu {
            addr_rs: self.ctb_rs,
            addr_ts: self.ctb_ts,
            sao,
            cus: cu_start..self.out.cus.len() as u32,
        });
        Ok(())
    }
}

