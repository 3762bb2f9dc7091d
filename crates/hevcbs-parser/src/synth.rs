//! 合成码流: CABAC 编码器, 参数集 / 条带头写入器与访问单元构造器.
//!
//! 只生成解析器支持的一个小子集 (4:2:0, 8 位, 无 PCM / 调色板 / 量化组),
//! CU 形态由 [`CuPattern`] 固定, 上下文推导与解码端逐项对应.
//! 供单元测试, 集成测试与基准使用. 构造参数不合法属于调用方错误, 直接 panic.

use hevcbs_core::BitCursor;
use hevcbs_core::bitwriter::BitWriter;

use crate::h265::cabac::tables::{RANGE_TAB_LPS, TRANS_IDX_LPS, TRANS_IDX_MPS};
use crate::h265::cabac::{self, ContextTable, ctx};
use crate::h265::layout::PictureLayout;
use crate::h265::nal::NalUnitType;
use crate::h265::params::{Pps, Sps, Vps};
use crate::h265::slice_header::SliceType;

// ============================================================
// CABAC 编码器 (9.3.4 的逆过程)
// ============================================================

/// CABAC 算术编码器
pub struct CabacEncoder {
    bw: BitWriter,
    low: u32,
    range: u32,
    outstanding: u32,
    first_bit: bool,
    /// 自上次终止以来是否写入过 bin
    dirty: bool,
    pub contexts: ContextTable,
}

impl Default for CabacEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CabacEncoder {
    pub fn new() -> Self {
        Self {
            bw: BitWriter::new(),
            low: 0,
            range: 510,
            outstanding: 0,
            first_bit: true,
            dirty: false,
            contexts: ContextTable::default(),
        }
    }

    pub fn init_contexts(&mut self, init_type: usize, slice_qp_y: i32) {
        self.contexts = ContextTable::init(init_type, slice_qp_y);
    }

    /// 已输出的完整字节数 (终止之后即为子码流边界)
    pub fn byte_len(&self) -> usize {
        self.bw.bits_written() / 8
    }

    fn put_bit(&mut self, bit: u32) {
        if self.first_bit {
            self.first_bit = false;
        } else {
            self.bw.write_bit(bit);
        }
        while self.outstanding > 0 {
            self.bw.write_bit(1 - bit);
            self.outstanding -= 1;
        }
    }

    fn renorm(&mut self) {
        while self.range < 256 {
            if self.low < 256 {
                self.put_bit(0);
            } else if self.low >= 512 {
                self.low -= 512;
                self.put_bit(1);
            } else {
                self.low -= 256;
                self.outstanding += 1;
            }
            self.range <<= 1;
            self.low <<= 1;
        }
    }

    pub fn encode_decision(&mut self, ctx_idx: usize, bin: u32) {
        self.dirty = true;
        let (state, mps) = self.contexts.get(ctx_idx);
        let s = usize::from(state);
        let lps = u32::from(RANGE_TAB_LPS[s][((self.range >> 6) & 3) as usize]);
        self.range -= lps;
        if bin != u32::from(mps) {
            self.low += self.range;
            self.range = lps;
            let new_mps = if s == 0 { 1 - mps } else { mps };
            self.contexts.set(ctx_idx, TRANS_IDX_LPS[s], new_mps);
        } else {
            self.contexts.set(ctx_idx, TRANS_IDX_MPS[s], mps);
        }
        self.renorm();
    }

    pub fn encode_bypass(&mut self, bin: u32) {
        self.dirty = true;
        self.low <<= 1;
        if bin != 0 {
            self.low += self.range;
        }
        if self.low >= 1024 {
            self.put_bit(1);
            self.low -= 1024;
        } else if self.low < 512 {
            self.put_bit(0);
        } else {
            self.low -= 512;
            self.outstanding += 1;
        }
    }

    /// 写 n 个旁路 bin, 高位在前
    pub fn encode_bypass_bins(&mut self, value: u32, n: u32) {
        for i in (0..n).rev() {
            self.encode_bypass((value >> i) & 1);
        }
    }

    /// k 阶 Exp-Golomb
    pub fn encode_egk(&mut self, mut value: u32, mut k: u32) {
        while value >= (1 << k) {
            self.encode_bypass(1);
            value -= 1 << k;
            k += 1;
        }
        self.encode_bypass(0);
        self.encode_bypass_bins(value, k);
    }

    /// 截断二进制码
    pub fn encode_tb(&mut self, value: u32, c_max: u32) {
        let n = c_max + 1;
        let k = 31 - n.leading_zeros();
        let u = (1u32 << (k + 1)) - n;
        if value < u {
            self.encode_bypass_bins(value, k);
        } else {
            self.encode_bypass_bins(value + u, k + 1);
        }
    }

    /// 截断一元码, 旁路 bin
    pub fn encode_tu_bypass(&mut self, value: u32, c_max: u32) {
        for _ in 0..value {
            self.encode_bypass(1);
        }
        if value < c_max {
            self.encode_bypass(0);
        }
    }

    /// 终止 bin. 为 1 时冲刷引擎, 补齐到字节边界并重新开始
    pub fn encode_terminate(&mut self, bin: u32) {
        self.range -= 2;
        if bin != 0 {
            self.low += self.range;
            self.range = 2;
            self.renorm();
            self.put_bit((self.low >> 9) & 1);
            self.bw.write_bits(((self.low >> 7) & 3) | 1, 2);
            self.bw.align_zero();
            self.low = 0;
            self.range = 510;
            self.outstanding = 0;
            self.first_bit = true;
            self.dirty = false;
        } else {
            self.dirty = true;
            self.renorm();
        }
    }

    /// 结束编码. 尚有未终止的 bin 时先写一个终止 bin 1
    pub fn finish(mut self) -> Vec<u8> {
        if self.dirty {
            self.encode_terminate(1);
        }
        self.bw.finish()
    }
}

// ============================================================
// 参数集写入
// ============================================================

/// 合成码流的序列 / 图像级参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub width: u32,
    pub height: u32,
    pub min_cb_log2: u32,
    pub ctb_log2: u32,
    pub min_tb_log2: u32,
    pub max_tb_log2: u32,
    pub log2_max_poc_lsb_minus4: u32,
    pub tile_columns: u32,
    pub tile_rows: u32,
    pub wpp: bool,
    pub dependent_slices: bool,
    pub sao: bool,
    pub temporal_mvp: bool,
    pub init_qp: i32,
    pub vps_id: u8,
    pub sps_id: u8,
    pub pps_id: u8,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            min_cb_log2: 3,
            ctb_log2: 4,
            min_tb_log2: 2,
            max_tb_log2: 4,
            log2_max_poc_lsb_minus4: 4,
            tile_columns: 1,
            tile_rows: 1,
            wpp: false,
            dependent_slices: false,
            sao: false,
            temporal_mvp: false,
            init_qp: 26,
            vps_id: 0,
            sps_id: 0,
            pps_id: 0,
        }
    }
}

impl StreamParams {
    fn tiles_enabled(&self) -> bool {
        self.tile_columns > 1 || self.tile_rows > 1
    }
}

/// Main profile, level 3.1, 无子层
fn write_ptl(bw: &mut BitWriter) {
    bw.write_bits(0, 2); // profile_space
    bw.write_flag(false); // tier
    bw.write_bits(1, 5); // Main
    bw.write_bits(0x6000_0000, 32);
    bw.write_flag(true); // progressive_source
    bw.write_flag(false);
    bw.write_flag(false);
    bw.write_flag(true); // frame_only_constraint
    bw.write_bits(0, 32);
    bw.write_bits(0, 12);
    bw.write_bits(93, 8);
}

pub fn write_vps_rbsp(p: &StreamParams) -> Vec<u8> {
    let mut bw = BitWriter::new();
    bw.write_bits(u32::from(p.vps_id), 4);
    bw.write_flag(true); // base_layer_internal
    bw.write_flag(true); // base_layer_available
    bw.write_bits(0, 6);
    bw.write_bits(0, 3);
    bw.write_flag(true);
    bw.write_bits(0xFFFF, 16);
    write_ptl(&mut bw);
    bw.write_flag(true);
    bw.write_ue(4);
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_bits(0, 6); // max_layer_id
    bw.write_ue(0); // num_layer_sets_minus1
    bw.write_flag(false); // timing_info
    bw.write_flag(false); // extension
    bw.write_trailing_bits();
    bw.finish()
}

pub fn write_sps_rbsp(p: &StreamParams) -> Vec<u8> {
    let mut bw = BitWriter::new();
    bw.write_bits(u32::from(p.vps_id), 4);
    bw.write_bits(0, 3); // max_sub_layers_minus1
    bw.write_flag(true);
    write_ptl(&mut bw);
    bw.write_ue(u32::from(p.sps_id));
    bw.write_ue(1); // 4:2:0
    bw.write_ue(p.width);
    bw.write_ue(p.height);
    bw.write_flag(false); // conformance_window
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_ue(p.log2_max_poc_lsb_minus4);
    bw.write_flag(true); // sub_layer_ordering_info_present
    bw.write_ue(4);
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_ue(p.min_cb_log2 - 3);
    bw.write_ue(p.ctb_log2 - p.min_cb_log2);
    bw.write_ue(p.min_tb_log2 - 2);
    bw.write_ue(p.max_tb_log2 - p.min_tb_log2);
    bw.write_ue(0); // max_transform_hierarchy_depth_inter
    bw.write_ue(0); // max_transform_hierarchy_depth_intra
    bw.write_flag(false); // scaling_list
    bw.write_flag(false); // amp
    bw.write_flag(p.sao);
    bw.write_flag(false); // pcm
    bw.write_ue(0); // num_short_term_ref_pic_sets
    bw.write_flag(false); // long_term_ref_pics_present
    bw.write_flag(p.temporal_mvp);
    bw.write_flag(false); // strong_intra_smoothing
    bw.write_flag(false); // vui
    bw.write_flag(false); // extension
    bw.write_trailing_bits();
    bw.finish()
}

pub fn write_pps_rbsp(p: &StreamParams) -> Vec<u8> {
    let mut bw = BitWriter::new();
    bw.write_ue(u32::from(p.pps_id));
    bw.write_ue(u32::from(p.sps_id));
    bw.write_flag(p.dependent_slices);
    bw.write_flag(false); // output_flag_present
    bw.write_bits(0, 3);
    bw.write_flag(false); // sign_data_hiding
    bw.write_flag(false); // cabac_init_present
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_se(p.init_qp - 26);
    bw.write_flag(false); // constrained_intra_pred
    bw.write_flag(false); // transform_skip
    bw.write_flag(false); // cu_qp_delta
    bw.write_se(0);
    bw.write_se(0);
    bw.write_flag(false); // slice_chroma_qp_offsets_present
    bw.write_flag(false); // weighted_pred
    bw.write_flag(false); // weighted_bipred
    bw.write_flag(false); // transquant_bypass
    bw.write_flag(p.tiles_enabled());
    bw.write_flag(p.wpp);
    if p.tiles_enabled() {
        bw.write_ue(p.tile_columns - 1);
        bw.write_ue(p.tile_rows - 1);
        bw.write_flag(true); // uniform_spacing
        bw.write_flag(false); // loop_filter_across_tiles
    }
    bw.write_flag(false); // loop_filter_across_slices
    bw.write_flag(false); // deblocking_filter_control_present
    bw.write_flag(false); // scaling_list_data_present
    bw.write_flag(false); // lists_modification_present
    bw.write_ue(0); // log2_parallel_merge_level_minus2
    bw.write_flag(false); // slice_segment_header_extension_present
    bw.write_flag(false); // extension
    bw.write_trailing_bits();
    bw.finish()
}

/// 编码后重新解析得到的 VPS
pub fn build_vps(p: &StreamParams) -> Vps {
    let data = write_vps_rbsp(p);
    Vps::parse(&mut BitCursor::new_rbsp(&data)).expect("合成 VPS 应当可解析")
}

/// 编码后重新解析得到的 (SPS, PPS)
pub fn build_params(p: &StreamParams) -> (Sps, Pps) {
    let sps_data = write_sps_rbsp(p);
    let pps_data = write_pps_rbsp(p);
    let sps = Sps::parse(&mut BitCursor::new_rbsp(&sps_data)).expect("合成 SPS 应当可解析");
    let pps = Pps::parse(&mut BitCursor::new_rbsp(&pps_data)).expect("合成 PPS 应当可解析");
    (sps, pps)
}

/// 指定 id 的默认 PPS
pub fn default_pps(pps_id: u8, sps_id: u8) -> Pps {
    let p = StreamParams {
        pps_id,
        sps_id,
        ..StreamParams::default()
    };
    build_params(&p).1
}

/// sei_rbsp(): 单条消息
pub fn write_sei_rbsp(payload_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut bw = BitWriter::new();
    for v in [payload_type, payload.len() as u32] {
        let mut rest = v;
        while rest >= 0xFF {
            bw.write_bits(0xFF, 8);
            rest -= 0xFF;
        }
        bw.write_bits(rest, 8);
    }
    bw.write_bytes(payload);
    bw.write_trailing_bits();
    bw.finish()
}

// ============================================================
// 条带头写入
// ============================================================

fn ceil_log2(v: u32) -> u32 {
    if v <= 1 { 0 } else { 32 - (v - 1).leading_zeros() }
}

fn slice_type_id(t: SliceType) -> u32 {
    match t {
        SliceType::B => 0,
        SliceType::P => 1,
        SliceType::I => 2,
    }
}

/// 单个条带段头的取值
#[derive(Debug, Clone)]
struct HeaderFields<'a> {
    nal_type: NalUnitType,
    slice_type: SliceType,
    dependent: bool,
    address: u32,
    poc_lsb: u32,
    ref_deltas: &'a [i32],
    temporal_mvp: bool,
    /// 入口点偏移 (字节数, 不减 1)
    entry_points: &'a [usize],
}

fn write_slice_header(bw: &mut BitWriter, p: &StreamParams, sps: &Sps, h: &HeaderFields) {
    let first = h.address == 0;
    bw.write_flag(first);
    if h.nal_type.is_irap() {
        bw.write_flag(false); // no_output_of_prior_pics
    }
    bw.write_ue(u32::from(p.pps_id));
    if !first {
        if p.dependent_slices {
            bw.write_flag(h.dependent);
        }
        bw.write_bits(h.address, ceil_log2(sps.pic_size_in_ctbs()));
    }

    if !h.dependent {
        bw.write_ue(slice_type_id(h.slice_type));
        if !h.nal_type.is_idr() {
            bw.write_bits(h.poc_lsb, p.log2_max_poc_lsb_minus4 + 4);
            bw.write_flag(false); // short_term_ref_pic_set_sps_flag
            // st_ref_pic_set(num_short_term_ref_pic_sets), 只含负方向
            bw.write_ue(h.ref_deltas.len() as u32);
            bw.write_ue(0);
            let mut prev = 0i32;
            for &d in h.ref_deltas {
                bw.write_ue((prev - d - 1) as u32);
                bw.write_flag(true);
                prev = d;
            }
            if sps.temporal_mvp_enabled_flag {
                bw.write_flag(h.temporal_mvp);
            }
        }
        if sps.sample_adaptive_offset_enabled_flag {
            bw.write_flag(p.sao);
            bw.write_flag(p.sao);
        }
        if !h.slice_type.is_intra() {
            bw.write_flag(false); // num_ref_idx_active_override
            if h.slice_type.is_b() {
                bw.write_flag(false); // mvd_l1_zero
            }
            if h.temporal_mvp && h.slice_type.is_b() {
                bw.write_flag(true); // collocated_from_l0
            }
            bw.write_ue(0); // five_minus_max_num_merge_cand
        }
        bw.write_se(0); // slice_qp_delta
    }

    if p.tiles_enabled() || p.wpp {
        bw.write_ue(h.entry_points.len() as u32);
        if let Some(&max) = h.entry_points.iter().max() {
            let len = (32 - ((max - 1) as u32).leading_zeros()).max(1);
            bw.write_ue(len - 1);
            for &e in h.entry_points {
                bw.write_bits((e - 1) as u32, len);
            }
        }
    }

    // byte_alignment()
    bw.write_bit(1);
    bw.align_zero();
}

fn nal_header(nal_type: NalUnitType) -> [u8; 2] {
    [(nal_type.type_id() & 0x3F) << 1, 1]
}

/// 只含条带段头的 NAL (含 2 字节 NAL 头, 已转义, 无起始码)
pub fn write_slice_header_rbsp(
    p: &StreamParams,
    sps: &Sps,
    nal_type: NalUnitType,
    slice_type: SliceType,
    address: u32,
    poc_lsb: u32,
) -> Vec<u8> {
    let mut bw = BitWriter::new();
    bw.write_bytes(&nal_header(nal_type));
    write_slice_header(
        &mut bw,
        p,
        sps,
        &HeaderFields {
            nal_type,
            slice_type,
            dependent: false,
            address,
            poc_lsb,
            ref_deltas: &[],
            temporal_mvp: false,
            entry_points: &[],
        },
    );
    BitWriter::insert_emulation_prevention(&bw.finish())
}

// ============================================================
// 访问单元构造
// ============================================================

/// 每个 CTB 的编码形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuPattern {
    /// 整个 CTB 一个帧内 CU, 无残差
    Intra,
    /// 整个 CTB 一个帧内 CU, 亮度带一个 DC 系数
    IntraDc(i32),
    /// 划分到最小 CU, 每个 CU 帧内且亮度带 DC 系数
    SplitIntra(i32),
    /// 整个 CTB 一个跳过 CU (merge_idx 0), I 条带中退化为 Intra
    Skip,
}

/// 条带段起点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpec {
    /// 起始 CTB 的分块扫描地址
    pub first_ts: u32,
    pub dependent: bool,
}

/// 一幅图像
#[derive(Debug, Clone)]
pub struct PictureSpec {
    pub nal_type: NalUnitType,
    pub slice_type: SliceType,
    pub poc: i32,
    /// 短期参考 (负方向 delta POC, 递减)
    pub ref_deltas: Vec<i32>,
    pub temporal_mvp: bool,
    pub pattern: CuPattern,
    /// 按分块扫描序排列, 第一个必须从 0 开始
    pub segments: Vec<SegmentSpec>,
}

impl PictureSpec {
    pub fn idr() -> Self {
        Self {
            nal_type: NalUnitType::IdrWRadl,
            slice_type: SliceType::I,
            poc: 0,
            ref_deltas: Vec::new(),
            temporal_mvp: false,
            pattern: CuPattern::IntraDc(3),
            segments: vec![SegmentSpec {
                first_ts: 0,
                dependent: false,
            }],
        }
    }

    /// 参考前一幅图像的 P 图像
    pub fn trail_p(poc: i32) -> Self {
        Self {
            nal_type: NalUnitType::TrailR,
            slice_type: SliceType::P,
            poc,
            ref_deltas: vec![-1],
            pattern: CuPattern::Skip,
            ..Self::idr()
        }
    }

    pub fn pattern(mut self, pattern: CuPattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn temporal_mvp(mut self, on: bool) -> Self {
        self.temporal_mvp = on;
        self
    }

    /// 以给定分块扫描地址切分条带段
    pub fn segments(mut self, starts: &[(u32, bool)]) -> Self {
        self.segments = starts
            .iter()
            .map(|&(first_ts, dependent)| SegmentSpec { first_ts, dependent })
            .collect();
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CbInfo {
    coded: bool,
    depth: u8,
    skip: bool,
}

/// 一幅图像编码期间的邻块状态
struct PicState<'a> {
    layout: &'a PictureLayout,
    min_cb_log2: u32,
    w_cb: u32,
    cbs: Vec<CbInfo>,
    ctb_slice: Vec<Option<u32>>,
}

impl PicState<'_> {
    fn cb_index(&self, x: u32, y: u32) -> usize {
        ((y >> self.min_cb_log2) * self.w_cb + (x >> self.min_cb_log2)) as usize
    }

    /// 同条带, 同分块且已编码
    fn neighbour(&self, x: u32, y: u32, x_n: i32, y_n: i32) -> Option<CbInfo> {
        if !self.layout.contains(x_n, y_n) {
            return None;
        }
        let (xn, yn) = (x_n as u32, y_n as u32);
        let info = self.cbs[self.cb_index(xn, yn)];
        let ctb_n = self.layout.ctb_rs_at(xn, yn);
        let ctb_c = self.layout.ctb_rs_at(x, y);
        let same = self.ctb_slice[ctb_n as usize].is_some()
            && self.ctb_slice[ctb_n as usize] == self.ctb_slice[ctb_c as usize]
            && self.layout.tile_id_rs(ctb_n) == self.layout.tile_id_rs(ctb_c);
        (info.coded && same).then_some(info)
    }

    fn mark(&mut self, x: u32, y: u32, size: u32, depth: u8, skip: bool) {
        let step = 1u32 << self.min_cb_log2;
        let mut yy = y;
        while yy < y + size && yy < self.layout.pic_height {
            let mut xx = x;
            while xx < x + size && xx < self.layout.pic_width {
                let i = self.cb_index(xx, yy);
                self.cbs[i] = CbInfo {
                    coded: true,
                    depth,
                    skip,
                };
                xx += step;
            }
            yy += step;
        }
    }
}

/// Annex B 码流构造器
pub struct StreamBuilder {
    params: StreamParams,
    sps: Sps,
    pps: Pps,
    layout: PictureLayout,
    out: Vec<u8>,
}

impl StreamBuilder {
    pub fn new(params: StreamParams) -> Self {
        let (sps, pps) = build_params(&params);
        let layout = PictureLayout::new(&sps, &pps).expect("合成参数的图像布局应当合法");
        Self {
            params,
            sps,
            pps,
            layout,
            out: Vec::new(),
        }
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn layout(&self) -> &PictureLayout {
        &self.layout
    }

    /// 追加一个 NAL 单元 (起始码 + NAL 头 + 转义后的 RBSP)
    pub fn nal(&mut self, nal_type: NalUnitType, rbsp: &[u8]) -> &mut Self {
        self.out
            .extend(BitWriter::annex_b_nal(nal_type.type_id(), 1, rbsp));
        self
    }

    /// 追加 VPS, SPS, PPS
    pub fn parameter_sets(&mut self) -> &mut Self {
        let vps = write_vps_rbsp(&self.params);
        let sps = write_sps_rbsp(&self.params);
        let pps = write_pps_rbsp(&self.params);
        self.nal(NalUnitType::Vps, &vps)
            .nal(NalUnitType::Sps, &sps)
            .nal(NalUnitType::Pps, &pps)
    }

    /// 追加一幅图像的全部条带段 NAL
    pub fn picture(&mut self, pic: &PictureSpec) -> &mut Self {
        let nals = self.encode_picture(pic);
        for nal in nals {
            self.out.extend_from_slice(&[0, 0, 0, 1]);
            self.out.extend(nal);
        }
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.out
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    /// 编码一幅图像, 返回各条带段 NAL (已转义, 无起始码)
    pub fn encode_picture(&self, pic: &PictureSpec) -> Vec<Vec<u8>> {
        let layout = &self.layout;
        let sps = &self.sps;
        let num_ctbs = layout.num_ctbs();
        assert!(
            pic.segments.first().is_some_and(|s| s.first_ts == 0 && !s.dependent),
            "第一个条带段必须是从 0 开始的独立条带段"
        );

        let mut state = PicState {
            layout,
            min_cb_log2: sps.min_cb_log2,
            w_cb: sps.pic_width_in_luma_samples.div_ceil(1 << sps.min_cb_log2),
            cbs: vec![
                CbInfo::default();
                (sps.pic_width_in_luma_samples.div_ceil(1 << sps.min_cb_log2)
                    * sps.pic_height_in_luma_samples.div_ceil(1 << sps.min_cb_log2))
                    as usize
            ],
            ctb_slice: vec![None; num_ctbs as usize],
        };
        let slice_type = pic.slice_type;
        let pattern = match pic.pattern {
            CuPattern::Skip if slice_type.is_intra() => CuPattern::Intra,
            p => p,
        };
        let slice_qp = self.params.init_qp;
        let init_type = cabac::init_type(
            slice_type.is_intra(),
            slice_type == SliceType::P,
            false,
        );
        let max_lsb = 1i32 << (self.params.log2_max_poc_lsb_minus4 + 4);

        let mut wpp_store: Option<ContextTable> = None;
        let mut ds_store: Option<ContextTable> = None;
        let mut slice_addr_rs = 0u32;
        let mut nals = Vec::with_capacity(pic.segments.len());

        for (i, seg) in pic.segments.iter().enumerate() {
            let end_ts = pic.segments.get(i + 1).map_or(num_ctbs, |s| s.first_ts);
            assert!(seg.first_ts < end_ts, "条带段地址必须递增");
            let seg_rs = layout.ts_to_rs(seg.first_ts);
            if !seg.dependent {
                slice_addr_rs = seg_rs;
            }

            let mut enc = CabacEncoder::new();
            let mut boundaries = Vec::new();
            let mut ts = seg.first_ts;
            let init = |enc: &mut CabacEncoder,
                        ts: u32,
                        state: &PicState,
                        wpp_store: &Option<ContextTable>,
                        ds_store: &Option<ContextTable>| {
                let rs = layout.ts_to_rs(ts);
                let fresh = ContextTable::init(init_type, slice_qp);
                enc.contexts = if layout.is_tile_start(ts) {
                    fresh
                } else if self.params.wpp && layout.is_tile_row_start(rs) {
                    let size = 1i32 << layout.ctb_log2;
                    let x = ((rs % layout.width_ctbs) << layout.ctb_log2) as i32;
                    let y = ((rs / layout.width_ctbs) << layout.ctb_log2) as i32;
                    let top_right = state
                        .neighbour(x as u32, y as u32, x + size, y - size)
                        .is_some();
                    match wpp_store {
                        Some(s) if top_right => s.clone(),
                        _ => fresh,
                    }
                } else if seg.dependent && rs == seg_rs {
                    ds_store.clone().unwrap_or(fresh)
                } else {
                    fresh
                };
            };

            state.ctb_slice[seg_rs as usize] = Some(slice_addr_rs);
            init(&mut enc, ts, &state, &wpp_store, &ds_store);
            loop {
                let rs = layout.ts_to_rs(ts);
                state.ctb_slice[rs as usize] = Some(slice_addr_rs);
                self.encode_ctu(&mut enc, &mut state, rs, slice_addr_rs, slice_type, pattern);

                let last = ts + 1 == end_ts;
                enc.encode_terminate(u32::from(last));
                if self.params.wpp {
                    let (x0, ..) = layout.tile_rect(layout.tile_id(ts));
                    if rs % layout.width_ctbs == x0 + 1 {
                        wpp_store = Some(enc.contexts.clone());
                    }
                }
                ts += 1;
                if last {
                    if self.params.dependent_slices {
                        ds_store = Some(enc.contexts.clone());
                    }
                    break;
                }
                if layout.is_substream_start(ts, self.params.wpp) {
                    enc.encode_terminate(1);
                    boundaries.push(enc.byte_len());
                    state.ctb_slice[layout.ts_to_rs(ts) as usize] = Some(slice_addr_rs);
                    init(&mut enc, ts, &state, &wpp_store, &ds_store);
                }
            }

            let data = enc.finish();
            let mut substreams = Vec::with_capacity(boundaries.len() + 1);
            let mut start = 0;
            for &b in boundaries.iter().chain(std::iter::once(&data.len())) {
                substreams.push(BitWriter::insert_emulation_prevention(&data[start..b]));
                start = b;
            }
            let entry_points: Vec<usize> = substreams[..substreams.len() - 1]
                .iter()
                .map(Vec::len)
                .collect();

            let mut bw = BitWriter::new();
            bw.write_bytes(&nal_header(pic.nal_type));
            write_slice_header(
                &mut bw,
                &self.params,
                sps,
                &HeaderFields {
                    nal_type: pic.nal_type,
                    slice_type,
                    dependent: seg.dependent,
                    address: seg_rs,
                    poc_lsb: pic.poc.rem_euclid(max_lsb) as u32,
                    ref_deltas: &pic.ref_deltas,
                    temporal_mvp: pic.temporal_mvp,
                    entry_points: &entry_points,
                },
            );
            let mut nal = BitWriter::insert_emulation_prevention(&bw.finish());
            for s in substreams {
                nal.extend(s);
            }
            nals.push(nal);
        }
        nals
    }

    fn encode_ctu(
        &self,
        enc: &mut CabacEncoder,
        state: &mut PicState,
        rs: u32,
        slice_addr_rs: u32,
        slice_type: SliceType,
        pattern: CuPattern,
    ) {
        let layout = &self.layout;
        let w = layout.width_ctbs;
        let x = (rs % w) << layout.ctb_log2;
        let y = (rs / w) << layout.ctb_log2;

        if self.params.sao && self.sps.sample_adaptive_offset_enabled_flag {
            let tile = layout.tile_id_rs(rs);
            let same = |n: u32| {
                state.ctb_slice[n as usize] == Some(slice_addr_rs) && layout.tile_id_rs(n) == tile
            };
            if x > 0 && rs > slice_addr_rs && same(rs - 1) {
                enc.encode_decision(ctx::SAO_MERGE_FLAG, 0);
            }
            if y > 0 && rs >= w && rs - w >= slice_addr_rs && same(rs - w) {
                enc.encode_decision(ctx::SAO_MERGE_FLAG, 0);
            }
            // 亮度与色度 sao_type_idx = 0
            enc.encode_decision(ctx::SAO_TYPE_IDX, 0);
            enc.encode_decision(ctx::SAO_TYPE_IDX, 0);
        }

        self.coding_quadtree(enc, state, x, y, layout.ctb_log2, 0, slice_type, pattern);
    }

    #[allow(clippy::too_many_arguments)]
    fn coding_quadtree(
        &self,
        enc: &mut CabacEncoder,
        state: &mut PicState,
        x0: u32,
        y0: u32,
        log2: u32,
        depth: u32,
        slice_type: SliceType,
        pattern: CuPattern,
    ) {
        let sps = &self.sps;
        let size = 1u32 << log2;
        let want_split = matches!(pattern, CuPattern::SplitIntra(_)) && log2 > sps.min_cb_log2;
        let split = if x0 + size <= sps.pic_width_in_luma_samples
            && y0 + size <= sps.pic_height_in_luma_samples
            && log2 > sps.min_cb_log2
        {
            let mut inc = 0;
            for (xn, yn) in [(x0 as i32 - 1, y0 as i32), (x0 as i32, y0 as i32 - 1)] {
                if state
                    .neighbour(x0, y0, xn, yn)
                    .is_some_and(|n| u32::from(n.depth) > depth)
                {
                    inc += 1;
                }
            }
            enc.encode_decision(ctx::SPLIT_CU_FLAG + inc, u32::from(want_split));
            want_split
        } else {
            log2 > sps.min_cb_log2
        };

        if split {
            let half = size >> 1;
            for (dx, dy) in [(0, 0), (half, 0), (0, half), (half, half)] {
                let (x, y) = (x0 + dx, y0 + dy);
                if x < sps.pic_width_in_luma_samples && y < sps.pic_height_in_luma_samples {
                    self.coding_quadtree(enc, state, x, y, log2 - 1, depth + 1, slice_type, pattern);
                }
            }
            return;
        }
        self.coding_unit(enc, state, x0, y0, log2, depth, slice_type, pattern);
    }

    #[allow(clippy::too_many_arguments)]
    fn coding_unit(
        &self,
        enc: &mut CabacEncoder,
        state: &mut PicState,
        x0: u32,
        y0: u32,
        log2: u32,
        depth: u32,
        slice_type: SliceType,
        pattern: CuPattern,
    ) {
        let skip = pattern == CuPattern::Skip;
        if !slice_type.is_intra() {
            let mut inc = 0;
            for (xn, yn) in [(x0 as i32 - 1, y0 as i32), (x0 as i32, y0 as i32 - 1)] {
                if state.neighbour(x0, y0, xn, yn).is_some_and(|n| n.skip) {
                    inc += 1;
                }
            }
            enc.encode_decision(ctx::CU_SKIP_FLAG + inc, u32::from(skip));
        }
        state.mark(x0, y0, 1 << log2, depth as u8, skip);

        if skip {
            // merge_idx = 0 (MaxNumMergeCand = 5)
            enc.encode_decision(ctx::MERGE_IDX, 0);
            return;
        }
        if !slice_type.is_intra() {
            enc.encode_decision(ctx::PRED_MODE_FLAG, 1);
        }
        if log2 == self.sps.min_cb_log2 {
            enc.encode_decision(ctx::PART_MODE, 1);
        }
        // prev_intra_luma_pred_flag = 1, mpm_idx = 0
        enc.encode_decision(ctx::PREV_INTRA_LUMA_PRED_FLAG, 1);
        enc.encode_tu_bypass(0, 2);
        // intra_chroma_pred_mode = 4
        enc.encode_decision(ctx::INTRA_CHROMA_PRED_MODE, 0);

        let level = match pattern {
            CuPattern::IntraDc(l) | CuPattern::SplitIntra(l) => l,
            _ => 0,
        };
        self.transform_tree(enc, log2, 0, level);
    }

    fn transform_tree(&self, enc: &mut CabacEncoder, log2: u32, depth: u32, level: i32) {
        let sps = &self.sps;
        let split = log2 > sps.max_tb_log2;
        if log2 > 2 && depth == 0 {
            enc.encode_decision(ctx::CBF_CHROMA, 0);
            enc.encode_decision(ctx::CBF_CHROMA, 0);
        }
        if split {
            for _ in 0..4 {
                self.transform_tree(enc, log2 - 1, depth + 1, level);
            }
            return;
        }
        let inc = if depth == 0 { 1 } else { 0 };
        enc.encode_decision(ctx::CBF_LUMA + inc, u32::from(level != 0));
        if level != 0 {
            encode_dc_residual(enc, log2, level);
        }
    }
}

/// 只含 DC 系数的亮度 residual_coding()
fn encode_dc_residual(enc: &mut CabacEncoder, log2: u32, level: i32) {
    let offset = (3 * (log2 - 2) + ((log2 - 1) >> 2)) as usize;
    enc.encode_decision(ctx::LAST_SIG_COEFF_X_PREFIX + offset, 0);
    enc.encode_decision(ctx::LAST_SIG_COEFF_Y_PREFIX + offset, 0);

    let abs = level.unsigned_abs();
    let g1 = abs > 1;
    enc.encode_decision(ctx::COEFF_ABS_LEVEL_GREATER1_FLAG + 1, u32::from(g1));
    let mut g2 = false;
    if g1 {
        g2 = abs > 2;
        enc.encode_decision(ctx::COEFF_ABS_LEVEL_GREATER2_FLAG, u32::from(g2));
    }
    enc.encode_bypass(u32::from(level < 0));
    let base = 1 + u32::from(g1) + u32::from(g2);
    let threshold = if g1 { 3 } else { 2 };
    if base == threshold {
        encode_abs_level_remaining(enc, abs - base, 0);
    }
}

/// coeff_abs_level_remaining 二值化
fn encode_abs_level_remaining(enc: &mut CabacEncoder, value: u32, rice: u32) {
    if value < (3 << rice) {
        enc.encode_tu_bypass(value >> rice, u32::MAX);
        enc.encode_bypass_bins(value & ((1 << rice) - 1), rice);
        return;
    }
    let mut prefix = 3u32;
    while value >= ((1 << (prefix - 2)) + 2) << rice {
        prefix += 1;
    }
    for _ in 0..prefix {
        enc.encode_bypass(1);
    }
    enc.encode_bypass(0);
    let base = ((1u32 << (prefix - 3)) + 2) << rice;
    enc.encode_bypass_bins(value - base, prefix - 3 + rice);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_sets_reparse() {
        let p = StreamParams {
            sao: true,
            temporal_mvp: true,
            wpp: true,
            ..Default::default()
        };
        let (sps, pps) = build_params(&p);
        assert!(sps.sample_adaptive_offset_enabled_flag);
        assert!(sps.temporal_mvp_enabled_flag);
        assert!(pps.entropy_coding_sync_enabled_flag);
        assert_eq!(build_vps(&p).vps_id, 0);
    }

    #[test]
    fn test_picture_nal_per_segment() {
        let builder = StreamBuilder::new(StreamParams::default());
        let pic = PictureSpec::idr().segments(&[(0, false), (5, false)]);
        let nals = builder.encode_picture(&pic);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0][0] >> 1, 19);
    }
}
