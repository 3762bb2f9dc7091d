//! 条带段头 (slice_segment_header) 解析.
//!
//! 依赖条带段只携带地址和入口点, 其余字段复制自同一条带的独立条带段头.

use hevcbs_core::{BitCursor, BsError, BsResult};
use serde::Serialize;

use super::nal::NalUnitType;
use super::params::{Pps, ShortTermRps, Sps};
use super::refs::RefLists;

/// 条带类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum SliceType {
    B,
    P,
    #[default]
    I,
}

impl SliceType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::B),
            1 => Some(Self::P),
            2 => Some(Self::I),
            _ => None,
        }
    }

    pub fn is_intra(self) -> bool {
        self == Self::I
    }

    pub fn is_b(self) -> bool {
        self == Self::B
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::B => "B",
            Self::P => "P",
            Self::I => "I",
        }
    }
}

/// 条带头中的长期参考项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LongTermEntry {
    pub poc_lsb: u32,
    pub used_by_curr_pic: bool,
    pub delta_poc_msb_present: bool,
    /// 已累加的 DeltaPocMsbCycleLt
    pub delta_poc_msb_cycle: u32,
}

/// 单个参考的加权预测参数: [分量][权重, 偏移]
pub type WeightEntry = [[i32; 2]; 3];

/// pred_weight_table()
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u32,
    pub chroma_log2_weight_denom: u32,
    pub l0: Vec<WeightEntry>,
    pub l1: Vec<WeightEntry>,
}

/// 条带段头
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub pps_id: u32,
    pub dependent_slice_segment_flag: bool,
    pub slice_segment_address: u32,
    pub slice_reserved_flags: u32,
    pub slice_type: SliceType,
    pub pic_output_flag: bool,
    pub colour_plane_id: u8,
    pub pic_order_cnt_lsb: u32,
    pub short_term_ref_pic_set_sps_flag: bool,
    pub short_term_ref_pic_set_idx: u32,
    /// 生效的短期 RPS (来自 SPS 或条带头)
    pub st_rps: ShortTermRps,
    /// 条带头中显式 RPS 占用的位数
    pub st_rps_bits: u32,
    pub num_long_term_sps: u32,
    pub long_term: Vec<LongTermEntry>,
    pub temporal_mvp_enabled_flag: bool,
    pub sao_luma_flag: bool,
    pub sao_chroma_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active: u32,
    pub num_ref_idx_l1_active: u32,
    pub ref_pic_list_modification_flag_l0: bool,
    pub list_entry_l0: Vec<u32>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub list_entry_l1: Vec<u32>,
    pub mvd_l1_zero_flag: bool,
    pub cabac_init_flag: bool,
    pub collocated_from_l0_flag: bool,
    pub collocated_ref_idx: u32,
    pub pred_weight_table: Option<PredWeightTable>,
    pub max_num_merge_cand: u32,
    pub use_integer_mv_flag: bool,
    pub slice_qp_delta: i32,
    pub slice_cb_qp_offset: i32,
    pub slice_cr_qp_offset: i32,
    pub slice_act_y_qp_offset: i32,
    pub slice_act_cb_qp_offset: i32,
    pub slice_act_cr_qp_offset: i32,
    pub cu_chroma_qp_offset_enabled_flag: bool,
    pub deblocking_filter_override_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i32,
    pub tc_offset_div2: i32,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub offset_len_minus1: u32,
    pub entry_point_offset_minus1: Vec<u32>,
    pub extension_data: Vec<u8>,

    // ---- 推导量 ----
    /// SliceQpY
    pub slice_qp: i32,
    /// NumPicTotalCurr
    pub num_pic_total_curr: u32,
    /// 条带数据在转义后 NAL 数据中的起始字节 (含 2 字节 NAL 头)
    pub data_offset: usize,
    /// 头部解析期间提前构造的参考列表 (当前图像参考 + 加权预测时)
    pub early_ref_lists: Option<RefLists>,
}

/// 解析条带头所需的上下文
pub struct HeaderContext<'a> {
    pub nal_type: NalUnitType,
    pub sps: &'a Sps,
    pub pps: &'a Pps,
    /// 同一图像中最近的独立条带段头
    pub prev_independent: Option<&'a SliceHeader>,
}

fn ceil_log2(v: u32) -> u32 {
    if v <= 1 { 0 } else { 32 - (v - 1).leading_zeros() }
}

impl SliceHeader {
    /// 仅读取 first_slice_segment_in_pic_flag 与 pps id, 不消耗调用方游标
    pub fn peek_pps_id(bc: &BitCursor, nal_type: NalUnitType) -> BsResult<u32> {
        let mut probe = bc.clone();
        probe.get_flag()?;
        if nal_type.is_irap() {
            probe.get_flag()?;
        }
        probe.get_ue()
    }

    /// 解析条带段头.
    ///
    /// `resolve_refs` 仅在 PPS 开启当前图像参考且需要加权预测表时被调用,
    /// 此时参考列表必须在头部解析过程中构造.
    pub fn parse(
        bc: &mut BitCursor,
        ctx: &HeaderContext,
        resolve_refs: &mut dyn FnMut(&SliceHeader) -> BsResult<RefLists>,
    ) -> BsResult<Self> {
        let sps = ctx.sps;
        let pps = ctx.pps;

        let first = bc.get_flag()?;
        let no_output = if ctx.nal_type.is_irap() {
            bc.get_flag()?
        } else {
            false
        };
        let pps_id = bc.get_ue()?;
        if pps_id != u32::from(pps.pps_id) {
            return Err(BsError::Internal(format!(
                "条带 pps_id={} 与上下文 PPS {} 不符",
                pps_id, pps.pps_id
            )));
        }

        let mut dependent = false;
        let mut address = 0;
        if !first {
            if pps.dependent_slice_segments_enabled_flag {
                dependent = bc.get_flag()?;
            }
            address = bc.get_bits(ceil_log2(sps.pic_size_in_ctbs()))?;
            if address >= sps.pic_size_in_ctbs() {
                return Err(BsError::syntax(format!(
                    "slice_segment_address={} 超出图像 ({} CTB)",
                    address,
                    sps.pic_size_in_ctbs()
                )));
            }
        }

        let mut sh = if dependent {
            let prev = ctx
                .prev_independent
                .ok_or_else(|| BsError::syntax("依赖条带段之前没有独立条带段"))?;
            SliceHeader {
                entry_point_offset_minus1: Vec::new(),
                offset_len_minus1: 0,
                extension_data: Vec::new(),
                early_ref_lists: None,
                ..prev.clone()
            }
        } else {
            SliceHeader::default()
        };
        sh.first_slice_segment_in_pic_flag = first;
        sh.no_output_of_prior_pics_flag = no_output;
        sh.pps_id = pps_id;
        sh.dependent_slice_segment_flag = dependent;
        sh.slice_segment_address = address;

        if !dependent {
            sh.parse_independent_fields(bc, ctx, resolve_refs)?;
        }

        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            let num = bc.get_ue()?;
            if num > sps.pic_size_in_ctbs() {
                return Err(BsError::syntax(format!("num_entry_point_offsets={} 超出范围", num)));
            }
            if num > 0 {
                sh.offset_len_minus1 = bc.get_ue()?;
                if sh.offset_len_minus1 > 31 {
                    return Err(BsError::syntax("offset_len_minus1 超出范围"));
                }
                for _ in 0..num {
                    sh.entry_point_offset_minus1
                        .push(bc.get_bits(sh.offset_len_minus1 + 1)?);
                }
            }
        }

        if pps.slice_segment_header_extension_present_flag {
            let len = bc.get_ue()?;
            if len > 256 {
                return Err(BsError::syntax("slice_segment_header_extension_length 超出范围"));
            }
            sh.extension_data = bc.get_bytes(len as usize)?;
        }

        // byte_alignment()
        if bc.get_bit()? != 1 {
            return Err(BsError::syntax("条带头 byte_alignment 缺少起始位"));
        }
        bc.align_zero()?;
        sh.data_offset = bc.raw_byte_position();
        Ok(sh)
    }

    fn parse_independent_fields(
        &mut self,
        bc: &mut BitCursor,
        ctx: &HeaderContext,
        resolve_refs: &mut dyn FnMut(&SliceHeader) -> BsResult<RefLists>,
    ) -> BsResult<()> {
        let sps = ctx.sps;
        let pps = ctx.pps;

        if pps.num_extra_slice_header_bits > 0 {
            self.slice_reserved_flags = bc.get_bits(pps.num_extra_slice_header_bits)?;
        }
        let ty = bc.get_ue()?;
        self.slice_type = SliceType::from_u32(ty)
            .ok_or_else(|| BsError::syntax(format!("slice_type={} 非法", ty)))?;
        if ctx.nal_type.is_irap() && !self.slice_type.is_intra() && !pps.scc_ext.curr_pic_ref_enabled_flag {
            return Err(BsError::syntax("IRAP 图像中出现非 I 条带"));
        }
        self.pic_output_flag = if pps.output_flag_present_flag {
            bc.get_flag()?
        } else {
            true
        };
        if sps.separate_colour_plane_flag {
            self.colour_plane_id = bc.get_bits(2)? as u8;
        }

        if !ctx.nal_type.is_idr() {
            self.parse_rps_fields(bc, sps)?;
        }

        if sps.sample_adaptive_offset_enabled_flag {
            self.sao_luma_flag = bc.get_flag()?;
            if sps.chroma_array_type != 0 {
                self.sao_chroma_flag = bc.get_flag()?;
            }
        }

        self.collocated_from_l0_flag = true;
        self.max_num_merge_cand = 5;
        if !self.slice_type.is_intra() {
            self.parse_inter_fields(bc, ctx, resolve_refs)?;
        }

        self.slice_qp_delta = bc.get_se()?;
        self.slice_qp = pps.init_qp() + self.slice_qp_delta;
        if !(-sps.qp_bd_offset_y..=51).contains(&self.slice_qp) {
            return Err(BsError::syntax(format!("SliceQpY={} 超出范围", self.slice_qp)));
        }
        if pps.slice_chroma_qp_offsets_present_flag {
            self.slice_cb_qp_offset = bc.get_se()?;
            self.slice_cr_qp_offset = bc.get_se()?;
        }
        if pps.scc_ext.slice_act_qp_offsets_present_flag {
            self.slice_act_y_qp_offset = bc.get_se()?;
            self.slice_act_cb_qp_offset = bc.get_se()?;
            self.slice_act_cr_qp_offset = bc.get_se()?;
        }
        if pps.range_ext.chroma_qp_offset_list_enabled_flag {
            self.cu_chroma_qp_offset_enabled_flag = bc.get_flag()?;
        }

        if pps.deblocking_filter_override_enabled_flag {
            self.deblocking_filter_override_flag = bc.get_flag()?;
        }
        if self.deblocking_filter_override_flag {
            self.deblocking_filter_disabled_flag = bc.get_flag()?;
            if !self.deblocking_filter_disabled_flag {
                self.beta_offset_div2 = bc.get_se()?;
                self.tc_offset_div2 = bc.get_se()?;
            }
        } else {
            self.deblocking_filter_disabled_flag = pps.deblocking_filter_disabled_flag;
            self.beta_offset_div2 = pps.beta_offset_div2;
            self.tc_offset_div2 = pps.tc_offset_div2;
        }

        self.loop_filter_across_slices_enabled_flag = pps.loop_filter_across_slices_enabled_flag;
        if pps.loop_filter_across_slices_enabled_flag
            && (self.sao_luma_flag || self.sao_chroma_flag || !self.deblocking_filter_disabled_flag)
        {
            self.loop_filter_across_slices_enabled_flag = bc.get_flag()?;
        }
        Ok(())
    }

    fn parse_rps_fields(&mut self, bc: &mut BitCursor, sps: &Sps) -> BsResult<()> {
        self.pic_order_cnt_lsb = bc.get_bits(sps.log2_max_pic_order_cnt_lsb_minus4 + 4)?;
        self.short_term_ref_pic_set_sps_flag = bc.get_flag()?;
        let num_sets = sps.short_term_rps.len();
        if !self.short_term_ref_pic_set_sps_flag {
            let rps = ShortTermRps::parse(bc, num_sets, num_sets, &sps.short_term_rps)?;
            self.st_rps_bits = rps.bits;
            self.st_rps = rps;
        } else {
            if num_sets == 0 {
                return Err(BsError::syntax("SPS 中没有可选的短期 RPS"));
            }
            if num_sets > 1 {
                self.short_term_ref_pic_set_idx = bc.get_bits(ceil_log2(num_sets as u32))?;
            }
            self.st_rps = sps
                .short_term_rps
                .get(self.short_term_ref_pic_set_idx as usize)
                .cloned()
                .ok_or_else(|| BsError::syntax("short_term_ref_pic_set_idx 越界"))?;
        }

        if sps.long_term_ref_pics_present_flag {
            let num_candidates = sps.lt_ref_candidates.len() as u32;
            if num_candidates > 0 {
                self.num_long_term_sps = bc.get_ue()?;
                if self.num_long_term_sps > num_candidates {
                    return Err(BsError::syntax("num_long_term_sps 超出范围"));
                }
            }
            let num_long_term_pics = bc.get_ue()?;
            let total = self.num_long_term_sps + num_long_term_pics;
            if total > 32 {
                return Err(BsError::syntax("长期参考数量超出范围"));
            }
            for i in 0..total {
                let mut entry = LongTermEntry::default();
                if i < self.num_long_term_sps {
                    let idx = if num_candidates > 1 {
                        bc.get_bits(ceil_log2(num_candidates))?
                    } else {
                        0
                    };
                    let cand = sps
                        .lt_ref_candidates
                        .get(idx as usize)
                        .ok_or_else(|| BsError::syntax("lt_idx_sps 越界"))?;
                    entry.poc_lsb = cand.poc_lsb;
                    entry.used_by_curr_pic = cand.used_by_curr_pic;
                } else {
                    entry.poc_lsb = bc.get_bits(sps.log2_max_pic_order_cnt_lsb_minus4 + 4)?;
                    entry.used_by_curr_pic = bc.get_flag()?;
                }
                entry.delta_poc_msb_present = bc.get_flag()?;
                if entry.delta_poc_msb_present {
                    entry.delta_poc_msb_cycle = bc.get_ue()?;
                }
                // DeltaPocMsbCycleLt 在 SPS 候选段与显式段内部各自累加
                if i != 0 && i != self.num_long_term_sps {
                    let prev = self.long_term[i as usize - 1].delta_poc_msb_cycle;
                    entry.delta_poc_msb_cycle = entry.delta_poc_msb_cycle.wrapping_add(prev);
                }
                self.long_term.push(entry);
            }
        }

        if sps.temporal_mvp_enabled_flag {
            self.temporal_mvp_enabled_flag = bc.get_flag()?;
        }
        Ok(())
    }

    fn parse_inter_fields(
        &mut self,
        bc: &mut BitCursor,
        ctx: &HeaderContext,
        resolve_refs: &mut dyn FnMut(&SliceHeader) -> BsResult<RefLists>,
    ) -> BsResult<()> {
        let sps = ctx.sps;
        let pps = ctx.pps;
        let is_b = self.slice_type.is_b();

        self.num_ref_idx_active_override_flag = bc.get_flag()?;
        if self.num_ref_idx_active_override_flag {
            self.num_ref_idx_l0_active = bc.get_ue()? + 1;
            if is_b {
                self.num_ref_idx_l1_active = bc.get_ue()? + 1;
            }
        } else {
            self.num_ref_idx_l0_active = pps.num_ref_idx_l0_default_active_minus1 + 1;
            if is_b {
                self.num_ref_idx_l1_active = pps.num_ref_idx_l1_default_active_minus1 + 1;
            }
        }
        if self.num_ref_idx_l0_active > 15 || self.num_ref_idx_l1_active > 15 {
            return Err(BsError::syntax("num_ref_idx_active 超出范围"));
        }

        self.num_pic_total_curr = self.st_rps.num_used() as u32
            + self.long_term.iter().filter(|e| e.used_by_curr_pic).count() as u32
            + u32::from(pps.scc_ext.curr_pic_ref_enabled_flag);

        if pps.lists_modification_present_flag && self.num_pic_total_curr > 1 {
            let bits = ceil_log2(self.num_pic_total_curr);
            self.ref_pic_list_modification_flag_l0 = bc.get_flag()?;
            if self.ref_pic_list_modification_flag_l0 {
                for _ in 0..self.num_ref_idx_l0_active {
                    self.list_entry_l0.push(bc.get_bits(bits)?);
                }
            }
            if is_b {
                self.ref_pic_list_modification_flag_l1 = bc.get_flag()?;
                if self.ref_pic_list_modification_flag_l1 {
                    for _ in 0..self.num_ref_idx_l1_active {
                        self.list_entry_l1.push(bc.get_bits(bits)?);
                    }
                }
            }
        }

        if is_b {
            self.mvd_l1_zero_flag = bc.get_flag()?;
        }
        if pps.cabac_init_present_flag {
            self.cabac_init_flag = bc.get_flag()?;
        }

        if self.temporal_mvp_enabled_flag {
            if is_b {
                self.collocated_from_l0_flag = bc.get_flag()?;
            }
            let active = if self.collocated_from_l0_flag {
                self.num_ref_idx_l0_active
            } else {
                self.num_ref_idx_l1_active
            };
            if active > 1 {
                self.collocated_ref_idx = bc.get_ue()?;
                if self.collocated_ref_idx >= active {
                    return Err(BsError::syntax("collocated_ref_idx 越界"));
                }
            }
        }

        if (pps.weighted_pred_flag && self.slice_type == SliceType::P)
            || (pps.weighted_bipred_flag && is_b)
        {
            let lists = if pps.scc_ext.curr_pic_ref_enabled_flag {
                let lists = resolve_refs(self)?;
                self.early_ref_lists = Some(lists.clone());
                Some(lists)
            } else {
                None
            };
            self.pred_weight_table = Some(self.parse_pred_weight_table(bc, sps, lists.as_ref())?);
        }

        let five_minus = bc.get_ue()?;
        if five_minus > 4 {
            return Err(BsError::syntax("five_minus_max_num_merge_cand 超出范围"));
        }
        self.max_num_merge_cand = 5 - five_minus;

        self.use_integer_mv_flag = match sps.scc_ext.motion_vector_resolution_control_idc {
            2 => bc.get_flag()?,
            idc => idc != 0,
        };
        Ok(())
    }

    fn parse_pred_weight_table(
        &self,
        bc: &mut BitCursor,
        sps: &Sps,
        lists: Option<&RefLists>,
    ) -> BsResult<PredWeightTable> {
        let mut pwt = PredWeightTable {
            luma_log2_weight_denom: bc.get_ue()?,
            ..Default::default()
        };
        if pwt.luma_log2_weight_denom > 7 {
            return Err(BsError::syntax("luma_log2_weight_denom 超出范围"));
        }
        let has_chroma = sps.chroma_array_type != 0;
        if has_chroma {
            let denom = pwt.luma_log2_weight_denom as i32 + bc.get_se()?;
            if !(0..=7).contains(&denom) {
                return Err(BsError::syntax("ChromaLog2WeightDenom 超出范围"));
            }
            pwt.chroma_log2_weight_denom = denom as u32;
        }
        let half_range_c: i32 = 1
            << if sps.range_ext.high_precision_offsets_enabled_flag {
                sps.bit_depth_c - 1
            } else {
                7
            };

        let lists_count = if self.slice_type.is_b() { 2 } else { 1 };
        for l in 0..lists_count {
            let count = if l == 0 {
                self.num_ref_idx_l0_active
            } else {
                self.num_ref_idx_l1_active
            } as usize;
            // 指向当前图像本身的参考项不携带权重
            let is_current = |i: usize| {
                lists
                    .and_then(|r| if l == 0 { r.l0.get(i) } else { r.l1.get(i) })
                    .is_some_and(|p| p.current)
            };

            let mut luma_flags = vec![false; count];
            for (i, flag) in luma_flags.iter_mut().enumerate() {
                if !is_current(i) {
                    *flag = bc.get_flag()?;
                }
            }
            let mut chroma_flags = vec![false; count];
            if has_chroma {
                for (i, flag) in chroma_flags.iter_mut().enumerate() {
                    if !is_current(i) {
                        *flag = bc.get_flag()?;
                    }
                }
            }

            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                let mut e: WeightEntry = [
                    [1 << pwt.luma_log2_weight_denom, 0],
                    [1 << pwt.chroma_log2_weight_denom, 0],
                    [1 << pwt.chroma_log2_weight_denom, 0],
                ];
                if luma_flags[i] {
                    e[0][0] += bc.get_se()?;
                    e[0][1] = bc.get_se()?;
                }
                if chroma_flags[i] {
                    for c in &mut e[1..] {
                        c[0] += bc.get_se()?;
                        let delta_offset = bc.get_se()?;
                        c[1] = (half_range_c + delta_offset
                            - ((half_range_c * c[0]) >> pwt.chroma_log2_weight_denom))
                            .clamp(-half_range_c, half_range_c - 1);
                    }
                }
                entries.push(e);
            }
            if l == 0 {
                pwt.l0 = entries;
            } else {
                pwt.l1 = entries;
            }
        }
        Ok(pwt)
    }

    /// 条带内 CTB 的起始地址 (独立条带段的地址)
    pub fn is_independent(&self) -> bool {
        !self.dependent_slice_segment_flag
    }

    /// 入口点数量
    pub fn num_entry_points(&self) -> usize {
        self.entry_point_offset_minus1.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{StreamParams, build_params, write_slice_header_rbsp};

    fn no_refs(_: &SliceHeader) -> BsResult<RefLists> {
        Err(BsError::Internal("不应调用".into()))
    }

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(12), 4);
        assert_eq!(ceil_log2(16), 4);
    }

    #[test]
    fn test_idr_slice_header() {
        let params = StreamParams::default();
        let (sps, pps) = build_params(&params);
        let data = write_slice_header_rbsp(&params, &sps, NalUnitType::IdrWRadl, SliceType::I, 0, 0);
        let mut bc = BitCursor::new(&data);
        bc.skip_bits(16).unwrap();
        let ctx = HeaderContext {
            nal_type: NalUnitType::IdrWRadl,
            sps: &sps,
            pps: &pps,
            prev_independent: None,
        };
        let sh = SliceHeader::parse(&mut bc, &ctx, &mut no_refs).unwrap();
        assert!(sh.first_slice_segment_in_pic_flag);
        assert_eq!(sh.slice_type, SliceType::I);
        assert_eq!(sh.slice_qp, pps.init_qp());
        assert_eq!(sh.max_num_merge_cand, 5);
        assert!(sh.collocated_from_l0_flag);
        assert_eq!(sh.data_offset, data.len());
    }

    #[test]
    fn test_dependent_requires_independent() {
        let params = StreamParams {
            dependent_slices: true,
            ..StreamParams::default()
        };
        let (sps, pps) = build_params(&params);
        let mut bw = hevcbs_core::bitwriter::BitWriter::new();
        bw.write_flag(false); // first_slice_segment_in_pic_flag
        bw.write_ue(0); // pps id
        bw.write_flag(true); // dependent_slice_segment_flag
        bw.write_bits(1, ceil_log2(sps.pic_size_in_ctbs()));
        bw.write_trailing_bits();
        let data = bw.finish();
        let ctx = HeaderContext {
            nal_type: NalUnitType::TrailR,
            sps: &sps,
            pps: &pps,
            prev_independent: None,
        };
        let mut bc = BitCursor::new_rbsp(&data);
        assert!(SliceHeader::parse(&mut bc, &ctx, &mut no_refs).is_err());

        let prev = SliceHeader {
            slice_type: SliceType::P,
            slice_qp: 30,
            ..Default::default()
        };
        let ctx = HeaderContext {
            prev_independent: Some(&prev),
            ..ctx
        };
        let mut bc = BitCursor::new_rbsp(&data);
        let sh = SliceHeader::parse(&mut bc, &ctx, &mut no_refs).unwrap();
        assert!(sh.dependent_slice_segment_flag);
        assert_eq!(sh.slice_segment_address, 1);
        assert_eq!(sh.slice_type, SliceType::P);
        assert_eq!(sh.slice_qp, 30);
    }
}
