//! 参数集共用语法结构.
//!
//! profile_tier_level, hrd_parameters, 子层排序信息, scaling_list_data,
//! st_ref_pic_set 与 vui_parameters.

use hevcbs_core::{BitCursor, BsError, BsResult};

// ============================================================
// profile_tier_level
// ============================================================

/// 单个层级的 profile 信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileInfo {
    pub profile_space: u8,
    pub tier_flag: bool,
    pub profile_idc: u8,
    pub compatibility_flags: u32,
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub non_packed_constraint_flag: bool,
    pub frame_only_constraint_flag: bool,
    /// 其余 44 位约束标志 (高位在前)
    pub constraint_flags: u64,
}

impl ProfileInfo {
    fn parse(bc: &mut BitCursor) -> BsResult<Self> {
        let profile_space = bc.get_bits(2)? as u8;
        let tier_flag = bc.get_flag()?;
        let profile_idc = bc.get_bits(5)? as u8;
        let compatibility_flags = bc.get_bits(32)?;
        let progressive_source_flag = bc.get_flag()?;
        let interlaced_source_flag = bc.get_flag()?;
        let non_packed_constraint_flag = bc.get_flag()?;
        let frame_only_constraint_flag = bc.get_flag()?;
        let hi = u64::from(bc.get_bits(32)?);
        let lo = u64::from(bc.get_bits(12)?);
        Ok(Self {
            profile_space,
            tier_flag,
            profile_idc,
            compatibility_flags,
            progressive_source_flag,
            interlaced_source_flag,
            non_packed_constraint_flag,
            frame_only_constraint_flag,
            constraint_flags: (hi << 12) | lo,
        })
    }
}

/// 子层 profile/level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubLayerPtl {
    pub profile: Option<ProfileInfo>,
    pub level_idc: Option<u8>,
}

/// profile_tier_level()
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub general: ProfileInfo,
    pub general_level_idc: u8,
    pub sub_layers: Vec<SubLayerPtl>,
}

impl ProfileTierLevel {
    /// 解析 profile_tier_level(1, max_sub_layers_minus1)
    pub fn parse(bc: &mut BitCursor, max_sub_layers_minus1: u32) -> BsResult<Self> {
        let general = ProfileInfo::parse(bc)?;
        let general_level_idc = bc.get_bits(8)? as u8;

        let n = max_sub_layers_minus1 as usize;
        let mut present = Vec::with_capacity(n);
        for _ in 0..n {
            let profile_present = bc.get_flag()?;
            let level_present = bc.get_flag()?;
            present.push((profile_present, level_present));
        }
        if n > 0 {
            // reserved_zero_2bits 对齐到 8 个子层
            for _ in n..8 {
                bc.get_bits(2)?;
            }
        }

        let mut sub_layers = Vec::with_capacity(n);
        for (profile_present, level_present) in present {
            let profile = if profile_present {
                Some(ProfileInfo::parse(bc)?)
            } else {
                None
            };
            let level_idc = if level_present {
                Some(bc.get_bits(8)? as u8)
            } else {
                None
            };
            sub_layers.push(SubLayerPtl { profile, level_idc });
        }

        Ok(Self {
            general,
            general_level_idc,
            sub_layers,
        })
    }
}

// ============================================================
// 子层排序信息
// ============================================================

/// sub_layer_ordering_info 中的一项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubLayerOrdering {
    pub max_dec_pic_buffering_minus1: u32,
    pub max_num_reorder_pics: u32,
    pub max_latency_increase_plus1: u32,
}

/// 解析子层排序信息, 未显式给出的低层复制最高层的值
pub fn parse_sub_layer_ordering(
    bc: &mut BitCursor,
    present: bool,
    max_sub_layers_minus1: u32,
) -> BsResult<Vec<SubLayerOrdering>> {
    let count = max_sub_layers_minus1 as usize + 1;
    let start = if present { 0 } else { count - 1 };
    let mut out = vec![SubLayerOrdering::default(); count];
    for item in out.iter_mut().skip(start) {
        item.max_dec_pic_buffering_minus1 = bc.get_ue()?;
        item.max_num_reorder_pics = bc.get_ue()?;
        item.max_latency_increase_plus1 = bc.get_ue()?;
    }
    if !present {
        let last = out[count - 1];
        out.iter_mut().for_each(|o| *o = last);
    }
    Ok(out)
}

// ============================================================
// hrd_parameters
// ============================================================

/// 单个 CPB 的码率参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpbSpec {
    pub bit_rate_value_minus1: u32,
    pub cpb_size_value_minus1: u32,
    pub cpb_size_du_value_minus1: u32,
    pub bit_rate_du_value_minus1: u32,
    pub cbr_flag: bool,
}

/// 子层 HRD 参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubLayerHrd {
    pub fixed_pic_rate_general_flag: bool,
    pub fixed_pic_rate_within_cvs_flag: bool,
    pub elemental_duration_in_tc_minus1: u32,
    pub low_delay_hrd_flag: bool,
    pub cpb_cnt_minus1: u32,
    pub nal: Vec<CpbSpec>,
    pub vcl: Vec<CpbSpec>,
}

/// hrd_parameters()
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HrdParameters {
    pub nal_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters_present_flag: bool,
    pub sub_pic_hrd_params_present_flag: bool,
    pub tick_divisor_minus2: u8,
    pub du_cpb_removal_delay_increment_length_minus1: u8,
    pub sub_pic_cpb_params_in_pic_timing_sei_flag: bool,
    pub dpb_output_delay_du_length_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub cpb_size_du_scale: u8,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub au_cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub sub_layers: Vec<SubLayerHrd>,
}

impl Default for HrdParameters {
    fn default() -> Self {
        Self {
            nal_hrd_parameters_present_flag: false,
            vcl_hrd_parameters_present_flag: false,
            sub_pic_hrd_params_present_flag: false,
            tick_divisor_minus2: 0,
            du_cpb_removal_delay_increment_length_minus1: 0,
            sub_pic_cpb_params_in_pic_timing_sei_flag: false,
            dpb_output_delay_du_length_minus1: 0,
            bit_rate_scale: 0,
            cpb_size_scale: 0,
            cpb_size_du_scale: 0,
            initial_cpb_removal_delay_length_minus1: 23,
            au_cpb_removal_delay_length_minus1: 23,
            dpb_output_delay_length_minus1: 23,
            sub_layers: Vec::new(),
        }
    }
}

impl HrdParameters {
    /// 解析 hrd_parameters(commonInfPresentFlag, maxNumSubLayersMinus1).
    ///
    /// `common_inf_present` 为假时公共部分取自 `inherit` (VPS 中的前一组).
    pub fn parse(
        bc: &mut BitCursor,
        common_inf_present: bool,
        max_sub_layers_minus1: u32,
        inherit: Option<&HrdParameters>,
    ) -> BsResult<Self> {
        let mut hrd = match inherit {
            Some(prev) if !common_inf_present => HrdParameters {
                sub_layers: Vec::new(),
                ..prev.clone()
            },
            _ => HrdParameters::default(),
        };

        if common_inf_present {
            hrd.nal_hrd_parameters_present_flag = bc.get_flag()?;
            hrd.vcl_hrd_parameters_present_flag = bc.get_flag()?;
            if hrd.nal_hrd_parameters_present_flag || hrd.vcl_hrd_parameters_present_flag {
                hrd.sub_pic_hrd_params_present_flag = bc.get_flag()?;
                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.tick_divisor_minus2 = bc.get_bits(8)? as u8;
                    hrd.du_cpb_removal_delay_increment_length_minus1 = bc.get_bits(5)? as u8;
                    hrd.sub_pic_cpb_params_in_pic_timing_sei_flag = bc.get_flag()?;
                    hrd.dpb_output_delay_du_length_minus1 = bc.get_bits(5)? as u8;
                }
                hrd.bit_rate_scale = bc.get_bits(4)? as u8;
                hrd.cpb_size_scale = bc.get_bits(4)? as u8;
                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.cpb_size_du_scale = bc.get_bits(4)? as u8;
                }
                hrd.initial_cpb_removal_delay_length_minus1 = bc.get_bits(5)? as u8;
                hrd.au_cpb_removal_delay_length_minus1 = bc.get_bits(5)? as u8;
                hrd.dpb_output_delay_length_minus1 = bc.get_bits(5)? as u8;
            }
        }

        for _ in 0..=max_sub_layers_minus1 {
            let mut sl = SubLayerHrd {
                fixed_pic_rate_general_flag: bc.get_flag()?,
                ..Default::default()
            };
            sl.fixed_pic_rate_within_cvs_flag = if sl.fixed_pic_rate_general_flag {
                true
            } else {
                bc.get_flag()?
            };
            if sl.fixed_pic_rate_within_cvs_flag {
                sl.elemental_duration_in_tc_minus1 = bc.get_ue()?;
            } else {
                sl.low_delay_hrd_flag = bc.get_flag()?;
            }
            if !sl.low_delay_hrd_flag {
                sl.cpb_cnt_minus1 = bc.get_ue()?;
                if sl.cpb_cnt_minus1 > 31 {
                    return Err(BsError::syntax(format!(
                        "cpb_cnt_minus1={} 超出范围",
                        sl.cpb_cnt_minus1
                    )));
                }
            }
            if hrd.nal_hrd_parameters_present_flag {
                sl.nal = parse_sub_layer_hrd(bc, sl.cpb_cnt_minus1, hrd.sub_pic_hrd_params_present_flag)?;
            }
            if hrd.vcl_hrd_parameters_present_flag {
                sl.vcl = parse_sub_layer_hrd(bc, sl.cpb_cnt_minus1, hrd.sub_pic_hrd_params_present_flag)?;
            }
            hrd.sub_layers.push(sl);
        }
        Ok(hrd)
    }

    /// 最低子层的 CPB 数量
    pub fn cpb_cnt(&self) -> usize {
        self.sub_layers
            .first()
            .map_or(1, |sl| sl.cpb_cnt_minus1 as usize + 1)
    }
}

fn parse_sub_layer_hrd(
    bc: &mut BitCursor,
    cpb_cnt_minus1: u32,
    sub_pic: bool,
) -> BsResult<Vec<CpbSpec>> {
    let mut out = Vec::with_capacity(cpb_cnt_minus1 as usize + 1);
    for _ in 0..=cpb_cnt_minus1 {
        let mut spec = CpbSpec {
            bit_rate_value_minus1: bc.get_ue()?,
            cpb_size_value_minus1: bc.get_ue()?,
            ..Default::default()
        };
        if sub_pic {
            spec.cpb_size_du_value_minus1 = bc.get_ue()?;
            spec.bit_rate_du_value_minus1 = bc.get_ue()?;
        }
        spec.cbr_flag = bc.get_flag()?;
        out.push(spec);
    }
    Ok(out)
}

// ============================================================
// scaling_list_data
// ============================================================

/// 默认 8x8 帧内量化矩阵 (对角扫描顺序)
const DEFAULT_INTRA_8X8: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 16, 17, 16, 17, 18, 17, 18, 18, 17, 18, 21, 19, 20,
    21, 20, 19, 21, 24, 22, 22, 24, 24, 22, 22, 24, 25, 25, 27, 30, 27, 25, 25, 29, 31, 35, 35, 31,
    29, 36, 41, 44, 41, 36, 47, 54, 54, 47, 65, 70, 65, 88, 88, 115,
];

/// 默认 8x8 帧间量化矩阵 (对角扫描顺序)
const DEFAULT_INTER_8X8: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 17, 17, 17, 17, 18, 18, 18, 18, 18, 18, 20, 20, 20,
    20, 20, 20, 20, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 28, 28, 28, 28, 28,
    28, 33, 33, 33, 33, 33, 41, 41, 41, 41, 54, 54, 54, 71, 71, 91,
];

/// 量化矩阵 (按 sizeId / matrixId 存放扫描顺序系数)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingList {
    /// coeffs[sizeId][matrixId], sizeId 0 只使用前 16 项
    pub coeffs: [[[u8; 64]; 6]; 4],
    /// DC 系数, 仅 sizeId 2/3 有意义
    pub dc: [[u8; 6]; 4],
}

impl Default for ScalingList {
    fn default() -> Self {
        let mut sl = Self {
            coeffs: [[[16; 64]; 6]; 4],
            dc: [[16; 6]; 4],
        };
        for size_id in 1..4 {
            for matrix_id in 0..6 {
                sl.coeffs[size_id][matrix_id] = default_list(size_id, matrix_id);
            }
        }
        sl
    }
}

fn default_list(size_id: usize, matrix_id: usize) -> [u8; 64] {
    if size_id == 0 {
        [16; 64]
    } else if matrix_id < 3 {
        DEFAULT_INTRA_8X8
    } else {
        DEFAULT_INTER_8X8
    }
}

impl ScalingList {
    /// 解析 scaling_list_data()
    pub fn parse(bc: &mut BitCursor) -> BsResult<Self> {
        let mut sl = Self::default();
        for size_id in 0..4usize {
            let step = if size_id == 3 { 3 } else { 1 };
            let num = 64.min(1usize << (4 + (size_id << 1)));
            let mut matrix_id = 0usize;
            while matrix_id < 6 {
                let pred_mode_flag = bc.get_flag()?;
                if !pred_mode_flag {
                    let delta = bc.get_ue()? as usize * step;
                    if delta > matrix_id {
                        return Err(BsError::syntax(format!(
                            "scaling_list_pred_matrix_id_delta 越界: sizeId={} matrixId={}",
                            size_id, matrix_id
                        )));
                    }
                    if delta == 0 {
                        sl.coeffs[size_id][matrix_id] = default_list(size_id, matrix_id);
                        sl.dc[size_id][matrix_id] = 16;
                    } else {
                        let ref_id = matrix_id - delta;
                        sl.coeffs[size_id][matrix_id] = sl.coeffs[size_id][ref_id];
                        sl.dc[size_id][matrix_id] = sl.dc[size_id][ref_id];
                    }
                } else {
                    let mut next = 8i32;
                    if size_id > 1 {
                        let dc = bc.get_se()?;
                        if !(-7..=247).contains(&dc) {
                            return Err(BsError::syntax("scaling_list_dc_coef_minus8 越界"));
                        }
                        next = dc + 8;
                        sl.dc[size_id][matrix_id] = next as u8;
                    }
                    for i in 0..num {
                        let delta = bc.get_se()?;
                        next = (next + delta + 256).rem_euclid(256);
                        sl.coeffs[size_id][matrix_id][i] = next as u8;
                    }
                    if size_id <= 1 {
                        sl.dc[size_id][matrix_id] = sl.coeffs[size_id][matrix_id][0];
                    }
                }
                matrix_id += step;
            }
        }
        // 32x32 色度矩阵 (仅 4:4:4 使用) 沿用 16x16
        for matrix_id in [1, 2, 4, 5] {
            sl.coeffs[3][matrix_id] = sl.coeffs[2][matrix_id];
            sl.dc[3][matrix_id] = sl.dc[2][matrix_id];
        }
        Ok(sl)
    }
}

// ============================================================
// st_ref_pic_set
// ============================================================

/// 短期参考图像集中的一项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpsEntry {
    /// 与当前图像的 POC 差
    pub delta_poc: i32,
    /// used_by_curr_pic
    pub used: bool,
}

/// st_ref_pic_set()
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShortTermRps {
    pub inter_ref_pic_set_prediction_flag: bool,
    pub delta_idx_minus1: u32,
    pub delta_rps: i32,
    /// 负方向 (按 delta_poc 递减)
    pub negative: Vec<RpsEntry>,
    /// 正方向 (按 delta_poc 递增)
    pub positive: Vec<RpsEntry>,
    /// 语法元素占用的位数 (条带头中显式携带时有意义)
    pub bits: u32,
}

/// 单个方向的参考图像上限
const MAX_RPS_PICS: u32 = 16;

impl ShortTermRps {
    /// NumDeltaPocs
    pub fn num_delta_pocs(&self) -> usize {
        self.negative.len() + self.positive.len()
    }

    /// 被当前图像引用的数量
    pub fn num_used(&self) -> usize {
        self.negative
            .iter()
            .chain(self.positive.iter())
            .filter(|e| e.used)
            .count()
    }

    /// 解析 st_ref_pic_set(stRpsIdx).
    ///
    /// `sets` 为 SPS 中已解析的候选集, `num_sets` 为 num_short_term_ref_pic_sets.
    /// 条带头中携带时 `idx == num_sets`.
    pub fn parse(
        bc: &mut BitCursor,
        idx: usize,
        num_sets: usize,
        sets: &[ShortTermRps],
    ) -> BsResult<Self> {
        let start = bc.bits_consumed();
        let mut rps = ShortTermRps::default();

        if idx != 0 {
            rps.inter_ref_pic_set_prediction_flag = bc.get_flag()?;
        }

        if rps.inter_ref_pic_set_prediction_flag {
            if idx == num_sets {
                rps.delta_idx_minus1 = bc.get_ue()?;
            }
            let delta = rps.delta_idx_minus1 as usize + 1;
            if delta > idx {
                return Err(BsError::syntax(format!(
                    "delta_idx_minus1={} 越界 (stRpsIdx={})",
                    rps.delta_idx_minus1, idx
                )));
            }
            let reference = sets
                .get(idx - delta)
                .ok_or_else(|| BsError::syntax("RPS 预测引用不存在"))?;
            let sign = bc.get_flag()?;
            let abs = bc.get_ue()?;
            if abs > (1 << 15) - 1 {
                return Err(BsError::syntax("abs_delta_rps_minus1 越界"));
            }
            rps.delta_rps = (1 - 2 * i32::from(sign)) * (abs as i32 + 1);

            let n = reference.num_delta_pocs();
            let mut used_by_curr = vec![false; n + 1];
            let mut use_delta = vec![true; n + 1];
            for j in 0..=n {
                used_by_curr[j] = bc.get_flag()?;
                if !used_by_curr[j] {
                    use_delta[j] = bc.get_flag()?;
                }
            }
            rps.derive_from(reference, &used_by_curr, &use_delta);
        } else {
            let num_negative = bc.get_ue()?;
            let num_positive = bc.get_ue()?;
            if num_negative > MAX_RPS_PICS || num_positive > MAX_RPS_PICS {
                return Err(BsError::syntax(format!(
                    "RPS 图像数越界: negative={} positive={}",
                    num_negative, num_positive
                )));
            }
            let mut poc = 0i32;
            for _ in 0..num_negative {
                poc -= bc.get_ue()? as i32 + 1;
                rps.negative.push(RpsEntry {
                    delta_poc: poc,
                    used: bc.get_flag()?,
                });
            }
            poc = 0;
            for _ in 0..num_positive {
                poc += bc.get_ue()? as i32 + 1;
                rps.positive.push(RpsEntry {
                    delta_poc: poc,
                    used: bc.get_flag()?,
                });
            }
        }

        rps.bits = (bc.bits_consumed() - start) as u32;
        Ok(rps)
    }

    /// 由参考 RPS 与 deltaRps 推导 (7-61, 7-62)
    fn derive_from(&mut self, r: &ShortTermRps, used: &[bool], use_delta: &[bool]) {
        let d = self.delta_rps;
        let nn = r.negative.len();
        let nd = r.num_delta_pocs();

        for (j, e) in r.positive.iter().enumerate().rev() {
            let dpoc = e.delta_poc + d;
            if dpoc < 0 && use_delta[nn + j] {
                self.negative.push(RpsEntry {
                    delta_poc: dpoc,
                    used: used[nn + j],
                });
            }
        }
        if d < 0 && use_delta[nd] {
            self.negative.push(RpsEntry {
                delta_poc: d,
                used: used[nd],
            });
        }
        for (j, e) in r.negative.iter().enumerate() {
            let dpoc = e.delta_poc + d;
            if dpoc < 0 && use_delta[j] {
                self.negative.push(RpsEntry {
                    delta_poc: dpoc,
                    used: used[j],
                });
            }
        }

        for (j, e) in r.negative.iter().enumerate().rev() {
            let dpoc = e.delta_poc + d;
            if dpoc > 0 && use_delta[j] {
                self.positive.push(RpsEntry {
                    delta_poc: dpoc,
                    used: used[j],
                });
            }
        }
        if d > 0 && use_delta[nd] {
            self.positive.push(RpsEntry {
                delta_poc: d,
                used: used[nd],
            });
        }
        for (j, e) in r.positive.iter().enumerate() {
            let dpoc = e.delta_poc + d;
            if dpoc > 0 && use_delta[nn + j] {
                self.positive.push(RpsEntry {
                    delta_poc: dpoc,
                    used: used[nn + j],
                });
            }
        }
    }
}

// ============================================================
// vui_parameters
// ============================================================

/// 预定义 SAR 表 (ITU-T H.265 表 E.1)
const HEVC_SAR_TABLE: [(u16, u16); 17] = [
    (0, 1),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// vui_parameters()
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vui {
    pub aspect_ratio_idc: Option<u8>,
    /// 采样宽高比 (由 aspect_ratio_idc 或 Extended_SAR 得到)
    pub sar: (u16, u16),
    pub overscan_appropriate_flag: Option<bool>,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coeffs: u8,
    pub chroma_sample_loc_type_top_field: u32,
    pub chroma_sample_loc_type_bottom_field: u32,
    pub neutral_chroma_indication_flag: bool,
    pub field_seq_flag: bool,
    pub frame_field_info_present_flag: bool,
    /// default display window (左, 右, 上, 下)
    pub default_display_window: Option<[u32; 4]>,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub num_ticks_poc_diff_one_minus1: Option<u32>,
    pub hrd: Option<HrdParameters>,
    pub tiles_fixed_structure_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub restricted_ref_pic_lists_flag: bool,
    pub min_spatial_segmentation_idc: u32,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_min_cu_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
}

impl Vui {
    /// 解析 vui_parameters()
    pub fn parse(bc: &mut BitCursor, max_sub_layers_minus1: u32) -> BsResult<Self> {
        let mut vui = Vui {
            sar: (1, 1),
            video_format: 5,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coeffs: 2,
            motion_vectors_over_pic_boundaries_flag: true,
            max_bytes_per_pic_denom: 2,
            max_bits_per_min_cu_denom: 1,
            log2_max_mv_length_horizontal: 15,
            log2_max_mv_length_vertical: 15,
            ..Default::default()
        };

        if bc.get_flag()? {
            let idc = bc.get_bits(8)? as u8;
            vui.aspect_ratio_idc = Some(idc);
            if idc == 255 {
                vui.sar = (bc.get_bits(16)? as u16, bc.get_bits(16)? as u16);
            } else if let Some(&sar) = HEVC_SAR_TABLE.get(usize::from(idc)) {
                vui.sar = sar;
            }
        }

        if bc.get_flag()? {
            vui.overscan_appropriate_flag = Some(bc.get_flag()?);
        }

        if bc.get_flag()? {
            vui.video_format = bc.get_bits(3)? as u8;
            vui.video_full_range_flag = bc.get_flag()?;
            if bc.get_flag()? {
                vui.colour_primaries = bc.get_bits(8)? as u8;
                vui.transfer_characteristics = bc.get_bits(8)? as u8;
                vui.matrix_coeffs = bc.get_bits(8)? as u8;
            }
        }

        if bc.get_flag()? {
            vui.chroma_sample_loc_type_top_field = bc.get_ue()?;
            vui.chroma_sample_loc_type_bottom_field = bc.get_ue()?;
        }

        vui.neutral_chroma_indication_flag = bc.get_flag()?;
        vui.field_seq_flag = bc.get_flag()?;
        vui.frame_field_info_present_flag = bc.get_flag()?;

        if bc.get_flag()? {
            vui.default_display_window =
                Some([bc.get_ue()?, bc.get_ue()?, bc.get_ue()?, bc.get_ue()?]);
        }

        if bc.get_flag()? {
            vui.num_units_in_tick = bc.get_bits(32)?;
            vui.time_scale = bc.get_bits(32)?;
            if bc.get_flag()? {
                vui.num_ticks_poc_diff_one_minus1 = Some(bc.get_ue()?);
            }
            if bc.get_flag()? {
                vui.hrd = Some(HrdParameters::parse(bc, true, max_sub_layers_minus1, None)?);
            }
        }

        if bc.get_flag()? {
            vui.tiles_fixed_structure_flag = bc.get_flag()?;
            vui.motion_vectors_over_pic_boundaries_flag = bc.get_flag()?;
            vui.restricted_ref_pic_lists_flag = bc.get_flag()?;
            vui.min_spatial_segmentation_idc = bc.get_ue()?;
            vui.max_bytes_per_pic_denom = bc.get_ue()?;
            vui.max_bits_per_min_cu_denom = bc.get_ue()?;
            vui.log2_max_mv_length_horizontal = bc.get_ue()?;
            vui.log2_max_mv_length_vertical = bc.get_ue()?;
        }

        Ok(vui)
    }

    /// 帧率 (time_scale / num_units_in_tick)
    pub fn frame_rate(&self) -> Option<(u32, u32)> {
        (self.num_units_in_tick > 0 && self.time_scale > 0)
            .then_some((self.time_scale, self.num_units_in_tick))
    }
}

/// 读取剩余扩展数据位 (extension_data_flag), 直到 rbsp_stop_one_bit
pub fn read_extension_data(bc: &mut BitCursor) -> BsResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = 0u8;
    let mut n = 0;
    while bc.more_rbsp_data() {
        byte = (byte << 1) | bc.get_bit()? as u8;
        n += 1;
        if n == 8 {
            out.push(byte);
            byte = 0;
            n = 0;
        }
    }
    if n > 0 {
        out.push(byte << (8 - n));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hevcbs_core::bitwriter::BitWriter;

    #[test]
    fn test_explicit_rps() {
        let mut bw = BitWriter::new();
        bw.write_ue(2); // num_negative_pics
        bw.write_ue(1); // num_positive_pics
        bw.write_ue(0); // -1
        bw.write_flag(true);
        bw.write_ue(1); // -3
        bw.write_flag(false);
        bw.write_ue(3); // +4
        bw.write_flag(true);
        let data = bw.finish();
        let mut bc = BitCursor::new_rbsp(&data);
        let rps = ShortTermRps::parse(&mut bc, 0, 1, &[]).unwrap();
        assert_eq!(
            rps.negative,
            vec![
                RpsEntry { delta_poc: -1, used: true },
                RpsEntry { delta_poc: -3, used: false }
            ]
        );
        assert_eq!(rps.positive, vec![RpsEntry { delta_poc: 4, used: true }]);
        assert_eq!(rps.num_used(), 2);
    }

    #[test]
    fn test_inter_rps_prediction() {
        // 参考集: {-1, -2}, deltaRps = -1 -> {-1(新), -2, -3}
        let reference = ShortTermRps {
            negative: vec![
                RpsEntry { delta_poc: -1, used: true },
                RpsEntry { delta_poc: -2, used: true },
            ],
            ..Default::default()
        };
        let mut bw = BitWriter::new();
        bw.write_flag(true); // inter_ref_pic_set_prediction_flag
        bw.write_flag(true); // delta_rps_sign
        bw.write_ue(0); // abs_delta_rps_minus1
        for _ in 0..3 {
            bw.write_flag(true); // used_by_curr_pic_flag
        }
        let data = bw.finish();
        let mut bc = BitCursor::new_rbsp(&data);
        let rps = ShortTermRps::parse(&mut bc, 1, 2, &[reference]).unwrap();
        let pocs: Vec<i32> = rps.negative.iter().map(|e| e.delta_poc).collect();
        assert_eq!(pocs, vec![-1, -2, -3]);
        assert!(rps.positive.is_empty());
        assert_eq!(rps.delta_rps, -1);
    }

    #[test]
    fn test_scaling_list_default_prediction() {
        let mut bw = BitWriter::new();
        for size_id in 0..4 {
            let count = if size_id == 3 { 2 } else { 6 };
            for _ in 0..count {
                bw.write_flag(false); // pred_mode_flag
                bw.write_ue(0); // 默认矩阵
            }
        }
        let data = bw.finish();
        let mut bc = BitCursor::new_rbsp(&data);
        let sl = ScalingList::parse(&mut bc).unwrap();
        assert_eq!(sl, ScalingList::default());
        assert_eq!(sl.coeffs[1][0][63], 115);
        assert_eq!(sl.coeffs[2][3][63], 91);
    }

    #[test]
    fn test_sub_layer_ordering_fill() {
        let mut bw = BitWriter::new();
        bw.write_ue(4);
        bw.write_ue(2);
        bw.write_ue(0);
        let data = bw.finish();
        let mut bc = BitCursor::new_rbsp(&data);
        let slo = parse_sub_layer_ordering(&mut bc, false, 2).unwrap();
        assert_eq!(slo.len(), 3);
        assert!(slo.iter().all(|s| s.max_dec_pic_buffering_minus1 == 4));
    }
}
