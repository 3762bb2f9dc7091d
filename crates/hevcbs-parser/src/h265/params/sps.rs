//! 序列参数集 (SPS) 解析.

use hevcbs_core::{BitCursor, BsError, BsResult};

use super::common::{
    ProfileTierLevel, ScalingList, ShortTermRps, SubLayerOrdering, Vui, parse_sub_layer_ordering,
    read_extension_data,
};

/// SPS 中声明的长期参考候选
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LtRefCandidate {
    pub poc_lsb: u32,
    pub used_by_curr_pic: bool,
}

/// 范围扩展 (RExt) 标志
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpsRangeExt {
    pub transform_skip_rotation_enabled_flag: bool,
    pub transform_skip_context_enabled_flag: bool,
    pub implicit_rdpcm_enabled_flag: bool,
    pub explicit_rdpcm_enabled_flag: bool,
    pub extended_precision_processing_flag: bool,
    pub intra_smoothing_disabled_flag: bool,
    pub high_precision_offsets_enabled_flag: bool,
    pub persistent_rice_adaptation_enabled_flag: bool,
    pub cabac_bypass_alignment_enabled_flag: bool,
}

/// 屏幕内容编码扩展 (SCC)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpsSccExt {
    pub curr_pic_ref_enabled_flag: bool,
    pub palette_mode_enabled_flag: bool,
    pub palette_max_size: u32,
    pub delta_palette_max_predictor_size: u32,
    /// 调色板预测初始值, 每个分量一组
    pub palette_predictor_initializers: Vec<Vec<u16>>,
    pub motion_vector_resolution_control_idc: u8,
    pub intra_boundary_filtering_disabled_flag: bool,
}

/// 解析后的 SPS (含推导量)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sps {
    pub vps_id: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub ptl: ProfileTierLevel,
    pub sps_id: u8,
    pub chroma_format_idc: u32,
    pub separate_colour_plane_flag: bool,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    /// 裁剪窗口 (左, 右, 上, 下)
    pub conformance_window: Option<[u32; 4]>,
    pub bit_depth_luma_minus8: u32,
    pub bit_depth_chroma_minus8: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub sub_layer_ordering: Vec<SubLayerOrdering>,
    pub log2_min_luma_coding_block_size_minus3: u32,
    pub log2_diff_max_min_luma_coding_block_size: u32,
    pub log2_min_luma_transform_block_size_minus2: u32,
    pub log2_diff_max_min_luma_transform_block_size: u32,
    pub max_transform_hierarchy_depth_inter: u32,
    pub max_transform_hierarchy_depth_intra: u32,
    pub scaling_list_enabled_flag: bool,
    /// 显式量化矩阵 (None 表示使用默认矩阵)
    pub scaling_list: Option<ScalingList>,
    pub amp_enabled_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub pcm_enabled_flag: bool,
    pub pcm_sample_bit_depth_luma_minus1: u8,
    pub pcm_sample_bit_depth_chroma_minus1: u8,
    pub log2_min_pcm_luma_coding_block_size_minus3: u32,
    pub log2_diff_max_min_pcm_luma_coding_block_size: u32,
    pub pcm_loop_filter_disabled_flag: bool,
    pub short_term_rps: Vec<ShortTermRps>,
    pub long_term_ref_pics_present_flag: bool,
    pub lt_ref_candidates: Vec<LtRefCandidate>,
    pub temporal_mvp_enabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,
    pub vui: Option<Vui>,
    pub range_ext: SpsRangeExt,
    pub inter_view_mv_vert_constraint_flag: bool,
    pub scc_ext: SpsSccExt,
    pub extension_data: Vec<u8>,

    // ---- 推导量 ----
    pub chroma_array_type: u32,
    pub sub_width_c: u32,
    pub sub_height_c: u32,
    pub bit_depth_y: u32,
    pub bit_depth_c: u32,
    pub qp_bd_offset_y: i32,
    pub qp_bd_offset_c: i32,
    pub min_cb_log2: u32,
    pub ctb_log2: u32,
    pub ctb_size: u32,
    pub min_tb_log2: u32,
    pub max_tb_log2: u32,
    pub pic_width_in_ctbs: u32,
    pub pic_height_in_ctbs: u32,
    pub pic_width_in_min_cbs: u32,
    pub pic_height_in_min_cbs: u32,
    pub max_pic_order_cnt_lsb: u32,
    pub pcm_log2_min: u32,
    pub pcm_log2_max: u32,
}

impl Sps {
    /// 从 RBSP (已跳过 NAL 头) 解析
    pub fn parse(bc: &mut BitCursor) -> BsResult<Self> {
        let mut sps = Sps {
            vps_id: bc.get_bits(4)? as u8,
            max_sub_layers_minus1: bc.get_bits(3)? as u8,
            temporal_id_nesting_flag: bc.get_flag()?,
            ..Default::default()
        };
        if sps.max_sub_layers_minus1 > 6 {
            return Err(BsError::syntax("sps_max_sub_layers_minus1 超出范围"));
        }
        let msl = u32::from(sps.max_sub_layers_minus1);
        sps.ptl = ProfileTierLevel::parse(bc, msl)?;

        let sps_id = bc.get_ue()?;
        if sps_id > 15 {
            return Err(BsError::syntax(format!("sps_seq_parameter_set_id={} 超出范围", sps_id)));
        }
        sps.sps_id = sps_id as u8;
        sps.chroma_format_idc = bc.get_ue()?;
        if sps.chroma_format_idc > 3 {
            return Err(BsError::syntax("chroma_format_idc 超出范围"));
        }
        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = bc.get_flag()?;
        }

        sps.pic_width_in_luma_samples = bc.get_ue()?;
        sps.pic_height_in_luma_samples = bc.get_ue()?;
        if bc.get_flag()? {
            sps.conformance_window = Some([bc.get_ue()?, bc.get_ue()?, bc.get_ue()?, bc.get_ue()?]);
        }

        sps.bit_depth_luma_minus8 = bc.get_ue()?;
        sps.bit_depth_chroma_minus8 = bc.get_ue()?;
        if sps.bit_depth_luma_minus8 > 8 || sps.bit_depth_chroma_minus8 > 8 {
            return Err(BsError::syntax("位深超出范围"));
        }
        sps.log2_max_pic_order_cnt_lsb_minus4 = bc.get_ue()?;
        if sps.log2_max_pic_order_cnt_lsb_minus4 > 12 {
            return Err(BsError::syntax("log2_max_pic_order_cnt_lsb_minus4 超出范围"));
        }

        let present = bc.get_flag()?;
        sps.sub_layer_ordering = parse_sub_layer_ordering(bc, present, msl)?;

        sps.log2_min_luma_coding_block_size_minus3 = bc.get_ue()?;
        sps.log2_diff_max_min_luma_coding_block_size = bc.get_ue()?;
        sps.log2_min_luma_transform_block_size_minus2 = bc.get_ue()?;
        sps.log2_diff_max_min_luma_transform_block_size = bc.get_ue()?;
        sps.max_transform_hierarchy_depth_inter = bc.get_ue()?;
        sps.max_transform_hierarchy_depth_intra = bc.get_ue()?;

        sps.scaling_list_enabled_flag = bc.get_flag()?;
        if sps.scaling_list_enabled_flag && bc.get_flag()? {
            sps.scaling_list = Some(ScalingList::parse(bc)?);
        }

        sps.amp_enabled_flag = bc.get_flag()?;
        sps.sample_adaptive_offset_enabled_flag = bc.get_flag()?;
        sps.pcm_enabled_flag = bc.get_flag()?;
        if sps.pcm_enabled_flag {
            sps.pcm_sample_bit_depth_luma_minus1 = bc.get_bits(4)? as u8;
            sps.pcm_sample_bit_depth_chroma_minus1 = bc.get_bits(4)? as u8;
            sps.log2_min_pcm_luma_coding_block_size_minus3 = bc.get_ue()?;
            sps.log2_diff_max_min_pcm_luma_coding_block_size = bc.get_ue()?;
            sps.pcm_loop_filter_disabled_flag = bc.get_flag()?;
        }

        let num_st = bc.get_ue()? as usize;
        if num_st > 64 {
            return Err(BsError::syntax(format!("num_short_term_ref_pic_sets={} 超出范围", num_st)));
        }
        for i in 0..num_st {
            let rps = ShortTermRps::parse(bc, i, num_st, &sps.short_term_rps)?;
            sps.short_term_rps.push(rps);
        }

        sps.long_term_ref_pics_present_flag = bc.get_flag()?;
        if sps.long_term_ref_pics_present_flag {
            let num_lt = bc.get_ue()?;
            if num_lt > 32 {
                return Err(BsError::syntax("num_long_term_ref_pics_sps 超出范围"));
            }
            let lsb_bits = sps.log2_max_pic_order_cnt_lsb_minus4 + 4;
            for _ in 0..num_lt {
                sps.lt_ref_candidates.push(LtRefCandidate {
                    poc_lsb: bc.get_bits(lsb_bits)?,
                    used_by_curr_pic: bc.get_flag()?,
                });
            }
        }

        sps.temporal_mvp_enabled_flag = bc.get_flag()?;
        sps.strong_intra_smoothing_enabled_flag = bc.get_flag()?;
        if bc.get_flag()? {
            sps.vui = Some(Vui::parse(bc, msl)?);
        }

        let (mut range, mut multilayer, mut ext_3d, mut scc, mut xbits) =
            (false, false, false, false, 0);
        if bc.get_flag()? {
            range = bc.get_flag()?;
            multilayer = bc.get_flag()?;
            ext_3d = bc.get_flag()?;
            scc = bc.get_flag()?;
            xbits = bc.get_bits(4)?;
        }

        if range {
            sps.range_ext = SpsRangeExt {
                transform_skip_rotation_enabled_flag: bc.get_flag()?,
                transform_skip_context_enabled_flag: bc.get_flag()?,
                implicit_rdpcm_enabled_flag: bc.get_flag()?,
                explicit_rdpcm_enabled_flag: bc.get_flag()?,
                extended_precision_processing_flag: bc.get_flag()?,
                intra_smoothing_disabled_flag: bc.get_flag()?,
                high_precision_offsets_enabled_flag: bc.get_flag()?,
                persistent_rice_adaptation_enabled_flag: bc.get_flag()?,
                cabac_bypass_alignment_enabled_flag: bc.get_flag()?,
            };
        }
        if multilayer {
            sps.inter_view_mv_vert_constraint_flag = bc.get_flag()?;
        }
        if ext_3d {
            skip_sps_3d_extension(bc)?;
        }
        if scc {
            sps.parse_scc_ext(bc)?;
        }
        if xbits != 0 {
            sps.extension_data = read_extension_data(bc)?;
        }
        bc.trailing_bits()?;

        sps.derive()?;
        Ok(sps)
    }

    fn parse_scc_ext(&mut self, bc: &mut BitCursor) -> BsResult<()> {
        let scc = &mut self.scc_ext;
        scc.curr_pic_ref_enabled_flag = bc.get_flag()?;
        scc.palette_mode_enabled_flag = bc.get_flag()?;
        if scc.palette_mode_enabled_flag {
            scc.palette_max_size = bc.get_ue()?;
            scc.delta_palette_max_predictor_size = bc.get_ue()?;
            if scc.palette_max_size > 64 || scc.delta_palette_max_predictor_size > 128 {
                return Err(BsError::syntax("调色板尺寸超出范围"));
            }
            if bc.get_flag()? {
                let num = bc.get_ue()? as usize + 1;
                if num > 128 {
                    return Err(BsError::syntax("sps_num_palette_predictor_initializers 超出范围"));
                }
                let comps = if self.chroma_format_idc == 0 { 1 } else { 3 };
                for comp in 0..comps {
                    let bits = if comp == 0 {
                        self.bit_depth_luma_minus8 + 8
                    } else {
                        self.bit_depth_chroma_minus8 + 8
                    };
                    let mut entries = Vec::with_capacity(num);
                    for _ in 0..num {
                        entries.push(bc.get_bits(bits)? as u16);
                    }
                    scc.palette_predictor_initializers.push(entries);
                }
            }
        }
        scc.motion_vector_resolution_control_idc = bc.get_bits(2)? as u8;
        scc.intra_boundary_filtering_disabled_flag = bc.get_flag()?;
        Ok(())
    }

    /// 计算推导量并校验几何参数
    fn derive(&mut self) -> BsResult<()> {
        self.chroma_array_type = if self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        };
        (self.sub_width_c, self.sub_height_c) = match self.chroma_array_type {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        self.bit_depth_y = 8 + self.bit_depth_luma_minus8;
        self.bit_depth_c = 8 + self.bit_depth_chroma_minus8;
        self.qp_bd_offset_y = 6 * self.bit_depth_luma_minus8 as i32;
        self.qp_bd_offset_c = 6 * self.bit_depth_chroma_minus8 as i32;

        self.min_cb_log2 = self.log2_min_luma_coding_block_size_minus3 + 3;
        self.ctb_log2 = self.min_cb_log2 + self.log2_diff_max_min_luma_coding_block_size;
        if !(4..=6).contains(&self.ctb_log2) || self.min_cb_log2 > self.ctb_log2 {
            return Err(BsError::syntax(format!(
                "CTB 尺寸非法: log2={} (MinCb log2={})",
                self.ctb_log2, self.min_cb_log2
            )));
        }
        self.ctb_size = 1 << self.ctb_log2;
        self.min_tb_log2 = self.log2_min_luma_transform_block_size_minus2 + 2;
        self.max_tb_log2 = self.min_tb_log2 + self.log2_diff_max_min_luma_transform_block_size;
        if self.min_tb_log2 >= self.min_cb_log2 || self.max_tb_log2 > self.ctb_log2.min(5) {
            return Err(BsError::syntax(format!(
                "变换块尺寸非法: min={} max={}",
                self.min_tb_log2, self.max_tb_log2
            )));
        }

        let min_cb = 1u32 << self.min_cb_log2;
        if self.pic_width_in_luma_samples == 0
            || self.pic_height_in_luma_samples == 0
            || self.pic_width_in_luma_samples % min_cb != 0
            || self.pic_height_in_luma_samples % min_cb != 0
            || self.pic_width_in_luma_samples > 16888
            || self.pic_height_in_luma_samples > 16888
        {
            return Err(BsError::syntax(format!(
                "图像尺寸非法: {}x{}",
                self.pic_width_in_luma_samples, self.pic_height_in_luma_samples
            )));
        }
        self.pic_width_in_ctbs = self.pic_width_in_luma_samples.div_ceil(self.ctb_size);
        self.pic_height_in_ctbs = self.pic_height_in_luma_samples.div_ceil(self.ctb_size);
        self.pic_width_in_min_cbs = self.pic_width_in_luma_samples >> self.min_cb_log2;
        self.pic_height_in_min_cbs = self.pic_height_in_luma_samples >> self.min_cb_log2;
        self.max_pic_order_cnt_lsb = 1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4);

        if self.pcm_enabled_flag {
            self.pcm_log2_min = self.log2_min_pcm_luma_coding_block_size_minus3 + 3;
            self.pcm_log2_max = self.pcm_log2_min + self.log2_diff_max_min_pcm_luma_coding_block_size;
            if self.pcm_log2_max > self.ctb_log2.min(5) {
                return Err(BsError::syntax("PCM 块尺寸超出范围"));
            }
        }
        Ok(())
    }

    /// CTB 总数
    pub fn pic_size_in_ctbs(&self) -> u32 {
        self.pic_width_in_ctbs * self.pic_height_in_ctbs
    }

    /// PaletteMaxPredictorSize
    pub fn palette_max_predictor_size(&self) -> u32 {
        self.scc_ext.palette_max_size + self.scc_ext.delta_palette_max_predictor_size
    }

    /// 最高子层的 DPB 容量
    pub fn max_dec_pic_buffering(&self) -> u32 {
        self.sub_layer_ordering
            .last()
            .map_or(1, |s| s.max_dec_pic_buffering_minus1 + 1)
    }
}

/// 跳过 sps_3d_extension (两组视点/深度标志)
fn skip_sps_3d_extension(bc: &mut BitCursor) -> BsResult<()> {
    // d = 0
    bc.get_flag()?; // iv_di_mc_enabled_flag
    bc.get_flag()?; // iv_mv_scal_enabled_flag
    bc.get_ue()?; // log2_ivmc_sub_pb_size_minus3
    bc.get_flag()?; // iv_res_pred_enabled_flag
    bc.get_flag()?; // depth_ref_enabled_flag
    bc.get_flag()?; // vsp_mc_enabled_flag
    bc.get_flag()?; // dbbp_enabled_flag
    // d = 1
    bc.get_flag()?;
    bc.get_flag()?;
    bc.get_flag()?; // tex_mc_enabled_flag
    bc.get_ue()?; // log2_texmc_sub_pb_size_minus3
    for _ in 0..5 {
        bc.get_flag()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{StreamParams, write_sps_rbsp};

    #[test]
    fn test_sps_derived_geometry() {
        let params = StreamParams {
            width: 64,
            height: 48,
            ..StreamParams::default()
        };
        let data = write_sps_rbsp(&params);
        let mut bc = BitCursor::new_rbsp(&data);
        let sps = Sps::parse(&mut bc).unwrap();
        assert_eq!(sps.ctb_log2, 4);
        assert_eq!(sps.min_cb_log2, 3);
        assert_eq!(sps.pic_width_in_ctbs, 4);
        assert_eq!(sps.pic_height_in_ctbs, 3);
        assert_eq!(sps.pic_size_in_ctbs(), 12);
        assert_eq!(sps.chroma_array_type, 1);
        assert_eq!(sps.max_pic_order_cnt_lsb, 256);
    }

    #[test]
    fn test_sps_rejects_unaligned_size() {
        let params = StreamParams {
            width: 60,
            height: 48,
            ..StreamParams::default()
        };
        let data = write_sps_rbsp(&params);
        let mut bc = BitCursor::new_rbsp(&data);
        assert!(matches!(Sps::parse(&mut bc), Err(BsError::InvalidSyntax(_))));
    }
}
