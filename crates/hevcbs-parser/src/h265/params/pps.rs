//! 图像参数集 (PPS) 解析.

use hevcbs_core::{BitCursor, BsError, BsResult};

use super::common::{ScalingList, read_extension_data};

/// 分块 (tile) 划分
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileSpec {
    pub num_tile_columns_minus1: u32,
    pub num_tile_rows_minus1: u32,
    pub uniform_spacing_flag: bool,
    /// 显式列宽 (CTB 数减 1), 不含最后一列
    pub column_width_minus1: Vec<u32>,
    /// 显式行高 (CTB 数减 1), 不含最后一行
    pub row_height_minus1: Vec<u32>,
    pub loop_filter_across_tiles_enabled_flag: bool,
}

/// 范围扩展
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PpsRangeExt {
    pub log2_max_transform_skip_block_size_minus2: u32,
    pub cross_component_prediction_enabled_flag: bool,
    pub chroma_qp_offset_list_enabled_flag: bool,
    pub diff_cu_chroma_qp_offset_depth: u32,
    pub cb_qp_offset_list: Vec<i32>,
    pub cr_qp_offset_list: Vec<i32>,
    pub log2_sao_offset_scale_luma: u32,
    pub log2_sao_offset_scale_chroma: u32,
}

/// 屏幕内容编码扩展
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PpsSccExt {
    pub curr_pic_ref_enabled_flag: bool,
    pub residual_adaptive_colour_transform_enabled_flag: bool,
    pub slice_act_qp_offsets_present_flag: bool,
    /// ActQpOffset (Y, Cb, Cr)
    pub act_qp_offsets: [i32; 3],
    pub monochrome_palette_flag: bool,
    pub luma_bit_depth_entry_minus8: u32,
    pub chroma_bit_depth_entry_minus8: u32,
    /// None 表示未携带初始化器, 沿用 SPS
    pub palette_predictor_initializers: Option<Vec<Vec<u16>>>,
}

/// 解析后的 PPS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    pub pps_id: u8,
    pub sps_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u32,
    pub sign_data_hiding_enabled_flag: bool,
    pub cabac_init_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub num_ref_idx_l1_default_active_minus1: u32,
    pub init_qp_minus26: i32,
    pub constrained_intra_pred_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub diff_cu_qp_delta_depth: u32,
    pub cb_qp_offset: i32,
    pub cr_qp_offset: i32,
    pub slice_chroma_qp_offsets_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub transquant_bypass_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub tiles: TileSpec,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i32,
    pub tc_offset_div2: i32,
    pub scaling_list: Option<ScalingList>,
    pub lists_modification_present_flag: bool,
    pub log2_parallel_merge_level_minus2: u32,
    pub slice_segment_header_extension_present_flag: bool,
    pub range_ext: PpsRangeExt,
    pub scc_ext: PpsSccExt,
    /// 多层/3D 扩展及其后的扩展数据 (不解析, 保留原始位)
    pub extension_data: Vec<u8>,
}

impl Pps {
    /// 从 RBSP (已跳过 NAL 头) 解析. 所引用 SPS 是否存在由调用方校验.
    pub fn parse(bc: &mut BitCursor) -> BsResult<Self> {
        let pps_id = bc.get_ue()?;
        if pps_id > 63 {
            return Err(BsError::syntax(format!("pps_pic_parameter_set_id={} 超出范围", pps_id)));
        }
        let sps_id = bc.get_ue()?;
        if sps_id > 15 {
            return Err(BsError::syntax(format!("pps_seq_parameter_set_id={} 超出范围", sps_id)));
        }

        let mut pps = Pps {
            pps_id: pps_id as u8,
            sps_id: sps_id as u8,
            dependent_slice_segments_enabled_flag: bc.get_flag()?,
            output_flag_present_flag: bc.get_flag()?,
            num_extra_slice_header_bits: bc.get_bits(3)?,
            sign_data_hiding_enabled_flag: bc.get_flag()?,
            cabac_init_present_flag: bc.get_flag()?,
            num_ref_idx_l0_default_active_minus1: bc.get_ue()?,
            num_ref_idx_l1_default_active_minus1: bc.get_ue()?,
            init_qp_minus26: bc.get_se()?,
            constrained_intra_pred_flag: bc.get_flag()?,
            transform_skip_enabled_flag: bc.get_flag()?,
            cu_qp_delta_enabled_flag: bc.get_flag()?,
            diff_cu_qp_delta_depth: 0,
            cb_qp_offset: 0,
            cr_qp_offset: 0,
            slice_chroma_qp_offsets_present_flag: false,
            weighted_pred_flag: false,
            weighted_bipred_flag: false,
            transquant_bypass_enabled_flag: false,
            tiles_enabled_flag: false,
            entropy_coding_sync_enabled_flag: false,
            tiles: TileSpec::default(),
            loop_filter_across_slices_enabled_flag: false,
            deblocking_filter_control_present_flag: false,
            deblocking_filter_override_enabled_flag: false,
            deblocking_filter_disabled_flag: false,
            beta_offset_div2: 0,
            tc_offset_div2: 0,
            scaling_list: None,
            lists_modification_present_flag: false,
            log2_parallel_merge_level_minus2: 0,
            slice_segment_header_extension_present_flag: false,
            range_ext: PpsRangeExt::default(),
            scc_ext: PpsSccExt::default(),
            extension_data: Vec::new(),
        };
        if pps.num_ref_idx_l0_default_active_minus1 > 14
            || pps.num_ref_idx_l1_default_active_minus1 > 14
        {
            return Err(BsError::syntax("num_ref_idx_default_active_minus1 超出范围"));
        }
        if !(-(26 + 48)..=25).contains(&pps.init_qp_minus26) {
            return Err(BsError::syntax("init_qp_minus26 超出范围"));
        }

        if pps.cu_qp_delta_enabled_flag {
            pps.diff_cu_qp_delta_depth = bc.get_ue()?;
        }
        pps.cb_qp_offset = bc.get_se()?;
        pps.cr_qp_offset = bc.get_se()?;
        if !(-12..=12).contains(&pps.cb_qp_offset) || !(-12..=12).contains(&pps.cr_qp_offset) {
            return Err(BsError::syntax("pps 色度 QP 偏移超出范围"));
        }
        pps.slice_chroma_qp_offsets_present_flag = bc.get_flag()?;
        pps.weighted_pred_flag = bc.get_flag()?;
        pps.weighted_bipred_flag = bc.get_flag()?;
        pps.transquant_bypass_enabled_flag = bc.get_flag()?;
        pps.tiles_enabled_flag = bc.get_flag()?;
        pps.entropy_coding_sync_enabled_flag = bc.get_flag()?;

        if pps.tiles_enabled_flag {
            pps.tiles = parse_tiles(bc)?;
        }

        pps.loop_filter_across_slices_enabled_flag = bc.get_flag()?;
        pps.deblocking_filter_control_present_flag = bc.get_flag()?;
        if pps.deblocking_filter_control_present_flag {
            pps.deblocking_filter_override_enabled_flag = bc.get_flag()?;
            pps.deblocking_filter_disabled_flag = bc.get_flag()?;
            if !pps.deblocking_filter_disabled_flag {
                pps.beta_offset_div2 = bc.get_se()?;
                pps.tc_offset_div2 = bc.get_se()?;
            }
        }

        if bc.get_flag()? {
            pps.scaling_list = Some(ScalingList::parse(bc)?);
        }
        pps.lists_modification_present_flag = bc.get_flag()?;
        pps.log2_parallel_merge_level_minus2 = bc.get_ue()?;
        pps.slice_segment_header_extension_present_flag = bc.get_flag()?;

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
            pps.parse_range_ext(bc)?;
        }
        if multilayer || ext_3d {
            // 多层/3D 扩展语法依赖层间信息, 连同之后的扩展一并按原始位保留
            pps.extension_data = read_extension_data(bc)?;
            bc.trailing_bits()?;
            return Ok(pps);
        }
        if scc {
            pps.parse_scc_ext(bc)?;
        }
        if xbits != 0 {
            pps.extension_data = read_extension_data(bc)?;
        }
        bc.trailing_bits()?;
        Ok(pps)
    }

    fn parse_range_ext(&mut self, bc: &mut BitCursor) -> BsResult<()> {
        let ext = &mut self.range_ext;
        if self.transform_skip_enabled_flag {
            ext.log2_max_transform_skip_block_size_minus2 = bc.get_ue()?;
            if ext.log2_max_transform_skip_block_size_minus2 > 3 {
                return Err(BsError::syntax("log2_max_transform_skip_block_size_minus2 超出范围"));
            }
        }
        ext.cross_component_prediction_enabled_flag = bc.get_flag()?;
        ext.chroma_qp_offset_list_enabled_flag = bc.get_flag()?;
        if ext.chroma_qp_offset_list_enabled_flag {
            ext.diff_cu_chroma_qp_offset_depth = bc.get_ue()?;
            let len = bc.get_ue()? as usize + 1;
            if len > 6 {
                return Err(BsError::syntax("chroma_qp_offset_list_len_minus1 超出范围"));
            }
            for _ in 0..len {
                ext.cb_qp_offset_list.push(bc.get_se()?);
                ext.cr_qp_offset_list.push(bc.get_se()?);
            }
        }
        ext.log2_sao_offset_scale_luma = bc.get_ue()?;
        ext.log2_sao_offset_scale_chroma = bc.get_ue()?;
        Ok(())
    }

    fn parse_scc_ext(&mut self, bc: &mut BitCursor) -> BsResult<()> {
        let ext = &mut self.scc_ext;
        ext.curr_pic_ref_enabled_flag = bc.get_flag()?;
        ext.residual_adaptive_colour_transform_enabled_flag = bc.get_flag()?;
        if ext.residual_adaptive_colour_transform_enabled_flag {
            ext.slice_act_qp_offsets_present_flag = bc.get_flag()?;
            ext.act_qp_offsets = [bc.get_se()? - 5, bc.get_se()? - 5, bc.get_se()? - 3];
        }
        if bc.get_flag()? {
            let num = bc.get_ue()? as usize;
            if num > 128 {
                return Err(BsError::syntax("pps_num_palette_predictor_initializers 超出范围"));
            }
            let mut comps_out = Vec::new();
            if num > 0 {
                ext.monochrome_palette_flag = bc.get_flag()?;
                ext.luma_bit_depth_entry_minus8 = bc.get_ue()?;
                if !ext.monochrome_palette_flag {
                    ext.chroma_bit_depth_entry_minus8 = bc.get_ue()?;
                }
                if ext.luma_bit_depth_entry_minus8 > 8 || ext.chroma_bit_depth_entry_minus8 > 8 {
                    return Err(BsError::syntax("调色板位深超出范围"));
                }
                let comps = if ext.monochrome_palette_flag { 1 } else { 3 };
                for comp in 0..comps {
                    let bits = if comp == 0 {
                        ext.luma_bit_depth_entry_minus8 + 8
                    } else {
                        ext.chroma_bit_depth_entry_minus8 + 8
                    };
                    let mut entries = Vec::with_capacity(num);
                    for _ in 0..num {
                        entries.push(bc.get_bits(bits)? as u16);
                    }
                    comps_out.push(entries);
                }
            }
            ext.palette_predictor_initializers = Some(comps_out);
        }
        Ok(())
    }

    /// 初始 SliceQpY 的基准值
    pub fn init_qp(&self) -> i32 {
        26 + self.init_qp_minus26
    }

    /// Log2ParMrgLevel
    pub fn log2_par_mrg_level(&self) -> u32 {
        self.log2_parallel_merge_level_minus2 + 2
    }
}

fn parse_tiles(bc: &mut BitCursor) -> BsResult<TileSpec> {
    let mut t = TileSpec {
        num_tile_columns_minus1: bc.get_ue()?,
        num_tile_rows_minus1: bc.get_ue()?,
        uniform_spacing_flag: bc.get_flag()?,
        ..Default::default()
    };
    if t.num_tile_columns_minus1 > 19 || t.num_tile_rows_minus1 > 21 {
        return Err(BsError::syntax(format!(
            "分块数超出范围: {}x{}",
            t.num_tile_columns_minus1 + 1,
            t.num_tile_rows_minus1 + 1
        )));
    }
    if !t.uniform_spacing_flag {
        for _ in 0..t.num_tile_columns_minus1 {
            t.column_width_minus1.push(bc.get_ue()?);
        }
        for _ in 0..t.num_tile_rows_minus1 {
            t.row_height_minus1.push(bc.get_ue()?);
        }
    }
    t.loop_filter_across_tiles_enabled_flag = bc.get_flag()?;
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{StreamParams, write_pps_rbsp};

    #[test]
    fn test_pps_tiles_and_defaults() {
        let params = StreamParams {
            tile_columns: 2,
            tile_rows: 1,
            init_qp: 30,
            ..StreamParams::default()
        };
        let data = write_pps_rbsp(&params);
        let mut bc = BitCursor::new_rbsp(&data);
        let pps = Pps::parse(&mut bc).unwrap();
        assert!(pps.tiles_enabled_flag);
        assert_eq!(pps.tiles.num_tile_columns_minus1, 1);
        assert!(pps.tiles.uniform_spacing_flag);
        assert_eq!(pps.init_qp(), 30);
        assert_eq!(pps.log2_par_mrg_level(), 2);
    }
}
