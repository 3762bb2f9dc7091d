//! 视频参数集 (VPS) 解析.

use hevcbs_core::{BitCursor, BsError, BsResult};

use super::common::{
    HrdParameters, ProfileTierLevel, SubLayerOrdering, parse_sub_layer_ordering,
    read_extension_data,
};

/// 解析后的 VPS
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vps {
    pub vps_id: u8,
    pub base_layer_internal_flag: bool,
    pub base_layer_available_flag: bool,
    pub max_layers_minus1: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub ptl: ProfileTierLevel,
    pub sub_layer_ordering: Vec<SubLayerOrdering>,
    pub max_layer_id: u8,
    /// layer_id_included_flag[i][j], i 从 1 开始
    pub layer_id_included: Vec<Vec<bool>>,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub num_ticks_poc_diff_one_minus1: Option<u32>,
    /// (hrd_layer_set_idx, hrd_parameters)
    pub hrd: Vec<(u32, HrdParameters)>,
    /// vps_extension_data 原始位
    pub extension_data: Vec<u8>,
}

impl Vps {
    /// 从 RBSP (已跳过 NAL 头) 解析
    pub fn parse(bc: &mut BitCursor) -> BsResult<Self> {
        let mut vps = Vps {
            vps_id: bc.get_bits(4)? as u8,
            base_layer_internal_flag: bc.get_flag()?,
            base_layer_available_flag: bc.get_flag()?,
            max_layers_minus1: bc.get_bits(6)? as u8,
            max_sub_layers_minus1: bc.get_bits(3)? as u8,
            temporal_id_nesting_flag: bc.get_flag()?,
            ..Default::default()
        };
        if vps.max_sub_layers_minus1 > 6 {
            return Err(BsError::syntax(format!(
                "vps_max_sub_layers_minus1={} 超出范围",
                vps.max_sub_layers_minus1
            )));
        }
        if bc.get_bits(16)? != 0xFFFF {
            log::warn!("VPS: vps_reserved_0xffff_16bits 值异常");
        }

        let msl = u32::from(vps.max_sub_layers_minus1);
        vps.ptl = ProfileTierLevel::parse(bc, msl)?;
        let present = bc.get_flag()?;
        vps.sub_layer_ordering = parse_sub_layer_ordering(bc, present, msl)?;

        vps.max_layer_id = bc.get_bits(6)? as u8;
        let num_layer_sets_minus1 = bc.get_ue()?;
        if num_layer_sets_minus1 > 1023 {
            return Err(BsError::syntax("vps_num_layer_sets_minus1 超出范围"));
        }
        for _ in 1..=num_layer_sets_minus1 {
            let mut set = Vec::with_capacity(usize::from(vps.max_layer_id) + 1);
            for _ in 0..=vps.max_layer_id {
                set.push(bc.get_flag()?);
            }
            vps.layer_id_included.push(set);
        }

        if bc.get_flag()? {
            vps.num_units_in_tick = bc.get_bits(32)?;
            vps.time_scale = bc.get_bits(32)?;
            if bc.get_flag()? {
                vps.num_ticks_poc_diff_one_minus1 = Some(bc.get_ue()?);
            }
            let num_hrd = bc.get_ue()?;
            if num_hrd > num_layer_sets_minus1 + 1 {
                return Err(BsError::syntax(format!("vps_num_hrd_parameters={} 越界", num_hrd)));
            }
            for i in 0..num_hrd {
                let layer_set_idx = bc.get_ue()?;
                let cprms_present = if i > 0 { bc.get_flag()? } else { true };
                let prev = vps.hrd.last().map(|(_, h)| h);
                let hrd = HrdParameters::parse(bc, cprms_present, msl, prev)?;
                vps.hrd.push((layer_set_idx, hrd));
            }
        }

        if bc.get_flag()? {
            vps.extension_data = read_extension_data(bc)?;
        }
        bc.trailing_bits()?;
        Ok(vps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hevcbs_core::bitwriter::BitWriter;

    /// 写一个不含子层的 general PTL
    fn write_ptl(bw: &mut BitWriter) {
        bw.write_bits(0, 2);
        bw.write_flag(false);
        bw.write_bits(1, 5); // Main
        bw.write_bits(0x6000_0000, 32);
        bw.write_bits(0b1001, 4);
        bw.write_bits(0, 32);
        bw.write_bits(0, 12);
        bw.write_bits(93, 8); // level 3.1
    }

    #[test]
    fn test_vps_parse_minimal() {
        let mut bw = BitWriter::new();
        bw.write_bits(3, 4);
        bw.write_flag(true);
        bw.write_flag(true);
        bw.write_bits(0, 6);
        bw.write_bits(0, 3);
        bw.write_flag(true);
        bw.write_bits(0xFFFF, 16);
        write_ptl(&mut bw);
        bw.write_flag(true); // sub_layer_ordering_info_present
        bw.write_ue(4);
        bw.write_ue(2);
        bw.write_ue(0);
        bw.write_bits(0, 6);
        bw.write_ue(0);
        bw.write_flag(true); // timing
        bw.write_bits(1001, 32);
        bw.write_bits(60000, 32);
        bw.write_flag(false);
        bw.write_ue(0);
        bw.write_flag(false);
        bw.write_trailing_bits();
        let data = bw.finish();

        let mut bc = BitCursor::new_rbsp(&data);
        let vps = Vps::parse(&mut bc).unwrap();
        assert_eq!(vps.vps_id, 3);
        assert_eq!(vps.ptl.general.profile_idc, 1);
        assert_eq!(vps.ptl.general_level_idc, 93);
        assert_eq!(vps.sub_layer_ordering[0].max_dec_pic_buffering_minus1, 4);
        assert_eq!(vps.time_scale, 60000);
        assert!(vps.hrd.is_empty());
    }
}
