//! SEI (Supplemental Enhancement Information) 消息解析.
//!
//! 每条消息都保留原始负载字节. 已识别的负载类型:
//! - 0: buffering_period
//! - 1: pic_timing
//! - 6: recovery_point
//! - 129: active_parameter_sets
//! - 132: decoded_picture_hash
//!
//! 需要参数集而参数集尚未出现的消息被标记为 `Postponed`, 由上层在
//! 下一个条带头解析完成后调用 [`SeiMessage::reparse`] 重新解析.

use byteorder::{BigEndian, ReadBytesExt};
use hevcbs_core::{BitCursor, BsError, BsResult};
use log::warn;

use super::params::{HrdParameters, ParamSetCache};

pub const SEI_BUFFERING_PERIOD: u32 = 0;
pub const SEI_PICTURE_TIMING: u32 = 1;
pub const SEI_RECOVERY_POINT: u32 = 6;
pub const SEI_ACTIVE_PARAMETER_SETS: u32 = 129;
pub const SEI_DECODED_PICTURE_HASH: u32 = 132;

/// 单个 CPB 的初始移除延迟
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitialCpbRemoval {
    pub delay: u32,
    pub offset: u32,
    pub alt_delay: Option<u32>,
    pub alt_offset: Option<u32>,
}

/// buffering_period()
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferingPeriod {
    pub sps_id: u32,
    pub irap_cpb_params_present_flag: bool,
    pub cpb_delay_offset: u32,
    pub dpb_delay_offset: u32,
    pub concatenation_flag: bool,
    pub au_cpb_removal_delay_delta_minus1: u32,
    pub nal: Vec<InitialCpbRemoval>,
    pub vcl: Vec<InitialCpbRemoval>,
    pub use_alt_cpb_params_flag: Option<bool>,
}

/// pic_timing()
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PictureTiming {
    pub pic_struct: u8,
    pub source_scan_type: u8,
    pub duplicate_flag: bool,
    pub au_cpb_removal_delay_minus1: u32,
    pub pic_dpb_output_delay: u32,
    pub pic_dpb_output_du_delay: u32,
    pub du_common_cpb_removal_delay_increment_minus1: Option<u32>,
    pub num_nalus_in_du_minus1: Vec<u32>,
    pub du_cpb_removal_delay_increment_minus1: Vec<u32>,
}

/// recovery_point()
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryPoint {
    pub recovery_poc_cnt: i32,
    pub exact_match_flag: bool,
    pub broken_link_flag: bool,
}

/// active_parameter_sets()
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveParameterSets {
    pub active_vps_id: u8,
    pub self_contained_cvs_flag: bool,
    pub no_parameter_set_update_flag: bool,
    pub active_sps_ids: Vec<u32>,
    pub layer_sps_idx: Vec<u32>,
}

/// decoded_picture_hash()
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PictureHash {
    Md5(Vec<[u8; 16]>),
    Crc(Vec<u16>),
    Checksum(Vec<u32>),
}

/// 负载解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeiPayload {
    BufferingPeriod(BufferingPeriod),
    PictureTiming(PictureTiming),
    RecoveryPoint(RecoveryPoint),
    ActiveParameterSets(ActiveParameterSets),
    DecodedPictureHash(PictureHash),
    /// 所需参数集尚未出现, 等待重新解析
    Postponed,
    /// 未识别或解析失败, 只保留原始字节
    Opaque,
}

/// 单条 SEI 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeiMessage {
    pub payload_type: u32,
    pub payload_size: u32,
    pub raw: Vec<u8>,
    pub payload: SeiPayload,
}

impl SeiMessage {
    /// 是否等待重新解析
    pub fn is_postponed(&self) -> bool {
        matches!(self.payload, SeiPayload::Postponed)
    }

    /// 用当前参数集状态重新解析负载
    pub fn reparse(&mut self, cache: &ParamSetCache) {
        self.payload = parse_payload(self.payload_type, &self.raw, cache);
    }
}

/// 解析 sei_rbsp(), 返回其中全部消息
pub fn parse_sei_rbsp(bc: &mut BitCursor, cache: &ParamSetCache) -> BsResult<Vec<SeiMessage>> {
    let mut messages = Vec::new();
    loop {
        let payload_type = read_ff_coded(bc)?;
        let payload_size = read_ff_coded(bc)?;
        let raw = bc.get_bytes(payload_size as usize)?;
        let payload = parse_payload(payload_type, &raw, cache);
        messages.push(SeiMessage {
            payload_type,
            payload_size,
            raw,
            payload,
        });
        if !bc.more_rbsp_data() {
            break;
        }
    }
    bc.trailing_bits()?;
    Ok(messages)
}

fn read_ff_coded(bc: &mut BitCursor) -> BsResult<u32> {
    let mut value = 0u32;
    loop {
        let byte = bc.get_byte()?;
        value = value
            .checked_add(u32::from(byte))
            .ok_or_else(|| BsError::syntax("SEI 类型/长度溢出"))?;
        if byte != 0xFF {
            return Ok(value);
        }
    }
}

fn parse_payload(payload_type: u32, raw: &[u8], cache: &ParamSetCache) -> SeiPayload {
    let mut bc = BitCursor::new_rbsp(raw);
    let result = match payload_type {
        SEI_BUFFERING_PERIOD => parse_buffering_period(&mut bc, cache).map(SeiPayload::BufferingPeriod),
        SEI_PICTURE_TIMING => parse_picture_timing(&mut bc, cache).map(SeiPayload::PictureTiming),
        SEI_RECOVERY_POINT => parse_recovery_point(&mut bc).map(SeiPayload::RecoveryPoint),
        SEI_ACTIVE_PARAMETER_SETS => {
            parse_active_parameter_sets(&mut bc, cache).map(SeiPayload::ActiveParameterSets)
        }
        SEI_DECODED_PICTURE_HASH => parse_picture_hash(raw).map(SeiPayload::DecodedPictureHash),
        _ => Ok(SeiPayload::Opaque),
    };
    match result {
        Ok(payload) => payload,
        Err(BsError::NoActiveSet(_)) => SeiPayload::Postponed,
        Err(err) => {
            warn!("SEI 负载 (类型 {}) 解析失败: {}", payload_type, err);
            SeiPayload::Opaque
        }
    }
}

fn parse_buffering_period(bc: &mut BitCursor, cache: &ParamSetCache) -> BsResult<BufferingPeriod> {
    let sps_id = bc.get_ue()?;
    let sps = u8::try_from(sps_id)
        .ok()
        .and_then(|id| cache.sps(id))
        .ok_or_else(|| BsError::NoActiveSet(format!("buffering_period: SPS {} 尚未出现", sps_id)))?;
    let hrd = sps
        .value
        .vui
        .as_ref()
        .and_then(|v| v.hrd.clone())
        .unwrap_or_default();

    let mut bp = BufferingPeriod {
        sps_id,
        ..Default::default()
    };
    if !hrd.sub_pic_hrd_params_present_flag {
        bp.irap_cpb_params_present_flag = bc.get_flag()?;
    }
    let au_len = u32::from(hrd.au_cpb_removal_delay_length_minus1) + 1;
    if bp.irap_cpb_params_present_flag {
        bp.cpb_delay_offset = bc.get_bits(au_len)?;
        bp.dpb_delay_offset = bc.get_bits(u32::from(hrd.dpb_output_delay_length_minus1) + 1)?;
    }
    bp.concatenation_flag = bc.get_flag()?;
    bp.au_cpb_removal_delay_delta_minus1 = bc.get_bits(au_len)?;

    let with_alt = hrd.sub_pic_hrd_params_present_flag || bp.irap_cpb_params_present_flag;
    if hrd.nal_hrd_parameters_present_flag {
        bp.nal = parse_initial_removals(bc, &hrd, with_alt)?;
    }
    if hrd.vcl_hrd_parameters_present_flag {
        bp.vcl = parse_initial_removals(bc, &hrd, with_alt)?;
    }

    // 负载扩展: 对齐前剩余位不是 "1 后接零" 时首位为 use_alt_cpb_params_flag
    let consumed = bc.bits_consumed();
    if consumed < bc.data().len() * 8 {
        let o = 8 - (consumed % 8) as u32;
        let bits = bc.get_bits(o)?;
        if bits != 1 << (o - 1) {
            bp.use_alt_cpb_params_flag = Some(bits >> (o - 1) == 1);
        }
    }
    Ok(bp)
}

fn parse_initial_removals(
    bc: &mut BitCursor,
    hrd: &HrdParameters,
    with_alt: bool,
) -> BsResult<Vec<InitialCpbRemoval>> {
    let len = u32::from(hrd.initial_cpb_removal_delay_length_minus1) + 1;
    let mut out = Vec::with_capacity(hrd.cpb_cnt());
    for _ in 0..hrd.cpb_cnt() {
        let mut item = InitialCpbRemoval {
            delay: bc.get_bits(len)?,
            offset: bc.get_bits(len)?,
            ..Default::default()
        };
        if with_alt {
            item.alt_delay = Some(bc.get_bits(len)?);
            item.alt_offset = Some(bc.get_bits(len)?);
        }
        out.push(item);
    }
    Ok(out)
}

fn parse_picture_timing(bc: &mut BitCursor, cache: &ParamSetCache) -> BsResult<PictureTiming> {
    let sps = cache
        .active_sps()
        .ok_or_else(|| BsError::NoActiveSet("pic_timing: 无激活 SPS".into()))?;
    let mut pt = PictureTiming::default();
    let Some(vui) = sps.value.vui.as_ref() else {
        return Ok(pt);
    };

    if vui.frame_field_info_present_flag {
        pt.pic_struct = bc.get_bits(4)? as u8;
        pt.source_scan_type = bc.get_bits(2)? as u8;
        pt.duplicate_flag = bc.get_flag()?;
    }

    let Some(hrd) = vui.hrd.as_ref() else {
        return Ok(pt);
    };
    if !(hrd.nal_hrd_parameters_present_flag || hrd.vcl_hrd_parameters_present_flag) {
        return Ok(pt);
    }
    pt.au_cpb_removal_delay_minus1 = bc.get_bits(u32::from(hrd.au_cpb_removal_delay_length_minus1) + 1)?;
    pt.pic_dpb_output_delay = bc.get_bits(u32::from(hrd.dpb_output_delay_length_minus1) + 1)?;
    if hrd.sub_pic_hrd_params_present_flag {
        pt.pic_dpb_output_du_delay =
            bc.get_bits(u32::from(hrd.dpb_output_delay_du_length_minus1) + 1)?;
        if hrd.sub_pic_cpb_params_in_pic_timing_sei_flag {
            let inc_len = u32::from(hrd.du_cpb_removal_delay_increment_length_minus1) + 1;
            let num_du_minus1 = bc.get_ue()?;
            if num_du_minus1 > 0xFFFF {
                return Err(BsError::syntax("num_decoding_units_minus1 超出范围"));
            }
            let common = bc.get_flag()?;
            if common {
                pt.du_common_cpb_removal_delay_increment_minus1 = Some(bc.get_bits(inc_len)?);
            }
            for i in 0..=num_du_minus1 {
                pt.num_nalus_in_du_minus1.push(bc.get_ue()?);
                if !common && i < num_du_minus1 {
                    pt.du_cpb_removal_delay_increment_minus1.push(bc.get_bits(inc_len)?);
                }
            }
        }
    }
    Ok(pt)
}

fn parse_recovery_point(bc: &mut BitCursor) -> BsResult<RecoveryPoint> {
    Ok(RecoveryPoint {
        recovery_poc_cnt: bc.get_se()?,
        exact_match_flag: bc.get_flag()?,
        broken_link_flag: bc.get_flag()?,
    })
}

fn parse_active_parameter_sets(
    bc: &mut BitCursor,
    cache: &ParamSetCache,
) -> BsResult<ActiveParameterSets> {
    let mut aps = ActiveParameterSets {
        active_vps_id: bc.get_bits(4)? as u8,
        self_contained_cvs_flag: bc.get_flag()?,
        no_parameter_set_update_flag: bc.get_flag()?,
        ..Default::default()
    };
    let num = bc.get_ue()?;
    if num > 15 {
        return Err(BsError::syntax("num_sps_ids_minus1 超出范围"));
    }
    for _ in 0..=num {
        aps.active_sps_ids.push(bc.get_ue()?);
    }
    let vps = cache.vps(aps.active_vps_id).ok_or_else(|| {
        BsError::NoActiveSet(format!("active_parameter_sets: VPS {} 尚未出现", aps.active_vps_id))
    })?;
    let first = u32::from(vps.value.base_layer_internal_flag);
    for _ in first..=u32::from(vps.value.max_layers_minus1) {
        aps.layer_sps_idx.push(bc.get_ue()?);
    }
    Ok(aps)
}

fn parse_picture_hash(raw: &[u8]) -> BsResult<PictureHash> {
    let (&hash_type, mut rest) = raw
        .split_first()
        .ok_or_else(|| BsError::syntax("decoded_picture_hash 负载为空"))?;
    let unit = match hash_type {
        0 => 16,
        1 => 2,
        2 => 4,
        t => return Err(BsError::syntax(format!("未知 hash_type {}", t))),
    };
    // 单色图像 1 个分量, 其余 3 个
    let comps = match rest.len() / unit {
        n @ (1 | 3) => n,
        _ => return Err(BsError::syntax("decoded_picture_hash 长度与分量数不符")),
    };
    Ok(match hash_type {
        0 => {
            let mut out = Vec::with_capacity(comps);
            for chunk in rest.chunks_exact(16).take(comps) {
                let mut md5 = [0u8; 16];
                md5.copy_from_slice(chunk);
                out.push(md5);
            }
            PictureHash::Md5(out)
        }
        1 => {
            let mut out = Vec::with_capacity(comps);
            for _ in 0..comps {
                out.push(rest.read_u16::<BigEndian>()?);
            }
            PictureHash::Crc(out)
        }
        _ => {
            let mut out = Vec::with_capacity(comps);
            for _ in 0..comps {
                out.push(rest.read_u32::<BigEndian>()?);
            }
            PictureHash::Checksum(out)
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hevcbs_core::MemoryArena;
    use hevcbs_core::bitwriter::BitWriter;

    use super::*;
    use crate::h265::params::Sps;

    fn empty_cache() -> ParamSetCache {
        ParamSetCache::new(Arc::new(MemoryArena::new(0)))
    }

    #[test]
    fn test_sei_recovery_point_and_opaque() {
        let mut bw = BitWriter::new();
        // recovery_point: se(-3), 1, 0 -> 负载 1 字节
        bw.write_bits(6, 8);
        bw.write_bits(1, 8);
        bw.write_se(-3);
        bw.write_flag(true);
        bw.write_flag(false);
        bw.write_trailing_bits();
        // 用户数据 (类型 300 = 0xFF + 45), 长度 2
        bw.write_bits(0xFF, 8);
        bw.write_bits(45, 8);
        bw.write_bits(2, 8);
        bw.write_bits(0xABCD, 16);
        bw.write_trailing_bits();
        let data = bw.finish();

        let cache = empty_cache();
        let mut bc = BitCursor::new_rbsp(&data);
        let msgs = parse_sei_rbsp(&mut bc, &cache).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(
            msgs[0].payload,
            SeiPayload::RecoveryPoint(RecoveryPoint {
                recovery_poc_cnt: -3,
                exact_match_flag: true,
                broken_link_flag: false
            })
        );
        assert_eq!(msgs[1].payload_type, 300);
        assert_eq!(msgs[1].raw, vec![0xAB, 0xCD]);
        assert_eq!(msgs[1].payload, SeiPayload::Opaque);
    }

    #[test]
    fn test_sei_picture_timing_postponed_then_reparsed() {
        let mut bw = BitWriter::new();
        bw.write_bits(SEI_PICTURE_TIMING, 8);
        bw.write_bits(0, 8);
        bw.write_trailing_bits();
        let data = bw.finish();

        let mut cache = empty_cache();
        let mut bc = BitCursor::new_rbsp(&data);
        let mut msgs = parse_sei_rbsp(&mut bc, &cache).unwrap();
        assert!(msgs[0].is_postponed());

        cache
            .insert_sps(Sps {
                sps_id: 0,
                ..Default::default()
            })
            .unwrap();
        cache.activate_sps(0).unwrap();
        msgs[0].reparse(&cache);
        assert_eq!(msgs[0].payload, SeiPayload::PictureTiming(PictureTiming::default()));
    }

    #[test]
    fn test_sei_decoded_picture_hash_crc() {
        let raw = [1u8, 0x12, 0x34, 0x00, 0x01, 0xFF, 0xFE];
        assert_eq!(
            parse_picture_hash(&raw).unwrap(),
            PictureHash::Crc(vec![0x1234, 0x0001, 0xFFFE])
        );
        assert!(parse_picture_hash(&[0u8, 1, 2]).is_err());
    }
}
