//! H.265/HEVC NAL (Network Abstraction Layer) 单元头与类型.
//!
//! HEVC NAL 头部为 2 字节:
//! - forbidden_zero_bit (1 bit)
//! - nal_unit_type (6 bits)
//! - nuh_layer_id (6 bits)
//! - nuh_temporal_id_plus1 (3 bits)

use hevcbs_core::{BsError, BsResult};
use serde::Serialize;

/// HEVC NAL 单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NalUnitType {
    /// TRAIL_N (非参考尾随图像)
    TrailN,
    /// TRAIL_R (参考尾随图像)
    TrailR,
    /// TSA_N
    TsaN,
    /// TSA_R
    TsaR,
    /// STSA_N
    StsaN,
    /// STSA_R
    StsaR,
    /// RADL_N
    RadlN,
    /// RADL_R
    RadlR,
    /// RASL_N
    RaslN,
    /// RASL_R
    RaslR,
    /// BLA_W_LP (Broken Link Access)
    BlaWLp,
    /// BLA_W_RADL
    BlaWRadl,
    /// BLA_N_LP
    BlaNLp,
    /// IDR_W_RADL (Instantaneous Decoding Refresh)
    IdrWRadl,
    /// IDR_N_LP
    IdrNLp,
    /// CRA_NUT (Clean Random Access)
    Cra,
    /// VPS (Video Parameter Set)
    Vps,
    /// SPS (Sequence Parameter Set)
    Sps,
    /// PPS (Picture Parameter Set)
    Pps,
    /// AUD (Access Unit Delimiter)
    Aud,
    /// EOS (End of Sequence)
    Eos,
    /// EOB (End of Bitstream)
    Eob,
    /// FD (Filler Data)
    FillerData,
    /// PREFIX_SEI
    PrefixSei,
    /// SUFFIX_SEI
    SuffixSei,
    /// 保留类型 (10-15, 22-31, 41-47)
    Reserved(u8),
    /// 未指定类型 (48-63)
    Unspecified(u8),
}

impl NalUnitType {
    /// 从类型编号创建
    pub fn from_type_id(id: u8) -> Self {
        match id {
            0 => Self::TrailN,
            1 => Self::TrailR,
            2 => Self::TsaN,
            3 => Self::TsaR,
            4 => Self::StsaN,
            5 => Self::StsaR,
            6 => Self::RadlN,
            7 => Self::RadlR,
            8 => Self::RaslN,
            9 => Self::RaslR,
            16 => Self::BlaWLp,
            17 => Self::BlaWRadl,
            18 => Self::BlaNLp,
            19 => Self::IdrWRadl,
            20 => Self::IdrNLp,
            21 => Self::Cra,
            32 => Self::Vps,
            33 => Self::Sps,
            34 => Self::Pps,
            35 => Self::Aud,
            36 => Self::Eos,
            37 => Self::Eob,
            38 => Self::FillerData,
            39 => Self::PrefixSei,
            40 => Self::SuffixSei,
            48..=63 => Self::Unspecified(id),
            _ => Self::Reserved(id & 0x3F),
        }
    }

    /// 获取类型编号
    pub fn type_id(&self) -> u8 {
        match self {
            Self::TrailN => 0,
            Self::TrailR => 1,
            Self::TsaN => 2,
            Self::TsaR => 3,
            Self::StsaN => 4,
            Self::StsaR => 5,
            Self::RadlN => 6,
            Self::RadlR => 7,
            Self::RaslN => 8,
            Self::RaslR => 9,
            Self::BlaWLp => 16,
            Self::BlaWRadl => 17,
            Self::BlaNLp => 18,
            Self::IdrWRadl => 19,
            Self::IdrNLp => 20,
            Self::Cra => 21,
            Self::Vps => 32,
            Self::Sps => 33,
            Self::Pps => 34,
            Self::Aud => 35,
            Self::Eos => 36,
            Self::Eob => 37,
            Self::FillerData => 38,
            Self::PrefixSei => 39,
            Self::SuffixSei => 40,
            Self::Reserved(id) | Self::Unspecified(id) => *id,
        }
    }

    /// 是否为 VCL (Video Coding Layer) NAL
    pub fn is_vcl(&self) -> bool {
        self.type_id() < 32
    }

    /// 是否为已定义的条带段 NAL (0-9, 16-21)
    pub fn is_slice(&self) -> bool {
        matches!(self.type_id(), 0..=9 | 16..=21)
    }

    /// 是否为 IRAP (Intra Random Access Point) NAL
    pub fn is_irap(&self) -> bool {
        matches!(self.type_id(), 16..=23)
    }

    /// 是否为 IDR NAL
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// 是否为 BLA NAL
    pub fn is_bla(&self) -> bool {
        matches!(self, Self::BlaWLp | Self::BlaWRadl | Self::BlaNLp)
    }

    /// 是否为 RASL 图像
    pub fn is_rasl(&self) -> bool {
        matches!(self, Self::RaslN | Self::RaslR)
    }

    /// 是否为 RADL 图像
    pub fn is_radl(&self) -> bool {
        matches!(self, Self::RadlN | Self::RadlR)
    }

    /// 是否为子层非参考图像 (类型号 <= 14 的偶数)
    pub fn is_sub_layer_non_ref(&self) -> bool {
        let id = self.type_id();
        id <= 14 && id % 2 == 0
    }

    /// 是否只能出现在访问单元内首个条带之后 (不开启新的访问单元)
    pub fn is_suffix(&self) -> bool {
        matches!(
            self.type_id(),
            36 | 37 | 38 | 40 | 45..=47 | 56..=63
        )
    }

    /// 短名称
    pub fn name(&self) -> &'static str {
        match self {
            Self::TrailN => "TRAIL_N",
            Self::TrailR => "TRAIL_R",
            Self::TsaN => "TSA_N",
            Self::TsaR => "TSA_R",
            Self::StsaN => "STSA_N",
            Self::StsaR => "STSA_R",
            Self::RadlN => "RADL_N",
            Self::RadlR => "RADL_R",
            Self::RaslN => "RASL_N",
            Self::RaslR => "RASL_R",
            Self::BlaWLp => "BLA_W_LP",
            Self::BlaWRadl => "BLA_W_RADL",
            Self::BlaNLp => "BLA_N_LP",
            Self::IdrWRadl => "IDR_W_RADL",
            Self::IdrNLp => "IDR_N_LP",
            Self::Cra => "CRA_NUT",
            Self::Vps => "VPS_NUT",
            Self::Sps => "SPS_NUT",
            Self::Pps => "PPS_NUT",
            Self::Aud => "AUD_NUT",
            Self::Eos => "EOS_NUT",
            Self::Eob => "EOB_NUT",
            Self::FillerData => "FD_NUT",
            Self::PrefixSei => "PREFIX_SEI_NUT",
            Self::SuffixSei => "SUFFIX_SEI_NUT",
            Self::Reserved(_) => "RSV",
            Self::Unspecified(_) => "UNSPEC",
        }
    }
}

/// NAL 单元头
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NalHeader {
    /// NAL 类型
    pub nal_type: NalUnitType,
    /// nuh_layer_id
    pub layer_id: u8,
    /// nuh_temporal_id_plus1
    pub temporal_id_plus1: u8,
}

impl NalHeader {
    /// 从原始 NAL 数据 (含 2 字节头) 解析
    pub fn parse(data: &[u8]) -> BsResult<Self> {
        if data.len() < 2 {
            return Err(BsError::IncompleteData("NAL 数据太短".into()));
        }
        if data[0] & 0x80 != 0 {
            return Err(BsError::syntax("forbidden_zero_bit 不为 0"));
        }
        let temporal_id_plus1 = data[1] & 0x07;
        if temporal_id_plus1 == 0 {
            return Err(BsError::syntax("nuh_temporal_id_plus1 为 0"));
        }
        Ok(Self {
            nal_type: NalUnitType::from_type_id((data[0] >> 1) & 0x3F),
            layer_id: ((data[0] & 1) << 5) | (data[1] >> 3),
            temporal_id_plus1,
        })
    }

    /// TemporalId
    pub fn temporal_id(&self) -> u8 {
        self.temporal_id_plus1 - 1
    }
}

/// 判断 NAL 是否开启新的访问单元.
///
/// `first_slice_segment` 为条带段的 first_slice_segment_in_pic_flag
/// (即负载首位), 非条带 NAL 忽略该参数.
pub fn starts_new_access_unit(nal_type: NalUnitType, first_slice_segment: bool) -> bool {
    if nal_type.is_slice() {
        return first_slice_segment;
    }
    !nal_type.is_suffix()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hevc_nal_类型() {
        assert_eq!(NalUnitType::from_type_id(19), NalUnitType::IdrWRadl);
        assert_eq!(NalUnitType::from_type_id(32), NalUnitType::Vps);
        assert_eq!(NalUnitType::from_type_id(33), NalUnitType::Sps);
        assert_eq!(NalUnitType::from_type_id(34), NalUnitType::Pps);
        assert_eq!(NalUnitType::from_type_id(12), NalUnitType::Reserved(12));
        assert_eq!(NalUnitType::from_type_id(50), NalUnitType::Unspecified(50));
        assert!(NalUnitType::IdrWRadl.is_idr());
        assert!(NalUnitType::IdrWRadl.is_irap());
        assert!(!NalUnitType::TrailR.is_irap());
        assert!(NalUnitType::TrailR.is_vcl());
        assert!(!NalUnitType::Vps.is_vcl());
        assert!(NalUnitType::TrailN.is_sub_layer_non_ref());
        assert!(!NalUnitType::TrailR.is_sub_layer_non_ref());
        for id in 0..64u8 {
            assert_eq!(NalUnitType::from_type_id(id).type_id(), id);
        }
    }

    #[test]
    fn test_hevc_nal_头解析() {
        // type=33 (SPS), layer_id=0, temporal_id_plus1=1
        let hdr = NalHeader::parse(&[0x42, 0x01, 0xAA]).unwrap();
        assert_eq!(hdr.nal_type, NalUnitType::Sps);
        assert_eq!(hdr.layer_id, 0);
        assert_eq!(hdr.temporal_id(), 0);

        // layer_id = 0b10_0011 跨两个字节
        let hdr = NalHeader::parse(&[(1 << 1) | 1, (0b00011 << 3) | 2]).unwrap();
        assert_eq!(hdr.nal_type, NalUnitType::TrailR);
        assert_eq!(hdr.layer_id, 0b10_0011);
        assert_eq!(hdr.temporal_id_plus1, 2);

        assert!(NalHeader::parse(&[0x42]).is_err());
        assert!(NalHeader::parse(&[0xC2, 0x01]).is_err());
        assert!(NalHeader::parse(&[0x42, 0x00]).is_err());
    }

    #[test]
    fn test_access_unit_boundary() {
        assert!(starts_new_access_unit(NalUnitType::IdrWRadl, true));
        assert!(!starts_new_access_unit(NalUnitType::TrailR, false));
        assert!(!starts_new_access_unit(NalUnitType::SuffixSei, false));
        assert!(!starts_new_access_unit(NalUnitType::Eos, false));
        assert!(!starts_new_access_unit(NalUnitType::Unspecified(60), false));
        assert!(starts_new_access_unit(NalUnitType::PrefixSei, false));
        assert!(starts_new_access_unit(NalUnitType::Vps, false));
        assert!(starts_new_access_unit(NalUnitType::Aud, false));
        assert!(starts_new_access_unit(NalUnitType::Reserved(41), false));
    }
}
