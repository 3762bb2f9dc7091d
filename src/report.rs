//! 访问单元摘要.
//!
//! 把 [`AccessUnit`] 压缩为便于打印与序列化的结构, 供命令行工具和集成测试使用.

use std::fmt;

use hevcbs_parser::{AccessUnit, NalPayload};
use serde::Serialize;

/// 单个 NAL 单元的摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NalReport {
    pub nal_type: &'static str,
    pub type_id: u8,
    pub layer_id: u8,
    pub temporal_id: u8,
    pub offset: u64,
    pub size: usize,
    /// 解析失败时的错误描述
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 单个条带段的摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceReport {
    pub slice_type: &'static str,
    pub address: u32,
    pub dependent: bool,
    pub qp: i32,
    pub ctus: usize,
    pub cus: usize,
    pub pus: usize,
    pub tus: usize,
    pub coeffs: usize,
    pub bins: u64,
    pub l0: Vec<i32>,
    pub l1: Vec<i32>,
    pub corrupted: bool,
    pub partial: bool,
}

/// 访问单元摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuReport {
    pub index: u64,
    pub poc: Option<i32>,
    pub incomplete: bool,
    pub nal_count: usize,
    pub ctu_count: usize,
    pub bins: u64,
    pub nals: Vec<NalReport>,
    pub slices: Vec<SliceReport>,
}

impl AuReport {
    /// 从已同步的访问单元生成摘要
    pub fn from_access_unit(au: &AccessUnit) -> Self {
        let nals = au
            .nals
            .iter()
            .map(|nal| NalReport {
                nal_type: nal.header.nal_type.name(),
                type_id: nal.header.nal_type.type_id(),
                layer_id: nal.header.layer_id,
                temporal_id: nal.header.temporal_id(),
                offset: nal.stream_offset,
                size: nal.size,
                error: match &nal.payload {
                    NalPayload::Corrupt(msg) => Some(msg.clone()),
                    _ => None,
                },
            })
            .collect();

        let slices = au
            .slices
            .iter()
            .map(|slice| SliceReport {
                slice_type: slice.header.slice_type.name(),
                address: slice.header.slice_segment_address,
                dependent: slice.header.dependent_slice_segment_flag,
                qp: slice.header.slice_qp,
                ctus: slice.data.ctus.len(),
                cus: slice.data.cus.len(),
                pus: slice.data.pus.len(),
                tus: slice.data.tus.len(),
                coeffs: slice.data.coeffs.len(),
                bins: slice.data.bins,
                l0: slice.lists.l0.iter().map(|r| r.poc).collect(),
                l1: slice.lists.l1.iter().map(|r| r.poc).collect(),
                corrupted: slice.corrupted,
                partial: slice.partial,
            })
            .collect();

        Self {
            index: au.index,
            poc: au.poc,
            incomplete: au.incomplete,
            nal_count: au.stats.nal_count,
            ctu_count: au.stats.ctu_count,
            bins: au.stats.bins,
            nals,
            slices,
        }
    }
}

impl fmt::Display for AuReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.poc {
            Some(poc) => write!(f, "AU #{} POC {}", self.index, poc)?,
            None => write!(f, "AU #{} (无图像)", self.index)?,
        }
        write!(
            f,
            ": {} NAL, {} 条带段, {} CTU, {} bins",
            self.nal_count,
            self.slices.len(),
            self.ctu_count,
            self.bins
        )?;
        if self.incomplete {
            write!(f, " [不完整]")?;
        }
        for nal in &self.nals {
            write!(
                f,
                "\n  {:<12} type={:<2} tid={} offset={} size={}",
                nal.nal_type, nal.type_id, nal.temporal_id, nal.offset, nal.size
            )?;
            if let Some(err) = &nal.error {
                write!(f, " 错误: {}", err)?;
            }
        }
        for slice in &self.slices {
            write!(
                f,
                "\n  slice {} addr={}{} qp={} ctu={} cu={} pu={} tu={} coef={} L0={:?} L1={:?}",
                slice.slice_type,
                slice.address,
                if slice.dependent { " (dep)" } else { "" },
                slice.qp,
                slice.ctus,
                slice.cus,
                slice.pus,
                slice.tus,
                slice.coeffs,
                slice.l0,
                slice.l1
            )?;
            if slice.corrupted {
                write!(f, " [损坏]")?;
            } else if slice.partial {
                write!(f, " [部分]")?;
            }
        }
        Ok(())
    }
}
