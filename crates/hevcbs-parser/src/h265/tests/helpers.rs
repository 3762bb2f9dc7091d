use super::super::{AccessUnit, ParseMode, Parser, ParserConfig};
use crate::synth::{PictureSpec, StreamBuilder, StreamParams};

pub fn config(mode: ParseMode) -> ParserConfig {
    ParserConfig {
        mode,
        threads: 4,
        ..Default::default()
    }
}

/// 解析整个码流并同步每个访问单元
pub fn parse_all(data: Vec<u8>, mode: ParseMode) -> Vec<AccessUnit> {
    let mut parser = Parser::from_bytes(data, config(mode)).expect("解析器创建失败");
    let mut out = Vec::new();
    while let Some(mut au) = parser.parse_next_au().expect("访问单元解析失败") {
        assert!(parser.sync(&mut au).is_ok(), "AU {} 同步失败", au.index);
        out.push(au);
    }
    out
}

/// 参数集 + 给定图像序列
pub fn build_stream(params: StreamParams, pictures: &[PictureSpec]) -> Vec<u8> {
    let mut builder = StreamBuilder::new(params);
    builder.parameter_sets();
    for pic in pictures {
        builder.picture(pic);
    }
    builder.into_bytes()
}

/// 与解码模式无关的访问单元摘要
#[derive(Debug, PartialEq, Eq)]
pub struct AuSummary {
    pub poc: Option<i32>,
    pub nal_count: usize,
    pub incomplete: bool,
    pub slices: Vec<SliceSummary>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SliceSummary {
    pub address: u32,
    pub ctus_ts: Vec<u32>,
    pub cu_count: usize,
    pub pu_count: usize,
    pub levels: Vec<i32>,
    pub bins: u64,
    pub corrupted: bool,
    pub partial: bool,
}

pub fn summarize(au: &AccessUnit) -> AuSummary {
    AuSummary {
        poc: au.poc,
        nal_count: au.nals.len(),
        incomplete: au.incomplete,
        slices: au
            .slices
            .iter()
            .map(|s| SliceSummary {
                address: s.header.slice_segment_address,
                ctus_ts: s.data.ctus.iter().map(|c| c.addr_ts).collect(),
                cu_count: s.data.cus.len(),
                pu_count: s.data.pus.len(),
                levels: s.data.coeffs.iter().map(|c| c.level).collect(),
                bins: s.data.bins,
                corrupted: s.corrupted,
                partial: s.partial,
            })
            .collect(),
    }
}
