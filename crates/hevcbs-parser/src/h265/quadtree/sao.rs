//! sao() 语法 (7.3.8.3).

use hevcbs_core::BsResult;
use log::trace;

use super::{CtuDecoder, SaoComponent, SaoParams};
use crate::h265::cabac::ctx;
use crate::h265::control::TraceLevel;

impl CtuDecoder<'_> {
    pub(super) fn decode_sao(&mut self, rx: u32, ry: u32) -> BsResult<SaoParams> {
        let layout = self.layout;
        let rs = self.ctb_rs;
        let ts = self.ctb_ts;
        let w = layout.width_ctbs;

        let mut merge_left = false;
        if rx > 0 {
            let in_slice = rs > self.slice_addr_rs
                && self.grid.ctb_slice(rs - 1) == Some(self.slice_addr_rs);
            let in_tile = layout.tile_id(ts) == layout.tile_id_rs(rs - 1);
            if in_slice && in_tile {
                merge_left = self.cabac.decode_decision(ctx::SAO_MERGE_FLAG)? == 1;
            }
        }
        let mut merge_up = false;
        if ry > 0 && !merge_left {
            let in_slice = rs >= w
                && rs - w >= self.slice_addr_rs
                && self.grid.ctb_slice(rs - w) == Some(self.slice_addr_rs);
            let in_tile = layout.tile_id(ts) == layout.tile_id_rs(rs - w);
            if in_slice && in_tile {
                merge_up = self.cabac.decode_decision(ctx::SAO_MERGE_FLAG)? == 1;
            }
        }

        if merge_left || merge_up {
            let src = if merge_left { rs - 1 } else { rs - w };
            let mut sao = self.grid.sao(src).copied().unwrap_or_default();
            sao.merge_left = merge_left;
            sao.merge_up = merge_up;
            return Ok(sao);
        }

        let mut sao = SaoParams::default();
        let num_comps = if self.sps.chroma_array_type != 0 { 3 } else { 1 };
        for c in 0..num_comps {
            let enabled = if c == 0 {
                self.sh.sao_luma_flag
            } else {
                self.sh.sao_chroma_flag
            };
            if !enabled {
                continue;
            }
            let mut comp = SaoComponent::default();
            comp.type_idx = if c == 2 {
                sao.comps[1].type_idx
            } else {
                self.decode_sao_type()?
            };
            if comp.type_idx != 0 {
                let bit_depth = if c == 0 {
                    self.sps.bit_depth_y
                } else {
                    self.sps.bit_depth_c
                };
                let c_max = (1u32 << (bit_depth.min(10) - 5)) - 1;
                let scale = if c == 0 {
                    self.pps.range_ext.log2_sao_offset_scale_luma
                } else {
                    self.pps.range_ext.log2_sao_offset_scale_chroma
                };
                let mut abs = [0i32; 4];
                for a in &mut abs {
                    *a = self.cabac.decode_tu_bypass(c_max)? as i32;
                }
                if comp.type_idx == 1 {
                    for (i, a) in abs.iter().enumerate() {
                        let neg = *a != 0 && self.cabac.decode_bypass()? == 1;
                        comp.offsets[i] = ((if neg { -a } else { *a }) << scale) as i16;
                    }
                    comp.band_position = self.cabac.decode_fl(5)? as u8;
                } else {
                    comp.offsets = [
                        (abs[0] << scale) as i16,
                        (abs[1] << scale) as i16,
                        (-(abs[2] << scale)) as i16,
                        (-(abs[3] << scale)) as i16,
                    ];
                    comp.eo_class = if c == 2 {
                        sao.comps[1].eo_class
                    } else {
                        self.cabac.decode_fl(2)? as u8
                    };
                }
            }
            sao.comps[c] = comp;
        }

        if self.trace.contains(TraceLevel::SAO) {
            trace!("SAO ({}, {}): {:?}", rx, ry, sao.comps);
        }
        Ok(sao)
    }

    /// sao_type_idx: TR cMax=2, 首 bin 用上下文, 其余旁路
    fn decode_sao_type(&mut self) -> BsResult<u8> {
        if self.cabac.decode_decision(ctx::SAO_TYPE_IDX)? == 0 {
            return Ok(0);
        }
        Ok(if self.cabac.decode_bypass()? == 0 { 1 } else { 2 })
    }
}
