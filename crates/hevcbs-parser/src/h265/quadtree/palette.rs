//! palette_coding() (7.3.8.13) 与调色板预测器更新.

use hevcbs_core::{BsError, BsResult};
use log::trace;

use super::scan::traverse_pos;
use super::{CodingUnit, CtuDecoder, PaletteBlock};
use crate::h265::cabac::ctx;
use crate::h265::control::TraceLevel;

impl CtuDecoder<'_> {
    /// 返回调色板数据在输出中的下标
    pub(super) fn palette_coding(&mut self, cu: &CodingUnit) -> BsResult<u32> {
        let sps = self.sps;
        let scc = &sps.scc_ext;
        let log2 = u32::from(cu.log2_size);
        let n = 1u32 << log2;
        let total = (n * n) as usize;
        let num_comps = if sps.chroma_array_type == 0 { 1 } else { 3 };

        // 预测器复用标志
        let pred_size = self.palette_pred.len();
        let mut reuse = vec![false; pred_size];
        let mut num_predicted = 0u32;
        let mut idx = 0usize;
        while idx < pred_size && num_predicted < scc.palette_max_size {
            let run = self.cabac.decode_egk(0)?;
            if run == 1 {
                break;
            }
            if run > 1 {
                idx += run as usize - 1;
            }
            if idx >= pred_size {
                return Err(BsError::syntax("palette_predictor_run 越过预测器末尾"));
            }
            reuse[idx] = true;
            num_predicted += 1;
            idx += 1;
        }

        let num_signalled = if num_predicted < scc.palette_max_size {
            self.cabac.decode_egk(0)?
        } else {
            0
        };
        let current_size = num_predicted + num_signalled;
        if current_size > scc.palette_max_size {
            return Err(BsError::syntax(format!(
                "调色板大小 {} 超过 palette_max_size {}",
                current_size, scc.palette_max_size
            )));
        }

        let mut entries: Vec<[u16; 3]> = self
            .palette_pred
            .iter()
            .zip(&reuse)
            .filter(|(_, r)| **r)
            .map(|(e, _)| *e)
            .collect();
        let mut signalled = vec![[0u16; 3]; num_signalled as usize];
        for c in 0..num_comps {
            let bits = if c == 0 { sps.bit_depth_y } else { sps.bit_depth_c };
            for e in signalled.iter_mut() {
                e[c] = self.cabac.decode_fl(bits)? as u16;
            }
        }
        entries.extend(signalled);

        let escape_present = current_size != 0 && self.cabac.decode_bypass()? == 1;
        let max_index = (current_size + u32::from(escape_present)).saturating_sub(1);

        let mut idc: Vec<u32> = vec![0];
        let mut final_run_copy = false;
        let mut transpose = false;
        let mut num_indices = 1u32;
        if max_index > 0 {
            let rice = 3 + ((max_index + 1) >> 3);
            num_indices = self.decode_coeff_abs_level_remaining(rice)? + 1;
            if num_indices as usize > total {
                return Err(BsError::syntax("num_palette_indices_minus1 超出块大小"));
            }
            idc = Vec::with_capacity(num_indices as usize);
            let mut adjust = 0;
            for _ in 0..num_indices {
                idc.push(if max_index - adjust > 0 {
                    self.cabac.decode_tb(max_index - adjust)?
                } else {
                    0
                });
                adjust = 1;
            }
            final_run_copy = self
                .cabac
                .decode_decision(ctx::COPY_ABOVE_INDICES_FOR_FINAL_RUN_FLAG)?
                == 1;
            transpose = self.cabac.decode_decision(ctx::PALETTE_TRANSPOSE_FLAG)? == 1;
        }

        if escape_present {
            if self.pps.cu_qp_delta_enabled_flag && !self.qp.delta_coded {
                self.decode_cu_qp_delta()?;
            }
            if !cu.transquant_bypass
                && self.sh.cu_chroma_qp_offset_enabled_flag
                && !self.qp.chroma_offset_coded
            {
                self.decode_cu_chroma_qp_offset()?;
            }
        }

        // 索引图
        let mut map = vec![0u8; total];
        let mut copy_above = vec![false; total];
        let raster = |pos: u32| -> usize {
            let (x, y) = traverse_pos(log2, pos, transpose);
            (y * n + x) as usize
        };
        let mut remaining = num_indices;
        let mut scan_pos = 0u32;
        let mut adjusted_ref = max_index + 1;
        while (scan_pos as usize) < total {
            let prev_copy = scan_pos > 0 && copy_above[raster(scan_pos - 1)];
            let last_pos = scan_pos as usize == total - 1;

            let mut is_copy = false;
            if max_index > 0 && scan_pos >= n && !prev_copy {
                if remaining > 0 && !last_pos {
                    is_copy = self
                        .cabac
                        .decode_decision(ctx::COPY_ABOVE_PALETTE_INDICES_FLAG)?
                        == 1;
                } else {
                    is_copy = !(last_pos && remaining > 0);
                }
            }

            let mut cur_index = 0u32;
            let mut idc_value = 0u32;
            if !is_copy {
                let i = (num_indices - remaining) as usize;
                idc_value = idc
                    .get(i)
                    .copied()
                    .ok_or_else(|| BsError::syntax("调色板索引数不足"))?;
                cur_index = idc_value;
                if scan_pos > 0 {
                    adjusted_ref = if prev_copy {
                        u32::from(map[above(log2, scan_pos, transpose)])
                    } else {
                        u32::from(map[raster(scan_pos - 1)])
                    };
                }
                if cur_index >= adjusted_ref {
                    cur_index += 1;
                }
                if cur_index > max_index {
                    return Err(BsError::syntax("调色板索引超出范围"));
                }
            }

            let mut run_minus1 = total as u32 - scan_pos - 1;
            if max_index > 0 {
                if !is_copy {
                    remaining -= 1;
                }
                if remaining > 0 || is_copy != final_run_copy {
                    let max_run = (total as u32 - scan_pos - 1)
                        .checked_sub(remaining + u32::from(final_run_copy))
                        .ok_or_else(|| BsError::syntax("调色板游程越界"))?;
                    run_minus1 = if max_run > 0 {
                        self.decode_palette_run(is_copy, idc_value, max_run)?
                    } else {
                        0
                    };
                }
            }

            for _ in 0..=run_minus1 {
                if scan_pos as usize >= total {
                    return Err(BsError::syntax("调色板游程越过块末尾"));
                }
                let r = raster(scan_pos);
                copy_above[r] = is_copy;
                map[r] = if is_copy {
                    map[above(log2, scan_pos, transpose)]
                } else {
                    cur_index as u8
                };
                scan_pos += 1;
            }
        }

        // 逸出值
        let mut escapes = Vec::new();
        if escape_present {
            let cat = sps.chroma_array_type;
            for c in 0..num_comps {
                let bits = if c == 0 { sps.bit_depth_y } else { sps.bit_depth_c };
                for pos in 0..total as u32 {
                    let (x, y) = traverse_pos(log2, pos, transpose);
                    if u32::from(map[(y * n + x) as usize]) != max_index {
                        continue;
                    }
                    let coded = c == 0
                        || cat == 3
                        || (cat == 1 && x % 2 == 0 && y % 2 == 0)
                        || (cat == 2 && x % 2 == 0);
                    if !coded {
                        continue;
                    }
                    let v = if cu.transquant_bypass {
                        self.cabac.decode_fl(bits)?
                    } else {
                        self.cabac.decode_egk(3)?
                    };
                    escapes.push(
                        u16::try_from(v).map_err(|_| BsError::syntax("palette_escape_val 溢出"))?,
                    );
                }
            }
        }

        self.update_palette_predictor(&entries, &reuse);

        if self.trace.contains(TraceLevel::PALETTE) {
            trace!(
                "调色板 CU ({}, {}) 大小 {} (复用 {}) 逸出={} 转置={} 索引数 {}",
                cu.x,
                cu.y,
                current_size,
                num_predicted,
                escape_present,
                transpose,
                num_indices
            );
        }

        let block = PaletteBlock {
            entries,
            num_predicted,
            escape_present,
            transpose,
            indices: map,
            escapes,
        };
        self.out.palettes.push(block);
        Ok(self.out.palettes.len() as u32 - 1)
    }

    /// palette_run_prefix / palette_run_suffix, 返回 PaletteRunMinus1
    fn decode_palette_run(&mut self, copy: bool, idc: u32, max_run: u32) -> BsResult<u32> {
        let c_max = 32 - max_run.leading_zeros();
        let mut prefix = 0u32;
        while prefix < c_max {
            let bin = if prefix < 3 {
                let inc = if copy {
                    5 + prefix.min(2)
                } else if prefix == 0 {
                    match idc {
                        0 => 0,
                        1 | 2 => 1,
                        _ => 2,
                    }
                } else {
                    2 + prefix
                };
                self.cabac.decode_decision(ctx::PALETTE_RUN_PREFIX + inc as usize)?
            } else {
                self.cabac.decode_bypass()?
            };
            if bin == 0 {
                break;
            }
            prefix += 1;
        }
        if prefix < 2 {
            return Ok(prefix);
        }
        let offset = 1u32 << (prefix - 1);
        if max_run == offset {
            return Ok(offset);
        }
        let suffix_max = if (offset << 1) > max_run {
            max_run - offset
        } else {
            offset - 1
        };
        Ok(offset + self.cabac.decode_tb(suffix_max)?)
    }

    /// 调色板预测器更新 (8.4.4.2.7)
    fn update_palette_predictor(&mut self, current: &[[u16; 3]], reuse: &[bool]) {
        let max = self.sps.palette_max_predictor_size() as usize;
        let mut next: Vec<[u16; 3]> = current.iter().take(max).copied().collect();
        for (e, _) in self.palette_pred.iter().zip(reuse).filter(|(_, r)| !**r) {
            if next.len() >= max {
                break;
            }
            next.push(*e);
        }
        self.palette_pred = next;
    }
}

/// 扫描位置上方 (转置时为左侧) 样本的光栅下标
fn above(log2: u32, pos: u32, transpose: bool) -> usize {
    let n = 1u32 << log2;
    let (x, y) = traverse_pos(log2, pos, transpose);
    let (ax, ay) = if transpose { (x - 1, y) } else { (x, y - 1) };
    (ay * n + ax) as usize
}
