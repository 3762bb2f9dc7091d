//! coding_quadtree() / coding_unit(): 划分, 预测模式, 帧内模式, PCM 与量化参数.

use hevcbs_core::{BsError, BsResult};
use log::trace;

use super::transform::TreeNode;
use super::{CodingUnit, CtuDecoder, PartMode, PredMode};
use crate::h265::cabac::ctx;
use crate::h265::control::TraceLevel;

/// 4:2:2 色度帧内模式映射 (表 8-3)
const MODE_422: [u8; 35] = [
    0, 1, 2, 2, 2, 2, 3, 5, 7, 8, 10, 11, 13, 15, 16, 18, 19, 20, 21, 22, 23, 23, 24, 24, 25, 25,
    26, 27, 27, 28, 28, 29, 29, 30, 31,
];

const INTRA_PLANAR: u8 = 0;
const INTRA_DC: u8 = 1;
const INTRA_ANGULAR26: u8 = 26;

/// qPi 到 qPCb / qPCr 的映射 (表 8-10)
pub(crate) fn chroma_qp_mapping(qpi: i32, chroma_array_type: u32) -> i32 {
    const TABLE: [i32; 14] = [29, 30, 31, 32, 33, 33, 34, 34, 35, 35, 36, 36, 37, 37];
    if chroma_array_type != 1 {
        return qpi.min(51);
    }
    match qpi {
        ..=29 => qpi,
        30..=43 => TABLE[(qpi - 30) as usize],
        _ => qpi - 6,
    }
}

/// 最可能模式列表 (8.4.2)
pub(crate) fn mpm_candidates(cand_a: u8, cand_b: u8) -> [u8; 3] {
    if cand_a == cand_b {
        if cand_a < 2 {
            [INTRA_PLANAR, INTRA_DC, INTRA_ANGULAR26]
        } else {
            [
                cand_a,
                2 + ((cand_a + 29) % 32),
                2 + ((cand_a - 2 + 1) % 32),
            ]
        }
    } else {
        let c = if cand_a != INTRA_PLANAR && cand_b != INTRA_PLANAR {
            INTRA_PLANAR
        } else if cand_a != INTRA_DC && cand_b != INTRA_DC {
            INTRA_DC
        } else {
            INTRA_ANGULAR26
        };
        [cand_a, cand_b, c]
    }
}

/// 由 rem_intra_luma_pred_mode 还原模式
pub(crate) fn mode_from_rem(rem: u8, mut list: [u8; 3]) -> u8 {
    list.sort_unstable();
    let mut mode = rem;
    for c in list {
        if mode >= c {
            mode += 1;
        }
    }
    mode
}

impl CtuDecoder<'_> {
    // ============================================================
    // 编码四叉树
    // ============================================================

    pub(super) fn coding_quadtree(&mut self, x0: u32, y0: u32, log2: u32, depth: u32) -> BsResult<()> {
        let sps = self.sps;
        let pps = self.pps;
        let size = 1u32 << log2;

        let split = if x0 + size <= sps.pic_width_in_luma_samples
            && y0 + size <= sps.pic_height_in_luma_samples
            && log2 > sps.min_cb_log2
        {
            let mut inc = 0;
            if self.grid.available(x0, y0, x0 as i32 - 1, y0 as i32)
                && u32::from(self.grid.at(x0 - 1, y0).ct_depth) > depth
            {
                inc += 1;
            }
            if self.grid.available(x0, y0, x0 as i32, y0 as i32 - 1)
                && u32::from(self.grid.at(x0, y0 - 1).ct_depth) > depth
            {
                inc += 1;
            }
            self.cabac.decode_decision(ctx::SPLIT_CU_FLAG + inc)? == 1
        } else {
            log2 > sps.min_cb_log2
        };

        if log2 + pps.diff_cu_qp_delta_depth >= sps.ctb_log2 {
            self.start_qg(x0, y0);
        }
        if self.sh.cu_chroma_qp_offset_enabled_flag
            && log2 + pps.range_ext.diff_cu_chroma_qp_offset_depth >= sps.ctb_log2
        {
            self.qp.chroma_offset_coded = false;
        }

        if split {
            let half = size >> 1;
            for (dx, dy) in [(0, 0), (half, 0), (0, half), (half, half)] {
                let (x, y) = (x0 + dx, y0 + dy);
                if x < sps.pic_width_in_luma_samples && y < sps.pic_height_in_luma_samples {
                    self.coding_quadtree(x, y, log2 - 1, depth + 1)?;
                }
            }
            Ok(())
        } else {
            self.coding_unit(x0, y0, log2, depth)
        }
    }

    // ============================================================
    // 编码单元
    // ============================================================

    fn coding_unit(&mut self, x0: u32, y0: u32, log2: u32, depth: u32) -> BsResult<()> {
        let sps = self.sps;
        let pps = self.pps;
        let n = 1u32 << log2;
        let mut cu = CodingUnit {
            x: x0,
            y: y0,
            log2_size: log2 as u8,
            ct_depth: depth as u8,
            pus: self.out.pus.len() as u32..self.out.pus.len() as u32,
            tus: self.out.tus.len() as u32..self.out.tus.len() as u32,
            pcm_samples: self.out.pcm_samples.len() as u32..self.out.pcm_samples.len() as u32,
            ..Default::default()
        };
        self.update_qp_y();

        if pps.transquant_bypass_enabled_flag {
            cu.transquant_bypass = self.cabac.decode_decision(ctx::CU_TRANSQUANT_BYPASS_FLAG)? == 1;
        }

        let intra_slice = self.sh.slice_type.is_intra();
        let mut skip = false;
        if !intra_slice {
            let mut inc = 0;
            if self.grid.available(x0, y0, x0 as i32 - 1, y0 as i32) && self.grid.at(x0 - 1, y0).skip {
                inc += 1;
            }
            if self.grid.available(x0, y0, x0 as i32, y0 as i32 - 1) && self.grid.at(x0, y0 - 1).skip {
                inc += 1;
            }
            skip = self.cabac.decode_decision(ctx::CU_SKIP_FLAG + inc)? == 1;
        }

        cu.pred_mode = if skip {
            PredMode::Skip
        } else if intra_slice || self.cabac.decode_decision(ctx::PRED_MODE_FLAG)? == 1 {
            PredMode::Intra
        } else {
            PredMode::Inter
        };
        let pred_mode = cu.pred_mode;
        let qp_y = self.qp.qp_y as i8;
        self.grid.fill(x0, y0, n, n, move |b| {
            b.ct_depth = depth as u8;
            b.pred_mode = pred_mode;
            b.skip = skip;
            b.intra_mode = INTRA_DC;
            b.dc_fallback = false;
            b.qp_y = qp_y;
            b.motion = Default::default();
        });

        if skip {
            self.prediction_unit(&cu, (x0, y0, n, n), 0)?;
        } else {
            let palette = sps.scc_ext.palette_mode_enabled_flag
                && cu.pred_mode == PredMode::Intra
                && log2 <= sps.max_tb_log2
                && self.cabac.decode_decision(ctx::PALETTE_MODE_FLAG)? == 1;

            if palette {
                self.grid.fill(x0, y0, n, n, |b| b.dc_fallback = true);
                cu.palette = Some(self.palette_coding(&cu)?);
            } else {
                if cu.pred_mode != PredMode::Intra || log2 == sps.min_cb_log2 {
                    cu.part_mode = self.decode_part_mode(cu.pred_mode == PredMode::Intra, log2)?;
                }

                if cu.pred_mode == PredMode::Intra {
                    if cu.part_mode == PartMode::Part2Nx2N
                        && sps.pcm_enabled_flag
                        && log2 >= sps.pcm_log2_min
                        && log2 <= sps.pcm_log2_max
                    {
                        cu.pcm = self.cabac.decode_terminate()? == 1;
                    }
                    if cu.pcm {
                        self.grid.fill(x0, y0, n, n, |b| b.dc_fallback = true);
                        self.pcm_sample(&mut cu)?;
                    } else {
                        self.intra_modes(&mut cu)?;
                    }
                } else {
                    for (i, (px, py, w, h)) in cu.part_mode.partitions(n).into_iter().enumerate() {
                        self.prediction_unit(&cu, (x0 + px, y0 + py, w, h), i as u32)?;
                    }
                }

                if !cu.pcm {
                    let root_cbf = if cu.pred_mode != PredMode::Intra
                        && !(cu.part_mode == PartMode::Part2Nx2N
                            && self.out.pus.get(cu.pus.start as usize).is_some_and(|p| p.merge_flag))
                    {
                        self.cabac.decode_decision(ctx::RQT_ROOT_CBF)? == 1
                    } else {
                        true
                    };
                    if root_cbf {
                        let intra_split = cu.pred_mode == PredMode::Intra && cu.part_mode == PartMode::PartNxN;
                        let max_depth = if cu.pred_mode == PredMode::Intra {
                            sps.max_transform_hierarchy_depth_intra + u32::from(intra_split)
                        } else {
                            sps.max_transform_hierarchy_depth_inter
                        };
                        self.transform_tree(&cu, max_depth, TreeNode::root(x0, y0, log2))?;
                    }
                }
            }
        }

        cu.pus.end = self.out.pus.len() as u32;
        cu.tus.end = self.out.tus.len() as u32;
        cu.pcm_samples.end = self.out.pcm_samples.len() as u32;
        cu.qp_y = self.qp.qp_y;
        let qp_y = self.qp.qp_y as i8;
        self.grid.fill(x0, y0, n, n, move |b| b.qp_y = qp_y);

        if self.trace.contains(TraceLevel::CU) {
            trace!(
                "CU ({}, {}) {}x{} {:?} {:?} qp={} bypass={} pcm={} palette={}",
                x0,
                y0,
                n,
                n,
                cu.pred_mode,
                cu.part_mode,
                cu.qp_y,
                cu.transquant_bypass,
                cu.pcm,
                cu.palette.is_some()
            );
        }
        self.out.cus.push(cu);
        Ok(())
    }

    /// part_mode 二值化 (9.3.3.7 与表 9-43)
    fn decode_part_mode(&mut self, intra: bool, log2: u32) -> BsResult<PartMode> {
        let sps = self.sps;
        if self.cabac.decode_decision(ctx::PART_MODE)? == 1 {
            return Ok(PartMode::Part2Nx2N);
        }
        if intra {
            return Ok(PartMode::PartNxN);
        }
        let bin1 = self.cabac.decode_decision(ctx::PART_MODE + 1)?;
        if log2 == sps.min_cb_log2 {
            if bin1 == 1 {
                return Ok(PartMode::Part2NxN);
            }
            if log2 == 3 {
                return Ok(PartMode::PartNx2N);
            }
            return Ok(if self.cabac.decode_decision(ctx::PART_MODE + 2)? == 1 {
                PartMode::PartNx2N
            } else {
                PartMode::PartNxN
            });
        }
        if !sps.amp_enabled_flag {
            return Ok(if bin1 == 1 {
                PartMode::Part2NxN
            } else {
                PartMode::PartNx2N
            });
        }
        let bin2 = self.cabac.decode_decision(ctx::PART_MODE + 3)?;
        Ok(match (bin1, bin2) {
            (1, 1) => PartMode::Part2NxN,
            (0, 1) => PartMode::PartNx2N,
            (1, _) => {
                if self.cabac.decode_bypass()? == 0 {
                    PartMode::Part2NxnU
                } else {
                    PartMode::Part2NxnD
                }
            }
            _ => {
                if self.cabac.decode_bypass()? == 0 {
                    PartMode::PartnLx2N
                } else {
                    PartMode::PartnRx2N
                }
            }
        })
    }

    // ============================================================
    // 帧内模式
    // ============================================================

    /// 邻块的候选模式, 不可用 / 非帧内 / PCM / 调色板时为 DC
    fn neighbour_intra_mode(&self, x: u32, y: u32, x_n: i32, y_n: i32) -> u8 {
        if !self.grid.available(x, y, x_n, y_n) {
            return INTRA_DC;
        }
        let b = self.grid.at(x_n as u32, y_n as u32);
        if b.pred_mode != PredMode::Intra || b.dc_fallback {
            INTRA_DC
        } else {
            b.intra_mode
        }
    }

    fn intra_modes(&mut self, cu: &mut CodingUnit) -> BsResult<()> {
        let n = 1u32 << cu.log2_size;
        let (parts, pb) = if cu.part_mode == PartMode::PartNxN {
            (4usize, n / 2)
        } else {
            (1usize, n)
        };

        let mut prev_flag = [false; 4];
        for f in prev_flag.iter_mut().take(parts) {
            *f = self.cabac.decode_decision(ctx::PREV_INTRA_LUMA_PRED_FLAG)? == 1;
        }

        let ctb_mask = !((1u32 << self.sps.ctb_log2) - 1);
        for i in 0..parts {
            let x = cu.x + (i as u32 % 2) * pb;
            let y = cu.y + (i as u32 / 2) * pb;
            let cand_a = self.neighbour_intra_mode(x, y, x as i32 - 1, y as i32);
            let cand_b = if y == 0 || y - 1 < (y & ctb_mask) {
                INTRA_DC
            } else {
                self.neighbour_intra_mode(x, y, x as i32, y as i32 - 1)
            };
            let list = mpm_candidates(cand_a, cand_b);
            let mode = if prev_flag[i] {
                let idx = self.cabac.decode_tu_bypass(2)?;
                list[idx as usize]
            } else {
                let rem = self.cabac.decode_fl(5)? as u8;
                mode_from_rem(rem, list)
            };
            cu.intra_luma[i] = mode;
            self.grid.fill(x, y, pb, pb, move |b| b.intra_mode = mode);
        }
        if parts == 1 {
            cu.intra_luma = [cu.intra_luma[0]; 4];
        }

        let cat = self.sps.chroma_array_type;
        if cat == 3 {
            for i in 0..parts {
                let syntax = self.decode_intra_chroma_syntax()?;
                cu.intra_chroma_syntax[i] = syntax;
                cu.intra_chroma[i] = derive_chroma_mode(syntax, cu.intra_luma[i], cat);
            }
            if parts == 1 {
                cu.intra_chroma = [cu.intra_chroma[0]; 4];
                cu.intra_chroma_syntax = [cu.intra_chroma_syntax[0]; 4];
            }
        } else if cat != 0 {
            let syntax = self.decode_intra_chroma_syntax()?;
            let mode = derive_chroma_mode(syntax, cu.intra_luma[0], cat);
            cu.intra_chroma_syntax = [syntax; 4];
            cu.intra_chroma = [mode; 4];
        }
        Ok(())
    }

    /// intra_chroma_pred_mode: 首 bin 用上下文, 为 0 时取 4, 否则再读 2 个旁路 bin
    fn decode_intra_chroma_syntax(&mut self) -> BsResult<u8> {
        if self.cabac.decode_decision(ctx::INTRA_CHROMA_PRED_MODE)? == 0 {
            return Ok(4);
        }
        Ok(self.cabac.decode_bypass_bins(2)? as u8)
    }

    // ============================================================
    // PCM
    // ============================================================

    fn pcm_sample(&mut self, cu: &mut CodingUnit) -> BsResult<()> {
        let sps = self.sps;
        self.cabac.finish()?;
        let n = 1u32 << cu.log2_size;
        let luma_bits = u32::from(sps.pcm_sample_bit_depth_luma_minus1) + 1;
        let chroma_bits = u32::from(sps.pcm_sample_bit_depth_chroma_minus1) + 1;
        let luma = n * n;
        let chroma = if sps.chroma_array_type != 0 {
            2 * (n / sps.sub_width_c) * (n / sps.sub_height_c)
        } else {
            0
        };
        let cursor = self.cabac.cursor_mut();
        self.out.pcm_samples.reserve((luma + chroma) as usize);
        for _ in 0..luma {
            self.out.pcm_samples.push(cursor.get_bits(luma_bits)? as u16);
        }
        for _ in 0..chroma {
            self.out.pcm_samples.push(cursor.get_bits(chroma_bits)? as u16);
        }
        self.cabac.init_engine()?;
        if self.trace.contains(TraceLevel::CU) {
            trace!("PCM ({}, {}) 样本 {} + {}", cu.x, cu.y, luma, chroma);
        }
        Ok(())
    }

    // ============================================================
    // 量化参数 (8.6.1)
    // ============================================================

    /// 进入新的量化组: 推导 qPY_PRED, 清除 CuQpDeltaVal
    fn start_qg(&mut self, x: u32, y: u32) {
        let prev = if self.qp.first_qg {
            self.qp.slice_qp
        } else {
            self.qp.qp_y
        };
        self.qp.first_qg = false;
        self.qp.prev_qp_y = prev;

        let mask = !((1u32 << self.sps.ctb_log2) - 1);
        let neighbour = |xn: i32, yn: i32| -> i32 {
            if xn < 0 || yn < 0 {
                return prev;
            }
            let (xu, yu) = (xn as u32, yn as u32);
            if (xu & mask) != (x & mask) || (yu & mask) != (y & mask) {
                return prev;
            }
            if !self.grid.available(x, y, xn, yn) {
                return prev;
            }
            i32::from(self.grid.at(xu, yu).qp_y)
        };
        let qa = neighbour(x as i32 - 1, y as i32);
        let qb = neighbour(x as i32, y as i32 - 1);
        self.qp.pred = (qa + qb + 1) >> 1;
        self.qp.delta_coded = false;
        self.qp.delta = 0;
    }

    /// 由 qPY_PRED 与 CuQpDeltaVal 计算 QpY
    pub(super) fn update_qp_y(&mut self) {
        let off = self.sps.qp_bd_offset_y;
        self.qp.qp_y = (self.qp.pred + self.qp.delta + 52 + 2 * off).rem_euclid(52 + off) - off;
    }

    /// 当前 CU 的 (qPCb, qPCr)
    pub(super) fn chroma_qps(&self) -> (i32, i32) {
        let off_c = self.sps.qp_bd_offset_c;
        let cat = self.sps.chroma_array_type;
        let calc = |pps_off: i32, slice_off: i32, cu_off: i32| {
            let qpi = (self.qp.qp_y + pps_off + slice_off + cu_off).clamp(-off_c, 57);
            chroma_qp_mapping(qpi, cat)
        };
        (
            calc(self.pps.cb_qp_offset, self.sh.slice_cb_qp_offset, self.qp.cu_offset_cb),
            calc(self.pps.cr_qp_offset, self.sh.slice_cr_qp_offset, self.qp.cu_offset_cr),
        )
    }

    /// cu_qp_delta_abs 与符号 (9.3.3.10)
    pub(super) fn decode_cu_qp_delta(&mut self) -> BsResult<()> {
        let mut prefix = 0;
        while prefix < 5 {
            let inc = if prefix == 0 { 0 } else { 1 };
            if self.cabac.decode_decision(ctx::CU_QP_DELTA_ABS + inc)? == 0 {
                break;
            }
            prefix += 1;
        }
        let abs = if prefix == 5 {
            prefix + self.cabac.decode_egk(0)?
        } else {
            prefix
        };
        let mut delta = abs as i32;
        if abs > 0 && self.cabac.decode_bypass()? == 1 {
            delta = -delta;
        }
        let off = self.sps.qp_bd_offset_y;
        if delta < -(26 + off / 2) || delta > 25 + off / 2 {
            return Err(BsError::syntax(format!("CuQpDeltaVal {} 超出范围", delta)));
        }
        self.qp.delta_coded = true;
        self.qp.delta = delta;
        self.update_qp_y();
        if self.trace.contains(TraceLevel::TU) {
            trace!("cu_qp_delta {} -> QpY {}", delta, self.qp.qp_y);
        }
        Ok(())
    }

    /// cu_chroma_qp_offset_flag / idx
    pub(super) fn decode_cu_chroma_qp_offset(&mut self) -> BsResult<()> {
        let ext = &self.pps.range_ext;
        let flag = self.cabac.decode_decision(ctx::CU_CHROMA_QP_OFFSET_FLAG)? == 1;
        if flag {
            let len = ext.cb_qp_offset_list.len() as u32;
            let idx = if len > 1 {
                self.cabac.decode_tu_ctx(ctx::CU_CHROMA_QP_OFFSET_IDX, len - 1)?
            } else {
                0
            } as usize;
            self.qp.cu_offset_cb = ext.cb_qp_offset_list.get(idx).copied().unwrap_or(0);
            self.qp.cu_offset_cr = ext.cr_qp_offset_list.get(idx).copied().unwrap_or(0);
        } else {
            self.qp.cu_offset_cb = 0;
            self.qp.cu_offset_cr = 0;
        }
        self.qp.chroma_offset_coded = true;
        Ok(())
    }
}

/// 色度帧内模式推导 (8.4.3)
pub(crate) fn derive_chroma_mode(syntax: u8, luma: u8, chroma_array_type: u32) -> u8 {
    const CANDIDATES: [u8; 4] = [INTRA_PLANAR, INTRA_ANGULAR26, 10, INTRA_DC];
    let mode = match syntax {
        4 => luma,
        s => {
            let c = CANDIDATES[s as usize & 3];
            if c == luma { 34 } else { c }
        }
    };
    if chroma_array_type == 2 {
        MODE_422[mode as usize]
    } else {
        mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpm_list() {
        assert_eq!(mpm_candidates(1, 1), [0, 1, 26]);
        assert_eq!(mpm_candidates(0, 0), [0, 1, 26]);
        assert_eq!(mpm_candidates(10, 10), [10, 9, 11]);
        assert_eq!(mpm_candidates(2, 2), [2, 33, 3]);
        assert_eq!(mpm_candidates(34, 34), [34, 33, 3]);
        assert_eq!(mpm_candidates(10, 26), [10, 26, 0]);
        assert_eq!(mpm_candidates(0, 26), [0, 26, 1]);
        assert_eq!(mpm_candidates(0, 1), [0, 1, 26]);
    }

    #[test]
    fn test_rem_mode_skips_candidates() {
        // 候选 {0, 1, 26}: rem 0 -> 2, rem 23 -> 25, rem 24 -> 27
        assert_eq!(mode_from_rem(0, [0, 1, 26]), 2);
        assert_eq!(mode_from_rem(23, [26, 0, 1]), 25);
        assert_eq!(mode_from_rem(24, [0, 1, 26]), 27);
        assert_eq!(mode_from_rem(31, [0, 1, 26]), 34);
    }

    #[test]
    fn test_chroma_mode_derivation() {
        assert_eq!(derive_chroma_mode(4, 17, 1), 17);
        assert_eq!(derive_chroma_mode(0, 5, 1), 0);
        // 与亮度模式相同时替换为 34
        assert_eq!(derive_chroma_mode(1, 26, 1), 34);
        assert_eq!(derive_chroma_mode(2, 10, 3), 34);
        // 4:2:2 映射
        assert_eq!(derive_chroma_mode(1, 0, 2), 26);
        assert_eq!(derive_chroma_mode(2, 0, 2), 10);
        assert_eq!(derive_chroma_mode(4, 13, 2), 15);
        assert_eq!(derive_chroma_mode(4, 34, 2), 31);
    }

    #[test]
    fn test_chroma_qp_table() {
        assert_eq!(chroma_qp_mapping(29, 1), 29);
        assert_eq!(chroma_qp_mapping(30, 1), 29);
        assert_eq!(chroma_qp_mapping(43, 1), 37);
        assert_eq!(chroma_qp_mapping(44, 1), 38);
        assert_eq!(chroma_qp_mapping(57, 1), 51);
        assert_eq!(chroma_qp_mapping(-6, 1), -6);
        assert_eq!(chroma_qp_mapping(55, 3), 51);
        assert_eq!(chroma_qp_mapping(40, 2), 40);
    }
}
