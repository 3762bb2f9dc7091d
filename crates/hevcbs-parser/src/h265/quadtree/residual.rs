//! residual_coding() (7.3.8.11) 与系数相关 bin 的上下文推导 (9.3.4.2.4 ~ 9.3.4.2.7).

use hevcbs_core::{BsError, BsResult};
use log::trace;

use super::scan::{SCAN_DIAG, SCAN_HORIZ, SCAN_VERT, scan_order};
use super::transform::part_index;
use super::{CodingUnit, Coeff, CtuDecoder, PredMode, ResidualBlock};
use crate::h265::cabac::ctx;
use crate::h265::control::TraceLevel;

/// 4x4 块 sig_coeff_flag 的 ctxIdxMap
const CTX_IDX_MAP: [u8; 16] = [0, 1, 4, 5, 2, 3, 4, 5, 6, 6, 8, 8, 7, 7, 8, 8];

/// 单个子块最多解码的 greater1 标志数
const MAX_GREATER1: usize = 8;

/// 帧内模式决定的扫描类型 (7.4.9.11)
pub(crate) fn scan_idx_for(log2: u32, c_idx: u32, chroma_array_type: u32, intra_mode: u8) -> usize {
    if !(log2 == 2 || (log2 == 3 && (c_idx == 0 || chroma_array_type == 3))) {
        return SCAN_DIAG;
    }
    match intra_mode {
        6..=14 => SCAN_VERT,
        22..=30 => SCAN_HORIZ,
        _ => SCAN_DIAG,
    }
}

/// 最后有效系数前缀的 (偏移, 移位)
pub(crate) fn last_prefix_ctx(log2: u32, luma: bool) -> (usize, u32) {
    if luma {
        ((3 * (log2 - 2) + ((log2 - 1) >> 2)) as usize, (log2 + 1) >> 2)
    } else {
        (15, log2 - 2)
    }
}

/// 由前缀与后缀还原最后有效系数的坐标分量
fn last_position(prefix: u32, suffix: u32) -> u32 {
    if prefix <= 3 {
        prefix
    } else {
        (1 << ((prefix >> 1) - 1)) * (2 + (prefix & 1)) + suffix
    }
}

/// sig_coeff_flag 的 sigCtx (不含色度偏移 27)
pub(crate) fn sig_ctx(log2: u32, luma: bool, scan_idx: usize, pos: (u32, u32), prev_csbf: u32) -> usize {
    let (x_c, y_c) = pos;
    if log2 == 2 {
        return CTX_IDX_MAP[((y_c << 2) + x_c) as usize] as usize;
    }
    if x_c + y_c == 0 {
        return 0;
    }
    let (x_p, y_p) = (x_c & 3, y_c & 3);
    let mut sig = match prev_csbf {
        0 => match x_p + y_p {
            0 => 2,
            1 | 2 => 1,
            _ => 0,
        },
        1 => match y_p {
            0 => 2,
            1 => 1,
            _ => 0,
        },
        2 => match x_p {
            0 => 2,
            1 => 1,
            _ => 0,
        },
        _ => 2,
    };
    if luma {
        if (x_c >> 2) + (y_c >> 2) > 0 {
            sig += 3;
        }
        sig += if log2 == 3 {
            if scan_idx == SCAN_DIAG { 9 } else { 15 }
        } else {
            21
        };
    } else {
        sig += if log2 == 3 { 9 } else { 12 };
    }
    sig
}

/// 每个子块的系数解码参数
struct BlockParams {
    luma: bool,
    log2: u32,
    scan_idx: usize,
    /// transform_skip_context_enabled_flag 生效
    ts_context: bool,
    sign_hiding_allowed: bool,
    stat_idx: usize,
    persistent_rice: bool,
    align: bool,
}

impl CtuDecoder<'_> {
    pub(super) fn residual_coding(
        &mut self,
        cu: &CodingUnit,
        x0: u32,
        y0: u32,
        log2: u32,
        c_idx: u32,
    ) -> BsResult<()> {
        let sps = self.sps;
        let pps = self.pps;
        let ext = &sps.range_ext;
        if ext.extended_precision_processing_flag {
            return Err(BsError::NotImplemented(
                "extended_precision_processing_flag".into(),
            ));
        }
        let luma = c_idx == 0;
        let bypass = cu.transquant_bypass;
        let coeff_start = self.out.coeffs.len() as u32;
        let comp_inc = if luma { 0 } else { 1 };

        let mut transform_skip = false;
        if pps.transform_skip_enabled_flag
            && !bypass
            && log2 <= pps.range_ext.log2_max_transform_skip_block_size_minus2 + 2
        {
            transform_skip =
                self.cabac.decode_decision(ctx::TRANSFORM_SKIP_FLAG + comp_inc)? == 1;
        }

        let mut explicit_rdpcm = None;
        if cu.pred_mode == PredMode::Inter
            && ext.explicit_rdpcm_enabled_flag
            && (transform_skip || bypass)
            && self.cabac.decode_decision(ctx::EXPLICIT_RDPCM_FLAG + comp_inc)? == 1
        {
            explicit_rdpcm =
                Some(self.cabac.decode_decision(ctx::EXPLICIT_RDPCM_DIR_FLAG + comp_inc)? as u8);
        }

        // 最后有效系数位置
        let c_max = (log2 << 1) - 1;
        let (offset, shift) = last_prefix_ctx(log2, luma);
        let prefix_x = self.decode_last_prefix(ctx::LAST_SIG_COEFF_X_PREFIX + offset, shift, c_max)?;
        let prefix_y = self.decode_last_prefix(ctx::LAST_SIG_COEFF_Y_PREFIX + offset, shift, c_max)?;
        let suffix_x = if prefix_x > 3 {
            self.cabac.decode_fl((prefix_x >> 1) - 1)?
        } else {
            0
        };
        let suffix_y = if prefix_y > 3 {
            self.cabac.decode_fl((prefix_y >> 1) - 1)?
        } else {
            0
        };
        let mut last_x = last_position(prefix_x, suffix_x);
        let mut last_y = last_position(prefix_y, suffix_y);

        let part = part_index(cu, x0, y0);
        let intra_mode = if luma {
            cu.intra_luma[part]
        } else {
            cu.intra_chroma[part]
        };
        let scan_idx = if cu.pred_mode == PredMode::Intra {
            scan_idx_for(log2, c_idx, sps.chroma_array_type, intra_mode)
        } else {
            SCAN_DIAG
        };
        if scan_idx == SCAN_VERT {
            std::mem::swap(&mut last_x, &mut last_y);
        }
        let size = 1u32 << log2;
        if last_x >= size || last_y >= size {
            return Err(BsError::syntax(format!(
                "最后有效系数 ({}, {}) 超出 {}x{} 块",
                last_x, last_y, size, size
            )));
        }

        let implicit_rdpcm = cu.pred_mode == PredMode::Intra
            && ext.implicit_rdpcm_enabled_flag
            && transform_skip
            && (intra_mode == 10 || intra_mode == 26);
        let params = BlockParams {
            luma,
            log2,
            scan_idx,
            ts_context: ext.transform_skip_context_enabled_flag && (transform_skip || bypass),
            sign_hiding_allowed: pps.sign_data_hiding_enabled_flag
                && !bypass
                && !implicit_rdpcm
                && explicit_rdpcm.is_none(),
            stat_idx: if luma { 2 } else { 0 } + usize::from(transform_skip || bypass),
            persistent_rice: ext.persistent_rice_adaptation_enabled_flag,
            align: ext.cabac_bypass_alignment_enabled_flag,
        };

        self.decode_sub_blocks(&params, (last_x, last_y))?;

        let block = ResidualBlock {
            c_idx: c_idx as u8,
            x: x0,
            y: y0,
            log2_size: log2 as u8,
            scan_idx: scan_idx as u8,
            transform_skip,
            explicit_rdpcm,
            coeffs: coeff_start..self.out.coeffs.len() as u32,
        };
        if self.trace.contains(TraceLevel::RESIDUAL) {
            trace!(
                "残差 c={} ({}, {}) {}x{} scan={} ts={} last=({}, {}) 系数 {}",
                c_idx,
                x0,
                y0,
                size,
                size,
                scan_idx,
                transform_skip,
                last_x,
                last_y,
                block.coeffs.len()
            );
        }
        if self.trace.contains(TraceLevel::COEF) {
            let coeffs = &self.out.coeffs[block.coeffs.start as usize..];
            trace!("系数: {:?}", coeffs.iter().map(|c| (c.pos, c.level)).collect::<Vec<_>>());
        }
        self.out.residuals.push(block);
        Ok(())
    }

    fn decode_last_prefix(&mut self, base: usize, shift: u32, c_max: u32) -> BsResult<u32> {
        let mut v = 0;
        while v < c_max
            && self
                .cabac
                .decode_decision(base + (v >> shift) as usize)?
                == 1
        {
            v += 1;
        }
        Ok(v)
    }

    /// 按逆扫描序解码全部子块, 非零系数追加到输出
    fn decode_sub_blocks(&mut self, p: &BlockParams, last: (u32, u32)) -> BsResult<()> {
        let log2_sb = p.log2 - 2;
        let sb_width = 1usize << log2_sb;
        let sb_scan = scan_order(p.scan_idx, log2_sb);
        let pos_scan = scan_order(p.scan_idx, 2);
        let (last_x, last_y) = last;

        let last_sb = sb_scan
            .iter()
            .rposition(|&(sx, sy)| u32::from(sx) == last_x >> 2 && u32::from(sy) == last_y >> 2)
            .ok_or_else(|| BsError::syntax("最后子块不在扫描表中"))?;
        let last_pos = pos_scan
            .iter()
            .position(|&(px, py)| u32::from(px) == last_x & 3 && u32::from(py) == last_y & 3)
            .ok_or_else(|| BsError::syntax("最后位置不在扫描表中"))?;

        let mut csbf = vec![false; sb_width * sb_width];
        let comp_g1 = if p.luma { 0 } else { 16 };
        let comp_g2 = if p.luma { 0 } else { 4 };
        let mut greater1_ctx = 1u32;

        for i in (0..=last_sb).rev() {
            let (xs, ys) = (sb_scan[i].0 as usize, sb_scan[i].1 as usize);
            let right = xs + 1 < sb_width && csbf[ys * sb_width + xs + 1];
            let below = ys + 1 < sb_width && csbf[(ys + 1) * sb_width + xs];

            let mut infer_dc = false;
            let coded = if i < last_sb && i > 0 {
                let inc = usize::from(right || below) + if p.luma { 0 } else { 2 };
                infer_dc = true;
                self.cabac.decode_decision(ctx::CODED_SUB_BLOCK_FLAG + inc)? == 1
            } else {
                true
            };
            csbf[ys * sb_width + xs] = coded;

            // 有效性标志, 按逆扫描序保存位置
            let mut sig_pos: [usize; 16] = [0; 16];
            let mut num_sig = 0usize;
            let start = if i == last_sb {
                sig_pos[0] = last_pos;
                num_sig = 1;
                last_pos as i32 - 1
            } else {
                15
            };
            let prev_csbf = u32::from(right) | (u32::from(below) << 1);
            for n in (0..=start).rev() {
                let n = n as usize;
                let (xp, yp) = (pos_scan[n].0 as u32, pos_scan[n].1 as u32);
                let x_c = ((xs as u32) << 2) + xp;
                let y_c = ((ys as u32) << 2) + yp;
                let sig = if coded && (n > 0 || !infer_dc) {
                    let inc = if p.ts_context {
                        if p.luma { 42 } else { 16 + 27 }
                    } else {
                        let s = sig_ctx(p.log2, p.luma, p.scan_idx, (x_c, y_c), prev_csbf);
                        if p.luma { s } else { s + 27 }
                    };
                    let v = self.cabac.decode_decision(ctx::SIG_COEFF_FLAG + inc)? == 1;
                    if v {
                        infer_dc = false;
                    }
                    v
                } else {
                    coded && n == 0 && infer_dc
                };
                if sig {
                    sig_pos[num_sig] = n;
                    num_sig += 1;
                }
            }
            if num_sig == 0 {
                continue;
            }

            // greater1 / greater2
            let mut ctx_set = if i == 0 || !p.luma { 0 } else { 2 };
            if greater1_ctx == 0 {
                ctx_set += 1;
            }
            greater1_ctx = 1;
            let mut g1 = [false; 16];
            let mut g2 = [false; 16];
            let mut first_g1: Option<usize> = None;
            let mut escape = num_sig > MAX_GREATER1;
            for k in 0..num_sig.min(MAX_GREATER1) {
                let inc = comp_g1 + ctx_set * 4 + greater1_ctx.min(3) as usize;
                let flag = self
                    .cabac
                    .decode_decision(ctx::COEFF_ABS_LEVEL_GREATER1_FLAG + inc)?
                    == 1;
                g1[k] = flag;
                if flag {
                    greater1_ctx = 0;
                    if first_g1.is_none() {
                        first_g1 = Some(k);
                    } else {
                        escape = true;
                    }
                } else if greater1_ctx > 0 && greater1_ctx < 3 {
                    greater1_ctx += 1;
                }
            }
            if let Some(k) = first_g1 {
                g2[k] = self
                    .cabac
                    .decode_decision(ctx::COEFF_ABS_LEVEL_GREATER2_FLAG + comp_g2 + ctx_set)?
                    == 1;
                if g2[k] {
                    escape = true;
                }
            }

            // sig_pos[0] 为 lastSigScanPos, sig_pos[num_sig-1] 为 firstSigScanPos
            let sign_hidden =
                p.sign_hiding_allowed && sig_pos[0] as i32 - sig_pos[num_sig - 1] as i32 > 3;
            if p.align && escape {
                self.cabac.align_bypass();
            }
            let coded_signs = if sign_hidden { num_sig - 1 } else { num_sig };
            let mut signs = [false; 16];
            for s in signs.iter_mut().take(coded_signs) {
                *s = self.cabac.decode_bypass()? == 1;
            }

            // 剩余电平
            let mut rice = if p.persistent_rice {
                u32::from(self.stat_coeff[p.stat_idx] / 4)
            } else {
                0
            };
            let mut first_remaining = true;
            let mut sum_abs = 0u32;
            for k in 0..num_sig {
                let base = 1 + u32::from(g1[k]) + u32::from(g2[k]);
                let threshold = if k < MAX_GREATER1 {
                    if Some(k) == first_g1 { 3 } else { 2 }
                } else {
                    1
                };
                let mut abs = base;
                if base == threshold {
                    let rem = self.decode_coeff_abs_level_remaining(rice)?;
                    if p.persistent_rice && first_remaining {
                        self.update_stat_coeff(p.stat_idx, rem);
                    }
                    first_remaining = false;
                    abs = base
                        .checked_add(rem)
                        .ok_or_else(|| BsError::syntax("系数电平溢出"))?;
                    if abs > 3 * (1 << rice) {
                        rice = (rice + 1).min(4);
                    }
                }
                sum_abs = sum_abs.wrapping_add(abs);
                let n = sig_pos[k];
                let negative = if sign_hidden && k == num_sig - 1 {
                    sum_abs % 2 == 1
                } else {
                    signs[k]
                };
                let level = i32::try_from(abs).map_err(|_| BsError::syntax("系数电平溢出"))?;
                let (xp, yp) = (pos_scan[n].0 as u32, pos_scan[n].1 as u32);
                let x_c = ((xs as u32) << 2) + xp;
                let y_c = ((ys as u32) << 2) + yp;
                self.out.coeffs.push(Coeff {
                    pos: ((y_c << p.log2) + x_c) as u16,
                    level: if negative { -level } else { level },
                });
            }
        }
        Ok(())
    }

    /// coeff_abs_level_remaining (9.3.3.11)
    pub(super) fn decode_coeff_abs_level_remaining(&mut self, rice: u32) -> BsResult<u32> {
        let mut prefix = 0u32;
        while self.cabac.decode_bypass()? == 1 {
            prefix += 1;
            if prefix > 32 {
                return Err(BsError::syntax("coeff_abs_level_remaining 前缀过长"));
            }
        }
        if prefix < 3 {
            return Ok((prefix << rice) + self.cabac.decode_fl(rice)?);
        }
        let bits = prefix - 3 + rice;
        if bits > 31 {
            return Err(BsError::syntax("coeff_abs_level_remaining 后缀过长"));
        }
        let suffix = u64::from(self.cabac.decode_fl(bits)?);
        let value = (((1u64 << (prefix - 3)) + 2) << rice) + suffix;
        u32::try_from(value).map_err(|_| BsError::syntax("coeff_abs_level_remaining 溢出"))
    }

    /// StatCoeff 更新 (9.3.3.11)
    fn update_stat_coeff(&mut self, idx: usize, rem: u32) {
        let s = &mut self.stat_coeff[idx];
        let shift = u32::from(*s / 4);
        if rem >= (3u32 << shift) {
            *s = s.saturating_add(1);
        } else if 2 * rem < (1u32 << shift) && *s > 0 {
            *s -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_idx_selection() {
        assert_eq!(scan_idx_for(2, 0, 1, 10), SCAN_VERT);
        assert_eq!(scan_idx_for(2, 0, 1, 26), SCAN_HORIZ);
        assert_eq!(scan_idx_for(3, 0, 1, 6), SCAN_VERT);
        // 4:2:0 的 8x8 色度块始终对角扫描
        assert_eq!(scan_idx_for(3, 1, 1, 10), SCAN_DIAG);
        assert_eq!(scan_idx_for(3, 1, 3, 10), SCAN_VERT);
        assert_eq!(scan_idx_for(4, 0, 1, 10), SCAN_DIAG);
        assert_eq!(scan_idx_for(2, 0, 1, 18), SCAN_DIAG);
    }

    #[test]
    fn test_last_prefix_contexts() {
        assert_eq!(last_prefix_ctx(2, true), (0, 0));
        assert_eq!(last_prefix_ctx(3, true), (3, 1));
        assert_eq!(last_prefix_ctx(4, true), (6, 1));
        assert_eq!(last_prefix_ctx(5, true), (10, 1));
        assert_eq!(last_prefix_ctx(4, false), (15, 2));
        assert_eq!(last_position(5, 1), 7);
        assert_eq!(last_position(3, 0), 3);
        assert_eq!(last_position(9, 7), 31);
    }

    #[test]
    fn test_sig_ctx_patterns() {
        // DC 位置
        assert_eq!(sig_ctx(3, true, SCAN_DIAG, (0, 0), 0), 0);
        // 4x4 查表
        assert_eq!(sig_ctx(2, true, SCAN_DIAG, (3, 3), 0), 8);
        assert_eq!(sig_ctx(2, false, SCAN_DIAG, (1, 0), 0), 1);
        // 8x8 亮度, 子块 0, 右侧子块已编码
        assert_eq!(sig_ctx(3, true, SCAN_DIAG, (1, 0), 1), 2 + 9);
        // 16x16 亮度, 非首子块
        assert_eq!(sig_ctx(4, true, SCAN_DIAG, (5, 6), 3), 2 + 3 + 21);
        // 8x8 亮度, 水平扫描
        assert_eq!(sig_ctx(3, true, SCAN_HORIZ, (2, 1), 0), 15);
        // 16x16 色度
        assert_eq!(sig_ctx(4, false, SCAN_DIAG, (1, 1), 2), 1 + 12);
    }
}
