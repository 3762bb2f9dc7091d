//! transform_tree() / transform_unit() (7.3.8.8, 7.3.8.10).

use hevcbs_core::BsResult;
use log::trace;

use super::{CodingUnit, CtuDecoder, PartMode, PredMode, TransformUnit};
use crate::h265::cabac::ctx;
use crate::h265::control::TraceLevel;

/// 变换树节点
#[derive(Debug, Clone, Copy)]
pub(super) struct TreeNode {
    x: u32,
    y: u32,
    x_base: u32,
    y_base: u32,
    log2: u32,
    depth: u32,
    blk_idx: u32,
    parent_cbf_cb: [bool; 2],
    parent_cbf_cr: [bool; 2],
}

impl TreeNode {
    pub(super) fn root(x: u32, y: u32, log2: u32) -> Self {
        Self {
            x,
            y,
            x_base: x,
            y_base: y,
            log2,
            depth: 0,
            blk_idx: 0,
            parent_cbf_cb: [false; 2],
            parent_cbf_cr: [false; 2],
        }
    }
}

/// 覆盖 (x, y) 的帧内分区下标
pub(super) fn part_index(cu: &CodingUnit, x: u32, y: u32) -> usize {
    if cu.part_mode != PartMode::PartNxN {
        return 0;
    }
    let half = 1u32 << (cu.log2_size - 1);
    (usize::from(y - cu.y >= half) << 1) | usize::from(x - cu.x >= half)
}

impl CtuDecoder<'_> {
    pub(super) fn transform_tree(
        &mut self,
        cu: &CodingUnit,
        max_depth: u32,
        node: TreeNode,
    ) -> BsResult<()> {
        let sps = self.sps;
        let cat = sps.chroma_array_type;
        let log2 = node.log2;
        let depth = node.depth;
        let intra_split = cu.pred_mode == PredMode::Intra && cu.part_mode == PartMode::PartNxN;
        let inter_split = sps.max_transform_hierarchy_depth_inter == 0
            && cu.pred_mode == PredMode::Inter
            && cu.part_mode != PartMode::Part2Nx2N
            && depth == 0;

        let split = if log2 <= sps.max_tb_log2
            && log2 > sps.min_tb_log2
            && depth < max_depth
            && !(intra_split && depth == 0)
        {
            self.cabac
                .decode_decision(ctx::SPLIT_TRANSFORM_FLAG + (5 - log2) as usize)?
                == 1
        } else {
            log2 > sps.max_tb_log2 || (intra_split && depth == 0) || inter_split
        };

        let mut cbf_cb = [false; 2];
        let mut cbf_cr = [false; 2];
        if (log2 > 2 && cat != 0) || cat == 3 {
            let second = cat == 2 && (!split || log2 == 3);
            let ctx_idx = ctx::CBF_CHROMA + depth as usize;
            if depth == 0 || node.parent_cbf_cb.iter().any(|&c| c) {
                cbf_cb[0] = self.cabac.decode_decision(ctx_idx)? == 1;
                if second {
                    cbf_cb[1] = self.cabac.decode_decision(ctx_idx)? == 1;
                }
            }
            if depth == 0 || node.parent_cbf_cr.iter().any(|&c| c) {
                cbf_cr[0] = self.cabac.decode_decision(ctx_idx)? == 1;
                if second {
                    cbf_cr[1] = self.cabac.decode_decision(ctx_idx)? == 1;
                }
            }
        }

        if split {
            let half = 1u32 << (log2 - 1);
            for (i, (dx, dy)) in [(0, 0), (half, 0), (0, half), (half, half)]
                .into_iter()
                .enumerate()
            {
                self.transform_tree(
                    cu,
                    max_depth,
                    TreeNode {
                        x: node.x + dx,
                        y: node.y + dy,
                        x_base: node.x,
                        y_base: node.y,
                        log2: log2 - 1,
                        depth: depth + 1,
                        blk_idx: i as u32,
                        parent_cbf_cb: cbf_cb,
                        parent_cbf_cr: cbf_cr,
                    },
                )?;
            }
            return Ok(());
        }

        // 4x4 亮度块 (非 4:4:4) 的色度由父节点的 cbf 决定
        if cat != 0 && cat != 3 && log2 == 2 {
            cbf_cb = node.parent_cbf_cb;
            cbf_cr = node.parent_cbf_cr;
        }
        let any_chroma = cbf_cb.iter().chain(&cbf_cr).any(|&c| c);
        let cbf_luma = if cu.pred_mode == PredMode::Intra || depth != 0 || any_chroma {
            let inc = if depth == 0 { 1 } else { 0 };
            self.cabac.decode_decision(ctx::CBF_LUMA + inc)? == 1
        } else {
            true
        };
        self.transform_unit(cu, &node, cbf_luma, cbf_cb, cbf_cr)
    }

    fn transform_unit(
        &mut self,
        cu: &CodingUnit,
        node: &TreeNode,
        cbf_luma: bool,
        cbf_cb: [bool; 2],
        cbf_cr: [bool; 2],
    ) -> BsResult<()> {
        let sps = self.sps;
        let pps = self.pps;
        let cat = sps.chroma_array_type;
        let log2 = node.log2;
        let start = self.out.residuals.len() as u32;
        let cbf_chroma = cat != 0 && cbf_cb.iter().chain(&cbf_cr).any(|&c| c);
        let mut tu = TransformUnit {
            x: node.x,
            y: node.y,
            log2_size: log2 as u8,
            depth: node.depth as u8,
            cbf_luma,
            cbf_cb,
            cbf_cr,
            residuals: start..start,
            ..Default::default()
        };

        if cbf_luma || cbf_chroma {
            let part = part_index(cu, node.x, node.y);
            if pps.scc_ext.residual_adaptive_colour_transform_enabled_flag
                && (cu.pred_mode == PredMode::Inter
                    || cu.intra_chroma_syntax.iter().all(|&s| s == 4))
            {
                tu.residual_act = self.cabac.decode_decision(ctx::TU_RESIDUAL_ACT_FLAG)? == 1;
            }
            if pps.cu_qp_delta_enabled_flag && !self.qp.delta_coded {
                self.decode_cu_qp_delta()?;
            }
            if self.sh.cu_chroma_qp_offset_enabled_flag
                && cbf_chroma
                && !cu.transquant_bypass
                && !self.qp.chroma_offset_coded
            {
                self.decode_cu_chroma_qp_offset()?;
            }

            if cbf_luma {
                self.residual_coding(cu, node.x, node.y, log2, 0)?;
            }

            let sub_blocks = if cat == 2 { 2 } else { 1 };
            if log2 > 2 || cat == 3 {
                let log2c = if cat == 3 { log2 } else { log2 - 1 };
                let cross = pps.range_ext.cross_component_prediction_enabled_flag
                    && cbf_luma
                    && (cu.pred_mode == PredMode::Inter || cu.intra_chroma_syntax[part] == 4);
                for (c, cbf) in [(1u32, cbf_cb), (2, cbf_cr)] {
                    if cross {
                        tu.res_scale[c as usize - 1] = self.cross_comp_pred(c - 1)?;
                    }
                    for (t, &coded) in cbf.iter().enumerate().take(sub_blocks) {
                        if coded {
                            self.residual_coding(
                                cu,
                                node.x,
                                node.y + ((t as u32) << log2c),
                                log2c,
                                c,
                            )?;
                        }
                    }
                }
            } else if node.blk_idx == 3 {
                for (c, cbf) in [(1u32, cbf_cb), (2, cbf_cr)] {
                    for (t, &coded) in cbf.iter().enumerate().take(sub_blocks) {
                        if coded {
                            self.residual_coding(
                                cu,
                                node.x_base,
                                node.y_base + ((t as u32) << 2),
                                2,
                                c,
                            )?;
                        }
                    }
                }
            } else {
                // 色度在同一父节点的第 4 个子块中解码
                tu.cbf_cb = [false; 2];
                tu.cbf_cr = [false; 2];
            }
        }

        tu.qp_y = self.qp.qp_y;
        (tu.qp_cb, tu.qp_cr) = self.chroma_qps();
        tu.residuals.end = self.out.residuals.len() as u32;
        if self.trace.contains(TraceLevel::TU) {
            trace!(
                "TU ({}, {}) log2={} depth={} cbf=[{} {:?} {:?}] qp=({}, {}, {})",
                tu.x,
                tu.y,
                log2,
                tu.depth,
                cbf_luma,
                tu.cbf_cb,
                tu.cbf_cr,
                tu.qp_y,
                tu.qp_cb,
                tu.qp_cr
            );
        }
        self.out.tus.push(tu);
        Ok(())
    }

    /// cross_comp_pred(): 返回 ResScaleVal
    fn cross_comp_pred(&mut self, c: u32) -> BsResult<i8> {
        let base = ctx::LOG2_RES_SCALE_ABS_PLUS1 + 4 * c as usize;
        let mut abs_plus1 = 0u32;
        while abs_plus1 < 4 && self.cabac.decode_decision(base + abs_plus1 as usize)? == 1 {
            abs_plus1 += 1;
        }
        if abs_plus1 == 0 {
            return Ok(0);
        }
        let neg = self.cabac.decode_decision(ctx::RES_SCALE_SIGN_FLAG + c as usize)? == 1;
        let mag = 1i8 << (abs_plus1 - 1);
        Ok(if neg { -mag } else { mag })
    }
}
