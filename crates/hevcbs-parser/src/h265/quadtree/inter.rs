//! prediction_unit() 语法与运动矢量推导: 合并候选 (8.5.3.2.2 ~ 8.5.3.2.5),
//! AMVP (8.5.3.2.6 ~ 8.5.3.2.7) 与时域候选 (8.5.3.2.8 ~ 8.5.3.2.9).

use hevcbs_core::{BsError, BsResult};
use log::trace;

use super::{CodingUnit, CtuDecoder, PartMode, PredMode, PredictionUnit};
use crate::h265::cabac::ctx;
use crate::h265::control::TraceLevel;
use crate::h265::motion::{MotionInfo, Mv};
use crate::h265::refs::RefPic;

const PRED_L0: u8 = 0;
const PRED_L1: u8 = 1;
const PRED_BI: u8 = 2;

/// 组合双向候选的列表下标 (表 8-7)
const COMB_L0: [usize; 12] = [0, 1, 0, 2, 1, 2, 0, 3, 1, 3, 2, 3];
const COMB_L1: [usize; 12] = [1, 0, 2, 0, 2, 1, 3, 0, 3, 1, 3, 2];

/// 预测块几何: 所属 CU (x, y, 尺寸), 块 (x, y, w, h), 分区下标
#[derive(Debug, Clone, Copy)]
struct PbGeom {
    cb: (u32, u32, u32),
    pb: (u32, u32, u32, u32),
    part_idx: u32,
    part_mode: PartMode,
}

fn same_picture(a: &RefPic, b: &RefPic) -> bool {
    a.poc == b.poc && a.current == b.current
}

impl CtuDecoder<'_> {
    fn ref_pic(&self, list: usize, idx: i8) -> Option<&RefPic> {
        let l = if list == 0 {
            &self.lists.l0
        } else {
            &self.lists.l1
        };
        usize::try_from(idx).ok().and_then(|i| l.get(i))
    }

    pub(super) fn prediction_unit(
        &mut self,
        cu: &CodingUnit,
        pb: (u32, u32, u32, u32),
        part_idx: u32,
    ) -> BsResult<()> {
        let (x, y, w, h) = pb;
        let mut pu = PredictionUnit {
            x,
            y,
            w,
            h,
            ..Default::default()
        };
        let geom = PbGeom {
            cb: (cu.x, cu.y, 1u32 << cu.log2_size),
            pb,
            part_idx,
            part_mode: cu.part_mode,
        };

        pu.merge_flag = cu.pred_mode == PredMode::Skip
            || self.cabac.decode_decision(ctx::MERGE_FLAG)? == 1;

        if pu.merge_flag {
            let max = self.sh.max_num_merge_cand;
            if max > 1 {
                pu.merge_idx = self.decode_merge_idx(max - 1)? as u8;
            }
            pu.motion = self.merge_motion(&geom, u32::from(pu.merge_idx))?;
        } else {
            let pred_idc = if self.sh.slice_type.is_b() {
                self.decode_inter_pred_idc(w + h, u32::from(cu.ct_depth))?
            } else {
                PRED_L0
            };
            let mut ref_idx = [-1i8; 2];
            let mut used = [false; 2];
            for list in 0..2 {
                let uses = if list == 0 {
                    pred_idc != PRED_L1
                } else {
                    pred_idc != PRED_L0
                };
                if !uses {
                    continue;
                }
                used[list] = true;
                let active = if list == 0 {
                    self.sh.num_ref_idx_l0_active
                } else {
                    self.sh.num_ref_idx_l1_active
                };
                ref_idx[list] = if active > 1 {
                    self.decode_ref_idx(active - 1)? as i8
                } else {
                    0
                };
                pu.mvd[list] = if list == 1 && self.sh.mvd_l1_zero_flag && pred_idc == PRED_BI {
                    Mv::ZERO
                } else {
                    self.mvd_coding()?
                };
                pu.mvp_flag[list] = self.cabac.decode_decision(ctx::MVP_FLAG)? as u8;
            }

            let mut motion = MotionInfo {
                ref_idx,
                pred_flag: used,
                ..Default::default()
            };
            for list in 0..2 {
                if !used[list] {
                    continue;
                }
                let mvp = self.amvp(&geom, list, ref_idx[list], pu.mvp_flag[list])?;
                let mvd = pu.mvd[list];
                motion.mv[list] = if self.sh.use_integer_mv_flag {
                    Mv::ZERO.wrapping_add(Mv::new(
                        ((mvp.x >> 2) + mvd.x) << 2,
                        ((mvp.y >> 2) + mvd.y) << 2,
                    ))
                } else {
                    mvp.wrapping_add(mvd)
                };
            }
            pu.motion = motion;
        }

        let motion = pu.motion;
        self.grid.fill(x, y, w, h, move |b| b.motion = motion);
        if self.trace.contains(TraceLevel::PU) {
            trace!(
                "PU ({}, {}) {}x{} merge={} idx={} motion={:?}",
                x,
                y,
                w,
                h,
                pu.merge_flag,
                pu.merge_idx,
                pu.motion
            );
        }
        self.out.pus.push(pu);
        Ok(())
    }

    // ============================================================
    // 语法元素
    // ============================================================

    fn decode_merge_idx(&mut self, c_max: u32) -> BsResult<u32> {
        if self.cabac.decode_decision(ctx::MERGE_IDX)? == 0 {
            return Ok(0);
        }
        Ok(1 + self.cabac.decode_tu_bypass(c_max - 1)?)
    }

    fn decode_inter_pred_idc(&mut self, w_plus_h: u32, ct_depth: u32) -> BsResult<u8> {
        if w_plus_h != 12
            && self
                .cabac
                .decode_decision(ctx::INTER_PRED_IDC + ct_depth as usize)?
                == 1
        {
            return Ok(PRED_BI);
        }
        Ok(if self.cabac.decode_decision(ctx::INTER_PRED_IDC + 4)? == 1 {
            PRED_L1
        } else {
            PRED_L0
        })
    }

    fn decode_ref_idx(&mut self, c_max: u32) -> BsResult<u32> {
        let mut v = 0;
        while v < c_max {
            let bin = if v < 2 {
                self.cabac.decode_decision(ctx::REF_IDX + v as usize)?
            } else {
                self.cabac.decode_bypass()?
            };
            if bin == 0 {
                break;
            }
            v += 1;
        }
        Ok(v)
    }

    /// mvd_coding() (7.3.8.9)
    fn mvd_coding(&mut self) -> BsResult<Mv> {
        let g0x = self.cabac.decode_decision(ctx::ABS_MVD_GREATER0_FLAG)? == 1;
        let g0y = self.cabac.decode_decision(ctx::ABS_MVD_GREATER0_FLAG)? == 1;
        let g1x = g0x && self.cabac.decode_decision(ctx::ABS_MVD_GREATER1_FLAG)? == 1;
        let g1y = g0y && self.cabac.decode_decision(ctx::ABS_MVD_GREATER1_FLAG)? == 1;
        let mut comp = |g0: bool, g1: bool| -> BsResult<i32> {
            if !g0 {
                return Ok(0);
            }
            let abs = if g1 {
                let minus2 = self.cabac.decode_egk(1)?;
                if minus2 > (1 << 15) {
                    return Err(BsError::syntax("abs_mvd_minus2 超出范围"));
                }
                minus2 as i32 + 2
            } else {
                1
            };
            Ok(if self.cabac.decode_bypass()? == 1 {
                -abs
            } else {
                abs
            })
        };
        let x = comp(g0x, g1x)?;
        let y = comp(g0y, g1y)?;
        Ok(Mv::new(x, y))
    }

    // ============================================================
    // 合并模式
    // ============================================================

    fn neighbour_motion(&self, g: &PbGeom, x_n: i32, y_n: i32) -> Option<MotionInfo> {
        if self
            .grid
            .pred_block_available(g.cb, g.pb, g.part_idx, x_n, y_n)
        {
            Some(self.grid.at(x_n as u32, y_n as u32).motion)
        } else {
            None
        }
    }

    /// 空域合并候选 A1, B1, B0, A0, B2 (8.5.3.2.3)
    fn spatial_merge_candidates(&self, g: &PbGeom) -> Vec<MotionInfo> {
        let (x_pb, y_pb, w, h) = g.pb;
        let (x, y, w, h) = (x_pb as i32, y_pb as i32, w as i32, h as i32);
        let pm = self.pps.log2_par_mrg_level();
        let same_region = |xn: i32, yn: i32| (x >> pm) == (xn >> pm) && (y >> pm) == (yn >> pm);
        let fetch = |xn: i32, yn: i32| -> Option<MotionInfo> {
            if same_region(xn, yn) {
                None
            } else {
                self.neighbour_motion(g, xn, yn)
            }
        };

        let a1 = if g.part_idx == 1 && g.part_mode.is_vertical_split() {
            None
        } else {
            fetch(x - 1, y + h - 1)
        };
        let b1 = if g.part_idx == 1 && g.part_mode.is_horizontal_split() {
            None
        } else {
            fetch(x + w - 1, y - 1).filter(|m| a1.is_none_or(|a| !a.same_motion(m)))
        };
        let b0 = fetch(x + w, y - 1).filter(|m| b1.is_none_or(|b| !b.same_motion(m)));
        let a0 = fetch(x - 1, y + h).filter(|m| a1.is_none_or(|a| !a.same_motion(m)));
        let count = [a0, a1, b0, b1].iter().filter(|c| c.is_some()).count();
        let b2 = if count == 4 {
            None
        } else {
            fetch(x - 1, y - 1).filter(|m| {
                a1.is_none_or(|a| !a.same_motion(m)) && b1.is_none_or(|b| !b.same_motion(m))
            })
        };
        [a1, b1, b0, a0, b2].into_iter().flatten().collect()
    }

    fn merge_motion(&self, geom: &PbGeom, merge_idx: u32) -> BsResult<MotionInfo> {
        let orig = geom.pb;
        let mut g = *geom;
        if self.pps.log2_par_mrg_level() > 2 && g.cb.2 == 8 {
            g.pb = (g.cb.0, g.cb.1, 8, 8);
            g.part_idx = 0;
        }
        let max = self.sh.max_num_merge_cand as usize;
        let is_b = self.sh.slice_type.is_b();

        let mut list = self.spatial_merge_candidates(&g);
        let l0 = self.temporal_mv(&g, 0, 0);
        let l1 = if is_b { self.temporal_mv(&g, 1, 0) } else { None };
        if l0.is_some() || l1.is_some() {
            list.push(MotionInfo {
                mv: [l0.unwrap_or_default(), l1.unwrap_or_default()],
                ref_idx: [
                    if l0.is_some() { 0 } else { -1 },
                    if l1.is_some() { 0 } else { -1 },
                ],
                pred_flag: [l0.is_some(), l1.is_some()],
            });
        }

        // 组合双向候选
        let num_orig = list.len();
        if is_b && num_orig > 1 && num_orig < max {
            let mut comb_idx = 0;
            while comb_idx < num_orig * (num_orig - 1) && list.len() < max {
                let c0 = list[COMB_L0[comb_idx]];
                let c1 = list[COMB_L1[comb_idx]];
                if c0.pred_flag[0] && c1.pred_flag[1] {
                    let differ = match (
                        self.ref_pic(0, c0.ref_idx[0]),
                        self.ref_pic(1, c1.ref_idx[1]),
                    ) {
                        (Some(r0), Some(r1)) => r0.poc != r1.poc || c0.mv[0] != c1.mv[1],
                        _ => true,
                    };
                    if differ {
                        list.push(MotionInfo {
                            mv: [c0.mv[0], c1.mv[1]],
                            ref_idx: [c0.ref_idx[0], c1.ref_idx[1]],
                            pred_flag: [true, true],
                        });
                    }
                }
                comb_idx += 1;
            }
        }

        // 零候选
        let num_ref = if is_b {
            self.sh.num_ref_idx_l0_active.min(self.sh.num_ref_idx_l1_active)
        } else {
            self.sh.num_ref_idx_l0_active
        };
        let num_ref = i8::try_from(num_ref).unwrap_or(i8::MAX);
        let mut zero_idx = 0i8;
        while list.len() < max {
            let r = if zero_idx < num_ref { zero_idx } else { 0 };
            list.push(MotionInfo {
                mv: [Mv::ZERO; 2],
                ref_idx: [r, if is_b { r } else { -1 }],
                pred_flag: [true, is_b],
            });
            zero_idx = zero_idx.saturating_add(1);
        }

        let mut m = *list
            .get(merge_idx as usize)
            .ok_or_else(|| BsError::syntax(format!("merge_idx {} 超出候选列表", merge_idx)))?;
        if m.is_bi() && orig.2 + orig.3 == 12 {
            m.ref_idx[1] = -1;
            m.pred_flag[1] = false;
        }
        Ok(m)
    }

    // ============================================================
    // 时域候选
    // ============================================================

    /// 列表 X、参考下标 ref_idx 的时域运动矢量 (8.5.3.2.8)
    fn temporal_mv(&self, g: &PbGeom, list: usize, ref_idx: i8) -> Option<Mv> {
        if !self.sh.temporal_mvp_enabled_flag {
            return None;
        }
        let col = self.col?;
        let col_list = if self.sh.slice_type.is_b() && !self.sh.collocated_from_l0_flag {
            1
        } else {
            0
        };
        let col_pic = self.ref_pic(col_list, self.sh.collocated_ref_idx as i8)?;
        if col_pic.poc != col.poc {
            return None;
        }

        let (x, y, w, h) = g.pb;
        let layout = self.layout;
        let (xbr, ybr) = (x + w, y + h);
        if (y >> layout.ctb_log2) == (ybr >> layout.ctb_log2)
            && ybr < layout.pic_height
            && xbr < layout.pic_width
        {
            let mv = self.collocated_mv(((xbr >> 4) << 4, (ybr >> 4) << 4), list, ref_idx);
            if mv.is_some() {
                return mv;
            }
        }
        let (xc, yc) = (x + (w >> 1), y + (h >> 1));
        self.collocated_mv(((xc >> 4) << 4, (yc >> 4) << 4), list, ref_idx)
    }

    /// 同位块运动矢量 (8.5.3.2.9)
    fn collocated_mv(&self, pos: (u32, u32), list: usize, ref_idx: i8) -> Option<Mv> {
        let col = self.col?;
        let b = col.at(pos.0, pos.1)?;
        if b.intra {
            return None;
        }
        let list_col = if !b.pred_flag[0] {
            1
        } else if !b.pred_flag[1] {
            0
        } else if self.no_backward_pred {
            list
        } else {
            usize::from(self.sh.collocated_from_l0_flag)
        };
        let target = self.ref_pic(list, ref_idx)?;
        if target.long_term != b.ref_long_term[list_col] {
            return None;
        }
        let mv_col = b.mv[list_col];
        let col_diff = col.poc - b.ref_poc[list_col];
        let curr_diff = self.poc - target.poc;
        if target.long_term || col_diff == curr_diff {
            Some(mv_col)
        } else {
            Some(mv_col.scale(col_diff, curr_diff))
        }
    }

    // ============================================================
    // AMVP
    // ============================================================

    /// 同一参考图像的候选: 先查 LX 再查 LY
    fn same_ref_mv(&self, m: &MotionInfo, list: usize, target: &RefPic) -> Option<Mv> {
        for l in [list, 1 - list] {
            if m.pred_flag[l]
                && self
                    .ref_pic(l, m.ref_idx[l])
                    .is_some_and(|r| same_picture(r, target))
            {
                return Some(m.mv[l]);
            }
        }
        None
    }

    /// 长期属性一致的候选, 两者均为短期参考时按 POC 距离缩放
    fn scaled_ref_mv(&self, m: &MotionInfo, list: usize, target: &RefPic) -> Option<Mv> {
        for l in [list, 1 - list] {
            if !m.pred_flag[l] {
                continue;
            }
            let Some(r) = self.ref_pic(l, m.ref_idx[l]) else {
                continue;
            };
            if r.long_term != target.long_term {
                continue;
            }
            if !r.long_term && !target.long_term {
                let td = self.poc - r.poc;
                let tb = self.poc - target.poc;
                return Some(m.mv[l].scale(td, tb));
            }
            return Some(m.mv[l]);
        }
        None
    }

    fn amvp(&self, g: &PbGeom, list: usize, ref_idx: i8, mvp_flag: u8) -> BsResult<Mv> {
        let target = *self
            .ref_pic(list, ref_idx)
            .ok_or_else(|| BsError::syntax(format!("ref_idx_l{} {} 无对应参考图像", list, ref_idx)))?;
        let (x, y, w, h) = g.pb;
        let (x, y, w, h) = (x as i32, y as i32, w as i32, h as i32);

        // A: A0, A1
        let a_cands = [
            self.neighbour_motion(g, x - 1, y + h),
            self.neighbour_motion(g, x - 1, y + h - 1),
        ];
        let is_scaled = a_cands.iter().any(Option::is_some);
        let mut mv_a = a_cands
            .iter()
            .flatten()
            .find_map(|m| self.same_ref_mv(m, list, &target));
        if mv_a.is_none() {
            mv_a = a_cands
                .iter()
                .flatten()
                .find_map(|m| self.scaled_ref_mv(m, list, &target));
        }

        // B: B0, B1, B2
        let b_cands = [
            self.neighbour_motion(g, x + w, y - 1),
            self.neighbour_motion(g, x + w - 1, y - 1),
            self.neighbour_motion(g, x - 1, y - 1),
        ];
        let mut mv_b = b_cands
            .iter()
            .flatten()
            .find_map(|m| self.same_ref_mv(m, list, &target));
        if !is_scaled {
            if mv_b.is_some() {
                mv_a = mv_b;
            }
            mv_b = b_cands
                .iter()
                .flatten()
                .find_map(|m| self.scaled_ref_mv(m, list, &target));
        }

        let mut cands: Vec<Mv> = Vec::with_capacity(3);
        if let Some(a) = mv_a {
            cands.push(a);
        }
        if let Some(b) = mv_b {
            if mv_a != Some(b) {
                cands.push(b);
            }
        }
        if cands.len() < 2 {
            if let Some(c) = self.temporal_mv(g, list, ref_idx) {
                cands.push(c);
            }
        }
        while cands.len() < 2 {
            cands.push(Mv::ZERO);
        }
        Ok(cands[usize::from(mvp_flag).min(1)])
    }
}
