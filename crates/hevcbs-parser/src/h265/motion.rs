//! 运动信息与时域预测所需的同位运动场.

use serde::Serialize;

use super::refs::RefLists;

/// 运动矢量 (1/4 像素单位)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Mv {
    pub x: i32,
    pub y: i32,
}

impl Mv {
    pub const ZERO: Mv = Mv { x: 0, y: 0 };

    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// 16 位回绕加法 (8-192 ~ 8-195)
    pub fn wrapping_add(self, d: Mv) -> Mv {
        Mv {
            x: wrap16(self.x + d.x),
            y: wrap16(self.y + d.y),
        }
    }

    /// 按 POC 距离缩放
    pub fn scale(self, td: i32, tb: i32) -> Mv {
        let factor = dist_scale_factor(td, tb);
        Mv {
            x: scale_component(factor, self.x),
            y: scale_component(factor, self.y),
        }
    }
}

fn wrap16(v: i32) -> i32 {
    let u = v.rem_euclid(1 << 16);
    if u >= 1 << 15 { u - (1 << 16) } else { u }
}

/// distScaleFactor (8-179 ~ 8-181)
pub fn dist_scale_factor(td: i32, tb: i32) -> i32 {
    let td = td.clamp(-128, 127);
    let tb = tb.clamp(-128, 127);
    if td == 0 {
        return 256;
    }
    let tx = (16384 + (td.abs() >> 1)) / td;
    ((tb * tx + 32) >> 6).clamp(-4096, 4095)
}

fn scale_component(factor: i32, v: i32) -> i32 {
    let p = factor * v;
    let mag = (p.abs() + 127) >> 8;
    (if p < 0 { -mag } else { mag }).clamp(-32768, 32767)
}

/// 一个预测块的运动信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MotionInfo {
    pub mv: [Mv; 2],
    /// 无效时为 -1
    pub ref_idx: [i8; 2],
    pub pred_flag: [bool; 2],
}

impl MotionInfo {
    pub fn uni(list: usize, mv: Mv, ref_idx: i8) -> Self {
        let mut m = MotionInfo {
            ref_idx: [-1, -1],
            ..Default::default()
        };
        m.mv[list] = mv;
        m.ref_idx[list] = ref_idx;
        m.pred_flag[list] = true;
        m
    }

    pub fn is_bi(&self) -> bool {
        self.pred_flag[0] && self.pred_flag[1]
    }

    /// 对只用到的列表比较运动 (合并候选去重用)
    pub fn same_motion(&self, other: &MotionInfo) -> bool {
        (0..2).all(|l| {
            self.pred_flag[l] == other.pred_flag[l]
                && (!self.pred_flag[l]
                    || (self.mv[l] == other.mv[l] && self.ref_idx[l] == other.ref_idx[l]))
        })
    }
}

// ============================================================
// 同位运动场
// ============================================================

/// 同位运动场中一个 16x16 单元
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColBlock {
    pub intra: bool,
    pub pred_flag: [bool; 2],
    pub mv: [Mv; 2],
    pub ref_poc: [i32; 2],
    pub ref_long_term: [bool; 2],
}

/// 一幅已解码图像的压缩运动场 (16x16 粒度), 供后续图像的时域预测使用
#[derive(Debug, Clone, Default)]
pub struct ColMotion {
    pub poc: i32,
    width16: u32,
    height16: u32,
    blocks: Vec<ColBlock>,
}

impl ColMotion {
    /// 全部为帧内的运动场
    pub fn new(poc: i32, pic_width: u32, pic_height: u32) -> Self {
        let width16 = pic_width.div_ceil(16);
        let height16 = pic_height.div_ceil(16);
        Self {
            poc,
            width16,
            height16,
            blocks: vec![
                ColBlock {
                    intra: true,
                    ..Default::default()
                };
                (width16 * height16) as usize
            ],
        }
    }

    /// 覆盖样本 (x, y) 的单元
    pub fn at(&self, x: u32, y: u32) -> Option<&ColBlock> {
        let (bx, by) = (x >> 4, y >> 4);
        if bx >= self.width16 || by >= self.height16 {
            return None;
        }
        self.blocks.get((by * self.width16 + bx) as usize)
    }

    /// 写入一个预测块的运动. 只记录块内落在 16 对齐锚点上的单元.
    pub fn store(&mut self, x: u32, y: u32, w: u32, h: u32, motion: &MotionInfo, lists: &RefLists) {
        let x_end = x + w;
        let y_end = y + h;
        let mut ay = y.div_ceil(16) * 16;
        while ay < y_end {
            let mut ax = x.div_ceil(16) * 16;
            while ax < x_end {
                let (bx, by) = (ax >> 4, ay >> 4);
                if bx < self.width16 && by < self.height16 {
                    let mut b = ColBlock::default();
                    for l in 0..2 {
                        if !motion.pred_flag[l] {
                            continue;
                        }
                        let list = if l == 0 { &lists.l0 } else { &lists.l1 };
                        if let Some(r) = list.get(motion.ref_idx[l] as usize) {
                            b.pred_flag[l] = true;
                            b.mv[l] = motion.mv[l];
                            b.ref_poc[l] = r.poc;
                            b.ref_long_term[l] = r.long_term;
                        }
                    }
                    b.intra = !b.pred_flag[0] && !b.pred_flag[1];
                    self.blocks[(by * self.width16 + bx) as usize] = b;
                }
                ax += 16;
            }
            ay += 16;
        }
    }

    /// 估算占用字节数
    pub fn byte_size(&self) -> usize {
        self.blocks.len() * std::mem::size_of::<ColBlock>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h265::refs::RefPic;

    #[test]
    fn test_mv_scaling() {
        // 距离相同, 缩放因子为 256
        assert_eq!(dist_scale_factor(4, 4), 256);
        assert_eq!(Mv::new(17, -9).scale(4, 4), Mv::new(17, -9));
        // 距离减半
        assert_eq!(Mv::new(64, -64).scale(4, 2), Mv::new(32, -32));
        // 反向
        assert_eq!(Mv::new(10, 0).scale(2, -2), Mv::new(-10, 0));
        // 因子限幅到 4095, 结果限幅到 16 位
        assert_eq!(dist_scale_factor(1, 127), 4095);
        assert_eq!(Mv::new(30000, 0).scale(1, 127).x, 32767);
    }

    #[test]
    fn test_wrapping_add() {
        assert_eq!(Mv::new(32767, 0).wrapping_add(Mv::new(1, 0)).x, -32768);
        assert_eq!(Mv::new(-5, 3).wrapping_add(Mv::new(2, -3)), Mv::new(-3, 0));
    }

    #[test]
    fn test_col_store_anchor_blocks() {
        let lists = RefLists {
            l0: vec![RefPic {
                poc: 8,
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut col = ColMotion::new(16, 64, 32);
        let m = MotionInfo::uni(0, Mv::new(4, 4), 0);
        // 8x8 块不含 16 对齐锚点以外的单元
        col.store(8, 8, 8, 8, &m, &lists);
        assert!(col.at(0, 0).unwrap().intra);
        col.store(16, 0, 32, 16, &m, &lists);
        let b = col.at(20, 4).unwrap();
        assert!(!b.intra);
        assert_eq!(b.ref_poc[0], 8);
        assert!(col.at(40, 0).is_some_and(|b| !b.intra));
        assert!(col.at(64, 0).is_none());
    }
}
