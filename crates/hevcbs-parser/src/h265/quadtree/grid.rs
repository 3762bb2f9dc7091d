//! 图像级 4x4 信息网格: 邻块可用性与上下文推导所需的已解码信息.
//!
//! 每个工作单元持有一份. 不同条带或分块中的邻块一律不可用,
//! 所以各单元的网格互不依赖.

use std::sync::Arc;

use super::{PredMode, SaoParams};
use crate::h265::layout::PictureLayout;
use crate::h265::motion::MotionInfo;

/// 4x4 块的已解码信息
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockInfo {
    pub ct_depth: u8,
    pub pred_mode: PredMode,
    pub skip: bool,
    /// 亮度帧内模式
    pub intra_mode: u8,
    /// PCM 或调色板编码, 帧内模式推导时按 DC 处理
    pub dc_fallback: bool,
    pub qp_y: i8,
    pub motion: MotionInfo,
}

pub struct PictureGrid {
    layout: Arc<PictureLayout>,
    w4: u32,
    h4: u32,
    blocks: Vec<BlockInfo>,
    /// 每个 CTB 所属条带的 SliceAddrRs, None 表示本单元尚未解码
    ctb_slice: Vec<Option<u32>>,
    ctb_sao: Vec<Option<SaoParams>>,
}

impl PictureGrid {
    pub fn new(layout: Arc<PictureLayout>) -> Self {
        let w4 = (layout.width_ctbs << layout.ctb_log2) >> 2;
        let h4 = (layout.height_ctbs << layout.ctb_log2) >> 2;
        let ctbs = layout.num_ctbs() as usize;
        Self {
            layout,
            w4,
            h4,
            blocks: vec![BlockInfo::default(); (w4 * h4) as usize],
            ctb_slice: vec![None; ctbs],
            ctb_sao: vec![None; ctbs],
        }
    }

    pub fn layout(&self) -> &PictureLayout {
        &self.layout
    }

    /// 登记开始解码的 CTB
    pub fn begin_ctb(&mut self, ctb_rs: u32, slice_addr_rs: u32) {
        self.ctb_slice[ctb_rs as usize] = Some(slice_addr_rs);
    }

    pub fn ctb_slice(&self, ctb_rs: u32) -> Option<u32> {
        self.ctb_slice.get(ctb_rs as usize).copied().flatten()
    }

    pub fn set_sao(&mut self, ctb_rs: u32, sao: SaoParams) {
        self.ctb_sao[ctb_rs as usize] = Some(sao);
    }

    pub fn sao(&self, ctb_rs: u32) -> Option<&SaoParams> {
        self.ctb_sao.get(ctb_rs as usize).and_then(Option::as_ref)
    }

    /// z 扫描序可用性 (6.4.1)
    pub fn available(&self, x_cur: u32, y_cur: u32, x_n: i32, y_n: i32) -> bool {
        let l = &*self.layout;
        if !l.contains(x_n, y_n) {
            return false;
        }
        let (xn, yn) = (x_n as u32, y_n as u32);
        let ctb_n = l.ctb_rs_at(xn, yn);
        let Some(slice_n) = self.ctb_slice(ctb_n) else {
            return false;
        };
        if l.min_tb_zs(xn, yn) > l.min_tb_zs(x_cur, y_cur) {
            return false;
        }
        let ctb_c = l.ctb_rs_at(x_cur, y_cur);
        self.ctb_slice(ctb_c) == Some(slice_n) && l.tile_id_rs(ctb_n) == l.tile_id_rs(ctb_c)
    }

    /// 预测块可用性 (6.4.2), 帧内邻块视为不可用
    pub fn pred_block_available(
        &self,
        cb: (u32, u32, u32),
        pb: (u32, u32, u32, u32),
        part_idx: u32,
        x_n: i32,
        y_n: i32,
    ) -> bool {
        let (x_cb, y_cb, n_cb) = cb;
        let (x_pb, y_pb, w_pb, h_pb) = pb;
        let same_cb = x_n >= x_cb as i32
            && y_n >= y_cb as i32
            && x_n < (x_cb + n_cb) as i32
            && y_n < (y_cb + n_cb) as i32;
        let avail = if !same_cb {
            self.available(x_pb, y_pb, x_n, y_n)
        } else {
            !((w_pb << 1) == n_cb
                && (h_pb << 1) == n_cb
                && part_idx == 1
                && (y_cb + h_pb) as i32 <= y_n
                && (x_cb + w_pb) as i32 > x_n)
        };
        avail && self.at(x_n as u32, y_n as u32).pred_mode != PredMode::Intra
    }

    pub fn at(&self, x: u32, y: u32) -> &BlockInfo {
        let idx = ((y >> 2) * self.w4 + (x >> 2)) as usize;
        &self.blocks[idx.min(self.blocks.len() - 1)]
    }

    /// 对矩形内全部 4x4 块执行修改
    pub fn fill(&mut self, x: u32, y: u32, w: u32, h: u32, f: impl Fn(&mut BlockInfo)) {
        let x0 = x >> 2;
        let y0 = y >> 2;
        let x1 = ((x + w) >> 2).min(self.w4);
        let y1 = ((y + h) >> 2).min(self.h4);
        for by in y0..y1 {
            let row = (by * self.w4) as usize;
            for bx in x0..x1 {
                f(&mut self.blocks[row + bx as usize]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{StreamParams, build_params};

    fn grid(params: &StreamParams) -> PictureGrid {
        let (sps, pps) = build_params(params);
        PictureGrid::new(Arc::new(PictureLayout::new(&sps, &pps).unwrap()))
    }

    #[test]
    fn test_zscan_availability() {
        let mut g = grid(&StreamParams::default());
        g.begin_ctb(0, 0);
        g.begin_ctb(1, 0);
        // 同一 CTB 内: 左上已解码, 右下未解码
        assert!(g.available(8, 8, 7, 7));
        assert!(!g.available(0, 0, 8, 8));
        // 图像外
        assert!(!g.available(0, 0, -1, 0));
        // 左侧 CTB
        assert!(g.available(16, 0, 15, 0));
        // 第二行 CTB 尚未登记
        assert!(!g.available(16, 0, 0, 16));
    }

    #[test]
    fn test_slice_and_tile_boundaries() {
        let mut g = grid(&StreamParams::default());
        g.begin_ctb(0, 0);
        g.begin_ctb(1, 1);
        assert!(!g.available(16, 0, 15, 0));

        let mut g = grid(&StreamParams {
            tile_columns: 2,
            ..Default::default()
        });
        g.begin_ctb(0, 0);
        g.begin_ctb(1, 0);
        g.begin_ctb(2, 0);
        // CTB 2 属于第二个分块
        assert!(!g.available(32, 0, 31, 0));
        assert!(g.available(16, 0, 15, 0));
    }

    #[test]
    fn test_pred_block_excludes_intra_and_nxn_order() {
        let mut g = grid(&StreamParams::default());
        g.begin_ctb(0, 0);
        g.fill(0, 0, 8, 8, |b| b.pred_mode = PredMode::Inter);
        g.fill(8, 0, 8, 8, |b| b.pred_mode = PredMode::Intra);
        let cb = (0, 8, 8);
        assert!(g.pred_block_available(cb, (0, 8, 8, 8), 0, 0, 7));
        assert!(!g.pred_block_available(cb, (0, 8, 8, 8), 0, 8, 7));
        // NxN 的第 1 块不能引用第 2 块
        let mut g2 = grid(&StreamParams::default());
        g2.begin_ctb(0, 0);
        g2.fill(0, 0, 16, 16, |b| b.pred_mode = PredMode::Inter);
        assert!(!g2.pred_block_available((0, 0, 16), (8, 0, 8, 8), 1, 7, 8));
        assert!(g2.pred_block_available((0, 0, 16), (8, 0, 8, 8), 1, 7, 7));
    }
}
