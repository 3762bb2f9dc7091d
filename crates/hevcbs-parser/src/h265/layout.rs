//! 图像几何: 分块边界, CTB 光栅/分块扫描地址映射, 最小变换块 z 扫描序.
//!
//! 几何只取决于 SPS 尺寸与 PPS 分块参数. [`LayoutCache`] 记住上一次的几何键,
//! 键不变时直接复用已计算的映射表.

use std::sync::Arc;

use hevcbs_core::{BsError, BsResult};
use log::debug;

use super::params::{Pps, Sps, TileSpec};

/// 一幅图像的 CTB 布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureLayout {
    pub width_ctbs: u32,
    pub height_ctbs: u32,
    pub ctb_log2: u32,
    pub min_tb_log2: u32,
    pub pic_width: u32,
    pub pic_height: u32,
    /// 分块列边界 (CTB 单位, 含两端)
    pub col_bd: Vec<u32>,
    /// 分块行边界 (CTB 单位, 含两端)
    pub row_bd: Vec<u32>,
    rs_to_ts: Vec<u32>,
    ts_to_rs: Vec<u32>,
    /// 按分块扫描地址索引的 TileId
    tile_id: Vec<u32>,
    /// 最小变换块的 z 扫描地址
    min_tb_zs: Vec<u32>,
    min_tb_stride: u32,
}

/// 几何键
#[derive(Debug, Clone, PartialEq, Eq)]
struct LayoutKey {
    pic_width: u32,
    pic_height: u32,
    ctb_log2: u32,
    min_tb_log2: u32,
    tiles: Option<TileSpec>,
}

impl LayoutKey {
    fn of(sps: &Sps, pps: &Pps) -> Self {
        Self {
            pic_width: sps.pic_width_in_luma_samples,
            pic_height: sps.pic_height_in_luma_samples,
            ctb_log2: sps.ctb_log2,
            min_tb_log2: sps.min_tb_log2,
            tiles: pps.tiles_enabled_flag.then(|| pps.tiles.clone()),
        }
    }
}

/// 由 (列数, 显式宽度, 均匀标志) 计算边界
fn boundaries(total: u32, count: u32, uniform: bool, explicit: &[u32]) -> BsResult<Vec<u32>> {
    let mut bd = Vec::with_capacity(count as usize + 1);
    bd.push(0);
    if uniform {
        for i in 0..count {
            bd.push(((i + 1) * total) / count);
        }
        return Ok(bd);
    }
    let mut acc = 0u32;
    for &w in explicit.iter().take(count as usize - 1) {
        acc = acc.saturating_add(w + 1);
        if acc >= total {
            return Err(BsError::syntax(format!(
                "分块显式尺寸之和 {} 超出图像 {} CTB",
                acc, total
            )));
        }
        bd.push(acc);
    }
    bd.push(total);
    Ok(bd)
}

impl PictureLayout {
    pub fn new(sps: &Sps, pps: &Pps) -> BsResult<Self> {
        let w = sps.pic_width_in_ctbs;
        let h = sps.pic_height_in_ctbs;
        let (col_bd, row_bd) = if pps.tiles_enabled_flag {
            let t = &pps.tiles;
            let cols = t.num_tile_columns_minus1 + 1;
            let rows = t.num_tile_rows_minus1 + 1;
            if cols > w || rows > h {
                return Err(BsError::syntax(format!(
                    "分块 {}x{} 超出图像 {}x{} CTB",
                    cols, rows, w, h
                )));
            }
            (
                boundaries(w, cols, t.uniform_spacing_flag, &t.column_width_minus1)?,
                boundaries(h, rows, t.uniform_spacing_flag, &t.row_height_minus1)?,
            )
        } else {
            (vec![0, w], vec![0, h])
        };

        // 6.5.1: CtbAddrRsToTs / TileId
        let size = (w * h) as usize;
        let mut rs_to_ts = vec![0u32; size];
        let mut tile_id = vec![0u32; size];
        for rs in 0..w * h {
            let tb_x = rs % w;
            let tb_y = rs / w;
            let tile_x = col_bd.iter().rposition(|&b| b <= tb_x).unwrap_or(0);
            let tile_y = row_bd.iter().rposition(|&b| b <= tb_y).unwrap_or(0);
            let mut ts = 0u32;
            for i in 0..tile_x {
                ts += (row_bd[tile_y + 1] - row_bd[tile_y]) * (col_bd[i + 1] - col_bd[i]);
            }
            for j in 0..tile_y {
                ts += w * (row_bd[j + 1] - row_bd[j]);
            }
            ts += (tb_y - row_bd[tile_y]) * (col_bd[tile_x + 1] - col_bd[tile_x]) + tb_x
                - col_bd[tile_x];
            rs_to_ts[rs as usize] = ts;
            tile_id[ts as usize] = (tile_y * (col_bd.len() - 1) + tile_x) as u32;
        }
        let mut ts_to_rs = vec![0u32; size];
        for (rs, &ts) in rs_to_ts.iter().enumerate() {
            ts_to_rs[ts as usize] = rs as u32;
        }

        // 6.5.2: MinTbAddrZs
        let shift = sps.ctb_log2 - sps.min_tb_log2;
        let stride = w << shift;
        let rows = h << shift;
        let mut min_tb_zs = vec![0u32; (stride * rows) as usize];
        for y in 0..rows {
            for x in 0..stride {
                let ctb_rs = (y >> shift) * w + (x >> shift);
                let mut v = rs_to_ts[ctb_rs as usize] << (shift * 2);
                for i in 0..shift {
                    let m = 1u32 << i;
                    if m & x != 0 {
                        v += m * m;
                    }
                    if m & y != 0 {
                        v += 2 * m * m;
                    }
                }
                min_tb_zs[(y * stride + x) as usize] = v;
            }
        }

        Ok(Self {
            width_ctbs: w,
            height_ctbs: h,
            ctb_log2: sps.ctb_log2,
            min_tb_log2: sps.min_tb_log2,
            pic_width: sps.pic_width_in_luma_samples,
            pic_height: sps.pic_height_in_luma_samples,
            col_bd,
            row_bd,
            rs_to_ts,
            ts_to_rs,
            tile_id,
            min_tb_zs,
            min_tb_stride: stride,
        })
    }

    /// 图像中 CTB 总数
    pub fn num_ctbs(&self) -> u32 {
        self.width_ctbs * self.height_ctbs
    }

    pub fn num_tiles(&self) -> usize {
        (self.col_bd.len() - 1) * (self.row_bd.len() - 1)
    }

    pub fn rs_to_ts(&self, rs: u32) -> u32 {
        self.rs_to_ts[rs as usize]
    }

    pub fn ts_to_rs(&self, ts: u32) -> u32 {
        self.ts_to_rs[ts as usize]
    }

    /// 按分块扫描地址取 TileId
    pub fn tile_id(&self, ts: u32) -> u32 {
        self.tile_id[ts as usize]
    }

    /// 按光栅地址取 TileId
    pub fn tile_id_rs(&self, rs: u32) -> u32 {
        self.tile_id[self.rs_to_ts[rs as usize] as usize]
    }

    /// 分块的 CTB 矩形 (x0, y0, x1, y1), 右下开区间
    pub fn tile_rect(&self, tile: u32) -> (u32, u32, u32, u32) {
        let cols = (self.col_bd.len() - 1) as u32;
        let tx = (tile % cols) as usize;
        let ty = (tile / cols) as usize;
        (
            self.col_bd[tx],
            self.row_bd[ty],
            self.col_bd[tx + 1],
            self.row_bd[ty + 1],
        )
    }

    /// 分块扫描地址 ts 处是否开始新分块
    pub fn is_tile_start(&self, ts: u32) -> bool {
        ts == 0 || self.tile_id[ts as usize] != self.tile_id[ts as usize - 1]
    }

    /// 该 CTB 是否位于所在分块某一行的行首
    pub fn is_tile_row_start(&self, rs: u32) -> bool {
        let (x0, ..) = self.tile_rect(self.tile_id_rs(rs));
        rs % self.width_ctbs == x0
    }

    /// 子码流起点: 新分块, 或启用 WPP 时分块内的新一行
    pub fn is_substream_start(&self, ts: u32, wpp: bool) -> bool {
        self.is_tile_start(ts) || (wpp && self.is_tile_row_start(self.ts_to_rs(ts)))
    }

    /// 亮度样本坐标处最小变换块的 z 扫描地址
    pub fn min_tb_zs(&self, x: u32, y: u32) -> u32 {
        let xs = x >> self.min_tb_log2;
        let ys = y >> self.min_tb_log2;
        self.min_tb_zs[(ys * self.min_tb_stride + xs) as usize]
    }

    /// 样本坐标所在 CTB 的光栅地址
    pub fn ctb_rs_at(&self, x: u32, y: u32) -> u32 {
        (y >> self.ctb_log2) * self.width_ctbs + (x >> self.ctb_log2)
    }

    /// 坐标是否在图像内
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.pic_width && (y as u32) < self.pic_height
    }
}

/// 几何缓存: 几何未变化时复用上次的布局
#[derive(Debug, Default)]
pub struct LayoutCache {
    key: Option<LayoutKey>,
    layout: Option<Arc<PictureLayout>>,
}

impl LayoutCache {
    pub fn get(&mut self, sps: &Sps, pps: &Pps) -> BsResult<Arc<PictureLayout>> {
        let key = LayoutKey::of(sps, pps);
        if let (Some(k), Some(layout)) = (&self.key, &self.layout) {
            if *k == key {
                return Ok(Arc::clone(layout));
            }
        }
        let layout = Arc::new(PictureLayout::new(sps, pps)?);
        debug!(
            "重新计算图像布局: {}x{} CTB, {} 个分块",
            layout.width_ctbs,
            layout.height_ctbs,
            layout.num_tiles()
        );
        self.key = Some(key);
        self.layout = Some(Arc::clone(&layout));
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{StreamParams, build_params};

    #[test]
    fn test_single_tile_identity() {
        let (sps, pps) = build_params(&StreamParams::default());
        let l = PictureLayout::new(&sps, &pps).unwrap();
        for rs in 0..l.num_ctbs() {
            assert_eq!(l.rs_to_ts(rs), rs);
            assert_eq!(l.tile_id(rs), 0);
        }
        assert!(l.is_tile_start(0));
        assert!(!l.is_tile_start(1));
    }

    #[test]
    fn test_uniform_tiles_scan_order() {
        // 64x48, CTB 16: 4x3 CTB, 2 列分块 -> 列宽 2,2
        let params = StreamParams {
            width: 64,
            height: 48,
            tile_columns: 2,
            tile_rows: 1,
            ..Default::default()
        };
        let (sps, pps) = build_params(&params);
        let l = PictureLayout::new(&sps, &pps).unwrap();
        assert_eq!(l.col_bd, vec![0, 2, 4]);
        let ts: Vec<u32> = (0..12).map(|rs| l.rs_to_ts(rs)).collect();
        assert_eq!(ts, vec![0, 1, 6, 7, 2, 3, 8, 9, 4, 5, 10, 11]);
        assert!(l.is_tile_start(6));
        assert_eq!(l.tile_id_rs(2), 1);
        assert!(l.is_tile_row_start(2));
        assert!(!l.is_tile_row_start(3));
        assert!(l.is_substream_start(2, true));
        assert!(!l.is_substream_start(2, false));
    }

    #[test]
    fn test_min_tb_zscan() {
        let (sps, pps) = build_params(&StreamParams::default());
        let l = PictureLayout::new(&sps, &pps).unwrap();
        // CTB 16, 最小 TB 4: 每个 CTB 16 个最小块
        assert_eq!(l.min_tb_zs(0, 0), 0);
        assert_eq!(l.min_tb_zs(4, 0), 1);
        assert_eq!(l.min_tb_zs(0, 4), 2);
        assert_eq!(l.min_tb_zs(4, 4), 3);
        assert_eq!(l.min_tb_zs(8, 0), 4);
        assert_eq!(l.min_tb_zs(16, 0), 16);
        assert!(l.min_tb_zs(12, 12) < l.min_tb_zs(16, 0));
    }

    #[test]
    fn test_cache_reuses_layout() {
        let (sps, pps) = build_params(&StreamParams::default());
        let mut cache = LayoutCache::default();
        let a = cache.get(&sps, &pps).unwrap();
        let b = cache.get(&sps, &pps).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
