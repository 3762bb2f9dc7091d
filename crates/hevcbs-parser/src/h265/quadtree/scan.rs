//! 扫描顺序表 (6.5.3 ~ 6.5.5).

use std::sync::OnceLock;

/// 对角, 水平, 垂直
pub const SCAN_DIAG: usize = 0;
pub const SCAN_HORIZ: usize = 1;
pub const SCAN_VERT: usize = 2;

type ScanTable = Vec<(u8, u8)>;

/// [scan_idx][log2_size] 的坐标序列, log2_size 取 0..=5
fn tables() -> &'static [[ScanTable; 6]; 3] {
    static TABLES: OnceLock<[[ScanTable; 6]; 3]> = OnceLock::new();
    TABLES.get_or_init(|| {
        let build = |f: fn(u32) -> ScanTable| std::array::from_fn(|log2| f(1 << log2));
        [build(diagonal), build(horizontal), build(vertical)]
    })
}

fn diagonal(size: u32) -> ScanTable {
    let mut out = Vec::with_capacity((size * size) as usize);
    let (mut x, mut y) = (0i32, 0i32);
    let n = size as i32;
    while out.len() < (size * size) as usize {
        while y >= 0 {
            if x < n && y < n {
                out.push((x as u8, y as u8));
            }
            y -= 1;
            x += 1;
        }
        y = x;
        x = 0;
    }
    out
}

fn horizontal(size: u32) -> ScanTable {
    (0..size)
        .flat_map(|y| (0..size).map(move |x| (x as u8, y as u8)))
        .collect()
}

fn vertical(size: u32) -> ScanTable {
    (0..size)
        .flat_map(|x| (0..size).map(move |y| (x as u8, y as u8)))
        .collect()
}

/// 按扫描类型与块尺寸取扫描序列
pub fn scan_order(scan_idx: usize, log2_size: u32) -> &'static [(u8, u8)] {
    &tables()[scan_idx.min(2)][(log2_size as usize).min(5)]
}

/// 调色板的蛇形遍历序 (6.5.5), 转置时交换坐标
pub fn traverse_pos(log2_size: u32, pos: u32, transpose: bool) -> (u32, u32) {
    let size = 1u32 << log2_size;
    let row = pos >> log2_size;
    let col = pos & (size - 1);
    let x = if row % 2 == 0 { col } else { size - 1 - col };
    if transpose { (row, x) } else { (x, row) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagonal_4x4() {
        let s = scan_order(SCAN_DIAG, 2);
        assert_eq!(&s[..6], &[(0, 0), (0, 1), (1, 0), (0, 2), (1, 1), (2, 0)]);
        assert_eq!(s[15], (3, 3));
        assert_eq!(s.len(), 16);
    }

    #[test]
    fn test_horizontal_vertical() {
        assert_eq!(scan_order(SCAN_HORIZ, 1), &[(0, 0), (1, 0), (0, 1), (1, 1)]);
        assert_eq!(scan_order(SCAN_VERT, 1), &[(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_traverse_snake() {
        assert_eq!(traverse_pos(2, 3, false), (3, 0));
        assert_eq!(traverse_pos(2, 4, false), (3, 1));
        assert_eq!(traverse_pos(2, 7, false), (0, 1));
        assert_eq!(traverse_pos(2, 4, true), (1, 3));
    }
}
