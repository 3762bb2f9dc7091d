//! HEVC CABAC 算术解码引擎.
//!
//! 逐位装载的标准实现: 初始化读取 9 位, 每次重归一化读取 1 位.
//! 上下文状态以字节存储 (`pStateIdx << 1 | valMps`), 可整体快照,
//! 用于 WPP 行首同步与非独立条带段的上下文继承.

pub mod tables;

use hevcbs_core::{BitCursor, BsResult};

pub use tables::ctx;
use tables::{INIT_VALUES, RANGE_TAB_LPS, TRANS_IDX_LPS, TRANS_IDX_MPS};

// ============================================================
// 上下文表
// ============================================================

/// 全部上下文变量的概率状态
#[derive(Clone, PartialEq, Eq)]
pub struct ContextTable {
    states: [u8; ctx::NUM_CTX],
}

impl Default for ContextTable {
    fn default() -> Self {
        Self {
            states: [0; ctx::NUM_CTX],
        }
    }
}

impl std::fmt::Debug for ContextTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextTable")
            .field("len", &self.states.len())
            .finish()
    }
}

impl ContextTable {
    /// 按 initType 与 SliceQpY 初始化全部上下文
    pub fn init(init_type: usize, slice_qp_y: i32) -> Self {
        let qp = slice_qp_y.clamp(0, 51);
        let mut states = [0u8; ctx::NUM_CTX];
        for (state, &init_value) in states.iter_mut().zip(INIT_VALUES[init_type.min(2)].iter()) {
            *state = init_state(init_value, qp);
        }
        Self { states }
    }

    /// 上下文的 (pStateIdx, valMps)
    pub fn get(&self, idx: usize) -> (u8, u8) {
        let s = self.states[idx];
        (s >> 1, s & 1)
    }

    /// 直接设置上下文状态
    pub fn set(&mut self, idx: usize, state_idx: u8, mps: u8) {
        self.states[idx] = (state_idx << 1) | (mps & 1);
    }
}

/// 由 initValue 与 QP 计算初始状态字节
fn init_state(init_value: u8, qp: i32) -> u8 {
    let slope = i32::from(init_value >> 4) * 5 - 45;
    let offset = (i32::from(init_value & 15) << 3) - 16;
    let pre = (((slope * qp) >> 4) + offset).clamp(1, 126);
    if pre <= 63 {
        ((63 - pre) as u8) << 1
    } else {
        (((pre - 64) as u8) << 1) | 1
    }
}

/// 由条带类型与 cabac_init_flag 推导 initType
pub fn init_type(is_intra: bool, is_p: bool, cabac_init_flag: bool) -> usize {
    if is_intra {
        0
    } else if is_p {
        if cabac_init_flag { 2 } else { 1 }
    } else if cabac_init_flag {
        1
    } else {
        2
    }
}

// ============================================================
// 算术解码器
// ============================================================

/// CABAC 算术解码器
///
/// 持有一个指向条带数据的位游标. PCM 样本等旁路数据通过 [`cursor_mut`] 读取,
/// 读取完成后需重新调用 [`init_engine`].
///
/// [`cursor_mut`]: CabacDecoder::cursor_mut
/// [`init_engine`]: CabacDecoder::init_engine
pub struct CabacDecoder<'a> {
    cursor: BitCursor<'a>,
    range: u32,
    value: u32,
    /// 当前上下文状态
    pub contexts: ContextTable,
    /// 已解码 bin 总数
    bins: u64,
}

impl<'a> CabacDecoder<'a> {
    /// 在游标当前位置创建解码器 (尚未初始化引擎)
    pub fn new(cursor: BitCursor<'a>) -> Self {
        Self {
            cursor,
            range: 510,
            value: 0,
            contexts: ContextTable::default(),
            bins: 0,
        }
    }

    /// 初始化算术解码引擎 (9.3.2.5)
    pub fn init_engine(&mut self) -> BsResult<()> {
        self.range = 510;
        self.value = self.cursor.get_bits(9)?;
        Ok(())
    }

    /// 初始化全部上下文变量
    pub fn init_contexts(&mut self, init_type: usize, slice_qp_y: i32) {
        self.contexts = ContextTable::init(init_type, slice_qp_y);
    }

    /// 底层游标
    pub fn cursor_mut(&mut self) -> &mut BitCursor<'a> {
        &mut self.cursor
    }

    /// 底层游标 (只读)
    pub fn cursor(&self) -> &BitCursor<'a> {
        &self.cursor
    }

    /// 已解码 bin 总数
    pub fn bins(&self) -> u64 {
        self.bins
    }

    /// 当前区间宽度
    pub fn range(&self) -> u32 {
        self.range
    }

    /// 上下文自适应 bin 解码
    #[inline]
    pub fn decode_decision(&mut self, ctx_idx: usize) -> BsResult<u32> {
        self.bins += 1;
        let s = self.contexts.states[ctx_idx];
        let state = usize::from(s >> 1);
        let mps = u32::from(s & 1);
        let lps = u32::from(RANGE_TAB_LPS[state][((self.range >> 6) & 3) as usize]);
        self.range -= lps;

        let bin;
        if self.value >= self.range {
            bin = 1 - mps;
            self.value -= self.range;
            self.range = lps;
            let new_mps = if state == 0 { 1 - mps } else { mps };
            self.contexts.states[ctx_idx] = (TRANS_IDX_LPS[state] << 1) | new_mps as u8;
        } else {
            bin = mps;
            self.contexts.states[ctx_idx] = (TRANS_IDX_MPS[state] << 1) | mps as u8;
        }

        while self.range < 256 {
            self.range <<= 1;
            self.value = (self.value << 1) | self.cursor.get_bit()?;
        }
        Ok(bin)
    }

    /// 等概率 bin 解码
    #[inline]
    pub fn decode_bypass(&mut self) -> BsResult<u32> {
        self.bins += 1;
        self.value = (self.value << 1) | self.cursor.get_bit()?;
        if self.value >= self.range {
            self.value -= self.range;
            Ok(1)
        } else {
            Ok(0)
        }
    }

    /// 连续解码 n 个旁路 bin, 高位在前
    pub fn decode_bypass_bins(&mut self, n: u32) -> BsResult<u32> {
        let mut v = 0u32;
        for _ in 0..n {
            v = (v << 1) | self.decode_bypass()?;
        }
        Ok(v)
    }

    /// 终止 bin 解码 (end_of_slice_segment_flag, end_of_subset_one_bit, pcm_flag)
    pub fn decode_terminate(&mut self) -> BsResult<u32> {
        self.bins += 1;
        self.range -= 2;
        if self.value >= self.range {
            return Ok(1);
        }
        while self.range < 256 {
            self.range <<= 1;
            self.value = (self.value << 1) | self.cursor.get_bit()?;
        }
        Ok(0)
    }

    /// 终止 bin 为 1 之后读取对齐零位
    pub fn finish(&mut self) -> BsResult<()> {
        self.cursor.align_zero()
    }

    /// cabac_bypass_alignment_enabled_flag 生效时的区间对齐
    pub fn align_bypass(&mut self) {
        self.range = 256;
    }
}

// ============================================================
// 二值化辅助
// ============================================================

impl CabacDecoder<'_> {
    /// 截断一元码, 全部 bin 使用同一上下文
    pub fn decode_tu_ctx(&mut self, ctx_idx: usize, c_max: u32) -> BsResult<u32> {
        let mut v = 0;
        while v < c_max && self.decode_decision(ctx_idx)? == 1 {
            v += 1;
        }
        Ok(v)
    }

    /// 截断一元码, 旁路 bin
    pub fn decode_tu_bypass(&mut self, c_max: u32) -> BsResult<u32> {
        let mut v = 0;
        while v < c_max && self.decode_bypass()? == 1 {
            v += 1;
        }
        Ok(v)
    }

    /// k 阶 Exp-Golomb, 旁路 bin (9.3.3.3)
    pub fn decode_egk(&mut self, mut k: u32) -> BsResult<u32> {
        let mut abs = 0u32;
        while self.decode_bypass()? == 1 {
            abs = abs.wrapping_add(1 << k);
            k += 1;
            if k >= 32 {
                return Err(hevcbs_core::BsError::syntax("EGk 前缀过长"));
            }
        }
        if k > 0 {
            abs = abs.wrapping_add(self.decode_bypass_bins(k)?);
        }
        Ok(abs)
    }

    /// 截断二进制码, 旁路 bin (9.3.3.7)
    pub fn decode_tb(&mut self, c_max: u32) -> BsResult<u32> {
        let n = c_max + 1;
        let k = 31 - n.leading_zeros();
        let u = (1u32 << (k + 1)) - n;
        let mut v = self.decode_bypass_bins(k)?;
        if v >= u {
            v = ((v << 1) | self.decode_bypass()?) - u;
        }
        Ok(v)
    }

    /// 定长码, 旁路 bin
    pub fn decode_fl(&mut self, bits: u32) -> BsResult<u32> {
        self.decode_bypass_bins(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::CabacEncoder;

    #[test]
    fn test_init_state_golden() {
        // initValue 154 与 QP 无关: preCtxState=64
        for qp in [0, 22, 37, 51] {
            let t = ContextTable::init(0, qp);
            assert_eq!(t.get(ctx::CU_TRANSQUANT_BYPASS_FLAG), (0, 1));
        }
        // split_cu_flag (I, ctxInc=0), initValue 139, QP 26: m=-5, n=72, pre=63
        let t = ContextTable::init(0, 26);
        assert_eq!(t.get(ctx::SPLIT_CU_FLAG), (0, 0));
        // sao_type_idx (I), initValue 200, QP 26: m=15, n=48, pre=72
        assert_eq!(t.get(ctx::SAO_TYPE_IDX), (8, 1));
        // QP 0 时 pre=n
        let t = ContextTable::init(0, 0);
        assert_eq!(t.get(ctx::SAO_TYPE_IDX), (0, 0));
    }

    #[test]
    fn test_init_is_deterministic() {
        for init_type in 0..3 {
            for qp in [-10, 0, 30, 51, 70] {
                assert_eq!(
                    ContextTable::init(init_type, qp),
                    ContextTable::init(init_type, qp.clamp(0, 51))
                );
            }
        }
    }

    #[test]
    fn test_init_type_selection() {
        assert_eq!(init_type(true, false, true), 0);
        assert_eq!(init_type(false, true, false), 1);
        assert_eq!(init_type(false, true, true), 2);
        assert_eq!(init_type(false, false, false), 2);
        assert_eq!(init_type(false, false, true), 1);
    }

    #[test]
    fn test_decision_bypass_terminate_sequence() {
        let mut enc = CabacEncoder::new();
        enc.init_contexts(0, 30);
        let bins = [1u32, 0, 0, 1, 1, 1, 0, 1, 0, 0, 0, 1];
        for &b in &bins {
            enc.encode_decision(ctx::SPLIT_CU_FLAG + 1, b);
        }
        enc.encode_bypass_bins(0b1011_0110, 8);
        enc.encode_egk(37, 1);
        enc.encode_tb(5, 6);
        enc.encode_terminate(0);
        enc.encode_decision(ctx::PART_MODE, 1);
        enc.encode_terminate(1);
        let data = enc.finish();

        let mut dec = CabacDecoder::new(BitCursor::new_rbsp(&data));
        dec.init_engine().unwrap();
        dec.init_contexts(0, 30);
        for &b in &bins {
            assert_eq!(dec.decode_decision(ctx::SPLIT_CU_FLAG + 1).unwrap(), b);
        }
        assert_eq!(dec.decode_bypass_bins(8).unwrap(), 0b1011_0110);
        assert_eq!(dec.decode_egk(1).unwrap(), 37);
        assert_eq!(dec.decode_tb(6).unwrap(), 5);
        assert_eq!(dec.decode_terminate().unwrap(), 0);
        assert_eq!(dec.decode_decision(ctx::PART_MODE).unwrap(), 1);
        assert_eq!(dec.decode_terminate().unwrap(), 1);
        dec.finish().unwrap();
        assert_eq!(dec.cursor().remaining_raw_bytes(), 0);
    }

    #[test]
    fn test_truncated_data_reports_end_of_buffer() {
        let data = [0xFFu8];
        let mut dec = CabacDecoder::new(BitCursor::new_rbsp(&data));
        assert!(matches!(
            dec.init_engine(),
            Err(hevcbs_core::BsError::EndOfBuffer)
        ));
    }
}
