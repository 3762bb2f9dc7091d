//! 比特流写入器.
//!
//! 按大端位序 (MSB first) 写入, 与 `BitCursor` 对应. 提供 Exp-Golomb 写入、
//! RBSP 结尾位和防竞争字节插入, 用于构造合成 HEVC 码流.

/// 比特流写入器
///
/// # 示例
/// ```
/// use hevcbs_core::bitwriter::BitWriter;
///
/// let mut bw = BitWriter::new();
/// bw.write_bits(0b1011, 4);
/// bw.write_ue(0); // "1"
/// bw.write_trailing_bits();
/// assert_eq!(bw.finish(), vec![0b1011_1100]);
/// ```
#[derive(Default)]
pub struct BitWriter {
    /// 输出缓冲区
    data: Vec<u8>,
    /// 当前字节 (正在填充)
    current_byte: u8,
    /// 当前字节中已填充的位数 (0-7)
    bit_count: u8,
}

impl BitWriter {
    /// 创建新的比特流写入器
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取已写入的总位数
    pub fn bits_written(&self) -> usize {
        self.data.len() * 8 + self.bit_count as usize
    }

    /// 是否位于字节边界
    pub fn is_byte_aligned(&self) -> bool {
        self.bit_count == 0
    }

    /// 写入 1 个位
    pub fn write_bit(&mut self, bit: u32) {
        self.current_byte = (self.current_byte << 1) | (bit & 1) as u8;
        self.bit_count += 1;
        if self.bit_count == 8 {
            self.data.push(self.current_byte);
            self.current_byte = 0;
            self.bit_count = 0;
        }
    }

    /// 写入标志位
    pub fn write_flag(&mut self, flag: bool) {
        self.write_bit(u32::from(flag));
    }

    /// 写入 N 个位 (最多 32 位), 值的低 N 位高位在前
    pub fn write_bits(&mut self, value: u32, n: u32) {
        debug_assert!(n <= 32, "write_bits: n={} 超过 32 位", n);
        for i in (0..n).rev() {
            self.write_bit((value >> i) & 1);
        }
    }

    /// 写入无符号 Exp-Golomb
    pub fn write_ue(&mut self, value: u32) {
        let code = u64::from(value) + 1;
        let len = 64 - code.leading_zeros();
        for _ in 0..len - 1 {
            self.write_bit(0);
        }
        for i in (0..len).rev() {
            self.write_bit(((code >> i) & 1) as u32);
        }
    }

    /// 写入有符号 Exp-Golomb
    pub fn write_se(&mut self, value: i32) {
        let code = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.write_ue(code);
    }

    /// 写入零位直到字节对齐
    pub fn align_zero(&mut self) {
        while !self.is_byte_aligned() {
            self.write_bit(0);
        }
    }

    /// 写入 rbsp_trailing_bits
    pub fn write_trailing_bits(&mut self) {
        self.write_bit(1);
        self.align_zero();
    }

    /// 写入整字节 (要求字节对齐时直接追加)
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.is_byte_aligned() {
            self.data.extend_from_slice(bytes);
        } else {
            for &b in bytes {
                self.write_bits(u32::from(b), 8);
            }
        }
    }

    /// 完成写入, 不足一字节的部分以零补齐
    pub fn finish(mut self) -> Vec<u8> {
        if self.bit_count > 0 {
            self.current_byte <<= 8 - self.bit_count;
            self.data.push(self.current_byte);
        }
        self.data
    }

    /// 向 RBSP 插入防竞争字节
    pub fn insert_emulation_prevention(rbsp: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64 + 1);
        let mut zeros = 0u32;
        for &b in rbsp {
            if zeros >= 2 && b <= 3 {
                out.push(0x03);
                zeros = 0;
            }
            out.push(b);
            zeros = if b == 0 { zeros + 1 } else { 0 };
        }
        out
    }

    /// 封装为 Annex B NAL 单元: 4 字节起始码 + 2 字节 NAL 头 + 转义后的 RBSP
    pub fn annex_b_nal(nal_type: u8, temporal_id_plus1: u8, rbsp: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x00, 0x01];
        out.push((nal_type & 0x3F) << 1);
        out.push(temporal_id_plus1 & 0x07);
        let mut payload = vec![out[4], out[5]];
        payload.extend_from_slice(rbsp);
        let escaped = Self::insert_emulation_prevention(&payload);
        out.truncate(4);
        out.extend_from_slice(&escaped);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_bits_and_finish() {
        let mut bw = BitWriter::new();
        bw.write_bits(0b1011, 4);
        bw.write_bits(0b0001, 4);
        bw.write_bits(0b0101_0101, 8);
        bw.write_bit(1);
        assert_eq!(bw.bits_written(), 17);
        assert_eq!(bw.finish(), vec![0b1011_0001, 0b0101_0101, 0b1000_0000]);
    }

    #[test]
    fn test_write_ue_codes() {
        let mut bw = BitWriter::new();
        bw.write_ue(0); // 1
        bw.write_ue(1); // 010
        bw.write_ue(2); // 011
        bw.write_ue(3); // 00100
        assert_eq!(bw.finish(), vec![0b1010_0110, 0b0100_0000]);
    }

    #[test]
    fn test_insert_emulation_prevention() {
        let rbsp = [0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04];
        assert_eq!(
            BitWriter::insert_emulation_prevention(&rbsp),
            vec![0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00, 0x04]
        );
    }

    #[test]
    fn test_annex_b_nal_header() {
        let nal = BitWriter::annex_b_nal(33, 1, &[0x01]);
        assert_eq!(nal, vec![0x00, 0x00, 0x00, 0x01, 0x42, 0x01, 0x01]);
    }
}
