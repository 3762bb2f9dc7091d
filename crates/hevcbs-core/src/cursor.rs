//! 位游标与 Annex B 字节流窗口.
//!
//! `BitCursor` 在一个 NAL 负载上按位读取 (MSB first), 可选地透明剔除
//! 防竞争字节 (`00 00 03 xx`, xx <= 3). `ByteStream` 维护一个可回填的字节窗口,
//! 负责起始码搜索与 NAL 单元切分.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use bytes::Bytes;

use crate::{BsError, BsResult};

// ============================================================
// BitCursor
// ============================================================

/// NAL 负载位游标
///
/// # 示例
/// ```
/// use hevcbs_core::cursor::BitCursor;
///
/// // 00 00 03 01: 0x03 为防竞争字节, 读取时被跳过
/// let data = [0x00, 0x00, 0x03, 0x01];
/// let mut bc = BitCursor::new(&data);
/// assert_eq!(bc.get_bits(24).unwrap(), 0x000001);
/// ```
#[derive(Clone)]
pub struct BitCursor<'a> {
    /// 原始数据 (可能含防竞争字节)
    data: &'a [u8],
    /// 下一个待装载的原始字节索引
    pos: usize,
    /// 当前字节
    cache: u8,
    /// 当前字节中未读的位数 (0-8)
    bits_left: u32,
    /// 已装载的连续零字节数
    zeros: u32,
    /// 是否剔除防竞争字节
    emulation: bool,
    /// 已剔除的防竞争字节数
    emulation_bytes: usize,
}

impl<'a> BitCursor<'a> {
    /// 创建游标, 默认开启防竞争字节剔除
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_emulation(data, true)
    }

    /// 在已剥离防竞争字节的 RBSP 上创建游标
    pub fn new_rbsp(data: &'a [u8]) -> Self {
        Self::with_emulation(data, false)
    }

    /// 指定是否剔除防竞争字节
    pub fn with_emulation(data: &'a [u8], emulation: bool) -> Self {
        Self {
            data,
            pos: 0,
            cache: 0,
            bits_left: 0,
            zeros: 0,
            emulation,
            emulation_bytes: 0,
        }
    }

    /// 切换防竞争字节剔除
    pub fn set_emulation(&mut self, on: bool) {
        self.emulation = on;
    }

    /// 装载下一个有效字节
    fn load(&mut self) -> BsResult<u8> {
        if self.pos >= self.data.len() {
            return Err(BsError::EndOfBuffer);
        }
        let mut byte = self.data[self.pos];
        if self.emulation && self.zeros >= 2 && byte == 0x03 {
            let next = self.data.get(self.pos + 1).copied();
            if next.is_none_or(|v| v <= 3) {
                self.pos += 1;
                self.zeros = 0;
                self.emulation_bytes += 1;
                if self.pos >= self.data.len() {
                    return Err(BsError::EndOfBuffer);
                }
                byte = self.data[self.pos];
            }
        }
        self.pos += 1;
        self.zeros = if byte == 0 { self.zeros + 1 } else { 0 };
        Ok(byte)
    }

    /// 读取 1 个位
    pub fn get_bit(&mut self) -> BsResult<u32> {
        if self.bits_left == 0 {
            self.cache = self.load()?;
            self.bits_left = 8;
        }
        self.bits_left -= 1;
        Ok(u32::from((self.cache >> self.bits_left) & 1))
    }

    /// 读取 1 个位作为标志
    pub fn get_flag(&mut self) -> BsResult<bool> {
        Ok(self.get_bit()? != 0)
    }

    /// 读取 N 个位 (最多 32 位)
    pub fn get_bits(&mut self, n: u32) -> BsResult<u32> {
        if n > 32 {
            return Err(BsError::InvalidArgument(format!(
                "get_bits: n={} 超过 32 位",
                n
            )));
        }
        let mut value = 0u64;
        let mut remaining = n;
        while remaining > 0 {
            if self.bits_left == 0 {
                self.cache = self.load()?;
                self.bits_left = 8;
            }
            let take = remaining.min(self.bits_left);
            let shift = self.bits_left - take;
            let bits = (u32::from(self.cache) >> shift) & ((1u32 << take) - 1);
            value = (value << take) | u64::from(bits);
            self.bits_left -= take;
            remaining -= take;
        }
        Ok(value as u32)
    }

    /// 读取 1 个字节
    pub fn get_byte(&mut self) -> BsResult<u8> {
        if self.bits_left == 0 {
            return self.load();
        }
        Ok(self.get_bits(8)? as u8)
    }

    /// 读取 N 个字节
    pub fn get_bytes(&mut self, n: usize) -> BsResult<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.get_byte()?);
        }
        Ok(out)
    }

    /// 无符号 Exp-Golomb
    pub fn get_ue(&mut self) -> BsResult<u32> {
        let mut lz = 0u32;
        while self.get_bit()? == 0 {
            lz += 1;
            if lz > 31 {
                return Err(BsError::syntax("Exp-Golomb 前缀过长"));
            }
        }
        if lz == 0 {
            return Ok(0);
        }
        let suffix = self.get_bits(lz)?;
        Ok(((1u64 << lz) + u64::from(suffix) - 1) as u32)
    }

    /// 有符号 Exp-Golomb
    pub fn get_se(&mut self) -> BsResult<i32> {
        let code = self.get_ue()?;
        let magnitude = code.div_ceil(2) as i32;
        if code & 1 == 1 {
            Ok(magnitude)
        } else {
            Ok(-magnitude)
        }
    }

    /// 窥视 N 个位 (不移动位置)
    pub fn peek_bits(&self, n: u32) -> BsResult<u32> {
        self.clone().get_bits(n)
    }

    /// 跳过 N 个位
    pub fn skip_bits(&mut self, mut n: u64) -> BsResult<()> {
        while n >= 32 {
            self.get_bits(32)?;
            n -= 32;
        }
        self.get_bits(n as u32)?;
        Ok(())
    }

    /// 是否位于字节边界
    pub fn is_byte_aligned(&self) -> bool {
        self.bits_left == 0
    }

    /// 丢弃当前字节的剩余位
    pub fn byte_align(&mut self) {
        self.bits_left = 0;
    }

    /// 读取对齐零位直到字节边界, 出现非零位视为语法错误
    pub fn align_zero(&mut self) -> BsResult<()> {
        while !self.is_byte_aligned() {
            if self.get_bit()? != 0 {
                return Err(BsError::syntax("对齐位不为零"));
            }
        }
        Ok(())
    }

    /// 读取 rbsp_trailing_bits
    pub fn trailing_bits(&mut self) -> BsResult<()> {
        if self.get_bit()? != 1 {
            return Err(BsError::syntax("rbsp_stop_one_bit 不为 1"));
        }
        self.align_zero()
    }

    /// 当前位置之后是否还有 RBSP 数据 (rbsp_stop_one_bit 之前)
    pub fn more_rbsp_data(&self) -> bool {
        let Some(last) = self.data.iter().rposition(|&b| b != 0) else {
            return false;
        };
        let stop_bit = last * 8 + 7 - self.data[last].trailing_zeros() as usize;
        self.raw_bit_position() < stop_bit
    }

    /// 以原始数据计的位位置
    pub fn raw_bit_position(&self) -> usize {
        self.pos * 8 - self.bits_left as usize
    }

    /// 以原始数据计的字节位置 (向上取整到下一个字节)
    pub fn raw_byte_position(&self) -> usize {
        self.pos
    }

    /// 已读取的有效位数 (不含防竞争字节)
    pub fn bits_consumed(&self) -> usize {
        self.raw_bit_position() - self.emulation_bytes * 8
    }

    /// 已剔除的防竞争字节数
    pub fn emulation_bytes(&self) -> usize {
        self.emulation_bytes
    }

    /// 剩余原始字节数
    pub fn remaining_raw_bytes(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// 跳转到原始字节偏移处 (字节对齐)
    pub fn seek_raw(&mut self, offset: usize) -> BsResult<()> {
        if offset > self.data.len() {
            return Err(BsError::InvalidArgument(format!(
                "seek_raw: offset={} 超出数据长度 {}",
                offset,
                self.data.len()
            )));
        }
        self.pos = offset;
        self.bits_left = 0;
        self.zeros = self.data[..offset]
            .iter()
            .rev()
            .take(2)
            .take_while(|&&b| b == 0)
            .count() as u32;
        Ok(())
    }

    /// 底层原始数据
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// 移除防竞争字节, 返回 RBSP
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0u32;
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        if zeros >= 2 && byte == 0x03 && data.get(i + 1).is_none_or(|&v| v <= 3) {
            zeros = 0;
            i += 1;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
        i += 1;
    }
    out
}

/// 在切片中查找起始码, 返回 (起始码位置, 起始码长度)
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 2 < data.len() {
        if data[i + 2] > 1 {
            i += 3;
            continue;
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if i > from && data[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

// ============================================================
// ByteStream
// ============================================================

/// 字节流回填回调
///
/// 向 `buf` 末尾追加数据并返回追加的字节数, 返回 0 表示流结束.
pub trait BufferUpdater: Send {
    fn refill(&mut self, buf: &mut Vec<u8>) -> BsResult<usize>;
}

impl<F> BufferUpdater for F
where
    F: FnMut(&mut Vec<u8>) -> BsResult<usize> + Send,
{
    fn refill(&mut self, buf: &mut Vec<u8>) -> BsResult<usize> {
        self(buf)
    }
}

/// 基于文件的回填器
pub struct FileUpdater {
    file: File,
    chunk: usize,
}

impl FileUpdater {
    pub fn new(file: File, chunk: usize) -> Self {
        Self {
            file,
            chunk: chunk.max(4096),
        }
    }
}

impl BufferUpdater for FileUpdater {
    fn refill(&mut self, buf: &mut Vec<u8>) -> BsResult<usize> {
        let start = buf.len();
        buf.resize(start + self.chunk, 0);
        let n = self.file.read(&mut buf[start..])?;
        buf.truncate(start + n);
        Ok(n)
    }
}

/// 一个切出的 NAL 单元 (含 2 字节头, 保留防竞争字节)
#[derive(Debug, Clone)]
pub struct RawNal {
    /// 起始码在整条码流中的偏移
    pub stream_offset: u64,
    /// NAL 数据
    pub data: Bytes,
}

/// Annex B 字节流窗口
pub struct ByteStream {
    buf: Vec<u8>,
    pos: usize,
    /// `buf[0]` 对应的码流绝对偏移
    base_offset: u64,
    updater: Option<Box<dyn BufferUpdater>>,
    eof: bool,
}

impl ByteStream {
    /// 由内存数据创建 (数据即全部码流)
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: data.into(),
            pos: 0,
            base_offset: 0,
            updater: None,
            eof: true,
        }
    }

    /// 由回填回调创建
    pub fn with_updater(updater: Box<dyn BufferUpdater>) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            base_offset: 0,
            updater: Some(updater),
            eof: false,
        }
    }

    /// 打开文件作为码流输入
    pub fn open(path: impl AsRef<Path>, chunk: usize) -> BsResult<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self::with_updater(Box::new(FileUpdater::new(file, chunk))))
    }

    /// 追加数据 (无回填回调时的手动喂数)
    pub fn push_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 标记输入结束
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// 当前绝对偏移
    pub fn position(&self) -> u64 {
        self.base_offset + self.pos as u64
    }

    /// 窗口内剩余字节数
    pub fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// 码流是否已全部消费
    pub fn is_exhausted(&self) -> bool {
        self.eof && self.pos >= self.buf.len()
    }

    /// 丢弃已消费部分
    fn compact(&mut self) {
        if self.pos > 0 && self.pos * 2 >= self.buf.len() {
            self.buf.drain(..self.pos);
            self.base_offset += self.pos as u64;
            self.pos = 0;
        }
    }

    /// 回填一次, 返回是否获得了新数据
    fn refill(&mut self) -> BsResult<bool> {
        if self.eof {
            return Ok(false);
        }
        let Some(updater) = self.updater.as_mut() else {
            return Err(BsError::EndOfBuffer);
        };
        let n = updater.refill(&mut self.buf)?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n > 0)
    }

    /// 从 `from` 开始查找起始码, 必要时回填; 返回 buf 内索引
    fn scan_start_code(&mut self, from: usize) -> BsResult<Option<(usize, usize)>> {
        let mut scan_from = from;
        loop {
            if let Some(found) = find_start_code(&self.buf, scan_from) {
                return Ok(Some(found));
            }
            // 保留末尾 3 字节以便跨块匹配
            scan_from = self.buf.len().saturating_sub(3).max(from);
            if !self.refill()? {
                return Ok(None);
            }
        }
    }

    /// 定位下一个起始码.
    ///
    /// `stop_before` 为真时游标停在起始码之前, 否则停在其后.
    /// 返回起始码的绝对偏移.
    pub fn next_start_code(&mut self, stop_before: bool) -> BsResult<u64> {
        self.compact();
        match self.scan_start_code(self.pos)? {
            Some((start, len)) => {
                let offset = self.base_offset + start as u64;
                self.pos = if stop_before { start } else { start + len };
                Ok(offset)
            }
            None => {
                self.pos = self.buf.len();
                Err(BsError::EndOfBuffer)
            }
        }
    }

    /// 当前单元的结束位置 (下一个起始码或流末尾)
    fn unit_end(&mut self) -> BsResult<usize> {
        Ok(match self.scan_start_code(self.pos)? {
            Some((start, _)) => start,
            None => self.buf.len(),
        })
    }

    /// 复制当前位置到下一个起始码之间的数据并剥离防竞争字节.
    ///
    /// `dst` 不足时返回 `NotEnoughBuffer`, 游标不移动.
    pub fn extract_rbsp(&mut self, dst: &mut [u8]) -> BsResult<usize> {
        self.compact();
        let end = self.unit_end()?;
        let rbsp = remove_emulation_prevention(&self.buf[self.pos..end]);
        if rbsp.len() > dst.len() {
            return Err(BsError::NotEnoughBuffer {
                needed: rbsp.len(),
                available: dst.len(),
            });
        }
        dst[..rbsp.len()].copy_from_slice(&rbsp);
        self.pos = end;
        Ok(rbsp.len())
    }

    /// 读取下一个完整 NAL 单元. 码流结束时返回 `None`.
    pub fn read_nal_unit(&mut self) -> BsResult<Option<RawNal>> {
        let offset = match self.next_start_code(false) {
            Ok(offset) => offset,
            Err(BsError::EndOfBuffer) if self.eof => return Ok(None),
            Err(err) => return Err(err),
        };
        let end = self.unit_end()?;
        let mut nal_end = end;
        // trailing_zero_8bits 不属于 NAL
        while nal_end > self.pos && self.buf[nal_end - 1] == 0 {
            nal_end -= 1;
        }
        let data = Bytes::copy_from_slice(&self.buf[self.pos..nal_end]);
        self.pos = end;
        Ok(Some(RawNal {
            stream_offset: offset,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitwriter::BitWriter;

    #[test]
    fn test_get_bits_basic() {
        let data = [0b1011_0001, 0b0101_0101];
        let mut bc = BitCursor::new(&data);
        assert_eq!(bc.get_bits(1).unwrap(), 1);
        assert_eq!(bc.get_bits(3).unwrap(), 0b011);
        assert_eq!(bc.get_bits(12).unwrap(), 0b0001_0101_0101);
        assert!(matches!(bc.get_bit(), Err(BsError::EndOfBuffer)));
    }

    #[test]
    fn test_exp_golomb_round_trip() {
        let mut bw = BitWriter::new();
        let values = [0u32, 1, 2, 3, 7, 8, 255, 256, 65_535, 1 << 20];
        let signed = [0i32, 1, -1, 2, -2, 1000, -1000];
        for &v in &values {
            bw.write_ue(v);
        }
        for &v in &signed {
            bw.write_se(v);
        }
        bw.write_trailing_bits();
        let data = bw.finish();

        let mut bc = BitCursor::new_rbsp(&data);
        for &v in &values {
            assert_eq!(bc.get_ue().unwrap(), v);
        }
        for &v in &signed {
            assert_eq!(bc.get_se().unwrap(), v);
        }
        bc.trailing_bits().unwrap();
    }

    #[test]
    fn test_emulation_bytes_are_skipped() {
        let data = [0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x01, 0xAB];
        let mut bc = BitCursor::new(&data);
        assert_eq!(bc.get_bytes(5).unwrap(), vec![0x00, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(bc.emulation_bytes(), 2);
        assert_eq!(bc.get_byte().unwrap(), 0xAB);

        // 0x03 后跟 > 3 的值不是防竞争字节
        let data = [0x00, 0x00, 0x03, 0x04];
        let mut bc = BitCursor::new(&data);
        assert_eq!(bc.get_bits(32).unwrap(), 0x0000_0304);
    }

    #[test]
    fn test_remove_emulation_is_idempotent() {
        let raw = [0x00, 0x00, 0x03, 0x03, 0x00, 0x00, 0x03, 0x01, 0x55];
        assert_eq!(
            remove_emulation_prevention(&raw),
            vec![0x00, 0x00, 0x03, 0x00, 0x00, 0x01, 0x55]
        );

        let rbsp = [0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x02, 0x55];
        let escaped = BitWriter::insert_emulation_prevention(&rbsp);
        let stripped = remove_emulation_prevention(&escaped);
        assert_eq!(stripped, rbsp);
        assert_eq!(remove_emulation_prevention(&stripped), stripped);
    }

    #[test]
    fn test_more_rbsp_data() {
        // 数据位 "1" 之后为 stop bit
        let data = [0b1100_0000];
        let mut bc = BitCursor::new(&data);
        assert!(bc.more_rbsp_data());
        bc.get_bit().unwrap();
        assert!(!bc.more_rbsp_data());
        bc.trailing_bits().unwrap();
    }

    #[test]
    fn test_seek_raw_restores_zero_run() {
        let data = [0x00, 0x00, 0x03, 0x01];
        let mut bc = BitCursor::new(&data);
        bc.seek_raw(2).unwrap();
        assert_eq!(bc.get_byte().unwrap(), 0x01);
    }

    #[test]
    fn test_find_start_code() {
        let data = [0xAA, 0x00, 0x00, 0x00, 0x01, 0x40, 0x00, 0x00, 0x01];
        assert_eq!(find_start_code(&data, 0), Some((1, 4)));
        assert_eq!(find_start_code(&data, 5), Some((6, 3)));
        assert_eq!(find_start_code(&data, 7), None);
    }

    #[test]
    fn test_byte_stream_with_chunked_updater() {
        let stream = vec![
            0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0x0C, 0x00, 0x00, 0x01, 0x42, 0x01, 0x00, 0x00,
            0x03, 0x01, 0x00,
        ];
        let mut cursor = 0usize;
        let updater = move |buf: &mut Vec<u8>| -> BsResult<usize> {
            if cursor >= stream.len() {
                return Ok(0);
            }
            buf.push(stream[cursor]);
            cursor += 1;
            Ok(1)
        };
        let mut bs = ByteStream::with_updater(Box::new(updater));
        let first = bs.read_nal_unit().unwrap().unwrap();
        assert_eq!(first.stream_offset, 0);
        assert_eq!(&first.data[..], &[0x40, 0x01, 0x0C]);
        let second = bs.read_nal_unit().unwrap().unwrap();
        assert_eq!(second.stream_offset, 7);
        assert_eq!(&second.data[..], &[0x42, 0x01, 0x00, 0x00, 0x03, 0x01]);
        assert!(bs.read_nal_unit().unwrap().is_none());
    }

    #[test]
    fn test_next_start_code_without_updater() {
        let mut bs = ByteStream::from_bytes(vec![0x11, 0x22, 0x00, 0x00, 0x01, 0x33]);
        assert_eq!(bs.next_start_code(true).unwrap(), 2);
        assert_eq!(bs.position(), 2);
        assert_eq!(bs.next_start_code(false).unwrap(), 2);
        assert_eq!(bs.position(), 5);
        assert!(matches!(bs.next_start_code(false), Err(BsError::EndOfBuffer)));
    }

    #[test]
    fn test_extract_rbsp_not_enough_buffer() {
        let mut bs = ByteStream::from_bytes(vec![0x00, 0x00, 0x03, 0x01, 0x7F, 0x00, 0x00, 0x01]);
        let mut small = [0u8; 2];
        match bs.extract_rbsp(&mut small) {
            Err(BsError::NotEnoughBuffer { needed, available }) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 2);
            }
            other => panic!("应返回 NotEnoughBuffer, 实际 {:?}", other.map(|_| ())),
        }
        let mut big = [0u8; 8];
        let n = bs.extract_rbsp(&mut big).unwrap();
        assert_eq!(&big[..n], &[0x00, 0x00, 0x01, 0x7F]);
        assert_eq!(bs.position(), 5);
    }

    #[test]
    fn test_open_file_stream() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x00, 0x00, 0x01, 0x46, 0x01, 0x10]).unwrap();
        let mut bs = ByteStream::open(file.path(), 4096).unwrap();
        let nal = bs.read_nal_unit().unwrap().unwrap();
        assert_eq!(&nal.data[..], &[0x46, 0x01, 0x10]);
        assert!(bs.read_nal_unit().unwrap().is_none());
    }
}
