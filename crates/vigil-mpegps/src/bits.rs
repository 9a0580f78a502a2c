//! 位级读写游标。PS 的包头字段大量跨字节（33 位 SCR、22 位码率等），
//! 统一用 MSB-first 的位游标处理。

/// 只读位游标。读取前由调用方确认剩余长度，越界读取返回已有的位。
pub struct BitReader<'a> {
    data: &'a [u8],
    /// 位偏移。
    pos: usize,
    mark: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BitReader { data, pos: 0, mark: 0 }
    }

    pub fn remain_bits(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    pub fn remain_bytes(&self) -> usize {
        self.remain_bits() / 8
    }

    pub fn eos(&self) -> bool {
        self.remain_bits() == 0
    }

    /// 当前位偏移，配合 [`Self::seek`] 实现解码失败时整体回退。
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len() * 8);
    }

    /// 预读 n 位，不移动游标。剩余不足 n 位时返回 `None`。
    pub fn next_bits(&self, n: usize) -> Option<u64> {
        if self.remain_bits() < n {
            return None;
        }
        let mut probe = BitReader { data: self.data, pos: self.pos, mark: 0 };
        Some(probe.read_bits(n))
    }

    /// 读取 n 位（n <= 64）。
    pub fn read_bits(&mut self, mut n: usize) -> u64 {
        let mut v: u64 = 0;
        let total = self.data.len() * 8;
        while n > 0 && self.pos < total {
            let byte = self.data[self.pos / 8];
            let avail = 8 - self.pos % 8;
            let take = avail.min(n);
            let mask = ((1u16 << take) - 1) as u8;
            let bits = (byte >> (avail - take)) & mask;
            v = (v << take) | u64::from(bits);
            self.pos += take;
            n -= take;
        }
        v
    }

    pub fn read_u8(&mut self, n: usize) -> u8 {
        self.read_bits(n) as u8
    }

    pub fn read_u16(&mut self, n: usize) -> u16 {
        self.read_bits(n) as u16
    }

    pub fn read_u32(&mut self, n: usize) -> u32 {
        self.read_bits(n) as u32
    }

    pub fn read_bit(&mut self) -> u8 {
        self.read_bits(1) as u8
    }

    pub fn skip_bits(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len() * 8);
    }

    pub fn mark(&mut self) {
        self.mark = self.pos;
    }

    pub fn bits_since_mark(&self) -> usize {
        self.pos - self.mark
    }

    /// 从游标所在字节起的剩余数据。调用处都在字节边界上。
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[(self.pos + 7) / 8..]
    }
}

/// 写游标。长度字段先占位、写完载荷后回填。
pub struct BitWriter {
    buf: Vec<u8>,
    nbits: usize,
    mark: usize,
}

impl BitWriter {
    pub fn new(capacity: usize) -> Self {
        BitWriter { buf: Vec::with_capacity(capacity), nbits: 0, mark: 0 }
    }

    pub fn put_bits(&mut self, value: u64, mut n: usize) {
        while n > 0 {
            let byte_idx = self.nbits / 8;
            if byte_idx == self.buf.len() {
                self.buf.push(0);
            }
            let free = 8 - self.nbits % 8;
            let take = free.min(n);
            let bits = ((value >> (n - take)) & ((1u64 << take) - 1)) as u8;
            self.buf[byte_idx] |= bits << (free - take);
            self.nbits += take;
            n -= take;
        }
    }

    pub fn put_u8(&mut self, value: u8, n: usize) {
        self.put_bits(u64::from(value), n);
    }

    pub fn put_u16(&mut self, value: u16, n: usize) {
        self.put_bits(u64::from(value), n);
    }

    pub fn put_u32(&mut self, value: u32, n: usize) {
        self.put_bits(u64::from(value), n);
    }

    pub fn put_u64(&mut self, value: u64, n: usize) {
        self.put_bits(value, n);
    }

    pub fn put_byte(&mut self, value: u8) {
        self.put_bits(u64::from(value), 8);
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        for &b in data {
            self.put_byte(b);
        }
    }

    pub fn put_repeat(&mut self, value: u8, count: usize) {
        for _ in 0..count {
            self.put_byte(value);
        }
    }

    pub fn byte_offset(&self) -> usize {
        self.nbits / 8
    }

    /// 回填 16 位长度字段。
    pub fn set_u16_at(&mut self, value: u16, byte_offset: usize) {
        self.buf[byte_offset] = (value >> 8) as u8;
        self.buf[byte_offset + 1] = value as u8;
    }

    pub fn mark(&mut self) {
        self.mark = self.nbits;
    }

    pub fn bits_since_mark(&self) -> usize {
        self.nbits - self.mark
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.nbits = 0;
        self.mark = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_crosses_byte_boundaries() {
        let data = [0b1010_1100, 0b0101_0011];
        let mut bs = BitReader::new(&data);
        assert_eq!(bs.read_bits(3), 0b101);
        assert_eq!(bs.read_bits(6), 0b011000);
        assert_eq!(bs.read_bits(7), 0b1010011);
        assert!(bs.eos());
    }

    #[test]
    fn reader_peek_does_not_advance() {
        let data = [0x00, 0x00, 0x01, 0xBA];
        let bs = BitReader::new(&data);
        assert_eq!(bs.next_bits(32), Some(0x000001BA));
        assert_eq!(bs.next_bits(32), Some(0x000001BA));
        assert_eq!(bs.next_bits(33), None);
    }

    #[test]
    fn reader_seek_restores_position() {
        let data = [0xFF, 0x00, 0xFF];
        let mut bs = BitReader::new(&data);
        let at = bs.pos();
        bs.read_bits(12);
        bs.seek(at);
        assert_eq!(bs.read_bits(8), 0xFF);
    }

    #[test]
    fn writer_round_trips_odd_widths() {
        let mut bsw = BitWriter::new(16);
        bsw.put_u8(0b01, 2);
        bsw.put_u64(0x1_2345_6789 >> 30, 3);
        bsw.put_u8(1, 1);
        bsw.put_u32(0x3FFFFF, 22);
        let mut bs = BitReader::new(bsw.data());
        assert_eq!(bs.read_bits(2), 0b01);
        assert_eq!(bs.read_bits(3), (0x1_2345_6789u64 >> 30) & 0x7);
        assert_eq!(bs.read_bits(1), 1);
        assert_eq!(bs.read_bits(22), 0x3FFFFF);
    }

    #[test]
    fn writer_patches_length_field() {
        let mut bsw = BitWriter::new(16);
        bsw.put_bytes(&[0x00, 0x00, 0x01, 0xBB]);
        let loc = bsw.byte_offset();
        bsw.put_u16(0, 16);
        bsw.mark();
        bsw.put_bytes(&[0xAA, 0xBB, 0xCC]);
        let len = bsw.bits_since_mark() / 8;
        bsw.set_u16_at(len as u16, loc);
        assert_eq!(bsw.data()[loc..loc + 2], [0x00, 0x03]);
    }
}
