use crate::header::{Header, Signature, HEADER_SIZE};
use crate::utils::{EspError, Result};
use std::io::Cursor;

/// 插件字节流读取器
///
/// 包装一段内存中的字节（整个文件或某个组的原始数据），
/// 提供读取头部、越界检查和跳转。
#[derive(Debug)]
pub struct ModReader<'a> {
    file_name: String,
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ModReader<'a> {
    pub fn new(file_name: &str, data: &'a [u8]) -> Self {
        ModReader {
            file_name: file_name.to_string(),
            cursor: Cursor::new(data),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// 当前位置
    pub fn tell(&self) -> u64 {
        self.cursor.position()
    }

    /// 数据总长度
    pub fn size(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.tell())
    }

    pub fn format_error(&self, message: impl Into<String>) -> EspError {
        EspError::format(&self.file_name, message)
    }

    /// 读取下一个头部（组或记录）
    pub fn read_header(&mut self) -> Result<Header> {
        if self.remaining() < HEADER_SIZE as u64 {
            return Err(self.format_error(format!(
                "Insufficient data for header at 0x{:X}",
                self.tell()
            )));
        }
        Ok(Header::read(&mut self.cursor)?)
    }

    /// 查看下一个头部的签名，不移动位置
    pub fn peek_signature(&self) -> Option<Signature> {
        let start = self.tell() as usize;
        let data: &'a [u8] = self.cursor.get_ref();
        data.get(start..start + 4).map(|bytes| [bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// 是否已到达区域末尾；越过末尾说明子元素大小与声明不符
    pub fn at_end(&self, end: u64, label: &str) -> Result<bool> {
        let pos = self.tell();
        if end > self.size() {
            return Err(self.format_error(format!(
                "{}: region end 0x{:X} is past end of data (0x{:X})",
                label,
                end,
                self.size()
            )));
        }
        if pos > end {
            return Err(self.format_error(format!(
                "{}: read past end of region (0x{:X} > 0x{:X})",
                label, pos, end
            )));
        }
        Ok(pos == end)
    }

    /// 相对跳转
    pub fn seek(&mut self, offset: i64) -> Result<()> {
        let target = self.tell() as i64 + offset;
        if target < 0 || target as u64 > self.size() {
            return Err(self.format_error(format!(
                "Seek to 0x{:X} is outside of data (0x{:X})",
                target,
                self.size()
            )));
        }
        self.cursor.set_position(target as u64);
        Ok(())
    }

    /// 读取一段借用的字节
    pub fn read_slice(&mut self, len: u32) -> Result<&'a [u8]> {
        let len = len as u64;
        if self.remaining() < len {
            return Err(self.format_error(format!(
                "Insufficient data: expected {} bytes at 0x{:X}",
                len,
                self.tell()
            )));
        }
        let start = self.tell() as usize;
        let data: &'a [u8] = self.cursor.get_ref();
        self.cursor.set_position(start as u64 + len);
        Ok(&data[start..start + len as usize])
    }

    /// 读取一段拷贝的字节
    pub fn read_bytes(&mut self, len: u32) -> Result<Vec<u8>> {
        Ok(self.read_slice(len)?.to_vec())
    }
}
