use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use encoding_rs;

// 基础整数类型读取函数
pub fn read_u16<R: Read + ?Sized>(reader: &mut R) -> Result<u16, std::io::Error> {
    reader.read_u16::<LittleEndian>()
}

pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> Result<u32, std::io::Error> {
    reader.read_u32::<LittleEndian>()
}

pub fn read_i32<R: Read + ?Sized>(reader: &mut R) -> Result<i32, std::io::Error> {
    reader.read_i32::<LittleEndian>()
}

// 基础整数类型写入函数
pub fn write_u16(writer: &mut dyn Write, value: u16) -> Result<(), std::io::Error> {
    writer.write_u16::<LittleEndian>(value)
}

pub fn write_u32(writer: &mut dyn Write, value: u32) -> Result<(), std::io::Error> {
    writer.write_u32::<LittleEndian>(value)
}

pub fn write_i32(writer: &mut dyn Write, value: i32) -> Result<(), std::io::Error> {
    writer.write_i32::<LittleEndian>(value)
}

pub fn write_f32(writer: &mut dyn Write, value: f32) -> Result<(), std::io::Error> {
    writer.write_f32::<LittleEndian>(value)
}

// 支持的编码
const SUPPORTED_ENCODINGS: &[&str] = &["utf-8", "windows-1252", "windows-1250", "windows-1251"];

#[derive(Debug, Clone)]
pub struct RawString {
    pub content: String,
    pub encoding: String,
}

impl RawString {
    /// 尝试多种编码解码
    pub fn decode(data: &[u8]) -> Self {
        for encoding_name in SUPPORTED_ENCODINGS {
            if let Some(encoding) = encoding_rs::Encoding::for_label(encoding_name.as_bytes()) {
                let (decoded, _, had_errors) = encoding.decode(data);
                if !had_errors {
                    return RawString {
                        content: decoded.into_owned(),
                        encoding: encoding_name.to_string(),
                    };
                }
            }
        }

        // 回退到UTF-8，忽略错误
        RawString {
            content: String::from_utf8_lossy(data).into_owned(),
            encoding: "utf-8".to_string(),
        }
    }

    /// Z字符串解析(以null结尾)
    pub fn parse_zstring(data: &[u8]) -> Self {
        let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Self::decode(&data[..null_pos])
    }
}

// 记录标志位定义（flags1）
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u32 {
        const MASTER_FILE = 0x00000001;        // ESM标志
        const DELETED = 0x00000020;            // 已删除
        const LOCALIZED = 0x00000080;          // 本地化
        const LIGHT_MASTER = 0x00000200;       // 轻量级主文件
        const PERSISTENT = 0x00000400;         // 持久化
        const DISABLED = 0x00000800;           // 禁用
        const IGNORED = 0x00001000;            // 忽略（合并时跳过）
        const VISIBLE_DISTANT = 0x00008000;    // 远距离可见
        const COMPRESSED = 0x00040000;         // 压缩
    }
}

// CELL DATA 子记录标志位
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CellFlags: u8 {
        const INTERIOR = 0x01;
        const HAS_WATER = 0x02;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_write_u32() {
        let mut out = Vec::new();
        write_u32(&mut out, 0xDEADBEEF).unwrap();
        assert_eq!(out, vec![0xEF, 0xBE, 0xAD, 0xDE]);

        let mut cursor = Cursor::new(&out[..]);
        assert_eq!(read_u32(&mut cursor).unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn test_parse_zstring() {
        let s = RawString::parse_zstring(b"iGoldCost\0junk");
        assert_eq!(s.content, "iGoldCost");
    }

    #[test]
    fn test_ignored_flag() {
        let flags = RecordFlags::from_bits_truncate(0x00001020);
        assert!(flags.contains(RecordFlags::IGNORED));
        assert!(flags.contains(RecordFlags::DELETED));
    }
}
