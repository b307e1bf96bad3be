use crate::datatypes::{read_u16, write_u16};
use crate::header::Signature;
use crate::utils::{sig_str, EspError, Result};
use std::io::{Cursor, Read, Write};

/// 子记录结构
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subrecord {
    /// 4字符子记录类型
    pub signature: Signature,
    /// 原始数据
    pub data: Vec<u8>,
}

impl Subrecord {
    pub fn new(signature: Signature, data: Vec<u8>) -> Self {
        Subrecord { signature, data }
    }

    /// 解析子记录
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        // 检查是否有足够的数据读取头部
        if cursor.position() + 6 > cursor.get_ref().len() as u64 {
            return Err(EspError::CompressionError(
                "Insufficient data for subrecord header".to_string(),
            ));
        }

        let mut signature = [0u8; 4];
        cursor.read_exact(&mut signature)?;
        let size = read_u16(cursor)?;

        if cursor.position() + size as u64 > cursor.get_ref().len() as u64 {
            return Err(EspError::CompressionError(format!(
                "Insufficient data for subrecord {}: expected {} bytes",
                sig_str(&signature),
                size
            )));
        }

        let mut data = vec![0u8; size as usize];
        cursor.read_exact(&mut data)?;

        Ok(Subrecord { signature, data })
    }

    /// 解析记录数据中的全部子记录（允许末尾少于 6 字节的 NULL 填充）
    pub fn parse_all(data: &[u8]) -> Result<Vec<Subrecord>> {
        let mut subrecords = Vec::new();
        let mut cursor = Cursor::new(data);

        while cursor.position() < data.len() as u64 {
            let remaining = data.len() as u64 - cursor.position();
            if remaining < 6 {
                let tail = &data[cursor.position() as usize..];
                if tail.iter().all(|&b| b == 0) {
                    break;
                }
                return Err(EspError::CompressionError(format!(
                    "记录末尾有 {} 字节非 NULL 数据，无法解析为子记录: {:02X?}",
                    remaining, tail
                )));
            }
            subrecords.push(Subrecord::parse(&mut cursor)?);
        }

        Ok(subrecords)
    }

    /// 写入子记录
    pub fn write(&self, out: &mut dyn Write) -> Result<()> {
        out.write_all(&self.signature)?;
        write_u16(out, self.data.len() as u16)?;
        out.write_all(&self.data)?;
        Ok(())
    }

    /// 写出后的字节数
    pub fn size(&self) -> u32 {
        6 + self.data.len() as u32
    }
}
