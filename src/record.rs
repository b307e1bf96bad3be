use crate::datatypes::{read_i32, read_u32, CellFlags, RawString, RecordFlags};
use crate::form_id::{FormId, LoadSet, MasterIndex, MasterSet};
use crate::header::{RecordHeader, Signature, HEADER_SIZE};
use crate::reader::ModReader;
use crate::subrecord::Subrecord;
use crate::utils::{sig_str, EspError, Result};
use flate2::read::ZlibDecoder;
use std::fmt;
use std::io::{Cursor, Read, Write};

/// FormID 映射函数（源插件长格式 -> 目标长格式）
pub type FidMapper<'a> = &'a dyn Fn(&FormId) -> FormId;

/// 组容器看到的记录接口
///
/// 字段编解码由具体记录类型负责，容器只依赖这些操作。
/// `get_size` 返回数据部分大小（不含 24 字节头部），`dump` 写出头部和数据。
pub trait PluginRecord: fmt::Debug {
    fn header(&self) -> &RecordHeader;

    fn signature(&self) -> Signature {
        self.header().signature
    }

    fn fid(&self) -> &FormId;

    fn set_fid(&mut self, fid: FormId);

    fn flags(&self) -> RecordFlags {
        RecordFlags::from_bits_truncate(self.header().flags1)
    }

    /// 合并时跳过
    fn is_ignored(&self) -> bool {
        self.flags().contains(RecordFlags::IGNORED)
    }

    fn editor_id(&self) -> Option<&str>;

    /// 主文件 0 号 FormID 的此类记录改用 EDID 作为键
    fn is_keyed_by_eid(&self) -> bool {
        false
    }

    fn get_size(&self) -> u32;

    fn dump(&self, out: &mut dyn Write) -> Result<()>;

    fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> Result<()>;

    /// 收集记录引用到的主文件
    fn update_masters(&self, masters: &mut MasterSet);

    /// 去掉指向未加载插件的引用
    fn merge_filter(&mut self, load_set: &LoadSet);

    fn type_copy(&self) -> Box<dyn PluginRecord>;

    fn mapped_copy(&self, mapper: FidMapper<'_>) -> Box<dyn PluginRecord>;

    fn is_interior_cell(&self) -> bool {
        false
    }

    /// 外部单元格网格坐标 (x, y)
    fn grid_position(&self) -> Option<(i32, i32)> {
        None
    }
}

/// 记录写出后的总大小（含头部）
pub fn dumped_size(record: &dyn PluginRecord) -> u32 {
    HEADER_SIZE + record.get_size()
}

/// 默认记录实现
///
/// 数据部分原样保存，只解析出 EDID、CELL 的 DATA 标志和 XCLC 坐标。
/// 不了解字段布局，因此合并过滤不做任何事，引用的主文件只有自身 FormID 的主文件。
#[derive(Debug, Clone)]
pub struct Record {
    /// 原始头部
    pub header: RecordHeader,
    /// FormID（加载时为短格式）
    pub fid: FormId,
    /// 数据部分（压缩记录保持压缩状态）
    pub data: Vec<u8>,
    editor_id: Option<String>,
    cell_flags: Option<CellFlags>,
    grid: Option<(i32, i32)>,
}

impl Record {
    /// 从读取器加载记录（头部已读取）
    pub fn load(header: RecordHeader, reader: &mut ModReader) -> Result<Box<dyn PluginRecord>> {
        let data = reader.read_bytes(header.size)?;
        Ok(Box::new(Self::from_parts(header, data)))
    }

    /// 由头部和数据构造
    pub fn from_parts(header: RecordHeader, data: Vec<u8>) -> Self {
        let mut record = Record {
            fid: FormId::Short(header.fid),
            header,
            data,
            editor_id: None,
            cell_flags: None,
            grid: None,
        };
        record.decode_metadata();
        record
    }

    /// 由子记录构造未压缩的新记录
    pub fn new(signature: Signature, fid: FormId, flags1: u32, subrecords: &[Subrecord]) -> Result<Self> {
        let mut data = Vec::new();
        for subrecord in subrecords {
            subrecord.write(&mut data)?;
        }
        let short = match &fid {
            FormId::Short(value) => *value,
            FormId::Long(..) => 0,
        };
        let header = RecordHeader::new(signature, data.len() as u32, flags1 & !RecordFlags::COMPRESSED.bits(), short);
        let mut record = Self::from_parts(header, data);
        record.fid = fid;
        Ok(record)
    }

    /// 解析子记录（压缩记录先解压）
    pub fn subrecords(&self) -> Result<Vec<Subrecord>> {
        if self.header.flags1 & RecordFlags::COMPRESSED.bits() != 0 {
            let decompressed = Self::decompress_data(&self.data)?;
            Subrecord::parse_all(&decompressed)
        } else {
            Subrecord::parse_all(&self.data)
        }
    }

    fn decode_metadata(&mut self) {
        let subrecords = match self.subrecords() {
            Ok(subrecords) => subrecords,
            Err(e) => {
                tracing::warn!(
                    "记录 {} [{}] 子记录解析失败: {}",
                    sig_str(&self.header.signature),
                    self.fid,
                    e
                );
                return;
            }
        };

        let is_cell = &self.header.signature == b"CELL";
        for subrecord in &subrecords {
            match &subrecord.signature {
                b"EDID" => {
                    self.editor_id = Some(RawString::parse_zstring(&subrecord.data).content);
                }
                b"DATA" if is_cell => {
                    if let Some(&flags) = subrecord.data.first() {
                        self.cell_flags = Some(CellFlags::from_bits_truncate(flags));
                    }
                }
                b"XCLC" if is_cell => {
                    let mut cursor = Cursor::new(&subrecord.data[..]);
                    if let (Ok(x), Ok(y)) = (read_i32(&mut cursor), read_i32(&mut cursor)) {
                        self.grid = Some((x, y));
                    }
                }
                _ => {}
            }
        }
    }

    /// 解压缩数据
    fn decompress_data(data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 4 {
            return Err(EspError::CompressionError("压缩数据太短，无法包含解压大小".to_string()));
        }

        let mut data_cursor = Cursor::new(data);
        let decompressed_size = read_u32(&mut data_cursor)?;

        if decompressed_size > 50_000_000 {
            return Err(EspError::CompressionError(format!(
                "解压大小过大: {} bytes (可能数据损坏)",
                decompressed_size
            )));
        }

        let mut decoder = ZlibDecoder::new(&data[4..]);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| EspError::CompressionError(e.to_string()))?;

        if decompressed.len() != decompressed_size as usize {
            return Err(EspError::CompressionError(format!(
                "解压大小不匹配: 期望 {} bytes，实际 {} bytes",
                decompressed_size,
                decompressed.len()
            )));
        }

        Ok(decompressed)
    }
}

impl PluginRecord for Record {
    fn header(&self) -> &RecordHeader {
        &self.header
    }

    fn fid(&self) -> &FormId {
        &self.fid
    }

    fn set_fid(&mut self, fid: FormId) {
        self.fid = fid;
    }

    fn editor_id(&self) -> Option<&str> {
        self.editor_id.as_deref()
    }

    fn is_keyed_by_eid(&self) -> bool {
        &self.header.signature == b"GMST"
    }

    fn get_size(&self) -> u32 {
        self.data.len() as u32
    }

    fn dump(&self, out: &mut dyn Write) -> Result<()> {
        let mut header = self.header;
        header.size = self.data.len() as u32;
        header.fid = self.fid.as_short()?;
        header.write(out)?;
        out.write_all(&self.data)?;
        Ok(())
    }

    fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> Result<()> {
        self.fid = masters.convert(&self.fid, to_long)?;
        Ok(())
    }

    fn update_masters(&self, masters: &mut MasterSet) {
        masters.add_fid(&self.fid);
    }

    fn merge_filter(&mut self, _load_set: &LoadSet) {}

    fn type_copy(&self) -> Box<dyn PluginRecord> {
        Box::new(self.clone())
    }

    fn mapped_copy(&self, mapper: FidMapper<'_>) -> Box<dyn PluginRecord> {
        let mut copy = self.clone();
        copy.fid = mapper(&self.fid);
        Box::new(copy)
    }

    fn is_interior_cell(&self) -> bool {
        self.cell_flags
            .map(|flags| flags.contains(CellFlags::INTERIOR))
            .unwrap_or(false)
    }

    fn grid_position(&self) -> Option<(i32, i32)> {
        self.grid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    fn cell_subrecords(interior: bool, grid: (i32, i32)) -> Vec<Subrecord> {
        let mut xclc = Vec::new();
        xclc.extend_from_slice(&grid.0.to_le_bytes());
        xclc.extend_from_slice(&grid.1.to_le_bytes());
        vec![
            Subrecord::new(*b"EDID", b"TestCell\0".to_vec()),
            Subrecord::new(*b"DATA", vec![if interior { 1 } else { 0 }]),
            Subrecord::new(*b"XCLC", xclc),
        ]
    }

    #[test]
    fn test_cell_metadata() {
        let record = Record::new(*b"CELL", FormId::Short(0x0100_0ABC), 0, &cell_subrecords(false, (-3, 40))).unwrap();
        assert_eq!(record.editor_id(), Some("TestCell"));
        assert!(!record.is_interior_cell());
        assert_eq!(record.grid_position(), Some((-3, 40)));
    }

    #[test]
    fn test_dump_is_verbatim() {
        let record = Record::new(*b"GLOB", FormId::Short(0x14), 0, &[Subrecord::new(*b"EDID", b"G\0".to_vec())]).unwrap();
        let mut out = Vec::new();
        record.dump(&mut out).unwrap();
        assert_eq!(out.len() as u32, dumped_size(&record));

        let mut reader = ModReader::new("Test.esp", &out);
        let header = match reader.read_header().unwrap() {
            crate::header::Header::Record(header) => header,
            other => panic!("unexpected header {:?}", other),
        };
        let loaded = Record::load(header, &mut reader).unwrap();
        assert_eq!(loaded.fid(), &FormId::Short(0x14));
        assert_eq!(loaded.editor_id(), Some("G"));
    }

    #[test]
    fn test_long_fid_cannot_dump() {
        let record = Record::new(*b"GLOB", FormId::long("A.esm", 1), 0, &[]).unwrap();
        let mut out = Vec::new();
        assert!(matches!(record.dump(&mut out), Err(EspError::UnconvertedFormId(_))));
    }

    #[test]
    fn test_compressed_record_metadata() {
        let mut plain = Vec::new();
        Subrecord::new(*b"EDID", b"Packed\0".to_vec()).write(&mut plain).unwrap();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).unwrap();
        let mut data = (plain.len() as u32).to_le_bytes().to_vec();
        data.extend(encoder.finish().unwrap());

        let header = RecordHeader::new(*b"NPC_", data.len() as u32, RecordFlags::COMPRESSED.bits(), 0x10);
        let record = Record::from_parts(header, data.clone());
        assert_eq!(record.editor_id(), Some("Packed"));
        assert_eq!(record.data, data);
    }

    #[test]
    fn test_gmst_keyed_by_eid() {
        let record = Record::new(*b"GMST", FormId::Short(0), 0, &[]).unwrap();
        assert!(record.is_keyed_by_eid());
    }

    #[test]
    fn test_convert_and_masters() {
        let masters = MasterIndex::new(vec!["FalloutNV.esm".into()], "Mod.esp".into());
        let mut record = Record::new(*b"NPC_", FormId::Short(0x0100_0005), 0, &[]).unwrap();
        record.convert_fids(&masters, true).unwrap();
        assert_eq!(record.fid, FormId::long("Mod.esp", 5));

        let mut set = MasterSet::new();
        record.update_masters(&mut set);
        assert!(set.contains(&"mod.esp".into()));
    }
}
