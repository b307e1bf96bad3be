use crate::datatypes::{RawString, RecordFlags};
use crate::form_id::{MasterIndex, MasterName};
use crate::group::{Container, TopGroup};
use crate::header::{GroupType, Header, Signature};
use crate::load_factory::LoadFactory;
use crate::reader::ModReader;
use crate::record::{PluginRecord, Record};
use crate::utils::{sig_str, EspError, Result};
use memmap2::Mmap;
use std::path::Path;
use std::sync::Arc;

pub mod stats;

pub use stats::{GroupStats, PluginStats};

/// 插件头部记录签名
pub const TES4: Signature = *b"TES4";

/// ESP/ESM 插件：TES4 头部记录 + 顶级组
#[derive(Debug)]
pub struct Plugin {
    /// 文件名（用作自身的主文件名）
    pub name: String,
    /// 头部记录
    pub header: Record,
    /// 顶级组
    pub groups: Vec<TopGroup>,
    /// 主文件列表
    masters: Vec<MasterName>,
    factory: Arc<LoadFactory>,
}

impl Plugin {
    /// 加载插件文件
    ///
    /// 使用内存映射读取；`eager` 为 false 时顶级组保留原始字节，需要时再解析。
    pub fn load(path: impl AsRef<Path>, factory: Arc<LoadFactory>, eager: bool) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let file = std::fs::File::open(path)?;
        // 映射期间文件不会被本进程修改
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_bytes(&name, &mmap[..], factory, eager)
    }

    /// 从内存中的插件字节加载
    pub fn from_bytes(name: &str, data: &[u8], factory: Arc<LoadFactory>, eager: bool) -> Result<Self> {
        let mut reader = ModReader::new(name, data);
        let header = match reader.read_header()? {
            Header::Record(header) if header.signature == TES4 => header,
            other => {
                return Err(reader.format_error(format!(
                    "Expected TES4 header record, found {}",
                    sig_str(&other.signature())
                )))
            }
        };
        let header = Record::from_parts(header, reader.read_bytes(header.size)?);
        let masters = Self::extract_masters(&header)?;

        let mut groups = Vec::new();
        while !reader.at_end(reader.size(), "Plugin")? {
            let group = match reader.read_header()? {
                Header::Group(group) if group.group_type() == GroupType::Top => group,
                other => {
                    return Err(reader.format_error(format!(
                        "Expected top group at 0x{:X}, found {}",
                        reader.tell(),
                        sig_str(&other.signature())
                    )))
                }
            };
            groups.push(TopGroup::load_from(group, Arc::clone(&factory), &mut reader, eager)?);
        }
        tracing::debug!(
            "加载插件 {}：{} 个主文件，{} 个顶级组",
            name,
            masters.len(),
            groups.len()
        );

        Ok(Plugin {
            name: name.to_string(),
            header,
            groups,
            masters,
            factory,
        })
    }

    pub(crate) fn from_parts(
        name: &str,
        header: Record,
        groups: Vec<TopGroup>,
        masters: Vec<MasterName>,
        factory: Arc<LoadFactory>,
    ) -> Self {
        Plugin {
            name: name.to_string(),
            header,
            groups,
            masters,
            factory,
        }
    }

    /// 从头部记录提取主文件列表
    fn extract_masters(header: &Record) -> Result<Vec<MasterName>> {
        Ok(header
            .subrecords()?
            .iter()
            .filter(|sr| &sr.signature == b"MAST")
            .map(|sr| MasterName::new(RawString::parse_zstring(&sr.data).content))
            .collect())
    }

    pub fn masters(&self) -> &[MasterName] {
        &self.masters
    }

    /// 主文件列表加上自身，用于 FormID 长短格式转换
    pub fn master_index(&self) -> MasterIndex {
        MasterIndex::new(self.masters.clone(), MasterName::new(self.name.as_str()))
    }

    pub fn factory(&self) -> &Arc<LoadFactory> {
        &self.factory
    }

    pub fn is_master(&self) -> bool {
        self.header.flags().contains(RecordFlags::MASTER_FILE)
    }

    pub fn top_group(&self, label: &Signature) -> Option<&TopGroup> {
        self.groups.iter().find(|group| &group.label() == label)
    }

    pub fn top_group_mut(&mut self, label: &Signature) -> Option<&mut TopGroup> {
        self.groups.iter_mut().find(|group| &group.label() == label)
    }

    /// 转换全部顶级组的 FormID（会解析原始组）
    pub fn convert_fids(&mut self, to_long: bool) -> Result<()> {
        let index = self.master_index();
        for group in self.groups.iter_mut() {
            group.convert_fids(&index, to_long)?;
        }
        Ok(())
    }

    /// 序列化为字节
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let size = self.header.get_size() as usize
            + self.groups.iter().map(|g| g.get_size() as usize).sum::<usize>();
        let mut output = Vec::with_capacity(size);
        self.header.dump(&mut output)?;
        for group in &self.groups {
            group.dump(&mut output)?;
        }
        Ok(output)
    }

    /// 写入文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let output = self.to_bytes()?;
        std::fs::write(path.as_ref(), &output)?;
        tracing::debug!("写入 {} ({} bytes)", path.as_ref().display(), output.len());
        Ok(())
    }
}

impl std::fmt::Display for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} groups)", self.name, self.groups.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form_id::FormId;
    use crate::game::GameProfile;
    use crate::group::ObjectGroup;
    use crate::header::{GroupHeader, RecordHeader, HEADER_SIZE};
    use crate::subrecord::Subrecord;

    fn factory() -> Arc<LoadFactory> {
        Arc::new(LoadFactory::new(GameProfile::load("falloutnv").unwrap()))
    }

    fn plugin_bytes() -> Vec<u8> {
        let tes4 = Record::new(
            TES4,
            FormId::Short(0),
            0,
            &[
                Subrecord::new(*b"MAST", b"FalloutNV.esm\0".to_vec()),
                Subrecord::new(*b"DATA", vec![0; 8]),
            ],
        )
        .unwrap();
        let mut out = Vec::new();
        tes4.dump(&mut out).unwrap();

        let mut records = Vec::new();
        RecordHeader::new(*b"NPC_", 0, 0, 0x0100_0800).write(&mut records).unwrap();
        GroupHeader::top(*b"NPC_", 0).write(&mut out).unwrap();
        let start = out.len() - HEADER_SIZE as usize;
        out.extend(records);
        let size = (out.len() - start) as u32;
        out[start + 4..start + 8].copy_from_slice(&size.to_le_bytes());
        out
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let data = plugin_bytes();
        for eager in [false, true] {
            let plugin = Plugin::from_bytes("Mod.esp", &data, factory(), eager).unwrap();
            assert_eq!(plugin.masters(), &[MasterName::new("FalloutNV.esm")]);
            assert!(plugin.top_group(b"NPC_").is_some());
            assert_eq!(plugin.to_bytes().unwrap(), data);
        }
    }

    #[test]
    fn test_missing_tes4_is_format_error() {
        let mut data = Vec::new();
        GroupHeader::top(*b"NPC_", 0).write(&mut data).unwrap();
        let err = Plugin::from_bytes("Bad.esp", &data, factory(), false).unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_convert_fids_uses_master_list() {
        let data = plugin_bytes();
        let mut plugin = Plugin::from_bytes("Mod.esp", &data, factory(), false).unwrap();
        plugin.convert_fids(true).unwrap();
        let group = plugin.top_group(b"NPC_").unwrap();
        let fid = group.iter_records().next().unwrap().fid().clone();
        assert_eq!(fid, FormId::long("Mod.esp", 0x800));

        // 长格式不能直接写出
        assert!(matches!(plugin.to_bytes(), Err(EspError::UnconvertedFormId(_))));
        plugin.convert_fids(false).unwrap();
        assert_eq!(plugin.to_bytes().unwrap(), data);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Mod.esp");
        let mut plugin = Plugin::from_bytes("Mod.esp", &plugin_bytes(), factory(), true).unwrap();
        plugin
            .groups
            .push(TopGroup::Objects(ObjectGroup::new(*b"GMST", 0, factory(), "Mod.esp")));
        plugin.save(&path).unwrap();

        // 空组不写出
        let reloaded = Plugin::load(&path, factory(), true).unwrap();
        assert_eq!(reloaded.groups.len(), 1);
        assert_eq!(reloaded.name, "Mod.esp");
    }
}
