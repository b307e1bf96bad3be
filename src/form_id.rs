//! FormID 的两种表示及主文件索引
//!
//! - 短格式：插件内的 32 位整数，高 8 位是主文件序号
//! - 长格式：(主文件名, 24 位本地 ID)，与加载顺序无关
//!
//! 容器内部始终使用长格式，只在加载/保存边界转换。

use crate::utils::{EspError, Result};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// 主文件名（大小写不敏感）
#[derive(Clone)]
pub struct MasterName {
    name: String,
    folded: String,
}

impl MasterName {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let folded = name.to_lowercase();
        MasterName { name, folded }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl PartialEq for MasterName {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}

impl Eq for MasterName {}

impl Hash for MasterName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}

impl PartialOrd for MasterName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MasterName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.folded.cmp(&other.folded)
    }
}

impl fmt::Debug for MasterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.name)
    }
}

impl fmt::Display for MasterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for MasterName {
    fn from(name: &str) -> Self {
        MasterName::new(name)
    }
}

impl From<String> for MasterName {
    fn from(name: String) -> Self {
        MasterName::new(name)
    }
}

/// 记录标识
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FormId {
    /// 短格式（相对于当前主文件列表）
    Short(u32),
    /// 长格式（所属主文件, 本地ID）
    Long(MasterName, u32),
}

impl FormId {
    pub fn long(master: impl Into<MasterName>, object_id: u32) -> Self {
        FormId::Long(master.into(), object_id & 0x00FF_FFFF)
    }

    /// 低 24 位本地 ID
    pub fn object_id(&self) -> u32 {
        match self {
            FormId::Short(value) => value & 0x00FF_FFFF,
            FormId::Long(_, object_id) => *object_id,
        }
    }

    pub fn master(&self) -> Option<&MasterName> {
        match self {
            FormId::Short(_) => None,
            FormId::Long(master, _) => Some(master),
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, FormId::Long(..))
    }

    /// 写出时使用的短格式值
    pub fn as_short(&self) -> Result<u32> {
        match self {
            FormId::Short(value) => Ok(*value),
            FormId::Long(..) => Err(EspError::UnconvertedFormId(self.clone())),
        }
    }

    /// 是否为某主文件的 0 号记录（GMST 等按 EDID 索引的记录使用）
    pub fn is_null_of(&self, master: &MasterName) -> bool {
        match self {
            FormId::Long(m, 0) => m == master,
            _ => false,
        }
    }
}

impl fmt::Display for FormId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormId::Short(value) => write!(f, "{:08X}", value),
            FormId::Long(master, object_id) => write!(f, "{}:{:06X}", master, object_id),
        }
    }
}

/// 插件的主文件列表（最后一项为插件自身）
#[derive(Debug, Clone)]
pub struct MasterIndex {
    file_name: String,
    masters: Vec<MasterName>,
}

impl MasterIndex {
    pub fn new(masters: Vec<MasterName>, this_file: MasterName) -> Self {
        let file_name = this_file.as_str().to_string();
        let mut masters = masters;
        masters.push(this_file);
        MasterIndex { file_name, masters }
    }

    /// 主文件列表（包含插件自身）
    pub fn masters(&self) -> &[MasterName] {
        &self.masters
    }

    /// 短格式转长格式；超出范围的序号视为插件自身
    pub fn to_long(&self, fid: &FormId) -> Result<FormId> {
        match fid {
            FormId::Long(..) => Ok(fid.clone()),
            FormId::Short(value) => {
                let index = (*value >> 24) as usize;
                let master = self
                    .masters
                    .get(index)
                    .or_else(|| self.masters.last())
                    .ok_or_else(|| EspError::MissingMaster {
                        file: self.file_name.clone(),
                        master: format!("#{}", index),
                    })?;
                Ok(FormId::Long(master.clone(), value & 0x00FF_FFFF))
            }
        }
    }

    /// 长格式转短格式
    pub fn to_short(&self, fid: &FormId) -> Result<FormId> {
        match fid {
            FormId::Short(_) => Ok(fid.clone()),
            FormId::Long(master, object_id) => {
                let index = self
                    .masters
                    .iter()
                    .position(|m| m == master)
                    .ok_or_else(|| EspError::MissingMaster {
                        file: self.file_name.clone(),
                        master: master.to_string(),
                    })?;
                Ok(FormId::Short(((index as u32) << 24) | object_id))
            }
        }
    }

    pub fn convert(&self, fid: &FormId, to_long: bool) -> Result<FormId> {
        if to_long {
            self.to_long(fid)
        } else {
            self.to_short(fid)
        }
    }
}

/// 当前启用的插件集合
pub type LoadSet = HashSet<MasterName>;

/// 记录实际引用的主文件集合
#[derive(Debug, Clone, Default)]
pub struct MasterSet(HashSet<MasterName>);

impl MasterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个 FormID 的所属主文件（短格式无从得知，忽略）
    pub fn add_fid(&mut self, fid: &FormId) {
        if let Some(master) = fid.master() {
            self.0.insert(master.clone());
        }
    }

    pub fn insert(&mut self, master: MasterName) {
        self.0.insert(master);
    }

    pub fn contains(&self, master: &MasterName) -> bool {
        self.0.contains(master)
    }

    /// 所有主文件是否都已加载
    pub fn loaded_in(&self, load_set: &LoadSet) -> bool {
        self.0.is_subset(load_set)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MasterName> {
        self.0.iter()
    }
}

/// 保留集合与合并集合中的键：FormID，或按 EDID 索引记录的编辑器ID
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Fid(FormId),
    Eid(String),
}

impl From<FormId> for RecordKey {
    fn from(fid: FormId) -> Self {
        RecordKey::Fid(fid)
    }
}

impl From<&FormId> for RecordKey {
    fn from(fid: &FormId) -> Self {
        RecordKey::Fid(fid.clone())
    }
}

pub type RecordKeySet = HashSet<RecordKey>;

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> MasterIndex {
        MasterIndex::new(
            vec!["FalloutNV.esm".into(), "DeadMoney.esm".into()],
            "MyMod.esp".into(),
        )
    }

    #[test]
    fn test_master_name_case_insensitive() {
        let a = MasterName::new("FalloutNV.esm");
        let b = MasterName::new("falloutnv.ESM");
        assert_eq!(a, b);
        assert_eq!(b.as_str(), "falloutnv.ESM");
    }

    #[test]
    fn test_short_to_long() {
        let masters = index();
        let fid = masters.to_long(&FormId::Short(0x0100_1234)).unwrap();
        assert_eq!(fid, FormId::long("DeadMoney.esm", 0x1234));
    }

    #[test]
    fn test_out_of_range_index_resolves_to_self() {
        let masters = index();
        let fid = masters.to_long(&FormId::Short(0x0700_0800)).unwrap();
        assert_eq!(fid, FormId::long("MyMod.esp", 0x800));
    }

    #[test]
    fn test_long_to_short() {
        let masters = index();
        let fid = masters.to_short(&FormId::long("mymod.esp", 0xABC)).unwrap();
        assert_eq!(fid, FormId::Short(0x0200_0ABC));
    }

    #[test]
    fn test_missing_master() {
        let masters = index();
        let err = masters.to_short(&FormId::long("Other.esp", 1)).unwrap_err();
        assert!(matches!(err, EspError::MissingMaster { .. }));
    }

    #[test]
    fn test_long_form_cannot_be_written() {
        assert!(FormId::long("A.esm", 1).as_short().is_err());
        assert_eq!(FormId::Short(7).as_short().unwrap(), 7);
    }

    #[test]
    fn test_master_set_loaded_in() {
        let mut set = MasterSet::new();
        set.add_fid(&FormId::long("A.esm", 1));
        set.add_fid(&FormId::Short(3));

        let mut load_set = LoadSet::new();
        assert!(!set.loaded_in(&load_set));
        load_set.insert("a.esm".into());
        assert!(set.loaded_in(&load_set));
    }
}
