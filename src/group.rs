//! 组容器
//!
//! 插件中的记录按组嵌套存放。每个容器要么保存未解析的原始字节，
//! 要么保存解析后的子元素，两者只有一个有效：
//!
//! - 原始状态：`get_size`/`dump` 原样输出，保证逐字节往返
//! - 解析状态：大小和输出都从子元素递归计算
//!
//! 状态只能从原始转为解析，不能反向。

pub mod cell_block;
pub mod cells;
pub mod dialogue;
pub mod objects;
pub mod world;

use crate::form_id::{FormId, LoadSet, MasterIndex, MasterSet, RecordKey, RecordKeySet};
use crate::header::{Header, GroupHeader, Signature, HEADER_SIZE};
use crate::load_factory::LoadFactory;
use crate::reader::ModReader;
use crate::record::{dumped_size, FidMapper, PluginRecord};
use crate::utils::{sig_str, EspError, Result};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;

pub use cell_block::CellBlock;
pub use cells::{BlockLabel, BucketKey, CellBuckets, InteriorCellContainer};
pub use dialogue::{DialogueGroup, Topic};
pub use objects::ObjectGroup;
pub use world::{WorldBlock, WorldGroup};

/// 递归遍历得到的记录序列
pub type RecordIter<'a> = Box<dyn Iterator<Item = &'a dyn PluginRecord> + 'a>;

/// 所有组容器共享的操作
pub trait Container {
    fn header(&self) -> &GroupHeader;

    /// 从读取器加载（容器头部已读取）。`eager` 为 false 时只保存原始字节
    fn load(&mut self, reader: &mut ModReader, eager: bool) -> Result<()>;

    /// 强制解析原始字节
    fn unpack(&mut self) -> Result<()>;

    /// 是否已解析（解析后大小与输出由子元素决定）
    fn is_changed(&self) -> bool;

    /// 写出的总字节数（含自身头部）
    fn get_size(&self) -> u32;

    /// 写出的记录数，`include_groups` 时包含组头部
    fn get_num_records(&self, include_groups: bool) -> Result<usize>;

    fn dump(&self, out: &mut dyn Write) -> Result<()>;

    fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> Result<()>;

    fn all_signatures(&self) -> HashSet<Signature>;

    fn index_records(&mut self);

    /// 按固定顺序遍历所有记录；原始状态的容器不产生记录
    fn iter_records(&self) -> RecordIter<'_>;

    /// 只保留键在 `keep` 中的记录。保留了子记录的单元格/世界会把自身加入 `keep`
    fn keep_records(&mut self, keep: &mut RecordKeySet) -> Result<()>;

    /// 把 `src` 的记录合并进来，并就地过滤 `src`
    fn merge_records(
        &mut self,
        src: &mut Self,
        load_set: &LoadSet,
        merge_ids: &mut RecordKeySet,
        ii_skip_merge: bool,
        do_filter: bool,
    ) -> Result<()>
    where
        Self: Sized;

    fn update_masters(&self, masters: &mut MasterSet);

    /// 用 `src` 中已存在于自身的记录更新自身
    fn update_records(&mut self, src: &Self, mapper: FidMapper<'_>, merge_ids: &mut RecordKeySet) -> Result<()>
    where
        Self: Sized;
}

/// 原始字节的记录统计缓存
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawCounts {
    records: usize,
    groups: usize,
}

/// 原始字节或解析后的子元素
#[derive(Debug)]
pub(crate) enum Body<T> {
    Raw { data: Vec<u8>, counts: Cell<Option<RawCounts>> },
    Parsed(T),
}

/// 可以从读取器解析出的容器内容
pub(crate) trait Contents: Sized {
    fn load_contents(core: &GroupCore, reader: &mut ModReader, end: u64) -> Result<Self>;
}

impl<T> Body<T> {
    pub fn raw(data: Vec<u8>) -> Self {
        Body::Raw {
            data,
            counts: Cell::new(None),
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, Body::Parsed(_))
    }

    pub fn parsed(&self) -> Option<&T> {
        match self {
            Body::Parsed(contents) => Some(contents),
            Body::Raw { .. } => None,
        }
    }

    /// 原始字节的大小（含头部）
    fn raw_size(&self) -> Option<u32> {
        match self {
            Body::Raw { data, .. } => Some(HEADER_SIZE + data.len() as u32),
            Body::Parsed(_) => None,
        }
    }

    /// 原样输出头部与原始字节
    fn dump_raw(&self, header: &GroupHeader, out: &mut dyn Write) -> Result<bool> {
        match self {
            Body::Raw { data, .. } => {
                header.write(out)?;
                out.write_all(data)?;
                Ok(true)
            }
            Body::Parsed(_) => Ok(false),
        }
    }

    /// 原始字节的记录数（只读头部，不解析）
    fn raw_num_records(&self, core: &GroupCore, include_groups: bool) -> Result<Option<usize>> {
        let (data, counts) = match self {
            Body::Raw { data, counts } => (data, counts),
            Body::Parsed(_) => return Ok(None),
        };
        let tally = match counts.get() {
            Some(tally) => tally,
            None => {
                let tally = scan_counts(core, data)?;
                counts.set(Some(tally));
                tally
            }
        };
        let groups = if include_groups { tally.groups + 1 } else { 0 };
        Ok(Some(tally.records + groups))
    }
}

impl<T: Contents> Body<T> {
    pub(crate) fn load(core: &GroupCore, reader: &mut ModReader, eager: bool) -> Result<Self> {
        let payload = core.header.payload_size();
        if eager {
            let end = reader.tell() + payload as u64;
            let contents = T::load_contents(core, reader, end)?;
            Ok(Body::Parsed(contents))
        } else {
            Ok(Body::raw(reader.read_bytes(payload)?))
        }
    }

    /// 原始 -> 解析
    pub(crate) fn unpack(&mut self, core: &GroupCore) -> Result<&mut T> {
        if let Body::Raw { data, .. } = self {
            let contents = {
                let mut reader = ModReader::new(core.file_name(), data);
                T::load_contents(core, &mut reader, data.len() as u64)?
            };
            tracing::debug!(
                "解析组 {} ({} bytes)",
                core.describe(),
                data.len()
            );
            *self = Body::Parsed(contents);
        }
        match self {
            Body::Parsed(contents) => Ok(contents),
            Body::Raw { .. } => Err(core.error("group body is still raw after unpacking")),
        }
    }
}

/// 只读头部统计记录数与组数
fn scan_counts(core: &GroupCore, data: &[u8]) -> Result<RawCounts> {
    let mut reader = ModReader::new(core.file_name(), data);
    let end = data.len() as u64;
    let label = core.describe();
    let mut tally = RawCounts { records: 0, groups: 0 };
    while !reader.at_end(end, &label)? {
        match reader.read_header()? {
            // 组的内容紧随其后，继续逐个读取
            Header::Group(_) => tally.groups += 1,
            Header::Record(header) => {
                reader.seek(header.size as i64)?;
                tally.records += 1;
            }
        }
    }
    Ok(tally)
}

/// 容器的公共字段
#[derive(Debug, Clone)]
pub struct GroupCore {
    pub header: GroupHeader,
    file_name: String,
    factory: Arc<LoadFactory>,
}

impl GroupCore {
    pub fn new(header: GroupHeader, factory: Arc<LoadFactory>, file_name: &str) -> Self {
        GroupCore {
            header,
            file_name: file_name.to_string(),
            factory,
        }
    }

    /// 派生一个子容器的公共字段
    pub fn child(&self, header: GroupHeader) -> Self {
        GroupCore {
            header,
            file_name: self.file_name.clone(),
            factory: Arc::clone(&self.factory),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn factory(&self) -> &Arc<LoadFactory> {
        &self.factory
    }

    pub fn stamp(&self) -> u32 {
        self.header.stamp
    }

    pub fn error(&self, message: impl Into<String>) -> EspError {
        EspError::format(&self.file_name, message)
    }

    fn describe(&self) -> String {
        format!(
            "{} group {}",
            self.header.group_type,
            sig_str(&self.header.label)
        )
    }

    /// 记录在索引与合并集合中的键
    pub fn record_key(&self, record: &dyn PluginRecord) -> RecordKey {
        record_key(record, self.factory.game_master())
    }
}

/// 主文件 0 号 FormID 且按 EDID 索引的记录以 EDID 为键
pub fn record_key(record: &dyn PluginRecord, game_master: &crate::form_id::MasterName) -> RecordKey {
    if record.is_keyed_by_eid() && record.fid().is_null_of(game_master) {
        if let Some(eid) = record.editor_id() {
            return RecordKey::Eid(eid.to_string());
        }
    }
    RecordKey::Fid(record.fid().clone())
}

/// FormID 索引缓存，子元素变化时必须清空
#[derive(Debug, Default, Clone)]
pub struct FidIndex {
    slots: Option<HashMap<RecordKey, usize>>,
}

impl FidIndex {
    pub fn is_built(&self) -> bool {
        self.slots.is_some()
    }

    pub fn clear(&mut self) {
        self.slots = None;
    }

    /// 按位置重建
    pub fn rebuild(&mut self, keys: impl Iterator<Item = RecordKey>) {
        self.slots = Some(keys.enumerate().map(|(pos, key)| (key, pos)).collect());
    }

    pub fn get(&self, key: &RecordKey) -> Option<usize> {
        self.slots.as_ref().and_then(|slots| slots.get(key).copied())
    }

    /// 登记新位置（未建立索引时忽略）
    pub fn insert(&mut self, key: RecordKey, pos: usize) {
        if let Some(slots) = &mut self.slots {
            slots.insert(key, pos);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.as_ref().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 合并过滤：去掉未加载插件的引用后，记录是否仍然完整可用
pub fn passes_filter(record: &mut dyn PluginRecord, load_set: &LoadSet) -> bool {
    record.merge_filter(load_set);
    let mut masters = MasterSet::new();
    record.update_masters(&mut masters);
    masters.loaded_in(load_set)
}

/// 单值子记录合并前的身份检查
pub(crate) fn check_identity(dest: Option<&dyn PluginRecord>, src_fid: &FormId) -> Result<()> {
    match dest {
        Some(dest) if dest.fid() != src_fid => Err(EspError::IdentityMismatch {
            dest: dest.fid().clone(),
            src: src_fid.clone(),
        }),
        _ => Ok(()),
    }
}

/// 一组记录写出的大小（每条含头部）
pub(crate) fn records_size(records: &[Box<dyn PluginRecord>]) -> u32 {
    records.iter().map(|record| dumped_size(record.as_ref())).sum()
}

pub(crate) fn dump_records(records: &[Box<dyn PluginRecord>], out: &mut dyn Write) -> Result<()> {
    for record in records {
        record.dump(out)?;
    }
    Ok(())
}

pub(crate) fn convert_records(records: &mut [Box<dyn PluginRecord>], masters: &MasterIndex, to_long: bool) -> Result<()> {
    for record in records.iter_mut() {
        record.convert_fids(masters, to_long)?;
    }
    Ok(())
}

/// 顶级组
#[derive(Debug)]
pub enum TopGroup {
    Objects(ObjectGroup),
    Dialogue(DialogueGroup),
    InteriorCells(InteriorCellContainer),
    Worlds(WorldGroup),
}

macro_rules! dispatch {
    ($self:expr, $group:ident => $body:expr) => {
        match $self {
            TopGroup::Objects($group) => $body,
            TopGroup::Dialogue($group) => $body,
            TopGroup::InteriorCells($group) => $body,
            TopGroup::Worlds($group) => $body,
        }
    };
}

impl TopGroup {
    /// 按标签选择容器类型
    pub fn new(header: GroupHeader, factory: Arc<LoadFactory>, file_name: &str) -> Self {
        let core = GroupCore::new(header, factory, file_name);
        match &header.label {
            b"DIAL" => TopGroup::Dialogue(DialogueGroup::from_core(core)),
            b"CELL" => TopGroup::InteriorCells(InteriorCellContainer::from_core(core)),
            b"WRLD" => TopGroup::Worlds(WorldGroup::from_core(core)),
            _ => TopGroup::Objects(ObjectGroup::from_core(core)),
        }
    }

    /// 创建并加载顶级组
    pub fn load_from(
        header: GroupHeader,
        factory: Arc<LoadFactory>,
        reader: &mut ModReader,
        eager: bool,
    ) -> Result<Self> {
        let mut group = Self::new(header, factory, reader.file_name());
        group.load(reader, eager)?;
        Ok(group)
    }

    pub fn label(&self) -> Signature {
        self.header().label
    }

    fn kind(&self) -> &'static str {
        match self {
            TopGroup::Objects(_) => "object",
            TopGroup::Dialogue(_) => "dialogue",
            TopGroup::InteriorCells(_) => "interior cell",
            TopGroup::Worlds(_) => "world",
        }
    }

    fn mismatch(&self, src: &TopGroup) -> EspError {
        EspError::ContainerMismatch {
            dest: format!("{} {}", self.kind(), sig_str(&self.label())),
            src: format!("{} {}", src.kind(), sig_str(&src.label())),
        }
    }
}

impl Container for TopGroup {
    fn header(&self) -> &GroupHeader {
        dispatch!(self, g => g.header())
    }

    fn load(&mut self, reader: &mut ModReader, eager: bool) -> Result<()> {
        dispatch!(self, g => g.load(reader, eager))
    }

    fn unpack(&mut self) -> Result<()> {
        dispatch!(self, g => g.unpack())
    }

    fn is_changed(&self) -> bool {
        dispatch!(self, g => g.is_changed())
    }

    fn get_size(&self) -> u32 {
        dispatch!(self, g => g.get_size())
    }

    fn get_num_records(&self, include_groups: bool) -> Result<usize> {
        dispatch!(self, g => g.get_num_records(include_groups))
    }

    fn dump(&self, out: &mut dyn Write) -> Result<()> {
        dispatch!(self, g => g.dump(out))
    }

    fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> Result<()> {
        dispatch!(self, g => g.convert_fids(masters, to_long))
    }

    fn all_signatures(&self) -> HashSet<Signature> {
        dispatch!(self, g => g.all_signatures())
    }

    fn index_records(&mut self) {
        dispatch!(self, g => g.index_records())
    }

    fn iter_records(&self) -> RecordIter<'_> {
        dispatch!(self, g => g.iter_records())
    }

    fn keep_records(&mut self, keep: &mut RecordKeySet) -> Result<()> {
        dispatch!(self, g => g.keep_records(keep))
    }

    fn merge_records(
        &mut self,
        src: &mut Self,
        load_set: &LoadSet,
        merge_ids: &mut RecordKeySet,
        ii_skip_merge: bool,
        do_filter: bool,
    ) -> Result<()> {
        match (self, src) {
            (TopGroup::Objects(dest), TopGroup::Objects(src)) => {
                dest.merge_records(src, load_set, merge_ids, ii_skip_merge, do_filter)
            }
            (TopGroup::Dialogue(dest), TopGroup::Dialogue(src)) => {
                dest.merge_records(src, load_set, merge_ids, ii_skip_merge, do_filter)
            }
            (TopGroup::InteriorCells(dest), TopGroup::InteriorCells(src)) => {
                dest.merge_records(src, load_set, merge_ids, ii_skip_merge, do_filter)
            }
            (TopGroup::Worlds(dest), TopGroup::Worlds(src)) => {
                dest.merge_records(src, load_set, merge_ids, ii_skip_merge, do_filter)
            }
            (dest, src) => Err(dest.mismatch(src)),
        }
    }

    fn update_masters(&self, masters: &mut MasterSet) {
        dispatch!(self, g => g.update_masters(masters))
    }

    fn update_records(&mut self, src: &Self, mapper: FidMapper<'_>, merge_ids: &mut RecordKeySet) -> Result<()> {
        match (self, src) {
            (TopGroup::Objects(dest), TopGroup::Objects(src)) => dest.update_records(src, mapper, merge_ids),
            (TopGroup::Dialogue(dest), TopGroup::Dialogue(src)) => dest.update_records(src, mapper, merge_ids),
            (TopGroup::InteriorCells(dest), TopGroup::InteriorCells(src)) => {
                dest.update_records(src, mapper, merge_ids)
            }
            (TopGroup::Worlds(dest), TopGroup::Worlds(src)) => dest.update_records(src, mapper, merge_ids),
            (dest, src) => Err(dest.mismatch(src)),
        }
    }
}
