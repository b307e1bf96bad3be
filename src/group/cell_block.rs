//! 单元格块：单元格记录及其子组
//!
//! 子组内的引用按组类型分为持久、临时、远景三个桶；
//! LAND 与 PGRD 按签名识别，每个单元格至多各一条，写出时放在临时桶开头。

use super::cells::{BlockLabel, BucketKey};
use super::{check_identity, dump_records, passes_filter, records_size, Body, Container, Contents, GroupCore, RecordIter};
use crate::form_id::{LoadSet, MasterIndex, MasterSet, RecordKey, RecordKeySet};
use crate::header::{GroupHeader, GroupType, Header, Signature, HEADER_SIZE};
use crate::load_factory::LoadFactory;
use crate::reader::ModReader;
use crate::record::{dumped_size, FidMapper, PluginRecord};
use crate::utils::{sig_str, Result};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

/// 单元格子组的内容
#[derive(Debug, Default)]
pub struct CellChildren {
    pub persistent: Vec<Box<dyn PluginRecord>>,
    pub temporary: Vec<Box<dyn PluginRecord>>,
    pub distant: Vec<Box<dyn PluginRecord>>,
    pub land: Option<Box<dyn PluginRecord>>,
    pub pathgrid: Option<Box<dyn PluginRecord>>,
}

/// 桶组大小（空桶为 0，不写组头部）
fn bucket_size(size: u32) -> u32 {
    if size == 0 {
        0
    } else {
        HEADER_SIZE + size
    }
}

impl CellChildren {
    pub fn is_empty(&self) -> bool {
        self.persistent.is_empty()
            && self.has_no_temporary()
            && self.distant.is_empty()
    }

    fn has_no_temporary(&self) -> bool {
        self.temporary.is_empty() && self.land.is_none() && self.pathgrid.is_none()
    }

    fn singles(&self) -> impl Iterator<Item = &Box<dyn PluginRecord>> {
        self.pathgrid.iter().chain(self.land.iter())
    }

    pub fn persistent_size(&self) -> u32 {
        bucket_size(records_size(&self.persistent))
    }

    pub fn temporary_size(&self) -> u32 {
        let singles: u32 = self.singles().map(|r| dumped_size(r.as_ref())).sum();
        bucket_size(records_size(&self.temporary) + singles)
    }

    pub fn distant_size(&self) -> u32 {
        bucket_size(records_size(&self.distant))
    }

    /// 子组总大小（含子组头部）
    pub fn size(&self) -> u32 {
        bucket_size(self.persistent_size() + self.temporary_size() + self.distant_size())
    }

    fn num_records(&self, include_groups: bool) -> usize {
        let groups = include_groups as usize;
        let mut count = 0;
        if !self.persistent.is_empty() {
            count += self.persistent.len() + groups;
        }
        if !self.has_no_temporary() {
            count += self.temporary.len() + self.singles().count() + groups;
        }
        if !self.distant.is_empty() {
            count += self.distant.len() + groups;
        }
        if count > 0 {
            count += groups;
        }
        count
    }

    fn dump(&self, core: &GroupCore, cell_fid: u32, out: &mut dyn Write) -> Result<()> {
        let size = self.size();
        if size == 0 {
            return Ok(());
        }
        let header = |size: u32, group_type: GroupType| GroupHeader {
            size,
            label: cell_fid.to_le_bytes(),
            group_type: group_type.to_i32(),
            ..core.header
        };
        header(size, GroupType::CellChildren).write(out)?;
        if !self.persistent.is_empty() {
            header(self.persistent_size(), GroupType::CellPersistent).write(out)?;
            dump_records(&self.persistent, out)?;
        }
        if !self.has_no_temporary() {
            header(self.temporary_size(), GroupType::CellTemporary).write(out)?;
            for single in self.singles() {
                single.dump(out)?;
            }
            dump_records(&self.temporary, out)?;
        }
        if !self.distant.is_empty() {
            header(self.distant_size(), GroupType::CellDistant).write(out)?;
            dump_records(&self.distant, out)?;
        }
        Ok(())
    }

    fn records(&self) -> impl Iterator<Item = &dyn PluginRecord> {
        self.singles()
            .chain(self.persistent.iter())
            .chain(self.distant.iter())
            .chain(self.temporary.iter())
            .map(|record| &**record)
    }

    fn records_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn PluginRecord>> {
        self.pathgrid
            .iter_mut()
            .chain(self.land.iter_mut())
            .chain(self.persistent.iter_mut())
            .chain(self.distant.iter_mut())
            .chain(self.temporary.iter_mut())
    }

    fn bucket_mut(&mut self, group_type: GroupType) -> Option<&mut Vec<Box<dyn PluginRecord>>> {
        match group_type {
            GroupType::CellPersistent => Some(&mut self.persistent),
            GroupType::CellTemporary => Some(&mut self.temporary),
            GroupType::CellDistant => Some(&mut self.distant),
            _ => None,
        }
    }
}

impl Contents for CellChildren {
    fn load_contents(core: &GroupCore, reader: &mut ModReader, end: u64) -> Result<Self> {
        let factory = core.factory();
        let mut children = CellChildren::default();
        let mut seen: Vec<GroupType> = Vec::with_capacity(3);
        let mut bucket: Option<GroupType> = None;
        while !reader.at_end(end, "Cell Block")? {
            let header = match reader.read_header()? {
                Header::Group(group) => {
                    let group_type = group.group_type();
                    if children.bucket_mut(group_type).is_none() {
                        return Err(core.error(format!(
                            "Unexpected subgroup {} in cell children group",
                            group.group_type
                        )));
                    }
                    if seen.contains(&group_type) {
                        return Err(core.error(format!(
                            "Extra subgroup {} in cell children group",
                            group.group_type
                        )));
                    }
                    seen.push(group_type);
                    bucket = Some(group_type);
                    continue;
                }
                Header::Record(header) => header,
            };
            let signature = header.signature;
            if !factory.is_cell_child_type(&signature) {
                return Err(core.error(format!(
                    "Unexpected {} record in cell children group",
                    sig_str(&signature)
                )));
            }
            let ctor = match factory.record_ctor(&signature) {
                Some(ctor) => ctor,
                None => {
                    reader.seek(header.size as i64)?;
                    continue;
                }
            };
            let record = ctor(header, reader)?;
            let single = match &signature {
                b"LAND" => Some(&mut children.land),
                b"PGRD" => Some(&mut children.pathgrid),
                _ => None,
            };
            if let Some(slot) = single {
                if slot.is_some() {
                    return Err(core.error(format!(
                        "Extra {} record in cell children group",
                        sig_str(&signature)
                    )));
                }
                *slot = Some(record);
                continue;
            }
            let list = bucket
                .and_then(|group_type| children.bucket_mut(group_type))
                .ok_or_else(|| {
                    core.error(format!(
                        "{} record outside of any reference group",
                        sig_str(&signature)
                    ))
                })?;
            list.push(record);
        }
        Ok(children)
    }
}

/// 合并单值子记录（单元格的 LAND/PGRD）
pub(crate) fn merge_single(
    dest: &mut Option<Box<dyn PluginRecord>>,
    src: &mut Option<Box<dyn PluginRecord>>,
    load_set: &LoadSet,
    merge_ids: &mut RecordKeySet,
    ii_skip_merge: bool,
    do_filter: bool,
) -> Result<()> {
    let record = match src {
        Some(record) if !record.is_ignored() => record,
        _ => return Ok(()),
    };
    if do_filter && !passes_filter(record.as_mut(), load_set) {
        *src = None;
        return Ok(());
    }
    if ii_skip_merge {
        return Ok(());
    }
    check_identity(dest.as_deref(), record.fid())?;
    merge_ids.insert(RecordKey::from(record.fid()));
    *dest = Some(record.type_copy());
    Ok(())
}

/// 合并引用列表：按 FormID 原位覆盖，新记录追加
fn merge_list(
    dest: &mut Vec<Box<dyn PluginRecord>>,
    src: &mut Vec<Box<dyn PluginRecord>>,
    load_set: &LoadSet,
    merge_ids: &mut RecordKeySet,
    ii_skip_merge: bool,
    do_filter: bool,
) {
    let mut filtered = Vec::with_capacity(src.len());
    for mut record in std::mem::take(src) {
        if record.is_ignored() {
            continue;
        }
        if do_filter && !passes_filter(record.as_mut(), load_set) {
            continue;
        }
        if !ii_skip_merge {
            merge_ids.insert(RecordKey::from(record.fid()));
            let copy = record.type_copy();
            match dest.iter().position(|r| r.fid() == copy.fid()) {
                Some(pos) => dest[pos] = copy,
                None => dest.push(copy),
            }
        }
        filtered.push(record);
    }
    *src = filtered;
}

pub(crate) fn update_single(
    dest: &mut Option<Box<dyn PluginRecord>>,
    src: Option<&dyn PluginRecord>,
    mapper: FidMapper<'_>,
    merge_ids: &mut RecordKeySet,
) -> Result<()> {
    if let (Some(mine), Some(record)) = (dest.as_mut(), src) {
        check_identity(Some(&**mine), &mapper(record.fid()))?;
        if !record.is_ignored() {
            *mine = record.mapped_copy(mapper);
            merge_ids.remove(&RecordKey::from(mine.fid()));
        }
    }
    Ok(())
}

fn update_list(
    dest: &mut [Box<dyn PluginRecord>],
    src: &[Box<dyn PluginRecord>],
    mapper: FidMapper<'_>,
    merge_ids: &mut RecordKeySet,
) {
    for record in src.iter().filter(|r| !r.is_ignored()) {
        let fid = mapper(record.fid());
        if let Some(pos) = dest.iter().position(|r| r.fid() == &fid) {
            dest[pos] = record.mapped_copy(mapper);
            merge_ids.remove(&RecordKey::from(fid));
        }
    }
}

/// 单元格块
#[derive(Debug)]
pub struct CellBlock {
    core: GroupCore,
    cell: Box<dyn PluginRecord>,
    body: Body<CellChildren>,
}

impl CellBlock {
    /// 由已读取的单元格记录创建，子组头部随后由 `load` 读取
    pub fn from_parts(core: GroupCore, cell: Box<dyn PluginRecord>) -> Self {
        CellBlock {
            core,
            cell,
            body: Body::Parsed(CellChildren::default()),
        }
    }

    /// 没有子组的单元格：记录头部按组头部解读
    pub fn childless(parent: &GroupCore, cell: Box<dyn PluginRecord>) -> Self {
        let header = GroupHeader::from_record_header(cell.header());
        Self::from_parts(parent.child(header), cell)
    }

    /// 新建空单元格块
    pub fn new(cell: Box<dyn PluginRecord>, stamp: u32, factory: Arc<LoadFactory>, file_name: &str) -> Self {
        let header = GroupHeader::with_fid(HEADER_SIZE, 0, GroupType::CellChildren, stamp);
        Self::from_parts(GroupCore::new(header, factory, file_name), cell)
    }

    /// 在某个容器下新建空单元格块，沿用容器的时间戳
    pub fn under(parent: &GroupCore, cell: Box<dyn PluginRecord>) -> Self {
        let header = GroupHeader::with_fid(HEADER_SIZE, 0, GroupType::CellChildren, parent.stamp());
        Self::from_parts(parent.child(header), cell)
    }

    /// 是否带有子组（原始字节或非空子记录）
    pub fn has_children(&self) -> bool {
        match self.children() {
            Some(children) => !children.is_empty(),
            None => true,
        }
    }

    pub fn cell(&self) -> &dyn PluginRecord {
        self.cell.as_ref()
    }

    /// 替换单元格记录，保留子记录
    pub fn set_cell(&mut self, cell: Box<dyn PluginRecord>) {
        self.cell = cell;
    }

    pub fn children(&self) -> Option<&CellChildren> {
        self.body.parsed()
    }

    pub fn children_mut(&mut self) -> Result<&mut CellChildren> {
        self.body.unpack(&self.core)
    }

    /// 加载紧随单元格记录的子组
    pub(crate) fn load_children(&mut self, header: GroupHeader, reader: &mut ModReader) -> Result<()> {
        self.core.header = header;
        let eager = self.core.factory().should_unpack_cell_blocks();
        self.load(reader, eager)
    }

    /// 所属的块/子块
    pub fn bucket_key(&self) -> BucketKey {
        if self.cell.is_interior_cell() {
            let base = self.cell.fid().object_id() as i32;
            BucketKey {
                block: BlockLabel::Interior(base % 10),
                sub_block: BlockLabel::Interior(base % 100 / 10),
            }
        } else {
            let (x, y) = self.cell.grid_position().unwrap_or((0, 0));
            BucketKey {
                block: BlockLabel::exterior(x.div_euclid(32), y.div_euclid(32)),
                sub_block: BlockLabel::exterior(x.div_euclid(8), y.div_euclid(8)),
            }
        }
    }

    fn children_size(&self) -> u32 {
        match self.body.raw_size() {
            Some(size) => size,
            None => self.children().map(CellChildren::size).unwrap_or(0),
        }
    }
}

impl Container for CellBlock {
    fn header(&self) -> &GroupHeader {
        &self.core.header
    }

    fn load(&mut self, reader: &mut ModReader, eager: bool) -> Result<()> {
        self.body = Body::load(&self.core, reader, eager)?;
        Ok(())
    }

    fn unpack(&mut self) -> Result<()> {
        self.body.unpack(&self.core)?;
        Ok(())
    }

    fn is_changed(&self) -> bool {
        self.body.is_parsed()
    }

    fn get_size(&self) -> u32 {
        dumped_size(self.cell.as_ref()) + self.children_size()
    }

    fn get_num_records(&self, include_groups: bool) -> Result<usize> {
        let children = match self.body.raw_num_records(&self.core, include_groups)? {
            Some(count) => count,
            None => self.children().map(|c| c.num_records(include_groups)).unwrap_or(0),
        };
        Ok(1 + children)
    }

    fn dump(&self, out: &mut dyn Write) -> Result<()> {
        self.cell.dump(out)?;
        if self.body.dump_raw(&self.core.header, out)? {
            return Ok(());
        }
        match self.children() {
            Some(children) => children.dump(&self.core, self.cell.fid().as_short()?, out),
            None => Ok(()),
        }
    }

    fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> Result<()> {
        self.cell.convert_fids(masters, to_long)?;
        let children = self.body.unpack(&self.core)?;
        for record in children.records_mut() {
            record.convert_fids(masters, to_long)?;
        }
        Ok(())
    }

    fn all_signatures(&self) -> HashSet<Signature> {
        self.iter_records().map(|record| record.signature()).collect()
    }

    /// 单元格块没有自己的索引
    fn index_records(&mut self) {}

    fn iter_records(&self) -> RecordIter<'_> {
        let cell = std::iter::once(self.cell.as_ref());
        match self.children() {
            Some(children) => Box::new(cell.chain(children.records())),
            None => Box::new(cell),
        }
    }

    fn keep_records(&mut self, keep: &mut RecordKeySet) -> Result<()> {
        let children = self.body.unpack(&self.core)?;
        let kept = |record: &Box<dyn PluginRecord>| keep.contains(&RecordKey::from(record.fid()));
        if !children.pathgrid.as_ref().map(kept).unwrap_or(true) {
            children.pathgrid = None;
        }
        if !children.land.as_ref().map(kept).unwrap_or(true) {
            children.land = None;
        }
        children.persistent.retain(kept);
        children.temporary.retain(kept);
        children.distant.retain(kept);
        if !children.is_empty() {
            keep.insert(RecordKey::from(self.cell.fid()));
        }
        Ok(())
    }

    fn merge_records(
        &mut self,
        src: &mut Self,
        load_set: &LoadSet,
        merge_ids: &mut RecordKeySet,
        ii_skip_merge: bool,
        do_filter: bool,
    ) -> Result<()> {
        // 单元格记录被过滤时，由上层容器根据主文件检查丢弃整个块
        let cell_passes = !src.cell.is_ignored() && (!do_filter || passes_filter(src.cell.as_mut(), load_set));
        if cell_passes && !ii_skip_merge {
            check_identity(Some(self.cell.as_ref()), src.cell.fid())?;
            merge_ids.insert(RecordKey::from(src.cell.fid()));
            self.cell = src.cell.type_copy();
        }

        let dest = self.body.unpack(&self.core)?;
        let source = src.body.unpack(&src.core)?;
        merge_single(&mut dest.pathgrid, &mut source.pathgrid, load_set, merge_ids, ii_skip_merge, do_filter)?;
        merge_single(&mut dest.land, &mut source.land, load_set, merge_ids, ii_skip_merge, do_filter)?;
        merge_list(&mut dest.temporary, &mut source.temporary, load_set, merge_ids, ii_skip_merge, do_filter);
        merge_list(&mut dest.persistent, &mut source.persistent, load_set, merge_ids, ii_skip_merge, do_filter);
        merge_list(&mut dest.distant, &mut source.distant, load_set, merge_ids, ii_skip_merge, do_filter);
        Ok(())
    }

    fn update_masters(&self, masters: &mut MasterSet) {
        for record in self.iter_records() {
            record.update_masters(masters);
        }
    }

    fn update_records(&mut self, src: &Self, mapper: FidMapper<'_>, merge_ids: &mut RecordKeySet) -> Result<()> {
        check_identity(Some(self.cell.as_ref()), &mapper(src.cell.fid()))?;
        if !src.cell.is_ignored() {
            self.cell = src.cell.mapped_copy(mapper);
            merge_ids.remove(&RecordKey::from(self.cell.fid()));
        }
        let source = match src.children() {
            Some(children) => children,
            None => return Ok(()),
        };
        let dest = self.body.unpack(&self.core)?;
        update_single(&mut dest.pathgrid, source.pathgrid.as_deref(), mapper, merge_ids)?;
        update_single(&mut dest.land, source.land.as_deref(), mapper, merge_ids)?;
        update_list(&mut dest.persistent, &source.persistent, mapper, merge_ids);
        update_list(&mut dest.temporary, &source.temporary, mapper, merge_ids);
        update_list(&mut dest.distant, &source.distant, mapper, merge_ids);
        Ok(())
    }
}
