//! 单元格容器
//!
//! 单元格块按块/子块分桶写出：
//! - 内部单元格：FormID 本地 ID 个位数为块号，十位数为子块号
//! - 外部单元格：网格坐标除以 32 为块，除以 8 为子块（向下取整）
//!
//! 写出顺序按桶排序，桶内按单元格 FormID 排序，块或子块变化时才写组头部。

use super::cell_block::CellBlock;
use super::{Body, Container, Contents, FidIndex, GroupCore, RecordIter};
use crate::form_id::{FormId, LoadSet, MasterIndex, MasterSet, RecordKey, RecordKeySet};
use crate::header::{GroupHeader, GroupType, Header, Signature, HEADER_SIZE};
use crate::load_factory::LoadFactory;
use crate::reader::ModReader;
use crate::record::{FidMapper, PluginRecord};
use crate::utils::{sig_str, EspError, Result};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::Arc;

/// 块或子块的标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockLabel {
    Interior(i32),
    /// 网格 Y 在前，与写出的标签一致
    Exterior { y: i32, x: i32 },
}

impl BlockLabel {
    pub fn exterior(x: i32, y: i32) -> Self {
        BlockLabel::Exterior { y, x }
    }

    /// 写入组头部的 4 字节标签
    pub fn to_label(self) -> [u8; 4] {
        match self {
            BlockLabel::Interior(number) => number.to_le_bytes(),
            BlockLabel::Exterior { y, x } => {
                let mut label = [0u8; 4];
                label[0..2].copy_from_slice(&(y as i16).to_le_bytes());
                label[2..4].copy_from_slice(&(x as i16).to_le_bytes());
                label
            }
        }
    }
}

/// 单元格所属的块与子块
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub block: BlockLabel,
    pub sub_block: BlockLabel,
}

/// 分桶后的写出布局
#[derive(Debug)]
pub struct BucketLayout<'a> {
    /// 所有块组的总大小（不含容器自身头部）
    pub total: u32,
    pub blocks: BTreeMap<BlockLabel, u32>,
    pub sub_blocks: BTreeMap<BucketKey, u32>,
    pub order: Vec<(BucketKey, &'a CellBlock)>,
}

/// 一组单元格块及其 FormID 索引
#[derive(Debug, Default)]
pub struct CellBuckets {
    pub blocks: Vec<CellBlock>,
    index: FidIndex,
}

impl CellBuckets {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn index(&mut self) {
        let keys: Vec<RecordKey> = self.blocks.iter().map(|b| RecordKey::from(b.cell().fid())).collect();
        self.index.rebuild(keys.into_iter());
    }

    fn position(&mut self, fid: &FormId) -> Option<usize> {
        if !self.index.is_built() {
            self.index();
        }
        self.index.get(&RecordKey::from(fid))
    }

    pub fn get(&self, fid: &FormId) -> Option<&CellBlock> {
        if self.index.is_built() {
            return self.index.get(&RecordKey::from(fid)).map(|pos| &self.blocks[pos]);
        }
        self.blocks.iter().find(|b| b.cell().fid() == fid)
    }

    /// 添加单元格；已存在时只替换单元格记录
    pub fn set_cell(&mut self, parent: &GroupCore, cell: Box<dyn PluginRecord>) -> usize {
        let fid = cell.fid().clone();
        match self.position(&fid) {
            Some(pos) => {
                self.blocks[pos].set_cell(cell);
                pos
            }
            None => {
                self.blocks.push(CellBlock::under(parent, cell));
                let pos = self.blocks.len() - 1;
                self.index.insert(RecordKey::from(fid), pos);
                pos
            }
        }
    }

    pub fn remove_cell(&mut self, fid: &FormId) -> Option<CellBlock> {
        let pos = self.position(fid)?;
        let block = self.blocks.remove(pos);
        self.index.clear();
        Some(block)
    }

    pub fn used_blocks(&self) -> HashSet<BlockLabel> {
        self.blocks.iter().map(|b| b.bucket_key().block).collect()
    }

    pub fn used_sub_blocks(&self) -> HashSet<BucketKey> {
        self.blocks.iter().map(CellBlock::bucket_key).collect()
    }

    /// 计算各块/子块大小和写出顺序
    pub fn bsb_sizes(&self) -> BucketLayout<'_> {
        let mut order: Vec<(BucketKey, &CellBlock)> = self.blocks.iter().map(|b| (b.bucket_key(), b)).collect();
        order.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cell().fid().cmp(b.1.cell().fid())));

        let mut blocks: BTreeMap<BlockLabel, u32> = BTreeMap::new();
        let mut sub_blocks: BTreeMap<BucketKey, u32> = BTreeMap::new();
        let mut total = 0;
        for (key, cell_block) in &order {
            let size = cell_block.get_size();
            total += size;
            let block_size = blocks.entry(key.block).or_insert(HEADER_SIZE);
            if !sub_blocks.contains_key(key) {
                *block_size += HEADER_SIZE;
            }
            *block_size += size;
            *sub_blocks.entry(*key).or_insert(HEADER_SIZE) += size;
        }
        total += HEADER_SIZE * (blocks.len() + sub_blocks.len()) as u32;
        BucketLayout {
            total,
            blocks,
            sub_blocks,
            order,
        }
    }

    /// 写出块组、子块组和其中的单元格块
    pub fn dump_blocks(
        &self,
        out: &mut dyn Write,
        block_type: GroupType,
        sub_block_type: GroupType,
        stamp: u32,
    ) -> Result<()> {
        let layout = self.bsb_sizes();
        let mut current: Option<BucketKey> = None;
        for (key, cell_block) in &layout.order {
            let block_changed = current.map(|c| c.block != key.block).unwrap_or(true);
            if block_changed {
                let size = layout.blocks[&key.block];
                GroupHeader::new(size, key.block.to_label(), block_type, stamp).write(out)?;
            }
            if block_changed || current.map(|c| c.sub_block != key.sub_block).unwrap_or(true) {
                let size = layout.sub_blocks[key];
                GroupHeader::new(size, key.sub_block.to_label(), sub_block_type, stamp).write(out)?;
            }
            current = Some(*key);
            cell_block.dump(out)?;
        }
        Ok(())
    }

    /// 记录数，含块/子块组头部（不含容器自身头部）
    pub fn num_records(&self, include_groups: bool) -> Result<usize> {
        let mut count = 0;
        for block in &self.blocks {
            count += block.get_num_records(include_groups)?;
        }
        if count > 0 && include_groups {
            count += self.used_blocks().len() + self.used_sub_blocks().len();
        }
        Ok(count)
    }

    pub fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> Result<()> {
        for block in self.blocks.iter_mut() {
            block.convert_fids(masters, to_long)?;
        }
        self.index.clear();
        Ok(())
    }

    pub fn all_signatures(&self) -> HashSet<Signature> {
        self.blocks.iter().flat_map(|b| b.all_signatures()).collect()
    }

    pub fn iter_records(&self) -> impl Iterator<Item = &dyn PluginRecord> {
        self.blocks.iter().flat_map(|b| b.iter_records())
    }

    /// 保留子记录的单元格会把自身加入 `keep`
    pub fn keep(&mut self, keep: &mut RecordKeySet) -> Result<()> {
        for block in self.blocks.iter_mut() {
            block.keep_records(keep)?;
        }
        self.blocks
            .retain(|b| keep.contains(&RecordKey::from(b.cell().fid())));
        self.index.clear();
        Ok(())
    }

    pub fn merge(
        &mut self,
        parent: &GroupCore,
        src: &mut CellBuckets,
        load_set: &LoadSet,
        merge_ids: &mut RecordKeySet,
        ii_skip_merge: bool,
        do_filter: bool,
    ) -> Result<()> {
        let mut filtered = Vec::with_capacity(src.blocks.len());
        for mut src_block in std::mem::take(&mut src.blocks) {
            let fid = src_block.cell().fid().clone();
            let (pos, newly_added) = match self.position(&fid) {
                Some(pos) => (pos, false),
                None => (self.set_cell(parent, src_block.cell().type_copy()), true),
            };
            self.blocks[pos].merge_records(&mut src_block, load_set, merge_ids, ii_skip_merge, do_filter)?;

            let filtered_out = do_filter && {
                let mut masters = MasterSet::new();
                src_block.update_masters(&mut masters);
                !masters.loaded_in(load_set)
            };
            if newly_added && (ii_skip_merge || filtered_out) {
                self.remove_cell(&fid);
            }
            if filtered_out {
                tracing::trace!("过滤掉单元格 {}", fid);
                continue;
            }
            filtered.push(src_block);
        }
        src.blocks = filtered;
        src.index();
        Ok(())
    }

    pub fn update(&mut self, src: &CellBuckets, mapper: FidMapper<'_>, merge_ids: &mut RecordKeySet) -> Result<()> {
        for src_block in &src.blocks {
            let fid = mapper(src_block.cell().fid());
            if let Some(pos) = self.position(&fid) {
                self.blocks[pos].update_records(src_block, mapper, merge_ids)?;
            }
        }
        Ok(())
    }

    pub fn update_masters(&self, masters: &mut MasterSet) {
        for block in &self.blocks {
            block.update_masters(masters);
        }
    }
}

impl Contents for CellBuckets {
    /// 内部单元格顶级组：块组与子块组内依次是单元格记录及其子组
    fn load_contents(core: &GroupCore, reader: &mut ModReader, end: u64) -> Result<Self> {
        let expected = core.header.label;
        let label = format!("{} Top Block", sig_str(&expected));
        let mut buckets = CellBuckets::default();
        let mut pending: Option<Box<dyn PluginRecord>> = None;
        let mut end_block = 0u64;
        let mut end_sub_block = 0u64;
        while !reader.at_end(end, &label)? {
            match reader.read_header()? {
                Header::Record(header) if header.signature == expected => {
                    if let Some(cell) = pending.take() {
                        buckets.blocks.push(CellBlock::childless(core, cell));
                    }
                    let ctor = core
                        .factory()
                        .record_ctor(&expected)
                        .ok_or_else(|| EspError::UnsupportedRecordType(sig_str(&expected)))?;
                    let cell = ctor(header, reader)?;
                    if reader.tell() > end_block || reader.tell() > end_sub_block {
                        return Err(core.error(format!(
                            "Interior cell <{}> {} outside of block or subblock",
                            cell.fid(),
                            cell.editor_id().unwrap_or_default()
                        )));
                    }
                    pending = Some(cell);
                }
                Header::Group(group) => match group.group_type() {
                    GroupType::InteriorBlock => end_block = reader.tell() + group.payload_size() as u64,
                    GroupType::InteriorSubBlock => end_sub_block = reader.tell() + group.payload_size() as u64,
                    GroupType::CellChildren => {
                        let cell = pending
                            .take()
                            .ok_or_else(|| core.error("Extra cell children subgroup in CELL group"))?;
                        let owner = FormId::Short(group.label_u32());
                        if cell.fid() != &owner {
                            return Err(core.error(format!(
                                "Cell subgroup ({}) does not match CELL <{}> {}",
                                owner,
                                cell.fid(),
                                cell.editor_id().unwrap_or_default()
                            )));
                        }
                        let mut block = CellBlock::from_parts(core.child(group), cell);
                        block.load_children(group, reader)?;
                        buckets.blocks.push(block);
                    }
                    _ => {
                        return Err(core.error(format!(
                            "Unexpected subgroup {} in CELL group",
                            group.group_type
                        )))
                    }
                },
                Header::Record(header) => {
                    return Err(core.error(format!(
                        "Unexpected {} record in {} group",
                        sig_str(&header.signature),
                        sig_str(&expected)
                    )))
                }
            }
        }
        if let Some(cell) = pending.take() {
            buckets.blocks.push(CellBlock::childless(core, cell));
        }
        Ok(buckets)
    }
}

/// CELL 顶级组
#[derive(Debug)]
pub struct InteriorCellContainer {
    core: GroupCore,
    body: Body<CellBuckets>,
}

impl InteriorCellContainer {
    pub fn from_core(core: GroupCore) -> Self {
        InteriorCellContainer {
            core,
            body: Body::Parsed(CellBuckets::default()),
        }
    }

    pub fn new(stamp: u32, factory: Arc<LoadFactory>, file_name: &str) -> Self {
        Self::from_core(GroupCore::new(GroupHeader::top(*b"CELL", stamp), factory, file_name))
    }

    pub fn buckets(&self) -> Option<&CellBuckets> {
        self.body.parsed()
    }

    pub fn cell_blocks(&self) -> &[CellBlock] {
        self.body.parsed().map(|b| b.blocks.as_slice()).unwrap_or(&[])
    }

    pub fn cell_block_mut(&mut self, fid: &FormId) -> Result<Option<&mut CellBlock>> {
        let buckets = self.body.unpack(&self.core)?;
        Ok(match buckets.position(fid) {
            Some(pos) => Some(&mut buckets.blocks[pos]),
            None => None,
        })
    }

    pub fn set_cell(&mut self, cell: Box<dyn PluginRecord>) -> Result<()> {
        let buckets = self.body.unpack(&self.core)?;
        buckets.set_cell(&self.core, cell);
        Ok(())
    }

    pub fn remove_cell(&mut self, fid: &FormId) -> Result<Option<CellBlock>> {
        Ok(self.body.unpack(&self.core)?.remove_cell(fid))
    }
}

impl Container for InteriorCellContainer {
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
        if let Some(size) = self.body.raw_size() {
            return size;
        }
        match self.buckets() {
            Some(buckets) if !buckets.is_empty() => HEADER_SIZE + buckets.bsb_sizes().total,
            _ => 0,
        }
    }

    fn get_num_records(&self, include_groups: bool) -> Result<usize> {
        if let Some(count) = self.body.raw_num_records(&self.core, include_groups)? {
            return Ok(count);
        }
        let count = match self.buckets() {
            Some(buckets) => buckets.num_records(include_groups)?,
            None => 0,
        };
        Ok(if count > 0 { count + include_groups as usize } else { 0 })
    }

    fn dump(&self, out: &mut dyn Write) -> Result<()> {
        if self.body.dump_raw(&self.core.header, out)? {
            return Ok(());
        }
        let size = self.get_size();
        let buckets = match self.buckets() {
            Some(buckets) if size > 0 => buckets,
            _ => return Ok(()),
        };
        GroupHeader { size, ..self.core.header }.write(out)?;
        buckets.dump_blocks(out, GroupType::InteriorBlock, GroupType::InteriorSubBlock, self.core.stamp())
    }

    fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> Result<()> {
        self.body.unpack(&self.core)?.convert_fids(masters, to_long)
    }

    fn all_signatures(&self) -> HashSet<Signature> {
        self.buckets().map(CellBuckets::all_signatures).unwrap_or_default()
    }

    fn index_records(&mut self) {
        if let Body::Parsed(buckets) = &mut self.body {
            buckets.index();
        }
    }

    fn iter_records(&self) -> RecordIter<'_> {
        match self.buckets() {
            Some(buckets) => Box::new(buckets.iter_records()),
            None => Box::new(std::iter::empty()),
        }
    }

    fn keep_records(&mut self, keep: &mut RecordKeySet) -> Result<()> {
        self.body.unpack(&self.core)?.keep(keep)
    }

    fn merge_records(
        &mut self,
        src: &mut Self,
        load_set: &LoadSet,
        merge_ids: &mut RecordKeySet,
        ii_skip_merge: bool,
        do_filter: bool,
    ) -> Result<()> {
        let dest = self.body.unpack(&self.core)?;
        let source = src.body.unpack(&src.core)?;
        dest.merge(&self.core, source, load_set, merge_ids, ii_skip_merge, do_filter)
    }

    fn update_masters(&self, masters: &mut MasterSet) {
        if let Some(buckets) = self.buckets() {
            buckets.update_masters(masters);
        }
    }

    fn update_records(&mut self, src: &Self, mapper: FidMapper<'_>, merge_ids: &mut RecordKeySet) -> Result<()> {
        let source = match src.buckets() {
            Some(buckets) => buckets,
            None => return Ok(()),
        };
        self.body.unpack(&self.core)?.update(source, mapper, merge_ids)
    }
}
