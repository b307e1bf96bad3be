//! 世界容器
//!
//! WRLD 顶级组内，每条世界记录后可以跟一个世界子组，其中依次是：
//! ROAD 记录、不属于任何块的"世界单元格"、按外部块/子块分桶的单元格。

use super::cell_block::{merge_single, update_single, CellBlock};
use super::cells::CellBuckets;
use super::{
    check_identity, passes_filter, Body, Container, Contents, FidIndex, GroupCore, RecordIter,
};
use crate::form_id::{FormId, LoadSet, MasterIndex, MasterSet, RecordKey, RecordKeySet};
use crate::header::{GroupHeader, GroupType, Header, Signature, HEADER_SIZE};
use crate::load_factory::LoadFactory;
use crate::reader::ModReader;
use crate::record::{dumped_size, FidMapper, PluginRecord};
use crate::utils::{sig_str, EspError, Result};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

/// 世界子组的内容
#[derive(Debug, Default)]
pub struct WorldChildren {
    pub road: Option<Box<dyn PluginRecord>>,
    pub world_cell: Option<CellBlock>,
    pub cells: CellBuckets,
}

impl WorldChildren {
    pub fn is_empty(&self) -> bool {
        self.road.is_none() && self.world_cell.is_none() && self.cells.is_empty()
    }

    /// 子组总大小（含子组头部），为空时为 0
    pub fn size(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        let road = self.road.as_ref().map(|r| dumped_size(r.as_ref())).unwrap_or(0);
        let world_cell = self.world_cell.as_ref().map(CellBlock::get_size).unwrap_or(0);
        HEADER_SIZE + road + world_cell + self.cells.bsb_sizes().total
    }

    fn num_records(&self, include_groups: bool) -> Result<usize> {
        let mut count = self.road.is_some() as usize;
        if let Some(cell) = &self.world_cell {
            count += cell.get_num_records(include_groups)?;
        }
        count += self.cells.num_records(include_groups)?;
        if count > 0 && include_groups {
            count += 1;
        }
        Ok(count)
    }

    fn records(&self) -> impl Iterator<Item = &dyn PluginRecord> {
        let road = self.road.iter().map(|road| &**road);
        let world_cell = self.world_cell.iter().flat_map(|cell| cell.iter_records());
        road.chain(world_cell).chain(self.cells.iter_records())
    }

    /// 世界单元格或块内单元格
    fn cell_block_mut(&mut self, fid: &FormId) -> Option<&mut CellBlock> {
        self.world_cell
            .iter_mut()
            .chain(self.cells.blocks.iter_mut())
            .find(|block| block.cell().fid() == fid)
    }

    fn place(&mut self, core: &GroupCore, block: CellBlock, in_block: bool) -> Result<()> {
        if in_block {
            self.cells.blocks.push(block);
        } else if self.world_cell.is_some() {
            return Err(core.error(format!(
                "Extra exterior cell <{}> {} before block group",
                block.cell().fid(),
                block.cell().editor_id().unwrap_or_default()
            )));
        } else {
            self.world_cell = Some(block);
        }
        Ok(())
    }
}

impl Contents for WorldChildren {
    fn load_contents(core: &GroupCore, reader: &mut ModReader, end: u64) -> Result<Self> {
        let factory = core.factory();
        let lookup = factory.game().lookup_children_by_label;
        let mut children = WorldChildren::default();
        let mut pending: Option<(Box<dyn PluginRecord>, bool)> = None;
        let mut end_block = 0u64;
        let mut end_sub_block = 0u64;
        while !reader.at_end(end, "World Block")? {
            match reader.read_header()? {
                Header::Record(header) if &header.signature == b"ROAD" => {
                    if children.road.is_some() {
                        return Err(core.error("Extra ROAD record in world children group"));
                    }
                    match factory.record_ctor(&header.signature) {
                        Some(ctor) => children.road = Some(ctor(header, reader)?),
                        None => reader.seek(header.size as i64)?,
                    }
                }
                Header::Record(header) if &header.signature == b"CELL" => {
                    if let Some((cell, in_block)) = pending.take() {
                        children.place(core, CellBlock::childless(core, cell), in_block)?;
                    }
                    let ctor = factory
                        .record_ctor(&header.signature)
                        .ok_or_else(|| EspError::UnsupportedRecordType(sig_str(&header.signature)))?;
                    let cell = ctor(header, reader)?;
                    let in_block = end_block > 0;
                    if in_block && (reader.tell() > end_block || reader.tell() > end_sub_block) {
                        return Err(core.error(format!(
                            "Exterior cell <{}> {} after block or subblock",
                            cell.fid(),
                            cell.editor_id().unwrap_or_default()
                        )));
                    }
                    pending = Some((cell, in_block));
                }
                Header::Group(group) => match group.group_type() {
                    GroupType::ExteriorBlock => end_block = reader.tell() + group.payload_size() as u64,
                    GroupType::ExteriorSubBlock => end_sub_block = reader.tell() + group.payload_size() as u64,
                    GroupType::CellChildren => {
                        let owner = FormId::Short(group.label_u32());
                        match pending.take() {
                            Some((cell, in_block)) if cell.fid() == &owner => {
                                let mut block = CellBlock::from_parts(core.child(group), cell);
                                block.load_children(group, reader)?;
                                children.place(core, block, in_block)?;
                            }
                            other => {
                                if let Some((cell, in_block)) = other {
                                    children.place(core, CellBlock::childless(core, cell), in_block)?;
                                }
                                match children.cell_block_mut(&owner) {
                                    Some(block) if lookup && !block.has_children() => {
                                        block.load_children(group, reader)?
                                    }
                                    _ => {
                                        return Err(core.error(format!(
                                            "Extra subgroup {} in WRLD group for cell {}",
                                            group.group_type, owner
                                        )))
                                    }
                                }
                            }
                        }
                    }
                    _ => {
                        return Err(core.error(format!(
                            "Unexpected subgroup {} in world children group",
                            group.group_type
                        )))
                    }
                },
                Header::Record(header) => {
                    return Err(core.error(format!(
                        "Unexpected {} record in world children group",
                        sig_str(&header.signature)
                    )))
                }
            }
        }
        if let Some((cell, in_block)) = pending.take() {
            children.place(core, CellBlock::childless(core, cell), in_block)?;
        }
        Ok(children)
    }
}

/// 世界块：世界记录及其子组
#[derive(Debug)]
pub struct WorldBlock {
    core: GroupCore,
    world: Box<dyn PluginRecord>,
    body: Body<WorldChildren>,
}

impl WorldBlock {
    pub fn from_parts(core: GroupCore, world: Box<dyn PluginRecord>) -> Self {
        WorldBlock {
            core,
            world,
            body: Body::Parsed(WorldChildren::default()),
        }
    }

    /// 没有子组的世界：记录头部按组头部解读
    pub fn childless(parent: &GroupCore, world: Box<dyn PluginRecord>) -> Self {
        let header = GroupHeader::from_record_header(world.header());
        Self::from_parts(parent.child(header), world)
    }

    pub fn new(world: Box<dyn PluginRecord>, stamp: u32, factory: Arc<LoadFactory>, file_name: &str) -> Self {
        let header = GroupHeader::with_fid(HEADER_SIZE, 0, GroupType::WorldChildren, stamp);
        Self::from_parts(GroupCore::new(header, factory, file_name), world)
    }

    pub fn under(parent: &GroupCore, world: Box<dyn PluginRecord>) -> Self {
        let header = GroupHeader::with_fid(HEADER_SIZE, 0, GroupType::WorldChildren, parent.stamp());
        Self::from_parts(parent.child(header), world)
    }

    pub fn world(&self) -> &dyn PluginRecord {
        self.world.as_ref()
    }

    pub fn set_world(&mut self, world: Box<dyn PluginRecord>) {
        self.world = world;
    }

    pub fn has_children(&self) -> bool {
        match self.children() {
            Some(children) => !children.is_empty(),
            None => true,
        }
    }

    pub fn children(&self) -> Option<&WorldChildren> {
        self.body.parsed()
    }

    pub fn children_mut(&mut self) -> Result<&mut WorldChildren> {
        self.body.unpack(&self.core)
    }

    /// 在世界子组中新建或替换单元格
    pub fn set_cell(&mut self, cell: Box<dyn PluginRecord>) -> Result<()> {
        let children = self.body.unpack(&self.core)?;
        children.cells.set_cell(&self.core, cell);
        Ok(())
    }

    pub(crate) fn load_children(&mut self, header: GroupHeader, reader: &mut ModReader) -> Result<()> {
        self.core.header = header;
        self.load(reader, true)
    }

    fn children_size(&self) -> u32 {
        match self.body.raw_size() {
            Some(size) => size,
            None => self.children().map(WorldChildren::size).unwrap_or(0),
        }
    }
}

impl Container for WorldBlock {
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
        dumped_size(self.world.as_ref()) + self.children_size()
    }

    fn get_num_records(&self, include_groups: bool) -> Result<usize> {
        let children = match self.body.raw_num_records(&self.core, include_groups)? {
            Some(count) => count,
            None => match self.children() {
                Some(children) => children.num_records(include_groups)?,
                None => 0,
            },
        };
        Ok(1 + children)
    }

    fn dump(&self, out: &mut dyn Write) -> Result<()> {
        self.world.dump(out)?;
        if self.body.dump_raw(&self.core.header, out)? {
            return Ok(());
        }
        let children = match self.children() {
            Some(children) if !children.is_empty() => children,
            _ => return Ok(()),
        };
        GroupHeader {
            size: children.size(),
            label: self.world.fid().as_short()?.to_le_bytes(),
            group_type: GroupType::WorldChildren.to_i32(),
            ..self.core.header
        }
        .write(out)?;
        if let Some(road) = &children.road {
            road.dump(out)?;
        }
        if let Some(cell) = &children.world_cell {
            cell.dump(out)?;
        }
        children
            .cells
            .dump_blocks(out, GroupType::ExteriorBlock, GroupType::ExteriorSubBlock, self.core.stamp())
    }

    fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> Result<()> {
        self.world.convert_fids(masters, to_long)?;
        let children = self.body.unpack(&self.core)?;
        if let Some(road) = children.road.as_mut() {
            road.convert_fids(masters, to_long)?;
        }
        if let Some(cell) = children.world_cell.as_mut() {
            cell.convert_fids(masters, to_long)?;
        }
        children.cells.convert_fids(masters, to_long)
    }

    fn all_signatures(&self) -> HashSet<Signature> {
        self.iter_records().map(|record| record.signature()).collect()
    }

    fn index_records(&mut self) {
        if let Body::Parsed(children) = &mut self.body {
            children.cells.index();
        }
    }

    fn iter_records(&self) -> RecordIter<'_> {
        let world = std::iter::once(self.world.as_ref());
        match self.children() {
            Some(children) => Box::new(world.chain(children.records())),
            None => Box::new(world),
        }
    }

    fn keep_records(&mut self, keep: &mut RecordKeySet) -> Result<()> {
        let children = self.body.unpack(&self.core)?;
        if let Some(road) = &children.road {
            if !keep.contains(&RecordKey::from(road.fid())) {
                children.road = None;
            }
        }
        if let Some(cell) = children.world_cell.as_mut() {
            cell.keep_records(keep)?;
            if !keep.contains(&RecordKey::from(cell.cell().fid())) {
                children.world_cell = None;
            }
        }
        children.cells.keep(keep)?;
        if !children.is_empty() {
            keep.insert(RecordKey::from(self.world.fid()));
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
        let world_passes = !src.world.is_ignored() && (!do_filter || passes_filter(src.world.as_mut(), load_set));
        if world_passes && !ii_skip_merge {
            check_identity(Some(self.world.as_ref()), src.world.fid())?;
            merge_ids.insert(RecordKey::from(src.world.fid()));
            self.world = src.world.type_copy();
        }

        let dest = self.body.unpack(&self.core)?;
        let source = src.body.unpack(&src.core)?;
        merge_single(&mut dest.road, &mut source.road, load_set, merge_ids, ii_skip_merge, do_filter)?;

        if let Some(src_cell) = source.world_cell.as_mut() {
            let newly_added = dest.world_cell.is_none();
            let dest_cell = dest
                .world_cell
                .get_or_insert_with(|| CellBlock::under(&self.core, src_cell.cell().type_copy()));
            dest_cell.merge_records(src_cell, load_set, merge_ids, ii_skip_merge, do_filter)?;

            let filtered_out = do_filter && {
                let mut masters = MasterSet::new();
                src_cell.update_masters(&mut masters);
                !masters.loaded_in(load_set)
            };
            if newly_added && (ii_skip_merge || filtered_out) {
                dest.world_cell = None;
            }
            if filtered_out {
                source.world_cell = None;
            }
        }

        dest.cells
            .merge(&self.core, &mut source.cells, load_set, merge_ids, ii_skip_merge, do_filter)
    }

    fn update_masters(&self, masters: &mut MasterSet) {
        for record in self.iter_records() {
            record.update_masters(masters);
        }
    }

    fn update_records(&mut self, src: &Self, mapper: FidMapper<'_>, merge_ids: &mut RecordKeySet) -> Result<()> {
        check_identity(Some(self.world.as_ref()), &mapper(src.world.fid()))?;
        if !src.world.is_ignored() {
            self.world = src.world.mapped_copy(mapper);
            merge_ids.remove(&RecordKey::from(self.world.fid()));
        }
        let source = match src.children() {
            Some(children) => children,
            None => return Ok(()),
        };
        let dest = self.body.unpack(&self.core)?;
        update_single(&mut dest.road, source.road.as_deref(), mapper, merge_ids)?;
        if let (Some(mine), Some(theirs)) = (dest.world_cell.as_mut(), source.world_cell.as_ref()) {
            mine.update_records(theirs, mapper, merge_ids)?;
        }
        dest.cells.update(&source.cells, mapper, merge_ids)
    }
}

/// WRLD 顶级组的内容
#[derive(Debug, Default)]
pub struct WorldBlocks {
    pub blocks: Vec<WorldBlock>,
    index: FidIndex,
    orphans_skipped: usize,
}

impl WorldBlocks {
    pub fn index(&mut self) {
        let keys: Vec<RecordKey> = self.blocks.iter().map(|b| RecordKey::from(b.world().fid())).collect();
        self.index.rebuild(keys.into_iter());
    }

    fn position(&mut self, fid: &FormId) -> Option<usize> {
        if !self.index.is_built() {
            self.index();
        }
        self.index.get(&RecordKey::from(fid))
    }

    pub fn set_world(&mut self, parent: &GroupCore, world: Box<dyn PluginRecord>) -> usize {
        let fid = world.fid().clone();
        match self.position(&fid) {
            Some(pos) => {
                self.blocks[pos].set_world(world);
                pos
            }
            None => {
                self.blocks.push(WorldBlock::under(parent, world));
                let pos = self.blocks.len() - 1;
                self.index.insert(RecordKey::from(fid), pos);
                pos
            }
        }
    }

    pub fn remove_world(&mut self, fid: &FormId) -> Option<WorldBlock> {
        let pos = self.position(fid)?;
        let block = self.blocks.remove(pos);
        self.index.clear();
        Some(block)
    }
}

impl Contents for WorldBlocks {
    fn load_contents(core: &GroupCore, reader: &mut ModReader, end: u64) -> Result<Self> {
        let expected = core.header.label;
        let label = format!("{} Top Block", sig_str(&expected));
        let lookup = core.factory().game().lookup_children_by_label;
        let mut worlds = WorldBlocks::default();
        let mut pending: Option<Box<dyn PluginRecord>> = None;
        while !reader.at_end(end, &label)? {
            match reader.read_header()? {
                Header::Record(header) if header.signature == expected => {
                    // 连续两条世界记录：前一个世界没有子组
                    if let Some(world) = pending.take() {
                        worlds.blocks.push(WorldBlock::childless(core, world));
                    }
                    let ctor = core
                        .factory()
                        .record_ctor(&expected)
                        .ok_or_else(|| EspError::UnsupportedRecordType(sig_str(&expected)))?;
                    pending = Some(ctor(header, reader)?);
                }
                Header::Group(group) if group.group_type() == GroupType::WorldChildren => {
                    let owner = FormId::Short(group.label_u32());
                    match pending.take() {
                        Some(world) if world.fid() == &owner => {
                            let mut block = WorldBlock::from_parts(core.child(group), world);
                            block.load_children(group, reader)?;
                            worlds.blocks.push(block);
                        }
                        other => {
                            if let Some(world) = other {
                                worlds.blocks.push(WorldBlock::childless(core, world));
                            }
                            match worlds.blocks.iter_mut().find(|b| b.world().fid() == &owner) {
                                Some(block) if lookup && !block.has_children() => block.load_children(group, reader)?,
                                Some(_) => {
                                    return Err(core.error(format!(
                                        "Extra subgroup {} in WRLD group for world {}",
                                        group.group_type, owner
                                    )))
                                }
                                None => {
                                    reader.seek(group.payload_size() as i64)?;
                                    worlds.orphans_skipped += 1;
                                    tracing::warn!(
                                        "{}: 跳过没有世界记录的世界子组 ({})",
                                        core.file_name(),
                                        owner
                                    );
                                }
                            }
                        }
                    }
                }
                Header::Group(group) => {
                    return Err(core.error(format!(
                        "Unexpected subgroup {} in WRLD group",
                        group.group_type
                    )))
                }
                Header::Record(header) => {
                    return Err(core.error(format!(
                        "Unexpected {} record in {} group",
                        sig_str(&header.signature),
                        sig_str(&expected)
                    )))
                }
            }
        }
        if let Some(world) = pending.take() {
            worlds.blocks.push(WorldBlock::childless(core, world));
        }
        Ok(worlds)
    }
}

/// WRLD 顶级组
#[derive(Debug)]
pub struct WorldGroup {
    core: GroupCore,
    body: Body<WorldBlocks>,
}

impl WorldGroup {
    pub fn from_core(core: GroupCore) -> Self {
        WorldGroup {
            core,
            body: Body::Parsed(WorldBlocks::default()),
        }
    }

    pub fn new(stamp: u32, factory: Arc<LoadFactory>, file_name: &str) -> Self {
        Self::from_core(GroupCore::new(GroupHeader::top(*b"WRLD", stamp), factory, file_name))
    }

    pub fn world_blocks(&self) -> &[WorldBlock] {
        self.body.parsed().map(|w| w.blocks.as_slice()).unwrap_or(&[])
    }

    pub fn world_block(&self, fid: &FormId) -> Option<&WorldBlock> {
        self.world_blocks().iter().find(|b| b.world().fid() == fid)
    }

    pub fn world_block_mut(&mut self, fid: &FormId) -> Result<Option<&mut WorldBlock>> {
        let worlds = self.body.unpack(&self.core)?;
        Ok(match worlds.position(fid) {
            Some(pos) => Some(&mut worlds.blocks[pos]),
            None => None,
        })
    }

    /// 新建或替换世界记录
    pub fn set_world(&mut self, world: Box<dyn PluginRecord>) -> Result<()> {
        let worlds = self.body.unpack(&self.core)?;
        worlds.set_world(&self.core, world);
        Ok(())
    }

    pub fn remove_world(&mut self, fid: &FormId) -> Result<Option<WorldBlock>> {
        Ok(self.body.unpack(&self.core)?.remove_world(fid))
    }

    /// 加载时跳过的孤立世界子组数量
    pub fn orphans_skipped(&self) -> usize {
        self.body.parsed().map(|w| w.orphans_skipped).unwrap_or(0)
    }
}

impl Container for WorldGroup {
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
        let blocks = self.world_blocks();
        if blocks.is_empty() {
            return 0;
        }
        HEADER_SIZE + blocks.iter().map(WorldBlock::get_size).sum::<u32>()
    }

    fn get_num_records(&self, include_groups: bool) -> Result<usize> {
        if let Some(count) = self.body.raw_num_records(&self.core, include_groups)? {
            return Ok(count);
        }
        let mut count = 0;
        for block in self.world_blocks() {
            count += block.get_num_records(include_groups)?;
        }
        Ok(if count > 0 { count + include_groups as usize } else { 0 })
    }

    fn dump(&self, out: &mut dyn Write) -> Result<()> {
        if self.body.dump_raw(&self.core.header, out)? {
            return Ok(());
        }
        let size = self.get_size();
        if size == 0 {
            return Ok(());
        }
        GroupHeader { size, ..self.core.header }.write(out)?;
        for block in self.world_blocks() {
            block.dump(out)?;
        }
        Ok(())
    }

    fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> Result<()> {
        let worlds = self.body.unpack(&self.core)?;
        for block in worlds.blocks.iter_mut() {
            block.convert_fids(masters, to_long)?;
        }
        worlds.index.clear();
        Ok(())
    }

    fn all_signatures(&self) -> HashSet<Signature> {
        self.world_blocks().iter().flat_map(|b| b.all_signatures()).collect()
    }

    fn index_records(&mut self) {
        if let Body::Parsed(worlds) = &mut self.body {
            worlds.index();
            for block in worlds.blocks.iter_mut() {
                block.index_records();
            }
        }
    }

    fn iter_records(&self) -> RecordIter<'_> {
        Box::new(self.world_blocks().iter().flat_map(|b| b.iter_records()))
    }

    fn keep_records(&mut self, keep: &mut RecordKeySet) -> Result<()> {
        let worlds = self.body.unpack(&self.core)?;
        for block in worlds.blocks.iter_mut() {
            block.keep_records(keep)?;
        }
        worlds
            .blocks
            .retain(|b| keep.contains(&RecordKey::from(b.world().fid())));
        worlds.index.clear();
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
        let dest = self.body.unpack(&self.core)?;
        let source = src.body.unpack(&src.core)?;
        let mut filtered = Vec::with_capacity(source.blocks.len());
        for mut src_block in std::mem::take(&mut source.blocks) {
            let fid = src_block.world().fid().clone();
            let (pos, newly_added) = match dest.position(&fid) {
                Some(pos) => (pos, false),
                None => (dest.set_world(&self.core, src_block.world().type_copy()), true),
            };
            dest.blocks[pos].merge_records(&mut src_block, load_set, merge_ids, ii_skip_merge, do_filter)?;

            let filtered_out = do_filter && {
                let mut masters = MasterSet::new();
                src_block.update_masters(&mut masters);
                !masters.loaded_in(load_set)
            };
            if newly_added && (ii_skip_merge || filtered_out) {
                dest.remove_world(&fid);
            }
            if filtered_out {
                tracing::trace!("过滤掉世界 {}", fid);
                continue;
            }
            filtered.push(src_block);
        }
        source.blocks = filtered;
        source.index();
        tracing::debug!(
            "合并 WRLD 组：{} 个世界，来源保留 {} 个",
            dest.blocks.len(),
            source.blocks.len()
        );
        Ok(())
    }

    fn update_masters(&self, masters: &mut MasterSet) {
        for block in self.world_blocks() {
            block.update_masters(masters);
        }
    }

    fn update_records(&mut self, src: &Self, mapper: FidMapper<'_>, merge_ids: &mut RecordKeySet) -> Result<()> {
        let worlds = self.body.unpack(&self.core)?;
        for src_block in src.world_blocks() {
            let fid = mapper(src_block.world().fid());
            if let Some(pos) = worlds.position(&fid) {
                worlds.blocks[pos].update_records(src_block, mapper, merge_ids)?;
            }
        }
        Ok(())
    }
}
