//! 合并与过滤测试
//!
//! 测试场景：
//! - 覆盖与新增记录的合并结果和合并集合
//! - 过滤后目标与来源中的记录只引用已加载的插件
//! - 只过滤（IIM）的来源不向目标添加任何记录
//! - 整个插件合并成补丁后可以重新加载

mod common;

use common::*;
use esp_groups::datatypes::write_u32;
use esp_groups::record::FidMapper;
use esp_groups::{
    Container, FormId, GroupHeader, InteriorCellContainer, LoadSet, MasterIndex, MasterName, MasterSet, ObjectGroup,
    PatchBuilder, Plugin, PluginRecord, Record, RecordHeader, RecordKey, RecordKeySet, Subrecord, TopGroup,
};
use std::io::Write;

/// 带 FormID 引用列表的记录，用来观察过滤效果
#[derive(Debug, Clone)]
struct RefRecord {
    header: RecordHeader,
    fid: FormId,
    refs: Vec<FormId>,
}

impl RefRecord {
    fn boxed(signature: [u8; 4], fid: FormId, refs: Vec<FormId>) -> Box<dyn PluginRecord> {
        Box::new(RefRecord {
            header: RecordHeader::new(signature, 0, 0, 0),
            fid,
            refs,
        })
    }
}

impl PluginRecord for RefRecord {
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
        None
    }

    fn get_size(&self) -> u32 {
        self.refs.len() as u32 * 4
    }

    fn dump(&self, out: &mut dyn Write) -> esp_groups::Result<()> {
        let mut header = self.header;
        header.size = self.get_size();
        header.fid = self.fid.as_short()?;
        header.write(out)?;
        for fid in &self.refs {
            write_u32(out, fid.as_short()?)?;
        }
        Ok(())
    }

    fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> esp_groups::Result<()> {
        self.fid = masters.convert(&self.fid, to_long)?;
        for fid in self.refs.iter_mut() {
            *fid = masters.convert(fid, to_long)?;
        }
        Ok(())
    }

    fn update_masters(&self, masters: &mut MasterSet) {
        masters.add_fid(&self.fid);
        for fid in &self.refs {
            masters.add_fid(fid);
        }
    }

    fn merge_filter(&mut self, load_set: &LoadSet) {
        self.refs
            .retain(|fid| fid.master().map(|m| load_set.contains(m)).unwrap_or(true));
    }

    fn type_copy(&self) -> Box<dyn PluginRecord> {
        Box::new(self.clone())
    }

    fn mapped_copy(&self, mapper: FidMapper<'_>) -> Box<dyn PluginRecord> {
        let mut copy = self.clone();
        copy.fid = mapper(&self.fid);
        copy.refs = self.refs.iter().map(|fid| mapper(fid)).collect();
        Box::new(copy)
    }
}

fn load_set(names: &[&str]) -> LoadSet {
    names.iter().map(|name| MasterName::new(*name)).collect()
}

fn npc(fid: u32, name: &str) -> Box<dyn PluginRecord> {
    Box::new(Record::new(*b"NPC_", FormId::long(GAME_MASTER, fid), 0, &[edid(name)]).unwrap())
}

fn npc_group(file: &str, records: Vec<Box<dyn PluginRecord>>) -> ObjectGroup {
    let mut group = ObjectGroup::new(*b"NPC_", 0, factory(), file);
    for record in records {
        group.set_record(record).unwrap();
    }
    group
}

fn assert_loaded(records: &[Box<dyn PluginRecord>], load_set: &LoadSet) {
    for record in records {
        let mut masters = MasterSet::new();
        record.update_masters(&mut masters);
        assert!(masters.loaded_in(load_set), "{} 引用了未加载的插件", record.fid());
    }
}

#[test]
fn test_merge_override_and_new_record() {
    let mut dest = npc_group("Patch.esp", vec![npc(0x001, "Original"), npc(0x002, "Second")]);
    let mut src = npc_group("Mod.esp", vec![npc(0x001, "Updated"), npc(0x003, "Third")]);
    let mut merge_ids = RecordKeySet::new();

    dest.merge_records(&mut src, &load_set(&[GAME_MASTER, "Mod.esp"]), &mut merge_ids, false, false)
        .unwrap();

    let fids: Vec<u32> = dest.records().iter().map(|r| r.fid().object_id()).collect();
    assert_eq!(fids, vec![0x001, 0x002, 0x003]);
    assert_eq!(dest.records()[0].editor_id(), Some("Updated"));

    let expected: RecordKeySet = [0x001, 0x003]
        .iter()
        .map(|id| RecordKey::from(FormId::long(GAME_MASTER, *id)))
        .collect();
    assert_eq!(merge_ids, expected);
}

#[test]
fn test_filter_drops_unloaded_references() {
    let loaded = load_set(&[GAME_MASTER, "Mod.esp"]);
    let records = vec![
        RefRecord::boxed(
            *b"NPC_",
            FormId::long("Mod.esp", 0x800),
            vec![FormId::long(GAME_MASTER, 0x10), FormId::long("Missing.esm", 0x20)],
        ),
        RefRecord::boxed(*b"NPC_", FormId::long("Missing.esm", 0x30), vec![]),
        RefRecord::boxed(*b"NPC_", FormId::long("Mod.esp", 0x801), vec![]),
    ];
    let mut dest = npc_group("Patch.esp", vec![]);
    let mut src = npc_group("Mod.esp", records);
    let mut merge_ids = RecordKeySet::new();

    dest.merge_records(&mut src, &loaded, &mut merge_ids, false, true).unwrap();

    assert_eq!(dest.records().len(), 2);
    assert_eq!(src.records().len(), 2);
    assert_eq!(merge_ids.len(), 2);
    assert!(!merge_ids.contains(&RecordKey::from(FormId::long("Missing.esm", 0x30))));
    assert_loaded(dest.records(), &loaded);
    assert_loaded(src.records(), &loaded);
}

#[test]
fn test_filter_in_cell_children() {
    let loaded = load_set(&[GAME_MASTER, "Mod.esp"]);
    let kept_cell = FormId::long("Mod.esp", 11);
    let dropped_cell = FormId::long("Missing.esm", 12);

    let mut src = InteriorCellContainer::new(0, factory(), "Mod.esp");
    for fid in [&kept_cell, &dropped_cell] {
        let cell = Record::new(*b"CELL", fid.clone(), 0, &[Subrecord::new(*b"DATA", vec![1])]).unwrap();
        src.set_cell(Box::new(cell)).unwrap();
    }
    let children = src
        .cell_block_mut(&kept_cell)
        .unwrap()
        .unwrap()
        .children_mut()
        .unwrap();
    children
        .persistent
        .push(RefRecord::boxed(*b"REFR", FormId::long("Mod.esp", 0x900), vec![]));
    children.persistent.push(RefRecord::boxed(
        *b"REFR",
        FormId::long("Missing.esm", 0x901),
        vec![],
    ));

    let mut dest = InteriorCellContainer::new(0, factory(), "Patch.esp");
    let mut merge_ids = RecordKeySet::new();
    dest.merge_records(&mut src, &loaded, &mut merge_ids, false, true).unwrap();

    assert_eq!(dest.cell_blocks().len(), 1);
    assert_eq!(dest.cell_blocks()[0].cell().fid(), &kept_cell);
    assert_eq!(src.cell_blocks().len(), 1);
    assert_eq!(dest.iter_records().count(), 2);
    assert!(!merge_ids.contains(&RecordKey::from(dropped_cell)));

    let mut masters = MasterSet::new();
    dest.update_masters(&mut masters);
    assert!(masters.loaded_in(&loaded));
    src.update_masters(&mut masters);
    assert!(masters.loaded_in(&loaded));
}

#[test]
fn test_iim_source_never_adds_records() {
    let loaded = load_set(&[GAME_MASTER, "Sample.esp"]);
    let mut plugin = Plugin::from_bytes("Sample.esp", &sample_plugin(), factory(), true).unwrap();
    plugin.convert_fids(true).unwrap();

    for do_filter in [false, true] {
        for src in plugin.groups.iter_mut() {
            let mut dest = TopGroup::new(GroupHeader::top(src.label(), 0), factory(), "Patch.esp");
            let mut merge_ids = RecordKeySet::new();
            dest.merge_records(src, &loaded, &mut merge_ids, true, do_filter).unwrap();
            assert!(merge_ids.is_empty(), "{:?}", src.label());
            assert_eq!(dest.iter_records().count(), 0);
            assert_eq!(dest.get_size(), 0);
        }
    }

    // 来源自身的记录保留
    let stats = plugin.get_stats().unwrap();
    assert_eq!(stats.record_count(), SAMPLE_RECORDS);
}

#[test]
fn test_patch_from_sample_plugin() {
    let loaded = load_set(&[GAME_MASTER, "Sample.esp"]);
    let mut plugin = Plugin::from_bytes("Sample.esp", &sample_plugin(), factory(), false).unwrap();
    let mut builder = PatchBuilder::new("Patch.esp", factory(), loaded).filter(true);
    builder.merge_plugin(&mut plugin, false).unwrap();
    assert_eq!(builder.merge_ids().len(), SAMPLE_RECORDS);

    let patch = builder.build().unwrap();
    assert_eq!(
        patch.masters(),
        &[MasterName::new(GAME_MASTER), MasterName::new("Sample.esp")]
    );

    let bytes = patch.to_bytes().unwrap();
    let reloaded = Plugin::from_bytes("Patch.esp", &bytes, factory(), true).unwrap();
    let stats = reloaded.get_stats().unwrap();
    assert_eq!(stats.record_count(), SAMPLE_RECORDS);
    assert_eq!(reloaded.to_bytes().unwrap(), bytes);
    println!("{}", stats);
}
