//! 合并补丁
//!
//! 把多个来源插件的顶级组合并成一棵补丁树：
//! 1. 来源插件转为长格式 FormID 后逐组 `merge_records`，记录合并集合
//! 2. `keep_records` 只保留合并集合中的记录（以及保留了子记录的单元格/世界）
//! 3. `update_masters` 计算补丁的主文件列表，转回短格式后写出新的 TES4 头部

use crate::datatypes::{write_f32, write_u32};
use crate::form_id::{FormId, LoadSet, MasterIndex, MasterName, MasterSet, RecordKeySet};
use crate::group::{Container, TopGroup};
use crate::header::{GroupHeader, Signature};
use crate::load_factory::LoadFactory;
use crate::plugin::{Plugin, TES4};
use crate::record::Record;
use crate::subrecord::Subrecord;
use crate::utils::Result;
use std::sync::Arc;

/// 新插件的下一个可用本地 ID
const FIRST_OBJECT_ID: u32 = 0x800;

/// 补丁构建器
#[derive(Debug)]
pub struct PatchBuilder {
    name: String,
    factory: Arc<LoadFactory>,
    load_set: LoadSet,
    do_filter: bool,
    groups: Vec<TopGroup>,
    merge_ids: RecordKeySet,
    /// 按合并顺序出现过的插件，用于排列主文件
    load_order: Vec<MasterName>,
}

impl PatchBuilder {
    pub fn new(name: &str, factory: Arc<LoadFactory>, load_set: LoadSet) -> Self {
        PatchBuilder {
            name: name.to_string(),
            factory,
            load_set,
            do_filter: false,
            groups: Vec::new(),
            merge_ids: RecordKeySet::new(),
            load_order: Vec::new(),
        }
    }

    /// 合并时过滤引用了未加载插件的记录
    pub fn filter(mut self, do_filter: bool) -> Self {
        self.do_filter = do_filter;
        self
    }

    pub fn merge_ids(&self) -> &RecordKeySet {
        &self.merge_ids
    }

    pub fn groups(&self) -> &[TopGroup] {
        &self.groups
    }

    pub fn top_group(&self, label: &Signature) -> Option<&TopGroup> {
        self.groups.iter().find(|group| &group.label() == label)
    }

    /// 合并一个来源插件
    ///
    /// `ii_skip_merge` 时来源只被过滤，不向补丁添加任何记录。
    pub fn merge_plugin(&mut self, plugin: &mut Plugin, ii_skip_merge: bool) -> Result<()> {
        plugin.convert_fids(true)?;
        for master in plugin.masters() {
            self.note_load_order(master.clone());
        }
        self.note_load_order(MasterName::new(plugin.name.as_str()));

        let before = self.merge_ids.len();
        for src in plugin.groups.iter_mut() {
            let label = src.label();
            let pos = match self.groups.iter().position(|g| g.label() == label) {
                Some(pos) => pos,
                None => {
                    let header = GroupHeader::top(label, 0);
                    self.groups
                        .push(TopGroup::new(header, Arc::clone(&self.factory), &self.name));
                    self.groups.len() - 1
                }
            };
            self.groups[pos].merge_records(src, &self.load_set, &mut self.merge_ids, ii_skip_merge, self.do_filter)?;
        }
        tracing::debug!(
            "合并 {}：新增 {} 个合并记录{}",
            plugin.name,
            self.merge_ids.len() - before,
            if ii_skip_merge { " (只过滤)" } else { "" }
        );
        Ok(())
    }

    fn note_load_order(&mut self, name: MasterName) {
        if !self.load_order.contains(&name) {
            self.load_order.push(name);
        }
    }

    /// 补丁引用到的主文件，按合并顺序排列
    pub fn masters(&self) -> Vec<MasterName> {
        let mut used = MasterSet::new();
        for group in &self.groups {
            group.update_masters(&mut used);
        }
        let own = MasterName::new(self.name.as_str());
        let mut masters: Vec<MasterName> = self
            .load_order
            .iter()
            .filter(|name| used.contains(name) && **name != own)
            .cloned()
            .collect();
        let mut rest: Vec<MasterName> = used
            .iter()
            .filter(|name| **name != own && !masters.contains(name))
            .cloned()
            .collect();
        rest.sort();
        masters.extend(rest);
        masters
    }

    /// 生成补丁插件（FormID 已转回短格式，可直接写出）
    pub fn build(mut self) -> Result<Plugin> {
        let mut keep = self.merge_ids.clone();
        for group in self.groups.iter_mut() {
            group.keep_records(&mut keep)?;
        }

        let masters = self.masters();
        let index = MasterIndex::new(masters.clone(), MasterName::new(self.name.as_str()));
        let mut num_records = 0;
        for group in self.groups.iter_mut() {
            group.convert_fids(&index, false)?;
            num_records += group.get_num_records(true)?;
        }
        self.groups.retain(|group| group.get_size() > 0);

        let header = self.header_record(&masters, num_records as u32)?;
        tracing::debug!(
            "补丁 {}：{} 个主文件，{} 个顶级组，{} 条记录",
            self.name,
            masters.len(),
            self.groups.len(),
            num_records
        );
        Ok(Plugin::from_parts(&self.name, header, self.groups, masters, self.factory))
    }

    /// TES4 头部：HEDR，然后每个主文件一对 MAST/DATA
    fn header_record(&self, masters: &[MasterName], num_records: u32) -> Result<Record> {
        let mut hedr = Vec::with_capacity(12);
        write_f32(&mut hedr, self.factory.game().header_version)?;
        write_u32(&mut hedr, num_records)?;
        write_u32(&mut hedr, FIRST_OBJECT_ID)?;

        let mut subrecords = vec![Subrecord::new(*b"HEDR", hedr)];
        for master in masters {
            let mut name = master.as_str().as_bytes().to_vec();
            name.push(0);
            subrecords.push(Subrecord::new(*b"MAST", name));
            subrecords.push(Subrecord::new(*b"DATA", vec![0; 8]));
        }
        Record::new(TES4, FormId::Short(0), 0, &subrecords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form_id::RecordKey;
    use crate::game::GameProfile;
    use crate::group::ObjectGroup;
    use crate::record::PluginRecord;

    fn factory() -> Arc<LoadFactory> {
        Arc::new(LoadFactory::new(GameProfile::load("falloutnv").unwrap()))
    }

    fn source(name: &str, fids: &[FormId]) -> Plugin {
        let mut group = ObjectGroup::new(*b"NPC_", 0, factory(), name);
        for fid in fids {
            group
                .set_record(Box::new(Record::new(*b"NPC_", fid.clone(), 0, &[]).unwrap()))
                .unwrap();
        }
        let header = Record::new(TES4, FormId::Short(0), 0, &[]).unwrap();
        Plugin::from_parts(name, header, vec![TopGroup::Objects(group)], vec![MasterName::new("A.esm")], factory())
    }

    #[test]
    fn test_patch_masters_and_header() {
        let load_set: LoadSet = ["A.esm", "B.esp"].iter().map(|n| MasterName::new(*n)).collect();
        let mut builder = PatchBuilder::new("Patch.esp", factory(), load_set);
        let mut plugin = source("B.esp", &[FormId::long("A.esm", 0x10), FormId::long("B.esp", 0x20)]);
        builder.merge_plugin(&mut plugin, false).unwrap();
        assert_eq!(builder.merge_ids().len(), 2);
        assert!(builder.merge_ids().contains(&RecordKey::from(FormId::long("A.esm", 0x10))));
        assert_eq!(builder.masters(), vec![MasterName::new("A.esm"), MasterName::new("B.esp")]);

        let patch = builder.build().unwrap();
        assert_eq!(patch.masters().len(), 2);
        let group = patch.top_group(b"NPC_").unwrap();
        let fids: Vec<_> = group.iter_records().map(|r| r.fid().clone()).collect();
        assert_eq!(fids, vec![FormId::Short(0x10), FormId::Short(0x0100_0020)]);

        let bytes = patch.to_bytes().unwrap();
        let reloaded = Plugin::from_bytes("Patch.esp", &bytes, factory(), true).unwrap();
        assert_eq!(reloaded.masters(), patch.masters());
    }

    #[test]
    fn test_iim_source_adds_nothing() {
        let load_set: LoadSet = ["A.esm", "B.esp"].iter().map(|n| MasterName::new(*n)).collect();
        let mut builder = PatchBuilder::new("Patch.esp", factory(), load_set);
        let mut plugin = source("B.esp", &[FormId::long("A.esm", 0x10)]);
        builder.merge_plugin(&mut plugin, true).unwrap();
        assert!(builder.merge_ids().is_empty());

        let patch = builder.build().unwrap();
        assert!(patch.groups.is_empty());
        assert!(patch.masters().is_empty());
    }
}
