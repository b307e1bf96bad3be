use super::{
    convert_records, dump_records, passes_filter, records_size, Body, Container, Contents, FidIndex,
    GroupCore, RecordIter,
};
use crate::form_id::{LoadSet, MasterIndex, MasterSet, RecordKey, RecordKeySet};
use crate::header::{GroupHeader, Header, Signature, HEADER_SIZE};
use crate::load_factory::LoadFactory;
use crate::reader::ModReader;
use crate::record::{FidMapper, PluginRecord};
use crate::utils::{sig_str, EspError, Result};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

/// 单一类型记录组的内容
#[derive(Debug, Default)]
pub struct ObjectRecords {
    pub records: Vec<Box<dyn PluginRecord>>,
    index: FidIndex,
}

impl ObjectRecords {
    fn rebuild_index(&mut self, core: &GroupCore) {
        let keys: Vec<RecordKey> = self.records.iter().map(|r| core.record_key(r.as_ref())).collect();
        self.index.rebuild(keys.into_iter());
    }

    /// 按键替换已有记录，或追加新记录
    fn set_record(&mut self, core: &GroupCore, record: Box<dyn PluginRecord>) {
        if !self.index.is_built() {
            self.rebuild_index(core);
        }
        let key = core.record_key(record.as_ref());
        match self.index.get(&key) {
            Some(pos) => self.records[pos] = record,
            None => {
                self.records.push(record);
                self.index.insert(key, self.records.len() - 1);
            }
        }
    }
}

impl Contents for ObjectRecords {
    fn load_contents(core: &GroupCore, reader: &mut ModReader, end: u64) -> Result<Self> {
        let expected = core.header.label;
        let label = format!("{} Top Block", sig_str(&expected));
        let mut records = Vec::new();
        while !reader.at_end(end, &label)? {
            let header = match reader.read_header()? {
                Header::Record(header) if header.signature == expected => header,
                other => {
                    return Err(core.error(format!(
                        "Unexpected {} record in {} group",
                        sig_str(&other.signature()),
                        sig_str(&expected)
                    )))
                }
            };
            let ctor = core
                .factory()
                .record_ctor(&expected)
                .ok_or_else(|| EspError::UnsupportedRecordType(sig_str(&expected)))?;
            records.push(ctor(header, reader)?);
        }
        Ok(ObjectRecords {
            records,
            index: FidIndex::default(),
        })
    }
}

/// 顶级组：只包含一种记录（CELL、WRLD、DIAL 之外的所有顶级组）
#[derive(Debug)]
pub struct ObjectGroup {
    core: GroupCore,
    body: Body<ObjectRecords>,
}

impl ObjectGroup {
    pub fn from_core(core: GroupCore) -> Self {
        ObjectGroup {
            core,
            body: Body::Parsed(ObjectRecords::default()),
        }
    }

    /// 新建空组
    pub fn new(label: Signature, stamp: u32, factory: Arc<LoadFactory>, file_name: &str) -> Self {
        Self::from_core(GroupCore::new(GroupHeader::top(label, stamp), factory, file_name))
    }

    pub fn label(&self) -> Signature {
        self.core.header.label
    }

    /// 已解析的记录（原始状态为空）
    pub fn records(&self) -> &[Box<dyn PluginRecord>] {
        self.body.parsed().map(|c| c.records.as_slice()).unwrap_or(&[])
    }

    /// 未被标记忽略的记录
    pub fn active_records(&self) -> impl Iterator<Item = &dyn PluginRecord> + '_ {
        self.records()
            .iter()
            .map(|record| &**record)
            .filter(|record| !record.is_ignored())
    }

    /// 按键查找记录；索引已建立时走索引
    pub fn get_record(&self, key: &RecordKey) -> Option<&dyn PluginRecord> {
        let contents = self.body.parsed()?;
        if contents.index.is_built() {
            return contents.index.get(key).map(|pos| &*contents.records[pos]);
        }
        contents
            .records
            .iter()
            .find(|record| &self.core.record_key(record.as_ref()) == key)
            .map(|record| &**record)
    }

    /// 添加记录；键已存在时原位替换
    pub fn set_record(&mut self, record: Box<dyn PluginRecord>) -> Result<()> {
        let contents = self.body.unpack(&self.core)?;
        contents.set_record(&self.core, record);
        Ok(())
    }

    pub fn is_indexed(&self) -> bool {
        self.body.parsed().map(|c| c.index.is_built()).unwrap_or(false)
    }
}

impl Container for ObjectGroup {
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
        let records = self.records();
        if records.is_empty() {
            0
        } else {
            HEADER_SIZE + records_size(records)
        }
    }

    fn get_num_records(&self, include_groups: bool) -> Result<usize> {
        if let Some(count) = self.body.raw_num_records(&self.core, include_groups)? {
            return Ok(count);
        }
        let count = self.records().len();
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
        dump_records(self.records(), out)
    }

    fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> Result<()> {
        let contents = self.body.unpack(&self.core)?;
        convert_records(&mut contents.records, masters, to_long)?;
        contents.index.clear();
        Ok(())
    }

    fn all_signatures(&self) -> HashSet<Signature> {
        HashSet::from([self.core.header.label])
    }

    fn index_records(&mut self) {
        if let Body::Parsed(contents) = &mut self.body {
            contents.rebuild_index(&self.core);
        }
    }

    fn iter_records(&self) -> RecordIter<'_> {
        Box::new(self.records().iter().map(|record| &**record))
    }

    fn keep_records(&mut self, keep: &mut RecordKeySet) -> Result<()> {
        let core = &self.core;
        let contents = self.body.unpack(core)?;
        contents.records.retain(|record| keep.contains(&core.record_key(record.as_ref())));
        contents.index.clear();
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
        let mut filtered = Vec::with_capacity(source.records.len());
        for mut record in std::mem::take(&mut source.records) {
            if record.is_ignored() {
                continue;
            }
            if do_filter && !passes_filter(record.as_mut(), load_set) {
                tracing::trace!("过滤掉记录 {} [{}]", sig_str(&record.signature()), record.fid());
                continue;
            }
            if !ii_skip_merge {
                merge_ids.insert(self.core.record_key(record.as_ref()));
                dest.set_record(&self.core, record.type_copy());
            }
            filtered.push(record);
        }
        source.records = filtered;
        source.rebuild_index(&src.core);
        tracing::debug!(
            "合并 {} 组: {} 条来自 {}",
            sig_str(&self.core.header.label),
            source.records.len(),
            src.core.file_name()
        );
        Ok(())
    }

    fn update_masters(&self, masters: &mut MasterSet) {
        for record in self.records() {
            record.update_masters(masters);
        }
    }

    fn update_records(&mut self, src: &Self, mapper: FidMapper<'_>, merge_ids: &mut RecordKeySet) -> Result<()> {
        let dest = self.body.unpack(&self.core)?;
        let present: HashSet<_> = dest.records.iter().map(|record| record.fid().clone()).collect();
        for record in src.active_records() {
            if present.contains(&mapper(record.fid())) {
                let copy = record.mapped_copy(mapper);
                merge_ids.remove(&RecordKey::from(copy.fid()));
                dest.set_record(&self.core, copy);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form_id::FormId;
    use crate::game::GameProfile;
    use crate::record::Record;
    use crate::subrecord::Subrecord;

    fn factory() -> Arc<LoadFactory> {
        Arc::new(LoadFactory::new(GameProfile::load("falloutnv").unwrap()))
    }

    fn npc(fid: FormId, name: &str) -> Box<dyn PluginRecord> {
        let edid = format!("{}\0", name).into_bytes();
        Box::new(Record::new(*b"NPC_", fid, 0, &[Subrecord::new(*b"EDID", edid)]).unwrap())
    }

    fn group_bytes(records: &[Box<dyn PluginRecord>]) -> Vec<u8> {
        let mut body = Vec::new();
        dump_records(records, &mut body).unwrap();
        let mut out = Vec::new();
        GroupHeader::new(HEADER_SIZE + body.len() as u32, *b"NPC_", crate::header::GroupType::Top, 7)
            .write(&mut out)
            .unwrap();
        out.extend(body);
        out
    }

    fn load(data: &[u8], eager: bool) -> ObjectGroup {
        let mut reader = ModReader::new("Test.esp", data);
        let header = reader.read_header().unwrap().as_group_header();
        let mut group = ObjectGroup::from_core(GroupCore::new(header, factory(), "Test.esp"));
        group.load(&mut reader, eager).unwrap();
        group
    }

    #[test]
    fn test_raw_and_eager_agree() {
        let data = group_bytes(&[npc(FormId::Short(1), "A"), npc(FormId::Short(2), "B")]);
        let raw = load(&data, false);
        let parsed = load(&data, true);
        assert!(!raw.is_changed());
        assert!(parsed.is_changed());
        assert_eq!(raw.get_size(), parsed.get_size());
        assert_eq!(raw.get_num_records(true).unwrap(), 3);
        assert_eq!(parsed.get_num_records(true).unwrap(), 3);
        assert_eq!(parsed.get_num_records(false).unwrap(), 2);

        let mut out = Vec::new();
        parsed.dump(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_wrong_signature_is_format_error() {
        let glob = Record::new(*b"GLOB", FormId::Short(1), 0, &[]).unwrap();
        let mut data = group_bytes(&[Box::new(glob) as Box<dyn PluginRecord>]);
        let mut raw = load(&data, false);
        assert!(raw.unpack().unwrap_err().is_format());
        assert!(!raw.is_changed());

        data.truncate(data.len() - 1);
        let mut reader = ModReader::new("Test.esp", &data);
        let header = reader.read_header().unwrap().as_group_header();
        let mut group = ObjectGroup::from_core(GroupCore::new(header, factory(), "Test.esp"));
        assert!(group.load(&mut reader, false).is_err());
    }

    #[test]
    fn test_empty_group_writes_nothing() {
        let group = ObjectGroup::new(*b"NPC_", 0, factory(), "Patch.esp");
        assert_eq!(group.get_size(), 0);
        assert_eq!(group.get_num_records(true).unwrap(), 0);
        let mut out = Vec::new();
        group.dump(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_set_record_replaces_in_place() {
        let mut group = ObjectGroup::new(*b"NPC_", 0, factory(), "Patch.esp");
        group.set_record(npc(FormId::long("A.esm", 1), "One")).unwrap();
        group.set_record(npc(FormId::long("A.esm", 2), "Two")).unwrap();
        group.set_record(npc(FormId::long("A.esm", 1), "OneUpdated")).unwrap();

        let eids: Vec<_> = group.records().iter().map(|r| r.editor_id().unwrap().to_string()).collect();
        assert_eq!(eids, vec!["OneUpdated", "Two"]);
    }

    #[test]
    fn test_gmst_keyed_by_editor_id() {
        let mut group = ObjectGroup::new(*b"GMST", 0, factory(), "Patch.esp");
        let gmst = |eid: &str| -> Box<dyn PluginRecord> {
            let edid = format!("{}\0", eid).into_bytes();
            Box::new(
                Record::new(*b"GMST", FormId::long("FalloutNV.esm", 0), 0, &[Subrecord::new(*b"EDID", edid)])
                    .unwrap(),
            )
        };
        group.set_record(gmst("fJumpHeight")).unwrap();
        group.set_record(gmst("iMaxLevel")).unwrap();
        assert_eq!(group.records().len(), 2);
        assert!(group.get_record(&RecordKey::Eid("iMaxLevel".into())).is_some());

        let mut keep = RecordKeySet::from([RecordKey::Eid("fJumpHeight".into())]);
        group.keep_records(&mut keep).unwrap();
        assert_eq!(group.records().len(), 1);
        assert!(!group.is_indexed());
    }

    #[test]
    fn test_index_identity() {
        let mut group = ObjectGroup::new(*b"NPC_", 0, factory(), "Patch.esp");
        for id in 1..=3 {
            group.set_record(npc(FormId::long("A.esm", id), "N")).unwrap();
        }
        group.index_records();
        for record in group.iter_records() {
            let found = group.get_record(&RecordKey::from(record.fid())).unwrap();
            assert!(std::ptr::eq(
                found as *const dyn PluginRecord as *const u8,
                record as *const dyn PluginRecord as *const u8
            ));
        }
    }

    #[test]
    fn test_merge_iim_records_nothing() {
        let mut dest = ObjectGroup::new(*b"NPC_", 0, factory(), "Patch.esp");
        let mut src = ObjectGroup::new(*b"NPC_", 0, factory(), "Mod.esp");
        src.set_record(npc(FormId::long("A.esm", 1), "One")).unwrap();

        let load_set = LoadSet::from(["A.esm".into()]);
        let mut merge_ids = RecordKeySet::new();
        dest.merge_records(&mut src, &load_set, &mut merge_ids, true, true).unwrap();
        assert!(merge_ids.is_empty());
        assert!(dest.records().is_empty());
        assert_eq!(src.records().len(), 1);
    }

    #[test]
    fn test_update_records_discards_merge_ids() {
        let mut dest = ObjectGroup::new(*b"NPC_", 0, factory(), "Patch.esp");
        dest.set_record(npc(FormId::long("A.esm", 1), "Old")).unwrap();
        let mut src = ObjectGroup::new(*b"NPC_", 0, factory(), "Mod.esp");
        src.set_record(npc(FormId::long("A.esm", 1), "New")).unwrap();
        src.set_record(npc(FormId::long("A.esm", 9), "Other")).unwrap();

        let mut merge_ids = RecordKeySet::from([RecordKey::from(FormId::long("A.esm", 1))]);
        let identity = |fid: &FormId| fid.clone();
        dest.update_records(&src, &identity, &mut merge_ids).unwrap();
        assert!(merge_ids.is_empty());
        assert_eq!(dest.records().len(), 1);
        assert_eq!(dest.records()[0].editor_id(), Some("New"));
    }
}
