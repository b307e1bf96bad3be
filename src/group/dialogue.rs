use super::{
    convert_records, dump_records, passes_filter, records_size, Body, Container, Contents, FidIndex,
    GroupCore, RecordIter,
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

/// 对话主题及其回应
#[derive(Debug)]
pub struct Topic {
    pub record: Box<dyn PluginRecord>,
    pub infos: Vec<Box<dyn PluginRecord>>,
}

impl Topic {
    pub fn new(record: Box<dyn PluginRecord>) -> Self {
        Topic {
            record,
            infos: Vec::new(),
        }
    }

    /// 主题记录加上回应子组的大小
    fn size(&self) -> u32 {
        let mut size = dumped_size(self.record.as_ref());
        if !self.infos.is_empty() {
            size += HEADER_SIZE + records_size(&self.infos);
        }
        size
    }

    fn dump(&self, stamp: u32, out: &mut dyn Write) -> Result<()> {
        self.record.dump(out)?;
        if self.infos.is_empty() {
            return Ok(());
        }
        let size = HEADER_SIZE + records_size(&self.infos);
        GroupHeader::with_fid(size, self.record.fid().as_short()?, GroupType::TopicChildren, stamp).write(out)?;
        dump_records(&self.infos, out)
    }

    /// 按 FormID 替换回应，不存在则追加
    fn set_info(&mut self, info: Box<dyn PluginRecord>) {
        match self.infos.iter().position(|i| i.fid() == info.fid()) {
            Some(pos) => self.infos[pos] = info,
            None => self.infos.push(info),
        }
    }
}

#[derive(Debug, Default)]
pub struct DialogueTopics {
    pub topics: Vec<Topic>,
    index: FidIndex,
}

impl DialogueTopics {
    fn rebuild_index(&mut self, core: &GroupCore) {
        let keys: Vec<RecordKey> = self.topics.iter().map(|t| core.record_key(t.record.as_ref())).collect();
        self.index.rebuild(keys.into_iter());
    }

    /// 替换主题记录（保留已有回应）或追加新主题，返回位置
    fn set_topic(&mut self, core: &GroupCore, record: Box<dyn PluginRecord>) -> usize {
        if !self.index.is_built() {
            self.rebuild_index(core);
        }
        let key = core.record_key(record.as_ref());
        match self.index.get(&key) {
            Some(pos) => {
                self.topics[pos].record = record;
                pos
            }
            None => {
                self.topics.push(Topic::new(record));
                let pos = self.topics.len() - 1;
                self.index.insert(key, pos);
                pos
            }
        }
    }
}

impl Contents for DialogueTopics {
    fn load_contents(core: &GroupCore, reader: &mut ModReader, end: u64) -> Result<Self> {
        let expected = core.header.label;
        let label = format!("{} Top Block", sig_str(&expected));
        let factory = core.factory();
        let mut topics: Vec<Topic> = Vec::new();
        while !reader.at_end(end, &label)? {
            match reader.read_header()? {
                Header::Record(header) if header.signature == expected => {
                    let ctor = factory
                        .record_ctor(&expected)
                        .ok_or_else(|| EspError::UnsupportedRecordType(sig_str(&expected)))?;
                    topics.push(Topic::new(ctor(header, reader)?));
                }
                Header::Group(header) if header.group_type() == GroupType::TopicChildren => {
                    let topic = topics
                        .last_mut()
                        .ok_or_else(|| core.error("Topic children group before any DIAL record"))?;
                    let owner = FormId::Short(header.label_u32());
                    if topic.record.fid() != &owner {
                        return Err(core.error(format!(
                            "Topic children group {} does not belong to DIAL record {}",
                            owner,
                            topic.record.fid()
                        )));
                    }
                    let info_end = reader.tell() + header.payload_size() as u64;
                    match factory.record_ctor(b"INFO") {
                        Some(ctor) => {
                            while !reader.at_end(info_end, "INFO Block")? {
                                match reader.read_header()? {
                                    Header::Record(info) if &info.signature == b"INFO" => {
                                        topic.infos.push(ctor(info, reader)?)
                                    }
                                    other => {
                                        return Err(core.error(format!(
                                            "Unexpected {} record in topic children group",
                                            sig_str(&other.signature())
                                        )))
                                    }
                                }
                            }
                        }
                        None => reader.seek(header.payload_size() as i64)?,
                    }
                }
                Header::Group(header) => {
                    return Err(core.error(format!(
                        "Unexpected subgroup {} in DIAL group",
                        header.group_type
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
        Ok(DialogueTopics {
            topics,
            index: FidIndex::default(),
        })
    }
}

/// DIAL 顶级组：每个主题记录后面跟着它的回应子组
#[derive(Debug)]
pub struct DialogueGroup {
    core: GroupCore,
    body: Body<DialogueTopics>,
}

impl DialogueGroup {
    pub fn from_core(core: GroupCore) -> Self {
        DialogueGroup {
            core,
            body: Body::Parsed(DialogueTopics::default()),
        }
    }

    pub fn new(stamp: u32, factory: Arc<LoadFactory>, file_name: &str) -> Self {
        Self::from_core(GroupCore::new(GroupHeader::top(*b"DIAL", stamp), factory, file_name))
    }

    pub fn topics(&self) -> &[Topic] {
        self.body.parsed().map(|c| c.topics.as_slice()).unwrap_or(&[])
    }

    pub fn get_topic(&self, key: &RecordKey) -> Option<&Topic> {
        let contents = self.body.parsed()?;
        if contents.index.is_built() {
            return contents.index.get(key).map(|pos| &contents.topics[pos]);
        }
        contents
            .topics
            .iter()
            .find(|topic| &self.core.record_key(topic.record.as_ref()) == key)
    }

    /// 添加主题记录；已存在时替换记录并保留回应
    pub fn set_record(&mut self, record: Box<dyn PluginRecord>) -> Result<()> {
        let contents = self.body.unpack(&self.core)?;
        contents.set_topic(&self.core, record);
        Ok(())
    }

    /// 给已有主题添加回应
    pub fn set_info(&mut self, topic: &RecordKey, info: Box<dyn PluginRecord>) -> Result<()> {
        let core = &self.core;
        let contents = self.body.unpack(core)?;
        let pos = contents
            .topics
            .iter()
            .position(|t| &core.record_key(t.record.as_ref()) == topic)
            .ok_or_else(|| core.error(format!("No DIAL record for INFO {}", info.fid())))?;
        contents.topics[pos].set_info(info);
        Ok(())
    }
}

impl Container for DialogueGroup {
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
        let topics = self.topics();
        if topics.is_empty() {
            return 0;
        }
        HEADER_SIZE + topics.iter().map(Topic::size).sum::<u32>()
    }

    fn get_num_records(&self, include_groups: bool) -> Result<usize> {
        if let Some(count) = self.body.raw_num_records(&self.core, include_groups)? {
            return Ok(count);
        }
        let topics = self.topics();
        if topics.is_empty() {
            return Ok(0);
        }
        let groups = include_groups as usize;
        let infos: usize = topics
            .iter()
            .filter(|t| !t.infos.is_empty())
            .map(|t| t.infos.len() + groups)
            .sum();
        Ok(topics.len() + groups + infos)
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
        for topic in self.topics() {
            topic.dump(self.core.stamp(), out)?;
        }
        Ok(())
    }

    fn convert_fids(&mut self, masters: &MasterIndex, to_long: bool) -> Result<()> {
        let contents = self.body.unpack(&self.core)?;
        for topic in contents.topics.iter_mut() {
            topic.record.convert_fids(masters, to_long)?;
            convert_records(&mut topic.infos, masters, to_long)?;
        }
        contents.index.clear();
        Ok(())
    }

    fn all_signatures(&self) -> HashSet<Signature> {
        HashSet::from([self.core.header.label, *b"INFO"])
    }

    fn index_records(&mut self) {
        if let Body::Parsed(contents) = &mut self.body {
            contents.rebuild_index(&self.core);
        }
    }

    /// 先是全部主题，然后是全部回应
    fn iter_records(&self) -> RecordIter<'_> {
        let topics = self.topics();
        Box::new(
            topics
                .iter()
                .map(|t| &*t.record)
                .chain(topics.iter().flat_map(|t| t.infos.iter().map(|i| &**i))),
        )
    }

    fn keep_records(&mut self, keep: &mut RecordKeySet) -> Result<()> {
        let core = &self.core;
        let contents = self.body.unpack(core)?;
        contents
            .topics
            .retain(|topic| keep.contains(&core.record_key(topic.record.as_ref())));
        for topic in contents.topics.iter_mut() {
            topic.infos.retain(|info| keep.contains(&RecordKey::from(info.fid())));
        }
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
        dest.rebuild_index(&self.core);
        let source = src.body.unpack(&src.core)?;
        let mut filtered_topics = Vec::with_capacity(source.topics.len());
        for mut topic in std::mem::take(&mut source.topics) {
            if topic.record.is_ignored() {
                continue;
            }
            if do_filter && !passes_filter(topic.record.as_mut(), load_set) {
                tracing::trace!("过滤掉主题 {}", topic.record.fid());
                continue;
            }
            // IIM 模式下仍需过滤回应
            let slot = if ii_skip_merge {
                None
            } else {
                merge_ids.insert(self.core.record_key(topic.record.as_ref()));
                Some(dest.set_topic(&self.core, topic.record.type_copy()))
            };
            let mut filtered_infos = Vec::with_capacity(topic.infos.len());
            for mut info in std::mem::take(&mut topic.infos) {
                if info.is_ignored() {
                    continue;
                }
                if do_filter && !passes_filter(info.as_mut(), load_set) {
                    continue;
                }
                if let Some(pos) = slot {
                    merge_ids.insert(RecordKey::from(info.fid()));
                    dest.topics[pos].set_info(info.type_copy());
                }
                filtered_infos.push(info);
            }
            topic.infos = filtered_infos;
            filtered_topics.push(topic);
        }
        source.topics = filtered_topics;
        source.rebuild_index(&src.core);
        Ok(())
    }

    fn update_masters(&self, masters: &mut MasterSet) {
        for record in self.iter_records() {
            record.update_masters(masters);
        }
    }

    fn update_records(&mut self, src: &Self, mapper: FidMapper<'_>, merge_ids: &mut RecordKeySet) -> Result<()> {
        let dest = self.body.unpack(&self.core)?;
        for src_topic in src.topics().iter().filter(|t| !t.record.is_ignored()) {
            let topic_fid = mapper(src_topic.record.fid());
            let pos = match dest.topics.iter().position(|t| t.record.fid() == &topic_fid) {
                Some(pos) => pos,
                None => continue,
            };
            let topic = &mut dest.topics[pos];
            for src_info in &src_topic.infos {
                let info_fid = mapper(src_info.fid());
                if let Some(slot) = topic.infos.iter().position(|i| i.fid() == &info_fid) {
                    topic.infos[slot] = src_info.mapped_copy(mapper);
                    merge_ids.remove(&RecordKey::from(info_fid));
                }
            }
            topic.record = src_topic.record.mapped_copy(mapper);
            // 仍有待合并的回应时，主题也必须保留
            let pinned = topic
                .infos
                .iter()
                .any(|i| merge_ids.contains(&RecordKey::from(i.fid())));
            if !pinned {
                merge_ids.remove(&RecordKey::from(topic_fid));
            }
        }
        Ok(())
    }
}
