//! 集成测试共用的插件构造工具

#![allow(dead_code)]

use esp_groups::group::BlockLabel;
use esp_groups::{FormId, GameProfile, GroupHeader, GroupType, LoadFactory, PluginRecord, Record, Subrecord, HEADER_SIZE};
use std::sync::Arc;

pub const GAME_MASTER: &str = "FalloutNV.esm";

pub fn factory() -> Arc<LoadFactory> {
    Arc::new(LoadFactory::new(GameProfile::load("falloutnv").unwrap()))
}

pub fn record(signature: [u8; 4], fid: u32, subrecords: &[Subrecord]) -> Record {
    Record::new(signature, FormId::Short(fid), 0, subrecords).unwrap()
}

pub fn record_bytes(signature: [u8; 4], fid: u32, subrecords: &[Subrecord]) -> Vec<u8> {
    let mut out = Vec::new();
    record(signature, fid, subrecords).dump(&mut out).unwrap();
    out
}

pub fn edid(name: &str) -> Subrecord {
    let mut data = name.as_bytes().to_vec();
    data.push(0);
    Subrecord::new(*b"EDID", data)
}

pub fn interior_cell(fid: u32) -> Record {
    record(*b"CELL", fid, &[Subrecord::new(*b"DATA", vec![1])])
}

pub fn exterior_cell(fid: u32, x: i32, y: i32) -> Record {
    let mut xclc = x.to_le_bytes().to_vec();
    xclc.extend_from_slice(&y.to_le_bytes());
    record(
        *b"CELL",
        fid,
        &[Subrecord::new(*b"DATA", vec![0]), Subrecord::new(*b"XCLC", xclc)],
    )
}

pub fn dumped(record: &Record) -> Vec<u8> {
    let mut out = Vec::new();
    record.dump(&mut out).unwrap();
    out
}

/// 给内容加上组头部
pub fn group(label: [u8; 4], group_type: GroupType, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GroupHeader::new(HEADER_SIZE + body.len() as u32, label, group_type, 0)
        .write(&mut out)
        .unwrap();
    out.extend_from_slice(body);
    out
}

pub fn fid_label(fid: u32) -> [u8; 4] {
    fid.to_le_bytes()
}

pub fn exterior_label(x: i32, y: i32) -> [u8; 4] {
    BlockLabel::exterior(x, y).to_label()
}

pub fn tes4(masters: &[&str]) -> Vec<u8> {
    let mut subrecords = Vec::new();
    for master in masters {
        let mut name = master.as_bytes().to_vec();
        name.push(0);
        subrecords.push(Subrecord::new(*b"MAST", name));
        subrecords.push(Subrecord::new(*b"DATA", vec![0; 8]));
    }
    record_bytes(*b"TES4", 0, &subrecords)
}

pub fn plugin_bytes(masters: &[&str], groups: &[Vec<u8>]) -> Vec<u8> {
    let mut out = tes4(masters);
    for group in groups {
        out.extend_from_slice(group);
    }
    out
}

/// 覆盖全部容器类型的示例插件（主文件为 FalloutNV.esm，自身索引 01）
///
/// - NPC_：0x000A00（主文件的覆盖）和 0x01000800
/// - GMST：一条以 EDID 为键的设置
/// - DIAL：主题 0x01000900 及其两条 INFO
/// - CELL：内部单元格 11（带持久引用）和 21（无子组）
/// - WRLD：世界 0x01000C00，带 ROAD、世界单元格和两个外部单元格
pub fn sample_plugin() -> Vec<u8> {
    let mut npcs = record_bytes(*b"NPC_", 0x0000_0A00, &[edid("Base")]);
    npcs.extend(record_bytes(*b"NPC_", 0x0100_0800, &[edid("NewNpc")]));
    let npc_group = group(*b"NPC_", GroupType::Top, &npcs);

    let gmst_group = group(
        *b"GMST",
        GroupType::Top,
        &record_bytes(*b"GMST", 0, &[edid("fTestSetting"), Subrecord::new(*b"DATA", vec![0; 4])]),
    );

    let mut infos = record_bytes(*b"INFO", 0x0100_0901, &[]);
    infos.extend(record_bytes(*b"INFO", 0x0100_0902, &[]));
    let mut topics = record_bytes(*b"DIAL", 0x0100_0900, &[edid("Greeting")]);
    topics.extend(group(fid_label(0x0100_0900), GroupType::TopicChildren, &infos));
    let dial_group = group(*b"DIAL", GroupType::Top, &topics);

    // 内部单元格 11 -> 块 1 / 子块 1，21 -> 块 1 / 子块 2
    let persistent = group(
        fid_label(0x0100_000B),
        GroupType::CellPersistent,
        &record_bytes(*b"REFR", 0x0100_0A01, &[]),
    );
    let mut sub1 = dumped(&interior_cell(0x0100_000B));
    sub1.extend(group(fid_label(0x0100_000B), GroupType::CellChildren, &persistent));
    let sub2 = dumped(&interior_cell(0x0100_0015));
    let mut block1 = group(1i32.to_le_bytes(), GroupType::InteriorSubBlock, &sub1);
    block1.extend(group(2i32.to_le_bytes(), GroupType::InteriorSubBlock, &sub2));
    let cell_group = group(*b"CELL", GroupType::Top, &group(1i32.to_le_bytes(), GroupType::InteriorBlock, &block1));

    // 单元格 (1,1) 在块 (0,0)/子块 (0,0)；(-1,40) 在块 (-1,1)/子块 (-1,5)
    let temporary = group(
        fid_label(0x0100_0C02),
        GroupType::CellTemporary,
        &record_bytes(*b"REFR", 0x0100_0C03, &[]),
    );
    let mut first = dumped(&exterior_cell(0x0100_0C02, 1, 1));
    first.extend(group(fid_label(0x0100_0C02), GroupType::CellChildren, &temporary));
    let first_block = group(
        exterior_label(0, 0),
        GroupType::ExteriorBlock,
        &group(exterior_label(0, 0), GroupType::ExteriorSubBlock, &first),
    );
    let second = dumped(&exterior_cell(0x0100_0C04, -1, 40));
    let second_block = group(
        exterior_label(-1, 1),
        GroupType::ExteriorBlock,
        &group(exterior_label(-1, 5), GroupType::ExteriorSubBlock, &second),
    );

    let mut world_children = record_bytes(*b"ROAD", 0x0100_0C05, &[]);
    world_children.extend(dumped(&exterior_cell(0x0100_0C01, 0, 0)));
    world_children.extend(first_block);
    world_children.extend(second_block);
    let mut worlds = record_bytes(*b"WRLD", 0x0100_0C00, &[edid("TestWorld")]);
    worlds.extend(group(fid_label(0x0100_0C00), GroupType::WorldChildren, &world_children));
    let world_group = group(*b"WRLD", GroupType::Top, &worlds);

    plugin_bytes(
        &[GAME_MASTER],
        &[npc_group, gmst_group, dial_group, cell_group, world_group],
    )
}

/// 示例插件中的记录数（不含 TES4）
pub const SAMPLE_RECORDS: usize = 2 + 1 + 3 + 3 + 6;
