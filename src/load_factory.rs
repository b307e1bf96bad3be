use crate::form_id::MasterName;
use crate::game::GameProfile;
use crate::header::{RecordHeader, Signature};
use crate::reader::ModReader;
use crate::record::{PluginRecord, Record};
use crate::utils::Result;
use std::collections::{HashMap, HashSet};

/// 记录构造函数：头部已读取，读取器位于数据部分开头
pub type RecordCtor = fn(RecordHeader, &mut ModReader) -> Result<Box<dyn PluginRecord>>;

/// 加载配置
///
/// 决定哪些记录类型会被解码、用什么构造函数解码，
/// 以及单元格子组是立即解析还是保留原始字节。
#[derive(Debug, Clone)]
pub struct LoadFactory {
    game: GameProfile,
    game_master: MasterName,
    types: Option<HashSet<Signature>>,
    ctors: HashMap<Signature, RecordCtor>,
    default_ctor: RecordCtor,
    unpack_cell_blocks: bool,
}

impl LoadFactory {
    /// 解码所有记录类型
    pub fn new(game: GameProfile) -> Self {
        let game_master = game.master_name();
        LoadFactory {
            game,
            game_master,
            types: None,
            ctors: HashMap::new(),
            default_ctor: Record::load,
            unpack_cell_blocks: true,
        }
    }

    /// 只解码指定的记录类型，其余类型在单元格/世界子组中被跳过
    pub fn with_types(game: GameProfile, types: &[Signature]) -> Self {
        let mut factory = Self::new(game);
        factory.types = Some(types.iter().copied().collect());
        factory
    }

    /// 为某个签名注册专用构造函数
    pub fn register(mut self, signature: Signature, ctor: RecordCtor) -> Self {
        self.ctors.insert(signature, ctor);
        self
    }

    /// 替换默认构造函数
    pub fn default_ctor(mut self, ctor: RecordCtor) -> Self {
        self.default_ctor = ctor;
        self
    }

    /// 单元格子组是否立即解析
    pub fn unpack_cell_blocks(mut self, unpack: bool) -> Self {
        self.unpack_cell_blocks = unpack;
        self
    }

    pub fn should_unpack_cell_blocks(&self) -> bool {
        self.unpack_cell_blocks
    }

    pub fn game(&self) -> &GameProfile {
        &self.game
    }

    /// 游戏主文件名
    pub fn game_master(&self) -> &MasterName {
        &self.game_master
    }

    /// 获取某个签名的构造函数；不解码的类型返回 None
    pub fn record_ctor(&self, signature: &Signature) -> Option<RecordCtor> {
        if let Some(types) = &self.types {
            if !types.contains(signature) {
                return None;
            }
        }
        Some(self.ctors.get(signature).copied().unwrap_or(self.default_ctor))
    }

    /// 单元格子组中允许出现的记录类型
    pub fn is_cell_child_type(&self, signature: &Signature) -> bool {
        signature == b"LAND" || signature == b"PGRD" || self.game.is_reference_type(signature)
    }
}
