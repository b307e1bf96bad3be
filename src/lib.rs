pub mod datatypes;
pub mod form_id;
pub mod game;
pub mod group;
pub mod header;
pub mod load_factory;
pub mod patch;
pub mod plugin;
pub mod reader;
pub mod record;
pub mod subrecord;
pub mod utils;

// 重新导出主要结构
pub use form_id::{FormId, LoadSet, MasterIndex, MasterName, MasterSet, RecordKey, RecordKeySet};
pub use game::GameProfile;
pub use group::{
    CellBlock, Container, DialogueGroup, InteriorCellContainer, ObjectGroup, TopGroup, WorldBlock,
    WorldGroup,
};
pub use header::{GroupHeader, GroupType, Header, RecordHeader, HEADER_SIZE};
pub use load_factory::LoadFactory;
pub use patch::PatchBuilder;
pub use plugin::{Plugin, PluginStats};
pub use reader::ModReader;
pub use record::{PluginRecord, Record};
pub use subrecord::Subrecord;
pub use utils::{EspError, Result};

// 常量定义
pub const SUPPORTED_EXTENSIONS: &[&str] = &["esp", "esm", "esl"];
