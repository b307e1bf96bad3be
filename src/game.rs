use crate::form_id::MasterName;
use crate::header::Signature;
use crate::utils::{EspError, Result};
use serde::Deserialize;

/// 游戏配置
///
/// 取代"当前游戏"全局状态，作为显式参数传给加载与合并操作。
#[derive(Debug, Clone, Deserialize)]
pub struct GameProfile {
    /// 游戏标识（如 "falloutnv"）
    pub name: String,
    /// 游戏主文件名
    pub master_file: String,
    /// 世界/单元格子组按标签查找所属记录（Fallout 风格），否则必须紧跟所属记录
    pub lookup_children_by_label: bool,
    /// 单元格子组中允许的引用记录类型
    pub cell_reference_types: Vec<String>,
    /// 新建插件时 HEDR 中的版本号
    pub header_version: f32,
}

impl GameProfile {
    /// 内置的全部游戏配置
    pub fn all() -> Result<Vec<GameProfile>> {
        let json_data = include_str!("../data/game_profiles.json");
        Ok(serde_json::from_str(json_data)?)
    }

    /// 按名称查找内置配置
    pub fn load(name: &str) -> Result<GameProfile> {
        Self::all()?
            .into_iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| EspError::format(name, "Unknown game profile"))
    }

    pub fn master_name(&self) -> MasterName {
        MasterName::new(self.master_file.as_str())
    }

    pub fn is_reference_type(&self, signature: &Signature) -> bool {
        self.cell_reference_types
            .iter()
            .any(|sig| sig.as_bytes() == signature)
    }
}
