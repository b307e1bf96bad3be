use super::Plugin;
use crate::group::Container;
use crate::header::Signature;
use crate::utils::{sig_str, Result};

/// 单个顶级组的统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStats {
    pub label: Signature,
    pub records: usize,
    /// 含顶级组自身在内的组头部数
    pub groups: usize,
    pub size: u32,
    pub parsed: bool,
}

/// 插件统计信息
#[derive(Debug, Clone)]
pub struct PluginStats {
    pub name: String,
    pub is_master: bool,
    pub master_count: usize,
    pub groups: Vec<GroupStats>,
}

impl PluginStats {
    pub fn record_count(&self) -> usize {
        self.groups.iter().map(|g| g.records).sum()
    }

    pub fn group_count(&self) -> usize {
        self.groups.iter().map(|g| g.groups).sum()
    }
}

impl std::fmt::Display for PluginStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== 插件统计信息 ===")?;
        writeln!(f, "名称: {}", self.name)?;
        writeln!(f, "主文件: {}", if self.is_master { "是" } else { "否" })?;
        writeln!(f, "依赖主文件数: {}", self.master_count)?;
        writeln!(f, "组数量: {}", self.group_count())?;
        writeln!(f, "记录数量: {}", self.record_count())?;
        for group in &self.groups {
            writeln!(
                f,
                "  {}: {} 条记录, {} 个组, {} bytes{}",
                sig_str(&group.label),
                group.records,
                group.groups,
                group.size,
                if group.parsed { "" } else { " (未解析)" }
            )?;
        }
        Ok(())
    }
}

impl Plugin {
    /// 获取统计信息（未解析的组只扫描头部）
    pub fn get_stats(&self) -> Result<PluginStats> {
        let mut groups = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let records = group.get_num_records(false)?;
            let total = group.get_num_records(true)?;
            groups.push(GroupStats {
                label: group.label(),
                records,
                groups: total - records,
                size: group.get_size(),
                parsed: group.is_changed(),
            });
        }
        Ok(PluginStats {
            name: self.name.clone(),
            is_master: self.is_master(),
            master_count: self.masters().len(),
            groups,
        })
    }
}
