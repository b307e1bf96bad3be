use anyhow::{bail, Context, Result};
use clap::Parser;
use esp_groups::{
    GameProfile, LoadFactory, LoadSet, MasterName, PatchBuilder, Plugin, SUPPORTED_EXTENSIONS,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "esp_groups")]
#[command(about = "读取、重建并合并 ESP/ESM 插件的组结构")]
#[command(version = "0.1.0")]
struct Cli {
    /// 输入ESP/ESM/ESL文件路径
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// 输出文件路径
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 显示插件统计信息
    #[arg(long)]
    stats: bool,

    /// 测试模式：解析文件后直接重建，并逐字节对比
    #[arg(long)]
    test_rebuild: bool,

    /// 加载时立即解析所有组
    #[arg(long)]
    eager: bool,

    /// 合并模式：按顺序合并这些插件，生成补丁
    #[arg(long, num_args = 1..)]
    merge: Vec<PathBuf>,

    /// 合并时过滤引用了未加载插件的记录
    #[arg(long)]
    filter: bool,

    /// 只过滤、不合并的插件（文件名）
    #[arg(long, num_args = 1..)]
    iim: Vec<String>,

    /// 游戏配置
    #[arg(long, default_value = "falloutnv")]
    game: String,

    /// 静默模式(仅输出错误)
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    let game = GameProfile::load(&cli.game)?;
    let factory = Arc::new(LoadFactory::new(game));

    if !cli.merge.is_empty() {
        return handle_merge(&cli, factory);
    }

    let input = match &cli.input {
        Some(input) => input,
        None => bail!("需要 --input 或 --merge"),
    };
    validate_input(input)?;

    if cli.test_rebuild {
        return handle_test_rebuild(&cli, input, factory);
    }

    handle_stats(&cli, input, factory)
}

/// 初始化日志：RUST_LOG 优先，否则按 --quiet 选择级别
fn init_logging(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// 验证输入文件
fn validate_input(input: &Path) -> Result<()> {
    if !input.exists() {
        bail!("输入文件不存在: {:?}", input);
    }

    let extension = input
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());

    if !SUPPORTED_EXTENSIONS.iter().any(|&ext| Some(ext) == extension.as_deref()) {
        bail!("输入文件必须是ESP、ESM或ESL文件");
    }

    Ok(())
}

fn handle_stats(cli: &Cli, input: &Path, factory: Arc<LoadFactory>) -> Result<()> {
    tracing::info!("正在解析插件: {:?}", input);
    let plugin = Plugin::load(input, factory, cli.eager)
        .with_context(|| format!("无法加载 {:?}", input))?;
    println!("{}", plugin.get_stats()?);
    Ok(())
}

/// 测试文件重建功能
fn handle_test_rebuild(cli: &Cli, input: &Path, factory: Arc<LoadFactory>) -> Result<()> {
    let output_path = get_rebuild_output_path(cli, input);
    tracing::info!("测试模式：解析并重建文件 {:?}", input);

    let plugin = Plugin::load(input, factory, cli.eager)
        .with_context(|| format!("无法加载 {:?}", input))?;
    if cli.stats {
        println!("{}", plugin.get_stats()?);
    }
    plugin.save(&output_path)?;

    compare_files(input, &output_path)
}

/// 逐字节对比原文件与重建文件
fn compare_files(input_path: &Path, output_path: &Path) -> Result<()> {
    let original = std::fs::read(input_path)?;
    let rebuilt = std::fs::read(output_path)?;

    println!("文件大小对比:");
    println!("  原文件: {} 字节", original.len());
    println!("  重建文件: {} 字节", rebuilt.len());

    match original.iter().zip(rebuilt.iter()).position(|(a, b)| a != b) {
        None if original.len() == rebuilt.len() => {
            println!("✓ 重建文件与原文件一致");
            Ok(())
        }
        None => bail!("重建文件长度不一致"),
        Some(offset) => bail!("重建文件在偏移 0x{:X} 处不一致", offset),
    }
}

fn handle_merge(cli: &Cli, factory: Arc<LoadFactory>) -> Result<()> {
    let output_path = get_merge_output_path(cli);
    let patch_name = file_name(&output_path);

    let mut plugins = Vec::with_capacity(cli.merge.len());
    for path in &cli.merge {
        validate_input(path)?;
        let plugin = Plugin::load(path, Arc::clone(&factory), cli.eager)
            .with_context(|| format!("无法加载 {:?}", path))?;
        plugins.push(plugin);
    }

    // 合并列表中的插件及其主文件视为已加载
    let mut load_set = LoadSet::new();
    for plugin in &plugins {
        load_set.insert(MasterName::new(plugin.name.as_str()));
        load_set.extend(plugin.masters().iter().cloned());
    }
    let iim: Vec<MasterName> = cli.iim.iter().map(|name| MasterName::new(name.as_str())).collect();

    let mut builder = PatchBuilder::new(&patch_name, Arc::clone(&factory), load_set).filter(cli.filter);
    for plugin in plugins.iter_mut() {
        let skip_merge = iim.contains(&MasterName::new(plugin.name.as_str()));
        tracing::info!("合并 {}{}", plugin.name, if skip_merge { " (IIM)" } else { "" });
        builder
            .merge_plugin(plugin, skip_merge)
            .with_context(|| format!("合并 {} 失败", plugin.name))?;
    }

    let patch = builder.build()?;
    patch.save(&output_path)?;
    println!("补丁已写入: {:?}", output_path);
    if cli.stats {
        println!("{}", patch.get_stats()?);
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Patch.esp".to_string())
}

fn get_rebuild_output_path(cli: &Cli, input: &Path) -> PathBuf {
    if let Some(output) = &cli.output {
        return output.clone();
    }
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let ext = input.extension().and_then(|s| s.to_str()).unwrap_or("esp");
    input.with_file_name(format!("{}_rebuilt.{}", stem, ext))
}

fn get_merge_output_path(cli: &Cli) -> PathBuf {
    if let Some(output) = &cli.output {
        return output.clone();
    }
    match cli.merge.first().and_then(|path| path.parent()) {
        Some(dir) => dir.join("Patch.esp"),
        None => PathBuf::from("Patch.esp"),
    }
}
