use anyhow::{Context, Result};
use baidu_pcs_upload::{
    config::{LogConfig, DEFAULT_CONFIG_PATH},
    logging, AppConfig, BaiduFs,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 百度网盘 PCS 分片上传工具
#[derive(Parser, Debug)]
#[command(name = "baidu-pcs-upload")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 网盘根目录，所有远端路径都相对于该目录
    #[arg(short, long, default_value = "/")]
    root: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 上传本地文件
    Upload {
        /// 本地文件路径
        local: PathBuf,
        /// 网盘目标路径（相对根目录）
        remote: String,
    },
    /// 删除网盘文件或目录
    Remove {
        /// 网盘路径（相对根目录）
        remote: String,
    },
}

/// 加载日志配置
///
/// 只读取配置文件中的 [log] 段，失败时返回默认配置
async fn load_log_config(path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

/// Ctrl-C 时取消正在进行的上传
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消...");
            token.cancel();
        }
    });
    cancel
}

async fn upload(fs: &BaiduFs, local: PathBuf, remote: &str) -> Result<()> {
    let mut file = tokio::fs::File::open(&local)
        .await
        .with_context(|| format!("无法打开文件: {:?}", local))?;
    let metadata = file
        .metadata()
        .await
        .with_context(|| format!("读取文件信息失败: {:?}", local))?;
    let mod_time: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());

    let cancel = cancel_on_ctrl_c();
    let object = fs
        .put(remote, &mut file, metadata.len(), mod_time, &cancel)
        .await
        .with_context(|| format!("上传失败: {:?} -> {}", local, remote))?;

    info!(
        "✓ 上传完成: {} ({} bytes, {} 个分片)",
        object.absolute_path, object.size, object.job.chunk_count
    );
    println!("{}", serde_json::to_string_pretty(&object)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 先加载日志配置，必须保持 _log_guard 存活
    let log_config = load_log_config(&args.config).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("Baidu PCS Upload v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_from_file(&args.config).await?;
    if config.pcs.bduss.is_empty() {
        anyhow::bail!("配置文件中未设置 pcs.bduss: {}", args.config);
    }

    let fs = BaiduFs::from_config(&args.root, &config)?;

    match args.command {
        Command::Upload { local, remote } => upload(&fs, local, &remote).await?,
        Command::Remove { remote } => {
            fs.remove(&remote)
                .await
                .with_context(|| format!("删除失败: {}", remote))?;
            info!("✓ 已删除: {}", fs.absolute_path(&remote));
        }
    }

    Ok(())
}
