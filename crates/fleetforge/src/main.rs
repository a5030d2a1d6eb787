mod commands;
mod context;

use clap::{Parser, Subcommand};
use context::Context;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forge")]
#[command(about = "宣言する。適用する。Kubernetes クラスターは、収束する。", long_about = None)]
struct Cli {
    /// ログを詳細に出力 (-v: info, -vv: debug)。RUST_LOG が優先される
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// クラスターの望ましい状態をクラウドに反映
    Apply {
        /// クラスター名 (省略時は `forge use cluster` で選んだクラスター)
        cluster: Option<String>,
        /// 実行せずに、行われる操作だけを表示
        #[arg(long)]
        dry_run: bool,
    },
    /// リソースを作成 (記録のみ。反映は apply で行う)
    #[command(subcommand)]
    Create(CreateCommands),
    /// リソースの削除を予約 (次の apply で削除される)
    #[command(subcommand)]
    Delete(DeleteCommands),
    /// リソースを表示
    #[command(subcommand)]
    Get(GetCommands),
    /// リソースを変更
    #[command(subcommand)]
    Edit(EditCommands),
    /// 既定のクラスターを切り替え
    #[command(subcommand)]
    Use(UseCommands),
    /// バージョン情報を表示
    Version,
}

#[derive(Subcommand)]
pub enum CreateCommands {
    /// クラスターを作成
    Cluster {
        /// クラスター名
        name: String,
        /// クラウドプロバイダー
        #[arg(long, default_value = "sakura")]
        provider: String,
        /// ゾーン (省略時はプロバイダーの既定値)
        #[arg(long, default_value = "")]
        zone: String,
        /// Kubernetes バージョン (例: v1.29.3)
        #[arg(long)]
        kubernetes_version: String,
        /// マスター数
        #[arg(long, default_value_t = 1)]
        masters: u32,
        /// 使用するクレデンシャル名
        #[arg(long, default_value = "")]
        credential: String,
    },
    /// ノードグループを作成
    #[command(name = "nodegroup")]
    NodeGroup {
        /// クラスター名 (省略時は既定のクラスター)
        #[arg(long)]
        cluster: Option<String>,
        /// インスタンスサイズ (例: 2core-4gb)
        #[arg(long)]
        sku: String,
        /// ノード数
        #[arg(long, default_value_t = 1)]
        nodes: u32,
        /// ノードグループ名 (省略時は `<sku>-pool`)
        #[arg(long)]
        name: Option<String>,
    },
    /// クラウドのクレデンシャルを登録
    Credential {
        /// クレデンシャル名
        name: String,
        /// クラウドプロバイダー
        #[arg(long, default_value = "sakura")]
        provider: String,
        /// KEY=VALUE (複数指定可)
        #[arg(long = "data", value_parser = commands::create::parse_key_val)]
        data: Vec<(String, String)>,
    },
}

#[derive(Subcommand)]
pub enum DeleteCommands {
    /// クラスターを削除
    Cluster {
        /// クラスター名
        name: String,
    },
    /// ノードグループを削除
    #[command(name = "nodegroup")]
    NodeGroup {
        /// ノードグループ名
        name: String,
        /// クラスター名 (省略時は既定のクラスター)
        #[arg(long)]
        cluster: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum GetCommands {
    /// クラスターを表示 (名前省略時は一覧)
    Cluster {
        /// クラスター名
        name: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum EditCommands {
    /// クラスターの Kubernetes バージョンを変更 (次の apply でアップグレード)
    Cluster {
        /// クラスター名
        name: String,
        /// 新しい Kubernetes バージョン
        #[arg(long, required_unless_present = "abort_upgrade")]
        kubernetes_version: Option<String>,
        /// 失敗したアップグレードで Upgrading のまま止まったクラスターを Ready に戻す
        #[arg(long, conflicts_with = "kubernetes_version")]
        abort_upgrade: bool,
    },
    /// ノードグループのノード数を変更
    #[command(name = "nodegroup")]
    NodeGroup {
        /// ノードグループ名
        name: String,
        /// クラスター名 (省略時は既定のクラスター)
        #[arg(long)]
        cluster: Option<String>,
        /// ノード数
        #[arg(long)]
        nodes: u32,
    },
}

#[derive(Subcommand)]
pub enum UseCommands {
    /// 既定のクラスターを設定
    Cluster {
        /// クラスター名
        name: String,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    // stdout はアクションの出力に使うので、ログは stderr へ
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // kube クライアント (rustls) 用の暗号プロバイダー
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Versionコマンドは設定ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("fleetforge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Useコマンドは設定ファイルのみ
    if let Commands::Use(UseCommands::Cluster { name }) = &cli.command {
        return commands::use_cluster::handle(name).await;
    }

    let ctx = Context::load()?;

    // コマンドディスパッチ
    match cli.command {
        Commands::Apply { cluster, dry_run } => {
            commands::apply::handle(&ctx, cluster, dry_run).await?;
        }
        Commands::Create(cmd) => {
            commands::create::handle(&ctx, cmd).await?;
        }
        Commands::Delete(cmd) => {
            commands::delete::handle(&ctx, cmd).await?;
        }
        Commands::Get(cmd) => {
            commands::get::handle(&ctx, cmd).await?;
        }
        Commands::Edit(cmd) => {
            commands::edit::handle(&ctx, cmd).await?;
        }
        Commands::Use(_) => {
            unreachable!("Use is handled before store loading");
        }
        Commands::Version => {
            unreachable!("Version is handled before config loading");
        }
    }

    Ok(())
}
