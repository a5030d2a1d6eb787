use crate::EditCommands;
use crate::context::Context;
use colored::Colorize;

pub async fn handle(ctx: &Context, cmd: EditCommands) -> anyhow::Result<()> {
    let lifecycle = ctx.lifecycle();
    match cmd {
        EditCommands::Cluster {
            name,
            abort_upgrade: true,
            ..
        } => {
            let cluster = lifecycle.abort_upgrade(&name).await?;
            println!(
                "{} クラスター {} を {} に戻しました",
                "✓".green(),
                cluster.name().cyan(),
                cluster.phase().as_str()
            );
            println!("  アップグレードを再試行するには: {} {}", "forge apply".cyan(), cluster.name());
        }
        EditCommands::Cluster {
            name,
            kubernetes_version: Some(kubernetes_version),
            ..
        } => {
            let cluster = lifecycle
                .edit_cluster_version(&name, &kubernetes_version)
                .await?;
            println!(
                "{} クラスター {} の Kubernetes バージョンを {} に変更しました",
                "✓".green(),
                cluster.name().cyan(),
                cluster.config.kubernetes_version.yellow()
            );
        }
        EditCommands::Cluster { .. } => {
            anyhow::bail!("--kubernetes-version か --abort-upgrade を指定してください");
        }
        EditCommands::NodeGroup {
            name,
            cluster,
            nodes,
        } => {
            let cluster = ctx.cluster_name(cluster)?;
            let group = lifecycle.scale_node_group(&cluster, &name, nodes).await?;
            println!(
                "{} ノードグループ {} のノード数を {} に変更しました",
                "✓".green(),
                group.name().cyan(),
                group.spec.nodes
            );
        }
    }
    Ok(())
}
