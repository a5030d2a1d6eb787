use crate::DeleteCommands;
use crate::context::Context;
use colored::Colorize;

pub async fn handle(ctx: &Context, cmd: DeleteCommands) -> anyhow::Result<()> {
    let lifecycle = ctx.lifecycle();
    match cmd {
        DeleteCommands::Cluster { name } => {
            let cluster = lifecycle.delete_cluster(&name).await?;
            println!(
                "{} クラスター {} の削除を予約しました (phase: {})",
                "✓".green(),
                cluster.name().cyan(),
                cluster.phase().as_str()
            );
            println!("  削除するには: {} {}", "forge apply".cyan(), cluster.name());
        }
        DeleteCommands::NodeGroup { name, cluster } => {
            let cluster = ctx.cluster_name(cluster)?;
            let group = lifecycle.delete_node_group(&cluster, &name).await?;
            println!(
                "{} ノードグループ {} の削除を予約しました",
                "✓".green(),
                group.name().cyan()
            );
        }
    }
    Ok(())
}
