use crate::GetCommands;
use crate::context::Context;
use colored::Colorize;
use fleetforge_core::{Cluster, ClusterPhase};

fn colored_phase(phase: ClusterPhase) -> colored::ColoredString {
    let label = format!("{:<10}", phase.as_str());
    match phase {
        ClusterPhase::Ready => label.green(),
        ClusterPhase::Pending | ClusterPhase::Upgrading => label.yellow(),
        ClusterPhase::Deleting | ClusterPhase::Deleted => label.red(),
        ClusterPhase::Unknown => label.dimmed(),
    }
}

fn endpoint(cluster: &Cluster) -> String {
    cluster.api_server_url().unwrap_or_else(|| "-".to_string())
}

pub async fn handle(ctx: &Context, cmd: GetCommands) -> anyhow::Result<()> {
    let lifecycle = ctx.lifecycle();
    match cmd {
        GetCommands::Cluster { name: None } => {
            let clusters = lifecycle.list_clusters().await?;
            if clusters.is_empty() {
                println!("{}", "クラスターはありません".dimmed());
                return Ok(());
            }
            println!(
                "{}",
                format!(
                    "{:<20} {:<10} {:<10} {:<10} {:<8} {}",
                    "NAME", "PHASE", "VERSION", "PROVIDER", "ZONE", "ENDPOINT"
                )
                .bold()
            );
            println!("{}", "─".repeat(90).dimmed());
            for cluster in &clusters {
                let current = ctx.config.current_cluster.as_deref() == Some(cluster.name());
                let name = format!("{:<20}", cluster.name());
                println!(
                    "{} {} {:<10} {:<10} {:<8} {}",
                    if current { name.cyan() } else { name.normal() },
                    colored_phase(cluster.phase()),
                    cluster.config.kubernetes_version,
                    cluster.config.cloud.cloud_provider,
                    cluster.config.cloud.zone,
                    endpoint(cluster)
                );
            }
        }
        GetCommands::Cluster { name: Some(name) } => {
            let cluster = lifecycle.get_cluster(&name).await?;
            println!("{}: {}", "Name".bold(), cluster.name().cyan());
            println!("{}: {}", "Phase".bold(), colored_phase(cluster.phase()));
            if !cluster.status.reason.is_empty() {
                println!("{}: {}", "Reason".bold(), cluster.status.reason.red());
            }
            println!("{}: {}", "Version".bold(), cluster.config.kubernetes_version);
            println!(
                "{}: {} ({})",
                "Provider".bold(),
                cluster.config.cloud.cloud_provider,
                cluster.config.cloud.zone
            );
            println!("{}: {}", "Masters".bold(), cluster.config.master_count);
            println!("{}: {}", "Endpoint".bold(), endpoint(&cluster));
            if !cluster.status.cluster_uid.is_empty() {
                println!("{}: {}", "UID".bold(), cluster.status.cluster_uid);
            }

            let groups = lifecycle.list_node_groups(&name).await?;
            println!();
            if groups.is_empty() {
                println!("{}", "ノードグループはありません".dimmed());
                return Ok(());
            }
            println!(
                "{}",
                format!("{:<24} {:<14} {:<8} {:<8}", "NODEGROUP", "SKU", "DESIRED", "CURRENT")
                    .bold()
            );
            for group in groups {
                let line = format!(
                    "{:<24} {:<14} {:<8} {:<8}",
                    group.name(),
                    group.spec.template.sku,
                    group.spec.nodes,
                    group.status.nodes
                );
                if group.metadata.is_deleting() {
                    println!("{} {}", line, "(deleting)".red());
                } else {
                    println!("{line}");
                }
            }
        }
    }
    Ok(())
}
