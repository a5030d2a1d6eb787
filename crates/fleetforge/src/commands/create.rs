use crate::CreateCommands;
use crate::context::Context;
use colored::Colorize;
use fleetforge_cloud::{NewCluster, NewNodeGroup};
use fleetforge_core::Credential;

/// `KEY=VALUE` を分解
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("KEY=VALUE 形式で指定してください: {s}")),
    }
}

pub async fn handle(ctx: &Context, cmd: CreateCommands) -> anyhow::Result<()> {
    let lifecycle = ctx.lifecycle();
    match cmd {
        CreateCommands::Cluster {
            name,
            provider,
            zone,
            kubernetes_version,
            masters,
            credential,
        } => {
            let cluster = lifecycle
                .create_cluster(NewCluster {
                    name,
                    provider,
                    zone,
                    kubernetes_version,
                    master_count: masters,
                    credential_name: credential,
                })
                .await?;
            println!(
                "{} クラスター {} を作成しました ({} / {} / {})",
                "✓".green(),
                cluster.name().cyan(),
                cluster.config.cloud.cloud_provider,
                cluster.config.cloud.zone,
                cluster.config.kubernetes_version
            );
            println!("  反映するには: {} {}", "forge apply".cyan(), cluster.name());
        }
        CreateCommands::NodeGroup {
            cluster,
            sku,
            nodes,
            name,
        } => {
            let cluster = ctx.cluster_name(cluster)?;
            let group = lifecycle
                .create_node_group(NewNodeGroup {
                    cluster: cluster.clone(),
                    name,
                    sku,
                    nodes,
                })
                .await?;
            println!(
                "{} ノードグループ {} を作成しました ({} × {})",
                "✓".green(),
                group.name().cyan(),
                group.spec.template.sku,
                group.spec.nodes
            );
        }
        CreateCommands::Credential {
            name,
            provider,
            data,
        } => {
            let credential = data
                .into_iter()
                .fold(Credential::new(name, provider), |c, (k, v)| c.with(k, v));
            let credential = lifecycle.create_credential(credential).await?;
            println!(
                "{} クレデンシャル {} を登録しました",
                "✓".green(),
                credential.metadata.name.cyan()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("access-token=abc=def").unwrap(),
            ("access-token".to_string(), "abc=def".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }
}
