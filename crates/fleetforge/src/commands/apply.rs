use crate::context::Context;
use anyhow::Context as _;
use colored::Colorize;
use fleetforge_cloud::{Action, ActionType, ApplyOptions, PlanSummary};

pub async fn handle(ctx: &Context, cluster: Option<String>, dry_run: bool) -> anyhow::Result<()> {
    let name = ctx.cluster_name(cluster)?;

    if dry_run {
        println!("{}", format!("クラスター {name} の変更を確認中 (dry-run)...").blue());
    } else {
        println!("{}", format!("クラスター {name} を適用中...").blue());
    }

    let lock = ctx.lock(&name).await?;
    let result = ctx
        .applier()
        .apply(&ApplyOptions::new(name.clone()).dry_run(dry_run))
        .await;
    if let Some(lock) = lock {
        if let Err(e) = lock.release().await {
            tracing::warn!(cluster = %name, "failed to release lock: {e}");
        }
    }
    let actions = result.with_context(|| format!("クラスター {name} の適用に失敗しました"))?;

    println!();
    print_actions(&actions);

    let summary = PlanSummary::of(&actions);
    println!();
    if !summary.has_changes() {
        println!("{}", "✓ 変更はありません".green());
    } else if dry_run {
        println!("{} {}", "Plan:".bold(), summary);
    } else {
        println!("{} {}", "✓ 適用しました:".green(), summary);
    }
    Ok(())
}

/// One line per action: type, resource, message
pub fn print_actions(actions: &[Action]) {
    if actions.is_empty() {
        println!("{}", "実行する操作はありません".dimmed());
        return;
    }
    for action in actions {
        let kind = format!("{:<6}", action.action);
        let kind = match action.action {
            ActionType::Add => kind.green(),
            ActionType::Update => kind.yellow(),
            ActionType::Delete => kind.red(),
            ActionType::Nop => kind.dimmed(),
        };
        println!(
            "{} {} {}",
            kind,
            format!("{:<20}", action.resource).bold(),
            action.message
        );
    }
}
