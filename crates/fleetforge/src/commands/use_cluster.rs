use anyhow::Context as _;
use colored::Colorize;
use fleetforge_config::ForgeConfig;

pub async fn handle(name: &str) -> anyhow::Result<()> {
    let mut config = ForgeConfig::load().context("設定の読み込みに失敗しました")?;
    config.use_cluster(name);
    let path = config.save().context("設定の保存に失敗しました")?;
    println!(
        "{} 既定のクラスターを {} に設定しました ({})",
        "✓".green(),
        name.cyan(),
        path.display().to_string().dimmed()
    );
    Ok(())
}
