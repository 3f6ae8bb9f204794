//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use poisonlab_core::regime::above_display_threshold;
use poisonlab_core::{DatasetError, PoisonConfig, PoisonError, PoisonLab, ScriptedOracle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Upload {
            session,
            files,
            dry_oracle,
        } => handle_upload(&session, &files, dry_oracle, workspace).await,
        Commands::Reset { session } => handle_reset(&session, workspace).await,
        Commands::Show { session } => handle_show(&session, workspace).await,
        Commands::Ask { session, question } => handle_ask(&session, &question, workspace).await,
        Commands::Submit { session, flag } => handle_submit(&session, &flag, workspace),
        Commands::Config { action } => handle_config(action, workspace),
    }
}

/// Load configuration with relative storage paths anchored at the workspace.
fn workspace_config(workspace: &Path) -> anyhow::Result<PoisonConfig> {
    let mut config = poisonlab_core::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config.storage.datasets_dir = anchor(workspace, &config.storage.datasets_dir);
    config.flag.submission_log = anchor(workspace, &config.flag.submission_log);
    debug!(
        datasets_dir = %config.storage.datasets_dir.display(),
        submission_log = %config.flag.submission_log.display(),
        "Resolved storage paths"
    );
    Ok(config)
}

fn anchor(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        workspace.join(path)
    } else {
        path.to_path_buf()
    }
}

/// A lab that never calls the network; every new row scores `reply`.
fn offline_lab(config: PoisonConfig, reply: String) -> anyhow::Result<PoisonLab> {
    Ok(PoisonLab::new(
        config,
        Arc::new(ScriptedOracle::constant(reply)),
    )?)
}

async fn handle_upload(
    session: &str,
    files: &[PathBuf],
    dry_oracle: Option<f64>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let config = workspace_config(workspace)?;
    let lab = match dry_oracle {
        Some(score) => offline_lab(config, score.to_string())?,
        None => PoisonLab::from_config(config)?,
    };
    let path = lab.ensure_baseline(session)?;

    for file in files {
        let bytes = std::fs::read(file)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match lab.process_upload(session, &bytes, &name, &path).await {
            Ok(outcome) => {
                println!(
                    "{name}: {} rows received, {} appended, penalty {:.2}, integrity {:.2}{}",
                    outcome.rows_received,
                    outcome.rows_appended,
                    outcome.penalty,
                    outcome.integrity_score,
                    if outcome.flag_injected {
                        " (dataset altered)"
                    } else {
                        ""
                    }
                );
            }
            Err(e) if e.is_client_error() => println!("{name}: rejected: {e}"),
            Err(e) => return Err(e.into()),
        }
    }

    let score = lab.integrity_score(session).await;
    println!(
        "Session {session}: integrity {score:.2} ({})",
        lab.engine().regime(score)
    );
    if !above_display_threshold(score, &lab.config().integrity) {
        println!("Integrity is below the display threshold.");
    }
    Ok(())
}

async fn handle_reset(session: &str, workspace: &Path) -> anyhow::Result<()> {
    let lab = offline_lab(workspace_config(workspace)?, "0.0".to_string())?;
    let path = lab.baseline_path(session)?;
    lab.reset_session(session, &path).await?;
    println!("Session {session} reset to the default dataset.");
    Ok(())
}

async fn handle_show(session: &str, workspace: &Path) -> anyhow::Result<()> {
    let lab = offline_lab(workspace_config(workspace)?, "0.0".to_string())?;
    match show_report(&lab, session).await {
        Ok(report) => {
            print!("{report}");
            Ok(())
        }
        Err(PoisonError::Dataset(DatasetError::NotFound { path })) => {
            println!("No dataset for session {session} at {}", path.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Dataset rows followed by the session's score, regime and row scores.
async fn show_report(lab: &PoisonLab, session: &str) -> poisonlab_core::Result<String> {
    let dataset = lab.dataset(session)?;
    let snapshot = lab.snapshot(session).await;
    let mut scores: Vec<_> = lab.dataset_scores(session).await.into_iter().collect();
    scores.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = dataset.render(" | ");
    out.push_str(&format!("({} rows)\n", dataset.len()));
    out.push_str(&format!(
        "Integrity {:.2} ({}), {} rows scored, flag injected: {}\n",
        snapshot.integrity_score,
        lab.engine().regime(snapshot.integrity_score),
        snapshot.scored_rows,
        snapshot.flag_injected
    ));
    for (fingerprint, score) in scores {
        out.push_str(&format!("  {fingerprint}  {score:.2}\n"));
    }
    Ok(out)
}

async fn handle_ask(session: &str, question: &str, workspace: &Path) -> anyhow::Result<()> {
    let lab = PoisonLab::from_config(workspace_config(workspace)?)?;
    lab.ensure_baseline(session)?;
    let answer = lab.ask(session, question).await?;
    println!("{answer}");
    Ok(())
}

fn handle_submit(session: &str, flag: &str, workspace: &Path) -> anyhow::Result<()> {
    let lab = offline_lab(workspace_config(workspace)?, "0.0".to_string())?;
    if lab.submit_flag(session, flag) {
        println!("Correct! Flag accepted.");
    } else {
        println!("Incorrect flag. Try again.");
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".poisonlab");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&PoisonConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = poisonlab_core::load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
