//! Binary entry point: run one full backup against a directory-backed agent

use anyhow::{Context, Result};
use backhaul::backup::FullBackupStrategy;
use backhaul::cli::Args;
use backhaul::client::dir::DirAgent;
use backhaul::dao::SqliteBackupDao;
use backhaul::{FullFileBackup, ServerContext, ServerStatus};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_filter())),
        )
        .init();

    let settings = Arc::new(args.resolve_settings()?);
    tokio::fs::create_dir_all(&settings.backupfolder)
        .await
        .with_context(|| {
            format!(
                "creating backup folder {}",
                settings.backupfolder.display()
            )
        })?;

    let db_path = settings.backupfolder.join("backhaul.db");
    let dao = Arc::new(
        SqliteBackupDao::connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .await
            .with_context(|| format!("opening backup index {}", db_path.display()))?,
    );

    let status = Arc::new(ServerStatus::new());
    {
        // Ctrl-C maps to the operator stop flag, so the run drains cleanly
        let status = status.clone();
        let client_name = args.backup.client_name.clone();
        let status_id = args.backup.status_id;
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("stop requested, finishing in-flight transfers");
                status.request_stop(&client_name, status_id);
            }
        });
    }

    let agent = Arc::new(DirAgent::new(args.paths.agent_dir.clone()));
    let backup = FullFileBackup::new(
        ServerContext::new(
            args.backup.server_identity.clone(),
            args.backup.server_token.clone(),
        ),
        settings,
        dao,
        status,
        agent,
        Arc::new(FullBackupStrategy),
        args.backup.client_id,
        args.backup.client_name.clone(),
        args.backup.status_id,
        args.backup.group,
    );

    let report = backup.run().await;
    if report.success() {
        info!(
            "Backup finished: {} transferred, {} linked",
            report.transferred_bytes, report.linked_bytes
        );
        Ok(())
    } else {
        error!("Backup failed: {}", report.outcome);
        std::process::exit(1);
    }
}
