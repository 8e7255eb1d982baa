use anyhow::Result;
use std::env;
use std::path::PathBuf;
use tracing::{error, info};

use meter_harvest::{
    bootstrap, platform_driver, AppConfig, FtpSource, MeterStore, Pipeline, SmtpNotifier,
    VpnGateway,
};

/// Configuration file expected inside the base directory.
const CONFIG_FILE: &str = "meter-harvest.toml";
/// Template with the folder structure, starter config and empty database.
const INIT_DIR: &str = "init";
/// Default base directory name, next to the project directory.
const BASE_DIR: &str = "mnt";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("*** meter-harvest v{} starting ***", meter_harvest::VERSION);

    let base_dir = resolve_base_dir()?;
    info!(base = %base_dir.display(), "working area");

    // First run: lay out folders, starter config and empty database.
    let init_dir = env::current_dir()?.join(INIT_DIR);
    bootstrap::seed(&init_dir, &base_dir)?;

    let cfg = AppConfig::load(&base_dir.join(CONFIG_FILE))?;

    let store = MeterStore::open(&cfg.database_path(&base_dir))?;
    let gateway = VpnGateway::new(platform_driver(&cfg.vpn)?);
    let source = FtpSource::new(&cfg.ftp);
    let notifier = SmtpNotifier::new(&cfg.mail, &cfg.smtp);

    let mut pipeline = Pipeline::new(
        cfg.download_dir(&base_dir),
        cfg.backup_dir(&base_dir),
        cfg.summary_path(&base_dir),
        store,
        Box::new(gateway),
        Box::new(source),
        Box::new(notifier),
    );

    match pipeline.run() {
        Ok(report) => {
            info!(
                downloaded = report.downloaded,
                inserted = report.inserted,
                "*** run finished ***"
            );
            Ok(())
        }
        Err(e) => {
            error!("*** run failed: {e} ***");
            Err(e.into())
        }
    }
}

/// The base directory holds all data, logs and configuration. A mounted
/// volume can override it (container use); the default sits next to the
/// project directory.
fn resolve_base_dir() -> Result<PathBuf> {
    if let Ok(mount) = env::var("MOUNT_POINT") {
        return Ok(PathBuf::from(mount));
    }
    let cwd = env::current_dir()?;
    let parent = cwd.parent().unwrap_or(&cwd);
    Ok(parent.join(BASE_DIR))
}
