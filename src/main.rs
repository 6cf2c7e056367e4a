// SPDX-License-Identifier: GPL-3.0-only
use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{SignalKind, signal};

use adaptive_monitor_control::config::Config;
use adaptive_monitor_control::controller::Collaborators;
use adaptive_monitor_control::store::{JsonFileStore, KeyValueStore};
use adaptive_monitor_control::{DisplayController, hotplug, migrations};

#[macro_use]
extern crate tracing;

fn setup_logs() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = fmt::layer().with_target(false);
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(format!(
        "warn,{}=info",
        env!("CARGO_CRATE_NAME")
    )));

    if let Ok(journal_layer) = tracing_journald::layer() {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(journal_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("waiting for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logs();

    let config_path = Config::default_path()?;
    let mut config = Config::load(&config_path);

    let store: Arc<dyn KeyValueStore> = Arc::new(
        JsonFileStore::open(JsonFileStore::default_path()?).context("opening display store")?,
    );
    let report = migrations::run(&mut config, &*store);
    if report.config_upgraded {
        if let Err(e) = config.save(&config_path) {
            error!("Failed to save migrated config: {}", e);
        }
    }

    let collaborators = Collaborators::system(&config, store);
    let controller = DisplayController::new(config, collaborators);

    // Enumeration talks DDC/CI and blocks for a while
    let initial = controller.clone();
    tokio::task::spawn_blocking(move || initial.reset_display_list())
        .await
        .context("initial display enumeration")?;
    info!(displays = controller.registry().active_count(), "Displays ready");

    controller.start_watchers();
    let hotplug_controller = controller.clone();
    let hotplug_task = hotplug::spawn(move || hotplug_controller.request_reset());

    shutdown_signal().await?;
    info!("Shutting down");

    if let Some(task) = hotplug_task {
        task.abort();
    }
    let closing = controller.clone();
    tokio::task::spawn_blocking(move || closing.cleanup())
        .await
        .context("controller cleanup")?;

    if let Err(e) = controller.config().save(&config_path) {
        error!("Failed to save config: {}", e);
    }
    Ok(())
}
