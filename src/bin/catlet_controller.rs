//! catlet-controller: standalone orchestrator process
//!
//! Runs the controller (task tracker, sagas, deadline scheduler) on the
//! in-process channel bus. Agents hosted in the same process subscribe to
//! the same bus.
//!
//! ## Configuration
//! ```yaml
//! controller:
//!   name: controller-1
//!   max_concurrent_handlers: 16
//!   task_deadline_secs: 600
//!   lock_timeout_secs: 30
//! storage:
//!   type: sqlite
//!   path: ./data/catlet.db
//! retry:
//!   max_retries: 10
//! ```

use std::sync::Arc;

use tracing::{error, info, warn};

use catlet_orchestrator::bus::ChannelMessageBus;
use catlet_orchestrator::config::Config;
use catlet_orchestrator::controller::Controller;
use catlet_orchestrator::dlq::ChannelDeadLetterPublisher;
use catlet_orchestrator::saga::UpdateCatletSaga;
use catlet_orchestrator::storage::init_storage;
use catlet_orchestrator::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    let stores = init_storage(&config.storage, &config.lock).await?;

    let (dlq, mut dead_letters) = ChannelDeadLetterPublisher::new();
    tokio::spawn(async move {
        while let Some(letter) = dead_letters.recv().await {
            warn!(
                topic = %letter.topic(),
                message_type = %letter.envelope.message_type,
                envelope_id = %letter.envelope.id,
                error_class = %letter.error_class,
                attempts = letter.attempts,
                reason = %letter.reason,
                "Dead letter"
            );
        }
    });

    let controller = Controller::builder(config)
        .with_stores(stores)
        .with_bus(Arc::new(ChannelMessageBus::new()))
        .with_dlq(Arc::new(dlq))
        .register_saga(UpdateCatletSaga)
        .build()
        .await?;

    info!(name = %controller.name(), "catlet-controller running");
    shutdown_signal().await;
    controller.shutdown();

    Ok(())
}
