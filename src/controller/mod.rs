//! Controller process wiring.
//!
//! Assembles stores, bus, routing, sagas, the worker-pool dispatcher and the
//! deadline scheduler into one running controller.
//!
//! ```ignore
//! let controller = Controller::builder(config)
//!     .with_stores(Stores::memory())
//!     .with_bus(Arc::new(ChannelMessageBus::new()))
//!     .register_saga(UpdateCatletSaga)
//!     .build()
//!     .await?;
//!
//! let operation = controller.operations().start_new(&command, None, None).await?;
//! ```

mod handler;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::bus::{BusError, Dispatcher, MessageBus, MessageSender, Subscription};
use crate::config::Config;
use crate::dlq::{DeadLetterPublisher, NoopDeadLetterPublisher};
use crate::operations::OperationManager;
use crate::routing::{default_routing_table, Role, RoutingError, RoutingTable};
use crate::saga::{DeadlineScheduler, Saga, SagaHandler, SagaRegistry, SagaRuntime, SagaSettings};
use crate::storage::Stores;
use crate::tasks::TaskTracker;

pub use handler::ControllerHandler;

/// Errors assembling a controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Controller has no message bus")]
    MissingBus,
}

/// Shared collaborators handed to each saga runtime.
struct SagaDeps {
    stores: Stores,
    sender: MessageSender,
    settings: SagaSettings,
}

type SagaFactory = Box<dyn FnOnce(&SagaDeps) -> Arc<dyn SagaHandler> + Send>;

/// Builder for a `Controller`.
pub struct ControllerBuilder {
    config: Config,
    stores: Option<Stores>,
    bus: Option<Arc<dyn MessageBus>>,
    routes: Option<RoutingTable>,
    dlq: Option<Arc<dyn DeadLetterPublisher>>,
    sagas: Vec<SagaFactory>,
}

impl ControllerBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            stores: None,
            bus: None,
            routes: None,
            dlq: None,
            sagas: Vec::new(),
        }
    }

    /// Defaults to in-memory stores.
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Defaults to `default_routing_table()`.
    pub fn with_routes(mut self, routes: RoutingTable) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Defaults to a publisher that only logs.
    pub fn with_dlq(mut self, dlq: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn register_saga<S: Saga>(mut self, saga: S) -> Self {
        self.sagas.push(Box::new(move |deps: &SagaDeps| {
            Arc::new(SagaRuntime::new(
                saga,
                deps.stores.operations.clone(),
                deps.stores.sagas.clone(),
                deps.stores.locks.clone(),
                deps.sender.clone(),
                deps.settings.clone(),
            )) as Arc<dyn SagaHandler>
        }));
        self
    }

    /// Validate routing, subscribe to the bus and start the deadline scheduler.
    ///
    /// Fails fast if a registered saga's starting command is not routed to
    /// the controller or one of its task commands is not routed at all.
    pub async fn build(self) -> Result<Controller, ControllerError> {
        let bus = self.bus.ok_or(ControllerError::MissingBus)?;
        let stores = self.stores.unwrap_or_else(Stores::memory);
        let routes = match self.routes {
            Some(routes) => routes,
            None => default_routing_table()?,
        };
        let dlq: Arc<dyn DeadLetterPublisher> = match self.dlq {
            Some(dlq) => dlq,
            None => Arc::new(NoopDeadLetterPublisher),
        };
        let controller_config = &self.config.controller;

        let sender = MessageSender::new(bus.clone(), Arc::new(routes));
        let deps = SagaDeps {
            stores: stores.clone(),
            sender: sender.clone(),
            settings: SagaSettings {
                controller_name: controller_config.name.clone(),
                task_deadline: controller_config.task_deadline(),
                lock_timeout: controller_config.lock_timeout(),
            },
        };

        let mut registry = SagaRegistry::new();
        for factory in self.sagas {
            let saga = factory(&deps);
            validate_routes(sender.routes(), saga.as_ref())?;
            info!(
                saga_type = saga.saga_type(),
                command_type = saga.command_type(),
                "Saga registered"
            );
            registry = registry.register(saga);
        }

        let handler = ControllerHandler::new(
            TaskTracker::new(stores.operations.clone()),
            stores.sagas.clone(),
            registry,
        );
        let dispatcher = Dispatcher::new(
            controller_config.name.clone(),
            Arc::new(handler),
            controller_config.max_concurrent_handlers,
            self.config.retry.clone(),
            dlq,
        );
        bus.subscribe(Subscription::role(Role::Controller), Arc::new(dispatcher))
            .await?;

        let scheduler = DeadlineScheduler::new(
            stores.sagas.clone(),
            sender.clone(),
            controller_config.deadline_check_interval(),
        )
        .spawn();

        info!(name = %controller_config.name, "Controller started");

        Ok(Controller {
            name: controller_config.name.clone(),
            operations: OperationManager::new(stores.operations.clone(), sender.clone()),
            sender,
            stores,
            scheduler,
        })
    }
}

fn validate_routes(routes: &RoutingTable, saga: &dyn SagaHandler) -> Result<(), RoutingError> {
    let recipient = routes
        .recipient(saga.command_type())
        .map_err(|_| RoutingError::MissingRoute(saga.command_type().to_string()))?;
    if recipient != Role::Controller {
        return Err(RoutingError::WrongKind {
            message_type: saga.command_type().to_string(),
            expected: "a controller command",
            actual: "routed elsewhere",
        });
    }
    for message_type in saga.dispatched_types() {
        routes
            .recipient(message_type)
            .map_err(|_| RoutingError::MissingRoute((*message_type).to_string()))?;
    }
    Ok(())
}

/// A running controller.
pub struct Controller {
    name: String,
    operations: OperationManager,
    sender: MessageSender,
    stores: Stores,
    scheduler: JoinHandle<()>,
}

impl Controller {
    pub fn builder(config: Config) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry point for starting operations and reading them back.
    pub fn operations(&self) -> &OperationManager {
        &self.operations
    }

    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Stop background work. In-flight handlers finish on their own.
    pub fn shutdown(self) {
        self.scheduler.abort();
        info!(name = %self.name, "Controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, MockMessageBus};
    use crate::catlets::{PrepareGeneCommand, UpdateCatletCommand};
    use crate::saga::UpdateCatletSaga;

    #[tokio::test]
    async fn test_build_requires_bus() {
        let result = Controller::builder(Config::for_test()).build().await;
        assert!(matches!(result, Err(ControllerError::MissingBus)));
    }

    #[cfg(feature = "channel")]
    #[tokio::test]
    async fn test_unrouted_saga_command_fails_fast() {
        let routes = RoutingTable::builder()
            .command::<PrepareGeneCommand>(Role::VmHostAgent)
            .build()
            .unwrap();
        let bus: Arc<dyn MessageBus> = Arc::new(crate::bus::ChannelMessageBus::new());

        let result = Controller::builder(Config::for_test())
            .with_bus(bus)
            .with_routes(routes)
            .register_saga(UpdateCatletSaga)
            .build()
            .await;

        assert!(matches!(
            result,
            Err(ControllerError::Routing(RoutingError::MissingRoute(t)))
                if t == UpdateCatletCommand::MESSAGE_TYPE
        ));
    }

    #[cfg(feature = "channel")]
    #[tokio::test]
    async fn test_unrouted_task_command_fails_fast() {
        let routes = RoutingTable::builder()
            .command::<UpdateCatletCommand>(Role::Controller)
            .command::<PrepareGeneCommand>(Role::VmHostAgent)
            .build()
            .unwrap();
        let bus: Arc<dyn MessageBus> = Arc::new(crate::bus::ChannelMessageBus::new());

        let result = Controller::builder(Config::for_test())
            .with_bus(bus)
            .with_routes(routes)
            .register_saga(UpdateCatletSaga)
            .build()
            .await;

        assert!(matches!(
            result,
            Err(ControllerError::Routing(RoutingError::MissingRoute(_)))
        ));
    }

    #[tokio::test]
    async fn test_mock_bus_cannot_host_controller() {
        let result = Controller::builder(Config::for_test())
            .with_bus(Arc::new(MockMessageBus::new()))
            .build()
            .await;
        assert!(matches!(
            result,
            Err(ControllerError::Bus(BusError::SubscribeNotSupported))
        ));
    }
}
