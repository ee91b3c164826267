//! Update-catlet saga.
//!
//! Prepares every gene the configuration depends on, then creates or
//! reconfigures the VM, then applies the network plan.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{DispatchTask, Saga, SagaContext, SagaError, SagaMessage, Transition};
use crate::bus::BusMessage;
use crate::catlets::{
    PrepareGeneCommand, PrepareGeneResponse, UpdateCatletCommand, UpdateCatletNetworksCommand,
    UpdateCatletNetworksResponse, UpdateCatletResult, UpdateCatletVmCommand,
    UpdateCatletVmResponse,
};
use crate::genes::collect_gene_dependencies;
use crate::operations::{OperationTask, Resource, ResourceType, TaskId, TaskReference, TaskStatus};
use crate::tasks::{failure_message, PayloadRegistry, TypedPayload};

const VM_TASK: &str = "vm";
const NETWORKS_TASK: &str = "networks";

/// Results of the tasks this saga dispatches.
#[derive(Debug)]
enum TaskOutput {
    GenePrepared(PrepareGeneResponse),
    VmUpdated(UpdateCatletVmResponse),
    NetworksUpdated(UpdateCatletNetworksResponse),
}

fn task_outputs() -> &'static PayloadRegistry<TaskOutput> {
    static OUTPUTS: OnceLock<PayloadRegistry<TaskOutput>> = OnceLock::new();
    OUTPUTS.get_or_init(|| {
        PayloadRegistry::new()
            .register::<PrepareGeneResponse>(TaskOutput::GenePrepared)
            .register::<UpdateCatletVmResponse>(TaskOutput::VmUpdated)
            .register::<UpdateCatletNetworksResponse>(TaskOutput::NetworksUpdated)
    })
}

/// Decoded result of a finished task; `None` if the agent returned none.
fn task_output(task: &OperationTask) -> Result<Option<TaskOutput>, SagaError> {
    let output = task
        .result
        .as_ref()
        .map(|result| task_outputs().decode(result))
        .transpose()?;
    Ok(output)
}

fn unexpected_result(task: &OperationTask, expected: &str) -> SagaError {
    let actual = task
        .result
        .as_ref()
        .map_or("no result", |result| result.type_name.as_str());
    SagaError::UnexpectedResult {
        task_id: task.id,
        reason: format!("expected {}, got {}", expected, actual),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateCatletPhase {
    PreparingGenes,
    UpdatingVm,
    UpdatingNetworks,
    Completed,
    Failed,
}

/// Persisted state of one update-catlet instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCatletState {
    pub command: UpdateCatletCommand,
    pub phase: UpdateCatletPhase,
    /// Prepare-gene tasks not yet finished.
    pub pending_genes: Vec<TaskId>,
    pub vm_id: Option<Uuid>,
    pub disk_ids: Vec<Uuid>,
}

/// Saga behind `UpdateCatletCommand`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateCatletSaga;

impl UpdateCatletSaga {
    fn start(
        &self,
        ctx: &SagaContext,
        command: UpdateCatletCommand,
    ) -> Result<Transition<UpdateCatletState>, SagaError> {
        let mut state = UpdateCatletState {
            command,
            phase: UpdateCatletPhase::PreparingGenes,
            pending_genes: Vec::new(),
            vm_id: None,
            disk_ids: Vec::new(),
        };

        let genes = match collect_gene_dependencies(&state.command.config).into_result() {
            Ok(genes) => genes,
            Err(errors) => {
                let message = errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                state.phase = UpdateCatletPhase::Failed;
                return Ok(Transition::fail(state, message));
            }
        };

        if genes.is_empty() {
            return self.update_vm(state);
        }

        let mut dispatch = Vec::with_capacity(genes.len());
        for gene in genes {
            let key = format!("gene:{}:{}", gene.gene_type, gene.identifier);
            state.pending_genes.push(ctx.child_task_id(&key));
            let command = PrepareGeneCommand {
                agent_name: state.command.agent_name.clone(),
                gene,
            };
            dispatch.push(
                DispatchTask::new(key, &command)?.with_agent(state.command.agent_name.clone()),
            );
        }
        Ok(Transition::continue_with(state, dispatch))
    }

    fn update_vm(
        &self,
        mut state: UpdateCatletState,
    ) -> Result<Transition<UpdateCatletState>, SagaError> {
        let command = UpdateCatletVmCommand {
            agent_name: state.command.agent_name.clone(),
            catlet_id: state.command.catlet_id,
            config: state.command.config.clone(),
        };
        let task = DispatchTask::new(VM_TASK, &command)?
            .with_agent(state.command.agent_name.clone())
            .with_reference(TaskReference::Catlet {
                catlet_id: state.command.catlet_id,
            });
        state.phase = UpdateCatletPhase::UpdatingVm;
        Ok(Transition::continue_with(state, vec![task]))
    }

    fn update_networks(
        &self,
        mut state: UpdateCatletState,
    ) -> Result<Transition<UpdateCatletState>, SagaError> {
        if state.command.config.networks.is_empty() {
            return self.complete(state, Vec::new());
        }
        let command = UpdateCatletNetworksCommand {
            catlet_id: state.command.catlet_id,
            project_id: state.command.project_id,
            networks: state.command.config.networks.clone(),
        };
        let task = DispatchTask::new(NETWORKS_TASK, &command)?.with_reference(
            TaskReference::Project {
                project_id: state.command.project_id,
            },
        );
        state.phase = UpdateCatletPhase::UpdatingNetworks;
        Ok(Transition::continue_with(state, vec![task]))
    }

    fn complete(
        &self,
        mut state: UpdateCatletState,
        network_ids: Vec<Uuid>,
    ) -> Result<Transition<UpdateCatletState>, SagaError> {
        let vm_id = state.vm_id.ok_or_else(|| {
            SagaError::InvalidInput("catlet update completed without a VM".to_string())
        })?;
        let catlet_id = state.command.catlet_id;

        let mut resources = vec![Resource::new(ResourceType::Catlet, catlet_id)];
        resources.extend(
            state
                .disk_ids
                .iter()
                .map(|id| Resource::new(ResourceType::VirtualDisk, *id)),
        );
        resources.extend(
            network_ids
                .into_iter()
                .map(|id| Resource::new(ResourceType::VirtualNetwork, id)),
        );

        let result = TypedPayload::encode(&UpdateCatletResult { catlet_id, vm_id })?;
        state.phase = UpdateCatletPhase::Completed;
        Ok(Transition::complete(state, Some(result), resources))
    }

    fn task_finished(
        &self,
        ctx: &SagaContext,
        mut state: UpdateCatletState,
        task: OperationTask,
    ) -> Result<Transition<UpdateCatletState>, SagaError> {
        if task.status == TaskStatus::Failed {
            let message = format!(
                "{} failed: {}",
                task.command.type_name,
                failure_message(task.result.as_ref())
            );
            state.phase = UpdateCatletPhase::Failed;
            return Ok(Transition::fail(state, message));
        }

        match state.phase {
            UpdateCatletPhase::PreparingGenes if state.pending_genes.contains(&task.id) => {
                match task_output(&task)? {
                    None => {}
                    Some(TaskOutput::GenePrepared(response)) => {
                        debug!(gene = %response.gene.identifier, "Gene prepared");
                    }
                    Some(_) => {
                        return Err(unexpected_result(&task, PrepareGeneResponse::MESSAGE_TYPE))
                    }
                }
                state.pending_genes.retain(|id| *id != task.id);
                if state.pending_genes.is_empty() {
                    self.update_vm(state)
                } else {
                    Ok(Transition::continue_with(state, Vec::new()))
                }
            }
            UpdateCatletPhase::UpdatingVm if task.id == ctx.child_task_id(VM_TASK) => {
                let Some(TaskOutput::VmUpdated(response)) = task_output(&task)? else {
                    return Err(unexpected_result(&task, UpdateCatletVmResponse::MESSAGE_TYPE));
                };
                state.vm_id = Some(response.vm_id);
                state.disk_ids = response.disk_ids;
                self.update_networks(state)
            }
            UpdateCatletPhase::UpdatingNetworks if task.id == ctx.child_task_id(NETWORKS_TASK) => {
                let Some(TaskOutput::NetworksUpdated(response)) = task_output(&task)? else {
                    return Err(unexpected_result(
                        &task,
                        UpdateCatletNetworksResponse::MESSAGE_TYPE,
                    ));
                };
                self.complete(state, response.network_ids)
            }
            phase => Err(SagaError::IllegalTransition {
                saga_type: Self::NAME,
                state: format!("{:?}", phase),
                message: format!("result of {} ({})", task.id, task.command.type_name),
            }),
        }
    }
}

impl Saga for UpdateCatletSaga {
    type Command = UpdateCatletCommand;
    type State = UpdateCatletState;

    const NAME: &'static str = "update_catlet";

    fn dispatched_types(&self) -> &'static [&'static str] {
        &[
            PrepareGeneCommand::MESSAGE_TYPE,
            UpdateCatletVmCommand::MESSAGE_TYPE,
            UpdateCatletNetworksCommand::MESSAGE_TYPE,
        ]
    }

    fn references(&self, command: &UpdateCatletCommand) -> Vec<TaskReference> {
        vec![
            TaskReference::Project {
                project_id: command.project_id,
            },
            TaskReference::Catlet {
                catlet_id: command.catlet_id,
            },
        ]
    }

    fn step(
        &self,
        ctx: &SagaContext,
        state: Option<UpdateCatletState>,
        message: SagaMessage<UpdateCatletCommand>,
    ) -> Result<Transition<UpdateCatletState>, SagaError> {
        match (state, message) {
            (None, SagaMessage::Started(command)) => self.start(ctx, command),
            (Some(state), SagaMessage::TaskFinished(task)) => self.task_finished(ctx, state, task),
            (Some(state), SagaMessage::Started(_)) => Err(SagaError::IllegalTransition {
                saga_type: Self::NAME,
                state: format!("{:?}", state.phase),
                message: "a second start".to_string(),
            }),
            (None, SagaMessage::TaskFinished(task)) => Err(SagaError::IllegalTransition {
                saga_type: Self::NAME,
                state: "not started".to_string(),
                message: format!("result of {}", task.id),
            }),
        }
    }
}
