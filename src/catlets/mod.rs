//! Catlet configuration and the commands exchanged while updating a catlet.
//!
//! The controller-side command (`UpdateCatletCommand`) starts a saga; the
//! agent-side commands are dispatched by that saga as operation tasks.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::BusMessage;
use crate::genes::GeneIdentifierWithType;

/// Declarative definition of a catlet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatletConfig {
    pub name: String,
    /// Parent geneset reference, `<org>/<set>[/<tag>]`.
    pub parent: Option<String>,
    pub drives: Vec<CatletDriveConfig>,
    pub fodder: Vec<FodderConfig>,
    pub networks: Vec<CatletNetworkConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatletDriveConfig {
    pub name: String,
    /// Either `gene:...` or a plain disk path.
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FodderConfig {
    pub name: String,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatletNetworkConfig {
    pub name: String,
    pub adapter_name: Option<String>,
}

/// Create or update a catlet on a host agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCatletCommand {
    pub catlet_id: Uuid,
    pub project_id: Uuid,
    /// Host agent that owns the catlet's VM.
    pub agent_name: String,
    pub config: CatletConfig,
}

impl BusMessage for UpdateCatletCommand {
    const MESSAGE_TYPE: &'static str = "catlet.UpdateCatletCommand";
}

/// Result of a completed catlet update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCatletResult {
    pub catlet_id: Uuid,
    pub vm_id: Uuid,
}

impl BusMessage for UpdateCatletResult {
    const MESSAGE_TYPE: &'static str = "catlet.UpdateCatletResult";
}

/// Make a gene available in the agent's local gene pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareGeneCommand {
    pub agent_name: String,
    pub gene: GeneIdentifierWithType,
}

impl BusMessage for PrepareGeneCommand {
    const MESSAGE_TYPE: &'static str = "catlet.PrepareGeneCommand";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareGeneResponse {
    pub gene: GeneIdentifierWithType,
}

impl BusMessage for PrepareGeneResponse {
    const MESSAGE_TYPE: &'static str = "catlet.PrepareGeneResponse";
}

/// Create or reconfigure the VM backing a catlet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCatletVmCommand {
    pub agent_name: String,
    pub catlet_id: Uuid,
    pub config: CatletConfig,
}

impl BusMessage for UpdateCatletVmCommand {
    const MESSAGE_TYPE: &'static str = "catlet.UpdateCatletVmCommand";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCatletVmResponse {
    pub vm_id: Uuid,
    /// Disks attached to the VM after the update.
    #[serde(default)]
    pub disk_ids: Vec<Uuid>,
}

impl BusMessage for UpdateCatletVmResponse {
    const MESSAGE_TYPE: &'static str = "catlet.UpdateCatletVmResponse";
}

/// Apply the network plan for a catlet's adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCatletNetworksCommand {
    pub catlet_id: Uuid,
    pub project_id: Uuid,
    pub networks: Vec<CatletNetworkConfig>,
}

impl BusMessage for UpdateCatletNetworksCommand {
    const MESSAGE_TYPE: &'static str = "catlet.UpdateCatletNetworksCommand";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCatletNetworksResponse {
    /// Virtual networks the catlet is connected to.
    #[serde(default)]
    pub network_ids: Vec<Uuid>,
}

impl BusMessage for UpdateCatletNetworksResponse {
    const MESSAGE_TYPE: &'static str = "catlet.UpdateCatletNetworksResponse";
}
