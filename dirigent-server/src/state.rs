//! Shared application state for the control-plane server.

use std::sync::Arc;

use dirigent::events::EventHub;
use dirigent::llm::credentials::CredentialPool;
use dirigent::llm::local::LifecycleManager;
use dirigent::run::workflow::Workflow;
use dirigent::sandbox::SandboxFs;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<Workflow>,
    pub events: Arc<EventHub>,
    pub sandbox: Arc<SandboxFs>,
    pub lifecycle: Arc<LifecycleManager>,
    pub credentials: Arc<CredentialPool>,
}
