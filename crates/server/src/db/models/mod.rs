pub mod deployment_history;
pub mod network_allocation;
pub mod node;
