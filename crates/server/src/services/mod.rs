pub mod allocator;
pub mod boot_config_service;
pub mod cleanup_service;
pub mod phase_tracker;
pub mod provisioning_service;

pub use allocator::{AllocationOutcome, AllocationStep, AllocatorService};
pub use boot_config_service::BootConfigService;
pub use cleanup_service::{CleanupReport, CleanupService, CleanupStep, StepOutcome};
pub use phase_tracker::{CallbackTarget, PhaseReport, PhaseTracker, PhaseUpdateResponse};
pub use provisioning_service::ProvisioningService;
