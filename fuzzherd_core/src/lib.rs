pub mod budget;
pub mod campaign;
pub mod cancel;
pub mod config;
pub mod host;
pub mod layout;
pub mod logging;
pub mod sanitizer;
pub mod supervisor;
pub mod triage;

#[cfg(test)]
mod test_support;

pub use budget::{BudgetError, BudgetWarning, ResourceBudget, ResourceLimits};
pub use campaign::{CampaignError, CampaignSettings, CampaignSummary, FuzzCampaign};
pub use cancel::CancelToken;
pub use config::{ConfigError, FuzzConfigFile, StaticTargets, TargetConfig, TargetProvider};
pub use host::{FixedHost, HostProbe, LiveHost};
pub use layout::ProjectLayout;
pub use sanitizer::{EnvOverlay, SanitizerProfile};
pub use supervisor::{
    ProcessSpec, ProcessSupervisor, RunOutcome, RunReport, SupervisorError, TerminationPolicy,
};
pub use triage::{Classification, CrashAnalyzer, CrashRecord, TriageError, TriageSummary};
