//! Status aggregation: transient state takes precedence over what the CLI
//! reports, which takes precedence over unknown.

use crate::lifecycle::{LifecycleDriver, TransientState};
use stackd_core::mapper::{MapperIndex, ServiceStatus};

/// Merge one service's transient state with the live CLI view.
/// `live` is `None` when the CLI could not be queried.
#[must_use]
pub fn merge(transient: Option<TransientState>, live: Option<bool>) -> ServiceStatus {
    match (transient, live) {
        (Some(state), _) => state.as_status(),
        (None, Some(true)) => ServiceStatus::Running,
        (None, Some(false)) => ServiceStatus::Stopped,
        (None, None) => ServiceStatus::Unknown,
    }
}

/// Overlay in-flight transitions onto a freshly built index.
pub fn overlay_transient(index: &mut MapperIndex, driver: &LifecycleDriver) {
    for (rel, project) in &mut index.projects {
        for (name, service) in &mut project.services {
            if let Some(state) = driver.transient_for(rel, name) {
                service.status = state.as_status();
            }
        }
    }
}
