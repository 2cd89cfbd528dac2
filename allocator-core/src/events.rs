//! The event-raising contract the allocator uses to tell the reconcile
//! driver (and, by default, its own logs) about things an operator should
//! know: a pool got dropped, a service hit a sharing-key conflict, and so
//! on. Mirrors Kubernetes' `Infof`/`Errorf` event helpers without taking a
//! dependency on any Kubernetes client.

pub trait EventRecorder: std::fmt::Debug {
    fn infof(&self, subject: &str, reason: &str, message: &str);
    fn errorf(&self, subject: &str, reason: &str, message: &str);
}

/// Forwards every event to `tracing`, so the allocator is observable even
/// before a real driver is wired up to convert these into cluster events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventRecorder;

impl EventRecorder for TracingEventRecorder {
    fn infof(&self, subject: &str, reason: &str, message: &str) {
        tracing::info!(subject, reason, message);
    }

    fn errorf(&self, subject: &str, reason: &str, message: &str) {
        tracing::warn!(subject, reason, message);
    }
}
