// Injected script host for custom actor/node actions and script assertions

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::error::IssiTesterError;
use crate::trace::SignalingRecord;

/// Capability the scheduler uses to run opaque script actions and
/// script-backed post-conditions. Calls are synchronous.
pub trait ScriptHost: Send + Sync {
    /// Run `method` for `target` (an actor id or node id)
    fn invoke(&self, target: &str, method: &str) -> Result<(), IssiTesterError>;

    /// Evaluate the named assertion against captured records
    fn evaluate(&self, name: &str, records: &[SignalingRecord]) -> Result<bool, IssiTesterError>;
}

pub type ActionFn = Arc<dyn Fn(&str) -> Result<(), IssiTesterError> + Send + Sync>;
pub type AssertionFn = Arc<dyn Fn(&[SignalingRecord]) -> bool + Send + Sync>;

/// Script host backed by registered closures
#[derive(Default)]
pub struct ActionRegistry {
    actions: DashMap<String, ActionFn>,
    assertions: DashMap<String, AssertionFn>,
    invocations: Mutex<Vec<(String, String)>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_action<F>(&self, method: &str, action: F)
    where
        F: Fn(&str) -> Result<(), IssiTesterError> + Send + Sync + 'static,
    {
        self.actions.insert(method.to_string(), Arc::new(action));
    }

    pub fn register_assertion<F>(&self, name: &str, assertion: F)
    where
        F: Fn(&[SignalingRecord]) -> bool + Send + Sync + 'static,
    {
        self.assertions.insert(name.to_string(), Arc::new(assertion));
    }

    /// (target, method) pairs in invocation order
    pub fn invocations(&self) -> Vec<(String, String)> {
        self.invocations.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl ScriptHost for ActionRegistry {
    fn invoke(&self, target: &str, method: &str) -> Result<(), IssiTesterError> {
        // Clone the callable out so no map guard is held while it runs
        let action = self
            .actions
            .get(method)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                IssiTesterError::ConfigError(format!("no script action registered for {}", method))
            })?;
        if let Ok(mut invocations) = self.invocations.lock() {
            invocations.push((target.to_string(), method.to_string()));
        }
        action(target)
    }

    fn evaluate(&self, name: &str, records: &[SignalingRecord]) -> Result<bool, IssiTesterError> {
        let assertion = self
            .assertions
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                IssiTesterError::ConfigError(format!("no script assertion registered for {}", name))
            })?;
        Ok(assertion(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_invoke_runs_registered_action() {
        let registry = ActionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register_action("ping", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        registry.invoke("su_1", "ping").unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(
            registry.invocations(),
            vec![("su_1".to_string(), "ping".to_string())]
        );
    }

    #[test]
    fn test_invoke_unknown_method_is_error() {
        let registry = ActionRegistry::new();
        assert!(registry.invoke("su_1", "missing").is_err());
        assert!(registry.invocations().is_empty());
    }

    #[test]
    fn test_action_errors_propagate() {
        let registry = ActionRegistry::new();
        registry.register_action("fail", |target| {
            Err(IssiTesterError::CallControl(format!("{} refused", target)))
        });
        assert!(matches!(
            registry.invoke("su_3", "fail"),
            Err(IssiTesterError::CallControl(msg)) if msg == "su_3 refused"
        ));
    }

    #[test]
    fn test_evaluate_assertion() {
        let registry = ActionRegistry::new();
        registry.register_assertion("empty", |records| records.is_empty());
        assert!(registry.evaluate("empty", &[]).unwrap());
        assert!(registry.evaluate("unknown", &[]).is_err());
    }
}
