//! Hook registry and the runner seam used by the proxy engine.
//!
//! Handlers for a hook run in ascending [`Priority`]. The first handler
//! receives the original payload; every later handler receives the last
//! accepted result. A result is accepted when [`verify`] holds, otherwise the
//! registry's [`Verification`] policy decides.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::HookError;
use crate::types::{verify, HookName, Payload, Priority, Verification};

/// A single hook handler.
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// Handle `payload` for `hook` and return the (possibly modified) payload.
    async fn handle(&self, hook: HookName, payload: Payload) -> Result<Payload, HookError>;
}

#[async_trait]
impl<F> HookHandler for F
where
    F: Fn(HookName, Payload) -> Result<Payload, HookError> + Send + Sync,
{
    async fn handle(&self, hook: HookName, payload: Payload) -> Result<Payload, HookError> {
        (self)(hook, payload)
    }
}

/// Something that can run the handlers attached to a hook.
///
/// This is the seam the proxy engine depends on.
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Run every handler for `hook`.
    ///
    /// Returns `Ok(None)` when nothing is attached to the hook.
    async fn run(
        &self,
        hook: HookName,
        payload: Payload,
        verification: Verification,
    ) -> Result<Option<Payload>, HookError>;

    /// Verification policy to use for this runner's hooks.
    fn verification(&self) -> Verification;

    /// Run a notification hook whose result is not needed.
    async fn notify(&self, hook: HookName, payload: Payload) {
        if let Err(e) = self.run(hook, payload, self.verification()).await {
            warn!(hook = %hook, error = %e, "Failed to run hooks");
        }
    }
}

type Handlers = BTreeMap<Priority, Arc<dyn HookHandler>>;

/// In-process registry of hook handlers.
pub struct HookRegistry {
    verification: Verification,
    hooks: RwLock<HashMap<HookName, Handlers>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
        let counts: BTreeMap<HookName, usize> = hooks.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("HookRegistry")
            .field("verification", &self.verification)
            .field("handlers", &counts)
            .finish()
    }
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new(verification: Verification) -> Self {
        Self {
            verification,
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Attach `handler` to `hook` at `priority`.
    ///
    /// Returns `true` if a handler already registered at that priority was
    /// replaced.
    pub fn add(&self, hook: HookName, priority: Priority, handler: Arc<dyn HookHandler>) -> bool {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = hooks
            .entry(hook)
            .or_default()
            .insert(priority, handler)
            .is_some();

        if replaced {
            warn!(hook = %hook, priority, "Hook handler replaced");
        } else {
            debug!(hook = %hook, priority, "Hook handler registered");
        }
        replaced
    }

    /// Number of handlers attached to `hook`.
    pub fn handler_count(&self, hook: HookName) -> usize {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&hook)
            .map_or(0, BTreeMap::len)
    }

    /// Check if no handler is attached to any hook.
    pub fn is_empty(&self) -> bool {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .all(BTreeMap::is_empty)
    }

    // Handlers are cloned out so no lock is held while they run.
    fn handlers_for(&self, hook: HookName) -> Vec<(Priority, Arc<dyn HookHandler>)> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&hook)
            .map(|handlers| {
                handlers
                    .iter()
                    .map(|(prio, handler)| (*prio, Arc::clone(handler)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove_handlers(&self, hook: HookName, failed: &[(Priority, Arc<dyn HookHandler>)]) {
        if failed.is_empty() {
            return;
        }

        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = hooks.get_mut(&hook) else {
            return;
        };
        for (priority, handler) in failed {
            // Only drop the handler that actually failed, not a replacement
            // registered at the same priority while the hook was running.
            if handlers
                .get(priority)
                .is_some_and(|current| Arc::ptr_eq(current, handler))
            {
                handlers.remove(priority);
                warn!(hook = %hook, priority, "Hook handler removed after failed verification");
            }
        }
    }
}

#[async_trait]
impl HookRunner for HookRegistry {
    async fn run(
        &self,
        hook: HookName,
        payload: Payload,
        verification: Verification,
    ) -> Result<Option<Payload>, HookError> {
        let handlers = self.handlers_for(hook);
        if handlers.is_empty() {
            return Ok(None);
        }

        let mut current = payload;
        let mut failed = Vec::new();

        for (priority, handler) in handlers {
            let result = match handler.handle(hook, current.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(hook = %hook, priority, error = %e, "Hook handler failed");
                    continue;
                }
            };

            if verify(&current, &result) {
                current = result;
                continue;
            }

            match verification {
                Verification::PassDown => {
                    debug!(hook = %hook, priority, "Hook returned a different shape, passing it down");
                    current = result;
                }
                Verification::Ignore => {
                    warn!(hook = %hook, priority, "Hook returned invalid value, ignoring");
                }
                Verification::Abort => {
                    warn!(hook = %hook, priority, "Hook returned invalid value, aborting");
                    break;
                }
                Verification::Remove => {
                    warn!(hook = %hook, priority, "Hook returned invalid value, removing");
                    failed.push((priority, handler));
                }
            }
        }

        self.remove_handlers(hook, &failed);
        Ok(Some(current))
    }

    fn verification(&self) -> Verification {
        self.verification
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Mutex;

    type HookResult = Result<Payload, HookError>;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn set_request(value: &'static str) -> Arc<dyn HookHandler> {
        Arc::new(move |_: HookName, mut p: Payload| -> HookResult {
            p.insert("request".to_string(), json!(value));
            Ok(p)
        })
    }

    #[tokio::test]
    async fn test_no_handlers_returns_none() {
        let registry = HookRegistry::new(Verification::PassDown);
        let result = registry
            .run(
                HookName::OnIngressTraffic,
                payload(json!({"request": ""})),
                Verification::PassDown,
            )
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_handlers_run_in_priority_order() {
        let registry = HookRegistry::new(Verification::PassDown);
        let order = Arc::new(Mutex::new(Vec::new()));

        for prio in [30u32, 10, 20] {
            let order = Arc::clone(&order);
            registry.add(
                HookName::OnEgressTraffic,
                prio,
                Arc::new(move |_: HookName, mut p: Payload| -> HookResult {
                    order.lock().unwrap().push(prio);
                    let seen = p["response"].as_str().unwrap_or_default().to_string();
                    p.insert("response".to_string(), json!(format!("{seen}{prio},")));
                    Ok(p)
                }),
            );
        }

        let result = registry
            .run(
                HookName::OnEgressTraffic,
                payload(json!({"response": ""})),
                Verification::PassDown,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
        assert_eq!(result["response"], json!("10,20,30,"));
    }

    #[tokio::test]
    async fn test_failing_handler_is_skipped() {
        let registry = HookRegistry::new(Verification::Abort);
        registry.add(
            HookName::OnIngressTraffic,
            1,
            Arc::new(|_: HookName, _: Payload| -> HookResult { Err(HookError::Handler("boom".to_string())) }),
        );
        registry.add(HookName::OnIngressTraffic, 2, set_request("second"));

        let result = registry
            .run(
                HookName::OnIngressTraffic,
                payload(json!({"request": "orig"})),
                Verification::Abort,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["request"], json!("second"));
        assert_eq!(registry.handler_count(HookName::OnIngressTraffic), 2);
    }

    #[tokio::test]
    async fn test_add_replaces_same_priority() {
        let registry = HookRegistry::new(Verification::PassDown);
        assert!(!registry.add(HookName::OnIngressTraffic, 5, set_request("a")));
        assert!(registry.add(HookName::OnIngressTraffic, 5, set_request("b")));
        assert_eq!(registry.handler_count(HookName::OnIngressTraffic), 1);

        let result = registry
            .run(
                HookName::OnIngressTraffic,
                payload(json!({"request": "orig"})),
                Verification::PassDown,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["request"], json!("b"));
    }

    #[rstest]
    #[case::pass_down(Verification::PassDown, "b", true, 2)]
    #[case::ignore(Verification::Ignore, "b", false, 2)]
    #[case::abort(Verification::Abort, "orig", false, 2)]
    #[case::remove(Verification::Remove, "b", false, 1)]
    #[tokio::test]
    async fn test_verification_policy(
        #[case] policy: Verification,
        #[case] expected_request: &str,
        #[case] expect_extra: bool,
        #[case] remaining: usize,
    ) {
        let registry = HookRegistry::new(policy);
        registry.add(
            HookName::OnIngressTraffic,
            1,
            Arc::new(|_: HookName, mut p: Payload| -> HookResult {
                p.insert("request".to_string(), json!("a"));
                p.insert("extra".to_string(), json!(1));
                Ok(p)
            }),
        );
        registry.add(HookName::OnIngressTraffic, 2, set_request("b"));

        let result = registry
            .run(
                HookName::OnIngressTraffic,
                payload(json!({"request": "orig"})),
                registry.verification(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result["request"], json!(expected_request));
        assert_eq!(result.contains_key("extra"), expect_extra);
        assert_eq!(registry.handler_count(HookName::OnIngressTraffic), remaining);
    }

    #[tokio::test]
    async fn test_notify_ignores_result() {
        let registry = HookRegistry::new(Verification::PassDown);
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        registry.add(
            HookName::OnNewPool,
            0,
            Arc::new(move |_: HookName, p: Payload| -> HookResult {
                *counter.lock().unwrap() += 1;
                Ok(p)
            }),
        );

        registry
            .notify(HookName::OnNewPool, payload(json!({"size": 10})))
            .await;
        registry
            .notify(HookName::OnNewProxy, payload(json!({"elastic": false})))
            .await;
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
