//! Hook names, payloads and verification policies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Payload passed to and returned by hook handlers.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Handler ordering within a hook. Lower values run first.
pub type Priority = u32;

// =============================================================================
// Hook Names
// =============================================================================

/// Events a handler can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookName {
    /// Configuration has been loaded.
    OnConfigLoaded,
    /// The logger has been configured.
    OnNewLogger,
    /// The backend pool has been populated.
    OnNewPool,
    /// A backend client has been created during pool population.
    OnNewClient,
    /// The proxy engine has been created.
    OnNewProxy,
    /// The inbound server has been bound.
    OnNewServer,
    /// A termination signal was received.
    OnSignal,
    /// An inbound connection was opened.
    OnOpened,
    /// An inbound connection was closed.
    OnClosed,
    /// Request bytes from an inbound connection, before they reach the backend.
    OnIngressTraffic,
    /// Response bytes from the backend, before they reach the inbound connection.
    OnEgressTraffic,
    /// The server is shutting down.
    OnShutdown,
}

impl HookName {
    /// Every hook, in lifecycle order.
    pub const ALL: [HookName; 12] = [
        HookName::OnConfigLoaded,
        HookName::OnNewLogger,
        HookName::OnNewPool,
        HookName::OnNewClient,
        HookName::OnNewProxy,
        HookName::OnNewServer,
        HookName::OnSignal,
        HookName::OnOpened,
        HookName::OnClosed,
        HookName::OnIngressTraffic,
        HookName::OnEgressTraffic,
        HookName::OnShutdown,
    ];

    /// Wire name of the hook.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::OnConfigLoaded => "onConfigLoaded",
            HookName::OnNewLogger => "onNewLogger",
            HookName::OnNewPool => "onNewPool",
            HookName::OnNewClient => "onNewClient",
            HookName::OnNewProxy => "onNewProxy",
            HookName::OnNewServer => "onNewServer",
            HookName::OnSignal => "onSignal",
            HookName::OnOpened => "onOpened",
            HookName::OnClosed => "onClosed",
            HookName::OnIngressTraffic => "onIngressTraffic",
            HookName::OnEgressTraffic => "onEgressTraffic",
            HookName::OnShutdown => "onShutdown",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Verification
// =============================================================================

/// What to do when a handler returns a payload of a different shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verification {
    /// Accept the result anyway and pass it to the next handler.
    #[default]
    PassDown,
    /// Discard the result and keep the previous value.
    Ignore,
    /// Stop running handlers and return the previous value.
    Abort,
    /// Discard the result and unregister the handler.
    Remove,
}

impl Verification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verification::PassDown => "passdown",
            Verification::Ignore => "ignore",
            Verification::Abort => "abort",
            Verification::Remove => "remove",
        }
    }
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passdown" => Ok(Verification::PassDown),
            "ignore" => Ok(Verification::Ignore),
            "abort" => Ok(Verification::Abort),
            "remove" => Ok(Verification::Remove),
            other => Err(format!(
                "unknown verification policy '{other}' (expected passdown, ignore, abort or remove)"
            )),
        }
    }
}

/// Check that a handler result has exactly the keys of the payload it was given.
pub fn verify(params: &Payload, result: &Payload) -> bool {
    params.len() == result.len() && params.keys().all(|k| result.contains_key(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_hook_name_display() {
        assert_eq!(HookName::OnIngressTraffic.to_string(), "onIngressTraffic");
        assert_eq!(
            serde_json::to_string(&HookName::OnNewPool).unwrap(),
            "\"onNewPool\""
        );
        for hook in HookName::ALL {
            assert_eq!(
                serde_json::to_string(&hook).unwrap(),
                format!("\"{}\"", hook.as_str())
            );
        }
    }

    #[test]
    fn test_verification_parse() {
        assert_eq!("PassDown".parse::<Verification>(), Ok(Verification::PassDown));
        assert_eq!(" ignore ".parse::<Verification>(), Ok(Verification::Ignore));
        assert_eq!("ABORT".parse::<Verification>(), Ok(Verification::Abort));
        assert_eq!("remove".parse::<Verification>(), Ok(Verification::Remove));
        assert!("drop".parse::<Verification>().is_err());
        assert_eq!(Verification::default(), Verification::PassDown);
    }

    #[test]
    fn test_verify_same_keys() {
        let params = payload(json!({"request": "YQ==", "error": ""}));
        let same = payload(json!({"request": "Yg==", "error": "oops"}));
        let missing = payload(json!({"request": "Yg=="}));
        let extra = payload(json!({"request": "Yg==", "error": "", "more": 1}));

        assert!(verify(&params, &same));
        assert!(!verify(&params, &missing));
        assert!(!verify(&params, &extra));
    }
}
