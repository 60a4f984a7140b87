//! Shutdown taints applied before a node is rebooted

use k8s_openapi::api::core::v1::Taint;

/// Evicts running pods that do not tolerate it
pub const SHUTDOWN_TAINT_KEY: &str = "ignis.io/shutdown";

/// Keeps new pods off while the node's pod network goes away
pub const NETWORK_UNAVAILABLE_TAINT_KEY: &str = "ignis.io/network-unavailable";

/// The taints a drain applies, in application order
pub fn shutdown_taints() -> Vec<Taint> {
    vec![
        Taint {
            key: SHUTDOWN_TAINT_KEY.to_string(),
            value: Some("true".to_string()),
            effect: "NoExecute".to_string(),
            time_added: None,
        },
        Taint {
            key: NETWORK_UNAVAILABLE_TAINT_KEY.to_string(),
            value: Some("true".to_string()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        },
    ]
}

/// Whether a taint with this key is present
pub fn has_taint(taints: &[Taint], key: &str) -> bool {
    taints.iter().any(|t| t.key == key)
}

/// Append `taint` unless one with the same key exists. Returns whether it was added.
///
/// An existing taint with the key is left as is, value and effect included.
pub fn add_taint_if_absent(taints: &mut Vec<Taint>, taint: Taint) -> bool {
    if has_taint(taints, &taint.key) {
        return false;
    }
    taints.push(taint);
    true
}
