//! Name, tag, and label computation for managed VMs.

use std::collections::BTreeMap;

use vmherd_common::types::Protocol;

use crate::error::{ComputeError, Result};

/// Network tag every VM managed by the bot carries.
pub const BASE_TAG: &str = "vmherd-vm";

/// Label marking a VM as bot-managed.
pub const MANAGED_LABEL_KEY: &str = "managed-by";
pub const MANAGED_LABEL_VALUE: &str = "vmherd";

/// Label carrying the creating user's id.
pub const CREATOR_LABEL_KEY: &str = "created-by";

const MAX_NAME_LEN: usize = 63;
const MAX_TAG_LEN: usize = 63;
const MAX_RULE_NAME_LEN: usize = 62;

/// Checks a candidate instance name against the GCE grammar:
/// `^[a-z]([-a-z0-9]*[a-z0-9])?$`, 1-63 characters.
pub fn validate_instance_name(name: &str) -> Result<()> {
    let invalid = || ComputeError::InvalidName(name.to_string());

    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(invalid());
    }
    let mut chars = name.chars();
    let first = chars.next().ok_or_else(invalid)?;
    if !first.is_ascii_lowercase() {
        return Err(invalid());
    }
    for c in chars {
        if !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
            return Err(invalid());
        }
    }
    if name.ends_with('-') {
        return Err(invalid());
    }
    Ok(())
}

/// Deterministic per-instance network tag used to scope firewall rules:
/// `gameserv-` plus the case-folded, hyphenated name, capped at 63 chars.
pub fn instance_tag(instance_name: &str) -> String {
    let folded = instance_name.to_lowercase().replace('_', "-");
    truncate(&format!("gameserv-{folded}"), MAX_TAG_LEN)
}

/// Firewall rule name for one opened port:
/// `allow-<instance[..20]>-<port>-<proto>`, capped at 62 chars.
pub fn firewall_rule_name(instance_name: &str, port: u16, protocol: Protocol) -> String {
    let prefix: String = instance_name.chars().take(20).collect();
    let proto = protocol.as_str().to_lowercase();
    truncate(&format!("allow-{prefix}-{port}-{proto}"), MAX_RULE_NAME_LEN)
}

/// The label set every managed VM gets, before template labels are merged
/// on top.
pub fn base_labels(owner_user_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_LABEL_KEY.to_string(), MANAGED_LABEL_VALUE.to_string());
    labels.insert(CREATOR_LABEL_KEY.to_string(), owner_user_id.to_string());
    labels
}

/// Tag set for a new VM: the management tag, the per-instance tag, then any
/// template tags, de-duplicated in order.
pub fn merged_tags(instance_name: &str, extra_tags: &[String]) -> Vec<String> {
    let mut tags = vec![BASE_TAG.to_string(), instance_tag(instance_name)];
    for tag in extra_tags {
        tags.push(tag.clone());
    }
    let mut seen = std::collections::HashSet::new();
    tags.retain(|t| seen.insert(t.clone()));
    tags
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
