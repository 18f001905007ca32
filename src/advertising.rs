//! LE advertisement construction and payload budgeting.
//!
//! BlueZ composes the actual advertising PDU, but a peripheral that hands
//! it more than fits the legacy 31-byte payload gets its registration
//! rejected. The budget here mirrors what ends up on air: a flags field,
//! the service-UUID list, the shortened local name, and optionally the TX
//! power level.

use crate::error::Result;
use crate::interface::{AdvertisementState, Interface};
use crate::path::NodePath;
use crate::tree::GattTree;
use crate::uuid::GattUuid;

/// The legacy advertising data payload limit in bytes.
pub const MAX_AD_PAYLOAD: usize = 31;

/// Length of the flags AD field (length + type + flags byte).
const FLAGS_FIELD: usize = 3;
/// Length of the TX-power AD field.
const TX_POWER_FIELD: usize = 3;
/// Field header: one length byte plus one type byte.
const FIELD_HEADER: usize = 2;

/// The name of the advertisement node under the server root.
pub const ADVERTISEMENT_NODE: &str = "advertisement0";

/// The result of fitting an advertisement into the 31-byte payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingBudget {
    /// UUIDs that survived budgeting, canonical string form.
    pub service_uuids: Vec<String>,
    /// The short name, truncated to the remaining space.
    pub short_name: String,
    /// UUIDs dropped to stay within the payload.
    pub dropped: Vec<String>,
}

/// Fits `uuids` and `short_name` into the legacy advertising payload.
///
/// Custom 128-bit UUIDs are dropped first; they remain discoverable
/// through GATT. If the 16-bit list alone exceeds the budget it is
/// truncated from the end. Whatever space remains caps the short name.
pub fn fit_payload(uuids: &[GattUuid], short_name: &str, include_tx_power: bool) -> AdvertisingBudget {
    let fixed = FLAGS_FIELD + if include_tx_power { TX_POWER_FIELD } else { 0 };
    let mut available = MAX_AD_PAYLOAD - fixed;

    let short: Vec<&GattUuid> = uuids.iter().filter(|u| u.as_u16().is_some()).collect();
    let long: Vec<&GattUuid> = uuids.iter().filter(|u| u.as_u16().is_none()).collect();

    let name_field = |name_len: usize| {
        if name_len == 0 {
            0
        } else {
            FIELD_HEADER + name_len
        }
    };

    let all_fits = {
        let mut needed = name_field(short_name.len());
        if !short.is_empty() {
            needed += FIELD_HEADER + 2 * short.len();
        }
        if !long.is_empty() {
            needed += FIELD_HEADER + 16 * long.len();
        }
        needed <= available
    };

    let mut kept: Vec<String>;
    let mut dropped: Vec<String> = Vec::new();

    if all_fits {
        kept = uuids.iter().map(|u| u.to_string()).collect();
        if !short.is_empty() {
            available -= FIELD_HEADER + 2 * short.len();
        }
        if !long.is_empty() {
            available -= FIELD_HEADER + 16 * long.len();
        }
    } else {
        // 128-bit UUIDs go first.
        dropped.extend(long.iter().map(|u| u.to_string()));

        let mut fit_count = short.len();
        while fit_count > 0 && FIELD_HEADER + 2 * fit_count > available {
            fit_count -= 1;
        }
        kept = short[..fit_count].iter().map(|u| u.to_string()).collect();
        dropped.extend(short[fit_count..].iter().map(|u| u.to_string()));
        if fit_count > 0 {
            available -= FIELD_HEADER + 2 * fit_count;
        }
    }

    let max_name = available.saturating_sub(FIELD_HEADER);
    let short_name = truncate_utf8(short_name, max_name);

    AdvertisingBudget {
        service_uuids: kept,
        short_name,
        dropped,
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Builds the advertisement interface state for the given tree.
///
/// `Includes` always carries `local-name` (BlueZ surfaces it from the
/// adapter alias); `tx-power` is off unless requested.
pub fn advertisement_state(
    tree: &GattTree,
    short_name: &str,
    include_tx_power: bool,
) -> AdvertisementState {
    let budget = fit_payload(&tree.service_uuids(), short_name, include_tx_power);
    if !budget.dropped.is_empty() {
        log::info!(
            "advertising payload over budget; omitting {} service UUID(s): {}",
            budget.dropped.len(),
            budget.dropped.join(", ")
        );
    }

    let mut includes = vec!["local-name".to_string()];
    if include_tx_power {
        includes.push("tx-power".to_string());
    }

    AdvertisementState {
        ad_type: "peripheral".to_string(),
        service_uuids: budget.service_uuids,
        includes,
    }
}

/// Creates the unpublished advertisement node under the tree root.
///
/// The node answers introspection and property queries for
/// `org.bluez.LEAdvertisement1` but never appears in
/// `GetManagedObjects`; BlueZ learns about it only through
/// `RegisterAdvertisement`.
pub fn install_advertisement(tree: &mut GattTree, state: AdvertisementState) -> Result<NodePath> {
    let root = tree.root();
    let node = tree.add_child(root, ADVERTISEMENT_NODE)?;
    tree.set_published(node, false);
    tree.add_interface(node, Interface::advertisement(state))?;
    Ok(tree.node_path(node))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16s(values: &[u16]) -> Vec<GattUuid> {
        values.iter().map(|&v| GattUuid::from_u16(v)).collect()
    }

    #[test]
    fn small_payloads_keep_everything() {
        let uuids = u16s(&[0x180A, 0x180F]);
        let budget = fit_payload(&uuids, "BzPeri", false);
        assert_eq!(budget.service_uuids.len(), 2);
        assert_eq!(budget.short_name, "BzPeri");
        assert!(budget.dropped.is_empty());
    }

    #[test]
    fn custom_uuids_are_dropped_first() {
        let mut uuids = u16s(&[0x180A, 0x180F]);
        uuids.push(GattUuid::from_static("00000001-1E3C-FAD4-74E2-97A033F1BFAA"));
        uuids.push(GattUuid::from_static("00000001-1E3D-FAD4-74E2-97A033F1BFEE"));

        let budget = fit_payload(&uuids, "BzPeri", false);
        assert_eq!(budget.service_uuids.len(), 2);
        assert!(budget
            .service_uuids
            .iter()
            .all(|u| u.ends_with("0000-1000-8000-00805F9B34FB")));
        assert_eq!(budget.dropped.len(), 2);
        assert_eq!(budget.short_name, "BzPeri");
    }

    #[test]
    fn oversized_sixteen_bit_lists_are_truncated() {
        // 14 × 16-bit UUIDs encode to 2 + 28 = 30 bytes; with the 3-byte
        // flags field that alone exceeds 31.
        let uuids = u16s(&(0..14).map(|i| 0x1800 + i).collect::<Vec<_>>());
        let budget = fit_payload(&uuids, "", false);
        assert!(!budget.service_uuids.is_empty());
        assert!(budget.service_uuids.len() < 14);
        let used = 3 + 2 + 2 * budget.service_uuids.len();
        assert!(used <= MAX_AD_PAYLOAD);
        assert_eq!(
            budget.dropped.len() + budget.service_uuids.len(),
            uuids.len()
        );
    }

    #[test]
    fn long_names_are_truncated_to_the_leftover_space() {
        let uuids = u16s(&[0x180A, 0x180F, 0x1805, 0x1812]);
        let name = "A very long advertising name that cannot fit";
        let budget = fit_payload(&uuids, name, false);
        // flags (3) + uuid field (2 + 8) = 13; name gets 31 - 13 - 2 = 16.
        assert_eq!(budget.service_uuids.len(), 4);
        assert_eq!(budget.short_name.len(), 16);
        assert!(name.starts_with(&budget.short_name));
    }

    #[test]
    fn tx_power_consumes_budget() {
        let uuids = u16s(&[0x180A]);
        let without = fit_payload(&uuids, "0123456789abcdefghijklmnopqrst", false);
        let with = fit_payload(&uuids, "0123456789abcdefghijklmnopqrst", true);
        assert_eq!(without.short_name.len(), with.short_name.len() + 3);
    }

    #[test]
    fn advertisement_node_is_unpublished() {
        let mut tree = GattTree::new("/com/bzperi".parse().unwrap());
        let state = AdvertisementState {
            ad_type: "peripheral".into(),
            service_uuids: vec![],
            includes: vec!["local-name".into()],
        };
        let path = install_advertisement(&mut tree, state).unwrap();
        assert_eq!(path.as_str(), "/com/bzperi/advertisement0");
        assert!(tree.managed_objects().is_empty());
        assert!(tree
            .find_interface(path.as_str(), "org.bluez.LEAdvertisement1")
            .is_some());
    }
}
