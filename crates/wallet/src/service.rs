//! Directory of peers advertising mix service.

use std::collections::BTreeMap;

use umbra_chain::ChainView;
use umbra_consensus::constants::{MAX_SERVICE_LIST_SIZE, MIN_ANON_SERVICE_COIN};
use umbra_storage::KeyValueStore;

use crate::coinselect::SelectorRng;
use crate::error::WalletError;
use crate::wallet::Wallet;

/// View of the currently connected peer set; the directory prunes against
/// it and refuses to track disconnected hosts.
pub trait PeerSet {
    fn is_connected(&self, host: &str) -> bool;
}

impl PeerSet for std::collections::HashSet<String> {
    fn is_connected(&self, host: &str) -> bool {
        self.contains(host)
    }
}

/// What the caller should do after an update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceUpdate {
    Ignored,
    Added,
    Replaced,
    Removed,
    /// Added, and the local node qualifies as a provider itself: advertise
    /// back to the peer.
    AddedAdvertiseBack,
}

/// `service key (address) → onion host` for peers advertising availability.
#[derive(Default)]
pub struct ServiceDirectory {
    services: BTreeMap<String, String>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn host_for(&self, key: &str) -> Option<&str> {
        self.services.get(key).map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.services
            .iter()
            .map(|(key, host)| (key.as_str(), host.as_str()))
    }

    pub fn keys(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Drop entries whose host is no longer connected. Returns the surviving
    /// count.
    pub fn prune(&mut self, peers: &dyn PeerSet) -> usize {
        self.services.retain(|_, host| peers.is_connected(host));
        self.services.len()
    }

    /// Apply an advertisement (or withdrawal) from a peer. Hidden-service
    /// hosts only; bracketed IPv6 literals and clearnet names are ignored.
    pub fn update(
        &mut self,
        key: &str,
        host: &str,
        available: bool,
        peers: &dyn PeerSet,
        local_qualifies: bool,
    ) -> ServiceUpdate {
        if !available {
            return if self.services.remove(key).is_some() {
                ServiceUpdate::Removed
            } else {
                ServiceUpdate::Ignored
            };
        }

        if host.contains('[') {
            return ServiceUpdate::Ignored;
        }
        if !host.ends_with(".onion") {
            return ServiceUpdate::Ignored;
        }

        if !self.services.contains_key(key) && self.services.len() >= MAX_SERVICE_LIST_SIZE {
            if self.prune(peers) >= MAX_SERVICE_LIST_SIZE {
                umbra_log::log_debug!("service list full, advert from {host} dropped");
                return ServiceUpdate::Ignored;
            }
        }

        match self.services.insert(key.to_string(), host.to_string()) {
            None => {
                umbra_log::log_debug!("service list add {host}");
                if local_qualifies {
                    ServiceUpdate::AddedAdvertiseBack
                } else {
                    ServiceUpdate::Added
                }
            }
            Some(previous) if previous != host => ServiceUpdate::Replaced,
            Some(_) => ServiceUpdate::Ignored,
        }
    }

    /// Uniform pick of a mixer among advertised peers, excluding ourselves.
    /// Requires at least two candidates so a guarantor remains findable.
    pub fn select_mixer<R: SelectorRng>(
        &self,
        rng: &mut R,
        self_key: Option<&str>,
    ) -> Option<(String, String)> {
        let candidates: Vec<(&String, &String)> = self
            .services
            .iter()
            .filter(|(key, _)| self_key != Some(key.as_str()))
            .collect();
        if candidates.len() < 2 {
            umbra_log::log_warn!(
                "not enough service nodes: expected at least 2, have {}",
                candidates.len()
            );
            return None;
        }
        let (key, host) = candidates[rng.pick(candidates.len())];
        Some((key.clone(), host.clone()))
    }

    /// Pick a guarantor key present in both our list and the sender's,
    /// excluding both participants; uniform tie-break.
    pub fn find_guarantor<R: SelectorRng>(
        &self,
        rng: &mut R,
        sender_list: &BTreeMap<String, String>,
        exclude: &[&str],
    ) -> Option<String> {
        let matched: Vec<&String> = self
            .services
            .keys()
            .filter(|key| sender_list.contains_key(*key))
            .filter(|key| !exclude.contains(&key.as_str()))
            .collect();
        match matched.len() {
            0 => None,
            1 => Some(matched[0].clone()),
            len => Some(matched[rng.pick(len)].clone()),
        }
    }
}

impl<S: KeyValueStore> Wallet<S> {
    /// Whether this node may advertise mix service: enough spendable coin
    /// and at least two owned addresses.
    pub fn qualifies_as_service_provider<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
    ) -> Result<bool, WalletError> {
        let coins = self.available_coins(chain, true, None)?;
        let balance: i64 = coins.iter().map(|coin| coin.value).sum();
        if balance < MIN_ANON_SERVICE_COIN {
            return Ok(false);
        }
        Ok(self.own_address_count() > 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coinselect::SeededSelectorRng;
    use std::collections::HashSet;

    fn peers(hosts: &[&str]) -> HashSet<String> {
        hosts.iter().map(|host| host.to_string()).collect()
    }

    #[test]
    fn rejects_non_onion_and_ipv6() {
        let mut dir = ServiceDirectory::new();
        let connected = peers(&[]);
        assert_eq!(
            dir.update("k1", "198.51.100.7", true, &connected, false),
            ServiceUpdate::Ignored
        );
        assert_eq!(
            dir.update("k1", "[2001:db8::1]", true, &connected, false),
            ServiceUpdate::Ignored
        );
        assert_eq!(
            dir.update("k1", "abcdefgh.onion", true, &connected, false),
            ServiceUpdate::Added
        );
    }

    #[test]
    fn capacity_prunes_disconnected_first() {
        let mut dir = ServiceDirectory::new();
        let empty = peers(&[]);
        for index in 0..MAX_SERVICE_LIST_SIZE {
            let key = format!("key{index}");
            let host = format!("host{index}.onion");
            assert_eq!(
                dir.update(&key, &host, true, &empty, false),
                ServiceUpdate::Added
            );
        }
        // Only host0 still connected: the rest are pruned to make room.
        let connected = peers(&["host0.onion"]);
        assert_eq!(
            dir.update("fresh", "fresh.onion", true, &connected, false),
            ServiceUpdate::Added
        );
        assert_eq!(dir.len(), 2);
        assert!(dir.host_for("key0").is_some());
    }

    #[test]
    fn advertise_back_when_local_qualifies() {
        let mut dir = ServiceDirectory::new();
        let connected = peers(&[]);
        assert_eq!(
            dir.update("k1", "peer.onion", true, &connected, true),
            ServiceUpdate::AddedAdvertiseBack
        );
    }

    #[test]
    fn withdrawal_removes() {
        let mut dir = ServiceDirectory::new();
        let connected = peers(&[]);
        dir.update("k1", "peer.onion", true, &connected, false);
        assert_eq!(
            dir.update("k1", "peer.onion", false, &connected, false),
            ServiceUpdate::Removed
        );
        assert!(dir.is_empty());
    }

    #[test]
    fn mixer_selection_needs_two_peers() {
        let mut dir = ServiceDirectory::new();
        let connected = peers(&[]);
        let mut rng = SeededSelectorRng::new(11);
        dir.update("k1", "one.onion", true, &connected, false);
        assert!(dir.select_mixer(&mut rng, None).is_none());
        dir.update("k2", "two.onion", true, &connected, false);
        assert!(dir.select_mixer(&mut rng, None).is_some());
        // Excluding ourselves can drop us under the floor.
        assert!(dir.select_mixer(&mut rng, Some("k1")).is_none());
    }

    #[test]
    fn guarantor_is_intersection_member() {
        let mut dir = ServiceDirectory::new();
        let connected = peers(&[]);
        for (key, host) in [("a", "a.onion"), ("b", "b.onion"), ("c", "c.onion")] {
            dir.update(key, host, true, &connected, false);
        }
        let mut sender_list = BTreeMap::new();
        sender_list.insert("b".to_string(), "b.onion".to_string());
        sender_list.insert("c".to_string(), "c.onion".to_string());
        let mut rng = SeededSelectorRng::new(5);
        let guarantor = dir
            .find_guarantor(&mut rng, &sender_list, &["c"])
            .expect("guarantor");
        assert_eq!(guarantor, "b");
    }
}
