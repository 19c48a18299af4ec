//! Tracking of the endpoints whose names this host serves.
//!
//! Local endpoints are registered as they are created. For networks that
//! span hosts, the endpoint counter of the network is watched in the global
//! store; every change triggers a re-list of the network's endpoints, and
//! the difference against the last known set turns into service record
//! updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::Weak;

use crossbeam_channel::{Receiver, Sender};

use crate::controller::ControllerInner;
use crate::datastore::DataScope;
use crate::endpoint::Endpoint;
use crate::endpoint_cnt::{ENDPOINT_COUNT_KEY, EndpointCnt};
use crate::network::Network;

/// Endpoints known for one network.
#[derive(Debug, Default)]
pub(crate) struct NetWatch {
    pub(crate) local_eps: BTreeMap<String, Endpoint>,
    pub(crate) remote_eps: BTreeMap<String, Endpoint>,
    /// Dropping the sender ends the store watch.
    stop: Option<Sender<()>>,
}

pub(crate) type NetWatchMap = HashMap<String, NetWatch>;

/// Which remote endpoints appeared, vanished or were renamed.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct RemoteDiff {
    pub(crate) added: Vec<Endpoint>,
    pub(crate) deleted: Vec<Endpoint>,
    /// `(old, new)` pairs with the same ID and a new name.
    pub(crate) renamed: Vec<(Endpoint, Endpoint)>,
}

/// Compare the endpoints in the store against what is known.
pub(crate) fn diff_remote(nw: &NetWatch, in_store: &[Endpoint]) -> RemoteDiff {
    let mut diff = RemoteDiff::default();
    for ep in in_store {
        if nw.local_eps.contains_key(&ep.id) {
            continue;
        }
        match nw.remote_eps.get(&ep.id) {
            None => diff.added.push(ep.clone()),
            Some(known) if known.name != ep.name => diff.renamed.push((known.clone(), ep.clone())),
            Some(_) => {}
        }
    }
    for (id, known) in &nw.remote_eps {
        if !in_store.iter().any(|ep| &ep.id == id) {
            diff.deleted.push(known.clone());
        }
    }
    diff
}

impl ControllerInner {
    /// Register a local endpoint and publish its names. Returns whether the
    /// endpoint was not registered before.
    pub(crate) fn watch_svc_record(&self, n: &Network, ep: &Endpoint) -> bool {
        let mut nmap = self.nmap.lock();
        let nw = nmap.entry(n.id.clone()).or_default();
        if nw.local_eps.insert(ep.id.clone(), ep.clone()).is_some() {
            return false;
        }
        nw.remote_eps.remove(&ep.id);

        if nw.stop.is_none() {
            if let Some(stop) = self.start_remote_watch(n) {
                nw.stop = Some(stop);
            }
        }
        self.update_svc_record(n, ep, true);
        true
    }

    /// Forget a local endpoint and withdraw its names. The last local
    /// endpoint of a network takes the network's records with it.
    pub(crate) fn unwatch_svc_record(&self, n: &Network, ep: &Endpoint) {
        let mut nmap = self.nmap.lock();
        let Some(nw) = nmap.get_mut(&n.id) else {
            return;
        };
        let Some(known) = nw.local_eps.remove(&ep.id) else {
            return;
        };
        self.update_svc_record(n, &known, false);

        if nw.local_eps.is_empty() {
            // Drops the stop sender as well.
            nmap.remove(&n.id);
            self.cleanup_service_discovery(&n.id);
            tracing::debug!(network = %n.name, "Stopped watching network endpoints");
        }
    }

    /// Replace the snapshot of a local endpoint after it changed.
    pub(crate) fn refresh_local_endpoint(&self, n: &Network, ep: &Endpoint) {
        if let Some(nw) = self.nmap.lock().get_mut(&n.id) {
            if let Some(known) = nw.local_eps.get_mut(&ep.id) {
                *known = ep.clone();
            }
        }
    }

    /// Local endpoints of network `nid`.
    pub(crate) fn local_endpoints(&self, nid: &str) -> Vec<Endpoint> {
        self.nmap
            .lock()
            .get(nid)
            .map(|nw| nw.local_eps.values().cloned().collect())
            .unwrap_or_default()
    }

    fn start_remote_watch(&self, n: &Network) -> Option<Sender<()>> {
        if n.scope == DataScope::Local {
            return None;
        }
        let multihost = self
            .drivers
            .capability(&n.network_type)
            .is_ok_and(|cap| cap.is_multihost());
        if !multihost {
            return None;
        }
        let store = self.store_for(n.scope).ok()?;

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let updates: Receiver<Vec<EndpointCnt>> =
            match store.watch(&[ENDPOINT_COUNT_KEY, &n.id], stop_rx.clone()) {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::warn!(network = %n.name, error = %e, "Could not watch endpoint count");
                    return None;
                }
            };

        let ctrl = self.self_ref.clone();
        let nid = n.id.clone();
        let spawned = std::thread::Builder::new()
            .name("netplane-netwatch".to_string())
            .spawn(move || network_watch_loop(&ctrl, &nid, &updates, &stop_rx));
        if let Err(e) = spawned {
            tracing::warn!(network = %n.name, error = %e, "Could not start network watch");
            return None;
        }
        tracing::debug!(network = %n.name, "Watching network endpoints");
        Some(stop_tx)
    }

    /// Re-list the endpoints of `nid` and apply the difference.
    pub(crate) fn process_remote_change(&self, nid: &str) {
        let n = match self.network_from_store(nid) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(network = nid, error = %e, "Network gone while processing endpoint change");
                return;
            }
        };
        let in_store = match self.endpoints_of(&n) {
            Ok(eps) => eps,
            Err(e) => {
                tracing::warn!(network = %n.name, error = %e, "Could not list endpoints");
                return;
            }
        };

        let mut nmap = self.nmap.lock();
        let Some(nw) = nmap.get_mut(nid) else {
            return;
        };
        let diff = diff_remote(nw, &in_store);

        for ep in diff.added {
            tracing::debug!(network = %n.name, endpoint = %ep.name, "Remote endpoint added");
            self.update_svc_record(&n, &ep, true);
            nw.remote_eps.insert(ep.id.clone(), ep);
        }
        for (old, new) in diff.renamed {
            tracing::debug!(network = %n.name, endpoint = %old.name, new_name = %new.name, "Remote endpoint renamed");
            self.update_svc_record(&n, &old, false);
            self.update_svc_record(&n, &new, true);
            nw.remote_eps.insert(new.id.clone(), new);
        }
        for ep in diff.deleted {
            tracing::debug!(network = %n.name, endpoint = %ep.name, "Remote endpoint deleted");
            self.update_svc_record(&n, &ep, false);
            nw.remote_eps.remove(&ep.id);
        }
    }
}

fn network_watch_loop(
    ctrl: &Weak<ControllerInner>,
    nid: &str,
    updates: &Receiver<Vec<EndpointCnt>>,
    stop: &Receiver<()>,
) {
    loop {
        crossbeam_channel::select! {
            recv(stop) -> _ => break,
            recv(updates) -> msg => {
                if msg.is_err() {
                    break;
                }
                let Some(ctrl) = ctrl.upgrade() else {
                    break;
                };
                ctrl.process_remote_change(nid);
            }
        }
    }
    tracing::trace!(network = nid, "Network watch ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(id: &str, name: &str) -> Endpoint {
        serde_json::from_value(serde_json::json!({ "id": id, "name": name })).unwrap()
    }

    #[test]
    fn diff_classifies_changes() {
        let mut nw = NetWatch::default();
        nw.local_eps.insert("l1".into(), ep("l1", "local"));
        nw.remote_eps.insert("r1".into(), ep("r1", "web"));
        nw.remote_eps.insert("r2".into(), ep("r2", "db"));

        let store = vec![
            ep("l1", "local"),
            ep("r1", "web2"),
            ep("r3", "cache"),
        ];
        let diff = diff_remote(&nw, &store);

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, "r3");
        assert_eq!(diff.renamed.len(), 1);
        assert_eq!(diff.renamed[0].0.name, "web");
        assert_eq!(diff.renamed[0].1.name, "web2");
        assert_eq!(diff.deleted.len(), 1);
        assert_eq!(diff.deleted[0].id, "r2");
    }

    #[test_log::test]
    fn watch_reports_new_registrations() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let c = crate::Controller::new(
            crate::ControllerConfig::default()
                .with_root(dir.path())
                .with_memory_store()
                .with_external_key(false),
        )?;
        let n = c.new_network("null", "none", None, crate::NetworkOptions::new())?;
        let e = n.create_endpoint("ep1", crate::EndpointOptions::new())?;
        let ctrl = n.controller()?;

        // Creation registered it already.
        assert!(!ctrl.watch_svc_record(&n, &e));
        assert_eq!(ctrl.local_endpoints(n.id()).len(), 1);

        ctrl.unwatch_svc_record(&n, &e);
        assert!(ctrl.local_endpoints(n.id()).is_empty());
        assert!(ctrl.watch_svc_record(&n, &e));
        Ok(())
    }

    #[test]
    fn unchanged_store_is_empty_diff() {
        let mut nw = NetWatch::default();
        nw.remote_eps.insert("r1".into(), ep("r1", "web"));
        let diff = diff_remote(&nw, &[ep("r1", "web")]);
        assert_eq!(diff, RemoteDiff::default());
    }
}
