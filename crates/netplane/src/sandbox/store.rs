//! Persisted sandbox state, enough to rebuild or clean up a sandbox after
//! a restart.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::controller::ControllerInner;
use crate::datastore::{DataScope, KvObject, MAX_RETRIES};
use crate::endpoint::Endpoint;
use crate::resolver::ExtDns;

use super::{Sandbox, interface_options};

/// Store collection of sandboxes.
pub const SANDBOX_KEY: &str = "sandbox";

/// A joined endpoint, by ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EndpointRef {
    #[serde(rename = "Eid")]
    pub(crate) eid: String,
    #[serde(rename = "Nid")]
    pub(crate) nid: String,
}

/// Stored form of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SandboxRecord {
    #[serde(rename = "ID")]
    pub(crate) id: String,
    #[serde(rename = "Cid")]
    pub(crate) container_id: String,
    #[serde(rename = "Eps", default)]
    pub(crate) eps: Vec<EndpointRef>,
    #[serde(rename = "EpPriority", default)]
    pub(crate) ep_priority: BTreeMap<String, i32>,
    #[serde(rename = "ExtDNS", default)]
    pub(crate) ext_dns: Vec<ExtDns>,
    #[serde(skip)]
    db_index: u64,
    #[serde(skip)]
    db_exists: bool,
}

impl KvObject for SandboxRecord {
    fn key(&self) -> Vec<String> {
        vec![SANDBOX_KEY.to_string(), self.id.clone()]
    }
    fn key_prefix(&self) -> Vec<String> {
        vec![SANDBOX_KEY.to_string()]
    }
    fn index(&self) -> u64 {
        self.db_index
    }
    fn set_index(&mut self, index: u64) {
        self.db_index = index;
    }
    fn exists(&self) -> bool {
        self.db_exists
    }
    fn set_exists(&mut self) {
        self.db_exists = true;
    }
    fn data_scope(&self) -> DataScope {
        DataScope::Local
    }
}

impl Sandbox {
    fn record(&self) -> SandboxRecord {
        let state = self.inner.state.lock();
        SandboxRecord {
            id: self.id().to_string(),
            container_id: self.container_id().to_string(),
            eps: state
                .endpoints
                .iter()
                .map(|e| EndpointRef {
                    eid: e.ep.id.clone(),
                    nid: e.ep.network_id.clone(),
                })
                .collect(),
            ep_priority: state
                .endpoints
                .iter()
                .map(|e| (e.ep.id.clone(), e.priority))
                .collect(),
            ext_dns: state.ext_dns.clone(),
            db_index: state.db_index,
            db_exists: state.db_exists,
        }
    }

    /// Persist the sandbox. Failures are logged; the in-memory sandbox
    /// stays authoritative. A sandbox being deleted is never written.
    pub(crate) fn store_update(&self) {
        if self.in_delete() {
            return;
        }
        let Ok(ctrl) = self.controller() else {
            return;
        };
        let store = match ctrl.store_for(DataScope::Local) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(sandbox = %self.id(), error = %e, "No store for sandbox");
                return;
            }
        };

        for _ in 0..MAX_RETRIES {
            let mut record = self.record();
            match store.put_object_atomic(&mut record) {
                Ok(()) => {
                    let mut state = self.inner.state.lock();
                    state.db_index = record.index();
                    state.db_exists = true;
                    return;
                }
                Err(e) if e.is_retry() => {
                    // Someone else wrote the record; take its index and retry.
                    match store.get_object::<SandboxRecord>(&[SANDBOX_KEY, self.id()]) {
                        Ok(stored) => {
                            let mut state = self.inner.state.lock();
                            state.db_index = stored.index();
                            state.db_exists = true;
                        }
                        Err(ge) => {
                            tracing::warn!(sandbox = %self.id(), error = %ge, "Failed to reload sandbox record");
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(sandbox = %self.id(), error = %e, "Failed to store sandbox");
                    return;
                }
            }
        }
        tracing::warn!(sandbox = %self.id(), "Gave up storing sandbox after repeated conflicts");
    }

    pub(crate) fn store_delete(&self) {
        let Ok(ctrl) = self.controller() else {
            return;
        };
        let Ok(store) = ctrl.store_for(DataScope::Local) else {
            return;
        };
        let record = self.record();
        if !record.exists() {
            return;
        }
        if let Err(e) = store.delete_object(&record) {
            if !e.is_not_found() {
                tracing::warn!(sandbox = %self.id(), error = %e, "Failed to delete sandbox record");
            }
        }
    }

    /// Re-register the endpoints `record` lists after a restart. Interfaces
    /// already sit in the namespace, so they are only recorded, not moved.
    pub(crate) fn restore_from(&self, ctrl: &ControllerInner, record: &SandboxRecord) {
        {
            let mut state = self.inner.state.lock();
            state.db_index = record.index();
            state.db_exists = true;
            state.ext_dns.clone_from(&record.ext_dns);
        }

        for r in &record.eps {
            let restored = ctrl
                .network_from_store(&r.nid)
                .and_then(|n| ctrl.endpoint_from_store(&n, &r.eid).map(|ep| (n, ep)));
            let (n, ep) = match restored {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(sandbox = %self.id(), endpoint = %r.eid, error = %e, "Endpoint of restored sandbox not found");
                    continue;
                }
            };
            let multihost = ctrl
                .drivers
                .capability(&n.network_type)
                .is_ok_and(|cap| cap.is_multihost());
            let priority = record.ep_priority.get(&ep.id).copied().unwrap_or_default();
            self.add_endpoint(&ep, &n, priority, multihost);
            if let Err(e) = ctrl.claim_endpoint(&ep.id, self.id()) {
                tracing::warn!(sandbox = %self.id(), endpoint = %ep.name, error = %e, "Restored endpoint already claimed");
            }
            ctrl.watch_svc_record(&n, &ep);
            self.restore_interface(&ep);
        }

        let os = self.inner.state.lock().os.clone();
        if let (Some(os), Some(gw)) = (os, self.gateway_endpoint()) {
            os.restore_routes(gw.join_info.gw, gw.join_info.gw6, gw.join_info.static_routes.clone());
        }
        tracing::info!(sandbox = %self.id(), container = %self.container_id(), endpoints = record.eps.len(), "Sandbox restored");
    }

    fn restore_interface(&self, ep: &Endpoint) {
        let mut state = self.inner.state.lock();
        let Some(os) = state.os.clone() else {
            return;
        };
        if ep.iface.src_name.is_empty() {
            state.populated.insert(ep.id.clone());
            return;
        }
        let dst = os.restore_interface(&ep.iface.src_name, &ep.iface.dst_prefix, interface_options(ep));
        if let Some(entry) = state.endpoints.iter_mut().find(|e| e.ep.id == ep.id) {
            entry.dst_name = Some(dst);
        }
        state.populated.insert(ep.id.clone());
    }
}
