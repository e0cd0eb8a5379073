use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use olm_core::{Gvk, Object, ObjectKey};
use serde_json::Value as Json;

use crate::{ClusterGateway, GatewayError, GatewayOp};

/// Called with each freshly created object; returned objects are upserted after it.
/// Stands in for the controllers that react to a create in a real cluster.
pub type Reactor = Arc<dyn Fn(&Object) -> Vec<Object> + Send + Sync>;

#[derive(Default)]
struct State {
    objects: BTreeMap<(Gvk, ObjectKey), Object>,
    get_faults: HashMap<(Gvk, ObjectKey), String>,
    create_fault: Option<String>,
    delete_fault: Option<String>,
    creates: usize,
    deletes: usize,
    gets: usize,
    deleted: Vec<(Gvk, ObjectKey)>,
}

/// In-process cluster. Objects live in a map keyed by GVK and namespaced name.
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
    reactor: Option<Reactor>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reactor(reactor: Reactor) -> Self {
        Self { state: Mutex::default(), reactor: Some(reactor) }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test thread panicked mid-update; the map is still usable.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn upsert(&self, obj: Object) {
        self.state().objects.insert((obj.gvk().clone(), obj.key().clone()), obj);
    }

    pub fn remove(&self, gvk: &Gvk, key: &ObjectKey) -> Option<Object> {
        self.state().objects.remove(&(gvk.clone(), key.clone()))
    }

    pub fn contains(&self, gvk: &Gvk, key: &ObjectKey) -> bool {
        self.state().objects.contains_key(&(gvk.clone(), key.clone()))
    }

    pub fn object(&self, gvk: &Gvk, key: &ObjectKey) -> Option<Object> {
        self.state().objects.get(&(gvk.clone(), key.clone())).cloned()
    }

    /// Overwrite `.status` of a stored object. Returns false when the object is absent.
    pub fn set_status(&self, gvk: &Gvk, key: &ObjectKey, status: Json) -> bool {
        let mut st = self.state();
        match st.objects.remove(&(gvk.clone(), key.clone())) {
            Some(obj) => {
                st.objects.insert((gvk.clone(), key.clone()), obj.with_status(status));
                true
            }
            None => false,
        }
    }

    /// Make every `get` of this object fail with a transport error until cleared.
    pub fn fail_get(&self, gvk: &Gvk, key: &ObjectKey, message: &str) {
        self.state().get_faults.insert((gvk.clone(), key.clone()), message.to_string());
    }

    pub fn clear_get_fault(&self, gvk: &Gvk, key: &ObjectKey) {
        self.state().get_faults.remove(&(gvk.clone(), key.clone()));
    }

    pub fn fail_creates(&self, message: &str) {
        self.state().create_fault = Some(message.to_string());
    }

    pub fn fail_deletes(&self, message: &str) {
        self.state().delete_fault = Some(message.to_string());
    }

    pub fn create_calls(&self) -> usize {
        self.state().creates
    }

    pub fn delete_calls(&self) -> usize {
        self.state().deletes
    }

    pub fn get_calls(&self) -> usize {
        self.state().gets
    }

    /// Every object removed through `delete`, in order.
    pub fn deleted(&self) -> Vec<(Gvk, ObjectKey)> {
        self.state().deleted.clone()
    }

    pub fn len(&self) -> usize {
        self.state().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ClusterGateway for MemoryGateway {
    async fn create(&self, objects: &[Object]) -> Result<(), GatewayError> {
        let mut created = Vec::new();
        {
            let mut st = self.state();
            st.creates += 1;
            for obj in objects {
                if let Some(msg) = st.create_fault.clone() {
                    return Err(GatewayError::transport(GatewayOp::Create, obj.gvk(), obj.key(), msg));
                }
                let id = (obj.gvk().clone(), obj.key().clone());
                if st.objects.contains_key(&id) {
                    continue;
                }
                st.objects.insert(id, obj.clone());
                created.push(obj.clone());
            }
        }
        if let Some(react) = self.reactor.as_ref() {
            for obj in &created {
                for follow in react(obj) {
                    self.upsert(follow);
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, objects: &[Object]) -> Result<(), GatewayError> {
        let mut st = self.state();
        st.deletes += 1;
        for obj in objects {
            if let Some(msg) = st.delete_fault.clone() {
                return Err(GatewayError::transport(GatewayOp::Delete, obj.gvk(), obj.key(), msg));
            }
            let id = (obj.gvk().clone(), obj.key().clone());
            if st.objects.remove(&id).is_some() {
                st.deleted.push(id);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &ObjectKey, gvk: &Gvk) -> Result<Object, GatewayError> {
        let mut st = self.state();
        st.gets += 1;
        let id = (gvk.clone(), key.clone());
        if let Some(msg) = st.get_faults.get(&id) {
            return Err(GatewayError::transport(GatewayOp::Get, gvk, key, msg.clone()));
        }
        st.objects
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound { gvk: gvk.clone(), key: key.clone() })
    }

    async fn list(&self, namespace: &str, gvk: &Gvk) -> Result<Vec<Object>, GatewayError> {
        let st = self.state();
        Ok(st
            .objects
            .iter()
            .filter(|((g, k), _)| g == gvk && (namespace.is_empty() || k.namespace == namespace))
            .map(|(_, o)| o.clone())
            .collect())
    }
}
