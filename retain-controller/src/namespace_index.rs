use kube::ResourceExt;
use kube_runtime::{reflector::ObjectRef, watcher::Event};
use retain_controller_apis::Retainer;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, RwLock},
};

#[derive(Default)]
struct Entries {
    /// followed namespace -> names of the Retainers following into it
    by_namespace: HashMap<String, BTreeSet<String>>,
    /// Retainer name -> followed namespace
    by_name: HashMap<String, String>,
}

impl Entries {
    fn insert(&mut self, retainer: &Retainer) {
        let name = retainer.name_any();
        self.remove(&name);
        if let Some(namespace) = retainer.followed_namespace() {
            self.by_namespace
                .entry(namespace.to_string())
                .or_default()
                .insert(name.clone());
            self.by_name.insert(name, namespace.to_string());
        }
    }

    fn remove(&mut self, name: &str) {
        if let Some(namespace) = self.by_name.remove(name) {
            if let Some(names) = self.by_namespace.get_mut(&namespace) {
                names.remove(name);
                if names.is_empty() {
                    self.by_namespace.remove(&namespace);
                }
            }
        }
    }
}

#[derive(Default)]
struct State {
    live: Entries,
    /// Entries collected by an in-progress relist, swapped in on completion.
    rebuilding: Option<Entries>,
}

/// Secondary index of Retainers by `spec.followObjectRef.namespace`.
///
/// Fed from the same watch events that update the Retainer cache, so both
/// stay consistent. A relist rebuilds the index aside and swaps it in
/// atomically once the list is complete.
#[derive(Clone, Default)]
pub(crate) struct NamespaceIndex {
    state: Arc<RwLock<State>>,
}

impl NamespaceIndex {
    pub fn apply(&self, event: &Event<Retainer>) {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let state = &mut *guard;
        match event {
            Event::Apply(retainer) => state.live.insert(retainer),
            Event::Delete(retainer) => state.live.remove(&retainer.name_any()),
            Event::Init => state.rebuilding = Some(Entries::default()),
            Event::InitApply(retainer) => match state.rebuilding.as_mut() {
                Some(entries) => entries.insert(retainer),
                None => state.live.insert(retainer),
            },
            Event::InitDone => {
                if let Some(entries) = state.rebuilding.take() {
                    state.live = entries;
                }
            }
        }
    }

    /// Names of all Retainers following an object in `namespace`.
    pub fn lookup(&self, namespace: &str) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .live
            .by_namespace
            .get(namespace)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retainers to reconcile after `namespace` was deleted.
    ///
    /// Only Retainers in a mode that follows an object are affected; `get`
    /// looks up the current Retainer by name in the cache.
    pub fn retainers_to_enqueue<F>(&self, namespace: &str, get: F) -> Vec<ObjectRef<Retainer>>
    where
        F: Fn(&str) -> Option<Arc<Retainer>>,
    {
        self.lookup(namespace)
            .into_iter()
            .filter(|name| {
                get(name).is_some_and(|retainer| {
                    retainer.followed_namespace() == Some(namespace)
                        && retainer
                            .spec
                            .mode()
                            .is_ok_and(|mode| mode.follows_object())
                })
            })
            .map(|name| {
                info!(
                    "requeue Retainer {} due to deletion of namespace {}",
                    name, namespace
                );
                ObjectRef::new(&name)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use retain_controller_apis::{FollowObjectRef, RetainerSpec};

    fn retainer(name: &str, mode: &str, namespace: &str) -> Retainer {
        Retainer {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: RetainerSpec {
                mode: mode.to_string(),
                follow_object_ref: Some(FollowObjectRef {
                    api_version: "v1".to_string(),
                    kind: "Pod".to_string(),
                    namespace: namespace.to_string(),
                    name: "p".to_string(),
                    uid: "u1".to_string(),
                }),
                ttl: Some("1h".to_string()),
            },
            status: None,
        }
    }

    fn cache(retainers: &[Retainer]) -> impl Fn(&str) -> Option<Arc<Retainer>> + '_ {
        move |name| {
            retainers
                .iter()
                .find(|r| r.name_any() == name)
                .map(|r| Arc::new(r.clone()))
        }
    }

    #[test]
    fn follows_adds_moves_and_removes() {
        let index = NamespaceIndex::default();
        index.apply(&Event::Apply(retainer("r1", "FollowObject", "n1")));
        index.apply(&Event::Apply(retainer("r2", "FollowObject", "n1")));
        assert_eq!(vec!["r1", "r2"], index.lookup("n1"));

        index.apply(&Event::Apply(retainer("r1", "FollowObject", "n2")));
        assert_eq!(vec!["r2"], index.lookup("n1"));
        assert_eq!(vec!["r1"], index.lookup("n2"));

        // Cluster-scoped targets are not indexed.
        index.apply(&Event::Apply(retainer("r2", "FollowObject", "")));
        assert!(index.lookup("n1").is_empty());

        index.apply(&Event::Delete(retainer("r1", "FollowObject", "n2")));
        assert!(index.lookup("n2").is_empty());
        assert!(index.state.read().unwrap().live.by_namespace.is_empty());
    }

    #[test]
    fn relist_replaces_the_index() {
        let index = NamespaceIndex::default();
        index.apply(&Event::Apply(retainer("r1", "FollowObject", "n1")));

        index.apply(&Event::Init);
        index.apply(&Event::InitApply(retainer("r2", "FollowObject", "n1")));
        // The previous entries stay visible until the relist completes.
        assert_eq!(vec!["r1"], index.lookup("n1"));
        index.apply(&Event::InitDone);
        assert_eq!(vec!["r2"], index.lookup("n1"));
    }

    #[test]
    fn namespace_deletion_enqueues_following_retainers() {
        let retainers = vec![
            retainer("r1", "FollowObject", "n"),
            retainer("r2", "TTL", "n"),
            retainer("r3", "FollowObjectWithTTL", "n"),
            retainer("r4", "FollowObject", "other"),
        ];
        let index = NamespaceIndex::default();
        for r in &retainers {
            index.apply(&Event::Apply(r.clone()));
        }
        let enqueued = index.retainers_to_enqueue("n", cache(&retainers));
        assert_eq!(vec![ObjectRef::new("r1"), ObjectRef::new("r3")], enqueued);
        assert!(index.retainers_to_enqueue("unused", cache(&retainers)).is_empty());
    }

    #[test]
    fn stale_index_entries_are_skipped() {
        let index = NamespaceIndex::default();
        index.apply(&Event::Apply(retainer("r1", "FollowObject", "n")));
        // The cache already knows r1 follows another namespace.
        let current = vec![retainer("r1", "FollowObject", "elsewhere")];
        assert!(index.retainers_to_enqueue("n", cache(&current)).is_empty());
        assert!(index.retainers_to_enqueue("n", cache(&[])).is_empty());
    }
}
