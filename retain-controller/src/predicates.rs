use kube::Resource;
use kube_runtime::{reflector::ObjectRef, watcher::Event};
use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
};

/// Reduces a watch event stream to the objects whose spec changed.
///
/// Objects seen for the first time are admitted (create), updates only if
/// `metadata.generation` changed, deletions never. Status-only writes do not
/// bump the generation, so the controller's own status patches do not trigger
/// another reconcile.
pub(crate) struct GenerationPredicate<K: Resource>
where
    K::DynamicType: Eq + Hash,
{
    generations: HashMap<ObjectRef<K>, Option<i64>>,
    /// Objects listed by an in-progress relist.
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K: Resource> Default for GenerationPredicate<K>
where
    K::DynamicType: Eq + Hash,
{
    fn default() -> Self {
        Self {
            generations: Default::default(),
            relisted: None,
        }
    }
}

impl<K> GenerationPredicate<K>
where
    K: Resource,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn admit(&mut self, event: Event<K>) -> Option<K> {
        match event {
            Event::Apply(obj) => self.changed(obj),
            Event::InitApply(obj) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(ObjectRef::from_obj(&obj));
                }
                self.changed(obj)
            }
            Event::Delete(obj) => {
                self.generations.remove(&ObjectRef::from_obj(&obj));
                None
            }
            Event::Init => {
                self.relisted = Some(Default::default());
                None
            }
            Event::InitDone => {
                // Whatever the relist did not return was deleted in the meantime.
                if let Some(relisted) = self.relisted.take() {
                    self.generations.retain(|key, _| relisted.contains(key));
                }
                None
            }
        }
    }

    fn changed(&mut self, obj: K) -> Option<K> {
        let generation = obj.meta().generation;
        match self.generations.insert(ObjectRef::from_obj(&obj), generation) {
            Some(previous) if previous == generation => None,
            _ => Some(obj),
        }
    }
}

/// Keep only deletions of a watch event stream.
pub(crate) fn deleted<K>(event: Event<K>) -> Option<K> {
    match event {
        Event::Delete(obj) => Some(obj),
        _ => None,
    }
}
