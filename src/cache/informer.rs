//! Watch-event consumer for one resource kind
//!
//! Feeds a reflector store and turns every observed change into a
//! [`ResourceEvent`] for the key translator. A relist (`Init` ...
//! `InitDone`) is buffered until the store swaps to the new listing, so keys
//! are never enqueued ahead of the state they should be reconciled against.

use std::collections::HashSet;

use futures::StreamExt;
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::controller::keys::{translate, ObjectHandle, ReconciliationKey, ResourceEvent, Watched};
use crate::queue::WorkQueue;

/// Watch timeout (seconds); must stay below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// In-progress relist
struct Relist<K: Watched> {
    seen: HashSet<ObjectRef<K>>,
    pending: Vec<ResourceEvent>,
}

/// Watch-event consumer for resources of type `K`
pub struct Informer<K: Watched> {
    writer: Writer<K>,
    reader: Store<K>,
    relist: Option<Relist<K>>,
}

impl<K: Watched> Informer<K> {
    /// Create an informer feeding `writer`
    pub fn new(writer: Writer<K>) -> Self {
        let reader = writer.as_reader();
        Self {
            writer,
            reader,
            relist: None,
        }
    }

    /// Reader half of the store this informer maintains
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Apply one watch event to the store and return the resulting changes
    pub fn handle(&mut self, event: watcher::Event<K>) -> Vec<ResourceEvent> {
        match &event {
            watcher::Event::Apply(obj) => {
                let old = self.cached_handle(obj);
                self.writer.apply_watcher_event(&event);
                vec![ResourceEvent::Applied {
                    old,
                    new: ObjectHandle::of(obj),
                }]
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                vec![ResourceEvent::Deleted {
                    last_known: ObjectHandle::of(obj),
                    tombstone: false,
                }]
            }
            watcher::Event::Init => {
                trace!(kind = %K::KIND, "relist started");
                self.writer.apply_watcher_event(&event);
                self.relist = Some(Relist {
                    seen: HashSet::new(),
                    pending: Vec::new(),
                });
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let old = self.cached_handle(obj);
                self.writer.apply_watcher_event(&event);
                let relist = self.relist.get_or_insert_with(|| Relist {
                    seen: HashSet::new(),
                    pending: Vec::new(),
                });
                relist.seen.insert(ObjectRef::from_obj(obj));
                relist.pending.push(ResourceEvent::Applied {
                    old,
                    new: ObjectHandle::of(obj),
                });
                Vec::new()
            }
            watcher::Event::InitDone => {
                let before = self.reader.state();
                self.writer.apply_watcher_event(&event);

                let Relist { seen, mut pending } = self.relist.take().unwrap_or(Relist {
                    seen: HashSet::new(),
                    pending: Vec::new(),
                });

                // objects that vanished while the watch was down
                let mut tombstones = 0usize;
                for obj in before {
                    if !seen.contains(&ObjectRef::from_obj(obj.as_ref())) {
                        tombstones += 1;
                        pending.push(ResourceEvent::Deleted {
                            last_known: ObjectHandle::of(obj.as_ref()),
                            tombstone: true,
                        });
                    }
                }

                debug!(
                    kind = %K::KIND,
                    objects = seen.len(),
                    tombstones,
                    "relist complete"
                );
                pending
            }
        }
    }

    fn cached_handle(&self, obj: &K) -> Option<ObjectHandle> {
        self.reader
            .get(&ObjectRef::from_obj(obj))
            .map(|cached| ObjectHandle::of(cached.as_ref()))
    }

    /// Consume the watch stream until `shutdown` fires
    ///
    /// Every change is translated and added to `queue`; the reconciler is
    /// never called from here.
    pub async fn run(
        mut self,
        api: Api<K>,
        queue: WorkQueue<ReconciliationKey>,
        shutdown: CancellationToken,
    ) {
        let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = watcher(api, config).default_backoff();
        futures::pin_mut!(stream);

        info!(kind = %K::KIND, "starting informer");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        for change in self.handle(event) {
                            if let Some(key) = translate(&change) {
                                trace!(kind = %K::KIND, key = %key, "enqueue");
                                queue.add(key);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(kind = %K::KIND, error = %e, "watch error, retrying");
                    }
                    None => break,
                },
            }
        }

        info!(kind = %K::KIND, "informer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector;

    use crate::controller::keys::ResourceKind;

    fn pod(namespace: &str, name: &str, rv: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn informer() -> Informer<Pod> {
        let (_, writer) = reflector::store::<Pod>();
        Informer::new(writer)
    }

    fn keys(events: &[ResourceEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(translate)
            .map(|k| k.as_str().to_string())
            .collect()
    }

    #[test]
    fn apply_reports_previous_cached_version() {
        let mut inf = informer();

        let first = inf.handle(watcher::Event::Apply(pod("team-a", "nb", "1")));
        assert!(matches!(&first[..], [ResourceEvent::Applied { old: None, .. }]));

        let second = inf.handle(watcher::Event::Apply(pod("team-a", "nb", "2")));
        match &second[..] {
            [ResourceEvent::Applied { old: Some(old), new }] => {
                assert_eq!(old.resource_version.as_deref(), Some("1"));
                assert_eq!(new.resource_version.as_deref(), Some("2"));
                assert_eq!(new.kind, ResourceKind::Pod);
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(inf.store().state().len(), 1);
    }

    #[test]
    fn delete_removes_from_store_and_reports_last_state() {
        let mut inf = informer();
        inf.handle(watcher::Event::Apply(pod("team-a", "nb", "1")));

        let events = inf.handle(watcher::Event::Delete(pod("team-a", "nb", "2")));
        assert!(matches!(
            &events[..],
            [ResourceEvent::Deleted { tombstone: false, .. }]
        ));
        assert!(inf.store().state().is_empty());
        assert_eq!(keys(&events), vec!["team-a"]);
    }

    #[test]
    fn initial_list_is_released_on_init_done() {
        let mut inf = informer();

        assert!(inf.handle(watcher::Event::Init).is_empty());
        assert!(inf
            .handle(watcher::Event::InitApply(pod("team-a", "nb", "1")))
            .is_empty());
        assert!(inf
            .handle(watcher::Event::InitApply(pod("team-b", "nb", "1")))
            .is_empty());

        let events = inf.handle(watcher::Event::InitDone);
        assert_eq!(keys(&events), vec!["team-a", "team-b"]);
        assert_eq!(inf.store().state().len(), 2);
    }

    #[test]
    fn relist_suppresses_unchanged_and_tombstones_missing_objects() {
        let mut inf = informer();
        inf.handle(watcher::Event::Init);
        inf.handle(watcher::Event::InitApply(pod("team-a", "kept", "1")));
        inf.handle(watcher::Event::InitApply(pod("team-b", "gone", "1")));
        inf.handle(watcher::Event::InitDone);

        // watch reconnects; "gone" was deleted while disconnected
        inf.handle(watcher::Event::Init);
        inf.handle(watcher::Event::InitApply(pod("team-a", "kept", "1")));
        let events = inf.handle(watcher::Event::InitDone);

        assert_eq!(keys(&events), vec!["team-b"]);
        assert!(events.iter().any(|e| matches!(
            e,
            ResourceEvent::Deleted { tombstone: true, last_known } if last_known.name == "gone"
        )));
        assert_eq!(inf.store().state().len(), 1);
    }
}
