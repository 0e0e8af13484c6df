use super::*;
use crate::translate::translate;
use gantry_controller_core::{
    http_route::HttpRouteMatch,
    ir::{self, Backend, Endpoint, GatewayIr, Protocol, Route, RouteAction, RouteId, WeightedBackend},
    ObjectId,
};
use maplit::btreemap;
use tokio_test::{assert_pending, assert_ready, task};

fn group() -> GroupId {
    GroupId::new("ns", "gw")
}

fn resources(endpoints: &[&str]) -> Resources {
    let backend = "backend/ns/b".to_string();
    let ir = GatewayIr {
        id: group(),
        listeners: vec![ir::Listener {
            name: "http".to_string(),
            bind: ([0, 0, 0, 0], 80).into(),
            hostname: None,
            protocol: Protocol::Http,
            routes: vec![Route {
                id: RouteId {
                    route: ObjectId::new("ns", "r"),
                    rule: 0,
                    match_index: 0,
                },
                creation_timestamp: None,
                hostnames: vec![],
                matches: HttpRouteMatch::default(),
                action: RouteAction::Forward(vec![WeightedBackend {
                    name: backend.clone(),
                    weight: 1,
                }]),
                policies: vec![],
                priority: 0,
            }],
        }],
        backends: btreemap! {
            backend.clone() => Backend {
                name: backend,
                endpoints: endpoints
                    .iter()
                    .map(|addr| Endpoint {
                        addr: addr.parse().expect("socket address"),
                        weight: 1,
                        healthy: true,
                    })
                    .collect(),
            },
        },
    };
    translate(&ir).expect("translates")
}

#[test]
fn versions_advance_only_on_change() {
    let cache = SnapshotCache::default();
    assert_eq!(
        cache.publish(&group(), resources(&["10.0.0.1:80"])),
        Publish::Updated { version: 1 }
    );
    assert_eq!(
        cache.publish(&group(), resources(&["10.0.0.1:80"])),
        Publish::Unchanged { version: 1 }
    );

    assert_eq!(
        cache.publish(&group(), resources(&[])),
        Publish::Updated { version: 2 }
    );
    let snapshot = cache.get(&group()).expect("published");
    assert_eq!(snapshot.version(), 2);
    for ty in ResourceType::ALL {
        let expected = if ty == ResourceType::ClusterLoadAssignment {
            2
        } else {
            1
        };
        assert_eq!(snapshot.get(ty).version, expected, "{ty}");
    }
}

#[test]
fn watchers_observe_publishes_and_removal() {
    let cache = SnapshotCache::default();
    let mut rx = cache.watch(&group());
    assert!(rx.borrow_and_update().is_none());

    {
        let mut changed = task::spawn(rx.changed());
        assert_pending!(changed.poll());
        cache.publish(&group(), resources(&["10.0.0.1:80"]));
        assert!(changed.is_woken());
        assert_ready!(changed.poll()).expect("sender is alive");
    }
    let version = rx.borrow_and_update().as_ref().map(|s| s.version());
    assert_eq!(version, Some(1));
    assert_eq!(cache.groups(), vec![group()]);

    cache.remove(&group());
    assert!(rx.has_changed().expect("sender is alive"));
    assert!(rx.borrow_and_update().is_none());
    assert!(cache.get(&group()).is_none());
    assert!(cache.groups().is_empty());
}

#[test]
fn versions_survive_removal() {
    let cache = SnapshotCache::default();
    cache.publish(&group(), resources(&["10.0.0.1:80"]));
    cache.publish(&group(), resources(&["10.0.0.2:80"]));
    cache.remove(&group());

    // Identical content is still published as a new version.
    assert_eq!(
        cache.publish(&group(), resources(&["10.0.0.2:80"])),
        Publish::Updated { version: 3 }
    );
    let snapshot = cache.get(&group()).expect("published");
    assert!(ResourceType::ALL
        .into_iter()
        .all(|ty| snapshot.get(ty).version == 3));
}

#[test]
fn groups_are_independent() {
    let cache = SnapshotCache::default();
    let other = GroupId::new("ns", "other");
    cache.publish(&group(), resources(&["10.0.0.1:80"]));
    cache.publish(&other, resources(&["10.0.0.1:80"]));
    cache.publish(&other, resources(&[]));

    assert_eq!(cache.get(&group()).map(|s| s.version()), Some(1));
    assert_eq!(cache.get(&other).map(|s| s.version()), Some(2));
    assert_eq!(cache.get(&other).map(|s| s.group().clone()), Some(other));
}

#[test]
fn unpublished_groups_are_dropped_without_watchers() {
    let cache = SnapshotCache::default();
    for i in 0..1000 {
        drop(cache.watch(&GroupId::new("ns", format!("gw-{i}"))));
    }
    assert!(cache.groups.read().len() <= 1);

    // Published groups keep their version after removal.
    cache.publish(&group(), resources(&["10.0.0.1:80"]));
    cache.remove(&group());

    // A watched group survives until it is first published.
    let pending = GroupId::new("ns", "pending");
    let mut rx = cache.watch(&pending);
    drop(cache.watch(&GroupId::new("ns", "gone")));
    drop(cache.watch(&GroupId::new("ns", "gone-too")));
    assert_eq!(cache.groups.read().len(), 3);

    cache.publish(&pending, resources(&["10.0.0.1:80"]));
    assert!(rx.has_changed().expect("sender is alive"));
    let version = rx.borrow_and_update().as_ref().map(|s| s.version());
    assert_eq!(version, Some(1));
    assert_eq!(
        cache.publish(&group(), resources(&["10.0.0.1:80"])),
        Publish::Updated { version: 2 }
    );
}
