use super::*;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// Records passes and holds each one until a permit is released.
struct Gate {
    started: Mutex<Vec<GroupId>>,
    finished: Mutex<Vec<GroupId>>,
    removed: Mutex<Vec<GroupId>>,
    permits: Semaphore,
}

#[async_trait::async_trait]
impl Reconcile for Gate {
    async fn reconcile(&self, group: GroupId) {
        self.started.lock().push(group.clone());
        self.permits
            .acquire()
            .await
            .expect("semaphore must not close")
            .forget();
        self.finished.lock().push(group);
    }

    fn remove(&self, group: &GroupId) {
        self.removed.lock().push(group.clone());
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            started: Mutex::default(),
            finished: Mutex::default(),
            removed: Mutex::default(),
            permits: Semaphore::new(0),
        }
    }
}

struct Harness {
    gate: Arc<Gate>,
    events: mpsc::UnboundedSender<GroupEvent>,
    drain: drain::Signal,
    task: JoinHandle<()>,
}

fn group() -> GroupId {
    GroupId::new("ns", "gw")
}

fn spawn() -> Harness {
    let gate = Arc::new(Gate::default());
    let (events, rx) = mpsc::unbounded_channel();
    let (drain, watch) = drain::channel();
    let scheduler = Scheduler::new(gate.clone(), rx, SchedulerMetrics::default());
    let task = tokio::spawn(scheduler.run(watch));
    Harness {
        gate,
        events,
        drain,
        task,
    }
}

/// Lets the scheduler and its passes run until they block.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(flavor = "current_thread")]
async fn changes_during_a_pass_coalesce_into_one_follow_up() {
    let h = spawn();

    h.events
        .send(GroupEvent::Changed(group()))
        .expect("scheduler is running");
    settle().await;
    assert_eq!(h.gate.started.lock().len(), 1);

    for _ in 0..3 {
        h.events
            .send(GroupEvent::Changed(group()))
            .expect("scheduler is running");
    }
    settle().await;
    // Still running the first pass.
    assert_eq!(h.gate.started.lock().len(), 1);

    h.gate.permits.add_permits(1);
    settle().await;
    assert_eq!(h.gate.finished.lock().len(), 1);
    assert_eq!(h.gate.started.lock().len(), 2);

    h.gate.permits.add_permits(1);
    settle().await;
    assert_eq!(h.gate.finished.lock().len(), 2);
    assert_eq!(h.gate.started.lock().len(), 2, "no further pass is needed");
}

#[tokio::test(flavor = "current_thread")]
async fn groups_reconcile_independently() {
    let h = spawn();
    let other = GroupId::new("ns", "other");

    h.events
        .send(GroupEvent::Changed(group()))
        .expect("scheduler is running");
    h.events
        .send(GroupEvent::Changed(other.clone()))
        .expect("scheduler is running");
    settle().await;

    let mut started = h.gate.started.lock().clone();
    started.sort();
    assert_eq!(started, vec![group(), other]);
}

#[tokio::test(flavor = "current_thread")]
async fn removal_cancels_the_running_pass() {
    let h = spawn();

    h.events
        .send(GroupEvent::Changed(group()))
        .expect("scheduler is running");
    settle().await;
    assert_eq!(*h.gate.started.lock(), vec![group()]);

    h.events
        .send(GroupEvent::Removed(group()))
        .expect("scheduler is running");
    settle().await;
    assert_eq!(*h.gate.removed.lock(), vec![group()]);

    // The aborted pass never completes, even once it could.
    h.gate.permits.add_permits(1);
    settle().await;
    assert!(h.gate.finished.lock().is_empty());

    // A group that comes back is reconciled from scratch.
    h.events
        .send(GroupEvent::Changed(group()))
        .expect("scheduler is running");
    settle().await;
    assert_eq!(h.gate.started.lock().len(), 2);
    assert_eq!(*h.gate.finished.lock(), vec![group()]);
}

#[tokio::test(flavor = "current_thread")]
async fn shutdown_waits_for_running_passes() {
    let Harness {
        gate,
        events,
        drain,
        task,
    } = spawn();

    events
        .send(GroupEvent::Changed(group()))
        .expect("scheduler is running");
    settle().await;

    let drained = tokio::spawn(drain.drain());
    settle().await;
    assert!(!drained.is_finished());
    assert!(!task.is_finished());

    gate.permits.add_permits(1);
    drained.await.expect("drain must complete");
    task.await.expect("scheduler must not panic");
    assert_eq!(*gate.finished.lock(), vec![group()]);
}
