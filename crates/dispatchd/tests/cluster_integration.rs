//! Whole-cluster behavior over one embedded store: agents, election,
//! scheduling and failure handling running together.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dispatch_machine::{AgentConfig, MachineAgent, StaticLoad};
use dispatch_store::keys;
use dispatch_store::{CoordinationStore, EmbeddedStore, Keyspace};
use dispatch_supervisor::{Role, Supervisor, SupervisorConfig, UnitQueue};
use dispatch_unit::{RecordingSupervisor, Template, Unit, UnitContext, UnitFiles, UnitState};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const ZONE: &str = "z1";
const WAIT: Duration = Duration::from_secs(5);

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

struct Node {
    processes: Arc<RecordingSupervisor>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    _dir: TempDir,
}

impl Node {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

struct Cluster {
    store: EmbeddedStore,
    keys: Keyspace,
    /// Context used to declare units, as an API layer would.
    client: UnitContext,
    _client_dir: TempDir,
}

impl Cluster {
    fn new() -> Self {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let keys = Keyspace::new(ZONE);
        let dir = tempfile::tempdir().unwrap();
        let client = UnitContext::new(
            Arc::new(store.clone()),
            keys.clone(),
            Arc::new(RecordingSupervisor::new()),
            UnitFiles::new(dir.path()),
            "client",
        );
        Self {
            store,
            keys,
            client,
            _client_dir: dir,
        }
    }

    fn context(&self, machine: &str, processes: Arc<RecordingSupervisor>, dir: &TempDir) -> UnitContext {
        UnitContext::new(
            Arc::new(self.store.clone()),
            self.keys.clone(),
            processes,
            UnitFiles::new(dir.path()),
            machine,
        )
    }

    /// Start a machine agent with a fixed load.
    async fn machine(&self, name: &str, load: f64) -> Node {
        let dir = tempfile::tempdir().unwrap();
        let processes = Arc::new(RecordingSupervisor::new());
        let ctx = self.context(name, processes.clone(), &dir);

        let mut config = AgentConfig::new(name);
        config.keepalive_interval = Duration::from_millis(100);
        config.check_interval = Duration::from_millis(500);
        let agent = Arc::new(MachineAgent::new(ctx, config).with_load_source(Arc::new(StaticLoad(load))));

        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            agent.run(rx).await.unwrap();
        });

        let alive = self.keys.machine_alive(name);
        let load_key = self.keys.machine_field(name, keys::MACHINE_LOAD);
        assert!(
            eventually(|| async {
                self.store.get(&alive).await.unwrap().is_some()
                    && self.store.get(&load_key).await.unwrap().is_some()
            })
            .await
        );

        Node {
            processes,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    /// Start the supervisor election on a machine name.
    async fn supervisor(&self, machine: &str) -> (Arc<Supervisor>, Node) {
        let dir = tempfile::tempdir().unwrap();
        let processes = Arc::new(RecordingSupervisor::new());
        let ctx = self.context(machine, processes.clone(), &dir);
        let config = SupervisorConfig {
            keepalive_interval: Duration::from_millis(100),
            schedule_interval: Duration::from_millis(200),
            vacancy_check_interval: Duration::from_millis(200),
            retry_interval: Duration::from_millis(100),
            ..SupervisorConfig::default()
        };
        let supervisor = Arc::new(Supervisor::new(ctx, config));
        let mut roles = supervisor.subscribe();

        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(supervisor.clone().run(rx));
        tokio::time::timeout(WAIT, roles.wait_for(|r| *r == Role::Leader))
            .await
            .unwrap()
            .unwrap();

        let node = Node {
            processes,
            shutdown,
            handle,
            _dir: dir,
        };
        (supervisor, node)
    }

    async fn submit(&self, mut unit: Unit) -> String {
        UnitQueue::new(self.client.clone()).submit(&mut unit).await.unwrap();
        unit.name
    }

    async fn assigned_machine(&self, unit: &str) -> Option<String> {
        self.store
            .get_value(&self.keys.unit_field(unit, keys::UNIT_MACHINE))
            .await
            .unwrap()
    }

    async fn queued(&self, unit: &str) -> bool {
        self.store.get(&self.keys.queue_entry(unit)).await.unwrap().is_some()
    }

    async fn wait_assigned(&self, unit: &str, machine: &str) -> bool {
        eventually(|| async {
            self.assigned_machine(unit).await.as_deref() == Some(machine) && !self.queued(unit).await
        })
        .await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lower_load_machine_receives_unit() {
    let cluster = Cluster::new();
    let m1 = cluster.machine("m1", 0.2).await;
    let m2 = cluster.machine("m2", 0.5).await;
    let (_, sup) = cluster.supervisor("m1").await;

    let u1 = cluster
        .submit(Unit::new("u1").unwrap().with_content("[Service]\n").with_ports([80]))
        .await;

    assert!(cluster.wait_assigned(&u1, "m1").await);
    assert!(
        Unit::wait_on_state(&cluster.client, &u1, UnitState::Active, WAIT)
            .await
            .unwrap()
    );
    assert!(m1.processes.is_running(&u1));
    assert!(!m2.processes.is_running(&u1));

    sup.stop().await;
    m1.stop().await;
    m2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn port_conflict_moves_unit_to_other_machine() {
    let cluster = Cluster::new();
    let m1 = cluster.machine("m1", 0.1).await;
    let m2 = cluster.machine("m2", 0.9).await;
    let (_, sup) = cluster.supervisor("m1").await;

    let u1 = cluster.submit(Unit::new("u1").unwrap().with_ports([80])).await;
    assert!(cluster.wait_assigned(&u1, "m1").await);

    let u2 = cluster.submit(Unit::new("u2").unwrap().with_ports([80, 443])).await;
    assert!(cluster.wait_assigned(&u2, "m2").await);
    assert!(eventually(|| async { m2.processes.is_running(&u2) }).await);

    sup.stop().await;
    m1.stop().await;
    m2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn density_limit_waits_for_capacity() {
    let cluster = Cluster::new();
    Template::new("t-*.service", "[Service]\nExecStart=/bin/{{ name }}\n")
        .unwrap()
        .with_max_per_machine(1)
        .save(cluster.store_ref(), &cluster.keys)
        .await
        .unwrap();

    let m1 = cluster.machine("m1", 0.1).await;
    let (_, sup) = cluster.supervisor("m1").await;

    let template = Template::load(cluster.store_ref(), &cluster.keys, "t-*.service")
        .await
        .unwrap()
        .unwrap();
    let vars = std::collections::HashMap::new();
    let a = cluster.submit(template.new_unit("a", &vars).unwrap()).await;
    assert!(cluster.wait_assigned(&a, "m1").await);

    let b = cluster.submit(template.new_unit("b", &vars).unwrap()).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(cluster.queued(&b).await);
    assert_eq!(cluster.assigned_machine(&b).await, None);

    let m2 = cluster.machine("m2", 0.5).await;
    assert!(cluster.wait_assigned(&b, "m2").await);

    sup.stop().await;
    m1.stop().await;
    m2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_machine_lease_requeues_units() {
    let cluster = Cluster::new();
    let keys = &cluster.keys;
    let (_, sup) = cluster.supervisor("s1").await;

    // A machine represented only by its record: nothing renews the lease.
    let lease = cluster.store.grant_lease(Duration::from_secs(30)).await.unwrap();
    cluster.store.put(&keys.machine_alive("m1"), "m1", Some(lease)).await.unwrap();
    cluster.store.put(&keys.machine_field("m1", keys::MACHINE_LOAD), "0.1", None).await.unwrap();

    let u1 = cluster.submit(Unit::new("u1").unwrap()).await;
    assert!(cluster.wait_assigned(&u1, "m1").await);

    cluster.store.expire_lease(lease);
    assert!(
        eventually(|| async {
            cluster.queued(&u1).await && cluster.assigned_machine(&u1).await.is_none()
        })
        .await
    );
    assert!(cluster.store.get_prefix(&keys.machine("m1")).await.unwrap().is_empty());

    sup.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_machine_units_move_to_survivor() {
    let cluster = Cluster::new();
    let m1 = cluster.machine("m1", 0.1).await;
    let m2 = cluster.machine("m2", 0.8).await;
    let (_, sup) = cluster.supervisor("m2").await;

    let web = cluster.submit(Unit::new("web").unwrap().with_ports([8080])).await;
    assert!(cluster.wait_assigned(&web, "m1").await);

    m1.stop().await;
    assert!(cluster.wait_assigned(&web, "m2").await);
    assert!(eventually(|| async { m2.processes.is_running(&web) }).await);

    sup.stop().await;
    m2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destroy_is_idempotent() {
    let cluster = Cluster::new();
    let m1 = cluster.machine("m1", 0.1).await;
    let (_, sup) = cluster.supervisor("m1").await;

    let web = cluster.submit(Unit::new("web").unwrap().with_content("[Service]\n")).await;
    assert!(cluster.wait_assigned(&web, "m1").await);
    assert!(eventually(|| async { m1.processes.is_running(&web) }).await);

    let mut unit = Unit::load(&cluster.client, &web).await.unwrap().unwrap();
    unit.set_desired_state(&cluster.client, UnitState::Destroy).await.unwrap();
    assert!(Unit::wait_on_destroy(&cluster.client, &web, WAIT).await.unwrap());
    assert!(eventually(|| async { !m1.processes.is_running(&web) }).await);

    // A second destroy finds nothing and still succeeds.
    unit.destroy(&cluster.client).await.unwrap();
    unit.destroy(&cluster.client).await.unwrap();
    assert!(!Unit::exists(&cluster.client, &web).await.unwrap());
    assert!(cluster.store.get_prefix(&cluster.keys.unit(&web)).await.unwrap().is_empty());
    assert!(
        cluster
            .store
            .get(&cluster.keys.machine_unit("m1", &web))
            .await
            .unwrap()
            .is_none()
    );

    sup.stop().await;
    m1.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_units_run_everywhere() {
    let cluster = Cluster::new();
    let m1 = cluster.machine("m1", 0.1).await;
    let (_, sup) = cluster.supervisor("m1").await;

    let logs = cluster.submit(Unit::new("logs").unwrap().as_global()).await;
    assert!(eventually(|| async { m1.processes.is_running(&logs) }).await);
    assert!(!cluster.queued(&logs).await);

    // A machine joining later receives it too.
    let m2 = cluster.machine("m2", 0.1).await;
    assert!(eventually(|| async { m2.processes.is_running(&logs) }).await);

    sup.stop().await;
    m1.stop().await;
    m2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_supervisor_is_elected() {
    let cluster = Cluster::new();
    let dirs: Vec<TempDir> = (0..5).map(|_| tempfile::tempdir().unwrap()).collect();
    let candidates: Vec<Arc<Supervisor>> = dirs
        .iter()
        .enumerate()
        .map(|(i, dir)| {
            let ctx = cluster.context(&format!("m{i}"), Arc::new(RecordingSupervisor::new()), dir);
            Arc::new(Supervisor::new(ctx, SupervisorConfig::default()))
        })
        .collect();

    let attempts: Vec<_> = candidates
        .iter()
        .cloned()
        .map(|s| tokio::spawn(async move { s.campaign().await.unwrap() }))
        .collect();
    let mut winners = 0;
    for attempt in attempts {
        if attempt.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(
        candidates.iter().filter(|s| s.role() == Role::Leader).count(),
        1
    );
}

impl Cluster {
    fn store_ref(&self) -> &dyn CoordinationStore {
        &self.store
    }
}
