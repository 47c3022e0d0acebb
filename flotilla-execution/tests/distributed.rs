use async_trait::async_trait;
use flotilla_config::{DistributionConfig, FlotillaConfig, LauncherKind, Validatable};
use flotilla_core::{RunError, TaskError, TaskStatus};
use flotilla_execution::launcher::RemoteWorkerJob;
use flotilla_execution::{
    query_mapped_jobs, DistributedPoolFactory, ExecutionError, InProcessLauncher, LaunchError, LaunchHandle,
    LaunchJob, LaunchOutcome, Launcher, LocalWorker, MasterWorkerExecutor, NodeRunner, OperationRegistry,
    PoolOptions, RemoteWorkerOptions, RemoteWorkerServer, RpcWorkerPool, RunReport, ServerState, StaticMaster,
    Worker, RESULTS_FILE,
};
use flotilla_ipc::ServerOptions;
use flotilla_resilience::Scoped;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const RPC_TIMEOUT: Duration = Duration::from_secs(5);

fn registry() -> OperationRegistry {
    let mut registry = OperationRegistry::with_builtins(None);
    registry.register_fn("square", |input: JsonValue| {
        let n = input
            .as_i64()
            .ok_or_else(|| TaskError::new(format!("not a number: {}", input)))?;
        Ok(json!(n * n))
    });
    registry
}

fn worker_options() -> RemoteWorkerOptions {
    RemoteWorkerOptions {
        idle_timeout: Duration::from_secs(30),
        rpc_timeout: RPC_TIMEOUT,
        server: ServerOptions {
            heartbeat_interval: Duration::from_millis(50),
            ..ServerOptions::loopback()
        },
    }
}

async fn start_worker(name: &str, registry: OperationRegistry) -> RemoteWorkerServer {
    let worker: Arc<dyn Worker> = Arc::new(LocalWorker::new(name, Arc::new(registry)));
    RemoteWorkerServer::start(worker, &worker_options()).await.unwrap()
}

async fn loopback_pool(max_attempts: u32) -> RpcWorkerPool {
    RpcWorkerPool::bind(PoolOptions::new(max_attempts), ServerOptions::loopback(), RPC_TIMEOUT)
        .await
        .unwrap()
}

fn loopback_distribution(worker_count: u32) -> DistributionConfig {
    DistributionConfig {
        worker_count,
        bind_address: "127.0.0.1".to_string(),
        rpc_timeout: RPC_TIMEOUT,
        idle_timeout: Duration::from_secs(30),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_map_over_remote_workers() {
    let pool = loopback_pool(2).await;
    let first = start_worker("first", registry()).await;
    let second = start_worker("second", registry()).await;
    first.register_with_pool(&pool.endpoints(), RPC_TIMEOUT).await.unwrap();
    second.register_with_pool(&pool.endpoints(), RPC_TIMEOUT).await.unwrap();

    let items: Vec<JsonValue> = (1..=10).map(|n| json!(n)).collect();
    let results = pool.map("square", items).await.unwrap();
    let values: Vec<JsonValue> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(values, (1..=10).map(|n| json!(n * n)).collect::<Vec<_>>());

    let batches = pool.describe_mapped_jobs();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].iter().all(|t| t.status() == TaskStatus::Completed));
    assert!(batches[0].iter().all(|t| t.worker_name.is_some()));

    // Task failures come back as task errors and do not cost the worker
    let results = pool.map("square", vec![json!("x"), json!(3)]).await.unwrap();
    match &results[0] {
        Err(RunError::Task(e)) => assert!(e.message.contains("not a number")),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(results[1], Ok(json!(9)));
    assert_eq!(pool.pool().active_workers(), 2);

    // Closing the pool tells every worker to stop
    pool.close().await.unwrap();
    for server in [&first, &second] {
        tokio::time::timeout(Duration::from_secs(5), server.closed().wait())
            .await
            .expect("remote worker did not close");
        assert_eq!(server.state(), ServerState::Closed);
    }
}

#[tokio::test]
async fn test_lost_worker_task_is_requeued() {
    let pool = loopback_pool(2).await;

    let mut hanging = OperationRegistry::new();
    hanging.register_async("work", |_input: JsonValue| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!("hanging"))
    });
    let doomed = start_worker("doomed", hanging).await;
    doomed.register_with_pool(&pool.endpoints(), RPC_TIMEOUT).await.unwrap();

    let mapping = {
        let pool = pool.pool().clone();
        tokio::spawn(async move { pool.map("work", vec![json!("only")]).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while doomed.state() != ServerState::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never reached the first worker");

    let mut steady = OperationRegistry::new();
    steady.register_fn("work", |_input: JsonValue| Ok(json!("steady")));
    let survivor = start_worker("survivor", steady).await;
    survivor.register_with_pool(&pool.endpoints(), RPC_TIMEOUT).await.unwrap();

    doomed.abort();

    let results = tokio::time::timeout(Duration::from_secs(10), mapping)
        .await
        .expect("map did not finish")
        .unwrap()
        .unwrap();
    assert_eq!(results, vec![Ok(json!("steady"))]);

    let snapshot = &pool.describe_mapped_jobs()[0][0];
    assert_eq!(snapshot.attempts.len(), 1);
    assert!(snapshot.attempts[0].error.contains("lost connection"));
    assert_eq!(pool.pool().active_workers(), 1);

    pool.close().await.unwrap();
    let _ = doomed.close().await;
    tokio::time::timeout(Duration::from_secs(5), survivor.closed().wait())
        .await
        .expect("surviving worker did not close");
}

#[tokio::test]
async fn test_factory_launches_workers() {
    let runner = NodeRunner::new(registry());
    let launcher = InProcessLauncher::new(runner);
    let factory = DistributedPoolFactory::new(loopback_distribution(3));

    let pool = factory
        .create(PoolOptions::new(2), &launcher, &launcher)
        .await
        .unwrap();
    assert_eq!(pool.launched(), 3);

    let results = pool.map("square", vec![json!(2), json!(4), json!(6)]).await.unwrap();
    assert_eq!(results, vec![Ok(json!(4)), Ok(json!(16)), Ok(json!(36))]);

    let endpoint = pool.endpoints()[0].clone();
    let batches = query_mapped_jobs(&endpoint, RPC_TIMEOUT).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 3);
    assert!(batches[0].iter().all(|t| t.resolved));

    tokio::time::timeout(Duration::from_secs(10), pool.close())
        .await
        .expect("pool did not close")
        .unwrap();
}

#[tokio::test]
async fn test_executor_with_local_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = FlotillaConfig::default();
    config.distribution = loopback_distribution(2);
    config.launcher.kind = LauncherKind::InProcess;
    config.output.directory = dir.path().join("run");
    config.coordinator.local_coordinator = true;
    config.coordinator.operation = "square".to_string();

    let executor = MasterWorkerExecutor::new(config).with_registry(registry());
    let master = StaticMaster::new(vec![json!(1), json!(2), json!("three")]);
    let report = tokio::time::timeout(Duration::from_secs(20), executor.run(&master))
        .await
        .expect("run did not finish")
        .unwrap();

    assert_eq!(report.failures(), 1);
    let output_dir = report.output_dir().to_path_buf();
    match report {
        RunReport::Completed { results, .. } => {
            assert_eq!(results[0], Ok(json!(1)));
            assert_eq!(results[1], Ok(json!(4)));
            assert!(results[2].is_err());
        }
        other => panic!("unexpected report: {:?}", other),
    }

    let results = std::fs::read_to_string(output_dir.join("results").join(RESULTS_FILE)).unwrap();
    assert_eq!(results.lines().count(), 3);
    assert!(results.lines().nth(2).unwrap().contains("\"failed\""));

    let summary = std::fs::read_to_string(output_dir.join("run_summary.txt")).unwrap();
    assert!(summary.contains("Listed 3 jobs"));
}

#[tokio::test]
async fn test_long_task_outlasts_short_rpc_timeout() {
    let distribution = DistributionConfig {
        rpc_timeout: Duration::from_millis(500),
        ..loopback_distribution(1)
    };
    distribution.validate().unwrap();

    let pool_server = ServerOptions {
        heartbeat_interval: distribution.heartbeat_interval(),
        ..ServerOptions::loopback()
    };
    let pool = RpcWorkerPool::bind(PoolOptions::new(1), pool_server, distribution.rpc_timeout)
        .await
        .unwrap();

    let mut slow = OperationRegistry::new();
    slow.register_async("slow", |input: JsonValue| async move {
        tokio::time::sleep(Duration::from_millis(1200)).await;
        Ok(input)
    });
    let worker: Arc<dyn Worker> = Arc::new(LocalWorker::new("slow", Arc::new(slow)));
    let options = RemoteWorkerJob::new(pool.endpoints(), &distribution, None).options();
    assert_eq!(options.server.heartbeat_interval, distribution.heartbeat_interval());
    let server = RemoteWorkerServer::start(worker, &options).await.unwrap();
    server.register_with_pool(&pool.endpoints(), distribution.rpc_timeout).await.unwrap();

    let results = tokio::time::timeout(Duration::from_secs(10), pool.map("slow", vec![json!("patient")]))
        .await
        .expect("map did not finish")
        .unwrap();
    assert_eq!(results, vec![Ok(json!("patient"))]);
    assert_eq!(pool.pool().active_workers(), 1);

    pool.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), server.closed().wait())
        .await
        .expect("worker did not close");
}

#[tokio::test]
async fn test_executor_with_launched_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = FlotillaConfig::default();
    config.distribution = loopback_distribution(2);
    config.launcher.kind = LauncherKind::InProcess;
    config.output.directory = dir.path().join("run");
    config.coordinator.local_coordinator = false;
    config.coordinator.operation = "square".to_string();

    let executor = MasterWorkerExecutor::new(config).with_registry(registry());
    let master = StaticMaster::new(vec![json!(3), json!(4), json!(5)]);
    let report = tokio::time::timeout(Duration::from_secs(20), executor.run(&master))
        .await
        .expect("run did not finish")
        .unwrap();

    assert_eq!(report.failures(), 0);
    let output_dir = report.output_dir().to_path_buf();
    match report {
        RunReport::Launched { outcome, .. } => assert_eq!(outcome, LaunchOutcome::Completed),
        other => panic!("unexpected report: {:?}", other),
    }

    let results = std::fs::read_to_string(output_dir.join("results").join(RESULTS_FILE)).unwrap();
    let values: Vec<JsonValue> = results
        .lines()
        .map(|line| serde_json::from_str::<JsonValue>(line).unwrap()["value"].clone())
        .collect();
    assert_eq!(values, vec![json!(9), json!(16), json!(25)]);
}

/// Runs workers in process and remembers the pool they were sent to
struct TrackingLauncher {
    runner: NodeRunner,
    pool_endpoints: Mutex<Vec<String>>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl Launcher for TrackingLauncher {
    fn name(&self) -> &'static str {
        "tracking"
    }

    async fn launch(&self, job: LaunchJob) -> Result<LaunchHandle, LaunchError> {
        if let LaunchJob::RemoteWorker(worker) = &job {
            *self.pool_endpoints.lock() = worker.pool_endpoints.clone();
        }
        let runner = self.runner.clone();
        let finished = self.finished.clone();
        let handle = tokio::spawn(async move {
            let result = runner.run(job).await;
            finished.store(true, Ordering::SeqCst);
            result
        });
        Ok(LaunchHandle::InProcess(handle))
    }
}

struct RejectingLauncher;

#[async_trait]
impl Launcher for RejectingLauncher {
    fn name(&self) -> &'static str {
        "rejecting"
    }

    async fn launch(&self, _job: LaunchJob) -> Result<LaunchHandle, LaunchError> {
        Err(LaunchError::Submission {
            program: "sbatch".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "invalid partition".to_string(),
        })
    }
}

#[tokio::test]
async fn test_factory_closes_pool_when_launch_fails() {
    let local = TrackingLauncher {
        runner: NodeRunner::new(registry()),
        pool_endpoints: Mutex::new(Vec::new()),
        finished: Arc::new(AtomicBool::new(false)),
    };
    let factory = DistributedPoolFactory::new(loopback_distribution(3));

    let err = factory
        .create(PoolOptions::new(2), &RejectingLauncher, &local)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::LaunchError(LaunchError::Submission { .. })));

    // The local worker launched before the failure has run to its end
    assert!(local.finished.load(Ordering::SeqCst));

    // and the pool no longer answers
    let endpoints = local.pool_endpoints.lock().clone();
    assert!(!endpoints.is_empty());
    assert!(query_mapped_jobs(&endpoints[0], Duration::from_secs(1)).await.is_err());
}
