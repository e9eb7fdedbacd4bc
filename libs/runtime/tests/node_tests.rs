//! Node Tests
//!
//! Spawning, setting up, starting and ending children through the node
//! process, within one runtime and across two runtimes on loopback.

use distproc::{
    Bindings, DistProcess, EventPattern, Handler, Node, Pattern, ProcessError, ProcessRegistry,
    ProcessType, Result, Runtime, Spawn,
};
use runtime_config::RuntimeConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use types::{ProcessId, Term};

const PATIENCE: Duration = Duration::from_secs(5);

fn config() -> RuntimeConfig {
    RuntimeConfig {
        hostname: "127.0.0.1".into(),
        command_timeout_ms: Some(5_000),
        ..RuntimeConfig::default()
    }
}

fn registry() -> ProcessRegistry {
    ProcessRegistry::new()
        .with::<Worker>()
        .with::<Pinger>()
        .with::<Ponger>()
}

fn wait_for_children(runtime: &Runtime) {
    let deadline = Instant::now() + PATIENCE;
    while runtime.live_children() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(runtime.live_children(), 0, "children still running");
}

fn collect(node: &mut DistProcess<Node>, name: &str, tag: &str) {
    node.add_event(
        EventPattern::received(name, Pattern::message(tag, [Pattern::free("v")])).history(),
    );
}

/// Reports its setup value to its parent, then idles until ended.
#[derive(Default)]
struct Worker {
    value: i64,
}

impl ProcessType for Worker {
    const TYPE_NAME: &'static str = "Worker";

    fn setup(process: &mut DistProcess<Self>, args: Vec<Term>) -> Result<()> {
        process.state.value = args
            .first()
            .and_then(Term::as_int)
            .ok_or_else(|| ProcessError::Setup("Worker expects an integer".into()))?;
        Ok(())
    }

    fn run(process: &mut DistProcess<Self>) -> Result<()> {
        if let Some(parent) = process.parent().cloned() {
            let value = process.state.value;
            process.send(Term::tuple([Term::from("Ready"), Term::Int(value)]), &parent)?;
        }
        process.await_until(|_| false, "idle", None)?;
        Ok(())
    }
}

#[derive(Default)]
struct Ponger;

impl ProcessType for Ponger {
    const TYPE_NAME: &'static str = "Ponger";

    fn events() -> Vec<EventPattern<Self>> {
        vec![
            EventPattern::received("ping", Pattern::message("Ping", [Pattern::free("from")]))
                .handler(Handler::new("reply", |p: &mut DistProcess<Ponger>, b: &Bindings| {
                    let from = b.pid("from")?;
                    p.send(Term::tuple([Term::from("Pong")]), &from)
                })),
        ]
    }

    fn run(process: &mut DistProcess<Self>) -> Result<()> {
        process.await_until(|_| false, "serve", None)?;
        Ok(())
    }
}

#[derive(Default)]
struct Pinger {
    peer: Option<ProcessId>,
    rounds: i64,
    pongs: i64,
}

impl ProcessType for Pinger {
    const TYPE_NAME: &'static str = "Pinger";

    fn events() -> Vec<EventPattern<Self>> {
        vec![
            EventPattern::received("pong", Pattern::message("Pong", [])).handler(Handler::new(
                "count",
                |p: &mut DistProcess<Pinger>, _: &Bindings| {
                    p.state.pongs += 1;
                    Ok(())
                },
            )),
        ]
    }

    fn setup(process: &mut DistProcess<Self>, args: Vec<Term>) -> Result<()> {
        match args.as_slice() {
            [Term::Pid(peer), Term::Int(rounds)] => {
                process.state.peer = Some(peer.clone());
                process.state.rounds = *rounds;
                Ok(())
            }
            other => Err(ProcessError::Setup(format!("Pinger setup: {other:?}"))),
        }
    }

    fn run(process: &mut DistProcess<Self>) -> Result<()> {
        let Some(peer) = process.state.peer.clone() else {
            return Ok(());
        };
        let me = process.id().clone();
        for round in 0..process.state.rounds {
            process.send(Term::tuple([Term::from("Ping"), Term::Pid(me.clone())]), &peer)?;
            if !process.await_until(|p| p.state.pongs > round, "wait", Some(PATIENCE))? {
                break;
            }
        }
        if let Some(parent) = process.parent().cloned() {
            let pongs = process.state.pongs;
            process.send(Term::tuple([Term::from("Done"), Term::Int(pongs)]), &parent)?;
        }
        Ok(())
    }
}

#[test_log::test]
fn test_children_lifecycle() {
    let rt = Runtime::start("lifecycle", config(), registry()).unwrap();
    let mut node = rt.node().unwrap();
    collect(&mut node, "ready", "Ready");

    let workers = node.new_processes(&Spawn::of::<Worker>().count(2)).unwrap();
    assert_eq!(workers.len(), 2);
    assert_eq!(node.children(), workers.as_slice());
    assert!(workers.iter().all(|w| w.pid_type() == "Worker"));

    node.setup(&workers, vec![Term::Int(7)]).unwrap();
    node.start(&workers).unwrap();
    let both = node
        .await_until(|n| n.history("ready").len() == 2, "collect", Some(PATIENCE))
        .unwrap();
    assert!(both);

    let ready = Pattern::message("Ready", [Pattern::free("v")]);
    let values = node.query_history("ready", &ready, &["v"]);
    assert_eq!(values, vec![vec![Term::Int(7)], vec![Term::Int(7)]]);
    let senders: Vec<ProcessId> = node
        .history("ready")
        .iter()
        .filter_map(|e| e.source.clone())
        .collect();
    assert!(senders.iter().all(|s| workers.contains(s)));

    let ended = node.end(&workers, 4).unwrap();
    assert_eq!(ended.len(), 2);
    assert!(ended.iter().all(|(_, code)| *code == 4));

    wait_for_children(&rt);
    node.shutdown().unwrap();
}

#[test_log::test]
fn test_ping_pong_with_setup_on_spawn() {
    let rt = Runtime::start("pingpong", config(), registry()).unwrap();
    let mut node = rt.node().unwrap();
    collect(&mut node, "done", "Done");

    let pongers = node
        .new_processes_with_setup(&Spawn::of::<Ponger>().named(["pong"]), vec![])
        .unwrap();
    assert_eq!(pongers[0].name(), Some("pong"));
    let pingers = node
        .new_processes_with_setup(
            &Spawn::of::<Pinger>(),
            vec![Term::Pid(pongers[0].clone()), Term::Int(3)],
        )
        .unwrap();

    node.start(&pongers).unwrap();
    node.start(&pingers).unwrap();
    let done = node
        .await_until(|n| !n.history("done").is_empty(), "collect", Some(PATIENCE))
        .unwrap();
    assert!(done);
    let done = Pattern::message("Done", [Pattern::free("v")]);
    assert_eq!(node.query_history("done", &done, &["v"]), vec![vec![Term::Int(3)]]);

    // the pinger has finished its body and still answers End
    let mut everyone = pingers.clone();
    everyone.extend(pongers);
    node.end(&everyone, 0).unwrap();
    wait_for_children(&rt);
    node.shutdown().unwrap();
}

#[test_log::test]
fn test_shutdown_ends_running_children() {
    let rt = Runtime::start("shutdown", config(), registry()).unwrap();
    let mut node = rt.node().unwrap();
    let workers = node
        .new_processes_with_setup(&Spawn::of::<Worker>().count(3), vec![Term::Int(1)])
        .unwrap();
    node.start(&workers).unwrap();
    assert_eq!(rt.live_children(), 3);

    node.shutdown().unwrap();
    assert_eq!(rt.live_children(), 0);
    assert!(!rt.router().is_local(&workers[0]));
}

#[test_log::test]
fn test_unknown_type_is_a_spawn_error() {
    let rt = Runtime::start("unknown", config(), registry()).unwrap();
    let mut node = rt.node().unwrap();
    let err = node.new_processes(&Spawn::new("Nope")).unwrap_err();
    assert!(matches!(err, ProcessError::Spawn { .. }), "{err}");
    assert!(node.children().is_empty());
    node.shutdown().unwrap();
}

#[test_log::test]
fn test_failed_setup_is_not_acknowledged() {
    let rt = Runtime::start("bad-setup", config(), registry()).unwrap();
    let mut node = rt.node().unwrap();
    node.set_command_timeout(Some(Duration::from_millis(200)));

    let workers = node.new_processes(&Spawn::of::<Worker>()).unwrap();
    let err = node.setup(&workers, vec![Term::from("seven")]).unwrap_err();
    assert!(matches!(err, ProcessError::Timeout { .. }), "{err}");

    node.set_command_timeout(Some(PATIENCE));
    node.shutdown().unwrap();
    assert_eq!(rt.live_children(), 0);
}

#[test_log::test]
fn test_start_before_setup_times_out() {
    let rt = Runtime::start("early-start", config(), registry()).unwrap();
    let mut node = rt.node().unwrap();
    node.set_command_timeout(Some(Duration::from_millis(200)));

    let workers = node.new_processes(&Spawn::of::<Worker>()).unwrap();
    let err = node.start(&workers).unwrap_err();
    assert!(matches!(err, ProcessError::Timeout { .. }), "{err}");

    node.set_command_timeout(Some(PATIENCE));
    node.shutdown().unwrap();
}

#[test_log::test]
fn test_only_one_node_process() {
    let rt = Runtime::start("single-node", config(), registry()).unwrap();
    let node = rt.node().unwrap();
    assert!(matches!(rt.node(), Err(ProcessError::Config(_))));
    assert_eq!(node.id(), rt.node_id());
    assert_eq!(node.id().pid_type(), "Node");
    node.shutdown().unwrap();
}

#[test_log::test]
fn test_two_nodes_spawn_and_resolve_remotely() {
    let rt_b = Runtime::start("node-b", config(), registry()).unwrap();
    let b_id = rt_b.node_id().clone();
    let b_port = rt_b.router().transports().addresses()[0].unwrap();

    let mut node_b = rt_b.node().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let server = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || -> Result<Vec<ProcessId>> {
            let mut node = node_b;
            while !stop.load(Ordering::Acquire) {
                node.serve(Duration::from_millis(50))?;
            }
            let nodes = node.nodes();
            node.shutdown()?;
            Ok(nodes)
        })
    };

    let rt_a = Runtime::start("node-a", config(), registry()).unwrap();
    let a_id = rt_a.node_id().clone();
    let mut node = rt_a.node().unwrap();
    collect(&mut node, "ready", "Ready");

    let peer = node.bootstrap("127.0.0.1", b_port).unwrap();
    assert_eq!(peer, b_id);
    assert_eq!(node.nodes(), vec![b_id.clone()]);

    let remote = node
        .new_processes_with_setup(
            &Spawn::of::<Worker>().named(["far"]).at(b_id.clone()),
            vec![Term::Int(5)],
        )
        .unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].name(), Some("far"));
    assert!(!rt_a.router().is_local(&remote[0]));
    assert!(node.children().is_empty(), "remote children belong to their node");

    assert_eq!(node.resolve("far").unwrap(), Some(remote[0].clone()));
    assert_eq!(node.resolve("nowhere").unwrap(), None);

    node.start(&remote).unwrap();
    let ready = node
        .await_until(|n| !n.history("ready").is_empty(), "collect", Some(PATIENCE))
        .unwrap();
    assert!(ready);
    assert_eq!(node.history("ready")[0].source.as_ref(), Some(&remote[0]));

    let ended = node.end(&remote, 2).unwrap();
    assert_eq!(ended, vec![(remote[0].clone(), 2)]);

    stop.store(true, Ordering::Release);
    let b_nodes = server.join().unwrap().unwrap();
    assert_eq!(b_nodes, vec![a_id]);
    node.shutdown().unwrap();
}
