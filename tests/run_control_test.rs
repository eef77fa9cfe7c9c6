//! End-to-end tests of the orchestrator against in-process peers over loopback TCP.

use async_trait::async_trait;
use daq_runcontrol::codec::file::{FileReader, FileVersion};
use daq_runcontrol::config::Configuration;
use daq_runcontrol::data_collector::{run_file_path, DataCollector};
use daq_runcontrol::error::AppResult;
use daq_runcontrol::event::Event;
use daq_runcontrol::receiver::{CommandHandler, CommandReceiver, PeerContext};
use daq_runcontrol::run_control::{RunControl, Target, TransitionOutcome, DATA_COLLECTOR, LOG_COLLECTOR};
use daq_runcontrol::settings::{PeerSettings, RunControlSettings};
use daq_runcontrol::status::LifecycleState;
use daq_runcontrol::transport::DataSender;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(5);

fn rc_settings() -> RunControlSettings {
    RunControlSettings {
        listen_address: "127.0.0.1:0".to_string(),
        transition_timeout_ms: 5000,
        request_timeout_ms: 2000,
        ..Default::default()
    }
}

fn peer_settings() -> PeerSettings {
    PeerSettings {
        status_push_interval_ms: 50,
        handshake_timeout_ms: 2000,
        data_listen_address: "127.0.0.1:0".to_string(),
    }
}

async fn bind() -> RunControl {
    RunControl::bind(rc_settings(), Duration::from_secs(2)).await.unwrap()
}

fn address(rc: &RunControl) -> String {
    format!("tcp://{}", rc.local_addr())
}

/// Producer that records every unrecognised command it is sent.
#[derive(Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<(String, String)>>>,
    configure_delay: Option<Duration>,
}

#[async_trait]
impl CommandHandler for Recorder {
    async fn on_configure(&self, _ctx: &PeerContext, _conf: &Configuration) -> AppResult<()> {
        if let Some(delay) = self.configure_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn on_unrecognised(&self, _ctx: &PeerContext, command: &str, param: &str) -> AppResult<()> {
        self.seen.lock().push((command.to_string(), param.to_string()));
        Ok(())
    }
}

/// Peer that takes a while to answer STATUS and counts the answers.
#[derive(Default)]
struct SlowStatus {
    calls: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl CommandHandler for SlowStatus {
    async fn on_status(&self, ctx: &PeerContext) -> AppResult<()> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        ctx.set_tag("CALLS", n);
        Ok(())
    }
}

/// Log collector that only announces an address.
struct FakeLogCollector;

#[async_trait]
impl CommandHandler for FakeLogCollector {
    async fn on_server(&self, _ctx: &PeerContext) -> AppResult<Option<String>> {
        Ok(Some("tcp://127.0.0.1:45999".to_string()))
    }
}

/// Producer that streams events to its data collector until the run stops.
#[derive(Default)]
struct StreamingProducer {
    sender: tokio::sync::Mutex<Option<DataSender>>,
}

#[async_trait]
impl CommandHandler for StreamingProducer {
    async fn on_start_run(&self, ctx: &PeerContext, _run: u32) -> AppResult<()> {
        if let Some(address) = ctx.data_address() {
            let sender = DataSender::connect(&address, ctx.info(), Duration::from_secs(2)).await?;
            *self.sender.lock().await = Some(sender);
        }
        Ok(())
    }

    async fn on_stop_run(&self, _ctx: &PeerContext) -> AppResult<()> {
        if let Some(sender) = self.sender.lock().await.take() {
            sender.close().await?;
        }
        Ok(())
    }

    async fn run_loop(&self, ctx: PeerContext) -> AppResult<()> {
        let mut guard = self.sender.lock().await;
        let Some(sender) = guard.as_mut() else {
            return Ok(());
        };
        let run = ctx.run_number();
        sender.send_event(&Event::bore("RawEvent", run, 0)).await?;
        let mut n = 0;
        while ctx.run_active() {
            n += 1;
            let mut ev = Event::new("RawEvent", run, 0);
            ev.set_event_n(n);
            ev.add_block(0, vec![0xab; 32]);
            sender.send_event(&ev).await?;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        sender.send_event(&Event::eore("RawEvent", run, 0, n + 1)).await?;
        Ok(())
    }
}

async fn start_peer<H: CommandHandler>(
    rc_address: &str,
    peer_type: &str,
    name: &str,
    handler: H,
) -> (PeerContext, JoinHandle<AppResult<()>>) {
    let mut receiver = CommandReceiver::new(peer_type, name, handler, peer_settings());
    receiver.connect(rc_address).await.unwrap();
    let ctx = receiver.context();
    (ctx, tokio::spawn(receiver.exec()))
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_run_cycle_with_peer_error() {
    let rc = bind().await;
    let addr = address(&rc);

    let mut peers = Vec::new();
    for name in ["a", "b", "c"] {
        peers.push(start_peer(&addr, "Producer", name, Recorder::default()).await);
    }
    assert!(rc.wait_for_peers(3, WAIT).await);
    assert_eq!(
        rc.wait_for_state(LifecycleState::Unconf, Some(WAIT)).await,
        TransitionOutcome::Reached(LifecycleState::Unconf)
    );

    let conf = Configuration::parse("[Producer.a]\nThreshold = 12\n");
    assert_eq!(
        rc.configure(&conf, None).await.unwrap(),
        TransitionOutcome::Reached(LifecycleState::Conf)
    );
    assert_eq!(peers[0].0.configuration().unwrap().get_int("Threshold", 0), 12);

    rc.set_next_run_number(7);
    assert_eq!(
        rc.start_run(None).await.unwrap(),
        TransitionOutcome::Reached(LifecycleState::Running)
    );
    assert_eq!(rc.run_number(), 7);
    assert!(rc.is_running());
    for (ctx, _) in &peers {
        assert_eq!(ctx.run_number(), 7);
    }

    peers[1].0.set_error("HV trip");
    assert_eq!(
        rc.wait_for_state(LifecycleState::Error, Some(WAIT)).await,
        TransitionOutcome::Reached(LifecycleState::Error)
    );
    let running = rc
        .connections()
        .iter()
        .filter(|r| r.state == LifecycleState::Running)
        .count();
    assert_eq!(running, 2);
    let tripped = rc
        .connections()
        .into_iter()
        .find(|r| r.state == LifecycleState::Error)
        .unwrap();
    assert_eq!(tripped.info.name, "b");
    assert_eq!(tripped.message, "HV trip");

    assert_eq!(rc.stop_run(None).await.unwrap(), TransitionOutcome::Failed);
    assert_eq!(
        rc.reset(None).await.unwrap(),
        TransitionOutcome::Reached(LifecycleState::Unconf)
    );

    assert!(rc.terminate(None).await.unwrap());
    for (_, handle) in peers {
        handle.await.unwrap().unwrap();
    }
    rc.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lost_peer_leaves_the_run_running() {
    let rc = bind().await;
    let addr = address(&rc);

    let (_ctx_a, handle_a) = start_peer(&addr, "Producer", "a", Recorder::default()).await;
    let (_ctx_b, handle_b) = start_peer(&addr, "Producer", "b", Recorder::default()).await;
    let mut doomed = CommandReceiver::new("Producer", "c", Recorder::default(), peer_settings());
    doomed.connect(&addr).await.unwrap();
    assert!(rc.wait_for_peers(3, WAIT).await);

    assert!(rc
        .configure(&Configuration::new(), None)
        .await
        .unwrap()
        .is_reached());
    assert!(rc.start_run(None).await.unwrap().is_reached());

    doomed.abort();
    assert!(rc.wait_for_peers(2, WAIT).await);
    assert_eq!(rc.aggregate(), LifecycleState::Running);

    let mut late = CommandReceiver::new("Producer", "late", Recorder::default(), peer_settings());
    assert!(late.connect(&addr).await.is_err());
    assert_eq!(rc.connections().len(), 2);

    assert!(rc.stop_run(None).await.unwrap().is_reached());
    assert!(rc.terminate(None).await.unwrap());
    handle_a.await.unwrap().unwrap();
    handle_b.await.unwrap().unwrap();
    rc.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commands_to_one_peer_arrive_in_order() {
    let rc = bind().await;
    let recorder = Recorder::default();
    let seen = recorder.seen.clone();
    let (_ctx, handle) = start_peer(&address(&rc), "Producer", "fifo", recorder).await;
    assert!(rc.wait_for_peers(1, WAIT).await);
    let peer = rc.connections()[0].id;

    for i in 0..50 {
        rc.send_command("PING", &i.to_string(), Target::Peer(peer)).await.unwrap();
    }
    // STATUS is queued behind every PING, so its reply means they all ran.
    rc.remote_status(peer).await.unwrap();

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 50);
    for (i, (command, param)) in seen.iter().enumerate() {
        assert_eq!(command, "PING");
        assert_eq!(param, &i.to_string());
    }

    assert!(rc.terminate(None).await.unwrap());
    handle.await.unwrap().unwrap();
    rc.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_request_ignores_an_earlier_broadcast_ack() {
    let rc = bind().await;
    let (_ctx, handle) = start_peer(&address(&rc), "Producer", "slow", SlowStatus::default()).await;
    assert!(rc.wait_for_peers(1, WAIT).await);
    let peer = rc.connections()[0].id;

    rc.send_command("STATUS", "", Target::All).await.unwrap();
    let status = rc.remote_status(peer).await.unwrap();
    assert_eq!(status.tag("CALLS"), Some("2"));

    assert!(rc.terminate(None).await.unwrap());
    handle.await.unwrap().unwrap();
    rc.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_slow_configure_times_out_with_warning() {
    let rc = bind().await;
    let slow = Recorder {
        configure_delay: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let (_ctx, handle) = start_peer(&address(&rc), "Producer", "slow", slow).await;
    assert!(rc.wait_for_peers(1, WAIT).await);
    assert!(rc.wait_for_state(LifecycleState::Unconf, Some(WAIT)).await.is_reached());

    let outcome = rc
        .configure(&Configuration::new(), Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TransitionOutcome::TimedOut {
            target: LifecycleState::Conf,
            actual: LifecycleState::Unconf,
        }
    );
    assert!(logs_contain("transition timed out"));

    // The peer still finishes and the aggregate catches up.
    assert!(rc.wait_for_state(LifecycleState::Conf, Some(WAIT)).await.is_reached());

    assert!(rc.terminate(None).await.unwrap());
    handle.await.unwrap().unwrap();
    rc.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_event_limit_stops_each_run() {
    let dir = tempfile::tempdir().unwrap();
    let rc = bind().await;
    let addr = address(&rc);

    let collector = DataCollector::new("127.0.0.1:0", dir.path());
    let (_dc, dc_handle) = start_peer(&addr, DATA_COLLECTOR, "", collector).await;
    assert!(rc.wait_for_peers(1, WAIT).await);
    eventually("data collector registration", || !rc.data_addresses().is_empty()).await;

    let (producer, producer_handle) = start_peer(&addr, "Producer", "tlu", StreamingProducer::default()).await;
    assert!(rc.wait_for_peers(2, WAIT).await);
    eventually("data address on the producer", || producer.data_address().is_some()).await;

    let conf = Configuration::parse("[RunControl]\nRunEventLimit = 20\n");
    assert!(rc.configure(&conf, None).await.unwrap().is_reached());

    rc.set_next_run_number(3);
    // The second run starts with the first run's final counts still fresh in
    // the collector; it must run to its own limit.
    for run in [3, 4] {
        assert!(rc.start_run(None).await.unwrap().is_reached());
        assert_eq!(rc.run_number(), run);
        assert_eq!(
            rc.wait_for_state(LifecycleState::Conf, Some(Duration::from_secs(10))).await,
            TransitionOutcome::Reached(LifecycleState::Conf)
        );
        assert!(!rc.is_running());

        let mut reader = FileReader::open(run_file_path(dir.path(), run), FileVersion::V2).unwrap();
        let events: Vec<Event> = std::iter::from_fn(|| reader.read_event(0).unwrap()).collect();
        assert!(events.len() >= 20, "run {run}: only {} events written", events.len());
        assert!(events[0].is_bore());
        assert!(events.iter().all(|ev| ev.run_n() == run));
    }

    assert!(rc.terminate(None).await.unwrap());
    dc_handle.await.unwrap().unwrap();
    producer_handle.await.unwrap().unwrap();
    rc.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_log_collector_address_reaches_later_peers() {
    let rc = bind().await;
    let addr = address(&rc);

    let (_log, log_handle) = start_peer(&addr, LOG_COLLECTOR, "", FakeLogCollector).await;
    assert!(rc.wait_for_peers(1, WAIT).await);
    eventually("log collector registration", || rc.log_address().is_some()).await;
    assert_eq!(rc.log_address().as_deref(), Some("tcp://127.0.0.1:45999"));

    let (producer, producer_handle) = start_peer(&addr, "Producer", "x", Recorder::default()).await;
    eventually("log address on the producer", || producer.log_address().is_some()).await;
    assert_eq!(producer.log_address().as_deref(), Some("tcp://127.0.0.1:45999"));

    assert!(rc.terminate(None).await.unwrap());
    log_handle.await.unwrap().unwrap();
    producer_handle.await.unwrap().unwrap();
    rc.shutdown().await;
}
