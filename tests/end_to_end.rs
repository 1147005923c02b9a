use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fsm_engine::prelude::*;

fn toggle_model() -> FsmModel {
    FsmModel::builder()
        .state(State::new("Off").initial())
        .state(State::new("On"))
        .transition(Transition::new("Off", "On").on_event("toggle"))
        .transition(Transition::new("On", "Off").on_event("toggle"))
        .initial("Off")
        .build()
}

fn engine(model: FsmModel) -> SimulationEngine {
    SimulationEngine::new(model, HashMap::new(), Box::new(RhaiEvaluator::new()), EngineConfig::default()).unwrap()
}

#[test]
fn scenario_1_toggle_emits_transitions_in_order() {
    let mut e = engine(toggle_model());
    let transitions = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = transitions.clone();
    e.subscribe(move |event: &EngineEvent| {
        if let EngineEvent::TransitionTaken { source, target, .. } = event {
            sink.lock().unwrap().push((source.clone(), target.clone()));
        }
    });

    e.inject_event("toggle").unwrap();
    let (leaf, _) = e.step(None).unwrap();
    assert_eq!(leaf, "On");
    e.inject_event("toggle").unwrap();
    let (leaf, _) = e.step(None).unwrap();
    assert_eq!(leaf, "Off");

    assert_eq!(
        *transitions.lock().unwrap(),
        vec![("Off".to_string(), "On".to_string()), ("On".to_string(), "Off".to_string())]
    );
}

#[test]
fn no_eligible_transitions_runs_only_during_actions_and_advances_tick() {
    let model = FsmModel::builder()
        .variable(VariableDecl { name: "ticks".into(), var_type: VarType::Int, initial: Some(serde_json::json!(0)) })
        .state(State::new("S").initial().with_during(CodeBlock::new("rhai", "ticks = ticks + 1;")))
        .initial("S")
        .build();
    let mut e = engine(model);

    let tick_values = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = tick_values.clone();
    e.subscribe(move |event: &EngineEvent| {
        if let EngineEvent::TickProcessed { tick, .. } = event {
            sink.lock().unwrap().push(*tick);
        }
    });

    for _ in 0..3 {
        e.step(None).unwrap();
    }
    assert_eq!(*tick_values.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(e.get_variables().get("ticks"), Some(&Value::Int(3)));
}

#[test]
fn variables_round_trip_through_snapshot_and_set() {
    let mut e = engine(toggle_model());
    e.set_variable("custom", Value::Int(42)).unwrap();
    let snapshot = e.get_variables();

    let mut replay = engine(toggle_model());
    for (name, value) in &snapshot {
        replay.set_variable(name.clone(), value.clone()).unwrap();
    }
    replay.inject_event("toggle").unwrap();
    e.inject_event("toggle").unwrap();
    assert_eq!(e.step(None).unwrap().0, replay.step(None).unwrap().0);
}

#[test]
fn breakpoint_on_fire_pauses_until_continue() {
    let model = FsmModel::builder()
        .state(State::new("S").initial())
        .state(State::new("T"))
        .transition({
            let mut t = Transition::new("S", "T").on_event("go");
            t.breakpoint_on_fire = true;
            t
        })
        .initial("S")
        .build();
    let mut e = engine(model);
    e.inject_event("go").unwrap();
    let (leaf, _) = e.step(None).unwrap();
    assert_eq!(leaf, "T");
    assert!(e.status().paused_on_breakpoint);

    let (leaf, log) = e.step(None).unwrap();
    assert_eq!(leaf, "T");
    assert!(log.is_empty());

    assert!(e.continue_from_breakpoint());
    assert!(!e.status().paused_on_breakpoint);
}

// Scenario 5: a hardware event is translated into an injected FSM event by a
// thin adapter loop, mirroring how a host application would wire the two
// components together (the engine and the hardware link never talk directly).
#[tokio::test]
async fn scenario_5_hardware_event_drives_fsm() {
    use fsm_engine::hardware::{HardwareLink, HardwareLinkConfig, SerialTransport, SerialTransportFactory};
    use std::io;

    struct OneShotTransport {
        lines: std::collections::VecDeque<String>,
    }
    impl SerialTransport for OneShotTransport {
        fn read_line(&mut self, _timeout: Duration) -> io::Result<Option<String>> {
            Ok(self.lines.pop_front())
        }
        fn write_line(&mut self, _line: &str) -> io::Result<()> {
            Ok(())
        }
    }
    struct Factory;
    impl SerialTransportFactory for Factory {
        fn open(&self, _port: &str) -> io::Result<Box<dyn SerialTransport>> {
            Ok(Box::new(OneShotTransport { lines: ["EVT:Button0".to_string()].into() }))
        }
        fn list_ports(&self) -> Vec<String> {
            vec![]
        }
    }

    let model = FsmModel::builder()
        .state(State::new("Off").initial())
        .state(State::new("On"))
        .transition(Transition::new("Off", "On").on_event("btn"))
        .initial("Off")
        .build();
    let mut e = engine(model);

    let mut link = HardwareLink::new(Arc::new(Factory), HardwareLinkConfig::default());
    link.connect("FAKE0");

    // Poll for the event the worker thread forwards; map Button0 -> "btn".
    let mut received = None;
    for _ in 0..200 {
        if let Some(event) = link.try_recv_event() {
            received = Some(event);
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    match received {
        Some(EngineEvent::HardwareEvent(name)) if name == "Button0" => {
            e.inject_event("btn").unwrap();
        }
        other => panic!("expected HardwareEvent(Button0), got {other:?}"),
    }

    let (leaf, _) = e.step(None).unwrap();
    assert_eq!(leaf, "On");
}

// Scenario 6: co-sim TCP framing splits a byte stream on NUL bytes into
// discrete live-update messages, independent of how the bytes were chunked
// by the sender.
#[tokio::test]
async fn scenario_6_cosim_live_stream_framing() {
    use fsm_engine::cosim::{CoSimLink, CoSimLinkConfig, CommandExecutor, CoSimCommand, CommandOutcome};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    struct NoOp;
    impl CommandExecutor for NoOp {
        fn execute(&self, _command: &CoSimCommand) -> Result<CommandOutcome, String> {
            Ok(CommandOutcome { success: true, message: String::new(), data: None })
        }
        fn probe(&self) -> bool {
            true
        }
    }

    let port = 31999;
    let mut link = CoSimLink::new(Arc::new(NoOp), CoSimLinkConfig { tcp_port: port, ..Default::default() });
    link.start().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(b"hello\x00wor").await.unwrap();
    stream.write_all(b"ld\x00").await.unwrap();

    let mut updates = Vec::new();
    for _ in 0..200 {
        if let Some(EngineEvent::CoSimLiveUpdate(text)) = link.try_recv_event() {
            updates.push(text);
        }
        if updates.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(updates, vec!["hello".to_string(), "world".to_string()]);
    link.shutdown(Duration::from_secs(1)).await;
}
