//! Sessions against scripted terminals, end to end through the store and export

use std::thread;

use emv_card::transport::MockTransport;
use emv_fuzz::export::ExportDocument;
use emv_fuzz::repro::reproduce;
use emv_fuzz::{
    test_reproducibility, write_session_export, AnomalyKind, FuzzEngine, FuzzPreset, FuzzStore,
    FuzzStrategy, SessionControl, SessionStatus, Severity, Terminal, DEFAULT_ATTEMPTS,
};

/// Answers 6F00 to READ RECORD and refuses everything else
fn faulty_terminal() -> MockTransport {
    MockTransport::new()
        .respond(vec![0x00, 0xB2], vec![0x6F, 0x00])
        .fallback(vec![0x6D, 0x00])
}

fn healthy_terminal() -> MockTransport {
    MockTransport::new().fallback(vec![0x6D, 0x00])
}

fn sweep_preset() -> FuzzPreset {
    FuzzPreset::new("sweep-select", FuzzStrategy::InstructionSweep, &["00A4040000"]).iterations(256)
}

#[test]
fn parallel_sessions_on_independent_terminals() {
    let mut store = FuzzStore::with_builtin_presets();
    store.add_preset(sweep_preset());
    let faulty_id = store.add_terminal(Terminal::new("Bench A", "mock"));
    let healthy_id = store.add_terminal(Terminal::new("Bench B", "mock"));
    let faulty_session = store.create_session(faulty_id, "sweep-select").unwrap();
    let healthy_session = store.create_session(healthy_id, "sweep-select").unwrap();
    store.transition(faulty_session, SessionStatus::Running).unwrap();
    store.transition(healthy_session, SessionStatus::Running).unwrap();

    let preset = sweep_preset();
    let first = store.session(faulty_session).unwrap().clone();
    let second = store.session(healthy_session).unwrap().clone();

    let (faulty_run, healthy_run) = thread::scope(|scope| {
        let faulty = scope.spawn(|| {
            let mut mock = faulty_terminal();
            FuzzEngine::new(&mut mock).run(&first, &preset).unwrap()
        });
        let healthy = scope.spawn(|| {
            let mut mock = healthy_terminal();
            FuzzEngine::new(&mut mock).run(&second, &preset).unwrap()
        });
        (faulty.join().unwrap(), healthy.join().unwrap())
    });

    assert_eq!(faulty_run.anomalies.len(), 1);
    assert!(healthy_run.anomalies.is_empty());
    assert_eq!(faulty_run.metrics.commands_sent, healthy_run.metrics.commands_sent);

    store.apply_run(faulty_session, faulty_run).unwrap();
    store.apply_run(healthy_session, healthy_run).unwrap();
    assert_eq!(store.session(faulty_session).unwrap().status, SessionStatus::Completed);
    assert!(store.anomalies_for(healthy_session).is_empty());

    let anomaly = store.anomalies_for(faulty_session)[0].clone();
    assert_eq!(anomaly.kind, AnomalyKind::UnexpectedStatus);
    assert_eq!(anomaly.severity, Severity::High);
    assert_eq!(anomaly.command, vec![0x00, 0xB2, 0x04, 0x00, 0x00]);

    let mut replay = faulty_terminal();
    let report = test_reproducibility(&mut replay, &anomaly, DEFAULT_ATTEMPTS);
    assert_eq!(report.anomaly_id, Some(anomaly.id));
    assert_eq!(report.attempts, DEFAULT_ATTEMPTS);
    assert_eq!(report.reproduction_rate, 1.0);
    assert!(report.consistent_behavior);
    store.record_reproduction(anomaly.id, &report).unwrap();
    assert_eq!(store.anomaly(anomaly.id).unwrap().reproduced, DEFAULT_ATTEMPTS);

    let dir = tempfile::tempdir().unwrap();
    let path = write_session_export(&store, faulty_session, dir.path()).unwrap();
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("fuzz_bench_a_"), "{name}");

    let document = ExportDocument::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(document.sessions.len(), 1);
    let exported = &document.sessions[0];
    assert_eq!(exported.session.id, faulty_session);
    assert_eq!(exported.terminal.as_ref().unwrap().name, "Bench A");
    assert_eq!(exported.anomalies[0].reproduction_attempts, DEFAULT_ATTEMPTS);
}

#[test]
fn flaky_terminal_is_partly_reproducible() {
    let mut flaky = MockTransport::new()
        .respond_sequence(vec![0x00, 0xB2], vec![vec![0x6F, 0x00], vec![0x90, 0x00]])
        .fallback(vec![0x6D, 0x00]);
    let report = reproduce(
        &mut flaky,
        &[0x00, 0xB2, 0x04, 0x00, 0x00],
        Some(&[0x6D, 0x00][..]),
        AnomalyKind::UnexpectedStatus,
        4,
    );
    assert_eq!(report.reproduced, 2);
    assert_eq!(report.reproduction_rate, 0.5);
    assert!(!report.consistent_behavior);
    assert_eq!(report.responses, vec!["6F00", "9000", "6F00", "9000"]);
}

#[test]
fn same_seed_replays_same_commands() {
    let select_ppse = "00A404000E325041592E5359532E444446303100";
    let preset = FuzzPreset::new("bits", FuzzStrategy::BitFlip, &[select_ppse])
        .iterations(20)
        .seed(7);
    let session = emv_fuzz::FuzzSession::new(&Terminal::new("t", "mock"), &preset);

    let mut first = healthy_terminal();
    let mut second = healthy_terminal();
    FuzzEngine::new(&mut first).run(&session, &preset).unwrap();
    FuzzEngine::new(&mut second).run(&session, &preset).unwrap();
    assert_eq!(first.sent(), second.sent());
}

#[test]
fn paused_session_resumes_from_another_thread() {
    let preset = sweep_preset();
    let session = emv_fuzz::FuzzSession::new(&Terminal::new("t", "mock"), &preset);
    let control = SessionControl::new();
    control.pause();

    let run = thread::scope(|scope| {
        let steering = control.clone();
        let worker = scope.spawn(|| {
            let mut mock = healthy_terminal();
            FuzzEngine::new(&mut mock)
                .with_control(control.clone())
                .run(&session, &preset)
                .unwrap()
        });
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(steering.status(), SessionStatus::Paused);
        steering.resume();
        worker.join().unwrap()
    });
    assert_eq!(run.outcome, SessionStatus::Completed);
    assert!(run.metrics.commands_sent > 2);
}
