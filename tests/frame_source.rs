use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use edgeview::capture::{CallbackContext, FrameSource, PipelineState, Resolution};
use edgeview::testing::{init_test_tracing, CaptureCall, ScriptedCaptureBackend};
use edgeview::{FrameBridge, PipelineError};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Outcome {
    Opened(Resolution),
    Failed(PipelineError),
}

fn source(backend: ScriptedCaptureBackend, granted: bool) -> FrameSource {
    FrameSource::new(Arc::new(backend), Arc::new(granted), Arc::new(FrameBridge::new()))
}

fn open(source: &FrameSource, target: Resolution) -> flume::Receiver<Outcome> {
    let (tx, rx) = flume::unbounded();
    let err_tx = tx.clone();
    source
        .open(
            target,
            move |resolution| {
                let _ = tx.send(Outcome::Opened(resolution));
            },
            move |err| {
                let _ = err_tx.send(Outcome::Failed(err));
            },
        )
        .unwrap();
    rx
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn hd() -> Resolution {
    Resolution::new(1280, 720)
}

#[test]
fn permission_denied_before_enumeration() {
    init_test_tracing();
    let backend = ScriptedCaptureBackend::new();
    let journal = backend.journal();
    let source = source(backend, false);

    let rx = open(&source, hd());
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Outcome::Failed(PipelineError::PermissionDenied)
    ));
    assert_eq!(source.state(), PipelineState::Closed);
    assert!(journal.calls().is_empty(), "backend touched: {:?}", journal.calls());
}

#[test]
fn no_devices_is_device_unavailable() {
    init_test_tracing();
    let source = source(ScriptedCaptureBackend::new().with_devices(vec![]), true);

    let rx = open(&source, hd());
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Outcome::Failed(PipelineError::DeviceUnavailable(_))
    ));
    assert_eq!(source.state(), PipelineState::Closed);
}

#[test]
fn device_without_sizes_is_configuration_error() {
    init_test_tracing();
    let source = source(ScriptedCaptureBackend::new().with_resolutions(vec![]), true);

    let rx = open(&source, hd());
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Outcome::Failed(PipelineError::ConfigurationError(_))
    ));
    assert_eq!(source.state(), PipelineState::Closed);
}

#[test]
fn failed_device_open_is_device_unavailable() {
    init_test_tracing();
    let backend = ScriptedCaptureBackend::new().failing_open(PipelineError::Gpu("busy".into()));
    let source = source(backend, true);

    let rx = open(&source, hd());
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Outcome::Failed(PipelineError::DeviceUnavailable(_))
    ));
    assert_eq!(source.state(), PipelineState::Closed);
}

#[test]
fn failed_session_releases_the_device() {
    init_test_tracing();
    let backend = ScriptedCaptureBackend::new()
        .failing_session(PipelineError::DeviceUnavailable("no session".into()));
    let journal = backend.journal();
    let source = source(backend, true);

    let rx = open(&source, hd());
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Outcome::Failed(PipelineError::SessionConfigurationFailed(_))
    ));
    assert_eq!(source.state(), PipelineState::Closed);
    assert!(journal.contains(&CaptureCall::CloseDevice("scripted:0".into())));
}

#[test]
fn failed_start_closes_session_then_device() {
    init_test_tracing();
    let backend = ScriptedCaptureBackend::new()
        .failing_start(PipelineError::SessionConfigurationFailed("refused".into()));
    let journal = backend.journal();
    let source = source(backend, true);

    let rx = open(&source, hd());
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Outcome::Failed(PipelineError::SessionConfigurationFailed(_))
    ));
    assert_eq!(
        journal.calls(),
        vec![
            CaptureCall::Enumerate,
            CaptureCall::OpenDevice("scripted:0".into()),
            CaptureCall::CreateSession(hd()),
            CaptureCall::CloseSession,
            CaptureCall::CloseDevice("scripted:0".into()),
        ]
    );
}

#[test]
fn opens_with_nearest_resolution_and_closes_in_order() {
    init_test_tracing();
    let backend = ScriptedCaptureBackend::new();
    let journal = backend.journal();
    let source = source(backend, true);

    let rx = open(&source, hd());
    match rx.recv_timeout(WAIT).unwrap() {
        Outcome::Opened(resolution) => assert_eq!(resolution, hd()),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(source.state(), PipelineState::Previewing);
    assert!(journal.contains(&CaptureCall::StartRepeating));

    source.close();
    assert_eq!(source.state(), PipelineState::Closed);
    assert_eq!(
        journal.teardown(),
        vec![
            CaptureCall::StopRepeating,
            CaptureCall::CloseSession,
            CaptureCall::CloseDevice("scripted:0".into()),
        ]
    );
}

#[test]
fn open_while_previewing_fails_fast() {
    init_test_tracing();
    let source = source(ScriptedCaptureBackend::new(), true);
    let rx = open(&source, hd());
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::Opened(_)));

    let calls = Arc::new(AtomicUsize::new(0));
    let (c1, c2) = (Arc::clone(&calls), Arc::clone(&calls));
    let result = source.open(
        hd(),
        move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        },
        move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        },
    );

    assert!(matches!(
        result,
        Err(PipelineError::AlreadyOpen(PipelineState::Previewing))
    ));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(source.state(), PipelineState::Previewing);
}

#[test]
fn double_close_is_a_no_op() {
    init_test_tracing();
    let backend = ScriptedCaptureBackend::new();
    let journal = backend.journal();
    let source = source(backend, true);
    let rx = open(&source, hd());
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::Opened(_)));

    source.close();
    source.close();

    assert_eq!(source.state(), PipelineState::Closed);
    let stops = journal
        .calls()
        .iter()
        .filter(|c| **c == CaptureCall::StopRepeating)
        .count();
    assert_eq!(stops, 1);
}

#[test]
fn close_before_open_is_a_no_op() {
    init_test_tracing();
    let backend = ScriptedCaptureBackend::new();
    let journal = backend.journal();
    let source = source(backend, true);

    source.close();
    assert_eq!(source.state(), PipelineState::Closed);
    assert!(journal.calls().is_empty());
}

#[test]
fn close_during_opening_releases_what_the_open_produced() {
    init_test_tracing();
    let (backend, gate) = ScriptedCaptureBackend::new().gated();
    let journal = backend.journal();
    let source = source(backend, true);

    let rx = open(&source, hd());
    assert_eq!(source.state(), PipelineState::Opening);
    assert!(gate.wait_entered(WAIT));

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        gate.release();
    });
    source.close();
    releaser.join().unwrap();

    assert_eq!(source.state(), PipelineState::Closed);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "no callback expected");
    assert_eq!(
        journal.calls(),
        vec![
            CaptureCall::Enumerate,
            CaptureCall::OpenDevice("scripted:0".into()),
            CaptureCall::CloseDevice("scripted:0".into()),
        ]
    );
}

#[test]
fn concurrent_close_waits_for_teardown() {
    init_test_tracing();
    let (backend, gate) = ScriptedCaptureBackend::new().gated();
    let journal = backend.journal();
    let source = Arc::new(source(backend, true));

    let _rx = open(&source, hd());
    assert!(gate.wait_entered(WAIT));

    let first = {
        let source = Arc::clone(&source);
        thread::spawn(move || source.close())
    };
    assert!(wait_for(|| source.state() == PipelineState::Closing));

    let (done_tx, done_rx) = flume::bounded(1);
    let second = {
        let source = Arc::clone(&source);
        let journal = journal.clone();
        thread::spawn(move || {
            source.close();
            let device_closed = journal.contains(&CaptureCall::CloseDevice("scripted:0".into()));
            let _ = done_tx.send((source.state(), device_closed));
        })
    };

    // The device is still held by the capture thread
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

    gate.release();
    assert_eq!(
        done_rx.recv_timeout(WAIT).unwrap(),
        (PipelineState::Closed, true)
    );
    first.join().unwrap();
    second.join().unwrap();
    assert_eq!(source.state(), PipelineState::Closed);
}

#[test]
fn failing_teardown_steps_do_not_stop_the_close() {
    init_test_tracing();
    let backend = ScriptedCaptureBackend::new()
        .failing_stop(PipelineError::DeviceDisconnected("stop refused".into()))
        .failing_session_close(PipelineError::DeviceDisconnected("close refused".into()));
    let journal = backend.journal();
    let source = source(backend, true);

    let rx = open(&source, hd());
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::Opened(_)));

    source.close();
    assert_eq!(source.state(), PipelineState::Closed);
    assert_eq!(
        journal.teardown(),
        vec![
            CaptureCall::StopRepeating,
            CaptureCall::CloseSession,
            CaptureCall::CloseDevice("scripted:0".into()),
        ]
    );
    assert!(source.bridge().take().is_none());
}

#[test]
fn disconnect_while_previewing_reports_and_closes() {
    init_test_tracing();
    let backend = ScriptedCaptureBackend::new();
    let journal = backend.journal();
    let unplug = backend.disconnect_switch();
    let source = source(backend, true);

    let rx = open(&source, hd());
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::Opened(_)));

    unplug.trigger();
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Outcome::Failed(PipelineError::DeviceDisconnected(_))
    ));
    assert_eq!(source.state(), PipelineState::Closed);
    assert_eq!(
        journal.teardown(),
        vec![
            CaptureCall::StopRepeating,
            CaptureCall::CloseSession,
            CaptureCall::CloseDevice("scripted:0".into()),
        ]
    );

    // Closing after the source failed on its own does nothing more
    source.close();
    assert_eq!(source.state(), PipelineState::Closed);
}

#[test]
fn reopens_after_close() {
    init_test_tracing();
    let source = source(ScriptedCaptureBackend::new(), true);

    for _ in 0..2 {
        let rx = open(&source, hd());
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::Opened(_)));
        source.close();
    }
    assert_eq!(source.stats().sessions_opened, 2);
}

#[test]
fn queued_callbacks_from_a_closed_session_are_dropped() {
    init_test_tracing();
    let (context, callbacks) = CallbackContext::queue();
    let source = source(ScriptedCaptureBackend::new(), true).with_callback_context(context);

    let rx = open(&source, hd());
    assert!(wait_for(|| source.state() == PipelineState::Previewing));
    // on_opened is sitting in the queue; close before anyone runs it
    assert!(wait_for(|| !callbacks.is_empty()));
    source.close();

    for callback in callbacks.try_iter() {
        callback();
    }
    assert!(rx.try_recv().is_err());
}

#[test]
fn queued_callbacks_run_on_the_draining_thread() {
    init_test_tracing();
    let (context, callbacks) = CallbackContext::queue();
    let source = source(ScriptedCaptureBackend::new(), true).with_callback_context(context);

    let rx = open(&source, hd());
    let callback = callbacks.recv_timeout(WAIT).unwrap();
    assert!(rx.try_recv().is_err(), "must not run before it is drained");
    callback();
    assert!(matches!(rx.try_recv().unwrap(), Outcome::Opened(_)));
}

#[test]
fn close_from_inline_callback_does_not_deadlock() {
    init_test_tracing();
    let backend = ScriptedCaptureBackend::new();
    let journal = backend.journal();
    let source = Arc::new(source(backend, true));

    let inner = Arc::clone(&source);
    source
        .open(hd(), move |_| inner.close(), |err| panic!("unexpected {err}"))
        .unwrap();

    assert!(wait_for(|| source.state() == PipelineState::Closed
        && journal.contains(&CaptureCall::CloseDevice("scripted:0".into()))));
    assert!(journal.contains(&CaptureCall::StopRepeating));
}

#[test]
fn frames_reach_the_bridge() {
    init_test_tracing();
    let source = source(ScriptedCaptureBackend::new(), true);
    let rx = open(&source, hd());
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::Opened(_)));

    let mut frame = None;
    assert!(wait_for(|| {
        frame = source.bridge().take();
        frame.is_some()
    }));
    let frame = frame.unwrap();
    assert_eq!((frame.width, frame.height), (1280, 720));
    assert!(frame.sequence >= 1);
    drop(frame);

    source.close();
    assert!(source.bridge().take().is_none(), "close clears the bridge");
    assert!(source.stats().frames_captured >= 1);
}
