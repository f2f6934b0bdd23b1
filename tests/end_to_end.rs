use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use edgeview::capture::{FrameSource, PipelineState, Resolution};
use edgeview::display::{ModeSwitch, RenderMode, TexturePresenter, TickOutcome};
use edgeview::pipeline::Luma;
use edgeview::testing::{init_test_tracing, RecordingRenderBackend, RenderCall, ScriptedCaptureBackend};
use edgeview::FrameBridge;

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    source: FrameSource,
    presenter: TexturePresenter<RecordingRenderBackend>,
    switch: ModeSwitch,
}

fn rig() -> Rig {
    rig_with(ScriptedCaptureBackend::new())
}

fn rig_with(backend: ScriptedCaptureBackend) -> Rig {
    let bridge = Arc::new(FrameBridge::new());
    let source = FrameSource::new(
        Arc::new(backend),
        Arc::new(true),
        Arc::clone(&bridge),
    );
    let switch = ModeSwitch::default();
    let mut presenter = TexturePresenter::new(RecordingRenderBackend::new(), bridge, switch.clone());
    presenter.on_surface_created(1280, 720).unwrap();
    Rig {
        source,
        presenter,
        switch,
    }
}

fn open(source: &FrameSource, target: Resolution) -> Resolution {
    let (tx, rx) = flume::bounded(1);
    source
        .open(
            target,
            move |resolution| {
                let _ = tx.send(resolution);
            },
            |err| panic!("open failed: {err}"),
        )
        .unwrap();
    rx.recv_timeout(WAIT).unwrap()
}

/// Tick until a new frame is presented.
fn present(presenter: &mut TexturePresenter<RecordingRenderBackend>) -> TickOutcome {
    let deadline = Instant::now() + WAIT;
    loop {
        let outcome = presenter.on_draw_requested().unwrap().unwrap();
        if matches!(outcome, TickOutcome::Presented { .. }) || Instant::now() > deadline {
            return outcome;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn open_720p_and_present_first_frame() {
    init_test_tracing();
    let hd = Resolution::new(1280, 720);
    let mut rig = rig_with(ScriptedCaptureBackend::new().with_resolutions(vec![hd]));

    assert_eq!(open(&rig.source, hd), hd);
    assert_eq!(rig.source.state(), PipelineState::Previewing);

    assert_eq!(
        present(&mut rig.presenter),
        TickOutcome::Presented {
            width: 1280,
            height: 720
        }
    );

    let backend = rig.presenter.backend();
    assert!(backend.calls().contains(&RenderCall::CreateTexture {
        id: 1,
        width: 1280,
        height: 720
    }));
    let upload = &backend.uploads()[0];
    assert_eq!((upload.width, upload.height), (1280, 720));
    assert_eq!(upload.len, 1280 * 720 * 4);
    assert_eq!(upload.first_pixel[3], 255);

    rig.source.close();
    assert_eq!(rig.source.state(), PipelineState::Closed);
}

#[test]
fn mode_switch_does_not_touch_capture_or_textures() {
    init_test_tracing();
    let mut rig = rig();
    open(&rig.source, Resolution::new(640, 480));
    present(&mut rig.presenter);

    let sessions = rig.source.stats().sessions_opened;
    rig.switch.set(RenderMode::Grayscale);
    present(&mut rig.presenter);

    let backend = rig.presenter.backend();
    assert_eq!(backend.draws().last().map(String::as_str), Some("grayscale"));
    let textures = backend
        .calls()
        .iter()
        .filter(|c| matches!(c, RenderCall::CreateTexture { .. }))
        .count();
    assert_eq!(textures, 1);
    assert_eq!(rig.source.stats().sessions_opened, sessions);
    assert_eq!(rig.source.state(), PipelineState::Previewing);
}

#[test]
fn transform_changes_channel_count_without_new_texture() {
    init_test_tracing();
    let mut rig = rig();
    open(&rig.source, Resolution::new(640, 480));
    present(&mut rig.presenter);

    rig.presenter.set_transform(Some(Box::new(Luma)));
    present(&mut rig.presenter);

    let uploads = rig.presenter.backend().uploads();
    let last = uploads.last().unwrap();
    // gray frames are expanded to RGBA, so the texture size is unchanged
    assert_eq!(last.len, 640 * 480 * 4);
    assert_eq!(last.first_pixel[0], last.first_pixel[1]);
    assert_eq!(rig.presenter.backend().live_textures().len(), 1);
}

#[test]
fn presenter_keeps_last_frame_after_close() {
    init_test_tracing();
    let mut rig = rig();
    open(&rig.source, Resolution::new(640, 480));
    present(&mut rig.presenter);

    rig.source.close();
    assert_eq!(rig.presenter.render_tick().unwrap(), TickOutcome::Redrawn);
}

#[test]
fn stats_count_presented_frames() {
    init_test_tracing();
    let mut rig = rig();
    open(&rig.source, Resolution::new(640, 480));
    for _ in 0..3 {
        present(&mut rig.presenter);
    }
    rig.source.close();

    let snap = rig.presenter.stats().snapshot();
    assert_eq!(snap.frames, 3);
    assert!(snap.total_processing > Duration::ZERO);
}
