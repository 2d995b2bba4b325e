use theta_xr::config::CompositorConfig;
use theta_xr::math::{Mat4, multiply};
use theta_xr::render::NullGraphicsBackend;
use theta_xr::vr::simulated::{RuntimeCall, SimulatedRuntime};
use theta_xr::vr::{SessionState, StereoCompositor, XrError};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn running_compositor(
    runtime: SimulatedRuntime,
) -> StereoCompositor<SimulatedRuntime, NullGraphicsBackend> {
    let mut compositor = StereoCompositor::new(
        runtime,
        NullGraphicsBackend::default(),
        CompositorConfig::default(),
    );
    compositor.init(&()).expect("bootstrap should succeed");
    compositor
        .runtime_mut()
        .push_state_changes(&[SessionState::Ready, SessionState::Focused]);
    compositor
}

#[test]
fn two_eye_session_at_800x600() {
    init_logging();
    let mut runtime = SimulatedRuntime::new().with_eye_resolution(800, 600);
    runtime.queue_frames(&[false, true]);
    let mut compositor = running_compositor(runtime);

    let skipped = compositor
        .frame(|_, _| panic!("draw must not run when the runtime says not to render"))
        .expect("frame")
        .expect("session is render-eligible");
    assert!(!skipped.should_render);
    assert_eq!(skipped.layers_submitted, 0);

    let mut draws = Vec::new();
    let rendered = compositor
        .frame(|projection: &Mat4, view: &Mat4| draws.push((*projection, *view)))
        .expect("frame")
        .expect("session is render-eligible");
    assert_eq!(rendered.eyes_rendered, 2);
    assert_eq!(rendered.layers_submitted, 1);
    assert_eq!(draws.len(), 2);

    let ends: Vec<(usize, Vec<_>)> = compositor
        .runtime()
        .calls()
        .iter()
        .filter_map(|call| match call {
            RuntimeCall::EndFrame {
                layers, sub_images, ..
            } => Some((*layers, sub_images.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(ends.len(), 2);
    assert_eq!(ends[0], (0, Vec::new()));
    let (layers, sub_images) = &ends[1];
    assert_eq!(*layers, 1);
    assert_eq!(sub_images.len(), 2);
    assert_ne!(sub_images[0], sub_images[1]);

    let eye0 = compositor.resources().eyes[0].framebuffer;
    let blits = compositor.graphics().blits();
    assert_eq!(blits.len(), 1);
    assert_eq!(Some(blits[0].source), eye0);
    assert_eq!((blits[0].width, blits[0].height), (800, 600));
}

#[test]
fn draw_receives_projection_and_view_per_eye() {
    init_logging();
    let mut compositor = running_compositor(SimulatedRuntime::new());

    let mut matrices = Vec::new();
    compositor
        .frame(|projection: &Mat4, view: &Mat4| matrices.push((*projection, *view)))
        .expect("frame");

    assert_eq!(matrices.len(), 2);
    for (projection, _) in &matrices {
        // Symmetric simulated fov: no skew, near-plane term from the config.
        assert!(projection[8].abs() < 1e-6);
        assert!(projection[9].abs() < 1e-6);
        assert!((projection[14] + 0.02).abs() < 1e-6);
    }
    // Eyes sit on opposite sides of the head, so their views differ.
    assert_ne!(matrices[0].1, matrices[1].1);
    let product = multiply(&matrices[0].0, &matrices[0].1);
    assert!(product.iter().all(|value| value.is_finite()));
}

#[test]
fn every_wait_ends_and_every_acquire_releases() {
    init_logging();
    let mut runtime = SimulatedRuntime::new().timing_out_image_waits(1);
    runtime.queue_frames(&[true, false, true, true, false]);
    let mut compositor = running_compositor(runtime);

    for _ in 0..10 {
        compositor.frame(|_, _| {}).expect("frame");
    }

    let mut frame_open = false;
    let mut acquired = std::collections::HashMap::new();
    for call in compositor.runtime().calls() {
        match call {
            RuntimeCall::WaitFrame { .. } => {
                assert!(!frame_open, "wait before previous end");
                frame_open = true;
            }
            RuntimeCall::EndFrame { .. } => {
                assert!(frame_open, "end without wait");
                frame_open = false;
            }
            RuntimeCall::AcquireImage { swapchain, index } => {
                assert!(
                    acquired.insert(*swapchain, *index).is_none(),
                    "acquire before release"
                );
            }
            RuntimeCall::ReleaseImage { swapchain, index } => {
                assert_eq!(acquired.remove(swapchain), Some(*index));
            }
            _ => {}
        }
    }
    assert!(!frame_open);
    assert!(acquired.is_empty());
    assert_eq!(compositor.frames_submitted(), 10);
}

#[test]
fn view_count_mismatch_is_fatal() {
    init_logging();
    let mut compositor = running_compositor(SimulatedRuntime::new().with_located_view_count(3));

    let err = compositor.frame(|_, _| {}).unwrap_err();
    assert_eq!(
        err,
        XrError::ConsistencyViolation {
            expected: 2,
            actual: 3
        }
    );
    assert!(err.is_fatal());
}

#[test]
fn session_lifecycle_drives_rendering() {
    init_logging();
    let mut compositor = StereoCompositor::new(
        SimulatedRuntime::new(),
        NullGraphicsBackend::default(),
        CompositorConfig::default(),
    );
    compositor.init(&()).expect("bootstrap");

    assert_eq!(compositor.frame(|_, _| {}), Ok(None));
    assert_eq!(compositor.state(), SessionState::Idle);

    compositor
        .runtime_mut()
        .push_state_changes(&[SessionState::Ready, SessionState::Synchronized]);
    assert!(compositor.frame(|_, _| {}).expect("frame").is_some());

    compositor
        .runtime_mut()
        .push_state_changes(&[SessionState::Stopping]);
    assert_eq!(compositor.frame(|_, _| {}), Ok(None));
    assert!(!compositor.runtime().is_session_running());
    assert!(!compositor.should_exit());

    compositor.runtime_mut().push_state_changes(&[
        SessionState::Idle,
        SessionState::Ready,
        SessionState::Exiting,
    ]);
    assert_eq!(compositor.frame(|_, _| {}), Ok(None));
    assert!(compositor.should_exit());

    let begins = compositor
        .runtime()
        .count_calls(|call| matches!(call, RuntimeCall::BeginSession));
    let ends = compositor
        .runtime()
        .count_calls(|call| matches!(call, RuntimeCall::EndSession));
    assert_eq!((begins, ends), (2, 1));
}
