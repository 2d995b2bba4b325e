/// Drive a stereo session against the simulated runtime and print what
/// each frame did. Pass a JSON config path to override the defaults.
use std::env;
use theta_xr::config::CompositorConfig;
use theta_xr::render::NullGraphicsBackend;
use theta_xr::vr::simulated::SimulatedRuntime;
use theta_xr::vr::{SessionState, StereoCompositor};

const FRAMES: usize = 6;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => CompositorConfig::load(path)?,
        None => CompositorConfig::default(),
    };

    let mut runtime = SimulatedRuntime::new().with_eye_resolution(800, 600);
    runtime.queue_frames(&[false, true, true, true, false, true]);

    let mut compositor = StereoCompositor::new(runtime, NullGraphicsBackend::default(), config);
    compositor.init(&())?;
    compositor.runtime_mut().push_state_changes(&[
        SessionState::Ready,
        SessionState::Synchronized,
        SessionState::Visible,
        SessionState::Focused,
    ]);

    for frame in 0..FRAMES {
        if frame == FRAMES - 1 {
            compositor
                .runtime_mut()
                .push_state_changes(&[SessionState::Stopping, SessionState::Exiting]);
        }

        let mut draws = 0;
        match compositor.frame(|_projection, _view| draws += 1)? {
            Some(report) => println!(
                "frame {frame}: t={} render={} eyes={} layers={} draws={draws}",
                report.display_time.0,
                report.should_render,
                report.eyes_rendered,
                report.layers_submitted
            ),
            None => println!("frame {frame}: skipped ({})", compositor.state()),
        }

        if compositor.should_exit() {
            println!("runtime requested exit");
            break;
        }
    }

    compositor.release();
    Ok(())
}
