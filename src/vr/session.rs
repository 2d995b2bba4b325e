use super::runtime::{XrRuntime, describe_failure, op};
use super::{InstanceHandle, RuntimeEvent, SessionHandle, SessionState, XrError, XrResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Begin,
    End,
}

/// Tracks the runtime-driven session lifecycle and decides when the
/// session must be begun or ended.
#[derive(Debug, Default)]
pub struct SessionStateMachine {
    state: SessionState,
    running: bool,
    halted: bool,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True between a successful begin and the matching end.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Set once the runtime reports loss or exit; no frame work follows.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn should_render(&self) -> bool {
        !self.halted && self.running && self.state.is_render_eligible()
    }

    /// Records a state change and returns the session call it requires.
    /// Begin is only requested while not running and end only while
    /// running, so repeated identical events are harmless.
    pub fn transition(&mut self, next: SessionState) -> Option<SessionCommand> {
        if self.halted {
            log::debug!("[xr-session] ignoring {next} after session halted");
            return None;
        }

        let previous = std::mem::replace(&mut self.state, next);
        log::info!("[xr-session] state {previous} -> {next}");

        match next {
            SessionState::Ready if !self.running => Some(SessionCommand::Begin),
            SessionState::Stopping if self.running => Some(SessionCommand::End),
            SessionState::LossPending | SessionState::Exiting => {
                self.halted = true;
                None
            }
            _ => None,
        }
    }

    pub fn apply<R: XrRuntime>(
        &mut self,
        runtime: &mut R,
        instance: InstanceHandle,
        session: SessionHandle,
        command: SessionCommand,
    ) -> XrResult<()> {
        let (operation, result) = match command {
            SessionCommand::Begin => (op::BEGIN_SESSION, runtime.begin_session(session)),
            SessionCommand::End => (op::END_SESSION, runtime.end_session(session)),
        };
        result.map_err(|status| {
            XrError::FrameStepFailed(describe_failure(runtime, Some(instance), operation, status))
        })?;

        self.running = command == SessionCommand::Begin;
        log::info!(
            "[xr-session] session {}",
            if self.running { "begun" } else { "ended" }
        );
        Ok(())
    }

    /// Polls until the runtime's event queue is empty, applying every
    /// session-state change. Returns the number of events consumed.
    pub fn drain_events<R: XrRuntime>(
        &mut self,
        runtime: &mut R,
        instance: InstanceHandle,
        session: SessionHandle,
    ) -> XrResult<usize> {
        let mut processed = 0;
        loop {
            let event = match runtime.poll_event(instance) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(status) => {
                    return Err(XrError::FrameStepFailed(describe_failure(
                        runtime,
                        Some(instance),
                        op::POLL_EVENT,
                        status,
                    )));
                }
            };
            processed += 1;

            match event {
                RuntimeEvent::SessionStateChanged { state, .. } => {
                    if let Some(command) = self.transition(state) {
                        if let Err(err) = self.apply(runtime, instance, session, command) {
                            log::error!("[xr-session] {err}");
                        }
                    }
                }
                RuntimeEvent::Ignored(kind) => {
                    log::debug!("[xr-session] ignoring {kind} event");
                }
            }
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vr::simulated::{RuntimeCall, SimulatedRuntime};
    use crate::vr::{ApplicationIdentity, FormFactor, RawStatus};
    use proptest::prelude::*;

    fn start(runtime: &mut SimulatedRuntime) -> (InstanceHandle, SessionHandle) {
        let identity = ApplicationIdentity {
            application_name: "session-test".to_string(),
            application_version: 1,
            engine_name: "session-test".to_string(),
            engine_version: 1,
        };
        let instance = runtime.create_instance(&identity, &[]).expect("instance");
        let device = runtime
            .system(instance, FormFactor::HeadMountedDisplay)
            .expect("system")
            .expect("device");
        let session = runtime.create_session(instance, device, &()).expect("session");
        (instance, session)
    }

    fn session_calls(runtime: &SimulatedRuntime) -> Vec<RuntimeCall> {
        runtime
            .calls()
            .iter()
            .filter(|call| matches!(call, RuntimeCall::BeginSession | RuntimeCall::EndSession))
            .cloned()
            .collect()
    }

    #[test]
    fn ready_requests_begin_once() {
        let mut machine = SessionStateMachine::new();
        assert_eq!(machine.transition(SessionState::Idle), None);
        assert_eq!(
            machine.transition(SessionState::Ready),
            Some(SessionCommand::Begin)
        );
    }

    #[test]
    fn stopping_without_running_session_is_noop() {
        let mut machine = SessionStateMachine::new();
        assert_eq!(machine.transition(SessionState::Stopping), None);
        assert!(!machine.should_render());
    }

    #[test]
    fn exiting_halts_further_transitions() {
        let mut machine = SessionStateMachine::new();
        machine.transition(SessionState::Exiting);
        assert!(machine.is_halted());
        assert_eq!(machine.transition(SessionState::Ready), None);
        assert_eq!(machine.state(), SessionState::Exiting);
    }

    #[test]
    fn drain_consumes_every_pending_event() {
        let mut runtime = SimulatedRuntime::new();
        let (instance, session) = start(&mut runtime);
        runtime.push_event(RuntimeEvent::Ignored("events_lost"));
        runtime.push_state_changes(&[
            SessionState::Ready,
            SessionState::Synchronized,
            SessionState::Visible,
            SessionState::Focused,
        ]);

        let mut machine = SessionStateMachine::new();
        let processed = machine
            .drain_events(&mut runtime, instance, session)
            .expect("drain");

        // The idle event queued by session creation is drained as well.
        assert_eq!(processed, 6);
        assert_eq!(runtime.pending_events(), 0);
        assert_eq!(machine.state(), SessionState::Focused);
        assert!(machine.should_render());
        assert!(runtime.is_session_running());
    }

    #[test]
    fn full_lifecycle_begins_and_ends_once() {
        let mut runtime = SimulatedRuntime::new();
        let (instance, session) = start(&mut runtime);
        runtime.push_state_changes(&[
            SessionState::Ready,
            SessionState::Focused,
            SessionState::Visible,
            SessionState::Stopping,
            SessionState::Idle,
            SessionState::Exiting,
        ]);

        let mut machine = SessionStateMachine::new();
        machine
            .drain_events(&mut runtime, instance, session)
            .expect("drain");

        assert_eq!(
            session_calls(&runtime),
            vec![RuntimeCall::BeginSession, RuntimeCall::EndSession]
        );
        assert!(machine.is_halted());
        assert!(!machine.should_render());
    }

    #[test]
    fn failed_begin_is_retried_on_next_ready() {
        let mut runtime = SimulatedRuntime::new();
        let (instance, session) = start(&mut runtime);
        runtime.fail_call(op::BEGIN_SESSION, RawStatus::RUNTIME_FAILURE);
        runtime.push_state_change(SessionState::Ready);

        let mut machine = SessionStateMachine::new();
        machine
            .drain_events(&mut runtime, instance, session)
            .expect("drain");
        assert!(!machine.is_running());
        assert!(!machine.should_render());

        runtime.clear_failure(op::BEGIN_SESSION);
        runtime.push_state_change(SessionState::Ready);
        machine
            .drain_events(&mut runtime, instance, session)
            .expect("drain");
        assert!(machine.is_running());
    }

    #[test]
    fn poll_failure_surfaces_as_frame_step_error() {
        let mut runtime = SimulatedRuntime::new();
        let (instance, session) = start(&mut runtime);
        runtime.fail_call(op::POLL_EVENT, RawStatus::SESSION_LOST);

        let err = SessionStateMachine::new()
            .drain_events(&mut runtime, instance, session)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "frame step failed: poll_event: XR_ERROR_SESSION_LOST"
        );
    }

    fn any_state() -> impl Strategy<Value = SessionState> {
        prop_oneof![
            Just(SessionState::Idle),
            Just(SessionState::Ready),
            Just(SessionState::Synchronized),
            Just(SessionState::Visible),
            Just(SessionState::Focused),
            Just(SessionState::Stopping),
            Just(SessionState::LossPending),
            Just(SessionState::Exiting),
        ]
    }

    proptest! {
        #[test]
        fn begin_and_end_alternate(states in proptest::collection::vec(any_state(), 0..40)) {
            let mut runtime = SimulatedRuntime::new();
            let (instance, session) = start(&mut runtime);
            runtime.push_state_changes(&states);

            let mut machine = SessionStateMachine::new();
            machine.drain_events(&mut runtime, instance, session).expect("drain");

            let mut running = false;
            let mut expected = Vec::new();
            for state in &states {
                match state {
                    SessionState::Ready if !running => {
                        running = true;
                        expected.push(RuntimeCall::BeginSession);
                    }
                    SessionState::Stopping if running => {
                        running = false;
                        expected.push(RuntimeCall::EndSession);
                    }
                    SessionState::LossPending | SessionState::Exiting => break,
                    _ => {}
                }
            }

            prop_assert_eq!(session_calls(&runtime), expected);
            prop_assert_eq!(machine.is_running(), running);
        }
    }
}
