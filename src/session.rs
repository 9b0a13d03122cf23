//! Session identity: keeping the native replay session in step with the tracking session.
use std::sync::MutexGuard;

use crate::{client::Inner, CaptureOptions, Properties};

/// Replay-side view of the session.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    /// Last session id propagated to replay. Empty if none.
    pub(crate) current_session_id: String,
    /// Whether session replay was requested for this client.
    pub(crate) replay_enabled: bool,
    /// Outcome of the linked flag policy on the web path.
    pub(crate) recording_active: bool,
}

impl Inner {
    pub(crate) fn session(&self) -> MutexGuard<'_, SessionState> {
        self.session
            .lock()
            .expect("thread holding session lock should not panic")
    }

    pub(crate) fn is_replay_enabled(&self) -> bool {
        !self.core.is_disabled() && self.session().replay_enabled
    }

    /// Current session id. A changed id is propagated to native replay in the background.
    pub(crate) fn session_id(&self) -> String {
        let session_id = self.core.session_id();
        // Cores built in this crate already reported the id; a repeat is a no-op.
        self.observe_session_id(&session_id);
        session_id
    }

    /// Compare `session_id` with the id replay last saw and rotate native replay if it moved.
    ///
    /// Runs for every session id lookup, including the ones made while capturing events.
    pub(crate) fn observe_session_id(&self, session_id: &str) {
        if !self.is_replay_enabled() {
            return;
        }

        let mut session = self.session();
        if session_id.is_empty()
            || session.current_session_id.is_empty()
            || session_id == session.current_session_id
        {
            log::trace!(target: "posthog", session_id, current = session.current_session_id.as_str(); "session id not rotated");
            return;
        }

        if self.replay.is_native() {
            log::info!(target: "posthog", from = session.current_session_id.as_str(), to = session_id; "session id rotated");
            let this = self.handle();
            let rotated = session_id.to_owned();
            self.tasks.spawn(async move {
                if let Some(this) = this.upgrade() {
                    this.reset_native_session_id(&rotated).await;
                }
            });
        }
        // Remembered even if the native rotation fails, so it isn't retried.
        session.current_session_id = session_id.to_owned();
    }

    /// Drop the tracking session and end native replay in the background.
    pub(crate) fn reset_session_id(&self) {
        self.core.reset_session_id();
        if self.is_replay_enabled() && self.replay.is_native() {
            let this = self.handle();
            self.tasks.spawn(async move {
                if let Some(this) = this.upgrade() {
                    this.replay.end().await;
                }
            });
        }
    }

    /// Rotate the native replay session to `session_id`.
    pub(crate) async fn reset_native_session_id(&self, session_id: &str) {
        if !self.is_replay_enabled() {
            return;
        }
        if let Err(err) = self.replay.rotate(session_id).await {
            log::warn!(target: "posthog", "failed to rotate native session id: {}", err);
        }
    }

    /// Identify the user and attach native recordings to them in the background.
    pub(crate) fn identify(
        &self,
        distinct_id: Option<&str>,
        properties: Properties,
        options: CaptureOptions,
    ) {
        let previous_distinct_id = self.core.distinct_id();
        self.core.identify(distinct_id, properties, options);

        if self.is_replay_enabled() && self.replay.is_native() {
            let distinct_id = distinct_id
                .filter(|id| !id.is_empty())
                .map(str::to_owned)
                .unwrap_or(previous_distinct_id);
            let anonymous_id = self.core.anonymous_id();
            let this = self.handle();
            self.tasks.spawn(async move {
                if let Some(this) = this.upgrade() {
                    this.replay.identify(&distinct_id, &anonymous_id).await;
                }
            });
        }
    }
}
