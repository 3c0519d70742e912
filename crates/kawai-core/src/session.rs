//! The palette session state machine.
//!
//! [`Session`] owns the query, loading flag, answer and error. It never
//! performs I/O: [`Session::handle`] applies one [`SessionEvent`] and returns
//! the [`Effect`]s the runtime must carry out. Timers and fetches are tagged
//! with the debounce generation that spawned them so late results for an old
//! query are dropped instead of overwriting newer state.

use std::time::Duration;

use kawai_client::{AnswerError, AnswerOutcome, ApiKey};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    debounce::{Debounce, DebounceSettings, Debouncer},
    host::HostError,
};

pub const SECRET_FAILED_MESSAGE: &str = "Failed to retrieve API key. Please check the logs.";
pub const HIDE_FAILED_MESSAGE: &str = "Failed to hide window. Please check the logs.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Awaiting,
    Answered,
    Failed,
}

/// Identifies one fetch: the generation it was issued in and the trimmed
/// query it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub generation: u64,
    pub query: String,
}

#[derive(Debug)]
pub enum SessionEvent {
    Mounted,
    QueryChanged(String),
    TimerFired {
        generation: u64,
    },
    FetchSettled {
        ticket: FetchTicket,
        outcome: Result<AnswerOutcome, AnswerError>,
    },
    SecretResolved(Result<Option<ApiKey>, HostError>),
    ClearAndFocus,
    EscapePressed,
    HideFailed(HostError),
    Unmount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    RetrieveSecret,
    ArmTimer { generation: u64, delay: Duration },
    CancelTimer,
    StartFetch {
        ticket: FetchTicket,
        api_key: Option<ApiKey>,
    },
    FocusInput,
    HideWindow,
    Shutdown,
}

/// What the view layer renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub query: String,
    pub loading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub phase: Phase,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Session::new(DebounceSettings::default()).snapshot()
    }
}

#[derive(Debug)]
pub struct Session {
    query: String,
    loading: bool,
    answer: String,
    error: Option<String>,
    api_key: Option<ApiKey>,
    secret_requested: bool,
    debouncer: Debouncer,
    in_flight: Option<FetchTicket>,
    mounted: bool,
}

impl Session {
    pub fn new(settings: DebounceSettings) -> Self {
        Self {
            query: String::new(),
            loading: false,
            answer: String::new(),
            error: None,
            api_key: None,
            secret_requested: false,
            debouncer: Debouncer::new(settings),
            in_flight: None,
            mounted: false,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn in_flight(&self) -> Option<&FetchTicket> {
        self.in_flight.as_ref()
    }

    pub fn phase(&self) -> Phase {
        if self.error.is_some() {
            Phase::Failed
        } else if !self.answer.is_empty() {
            Phase::Answered
        } else if self.loading {
            Phase::Awaiting
        } else {
            Phase::Idle
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            query: self.query.clone(),
            loading: self.loading,
            answer: (!self.answer.is_empty()).then(|| self.answer.clone()),
            error: self.error.clone(),
            phase: self.phase(),
        }
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        match event {
            SessionEvent::Mounted => self.on_mounted(),
            SessionEvent::QueryChanged(query) => self.on_query_changed(query),
            SessionEvent::TimerFired { generation } => self.on_timer_fired(generation),
            SessionEvent::FetchSettled { ticket, outcome } => {
                self.on_fetch_settled(&ticket, outcome);
                Vec::new()
            }
            SessionEvent::SecretResolved(result) => {
                self.on_secret_resolved(result);
                Vec::new()
            }
            SessionEvent::ClearAndFocus => {
                if !self.answer.is_empty() {
                    self.answer.clear();
                }
                vec![Effect::FocusInput]
            }
            SessionEvent::EscapePressed => vec![Effect::HideWindow],
            SessionEvent::HideFailed(error) => {
                warn!(target: "kawai_session", error = %error, "failed to hide window");
                self.fail(HIDE_FAILED_MESSAGE.to_string());
                Vec::new()
            }
            SessionEvent::Unmount => self.on_unmount(),
        }
    }

    fn on_mounted(&mut self) -> Vec<Effect> {
        self.mounted = true;
        if self.api_key.is_none() && !self.secret_requested {
            self.secret_requested = true;
            vec![Effect::RetrieveSecret]
        } else {
            Vec::new()
        }
    }

    fn on_query_changed(&mut self, query: String) -> Vec<Effect> {
        let decision = self.debouncer.on_query_changed(&query);
        self.query = query;

        match decision {
            // The previous answer or error stays up until the fetch is issued.
            Debounce::Arm { generation, delay } => {
                self.loading = true;
                vec![Effect::ArmTimer { generation, delay }]
            }
            Debounce::Disarm => {
                self.loading = false;
                self.answer.clear();
                self.error = None;
                vec![Effect::CancelTimer]
            }
        }
    }

    fn on_timer_fired(&mut self, generation: u64) -> Vec<Effect> {
        if !self.mounted || !self.debouncer.on_timer_fired(generation) {
            return Vec::new();
        }

        let ticket = FetchTicket {
            generation,
            query: self.query.trim().to_string(),
        };
        self.answer.clear();
        self.error = None;
        self.loading = true;
        self.in_flight = Some(ticket.clone());
        debug!(target: "kawai_session", generation, "issuing fetch");

        vec![Effect::StartFetch {
            ticket,
            api_key: self.api_key.clone(),
        }]
    }

    fn on_fetch_settled(
        &mut self,
        ticket: &FetchTicket,
        outcome: Result<AnswerOutcome, AnswerError>,
    ) {
        if self.in_flight.as_ref() == Some(ticket) {
            self.in_flight = None;
        }

        if !self.mounted {
            debug!(
                target: "kawai_session",
                generation = ticket.generation,
                "dropping result after unmount"
            );
            return;
        }
        if !self.debouncer.is_current(ticket.generation) {
            debug!(
                target: "kawai_session",
                generation = ticket.generation,
                current = self.debouncer.generation(),
                "dropping stale result"
            );
            return;
        }

        self.loading = false;
        match outcome {
            Ok(AnswerOutcome::TooShort) => {
                self.answer.clear();
            }
            Ok(answer) => {
                self.error = None;
                self.answer = answer.display_text().to_string();
            }
            Err(error) => {
                warn!(
                    target: "kawai_session",
                    error = %error,
                    generation = ticket.generation,
                    "fetch failed"
                );
                self.fail(error.user_message());
            }
        }
    }

    fn on_secret_resolved(&mut self, result: Result<Option<ApiKey>, HostError>) {
        self.secret_requested = false;
        match result {
            Ok(Some(key)) => {
                info!(target: "kawai_session", "API key retrieved");
                self.api_key = Some(key);
            }
            Ok(None) => {
                warn!(target: "kawai_session", "no API key bound");
                self.api_key = None;
            }
            Err(error) => {
                warn!(target: "kawai_session", error = %error, "failed to retrieve API key");
                self.api_key = None;
                self.fail(SECRET_FAILED_MESSAGE.to_string());
            }
        }
    }

    fn on_unmount(&mut self) -> Vec<Effect> {
        self.mounted = false;
        self.debouncer.cancel();
        self.loading = false;
        self.in_flight = None;
        vec![Effect::CancelTimer, Effect::Shutdown]
    }

    /// An error always replaces the answer.
    fn fail(&mut self, message: String) {
        self.answer.clear();
        self.error = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kawai_client::{prompt::FALLBACK_ANSWER, ClientError};

    const LONG_QUERY: &str = "how do I undo a git commit";

    fn mounted_session() -> Session {
        let mut session = Session::new(DebounceSettings::default());
        assert_eq!(
            session.handle(SessionEvent::Mounted),
            vec![Effect::RetrieveSecret]
        );
        session.handle(SessionEvent::SecretResolved(Ok(Some(ApiKey::new("k")))));
        session
    }

    /// Sends a qualifying query and returns the generation of the armed timer.
    fn type_query(session: &mut Session, text: &str) -> u64 {
        match session.handle(SessionEvent::QueryChanged(text.into())).as_slice() {
            [Effect::ArmTimer { generation, .. }] => *generation,
            other => panic!("expected a single ArmTimer, got {other:?}"),
        }
    }

    fn fire(session: &mut Session, generation: u64) -> FetchTicket {
        match session
            .handle(SessionEvent::TimerFired { generation })
            .as_slice()
        {
            [Effect::StartFetch { ticket, .. }] => ticket.clone(),
            other => panic!("expected StartFetch, got {other:?}"),
        }
    }

    fn settle(
        session: &mut Session,
        ticket: FetchTicket,
        outcome: Result<AnswerOutcome, AnswerError>,
    ) {
        let effects = session.handle(SessionEvent::FetchSettled { ticket, outcome });
        assert!(effects.is_empty());
    }

    fn answered_session(answer: &str) -> Session {
        let mut session = mounted_session();
        let generation = type_query(&mut session, LONG_QUERY);
        let ticket = fire(&mut session, generation);
        settle(&mut session, ticket, Ok(AnswerOutcome::Answered(answer.into())));
        assert_eq!(session.phase(), Phase::Answered);
        session
    }

    fn network_error(message: &str) -> AnswerError {
        AnswerError::Network(ClientError::Http(message.into()))
    }

    #[test]
    fn starts_idle() {
        let session = Session::new(DebounceSettings::default());
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.query(), "");
        assert!(!session.has_api_key());
        assert_eq!(SessionSnapshot::default().phase, Phase::Idle);
    }

    #[test]
    fn short_query_clears_everything_synchronously() {
        let mut session = answered_session("git reset HEAD~1");

        let effects = session.handle(SessionEvent::QueryChanged("git".into()));

        assert_eq!(effects, vec![Effect::CancelTimer]);
        assert!(!session.is_loading());
        assert_eq!(session.answer(), "");
        assert_eq!(session.error(), None);
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn crossing_threshold_awaits_immediately() {
        let mut session = mounted_session();
        for partial in ["h", "ho", "how do"] {
            assert_eq!(
                session.handle(SessionEvent::QueryChanged(partial.into())),
                vec![Effect::CancelTimer]
            );
            assert_eq!(session.phase(), Phase::Idle);
        }

        type_query(&mut session, LONG_QUERY);

        assert!(session.is_loading());
        assert_eq!(session.phase(), Phase::Awaiting);
    }

    #[test]
    fn rearming_keeps_answer_until_request_is_issued() {
        let mut session = answered_session("git reset");

        let generation = type_query(&mut session, "how do I undo a git commit safely");

        assert!(session.is_loading());
        assert_eq!(session.answer(), "git reset");
        assert_eq!(session.snapshot().answer.as_deref(), Some("git reset"));

        fire(&mut session, generation);

        assert_eq!(session.answer(), "");
        assert!(session.is_loading());
        assert_eq!(session.phase(), Phase::Awaiting);
    }

    #[test]
    fn rearming_keeps_error_until_request_is_issued() {
        let mut session = mounted_session();
        let generation = type_query(&mut session, LONG_QUERY);
        let ticket = fire(&mut session, generation);
        settle(&mut session, ticket, Err(network_error("connection reset")));
        assert_eq!(session.phase(), Phase::Failed);

        let generation = type_query(&mut session, "how do I undo a git commit safely");
        assert!(session.error().is_some());
        assert!(session.is_loading());

        fire(&mut session, generation);
        assert_eq!(session.error(), None);
        assert_eq!(session.phase(), Phase::Awaiting);
    }

    #[test]
    fn only_latest_generation_fetches() {
        let mut session = mounted_session();
        let first = type_query(&mut session, "how do I undo");
        let second = type_query(&mut session, LONG_QUERY);

        assert!(session
            .handle(SessionEvent::TimerFired { generation: first })
            .is_empty());
        let ticket = fire(&mut session, second);

        assert_eq!(ticket.query, LONG_QUERY);
        assert_eq!(session.in_flight(), Some(&ticket));
        assert_eq!(session.phase(), Phase::Awaiting);
    }

    #[test]
    fn fetch_ticket_carries_trimmed_query_and_key() {
        let mut session = mounted_session();
        let generation = type_query(&mut session, "   rust string to int   ");

        let effects = session.handle(SessionEvent::TimerFired { generation });

        assert_eq!(
            effects,
            vec![Effect::StartFetch {
                ticket: FetchTicket {
                    generation,
                    query: "rust string to int".into()
                },
                api_key: Some(ApiKey::new("k")),
            }]
        );
    }

    #[test]
    fn success_sets_answer_and_clears_loading() {
        let mut session = mounted_session();
        let generation = type_query(&mut session, LONG_QUERY);
        let ticket = fire(&mut session, generation);

        settle(&mut session, ticket, Ok(AnswerOutcome::Answered("X".into())));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.answer.as_deref(), Some("X"));
        assert_eq!(snapshot.error, None);
        assert!(!snapshot.loading);
        assert_eq!(snapshot.phase, Phase::Answered);
        assert!(session.in_flight().is_none());
    }

    #[test]
    fn missing_candidates_shows_fallback_not_error() {
        let mut session = mounted_session();
        let generation = type_query(&mut session, LONG_QUERY);
        let ticket = fire(&mut session, generation);

        settle(&mut session, ticket, Ok(AnswerOutcome::NoClearAnswer));

        assert_eq!(session.answer(), FALLBACK_ANSWER);
        assert_eq!(session.error(), None);
        assert_eq!(session.phase(), Phase::Answered);
    }

    #[test]
    fn network_error_fails_and_clears_answer() {
        let mut session = mounted_session();
        let generation = type_query(&mut session, LONG_QUERY);
        let ticket = fire(&mut session, generation);

        settle(&mut session, ticket, Err(network_error("connection reset")));

        assert!(session.error().is_some_and(|message| !message.is_empty()));
        assert_eq!(session.answer(), "");
        assert!(!session.is_loading());
        assert_eq!(session.phase(), Phase::Failed);
    }

    #[test]
    fn missing_key_surfaces_configuration_error() {
        let mut session = Session::new(DebounceSettings::default());
        session.handle(SessionEvent::Mounted);
        session.handle(SessionEvent::SecretResolved(Ok(None)));
        let generation = type_query(&mut session, LONG_QUERY);

        let effects = session.handle(SessionEvent::TimerFired { generation });
        let [Effect::StartFetch {
            ticket,
            api_key: None,
        }] = effects.as_slice()
        else {
            panic!("expected keyless fetch, got {effects:?}");
        };
        settle(&mut session, ticket.clone(), Err(AnswerError::MissingApiKey));

        assert_eq!(
            session.error(),
            Some("API key is not set. Please check your configuration.")
        );
        assert_eq!(session.phase(), Phase::Failed);
        assert!(!session.is_loading());
    }

    #[test]
    fn too_short_result_clears_answer() {
        let mut session = mounted_session();
        let generation = type_query(&mut session, LONG_QUERY);
        let ticket = fire(&mut session, generation);

        settle(&mut session, ticket, Ok(AnswerOutcome::TooShort));

        assert_eq!(session.phase(), Phase::Idle);
        assert!(!session.is_loading());
    }

    #[test]
    fn stale_result_does_not_clobber_newer_answer() {
        let mut session = mounted_session();
        let old_generation = type_query(&mut session, "python sort a list");
        let old_ticket = fire(&mut session, old_generation);

        let new_generation = type_query(&mut session, LONG_QUERY);
        let new_ticket = fire(&mut session, new_generation);
        settle(
            &mut session,
            new_ticket,
            Ok(AnswerOutcome::Answered("git reset HEAD~1".into())),
        );

        settle(
            &mut session,
            old_ticket,
            Ok(AnswerOutcome::Answered("sorted(xs)".into())),
        );

        assert_eq!(session.answer(), "git reset HEAD~1");
        assert_eq!(session.phase(), Phase::Answered);
    }

    #[test]
    fn stale_error_does_not_fail_pending_query() {
        let mut session = mounted_session();
        let old_generation = type_query(&mut session, "python sort a list");
        let old_ticket = fire(&mut session, old_generation);
        type_query(&mut session, LONG_QUERY);

        settle(&mut session, old_ticket, Err(network_error("boom")));

        assert_eq!(session.error(), None);
        assert!(session.is_loading());
        assert_eq!(session.phase(), Phase::Awaiting);
    }

    #[test]
    fn clear_and_focus_clears_answer_only() {
        let mut session = answered_session("git reset HEAD~1");

        let effects = session.handle(SessionEvent::ClearAndFocus);

        assert_eq!(effects, vec![Effect::FocusInput]);
        assert_eq!(session.answer(), "");
        assert_eq!(session.query(), LONG_QUERY);
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn clear_and_focus_without_answer_only_refocuses() {
        let mut session = mounted_session();
        session.handle(SessionEvent::QueryChanged("short".into()));
        let before = session.snapshot();

        let effects = session.handle(SessionEvent::ClearAndFocus);

        assert_eq!(effects, vec![Effect::FocusInput]);
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn escape_requests_hide_and_failure_is_non_fatal() {
        let mut session = mounted_session();
        assert_eq!(
            session.handle(SessionEvent::EscapePressed),
            vec![Effect::HideWindow]
        );

        session.handle(SessionEvent::HideFailed(HostError::Disconnected));
        assert_eq!(session.error(), Some(HIDE_FAILED_MESSAGE));

        let generation = type_query(&mut session, LONG_QUERY);
        fire(&mut session, generation);
        assert_eq!(session.error(), None);
        assert_eq!(session.phase(), Phase::Awaiting);
    }

    #[test]
    fn secret_failure_surfaces_error() {
        let mut session = Session::new(DebounceSettings::default());
        session.handle(SessionEvent::Mounted);

        session.handle(SessionEvent::SecretResolved(Err(HostError::Rejected(
            "denied".into(),
        ))));

        assert_eq!(session.error(), Some(SECRET_FAILED_MESSAGE));
        assert!(!session.has_api_key());
    }

    #[test]
    fn remount_retries_secret_only_when_missing() {
        let mut session = Session::new(DebounceSettings::default());
        assert_eq!(
            session.handle(SessionEvent::Mounted),
            vec![Effect::RetrieveSecret]
        );
        assert!(
            session.handle(SessionEvent::Mounted).is_empty(),
            "request already outstanding"
        );
        session.handle(SessionEvent::SecretResolved(Ok(None)));
        assert_eq!(
            session.handle(SessionEvent::Mounted),
            vec![Effect::RetrieveSecret]
        );
        session.handle(SessionEvent::SecretResolved(Ok(Some(ApiKey::new("k")))));
        assert!(session.handle(SessionEvent::Mounted).is_empty());
    }

    #[test]
    fn unmount_cancels_timer_and_ignores_late_results() {
        let mut session = mounted_session();
        let generation = type_query(&mut session, LONG_QUERY);
        let ticket = fire(&mut session, generation);

        let effects = session.handle(SessionEvent::Unmount);
        assert_eq!(effects, vec![Effect::CancelTimer, Effect::Shutdown]);

        settle(&mut session, ticket, Ok(AnswerOutcome::Answered("late".into())));
        assert_eq!(session.answer(), "");
        assert!(!session.is_loading());
    }

    #[test]
    fn timer_after_unmount_is_ignored() {
        let mut session = mounted_session();
        let generation = type_query(&mut session, LONG_QUERY);
        session.handle(SessionEvent::Unmount);

        assert!(session
            .handle(SessionEvent::TimerFired { generation })
            .is_empty());
    }

    #[test]
    fn snapshot_serializes_for_the_view() {
        let mut session = mounted_session();
        type_query(&mut session, LONG_QUERY);

        let value = serde_json::to_value(session.snapshot()).expect("serialize");

        assert_eq!(
            value,
            serde_json::json!({
                "query": LONG_QUERY,
                "loading": true,
                "phase": "awaiting"
            })
        );
    }
}
