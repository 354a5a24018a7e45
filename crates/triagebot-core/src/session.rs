//! The conversation FSM: one `UserSession` per active user, wiring the
//! states, transition table, and action helpers that drive a task from
//! alert to completion.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::adapters::{AuthAdapter, ChatAdapter};
use crate::fsm::{FsmContext, StateMachine, Transition};
use crate::model::{Answer, AuthState, ChatUser, Performed, Task};
use crate::store::{SuppressionStore, TaskStore};
use crate::time::get_expiration_time;

pub const ESCALATION_TIME: Duration = Duration::hours(2);
pub const BACKOFF_TIME: Duration = Duration::hours(21);
pub const OLD_TASKS_CAPACITY: usize = 8;

/// Dependencies shared read-mostly across every session, held behind an
/// `Arc` rather than a back-reference to the coordinator that owns the
/// session map — avoids a mutual-ownership cycle between the two.
pub struct Services {
    pub chat: Arc<dyn ChatAdapter>,
    pub auth: Arc<dyn AuthAdapter>,
    pub tasks: TaskStore,
    pub suppression: SuppressionStore,
    pub messages: HashMap<String, String>,
    pub reporting_channel: Option<String>,
    /// Local timezone used for escalation-deadline business-hours rollover.
    pub tz: chrono_tz::Tz,
}

impl Services {
    fn message<'a>(&'a self, key: &'a str) -> &'a str {
        self.messages.get(key).map(String::as_str).unwrap_or(key)
    }
}

/// Indents `text` with a leading `> ` per line, used for reasons/comments
/// embedded in chat messages.
pub fn blockquote(text: &str) -> String {
    text.split('\n').map(|line| format!("> {line}")).collect::<Vec<_>>().join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NeedTask,
    ActionPerformedCheck,
    AuthPermissionCheck,
    WaitingOnAuth,
    TaskFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionId {
    HasTasks,
    AlreadyAuthed,
    Cannot2fa,
    PerformedAction,
    DidNotPerform,
    SlowResponseAtActionCheck,
    AllowsAuth,
    DeniesAuth,
    SlowResponseAtAuthCheck,
    AuthCompleted,
    TaskFinishedToNeedTask,
}

fn transitions() -> Vec<Transition<SessionState, TransitionId>> {
    use SessionState::*;
    use TransitionId::*;
    vec![
        Transition { id: HasTasks, source: NeedTask, dest: ActionPerformedCheck },
        Transition { id: AlreadyAuthed, source: ActionPerformedCheck, dest: TaskFinished },
        Transition { id: Cannot2fa, source: ActionPerformedCheck, dest: TaskFinished },
        Transition { id: PerformedAction, source: ActionPerformedCheck, dest: AuthPermissionCheck },
        Transition { id: DidNotPerform, source: ActionPerformedCheck, dest: TaskFinished },
        Transition { id: SlowResponseAtActionCheck, source: ActionPerformedCheck, dest: TaskFinished },
        Transition { id: AllowsAuth, source: AuthPermissionCheck, dest: WaitingOnAuth },
        Transition { id: DeniesAuth, source: AuthPermissionCheck, dest: TaskFinished },
        Transition { id: SlowResponseAtAuthCheck, source: AuthPermissionCheck, dest: TaskFinished },
        Transition { id: AuthCompleted, source: WaitingOnAuth, dest: TaskFinished },
        Transition { id: TaskFinishedToNeedTask, source: TaskFinished, dest: NeedTask },
    ]
}

pub struct UserSession {
    pub user: ChatUser,
    pub username: String,
    queue: VecDeque<Task>,
    pending_task: Option<Task>,
    old_tasks: VecDeque<Task>,
    last_message: Answer,
    last_auth: AuthState,
    escalation_deadline: DateTime<Utc>,
    /// Set by `_complete_task` when the queue is empty; polled by the
    /// coordinator after each `step()` instead of a callback into it.
    pub needs_cleanup: bool,
    services: Arc<Services>,
    fsm: Option<StateMachine<SessionState, TransitionId>>,
}

impl UserSession {
    pub fn new(user: ChatUser, services: Arc<Services>) -> Self {
        let username = user.username.clone();
        let fsm = StateMachine::new(
            vec![
                SessionState::NeedTask,
                SessionState::ActionPerformedCheck,
                SessionState::AuthPermissionCheck,
                SessionState::WaitingOnAuth,
                SessionState::TaskFinished,
            ],
            SessionState::NeedTask,
            transitions(),
        )
        .expect("session FSM table is statically well-formed");

        Self {
            user,
            username,
            queue: VecDeque::new(),
            pending_task: None,
            old_tasks: VecDeque::new(),
            last_message: Answer::Unset,
            last_auth: AuthState::None,
            escalation_deadline: DateTime::<Utc>::MAX_UTC,
            needs_cleanup: false,
            services,
            fsm: Some(fsm),
        }
    }

    pub fn state(&self) -> SessionState {
        self.fsm.as_ref().expect("fsm always present between steps").current()
    }

    pub fn has_work(&self) -> bool {
        !self.queue.is_empty() || self.pending_task.is_some() || self.state() != SessionState::NeedTask
    }

    pub fn old_tasks(&self) -> &VecDeque<Task> {
        &self.old_tasks
    }

    /// Clones the task currently awaiting a response, if any. Used by
    /// `ignore current` to resolve which task is being suppressed.
    pub fn pending_task_snapshot(&self) -> Option<Task> {
        self.pending_task.clone()
    }

    /// Appends a task and immediately runs a suppression sweep over the
    /// whole queue.
    pub async fn add_task(&mut self, task: Task) {
        self.queue.push_back(task);
        self.sweep_suppressed().await;
    }

    async fn sweep_suppressed(&mut self) {
        let ignored = match self.services.suppression.get(&self.username).await {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, username = %self.username, "suppression lookup failed during sweep");
                return;
            }
        };
        let mut kept = VecDeque::with_capacity(self.queue.len());
        while let Some(mut task) = self.queue.pop_front() {
            if let Some(reason) = ignored.get(&task.title) {
                task.comment = reason.clone();
                if let Err(e) = self.services.tasks.set_verifying(&task).await {
                    tracing::warn!(error = %e, hash = %task.hash, "failed to mark suppressed task verified");
                }
            } else {
                kept.push_back(task);
            }
        }
        self.queue = kept;
    }

    pub fn positive_response(&mut self, text: impl Into<String>) {
        self.last_message = Answer::Yes(text.into());
    }

    pub fn negative_response(&mut self, text: impl Into<String>) {
        self.last_message = Answer::No(text.into());
    }

    pub async fn step(&mut self) {
        let mut fsm = self.fsm.take().expect("fsm always present between steps");
        fsm.step(self).await;
        self.fsm = Some(fsm);
    }

    async fn send(&self, key: &str) {
        self.services.chat.send_to_user(&self.user, self.services.message(key)).await;
    }

    async fn render_alert(&self, task: &Task) -> String {
        let reason = blockquote(&task.reason);
        let alert = self.services.message("alert").replace("{description}", &task.description).replace("{reason}", &reason);
        format!("{alert}\n{}", self.services.message("action_prompt"))
    }

    // ---- action/guard helpers ----

    fn performed_answer(&self) -> Option<bool> {
        match &self.last_message {
            Answer::Unset => None,
            Answer::Yes(_) => Some(true),
            Answer::No(_) => Some(false),
        }
    }

    fn slow_response(&self) -> bool {
        Utc::now() > self.escalation_deadline
    }

    async fn next_task(&mut self) {
        let Some(task) = self.queue.pop_front() else { return };
        let message = self.render_alert(&task).await;
        self.services.chat.send_to_user(&self.user, &message).await;
        self.pending_task = Some(task);
        self.last_message = Answer::Unset;
        self.escalation_deadline = get_expiration_time(Utc::now(), ESCALATION_TIME, self.services.tz);
        info!(username = %self.username, "beginning task");
    }

    fn update_task_response(&mut self) {
        if let Some(answer) = self.performed_answer() {
            if let Some(task) = self.pending_task.as_mut() {
                task.performed = if answer { Performed::Yes } else { Performed::No };
                task.comment = self.last_message.text().unwrap_or_default().to_string();
            }
        }
        self.last_message = Answer::Unset;
    }

    async fn update_task_auth(&mut self) {
        let authorized = self.last_auth == AuthState::Authorized;
        if authorized {
            self.send("good_auth").await;
        } else {
            self.send("bad_auth").await;
            self.services.auth.reset(&self.username).await;
        }
        if let Some(task) = self.pending_task.as_mut() {
            task.authenticated = authorized;
        }
    }

    async fn auto_escalate(&mut self) {
        if let Some(task) = self.pending_task.as_mut() {
            let note = "Automatically escalated. No response received.";
            task.comment = if task.comment.is_empty() { note.to_string() } else { format!("{} {note}", task.comment) };
        }
        self.escalation_deadline = DateTime::<Utc>::MAX_UTC;
        self.send("no_response").await;
    }

    async fn act_on_not_performed(&mut self) {
        self.send("escalated").await;
        let Some(channel) = self.services.reporting_channel.clone() else { return };
        let Some(task) = self.pending_task.clone() else { return };
        let comment_text = self.last_message.text().filter(|t| !t.is_empty()).unwrap_or("No comment provided.");
        let report = self
            .services
            .message("report")
            .replace("{username}", self.user.display_name())
            .replace("{title}", &task.title)
            .replace("{description}", &task.description)
            .replace("{comment}", &blockquote(comment_text))
            .replace("{url}", task.url.as_deref().unwrap_or(""));
        self.services.chat.send_to_channel(&channel, &report).await;
    }

    async fn complete_task(&mut self) {
        let Some(task) = self.pending_task.take() else { return };
        if task.performed.as_bool() {
            if let Err(e) = self
                .services
                .suppression
                .ignore(&self.username, &task.title, "auto backoff after confirmation", BACKOFF_TIME)
                .await
            {
                tracing::warn!(error = %e, "failed to record auto-backoff suppression");
            }
        }
        if let Err(e) = self.services.tasks.set_verifying(&task).await {
            tracing::warn!(error = %e, hash = %task.hash, "failed to commit finished task");
        }
        self.last_message = Answer::Unset;
        if self.old_tasks.len() >= OLD_TASKS_CAPACITY {
            self.old_tasks.pop_front();
        }
        self.old_tasks.push_back(task);

        self.sweep_suppressed().await;
        if self.queue.is_empty() {
            self.send("bye").await;
            self.needs_cleanup = true;
        } else {
            self.send("bwtm").await;
        }
    }
}

#[async_trait]
impl FsmContext<SessionState, TransitionId> for UserSession {
    async fn during(&mut self, state: SessionState) {
        if state == SessionState::WaitingOnAuth {
            match self.services.auth.status(&self.username).await {
                Ok(status) => self.last_auth = status,
                Err(e) => tracing::warn!(error = %e, username = %self.username, "auth status poll failed"),
            }
        }
    }

    async fn on_enter(&mut self, state: SessionState) {
        match state {
            SessionState::AuthPermissionCheck => self.send("2fa").await,
            SessionState::WaitingOnAuth => {
                self.send("sending_push").await;
                let reason = self.pending_task.as_ref().map(|t| t.description.clone());
                if let Err(e) = self.services.auth.begin(&self.username, reason.as_deref()).await {
                    tracing::warn!(error = %e, username = %self.username, "failed to begin auth challenge");
                }
            }
            _ => {}
        }
    }

    async fn on_exit(&mut self, state: SessionState) {
        match state {
            SessionState::NeedTask => self.next_task().await,
            SessionState::ActionPerformedCheck => self.update_task_response(),
            SessionState::AuthPermissionCheck => self.last_message = Answer::Unset,
            SessionState::WaitingOnAuth => self.update_task_auth().await,
            SessionState::TaskFinished => self.complete_task().await,
        }
    }

    async fn guard(&mut self, transition: TransitionId) -> bool {
        match transition {
            TransitionId::HasTasks => !self.queue.is_empty(),
            TransitionId::AlreadyAuthed => {
                if self.performed_answer() != Some(true) {
                    return false;
                }
                matches!(self.services.auth.status(&self.username).await, Ok(AuthState::Authorized))
            }
            TransitionId::Cannot2fa => {
                if self.performed_answer() != Some(true) {
                    return false;
                }
                !self.services.auth.can_auth(&self.username).await.unwrap_or(false)
            }
            TransitionId::PerformedAction => self.performed_answer() == Some(true),
            TransitionId::DidNotPerform => self.performed_answer() == Some(false),
            TransitionId::SlowResponseAtActionCheck | TransitionId::SlowResponseAtAuthCheck => self.slow_response(),
            TransitionId::AllowsAuth => self.performed_answer() == Some(true),
            TransitionId::DeniesAuth => self.performed_answer() == Some(false),
            TransitionId::AuthCompleted => {
                matches!(self.last_auth, AuthState::Authorized | AuthState::Denied)
            }
            TransitionId::TaskFinishedToNeedTask => true,
        }
    }

    async fn action(&mut self, transition: TransitionId) {
        match transition {
            TransitionId::Cannot2fa => self.send("no_2fa").await,
            TransitionId::DidNotPerform => self.act_on_not_performed().await,
            TransitionId::SlowResponseAtActionCheck | TransitionId::SlowResponseAtAuthCheck => {
                self.auto_escalate().await
            }
            TransitionId::DeniesAuth => self.send("escalated").await,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubChat {
        sent: tokio::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatAdapter for StubChat {
        async fn connect(&self) -> Result<(), crate::error::ChatError> {
            Ok(())
        }
        async fn list_users(&self) -> Result<Vec<ChatUser>, crate::error::ChatError> {
            Ok(vec![])
        }
        async fn drain_messages(&self) -> Result<Vec<crate::model::Message>, crate::error::ChatError> {
            Ok(vec![])
        }
        async fn send_to_channel(&self, channel_id: &str, text: &str) {
            self.sent.lock().await.push((channel_id.to_string(), text.to_string()));
        }
        async fn send_to_user(&self, user: &ChatUser, text: &str) {
            self.sent.lock().await.push((user.id.clone(), text.to_string()));
        }
    }

    struct StubAuth {
        can_auth: bool,
        authorized: AtomicBool,
    }

    #[async_trait]
    impl AuthAdapter for StubAuth {
        async fn can_auth(&self, _username: &str) -> Result<bool, AuthError> {
            Ok(self.can_auth)
        }
        async fn begin(&self, _username: &str, _reason: Option<&str>) -> Result<(), AuthError> {
            self.authorized.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn status(&self, _username: &str) -> Result<AuthState, AuthError> {
            Ok(if self.authorized.load(Ordering::SeqCst) { AuthState::Authorized } else { AuthState::None })
        }
        async fn reset(&self, _username: &str) {
            self.authorized.store(false, Ordering::SeqCst);
        }
    }

    fn messages() -> HashMap<String, String> {
        [
            ("alert", "{description}\n{reason}"),
            ("action_prompt", "Did you do this?"),
            ("2fa", "2fa?"),
            ("sending_push", "sending push"),
            ("good_auth", "good auth"),
            ("bad_auth", "bad auth"),
            ("escalated", "escalated"),
            ("no_2fa", "no 2fa"),
            ("no_response", "no response"),
            ("bwtm", "back when they match"),
            ("bye", "bye"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    async fn session(can_auth: bool) -> (UserSession, Arc<StubChat>) {
        let chat = Arc::new(StubChat { sent: tokio::sync::Mutex::new(vec![]) });
        let db = std::sync::Arc::new(tokio::sync::Mutex::new(crate::db::Database::open_in_memory().await.unwrap()));
        let services = Arc::new(Services {
            chat: chat.clone(),
            auth: Arc::new(StubAuth { can_auth, authorized: AtomicBool::new(false) }),
            tasks: TaskStore::new(db.clone()),
            suppression: SuppressionStore::new(db),
            messages: messages(),
            reporting_channel: None,
            tz: chrono_tz::America::Los_Angeles,
        });
        let user = ChatUser { id: "U1".into(), username: "alice".into(), first_name: Some("Alice".into()), real_name: None };
        (UserSession::new(user, services), chat)
    }

    fn sample_task(store_hash: &str) -> Task {
        Task {
            hash: store_hash.to_string(),
            title: "ssh_root".into(),
            username: "alice".into(),
            description: "ssh as root".into(),
            reason: "unexpected root login".into(),
            url: None,
            event_time: Utc::now(),
            status: crate::model::TaskStatus::InProgress,
            performed: Performed::Unknown,
            comment: String::new(),
            authenticated: false,
        }
    }

    #[tokio::test]
    async fn happy_path_with_2fa_completes_and_suppresses() {
        let (mut session, _chat) = session(true).await;
        session.add_task(sample_task("H1")).await;

        session.step().await; // need_task -> action_performed_check (alerts)
        assert_eq!(session.state(), SessionState::ActionPerformedCheck);

        session.positive_response("yes I did this");
        session.step().await; // -> auth_permission_check
        assert_eq!(session.state(), SessionState::AuthPermissionCheck);

        session.positive_response("yes");
        session.step().await; // -> waiting_on_auth, begin() flips the stub authorized
        assert_eq!(session.state(), SessionState::WaitingOnAuth);

        session.step().await; // during() observes AUTHORIZED -> task_finished
        assert_eq!(session.state(), SessionState::TaskFinished);

        session.step().await; // -> need_task, completes + cleans up
        assert_eq!(session.state(), SessionState::NeedTask);
        assert!(session.needs_cleanup);
        assert_eq!(session.old_tasks().len(), 1);
        assert!(session.old_tasks()[0].performed.as_bool());
        assert!(session.old_tasks()[0].authenticated);
    }

    #[tokio::test]
    async fn no_2fa_capability_short_circuits() {
        let (mut session, _chat) = session(false).await;
        session.add_task(sample_task("H2")).await;
        session.step().await; // action_performed_check
        session.positive_response("yes");
        session.step().await; // guard 3 fires directly to task_finished
        assert_eq!(session.state(), SessionState::TaskFinished);
    }

    #[tokio::test]
    async fn denial_does_not_suppress() {
        let (mut session, _chat) = session(true).await;
        session.add_task(sample_task("H3")).await;
        session.step().await;
        session.negative_response("no I did not");
        session.step().await;
        assert_eq!(session.state(), SessionState::TaskFinished);
        session.step().await;
        assert!(!session.old_tasks()[0].performed.as_bool());
    }
}
