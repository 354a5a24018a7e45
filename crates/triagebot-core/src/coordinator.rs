//! Main loop: periodic task polling, message dispatch, per-session
//! stepping, admission (blacklist/invalid-user short-circuits), reporting.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::adapters::{AuthAdapter, ChatAdapter};
use crate::commands::{self, CommandTable, Handler};
use crate::config::Config;
use crate::db::Database;
use crate::error::AdmitError;
use crate::model::{ChatUser, NewTask, Task};
use crate::session::{Services, UserSession};
use crate::store::{Blacklist, SuppressionStore, TaskStore};

const TASK_POLL: StdDuration = StdDuration::from_secs(60);
const LOOP_SLEEP: StdDuration = StdDuration::from_millis(100);

pub struct Coordinator {
    chat: Arc<dyn ChatAdapter>,
    services: Arc<Services>,
    blacklist: Blacklist,
    commands: CommandTable,
    messages: BTreeMap<String, String>,
    roster: HashMap<String, ChatUser>,
    roster_by_name: HashMap<String, ChatUser>,
    sessions: HashMap<String, UserSession>,
    last_task_poll: std::time::Instant,
}

impl Coordinator {
    pub fn new(
        chat: Arc<dyn ChatAdapter>,
        auth: Arc<dyn AuthAdapter>,
        db: Arc<Mutex<Database>>,
        config: Config,
    ) -> Self {
        let messages: BTreeMap<String, String> = config.messages.clone().into_iter().collect();
        let services = Arc::new(Services {
            chat: chat.clone(),
            auth,
            tasks: TaskStore::new(db.clone()),
            suppression: SuppressionStore::new(db.clone()),
            messages: config.messages.into_iter().collect(),
            reporting_channel: config.reporting_channel,
            tz: config.timezone,
        });

        Self {
            chat,
            services,
            blacklist: Blacklist::new(db),
            commands: config.commands,
            messages,
            roster: HashMap::new(),
            roster_by_name: HashMap::new(),
            sessions: HashMap::new(),
            last_task_poll: std::time::Instant::now() - TASK_POLL,
        }
    }

    /// Connects to chat, loads the roster, and re-admits any tasks left
    /// `IN_PROGRESS` by a previous run.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.chat.connect().await?;
        let users = self.chat.list_users().await?;
        for user in users {
            self.roster_by_name.insert(user.username.clone(), user.clone());
            self.roster.insert(user.id.clone(), user);
        }
        info!(count = self.roster.len(), "loaded chat roster");

        let active = self.services.tasks.active_tasks().await?;
        for task in active {
            info!(username = %task.username, "recovering in-progress task");
            self.admit(task).await;
        }
        Ok(())
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.start().await?;
        loop {
            self.tick().await;
            tokio::time::sleep(LOOP_SLEEP).await;
        }
    }

    async fn tick(&mut self) {
        if self.last_task_poll.elapsed() >= TASK_POLL {
            self.last_task_poll = std::time::Instant::now();
            match self.services.tasks.new_tasks().await {
                Ok(tasks) => {
                    for task in tasks {
                        self.admit(task).await;
                    }
                }
                Err(e) => warn!(error = %e, "failed to poll new tasks"),
            }
        }

        match self.chat.drain_messages().await {
            Ok(messages) => {
                for message in messages {
                    self.handle_message(message).await;
                }
            }
            Err(e) => warn!(error = %e, "failed to drain chat messages"),
        }

        let user_ids: Vec<String> = self.sessions.keys().cloned().collect();
        for user_id in user_ids {
            if let Some(session) = self.sessions.get_mut(&user_id) {
                session.step().await;
                if session.needs_cleanup && !session.has_work() {
                    self.sessions.remove(&user_id);
                    info!(%user_id, "removed completed session");
                }
            }
        }
    }

    /// Validates the username, enforces the blacklist, and either creates a
    /// session (greeting on first contact) or hands the task to an existing
    /// one. Invalid/blacklisted tasks are coerced straight to
    /// `AWAITING_VERIFICATION` with a diagnostic comment.
    async fn admit(&mut self, mut task: Task) {
        let Some(user) = self.roster_by_name.get(&task.username).cloned() else {
            self.reject(&mut task, AdmitError::InvalidUser).await;
            return;
        };

        match self.blacklist.contains(&task.username).await {
            Ok(true) => {
                self.reject(&mut task, AdmitError::Blacklisted).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "blacklist lookup failed, admitting cautiously");
            }
        }

        if !self.sessions.contains_key(&user.id) {
            let greeting = self
                .messages
                .get("greeting")
                .map(|t| t.replace("{name}", user.display_name()))
                .unwrap_or_default();
            self.chat.send_to_user(&user, &greeting).await;
            self.sessions.insert(user.id.clone(), UserSession::new(user.clone(), self.services.clone()));
        }

        if let Err(e) = self.services.tasks.set_in_progress(&task).await {
            warn!(error = %e, "failed to mark task in-progress");
            return;
        }

        if let Some(session) = self.sessions.get_mut(&user.id) {
            session.add_task(task).await;
        }
    }

    /// Records why admission failed and coerces the task straight to
    /// `AWAITING_VERIFICATION` so it surfaces in the review queue instead of
    /// looping back through `new_tasks()` forever.
    async fn reject(&self, task: &mut Task, reason: AdmitError) {
        warn!(username = %task.username, error = %reason, "rejecting task at admission");
        task.comment = reason.to_string();
        if let Err(e) = self.services.tasks.set_verifying(task).await {
            warn!(error = %e, "failed to escalate rejected task");
        }
    }

    async fn handle_message(&mut self, message: crate::model::Message) {
        let Some(user) = self.roster.get(&message.user_id).cloned() else {
            warn!(user_id = %message.user_id, "message from unknown user");
            return;
        };
        let Some((name, args)) = commands::parse_command(&message.text) else {
            return;
        };
        let Some(spec) = self.commands.get(&name).cloned() else {
            if let Some(bad_command) = self.messages.get("bad_command") {
                self.chat.send_to_user(&user, bad_command).await;
            }
            return;
        };

        info!(command = %name, username = %user.username, "handling command");
        let outcome = self.run_handler(spec.handler, &user, &args).await;

        let template = match outcome {
            Some(true) => spec.success_msg.as_deref(),
            Some(false) => spec.failure_msg.as_deref(),
            None => None,
        };
        if let Some(template) = template {
            self.chat.send_to_user(&user, template).await;
        }
    }

    async fn run_handler(&mut self, handler: Handler, user: &ChatUser, args: &[String]) -> Option<bool> {
        match handler {
            Handler::Hi => {
                let template = self.messages.get("hi")?.replace("{name}", user.display_name());
                self.chat.send_to_user(user, &template).await;
                None
            }
            Handler::Help => {
                let show_hidden = args.iter().any(|a| a == "-a");
                let text = commands::render_help(&self.commands, &self.messages, show_hidden);
                self.chat.send_to_user(user, &text).await;
                None
            }
            Handler::AddToBlacklist => match self.blacklist.contains(&user.username).await {
                Ok(true) => Some(false),
                Ok(false) => {
                    let _ = self.blacklist.add(&user.username).await;
                    Some(true)
                }
                Err(_) => Some(false),
            },
            Handler::RemoveFromBlacklist => match self.blacklist.contains(&user.username).await {
                Ok(false) => Some(false),
                Ok(true) => {
                    let _ = self.blacklist.remove(&user.username).await;
                    Some(true)
                }
                Err(_) => Some(false),
            },
            Handler::PositiveResponse => {
                if let Some(session) = self.sessions.get_mut(&user.id) {
                    session.positive_response(args.join(" "));
                }
                None
            }
            Handler::NegativeResponse => {
                if let Some(session) = self.sessions.get_mut(&user.id) {
                    session.negative_response(args.join(" "));
                }
                None
            }
            Handler::Ignore => self.handle_ignore(user, args).await,
            Handler::Test => {
                let new_task = NewTask {
                    title: "testing_alert".into(),
                    username: user.username.clone(),
                    description: "Testing alert".into(),
                    reason: "triggered via the test command".into(),
                    url: None,
                    hash: None,
                };
                match self.services.tasks.create(new_task).await {
                    Ok(_) => Some(true),
                    Err(_) => Some(false),
                }
            }
        }
    }

    async fn handle_ignore(&mut self, user: &ChatUser, args: &[String]) -> Option<bool> {
        let parsed = commands::parse_ignore_args(args)?;
        let session = self.sessions.get(&user.id)?;
        let task = if parsed.target_last {
            session.old_tasks().back().cloned()
        } else {
            session.pending_task_snapshot()
        };
        let task = task?;

        if parsed.duration <= chrono::Duration::zero() {
            if let Some(text) = self.messages.get("ignore_no_time") {
                self.chat.send_to_user(user, text).await;
            }
            return Some(false);
        }

        // A too-long duration is capped, not rejected: tell the user, then
        // proceed with the capped duration.
        if parsed.was_capped {
            if let Some(text) = self.messages.get("ignore_time") {
                self.chat.send_to_user(user, text).await;
            }
        }

        match self.services.suppression.ignore(&user.username, &task.title, "ignored", parsed.duration).await {
            Ok(()) => Some(true),
            Err(_) => Some(false),
        }
    }
}
