//! The bot process: one `tokio::select!` loop over chat events, monitor
//! alerts, finished launches and shutdown.
//!
//! A standby also runs the [`HealthMonitor`] under a child cancellation
//! token, so promotion can stop it without stopping the process.

pub mod pending;

use crate::channel::telegram::{TelegramApi, TelegramChannel, escape_html};
use crate::channel::{Channel, ChannelEvent, Gateway, InlineButton, OutboundMessage};
use crate::config::FleetConfig;
use crate::credential::{self, Credential, CredentialSource, CredentialSources, Resolved};
use crate::error::FleetError;
use crate::fleet::{FleetEntry, FleetRegistry};
use crate::health::{self, Drill, HealthAssessment, LivePrimaryProbe, PrimaryProbe};
use crate::identity::{IdentityStore, Role};
use crate::monitor::{Alert, HealthMonitor};
use crate::process::{OsProcessManager, ProcessManager};
use crate::promotion::{PromotionOutcome, Promoter};
use crate::supervisor::instance::{InstanceFeatures, InstanceManifest};
use crate::supervisor::{LaunchReport, Supervisor};
use crate::texts::TextCatalog;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail};
use pending::PendingInputs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// A launch finished in the background.
#[derive(Debug)]
struct LaunchDone {
    chat_id: i64,
    result: std::result::Result<LaunchReport, FleetError>,
}

/// Everything a [`BotRunner`] is built from.
pub struct BotParts {
    pub config: FleetConfig,
    pub channel: Arc<dyn Channel>,
    pub credential: Credential,
    pub role: Role,
    pub features: InstanceFeatures,
    pub probe: Arc<dyn PrimaryProbe>,
    pub supervisor: Arc<Supervisor>,
    pub static_primary: Option<Credential>,
}

pub struct BotRunner {
    config: FleetConfig,
    channel: Arc<dyn Channel>,
    credential: Credential,
    role: Role,
    features: InstanceFeatures,
    probe: Arc<dyn PrimaryProbe>,
    supervisor: Arc<Supervisor>,
    identity: IdentityStore,
    static_primary: Option<Credential>,
    promoter: Promoter,
    drill: Drill,
    texts: TextCatalog,
    pending: PendingInputs,
    latest: Option<watch::Receiver<Option<HealthAssessment>>>,
    monitor_cancel: Option<CancellationToken>,
    alert_tx: mpsc::Sender<Alert>,
    alert_rx: mpsc::Receiver<Alert>,
    launch_tx: mpsc::Sender<LaunchDone>,
    launch_rx: mpsc::Receiver<LaunchDone>,
}

impl BotRunner {
    pub fn new(parts: BotParts) -> Self {
        let BotParts {
            config,
            channel,
            credential,
            role,
            features,
            probe,
            supervisor,
            static_primary,
        } = parts;
        let identity = IdentityStore::new(config.identity_path());
        let promoter = Promoter::new(
            identity.clone(),
            config.primary.credential_file.clone(),
            static_primary.clone(),
        );
        let (alert_tx, alert_rx) = mpsc::channel(8);
        let (launch_tx, launch_rx) = mpsc::channel(8);
        Self {
            drill: Drill::new(config.drill_path()),
            texts: TextCatalog::load(&config.texts_path()),
            pending: PendingInputs::new(
                Duration::from_secs(config.pending.ttl_secs),
                config.pending.capacity,
            ),
            config,
            channel,
            credential,
            role,
            features,
            probe,
            supervisor,
            identity,
            static_primary,
            promoter,
            latest: None,
            monitor_cancel: None,
            alert_tx,
            alert_rx,
            launch_tx,
            launch_rx,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Run until `cancel` fires or the channel closes.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<ChannelEvent>(64);
        let channel = self.channel.clone();
        let poll_cancel = cancel.clone();
        tokio::spawn(async move {
            channel.run(tx, poll_cancel).await;
        });

        if !self.role.is_primary() && self.features.monitor {
            if self.config.alert_chats().is_empty() {
                tracing::warn!(
                    "monitor running with no alert recipients; set admin_user_ids or alert_chat_ids"
                );
            }
            self.start_monitor(&cancel);
        }

        tracing::info!(
            role = %self.role,
            credential = %self.credential,
            "ready, listening on {}",
            self.channel.name()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutting down");
                    break;
                }

                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            tracing::error!("error handling event: {e:#}");
                        }
                    }
                    None => {
                        tracing::warn!("channel closed, shutting down");
                        break;
                    }
                },

                Some(alert) = self.alert_rx.recv() => {
                    if let Err(e) = self.broadcast_alert(&alert).await {
                        tracing::error!("failed to deliver alert: {e:#}");
                    }
                }

                Some(done) = self.launch_rx.recv() => {
                    if let Err(e) = self.report_launch(done).await {
                        tracing::error!("failed to deliver launch report: {e:#}");
                    }
                }
            }
        }

        if let Some(token) = self.monitor_cancel.take() {
            token.cancel();
        }
        Ok(())
    }

    fn start_monitor(&mut self, parent: &CancellationToken) {
        let token = parent.child_token();
        let (monitor, latest) = HealthMonitor::new(
            self.probe.clone(),
            self.config.monitor.interval(),
            self.config.monitor.failure_threshold,
            self.alert_tx.clone(),
        );
        tokio::spawn(monitor.run(token.clone()));
        self.latest = Some(latest);
        self.monitor_cancel = Some(token);
    }

    async fn handle_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::CallbackQuery {
                chat_id,
                message_id,
                user_id,
                user_name,
                data,
                callback_query_id,
            } => {
                self.channel.answer_callback_query(&callback_query_id).await;
                tracing::info!("callback from {user_name}: {data}");
                self.handle_callback(chat_id, message_id, user_id, &data)
                    .await
            }
            ChannelEvent::Command {
                chat_id,
                user_id,
                user_name,
                command,
                args,
            } => {
                tracing::info!("command from {user_name}: /{command}");
                self.handle_command(chat_id, user_id, &command, &args).await
            }
            ChannelEvent::Message {
                chat_id,
                user_id,
                text,
                ..
            } => {
                if self.pending.take(user_id) && self.config.is_admin(user_id) {
                    self.start_launch(chat_id, text.trim()).await
                } else {
                    self.send(chat_id, self.texts.get("unknown")).await
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        chat_id: i64,
        user_id: i64,
        command: &str,
        args: &str,
    ) -> Result<()> {
        match command {
            "start" | "menu" => return self.show_menu(chat_id).await,
            "profile" => return self.show_profile(chat_id, user_id).await,
            _ => {}
        }

        let admin_only = matches!(
            command,
            "status" | "check" | "promote" | "clone" | "fleet" | "drill"
        );
        if admin_only && !self.admin_allowed(user_id) {
            tracing::warn!(user_id, "refused /{command} from non-admin");
            return self.send(chat_id, "This command is for administrators.").await;
        }

        match command {
            "status" => self.show_status(chat_id).await,
            "check" => self.check_now(chat_id).await,
            "promote" => self.ask_promote(chat_id).await,
            "clone" => {
                if args.trim().is_empty() {
                    self.ask_credential(chat_id, user_id).await
                } else {
                    self.start_launch(chat_id, args.trim()).await
                }
            }
            "fleet" => self.show_fleet(chat_id).await,
            "drill" => self.handle_drill(chat_id, args.trim()).await,
            _ => self.send(chat_id, self.texts.get("unknown")).await,
        }
    }

    async fn handle_callback(
        &mut self,
        chat_id: i64,
        message_id: Option<i64>,
        user_id: i64,
        data: &str,
    ) -> Result<()> {
        if data == "menu" {
            return self.show_menu(chat_id).await;
        }
        if !self.admin_allowed(user_id) {
            return self.send(chat_id, "This action is for administrators.").await;
        }
        match data {
            "check_primary" => self.check_now(chat_id).await,
            "promote" => self.ask_promote(chat_id).await,
            "confirm_promote" => self.confirm_promote(chat_id, message_id).await,
            "create_clone" => self.ask_credential(chat_id, user_id).await,
            other => {
                tracing::debug!("ignoring unknown callback {other:?}");
                Ok(())
            }
        }
    }

    fn admin_allowed(&self, user_id: i64) -> bool {
        self.features.admin_commands && self.config.is_admin(user_id)
    }

    fn menu_buttons(&self) -> Vec<Vec<InlineButton>> {
        match self.role {
            Role::Primary => vec![vec![InlineButton::new("Create standby", "create_clone")]],
            Role::Standby => vec![
                vec![InlineButton::new("Check primary", "check_primary")],
                vec![InlineButton::new("Promote this bot", "promote")],
            ],
        }
    }

    async fn show_menu(&self, chat_id: i64) -> Result<()> {
        let text = format!(
            "{}\n\nRole: <b>{}</b>",
            escape_html(self.texts.get("welcome")),
            self.role
        );
        self.send_with_buttons(chat_id, &text, self.menu_buttons())
            .await
    }

    async fn show_profile(&self, chat_id: i64, user_id: i64) -> Result<()> {
        let spawned = self
            .supervisor
            .lineage()
            .has_spawned(self.credential.expose());
        let text = format!(
            "<b>{}</b>\n\nUser id: <code>{user_id}</code>\nStandby created: {}\nStandbys in fleet: {}",
            escape_html(self.texts.get("profile")),
            if spawned { "yes" } else { "no" },
            if self.supervisor.backups().has_backups() {
                "yes"
            } else {
                "no"
            },
        );
        let mut buttons = Vec::new();
        if !spawned {
            buttons.push(vec![InlineButton::new("How to create a standby", "create_clone")]);
        }
        buttons.push(vec![InlineButton::new("Menu", "menu")]);
        self.send_with_buttons(chat_id, &text, buttons).await
    }

    async fn show_status(&self, chat_id: i64) -> Result<()> {
        let mut text = format!(
            "<b>Status</b>\nRole: {}\nCredential: <code>{}</code>\nFleet entries: {}",
            self.role,
            escape_html(&self.credential.preview()),
            self.supervisor.registry().entries().len(),
        );
        if let Some(latest) = &self.latest {
            match latest.borrow().as_ref() {
                Some(a) => text.push_str(&format!(
                    "\nPrimary: {} ({})",
                    escape_html(&a.summary()),
                    a.checked_at.format("%H:%M:%S UTC")
                )),
                None => text.push_str("\nPrimary: not checked yet"),
            }
        }
        if let Some(drill) = self.drill.state() {
            text.push_str(&format!(
                "\nOutage drill active since {}",
                drill.started_at.format("%H:%M:%S UTC")
            ));
        }
        self.send(chat_id, &text).await
    }

    async fn check_now(&self, chat_id: i64) -> Result<()> {
        let assessment = health::assess(self.probe.as_ref()).await;
        let mut buttons = Vec::new();
        if !assessment.is_healthy() && !self.role.is_primary() {
            buttons.push(vec![InlineButton::new("Promote this bot", "promote")]);
        }
        let text = format!("Primary: {}", escape_html(&assessment.summary()));
        self.send_with_buttons(chat_id, &text, buttons).await
    }

    async fn ask_promote(&self, chat_id: i64) -> Result<()> {
        if self.role.is_primary() {
            return self
                .send(chat_id, &PromotionOutcome::AlreadyPrimary.describe())
                .await;
        }
        self.send_with_buttons(
            chat_id,
            &format!(
                "Promote <code>{}</code> to primary? The primary will be re-checked first.",
                escape_html(&self.credential.preview())
            ),
            vec![vec![
                InlineButton::new("Confirm", "confirm_promote"),
                InlineButton::new("Cancel", "menu"),
            ]],
        )
        .await
    }

    /// Run the promotion and replace the confirmation prompt with the
    /// outcome.
    async fn confirm_promote(&mut self, chat_id: i64, prompt: Option<i64>) -> Result<()> {
        let outcome = match self
            .promoter
            .promote(&self.credential, self.probe.as_ref())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("promotion failed: {e}");
                return self
                    .replace_or_send(chat_id, prompt, &escape_html(&e.user_message()))
                    .await;
            }
        };
        if outcome.is_promoted() {
            self.role = Role::Primary;
            if let Some(token) = self.monitor_cancel.take() {
                token.cancel();
            }
            self.latest = None;
        }
        self.replace_or_send(chat_id, prompt, &escape_html(&outcome.describe()))
            .await
    }

    async fn ask_credential(&mut self, chat_id: i64, user_id: i64) -> Result<()> {
        self.pending.insert(user_id);
        let text = format!(
            "{}\n\n{}",
            escape_html(self.texts.get("clone")),
            escape_html(self.texts.get("guide_create_clone"))
        );
        self.send(chat_id, &text).await
    }

    /// Validate `raw` now, then launch in a background task so the loop
    /// keeps serving events during the bounded wait.
    async fn start_launch(&self, chat_id: i64, raw: &str) -> Result<()> {
        if let Err(e) = Credential::parse(raw) {
            return self.send(chat_id, &escape_html(&e.user_message())).await;
        }
        self.send(
            chat_id,
            &format!(
                "Launching standby <code>{}</code>...",
                escape_html(&credential::preview(raw))
            ),
        )
        .await?;

        let supervisor = self.supervisor.clone();
        let owner = self.credential.clone();
        let raw = raw.to_owned();
        let tx = self.launch_tx.clone();
        tokio::spawn(async move {
            let result = supervisor.launch(Some(&owner), &raw).await;
            let _ = tx.send(LaunchDone { chat_id, result }).await;
        });
        Ok(())
    }

    async fn report_launch(&self, done: LaunchDone) -> Result<()> {
        let text = match &done.result {
            Ok(report) => escape_html(&report.describe()),
            Err(e) => {
                tracing::error!("launch failed: {e}");
                escape_html(&e.user_message())
            }
        };
        self.send(done.chat_id, &text).await
    }

    async fn show_fleet(&self, chat_id: i64) -> Result<()> {
        let entries = match self.supervisor.list().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("fleet listing failed: {e}");
                return self.send(chat_id, &escape_html(&e.user_message())).await;
            }
        };
        self.send(chat_id, &format_fleet(&entries)).await
    }

    async fn handle_drill(&self, chat_id: i64, args: &str) -> Result<()> {
        let result = match args {
            "start" => {
                let primary = self.identity.current_primary(self.static_primary.as_ref());
                self.drill
                    .start(primary.as_ref())
                    .map(|_| "Outage drill started: the primary now reads as down.")
            }
            "stop" => self.drill.stop().map(|_| "Outage drill stopped."),
            _ => return self.send(chat_id, "Usage: /drill start|stop").await,
        };
        match result {
            Ok(text) => self.send(chat_id, text).await,
            Err(e) => {
                tracing::error!("drill update failed: {e}");
                self.send(chat_id, &escape_html(&e.user_message())).await
            }
        }
    }

    /// Send the alert to every alert chat, returning how many received it.
    async fn broadcast_alert(&self, alert: &Alert) -> Result<usize> {
        let chats = self.config.alert_chats();
        if chats.is_empty() {
            tracing::warn!(
                failed_cycles = alert.failed_cycles,
                "alert not delivered, no alert chats configured: {}",
                alert.assessment.summary()
            );
            return Ok(0);
        }
        let text = format!(
            "⚠️ Primary failed {} consecutive checks.\n{}",
            alert.failed_cycles,
            escape_html(&alert.assessment.summary())
        );
        let buttons = vec![vec![
            InlineButton::new("Promote this bot", "promote"),
            InlineButton::new("Check again", "check_primary"),
        ]];
        let mut delivered = 0;
        for &chat_id in chats {
            match self
                .send_with_buttons(chat_id, &text, buttons.clone())
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(chat_id, "alert not delivered: {e}"),
            }
        }
        Ok(delivered)
    }

    async fn replace_or_send(&self, chat_id: i64, message_id: Option<i64>, text: &str) -> Result<()> {
        if let Some(id) = message_id {
            match self
                .channel
                .edit_message(id, &OutboundMessage::text(chat_id, text))
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => tracing::debug!("edit failed, sending instead: {e}"),
            }
        }
        self.send(chat_id, text).await
    }

    async fn send(&self, chat_id: i64, text: &str) -> Result<()> {
        self.channel
            .send_message(&OutboundMessage::text(chat_id, text))
            .await
    }

    async fn send_with_buttons(
        &self,
        chat_id: i64,
        text: &str,
        buttons: Vec<Vec<InlineButton>>,
    ) -> Result<()> {
        self.channel
            .send_message(&OutboundMessage::text(chat_id, text).with_buttons(buttons))
            .await
    }
}

fn format_fleet(entries: &[FleetEntry]) -> String {
    if entries.is_empty() {
        return "No standbys launched yet.".into();
    }
    let mut text = format!("<b>Fleet</b> ({})\n", entries.len());
    for e in entries {
        text.push_str(&format!(
            "\n<code>{}</code> pid {} {} <code>{}</code> since {}",
            escape_html(&e.clone_id),
            e.pid,
            e.status,
            escape_html(&e.credential_preview),
            e.launched_at.format("%Y-%m-%d %H:%M")
        ));
    }
    text
}

// ── Startup ──────────────────────────────────────────────

/// How this process was started.
#[derive(Debug, Clone, Copy)]
pub enum Seat<'a> {
    /// The unmanaged primary entry point.
    Primary,
    /// A launched instance directory.
    Instance(&'a Path),
}

/// Resolve the credential a process starts with.
///
/// Only the primary seat follows a recorded promotion: after a standby is
/// promoted, restarting the primary seat picks up the new credential.
pub fn resolve_credential(
    config: &FleetConfig,
    manifest: Option<&InstanceManifest>,
) -> std::result::Result<Resolved, FleetError> {
    let sources = match manifest {
        Some(m) => CredentialSources {
            file: Some(m.credential_file.clone()),
            ..Default::default()
        },
        None => {
            let identity = IdentityStore::new(config.identity_path());
            CredentialSources {
                promoted: identity
                    .read()
                    .filter(|r| r.is_primary)
                    .map(|r| r.active_credential),
                file: config
                    .credential_file
                    .clone()
                    .or_else(|| config.primary.credential_file.clone()),
                scan_dir: Some(config.credentials_dir()),
                ..Default::default()
            }
            .with_env()
        }
    };
    credential::resolve(&sources)
}

/// The launched instance still serving `credential`, if any.
///
/// A promoted standby keeps polling with its own credential, so the primary
/// seat must not start on that credential while the instance is alive.
pub async fn instance_serving(
    config: &FleetConfig,
    processes: &dyn ProcessManager,
    credential: &Credential,
) -> Option<FleetEntry> {
    for entry in FleetRegistry::new(config.processes_path()).entries() {
        let Some(dir) = entry.instance_dir.as_deref() else {
            continue;
        };
        let holds = InstanceManifest::load(dir)
            .ok()
            .and_then(|m| m.credential().ok())
            .is_some_and(|c| &c == credential);
        if holds && processes.is_alive(entry.pid).await {
            return Some(entry);
        }
    }
    None
}

/// Start a bot process and run it until a shutdown signal.
pub async fn run(config: FleetConfig, config_path: &Path, seat: Seat<'_>) -> Result<()> {
    let manifest = match seat {
        Seat::Primary => None,
        Seat::Instance(dir) => Some(InstanceManifest::load(dir)?),
    };

    let resolved = match resolve_credential(&config, manifest.as_ref()) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("cannot start: {e}");
            return Err(e).wrap_err("startup credential");
        }
    };
    tracing::info!(
        credential = %resolved.credential,
        source = %resolved.source,
        "credential resolved"
    );

    let processes: Arc<dyn ProcessManager> = Arc::new(OsProcessManager::new());
    if resolved.source == CredentialSource::Promotion
        && let Some(entry) = instance_serving(&config, processes.as_ref(), &resolved.credential).await
    {
        tracing::error!(
            clone_id = %entry.clone_id,
            pid = entry.pid,
            "promoted standby still serves {}; stop it before starting the primary seat",
            resolved.credential
        );
        bail!(
            "credential {} is already served by {} (pid {})",
            resolved.credential,
            entry.clone_id,
            entry.pid
        );
    }

    let identity = IdentityStore::new(config.identity_path());
    let role = Role::determine(
        identity.read().as_ref(),
        &resolved.credential,
        manifest.is_none(),
    );
    let features = manifest
        .as_ref()
        .map(|m| m.features.clone())
        .unwrap_or_default();

    let api = TelegramApi::new(&config.telegram);
    let gateway: Arc<dyn Gateway> = Arc::new(api.clone());
    let probe = LivePrimaryProbe::from_config(&config, processes.clone(), gateway.clone());
    let static_primary = probe.static_primary().cloned();
    let supervisor = Supervisor::new(&config, config_path, processes, gateway)?;
    let channel = TelegramChannel::new(
        api,
        resolved.credential.clone(),
        config.telegram.poll_timeout_secs,
    );

    let mut runner = BotRunner::new(BotParts {
        config,
        channel: Arc::new(channel),
        credential: resolved.credential,
        role,
        features,
        probe: Arc::new(probe),
        supervisor: Arc::new(supervisor),
        static_primary,
    });

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    runner.run(cancel).await
}

/// Cancel `token` on SIGINT or SIGTERM.
pub async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    tracing::info!("shutdown signal received");
    token.cancel();
}
