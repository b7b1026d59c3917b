//! Sample roles shared by the runtime integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eventide_core::{
    CommandData, Context, Error, Event, EventData, JsonSerializer, Result, Serializer,
};
use eventide_runtime::{
    Aggregate, AggregateScope, Integration, IntegrationScope, Process, ProcessScope, Projection,
};
use eventide_test_support::{json_command, json_event};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions};

/// Builds a pool large enough for several concurrent maintainers.
pub async fn wide_pool(options: PgPoolOptions, connect: PgConnectOptions) -> PgPool {
    options.max_connections(20).connect_with(connect).await.unwrap()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCommand {
    pub account: String,
    #[serde(default)]
    pub cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposited {
    pub cents: i64,
}

pub fn open(account: &str) -> CommandData {
    json_command("open_account", &AccountCommand { account: account.into(), cents: 0 })
}

pub fn deposit(account: &str, cents: i64) -> CommandData {
    json_command("deposit", &AccountCommand { account: account.into(), cents })
}

pub fn freeze(account: &str) -> CommandData {
    json_command("freeze", &AccountCommand { account: account.into(), cents: 0 })
}

pub fn audit(account: &str) -> CommandData {
    json_command("audit", &AccountCommand { account: account.into(), cents: 0 })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountState {
    pub opened: bool,
    pub balance: i64,
    pub history: Vec<i64>,
}

/// Bank account aggregate. Remembers every state its handler observed.
#[derive(Debug, Default)]
pub struct Account {
    pub observed: Arc<Mutex<Vec<AccountState>>>,
}

#[async_trait]
impl Aggregate for Account {
    type State = AccountState;

    fn name(&self) -> &str {
        "account"
    }

    fn command_types(&self) -> &[&str] {
        &["open_account", "deposit", "freeze", "audit"]
    }

    fn event_types(&self) -> &[&str] {
        &["account_opened", "deposited"]
    }

    fn route_command(&self, command: &CommandData) -> Option<String> {
        let command = command.payload.decode::<AccountCommand>().ok()?;
        (!command.account.is_empty()).then(|| command.account.clone())
    }

    fn create_initial_state(&self) -> AccountState {
        AccountState::default()
    }

    fn apply_event(&self, state: &mut AccountState, event: &EventData) -> Result<()> {
        match event.event_type.as_str() {
            "account_opened" => state.opened = true,
            "deposited" => {
                let cents = event.payload.decode::<Deposited>()?.cents;
                state.balance += cents;
                state.history.push(cents);
            }
            other => return Err(Error::handler(format!("unknown event {other}"))),
        }
        Ok(())
    }

    async fn handle_command(&self, scope: &mut AggregateScope<'_, Self>) -> Result<()> {
        let command_type = scope.command().command_type.clone();
        let cents = scope.command().payload.decode::<AccountCommand>()?.cents;
        let state = scope.read_state().await?;
        match command_type.as_str() {
            "open_account" if state.opened => return Err(Error::handler("account already open")),
            "open_account" => {
                scope
                    .record_event(json_event("account_opened", &serde_json::json!({})))
                    .await?;
            }
            "deposit" if !state.opened => return Err(Error::handler("account not open")),
            "deposit" => {
                scope
                    .record_event(json_event("deposited", &Deposited { cents }))
                    .await?;
            }
            "audit" => {}
            _ => {
                scope
                    .record_event(json_event("frozen", &serde_json::json!({})))
                    .await?;
            }
        }
        let after = scope.read_state().await?;
        self.observed.lock().unwrap().push(after);
        Ok(())
    }
}

/// Records a sent email for every `send_email` command.
#[derive(Debug, Default)]
pub struct Mailer;

#[async_trait]
impl Integration for Mailer {
    fn name(&self) -> &str {
        "mailer"
    }

    fn command_types(&self) -> &[&str] {
        &["send_email"]
    }

    fn event_types(&self) -> &[&str] {
        &["email_sent"]
    }

    async fn handle_command(&self, scope: &mut IntegrationScope<'_, Self>) -> Result<()> {
        let to = scope.command().payload.decode::<serde_json::Value>()?["to"].clone();
        scope.record_event(json_event("email_sent", &serde_json::json!({ "to": to })))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WelcomeState {
    pub emails: u32,
}

/// Sends a welcome email whenever an account is opened.
#[derive(Debug, Default)]
pub struct Welcome {
    /// When set, executes an undeclared command instead.
    pub misbehave: bool,
}

#[async_trait]
impl Process for Welcome {
    type State = WelcomeState;

    fn name(&self) -> &str {
        "welcome"
    }

    fn command_types(&self) -> &[&str] {
        &["send_email"]
    }

    fn route_event(&self, event: &Event) -> Option<String> {
        (event.event_type() == "account_opened").then(|| event.stream_instance.clone())
    }

    fn create_initial_state(&self) -> WelcomeState {
        WelcomeState::default()
    }

    fn state_serializer(&self) -> &dyn Serializer<WelcomeState> {
        &JsonSerializer
    }

    async fn handle_event(&self, scope: &mut ProcessScope<'_, Self>) -> Result<()> {
        if self.misbehave {
            return scope.execute_command(json_command("close_account", &serde_json::json!({})));
        }
        let to = scope.instance().to_owned();
        scope.execute_command(json_command("send_email", &serde_json::json!({ "to": to })))?;
        scope
            .update_state(|state| {
                state.emails += 1;
                Ok(())
            })
            .await
    }
}

/// Remembers the global offset of every event it applies. Fails on events of
/// type `poison`.
#[derive(Debug, Default, Clone)]
pub struct Recorder {
    pub name: &'static str,
    pub applied: Arc<Mutex<Vec<i64>>>,
}

impl Recorder {
    pub fn named(name: &'static str) -> Self {
        Self { name, applied: Arc::default() }
    }

    pub fn applied(&self) -> Vec<i64> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl Projection for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    async fn apply_event(
        &self,
        _ctx: &Context,
        _conn: &mut PgConnection,
        event: &Event,
    ) -> Result<()> {
        if event.event_type() == "poison" {
            return Err(Error::handler("poison event"));
        }
        self.applied.lock().unwrap().push(event.global_offset);
        Ok(())
    }
}
