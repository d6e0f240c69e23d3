use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use ratatui::widgets::ListState;
use tracing::{error, info};

use crate::api::{normalize, ApiError, ChatResponse, Model, RecencyFilter, RequestParams, SonarClient};
use crate::config::Config;
use crate::store::{Message, ThreadStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Chat,
    Settings,
    Threads,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct Toast {
    pub level: ToastLevel,
    pub text: String,
    created: Instant,
}

const TOAST_TTL: Duration = Duration::from_secs(5);

/// Rows of the settings screen, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsField {
    ApiKey,
    Model,
    SystemPrompt,
    Temperature,
    MaxTokens,
    TopP,
    FrequencyPenalty,
    PresencePenalty,
    SearchRecency,
    ReturnImages,
    ReturnRelatedQuestions,
}

impl SettingsField {
    pub fn all() -> &'static [SettingsField] {
        use SettingsField::*;
        &[
            ApiKey,
            Model,
            SystemPrompt,
            Temperature,
            MaxTokens,
            TopP,
            FrequencyPenalty,
            PresencePenalty,
            SearchRecency,
            ReturnImages,
            ReturnRelatedQuestions,
        ]
    }

    pub fn label(&self) -> &'static str {
        match self {
            SettingsField::ApiKey => "API Key",
            SettingsField::Model => "Model",
            SettingsField::SystemPrompt => "System Prompt",
            SettingsField::Temperature => "Temperature",
            SettingsField::MaxTokens => "Max Tokens",
            SettingsField::TopP => "Top P",
            SettingsField::FrequencyPenalty => "Frequency Penalty",
            SettingsField::PresencePenalty => "Presence Penalty",
            SettingsField::SearchRecency => "Search Recency",
            SettingsField::ReturnImages => "Return Images",
            SettingsField::ReturnRelatedQuestions => "Return Related Questions",
        }
    }

    /// Text fields are edited in a buffer; everything else is adjusted
    /// in place with left/right.
    pub fn is_text(&self) -> bool {
        matches!(self, SettingsField::ApiKey | SettingsField::SystemPrompt)
    }
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub screen: Screen,
    pub input_mode: InputMode,

    // Prompt input
    pub prompt_input: String,
    pub prompt_cursor: usize,

    // Chat scroll state
    pub chat_scroll: u16,
    pub auto_scroll: bool,

    // Request state
    pub params: RequestParams,
    pub api_key: String,
    pub client: SonarClient,
    pub request_task: Option<tokio::task::JoinHandle<Result<ChatResponse, ApiError>>>,
    pending_prompt: Option<String>,
    pub animation_frame: u8,

    // Settings screen state
    pub settings_state: ListState,
    pub settings_buffer: String,
    pub settings_cursor: usize,
    pub settings_editing: bool,

    // Threads screen state
    pub threads_state: ListState,

    // Notifications
    pub toasts: Vec<Toast>,

    // Data
    pub store: ThreadStore,
    pub config: Config,
}

impl App {
    pub fn new(config: Config, store: ThreadStore) -> Self {
        let api_key = config.resolve_api_key().unwrap_or_default();
        let mut params = RequestParams::default();
        if let Some(model) = config.default_model {
            params.model = model;
        }

        let mut settings_state = ListState::default();
        settings_state.select(Some(0));

        Self {
            should_quit: false,
            screen: Screen::Chat,
            input_mode: InputMode::Editing,

            prompt_input: String::new(),
            prompt_cursor: 0,

            chat_scroll: 0,
            auto_scroll: true,

            params,
            api_key,
            client: SonarClient::new(),
            request_task: None,
            pending_prompt: None,
            animation_frame: 0,

            settings_state,
            settings_buffer: String::new(),
            settings_cursor: 0,
            settings_editing: false,

            threads_state: ListState::default(),

            toasts: Vec::new(),

            store,
            config,
        }
    }

    pub fn request_in_flight(&self) -> bool {
        self.request_task.is_some()
    }

    /// Kick off the single outbound call for the current prompt. A blank
    /// credential is rejected here, before anything is spawned.
    pub fn submit_prompt(&mut self) {
        if self.request_task.is_some() {
            return;
        }
        let prompt = self.prompt_input.trim().to_string();
        if prompt.is_empty() {
            return;
        }
        if self.api_key.trim().is_empty() {
            self.toast(
                ToastLevel::Error,
                "API key is not configured. Set it in Settings (s) or PERPLEXITY_API_KEY.",
            );
            return;
        }

        info!(model = self.params.model.as_str(), "submitting prompt");
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let params = self.params.clone();
        let user_prompt = prompt.clone();
        self.pending_prompt = Some(prompt);
        self.request_task = Some(tokio::spawn(async move {
            client.complete(&api_key, &params, &user_prompt).await
        }));
    }

    /// Resolve a finished request, if any. Called on every tick; does
    /// nothing while the task is still running.
    pub async fn poll_request(&mut self) -> Result<()> {
        if !matches!(&self.request_task, Some(task) if task.is_finished()) {
            return Ok(());
        }
        let Some(task) = self.request_task.take() else {
            return Ok(());
        };
        let user_prompt = self.pending_prompt.take().unwrap_or_default();

        match task.await {
            Ok(Ok(response)) => {
                let reply = normalize(response);
                if let Some(warning) = &reply.warning {
                    self.toast(ToastLevel::Warning, warning.clone());
                }
                let message = Message {
                    id: Utc::now().timestamp_millis().to_string(),
                    user_prompt,
                    reply: reply.content,
                    citations: reply.citations,
                    related_questions: reply.related_questions,
                    images: reply.images,
                    timestamp: Utc::now(),
                };
                let active = self.store.active_id().to_string();
                self.store.append_message(&active, message)?;
                // Prompt clears only on the success path, fallback included
                self.prompt_input.clear();
                self.prompt_cursor = 0;
                self.auto_scroll = true;
            }
            Ok(Err(e)) => {
                error!(error = %e, "completion request failed");
                self.toast(ToastLevel::Error, e.to_string());
            }
            Err(e) => {
                error!(error = %e, "request task panicked");
                self.toast(ToastLevel::Error, "Internal error while waiting for the response.");
            }
        }
        Ok(())
    }

    /// Start a fresh thread and make it active. Clears the pending prompt.
    pub fn new_thread(&mut self) -> Result<()> {
        self.store.create_thread()?;
        self.prompt_input.clear();
        self.prompt_cursor = 0;
        self.chat_scroll = 0;
        self.auto_scroll = true;
        Ok(())
    }

    /// Copy one of the latest reply's related questions into the prompt,
    /// ready to submit. Returns false when there is no such question.
    pub fn adopt_related_question(&mut self, index: usize) -> bool {
        let question = self
            .store
            .active_thread()
            .and_then(|t| t.messages.last())
            .and_then(|m| m.related_questions.get(index))
            .cloned();
        match question {
            Some(question) => {
                self.prompt_input = question;
                self.prompt_cursor = self.prompt_input.chars().count();
                true
            }
            None => false,
        }
    }

    pub fn toast(&mut self, level: ToastLevel, text: impl Into<String>) {
        self.toasts.push(Toast {
            level,
            text: text.into(),
            created: Instant::now(),
        });
    }

    pub fn current_toast(&self) -> Option<&Toast> {
        self.toasts.last()
    }

    /// Tick housekeeping: loading animation and toast expiry.
    pub fn tick(&mut self) {
        if self.request_task.is_some() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
        self.toasts.retain(|t| t.created.elapsed() < TOAST_TTL);
    }

    // Chat scrolling
    pub fn scroll_chat_up(&mut self) {
        self.chat_scroll = self.chat_scroll.saturating_sub(1);
        self.auto_scroll = false;
    }

    pub fn scroll_chat_down(&mut self) {
        self.chat_scroll = self.chat_scroll.saturating_add(1);
    }

    // Threads screen
    pub fn open_threads(&mut self) {
        let threads = self.store.threads_newest_first();
        let current = threads
            .iter()
            .position(|t| t.id == self.store.active_id())
            .unwrap_or(0);
        self.threads_state.select(Some(current));
        self.screen = Screen::Threads;
        self.input_mode = InputMode::Normal;
    }

    pub fn threads_nav_down(&mut self) {
        let len = self.store.len();
        if len > 0 {
            let i = self.threads_state.selected().unwrap_or(0);
            self.threads_state.select(Some((i + 1).min(len - 1)));
        }
    }

    pub fn threads_nav_up(&mut self) {
        let i = self.threads_state.selected().unwrap_or(0);
        self.threads_state.select(Some(i.saturating_sub(1)));
    }

    pub fn select_highlighted_thread(&mut self) -> Result<()> {
        if let Some(i) = self.threads_state.selected() {
            let id = self
                .store
                .threads_newest_first()
                .get(i)
                .map(|t| t.id.clone());
            if let Some(id) = id {
                self.store.select_thread(&id)?;
                self.chat_scroll = 0;
                self.auto_scroll = true;
            }
        }
        self.screen = Screen::Chat;
        self.input_mode = InputMode::Editing;
        Ok(())
    }

    // Settings screen
    pub fn selected_setting(&self) -> SettingsField {
        let i = self.settings_state.selected().unwrap_or(0);
        SettingsField::all()[i.min(SettingsField::all().len() - 1)]
    }

    pub fn settings_nav_down(&mut self) {
        let len = SettingsField::all().len();
        let i = self.settings_state.selected().unwrap_or(0);
        self.settings_state.select(Some((i + 1).min(len - 1)));
    }

    pub fn settings_nav_up(&mut self) {
        let i = self.settings_state.selected().unwrap_or(0);
        self.settings_state.select(Some(i.saturating_sub(1)));
    }

    /// Begin buffer editing for a text field.
    pub fn begin_setting_edit(&mut self) {
        let field = self.selected_setting();
        if !field.is_text() {
            return;
        }
        self.settings_buffer = match field {
            SettingsField::ApiKey => self.api_key.clone(),
            SettingsField::SystemPrompt => self.params.system_prompt.clone(),
            _ => unreachable!(),
        };
        self.settings_cursor = self.settings_buffer.chars().count();
        self.settings_editing = true;
    }

    pub fn commit_setting_edit(&mut self) {
        let field = self.selected_setting();
        match field {
            SettingsField::ApiKey => {
                self.api_key = self.settings_buffer.trim().to_string();
                self.config.api_key = Some(self.api_key.clone()).filter(|k| !k.is_empty());
                if let Err(e) = self.config.save() {
                    self.toast(ToastLevel::Error, format!("Could not save config: {}", e));
                }
            }
            SettingsField::SystemPrompt => {
                self.params.system_prompt = self.settings_buffer.clone();
            }
            _ => {}
        }
        self.settings_buffer.clear();
        self.settings_cursor = 0;
        self.settings_editing = false;
    }

    pub fn cancel_setting_edit(&mut self) {
        self.settings_buffer.clear();
        self.settings_cursor = 0;
        self.settings_editing = false;
    }

    /// Step the selected non-text field. Each field clamps to the range
    /// its widget advertises, mirroring the API's accepted bounds.
    pub fn adjust_setting(&mut self, direction: i8) {
        let up = direction > 0;
        match self.selected_setting() {
            SettingsField::Model => {
                self.params.model = cycle(Model::all(), self.params.model, up);
                self.config.default_model = Some(self.params.model);
                let _ = self.config.save();
            }
            SettingsField::SearchRecency => {
                self.params.search_recency = cycle(RecencyFilter::all(), self.params.search_recency, up);
            }
            SettingsField::Temperature => {
                self.params.temperature = step_f64(self.params.temperature, 0.1, up, 0.0, 2.0);
            }
            SettingsField::MaxTokens => {
                let step = 64i64;
                let next = self.params.max_tokens as i64 + if up { step } else { -step };
                self.params.max_tokens = next.clamp(1, 4096) as u32;
            }
            SettingsField::TopP => {
                self.params.top_p = step_f64(self.params.top_p, 0.05, up, 0.0, 1.0);
            }
            SettingsField::FrequencyPenalty => {
                self.params.frequency_penalty = step_f64(self.params.frequency_penalty, 0.1, up, 0.0, 2.0);
            }
            SettingsField::PresencePenalty => {
                self.params.presence_penalty = step_f64(self.params.presence_penalty, 0.1, up, -2.0, 2.0);
            }
            SettingsField::ReturnImages => {
                self.params.return_images = !self.params.return_images;
            }
            SettingsField::ReturnRelatedQuestions => {
                self.params.return_related_questions = !self.params.return_related_questions;
            }
            SettingsField::ApiKey | SettingsField::SystemPrompt => {}
        }
    }
}

fn cycle<T: Copy + PartialEq>(values: &[T], current: T, forward: bool) -> T {
    let i = values.iter().position(|v| *v == current).unwrap_or(0);
    let next = if forward {
        (i + 1) % values.len()
    } else {
        (i + values.len() - 1) % values.len()
    };
    values[next]
}

fn step_f64(value: f64, step: f64, up: bool, min: f64, max: f64) -> f64 {
    let next = if up { value + step } else { value - step };
    // Round to the step grid so repeated adjustment doesn't drift
    let rounded = (next / step).round() * step;
    rounded.clamp(min, max)
}
