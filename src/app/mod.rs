//! Interactive controller.
//!
//! The controller is a plain state machine: [`App::update`] consumes one
//! [`Message`] and returns the [`Command`] the runtime should perform, and
//! [`App::view`] renders the current frame as text. Nothing here touches the
//! terminal or the network, so the whole flow is testable headless.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use log::debug;

use crate::config::CheckerConfig;
use crate::parser::parse_proxy_string;
use crate::types::{ProbeRequest, ProbeResult};
use crate::version::VersionInfo;

mod form;
mod view;

pub use form::{Field, Form, TextInput};
pub use view::{format_duration, SPINNER_FRAMES};

/// Controller states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Configuring,
    Testing,
    Showing,
    Versioning,
}

/// Inputs to the controller.
#[derive(Debug)]
pub enum Message {
    Key(KeyEvent),
    Tick,
    ProbeComplete(ProbeResult),
}

/// Side effects requested by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    None,
    Quit,
    StartProbe(ProbeRequest),
}

/// Controller state.
#[derive(Debug)]
pub struct App {
    state: State,
    form: Form,
    /// Inline proxy validation message
    validation_error: Option<String>,
    /// Probe in flight or last shown
    request: Option<ProbeRequest>,
    result: Option<ProbeResult>,
    spinner: usize,
    version: VersionInfo,
}

impl Default for App {
    fn default() -> Self {
        Self::new(&CheckerConfig::default())
    }
}

impl App {
    pub fn new(config: &CheckerConfig) -> Self {
        Self {
            state: State::Configuring,
            form: Form::new(&config.default_proxy, &config.default_ntp_server),
            validation_error: None,
            request: None,
            result: None,
            spinner: 0,
            version: VersionInfo::default(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn form(&self) -> &Form {
        &self.form
    }

    pub fn result(&self) -> Option<&ProbeResult> {
        self.result.as_ref()
    }

    pub fn validation_error(&self) -> Option<&str> {
        self.validation_error.as_deref()
    }

    pub fn update(&mut self, msg: Message) -> Command {
        match msg {
            Message::Key(key) if is_ctrl_c(&key) => Command::Quit,
            Message::Key(key) => self.handle_key(key),
            Message::Tick => {
                if self.state == State::Testing {
                    self.spinner = (self.spinner + 1) % SPINNER_FRAMES.len();
                }
                Command::None
            }
            Message::ProbeComplete(result) => {
                if self.state == State::Testing {
                    debug!("probe finished: ok={}", result.is_ok());
                    self.result = Some(result);
                    self.state = State::Showing;
                }
                Command::None
            }
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Command {
        match self.state {
            State::Configuring => self.handle_configuring_key(key),
            State::Testing => Command::None,
            State::Showing => {
                match key.code {
                    KeyCode::Enter => self.reset_form(),
                    KeyCode::Char('v') if key.modifiers.is_empty() => self.state = State::Versioning,
                    _ => {}
                }
                Command::None
            }
            State::Versioning => {
                if key.code == KeyCode::Esc {
                    self.reset_form();
                }
                Command::None
            }
        }
    }

    fn handle_configuring_key(&mut self, key: KeyEvent) -> Command {
        match key.code {
            KeyCode::Char('v') if key.modifiers.is_empty() => {
                self.state = State::Versioning;
            }
            KeyCode::Tab | KeyCode::Down => self.form.focus = self.form.focus.next(),
            KeyCode::BackTab | KeyCode::Up => self.form.focus = self.form.focus.previous(),
            KeyCode::Enter => match self.form.focus {
                Field::Proxy => {
                    self.validate_proxy();
                    if self.validation_error.is_none() {
                        self.form.focus = Field::Ntp;
                    }
                }
                Field::Ntp => return self.submit(),
            },
            _ => {
                let focus = self.form.focus;
                if self.form.focused_mut().handle_key(key) && focus == Field::Proxy {
                    self.validate_proxy();
                }
            }
        }
        Command::None
    }

    fn validate_proxy(&mut self) {
        self.validation_error = parse_proxy_string(self.form.proxy.text())
            .err()
            .map(|e| format!("invalid format: {}", e));
    }

    fn submit(&mut self) -> Command {
        match parse_proxy_string(self.form.proxy.text()) {
            Ok(endpoint) => {
                let request = ProbeRequest::new(endpoint, self.form.ntp.text());
                self.validation_error = None;
                self.request = Some(request.clone());
                self.result = None;
                self.spinner = 0;
                self.state = State::Testing;
                Command::StartProbe(request)
            }
            Err(e) => {
                self.validation_error = Some(format!("invalid format: {}", e));
                self.form.focus = Field::Proxy;
                Command::None
            }
        }
    }

    fn reset_form(&mut self) {
        self.state = State::Configuring;
        self.form.focus = Field::Proxy;
        self.result = None;
        self.request = None;
    }
}

fn is_ctrl_c(key: &KeyEvent) -> bool {
    key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL)
}
