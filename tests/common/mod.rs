//! Simulated network device used by the integration tests.
//!
//! The device tracks which mode it is in, echoes commands, prints the prompt
//! of its current mode, asks for confirmation where configured, and can be
//! told to drop its connection or reject a command once.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use climode::error::CliError;
use climode::mode::{ModeDefinition, ModeRegistry};
use climode::session::{
    ActionMap, ErrorMap, ExpectState, ExpectStep, Session, SessionArgs, SessionFactory,
};
use parking_lot::Mutex;
use regex::Regex;

const MODES_FIXTURE: &str = include_str!("../fixtures/switch_modes.json");

/// Mode definitions of the simulated switch:
///
/// ```text
/// root ─┬─ configOS ─┬─ configIf
///       │            └─ configVlan
///       └─ diag
/// ```
pub fn definitions() -> Vec<ModeDefinition> {
    serde_json::from_str(MODES_FIXTURE).expect("fixture should parse")
}

/// A fresh registry; each test gets its own so visited markers do not leak.
pub fn registry() -> Arc<ModeRegistry> {
    Arc::new(ModeRegistry::new(definitions()).expect("fixture tree is valid"))
}

pub fn args(host: &str) -> SessionArgs {
    SessionArgs::new("sim")
        .attr("host", host)
        .attr("user", "admin")
        .secret("password", "admin")
}

struct Transition {
    from: String,
    command: String,
    to: String,
    confirm: Option<String>,
}

/// Static behaviour of the simulated switch.
pub struct DeviceModel {
    initial: String,
    prompts: HashMap<String, String>,
    transitions: Vec<Transition>,
    outputs: HashMap<String, String>,
}

impl DeviceModel {
    pub fn switch() -> Self {
        let prompts = [
            ("root", "sw1>"),
            ("configOS", "sw1(config)#"),
            ("configIf", "sw1(config-if)#"),
            ("configVlan", "sw1(config-vlan)#"),
            ("diag", "sw1(diag)>"),
        ]
        .into_iter()
        .map(|(mode, prompt)| (mode.to_string(), prompt.to_string()))
        .collect();

        let mut transitions = Vec::new();
        for def in definitions() {
            let Some(parent) = def.parent else { continue };
            let confirm = (def.name == "configOS")
                .then(|| "Enter configuration mode? [yes/no]".to_string());
            transitions.push(Transition {
                from: parent.clone(),
                command: def.enter_command.clone(),
                to: def.name.clone(),
                confirm,
            });
            transitions.push(Transition {
                from: def.name.clone(),
                command: def.exit_command.clone(),
                to: parent,
                confirm: None,
            });
        }

        let outputs = [
            ("show version", "SimOS 1.0"),
            ("show bogus", "% Invalid input detected at '^' marker."),
        ]
        .into_iter()
        .map(|(cmd, out)| (cmd.to_string(), out.to_string()))
        .collect();

        Self {
            initial: "root".to_string(),
            prompts,
            transitions,
            outputs,
        }
    }

    fn prompt(&self, mode: &str) -> String {
        self.prompts.get(mode).cloned().unwrap_or_else(|| "Password:".to_string())
    }

    fn respond(&self, state: &mut DeviceState, command: &str) -> Vec<String> {
        state.sent.push(command.to_string());

        if state.refuse.remove(command) {
            return vec![format!("{command}\n% Command rejected\n")];
        }

        if let Some(target) = state.pending_confirm.take() {
            if command == "yes" {
                state.mode = target;
            }
            return vec![format!("{command}\n"), self.prompt(&state.mode)];
        }

        if let Some(t) = self
            .transitions
            .iter()
            .find(|t| t.from == state.mode && t.command == command)
        {
            if let Some(question) = &t.confirm {
                state.pending_confirm = Some(t.to.clone());
                return vec![format!("{command}\n{question}")];
            }
            state.mode = t.to.clone();
        }

        if let Some(text) = self.outputs.get(command) {
            return vec![format!("{command}\n{text}\n"), self.prompt(&state.mode)];
        }
        vec![format!("{command}\n"), self.prompt(&state.mode)]
    }
}

#[derive(Debug, Default)]
pub struct DeviceState {
    pub mode: String,
    pub sent: Vec<String>,
    pub connected: bool,
    pub valid: bool,
    pub closed: bool,
    pub reconnects: usize,
    refuse: HashSet<String>,
    pending_confirm: Option<String>,
}

/// Test-side handle on one simulated device.
#[derive(Clone)]
pub struct Device {
    state: Arc<Mutex<DeviceState>>,
}

impl Device {
    fn new(initial: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                mode: initial.to_string(),
                connected: true,
                valid: true,
                ..Default::default()
            })),
        }
    }

    pub fn mode(&self) -> String {
        self.state.lock().mode.clone()
    }

    pub fn set_mode(&self, mode: &str) {
        self.state.lock().mode = mode.to_string();
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    pub fn count_sent(&self, command: &str) -> usize {
        self.state.lock().sent.iter().filter(|c| *c == command).count()
    }

    pub fn drop_connection(&self) {
        self.state.lock().connected = false;
    }

    pub fn invalidate(&self) {
        self.state.lock().valid = false;
    }

    pub fn refuse_once(&self, command: &str) {
        self.state.lock().refuse.insert(command.to_string());
    }

    pub fn closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn reconnects(&self) -> usize {
        self.state.lock().reconnects
    }
}

pub struct SimSession {
    args: SessionArgs,
    device: Device,
    model: Arc<DeviceModel>,
}

impl SimSession {
    pub fn new(args: SessionArgs) -> (Self, Device) {
        let model = Arc::new(DeviceModel::switch());
        let device = Device::new(&model.initial);
        let session = Self {
            args,
            device: device.clone(),
            model,
        };
        (session, device)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Session for SimSession {
    fn send_and_expect(
        &mut self,
        command: &str,
        expected: &str,
        action_map: Option<&ActionMap>,
        error_map: Option<&ErrorMap>,
    ) -> Result<String, CliError> {
        let mut state = self.device.state.lock();
        if !state.connected {
            return Err(CliError::ChannelDisconnect);
        }
        let mut expect = ExpectState::new(expected, action_map, error_map)?;
        let mut pending: VecDeque<String> = self.model.respond(&mut state, command).into();
        let mut replies = 0;
        while let Some(chunk) = pending.pop_front() {
            match expect.feed(&chunk)? {
                ExpectStep::Pending => {}
                ExpectStep::Reply(reply) => {
                    replies += 1;
                    if replies > 8 {
                        break;
                    }
                    pending.extend(self.model.respond(&mut state, reply.trim_end()));
                }
                ExpectStep::Done(output) => return Ok(output),
            }
        }
        Err(CliError::ExpectTimeout(expect.output().to_string()))
    }

    fn is_valid(&self) -> bool {
        let state = self.device.state.lock();
        state.valid && state.connected
    }

    fn args(&self) -> &SessionArgs {
        &self.args
    }

    fn reconnect(&mut self, prompt: &str, _timeout: Option<Duration>) -> Result<(), CliError> {
        let mut state = self.device.state.lock();
        state.connected = true;
        state.pending_confirm = None;
        state.mode = self.model.initial.clone();
        state.reconnects += 1;
        let banner = self.model.prompt(&state.mode);
        let ready = Regex::new(prompt).map_err(|source| CliError::InvalidPattern {
            pattern: prompt.to_string(),
            source,
        })?;
        if ready.is_match(&banner) {
            Ok(())
        } else {
            Err(CliError::ExpectTimeout(banner))
        }
    }

    fn close(&mut self) {
        let mut state = self.device.state.lock();
        state.closed = true;
        state.connected = false;
    }
}

#[derive(Default)]
struct FactoryShared {
    created: AtomicUsize,
    fail_next: AtomicBool,
    devices: Mutex<Vec<Device>>,
    delay: Mutex<Duration>,
}

/// Factory handing out simulated sessions; clones share their counters.
#[derive(Clone, Default)]
pub struct SimFactory {
    shared: Arc<FactoryShared>,
}

impl SimFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self) {
        self.shared.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.shared.delay.lock() = delay;
    }

    pub fn device(&self, index: usize) -> Device {
        self.shared.devices.lock()[index].clone()
    }

    pub fn closed_count(&self) -> usize {
        self.shared
            .devices
            .lock()
            .iter()
            .filter(|d| d.closed())
            .count()
    }
}

impl SessionFactory for SimFactory {
    type Session = SimSession;

    fn new_session(&self, args: &SessionArgs) -> Result<SimSession, CliError> {
        if self.shared.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CliError::ConnectClosed);
        }
        let delay = *self.shared.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let (session, device) = SimSession::new(args.clone());
        self.shared.devices.lock().push(device);
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }
}
