// Remapd Daemon
// Grabs input devices, runs the translation stage and drives the
// virtual output device

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use remapd_core::config::{parse_config, Config};
use remapd_core::input::{DeviceError, GrabbedDevices, RawInputEvent};
use remapd_core::output::VirtualDevice;
use remapd_core::server::{ButtonDebouncer, ClientMessage, ControlPort};
use remapd_core::{
    is_input_timeout_event, make_input_timeout_event, Key, KeyEvent, KeyState, Stage, NO_DEVICE,
};

const VIRTUAL_DEVICE_NAME: &str = "Remapd Virtual Keyboard";
const EV_KEY: u16 = 1;

/// Context-sensitive key remapping daemon
#[derive(Parser, Debug)]
#[command(name = "remapd")]
#[command(version)]
#[command(about = "Context-sensitive key remapping daemon", long_about = None)]
struct Args {
    /// Configuration file (default: $XDG_CONFIG_HOME/remapd/config.toml)
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Manually specify devices to grab (can be used multiple times)
    #[arg(short, long, value_name = "DEVICE")]
    devices: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Delay bouncing button presses
    #[arg(long)]
    debounce: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,

    /// List available input devices
    #[arg(long)]
    list_devices: bool,
}

fn default_config_path() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(dir).join("remapd/config.toml");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config/remapd/config.toml");
    }
    PathBuf::from("/etc/remapd/config.toml")
}

fn load_configuration(args: &Args) -> Result<Config, String> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    if !path.exists() && args.config.is_none() {
        // No file is fine: run with an empty configuration until the
        // front-end supplies one over the control socket.
        log::info!("No configuration at {}, starting empty", path.display());
        return parse_config("").map_err(|e| e.to_string());
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    parse_config(&text).map_err(|e| format!("{}: {}", path.display(), e))
}

fn to_key_event(raw: &RawInputEvent) -> Option<KeyEvent> {
    if raw.event_type != EV_KEY {
        return None;
    }
    let key = Key::physical(raw.code);
    match raw.value {
        0 => Some(KeyEvent::up(key)),
        // Kernel autorepeat arrives as value 2 and is handled like a Down;
        // the stage and the pending-flush check suppress it as needed.
        1 | 2 => Some(KeyEvent::down(key)),
        _ => None,
    }
}

/// The driver: owns the stage and all I/O collaborators and runs the
/// blocking update loop. All waiting happens here; the stage never blocks.
struct Server {
    stage: Stage,
    grabbed: GrabbedDevices,
    virtual_device: VirtualDevice,
    port: ControlPort,
    debouncer: Option<ButtonDebouncer>,
    device_filter: Vec<String>,
    send_buffer: Vec<KeyEvent>,
    flush_scheduled_at: Option<Instant>,
    input_timeout_start: Option<Instant>,
    input_timeout: Duration,
    virtual_keys_down: Vec<Key>,
    last_key_event: Option<KeyEvent>,
    last_device_index: usize,
    running: Arc<AtomicBool>,
}

impl Server {
    fn schedule_flush(&mut self, delay: Duration) {
        if self.flush_scheduled_at.is_none() {
            self.flush_scheduled_at = Some(Instant::now() + delay);
        }
    }

    /// The driver owns the virtual-key toggle set; toggles re-enter the
    /// stage as synthetic input instead of the stage calling itself.
    fn toggle_virtual_key(&mut self, key: Key) {
        if let Some(pos) = self.virtual_keys_down.iter().position(|k| *k == key) {
            self.virtual_keys_down.remove(pos);
            self.translate_input(KeyEvent::up(key), NO_DEVICE);
        } else {
            self.virtual_keys_down.push(key);
            self.translate_input(KeyEvent::down(key), NO_DEVICE);
        }
    }

    fn translate_input(&mut self, input: KeyEvent, device_index: usize) {
        // Ignore key repeat while a flush or a timeout is pending. The
        // device index is deliberately not part of the comparison.
        if self.last_key_event == Some(input)
            && (self.flush_scheduled_at.is_some() || self.input_timeout_start.is_some())
        {
            return;
        }

        // Any translatable input cancels a pending input timeout; the
        // elapsed quiet period is delivered first so timeout patterns are
        // resolved before the new event re-drives matching.
        if let Some(start) = self.input_timeout_start.take() {
            self.translate_input(make_input_timeout_event(start.elapsed()), device_index);
        }

        self.last_key_event = Some(input);
        self.last_device_index = device_index;

        let mut output = self.stage.update(input, device_index);
        log::debug!(
            "translate {} (device {}) -> {}",
            input,
            device_index,
            remapd_core::format_sequence(&output)
        );

        // A trailing input-timeout marker asks us to wake the stage up
        // after the quiet period.
        if output.last().is_some_and(is_input_timeout_event) {
            let marker = output.pop().expect("checked non-empty");
            self.input_timeout_start = Some(Instant::now());
            self.input_timeout = marker.timeout_duration();
        }

        self.send_buffer.extend_from_slice(&output);
        self.stage.reuse_buffer(output);
    }

    fn dispatch_action(&mut self, index: usize) {
        if self.port.client_connected() {
            self.port.send_triggered_action(index);
            return;
        }
        // Standalone fallback: run registered terminal commands directly.
        let Some(command) = self.stage.config().terminal_commands.get(index).cloned() else {
            log::warn!("triggered action {} has no command", index);
            return;
        };
        log::debug!("spawning terminal command: {}", command);
        match std::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(mut child) => {
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => log::warn!("spawning '{}' failed: {}", command, e),
        }
    }

    /// Send buffered events to the virtual device, dispatching action and
    /// virtual-key tokens and honoring timeout markers and debounce delays.
    fn flush_send_buffer(&mut self) -> bool {
        let mut i = 0;
        while i < self.send_buffer.len() {
            let event = self.send_buffer[i];

            if event.key.is_action() {
                if event.state == KeyState::Down {
                    let index = event.key.action_index().expect("action key");
                    self.dispatch_action(index);
                }
                i += 1;
                continue;
            }

            if event.key.is_virtual() {
                i += 1;
                if event.state == KeyState::Down {
                    // May append further output to the send buffer, which
                    // this same pass then picks up.
                    self.toggle_virtual_key(event.key);
                }
                continue;
            }

            if event.key == Key::TIMEOUT {
                self.schedule_flush(event.timeout_duration());
                i += 1;
                break;
            }

            if event.state == KeyState::Down && event.key.is_pointer_button() {
                let is_last = i + 1 == self.send_buffer.len();
                let delay = match &mut self.debouncer {
                    Some(debouncer) => debouncer.on_key_down(event.key, !is_last),
                    None => Duration::ZERO,
                };
                if delay > Duration::ZERO {
                    self.schedule_flush(delay);
                    break;
                }
            }

            if self.virtual_device.send_key_event(&event).is_err() {
                return false;
            }
            i += 1;
        }
        self.send_buffer.drain(..i);

        self.virtual_device.flush().is_ok()
    }

    fn replace_configuration(&mut self, text: &str) -> Result<(), DeviceError> {
        let config = match parse_config(text) {
            Ok(config) => config,
            Err(e) => {
                // The stage keeps running on the previous configuration.
                log::error!("Configuration rejected: {}", e);
                return Ok(());
            }
        };
        log::info!("Received configuration");
        let mouse_changed = config.has_mouse_mappings() != self.stage.has_mouse_mappings();
        let grab_mice = config.has_mouse_mappings();
        self.stage = Stage::new(config);
        self.send_buffer.clear();
        self.flush_scheduled_at = None;
        self.input_timeout_start = None;
        self.last_key_event = None;
        if mouse_changed {
            // The device layer must rebind to include or drop pointers.
            log::info!("Mouse usage in configuration changed, regrabbing");
            self.grabbed.ungrab_all();
            self.grabbed = GrabbedDevices::grab(&self.device_filter, grab_mice)?;
        }
        self.stage
            .evaluate_device_filters(self.grabbed.grabbed_device_names());
        Ok(())
    }

    fn process_client_messages(&mut self) -> bool {
        let messages = match self.port.poll_messages() {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("Control socket failed: {}", e);
                return true;
            }
        };
        for message in messages {
            match message {
                ClientMessage::ActiveContexts(contexts) => {
                    log::debug!("Received contexts ({})", contexts.len());
                    self.stage.set_active_contexts(&contexts);
                }
                ClientMessage::Configuration(text) => {
                    if let Err(e) = self.replace_configuration(&text) {
                        log::error!("Regrabbing devices failed: {}", e);
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Main update loop. Returns the process exit code.
    fn main_loop(&mut self) -> i32 {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                log::info!("Shutting down");
                return 0;
            }

            // Deadline: the earlier of a scheduled flush and a pending
            // input timeout.
            let now = Instant::now();
            let mut timeout: Option<Duration> = None;
            let mut set_timeout = |deadline: Instant| {
                let remaining = deadline.saturating_duration_since(now);
                if timeout.is_none_or(|current| remaining < current) {
                    timeout = Some(remaining);
                }
            };
            if let Some(at) = self.flush_scheduled_at {
                set_timeout(at);
            }
            if let Some(start) = self.input_timeout_start {
                set_timeout(start + self.input_timeout);
            }

            // Only let the front-end interrupt the wait while no output
            // key is held down.
            let interrupt_fd = if self.stage.is_output_down() {
                -1
            } else {
                self.port.interrupt_fd()
            };

            let input = match self.grabbed.read_input_event(timeout, interrupt_fd) {
                Ok(input) => input,
                Err(e) => {
                    log::error!("Reading input event failed: {}", e);
                    return 1;
                }
            };

            if self.grabbed.take_devices_changed() {
                self.stage
                    .evaluate_device_filters(self.grabbed.grabbed_device_names());
            }

            let now = Instant::now();

            if let Some(raw) = input {
                match to_key_event(&raw) {
                    Some(event) => self.translate_input(event, raw.device_index),
                    None => {
                        // Forward non-key events untranslated.
                        self.virtual_device.send_raw(raw.event_type, raw.code, raw.value);
                        let _ = self.virtual_device.flush();
                        continue;
                    }
                }
            }

            if let Some(start) = self.input_timeout_start {
                if now >= start + self.input_timeout {
                    self.input_timeout_start = None;
                    let elapsed = self.input_timeout;
                    self.translate_input(
                        make_input_timeout_event(elapsed),
                        self.last_device_index,
                    );
                }
            }

            if self.flush_scheduled_at.is_none_or(|at| now > at) {
                self.flush_scheduled_at = None;
                if !self.flush_send_buffer() {
                    log::error!("Sending input failed");
                    return 1;
                }
            }

            if interrupt_fd >= 0 && !self.process_client_messages() {
                return 1;
            }

            if self.stage.should_exit() {
                log::info!("Read exit sequence");
                return 0;
            }
        }
    }
}

fn list_devices() -> i32 {
    match GrabbedDevices::list_devices() {
        Ok(devices) => {
            for device in devices {
                println!("{}: {} ({})", device.index, device.name, device.path);
            }
            0
        }
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    }
}

fn run() -> i32 {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    if args.list_devices {
        return list_devices();
    }

    let config = match load_configuration(&args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Loading configuration failed: {}", e);
            return 1;
        }
    };
    if args.check_config {
        println!("configuration ok");
        return 0;
    }

    let stage = Stage::new(config);

    let port = match ControlPort::bind() {
        Ok(port) => port,
        Err(e) => {
            log::error!("Binding control socket failed: {}", e);
            return 1;
        }
    };

    let virtual_device = match VirtualDevice::create(VIRTUAL_DEVICE_NAME) {
        Ok(device) => device,
        Err(e) => {
            log::error!("Creating virtual device failed: {}", e);
            return 1;
        }
    };

    let grabbed = match GrabbedDevices::grab(&args.devices, stage.has_mouse_mappings()) {
        Ok(grabbed) => grabbed,
        Err(e) => {
            log::error!("Initializing input device grabbing failed: {}", e);
            return 1;
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;
        let running = running.clone();
        std::thread::spawn(move || {
            if let Ok(mut signals) = Signals::new([SIGINT, SIGTERM]) {
                if signals.forever().next().is_some() {
                    running.store(false, Ordering::SeqCst);
                }
            }
        });
    }

    let mut server = Server {
        stage,
        grabbed,
        virtual_device,
        port,
        debouncer: args.debounce.then(ButtonDebouncer::default),
        device_filter: args.devices.clone(),
        send_buffer: Vec::new(),
        flush_scheduled_at: None,
        input_timeout_start: None,
        input_timeout: Duration::ZERO,
        virtual_keys_down: Vec::new(),
        last_key_event: None,
        last_device_index: NO_DEVICE,
        running,
    };
    server
        .stage
        .evaluate_device_filters(server.grabbed.grabbed_device_names());

    log::info!("Entering update loop");
    let code = server.main_loop();
    server.grabbed.ungrab_all();
    code
}

fn main() {
    std::process::exit(run());
}
