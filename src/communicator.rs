//! Single-client unix-socket connection to the external daemon.
//!
//! One worker thread runs a connect-with-backoff loop, then polls the
//! socket and the event queue's wakeup together, dispatching inbound
//! `COMMAND[:DATA]` frames to a registered-commands table and draining
//! outbound queue entries. Uses `nix::poll::poll` rather than `epoll` since
//! it only ever waits on two file descriptors.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;

use crate::config::{Config, ConfigValue};
use crate::events::EventQueue;

pub type CommandCallback = Box<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

struct Registered {
    callback: CommandCallback,
    #[allow(dead_code)]
    helptext: String,
}

/// Owns the control socket, its worker thread, and the outbound event
/// queue.
pub struct Communicator {
    config: Arc<Config>,
    queue: Arc<EventQueue>,
    commands: Mutex<HashMap<String, Registered>>,
    running: AtomicBool,
}

impl Communicator {
    pub fn new(config: Arc<Config>, queue: Arc<EventQueue>) -> Arc<Self> {
        let comm = Arc::new(Communicator {
            config,
            queue,
            commands: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        });
        comm.register_builtins();
        comm
    }

    fn register_builtins(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.register_command("HELP", "list registered command names", move |_| {
            let names: Vec<String> = this.commands.lock().keys().cloned().collect();
            Ok(serde_json::json!({ "commands": names }).to_string())
        });

        let this = Arc::clone(self);
        self.register_command("USER", "the owning username", move |_| {
            Ok(format!("{:?}", this.config.username()))
        });

        let this = Arc::clone(self);
        self.register_command("CONFIG", "CONFIG:<key>", move |key| {
            this.config
                .get(key)
                .map(|v| serde_json::json!({ "value": v.to_string() }).to_string())
                .ok_or_else(|| "could not find config value".to_string())
        });

        let this = Arc::clone(self);
        self.register_command(
            "SETCONFIG",
            "SETCONFIG:<key>=<value> - only works for live keys",
            move |kv| match kv.split_once('=') {
                Some((key, value)) => {
                    if this.config.set_live(key, ConfigValue::Str(value.to_string())) {
                        Ok(String::new())
                    } else {
                        Err(format!("{key} is not a live config key"))
                    }
                }
                None => Err("expecting key=value".to_string()),
            },
        );
    }

    /// Registers a command; `name` is upper-cased before insertion, so
    /// lookups are case-insensitive on the wire.
    pub fn register_command(
        &self,
        name: &str,
        helptext: &str,
        callback: impl Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    ) {
        self.commands.lock().insert(
            name.to_ascii_uppercase(),
            Registered {
                callback: Box::new(callback),
                helptext: helptext.to_string(),
            },
        );
    }

    /// Enqueues `message`; never blocks, drops under backpressure (see
    /// `EventQueue::push`).
    pub fn send_event(&self, message: crate::events::EventMessage) {
        self.queue.push(message);
    }

    /// Enqueues a pre-formatted JSON line outside the `EventMessage` shape
    /// (`control`'s `namechange` notification).
    pub fn send_raw(&self, line: String) {
        self.queue.push_raw(line);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Pops one queued outbound line without a real socket connection, so
    /// variant tests can assert on emitted events directly.
    #[cfg(test)]
    pub fn pop_for_test(&self) -> Option<String> {
        self.queue.pop()
    }

    /// Runs the connect/poll/dispatch loop until `stop` is called. Intended
    /// to be spawned on its own `std::thread`, matching
    /// `Communicator::communication_thread`.
    pub fn run(self: &Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            let Some(stream) = self.connect_with_backoff() else {
                break;
            };
            self.serve_connection(stream);
        }
    }

    fn connect_with_backoff(&self) -> Option<UnixStream> {
        let socket_path = self.config.daemon_socket();
        let mut backoff = Duration::from_millis(1);
        let mut initial = true;

        while self.running.load(Ordering::Acquire) {
            match UnixStream::connect(&socket_path) {
                Ok(stream) => {
                    if self.send_hello(&stream) {
                        return Some(stream);
                    }
                }
                Err(e) => {
                    if initial {
                        warn!("failed to connect to daemon socket: {e}");
                    }
                }
            }
            initial = false;
            std::thread::sleep(backoff);
            backoff = std::cmp::min(backoff * 2, Duration::from_secs(1));
        }
        None
    }

    fn send_hello(&self, stream: &UnixStream) -> bool {
        let hello = serde_json::json!({
            "op": "hello",
            "user": self.config.username(),
            "mountpoint": self.config.mountpoint().to_string_lossy(),
        });
        write_line(stream, &format!("{hello}\n"))
    }

    fn serve_connection(self: &Arc<Self>, stream: UnixStream) {
        let raw_fd = stream.as_raw_fd();
        let wakeup_fd = self.queue.wakeup_fd();

        loop {
            if !self.running.load(Ordering::Acquire) {
                return;
            }

            // Any events enqueued since the last drain are flushed first,
            // matching the original's "fake an activation" before polling.
            while let Some(line) = self.queue.pop() {
                if !write_line(&stream, &line) {
                    return;
                }
            }

            let socket_fd = unsafe { BorrowedFd::borrow_raw(raw_fd) };
            let event_fd = unsafe { BorrowedFd::borrow_raw(wakeup_fd) };
            let mut fds = [
                PollFd::new(socket_fd, PollFlags::POLLIN),
                PollFd::new(event_fd, PollFlags::POLLIN),
            ];

            match poll(&mut fds, PollTimeout::from(1000u16)) {
                Ok(n) if n > 0 => {
                    if fds[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
                        if !self.handle_inbound(&stream) {
                            return;
                        }
                    }
                    if fds[1].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
                        self.queue.drain_wakeup();
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("poll failed: {e}");
                    return;
                }
            }
        }
    }

    fn handle_inbound(&self, stream: &UnixStream) -> bool {
        use std::io::Read;
        let mut buf = [0u8; 1024];
        let mut stream_ref = stream;
        match stream_ref.read(&mut buf) {
            Ok(0) => false,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                for line in text.lines() {
                    self.execute_command(stream, line);
                }
                true
            }
            Err(e) => {
                warn!("control socket read failed: {e}");
                false
            }
        }
    }

    fn execute_command(&self, stream: &UnixStream, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let (cmd, data) = match raw.split_once(':') {
            Some((c, d)) => (c, d),
            None => (raw, ""),
        };
        let cmd = cmd.to_ascii_uppercase();

        let response = match self.commands.lock().get(&cmd) {
            Some(registered) => (registered.callback)(data),
            None => Err("unknown command".to_string()),
        };

        let reply = match response {
            Ok(resp) => {
                let resp = if resp.is_empty() { "\"\"".to_string() } else { resp };
                format!("{{\"state\":\"success\",\"response\":{resp}}}\n")
            }
            Err(err) => {
                format!(
                    "{{\"state\":\"error\",\"cmd\":{:?},\"response\":{:?}}}\n",
                    cmd, err
                )
            }
        };
        let _ = write_line(stream, &reply);
        info!("handled control command {cmd}");
    }
}

fn write_line(mut stream: &UnixStream, line: &str) -> bool {
    use std::io::Write;
    let line = if line.ends_with('\n') {
        line.to_string()
    } else {
        format!("{line}\n")
    };
    stream.write_all(line.as_bytes()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn test_config() -> Arc<Config> {
        let mut overrides = Map::new();
        overrides.insert("raids".to_string(), "/r1".to_string());
        overrides.insert("username".to_string(), "alice".to_string());
        overrides.insert("mountpoint".to_string(), "/mnt/alice".to_string());
        overrides.insert("daemonize".to_string(), "false".to_string());
        overrides.insert("truncate_maxsize".to_string(), "1024".to_string());
        overrides.insert("anon_user_name".to_string(), "anon".to_string());
        overrides.insert("anon_mapping_file".to_string(), "/tmp/anon.map".to_string());
        overrides.insert("daemon_socket".to_string(), "/tmp/mammutfs.sock".to_string());
        overrides.insert("modules".to_string(), "private,public".to_string());
        overrides.insert("max_native_fds".to_string(), "128".to_string());
        overrides.insert("loglevel".to_string(), "INFO".to_string());
        Arc::new(Config::load(std::path::Path::new("/nonexistent"), &overrides).unwrap())
    }

    #[test]
    fn setconfig_rejects_non_live_keys() {
        let config = test_config();
        let queue = Arc::new(EventQueue::new());
        let comm = Communicator::new(config, queue);
        let commands = comm.commands.lock();
        let cb = &commands.get("SETCONFIG").unwrap().callback;
        assert!(cb("username=mallory").is_err());
        assert!(cb("loglevel=TRACE").is_ok());
    }

    #[test]
    fn help_lists_builtin_commands() {
        let config = test_config();
        let queue = Arc::new(EventQueue::new());
        let comm = Communicator::new(config, queue);
        let commands = comm.commands.lock();
        let cb = &commands.get("HELP").unwrap().callback;
        let resp = cb("").unwrap();
        assert!(resp.contains("USER"));
        assert!(resp.contains("CONFIG"));
    }
}
