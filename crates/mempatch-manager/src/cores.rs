//! Core connections: launching (or attaching to) targets, the handshake,
//! per-core sends and the single listener thread multiplexing every
//! connected core with `poll(2)`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use mempatch_common::channel::{
    self, ClientOp, CustomPacket, HandlerRegistry, LogSeverity, ServerOp, CONTROL_PORT,
};
use mempatch_common::error::{Error, Result};
use mempatch_common::wire::{self, Wire, WireReader};

pub type CoreId = u32;

/// Wake-channel message that only breaks the listener out of `poll` (a new
/// core was added); non-zero values name a core to close.
const WAKE_ONLY: CoreId = 0;

struct CoreConn {
    stream: TcpStream,
    pid: Option<u32>,
}

struct CoresState {
    cores: HashMap<CoreId, CoreConn>,
    /// Starts at 1 and never recycles: a frame addressed to a dead core must
    /// error, never reach a newer core that reused the id.
    next_id: CoreId,
    wake_tx: Option<UnixStream>,
    listener: Option<JoinHandle<()>>,
}

struct CoresShared {
    state: Mutex<CoresState>,
    registry: HandlerRegistry<CoreId>,
}

pub struct CoreManager {
    shared: Arc<CoresShared>,
}

impl CoreManager {
    pub fn new() -> Self {
        let registry = HandlerRegistry::new();
        registry.add(ClientOp::Log as u32, |core_id: &CoreId, data: &[u8]| {
            let mut r = WireReader::new(data);
            let (severity, message) = match (r.u32(), r.string()) {
                (Ok(severity), Ok(message)) => (LogSeverity::from_wire(severity), message),
                _ => {
                    warn!(core = *core_id, "malformed log frame");
                    return;
                }
            };
            match severity {
                LogSeverity::Error => error!(core = *core_id, "{}", message),
                LogSeverity::Warning => warn!(core = *core_id, "{}", message),
                LogSeverity::Info => info!(core = *core_id, "{}", message),
                LogSeverity::Debug => debug!(core = *core_id, "{}", message),
            }
        });

        Self {
            shared: Arc::new(CoresShared {
                state: Mutex::new(CoresState {
                    cores: HashMap::new(),
                    next_id: 1,
                    wake_tx: None,
                    listener: None,
                }),
                registry,
            }),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry<CoreId> {
        &self.shared.registry
    }

    pub fn connected_cores(&self) -> Vec<CoreId> {
        let mut ids: Vec<CoreId> = self
            .shared
            .state
            .lock()
            .unwrap()
            .cores
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Spawn the target with the core library injected through the preload
    /// list and wait for its core to connect. The child is killed when no
    /// core shows up in time.
    pub fn launch(
        &self,
        program: &str,
        arguments: &[String],
        library_path: &str,
        core_library: &str,
        port: u16,
    ) -> Result<CoreId> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;

        let mut command = Command::new(program);
        command.args(arguments);
        command.env(
            "LD_LIBRARY_PATH",
            extend_path_list(
                &std::env::var("LD_LIBRARY_PATH").unwrap_or_default(),
                library_path,
                ':',
            ),
        );
        command.env(
            "LD_PRELOAD",
            extend_path_list(
                &std::env::var("LD_PRELOAD").unwrap_or_default(),
                core_library,
                ' ',
            ),
        );
        if port != CONTROL_PORT {
            command.env("MEMPATCH_PORT", port.to_string());
        }

        let child = command.spawn()?;
        let pid = child.id();
        info!(pid, program, "target launched");

        match self.attach(&listener, Some(pid), core_library, Duration::from_secs(5)) {
            Ok(core_id) => Ok(core_id),
            Err(error) => {
                // No core, no point keeping the target around.
                // SAFETY: signalling the child we just spawned.
                unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
                Err(error)
            }
        }
    }

    /// Accept one core connection on `listener` and run the handshake:
    /// `CONNECT` in, `CONNECT_OK` out, the core library name out, `READY`
    /// in. Only then is the core registered and eligible for broadcasts.
    pub fn attach(
        &self,
        listener: &TcpListener,
        pid: Option<u32>,
        core_name: &str,
        timeout: Duration,
    ) -> Result<CoreId> {
        if !poll_readable(listener.as_raw_fd(), timeout)? {
            return Err(Error::protocol("timed out waiting for a core to connect"));
        }
        let (mut stream, _) = listener.accept()?;
        stream.set_read_timeout(Some(timeout))?;

        let op = channel::read_raw_op(&mut stream)?;
        if op != ClientOp::Connect as u32 {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(Error::protocol("invalid handshake from core"));
        }
        channel::write_raw_op(&mut stream, ServerOp::ConnectOk as u32)?;

        let mut block = Vec::new();
        wire::put_string(&mut block, core_name);
        stream.write_all(&(block.len() as u32).to_le_bytes())?;
        stream.write_all(&block)?;

        loop {
            let op = channel::read_raw_op(&mut stream)?;
            if op == ClientOp::Ready as u32 {
                break;
            }
        }
        stream.set_read_timeout(None)?;

        let mut state = self.shared.state.lock().unwrap();
        let core_id = state.next_id;
        state.next_id = state.next_id.checked_add(1).ok_or(Error::CoreIdsExhausted)?;
        state.cores.insert(core_id, CoreConn { stream, pid });

        if state.cores.len() == 1 {
            self.spawn_listener(&mut state)?;
        } else {
            wake(&state, WAKE_ONLY);
        }
        info!(core = core_id, "core connected and ready");
        Ok(core_id)
    }

    pub fn send_to(&self, core_id: CoreId, op: ServerOp, data: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        let conn = state
            .cores
            .get_mut(&core_id)
            .ok_or(Error::UnknownCore(core_id))?;
        channel::write_frame(&mut conn.stream, op as u32, data)
    }

    /// Send to every connected core; per-core failures are logged, the rest
    /// still receive the frame.
    pub fn broadcast(&self, op: ServerOp, data: &[u8]) {
        for core_id in self.connected_cores() {
            if let Err(err) = self.send_to(core_id, op, data) {
                warn!(core = core_id, "broadcast failed: {}", err);
            }
        }
    }

    pub fn send_custom_to(&self, core_id: CoreId, op: u32, data: &[u8]) -> Result<()> {
        let packet = CustomPacket {
            op,
            data: data.to_vec(),
        };
        self.send_to(core_id, ServerOp::Custom, &packet.to_bytes())
    }

    /// Ask a core to disconnect, then have the listener drop it.
    pub fn end_core_connection(&self, core_id: CoreId) -> Result<()> {
        self.send_to(core_id, ServerOp::Disconnect, &[])?;
        wake(&self.shared.state.lock().unwrap(), core_id);
        Ok(())
    }

    /// Detach a core: it unloads itself and the target keeps running.
    pub fn end_core(&self, core_id: CoreId) -> Result<()> {
        self.send_to(core_id, ServerOp::Detach, &[])?;
        wake(&self.shared.state.lock().unwrap(), core_id);
        Ok(())
    }

    /// Disconnect every core and stop the listener thread.
    pub fn stop(&self) {
        let ids = self.connected_cores();
        for core_id in ids {
            let _ = self.end_core_connection(core_id);
        }
        let handle = self.shared.state.lock().unwrap().listener.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn spawn_listener(&self, state: &mut CoresState) -> Result<()> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        state.wake_tx = Some(wake_tx);
        let shared = Arc::clone(&self.shared);
        state.listener = Some(std::thread::spawn(move || listener_loop(shared, wake_rx)));
        Ok(())
    }
}

impl Default for CoreManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CoreManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wake(state: &CoresState, core_id: CoreId) {
    if let Some(wake_tx) = state.wake_tx.as_ref() {
        let mut writer = wake_tx;
        let _ = Write::write_all(&mut writer, &core_id.to_le_bytes());
    }
}

fn drop_core(state: &mut CoresState, core_id: CoreId) {
    if let Some(conn) = state.cores.remove(&core_id) {
        let _ = conn.stream.shutdown(Shutdown::Both);
        info!(core = core_id, "core connection closed");
    }
}

/// The multi-core listener: one thread, `poll(2)` over the wake channel and
/// every core socket. Exits when the last core is gone; a fresh thread is
/// spawned with the next first core.
fn listener_loop(shared: Arc<CoresShared>, mut wake_rx: UnixStream) {
    loop {
        let fds: Vec<(CoreId, i32)> = {
            let mut state = shared.state.lock().unwrap();
            if state.cores.is_empty() {
                state.wake_tx = None;
                break;
            }
            state
                .cores
                .iter()
                .map(|(id, conn)| (*id, conn.stream.as_raw_fd()))
                .collect()
        };

        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(fds.len() + 1);
        pollfds.push(libc::pollfd {
            fd: wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for (_, fd) in &fds {
            pollfds.push(libc::pollfd {
                fd: *fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }

        // SAFETY: pollfds stays alive across the call.
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }

        if pollfds[0].revents & libc::POLLIN != 0 {
            let mut buf = [0u8; 4];
            if wake_rx.read_exact(&mut buf).is_err() {
                break;
            }
            let core_id = CoreId::from_le_bytes(buf);
            if core_id != WAKE_ONLY {
                drop_core(&mut shared.state.lock().unwrap(), core_id);
            }
            continue;
        }

        // Collect frames under the lock, dispatch outside it so handlers can
        // send without deadlocking.
        let mut dispatches = Vec::new();
        {
            let mut state = shared.state.lock().unwrap();
            for (index, (core_id, _)) in fds.iter().enumerate() {
                let revents = pollfds[index + 1].revents;
                if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) == 0 {
                    continue;
                }
                let frame = match state.cores.get_mut(core_id) {
                    Some(conn) => channel::read_frame(&mut conn.stream),
                    None => continue,
                };
                match frame {
                    Ok(frame) if frame.op == ClientOp::Disconnect as u32 => {
                        drop_core(&mut state, *core_id);
                    }
                    Ok(frame) => match ClientOp::from_wire(frame.op) {
                        Ok(_) => dispatches.push((*core_id, frame)),
                        Err(err) => {
                            // Unknown opcode: protocol error, drop the core.
                            warn!(core = *core_id, "{}", err);
                            drop_core(&mut state, *core_id);
                        }
                    },
                    Err(_) => drop_core(&mut state, *core_id),
                }
            }
        }
        for (core_id, frame) in dispatches {
            shared.registry.dispatch(frame.op, &core_id, &frame.data);
        }
    }
}

/// Wait for `fd` to become readable; false on timeout.
fn poll_readable(fd: i32, timeout: Duration) -> Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: a single pollfd on the stack.
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as libc::c_int) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(rc > 0)
}

/// Append `entry` to a separator-joined list unless it is already present.
fn extend_path_list(current: &str, entry: &str, separator: char) -> String {
    if current.is_empty() {
        return entry.to_string();
    }
    let already_there = current.split(separator).any(|existing| existing == entry);
    if already_there {
        current.to_string()
    } else {
        format!("{}{}{}", current, separator, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_path_list() {
        assert_eq!(extend_path_list("", "/opt/lib", ':'), "/opt/lib");
        assert_eq!(
            extend_path_list("/usr/lib", "/opt/lib", ':'),
            "/usr/lib:/opt/lib"
        );
        assert_eq!(
            extend_path_list("/usr/lib:/opt/lib", "/opt/lib", ':'),
            "/usr/lib:/opt/lib"
        );
        assert_eq!(
            extend_path_list("liba.so", "libcore.so", ' '),
            "liba.so libcore.so"
        );
    }

    #[test]
    fn test_send_to_unknown_core_errors() {
        let manager = CoreManager::new();
        assert!(matches!(
            manager.send_to(7, ServerOp::PatchPack, &[]),
            Err(Error::UnknownCore(7))
        ));
    }

    #[test]
    fn test_connected_cores_starts_empty() {
        let manager = CoreManager::new();
        assert!(manager.connected_cores().is_empty());
        manager.broadcast(ServerOp::PatchLibUnload, &[]);
    }
}
