//! In-target orchestrator: connects to the manager, shakes hands, listens
//! for framed messages on a dedicated thread and fans them out through the
//! dispatch registry.

use std::net::{Ipv4Addr, Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use mempatch_common::channel::{self, ClientOp, HandlerRegistry, LogSeverity, ServerOp};
use mempatch_common::error::{Error, Result};
use mempatch_common::wire::{self, Wire, WireReader};

use crate::hooks::HookRuntime;
use crate::loader::PatchLoader;
use crate::patcher::Patcher;

pub struct Core {
    /// Write half; every sender serialises on this lock.
    sender: Mutex<TcpStream>,
    registry: HandlerRegistry<()>,
    connected: AtomicBool,
    core_name: String,
    patcher: Arc<Patcher>,
    runtime: Arc<HookRuntime>,
    loader: Arc<PatchLoader>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    /// Connect to the manager on the loopback port and complete the
    /// handshake: send `CONNECT`, expect `CONNECT_OK`, receive the core
    /// library name, scrub it from `LD_PRELOAD` so child processes are not
    /// co-injected, start the patcher worker and listener, send `READY`.
    pub fn connect(port: u16) -> Result<Arc<Core>> {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;

        channel::write_raw_op(&mut stream, ClientOp::Connect as u32)?;
        let reply = channel::read_raw_op(&mut stream)?;
        if reply != ServerOp::ConnectOk as u32 {
            return Err(Error::protocol("invalid handshake reply"));
        }

        // Length-prefixed block holding the core library name.
        let core_name = read_name_block(&mut stream)?;
        scrub_preload(&core_name);

        let patcher = Arc::new(Patcher::new());
        patcher.start();
        let runtime = Arc::new(HookRuntime::new(Arc::clone(&patcher)));
        runtime.install();
        let loader = Arc::new(PatchLoader::new(
            Arc::clone(&patcher),
            Arc::clone(&runtime),
        ));

        let core = Arc::new(Core {
            sender: Mutex::new(stream.try_clone()?),
            registry: HandlerRegistry::new(),
            connected: AtomicBool::new(true),
            core_name,
            patcher,
            runtime,
            loader: Arc::clone(&loader),
            listener: Mutex::new(None),
        });
        loader.subscribe(&core.registry);

        let listener_core = Arc::clone(&core);
        let handle = std::thread::spawn(move || listener_core.listen(stream));
        *core.listener.lock().unwrap() = Some(handle);

        // Only after READY may the manager broadcast state.
        channel::write_raw_op(&mut *core.sender.lock().unwrap(), ClientOp::Ready as u32)?;
        info!("connected to manager as `{}'", core.core_name);
        Ok(core)
    }

    pub fn core_name(&self) -> &str {
        &self.core_name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &HandlerRegistry<()> {
        &self.registry
    }

    pub fn loader(&self) -> &Arc<PatchLoader> {
        &self.loader
    }

    /// Send one framed message to the manager. Silently dropped once
    /// disconnected, matching the fire-and-forget nature of client traffic.
    pub fn send(&self, op: ClientOp, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let mut sender = self.sender.lock().unwrap();
        channel::write_frame(&mut *sender, op as u32, data)
    }

    pub fn send_custom(&self, op: u32, data: &[u8]) -> Result<()> {
        let packet = channel::CustomPacket {
            op,
            data: data.to_vec(),
        };
        self.send(ClientOp::Custom, &packet.to_bytes())
    }

    pub fn send_log(&self, severity: LogSeverity, message: &str) -> Result<()> {
        let mut data = Vec::with_capacity(8 + message.len());
        wire::put_u32(&mut data, severity as u32);
        wire::put_string(&mut data, message);
        self.send(ClientOp::Log, &data)
    }

    /// Close this end cleanly; idempotent.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut sender = self.sender.lock().unwrap();
        let _ = channel::write_frame(&mut *sender, ClientOp::Disconnect as u32, &[]);
        let _ = sender.shutdown(Shutdown::Both);
        debug!("disconnected from manager");
    }

    /// Manager-initiated teardown: every patch undone, the artifact
    /// unloaded, the worker stopped, the socket closed. The target process
    /// keeps running without us.
    fn detach(&self) {
        info!("detaching from target");
        if let Err(error) = self.loader.detach_all() {
            error!("detach cleanup failed: {}", error);
        }
        self.disconnect();
        self.patcher.stop();
    }

    fn listen(self: Arc<Self>, mut stream: TcpStream) {
        loop {
            let frame = match channel::read_frame(&mut stream) {
                Ok(frame) => frame,
                Err(_) => {
                    // Peer vanished or sent garbage; close our end.
                    self.disconnect();
                    break;
                }
            };
            match ServerOp::from_wire(frame.op) {
                Ok(ServerOp::Disconnect) => {
                    self.disconnect();
                    break;
                }
                Ok(ServerOp::Detach) => {
                    self.detach();
                    break;
                }
                Ok(_) => self.registry.dispatch(frame.op, &(), &frame.data),
                Err(error) => {
                    // Unknown op code: protocol error, close the socket.
                    warn!("{}", error);
                    self.disconnect();
                    break;
                }
            }
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.disconnect();
        self.patcher.stop();
    }
}

fn read_name_block(stream: &mut TcpStream) -> Result<String> {
    use std::io::Read;
    let mut size = [0u8; 4];
    stream.read_exact(&mut size)?;
    let mut block = vec![0u8; u32::from_le_bytes(size) as usize];
    stream.read_exact(&mut block)?;
    WireReader::new(&block).string()
}

/// Drop our own file name from `LD_PRELOAD` so processes the target spawns
/// do not load the core again.
fn scrub_preload(core_name: &str) {
    if core_name.is_empty() {
        return;
    }
    if let Ok(preload) = std::env::var("LD_PRELOAD") {
        if preload.contains(core_name) {
            let cleaned = preload.replacen(core_name, "", 1);
            let cleaned = cleaned.trim().trim_matches(':').to_string();
            std::env::set_var("LD_PRELOAD", cleaned);
        }
    }
}
