//! Manager/core control channel: framing, op-code spaces and the dispatch
//! registry shared by both sides.
//!
//! Every framed message is `u32 op_code || u32 data_size || data`. The
//! handshake that precedes framed traffic exchanges bare `u32` op codes
//! (see the core and manager crates). All traffic stays on loopback.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::error::{Error, Result};
use crate::wire::{self, Wire, WireReader};

/// Control port both sides agree on. Overridable through configuration; this
/// is only the compiled-in default.
pub const CONTROL_PORT: u16 = 19135;

/// Upper bound on a single frame body. Anything larger is a corrupt or
/// hostile peer.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Manager-to-core op codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServerOp {
    ConnectOk = 0,
    Disconnect = 1,
    Detach = 2,
    Plugin = 3,
    PluginRemove = 4,
    PatchPack = 5,
    PatchPackRemove = 6,
    PatchHook = 7,
    PatchHookRemove = 8,
    PatchLibLoad = 9,
    PatchLibUnload = 10,
    Custom = 11,
}

impl ServerOp {
    pub fn from_wire(op: u32) -> Result<Self> {
        use ServerOp::*;
        Ok(match op {
            0 => ConnectOk,
            1 => Disconnect,
            2 => Detach,
            3 => Plugin,
            4 => PluginRemove,
            5 => PatchPack,
            6 => PatchPackRemove,
            7 => PatchHook,
            8 => PatchHookRemove,
            9 => PatchLibLoad,
            10 => PatchLibUnload,
            11 => Custom,
            other => return Err(Error::protocol(format!("unknown server op code {}", other))),
        })
    }
}

/// Core-to-manager op codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ClientOp {
    Connect = 0,
    Disconnect = 1,
    Ready = 2,
    Log = 3,
    Custom = 4,
}

impl ClientOp {
    pub fn from_wire(op: u32) -> Result<Self> {
        use ClientOp::*;
        Ok(match op {
            0 => Connect,
            1 => Disconnect,
            2 => Ready,
            3 => Log,
            4 => Custom,
            other => return Err(Error::protocol(format!("unknown client op code {}", other))),
        })
    }
}

/// Severity carried by `LOG` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogSeverity {
    Error = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
}

impl LogSeverity {
    pub fn from_wire(value: u32) -> Self {
        match value {
            0 => LogSeverity::Error,
            1 => LogSeverity::Warning,
            2 => LogSeverity::Info,
            _ => LogSeverity::Debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub op: u32,
    pub data: Vec<u8>,
}

pub fn write_frame(stream: &mut impl Write, op: u32, data: &[u8]) -> Result<()> {
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&op.to_le_bytes());
    header[4..].copy_from_slice(&(data.len() as u32).to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(data)?;
    Ok(())
}

pub fn read_frame(stream: &mut impl Read) -> Result<Frame> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header)?;
    let op = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(Error::protocol(format!("oversized frame ({} bytes)", size)));
    }
    let mut data = vec![0u8; size];
    stream.read_exact(&mut data)?;
    Ok(Frame { op, data })
}

/// Bare op code, used during the handshake only.
pub fn write_raw_op(stream: &mut impl Write, op: u32) -> Result<()> {
    stream.write_all(&op.to_le_bytes())?;
    Ok(())
}

pub fn read_raw_op(stream: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Inner envelope of `CUSTOM` frames, the extension point for plugins.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomPacket {
    pub op: u32,
    pub data: Vec<u8>,
}

impl Wire for CustomPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        wire::put_u32(out, self.op);
        wire::put_size(out, self.data.len());
        out.extend_from_slice(&self.data);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let op = r.u32()?;
        let len = r.size()?;
        let data = r.raw(len)?;
        Ok(CustomPacket { op, data })
    }
}

/// Token returned by [`HandlerRegistry::add`]; passing it back removes that
/// one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

type Handler<Ctx> = Arc<dyn Fn(&Ctx, &[u8]) + Send + Sync>;

/// Per-direction dispatch table: op code to the handlers subscribed to it.
/// Overlapping subscriptions compose; each `add` is one independent entry
/// removed by its own token. Dispatch snapshots the handler list under the
/// lock and invokes outside it, so handlers may re-enter the registry.
pub struct HandlerRegistry<Ctx> {
    inner: Mutex<RegistryInner<Ctx>>,
}

struct RegistryInner<Ctx> {
    handlers: HashMap<u32, Vec<(HandlerId, Handler<Ctx>)>>,
    next_id: u64,
}

impl<Ctx> Default for HandlerRegistry<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> HandlerRegistry<Ctx> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                handlers: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    pub fn add(
        &self,
        op: u32,
        handler: impl Fn(&Ctx, &[u8]) + Send + Sync + 'static,
    ) -> HandlerId {
        let mut inner = self.inner.lock().unwrap();
        let id = HandlerId(inner.next_id);
        inner.next_id += 1;
        inner
            .handlers
            .entry(op)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one registration. Removing an unknown token is a logic error.
    pub fn remove(&self, id: HandlerId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for handlers in inner.handlers.values_mut() {
            if let Some(index) = handlers.iter().position(|(hid, _)| *hid == id) {
                handlers.remove(index);
                return Ok(());
            }
        }
        Err(Error::validation("no such receive handler exists"))
    }

    /// Invoke every handler subscribed to `op`, in registration order. A
    /// panicking handler is contained and logged; the rest still run.
    pub fn dispatch(&self, op: u32, ctx: &Ctx, data: &[u8]) {
        let snapshot: Vec<Handler<Ctx>> = {
            let inner = self.inner.lock().unwrap();
            match inner.handlers.get(&op) {
                Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };
        for handler in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(ctx, data))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic".to_string());
                error!(op, "receive handler panicked: {}", message);
            }
        }
    }
}
