//! The manager context: one settings store, one registry, one core
//! connection manager and one codegen driver, wired so every registry
//! mutation recompiles what changed and broadcasts the new state.

use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use mempatch_common::channel::{ServerOp, CONTROL_PORT};
use mempatch_common::error::Result;
use mempatch_common::hook::Hook;
use mempatch_common::patch::PatchPack;
use mempatch_common::wire::{self, Wire};

use crate::codegen::Codegen;
use crate::cores::{CoreId, CoreManager};
use crate::registry::PatchRegistry;
use crate::settings::SettingsStore;

pub struct Manager {
    settings: Mutex<SettingsStore>,
    registry: Mutex<PatchRegistry>,
    cores: CoreManager,
    codegen: Option<Codegen>,
}

fn encode_entity<T: Wire>(entity: &T) -> Vec<u8> {
    let mut data = Vec::with_capacity(1024);
    wire::put_entity(&mut data, entity);
    data
}

fn encode_name(name: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + name.len());
    wire::put_string(&mut data, name);
    data
}

impl Manager {
    pub fn new(settings: SettingsStore) -> Self {
        let codegen = match Codegen::from_settings(&settings) {
            Ok(codegen) => Some(codegen),
            Err(error) => {
                info!("codegen disabled ({}); hook patches will not compile", error);
                None
            }
        };
        Self {
            settings: Mutex::new(settings),
            registry: Mutex::new(PatchRegistry::new()),
            cores: CoreManager::new(),
            codegen,
        }
    }

    pub fn cores(&self) -> &CoreManager {
        &self.cores
    }

    pub fn settings(&self) -> &Mutex<SettingsStore> {
        &self.settings
    }

    pub fn registry(&self) -> &Mutex<PatchRegistry> {
        &self.registry
    }

    /// Launch the target configured in the settings and replay the current
    /// state to its core.
    pub fn launch_target(&self, port: u16) -> Result<CoreId> {
        let (program, arguments, library_path, core_library) = {
            let settings = self.settings.lock().unwrap();
            let library = settings.get("core.library");
            let core_library = if library.is_empty() {
                "libmempatch_core.so".to_string()
            } else {
                format!("lib{}.so", library)
            };
            (
                settings.get("manager.target.program").to_string(),
                settings
                    .get("manager.target.arguments")
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
                settings.get("manager.codegen.library_path").to_string(),
                core_library,
            )
        };
        if program.is_empty() {
            return Err(mempatch_common::Error::validation(
                "manager.target.program is not configured",
            ));
        }

        let core_id = self
            .cores
            .launch(&program, &arguments, &library_path, &core_library, port)?;
        self.sync_core(core_id)?;
        Ok(core_id)
    }

    /// Accept an already-injected core on the configured port.
    pub fn serve_one(&self, port: u16, timeout: Duration) -> Result<CoreId> {
        let listener =
            std::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, port))?;
        let core_library = {
            let settings = self.settings.lock().unwrap();
            let library = settings.get("core.library");
            if library.is_empty() {
                "libmempatch_core.so".to_string()
            } else {
                format!("lib{}.so", library)
            }
        };
        let core_id = self.cores.attach(&listener, None, &core_library, timeout)?;
        self.sync_core(core_id)?;
        Ok(core_id)
    }

    pub fn register_hook(&self, hook: Hook) -> Result<()> {
        self.registry.lock().unwrap().register_hook(hook.clone())?;
        self.compile_and_reload()?;
        self.cores.broadcast(ServerOp::PatchHook, &encode_entity(&hook));
        Ok(())
    }

    pub fn unregister_hook(&self, name: &str) -> Result<()> {
        let removed_packs = self.registry.lock().unwrap().unregister_hook(name)?;
        for pack_name in removed_packs {
            self.cores
                .broadcast(ServerOp::PatchPackRemove, &encode_name(&pack_name));
        }
        self.cores
            .broadcast(ServerOp::PatchHookRemove, &encode_name(name));
        Ok(())
    }

    pub fn add_pack(&self, pack: PatchPack) -> Result<()> {
        let name = pack.info.name.clone();
        let default_enabled = pack.info.default_enabled;
        {
            let mut registry = self.registry.lock().unwrap();
            registry.add_pack(pack)?;
            if default_enabled {
                registry.set_pack_enabled(&name, true)?;
            }
        }
        self.compile_and_reload()?;
        self.broadcast_pack(&name)
    }

    pub fn remove_pack(&self, name: &str) -> Result<()> {
        self.registry.lock().unwrap().remove_pack(name)?;
        self.cores
            .broadcast(ServerOp::PatchPackRemove, &encode_name(name));
        Ok(())
    }

    pub fn set_pack_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.registry.lock().unwrap().set_pack_enabled(name, enabled)?;
        self.broadcast_pack(name)
    }

    pub fn set_extra_setting(&self, pack: &str, label: &str, value: &str) -> Result<()> {
        self.registry
            .lock()
            .unwrap()
            .set_extra_setting(pack, label, value)?;
        self.broadcast_pack(pack)
    }

    fn broadcast_pack(&self, name: &str) -> Result<()> {
        let data = {
            let registry = self.registry.lock().unwrap();
            encode_entity(registry.pack(name)?)
        };
        self.cores.broadcast(ServerOp::PatchPack, &data);
        Ok(())
    }

    /// Replay the full hook/pack state to one core: hooks, then the artifact
    /// (if one was built), then the packs whose callbacks live inside it.
    pub fn sync_core(&self, core_id: CoreId) -> Result<()> {
        let (hook_frames, pack_frames) = {
            let registry = self.registry.lock().unwrap();
            (
                registry.hooks().map(encode_entity).collect::<Vec<_>>(),
                registry.packs().map(encode_entity).collect::<Vec<_>>(),
            )
        };
        for data in hook_frames {
            self.cores.send_to(core_id, ServerOp::PatchHook, &data)?;
        }
        if let Some(codegen) = &self.codegen {
            if codegen.artifact_path().exists() {
                let path = codegen.artifact_path().to_string_lossy().into_owned();
                self.cores
                    .send_to(core_id, ServerOp::PatchLibLoad, &encode_name(&path))?;
            }
        }
        for data in pack_frames {
            self.cores.send_to(core_id, ServerOp::PatchPack, &data)?;
        }
        Ok(())
    }

    /// Recompile every hook and pack unit that changed. When anything did,
    /// the cores drop the old artifact, the objects relink, and the fresh
    /// artifact is announced.
    pub fn compile_and_reload(&self) -> Result<()> {
        let Some(codegen) = &self.codegen else {
            return Ok(());
        };

        let mut settings = self.settings.lock().unwrap();
        let registry = self.registry.lock().unwrap();

        let mut all_skipped = true;
        for hook in registry.hooks() {
            if !codegen.compile_hook(&mut settings, hook, false)? {
                all_skipped = false;
            }
        }
        for pack in registry.packs() {
            if !codegen.compile_pack(&mut settings, pack, false)? {
                all_skipped = false;
            }
        }

        if !all_skipped || !codegen.artifact_path().exists() {
            self.cores.broadcast(ServerOp::PatchLibUnload, &[]);
            codegen.link(false)?;
            let path = codegen.artifact_path().to_string_lossy().into_owned();
            self.cores
                .broadcast(ServerOp::PatchLibLoad, &encode_name(&path));
        }

        if let Err(error) = settings.save() {
            warn!("could not save settings: {}", error);
        }
        Ok(())
    }

    pub fn default_port(&self) -> u16 {
        let settings = self.settings.lock().unwrap();
        settings
            .get("manager.port")
            .parse::<u16>()
            .unwrap_or(CONTROL_PORT)
    }
}
