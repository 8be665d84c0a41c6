//! The kernel context.
//!
//! All global kernel state lives in one [`Kernel`] value: physical memory,
//! the environment table, block caches, devices and the clock. Whoever
//! holds it (see [`Machine`](crate::Machine)) holds the big kernel lock.

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use log::LevelFilter;
use pmm::{AddressSpace, PageEntry, PageFault, PageFlags, PhysicalMemoryManager, VirtualAddress};

use crate::{
    Error,
    bc::{self, BlockCache, CacheError},
    clock::Clock,
    console::Console,
    disk::BlockDevice,
    env::{EnvId, EnvInfo, EnvStatus, EnvTable, EnvType, NENV},
    logging::KernelLog,
    memlayout::{PGSIZE, USTACKTOP, UTEXT, UXSTACKTOP},
    net::NetDevice,
    trap::{FaultRecord, TrapFrame, TrapVector},
};

/// Boot-time kernel parameters.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Frames of physical memory, including the reserved frame 0.
    pub frames: usize,
    /// Environment table slots.
    pub max_envs: usize,
    /// Milliseconds the clock advances per scheduling turn.
    pub tick_ms: u32,
    /// Most verbose level the kernel log records.
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            frames: 1024,
            max_envs: NENV,
            tick_ms: 10,
            log_level: LevelFilter::Info,
        }
    }
}

/// What became of a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The kernel repaired the fault; the access can be retried.
    Resolved,
    /// The environment's upcall must run.
    ///
    /// The record has been pushed on the exception stack and the
    /// environment's frame points at it. `saved` is the frame to resume once
    /// the handler returns.
    Upcall {
        entry: u32,
        record: FaultRecord,
        saved: TrapFrame,
    },
    /// The environment was destroyed.
    Killed,
}

pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) pmm: PhysicalMemoryManager,
    pub(crate) envs: EnvTable,
    pub(crate) caches: BTreeMap<EnvId, BlockCache>,
    pub(crate) console: Console,
    pub(crate) clock: Clock,
    pub(crate) net: Option<Box<dyn NetDevice + Send>>,
    pub(crate) curenv: Option<EnvId>,
    /// Slot of the environment that ran last; the scheduler starts after it.
    pub(crate) last_run: Option<usize>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        KernelLog::init(config.log_level);
        log::info!(
            "kernel: {} frames, {} environment slots",
            config.frames,
            config.max_envs
        );

        Self {
            pmm: PhysicalMemoryManager::new(config.frames),
            envs: EnvTable::new(config.max_envs),
            caches: BTreeMap::new(),
            console: Console::new(),
            clock: Clock::new(),
            net: None,
            curenv: None,
            last_run: None,
            config,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn pmm(&self) -> &PhysicalMemoryManager {
        &self.pmm
    }

    /// Number of free physical frames.
    pub fn free_frames(&self) -> usize {
        self.pmm.free_frames()
    }

    pub fn envs(&self) -> &EnvTable {
        &self.envs
    }

    /// Returns a snapshot of an allocated environment.
    pub fn env_info(&self, envid: EnvId) -> Option<EnvInfo> {
        self.envs.get(envid).map(EnvInfo::from)
    }

    /// The environment currently running, if any.
    pub fn curenv(&self) -> Option<EnvId> {
        self.curenv
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut Console {
        &mut self.console
    }

    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    /// Connects a network card.
    pub fn attach_net(&mut self, device: Box<dyn NetDevice + Send>) {
        log::info!("net: mac {:02x?}", device.mac_address());
        self.net = Some(device);
    }

    /// Creates an environment the way the boot loader does: fresh address
    /// space, one stack page, entry at [`UTEXT`], Runnable.
    pub fn create_env(&mut self, env_type: EnvType) -> Result<EnvId, Error> {
        let envid = self
            .envs
            .alloc(&mut self.pmm, EnvId::CURRENT, TrapFrame::user(UTEXT, USTACKTOP))?;
        self.envs.env_mut(envid).env_type = env_type;

        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
        if let Err(err) = self.insert_new_page(envid, USTACKTOP - PGSIZE, flags, &[]) {
            self.envs.free(&mut self.pmm, envid.index());
            return Err(err);
        }

        log::debug!("created {env_type:?} env {envid}");
        Ok(envid)
    }

    /// Maps a fresh zeroed page holding `contents` at `va`.
    ///
    /// The frame is released again if the mapping cannot be made.
    pub(crate) fn insert_new_page(
        &mut self,
        envid: EnvId,
        va: u32,
        flags: PageFlags,
        contents: &[u8],
    ) -> Result<(), Error> {
        let frame = self.pmm.allocate(true)?;
        self.pmm.frame_bytes_mut(frame)[..contents.len()].copy_from_slice(contents);

        let pgdir = self.envs.env(envid).pgdir();
        if let Err(err) = pgdir.insert(&mut self.pmm, VirtualAddress::new(va as usize), frame, flags) {
            let _ = self.pmm.deallocate(frame);
            return Err(err.into());
        }
        Ok(())
    }

    /// Marks an environment as dying.
    pub fn destroy_env(&mut self, envid: EnvId) {
        if self.envs.get(envid).is_some_and(|env| env.is_live()) {
            self.envs.destroy(envid);
        }
    }

    /// Returns the MMU view of an environment's address space.
    ///
    /// # Panics
    /// Panics if `envid` is stale.
    pub fn address_space(&mut self, envid: EnvId) -> AddressSpace<'_> {
        let pgdir = self.envs.env(envid).pgdir();
        AddressSpace::new(&mut self.pmm, pgdir)
    }

    /// Returns the leaf entry mapping `va` in an environment, if present.
    pub fn pte(&self, envid: EnvId, va: u32) -> Option<PageEntry> {
        let env = self.envs.get(envid)?;
        env.pgdir
            .and_then(|pgdir| pgdir.entry(&self.pmm, VirtualAddress::new(va as usize)))
            .filter(|entry| entry.is_present())
    }

    /// Returns every present user mapping of an environment in `[start, end)`.
    pub fn mapped_pages(&self, envid: EnvId, start: u32, end: u32) -> Vec<(u32, PageFlags)> {
        let Some(pgdir) = self.envs.get(envid).and_then(|env| env.pgdir) else {
            return Vec::new();
        };
        pgdir
            .mapped_pages(
                &self.pmm,
                VirtualAddress::new(start as usize),
                VirtualAddress::new(end as usize),
            )
            .into_iter()
            .map(|(va, entry)| (va.as_u32(), entry.flags()))
            .collect()
    }

    /// Checks that an environment may access `[va, va + len)` with `perm`,
    /// destroying it if not.
    pub(crate) fn user_mem_assert(
        &mut self,
        envid: EnvId,
        va: u32,
        len: usize,
        perm: PageFlags,
    ) -> Result<(), Error> {
        let checked = self
            .address_space(envid)
            .check(VirtualAddress::new(va as usize), len, perm);
        if let Err(bad) = checked {
            log::warn!("[{envid}] user_mem_check assertion failure for va {bad}");
            self.destroy_env(envid);
            return Err(Error::Fault);
        }
        Ok(())
    }

    /// Gives an environment a block cache over `disk` and brings it up.
    pub fn attach_block_cache(
        &mut self,
        envid: EnvId,
        disk: Box<dyn BlockDevice + Send>,
    ) -> Result<(), CacheError> {
        let pgdir = self.envs.env(envid).pgdir();
        let mut cache = BlockCache::new(disk);
        cache.init(&mut self.pmm, pgdir)?;
        self.caches.insert(envid, cache);
        Ok(())
    }

    pub fn block_cache(&self, envid: EnvId) -> Option<&BlockCache> {
        self.caches.get(&envid)
    }

    /// Writes a dirty block of an environment's cache back to disk.
    ///
    /// Environments without a cache have nothing to flush.
    pub fn flush_block(&mut self, envid: EnvId, va: u32) -> Result<(), CacheError> {
        let Some(cache) = self.caches.get_mut(&envid) else {
            return Ok(());
        };
        let pgdir = self.envs.env(envid).pgdir();
        cache.flush_block(&mut self.pmm, pgdir, va)
    }

    /// Handles a page fault raised by an environment.
    ///
    /// # Panics
    /// Panics if the environment's block cache fails, since the cache's
    /// state can no longer be trusted.
    pub fn page_fault(&mut self, envid: EnvId, fault: PageFault) -> FaultOutcome {
        let va = fault.address.as_u32();
        let err = fault.code.bits();
        let env = self.envs.env_mut(envid);
        env.tf.trapno = TrapVector::PAGE_FAULT.value();
        env.tf.err = err;
        let pgdir = env.pgdir();
        let tf = env.tf;
        let entry = env.pgfault_upcall;

        if bc::in_window(va)
            && let Some(cache) = self.caches.get_mut(&envid)
        {
            if let Err(err) = cache.handle_fault(&mut self.pmm, pgdir, va) {
                panic!("[{envid}] block cache: {err} (eip {:08x})", tf.eip);
            }
            return FaultOutcome::Resolved;
        }

        if entry == 0 {
            log::warn!("[{envid}] user fault va {va:08x} ip {:08x}", tf.eip);
            self.destroy_env(envid);
            return FaultOutcome::Killed;
        }

        // A fault taken on the exception stack keeps one scratch word
        // between the interrupted frame and the new record.
        let record_size = FaultRecord::SIZE as u32;
        let (record_va, len) = if tf.on_exception_stack() {
            (tf.esp.wrapping_sub(4 + record_size), FaultRecord::SIZE + 4)
        } else {
            (UXSTACKTOP - record_size, FaultRecord::SIZE)
        };
        if self
            .user_mem_assert(envid, record_va, len, PageFlags::WRITABLE)
            .is_err()
        {
            return FaultOutcome::Killed;
        }

        let record = FaultRecord::new(va, err, &tf);
        let mut bytes = [0u8; FaultRecord::SIZE + 4];
        bytes[..FaultRecord::SIZE].copy_from_slice(&record.to_bytes());
        let written = self
            .address_space(envid)
            .write(VirtualAddress::new(record_va as usize), &bytes[..len]);
        if written.is_err() {
            self.destroy_env(envid);
            return FaultOutcome::Killed;
        }

        let env = self.envs.env_mut(envid);
        env.tf.eip = entry;
        env.tf.esp = record_va;
        log::trace!("[{envid}] upcall {entry:08x}: {record}");
        FaultOutcome::Upcall {
            entry,
            record,
            saved: tf,
        }
    }

    /// Returns an environment to the state it faulted in once its upcall
    /// has repaired the fault.
    pub fn resume_after_upcall(&mut self, envid: EnvId, saved: TrapFrame) {
        if let Some(env) = self.envs.get_mut(envid)
            && env.is_live()
        {
            env.tf = saved;
        }
    }

    /// Network card interrupt: makes every environment waiting for a
    /// packet runnable again.
    ///
    /// Returns how many environments were woken.
    pub fn net_interrupt(&mut self) -> usize {
        let mut woken = 0;
        for env in self.envs.iter_mut().filter(|env| env.net_blocked) {
            env.net_blocked = false;
            if env.status == EnvStatus::NotRunnable {
                env.status = EnvStatus::Runnable;
                woken += 1;
            }
        }
        if woken > 0 {
            log::debug!("net: woke {woken} env(s)");
        }
        woken
    }
}
