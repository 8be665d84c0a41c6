//! The emulated machine: a kernel plus the user programs it runs.
//!
//! User programs are Rust objects implementing [`Program`]. Each scheduling
//! turn calls [`Program::run`] once with a [`UserCx`], the program's only
//! window onto the machine: memory accesses go through the software MMU and
//! privileged work goes through numbered system calls. A turn ends when
//! `run` returns; a program that yielded or blocked should return promptly,
//! since every further system call in that turn fails.
//!
//! The kernel sits behind one lock, taken for each system call or fault and
//! released while user code (fault handlers included) runs.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use pmm::{AddressSpace, PageEntry, PageFault, PageFlags, VirtualAddress};
use spin::{Mutex, MutexGuard};

use crate::{
    Error,
    bc::{BlockCache, CacheError},
    env::{EnvId, EnvInfo, EnvStatus, EnvType},
    kernel::{FaultOutcome, Kernel, KernelConfig},
    memlayout::{PGSIZE, USTACKTOP, UTEXT, UXSTACKTOP},
    syscall::Syscall,
    trap::FaultRecord,
    user,
};

/// A user-mode page fault handler.
pub type FaultHandler = Arc<dyn Fn(&mut UserCx<'_>, &FaultRecord) -> Result<(), Error> + Send + Sync>;

/// Entry address of the copy-on-write fault handler.
pub const COW_UPCALL: u32 = UTEXT;

/// Spacing of handler entry addresses in the text table.
const ENTRY_STRIDE: u32 = 16;

/// Repeated faults at one address an access may take before the environment is killed.
const MAX_FAULT_RETRIES: usize = 8;

/// Size of the print buffer at the bottom of the user stack.
const PRINTBUF: usize = 256;

/// A user program.
pub trait Program: Send {
    /// Runs one scheduling turn.
    fn run(&mut self, cx: &mut UserCx<'_>);
}

impl<F> Program for F
where
    F: FnMut(&mut UserCx<'_>) + Send,
{
    fn run(&mut self, cx: &mut UserCx<'_>) {
        self(cx)
    }
}

pub struct Machine {
    kernel: Mutex<Kernel>,
    programs: Mutex<BTreeMap<EnvId, Box<dyn Program>>>,
    /// Fault handler "code", keyed by entry address.
    text: Mutex<BTreeMap<u32, FaultHandler>>,
    next_entry: AtomicU32,
}

impl Machine {
    pub fn new(config: KernelConfig) -> Self {
        let cow: FaultHandler = Arc::new(user::fork::cow_fault);
        let mut text = BTreeMap::new();
        text.insert(COW_UPCALL, cow);

        Self {
            kernel: Mutex::new(Kernel::new(config)),
            programs: Mutex::new(BTreeMap::new()),
            text: Mutex::new(text),
            next_entry: AtomicU32::new(COW_UPCALL + ENTRY_STRIDE),
        }
    }

    /// Takes the big kernel lock.
    pub fn kernel(&self) -> MutexGuard<'_, Kernel> {
        self.kernel.lock()
    }

    /// Creates an environment running `program`.
    pub fn spawn(&self, env_type: EnvType, program: impl Program + 'static) -> Result<EnvId, Error> {
        let envid = self.kernel.lock().create_env(env_type)?;
        self.load(envid, Box::new(program));
        Ok(envid)
    }

    /// Installs the program image an environment runs.
    pub fn load(&self, envid: EnvId, program: Box<dyn Program>) {
        self.programs.lock().insert(envid, program);
    }

    /// Places a fault handler in the text table and returns its entry address.
    pub fn register_handler(&self, handler: FaultHandler) -> u32 {
        let entry = self.next_entry.fetch_add(ENTRY_STRIDE, Ordering::Relaxed);
        self.text.lock().insert(entry, handler);
        entry
    }

    /// Runs one scheduling turn.
    ///
    /// Returns the environment that ran, or None if nothing was runnable.
    pub fn step(&self) -> Option<EnvId> {
        let envid = self.kernel.lock().schedule()?;
        let program = self.programs.lock().remove(&envid);

        let live = match program {
            Some(mut program) => {
                let mut cx = UserCx::new(self, envid);
                program.run(&mut cx);
                let live = self.kernel.lock().end_turn(envid);
                if live {
                    self.programs.lock().insert(envid, program);
                }
                live
            }
            None => {
                log::warn!("[{envid}] has no program image");
                let mut kernel = self.kernel.lock();
                kernel.destroy_env(envid);
                kernel.end_turn(envid)
            }
        };

        if !live {
            self.prune();
        }
        Some(envid)
    }

    /// Runs until nothing is runnable or `max_turns` turns have passed.
    ///
    /// Returns the number of turns run.
    pub fn run(&self, max_turns: usize) -> usize {
        let mut turns = 0;
        while turns < max_turns && self.step().is_some() {
            turns += 1;
        }
        turns
    }

    /// Drops the images of environments that are no longer alive.
    fn prune(&self) {
        let kernel = self.kernel.lock();
        self.programs
            .lock()
            .retain(|envid, _| kernel.envs().get(*envid).is_some_and(|env| env.is_live()));
    }

    fn handler(&self, entry: u32) -> Option<FaultHandler> {
        self.text.lock().get(&entry).cloned()
    }
}

/// A user program's view of the machine during one turn.
pub struct UserCx<'m> {
    machine: &'m Machine,
    env: EnvId,
    suspended: bool,
    killed: bool,
}

impl<'m> UserCx<'m> {
    fn new(machine: &'m Machine, env: EnvId) -> Self {
        Self {
            machine,
            env,
            suspended: false,
            killed: false,
        }
    }

    /// The running environment's id.
    pub fn env_id(&self) -> EnvId {
        self.env
    }

    pub fn machine(&self) -> &'m Machine {
        self.machine
    }

    /// Whether the environment gave up the rest of its turn.
    pub fn suspended(&self) -> bool {
        self.suspended
    }

    /// Whether the environment has been destroyed.
    pub fn killed(&self) -> bool {
        self.killed
    }

    /// Whether the turn is over, for either reason.
    pub fn turn_over(&self) -> bool {
        self.suspended || self.killed
    }

    /// The value of `eax` in the saved frame.
    ///
    /// A child created by `exofork` sees 0 here on its first turn.
    pub fn syscall_return(&self) -> u32 {
        self.machine
            .kernel
            .lock()
            .envs()
            .get(self.env)
            .map_or(0, |env| env.tf.regs.eax)
    }

    /// Makes a raw system call.
    pub fn syscall(&mut self, number: u32, args: [u32; 5]) -> i32 {
        if self.turn_over() {
            log::warn!("[{}] syscall {number} after its turn ended", self.env);
            return Error::Unspecified.code();
        }

        let mut kernel = self.machine.kernel.lock();
        let ret = kernel.syscall(self.env, number, args);
        match kernel.envs().get(self.env).map(|env| env.status) {
            Some(EnvStatus::Running) => {}
            Some(EnvStatus::Runnable | EnvStatus::NotRunnable) => self.suspended = true,
            _ => self.killed = true,
        }
        ret
    }

    fn call(&mut self, call: Syscall, args: [u32; 5]) -> Result<u32, Error> {
        Error::check(self.syscall(call.into(), args))
    }

    /// Reads user memory at `va`, taking page faults as the hardware would.
    pub fn read(&mut self, va: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.access(|space| space.read(VirtualAddress::new(va as usize), buf))
    }

    /// Writes user memory at `va`, taking page faults as the hardware would.
    pub fn write(&mut self, va: u32, data: &[u8]) -> Result<(), Error> {
        self.access(|space| space.write(VirtualAddress::new(va as usize), data))
    }

    pub fn read_u32(&mut self, va: u32) -> Result<u32, Error> {
        let mut bytes = [0u8; 4];
        self.read(va, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn write_u32(&mut self, va: u32, value: u32) -> Result<(), Error> {
        self.write(va, &value.to_le_bytes())
    }

    /// Runs `op`, delivering each fault it raises and retrying.
    ///
    /// Faults on different pages are progress. The environment is killed
    /// only when the same address keeps faulting.
    fn access(
        &mut self,
        mut op: impl FnMut(&mut AddressSpace<'_>) -> Result<(), PageFault>,
    ) -> Result<(), Error> {
        let mut last = None;
        let mut repeats = 0;
        loop {
            if self.killed {
                return Err(Error::Fault);
            }
            let fault = {
                let mut kernel = self.machine.kernel.lock();
                match op(&mut kernel.address_space(self.env)) {
                    Ok(()) => return Ok(()),
                    Err(fault) => fault,
                }
            };

            if last == Some(fault.address) {
                repeats += 1;
                if repeats >= MAX_FAULT_RETRIES {
                    log::warn!("[{}] access keeps faulting at {}", self.env, fault.address);
                    self.kill();
                    return Err(Error::Fault);
                }
            } else {
                last = Some(fault.address);
                repeats = 0;
            }
            if !self.deliver(fault) {
                return Err(Error::Fault);
            }
        }
    }

    /// Hands a fault to the kernel and runs the upcall it asks for.
    ///
    /// Returns whether the access can be retried.
    fn deliver(&mut self, fault: PageFault) -> bool {
        let outcome = self.machine.kernel.lock().page_fault(self.env, fault);
        match outcome {
            FaultOutcome::Resolved => true,
            FaultOutcome::Killed => {
                self.killed = true;
                false
            }
            FaultOutcome::Upcall {
                entry,
                record,
                saved,
            } => {
                let Some(handler) = self.machine.handler(entry) else {
                    log::warn!("[{}] page fault upcall {entry:08x} is not code", self.env);
                    self.kill();
                    return false;
                };
                if let Err(err) = handler(self, &record) {
                    log::warn!("[{}] fault handler failed: {err} ({record})", self.env);
                    self.kill();
                    return false;
                }
                if self.killed {
                    return false;
                }
                self.machine.kernel.lock().resume_after_upcall(self.env, saved);
                true
            }
        }
    }

    fn kill(&mut self) {
        self.machine.kernel.lock().destroy_env(self.env);
        self.killed = true;
    }

    /// Returns the page table entry mapping `va`, if present.
    pub fn pte(&self, va: u32) -> Option<PageEntry> {
        self.machine.kernel.lock().pte(self.env, va)
    }

    /// Returns every present mapping in `[start, end)`.
    pub fn mapped_pages(&self, start: u32, end: u32) -> Vec<(u32, PageFlags)> {
        self.machine.kernel.lock().mapped_pages(self.env, start, end)
    }

    /// Returns an environment record; `EnvId::CURRENT` is this environment.
    pub fn env(&self, envid: EnvId) -> Option<EnvInfo> {
        let envid = if envid == EnvId::CURRENT { self.env } else { envid };
        self.machine.kernel.lock().env_info(envid)
    }

    /// Returns every allocated environment record.
    pub fn envs(&self) -> Vec<EnvInfo> {
        let kernel = self.machine.kernel.lock();
        kernel
            .envs()
            .iter()
            .filter(|env| env.status != EnvStatus::Free)
            .map(EnvInfo::from)
            .collect()
    }

    /// Installs `entry` as this environment's fault upcall, first giving it
    /// an exception stack if it has none.
    pub fn install_upcall(&mut self, entry: u32) -> Result<(), Error> {
        if self.pte(UXSTACKTOP - PGSIZE).is_none() {
            let perm = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
            self.sys_page_alloc(EnvId::CURRENT, UXSTACKTOP - PGSIZE, perm)?;
        }
        self.sys_env_set_pgfault_upcall(EnvId::CURRENT, entry)
    }

    /// Registers `handler` and makes it this environment's fault upcall.
    pub fn set_pgfault_handler(&mut self, handler: FaultHandler) -> Result<u32, Error> {
        let entry = self.machine.register_handler(handler);
        self.install_upcall(entry)?;
        Ok(entry)
    }

    /// Prints text through a buffer at the bottom of the user stack.
    pub fn print(&mut self, text: &str) -> Result<(), Error> {
        let buf = USTACKTOP - PGSIZE;
        for chunk in text.as_bytes().chunks(PRINTBUF) {
            self.write(buf, chunk)?;
            self.sys_cputs(buf, chunk.len())?;
        }
        Ok(())
    }

    /// Returns the window address of a block of this environment's cache.
    pub fn diskaddr(&self, blockno: u32) -> Result<u32, CacheError> {
        let kernel = self.machine.kernel.lock();
        let cache = kernel
            .block_cache(self.env)
            .ok_or(CacheError::BadBlock(blockno))?;
        cache.diskaddr(blockno)
    }

    /// Writes a dirty cached block back to disk.
    pub fn flush_block(&mut self, va: u32) -> Result<(), CacheError> {
        self.machine.kernel.lock().flush_block(self.env, va)
    }

    pub fn va_is_mapped(&self, va: u32) -> bool {
        self.pte(va).is_some()
    }

    pub fn va_is_dirty(&self, va: u32) -> bool {
        self.pte(va)
            .is_some_and(|pte| pte.flags().contains(PageFlags::DIRTY))
    }

    /// The superblock block count of this environment's cache.
    pub fn disk_blocks(&self) -> Option<u32> {
        let kernel = self.machine.kernel.lock();
        kernel
            .block_cache(self.env)
            .and_then(BlockCache::superblock)
            .map(|sb| sb.nblocks)
    }

    pub fn sys_cputs(&mut self, va: u32, len: usize) -> Result<(), Error> {
        self.call(Syscall::Cputs, [va, len as u32, 0, 0, 0])
            .map(drop)
    }

    pub fn sys_cgetc(&mut self) -> u8 {
        self.call(Syscall::Cgetc, [0; 5]).map_or(0, |c| c as u8)
    }

    pub fn sys_getenvid(&mut self) -> Result<EnvId, Error> {
        self.call(Syscall::GetEnvId, [0; 5]).map(EnvId::from_raw)
    }

    pub fn sys_env_destroy(&mut self, envid: EnvId) -> Result<(), Error> {
        self.call(Syscall::EnvDestroy, [envid.as_u32(), 0, 0, 0, 0])
            .map(drop)
    }

    /// Destroys this environment.
    pub fn exit(&mut self) {
        let _ = self.sys_env_destroy(EnvId::CURRENT);
    }

    pub fn sys_page_alloc(&mut self, envid: EnvId, va: u32, perm: PageFlags) -> Result<(), Error> {
        self.call(Syscall::PageAlloc, [envid.as_u32(), va, perm.bits(), 0, 0])
            .map(drop)
    }

    pub fn sys_page_map(
        &mut self,
        srcenv: EnvId,
        srcva: u32,
        dstenv: EnvId,
        dstva: u32,
        perm: PageFlags,
    ) -> Result<(), Error> {
        let args = [srcenv.as_u32(), srcva, dstenv.as_u32(), dstva, perm.bits()];
        self.call(Syscall::PageMap, args).map(drop)
    }

    pub fn sys_page_unmap(&mut self, envid: EnvId, va: u32) -> Result<(), Error> {
        self.call(Syscall::PageUnmap, [envid.as_u32(), va, 0, 0, 0])
            .map(drop)
    }

    pub fn sys_exofork(&mut self) -> Result<EnvId, Error> {
        self.call(Syscall::Exofork, [0; 5]).map(EnvId::from_raw)
    }

    pub fn sys_env_set_status(&mut self, envid: EnvId, status: EnvStatus) -> Result<(), Error> {
        self.call(Syscall::EnvSetStatus, [envid.as_u32(), status.into(), 0, 0, 0])
            .map(drop)
    }

    pub fn sys_env_set_trapframe(&mut self, envid: EnvId, va: u32) -> Result<(), Error> {
        self.call(Syscall::EnvSetTrapframe, [envid.as_u32(), va, 0, 0, 0])
            .map(drop)
    }

    pub fn sys_env_set_pgfault_upcall(&mut self, envid: EnvId, entry: u32) -> Result<(), Error> {
        self.call(Syscall::EnvSetPgfaultUpcall, [envid.as_u32(), entry, 0, 0, 0])
            .map(drop)
    }

    pub fn sys_yield(&mut self) {
        let _ = self.call(Syscall::Yield, [0; 5]);
    }

    pub fn sys_ipc_try_send(
        &mut self,
        envid: EnvId,
        value: u32,
        srcva: u32,
        perm: PageFlags,
    ) -> Result<(), Error> {
        self.call(Syscall::IpcTrySend, [envid.as_u32(), value, srcva, perm.bits(), 0])
            .map(drop)
    }

    pub fn sys_ipc_recv(&mut self, dstva: u32) -> Result<(), Error> {
        self.call(Syscall::IpcRecv, [dstva, 0, 0, 0, 0]).map(drop)
    }

    pub fn sys_time_msec(&mut self) -> u32 {
        self.call(Syscall::TimeMsec, [0; 5]).unwrap_or(0)
    }

    pub fn sys_set_priority(&mut self, priority: i32) -> Result<(), Error> {
        self.call(Syscall::SetPriority, [priority as u32, 0, 0, 0, 0])
            .map(drop)
    }

    pub fn sys_get_mac_address(&mut self, va: u32) -> Result<(), Error> {
        self.call(Syscall::GetMacAddress, [va, 0, 0, 0, 0]).map(drop)
    }

    pub fn sys_net_transmit(&mut self, va: u32, len: usize) -> Result<(), Error> {
        self.call(Syscall::NetTransmit, [va, len as u32, 0, 0, 0])
            .map(drop)
    }

    /// Receives a packet into a fresh page at `va`.
    ///
    /// Returns None if the environment blocked waiting for one.
    pub fn sys_net_receive(&mut self, va: u32) -> Result<Option<usize>, Error> {
        let len = self.call(Syscall::NetReceive, [va, 0, 0, 0, 0])?;
        Ok((!self.suspended).then_some(len as usize))
    }
}

/// Copies a whole user page into a host buffer.
pub(crate) fn read_page(cx: &mut UserCx<'_>, va: u32) -> Result<Vec<u8>, Error> {
    let mut page = vec![0u8; PGSIZE as usize];
    cx.read(va, &mut page)?;
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{disk::MemDisk, net::Loopback};

    fn machine() -> Machine {
        Machine::new(KernelConfig {
            frames: 256,
            max_envs: 16,
            ..KernelConfig::default()
        })
    }

    const HEAP: u32 = 0x0050_0000;

    fn puw() -> PageFlags {
        PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE
    }

    #[test]
    fn programs_print_and_exit() {
        let m = machine();
        let env = m
            .spawn(EnvType::User, |cx: &mut UserCx<'_>| {
                cx.print("hello, world\n").unwrap();
                cx.exit();
            })
            .unwrap();

        assert_eq!(m.run(10), 1);
        assert_eq!(m.kernel().console().output(), "hello, world\n");
        assert!(m.kernel().env_info(env).is_none());
    }

    #[test]
    fn preempted_programs_run_again() {
        let m = machine();
        let mut turns = 0;
        m.spawn(EnvType::User, move |cx: &mut UserCx<'_>| {
            turns += 1;
            if turns == 3 {
                cx.exit();
            }
        })
        .unwrap();

        assert_eq!(m.run(10), 3);
    }

    #[test]
    fn syscalls_after_yield_fail() {
        let m = machine();
        let env = m
            .spawn(EnvType::User, |cx: &mut UserCx<'_>| {
                cx.sys_yield();
                assert!(cx.suspended());
                assert_eq!(cx.sys_getenvid(), Err(Error::Unspecified));
            })
            .unwrap();
        m.step();
        assert_eq!(m.kernel().env_info(env).unwrap().status, EnvStatus::Runnable);
    }

    #[test]
    fn unhandled_fault_kills() {
        let m = machine();
        let env = m
            .spawn(EnvType::User, |cx: &mut UserCx<'_>| {
                assert_eq!(cx.read_u32(0x1234), Err(Error::Fault));
                assert!(cx.killed());
            })
            .unwrap();
        m.step();
        assert!(m.step().is_none());
        assert!(m.kernel().env_info(env).is_none());
    }

    #[test]
    fn registered_handler_repairs_faults() {
        let m = machine();
        m.spawn(EnvType::User, |cx: &mut UserCx<'_>| {
            let handler: FaultHandler = Arc::new(|cx: &mut UserCx<'_>, record: &FaultRecord| {
                let page = record.fault_va & !(PGSIZE - 1);
                cx.sys_page_alloc(EnvId::CURRENT, page, puw())?;
                cx.write_u32(page, 0x600D)
            });
            cx.set_pgfault_handler(handler).unwrap();

            assert_eq!(cx.read_u32(HEAP), Ok(0x600D));
            assert_eq!(cx.env(EnvId::CURRENT).unwrap().status, EnvStatus::Running);
            cx.exit();
        })
        .unwrap();
        m.run(5);
    }

    #[test]
    fn failing_handler_kills() {
        let m = machine();
        let env = m
            .spawn(EnvType::User, |cx: &mut UserCx<'_>| {
                let handler: FaultHandler =
                    Arc::new(|_: &mut UserCx<'_>, _: &FaultRecord| Err(Error::Fault));
                cx.set_pgfault_handler(handler).unwrap();
                assert!(cx.write_u32(HEAP, 1).is_err());
            })
            .unwrap();
        m.run(5);
        assert!(m.kernel().env_info(env).is_none());
    }

    #[test]
    fn upcall_to_unknown_address_kills() {
        let m = machine();
        let env = m
            .spawn(EnvType::User, |cx: &mut UserCx<'_>| {
                cx.install_upcall(0x00DE_AD00).unwrap();
                assert!(cx.read_u32(HEAP).is_err());
            })
            .unwrap();
        m.run(5);
        assert!(m.kernel().env_info(env).is_none());
    }

    #[test]
    fn block_cache_through_user_accesses() {
        let m = machine();
        let disk = MemDisk::format(32);
        disk.allocate_block(7);
        let check = disk.clone();
        let env = m
            .spawn(EnvType::FileServer, |cx: &mut UserCx<'_>| {
                let va = cx.diskaddr(7).unwrap();
                assert!(!cx.va_is_mapped(va));
                assert_eq!(cx.read_u32(va), Ok(0));
                assert!(cx.va_is_mapped(va) && !cx.va_is_dirty(va));

                cx.write(va + 8, b"block seven").unwrap();
                assert!(cx.va_is_dirty(va));
                cx.flush_block(va).unwrap();
                assert!(!cx.va_is_dirty(va));
                assert_eq!(cx.disk_blocks(), Some(32));
                cx.exit();
            })
            .unwrap();
        m.kernel()
            .attach_block_cache(env, Box::new(disk))
            .unwrap();

        m.run(5);
        assert_eq!(&check.block(7)[8..19], b"block seven");
        assert!(m.kernel().block_cache(env).is_none());
    }

    #[test]
    fn one_access_across_many_blocks() {
        let m = machine();
        let disk = MemDisk::format(64);
        for blockno in 10..20 {
            disk.allocate_block(blockno);
        }
        let check = disk.clone();
        let env = m
            .spawn(EnvType::FileServer, |cx: &mut UserCx<'_>| {
                let va = cx.diskaddr(10).unwrap();
                let mut back = vec![0u8; 10 * PGSIZE as usize];
                assert_eq!(cx.read(va, &mut back), Ok(()));
                assert!(back.iter().all(|&b| b == 0));

                let data: Vec<u8> = (0..back.len())
                    .map(|i| (i / PGSIZE as usize) as u8 + 1)
                    .collect();
                assert_eq!(cx.write(va, &data), Ok(()));
                for blockno in 10..20 {
                    let va = cx.diskaddr(blockno).unwrap();
                    cx.flush_block(va).unwrap();
                }
                assert!(!cx.killed());
                cx.exit();
            })
            .unwrap();
        m.kernel()
            .attach_block_cache(env, Box::new(disk))
            .unwrap();

        m.run(5);
        for blockno in 10..20 {
            let expected = (blockno - 10) as u8 + 1;
            assert!(check.block(blockno).iter().all(|&b| b == expected));
        }
    }

    #[test]
    fn handler_that_repairs_nothing_kills() {
        let m = machine();
        let env = m
            .spawn(EnvType::User, |cx: &mut UserCx<'_>| {
                let handler: FaultHandler = Arc::new(|_: &mut UserCx<'_>, _: &FaultRecord| Ok(()));
                cx.set_pgfault_handler(handler).unwrap();
                assert_eq!(cx.read_u32(HEAP), Err(Error::Fault));
                assert!(cx.killed());
            })
            .unwrap();
        m.run(5);
        assert!(m.kernel().env_info(env).is_none());
    }

    #[test]
    fn network_wait_and_wakeup() {
        let m = machine();
        let card = Loopback::default();
        m.kernel().attach_net(Box::new(card.clone()));
        const RX: u32 = 0x0090_0000;
        let env = m
            .spawn(EnvType::NetServer, |cx: &mut UserCx<'_>| {
                match cx.sys_net_receive(RX).unwrap() {
                    None => assert!(cx.suspended()),
                    Some(len) => {
                        assert_eq!(cx.read_u32(RX), Ok(len as u32));
                        let mut data = vec![0u8; len];
                        cx.read(RX + 4, &mut data).unwrap();
                        assert_eq!(data, b"arp?");
                        cx.exit();
                    }
                }
            })
            .unwrap();

        assert_eq!(m.step(), Some(env));
        assert_eq!(m.step(), None);
        assert_eq!(m.kernel().env_info(env).unwrap().status, EnvStatus::NotRunnable);

        card.inject(b"arp?");
        assert_eq!(m.kernel().net_interrupt(), 1);
        assert_eq!(m.run(5), 1);
        assert!(m.kernel().env_info(env).is_none());
    }
}
