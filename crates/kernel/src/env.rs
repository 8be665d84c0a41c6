//! Environments: the unit of isolation and scheduling.
//!
//! Every environment owns a page directory, a saved trap frame and the
//! bookkeeping for fault upcalls and IPC. Environment ids carry a
//! generation so that a stale id never names the slot's next occupant.

use core::fmt;

use alloc::vec::Vec;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use pmm::{PageDirectory, PageFlags, PhysicalMemoryManager};

use crate::{Error, trap::TrapFrame};

/// Maximum number of environment slots; the slot index lives in the low bits of an id.
pub const NENV: usize = 1 << LOG2NENV;
const LOG2NENV: u32 = 10;
const ENVGENSHIFT: u32 = 12;

/// An environment id: `generation | slot index`.
///
/// Id 0 is never assigned and means "the calling environment" in system
/// calls.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(u32);

impl EnvId {
    /// The id that refers to the calling environment.
    pub const CURRENT: Self = Self(0);

    /// Wraps a raw id.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the slot index encoded in the id.
    pub const fn index(self) -> usize {
        self.0 as usize & (NENV - 1)
    }

    /// Returns the id for the next occupant of this id's slot.
    fn next_generation(self, index: usize) -> Self {
        let mut generation = self.0.wrapping_add(1 << ENVGENSHIFT) & !(NENV as u32 - 1);
        if generation as i32 <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        Self(generation | index as u32)
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Environment status, numbered as user code sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    Running = 3,
    NotRunnable = 4,
}

/// What an environment is for; lets programs find well-known servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EnvType {
    User = 0,
    FileServer = 1,
    NetServer = 2,
}

/// Per-environment IPC state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpcState {
    /// Blocked in `ipc_recv` and waiting for a sender.
    pub recving: bool,
    /// Where a transferred page should be mapped; at or above `UTOP` means none.
    pub dstva: u32,
    /// Sender of the last delivered message.
    pub from: EnvId,
    /// Value of the last delivered message.
    pub value: u32,
    /// Permissions of the transferred page, empty if none was transferred.
    pub perm: PageFlags,
}

/// One slot of the environment table.
#[derive(Debug)]
pub struct Env {
    pub id: EnvId,
    pub parent: EnvId,
    pub env_type: EnvType,
    pub status: EnvStatus,
    pub tf: TrapFrame,
    /// `None` only while the slot is free.
    pub pgdir: Option<PageDirectory>,
    /// Entry address of the page fault upcall, 0 if none.
    pub pgfault_upcall: u32,
    pub priority: i32,
    pub runs: u32,
    pub ipc: IpcState,
    /// Blocked waiting for an inbound packet.
    pub net_blocked: bool,
}

impl Env {
    fn free_slot() -> Self {
        Self {
            id: EnvId::CURRENT,
            parent: EnvId::CURRENT,
            env_type: EnvType::User,
            status: EnvStatus::Free,
            tf: TrapFrame::default(),
            pgdir: None,
            pgfault_upcall: 0,
            priority: 0,
            runs: 0,
            ipc: IpcState::default(),
            net_blocked: false,
        }
    }

    /// Returns whether the environment is allocated and not yet dying.
    pub fn is_live(&self) -> bool {
        !matches!(self.status, EnvStatus::Free | EnvStatus::Dying)
    }

    /// Returns the environment's page directory.
    ///
    /// # Panics
    /// Panics if called on a free slot.
    pub fn pgdir(&self) -> PageDirectory {
        self.pgdir
            .unwrap_or_else(|| panic!("env {} has no page directory", self.id))
    }
}

/// A read-only view of an environment record, as exposed to user programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    pub id: EnvId,
    pub parent: EnvId,
    pub env_type: EnvType,
    pub status: EnvStatus,
    pub pgfault_upcall: u32,
    pub priority: i32,
    pub runs: u32,
    pub ipc: IpcState,
}

impl From<&Env> for EnvInfo {
    fn from(env: &Env) -> Self {
        Self {
            id: env.id,
            parent: env.parent,
            env_type: env.env_type,
            status: env.status,
            pgfault_upcall: env.pgfault_upcall,
            priority: env.priority,
            runs: env.runs,
            ipc: env.ipc,
        }
    }
}

/// The environment table.
pub struct EnvTable {
    envs: Vec<Env>,
}

impl EnvTable {
    /// Creates a table with `slots` free environments.
    ///
    /// # Panics
    /// Panics if `slots` is zero or exceeds [`NENV`].
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0 && slots <= NENV, "environment count out of range");
        let mut envs = Vec::with_capacity(slots);
        envs.resize_with(slots, Env::free_slot);
        Self { envs }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.envs.len()
    }

    /// Allocates the lowest free slot with a fresh directory.
    ///
    /// The new environment is Runnable and starts from `tf`.
    pub fn alloc(
        &mut self,
        pmm: &mut PhysicalMemoryManager,
        parent: EnvId,
        tf: TrapFrame,
    ) -> Result<EnvId, Error> {
        let index = self
            .envs
            .iter()
            .position(|env| env.status == EnvStatus::Free)
            .ok_or(Error::NoFreeEnv)?;
        let pgdir = PageDirectory::new(pmm)?;

        let env = &mut self.envs[index];
        let id = env.id.next_generation(index);
        *env = Env {
            id,
            parent,
            status: EnvStatus::Runnable,
            tf,
            pgdir: Some(pgdir),
            ..Env::free_slot()
        };

        log::debug!("[{parent}] new env {id}");
        Ok(id)
    }

    /// Resolves an id to a live-or-dying environment.
    ///
    /// Id 0 resolves to `caller`. With `checkperm`, the target must be the
    /// caller or one of its immediate children.
    pub fn lookup(&self, caller: EnvId, envid: EnvId, checkperm: bool) -> Result<EnvId, Error> {
        let envid = if envid == EnvId::CURRENT { caller } else { envid };
        let env = self.envs.get(envid.index()).ok_or(Error::BadEnv)?;
        if env.status == EnvStatus::Free || env.id != envid {
            return Err(Error::BadEnv);
        }
        if checkperm && env.id != caller && env.parent != caller {
            return Err(Error::BadEnv);
        }
        Ok(envid)
    }

    /// Returns the environment with this exact id, if it is allocated.
    pub fn get(&self, envid: EnvId) -> Option<&Env> {
        self.envs
            .get(envid.index())
            .filter(|env| env.status != EnvStatus::Free && env.id == envid)
    }

    /// Mutable variant of [`EnvTable::get`].
    pub fn get_mut(&mut self, envid: EnvId) -> Option<&mut Env> {
        self.envs
            .get_mut(envid.index())
            .filter(|env| env.status != EnvStatus::Free && env.id == envid)
    }

    /// Returns the environment with this id.
    ///
    /// # Panics
    /// Panics if the id is stale. Callers resolve ids with
    /// [`EnvTable::lookup`] first.
    pub fn env(&self, envid: EnvId) -> &Env {
        self.get(envid)
            .unwrap_or_else(|| panic!("stale env id {envid}"))
    }

    /// Mutable variant of [`EnvTable::env`].
    pub fn env_mut(&mut self, envid: EnvId) -> &mut Env {
        self.get_mut(envid)
            .unwrap_or_else(|| panic!("stale env id {envid}"))
    }

    /// Returns the slot at `index`.
    pub fn slot(&self, index: usize) -> &Env {
        &self.envs[index]
    }

    /// Iterates over every slot.
    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.envs.iter()
    }

    /// Iterates mutably over every slot.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Env> {
        self.envs.iter_mut()
    }

    /// Marks an environment as dying; it is freed the next time the scheduler sees it.
    pub fn destroy(&mut self, envid: EnvId) {
        if let Some(env) = self.get_mut(envid) {
            env.status = EnvStatus::Dying;
            env.ipc.recving = false;
            env.net_blocked = false;
        }
    }

    /// Releases every page of a slot's address space and returns it to the free pool.
    pub fn free(&mut self, pmm: &mut PhysicalMemoryManager, index: usize) {
        let env = &mut self.envs[index];
        log::debug!("[{}] free env {}", env.parent, env.id);
        if let Some(pgdir) = env.pgdir.take() {
            pgdir.destroy(pmm);
        }
        env.status = EnvStatus::Free;
        env.pgfault_upcall = 0;
        env.ipc = IpcState::default();
        env.net_blocked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(slots: usize) -> (PhysicalMemoryManager, EnvTable) {
        (PhysicalMemoryManager::new(64), EnvTable::new(slots))
    }

    #[test]
    fn first_ids_follow_generation_scheme() {
        let (mut pmm, mut envs) = setup(4);
        let a = envs.alloc(&mut pmm, EnvId::CURRENT, TrapFrame::default()).unwrap();
        let b = envs.alloc(&mut pmm, a, TrapFrame::default()).unwrap();

        assert_eq!(a.as_u32(), 0x1000);
        assert_eq!(b.as_u32(), 0x1001);
        assert_eq!(envs.env(b).parent, a);
        assert_eq!(envs.env(b).status, EnvStatus::Runnable);
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let (mut pmm, mut envs) = setup(2);
        let old = envs.alloc(&mut pmm, EnvId::CURRENT, TrapFrame::default()).unwrap();
        envs.destroy(old);
        envs.free(&mut pmm, old.index());

        let new = envs.alloc(&mut pmm, EnvId::CURRENT, TrapFrame::default()).unwrap();

        assert_eq!(new.index(), old.index());
        assert_eq!(new.as_u32(), 0x2000);
        assert_eq!(envs.lookup(new, old, false), Err(Error::BadEnv));
        assert_eq!(envs.lookup(new, new, false), Ok(new));
    }

    #[test]
    fn generation_wraps_to_first() {
        let id = EnvId::from_raw(0x7FFF_F003);
        assert_eq!(id.next_generation(3).as_u32(), 0x1003);
    }

    #[test]
    fn zero_means_caller() {
        let (mut pmm, mut envs) = setup(2);
        let a = envs.alloc(&mut pmm, EnvId::CURRENT, TrapFrame::default()).unwrap();
        assert_eq!(envs.lookup(a, EnvId::CURRENT, true), Ok(a));
    }

    #[test]
    fn permission_requires_self_or_child() {
        let (mut pmm, mut envs) = setup(4);
        let parent = envs.alloc(&mut pmm, EnvId::CURRENT, TrapFrame::default()).unwrap();
        let child = envs.alloc(&mut pmm, parent, TrapFrame::default()).unwrap();
        let grandchild = envs.alloc(&mut pmm, child, TrapFrame::default()).unwrap();

        assert_eq!(envs.lookup(parent, child, true), Ok(child));
        assert_eq!(envs.lookup(parent, grandchild, true), Err(Error::BadEnv));
        assert_eq!(envs.lookup(child, parent, true), Err(Error::BadEnv));
        assert_eq!(envs.lookup(child, parent, false), Ok(parent));
    }

    #[test]
    fn dying_env_still_resolves() {
        let (mut pmm, mut envs) = setup(2);
        let a = envs.alloc(&mut pmm, EnvId::CURRENT, TrapFrame::default()).unwrap();
        envs.destroy(a);
        assert_eq!(envs.lookup(a, a, true), Ok(a));
        assert!(!envs.env(a).is_live());
    }

    #[test]
    fn table_full() {
        let (mut pmm, mut envs) = setup(1);
        envs.alloc(&mut pmm, EnvId::CURRENT, TrapFrame::default()).unwrap();
        assert_eq!(
            envs.alloc(&mut pmm, EnvId::CURRENT, TrapFrame::default()),
            Err(Error::NoFreeEnv)
        );
    }

    #[test]
    fn free_returns_all_frames() {
        let (mut pmm, mut envs) = setup(1);
        let before = pmm.free_frames();
        let a = envs.alloc(&mut pmm, EnvId::CURRENT, TrapFrame::default()).unwrap();
        let frame = pmm.allocate(true).unwrap();
        envs.env(a)
            .pgdir()
            .insert(&mut pmm, pmm::VirtualAddress::new(0x1000), frame, PageFlags::USER)
            .unwrap();

        envs.destroy(a);
        envs.free(&mut pmm, a.index());

        assert_eq!(pmm.free_frames(), before);
        assert_eq!(envs.slot(0).status, EnvStatus::Free);
    }
}
