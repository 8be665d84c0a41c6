//! Copy-on-write fork.
//!
//! The parent shares every page with the child and write-protects both
//! sides. The first write on either side takes a page fault, and
//! [`cow_fault`] gives the writer a private copy.

use alloc::boxed::Box;

use pmm::{FaultCode, PageFlags};

use crate::{
    Error,
    env::{EnvId, EnvStatus},
    machine::{COW_UPCALL, Program, UserCx, read_page},
    memlayout::{PFTEMP, PGSIZE, USTACKTOP, UXSTACKTOP, round_down},
    trap::FaultRecord,
};

const PUW: PageFlags = PageFlags::PRESENT
    .union(PageFlags::USER)
    .union(PageFlags::WRITABLE);

const COW: PageFlags = PageFlags::PRESENT
    .union(PageFlags::USER)
    .union(PageFlags::COPY_ON_WRITE);

/// Creates a child running `image` in a copy-on-write copy of this
/// environment's memory.
///
/// `image` is the program as it stands after the fork; on its first turn
/// [`UserCx::syscall_return`] reads 0. Any failure is fatal: a half-built
/// child is destroyed, then so is this environment, and the error is
/// returned so the program can see its turn is over.
pub fn fork(cx: &mut UserCx<'_>, image: Box<dyn Program>) -> Result<EnvId, Error> {
    let result = spawn_child(cx, image);
    if let Err(err) = &result {
        log::error!("[{}] fork failed: {err}", cx.env_id());
        cx.exit();
    }
    result
}

fn spawn_child(cx: &mut UserCx<'_>, image: Box<dyn Program>) -> Result<EnvId, Error> {
    cx.install_upcall(COW_UPCALL)?;
    let child = cx.sys_exofork()?;

    let started = prepare(cx, child).and_then(|()| {
        cx.machine().load(child, image);
        cx.sys_env_set_status(child, EnvStatus::Runnable)
    });
    if let Err(err) = started {
        let _ = cx.sys_env_destroy(child);
        return Err(err);
    }
    Ok(child)
}

fn prepare(cx: &mut UserCx<'_>, child: EnvId) -> Result<(), Error> {
    for (va, flags) in cx.mapped_pages(0, USTACKTOP) {
        duppage(cx, child, va, flags)?;
    }

    // The exception stack is never shared.
    cx.sys_page_alloc(child, UXSTACKTOP - PGSIZE, PUW)?;

    let upcall = cx
        .env(EnvId::CURRENT)
        .map_or(COW_UPCALL, |env| env.pgfault_upcall);
    cx.sys_env_set_pgfault_upcall(child, upcall)
}

/// Maps the page at `va` into `child`.
///
/// The parent is remapped after the child so that its own mapping loses
/// write access too.
fn duppage(cx: &mut UserCx<'_>, child: EnvId, va: u32, flags: PageFlags) -> Result<(), Error> {
    let flags = flags & PageFlags::SYSCALL;
    if flags.contains(PageFlags::SHARE) {
        cx.sys_page_map(EnvId::CURRENT, va, child, va, flags)
    } else if flags.intersects(PageFlags::WRITABLE | PageFlags::COPY_ON_WRITE) {
        cx.sys_page_map(EnvId::CURRENT, va, child, va, COW)?;
        cx.sys_page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, COW)
    } else {
        cx.sys_page_map(EnvId::CURRENT, va, child, va, flags)
    }
}

/// Page fault handler for copy-on-write pages.
///
/// Anything but a write to a copy-on-write page is an error, which kills
/// the environment.
pub fn cow_fault(cx: &mut UserCx<'_>, record: &FaultRecord) -> Result<(), Error> {
    let va = round_down(record.fault_va);
    let err = FaultCode::from_bits_truncate(record.err);
    let cow = cx
        .pte(va)
        .is_some_and(|pte| pte.flags().contains(PageFlags::COPY_ON_WRITE));
    if !err.contains(FaultCode::WRITE) || !cow {
        log::warn!("[{}] not a copy-on-write fault: {record}", cx.env_id());
        return Err(Error::Fault);
    }

    cx.sys_page_alloc(EnvId::CURRENT, PFTEMP, PUW)?;
    let contents = read_page(cx, va)?;
    cx.write(PFTEMP, &contents)?;
    cx.sys_page_map(EnvId::CURRENT, PFTEMP, EnvId::CURRENT, va, PUW)?;
    cx.sys_page_unmap(EnvId::CURRENT, PFTEMP)
}

#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec, vec::Vec};

    use spin::Mutex;

    use super::*;
    use crate::{EnvType, KernelConfig, Machine};

    const HEAP: u32 = 0x0050_0000;

    fn machine() -> Machine {
        Machine::new(KernelConfig {
            frames: 256,
            max_envs: 16,
            ..KernelConfig::default()
        })
    }

    #[derive(Default)]
    struct Report {
        child: Option<EnvId>,
        child_saw: Vec<u8>,
        parent_saw: Vec<u8>,
        child_first_return: Option<u32>,
    }

    /// Writes 4096 bytes of 0xAA over the heap page, then idles.
    struct Scribbler {
        report: Arc<Mutex<Report>>,
        done: bool,
    }

    impl Program for Scribbler {
        fn run(&mut self, cx: &mut UserCx<'_>) {
            if self.done {
                cx.sys_yield();
                return;
            }
            self.done = true;
            self.report.lock().child_first_return = Some(cx.syscall_return());
            cx.write(HEAP, &[0xAA; PGSIZE as usize]).unwrap();
            let mut page = vec![0u8; PGSIZE as usize];
            cx.read(HEAP, &mut page).unwrap();
            self.report.lock().child_saw = page;
        }
    }

    /// Fills the heap with 0x11, forks a scribbler, then reads the heap back.
    struct Parent {
        report: Arc<Mutex<Report>>,
        forked: bool,
    }

    impl Program for Parent {
        fn run(&mut self, cx: &mut UserCx<'_>) {
            if !self.forked {
                self.forked = true;
                cx.sys_page_alloc(EnvId::CURRENT, HEAP, PUW).unwrap();
                cx.write(HEAP, &[0x11; PGSIZE as usize]).unwrap();
                let child = Scribbler {
                    report: self.report.clone(),
                    done: false,
                };
                let child = fork(cx, Box::new(child)).unwrap();
                self.report.lock().child = Some(child);
                return;
            }
            let mut page = vec![0u8; PGSIZE as usize];
            cx.read(HEAP, &mut page).unwrap();
            self.report.lock().parent_saw = page;
            cx.exit();
        }
    }

    #[test]
    fn child_write_costs_exactly_one_frame() {
        let m = machine();
        let report = Arc::new(Mutex::new(Report::default()));
        let parent = m
            .spawn(
                EnvType::User,
                Parent {
                    report: report.clone(),
                    forked: false,
                },
            )
            .unwrap();

        assert_eq!(m.step(), Some(parent));
        let child = report.lock().child.unwrap();
        assert_eq!(m.kernel().env_info(child).unwrap().parent, parent);

        let before = m.kernel().free_frames();
        assert_eq!(m.step(), Some(child));
        assert_eq!(m.kernel().free_frames(), before - 1);

        assert_eq!(m.step(), Some(parent));
        let report = report.lock();
        assert_eq!(report.child_first_return, Some(0));
        assert!(report.child_saw.iter().all(|&b| b == 0xAA));
        assert!(report.parent_saw.iter().all(|&b| b == 0x11));
        assert_eq!(report.parent_saw.len(), PGSIZE as usize);
    }

    #[test]
    fn fork_write_protects_both_sides() {
        let m = machine();
        let flags = Arc::new(Mutex::new(Vec::new()));
        let seen = flags.clone();
        m.spawn(EnvType::User, move |cx: &mut UserCx<'_>| {
            cx.sys_page_alloc(EnvId::CURRENT, HEAP, PUW).unwrap();
            cx.sys_page_alloc(EnvId::CURRENT, HEAP + PGSIZE, PUW | PageFlags::SHARE)
                .unwrap();
            cx.sys_page_alloc(EnvId::CURRENT, HEAP + 2 * PGSIZE, PageFlags::PRESENT | PageFlags::USER)
                .unwrap();

            let child = fork(cx, Box::new(|cx: &mut UserCx<'_>| cx.exit())).unwrap();
            let mut seen = seen.lock();
            for env in [EnvId::CURRENT, child] {
                let view: Vec<PageFlags> = [HEAP, HEAP + PGSIZE, HEAP + 2 * PGSIZE]
                    .into_iter()
                    .map(|va| {
                        let pte = if env == EnvId::CURRENT {
                            cx.pte(va)
                        } else {
                            cx.machine().kernel().pte(env, va)
                        };
                        pte.unwrap().flags() & PageFlags::SYSCALL
                    })
                    .collect();
                seen.push(view);
            }
            let stack = cx.machine().kernel().pte(child, UXSTACKTOP - PGSIZE).unwrap();
            assert_ne!(stack.frame(), cx.pte(UXSTACKTOP - PGSIZE).unwrap().frame());
            cx.exit();
        })
        .unwrap();
        m.run(10);

        let ro = PageFlags::PRESENT | PageFlags::USER;
        let expected = vec![COW, PUW | PageFlags::SHARE, ro];
        assert_eq!(*flags.lock(), vec![expected.clone(), expected]);
    }

    #[test]
    fn writes_stay_private_on_both_sides() {
        let m = machine();
        let values = Arc::new(Mutex::new((0u32, 0u32)));
        let parent_values = values.clone();
        let mut turn = 0;
        m.spawn(EnvType::User, move |cx: &mut UserCx<'_>| {
            turn += 1;
            match turn {
                1 => {
                    cx.sys_page_alloc(EnvId::CURRENT, HEAP, PUW).unwrap();
                    cx.write_u32(HEAP, 1).unwrap();
                    let values = parent_values.clone();
                    let mut child_turn = 0;
                    let child = move |cx: &mut UserCx<'_>| {
                        child_turn += 1;
                        if child_turn == 1 {
                            cx.write_u32(HEAP, 2).unwrap();
                        } else {
                            values.lock().1 = cx.read_u32(HEAP).unwrap();
                            cx.exit();
                        }
                    };
                    fork(cx, Box::new(child)).unwrap();
                    cx.write_u32(HEAP, 3).unwrap();
                }
                _ => {
                    parent_values.lock().0 = cx.read_u32(HEAP).unwrap();
                    cx.exit();
                }
            }
        })
        .unwrap();
        m.run(10);

        assert_eq!(*values.lock(), (3, 2));
    }

    #[test]
    fn refork_shares_copy_on_write_pages_again() {
        let m = machine();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let out = frames.clone();
        m.spawn(EnvType::User, move |cx: &mut UserCx<'_>| {
            cx.sys_page_alloc(EnvId::CURRENT, HEAP, PUW).unwrap();
            let a = fork(cx, Box::new(|cx: &mut UserCx<'_>| cx.exit())).unwrap();
            let b = fork(cx, Box::new(|cx: &mut UserCx<'_>| cx.exit())).unwrap();
            let kernel = cx.machine().kernel();
            let mut out = out.lock();
            for env in [cx.env_id(), a, b] {
                out.push(kernel.pte(env, HEAP).unwrap().frame().unwrap());
            }
            assert_eq!(kernel.pmm().refcount(out[0]), 3);
            drop(kernel);
            cx.exit();
        })
        .unwrap();
        m.run(10);

        let frames = frames.lock();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|&f| f == frames[0]));
    }

    #[test]
    fn write_to_read_only_page_is_fatal() {
        let m = machine();
        let env = m
            .spawn(EnvType::User, |cx: &mut UserCx<'_>| {
                cx.install_upcall(COW_UPCALL).unwrap();
                cx.sys_page_alloc(EnvId::CURRENT, HEAP, PageFlags::PRESENT | PageFlags::USER)
                    .unwrap();
                assert_eq!(cx.write_u32(HEAP, 5), Err(Error::Fault));
                assert!(cx.killed());
            })
            .unwrap();
        m.run(10);
        assert!(m.kernel().env_info(env).is_none());
    }

    #[test]
    fn failed_fork_destroys_child_and_parent() {
        let m = machine();
        let result = Arc::new(Mutex::new(None));
        let out = result.clone();
        let parent = m
            .spawn(EnvType::User, move |cx: &mut UserCx<'_>| {
                cx.install_upcall(COW_UPCALL).unwrap();
                // Keep just enough memory for the child's page directory.
                {
                    let mut kernel = cx.machine().kernel();
                    while kernel.free_frames() > 1 {
                        kernel.pmm.allocate(false).unwrap();
                    }
                }
                *out.lock() = Some(fork(cx, Box::new(|_: &mut UserCx<'_>| {})));
                assert!(cx.killed());
                let children = cx
                    .envs()
                    .into_iter()
                    .filter(|env| env.parent == cx.env_id() && env.status != EnvStatus::Dying)
                    .count();
                assert_eq!(children, 0);
            })
            .unwrap();
        m.run(10);

        assert_eq!(*result.lock(), Some(Err(Error::NoMem)));
        assert!(m.kernel().env_info(parent).is_none());
    }

    #[test]
    fn one_write_across_many_shared_pages() {
        const PAGES: u32 = 12;
        let len = (PAGES * PGSIZE) as usize;
        let seen = Arc::new(Mutex::new((false, false)));
        let child_seen = seen.clone();
        let parent_seen = seen.clone();
        let mut forked = false;
        let m = machine();
        let parent = m
            .spawn(EnvType::User, move |cx: &mut UserCx<'_>| {
                if forked {
                    let mut back = vec![0u8; len];
                    cx.read(HEAP, &mut back).unwrap();
                    parent_seen.lock().0 = back.iter().all(|&b| b == 0x22);
                    cx.exit();
                    return;
                }
                forked = true;
                for page in 0..PAGES {
                    cx.sys_page_alloc(EnvId::CURRENT, HEAP + page * PGSIZE, PUW)
                        .unwrap();
                }
                cx.write(HEAP, &vec![0x11; len]).unwrap();

                let seen = child_seen.clone();
                let child = move |cx: &mut UserCx<'_>| {
                    let mut back = vec![0u8; len];
                    cx.read(HEAP, &mut back).unwrap();
                    seen.lock().1 = back.iter().all(|&b| b == 0x11);
                    cx.exit();
                };
                fork(cx, Box::new(child)).unwrap();

                assert_eq!(cx.write(HEAP, &vec![0x22; len]), Ok(()));
                assert!(!cx.killed());
            })
            .unwrap();
        m.run(10);

        assert_eq!(*seen.lock(), (true, true));
        assert!(m.kernel().env_info(parent).is_none());
    }
}
