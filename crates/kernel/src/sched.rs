//! Round-robin scheduler.

use crate::{
    env::{EnvId, EnvStatus},
    kernel::Kernel,
};

impl Kernel {
    /// Picks the next environment to run and marks it Running.
    ///
    /// Dying environments are freed first. The search starts just after the
    /// environment that ran last and comes back to it only if nothing else
    /// is runnable. Returns None when no environment can run.
    pub fn schedule(&mut self) -> Option<EnvId> {
        self.reap();

        let slots = self.envs.len();
        let start = self.last_run.map_or(0, |index| index + 1);
        let index = (0..slots)
            .map(|offset| (start + offset) % slots)
            .find(|&index| self.envs.slot(index).status == EnvStatus::Runnable)?;

        let envid = self.envs.slot(index).id;
        let env = self.envs.env_mut(envid);
        env.status = EnvStatus::Running;
        env.runs += 1;

        self.last_run = Some(index);
        self.curenv = Some(envid);
        log::trace!("sched: run {envid}");
        Some(envid)
    }

    /// Ends an environment's scheduling turn.
    ///
    /// An environment still Running was preempted by the timer and goes
    /// back to Runnable. Returns whether the environment is still alive.
    pub fn end_turn(&mut self, envid: EnvId) -> bool {
        self.clock.tick(self.config.tick_ms);
        if self.curenv == Some(envid) {
            self.curenv = None;
        }

        let Some(env) = self.envs.get_mut(envid) else {
            return false;
        };
        if env.status == EnvStatus::Running {
            env.status = EnvStatus::Runnable;
        }
        env.is_live()
    }

    /// Frees every dying environment.
    fn reap(&mut self) {
        for index in 0..self.envs.len() {
            let env = self.envs.slot(index);
            if env.status != EnvStatus::Dying {
                continue;
            }
            let envid = env.id;
            if self.caches.remove(&envid).is_some() {
                log::debug!("[{envid}] block cache released");
            }
            self.envs.free(&mut self.pmm, index);
        }
    }
}
