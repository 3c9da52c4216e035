use crate::worker::Worker;

use bitflags::bitflags;
use std::os::fd::RawFd;

pub type WorkerId = i32;

bitflags! {
    /// Readiness bits delivered to a pollable, a thin portable cover over
    /// the epoll event mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        const IN  = 1 << 0;
        const OUT = 1 << 1;
        const HUP = 1 << 2;
        const ERR = 1 << 3;
    }
}

bitflags! {
    /// What a handler did with the events it was given. INCOMPLETE_READ
    /// asks the worker for a guaranteed repeat call on the next iteration
    /// even without a fresh kernel event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollActions: u32 {
        const ACCEPT          = 1 << 0;
        const READ            = 1 << 1;
        const WRITE           = 1 << 2;
        const HUP             = 1 << 3;
        const ERROR           = 1 << 4;
        const INCOMPLETE_READ = 1 << 5;
    }
}

/// Whether this was triggered by the kernel or is the carried-over repeat
/// of an earlier INCOMPLETE_READ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollContext {
    NewCall,
    RepeatedCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollableKind {
    /// Polled by exactly one worker, which owns all mutation.
    Unique,
    /// May be polled by any worker; synchronization is the object's
    /// problem.
    Shared,
}

/// Something registered with a worker's poll instance.
pub trait Pollable {
    fn poll_fd(&self) -> RawFd;

    fn kind(&self) -> PollableKind {
        PollableKind::Unique
    }

    fn polling_worker(&self) -> Option<WorkerId>;
    fn set_polling_worker(&mut self, worker: Option<WorkerId>);

    fn handle_poll_events(
        &mut self,
        worker: &mut Worker,
        events: PollEvents,
        context: PollContext,
    ) -> PollActions;
}
