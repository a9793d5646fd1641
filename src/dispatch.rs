use std::thread;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where backend calls run. Views never block on a job; results come back over a channel.
pub trait Spawn: Send + Sync {
    fn spawn(&self, job: Job);
}

/// One detached OS thread per job, as the terminal host does.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl Spawn for ThreadSpawner {
    fn spawn(&self, job: Job) {
        thread::spawn(job);
    }
}

/// Runs the job on the caller's thread before returning. Results still go through the
/// channel, so they are applied on the next poll.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineSpawner;

impl Spawn for InlineSpawner {
    fn spawn(&self, job: Job) {
        job();
    }
}
