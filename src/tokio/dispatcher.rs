//! Runs blocking transport work off the caller's runtime.
//!
//! Every connection owns one worker thread and one unbounded job queue. Jobs
//! run strictly in submission order, which keeps requests from concurrent
//! callers from interleaving on the wire. Callers await a oneshot reply, so
//! no runtime thread ever blocks on the socket.
//!
//! While the session has channel subscriptions and the queue is empty, the
//! worker polls the socket for notifications for a short interval and then
//! checks the queue again. If the socket died, the worker reopens the session
//! (with backoff) instead, so subscriptions come back without another call.

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

use super::session::Session;

pub(crate) type Job = Box<dyn FnOnce(&mut Session) + Send>;

pub(crate) struct Dispatcher {
    jobs: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Start the worker thread that owns `session`.
    pub(crate) fn spawn(session: Session) -> Result<Self> {
        let (jobs, queue) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name(format!("pgnx-conn-{}", session.id()))
            .spawn(move || work(session, queue))?;
        Ok(Self { jobs })
    }

    /// Queue `job`. Returns false if the worker has exited.
    pub(crate) fn submit(&self, job: Job) -> bool {
        self.jobs.send(job).is_ok()
    }

    /// Run `f` on the worker and wait for its result.
    ///
    /// Fails with [`Error::Closed`] if the worker exits before running it.
    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session) -> Result<T> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job = Box::new(move |session| {
            let _ = reply.send(f(session));
        });
        if !self.submit(job) {
            return Err(Error::Closed);
        }
        response.await.unwrap_or(Err(Error::Closed))
    }
}

fn work(mut session: Session, mut queue: mpsc::UnboundedReceiver<Job>) {
    tracing::debug!(id = session.id(), "worker started");
    while !session.is_stopped() {
        let job = if session.is_listening() {
            match queue.try_recv() {
                Ok(job) => job,
                Err(TryRecvError::Empty) => {
                    session.poll_notifications();
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match queue.blocking_recv() {
                Some(job) => job,
                None => break,
            }
        };
        job(&mut session);
    }
    session.shutdown();
    tracing::debug!(id = session.id(), "worker stopped");
}
