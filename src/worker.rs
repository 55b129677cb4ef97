use crate::error::{JobError, QueueClosed};
use crate::jobs::{Action, MAX_RETRIES};
use crate::status::JobStore;
use tracing::{Level, event};

/// `JobHandler` is the action slot of a queue: it executes exactly one job
/// and reports its outcome. The queue never runs two invocations of the same
/// handler at the same time.
pub(crate) trait JobHandler: Send + Sync + 'static {
    type Job: Action + std::fmt::Debug + Send + Sync + 'static;
    type Output: serde::Serialize + std::fmt::Debug + Send + 'static;

    fn handle(
        &self,
        job_id: &str,
        job: &Self::Job,
    ) -> impl Future<Output = Result<Self::Output, JobError>> + Send;
}

type Outcome<H> = Result<<H as JobHandler>::Output, JobError>;

// A job travelling from `JobQueue::submit` to the worker, together with the
// channel over which its terminal outcome gets delivered.
struct Submission<H: JobHandler> {
    job_id: String,
    job: H::Job,
    done: tokio::sync::oneshot::Sender<Outcome<H>>,
}

#[derive(Debug)]
/// Handed out for every submitted job. The HTTP layer only keeps the job id
/// and reads outcomes from the `JobStore`, tests await them directly.
pub(crate) struct JobTicket<O> {
    job_id: String,
    #[cfg(test)]
    recv_done: tokio::sync::oneshot::Receiver<Result<O, JobError>>,
    #[cfg(not(test))]
    output: std::marker::PhantomData<O>,
}

impl<O> JobTicket<O> {
    // Outside of tests nobody awaits the outcome, so the receiver is dropped
    // and the worker's delivery becomes a no-op.
    #[cfg(not(test))]
    fn new(
        job_id: String,
        recv_done: tokio::sync::oneshot::Receiver<Result<O, JobError>>,
    ) -> Self {
        drop(recv_done);
        Self {
            job_id,
            output: std::marker::PhantomData,
        }
    }

    #[cfg(test)]
    fn new(
        job_id: String,
        recv_done: tokio::sync::oneshot::Receiver<Result<O, JobError>>,
    ) -> Self {
        Self { job_id, recv_done }
    }

    pub(crate) fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Resolves once the job succeeded or failed for good. Returns `None` if
    /// the queue shut down before the job reached a terminal state.
    #[cfg(test)]
    pub(crate) async fn outcome(self) -> Option<Result<O, JobError>> {
        self.recv_done.await.ok()
    }
}

/// Cloneable submission handle of a sequential job queue. All clones feed the
/// same single `QueueWorker`.
pub(crate) struct JobQueue<H: JobHandler> {
    name: &'static str,
    submit_job: tokio::sync::mpsc::UnboundedSender<Submission<H>>,
    store: JobStore,
}

impl<H: JobHandler> Clone for JobQueue<H> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            submit_job: self.submit_job.clone(),
            store: self.store.clone(),
        }
    }
}

impl<H: JobHandler> std::fmt::Debug for JobQueue<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("name", &self.name).finish()
    }
}

impl<H: JobHandler> JobQueue<H> {
    /// Create a queue named `name` that executes jobs with `handler`. The
    /// returned worker has to be driven (spawned) for any job to run.
    pub(crate) fn new(name: &'static str, handler: H, store: &JobStore) -> (Self, QueueWorker<H>) {
        let (submit_job, recv_job) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                name,
                submit_job,
                store: store.clone(),
            },
            QueueWorker {
                executor: Executor {
                    name,
                    handler,
                    store: store.clone(),
                    max_retries: MAX_RETRIES,
                },
                recv_job,
            },
        )
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Append `job` to the tail of the queue and return right away.
    pub(crate) fn submit(
        &self,
        job_id: String,
        job: H::Job,
    ) -> Result<JobTicket<H::Output>, QueueClosed> {
        let action = job.action();
        let (done, recv_done) = tokio::sync::oneshot::channel();

        // Record the job before handing it over, the worker may pick it up
        // immediately.
        self.store.queued(&job_id, self.name, action);

        if self
            .submit_job
            .send(Submission {
                job_id: job_id.clone(),
                job,
                done,
            })
            .is_err()
        {
            self.store.remove(&job_id);
            event!(
                Level::WARN,
                queue = self.name,
                job_id = %job_id,
                action,
                "Queue worker is gone, rejecting job"
            );
            return Err(QueueClosed(self.name));
        }

        event!(Level::INFO, queue = self.name, job_id = %job_id, action, "Job queued");

        Ok(JobTicket::new(job_id, recv_done))
    }
}

/// The single consumer of a `JobQueue`. Runs one job at a time, in submission
/// order, retrying retryable failures up to `max_retries` times.
pub(crate) struct QueueWorker<H: JobHandler> {
    executor: Executor<H>,
    recv_job: tokio::sync::mpsc::UnboundedReceiver<Submission<H>>,
}

// Everything the worker needs to run a job, apart from the job receiver.
struct Executor<H: JobHandler> {
    name: &'static str,
    handler: H,
    store: JobStore,
    max_retries: u8,
}

impl<H: JobHandler> Executor<H> {
    // Run a single job to its terminal state. Only returns after the handler
    // invocation of the final attempt has completed.
    async fn execute(&self, submission: Submission<H>) {
        let Submission { job_id, job, done } = submission;
        let action = job.action();
        let max_attempts = self.max_retries.saturating_add(1);

        let mut attempt: u8 = 1;
        let outcome = loop {
            self.store.running(&job_id, attempt);
            event!(
                Level::INFO,
                queue = self.name,
                job_id = %job_id,
                action,
                attempt,
                "Starting job (attempt {attempt} of at most {max_attempts})"
            );
            event!(Level::DEBUG, queue = self.name, job_id = %job_id, "Job parameters: {job:?}");

            match self.handler.handle(&job_id, &job).await {
                Ok(output) => break Ok(output),
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    event!(
                        Level::WARN,
                        queue = self.name,
                        job_id = %job_id,
                        action,
                        attempt,
                        "Job attempt failed, retrying: {e}"
                    );
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => break Err(e),
            }
        };

        match &outcome {
            Ok(output) => {
                self.store.succeeded(&job_id, output);
                event!(
                    Level::INFO,
                    queue = self.name,
                    job_id = %job_id,
                    action,
                    "Job succeeded: {output:?}"
                );
            }
            Err(e) => {
                self.store.failed(&job_id, e);
                event!(
                    Level::WARN,
                    queue = self.name,
                    job_id = %job_id,
                    action,
                    kind = e.kind(),
                    "Job failed: {e}"
                );
            }
        }

        // Nobody waiting for the outcome is fine, it's in the store and the log.
        let _ = done.send(outcome);
    }
}

impl<H: JobHandler> QueueWorker<H> {
    #[cfg(test)]
    pub(crate) fn with_max_retries(mut self, max_retries: u8) -> Self {
        self.executor.max_retries = max_retries;
        self
    }

    pub(crate) async fn run(self, mut recv_shutdown: tokio::sync::broadcast::Receiver<()>) {
        let QueueWorker {
            executor,
            mut recv_job,
        } = self;
        let name = executor.name;

        tokio::select! {
            () = async {
                // Awaiting each job before receiving the next one is what makes
                // this queue strictly sequential.
                while let Some(submission) = recv_job.recv().await {
                    executor.execute(submission).await;
                }
                event!(Level::DEBUG, queue = name, "All submitters gone, worker exiting...");
            } => {}
            _ = recv_shutdown.recv() => {
                event!(Level::DEBUG, queue = name, "Worker shutting down...");
            }
        }
    }
}
