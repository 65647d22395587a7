//! Scripted driver for channel and orchestrator tests

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use driver::{Driver, Result, SubmissionHandle, SubmissionStatus};

/// Driver whose responses are scripted per test: poll results are consumed
/// in order (then `Pending` forever), harvest results likewise. Abort calls
/// are counted so cancellation tests can assert propagation.
pub struct MockDriver {
    submit_script: Mutex<VecDeque<Result<SubmissionHandle>>>,
    poll_script: Mutex<VecDeque<Result<SubmissionStatus>>>,
    harvest_script: Mutex<VecDeque<Result<String>>>,
    harvest_delay: Duration,
    poll_count: AtomicU32,
    harvest_count: AtomicU32,
    pub abort_calls: AtomicU32,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            submit_script: Mutex::new(VecDeque::new()),
            poll_script: Mutex::new(VecDeque::new()),
            harvest_script: Mutex::new(VecDeque::new()),
            harvest_delay: Duration::ZERO,
            poll_count: AtomicU32::new(0),
            harvest_count: AtomicU32::new(0),
            abort_calls: AtomicU32::new(0),
        }
    }

    pub fn submit_sequence(self, results: Vec<Result<SubmissionHandle>>) -> Self {
        self.submit_script.lock().unwrap().extend(results);
        self
    }

    pub fn poll_sequence(self, results: Vec<Result<SubmissionStatus>>) -> Self {
        self.poll_script.lock().unwrap().extend(results);
        self
    }

    pub fn harvest_ok(self, text: &str) -> Self {
        self.harvest_script
            .lock()
            .unwrap()
            .push_back(Ok(text.to_string()));
        self
    }

    pub fn harvest_err(self, err: driver::Error) -> Self {
        self.harvest_script.lock().unwrap().push_back(Err(err));
        self
    }

    /// Delay applied before every harvest completes, so tests can keep the
    /// slow channel slow under paused time.
    pub fn harvest_after(mut self, delay: Duration) -> Self {
        self.harvest_delay = delay;
        self
    }

    pub fn aborts(&self) -> u32 {
        self.abort_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> u32 {
        self.poll_count.load(Ordering::SeqCst)
    }

    pub fn harvest_calls(&self) -> u32 {
        self.harvest_count.load(Ordering::SeqCst)
    }
}

impl Driver for MockDriver {
    fn submit<'a>(
        &'a self,
        _request: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SubmissionHandle>> + Send + 'a>> {
        Box::pin(async {
            self.submit_script.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(SubmissionHandle {
                    id: "req-test".into(),
                    host: "backend.example".into(),
                })
            })
        })
    }

    fn poll_status<'a>(
        &'a self,
        _handle: &'a SubmissionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<SubmissionStatus>> + Send + 'a>> {
        Box::pin(async {
            self.poll_count.fetch_add(1, Ordering::SeqCst);
            self.poll_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(SubmissionStatus::Pending))
        })
    }

    fn harvest_final_text<'a>(
        &'a self,
        _handle: &'a SubmissionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async {
            self.harvest_count.fetch_add(1, Ordering::SeqCst);
            if !self.harvest_delay.is_zero() {
                tokio::time::sleep(self.harvest_delay).await;
            }
            self.harvest_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(driver::Error::SessionLost("no scripted harvest".into())))
        })
    }

    fn abort<'a>(
        &'a self,
        _handle: &'a SubmissionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async {
            self.abort_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
