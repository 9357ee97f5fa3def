//! Scripted in-memory transport for scheduler tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};

use uplink_core::{ConnectError, ConnectionParams, JobId, Protocol, UploadError};

use super::{Session, Transport, UploadContext, UploadRequest, UploadResult};

/// How uploads to one remote path behave
#[derive(Debug, Clone)]
pub(crate) enum Script {
    Ok,
    /// Fail transiently on the first `n` attempts, halfway through the file
    Transient(u32),
    /// Fail permanently on every attempt
    Permanent,
    /// Sleep this long between chunks, polling cancellation
    Slow(Duration),
    /// Report a remote size that never matches
    WrongSize,
    /// Sleep this long between chunks without ever looking at cancellation
    IgnoresCancel(Duration),
}

/// Handle carried by mock sessions
#[derive(Debug)]
pub(crate) struct MockHandle;

pub(crate) struct MockTransport {
    scripts: Mutex<HashMap<String, Script>>,
    attempts: Mutex<HashMap<String, u32>>,
    /// `ctx.resume` of every attempt, per remote path
    resume_flags: Mutex<HashMap<String, Vec<bool>>>,
    discarded: Mutex<Vec<JobId>>,
    /// Secret the transport accepts; anything else is rejected
    password: Option<String>,
    chunk: u64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    uploads: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            resume_flags: Mutex::new(HashMap::new()),
            discarded: Mutex::new(Vec::new()),
            password: None,
            chunk: 1024,
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn script(self, remote_path: &str, script: Script) -> Self {
        self.scripts.lock().insert(remote_path.to_string(), script);
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Most uploads ever running at the same time
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn attempts_for(&self, remote_path: &str) -> u32 {
        self.attempts.lock().get(remote_path).copied().unwrap_or(0)
    }

    pub fn resume_flags_for(&self, remote_path: &str) -> Vec<bool> {
        self.resume_flags
            .lock()
            .get(remote_path)
            .cloned()
            .unwrap_or_default()
    }

    /// Jobs whose leftover resume state was discarded
    pub fn discarded(&self) -> Vec<JobId> {
        self.discarded.lock().clone()
    }

    async fn stream(
        &self,
        request: &UploadRequest,
        ctx: &UploadContext,
        stop_at: u64,
        delay: Option<Duration>,
    ) -> Result<u64, UploadError> {
        let mut sent = 0u64;
        while sent < stop_at {
            ctx.check_cancelled()?;
            if let Some(delay) = delay {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(UploadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let n = self.chunk.min(stop_at - sent);
            sent += n;
            ctx.progress.advance(n);
        }
        debug_assert!(sent <= request.bytes_total);
        Ok(sent)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Handle = MockHandle;

    async fn connect(
        &self,
        protocol: Protocol,
        params: &ConnectionParams,
        secret: &SecretString,
    ) -> Result<Session<MockHandle>, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if let Some(expected) = &self.password {
            if secret.expose_secret() != expected {
                return Err(ConnectError::AuthRejected("530 Login incorrect".into()));
            }
        }
        Ok(Session::new(
            protocol,
            params.endpoint_key(protocol),
            params.username.clone().unwrap_or_default(),
            MockHandle,
        ))
    }

    async fn upload(
        &self,
        session: &mut Session<MockHandle>,
        request: &UploadRequest,
        ctx: &UploadContext,
    ) -> Result<UploadResult, UploadError> {
        if session.handle_mut().is_none() {
            return Err(UploadError::transient("session already closed"));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let attempt = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry(request.remote_path.clone()).or_insert(0);
            *n += 1;
            *n
        };
        self.resume_flags
            .lock()
            .entry(request.remote_path.clone())
            .or_default()
            .push(ctx.resume);
        let script = self
            .scripts
            .lock()
            .get(&request.remote_path)
            .cloned()
            .unwrap_or(Script::Ok);

        ctx.progress.begin_attempt(0);
        let total = request.bytes_total;
        let mut remote_size = Some(total);
        match script {
            Script::Ok => {
                self.stream(request, ctx, total, None).await?;
            }
            Script::Transient(n) if attempt <= n => {
                self.stream(request, ctx, total / 2, None).await?;
                return Err(UploadError::transient("connection reset by peer"));
            }
            Script::Transient(_) => {
                self.stream(request, ctx, total, None).await?;
            }
            Script::Permanent => {
                return Err(UploadError::permanent("553 Could not create file"));
            }
            Script::Slow(delay) => {
                self.stream(request, ctx, total, Some(delay)).await?;
            }
            Script::WrongSize => {
                self.stream(request, ctx, total, None).await?;
                remote_size = Some(total + 1);
            }
            Script::IgnoresCancel(delay) => {
                let mut sent = 0u64;
                while sent < total {
                    tokio::time::sleep(delay).await;
                    let n = self.chunk.min(total - sent);
                    sent += n;
                    ctx.progress.advance(n);
                }
            }
        }
        ctx.progress.flush();

        Ok(UploadResult {
            bytes_sent: total,
            resumed_from: 0,
            remote_size,
        })
    }

    async fn close(&self, session: &mut Session<MockHandle>) {
        if session.take_handle().is_some() {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn discard(&self, job_id: JobId) {
        self.discarded.lock().push(job_id);
    }
}
