//! Blocking façade
//!
//! [`EventLoop`] owns one background thread driving a current-thread tokio
//! runtime. Synchronous callers submit futures to it and block until the
//! result arrives or a timeout elapses. A timeout only stops the wait: the
//! submitted task keeps running, so its remote side effect may still happen.
//!
//! [`BlockingClient`] wraps a [`StorageClient`] with synchronous methods that
//! go through an [`EventLoop`].

use crate::client::{FindOptions, ListOptions, StorageClient};
use crate::error::StorageError;
use crate::path::DirEntry;
use crate::upload::UploadResult;
use bytes::Bytes;
use std::future::Future;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

/// A dedicated thread running one event loop
pub struct EventLoop {
    handle: Handle,
    thread_id: ThreadId,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Start the loop thread
    pub fn new() -> Result<Self, StorageError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (shutdown, stopped) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("kumofs-loop".into())
            .spawn(move || {
                runtime.block_on(async {
                    // Either an explicit stop or the sender being dropped
                    let _ = stopped.await;
                });
                tracing::debug!("Event loop stopped");
            })?;

        Ok(Self {
            handle,
            thread_id: thread.thread().id(),
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    /// Handle for spawning onto the loop from async code
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Whether the calling thread is the loop thread
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run `future` on the loop and block until it completes.
    ///
    /// With a `timeout`, waiting stops after that long and
    /// [`StorageError::Timeout`] is returned; the task is not cancelled.
    /// Calling this from the loop thread would deadlock and is rejected.
    pub fn run<F, T>(&self, future: F, timeout: Option<Duration>) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_loop_thread() {
            return Err(StorageError::InvalidArgument(
                "blocking call made from the event loop thread".into(),
            ));
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.handle.spawn(async move {
            // The caller may have stopped waiting
            let _ = tx.send(future.await);
        });

        let aborted = || {
            StorageError::Io(std::io::Error::other(
                "event loop task ended without a result",
            ))
        };
        match timeout {
            Some(limit) => match rx.recv_timeout(limit) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(timeout = ?limit, "Blocking call timed out");
                    Err(StorageError::Timeout(limit))
                }
                Err(RecvTimeoutError::Disconnected) => Err(aborted()),
            },
            None => rx.recv().unwrap_or_else(|_| Err(aborted())),
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if self.is_loop_thread() {
            return;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Event loop thread panicked");
            }
        }
    }
}

/// Synchronous wrapper over [`StorageClient`]
#[derive(Clone)]
pub struct BlockingClient {
    client: Arc<StorageClient>,
    event_loop: Arc<EventLoop>,
    timeout: Option<Duration>,
}

impl BlockingClient {
    pub fn new(client: Arc<StorageClient>, event_loop: Arc<EventLoop>) -> Self {
        Self {
            client,
            event_loop,
            timeout: None,
        }
    }

    /// Bound every call by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn client(&self) -> &Arc<StorageClient> {
        &self.client
    }

    fn run<T, F, Fut>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(Arc<StorageClient>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>> + Send + 'static,
        T: Send + 'static,
    {
        self.event_loop.run(op(self.client.clone()), self.timeout)
    }

    pub fn ls(&self, path: &str, options: ListOptions) -> Result<Vec<DirEntry>, StorageError> {
        let path = path.to_string();
        self.run(|client| async move { client.ls(&path, options).await })
    }

    pub fn info(&self, path: &str) -> Result<DirEntry, StorageError> {
        let path = path.to_string();
        self.run(|client| async move { client.info(&path).await })
    }

    pub fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let path = path.to_string();
        self.run(|client| async move { client.exists(&path).await })
    }

    pub fn find(&self, path: &str, options: FindOptions) -> Result<Vec<DirEntry>, StorageError> {
        let path = path.to_string();
        self.run(|client| async move { client.find(&path, options).await })
    }

    pub fn walk(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let path = path.to_string();
        self.run(|client| async move { client.walk(&path).await })
    }

    pub fn read_block(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
        delimiter: Option<&[u8]>,
    ) -> Result<Bytes, StorageError> {
        let path = path.to_string();
        let delimiter = delimiter.map(<[u8]>::to_vec);
        self.run(|client| async move {
            client
                .read_block(&path, offset, length, delimiter.as_deref())
                .await
        })
    }

    pub fn cat_file(
        &self,
        path: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Bytes, StorageError> {
        let path = path.to_string();
        self.run(|client| async move { client.cat_file(&path, start, end).await })
    }

    pub fn pipe_file(
        &self,
        path: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadResult, StorageError> {
        let path = path.to_string();
        let content_type = content_type.map(str::to_string);
        self.run(|client| async move {
            client
                .pipe_file(&path, data, content_type.as_deref())
                .await
        })
    }

    pub fn rm(&self, paths: &[&str], recursive: bool) -> Result<(), StorageError> {
        let paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        self.run(|client| async move { client.rm(&paths, recursive).await })
    }

    pub fn mv(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let (src, dst) = (src.to_string(), dst.to_string());
        self.run(|client| async move { client.mv(&src, &dst).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_returns_result() {
        let event_loop = EventLoop::new().unwrap();
        let value = event_loop.run(async { Ok(21 * 2) }, None).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_run_propagates_error() {
        let event_loop = EventLoop::new().unwrap();
        let result: Result<(), _> = event_loop.run(
            async { Err(StorageError::NotFound("b/k".into())) },
            Some(Duration::from_secs(5)),
        );
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn test_run_times_out() {
        let event_loop = EventLoop::new().unwrap();
        let result: Result<(), _> = event_loop.run(
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            },
            Some(Duration::from_millis(50)),
        );
        assert!(matches!(result, Err(StorageError::Timeout(_))));
    }

    #[test]
    fn test_run_from_loop_thread_rejected() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let inner = event_loop.clone();
        let result = event_loop
            .run(
                async move {
                    let nested: Result<(), StorageError> = inner.run(async { Ok(()) }, None);
                    Ok(matches!(nested, Err(StorageError::InvalidArgument(_))))
                },
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        assert!(result);
    }

    #[test]
    fn test_concurrent_callers_share_loop() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let event_loop = event_loop.clone();
                thread::spawn(move || {
                    event_loop.run(
                        async move {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(i)
                        },
                        Some(Duration::from_secs(5)),
                    )
                })
            })
            .collect();
        let mut results: Vec<i32> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        results.sort();
        assert_eq!(results, vec![0, 1, 2, 3]);
    }
}
