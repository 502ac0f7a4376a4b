//! Namespace-confined execution. Namespace switching binds to the calling OS
//! thread, so every entry into a pod namespace happens on a dedicated thread
//! spawned for that one job: the thread switches in, runs the closure on a
//! current-thread runtime, switches back and exits. A thread that fails to
//! restore the root namespace is simply abandoned with its error; it is
//! never returned to any pool.

use std::fs::File;
use std::future::Future;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sched::{setns, CloneFlags};
use tracing::error;

/// Path of the network namespace of the calling process.
const SELF_NS_NET: &str = "/proc/self/ns/net";

/// Opens the root network namespace of this process. Must be called from a
/// thread that has not switched namespaces.
pub fn open_root_netns() -> Result<File> {
    File::open(SELF_NS_NET).context("could not open own network namespace")
}

/// Runs `build` inside the network namespace at `netns_path`, driving the
/// returned future to completion on a runtime owned by the pinned thread.
/// The closure runs entirely within the namespace; netlink sockets it opens
/// observe that namespace for their whole lifetime.
pub fn block_on_in_netns<T, F, Fut>(netns_path: &Path, build: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>>,
{
    let target = File::open(netns_path)
        .with_context(|| format!("could not open network namespace {}", netns_path.display()))?;
    let root = open_root_netns()?;
    let netns_path: PathBuf = netns_path.to_path_buf();

    let worker = std::thread::Builder::new()
        .name("netns-worker".to_string())
        .spawn(move || -> Result<T> {
            setns(target.as_fd(), CloneFlags::CLONE_NEWNET).with_context(|| {
                format!("could not enter network namespace {}", netns_path.display())
            })?;

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
                .context("could not build namespace runtime")?;
            let result = runtime.block_on(build());
            drop(runtime);

            // Restore before the thread finishes. On failure the thread is
            // abandoned either way, but a clean restore keeps the error
            // reporting honest.
            if let Err(err) = setns(root.as_fd(), CloneFlags::CLONE_NEWNET) {
                error!(error = %err, "could not restore root network namespace");
            }
            result
        })
        .context("could not spawn namespace worker thread")?;

    match worker.join() {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("namespace worker panicked: {panic:?}")),
    }
}

/// Like [`block_on_in_netns`] but without entering a namespace: runs the
/// future on a dedicated thread-owned runtime in the root namespace. Used by
/// the synchronous attach path for the operations that must happen from the
/// root side.
pub fn block_on_in_root<T, F, Fut>(build: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>>,
{
    let worker = std::thread::Builder::new()
        .name("netns-root-worker".to_string())
        .spawn(move || -> Result<T> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
                .context("could not build runtime")?;
            runtime.block_on(build())
        })
        .context("could not spawn worker thread")?;

    match worker.join() {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("worker panicked: {panic:?}")),
    }
}
