use std::future::Future;
use std::sync::OnceLock;

use tokio::task::JoinHandle;

/// A pinned, boxed, sendable future.
pub type BoxFuture<T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Boxed factory producing a unit of work on demand.
pub(crate) type TaskFactory<T> = Box<dyn FnOnce() -> BoxFuture<T> + Send>;

fn runtime_handle() -> tokio::runtime::Handle {
	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		return handle;
	}

	static GLOBAL_RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
	let runtime = GLOBAL_RT.get_or_init(|| {
		tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.worker_threads(2)
			.thread_name("tether-global")
			.build()
			.expect("failed to build tether global tokio runtime")
	});
	runtime.handle().clone()
}

/// Spawns an internal coordination task, labeled for tracing.
pub(crate) fn spawn<F>(label: &'static str, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(task = label, "tether.spawn");
	runtime_handle().spawn(fut)
}
