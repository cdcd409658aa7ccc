pub mod file_lock;
pub mod lease;
pub mod process;

pub use file_lock::{FileLockGuard, FileLockOptions, LockError, acquire_file_lock, with_file_lock};
pub use lease::{LeaseAcquire, LeaseHandle, LeaseOptions, LeasePayload, try_acquire_lease};
pub use process::{hostname, pid_alive};
