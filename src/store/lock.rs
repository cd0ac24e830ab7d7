use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

const LOCK_POLL: Duration = Duration::from_millis(5);

/// Exclusive advisory lock on a job directory, released on drop.
///
/// `flock` locks belong to the open file description, so two handles in the
/// same process exclude each other just like two processes do.
#[derive(Debug)]
pub struct DirLock {
    file: File,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Acquire an exclusive lock on `dir`, polling until `timeout` elapses.
pub fn lock_dir(dir: &Path, timeout: Duration) -> io::Result<DirLock> {
    let file = File::open(dir)?;
    let fd = file.as_raw_fd();
    let deadline = Instant::now() + timeout;

    loop {
        let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            return Ok(DirLock { file });
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EWOULDBLOCK) && err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }

        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "timed out acquiring lock on {} after {}ms",
                    dir.display(),
                    timeout.as_millis()
                ),
            ));
        }

        std::thread::sleep(LOCK_POLL);
    }
}
