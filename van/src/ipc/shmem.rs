//! Typed POSIX shared memory objects.
//!
//! [`Shm<T, Mode>`] maps one `shm_open` object holding exactly one `T`. The
//! `Mode` typestate decides who removes the name:
//!
//! - [`Creator`]: creates the object (`O_CREAT | O_EXCL`), unlinks it on drop.
//! - [`Opener`]: maps an object someone else created, only unmaps on drop.
//!
//! A van client is the creator of its device objects and the host is the
//! opener, so a crashed host never removes a device the client still owns.
//!
//! ```text
//!  client (Creator)                      host (Opener)
//!  ┌──────────────┐   /van-python-dl    ┌──────────────┐
//!  │ Shm<Queue>   │◀───── same pages ──▶│ Shm<Queue>   │
//!  └──────────────┘                     └──────────────┘
//!        drop: munmap + shm_unlink           drop: munmap
//! ```
//!
//! Only [`SharedMemorySafe`] types may be placed in a mapping: fixed layout,
//! no pointers, atomics for anything mutated concurrently.

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{MaybeUninit, size_of};
use std::ops::Deref;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;
use thiserror::Error;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors produced while creating, opening or waiting on shared memory.
#[derive(Debug, Error)]
pub enum ShmError {
    /// The name is not a portable POSIX shared memory name.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// A POSIX call failed.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },
    /// The object exists but was sized for a different type.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
    /// The creator never finished initializing the object.
    #[error("shared memory `{path}` was not initialized in time")]
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, source: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source,
        }
    }

    /// Returns the errno of a failed POSIX call, if that is what this is.
    #[must_use]
    pub fn errno(&self) -> Option<io::Errno> {
        match self {
            Self::Posix { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// True when the object did not exist (`ENOENT`).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.errno() == Some(io::Errno::NOENT)
    }

    /// True when the object already existed (`EEXIST`).
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.errno() == Some(io::Errno::EXIST)
    }

    /// True when the kernel refused for lack of memory or descriptors.
    #[must_use]
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self.errno(),
            Some(io::Errno::NOMEM | io::Errno::NOSPC | io::Errno::MFILE | io::Errno::NFILE)
        )
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory name.
///
/// Portable names start with `/`, contain no other `/` and are at most 255
/// bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates `path` as a shared memory name.
    ///
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] naming the violated rule.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let invalid = |reason| ShmError::InvalidPath {
            path: path.clone(),
            reason,
        };

        if !path.starts_with('/') {
            return Err(invalid("path must start with '/'"));
        }
        if path.len() == 1 {
            return Err(invalid("path must name an object after the '/'"));
        }
        if path[1..].contains('/') {
            return Err(invalid("path must not contain additional '/' characters"));
        }
        if path.len() > POSIX_NAME_MAX {
            return Err(invalid("path length must be <= 255 bytes"));
        }
        Ok(Self(path))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Removes the name, ignoring errors.
    ///
    /// Used to clear objects left behind by a process that crashed before its
    /// [`Creator`] mapping was dropped.
    pub fn unlink_stale(&self) {
        let _ = shm::unlink(self.as_str());
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ShmPath> for String {
    fn from(path: ShmPath) -> Self {
        path.0
    }
}

/// Cleanup behavior of a mapping, selected by the [`Creator`] / [`Opener`]
/// markers.
pub trait ShmMode {
    /// Whether dropping the mapping also removes the name.
    const SHOULD_UNLINK: bool;
}

/// Typestate of the process that created the object. Unlinks on drop.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate of a process that opened an existing object. Never unlinks.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types that can live in memory mapped by several processes.
///
/// # Safety
///
/// Implementers guarantee:
/// - a stable layout (`#[repr(C)]`, `#[repr(transparent)]` or a primitive repr);
/// - no pointers, references or heap handles, since addresses differ per process;
/// - every field is itself `SharedMemorySafe`;
/// - all-zero bytes are a valid value, because a fresh object is zero filled
///   and an opener may observe it before the creator's initializer runs;
/// - concurrent mutation goes through atomics;
/// - soundness does not depend on `Drop` running.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Owned mapping of a shared memory object holding one `T`.
///
/// Dereferences to `&T`; mutation happens through the atomics inside `T`.
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the mapping is process-wide memory, not thread-local, and
// T: SharedMemorySafe requires Send + Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}

// SAFETY: shared access only hands out &T, and T: Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates the object, sizes it for `T` and runs `init` on the fresh
    /// (zero filled) mapping.
    ///
    /// `init` writes in place, so large ring buffers never pass through the
    /// stack.
    ///
    /// # Errors
    ///
    /// `EEXIST` when the name is taken, `EACCES`, `ENOMEM`, `EMFILE` and the
    /// like from `shm_open`, `ftruncate` or `mmap`. The name is removed again
    /// on any failure after it was created.
    pub fn create(path: ShmPath, init: impl FnOnce(&mut MaybeUninit<T>)) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        if let Err(err) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            path.unlink_stale();
            return Err(ShmError::posix("ftruncate", &path, err));
        }

        // SAFETY: a fresh shared mapping of an object we just sized to
        // size_of::<T>(); mmap returns page aligned memory, which satisfies
        // T's alignment, and the mapping aliases nothing in this process.
        let mapped = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let raw = match mapped {
            Ok(raw) => raw,
            Err(err) => {
                drop(fd);
                path.unlink_stale();
                return Err(ShmError::posix("mmap", &path, err));
            }
        };
        drop(fd);

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<T>()) };

        // SAFETY: nobody else can hold a reference yet: the object was
        // created exclusively above and openers only read after the
        // initializer publishes its own ready marker.
        init(unsafe { &mut *ptr.as_ptr().cast::<MaybeUninit<T>>() });

        Ok(Self {
            ptr,
            path,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Maps an existing object created by another party.
    ///
    /// # Errors
    ///
    /// `ENOENT` when the object does not exist, [`ShmError::SizeMismatch`]
    /// when it was created for another type, and POSIX errors from `fstat`
    /// or `mmap`.
    pub fn open(path: ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", &path, err))?;
        if stat.st_size != size_of::<T>() as i64 {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        // SAFETY: the object exists with exactly size_of::<T>() bytes and is
        // mapped fresh into this process; T: SharedMemorySafe accepts any
        // state the creator may be in, including all zeroes.
        let raw = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|err| ShmError::posix("mmap", &path, err))?;

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<T>()) };

        Ok(Self {
            ptr,
            path,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping made in create/open, and no
        // reference derived from it outlives self.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), size_of::<T>());
        }

        if Mode::SHOULD_UNLINK {
            self.path.unlink_stale();
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping lives as long as self.
        unsafe { self.ptr.as_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Counter {
        value: AtomicU64,
        flag: AtomicBool,
    }

    unsafe impl SharedMemorySafe for Counter {}

    fn path(name: &str) -> ShmPath {
        let path = ShmPath::new(format!("/van-test-{}-{name}", std::process::id())).unwrap();
        path.unlink_stale();
        path
    }

    #[test]
    fn creator_and_opener_share_pages() -> Result<()> {
        let path = path("shared");

        let creator = Shm::<Counter, Creator>::create(path.clone(), |uninit| {
            uninit.write(Counter {
                value: AtomicU64::new(7),
                flag: AtomicBool::new(false),
            });
        })?;

        {
            let opener = Shm::<Counter, Opener>::open(path.clone())?;
            assert_eq!(opener.value.load(Ordering::Acquire), 7);
            opener.value.store(99, Ordering::Release);
            opener.flag.store(true, Ordering::Release);
        }

        // Opener dropped: the name is still there.
        assert!(Shm::<Counter, Opener>::open(path.clone()).is_ok());
        assert_eq!(creator.value.load(Ordering::Acquire), 99);
        assert!(creator.flag.load(Ordering::Acquire));
        Ok(())
    }

    #[test]
    fn creator_drop_unlinks_name() -> Result<()> {
        let path = path("unlink");
        let creator = Shm::<Counter, Creator>::create(path.clone(), |_| {})?;
        drop(creator);

        let err = Shm::<Counter, Opener>::open(path).err().unwrap();
        assert!(err.is_not_found());
        Ok(())
    }

    #[test]
    fn create_twice_is_already_exists() -> Result<()> {
        let path = path("twice");
        let _first = Shm::<Counter, Creator>::create(path.clone(), |_| {})?;
        let err = Shm::<Counter, Creator>::create(path, |_| {}).err().unwrap();
        assert!(err.is_already_exists());
        Ok(())
    }

    #[test]
    fn open_with_other_type_is_size_mismatch() -> Result<()> {
        let path = path("mismatch");
        let _small = Shm::<u64, Creator>::create(path.clone(), |_| {})?;

        match Shm::<Counter, Opener>::open(path) {
            Err(ShmError::SizeMismatch { expected, actual, .. }) => {
                assert_eq!(expected, size_of::<Counter>());
                assert_eq!(actual, size_of::<u64>() as i64);
            }
            Err(other) => panic!("expected SizeMismatch, got {other}"),
            Ok(_) => panic!("open with the wrong type succeeded"),
        }
        Ok(())
    }

    #[test]
    fn path_rules() {
        assert!(ShmPath::new("/valid-name_1.x").is_ok());
        assert!(ShmPath::new(format!("/{}", "a".repeat(254))).is_ok());

        let reason = |p: &str| match ShmPath::new(p) {
            Err(ShmError::InvalidPath { reason, .. }) => reason,
            other => panic!("expected InvalidPath for {p:?}, got {other:?}"),
        };
        assert_eq!(reason("no-slash"), "path must start with '/'");
        assert_eq!(reason("/"), "path must name an object after the '/'");
        assert_eq!(reason("/a/b"), "path must not contain additional '/' characters");
        assert_eq!(
            reason(&format!("/{}", "a".repeat(255))),
            "path length must be <= 255 bytes"
        );
    }
}
