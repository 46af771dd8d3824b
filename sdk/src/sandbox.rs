//! Sandboxed replacements for the mutating parts of `std`.
//!
//! Tool sources are rewritten so that `std::fs`, `std::process` and
//! `std::env::set_current_dir` resolve to the modules below. Reads pass
//! straight through. Writes are allowed only when every path involved lies
//! inside one of the sandbox roots and none is a protected path; launching
//! processes is always denied.
//! Each denied operation is reported exactly once and then fails with
//! `PermissionDenied` without touching the filesystem.

use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use crate::{SANDBOX_PROTECTED_ENV, SANDBOX_ROOTS_ENV};

/// A denied operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub operation: String,
    pub detail: String,
}

impl Violation {
    fn outside(operation: &str, path: &Path) -> Self {
        Self {
            operation: operation.to_string(),
            detail: format!("path '{}' is outside the sandbox roots", path.display()),
        }
    }

    fn protected(operation: &str, path: &Path) -> Self {
        Self {
            operation: operation.to_string(),
            detail: format!("path '{}' is protected", path.display()),
        }
    }

    fn process(operation: &str, program: &str) -> Self {
        Self {
            operation: operation.to_string(),
            detail: format!("launching '{program}' is not allowed"),
        }
    }

    fn into_io_error(self) -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, self.to_string())
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.detail)
    }
}

impl std::error::Error for Violation {}

/// Receives denied operations. Returns whether the denial was confirmed.
pub trait ViolationReporter: Send + Sync {
    fn report(&self, violation: &Violation) -> bool;
}

struct StderrReporter;

impl ViolationReporter for StderrReporter {
    fn report(&self, violation: &Violation) -> bool {
        eprintln!("sandbox violation: {violation}");
        true
    }
}

static REPORTER: OnceLock<Box<dyn ViolationReporter>> = OnceLock::new();
static GUARD: OnceLock<PathGuard> = OnceLock::new();

/// Install the process-wide reporter. Only the first call wins.
pub fn install_reporter(reporter: Box<dyn ViolationReporter>) -> bool {
    REPORTER.set(reporter).is_ok()
}

fn reporter() -> &'static dyn ViolationReporter {
    REPORTER.get_or_init(|| Box::new(StderrReporter)).as_ref()
}

fn guard() -> &'static PathGuard {
    GUARD.get_or_init(PathGuard::from_env)
}

/// Decides whether paths fall inside the sandbox roots.
#[derive(Debug, Clone)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
    protected: Vec<PathBuf>,
    base: Option<PathBuf>,
}

impl PathGuard {
    /// Guard with fixed roots. Relative paths resolve against `base`.
    pub fn new(roots: impl IntoIterator<Item = PathBuf>, base: PathBuf) -> Self {
        let roots = roots
            .into_iter()
            .map(|root| resolve(&base, &root))
            .collect();
        Self {
            roots,
            protected: Vec::new(),
            base: Some(base),
        }
    }

    /// Refuse writes to `paths` (and anything below them) even inside a root.
    pub fn with_protected(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let base = self.base();
        self.protected
            .extend(paths.into_iter().map(|path| resolve(&base, &path)));
        self
    }

    /// Guard configured from the environment the host launched the tool with.
    ///
    /// Relative paths resolve against the working directory at check time.
    /// Without the roots variable, `disk` and `tools-src` under the working
    /// directory are allowed.
    pub fn from_env() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let roots = match std::env::var_os(SANDBOX_ROOTS_ENV) {
            Some(value) => path_list(&value),
            None => vec![cwd.join("disk"), cwd.join("tools-src")],
        };
        let protected = std::env::var_os(SANDBOX_PROTECTED_ENV)
            .map(|value| path_list(&value))
            .unwrap_or_default();
        Self {
            roots: roots.iter().map(|root| resolve(&cwd, root)).collect(),
            protected: protected.iter().map(|path| resolve(&cwd, path)).collect(),
            base: None,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn base(&self) -> PathBuf {
        match &self.base {
            Some(base) => base.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Absolute, normalized form of `path` with symlinks of its existing
    /// ancestors resolved.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve(&self.base(), path)
    }

    pub fn is_allowed(&self, path: &Path) -> bool {
        self.verdict("", path).is_ok()
    }

    fn verdict(&self, operation: &str, path: &Path) -> Result<(), Violation> {
        let resolved = self.resolve(path);
        if !self.roots.iter().any(|root| resolved.starts_with(root)) {
            return Err(Violation::outside(operation, path));
        }
        if self.protected.iter().any(|p| resolved.starts_with(p)) {
            return Err(Violation::protected(operation, path));
        }
        Ok(())
    }

    /// Check every path of one operation together.
    pub fn check(&self, operation: &str, paths: &[&Path]) -> Result<(), Violation> {
        paths
            .iter()
            .try_for_each(|path| self.verdict(operation, path))
    }
}

fn path_list(value: &std::ffi::OsStr) -> Vec<PathBuf> {
    std::env::split_paths(value)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}

/// Lexically normalize `path` against `base`, then canonicalize the longest
/// existing prefix so symlinks cannot escape a root.
fn resolve(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    let mut existing = normalized.clone();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return normalized,
        }
    }
}

/// Check `paths`, reporting and refusing when any is not writable.
pub fn enforce(
    guard: &PathGuard,
    reporter: &dyn ViolationReporter,
    operation: &str,
    paths: &[&Path],
) -> io::Result<()> {
    match guard.check(operation, paths) {
        Ok(()) => Ok(()),
        Err(violation) => {
            reporter.report(&violation);
            Err(violation.into_io_error())
        }
    }
}

fn guarded(operation: &str, paths: &[&Path]) -> io::Result<()> {
    enforce(guard(), reporter(), operation, paths)
}

/// Drop-in for `std::fs`.
pub mod fs {
    use std::io;
    use std::path::Path;

    pub use std::fs::{
        DirEntry, FileType, Metadata, Permissions, ReadDir, canonicalize, metadata, read,
        read_dir, read_link, read_to_string, symlink_metadata,
    };

    use super::guarded;

    pub fn write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> io::Result<()> {
        let path = path.as_ref();
        guarded("write", &[path])?;
        std::fs::write(path, contents)
    }

    pub fn create_dir<P: AsRef<Path>>(path: P) -> io::Result<()> {
        let path = path.as_ref();
        guarded("create_dir", &[path])?;
        std::fs::create_dir(path)
    }

    pub fn create_dir_all<P: AsRef<Path>>(path: P) -> io::Result<()> {
        let path = path.as_ref();
        guarded("create_dir_all", &[path])?;
        std::fs::create_dir_all(path)
    }

    pub fn remove_file<P: AsRef<Path>>(path: P) -> io::Result<()> {
        let path = path.as_ref();
        guarded("remove_file", &[path])?;
        std::fs::remove_file(path)
    }

    pub fn remove_dir<P: AsRef<Path>>(path: P) -> io::Result<()> {
        let path = path.as_ref();
        guarded("remove_dir", &[path])?;
        std::fs::remove_dir(path)
    }

    pub fn remove_dir_all<P: AsRef<Path>>(path: P) -> io::Result<()> {
        let path = path.as_ref();
        guarded("remove_dir_all", &[path])?;
        std::fs::remove_dir_all(path)
    }

    pub fn rename<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> io::Result<()> {
        let (from, to) = (from.as_ref(), to.as_ref());
        guarded("rename", &[from, to])?;
        std::fs::rename(from, to)
    }

    pub fn copy<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> io::Result<u64> {
        let to = to.as_ref();
        guarded("copy", &[to])?;
        std::fs::copy(from, to)
    }

    pub fn hard_link<P: AsRef<Path>, Q: AsRef<Path>>(original: P, link: Q) -> io::Result<()> {
        let (original, link) = (original.as_ref(), link.as_ref());
        guarded("hard_link", &[original, link])?;
        std::fs::hard_link(original, link)
    }

    #[cfg(unix)]
    pub fn symlink<P: AsRef<Path>, Q: AsRef<Path>>(original: P, link: Q) -> io::Result<()> {
        let (original, link) = (original.as_ref(), link.as_ref());
        guarded("symlink", &[original, link])?;
        std::os::unix::fs::symlink(original, link)
    }

    pub fn set_permissions<P: AsRef<Path>>(path: P, perm: Permissions) -> io::Result<()> {
        let path = path.as_ref();
        guarded("set_permissions", &[path])?;
        std::fs::set_permissions(path, perm)
    }

    /// An open file. Opening read-only is unrestricted.
    #[derive(Debug)]
    pub struct File(std::fs::File);

    impl File {
        pub fn open<P: AsRef<Path>>(path: P) -> io::Result<File> {
            std::fs::File::open(path).map(File)
        }

        pub fn create<P: AsRef<Path>>(path: P) -> io::Result<File> {
            let path = path.as_ref();
            guarded("create", &[path])?;
            std::fs::File::create(path).map(File)
        }

        pub fn create_new<P: AsRef<Path>>(path: P) -> io::Result<File> {
            let path = path.as_ref();
            guarded("create_new", &[path])?;
            std::fs::File::create_new(path).map(File)
        }

        pub fn options() -> OpenOptions {
            OpenOptions::new()
        }

        pub fn metadata(&self) -> io::Result<Metadata> {
            self.0.metadata()
        }

        pub fn sync_all(&self) -> io::Result<()> {
            self.0.sync_all()
        }

        pub fn set_len(&self, size: u64) -> io::Result<()> {
            self.0.set_len(size)
        }

        pub fn into_inner(self) -> std::fs::File {
            self.0
        }
    }

    impl io::Read for File {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            io::Read::read(&mut self.0, buf)
        }
    }

    impl io::Write for File {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            io::Write::write(&mut self.0, buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            io::Write::flush(&mut self.0)
        }
    }

    impl io::Seek for File {
        fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
            io::Seek::seek(&mut self.0, pos)
        }
    }

    #[derive(Debug, Clone)]
    pub struct OpenOptions {
        inner: std::fs::OpenOptions,
        mutating: bool,
    }

    impl Default for OpenOptions {
        fn default() -> Self {
            Self::new()
        }
    }

    impl OpenOptions {
        pub fn new() -> Self {
            Self {
                inner: std::fs::OpenOptions::new(),
                mutating: false,
            }
        }

        pub fn read(&mut self, read: bool) -> &mut Self {
            self.inner.read(read);
            self
        }

        pub fn write(&mut self, write: bool) -> &mut Self {
            self.mutating |= write;
            self.inner.write(write);
            self
        }

        pub fn append(&mut self, append: bool) -> &mut Self {
            self.mutating |= append;
            self.inner.append(append);
            self
        }

        pub fn truncate(&mut self, truncate: bool) -> &mut Self {
            self.mutating |= truncate;
            self.inner.truncate(truncate);
            self
        }

        pub fn create(&mut self, create: bool) -> &mut Self {
            self.mutating |= create;
            self.inner.create(create);
            self
        }

        pub fn create_new(&mut self, create_new: bool) -> &mut Self {
            self.mutating |= create_new;
            self.inner.create_new(create_new);
            self
        }

        pub fn open<P: AsRef<Path>>(&self, path: P) -> io::Result<File> {
            let path = path.as_ref();
            if self.mutating {
                guarded("open", &[path])?;
            }
            self.inner.open(path).map(File)
        }
    }
}

/// Drop-in for `std::process`. Nothing can be launched.
pub mod process {
    use std::ffi::OsStr;
    use std::io;
    use std::path::Path;

    pub use std::process::{
        Child, ExitCode, ExitStatus, Output, Stdio, abort, exit, id,
    };

    use super::{Violation, reporter};

    #[derive(Debug)]
    pub struct Command {
        program: String,
    }

    impl Command {
        pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
            Self {
                program: program.as_ref().to_string_lossy().into_owned(),
            }
        }

        pub fn arg<S: AsRef<OsStr>>(&mut self, _arg: S) -> &mut Self {
            self
        }

        pub fn args<I, S>(&mut self, _args: I) -> &mut Self
        where
            I: IntoIterator<Item = S>,
            S: AsRef<OsStr>,
        {
            self
        }

        pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(&mut self, _key: K, _val: V) -> &mut Self {
            self
        }

        pub fn envs<I, K, V>(&mut self, _vars: I) -> &mut Self
        where
            I: IntoIterator<Item = (K, V)>,
            K: AsRef<OsStr>,
            V: AsRef<OsStr>,
        {
            self
        }

        pub fn env_remove<K: AsRef<OsStr>>(&mut self, _key: K) -> &mut Self {
            self
        }

        pub fn env_clear(&mut self) -> &mut Self {
            self
        }

        pub fn current_dir<P: AsRef<Path>>(&mut self, _dir: P) -> &mut Self {
            self
        }

        pub fn stdin<T: Into<Stdio>>(&mut self, _cfg: T) -> &mut Self {
            self
        }

        pub fn stdout<T: Into<Stdio>>(&mut self, _cfg: T) -> &mut Self {
            self
        }

        pub fn stderr<T: Into<Stdio>>(&mut self, _cfg: T) -> &mut Self {
            self
        }

        pub fn get_program(&self) -> &str {
            &self.program
        }

        fn deny(&self, operation: &str) -> io::Error {
            let violation = Violation::process(operation, &self.program);
            reporter().report(&violation);
            violation.into_io_error()
        }

        pub fn spawn(&mut self) -> io::Result<Child> {
            Err(self.deny("spawn"))
        }

        pub fn output(&mut self) -> io::Result<Output> {
            Err(self.deny("output"))
        }

        pub fn status(&mut self) -> io::Result<ExitStatus> {
            Err(self.deny("status"))
        }
    }
}

/// Guarded parts of `std::env`.
pub mod env {
    use std::io;
    use std::path::Path;

    use super::guarded;

    pub fn set_current_dir<P: AsRef<Path>>(path: P) -> io::Result<()> {
        let path = path.as_ref();
        guarded("set_current_dir", &[path])?;
        std::env::set_current_dir(path)
    }
}
