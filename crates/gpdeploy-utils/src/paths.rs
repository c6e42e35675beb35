use camino::Utf8PathBuf;
use std::cell::RefCell;

// Thread-local override used only in tests to avoid process-global env races.
thread_local! {
    static THREAD_HOME: RefCell<Option<Utf8PathBuf>> = const { RefCell::new(None) };
}

/// Environment variable redirecting every transient location.
pub const TEST_TEMP_DIR_ENV: &str = "TEST_TEMP_DIR";
pub const GPDEPLOY_HOME_ENV: &str = "GPDEPLOY_HOME";

/// Resolve gpdeploy home:
/// 1) thread-local override (tests use this)
/// 2) env `TEST_TEMP_DIR` (test isolation, `<dir>/gpdeploy`)
/// 3) env `GPDEPLOY_HOME`
/// 4) `~/.gpdeploy`, or `.gpdeploy` when no home directory is known
#[must_use]
pub fn gpdeploy_home() -> Utf8PathBuf {
    if let Some(tl) = THREAD_HOME.with(|tl| tl.borrow().clone()) {
        return tl;
    }
    if let Some(p) = non_empty_env(TEST_TEMP_DIR_ENV) {
        return Utf8PathBuf::from(p).join("gpdeploy");
    }
    if let Some(p) = non_empty_env(GPDEPLOY_HOME_ENV) {
        return Utf8PathBuf::from(p);
    }
    dirs::home_dir()
        .and_then(|h| Utf8PathBuf::from_path_buf(h).ok())
        .map_or_else(|| Utf8PathBuf::from(".gpdeploy"), |h| h.join(".gpdeploy"))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Returns `<GPDEPLOY_HOME>/state`
#[must_use]
pub fn state_dir() -> Utf8PathBuf {
    gpdeploy_home().join("state")
}

/// Returns `<GPDEPLOY_HOME>/state/<coordinator>.json`
#[must_use]
pub fn state_file(coordinator: &str) -> Utf8PathBuf {
    state_dir().join(format!("{}.json", file_safe(coordinator)))
}

/// Returns `<GPDEPLOY_HOME>/locks`
#[must_use]
pub fn locks_dir() -> Utf8PathBuf {
    gpdeploy_home().join("locks")
}

/// Directory for ssh control sockets.
///
/// Unix socket paths are limited to ~104 bytes, so outside of tests this
/// lives under `/tmp` rather than the home directory.
#[must_use]
pub fn control_socket_dir() -> Utf8PathBuf {
    let redirected = THREAD_HOME.with(|tl| tl.borrow().is_some())
        || non_empty_env(TEST_TEMP_DIR_ENV).is_some();
    if redirected {
        return gpdeploy_home().join("cm");
    }
    let user = non_empty_env("USER").unwrap_or_else(|| "gpdeploy".to_string());
    Utf8PathBuf::from(format!("/tmp/gpdeploy-cm-{}", file_safe(&user)))
}

/// Local scratch directory for generated files awaiting upload.
#[must_use]
pub fn scratch_dir() -> Utf8PathBuf {
    gpdeploy_home().join("scratch")
}

/// mkdir -p; treat `AlreadyExists` as success
pub fn ensure_dir_all<P: AsRef<std::path::Path>>(p: P) -> std::io::Result<()> {
    match std::fs::create_dir_all(&p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create the control socket directory with owner-only permissions.
pub fn ensure_private_dir(p: &camino::Utf8Path) -> std::io::Result<()> {
    ensure_dir_all(p)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(p, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// RAII guard for isolated home that clears thread-local state on drop
#[cfg(any(test, feature = "test-utils"))]
pub struct HomeGuard {
    inner: tempfile::TempDir,
}

#[cfg(any(test, feature = "test-utils"))]
impl Drop for HomeGuard {
    fn drop(&mut self) {
        THREAD_HOME.with(|tl| *tl.borrow_mut() = None);
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl std::ops::Deref for HomeGuard {
    type Target = tempfile::TempDir;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Test helper: give the current thread a unique home under the system temp dir.
///
/// Hold the `HomeGuard` for the test's duration so the directory stays alive.
#[cfg(any(test, feature = "test-utils"))]
pub fn with_isolated_home() -> std::io::Result<HomeGuard> {
    let td = tempfile::TempDir::new()?;
    let p = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).map_err(|p| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("temp dir is not UTF-8: {}", p.display()),
        )
    })?;
    THREAD_HOME.with(|tl| *tl.borrow_mut() = Some(p));
    Ok(HomeGuard { inner: td })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn isolated_home_redirects_all_locations() {
        let guard = with_isolated_home().unwrap();
        let root = Utf8PathBuf::from_path_buf(guard.path().to_path_buf()).unwrap();
        assert_eq!(gpdeploy_home(), root);
        assert!(state_file("mdw").starts_with(&root));
        assert!(locks_dir().starts_with(&root));
        assert!(control_socket_dir().starts_with(&root));
        assert!(scratch_dir().starts_with(&root));
    }

    #[test]
    fn state_file_name_is_sanitized() {
        let _guard = with_isolated_home().unwrap();
        let path = state_file("fe80::1");
        assert_eq!(path.file_name(), Some("fe80__1.json"));
    }

    #[test]
    #[serial]
    fn test_temp_dir_env_overrides_home() {
        let td = tempfile::TempDir::new().unwrap();
        let dir = td.path().to_str().unwrap().to_string();
        // SAFETY: serialized with other env-mutating tests
        unsafe {
            std::env::set_var(TEST_TEMP_DIR_ENV, &dir);
        }
        let home = gpdeploy_home();
        let sockets = control_socket_dir();
        unsafe {
            std::env::remove_var(TEST_TEMP_DIR_ENV);
        }
        assert_eq!(home, Utf8PathBuf::from(dir.clone()).join("gpdeploy"));
        assert!(sockets.starts_with(&dir));
    }

    #[test]
    fn ensure_private_dir_is_idempotent() {
        let td = tempfile::TempDir::new().unwrap();
        let dir = Utf8PathBuf::from_path_buf(td.path().join("cm")).unwrap();
        ensure_private_dir(&dir).unwrap();
        ensure_private_dir(&dir).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
