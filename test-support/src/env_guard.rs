//! Scoped environment variable overrides for configuration tests.
//!
//! The process environment is global; tests using these guards must run
//! under `#[serial_test::serial]`.

use std::env;

/// Restores an environment variable to its prior state when dropped.
#[derive(Debug)]
pub struct EnvVarGuard {
    key: String,
    previous: Option<String>,
}

impl EnvVarGuard {
    /// Set `key` to `value` until the guard is dropped.
    pub fn set(key: &str, value: &str) -> Self {
        let guard = Self::capture(key);
        // SAFETY: callers run serially, so no other thread reads the
        // environment concurrently.
        unsafe { env::set_var(key, value) };
        guard
    }

    /// Unset `key` until the guard is dropped.
    pub fn remove(key: &str) -> Self {
        let guard = Self::capture(key);
        // SAFETY: see `set`.
        unsafe { env::remove_var(key) };
        guard
    }

    fn capture(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            previous: env::var(key).ok(),
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        // SAFETY: see `set`.
        match self.previous.take() {
            Some(value) => unsafe { env::set_var(&self.key, value) },
            None => unsafe { env::remove_var(&self.key) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EnvVarGuard;
    use std::env;

    #[test]
    #[serial_test::serial]
    fn set_restores_unset_variable() {
        let key = "QMAND_GUARD_SET";
        {
            let _guard = EnvVarGuard::set(key, "value");
            assert_eq!(env::var(key).as_deref(), Ok("value"));
        }
        assert!(env::var(key).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn nested_guards_unwind_in_order() {
        let key = "QMAND_GUARD_NESTED";
        let outer = EnvVarGuard::set(key, "outer");
        {
            let _inner = EnvVarGuard::set(key, "inner");
            assert_eq!(env::var(key).as_deref(), Ok("inner"));
            {
                let _removed = EnvVarGuard::remove(key);
                assert!(env::var(key).is_err());
            }
            assert_eq!(env::var(key).as_deref(), Ok("inner"));
        }
        assert_eq!(env::var(key).as_deref(), Ok("outer"));
        drop(outer);
        assert!(env::var(key).is_err());
    }
}
