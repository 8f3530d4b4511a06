/// Declares a function as `const` when `cfg(loom)` is disabled.
///
/// Loom's atomics and cells cannot be constructed in a `const` context, so
/// constructors of types built on them may only be `const fn`s when loom is
/// not in use.
#[macro_export]
macro_rules! loom_const_fn {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident($($arg:ident: $T:ty),*) -> $Ret:ty $body:block
    ) => {
        $(#[$meta])*
        #[cfg(not(loom))]
        $vis const fn $name($($arg: $T),*) -> $Ret $body

        $(#[$meta])*
        #[cfg(loom)]
        $vis fn $name($($arg: $T),*) -> $Ret $body
    }
}

/// Reports a violated invariant.
///
/// In debug builds and tests, this panics like [`debug_assert!`]. In release
/// builds, the violation is logged at the `WARN` level the first time it occurs
/// at this call site and then execution continues, so the caller must be
/// prepared to recover to a safe state.
///
/// Evaluates to `true` if the condition was violated.
#[macro_export]
macro_rules! warn_on_once {
    ($cond:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let violated = $cond;
        if violated {
            static ONCE: $crate::sync::RateLimit = $crate::sync::RateLimit::new(1);
            if ONCE.allow() {
                $crate::__tracing::warn!(
                    location = %core::panic::Location::caller(),
                    $fmt $(, $arg)*
                );
            }
            debug_assert!(!violated, $fmt $(, $arg)*);
        }
        violated
    }};
}

#[cfg(test)]
macro_rules! test_info {
    ($($arg:tt)+) => {
        tracing::trace!($($arg)+);
    };
}

#[cfg(not(test))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(test)]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                tracing::debug!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}
